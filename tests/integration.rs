//! End-to-end scenarios driven through `Machine` exactly as a real `.COM`
//! program or floppy image would be (spec.md §8, "seed end-to-end
//! scenarios").

use em8086::fields::{Reg16, Reg8};
use em8086::floppy::Floppy;
use em8086::interrupts;
use em8086::machine::Machine;
use em8086::registers::RunState;
use em8086::video::{VIDEO_OFFSET, VIDEO_SEGMENT};
use std::io::Write;

fn com_file(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(bytes).unwrap();
    f.flush().unwrap();
    f
}

fn floppy_image(size: usize, patch: impl FnOnce(&mut [u8])) -> tempfile::NamedTempFile {
    let mut bytes = vec![0u8; size];
    patch(&mut bytes);
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&bytes).unwrap();
    f.flush().unwrap();
    f
}

fn run_to_completion(machine: &mut Machine) {
    for _ in 0..10_000 {
        if machine.run_state != RunState::Running {
            return;
        }
        machine.tick().unwrap();
    }
    panic!("program did not stop within 10,000 ticks");
}

#[test]
fn boot_signature_loads_the_boot_sector_and_starts_running() {
    let image = floppy_image(368_640, |bytes| {
        bytes[0] = 0xEB; // arbitrary boot-sector byte to compare against
        bytes[510] = 0x55;
        bytes[511] = 0xAA;
    });

    let mut floppy = Floppy::insert(image.path()).unwrap();
    assert!(floppy.is_bootable().unwrap());
    let boot_sector = floppy.read_boot_sector().unwrap();

    let machine = Machine::boot_floppy(image.path()).unwrap();
    assert_eq!(machine.registers.cs, 0);
    assert_eq!(machine.registers.ip, 0x7C00);
    assert_eq!(machine.run_state, RunState::Running);
    for i in 0..512u16 {
        assert_eq!(machine.memory.read8(0x0000, 0x7C00 + i).unwrap(), boot_sector[i as usize]);
    }
}

#[test]
fn text_output_via_bios_writes_the_video_cell_and_advances_the_cursor() {
    // MOV AH,0Eh; MOV AL,'A'; INT 10h; INT 20h
    let f = com_file(&[0xB4, 0x0E, 0xB0, 0x41, 0xCD, 0x10, 0xCD, 0x20]);
    let mut machine = Machine::boot_com(f.path(), "").unwrap();
    run_to_completion(&mut machine);

    assert_eq!(machine.cursor.row, 0);
    assert_eq!(machine.cursor.column, 1);
    assert_eq!(machine.memory.read8(VIDEO_SEGMENT, VIDEO_OFFSET).unwrap(), 0x41);
    assert_eq!(machine.run_state, RunState::Stopped);
}

#[test]
fn text_output_via_dos_prints_up_to_the_dollar_terminator() {
    // MOV DX,0109h; MOV AH,09h; INT 21h; INT 20h, then "HI$" at file offset 9 (= 0000:0109).
    let f = com_file(&[0xBA, 0x09, 0x01, 0xB4, 0x09, 0xCD, 0x21, 0xCD, 0x20, b'H', b'I', b'$']);
    let mut machine = Machine::boot_com(f.path(), "").unwrap();
    run_to_completion(&mut machine);

    assert_eq!(machine.cursor.column, 2);
    assert_eq!(machine.memory.read8(VIDEO_SEGMENT, VIDEO_OFFSET).unwrap(), b'H');
    assert_eq!(machine.memory.read8(VIDEO_SEGMENT, VIDEO_OFFSET + 2).unwrap(), b'I');
    assert_eq!(machine.run_state, RunState::Stopped);
}

#[test]
fn add_ff_plus_one_sets_carry_zero_and_clears_overflow() {
    // MOV AL,FFh; ADD AL,01h; HLT
    let f = com_file(&[0xB0, 0xFF, 0x04, 0x01, 0xF4]);
    let mut machine = Machine::boot_com(f.path(), "").unwrap();
    run_to_completion(&mut machine);

    assert_eq!(machine.registers.get8(Reg8::AL), 0);
    assert!(machine.flags.zf);
    assert!(machine.flags.cf);
    assert!(!machine.flags.of);
    assert!(!machine.flags.sf);
    assert!(machine.flags.pf);
    assert_eq!(machine.run_state, RunState::Stopped);
}

#[test]
fn rep_movsb_copies_five_bytes_and_advances_both_pointers() {
    let mut machine = Machine::new();
    for (i, b) in [1u8, 2, 3, 4, 5].into_iter().enumerate() {
        machine.memory.write8(0, 0x1000 + i as u16, *b).unwrap();
    }
    machine.registers.set16(Reg16::SI, 0x1000);
    machine.registers.set16(Reg16::DI, 0x2000);
    machine.registers.set16(Reg16::CX, 5);
    machine.memory.slice_mut(0, 0, 2).unwrap().copy_from_slice(&[0xF3, 0xA4]); // REP MOVSB
    machine.run_state = RunState::Running;
    machine.tick().unwrap();

    for i in 0..5u16 {
        assert_eq!(machine.memory.read8(0, 0x2000 + i).unwrap(), i as u8 + 1);
    }
    assert_eq!(machine.registers.cx, 0);
    assert_eq!(machine.registers.si, 0x1005);
    assert_eq!(machine.registers.di, 0x2005);
}

#[test]
fn disk_read_via_bios_copies_the_requested_sector_into_guest_memory() {
    let image = floppy_image(368_640, |bytes| {
        // linear sector 1 (cyl 0, head 0, sector 2) starts at byte offset 512.
        bytes[512..512 + 4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    });

    let mut machine = Machine::new();
    machine.floppy = Some(Floppy::insert(image.path()).unwrap());
    machine.registers.set8(Reg8::AH, 0x02);
    machine.registers.set8(Reg8::AL, 1);
    machine.registers.set8(Reg8::CH, 0);
    machine.registers.set8(Reg8::CL, 2);
    machine.registers.set8(Reg8::DH, 0);
    machine.registers.set8(Reg8::DL, 0);
    machine.registers.set16(Reg16::ES, 0);
    machine.registers.set16(Reg16::BX, 0x3000);

    interrupts::dispatch(&mut machine, 0x13).unwrap();

    assert_eq!(machine.registers.get8(Reg8::AH), 0);
    assert!(!machine.flags.cf);
    assert_eq!(machine.memory.read8(0, 0x3000).unwrap(), 0xDE);
    assert_eq!(machine.memory.read8(0, 0x3001).unwrap(), 0xAD);
    assert_eq!(machine.memory.read8(0, 0x3002).unwrap(), 0xBE);
    assert_eq!(machine.memory.read8(0, 0x3003).unwrap(), 0xEF);
}
