//! BIOS and MS-DOS service layer (spec.md §4.F). `INT n` is short-circuited
//! here instead of running a guest-resident handler through the vector
//! table; a handled subfunction signals failure the way real firmware does
//! (`CF=1, AH/AX=code`), never as an `Err` — only a vector or subfunction
//! this layer has no entry for surfaces `UnhandledInterrupt` (spec.md §7).

use crate::error::{EmulatorError, Result};
use crate::fields::{Reg16, Reg8};
use crate::machine::Machine;
use crate::memory::Memory;
use crate::video::VideoBuffer;
use log::warn;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

pub fn dispatch(machine: &mut Machine, vector: u8) -> Result<()> {
    match vector {
        0x10 => bios_video(machine),
        0x13 => bios_disk(machine),
        0x16 => bios_keyboard(machine),
        0x17 => bios_printer(machine),
        0x19 => bios_reboot(machine),
        0x20 => dos_exit(machine),
        0x21 => dos_services(machine),
        _ => {
            warn!("unhandled interrupt vector {:#04x}", vector);
            Err(EmulatorError::UnhandledInterrupt { vector, subfunction: None })
        }
    }
}

fn bios_video(machine: &mut Machine) -> Result<()> {
    let ah = machine.registers.get8(Reg8::AH);
    match ah {
        0x02 => {
            let row = machine.registers.get8(Reg8::DH);
            let column = machine.registers.get8(Reg8::DL);
            VideoBuffer::move_cursor(&mut machine.cursor, row, column);
            Ok(())
        }
        0x03 => {
            machine.registers.set8(Reg8::DH, machine.cursor.row);
            machine.registers.set8(Reg8::DL, machine.cursor.column);
            machine.registers.set16(Reg16::CX, 0);
            machine.registers.set16(Reg16::AX, 0);
            Ok(())
        }
        0x06 => {
            let lines = machine.registers.get8(Reg8::BL);
            let attribute = machine.registers.get8(Reg8::BH);
            VideoBuffer::scroll(&mut machine.memory, lines, attribute)
        }
        0x0E => {
            let c = machine.registers.get8(Reg8::AL);
            VideoBuffer::write_char(&mut machine.memory, &mut machine.cursor, 0x07, c)
        }
        other => {
            warn!("unhandled INT 10h AH={:#04x}", other);
            Err(EmulatorError::UnhandledInterrupt { vector: 0x10, subfunction: Some(other) })
        }
    }
}

fn bios_disk(machine: &mut Machine) -> Result<()> {
    let ah = machine.registers.get8(Reg8::AH);
    match ah {
        0x00 => {
            machine.registers.set8(Reg8::AH, 0);
            machine.flags.cf = false;
            Ok(())
        }
        0x02 => {
            let drive = machine.registers.get8(Reg8::DL);
            if drive != 0 {
                machine.registers.set8(Reg8::AH, 0xAA);
                machine.flags.cf = true;
                return Ok(());
            }
            let sectors = machine.registers.get8(Reg8::AL);
            let cylinder = machine.registers.get8(Reg8::CH);
            let sector = machine.registers.get8(Reg8::CL);
            let head = machine.registers.get8(Reg8::DH);
            let es = machine.registers.get16(Reg16::ES);
            let bx = machine.registers.get16(Reg16::BX);

            let geometry = match machine.floppy.as_ref() {
                Some(floppy) => floppy.geometry(),
                None => {
                    machine.registers.set8(Reg8::AH, 0x40);
                    machine.flags.cf = true;
                    return Ok(());
                }
            };
            let bytes = sectors as usize * geometry.bytes_per_sector as usize;
            let read_result = match machine.memory.slice_mut(es, bx, bytes) {
                Ok(dst) => machine.floppy.as_mut().unwrap().read_chs(
                    cylinder as u32,
                    head as u32,
                    sector as u32,
                    sectors as u32,
                    dst,
                ),
                Err(e) => Err(e),
            };
            match read_result {
                Ok(()) => {
                    machine.registers.set8(Reg8::AH, 0);
                    machine.flags.cf = false;
                }
                Err(e) => {
                    warn!("floppy read failed: {e}");
                    machine.registers.set8(Reg8::AH, 0x40);
                    machine.flags.cf = true;
                }
            }
            Ok(())
        }
        other => Err(EmulatorError::UnhandledInterrupt { vector: 0x13, subfunction: Some(other) }),
    }
}

fn bios_keyboard(machine: &mut Machine) -> Result<()> {
    let ah = machine.registers.get8(Reg8::AH);
    match ah {
        0x00 => {
            let c = machine.console.read_char()?;
            machine.registers.set8(Reg8::AL, c);
            machine.registers.set8(Reg8::AH, 0);
            Ok(())
        }
        other => Err(EmulatorError::UnhandledInterrupt { vector: 0x16, subfunction: Some(other) }),
    }
}

fn bios_printer(machine: &mut Machine) -> Result<()> {
    let ah = machine.registers.get8(Reg8::AH);
    if ah == 0x00 {
        machine.registers.set8(Reg8::AH, 0x30);
        Ok(())
    } else {
        Err(EmulatorError::UnhandledInterrupt { vector: 0x17, subfunction: Some(ah) })
    }
}

fn bios_reboot(machine: &mut Machine) -> Result<()> {
    machine.stop();
    Ok(())
}

fn dos_exit(machine: &mut Machine) -> Result<()> {
    machine.dos.exit_code = Some(0);
    machine.stop();
    Ok(())
}

fn dos_services(machine: &mut Machine) -> Result<()> {
    let ah = machine.registers.get8(Reg8::AH);
    match ah {
        0x02 => {
            let c = machine.registers.get8(Reg8::DL);
            VideoBuffer::write_char(&mut machine.memory, &mut machine.cursor, 0x07, c)
        }
        0x06 | 0x07 => {
            let c = machine.console.read_char()?;
            machine.registers.set8(Reg8::AL, c);
            machine.flags.zf = false;
            Ok(())
        }
        0x09 => {
            let ds = machine.registers.get16(Reg16::DS);
            let mut offset = machine.registers.get16(Reg16::DX);
            loop {
                let byte = machine.memory.read8(ds, offset)?;
                if byte == b'$' {
                    break;
                }
                VideoBuffer::write_char(&mut machine.memory, &mut machine.cursor, 0x07, byte)?;
                offset = offset.wrapping_add(1);
            }
            Ok(())
        }
        0x0B => {
            let available = machine.console.char_available();
            machine.registers.set8(Reg8::AL, if available { 1 } else { 0 });
            Ok(())
        }
        0x19 => {
            machine.registers.set8(Reg8::AL, 0);
            Ok(())
        }
        0x30 => {
            machine.registers.set8(Reg8::AL, 5);
            machine.registers.set8(Reg8::AH, 0);
            Ok(())
        }
        0x3D => {
            let ds = machine.registers.get16(Reg16::DS);
            let dx = machine.registers.get16(Reg16::DX);
            let path = read_cstring(&machine.memory, ds, dx)?.replace('\\', "/");
            match machine.dos.open(&path) {
                Ok(handle) => {
                    machine.registers.set16(Reg16::AX, handle);
                    machine.flags.cf = false;
                }
                Err(e) => {
                    warn!("open {path:?} failed: {e}");
                    machine.registers.set16(Reg16::AX, 1);
                    machine.flags.cf = true;
                }
            }
            Ok(())
        }
        0x3F => {
            let handle = machine.registers.get16(Reg16::BX);
            let count = machine.registers.get16(Reg16::CX);
            let ds = machine.registers.get16(Reg16::DS);
            let dx = machine.registers.get16(Reg16::DX);
            let mut buf = vec![0u8; count as usize];
            match machine.dos.read(handle, &mut buf) {
                Ok(n) => {
                    let dst = machine.memory.slice_mut(ds, dx, n)?;
                    dst.copy_from_slice(&buf[..n]);
                    machine.registers.set16(Reg16::AX, n as u16);
                    machine.flags.cf = false;
                }
                Err(e) => {
                    warn!("read from handle {handle} failed: {e}");
                    machine.registers.set16(Reg16::AX, 5);
                    machine.flags.cf = true;
                }
            }
            Ok(())
        }
        0x42 => {
            let handle = machine.registers.get16(Reg16::BX);
            let origin = machine.registers.get8(Reg8::AL);
            let cx = machine.registers.get16(Reg16::CX);
            let dx = machine.registers.get16(Reg16::DX);
            let raw = ((cx as u32) << 16) | dx as u32;
            let offset = raw as i32 as i64;
            match machine.dos.seek(handle, origin, offset) {
                Ok(pos) => {
                    machine.registers.set16(Reg16::CX, (pos >> 16) as u16);
                    machine.registers.set16(Reg16::DX, pos as u16);
                    machine.flags.cf = false;
                }
                Err(e) => {
                    warn!("seek on handle {handle} failed: {e}");
                    machine.flags.cf = true;
                }
            }
            Ok(())
        }
        0x4C => {
            let code = machine.registers.get8(Reg8::AL);
            machine.dos.exit_code = Some(code);
            machine.stop();
            Ok(())
        }
        0x50 => Ok(()),
        other => Err(EmulatorError::UnhandledInterrupt { vector: 0x21, subfunction: Some(other) }),
    }
}

fn read_cstring(memory: &Memory, segment: u16, offset: u16) -> Result<String> {
    let mut bytes = Vec::new();
    let mut offset = offset;
    loop {
        let b = memory.read8(segment, offset)?;
        if b == 0 {
            break;
        }
        bytes.push(b);
        offset = offset.wrapping_add(1);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// The DOS file table (spec.md §3): 16-bit handles allocated densely from
/// zero, mapped to host files opened read-only.
#[derive(Default)]
pub struct DosState {
    pub simulate_msdos: bool,
    pub exit_code: Option<u8>,
    files: BTreeMap<u16, File>,
}

impl DosState {
    pub fn open(&mut self, path: &str) -> Result<u16> {
        let file = File::open(path)?;
        let handle = (0..0xFFFEu16)
            .find(|h| !self.files.contains_key(h))
            .ok_or_else(|| EmulatorError::IoFailure("no free file handles".to_string()))?;
        self.files.insert(handle, file);
        Ok(handle)
    }

    pub fn read(&mut self, handle: u16, buf: &mut [u8]) -> Result<usize> {
        let file = self
            .files
            .get_mut(&handle)
            .ok_or_else(|| EmulatorError::IoFailure(format!("bad file handle {handle}")))?;
        Ok(file.read(buf)?)
    }

    pub fn seek(&mut self, handle: u16, origin: u8, offset: i64) -> Result<u64> {
        let file = self
            .files
            .get_mut(&handle)
            .ok_or_else(|| EmulatorError::IoFailure(format!("bad file handle {handle}")))?;
        let from = match origin {
            0 => SeekFrom::Start(offset as u64),
            1 => SeekFrom::Current(offset),
            2 => SeekFrom::End(offset),
            _ => return Err(EmulatorError::IoFailure(format!("bad seek origin {origin}"))),
        };
        Ok(file.seek(from)?)
    }
}
