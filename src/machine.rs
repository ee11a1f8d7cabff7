//! Machine lifecycle (spec.md §4.I, §9): a single owner for every piece of
//! architectural and host-collaborator state, replacing the source's
//! `Machine → CPU → Machine` reference cycle. `engine::step` and
//! `interrupts::dispatch` both take `&mut Machine` rather than holding a
//! back-reference to it.

use crate::engine;
use crate::error::Result;
use crate::fields::Reg16;
use crate::floppy::Floppy;
use crate::interrupts::DosState;
use crate::memory::Memory;
use crate::registers::{CallbackRegistry, Flags, Registers, RunState};
use crate::video::{ConsoleBridge, Cursor};
use log::debug;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Nominal clock rate used to pace `run` (spec.md §4.E); timing is
/// best-effort, not a contract.
const NOMINAL_CLOCK_HZ: f64 = 5_000_000.0;

pub struct Machine {
    pub registers: Registers,
    pub flags: Flags,
    pub memory: Memory,
    pub run_state: RunState,
    pub callbacks: CallbackRegistry,
    pub breakpoints: HashSet<(u16, u16)>,
    last_breakpoint_hit: Option<(u16, u16)>,
    pub floppy: Option<Floppy>,
    pub cursor: Cursor,
    pub console: ConsoleBridge,
    pub dos: DosState,
}

/// What to load before the first tick: a floppy image to boot from its boot
/// sector, or a `.COM` program plus its command tail (spec.md §4.I).
pub enum BootTarget {
    Floppy(std::path::PathBuf),
    Com { path: std::path::PathBuf, cmdline: String },
}

impl Machine {
    pub fn boot(target: BootTarget) -> Result<Self> {
        match target {
            BootTarget::Floppy(path) => Machine::boot_floppy(&path),
            BootTarget::Com { path, cmdline } => Machine::boot_com(&path, &cmdline),
        }
    }

    pub fn new() -> Self {
        Machine {
            registers: Registers::default(),
            flags: Flags::default(),
            memory: Memory::new(),
            run_state: RunState::Stopped,
            callbacks: CallbackRegistry::new(),
            breakpoints: HashSet::new(),
            last_breakpoint_hit: None,
            floppy: None,
            cursor: Cursor::default(),
            console: ConsoleBridge::new(),
            dos: DosState::default(),
        }
    }

    /// Copy the floppy's boot sector to `0000:7C00`, arm `CS:IP`, and start
    /// running (spec.md §4.I, seed scenario 1).
    pub fn boot_floppy(path: &Path) -> Result<Self> {
        let mut floppy = Floppy::insert(path)?;
        let boot_sector = floppy.read_boot_sector()?;
        let mut machine = Machine::new();
        machine.memory.slice_mut(0x0000, 0x7C00, 512)?.copy_from_slice(&boot_sector);
        machine.registers.cs = 0;
        machine.registers.ip = 0x7C00;
        machine.floppy = Some(floppy);
        machine.transition(RunState::Running);
        Ok(machine)
    }

    /// Load a `.COM` program at `0000:0100`, build its PSP command tail, and
    /// start running (spec.md §4.I, seed scenarios 2-5).
    pub fn boot_com(path: &Path, cmdline: &str) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut machine = Machine::new();
        machine.memory.slice_mut(0x0000, 0x0100, bytes.len())?.copy_from_slice(&bytes);
        machine.registers.ip = 0x0100;
        machine.dos.simulate_msdos = true;
        machine.init_psp(cmdline)?;
        machine.transition(RunState::Running);
        Ok(machine)
    }

    fn init_psp(&mut self, cmdline: &str) -> Result<()> {
        let tail = cmdline.as_bytes();
        let len = tail.len().min(126) as u8;
        self.memory.write8(0x0000, 0x0080, len)?;
        if len > 0 {
            self.memory.slice_mut(0x0000, 0x0081, len as usize)?.copy_from_slice(&tail[..len as usize]);
        }
        self.memory.write8(0x0000, 0x0081u16.wrapping_add(len as u16), 0x0D)?;
        Ok(())
    }

    fn transition(&mut self, state: RunState) {
        debug!("machine {:?} -> {:?}", self.run_state, state);
        self.run_state = state;
        self.callbacks.notify(state);
    }

    pub fn stop(&mut self) {
        self.transition(RunState::Stopped);
        self.console.close();
    }

    pub fn pause(&mut self) {
        if self.run_state == RunState::Running {
            self.transition(RunState::Paused);
        }
    }

    pub fn resume(&mut self) {
        if self.run_state == RunState::Paused {
            self.transition(RunState::Running);
        }
    }

    /// One fetch-decode-execute iteration (spec.md §4.E). A no-op when not
    /// `Running`.
    pub fn tick(&mut self) -> Result<()> {
        if self.run_state != RunState::Running {
            return Ok(());
        }
        self.registers.last_cs = self.registers.cs;
        self.registers.last_ip = self.registers.ip;

        let position = (self.registers.cs, self.registers.ip);
        if self.breakpoints.contains(&position) && self.last_breakpoint_hit != Some(position) {
            self.last_breakpoint_hit = Some(position);
            self.transition(RunState::Paused);
            return Ok(());
        }
        self.last_breakpoint_hit = None;

        match engine::step(self) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.transition(RunState::Stopped);
                Err(e)
            }
        }
    }

    /// Run until `Stopped`, cooperatively spinning while `Paused` (spec.md
    /// §5). Front-end threads drive `pause`/`resume`/`stop` concurrently.
    pub fn run(&mut self) -> Result<()> {
        let period = Duration::from_secs_f64(1.0 / NOMINAL_CLOCK_HZ);
        while self.run_state != RunState::Stopped {
            if self.run_state == RunState::Paused {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            self.tick()?;
            std::thread::sleep(period);
        }
        Ok(())
    }

    pub fn exit_code(&self) -> Option<u8> {
        self.dos.exit_code
    }

    pub fn subscribe(&mut self, callback: Box<dyn FnMut(RunState) + Send>) -> crate::registers::SubscriptionToken {
        self.callbacks.subscribe(callback)
    }

    pub fn cs_ip(&self) -> (u16, u16) {
        (self.registers.get16(Reg16::CS), self.registers.get16(Reg16::IP))
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn com_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn boot_com_loads_at_0100_and_starts_running() {
        let f = com_file(&[0xF4]); // HLT
        let machine = Machine::boot_com(f.path(), "").unwrap();
        assert_eq!(machine.registers.ip, 0x0100);
        assert_eq!(machine.run_state, RunState::Running);
        assert_eq!(machine.memory.read8(0, 0x0100).unwrap(), 0xF4);
    }

    #[test]
    fn psp_command_tail_is_length_prefixed_and_terminated() {
        let f = com_file(&[0xF4]);
        let machine = Machine::boot_com(f.path(), "AB").unwrap();
        assert_eq!(machine.memory.read8(0, 0x0080).unwrap(), 2);
        assert_eq!(machine.memory.read8(0, 0x0081).unwrap(), b'A');
        assert_eq!(machine.memory.read8(0, 0x0082).unwrap(), b'B');
        assert_eq!(machine.memory.read8(0, 0x0083).unwrap(), 0x0D);
    }

    #[test]
    fn hlt_stops_the_machine_after_one_tick() {
        let f = com_file(&[0xF4]);
        let mut machine = Machine::boot_com(f.path(), "").unwrap();
        machine.tick().unwrap();
        assert_eq!(machine.run_state, RunState::Stopped);
    }

    #[test]
    fn pause_then_resume_does_not_lose_run_state() {
        let f = com_file(&[0x90, 0xF4]); // NOP; HLT
        let mut machine = Machine::boot_com(f.path(), "").unwrap();
        machine.pause();
        assert_eq!(machine.run_state, RunState::Paused);
        machine.tick().unwrap(); // no-op while paused
        assert_eq!(machine.registers.ip, 0x0100);
        machine.resume();
        machine.tick().unwrap();
        assert_eq!(machine.registers.ip, 0x0101);
    }
}
