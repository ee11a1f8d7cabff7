// Architectural state (spec.md §3, §4.D): the 14 registers and 8 flags,
// aliasing between wide and byte views, run-state transitions, and the
// opaque-token subscriber registry that replaces the source's
// address-of-function callback trick.

use crate::fields::{Condition, Reg16, Reg8};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub ax: u16,
    pub bx: u16,
    pub cx: u16,
    pub dx: u16,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub ss: u16,
    pub ip: u16,
    pub bp: u16,
    pub sp: u16,
    pub si: u16,
    pub di: u16,
    /// Snapshot of `(CS, IP)` at the start of the instruction currently
    /// executing; used only for diagnostics.
    pub last_cs: u16,
    pub last_ip: u16,
}

impl Registers {
    pub fn get8(&self, reg: Reg8) -> u8 {
        match reg {
            Reg8::AL => self.ax as u8,
            Reg8::AH => (self.ax >> 8) as u8,
            Reg8::BL => self.bx as u8,
            Reg8::BH => (self.bx >> 8) as u8,
            Reg8::CL => self.cx as u8,
            Reg8::CH => (self.cx >> 8) as u8,
            Reg8::DL => self.dx as u8,
            Reg8::DH => (self.dx >> 8) as u8,
        }
    }

    pub fn set8(&mut self, reg: Reg8, value: u8) {
        let wide = match reg {
            Reg8::AL | Reg8::AH => &mut self.ax,
            Reg8::BL | Reg8::BH => &mut self.bx,
            Reg8::CL | Reg8::CH => &mut self.cx,
            Reg8::DL | Reg8::DH => &mut self.dx,
        };
        *wide = match reg {
            Reg8::AL | Reg8::BL | Reg8::CL | Reg8::DL => (*wide & 0xFF00) | value as u16,
            Reg8::AH | Reg8::BH | Reg8::CH | Reg8::DH => (*wide & 0x00FF) | ((value as u16) << 8),
        };
    }

    pub fn get16(&self, reg: Reg16) -> u16 {
        match reg {
            Reg16::AX => self.ax,
            Reg16::BX => self.bx,
            Reg16::CX => self.cx,
            Reg16::DX => self.dx,
            Reg16::CS => self.cs,
            Reg16::DS => self.ds,
            Reg16::ES => self.es,
            Reg16::SS => self.ss,
            Reg16::IP => self.ip,
            Reg16::BP => self.bp,
            Reg16::SP => self.sp,
            Reg16::SI => self.si,
            Reg16::DI => self.di,
        }
    }

    pub fn set16(&mut self, reg: Reg16, value: u16) {
        let slot = match reg {
            Reg16::AX => &mut self.ax,
            Reg16::BX => &mut self.bx,
            Reg16::CX => &mut self.cx,
            Reg16::DX => &mut self.dx,
            Reg16::CS => &mut self.cs,
            Reg16::DS => &mut self.ds,
            Reg16::ES => &mut self.es,
            Reg16::SS => &mut self.ss,
            Reg16::IP => &mut self.ip,
            Reg16::BP => &mut self.bp,
            Reg16::SP => &mut self.sp,
            Reg16::SI => &mut self.si,
            Reg16::DI => &mut self.di,
        };
        *slot = value;
    }
}

/// The eight status flags (spec.md §3); the trap flag is modeled by the
/// source but never consumed, so it is not carried here.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub cf: bool,
    pub pf: bool,
    pub af: bool,
    pub zf: bool,
    pub sf: bool,
    pub i_f: bool,
    pub df: bool,
    pub of: bool,
}

impl Flags {
    /// Encode as `PUSHF` would lay the bits out (spec.md §4.E).
    pub fn to_u16(self) -> u16 {
        let mut v = 0u16;
        v |= (self.cf as u16) << 0;
        v |= 1 << 1;
        v |= (self.pf as u16) << 2;
        v |= (self.af as u16) << 4;
        v |= (self.zf as u16) << 6;
        v |= (self.sf as u16) << 7;
        v |= (self.i_f as u16) << 9;
        v |= (self.df as u16) << 10;
        v |= (self.of as u16) << 11;
        v |= 1 << 14;
        v |= 1 << 15;
        v
    }

    /// Decode bits laid out as `PUSHF` would produce them, as `POPF` does.
    pub fn from_u16(v: u16) -> Self {
        Flags {
            cf: v & (1 << 0) != 0,
            pf: v & (1 << 2) != 0,
            af: v & (1 << 4) != 0,
            zf: v & (1 << 6) != 0,
            sf: v & (1 << 7) != 0,
            i_f: v & (1 << 9) != 0,
            df: v & (1 << 10) != 0,
            of: v & (1 << 11) != 0,
        }
    }

    /// Evaluate a `Jcc` predicate. `Condition::Cxz` is not a flag test (it
    /// reads `CX`); callers must special-case it before reaching here.
    pub fn test(&self, cond: Condition) -> bool {
        match cond {
            Condition::Z => self.zf,
            Condition::NZ => !self.zf,
            Condition::B => self.cf,
            Condition::NB => !self.cf,
            Condition::BE => self.cf || self.zf,
            Condition::A => !self.cf && !self.zf,
            Condition::S => self.sf,
            Condition::NS => !self.sf,
            Condition::O => self.of,
            Condition::NO => !self.of,
            Condition::L => self.sf != self.of,
            Condition::GE => self.sf == self.of,
            Condition::LE => self.zf || (self.sf != self.of),
            Condition::G => !self.zf && (self.sf == self.of),
            Condition::PE => self.pf,
            Condition::PO => !self.pf,
            Condition::Cxz => unreachable!("JCXZ is evaluated against CX, not flags"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
    Paused,
}

/// Opaque handle returned by `CallbackRegistry::subscribe`, used only to
/// unsubscribe; it carries no other meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// Fan-out for run-state transitions (spec.md §4.D, §5). Identifies
/// subscribers by an opaque token handed back at registration time rather
/// than by callback identity, since Rust closures have none to speak of.
#[derive(Default)]
pub struct CallbackRegistry {
    next_token: u64,
    subscribers: Vec<(SubscriptionToken, Box<dyn FnMut(RunState) + Send>)>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callback: Box<dyn FnMut(RunState) + Send>) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token);
        self.next_token += 1;
        self.subscribers.push((token, callback));
        token
    }

    pub fn unsubscribe(&mut self, token: SubscriptionToken) {
        self.subscribers.retain(|(t, _)| *t != token);
    }

    pub fn notify(&mut self, state: RunState) {
        for (_, callback) in self.subscribers.iter_mut() {
            callback(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_views_alias_the_wide_register() {
        let mut r = Registers::default();
        r.set16(Reg16::AX, 0x1234);
        assert_eq!(r.get8(Reg8::AH), 0x12);
        assert_eq!(r.get8(Reg8::AL), 0x34);
        r.set8(Reg8::AL, 0xFF);
        assert_eq!(r.get16(Reg16::AX), 0x12FF);
        r.set8(Reg8::AH, 0x00);
        assert_eq!(r.get16(Reg16::AX), 0x00FF);
    }

    #[test]
    fn pushf_popf_round_trips() {
        let flags = Flags { cf: true, pf: false, af: true, zf: true, sf: false, i_f: true, df: false, of: true };
        let encoded = flags.to_u16();
        assert_eq!(encoded & (1 << 1), 1 << 1);
        assert_eq!(encoded & (1 << 14), 1 << 14);
        assert_eq!(Flags::from_u16(encoded), flags);
    }

    #[test]
    fn jle_is_zf_or_sign_overflow_mismatch() {
        let mut flags = Flags::default();
        assert!(!flags.test(Condition::LE));
        flags.zf = true;
        assert!(flags.test(Condition::LE));
        flags.zf = false;
        flags.sf = true;
        assert!(flags.test(Condition::LE));
        flags.of = true;
        assert!(!flags.test(Condition::LE));
    }

    #[test]
    fn unsubscribe_stops_future_notifications() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = CallbackRegistry::new();
        let c = counter.clone();
        let token = registry.subscribe(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        registry.notify(RunState::Running);
        registry.unsubscribe(token);
        registry.notify(RunState::Stopped);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
