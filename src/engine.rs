//! Execution engine (spec.md §4.E): the fetch-decode-execute loop and the
//! per-mnemonic `match` that applies a decoded instruction to architectural
//! state. Flag-update rules, stack operations, jump/call/ret semantics and
//! string-instruction repeat handling all live here; `interrupts::dispatch`
//! is the only other module `execute` calls into.

use crate::decoder;
use crate::error::{EmulatorError, Result};
use crate::fields::{BaseIndex, Condition, EffectiveAddress, Parameter, Reg8, Size};
use crate::instructions::{Instruction, Mnemonic, RepeatMode, SegmentPrefix};
use crate::interrupts;
use crate::machine::Machine;
use crate::registers::Flags;

/// Fetch one instruction at `CS:IP`, advance `IP` past it, and execute it.
pub fn step(machine: &mut Machine) -> Result<()> {
    let cs = machine.registers.cs;
    let start_ip = machine.registers.ip;
    let mut ip = start_ip;
    let instruction = {
        let memory = &machine.memory;
        decoder::decode(
            || {
                let b = memory.read8(cs, ip)?;
                ip = ip.wrapping_add(1);
                Ok(b)
            },
            cs,
            start_ip,
        )?
    };
    machine.registers.ip = ip;
    execute(machine, &instruction)
}

fn resolve_segment(machine: &Machine, addr: &EffectiveAddress, over: SegmentPrefix) -> u16 {
    match over {
        SegmentPrefix::ES => return machine.registers.es,
        SegmentPrefix::CS => return machine.registers.cs,
        SegmentPrefix::SS => return machine.registers.ss,
        SegmentPrefix::DS => return machine.registers.ds,
        SegmentPrefix::None => {}
    }
    match addr {
        EffectiveAddress::BaseIndex(base, _) if base.uses_bp() => machine.registers.ss,
        _ => machine.registers.ds,
    }
}

fn effective_offset(machine: &Machine, addr: &EffectiveAddress) -> u16 {
    match addr {
        EffectiveAddress::Direct(offset) => *offset,
        EffectiveAddress::BaseIndex(base, disp) => {
            let base_value = match base {
                BaseIndex::BxSi => machine.registers.bx.wrapping_add(machine.registers.si),
                BaseIndex::BxDi => machine.registers.bx.wrapping_add(machine.registers.di),
                BaseIndex::BpSi => machine.registers.bp.wrapping_add(machine.registers.si),
                BaseIndex::BpDi => machine.registers.bp.wrapping_add(machine.registers.di),
                BaseIndex::Si => machine.registers.si,
                BaseIndex::Di => machine.registers.di,
                BaseIndex::Bp => machine.registers.bp,
                BaseIndex::Bx => machine.registers.bx,
            };
            base_value.wrapping_add(disp.value() as u16)
        }
    }
}

fn read_param(machine: &mut Machine, over: SegmentPrefix, p: Parameter) -> Result<u32> {
    Ok(match p {
        Parameter::Reg8(r) => machine.registers.get8(r) as u32,
        Parameter::Reg16(r) => machine.registers.get16(r) as u32,
        Parameter::Imm8(v) => v as u32,
        Parameter::Imm16(v) => v as u32,
        Parameter::Implied(v) => v as u32,
        Parameter::Mem { addr, size } => {
            let seg = resolve_segment(machine, &addr, over);
            let off = effective_offset(machine, &addr);
            match size {
                Size::Byte => machine.memory.read8(seg, off)? as u32,
                Size::Word => machine.memory.read16(seg, off)? as u32,
            }
        }
        Parameter::RelByte(_) | Parameter::RelWord(_) | Parameter::FarPtr(_) => {
            return Err(EmulatorError::UnhandledParameter)
        }
    })
}

fn write_param(machine: &mut Machine, over: SegmentPrefix, p: Parameter, value: u32) -> Result<()> {
    match p {
        Parameter::Reg8(r) => {
            machine.registers.set8(r, value as u8);
            Ok(())
        }
        Parameter::Reg16(r) => {
            machine.registers.set16(r, value as u16);
            Ok(())
        }
        Parameter::Mem { addr, size } => {
            let seg = resolve_segment(machine, &addr, over);
            let off = effective_offset(machine, &addr);
            match size {
                Size::Byte => machine.memory.write8(seg, off, value as u8),
                Size::Word => machine.memory.write16(seg, off, value as u16),
            }
        }
        _ => Err(EmulatorError::UnhandledParameter),
    }
}

fn push16(machine: &mut Machine, value: u16) -> Result<()> {
    machine.registers.sp = machine.registers.sp.wrapping_sub(2);
    machine.memory.write16(machine.registers.ss, machine.registers.sp, value)
}

fn pop16(machine: &mut Machine) -> Result<u16> {
    let value = machine.memory.read16(machine.registers.ss, machine.registers.sp)?;
    machine.registers.sp = machine.registers.sp.wrapping_add(2);
    Ok(value)
}

// --- Flag-bearing arithmetic/logic (spec.md §4.E) --------------------------

fn bit_width(size: Size) -> u32 {
    match size {
        Size::Byte => 8,
        Size::Word => 16,
    }
}

fn mask_for(size: Size) -> u32 {
    match size {
        Size::Byte => 0xFF,
        Size::Word => 0xFFFF,
    }
}

fn sign_bit_for(size: Size) -> u32 {
    match size {
        Size::Byte => 0x80,
        Size::Word => 0x8000,
    }
}

fn to_signed(v: u32, size: Size) -> i32 {
    match size {
        Size::Byte => (v as u8) as i8 as i32,
        Size::Word => (v as u16) as i16 as i32,
    }
}

fn set_szp(flags: &mut Flags, result: u32, size: Size) {
    flags.zf = result == 0;
    flags.sf = result & sign_bit_for(size) != 0;
    flags.pf = (result as u8).count_ones() % 2 == 0;
}

fn apply_add_generic(flags: &mut Flags, a: u32, b: u32, carry_in: u32, size: Size) -> u32 {
    let mask = mask_for(size);
    let (am, bm) = (a & mask, b & mask);
    let wide = am + bm + carry_in;
    let result = wide & mask;
    flags.cf = wide > mask;
    flags.af = (am & 0xF) + (bm & 0xF) + carry_in > 0xF;
    let sb = sign_bit_for(size) as i32;
    let signed = to_signed(am, size) + to_signed(bm, size) + carry_in as i32;
    flags.of = signed < -sb || signed >= sb;
    set_szp(flags, result, size);
    result
}

fn apply_sub_generic(flags: &mut Flags, a: u32, b: u32, borrow_in: u32, size: Size) -> u32 {
    let mask = mask_for(size);
    let (am, bm) = (a & mask, b & mask);
    let full = am as i64 - bm as i64 - borrow_in as i64;
    let result = (full & mask as i64) as u32;
    flags.cf = full < 0;
    flags.af = ((am & 0xF) as i64 - (bm & 0xF) as i64 - borrow_in as i64) < 0;
    let sb = sign_bit_for(size) as i64;
    let signed = to_signed(am, size) as i64 - to_signed(bm, size) as i64 - borrow_in as i64;
    flags.of = signed < -sb || signed >= sb;
    set_szp(flags, result, size);
    result
}

fn apply_add(flags: &mut Flags, a: u32, b: u32, size: Size) -> u32 {
    apply_add_generic(flags, a, b, 0, size)
}
fn apply_adc(flags: &mut Flags, a: u32, b: u32, size: Size) -> u32 {
    apply_add_generic(flags, a, b, flags.cf as u32, size)
}
fn apply_sub(flags: &mut Flags, a: u32, b: u32, size: Size) -> u32 {
    apply_sub_generic(flags, a, b, 0, size)
}
fn apply_sbb(flags: &mut Flags, a: u32, b: u32, size: Size) -> u32 {
    apply_sub_generic(flags, a, b, flags.cf as u32, size)
}
fn apply_cmp(flags: &mut Flags, a: u32, b: u32, size: Size) {
    apply_sub_generic(flags, a, b, 0, size);
}

fn update_logic_flags(flags: &mut Flags, result: u32, size: Size) {
    flags.cf = false;
    flags.of = false;
    flags.af = false;
    set_szp(flags, result, size);
}

fn apply_and(flags: &mut Flags, a: u32, b: u32, size: Size) -> u32 {
    let r = (a & b) & mask_for(size);
    update_logic_flags(flags, r, size);
    r
}
fn apply_or(flags: &mut Flags, a: u32, b: u32, size: Size) -> u32 {
    let r = (a | b) & mask_for(size);
    update_logic_flags(flags, r, size);
    r
}
fn apply_xor(flags: &mut Flags, a: u32, b: u32, size: Size) -> u32 {
    let r = (a ^ b) & mask_for(size);
    update_logic_flags(flags, r, size);
    r
}
fn apply_test(flags: &mut Flags, a: u32, b: u32, size: Size) {
    let r = (a & b) & mask_for(size);
    update_logic_flags(flags, r, size);
}
fn apply_not(a: u32, size: Size) -> u32 {
    (!a) & mask_for(size)
}
fn apply_neg(flags: &mut Flags, a: u32, size: Size) -> u32 {
    let r = apply_sub(flags, 0, a, size);
    flags.cf = (a & mask_for(size)) != 0;
    r
}

fn apply_inc(flags: &mut Flags, a: u32, size: Size) -> u32 {
    let saved_cf = flags.cf;
    let r = apply_add(flags, a, 1, size);
    flags.cf = saved_cf;
    r
}
fn apply_dec(flags: &mut Flags, a: u32, size: Size) -> u32 {
    let saved_cf = flags.cf;
    let r = apply_sub(flags, a, 1, size);
    flags.cf = saved_cf;
    r
}

fn top_two_differ(result: u32, size: Size) -> bool {
    let sb = sign_bit_for(size);
    (result & sb != 0) != (result & (sb >> 1) != 0)
}

fn apply_rol(flags: &mut Flags, value: u32, count: u32, size: Size) -> u32 {
    let bits = bit_width(size);
    let count = count % bits;
    let v = value & mask_for(size);
    if count == 0 {
        return v;
    }
    let result = ((v << count) | (v >> (bits - count))) & mask_for(size);
    flags.cf = result & 1 != 0;
    if count == 1 {
        flags.of = flags.cf != (result & sign_bit_for(size) != 0);
    }
    result
}

fn apply_ror(flags: &mut Flags, value: u32, count: u32, size: Size) -> u32 {
    let bits = bit_width(size);
    let count = count % bits;
    let v = value & mask_for(size);
    if count == 0 {
        return v;
    }
    let result = ((v >> count) | (v << (bits - count))) & mask_for(size);
    flags.cf = result & sign_bit_for(size) != 0;
    if count == 1 {
        flags.of = top_two_differ(result, size);
    }
    result
}

/// `CF` = the last bit shifted out (spec.md §9).
fn apply_shl(flags: &mut Flags, value: u32, count: u32, size: Size) -> u32 {
    let bits = bit_width(size);
    let v = value & mask_for(size);
    if count == 0 {
        return v;
    }
    let shift = count.min(bits);
    let wide = (v as u64) << shift;
    flags.cf = (wide >> bits) & 1 != 0;
    let result = (wide & mask_for(size) as u64) as u32;
    if count == 1 {
        flags.of = (result & sign_bit_for(size) != 0) != flags.cf;
    }
    set_szp(flags, result, size);
    result
}

fn apply_shr(flags: &mut Flags, value: u32, count: u32, size: Size) -> u32 {
    let bits = bit_width(size);
    let v = value & mask_for(size);
    if count == 0 {
        return v;
    }
    let msb_before = v & sign_bit_for(size) != 0;
    flags.cf = count <= bits && (v >> (count - 1)) & 1 != 0;
    let result = if count > bits { 0 } else { v >> count };
    if count == 1 {
        flags.of = msb_before;
    }
    set_szp(flags, result, size);
    result
}

fn apply_daa(flags: &mut Flags, mut al: u8) -> u8 {
    let old_cf = flags.cf;
    if (al & 0x0F) > 9 || flags.af {
        al = al.wrapping_add(6);
        flags.af = true;
    } else {
        flags.af = false;
    }
    if al > 0x9F || old_cf {
        al = al.wrapping_add(0x60);
        flags.cf = true;
    } else {
        flags.cf = false;
    }
    flags.zf = al == 0;
    flags.sf = al & 0x80 != 0;
    flags.pf = al.count_ones() % 2 == 0;
    al
}

fn apply_mul(flags: &mut Flags, machine: &mut Machine, operand: u32, size: Size) {
    match size {
        Size::Byte => {
            let al = machine.registers.get8(Reg8::AL) as u32;
            let result = al * (operand & 0xFF);
            machine.registers.ax = result as u16;
            let wide = (result >> 8) != 0;
            flags.cf = wide;
            flags.of = wide;
        }
        Size::Word => {
            let ax = machine.registers.ax as u32;
            let result = ax * (operand & 0xFFFF);
            machine.registers.ax = result as u16;
            machine.registers.dx = (result >> 16) as u16;
            let wide = machine.registers.dx != 0;
            flags.cf = wide;
            flags.of = wide;
        }
    }
}

fn apply_imul(flags: &mut Flags, machine: &mut Machine, operand: u32, size: Size) {
    match size {
        Size::Byte => {
            let al = machine.registers.get8(Reg8::AL) as i8 as i32;
            let op = (operand as u8) as i8 as i32;
            let result = al * op;
            machine.registers.ax = (result as i16) as u16;
            let fits = result == (result as i8) as i32;
            flags.cf = !fits;
            flags.of = !fits;
        }
        Size::Word => {
            let ax = machine.registers.ax as i16 as i32;
            let op = (operand as u16) as i16 as i32;
            let result = ax * op;
            machine.registers.ax = result as u16;
            machine.registers.dx = (result >> 16) as u16;
            let fits = result == (result as i16) as i32;
            flags.cf = !fits;
            flags.of = !fits;
        }
    }
}

/// Unsigned `DIV` by zero, or a quotient too wide for its destination, is
/// routed through the unmapped-vector path of the service layer (spec.md §8:
/// "an `UnhandledInterrupt 0`-equivalent").
fn apply_div(machine: &mut Machine, operand: u32, size: Size) -> Result<()> {
    match size {
        Size::Byte => {
            let divisor = operand & 0xFF;
            if divisor == 0 {
                return interrupts::dispatch(machine, 0);
            }
            let dividend = machine.registers.ax as u32;
            let quotient = dividend / divisor;
            if quotient > 0xFF {
                return interrupts::dispatch(machine, 0);
            }
            let remainder = dividend % divisor;
            machine.registers.set8(Reg8::AL, quotient as u8);
            machine.registers.set8(Reg8::AH, remainder as u8);
            Ok(())
        }
        Size::Word => {
            let divisor = operand & 0xFFFF;
            if divisor == 0 {
                return interrupts::dispatch(machine, 0);
            }
            let dividend = ((machine.registers.dx as u32) << 16) | machine.registers.ax as u32;
            let quotient = dividend / divisor;
            if quotient > 0xFFFF {
                return interrupts::dispatch(machine, 0);
            }
            let remainder = dividend % divisor;
            machine.registers.ax = quotient as u16;
            machine.registers.dx = remainder as u16;
            Ok(())
        }
    }
}

fn apply_idiv(machine: &mut Machine, operand: u32, size: Size) -> Result<()> {
    match size {
        Size::Byte => {
            let divisor = (operand as u8) as i8 as i32;
            if divisor == 0 {
                return interrupts::dispatch(machine, 0);
            }
            let dividend = machine.registers.ax as i16 as i32;
            let quotient = dividend / divisor;
            let remainder = dividend % divisor;
            if !(i8::MIN as i32..=i8::MAX as i32).contains(&quotient) {
                return interrupts::dispatch(machine, 0);
            }
            machine.registers.set8(Reg8::AL, quotient as i8 as u8);
            machine.registers.set8(Reg8::AH, remainder as i8 as u8);
            Ok(())
        }
        Size::Word => {
            let divisor = (operand as u16) as i16 as i32;
            if divisor == 0 {
                return interrupts::dispatch(machine, 0);
            }
            let dividend = (((machine.registers.dx as u32) << 16) | machine.registers.ax as u32) as i32;
            let quotient = dividend / divisor;
            let remainder = dividend % divisor;
            if !(i16::MIN as i32..=i16::MAX as i32).contains(&quotient) {
                return interrupts::dispatch(machine, 0);
            }
            machine.registers.ax = quotient as i16 as u16;
            machine.registers.dx = remainder as i16 as u16;
            Ok(())
        }
    }
}

fn apply_cbw(machine: &mut Machine) {
    let al = machine.registers.get8(Reg8::AL);
    let ah = if al & 0x80 != 0 { 0xFF } else { 0x00 };
    machine.registers.set8(Reg8::AH, ah);
}

fn apply_cwd(machine: &mut Machine) {
    machine.registers.dx = if machine.registers.ax & 0x8000 != 0 { 0xFFFF } else { 0x0000 };
}

// --- String instructions ----------------------------------------------------

enum StringOp {
    Movs,
    Cmps,
    Scas,
    Lods,
    Stos,
}

fn string_segment(machine: &Machine, over: SegmentPrefix) -> u16 {
    match over {
        SegmentPrefix::ES => machine.registers.es,
        SegmentPrefix::CS => machine.registers.cs,
        SegmentPrefix::SS => machine.registers.ss,
        SegmentPrefix::DS | SegmentPrefix::None => machine.registers.ds,
    }
}

fn offset_step(value: u16, delta: u16, backward: bool) -> u16 {
    if backward {
        value.wrapping_sub(delta)
    } else {
        value.wrapping_add(delta)
    }
}

fn execute_string(machine: &mut Machine, ins: &Instruction, size: Size, op: StringOp) -> Result<()> {
    let delta: u16 = match size {
        Size::Byte => 1,
        Size::Word => 2,
    };
    loop {
        if !matches!(ins.repeat, RepeatMode::None) && machine.registers.cx == 0 {
            break;
        }
        let src_seg = string_segment(machine, ins.segment_override);
        let dst_seg = machine.registers.es;
        let si = machine.registers.si;
        let di = machine.registers.di;

        match op {
            StringOp::Movs => {
                let value = match size {
                    Size::Byte => machine.memory.read8(src_seg, si)? as u16,
                    Size::Word => machine.memory.read16(src_seg, si)?,
                };
                match size {
                    Size::Byte => machine.memory.write8(dst_seg, di, value as u8)?,
                    Size::Word => machine.memory.write16(dst_seg, di, value)?,
                }
            }
            StringOp::Cmps => {
                let a = match size {
                    Size::Byte => machine.memory.read8(src_seg, si)? as u32,
                    Size::Word => machine.memory.read16(src_seg, si)? as u32,
                };
                let b = match size {
                    Size::Byte => machine.memory.read8(dst_seg, di)? as u32,
                    Size::Word => machine.memory.read16(dst_seg, di)? as u32,
                };
                apply_cmp(&mut machine.flags, a, b, size);
            }
            StringOp::Scas => {
                let al = match size {
                    Size::Byte => machine.registers.get8(Reg8::AL) as u32,
                    Size::Word => machine.registers.ax as u32,
                };
                let b = match size {
                    Size::Byte => machine.memory.read8(dst_seg, di)? as u32,
                    Size::Word => machine.memory.read16(dst_seg, di)? as u32,
                };
                apply_cmp(&mut machine.flags, al, b, size);
            }
            StringOp::Lods => {
                let value = match size {
                    Size::Byte => machine.memory.read8(src_seg, si)? as u16,
                    Size::Word => machine.memory.read16(src_seg, si)?,
                };
                match size {
                    Size::Byte => machine.registers.set8(Reg8::AL, value as u8),
                    Size::Word => machine.registers.ax = value,
                }
            }
            StringOp::Stos => {
                let value = match size {
                    Size::Byte => machine.registers.get8(Reg8::AL) as u16,
                    Size::Word => machine.registers.ax,
                };
                match size {
                    Size::Byte => machine.memory.write8(dst_seg, di, value as u8)?,
                    Size::Word => machine.memory.write16(dst_seg, di, value)?,
                }
            }
        }

        if matches!(op, StringOp::Movs | StringOp::Cmps | StringOp::Lods) {
            machine.registers.si = offset_step(si, delta, machine.flags.df);
        }
        if matches!(op, StringOp::Movs | StringOp::Cmps | StringOp::Scas | StringOp::Stos) {
            machine.registers.di = offset_step(di, delta, machine.flags.df);
        }

        if matches!(ins.repeat, RepeatMode::None) {
            break;
        }
        machine.registers.cx = machine.registers.cx.wrapping_sub(1);
        let keep_going = match ins.repeat {
            RepeatMode::None => false,
            RepeatMode::Repeat => machine.registers.cx != 0,
            RepeatMode::RepeatZero => machine.registers.cx != 0 && machine.flags.zf,
            RepeatMode::RepeatNonZero => machine.registers.cx != 0 && !machine.flags.zf,
        };
        if !keep_going {
            break;
        }
    }
    Ok(())
}

// --- Control flow ------------------------------------------------------------

fn execute_jmp(machine: &mut Machine, ins: &Instruction) -> Result<()> {
    match ins.first().ok_or(EmulatorError::UnhandledParameter)? {
        Parameter::RelByte(rel) => {
            machine.registers.ip = machine.registers.ip.wrapping_add(rel as i16 as u16);
            Ok(())
        }
        Parameter::RelWord(rel) => {
            machine.registers.ip = machine.registers.ip.wrapping_add(rel as u16);
            Ok(())
        }
        Parameter::FarPtr(fp) => {
            machine.registers.cs = fp.segment;
            machine.registers.ip = fp.offset;
            Ok(())
        }
        p @ (Parameter::Mem { .. } | Parameter::Reg16(_)) => {
            let target = read_param(machine, ins.segment_override, p)? as u16;
            machine.registers.ip = target;
            Ok(())
        }
        _ => Err(EmulatorError::UnsupportedParameter),
    }
}

fn execute_call(machine: &mut Machine, ins: &Instruction) -> Result<()> {
    match ins.first().ok_or(EmulatorError::UnhandledParameter)? {
        Parameter::RelWord(rel) => {
            push16(machine, machine.registers.ip)?;
            machine.registers.ip = machine.registers.ip.wrapping_add(rel as u16);
            Ok(())
        }
        p @ (Parameter::Mem { .. } | Parameter::Reg16(_)) => {
            let target = read_param(machine, ins.segment_override, p)? as u16;
            push16(machine, machine.registers.ip)?;
            machine.registers.ip = target;
            Ok(())
        }
        _ => Err(EmulatorError::UnsupportedParameter),
    }
}

fn execute_ret(machine: &mut Machine, ins: &Instruction) -> Result<()> {
    let ip = pop16(machine)?;
    machine.registers.ip = ip;
    if let Some(Parameter::Imm16(n)) = ins.first() {
        machine.registers.sp = machine.registers.sp.wrapping_add(n);
    }
    Ok(())
}

fn execute_jcc(machine: &mut Machine, ins: &Instruction, cond: Condition) -> Result<()> {
    let rel = match ins.first().ok_or(EmulatorError::UnhandledParameter)? {
        Parameter::RelByte(r) => r,
        _ => return Err(EmulatorError::UnhandledParameter),
    };
    let taken = if matches!(cond, Condition::Cxz) {
        machine.registers.cx == 0
    } else {
        machine.flags.test(cond)
    };
    if taken {
        machine.registers.ip = machine.registers.ip.wrapping_add(rel as i16 as u16);
    }
    Ok(())
}

fn execute_loop(machine: &mut Machine, ins: &Instruction) -> Result<()> {
    let rel = match ins.first().ok_or(EmulatorError::UnhandledParameter)? {
        Parameter::RelByte(r) => r,
        _ => return Err(EmulatorError::UnhandledParameter),
    };
    machine.registers.cx = machine.registers.cx.wrapping_sub(1);
    let nonzero = machine.registers.cx != 0;
    let taken = match ins.mnemonic {
        Mnemonic::Loop => nonzero,
        Mnemonic::Loopz => nonzero && machine.flags.zf,
        Mnemonic::Loopnz => nonzero && !machine.flags.zf,
        _ => unreachable!(),
    };
    if taken {
        machine.registers.ip = machine.registers.ip.wrapping_add(rel as i16 as u16);
    }
    Ok(())
}

fn execute_int(machine: &mut Machine, ins: &Instruction) -> Result<()> {
    let vector = match ins.first().ok_or(EmulatorError::UnhandledParameter)? {
        Parameter::Imm8(v) => v,
        Parameter::Implied(v) => v as u8,
        _ => return Err(EmulatorError::UnhandledParameter),
    };
    interrupts::dispatch(machine, vector)
}

// --- Dispatch ----------------------------------------------------------------

fn execute(machine: &mut Machine, ins: &Instruction) -> Result<()> {
    use Mnemonic::*;
    let seg = ins.segment_override;
    match ins.mnemonic {
        Mov => {
            let src = ins.second().ok_or(EmulatorError::UnhandledParameter)?;
            let dst = ins.first().ok_or(EmulatorError::UnhandledParameter)?;
            let value = read_param(machine, seg, src)?;
            write_param(machine, seg, dst, value)
        }
        Xchg => {
            let a = ins.first().ok_or(EmulatorError::UnhandledParameter)?;
            let b = ins.second().ok_or(EmulatorError::UnhandledParameter)?;
            let va = read_param(machine, seg, a)?;
            let vb = read_param(machine, seg, b)?;
            write_param(machine, seg, a, vb)?;
            write_param(machine, seg, b, va)
        }
        Lea => {
            let dst = ins.first().ok_or(EmulatorError::UnhandledParameter)?;
            match ins.second().ok_or(EmulatorError::UnhandledParameter)? {
                Parameter::Mem { addr, .. } => {
                    let offset = effective_offset(machine, &addr);
                    write_param(machine, seg, dst, offset as u32)
                }
                _ => Err(EmulatorError::UnsupportedParameter),
            }
        }
        Lds | Les => {
            let dst = ins.first().ok_or(EmulatorError::UnhandledParameter)?;
            let (mem_seg, mem_off) = match ins.second().ok_or(EmulatorError::UnhandledParameter)? {
                Parameter::Mem { addr, .. } => (resolve_segment(machine, &addr, seg), effective_offset(machine, &addr)),
                _ => return Err(EmulatorError::UnsupportedParameter),
            };
            let offset_value = machine.memory.read16(mem_seg, mem_off)?;
            let segment_value = machine.memory.read16(mem_seg, mem_off.wrapping_add(2))?;
            write_param(machine, seg, dst, offset_value as u32)?;
            if matches!(ins.mnemonic, Lds) {
                machine.registers.ds = segment_value;
            } else {
                machine.registers.es = segment_value;
            }
            Ok(())
        }
        Push => {
            let p = ins.first().ok_or(EmulatorError::UnhandledParameter)?;
            if !p.is_word() {
                return Err(EmulatorError::UnsupportedParameter);
            }
            let value = read_param(machine, seg, p)? as u16;
            push16(machine, value)
        }
        Pop => {
            let p = ins.first().ok_or(EmulatorError::UnhandledParameter)?;
            if !p.is_word() {
                return Err(EmulatorError::UnsupportedParameter);
            }
            let value = pop16(machine)?;
            write_param(machine, seg, p, value as u32)
        }
        Pushf => {
            let v = machine.flags.to_u16();
            push16(machine, v)
        }
        Popf => {
            let v = pop16(machine)?;
            machine.flags = Flags::from_u16(v);
            Ok(())
        }

        Add | Adc | Sub | Sbb | Cmp | And | Or | Xor | Test => {
            let dst = ins.first().ok_or(EmulatorError::UnhandledParameter)?;
            let src = ins.second().ok_or(EmulatorError::UnhandledParameter)?;
            let size = dst.size();
            let a = read_param(machine, seg, dst)?;
            let b = read_param(machine, seg, src)?;
            let result = match ins.mnemonic {
                Add => apply_add(&mut machine.flags, a, b, size),
                Adc => apply_adc(&mut machine.flags, a, b, size),
                Sub => apply_sub(&mut machine.flags, a, b, size),
                Sbb => apply_sbb(&mut machine.flags, a, b, size),
                Cmp => {
                    apply_cmp(&mut machine.flags, a, b, size);
                    a
                }
                And => apply_and(&mut machine.flags, a, b, size),
                Or => apply_or(&mut machine.flags, a, b, size),
                Xor => apply_xor(&mut machine.flags, a, b, size),
                Test => {
                    apply_test(&mut machine.flags, a, b, size);
                    a
                }
                _ => unreachable!(),
            };
            if !matches!(ins.mnemonic, Cmp | Test) {
                write_param(machine, seg, dst, result)?;
            }
            Ok(())
        }

        Inc | Dec | Not | Neg => {
            let p = ins.first().ok_or(EmulatorError::UnhandledParameter)?;
            let size = p.size();
            let a = read_param(machine, seg, p)?;
            let result = match ins.mnemonic {
                Inc => apply_inc(&mut machine.flags, a, size),
                Dec => apply_dec(&mut machine.flags, a, size),
                Not => apply_not(a, size),
                Neg => apply_neg(&mut machine.flags, a, size),
                _ => unreachable!(),
            };
            write_param(machine, seg, p, result)
        }

        Mul | Imul | Div | Idiv => {
            let p = ins.first().ok_or(EmulatorError::UnhandledParameter)?;
            let size = p.size();
            let operand = read_param(machine, seg, p)?;
            match ins.mnemonic {
                Mul => {
                    let mut flags = machine.flags;
                    apply_mul(&mut flags, machine, operand, size);
                    machine.flags = flags;
                    Ok(())
                }
                Imul => {
                    let mut flags = machine.flags;
                    apply_imul(&mut flags, machine, operand, size);
                    machine.flags = flags;
                    Ok(())
                }
                Div => apply_div(machine, operand, size),
                Idiv => apply_idiv(machine, operand, size),
                _ => unreachable!(),
            }
        }

        Cbw => {
            apply_cbw(machine);
            Ok(())
        }
        Cwd => {
            apply_cwd(machine);
            Ok(())
        }
        Daa => {
            let al = machine.registers.get8(Reg8::AL);
            let result = apply_daa(&mut machine.flags, al);
            machine.registers.set8(Reg8::AL, result);
            Ok(())
        }

        Rol | Ror | Shl | Shr => {
            let dst = ins.first().ok_or(EmulatorError::UnhandledParameter)?;
            let count_param = ins.second().ok_or(EmulatorError::UnhandledParameter)?;
            let size = dst.size();
            let count = read_param(machine, seg, count_param)?;
            let value = read_param(machine, seg, dst)?;
            let result = match ins.mnemonic {
                Rol => apply_rol(&mut machine.flags, value, count, size),
                Ror => apply_ror(&mut machine.flags, value, count, size),
                Shl => apply_shl(&mut machine.flags, value, count, size),
                Shr => apply_shr(&mut machine.flags, value, count, size),
                _ => unreachable!(),
            };
            write_param(machine, seg, dst, result)
        }

        Jmp => execute_jmp(machine, ins),
        Call => execute_call(machine, ins),
        Ret => execute_ret(machine, ins),
        Jcc(cond) => execute_jcc(machine, ins, cond),
        Loop | Loopz | Loopnz => execute_loop(machine, ins),
        Int => execute_int(machine, ins),
        Iret => {
            let ip = pop16(machine)?;
            let cs = pop16(machine)?;
            let flags = pop16(machine)?;
            machine.registers.ip = ip;
            machine.registers.cs = cs;
            machine.flags = Flags::from_u16(flags);
            Ok(())
        }
        Hlt => {
            machine.stop();
            Ok(())
        }
        Nop => Ok(()),

        Movsb => execute_string(machine, ins, Size::Byte, StringOp::Movs),
        Movsw => execute_string(machine, ins, Size::Word, StringOp::Movs),
        Cmpsb => execute_string(machine, ins, Size::Byte, StringOp::Cmps),
        Cmpsw => execute_string(machine, ins, Size::Word, StringOp::Cmps),
        Scasb => execute_string(machine, ins, Size::Byte, StringOp::Scas),
        Scasw => execute_string(machine, ins, Size::Word, StringOp::Scas),
        Lodsb => execute_string(machine, ins, Size::Byte, StringOp::Lods),
        Lodsw => execute_string(machine, ins, Size::Word, StringOp::Lods),
        Stosb => execute_string(machine, ins, Size::Byte, StringOp::Stos),
        Stosw => execute_string(machine, ins, Size::Word, StringOp::Stos),

        Clc => {
            machine.flags.cf = false;
            Ok(())
        }
        Stc => {
            machine.flags.cf = true;
            Ok(())
        }
        Cmc => {
            machine.flags.cf = !machine.flags.cf;
            Ok(())
        }
        Cld => {
            machine.flags.df = false;
            Ok(())
        }
        Std => {
            machine.flags.df = true;
            Ok(())
        }
        Cli => {
            machine.flags.i_f = false;
            Ok(())
        }
        Sti => {
            machine.flags.i_f = true;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Reg16;

    fn run(bytes: &[u8]) -> Machine {
        let mut machine = Machine::new();
        machine.memory.slice_mut(0, 0, bytes.len()).unwrap().copy_from_slice(bytes);
        machine.registers.sp = 0x1000;
        for _ in 0..bytes.len() {
            if step(&mut machine).is_err() || machine.registers.ip as usize >= bytes.len() {
                break;
            }
        }
        machine
    }

    #[test]
    fn add_ff_plus_one_wraps_with_carry_and_zero() {
        // MOV AL,0xFF; ADD AL,0x01
        let machine = run(&[0xB0, 0xFF, 0x04, 0x01]);
        assert_eq!(machine.registers.get8(Reg8::AL), 0);
        assert!(machine.flags.cf);
        assert!(machine.flags.zf);
        assert!(!machine.flags.of);
    }

    #[test]
    fn add_7f_plus_one_overflows_without_carry() {
        // MOV AL,0x7F; ADD AL,0x01
        let machine = run(&[0xB0, 0x7F, 0x04, 0x01]);
        assert_eq!(machine.registers.get8(Reg8::AL), 0x80);
        assert!(!machine.flags.cf);
        assert!(machine.flags.of);
        assert!(machine.flags.sf);
    }

    #[test]
    fn sub_underflow_sets_carry_and_sign() {
        // MOV AL,0x00; SUB AL,0x01
        let machine = run(&[0xB0, 0x00, 0x2C, 0x01]);
        assert_eq!(machine.registers.get8(Reg8::AL), 0xFF);
        assert!(machine.flags.cf);
        assert!(machine.flags.sf);
    }

    #[test]
    fn not_not_round_trips_without_touching_flags() {
        let mut machine = Machine::new();
        machine.flags.zf = true;
        let original = 0x5Au32;
        let once = apply_not(original, Size::Byte);
        let twice = apply_not(once, Size::Byte);
        assert_eq!(twice, original);
        assert!(machine.flags.zf);
    }

    #[test]
    fn neg_zero_clears_carry_neg_nonzero_sets_it() {
        let mut flags = Flags::default();
        assert_eq!(apply_neg(&mut flags, 0, Size::Byte), 0);
        assert!(!flags.cf);
        assert_eq!(apply_neg(&mut flags, 5, Size::Byte), (-5i8) as u8 as u32);
        assert!(flags.cf);
    }

    #[test]
    fn div_by_zero_is_unhandled_interrupt_zero() {
        // MOV AL,1; MOV CL,0; DIV CL
        let mut machine = Machine::new();
        let bytes = [0xB0, 0x01, 0xB1, 0x00, 0xF6, 0xF1];
        machine.memory.slice_mut(0, 0, bytes.len()).unwrap().copy_from_slice(&bytes);
        step(&mut machine).unwrap();
        step(&mut machine).unwrap();
        let err = step(&mut machine).unwrap_err();
        assert_eq!(err, EmulatorError::UnhandledInterrupt { vector: 0, subfunction: None });
    }

    #[test]
    fn rep_movsb_copies_the_whole_run_and_advances_pointers() {
        let mut machine = Machine::new();
        for (i, b) in [1u8, 2, 3, 4, 5].into_iter().enumerate() {
            machine.memory.write8(0, 0x1000 + i as u16, *b).unwrap();
        }
        machine.registers.set16(Reg16::SI, 0x1000);
        machine.registers.set16(Reg16::DI, 0x2000);
        machine.registers.set16(Reg16::CX, 5);
        machine.memory.slice_mut(0, 0, 2).unwrap().copy_from_slice(&[0xF3, 0xA4]);
        step(&mut machine).unwrap();
        for i in 0..5u16 {
            assert_eq!(machine.memory.read8(0, 0x2000 + i).unwrap(), i as u8 + 1);
        }
        assert_eq!(machine.registers.cx, 0);
        assert_eq!(machine.registers.si, 0x1005);
        assert_eq!(machine.registers.di, 0x2005);
    }

    #[test]
    fn push_pop_round_trips_and_leaves_sp_unchanged() {
        let mut machine = Machine::new();
        machine.registers.sp = 0x1000;
        machine.registers.ss = 0;
        machine.registers.set16(Reg16::BX, 0x1234);
        let bx = machine.registers.bx;
        push16(&mut machine, bx).unwrap();
        let sp_after_push = machine.registers.sp;
        assert_eq!(sp_after_push, 0x0FFE);
        let value = pop16(&mut machine).unwrap();
        assert_eq!(value, 0x1234);
        assert_eq!(machine.registers.sp, 0x1000);
    }

    #[test]
    fn rol_overflow_is_carry_out_xor_result_msb_not_top_two_result_bits() {
        let mut flags = Flags::default();
        // 0xC0 rotated left by 1 -> 0x81, CF=1 (bit0), MSB(result)=1, OF = 1^1 = 0.
        let result = apply_rol(&mut flags, 0xC0, 1, Size::Byte);
        assert_eq!(result, 0x81);
        assert!(flags.cf);
        assert!(!flags.of);
    }

    #[test]
    fn xchg_is_its_own_inverse() {
        let mut machine = Machine::new();
        machine.registers.ax = 0x1111;
        machine.registers.bx = 0x2222;
        let bytes = [0x93]; // XCHG AX,BX
        machine.memory.slice_mut(0, 0, 1).unwrap().copy_from_slice(&bytes);
        step(&mut machine).unwrap();
        assert_eq!(machine.registers.ax, 0x2222);
        assert_eq!(machine.registers.bx, 0x1111);
    }
}
