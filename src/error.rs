//! Closed error set for the emulator core (spec.md §7).

use thiserror::Error;

/// Errors surfaced inside a single fetch-decode-execute tick.
///
/// These are distinct from BIOS/DOS service failures with defined
/// guest-visible signaling (`CF=1, AH=code`), which `interrupts::dispatch`
/// reports as `Ok(())` after setting the flag and register directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmulatorError {
    #[error("invalid opcode {opcode:#04x} at {cs:#06x}:{ip:#06x}")]
    InvalidOpcode { opcode: u8, cs: u16, ip: u16 },

    #[error("invalid parameter (unmapped mod/rm encoding)")]
    InvalidParameter,

    #[error("unhandled instruction: {0}")]
    UnhandledInstruction(&'static str),

    #[error("parameter shape cannot be used here")]
    UnhandledParameter,

    #[error("byte/word operand size mismatch")]
    ParameterLengthMismatch,

    #[error("operand kind not allowed for this instruction")]
    UnsupportedParameter,

    #[error("unhandled interrupt {vector:#04x}{}", subfunction.map(|f| format!("/AH={:#04x}", f)).unwrap_or_default())]
    UnhandledInterrupt { vector: u8, subfunction: Option<u8> },

    #[error("memory access out of range: {0:#08x}")]
    MemoryOutOfRange(u32),

    #[error("unknown disk format ({0} bytes)")]
    UnknownDiskFormat(u64),

    #[error("I/O failure: {0}")]
    IoFailure(String),
}

pub type Result<T> = std::result::Result<T, EmulatorError>;

impl From<std::io::Error> for EmulatorError {
    fn from(e: std::io::Error) -> Self {
        EmulatorError::IoFailure(e.to_string())
    }
}
