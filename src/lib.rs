//! An 8086-class emulator core: instruction decoder, execution engine, BIOS
//! and MS-DOS service layer, a minimal floppy device and text video buffer,
//! and the `Machine` type that owns all of it (spec.md §4, §9).

pub mod decoder;
pub mod engine;
pub mod error;
pub mod fields;
pub mod floppy;
pub mod instructions;
pub mod interrupts;
pub mod machine;
pub mod memory;
pub mod registers;
pub mod video;

pub use error::{EmulatorError, Result};
pub use machine::Machine;
