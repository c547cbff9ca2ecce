use std::io;
use thiserror::Error;

/// Fatal conditions of the emulator core. Construction failures abort startup;
/// a decode miss at runtime aborts the frame in flight.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read rom: {0}")]
    RomLoad(#[from] io::Error),
    #[error("cartridge header is corrupt: {0}")]
    CartridgeParse(&'static str),
    #[error("unsupported cartridge type 0x{0:02x}")]
    UnsupportedCartridge(u8),
    #[error("unimplemented opcode 0x{opcode:02x} at pc 0x{pc:04x}")]
    UnimplementedOpcode { opcode: u8, pc: u16 },
}
