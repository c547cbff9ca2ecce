pub mod cartridge;
pub mod convention;
pub mod cpu;
pub mod error;
pub mod gpu;
pub mod intf;
pub mod joypad;
pub mod memory;
pub mod mmunit;
pub mod motherboard;
pub mod register;
pub mod serial;
pub mod timer;
