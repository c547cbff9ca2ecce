// The bus. Every memory reference of the CPU passes through here and is
// routed to the cartridge, the video system, work/high RAM or the memory
// mapped IO registers. The bus itself ticks nothing; it is a pure router.
use super::cartridge::Cartridge;
use super::gpu::Gpu;
use super::intf::Intf;
use super::joypad::Joypad;
use super::memory::Memory;
use super::serial::Serial;
use super::timer::Timer;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

// The 256 byte boot program of the original DMG. It sets up the stack, clears
// VRAM, unpacks and scrolls the logo from the cartridge header, compares it
// against its own copy and finally leaves with PC at 0x0100.
#[rustfmt::skip]
const BOOT_ROM: [u8; 0x100] = [
    0x31, 0xfe, 0xff, 0xaf, 0x21, 0xff, 0x9f, 0x32, 0xcb, 0x7c, 0x20, 0xfb, 0x21, 0x26, 0xff, 0x0e,
    0x11, 0x3e, 0x80, 0x32, 0xe2, 0x0c, 0x3e, 0xf3, 0xe2, 0x32, 0x3e, 0x77, 0x77, 0x3e, 0xfc, 0xe0,
    0x47, 0x11, 0x04, 0x01, 0x21, 0x10, 0x80, 0x1a, 0xcd, 0x95, 0x00, 0xcd, 0x96, 0x00, 0x13, 0x7b,
    0xfe, 0x34, 0x20, 0xf3, 0x11, 0xd8, 0x00, 0x06, 0x08, 0x1a, 0x13, 0x22, 0x23, 0x05, 0x20, 0xf9,
    0x3e, 0x19, 0xea, 0x10, 0x99, 0x21, 0x2f, 0x99, 0x0e, 0x0c, 0x3d, 0x28, 0x08, 0x32, 0x0d, 0x20,
    0xf9, 0x2e, 0x0f, 0x18, 0xf3, 0x67, 0x3e, 0x64, 0x57, 0xe0, 0x42, 0x3e, 0x91, 0xe0, 0x40, 0x04,
    0x1e, 0x02, 0x0e, 0x0c, 0xf0, 0x44, 0xfe, 0x90, 0x20, 0xfa, 0x0d, 0x20, 0xf7, 0x1d, 0x20, 0xf2,
    0x0e, 0x13, 0x24, 0x7c, 0x1e, 0x83, 0xfe, 0x62, 0x28, 0x06, 0x1e, 0xc1, 0xfe, 0x64, 0x20, 0x06,
    0x7b, 0xe2, 0x0c, 0x3e, 0x87, 0xe2, 0xf0, 0x42, 0x90, 0xe0, 0x42, 0x15, 0x20, 0xd2, 0x05, 0x20,
    0x4f, 0x16, 0x20, 0x18, 0xcb, 0x4f, 0x06, 0x04, 0xc5, 0xcb, 0x11, 0x17, 0xc1, 0xcb, 0x11, 0x17,
    0x05, 0x20, 0xf5, 0x22, 0x23, 0x22, 0x23, 0xc9, 0xce, 0xed, 0x66, 0x66, 0xcc, 0x0d, 0x00, 0x0b,
    0x03, 0x73, 0x00, 0x83, 0x00, 0x0c, 0x00, 0x0d, 0x00, 0x08, 0x11, 0x1f, 0x88, 0x89, 0x00, 0x0e,
    0xdc, 0xcc, 0x6e, 0xe6, 0xdd, 0xdd, 0xd9, 0x99, 0xbb, 0xbb, 0x67, 0x63, 0x6e, 0x0e, 0xec, 0xcc,
    0xdd, 0xdc, 0x99, 0x9f, 0xbb, 0xb9, 0x33, 0x3e, 0x3c, 0x42, 0xb9, 0xa5, 0xb9, 0xa5, 0x42, 0x3c,
    0x21, 0x04, 0x01, 0x11, 0xa8, 0x00, 0x1a, 0x13, 0xbe, 0x20, 0xfe, 0x23, 0x7d, 0xfe, 0x34, 0x20,
    0xf5, 0x06, 0x19, 0x78, 0x86, 0x23, 0x05, 0x20, 0xfb, 0x86, 0x20, 0xfe, 0x3e, 0x01, 0xe0, 0x50,
];

pub struct Mmunit {
    pub cartridge: Cartridge,
    pub gpu: Gpu,
    pub joypad: Joypad,
    pub serial: Serial,
    pub timer: Timer,
    pub intf: Rc<RefCell<Intf>>,
    hram: [u8; 0x7f],
    wram: [u8; 0x2000],
    // True until the program leaves the boot ROM. The first read of 0x0100
    // (the cartridge entry point) clears it for good; reads happen through a
    // shared reference, hence the Cell.
    bootmode: Cell<bool>,
}

impl Mmunit {
    pub fn power_up(cartridge: Cartridge) -> Self {
        let intf = Rc::new(RefCell::new(Intf::power_up()));
        Self {
            cartridge,
            gpu: Gpu::power_up(intf.clone()),
            joypad: Joypad::power_up(intf.clone()),
            serial: Serial::power_up(),
            timer: Timer::power_up(),
            intf,
            hram: [0x00; 0x7f],
            wram: [0x00; 0x2000],
            bootmode: Cell::new(true),
        }
    }

    pub fn bootmode(&self) -> bool {
        self.bootmode.get()
    }

    // Bulk OAM DMA: copies 0xa0 bytes from the latched source page into the
    // sprite attribute table. Invoked by the frame driver while the CPU is
    // stalled.
    pub fn run_oam_dma(&mut self) {
        let src = self.gpu.dma_source();
        for i in 0..0xa0 {
            let b = self.get(src + i);
            self.set(0xfe00 + i, b);
        }
        self.gpu.finish_dma();
    }
}

impl Memory for Mmunit {
    fn get(&self, a: u16) -> u8 {
        match a {
            0x0000..=0x7fff => {
                if self.bootmode.get() && a < 0x0100 {
                    return BOOT_ROM[a as usize];
                }
                if a == 0x0100 {
                    self.bootmode.set(false);
                }
                self.cartridge.get(a)
            }
            0x8000..=0x9fff => self.gpu.get(a),
            0xa000..=0xbfff => self.cartridge.get(a),
            0xc000..=0xdfff => self.wram[a as usize - 0xc000],
            // Echo of C000-DDFF.
            0xe000..=0xfdff => self.wram[a as usize - 0xe000],
            0xfe00..=0xfe9f => self.gpu.get(a),
            0xff00 => self.joypad.get(a),
            0xff01..=0xff02 => self.serial.get(a),
            0xff04..=0xff07 => self.timer.get(a),
            0xff0f => self.intf.borrow().get(a),
            0xff40..=0xff7f => self.gpu.get(a),
            0xff80..=0xfffe => self.hram[a as usize - 0xff80],
            0xffff => self.intf.borrow().get(a),
            // Open bus.
            _ => 0x00,
        }
    }

    fn set(&mut self, a: u16, v: u8) {
        match a {
            0x0000..=0x7fff => self.cartridge.set(a, v),
            0x8000..=0x9fff => self.gpu.set(a, v),
            0xa000..=0xbfff => self.cartridge.set(a, v),
            0xc000..=0xdfff => self.wram[a as usize - 0xc000] = v,
            0xe000..=0xfdff => self.wram[a as usize - 0xe000] = v,
            0xfe00..=0xfe9f => self.gpu.set(a, v),
            0xff00 => self.joypad.set(a, v),
            0xff01..=0xff02 => self.serial.set(a, v),
            0xff04..=0xff07 => self.timer.set(a, v),
            0xff0f => self.intf.borrow_mut().set(a, v),
            0xff40..=0xff7f => self.gpu.set(a, v),
            0xff80..=0xfffe => self.hram[a as usize - 0xff80] = v,
            0xffff => self.intf.borrow_mut().set(a, v),
            _ => {}
        }
    }
}
