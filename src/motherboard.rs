// The frame driver. Pumps the CPU, fans its cycle count out to the video
// system and the timer, and hands a finished frame back to the host every
// 70224 dots.
use super::cartridge::Cartridge;
use super::convention::{DOTS_PER_FRAME, SCREEN_H, SCREEN_W};
use super::cpu::Cpu;
use super::error::Error;
use super::intf::Flag;
use super::joypad::JoypadKey;
use super::mmunit::Mmunit;
use std::path::Path;

// OAM DMA blocks the CPU for 160 machine cycles plus setup.
// See: https://github.com/Gekkio/mooneye-gb/blob/master/docs/accuracy.markdown
const OAM_DMA_CYCLES: u32 = 162;

pub struct MotherBoard {
    pub mmu: Mmunit,
    pub cpu: Cpu,
    current_dots: u32,
}

impl MotherBoard {
    pub fn power_up(path: impl AsRef<Path>) -> Result<Self, Error> {
        rog::debugln!("Loading cartridge from {:?}", path.as_ref());
        let rom = std::fs::read(path)?;
        let cartridge = Cartridge::new(rom)?;
        let mmu = Mmunit::power_up(cartridge);
        let cpu = Cpu::power_up(mmu.intf.clone());
        Ok(Self { mmu, cpu, current_dots: 0 })
    }

    // Runs the machine until one full frame has elapsed and returns the image.
    // A decode miss aborts the frame and surfaces to the host.
    pub fn next_frame(&mut self) -> Result<&[[[u8; 4]; SCREEN_W]; SCREEN_H], Error> {
        loop {
            let cycles = if self.mmu.gpu.dma_active() {
                // The CPU is stalled for the whole transfer.
                self.mmu.run_oam_dma();
                OAM_DMA_CYCLES
            } else {
                self.cpu.next(&mut self.mmu)?
            };
            self.mmu.gpu.step(cycles * 4);
            if self.mmu.timer.update(cycles) {
                self.mmu.intf.borrow_mut().hi(Flag::Timer);
            }
            self.current_dots += cycles * 4;
            if self.current_dots >= DOTS_PER_FRAME {
                self.current_dots -= DOTS_PER_FRAME;
                return Ok(&self.mmu.gpu.data);
            }
        }
    }

    pub fn keydown(&mut self, key: JoypadKey) {
        self.mmu.joypad.keydown(key);
    }

    pub fn keyup(&mut self, key: JoypadKey) {
        self.mmu.joypad.keyup(key);
    }

    pub fn title(&self) -> &str {
        self.mmu.cartridge.title()
    }
}

#[cfg(test)]
mod tests {
    use super::super::cartridge::make_test_rom;
    use super::super::memory::Memory;
    use super::*;

    fn setup() -> MotherBoard {
        // Entry point parks the CPU in a tight loop: JR -2.
        let mut rom = make_test_rom(0x00, 0x00, 0x00);
        rom[0x0100] = 0x18;
        rom[0x0101] = 0xfe;
        let cartridge = Cartridge::new(rom).unwrap();
        let mmu = Mmunit::power_up(cartridge);
        let cpu = Cpu::power_up(mmu.intf.clone());
        MotherBoard { mmu, cpu, current_dots: 0 }
    }

    #[test]
    fn test_frames_hold_invariants() {
        let mut m = setup();
        for _ in 0..5 {
            assert!(m.next_frame().is_ok());
            assert!(m.mmu.gpu.get(0xff44) <= 154);
            let stat = m.mmu.gpu.get(0xff41);
            assert_eq!(stat & 0x80, 0x80);
            assert!(m.current_dots < DOTS_PER_FRAME);
        }
    }

    #[test]
    fn test_boot_program_hands_off_to_cartridge() {
        let mut m = setup();
        assert!(m.mmu.bootmode());
        assert_eq!(m.cpu.reg.pc, 0x0000);
        // The boot program scrolls the logo for roughly 23.4M T-cycles
        // (~334 frames) before jumping to the entry point.
        for _ in 0..600 {
            m.next_frame().unwrap();
        }
        assert!(!m.mmu.bootmode());
        assert!(m.cpu.reg.pc >= 0x0100 && m.cpu.reg.pc <= 0x0102);
        assert_eq!(m.cpu.reg.sp, 0xfffe);
    }

    #[test]
    fn test_oam_dma_runs_between_instructions() {
        let mut m = setup();
        for i in 0..0xa0 {
            m.mmu.set(0xc200 + i, (0xa0 - i) as u8);
        }
        m.mmu.set(0xff46, 0xc2);
        m.next_frame().unwrap();
        assert!(!m.mmu.gpu.dma_active());
        assert_eq!(m.mmu.get(0xfe00), 0xa0);
        assert_eq!(m.mmu.get(0xfe9f), 0x01);
    }
}
