// The eight buttons/direction keys are arranged as a 2x4 matrix. A program
// selects either the button or the direction row by writing to FF00, then
// reads bits 0-3 back.
//
// FF00 - P1/JOYP - Joypad (R/W)
//
// Bit 7 - Not used (reads 1)
// Bit 6 - Not used (reads 1)
// Bit 5 - P15 Select Button Keys      (0=Select)
// Bit 4 - P14 Select Direction Keys   (0=Select)
// Bit 3 - P13 Input Down  or Start    (0=Pressed) (Read Only)
// Bit 2 - P12 Input Up    or Select   (0=Pressed) (Read Only)
// Bit 1 - P11 Input Left  or Button B (0=Pressed) (Read Only)
// Bit 0 - P10 Input Right or Button A (0=Pressed) (Read Only)
use super::intf::{Flag, Intf};
use std::cell::RefCell;
use std::rc::Rc;

#[rustfmt::skip]
#[derive(Clone, Copy)]
pub enum JoypadKey {
    Right  = 0b0000_0001,
    Left   = 0b0000_0010,
    Up     = 0b0000_0100,
    Down   = 0b0000_1000,
    A      = 0b0001_0000,
    B      = 0b0010_0000,
    Select = 0b0100_0000,
    Start  = 0b1000_0000,
}

pub struct Joypad {
    intf: Rc<RefCell<Intf>>,
    // Low = pressed. Directions in the low nibble, buttons in the high one.
    matrix: u8,
    // The row-select bits (4 and 5) last written to FF00.
    select: u8,
}

impl Joypad {
    pub fn power_up(intf: Rc<RefCell<Intf>>) -> Self {
        Self { intf, matrix: 0xff, select: 0x30 }
    }

    pub fn keydown(&mut self, key: JoypadKey) {
        // Only a released-to-pressed edge requests the joypad interrupt.
        if self.matrix & key as u8 != 0x00 {
            self.intf.borrow_mut().hi(Flag::Joypad);
        }
        self.matrix &= !(key as u8);
    }

    pub fn keyup(&mut self, key: JoypadKey) {
        self.matrix |= key as u8;
    }

    pub fn get(&self, a: u16) -> u8 {
        assert_eq!(a, 0xff00);
        if self.select & 0b0001_0000 == 0x00 {
            return 0xc0 | self.select | (self.matrix & 0x0f);
        }
        if self.select & 0b0010_0000 == 0x00 {
            return 0xc0 | self.select | (self.matrix >> 4);
        }
        0xc0 | self.select | 0x0f
    }

    pub fn set(&mut self, a: u16, v: u8) {
        assert_eq!(a, 0xff00);
        self.select = v & 0x30;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Joypad, Rc<RefCell<Intf>>) {
        let intf = Rc::new(RefCell::new(Intf::power_up()));
        (Joypad::power_up(intf.clone()), intf)
    }

    #[test]
    fn test_idle_reads_released() {
        let (mut pad, _) = setup();
        pad.set(0xff00, 0x20);
        assert_eq!(pad.get(0xff00), 0xef);
        pad.set(0xff00, 0x10);
        assert_eq!(pad.get(0xff00), 0xdf);
    }

    #[test]
    fn test_rows_are_independent() {
        let (mut pad, _) = setup();
        pad.keydown(JoypadKey::Left);
        pad.keydown(JoypadKey::Start);
        // Direction row selected: Left (bit 1) pulled low.
        pad.set(0xff00, 0x20);
        assert_eq!(pad.get(0xff00), 0xc0 | 0x20 | 0x0d);
        // Button row selected: Start (bit 3) pulled low.
        pad.set(0xff00, 0x10);
        assert_eq!(pad.get(0xff00), 0xc0 | 0x10 | 0x07);
        pad.keyup(JoypadKey::Left);
        pad.set(0xff00, 0x20);
        assert_eq!(pad.get(0xff00), 0xef);
    }

    #[test]
    fn test_press_edge_raises_irq() {
        let (mut pad, intf) = setup();
        pad.keydown(JoypadKey::A);
        assert_eq!(intf.borrow().data & 0x10, 0x10);
        intf.borrow_mut().data = 0x00;
        // Holding the key is not a new edge.
        pad.keydown(JoypadKey::A);
        assert_eq!(intf.borrow().data & 0x10, 0x00);
        pad.keyup(JoypadKey::A);
        pad.keydown(JoypadKey::A);
        assert_eq!(intf.borrow().data & 0x10, 0x10);
    }
}
