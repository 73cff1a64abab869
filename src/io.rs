//! Default host IO
//!
//! [`LinearMemory`] services the memory callbacks from a flat
//! little-endian RAM image, with a buffered character output device and
//! just enough environment-call handling (exit and write) to run
//! freestanding test programs. Real hosts provide their own
//! [`SystemIo`] implementation.

use queues::{IsQueue, Queue};

use crate::machine::{MachineState, SystemIo};

/// Writes to this address go to the buffered character device.
pub const CHAROUT_ADDR: u32 = 0x3f8;

const SYS_WRITE: u32 = 64;
const SYS_EXIT: u32 = 93;

/// Flat guest RAM with a character device and minimal ecall handling.
pub struct LinearMemory {
    bytes: Vec<u8>,
    stdout: Queue<char>,
    /// Exit code captured from the exit environment call.
    pub exit_code: Option<u32>,
}

impl LinearMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
            stdout: Queue::new(),
            exit_code: None,
        }
    }

    /// Copy an image into guest memory at `addr`.
    pub fn load_image(&mut self, addr: u32, image: &[u8]) {
        for (offset, byte) in image.iter().enumerate() {
            self.set_byte(addr.wrapping_add(offset as u32), *byte);
        }
    }

    /// Return the contents of the character device buffer, emptying it.
    pub fn flush_stdout(&mut self) -> String {
        let mut out = String::new();
        while let Ok(ch) = self.stdout.remove() {
            out.push(ch);
        }
        out
    }

    fn byte(&self, addr: u32) -> u8 {
        self.bytes.get(addr as usize).copied().unwrap_or(0)
    }

    fn set_byte(&mut self, addr: u32, value: u8) {
        if addr == CHAROUT_ADDR {
            let _ = self.stdout.add(value as char);
        } else if let Some(slot) = self.bytes.get_mut(addr as usize) {
            *slot = value;
        }
    }
}

impl SystemIo for LinearMemory {
    fn read_b(&mut self, addr: u32) -> u8 {
        self.byte(addr)
    }

    fn read_s(&mut self, addr: u32) -> u16 {
        u16::from(self.byte(addr)) | u16::from(self.byte(addr.wrapping_add(1))) << 8
    }

    fn read_w(&mut self, addr: u32) -> u32 {
        (0..4).fold(0, |word, n| {
            word | u32::from(self.byte(addr.wrapping_add(n))) << (8 * n)
        })
    }

    fn write_b(&mut self, addr: u32, value: u8) {
        self.set_byte(addr, value);
    }

    fn write_s(&mut self, addr: u32, value: u16) {
        self.set_byte(addr, value as u8);
        self.set_byte(addr.wrapping_add(1), (value >> 8) as u8);
    }

    fn write_w(&mut self, addr: u32, value: u32) {
        for n in 0..4 {
            self.set_byte(addr.wrapping_add(n), (value >> (8 * n)) as u8);
        }
    }

    fn on_ecall(&mut self, state: &mut MachineState) {
        let number = state.x(17);
        match number {
            SYS_EXIT => {
                self.exit_code = Some(state.x(10));
                state.halt = true;
            }
            SYS_WRITE => {
                let (base, len) = (state.x(11), state.x(12));
                for offset in 0..len {
                    let byte = self.byte(base.wrapping_add(offset));
                    let _ = self.stdout.add(byte as char);
                }
                state.set_x(10, len);
            }
            _ => state.set_x(10, u32::MAX),
        }
        // Step past the trapping instruction; its width was latched.
        state.pc = state.pc.wrapping_add(if state.compressed { 2 } else { 4 });
    }

    fn on_ebreak(&mut self, state: &mut MachineState) {
        state.halt = true;
    }
}
