// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Linear local memory
//!
//! Pixels are stored row-major from the buffer base with no block or page
//! swizzling. Addresses wrap at 4 MiB like the hardware's.

use super::{LocalMemory, BLOCK_SIZE, VRAM_SIZE};

/// 4 MiB of local memory with linear addressing
pub struct LinearMemory {
    data: Vec<u8>,
}

impl LinearMemory {
    pub fn new() -> Self {
        Self {
            data: vec![0; VRAM_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Zero all of memory
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Bit address of pixel (x, y), before wrapping
    fn bit_address(bp: u32, bw: u32, x: u32, y: u32, bpp: u32) -> u64 {
        let base = bp as u64 * BLOCK_SIZE as u64 * 8;
        let pixel = y as u64 * bw.max(1) as u64 * 64 + x as u64;
        base + pixel * bpp as u64
    }

    fn byte_index(bp: u32, bw: u32, x: u32, y: u32, bpp: u32) -> usize {
        ((Self::bit_address(bp, bw, x, y, bpp) / 8) % VRAM_SIZE as u64) as usize
    }

    fn read_bytes<const N: usize>(&self, index: usize) -> [u8; N] {
        let mut out = [0u8; N];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.data[(index + i) % VRAM_SIZE];
        }
        out
    }

    fn write_bytes(&mut self, index: usize, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.data[(index + i) % VRAM_SIZE] = *b;
        }
    }
}

impl Default for LinearMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMemory for LinearMemory {
    fn write_pixel32(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u32) {
        self.write_bytes(Self::byte_index(bp, bw, x, y, 32), &value.to_le_bytes());
    }

    fn write_pixel24(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u32) {
        self.write_bytes(Self::byte_index(bp, bw, x, y, 32), &value.to_le_bytes()[..3]);
    }

    fn write_pixel16(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u16) {
        self.write_bytes(Self::byte_index(bp, bw, x, y, 16), &value.to_le_bytes());
    }

    fn write_pixel8(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u8) {
        self.write_bytes(Self::byte_index(bp, bw, x, y, 8), &[value]);
    }

    fn write_pixel4(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u8) {
        let bit = Self::bit_address(bp, bw, x, y, 4);
        let index = Self::byte_index(bp, bw, x, y, 4);
        let shift = (bit % 8) as u8;
        let old = self.data[index];
        self.data[index] = (old & !(0xF << shift)) | ((value & 0xF) << shift);
    }

    fn read_pixel32(&self, bp: u32, bw: u32, x: u32, y: u32) -> u32 {
        u32::from_le_bytes(self.read_bytes(Self::byte_index(bp, bw, x, y, 32)))
    }

    fn read_pixel16(&self, bp: u32, bw: u32, x: u32, y: u32) -> u16 {
        u16::from_le_bytes(self.read_bytes(Self::byte_index(bp, bw, x, y, 16)))
    }

    fn read_pixel8(&self, bp: u32, bw: u32, x: u32, y: u32) -> u8 {
        self.data[Self::byte_index(bp, bw, x, y, 8)]
    }

    fn read_pixel4(&self, bp: u32, bw: u32, x: u32, y: u32) -> u8 {
        let bit = Self::bit_address(bp, bw, x, y, 4);
        (self.data[Self::byte_index(bp, bw, x, y, 4)] >> (bit % 8)) & 0xF
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gs::Psm;

    #[test]
    fn test_rows_are_buffer_width_apart() {
        let mut mem = LinearMemory::new();
        mem.write_pixel32(2, 1, 0, 1, 0xDEAD_BEEF);
        // Block 2 starts at byte 512, a 64 pixel row is 256 bytes
        assert_eq!(&mem.as_bytes()[768..772], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(mem.read_pixel32(2, 1, 0, 1), 0xDEAD_BEEF);
        assert_eq!(mem.read_pixel32(3, 1, 0, 0), 0xDEAD_BEEF);
    }

    #[test]
    fn test_24_bit_writes_keep_upper_byte() {
        let mut mem = LinearMemory::new();
        mem.write_pixel32(0, 1, 5, 0, 0xAA00_0000);
        mem.write_pixel24(0, 1, 5, 0, 0xFF12_3456);
        assert_eq!(mem.read_pixel32(0, 1, 5, 0), 0xAA12_3456);
    }

    #[test]
    fn test_4_bit_pixels_share_bytes() {
        let mut mem = LinearMemory::new();
        mem.write_pixel4(0, 1, 0, 0, 0x3);
        mem.write_pixel4(0, 1, 1, 0, 0xC);
        assert_eq!(mem.as_bytes()[0], 0xC3);
        assert_eq!(mem.read_pixel4(0, 1, 1, 0), 0xC);
        mem.write_pixel4(0, 1, 0, 0, 0xF);
        assert_eq!(mem.as_bytes()[0], 0xCF);
    }

    #[test]
    fn test_addresses_wrap_at_4_mib() {
        let mut mem = LinearMemory::new();
        // Last block, last pixel of a 64 wide CT32 row
        mem.write_pixel32(16383, 1, 63, 0, 0x0102_0304);
        assert_eq!(mem.read_pixel32(16383, 1, 63, 0), 0x0102_0304);
        mem.write_pixel32(16384, 1, 0, 0, 0x1111_1111);
        assert_eq!(mem.read_pixel32(0, 1, 0, 0), 0x1111_1111);
    }

    #[test]
    fn test_high_nibble_formats_share_32_bit_storage() {
        let mut mem = LinearMemory::new();
        mem.write_pixel(Psm::Ct24, 0, 1, 0, 0, 0x00AB_CDEF);
        mem.write_pixel(Psm::T8h, 0, 1, 0, 0, 0x5A);
        assert_eq!(mem.read_pixel32(0, 1, 0, 0), 0x5AAB_CDEF);
        mem.write_pixel(Psm::T4hh, 0, 1, 0, 0, 0x7);
        assert_eq!(mem.read_pixel(Psm::T4hl, 0, 1, 0, 0), 0xA);
        assert_eq!(mem.read_pixel(Psm::T4hh, 0, 1, 0, 0), 0x7);
        assert_eq!(mem.read_pixel(Psm::Ct24, 0, 1, 0, 0), 0x00AB_CDEF);
    }
}
