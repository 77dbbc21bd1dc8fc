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

//! Emulated GS local memory
//!
//! The GS owns 4 MiB of local memory holding frame buffers, depth buffers,
//! textures and CLUTs. Buffers are addressed by a block pointer (256-byte
//! units), a buffer width (64-pixel units) and a pixel storage mode.
//!
//! [`LocalMemory`] is the seam the texture cache talks to: implementors
//! provide the per-format pixel accessors and get whole-image transfers,
//! CLUT lookup and texture decoding on top of them.
//!
//! # Memory Map
//!
//! | Unit        | Size       |
//! |-------------|------------|
//! | Block       | 256 bytes  |
//! | Page        | 32 blocks  |
//! | Local memory| 16384 blocks (4 MiB) |
//!
//! # Example
//!
//! ```
//! use gsrx::core::gs::Psm;
//! use gsrx::core::memory::{LinearMemory, LocalMemory};
//!
//! let mut mem = LinearMemory::new();
//! mem.write_pixel(Psm::Ct16, 0, 1, 3, 2, 0x801F);
//! assert_eq!(mem.read_pixel(Psm::Ct16, 0, 1, 3, 2), 0x801F);
//! ```

use std::ops::Range;

use crate::core::gs::{Psm, Tex0};
use crate::core::types::Rect;

mod linear;

pub use linear::LinearMemory;

/// Bytes of local memory
pub const VRAM_SIZE: usize = 4 * 1024 * 1024;

/// Bytes per block pointer unit
pub const BLOCK_SIZE: u32 = 256;

/// Rectangle of one buffer in local memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VramRegion {
    /// Block pointer
    pub bp: u32,
    /// Buffer width in 64-pixel units
    pub bw: u32,
    pub psm: Psm,
    pub rect: Rect,
}

impl VramRegion {
    pub fn new(bp: u32, bw: u32, psm: Psm, rect: Rect) -> Self {
        Self { bp, bw, psm, rect }
    }

    /// Bytes per buffer row
    pub fn stride(&self) -> u64 {
        row_bytes(self.bw, self.psm)
    }

    /// Byte range of the rows the rectangle touches
    pub fn byte_range(&self) -> Range<u64> {
        let base = self.bp as u64 * BLOCK_SIZE as u64;
        let top = self.rect.top.max(0) as u64;
        let bottom = self.rect.bottom.max(self.rect.top).max(0) as u64;
        base + top * self.stride()..base + bottom * self.stride()
    }

    pub fn overlaps(&self, other: &VramRegion) -> bool {
        let (a, b) = (self.byte_range(), other.byte_range());
        a.start < b.end && b.start < a.end
    }
}

/// Bytes per row of a buffer `bw` units wide
pub fn row_bytes(bw: u32, psm: Psm) -> u64 {
    bw.max(1) as u64 * 64 * psm.bpp() as u64 / 8
}

/// Expand an RGB5A1 pixel to 8-bit channels; the A bit becomes 0x80
pub fn expand16(v: u16) -> [u8; 4] {
    [
        ((v & 0x1F) << 3) as u8,
        (((v >> 5) & 0x1F) << 3) as u8,
        (((v >> 10) & 0x1F) << 3) as u8,
        if v & 0x8000 != 0 { 0x80 } else { 0 },
    ]
}

/// Pack 8-bit channels into RGB5A1
pub fn pack16(rgba: [u8; 4]) -> u16 {
    (rgba[0] as u16 >> 3)
        | (rgba[1] as u16 >> 3) << 5
        | (rgba[2] as u16 >> 3) << 10
        | if rgba[3] >= 0x80 { 0x8000 } else { 0 }
}

/// CLUT position of entry `index` for an 8-bit texture in CSM1 layout
///
/// CSM1 stores the palette in 8x2 entry blocks, which swaps bits 3 and 4 of
/// the index.
pub fn clut_swizzle(index: u32) -> u32 {
    (index & !0x18) | (index & 0x08) << 1 | (index & 0x10) >> 1
}

/// Per-format access to emulated local memory
///
/// Coordinates are pixels within the buffer at block pointer `bp` that is
/// `bw` 64-pixel units wide.
pub trait LocalMemory {
    fn write_pixel32(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u32);
    /// Write the low 24 bits, keeping the upper byte
    fn write_pixel24(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u32);
    fn write_pixel16(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u16);
    fn write_pixel8(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u8);
    fn write_pixel4(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u8);

    fn read_pixel32(&self, bp: u32, bw: u32, x: u32, y: u32) -> u32;
    fn read_pixel16(&self, bp: u32, bw: u32, x: u32, y: u32) -> u16;
    fn read_pixel8(&self, bp: u32, bw: u32, x: u32, y: u32) -> u8;
    fn read_pixel4(&self, bp: u32, bw: u32, x: u32, y: u32) -> u8;

    /// Write one pixel in `psm`
    fn write_pixel(&mut self, psm: Psm, bp: u32, bw: u32, x: u32, y: u32, value: u32) {
        match psm {
            Psm::Ct32 | Psm::Z32 => self.write_pixel32(bp, bw, x, y, value),
            Psm::Ct24 | Psm::Z24 => self.write_pixel24(bp, bw, x, y, value),
            Psm::Ct16 | Psm::Ct16s | Psm::Z16 | Psm::Z16s => self.write_pixel16(bp, bw, x, y, value as u16),
            Psm::T8 => self.write_pixel8(bp, bw, x, y, value as u8),
            Psm::T4 => self.write_pixel4(bp, bw, x, y, value as u8),
            Psm::T8h => {
                let old = self.read_pixel32(bp, bw, x, y);
                self.write_pixel32(bp, bw, x, y, (old & 0x00FF_FFFF) | (value & 0xFF) << 24);
            }
            Psm::T4hl => {
                let old = self.read_pixel32(bp, bw, x, y);
                self.write_pixel32(bp, bw, x, y, (old & !0x0F00_0000) | (value & 0xF) << 24);
            }
            Psm::T4hh => {
                let old = self.read_pixel32(bp, bw, x, y);
                self.write_pixel32(bp, bw, x, y, (old & !0xF000_0000) | (value & 0xF) << 28);
            }
        }
    }

    /// Read one pixel in `psm`, right aligned
    fn read_pixel(&self, psm: Psm, bp: u32, bw: u32, x: u32, y: u32) -> u32 {
        match psm {
            Psm::Ct32 | Psm::Z32 => self.read_pixel32(bp, bw, x, y),
            Psm::Ct24 | Psm::Z24 => self.read_pixel32(bp, bw, x, y) & 0x00FF_FFFF,
            Psm::Ct16 | Psm::Ct16s | Psm::Z16 | Psm::Z16s => self.read_pixel16(bp, bw, x, y) as u32,
            Psm::T8 => self.read_pixel8(bp, bw, x, y) as u32,
            Psm::T4 => self.read_pixel4(bp, bw, x, y) as u32,
            Psm::T8h => self.read_pixel32(bp, bw, x, y) >> 24,
            Psm::T4hl => (self.read_pixel32(bp, bw, x, y) >> 24) & 0xF,
            Psm::T4hh => self.read_pixel32(bp, bw, x, y) >> 28,
        }
    }

    /// Host to local transfer of packed pixels
    ///
    /// `data` holds the rectangle row by row, [`Psm::transfer_bpp`] bits per
    /// pixel; 4-bit pixels are packed low nibble first. Short data ends the
    /// transfer.
    fn write_image(&mut self, region: &VramRegion, data: &[u8]) {
        let VramRegion { bp, bw, psm, rect } = *region;
        let bpp = psm.transfer_bpp() as usize;
        let mut bit = 0usize;
        for y in rect.top.max(0)..rect.bottom.max(0) {
            for x in rect.left.max(0)..rect.right.max(0) {
                let byte = bit / 8;
                let value = match bpp {
                    4 => {
                        let Some(b) = data.get(byte) else { return };
                        ((b >> (bit % 8)) & 0xF) as u32
                    }
                    _ => {
                        let Some(bytes) = data.get(byte..byte + bpp / 8) else { return };
                        bytes.iter().rev().fold(0u32, |v, b| (v << 8) | *b as u32)
                    }
                };
                self.write_pixel(psm, bp, bw, x as u32, y as u32, value);
                bit += bpp;
            }
        }
    }

    /// Local to host transfer; the inverse of [`LocalMemory::write_image`]
    fn read_image(&self, region: &VramRegion) -> Vec<u8> {
        let VramRegion { bp, bw, psm, rect } = *region;
        let bpp = psm.transfer_bpp() as usize;
        let pixels = (rect.width().max(0) * rect.height().max(0)) as usize;
        let mut out = vec![0u8; (pixels * bpp).div_ceil(8)];
        let mut bit = 0usize;
        for y in rect.top.max(0)..rect.bottom.max(0) {
            for x in rect.left.max(0)..rect.right.max(0) {
                let value = self.read_pixel(psm, bp, bw, x as u32, y as u32);
                let byte = bit / 8;
                if bpp == 4 {
                    out[byte] |= ((value & 0xF) as u8) << (bit % 8);
                } else {
                    out[byte..byte + bpp / 8].copy_from_slice(&value.to_le_bytes()[..bpp / 8]);
                }
                bit += bpp;
            }
        }
        out
    }

    /// CLUT entries for a paletted texture, raw in `tex0.cpsm`
    fn read_clut(&self, tex0: &Tex0) -> Vec<u32> {
        let entries = tex0.psm.clut_entries();
        (0..entries)
            .map(|i| {
                let (x, y) = if entries == 256 {
                    let j = if tex0.csm { i } else { clut_swizzle(i) };
                    (j % 16, j / 16)
                } else {
                    (i % 8, i / 8 + tex0.csa * 2)
                };
                self.read_pixel(tex0.cpsm, tex0.cbp, 1, x, y)
            })
            .collect()
    }

    /// Decode `rect` of a texture to RGBA8
    ///
    /// 16-bit texels are expanded with their A bit as 0x80 and 24-bit texels
    /// get alpha 0; the draw shader applies TEXA to both. Paletted texels
    /// are looked up in the CLUT first. Depth formats read as the color
    /// format of the same size.
    fn read_texture_rgba8(&self, tex0: &Tex0, rect: Rect) -> Vec<u8> {
        let clut = if tex0.psm.is_paletted() {
            self.read_clut(tex0)
        } else {
            Vec::new()
        };
        let color_psm = if tex0.psm.is_paletted() { tex0.cpsm } else { tex0.psm };
        let mut out = Vec::with_capacity((rect.width().max(0) * rect.height().max(0) * 4) as usize);
        for y in rect.top.max(0)..rect.bottom.max(0) {
            for x in rect.left.max(0)..rect.right.max(0) {
                let mut value = self.read_pixel(tex0.psm, tex0.tbp0, tex0.tbw, x as u32, y as u32);
                if tex0.psm.is_paletted() {
                    value = clut.get(value as usize).copied().unwrap_or(0);
                }
                let rgba = match color_psm.fmt() {
                    2 => expand16(value as u16),
                    1 => {
                        let [r, g, b, _] = value.to_le_bytes();
                        [r, g, b, 0]
                    }
                    _ => value.to_le_bytes(),
                };
                out.extend_from_slice(&rgba);
            }
        }
        out
    }
}
