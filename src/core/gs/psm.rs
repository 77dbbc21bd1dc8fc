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

//! Pixel storage modes
//!
//! The PSM field of FRAME, ZBUF, TEX0, DISPFB and BITBLTBUF selects how a
//! pixel is packed in local memory.
//!
//! | PSM     | Value | Bits in memory | Notes                        |
//! |---------|-------|----------------|------------------------------|
//! | CT32    | 0x00  | 32             |                              |
//! | CT24    | 0x01  | 32             | upper byte untouched         |
//! | CT16    | 0x02  | 16             | RGB5A1                       |
//! | CT16S   | 0x0A  | 16             | RGB5A1, different swizzle    |
//! | T8      | 0x13  | 8              | CLUT index                   |
//! | T4      | 0x14  | 4              | CLUT index                   |
//! | T8H     | 0x1B  | 32             | index in bits 24..32         |
//! | T4HL    | 0x24  | 32             | index in bits 24..28         |
//! | T4HH    | 0x2C  | 32             | index in bits 28..32         |
//! | Z32     | 0x30  | 32             |                              |
//! | Z24     | 0x31  | 32             | upper byte untouched         |
//! | Z16     | 0x32  | 16             |                              |
//! | Z16S    | 0x3A  | 16             |                              |

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Psm {
    Ct32,
    Ct24,
    Ct16,
    Ct16s,
    T8,
    T4,
    T8h,
    T4hl,
    T4hh,
    Z32,
    Z24,
    Z16,
    Z16s,
}

impl Psm {
    /// Decode a PSM field; unknown encodings are `None`
    pub fn from_bits(bits: u64) -> Option<Psm> {
        Some(match bits & 0x3F {
            0x00 => Psm::Ct32,
            0x01 => Psm::Ct24,
            0x02 => Psm::Ct16,
            0x0A => Psm::Ct16s,
            0x13 => Psm::T8,
            0x14 => Psm::T4,
            0x1B => Psm::T8h,
            0x24 => Psm::T4hl,
            0x2C => Psm::T4hh,
            0x30 => Psm::Z32,
            0x31 => Psm::Z24,
            0x32 => Psm::Z16,
            0x3A => Psm::Z16s,
            _ => return None,
        })
    }

    pub fn bits(self) -> u8 {
        match self {
            Psm::Ct32 => 0x00,
            Psm::Ct24 => 0x01,
            Psm::Ct16 => 0x02,
            Psm::Ct16s => 0x0A,
            Psm::T8 => 0x13,
            Psm::T4 => 0x14,
            Psm::T8h => 0x1B,
            Psm::T4hl => 0x24,
            Psm::T4hh => 0x2C,
            Psm::Z32 => 0x30,
            Psm::Z24 => 0x31,
            Psm::Z16 => 0x32,
            Psm::Z16s => 0x3A,
        }
    }

    /// Bits one pixel occupies in local memory
    pub fn bpp(self) -> u32 {
        match self {
            Psm::Ct16 | Psm::Ct16s | Psm::Z16 | Psm::Z16s => 16,
            Psm::T8 => 8,
            Psm::T4 => 4,
            _ => 32,
        }
    }

    /// Bits per pixel in host transfers; 24-bit formats are packed
    pub fn transfer_bpp(self) -> u32 {
        match self {
            Psm::Ct24 | Psm::Z24 => 24,
            Psm::T8h => 8,
            Psm::T4hl | Psm::T4hh => 4,
            other => other.bpp(),
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Psm::Z32 | Psm::Z24 | Psm::Z16 | Psm::Z16s)
    }

    pub fn is_paletted(self) -> bool {
        matches!(self, Psm::T8 | Psm::T4 | Psm::T8h | Psm::T4hl | Psm::T4hh)
    }

    /// Number of CLUT entries a paletted format indexes
    pub fn clut_entries(self) -> u32 {
        match self {
            Psm::T8 | Psm::T8h => 256,
            Psm::T4 | Psm::T4hl | Psm::T4hh => 16,
            _ => 0,
        }
    }

    /// Color formats a frame buffer may use
    pub fn is_frame_format(self) -> bool {
        matches!(self, Psm::Ct32 | Psm::Ct24 | Psm::Ct16 | Psm::Ct16s) || self.is_depth()
    }

    /// Texel layout class seen by the draw shader: 0 32-bit, 1 24-bit, 2 16-bit
    pub fn fmt(self) -> u8 {
        match self {
            Psm::Ct24 | Psm::Z24 => 1,
            Psm::Ct16 | Psm::Ct16s | Psm::Z16 | Psm::Z16s => 2,
            _ => 0,
        }
    }

    /// Depth reinterpretation selector: 1 Z32, 2 Z24, 3 Z16, 0 color
    pub fn depth_fmt(self) -> u8 {
        match self {
            Psm::Z32 => 1,
            Psm::Z24 => 2,
            Psm::Z16 | Psm::Z16s => 3,
            _ => 0,
        }
    }

    /// Largest depth value the format stores
    pub fn max_depth(self) -> u32 {
        match self {
            Psm::Z24 => 0x00FF_FFFF,
            Psm::Z16 | Psm::Z16s => 0xFFFF,
            _ => u32::MAX,
        }
    }
}
