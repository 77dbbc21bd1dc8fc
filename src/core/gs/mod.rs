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

//! GS register state
//!
//! The GS keeps two drawing contexts (selected per primitive by PRIM.CTXT),
//! a handful of registers shared by both, and the privileged display
//! registers that drive the read circuits. [`GsRegisters`] holds all of them
//! decoded; [`GsRegisters::write`] and [`GsRegisters::write_privileged`]
//! accept raw register writes the way the GIF delivers them.
//!
//! # Example
//!
//! ```
//! use gsrx::core::gs::{registers::encode, GsRegisters, Psm, REG_FRAME_1};
//!
//! let mut regs = GsRegisters::new();
//! regs.write(REG_FRAME_1, encode::frame(0, 10, Psm::Ct32, 0));
//! assert_eq!(regs.ctx[0].frame.fbw, 10);
//! ```

pub mod psm;
pub mod registers;

pub use psm::Psm;
pub use registers::{
    Alpha, AlphaFail, AlphaTest, BgColor, Clamp, DispFb, Display, FogCol, Frame, Pmode, Prim,
    PrimType, Scissor, Smode2, Tex0, Texa, Test, XyOffset, Zbuf,
};

// General purpose register addresses
pub const REG_PRIM: u8 = 0x00;
pub const REG_TEX0_1: u8 = 0x06;
pub const REG_TEX0_2: u8 = 0x07;
pub const REG_CLAMP_1: u8 = 0x08;
pub const REG_CLAMP_2: u8 = 0x09;
pub const REG_XYOFFSET_1: u8 = 0x18;
pub const REG_XYOFFSET_2: u8 = 0x19;
pub const REG_TEXA: u8 = 0x3B;
pub const REG_FOGCOL: u8 = 0x3D;
pub const REG_SCISSOR_1: u8 = 0x40;
pub const REG_SCISSOR_2: u8 = 0x41;
pub const REG_ALPHA_1: u8 = 0x42;
pub const REG_ALPHA_2: u8 = 0x43;
pub const REG_DTHE: u8 = 0x45;
pub const REG_COLCLAMP: u8 = 0x46;
pub const REG_TEST_1: u8 = 0x47;
pub const REG_TEST_2: u8 = 0x48;
pub const REG_PABE: u8 = 0x49;
pub const REG_FBA_1: u8 = 0x4A;
pub const REG_FBA_2: u8 = 0x4B;
pub const REG_FRAME_1: u8 = 0x4C;
pub const REG_FRAME_2: u8 = 0x4D;
pub const REG_ZBUF_1: u8 = 0x4E;
pub const REG_ZBUF_2: u8 = 0x4F;

// Privileged register offsets from 0x12000000
pub const PREG_PMODE: u32 = 0x0000;
pub const PREG_SMODE2: u32 = 0x0020;
pub const PREG_DISPFB1: u32 = 0x0070;
pub const PREG_DISPLAY1: u32 = 0x0080;
pub const PREG_DISPFB2: u32 = 0x0090;
pub const PREG_DISPLAY2: u32 = 0x00A0;
pub const PREG_BGCOLOR: u32 = 0x00E0;

/// Registers that exist once per drawing context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawingContext {
    pub tex0: Tex0,
    pub clamp: Clamp,
    pub xyoffset: XyOffset,
    pub scissor: Scissor,
    pub alpha: Alpha,
    pub test: Test,
    /// Force alpha MSB on written pixels
    pub fba: bool,
    pub frame: Frame,
    pub zbuf: Zbuf,
}

/// One read circuit of the display merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadCircuit {
    pub dispfb: DispFb,
    pub display: Display,
}

/// Decoded GS register file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GsRegisters {
    pub prim: Prim,
    pub ctx: [DrawingContext; 2],
    pub texa: Texa,
    pub fogcol: FogCol,
    /// Dithering enabled
    pub dthe: bool,
    /// Clamp colors to 0..255 instead of wrapping
    pub colclamp: bool,
    /// Per-pixel alpha blending enable
    pub pabe: bool,

    pub pmode: Pmode,
    pub smode2: Smode2,
    pub circuits: [ReadCircuit; 2],
    pub bgcolor: BgColor,
}

impl GsRegisters {
    pub fn new() -> Self {
        Self {
            colclamp: true,
            ..Default::default()
        }
    }

    /// Write a general purpose register
    ///
    /// Writes to registers this renderer does not model are logged and
    /// ignored.
    pub fn write(&mut self, addr: u8, value: u64) {
        match addr {
            REG_PRIM => self.prim = Prim::from(value),
            REG_TEX0_1 | REG_TEX0_2 => self.ctx[(addr - REG_TEX0_1) as usize].tex0 = Tex0::from(value),
            REG_CLAMP_1 | REG_CLAMP_2 => self.ctx[(addr - REG_CLAMP_1) as usize].clamp = Clamp::from(value),
            REG_XYOFFSET_1 | REG_XYOFFSET_2 => {
                self.ctx[(addr - REG_XYOFFSET_1) as usize].xyoffset = XyOffset::from(value)
            }
            REG_TEXA => self.texa = Texa::from(value),
            REG_FOGCOL => self.fogcol = FogCol::from(value),
            REG_SCISSOR_1 | REG_SCISSOR_2 => {
                self.ctx[(addr - REG_SCISSOR_1) as usize].scissor = Scissor::from(value)
            }
            REG_ALPHA_1 | REG_ALPHA_2 => self.ctx[(addr - REG_ALPHA_1) as usize].alpha = Alpha::from(value),
            REG_DTHE => self.dthe = value & 1 != 0,
            REG_COLCLAMP => self.colclamp = value & 1 != 0,
            REG_TEST_1 | REG_TEST_2 => self.ctx[(addr - REG_TEST_1) as usize].test = Test::from(value),
            REG_PABE => self.pabe = value & 1 != 0,
            REG_FBA_1 | REG_FBA_2 => self.ctx[(addr - REG_FBA_1) as usize].fba = value & 1 != 0,
            REG_FRAME_1 | REG_FRAME_2 => self.ctx[(addr - REG_FRAME_1) as usize].frame = Frame::from(value),
            REG_ZBUF_1 | REG_ZBUF_2 => self.ctx[(addr - REG_ZBUF_1) as usize].zbuf = Zbuf::from(value),
            _ => log::trace!("Ignoring GS register write {:#04x} = {:#018x}", addr, value),
        }
    }

    /// Write a privileged register at `offset` from the register base
    pub fn write_privileged(&mut self, offset: u32, value: u64) {
        match offset {
            PREG_PMODE => self.pmode = Pmode::from(value),
            PREG_SMODE2 => self.smode2 = Smode2::from(value),
            PREG_DISPFB1 => self.circuits[0].dispfb = DispFb::from(value),
            PREG_DISPLAY1 => self.circuits[0].display = Display::from(value),
            PREG_DISPFB2 => self.circuits[1].dispfb = DispFb::from(value),
            PREG_DISPLAY2 => self.circuits[1].display = Display::from(value),
            PREG_BGCOLOR => self.bgcolor = BgColor::from(value),
            _ => log::trace!("Ignoring privileged write {:#06x} = {:#018x}", offset, value),
        }
    }

    /// Whether read circuit `index` is enabled in PMODE
    pub fn circuit_enabled(&self, index: usize) -> bool {
        match index {
            0 => self.pmode.en1,
            1 => self.pmode.en2,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::registers::encode;
    use super::*;

    #[test]
    fn test_context_registers_are_separate() {
        let mut regs = GsRegisters::new();
        regs.write(REG_FRAME_1, encode::frame(1, 10, Psm::Ct32, 0));
        regs.write(REG_FRAME_2, encode::frame(2, 5, Psm::Ct16, 0));
        regs.write(REG_FBA_2, 1);
        assert_eq!(regs.ctx[0].frame.fbp, 32);
        assert_eq!(regs.ctx[1].frame.fbp, 64);
        assert_eq!(regs.ctx[1].frame.psm, Psm::Ct16);
        assert!(!regs.ctx[0].fba);
        assert!(regs.ctx[1].fba);
    }

    #[test]
    fn test_unknown_register_is_ignored() {
        let mut regs = GsRegisters::new();
        let before = regs.clone();
        regs.write(0x7F, u64::MAX);
        regs.write_privileged(0x1000, u64::MAX);
        assert_eq!(regs, before);
    }

    #[test]
    fn test_privileged_writes() {
        let mut regs = GsRegisters::new();
        regs.write_privileged(PREG_PMODE, encode::pmode(false, true, false, false, 0));
        regs.write_privileged(PREG_DISPFB2, encode::dispfb(4, 10, Psm::Ct32, 0, 0));
        assert!(!regs.circuit_enabled(0));
        assert!(regs.circuit_enabled(1));
        assert_eq!(regs.circuits[1].dispfb.fbp, 128);
    }

    #[test]
    fn test_colclamp_defaults_on() {
        assert!(GsRegisters::new().colclamp);
    }
}
