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

//! GS register type definitions
//!
//! Each type decodes one 64-bit register value with `From<u64>`. Buffer
//! addresses are converted to block pointers (256-byte units) on decode, so
//! FRAME.FBP and ZBUF.ZBP (2048-word pages) come out in the same unit as
//! TEX0.TBP0.
//!
//! # References
//!
//! - GS User's Manual, 7.1 General Purpose Registers
//! - GS User's Manual, 7.2 Privileged Registers

use super::psm::Psm;

/// Extract `len` bits starting at `shift`
fn bits(value: u64, shift: u32, len: u32) -> u64 {
    (value >> shift) & ((1u64 << len) - 1)
}

fn flag(value: u64, shift: u32) -> bool {
    (value >> shift) & 1 != 0
}

fn psm(value: u64, default: Psm) -> Psm {
    Psm::from_bits(value).unwrap_or_else(|| {
        log::warn!("Unknown PSM {:#04x}, using {:?}", value, default);
        default
    })
}

/// Blocks per frame buffer page
const PAGE_BLOCKS: u32 = 32;

/// Primitive type of the PRIM register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimType {
    #[default]
    Point,
    Line,
    LineStrip,
    Triangle,
    TriangleStrip,
    TriangleFan,
    Sprite,
    /// Encoding 7, which draws nothing
    Invalid,
}

impl PrimType {
    fn from_bits(value: u64) -> Self {
        match value & 7 {
            0 => PrimType::Point,
            1 => PrimType::Line,
            2 => PrimType::LineStrip,
            3 => PrimType::Triangle,
            4 => PrimType::TriangleStrip,
            5 => PrimType::TriangleFan,
            6 => PrimType::Sprite,
            _ => PrimType::Invalid,
        }
    }
}

/// PRIM: drawing primitive and attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prim {
    pub prim: PrimType,
    /// Gouraud shading
    pub iip: bool,
    /// Texture mapping
    pub tme: bool,
    /// Fogging
    pub fge: bool,
    /// Alpha blending
    pub abe: bool,
    /// Antialiasing (treated as alpha blending)
    pub aa1: bool,
    /// UV instead of STQ texture coordinates
    pub fst: bool,
    /// Drawing context
    pub ctxt: usize,
    pub fix: bool,
}

impl From<u64> for Prim {
    fn from(v: u64) -> Self {
        Self {
            prim: PrimType::from_bits(v),
            iip: flag(v, 3),
            tme: flag(v, 4),
            fge: flag(v, 5),
            abe: flag(v, 6),
            aa1: flag(v, 7),
            fst: flag(v, 8),
            ctxt: bits(v, 9, 1) as usize,
            fix: flag(v, 10),
        }
    }
}

/// TEX0: texture and CLUT location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tex0 {
    /// Texture base pointer (blocks)
    pub tbp0: u32,
    /// Texture buffer width (64 pixel units)
    pub tbw: u32,
    pub psm: Psm,
    /// log2 of the texture width
    pub tw: u32,
    /// log2 of the texture height
    pub th: u32,
    /// Use texture alpha
    pub tcc: bool,
    /// Texture function: 0 modulate, 1 decal, 2 highlight, 3 highlight2
    pub tfx: u8,
    /// CLUT base pointer (blocks)
    pub cbp: u32,
    pub cpsm: Psm,
    /// CLUT storage mode 2
    pub csm: bool,
    /// CLUT entry offset (16 entry units)
    pub csa: u32,
    /// CLUT load control
    pub cld: u8,
}

impl Tex0 {
    pub fn width(&self) -> u32 {
        1 << self.tw.min(10)
    }

    pub fn height(&self) -> u32 {
        1 << self.th.min(10)
    }
}

impl Default for Tex0 {
    fn default() -> Self {
        Tex0::from(0)
    }
}

impl From<u64> for Tex0 {
    fn from(v: u64) -> Self {
        Self {
            tbp0: bits(v, 0, 14) as u32,
            tbw: bits(v, 14, 6) as u32,
            psm: psm(bits(v, 20, 6), Psm::Ct32),
            tw: bits(v, 26, 4) as u32,
            th: bits(v, 30, 4) as u32,
            tcc: flag(v, 34),
            tfx: bits(v, 35, 2) as u8,
            cbp: bits(v, 37, 14) as u32,
            cpsm: psm(bits(v, 51, 4), Psm::Ct32),
            csm: flag(v, 55),
            csa: bits(v, 56, 5) as u32,
            cld: bits(v, 61, 3) as u8,
        }
    }
}

/// CLAMP: texture wrap modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Clamp {
    /// 0 repeat, 1 clamp, 2 region clamp, 3 region repeat
    pub wms: u8,
    pub wmt: u8,
    pub minu: u32,
    pub maxu: u32,
    pub minv: u32,
    pub maxv: u32,
}

impl From<u64> for Clamp {
    fn from(v: u64) -> Self {
        Self {
            wms: bits(v, 0, 2) as u8,
            wmt: bits(v, 2, 2) as u8,
            minu: bits(v, 4, 10) as u32,
            maxu: bits(v, 14, 10) as u32,
            minv: bits(v, 24, 10) as u32,
            maxv: bits(v, 34, 10) as u32,
        }
    }
}

/// Alpha test comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlphaTest {
    Never,
    #[default]
    Always,
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
    NotEqual,
}

/// What a pixel failing the alpha test still writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlphaFail {
    #[default]
    Keep,
    FrameOnly,
    ZbufOnly,
    RgbOnly,
}

/// TEST: pixel tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Test {
    /// Alpha test enabled
    pub ate: bool,
    pub atst: AlphaTest,
    pub aref: u8,
    pub afail: AlphaFail,
    /// Destination alpha test enabled
    pub date: bool,
    /// Pixels with destination alpha 1 pass
    pub datm: bool,
    /// Depth test enabled
    pub zte: bool,
    /// 0 never, 1 always, 2 greater-or-equal, 3 greater
    pub ztst: u8,
}

impl From<u64> for Test {
    fn from(v: u64) -> Self {
        let atst = match bits(v, 1, 3) {
            0 => AlphaTest::Never,
            1 => AlphaTest::Always,
            2 => AlphaTest::Less,
            3 => AlphaTest::LessEqual,
            4 => AlphaTest::Equal,
            5 => AlphaTest::GreaterEqual,
            6 => AlphaTest::Greater,
            _ => AlphaTest::NotEqual,
        };
        let afail = match bits(v, 12, 2) {
            0 => AlphaFail::Keep,
            1 => AlphaFail::FrameOnly,
            2 => AlphaFail::ZbufOnly,
            _ => AlphaFail::RgbOnly,
        };
        Self {
            ate: flag(v, 0),
            atst,
            aref: bits(v, 4, 8) as u8,
            afail,
            date: flag(v, 14),
            datm: flag(v, 15),
            zte: flag(v, 16),
            ztst: bits(v, 17, 2) as u8,
        }
    }
}

/// ALPHA: blend equation `((A - B) * C >> 7) + D`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Alpha {
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub fix: u8,
}

impl From<u64> for Alpha {
    fn from(v: u64) -> Self {
        // Encoding 3 is reserved and behaves like 2 (zero / FIX)
        let term = |shift| (bits(v, shift, 2) as u8).min(2);
        Self {
            a: term(0),
            b: term(2),
            c: term(4),
            d: term(6),
            fix: bits(v, 32, 8) as u8,
        }
    }
}

/// FRAME: color buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Base pointer (blocks)
    pub fbp: u32,
    /// Buffer width (64 pixel units)
    pub fbw: u32,
    pub psm: Psm,
    /// Bits set here are not written
    pub fbmsk: u32,
}

impl Default for Frame {
    fn default() -> Self {
        Frame::from(0)
    }
}

impl From<u64> for Frame {
    fn from(v: u64) -> Self {
        Self {
            fbp: bits(v, 0, 9) as u32 * PAGE_BLOCKS,
            fbw: bits(v, 16, 6) as u32,
            psm: psm(bits(v, 24, 6), Psm::Ct32),
            fbmsk: bits(v, 32, 32) as u32,
        }
    }
}

/// ZBUF: depth buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zbuf {
    /// Base pointer (blocks)
    pub zbp: u32,
    pub psm: Psm,
    /// Depth writes masked
    pub zmsk: bool,
}

impl Default for Zbuf {
    fn default() -> Self {
        Zbuf::from(0)
    }
}

impl From<u64> for Zbuf {
    fn from(v: u64) -> Self {
        Self {
            zbp: bits(v, 0, 9) as u32 * PAGE_BLOCKS,
            // The field holds the low four bits; depth formats all have 0x30 set
            psm: psm(bits(v, 24, 4) | 0x30, Psm::Z32),
            zmsk: flag(v, 32),
        }
    }
}

/// FOGCOL: distant fog color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FogCol {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl From<u64> for FogCol {
    fn from(v: u64) -> Self {
        Self {
            r: bits(v, 0, 8) as u8,
            g: bits(v, 8, 8) as u8,
            b: bits(v, 16, 8) as u8,
        }
    }
}

/// SCISSOR: drawing rectangle in window coordinates, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scissor {
    pub x0: u32,
    pub x1: u32,
    pub y0: u32,
    pub y1: u32,
}

impl From<u64> for Scissor {
    fn from(v: u64) -> Self {
        Self {
            x0: bits(v, 0, 11) as u32,
            x1: bits(v, 16, 11) as u32,
            y0: bits(v, 32, 11) as u32,
            y1: bits(v, 48, 11) as u32,
        }
    }
}

/// XYOFFSET: primitive to window coordinate offset (12.4 fixed point)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XyOffset {
    pub ofx: u32,
    pub ofy: u32,
}

impl From<u64> for XyOffset {
    fn from(v: u64) -> Self {
        Self {
            ofx: bits(v, 0, 16) as u32,
            ofy: bits(v, 32, 16) as u32,
        }
    }
}

/// TEXA: alpha expansion of 16 and 24 bit texels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Texa {
    /// Alpha for texels with A = 0 (and for 24-bit texels)
    pub ta0: u8,
    /// Black texels are transparent
    pub aem: bool,
    /// Alpha for texels with A = 1
    pub ta1: u8,
}

impl Default for Texa {
    fn default() -> Self {
        Self {
            ta0: 0,
            aem: false,
            ta1: 0x80,
        }
    }
}

impl From<u64> for Texa {
    fn from(v: u64) -> Self {
        Self {
            ta0: bits(v, 0, 8) as u8,
            aem: flag(v, 15),
            ta1: bits(v, 32, 8) as u8,
        }
    }
}

/// PMODE: read circuit merge control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pmode {
    /// Circuit 1 enabled
    pub en1: bool,
    /// Circuit 2 enabled
    pub en2: bool,
    /// Blend with ALP instead of circuit 1 alpha
    pub mmod: bool,
    /// Write back the alpha of circuit 2
    pub amod: bool,
    /// Blend against the background color instead of circuit 2
    pub slbg: bool,
    pub alp: u8,
}

impl From<u64> for Pmode {
    fn from(v: u64) -> Self {
        Self {
            en1: flag(v, 0),
            en2: flag(v, 1),
            mmod: flag(v, 5),
            amod: flag(v, 6),
            slbg: flag(v, 7),
            alp: bits(v, 8, 8) as u8,
        }
    }
}

/// SMODE2: interlace settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smode2 {
    /// Interlaced output
    pub int: bool,
    /// Frame mode: each field reads every other line
    pub ffmd: bool,
    pub dpms: u8,
}

impl From<u64> for Smode2 {
    fn from(v: u64) -> Self {
        Self {
            int: flag(v, 0),
            ffmd: flag(v, 1),
            dpms: bits(v, 2, 2) as u8,
        }
    }
}

/// DISPFB: display buffer of one read circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispFb {
    /// Base pointer (blocks)
    pub fbp: u32,
    pub fbw: u32,
    pub psm: Psm,
    /// Top left corner of the displayed area in the buffer
    pub dbx: u32,
    pub dby: u32,
}

impl Default for DispFb {
    fn default() -> Self {
        DispFb::from(0)
    }
}

impl From<u64> for DispFb {
    fn from(v: u64) -> Self {
        Self {
            fbp: bits(v, 0, 9) as u32 * PAGE_BLOCKS,
            fbw: bits(v, 9, 6) as u32,
            psm: psm(bits(v, 15, 5), Psm::Ct32),
            dbx: bits(v, 32, 11) as u32,
            dby: bits(v, 43, 11) as u32,
        }
    }
}

/// DISPLAY: output position and size of one read circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Display {
    /// Position in video clock units
    pub dx: u32,
    pub dy: u32,
    /// Horizontal magnification minus one
    pub magh: u32,
    /// Vertical magnification minus one
    pub magv: u32,
    /// Width in video clocks minus one
    pub dw: u32,
    /// Height in lines minus one
    pub dh: u32,
}

impl Display {
    /// Displayed size in buffer pixels
    pub fn size(&self) -> (u32, u32) {
        ((self.dw + 1) / (self.magh + 1), (self.dh + 1) / (self.magv + 1))
    }
}

impl From<u64> for Display {
    fn from(v: u64) -> Self {
        Self {
            dx: bits(v, 0, 12) as u32,
            dy: bits(v, 12, 11) as u32,
            magh: bits(v, 23, 4) as u32,
            magv: bits(v, 27, 2) as u32,
            dw: bits(v, 32, 12) as u32,
            dh: bits(v, 44, 11) as u32,
        }
    }
}

/// BGCOLOR: background color of the merge circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BgColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl From<u64> for BgColor {
    fn from(v: u64) -> Self {
        Self {
            r: bits(v, 0, 8) as u8,
            g: bits(v, 8, 8) as u8,
            b: bits(v, 16, 8) as u8,
        }
    }
}

/// Pack register fields back into a register value
///
/// The renderer front end and tests build register writes with these
/// helpers instead of hand-shifting bits.
pub mod encode {
    use super::Psm;

    pub fn prim(prim: u64, iip: bool, tme: bool, abe: bool, fst: bool, ctxt: u64) -> u64 {
        (prim & 7) | (iip as u64) << 3 | (tme as u64) << 4 | (abe as u64) << 6 | (fst as u64) << 8 | (ctxt & 1) << 9
    }

    pub fn frame(fbp_pages: u64, fbw: u64, psm: Psm, fbmsk: u32) -> u64 {
        (fbp_pages & 0x1FF) | (fbw & 0x3F) << 16 | (psm.bits() as u64) << 24 | (fbmsk as u64) << 32
    }

    pub fn zbuf(zbp_pages: u64, psm: Psm, zmsk: bool) -> u64 {
        (zbp_pages & 0x1FF) | ((psm.bits() & 0xF) as u64) << 24 | (zmsk as u64) << 32
    }

    pub fn tex0(tbp0: u64, tbw: u64, psm: Psm, tw: u64, th: u64, tcc: bool, tfx: u64) -> u64 {
        (tbp0 & 0x3FFF)
            | (tbw & 0x3F) << 14
            | (psm.bits() as u64) << 20
            | (tw & 0xF) << 26
            | (th & 0xF) << 30
            | (tcc as u64) << 34
            | (tfx & 3) << 35
    }

    /// Adds CLUT fields to a TEX0 value
    pub fn tex0_clut(tex0: u64, cbp: u64, cpsm: Psm, csa: u64) -> u64 {
        tex0 | (cbp & 0x3FFF) << 37 | ((cpsm.bits() & 0xF) as u64) << 51 | (csa & 0x1F) << 56
    }

    pub fn scissor(x0: u64, x1: u64, y0: u64, y1: u64) -> u64 {
        (x0 & 0x7FF) | (x1 & 0x7FF) << 16 | (y0 & 0x7FF) << 32 | (y1 & 0x7FF) << 48
    }

    pub fn xyoffset(ofx: u64, ofy: u64) -> u64 {
        (ofx & 0xFFFF) | (ofy & 0xFFFF) << 32
    }

    pub fn test(ate: bool, atst: u64, aref: u64, date: bool, datm: bool, zte: bool, ztst: u64) -> u64 {
        ate as u64
            | (atst & 7) << 1
            | (aref & 0xFF) << 4
            | (date as u64) << 14
            | (datm as u64) << 15
            | (zte as u64) << 16
            | (ztst & 3) << 17
    }

    pub fn alpha(a: u64, b: u64, c: u64, d: u64, fix: u64) -> u64 {
        (a & 3) | (b & 3) << 2 | (c & 3) << 4 | (d & 3) << 6 | (fix & 0xFF) << 32
    }

    pub fn pmode(en1: bool, en2: bool, mmod: bool, slbg: bool, alp: u64) -> u64 {
        en1 as u64 | (en2 as u64) << 1 | (mmod as u64) << 5 | (slbg as u64) << 7 | (alp & 0xFF) << 8
    }

    pub fn dispfb(fbp_pages: u64, fbw: u64, psm: Psm, dbx: u64, dby: u64) -> u64 {
        (fbp_pages & 0x1FF)
            | (fbw & 0x3F) << 9
            | ((psm.bits() & 0x1F) as u64) << 15
            | (dbx & 0x7FF) << 32
            | (dby & 0x7FF) << 43
    }

    pub fn display(dw: u64, dh: u64) -> u64 {
        ((dw - 1) & 0xFFF) << 32 | ((dh - 1) & 0x7FF) << 44
    }

    pub fn bgcolor(r: u64, g: u64, b: u64) -> u64 {
        (r & 0xFF) | (g & 0xFF) << 8 | (b & 0xFF) << 16
    }
}
