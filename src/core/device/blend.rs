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

//! GS blend equation to fixed-function blend state
//!
//! The GS blends with `((A - B) * C >> 7) + D` where A, B and D select the
//! source color, the destination color or zero, and C selects source alpha,
//! destination alpha or the fixed ALPHA.FIX value (all with 0x80 = 1.0).
//!
//! Every one of the 81 combinations maps to a [`HwBlend`] entry. Most map
//! directly onto factor/op pairs. The rest need help from the fragment
//! shader:
//!
//! - `ACCU`: `Cs * C + Cd` style equations. The shader multiplies by C and the
//!   hardware adds with ONE/ONE, keeping the equation's op.
//! - `MIX_1PLUS`: the source term is `Cs * (1 + C)`; the shader scales the
//!   color and the hardware blends the remaining factor.
//! - `NO_HW`: the destination is scaled by `1 + C`, which no factor can
//!   express. Drawn with blending off.
//!
//! # References
//!
//! - GS User's Manual, 3.5 Alpha Blending

use bitflags::bitflags;

use crate::core::backend::{BlendFactor, BlendOp};

/// Operand of the A, B and D terms
pub const BLEND_CS: u8 = 0;
pub const BLEND_CD: u8 = 1;
pub const BLEND_ZERO: u8 = 2;

/// Operand of the C term
pub const BLEND_AS: u8 = 0;
pub const BLEND_AD: u8 = 1;
pub const BLEND_FIX: u8 = 2;

bitflags! {
    /// Shader assistance a blend equation needs
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BlendFlags: u8 {
        const ACCU = 1 << 0;
        const MIX_1PLUS = 1 << 1;
        const NO_HW = 1 << 2;
    }
}

/// One entry of the hardware blend table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwBlend {
    pub flags: BlendFlags,
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
}

impl HwBlend {
    const fn new(src: BlendFactor, dst: BlendFactor, op: BlendOp) -> Self {
        Self {
            flags: BlendFlags::empty(),
            src,
            dst,
            op,
        }
    }

    const fn with(self, flags: BlendFlags) -> Self {
        Self { flags, ..self }
    }
}

/// Table index of an ALPHA register equation
pub const fn blend_index(a: u8, b: u8, c: u8, d: u8) -> u8 {
    a * 27 + b * 9 + c * 3 + d
}

/// Split an index back into (A, B, C, D)
pub const fn blend_terms(index: u8) -> (u8, u8, u8, u8) {
    (index / 27, (index / 9) % 3, (index / 3) % 3, index % 3)
}

fn factor(c: u8) -> BlendFactor {
    match c {
        BLEND_AS => BlendFactor::Src1Alpha,
        BLEND_AD => BlendFactor::DstAlpha,
        _ => BlendFactor::ConstantColor,
    }
}

fn inv_factor(c: u8) -> BlendFactor {
    match c {
        BLEND_AS => BlendFactor::InvSrc1Alpha,
        BLEND_AD => BlendFactor::InvDstAlpha,
        _ => BlendFactor::InvConstantColor,
    }
}

/// Fixed-function equivalent of table entry `index`
///
/// Indices 81 and above are invalid and map to plain replacement.
pub fn hw_blend(index: u8) -> HwBlend {
    use BlendFactor::{One, Zero};
    use BlendOp::{Add, ReverseSubtract as RevSub, Subtract as Sub};

    if index >= 81 {
        return HwBlend::new(One, Zero, Add).with(BlendFlags::NO_HW);
    }
    let (a, b, c, d) = blend_terms(index);
    let f = factor(c);
    let inv = inv_factor(c);

    if a == b {
        // (A - A) * C + D = D
        return match d {
            BLEND_CS => HwBlend::new(One, Zero, Add),
            BLEND_CD => HwBlend::new(Zero, One, Add),
            _ => HwBlend::new(Zero, Zero, Add),
        };
    }

    match (a, b, d) {
        (BLEND_CS, BLEND_CD, BLEND_CD) => HwBlend::new(f, inv, Add),
        (BLEND_CS, BLEND_CD, BLEND_ZERO) => HwBlend::new(f, f, Sub),
        (BLEND_CD, BLEND_CS, BLEND_CS) => HwBlend::new(inv, f, Add),
        (BLEND_CD, BLEND_CS, BLEND_ZERO) => HwBlend::new(f, f, RevSub),
        (BLEND_CS, BLEND_ZERO, BLEND_CD) => HwBlend::new(f, One, Add).with(BlendFlags::ACCU),
        (BLEND_CS, BLEND_ZERO, BLEND_ZERO) => HwBlend::new(f, Zero, Add),
        (BLEND_ZERO, BLEND_CS, BLEND_CD) => HwBlend::new(f, One, RevSub).with(BlendFlags::ACCU),
        (BLEND_ZERO, BLEND_CS, BLEND_CS) => HwBlend::new(inv, Zero, Add),
        (BLEND_ZERO, BLEND_CS, BLEND_ZERO) => HwBlend::new(f, Zero, RevSub),
        (BLEND_CD, BLEND_ZERO, BLEND_CS) => HwBlend::new(One, f, Add),
        (BLEND_CD, BLEND_ZERO, BLEND_ZERO) => HwBlend::new(Zero, f, Add),
        (BLEND_ZERO, BLEND_CD, BLEND_CS) => HwBlend::new(One, f, Sub),
        (BLEND_ZERO, BLEND_CD, BLEND_CD) => HwBlend::new(Zero, inv, Add),
        (BLEND_ZERO, BLEND_CD, BLEND_ZERO) => HwBlend::new(Zero, Zero, Add),
        (BLEND_CS, BLEND_CD, BLEND_CS) => HwBlend::new(One, f, Sub).with(BlendFlags::MIX_1PLUS),
        (BLEND_CS, BLEND_ZERO, BLEND_CS) => HwBlend::new(One, Zero, Add).with(BlendFlags::MIX_1PLUS),
        // Cd * (1 + C) - Cs * C and Cd * (1 + C)
        _ => HwBlend::new(One, Zero, Add).with(BlendFlags::NO_HW),
    }
}

/// Blend constant for the FIX operand
pub fn blend_constant(afix: u8) -> [f32; 4] {
    let v = afix as f32 / 128.0;
    [v, v, v, v]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference GS blend on 8-bit values with 0x80 = 1.0
    fn gs_blend(a: u8, b: u8, d: u8, cs: f64, cd: f64, alpha: f64) -> f64 {
        let pick = |x: u8| match x {
            BLEND_CS => cs,
            BLEND_CD => cd,
            _ => 0.0,
        };
        ((pick(a) - pick(b)) * alpha + pick(d)).clamp(0.0, 255.0)
    }

    fn hw(entry: &HwBlend, cs: f64, cd: f64, alpha: f64) -> f64 {
        let term = |f: BlendFactor| match f {
            BlendFactor::Zero => 0.0,
            BlendFactor::One => 1.0,
            BlendFactor::ConstantColor => alpha,
            BlendFactor::InvConstantColor => 1.0 - alpha,
            other => panic!("unexpected factor {:?}", other),
        };
        let s = cs * term(entry.src);
        let d = cd * term(entry.dst);
        let v = match entry.op {
            BlendOp::Add => s + d,
            BlendOp::Subtract => s - d,
            BlendOp::ReverseSubtract => d - s,
        };
        v.clamp(0.0, 255.0)
    }

    #[test]
    fn test_index_round_trip() {
        for i in 0..81u8 {
            let (a, b, c, d) = blend_terms(i);
            assert_eq!(blend_index(a, b, c, d), i);
        }
        assert_eq!(blend_index(BLEND_CS, BLEND_CD, BLEND_AS, BLEND_CD), 10);
    }

    #[test]
    fn test_direct_entries_match_gs_formula() {
        let alpha = 0.25;
        for i in 0..81u8 {
            let (a, b, c, d) = blend_terms(i);
            if c != BLEND_FIX {
                continue;
            }
            let entry = hw_blend(i);
            if !entry.flags.is_empty() {
                continue;
            }
            for (cs, cd) in [(200.0, 40.0), (10.0, 250.0), (128.0, 128.0)] {
                let expected = gs_blend(a, b, d, cs, cd, alpha);
                let got = hw(&entry, cs, cd, alpha);
                assert!(
                    (expected - got).abs() < 1e-9,
                    "index {} ({},{},{},{}): {} vs {}",
                    i, a, b, c, d, expected, got
                );
            }
        }
    }

    #[test]
    fn test_accumulation_entries_match_with_shader_multiply() {
        let alpha = 0.5;
        for (a, b) in [(BLEND_CS, BLEND_ZERO), (BLEND_ZERO, BLEND_CS)] {
            let i = blend_index(a, b, BLEND_FIX, BLEND_CD);
            let entry = hw_blend(i);
            assert!(entry.flags.contains(BlendFlags::ACCU));
            // Shader outputs Cs * C, hardware applies ONE/ONE with the entry's op
            let accu = HwBlend {
                src: BlendFactor::One,
                dst: BlendFactor::One,
                ..entry
            };
            let (cs, cd) = (100.0, 60.0);
            let expected = gs_blend(a, b, BLEND_CD, cs, cd, alpha);
            assert!((hw(&accu, cs * alpha, cd, alpha) - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_mix_and_inexpressible_flags() {
        let mix = hw_blend(blend_index(BLEND_CS, BLEND_CD, BLEND_FIX, BLEND_CS));
        assert_eq!(mix.flags, BlendFlags::MIX_1PLUS);
        assert_eq!(mix.op, BlendOp::Subtract);

        let no_hw = hw_blend(blend_index(BLEND_CD, BLEND_CS, BLEND_AS, BLEND_CD));
        assert!(no_hw.flags.contains(BlendFlags::NO_HW));
        assert!(hw_blend(81).flags.contains(BlendFlags::NO_HW));
    }

    #[test]
    fn test_factor_selection() {
        let e = hw_blend(blend_index(BLEND_CS, BLEND_CD, BLEND_AD, BLEND_CD));
        assert_eq!(e.src, BlendFactor::DstAlpha);
        assert_eq!(e.dst, BlendFactor::InvDstAlpha);
        let e = hw_blend(blend_index(BLEND_CS, BLEND_CD, BLEND_AS, BLEND_CD));
        assert_eq!(e.src, BlendFactor::Src1Alpha);
        assert_eq!(blend_constant(0x80), [1.0; 4]);
    }
}
