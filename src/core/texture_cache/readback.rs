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

//! Target readback conversions
//!
//! | PSM          | Offscreen format | Shader             | Direct at 1x |
//! |--------------|------------------|--------------------|--------------|
//! | CT32, CT24   | RGBA8            | COPY               | yes          |
//! | CT16, CT16S  | R16UI            | RGBA8_TO_16_BITS   | no           |
//! | Z32, Z24     | R32UI            | FLOAT32_TO_32_BITS | no           |
//! | Z16, Z16S    | R16UI            | FLOAT32_TO_32_BITS | no           |
//! | T8           | R8UI             | RGBA_TO_8I         | no           |

use crate::core::backend::Format;
use crate::core::device::ShaderConvert;
use crate::core::error::{GsError, Result};
use crate::core::gs::Psm;

/// One row of the conversion table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadbackEntry {
    pub psm: Psm,
    pub format: Format,
    pub shader: ShaderConvert,
    /// Surface bytes already match memory when the target is not upscaled
    pub direct_at_native: bool,
}

const fn entry(psm: Psm, format: Format, shader: ShaderConvert, direct_at_native: bool) -> ReadbackEntry {
    ReadbackEntry {
        psm,
        format,
        shader,
        direct_at_native,
    }
}

pub const READBACK_TABLE: [ReadbackEntry; 9] = [
    entry(Psm::Ct32, Format::Rgba8Unorm, ShaderConvert::Copy, true),
    entry(Psm::Ct24, Format::Rgba8Unorm, ShaderConvert::Copy, true),
    entry(Psm::Ct16, Format::R16Uint, ShaderConvert::Rgba8To16Bits, false),
    entry(Psm::Ct16s, Format::R16Uint, ShaderConvert::Rgba8To16Bits, false),
    entry(Psm::Z32, Format::R32Uint, ShaderConvert::Float32To32Bits, false),
    entry(Psm::Z24, Format::R32Uint, ShaderConvert::Float32To32Bits, false),
    entry(Psm::Z16, Format::R16Uint, ShaderConvert::Float32To32Bits, false),
    entry(Psm::Z16s, Format::R16Uint, ShaderConvert::Float32To32Bits, false),
    entry(Psm::T8, Format::R8Uint, ShaderConvert::RgbaTo8i, false),
];

/// How a target of `psm` reaches the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadbackPath {
    /// Copy the surface bytes as they are
    Direct,
    /// Draw through `shader` into a native-size `format` surface first
    Convert { format: Format, shader: ShaderConvert },
}

/// Pick the readback path for a target of `psm` upscaled by `scale`
pub fn readback_path(psm: Psm, scale: u32) -> Result<ReadbackPath> {
    let entry = READBACK_TABLE
        .iter()
        .find(|e| e.psm == psm)
        .ok_or(GsError::NotImplemented("readback of this pixel format"))?;
    Ok(if entry.direct_at_native && scale == 1 {
        ReadbackPath::Direct
    } else {
        ReadbackPath::Convert {
            format: entry.format,
            shader: entry.shader,
        }
    })
}

/// Decode one texel of a readback in `format` to a raw memory value
pub fn texel_value(format: Format, texel: &[u8]) -> u32 {
    match format {
        Format::R8Uint => texel[0] as u32,
        Format::R16Uint => u16::from_le_bytes([texel[0], texel[1]]) as u32,
        _ => u32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_32_bit_color_is_direct_only_at_native_scale() {
        assert_eq!(readback_path(Psm::Ct32, 1).unwrap(), ReadbackPath::Direct);
        assert_eq!(
            readback_path(Psm::Ct24, 2).unwrap(),
            ReadbackPath::Convert {
                format: Format::Rgba8Unorm,
                shader: ShaderConvert::Copy
            }
        );
    }

    #[test]
    fn test_packed_formats_always_convert() {
        for (psm, format) in [
            (Psm::Ct16, Format::R16Uint),
            (Psm::Z24, Format::R32Uint),
            (Psm::Z16s, Format::R16Uint),
            (Psm::T8, Format::R8Uint),
        ] {
            match readback_path(psm, 1).unwrap() {
                ReadbackPath::Convert { format: f, .. } => assert_eq!(f, format, "{:?}", psm),
                ReadbackPath::Direct => panic!("{:?} read back directly", psm),
            }
        }
    }

    #[test]
    fn test_unlisted_format_is_not_implemented() {
        assert!(matches!(readback_path(Psm::T4, 1), Err(GsError::NotImplemented(_))));
    }

    #[test]
    fn test_texel_decoding() {
        assert_eq!(texel_value(Format::R8Uint, &[0x42]), 0x42);
        assert_eq!(texel_value(Format::R16Uint, &[0x1F, 0x80]), 0x801F);
        assert_eq!(texel_value(Format::Rgba8Unorm, &[1, 2, 3, 4]), 0x0403_0201);
    }
}
