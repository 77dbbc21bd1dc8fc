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

//! Conversion shader catalogue
//!
//! Every entry is one `ps_mainN` entry point of the conversion shader
//! template, where `N` is the discriminant.

use serde::{Deserialize, Serialize};

use crate::core::backend::Format;

/// Fragment programs of the conversion shader template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum ShaderConvert {
    Copy = 0,
    Rgba8To16Bits = 1,
    Datm1 = 2,
    Datm0 = 3,
    Scanline = 4,
    DiagonalFilter = 5,
    TransparencyFilter = 6,
    TriangularFilter = 7,
    ComplexFilter = 8,
    Float32To32Bits = 9,
    Float32ToRgba8 = 10,
    Float16ToRgb5a1 = 11,
    Rgba8ToFloat32 = 12,
    Rgba8ToFloat24 = 13,
    Rgba8ToFloat16 = 14,
    Rgb5a1ToFloat16 = 15,
    RgbaTo8i = 16,
    Yuv = 17,
}

impl ShaderConvert {
    pub const COUNT: usize = 18;

    pub const ALL: [ShaderConvert; Self::COUNT] = [
        ShaderConvert::Copy,
        ShaderConvert::Rgba8To16Bits,
        ShaderConvert::Datm1,
        ShaderConvert::Datm0,
        ShaderConvert::Scanline,
        ShaderConvert::DiagonalFilter,
        ShaderConvert::TransparencyFilter,
        ShaderConvert::TriangularFilter,
        ShaderConvert::ComplexFilter,
        ShaderConvert::Float32To32Bits,
        ShaderConvert::Float32ToRgba8,
        ShaderConvert::Float16ToRgb5a1,
        ShaderConvert::Rgba8ToFloat32,
        ShaderConvert::Rgba8ToFloat24,
        ShaderConvert::Rgba8ToFloat16,
        ShaderConvert::Rgb5a1ToFloat16,
        ShaderConvert::RgbaTo8i,
        ShaderConvert::Yuv,
    ];

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(self) -> u32 {
        self as u32
    }

    /// Writes depth instead of color
    pub fn is_depth_output(self) -> bool {
        matches!(
            self,
            ShaderConvert::Rgba8ToFloat32
                | ShaderConvert::Rgba8ToFloat24
                | ShaderConvert::Rgba8ToFloat16
                | ShaderConvert::Rgb5a1ToFloat16
        )
    }

    /// Stencil setup for destination alpha test
    pub fn is_datm(self) -> bool {
        matches!(self, ShaderConvert::Datm0 | ShaderConvert::Datm1)
    }

    /// Also compiled against the swap chain render pass
    pub fn is_present(self) -> bool {
        matches!(
            self,
            ShaderConvert::Copy
                | ShaderConvert::Scanline
                | ShaderConvert::DiagonalFilter
                | ShaderConvert::TriangularFilter
                | ShaderConvert::ComplexFilter
        )
    }

    /// Color format the shader writes when drawing to an offscreen target
    pub fn output_format(self) -> Option<Format> {
        match self {
            ShaderConvert::Rgba8To16Bits => Some(Format::R16Uint),
            ShaderConvert::Float32To32Bits => Some(Format::R32Uint),
            ShaderConvert::RgbaTo8i => Some(Format::R8Uint),
            s if s.is_depth_output() || s.is_datm() => None,
            _ => Some(Format::Rgba8Unorm),
        }
    }
}
