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

//! Pipeline selectors
//!
//! Each selector is a plain struct of the register-derived fields that affect
//! one shader stage or one piece of fixed-function state. Equality and
//! hashing are derived, so every field takes part in pipeline cache lookups.
//! `key()` packs a selector into an integer for logging and statistics.
//!
//! # Field widths
//!
//! | Selector | Field | Bits |
//! |----------|-------|------|
//! | PS | fmt | 4 |
//! | PS | tfx, atst, channel | 3 |
//! | PS | dfmt, depth_fmt, wms, wmt, dither, blend_a..d, blend_mix | 2 |
//! | DSS | ztst | 2 |
//! | Blend | blend_index | 7 |

use serde::{Deserialize, Serialize};

/// Vertex shader variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VsSelector {
    /// Texture mapping enabled
    pub tme: bool,
    /// Fixed-point UV instead of perspective ST
    pub fst: bool,
    /// Expand points to quads
    pub point: bool,
}

impl VsSelector {
    pub fn key(&self) -> u32 {
        self.tme as u32 | (self.fst as u32) << 1 | (self.point as u32) << 2
    }
}

/// Geometry shader variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GsSelector {
    /// Gouraud shading
    pub iip: bool,
    /// 0 point, 1 line, 2 triangle, 3 sprite
    pub prim: u8,
    pub point: bool,
    pub line: bool,
    /// Sprites already expanded to triangles on the CPU
    pub cpu_sprite: bool,
}

impl GsSelector {
    pub const PRIM_POINT: u8 = 0;
    pub const PRIM_LINE: u8 = 1;
    pub const PRIM_TRIANGLE: u8 = 2;
    pub const PRIM_SPRITE: u8 = 3;

    pub fn key(&self) -> u32 {
        self.iip as u32
            | (self.prim as u32 & 3) << 1
            | (self.point as u32) << 3
            | (self.line as u32) << 4
            | (self.cpu_sprite as u32) << 5
    }

    /// Whether a geometry stage has to run at all
    pub fn is_needed(&self) -> bool {
        let expands_prims = self.prim > Self::PRIM_POINT
            && !self.cpu_sprite
            && (!self.iip || self.prim == Self::PRIM_SPRITE);
        expands_prims || self.point || self.line
    }
}

/// Fragment shader variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PsSelector {
    // Texture format and sampling
    pub fmt: u8,
    pub dfmt: u8,
    pub depth_fmt: u8,
    pub aem: bool,
    pub fst: bool,
    pub tfx: u8,
    pub tcc: bool,
    pub wms: u8,
    pub wmt: u8,
    pub ltf: bool,
    pub point_sampler: bool,
    pub invalid_tex0: bool,

    // Pixel pipeline
    pub fba: bool,
    pub fog: bool,
    pub atst: u8,

    // Channel shuffle
    pub shuffle: bool,
    pub read_ba: bool,
    pub channel: u8,

    // Output
    pub fbmask: bool,
    pub hdr: bool,
    pub clr1: bool,
    pub colclip: bool,
    pub pabe: bool,
    pub dither: u8,
    pub zclamp: bool,

    // Shader side of blending
    pub blend_a: u8,
    pub blend_b: u8,
    pub blend_c: u8,
    pub blend_d: u8,
    pub blend_mix: u8,
}

impl PsSelector {
    /// Texture function value meaning "no texture"
    pub const TFX_NONE: u8 = 4;

    pub fn key(&self) -> u64 {
        let mut key = 0u64;
        let mut shift = 0;
        let mut put = |value: u64, bits: u32| {
            key |= (value & ((1 << bits) - 1)) << shift;
            shift += bits;
        };
        put(self.fmt as u64, 4);
        put(self.dfmt as u64, 2);
        put(self.depth_fmt as u64, 2);
        put(self.aem as u64, 1);
        put(self.fst as u64, 1);
        put(self.tfx as u64, 3);
        put(self.tcc as u64, 1);
        put(self.wms as u64, 2);
        put(self.wmt as u64, 2);
        put(self.ltf as u64, 1);
        put(self.point_sampler as u64, 1);
        put(self.invalid_tex0 as u64, 1);
        put(self.fba as u64, 1);
        put(self.fog as u64, 1);
        put(self.atst as u64, 3);
        put(self.shuffle as u64, 1);
        put(self.read_ba as u64, 1);
        put(self.channel as u64, 3);
        put(self.fbmask as u64, 1);
        put(self.hdr as u64, 1);
        put(self.clr1 as u64, 1);
        put(self.colclip as u64, 1);
        put(self.pabe as u64, 1);
        put(self.dither as u64, 2);
        put(self.zclamp as u64, 1);
        put(self.blend_a as u64, 2);
        put(self.blend_b as u64, 2);
        put(self.blend_c as u64, 2);
        put(self.blend_d as u64, 2);
        put(self.blend_mix as u64, 2);
        key
    }

    pub fn is_textured(&self) -> bool {
        self.tfx != Self::TFX_NONE
    }
}

/// Depth and stencil state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepthStencilSelector {
    /// GS depth test: 0 never, 1 always, 2 greater-or-equal, 3 greater
    pub ztst: u8,
    pub zwe: bool,
    /// Destination alpha test through the stencil buffer
    pub date: bool,
    /// Mark pixels as they pass so each passes at most once
    pub date_one: bool,
    pub fba: bool,
}

impl DepthStencilSelector {
    pub const ZTST_NEVER: u8 = 0;
    pub const ZTST_ALWAYS: u8 = 1;
    pub const ZTST_GEQUAL: u8 = 2;
    pub const ZTST_GREATER: u8 = 3;

    pub fn key(&self) -> u32 {
        (self.ztst as u32 & 3)
            | (self.zwe as u32) << 2
            | (self.date as u32) << 3
            | (self.fba as u32) << 4
            | (self.date_one as u32) << 5
    }
}

/// Output merger blending and write mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlendSelector {
    pub wr: bool,
    pub wg: bool,
    pub wb: bool,
    pub wa: bool,
    /// Index into the hardware blend table (`A*27 + B*9 + C*3 + D`)
    pub blend_index: u8,
    /// Alpha blending enabled
    pub abe: bool,
    /// Additive ONE/ONE blending; the shader has done the multiply
    pub accu_blend: bool,
}

impl Default for BlendSelector {
    fn default() -> Self {
        Self {
            wr: true,
            wg: true,
            wb: true,
            wa: true,
            blend_index: 0,
            abe: false,
            accu_blend: false,
        }
    }
}

impl BlendSelector {
    pub fn key(&self) -> u32 {
        self.wr as u32
            | (self.wg as u32) << 1
            | (self.wb as u32) << 2
            | (self.wa as u32) << 3
            | (self.blend_index as u32 & 0x7F) << 4
            | (self.abe as u32) << 11
            | (self.accu_blend as u32) << 12
    }
}

/// Everything that identifies one draw pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineSelector {
    pub vs: VsSelector,
    pub gs: GsSelector,
    pub ps: PsSelector,
    pub dss: DepthStencilSelector,
    pub bs: BlendSelector,
    /// Input topology class: 0 points, 1 lines, 2 triangles
    pub topology: u8,
    /// Color target bound
    pub rt: bool,
    /// Depth target bound
    pub ds: bool,
}

impl PipelineSelector {
    pub const TOPOLOGY_POINT: u8 = 0;
    pub const TOPOLOGY_LINE: u8 = 1;
    pub const TOPOLOGY_TRIANGLE: u8 = 2;

    /// Packed key; distinct for every distinct selector
    pub fn key(&self) -> u128 {
        self.ps.key() as u128
            | (self.vs.key() as u128) << 64
            | (self.gs.key() as u128) << 67
            | (self.dss.key() as u128) << 73
            | (self.bs.key() as u128) << 79
            | (self.topology as u128 & 3) << 92
            | (self.rt as u128) << 94
            | (self.ds as u128) << 95
    }
}

/// Texture sampler state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SamplerSelector {
    /// Repeat horizontally (clamp otherwise)
    pub tau: bool,
    /// Repeat vertically
    pub tav: bool,
    /// Bilinear filtering
    pub biln: bool,
    /// Mip filtering: 0 off, 1 nearest, 2 linear
    pub triln: u8,
    /// Anisotropic filtering allowed
    pub aniso: bool,
    /// Sample the base level only
    pub lodclamp: bool,
}

impl SamplerSelector {
    pub fn key(&self) -> u32 {
        self.tau as u32
            | (self.tav as u32) << 1
            | (self.biln as u32) << 2
            | (self.triln as u32 & 3) << 3
            | (self.aniso as u32) << 5
            | (self.lodclamp as u32) << 6
    }

    pub fn point() -> Self {
        Self::default()
    }

    pub fn linear() -> Self {
        Self {
            biln: true,
            ..Default::default()
        }
    }
}
