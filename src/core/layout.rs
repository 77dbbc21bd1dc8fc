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

//! GPU-visible data layouts
//!
//! Vertex formats, uniform blocks and push constant blocks shared between the
//! device (which uploads them through the stream buffers as raw bytes) and the
//! backends (which read them back when executing draws). Every struct is
//! `#[repr(C)]` and `Pod`, with no implicit padding.

use bytemuck::{Pod, Zeroable};

/// Vertex used by conversion, merge, interlace and present draws
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct UtilityVertex {
    /// Clip-space position (y up)
    pub pos: [f32; 4],
    /// Normalized texture coordinate
    pub uv: [f32; 2],
}

impl UtilityVertex {
    pub const fn new(x: f32, y: f32, u: f32, v: f32) -> Self {
        Self {
            pos: [x, y, 0.5, 1.0],
            uv: [u, v],
        }
    }
}

/// Vertex as assembled from GS vertex kick registers
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct GsVertex {
    /// ST texture coordinates (perspective)
    pub st: [f32; 2],
    /// RGBA vertex color, 0x80 = 1.0
    pub rgba: [u8; 4],
    /// Q perspective divisor
    pub q: f32,
    /// Window coordinates in 12.4 fixed point
    pub xy: [u16; 2],
    /// Depth value in the destination Z format's range
    pub z: u32,
    /// UV texel coordinates in 10.4 fixed point
    pub uv: [u16; 2],
    /// Fog coefficient (low byte)
    pub fog: u32,
}

/// Vertex shader uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct VsConstantBuffer {
    pub vertex_scale: [f32; 2],
    pub vertex_offset: [f32; 2],
    /// Reciprocal texture size, applied to fixed-point UVs
    pub texture_scale: [f32; 2],
    /// Point/line expansion half-extent in clip space
    pub point_size: [f32; 2],
    pub max_depth: u32,
    pub _pad: [u32; 3],
}

/// Fragment shader uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PsConstantBuffer {
    /// Fog color (0..255) and alpha reference
    pub fog_color_aref: [f32; 4],
    /// TA0, TA1, alpha FIX (all 0..255) and normalized max depth
    pub ta_afix_max_depth: [f32; 4],
    /// Texture width/height, render target width/height
    pub wh: [f32; 4],
    /// Region clamp bounds (normalized), or masks and fix values for region repeat
    pub min_max: [f32; 4],
}

/// Push constants for interlace shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct InterlaceConstants {
    /// (0, 1/height)
    pub zr_h: [f32; 2],
    /// height / 2
    pub h_h: f32,
    pub _pad: f32,
}

/// Push constants for merge shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct MergeConstants {
    pub bg_color: [f32; 4],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<UtilityVertex>(), 24);
        assert_eq!(std::mem::size_of::<GsVertex>(), 32);
        assert_eq!(std::mem::size_of::<VsConstantBuffer>(), 48);
        assert_eq!(std::mem::size_of::<PsConstantBuffer>(), 64);
        assert_eq!(std::mem::size_of::<InterlaceConstants>(), 16);
    }

    #[test]
    fn test_vertex_bytes_read_back() {
        let v = GsVertex {
            rgba: [1, 2, 3, 4],
            xy: [16, 32],
            z: 0xDEAD_BEEF,
            ..Default::default()
        };
        let bytes = bytemuck::bytes_of(&v);
        let back: GsVertex = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(back, v);
    }
}
