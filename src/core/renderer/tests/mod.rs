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

mod draw;
mod present;

use crate::core::backend::{SoftwareBackend, SoftwareConfig, WindowInfo};
use crate::core::config::RendererSettings;
use crate::core::device::{EmbeddedShaders, GsDevice};
use crate::core::gs::{registers::encode, Psm, REG_FRAME_1, REG_PRIM, REG_SCISSOR_1};
use crate::core::layout::GsVertex;
use crate::core::memory::{LinearMemory, VramRegion};
use crate::core::types::Rect;

use super::HwRenderer;

const KIB: u64 = 1024;
const SPRITE: u64 = 6;

const RED: [u8; 4] = [0xFF, 0, 0, 0x80];
const GREEN: [u8; 4] = [0, 0xFF, 0, 0x80];
const BLUE: [u8; 4] = [0, 0, 0xFF, 0x80];

fn settings() -> RendererSettings {
    let mut settings = RendererSettings::default();
    settings.buffers.texture_upload = 256 * KIB;
    settings.buffers.vertex = 64 * KIB;
    settings.buffers.index = 64 * KIB;
    settings.buffers.vertex_uniform = 64 * KIB;
    settings.buffers.fragment_uniform = 64 * KIB;
    settings.buffers.readback_staging = Some(256 * KIB);
    settings.bilinear_filtering = false;
    settings.linear_present = false;
    settings
}

fn renderer_with(config: SoftwareConfig) -> HwRenderer<SoftwareBackend> {
    let dev = GsDevice::new(
        SoftwareBackend::with_config(config),
        settings(),
        WindowInfo::headless(64, 64),
        Box::new(EmbeddedShaders),
    )
    .unwrap();
    HwRenderer::new(dev, LinearMemory::new())
}

/// Renderer drawing into a 64x64 CT32 frame buffer at block 0
fn renderer() -> HwRenderer<SoftwareBackend> {
    let mut gs = renderer_with(SoftwareConfig::default());
    gs.write_register(REG_FRAME_1, encode::frame(0, 1, Psm::Ct32, 0));
    gs.write_register(REG_SCISSOR_1, encode::scissor(0, 63, 0, 63));
    gs
}

fn vertex(x: u16, y: u16, rgba: [u8; 4]) -> GsVertex {
    GsVertex {
        xy: [x << 4, y << 4],
        rgba,
        q: 1.0,
        ..Default::default()
    }
}

/// Untextured flat sprite covering `rect`
fn sprite(gs: &mut HwRenderer<SoftwareBackend>, rect: Rect, rgba: [u8; 4]) {
    gs.write_register(REG_PRIM, encode::prim(SPRITE, false, false, false, false, 0));
    let v0 = vertex(rect.left as u16, rect.top as u16, rgba);
    let v1 = vertex(rect.right as u16, rect.bottom as u16, rgba);
    gs.draw(0, &[v0, v1], &[]).unwrap();
}

/// CT32 pixel of the frame buffer at block `bp`, through local memory
fn pixel_at(gs: &mut HwRenderer<SoftwareBackend>, bp: u32, x: i32, y: i32) -> [u8; 4] {
    let region = VramRegion::new(bp, 1, Psm::Ct32, Rect::new(x, y, x + 1, y + 1));
    let bytes = gs.read_local_memory(&region).unwrap();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn pixel(gs: &mut HwRenderer<SoftwareBackend>, x: i32, y: i32) -> [u8; 4] {
    pixel_at(gs, 0, x, y)
}

fn assert_valid(gs: &HwRenderer<SoftwareBackend>) {
    let errors = gs.device().backend().validation_errors();
    assert!(errors.is_empty(), "validation errors: {:#?}", errors);
}
