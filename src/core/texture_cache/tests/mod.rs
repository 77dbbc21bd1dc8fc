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

mod sources;

use crate::core::backend::{SoftwareBackend, WindowInfo};
use crate::core::config::RendererSettings;
use crate::core::device::{EmbeddedShaders, GsDevice, SurfaceHandle};
use crate::core::memory::{LinearMemory, LocalMemory};
use crate::core::types::Rect;

const KIB: u64 = 1024;

fn settings() -> RendererSettings {
    let mut settings = RendererSettings::default();
    settings.buffers.texture_upload = 256 * KIB;
    settings.buffers.vertex = 64 * KIB;
    settings.buffers.index = 64 * KIB;
    settings.buffers.vertex_uniform = 64 * KIB;
    settings.buffers.fragment_uniform = 64 * KIB;
    settings.buffers.readback_staging = Some(256 * KIB);
    settings
}

fn device_with(settings: RendererSettings) -> GsDevice<SoftwareBackend> {
    GsDevice::new(
        SoftwareBackend::new(),
        settings,
        WindowInfo::headless(64, 64),
        Box::new(EmbeddedShaders),
    )
    .unwrap()
}

fn device() -> GsDevice<SoftwareBackend> {
    device_with(settings())
}

/// Read a 32-bit RGBA8 texel of a color surface
fn surface_pixel(dev: &mut GsDevice<SoftwareBackend>, surface: SurfaceHandle, x: i32, y: i32) -> [u8; 4] {
    let map = dev.readback_texture(surface, Rect::new(x, y, x + 1, y + 1), 0).unwrap();
    let t = map.texel(0, 0);
    [t[0], t[1], t[2], t[3]]
}

/// Local memory that records every pixel write
#[derive(Default)]
struct RecordingMemory {
    inner: LinearMemory,
    writes: Vec<(u32, u32, u32, u32)>,
}

impl RecordingMemory {
    fn record(&mut self, bp: u32, bw: u32, x: u32, y: u32) {
        self.writes.push((bp, bw, x, y));
    }
}

impl LocalMemory for RecordingMemory {
    fn write_pixel32(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u32) {
        self.record(bp, bw, x, y);
        self.inner.write_pixel32(bp, bw, x, y, value);
    }

    fn write_pixel24(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u32) {
        self.record(bp, bw, x, y);
        self.inner.write_pixel24(bp, bw, x, y, value);
    }

    fn write_pixel16(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u16) {
        self.record(bp, bw, x, y);
        self.inner.write_pixel16(bp, bw, x, y, value);
    }

    fn write_pixel8(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u8) {
        self.record(bp, bw, x, y);
        self.inner.write_pixel8(bp, bw, x, y, value);
    }

    fn write_pixel4(&mut self, bp: u32, bw: u32, x: u32, y: u32, value: u8) {
        self.record(bp, bw, x, y);
        self.inner.write_pixel4(bp, bw, x, y, value);
    }

    fn read_pixel32(&self, bp: u32, bw: u32, x: u32, y: u32) -> u32 {
        self.inner.read_pixel32(bp, bw, x, y)
    }

    fn read_pixel16(&self, bp: u32, bw: u32, x: u32, y: u32) -> u16 {
        self.inner.read_pixel16(bp, bw, x, y)
    }

    fn read_pixel8(&self, bp: u32, bw: u32, x: u32, y: u32) -> u8 {
        self.inner.read_pixel8(bp, bw, x, y)
    }

    fn read_pixel4(&self, bp: u32, bw: u32, x: u32, y: u32) -> u8 {
        self.inner.read_pixel4(bp, bw, x, y)
    }
}
