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

//! Renderer throughput benchmarks on the software backend
//!
//! `GSRX_BENCH_PROFILE=ci` shortens the timing budget.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use gsrx::core::backend::{SoftwareBackend, WindowInfo};
use gsrx::core::config::RendererSettings;
use gsrx::core::device::{hw_blend, PipelineSelector};
use gsrx::core::gs::{
    registers::encode, Psm, PREG_DISPFB1, PREG_DISPLAY1, PREG_PMODE, REG_ALPHA_1, REG_FRAME_1, REG_PRIM,
    REG_SCISSOR_1,
};
use gsrx::core::layout::GsVertex;
use gsrx::core::memory::LinearMemory;
use gsrx::core::renderer::HwRenderer;

fn criterion_config() -> Criterion {
    match std::env::var("GSRX_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(10),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50),
    }
}

fn renderer() -> HwRenderer<SoftwareBackend, LinearMemory> {
    let mut settings = RendererSettings::default();
    settings.bilinear_filtering = false;
    let mut gs = HwRenderer::software(settings, WindowInfo::headless(640, 448))
        .expect("software renderer");
    gs.write_register(REG_FRAME_1, encode::frame(0, 10, Psm::Ct32, 0));
    gs.write_register(REG_SCISSOR_1, encode::scissor(0, 639, 0, 447));
    gs.write_privileged(PREG_PMODE, encode::pmode(true, false, false, false, 0xFF));
    gs.write_privileged(PREG_DISPFB1, encode::dispfb(0, 10, Psm::Ct32, 0, 0));
    gs.write_privileged(PREG_DISPLAY1, encode::display(640, 448));
    gs
}

fn sprite(size: u16, rgba: [u8; 4]) -> [GsVertex; 2] {
    let corner = |x: u16, y: u16| GsVertex {
        xy: [x << 4, y << 4],
        rgba,
        q: 1.0,
        ..Default::default()
    };
    [corner(0, 0), corner(size, size)]
}

fn bench_sprite_draws(c: &mut Criterion) {
    let mut group = c.benchmark_group("sprite_draw");
    for (name, abe) in [("opaque", false), ("blended", true)] {
        let mut gs = renderer();
        gs.write_register(REG_ALPHA_1, encode::alpha(0, 1, 0, 1, 0));
        gs.write_register(REG_PRIM, encode::prim(6, false, false, abe, false, 0));
        let vertices = sprite(64, [0x80, 0x40, 0x20, 0x40]);
        group.bench_with_input(BenchmarkId::from_parameter(name), &vertices, |b, v| {
            b.iter(|| gs.draw(0, black_box(v), &[]))
        });
    }
    group.finish();
}

fn bench_pipeline_keys(c: &mut Criterion) {
    let mut sel = PipelineSelector::default();
    c.bench_function("pipeline_key", |b| {
        b.iter(|| {
            sel.ps.atst = sel.ps.atst.wrapping_add(1) & 7;
            black_box(sel.key())
        })
    });
    c.bench_function("hw_blend_table", |b| {
        b.iter(|| (0..81u8).map(|i| hw_blend(black_box(i)).flags.bits() as u32).sum::<u32>())
    });
}

fn bench_vsync(c: &mut Criterion) {
    let mut gs = renderer();
    gs.write_register(REG_PRIM, encode::prim(6, false, false, false, false, 0));
    let _ = gs.draw(0, &sprite(256, [0x80, 0, 0, 0x80]), &[]);
    let mut field = false;
    c.bench_function("vsync_present", |b| {
        b.iter(|| {
            field = !field;
            gs.vsync(black_box(field))
        })
    });
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_sprite_draws, bench_pipeline_keys, bench_vsync
}
criterion_main!(benches);
