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

use proptest::prelude::*;

use crate::core::backend::{SoftwareBackend, SoftwareConfig, WindowInfo};
use crate::core::device::{
    GsDevice, MergeParams, PipelineSelector, SamplerSelector, ShaderConvert, SurfaceHandle,
    SurfaceKind, COLOR_FORMAT, DEPTH_FORMAT,
};
use crate::core::error::GsError;
use crate::core::layout::{GsVertex, PsConstantBuffer, VsConstantBuffer};
use crate::core::types::{Color, Rect, RectF};

use super::{assert_valid, device, device_with, small_settings};

const OPAQUE_BLACK: [u8; 4] = [0, 0, 0, 255];
const WHITE: [u8; 4] = [255, 255, 255, 255];

fn target(dev: &mut GsDevice<SoftwareBackend>, size: u32) -> SurfaceHandle {
    dev.create_surface(SurfaceKind::RenderTarget, size, size, COLOR_FORMAT, false)
        .unwrap()
}

fn pixel(map: &crate::core::device::ReadbackMap, x: u32, y: u32) -> [u8; 4] {
    let t = map.texel(x, y);
    [t[0], t[1], t[2], t[3]]
}

#[test]
fn test_stretch_copy_and_readback() {
    let mut dev = device();
    let src = target(&mut dev, 64);
    let dst = target(&mut dev, 64);
    dev.clear_render_target(src, [0.0, 0.0, 0.0, 1.0]).unwrap();
    dev.clear_render_target(dst, [1.0; 4]).unwrap();

    dev.stretch_rect(
        src,
        RectF::unit(),
        Some(dst),
        RectF::new(16.0, 16.0, 48.0, 48.0),
        ShaderConvert::Copy,
        false,
    )
    .unwrap();

    let map = dev.readback_texture(dst, Rect::from_size(64, 64), 0).unwrap();
    assert_eq!((map.width, map.height, map.pitch), (64, 64, 256));
    for (x, y) in [(16, 16), (47, 47), (32, 20), (16, 47)] {
        assert_eq!(pixel(&map, x, y), OPAQUE_BLACK, "inside at {},{}", x, y);
    }
    for (x, y) in [(15, 16), (48, 47), (0, 0), (63, 63), (32, 15), (32, 48)] {
        assert_eq!(pixel(&map, x, y), WHITE, "border at {},{}", x, y);
    }
    assert_eq!(dev.stats().readbacks, 1);
    assert_valid(&dev);
}

#[test]
fn test_partial_readback_and_limits() {
    let mut settings = small_settings();
    settings.buffers.readback_staging = Some(16 * 16 * 4);
    let mut dev = device_with(settings, SoftwareConfig::default());
    let rt = target(&mut dev, 32);
    dev.clear_render_target(rt, [1.0, 0.0, 0.0, 1.0]).unwrap();

    let map = dev.readback_texture(rt, Rect::new(8, 8, 24, 24), 0).unwrap();
    assert_eq!((map.width, map.height), (16, 16));
    assert_eq!(pixel(&map, 15, 15), [255, 0, 0, 255]);

    assert!(matches!(
        dev.readback_texture(rt, Rect::from_size(32, 32), 0),
        Err(GsError::ReadbackTooLarge { .. })
    ));
    assert!(dev.readback_texture(rt, Rect::new(40, 40, 50, 50), 0).is_err());
}

#[test]
fn test_draw_for_readback_converts() {
    let mut dev = device();
    let rt = target(&mut dev, 16);
    dev.clear_render_target(rt, [0.0, 1.0, 0.0, 1.0]).unwrap();
    let map = dev
        .draw_for_readback(rt, RectF::unit(), 8, 8, COLOR_FORMAT, ShaderConvert::Copy)
        .unwrap();
    assert_eq!((map.width, map.height), (8, 8));
    assert_eq!(pixel(&map, 7, 7), [0, 255, 0, 255]);
    assert_eq!(dev.pooled_surface_count(), 1);
}

#[test]
fn test_stretch_into_self_is_rejected() {
    let mut dev = device();
    let rt = target(&mut dev, 8);
    let r = RectF::new(0.0, 0.0, 8.0, 8.0);
    assert!(dev
        .stretch_rect(rt, RectF::unit(), Some(rt), r, ShaderConvert::Copy, false)
        .is_err());
}

#[test]
fn test_depth_conversion_needs_depth_target() {
    let mut dev = device();
    let rt = target(&mut dev, 8);
    let other = target(&mut dev, 8);
    let r = RectF::new(0.0, 0.0, 8.0, 8.0);
    assert!(matches!(
        dev.stretch_rect(rt, RectF::unit(), Some(other), r, ShaderConvert::Rgba8ToFloat32, false),
        Err(GsError::SurfaceTypeMismatch { .. })
    ));

    let ds = dev
        .create_surface(SurfaceKind::DepthStencil, 8, 8, DEPTH_FORMAT, false)
        .unwrap();
    dev.stretch_rect(rt, RectF::unit(), Some(ds), r, ShaderConvert::Rgba8ToFloat32, false)
        .unwrap();
    assert_valid(&dev);
}

#[test]
fn test_present_cycle() {
    let mut dev = device();
    let rt = target(&mut dev, 32);
    dev.clear_render_target(rt, [1.0, 1.0, 1.0, 1.0]).unwrap();

    dev.begin_present(true).unwrap();
    assert!(dev.is_presenting());
    let swap = dev.swap_chain_info().unwrap();
    dev.stretch_rect(
        rt,
        RectF::unit(),
        None,
        RectF::new(0.0, 0.0, swap.width as f32, swap.height as f32),
        ShaderConvert::Copy,
        true,
    )
    .unwrap();
    dev.end_present().unwrap();

    assert!(!dev.is_presenting());
    assert_eq!(dev.stats().frames, 1);
    assert_eq!(dev.frame(), 1);
    let image = dev.backend().last_presented().unwrap();
    let pixels = dev.backend().read_image_rgba8(image).unwrap();
    assert_eq!(&pixels[..4], &WHITE);
    assert_valid(&dev);
}

#[test]
fn test_present_requires_begin() {
    let mut dev = device();
    assert!(dev.end_present().is_err());
    let rt = target(&mut dev, 8);
    assert!(dev
        .stretch_rect(rt, RectF::unit(), None, RectF::new(0.0, 0.0, 8.0, 8.0), ShaderConvert::Copy, false)
        .is_err());
}

#[test]
fn test_resize_rebuilds_swap_chain() {
    let mut dev = device();
    dev.begin_present(true).unwrap();
    assert!(dev.resize_window(128, 96).is_err());
    dev.end_present().unwrap();

    dev.resize_window(128, 96).unwrap();
    let swap = dev.swap_chain_info().unwrap();
    assert_eq!((swap.width, swap.height), (128, 96));

    dev.change_render_window(WindowInfo::headless(32, 32)).unwrap();
    dev.begin_present(false).unwrap();
    dev.end_present().unwrap();
    assert_eq!(dev.stats().frames, 2);
    assert_valid(&dev);
}

#[test]
fn test_merge_composites_over_background() {
    let mut dev = device();
    let circuit1 = target(&mut dev, 16);
    let out = target(&mut dev, 16);
    // Half transparent in GS terms is fully opaque after the x2 alpha scale
    dev.clear_render_target(circuit1, [1.0, 0.0, 0.0, 0.5]).unwrap();

    let full = RectF::new(0.0, 0.0, 16.0, 16.0);
    let left = RectF::new(0.0, 0.0, 8.0, 16.0);
    let params = MergeParams {
        background: Color::new(0.0, 0.0, 1.0, 1.0),
        linear: false,
        ..Default::default()
    };
    dev.do_merge(
        [Some(circuit1), None, None],
        [RectF::unit(), RectF::unit(), RectF::unit()],
        out,
        [left, full, full],
        &params,
    )
    .unwrap();

    let map = dev.readback_texture(out, Rect::from_size(16, 16), 0).unwrap();
    assert_eq!(pixel(&map, 2, 2)[..3], [255, 0, 0]);
    assert_eq!(pixel(&map, 12, 2)[..3], [0, 0, 255]);
    assert_valid(&dev);
}

#[test]
fn test_merge_feedback_write() {
    let mut dev = device();
    let circuit1 = target(&mut dev, 8);
    let out = target(&mut dev, 8);
    let feedback = target(&mut dev, 8);
    dev.clear_render_target(circuit1, [0.0, 1.0, 0.0, 1.0]).unwrap();
    let full = RectF::new(0.0, 0.0, 8.0, 8.0);
    dev.do_merge(
        [Some(circuit1), None, Some(feedback)],
        [RectF::unit(), RectF::unit(), RectF::unit()],
        out,
        [full, full, full],
        &MergeParams::default(),
    )
    .unwrap();
    let map = dev.readback_texture(feedback, Rect::from_size(8, 8), 0).unwrap();
    assert_eq!(pixel(&map, 4, 4)[..3], [0, 255, 0]);
    assert_valid(&dev);
}

#[test]
fn test_interlace_weave_keeps_one_field() {
    let mut dev = device();
    let src = target(&mut dev, 8);
    let dst = target(&mut dev, 8);
    dev.clear_render_target(src, [1.0; 4]).unwrap();
    dev.clear_render_target(dst, [0.0, 0.0, 0.0, 1.0]).unwrap();
    let full = RectF::new(0.0, 0.0, 8.0, 8.0);
    dev.do_interlace(src, RectF::unit(), dst, full, 0, false, 0.0)
        .unwrap();

    let map = dev.readback_texture(dst, Rect::from_size(8, 8), 0).unwrap();
    let written = (0..8).filter(|&y| pixel(&map, 0, y) == WHITE).count();
    assert_eq!(written, 4);
    assert_valid(&dev);
}

#[test]
fn test_date_setup_leaves_no_pass_open() {
    let mut dev = device();
    let rt = target(&mut dev, 16);
    let ds = dev
        .create_surface(SurfaceKind::DepthStencil, 16, 16, DEPTH_FORMAT, false)
        .unwrap();
    let vertices = crate::core::device::stretch_vertices(
        RectF::unit(),
        RectF::new(0.0, 0.0, 16.0, 16.0),
        16,
        16,
    );
    dev.setup_date(rt, ds, &vertices, true).unwrap();
    assert!(!dev.in_render_pass());

    dev.om_set_render_targets(Some(rt), Some(ds), Rect::from_size(16, 16))
        .unwrap();
    assert_valid(&dev);
}

// Random operation sequences

#[derive(Debug, Clone)]
enum Op {
    Clear(usize),
    Stretch(usize, usize, u8),
    Copy(usize, usize),
    Upload,
    Sample(usize),
    Draw(usize, u8),
    Readback(usize),
    Flush,
    Present(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3).prop_map(Op::Clear),
        (0usize..3, 0usize..3, 0u8..16).prop_map(|(a, b, o)| Op::Stretch(a, b, o)),
        (0usize..3, 0usize..3).prop_map(|(a, b)| Op::Copy(a, b)),
        Just(Op::Upload),
        (0usize..3).prop_map(Op::Sample),
        (0usize..3, 0u8..16).prop_map(|(a, s)| Op::Draw(a, s)),
        (0usize..3).prop_map(Op::Readback),
        Just(Op::Flush),
        (0usize..3).prop_map(Op::Present),
    ]
}

fn triangle() -> [GsVertex; 3] {
    let at = |x: u16, y: u16| GsVertex {
        xy: [x << 4, y << 4],
        rgba: [0x80; 4],
        q: 1.0,
        ..Default::default()
    };
    [at(0, 0), at(16, 0), at(0, 16)]
}

fn draw_selector(textured: bool) -> PipelineSelector {
    let mut sel = PipelineSelector {
        topology: PipelineSelector::TOPOLOGY_TRIANGLE,
        rt: true,
        ..Default::default()
    };
    sel.gs.prim = 2;
    sel.ps.tfx = if textured { 1 } else { 4 };
    sel.vs.tme = textured;
    sel
}

/// Record one draw into `rt` with a scissor shrunk by `shrink` pixels,
/// sampling `texture` when given
fn tfx_draw(
    dev: &mut GsDevice<SoftwareBackend>,
    rt: SurfaceHandle,
    texture: Option<SurfaceHandle>,
    shrink: i32,
) -> Result<(), GsError> {
    dev.ps_set_shader_resource(0, texture)?;
    dev.ps_set_sampler(0, SamplerSelector::point())?;
    dev.om_set_render_targets(Some(rt), None, Rect::new(shrink, shrink, 16 - shrink, 16 - shrink))?;
    dev.ia_set_vertex_buffer(bytemuck::cast_slice(&triangle()), std::mem::size_of::<GsVertex>() as u32)?;
    dev.setup_vs(&VsConstantBuffer {
        vertex_scale: [2.0 / 256.0, 2.0 / 256.0],
        vertex_offset: [1.0, 1.0],
        texture_scale: [1.0 / 16.0, 1.0 / 16.0],
        ..Default::default()
    })?;
    dev.setup_ps(&PsConstantBuffer::default())?;
    dev.bind_draw_pipeline(&draw_selector(texture.is_some()), 0x80)?;
    dev.draw_primitive()
}

#[test]
fn test_draw_from_mapped_vertices_matches_copied_upload() {
    let mut dev = device();
    let copied = target(&mut dev, 16);
    let mapped = target(&mut dev, 16);
    for rt in [copied, mapped] {
        dev.clear_render_target(rt, [0.0, 0.0, 0.0, 1.0]).unwrap();
    }
    tfx_draw(&mut dev, copied, None, 0).unwrap();

    // Same draw, with the vertices written straight into the stream
    dev.ps_set_shader_resource(0, None).unwrap();
    dev.om_set_render_targets(Some(mapped), None, Rect::from_size(16, 16))
        .unwrap();
    let stride = std::mem::size_of::<GsVertex>() as u32;
    dev.ia_map_vertex_buffer(stride, 3)
        .unwrap()
        .copy_from_slice(bytemuck::cast_slice(&triangle()));
    dev.ia_unmap_vertex_buffer(3).unwrap();
    dev.bind_draw_pipeline(&draw_selector(false), 0x80).unwrap();
    dev.draw_primitive().unwrap();

    let full = Rect::from_size(16, 16);
    let expected = dev.readback_texture(copied, full, 0).unwrap().data;
    let actual = dev.readback_texture(mapped, full, 0).unwrap().data;
    assert_eq!(actual, expected);
    assert_eq!(dev.stats().draws, 2);
    assert_valid(&dev);
}

fn pool_config(capacity: u32) -> SoftwareConfig {
    SoftwareConfig {
        descriptor_pool_capacity: capacity,
        ..Default::default()
    }
}

#[test]
fn test_exhausted_pool_flushes_and_retries_draw() {
    let mut dev = device_with(small_settings(), pool_config(3));
    let rt = target(&mut dev, 16);
    let textures: Vec<_> = (0..2)
        .map(|_| {
            dev.create_surface(SurfaceKind::Texture, 16, 16, COLOR_FORMAT, false)
                .unwrap()
        })
        .collect();
    for &t in &textures {
        dev.update_texture(t, Rect::from_size(16, 16), &[0x40; 16 * 16 * 4], 64, 0)
            .unwrap();
    }
    let before = dev.stats();

    // Switching textures needs a fresh set on every draw
    for i in 0..6 {
        tfx_draw(&mut dev, rt, Some(textures[i % 2]), 0).unwrap();
    }

    let after = dev.stats();
    assert_eq!(after.draws - before.draws, 6);
    assert!(after.forced_flushes > before.forced_flushes);
    assert!(dev.backend().descriptor_pool_usage() <= 3);
    dev.wait_idle().unwrap();
    assert_valid(&dev);
}

#[test]
fn test_draw_fails_when_one_draw_outgrows_the_pool() {
    // A textured draw needs a texture set and a sampler set
    let mut dev = device_with(small_settings(), pool_config(1));
    let rt = target(&mut dev, 16);
    let texture = dev
        .create_surface(SurfaceKind::Texture, 16, 16, COLOR_FORMAT, false)
        .unwrap();
    let before = dev.stats().forced_flushes;

    assert!(matches!(
        tfx_draw(&mut dev, rt, Some(texture), 0),
        Err(GsError::DescriptorPoolExhausted(_))
    ));
    assert_eq!(dev.stats().forced_flushes, before + 1);
}

#[test]
fn test_utility_draws_flush_when_pool_is_spent() {
    let mut dev = device_with(small_settings(), pool_config(1));
    let sources: Vec<_> = (0..3).map(|_| target(&mut dev, 16)).collect();
    let dst = target(&mut dev, 16);
    let before = dev.stats().forced_flushes;

    for &src in &sources {
        dev.stretch_rect(src, RectF::unit(), Some(dst), RectF::new(0.0, 0.0, 16.0, 16.0), ShaderConvert::Copy, false)
            .unwrap();
    }

    assert!(dev.stats().forced_flushes > before);
    dev.wait_idle().unwrap();
    assert_valid(&dev);
}

#[test]
fn test_utility_draw_fails_without_any_pool() {
    let mut dev = device_with(small_settings(), pool_config(0));
    let src = target(&mut dev, 16);
    let dst = target(&mut dev, 16);
    assert!(matches!(
        dev.stretch_rect(src, RectF::unit(), Some(dst), RectF::new(0.0, 0.0, 16.0, 16.0), ShaderConvert::Copy, false),
        Err(GsError::DescriptorPoolExhausted(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any sequence of public operations leaves every image in the layout
    /// its next use expects, and every draw inside a pass covering it
    #[test]
    fn prop_operations_keep_layouts_and_passes_valid(
        ops in prop::collection::vec(op_strategy(), 1..24),
        latency in prop::option::of(0usize..3),
    ) {
        let config = SoftwareConfig { gpu_latency: latency, ..Default::default() };
        let mut dev = device_with(small_settings(), config);
        let rts: Vec<_> = (0..3).map(|_| target(&mut dev, 16)).collect();
        let texture = dev
            .create_surface(SurfaceKind::Texture, 16, 16, COLOR_FORMAT, false)
            .unwrap();
        dev.update_texture(texture, Rect::from_size(16, 16), &[0x7F; 16 * 16 * 4], 64, 0)
            .unwrap();
        let full = RectF::new(0.0, 0.0, 16.0, 16.0);

        for op in ops {
            match op {
                Op::Clear(i) => dev.clear_render_target(rts[i], [0.25; 4]).unwrap(),
                Op::Stretch(a, b, offset) => {
                    if a != b {
                        let o = offset as f32;
                        dev.stretch_rect(rts[a], RectF::unit(), Some(rts[b]), RectF::new(o, o, 16.0, 16.0), ShaderConvert::Copy, false)
                            .unwrap();
                    }
                }
                Op::Copy(a, b) => {
                    if a != b {
                        dev.copy_rect(rts[a], rts[b], Rect::from_size(8, 8), 4, 4).unwrap();
                    }
                }
                Op::Upload => dev
                    .update_texture(texture, Rect::new(4, 4, 12, 12), &[0x10; 8 * 8 * 4], 32, 0)
                    .unwrap(),
                Op::Sample(i) => dev
                    .stretch_rect(texture, RectF::unit(), Some(rts[i]), full, ShaderConvert::Copy, true)
                    .unwrap(),
                Op::Draw(i, shrink) => {
                    let textured = shrink % 2 == 0;
                    tfx_draw(&mut dev, rts[i], textured.then_some(texture), (shrink % 8) as i32).unwrap();
                    let area = dev.render_pass_state().area().unwrap();
                    prop_assert!(area.contains(&dev.state().scissor));
                }
                Op::Readback(i) => {
                    dev.readback_texture(rts[i], Rect::from_size(16, 16), 0).unwrap();
                }
                Op::Flush => dev.execute_command_buffer(false).unwrap(),
                Op::Present(i) => {
                    dev.begin_present(i == 0).unwrap();
                    dev.stretch_rect(rts[i], RectF::unit(), None, RectF::new(0.0, 0.0, 8.0, 8.0), ShaderConvert::Copy, true)
                        .unwrap();
                    dev.end_present().unwrap();
                }
            }
        }
        dev.wait_idle().unwrap();
        let errors = dev.backend().validation_errors();
        prop_assert!(errors.is_empty(), "{:#?}", errors);
    }
}
