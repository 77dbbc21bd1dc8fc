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

use crate::core::backend::SoftwareConfig;
use crate::core::error::GsError;
use crate::core::gs::{
    registers::encode, Psm, REG_ALPHA_1, REG_FRAME_1, REG_PRIM, REG_SCISSOR_1, REG_TEST_1, REG_TEX0_1,
    REG_ZBUF_1,
};
use crate::core::layout::GsVertex;
use crate::core::memory::VramRegion;
use crate::core::types::Rect;

use super::{assert_valid, pixel, renderer, renderer_with, sprite, vertex, BLUE, GREEN, RED, SPRITE};

const ZTST_GEQUAL: u64 = 2;

#[test]
fn test_sprite_fills_its_rectangle() {
    let mut gs = renderer();
    sprite(&mut gs, Rect::new(4, 4, 12, 12), RED);

    assert_eq!(pixel(&mut gs, 4, 4), RED);
    assert_eq!(pixel(&mut gs, 11, 11), RED);
    assert_eq!(pixel(&mut gs, 3, 3), [0; 4]);
    assert_eq!(pixel(&mut gs, 12, 12), [0; 4]);
    assert_eq!(gs.stats().draws, 1);
    assert_valid(&gs);
}

#[test]
fn test_scissor_clips() {
    let mut gs = renderer();
    gs.write_register(REG_SCISSOR_1, encode::scissor(0, 7, 0, 7));
    sprite(&mut gs, Rect::new(4, 4, 12, 12), RED);

    assert_eq!(pixel(&mut gs, 7, 7), RED);
    assert_eq!(pixel(&mut gs, 8, 8), [0; 4]);

    // Entirely outside: nothing is recorded
    sprite(&mut gs, Rect::new(20, 20, 30, 30), RED);
    assert_eq!(gs.stats().skipped_draws, 1);
    assert_eq!(gs.stats().draws, 1);
}

#[test]
fn test_decal_texture_is_sampled() {
    let mut gs = renderer();
    let texels: Vec<u8> = GREEN.iter().copied().cycle().take(8 * 8 * 4).collect();
    let region = VramRegion::new(128, 1, Psm::Ct32, Rect::from_size(8, 8));
    gs.write_local_memory(&region, &texels).unwrap();

    gs.write_register(REG_TEX0_1, encode::tex0(128, 1, Psm::Ct32, 3, 3, true, 1));
    gs.write_register(REG_PRIM, encode::prim(SPRITE, false, true, false, true, 0));
    let mut v0 = vertex(4, 4, RED);
    let mut v1 = vertex(12, 12, RED);
    v0.uv = [0, 0];
    v1.uv = [8 << 4, 8 << 4];
    gs.draw(0, &[v0, v1], &[]).unwrap();

    assert_eq!(pixel(&mut gs, 5, 5), GREEN);
    assert_eq!(pixel(&mut gs, 11, 4), GREEN);
    assert_eq!(gs.cache().stats().sources_created, 1);
    assert_valid(&gs);
}

#[test]
fn test_failing_alpha_test_with_keep_is_skipped() {
    let mut gs = renderer();
    gs.write_register(REG_TEST_1, encode::test(true, 0, 0, false, false, false, 0));
    sprite(&mut gs, Rect::new(0, 0, 8, 8), RED);

    assert_eq!(gs.stats().skipped_draws, 1);
    assert_eq!(gs.device().stats().draws, 0);
    assert_eq!(pixel(&mut gs, 2, 2), [0; 4]);
}

#[test]
fn test_depth_test_and_write() {
    let mut gs = renderer();
    gs.write_register(REG_ZBUF_1, encode::zbuf(4, Psm::Z32, false));
    gs.write_register(REG_TEST_1, encode::test(false, 0, 0, false, false, true, ZTST_GEQUAL));
    gs.write_register(REG_PRIM, encode::prim(SPRITE, false, false, false, false, 0));

    let near = |x, y| GsVertex { z: 100, ..vertex(x, y, RED) };
    gs.draw(0, &[near(4, 4), near(12, 12)], &[]).unwrap();
    // Farther than what's stored: rejected
    let far = |x, y| GsVertex { z: 50, ..vertex(x, y, GREEN) };
    gs.draw(0, &[far(4, 4), far(12, 12)], &[]).unwrap();

    assert_eq!(pixel(&mut gs, 6, 6), RED);
    let depth = gs
        .read_local_memory(&VramRegion::new(128, 1, Psm::Z32, Rect::new(6, 6, 7, 7)))
        .unwrap();
    assert_eq!(u32::from_le_bytes([depth[0], depth[1], depth[2], depth[3]]), 100);
    assert_valid(&gs);
}

#[test]
fn test_alpha_blend_mixes_with_frame() {
    let mut gs = renderer();
    sprite(&mut gs, Rect::new(0, 0, 8, 8), BLUE);

    // (Cs - Cd) * As + Cd with As = 0.5
    gs.write_register(REG_ALPHA_1, encode::alpha(0, 1, 0, 1, 0));
    gs.write_register(REG_PRIM, encode::prim(SPRITE, false, false, true, false, 0));
    let half = [0xFF, 0, 0, 0x40];
    gs.draw(0, &[vertex(0, 0, half), vertex(8, 8, half)], &[]).unwrap();

    let p = pixel(&mut gs, 3, 3);
    assert!(p[0].abs_diff(128) <= 1, "red {}", p[0]);
    assert_eq!(p[1], 0);
    assert!(p[2].abs_diff(128) <= 1, "blue {}", p[2]);
    assert_valid(&gs);
}

#[test]
fn test_sampling_own_target_goes_through_a_copy() {
    let mut gs = renderer();
    sprite(&mut gs, Rect::new(0, 0, 32, 32), RED);

    gs.write_register(REG_TEX0_1, encode::tex0(0, 1, Psm::Ct32, 6, 6, true, 1));
    gs.write_register(REG_PRIM, encode::prim(SPRITE, false, true, false, true, 0));
    let mut v0 = vertex(32, 0, BLUE);
    let mut v1 = vertex(64, 32, BLUE);
    v0.uv = [0, 0];
    v1.uv = [32 << 4, 32 << 4];
    gs.draw(0, &[v0, v1], &[]).unwrap();

    assert_eq!(gs.stats().target_copies, 1);
    assert_eq!(gs.cache().stats().target_source_hits, 1);
    assert_eq!(pixel(&mut gs, 40, 10), RED);
    assert_valid(&gs);
}

#[test]
fn test_frame_and_depth_aliasing_drops_the_draw() {
    let mut gs = renderer();
    gs.write_register(REG_ZBUF_1, encode::zbuf(0, Psm::Z32, false));
    gs.write_register(REG_TEST_1, encode::test(false, 0, 0, false, false, true, ZTST_GEQUAL));
    sprite(&mut gs, Rect::new(0, 0, 8, 8), RED);

    assert_eq!(gs.device().stats().dropped_draws, 1);
    assert_eq!(gs.stats().draws, 0);
}

#[test]
fn test_pipeline_failure_drops_the_draw() {
    let config = SoftwareConfig {
        fail_shader_containing: Some("#define PS_FOG 1\n".to_string()),
        ..Default::default()
    };
    let mut gs = renderer_with(config);
    gs.write_register(REG_FRAME_1, encode::frame(0, 1, Psm::Ct32, 0));
    gs.write_register(REG_SCISSOR_1, encode::scissor(0, 63, 0, 63));

    let fogged = encode::prim(SPRITE, false, false, false, false, 0) | 1 << 5;
    gs.write_register(REG_PRIM, fogged);
    gs.draw(0, &[vertex(0, 0, RED), vertex(8, 8, RED)], &[]).unwrap();
    assert_eq!(gs.device().stats().dropped_draws, 1);

    // The next draw is unaffected
    sprite(&mut gs, Rect::new(0, 0, 8, 8), GREEN);
    assert_eq!(pixel(&mut gs, 1, 1), GREEN);
    assert_eq!(gs.stats().draws, 1);
}

#[test]
fn test_index_out_of_range_is_rejected() {
    let mut gs = renderer();
    gs.write_register(REG_PRIM, encode::prim(3, false, false, false, false, 0));
    let vertices = [vertex(0, 0, RED), vertex(8, 0, RED), vertex(0, 8, RED)];
    let result = gs.draw(0, &vertices, &[0, 1, 3]);
    assert!(matches!(result, Err(GsError::InvalidPrimitive(_))));
    assert_eq!(gs.device().stats().draws, 0);
}

#[test]
fn test_triangle_strip_is_unrolled() {
    let mut gs = renderer();
    gs.write_register(REG_PRIM, encode::prim(4, false, false, false, false, 0));
    let quad = [
        vertex(0, 0, GREEN),
        vertex(16, 0, GREEN),
        vertex(0, 16, GREEN),
        vertex(16, 16, GREEN),
    ];
    gs.draw(0, &quad, &[]).unwrap();

    assert_eq!(pixel(&mut gs, 1, 13), GREEN);
    assert_eq!(pixel(&mut gs, 14, 1), GREEN);
    assert_eq!(pixel(&mut gs, 14, 14), GREEN);
    assert_eq!(pixel(&mut gs, 17, 17), [0; 4]);
}

#[test]
fn test_host_writes_and_draws_stay_coherent() {
    let mut gs = renderer();
    sprite(&mut gs, Rect::new(0, 0, 8, 8), RED);

    let green: Vec<u8> = GREEN.iter().copied().cycle().take(4 * 4 * 4).collect();
    let region = VramRegion::new(0, 1, Psm::Ct32, Rect::new(0, 0, 4, 4));
    gs.write_local_memory(&region, &green).unwrap();

    assert_eq!(pixel(&mut gs, 1, 1), GREEN);
    assert_eq!(pixel(&mut gs, 6, 6), RED);

    // A later draw over the host data lands on top of it
    sprite(&mut gs, Rect::new(2, 2, 3, 3), BLUE);
    assert_eq!(pixel(&mut gs, 2, 2), BLUE);
    assert_eq!(pixel(&mut gs, 1, 1), GREEN);
    assert_valid(&gs);
}
