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

use crate::core::backend::SoftwareConfig;
use crate::core::device::{
    DepthStencilSelector, PipelineSelector, ShaderConvert, SurfaceKind, UtilityKey, UtilityProgram,
    UtilityTarget, COLOR_FORMAT,
};

use super::{device, device_with, small_settings};

fn draw_selector() -> PipelineSelector {
    let mut sel = PipelineSelector {
        topology: PipelineSelector::TOPOLOGY_TRIANGLE,
        rt: true,
        ..Default::default()
    };
    sel.gs.prim = 2;
    sel.ps.tfx = 4;
    sel
}

#[test]
fn test_standard_pipelines_exist_after_init() {
    let dev = device();
    let pipelines = dev.pipelines();
    // Every conversion, Present variants, two merges and four interlaces
    let present = ShaderConvert::ALL.iter().filter(|s| s.is_present()).count();
    assert_eq!(
        pipelines.utility_count(),
        ShaderConvert::COUNT + present + 2 + 4
    );
    assert_eq!(pipelines.tfx_count(), 0);
}

#[test]
fn test_same_selector_hits_cache() {
    let mut dev = device();
    let rt = dev
        .create_surface(SurfaceKind::RenderTarget, 8, 8, COLOR_FORMAT, false)
        .unwrap();
    dev.om_set_render_targets(Some(rt), None, crate::core::types::Rect::from_size(8, 8))
        .unwrap();

    let sel = draw_selector();
    dev.bind_draw_pipeline(&sel, 0x80).unwrap();
    let live = dev.backend().live_pipeline_count();
    dev.bind_draw_pipeline(&sel, 0x80).unwrap();
    assert_eq!(dev.backend().live_pipeline_count(), live);
    assert_eq!(dev.pipelines().tfx_count(), 1);

    let mut other = sel;
    other.ps.atst = 4;
    dev.bind_draw_pipeline(&other, 0x80).unwrap();
    assert_eq!(dev.pipelines().tfx_count(), 2);
    assert!(dev.pipelines().contains_tfx(&other));
}

#[test]
fn test_failed_pipeline_is_an_error_not_a_panic() {
    let config = SoftwareConfig {
        fail_shader_containing: Some("#define PS_ATST 5".to_string()),
        ..Default::default()
    };
    let mut dev = device_with(small_settings(), config);
    let rt = dev
        .create_surface(SurfaceKind::RenderTarget, 8, 8, COLOR_FORMAT, false)
        .unwrap();
    dev.om_set_render_targets(Some(rt), None, crate::core::types::Rect::from_size(8, 8))
        .unwrap();

    let mut sel = draw_selector();
    sel.ps.atst = 5;
    assert!(dev.bind_draw_pipeline(&sel, 0x80).is_err());
    assert!(!dev.pipelines().contains_tfx(&sel));

    // Unaffected selectors still build
    sel.ps.atst = 1;
    assert!(dev.bind_draw_pipeline(&sel, 0x80).is_ok());
}

#[test]
fn test_utility_keys_are_distinct_per_target() {
    let mut dev = device();
    let before = dev.pipelines().utility_count();
    let key = UtilityKey::new(
        UtilityProgram::Convert(ShaderConvert::Copy),
        UtilityTarget::Color(COLOR_FORMAT),
    );
    let masked = key.masked(crate::core::backend::ColorWriteMask::R);
    let rt = dev
        .create_surface(SurfaceKind::RenderTarget, 8, 8, COLOR_FORMAT, false)
        .unwrap();
    let src = dev
        .create_surface(SurfaceKind::RenderTarget, 8, 8, COLOR_FORMAT, false)
        .unwrap();
    let r = crate::core::types::RectF::new(0.0, 0.0, 8.0, 8.0);
    dev.stretch_rect_masked(src, crate::core::types::RectF::unit(), rt, r, true, false, false, false)
        .unwrap();
    assert_eq!(dev.pipelines().utility_count(), before + 1);
    assert_ne!(key, masked);
}

#[test]
fn test_warmup_index_rebuilds_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipelines.bin");

    let mut sels = Vec::new();
    {
        let mut dev = device();
        let rt = dev
            .create_surface(SurfaceKind::RenderTarget, 8, 8, COLOR_FORMAT, false)
            .unwrap();
        dev.om_set_render_targets(Some(rt), None, crate::core::types::Rect::from_size(8, 8))
            .unwrap();
        for atst in 0..3 {
            let mut sel = draw_selector();
            sel.ps.atst = atst;
            dev.bind_draw_pipeline(&sel, 0x80).unwrap();
            sels.push(sel);
        }
        dev.save_pipeline_warmup(&path).unwrap();
    }

    let mut dev = device();
    assert_eq!(dev.warm_up_pipelines(&path).unwrap(), 3);
    for sel in &sels {
        assert!(dev.pipelines().contains_tfx(sel));
    }
}

#[test]
fn test_corrupt_warmup_index_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipelines.bin");
    std::fs::write(&path, b"not an index").unwrap();
    let mut dev = device();
    assert!(dev.warm_up_pipelines(&path).is_err());
}

fn selector_strategy() -> impl Strategy<Value = PipelineSelector> {
    (
        0u8..5,
        0u8..3,
        any::<bool>(),
        0u8..4,
        any::<bool>(),
        0u8..3,
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(tfx, atst, fog, ztst, zwe, blend_index, abe, ds)| {
            let mut sel = draw_selector();
            sel.ps.tfx = tfx;
            sel.ps.atst = atst;
            sel.ps.fog = fog;
            sel.dss = DepthStencilSelector {
                ztst,
                zwe,
                ..Default::default()
            };
            sel.bs.blend_index = blend_index;
            sel.bs.abe = abe;
            sel.ds = ds;
            sel
        })
}

proptest! {
    /// Packed keys identify selectors exactly
    #[test]
    fn prop_key_equality_matches_selector_equality(a in selector_strategy(), b in selector_strategy()) {
        prop_assert_eq!(a == b, a.key() == b.key());
    }
}
