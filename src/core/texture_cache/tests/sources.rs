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

use crate::core::gs::{Clamp, Psm, Tex0};
use crate::core::memory::{LinearMemory, LocalMemory, VramRegion};
use crate::core::texture_cache::{sampled_rect, TextureCache, SOURCE_MAX_AGE};
use crate::core::types::Rect;

use super::{device, surface_pixel};

/// 8x8 texture at block 64
fn tex0(psm: Psm) -> Tex0 {
    Tex0 {
        tbp0: 64,
        tbw: 1,
        psm,
        tw: 3,
        th: 3,
        ..Default::default()
    }
}

#[test]
fn test_upload_then_reuse() {
    let mut dev = device();
    let mut mem = LinearMemory::new();
    mem.write_pixel32(64, 1, 2, 3, 0x8000_FF00);
    let mut cache = TextureCache::new();
    let t = tex0(Psm::Ct32);

    let first = cache.lookup_source(&mut dev, &mut mem, &t, &Clamp::default()).unwrap();
    assert!(!first.from_target);
    assert_eq!((first.width, first.height), (8, 8));
    assert_eq!(surface_pixel(&mut dev, first.surface, 2, 3), [0x00, 0xFF, 0x00, 0x80]);

    let second = cache.lookup_source(&mut dev, &mut mem, &t, &Clamp::default()).unwrap();
    assert_eq!(first, second);
    let stats = cache.stats();
    assert_eq!((stats.sources_created, stats.source_hits), (1, 1));
}

#[test]
fn test_texture_at_target_samples_the_target() {
    let mut dev = device();
    let mut mem = LinearMemory::new();
    let mut cache = TextureCache::new();
    let rt = cache.lookup_target(&mut dev, &mut mem, 64, 1, Psm::Ct32, 32).unwrap();

    let binding = cache.lookup_source(&mut dev, &mut mem, &tex0(Psm::Ct32), &Clamp::default()).unwrap();
    assert!(binding.from_target);
    assert_eq!(binding.surface, rt);
    assert_eq!((binding.width, binding.height), (64, 32));
    assert_eq!(cache.source_count(), 0);
}

#[test]
fn test_cpu_write_drops_overlapping_sources() {
    let mut dev = device();
    let mut mem = LinearMemory::new();
    let mut cache = TextureCache::new();
    cache.lookup_source(&mut dev, &mut mem, &tex0(Psm::Ct32), &Clamp::default()).unwrap();
    assert_eq!(cache.source_count(), 1);

    // Elsewhere in memory
    let far = VramRegion::new(1024, 1, Psm::Ct32, Rect::new(0, 0, 8, 8));
    cache.invalidate_video_mem(&mut dev, &mem, &far).unwrap();
    assert_eq!(cache.source_count(), 1);

    let near = VramRegion::new(64, 1, Psm::Ct32, Rect::new(0, 4, 8, 5));
    cache.invalidate_video_mem(&mut dev, &mem, &near).unwrap();
    assert_eq!(cache.source_count(), 0);
}

#[test]
fn test_paletted_texture_follows_clut_changes() {
    let mut dev = device();
    let mut mem = LinearMemory::new();
    let t = Tex0 {
        cbp: 256,
        cpsm: Psm::Ct32,
        ..tex0(Psm::T8)
    };
    // Every texel indexes entry 1
    for y in 0..8 {
        for x in 0..8 {
            mem.write_pixel(Psm::T8, 64, 1, x, y, 1);
        }
    }
    mem.write_pixel32(256, 1, 1, 0, 0x8000_00FF);
    let mut cache = TextureCache::new();

    let first = cache.lookup_source(&mut dev, &mut mem, &t, &Clamp::default()).unwrap();
    assert_eq!(surface_pixel(&mut dev, first.surface, 4, 4), [0xFF, 0, 0, 0x80]);

    mem.write_pixel32(256, 1, 1, 0, 0x80FF_0000);
    let second = cache.lookup_source(&mut dev, &mut mem, &t, &Clamp::default()).unwrap();
    assert_eq!(surface_pixel(&mut dev, second.surface, 4, 4), [0, 0, 0xFF, 0x80]);
    assert_eq!(cache.source_count(), 1);
    assert_eq!(cache.stats().sources_created, 2);
}

#[test]
fn test_dirty_target_under_texture_is_written_back_first() {
    let mut dev = device();
    let mut mem = LinearMemory::new();
    let mut cache = TextureCache::new();
    // A CT32 target at block 64 aliases the T8 texture there
    let rt = cache.lookup_target(&mut dev, &mut mem, 64, 1, Psm::Ct32, 8).unwrap();
    dev.clear_render_target(rt, [1.0; 4]).unwrap();
    cache.mark_dirty(rt, Rect::new(0, 0, 64, 8));

    let t = Tex0 {
        cbp: 256,
        ..tex0(Psm::T8)
    };
    cache.lookup_source(&mut dev, &mut mem, &t, &Clamp::default()).unwrap();
    assert_eq!(mem.read_pixel32(64, 1, 0, 0), 0xFFFF_FFFF);
    // 512 bytes of T8 texels span the first two CT32 rows
    assert_eq!(cache.target(rt).unwrap().dirty().area(), 64 * 6);
}

#[test]
fn test_region_clamp_limits_upload() {
    let t = tex0(Psm::Ct32);
    let clamp = Clamp {
        wms: 2,
        wmt: 2,
        minu: 2,
        maxu: 5,
        minv: 1,
        maxv: 100,
    };
    assert_eq!(sampled_rect(&t, &clamp), Rect::new(2, 1, 6, 8));
    assert_eq!(sampled_rect(&t, &Clamp::default()), Rect::new(0, 0, 8, 8));

    // A wider area than the cached upload needs a new one
    let mut dev = device();
    let mut mem = LinearMemory::new();
    let mut cache = TextureCache::new();
    cache.lookup_source(&mut dev, &mut mem, &t, &clamp).unwrap();
    cache.lookup_source(&mut dev, &mut mem, &t, &Clamp::default()).unwrap();
    assert_eq!(cache.stats().sources_created, 2);
    assert_eq!(cache.source_count(), 1);
    cache.lookup_source(&mut dev, &mut mem, &t, &clamp).unwrap();
    assert_eq!(cache.stats().source_hits, 1);
}

#[test]
fn test_unused_sources_age_out() {
    let mut dev = device();
    let mut mem = LinearMemory::new();
    let mut cache = TextureCache::new();
    cache.lookup_source(&mut dev, &mut mem, &tex0(Psm::Ct16), &Clamp::default()).unwrap();
    for _ in 0..SOURCE_MAX_AGE {
        cache.on_vsync(&mut dev, &mut mem);
    }
    assert_eq!(cache.source_count(), 1);
    cache.on_vsync(&mut dev, &mut mem);
    assert_eq!(cache.source_count(), 0);
}
