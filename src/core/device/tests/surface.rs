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

use crate::core::backend::{Format, ImageLayout};
use crate::core::device::{SurfaceKind, COLOR_FORMAT, DEPTH_FORMAT, POOL_MAX_AGE};
use crate::core::error::GsError;
use crate::core::types::Rect;

use super::{assert_valid, device};

#[test]
fn test_targets_start_cleared_in_working_layout() {
    let mut dev = device();
    let rt = dev
        .create_surface(SurfaceKind::RenderTarget, 16, 8, COLOR_FORMAT, false)
        .unwrap();
    let ds = dev
        .create_surface(SurfaceKind::DepthStencil, 16, 8, DEPTH_FORMAT, false)
        .unwrap();
    assert_eq!(dev.surface(rt).unwrap().layout(), ImageLayout::ColorAttachment);
    assert_eq!(dev.surface(ds).unwrap().layout(), ImageLayout::DepthStencilAttachment);

    let map = dev.readback_texture(rt, Rect::from_size(16, 8), 0).unwrap();
    assert!(map.data.iter().all(|&b| b == 0));
    assert_eq!(dev.surface(rt).unwrap().layout(), ImageLayout::ColorAttachment);
    assert_valid(&dev);
}

#[test]
fn test_depth_kind_needs_depth_format() {
    let mut dev = device();
    assert!(matches!(
        dev.create_surface(SurfaceKind::DepthStencil, 8, 8, COLOR_FORMAT, false),
        Err(GsError::ImageCreation { .. })
    ));
    assert!(dev
        .create_surface(SurfaceKind::RenderTarget, 8, 8, DEPTH_FORMAT, false)
        .is_err());
}

#[test]
fn test_sizes_are_clamped_and_mips_counted() {
    let mut dev = device();
    let tex = dev
        .create_surface(SurfaceKind::Texture, 0, 64, COLOR_FORMAT, true)
        .unwrap();
    let s = dev.surface(tex).unwrap();
    assert_eq!((s.width(), s.height()), (1, 64));
    assert_eq!(s.levels(), 7);

    let rt = dev
        .create_surface(SurfaceKind::RenderTarget, 64, 64, COLOR_FORMAT, true)
        .unwrap();
    assert_eq!(dev.surface(rt).unwrap().levels(), 1);
}

#[test]
fn test_recycled_surface_is_reused() {
    let mut dev = device();
    let tex = dev
        .create_surface(SurfaceKind::Texture, 32, 32, COLOR_FORMAT, false)
        .unwrap();
    dev.recycle(tex);
    assert_eq!(dev.pooled_surface_count(), 1);

    let other = dev
        .fetch_surface(SurfaceKind::Texture, 32, 16, COLOR_FORMAT, false)
        .unwrap();
    assert_ne!(other, tex);

    let again = dev
        .fetch_surface(SurfaceKind::Texture, 32, 32, COLOR_FORMAT, false)
        .unwrap();
    assert_eq!(again, tex);
    assert!(dev.surface(again).unwrap().is_discarded());
    assert_eq!(dev.pooled_surface_count(), 0);
    assert_eq!(dev.stats().surfaces_created, 2);
    assert_eq!(dev.stats().surfaces_recycled, 1);
}

#[test]
fn test_pool_ages_out() {
    let mut dev = device();
    let tex = dev
        .create_surface(SurfaceKind::Texture, 8, 8, COLOR_FORMAT, false)
        .unwrap();
    dev.recycle(tex);
    for _ in 0..=POOL_MAX_AGE {
        dev.begin_present(true).unwrap();
        dev.end_present().unwrap();
    }
    assert_eq!(dev.pooled_surface_count(), 0);
    assert!(dev.surface(tex).is_err());
    assert_valid(&dev);
}

#[test]
fn test_destroying_partner_drops_linked_framebuffer() {
    let mut dev = device();
    let rt = dev
        .create_surface(SurfaceKind::RenderTarget, 16, 16, COLOR_FORMAT, false)
        .unwrap();
    let ds = dev
        .create_surface(SurfaceKind::DepthStencil, 16, 16, DEPTH_FORMAT, false)
        .unwrap();
    dev.om_set_render_targets(Some(rt), Some(ds), Rect::from_size(16, 16))
        .unwrap();
    assert_eq!(dev.surface(rt).unwrap().framebuffers.len(), 1);
    assert_eq!(dev.surface(ds).unwrap().framebuffers.len(), 1);

    let framebuffers = dev.backend().live_framebuffer_count();
    dev.destroy_surface(ds);
    assert!(dev.surface(rt).unwrap().framebuffers.is_empty());

    dev.wait_idle().unwrap();
    assert_eq!(dev.backend().live_framebuffer_count(), framebuffers - 1);
    assert_valid(&dev);
}

#[test]
fn test_stale_handle_is_reported() {
    let mut dev = device();
    let tex = dev
        .create_surface(SurfaceKind::Texture, 8, 8, COLOR_FORMAT, false)
        .unwrap();
    dev.destroy_surface(tex);
    assert!(matches!(dev.surface(tex), Err(GsError::InvalidSurface(_))));
    assert!(dev.clear_render_target(tex, [0.0; 4]).is_err());
}

#[test]
fn test_clear_requires_color_target() {
    let mut dev = device();
    let ds = dev
        .create_surface(SurfaceKind::DepthStencil, 8, 8, DEPTH_FORMAT, false)
        .unwrap();
    assert!(matches!(
        dev.clear_render_target(ds, [0.0; 4]),
        Err(GsError::SurfaceTypeMismatch { .. })
    ));
    assert!(dev.clear_depth(ds).is_ok());
}

#[test]
fn test_clone_texture_copies_contents() {
    let mut dev = device();
    let tex = dev
        .create_surface(SurfaceKind::Texture, 4, 4, Format::Rgba8Unorm, false)
        .unwrap();
    let texels: Vec<u8> = (0..64).collect();
    dev.update_texture(tex, Rect::from_size(4, 4), &texels, 16, 0)
        .unwrap();

    let copy = dev.clone_texture(tex).unwrap();
    assert_eq!(dev.surface(copy).unwrap().kind(), SurfaceKind::RenderTarget);
    let map = dev.readback_texture(copy, Rect::from_size(4, 4), 0).unwrap();
    assert_eq!(map.data, texels);
    assert_valid(&dev);
}
