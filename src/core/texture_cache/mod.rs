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

//! Texture cache and render target manager
//!
//! Maps buffers in emulated local memory to GPU surfaces and keeps the two
//! coherent.
//!
//! # Architecture
//!
//! - **Targets**: frame and depth buffers the GPU draws into. Each one
//!   tracks the rectangles drawn since the last write-back; those are
//!   copied into local memory by [`TextureCache::read_target`] when the CPU
//!   side needs them, through the conversions in [`readback`].
//! - **Sources**: textures uploaded from local memory, keyed by TEX0 and the
//!   CLUT contents. A texture whose address and format match a target is
//!   sampled from the target instead.
//!
//! Targets match only on identical (block pointer, width, format). A lookup
//! that overlaps a target of another format or row layout writes that
//! target's dirty area back and evicts it first. A same-format target at a
//! whole-row offset is kept; the new target copies the shared rows from it
//! and takes over their dirty rectangles.
//!
//! All GPU work goes through [`GsDevice`]; the cache only holds surface
//! handles.
//!
//! # Example
//!
//! ```
//! use gsrx::core::backend::{SoftwareBackend, WindowInfo};
//! use gsrx::core::config::RendererSettings;
//! use gsrx::core::device::{EmbeddedShaders, GsDevice};
//! use gsrx::core::gs::Psm;
//! use gsrx::core::memory::LinearMemory;
//! use gsrx::core::texture_cache::TextureCache;
//! use gsrx::core::types::Rect;
//!
//! let mut dev = GsDevice::new(
//!     SoftwareBackend::new(),
//!     RendererSettings::default(),
//!     WindowInfo::headless(640, 448),
//!     Box::new(EmbeddedShaders),
//! )?;
//! let mut mem = LinearMemory::new();
//! let mut cache = TextureCache::new();
//!
//! let rt = cache.lookup_target(&mut dev, &mut mem, 0, 10, Psm::Ct32, 448)?;
//! dev.clear_render_target(rt, [1.0, 0.0, 0.0, 1.0])?;
//! cache.mark_dirty(rt, Rect::new(0, 0, 64, 64));
//! cache.read_target(&mut dev, &mut mem, rt, Rect::new(0, 0, 640, 448))?;
//! # Ok::<(), gsrx::GsError>(())
//! ```

mod dirty;
pub mod readback;

#[cfg(test)]
mod tests;

pub use dirty::{subtract_rect, DirtyRects};
pub use readback::{readback_path, texel_value, ReadbackEntry, ReadbackPath, READBACK_TABLE};

use serde::Serialize;

use crate::core::backend::GpuBackend;
use crate::core::device::{GsDevice, ShaderConvert, SurfaceHandle, SurfaceKind, COLOR_FORMAT, DEPTH_FORMAT};
use crate::core::error::{GsError, Result};
use crate::core::gs::{Clamp, Psm, Tex0};
use crate::core::memory::{row_bytes, LocalMemory, VramRegion, BLOCK_SIZE};
use crate::core::types::{Rect, RectF};

/// Frames a target may go unused before it is written back and dropped
pub const TARGET_MAX_AGE: u32 = 30;
/// Frames a source may go unused before it is dropped
pub const SOURCE_MAX_AGE: u32 = 10;
/// Tallest buffer the GS can address
pub const MAX_TARGET_HEIGHT: u32 = 2048;

/// Region clamp mode of CLAMP.WMS / WMT
const REGION_CLAMP: u8 = 2;

/// A frame or depth buffer backed by a GPU surface
#[derive(Debug, Clone)]
pub struct Target {
    surface: SurfaceHandle,
    bp: u32,
    bw: u32,
    psm: Psm,
    /// Native size in pixels
    width: u32,
    height: u32,
    scale: u32,
    dirty: DirtyRects,
    age: u32,
}

impl Target {
    pub fn surface(&self) -> SurfaceHandle {
        self.surface
    }

    pub fn bp(&self) -> u32 {
        self.bp
    }

    pub fn bw(&self) -> u32 {
        self.bw
    }

    pub fn psm(&self) -> Psm {
        self.psm
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn dirty(&self) -> &DirtyRects {
        &self.dirty
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn rect(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }

    /// Memory the target covers
    pub fn region(&self) -> VramRegion {
        VramRegion::new(self.bp, self.bw, self.psm, self.rect())
    }

    fn matches(&self, bp: u32, bw: u32, psm: Psm) -> bool {
        self.bp == bp && self.bw == bw && self.psm == psm
    }

    /// Rows from this target's base to a buffer at `bp` with the same layout
    ///
    /// `None` when the two can't share pixels row for row: a different
    /// format, width or scale, or a base that falls inside a row.
    fn row_offset(&self, bp: u32, bw: u32, psm: Psm, scale: u32) -> Option<i32> {
        if self.psm != psm || self.bw != bw || self.scale != scale {
            return None;
        }
        let stride = row_bytes(bw, psm) as i64;
        let delta = (bp as i64 - self.bp as i64) * BLOCK_SIZE as i64;
        (delta % stride == 0).then(|| (delta / stride) as i32)
    }

    /// Part of this target that `region` covers, in native pixels
    ///
    /// Exact when the region has the same row layout and starts on a row
    /// boundary of the target; otherwise every row the region's bytes reach.
    pub fn map_region(&self, region: &VramRegion) -> Rect {
        let stride = row_bytes(self.bw, self.psm) as i64;
        let base = self.bp as i64 * BLOCK_SIZE as i64;
        let region_base = region.bp as i64 * BLOCK_SIZE as i64;
        let offset = region_base - base;
        let same_layout = region.bw == self.bw && region.psm.bpp() == self.psm.bpp();
        let rect = if same_layout && offset.rem_euclid(stride) == 0 {
            region.rect.translate(0, offset.div_euclid(stride) as i32)
        } else {
            let bytes = region.byte_range();
            let top = (bytes.start as i64 - base).div_euclid(stride);
            let bottom = (bytes.end as i64 - base + stride - 1).div_euclid(stride);
            Rect::new(
                0,
                top.clamp(0, self.height as i64) as i32,
                self.width as i32,
                bottom.clamp(0, self.height as i64) as i32,
            )
        };
        rect.intersect(&self.rect())
    }
}

/// A texture uploaded from local memory
#[derive(Debug, Clone)]
struct Source {
    surface: SurfaceHandle,
    tex0: Tex0,
    clut: Vec<u32>,
    /// Uploaded texels
    rect: Rect,
    age: u32,
}

impl Source {
    fn region(&self) -> VramRegion {
        VramRegion::new(self.tex0.tbp0, self.tex0.tbw, self.tex0.psm, self.rect)
    }
}

/// Whether two TEX0 values describe the same texels
fn same_texture(a: &Tex0, b: &Tex0) -> bool {
    a.tbp0 == b.tbp0
        && a.tbw == b.tbw
        && a.psm == b.psm
        && a.tw == b.tw
        && a.th == b.th
        && (!a.psm.is_paletted() || a.cpsm == b.cpsm)
}

/// Texels a draw can reach under `clamp`
pub fn sampled_rect(tex0: &Tex0, clamp: &Clamp) -> Rect {
    let full = Rect::from_size(tex0.width(), tex0.height());
    let mut rect = full;
    if clamp.wms == REGION_CLAMP {
        rect.left = clamp.minu as i32;
        rect.right = clamp.maxu as i32 + 1;
    }
    if clamp.wmt == REGION_CLAMP {
        rect.top = clamp.minv as i32;
        rect.bottom = clamp.maxv as i32 + 1;
    }
    let rect = rect.intersect(&full);
    if rect.is_empty() {
        full
    } else {
        rect
    }
}

/// Surface to sample for a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceBinding {
    pub surface: SurfaceHandle,
    /// Native size the texture coordinates are normalized by
    pub width: u32,
    pub height: u32,
    /// Sampling a render target rather than an uploaded texture
    pub from_target: bool,
}

/// Cache activity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub targets_created: u64,
    pub targets_grown: u64,
    pub targets_evicted: u64,
    pub target_readbacks: u64,
    pub target_uploads: u64,
    pub sources_created: u64,
    pub source_hits: u64,
    pub target_source_hits: u64,
}

/// The texture cache
#[derive(Debug, Default)]
pub struct TextureCache {
    targets: Vec<Target>,
    sources: Vec<Source>,
    stats: CacheStats,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn target(&self, surface: SurfaceHandle) -> Option<&Target> {
        self.targets.iter().find(|t| t.surface == surface)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn target_index(&self, surface: SurfaceHandle) -> Result<usize> {
        self.targets
            .iter()
            .position(|t| t.surface == surface)
            .ok_or_else(|| GsError::InvalidSurface(format!("{} is not a cached target", surface)))
    }

    /// Find or create the target for a buffer
    ///
    /// # Arguments
    ///
    /// * `bp` - Block pointer of the buffer
    /// * `bw` - Buffer width in 64-pixel units
    /// * `psm` - Frame or depth format
    /// * `min_height` - Rows the caller is about to use
    ///
    /// # Returns
    ///
    /// The target's surface. An existing target shorter than `min_height` is
    /// replaced by a taller surface holding a copy of its contents.
    #[allow(clippy::too_many_arguments)]
    pub fn lookup_target<B: GpuBackend, M: LocalMemory + ?Sized>(
        &mut self,
        dev: &mut GsDevice<B>,
        mem: &mut M,
        bp: u32,
        bw: u32,
        psm: Psm,
        min_height: u32,
    ) -> Result<SurfaceHandle> {
        let bw = bw.max(1);
        let min_height = min_height.clamp(1, MAX_TARGET_HEIGHT);

        if let Some(index) = self.targets.iter().position(|t| t.matches(bp, bw, psm)) {
            let target = &mut self.targets[index];
            target.age = 0;
            if target.height >= min_height {
                return Ok(target.surface);
            }
            return self.grow_target(dev, mem, index, min_height);
        }

        let width = bw * 64;
        let scale = dev.upscale_multiplier();
        let region = VramRegion::new(bp, bw, psm, Rect::from_size(width, min_height));
        let mut superseded_dirty = false;
        let mut index = self.targets.len();
        while index > 0 {
            index -= 1;
            let target = &self.targets[index];
            if !target.region().overlaps(&region) || target.row_offset(bp, bw, psm, scale).is_some() {
                continue;
            }
            superseded_dirty |= !target.dirty.is_empty();
            let full = target.rect();
            self.read_target_at(dev, mem, index, full)?;
            let evicted = self.targets.remove(index);
            log::debug!(
                "Evicting {:?} target at block {:#x} for {:?} at {:#x}",
                evicted.psm,
                evicted.bp,
                psm,
                bp
            );
            dev.recycle(evicted.surface);
            self.stats.targets_evicted += 1;
        }

        let (kind, format) = if psm.is_depth() {
            (SurfaceKind::DepthStencil, DEPTH_FORMAT)
        } else {
            (SurfaceKind::RenderTarget, COLOR_FORMAT)
        };
        let surface = dev.fetch_surface(kind, width * scale, min_height * scale, format, false)?;
        self.targets.push(Target {
            surface,
            bp,
            bw,
            psm,
            width,
            height: min_height,
            scale,
            dirty: DirtyRects::new(),
            age: 0,
        });
        self.stats.targets_created += 1;
        log::debug!(
            "Created {:?} target at block {:#x}, {}x{} (x{})",
            psm,
            bp,
            width,
            min_height,
            scale
        );

        let index = self.targets.len() - 1;
        if dev.settings().hacks.preload_frame_data || superseded_dirty {
            let rect = self.targets[index].rect();
            self.upload_to_target(dev, mem, index, rect)?;
        }
        self.adopt_overlaps(dev, index)?;
        Ok(surface)
    }

    /// Take over the rows a new target shares with same-format targets
    ///
    /// The shared rows are copied on the GPU and their dirty rectangles move
    /// to the new target, so exactly one target writes each dirty pixel back.
    fn adopt_overlaps<B: GpuBackend>(&mut self, dev: &mut GsDevice<B>, index: usize) -> Result<()> {
        let (surface, bp, bw, psm, scale, rect) = {
            let t = &self.targets[index];
            (t.surface, t.bp, t.bw, t.psm, t.scale, t.rect())
        };
        for other in 0..self.targets.len() {
            if other == index {
                continue;
            }
            let Some(offset) = self.targets[other].row_offset(bp, bw, psm, scale) else {
                continue;
            };
            // Shared rows in the new target's coordinates
            let shared = self.targets[other].rect().translate(0, -offset).intersect(&rect);
            if shared.is_empty() {
                continue;
            }
            let src = shared.translate(0, offset);
            dev.copy_rect(
                self.targets[other].surface,
                surface,
                src.scale(scale),
                shared.left * scale as i32,
                shared.top * scale as i32,
            )?;
            let moved: Vec<Rect> = self.targets[other]
                .dirty
                .within(&src)
                .iter()
                .map(|r| r.translate(0, -offset))
                .collect();
            self.targets[other].dirty.subtract(&src);
            for piece in moved {
                self.targets[index].dirty.add(piece);
            }
            log::debug!(
                "{:?} target at block {:#x} shares rows {}..{} with the one at {:#x}",
                psm,
                bp,
                shared.top,
                shared.bottom,
                self.targets[other].bp
            );
        }
        Ok(())
    }

    fn grow_target<B: GpuBackend, M: LocalMemory + ?Sized>(
        &mut self,
        dev: &mut GsDevice<B>,
        mem: &mut M,
        index: usize,
        height: u32,
    ) -> Result<SurfaceHandle> {
        let old = self.targets[index].surface;
        let (kind, format, width, old_height) = {
            let s = dev.surface(old)?;
            (s.kind(), s.format(), s.width(), s.height())
        };
        let scale = self.targets[index].scale;
        let surface = dev.fetch_surface(kind, width, height * scale, format, false)?;
        if let Err(e) = dev.copy_rect(old, surface, Rect::from_size(width, old_height), 0, 0) {
            dev.recycle(surface);
            return Err(e);
        }
        dev.recycle(old);

        let target = &mut self.targets[index];
        let new_rows = Rect::new(0, target.height as i32, target.width as i32, height as i32);
        log::debug!(
            "Growing {:?} target at block {:#x} from {} to {} rows",
            target.psm,
            target.bp,
            target.height,
            height
        );
        target.surface = surface;
        target.height = height;
        self.stats.targets_grown += 1;

        if dev.settings().hacks.preload_frame_data {
            self.upload_to_target(dev, mem, index, new_rows)?;
        }
        Ok(surface)
    }

    /// Record that the GPU drew into `rect` of a target
    pub fn mark_dirty(&mut self, surface: SurfaceHandle, rect: Rect) {
        let Some(target) = self.targets.iter_mut().find(|t| t.surface == surface) else {
            log::warn!("Marking unknown target {} dirty", surface);
            return;
        };
        let rect = rect.intersect(&target.rect());
        if rect.is_empty() {
            return;
        }
        target.dirty.add(rect);
        target.age = 0;
    }

    /// Write the dirty part of `rect` back to local memory
    ///
    /// Reads the bounding box of the dirty pieces once and writes only the
    /// pieces themselves, then clears them. Nothing is read when no part of
    /// `rect` is dirty.
    pub fn read_target<B: GpuBackend, M: LocalMemory + ?Sized>(
        &mut self,
        dev: &mut GsDevice<B>,
        mem: &mut M,
        surface: SurfaceHandle,
        rect: Rect,
    ) -> Result<()> {
        let index = self.target_index(surface)?;
        self.read_target_at(dev, mem, index, rect)
    }

    fn read_target_at<B: GpuBackend, M: LocalMemory + ?Sized>(
        &mut self,
        dev: &mut GsDevice<B>,
        mem: &mut M,
        index: usize,
        rect: Rect,
    ) -> Result<()> {
        let target = &self.targets[index];
        let pieces = target.dirty.within(&rect);
        if pieces.is_empty() {
            return Ok(());
        }
        if dev.settings().hacks.disable_hardware_readbacks {
            log::trace!("Skipping readback of target at block {:#x}", target.bp);
            self.targets[index].dirty.subtract(&rect);
            return Ok(());
        }

        let (surface, bp, bw, psm, scale) = (target.surface, target.bp, target.bw, target.psm, target.scale);
        let bounds = pieces.iter().fold(Rect::default(), |acc, r| acc.union(r));
        let map = match readback_path(psm, scale)? {
            ReadbackPath::Direct => dev.readback_texture(surface, bounds, 0)?,
            ReadbackPath::Convert { format, shader } => {
                let (sw, sh) = {
                    let s = dev.surface(surface)?;
                    (s.width(), s.height())
                };
                let src = bounds.scale(scale).to_f().normalize(sw, sh);
                dev.draw_for_readback(
                    surface,
                    src,
                    bounds.width() as u32,
                    bounds.height() as u32,
                    format,
                    shader,
                )?
            }
        };

        for piece in &pieces {
            for y in piece.top..piece.bottom {
                for x in piece.left..piece.right {
                    let texel = map.texel((x - bounds.left) as u32, (y - bounds.top) as u32);
                    mem.write_pixel(psm, bp, bw, x as u32, y as u32, texel_value(map.format, texel));
                }
            }
        }
        self.targets[index].dirty.subtract(&rect);
        self.stats.target_readbacks += 1;
        log::debug!(
            "Wrote back {} dirty rect(s) of {:?} target at block {:#x} within {:?}",
            pieces.len(),
            psm,
            bp,
            bounds
        );
        self.drop_sources(dev, &VramRegion::new(bp, bw, psm, bounds));
        Ok(())
    }

    /// Copy `rect` of local memory into a target
    fn upload_to_target<B: GpuBackend, M: LocalMemory + ?Sized>(
        &mut self,
        dev: &mut GsDevice<B>,
        mem: &M,
        index: usize,
        rect: Rect,
    ) -> Result<()> {
        let target = &self.targets[index];
        let rect = rect.intersect(&target.rect());
        if rect.is_empty() {
            return Ok(());
        }
        let (w, h) = (rect.width() as u32, rect.height() as u32);
        let (surface, bp, bw, psm, scale) = (target.surface, target.bp, target.bw, target.psm, target.scale);

        // Depth travels as raw little-endian values and is unpacked by the shader
        let (data, shader) = if psm.is_depth() {
            let mut data = Vec::with_capacity((w * h * 4) as usize);
            for y in rect.top..rect.bottom {
                for x in rect.left..rect.right {
                    data.extend_from_slice(&mem.read_pixel(psm, bp, bw, x as u32, y as u32).to_le_bytes());
                }
            }
            let shader = match psm {
                Psm::Z32 => ShaderConvert::Rgba8ToFloat32,
                Psm::Z24 => ShaderConvert::Rgba8ToFloat24,
                _ => ShaderConvert::Rgba8ToFloat16,
            };
            (data, shader)
        } else {
            let tex0 = Tex0 {
                tbp0: bp,
                tbw: bw,
                psm,
                ..Default::default()
            };
            (mem.read_texture_rgba8(&tex0, rect), ShaderConvert::Copy)
        };

        let staging = dev.fetch_surface(SurfaceKind::Texture, w, h, COLOR_FORMAT, false)?;
        let result = dev
            .update_texture(staging, Rect::from_size(w, h), &data, w * 4, 0)
            .and_then(|_| {
                let dst = rect.scale(scale).to_f();
                dev.stretch_rect(staging, RectF::unit(), Some(surface), dst, shader, false)
            });
        dev.recycle(staging);
        result?;
        self.stats.target_uploads += 1;
        log::trace!("Uploaded {:?} of {:?} target at block {:#x}", rect, psm, bp);
        Ok(())
    }

    /// Resolve a texture read to a surface
    ///
    /// A target with the texture's address, width and format is sampled
    /// directly. Otherwise a cached upload with the same TEX0 and CLUT
    /// covering the reachable texels is reused, or a new one is made;
    /// dirty targets under the texture are written back first.
    pub fn lookup_source<B: GpuBackend, M: LocalMemory + ?Sized>(
        &mut self,
        dev: &mut GsDevice<B>,
        mem: &mut M,
        tex0: &Tex0,
        clamp: &Clamp,
    ) -> Result<SourceBinding> {
        if let Some(target) = self
            .targets
            .iter_mut()
            .find(|t| t.matches(tex0.tbp0, tex0.tbw.max(1), tex0.psm))
        {
            target.age = 0;
            self.stats.target_source_hits += 1;
            return Ok(SourceBinding {
                surface: target.surface,
                width: target.width,
                height: target.height,
                from_target: true,
            });
        }

        let rect = sampled_rect(tex0, clamp);
        let texels = VramRegion::new(tex0.tbp0, tex0.tbw, tex0.psm, rect);
        self.invalidate_local_mem(dev, mem, &texels)?;
        let clut = if tex0.psm.is_paletted() {
            let rows = if tex0.psm.clut_entries() == 256 { 16 } else { 2 * (tex0.csa + 1) };
            let table = VramRegion::new(tex0.cbp, 1, tex0.cpsm, Rect::from_size(16, rows));
            self.invalidate_local_mem(dev, mem, &table)?;
            mem.read_clut(tex0)
        } else {
            Vec::new()
        };

        let (width, height) = (tex0.width(), tex0.height());
        if let Some(source) = self
            .sources
            .iter_mut()
            .find(|s| same_texture(&s.tex0, tex0) && s.clut == clut && s.rect.contains(&rect))
        {
            source.age = 0;
            self.stats.source_hits += 1;
            return Ok(SourceBinding {
                surface: source.surface,
                width,
                height,
                from_target: false,
            });
        }

        // An upload of the same texture with another palette or area is stale
        let (stale, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sources)
            .into_iter()
            .partition(|s| same_texture(&s.tex0, tex0));
        self.sources = keep;
        for source in stale {
            dev.recycle(source.surface);
        }

        let data = mem.read_texture_rgba8(tex0, rect);
        let surface = dev.fetch_surface(SurfaceKind::Texture, width, height, COLOR_FORMAT, false)?;
        if let Err(e) = dev.update_texture(surface, rect, &data, rect.width() as u32 * 4, 0) {
            dev.recycle(surface);
            return Err(e);
        }
        self.sources.push(Source {
            surface,
            tex0: *tex0,
            clut,
            rect,
            age: 0,
        });
        self.stats.sources_created += 1;
        log::trace!(
            "Uploaded {:?} texture at block {:#x}, {}x{} ({:?})",
            tex0.psm,
            tex0.tbp0,
            width,
            height,
            rect
        );
        Ok(SourceBinding {
            surface,
            width,
            height,
            from_target: false,
        })
    }

    /// Drop every source that reads memory in `region`
    fn drop_sources<B: GpuBackend>(&mut self, dev: &mut GsDevice<B>, region: &VramRegion) {
        let (stale, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sources)
            .into_iter()
            .partition(|s| s.region().overlaps(region));
        self.sources = keep;
        for source in stale {
            log::trace!("Dropping {:?} texture at block {:#x}", source.tex0.psm, source.tex0.tbp0);
            dev.recycle(source.surface);
        }
    }

    /// Local memory in `region` was written by the CPU
    ///
    /// Overlapping sources are dropped and the covered part of every
    /// overlapping target is reloaded from memory; GPU-side dirty data there
    /// is discarded.
    pub fn invalidate_video_mem<B: GpuBackend, M: LocalMemory + ?Sized>(
        &mut self,
        dev: &mut GsDevice<B>,
        mem: &M,
        region: &VramRegion,
    ) -> Result<()> {
        self.drop_sources(dev, region);
        for index in 0..self.targets.len() {
            if !self.targets[index].region().overlaps(region) {
                continue;
            }
            let rect = self.targets[index].map_region(region);
            if rect.is_empty() {
                continue;
            }
            self.targets[index].dirty.subtract(&rect);
            self.upload_to_target(dev, mem, index, rect)?;
        }
        Ok(())
    }

    /// The CPU is about to read local memory in `region`
    ///
    /// Every dirty target overlapping it is written back first.
    pub fn invalidate_local_mem<B: GpuBackend, M: LocalMemory + ?Sized>(
        &mut self,
        dev: &mut GsDevice<B>,
        mem: &mut M,
        region: &VramRegion,
    ) -> Result<()> {
        for index in 0..self.targets.len() {
            let target = &self.targets[index];
            if target.dirty.is_empty() || !target.region().overlaps(region) {
                continue;
            }
            let rect = target.map_region(region);
            self.read_target_at(dev, mem, index, rect)?;
        }
        Ok(())
    }

    /// Age every entry and drop the stale ones
    ///
    /// Targets past [`TARGET_MAX_AGE`] are written back before they go. A
    /// failed write-back is logged and the target is dropped anyway.
    pub fn on_vsync<B: GpuBackend, M: LocalMemory + ?Sized>(&mut self, dev: &mut GsDevice<B>, mem: &mut M) {
        let (stale, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sources)
            .into_iter()
            .map(|mut s| {
                s.age += 1;
                s
            })
            .partition(|s| s.age > SOURCE_MAX_AGE);
        self.sources = keep;
        for source in stale {
            dev.recycle(source.surface);
        }

        let mut index = self.targets.len();
        while index > 0 {
            index -= 1;
            self.targets[index].age += 1;
            if self.targets[index].age <= TARGET_MAX_AGE {
                continue;
            }
            let full = self.targets[index].rect();
            if let Err(e) = self.read_target_at(dev, mem, index, full) {
                log::warn!("Dropping target without write-back: {}", e);
            }
            let target = self.targets.remove(index);
            log::debug!("Aged out {:?} target at block {:#x}", target.psm, target.bp);
            dev.recycle(target.surface);
            self.stats.targets_evicted += 1;
        }
    }

    /// Write back every dirty target and drop all entries
    pub fn flush_all<B: GpuBackend, M: LocalMemory + ?Sized>(&mut self, dev: &mut GsDevice<B>, mem: &mut M) -> Result<()> {
        for index in 0..self.targets.len() {
            let full = self.targets[index].rect();
            self.read_target_at(dev, mem, index, full)?;
        }
        for target in self.targets.drain(..) {
            dev.recycle(target.surface);
        }
        for source in self.sources.drain(..) {
            dev.recycle(source.surface);
        }
        Ok(())
    }
}
