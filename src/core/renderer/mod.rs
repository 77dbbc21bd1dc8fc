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

//! Hardware renderer front end
//!
//! [`HwRenderer`] owns everything a GS needs to render on the GPU: the
//! device, the texture cache, emulated local memory and the decoded register
//! file. It is driven the way the GIF drives a GS:
//!
//! - register writes ([`HwRenderer::write_register`],
//!   [`HwRenderer::write_privileged`])
//! - primitive batches ([`HwRenderer::draw`])
//! - host transfers ([`HwRenderer::write_local_memory`],
//!   [`HwRenderer::read_local_memory`])
//! - vertical blanks ([`HwRenderer::vsync`])
//!
//! # Architecture
//!
//! ```text
//! registers ──> draw ──> TextureCache ──> GsDevice ──> GpuBackend
//!                 │            │
//!                 └── selector └── LocalMemory
//! ```
//!
//! The renderer never touches GPU objects itself. Frame and depth buffers
//! are resolved to surfaces through the texture cache, and every draw is
//! recorded through the device.
//!
//! # Example
//!
//! ```
//! use gsrx::core::backend::WindowInfo;
//! use gsrx::core::config::RendererSettings;
//! use gsrx::core::gs::{registers::encode, Psm, REG_FRAME_1, REG_PRIM, REG_SCISSOR_1};
//! use gsrx::core::layout::GsVertex;
//! use gsrx::core::renderer::HwRenderer;
//!
//! let mut gs = HwRenderer::software(RendererSettings::default(), WindowInfo::headless(640, 448))?;
//! gs.write_register(REG_FRAME_1, encode::frame(0, 10, Psm::Ct32, 0));
//! gs.write_register(REG_SCISSOR_1, encode::scissor(0, 639, 0, 447));
//! gs.write_register(REG_PRIM, encode::prim(6, false, false, false, false, 0));
//!
//! let corner = |x: u16, y: u16| GsVertex {
//!     xy: [x << 4, y << 4],
//!     rgba: [0xFF, 0, 0, 0x80],
//!     q: 1.0,
//!     ..Default::default()
//! };
//! gs.draw(0, &[corner(0, 0), corner(320, 224)], &[])?;
//! gs.vsync(false)?;
//! # Ok::<(), gsrx::GsError>(())
//! ```
//!
//! # References
//!
//! - GS User's Manual, 3 Drawing Functions
//! - GS User's Manual, 4 Display Functions

mod draw;
mod present;

#[cfg(test)]
mod tests;

use serde::Serialize;

use crate::core::backend::{GpuBackend, SoftwareBackend, WindowInfo};
#[cfg(feature = "vulkan")]
use crate::core::backend::{VulkanBackend, VulkanConfig};
use crate::core::config::RendererSettings;
use crate::core::device::{EmbeddedShaders, GsDevice, SurfaceHandle};
use crate::core::error::Result;
use crate::core::gs::{GsRegisters, Psm};
use crate::core::memory::{LinearMemory, LocalMemory, VramRegion};
use crate::core::texture_cache::{Target, TextureCache};

/// Front end counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderStats {
    /// Batches recorded as GPU draws
    pub draws: u64,
    /// Batches that could not write anything
    pub skipped_draws: u64,
    /// Draws that needed destination alpha stencil setup
    pub date_draws: u64,
    /// Draws that sampled their own target through a copy
    pub target_copies: u64,
    /// Vertical blanks processed
    pub vsyncs: u64,
}

/// GS renderer on top of [`GsDevice`]
///
/// Generic over the graphics backend and the local memory implementation;
/// [`HwRenderer::software`] builds the combination used by tests and the
/// headless tool.
pub struct HwRenderer<B: GpuBackend, M: LocalMemory = LinearMemory> {
    pub(crate) dev: GsDevice<B>,
    pub(crate) cache: TextureCache,
    pub(crate) mem: M,
    pub(crate) regs: GsRegisters,
    pub(crate) stats: RenderStats,

    /// Output of the display merge, kept across frames
    pub(crate) merge_target: Option<SurfaceHandle>,
    /// Deinterlaced output; weave reads the previous field from it
    pub(crate) interlace_target: Option<SurfaceHandle>,
}

impl HwRenderer<SoftwareBackend, LinearMemory> {
    /// Renderer on the software backend with zeroed linear memory
    pub fn software(settings: RendererSettings, window: WindowInfo) -> Result<Self> {
        let dev = GsDevice::new(SoftwareBackend::new(), settings, window, Box::new(EmbeddedShaders))?;
        Ok(Self::new(dev, LinearMemory::new()))
    }
}

#[cfg(feature = "vulkan")]
impl HwRenderer<VulkanBackend, LinearMemory> {
    /// Renderer on the best Vulkan adapter with zeroed linear memory
    pub fn vulkan(settings: RendererSettings, window: WindowInfo) -> Result<Self> {
        let backend = VulkanBackend::new(VulkanConfig::from_settings(&settings))?;
        let dev = GsDevice::new(backend, settings, window, Box::new(EmbeddedShaders))?;
        Ok(Self::new(dev, LinearMemory::new()))
    }
}

impl<B: GpuBackend, M: LocalMemory> HwRenderer<B, M> {
    pub fn new(dev: GsDevice<B>, mem: M) -> Self {
        log::info!(
            "GS renderer ready (x{} internal resolution)",
            dev.upscale_multiplier()
        );
        Self {
            dev,
            cache: TextureCache::new(),
            mem,
            regs: GsRegisters::new(),
            stats: RenderStats::default(),
            merge_target: None,
            interlace_target: None,
        }
    }

    pub fn device(&self) -> &GsDevice<B> {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut GsDevice<B> {
        &mut self.dev
    }

    pub fn cache(&self) -> &TextureCache {
        &self.cache
    }

    /// Local memory as the CPU would see it right now
    ///
    /// GPU draws not yet written back are missing; use
    /// [`HwRenderer::read_local_memory`] for a coherent view.
    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub fn regs(&self) -> &GsRegisters {
        &self.regs
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    /// Write a general purpose register
    pub fn write_register(&mut self, addr: u8, value: u64) {
        self.regs.write(addr, value);
    }

    /// Write a privileged register at `offset` from the register base
    pub fn write_privileged(&mut self, offset: u32, value: u64) {
        self.regs.write_privileged(offset, value);
    }

    /// Host to local transfer
    ///
    /// Dirty GPU data under the written rows is written back first so the
    /// rows survive the reload; afterwards every target overlapping the
    /// region is refreshed from memory and stale textures are dropped.
    ///
    /// # Arguments
    ///
    /// * `region` - Destination buffer and rectangle
    /// * `data` - Packed pixels as [`LocalMemory::write_image`] expects
    pub fn write_local_memory(&mut self, region: &VramRegion, data: &[u8]) -> Result<()> {
        log::trace!(
            "Host transfer of {:?} {:?} to block {:#x}",
            region.psm,
            region.rect,
            region.bp
        );
        self.cache.invalidate_local_mem(&mut self.dev, &mut self.mem, region)?;
        self.mem.write_image(region, data);
        self.cache.invalidate_video_mem(&mut self.dev, &self.mem, region)
    }

    /// Local to host transfer, including everything the GPU has drawn
    pub fn read_local_memory(&mut self, region: &VramRegion) -> Result<Vec<u8>> {
        log::trace!(
            "Local transfer of {:?} {:?} from block {:#x}",
            region.psm,
            region.rect,
            region.bp
        );
        self.cache.invalidate_local_mem(&mut self.dev, &mut self.mem, region)?;
        Ok(self.mem.read_image(region))
    }

    /// Write every target back to local memory and empty the cache
    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush_all(&mut self.dev, &mut self.mem)?;
        self.dev.wait_idle()
    }

    /// Cached target for a buffer, if one is resident
    pub(crate) fn find_target(&self, bp: u32, bw: u32, psm: Psm) -> Option<&Target> {
        let bw = bw.max(1);
        self.cache
            .targets()
            .iter()
            .find(|t| t.bp() == bp && t.bw() == bw && t.psm() == psm)
    }
}
