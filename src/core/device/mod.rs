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

//! GPU device facade
//!
//! [`GsDevice`] owns everything the renderer draws with: the surfaces, the
//! stream buffers, the pipeline/shader/sampler caches, the deferred draw state
//! and the render pass state machine. The renderer and the texture cache only
//! ever touch GPU objects through it.
//!
//! # Architecture
//!
//! ```text
//! HwRenderer / TextureCache
//!          |
//!      GsDevice ── StateTracker, RenderPassState
//!          |  ├── StreamBuffer x5 (vertex, index, VS/PS uniforms, uploads)
//!          |  ├── PipelineCache ── ShaderCache
//!          |  ├── SamplerCache
//!          |  └── SurfaceArena
//!      GpuContext (fences, deferred destruction)
//!          |
//!      GpuBackend
//! ```
//!
//! The implementation is split across files by concern:
//! - `draw.rs`: vertex/index/uniform upload, draw state and draws
//! - `transfer.rs`: clears, copies, uploads and readbacks
//! - `present.rs`: stretch-rect family, merge, interlace, DATE and presentation
//!
//! # Failure policy
//!
//! Exhausting a stream buffer or the descriptor pool flushes the command
//! buffer and retries exactly once. A second failure surfaces as an error and
//! the caller drops the draw.

mod blend;
mod context;
mod convert;
mod draw;
mod pipeline;
mod present;
mod sampler;
mod selector;
mod shader;
mod state;
mod stream_buffer;
mod surface;
mod transfer;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Serialize;

use crate::core::backend::{
    BufferId, BufferUsage, ClearAspects, ClearValue, DescriptorSetId, DescriptorSetLayoutKind, DescriptorWrite,
    Format, FramebufferId, GpuBackend, ImageDesc, ImageId, ImageLayout, LoadOp, RenderPassKey,
    SamplerId, SwapChainInfo, WindowInfo,
};
use crate::core::config::RendererSettings;
use crate::core::error::{GsError, Result};
use crate::core::layout::{PsConstantBuffer, VsConstantBuffer};
use crate::core::types::Rect;

pub use blend::{blend_constant, blend_index, blend_terms, hw_blend, BlendFlags, HwBlend};
pub use blend::{BLEND_AD, BLEND_AS, BLEND_CD, BLEND_CS, BLEND_FIX, BLEND_ZERO};
pub use context::{GpuContext, PendingResource};
pub use convert::ShaderConvert;
pub use pipeline::{
    blend_state, depth_stencil_state, tfx_render_pass_key, PipelineCache, UtilityKey,
    UtilityProgram, UtilityTarget, COLOR_FORMAT, DEPTH_FORMAT, HDR_COLOR_FORMAT,
};
pub use present::{stretch_vertices, MergeParams};
pub use sampler::{sampler_desc, SamplerCache};
pub use selector::{
    BlendSelector, DepthStencilSelector, GsSelector, PipelineSelector, PsSelector,
    SamplerSelector, VsSelector,
};
pub use shader::{
    build_shader_source, DirectoryShaders, EmbeddedShaders, ShaderCache, ShaderSourceProvider,
};
pub use state::{DirtyFlags, RenderPassState, StateTracker};
pub use stream_buffer::StreamBuffer;
pub use surface::{Surface, SurfaceArena, SurfaceHandle, SurfaceKind};
pub use transfer::ReadbackMap;

/// Pooled surfaces unused for this many frames are destroyed
const POOL_MAX_AGE: u64 = 60;
/// Upper bound on pooled surfaces
const POOL_MAX_SIZE: usize = 300;

/// Index of a stream buffer in [`GsDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Vertex = 0,
    Index = 1,
    VertexUniform = 2,
    FragmentUniform = 3,
    TextureUpload = 4,
}

/// Device-level counters, reported by the headless tool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub draws: u64,
    pub dropped_draws: u64,
    pub forced_flushes: u64,
    pub readbacks: u64,
    pub surfaces_created: u64,
    pub surfaces_recycled: u64,
    pub uploads: u64,
    pub frames: u64,
}

/// Attachments a render pass can be begun on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrawTarget {
    Surfaces {
        rt: Option<SurfaceHandle>,
        ds: Option<SurfaceHandle>,
    },
    SwapChain(ImageId),
}

/// Framebuffer selected by the last `om_set_render_targets` or present
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BoundTarget {
    pub target: DrawTarget,
    pub framebuffer: FramebufferId,
    pub color: Option<Format>,
    pub depth: Option<Format>,
    pub width: u32,
    pub height: u32,
}

impl BoundTarget {
    pub fn rect(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }

    /// Pass key for this target with the given load op on every attachment
    pub fn pass_key(&self, load: LoadOp) -> RenderPassKey {
        RenderPassKey {
            color: self.color,
            depth: self.depth,
            color_load: if self.color.is_some() { load } else { LoadOp::DontCare },
            depth_load: if self.depth.is_some() { load } else { LoadOp::DontCare },
            stencil_load: if self.depth.is_some() { load } else { LoadOp::DontCare },
        }
    }
}

/// Number of mip levels in a full chain for a `width` x `height` image
pub fn mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// The GS rendering device
pub struct GsDevice<B: GpuBackend> {
    pub(crate) ctx: GpuContext<B>,
    pub(crate) settings: RendererSettings,

    pub(crate) surfaces: SurfaceArena,
    /// Surfaces waiting to be handed out again by `fetch_surface`
    pub(crate) pool: Vec<SurfaceHandle>,
    pub(crate) null_texture: SurfaceHandle,

    pub(crate) streams: [StreamBuffer; 5],
    pub(crate) readback_buffer: BufferId,
    pub(crate) readback_size: u64,
    pub(crate) uniform_alignment: u32,
    pub(crate) tfx_uniform_set: DescriptorSetId,

    pub(crate) shaders: ShaderCache,
    pub(crate) pipelines: PipelineCache,
    pub(crate) samplers: SamplerCache,
    pub(crate) point_sampler: SamplerId,
    pub(crate) linear_sampler: SamplerId,

    pub(crate) state: StateTracker,
    pub(crate) pass: RenderPassState,
    pub(crate) bound: Option<BoundTarget>,

    // Draw inputs
    pub(crate) vertex_range: (u32, u32),
    /// (stride, vertices) of a reserved but uncommitted vertex region
    pub(crate) vertex_map: Option<(u32, u32)>,
    pub(crate) index_range: (u32, u32),
    pub(crate) vs_cb: Option<VsConstantBuffer>,
    pub(crate) ps_cb: Option<PsConstantBuffer>,
    pub(crate) tfx_handles: [Option<SurfaceHandle>; 4],
    pub(crate) utility_push: Vec<u8>,

    // Presentation
    pub(crate) window: WindowInfo,
    pub(crate) swap_chain: Option<SwapChainInfo>,
    pub(crate) swap_images: HashMap<ImageId, Surface>,
    pub(crate) presenting: Option<ImageId>,

    pub(crate) stats: DeviceStats,
}

impl<B: GpuBackend> GsDevice<B> {
    /// Create the device
    ///
    /// Allocates the stream buffers, the readback staging buffer, the swap
    /// chain and the fixed descriptor sets, then compiles the standard utility
    /// pipelines so a broken shader template fails here instead of mid-frame.
    ///
    /// # Arguments
    ///
    /// * `backend` - Graphics API implementation
    /// * `settings` - Renderer settings, read once
    /// * `window` - Presentation window; a headless window still gets a swap chain
    /// * `shaders` - Shader template provider
    pub fn new(
        backend: B,
        settings: RendererSettings,
        window: WindowInfo,
        shaders: Box<dyn ShaderSourceProvider>,
    ) -> Result<Self> {
        settings.validate()?;
        let mut ctx = GpuContext::new(backend);
        let limits = ctx.backend().limits();
        let b = &settings.buffers;

        let streams = [
            StreamBuffer::new(&mut ctx, "vertex", b.vertex as u32, BufferUsage::VERTEX)?,
            StreamBuffer::new(&mut ctx, "index", b.index as u32, BufferUsage::INDEX)?,
            StreamBuffer::new(&mut ctx, "vertex uniform", b.vertex_uniform as u32, BufferUsage::UNIFORM)?,
            StreamBuffer::new(&mut ctx, "fragment uniform", b.fragment_uniform as u32, BufferUsage::UNIFORM)?,
            StreamBuffer::new(&mut ctx, "texture upload", b.texture_upload as u32, BufferUsage::TRANSFER_SRC)?,
        ];

        let readback_size = settings.readback_staging_size();
        let readback_buffer = ctx
            .backend_mut()
            .create_buffer(readback_size, BufferUsage::TRANSFER_DST)
            .inspect_err(|e| log::error!("Failed to create readback staging buffer: {}", e))?;

        let tfx_uniform_set = ctx.backend_mut().allocate_persistent_descriptor_set(
            DescriptorSetLayoutKind::TfxUniforms,
            &[
                DescriptorWrite::UniformBufferDynamic {
                    binding: 0,
                    buffer: streams[StreamKind::VertexUniform as usize].buffer(),
                    range: std::mem::size_of::<VsConstantBuffer>() as u64,
                },
                DescriptorWrite::UniformBufferDynamic {
                    binding: 1,
                    buffer: streams[StreamKind::FragmentUniform as usize].buffer(),
                    range: std::mem::size_of::<PsConstantBuffer>() as u64,
                },
            ],
        )?;

        let swap_chain = match ctx.backend_mut().create_swap_chain(&window) {
            Ok(info) => Some(info),
            Err(e) => {
                log::warn!("Running without a swap chain: {}", e);
                None
            }
        };

        // 1x1 black texture bound to unused sampler slots
        let mut surfaces = SurfaceArena::new();
        let null_image = ctx.backend_mut().create_image(&ImageDesc {
            width: 1,
            height: 1,
            levels: 1,
            layers: 1,
            format: COLOR_FORMAT,
            samples: 1,
            usage: SurfaceKind::Texture.usage(),
        })?;
        let mut null = Surface::new(SurfaceKind::Texture, 1, 1, 1, COLOR_FORMAT, null_image);
        null.transition_to(ctx.backend_mut(), ImageLayout::TransferDst);
        ctx.backend_mut()
            .cmd_clear_color_image(null_image, ImageLayout::TransferDst, [0.0; 4]);
        null.transition_to(ctx.backend_mut(), ImageLayout::ShaderReadOnly);
        let null_texture = surfaces.insert(null);

        let mut samplers = SamplerCache::new();
        let point_sampler = samplers.get(&mut ctx, SamplerSelector::point(), 1)?;
        let linear_sampler = samplers.get(&mut ctx, SamplerSelector::linear(), 1)?;

        let mut device = Self {
            ctx,
            settings,
            surfaces,
            pool: Vec::new(),
            null_texture,
            streams,
            readback_buffer,
            readback_size,
            uniform_alignment: limits.min_uniform_buffer_offset_alignment.max(1),
            tfx_uniform_set,
            shaders: ShaderCache::new(shaders),
            pipelines: PipelineCache::new(),
            samplers,
            point_sampler,
            linear_sampler,
            state: StateTracker::new(),
            pass: RenderPassState::NoPass,
            bound: None,
            vertex_range: (0, 0),
            vertex_map: None,
            index_range: (0, 0),
            vs_cb: None,
            ps_cb: None,
            tfx_handles: [None; 4],
            utility_push: Vec::new(),
            window,
            swap_chain,
            swap_images: HashMap::new(),
            presenting: None,
            stats: DeviceStats::default(),
        };
        device.create_standard_pipelines()?;

        log::info!(
            "GS device ready on '{}': {}x upscale, {} utility pipelines",
            device.ctx.backend().name(),
            device.settings.upscale_multiplier,
            device.pipelines.utility_count()
        );
        Ok(device)
    }

    fn create_standard_pipelines(&mut self) -> Result<()> {
        let mut keys = Vec::new();
        for shader in ShaderConvert::ALL {
            let target = if shader.is_datm() {
                UtilityTarget::DateSetup
            } else if shader.is_depth_output() {
                UtilityTarget::Depth
            } else {
                UtilityTarget::Color(shader.output_format().unwrap_or(COLOR_FORMAT))
            };
            keys.push(UtilityKey::new(UtilityProgram::Convert(shader), target));
            if shader.is_present() {
                if let Some(sc) = self.swap_chain {
                    keys.push(UtilityKey::new(
                        UtilityProgram::Convert(shader),
                        UtilityTarget::Present(sc.format),
                    ));
                }
            }
        }
        for i in 0..2 {
            keys.push(UtilityKey::new(UtilityProgram::Merge(i), UtilityTarget::Color(COLOR_FORMAT)).blended());
        }
        for i in 0..4 {
            keys.push(UtilityKey::new(UtilityProgram::Interlace(i), UtilityTarget::Color(COLOR_FORMAT)));
        }
        for key in keys {
            self.pipelines
                .get_or_create_utility(&mut self.ctx, &mut self.shaders, &key)?;
        }
        Ok(())
    }

    pub fn context(&self) -> &GpuContext<B> {
        &self.ctx
    }

    pub fn backend(&self) -> &B {
        self.ctx.backend()
    }

    pub fn backend_mut(&mut self) -> &mut B {
        self.ctx.backend_mut()
    }

    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    pub fn state(&self) -> &StateTracker {
        &self.state
    }

    /// Number of presented frames
    pub fn frame(&self) -> u64 {
        self.ctx.frame_index()
    }

    pub fn upscale_multiplier(&self) -> u32 {
        self.settings.upscale_multiplier
    }

    pub fn stream(&self, kind: StreamKind) -> &StreamBuffer {
        &self.streams[kind as usize]
    }

    pub fn readback_capacity(&self) -> u64 {
        self.readback_size
    }

    pub fn point_sampler(&self) -> SamplerId {
        self.point_sampler
    }

    pub fn linear_sampler(&self) -> SamplerId {
        self.linear_sampler
    }

    // Surfaces

    pub fn surface(&self, handle: SurfaceHandle) -> Result<&Surface> {
        self.surfaces.get(handle)
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    pub fn pooled_surface_count(&self) -> usize {
        self.pool.len()
    }

    fn surface_dimensions(&self, kind: SurfaceKind, width: u32, height: u32, mipmap: bool) -> (u32, u32, u32) {
        let max = self.ctx.backend().limits().max_image_dimension.max(1);
        let w = width.clamp(1, max);
        let h = height.clamp(1, max);
        let levels = if mipmap && kind == SurfaceKind::Texture {
            mip_levels(w, h)
        } else {
            1
        };
        (w, h, levels)
    }

    /// Create a surface
    ///
    /// Sizes are clamped to `1..=max_image_dimension`. Color targets start
    /// cleared to zero and depth targets to depth 0 / stencil 0; textures
    /// start undefined.
    pub fn create_surface(
        &mut self,
        kind: SurfaceKind,
        width: u32,
        height: u32,
        format: Format,
        mipmap: bool,
    ) -> Result<SurfaceHandle> {
        let (w, h, levels) = self.surface_dimensions(kind, width, height, mipmap);
        if (kind == SurfaceKind::DepthStencil) != format.is_depth() {
            return Err(GsError::ImageCreation {
                width: w,
                height: h,
                format,
                reason: format!("{:?} can't back a {:?} surface", format, kind),
            });
        }
        let image = self
            .ctx
            .backend_mut()
            .create_image(&ImageDesc {
                width: w,
                height: h,
                levels,
                layers: 1,
                format,
                samples: 1,
                usage: kind.usage(),
            })
            .inspect_err(|e| log::error!("Failed to create {:?} surface: {}", kind, e))?;

        let mut surface = Surface::new(kind, w, h, levels, format, image);
        surface.last_frame_used = self.ctx.frame_index();
        let handle = self.surfaces.insert(surface);
        self.stats.surfaces_created += 1;
        log::trace!("Created {:?} surface {} {}x{} {:?}", kind, handle, w, h, format);

        if kind.is_target() {
            self.initialize_target(handle)?;
        }
        Ok(handle)
    }

    fn initialize_target(&mut self, handle: SurfaceHandle) -> Result<()> {
        self.end_render_pass();
        let surface = self.surfaces.get_mut(handle)?;
        let backend = self.ctx.backend_mut();
        surface.transition_to(backend, ImageLayout::TransferDst);
        if surface.is_depth() {
            backend.cmd_clear_depth_stencil_image(
                surface.image(),
                ImageLayout::TransferDst,
                0.0,
                0,
                ClearAspects::DEPTH | ClearAspects::STENCIL,
            );
        } else {
            backend.cmd_clear_color_image(surface.image(), ImageLayout::TransferDst, [0.0; 4]);
        }
        surface.transition_to(backend, surface.kind().working_layout());
        Ok(())
    }

    /// Surface from the pool when an identical one is available, else a new one
    ///
    /// Reused targets are cleared like new ones; reused textures are marked
    /// discarded.
    pub fn fetch_surface(
        &mut self,
        kind: SurfaceKind,
        width: u32,
        height: u32,
        format: Format,
        mipmap: bool,
    ) -> Result<SurfaceHandle> {
        let (w, h, levels) = self.surface_dimensions(kind, width, height, mipmap);
        let found = self.pool.iter().position(|&p| {
            self.surfaces
                .get(p)
                .is_ok_and(|s| s.matches(kind, w, h, format, levels))
        });
        let Some(index) = found else {
            return self.create_surface(kind, width, height, format, mipmap);
        };

        let handle = self.pool.remove(index);
        let frame = self.ctx.frame_index();
        let surface = self.surfaces.get_mut(handle)?;
        surface.last_frame_used = frame;
        surface.discarded = kind == SurfaceKind::Texture;
        if kind.is_target() {
            self.initialize_target(handle)?;
        }
        log::trace!("Reused {:?} surface {} {}x{}", kind, handle, w, h);
        Ok(handle)
    }

    /// Return a surface to the pool for reuse by `fetch_surface`
    pub fn recycle(&mut self, handle: SurfaceHandle) {
        if handle == self.null_texture || !self.surfaces.contains(handle) || self.pool.contains(&handle) {
            return;
        }
        self.detach_surface(handle);
        let frame = self.ctx.frame_index();
        if let Ok(surface) = self.surfaces.get_mut(handle) {
            surface.last_frame_used = frame;
        }
        self.pool.push(handle);
        self.stats.surfaces_recycled += 1;

        while self.pool.len() > POOL_MAX_SIZE {
            let oldest = self.pool.remove(0);
            self.destroy_surface(oldest);
        }
    }

    /// Destroy pooled surfaces that sat unused for too long
    pub fn age_pool(&mut self) {
        let frame = self.ctx.frame_index();
        let (stale, keep): (Vec<_>, Vec<_>) = self.pool.iter().copied().partition(|&h| {
            self.surfaces
                .get(h)
                .map_or(true, |s| frame.saturating_sub(s.last_frame_used) > POOL_MAX_AGE)
        });
        self.pool = keep;
        for handle in stale {
            self.destroy_surface(handle);
        }
    }

    /// Forget every binding that references `handle`
    fn detach_surface(&mut self, handle: SurfaceHandle) {
        let uses_target = match self.bound.map(|b| b.target) {
            Some(DrawTarget::Surfaces { rt, ds }) => rt == Some(handle) || ds == Some(handle),
            _ => false,
        };
        if uses_target {
            self.end_render_pass();
            self.bound = None;
        }
        for slot in self.tfx_handles.iter_mut() {
            if *slot == Some(handle) {
                *slot = None;
            }
        }
        if let Ok(surface) = self.surfaces.get(handle) {
            self.state.unbind_image(surface.image());
        }
    }

    /// Destroy a surface and every framebuffer built on it
    ///
    /// The partner of a linked framebuffer loses its cache entry too. GPU
    /// objects are released once the current command buffer retires.
    pub fn destroy_surface(&mut self, handle: SurfaceHandle) {
        if handle == self.null_texture {
            return;
        }
        self.detach_surface(handle);
        self.pool.retain(|&p| p != handle);
        let Some(surface) = self.surfaces.remove(handle) else {
            log::warn!("Destroying unknown surface {}", handle);
            return;
        };
        for (partner, framebuffer) in &surface.framebuffers {
            if let Some(p) = partner {
                if let Ok(other) = self.surfaces.get_mut(*p) {
                    other.framebuffers.remove(&Some(handle));
                }
            }
            self.ctx.defer_destroy(PendingResource::Framebuffer(*framebuffer));
        }
        self.ctx.defer_destroy(PendingResource::Image(surface.image()));
        log::trace!("Destroyed surface {}", handle);
    }

    /// Record a layout transition, ending the open pass first if one is needed
    pub fn transition_surface(&mut self, handle: SurfaceHandle, layout: ImageLayout) -> Result<()> {
        if self.surfaces.get(handle)?.layout() == layout {
            return Ok(());
        }
        self.end_render_pass();
        self.surfaces
            .get_mut(handle)?
            .transition_to(self.ctx.backend_mut(), layout);
        Ok(())
    }

    /// Framebuffer pairing `rt` and `ds`, built on first use
    ///
    /// The framebuffer is cached in both surfaces' maps, each keyed by the
    /// other, so destroying either side invalidates it.
    pub(crate) fn framebuffer_for(
        &mut self,
        rt: Option<SurfaceHandle>,
        ds: Option<SurfaceHandle>,
    ) -> Result<FramebufferId> {
        let (primary, partner) = match (rt, ds) {
            (Some(r), d) => (r, d),
            (None, Some(d)) => (d, None),
            (None, None) => return Err(GsError::RenderPass("framebuffer without attachments".to_string())),
        };
        if let Some(fb) = self.surfaces.get(primary)?.framebuffers.get(&partner) {
            return Ok(*fb);
        }

        let color = match rt {
            Some(h) => {
                let s = self.surfaces.get(h)?;
                if !matches!(s.kind(), SurfaceKind::RenderTarget | SurfaceKind::Offscreen) {
                    return Err(GsError::SurfaceTypeMismatch {
                        operation: "framebuffer color attachment",
                        expected: SurfaceKind::RenderTarget,
                        found: s.kind(),
                    });
                }
                Some((s.image(), s.format()))
            }
            None => None,
        };
        let depth = match ds {
            Some(h) => {
                let s = self.surfaces.get(h)?;
                if s.kind() != SurfaceKind::DepthStencil {
                    return Err(GsError::SurfaceTypeMismatch {
                        operation: "framebuffer depth attachment",
                        expected: SurfaceKind::DepthStencil,
                        found: s.kind(),
                    });
                }
                Some((s.image(), s.format()))
            }
            None => None,
        };

        let key = RenderPassKey {
            color: color.map(|c| c.1),
            depth: depth.map(|d| d.1),
            color_load: LoadOp::Load,
            depth_load: LoadOp::Load,
            stencil_load: LoadOp::Load,
        };
        let backend = self.ctx.backend_mut();
        let render_pass = backend.render_pass(&key)?;
        let framebuffer = backend.create_framebuffer(render_pass, color.map(|c| c.0), depth.map(|d| d.0))?;

        self.surfaces.get_mut(primary)?.framebuffers.insert(partner, framebuffer);
        if let Some(p) = partner {
            self.surfaces.get_mut(p)?.framebuffers.insert(Some(primary), framebuffer);
        }
        Ok(framebuffer)
    }

    // Render passes

    pub fn in_render_pass(&self) -> bool {
        self.pass.in_pass()
    }

    pub fn render_pass_state(&self) -> RenderPassState {
        self.pass
    }

    /// True iff `render_pass` is open and `rect` lies inside its area
    pub fn check_render_pass(&self, render_pass: crate::core::backend::RenderPassId, rect: &Rect) -> bool {
        self.pass.check(render_pass, rect)
    }

    /// Whether the open pass can take draws for `key` inside `area` as is
    pub(crate) fn pass_covers(&self, key: &RenderPassKey, area: &Rect) -> bool {
        let compatible = self.pass.key().is_some_and(|k| k.is_compatible(key));
        compatible && self.pass.area().is_some_and(|a| a.contains(area))
    }

    /// Begin a pass on the bound framebuffer, ending any open one first
    pub fn begin_render_pass(&mut self, key: RenderPassKey, area: Rect, clear: &[ClearValue]) -> Result<()> {
        let bound = self
            .bound
            .ok_or_else(|| GsError::RenderPass("render pass begun without a framebuffer".to_string()))?;
        if !RenderPassKey::is_compatible(&key, &bound.pass_key(LoadOp::Load)) {
            return Err(GsError::RenderPass(format!(
                "pass {:?} does not match the bound framebuffer",
                key
            )));
        }
        self.end_render_pass();
        let render_pass = self.ctx.backend_mut().render_pass(&key)?;
        let area = area.intersect(&bound.rect());
        self.ctx
            .backend_mut()
            .cmd_begin_render_pass(render_pass, bound.framebuffer, area, clear);
        self.pass = RenderPassState::InPass {
            render_pass,
            key,
            area,
        };
        Ok(())
    }

    pub fn end_render_pass(&mut self) {
        if self.pass.in_pass() {
            self.ctx.backend_mut().cmd_end_render_pass();
            self.pass = RenderPassState::NoPass;
        }
    }

    /// Make sure a pass covering `area` is open on the bound framebuffer
    ///
    /// A compatible open pass is kept; anything else is restarted with load
    /// ops over the whole target.
    pub(crate) fn ensure_render_pass(&mut self, area: &Rect) -> Result<()> {
        let bound = self
            .bound
            .ok_or_else(|| GsError::RenderPass("draw without a render target".to_string()))?;
        let key = bound.pass_key(LoadOp::Load);
        if !self.pass_covers(&key, area) {
            self.begin_render_pass(key, bound.rect(), &[])?;
        }
        Ok(())
    }

    // Submission

    /// Submit the recorded commands
    ///
    /// Ends any open pass, submits, optionally blocks until the GPU is done,
    /// and invalidates cached bind state.
    pub fn execute_command_buffer(&mut self, wait: bool) -> Result<()> {
        self.end_render_pass();
        let fence = self.ctx.submit()?;
        if wait {
            self.ctx.wait_for_fence(fence)?;
        }
        self.invalidate_cached_state();
        Ok(())
    }

    /// Flush, then reopen the pass that was open (with load ops)
    pub fn execute_command_buffer_and_restart_render_pass(&mut self) -> Result<()> {
        let restart = match self.pass {
            RenderPassState::InPass { key, area, .. } => Some((key.load_variant(), area)),
            RenderPassState::NoPass => None,
        };
        self.stats.forced_flushes += 1;
        self.execute_command_buffer(false)?;
        if let Some((key, area)) = restart {
            self.begin_render_pass(key, area, &[])?;
        }
        Ok(())
    }

    /// Forget bound state; everything is rebound before the next draw
    pub fn invalidate_cached_state(&mut self) {
        self.state.invalidate();
    }

    /// Push bytes into a stream buffer, flushing once when it is full
    pub(crate) fn stream_push(&mut self, kind: StreamKind, data: &[u8], alignment: u32) -> Result<u32> {
        let index = kind as usize;
        if let Some(offset) = self.streams[index].push(&mut self.ctx, data, alignment)? {
            return Ok(offset);
        }
        log::debug!(
            "{} stream buffer full ({} bytes requested), flushing",
            self.streams[index].name(),
            data.len()
        );
        self.execute_command_buffer_and_restart_render_pass()?;
        self.streams[index]
            .push(&mut self.ctx, data, alignment)?
            .ok_or_else(|| {
                log::error!(
                    "{} stream buffer still full after a flush",
                    self.streams[index].name()
                );
                self.streams[index].too_small(data.len() as u64)
            })
    }

    /// Wait for the GPU and release everything queued for destruction
    pub fn wait_idle(&mut self) -> Result<()> {
        self.end_render_pass();
        self.ctx.submit()?;
        self.ctx.wait_idle()?;
        self.invalidate_cached_state();
        Ok(())
    }

    // Pipeline warm-up

    pub fn save_pipeline_warmup<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.pipelines.save_warmup_index(path)
    }

    /// Compile every draw pipeline listed in a warm-up index
    ///
    /// # Returns
    ///
    /// Number of pipelines compiled; failures are logged and skipped
    pub fn warm_up_pipelines<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let selectors = PipelineCache::load_warmup_index(path)?;
        let scale = self.settings.upscale_multiplier;
        let mut compiled = 0;
        for sel in &selectors {
            match self
                .pipelines
                .get_or_create_tfx(&mut self.ctx, &mut self.shaders, sel, scale)
            {
                Ok(_) => compiled += 1,
                Err(e) => log::warn!("Skipping warm-up pipeline {:#026x}: {}", sel.key(), e),
            }
        }
        log::info!("Warmed up {} of {} draw pipelines", compiled, selectors.len());
        Ok(compiled)
    }
}

impl<B: GpuBackend> Drop for GsDevice<B> {
    fn drop(&mut self) {
        self.end_render_pass();
        if let Err(e) = self.ctx.submit().and_then(|_| self.ctx.wait_idle()) {
            log::error!("GPU did not go idle at shutdown: {}", e);
        }
        // Linked framebuffers appear in both partners' maps
        let mut framebuffers = HashSet::new();
        for handle in self.surfaces.handles() {
            if let Some(surface) = self.surfaces.remove(handle) {
                framebuffers.extend(surface.framebuffers.values().copied());
                self.ctx.defer_destroy(PendingResource::Image(surface.image()));
            }
        }
        for (_, surface) in self.swap_images.drain() {
            framebuffers.extend(surface.framebuffers.values().copied());
        }
        for framebuffer in framebuffers {
            self.ctx.defer_destroy(PendingResource::Framebuffer(framebuffer));
        }
        for stream in &self.streams {
            self.ctx.defer_destroy(PendingResource::Buffer(stream.buffer()));
        }
        self.pipelines.destroy(&mut self.ctx);
        self.shaders.destroy(&mut self.ctx);
        self.samplers.destroy(&mut self.ctx);
        self.ctx.defer_destroy(PendingResource::Buffer(self.readback_buffer));
        self.ctx.backend_mut().destroy_swap_chain();
        self.ctx.collect_garbage();
    }
}
