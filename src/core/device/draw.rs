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

//! Draw state: geometry upload, uniforms, resources, targets and draws

use crate::core::backend::{
    DescriptorSetLayoutKind, DescriptorWrite, GpuBackend, ImageLayout, PipelineLayoutKind,
    SamplerId, Viewport,
};
use crate::core::error::{GsError, Result};
use crate::core::layout::{PsConstantBuffer, VsConstantBuffer};
use crate::core::types::Rect;

use super::blend::blend_constant;
use super::selector::{PipelineSelector, SamplerSelector};
use super::state::DirtyFlags;
use super::surface::SurfaceHandle;
use super::{BoundTarget, DrawTarget, GsDevice, StreamKind};

impl<B: GpuBackend> GsDevice<B> {
    /// Upload vertices
    ///
    /// The vertex buffer stays bound at offset 0; the upload is aligned to
    /// the stride so its position is a whole vertex index.
    ///
    /// # Returns
    ///
    /// Index of the first uploaded vertex
    pub fn ia_set_vertex_buffer(&mut self, data: &[u8], stride: u32) -> Result<u32> {
        if self.vertex_map.take().is_some() {
            log::warn!("Vertex upload while the vertex buffer is mapped, dropping the mapping");
        }
        let stride = stride.max(1);
        let offset = self.stream_push(StreamKind::Vertex, data, stride)?;
        let start = offset / stride;
        self.vertex_range = (start, data.len() as u32 / stride);
        let buffer = self.streams[StreamKind::Vertex as usize].buffer();
        self.state.set_vertex_buffer(buffer, 0);
        Ok(start)
    }

    /// Reserve room for `count` vertices and return host memory to write
    /// them into in place
    ///
    /// The region belongs to the vertex stream until
    /// [`ia_unmap_vertex_buffer`](Self::ia_unmap_vertex_buffer) commits it.
    /// A full ring is flushed once, as with
    /// [`ia_set_vertex_buffer`](Self::ia_set_vertex_buffer).
    ///
    /// # Arguments
    ///
    /// * `stride` - Size of one vertex in bytes
    /// * `count` - Most vertices that will be written
    pub fn ia_map_vertex_buffer(&mut self, stride: u32, count: u32) -> Result<&mut [u8]> {
        let stride = stride.max(1);
        let index = StreamKind::Vertex as usize;
        let requested = stride as u64 * count as u64;
        let size = match u32::try_from(requested) {
            Ok(size) if size.saturating_add(stride) <= self.streams[index].size() => size,
            _ => return Err(self.streams[index].too_small(requested)),
        };

        if !self.streams[index].reserve_memory(&mut self.ctx, size, stride) {
            log::debug!("Vertex stream full ({} bytes requested for mapping), flushing", size);
            self.execute_command_buffer_and_restart_render_pass()?;
            if !self.streams[index].reserve_memory(&mut self.ctx, size, stride) {
                return Err(self.streams[index].too_small(requested));
            }
        }
        self.vertex_map = Some((stride, count));

        let name = self.streams[index].name();
        let capacity = self.streams[index].size() as u64;
        self.streams[index]
            .host_slice(&mut self.ctx, size as usize)
            .ok_or_else(|| GsError::BufferCreation {
                size: capacity,
                reason: format!("stream buffer '{}' is not host visible", name),
            })
    }

    /// Commit the first `count` vertices written through
    /// [`ia_map_vertex_buffer`](Self::ia_map_vertex_buffer) and make them
    /// the draw's vertices
    ///
    /// # Returns
    ///
    /// Index of the first committed vertex
    pub fn ia_unmap_vertex_buffer(&mut self, count: u32) -> Result<u32> {
        let (stride, mapped) = self
            .vertex_map
            .take()
            .ok_or_else(|| GsError::InvalidPrimitive("vertex buffer is not mapped".to_string()))?;
        if count > mapped {
            return Err(GsError::InvalidPrimitive(format!(
                "{} vertices committed but only {} mapped",
                count, mapped
            )));
        }

        let ring = &mut self.streams[StreamKind::Vertex as usize];
        let start = ring.current_offset() / stride;
        ring.commit_memory(&mut self.ctx, count * stride);
        self.vertex_range = (start, count);
        let buffer = ring.buffer();
        self.state.set_vertex_buffer(buffer, 0);
        Ok(start)
    }

    /// Upload 32-bit indices
    ///
    /// # Returns
    ///
    /// Index of the first uploaded index
    pub fn ia_set_index_buffer(&mut self, indices: &[u32]) -> Result<u32> {
        let offset = self.stream_push(StreamKind::Index, bytemuck::cast_slice(indices), 4)?;
        let start = offset / 4;
        self.index_range = (start, indices.len() as u32);
        let buffer = self.streams[StreamKind::Index as usize].buffer();
        self.state.set_index_buffer(buffer, 0);
        Ok(start)
    }

    /// Vertex shader constants, uploaded only when they changed
    pub fn setup_vs(&mut self, cb: &VsConstantBuffer) -> Result<()> {
        if self.vs_cb.as_ref() == Some(cb) {
            return Ok(());
        }
        let offset = self.stream_push(
            StreamKind::VertexUniform,
            bytemuck::bytes_of(cb),
            self.uniform_alignment,
        )?;
        self.vs_cb = Some(*cb);
        self.state.set_tfx_dynamic_offset(0, offset);
        Ok(())
    }

    /// Fragment shader constants, uploaded only when they changed
    pub fn setup_ps(&mut self, cb: &PsConstantBuffer) -> Result<()> {
        if self.ps_cb.as_ref() == Some(cb) {
            return Ok(());
        }
        let offset = self.stream_push(
            StreamKind::FragmentUniform,
            bytemuck::bytes_of(cb),
            self.uniform_alignment,
        )?;
        self.ps_cb = Some(*cb);
        self.state.set_tfx_dynamic_offset(1, offset);
        Ok(())
    }

    /// Bind a texture to draw slot `slot` (0 texture, 1 palette, 2 render
    /// target copy, 3 auxiliary)
    ///
    /// The surface is moved to shader-read-only layout, ending the open pass
    /// if that needs a barrier.
    pub fn ps_set_shader_resource(&mut self, slot: usize, surface: Option<SurfaceHandle>) -> Result<()> {
        if slot >= self.tfx_handles.len() {
            return Err(GsError::RenderPass(format!("texture slot {} out of range", slot)));
        }
        let image = match surface {
            Some(handle) => {
                self.transition_surface(handle, ImageLayout::ShaderReadOnly)?;
                Some(self.surfaces.get(handle)?.image())
            }
            None => None,
        };
        self.tfx_handles[slot] = surface;
        self.state.set_tfx_texture(slot, image);
        Ok(())
    }

    pub fn ps_set_sampler(&mut self, slot: usize, sel: SamplerSelector) -> Result<()> {
        if slot >= 2 {
            return Err(GsError::RenderPass(format!("sampler slot {} out of range", slot)));
        }
        let sampler = self
            .samplers
            .get(&mut self.ctx, sel, self.settings.anisotropic_filtering)?;
        self.state.set_tfx_sampler(slot, Some(sampler));
        Ok(())
    }

    /// Select the draw targets
    ///
    /// Picks (or builds) the framebuffer linking `rt` and `ds`, moves both
    /// into attachment layouts and sets the viewport to the target size and
    /// the scissor to `scissor`. The open pass is ended when the framebuffer
    /// changes. Passing neither target unbinds.
    pub fn om_set_render_targets(
        &mut self,
        rt: Option<SurfaceHandle>,
        ds: Option<SurfaceHandle>,
        scissor: Rect,
    ) -> Result<()> {
        if rt.is_none() && ds.is_none() {
            self.end_render_pass();
            self.bound = None;
            return Ok(());
        }
        let framebuffer = self.framebuffer_for(rt, ds)?;
        if self.bound.map(|b| b.framebuffer) != Some(framebuffer) {
            self.end_render_pass();
        }
        if let Some(h) = rt {
            self.transition_surface(h, ImageLayout::ColorAttachment)?;
        }
        if let Some(h) = ds {
            self.transition_surface(h, ImageLayout::DepthStencilAttachment)?;
        }

        let color = rt.map(|h| self.surfaces.get(h)).transpose()?;
        let depth = ds.map(|h| self.surfaces.get(h)).transpose()?;
        let (width, height) = match (color, depth) {
            (Some(c), Some(d)) => (c.width().min(d.width()), c.height().min(d.height())),
            (Some(s), None) | (None, Some(s)) => (s.width(), s.height()),
            (None, None) => (1, 1),
        };
        let bound = BoundTarget {
            target: DrawTarget::Surfaces { rt, ds },
            framebuffer,
            color: color.map(|s| s.format()),
            depth: depth.map(|s| s.format()),
            width,
            height,
        };
        self.bound = Some(bound);
        self.state.set_viewport(Viewport::from_size(width, height));
        self.state.set_scissor(scissor.intersect(&bound.rect()));
        Ok(())
    }

    /// Resolve the pipeline for `sel` and apply draw state
    ///
    /// `afix` is the ALPHA.FIX register value; the blend constant is
    /// `afix / 128`. A pipeline that fails to build is reported as an error
    /// so the caller drops the draw.
    pub fn bind_draw_pipeline(&mut self, sel: &PipelineSelector, afix: u8) -> Result<()> {
        let scale = self.settings.upscale_multiplier;
        let pipeline = self
            .pipelines
            .get_or_create_tfx(&mut self.ctx, &mut self.shaders, sel, scale)
            .inspect_err(|e| log::error!("Dropping draw, no pipeline: {}", e))?;
        self.state.set_pipeline(pipeline);
        self.state.set_blend_constants(blend_constant(afix));
        self.apply_tfx_state()
    }

    /// Allocate and bind whatever draw descriptor state changed
    pub fn apply_tfx_state(&mut self) -> Result<()> {
        let draw_state = DirtyFlags::TFX | DirtyFlags::TFX_DYNAMIC_OFFSETS | DirtyFlags::DESCRIPTOR_SETS;
        if self.state.current_layout == Some(PipelineLayoutKind::Tfx) && !self.state.is_dirty(draw_state) {
            return Ok(());
        }
        self.prepare_tfx_textures()?;

        if !self.allocate_tfx_sets() {
            log::warn!("Descriptor pool exhausted, flushing");
            self.execute_command_buffer_and_restart_render_pass()?;
            if !self.allocate_tfx_sets() {
                log::error!("Descriptor pool exhausted after a flush");
                return Err(GsError::DescriptorPoolExhausted("allocating draw descriptor sets"));
            }
        }

        let offsets = self.state.tfx_dynamic_offsets;
        let layout_changed = self.state.current_layout != Some(PipelineLayoutKind::Tfx);
        if layout_changed || self.state.is_dirty(DirtyFlags::DESCRIPTOR_SETS) {
            let sets = match self.state.tfx_sets {
                [_, Some(textures), Some(samplers)] => [self.tfx_uniform_set, textures, samplers],
                _ => return Err(GsError::RenderPass("draw descriptor sets missing".to_string())),
            };
            self.state.tfx_sets[0] = Some(self.tfx_uniform_set);
            self.ctx
                .backend_mut()
                .cmd_bind_descriptor_sets(PipelineLayoutKind::Tfx, 0, &sets, &offsets);
        } else if self.state.is_dirty(DirtyFlags::TFX_DYNAMIC_OFFSETS) {
            self.ctx.backend_mut().cmd_bind_descriptor_sets(
                PipelineLayoutKind::Tfx,
                0,
                &[self.tfx_uniform_set],
                &offsets,
            );
        }
        self.state.current_layout = Some(PipelineLayoutKind::Tfx);
        self.state.clear_dirty(
            DirtyFlags::TFX_TEXTURES
                | DirtyFlags::TFX_SAMPLERS
                | DirtyFlags::TFX_DYNAMIC_OFFSETS
                | DirtyFlags::DESCRIPTOR_SETS,
        );
        self.state.apply_base_state(self.ctx.backend_mut());
        Ok(())
    }

    /// Bound textures must be readable before the draw is recorded
    fn prepare_tfx_textures(&mut self) -> Result<()> {
        for slot in 0..self.tfx_handles.len() {
            let Some(handle) = self.tfx_handles[slot] else {
                continue;
            };
            if !self.surfaces.contains(handle) {
                log::warn!("Texture slot {} refers to destroyed surface {}", slot, handle);
                self.tfx_handles[slot] = None;
                self.state.set_tfx_texture(slot, None);
                continue;
            }
            self.transition_surface(handle, ImageLayout::ShaderReadOnly)?;
        }
        Ok(())
    }

    /// `false` when the pool ran dry
    fn allocate_tfx_sets(&mut self) -> bool {
        let null = self
            .surfaces
            .get(self.null_texture)
            .map(|s| s.image())
            .ok();
        if self.state.is_dirty(DirtyFlags::TFX_TEXTURES) || self.state.tfx_sets[1].is_none() {
            let writes: Vec<_> = self
                .state
                .tfx_textures
                .iter()
                .enumerate()
                .filter_map(|(i, t)| {
                    t.or(null).map(|image| DescriptorWrite::SampledImage {
                        binding: i as u32,
                        image,
                    })
                })
                .collect();
            match self
                .ctx
                .backend_mut()
                .allocate_descriptor_set(DescriptorSetLayoutKind::TfxTextures, &writes)
            {
                Some(set) => self.state.tfx_sets[1] = Some(set),
                None => return false,
            }
            self.state.clear_dirty(DirtyFlags::TFX_TEXTURES);
            self.state.mark_dirty(DirtyFlags::DESCRIPTOR_SETS);
        }
        if self.state.is_dirty(DirtyFlags::TFX_SAMPLERS) || self.state.tfx_sets[2].is_none() {
            let point = self.point_sampler;
            let writes: Vec<_> = self
                .state
                .tfx_samplers
                .iter()
                .enumerate()
                .map(|(i, s)| DescriptorWrite::Sampler {
                    binding: i as u32,
                    sampler: s.unwrap_or(point),
                })
                .collect();
            match self
                .ctx
                .backend_mut()
                .allocate_descriptor_set(DescriptorSetLayoutKind::TfxSamplers, &writes)
            {
                Some(set) => self.state.tfx_sets[2] = Some(set),
                None => return false,
            }
            self.state.clear_dirty(DirtyFlags::TFX_SAMPLERS);
            self.state.mark_dirty(DirtyFlags::DESCRIPTOR_SETS);
        }
        true
    }

    /// Texture sampled by utility draws; `None` binds the null texture
    pub fn set_utility_texture(&mut self, surface: Option<SurfaceHandle>, sampler: SamplerId) -> Result<()> {
        let handle = surface.unwrap_or(self.null_texture);
        self.transition_surface(handle, ImageLayout::ShaderReadOnly)?;
        let image = self.surfaces.get(handle)?.image();
        self.state.set_utility_texture(image, sampler);
        Ok(())
    }

    /// Push constants recorded with the next utility draw; empty for none
    pub fn set_utility_push_constants(&mut self, data: &[u8]) {
        self.utility_push.clear();
        self.utility_push.extend_from_slice(data);
    }

    /// Bind the utility descriptor set and dirty base state
    pub fn apply_utility_state(&mut self) -> Result<()> {
        if self.state.is_dirty(DirtyFlags::UTILITY_TEXTURE) || self.state.utility_set.is_none() {
            if !self.allocate_utility_set()? {
                log::warn!("Descriptor pool exhausted, flushing");
                self.execute_command_buffer_and_restart_render_pass()?;
                if !self.allocate_utility_set()? {
                    log::error!("Descriptor pool exhausted after a flush");
                    return Err(GsError::DescriptorPoolExhausted("allocating utility descriptor set"));
                }
            }
        }

        let set = self
            .state
            .utility_set
            .ok_or_else(|| GsError::RenderPass("utility descriptor set missing".to_string()))?;
        if self.state.current_layout != Some(PipelineLayoutKind::Utility)
            || self.state.is_dirty(DirtyFlags::DESCRIPTOR_SETS)
        {
            self.ctx
                .backend_mut()
                .cmd_bind_descriptor_sets(PipelineLayoutKind::Utility, 0, &[set], &[]);
            self.state.current_layout = Some(PipelineLayoutKind::Utility);
            self.state.clear_dirty(DirtyFlags::DESCRIPTOR_SETS);
        }
        if !self.utility_push.is_empty() {
            self.ctx
                .backend_mut()
                .cmd_push_constants(PipelineLayoutKind::Utility, &self.utility_push);
        }
        self.state.apply_base_state(self.ctx.backend_mut());
        Ok(())
    }

    fn allocate_utility_set(&mut self) -> Result<bool> {
        let (image, sampler) = match self.state.utility_texture {
            Some(t) => t,
            None => (self.surfaces.get(self.null_texture)?.image(), self.point_sampler),
        };
        let write = DescriptorWrite::CombinedImageSampler {
            binding: 0,
            image,
            sampler,
        };
        let Some(set) = self
            .ctx
            .backend_mut()
            .allocate_descriptor_set(DescriptorSetLayoutKind::Utility, &[write])
        else {
            return Ok(false);
        };
        self.state.utility_set = Some(set);
        self.state.clear_dirty(DirtyFlags::UTILITY_TEXTURE);
        self.state.mark_dirty(DirtyFlags::DESCRIPTOR_SETS);
        Ok(true)
    }

    /// Draw the uploaded vertices
    pub fn draw_primitive(&mut self) -> Result<()> {
        let (first, count) = self.vertex_range;
        self.begin_draw()?;
        self.ctx.backend_mut().cmd_draw(count, first);
        self.stats.draws += 1;
        Ok(())
    }

    /// Draw `count` uploaded indices starting `offset` indices into the upload
    pub fn draw_indexed_primitive(&mut self, offset: u32, count: u32) -> Result<()> {
        let (first_index, uploaded) = self.index_range;
        if offset.saturating_add(count) > uploaded {
            return Err(GsError::RenderPass(format!(
                "index range {}+{} exceeds the {} uploaded indices",
                offset, count, uploaded
            )));
        }
        let first_vertex = self.vertex_range.0;
        self.begin_draw()?;
        self.ctx
            .backend_mut()
            .cmd_draw_indexed(count, first_index + offset, first_vertex as i32);
        self.stats.draws += 1;
        Ok(())
    }

    /// Draw every uploaded index
    pub fn draw_indexed(&mut self) -> Result<()> {
        self.draw_indexed_primitive(0, self.index_range.1)
    }

    /// Open a pass covering the scissor and flush state applied after it
    fn begin_draw(&mut self) -> Result<()> {
        let area = self.state.scissor;
        self.ensure_render_pass(&area)?;
        if self.state.dirty().intersects(DirtyFlags::BASE) {
            self.state.apply_base_state(self.ctx.backend_mut());
        }
        Ok(())
    }

    /// Record a dropped draw
    pub(crate) fn note_dropped_draw(&mut self, error: &GsError) {
        self.stats.dropped_draws += 1;
        log::warn!("Draw dropped: {}", error);
    }
}
