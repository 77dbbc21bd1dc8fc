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

//! Deferred draw state
//!
//! Setters compare against the cached value and only mark the matching flag
//! dirty when something actually changed. [`StateTracker::apply_base_state`]
//! then issues exactly the binds the dirty flags ask for.

use bitflags::bitflags;

use crate::core::backend::{
    BufferId, DescriptorSetId, GpuBackend, ImageId, PipelineId, PipelineLayoutKind,
    RenderPassId, RenderPassKey, SamplerId, Viewport,
};
use crate::core::types::Rect;

bitflags! {
    /// State that must be re-applied before the next draw
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct DirtyFlags: u32 {
        const TFX_TEXTURES = 1 << 0;
        const TFX_SAMPLERS = 1 << 1;
        const TFX_DYNAMIC_OFFSETS = 1 << 2;
        const UTILITY_TEXTURE = 1 << 3;
        const BLEND_CONSTANTS = 1 << 4;
        const VERTEX_BUFFER = 1 << 5;
        const INDEX_BUFFER = 1 << 6;
        const VIEWPORT = 1 << 7;
        const SCISSOR = 1 << 8;
        const PIPELINE = 1 << 9;
        /// Descriptor sets must be rebound in full
        const DESCRIPTOR_SETS = 1 << 10;

        const BASE = Self::VERTEX_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::PIPELINE.bits()
            | Self::VIEWPORT.bits()
            | Self::SCISSOR.bits()
            | Self::BLEND_CONSTANTS.bits();
        const TFX = Self::BASE.bits() | Self::TFX_TEXTURES.bits() | Self::TFX_SAMPLERS.bits();
        const UTILITY = Self::BASE.bits() | Self::UTILITY_TEXTURE.bits();
        const ALL = Self::TFX.bits()
            | Self::TFX_DYNAMIC_OFFSETS.bits()
            | Self::UTILITY_TEXTURE.bits()
            | Self::DESCRIPTOR_SETS.bits();
    }
}

/// Cached binding state of the command buffer being recorded
#[derive(Debug, Clone)]
pub struct StateTracker {
    dirty: DirtyFlags,
    pub(crate) vertex_buffer: Option<(BufferId, u64)>,
    pub(crate) index_buffer: Option<(BufferId, u64)>,
    pub(crate) pipeline: Option<PipelineId>,
    pub(crate) viewport: Option<Viewport>,
    pub(crate) scissor: Rect,
    pub(crate) blend_constants: [f32; 4],
    /// Layout whose descriptor sets are currently bound
    pub(crate) current_layout: Option<PipelineLayoutKind>,
    pub(crate) tfx_textures: [Option<ImageId>; 4],
    pub(crate) tfx_samplers: [Option<SamplerId>; 2],
    pub(crate) tfx_dynamic_offsets: [u32; 2],
    pub(crate) tfx_sets: [Option<DescriptorSetId>; 3],
    pub(crate) utility_texture: Option<(ImageId, SamplerId)>,
    pub(crate) utility_set: Option<DescriptorSetId>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            dirty: DirtyFlags::ALL,
            vertex_buffer: None,
            index_buffer: None,
            pipeline: None,
            viewport: None,
            scissor: Rect::default(),
            blend_constants: [0.0; 4],
            current_layout: None,
            tfx_textures: [None; 4],
            tfx_samplers: [None; 2],
            tfx_dynamic_offsets: [0; 2],
            tfx_sets: [None; 3],
            utility_texture: None,
            utility_set: None,
        }
    }

    pub fn mark_dirty(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    /// True if any of `flags` is dirty
    pub fn is_dirty(&self, flags: DirtyFlags) -> bool {
        self.dirty.intersects(flags)
    }

    pub fn clear_dirty(&mut self, flags: DirtyFlags) {
        self.dirty &= !flags;
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    /// Forget everything bound; a fresh command buffer starts empty
    pub fn invalidate(&mut self) {
        self.dirty = DirtyFlags::ALL;
        self.current_layout = None;
        self.tfx_sets = [None; 3];
        self.utility_set = None;
    }

    pub fn set_vertex_buffer(&mut self, buffer: BufferId, offset: u64) {
        if self.vertex_buffer != Some((buffer, offset)) {
            self.vertex_buffer = Some((buffer, offset));
            self.mark_dirty(DirtyFlags::VERTEX_BUFFER);
        }
    }

    pub fn set_index_buffer(&mut self, buffer: BufferId, offset: u64) {
        if self.index_buffer != Some((buffer, offset)) {
            self.index_buffer = Some((buffer, offset));
            self.mark_dirty(DirtyFlags::INDEX_BUFFER);
        }
    }

    pub fn set_pipeline(&mut self, pipeline: PipelineId) {
        if self.pipeline != Some(pipeline) {
            self.pipeline = Some(pipeline);
            self.mark_dirty(DirtyFlags::PIPELINE);
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        if self.viewport != Some(viewport) {
            self.viewport = Some(viewport);
            self.mark_dirty(DirtyFlags::VIEWPORT);
        }
    }

    pub fn set_scissor(&mut self, scissor: Rect) {
        if self.scissor != scissor {
            self.scissor = scissor;
            self.mark_dirty(DirtyFlags::SCISSOR);
        }
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        if self.blend_constants != constants {
            self.blend_constants = constants;
            self.mark_dirty(DirtyFlags::BLEND_CONSTANTS);
        }
    }

    pub fn set_tfx_texture(&mut self, slot: usize, image: Option<ImageId>) {
        if self.tfx_textures[slot] != image {
            self.tfx_textures[slot] = image;
            self.mark_dirty(DirtyFlags::TFX_TEXTURES);
        }
    }

    pub fn set_tfx_sampler(&mut self, slot: usize, sampler: Option<SamplerId>) {
        if self.tfx_samplers[slot] != sampler {
            self.tfx_samplers[slot] = sampler;
            self.mark_dirty(DirtyFlags::TFX_SAMPLERS);
        }
    }

    pub fn set_tfx_dynamic_offset(&mut self, index: usize, offset: u32) {
        if self.tfx_dynamic_offsets[index] != offset {
            self.tfx_dynamic_offsets[index] = offset;
            self.mark_dirty(DirtyFlags::TFX_DYNAMIC_OFFSETS);
        }
    }

    pub fn set_utility_texture(&mut self, image: ImageId, sampler: SamplerId) {
        if self.utility_texture != Some((image, sampler)) {
            self.utility_texture = Some((image, sampler));
            self.mark_dirty(DirtyFlags::UTILITY_TEXTURE);
        }
    }

    /// Drop every reference to `image` so a stale handle is never bound
    pub fn unbind_image(&mut self, image: ImageId) {
        for slot in 0..self.tfx_textures.len() {
            if self.tfx_textures[slot] == Some(image) {
                self.set_tfx_texture(slot, None);
            }
        }
        if matches!(self.utility_texture, Some((i, _)) if i == image) {
            self.utility_texture = None;
            self.mark_dirty(DirtyFlags::UTILITY_TEXTURE);
        }
    }

    /// Issue the binds for the dirty base state and clear those flags
    pub fn apply_base_state<B: GpuBackend>(&mut self, backend: &mut B) {
        if self.is_dirty(DirtyFlags::VERTEX_BUFFER) {
            if let Some((buffer, offset)) = self.vertex_buffer {
                backend.cmd_bind_vertex_buffer(buffer, offset);
            }
        }
        if self.is_dirty(DirtyFlags::INDEX_BUFFER) {
            if let Some((buffer, offset)) = self.index_buffer {
                backend.cmd_bind_index_buffer(buffer, offset);
            }
        }
        if self.is_dirty(DirtyFlags::PIPELINE) {
            if let Some(pipeline) = self.pipeline {
                backend.cmd_bind_pipeline(pipeline);
            }
        }
        if self.is_dirty(DirtyFlags::VIEWPORT) {
            if let Some(viewport) = self.viewport {
                backend.cmd_set_viewport(&viewport);
            }
        }
        if self.is_dirty(DirtyFlags::SCISSOR) {
            backend.cmd_set_scissor(self.scissor);
        }
        if self.is_dirty(DirtyFlags::BLEND_CONSTANTS) {
            backend.cmd_set_blend_constants(self.blend_constants);
        }
        self.clear_dirty(DirtyFlags::BASE);
    }
}

/// Render pass state machine
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RenderPassState {
    #[default]
    NoPass,
    InPass {
        render_pass: RenderPassId,
        key: RenderPassKey,
        area: Rect,
    },
}

impl RenderPassState {
    pub fn in_pass(&self) -> bool {
        matches!(self, RenderPassState::InPass { .. })
    }

    /// True iff `render_pass` is the open pass and `rect` lies inside its area
    pub fn check(&self, render_pass: RenderPassId, rect: &Rect) -> bool {
        match self {
            RenderPassState::NoPass => false,
            RenderPassState::InPass {
                render_pass: current,
                area,
                ..
            } => *current == render_pass && area.contains(rect),
        }
    }

    pub fn key(&self) -> Option<RenderPassKey> {
        match self {
            RenderPassState::NoPass => None,
            RenderPassState::InPass { key, .. } => Some(*key),
        }
    }

    pub fn area(&self) -> Option<Rect> {
        match self {
            RenderPassState::NoPass => None,
            RenderPassState::InPass { area, .. } => Some(*area),
        }
    }
}
