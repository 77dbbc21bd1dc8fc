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

//! Explicit GPU context
//!
//! Owns the backend and everything tied to command buffer completion: the
//! fence counters and the deferred destruction queue. Every component that
//! needs the GPU receives the context by reference.
//!
//! # Deferred destruction
//!
//! A resource handed to [`GpuContext::defer_destroy`] is tagged with the fence
//! of the command buffer currently being recorded, since that buffer (or an
//! earlier one) may still reference it. It is released once that fence has
//! completed.

use std::collections::VecDeque;

use crate::core::backend::{
    BufferId, FenceValue, FramebufferId, GpuBackend, ImageId, PipelineId, SamplerId,
    ShaderModuleId,
};
use crate::core::error::Result;

/// GPU object awaiting release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingResource {
    Image(ImageId),
    Buffer(BufferId),
    Framebuffer(FramebufferId),
    Pipeline(PipelineId),
    Sampler(SamplerId),
    ShaderModule(ShaderModuleId),
}

/// Backend plus fence bookkeeping
pub struct GpuContext<B: GpuBackend> {
    backend: B,
    frame_index: u64,
    pending: VecDeque<(FenceValue, PendingResource)>,
}

impl<B: GpuBackend> GpuContext<B> {
    pub fn new(backend: B) -> Self {
        log::info!("GPU context created on '{}'", backend.name());
        Self {
            backend,
            frame_index: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Fence the command buffer being recorded will signal
    pub fn current_fence(&self) -> FenceValue {
        self.backend.current_fence()
    }

    pub fn completed_fence(&mut self) -> FenceValue {
        self.backend.completed_fence()
    }

    /// Number of presented frames
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub(crate) fn advance_frame(&mut self) {
        self.frame_index += 1;
    }

    /// Submit the current command buffer and release completed resources
    ///
    /// # Returns
    ///
    /// The fence value of the submitted command buffer
    pub fn submit(&mut self) -> Result<FenceValue> {
        let fence = self.backend.submit()?;
        log::trace!("Submitted command buffer, fence {}", fence);
        self.collect_garbage();
        Ok(fence)
    }

    /// Block until `fence` has completed
    pub fn wait_for_fence(&mut self, fence: FenceValue) -> Result<()> {
        self.backend.wait_for_fence(fence)?;
        self.collect_garbage();
        Ok(())
    }

    pub fn wait_idle(&mut self) -> Result<()> {
        self.backend.wait_idle()?;
        self.collect_garbage();
        Ok(())
    }

    /// Queue a resource for release after the current command buffer retires
    pub fn defer_destroy(&mut self, resource: PendingResource) {
        let fence = self.backend.current_fence();
        self.pending.push_back((fence, resource));
    }

    /// Release every queued resource whose fence has completed
    pub fn collect_garbage(&mut self) {
        let completed = self.backend.completed_fence();
        while let Some(&(fence, resource)) = self.pending.front() {
            if fence > completed {
                break;
            }
            self.pending.pop_front();
            self.destroy_now(resource);
        }
    }

    /// Resources still waiting on their fence
    pub fn pending_destruction_count(&self) -> usize {
        self.pending.len()
    }

    fn destroy_now(&mut self, resource: PendingResource) {
        match resource {
            PendingResource::Image(id) => self.backend.destroy_image(id),
            PendingResource::Buffer(id) => self.backend.destroy_buffer(id),
            PendingResource::Framebuffer(id) => self.backend.destroy_framebuffer(id),
            PendingResource::Pipeline(id) => self.backend.destroy_pipeline(id),
            PendingResource::Sampler(id) => self.backend.destroy_sampler(id),
            PendingResource::ShaderModule(id) => self.backend.destroy_shader_module(id),
        }
    }
}

impl<B: GpuBackend> Drop for GpuContext<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::warn!("Failed to idle the GPU on shutdown: {}", e);
        }
        while let Some((_, resource)) = self.pending.pop_front() {
            self.destroy_now(resource);
        }
    }
}
