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

//! Ring allocator over one host-visible GPU buffer
//!
//! Vertex, index, uniform and texture upload data is written linearly into a
//! single buffer. Every command buffer remembers how far the write cursor had
//! advanced when it was recorded; once its fence completes the GPU has consumed
//! everything up to that point and the space behind it can be reused.
//!
//! # Architecture
//!
//! ```text
//!  0                gpu_position         offset                 size
//!  |  free (wrapped)  |   in flight        |  free (ahead)        |
//! ```
//!
//! The cursor never catches up with `gpu_position` from behind: allocations
//! behind the GPU keep at least one byte of distance, otherwise a full ring
//! would be indistinguishable from an empty one.
//!
//! [`StreamBuffer::reserve_memory`] returns `false` when no contiguous space
//! is available without waiting on the command buffer currently being
//! recorded. The caller then submits that command buffer and retries once.

use std::collections::VecDeque;

use crate::core::backend::{BufferId, BufferUsage, FenceValue, GpuBackend};
use crate::core::error::{GsError, Result};

use super::context::{GpuContext, PendingResource};

fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Ring buffer allocator
pub struct StreamBuffer {
    name: &'static str,
    buffer: BufferId,
    size: u32,
    current_offset: u32,
    current_space: u32,
    current_gpu_position: u32,
    /// (fence, cursor position when that command buffer was last written)
    tracked_fences: VecDeque<(FenceValue, u32)>,
}

impl StreamBuffer {
    /// Create the backing buffer
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in diagnostics
    /// * `size` - Capacity in bytes
    /// * `usage` - How the GPU consumes the data
    pub fn new<B: GpuBackend>(
        ctx: &mut GpuContext<B>,
        name: &'static str,
        size: u32,
        usage: BufferUsage,
    ) -> Result<Self> {
        let buffer = ctx.backend_mut().create_buffer(size as u64, usage)?;
        log::debug!("Created {} stream buffer ({} KiB)", name, size / 1024);
        Ok(Self {
            name,
            buffer,
            size,
            current_offset: 0,
            current_space: size,
            current_gpu_position: 0,
            tracked_fences: VecDeque::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Offset of the reserved region
    pub fn current_offset(&self) -> u32 {
        self.current_offset
    }

    /// Contiguous bytes available at the current offset
    pub fn current_space(&self) -> u32 {
        self.current_space
    }

    /// Offset the GPU is known to have consumed up to
    pub fn gpu_position(&self) -> u32 {
        self.current_gpu_position
    }

    /// Host view of the reserved region
    pub fn host_slice<'a, B: GpuBackend>(&self, ctx: &'a mut GpuContext<B>, len: usize) -> Option<&'a mut [u8]> {
        let start = self.current_offset as usize;
        let memory = ctx.backend_mut().buffer_memory(self.buffer)?;
        memory.get_mut(start..start + len)
    }

    /// Try to claim `num_bytes` bytes aligned to `alignment`
    ///
    /// # Returns
    ///
    /// `false` if the space is only available after the command buffer
    /// currently being recorded has executed, or if the request can never fit.
    pub fn reserve_memory<B: GpuBackend>(
        &mut self,
        ctx: &mut GpuContext<B>,
        num_bytes: u32,
        alignment: u32,
    ) -> bool {
        let required_bytes = num_bytes.saturating_add(alignment);
        if required_bytes > self.size {
            log::error!(
                "Stream buffer '{}': {} bytes requested but capacity is {}",
                self.name,
                num_bytes,
                self.size
            );
            return false;
        }

        self.update_gpu_position(ctx);
        self.update_current_fence_position(ctx);

        // GPU behind or level with the cursor
        if self.current_offset >= self.current_gpu_position {
            let remaining_bytes = self.size - self.current_offset;
            if required_bytes <= remaining_bytes {
                self.current_offset = align_up(self.current_offset, alignment);
                self.current_space = self.size - self.current_offset;
                return true;
            }

            // Wrap, staying strictly behind the GPU
            if required_bytes < self.current_gpu_position {
                self.current_offset = 0;
                self.current_space = self.current_gpu_position - 1;
                return true;
            }
        }

        // GPU ahead of the cursor
        if self.current_offset < self.current_gpu_position {
            let remaining_bytes = self.current_gpu_position - self.current_offset;
            if required_bytes < remaining_bytes {
                self.current_offset = align_up(self.current_offset, alignment);
                self.current_space = self.current_gpu_position - self.current_offset - 1;
                return true;
            }
        }

        if self.wait_for_clear_space(ctx, required_bytes) {
            let aligned = align_up(self.current_offset, alignment);
            self.current_space -= aligned - self.current_offset;
            self.current_offset = aligned;
            return true;
        }

        log::debug!(
            "Stream buffer '{}' full ({} bytes at offset {}, gpu at {})",
            self.name,
            num_bytes,
            self.current_offset,
            self.current_gpu_position
        );
        false
    }

    /// Advance past `final_num_bytes` written into the reserved region
    pub fn commit_memory<B: GpuBackend>(&mut self, ctx: &mut GpuContext<B>, final_num_bytes: u32) {
        debug_assert!(self.current_offset + final_num_bytes <= self.size);
        debug_assert!(final_num_bytes <= self.current_space);

        self.current_offset += final_num_bytes;
        self.current_space -= final_num_bytes;
        self.update_current_fence_position(ctx);
    }

    /// Reserve, copy and commit in one step
    ///
    /// # Returns
    ///
    /// The offset of the data in the buffer, or `None` if the ring is full
    pub fn push<B: GpuBackend>(
        &mut self,
        ctx: &mut GpuContext<B>,
        data: &[u8],
        alignment: u32,
    ) -> Result<Option<u32>> {
        let len = u32::try_from(data.len()).map_err(|_| self.too_small(data.len() as u64))?;
        if len.saturating_add(alignment) > self.size {
            return Err(self.too_small(len as u64));
        }
        if !self.reserve_memory(ctx, len, alignment) {
            return Ok(None);
        }
        let offset = self.current_offset;
        let dst = self
            .host_slice(ctx, data.len())
            .ok_or_else(|| GsError::BufferCreation {
                size: self.size as u64,
                reason: format!("stream buffer '{}' is not host visible", self.name),
            })?;
        dst.copy_from_slice(data);
        self.commit_memory(ctx, len);
        Ok(Some(offset))
    }

    pub(crate) fn too_small(&self, requested: u64) -> GsError {
        GsError::StreamBufferTooSmall {
            name: self.name,
            requested,
            capacity: self.size as u64,
        }
    }

    /// Record the cursor against the command buffer being recorded
    fn update_current_fence_position<B: GpuBackend>(&mut self, ctx: &GpuContext<B>) {
        let counter = ctx.current_fence();
        if let Some(last) = self.tracked_fences.back_mut() {
            if last.0 == counter {
                last.1 = self.current_offset;
                return;
            }
        }
        self.tracked_fences.push_back((counter, self.current_offset));
    }

    /// Retire every tracked fence the GPU has completed
    fn update_gpu_position<B: GpuBackend>(&mut self, ctx: &mut GpuContext<B>) {
        let completed = ctx.completed_fence();
        let mut retired = false;
        while let Some(&(fence, position)) = self.tracked_fences.front() {
            if fence > completed {
                break;
            }
            self.current_gpu_position = position;
            self.tracked_fences.pop_front();
            retired = true;
        }

        let idle = self.tracked_fences.is_empty() && self.current_offset == self.current_gpu_position;
        if (retired || idle) && self.current_offset == self.current_gpu_position {
            self.current_offset = 0;
            self.current_gpu_position = 0;
            self.current_space = self.size;
        }
    }

    /// Wait on the oldest submitted fence that frees `num_bytes`
    fn wait_for_clear_space<B: GpuBackend>(&mut self, ctx: &mut GpuContext<B>, num_bytes: u32) -> bool {
        let mut found = None;
        for (i, &(_, gpu_position)) in self.tracked_fences.iter().enumerate() {
            if self.current_offset == gpu_position {
                // The GPU will have consumed everything
                found = Some((i, 0, self.size, 0));
                break;
            }

            if self.current_offset > gpu_position {
                let remaining_after_offset = self.size - self.current_offset;
                if remaining_after_offset >= num_bytes {
                    found = Some((i, self.current_offset, remaining_after_offset, gpu_position));
                    break;
                }
                if gpu_position > num_bytes {
                    found = Some((i, 0, gpu_position - 1, gpu_position));
                    break;
                }
            } else {
                let between = gpu_position - self.current_offset;
                if between > num_bytes {
                    found = Some((i, self.current_offset, between - 1, gpu_position));
                    break;
                }
            }
        }

        let Some((index, new_offset, new_space, new_gpu_position)) = found else {
            return false;
        };
        let (fence, position) = self.tracked_fences[index];
        if fence == ctx.current_fence() {
            // Still recording; the caller has to submit first
            return false;
        }

        if let Err(e) = ctx.wait_for_fence(fence) {
            log::error!("Stream buffer '{}': waiting on fence {} failed: {}", self.name, fence, e);
            return false;
        }

        if self.current_offset == position {
            self.tracked_fences.clear();
        } else {
            self.tracked_fences.drain(..=index);
        }
        self.current_offset = new_offset;
        self.current_space = new_space;
        self.current_gpu_position = new_gpu_position;
        true
    }

    /// Release the backing buffer once in-flight work is done with it
    pub fn destroy<B: GpuBackend>(self, ctx: &mut GpuContext<B>) {
        ctx.defer_destroy(PendingResource::Buffer(self.buffer));
    }
}
