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

//! Transfer operations
//!
//! Clears, copies, uploads and readbacks all run outside render passes as
//! transfer commands. Each one ends the open pass first and moves the images
//! it touches into transfer layouts; later users transition them back.

use crate::core::backend::{
    BufferImageCopy, ClearAspects, Filter, Format, GpuBackend, ImageCopy, ImageLayout,
};
use crate::core::error::{GsError, Result};
use crate::core::types::{Rect, RectF};

use super::convert::ShaderConvert;
use super::surface::{SurfaceHandle, SurfaceKind};
use super::{GsDevice, StreamKind};

/// CPU copy of a read-back image region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadbackMap {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    /// Bytes per row
    pub pitch: u32,
    pub data: Vec<u8>,
}

impl ReadbackMap {
    pub fn row(&self, y: u32) -> &[u8] {
        let start = (y * self.pitch) as usize;
        &self.data[start..start + self.pitch as usize]
    }

    /// Texel at (x, y) as raw bytes
    pub fn texel(&self, x: u32, y: u32) -> &[u8] {
        let size = self.format.texel_size() as usize;
        let start = (y * self.pitch) as usize + x as usize * size;
        &self.data[start..start + size]
    }
}

impl<B: GpuBackend> GsDevice<B> {
    fn expect_kind(&self, handle: SurfaceHandle, operation: &'static str, kinds: &[SurfaceKind]) -> Result<()> {
        let found = self.surfaces.get(handle)?.kind();
        if kinds.contains(&found) {
            Ok(())
        } else {
            Err(GsError::SurfaceTypeMismatch {
                operation,
                expected: kinds[0],
                found,
            })
        }
    }

    /// Clear a color target and return it to its working layout
    pub fn clear_render_target(&mut self, handle: SurfaceHandle, color: [f32; 4]) -> Result<()> {
        self.expect_kind(
            handle,
            "clear_render_target",
            &[SurfaceKind::RenderTarget, SurfaceKind::Offscreen],
        )?;
        self.end_render_pass();
        let surface = self.surfaces.get_mut(handle)?;
        let backend = self.ctx.backend_mut();
        surface.transition_to(backend, ImageLayout::TransferDst);
        backend.cmd_clear_color_image(surface.image(), ImageLayout::TransferDst, color);
        surface.transition_to(backend, surface.kind().working_layout());
        surface.discarded = false;
        Ok(())
    }

    /// Clear depth to 0
    pub fn clear_depth(&mut self, handle: SurfaceHandle) -> Result<()> {
        self.clear_depth_stencil(handle, 0.0, 0, ClearAspects::DEPTH, "clear_depth")
    }

    pub fn clear_stencil(&mut self, handle: SurfaceHandle, value: u8) -> Result<()> {
        self.clear_depth_stencil(handle, 0.0, value as u32, ClearAspects::STENCIL, "clear_stencil")
    }

    fn clear_depth_stencil(
        &mut self,
        handle: SurfaceHandle,
        depth: f32,
        stencil: u32,
        aspects: ClearAspects,
        operation: &'static str,
    ) -> Result<()> {
        self.expect_kind(handle, operation, &[SurfaceKind::DepthStencil])?;
        self.end_render_pass();
        let surface = self.surfaces.get_mut(handle)?;
        let backend = self.ctx.backend_mut();
        surface.transition_to(backend, ImageLayout::TransferDst);
        backend.cmd_clear_depth_stencil_image(
            surface.image(),
            ImageLayout::TransferDst,
            depth,
            stencil,
            aspects,
        );
        surface.transition_to(backend, ImageLayout::DepthStencilAttachment);
        surface.discarded = false;
        Ok(())
    }

    /// Upload texels into `rect` of mip level `level`
    ///
    /// `pitch` is the byte stride between rows of `data`. The data goes
    /// through the texture upload stream; the surface ends in its working
    /// layout.
    pub fn update_texture(
        &mut self,
        handle: SurfaceHandle,
        rect: Rect,
        data: &[u8],
        pitch: u32,
        level: u32,
    ) -> Result<()> {
        let surface = self.surfaces.get(handle)?;
        let texel = surface.format().texel_size();
        let (width, height) = (rect.width().max(0) as u32, rect.height().max(0) as u32);
        if width == 0 || height == 0 {
            return Ok(());
        }
        let row = width * texel;
        if pitch < row || data.len() < ((height - 1) * pitch + row) as usize {
            return Err(GsError::RenderPass(format!(
                "upload of {}x{} with pitch {} from {} bytes",
                width,
                height,
                pitch,
                data.len()
            )));
        }
        let working = surface.kind().working_layout();

        let packed: Vec<u8> = if pitch == row {
            data[..(row * height) as usize].to_vec()
        } else {
            (0..height)
                .flat_map(|y| {
                    let start = (y * pitch) as usize;
                    data[start..start + row as usize].iter().copied()
                })
                .collect()
        };
        let offset = self.stream_push(StreamKind::TextureUpload, &packed, texel.max(4))?;

        self.end_render_pass();
        let buffer = self.streams[StreamKind::TextureUpload as usize].buffer();
        let surface = self.surfaces.get_mut(handle)?;
        let backend = self.ctx.backend_mut();
        surface.transition_to(backend, ImageLayout::TransferDst);
        backend.cmd_copy_buffer_to_image(
            buffer,
            surface.image(),
            ImageLayout::TransferDst,
            &BufferImageCopy {
                buffer_offset: offset as u64,
                row_length: width,
                level,
                rect,
            },
        );
        surface.transition_to(backend, working);
        surface.discarded = false;
        self.stats.uploads += 1;
        Ok(())
    }

    /// Copy `rect` of a surface into a CPU buffer
    ///
    /// Blocks until the GPU has finished. The source returns to the layout it
    /// was in. Fails with [`GsError::ReadbackTooLarge`] instead of overrunning
    /// the staging buffer.
    pub fn readback_texture(&mut self, handle: SurfaceHandle, rect: Rect, level: u32) -> Result<ReadbackMap> {
        let surface = self.surfaces.get(handle)?;
        let format = surface.format();
        let level_rect = Rect::from_size(
            (surface.width() >> level).max(1),
            (surface.height() >> level).max(1),
        );
        let rect = rect.intersect(&level_rect);
        if rect.is_empty() {
            return Err(GsError::RenderPass(format!(
                "readback rectangle outside surface {}",
                handle
            )));
        }
        let (width, height) = (rect.width() as u32, rect.height() as u32);
        let pitch = width * format.texel_size();
        let required = pitch as u64 * height as u64;
        if required > self.readback_size {
            log::error!(
                "Readback of {}x{} {:?} needs {} bytes, staging holds {}",
                width,
                height,
                format,
                required,
                self.readback_size
            );
            return Err(GsError::ReadbackTooLarge {
                width,
                height,
                required,
                capacity: self.readback_size,
            });
        }

        let restore = match surface.layout() {
            ImageLayout::Undefined => surface.kind().working_layout(),
            previous => previous,
        };
        self.end_render_pass();
        let buffer = self.readback_buffer;
        let surface = self.surfaces.get_mut(handle)?;
        let backend = self.ctx.backend_mut();
        surface.transition_to(backend, ImageLayout::TransferSrc);
        backend.cmd_copy_image_to_buffer(
            surface.image(),
            ImageLayout::TransferSrc,
            buffer,
            &BufferImageCopy {
                buffer_offset: 0,
                row_length: width,
                level,
                rect,
            },
        );
        surface.transition_to(backend, restore);

        self.execute_command_buffer(true)?;
        let memory = self
            .ctx
            .backend_mut()
            .buffer_memory(buffer)
            .ok_or_else(|| GsError::BufferCreation {
                size: required,
                reason: "readback staging buffer is not host visible".to_string(),
            })?;
        let data = memory[..required as usize].to_vec();
        self.stats.readbacks += 1;
        log::trace!("Read back {}x{} {:?} from {}", width, height, format, handle);
        Ok(ReadbackMap {
            width,
            height,
            format,
            pitch,
            data,
        })
    }

    /// Copy `rect` of `src` to (`dx`, `dy`) in `dst`; formats must match
    pub fn copy_rect(&mut self, src: SurfaceHandle, dst: SurfaceHandle, rect: Rect, dx: i32, dy: i32) -> Result<()> {
        if src == dst {
            return Err(GsError::RenderPass("copy_rect within one surface".to_string()));
        }
        let (s, d) = (self.surfaces.get(src)?, self.surfaces.get(dst)?);
        if s.format() != d.format() {
            return Err(GsError::RenderPass(format!(
                "copy_rect between {:?} and {:?}",
                s.format(),
                d.format()
            )));
        }
        let src_rect = rect.intersect(&Rect::from_size(s.width(), s.height()));
        if src_rect.is_empty() {
            return Ok(());
        }
        let (src_image, dst_image) = (s.image(), d.image());

        self.end_render_pass();
        let backend = self.ctx.backend_mut();
        self.surfaces
            .get_mut(src)?
            .transition_to(backend, ImageLayout::TransferSrc);
        let dst_surface = self.surfaces.get_mut(dst)?;
        dst_surface.transition_to(backend, ImageLayout::TransferDst);
        dst_surface.discarded = false;
        backend.cmd_copy_image(
            src_image,
            ImageLayout::TransferSrc,
            dst_image,
            ImageLayout::TransferDst,
            &[ImageCopy {
                src_level: 0,
                src_x: src_rect.left,
                src_y: src_rect.top,
                dst_level: 0,
                dst_x: dx + (src_rect.left - rect.left),
                dst_y: dy + (src_rect.top - rect.top),
                width: src_rect.width() as u32,
                height: src_rect.height() as u32,
            }],
        );
        Ok(())
    }

    /// New surface of the same kind, size and format holding a copy of `src`
    pub fn clone_texture(&mut self, src: SurfaceHandle) -> Result<SurfaceHandle> {
        let s = self.surfaces.get(src)?;
        let (kind, width, height, format) = (s.kind(), s.width(), s.height(), s.format());
        let kind = if kind == SurfaceKind::Texture {
            SurfaceKind::RenderTarget
        } else {
            kind
        };
        let copy = self.fetch_surface(kind, width, height, format, false)?;
        self.copy_rect(src, copy, Rect::from_size(width, height), 0, 0)?;
        Ok(copy)
    }

    /// Scaled transfer blit between surfaces of the same format
    pub fn blit_rect(
        &mut self,
        src: SurfaceHandle,
        src_rect: Rect,
        dst: SurfaceHandle,
        dst_rect: Rect,
        linear: bool,
    ) -> Result<()> {
        if src == dst {
            return Err(GsError::RenderPass("blit_rect within one surface".to_string()));
        }
        let (src_image, dst_image) = (self.surfaces.get(src)?.image(), self.surfaces.get(dst)?.image());
        self.end_render_pass();
        let backend = self.ctx.backend_mut();
        self.surfaces
            .get_mut(src)?
            .transition_to(backend, ImageLayout::TransferSrc);
        let dst_surface = self.surfaces.get_mut(dst)?;
        dst_surface.transition_to(backend, ImageLayout::TransferDst);
        dst_surface.discarded = false;
        backend.cmd_blit_image(
            src_image,
            ImageLayout::TransferSrc,
            src_rect,
            dst_image,
            ImageLayout::TransferDst,
            dst_rect,
            if linear { Filter::Linear } else { Filter::Nearest },
        );
        Ok(())
    }

    /// Draw `src_rect` of `src` through `shader` into a fresh offscreen
    /// surface of `width` x `height`
    ///
    /// The caller reads it with [`GsDevice::readback_texture`] and hands it
    /// back with [`GsDevice::recycle`].
    pub fn copy_offscreen(
        &mut self,
        src: SurfaceHandle,
        src_rect: RectF,
        width: u32,
        height: u32,
        format: Format,
        shader: ShaderConvert,
    ) -> Result<SurfaceHandle> {
        let offscreen = self.fetch_surface(SurfaceKind::Offscreen, width, height, format, false)?;
        let dst_rect = RectF::new(0.0, 0.0, width as f32, height as f32);
        if let Err(e) = self.stretch_rect(src, src_rect, Some(offscreen), dst_rect, shader, false) {
            self.recycle(offscreen);
            return Err(e);
        }
        Ok(offscreen)
    }

    /// Convert and read back in one step
    ///
    /// Draws `src_rect` of `src` (normalized) through `shader` into a
    /// `width` x `height` offscreen surface of `format`, reads the whole
    /// surface back and recycles it.
    pub fn draw_for_readback(
        &mut self,
        src: SurfaceHandle,
        src_rect: RectF,
        width: u32,
        height: u32,
        format: Format,
        shader: ShaderConvert,
    ) -> Result<ReadbackMap> {
        let offscreen = self.copy_offscreen(src, src_rect, width, height, format, shader)?;
        let map = self.readback_texture(offscreen, Rect::from_size(width, height), 0);
        self.recycle(offscreen);
        map
    }
}
