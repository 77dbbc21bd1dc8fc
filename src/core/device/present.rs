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

//! Utility draws and presentation
//!
//! Every full-screen style operation (format conversion, display merge,
//! deinterlacing, DATE stencil setup) is a four-vertex strip drawn with a
//! utility pipeline. The destination is either a surface or, between
//! [`GsDevice::begin_present`] and [`GsDevice::end_present`], the acquired
//! swap chain image.
//!
//! # Pass selection
//!
//! A stretch that lands inside the open pass on the same target is drawn
//! inline. Otherwise a new pass is begun over the whole target; its color and
//! depth contents are discarded when the stretch overwrites all of them.

use crate::core::backend::{
    ClearValue, ColorWriteMask, GpuBackend, ImageId, ImageLayout, LoadOp, RenderPassKey, Viewport,
    WindowInfo,
};
use crate::core::error::{GsError, Result};
use crate::core::layout::{InterlaceConstants, MergeConstants, UtilityVertex};
use crate::core::types::{Color, RectF};

use super::convert::ShaderConvert;
use super::pipeline::{UtilityKey, UtilityProgram, UtilityTarget};
use super::surface::{Surface, SurfaceHandle, SurfaceKind};
use super::{BoundTarget, DrawTarget, GsDevice};

/// Build the strip covering `dst` (pixels) in a `width` x `height` target
///
/// # Arguments
///
/// * `src_uv` - Normalized source coordinates
/// * `dst` - Destination rectangle in pixels
///
/// # Returns
///
/// Vertices in strip order: top-left, top-right, bottom-left, bottom-right
pub fn stretch_vertices(src_uv: RectF, dst: RectF, width: u32, height: u32) -> [UtilityVertex; 4] {
    let w = width.max(1) as f32;
    let h = height.max(1) as f32;
    let left = dst.left / w * 2.0 - 1.0;
    let right = dst.right / w * 2.0 - 1.0;
    let top = 1.0 - dst.top / h * 2.0;
    let bottom = 1.0 - dst.bottom / h * 2.0;
    [
        UtilityVertex::new(left, top, src_uv.left, src_uv.top),
        UtilityVertex::new(right, top, src_uv.right, src_uv.top),
        UtilityVertex::new(left, bottom, src_uv.left, src_uv.bottom),
        UtilityVertex::new(right, bottom, src_uv.right, src_uv.bottom),
    ]
}

/// Display merge controls decoded from PMODE and BGCOLOR
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeParams {
    /// Circuit 1 alpha: false takes it from the pixel, true uses `alp`
    pub mmod: bool,
    /// Fixed alpha (PMODE.ALP), 0-255
    pub alp: u8,
    /// Blend circuit 1 against the background color instead of circuit 2
    pub slbg: bool,
    pub background: Color,
    pub linear: bool,
}

impl Default for MergeParams {
    fn default() -> Self {
        Self {
            mmod: false,
            alp: 0xFF,
            slbg: false,
            background: Color::BLACK,
            linear: true,
        }
    }
}

impl<B: GpuBackend> GsDevice<B> {
    /// Draw `src_rect` of `src` into `dst_rect` of `dst` through `shader`
    ///
    /// # Arguments
    ///
    /// * `src_rect` - Normalized source rectangle
    /// * `dst` - Destination surface, or `None` for the swap chain image
    ///   acquired by [`GsDevice::begin_present`]
    /// * `dst_rect` - Destination rectangle in pixels
    /// * `linear` - Bilinear source filtering
    pub fn stretch_rect(
        &mut self,
        src: SurfaceHandle,
        src_rect: RectF,
        dst: Option<SurfaceHandle>,
        dst_rect: RectF,
        shader: ShaderConvert,
        linear: bool,
    ) -> Result<()> {
        let target = self.utility_target(dst, shader)?;
        let key = UtilityKey::new(UtilityProgram::Convert(shader), target);
        self.do_stretch_rect(src, src_rect, dst, dst_rect, key, linear, &[])
    }

    /// Copy with a per-channel color write mask
    #[allow(clippy::too_many_arguments)]
    pub fn stretch_rect_masked(
        &mut self,
        src: SurfaceHandle,
        src_rect: RectF,
        dst: SurfaceHandle,
        dst_rect: RectF,
        red: bool,
        green: bool,
        blue: bool,
        alpha: bool,
    ) -> Result<()> {
        let mut mask = ColorWriteMask::empty();
        mask.set(ColorWriteMask::R, red);
        mask.set(ColorWriteMask::G, green);
        mask.set(ColorWriteMask::B, blue);
        mask.set(ColorWriteMask::A, alpha);
        let target = self.utility_target(Some(dst), ShaderConvert::Copy)?;
        let key = UtilityKey::new(UtilityProgram::Convert(ShaderConvert::Copy), target).masked(mask);
        self.do_stretch_rect(src, src_rect, Some(dst), dst_rect, key, false, &[])
    }

    /// Upload a strip for the bound target and draw it with the current
    /// utility state
    pub fn draw_stretch_rect(&mut self, src_rect: RectF, dst_rect: RectF) -> Result<()> {
        let bound = self
            .bound
            .ok_or_else(|| GsError::RenderPass("stretch without a target".to_string()))?;
        let vertices = stretch_vertices(src_rect, dst_rect, bound.width, bound.height);
        self.ia_set_vertex_buffer(
            bytemuck::cast_slice(&vertices),
            std::mem::size_of::<UtilityVertex>() as u32,
        )?;
        self.draw_primitive()
    }

    /// Pipeline target for a utility draw into `dst`
    fn utility_target(&self, dst: Option<SurfaceHandle>, shader: ShaderConvert) -> Result<UtilityTarget> {
        let Some(handle) = dst else {
            let swap = self.swap_chain.ok_or(GsError::NoSwapChain)?;
            return Ok(UtilityTarget::Present(swap.format));
        };
        let surface = self.surfaces.get(handle)?;
        let writes_depth = shader.is_depth_output() || shader.is_datm();
        if writes_depth != surface.is_depth() {
            return Err(GsError::SurfaceTypeMismatch {
                operation: "stretch_rect",
                expected: if writes_depth {
                    SurfaceKind::DepthStencil
                } else {
                    SurfaceKind::RenderTarget
                },
                found: surface.kind(),
            });
        }
        Ok(if shader.is_datm() {
            UtilityTarget::DateSetup
        } else if surface.is_depth() {
            UtilityTarget::Depth
        } else {
            UtilityTarget::Color(surface.format())
        })
    }

    /// Bind `dst` as the sole attachment with a full-target scissor
    fn bind_utility_destination(&mut self, dst: Option<SurfaceHandle>) -> Result<BoundTarget> {
        match dst {
            Some(handle) => {
                let surface = self.surfaces.get(handle)?;
                let (full, is_depth) = (surface_rect(surface), surface.is_depth());
                if is_depth {
                    self.om_set_render_targets(None, Some(handle), full)?;
                } else {
                    self.om_set_render_targets(Some(handle), None, full)?;
                }
            }
            None => {
                let image = self.presenting.ok_or_else(|| {
                    GsError::RenderPass("swap chain draw outside begin_present".to_string())
                })?;
                self.bind_swap_image(image)?;
            }
        }
        self.bound
            .ok_or_else(|| GsError::RenderPass("utility draw without a target".to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    fn do_stretch_rect(
        &mut self,
        src: SurfaceHandle,
        src_rect: RectF,
        dst: Option<SurfaceHandle>,
        dst_rect: RectF,
        key: UtilityKey,
        linear: bool,
        push: &[u8],
    ) -> Result<()> {
        if dst == Some(src) {
            return Err(GsError::InvalidSurface(format!(
                "{} is both the source and the destination of a stretch",
                src
            )));
        }
        let sampler = if linear { self.linear_sampler } else { self.point_sampler };
        self.set_utility_texture(Some(src), sampler)?;
        let bound = self.bind_utility_destination(dst)?;

        let pipeline = self
            .pipelines
            .get_or_create_utility(&mut self.ctx, &mut self.shaders, &key)?;
        self.state.set_pipeline(pipeline);

        let target_rect = bound.rect();
        let covered = dst_rect.to_rect().intersect(&target_rect);
        if !self.pass_covers(&bound.pass_key(LoadOp::Load), &covered) {
            let discarded = match dst {
                Some(h) => self.surfaces.get(h)?.is_discarded(),
                None => false,
            };
            let overwrites = (covered == target_rect || discarded)
                && !key.blend
                && key.write_mask == ColorWriteMask::ALL
                && key.target != UtilityTarget::DateSetup;
            let load = if overwrites { LoadOp::DontCare } else { LoadOp::Load };
            self.begin_render_pass(bound.pass_key(load), target_rect, &[])?;
        }

        self.set_utility_push_constants(push);
        self.apply_utility_state()?;
        self.draw_stretch_rect(src_rect, dst_rect)?;

        if let Some(h) = dst {
            self.surfaces.get_mut(h)?.discarded = false;
        }
        Ok(())
    }

    /// Composite the display circuits into `dst`
    ///
    /// `sources[0]` and `sources[1]` are read circuits 1 and 2. `sources[2]`,
    /// when present, receives a copy of the merged result (feedback write),
    /// from `src_rects[2]` of `dst` into `dst_rects[2]`.
    pub fn do_merge(
        &mut self,
        sources: [Option<SurfaceHandle>; 3],
        src_rects: [RectF; 3],
        dst: SurfaceHandle,
        dst_rects: [RectF; 3],
        params: &MergeParams,
    ) -> Result<()> {
        for source in sources[..2].iter().flatten() {
            self.transition_surface(*source, ImageLayout::ShaderReadOnly)?;
        }
        let format = self.surfaces.get(dst)?.format();
        let full = surface_rect(self.surfaces.get(dst)?);
        self.om_set_render_targets(Some(dst), None, full)?;
        let bound = self
            .bound
            .ok_or_else(|| GsError::RenderPass("merge without a target".to_string()))?;
        let bg = params.background.to_array();
        self.begin_render_pass(
            bound.pass_key(LoadOp::Clear),
            bound.rect(),
            &[ClearValue::Color(bg)],
        )?;

        if let Some(circuit2) = sources[1] {
            if !params.slbg {
                let key = UtilityKey::new(UtilityProgram::Convert(ShaderConvert::Copy), UtilityTarget::Color(format));
                self.do_stretch_rect(circuit2, src_rects[1], Some(dst), dst_rects[1], key, params.linear, &[])?;
            }
        }

        if let Some(circuit1) = sources[0] {
            let constants = MergeConstants {
                bg_color: [bg[0], bg[1], bg[2], params.alp as f32 / 255.0],
            };
            let key = UtilityKey::new(UtilityProgram::Merge(params.mmod as u32), UtilityTarget::Color(format)).blended();
            self.do_stretch_rect(
                circuit1,
                src_rects[0],
                Some(dst),
                dst_rects[0],
                key,
                params.linear,
                bytemuck::bytes_of(&constants),
            )?;
        }

        if let Some(feedback) = sources[2] {
            self.stretch_rect(dst, src_rects[2], Some(feedback), dst_rects[2], ShaderConvert::Copy, false)?;
        }
        Ok(())
    }

    /// Deinterlace `src` into `dst`
    ///
    /// # Arguments
    ///
    /// * `shader` - 0 weave, 1 bob, 2 blend, 3 plain copy
    /// * `yoffset` - Field offset in destination pixels
    #[allow(clippy::too_many_arguments)]
    pub fn do_interlace(
        &mut self,
        src: SurfaceHandle,
        src_rect: RectF,
        dst: SurfaceHandle,
        dst_rect: RectF,
        shader: u32,
        linear: bool,
        yoffset: f32,
    ) -> Result<()> {
        let surface = self.surfaces.get(dst)?;
        let (format, height) = (surface.format(), surface.height() as f32);
        let constants = InterlaceConstants {
            zr_h: [0.0, 1.0 / height],
            h_h: height / 2.0,
            _pad: 0.0,
        };
        let key = UtilityKey::new(UtilityProgram::Interlace(shader.min(3)), UtilityTarget::Color(format));
        let dst_rect = RectF::new(
            dst_rect.left,
            dst_rect.top + yoffset,
            dst_rect.right,
            dst_rect.bottom + yoffset,
        );
        self.do_stretch_rect(src, src_rect, Some(dst), dst_rect, key, linear, bytemuck::bytes_of(&constants))
    }

    /// Mark the pixels a destination-alpha-tested draw may touch
    ///
    /// Clears the stencil of `ds`, then sets it to 1 wherever the alpha
    /// channel of `rt` fails the DATE test (`datm` selects which alpha
    /// value passes). `vertices` cover the draw's bounding box. Returns with
    /// no pass open, ready for the draw to bind `rt` and `ds`.
    pub fn setup_date(
        &mut self,
        rt: SurfaceHandle,
        ds: SurfaceHandle,
        vertices: &[UtilityVertex; 4],
        datm: bool,
    ) -> Result<()> {
        self.clear_stencil(ds, 0)?;
        let full = surface_rect(self.surfaces.get(ds)?);
        self.set_utility_texture(Some(rt), self.point_sampler)?;
        self.om_set_render_targets(None, Some(ds), full)?;

        let shader = if datm { ShaderConvert::Datm1 } else { ShaderConvert::Datm0 };
        let key = UtilityKey::new(UtilityProgram::Convert(shader), UtilityTarget::DateSetup);
        let pipeline = self
            .pipelines
            .get_or_create_utility(&mut self.ctx, &mut self.shaders, &key)?;
        self.state.set_pipeline(pipeline);

        self.ia_set_vertex_buffer(
            bytemuck::cast_slice(vertices),
            std::mem::size_of::<UtilityVertex>() as u32,
        )?;
        let bound = self
            .bound
            .ok_or_else(|| GsError::RenderPass("DATE setup without a target".to_string()))?;
        self.begin_render_pass(bound.pass_key(LoadOp::Load), bound.rect(), &[])?;
        self.set_utility_push_constants(&[]);
        self.apply_utility_state()?;
        self.draw_primitive()?;
        self.end_render_pass();
        Ok(())
    }

    /// Acquire the next swap chain image and open a pass on it
    ///
    /// # Arguments
    ///
    /// * `clear` - Clear the image to black; otherwise its contents are kept
    pub fn begin_present(&mut self, clear: bool) -> Result<()> {
        if self.presenting.is_some() {
            return Err(GsError::RenderPass("begin_present called twice".to_string()));
        }
        let swap = self.swap_chain.ok_or(GsError::NoSwapChain)?;
        self.end_render_pass();
        let image = self.ctx.backend_mut().acquire_next_image()?;
        self.swap_images
            .entry(image)
            .or_insert_with(|| Surface::new(SurfaceKind::RenderTarget, swap.width, swap.height, 1, swap.format, image));
        self.presenting = Some(image);
        let bound = self.bind_swap_image(image)?;

        let load = if clear { LoadOp::Clear } else { LoadOp::Load };
        self.begin_render_pass(
            bound.pass_key(load),
            bound.rect(),
            &[ClearValue::Color(Color::BLACK.to_array())],
        )?;
        log::trace!("Presenting to swap chain image {}", image.raw());
        Ok(())
    }

    /// Bind the swap chain image as the target, building its framebuffer
    fn bind_swap_image(&mut self, image: ImageId) -> Result<BoundTarget> {
        if let Some(bound) = self.bound.filter(|b| b.target == DrawTarget::SwapChain(image)) {
            return Ok(bound);
        }
        self.end_render_pass();
        let backend = self.ctx.backend_mut();
        let surface = self
            .swap_images
            .get_mut(&image)
            .ok_or_else(|| GsError::InvalidSurface(format!("swap chain image {} not acquired", image.raw())))?;
        surface.transition_to(backend, ImageLayout::ColorAttachment);
        let framebuffer = match surface.framebuffers.get(&None) {
            Some(fb) => *fb,
            None => {
                let render_pass = backend.render_pass(&RenderPassKey::color(surface.format(), LoadOp::Load))?;
                let fb = backend.create_framebuffer(render_pass, Some(image), None)?;
                surface.framebuffers.insert(None, fb);
                fb
            }
        };
        let bound = BoundTarget {
            target: DrawTarget::SwapChain(image),
            framebuffer,
            color: Some(surface.format()),
            depth: None,
            width: surface.width(),
            height: surface.height(),
        };
        self.bound = Some(bound);
        self.state.set_viewport(Viewport::from_size(bound.width, bound.height));
        self.state.set_scissor(bound.rect());
        Ok(bound)
    }

    /// Finish the frame: submit and present the acquired image
    pub fn end_present(&mut self) -> Result<()> {
        let image = self
            .presenting
            .take()
            .ok_or_else(|| GsError::RenderPass("end_present without begin_present".to_string()))?;
        self.end_render_pass();
        if let Some(surface) = self.swap_images.get_mut(&image) {
            surface.transition_to(self.ctx.backend_mut(), ImageLayout::PresentSrc);
        }
        self.bound = None;
        self.execute_command_buffer(false)?;
        self.ctx.backend_mut().present(image)?;

        self.ctx.advance_frame();
        self.stats.frames += 1;
        self.age_pool();
        Ok(())
    }

    /// Rebuild the swap chain for a new window
    pub fn change_render_window(&mut self, window: WindowInfo) -> Result<()> {
        if self.presenting.is_some() {
            return Err(GsError::RenderPass("window changed while presenting".to_string()));
        }
        self.wait_idle()?;
        if matches!(self.bound.map(|b| b.target), Some(DrawTarget::SwapChain(_))) {
            self.bound = None;
        }
        let backend = self.ctx.backend_mut();
        for (_, surface) in self.swap_images.drain() {
            for fb in surface.framebuffers.values() {
                backend.destroy_framebuffer(*fb);
            }
        }
        backend.destroy_swap_chain();
        self.swap_chain = None;

        let swap = backend.create_swap_chain(&window)?;
        log::info!(
            "Swap chain recreated at {}x{} ({:?})",
            swap.width,
            swap.height,
            swap.format
        );
        self.window = window;
        self.swap_chain = Some(swap);
        Ok(())
    }

    /// Rebuild the swap chain at a new size
    pub fn resize_window(&mut self, width: u32, height: u32) -> Result<()> {
        if self.swap_chain.is_some_and(|s| s.width == width && s.height == height) {
            return Ok(());
        }
        self.change_render_window(WindowInfo {
            width,
            height,
            ..self.window
        })
    }

    pub fn swap_chain_info(&self) -> Option<crate::core::backend::SwapChainInfo> {
        self.swap_chain
    }

    pub fn is_presenting(&self) -> bool {
        self.presenting.is_some()
    }
}

fn surface_rect(surface: &Surface) -> crate::core::types::Rect {
    crate::core::types::Rect::from_size(surface.width(), surface.height())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stretch_vertices_cover_target() {
        let v = stretch_vertices(RectF::unit(), RectF::new(0.0, 0.0, 64.0, 32.0), 64, 32);
        assert_eq!(v[0].pos[..2], [-1.0, 1.0]);
        assert_eq!(v[3].pos[..2], [1.0, -1.0]);
        assert_eq!(v[1].uv, [1.0, 0.0]);
        assert_eq!(v[2].uv, [0.0, 1.0]);
    }

    #[test]
    fn test_stretch_vertices_sub_rect() {
        let v = stretch_vertices(RectF::unit(), RectF::new(16.0, 16.0, 48.0, 48.0), 64, 64);
        assert_eq!(v[0].pos[..2], [-0.5, 0.5]);
        assert_eq!(v[3].pos[..2], [0.5, -0.5]);
    }
}
