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

//! Primitive batches
//!
//! A batch is turned into one GPU draw in a fixed order: primitive setup,
//! clipping, alpha test folding, target and texture lookup, selector
//! construction, constant upload and finally the draw itself. Anything that
//! can't write a pixel is skipped before a target is touched.

use std::borrow::Cow;

use crate::core::backend::GpuBackend;
use crate::core::device::{
    blend_index, hw_blend, BlendFlags, DepthStencilSelector, GsSelector, PipelineSelector, PsSelector,
    stretch_vertices, SamplerSelector, SurfaceHandle, SurfaceKind, BLEND_AD, DEPTH_FORMAT,
};
use crate::core::error::{GsError, Result};
use crate::core::gs::{AlphaFail, AlphaTest, DrawingContext, Frame, PrimType, Psm, Test};
use crate::core::layout::{GsVertex, PsConstantBuffer, VsConstantBuffer};
use crate::core::memory::LocalMemory;
use crate::core::types::Rect;

use super::HwRenderer;

/// How the alpha test resolves for a whole draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlphaTestMode {
    /// Every pixel passes
    Pass,
    /// Every pixel fails; AFAIL decides what is still written
    Fail,
    /// Per-pixel compare with a shader test code and reference
    Compare(u8, u8),
}

/// Map TEST.ATST/AREF onto the shader's test codes
///
/// The shader knows less-or-equal, greater-or-equal, equal and not-equal;
/// strict comparisons move the reference by one and collapse to `Fail` when
/// nothing can pass.
pub(crate) fn alpha_test_mode(test: &Test) -> AlphaTestMode {
    if !test.ate {
        return AlphaTestMode::Pass;
    }
    let aref = test.aref;
    match test.atst {
        AlphaTest::Always => AlphaTestMode::Pass,
        AlphaTest::Never => AlphaTestMode::Fail,
        AlphaTest::Less if aref == 0 => AlphaTestMode::Fail,
        AlphaTest::Less => AlphaTestMode::Compare(1, aref - 1),
        AlphaTest::LessEqual => AlphaTestMode::Compare(1, aref),
        AlphaTest::Equal => AlphaTestMode::Compare(3, aref),
        AlphaTest::GreaterEqual => AlphaTestMode::Compare(2, aref),
        AlphaTest::Greater if aref == 0xFF => AlphaTestMode::Fail,
        AlphaTest::Greater => AlphaTestMode::Compare(2, aref + 1),
        AlphaTest::NotEqual => AlphaTestMode::Compare(4, aref),
    }
}

/// Channels a draw may write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteMask {
    pub rgb: [bool; 3],
    pub alpha: bool,
    pub depth: bool,
}

impl WriteMask {
    fn any_color(&self) -> bool {
        self.rgb.iter().any(|&c| c) || self.alpha
    }
}

/// Color channels FRAME lets through
///
/// A channel is written unless FBMSK masks every bit the format stores for
/// it. Partial masks can't be expressed as a write mask and are ignored.
pub(crate) fn channel_writes(frame: &Frame) -> ([bool; 3], bool) {
    let significant: [u32; 4] = match frame.psm {
        Psm::Ct16 | Psm::Ct16s => [0xF8, 0xF8, 0xF8, 0x80],
        _ => [0xFF; 4],
    };
    let mut writes = [true; 4];
    for (i, write) in writes.iter_mut().enumerate() {
        let masked = (frame.fbmsk >> (i * 8)) & significant[i];
        if masked == significant[i] {
            *write = false;
        } else if masked != 0 {
            log::debug!("Partial frame mask {:#010x} not supported, channel {} written", frame.fbmsk, i);
        }
    }
    let alpha = writes[3] && frame.psm != Psm::Ct24;
    ([writes[0], writes[1], writes[2]], alpha)
}

/// Vertices per primitive, GS primitive class and topology
fn primitive_class(prim: PrimType) -> Option<(usize, u8, u8)> {
    Some(match prim {
        PrimType::Point => (1, GsSelector::PRIM_POINT, PipelineSelector::TOPOLOGY_POINT),
        PrimType::Line | PrimType::LineStrip => (2, GsSelector::PRIM_LINE, PipelineSelector::TOPOLOGY_LINE),
        PrimType::Triangle | PrimType::TriangleStrip | PrimType::TriangleFan => {
            (3, GsSelector::PRIM_TRIANGLE, PipelineSelector::TOPOLOGY_TRIANGLE)
        }
        PrimType::Sprite => (2, GsSelector::PRIM_SPRITE, PipelineSelector::TOPOLOGY_LINE),
        PrimType::Invalid => return None,
    })
}

/// List indices for `count` vertices kicked as `prim`
///
/// Strips and fans are unrolled into lists; trailing vertices that don't
/// complete a primitive are dropped.
pub(crate) fn primitive_indices(prim: PrimType, count: usize) -> Vec<u32> {
    let count = count as u32;
    match prim {
        PrimType::LineStrip => (1..count).flat_map(|i| [i - 1, i]).collect(),
        PrimType::TriangleStrip => (2..count).flat_map(|i| [i - 2, i - 1, i]).collect(),
        PrimType::TriangleFan => (2..count).flat_map(|i| [0, i - 1, i]).collect(),
        other => {
            let per = primitive_class(other).map_or(1, |(n, _, _)| n as u32);
            (0..count - count % per).collect()
        }
    }
}

/// Native pixels the vertices can touch
fn vertex_bounds(vertices: &[GsVertex], indices: &[u32], ctx: &DrawingContext) -> Rect {
    let (ofx, ofy) = (ctx.xyoffset.ofx as f32, ctx.xyoffset.ofy as f32);
    let mut min = [f32::MAX; 2];
    let mut max = [f32::MIN; 2];
    for &i in indices {
        let v = &vertices[i as usize];
        let x = (v.xy[0] as f32 - ofx) / 16.0;
        let y = (v.xy[1] as f32 - ofy) / 16.0;
        min = [min[0].min(x), min[1].min(y)];
        max = [max[0].max(x), max[1].max(y)];
    }
    Rect::new(
        min[0].floor() as i32,
        min[1].floor() as i32,
        max[0].ceil() as i32 + 1,
        max[1].ceil() as i32 + 1,
    )
}

fn scissor_rect(ctx: &DrawingContext) -> Rect {
    let s = &ctx.scissor;
    Rect::new(s.x0 as i32, s.y0 as i32, s.x1 as i32 + 1, s.y1 as i32 + 1)
}

impl<B: GpuBackend, M: LocalMemory> HwRenderer<B, M> {
    /// Draw a batch of vertices with the current PRIM and drawing context
    ///
    /// # Arguments
    ///
    /// * `context` - Drawing context (0 or 1); PRIM.CTXT is what the GIF
    ///   would pass here
    /// * `vertices` - Kicked vertices
    /// * `indices` - List indices into `vertices`, or empty to draw the
    ///   vertices in kick order (strips and fans are unrolled)
    ///
    /// # Returns
    ///
    /// `Err(InvalidPrimitive)` for indices outside `vertices`. A draw that
    /// fails on the GPU side is logged and dropped and still returns `Ok`.
    pub fn draw(&mut self, context: usize, vertices: &[GsVertex], indices: &[u32]) -> Result<()> {
        let prim = self.regs.prim.prim;
        let Some((per_prim, _, _)) = primitive_class(prim) else {
            log::debug!("Skipping draw with invalid primitive type");
            self.stats.skipped_draws += 1;
            return Ok(());
        };

        let mut indices: Cow<[u32]> = if indices.is_empty() {
            Cow::Owned(primitive_indices(prim, vertices.len()))
        } else {
            Cow::Borrowed(indices)
        };
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(GsError::InvalidPrimitive(format!(
                "index {} with {} vertices",
                bad,
                vertices.len()
            )));
        }
        let whole = indices.len() - indices.len() % per_prim;
        if whole != indices.len() {
            indices.to_mut().truncate(whole);
        }
        if indices.is_empty() {
            self.stats.skipped_draws += 1;
            return Ok(());
        }

        let mut temporaries = Vec::new();
        let result = self.draw_batch(context.min(1), vertices, &indices, &mut temporaries);
        for surface in temporaries {
            self.dev.recycle(surface);
        }
        match result {
            Ok(true) => self.stats.draws += 1,
            Ok(false) => self.stats.skipped_draws += 1,
            Err(e) => self.dev.note_dropped_draw(&e),
        }
        Ok(())
    }

    /// Record one batch; `Ok(false)` when nothing would be written
    fn draw_batch(
        &mut self,
        context: usize,
        vertices: &[GsVertex],
        indices: &[u32],
        temporaries: &mut Vec<SurfaceHandle>,
    ) -> Result<bool> {
        let prim = self.regs.prim;
        let ctx = self.regs.ctx[context];
        let Some((_, gs_prim, topology)) = primitive_class(prim.prim) else {
            return Ok(false);
        };

        let scissor = scissor_rect(&ctx);
        let area = vertex_bounds(vertices, indices, &ctx).intersect(&scissor);
        if area.is_empty() {
            log::trace!("Draw clipped away by scissor {:?}", scissor);
            return Ok(false);
        }
        if ctx.frame.psm.is_depth() {
            log::debug!("Skipping draw into a {:?} frame buffer", ctx.frame.psm);
            return Ok(false);
        }

        // Alpha test and what a failing pixel still writes
        let (rgb, alpha) = channel_writes(&ctx.frame);
        let mut writes = WriteMask {
            rgb,
            alpha,
            depth: true,
        };
        let atst_mode = alpha_test_mode(&ctx.test);
        let mut atst = (0, 0);
        match atst_mode {
            AlphaTestMode::Pass => {}
            AlphaTestMode::Fail => match ctx.test.afail {
                AlphaFail::Keep => return Ok(false),
                AlphaFail::FrameOnly => writes.depth = false,
                AlphaFail::ZbufOnly => {
                    writes.rgb = [false; 3];
                    writes.alpha = false;
                }
                AlphaFail::RgbOnly => {
                    writes.alpha = false;
                    writes.depth = false;
                }
            },
            AlphaTestMode::Compare(code, aref) => {
                if ctx.test.afail != AlphaFail::Keep {
                    log::debug!("Alpha fail mode {:?} treated as keep", ctx.test.afail);
                }
                atst = (code, aref);
            }
        }

        let test = &ctx.test;
        if test.zte && test.ztst == DepthStencilSelector::ZTST_NEVER {
            return Ok(false);
        }
        let depth_used = test.zte && (test.ztst != DepthStencilSelector::ZTST_ALWAYS || !ctx.zbuf.zmsk);
        writes.depth &= depth_used && !ctx.zbuf.zmsk;
        if !writes.any_color() && !writes.depth {
            return Ok(false);
        }

        // Targets; a depth lookup can evict the frame buffer it overlaps
        let height = scissor.bottom.max(1) as u32;
        let fbw = ctx.frame.fbw;
        let rt = self
            .cache
            .lookup_target(&mut self.dev, &mut self.mem, ctx.frame.fbp, fbw, ctx.frame.psm, height)?;
        let ds = if depth_used {
            Some(
                self.cache
                    .lookup_target(&mut self.dev, &mut self.mem, ctx.zbuf.zbp, fbw, ctx.zbuf.psm, height)?,
            )
        } else {
            None
        };
        let (target_rect, scale) = match self.cache.target(rt) {
            Some(t) => (t.rect(), t.scale()),
            None => {
                return Err(GsError::TargetConflict(format!(
                    "frame at block {:#x} overlaps depth at block {:#x}",
                    ctx.frame.fbp, ctx.zbuf.zbp
                )))
            }
        };
        let area = area.intersect(&target_rect);
        if area.is_empty() {
            return Ok(false);
        }
        let (w, h) = (target_rect.width() as u32, target_rect.height() as u32);

        // Texture
        let mut texture = None;
        let mut tex_size = (1u32, 1u32);
        let mut from_target = false;
        let mut vertices = Cow::Borrowed(vertices);
        if prim.tme {
            let binding = self
                .cache
                .lookup_source(&mut self.dev, &mut self.mem, &ctx.tex0, &ctx.clamp)?;
            let mut surface = binding.surface;
            if surface == rt || Some(surface) == ds {
                surface = self.dev.clone_texture(surface)?;
                temporaries.push(surface);
                self.stats.target_copies += 1;
                log::trace!("Draw samples its own target, using a copy");
            }
            if binding.from_target && !prim.fst {
                let su = ctx.tex0.width() as f32 / binding.width.max(1) as f32;
                let sv = ctx.tex0.height() as f32 / binding.height.max(1) as f32;
                if su != 1.0 || sv != 1.0 {
                    for v in vertices.to_mut() {
                        v.st = [v.st[0] * su, v.st[1] * sv];
                    }
                }
            }
            texture = Some(surface);
            tex_size = (binding.width.max(1), binding.height.max(1));
            from_target = binding.from_target;
        }

        // Selector
        let settings = self.dev.settings();
        let (bilinear, dithering, accurate_blending) =
            (settings.bilinear_filtering, settings.dithering, settings.accurate_blending);
        let mut sel = PipelineSelector {
            topology,
            rt: true,
            ..Default::default()
        };
        sel.vs.tme = prim.tme;
        sel.vs.fst = prim.fst;
        sel.gs.iip = prim.iip;
        sel.gs.prim = gs_prim;
        sel.gs.point = gs_prim == GsSelector::PRIM_POINT && scale > 1;
        sel.gs.line = gs_prim == GsSelector::PRIM_LINE && scale > 1;
        sel.vs.point = sel.gs.point;

        let max_depth = match ds {
            Some(_) => ctx.zbuf.psm.max_depth(),
            None => u32::MAX,
        };
        let abe = prim.abe || prim.aa1;
        let ps = &mut sel.ps;
        ps.dfmt = ctx.frame.psm.fmt();
        ps.fba = ctx.fba;
        ps.fog = prim.fge;
        ps.fst = prim.fst;
        ps.atst = atst.0;
        ps.colclip = abe && !self.regs.colclamp;
        ps.pabe = abe && self.regs.pabe;
        ps.zclamp = ds.is_some() && max_depth != u32::MAX;
        if self.regs.dthe && ps.dfmt == 2 {
            ps.dither = dithering;
        }
        if prim.tme {
            let tex0 = &ctx.tex0;
            ps.tfx = tex0.tfx;
            ps.tcc = tex0.tcc;
            ps.fmt = if tex0.psm.is_paletted() {
                tex0.cpsm.fmt()
            } else {
                tex0.psm.fmt()
            };
            if from_target {
                ps.depth_fmt = tex0.psm.depth_fmt();
            }
            ps.aem = self.regs.texa.aem;
            ps.wms = ctx.clamp.wms;
            ps.wmt = ctx.clamp.wmt;
            ps.ltf = bilinear;
            ps.point_sampler = !bilinear;
        } else {
            ps.tfx = PsSelector::TFX_NONE;
        }

        // Blending
        if abe {
            let a = &ctx.alpha;
            let index = blend_index(a.a, a.b, a.c, a.d);
            let flags = hw_blend(index).flags;
            let accu = flags.contains(BlendFlags::ACCU) && a.c != BLEND_AD;
            let mix = flags.contains(BlendFlags::MIX_1PLUS) && a.c != BLEND_AD && accurate_blending;
            if flags.contains(BlendFlags::NO_HW) {
                log::debug!("Blend equation {:?} has no hardware form", (a.a, a.b, a.c, a.d));
            }
            let ps = &mut sel.ps;
            ps.blend_a = a.a;
            ps.blend_b = a.b;
            ps.blend_c = a.c;
            ps.blend_d = a.d;
            ps.blend_mix = if accu {
                1
            } else if mix {
                2
            } else {
                0
            };
            sel.bs.abe = true;
            sel.bs.blend_index = index;
            sel.bs.accu_blend = accu;
        }
        sel.bs.wr = writes.rgb[0];
        sel.bs.wg = writes.rgb[1];
        sel.bs.wb = writes.rgb[2];
        sel.bs.wa = writes.alpha;

        sel.dss.ztst = if ds.is_some() {
            test.ztst
        } else {
            DepthStencilSelector::ZTST_ALWAYS
        };
        sel.dss.zwe = ds.is_some() && writes.depth;
        sel.dss.date = test.date && ctx.frame.psm != Psm::Ct24;

        // Destination alpha test needs a stencil, borrow one if there is no
        // depth buffer
        let mut ds = ds;
        if sel.dss.date {
            let (sw, sh) = {
                let s = self.dev.surface(rt)?;
                (s.width(), s.height())
            };
            let stencil = match ds {
                Some(ds) => ds,
                None => {
                    let temp = self.dev.fetch_surface(SurfaceKind::DepthStencil, sw, sh, DEPTH_FORMAT, false)?;
                    temporaries.push(temp);
                    ds = Some(temp);
                    temp
                }
            };
            let strip = stretch_vertices(
                area.to_f().normalize(w, h),
                area.scale(scale).to_f(),
                sw,
                sh,
            );
            self.dev.setup_date(rt, stencil, &strip, test.datm)?;
            self.stats.date_draws += 1;
        }
        sel.ds = ds.is_some();

        // Constants
        let sx = 2.0 / (16.0 * w as f32);
        let sy = 2.0 / (16.0 * h as f32);
        let vs_cb = VsConstantBuffer {
            vertex_scale: [sx, sy],
            vertex_offset: [ctx.xyoffset.ofx as f32 * sx + 1.0, ctx.xyoffset.ofy as f32 * sy + 1.0],
            texture_scale: [1.0 / tex_size.0 as f32, 1.0 / tex_size.1 as f32],
            point_size: [1.0 / w as f32, 1.0 / h as f32],
            max_depth,
            _pad: [0; 3],
        };
        let fog = self.regs.fogcol;
        let texa = self.regs.texa;
        let clamp = &ctx.clamp;
        let (tw, th) = (tex_size.0 as f32, tex_size.1 as f32);
        let min_max = match (clamp.wms, clamp.wmt) {
            (3, _) | (_, 3) => [clamp.minu as f32, clamp.minv as f32, clamp.maxu as f32, clamp.maxv as f32],
            _ => [
                (clamp.minu as f32 + 0.5) / tw,
                (clamp.minv as f32 + 0.5) / th,
                (clamp.maxu as f32 + 0.5) / tw,
                (clamp.maxv as f32 + 0.5) / th,
            ],
        };
        let ps_cb = PsConstantBuffer {
            fog_color_aref: [fog.r as f32, fog.g as f32, fog.b as f32, atst.1 as f32],
            ta_afix_max_depth: [
                texa.ta0 as f32,
                texa.ta1 as f32,
                ctx.alpha.fix as f32,
                max_depth as f32 / 4_294_967_296.0,
            ],
            wh: [tw, th, w as f32, h as f32],
            min_max,
        };

        // Record
        self.dev.ps_set_shader_resource(0, texture)?;
        let wrap = |mode: u8| mode == 0;
        self.dev.ps_set_sampler(
            0,
            SamplerSelector {
                tau: wrap(clamp.wms),
                tav: wrap(clamp.wmt),
                biln: bilinear,
                ..Default::default()
            },
        )?;
        let draw_scissor = scissor.intersect(&target_rect).scale(scale);
        self.dev.om_set_render_targets(Some(rt), ds, draw_scissor)?;
        self.dev
            .ia_set_vertex_buffer(bytemuck::cast_slice(&*vertices), std::mem::size_of::<GsVertex>() as u32)?;
        self.dev.ia_set_index_buffer(indices)?;
        self.dev.setup_vs(&vs_cb)?;
        self.dev.setup_ps(&ps_cb)?;
        self.dev.bind_draw_pipeline(&sel, ctx.alpha.fix)?;
        self.dev.draw_indexed()?;

        if writes.any_color() {
            self.cache.mark_dirty(rt, area);
        }
        if sel.dss.zwe {
            if let Some(ds) = ds {
                self.cache.mark_dirty(ds, area);
            }
        }
        log::trace!(
            "Drew {} indices of {:?} into {:?} at block {:#x}, area {:?}",
            indices.len(),
            prim.prim,
            ctx.frame.psm,
            ctx.frame.fbp,
            area
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gs::registers::encode;

    #[test]
    fn test_strips_and_fans_unroll() {
        assert_eq!(primitive_indices(PrimType::TriangleStrip, 5), vec![0, 1, 2, 1, 2, 3, 2, 3, 4]);
        assert_eq!(primitive_indices(PrimType::TriangleFan, 4), vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(primitive_indices(PrimType::LineStrip, 3), vec![0, 1, 1, 2]);
        assert!(primitive_indices(PrimType::TriangleStrip, 2).is_empty());
    }

    #[test]
    fn test_lists_drop_incomplete_primitives() {
        assert_eq!(primitive_indices(PrimType::Triangle, 7), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(primitive_indices(PrimType::Sprite, 3), vec![0, 1]);
        assert_eq!(primitive_indices(PrimType::Point, 2), vec![0, 1]);
    }

    #[test]
    fn test_alpha_test_folding() {
        let test = |atst: u64, aref: u64| Test::from(encode::test(true, atst, aref, false, false, false, 0));
        assert_eq!(alpha_test_mode(&Test::default()), AlphaTestMode::Pass);
        assert_eq!(alpha_test_mode(&test(0, 0x40)), AlphaTestMode::Fail);
        assert_eq!(alpha_test_mode(&test(1, 0x40)), AlphaTestMode::Pass);
        assert_eq!(alpha_test_mode(&test(2, 0)), AlphaTestMode::Fail);
        assert_eq!(alpha_test_mode(&test(2, 0x40)), AlphaTestMode::Compare(1, 0x3F));
        assert_eq!(alpha_test_mode(&test(3, 0x40)), AlphaTestMode::Compare(1, 0x40));
        assert_eq!(alpha_test_mode(&test(4, 0x40)), AlphaTestMode::Compare(3, 0x40));
        assert_eq!(alpha_test_mode(&test(5, 0x40)), AlphaTestMode::Compare(2, 0x40));
        assert_eq!(alpha_test_mode(&test(6, 0xFF)), AlphaTestMode::Fail);
        assert_eq!(alpha_test_mode(&test(6, 0x40)), AlphaTestMode::Compare(2, 0x41));
        assert_eq!(alpha_test_mode(&test(7, 0x40)), AlphaTestMode::Compare(4, 0x40));
    }

    #[test]
    fn test_frame_mask_channels() {
        let frame = |psm: Psm, fbmsk: u32| Frame::from(encode::frame(0, 1, psm, fbmsk));
        assert_eq!(channel_writes(&frame(Psm::Ct32, 0)), ([true; 3], true));
        assert_eq!(channel_writes(&frame(Psm::Ct32, 0xFF00_00FF)), ([false, true, true], false));
        // Partial masks still write
        assert_eq!(channel_writes(&frame(Psm::Ct32, 0x0000_0F00)), ([true; 3], true));
        assert_eq!(channel_writes(&frame(Psm::Ct24, 0)), ([true; 3], false));
        // Low bits of 16-bit channels aren't stored
        assert_eq!(channel_writes(&frame(Psm::Ct16, 0x8000_F800)), ([true, false, true], false));
    }
}
