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

//! Display output
//!
//! On every vertical blank the enabled read circuits are resolved to render
//! targets, merged into one image, optionally deinterlaced and stretched
//! onto the swap chain.
//!
//! # Circuit placement
//!
//! ```text
//! DISPFB.DBX/DBY ──> source rectangle in the frame buffer
//! DISPLAY.DX/DY  ──> position in the output, DX in video clocks
//! DISPLAY.DW/DH  ──> size, divided by MAGH/MAGV
//! ```
//!
//! The output is the union of both circuits' placements, moved so the
//! top-left one starts at the origin.

use crate::core::backend::GpuBackend;
use crate::core::config::DeinterlaceMode;
use crate::core::device::{MergeParams, ShaderConvert, SurfaceHandle, SurfaceKind, COLOR_FORMAT};
use crate::core::error::Result;
use crate::core::gs::ReadCircuit;
use crate::core::memory::{LocalMemory, VramRegion};
use crate::core::types::{Color, Rect, RectF};

use super::HwRenderer;

/// A read circuit resolved to a target
#[derive(Debug, Clone, Copy)]
struct DisplaySource {
    surface: SurfaceHandle,
    /// Normalized source rectangle
    src: RectF,
    /// Placement in native output pixels
    dst: Rect,
    scale: u32,
}

impl<B: GpuBackend, M: LocalMemory> HwRenderer<B, M> {
    /// Vertical blank: present the displayed buffers and age the cache
    ///
    /// # Arguments
    ///
    /// * `field` - Odd field of an interlaced frame
    pub fn vsync(&mut self, field: bool) -> Result<()> {
        let result = self.present_frame(field);
        self.cache.on_vsync(&mut self.dev, &mut self.mem);
        self.stats.vsyncs += 1;
        result
    }

    fn present_frame(&mut self, field: bool) -> Result<()> {
        let frame = self.merge_circuits()?;
        let frame = match frame {
            Some(merged) => Some(self.deinterlace(merged, field)?),
            None => None,
        };

        self.dev.begin_present(true)?;
        let result = match (frame, self.dev.swap_chain_info()) {
            (Some(frame), Some(swap)) => {
                let linear = self.dev.settings().linear_present;
                self.dev.stretch_rect(
                    frame,
                    RectF::unit(),
                    None,
                    RectF::new(0.0, 0.0, swap.width as f32, swap.height as f32),
                    ShaderConvert::Copy,
                    linear,
                )
            }
            _ => Ok(()),
        };
        let end = self.dev.end_present();
        result.and(end)
    }

    /// Make sure a target backs the displayed part of a read circuit
    ///
    /// Buffers the GPU never drew are created from local memory.
    fn display_target(&mut self, circuit: &ReadCircuit) -> Result<()> {
        let fb = &circuit.dispfb;
        let (_, h) = circuit.display.size();
        let needed = fb.dby + h;
        let existing = self.find_target(fb.fbp, fb.fbw, fb.psm).map(|t| t.height());
        if existing.is_some_and(|height| height >= needed) {
            return Ok(());
        }

        self.cache
            .lookup_target(&mut self.dev, &mut self.mem, fb.fbp, fb.fbw, fb.psm, needed)?;
        let first_row = existing.unwrap_or(0);
        let width = fb.fbw.max(1) * 64;
        let rows = VramRegion::new(
            fb.fbp,
            fb.fbw,
            fb.psm,
            Rect::new(0, first_row as i32, width as i32, needed as i32),
        );
        log::debug!(
            "Loading display buffer at block {:#x} rows {}..{} from memory",
            fb.fbp,
            first_row,
            needed
        );
        self.cache.invalidate_local_mem(&mut self.dev, &mut self.mem, &rows)?;
        self.cache.invalidate_video_mem(&mut self.dev, &self.mem, &rows)
    }

    /// Resolve the enabled circuits and merge them into the output surface
    fn merge_circuits(&mut self) -> Result<Option<SurfaceHandle>> {
        let mut circuits: [Option<ReadCircuit>; 2] = [None; 2];
        for (index, slot) in circuits.iter_mut().enumerate() {
            if !self.regs.circuit_enabled(index) {
                continue;
            }
            let circuit = self.regs.circuits[index];
            let psm = circuit.dispfb.psm;
            let (w, h) = circuit.display.size();
            if !psm.is_frame_format() || psm.is_depth() || w == 0 || h == 0 {
                log::debug!("Read circuit {} shows nothing ({:?}, {}x{})", index + 1, psm, w, h);
                continue;
            }
            self.display_target(&circuit)?;
            *slot = Some(circuit);
        }

        // A later lookup can grow or evict an earlier circuit's target
        let mut sources: [Option<DisplaySource>; 2] = [None; 2];
        for (index, circuit) in circuits.iter().enumerate() {
            let Some(circuit) = circuit else {
                continue;
            };
            let fb = &circuit.dispfb;
            let Some(target) = self.find_target(fb.fbp, fb.fbw, fb.psm) else {
                log::warn!("Read circuit {} lost its target at block {:#x}", index + 1, fb.fbp);
                continue;
            };
            let (w, h) = circuit.display.size();
            let src = Rect::new(fb.dbx as i32, fb.dby as i32, (fb.dbx + w) as i32, (fb.dby + h) as i32);
            let d = &circuit.display;
            let x = (d.dx / (d.magh + 1)) as i32;
            let y = d.dy as i32;
            sources[index] = Some(DisplaySource {
                surface: target.surface(),
                src: src.to_f().normalize(target.width(), target.height()),
                dst: Rect::new(x, y, x + w as i32, y + h as i32),
                scale: target.scale(),
            });
        }

        let placed: Vec<&DisplaySource> = sources.iter().flatten().collect();
        let Some(first) = placed.first() else {
            return Ok(None);
        };
        let bounds = placed.iter().fold(first.dst, |acc, s| acc.union(&s.dst));
        let scale = first.scale;
        let (out_w, out_h) = (bounds.width() as u32 * scale, bounds.height() as u32 * scale);

        let previous = self.merge_target.take();
        let output = self.fetch_output(previous, out_w, out_h)?;
        self.merge_target = Some(output);

        let mut src_rects = [RectF::unit(); 3];
        let mut dst_rects = [RectF::new(0.0, 0.0, out_w as f32, out_h as f32); 3];
        for (index, source) in sources.iter().enumerate() {
            if let Some(s) = source {
                src_rects[index] = s.src;
                dst_rects[index] = s.dst.translate(-bounds.left, -bounds.top).scale(scale).to_f();
            }
        }

        let pmode = self.regs.pmode;
        let bg = self.regs.bgcolor;
        let params = MergeParams {
            mmod: pmode.mmod,
            alp: pmode.alp,
            slbg: pmode.slbg,
            background: Color::new(bg.r as f32 / 255.0, bg.g as f32 / 255.0, bg.b as f32 / 255.0, 1.0),
            linear: self.dev.settings().linear_present,
        };
        self.dev.do_merge(
            [sources[0].map(|s| s.surface), sources[1].map(|s| s.surface), None],
            src_rects,
            output,
            dst_rects,
            &params,
        )?;
        Ok(Some(output))
    }

    fn deinterlace(&mut self, merged: SurfaceHandle, field: bool) -> Result<SurfaceHandle> {
        let mode = self.dev.settings().deinterlace;
        if !self.regs.smode2.int || mode == DeinterlaceMode::Off {
            return Ok(merged);
        }
        let (w, h) = {
            let s = self.dev.surface(merged)?;
            (s.width(), s.height())
        };
        let previous = self.interlace_target.take();
        let output = self.fetch_output(previous, w, h)?;
        self.interlace_target = Some(output);

        let scale = self.dev.upscale_multiplier() as f32;
        let field = field as u32 as f32;
        let (shader, yoffset) = match mode {
            DeinterlaceMode::Weave => (0, field * scale),
            DeinterlaceMode::Bob => (1, field * scale * 0.5),
            _ => (2, 0.0),
        };
        let linear = self.dev.settings().linear_present;
        self.dev.do_interlace(
            merged,
            RectF::unit(),
            output,
            RectF::new(0.0, 0.0, w as f32, h as f32),
            shader,
            linear,
            yoffset,
        )?;
        Ok(output)
    }

    /// Reuse `previous` when it already has the requested size
    fn fetch_output(&mut self, previous: Option<SurfaceHandle>, width: u32, height: u32) -> Result<SurfaceHandle> {
        if let Some(handle) = previous {
            if self
                .dev
                .surface(handle)
                .is_ok_and(|s| s.width() == width && s.height() == height)
            {
                return Ok(handle);
            }
            self.dev.recycle(handle);
        }
        self.dev
            .fetch_surface(SurfaceKind::RenderTarget, width, height, COLOR_FORMAT, false)
    }
}
