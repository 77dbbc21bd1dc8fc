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

//! Graphics pipeline cache
//!
//! Draw pipelines are keyed by [`PipelineSelector`] and utility pipelines
//! (conversion, merge, interlace, present) by [`UtilityKey`]. Both maps use
//! full equality, so a hash collision can never hand out the wrong pipeline.
//! Pipelines are kept for the lifetime of the device.
//!
//! Selectors compiled during a session can be written to a warm-up index and
//! compiled ahead of time on the next start.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::backend::{
    BlendFactor, BlendOp, BlendState, ColorWriteMask, CompareOp, DepthStencilState, Format,
    GpuBackend, GraphicsPipelineDesc, LoadOp, PipelineId, PipelineLayoutKind, RenderPassKey,
    ShaderProgram, ShaderStage, StencilOp, StencilState, Topology, VertexLayout,
};
use crate::core::error::{GsError, Result};

use super::blend::{hw_blend, BlendFlags};
use super::context::{GpuContext, PendingResource};
use super::convert::ShaderConvert;
use super::selector::{BlendSelector, DepthStencilSelector, PipelineSelector};
use super::shader::{gs_defines, ps_defines, vs_defines, ShaderCache};

/// Color format of draw targets
pub const COLOR_FORMAT: Format = Format::Rgba8Unorm;
/// Color format of draw targets while rendering with extended range
pub const HDR_COLOR_FORMAT: Format = Format::Rgba32Float;
/// Format of every depth target
pub const DEPTH_FORMAT: Format = Format::D32FloatS8Uint;

const WARMUP_VERSION: u32 = 1;

/// GS depth test to compare op; index is ZTST
const ZTST_COMPARE: [CompareOp; 4] = [
    CompareOp::Never,
    CompareOp::Always,
    CompareOp::GreaterOrEqual,
    CompareOp::Greater,
];

pub fn depth_stencil_state(dss: &DepthStencilSelector) -> DepthStencilState {
    let mut state = DepthStencilState {
        depth_test: dss.ztst != DepthStencilSelector::ZTST_ALWAYS || dss.zwe,
        depth_write: dss.zwe,
        depth_compare: ZTST_COMPARE[(dss.ztst & 3) as usize],
        ..Default::default()
    };
    if dss.date {
        state.stencil_test = true;
        state.stencil = StencilState {
            fail_op: StencilOp::Keep,
            pass_op: if dss.date_one {
                StencilOp::Zero
            } else {
                StencilOp::Keep
            },
            depth_fail_op: StencilOp::Keep,
            compare: CompareOp::Equal,
            compare_mask: 1,
            write_mask: 1,
            reference: 1,
        };
    }
    state
}

pub fn blend_state(bs: &BlendSelector) -> BlendState {
    let mut write_mask = ColorWriteMask::empty();
    write_mask.set(ColorWriteMask::R, bs.wr);
    write_mask.set(ColorWriteMask::G, bs.wg);
    write_mask.set(ColorWriteMask::B, bs.wb);
    write_mask.set(ColorWriteMask::A, bs.wa);

    let hw = hw_blend(bs.blend_index);
    if !bs.abe || hw.flags.contains(BlendFlags::NO_HW) {
        return BlendState {
            write_mask,
            ..Default::default()
        };
    }

    let (src, dst) = if bs.accu_blend {
        (BlendFactor::One, BlendFactor::One)
    } else {
        (hw.src, hw.dst)
    };
    BlendState {
        enable: true,
        src_color: src,
        dst_color: dst,
        color_op: hw.op,
        src_alpha: BlendFactor::One,
        dst_alpha: BlendFactor::Zero,
        alpha_op: BlendOp::Add,
        write_mask,
    }
}

/// Render pass a draw pipeline is built against
pub fn tfx_render_pass_key(sel: &PipelineSelector) -> RenderPassKey {
    RenderPassKey {
        color: sel.rt.then_some(if sel.ps.hdr {
            HDR_COLOR_FORMAT
        } else {
            COLOR_FORMAT
        }),
        depth: sel.ds.then_some(DEPTH_FORMAT),
        color_load: if sel.rt { LoadOp::Load } else { LoadOp::DontCare },
        depth_load: if sel.ds { LoadOp::Load } else { LoadOp::DontCare },
        stencil_load: if sel.ds { LoadOp::Load } else { LoadOp::DontCare },
    }
}

fn tfx_topology(topology: u8) -> Topology {
    match topology {
        PipelineSelector::TOPOLOGY_POINT => Topology::PointList,
        PipelineSelector::TOPOLOGY_LINE => Topology::LineList,
        _ => Topology::TriangleList,
    }
}

/// Fragment program of a utility draw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UtilityProgram {
    Convert(ShaderConvert),
    /// 0: alpha from the source, 1: fixed alpha
    Merge(u32),
    /// 0 weave, 1 bob, 2 blend, 3 copy
    Interlace(u32),
}

impl UtilityProgram {
    fn program(self) -> (ShaderProgram, u32) {
        match self {
            UtilityProgram::Convert(s) => (ShaderProgram::Convert, s.index()),
            UtilityProgram::Merge(i) => (ShaderProgram::Merge, i),
            UtilityProgram::Interlace(i) => (ShaderProgram::Interlace, i),
        }
    }
}

/// Attachment a utility draw writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UtilityTarget {
    Color(Format),
    Depth,
    /// Stencil-only pass marking pixels for destination alpha test
    DateSetup,
    /// Swap chain image
    Present(Format),
}

impl UtilityTarget {
    /// Load-variant pass key; the load ops don't affect compatibility
    pub fn render_pass_key(self) -> RenderPassKey {
        match self {
            UtilityTarget::Color(f) | UtilityTarget::Present(f) => RenderPassKey::color(f, LoadOp::Load),
            UtilityTarget::Depth => RenderPassKey::depth(DEPTH_FORMAT, LoadOp::Load, LoadOp::Load),
            UtilityTarget::DateSetup => {
                RenderPassKey::depth(DEPTH_FORMAT, LoadOp::DontCare, LoadOp::Load)
            }
        }
    }
}

/// Identity of a utility pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UtilityKey {
    pub program: UtilityProgram,
    pub target: UtilityTarget,
    pub write_mask: ColorWriteMask,
    /// Source-alpha blending over the destination
    pub blend: bool,
}

impl UtilityKey {
    pub fn new(program: UtilityProgram, target: UtilityTarget) -> Self {
        Self {
            program,
            target,
            write_mask: ColorWriteMask::ALL,
            blend: false,
        }
    }

    pub fn masked(self, write_mask: ColorWriteMask) -> Self {
        Self { write_mask, ..self }
    }

    pub fn blended(self) -> Self {
        Self { blend: true, ..self }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WarmupIndex {
    version: u32,
    created: DateTime<Utc>,
    selectors: Vec<PipelineSelector>,
}

/// Selector and utility pipeline maps
#[derive(Default)]
pub struct PipelineCache {
    tfx: HashMap<PipelineSelector, PipelineId>,
    utility: HashMap<UtilityKey, PipelineId>,
    /// Draw selectors in creation order
    created: Vec<PipelineSelector>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tfx_count(&self) -> usize {
        self.tfx.len()
    }

    pub fn utility_count(&self) -> usize {
        self.utility.len()
    }

    pub fn contains_tfx(&self, sel: &PipelineSelector) -> bool {
        self.tfx.contains_key(sel)
    }

    /// Draw pipeline for `sel`, building it on first use
    pub fn get_or_create_tfx<B: GpuBackend>(
        &mut self,
        ctx: &mut GpuContext<B>,
        shaders: &mut ShaderCache,
        sel: &PipelineSelector,
        scale_factor: u32,
    ) -> Result<PipelineId> {
        if let Some(p) = self.tfx.get(sel) {
            return Ok(*p);
        }

        let vs = shaders.get_or_create(ctx, ShaderStage::Vertex, ShaderProgram::Tfx, &vs_defines(&sel.vs), None)?;
        let gs = if sel.gs.is_needed() {
            Some(shaders.get_or_create(ctx, ShaderStage::Geometry, ShaderProgram::Tfx, &gs_defines(&sel.gs), None)?)
        } else {
            None
        };
        let fs = shaders.get_or_create(
            ctx,
            ShaderStage::Fragment,
            ShaderProgram::Tfx,
            &ps_defines(&sel.ps, scale_factor),
            None,
        )?;

        let render_pass = ctx.backend_mut().render_pass(&tfx_render_pass_key(sel))?;
        let desc = GraphicsPipelineDesc {
            layout: PipelineLayoutKind::Tfx,
            vertex_layout: VertexLayout::Tfx,
            topology: tfx_topology(sel.topology),
            vertex_shader: vs,
            geometry_shader: gs,
            fragment_shader: Some(fs),
            render_pass,
            depth_stencil: if sel.ds {
                depth_stencil_state(&sel.dss)
            } else {
                DepthStencilState::default()
            },
            blend: if sel.rt {
                blend_state(&sel.bs)
            } else {
                BlendState::default()
            },
        };
        let pipeline = ctx.backend_mut().create_graphics_pipeline(&desc).map_err(|e| {
            GsError::PipelineCreation(format!("draw pipeline {:#026x}: {}", sel.key(), e))
        })?;
        log::debug!("Created draw pipeline {:#026x}", sel.key());
        self.tfx.insert(*sel, pipeline);
        self.created.push(*sel);
        Ok(pipeline)
    }

    /// Utility pipeline for `key`, building it on first use
    pub fn get_or_create_utility<B: GpuBackend>(
        &mut self,
        ctx: &mut GpuContext<B>,
        shaders: &mut ShaderCache,
        key: &UtilityKey,
    ) -> Result<PipelineId> {
        if let Some(p) = self.utility.get(key) {
            return Ok(*p);
        }

        let (program, entry) = key.program.program();
        let vs = shaders.get_or_create(ctx, ShaderStage::Vertex, program, &[], None)?;
        let fs = shaders.get_or_create(ctx, ShaderStage::Fragment, program, &[], Some(entry))?;
        let render_pass = ctx.backend_mut().render_pass(&key.target.render_pass_key())?;

        let depth_stencil = match key.target {
            UtilityTarget::Depth => DepthStencilState {
                depth_test: true,
                depth_write: true,
                depth_compare: CompareOp::Always,
                ..Default::default()
            },
            UtilityTarget::DateSetup => DepthStencilState {
                stencil_test: true,
                stencil: StencilState {
                    fail_op: StencilOp::Keep,
                    pass_op: StencilOp::Replace,
                    depth_fail_op: StencilOp::Keep,
                    compare: CompareOp::Always,
                    compare_mask: 1,
                    write_mask: 1,
                    reference: 1,
                },
                ..Default::default()
            },
            _ => DepthStencilState::default(),
        };
        let blend = BlendState {
            enable: key.blend,
            src_color: if key.blend {
                BlendFactor::SrcAlpha
            } else {
                BlendFactor::One
            },
            dst_color: if key.blend {
                BlendFactor::InvSrcAlpha
            } else {
                BlendFactor::Zero
            },
            write_mask: key.write_mask,
            ..Default::default()
        };

        let desc = GraphicsPipelineDesc {
            layout: PipelineLayoutKind::Utility,
            vertex_layout: VertexLayout::Utility,
            topology: Topology::TriangleStrip,
            vertex_shader: vs,
            geometry_shader: None,
            fragment_shader: Some(fs),
            render_pass,
            depth_stencil,
            blend,
        };
        let pipeline = ctx
            .backend_mut()
            .create_graphics_pipeline(&desc)
            .map_err(|e| GsError::PipelineCreation(format!("{:?}: {}", key, e)))?;
        log::debug!("Created utility pipeline {:?} -> {:?}", key.program, key.target);
        self.utility.insert(*key, pipeline);
        Ok(pipeline)
    }

    /// Write the draw selectors built so far
    pub fn save_warmup_index<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let index = WarmupIndex {
            version: WARMUP_VERSION,
            created: Utc::now(),
            selectors: self.created.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&index, bincode::config::standard())
            .map_err(|e| GsError::Serialization(format!("warm-up index: {}", e)))?;
        std::fs::write(path.as_ref(), bytes)?;
        log::info!(
            "Saved {} pipeline selectors to {}",
            index.selectors.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Read a warm-up index written by [`PipelineCache::save_warmup_index`]
    pub fn load_warmup_index<P: AsRef<Path>>(path: P) -> Result<Vec<PipelineSelector>> {
        let bytes = std::fs::read(path.as_ref())?;
        let (index, _): (WarmupIndex, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| GsError::Serialization(format!("warm-up index: {}", e)))?;
        if index.version != WARMUP_VERSION {
            return Err(GsError::Serialization(format!(
                "warm-up index version {} (expected {})",
                index.version, WARMUP_VERSION
            )));
        }
        log::debug!(
            "Warm-up index from {} with {} selectors",
            index.created.to_rfc3339(),
            index.selectors.len()
        );
        Ok(index.selectors)
    }

    pub fn destroy<B: GpuBackend>(&mut self, ctx: &mut GpuContext<B>) {
        for (_, p) in self.tfx.drain() {
            ctx.defer_destroy(PendingResource::Pipeline(p));
        }
        for (_, p) in self.utility.drain() {
            ctx.defer_destroy(PendingResource::Pipeline(p));
        }
        self.created.clear();
    }
}
