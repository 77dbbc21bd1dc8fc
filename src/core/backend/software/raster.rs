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

//! Draw execution
//!
//! A draw runs in two phases. The first fetches vertices, runs the vertex and
//! geometry programs, rasterizes and shades every covered pixel while only
//! reading images (so a draw may sample its own render target). The second
//! applies stencil, depth and blending to the attachments in primitive order.
//!
//! Coverage samples pixel centers. Pixels exactly on an edge belong to the
//! triangle for which that edge runs downwards (or leftwards when
//! horizontal), so two triangles sharing an edge never both cover a pixel.

use std::collections::HashMap;

use bytemuck::Pod;

use super::program::{self, CompiledShader, FragmentResources, FsIn, FsOut, TfxGsConfig, VsOut};
use super::{Buffer, DescriptorSet, ExecState, Image, SoftwareBackend};
use crate::core::backend::{
    BlendFactor, BlendOp, BlendState, BufferId, ColorWriteMask, DescriptorSetId,
    DescriptorSetLayoutKind, DescriptorWrite, ImageId, PipelineLayoutKind, SamplerDesc, SamplerId,
    StencilOp, StencilState, Topology, VertexLayout, Viewport,
};
use crate::core::layout::{GsVertex, PsConstantBuffer, UtilityVertex, VsConstantBuffer};
use crate::core::types::Rect;

type DrawResult<T> = std::result::Result<T, String>;

/// Recorded draw parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct DrawCall {
    pub count: u32,
    pub first: u32,
    pub indexed: bool,
    pub vertex_offset: i32,
}

/// Primitive in clip space
#[derive(Debug, Clone, Copy)]
enum ClipPrimitive {
    Point(VsOut),
    Line(VsOut, VsOut),
    Triangle(VsOut, VsOut, VsOut),
}

/// Vertex in framebuffer coordinates
#[derive(Debug, Clone, Copy)]
struct WinVertex {
    x: f64,
    y: f64,
    z: f64,
    attr: VsOut,
}

struct Fragment {
    x: u32,
    y: u32,
    depth: f64,
    out: FsOut,
}

fn bound_set<'a>(
    sets: &'a HashMap<DescriptorSetId, DescriptorSet>,
    st: &ExecState,
    slot: usize,
) -> Option<&'a DescriptorSet> {
    st.sets[slot].and_then(|id| sets.get(&id))
}

/// Read a dynamic uniform buffer binding of set 0
fn read_uniform<T: Pod + Default>(
    set: Option<&DescriptorSet>,
    binding: u32,
    offsets: &[u32],
    buffers: &HashMap<BufferId, Buffer>,
) -> T {
    let size = std::mem::size_of::<T>();
    set.into_iter()
        .flat_map(|s| s.writes.iter())
        .find_map(|w| match *w {
            DescriptorWrite::UniformBufferDynamic {
                binding: b, buffer, ..
            } if b == binding => {
                let offset = offsets.get(binding as usize).copied().unwrap_or(0) as usize;
                buffers
                    .get(&buffer)
                    .and_then(|buf| buf.data.get(offset..offset + size))
                    .map(bytemuck::pod_read_unaligned)
            }
            _ => None,
        })
        .unwrap_or_default()
}

fn vertex_indices(
    buffers: &HashMap<BufferId, Buffer>,
    st: &ExecState,
    call: &DrawCall,
) -> DrawResult<Vec<i64>> {
    if !call.indexed {
        return Ok((0..call.count).map(|i| (call.first + i) as i64).collect());
    }
    let (ib, offset) = st
        .index_buffer
        .ok_or("indexed draw without an index buffer")?;
    let data = &buffers
        .get(&ib)
        .ok_or_else(|| format!("index buffer {} destroyed", ib.0))?
        .data;
    (0..call.count)
        .map(|i| -> DrawResult<i64> {
            let at = offset as usize + (call.first + i) as usize * 4;
            let b = data
                .get(at..at + 4)
                .ok_or_else(|| format!("index {} outside index buffer", call.first + i))?;
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64 + call.vertex_offset as i64)
        })
        .collect()
}

fn read_vertex<T: Pod>(data: &[u8], base: u64, index: i64) -> DrawResult<T> {
    let size = std::mem::size_of::<T>() as i64;
    let at = base as i64 + index * size;
    if at < 0 {
        return Err(format!("vertex {} before start of vertex buffer", index));
    }
    data.get(at as usize..(at + size) as usize)
        .map(bytemuck::pod_read_unaligned)
        .ok_or_else(|| format!("vertex {} outside vertex buffer", index))
}

fn assemble(topology: Topology, verts: &[VsOut]) -> Vec<ClipPrimitive> {
    match topology {
        Topology::PointList => verts.iter().map(|v| ClipPrimitive::Point(*v)).collect(),
        Topology::LineList => verts
            .chunks_exact(2)
            .map(|l| ClipPrimitive::Line(l[0], l[1]))
            .collect(),
        Topology::TriangleList => verts
            .chunks_exact(3)
            .map(|t| ClipPrimitive::Triangle(t[0], t[1], t[2]))
            .collect(),
        Topology::TriangleStrip => (2..verts.len())
            .map(|i| {
                if i % 2 == 0 {
                    ClipPrimitive::Triangle(verts[i - 2], verts[i - 1], verts[i])
                } else {
                    ClipPrimitive::Triangle(verts[i - 1], verts[i - 2], verts[i])
                }
            })
            .collect(),
    }
}

fn quad(out: &mut Vec<ClipPrimitive>, lt: VsOut, rt: VsOut, lb: VsOut, rb: VsOut) {
    out.push(ClipPrimitive::Triangle(lt, rt, lb));
    out.push(ClipPrimitive::Triangle(rt, rb, lb));
}

/// TFX geometry stage: sprite, point and line expansion and flat shading
fn run_geometry(
    cfg: &TfxGsConfig,
    prim: ClipPrimitive,
    point_size: [f64; 2],
    out: &mut Vec<ClipPrimitive>,
) {
    match prim {
        ClipPrimitive::Line(v0, v1) if cfg.prim == 3 => {
            // Sprite: everything but the first corner's position and texture
            // coordinate comes from the second vertex.
            let mut lt = v1;
            lt.pos[0] = v0.pos[0];
            lt.pos[1] = v0.pos[1];
            lt.tex[0] = v0.tex[0];
            lt.tex[1] = v0.tex[1];
            let mut rt = v1;
            rt.pos[1] = v0.pos[1];
            rt.tex[1] = v0.tex[1];
            let mut lb = v1;
            lb.pos[0] = v0.pos[0];
            lb.tex[0] = v0.tex[0];
            quad(out, lt, rt, lb, v1);
        }
        ClipPrimitive::Point(v) if cfg.point => {
            let corner = |dx: f64, dy: f64| {
                let mut c = v;
                c.pos[0] += dx * point_size[0];
                c.pos[1] += dy * point_size[1];
                c
            };
            quad(
                out,
                corner(-1.0, -1.0),
                corner(1.0, -1.0),
                corner(-1.0, 1.0),
                corner(1.0, 1.0),
            );
        }
        ClipPrimitive::Line(mut v0, v1) if cfg.line => {
            if !cfg.iip {
                v0.color = v1.color;
            }
            let dx = v1.pos[0] - v0.pos[0];
            let dy = v1.pos[1] - v0.pos[1];
            let len = (dx * dx + dy * dy).sqrt();
            if len == 0.0 {
                return;
            }
            let nx = -dy / len * point_size[0];
            let ny = dx / len * point_size[1];
            let offset = |v: VsOut, s: f64| {
                let mut c = v;
                c.pos[0] += nx * s;
                c.pos[1] += ny * s;
                c
            };
            quad(out, offset(v0, -1.0), offset(v0, 1.0), offset(v1, -1.0), offset(v1, 1.0));
        }
        ClipPrimitive::Line(mut v0, v1) => {
            if !cfg.iip {
                v0.color = v1.color;
            }
            out.push(ClipPrimitive::Line(v0, v1));
        }
        ClipPrimitive::Triangle(mut a, mut b, c) => {
            if !cfg.iip {
                a.color = c.color;
                b.color = c.color;
            }
            out.push(ClipPrimitive::Triangle(a, b, c));
        }
        p => out.push(p),
    }
}

fn to_window(v: &VsOut, vp: &Viewport) -> WinVertex {
    let w = if v.pos[3] == 0.0 { 1.0 } else { v.pos[3] };
    let (nx, ny, nz) = (v.pos[0] / w, v.pos[1] / w, v.pos[2] / w);
    WinVertex {
        x: vp.x as f64 + (nx + 1.0) * 0.5 * vp.width as f64,
        y: vp.y as f64 + (ny + 1.0) * 0.5 * vp.height as f64,
        z: vp.min_depth as f64 + nz * (vp.max_depth - vp.min_depth) as f64,
        attr: *v,
    }
}

fn edge(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> f64 {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

fn covers(e: f64, a: (f64, f64), b: (f64, f64)) -> bool {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    e > 0.0 || (e == 0.0 && (dy > 0.0 || (dy == 0.0 && dx < 0.0)))
}

fn rasterize(
    prim: &[WinVertex],
    clip: Rect,
    emit: &mut impl FnMut(u32, u32, VsOut, f64),
) {
    let in_clip = |x: i64, y: i64| {
        x >= clip.left as i64 && x < clip.right as i64 && y >= clip.top as i64 && y < clip.bottom as i64
    };

    match prim {
        [p] => {
            let (x, y) = (p.x.floor() as i64, p.y.floor() as i64);
            if in_clip(x, y) {
                emit(x as u32, y as u32, p.attr, p.z);
            }
        }
        [a, b] => {
            let (dx, dy) = (b.x - a.x, b.y - a.y);
            let steps = dx.abs().max(dy.abs()).round().max(1.0) as i64;
            for i in 0..steps {
                let t = (i as f64 + 0.5) / steps as f64;
                let (x, y) = ((a.x + dx * t).floor() as i64, (a.y + dy * t).floor() as i64);
                if in_clip(x, y) {
                    let attr = VsOut::blend(&[&a.attr, &b.attr], &[1.0 - t, t]);
                    emit(x as u32, y as u32, attr, a.z + (b.z - a.z) * t);
                }
            }
        }
        [v0, v1, v2] => {
            let mut v = [*v0, *v1, *v2];
            let p = |w: &WinVertex| (w.x, w.y);
            let mut area = edge(p(&v[0]), p(&v[1]), p(&v[2]));
            if area == 0.0 || !area.is_finite() {
                return;
            }
            if area < 0.0 {
                v.swap(1, 2);
                area = -area;
            }

            let min = |f: fn(&WinVertex) -> f64| v.iter().map(f).fold(f64::INFINITY, f64::min);
            let max = |f: fn(&WinVertex) -> f64| v.iter().map(f).fold(f64::NEG_INFINITY, f64::max);
            let x0 = (min(|w| w.x).floor() as i64).max(clip.left as i64);
            let x1 = (max(|w| w.x).ceil() as i64).min(clip.right as i64);
            let y0 = (min(|w| w.y).floor() as i64).max(clip.top as i64);
            let y1 = (max(|w| w.y).ceil() as i64).min(clip.bottom as i64);

            let (a, b, c) = (p(&v[0]), p(&v[1]), p(&v[2]));
            for y in y0..y1 {
                for x in x0..x1 {
                    let center = (x as f64 + 0.5, y as f64 + 0.5);
                    let w0 = edge(b, c, center);
                    let w1 = edge(c, a, center);
                    let w2 = edge(a, b, center);
                    if !(covers(w0, b, c) && covers(w1, c, a) && covers(w2, a, b)) {
                        continue;
                    }
                    let l = [w0 / area, w1 / area, w2 / area];
                    let attr = VsOut::blend(&[&v[0].attr, &v[1].attr, &v[2].attr], &l);
                    let z = v[0].z * l[0] + v[1].z * l[1] + v[2].z * l[2];
                    emit(x as u32, y as u32, attr, z);
                }
            }
        }
        _ => {}
    }
}

fn fragment_resources<'a>(
    layout: PipelineLayoutKind,
    st: &'a ExecState,
    images: &'a HashMap<ImageId, Image>,
    samplers: &HashMap<SamplerId, SamplerDesc>,
    sets: &HashMap<DescriptorSetId, DescriptorSet>,
    buffers: &HashMap<BufferId, Buffer>,
) -> FragmentResources<'a> {
    let mut res = FragmentResources {
        combined: None,
        textures: [None; 4],
        samplers: [None; 2],
        ps_cb: PsConstantBuffer::default(),
        push: &st.push_constants,
    };

    match layout {
        PipelineLayoutKind::Utility => {
            let set = bound_set(sets, st, 0).filter(|s| s.layout == DescriptorSetLayoutKind::Utility);
            res.combined = set.into_iter().flat_map(|s| s.writes.iter()).find_map(|w| match *w {
                DescriptorWrite::CombinedImageSampler {
                    binding: 0,
                    image,
                    sampler,
                } => Some((images.get(&image)?, *samplers.get(&sampler)?)),
                _ => None,
            });
        }
        PipelineLayoutKind::Tfx => {
            res.ps_cb = read_uniform(bound_set(sets, st, 0), 1, &st.dynamic_offsets[0], buffers);
            for w in bound_set(sets, st, 1).iter().flat_map(|s| s.writes.iter()) {
                if let DescriptorWrite::SampledImage { binding, image } = *w {
                    if let Some(slot) = res.textures.get_mut(binding as usize) {
                        *slot = images.get(&image);
                    }
                }
            }
            for w in bound_set(sets, st, 2).iter().flat_map(|s| s.writes.iter()) {
                if let DescriptorWrite::Sampler { binding, sampler } = *w {
                    if let Some(slot) = res.samplers.get_mut(binding as usize) {
                        *slot = samplers.get(&sampler).copied();
                    }
                }
            }
        }
    }
    res
}

fn stencil_op(op: StencilOp, state: &StencilState, value: u32) -> u32 {
    let wm = state.write_mask;
    match op {
        StencilOp::Keep => value,
        StencilOp::Zero => value & !wm,
        StencilOp::Replace => (value & !wm) | (state.reference & wm),
    }
}

fn blend_factor(f: BlendFactor, i: usize, src: &[f64; 4], src1_alpha: f64, dst: &[f64; 4], constants: &[f32; 4]) -> f64 {
    match f {
        BlendFactor::Zero => 0.0,
        BlendFactor::One => 1.0,
        BlendFactor::SrcAlpha => src[3],
        BlendFactor::InvSrcAlpha => 1.0 - src[3],
        BlendFactor::DstAlpha => dst[3],
        BlendFactor::InvDstAlpha => 1.0 - dst[3],
        BlendFactor::Src1Alpha => src1_alpha,
        BlendFactor::InvSrc1Alpha => 1.0 - src1_alpha,
        BlendFactor::ConstantColor => constants[i] as f64,
        BlendFactor::InvConstantColor => 1.0 - constants[i] as f64,
    }
}

fn blend(state: &BlendState, out: &FsOut, dst: [f64; 4], constants: &[f32; 4]) -> [f64; 4] {
    let src = &out.color;
    let combine = |op: BlendOp, s: f64, d: f64| match op {
        BlendOp::Add => s + d,
        BlendOp::Subtract => s - d,
        BlendOp::ReverseSubtract => d - s,
    };
    let mut result = [0.0; 4];
    for (i, r) in result.iter_mut().enumerate() {
        let (sf, df, op) = if i < 3 {
            (state.src_color, state.dst_color, state.color_op)
        } else {
            (state.src_alpha, state.dst_alpha, state.alpha_op)
        };
        *r = combine(
            op,
            src[i] * blend_factor(sf, i, src, out.src1_alpha, &dst, constants),
            dst[i] * blend_factor(df, i, src, out.src1_alpha, &dst, constants),
        );
    }
    result
}

pub(super) fn execute_draw(
    backend: &mut SoftwareBackend,
    st: &ExecState,
    call: &DrawCall,
) -> DrawResult<()> {
    let SoftwareBackend {
        images,
        buffers,
        samplers,
        pipelines,
        framebuffers,
        descriptor_sets,
        ..
    } = backend;

    let pipeline_id = st.pipeline.ok_or("draw without a bound pipeline")?;
    let pipeline = pipelines
        .get(&pipeline_id)
        .ok_or_else(|| format!("pipeline {} destroyed before execution", pipeline_id.0))?;
    let fb_id = st.framebuffer.ok_or("draw outside a render pass")?;
    let fb = framebuffers
        .get(&fb_id)
        .ok_or_else(|| format!("framebuffer {} destroyed before execution", fb_id.0))?;
    let (color_id, depth_id) = (fb.color, fb.depth);

    let (fb_w, fb_h) = color_id
        .or(depth_id)
        .and_then(|id| images.get(&id))
        .map(|img| img.level_size(0))
        .ok_or("framebuffer attachments destroyed")?;

    // Vertex stage
    let indices = vertex_indices(buffers, st, call)?;
    let (vb, vb_offset) = st.vertex_buffer.ok_or("draw without a vertex buffer")?;
    let vertex_data = &buffers
        .get(&vb)
        .ok_or_else(|| format!("vertex buffer {} destroyed", vb.0))?
        .data;

    let mut vs_cb = VsConstantBuffer::default();
    let verts: Vec<VsOut> = match (&pipeline.vertex, pipeline.desc.vertex_layout) {
        (CompiledShader::UtilityVertex, VertexLayout::Utility) => indices
            .iter()
            .map(|&i| read_vertex::<UtilityVertex>(vertex_data, vb_offset, i).map(|v| program::run_utility_vs(&v)))
            .collect::<DrawResult<_>>()?,
        (CompiledShader::TfxVertex(cfg), VertexLayout::Tfx) => {
            vs_cb = read_uniform(
                bound_set(descriptor_sets, st, 0),
                0,
                &st.dynamic_offsets[0],
                buffers,
            );
            indices
                .iter()
                .map(|&i| read_vertex::<GsVertex>(vertex_data, vb_offset, i).map(|v| program::run_tfx_vs(cfg, &v, &vs_cb)))
                .collect::<DrawResult<_>>()?
        }
        (shader, layout) => {
            return Err(format!(
                "vertex program {:?} can't consume {:?} vertices",
                shader, layout
            ))
        }
    };

    // Primitive assembly and geometry stage
    let mut prims = assemble(pipeline.desc.topology, &verts);
    if let Some(CompiledShader::TfxGeometry(cfg)) = &pipeline.geometry {
        let point_size = [vs_cb.point_size[0] as f64, vs_cb.point_size[1] as f64];
        let mut expanded = Vec::with_capacity(prims.len() * 2);
        for prim in prims {
            run_geometry(cfg, prim, point_size, &mut expanded);
        }
        prims = expanded;
    }

    let viewport = st.viewport.unwrap_or_else(|| Viewport::from_size(fb_w, fb_h));
    let clip = st
        .scissor
        .unwrap_or_else(|| Rect::from_size(fb_w, fb_h))
        .intersect(&st.area)
        .intersect(&Rect::from_size(fb_w, fb_h));

    // Rasterization and fragment stage; images are only read here
    let res = fragment_resources(
        pipeline.desc.layout,
        st,
        images,
        samplers,
        descriptor_sets,
        buffers,
    );
    let mut fragments = Vec::new();
    for prim in &prims {
        let win: Vec<WinVertex> = match prim {
            ClipPrimitive::Point(v) => vec![to_window(v, &viewport)],
            ClipPrimitive::Line(a, b) => vec![to_window(a, &viewport), to_window(b, &viewport)],
            ClipPrimitive::Triangle(a, b, c) => vec![
                to_window(a, &viewport),
                to_window(b, &viewport),
                to_window(c, &viewport),
            ],
        };
        rasterize(&win, clip, &mut |x, y, attr, z| {
            let input = FsIn {
                coord: [x as f64 + 0.5, y as f64 + 0.5],
                tex: attr.tex,
                color: attr.color,
                fog: attr.fog,
                depth: z,
            };
            let out = match &pipeline.fragment {
                Some(shader) => program::run_fragment(shader, &input, &res),
                None => Some(FsOut {
                    color: [0.0; 4],
                    src1_alpha: 0.0,
                    depth: None,
                }),
            };
            if let Some(out) = out {
                fragments.push(Fragment {
                    x,
                    y,
                    depth: out.depth.unwrap_or(z),
                    out,
                });
            }
        });
    }

    // Output merger
    let ds = pipeline.desc.depth_stencil;
    let blend_state = pipeline.desc.blend;
    let constants = st.blend_constants;
    for frag in fragments {
        if let Some(depth_img) = depth_id.and_then(|id| images.get_mut(&id)) {
            let stored = depth_img.texel(0, frag.x, frag.y);
            let mut depth = stored[0];
            let mut stencil = stored[1] as u32;
            let frag_depth = frag.depth.clamp(0.0, 1.0) as f32 as f64;
            let s = &ds.stencil;

            if ds.stencil_test
                && !s
                    .compare
                    .test(s.reference & s.compare_mask, stencil & s.compare_mask)
            {
                stencil = stencil_op(s.fail_op, s, stencil);
                depth_img.set_texel(0, frag.x, frag.y, [depth, stencil as f64, 0.0, 0.0]);
                continue;
            }
            if ds.depth_test && !ds.depth_compare.test(frag_depth, depth) {
                if ds.stencil_test {
                    stencil = stencil_op(s.depth_fail_op, s, stencil);
                    depth_img.set_texel(0, frag.x, frag.y, [depth, stencil as f64, 0.0, 0.0]);
                }
                continue;
            }
            if ds.stencil_test {
                stencil = stencil_op(s.pass_op, s, stencil);
            }
            if ds.depth_write {
                depth = frag_depth;
            }
            depth_img.set_texel(0, frag.x, frag.y, [depth, stencil as f64, 0.0, 0.0]);
        }

        if pipeline.fragment.is_none() {
            continue;
        }
        if let Some(color_img) = color_id.and_then(|id| images.get_mut(&id)) {
            let dst = color_img.texel(0, frag.x, frag.y);
            let mut value = if blend_state.enable {
                blend(&blend_state, &frag.out, dst, &constants)
            } else {
                frag.out.color
            };
            let mask = blend_state.write_mask;
            for (i, bit) in [ColorWriteMask::R, ColorWriteMask::G, ColorWriteMask::B, ColorWriteMask::A]
                .iter()
                .enumerate()
            {
                if !mask.contains(*bit) {
                    value[i] = dst[i];
                }
            }
            color_img.set_texel(0, frag.x, frag.y, value);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vert(x: f64, y: f64) -> WinVertex {
        WinVertex {
            x,
            y,
            z: 0.0,
            attr: VsOut::default(),
        }
    }

    fn coverage(prim: &[WinVertex], clip: Rect) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        rasterize(prim, clip, &mut |x, y, _, _| out.push((x, y)));
        out
    }

    #[test]
    fn test_quad_halves_cover_each_pixel_once() {
        let clip = Rect::from_size(8, 8);
        let (lt, rt, lb, rb) = (vert(0.0, 0.0), vert(4.0, 0.0), vert(0.0, 4.0), vert(4.0, 4.0));
        let mut all = coverage(&[lt, rt, lb], clip);
        all.extend(coverage(&[rt, rb, lb], clip));
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, all.len());
        assert_eq!(all.len(), 16);
    }

    #[test]
    fn test_winding_does_not_matter() {
        let clip = Rect::from_size(8, 8);
        let cw = coverage(&[vert(0.0, 0.0), vert(4.0, 0.0), vert(0.0, 4.0)], clip);
        let ccw = coverage(&[vert(0.0, 0.0), vert(0.0, 4.0), vert(4.0, 0.0)], clip);
        assert_eq!(cw.len(), ccw.len());
        assert!(!cw.is_empty());
    }

    #[test]
    fn test_clip_limits_coverage() {
        let clip = Rect::new(1, 1, 3, 3);
        let covered = coverage(
            &[vert(0.0, 0.0), vert(8.0, 0.0), vert(0.0, 8.0)],
            clip,
        );
        assert!(covered.iter().all(|&(x, y)| (1..3).contains(&x) && (1..3).contains(&y)));
    }

    #[test]
    fn test_sprite_expansion_takes_second_vertex_color() {
        let cfg = TfxGsConfig {
            iip: true,
            prim: 3,
            point: false,
            line: false,
        };
        let v0 = VsOut {
            color: [1.0, 0.0, 0.0, 0.0],
            ..Default::default()
        };
        let v1 = VsOut {
            pos: [1.0, 1.0, 0.5, 1.0],
            color: [0.0, 1.0, 0.0, 0.0],
            ..Default::default()
        };
        let mut out = Vec::new();
        run_geometry(&cfg, ClipPrimitive::Line(v0, v1), [0.0; 2], &mut out);
        assert_eq!(out.len(), 2);
        for prim in out {
            let ClipPrimitive::Triangle(a, b, c) = prim else {
                panic!("sprite must expand into triangles");
            };
            for v in [a, b, c] {
                assert_eq!(v.color, v1.color);
                assert_eq!(v.pos[2], 0.5);
            }
        }
    }

    #[test]
    fn test_flat_shading_uses_last_vertex() {
        let cfg = TfxGsConfig {
            iip: false,
            prim: 2,
            point: false,
            line: false,
        };
        let c = VsOut {
            color: [9.0; 4],
            ..Default::default()
        };
        let mut out = Vec::new();
        run_geometry(
            &cfg,
            ClipPrimitive::Triangle(VsOut::default(), VsOut::default(), c),
            [0.0; 2],
            &mut out,
        );
        let ClipPrimitive::Triangle(a, b, _) = out[0] else {
            panic!("expected triangle");
        };
        assert_eq!(a.color, [9.0; 4]);
        assert_eq!(b.color, [9.0; 4]);
    }

    #[test]
    fn test_blend_dual_source_mix() {
        let state = BlendState {
            enable: true,
            src_color: BlendFactor::Src1Alpha,
            dst_color: BlendFactor::InvSrc1Alpha,
            ..BlendState::default()
        };
        let out = FsOut {
            color: [1.0, 1.0, 1.0, 1.0],
            src1_alpha: 0.25,
            depth: None,
        };
        let result = blend(&state, &out, [0.0, 0.0, 0.0, 0.5], &[0.0; 4]);
        assert!((result[0] - 0.25).abs() < 1e-9);
        assert_eq!(result[3], 1.0);
    }

    #[test]
    fn test_stencil_replace_respects_write_mask() {
        let state = StencilState {
            write_mask: 0x0F,
            reference: 0xFF,
            ..StencilState::default()
        };
        assert_eq!(stencil_op(StencilOp::Replace, &state, 0xA0), 0xAF);
        assert_eq!(stencil_op(StencilOp::Zero, &state, 0xAF), 0xA0);
        assert_eq!(stencil_op(StencilOp::Keep, &state, 0x12), 0x12);
    }
}
