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

//! Shader interpreter
//!
//! "Compiling" a module means reading the `#define` block the device injected
//! in front of the template and turning it into a program configuration. The
//! programs below implement the same math as the GLSL templates in
//! `shaders/`, evaluated in double precision.
//!
//! Colors flowing through the TFX programs are in GS units (0..255, with 0x80
//! meaning 1.0 for vertex colors and alpha); everything else works on
//! normalized values.

use std::collections::HashMap;

use crate::core::backend::{AddressMode, Filter, SamplerDesc, ShaderProgram, ShaderStage};
use crate::core::device::ShaderConvert;
use crate::core::error::{GsError, Result};
use crate::core::layout::{
    GsVertex, InterlaceConstants, MergeConstants, PsConstantBuffer, UtilityVertex,
    VsConstantBuffer,
};

use super::Image;

const TWO_POW_32: f64 = 4_294_967_296.0;

/// PS2 default dither matrix (DIMX)
const DITHER_MATRIX: [[f64; 4]; 4] = [
    [-4.0, 2.0, -3.0, 3.0],
    [0.0, -2.0, 1.0, -1.0],
    [-3.0, 3.0, -4.0, 2.0],
    [1.0, -1.0, 0.0, -2.0],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TfxVsConfig {
    pub tme: bool,
    pub fst: bool,
    pub point: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TfxGsConfig {
    pub iip: bool,
    pub prim: u8,
    pub point: bool,
    pub line: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct TfxPsConfig {
    pub scale_factor: i64,
    pub fmt: i64,
    pub aem: bool,
    pub fst: bool,
    pub wms: i64,
    pub wmt: i64,
    pub tfx: i64,
    pub tcc: bool,
    pub atst: i64,
    pub fog: bool,
    pub clr1: bool,
    pub fba: bool,
    pub ltf: bool,
    pub point_sampler: bool,
    pub shuffle: bool,
    pub read_ba: bool,
    pub channel: i64,
    pub dfmt: i64,
    pub depth_fmt: i64,
    pub invalid_tex0: bool,
    pub hdr: bool,
    pub colclip: bool,
    pub blend_c: i64,
    pub blend_mix: i64,
    pub pabe: bool,
    pub dither: i64,
    pub zclamp: bool,
}

/// A compiled shader module
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CompiledShader {
    UtilityVertex,
    Convert(ShaderConvert),
    Merge(u32),
    Interlace(u32),
    TfxVertex(TfxVsConfig),
    TfxGeometry(TfxGsConfig),
    TfxFragment(Box<TfxPsConfig>),
}

/// Extract `#define NAME VALUE` pairs and the `ps_mainN` entry point alias
pub(crate) fn parse_defines(source: &str) -> (HashMap<String, i64>, Option<u32>) {
    let mut defines = HashMap::new();
    let mut entry = None;

    for line in source.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("#define") {
            continue;
        }
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        if value == "main" {
            if let Some(n) = name.strip_prefix("ps_main") {
                entry = n.parse().ok();
            }
            continue;
        }
        if let Ok(v) = value.parse::<i64>() {
            defines.insert(name.to_string(), v);
        }
    }

    (defines, entry)
}

pub(crate) fn compile(
    stage: ShaderStage,
    program: ShaderProgram,
    source: &str,
) -> Result<CompiledShader> {
    let (defines, entry) = parse_defines(source);
    let d = |name: &str| defines.get(name).copied().unwrap_or(0);
    let fail = |reason: String| GsError::ShaderCompilation { stage, reason };

    match (program, stage) {
        (ShaderProgram::Convert | ShaderProgram::Merge | ShaderProgram::Interlace, ShaderStage::Vertex) => {
            Ok(CompiledShader::UtilityVertex)
        }
        (ShaderProgram::Convert, ShaderStage::Fragment) => {
            let index = entry.ok_or_else(|| fail("no ps_main entry point selected".into()))?;
            ShaderConvert::from_index(index)
                .map(CompiledShader::Convert)
                .ok_or_else(|| fail(format!("undefined entry point ps_main{}", index)))
        }
        (ShaderProgram::Merge, ShaderStage::Fragment) => match entry {
            Some(i @ 0..=1) => Ok(CompiledShader::Merge(i)),
            other => Err(fail(format!("bad merge entry point {:?}", other))),
        },
        (ShaderProgram::Interlace, ShaderStage::Fragment) => match entry {
            Some(i @ 0..=3) => Ok(CompiledShader::Interlace(i)),
            other => Err(fail(format!("bad interlace entry point {:?}", other))),
        },
        (ShaderProgram::Tfx, ShaderStage::Vertex) => Ok(CompiledShader::TfxVertex(TfxVsConfig {
            tme: d("VS_TME") != 0,
            fst: d("VS_FST") != 0,
            point: d("VS_POINT") != 0,
        })),
        (ShaderProgram::Tfx, ShaderStage::Geometry) => {
            Ok(CompiledShader::TfxGeometry(TfxGsConfig {
                iip: d("GS_IIP") != 0,
                prim: d("GS_PRIM") as u8,
                point: d("GS_POINT") != 0,
                line: d("GS_LINE") != 0,
            }))
        }
        (ShaderProgram::Tfx, ShaderStage::Fragment) => {
            Ok(CompiledShader::TfxFragment(Box::new(TfxPsConfig {
                scale_factor: d("PS_SCALE_FACTOR").max(1),
                fmt: d("PS_FMT"),
                aem: d("PS_AEM") != 0,
                fst: d("PS_FST") != 0,
                wms: d("PS_WMS"),
                wmt: d("PS_WMT"),
                tfx: d("PS_TFX"),
                tcc: d("PS_TCC") != 0,
                atst: d("PS_ATST"),
                fog: d("PS_FOG") != 0,
                clr1: d("PS_CLR1") != 0,
                fba: d("PS_FBA") != 0,
                ltf: d("PS_LTF") != 0,
                point_sampler: d("PS_POINT_SAMPLER") != 0,
                shuffle: d("PS_SHUFFLE") != 0,
                read_ba: d("PS_READ_BA") != 0,
                channel: d("PS_CHANNEL_FETCH"),
                dfmt: d("PS_DFMT"),
                depth_fmt: d("PS_DEPTH_FMT"),
                invalid_tex0: d("PS_INVALID_TEX0") != 0,
                hdr: d("PS_HDR") != 0,
                colclip: d("PS_COLCLIP") != 0,
                blend_c: d("PS_BLEND_C"),
                blend_mix: d("PS_BLEND_MIX"),
                pabe: d("PS_PABE") != 0,
                dither: d("PS_DITHER"),
                zclamp: d("PS_ZCLAMP") != 0,
            })))
        }
        (_, ShaderStage::Geometry) => Err(fail(format!(
            "{:?} template has no geometry stage",
            program
        ))),
    }
}

/// Vertex stage output
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct VsOut {
    pub pos: [f64; 4],
    pub tex: [f64; 3],
    pub color: [f64; 4],
    pub fog: f64,
}

impl VsOut {
    /// Weighted sum of attributes
    pub fn blend(verts: &[&VsOut], weights: &[f64]) -> VsOut {
        let mut out = VsOut::default();
        for (v, &w) in verts.iter().zip(weights) {
            for i in 0..4 {
                out.pos[i] += v.pos[i] * w;
                out.color[i] += v.color[i] * w;
            }
            for i in 0..3 {
                out.tex[i] += v.tex[i] * w;
            }
            out.fog += v.fog * w;
        }
        out
    }
}

pub(crate) fn run_utility_vs(v: &UtilityVertex) -> VsOut {
    VsOut {
        pos: [
            v.pos[0] as f64,
            -(v.pos[1] as f64),
            v.pos[2] as f64,
            v.pos[3] as f64,
        ],
        tex: [v.uv[0] as f64, v.uv[1] as f64, 1.0],
        color: [1.0; 4],
        fog: 0.0,
    }
}

pub(crate) fn run_tfx_vs(cfg: &TfxVsConfig, v: &GsVertex, cb: &VsConstantBuffer) -> VsOut {
    let x = v.xy[0] as f64 * cb.vertex_scale[0] as f64 - cb.vertex_offset[0] as f64;
    let y = v.xy[1] as f64 * cb.vertex_scale[1] as f64 - cb.vertex_offset[1] as f64;
    let z = v.z.min(cb.max_depth) as f64 / TWO_POW_32;

    let tex = if !cfg.tme {
        [0.0, 0.0, 1.0]
    } else if cfg.fst {
        [
            v.uv[0] as f64 / 16.0 * cb.texture_scale[0] as f64,
            v.uv[1] as f64 / 16.0 * cb.texture_scale[1] as f64,
            1.0,
        ]
    } else {
        [v.st[0] as f64, v.st[1] as f64, v.q as f64]
    };

    VsOut {
        pos: [x, y, z, 1.0],
        tex,
        color: [
            v.rgba[0] as f64,
            v.rgba[1] as f64,
            v.rgba[2] as f64,
            v.rgba[3] as f64,
        ],
        fog: (v.fog & 0xFF) as f64,
    }
}

/// Fragment stage input
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FsIn {
    /// Pixel center in framebuffer coordinates
    pub coord: [f64; 2],
    pub tex: [f64; 3],
    pub color: [f64; 4],
    pub fog: f64,
    pub depth: f64,
}

/// Fragment stage output; `None` from a program means discard
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FsOut {
    pub color: [f64; 4],
    /// Alpha of the second (dual source) output
    pub src1_alpha: f64,
    pub depth: Option<f64>,
}

impl FsOut {
    fn color(color: [f64; 4]) -> Option<FsOut> {
        Some(FsOut {
            color,
            src1_alpha: color[3],
            depth: None,
        })
    }

    fn depth(depth: f64) -> Option<FsOut> {
        Some(FsOut {
            color: [0.0; 4],
            src1_alpha: 0.0,
            depth: Some(depth),
        })
    }
}

/// Resources visible to a fragment program
pub(crate) struct FragmentResources<'a> {
    pub combined: Option<(&'a Image, SamplerDesc)>,
    pub textures: [Option<&'a Image>; 4],
    pub samplers: [Option<SamplerDesc>; 2],
    pub ps_cb: PsConstantBuffer,
    pub push: &'a [u8],
}

fn address(c: i64, size: u32, mode: AddressMode) -> Option<u32> {
    let size = size.max(1) as i64;
    match mode {
        AddressMode::Repeat => Some(c.rem_euclid(size) as u32),
        AddressMode::ClampToEdge => Some(c.clamp(0, size - 1) as u32),
        AddressMode::ClampToBorder => (0..size).contains(&c).then_some(c as u32),
    }
}

fn fetch_addressed(image: &Image, sampler: &SamplerDesc, x: i64, y: i64) -> [f64; 4] {
    let (w, h) = image.level_size(0);
    match (
        address(x, w, sampler.address_u),
        address(y, h, sampler.address_v),
    ) {
        (Some(x), Some(y)) => image.texel(0, x, y),
        _ => [0.0; 4],
    }
}

/// Filtered sample at normalized coordinates (base level)
pub(crate) fn sample(image: &Image, sampler: &SamplerDesc, u: f64, v: f64) -> [f64; 4] {
    let (w, h) = image.level_size(0);
    let fx = u * w as f64;
    let fy = v * h as f64;

    match sampler.mag_filter {
        Filter::Nearest => fetch_addressed(image, sampler, fx.floor() as i64, fy.floor() as i64),
        Filter::Linear => {
            let sx = fx - 0.5;
            let sy = fy - 0.5;
            let x0 = sx.floor();
            let y0 = sy.floor();
            let tx = sx - x0;
            let ty = sy - y0;
            let (x0, y0) = (x0 as i64, y0 as i64);

            let c00 = fetch_addressed(image, sampler, x0, y0);
            let c10 = fetch_addressed(image, sampler, x0 + 1, y0);
            let c01 = fetch_addressed(image, sampler, x0, y0 + 1);
            let c11 = fetch_addressed(image, sampler, x0 + 1, y0 + 1);

            let mut out = [0.0; 4];
            for i in 0..4 {
                let top = c00[i] + (c10[i] - c00[i]) * tx;
                let bottom = c01[i] + (c11[i] - c01[i]) * tx;
                out[i] = top + (bottom - top) * ty;
            }
            out
        }
    }
}

fn to_byte(v: f64) -> f64 {
    (v.clamp(0.0, 1.0) * 255.0).round()
}

fn bytes_to_norm(r: u32, g: u32, b: u32, a: u32) -> [f64; 4] {
    [
        r as f64 / 255.0,
        g as f64 / 255.0,
        b as f64 / 255.0,
        a as f64 / 255.0,
    ]
}

/// Apply a CRT-style channel mask
fn crt_mask(c: [f64; 4], i: usize) -> [f64; 4] {
    const MASK: [[f64; 3]; 4] = [
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 1.0, 1.0],
    ];
    let m = MASK[i % 4];
    [
        c[0] * (m[0] + 0.5).min(1.0),
        c[1] * (m[1] + 0.5).min(1.0),
        c[2] * (m[2] + 0.5).min(1.0),
        c[3],
    ]
}

fn scanline(c: [f64; 4], row: i64) -> [f64; 4] {
    if row.rem_euclid(2) == 0 {
        [c[0], c[1], c[2], c[3] * 0.5]
    } else {
        [c[0] * 0.5, c[1] * 0.5, c[2] * 0.5, c[3] * 0.5]
    }
}

fn sample_combined(input: &FsIn, res: &FragmentResources<'_>) -> [f64; 4] {
    match res.combined {
        Some((image, sampler)) => sample(image, &sampler, input.tex[0], input.tex[1]),
        None => [0.0; 4],
    }
}

pub(crate) fn run_convert(
    shader: ShaderConvert,
    input: &FsIn,
    res: &FragmentResources<'_>,
) -> Option<FsOut> {
    let c = sample_combined(input, res);
    let px = input.coord[0].floor() as i64;
    let py = input.coord[1].floor() as i64;
    let bytes = || {
        (
            to_byte(c[0]) as u32,
            to_byte(c[1]) as u32,
            to_byte(c[2]) as u32,
            to_byte(c[3]) as u32,
        )
    };

    match shader {
        ShaderConvert::Copy => FsOut::color(c),
        ShaderConvert::Rgba8To16Bits => {
            let (r, g, b, a) = bytes();
            let v = (r >> 3) | ((g >> 3) << 5) | ((b >> 3) << 10) | if a >= 0x80 { 0x8000 } else { 0 };
            FsOut::color([v as f64, 0.0, 0.0, 0.0])
        }
        ShaderConvert::Datm1 => {
            if c[3] < 127.5 / 255.0 {
                None
            } else {
                FsOut::color([0.0; 4])
            }
        }
        ShaderConvert::Datm0 => {
            if 127.5 / 255.0 < c[3] {
                None
            } else {
                FsOut::color([0.0; 4])
            }
        }
        ShaderConvert::Scanline => FsOut::color(scanline(c, py)),
        ShaderConvert::DiagonalFilter => FsOut::color(crt_mask(c, (px + py).rem_euclid(4) as usize)),
        ShaderConvert::TransparencyFilter => {
            let luma = c[0] * 0.299 + c[1] * 0.587 + c[2] * 0.114;
            FsOut::color([c[0], c[1], c[2], luma])
        }
        ShaderConvert::TriangularFilter => {
            let i = (px + 2 * ((py >> 1) & 1)).rem_euclid(4) as usize;
            FsOut::color(crt_mask(c, i))
        }
        ShaderConvert::ComplexFilter => {
            let masked = crt_mask(c, px.rem_euclid(3) as usize);
            FsOut::color(scanline(masked, py))
        }
        ShaderConvert::Float32To32Bits => {
            let v = (c[0] * TWO_POW_32).clamp(0.0, u32::MAX as f64).floor();
            FsOut::color([v, 0.0, 0.0, 0.0])
        }
        ShaderConvert::Float32ToRgba8 => {
            let v = (c[0] * TWO_POW_32).clamp(0.0, u32::MAX as f64) as u32;
            FsOut::color(bytes_to_norm(v & 0xFF, (v >> 8) & 0xFF, (v >> 16) & 0xFF, v >> 24))
        }
        ShaderConvert::Float16ToRgb5a1 => {
            let v = ((c[0] * TWO_POW_32).clamp(0.0, u32::MAX as f64) as u32) & 0xFFFF;
            FsOut::color(bytes_to_norm(
                (v & 0x1F) << 3,
                ((v >> 5) & 0x1F) << 3,
                ((v >> 10) & 0x1F) << 3,
                if v & 0x8000 != 0 { 0x80 } else { 0 },
            ))
        }
        ShaderConvert::Rgba8ToFloat32 => {
            let (r, g, b, a) = bytes();
            FsOut::depth((r | (g << 8) | (b << 16) | (a << 24)) as f64 / TWO_POW_32)
        }
        ShaderConvert::Rgba8ToFloat24 => {
            let (r, g, b, _) = bytes();
            FsOut::depth((r | (g << 8) | (b << 16)) as f64 / TWO_POW_32)
        }
        ShaderConvert::Rgba8ToFloat16 => {
            let (r, g, _, _) = bytes();
            FsOut::depth((r | (g << 8)) as f64 / TWO_POW_32)
        }
        ShaderConvert::Rgb5a1ToFloat16 => {
            let (r, g, b, a) = bytes();
            let v = (r >> 3) | ((g >> 3) << 5) | ((b >> 3) << 10) | if a >= 0x80 { 0x8000 } else { 0 };
            FsOut::depth(v as f64 / TWO_POW_32)
        }
        ShaderConvert::RgbaTo8i => {
            let (r, _, _, _) = bytes();
            FsOut::color([r as f64, 0.0, 0.0, 0.0])
        }
        ShaderConvert::Yuv => {
            let y = 0.299 * c[0] + 0.587 * c[1] + 0.114 * c[2];
            let u = -0.168_736 * c[0] - 0.331_264 * c[1] + 0.5 * c[2] + 0.5;
            let v = 0.5 * c[0] - 0.418_688 * c[1] - 0.081_312 * c[2] + 0.5;
            FsOut::color([y, u, v, c[3]])
        }
    }
}

pub(crate) fn run_merge(entry: u32, input: &FsIn, res: &FragmentResources<'_>) -> Option<FsOut> {
    let mut c = sample_combined(input, res);
    if entry == 0 {
        c[3] = (c[3] * 2.0).min(1.0);
    } else {
        let cb: MergeConstants = read_push(res.push);
        c[3] = cb.bg_color[3] as f64;
    }
    FsOut::color(c)
}

pub(crate) fn run_interlace(
    entry: u32,
    input: &FsIn,
    res: &FragmentResources<'_>,
) -> Option<FsOut> {
    let cb: InterlaceConstants = read_push(res.push);
    match entry {
        0 => {
            let field = input.tex[1] * cb.h_h as f64;
            if field.fract() - 0.5 < 0.0 {
                return None;
            }
            FsOut::color(sample_combined(input, res))
        }
        2 => {
            let Some((image, sampler)) = res.combined else {
                return FsOut::color([0.0; 4]);
            };
            let (u, v) = (input.tex[0], input.tex[1]);
            let dv = cb.zr_h[1] as f64;
            let c0 = sample(image, &sampler, u, v - dv);
            let c1 = sample(image, &sampler, u, v);
            let c2 = sample(image, &sampler, u, v + dv);
            let mut out = [0.0; 4];
            for i in 0..4 {
                out[i] = (c0[i] + c1[i] * 2.0 + c2[i]) / 4.0;
            }
            FsOut::color(out)
        }
        _ => FsOut::color(sample_combined(input, res)),
    }
}

fn read_push<T: bytemuck::Pod + Default>(push: &[u8]) -> T {
    let size = std::mem::size_of::<T>();
    if push.len() >= size {
        bytemuck::pod_read_unaligned(&push[..size])
    } else {
        T::default()
    }
}

/// Apply a wrap mode that the sampler can't express
fn wrap_region(coord: f64, mode: i64, size: f64, lo: f32, hi: f32) -> f64 {
    match mode {
        2 => coord.clamp(lo as f64, hi as f64),
        3 => {
            let texel = (coord * size).floor().max(0.0) as u32;
            let wrapped = (texel & lo as u32) | hi as u32;
            (wrapped as f64 + 0.5) / size
        }
        _ => coord,
    }
}

/// Reinterpret a depth sample as a GS color
fn depth_to_color(depth: f64, depth_fmt: i64) -> [f64; 4] {
    let z = (depth * TWO_POW_32).clamp(0.0, u32::MAX as f64) as u32;
    let (r, g, b, a) = match depth_fmt {
        1 => (z & 0xFF, (z >> 8) & 0xFF, (z >> 16) & 0xFF, z >> 24),
        2 => (z & 0xFF, (z >> 8) & 0xFF, (z >> 16) & 0xFF, 0x80),
        _ => (
            (z & 0x1F) << 3,
            ((z >> 5) & 0x1F) << 3,
            ((z >> 10) & 0x1F) << 3,
            if z & 0x8000 != 0 { 0x80 } else { 0 },
        ),
    };
    [r as f64, g as f64, b as f64, a as f64]
}

pub(crate) fn run_tfx_ps(
    cfg: &TfxPsConfig,
    input: &FsIn,
    res: &FragmentResources<'_>,
) -> Option<FsOut> {
    let cb = &res.ps_cb;
    let vc = input.color;
    let ta0 = cb.ta_afix_max_depth[0] as f64;
    let ta1 = cb.ta_afix_max_depth[1] as f64;
    let afix = cb.ta_afix_max_depth[2] as f64;

    let texture = res.textures[0].filter(|_| cfg.tfx != 4 && !cfg.invalid_tex0);

    let (mut rgb, mut a) = match texture {
        Some(image) => {
            let q = if cfg.fst || input.tex[2] == 0.0 {
                1.0
            } else {
                input.tex[2]
            };
            let (tw, th) = image.level_size(0);
            let (tw, th) = (tw as f64, th as f64);
            let mut u = wrap_region(input.tex[0] / q, cfg.wms, tw, cb.min_max[0], cb.min_max[2]);
            let mut v = wrap_region(input.tex[1] / q, cfg.wmt, th, cb.min_max[1], cb.min_max[3]);
            if cfg.point_sampler {
                u = ((u * tw).floor() + 0.5) / tw;
                v = ((v * th).floor() + 0.5) / th;
            }

            let sampler = res.samplers[0].unwrap_or_else(|| {
                let filter = if cfg.ltf { Filter::Linear } else { Filter::Nearest };
                SamplerDesc::simple(filter, AddressMode::Repeat)
            });
            let raw = sample(image, &sampler, u, v);

            let mut t = if cfg.depth_fmt > 0 {
                depth_to_color(raw[0], cfg.depth_fmt)
            } else {
                [raw[0] * 255.0, raw[1] * 255.0, raw[2] * 255.0, raw[3] * 255.0]
            };

            let black = t[0] == 0.0 && t[1] == 0.0 && t[2] == 0.0;
            match cfg.fmt {
                1 => t[3] = if cfg.aem && black { 0.0 } else { ta0 },
                2 => {
                    t[3] = if t[3] >= 128.0 {
                        ta1
                    } else if cfg.aem && black {
                        0.0
                    } else {
                        ta0
                    }
                }
                _ => {}
            }

            if cfg.channel != 0 {
                let ch = match cfg.channel {
                    1 => t[0],
                    2 => t[1],
                    3 => t[2],
                    _ => t[3],
                };
                t = [ch; 4];
            }
            if cfg.shuffle {
                t = if cfg.read_ba {
                    [t[2], t[3], t[2], t[3]]
                } else {
                    [t[0], t[1], t[0], t[1]]
                };
            }

            let modulate = |i: usize| (t[i] * vc[i] / 128.0).floor();
            match cfg.tfx {
                0 => (
                    [modulate(0), modulate(1), modulate(2)],
                    if cfg.tcc { modulate(3) } else { vc[3] },
                ),
                1 => ([t[0], t[1], t[2]], if cfg.tcc { t[3] } else { vc[3] }),
                2 => (
                    [
                        modulate(0) + vc[3],
                        modulate(1) + vc[3],
                        modulate(2) + vc[3],
                    ],
                    if cfg.tcc { t[3] + vc[3] } else { vc[3] },
                ),
                _ => (
                    [
                        modulate(0) + vc[3],
                        modulate(1) + vc[3],
                        modulate(2) + vc[3],
                    ],
                    if cfg.tcc { t[3] } else { vc[3] },
                ),
            }
        }
        None => ([vc[0], vc[1], vc[2]], vc[3]),
    };

    if !cfg.hdr && !cfg.colclip {
        for c in rgb.iter_mut() {
            *c = c.min(255.0);
        }
    }
    a = a.min(255.0);

    if cfg.clr1 {
        rgb = [255.0; 3];
    }

    if cfg.fog {
        let f = input.fog;
        for (i, c) in rgb.iter_mut().enumerate() {
            let fog = cb.fog_color_aref[i] as f64;
            *c = ((*c * f + fog * (255.0 - f)) / 256.0).floor();
        }
    }

    let aref = cb.fog_color_aref[3] as f64;
    let pass = match cfg.atst {
        1 => a <= aref,
        2 => a >= aref,
        3 => a == aref,
        4 => a != aref,
        _ => true,
    };
    if !pass {
        return None;
    }

    let mut src1_alpha = a / 128.0;
    let skip_blend = cfg.pabe && a < 128.0;
    if skip_blend {
        src1_alpha = 1.0;
    } else if cfg.blend_mix != 0 {
        let factor = match cfg.blend_c {
            0 => a / 128.0,
            2 => afix / 128.0,
            _ => 1.0,
        };
        let scale = if cfg.blend_mix == 1 { factor } else { 1.0 + factor };
        for c in rgb.iter_mut() {
            *c = (*c * scale).floor();
        }
    }

    if cfg.colclip {
        for c in rgb.iter_mut() {
            *c = c.rem_euclid(256.0);
        }
    }

    if cfg.dither > 0 && cfg.dfmt == 2 {
        let scale = if cfg.dither == 1 { cfg.scale_factor as f64 } else { 1.0 };
        let x = (input.coord[0] / scale).floor() as i64;
        let y = (input.coord[1] / scale).floor() as i64;
        let d = DITHER_MATRIX[y.rem_euclid(4) as usize][x.rem_euclid(4) as usize];
        for c in rgb.iter_mut() {
            *c = (*c + d).clamp(0.0, 255.0);
        }
    }

    if cfg.dfmt == 2 {
        for c in rgb.iter_mut() {
            *c = (*c / 8.0).floor() * 8.0;
        }
        a = if a >= 128.0 { 128.0 } else { 0.0 };
    }
    if cfg.fba {
        a = if a >= 128.0 { a } else { a + 128.0 };
    }

    let color = [rgb[0] / 255.0, rgb[1] / 255.0, rgb[2] / 255.0, a / 255.0];
    let depth = cfg
        .zclamp
        .then(|| input.depth.min(cb.ta_afix_max_depth[3] as f64));

    Some(FsOut {
        color,
        src1_alpha,
        depth,
    })
}

pub(crate) fn run_fragment(
    shader: &CompiledShader,
    input: &FsIn,
    res: &FragmentResources<'_>,
) -> Option<FsOut> {
    match shader {
        CompiledShader::Convert(s) => run_convert(*s, input, res),
        CompiledShader::Merge(e) => run_merge(*e, input, res),
        CompiledShader::Interlace(e) => run_interlace(*e, input, res),
        CompiledShader::TfxFragment(cfg) => run_tfx_ps(cfg, input, res),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defines() {
        let src = "#version 460 core\n#define FRAGMENT_SHADER 1\n#define PS_TFX 2\n#define ps_main9 main\nvoid ps_main9() {}\n";
        let (defines, entry) = parse_defines(src);
        assert_eq!(defines.get("PS_TFX"), Some(&2));
        assert_eq!(defines.get("FRAGMENT_SHADER"), Some(&1));
        assert_eq!(entry, Some(9));
    }

    #[test]
    fn test_compile_convert_entry() {
        let shader = compile(
            ShaderStage::Fragment,
            ShaderProgram::Convert,
            "#define ps_main1 main\n",
        )
        .unwrap();
        assert_eq!(shader, CompiledShader::Convert(ShaderConvert::Rgba8To16Bits));

        assert!(compile(ShaderStage::Fragment, ShaderProgram::Convert, "").is_err());
        assert!(compile(ShaderStage::Geometry, ShaderProgram::Merge, "").is_err());
    }

    #[test]
    fn test_tfx_defines_reach_config() {
        let src = "#define PS_TFX 1\n#define PS_ATST 3\n#define PS_FBA 1\n";
        let CompiledShader::TfxFragment(cfg) =
            compile(ShaderStage::Fragment, ShaderProgram::Tfx, src).unwrap()
        else {
            panic!("expected fragment program");
        };
        assert_eq!(cfg.tfx, 1);
        assert_eq!(cfg.atst, 3);
        assert!(cfg.fba);
        assert_eq!(cfg.scale_factor, 1);
    }

    #[test]
    fn test_untextured_tfx_alpha_test() {
        let cfg = TfxPsConfig {
            tfx: 4,
            atst: 2,
            ..Default::default()
        };
        let mut cb = PsConstantBuffer::default();
        cb.fog_color_aref[3] = 0x40 as f32;
        let res = FragmentResources {
            combined: None,
            textures: [None; 4],
            samplers: [None; 2],
            ps_cb: cb,
            push: &[],
        };
        let mut input = FsIn {
            color: [255.0, 0.0, 0.0, 0x80 as f64],
            ..Default::default()
        };
        let out = run_tfx_ps(&cfg, &input, &res).unwrap();
        assert_eq!(out.color[0], 1.0);
        assert_eq!(out.src1_alpha, 1.0);

        input.color[3] = 0x20 as f64;
        assert!(run_tfx_ps(&cfg, &input, &res).is_none());
    }
}
