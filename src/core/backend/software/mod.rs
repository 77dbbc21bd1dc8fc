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

//! CPU implementation of [`GpuBackend`]
//!
//! Commands are recorded into a command list and executed on CPU memory when
//! the command buffer retires, not when it is recorded. This keeps the
//! asynchronous behaviour of a real GPU observable: data written into a mapped
//! buffer after recording but before retirement is what the "GPU" sees.
//!
//! # Retirement
//!
//! [`SoftwareConfig::gpu_latency`] controls when submitted command buffers
//! execute:
//!
//! - `Some(0)`: at submission (fences complete immediately)
//! - `Some(n)`: once more than `n` command buffers are in flight
//! - `None`: only on [`SoftwareBackend::retire_one`] or a fence wait
//!
//! # Validation
//!
//! Every layout passed to a command is checked against the layout the image
//! was last transitioned to, transfers inside a render pass are rejected and
//! images used after destruction are reported. Problems are logged and
//! collected in [`SoftwareBackend::validation_errors`]; the offending command
//! is still recorded.
//!
//! # Texel Storage
//!
//! Images hold `[f64; 4]` texels. Depth formats keep depth in channel 0 and
//! stencil in channel 1. Writes are quantized to the image format.

mod program;
mod raster;

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use super::{
    BackendLimits, BufferId, BufferImageCopy, BufferUsage, ClearAspects, ClearValue,
    DescriptorSetId, DescriptorSetLayoutKind, DescriptorWrite, FenceValue, Filter, Format,
    FramebufferId, GpuBackend, GraphicsPipelineDesc, ImageCopy, ImageDesc, ImageId, ImageLayout,
    LoadOp, PipelineId, PipelineLayoutKind, RenderPassId, RenderPassKey, SamplerDesc, SamplerId,
    ShaderModuleDesc, ShaderModuleId, ShaderStage, SwapChainInfo, Viewport, WindowInfo,
};
use crate::core::config::RendererSettings;
use crate::core::error::{GsError, Result};
use crate::core::types::Rect;

use program::CompiledShader;

/// Tunables and injected failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareConfig {
    /// Command buffers allowed in flight before the oldest retires
    pub gpu_latency: Option<usize>,
    pub max_image_dimension: u32,
    /// Descriptor sets available per command buffer
    pub descriptor_pool_capacity: u32,
    /// Reject shader modules whose source contains this text
    pub fail_shader_containing: Option<String>,
    pub min_uniform_buffer_offset_alignment: u32,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            gpu_latency: Some(0),
            max_image_dimension: 8192,
            descriptor_pool_capacity: 4096,
            fail_shader_containing: None,
            min_uniform_buffer_offset_alignment: 256,
        }
    }
}

impl SoftwareConfig {
    /// Backend tunables derived from renderer settings
    pub fn from_settings(settings: &RendererSettings) -> Self {
        Self {
            descriptor_pool_capacity: settings.buffers.descriptor_pool_capacity,
            ..Self::default()
        }
    }
}

/// Per-call counters, recorded at command recording time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommandStats {
    pub barriers: u64,
    pub render_passes: u64,
    pub pipeline_binds: u64,
    pub vertex_buffer_binds: u64,
    pub index_buffer_binds: u64,
    pub descriptor_set_binds: u64,
    pub push_constants: u64,
    pub viewport_sets: u64,
    pub scissor_sets: u64,
    pub blend_constant_sets: u64,
    pub draws: u64,
    pub clears: u64,
    pub copies: u64,
    pub blits: u64,
    pub descriptor_sets_allocated: u64,
    pub submits: u64,
    pub waits: u64,
    pub presents: u64,
}

impl CommandStats {
    /// Sum of every state bind counter
    pub fn total_binds(&self) -> u64 {
        self.pipeline_binds
            + self.vertex_buffer_binds
            + self.index_buffer_binds
            + self.descriptor_set_binds
            + self.viewport_sets
            + self.scissor_sets
            + self.blend_constant_sets
    }
}

pub(crate) struct Image {
    desc: ImageDesc,
    levels: Vec<Vec<[f64; 4]>>,
    /// Layout after the last recorded barrier
    recorded_layout: ImageLayout,
}

impl Image {
    fn new(desc: ImageDesc) -> Self {
        let levels = (0..desc.levels.max(1))
            .map(|level| {
                let w = (desc.width >> level).max(1) as usize;
                let h = (desc.height >> level).max(1) as usize;
                vec![[0.0; 4]; w * h]
            })
            .collect();
        Self {
            desc,
            levels,
            recorded_layout: ImageLayout::Undefined,
        }
    }

    pub(crate) fn format(&self) -> Format {
        self.desc.format
    }

    pub(crate) fn level_size(&self, level: u32) -> (u32, u32) {
        (
            (self.desc.width >> level).max(1),
            (self.desc.height >> level).max(1),
        )
    }

    /// Texel at clamped coordinates
    pub(crate) fn texel(&self, level: u32, x: u32, y: u32) -> [f64; 4] {
        let level = (level as usize).min(self.levels.len() - 1);
        let (w, h) = self.level_size(level as u32);
        let x = x.min(w - 1) as usize;
        let y = y.min(h - 1) as usize;
        self.levels[level][y * w as usize + x]
    }

    pub(crate) fn set_texel(&mut self, level: u32, x: u32, y: u32, value: [f64; 4]) {
        let (w, h) = self.level_size(level);
        if x >= w || y >= h || level as usize >= self.levels.len() {
            return;
        }
        let q = quantize(self.desc.format, value);
        self.levels[level as usize][(y * w + x) as usize] = q;
    }

    fn fill(&mut self, level: u32, rect: Rect, f: impl Fn([f64; 4]) -> [f64; 4]) {
        let (w, h) = self.level_size(level);
        let r = rect.intersect(&Rect::from_size(w, h));
        for y in r.top..r.bottom {
            for x in r.left..r.right {
                let t = self.texel(level, x as u32, y as u32);
                self.set_texel(level, x as u32, y as u32, f(t));
            }
        }
    }
}

/// Round a value to what the format can store
pub(crate) fn quantize(format: Format, v: [f64; 4]) -> [f64; 4] {
    let unorm = |c: f64| (c.clamp(0.0, 1.0) * 255.0).round() / 255.0;
    let uint = |c: f64, max: f64| c.clamp(0.0, max).floor();
    match format {
        Format::Rgba8Unorm | Format::Bgra8Unorm => [unorm(v[0]), unorm(v[1]), unorm(v[2]), unorm(v[3])],
        Format::Rgba32Float => [
            v[0] as f32 as f64,
            v[1] as f32 as f64,
            v[2] as f32 as f64,
            v[3] as f32 as f64,
        ],
        Format::R8Uint => [uint(v[0], 255.0), 0.0, 0.0, 0.0],
        Format::R16Uint => [uint(v[0], 65535.0), 0.0, 0.0, 0.0],
        Format::R32Uint => [uint(v[0], u32::MAX as f64), 0.0, 0.0, 0.0],
        Format::D32FloatS8Uint => [v[0].clamp(0.0, 1.0), uint(v[1], 255.0), 0.0, 0.0],
    }
}

fn encode_texel(format: Format, t: [f64; 4], out: &mut [u8]) {
    let byte = |c: f64| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    match format {
        Format::Rgba8Unorm => out[..4].copy_from_slice(&[byte(t[0]), byte(t[1]), byte(t[2]), byte(t[3])]),
        Format::Bgra8Unorm => out[..4].copy_from_slice(&[byte(t[2]), byte(t[1]), byte(t[0]), byte(t[3])]),
        Format::Rgba32Float => {
            for (i, c) in t.iter().enumerate() {
                out[i * 4..i * 4 + 4].copy_from_slice(&(*c as f32).to_le_bytes());
            }
        }
        Format::R8Uint => out[0] = t[0] as u8,
        Format::R16Uint => out[..2].copy_from_slice(&(t[0] as u16).to_le_bytes()),
        Format::R32Uint => out[..4].copy_from_slice(&(t[0] as u32).to_le_bytes()),
        Format::D32FloatS8Uint => out[..4].copy_from_slice(&(t[0] as f32).to_le_bytes()),
    }
}

fn decode_texel(format: Format, b: &[u8]) -> [f64; 4] {
    let norm = |c: u8| c as f64 / 255.0;
    let f32_at = |i: usize| f32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]) as f64;
    match format {
        Format::Rgba8Unorm => [norm(b[0]), norm(b[1]), norm(b[2]), norm(b[3])],
        Format::Bgra8Unorm => [norm(b[2]), norm(b[1]), norm(b[0]), norm(b[3])],
        Format::Rgba32Float => [f32_at(0), f32_at(4), f32_at(8), f32_at(12)],
        Format::R8Uint => [b[0] as f64, 0.0, 0.0, 0.0],
        Format::R16Uint => [u16::from_le_bytes([b[0], b[1]]) as f64, 0.0, 0.0, 0.0],
        Format::R32Uint => [
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            0.0,
            0.0,
            0.0,
        ],
        Format::D32FloatS8Uint => [f32_at(0), 0.0, 0.0, 0.0],
    }
}

struct Buffer {
    data: Vec<u8>,
}

pub(crate) struct Pipeline {
    desc: GraphicsPipelineDesc,
    pass: RenderPassKey,
    vertex: CompiledShader,
    geometry: Option<CompiledShader>,
    fragment: Option<CompiledShader>,
}

struct Framebuffer {
    render_pass: RenderPassKey,
    color: Option<ImageId>,
    depth: Option<ImageId>,
}

pub(crate) struct DescriptorSet {
    layout: DescriptorSetLayoutKind,
    writes: Vec<DescriptorWrite>,
}

struct SwapChain {
    info: SwapChainInfo,
    images: [ImageId; 2],
    next: usize,
}

#[derive(Debug, Clone)]
enum Command {
    Barrier,
    BeginRenderPass {
        framebuffer: FramebufferId,
        /// Pass the framebuffer was begun with; supplies the load ops
        key: Option<RenderPassKey>,
        area: Rect,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass,
    BindPipeline(PipelineId),
    BindVertexBuffer(BufferId, u64),
    BindIndexBuffer(BufferId, u64),
    BindDescriptorSets {
        first: u32,
        sets: Vec<DescriptorSetId>,
        dynamic_offsets: Vec<u32>,
    },
    PushConstants(Vec<u8>),
    SetViewport(Viewport),
    SetScissor(Rect),
    SetBlendConstants([f32; 4]),
    Draw(raster::DrawCall),
    ClearColor {
        image: ImageId,
        color: [f32; 4],
    },
    ClearDepthStencil {
        image: ImageId,
        depth: f32,
        stencil: u32,
        aspects: ClearAspects,
    },
    CopyImage {
        src: ImageId,
        dst: ImageId,
        regions: Vec<ImageCopy>,
    },
    BlitImage {
        src: ImageId,
        src_rect: Rect,
        dst: ImageId,
        dst_rect: Rect,
        filter: Filter,
    },
    CopyBufferToImage {
        buffer: BufferId,
        image: ImageId,
        region: BufferImageCopy,
    },
    CopyImageToBuffer {
        image: ImageId,
        buffer: BufferId,
        region: BufferImageCopy,
    },
}

struct InFlight {
    fence: FenceValue,
    commands: Vec<Command>,
    transient_sets: Vec<DescriptorSetId>,
}

/// Binding state while recording
#[derive(Default)]
struct RecordState {
    pass: Option<FramebufferId>,
    pipeline: Option<PipelineId>,
    sets: [Option<DescriptorSetId>; 3],
}

/// Binding state while executing
#[derive(Default)]
pub(crate) struct ExecState {
    framebuffer: Option<FramebufferId>,
    area: Rect,
    pipeline: Option<PipelineId>,
    vertex_buffer: Option<(BufferId, u64)>,
    index_buffer: Option<(BufferId, u64)>,
    sets: [Option<DescriptorSetId>; 3],
    dynamic_offsets: [Vec<u32>; 3],
    push_constants: Vec<u8>,
    viewport: Option<Viewport>,
    scissor: Option<Rect>,
    blend_constants: [f32; 4],
}

/// Software rasterizing backend
pub struct SoftwareBackend {
    config: SoftwareConfig,
    next_id: u32,

    images: HashMap<ImageId, Image>,
    buffers: HashMap<BufferId, Buffer>,
    samplers: HashMap<SamplerId, SamplerDesc>,
    shaders: HashMap<ShaderModuleId, (ShaderStage, CompiledShader)>,
    pipelines: HashMap<PipelineId, Pipeline>,
    render_passes: HashMap<RenderPassKey, RenderPassId>,
    render_pass_keys: HashMap<RenderPassId, RenderPassKey>,
    framebuffers: HashMap<FramebufferId, Framebuffer>,
    descriptor_sets: HashMap<DescriptorSetId, DescriptorSet>,

    recording: Vec<Command>,
    record: RecordState,
    transient_sets: Vec<DescriptorSetId>,
    pool_used: u32,

    in_flight: VecDeque<InFlight>,
    current_fence: FenceValue,
    completed_fence: FenceValue,

    swap_chain: Option<SwapChain>,
    last_presented: Option<ImageId>,

    stats: CommandStats,
    validation_errors: Vec<String>,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_config(SoftwareConfig::default())
    }

    pub fn with_config(config: SoftwareConfig) -> Self {
        log::info!(
            "Software GPU backend: latency {:?}, {} descriptor sets per command buffer",
            config.gpu_latency,
            config.descriptor_pool_capacity
        );
        Self {
            config,
            next_id: 1,
            images: HashMap::new(),
            buffers: HashMap::new(),
            samplers: HashMap::new(),
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            render_passes: HashMap::new(),
            render_pass_keys: HashMap::new(),
            framebuffers: HashMap::new(),
            descriptor_sets: HashMap::new(),
            recording: Vec::new(),
            record: RecordState::default(),
            transient_sets: Vec::new(),
            pool_used: 0,
            in_flight: VecDeque::new(),
            current_fence: 1,
            completed_fence: 0,
            swap_chain: None,
            last_presented: None,
            stats: CommandStats::default(),
            validation_errors: Vec::new(),
        }
    }

    pub fn config(&self) -> &SoftwareConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SoftwareConfig {
        &mut self.config
    }

    pub fn stats(&self) -> CommandStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = CommandStats::default();
    }

    pub fn validation_errors(&self) -> &[String] {
        &self.validation_errors
    }

    pub fn take_validation_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.validation_errors)
    }

    /// Recorded layout of an image
    pub fn image_layout(&self, image: ImageId) -> Option<ImageLayout> {
        self.images.get(&image).map(|i| i.recorded_layout)
    }

    pub fn is_image_alive(&self, image: ImageId) -> bool {
        self.images.contains_key(&image)
    }

    pub fn live_image_count(&self) -> usize {
        self.images.len()
    }

    pub fn live_framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Descriptor sets allocated from the current command buffer's pool
    pub fn descriptor_pool_usage(&self) -> u32 {
        self.pool_used
    }

    pub fn swap_chain_info(&self) -> Option<SwapChainInfo> {
        self.swap_chain.as_ref().map(|sc| sc.info)
    }

    pub fn last_presented(&self) -> Option<ImageId> {
        self.last_presented
    }

    /// Current contents of an image's base level as RGBA8 bytes
    ///
    /// Reflects only retired command buffers.
    pub fn read_image_rgba8(&self, image: ImageId) -> Option<Vec<u8>> {
        let img = self.images.get(&image)?;
        let (w, h) = img.level_size(0);
        let mut out = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                let t = img.texel(0, x, y);
                let t = if img.format().is_depth() {
                    [t[0], t[0], t[0], 1.0]
                } else {
                    t
                };
                let mut px = [0u8; 4];
                encode_texel(Format::Rgba8Unorm, t, &mut px);
                out.extend_from_slice(&px);
            }
        }
        Some(out)
    }

    /// Execute the oldest in-flight command buffer
    pub fn retire_one(&mut self) -> bool {
        let Some(cb) = self.in_flight.pop_front() else {
            return false;
        };
        log::trace!(
            "Retiring command buffer {} ({} commands)",
            cb.fence,
            cb.commands.len()
        );
        self.execute(cb.commands);
        for set in cb.transient_sets {
            self.descriptor_sets.remove(&set);
        }
        self.completed_fence = cb.fence;
        true
    }

    pub fn retire_all(&mut self) {
        while self.retire_one() {}
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn validation_error(&mut self, message: String) {
        log::error!("GPU validation: {}", message);
        self.validation_errors.push(message);
    }

    fn check_layout(&mut self, op: &str, image: ImageId, claimed: ImageLayout, allowed: &[ImageLayout]) {
        let Some(actual) = self.images.get(&image).map(|i| i.recorded_layout) else {
            self.validation_error(format!("{}: image {} does not exist", op, image.0));
            return;
        };
        if actual != claimed {
            self.validation_error(format!(
                "{}: image {} is in {:?}, command claims {:?}",
                op, image.0, actual, claimed
            ));
        }
        if !allowed.contains(&claimed) {
            self.validation_error(format!(
                "{}: image {} layout {:?} not valid for this command",
                op, image.0, claimed
            ));
        }
    }

    fn check_outside_pass(&mut self, op: &str) {
        if self.record.pass.is_some() {
            self.validation_error(format!("{} recorded inside a render pass", op));
        }
    }

    fn descriptor_images(&self, set: DescriptorSetId) -> Vec<ImageId> {
        self.descriptor_sets
            .get(&set)
            .map(|s| {
                s.writes
                    .iter()
                    .filter_map(|w| match w {
                        DescriptorWrite::SampledImage { image, .. }
                        | DescriptorWrite::CombinedImageSampler { image, .. } => Some(*image),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn validate_draw(&mut self) {
        if self.record.pass.is_none() {
            self.validation_error("draw recorded outside a render pass".to_string());
        }
        let Some(pipeline) = self.record.pipeline else {
            self.validation_error("draw recorded without a pipeline".to_string());
            return;
        };
        let mismatch = match (
            self.record.pass.and_then(|f| self.framebuffers.get(&f)),
            self.pipelines.get(&pipeline),
        ) {
            (Some(fb), Some(p)) if !fb.render_pass.is_compatible(&p.pass) => Some(format!(
                "pipeline {} built for {:?} used in pass {:?}",
                pipeline.0, p.pass, fb.render_pass
            )),
            (_, None) => Some(format!("draw with destroyed pipeline {}", pipeline.0)),
            _ => None,
        };
        if let Some(message) = mismatch {
            self.validation_error(message);
        }
        let sets: Vec<_> = self.record.sets.iter().flatten().copied().collect();
        for set in sets {
            if !self.descriptor_sets.contains_key(&set) {
                self.validation_error(format!("descriptor set {} freed while bound", set.0));
                continue;
            }
            for image in self.descriptor_images(set) {
                match self.images.get(&image).map(|i| i.recorded_layout) {
                    Some(ImageLayout::ShaderReadOnly | ImageLayout::General) => {}
                    Some(layout) => self.validation_error(format!(
                        "image {} sampled in {:?} layout",
                        image.0, layout
                    )),
                    None => {
                        self.validation_error(format!("destroyed image {} sampled", image.0))
                    }
                }
            }
        }
    }

    fn execute(&mut self, commands: Vec<Command>) {
        let mut st = ExecState::default();
        for command in commands {
            match command {
                Command::Barrier => {}
                Command::BeginRenderPass {
                    framebuffer,
                    key,
                    area,
                    clear_values,
                } => self.exec_begin_pass(&mut st, framebuffer, key, area, &clear_values),
                Command::EndRenderPass => st.framebuffer = None,
                Command::BindPipeline(p) => st.pipeline = Some(p),
                Command::BindVertexBuffer(b, o) => st.vertex_buffer = Some((b, o)),
                Command::BindIndexBuffer(b, o) => st.index_buffer = Some((b, o)),
                Command::BindDescriptorSets {
                    first,
                    sets,
                    dynamic_offsets,
                } => {
                    // Dynamic offsets are consumed in set order; only set 0 has dynamic bindings.
                    let mut offsets = dynamic_offsets.into_iter();
                    for (i, set) in sets.into_iter().enumerate() {
                        let slot = first as usize + i;
                        if slot < st.sets.len() {
                            st.sets[slot] = Some(set);
                            st.dynamic_offsets[slot] = if slot == 0 {
                                offsets.by_ref().collect()
                            } else {
                                Vec::new()
                            };
                        }
                    }
                }
                Command::PushConstants(data) => st.push_constants = data,
                Command::SetViewport(v) => st.viewport = Some(v),
                Command::SetScissor(r) => st.scissor = Some(r),
                Command::SetBlendConstants(c) => st.blend_constants = c,
                Command::Draw(call) => {
                    if let Err(message) = raster::execute_draw(self, &st, &call) {
                        self.validation_error(message);
                    }
                }
                Command::ClearColor { image, color } => match self.images.get_mut(&image) {
                    Some(img) => {
                        let c = color.map(|v| v as f64);
                        let (w, h) = img.level_size(0);
                        img.fill(0, Rect::from_size(w, h), |_| c);
                    }
                    None => self.validation_error(format!("clear of destroyed image {}", image.0)),
                },
                Command::ClearDepthStencil {
                    image,
                    depth,
                    stencil,
                    aspects,
                } => match self.images.get_mut(&image) {
                    Some(img) => {
                        let (w, h) = img.level_size(0);
                        img.fill(0, Rect::from_size(w, h), |t| {
                            [
                                if aspects.contains(ClearAspects::DEPTH) {
                                    depth as f64
                                } else {
                                    t[0]
                                },
                                if aspects.contains(ClearAspects::STENCIL) {
                                    stencil as f64
                                } else {
                                    t[1]
                                },
                                0.0,
                                0.0,
                            ]
                        });
                    }
                    None => self.validation_error(format!("clear of destroyed image {}", image.0)),
                },
                Command::CopyImage { src, dst, regions } => self.exec_copy_image(src, dst, &regions),
                Command::BlitImage {
                    src,
                    src_rect,
                    dst,
                    dst_rect,
                    filter,
                } => self.exec_blit(src, src_rect, dst, dst_rect, filter),
                Command::CopyBufferToImage {
                    buffer,
                    image,
                    region,
                } => self.exec_buffer_to_image(buffer, image, &region),
                Command::CopyImageToBuffer {
                    image,
                    buffer,
                    region,
                } => self.exec_image_to_buffer(image, buffer, &region),
            }
        }
    }

    fn exec_begin_pass(
        &mut self,
        st: &mut ExecState,
        framebuffer: FramebufferId,
        key: Option<RenderPassKey>,
        area: Rect,
        clear_values: &[ClearValue],
    ) {
        let Some(fb) = self.framebuffers.get(&framebuffer) else {
            self.validation_error(format!("render pass begun on destroyed framebuffer {}", framebuffer.0));
            return;
        };
        st.framebuffer = Some(framebuffer);
        st.area = area;

        let key = key.unwrap_or(fb.render_pass);
        let (color, depth) = (fb.color, fb.depth);
        let mut clears = clear_values.iter();

        if let Some(image) = color {
            let clear = clears.next().copied();
            if key.color_load == LoadOp::Clear {
                if let (Some(img), Some(ClearValue::Color(c))) = (self.images.get_mut(&image), clear) {
                    let c = c.map(|v| v as f64);
                    img.fill(0, area, |_| c);
                }
            }
        }
        if let Some(image) = depth {
            let clear = clears.next().copied();
            if let (Some(img), Some(ClearValue::DepthStencil(d, s))) = (self.images.get_mut(&image), clear) {
                let clear_depth = key.depth_load == LoadOp::Clear;
                let clear_stencil = key.stencil_load == LoadOp::Clear;
                if clear_depth || clear_stencil {
                    img.fill(0, area, |t| {
                        [
                            if clear_depth { d as f64 } else { t[0] },
                            if clear_stencil { s as f64 } else { t[1] },
                            0.0,
                            0.0,
                        ]
                    });
                }
            }
        }
    }

    fn exec_copy_image(&mut self, src: ImageId, dst: ImageId, regions: &[ImageCopy]) {
        for r in regions {
            let Some(src_img) = self.images.get(&src) else {
                self.validation_error(format!("copy from destroyed image {}", src.0));
                return;
            };
            let mut texels = Vec::with_capacity((r.width * r.height) as usize);
            for y in 0..r.height as i32 {
                for x in 0..r.width as i32 {
                    texels.push(src_img.texel(r.src_level, (r.src_x + x) as u32, (r.src_y + y) as u32));
                }
            }
            let Some(dst_img) = self.images.get_mut(&dst) else {
                self.validation_error(format!("copy into destroyed image {}", dst.0));
                return;
            };
            for y in 0..r.height as i32 {
                for x in 0..r.width as i32 {
                    let t = texels[(y as u32 * r.width + x as u32) as usize];
                    dst_img.set_texel(r.dst_level, (r.dst_x + x) as u32, (r.dst_y + y) as u32, t);
                }
            }
        }
    }

    fn exec_blit(&mut self, src: ImageId, src_rect: Rect, dst: ImageId, dst_rect: Rect, filter: Filter) {
        let Some(src_img) = self.images.get(&src) else {
            self.validation_error(format!("blit from destroyed image {}", src.0));
            return;
        };
        let (sw, sh) = src_img.level_size(0);
        let sampler = SamplerDesc::simple(filter, super::AddressMode::ClampToEdge);
        let mut texels = Vec::new();
        for y in dst_rect.top..dst_rect.bottom {
            for x in dst_rect.left..dst_rect.right {
                let fx = (x - dst_rect.left) as f64 + 0.5;
                let fy = (y - dst_rect.top) as f64 + 0.5;
                let u = (src_rect.left as f64 + fx * src_rect.width() as f64 / dst_rect.width() as f64) / sw as f64;
                let v = (src_rect.top as f64 + fy * src_rect.height() as f64 / dst_rect.height() as f64) / sh as f64;
                texels.push((x, y, program::sample(src_img, &sampler, u, v)));
            }
        }
        if !self.images.contains_key(&dst) {
            self.validation_error(format!("blit into destroyed image {}", dst.0));
            return;
        }
        if let Some(dst_img) = self.images.get_mut(&dst) {
            for (x, y, t) in texels {
                if x >= 0 && y >= 0 {
                    dst_img.set_texel(0, x as u32, y as u32, t);
                }
            }
        }
    }

    fn exec_buffer_to_image(&mut self, buffer: BufferId, image: ImageId, region: &BufferImageCopy) {
        if !self.buffers.contains_key(&buffer) || !self.images.contains_key(&image) {
            self.validation_error(format!("upload with destroyed buffer {} or image {}", buffer.0, image.0));
            return;
        }
        let (Some(buf), Some(img)) = (self.buffers.get(&buffer), self.images.get_mut(&image)) else {
            return;
        };
        let format = img.format();
        let texel = format.texel_size() as u64;
        let pitch = region.row_length as u64 * texel;
        let r = region.rect;
        for y in 0..r.height().max(0) as u64 {
            for x in 0..r.width().max(0) as u64 {
                let at = (region.buffer_offset + y * pitch + x * texel) as usize;
                let Some(bytes) = buf.data.get(at..at + texel as usize) else {
                    continue;
                };
                let mut t = decode_texel(format, bytes);
                if format.is_depth() {
                    t[1] = img.texel(region.level, r.left as u32 + x as u32, r.top as u32 + y as u32)[1];
                }
                img.set_texel(region.level, r.left as u32 + x as u32, r.top as u32 + y as u32, t);
            }
        }
    }

    fn exec_image_to_buffer(&mut self, image: ImageId, buffer: BufferId, region: &BufferImageCopy) {
        if !self.buffers.contains_key(&buffer) || !self.images.contains_key(&image) {
            self.validation_error(format!("readback with destroyed image {} or buffer {}", image.0, buffer.0));
            return;
        }
        let (Some(img), Some(buf)) = (self.images.get(&image), self.buffers.get_mut(&buffer)) else {
            return;
        };
        let format = img.format();
        let texel = format.texel_size() as u64;
        let pitch = region.row_length as u64 * texel;
        let r = region.rect;
        for y in 0..r.height().max(0) as u64 {
            for x in 0..r.width().max(0) as u64 {
                let at = (region.buffer_offset + y * pitch + x * texel) as usize;
                let t = img.texel(region.level, r.left as u32 + x as u32, r.top as u32 + y as u32);
                if let Some(out) = buf.data.get_mut(at..at + texel as usize) {
                    encode_texel(format, t, out);
                }
            }
        }
    }
}

impl GpuBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn limits(&self) -> BackendLimits {
        BackendLimits {
            max_image_dimension: self.config.max_image_dimension,
            max_push_constant_size: 128,
            min_uniform_buffer_offset_alignment: self.config.min_uniform_buffer_offset_alignment,
            max_anisotropy: 16,
        }
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageId> {
        let max = self.config.max_image_dimension;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(GsError::ImageCreation {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                reason: format!("dimensions outside 1..={}", max),
            });
        }
        if desc.format.is_depth() && desc.usage.contains(super::ImageUsage::COLOR_ATTACHMENT) {
            return Err(GsError::ImageCreation {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                reason: "depth format can't be a color attachment".to_string(),
            });
        }
        let id = ImageId(self.alloc_id());
        self.images.insert(id, Image::new(*desc));
        Ok(id)
    }

    fn destroy_image(&mut self, image: ImageId) {
        if self.images.remove(&image).is_none() {
            self.validation_error(format!("double destroy of image {}", image.0));
        }
    }

    fn create_buffer(&mut self, size: u64, _usage: BufferUsage) -> Result<BufferId> {
        if size == 0 || size > u32::MAX as u64 {
            return Err(GsError::BufferCreation {
                size,
                reason: "unsupported size".to_string(),
            });
        }
        let id = BufferId(self.alloc_id());
        self.buffers.insert(
            id,
            Buffer {
                data: vec![0; size as usize],
            },
        );
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
    }

    fn buffer_memory(&mut self, buffer: BufferId) -> Option<&mut [u8]> {
        self.buffers.get_mut(&buffer).map(|b| b.data.as_mut_slice())
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId> {
        let id = SamplerId(self.alloc_id());
        self.samplers.insert(id, *desc);
        Ok(id)
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        self.samplers.remove(&sampler);
    }

    fn render_pass(&mut self, key: &RenderPassKey) -> Result<RenderPassId> {
        if let Some(id) = self.render_passes.get(key) {
            return Ok(*id);
        }
        if key.color.is_none() && key.depth.is_none() {
            return Err(GsError::RenderPass("render pass without attachments".to_string()));
        }
        let id = RenderPassId(self.alloc_id());
        self.render_passes.insert(*key, id);
        self.render_pass_keys.insert(id, *key);
        Ok(id)
    }

    fn create_framebuffer(
        &mut self,
        render_pass: RenderPassId,
        color: Option<ImageId>,
        depth: Option<ImageId>,
    ) -> Result<FramebufferId> {
        let key = *self
            .render_pass_keys
            .get(&render_pass)
            .ok_or_else(|| GsError::RenderPass(format!("unknown render pass {}", render_pass.0)))?;
        let format_of = |img: Option<ImageId>| img.and_then(|i| self.images.get(&i)).map(|i| i.format());
        if format_of(color) != key.color || format_of(depth) != key.depth {
            return Err(GsError::RenderPass(format!(
                "attachments ({:?}, {:?}) don't match pass {:?}",
                format_of(color),
                format_of(depth),
                key
            )));
        }
        let id = FramebufferId(self.alloc_id());
        self.framebuffers.insert(
            id,
            Framebuffer {
                render_pass: key,
                color,
                depth,
            },
        );
        Ok(id)
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
    }

    fn create_shader_module(&mut self, desc: &ShaderModuleDesc<'_>) -> Result<ShaderModuleId> {
        if let Some(needle) = &self.config.fail_shader_containing {
            if desc.source.contains(needle.as_str()) {
                return Err(GsError::ShaderCompilation {
                    stage: desc.stage,
                    reason: format!("injected failure on '{}'", needle),
                });
            }
        }
        let compiled = program::compile(desc.stage, desc.program, desc.source)?;
        let id = ShaderModuleId(self.alloc_id());
        self.shaders.insert(id, (desc.stage, compiled));
        Ok(id)
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleId) {
        self.shaders.remove(&module);
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> Result<PipelineId> {
        let stage = |id: Option<ShaderModuleId>, want: ShaderStage| -> Result<Option<CompiledShader>> {
            match id {
                None => Ok(None),
                Some(id) => match self.shaders.get(&id) {
                    Some((s, c)) if *s == want => Ok(Some(c.clone())),
                    Some((s, _)) => Err(GsError::PipelineCreation(format!(
                        "module {} is a {:?} shader, expected {:?}",
                        id.0, s, want
                    ))),
                    None => Err(GsError::PipelineCreation(format!("unknown shader module {}", id.0))),
                },
            }
        };
        let vertex = stage(Some(desc.vertex_shader), ShaderStage::Vertex)?
            .ok_or_else(|| GsError::PipelineCreation("missing vertex shader".to_string()))?;
        let geometry = stage(desc.geometry_shader, ShaderStage::Geometry)?;
        let fragment = stage(desc.fragment_shader, ShaderStage::Fragment)?;
        let pass = *self
            .render_pass_keys
            .get(&desc.render_pass)
            .ok_or_else(|| GsError::PipelineCreation(format!("unknown render pass {}", desc.render_pass.0)))?;
        if desc.blend.enable && pass.color.is_some_and(|f| f.is_integer()) {
            return Err(GsError::PipelineCreation(format!(
                "blending enabled on integer target {:?}",
                pass.color
            )));
        }

        let id = PipelineId(self.alloc_id());
        self.pipelines.insert(
            id,
            Pipeline {
                desc: *desc,
                pass,
                vertex,
                geometry,
                fragment,
            },
        );
        Ok(id)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        self.pipelines.remove(&pipeline);
    }

    fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutKind,
        writes: &[DescriptorWrite],
    ) -> Option<DescriptorSetId> {
        if self.pool_used >= self.config.descriptor_pool_capacity {
            log::debug!("Descriptor pool exhausted ({} sets)", self.pool_used);
            return None;
        }
        self.pool_used += 1;
        self.stats.descriptor_sets_allocated += 1;
        let id = DescriptorSetId(self.alloc_id());
        self.descriptor_sets.insert(
            id,
            DescriptorSet {
                layout,
                writes: writes.to_vec(),
            },
        );
        self.transient_sets.push(id);
        Some(id)
    }

    fn allocate_persistent_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutKind,
        writes: &[DescriptorWrite],
    ) -> Result<DescriptorSetId> {
        let id = DescriptorSetId(self.alloc_id());
        self.descriptor_sets.insert(
            id,
            DescriptorSet {
                layout,
                writes: writes.to_vec(),
            },
        );
        Ok(id)
    }

    fn cmd_image_barrier(&mut self, image: ImageId, old: ImageLayout, new: ImageLayout) {
        self.stats.barriers += 1;
        self.check_outside_pass("image barrier");
        match self.image_layout(image) {
            Some(actual) => {
                if old != ImageLayout::Undefined && old != actual {
                    self.validation_error(format!(
                        "barrier on image {} from {:?}, but it is in {:?}",
                        image.0, old, actual
                    ));
                }
                if let Some(img) = self.images.get_mut(&image) {
                    img.recorded_layout = new;
                }
            }
            None => self.validation_error(format!("barrier on destroyed image {}", image.0)),
        }
        self.recording.push(Command::Barrier);
    }

    fn cmd_begin_render_pass(
        &mut self,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        area: Rect,
        clear_values: &[ClearValue],
    ) {
        self.stats.render_passes += 1;
        if self.record.pass.is_some() {
            self.validation_error("render pass begun while another is open".to_string());
        }
        let key = self.render_pass_keys.get(&render_pass).copied();
        let attachments = self
            .framebuffers
            .get(&framebuffer)
            .map(|fb| (fb.render_pass, fb.color, fb.depth));
        match (attachments, key) {
            (Some((fb_key, color, depth)), Some(key)) => {
                if !fb_key.is_compatible(&key) {
                    self.validation_error(format!(
                        "framebuffer {} incompatible with pass {:?}",
                        framebuffer.0, key
                    ));
                }
                if let Some(c) = color {
                    let layout = self.image_layout(c);
                    if !matches!(layout, Some(ImageLayout::ColorAttachment | ImageLayout::General)) {
                        self.validation_error(format!("color attachment {} in {:?}", c.0, layout));
                    }
                }
                if let Some(d) = depth {
                    let layout = self.image_layout(d);
                    if !matches!(
                        layout,
                        Some(ImageLayout::DepthStencilAttachment | ImageLayout::General)
                    ) {
                        self.validation_error(format!("depth attachment {} in {:?}", d.0, layout));
                    }
                }
            }
            _ => self.validation_error(format!(
                "render pass {} / framebuffer {} unknown",
                render_pass.0, framebuffer.0
            )),
        }
        self.record.pass = Some(framebuffer);
        self.recording.push(Command::BeginRenderPass {
            framebuffer,
            key,
            area,
            clear_values: clear_values.to_vec(),
        });
    }

    fn cmd_end_render_pass(&mut self) {
        if self.record.pass.take().is_none() {
            self.validation_error("end of render pass without an open pass".to_string());
        }
        self.recording.push(Command::EndRenderPass);
    }

    fn cmd_bind_pipeline(&mut self, pipeline: PipelineId) {
        self.stats.pipeline_binds += 1;
        self.record.pipeline = Some(pipeline);
        self.recording.push(Command::BindPipeline(pipeline));
    }

    fn cmd_bind_vertex_buffer(&mut self, buffer: BufferId, offset: u64) {
        self.stats.vertex_buffer_binds += 1;
        self.recording.push(Command::BindVertexBuffer(buffer, offset));
    }

    fn cmd_bind_index_buffer(&mut self, buffer: BufferId, offset: u64) {
        self.stats.index_buffer_binds += 1;
        self.recording.push(Command::BindIndexBuffer(buffer, offset));
    }

    fn cmd_bind_descriptor_sets(
        &mut self,
        layout: PipelineLayoutKind,
        first_set: u32,
        sets: &[DescriptorSetId],
        dynamic_offsets: &[u32],
    ) {
        self.stats.descriptor_set_binds += 1;
        if layout == PipelineLayoutKind::Utility {
            // Incompatible layout disturbs the higher sets
            self.record.sets[1] = None;
            self.record.sets[2] = None;
        }
        for (i, set) in sets.iter().enumerate() {
            if let Some(slot) = self.record.sets.get_mut(first_set as usize + i) {
                *slot = Some(*set);
            }
        }
        self.recording.push(Command::BindDescriptorSets {
            first: first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    fn cmd_push_constants(&mut self, _layout: PipelineLayoutKind, data: &[u8]) {
        self.stats.push_constants += 1;
        self.recording.push(Command::PushConstants(data.to_vec()));
    }

    fn cmd_set_viewport(&mut self, viewport: &Viewport) {
        self.stats.viewport_sets += 1;
        self.recording.push(Command::SetViewport(*viewport));
    }

    fn cmd_set_scissor(&mut self, scissor: Rect) {
        self.stats.scissor_sets += 1;
        self.recording.push(Command::SetScissor(scissor));
    }

    fn cmd_set_blend_constants(&mut self, constants: [f32; 4]) {
        self.stats.blend_constant_sets += 1;
        self.recording.push(Command::SetBlendConstants(constants));
    }

    fn cmd_draw(&mut self, vertex_count: u32, first_vertex: u32) {
        self.stats.draws += 1;
        self.validate_draw();
        self.recording.push(Command::Draw(raster::DrawCall {
            count: vertex_count,
            first: first_vertex,
            indexed: false,
            vertex_offset: 0,
        }));
    }

    fn cmd_draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32) {
        self.stats.draws += 1;
        self.validate_draw();
        self.recording.push(Command::Draw(raster::DrawCall {
            count: index_count,
            first: first_index,
            indexed: true,
            vertex_offset,
        }));
    }

    fn cmd_clear_color_image(&mut self, image: ImageId, layout: ImageLayout, color: [f32; 4]) {
        self.stats.clears += 1;
        self.check_outside_pass("clear color image");
        self.check_layout(
            "clear color image",
            image,
            layout,
            &[ImageLayout::TransferDst, ImageLayout::General],
        );
        self.recording.push(Command::ClearColor { image, color });
    }

    fn cmd_clear_depth_stencil_image(
        &mut self,
        image: ImageId,
        layout: ImageLayout,
        depth: f32,
        stencil: u32,
        aspects: ClearAspects,
    ) {
        self.stats.clears += 1;
        self.check_outside_pass("clear depth/stencil image");
        self.check_layout(
            "clear depth/stencil image",
            image,
            layout,
            &[ImageLayout::TransferDst, ImageLayout::General],
        );
        self.recording.push(Command::ClearDepthStencil {
            image,
            depth,
            stencil,
            aspects,
        });
    }

    fn cmd_copy_image(
        &mut self,
        src: ImageId,
        src_layout: ImageLayout,
        dst: ImageId,
        dst_layout: ImageLayout,
        regions: &[ImageCopy],
    ) {
        self.stats.copies += 1;
        self.check_outside_pass("copy image");
        self.check_layout("copy image (src)", src, src_layout, &[ImageLayout::TransferSrc, ImageLayout::General]);
        self.check_layout("copy image (dst)", dst, dst_layout, &[ImageLayout::TransferDst, ImageLayout::General]);
        self.recording.push(Command::CopyImage {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    fn cmd_blit_image(
        &mut self,
        src: ImageId,
        src_layout: ImageLayout,
        src_rect: Rect,
        dst: ImageId,
        dst_layout: ImageLayout,
        dst_rect: Rect,
        filter: Filter,
    ) {
        self.stats.blits += 1;
        self.check_outside_pass("blit image");
        self.check_layout("blit image (src)", src, src_layout, &[ImageLayout::TransferSrc, ImageLayout::General]);
        self.check_layout("blit image (dst)", dst, dst_layout, &[ImageLayout::TransferDst, ImageLayout::General]);
        self.recording.push(Command::BlitImage {
            src,
            src_rect,
            dst,
            dst_rect,
            filter,
        });
    }

    fn cmd_copy_buffer_to_image(
        &mut self,
        buffer: BufferId,
        image: ImageId,
        layout: ImageLayout,
        region: &BufferImageCopy,
    ) {
        self.stats.copies += 1;
        self.check_outside_pass("copy buffer to image");
        self.check_layout("copy buffer to image", image, layout, &[ImageLayout::TransferDst, ImageLayout::General]);
        self.recording.push(Command::CopyBufferToImage {
            buffer,
            image,
            region: *region,
        });
    }

    fn cmd_copy_image_to_buffer(
        &mut self,
        image: ImageId,
        layout: ImageLayout,
        buffer: BufferId,
        region: &BufferImageCopy,
    ) {
        self.stats.copies += 1;
        self.check_outside_pass("copy image to buffer");
        self.check_layout("copy image to buffer", image, layout, &[ImageLayout::TransferSrc, ImageLayout::General]);
        self.recording.push(Command::CopyImageToBuffer {
            image,
            buffer,
            region: *region,
        });
    }

    fn current_fence(&self) -> FenceValue {
        self.current_fence
    }

    fn completed_fence(&mut self) -> FenceValue {
        self.completed_fence
    }

    fn submit(&mut self) -> Result<FenceValue> {
        if self.record.pass.is_some() {
            self.validation_error("command buffer submitted with an open render pass".to_string());
            self.recording.push(Command::EndRenderPass);
        }
        let fence = self.current_fence;
        self.in_flight.push_back(InFlight {
            fence,
            commands: std::mem::take(&mut self.recording),
            transient_sets: std::mem::take(&mut self.transient_sets),
        });
        self.current_fence += 1;
        self.pool_used = 0;
        self.record = RecordState::default();
        self.stats.submits += 1;

        if let Some(latency) = self.config.gpu_latency {
            while self.in_flight.len() > latency {
                self.retire_one();
            }
        }
        Ok(fence)
    }

    fn wait_for_fence(&mut self, fence: FenceValue) -> Result<()> {
        self.stats.waits += 1;
        if fence >= self.current_fence {
            return Err(GsError::RenderPass(format!(
                "waiting on fence {} which has not been submitted",
                fence
            )));
        }
        while self.completed_fence < fence && self.retire_one() {}
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.stats.waits += 1;
        self.retire_all();
        Ok(())
    }

    fn create_swap_chain(&mut self, window: &WindowInfo) -> Result<SwapChainInfo> {
        self.destroy_swap_chain();
        let desc = ImageDesc {
            width: window.width.max(1),
            height: window.height.max(1),
            levels: 1,
            layers: 1,
            format: Format::Bgra8Unorm,
            samples: 1,
            usage: super::ImageUsage::COLOR_ATTACHMENT | super::ImageUsage::TRANSFER_DST,
        };
        let images = [self.create_image(&desc)?, self.create_image(&desc)?];
        let info = SwapChainInfo {
            width: desc.width,
            height: desc.height,
            format: desc.format,
        };
        log::info!("Swap chain created: {}x{} {:?}", info.width, info.height, info.format);
        self.swap_chain = Some(SwapChain {
            info,
            images,
            next: 0,
        });
        Ok(info)
    }

    fn destroy_swap_chain(&mut self) {
        if let Some(sc) = self.swap_chain.take() {
            for image in sc.images {
                self.images.remove(&image);
            }
            self.last_presented = None;
        }
    }

    fn acquire_next_image(&mut self) -> Result<ImageId> {
        let sc = self.swap_chain.as_mut().ok_or(GsError::NoSwapChain)?;
        let image = sc.images[sc.next];
        sc.next = (sc.next + 1) % sc.images.len();
        Ok(image)
    }

    fn present(&mut self, image: ImageId) -> Result<()> {
        let Some(sc) = &self.swap_chain else {
            return Err(GsError::NoSwapChain);
        };
        if !sc.images.contains(&image) {
            return Err(GsError::RenderPass(format!(
                "image {} is not a swap chain image",
                image.0
            )));
        }
        if self.image_layout(image) != Some(ImageLayout::PresentSrc) {
            let layout = self.image_layout(image);
            self.validation_error(format!("presenting image {} in {:?}", image.0, layout));
        }
        self.stats.presents += 1;
        self.last_presented = Some(image);
        Ok(())
    }
}
