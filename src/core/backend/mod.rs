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

//! Explicit graphics API seam
//!
//! [`GpuBackend`] captures the subset of a modern explicit graphics API that
//! the device layer drives: resource creation, a fixed-size descriptor pool per
//! command buffer, explicit image barriers, render passes, binds, draws,
//! transfers, fence-based submission and a swap chain.
//!
//! # Architecture
//!
//! All commands are recorded into an implicit "current" command buffer.
//! [`GpuBackend::submit`] closes it, hands it to the GPU and returns the fence
//! value that signals its completion. Fences increase monotonically; a fence
//! is complete once [`GpuBackend::completed_fence`] has reached it.
//!
//! Layout arguments passed to transfer commands are the layouts the caller
//! believes the images are in. Backends are free to validate them.
//!
//! # Implementations
//!
//! - [`SoftwareBackend`]: executes command buffers on the CPU
//! - `VulkanBackend` (feature `vulkan`): records into Vulkan command buffers
//!   through ash

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::error::Result;
use super::types::Rect;

pub mod software;
#[cfg(test)]
mod tests;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use software::{CommandStats, SoftwareBackend, SoftwareConfig};
#[cfg(feature = "vulkan")]
pub use vulkan::{VulkanBackend, VulkanConfig};

/// Monotonic command buffer completion counter
pub type FenceValue = u64;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// Raw backend identifier
            pub fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

define_handle!(
    /// GPU image
    ImageId
);
define_handle!(
    /// GPU buffer
    BufferId
);
define_handle!(SamplerId);
define_handle!(ShaderModuleId);
define_handle!(PipelineId);
define_handle!(RenderPassId);
define_handle!(FramebufferId);
define_handle!(DescriptorSetId);

/// Image formats used by the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    Rgba8Unorm,
    Bgra8Unorm,
    /// High dynamic range render targets
    Rgba32Float,
    R8Uint,
    R16Uint,
    R32Uint,
    /// Combined depth (32-bit float) and stencil (8-bit)
    D32FloatS8Uint,
}

impl Format {
    /// Bytes per texel in buffer copies (depth aspect only for depth formats)
    pub fn texel_size(self) -> u32 {
        match self {
            Format::Rgba8Unorm | Format::Bgra8Unorm => 4,
            Format::Rgba32Float => 16,
            Format::R8Uint => 1,
            Format::R16Uint => 2,
            Format::R32Uint => 4,
            Format::D32FloatS8Uint => 4,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32FloatS8Uint)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Format::R8Uint | Format::R16Uint | Format::R32Uint)
    }
}

/// Image layout / access state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageLayout {
    Undefined,
    TransferSrc,
    TransferDst,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    General,
    PresentSrc,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const COLOR_ATTACHMENT = 1 << 1;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ClearAspects: u32 {
        const DEPTH = 1 << 0;
        const STENCIL = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ColorWriteMask: u32 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const ALL = Self::R.bits() | Self::G.bits() | Self::B.bits() | Self::A.bits();
    }
}

/// Image creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub levels: u32,
    pub layers: u32,
    pub format: Format,
    pub samples: u32,
    pub usage: ImageUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressMode {
    Repeat,
    ClampToEdge,
    /// Transparent black outside the image
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    /// 1 disables anisotropic filtering
    pub anisotropy: u32,
    pub max_lod: u32,
}

impl SamplerDesc {
    pub fn simple(filter: Filter, address: AddressMode) -> Self {
        Self {
            min_filter: filter,
            mag_filter: filter,
            mip_filter: Filter::Nearest,
            address_u: address,
            address_v: address,
            anisotropy: 1,
            max_lod: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderStage {
    Vertex,
    Geometry,
    Fragment,
}

/// Logical shader template a module was built from
///
/// Compiling backends only look at the source text; interpreting backends
/// use this to pick the program to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderProgram {
    Convert,
    Merge,
    Interlace,
    Tfx,
}

#[derive(Debug, Clone, Copy)]
pub struct ShaderModuleDesc<'a> {
    pub stage: ShaderStage,
    pub program: ShaderProgram,
    pub source: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

/// Render pass description; passes with equal formats are compatible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub color: Option<Format>,
    pub depth: Option<Format>,
    pub color_load: LoadOp,
    pub depth_load: LoadOp,
    pub stencil_load: LoadOp,
}

impl RenderPassKey {
    /// Color-only pass
    pub fn color(format: Format, load: LoadOp) -> Self {
        Self {
            color: Some(format),
            depth: None,
            color_load: load,
            depth_load: LoadOp::DontCare,
            stencil_load: LoadOp::DontCare,
        }
    }

    /// Depth/stencil-only pass
    pub fn depth(format: Format, depth_load: LoadOp, stencil_load: LoadOp) -> Self {
        Self {
            color: None,
            depth: Some(format),
            color_load: LoadOp::DontCare,
            depth_load,
            stencil_load,
        }
    }

    /// The same pass with every attachment loaded
    pub fn load_variant(&self) -> Self {
        Self {
            color_load: if self.color.is_some() {
                LoadOp::Load
            } else {
                LoadOp::DontCare
            },
            depth_load: if self.depth.is_some() {
                LoadOp::Load
            } else {
                LoadOp::DontCare
            },
            stencil_load: if self.depth.is_some() {
                LoadOp::Load
            } else {
                LoadOp::DontCare
            },
            ..*self
        }
    }

    /// Whether framebuffers and pipelines built for `other` work with this pass
    pub fn is_compatible(&self, other: &RenderPassKey) -> bool {
        self.color == other.color && self.depth == other.depth
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    PointList,
    LineList,
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    pub fn test<T: PartialOrd>(self, incoming: T, stored: T) -> bool {
        match self {
            CompareOp::Never => false,
            CompareOp::Less => incoming < stored,
            CompareOp::Equal => incoming == stored,
            CompareOp::LessOrEqual => incoming <= stored,
            CompareOp::Greater => incoming > stored,
            CompareOp::NotEqual => incoming != stored,
            CompareOp::GreaterOrEqual => incoming >= stored,
            CompareOp::Always => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare: CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilState {
    fn default() -> Self {
        Self {
            fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            compare: CompareOp::Always,
            compare_mask: 0,
            write_mask: 0,
            reference: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareOp,
    pub stencil_test: bool,
    pub stencil: StencilState,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            depth_compare: CompareOp::Always,
            stencil_test: false,
            stencil: StencilState::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    InvSrcAlpha,
    DstAlpha,
    InvDstAlpha,
    /// Second fragment output's alpha (dual source blending)
    Src1Alpha,
    InvSrc1Alpha,
    ConstantColor,
    InvConstantColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendOp {
    Add,
    /// src - dst
    Subtract,
    /// dst - src
    ReverseSubtract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub enable: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
    pub write_mask: ColorWriteMask,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enable: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            write_mask: ColorWriteMask::ALL,
        }
    }
}

/// Vertex input format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertexLayout {
    /// [`crate::core::layout::UtilityVertex`]
    Utility,
    /// [`crate::core::layout::GsVertex`]
    Tfx,
}

impl VertexLayout {
    pub fn stride(self) -> u32 {
        match self {
            VertexLayout::Utility => 24,
            VertexLayout::Tfx => 32,
        }
    }
}

/// Pipeline layouts
///
/// - `Utility`: set 0 = one combined image sampler; 16 bytes of push constants
/// - `Tfx`: set 0 = VS/PS uniform buffers (dynamic), set 1 = sampled
///   images, set 2 = samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineLayoutKind {
    Utility,
    Tfx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorSetLayoutKind {
    Utility,
    TfxUniforms,
    TfxTextures,
    TfxSamplers,
}

/// One binding written into a freshly allocated descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorWrite {
    UniformBufferDynamic {
        binding: u32,
        buffer: BufferId,
        range: u64,
    },
    SampledImage {
        binding: u32,
        image: ImageId,
    },
    Sampler {
        binding: u32,
        sampler: SamplerId,
    },
    CombinedImageSampler {
        binding: u32,
        image: ImageId,
        sampler: SamplerId,
    },
}

/// Graphics pipeline creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDesc {
    pub layout: PipelineLayoutKind,
    pub vertex_layout: VertexLayout,
    pub topology: Topology,
    pub vertex_shader: ShaderModuleId,
    pub geometry_shader: Option<ShaderModuleId>,
    pub fragment_shader: Option<ShaderModuleId>,
    pub render_pass: RenderPassId,
    pub depth_stencil: DepthStencilState,
    pub blend: BlendState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCopy {
    pub src_level: u32,
    pub src_x: i32,
    pub src_y: i32,
    pub dst_level: u32,
    pub dst_x: i32,
    pub dst_y: i32,
    pub width: u32,
    pub height: u32,
}

/// Region of a buffer <-> image copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    /// Row pitch in texels
    pub row_length: u32,
    pub level: u32,
    pub rect: Rect,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil(f32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowHandle {
    /// No native surface; presentation goes to an offscreen image
    Headless,
    Native(u64),
}

/// Window description handed over by the window provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub handle: WindowHandle,
    pub width: u32,
    pub height: u32,
    pub scale: f32,
}

impl WindowInfo {
    pub fn headless(width: u32, height: u32) -> Self {
        Self {
            handle: WindowHandle::Headless,
            width,
            height,
            scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainInfo {
    pub width: u32,
    pub height: u32,
    pub format: Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendLimits {
    pub max_image_dimension: u32,
    pub max_push_constant_size: u32,
    pub min_uniform_buffer_offset_alignment: u32,
    pub max_anisotropy: u32,
}

/// Narrow interface over an explicit graphics API
pub trait GpuBackend {
    /// Adapter / implementation name
    fn name(&self) -> &str;

    fn limits(&self) -> BackendLimits;

    // Resources

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageId>;
    fn destroy_image(&mut self, image: ImageId);

    /// Create a host-visible, persistently mapped buffer
    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<BufferId>;
    fn destroy_buffer(&mut self, buffer: BufferId);

    /// Host mapping of a buffer
    fn buffer_memory(&mut self, buffer: BufferId) -> Option<&mut [u8]>;

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId>;
    fn destroy_sampler(&mut self, sampler: SamplerId);

    /// Cached render pass for `key`
    fn render_pass(&mut self, key: &RenderPassKey) -> Result<RenderPassId>;

    fn create_framebuffer(
        &mut self,
        render_pass: RenderPassId,
        color: Option<ImageId>,
        depth: Option<ImageId>,
    ) -> Result<FramebufferId>;
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId);

    fn create_shader_module(&mut self, desc: &ShaderModuleDesc<'_>) -> Result<ShaderModuleId>;
    fn destroy_shader_module(&mut self, module: ShaderModuleId);

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> Result<PipelineId>;
    fn destroy_pipeline(&mut self, pipeline: PipelineId);

    /// Allocate from the current command buffer's pool; `None` once exhausted
    fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutKind,
        writes: &[DescriptorWrite],
    ) -> Option<DescriptorSetId>;

    /// Allocate a set that outlives command buffer boundaries
    fn allocate_persistent_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutKind,
        writes: &[DescriptorWrite],
    ) -> Result<DescriptorSetId>;

    // Commands

    fn cmd_image_barrier(&mut self, image: ImageId, old: ImageLayout, new: ImageLayout);

    fn cmd_begin_render_pass(
        &mut self,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        area: Rect,
        clear_values: &[ClearValue],
    );
    fn cmd_end_render_pass(&mut self);

    fn cmd_bind_pipeline(&mut self, pipeline: PipelineId);
    fn cmd_bind_vertex_buffer(&mut self, buffer: BufferId, offset: u64);
    /// Bind 32-bit indices
    fn cmd_bind_index_buffer(&mut self, buffer: BufferId, offset: u64);
    fn cmd_bind_descriptor_sets(
        &mut self,
        layout: PipelineLayoutKind,
        first_set: u32,
        sets: &[DescriptorSetId],
        dynamic_offsets: &[u32],
    );
    fn cmd_push_constants(&mut self, layout: PipelineLayoutKind, data: &[u8]);
    fn cmd_set_viewport(&mut self, viewport: &Viewport);
    fn cmd_set_scissor(&mut self, scissor: Rect);
    fn cmd_set_blend_constants(&mut self, constants: [f32; 4]);

    fn cmd_draw(&mut self, vertex_count: u32, first_vertex: u32);
    fn cmd_draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32);

    fn cmd_clear_color_image(&mut self, image: ImageId, layout: ImageLayout, color: [f32; 4]);
    fn cmd_clear_depth_stencil_image(
        &mut self,
        image: ImageId,
        layout: ImageLayout,
        depth: f32,
        stencil: u32,
        aspects: ClearAspects,
    );
    fn cmd_copy_image(
        &mut self,
        src: ImageId,
        src_layout: ImageLayout,
        dst: ImageId,
        dst_layout: ImageLayout,
        regions: &[ImageCopy],
    );
    #[allow(clippy::too_many_arguments)]
    fn cmd_blit_image(
        &mut self,
        src: ImageId,
        src_layout: ImageLayout,
        src_rect: Rect,
        dst: ImageId,
        dst_layout: ImageLayout,
        dst_rect: Rect,
        filter: Filter,
    );
    fn cmd_copy_buffer_to_image(
        &mut self,
        buffer: BufferId,
        image: ImageId,
        layout: ImageLayout,
        region: &BufferImageCopy,
    );
    fn cmd_copy_image_to_buffer(
        &mut self,
        image: ImageId,
        layout: ImageLayout,
        buffer: BufferId,
        region: &BufferImageCopy,
    );

    // Synchronization

    /// Fence value the current command buffer will signal
    fn current_fence(&self) -> FenceValue;
    fn completed_fence(&mut self) -> FenceValue;
    /// Close and submit the current command buffer
    fn submit(&mut self) -> Result<FenceValue>;
    fn wait_for_fence(&mut self, fence: FenceValue) -> Result<()>;
    fn wait_idle(&mut self) -> Result<()>;

    // Presentation

    fn create_swap_chain(&mut self, window: &WindowInfo) -> Result<SwapChainInfo>;
    fn destroy_swap_chain(&mut self);
    fn acquire_next_image(&mut self) -> Result<ImageId>;
    fn present(&mut self, image: ImageId) -> Result<()>;
}
