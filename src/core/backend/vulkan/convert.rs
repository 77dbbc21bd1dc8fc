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

//! Mappings from backend-neutral descriptions to Vulkan enums and flags

use ash::vk;

use crate::core::backend::{
    AddressMode, BlendFactor, BlendOp, BufferUsage, ClearAspects, ClearValue, ColorWriteMask,
    CompareOp, Filter, Format, ImageLayout, ImageUsage, LoadOp, ShaderStage, StencilOp,
    StencilState, Topology, VertexLayout,
};
use crate::core::types::Rect;

pub(crate) fn format(format: Format) -> vk::Format {
    match format {
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::R8Uint => vk::Format::R8_UINT,
        Format::R16Uint => vk::Format::R16_UINT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::D32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

/// Swap chain formats the renderer can present to
pub(crate) fn presentable_format(format: vk::Format) -> Option<Format> {
    match format {
        vk::Format::B8G8R8A8_UNORM => Some(Format::Bgra8Unorm),
        vk::Format::R8G8B8A8_UNORM => Some(Format::Rgba8Unorm),
        _ => None,
    }
}

/// Aspects of the whole image, for views, barriers and image copies
pub(crate) fn aspect(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Aspect moved by buffer copies and read by shaders
pub(crate) fn data_aspect(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Vulkan layout plus the access and stages that touch an image in it
pub(crate) fn layout_access(layout: ImageLayout) -> (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        ImageLayout::Undefined => (
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        ImageLayout::TransferSrc => (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ImageLayout::TransferDst => (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ImageLayout::ColorAttachment => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageLayout::DepthStencilAttachment => (
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        ImageLayout::ShaderReadOnly => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        // Sampled and rendered to by the same draw
        ImageLayout::General => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageLayout::PresentSrc => (
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
    }
}

/// Layout a sampled image descriptor is written with
pub(crate) fn sampled_layout(current: ImageLayout) -> vk::ImageLayout {
    match current {
        ImageLayout::General => vk::ImageLayout::GENERAL,
        _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

pub(crate) fn image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    for (from, to) in [
        (ImageUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (ImageUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (ImageUsage::DEPTH_STENCIL_ATTACHMENT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
        (ImageUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
        (ImageUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
    ] {
        if usage.contains(from) {
            flags |= to;
        }
    }
    flags
}

pub(crate) fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    for (from, to) in [
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
    ] {
        if usage.contains(from) {
            flags |= to;
        }
    }
    flags
}

pub(crate) fn sample_count(samples: u32) -> vk::SampleCountFlags {
    match samples {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

pub(crate) fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub(crate) fn mipmap_mode(filter: Filter) -> vk::SamplerMipmapMode {
    match filter {
        Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
        Filter::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub(crate) fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub(crate) fn load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub(crate) fn topology(topology: Topology) -> vk::PrimitiveTopology {
    match topology {
        Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
        Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
        Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub(crate) fn compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

fn stencil_op(op: StencilOp) -> vk::StencilOp {
    match op {
        StencilOp::Keep => vk::StencilOp::KEEP,
        StencilOp::Zero => vk::StencilOp::ZERO,
        StencilOp::Replace => vk::StencilOp::REPLACE,
    }
}

pub(crate) fn stencil_state(state: &StencilState) -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: stencil_op(state.fail_op),
        pass_op: stencil_op(state.pass_op),
        depth_fail_op: stencil_op(state.depth_fail_op),
        compare_op: compare_op(state.compare),
        compare_mask: state.compare_mask,
        write_mask: state.write_mask,
        reference: state.reference,
    }
}

pub(crate) fn blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::InvSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::InvDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        BlendFactor::Src1Alpha => vk::BlendFactor::SRC1_ALPHA,
        BlendFactor::InvSrc1Alpha => vk::BlendFactor::ONE_MINUS_SRC1_ALPHA,
        BlendFactor::ConstantColor => vk::BlendFactor::CONSTANT_COLOR,
        BlendFactor::InvConstantColor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
    }
}

pub(crate) fn blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
    }
}

pub(crate) fn color_write_mask(mask: ColorWriteMask) -> vk::ColorComponentFlags {
    let mut flags = vk::ColorComponentFlags::empty();
    for (from, to) in [
        (ColorWriteMask::R, vk::ColorComponentFlags::R),
        (ColorWriteMask::G, vk::ColorComponentFlags::G),
        (ColorWriteMask::B, vk::ColorComponentFlags::B),
        (ColorWriteMask::A, vk::ColorComponentFlags::A),
    ] {
        if mask.contains(from) {
            flags |= to;
        }
    }
    flags
}

pub(crate) fn clear_aspects(aspects: ClearAspects) -> vk::ImageAspectFlags {
    let mut flags = vk::ImageAspectFlags::empty();
    if aspects.contains(ClearAspects::DEPTH) {
        flags |= vk::ImageAspectFlags::DEPTH;
    }
    if aspects.contains(ClearAspects::STENCIL) {
        flags |= vk::ImageAspectFlags::STENCIL;
    }
    flags
}

pub(crate) fn shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
    }
}

/// Attribute locations of each vertex layout, matching the shader inputs
pub(crate) fn vertex_attributes(layout: VertexLayout) -> Vec<vk::VertexInputAttributeDescription> {
    let attr = |location: u32, format: vk::Format, offset: u32| vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset,
    };
    match layout {
        VertexLayout::Utility => vec![
            attr(0, vk::Format::R32G32B32A32_SFLOAT, 0),
            attr(1, vk::Format::R32G32_SFLOAT, 16),
        ],
        VertexLayout::Tfx => vec![
            attr(0, vk::Format::R32G32_SFLOAT, 0),
            // 0x80 is full intensity; the shader divides by 128
            attr(1, vk::Format::R8G8B8A8_USCALED, 8),
            attr(2, vk::Format::R32_SFLOAT, 12),
            attr(3, vk::Format::R16G16_UINT, 16),
            attr(4, vk::Format::R32_UINT, 20),
            attr(5, vk::Format::R16G16_UINT, 24),
            attr(6, vk::Format::R32_UINT, 28),
        ],
    }
}

/// Scissor or render area; negative origins are clipped to zero
pub(crate) fn rect2d(rect: Rect) -> vk::Rect2D {
    let left = rect.left.max(0);
    let top = rect.top.max(0);
    vk::Rect2D {
        offset: vk::Offset2D { x: left, y: top },
        extent: vk::Extent2D {
            width: (rect.right - left).max(0) as u32,
            height: (rect.bottom - top).max(0) as u32,
        },
    }
}

pub(crate) fn clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(color) => vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
        ClearValue::DepthStencil(depth, stencil) => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

/// Clear color for an image; integer formats take the values as integers
pub(crate) fn clear_color(format: Format, color: [f32; 4]) -> vk::ClearColorValue {
    if format.is_integer() {
        vk::ClearColorValue {
            uint32: color.map(|c| c.max(0.0) as u32),
        }
    } else {
        vk::ClearColorValue { float32: color }
    }
}
