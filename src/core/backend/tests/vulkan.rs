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

use ash::vk;
use proptest::prelude::*;

use crate::core::backend::vulkan::convert;
use crate::core::backend::vulkan::shader::{compile_glsl, SPIRV_MAGIC};
use crate::core::backend::vulkan::swap_chain::{choose_extent, choose_image_count, choose_surface_format};
use crate::core::backend::vulkan::{device_type_score, pool_sizes, TFX_SAMPLER_SLOTS, TFX_TEXTURE_SLOTS};
use crate::core::backend::*;
use crate::core::config::RendererSettings;
use crate::core::error::GsError;
use crate::core::types::Rect;

/// Backend on the local GPU, or `None` when the machine has no Vulkan driver
fn gpu_backend() -> Option<VulkanBackend> {
    match VulkanBackend::new(VulkanConfig::default()) {
        Ok(backend) => Some(backend),
        Err(GsError::BackendUnavailable(reason)) => {
            eprintln!("Vulkan not available: {}", reason);
            None
        }
        Err(e) => panic!("unexpected backend error: {}", e),
    }
}

fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
    vk::SurfaceFormatKHR {
        format,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    }
}

fn caps(min_images: u32, max_images: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
    vk::SurfaceCapabilitiesKHR {
        min_image_count: min_images,
        max_image_count: max_images,
        current_extent: vk::Extent2D {
            width: current.0,
            height: current.1,
        },
        min_image_extent: vk::Extent2D { width: 16, height: 16 },
        max_image_extent: vk::Extent2D {
            width: 1920,
            height: 1080,
        },
        ..Default::default()
    }
}

const VERTEX_SHADER: &str = "#version 450
layout(location = 0) in vec4 a_pos;
void main() {
    gl_Position = a_pos;
}
";

const FRAGMENT_SHADER: &str = "#version 450
layout(location = 0) out vec4 o_col0;
void main() {
    o_col0 = vec4(1.0, 0.5, 0.25, 1.0);
}
";

#[test]
fn test_formats_map_to_vulkan() {
    assert_eq!(convert::format(Format::Rgba8Unorm), vk::Format::R8G8B8A8_UNORM);
    assert_eq!(convert::format(Format::Bgra8Unorm), vk::Format::B8G8R8A8_UNORM);
    assert_eq!(convert::format(Format::R32Uint), vk::Format::R32_UINT);
    assert_eq!(convert::format(Format::D32FloatS8Uint), vk::Format::D32_SFLOAT_S8_UINT);
    assert_eq!(
        convert::presentable_format(vk::Format::B8G8R8A8_UNORM),
        Some(Format::Bgra8Unorm)
    );
    assert_eq!(convert::presentable_format(vk::Format::R16G16B16A16_SFLOAT), None);
}

#[test]
fn test_depth_views_and_copies_use_different_aspects() {
    let depth = Format::D32FloatS8Uint;
    assert_eq!(
        convert::aspect(depth),
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    );
    assert_eq!(convert::data_aspect(depth), vk::ImageAspectFlags::DEPTH);
    assert_eq!(convert::aspect(Format::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
    assert_eq!(convert::data_aspect(Format::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
}

#[test]
fn test_layouts_carry_their_access() {
    let (layout, access, stage) = convert::layout_access(ImageLayout::TransferDst);
    assert_eq!(layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    assert_eq!(access, vk::AccessFlags::TRANSFER_WRITE);
    assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);

    let (layout, access, stage) = convert::layout_access(ImageLayout::Undefined);
    assert_eq!(layout, vk::ImageLayout::UNDEFINED);
    assert!(access.is_empty());
    assert_eq!(stage, vk::PipelineStageFlags::TOP_OF_PIPE);

    // Feedback loops sample in GENERAL, everything else in read-only
    assert_eq!(convert::sampled_layout(ImageLayout::General), vk::ImageLayout::GENERAL);
    assert_eq!(
        convert::sampled_layout(ImageLayout::ShaderReadOnly),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    );
}

#[test]
fn test_tfx_vertex_attributes_follow_gs_vertex() {
    let attributes = convert::vertex_attributes(VertexLayout::Tfx);
    let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
    assert_eq!(offsets, vec![0, 8, 12, 16, 20, 24, 28]);
    let locations: Vec<u32> = attributes.iter().map(|a| a.location).collect();
    assert_eq!(locations, (0..7).collect::<Vec<_>>());
    assert_eq!(attributes[1].format, vk::Format::R8G8B8A8_USCALED);
    assert_eq!(attributes[3].format, vk::Format::R16G16_UINT);
    assert!(attributes.iter().all(|a| a.binding == 0));
}

#[test]
fn test_utility_vertex_attributes() {
    let attributes = convert::vertex_attributes(VertexLayout::Utility);
    assert_eq!(attributes.len(), 2);
    assert_eq!(attributes[0].format, vk::Format::R32G32B32A32_SFLOAT);
    assert_eq!(attributes[1].offset, 16);
    // uv ends exactly at the stride
    assert_eq!(attributes[1].offset + 8, VertexLayout::Utility.stride());
}

#[test]
fn test_rect_with_negative_origin_is_clipped() {
    let rect = convert::rect2d(Rect::new(-4, -2, 10, 8));
    assert_eq!(rect.offset, vk::Offset2D { x: 0, y: 0 });
    assert_eq!(rect.extent, vk::Extent2D { width: 10, height: 8 });

    let empty = convert::rect2d(Rect::new(-10, -10, -2, -2));
    assert_eq!(empty.extent, vk::Extent2D { width: 0, height: 0 });
}

#[test]
fn test_integer_images_clear_with_integers() {
    let value = convert::clear_color(Format::R32Uint, [3.0, 0.0, 0.0, 1.0]);
    assert_eq!(unsafe { value.uint32 }, [3, 0, 0, 1]);
    let value = convert::clear_color(Format::Rgba8Unorm, [0.5, 0.25, 0.0, 1.0]);
    assert_eq!(unsafe { value.float32 }, [0.5, 0.25, 0.0, 1.0]);
}

#[test]
fn test_blend_and_compare_mapping() {
    assert_eq!(convert::blend_factor(BlendFactor::Src1Alpha), vk::BlendFactor::SRC1_ALPHA);
    assert_eq!(convert::blend_op(BlendOp::Subtract), vk::BlendOp::SUBTRACT);
    assert_eq!(convert::blend_op(BlendOp::ReverseSubtract), vk::BlendOp::REVERSE_SUBTRACT);
    assert_eq!(convert::compare_op(CompareOp::GreaterOrEqual), vk::CompareOp::GREATER_OR_EQUAL);
    assert_eq!(
        convert::color_write_mask(ColorWriteMask::ALL),
        vk::ColorComponentFlags::R | vk::ColorComponentFlags::G | vk::ColorComponentFlags::B | vk::ColorComponentFlags::A
    );
    assert_eq!(
        convert::clear_aspects(ClearAspects::STENCIL),
        vk::ImageAspectFlags::STENCIL
    );
}

#[test]
fn test_surface_format_prefers_bgra() {
    let formats = [
        surface_format(vk::Format::R8G8B8A8_UNORM),
        surface_format(vk::Format::B8G8R8A8_UNORM),
    ];
    let (chosen, format) = choose_surface_format(&formats).unwrap();
    assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    assert_eq!(format, Format::Bgra8Unorm);

    let (_, format) = choose_surface_format(&formats[..1]).unwrap();
    assert_eq!(format, Format::Rgba8Unorm);

    assert!(choose_surface_format(&[surface_format(vk::Format::B8G8R8A8_SRGB)]).is_none());
}

#[test]
fn test_extent_follows_surface_when_fixed() {
    let fixed = caps(2, 0, (800, 600));
    assert_eq!(choose_extent(&fixed, 640, 480), vk::Extent2D { width: 800, height: 600 });

    let free = caps(2, 0, (u32::MAX, u32::MAX));
    assert_eq!(choose_extent(&free, 640, 480), vk::Extent2D { width: 640, height: 480 });
    assert_eq!(choose_extent(&free, 4000, 8), vk::Extent2D { width: 1920, height: 16 });
}

#[test]
fn test_image_count_respects_maximum() {
    assert_eq!(choose_image_count(&caps(2, 0, (1, 1))), 3);
    assert_eq!(choose_image_count(&caps(2, 2, (1, 1))), 2);
    assert_eq!(choose_image_count(&caps(1, 8, (1, 1))), 2);
}

#[test]
fn test_discrete_gpus_rank_first() {
    let discrete = device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU);
    let integrated = device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU);
    let virtual_gpu = device_type_score(vk::PhysicalDeviceType::VIRTUAL_GPU);
    let cpu = device_type_score(vk::PhysicalDeviceType::CPU);
    assert!(discrete > integrated && integrated > virtual_gpu && virtual_gpu > cpu);
}

#[test]
fn test_pool_holds_any_mix_of_set_layouts() {
    let sizes = pool_sizes(10);
    let count = |ty: vk::DescriptorType| {
        sizes
            .iter()
            .find(|s| s.ty == ty)
            .map(|s| s.descriptor_count)
            .unwrap()
    };
    assert_eq!(count(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), 10);
    assert_eq!(count(vk::DescriptorType::SAMPLED_IMAGE), 10 * TFX_TEXTURE_SLOTS);
    assert_eq!(count(vk::DescriptorType::SAMPLER), 10 * TFX_SAMPLER_SLOTS);
    assert_eq!(count(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC), 20);
}

#[test]
fn test_config_takes_pool_capacity_from_settings() {
    let mut settings = RendererSettings::default();
    settings.buffers.descriptor_pool_capacity = 77;
    let config = VulkanConfig::from_settings(&settings);
    assert_eq!(config.descriptor_pool_capacity, 77);
    assert_eq!(config.frames_in_flight, VulkanConfig::default().frames_in_flight);
}

#[test]
fn test_glsl_compiles_to_spirv() {
    let vertex = compile_glsl(ShaderStage::Vertex, VERTEX_SHADER).unwrap();
    assert_eq!(vertex[0], SPIRV_MAGIC);
    let fragment = compile_glsl(ShaderStage::Fragment, FRAGMENT_SHADER).unwrap();
    assert_eq!(fragment[0], SPIRV_MAGIC);
}

#[test]
fn test_geometry_shaders_are_rejected() {
    let result = compile_glsl(ShaderStage::Geometry, VERTEX_SHADER);
    assert!(matches!(
        result,
        Err(GsError::ShaderCompilation {
            stage: ShaderStage::Geometry,
            ..
        })
    ));
}

#[test]
fn test_broken_glsl_reports_stage() {
    let source = "#version 450\nvoid main() {\n    undefined_function();\n}\n";
    let result = compile_glsl(ShaderStage::Fragment, source);
    assert!(matches!(
        result,
        Err(GsError::ShaderCompilation {
            stage: ShaderStage::Fragment,
            ..
        })
    ));
}

#[test]
fn test_backend_is_created_or_unavailable() {
    let Some(backend) = gpu_backend() else {
        return;
    };
    assert!(!backend.name().is_empty());
    assert_eq!(backend.current_fence(), 1);
    assert!(backend.limits().max_image_dimension >= 4096);
    assert!(backend.swap_chain_info().is_none());
}

#[test]
fn test_buffers_stay_mapped() {
    let Some(mut backend) = gpu_backend() else {
        return;
    };
    let buffer = backend.create_buffer(64, BufferUsage::VERTEX).unwrap();
    backend.buffer_memory(buffer).unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
    assert_eq!(&backend.buffer_memory(buffer).unwrap()[..4], &[1, 2, 3, 4]);
    assert_eq!(backend.buffer_memory(buffer).unwrap().len(), 64);
    backend.destroy_buffer(buffer);
    assert!(backend.buffer_memory(buffer).is_none());
}

#[test]
fn test_headless_swap_chain_alternates_images() {
    let Some(mut backend) = gpu_backend() else {
        return;
    };
    let info = backend.create_swap_chain(&WindowInfo::headless(64, 32)).unwrap();
    assert_eq!((info.width, info.height, info.format), (64, 32, Format::Bgra8Unorm));
    let first = backend.acquire_next_image().unwrap();
    let second = backend.acquire_next_image().unwrap();
    assert_ne!(first, second);
    assert_eq!(backend.acquire_next_image().unwrap(), first);

    backend.destroy_swap_chain();
    assert!(matches!(backend.acquire_next_image(), Err(GsError::NoSwapChain)));
}

#[test]
fn test_fences_advance_per_submit() {
    let Some(mut backend) = gpu_backend() else {
        return;
    };
    // More submits than frames in flight reuses every slot
    for expected in 1..=5 {
        assert_eq!(backend.submit().unwrap(), expected);
    }
    backend.wait_for_fence(5).unwrap();
    assert!(backend.completed_fence() >= 5);
    assert!(backend.wait_for_fence(6).is_err());
    backend.wait_idle().unwrap();
    assert_eq!(backend.completed_fence(), 5);
}

proptest! {
    /// Clipped rects never start left of or above the origin and never grow
    #[test]
    fn prop_rect2d_stays_inside_the_source(
        left in -64i32..64,
        top in -64i32..64,
        width in 0i32..128,
        height in 0i32..128,
    ) {
        let rect = Rect::new(left, top, left + width, top + height);
        let clipped = convert::rect2d(rect);
        prop_assert!(clipped.offset.x >= 0 && clipped.offset.y >= 0);
        prop_assert!(clipped.extent.width <= width as u32);
        prop_assert!(clipped.extent.height <= height as u32);
        prop_assert!(clipped.offset.x + clipped.extent.width as i32 <= rect.right.max(0));
    }
}
