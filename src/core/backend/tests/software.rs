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

use crate::core::backend::*;
use crate::core::error::GsError;
use crate::core::layout::UtilityVertex;
use crate::core::types::Rect;

fn color_desc(width: u32, height: u32) -> ImageDesc {
    ImageDesc {
        width,
        height,
        levels: 1,
        layers: 1,
        format: Format::Rgba8Unorm,
        samples: 1,
        usage: ImageUsage::SAMPLED
            | ImageUsage::COLOR_ATTACHMENT
            | ImageUsage::TRANSFER_SRC
            | ImageUsage::TRANSFER_DST,
    }
}

fn upload_rgba8(be: &mut SoftwareBackend, image: ImageId, width: u32, height: u32, pixels: &[u8]) {
    let buffer = be
        .create_buffer(pixels.len() as u64, BufferUsage::TRANSFER_SRC)
        .unwrap();
    be.buffer_memory(buffer).unwrap().copy_from_slice(pixels);
    be.cmd_image_barrier(image, ImageLayout::Undefined, ImageLayout::TransferDst);
    be.cmd_copy_buffer_to_image(
        buffer,
        image,
        ImageLayout::TransferDst,
        &BufferImageCopy {
            buffer_offset: 0,
            row_length: width,
            level: 0,
            rect: Rect::from_size(width, height),
        },
    );
}

#[test]
fn test_barrier_from_wrong_layout_is_reported() {
    let mut be = SoftwareBackend::new();
    let image = be.create_image(&color_desc(4, 4)).unwrap();

    be.cmd_image_barrier(image, ImageLayout::Undefined, ImageLayout::TransferDst);
    assert!(be.validation_errors().is_empty());
    assert_eq!(be.image_layout(image), Some(ImageLayout::TransferDst));

    be.cmd_image_barrier(image, ImageLayout::ShaderReadOnly, ImageLayout::ColorAttachment);
    assert_eq!(be.validation_errors().len(), 1);
}

#[test]
fn test_transfer_in_wrong_layout_is_reported() {
    let mut be = SoftwareBackend::new();
    let image = be.create_image(&color_desc(4, 4)).unwrap();
    be.cmd_image_barrier(image, ImageLayout::Undefined, ImageLayout::ShaderReadOnly);

    be.cmd_clear_color_image(image, ImageLayout::TransferDst, [1.0; 4]);
    assert!(!be.take_validation_errors().is_empty());
    assert!(be.validation_errors().is_empty());
}

#[test]
fn test_image_size_limit() {
    let mut be = SoftwareBackend::new();
    let result = be.create_image(&color_desc(16384, 4));
    assert!(matches!(result, Err(GsError::ImageCreation { width: 16384, .. })));
}

#[test]
fn test_latency_keeps_command_buffers_in_flight() {
    let mut be = SoftwareBackend::with_config(SoftwareConfig {
        gpu_latency: Some(2),
        ..SoftwareConfig::default()
    });

    assert_eq!(be.current_fence(), 1);
    let f1 = be.submit().unwrap();
    let f2 = be.submit().unwrap();
    let f3 = be.submit().unwrap();
    assert_eq!((f1, f2, f3), (1, 2, 3));
    assert_eq!(be.in_flight_count(), 2);
    assert_eq!(be.completed_fence(), 1);

    be.wait_for_fence(f3).unwrap();
    assert_eq!(be.completed_fence(), 3);
    assert_eq!(be.in_flight_count(), 0);
}

#[test]
fn test_waiting_on_unsubmitted_fence_fails() {
    let mut be = SoftwareBackend::new();
    assert!(be.wait_for_fence(be.current_fence()).is_err());
}

#[test]
fn test_commands_execute_at_retirement() {
    let mut be = SoftwareBackend::with_config(SoftwareConfig {
        gpu_latency: None,
        ..SoftwareConfig::default()
    });
    let image = be.create_image(&color_desc(2, 1)).unwrap();
    let buffer = be.create_buffer(8, BufferUsage::TRANSFER_SRC).unwrap();

    be.cmd_image_barrier(image, ImageLayout::Undefined, ImageLayout::TransferDst);
    be.cmd_copy_buffer_to_image(
        buffer,
        image,
        ImageLayout::TransferDst,
        &BufferImageCopy {
            buffer_offset: 0,
            row_length: 2,
            level: 0,
            rect: Rect::from_size(2, 1),
        },
    );
    be.submit().unwrap();

    // Written after submission, still seen by the copy.
    be.buffer_memory(buffer)
        .unwrap()
        .copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(be.read_image_rgba8(image).unwrap(), vec![0; 8]);

    assert!(be.retire_one());
    assert_eq!(be.read_image_rgba8(image).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert!(!be.retire_one());
}

#[test]
fn test_descriptor_pool_exhaustion_resets_on_submit() {
    let mut be = SoftwareBackend::with_config(SoftwareConfig {
        descriptor_pool_capacity: 2,
        ..SoftwareConfig::default()
    });

    assert!(be.allocate_descriptor_set(DescriptorSetLayoutKind::TfxTextures, &[]).is_some());
    assert!(be.allocate_descriptor_set(DescriptorSetLayoutKind::TfxTextures, &[]).is_some());
    assert!(be.allocate_descriptor_set(DescriptorSetLayoutKind::TfxTextures, &[]).is_none());

    be.submit().unwrap();
    assert_eq!(be.descriptor_pool_usage(), 0);
    assert!(be.allocate_descriptor_set(DescriptorSetLayoutKind::TfxTextures, &[]).is_some());
}

#[test]
fn test_injected_shader_failure() {
    let mut be = SoftwareBackend::with_config(SoftwareConfig {
        fail_shader_containing: Some("PS_TFX 1".to_string()),
        ..SoftwareConfig::default()
    });

    let result = be.create_shader_module(&ShaderModuleDesc {
        stage: ShaderStage::Fragment,
        program: ShaderProgram::Tfx,
        source: "#define PS_TFX 1\n",
    });
    assert!(matches!(
        result,
        Err(GsError::ShaderCompilation {
            stage: ShaderStage::Fragment,
            ..
        })
    ));

    assert!(be
        .create_shader_module(&ShaderModuleDesc {
            stage: ShaderStage::Fragment,
            program: ShaderProgram::Tfx,
            source: "#define PS_TFX 0\n",
        })
        .is_ok());
}

#[test]
fn test_framebuffer_must_match_pass_formats() {
    let mut be = SoftwareBackend::new();
    let image = be.create_image(&color_desc(4, 4)).unwrap();
    let rp = be
        .render_pass(&RenderPassKey::color(Format::R16Uint, LoadOp::Load))
        .unwrap();
    assert!(be.create_framebuffer(rp, Some(image), None).is_err());

    let rp = be
        .render_pass(&RenderPassKey::color(Format::Rgba8Unorm, LoadOp::Load))
        .unwrap();
    assert!(be.create_framebuffer(rp, Some(image), None).is_ok());
    assert_eq!(
        be.render_pass(&RenderPassKey::color(Format::Rgba8Unorm, LoadOp::Load))
            .unwrap(),
        rp
    );
}

#[test]
fn test_copy_draw_reproduces_source() {
    let mut be = SoftwareBackend::new();
    let (w, h) = (4u32, 4u32);

    let pixels: Vec<u8> = (0..h)
        .flat_map(|y| (0..w).flat_map(move |x| [x as u8 * 40, y as u8 * 40, 100, 255]))
        .collect();
    let src = be.create_image(&color_desc(w, h)).unwrap();
    upload_rgba8(&mut be, src, w, h, &pixels);
    be.cmd_image_barrier(src, ImageLayout::TransferDst, ImageLayout::ShaderReadOnly);

    let dst = be.create_image(&color_desc(w, h)).unwrap();
    be.cmd_image_barrier(dst, ImageLayout::Undefined, ImageLayout::ColorAttachment);

    let rp = be
        .render_pass(&RenderPassKey::color(Format::Rgba8Unorm, LoadOp::DontCare))
        .unwrap();
    let fb = be.create_framebuffer(rp, Some(dst), None).unwrap();
    let vs = be
        .create_shader_module(&ShaderModuleDesc {
            stage: ShaderStage::Vertex,
            program: ShaderProgram::Convert,
            source: "#define VERTEX_SHADER 1\n",
        })
        .unwrap();
    let fs = be
        .create_shader_module(&ShaderModuleDesc {
            stage: ShaderStage::Fragment,
            program: ShaderProgram::Convert,
            source: "#define FRAGMENT_SHADER 1\n#define ps_main0 main\n",
        })
        .unwrap();
    let pipeline = be
        .create_graphics_pipeline(&GraphicsPipelineDesc {
            layout: PipelineLayoutKind::Utility,
            vertex_layout: VertexLayout::Utility,
            topology: Topology::TriangleStrip,
            vertex_shader: vs,
            geometry_shader: None,
            fragment_shader: Some(fs),
            render_pass: rp,
            depth_stencil: DepthStencilState::default(),
            blend: BlendState::default(),
        })
        .unwrap();
    let sampler = be
        .create_sampler(&SamplerDesc::simple(Filter::Nearest, AddressMode::ClampToEdge))
        .unwrap();
    let set = be
        .allocate_descriptor_set(
            DescriptorSetLayoutKind::Utility,
            &[DescriptorWrite::CombinedImageSampler {
                binding: 0,
                image: src,
                sampler,
            }],
        )
        .unwrap();

    let quad = [
        UtilityVertex::new(-1.0, 1.0, 0.0, 0.0),
        UtilityVertex::new(1.0, 1.0, 1.0, 0.0),
        UtilityVertex::new(-1.0, -1.0, 0.0, 1.0),
        UtilityVertex::new(1.0, -1.0, 1.0, 1.0),
    ];
    let vb = be.create_buffer(96, BufferUsage::VERTEX).unwrap();
    be.buffer_memory(vb)
        .unwrap()
        .copy_from_slice(bytemuck::cast_slice(&quad));

    let area = Rect::from_size(w, h);
    be.cmd_begin_render_pass(rp, fb, area, &[]);
    be.cmd_bind_pipeline(pipeline);
    be.cmd_bind_vertex_buffer(vb, 0);
    be.cmd_bind_descriptor_sets(PipelineLayoutKind::Utility, 0, &[set], &[]);
    be.cmd_set_viewport(&Viewport::from_size(w, h));
    be.cmd_set_scissor(area);
    be.cmd_draw(4, 0);
    be.cmd_end_render_pass();
    be.submit().unwrap();

    assert!(be.validation_errors().is_empty(), "{:?}", be.validation_errors());
    assert_eq!(be.read_image_rgba8(dst).unwrap(), pixels);
    assert_eq!(be.stats().draws, 1);
    assert_eq!(be.stats().submits, 1);
}

#[test]
fn test_draw_outside_pass_is_reported() {
    let mut be = SoftwareBackend::new();
    be.cmd_draw(3, 0);
    assert_eq!(be.validation_errors().len(), 2);
}

#[test]
fn test_present_requires_present_layout() {
    let mut be = SoftwareBackend::new();
    assert!(matches!(be.acquire_next_image(), Err(GsError::NoSwapChain)));

    let info = be.create_swap_chain(&WindowInfo::headless(8, 6)).unwrap();
    assert_eq!((info.width, info.height), (8, 6));

    let first = be.acquire_next_image().unwrap();
    be.present(first).unwrap();
    assert_eq!(be.take_validation_errors().len(), 1);

    let second = be.acquire_next_image().unwrap();
    assert_ne!(first, second);
    be.cmd_image_barrier(second, ImageLayout::Undefined, ImageLayout::PresentSrc);
    be.present(second).unwrap();
    assert!(be.validation_errors().is_empty());
    assert_eq!(be.last_presented(), Some(second));
    assert_eq!(be.acquire_next_image().unwrap(), first);
}
