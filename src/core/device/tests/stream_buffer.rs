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

use proptest::prelude::*;

use crate::core::backend::{BufferUsage, GpuBackend, SoftwareBackend, SoftwareConfig};
use crate::core::device::{GpuContext, StreamBuffer, StreamKind};
use crate::core::error::GsError;

use super::{device_with, small_settings};

fn ring(size: u32, latency: Option<usize>) -> (GpuContext<SoftwareBackend>, StreamBuffer) {
    let mut ctx = GpuContext::new(SoftwareBackend::with_config(SoftwareConfig {
        gpu_latency: latency,
        ..Default::default()
    }));
    let buffer = StreamBuffer::new(&mut ctx, "test", size, BufferUsage::VERTEX).unwrap();
    (ctx, buffer)
}

#[test]
fn test_push_advances_and_aligns() {
    let (mut ctx, mut ring) = ring(1024, Some(0));
    assert_eq!(ring.push(&mut ctx, &[1; 10], 4).unwrap(), Some(0));
    assert_eq!(ring.push(&mut ctx, &[2; 10], 16).unwrap(), Some(16));
    assert_eq!(ring.current_offset(), 26);

    let bytes = ctx.backend_mut().buffer_memory(ring.buffer()).unwrap();
    assert_eq!(&bytes[16..26], &[2; 10]);
}

#[test]
fn test_full_ring_needs_a_submit() {
    let (mut ctx, mut ring) = ring(1000, Some(0));
    for _ in 0..9 {
        assert!(ring.push(&mut ctx, &[0; 100], 4).unwrap().is_some());
    }
    // Everything is still owned by the command buffer being recorded
    assert_eq!(ring.push(&mut ctx, &[0; 200], 4).unwrap(), None);

    ctx.submit().unwrap();
    assert_eq!(ring.push(&mut ctx, &[0; 200], 4).unwrap(), Some(0));
}

#[test]
fn test_oversized_push_is_an_error() {
    let (mut ctx, mut ring) = ring(256, Some(0));
    match ring.push(&mut ctx, &[0; 300], 4) {
        Err(GsError::StreamBufferTooSmall { requested, capacity, .. }) => {
            assert_eq!(requested, 300);
            assert_eq!(capacity, 256);
        }
        other => panic!("expected StreamBufferTooSmall, got {:?}", other),
    }
}

#[test]
fn test_device_flushes_full_vertex_stream() {
    let mut settings = small_settings();
    settings.buffers.vertex = 1000;
    let mut dev = device_with(settings, SoftwareConfig::default());

    for _ in 0..9 {
        dev.stream_push(StreamKind::Vertex, &[0; 100], 4).unwrap();
    }
    let submits = dev.backend().stats().submits;
    let offset = dev.stream_push(StreamKind::Vertex, &[0; 200], 4).unwrap();

    assert_eq!(offset, 0);
    assert_eq!(dev.backend().stats().submits, submits + 1);
    assert_eq!(dev.stats().forced_flushes, 1);
}

#[test]
fn test_device_reports_stream_too_small() {
    let mut settings = small_settings();
    settings.buffers.vertex = 128;
    let mut dev = device_with(settings, SoftwareConfig::default());
    assert!(matches!(
        dev.stream_push(StreamKind::Vertex, &[0; 200], 4),
        Err(GsError::StreamBufferTooSmall { .. })
    ));
}

#[test]
fn test_mapped_vertices_are_written_in_place() {
    let mut dev = device_with(small_settings(), SoftwareConfig::default());
    dev.ia_set_vertex_buffer(&[1; 10], 4).unwrap();

    let mapped = dev.ia_map_vertex_buffer(8, 4).unwrap();
    assert_eq!(mapped.len(), 32);
    mapped.copy_from_slice(&[7; 32]);
    // Only three of the four mapped vertices are used
    let start = dev.ia_unmap_vertex_buffer(3).unwrap();

    assert_eq!(start, 2);
    assert_eq!(dev.vertex_range, (2, 3));
    let buffer = dev.stream(StreamKind::Vertex).buffer();
    let memory = dev.backend_mut().buffer_memory(buffer).unwrap();
    assert_eq!(&memory[16..40], &[7; 24]);

    // The next upload follows the committed vertices
    assert_eq!(dev.ia_set_vertex_buffer(&[2; 8], 8).unwrap(), 5);
}

#[test]
fn test_unmap_must_follow_a_matching_map() {
    let mut dev = device_with(small_settings(), SoftwareConfig::default());
    assert!(matches!(
        dev.ia_unmap_vertex_buffer(1),
        Err(GsError::InvalidPrimitive(_))
    ));

    dev.ia_map_vertex_buffer(16, 2).unwrap();
    assert!(matches!(
        dev.ia_unmap_vertex_buffer(3),
        Err(GsError::InvalidPrimitive(_))
    ));
    // A rejected commit ends the mapping
    assert!(dev.ia_unmap_vertex_buffer(2).is_err());
}

#[test]
fn test_mapping_a_full_vertex_stream_flushes() {
    let mut settings = small_settings();
    settings.buffers.vertex = 1000;
    let mut dev = device_with(settings, SoftwareConfig::default());
    for _ in 0..9 {
        dev.stream_push(StreamKind::Vertex, &[0; 100], 4).unwrap();
    }

    assert_eq!(dev.ia_map_vertex_buffer(4, 50).unwrap().len(), 200);
    assert_eq!(dev.stats().forced_flushes, 1);
    assert_eq!(dev.ia_unmap_vertex_buffer(50).unwrap(), 0);

    assert!(matches!(
        dev.ia_map_vertex_buffer(4, 300),
        Err(GsError::StreamBufferTooSmall { .. })
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Data pushed into the ring is intact when its command buffer executes,
    /// however the pushes and submits interleave
    #[test]
    fn prop_ring_never_overwrites_in_flight_data(
        ops in prop::collection::vec((1usize..300, any::<bool>()), 1..60),
        latency in prop::option::of(0usize..3),
    ) {
        let (mut ctx, mut ring) = ring(1024, latency);
        // (fence, offset, fill byte, length) of every live upload
        let mut live: Vec<(u64, u32, u8, usize)> = Vec::new();

        for (i, (len, submit)) in ops.into_iter().enumerate() {
            let fill = (i % 251) as u8 + 1;
            let data = vec![fill; len];
            let offset = match ring.push(&mut ctx, &data, 4).unwrap() {
                Some(offset) => offset,
                None => {
                    ctx.submit().unwrap();
                    ring.push(&mut ctx, &data, 4).unwrap().expect("push after submit")
                }
            };
            live.push((ctx.current_fence(), offset, fill, len));

            let completed = ctx.completed_fence();
            live.retain(|&(fence, ..)| fence > completed);
            let bytes = ctx.backend_mut().buffer_memory(ring.buffer()).unwrap();
            for &(_, offset, fill, len) in &live {
                let range = offset as usize..offset as usize + len;
                prop_assert!(bytes[range].iter().all(|&b| b == fill));
            }

            if submit {
                ctx.submit().unwrap();
            }
        }
    }
}
