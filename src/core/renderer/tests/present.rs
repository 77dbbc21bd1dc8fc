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

use crate::core::backend::SoftwareBackend;
use crate::core::gs::{
    registers::encode, Psm, PREG_BGCOLOR, PREG_DISPFB1, PREG_DISPLAY1, PREG_PMODE, PREG_SMODE2,
};
use crate::core::memory::{LocalMemory, VramRegion};
use crate::core::renderer::HwRenderer;
use crate::core::types::Rect;

use super::{assert_valid, renderer, sprite, GREEN, RED};

/// Show the 64x64 buffer at block 0 on read circuit 1
fn display_frame(gs: &mut HwRenderer<SoftwareBackend>) {
    gs.write_privileged(PREG_PMODE, encode::pmode(true, false, false, false, 0xFF));
    gs.write_privileged(PREG_DISPFB1, encode::dispfb(0, 1, Psm::Ct32, 0, 0));
    gs.write_privileged(PREG_DISPLAY1, encode::display(64, 64));
}

/// RGB of the last presented swap chain image at (x, y)
fn presented(gs: &HwRenderer<SoftwareBackend>, x: usize, y: usize) -> [u8; 3] {
    let backend = gs.device().backend();
    let image = backend.last_presented().unwrap();
    let pixels = backend.read_image_rgba8(image).unwrap();
    let width = gs.device().swap_chain_info().unwrap().width as usize;
    let i = (y * width + x) * 4;
    [pixels[i], pixels[i + 1], pixels[i + 2]]
}

#[test]
fn test_vsync_presents_drawn_frame() {
    let mut gs = renderer();
    sprite(&mut gs, Rect::new(0, 0, 64, 64), RED);
    display_frame(&mut gs);
    gs.vsync(false).unwrap();

    assert_eq!(presented(&gs, 32, 32), [0xFF, 0, 0]);
    assert_eq!(gs.stats().vsyncs, 1);
    assert_eq!(gs.device().stats().frames, 1);
    assert_valid(&gs);
}

#[test]
fn test_vsync_without_circuits_presents_black() {
    let mut gs = renderer();
    sprite(&mut gs, Rect::new(0, 0, 64, 64), RED);
    gs.vsync(false).unwrap();

    assert_eq!(presented(&gs, 32, 32), [0, 0, 0]);
    assert_eq!(gs.device().stats().frames, 1);
}

#[test]
fn test_display_shows_host_written_memory() {
    let mut gs = renderer();
    let green: Vec<u8> = GREEN.iter().copied().cycle().take(64 * 64 * 4).collect();
    let region = VramRegion::new(0, 1, Psm::Ct32, Rect::from_size(64, 64));
    gs.write_local_memory(&region, &green).unwrap();
    assert!(gs.cache().targets().is_empty());

    display_frame(&mut gs);
    gs.vsync(false).unwrap();

    assert_eq!(presented(&gs, 10, 50), [0, 0xFF, 0]);
    assert_eq!(gs.cache().targets().len(), 1);
    assert_valid(&gs);
}

#[test]
fn test_background_fills_uncovered_output() {
    let mut gs = renderer();
    sprite(&mut gs, Rect::new(0, 0, 64, 64), RED);
    display_frame(&mut gs);
    // Fully transparent circuit 1 shows the background
    gs.write_privileged(PREG_PMODE, encode::pmode(true, false, true, false, 0));
    gs.write_privileged(PREG_BGCOLOR, encode::bgcolor(0, 0, 0xFF));
    gs.vsync(false).unwrap();

    assert_eq!(presented(&gs, 32, 32), [0, 0, 0xFF]);
}

#[test]
fn test_interlaced_output_is_deinterlaced() {
    let mut gs = renderer();
    sprite(&mut gs, Rect::new(0, 0, 64, 64), RED);
    display_frame(&mut gs);
    gs.write_privileged(PREG_SMODE2, 1);
    gs.vsync(false).unwrap();
    gs.vsync(true).unwrap();

    assert_eq!(presented(&gs, 32, 32), [0xFF, 0, 0]);
    assert_eq!(gs.stats().vsyncs, 2);
    assert_valid(&gs);
}

#[test]
fn test_flush_writes_targets_back() {
    let mut gs = renderer();
    sprite(&mut gs, Rect::new(0, 0, 8, 8), RED);
    gs.flush().unwrap();

    assert!(gs.cache().targets().is_empty());
    let region = VramRegion::new(0, 1, Psm::Ct32, Rect::new(2, 2, 3, 3));
    assert_eq!(gs.memory().read_image(&region), RED.to_vec());
}
