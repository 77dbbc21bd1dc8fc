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

//! GSRX headless entry point
//!
//! Renders a scripted GS scene through the hardware renderer, on the software
//! backend by default or on Vulkan with `--backend vulkan`. Useful for
//! smoke-testing settings and for capturing reference images without a window.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;

use gsrx::core::backend::{CommandStats, GpuBackend, SoftwareBackend, SoftwareConfig, WindowInfo};
use gsrx::core::config::RendererSettings;
use gsrx::core::device::{DeviceStats, EmbeddedShaders, GsDevice};
use gsrx::core::gs::{
    registers::encode, Psm, PREG_DISPFB1, PREG_DISPLAY1, PREG_PMODE, REG_ALPHA_1, REG_FRAME_1, REG_PRIM,
    REG_SCISSOR_1, REG_TEST_1, REG_TEX0_1, REG_ZBUF_1,
};
use gsrx::core::layout::GsVertex;
use gsrx::core::memory::{LinearMemory, VramRegion};
use gsrx::core::renderer::{HwRenderer, RenderStats};
use gsrx::core::texture_cache::CacheStats;
use gsrx::core::types::Rect;

const SCREEN_W: u16 = 320;
const SCREEN_H: u16 = 240;
/// Frame buffer width in 64-pixel units
const FBW: u64 = 5;
/// Z buffer page, right after the frame buffer
const ZBUF_PAGE: u64 = 40;
/// Checkerboard texture block
const TEXTURE_BP: u32 = 0x2000;

const PRIM_TRIANGLE_STRIP: u64 = 4;
const PRIM_SPRITE: u64 = 6;
const ZTST_ALWAYS: u64 = 1;
const ZTST_GEQUAL: u64 = 2;

/// gsrx-headless - render a scripted GS scene without a window
#[derive(Parser, Debug)]
#[command(name = "gsrx-headless", version, about = "Headless GS renderer smoke test")]
struct Args {
    /// Graphics backend to render with
    #[arg(short, long, value_enum, default_value_t = BackendKind::Software)]
    backend: BackendKind,

    /// Renderer settings (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of frames to render
    #[arg(short, long, default_value_t = 60)]
    frames: u32,

    /// Output window width
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Output window height
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Write the last presented image to this file (binary PPM)
    #[arg(short, long)]
    dump: Option<PathBuf>,

    /// Print a JSON statistics report
    #[arg(short, long)]
    stats: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendKind {
    /// CPU reference backend
    Software,
    /// GPU through Vulkan
    Vulkan,
}

#[derive(Serialize)]
struct Report<'a> {
    generated_at: DateTime<Utc>,
    frames: u32,
    settings: &'a RendererSettings,
    render: RenderStats,
    device: DeviceStats,
    cache: CacheStats,
    /// Software backend only
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<CommandStats>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env may carry RUST_LOG and GSRX_* overrides
    dotenvy::dotenv().ok();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    log::info!("Starting GSRX headless...");

    let mut settings = match &args.config {
        Some(path) => RendererSettings::load(path)?,
        None => RendererSettings::default(),
    };
    settings.apply_env_overrides();
    settings.validate()?;

    let window = WindowInfo::headless(args.width, args.height);
    match args.backend {
        BackendKind::Software => {
            let backend = SoftwareBackend::with_config(SoftwareConfig::from_settings(&settings));
            let dev = GsDevice::new(backend, settings.clone(), window, Box::new(EmbeddedShaders))?;
            let mut gs = HwRenderer::new(dev, LinearMemory::new());
            render(&mut gs, args.frames)?;

            if let Some(path) = &args.dump {
                dump_ppm(&gs, path)?;
                log::info!("Wrote {}", path.display());
            }
            if args.stats {
                print_report(&gs, &settings, args.frames, Some(gs.device().backend().stats()))?;
            }
        }
        BackendKind::Vulkan => run_vulkan(&args, &settings, window)?,
    }
    Ok(())
}

#[cfg(feature = "vulkan")]
fn run_vulkan(args: &Args, settings: &RendererSettings, window: WindowInfo) -> Result<(), Box<dyn std::error::Error>> {
    let mut gs = HwRenderer::vulkan(settings.clone(), window)?;
    log::info!("Rendering on {}", gs.device().backend().name());
    render(&mut gs, args.frames)?;
    if args.dump.is_some() {
        log::warn!("--dump reads back presented images and needs the software backend");
    }
    if args.stats {
        print_report(&gs, settings, args.frames, None)?;
    }
    Ok(())
}

#[cfg(not(feature = "vulkan"))]
fn run_vulkan(_: &Args, _: &RendererSettings, _: WindowInfo) -> Result<(), Box<dyn std::error::Error>> {
    Err("built without the vulkan feature".into())
}

fn render<B: GpuBackend>(gs: &mut HwRenderer<B>, frames: u32) -> gsrx::Result<()> {
    setup_scene(gs)?;
    for frame in 0..frames {
        draw_frame(gs, frame)?;
        gs.vsync(frame % 2 == 1)?;
    }
    log::info!("Rendered {} frames", frames);
    Ok(())
}

fn print_report<B: GpuBackend>(
    gs: &HwRenderer<B>,
    settings: &RendererSettings,
    frames: u32,
    backend: Option<CommandStats>,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = Report {
        generated_at: Utc::now(),
        frames,
        settings,
        render: gs.stats(),
        device: gs.device().stats(),
        cache: gs.cache().stats(),
        backend,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn vertex(x: u16, y: u16, z: u32, rgba: [u8; 4]) -> GsVertex {
    GsVertex {
        xy: [x << 4, y << 4],
        z,
        rgba,
        q: 1.0,
        ..Default::default()
    }
}

/// Registers and VRAM contents shared by every frame
fn setup_scene<B: GpuBackend>(gs: &mut HwRenderer<B>) -> gsrx::Result<()> {
    let (w, h) = (SCREEN_W as u64, SCREEN_H as u64);
    gs.write_register(REG_FRAME_1, encode::frame(0, FBW, Psm::Ct32, 0));
    gs.write_register(REG_ZBUF_1, encode::zbuf(ZBUF_PAGE, Psm::Z24, false));
    gs.write_register(REG_SCISSOR_1, encode::scissor(0, w - 1, 0, h - 1));
    gs.write_register(REG_ALPHA_1, encode::alpha(0, 1, 0, 1, 0));
    gs.write_register(REG_TEX0_1, encode::tex0(TEXTURE_BP as u64, 1, Psm::Ct32, 5, 5, true, 0));

    gs.write_privileged(PREG_PMODE, encode::pmode(true, false, false, false, 0xFF));
    gs.write_privileged(PREG_DISPFB1, encode::dispfb(0, FBW, Psm::Ct32, 0, 0));
    gs.write_privileged(PREG_DISPLAY1, encode::display(w, h));

    // 32x32 checkerboard of 8x8 squares
    let mut texels = Vec::with_capacity(32 * 32 * 4);
    for y in 0..32 {
        for x in 0..32 {
            let lit = ((x / 8) + (y / 8)) % 2 == 0;
            texels.extend_from_slice(if lit { &[0xFF, 0xFF, 0xFF, 0x80] } else { &[0x40, 0x40, 0x40, 0x80] });
        }
    }
    let region = VramRegion::new(TEXTURE_BP, 1, Psm::Ct32, Rect::from_size(32, 32));
    gs.write_local_memory(&region, &texels)
}

fn draw_frame<B: GpuBackend>(gs: &mut HwRenderer<B>, frame: u32) -> gsrx::Result<()> {
    let (w, h) = (SCREEN_W, SCREEN_H);

    // Background, also resets depth
    gs.write_register(REG_TEST_1, encode::test(false, 0, 0, false, false, true, ZTST_ALWAYS));
    gs.write_register(REG_PRIM, encode::prim(PRIM_SPRITE, false, false, false, false, 0));
    let bg = [0x10, 0x10, 0x30, 0x80];
    gs.draw(0, &[vertex(0, 0, 0, bg), vertex(w, h, 0, bg)], &[])?;

    // Gouraud quad with cycling corner colors
    gs.write_register(REG_TEST_1, encode::test(false, 0, 0, false, false, true, ZTST_GEQUAL));
    let phase = (frame * 4) as u8;
    gs.write_register(REG_PRIM, encode::prim(PRIM_TRIANGLE_STRIP, true, false, false, false, 0));
    let quad = [
        vertex(40, 40, 1000, [phase, 0x20, 0xFF - phase, 0x80]),
        vertex(200, 40, 1000, [0xFF, phase, 0x20, 0x80]),
        vertex(40, 200, 1000, [0x20, 0xFF, phase, 0x80]),
        vertex(200, 200, 1000, [0xFF - phase, phase, 0xFF, 0x80]),
    ];
    gs.draw(0, &quad, &[])?;

    // Textured sprite sliding across the screen
    let x = ((frame * 4) % (w as u32 - 64)) as u16;
    gs.write_register(REG_PRIM, encode::prim(PRIM_SPRITE, false, true, false, true, 0));
    let mut v0 = vertex(x, 150, 2000, [0x80; 4]);
    let mut v1 = vertex(x + 64, 214, 2000, [0x80; 4]);
    v0.uv = [0, 0];
    v1.uv = [32 << 4, 32 << 4];
    gs.draw(0, &[v0, v1], &[])?;

    // Half transparent overlay
    gs.write_register(REG_PRIM, encode::prim(PRIM_SPRITE, false, false, true, false, 0));
    let overlay = [0xFF, 0x80, 0x00, 0x40];
    gs.draw(0, &[vertex(120, 20, 3000, overlay), vertex(300, 120, 3000, overlay)], &[])
}

/// Write the last presented swap chain image as a binary PPM
fn dump_ppm(gs: &HwRenderer<SoftwareBackend>, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let backend = gs.device().backend();
    let swap = gs.device().swap_chain_info().ok_or("no swap chain")?;
    let image = backend.last_presented().ok_or("nothing was presented")?;
    let pixels = backend.read_image_rgba8(image).ok_or("presented image is gone")?;

    let mut out = BufWriter::new(File::create(path)?);
    write!(out, "P6\n{} {}\n255\n", swap.width, swap.height)?;
    for rgba in pixels.chunks_exact(4) {
        out.write_all(&rgba[..3])?;
    }
    out.flush()?;
    Ok(())
}
