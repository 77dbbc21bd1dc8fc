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

//! Renderer settings
//!
//! Settings are read once when the device is created and never polled per
//! frame. They can be loaded from a TOML file and then overridden from the
//! environment:
//!
//! | Variable                  | Field                  |
//! |---------------------------|------------------------|
//! | `GSRX_UPSCALE_MULTIPLIER` | `upscale_multiplier`   |
//! | `GSRX_ANISOTROPY`         | `anisotropic_filtering`|
//! | `GSRX_MIPMAP`             | `mipmap`               |
//! | `GSRX_BILINEAR`           | `bilinear_filtering`   |
//! | `GSRX_DITHERING`          | `dithering`            |
//!
//! # Example
//!
//! ```no_run
//! use gsrx::core::config::RendererSettings;
//!
//! let mut settings = RendererSettings::load("gsrx.toml")?;
//! settings.apply_env_overrides();
//! settings.validate()?;
//! # Ok::<(), gsrx::GsError>(())
//! ```

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{GsError, Result};

const MIB: u64 = 1024 * 1024;

/// Texture mipmapping mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MipmapMode {
    #[default]
    Off,
    Basic,
    Full,
}

impl FromStr for MipmapMode {
    type Err = GsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(MipmapMode::Off),
            "basic" | "1" => Ok(MipmapMode::Basic),
            "full" | "2" => Ok(MipmapMode::Full),
            other => Err(GsError::Config(format!("unknown mipmap mode '{}'", other))),
        }
    }
}

/// Deinterlacing applied by the display merge path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeinterlaceMode {
    Off,
    Weave,
    Bob,
    #[default]
    Blend,
}

/// Compatibility switches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HackSettings {
    /// Skip GPU to VRAM synchronization entirely
    pub disable_hardware_readbacks: bool,

    /// Upload VRAM contents into newly created render targets
    pub preload_frame_data: bool,
}

/// Sizes of the GPU resource pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Texture upload staging ring (bytes)
    pub texture_upload: u64,
    /// Vertex stream (bytes)
    pub vertex: u64,
    /// Index stream (bytes)
    pub index: u64,
    /// Vertex shader uniform stream (bytes)
    pub vertex_uniform: u64,
    /// Fragment shader uniform stream (bytes)
    pub fragment_uniform: u64,
    /// Readback staging buffer (bytes); derived from the upscale factor when unset
    pub readback_staging: Option<u64>,
    /// Descriptor sets available per command buffer
    pub descriptor_pool_capacity: u32,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            texture_upload: 64 * MIB,
            vertex: 32 * MIB,
            index: 16 * MIB,
            vertex_uniform: 8 * MIB,
            fragment_uniform: 8 * MIB,
            readback_staging: None,
            descriptor_pool_capacity: 4096,
        }
    }
}

/// Settings consumed at device creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    /// Internal resolution multiplier (1 = native)
    pub upscale_multiplier: u32,
    /// Maximum anisotropy (1 disables)
    pub anisotropic_filtering: u32,
    pub mipmap: MipmapMode,
    pub bilinear_filtering: bool,
    /// 0 = off, 1 = scaled, 2 = unscaled
    pub dithering: u8,
    /// Emulate inexpressible blend equations in the fragment shader
    pub accurate_blending: bool,
    pub deinterlace: DeinterlaceMode,
    /// Bilinear filtering when presenting
    pub linear_present: bool,
    pub hacks: HackSettings,
    pub buffers: BufferSettings,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            upscale_multiplier: 1,
            anisotropic_filtering: 1,
            mipmap: MipmapMode::Off,
            bilinear_filtering: true,
            dithering: 2,
            accurate_blending: true,
            deinterlace: DeinterlaceMode::default(),
            linear_present: true,
            hacks: HackSettings::default(),
            buffers: BufferSettings::default(),
        }
    }
}

impl RendererSettings {
    /// Load and validate settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let settings = Self::from_toml_str(&contents)?;
        log::info!("Loaded renderer settings from {}", path.as_ref().display());
        Ok(settings)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let settings: Self = toml::from_str(contents)
            .map_err(|e| GsError::Config(format!("failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings as pretty-printed TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| GsError::Serialization(format!("failed to serialize settings: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `GSRX_*` environment variables on top of the current values
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_value::<u32>("GSRX_UPSCALE_MULTIPLIER") {
            self.upscale_multiplier = v;
        }
        if let Some(v) = env_value::<u32>("GSRX_ANISOTROPY") {
            self.anisotropic_filtering = v;
        }
        if let Some(v) = env_value::<MipmapMode>("GSRX_MIPMAP") {
            self.mipmap = v;
        }
        if let Some(v) = env_value::<bool>("GSRX_BILINEAR") {
            self.bilinear_filtering = v;
        }
        if let Some(v) = env_value::<u8>("GSRX_DITHERING") {
            self.dithering = v;
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !(1..=8).contains(&self.upscale_multiplier) {
            return Err(GsError::Config(format!(
                "upscale_multiplier must be in 1..=8, got {}",
                self.upscale_multiplier
            )));
        }
        if ![1, 2, 4, 8, 16].contains(&self.anisotropic_filtering) {
            return Err(GsError::Config(format!(
                "anisotropic_filtering must be 1, 2, 4, 8 or 16, got {}",
                self.anisotropic_filtering
            )));
        }
        if self.dithering > 2 {
            return Err(GsError::Config(format!(
                "dithering must be in 0..=2, got {}",
                self.dithering
            )));
        }
        let b = &self.buffers;
        for (name, size) in [
            ("texture_upload", b.texture_upload),
            ("vertex", b.vertex),
            ("index", b.index),
            ("vertex_uniform", b.vertex_uniform),
            ("fragment_uniform", b.fragment_uniform),
        ] {
            if size == 0 || size > u32::MAX as u64 {
                return Err(GsError::Config(format!(
                    "buffers.{} must be in 1..=4GiB, got {}",
                    name, size
                )));
            }
        }
        if b.descriptor_pool_capacity == 0 {
            return Err(GsError::Config(
                "buffers.descriptor_pool_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Staging size for readbacks: explicit value, or 1280x1280 RGBA8 at the
    /// internal resolution
    pub fn readback_staging_size(&self) -> u64 {
        self.buffers.readback_staging.unwrap_or_else(|| {
            let edge = 1280 * self.upscale_multiplier as u64;
            edge * edge * 4
        })
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => {
            log::debug!("{} overrides renderer setting ({})", name, raw);
            Some(v)
        }
        Err(_) => {
            log::warn!("Ignoring {}: can't parse '{}'", name, raw);
            None
        }
    }
}
