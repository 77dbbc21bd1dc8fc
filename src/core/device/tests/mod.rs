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

mod end_to_end;
mod pipeline;
mod stream_buffer;
mod surface;

use crate::core::backend::{SoftwareBackend, SoftwareConfig, WindowInfo};
use crate::core::config::RendererSettings;

use super::{EmbeddedShaders, GsDevice};

const KIB: u64 = 1024;

/// Settings with small buffers so a device is cheap to build
fn small_settings() -> RendererSettings {
    let mut settings = RendererSettings::default();
    settings.buffers.texture_upload = 256 * KIB;
    settings.buffers.vertex = 64 * KIB;
    settings.buffers.index = 64 * KIB;
    settings.buffers.vertex_uniform = 64 * KIB;
    settings.buffers.fragment_uniform = 64 * KIB;
    settings.buffers.readback_staging = Some(256 * KIB);
    settings
}

fn device_with(settings: RendererSettings, config: SoftwareConfig) -> GsDevice<SoftwareBackend> {
    GsDevice::new(
        SoftwareBackend::with_config(config),
        settings,
        WindowInfo::headless(64, 48),
        Box::new(EmbeddedShaders),
    )
    .unwrap()
}

fn device() -> GsDevice<SoftwareBackend> {
    device_with(small_settings(), SoftwareConfig::default())
}

/// Panic with the backend's complaints, if it has any
fn assert_valid(dev: &GsDevice<SoftwareBackend>) {
    let errors = dev.backend().validation_errors();
    assert!(errors.is_empty(), "validation errors: {:#?}", errors);
}
