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

//! gsrx: A PlayStation 2 Graphics Synthesizer hardware renderer
//!
//! This crate renders GS command streams on an explicit graphics API.
//!
//! # Architecture
//!
//! The renderer is organized into the following modules:
//!
//! - [`core`]: Device layer, texture cache, register decoding and the
//!   renderer front end
//!
//! # Example
//!
//! ```
//! use gsrx::core::backend::WindowInfo;
//! use gsrx::core::config::RendererSettings;
//! use gsrx::core::renderer::HwRenderer;
//!
//! let mut gs = HwRenderer::software(RendererSettings::default(), WindowInfo::headless(640, 448))?;
//! // gs.write_register(...);
//! // gs.draw(0, &vertices, &[])?;
//! gs.vsync(false)?;
//! # Ok::<(), gsrx::GsError>(())
//! ```
//!
//! # Getting Started
//!
//! 1. Build a [`core::device::GsDevice`] on a [`core::backend::GpuBackend`]
//! 2. Wrap it in a [`core::renderer::HwRenderer`]
//! 3. Feed register writes, primitives and transfers, then call `vsync`
//!
//! # Modules
//!
//! - [`core::backend`]: Graphics API seam and the CPU software backend
//! - [`core::device`]: Surfaces, pipelines, draw state and utility passes
//! - [`core::texture_cache`]: Render targets and textures mirrored from local memory
//! - [`core::gs`]: GS register file
//! - [`core::renderer`]: Hardware renderer front end
//!
//! # Error Handling
//!
//! All fallible operations return [`core::error::Result<T>`] which is an alias for
//! `Result<T, GsError>`.

pub mod core;

// Re-export commonly used types
pub use core::error::{GsError, Result};
