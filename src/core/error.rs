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

//! Error types for the GS renderer backend
//!
//! Every fallible operation in the crate returns [`Result<T>`], an alias for
//! `std::result::Result<T, GsError>`.
//!
//! # Error Classes
//!
//! - Resource exhaustion (`DescriptorPoolExhausted`, `StreamBufferTooSmall`):
//!   handled locally with a single flush-and-retry; surfacing one of these
//!   means the retry failed too.
//! - Creation failures (`ImageCreation`, `ShaderCompilation`, `PipelineCreation`):
//!   recoverable at the call site.
//! - Protocol violations (`SurfaceTypeMismatch`, `InvalidSurface`, `RenderPass`):
//!   programmer errors; the offending operation is skipped.
//! - Draw input (`InvalidPrimitive`, `TargetConflict`): bad vertex data is
//!   rejected; unresolvable targets drop the draw.
//! - `SwapChainOutOfDate`: the window owner rebuilds the swap chain and
//!   carries on with the next frame.
//! - `NotImplemented`: placeholder paths that report failure explicitly.

use thiserror::Error;

use super::backend::{Format, ShaderStage};
use super::device::SurfaceKind;

/// GS renderer error type
#[derive(Error, Debug)]
pub enum GsError {
    /// The graphics backend could not be initialized
    #[error("Graphics backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Image allocation was rejected by the backend
    #[error("Failed to create {width}x{height} {format:?} image: {reason}")]
    ImageCreation {
        width: u32,
        height: u32,
        format: Format,
        reason: String,
    },

    /// GPU buffer allocation failed
    #[error("Failed to create {size} byte buffer: {reason}")]
    BufferCreation { size: u64, reason: String },

    /// A shader variant failed to compile
    #[error("Failed to compile {stage:?} shader: {reason}")]
    ShaderCompilation { stage: ShaderStage, reason: String },

    /// A graphics pipeline could not be built
    #[error("Failed to create pipeline: {0}")]
    PipelineCreation(String),

    /// The per-command-buffer descriptor pool is exhausted even after a flush
    #[error("Descriptor pool exhausted while {0}")]
    DescriptorPoolExhausted(&'static str),

    /// A single request does not fit in a stream buffer even when it is empty
    #[error("Stream buffer '{name}' too small: requested {requested} bytes of {capacity}")]
    StreamBufferTooSmall {
        name: &'static str,
        requested: u64,
        capacity: u64,
    },

    /// Readback region exceeds the staging buffer
    #[error("Can't read back {width}x{height}: {required} bytes exceeds staging capacity {capacity}")]
    ReadbackTooLarge {
        width: u32,
        height: u32,
        required: u64,
        capacity: u64,
    },

    /// A surface handle does not refer to a live surface
    #[error("Invalid surface handle {0}")]
    InvalidSurface(String),

    /// A surface of the wrong kind was passed to an operation
    #[error("{operation}: expected {expected:?} surface, found {found:?}")]
    SurfaceTypeMismatch {
        operation: &'static str,
        expected: SurfaceKind,
        found: SurfaceKind,
    },

    /// Render pass protocol violation
    #[error("Render pass error: {0}")]
    RenderPass(String),

    /// Shader template was not supplied by the source provider
    #[error("Missing shader source '{0}'")]
    MissingShaderSource(String),

    /// Vertex or index data that can't form the current primitive
    #[error("Invalid primitive: {0}")]
    InvalidPrimitive(String),

    /// Frame and depth buffers of one draw can't both be resident
    #[error("Draw target conflict: {0}")]
    TargetConflict(String),

    /// Presentation requested without a swap chain
    #[error("No swap chain available")]
    NoSwapChain,

    /// The window surface changed; rebuild with `change_render_window`
    #[error("Swap chain out of date")]
    SwapChainOutOfDate,

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation is intentionally unimplemented
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for GS renderer operations
pub type Result<T> = std::result::Result<T, GsError>;
