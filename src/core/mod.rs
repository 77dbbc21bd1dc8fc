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

//! Core renderer components
//!
//! Layers from the bottom up:
//!
//! - [`backend`]: graphics API abstraction and the software backend
//! - [`device`]: surfaces, pipelines, state tracking and GPU utility passes
//! - [`memory`] and [`texture_cache`]: GS local memory and its GPU copies
//! - [`gs`]: register decoding
//! - [`renderer`]: the GS front end driving everything above

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod gs;
pub mod layout;
pub mod memory;
pub mod renderer;
pub mod texture_cache;
pub mod types;
