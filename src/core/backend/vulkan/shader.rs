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

//! GLSL to SPIR-V compilation
//!
//! Module sources are complete GLSL programs with `main` as the entry point.
//! They are parsed, validated and written out as SPIR-V words with naga.
//! naga's GLSL front end covers the vertex and fragment stages only, so
//! geometry modules are reported as compilation failures and the pipelines
//! that need them are never built.

use naga::back::spv;
use naga::front::glsl;
use naga::valid::{Capabilities, ValidationFlags, Validator};

use crate::core::backend::ShaderStage;
use crate::core::error::{GsError, Result};

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

fn naga_stage(stage: ShaderStage) -> Option<naga::ShaderStage> {
    match stage {
        ShaderStage::Vertex => Some(naga::ShaderStage::Vertex),
        ShaderStage::Fragment => Some(naga::ShaderStage::Fragment),
        ShaderStage::Geometry => None,
    }
}

/// Compile one stage of a GLSL program into SPIR-V words
pub fn compile_glsl(stage: ShaderStage, source: &str) -> Result<Vec<u32>> {
    let fail = |reason: String| GsError::ShaderCompilation { stage, reason };
    let naga_stage = naga_stage(stage).ok_or_else(|| fail("no GLSL front end for this stage".to_string()))?;

    let module = glsl::Frontend::default()
        .parse(&glsl::Options::from(naga_stage), source)
        .map_err(|e| {
            let messages: Vec<String> = e.errors.iter().map(|err| err.kind.to_string()).collect();
            fail(format!("parse: {}", messages.join("; ")))
        })?;

    let info = Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| fail(format!("validation: {}", e.into_inner())))?;

    let pipeline = spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: "main".to_string(),
    };
    let words = spv::write_vec(&module, &info, &spv::Options::default(), Some(&pipeline))
        .map_err(|e| fail(format!("SPIR-V output: {}", e)))?;
    log::trace!("Compiled {:?} shader to {} SPIR-V words", stage, words.len());
    Ok(words)
}
