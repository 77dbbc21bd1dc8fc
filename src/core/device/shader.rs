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

//! Shader specialization
//!
//! Variants are produced by prepending `#define` lines to a shared template.
//! [`build_shader_source`] is a pure function of the template and the macro
//! set; the resulting text doubles as the module cache key, so two selectors
//! producing the same macros share one module.
//!
//! # Example
//!
//! ```
//! use gsrx::core::backend::ShaderStage;
//! use gsrx::core::device::build_shader_source;
//!
//! let src = build_shader_source("void main() {}\n", ShaderStage::Fragment, &[("PS_TFX", 1)], None);
//! assert!(src.contains("#define PS_TFX 1\n"));
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use crate::core::backend::{GpuBackend, ShaderModuleDesc, ShaderModuleId, ShaderProgram, ShaderStage};
use crate::core::error::{GsError, Result};

use super::context::{GpuContext, PendingResource};
use super::selector::{GsSelector, PsSelector, VsSelector};

/// Supplies shader template text by logical name
pub trait ShaderSourceProvider {
    fn template(&self, name: &str) -> Option<String>;
}

/// Templates compiled into the binary
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedShaders;

impl ShaderSourceProvider for EmbeddedShaders {
    fn template(&self, name: &str) -> Option<String> {
        let text = match name {
            "convert.glsl" => include_str!("../../../shaders/convert.glsl"),
            "merge.glsl" => include_str!("../../../shaders/merge.glsl"),
            "interlace.glsl" => include_str!("../../../shaders/interlace.glsl"),
            "tfx.glsl" => include_str!("../../../shaders/tfx.glsl"),
            _ => return None,
        };
        Some(text.to_string())
    }
}

/// Templates read from a directory at lookup time
#[derive(Debug, Clone)]
pub struct DirectoryShaders {
    root: PathBuf,
}

impl DirectoryShaders {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ShaderSourceProvider for DirectoryShaders {
    fn template(&self, name: &str) -> Option<String> {
        let path = self.root.join(name);
        match std::fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(e) => {
                log::warn!("Can't read shader template {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// File name of a program's template
pub fn template_name(program: ShaderProgram) -> &'static str {
    match program {
        ShaderProgram::Convert => "convert.glsl",
        ShaderProgram::Merge => "merge.glsl",
        ShaderProgram::Interlace => "interlace.glsl",
        ShaderProgram::Tfx => "tfx.glsl",
    }
}

fn stage_define(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Vertex => "VERTEX_SHADER",
        ShaderStage::Geometry => "GEOMETRY_SHADER",
        ShaderStage::Fragment => "FRAGMENT_SHADER",
    }
}

/// Specialize `template` for one stage
///
/// # Arguments
///
/// * `template` - Shared template text
/// * `stage` - Stage being compiled; selects `VERTEX_SHADER` etc.
/// * `defines` - Macro values, emitted in order
/// * `entry` - For multi-entry templates, the `ps_mainN` aliased to `main`
pub fn build_shader_source(
    template: &str,
    stage: ShaderStage,
    defines: &[(&str, i64)],
    entry: Option<u32>,
) -> String {
    let mut src = String::with_capacity(template.len() + 64 * (defines.len() + 3));
    src.push_str("#version 460 core\n");
    src.push_str("#extension GL_EXT_samplerless_texture_functions : require\n");
    src.push_str(&format!("#define {} 1\n", stage_define(stage)));
    for (name, value) in defines {
        src.push_str(&format!("#define {} {}\n", name, value));
    }
    if let Some(n) = entry {
        src.push_str(&format!("#define ps_main{} main\n", n));
    }
    src.push('\n');
    src.push_str(template);
    src
}

pub fn vs_defines(sel: &VsSelector) -> Vec<(&'static str, i64)> {
    vec![
        ("VS_TME", sel.tme as i64),
        ("VS_FST", sel.fst as i64),
        ("VS_POINT", sel.point as i64),
    ]
}

pub fn gs_defines(sel: &GsSelector) -> Vec<(&'static str, i64)> {
    vec![
        ("GS_IIP", sel.iip as i64),
        ("GS_PRIM", sel.prim as i64),
        ("GS_POINT", sel.point as i64),
        ("GS_LINE", sel.line as i64),
    ]
}

pub fn ps_defines(sel: &PsSelector, scale_factor: u32) -> Vec<(&'static str, i64)> {
    vec![
        ("PS_SCALE_FACTOR", scale_factor as i64),
        ("PS_FST", sel.fst as i64),
        ("PS_WMS", sel.wms as i64),
        ("PS_WMT", sel.wmt as i64),
        ("PS_FMT", sel.fmt as i64),
        ("PS_AEM", sel.aem as i64),
        ("PS_TFX", sel.tfx as i64),
        ("PS_TCC", sel.tcc as i64),
        ("PS_ATST", sel.atst as i64),
        ("PS_FOG", sel.fog as i64),
        ("PS_CLR1", sel.clr1 as i64),
        ("PS_FBA", sel.fba as i64),
        ("PS_FBMASK", sel.fbmask as i64),
        ("PS_LTF", sel.ltf as i64),
        ("PS_POINT_SAMPLER", sel.point_sampler as i64),
        ("PS_SHUFFLE", sel.shuffle as i64),
        ("PS_READ_BA", sel.read_ba as i64),
        ("PS_CHANNEL_FETCH", sel.channel as i64),
        ("PS_DFMT", sel.dfmt as i64),
        ("PS_DEPTH_FMT", sel.depth_fmt as i64),
        ("PS_PAL_FMT", (sel.fmt >> 2) as i64),
        ("PS_INVALID_TEX0", sel.invalid_tex0 as i64),
        ("PS_HDR", sel.hdr as i64),
        ("PS_COLCLIP", sel.colclip as i64),
        ("PS_BLEND_A", sel.blend_a as i64),
        ("PS_BLEND_B", sel.blend_b as i64),
        ("PS_BLEND_C", sel.blend_c as i64),
        ("PS_BLEND_D", sel.blend_d as i64),
        ("PS_BLEND_MIX", sel.blend_mix as i64),
        ("PS_PABE", sel.pabe as i64),
        ("PS_DITHER", sel.dither as i64),
        ("PS_ZCLAMP", sel.zclamp as i64),
    ]
}

/// Compiled modules keyed by their full source text
pub struct ShaderCache {
    provider: Box<dyn ShaderSourceProvider>,
    templates: HashMap<ShaderProgram, String>,
    modules: HashMap<String, ShaderModuleId>,
}

impl ShaderCache {
    pub fn new(provider: Box<dyn ShaderSourceProvider>) -> Self {
        Self {
            provider,
            templates: HashMap::new(),
            modules: HashMap::new(),
        }
    }

    fn template(&mut self, program: ShaderProgram) -> Result<&str> {
        if !self.templates.contains_key(&program) {
            let name = template_name(program);
            let text = self
                .provider
                .template(name)
                .ok_or_else(|| GsError::MissingShaderSource(name.to_string()))?;
            self.templates.insert(program, text);
        }
        self.templates
            .get(&program)
            .map(String::as_str)
            .ok_or_else(|| GsError::MissingShaderSource(template_name(program).to_string()))
    }

    /// Cached module for a macro set, compiling it on first use
    pub fn get_or_create<B: GpuBackend>(
        &mut self,
        ctx: &mut GpuContext<B>,
        stage: ShaderStage,
        program: ShaderProgram,
        defines: &[(&str, i64)],
        entry: Option<u32>,
    ) -> Result<ShaderModuleId> {
        let source = build_shader_source(self.template(program)?, stage, defines, entry);
        if let Some(module) = self.modules.get(&source) {
            return Ok(*module);
        }

        let module = ctx
            .backend_mut()
            .create_shader_module(&ShaderModuleDesc {
                stage,
                program,
                source: &source,
            })
            .inspect_err(|e| log::error!("{:?} shader for {:?} failed to compile: {}", stage, program, e))?;
        log::debug!(
            "Compiled {:?} {:?} shader ({} defines, entry {:?})",
            program,
            stage,
            defines.len(),
            entry
        );
        self.modules.insert(source, module);
        Ok(module)
    }

    /// Number of distinct modules compiled
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn destroy<B: GpuBackend>(&mut self, ctx: &mut GpuContext<B>) {
        for (_, module) in self.modules.drain() {
            ctx.defer_destroy(PendingResource::ShaderModule(module));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_layout() {
        let src = build_shader_source(
            "void main() {}\n",
            ShaderStage::Vertex,
            &[("VS_TME", 1), ("VS_FST", 0)],
            None,
        );
        assert!(src.starts_with("#version 460 core\n"));
        let vertex = src.find("#define VERTEX_SHADER 1").unwrap();
        let tme = src.find("#define VS_TME 1").unwrap();
        let body = src.find("void main()").unwrap();
        assert!(vertex < tme && tme < body);
        assert!(!src.contains("ps_main"));
    }

    #[test]
    fn test_entry_point_alias() {
        let src = build_shader_source("", ShaderStage::Fragment, &[], Some(9));
        assert!(src.contains("#define ps_main9 main\n"));
        assert!(src.contains("#define FRAGMENT_SHADER 1\n"));
    }

    #[test]
    fn test_ps_defines_follow_selector() {
        let a = PsSelector {
            tfx: 1,
            atst: 2,
            ..Default::default()
        };
        let b = PsSelector { atst: 3, ..a };
        let src_a = build_shader_source("", ShaderStage::Fragment, &ps_defines(&a, 1), None);
        let src_b = build_shader_source("", ShaderStage::Fragment, &ps_defines(&b, 1), None);
        assert!(src_a.contains("#define PS_ATST 2\n"));
        assert!(src_a.contains("#define PS_TFX 1\n"));
        assert_ne!(src_a, src_b);
        assert_eq!(
            src_a,
            build_shader_source("", ShaderStage::Fragment, &ps_defines(&a, 1), None)
        );
    }

    #[test]
    fn test_embedded_templates_present() {
        let shaders = EmbeddedShaders;
        for program in [
            ShaderProgram::Convert,
            ShaderProgram::Merge,
            ShaderProgram::Interlace,
            ShaderProgram::Tfx,
        ] {
            assert!(shaders.template(template_name(program)).is_some());
        }
        assert!(shaders.template("missing.glsl").is_none());
    }

    #[test]
    fn test_directory_provider() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("merge.glsl"), "// merge\n").unwrap();
        let shaders = DirectoryShaders::new(dir.path());
        assert_eq!(shaders.template("merge.glsl").as_deref(), Some("// merge\n"));
        assert!(shaders.template("tfx.glsl").is_none());
    }
}
