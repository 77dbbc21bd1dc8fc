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

//! Sampler cache keyed by [`SamplerSelector`]

use std::collections::HashMap;

use crate::core::backend::{AddressMode, Filter, GpuBackend, SamplerDesc, SamplerId};
use crate::core::error::Result;

use super::context::{GpuContext, PendingResource};
use super::selector::SamplerSelector;

/// Translate a selector; `anisotropy` is the configured maximum
pub fn sampler_desc(sel: &SamplerSelector, anisotropy: u32) -> SamplerDesc {
    let filter = if sel.biln { Filter::Linear } else { Filter::Nearest };
    let address = |repeat: bool| {
        if repeat {
            AddressMode::Repeat
        } else {
            AddressMode::ClampToEdge
        }
    };
    SamplerDesc {
        min_filter: filter,
        mag_filter: filter,
        mip_filter: if sel.triln == 2 {
            Filter::Linear
        } else {
            Filter::Nearest
        },
        address_u: address(sel.tau),
        address_v: address(sel.tav),
        anisotropy: if sel.aniso && sel.biln && anisotropy > 1 {
            anisotropy
        } else {
            1
        },
        max_lod: if sel.lodclamp || sel.triln == 0 { 0 } else { u32::MAX },
    }
}

#[derive(Default)]
pub struct SamplerCache {
    samplers: HashMap<SamplerSelector, SamplerId>,
}

impl SamplerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<B: GpuBackend>(
        &mut self,
        ctx: &mut GpuContext<B>,
        sel: SamplerSelector,
        anisotropy: u32,
    ) -> Result<SamplerId> {
        if let Some(s) = self.samplers.get(&sel) {
            return Ok(*s);
        }
        let max = ctx.backend().limits().max_anisotropy;
        let sampler = ctx
            .backend_mut()
            .create_sampler(&sampler_desc(&sel, anisotropy.min(max)))?;
        log::trace!("Created sampler {:#04x}", sel.key());
        self.samplers.insert(sel, sampler);
        Ok(sampler)
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    pub fn destroy<B: GpuBackend>(&mut self, ctx: &mut GpuContext<B>) {
        for (_, s) in self.samplers.drain() {
            ctx.defer_destroy(PendingResource::Sampler(s));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anisotropy_needs_linear_filtering() {
        let nearest = SamplerSelector {
            aniso: true,
            ..Default::default()
        };
        assert_eq!(sampler_desc(&nearest, 16).anisotropy, 1);

        let linear = SamplerSelector {
            biln: true,
            ..nearest
        };
        assert_eq!(sampler_desc(&linear, 16).anisotropy, 16);
        assert_eq!(sampler_desc(&linear, 1).anisotropy, 1);
    }

    #[test]
    fn test_wrap_modes() {
        let desc = sampler_desc(
            &SamplerSelector {
                tau: true,
                ..Default::default()
            },
            1,
        );
        assert_eq!(desc.address_u, AddressMode::Repeat);
        assert_eq!(desc.address_v, AddressMode::ClampToEdge);
        assert_eq!(desc.max_lod, 0);
    }
}
