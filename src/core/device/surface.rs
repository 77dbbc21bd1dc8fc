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

//! Surface objects
//!
//! A [`Surface`] is one GPU image plus the layout the device last moved it
//! to. The layout is private: [`Surface::transition_to`] is the only way to
//! change it, and it records the matching barrier.
//!
//! Surfaces live in a [`SurfaceArena`] and are referred to by generational
//! [`SurfaceHandle`]s, so a handle to a destroyed surface is detected instead
//! of aliasing whatever reused its slot.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::backend::{
    Format, FramebufferId, GpuBackend, ImageId, ImageLayout, ImageUsage,
};
use crate::core::error::{GsError, Result};

/// Role of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurfaceKind {
    /// Sampled texture uploaded from emulated memory
    Texture,
    /// Color render target
    RenderTarget,
    /// Depth/stencil target
    DepthStencil,
    /// Color target whose contents are read back to the CPU
    Offscreen,
}

impl SurfaceKind {
    pub fn usage(self) -> ImageUsage {
        let transfer = ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST;
        match self {
            SurfaceKind::Texture => ImageUsage::SAMPLED | transfer,
            SurfaceKind::RenderTarget => ImageUsage::SAMPLED | ImageUsage::COLOR_ATTACHMENT | transfer,
            SurfaceKind::DepthStencil => {
                ImageUsage::SAMPLED | ImageUsage::DEPTH_STENCIL_ATTACHMENT | transfer
            }
            SurfaceKind::Offscreen => ImageUsage::COLOR_ATTACHMENT | transfer,
        }
    }

    /// Layout the surface rests in between operations
    pub fn working_layout(self) -> ImageLayout {
        match self {
            SurfaceKind::Texture => ImageLayout::ShaderReadOnly,
            SurfaceKind::RenderTarget | SurfaceKind::Offscreen => ImageLayout::ColorAttachment,
            SurfaceKind::DepthStencil => ImageLayout::DepthStencilAttachment,
        }
    }

    pub fn is_target(self) -> bool {
        !matches!(self, SurfaceKind::Texture)
    }
}

/// Generational reference to a surface in a [`SurfaceArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// One GPU image with tracked layout
#[derive(Debug)]
pub struct Surface {
    kind: SurfaceKind,
    width: u32,
    height: u32,
    levels: u32,
    format: Format,
    image: ImageId,
    layout: ImageLayout,
    /// Framebuffers keyed by the attachment they were paired with
    pub(crate) framebuffers: HashMap<Option<SurfaceHandle>, FramebufferId>,
    /// Contents are undefined; the next render pass may discard them
    pub(crate) discarded: bool,
    /// Frame the surface was last handed out or recycled
    pub(crate) last_frame_used: u64,
}

impl Surface {
    pub(crate) fn new(
        kind: SurfaceKind,
        width: u32,
        height: u32,
        levels: u32,
        format: Format,
        image: ImageId,
    ) -> Self {
        Self {
            kind,
            width,
            height,
            levels,
            format,
            image,
            layout: ImageLayout::Undefined,
            framebuffers: HashMap::new(),
            discarded: false,
            last_frame_used: 0,
        }
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn levels(&self) -> u32 {
        self.levels
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn image(&self) -> ImageId {
        self.image
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    pub fn is_depth(&self) -> bool {
        self.format.is_depth()
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// Record a barrier to `layout`; no-op if the surface is already there
    ///
    /// Must not be called inside a render pass.
    pub fn transition_to<B: GpuBackend>(&mut self, backend: &mut B, layout: ImageLayout) {
        if self.layout == layout {
            return;
        }
        log::trace!(
            "Surface image {} {:?} -> {:?}",
            self.image.raw(),
            self.layout,
            layout
        );
        backend.cmd_image_barrier(self.image, self.layout, layout);
        self.layout = layout;
    }

    /// Whether this surface can stand in for a fresh one with these properties
    pub(crate) fn matches(&self, kind: SurfaceKind, width: u32, height: u32, format: Format, levels: u32) -> bool {
        self.kind == kind
            && self.width == width
            && self.height == height
            && self.format == format
            && self.levels == levels
    }
}

struct Slot {
    generation: u32,
    surface: Option<Surface>,
}

/// Owner of every live surface
#[derive(Default)]
pub struct SurfaceArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl SurfaceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, surface: Surface) -> SurfaceHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.surface = Some(surface);
            return SurfaceHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            surface: Some(surface),
        });
        SurfaceHandle {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: SurfaceHandle) -> Result<&Surface> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.surface.as_ref())
            .ok_or_else(|| GsError::InvalidSurface(handle.to_string()))
    }

    pub fn get_mut(&mut self, handle: SurfaceHandle) -> Result<&mut Surface> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.surface.as_mut())
            .ok_or_else(|| GsError::InvalidSurface(handle.to_string()))
    }

    pub fn contains(&self, handle: SurfaceHandle) -> bool {
        self.get(handle).is_ok()
    }

    pub fn remove(&mut self, handle: SurfaceHandle) -> Option<Surface> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let surface = slot.surface.take()?;
        self.free.push(handle.index);
        Some(surface)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.surface.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<SurfaceHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.surface.is_some())
            .map(|(i, s)| SurfaceHandle {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::{ImageDesc, SoftwareBackend};

    fn make_surface(backend: &mut SoftwareBackend, kind: SurfaceKind) -> Surface {
        let format = if kind == SurfaceKind::DepthStencil {
            Format::D32FloatS8Uint
        } else {
            Format::Rgba8Unorm
        };
        let image = backend
            .create_image(&ImageDesc {
                width: 8,
                height: 8,
                levels: 1,
                layers: 1,
                format,
                samples: 1,
                usage: kind.usage(),
            })
            .unwrap();
        Surface::new(kind, 8, 8, 1, format, image)
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut backend = SoftwareBackend::new();
        let mut arena = SurfaceArena::new();
        let first = arena.insert(make_surface(&mut backend, SurfaceKind::Texture));
        assert!(arena.remove(first).is_some());

        let second = arena.insert(make_surface(&mut backend, SurfaceKind::Texture));
        assert!(arena.get(first).is_err());
        assert!(arena.get(second).is_ok());
        assert!(arena.remove(first).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_transition_records_single_barrier() {
        let mut backend = SoftwareBackend::new();
        let mut surface = make_surface(&mut backend, SurfaceKind::RenderTarget);
        surface.transition_to(&mut backend, ImageLayout::ColorAttachment);
        surface.transition_to(&mut backend, ImageLayout::ColorAttachment);
        assert_eq!(backend.stats().barriers, 1);
        assert_eq!(surface.layout(), ImageLayout::ColorAttachment);
        assert_eq!(backend.image_layout(surface.image()), Some(ImageLayout::ColorAttachment));
        assert!(backend.validation_errors().is_empty());
    }
}
