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

//! Presentation targets
//!
//! A native window handle is a `VkSurfaceKHR` the window provider created
//! against [`VulkanBackend::instance_handle`]; the backend takes ownership of
//! it. Headless windows get two offscreen images that are cycled on acquire.
//!
//! An out-of-date surface is reported as [`GsError::SwapChainOutOfDate`] and
//! is not rebuilt here; the window owner answers it with `change_render_window`.

use ash::vk::{self, Handle};

use crate::core::backend::{
    Format, GpuBackend, ImageDesc, ImageId, ImageLayout, ImageUsage, SwapChainInfo, WindowInfo,
};
use crate::core::error::{GsError, Result};

use super::{convert, Image, VulkanBackend};

pub(crate) struct OffscreenSwapChain {
    info: SwapChainInfo,
    images: [ImageId; 2],
    next: usize,
}

pub(crate) struct SurfaceSwapChain {
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    info: SwapChainInfo,
    images: Vec<ImageId>,
    /// One per frame in flight, indexed by the recording frame
    acquire_semaphores: Vec<vk::Semaphore>,
    /// One per swap chain image
    present_semaphores: Vec<vk::Semaphore>,
    /// Acquire semaphore the next submit waits on
    pending_wait: Option<vk::Semaphore>,
}

pub(crate) enum SwapChain {
    Offscreen(OffscreenSwapChain),
    Surface(SurfaceSwapChain),
}

impl SwapChain {
    pub(crate) fn info(&self) -> SwapChainInfo {
        match self {
            SwapChain::Offscreen(sc) => sc.info,
            SwapChain::Surface(sc) => sc.info,
        }
    }

    pub(crate) fn images(&self) -> &[ImageId] {
        match self {
            SwapChain::Offscreen(sc) => &sc.images,
            SwapChain::Surface(sc) => &sc.images,
        }
    }

    /// Semaphore the next submission has to wait on, once
    pub(crate) fn take_pending_wait(&mut self) -> Option<vk::Semaphore> {
        match self {
            SwapChain::Offscreen(_) => None,
            SwapChain::Surface(sc) => sc.pending_wait.take(),
        }
    }
}

/// Preferred presentable format: BGRA8, then RGBA8, both linear
pub(crate) fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<(vk::SurfaceFormatKHR, Format)> {
    let find = |wanted: vk::Format| formats.iter().find(|f| f.format == wanted);
    find(vk::Format::B8G8R8A8_UNORM)
        .or_else(|| find(vk::Format::R8G8B8A8_UNORM))
        .and_then(|f| convert::presentable_format(f.format).map(|format| (*f, format)))
}

/// The surface's own extent, or the window size clamped to what it allows
pub(crate) fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One image more than the minimum, capped by the maximum (0 = unlimited)
pub(crate) fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

impl VulkanBackend {
    pub(super) fn create_offscreen_swap_chain(&mut self, window: &WindowInfo) -> Result<SwapChainInfo> {
        let desc = ImageDesc {
            width: window.width.max(1),
            height: window.height.max(1),
            levels: 1,
            layers: 1,
            format: Format::Bgra8Unorm,
            samples: 1,
            usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC,
        };
        let first = self.create_image(&desc)?;
        let second = match self.create_image(&desc) {
            Ok(image) => image,
            Err(e) => {
                self.destroy_image(first);
                return Err(e);
            }
        };
        let info = SwapChainInfo {
            width: desc.width,
            height: desc.height,
            format: desc.format,
        };
        log::info!("Offscreen swap chain created: {}x{}", info.width, info.height);
        self.swap_chain = Some(SwapChain::Offscreen(OffscreenSwapChain {
            info,
            images: [first, second],
            next: 0,
        }));
        Ok(info)
    }

    pub(super) fn create_surface_swap_chain(&mut self, raw: u64, window: &WindowInfo) -> Result<SwapChainInfo> {
        let surface = vk::SurfaceKHR::from_raw(raw);
        if !self.owned_surfaces.contains(&surface) {
            self.owned_surfaces.push(surface);
        }
        let fail = |what: &str, e: vk::Result| GsError::BackendUnavailable(format!("swap chain {}: {}", what, e));
        let (Some(surface_loader), Some(swapchain_loader)) = (&self.surface_loader, &self.swapchain_loader) else {
            return Err(GsError::BackendUnavailable(
                "window surfaces need VK_KHR_surface in the instance extensions".to_string(),
            ));
        };

        let (swapchain, images, format, extent) = unsafe {
            let supported = surface_loader
                .get_physical_device_surface_support(self.physical_device, self.queue_family_index, surface)
                .map_err(|e| fail("surface support", e))?;
            if !supported {
                return Err(GsError::BackendUnavailable(
                    "graphics queue can't present to this surface".to_string(),
                ));
            }
            let caps = surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, surface)
                .map_err(|e| fail("surface capabilities", e))?;
            let formats = surface_loader
                .get_physical_device_surface_formats(self.physical_device, surface)
                .map_err(|e| fail("surface formats", e))?;
            let (surface_format, format) = choose_surface_format(&formats).ok_or_else(|| {
                GsError::BackendUnavailable(format!("no presentable BGRA8/RGBA8 surface format in {:?}", formats))
            })?;
            let extent = choose_extent(&caps, window.width.max(1), window.height.max(1));

            let info = vk::SwapchainCreateInfoKHR::builder()
                .surface(surface)
                .min_image_count(choose_image_count(&caps))
                .image_format(surface_format.format)
                .image_color_space(surface_format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(caps.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(vk::PresentModeKHR::FIFO)
                .clipped(true);
            let swapchain = swapchain_loader
                .create_swapchain(&info, None)
                .map_err(|e| fail("creation", e))?;
            let images = swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(|e| fail("images", e))?;
            (swapchain, images, format, extent)
        };

        let desc = ImageDesc {
            width: extent.width,
            height: extent.height,
            levels: 1,
            layers: 1,
            format,
            samples: 1,
            usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_DST,
        };
        let mut ids = Vec::with_capacity(images.len());
        let mut present_semaphores = Vec::with_capacity(images.len());
        for image in images {
            let view = self.create_view(image, &desc, convert::aspect(format))?;
            let id = ImageId(self.alloc_id());
            self.images.insert(
                id,
                Image {
                    desc,
                    image,
                    memory: None,
                    view,
                    depth_view: None,
                    layout: ImageLayout::Undefined,
                },
            );
            ids.push(id);
            present_semaphores.push(self.create_semaphore()?);
        }
        let acquire_semaphores = (0..self.frames.len())
            .map(|_| self.create_semaphore())
            .collect::<Result<Vec<_>>>()?;

        let info = SwapChainInfo {
            width: extent.width,
            height: extent.height,
            format,
        };
        log::info!(
            "Swap chain created: {:?}, {}x{}, {} images",
            format,
            info.width,
            info.height,
            ids.len()
        );
        self.swap_chain = Some(SwapChain::Surface(SurfaceSwapChain {
            surface,
            swapchain,
            info,
            images: ids,
            acquire_semaphores,
            present_semaphores,
            pending_wait: None,
        }));
        Ok(info)
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None) }
            .map_err(|e| GsError::BackendUnavailable(format!("semaphore: {}", e)))
    }

    pub(super) fn release_swap_chain(&mut self) {
        let Some(swap_chain) = self.swap_chain.take() else {
            return;
        };
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::warn!("Wait before swap chain teardown failed: {}", e);
        }
        match swap_chain {
            SwapChain::Offscreen(sc) => {
                for image in sc.images {
                    self.destroy_image(image);
                }
            }
            SwapChain::Surface(sc) => unsafe {
                for id in &sc.images {
                    if let Some(image) = self.images.remove(id) {
                        self.device.destroy_image_view(image.view, None);
                    }
                }
                for semaphore in sc.acquire_semaphores.iter().chain(&sc.present_semaphores) {
                    self.device.destroy_semaphore(*semaphore, None);
                }
                if let Some(loader) = &self.swapchain_loader {
                    loader.destroy_swapchain(sc.swapchain, None);
                }
                log::debug!("Swap chain on surface {:#x} destroyed", sc.surface.as_raw());
            },
        }
    }

    pub(super) fn acquire_swap_image(&mut self) -> Result<ImageId> {
        let frame = self.current_frame;
        match self.swap_chain.as_mut() {
            None => Err(GsError::NoSwapChain),
            Some(SwapChain::Offscreen(sc)) => {
                let image = sc.images[sc.next];
                sc.next = (sc.next + 1) % sc.images.len();
                Ok(image)
            }
            Some(SwapChain::Surface(sc)) => {
                let loader = self.swapchain_loader.as_ref().ok_or(GsError::NoSwapChain)?;
                let semaphore = sc.acquire_semaphores[frame];
                let result =
                    unsafe { loader.acquire_next_image(sc.swapchain, u64::MAX, semaphore, vk::Fence::null()) };
                match result {
                    Ok((index, _suboptimal)) => {
                        sc.pending_wait = Some(semaphore);
                        Ok(sc.images[index as usize])
                    }
                    Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GsError::SwapChainOutOfDate),
                    Err(e) => Err(GsError::BackendUnavailable(format!("acquire image: {}", e))),
                }
            }
        }
    }

    pub(super) fn present_swap_image(&mut self, image: ImageId) -> Result<()> {
        let layout = self.images.get(&image).map(|i| i.layout);
        let swap_chain = self.swap_chain.as_ref().ok_or(GsError::NoSwapChain)?;
        let Some(index) = swap_chain.images().iter().position(|i| *i == image) else {
            return Err(GsError::RenderPass(format!("image {} is not a swap chain image", image.0)));
        };
        if layout != Some(ImageLayout::PresentSrc) {
            log::warn!("Presenting image {} in {:?}", image.0, layout);
        }
        let SwapChain::Surface(sc) = swap_chain else {
            return Ok(());
        };
        let loader = self.swapchain_loader.as_ref().ok_or(GsError::NoSwapChain)?;

        // Signalled after all work submitted so far, including the last submit
        let signal = [sc.present_semaphores[index]];
        let submit = vk::SubmitInfo::builder().signal_semaphores(&signal).build();
        let swapchains = [sc.swapchain];
        let indices = [index as u32];
        let present = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit], vk::Fence::null())
                .map_err(|e| GsError::BackendUnavailable(format!("present signal: {}", e)))?;
            match loader.queue_present(self.queue, &present) {
                Ok(false) => Ok(()),
                Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GsError::SwapChainOutOfDate),
                Err(e) => Err(GsError::BackendUnavailable(format!("present: {}", e))),
            }
        }
    }

    /// Swap chain description, if one exists
    pub fn swap_chain_info(&self) -> Option<SwapChainInfo> {
        self.swap_chain.as_ref().map(SwapChain::info)
    }
}
