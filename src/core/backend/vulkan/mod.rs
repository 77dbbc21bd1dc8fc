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

//! Vulkan backend built on ash
//!
//! [`VulkanBackend`] drives a real GPU through the [`GpuBackend`] seam.
//!
//! # Architecture
//!
//! - One graphics queue. Command buffers rotate through a ring of
//!   `frames_in_flight` frames, each with its own fence and descriptor pool.
//!   Submitting moves to the next frame and waits for its previous
//!   submission before recording into it again.
//! - Every image and buffer gets its own device memory allocation. Buffers
//!   live in host-visible, coherent memory that stays mapped for their
//!   lifetime.
//! - Image layouts are whatever the caller's barriers say; the layout of the
//!   last recorded barrier is kept to write sampled-image descriptors.
//! - Shader sources are compiled to SPIR-V with naga.
//!
//! # Example
//!
//! ```no_run
//! use gsrx::core::backend::{GpuBackend, VulkanBackend, VulkanConfig};
//!
//! let backend = VulkanBackend::new(VulkanConfig::default())?;
//! println!("Rendering on {}", backend.name());
//! # Ok::<(), gsrx::GsError>(())
//! ```

pub(crate) mod convert;
pub mod shader;
pub(crate) mod swap_chain;

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::ptr::NonNull;

use ash::vk;

use crate::core::config::RendererSettings;
use crate::core::error::{GsError, Result};
use crate::core::types::Rect;

use super::{
    BackendLimits, BlendFactor, BufferId, BufferImageCopy, BufferUsage, ClearAspects, ClearValue,
    DescriptorSetId, DescriptorSetLayoutKind, DescriptorWrite, FenceValue, Filter, Format,
    FramebufferId, GpuBackend, GraphicsPipelineDesc, ImageCopy, ImageDesc, ImageId, ImageLayout,
    ImageUsage, PipelineId,
    PipelineLayoutKind, RenderPassId, RenderPassKey, SamplerDesc, SamplerId, ShaderModuleDesc,
    ShaderModuleId, ShaderStage, SwapChainInfo, Viewport, WindowHandle, WindowInfo,
};

use swap_chain::SwapChain;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const SURFACE_EXTENSION: &str = "VK_KHR_surface";
const ENTRY_POINT: &CStr = c"main";

/// Sampled image bindings in the draw texture set
pub const TFX_TEXTURE_SLOTS: u32 = 4;
/// Sampler bindings in the draw sampler set
pub const TFX_SAMPLER_SLOTS: u32 = 2;
/// Push constant bytes available to utility pipelines
pub const UTILITY_PUSH_CONSTANT_SIZE: u32 = 16;
/// Sets in the pool that outlives command buffers
const PERSISTENT_SETS: u32 = 16;

/// Vulkan backend tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulkanConfig {
    /// Enable the Khronos validation layer when it is installed
    pub validation: bool,
    /// Instance extensions the window provider needs for its surfaces
    pub instance_extensions: Vec<String>,
    /// Command buffers recorded ahead of the GPU
    pub frames_in_flight: usize,
    /// Descriptor sets available per command buffer
    pub descriptor_pool_capacity: u32,
    /// Prefer the adapter whose name contains this text
    pub adapter: Option<String>,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            validation: false,
            instance_extensions: Vec::new(),
            frames_in_flight: 3,
            descriptor_pool_capacity: 4096,
            adapter: None,
        }
    }
}

impl VulkanConfig {
    /// Backend tunables derived from renderer settings
    pub fn from_settings(settings: &RendererSettings) -> Self {
        Self {
            descriptor_pool_capacity: settings.buffers.descriptor_pool_capacity,
            ..Self::default()
        }
    }
}

pub(crate) struct Image {
    desc: ImageDesc,
    image: vk::Image,
    /// `None` for swap chain images, which the swap chain owns
    memory: Option<vk::DeviceMemory>,
    view: vk::ImageView,
    /// Depth-only view for sampling depth formats
    depth_view: Option<vk::ImageView>,
    /// Layout after the last recorded barrier
    layout: ImageLayout,
}

impl Image {
    fn sample_view(&self) -> vk::ImageView {
        self.depth_view.unwrap_or(self.view)
    }
}

struct Buffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: NonNull<u8>,
    size: usize,
}

struct Framebuffer {
    framebuffer: vk::Framebuffer,
    key: RenderPassKey,
}

/// One slot of the command buffer ring
struct Frame {
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    descriptor_pool: vk::DescriptorPool,
    /// Fence value of the last submission from this slot, 0 if never used
    fence_value: FenceValue,
    transient_sets: Vec<DescriptorSetId>,
    pool_used: u32,
}

struct Layouts {
    /// Indexed by [`set_layout_index`]
    sets: [vk::DescriptorSetLayout; 4],
    utility: vk::PipelineLayout,
    tfx: vk::PipelineLayout,
}

impl Layouts {
    fn pipeline(&self, kind: PipelineLayoutKind) -> vk::PipelineLayout {
        match kind {
            PipelineLayoutKind::Utility => self.utility,
            PipelineLayoutKind::Tfx => self.tfx,
        }
    }
}

fn set_layout_index(kind: DescriptorSetLayoutKind) -> usize {
    match kind {
        DescriptorSetLayoutKind::Utility => 0,
        DescriptorSetLayoutKind::TfxUniforms => 1,
        DescriptorSetLayoutKind::TfxTextures => 2,
        DescriptorSetLayoutKind::TfxSamplers => 3,
    }
}

fn vk_error(what: &'static str) -> impl Fn(vk::Result) -> GsError {
    move |e| GsError::BackendUnavailable(format!("{}: {}", what, e))
}

/// Pool sizes for `sets` descriptor sets of any layout
pub(crate) fn pool_sizes(sets: u32) -> [vk::DescriptorPoolSize; 4] {
    let size = |ty: vk::DescriptorType, per_set: u32| vk::DescriptorPoolSize {
        ty,
        descriptor_count: sets * per_set,
    };
    [
        size(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1),
        size(vk::DescriptorType::SAMPLED_IMAGE, TFX_TEXTURE_SLOTS),
        size(vk::DescriptorType::SAMPLER, TFX_SAMPLER_SLOTS),
        size(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 2),
    ]
}

/// Vulkan GPU backend
pub struct VulkanBackend {
    config: VulkanConfig,
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    device_name: String,
    limits: BackendLimits,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    features: vk::PhysicalDeviceFeatures,
    surface_loader: Option<ash::extensions::khr::Surface>,
    swapchain_loader: Option<ash::extensions::khr::Swapchain>,

    next_id: u32,
    images: HashMap<ImageId, Image>,
    buffers: HashMap<BufferId, Buffer>,
    samplers: HashMap<SamplerId, vk::Sampler>,
    shaders: HashMap<ShaderModuleId, (ShaderStage, vk::ShaderModule)>,
    pipelines: HashMap<PipelineId, vk::Pipeline>,
    render_passes: HashMap<RenderPassKey, RenderPassId>,
    render_pass_handles: HashMap<RenderPassId, (vk::RenderPass, RenderPassKey)>,
    framebuffers: HashMap<FramebufferId, Framebuffer>,
    descriptor_sets: HashMap<DescriptorSetId, vk::DescriptorSet>,
    layouts: Layouts,
    persistent_pool: vk::DescriptorPool,

    command_pool: vk::CommandPool,
    frames: Vec<Frame>,
    current_frame: usize,
    current_fence: FenceValue,
    completed_fence: FenceValue,
    in_render_pass: bool,

    swap_chain: Option<SwapChain>,
    owned_surfaces: Vec<vk::SurfaceKHR>,
}

impl VulkanBackend {
    /// Load Vulkan, pick an adapter and create a device with one graphics queue
    ///
    /// # Returns
    ///
    /// [`GsError::BackendUnavailable`] when there is no loader or no usable GPU
    pub fn new(config: VulkanConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GsError::BackendUnavailable(format!("Failed to load Vulkan: {}", e)))?;
        let instance = create_instance(&entry, &config)?;
        log::info!("Vulkan instance created");

        let selected = unsafe { select_physical_device(&instance, config.adapter.as_deref()) };
        let (physical_device, queue_family_index) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        log::info!("Selected GPU: {} (type: {:?})", device_name, props.device_type);

        let supported = unsafe { instance.get_physical_device_features(physical_device) };
        let features = vk::PhysicalDeviceFeatures {
            geometry_shader: supported.geometry_shader,
            dual_src_blend: supported.dual_src_blend,
            sampler_anisotropy: supported.sampler_anisotropy,
            ..Default::default()
        };

        let wants_surface = config.instance_extensions.iter().any(|e| e == SURFACE_EXTENSION);
        let swapchain_name = ash::extensions::khr::Swapchain::name();
        let has_swapchain = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .map(|exts| {
                exts.iter()
                    .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == swapchain_name)
            })
            .unwrap_or(false);
        let enable_swapchain = wants_surface && has_swapchain;
        let device_extensions: Vec<*const std::os::raw::c_char> = if enable_swapchain {
            vec![swapchain_name.as_ptr()]
        } else {
            Vec::new()
        };

        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)
            .build();
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&device_extensions)
            .enabled_features(&features);
        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(vk_error("device creation"))?;
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        log::info!("Vulkan device created (queue family: {})", queue_family_index);

        let surface_loader = wants_surface.then(|| ash::extensions::khr::Surface::new(&entry, &instance));
        let swapchain_loader = enable_swapchain.then(|| ash::extensions::khr::Swapchain::new(&instance, &device));

        let limits = BackendLimits {
            max_image_dimension: props.limits.max_image_dimension2_d,
            max_push_constant_size: props.limits.max_push_constants_size,
            min_uniform_buffer_offset_alignment: props.limits.min_uniform_buffer_offset_alignment as u32,
            max_anisotropy: if features.sampler_anisotropy == vk::TRUE {
                props.limits.max_sampler_anisotropy as u32
            } else {
                1
            },
        };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let layouts = unsafe { create_layouts(&device, features.geometry_shader == vk::TRUE) }
            .map_err(vk_error("pipeline layouts"))?;
        let persistent_pool = unsafe { create_descriptor_pool(&device, PERSISTENT_SETS) }
            .map_err(vk_error("descriptor pool"))?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool =
            unsafe { device.create_command_pool(&pool_info, None) }.map_err(vk_error("command pool"))?;
        let frame_count = config.frames_in_flight.max(1);
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frame_count as u32);
        let command_buffers =
            unsafe { device.allocate_command_buffers(&alloc_info) }.map_err(vk_error("command buffers"))?;
        let mut frames = Vec::with_capacity(frame_count);
        for command_buffer in command_buffers {
            let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) }
                .map_err(vk_error("fence"))?;
            let descriptor_pool = unsafe { create_descriptor_pool(&device, config.descriptor_pool_capacity) }
                .map_err(vk_error("descriptor pool"))?;
            frames.push(Frame {
                command_buffer,
                fence,
                descriptor_pool,
                fence_value: 0,
                transient_sets: Vec::new(),
                pool_used: 0,
            });
        }

        let mut backend = Self {
            config,
            _entry: entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            device_name,
            limits,
            memory_properties,
            features,
            surface_loader,
            swapchain_loader,
            next_id: 1,
            images: HashMap::new(),
            buffers: HashMap::new(),
            samplers: HashMap::new(),
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            render_passes: HashMap::new(),
            render_pass_handles: HashMap::new(),
            framebuffers: HashMap::new(),
            descriptor_sets: HashMap::new(),
            layouts,
            persistent_pool,
            command_pool,
            frames,
            current_frame: 0,
            current_fence: 1,
            completed_fence: 0,
            in_render_pass: false,
            swap_chain: None,
            owned_surfaces: Vec::new(),
        };
        backend.begin_frame(0)?;
        log::info!(
            "Vulkan backend ready: {} frames in flight, {} descriptor sets per command buffer",
            backend.frames.len(),
            backend.config.descriptor_pool_capacity
        );
        Ok(backend)
    }

    pub fn config(&self) -> &VulkanConfig {
        &self.config
    }

    /// Raw `VkInstance`, for window providers creating surfaces
    pub fn instance_handle(&self) -> vk::Instance {
        self.instance.handle()
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn cmd(&self) -> vk::CommandBuffer {
        self.frames[self.current_frame].command_buffer
    }

    fn memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        let props = &self.memory_properties;
        (0..props.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0 && props.memory_types[i as usize].property_flags.contains(flags)
        })
    }

    fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> std::result::Result<vk::DeviceMemory, String> {
        let type_index = self
            .memory_type(requirements.memory_type_bits, flags)
            .ok_or_else(|| format!("no memory type with {:?}", flags))?;
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        unsafe { self.device.allocate_memory(&info, None) }.map_err(|e| e.to_string())
    }

    fn create_view(&self, image: vk::Image, desc: &ImageDesc, aspect: vk::ImageAspectFlags) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(convert::format(desc.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: desc.levels.max(1),
                base_array_layer: 0,
                layer_count: desc.layers.max(1),
            });
        unsafe { self.device.create_image_view(&info, None) }.map_err(|e| GsError::ImageCreation {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            reason: format!("view: {}", e),
        })
    }

    /// Start recording into frame `index` once its last submission is done
    fn begin_frame(&mut self, index: usize) -> Result<()> {
        let frame = &mut self.frames[index];
        unsafe {
            if frame.fence_value > 0 {
                if frame.fence_value > self.completed_fence {
                    self.device
                        .wait_for_fences(&[frame.fence], true, u64::MAX)
                        .map_err(vk_error("wait for fence"))?;
                    self.completed_fence = frame.fence_value;
                }
                self.device
                    .reset_fences(&[frame.fence])
                    .map_err(vk_error("reset fence"))?;
            }
            self.device
                .reset_descriptor_pool(frame.descriptor_pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(vk_error("reset descriptor pool"))?;
            self.device
                .reset_command_buffer(frame.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(vk_error("reset command buffer"))?;
            let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(frame.command_buffer, &begin)
                .map_err(vk_error("begin command buffer"))?;
        }
        for id in frame.transient_sets.drain(..) {
            self.descriptor_sets.remove(&id);
        }
        frame.pool_used = 0;
        self.current_frame = index;
        Ok(())
    }

    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        enum Info {
            Image(vk::DescriptorImageInfo),
            Buffer(vk::DescriptorBufferInfo),
        }
        let image_info = |image: vk::ImageView, layout: vk::ImageLayout, sampler: vk::Sampler| {
            Info::Image(vk::DescriptorImageInfo {
                sampler,
                image_view: image,
                image_layout: layout,
            })
        };

        let mut infos = Vec::with_capacity(writes.len());
        for write in writes {
            let entry = match *write {
                DescriptorWrite::UniformBufferDynamic { binding, buffer, range } => {
                    self.buffers.get(&buffer).map(|b| {
                        let info = vk::DescriptorBufferInfo {
                            buffer: b.buffer,
                            offset: 0,
                            range,
                        };
                        (binding, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, Info::Buffer(info))
                    })
                }
                DescriptorWrite::SampledImage { binding, image } => self.images.get(&image).map(|i| {
                    let info = image_info(i.sample_view(), convert::sampled_layout(i.layout), vk::Sampler::null());
                    (binding, vk::DescriptorType::SAMPLED_IMAGE, info)
                }),
                DescriptorWrite::Sampler { binding, sampler } => self.samplers.get(&sampler).map(|s| {
                    let info = image_info(vk::ImageView::null(), vk::ImageLayout::UNDEFINED, *s);
                    (binding, vk::DescriptorType::SAMPLER, info)
                }),
                DescriptorWrite::CombinedImageSampler { binding, image, sampler } => {
                    match (self.images.get(&image), self.samplers.get(&sampler)) {
                        (Some(i), Some(s)) => {
                            let info = image_info(i.sample_view(), convert::sampled_layout(i.layout), *s);
                            Some((binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, info))
                        }
                        _ => None,
                    }
                }
            };
            match entry {
                Some(entry) => infos.push(entry),
                None => log::error!("Descriptor write {:?} names a destroyed resource", write),
            }
        }

        let vk_writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .map(|(binding, ty, info)| {
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty);
                match info {
                    Info::Image(i) => write.image_info(std::slice::from_ref(i)).build(),
                    Info::Buffer(b) => write.buffer_info(std::slice::from_ref(b)).build(),
                }
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn allocate_from(
        &mut self,
        pool: vk::DescriptorPool,
        layout: DescriptorSetLayoutKind,
        writes: &[DescriptorWrite],
    ) -> std::result::Result<DescriptorSetId, vk::Result> {
        let layouts = [self.layouts.sets[set_layout_index(layout)]];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&info) }?[0];
        self.write_descriptor_set(set, writes);
        let id = DescriptorSetId(self.alloc_id());
        self.descriptor_sets.insert(id, set);
        Ok(id)
    }

    /// Vulkan layout for `layout`; present layouts need a swap chain device
    fn vk_layout(&self, layout: ImageLayout) -> (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags) {
        match layout {
            ImageLayout::PresentSrc if self.swapchain_loader.is_none() => (
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            ),
            _ => convert::layout_access(layout),
        }
    }
}

fn full_range(desc: &ImageDesc) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: convert::aspect(desc.format),
        base_mip_level: 0,
        level_count: desc.levels.max(1),
        base_array_layer: 0,
        layer_count: desc.layers.max(1),
    }
}

fn subresource_layers(aspect_mask: vk::ImageAspectFlags, level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask,
        mip_level: level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn buffer_image_copy(format: Format, region: &BufferImageCopy) -> vk::BufferImageCopy {
    let rect = region.rect;
    vk::BufferImageCopy {
        buffer_offset: region.buffer_offset,
        buffer_row_length: region.row_length,
        buffer_image_height: 0,
        image_subresource: subresource_layers(convert::data_aspect(format), region.level),
        image_offset: vk::Offset3D {
            x: rect.left.max(0),
            y: rect.top.max(0),
            z: 0,
        },
        image_extent: vk::Extent3D {
            width: rect.width().max(0) as u32,
            height: rect.height().max(0) as u32,
            depth: 1,
        },
    }
}

fn blit_offsets(rect: Rect) -> [vk::Offset3D; 2] {
    [
        vk::Offset3D {
            x: rect.left,
            y: rect.top,
            z: 0,
        },
        vk::Offset3D {
            x: rect.right,
            y: rect.bottom,
            z: 1,
        },
    ]
}

/// Ranking used to pick an adapter when none is named
pub(crate) fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 100,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 50,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 25,
        _ => 10,
    }
}

fn create_instance(entry: &ash::Entry, config: &VulkanConfig) -> Result<ash::Instance> {
    let app_name = c"gsrx";
    let app_info = vk::ApplicationInfo::builder()
        .application_name(app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(app_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let extensions = config
        .instance_extensions
        .iter()
        .map(|name| CString::new(name.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GsError::Config(format!("instance extension name: {}", e)))?;
    let extension_ptrs: Vec<_> = extensions.iter().map(|e| e.as_ptr()).collect();

    let mut layers = Vec::new();
    if config.validation {
        let available = entry.enumerate_instance_layer_properties().unwrap_or_default();
        let installed = available
            .iter()
            .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if installed {
            log::info!("Vulkan validation layer enabled");
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            log::warn!("Vulkan validation requested but the layer is not installed");
        }
    }

    let info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extension_ptrs)
        .enabled_layer_names(&layers);
    unsafe { entry.create_instance(&info, None) }.map_err(vk_error("instance creation"))
}

/// Best scoring adapter with a graphics queue, and that queue's family
unsafe fn select_physical_device(
    instance: &ash::Instance,
    preferred: Option<&str>,
) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = instance
        .enumerate_physical_devices()
        .map_err(vk_error("enumerate physical devices"))?;
    if devices.is_empty() {
        return Err(GsError::BackendUnavailable("No Vulkan-capable GPU found".to_string()));
    }

    let mut best: Option<(vk::PhysicalDevice, u32, u32)> = None;
    for physical_device in devices {
        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        let families = instance.get_physical_device_queue_family_properties(physical_device);
        let Some(family) = families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        else {
            log::debug!("Skipping {}: no graphics queue", name);
            continue;
        };
        let mut score = device_type_score(props.device_type);
        if preferred.is_some_and(|p| name.contains(p)) {
            score += 1000;
        }
        log::debug!("GPU candidate {} scored {}", name, score);
        if best.is_none_or(|(_, _, s)| score > s) {
            best = Some((physical_device, family as u32, score));
        }
    }
    best.map(|(physical_device, family, _)| (physical_device, family))
        .ok_or_else(|| GsError::BackendUnavailable("No GPU with a graphics queue".to_string()))
}

unsafe fn create_layouts(device: &ash::Device, geometry: bool) -> ash::prelude::VkResult<Layouts> {
    let vertex_stages = if geometry {
        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::GEOMETRY
    } else {
        vk::ShaderStageFlags::VERTEX
    };
    let binding = |binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags| {
        vk::DescriptorSetLayoutBinding::builder()
            .binding(binding)
            .descriptor_type(ty)
            .descriptor_count(1)
            .stage_flags(stages)
            .build()
    };
    let fragment = vk::ShaderStageFlags::FRAGMENT;
    let utility = [binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, fragment)];
    let uniforms = [
        binding(0, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, vertex_stages),
        binding(1, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, fragment),
    ];
    let textures: Vec<_> = (0..TFX_TEXTURE_SLOTS)
        .map(|i| binding(i, vk::DescriptorType::SAMPLED_IMAGE, fragment))
        .collect();
    let samplers: Vec<_> = (0..TFX_SAMPLER_SLOTS)
        .map(|i| binding(i, vk::DescriptorType::SAMPLER, fragment))
        .collect();

    let mut sets = [vk::DescriptorSetLayout::null(); 4];
    for (slot, bindings) in sets
        .iter_mut()
        .zip([&utility[..], &uniforms[..], &textures[..], &samplers[..]])
    {
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        *slot = device.create_descriptor_set_layout(&info, None)?;
    }

    let push = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        offset: 0,
        size: UTILITY_PUSH_CONSTANT_SIZE,
    }];
    let utility_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&sets[..1])
        .push_constant_ranges(&push);
    let utility = device.create_pipeline_layout(&utility_info, None)?;
    let tfx_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&sets[1..]);
    let tfx = device.create_pipeline_layout(&tfx_info, None)?;
    Ok(Layouts { sets, utility, tfx })
}

unsafe fn create_descriptor_pool(device: &ash::Device, sets: u32) -> ash::prelude::VkResult<vk::DescriptorPool> {
    let sizes = pool_sizes(sets.max(1));
    let info = vk::DescriptorPoolCreateInfo::builder()
        .max_sets(sets.max(1))
        .pool_sizes(&sizes);
    device.create_descriptor_pool(&info, None)
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &str {
        &self.device_name
    }

    fn limits(&self) -> BackendLimits {
        self.limits
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageId> {
        let fail = |reason: String| GsError::ImageCreation {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            reason,
        };
        let max = self.limits.max_image_dimension;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(fail(format!("dimensions must be in 1..={}", max)));
        }

        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert::format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.levels.max(1))
            .array_layers(desc.layers.max(1))
            .samples(convert::sample_count(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None) }.map_err(|e| fail(e.to_string()))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = match self.allocate_memory(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(reason) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(fail(reason));
            }
        };
        let views = unsafe { self.device.bind_image_memory(image, memory, 0) }
            .map_err(|e| fail(e.to_string()))
            .and_then(|()| self.create_view(image, desc, convert::aspect(desc.format)))
            .and_then(|view| {
                if !(desc.format.is_depth() && desc.usage.contains(ImageUsage::SAMPLED)) {
                    return Ok((view, None));
                }
                match self.create_view(image, desc, convert::data_aspect(desc.format)) {
                    Ok(depth_view) => Ok((view, Some(depth_view))),
                    Err(e) => {
                        unsafe { self.device.destroy_image_view(view, None) };
                        Err(e)
                    }
                }
            });
        let (view, depth_view) = match views {
            Ok(views) => views,
            Err(e) => {
                unsafe {
                    self.device.destroy_image(image, None);
                    self.device.free_memory(memory, None);
                }
                return Err(e);
            }
        };

        let id = ImageId(self.alloc_id());
        self.images.insert(
            id,
            Image {
                desc: *desc,
                image,
                memory: Some(memory),
                view,
                depth_view,
                layout: ImageLayout::Undefined,
            },
        );
        log::trace!("Image {} created: {}x{} {:?}", id.0, desc.width, desc.height, desc.format);
        Ok(id)
    }

    fn destroy_image(&mut self, image: ImageId) {
        let Some(entry) = self.images.remove(&image) else {
            log::warn!("Destroying unknown image {}", image.0);
            return;
        };
        unsafe {
            self.device.destroy_image_view(entry.view, None);
            if let Some(depth_view) = entry.depth_view {
                self.device.destroy_image_view(depth_view, None);
            }
            if let Some(memory) = entry.memory {
                self.device.destroy_image(entry.image, None);
                self.device.free_memory(memory, None);
            }
        }
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<BufferId> {
        let fail = |reason: String| GsError::BufferCreation { size, reason };
        let info = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(convert::buffer_usage(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }.map_err(|e| fail(e.to_string()))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let memory = match self.allocate_memory(requirements, flags) {
            Ok(memory) => memory,
            Err(reason) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(fail(reason));
            }
        };
        let mapped = unsafe {
            self.device
                .bind_buffer_memory(buffer, memory, 0)
                .and_then(|()| {
                    self.device
                        .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                })
                .map_err(|e| e.to_string())
                .and_then(|ptr| NonNull::new(ptr.cast::<u8>()).ok_or_else(|| "null mapping".to_string()))
        };
        let mapped = match mapped {
            Ok(mapped) => mapped,
            Err(reason) => {
                unsafe {
                    self.device.destroy_buffer(buffer, None);
                    self.device.free_memory(memory, None);
                }
                return Err(fail(reason));
            }
        };

        let id = BufferId(self.alloc_id());
        self.buffers.insert(
            id,
            Buffer {
                buffer,
                memory,
                mapped,
                size: size as usize,
            },
        );
        log::debug!("Buffer {} created: {} bytes, {:?}", id.0, size, usage);
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(entry) = self.buffers.remove(&buffer) {
            unsafe {
                self.device.unmap_memory(entry.memory);
                self.device.destroy_buffer(entry.buffer, None);
                self.device.free_memory(entry.memory, None);
            }
        }
    }

    fn buffer_memory(&mut self, buffer: BufferId) -> Option<&mut [u8]> {
        let entry = self.buffers.get_mut(&buffer)?;
        // SAFETY: the mapping covers `size` bytes of coherent memory and lives
        // until destroy_buffer, which needs `&mut self` like this borrow does.
        Some(unsafe { std::slice::from_raw_parts_mut(entry.mapped.as_ptr(), entry.size) })
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId> {
        let anisotropy = desc.anisotropy.clamp(1, self.limits.max_anisotropy.max(1));
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(convert::filter(desc.mag_filter))
            .min_filter(convert::filter(desc.min_filter))
            .mipmap_mode(convert::mipmap_mode(desc.mip_filter))
            .address_mode_u(convert::address_mode(desc.address_u))
            .address_mode_v(convert::address_mode(desc.address_v))
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .anisotropy_enable(anisotropy > 1)
            .max_anisotropy(anisotropy as f32)
            .min_lod(0.0)
            .max_lod(desc.max_lod as f32)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);
        let sampler = unsafe { self.device.create_sampler(&info, None) }.map_err(vk_error("sampler creation"))?;
        let id = SamplerId(self.alloc_id());
        self.samplers.insert(id, sampler);
        Ok(id)
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        if let Some(sampler) = self.samplers.remove(&sampler) {
            unsafe { self.device.destroy_sampler(sampler, None) };
        }
    }

    fn render_pass(&mut self, key: &RenderPassKey) -> Result<RenderPassId> {
        if let Some(id) = self.render_passes.get(key) {
            return Ok(*id);
        }

        let mut attachments = Vec::with_capacity(2);
        let mut color_refs = Vec::with_capacity(1);
        let mut depth_ref = None;
        if let Some(format) = key.color {
            color_refs.push(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            attachments.push(vk::AttachmentDescription {
                format: convert::format(format),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: convert::load_op(key.color_load),
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ..Default::default()
            });
        }
        if let Some(format) = key.depth {
            depth_ref = Some(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            });
            attachments.push(vk::AttachmentDescription {
                format: convert::format(format),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: convert::load_op(key.depth_load),
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: convert::load_op(key.stencil_load),
                stencil_store_op: vk::AttachmentStoreOp::STORE,
                initial_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            });
        }
        if attachments.is_empty() {
            return Err(GsError::RenderPass("render pass without attachments".to_string()));
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass.build()];
        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses);
        let pass = unsafe { self.device.create_render_pass(&info, None) }
            .map_err(|e| GsError::RenderPass(format!("creating {:?}: {}", key, e)))?;

        let id = RenderPassId(self.alloc_id());
        self.render_passes.insert(*key, id);
        self.render_pass_handles.insert(id, (pass, *key));
        log::debug!("Render pass {} created for {:?}", id.0, key);
        Ok(id)
    }

    fn create_framebuffer(
        &mut self,
        render_pass: RenderPassId,
        color: Option<ImageId>,
        depth: Option<ImageId>,
    ) -> Result<FramebufferId> {
        let (pass, key) = *self
            .render_pass_handles
            .get(&render_pass)
            .ok_or_else(|| GsError::RenderPass(format!("unknown render pass {}", render_pass.0)))?;

        let mut views = Vec::with_capacity(2);
        let mut extent: Option<(u32, u32)> = None;
        for id in [color, depth].into_iter().flatten() {
            let image = self
                .images
                .get(&id)
                .ok_or_else(|| GsError::RenderPass(format!("framebuffer attachment {} does not exist", id.0)))?;
            views.push(image.view);
            extent = Some(match extent {
                Some((w, h)) => (w.min(image.desc.width), h.min(image.desc.height)),
                None => (image.desc.width, image.desc.height),
            });
        }
        let (width, height) =
            extent.ok_or_else(|| GsError::RenderPass("framebuffer without attachments".to_string()))?;

        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(pass)
            .attachments(&views)
            .width(width)
            .height(height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&info, None) }
            .map_err(|e| GsError::RenderPass(format!("framebuffer: {}", e)))?;
        let id = FramebufferId(self.alloc_id());
        self.framebuffers.insert(id, Framebuffer { framebuffer, key });
        Ok(id)
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) {
        if let Some(entry) = self.framebuffers.remove(&framebuffer) {
            unsafe { self.device.destroy_framebuffer(entry.framebuffer, None) };
        }
    }

    fn create_shader_module(&mut self, desc: &ShaderModuleDesc<'_>) -> Result<ShaderModuleId> {
        let words = shader::compile_glsl(desc.stage, desc.source)?;
        let info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe { self.device.create_shader_module(&info, None) }.map_err(|e| {
            GsError::ShaderCompilation {
                stage: desc.stage,
                reason: e.to_string(),
            }
        })?;
        let id = ShaderModuleId(self.alloc_id());
        self.shaders.insert(id, (desc.stage, module));
        log::debug!("{:?} {:?} module {} created ({} words)", desc.program, desc.stage, id.0, words.len());
        Ok(id)
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleId) {
        if let Some((_, module)) = self.shaders.remove(&module) {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> Result<PipelineId> {
        let (pass, key) = *self
            .render_pass_handles
            .get(&desc.render_pass)
            .ok_or_else(|| GsError::PipelineCreation(format!("unknown render pass {}", desc.render_pass.0)))?;
        if desc.geometry_shader.is_some() && self.features.geometry_shader != vk::TRUE {
            return Err(GsError::PipelineCreation("device has no geometry shader support".to_string()));
        }
        let b = &desc.blend;
        let dual_source = b.enable
            && [b.src_color, b.dst_color, b.src_alpha, b.dst_alpha]
                .iter()
                .any(|f| matches!(f, BlendFactor::Src1Alpha | BlendFactor::InvSrc1Alpha));
        if dual_source && self.features.dual_src_blend != vk::TRUE {
            return Err(GsError::PipelineCreation("device has no dual source blending".to_string()));
        }

        let mut stages = Vec::with_capacity(3);
        for id in [Some(desc.vertex_shader), desc.geometry_shader, desc.fragment_shader]
            .into_iter()
            .flatten()
        {
            let (stage, module) = *self
                .shaders
                .get(&id)
                .ok_or_else(|| GsError::PipelineCreation(format!("unknown shader module {}", id.0)))?;
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(convert::shader_stage(stage))
                    .module(module)
                    .name(ENTRY_POINT)
                    .build(),
            );
        }

        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: desc.vertex_layout.stride(),
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes = convert::vertex_attributes(desc.vertex_layout);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::builder().topology(convert::topology(desc.topology));
        let viewport = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let ds = &desc.depth_stencil;
        let stencil = convert::stencil_state(&ds.stencil);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(ds.depth_test)
            .depth_write_enable(ds.depth_write)
            .depth_compare_op(convert::compare_op(ds.depth_compare))
            .stencil_test_enable(ds.stencil_test)
            .front(stencil)
            .back(stencil);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState {
            blend_enable: b.enable.into(),
            src_color_blend_factor: convert::blend_factor(b.src_color),
            dst_color_blend_factor: convert::blend_factor(b.dst_color),
            color_blend_op: convert::blend_op(b.color_op),
            src_alpha_blend_factor: convert::blend_factor(b.src_alpha),
            dst_alpha_blend_factor: convert::blend_factor(b.dst_alpha),
            alpha_blend_op: convert::blend_op(b.alpha_op),
            color_write_mask: convert::color_write_mask(b.write_mask),
        }];
        let color_count = usize::from(key.color.is_some());
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments[..color_count]);
        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::BLEND_CONSTANTS,
        ];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(self.layouts.pipeline(desc.layout))
            .render_pass(pass)
            .subpass(0)
            .build();
        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| GsError::PipelineCreation(e.to_string()))?;
        let pipeline = pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GsError::PipelineCreation("driver returned no pipeline".to_string()))?;

        let id = PipelineId(self.alloc_id());
        self.pipelines.insert(id, pipeline);
        log::debug!("Pipeline {} created ({:?}, {:?})", id.0, desc.layout, desc.topology);
        Ok(id)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        if let Some(pipeline) = self.pipelines.remove(&pipeline) {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
    }

    fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutKind,
        writes: &[DescriptorWrite],
    ) -> Option<DescriptorSetId> {
        let index = self.current_frame;
        if self.frames[index].pool_used >= self.config.descriptor_pool_capacity {
            return None;
        }
        let pool = self.frames[index].descriptor_pool;
        match self.allocate_from(pool, layout, writes) {
            Ok(id) => {
                let frame = &mut self.frames[index];
                frame.pool_used += 1;
                frame.transient_sets.push(id);
                Some(id)
            }
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => None,
            Err(e) => {
                log::error!("Descriptor set allocation failed: {}", e);
                None
            }
        }
    }

    fn allocate_persistent_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutKind,
        writes: &[DescriptorWrite],
    ) -> Result<DescriptorSetId> {
        let pool = self.persistent_pool;
        self.allocate_from(pool, layout, writes).map_err(|e| {
            log::error!("Persistent descriptor set allocation failed: {}", e);
            GsError::DescriptorPoolExhausted("allocating a persistent descriptor set")
        })
    }

    fn cmd_image_barrier(&mut self, image: ImageId, old: ImageLayout, new: ImageLayout) {
        let cmd = self.cmd();
        let (old_layout, src_access, src_stage) = self.vk_layout(old);
        let (new_layout, dst_access, dst_stage) = self.vk_layout(new);
        let Some(entry) = self.images.get_mut(&image) else {
            log::warn!("Barrier on unknown image {}", image.0);
            return;
        };
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(entry.image)
            .subresource_range(full_range(&entry.desc))
            .build();
        entry.layout = new;
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn cmd_begin_render_pass(
        &mut self,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        area: Rect,
        clear_values: &[ClearValue],
    ) {
        let (Some(&(pass, key)), Some(fb)) = (
            self.render_pass_handles.get(&render_pass),
            self.framebuffers.get(&framebuffer),
        ) else {
            log::error!("Begin of unknown render pass {} / framebuffer {}", render_pass.0, framebuffer.0);
            return;
        };
        if !key.is_compatible(&fb.key) {
            log::warn!("Framebuffer {} built for {:?} used with {:?}", framebuffer.0, fb.key, key);
        }
        let attachments = usize::from(key.color.is_some()) + usize::from(key.depth.is_some());
        let mut values: Vec<vk::ClearValue> = clear_values.iter().map(|v| convert::clear_value(*v)).collect();
        if values.len() < attachments {
            values.resize(attachments, vk::ClearValue::default());
        }
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(pass)
            .framebuffer(fb.framebuffer)
            .render_area(convert::rect2d(area))
            .clear_values(&values);
        unsafe {
            self.device
                .cmd_begin_render_pass(self.cmd(), &info, vk::SubpassContents::INLINE)
        };
        self.in_render_pass = true;
    }

    fn cmd_end_render_pass(&mut self) {
        if self.in_render_pass {
            unsafe { self.device.cmd_end_render_pass(self.cmd()) };
            self.in_render_pass = false;
        }
    }

    fn cmd_bind_pipeline(&mut self, pipeline: PipelineId) {
        match self.pipelines.get(&pipeline) {
            Some(&handle) => unsafe {
                self.device
                    .cmd_bind_pipeline(self.cmd(), vk::PipelineBindPoint::GRAPHICS, handle)
            },
            None => log::error!("Binding unknown pipeline {}", pipeline.0),
        }
    }

    fn cmd_bind_vertex_buffer(&mut self, buffer: BufferId, offset: u64) {
        if let Some(entry) = self.buffers.get(&buffer) {
            unsafe {
                self.device
                    .cmd_bind_vertex_buffers(self.cmd(), 0, &[entry.buffer], &[offset])
            };
        }
    }

    fn cmd_bind_index_buffer(&mut self, buffer: BufferId, offset: u64) {
        if let Some(entry) = self.buffers.get(&buffer) {
            unsafe {
                self.device
                    .cmd_bind_index_buffer(self.cmd(), entry.buffer, offset, vk::IndexType::UINT32)
            };
        }
    }

    fn cmd_bind_descriptor_sets(
        &mut self,
        layout: PipelineLayoutKind,
        first_set: u32,
        sets: &[DescriptorSetId],
        dynamic_offsets: &[u32],
    ) {
        let Some(handles) = sets
            .iter()
            .map(|id| self.descriptor_sets.get(id).copied())
            .collect::<Option<Vec<_>>>()
        else {
            log::error!("Binding released descriptor sets {:?}", sets);
            return;
        };
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.cmd(),
                vk::PipelineBindPoint::GRAPHICS,
                self.layouts.pipeline(layout),
                first_set,
                &handles,
                dynamic_offsets,
            );
        }
    }

    fn cmd_push_constants(&mut self, layout: PipelineLayoutKind, data: &[u8]) {
        if layout != PipelineLayoutKind::Utility || data.len() > UTILITY_PUSH_CONSTANT_SIZE as usize {
            log::error!("{} push constant bytes don't fit the {:?} layout", data.len(), layout);
            return;
        }
        unsafe {
            self.device.cmd_push_constants(
                self.cmd(),
                self.layouts.utility,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                data,
            );
        }
    }

    fn cmd_set_viewport(&mut self, viewport: &Viewport) {
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.device.cmd_set_viewport(self.cmd(), 0, &[viewport]) };
    }

    fn cmd_set_scissor(&mut self, scissor: Rect) {
        unsafe {
            self.device
                .cmd_set_scissor(self.cmd(), 0, &[convert::rect2d(scissor)])
        };
    }

    fn cmd_set_blend_constants(&mut self, constants: [f32; 4]) {
        unsafe { self.device.cmd_set_blend_constants(self.cmd(), &constants) };
    }

    fn cmd_draw(&mut self, vertex_count: u32, first_vertex: u32) {
        unsafe { self.device.cmd_draw(self.cmd(), vertex_count, 1, first_vertex, 0) };
    }

    fn cmd_draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32) {
        unsafe {
            self.device
                .cmd_draw_indexed(self.cmd(), index_count, 1, first_index, vertex_offset, 0)
        };
    }

    fn cmd_clear_color_image(&mut self, image: ImageId, layout: ImageLayout, color: [f32; 4]) {
        let Some(entry) = self.images.get(&image) else {
            log::warn!("Clearing unknown image {}", image.0);
            return;
        };
        let value = convert::clear_color(entry.desc.format, color);
        let range = full_range(&entry.desc);
        unsafe {
            self.device
                .cmd_clear_color_image(self.cmd(), entry.image, self.vk_layout(layout).0, &value, &[range])
        };
    }

    fn cmd_clear_depth_stencil_image(
        &mut self,
        image: ImageId,
        layout: ImageLayout,
        depth: f32,
        stencil: u32,
        aspects: ClearAspects,
    ) {
        let Some(entry) = self.images.get(&image) else {
            log::warn!("Clearing unknown image {}", image.0);
            return;
        };
        let value = vk::ClearDepthStencilValue { depth, stencil };
        let range = vk::ImageSubresourceRange {
            aspect_mask: convert::clear_aspects(aspects),
            ..full_range(&entry.desc)
        };
        unsafe {
            self.device.cmd_clear_depth_stencil_image(
                self.cmd(),
                entry.image,
                self.vk_layout(layout).0,
                &value,
                &[range],
            )
        };
    }

    fn cmd_copy_image(
        &mut self,
        src: ImageId,
        src_layout: ImageLayout,
        dst: ImageId,
        dst_layout: ImageLayout,
        regions: &[ImageCopy],
    ) {
        let (Some(s), Some(d)) = (self.images.get(&src), self.images.get(&dst)) else {
            log::warn!("Copy between unknown images {} -> {}", src.0, dst.0);
            return;
        };
        let copies: Vec<vk::ImageCopy> = regions
            .iter()
            .map(|r| vk::ImageCopy {
                src_subresource: subresource_layers(convert::aspect(s.desc.format), r.src_level),
                src_offset: vk::Offset3D {
                    x: r.src_x,
                    y: r.src_y,
                    z: 0,
                },
                dst_subresource: subresource_layers(convert::aspect(d.desc.format), r.dst_level),
                dst_offset: vk::Offset3D {
                    x: r.dst_x,
                    y: r.dst_y,
                    z: 0,
                },
                extent: vk::Extent3D {
                    width: r.width,
                    height: r.height,
                    depth: 1,
                },
            })
            .collect();
        unsafe {
            self.device.cmd_copy_image(
                self.cmd(),
                s.image,
                self.vk_layout(src_layout).0,
                d.image,
                self.vk_layout(dst_layout).0,
                &copies,
            )
        };
    }

    fn cmd_blit_image(
        &mut self,
        src: ImageId,
        src_layout: ImageLayout,
        src_rect: Rect,
        dst: ImageId,
        dst_layout: ImageLayout,
        dst_rect: Rect,
        filter: Filter,
    ) {
        let (Some(s), Some(d)) = (self.images.get(&src), self.images.get(&dst)) else {
            log::warn!("Blit between unknown images {} -> {}", src.0, dst.0);
            return;
        };
        let filter = if s.desc.format.is_depth() {
            Filter::Nearest
        } else {
            filter
        };
        let region = vk::ImageBlit {
            src_subresource: subresource_layers(convert::aspect(s.desc.format), 0),
            src_offsets: blit_offsets(src_rect),
            dst_subresource: subresource_layers(convert::aspect(d.desc.format), 0),
            dst_offsets: blit_offsets(dst_rect),
        };
        unsafe {
            self.device.cmd_blit_image(
                self.cmd(),
                s.image,
                self.vk_layout(src_layout).0,
                d.image,
                self.vk_layout(dst_layout).0,
                &[region],
                convert::filter(filter),
            )
        };
    }

    fn cmd_copy_buffer_to_image(
        &mut self,
        buffer: BufferId,
        image: ImageId,
        layout: ImageLayout,
        region: &BufferImageCopy,
    ) {
        let (Some(b), Some(i)) = (self.buffers.get(&buffer), self.images.get(&image)) else {
            log::warn!("Upload from buffer {} to unknown image {}", buffer.0, image.0);
            return;
        };
        let copy = buffer_image_copy(i.desc.format, region);
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(self.cmd(), b.buffer, i.image, self.vk_layout(layout).0, &[copy])
        };
    }

    fn cmd_copy_image_to_buffer(
        &mut self,
        image: ImageId,
        layout: ImageLayout,
        buffer: BufferId,
        region: &BufferImageCopy,
    ) {
        let (Some(i), Some(b)) = (self.images.get(&image), self.buffers.get(&buffer)) else {
            log::warn!("Readback of unknown image {} into buffer {}", image.0, buffer.0);
            return;
        };
        let copy = buffer_image_copy(i.desc.format, region);
        let host_read = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(b.buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        let cmd = self.cmd();
        unsafe {
            self.device
                .cmd_copy_image_to_buffer(cmd, i.image, self.vk_layout(layout).0, b.buffer, &[copy]);
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[host_read],
                &[],
            );
        }
    }

    fn current_fence(&self) -> FenceValue {
        self.current_fence
    }

    fn completed_fence(&mut self) -> FenceValue {
        for frame in &self.frames {
            if frame.fence_value > self.completed_fence
                && unsafe { self.device.get_fence_status(frame.fence) }.unwrap_or(false)
            {
                self.completed_fence = self.completed_fence.max(frame.fence_value);
            }
        }
        self.completed_fence
    }

    fn submit(&mut self) -> Result<FenceValue> {
        if self.in_render_pass {
            log::warn!("Command buffer submitted with an open render pass");
            self.cmd_end_render_pass();
        }
        let index = self.current_frame;
        let (command_buffer, fence) = (self.frames[index].command_buffer, self.frames[index].fence);
        unsafe { self.device.end_command_buffer(command_buffer) }.map_err(vk_error("end command buffer"))?;

        let wait_semaphores: Vec<vk::Semaphore> = self
            .swap_chain
            .as_mut()
            .and_then(SwapChain::take_pending_wait)
            .into_iter()
            .collect();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .build();
        unsafe { self.device.queue_submit(self.queue, &[submit], fence) }.map_err(vk_error("queue submit"))?;

        let fence_value = self.current_fence;
        self.frames[index].fence_value = fence_value;
        self.current_fence += 1;
        log::trace!("Submitted command buffer {} (fence {})", index, fence_value);
        self.begin_frame((index + 1) % self.frames.len())?;
        Ok(fence_value)
    }

    fn wait_for_fence(&mut self, fence: FenceValue) -> Result<()> {
        if fence >= self.current_fence {
            return Err(GsError::RenderPass(format!(
                "waiting on fence {} which has not been submitted",
                fence
            )));
        }
        if fence <= self.completed_fence {
            return Ok(());
        }
        // A slot reused since then was waited on before reuse
        let Some(frame) = self.frames.iter().find(|f| f.fence_value == fence) else {
            self.completed_fence = self.completed_fence.max(fence);
            return Ok(());
        };
        unsafe { self.device.wait_for_fences(&[frame.fence], true, u64::MAX) }
            .map_err(vk_error("wait for fence"))?;
        self.completed_fence = fence;
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(vk_error("wait idle"))?;
        self.completed_fence = self.current_fence - 1;
        Ok(())
    }

    fn create_swap_chain(&mut self, window: &WindowInfo) -> Result<SwapChainInfo> {
        self.release_swap_chain();
        match window.handle {
            WindowHandle::Headless => self.create_offscreen_swap_chain(window),
            WindowHandle::Native(raw) => self.create_surface_swap_chain(raw, window),
        }
    }

    fn destroy_swap_chain(&mut self) {
        self.release_swap_chain();
    }

    fn acquire_next_image(&mut self) -> Result<ImageId> {
        self.acquire_swap_image()
    }

    fn present(&mut self, image: ImageId) -> Result<()> {
        self.present_swap_image(image)
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan backend");
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("Wait before teardown failed: {}", e);
            }
        }
        self.release_swap_chain();
        unsafe {
            for (_, image) in self.images.drain() {
                self.device.destroy_image_view(image.view, None);
                if let Some(depth_view) = image.depth_view {
                    self.device.destroy_image_view(depth_view, None);
                }
                if let Some(memory) = image.memory {
                    self.device.destroy_image(image.image, None);
                    self.device.free_memory(memory, None);
                }
            }
            for (_, buffer) in self.buffers.drain() {
                self.device.unmap_memory(buffer.memory);
                self.device.destroy_buffer(buffer.buffer, None);
                self.device.free_memory(buffer.memory, None);
            }
            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, (_, module)) in self.shaders.drain() {
                self.device.destroy_shader_module(module, None);
            }
            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, framebuffer) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(framebuffer.framebuffer, None);
            }
            for (_, (pass, _)) in self.render_pass_handles.drain() {
                self.device.destroy_render_pass(pass, None);
            }
            for frame in &self.frames {
                self.device.destroy_fence(frame.fence, None);
                self.device.destroy_descriptor_pool(frame.descriptor_pool, None);
            }
            self.device.destroy_descriptor_pool(self.persistent_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_pipeline_layout(self.layouts.utility, None);
            self.device.destroy_pipeline_layout(self.layouts.tfx, None);
            for layout in self.layouts.sets {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            self.device.destroy_device(None);
            if let Some(loader) = &self.surface_loader {
                for surface in self.owned_surfaces.drain(..) {
                    loader.destroy_surface(surface, None);
                }
            }
            self.instance.destroy_instance(None);
        }
    }
}
