// Vulkan backend - NativeDevice on top of ash
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU)
// - Logical device + single graphics queue
// - Memory allocator setup, allocations tracked per native handle

use super::{BufferDesc, NativeDevice, NativeObject, QueueSubmission, SamplerDesc, TextureDesc};
use anyhow::{Context, Result};
use ash::extensions::ext::DebugUtils;
use ash::vk::{self, Handle};
use ash::Entry;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::borrow::Cow;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;
use std::time::Duration;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Taken and dropped before the logical device is destroyed
    allocator: Mutex<Option<Allocator>>,
    /// Memory backing buffers and images, keyed by raw handle
    allocations: Mutex<HashMap<u64, Allocation>>,

    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue access must be externally synchronized
    graphics_queue: Mutex<vk::Queue>,
    pub graphics_queue_family: u32,

    debug_utils: DebugUtils,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,

    pub properties: vk::PhysicalDeviceProperties,
    name: String,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, app_name, enable_validation)?;

        let debug_utils = DebugUtils::new(&entry, &instance);
        let debug_messenger = if enable_validation {
            Some(Self::setup_debug_messenger(&debug_utils)?)
        } else {
            None
        };

        let (physical_device, graphics_queue_family) = Self::pick_physical_device(&instance)?;

        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        log::info!("Selected GPU: {}", name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            allocator: Mutex::new(Some(allocator)),
            allocations: Mutex::new(HashMap::new()),
            device,
            physical_device,
            instance,
            _entry: entry,
            graphics_queue: Mutex::new(graphics_queue),
            graphics_queue_family,
            debug_utils,
            debug_messenger,
            properties,
            name,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("hgi-vulkan")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Labels need debug utils even when validation is off
        let extensions = [DebugUtils::name().as_ptr()];

        // A missing validation layer downgrades to a warning, not a failure
        let validation_available = enable_validation && {
            let layers = entry
                .enumerate_instance_layer_properties()
                .context("Failed to enumerate instance layers")?;
            let found = layers.iter().any(|layer| {
                (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
            });
            if !found {
                log::warn!(
                    "{} requested but not installed, continuing without validation",
                    VALIDATION_LAYER.to_string_lossy()
                );
            }
            found
        };
        let layer_names: Vec<*const c_char> = if validation_available {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> Result<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok(messenger)
    }

    /// The GPU with a queue family able to run both blit and compute work,
    /// discrete before integrated before anything else
    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let wanted = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate GPUs")?;

        devices
            .into_iter()
            .filter_map(|device| {
                let props = unsafe { instance.get_physical_device_properties(device) };
                let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
                let family = unsafe { instance.get_physical_device_queue_family_properties(device) }
                    .iter()
                    .position(|family| family.queue_flags.contains(wanted));
                let Some(family) = family else {
                    log::debug!("Skipping {:?}: no graphics + compute queue", name);
                    return None;
                };
                let rank = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 2,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                    _ => 0,
                };
                log::debug!("GPU candidate {:?}, queue family {}, rank {}", name, family, rank);
                Some((rank, device, family as u32))
            })
            .max_by_key(|(rank, _, _)| *rank)
            .map(|(_, device, family)| (device, family))
            .context("No GPU with a graphics + compute queue found")
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator.as_mut().context("Allocator already destroyed")?;

        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for {:?}", name))
    }

    fn free_allocation(&self, handle: u64) {
        let Some(allocation) = self.allocations.lock().remove(&handle) else {
            return;
        };
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free allocation: {}", e);
            }
        }
    }

    fn with_mapped<R>(
        &self,
        buffer: vk::Buffer,
        f: impl FnOnce(&mut [u8]) -> Result<R>,
    ) -> Result<R> {
        let mut allocations = self.allocations.lock();
        let allocation = allocations
            .get_mut(&buffer.as_raw())
            .context("Unknown buffer")?;
        let mapped = allocation
            .mapped_slice_mut()
            .context("Buffer is not host visible")?;
        f(mapped)
    }
}

impl NativeDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.graphics_queue_family)
            // TRANSIENT: Command buffers are short-lived
            // RESET: Allow individual buffer reset
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );

        unsafe { self.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?;

        buffers
            .into_iter()
            .next()
            .context("Driver returned no command buffer")
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
            .context("Failed to begin command buffer")
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
            .context("Failed to end command buffer")
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        // Per-frame memory needs are stable, keep the pool reservations
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .context("Failed to reset command buffer")
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        let fence_info = vk::FenceCreateInfo::builder();
        unsafe { self.device.create_fence(&fence_info, None) }.context("Failed to create fence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        unsafe { self.device.get_fence_status(fence) }.context("Failed to query fence status")
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
            .with_context(|| format!("Fence wait failed after {:?}", timeout))
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]) }.context("Failed to reset fence")
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create semaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn queue_submit(&self, submission: &QueueSubmission) -> Result<()> {
        let command_buffers = [submission.command_buffer];
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) =
            submission.wait_semaphore.into_iter().unzip();
        let signal_semaphores: Vec<_> = submission.signal_semaphore.into_iter().collect();

        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores)
            .build();

        let queue = self.graphics_queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit_info], submission.fence) }
            .context("Failed to submit command buffer")
    }

    fn wait_idle(&self) -> Result<()> {
        // Device idle implies access to every queue
        let _queue = self.graphics_queue.lock();
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")
    }

    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, label: &str, color: [f32; 4]) {
        let name = CString::new(label).unwrap_or_default();
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name).color(color);
        unsafe {
            self.debug_utils
                .cmd_begin_debug_utils_label(command_buffer, &label)
        };
    }

    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.debug_utils.cmd_end_debug_utils_label(command_buffer) };
    }

    fn cmd_insert_label(&self, command_buffer: vk::CommandBuffer, label: &str, color: [f32; 4]) {
        let name = CString::new(label).unwrap_or_default();
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name).color(color);
        unsafe {
            self.debug_utils
                .cmd_insert_debug_utils_label(command_buffer, &label)
        };
    }

    fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) {
        unsafe {
            self.device
                .cmd_fill_buffer(command_buffer, buffer, offset, size, data)
        };
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, &[region]) };
    }

    fn cmd_memory_barrier(&self, command_buffer: vk::CommandBuffer) {
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(
                vk::AccessFlags::MEMORY_READ
                    | vk::AccessFlags::MEMORY_WRITE
                    | vk::AccessFlags::HOST_READ,
            )
            .build();

        // Host is a destination too, readbacks run after the fence
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS | vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            )
        };
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let allocation = match self.allocate(&desc.debug_name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        self.allocations.lock().insert(buffer.as_raw(), allocation);
        if let Err(e) = bound {
            self.destroy_object(NativeObject::Buffer(buffer));
            return Err(e).context("Failed to bind buffer memory");
        }
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        self.with_mapped(buffer, |mapped| {
            let dst = mapped_range(offset, data.len())
                .and_then(|range| mapped.get_mut(range))
                .context("Buffer write out of bounds")?;
            dst.copy_from_slice(data);
            Ok(())
        })
    }

    fn read_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, out: &mut [u8]) -> Result<()> {
        self.with_mapped(buffer, |mapped| {
            let src = mapped_range(offset, out.len())
                .and_then(|range| mapped.get(range))
                .context("Buffer read out of bounds")?;
            out.copy_from_slice(src);
            Ok(())
        })
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<(vk::Image, vk::ImageView)> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.layer_count)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .context("Failed to create image")?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation =
            match self.allocate(&desc.debug_name, requirements, MemoryLocation::GpuOnly, false) {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { self.device.destroy_image(image, None) };
                    return Err(e);
                }
            };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        self.allocations.lock().insert(image.as_raw(), allocation);
        // The image owns the allocation from here on; failures release both
        let release_image = || {
            unsafe { self.device.destroy_image(image, None) };
            self.free_allocation(image.as_raw());
        };
        if let Err(e) = bound {
            release_image();
            return Err(e).context("Failed to bind image memory");
        }

        let view_type = if desc.layer_count > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(view_type)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_mask_for(desc.format),
                base_mip_level: 0,
                level_count: desc.mip_levels,
                base_array_layer: 0,
                layer_count: desc.layer_count,
            });

        match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => Ok((image, view)),
            Err(e) => {
                release_image();
                Err(e).context("Failed to create image view")
            }
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .max_lod(vk::LOD_CLAMP_NONE);

        unsafe { self.device.create_sampler(&sampler_info, None) }
            .context("Failed to create sampler")
    }

    fn create_shader_module(&self, spirv: &[u8]) -> Result<vk::ShaderModule> {
        // SPIR-V uses 4-byte words; read_spv copies into aligned storage
        let code = ash::util::read_spv(&mut std::io::Cursor::new(spirv))
            .context("Invalid SPIR-V bytecode")?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        unsafe { self.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")
    }

    fn destroy_object(&self, object: NativeObject) {
        unsafe {
            match object {
                NativeObject::Buffer(buffer) => {
                    self.device.destroy_buffer(buffer, None);
                    self.free_allocation(buffer.as_raw());
                }
                NativeObject::Texture { image, view } => {
                    self.device.destroy_image_view(view, None);
                    self.device.destroy_image(image, None);
                    self.free_allocation(image.as_raw());
                }
                NativeObject::Sampler(sampler) => self.device.destroy_sampler(sampler, None),
                NativeObject::ShaderModule(module) => {
                    self.device.destroy_shader_module(module, None)
                }
                NativeObject::DescriptorSetLayouts(layouts) => {
                    for layout in layouts {
                        self.device.destroy_descriptor_set_layout(layout, None);
                    }
                }
                NativeObject::DescriptorPool(pool) => {
                    self.device.destroy_descriptor_pool(pool, None)
                }
                NativeObject::Pipeline { pipeline, layout } => {
                    self.device.destroy_pipeline(pipeline, None);
                    self.device.destroy_pipeline_layout(layout, None);
                }
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Allocations still alive here belong to leaked objects
        let leaked: Vec<u64> = self.allocations.lock().keys().copied().collect();
        if !leaked.is_empty() {
            log::warn!("{} allocations still alive at device teardown", leaked.len());
        }
        for handle in leaked {
            self.free_allocation(handle);
        }
        drop(self.allocator.lock().take());

        unsafe {
            if let Some(messenger) = self.debug_messenger.take() {
                self.debug_utils
                    .destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// `offset..offset + len` within a mapping; `None` on overflow
fn mapped_range(offset: vk::DeviceSize, len: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    Some(start..start.checked_add(len)?)
}

fn aspect_mask_for(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Log target for messages coming back from the validation layer
const VALIDATION_TARGET: &str = "hgi_vulkan::validation";

unsafe fn lossy<'a>(ptr: *const c_char) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed("-")
    } else {
        CStr::from_ptr(ptr).to_string_lossy()
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let Some(data) = p_callback_data.as_ref() else {
        return vk::FALSE;
    };

    let level = if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else {
        log::Level::Debug
    };
    log::log!(
        target: VALIDATION_TARGET,
        level,
        "{:?} {}: {}",
        message_type,
        lossy(data.p_message_id_name),
        lossy(data.p_message)
    );

    vk::FALSE
}
