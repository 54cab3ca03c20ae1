// Backend module - native device seam
//
// The command queue and garbage collector never call Vulkan directly.
// They go through `NativeDevice`, which speaks in ash handle types so the
// real backend is a thin pass-through and the headless backend can mint
// handles of its own.

pub mod headless;
pub mod vulkan;

pub use headless::{CompletionMode, HeadlessDevice};
pub use vulkan::VulkanDevice;

use anyhow::Result;
use ash::vk;
use std::time::Duration;

/// One native queue submission: a single command buffer guarded by its own fence.
#[derive(Debug, Clone, Copy)]
pub struct QueueSubmission {
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    /// Semaphore to wait on, and the stage that waits for it
    pub wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal_semaphore: Option<vk::Semaphore>,
}

/// Buffer creation parameters
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub debug_name: String,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Host-visible buffers can be written and read back from the CPU
    pub host_visible: bool,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            size: 0,
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            host_visible: true,
        }
    }
}

/// Texture creation parameters (2D, single sample)
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub debug_name: String,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub layer_count: u32,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent2D { width: 1, height: 1 },
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            mip_levels: 1,
            layer_count: 1,
        }
    }
}

/// Sampler creation parameters
#[derive(Debug, Clone)]
pub struct SamplerDesc {
    pub debug_name: String,
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        }
    }
}

/// Native handles owned by one GPU object, destroyed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeObject {
    Buffer(vk::Buffer),
    Texture { image: vk::Image, view: vk::ImageView },
    Sampler(vk::Sampler),
    ShaderModule(vk::ShaderModule),
    DescriptorSetLayouts(Vec<vk::DescriptorSetLayout>),
    /// Destroying the pool frees every set allocated from it
    DescriptorPool(vk::DescriptorPool),
    Pipeline {
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
    },
}

/// The native operations the core needs from a logical device and its
/// single graphics queue.
///
/// Implementations must be callable from any thread. Vulkan's external
/// synchronization rules still apply: one command buffer (and its pool) is
/// only ever touched by one thread at a time, which the command queue
/// guarantees. Access to the queue handle is serialized by the backend.
pub trait NativeDevice: Send + Sync {
    /// Human readable device name for logs
    fn name(&self) -> &str;

    // Command pools and buffers
    fn create_command_pool(&self) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    /// Reset without releasing the buffer's memory back to the pool
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    // Synchronization
    fn create_fence(&self) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;
    /// Block until the fence signals. Running out of `timeout` is an error.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Queue
    fn queue_submit(&self, submission: &QueueSubmission) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;

    // Recording
    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, label: &str, color: [f32; 4]);
    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer);
    fn cmd_insert_label(&self, command_buffer: vk::CommandBuffer, label: &str, color: [f32; 4]);
    fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    );
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );
    /// Full memory barrier: all prior writes visible to all later accesses
    fn cmd_memory_barrier(&self, command_buffer: vk::CommandBuffer);

    // Resources
    fn create_buffer(&self, desc: &BufferDesc) -> Result<vk::Buffer>;
    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()>;
    fn read_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, out: &mut [u8]) -> Result<()>;
    fn create_texture(&self, desc: &TextureDesc) -> Result<(vk::Image, vk::ImageView)>;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler>;
    fn create_shader_module(&self, spirv: &[u8]) -> Result<vk::ShaderModule>;
    fn destroy_object(&self, object: NativeObject);
}
