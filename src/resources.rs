// GPU objects handed out by the Hgi
//
// Every object owns its native handles and destroys them on drop. Callers
// never drop live objects directly; `Hgi::destroy_*` hands them to the
// garbage collector, which drops them once the GPU is done with them.

use crate::backend::{BufferDesc, NativeObject, SamplerDesc, TextureDesc};
use crate::device::Device;
use crate::garbage_collector::{Collectable, GarbageCollector, ResourceType, TrashList};
use anyhow::{ensure, Context, Result};
use ash::vk;
use std::sync::Arc;

/// State shared by every GPU object kind
struct GpuObject {
    device: Arc<Device>,
    debug_name: String,
    native: NativeObject,
    inflight_bits: u64,
}

impl GpuObject {
    fn new(device: Arc<Device>, debug_name: &str, native: NativeObject) -> Self {
        Self {
            device,
            debug_name: debug_name.to_string(),
            native,
            inflight_bits: 0,
        }
    }
}

impl Drop for GpuObject {
    fn drop(&mut self) {
        log::trace!("Destroying {:?} ({})", self.debug_name, self.device.id());
        self.device.native().destroy_object(self.native.clone());
    }
}

macro_rules! collectable {
    ($type:ident, $kind:expr, $list:ident) => {
        impl $type {
            pub fn debug_name(&self) -> &str {
                &self.object.debug_name
            }

            pub fn native(&self) -> &NativeObject {
                &self.object.native
            }
        }

        impl Collectable for $type {
            const TYPE: ResourceType = $kind;

            fn device(&self) -> &Arc<Device> {
                &self.object.device
            }

            fn inflight_bits(&self) -> u64 {
                self.object.inflight_bits
            }

            fn set_inflight_bits(&mut self, bits: u64) {
                self.object.inflight_bits = bits;
            }

            fn trash_list(collector: &GarbageCollector) -> &TrashList<Self> {
                &collector.$list
            }
        }

        impl std::fmt::Debug for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($type))
                    .field("debug_name", &self.object.debug_name)
                    .field("native", &self.object.native)
                    .field("device", &self.object.device.id())
                    .finish()
            }
        }
    };
}

// =============================================================================
// BUFFER
// =============================================================================

pub struct Buffer {
    object: GpuObject,
    size: vk::DeviceSize,
    host_visible: bool,
}

impl Buffer {
    pub fn new(device: Arc<Device>, desc: &BufferDesc) -> Result<Self> {
        let buffer = device
            .native()
            .create_buffer(desc)
            .with_context(|| format!("Failed to create buffer {:?}", desc.debug_name))?;
        log::debug!("Created buffer {:?} ({} bytes)", desc.debug_name, desc.size);

        Ok(Self {
            object: GpuObject::new(device, &desc.debug_name, NativeObject::Buffer(buffer)),
            size: desc.size,
            host_visible: desc.host_visible,
        })
    }

    pub fn vk_buffer(&self) -> vk::Buffer {
        match self.object.native {
            NativeObject::Buffer(buffer) => buffer,
            _ => vk::Buffer::null(),
        }
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    /// Write directly into host-visible memory
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        ensure!(self.host_visible, "Buffer {:?} is not host visible", self.debug_name());
        self.object
            .device
            .native()
            .write_buffer(self.vk_buffer(), offset, data)
    }

    /// Read host-visible memory. Only meaningful once the GPU writes landed.
    pub fn read(&self, offset: vk::DeviceSize, out: &mut [u8]) -> Result<()> {
        ensure!(self.host_visible, "Buffer {:?} is not host visible", self.debug_name());
        self.object
            .device
            .native()
            .read_buffer(self.vk_buffer(), offset, out)
    }
}

collectable!(Buffer, ResourceType::Buffer, buffers);

// =============================================================================
// TEXTURE
// =============================================================================

pub struct Texture {
    object: GpuObject,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl Texture {
    pub fn new(device: Arc<Device>, desc: &TextureDesc) -> Result<Self> {
        let (image, view) = device
            .native()
            .create_texture(desc)
            .with_context(|| format!("Failed to create texture {:?}", desc.debug_name))?;
        log::debug!(
            "Created texture {:?} ({}x{} {:?})",
            desc.debug_name,
            desc.extent.width,
            desc.extent.height,
            desc.format
        );

        Ok(Self {
            object: GpuObject::new(device, &desc.debug_name, NativeObject::Texture { image, view }),
            format: desc.format,
            extent: desc.extent,
        })
    }

    pub fn vk_image(&self) -> vk::Image {
        match self.object.native {
            NativeObject::Texture { image, .. } => image,
            _ => vk::Image::null(),
        }
    }

    pub fn vk_image_view(&self) -> vk::ImageView {
        match self.object.native {
            NativeObject::Texture { view, .. } => view,
            _ => vk::ImageView::null(),
        }
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

collectable!(Texture, ResourceType::Texture, textures);

// =============================================================================
// SAMPLER
// =============================================================================

pub struct Sampler {
    object: GpuObject,
}

impl Sampler {
    pub fn new(device: Arc<Device>, desc: &SamplerDesc) -> Result<Self> {
        let sampler = device
            .native()
            .create_sampler(desc)
            .with_context(|| format!("Failed to create sampler {:?}", desc.debug_name))?;

        Ok(Self {
            object: GpuObject::new(device, &desc.debug_name, NativeObject::Sampler(sampler)),
        })
    }

    pub fn vk_sampler(&self) -> vk::Sampler {
        match self.object.native {
            NativeObject::Sampler(sampler) => sampler,
            _ => vk::Sampler::null(),
        }
    }
}

collectable!(Sampler, ResourceType::Sampler, samplers);

// =============================================================================
// SHADERS
// =============================================================================

/// One shader stage compiled to SPIR-V
#[derive(Debug, Clone)]
pub struct ShaderFunctionDesc {
    pub debug_name: String,
    pub stage: vk::ShaderStageFlags,
    pub entry_point: String,
    pub spirv: Vec<u8>,
}

impl Default for ShaderFunctionDesc {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            stage: vk::ShaderStageFlags::COMPUTE,
            entry_point: "main".to_string(),
            spirv: Vec::new(),
        }
    }
}

pub struct ShaderFunction {
    object: GpuObject,
    stage: vk::ShaderStageFlags,
    entry_point: String,
}

impl ShaderFunction {
    pub fn new(device: Arc<Device>, desc: &ShaderFunctionDesc) -> Result<Self> {
        let module = device
            .native()
            .create_shader_module(&desc.spirv)
            .with_context(|| format!("Failed to create shader function {:?}", desc.debug_name))?;
        log::debug!("Created {:?} shader {:?}", desc.stage, desc.debug_name);

        Ok(Self {
            object: GpuObject::new(device, &desc.debug_name, NativeObject::ShaderModule(module)),
            stage: desc.stage,
            entry_point: desc.entry_point.clone(),
        })
    }

    pub fn vk_shader_module(&self) -> vk::ShaderModule {
        match self.object.native {
            NativeObject::ShaderModule(module) => module,
            _ => vk::ShaderModule::null(),
        }
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }
}

collectable!(ShaderFunction, ResourceType::ShaderFunction, shader_functions);

/// Descriptor set layouts reflected from a set of shader functions
pub struct ShaderProgram {
    object: GpuObject,
}

impl ShaderProgram {
    /// Take ownership of layouts built by the program builder
    pub fn from_native(
        device: Arc<Device>,
        debug_name: &str,
        layouts: Vec<vk::DescriptorSetLayout>,
    ) -> Self {
        Self {
            object: GpuObject::new(device, debug_name, NativeObject::DescriptorSetLayouts(layouts)),
        }
    }

    pub fn descriptor_set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        match &self.object.native {
            NativeObject::DescriptorSetLayouts(layouts) => layouts,
            _ => &[],
        }
    }
}

collectable!(ShaderProgram, ResourceType::ShaderProgram, shader_programs);

// =============================================================================
// BINDINGS AND PIPELINES
// =============================================================================

/// Descriptor sets, owned through the pool they were allocated from
pub struct ResourceBindings {
    object: GpuObject,
}

impl ResourceBindings {
    pub fn from_native(device: Arc<Device>, debug_name: &str, pool: vk::DescriptorPool) -> Self {
        Self {
            object: GpuObject::new(device, debug_name, NativeObject::DescriptorPool(pool)),
        }
    }

    pub fn vk_descriptor_pool(&self) -> vk::DescriptorPool {
        match self.object.native {
            NativeObject::DescriptorPool(pool) => pool,
            _ => vk::DescriptorPool::null(),
        }
    }
}

collectable!(ResourceBindings, ResourceType::ResourceBindings, resource_bindings);

pub struct GraphicsPipeline {
    object: GpuObject,
}

impl GraphicsPipeline {
    pub fn from_native(
        device: Arc<Device>,
        debug_name: &str,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
    ) -> Self {
        Self {
            object: GpuObject::new(device, debug_name, NativeObject::Pipeline { pipeline, layout }),
        }
    }

    pub fn vk_pipeline(&self) -> vk::Pipeline {
        pipeline_handles(&self.object.native).0
    }

    pub fn vk_pipeline_layout(&self) -> vk::PipelineLayout {
        pipeline_handles(&self.object.native).1
    }
}

collectable!(GraphicsPipeline, ResourceType::GraphicsPipeline, graphics_pipelines);

pub struct ComputePipeline {
    object: GpuObject,
}

impl ComputePipeline {
    pub fn from_native(
        device: Arc<Device>,
        debug_name: &str,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
    ) -> Self {
        Self {
            object: GpuObject::new(device, debug_name, NativeObject::Pipeline { pipeline, layout }),
        }
    }

    pub fn vk_pipeline(&self) -> vk::Pipeline {
        pipeline_handles(&self.object.native).0
    }

    pub fn vk_pipeline_layout(&self) -> vk::PipelineLayout {
        pipeline_handles(&self.object.native).1
    }
}

collectable!(ComputePipeline, ResourceType::ComputePipeline, compute_pipelines);

fn pipeline_handles(native: &NativeObject) -> (vk::Pipeline, vk::PipelineLayout) {
    match native {
        NativeObject::Pipeline { pipeline, layout } => (*pipeline, *layout),
        _ => (vk::Pipeline::null(), vk::PipelineLayout::null()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CompletionMode, HeadlessDevice};
    use crate::config::Config;
    use ash::vk::Handle;

    fn device() -> (Arc<HeadlessDevice>, Arc<Device>) {
        let headless = Arc::new(HeadlessDevice::new(CompletionMode::Immediate));
        let device = Device::new(headless.clone(), &Config::default());
        (headless, device)
    }

    #[test]
    fn drop_destroys_native_handles() {
        let (headless, device) = device();
        let texture = Texture::new(
            device.clone(),
            &TextureDesc {
                debug_name: "albedo".to_string(),
                extent: vk::Extent2D { width: 4, height: 4 },
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(headless.live_object_count(), 2);
        assert!(headless.is_alive(texture.vk_image_view().as_raw()));

        drop(texture);
        assert_eq!(headless.live_object_count(), 0);
    }

    #[test]
    fn host_visible_buffers_round_trip_bytes() {
        let (_headless, device) = device();
        let buffer = Buffer::new(
            device,
            &BufferDesc {
                debug_name: "staging".to_string(),
                size: 16,
                ..Default::default()
            },
        )
        .unwrap();
        buffer.write(4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 6];
        buffer.read(2, &mut out).unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn device_local_buffers_refuse_cpu_access() {
        let (_headless, device) = device();
        let buffer = Buffer::new(
            device,
            &BufferDesc {
                size: 16,
                host_visible: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(buffer.write(0, &[0; 4]).is_err());
    }

    #[test]
    fn invalid_spirv_is_an_error() {
        let (_headless, device) = device();
        let desc = ShaderFunctionDesc {
            debug_name: "broken".to_string(),
            spirv: vec![1, 2, 3],
            ..Default::default()
        };
        let error = ShaderFunction::new(device, &desc).unwrap_err();
        assert!(format!("{:#}", error).contains("broken"));
    }

    #[test]
    fn wrapped_pipelines_own_their_layout() {
        let (headless, device) = device();
        let (pipeline, layout) = headless.create_pipeline();
        let compute = ComputePipeline::from_native(device, "blur", pipeline, layout);
        assert_eq!(compute.vk_pipeline_layout(), layout);
        assert_eq!(ComputePipeline::TYPE, ResourceType::ComputePipeline);

        drop(compute);
        assert!(!headless.is_alive(pipeline.as_raw()));
        assert!(!headless.is_alive(layout.as_raw()));
    }
}
