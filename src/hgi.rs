// Hgi - the renderer-facing entry point
//
// Owns frame boundaries and is the only caller of the reset and garbage
// collection pass. Frames nest; the pass runs when the outermost frame ends,
// or after every submission when no frame is open.

use crate::backend::{BufferDesc, SamplerDesc, TextureDesc};
use crate::cmds::BlitCmds;
use crate::command_buffer::WaitMode;
use crate::config::Config;
use crate::device::Device;
use crate::garbage_collector::{Collectable, GarbageCollector};
use crate::resources::{
    Buffer, ComputePipeline, GraphicsPipeline, ResourceBindings, Sampler, ShaderFunction,
    ShaderFunctionDesc, ShaderProgram, Texture,
};
use anyhow::Result;
use ash::vk;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

pub struct Hgi {
    device: Arc<Device>,
    collector: Arc<GarbageCollector>,
    frame_depth: AtomicU32,
    main_thread: ThreadId,
}

impl Hgi {
    /// An Hgi sharing the process-wide garbage collector
    pub fn new(device: Arc<Device>) -> Self {
        Self::with_garbage_collector(device, GarbageCollector::global())
    }

    pub fn with_garbage_collector(device: Arc<Device>, collector: Arc<GarbageCollector>) -> Self {
        log::info!("Hgi created on {}", device.id());
        Self {
            device,
            collector,
            frame_depth: AtomicU32::new(0),
            main_thread: thread::current().id(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(Device::from_config(config)?))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn garbage_collector(&self) -> &Arc<GarbageCollector> {
        &self.collector
    }

    fn check_main_thread(&self, what: &str) -> bool {
        let on_main = thread::current().id() == self.main_thread;
        if !on_main {
            log::error!("{} called off the Hgi's main thread", what);
        }
        on_main
    }

    // =========================================================================
    // FRAMES AND SUBMISSION
    // =========================================================================

    pub fn start_frame(&self) {
        if !self.check_main_thread("start_frame") {
            return;
        }
        let depth = self.frame_depth.fetch_add(1, Ordering::Relaxed) + 1;
        log::trace!("Frame started (depth {})", depth);
    }

    pub fn end_frame(&self) {
        if !self.check_main_thread("end_frame") {
            return;
        }
        let depth = self.frame_depth.load(Ordering::Relaxed);
        if depth == 0 {
            log::error!("end_frame without a matching start_frame");
            return;
        }
        self.frame_depth.store(depth - 1, Ordering::Relaxed);
        if depth == 1 {
            self.end_of_frame_cleanup();
        }
    }

    pub fn frame_depth(&self) -> u32 {
        self.frame_depth.load(Ordering::Relaxed)
    }

    /// Submit everything `cmds` recorded. With `WaitUntilCompleted` the
    /// work has executed and its completion handlers have run on return.
    pub fn submit_cmds(&self, cmds: &mut BlitCmds, wait: WaitMode) {
        if !self.check_main_thread("submit_cmds") {
            return;
        }
        if cmds.is_submitted() {
            log::error!("Blit cmds submitted twice");
            return;
        }

        self.device
            .command_queue()
            .submit_to_queue(cmds.command_buffer(), wait);
        cmds.mark_submitted();

        if self.frame_depth() == 0 {
            self.end_of_frame_cleanup();
        }
    }

    /// Reclaim consumed command buffers, then free unreferenced trash
    pub fn end_of_frame_cleanup(&self) {
        if !self.check_main_thread("end_of_frame_cleanup") {
            return;
        }
        self.device
            .command_queue()
            .reset_consumed_command_buffers(WaitMode::NoWait);
        self.collector.perform_garbage_collection(&self.device);
    }

    pub fn inflight_bits(&self) -> u64 {
        self.device.command_queue().inflight_bits()
    }

    pub fn create_blit_cmds(&self) -> BlitCmds {
        BlitCmds::new(self.device.clone())
    }

    // =========================================================================
    // RESOURCE CREATION
    // =========================================================================

    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer> {
        Buffer::new(self.device.clone(), desc)
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> Result<Texture> {
        Texture::new(self.device.clone(), desc)
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Sampler> {
        Sampler::new(self.device.clone(), desc)
    }

    pub fn create_shader_function(&self, desc: &ShaderFunctionDesc) -> Result<ShaderFunction> {
        ShaderFunction::new(self.device.clone(), desc)
    }

    pub fn create_shader_program(
        &self,
        debug_name: &str,
        layouts: Vec<vk::DescriptorSetLayout>,
    ) -> ShaderProgram {
        ShaderProgram::from_native(self.device.clone(), debug_name, layouts)
    }

    pub fn create_resource_bindings(
        &self,
        debug_name: &str,
        pool: vk::DescriptorPool,
    ) -> ResourceBindings {
        ResourceBindings::from_native(self.device.clone(), debug_name, pool)
    }

    pub fn create_graphics_pipeline(
        &self,
        debug_name: &str,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
    ) -> GraphicsPipeline {
        GraphicsPipeline::from_native(self.device.clone(), debug_name, pipeline, layout)
    }

    pub fn create_compute_pipeline(
        &self,
        debug_name: &str,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
    ) -> ComputePipeline {
        ComputePipeline::from_native(self.device.clone(), debug_name, pipeline, layout)
    }

    // =========================================================================
    // DEFERRED DESTRUCTION
    // =========================================================================

    fn destroy<T: Collectable>(&self, object: T) {
        if object.device().id() != self.device.id() {
            log::error!("Destroying a {} that belongs to {}", T::TYPE, object.device().id());
        }
        self.collector.trash(object);
    }

    pub fn destroy_buffer(&self, buffer: Buffer) {
        self.destroy(buffer);
    }

    pub fn destroy_texture(&self, texture: Texture) {
        self.destroy(texture);
    }

    pub fn destroy_sampler(&self, sampler: Sampler) {
        self.destroy(sampler);
    }

    pub fn destroy_shader_function(&self, function: ShaderFunction) {
        self.destroy(function);
    }

    pub fn destroy_shader_program(&self, program: ShaderProgram) {
        self.destroy(program);
    }

    pub fn destroy_resource_bindings(&self, bindings: ResourceBindings) {
        self.destroy(bindings);
    }

    pub fn destroy_graphics_pipeline(&self, pipeline: GraphicsPipeline) {
        self.destroy(pipeline);
    }

    pub fn destroy_compute_pipeline(&self, pipeline: ComputePipeline) {
        self.destroy(pipeline);
    }
}

impl Drop for Hgi {
    fn drop(&mut self) {
        log::info!("Hgi on {} shutting down", self.device.id());
        self.device.wait_for_idle();
        self.collector.collect_all(&self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CompletionMode, HeadlessDevice};
    use crate::garbage_collector::ResourceType;

    fn hgi(mode: CompletionMode) -> (Arc<HeadlessDevice>, Hgi) {
        let headless = Arc::new(HeadlessDevice::new(mode));
        let device = Device::new(headless.clone(), &Config::default());
        (headless, Hgi::with_garbage_collector(device, GarbageCollector::new()))
    }

    fn sampler(hgi: &Hgi) -> Sampler {
        hgi.create_sampler(&SamplerDesc::default()).unwrap()
    }

    #[test]
    fn nested_frames_collect_once_at_the_outermost_end() {
        let (headless, hgi) = hgi(CompletionMode::Immediate);
        hgi.start_frame();
        hgi.start_frame();
        hgi.destroy_sampler(sampler(&hgi));

        hgi.end_frame();
        assert_eq!(hgi.frame_depth(), 1);
        assert_eq!(headless.live_object_count(), 1);

        hgi.end_frame();
        assert_eq!(hgi.frame_depth(), 0);
        assert_eq!(headless.live_object_count(), 0);
    }

    #[test]
    fn unbalanced_end_frame_is_ignored() {
        let (_headless, hgi) = hgi(CompletionMode::Immediate);
        hgi.end_frame();
        assert_eq!(hgi.frame_depth(), 0);
    }

    #[test]
    fn submissions_outside_a_frame_collect_immediately() {
        let (headless, hgi) = hgi(CompletionMode::Immediate);
        let target = hgi
            .create_buffer(&BufferDesc {
                size: 16,
                ..Default::default()
            })
            .unwrap();

        let mut cmds = hgi.create_blit_cmds();
        cmds.fill_buffer(&target, 0, vk::WHOLE_SIZE, 7);
        hgi.destroy_buffer(target);
        assert_eq!(
            hgi.garbage_collector().pending(ResourceType::Buffer),
            1
        );

        hgi.submit_cmds(&mut cmds, WaitMode::NoWait);
        assert_eq!(hgi.inflight_bits(), 0);
        assert_eq!(hgi.garbage_collector().pending(ResourceType::Buffer), 0);
        assert_eq!(headless.live_object_count(), 0);
    }

    #[test]
    fn cmds_are_submitted_only_once() {
        let (headless, hgi) = hgi(CompletionMode::Immediate);
        let target = hgi
            .create_buffer(&BufferDesc {
                size: 4,
                ..Default::default()
            })
            .unwrap();
        let mut cmds = hgi.create_blit_cmds();
        cmds.fill_buffer(&target, 0, 4, 1);
        hgi.submit_cmds(&mut cmds, WaitMode::NoWait);
        hgi.submit_cmds(&mut cmds, WaitMode::NoWait);
        assert_eq!(headless.submitted_count(), 1);
    }

    #[test]
    fn drop_releases_pinned_trash() {
        let (headless, hgi) = hgi(CompletionMode::Manual);
        let mut cmds = hgi.create_blit_cmds();
        cmds.memory_barrier();
        hgi.destroy_sampler(sampler(&hgi));

        // Recording cmds that are never submitted still pin the sampler
        hgi.end_of_frame_cleanup();
        assert_eq!(headless.live_object_count(), 1);

        drop(hgi);
        assert_eq!(headless.live_object_count(), 0);
        drop(cmds);
    }

    #[test]
    fn wrapped_objects_are_collected_by_kind() {
        let (headless, hgi) = hgi(CompletionMode::Immediate);
        let layout = headless.create_descriptor_set_layout();
        let pool = headless.create_descriptor_pool();
        let (pipeline, pipeline_layout) = headless.create_pipeline();

        hgi.start_frame();
        hgi.destroy_shader_program(hgi.create_shader_program("lit", vec![layout]));
        hgi.destroy_resource_bindings(hgi.create_resource_bindings("lit", pool));
        hgi.destroy_graphics_pipeline(hgi.create_graphics_pipeline("lit", pipeline, pipeline_layout));
        let collector = hgi.garbage_collector();
        assert_eq!(collector.pending(ResourceType::ShaderProgram), 1);
        assert_eq!(collector.pending(ResourceType::ResourceBindings), 1);
        assert_eq!(collector.pending(ResourceType::GraphicsPipeline), 1);

        hgi.end_frame();
        assert_eq!(collector.pending_total(hgi.device().id()), 0);
        assert_eq!(headless.live_object_count(), 0);
    }
}
