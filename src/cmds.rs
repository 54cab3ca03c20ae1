// Blit cmds - transfer and debug commands recorded for one submission
//
// The command buffer is acquired on the first recorded command, from the
// pool of whichever thread records. Cmds that never record anything submit
// as a no-op.

use crate::backend::{BufferDesc, NativeDevice, NativeObject};
use crate::command_buffer::CommandBufferRef;
use crate::device::Device;
use crate::resources::Buffer;
use anyhow::{ensure, Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

const DEBUG_GROUP_COLOR: [f32; 4] = [0.2, 0.6, 1.0, 1.0];
const DEBUG_MARKER_COLOR: [f32; 4] = [1.0, 0.8, 0.2, 1.0];

pub struct BlitCmds {
    device: Arc<Device>,
    command_buffer: Option<CommandBufferRef>,
    submitted: bool,
    debug_depth: u32,
}

impl BlitCmds {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            command_buffer: None,
            submitted: false,
            debug_depth: 0,
        }
    }

    /// The native buffer to record into, acquired on first use
    fn recording_buffer(&mut self, what: &str) -> Option<vk::CommandBuffer> {
        if self.submitted {
            log::error!("{} recorded into blit cmds that were already submitted", what);
            return None;
        }
        let device = &self.device;
        let buffer = self
            .command_buffer
            .get_or_insert_with(|| device.command_queue().acquire_command_buffer());
        Some(buffer.vk_command_buffer())
    }

    pub fn push_debug_group(&mut self, label: &str) {
        if !self.device.debug_enabled() {
            return;
        }
        if let Some(command_buffer) = self.recording_buffer("Debug group") {
            self.device
                .native()
                .cmd_begin_label(command_buffer, label, DEBUG_GROUP_COLOR);
            self.debug_depth += 1;
        }
    }

    pub fn pop_debug_group(&mut self) {
        if !self.device.debug_enabled() {
            return;
        }
        if self.debug_depth == 0 {
            log::error!("Popping a debug group that was never pushed");
            return;
        }
        if let Some(command_buffer) = self.recording_buffer("Debug group") {
            self.device.native().cmd_end_label(command_buffer);
            self.debug_depth -= 1;
        }
    }

    pub fn insert_debug_marker(&mut self, label: &str) {
        if !self.device.debug_enabled() {
            return;
        }
        if let Some(command_buffer) = self.recording_buffer("Debug marker") {
            self.device
                .native()
                .cmd_insert_label(command_buffer, label, DEBUG_MARKER_COLOR);
        }
    }

    /// Fill `size` bytes (or `vk::WHOLE_SIZE`) with a repeated 32-bit value
    pub fn fill_buffer(&mut self, buffer: &Buffer, offset: vk::DeviceSize, size: vk::DeviceSize, value: u32) {
        if let Some(command_buffer) = self.recording_buffer("Fill") {
            self.device
                .native()
                .cmd_fill_buffer(command_buffer, buffer.vk_buffer(), offset, size, value);
        }
    }

    pub fn copy_buffer(
        &mut self,
        src: &Buffer,
        src_offset: vk::DeviceSize,
        dst: &Buffer,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        if let Some(command_buffer) = self.recording_buffer("Copy") {
            self.device.native().cmd_copy_buffer(
                command_buffer,
                src.vk_buffer(),
                dst.vk_buffer(),
                vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size,
                },
            );
        }
    }

    /// Copy GPU-written contents of a host-visible buffer into `destination`
    /// once the work recorded so far has completed.
    ///
    /// `destination` is resized to `size` and filled from a completion
    /// handler, so it holds the data by the time a `WaitUntilCompleted`
    /// submission returns.
    pub fn copy_buffer_gpu_to_cpu(
        &mut self,
        src: &Buffer,
        offset: vk::DeviceSize,
        size: usize,
        destination: Arc<Mutex<Vec<u8>>>,
    ) -> Result<()> {
        ensure!(!self.submitted, "Readback recorded into blit cmds that were already submitted");
        ensure!(
            src.is_host_visible(),
            "Readback source {:?} is not host visible",
            src.debug_name()
        );
        ensure!(
            offset
                .checked_add(size as vk::DeviceSize)
                .is_some_and(|end| end <= src.size()),
            "Readback of {} bytes at {} overruns {:?}",
            size,
            offset,
            src.debug_name()
        );

        self.memory_barrier();
        let Some(buffer) = &self.command_buffer else {
            return Ok(());
        };

        let native = self.device.native().clone();
        let vk_buffer = src.vk_buffer();
        buffer.add_completed_handler(move || {
            let mut data = destination.lock();
            data.resize(size, 0);
            if let Err(e) = native.read_buffer(vk_buffer, offset, &mut data) {
                log::error!("GPU to CPU copy failed: {:#}", e);
            }
        });
        Ok(())
    }

    /// Upload `data` into `dst` ahead of all regular work of the next
    /// submission. Main thread only.
    pub fn upload_buffer(&mut self, data: &[u8], dst: &Buffer, dst_offset: vk::DeviceSize) -> Result<()> {
        ensure!(!self.submitted, "Upload recorded into blit cmds that were already submitted");
        if data.is_empty() {
            return Ok(());
        }

        let staging = StagingBuffer::new(
            self.device.native().clone(),
            &BufferDesc {
                debug_name: format!("{} staging", dst.debug_name()),
                size: data.len() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                host_visible: true,
            },
        )?;
        self.device
            .native()
            .write_buffer(staging.buffer, 0, data)
            .context("Failed to fill upload staging buffer")?;

        let resource = self.device.command_queue().acquire_resource_command_buffer();
        self.device.native().cmd_copy_buffer(
            resource.vk_command_buffer(),
            staging.buffer,
            dst.vk_buffer(),
            vk::BufferCopy {
                src_offset: 0,
                dst_offset,
                size: data.len() as vk::DeviceSize,
            },
        );
        // Freed once the upload has executed, or with the resource buffer
        // if it never runs
        resource.add_completed_handler(move || drop(staging));
        Ok(())
    }

    pub fn memory_barrier(&mut self) {
        if let Some(command_buffer) = self.recording_buffer("Memory barrier") {
            self.device.native().cmd_memory_barrier(command_buffer);
        }
    }

    /// The buffer recorded into so far; `None` if nothing was recorded
    pub fn command_buffer(&self) -> Option<&CommandBufferRef> {
        self.command_buffer.as_ref()
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    pub(crate) fn mark_submitted(&mut self) {
        if self.debug_depth > 0 {
            log::warn!("Blit cmds submitted with {} open debug groups", self.debug_depth);
        }
        self.submitted = true;
    }
}

impl Drop for BlitCmds {
    fn drop(&mut self) {
        if self.submitted {
            return;
        }
        // An unsubmitted round would pin every later trashed object
        if let Some(buffer) = self.command_buffer.take() {
            log::debug!("Blit cmds dropped without being submitted");
            self.device.command_queue().discard_command_buffer(&buffer);
        }
    }
}

/// Upload source memory owned by a completion handler.
///
/// Holds the native device rather than the `Device`: the handler lives in a
/// command buffer the device owns.
struct StagingBuffer {
    native: Arc<dyn NativeDevice>,
    buffer: vk::Buffer,
}

impl StagingBuffer {
    fn new(native: Arc<dyn NativeDevice>, desc: &BufferDesc) -> Result<Self> {
        let buffer = native
            .create_buffer(desc)
            .with_context(|| format!("Failed to create {:?}", desc.debug_name))?;
        Ok(Self { native, buffer })
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        self.native.destroy_object(NativeObject::Buffer(self.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CompletionMode, HeadlessDevice};
    use crate::command_buffer::{CommandBufferState, WaitMode};
    use crate::backend::SamplerDesc;
    use crate::config::Config;
    use crate::garbage_collector::{GarbageCollector, ResourceType};
    use crate::resources::Sampler;

    fn device(debug: bool) -> (Arc<HeadlessDevice>, Arc<Device>) {
        let headless = Arc::new(HeadlessDevice::new(CompletionMode::Immediate));
        let mut config = Config::default();
        config.debug.enabled = debug;
        let device = Device::new(headless.clone(), &config);
        (headless, device)
    }

    fn buffer(device: &Arc<Device>, name: &str, size: vk::DeviceSize) -> Buffer {
        Buffer::new(
            device.clone(),
            &BufferDesc {
                debug_name: name.to_string(),
                size,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn nothing_recorded_means_no_command_buffer() {
        let (_headless, device) = device(false);
        let mut cmds = BlitCmds::new(device.clone());
        // Labels are skipped entirely without debug
        cmds.push_debug_group("frame");
        cmds.pop_debug_group();
        assert!(cmds.command_buffer().is_none());
        assert_eq!(device.command_queue().inflight_bits(), 0);
    }

    #[test]
    fn first_command_acquires_a_recording_buffer() {
        let (headless, device) = device(true);
        let mut cmds = BlitCmds::new(device);
        cmds.push_debug_group("upload");
        cmds.insert_debug_marker("halfway");
        cmds.pop_debug_group();

        let buffer = cmds.command_buffer().unwrap();
        assert_eq!(buffer.state(), CommandBufferState::Recording);
        assert_eq!(
            headless.recorded_labels(buffer.vk_command_buffer()),
            vec!["upload".to_string(), "halfway".to_string()]
        );
    }

    #[test]
    fn readback_lands_in_the_completion_handler() {
        let (_headless, device) = device(false);
        let target = buffer(&device, "target", 8);
        let result = Arc::new(Mutex::new(Vec::new()));

        let mut cmds = BlitCmds::new(device.clone());
        cmds.fill_buffer(&target, 0, vk::WHOLE_SIZE, 0x0403_0201);
        cmds.copy_buffer_gpu_to_cpu(&target, 4, 4, result.clone()).unwrap();
        assert!(result.lock().is_empty());

        let queue = device.command_queue();
        queue.submit_to_queue(cmds.command_buffer(), WaitMode::WaitUntilCompleted);
        assert_eq!(*result.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn readback_bounds_are_checked() {
        let (_headless, device) = device(false);
        let target = buffer(&device, "target", 8);
        let mut cmds = BlitCmds::new(device);
        let result = Arc::new(Mutex::new(Vec::new()));
        assert!(cmds.copy_buffer_gpu_to_cpu(&target, 4, 8, result).is_err());
    }

    #[test]
    fn uploads_go_through_the_resource_buffer() {
        let (headless, device) = device(false);
        let dst = buffer(&device, "vertices", 4);
        let live_before = headless.live_object_count();

        let mut cmds = BlitCmds::new(device.clone());
        cmds.upload_buffer(&[9, 8, 7, 6], &dst, 0).unwrap();
        assert!(cmds.command_buffer().is_none());
        // Staging buffer alive until the upload executes
        assert_eq!(headless.live_object_count(), live_before + 1);

        device
            .command_queue()
            .submit_to_queue(cmds.command_buffer(), WaitMode::WaitUntilCompleted);
        let mut out = [0u8; 4];
        dst.read(0, &mut out).unwrap();
        assert_eq!(out, [9, 8, 7, 6]);
        assert_eq!(headless.live_object_count(), live_before);
    }

    #[test]
    fn dropping_unsubmitted_cmds_unpins_later_trash() {
        let (headless, device) = device(false);
        let collector = GarbageCollector::new();
        let target = buffer(&device, "target", 4);

        let mut cmds = BlitCmds::new(device.clone());
        cmds.fill_buffer(&target, 0, 4, 1);
        assert_eq!(device.command_queue().inflight_bits().count_ones(), 1);
        drop(cmds);
        assert_eq!(device.command_queue().inflight_bits(), 0);

        for _ in 0..5 {
            collector.trash(Sampler::new(device.clone(), &SamplerDesc::default()).unwrap());
            device.wait_for_idle();
            collector.perform_garbage_collection(&device);
        }
        assert_eq!(collector.pending(ResourceType::Sampler), 0);
        // Only the fill target is left
        assert_eq!(headless.live_object_count(), 1);
    }

    #[test]
    fn pending_upload_does_not_keep_the_device_alive() {
        let (headless, device) = device(false);
        let dst = buffer(&device, "vertices", 4);
        let mut cmds = BlitCmds::new(device.clone());
        cmds.upload_buffer(&[1, 2, 3, 4], &dst, 0).unwrap();
        assert_eq!(headless.live_object_count(), 2);

        drop(cmds);
        drop(dst);
        assert_eq!(Arc::strong_count(&device), 1);
        drop(device);

        // Staging memory went with the unsubmitted resource buffer
        assert_eq!(headless.live_object_count(), 0);
        assert_eq!(headless.command_buffer_count(), 0);
    }

    #[test]
    fn huge_readback_offsets_are_rejected() {
        let (_headless, device) = device(false);
        let target = buffer(&device, "target", 8);
        let mut cmds = BlitCmds::new(device);
        let result = Arc::new(Mutex::new(Vec::new()));
        assert!(cmds
            .copy_buffer_gpu_to_cpu(&target, u64::MAX, 4, result)
            .is_err());
    }

    #[test]
    fn submitted_cmds_ignore_new_commands() {
        let (_headless, device) = device(false);
        let target = buffer(&device, "target", 4);
        let mut cmds = BlitCmds::new(device.clone());
        cmds.fill_buffer(&target, 0, 4, 0);
        cmds.mark_submitted();

        cmds.fill_buffer(&target, 0, 4, 1);
        cmds.memory_barrier();
        assert!(cmds.is_submitted());
        assert_eq!(device.command_queue().inflight_bits().count_ones(), 1);
    }
}
