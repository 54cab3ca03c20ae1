// Headless backend - a software device with no GPU
//
// Native handles are minted from a counter. Submitted work sits in a FIFO
// "hardware queue" until it is retired, either immediately on submit or when
// the owner calls `retire_next` / `retire_all`. Retiring a submission runs
// its recorded transfer commands against host memory, signals its semaphore
// and then its fence.
//
// Native-API preconditions the real driver would only catch with validation
// layers (double begin, resetting pending work, waiting on a fence nothing
// will ever signal, ...) are reported as errors here.

use super::{BufferDesc, NativeDevice, NativeObject, QueueSubmission, SamplerDesc, TextureDesc};
use anyhow::{bail, Context, Result};
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// When submitted work completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Work completes inside `queue_submit`
    Immediate,
    /// Work completes when the owner retires it
    Manual,
}

#[derive(Debug, Clone)]
enum Command {
    BeginLabel(String),
    EndLabel,
    InsertLabel(String),
    Fill {
        buffer: u64,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    },
    Copy {
        src: u64,
        dst: u64,
        region: vk::BufferCopy,
    },
    Barrier,
}

#[derive(Debug, Default)]
struct CommandBufferRecord {
    pool: u64,
    recording: bool,
    executable: bool,
    pending: bool,
    commands: Vec<Command>,
}

#[derive(Debug, Default)]
struct FenceRecord {
    signaled: bool,
    pending: bool,
}

#[derive(Debug, Default)]
struct SemaphoreRecord {
    signaled: bool,
    pending_signal: bool,
}

#[derive(Debug)]
struct PendingSubmission {
    command_buffer: u64,
    fence: u64,
    wait_semaphore: Option<u64>,
    signal_semaphore: Option<u64>,
}

#[derive(Default)]
struct HeadlessState {
    next_handle: u64,
    pools: HashMap<u64, HashSet<u64>>,
    command_buffers: HashMap<u64, CommandBufferRecord>,
    fences: HashMap<u64, FenceRecord>,
    semaphores: HashMap<u64, SemaphoreRecord>,
    /// Host memory for every buffer, host visible or not
    buffer_memory: HashMap<u64, Vec<u8>>,
    /// Every live non-command native object (buffers, images, views, ...)
    objects: HashSet<u64>,
    queue: VecDeque<PendingSubmission>,
    submitted: u64,
    retired: u64,
}

impl HeadlessState {
    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn mint_object(&mut self) -> u64 {
        let raw = self.mint();
        self.objects.insert(raw);
        raw
    }

    fn command_buffer(&mut self, command_buffer: vk::CommandBuffer) -> Result<&mut CommandBufferRecord> {
        self.command_buffers
            .get_mut(&command_buffer.as_raw())
            .with_context(|| format!("Unknown command buffer {:#x}", command_buffer.as_raw()))
    }

    fn record(&mut self, command_buffer: vk::CommandBuffer, command: Command) {
        match self.command_buffer(command_buffer) {
            Ok(record) if record.recording => record.commands.push(command),
            Ok(_) => log::error!(
                "[Headless] command recorded into {:#x} outside of recording",
                command_buffer.as_raw()
            ),
            Err(e) => log::error!("[Headless] {}", e),
        }
    }

    fn destroy_handle(&mut self, raw: u64) {
        if !self.objects.remove(&raw) {
            log::error!("[Headless] destroying unknown or already destroyed object {:#x}", raw);
        }
    }

    /// Execute the oldest pending submission
    fn retire_front(&mut self) -> bool {
        let Some(submission) = self.queue.pop_front() else {
            return false;
        };

        if let Some(wait) = submission.wait_semaphore {
            if let Some(semaphore) = self.semaphores.get_mut(&wait) {
                semaphore.signaled = false;
            }
        }

        let commands = self
            .command_buffers
            .get(&submission.command_buffer)
            .map(|record| record.commands.clone())
            .unwrap_or_default();
        for command in commands {
            self.execute(command);
        }

        if let Some(signal) = submission.signal_semaphore {
            if let Some(semaphore) = self.semaphores.get_mut(&signal) {
                semaphore.pending_signal = false;
                semaphore.signaled = true;
            }
        }
        if let Some(record) = self.command_buffers.get_mut(&submission.command_buffer) {
            record.pending = false;
        }
        if let Some(fence) = self.fences.get_mut(&submission.fence) {
            fence.pending = false;
            fence.signaled = true;
        }

        self.retired += 1;
        true
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Fill {
                buffer,
                offset,
                size,
                data,
            } => {
                let Some(memory) = self.buffer_memory.get_mut(&buffer) else {
                    log::error!("[Headless] fill into destroyed buffer {:#x}", buffer);
                    return;
                };
                let start = (offset as usize).min(memory.len());
                let end = if size == vk::WHOLE_SIZE {
                    memory.len()
                } else {
                    start.saturating_add(size as usize).min(memory.len())
                };
                let pattern = data.to_le_bytes();
                for (i, byte) in memory[start..end].iter_mut().enumerate() {
                    *byte = pattern[i % 4];
                }
            }
            Command::Copy { src, dst, region } => {
                let Some(source) = self.buffer_memory.get(&src) else {
                    log::error!("[Headless] copy from destroyed buffer {:#x}", src);
                    return;
                };
                let Some(bytes) = byte_range(region.src_offset, region.size as usize)
                    .and_then(|range| source.get(range))
                else {
                    log::error!("[Headless] copy source range out of bounds");
                    return;
                };
                let bytes = bytes.to_vec();
                let Some(destination) = self.buffer_memory.get_mut(&dst) else {
                    log::error!("[Headless] copy into destroyed buffer {:#x}", dst);
                    return;
                };
                match byte_range(region.dst_offset, bytes.len()).and_then(|range| destination.get_mut(range)) {
                    Some(target) => target.copy_from_slice(&bytes),
                    None => log::error!("[Headless] copy destination range out of bounds"),
                }
            }
            Command::BeginLabel(_) | Command::EndLabel | Command::InsertLabel(_) => {}
            Command::Barrier => {}
        }
    }
}

/// `offset..offset + len` in host memory, `None` if it does not fit a usize
fn byte_range(offset: vk::DeviceSize, len: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    Some(start..start.checked_add(len)?)
}

/// Software `NativeDevice` for tests and GPU-less runs
pub struct HeadlessDevice {
    mode: CompletionMode,
    state: Mutex<HeadlessState>,
    retired: Condvar,
}

impl HeadlessDevice {
    pub fn new(mode: CompletionMode) -> Self {
        log::info!("Creating headless device ({:?} completion)", mode);
        Self {
            mode,
            state: Mutex::new(HeadlessState::default()),
            retired: Condvar::new(),
        }
    }

    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// Complete the oldest pending submission. Returns false if the queue is empty.
    pub fn retire_next(&self) -> bool {
        let retired = self.state.lock().retire_front();
        if retired {
            self.retired.notify_all();
        }
        retired
    }

    /// Complete every pending submission, returning how many were retired
    pub fn retire_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        while state.retire_front() {
            count += 1;
        }
        drop(state);
        self.retired.notify_all();
        count
    }

    /// Submissions handed to the queue and not yet retired
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Total submissions seen over the device's lifetime
    pub fn submitted_count(&self) -> u64 {
        self.state.lock().submitted
    }

    /// Submissions that have completed
    pub fn retired_count(&self) -> u64 {
        self.state.lock().retired
    }

    pub fn command_buffer_count(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    /// Live buffers, images, views, samplers, modules, layouts, pools and pipelines
    pub fn live_object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn is_alive(&self, raw_handle: u64) -> bool {
        self.state.lock().objects.contains(&raw_handle)
    }

    /// Labels recorded into a command buffer since its last reset
    pub fn recorded_labels(&self, command_buffer: vk::CommandBuffer) -> Vec<String> {
        let state = self.state.lock();
        let Some(record) = state.command_buffers.get(&command_buffer.as_raw()) else {
            return Vec::new();
        };
        record
            .commands
            .iter()
            .filter_map(|command| match command {
                Command::BeginLabel(label) | Command::InsertLabel(label) => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    /// Stand-ins for natives built by the pipeline and layout builders
    pub fn create_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::from_raw(self.state.lock().mint_object())
    }

    pub fn create_descriptor_pool(&self) -> vk::DescriptorPool {
        vk::DescriptorPool::from_raw(self.state.lock().mint_object())
    }

    pub fn create_pipeline(&self) -> (vk::Pipeline, vk::PipelineLayout) {
        let mut state = self.state.lock();
        let pipeline = vk::Pipeline::from_raw(state.mint_object());
        let layout = vk::PipelineLayout::from_raw(state.mint_object());
        (pipeline, layout)
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(CompletionMode::Immediate)
    }
}

impl NativeDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "Headless"
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let mut state = self.state.lock();
        let raw = state.mint();
        state.pools.insert(raw, HashSet::new());
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        let Some(buffers) = state.pools.remove(&pool.as_raw()) else {
            log::error!("[Headless] destroying unknown command pool");
            return;
        };
        for buffer in buffers {
            if let Some(record) = state.command_buffers.remove(&buffer) {
                if record.pending {
                    log::error!("[Headless] command pool destroyed with pending work");
                }
            }
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool.as_raw()) {
            bail!("Unknown command pool {:#x}", pool.as_raw());
        }
        let raw = state.mint();
        state.command_buffers.insert(
            raw,
            CommandBufferRecord {
                pool: pool.as_raw(),
                ..Default::default()
            },
        );
        if let Some(buffers) = state.pools.get_mut(&pool.as_raw()) {
            buffers.insert(raw);
        }
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state.lock();
        if let Some(buffers) = state.pools.get_mut(&pool.as_raw()) {
            buffers.remove(&command_buffer.as_raw());
        }
        if let Some(record) = state.command_buffers.remove(&command_buffer.as_raw()) {
            if record.pending {
                log::error!("[Headless] freeing a command buffer with pending work");
            }
            debug_assert_eq!(record.pool, pool.as_raw());
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.command_buffer(command_buffer)?;
        if record.recording {
            bail!("Command buffer is already recording");
        }
        if record.pending {
            bail!("Command buffer is still pending execution");
        }
        record.recording = true;
        record.executable = false;
        record.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.command_buffer(command_buffer)?;
        if !record.recording {
            bail!("Command buffer is not recording");
        }
        record.recording = false;
        record.executable = true;
        Ok(())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.command_buffer(command_buffer)?;
        if record.pending {
            bail!("Resetting a command buffer with pending work");
        }
        record.recording = false;
        record.executable = false;
        record.commands.clear();
        Ok(())
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.mint();
        state.fences.insert(raw, FenceRecord::default());
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        match state.fences.remove(&fence.as_raw()) {
            Some(record) if record.pending => {
                log::error!("[Headless] destroying a fence with pending work")
            }
            Some(_) => {}
            None => log::error!("[Headless] destroying unknown fence"),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        let state = self.state.lock();
        let record = state
            .fences
            .get(&fence.as_raw())
            .context("Unknown fence")?;
        if !record.signaled && !record.pending {
            bail!("Fence queried before submission");
        }
        Ok(record.signaled)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let record = state
                .fences
                .get(&fence.as_raw())
                .context("Unknown fence")?;
            if record.signaled {
                return Ok(());
            }
            if !record.pending {
                bail!("Waiting on a fence that was never submitted");
            }
            if self.retired.wait_until(&mut state, deadline).timed_out() {
                let signaled = state
                    .fences
                    .get(&fence.as_raw())
                    .is_some_and(|record| record.signaled);
                if signaled {
                    return Ok(());
                }
                bail!("Fence wait timed out after {:?}", timeout);
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        let record = state
            .fences
            .get_mut(&fence.as_raw())
            .context("Unknown fence")?;
        if record.pending {
            bail!("Resetting a fence with pending work");
        }
        record.signaled = false;
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let raw = state.mint();
        state.semaphores.insert(raw, SemaphoreRecord::default());
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if self
            .state
            .lock()
            .semaphores
            .remove(&semaphore.as_raw())
            .is_none()
        {
            log::error!("[Headless] destroying unknown semaphore");
        }
    }

    fn queue_submit(&self, submission: &QueueSubmission) -> Result<()> {
        let mut state = self.state.lock();

        // Validate everything before touching any state
        let record = state.command_buffer(submission.command_buffer)?;
        if !record.executable {
            bail!("Submitting a command buffer that has not been ended");
        }
        if record.pending {
            bail!("Submitting a command buffer that is already pending");
        }
        let fence = state
            .fences
            .get(&submission.fence.as_raw())
            .context("Unknown fence")?;
        if fence.signaled || fence.pending {
            bail!("Submitting with a fence that is signaled or in use");
        }
        if let Some((wait, _stage)) = submission.wait_semaphore {
            let semaphore = state
                .semaphores
                .get(&wait.as_raw())
                .context("Unknown wait semaphore")?;
            if !semaphore.signaled && !semaphore.pending_signal {
                bail!("Waiting on a semaphore that nothing will signal");
            }
        }
        if let Some(signal) = submission.signal_semaphore {
            let semaphore = state
                .semaphores
                .get(&signal.as_raw())
                .context("Unknown signal semaphore")?;
            if semaphore.signaled || semaphore.pending_signal {
                bail!("Signaling a semaphore that is already signaled");
            }
        }

        state.command_buffer(submission.command_buffer)?.pending = true;
        if let Some(fence) = state.fences.get_mut(&submission.fence.as_raw()) {
            fence.pending = true;
        }
        if let Some(signal) = submission.signal_semaphore {
            if let Some(semaphore) = state.semaphores.get_mut(&signal.as_raw()) {
                semaphore.pending_signal = true;
            }
        }

        state.queue.push_back(PendingSubmission {
            command_buffer: submission.command_buffer.as_raw(),
            fence: submission.fence.as_raw(),
            wait_semaphore: submission.wait_semaphore.map(|(s, _)| s.as_raw()),
            signal_semaphore: submission.signal_semaphore.map(|s| s.as_raw()),
        });
        state.submitted += 1;

        if self.mode == CompletionMode::Immediate {
            while state.retire_front() {}
            drop(state);
            self.retired.notify_all();
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        // Nothing else retires work, so idling means draining the queue
        self.retire_all();
        Ok(())
    }

    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, label: &str, _color: [f32; 4]) {
        self.state
            .lock()
            .record(command_buffer, Command::BeginLabel(label.to_string()));
    }

    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer) {
        self.state.lock().record(command_buffer, Command::EndLabel);
    }

    fn cmd_insert_label(&self, command_buffer: vk::CommandBuffer, label: &str, _color: [f32; 4]) {
        self.state
            .lock()
            .record(command_buffer, Command::InsertLabel(label.to_string()));
    }

    fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) {
        self.state.lock().record(
            command_buffer,
            Command::Fill {
                buffer: buffer.as_raw(),
                offset,
                size,
                data,
            },
        );
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        self.state.lock().record(
            command_buffer,
            Command::Copy {
                src: src.as_raw(),
                dst: dst.as_raw(),
                region,
            },
        );
    }

    fn cmd_memory_barrier(&self, command_buffer: vk::CommandBuffer) {
        self.state.lock().record(command_buffer, Command::Barrier);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<vk::Buffer> {
        if desc.size == 0 {
            bail!("Buffer {:?} has zero size", desc.debug_name);
        }
        let mut state = self.state.lock();
        let raw = state.mint_object();
        state.buffer_memory.insert(raw, vec![0; desc.size as usize]);
        Ok(vk::Buffer::from_raw(raw))
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let memory = state
            .buffer_memory
            .get_mut(&buffer.as_raw())
            .context("Unknown buffer")?;
        byte_range(offset, data.len())
            .and_then(|range| memory.get_mut(range))
            .context("Buffer write out of bounds")?
            .copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, out: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let memory = state
            .buffer_memory
            .get(&buffer.as_raw())
            .context("Unknown buffer")?;
        out.copy_from_slice(
            byte_range(offset, out.len())
                .and_then(|range| memory.get(range))
                .context("Buffer read out of bounds")?,
        );
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<(vk::Image, vk::ImageView)> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            bail!("Texture {:?} has an empty extent", desc.debug_name);
        }
        let mut state = self.state.lock();
        let image = vk::Image::from_raw(state.mint_object());
        let view = vk::ImageView::from_raw(state.mint_object());
        Ok((image, view))
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.state.lock().mint_object()))
    }

    fn create_shader_module(&self, spirv: &[u8]) -> Result<vk::ShaderModule> {
        if spirv.is_empty() || spirv.len() % 4 != 0 {
            bail!("Invalid SPIR-V bytecode ({} bytes)", spirv.len());
        }
        Ok(vk::ShaderModule::from_raw(self.state.lock().mint_object()))
    }

    fn destroy_object(&self, object: NativeObject) {
        let mut state = self.state.lock();
        match object {
            NativeObject::Buffer(buffer) => {
                state.buffer_memory.remove(&buffer.as_raw());
                state.destroy_handle(buffer.as_raw());
            }
            NativeObject::Texture { image, view } => {
                state.destroy_handle(view.as_raw());
                state.destroy_handle(image.as_raw());
            }
            NativeObject::Sampler(sampler) => state.destroy_handle(sampler.as_raw()),
            NativeObject::ShaderModule(module) => state.destroy_handle(module.as_raw()),
            NativeObject::DescriptorSetLayouts(layouts) => {
                for layout in layouts {
                    state.destroy_handle(layout.as_raw());
                }
            }
            NativeObject::DescriptorPool(pool) => state.destroy_handle(pool.as_raw()),
            NativeObject::Pipeline { pipeline, layout } => {
                state.destroy_handle(pipeline.as_raw());
                state.destroy_handle(layout.as_raw());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(device: &HeadlessDevice) -> (vk::CommandPool, vk::CommandBuffer, vk::Fence) {
        let pool = device.create_command_pool().unwrap();
        let cb = device.allocate_command_buffer(pool).unwrap();
        let fence = device.create_fence().unwrap();
        device.begin_command_buffer(cb).unwrap();
        (pool, cb, fence)
    }

    fn submission(cb: vk::CommandBuffer, fence: vk::Fence) -> QueueSubmission {
        QueueSubmission {
            command_buffer: cb,
            fence,
            wait_semaphore: None,
            signal_semaphore: None,
        }
    }

    #[test]
    fn manual_mode_holds_work_until_retired() {
        let device = HeadlessDevice::new(CompletionMode::Manual);
        let (_pool, cb, fence) = recorded(&device);
        device.end_command_buffer(cb).unwrap();
        device.queue_submit(&submission(cb, fence)).unwrap();

        assert!(!device.fence_signaled(fence).unwrap());
        assert_eq!(device.pending_submissions(), 1);
        assert!(device.retire_next());
        assert!(device.fence_signaled(fence).unwrap());
        assert!(!device.retire_next());
    }

    #[test]
    fn double_begin_is_rejected() {
        let device = HeadlessDevice::default();
        let (_pool, cb, _fence) = recorded(&device);
        assert!(device.begin_command_buffer(cb).is_err());
    }

    #[test]
    fn submitting_unended_buffer_is_rejected() {
        let device = HeadlessDevice::default();
        let (_pool, cb, fence) = recorded(&device);
        assert!(device.queue_submit(&submission(cb, fence)).is_err());
    }

    #[test]
    fn waiting_on_unsubmitted_fence_fails_fast() {
        let device = HeadlessDevice::default();
        let fence = device.create_fence().unwrap();
        assert!(device.wait_for_fence(fence, Duration::from_secs(10)).is_err());
    }

    #[test]
    fn querying_unsubmitted_fence_is_an_error() {
        let device = HeadlessDevice::new(CompletionMode::Manual);
        let (_pool, cb, fence) = recorded(&device);
        assert!(device.fence_signaled(fence).is_err());

        device.end_command_buffer(cb).unwrap();
        device.queue_submit(&submission(cb, fence)).unwrap();
        assert!(!device.fence_signaled(fence).unwrap());
        device.retire_all();
        assert!(device.fence_signaled(fence).unwrap());

        // Reset returns the fence to its unsubmitted state
        device.reset_fence(fence).unwrap();
        assert!(device.fence_signaled(fence).is_err());
    }

    #[test]
    fn out_of_range_offsets_are_rejected() {
        let device = HeadlessDevice::default();
        let buffer = device
            .create_buffer(&BufferDesc {
                size: 8,
                ..Default::default()
            })
            .unwrap();
        let mut out = [0u8; 4];
        assert!(device.read_buffer(buffer, u64::MAX, &mut out).is_err());
        assert!(device.write_buffer(buffer, u64::MAX - 1, &[1, 2]).is_err());
        assert!(device.write_buffer(buffer, 6, &[1, 2, 3]).is_err());
    }

    #[test]
    fn fence_wait_times_out() {
        let device = HeadlessDevice::new(CompletionMode::Manual);
        let (_pool, cb, fence) = recorded(&device);
        device.end_command_buffer(cb).unwrap();
        device.queue_submit(&submission(cb, fence)).unwrap();
        assert!(device
            .wait_for_fence(fence, Duration::from_millis(10))
            .is_err());
    }

    #[test]
    fn retiring_executes_fill_and_copy() {
        let device = HeadlessDevice::new(CompletionMode::Manual);
        let desc = BufferDesc {
            size: 8,
            ..Default::default()
        };
        let src = device.create_buffer(&desc).unwrap();
        let dst = device.create_buffer(&desc).unwrap();

        let (_pool, cb, fence) = recorded(&device);
        device.cmd_fill_buffer(cb, src, 0, vk::WHOLE_SIZE, 0xAABBCCDD);
        device.cmd_copy_buffer(
            cb,
            src,
            dst,
            vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 8,
            },
        );
        device.end_command_buffer(cb).unwrap();
        device.queue_submit(&submission(cb, fence)).unwrap();

        let mut out = [0u8; 8];
        device.read_buffer(dst, 0, &mut out).unwrap();
        assert_eq!(out, [0; 8]);

        device.retire_all();
        device.read_buffer(dst, 0, &mut out).unwrap();
        assert_eq!(out, [0xDD, 0xCC, 0xBB, 0xAA, 0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn semaphore_without_signal_is_rejected() {
        let device = HeadlessDevice::default();
        let (_pool, cb, fence) = recorded(&device);
        device.end_command_buffer(cb).unwrap();
        let semaphore = device.create_semaphore().unwrap();
        let mut submit = submission(cb, fence);
        submit.wait_semaphore = Some((semaphore, vk::PipelineStageFlags::TOP_OF_PIPE));
        assert!(device.queue_submit(&submit).is_err());
    }

    #[test]
    fn destroyed_objects_are_no_longer_alive() {
        let device = HeadlessDevice::default();
        let sampler = device.create_sampler(&SamplerDesc::default()).unwrap();
        assert!(device.is_alive(sampler.as_raw()));
        device.destroy_object(NativeObject::Sampler(sampler));
        assert!(!device.is_alive(sampler.as_raw()));
        assert_eq!(device.live_object_count(), 0);
    }
}
