// Command queue - per-thread command buffer pools and the single hardware queue
//
// Any thread may acquire command buffers; each thread records from its own
// native pool so no pool or buffer is ever touched by two recording threads.
// Submission and the reset pass are serialized by convention on the thread
// that created the queue.

use crate::backend::{NativeDevice, QueueSubmission};
use crate::command_buffer::{CommandBuffer, CommandBufferRef, CommandBufferState, WaitMode};
use crate::config::QueueConfig;
use crate::inflight::{InFlightId, InFlightRegistry, MAX_IN_FLIGHT};
use crate::verify;
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Command buffers belonging to one recording thread
pub struct CommandBufferPool {
    native: Arc<dyn NativeDevice>,
    pool: vk::CommandPool,
    thread: ThreadId,
    // Grows without bound; buffers are recycled, never freed before teardown
    buffers: Mutex<Vec<Arc<CommandBuffer>>>,
}

impl CommandBufferPool {
    fn new(native: Arc<dyn NativeDevice>, thread: ThreadId) -> anyhow::Result<Self> {
        let pool = native.create_command_pool()?;
        log::debug!("Created command pool {:?} for thread {:?}", pool, thread);
        Ok(Self {
            native,
            pool,
            thread,
            buffers: Mutex::new(Vec::new()),
        })
    }

    /// A buffer with no pending work, reusing one before growing the pool
    fn reset_or_new_buffer(&self) -> Arc<CommandBuffer> {
        let mut buffers = self.buffers.lock();
        if let Some(buffer) = buffers
            .iter()
            .find(|buffer| buffer.state() == CommandBufferState::Reset)
        {
            return buffer.clone();
        }

        let buffer = Arc::new(verify(
            CommandBuffer::new(self.native.clone(), self.pool),
            "Create command buffer",
        ));
        buffers.push(buffer.clone());
        log::debug!(
            "Command pool {:?} grew to {} buffers",
            self.pool,
            buffers.len()
        );
        buffer
    }

    /// Poll every buffer, releasing the ids of those that were consumed
    fn reset_consumed(
        &self,
        wait: WaitMode,
        config: &QueueConfig,
        inflight: &InFlightRegistry,
    ) -> usize {
        let buffers = self.buffers.lock().clone();
        let mut consumed = 0;
        for buffer in &buffers {
            if let Some(id) = buffer.poll_consumed(wait, config.fence_timeout()) {
                inflight.release(id);
                consumed += 1;
            }
        }
        consumed
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    fn destroy(&self) {
        for buffer in self.buffers.lock().drain(..) {
            buffer.destroy();
        }
        self.native.destroy_command_pool(self.pool);
    }
}

/// Owns every pool, the in-flight ids and the hardware queue
pub struct CommandQueue {
    native: Arc<dyn NativeDevice>,
    config: QueueConfig,
    inflight: InFlightRegistry,
    pools: Mutex<HashMap<ThreadId, Arc<CommandBufferPool>>>,
    /// Upload work submitted ahead of the next regular buffer
    resource_buffer: Mutex<Option<CommandBufferRef>>,
    main_thread: ThreadId,
}

impl CommandQueue {
    /// The calling thread becomes the queue's main thread
    pub fn new(native: Arc<dyn NativeDevice>, config: QueueConfig) -> Self {
        log::info!("Creating command queue on {}", native.name());
        Self {
            native,
            config,
            inflight: InFlightRegistry::new(),
            pools: Mutex::new(HashMap::new()),
            resource_buffer: Mutex::new(None),
            main_thread: thread::current().id(),
        }
    }

    /// The pool for `thread`, created on first use
    pub fn acquire_thread_pool(&self, thread: ThreadId) -> Arc<CommandBufferPool> {
        let mut pools = self.pools.lock();
        pools
            .entry(thread)
            .or_insert_with(|| {
                Arc::new(verify(
                    CommandBufferPool::new(self.native.clone(), thread),
                    "Create command pool",
                ))
            })
            .clone()
    }

    /// Hand the calling thread a command buffer in the Recording state.
    ///
    /// Blocks while all in-flight ids are taken, polling this thread's
    /// buffers and sleeping between attempts until one frees up.
    pub fn acquire_command_buffer(&self) -> CommandBufferRef {
        let pool = self.acquire_thread_pool(thread::current().id());
        let buffer = pool.reset_or_new_buffer();
        let id = self.acquire_inflight_id(&pool);
        buffer.begin(id);
        log::trace!(
            "Acquired command buffer {:?} as {}",
            buffer.vk_command_buffer(),
            id
        );
        CommandBufferRef::new(buffer)
    }

    fn acquire_inflight_id(&self, pool: &CommandBufferPool) -> InFlightId {
        let mut warned = false;
        loop {
            if let Some(id) = self.inflight.try_acquire() {
                return id;
            }
            if !warned {
                log::warn!(
                    "All {} in-flight ids are taken, waiting for the GPU",
                    MAX_IN_FLIGHT
                );
                warned = true;
            }
            pool.reset_consumed(WaitMode::NoWait, &self.config, &self.inflight);
            thread::sleep(self.config.acquire_poll_interval());
        }
    }

    /// The shared upload buffer, flushed ahead of the next submission.
    /// Main thread only.
    pub fn acquire_resource_command_buffer(&self) -> CommandBufferRef {
        if !self.is_main_thread() {
            log::error!("Resource command buffer acquired off the main thread");
        }

        if let Some(buffer) = self.resource_buffer.lock().as_ref() {
            return buffer.clone();
        }

        let buffer = self.acquire_command_buffer();
        *self.resource_buffer.lock() = Some(buffer.clone());
        buffer
    }

    /// Submit `buffer`, preceded by the resource command buffer if one is
    /// pending. Callers must serialize submissions.
    ///
    /// Passing `None` only flushes the resource buffer. With
    /// `WaitUntilCompleted` the call returns after the GPU finished the
    /// work and its completion handlers have run.
    pub fn submit_to_queue(&self, buffer: Option<&CommandBufferRef>, wait: WaitMode) {
        let resource = self.resource_buffer.lock().take();

        // The resource buffer itself may be handed in; it is submitted once
        let regular = buffer.filter(|buffer| {
            !resource
                .as_ref()
                .is_some_and(|resource| resource.same_buffer(buffer))
        });
        let regular = regular.filter(|buffer| {
            let recording = !buffer.is_stale() && buffer.state() == CommandBufferState::Recording;
            if !recording {
                log::error!(
                    "Submitting command buffer {:?} that is not recording",
                    buffer.vk_command_buffer()
                );
            }
            recording
        });

        let mut wait_semaphore = None;
        if let Some(resource) = &resource {
            let signal = regular.map(|_| resource.vk_semaphore());
            resource.end();
            self.submit_native(resource, None, signal);
            // Regular work may not start before the uploads have landed
            wait_semaphore =
                signal.map(|semaphore| (semaphore, vk::PipelineStageFlags::ALL_COMMANDS));
        }

        if let Some(regular) = regular {
            regular.end();
            self.submit_native(regular, wait_semaphore, None);
        }

        // Only what this call submitted; a rejected ref may already belong
        // to someone else's round
        if wait == WaitMode::WaitUntilCompleted {
            if let Some(regular) = regular {
                self.wait_until_consumed(regular);
            }
            if let Some(resource) = &resource {
                self.wait_until_consumed(resource);
            }
        }
    }

    /// Give back a buffer that was acquired but will never be submitted.
    ///
    /// Its recording is thrown away, its completion handlers are dropped
    /// without running and its in-flight id is released at once. Refs whose
    /// round was already submitted or consumed are left alone.
    pub fn discard_command_buffer(&self, buffer: &CommandBufferRef) {
        {
            let mut resource = self.resource_buffer.lock();
            if resource
                .as_ref()
                .is_some_and(|resource| resource.same_buffer(buffer) && !buffer.is_stale())
            {
                *resource = None;
            }
        }

        if let Some(id) = buffer.discard() {
            self.inflight.release(id);
            log::debug!(
                "Discarded unsubmitted command buffer {:?}, released {}",
                buffer.vk_command_buffer(),
                id
            );
        }
    }

    fn submit_native(
        &self,
        buffer: &CommandBuffer,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        signal_semaphore: Option<vk::Semaphore>,
    ) {
        let submission = QueueSubmission {
            command_buffer: buffer.vk_command_buffer(),
            fence: buffer.vk_fence(),
            wait_semaphore,
            signal_semaphore,
        };
        verify(self.native.queue_submit(&submission), "Submit command buffer");
        log::trace!("Submitted command buffer {:?}", submission.command_buffer);
    }

    fn wait_until_consumed(&self, buffer: &CommandBuffer) {
        if let Some(id) = buffer.poll_consumed(WaitMode::WaitUntilCompleted, self.config.fence_timeout()) {
            self.inflight.release(id);
        }
    }

    /// Reclaim every buffer the GPU has finished with and release its id.
    /// Main thread only, with no recording in progress.
    pub fn reset_consumed_command_buffers(&self, wait: WaitMode) {
        if !self.is_main_thread() {
            log::error!("Command buffers reset off the main thread");
        }

        let pools = self.pools.lock();
        let consumed: usize = pools
            .values()
            .map(|pool| pool.reset_consumed(wait, &self.config, &self.inflight))
            .sum();

        if consumed > 0 {
            log::trace!(
                "Reset {} consumed command buffers, in-flight bits {:#018x}",
                consumed,
                self.inflight.snapshot()
            );
        }
    }

    /// Bitset of rounds handed out and not yet consumed
    pub fn inflight_bits(&self) -> u64 {
        self.inflight.snapshot()
    }

    pub fn inflight_registry(&self) -> &InFlightRegistry {
        &self.inflight
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn native(&self) -> &Arc<dyn NativeDevice> {
        &self.native
    }

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Command buffers across all pools, busy or not
    pub fn command_buffer_count(&self) -> usize {
        self.pools.lock().values().map(|pool| pool.len()).sum()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        log::info!("Destroying command queue on {}", self.native.name());
        self.resource_buffer.lock().take();
        for (_, pool) in self.pools.lock().drain() {
            pool.destroy();
        }
    }
}
