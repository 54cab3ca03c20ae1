// Command buffer - one native command buffer plus its fence and semaphore
//
// Lifecycle: Reset -> Recording -> Submitted -> Reset. Buffers are recycled
// for the whole life of their pool; only the pool teardown frees them.

use crate::backend::NativeDevice;
use crate::inflight::InFlightId;
use crate::verify;
use ash::vk;
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// Whether a caller blocks on GPU completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    #[default]
    NoWait,
    WaitUntilCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// No pending work; may be handed out
    Reset,
    /// Owned by one thread, commands being appended
    Recording,
    /// Ended and handed to the queue; the fence tells when the GPU is done
    Submitted,
}

type CompletedHandler = Box<dyn FnOnce() + Send>;

struct Inner {
    state: CommandBufferState,
    inflight_id: Option<InFlightId>,
    completed_handlers: Vec<CompletedHandler>,
    /// Bumped on every return to Reset; stale refs compare against it
    generation: u64,
    destroyed: bool,
}

pub struct CommandBuffer {
    native: Arc<dyn NativeDevice>,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    semaphore: vk::Semaphore,
    inner: Mutex<Inner>,
}

impl CommandBuffer {
    pub(crate) fn new(native: Arc<dyn NativeDevice>, pool: vk::CommandPool) -> anyhow::Result<Self> {
        let command_buffer = native.allocate_command_buffer(pool)?;
        let fence = native.create_fence()?;
        let semaphore = native.create_semaphore()?;

        log::trace!("Allocated command buffer {:?}", command_buffer);

        Ok(Self {
            native,
            pool,
            command_buffer,
            fence,
            semaphore,
            inner: Mutex::new(Inner {
                state: CommandBufferState::Reset,
                inflight_id: None,
                completed_handlers: Vec::new(),
                generation: 0,
                destroyed: false,
            }),
        })
    }

    /// Start recording under `id`. A buffer that is not Reset is left alone.
    pub(crate) fn begin(&self, id: InFlightId) {
        let mut inner = self.inner.lock();
        if inner.state != CommandBufferState::Reset || inner.destroyed {
            return;
        }

        verify(
            self.native.begin_command_buffer(self.command_buffer),
            "Begin command buffer",
        );
        inner.inflight_id = Some(id);
        inner.state = CommandBufferState::Recording;
    }

    /// Finish recording; the buffer is ready for queue submission
    pub(crate) fn end(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CommandBufferState::Recording {
            return;
        }

        verify(
            self.native.end_command_buffer(self.command_buffer),
            "End command buffer",
        );
        inner.state = CommandBufferState::Submitted;
    }

    /// Reclaim the buffer if the GPU has finished with it.
    ///
    /// Buffers that were never ended are never consumed, whatever their fence
    /// says. On success the completion handlers have run, the buffer is Reset
    /// and the in-flight id it held is returned for release.
    ///
    /// `NoWait` never blocks, not even on another thread polling this buffer.
    pub(crate) fn poll_consumed(&self, wait: WaitMode, timeout: Duration) -> Option<InFlightId> {
        let mut inner = match wait {
            WaitMode::NoWait => self.inner.try_lock()?,
            WaitMode::WaitUntilCompleted => self.inner.lock(),
        };
        if inner.state != CommandBufferState::Submitted || inner.destroyed {
            return None;
        }

        match wait {
            WaitMode::NoWait => {
                let signaled = verify(
                    self.native.fence_signaled(self.fence),
                    "Query command buffer fence",
                );
                if !signaled {
                    return None;
                }
            }
            WaitMode::WaitUntilCompleted => verify(
                self.native.wait_for_fence(self.fence, timeout),
                "Wait for command buffer fence",
            ),
        }

        // Handlers must not touch this command buffer
        for handler in inner.completed_handlers.drain(..) {
            handler();
        }

        verify(self.native.reset_fence(self.fence), "Reset command buffer fence");
        verify(
            self.native.reset_command_buffer(self.command_buffer),
            "Reset command buffer",
        );

        inner.state = CommandBufferState::Reset;
        inner.generation += 1;
        let id = inner.inflight_id.take();
        log::trace!("Command buffer {:?} consumed ({:?})", self.command_buffer, id);
        id
    }

    /// Throw away round `generation` if it is still recording. Recorded
    /// commands and completion handlers are dropped unexecuted; the in-flight
    /// id is returned for release.
    fn discard_round(&self, generation: u64) -> Option<InFlightId> {
        let mut inner = self.inner.lock();
        if inner.generation != generation
            || inner.state != CommandBufferState::Recording
            || inner.destroyed
        {
            return None;
        }

        verify(
            self.native.end_command_buffer(self.command_buffer),
            "End command buffer",
        );
        verify(
            self.native.reset_command_buffer(self.command_buffer),
            "Reset command buffer",
        );

        inner.state = CommandBufferState::Reset;
        inner.generation += 1;
        let id = inner.inflight_id.take();
        let handlers = mem::take(&mut inner.completed_handlers);
        drop(inner);
        // Handlers may own GPU objects whose drop needs the device
        drop(handlers);

        log::trace!("Command buffer {:?} discarded ({:?})", self.command_buffer, id);
        id
    }

    /// Run `handler` once, right after the GPU has finished with this buffer
    pub fn add_completed_handler(&self, handler: impl FnOnce() + Send + 'static) {
        self.inner.lock().completed_handlers.push(Box::new(handler));
    }

    pub fn state(&self) -> CommandBufferState {
        self.inner.lock().state
    }

    /// True from the moment the buffer is handed out until it is consumed
    pub fn is_in_flight(&self) -> bool {
        self.state() != CommandBufferState::Reset
    }

    pub fn is_recording(&self) -> bool {
        self.state() == CommandBufferState::Recording
    }

    /// The id of the current round; `None` while Reset
    pub fn inflight_id(&self) -> Option<InFlightId> {
        self.inner.lock().inflight_id
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn native(&self) -> &Arc<dyn NativeDevice> {
        &self.native
    }

    pub fn vk_command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn vk_fence(&self) -> vk::Fence {
        self.fence
    }

    pub fn vk_semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Free the native objects. Called by the owning pool at teardown.
    pub(crate) fn destroy(&self) {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        if inner.state == CommandBufferState::Submitted {
            log::warn!(
                "Destroying command buffer {:?} that may still be executing",
                self.command_buffer
            );
        }

        let handlers = mem::take(&mut inner.completed_handlers);
        drop(inner);
        if !handlers.is_empty() {
            log::debug!(
                "Dropping {} completion handlers of command buffer {:?} unrun",
                handlers.len(),
                self.command_buffer
            );
        }
        drop(handlers);

        self.native.destroy_semaphore(self.semaphore);
        self.native.destroy_fence(self.fence);
        self.native.free_command_buffer(self.pool, self.command_buffer);
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CommandBuffer")
            .field("command_buffer", &self.command_buffer)
            .field("state", &inner.state)
            .field("inflight_id", &inner.inflight_id)
            .field("generation", &inner.generation)
            .finish()
    }
}

/// A caller's claim on one round of a pooled command buffer.
///
/// The buffer itself lives as long as its pool; the claim goes stale once
/// the round is consumed and the buffer is recycled.
#[derive(Clone)]
pub struct CommandBufferRef {
    buffer: Arc<CommandBuffer>,
    generation: u64,
}

impl CommandBufferRef {
    pub(crate) fn new(buffer: Arc<CommandBuffer>) -> Self {
        let generation = buffer.generation();
        Self { buffer, generation }
    }

    /// The round this ref was issued for has been consumed
    pub fn is_stale(&self) -> bool {
        self.buffer.generation() != self.generation
    }

    /// Return an unsubmitted round to Reset. No-op once the round was
    /// submitted or has gone stale.
    pub(crate) fn discard(&self) -> Option<InFlightId> {
        self.buffer.discard_round(self.generation)
    }

    /// Both refs point at the same pooled native buffer
    pub fn same_buffer(&self, other: &CommandBufferRef) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

impl Deref for CommandBufferRef {
    type Target = CommandBuffer;

    fn deref(&self) -> &CommandBuffer {
        &self.buffer
    }
}

impl fmt::Debug for CommandBufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBufferRef")
            .field("buffer", &self.buffer)
            .field("generation", &self.generation)
            .finish()
    }
}
