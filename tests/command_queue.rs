// Command buffer lifecycle driven end to end through the headless device

use ash::vk::{self, Handle};
use hgi_vulkan::backend::BufferDesc;
use hgi_vulkan::config::QueueConfig;
use hgi_vulkan::{
    BlitCmds, Buffer, CommandBufferState, CompletionMode, Config, Device, GarbageCollector,
    HeadlessDevice, Hgi, NativeDevice, WaitMode, MAX_IN_FLIGHT,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn device(mode: CompletionMode) -> (Arc<HeadlessDevice>, Arc<Device>) {
    let headless = Arc::new(HeadlessDevice::new(mode));
    let mut config = Config::default();
    config.queue = QueueConfig {
        fence_timeout_ms: 5_000,
        acquire_poll_interval_us: 20,
    };
    config.debug.enabled = true;
    let device = Device::new(headless.clone(), &config);
    (headless, device)
}

#[test]
fn blocking_submit_returns_with_nothing_in_flight() {
    let (headless, device) = device(CompletionMode::Manual);
    let queue = device.command_queue();

    let buffer = queue.acquire_command_buffer();
    device
        .native()
        .cmd_insert_label(buffer.vk_command_buffer(), "only command", [1.0; 4]);

    // Nothing retires work in manual mode except this thread
    let retirer = {
        let headless = headless.clone();
        thread::spawn(move || {
            while headless.pending_submissions() == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            headless.retire_all();
        })
    };
    queue.submit_to_queue(Some(&buffer), WaitMode::WaitUntilCompleted);
    retirer.join().unwrap();

    assert_eq!(queue.inflight_bits(), 0);
    assert_eq!(buffer.state(), CommandBufferState::Reset);
}

#[test]
fn concurrent_recorders_get_distinct_ids() {
    let (headless, device) = device(CompletionMode::Manual);
    let barrier = Arc::new(Barrier::new(2));

    let recorders: Vec<_> = (0..2)
        .map(|i| {
            let device = device.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let buffer = device.command_queue().acquire_command_buffer();
                device.native().cmd_begin_label(
                    buffer.vk_command_buffer(),
                    &format!("recorder {}", i),
                    [0.0, 1.0, 0.0, 1.0],
                );
                device.native().cmd_end_label(buffer.vk_command_buffer());
                buffer
            })
        })
        .collect();
    let buffers: Vec<_> = recorders.into_iter().map(|r| r.join().unwrap()).collect();

    let queue = device.command_queue();
    for buffer in &buffers {
        queue.submit_to_queue(Some(buffer), WaitMode::NoWait);
    }

    let bits = queue.inflight_bits();
    assert_eq!(bits.count_ones(), 2);
    let ids: Vec<_> = buffers.iter().map(|b| b.inflight_id().unwrap()).collect();
    assert_ne!(ids[0], ids[1]);
    assert_eq!(bits, ids[0].bit() | ids[1].bit());
    assert_eq!(queue.pool_count(), 2);

    headless.retire_all();
    queue.reset_consumed_command_buffers(WaitMode::NoWait);
    assert_eq!(queue.inflight_bits(), 0);
}

#[test]
fn sixty_fifth_acquisition_waits_for_a_reset_pass() {
    let (headless, device) = device(CompletionMode::Manual);
    let queue = device.command_queue();

    let held: Vec<_> = (0..MAX_IN_FLIGHT - 1)
        .map(|_| queue.acquire_command_buffer())
        .collect();
    let other = {
        let device = device.clone();
        thread::spawn(move || device.command_queue().acquire_command_buffer())
            .join()
            .unwrap()
    };
    let other_id = other.inflight_id().unwrap();
    queue.submit_to_queue(Some(&other), WaitMode::NoWait);
    assert_eq!(queue.inflight_bits(), u64::MAX);

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let device = device.clone();
        let acquired = acquired.clone();
        thread::spawn(move || {
            let buffer = device.command_queue().acquire_command_buffer();
            acquired.store(true, Ordering::SeqCst);
            buffer
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!acquired.load(Ordering::SeqCst));

    // The GPU finishing is not enough, the reset pass has to release the id
    headless.retire_all();
    thread::sleep(Duration::from_millis(20));
    assert!(!acquired.load(Ordering::SeqCst));

    queue.reset_consumed_command_buffers(WaitMode::NoWait);
    let extra = waiter.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    // The only id released is the one the other thread's round held
    assert_eq!(extra.inflight_id(), Some(other_id));
    assert_eq!(queue.inflight_bits(), u64::MAX);
    assert_eq!(held.len(), MAX_IN_FLIGHT - 1);
}

#[test]
fn completion_handlers_see_gpu_writes() {
    let (headless, device) = device(CompletionMode::Manual);
    let queue = device.command_queue();
    let target = Buffer::new(
        device.clone(),
        &BufferDesc {
            debug_name: "readback".to_string(),
            size: 8,
            ..Default::default()
        },
    )
    .unwrap();

    let buffer = queue.acquire_command_buffer();
    device
        .native()
        .cmd_fill_buffer(buffer.vk_command_buffer(), target.vk_buffer(), 0, 8, 0x1122_3344);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let native = device.native().clone();
        let raw = target.vk_buffer();
        let seen = seen.clone();
        let calls = calls.clone();
        buffer.add_completed_handler(move || {
            let mut out = vec![0u8; 4];
            native.read_buffer(raw, 0, &mut out).unwrap();
            *seen.lock() = out;
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }
    queue.submit_to_queue(Some(&buffer), WaitMode::NoWait);

    queue.reset_consumed_command_buffers(WaitMode::NoWait);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    headless.retire_all();
    queue.reset_consumed_command_buffers(WaitMode::NoWait);
    queue.reset_consumed_command_buffers(WaitMode::NoWait);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock(), vec![0x44, 0x33, 0x22, 0x11]);
}

#[test]
fn uploads_execute_before_the_regular_buffer() {
    let (headless, device) = device(CompletionMode::Manual);
    let queue = device.command_queue();
    let desc = |name: &str| BufferDesc {
        debug_name: name.to_string(),
        size: 4,
        ..Default::default()
    };
    let staging = Buffer::new(device.clone(), &desc("staging")).unwrap();
    let uploaded = Buffer::new(device.clone(), &desc("uploaded")).unwrap();
    let copied = Buffer::new(device.clone(), &desc("copied")).unwrap();
    staging.write(0, &[5, 6, 7, 8]).unwrap();

    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: 4,
    };
    let resource = queue.acquire_resource_command_buffer();
    device.native().cmd_copy_buffer(
        resource.vk_command_buffer(),
        staging.vk_buffer(),
        uploaded.vk_buffer(),
        region,
    );
    let regular = queue.acquire_command_buffer();
    device.native().cmd_copy_buffer(
        regular.vk_command_buffer(),
        uploaded.vk_buffer(),
        copied.vk_buffer(),
        region,
    );

    queue.submit_to_queue(Some(&regular), WaitMode::NoWait);
    assert_eq!(headless.pending_submissions(), 2);
    headless.retire_all();

    let mut out = [0u8; 4];
    copied.read(0, &mut out).unwrap();
    assert_eq!(out, [5, 6, 7, 8]);

    queue.reset_consumed_command_buffers(WaitMode::NoWait);
    assert_eq!(queue.inflight_bits(), 0);
}

#[test]
fn many_threads_record_and_recycle() {
    let (_headless, device) = device(CompletionMode::Immediate);
    let (sender, receiver) = std::sync::mpsc::channel();

    let recorders: Vec<_> = (0..6)
        .map(|_| {
            let device = device.clone();
            let sender = sender.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let buffer = device.command_queue().acquire_command_buffer();
                    device.native().cmd_memory_barrier(buffer.vk_command_buffer());
                    sender.send(buffer).unwrap();
                }
            })
        })
        .collect();
    drop(sender);

    let queue = device.command_queue();
    let mut submitted = 0;
    for buffer in receiver {
        queue.submit_to_queue(Some(&buffer), WaitMode::NoWait);
        queue.reset_consumed_command_buffers(WaitMode::NoWait);
        submitted += 1;
    }
    for recorder in recorders {
        recorder.join().unwrap();
    }

    assert_eq!(submitted, 120);
    queue.reset_consumed_command_buffers(WaitMode::NoWait);
    assert_eq!(queue.inflight_bits(), 0);
    assert_eq!(queue.pool_count(), 6);
}

/// A long-lived thread that fills `target` into whatever cmds it is handed
fn spawn_recorder(
    target: Arc<Buffer>,
) -> (mpsc::Sender<BlitCmds>, mpsc::Receiver<BlitCmds>, thread::JoinHandle<()>) {
    let (to_worker, inbox) = mpsc::channel::<BlitCmds>();
    let (outbox, from_worker) = mpsc::channel();
    let handle = thread::spawn(move || {
        for mut cmds in inbox {
            cmds.push_debug_group("recorder");
            cmds.fill_buffer(&target, 0, vk::WHOLE_SIZE, 0x5A5A_5A5A);
            cmds.pop_debug_group();
            outbox.send(cmds).unwrap();
        }
    });
    (to_worker, from_worker, handle)
}

#[test]
fn blit_cmds_record_from_the_recording_threads_pool() {
    let (headless, device) = device(CompletionMode::Immediate);
    let hgi = Hgi::with_garbage_collector(device, GarbageCollector::new());
    let queue = hgi.device().command_queue();

    let recorders: Vec<_> = (0..2)
        .map(|i| {
            let target = hgi
                .create_buffer(&BufferDesc {
                    debug_name: format!("target {}", i),
                    size: 16,
                    ..Default::default()
                })
                .unwrap();
            spawn_recorder(Arc::new(target))
        })
        .collect();

    let mut rounds: Vec<(Vec<u64>, u64)> = Vec::new();
    for _ in 0..2 {
        hgi.start_frame();
        for (to_worker, _, _) in &recorders {
            let cmds = hgi.create_blit_cmds();
            // Nothing is acquired until the first recorded command
            assert!(cmds.command_buffer().is_none());
            to_worker.send(cmds).unwrap();
        }
        let mut recorded: Vec<BlitCmds> = recorders
            .iter()
            .map(|(_, from_worker, _)| from_worker.recv().unwrap())
            .collect();

        // One pool per recording thread, none for the main thread
        assert_eq!(queue.pool_count(), 2);
        let mut natives: Vec<u64> = recorded
            .iter()
            .map(|cmds| cmds.command_buffer().unwrap().vk_command_buffer().as_raw())
            .collect();
        natives.sort_unstable();
        let bits = recorded
            .iter()
            .map(|cmds| cmds.command_buffer().unwrap().inflight_id().unwrap().bit())
            .fold(0, |bits, bit| bits | bit);
        assert_eq!(bits.count_ones(), 2);

        for cmds in &mut recorded {
            hgi.submit_cmds(cmds, WaitMode::NoWait);
        }
        hgi.device().wait_for_idle();
        hgi.end_frame();
        assert_eq!(hgi.inflight_bits(), 0);
        rounds.push((natives, bits));
    }

    // The second round reuses the same native buffers under fresh ids
    assert_eq!(rounds[0].0, rounds[1].0);
    assert_eq!(rounds[0].1 & rounds[1].1, 0);
    assert_eq!(queue.command_buffer_count(), 2);
    assert_eq!(headless.submitted_count(), 4);

    for (to_worker, _, handle) in recorders {
        drop(to_worker);
        handle.join().unwrap();
    }
}
