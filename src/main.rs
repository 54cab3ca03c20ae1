// =============================================================================
// HGI VULKAN DEMO - Multi-threaded recording with deferred destruction
// =============================================================================
//
// FRAME FLOW:
// 1. Worker threads each record fills into their own blit cmds
// 2. Main thread submits all cmds, then a readback it waits on
// 3. The frame's scratch buffers are destroyed while still in flight
// 4. End of frame: consumed buffers reset, unreferenced trash freed
//
// Run with `backend = "headless"` in hgi.toml to skip the GPU entirely.
//
// =============================================================================

use anyhow::{anyhow, Result};
use ash::vk;
use hgi_vulkan::backend::BufferDesc;
use hgi_vulkan::{Buffer, Config, Hgi, ResourceType, WaitMode};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

const FRAMES: u32 = 4;
const WORKERS: usize = 3;
const SCRATCH_SIZE: vk::DeviceSize = 256;

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting hgi-vulkan demo");
    log::info!("Backend: {:?}", config.backend_kind());

    let hgi = Hgi::from_config(&config)?;

    // One upload, flushed ahead of the first frame's work
    let constants = hgi.create_buffer(&BufferDesc {
        debug_name: "constants".to_string(),
        size: 16,
        ..Default::default()
    })?;
    let mut upload = hgi.create_blit_cmds();
    upload.upload_buffer(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16], &constants, 0)?;
    hgi.submit_cmds(&mut upload, WaitMode::NoWait);

    for frame in 0..FRAMES {
        run_frame(&hgi, frame)?;
    }

    hgi.destroy_buffer(constants);
    log::info!("Demo finished");
    Ok(())
}

fn run_frame(hgi: &Hgi, frame: u32) -> Result<()> {
    hgi.start_frame();

    let scratch = (0..WORKERS)
        .map(|worker| {
            hgi.create_buffer(&BufferDesc {
                debug_name: format!("scratch {}.{}", frame, worker),
                size: SCRATCH_SIZE,
                ..Default::default()
            })
        })
        .collect::<Result<Vec<Buffer>>>()?;

    // Workers record from their own command pools
    let mut recorded = thread::scope(|scope| {
        let workers: Vec<_> = scratch
            .iter()
            .enumerate()
            .map(|(worker, buffer)| {
                let mut cmds = hgi.create_blit_cmds();
                scope.spawn(move || {
                    cmds.push_debug_group(&format!("worker {}", worker));
                    cmds.fill_buffer(buffer, 0, vk::WHOLE_SIZE, frame * 0x0101_0101 + worker as u32);
                    cmds.memory_barrier();
                    cmds.pop_debug_group();
                    cmds
                })
            })
            .collect();

        workers
            .into_iter()
            .map(|worker| worker.join().map_err(|_| anyhow!("Recording thread panicked")))
            .collect::<Result<Vec<_>>>()
    })?;

    for cmds in &mut recorded {
        hgi.submit_cmds(cmds, WaitMode::NoWait);
    }
    log::info!(
        "Frame {}: {} workers submitted, in-flight bits {:#018x}",
        frame,
        recorded.len(),
        hgi.inflight_bits()
    );

    // Read the first scratch buffer back once its fill has landed
    let readback = Arc::new(Mutex::new(Vec::new()));
    let mut cmds = hgi.create_blit_cmds();
    cmds.fill_buffer(&scratch[0], 0, 16, 0xC0DE_0000 + frame);
    cmds.copy_buffer_gpu_to_cpu(&scratch[0], 0, 16, readback.clone())?;
    hgi.submit_cmds(&mut cmds, WaitMode::WaitUntilCompleted);
    log::info!("Frame {}: readback {:02x?}", frame, &readback.lock()[..4]);

    // Destroyed while the workers' fills may still be executing
    for buffer in scratch {
        hgi.destroy_buffer(buffer);
    }
    let trashed = hgi.garbage_collector().trash_list::<Buffer>();
    log::info!(
        "Frame {}: {} buffers awaiting collection, trashed from {} threads",
        frame,
        trashed.len(),
        trashed.thread_count()
    );

    hgi.end_frame();
    log::info!(
        "Frame {} done: in-flight bits {:#018x}, {} buffers awaiting collection",
        frame,
        hgi.inflight_bits(),
        hgi.garbage_collector().pending(ResourceType::Buffer)
    );
    Ok(())
}

fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::from_default_env();
    // RUST_LOG wins over the configured level
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(config.log_level());
    }
    builder.init();
}
