//! Drives a simulated multi-context rendering workload through the buffer
//! manager and prints what the pools and the simulated GPU saw.
//!
//! Configuration is loaded from `winsys.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p winsys-demo -- --contexts 4 --frames 100`.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use crossbeam_channel::Sender;
use tracing::{error, info};
use winsys_batch::{BatchBuffer, BatchError, BatchFlags, BlitPresenter, BufferUsage, Device};
use winsys_bufmgr::BufferObject;
use winsys_config::{CliArgs, Config};
use winsys_drm::{KernelDriver, Placement, SimConfig, SimDriver};

/// What one context did, sent back to the main thread.
#[derive(Debug)]
struct ContextReport {
    context: u32,
    frames: u32,
    relocations: usize,
    buffers: usize,
}

/// Window size the front buffer is allocated for.
const FRONT_BUFFER_BYTES: u64 = 64 * 1024;

fn main() {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("winsys")
    });

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    winsys_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(e) = run(config, &args) {
        error!("demo failed: {e}");
        std::process::exit(1);
    }
}

fn run(config: Config, args: &CliArgs) -> Result<(), BatchError> {
    let contexts = if args.contexts == 0 {
        num_cpus::get()
    } else {
        args.contexts
    };
    let sim = Arc::new(SimDriver::new(SimConfig {
        memory_limit: args.memory_limit,
        auto_retire: true,
        ..Default::default()
    }));
    let device = Device::new(config, sim.clone())?;

    // The window system owns the front buffer; we only import it.
    let front_bo = sim
        .create_buffer(FRONT_BUFFER_BYTES, 0, Placement::MEM_VRAM)
        .map_err(winsys_bufmgr::BufmgrError::from)?;
    let front = BufferObject::new("front", device.drm_pool(), Placement::empty(), 0);
    front.set_referenced(front_bo.handle())?;
    let presenter = Arc::new(BlitPresenter::new(front));

    info!(
        "rendering {} frames on {contexts} contexts, {} MiB of simulated memory",
        args.frames,
        args.memory_limit / (1024 * 1024)
    );

    let (report_tx, report_rx) = crossbeam_channel::unbounded();
    thread::scope(|scope| -> Result<(), BatchError> {
        let mut handles = Vec::with_capacity(contexts);
        for index in 0..contexts {
            let device = Arc::clone(&device);
            let presenter = Arc::clone(&presenter);
            let report_tx = report_tx.clone();
            let frames = args.frames;
            let handle = thread::Builder::new()
                .name(format!("context-{index}"))
                .spawn_scoped(scope, move || {
                    render_context(device, &presenter, frames, report_tx)
                })
                .map_err(|e| BatchError::Present(format!("spawning context thread: {e}")))?;
            handles.push(handle);
        }
        drop(report_tx);
        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => error!("context thread panicked"),
            }
        }
        Ok(())
    })?;

    for report in report_rx.iter() {
        info!(
            "context {}: {} frames, {} relocations, {} buffers",
            report.context, report.frames, report.relocations, report.buffers
        );
    }

    device.slabs().reclaim(true);
    device.free_slabs().reap();
    for size in device.config().slab.bucket_sizes() {
        if let Some(stats) = device.slabs().header_stats(size) {
            if stats.slabs == 0 {
                continue;
            }
            info!(
                "slab {:>5} B: {} slabs ({} active, {} free), {} delayed, {} free buffers",
                stats.buffer_size,
                stats.slabs,
                stats.active,
                stats.free_slabs,
                stats.delayed,
                stats.free_buffers
            );
        }
    }
    let stats = sim.stats();
    info!(
        "gpu: {} submissions, {} buffers created, {} live ({} KiB), {} migrations, {} fences live",
        stats.submissions,
        stats.buffers_created,
        stats.live_buffers,
        stats.live_bytes / 1024,
        stats.migrations,
        stats.live_fences
    );
    info!(
        "{} cached kernel buffers, {} presents in flight",
        device.free_slabs().cached(),
        device.frames_in_flight()
    );
    Ok(())
}

/// One rendering context: every frame uploads vertices and constants,
/// draws with a few GPU buffers of varying size, and presents.
fn render_context(
    device: Arc<Device>,
    presenter: &BlitPresenter,
    frames: u32,
    reports: Sender<ContextReport>,
) -> Result<(), BatchError> {
    let mut batch = BatchBuffer::new(Arc::clone(&device))?;
    let context = batch.context();
    let color = device.buffer_create(
        format!("color-{context}"),
        0,
        BufferUsage::PIXEL | BufferUsage::GPU_WRITE,
        FRONT_BUFFER_BYTES,
    )?;
    let texture = device.buffer_create(
        format!("texture-{context}"),
        64,
        BufferUsage::PIXEL | BufferUsage::GPU_READ,
        4096,
    )?;
    let vertices = device.buffer_create(format!("vertices-{context}"), 0, BufferUsage::VERTEX, 48)?;

    let mut relocations = 0;
    let mut buffers = 3;
    for frame in 0..frames {
        let vertex_data: Vec<u8> = (0..48).map(|i| (i as u32 + frame) as u8).collect();
        vertices.data(vertex_data.len() as u64, Some(&vertex_data), None, vertices.flags())?;

        // Small per-frame buffers exercise the slab size classes.
        let size = 64u64 << (frame % 6);
        let constants = device.buffer_create(
            format!("consts-{context}-{frame}"),
            0,
            BufferUsage::GPU_READ,
            size,
        )?;
        constants.sub_data(0, &frame.to_le_bytes())?;
        buffers += 1;

        batch.require_space(32, BatchFlags::NO_CLIPRECTS)?;
        batch.emit_dword(0x7800_0000 | frame);
        batch.offset_relocation(
            0,
            &constants,
            Placement::MEM_TT | Placement::READ,
            Placement::MEM_MASK,
        )?;
        batch.offset_relocation(
            0,
            &texture,
            Placement::MEM_TT | Placement::READ,
            Placement::MEM_MASK,
        )?;
        batch.offset_relocation(
            0,
            &color,
            Placement::MEM_TT | Placement::WRITE,
            Placement::MEM_MASK | Placement::WRITE,
        )?;
        // Vertices go inline.
        let mapping = vertices.map(winsys_drm::MapFlags::READ, winsys_drm::MapHint::empty())?;
        for chunk in 0..3 {
            // SAFETY: mapped, and 3 dwords fit the 48-byte upload.
            batch.emit_dword(unsafe { mapping.read_u32(chunk * 4) });
        }
        vertices.unmap()?;
        relocations += 3;

        device.flush_frontbuffer(&mut batch, &color, presenter)?;
        relocations += 2;
    }
    batch.finish()?;
    let _ = reports.send(ContextReport {
        context,
        frames,
        relocations,
        buffers,
    });
    Ok(())
}
