//! Scenarios driving several crates together through a simulated kernel.

use std::sync::Arc;
use std::thread;

use winsys_batch::{BatchBuffer, BatchFlags, BlitPresenter, BufferUsage, Device};
use winsys_config::Config;
use winsys_drm::{FenceFlags, KernelDriver, MapFlags, MapHint, Placement, SimConfig, SimDriver};

fn sim_device(config: Config, sim: SimConfig) -> (Arc<SimDriver>, Arc<Device>) {
    let sim = Arc::new(SimDriver::new(sim));
    let device = Device::new(config, sim.clone()).unwrap();
    (sim, device)
}

#[test]
fn test_contexts_render_concurrently() {
    let (sim, device) = sim_device(
        Config::default(),
        SimConfig {
            auto_retire: true,
            ..Default::default()
        },
    );
    let shared = device
        .buffer_create("shared", 0, BufferUsage::GPU_READ, 256)
        .unwrap();
    shared.sub_data(0, &[0xAB; 256]).unwrap();

    thread::scope(|scope| {
        for ctx in 0..4u32 {
            let device = Arc::clone(&device);
            let shared = shared.clone();
            scope.spawn(move || {
                let mut batch = BatchBuffer::new(Arc::clone(&device)).unwrap();
                for frame in 0..20u32 {
                    let vbo = device
                        .buffer_create(
                            format!("vbo-{ctx}-{frame}"),
                            0,
                            BufferUsage::GPU_READ,
                            u64::from(64 + frame * 8),
                        )
                        .unwrap();
                    vbo.data(vbo.size(), Some(&[frame as u8; 64]), None, vbo.flags())
                        .unwrap();
                    batch.require_space(12, BatchFlags::empty()).unwrap();
                    batch.emit_dword(ctx << 16 | frame);
                    batch
                        .offset_relocation(0, &vbo, Placement::MEM_TT | Placement::READ, Placement::MEM_MASK)
                        .unwrap();
                    batch
                        .offset_relocation(16, &shared, Placement::MEM_TT | Placement::READ, Placement::MEM_MASK)
                        .unwrap();
                    if frame % 5 == 4 {
                        batch.flush().unwrap();
                    }
                }
                batch.finish().unwrap();
            });
        }
    });

    let stats = sim.stats();
    assert_eq!(stats.submissions, 16);
    let mut out = [0u8; 4];
    shared.get_sub_data(252, &mut out).unwrap();
    assert_eq!(out, [0xAB; 4]);
    // Only the shared buffer's references remain outside the pools.
    assert_eq!(shared.reference_count(), 1);
}

#[test]
fn test_relocations_follow_a_moved_buffer() {
    let (sim, device) = sim_device(Config::default(), SimConfig::default());
    let texture = device
        .buffer_create("texture", 0, BufferUsage::PIXEL | BufferUsage::GPU_READ, 1024)
        .unwrap();
    let (kbo, start) = texture.kernel_location().unwrap();
    let mut batch = BatchBuffer::new(Arc::clone(&device)).unwrap();

    batch.require_space(4, BatchFlags::empty()).unwrap();
    batch
        .offset_relocation(4, &texture, Placement::MEM_TT | Placement::READ, Placement::MEM_MASK)
        .unwrap();
    batch.finish().unwrap();
    let first = sim.submissions().remove(0);
    assert_eq!(first.patched, 0);
    assert_eq!(u64::from(first.dwords[0]), kbo.offset() + start + 4);

    let moved = sim.migrate(kbo.handle()).unwrap();
    batch.require_space(4, BatchFlags::empty()).unwrap();
    batch
        .offset_relocation(4, &texture, Placement::MEM_TT | Placement::READ, Placement::MEM_MASK)
        .unwrap();
    batch.finish().unwrap();
    let second = sim.submissions().remove(1);
    assert_eq!(second.patched, 1);
    assert_eq!(u64::from(second.dwords[0]), moved + start + 4);
    assert_eq!(kbo.offset(), moved);

    // Later relocations start from the corrected offset.
    batch.require_space(4, BatchFlags::empty()).unwrap();
    batch
        .offset_relocation(4, &texture, Placement::MEM_TT | Placement::READ, Placement::MEM_MASK)
        .unwrap();
    batch.finish().unwrap();
    assert_eq!(sim.submissions()[2].patched, 0);
}

#[test]
fn test_placement_request_moves_buffer_into_vram() {
    let (sim, device) = sim_device(Config::default(), SimConfig::default());
    let target = winsys_bufmgr::BufferObject::create(
        "scanout",
        device.drm_pool(),
        4096,
        Placement::MEM_TT,
        0,
    )
    .unwrap();
    let kbo = target.kernel().unwrap();
    let mut batch = BatchBuffer::new(Arc::clone(&device)).unwrap();
    batch.require_space(4, BatchFlags::empty()).unwrap();
    batch
        .offset_relocation(0, &target, Placement::MEM_VRAM | Placement::WRITE, Placement::MEM_MASK)
        .unwrap();
    batch.finish().unwrap();

    assert_eq!(kbo.flags().memory(), Placement::MEM_VRAM);
    assert_eq!(sim.gpu_offset(kbo.handle()), Some(kbo.offset()));
    assert_eq!(
        u64::from(sim.submissions()[0].dwords[0]),
        kbo.offset()
    );
}

#[test]
fn test_slab_slots_are_not_reused_while_fenced() {
    let (sim, device) = sim_device(Config::default(), SimConfig::default());
    let mut batch = BatchBuffer::new(Arc::clone(&device)).unwrap();

    let first = device
        .buffer_create("first", 0, BufferUsage::GPU_READ, 64)
        .unwrap();
    let first_location = first.kernel_location().unwrap();
    batch.require_space(4, BatchFlags::empty()).unwrap();
    batch
        .offset_relocation(0, &first, Placement::MEM_TT | Placement::READ, Placement::MEM_MASK)
        .unwrap();
    let fence = batch.flush().unwrap().unwrap();
    drop(first);
    assert_eq!(device.slabs().header_stats(64).unwrap().delayed, 1);

    let second = device
        .buffer_create("second", 0, BufferUsage::GPU_READ, 64)
        .unwrap();
    let second_location = second.kernel_location().unwrap();
    assert!(
        !Arc::ptr_eq(&first_location.0, &second_location.0) || first_location.1 != second_location.1
    );

    sim.retire_all();
    assert!(fence.is_signaled(FenceFlags::EXE).unwrap());
    device.slabs().reclaim(false);
    assert_eq!(device.slabs().header_stats(64).unwrap().delayed, 0);
}

#[test]
fn test_present_loop_with_imported_front_buffer() {
    let mut config = Config::default();
    config.present.max_frames_in_flight = 2;
    let (sim, device) = sim_device(config, SimConfig::default());
    let front_kbo = sim.create_buffer(8192, 0, Placement::MEM_TT).unwrap();
    let front = winsys_bufmgr::BufferObject::new("front", device.drm_pool(), Placement::empty(), 0);
    front.set_referenced(front_kbo.handle()).unwrap();
    let presenter = BlitPresenter::new(front);
    let surface = device
        .buffer_create("back", 0, BufferUsage::PIXEL | BufferUsage::GPU_WRITE, 8192)
        .unwrap();
    let mut batch = BatchBuffer::new(Arc::clone(&device)).unwrap();

    for frame in 0..6u32 {
        batch.require_space(4, BatchFlags::empty()).unwrap();
        batch.emit_dword(frame);
        device
            .flush_frontbuffer(&mut batch, &surface, &presenter)
            .unwrap();
        assert!(device.frames_in_flight() <= 2);
    }
    // Rendering and presentation alternate.
    assert_eq!(sim.submissions().len(), 12);

    batch.finish().unwrap();
    let mapping = surface.map(MapFlags::READ, MapHint::DONT_BLOCK).unwrap();
    assert_eq!(mapping.len(), 8192);
    surface.unmap().unwrap();
    drop(presenter);
    assert_eq!(sim.buffer_refs(front_kbo.handle()), Some(1));
}
