//! Scheduling tests against the headless device.

use std::sync::Arc;

use marpii_native::{
    BufferBarrier, NativeError, SubresourceRange,
    ash::vk::{self, Handle},
    desc::{
        BufDesc, BufferCopyRegion, BufferImageCopyRegion, GraphicsPipelineDesc, ImgDesc,
        PipelineDesc, RayTracingPipelineDesc, SwapchainDesc,
    },
    headless::{HandleKind, HeadlessDevice, NativeCall, SubmitRecord},
};

use crate::{
    ArrayElement, Attachment, BatchError, BoundResource, BufferHandle, Engine, EngineConfig,
    RecordError, ResourceError, SchedulingError, ShaderInput, SwapchainHandle, VertexBuffer,
    batch::BatchContext,
    command::CommandLog,
};

fn setup_with(config: EngineConfig) -> (Arc<HeadlessDevice>, Engine) {
    let device = Arc::new(HeadlessDevice::with_default_queues());
    let engine = Engine::new(device.clone(), config).unwrap();
    (device, engine)
}

fn setup() -> (Arc<HeadlessDevice>, Engine) {
    setup_with(EngineConfig::default())
}

fn compute() -> ShaderInput {
    ShaderInput::new(PipelineDesc::Compute {
        shader: vk::ShaderModule::null(),
    })
}

fn graphics() -> ShaderInput {
    ShaderInput::new(PipelineDesc::Graphics(GraphicsPipelineDesc {
        vertex: vk::ShaderModule::null(),
        fragment: None,
        vertex_bindings: Vec::new(),
        vertex_attributes: Vec::new(),
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        cull_mode: vk::CullModeFlags::NONE,
        color_formats: vec![vk::Format::B8G8R8A8_SRGB],
        depth_format: None,
        depth_compare: None,
    }))
}

fn ray_tracing() -> ShaderInput {
    ShaderInput::new(PipelineDesc::RayTracing(RayTracingPipelineDesc {
        raygen: vk::ShaderModule::null(),
        miss: Vec::new(),
        closest_hit: Vec::new(),
        max_recursion: 1,
    }))
}

fn whole(size: u64) -> [BufferCopyRegion; 1] {
    [BufferCopyRegion {
        size,
        ..Default::default()
    }]
}

fn storage(engine: &mut Engine) -> BufferHandle {
    engine.request_buffer(&BufDesc::storage(256)).unwrap()
}

fn native_buffer(engine: &Engine, handle: &BufferHandle) -> vk::Buffer {
    engine.res.buffers.get(handle.key()).unwrap().buffer
}

fn buffer_barriers(device: &HeadlessDevice, buffer: vk::Buffer) -> Vec<BufferBarrier> {
    device
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::Barrier { barriers, .. } => Some(barriers),
            _ => None,
        })
        .flat_map(|b| b.buffers.into_iter().filter(|b| b.buffer == buffer).collect::<Vec<_>>())
        .collect()
}

fn image_transitions(
    device: &HeadlessDevice,
    image: vk::Image,
) -> Vec<(vk::ImageLayout, vk::ImageLayout)> {
    device
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::Barrier { barriers, .. } => Some(barriers),
            _ => None,
        })
        .flat_map(|b| {
            b.images
                .into_iter()
                .filter(|b| b.image == image)
                .map(|b| (b.old_layout, b.new_layout))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn submits_on(device: &HeadlessDevice, queue: u32) -> Vec<SubmitRecord> {
    device
        .submissions()
        .into_iter()
        .filter(|s| s.queue == queue)
        .collect()
}

fn swapchain_image(engine: &Engine, swapchain: &SwapchainHandle, index: u32) -> vk::Image {
    let sc = engine.res.swapchains.get(swapchain.key()).unwrap();
    let key = sc.images[index as usize];
    engine.res.images.get(key).unwrap().image
}

#[test]
fn cross_queue_write_read_transfers_ownership() {
    let (device, mut engine) = setup();
    let a = storage(&mut engine);
    let b = storage(&mut engine);

    engine.queue(2).unwrap().copy_buffer(&a, &b, &whole(256)).unwrap();
    engine
        .queue(1)
        .unwrap()
        .dispatch(compute().bind(0, 0, BoundResource::StorageBuffer(b.clone())), [1, 1, 1])
        .unwrap();
    let stats = engine.execute_all().unwrap();

    let transfer_sem = engine.tracks.0[2].sem;
    let compute_submits = submits_on(&device, 1);
    assert!(
        compute_submits
            .iter()
            .flat_map(|s| s.waits.iter())
            .any(|w| w.semaphore == transfer_sem && w.value == 1)
    );

    let barriers = buffer_barriers(&device, native_buffer(&engine, &b));
    assert_eq!(barriers.len(), 2);
    for barrier in &barriers {
        assert_eq!(barrier.src_queue_family, 2);
        assert_eq!(barrier.dst_queue_family, 1);
    }
    assert_eq!(stats.queues[2].barriers, 1);
    assert_eq!(stats.queues[1].barriers, 1);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn same_queue_accesses_only_use_barriers() {
    let (device, mut engine) = setup();
    let a = storage(&mut engine);
    let b = storage(&mut engine);

    engine
        .queue(1)
        .unwrap()
        .copy_buffer(&a, &b, &whole(256))
        .unwrap()
        .dispatch(compute().bind(0, 0, BoundResource::StorageBuffer(b.clone())), [4, 1, 1])
        .unwrap();
    let stats = engine.execute_all().unwrap();

    assert_eq!(stats.queues[1].barriers, 1);
    assert!(stats.queues.iter().all(|q| q.waits == 0));
    assert!(device.submissions().iter().all(|s| s.waits.is_empty()));

    let barriers = buffer_barriers(&device, native_buffer(&engine, &b));
    assert_eq!(barriers.len(), 1);
    assert!(!barriers[0].is_queue_transfer());
    assert_eq!(barriers[0].src_access, vk::AccessFlags2::TRANSFER_WRITE);
}

#[test]
fn every_command_is_visited_once() {
    let (_device, mut engine) = setup();
    let target = engine
        .request_image(&ImgDesc::color_attachment_2d(32, 32, vk::Format::B8G8R8A8_SRGB))
        .unwrap();
    let a = storage(&mut engine);
    let b = storage(&mut engine);

    engine
        .queue(0)
        .unwrap()
        .begin_pass(&[Attachment::color(target.clone())], None)
        .unwrap()
        .draw_instanced(graphics(), &[], 3, 1)
        .unwrap()
        .draw_instanced(graphics(), &[], 6, 2)
        .unwrap()
        .end_pass()
        .unwrap();
    engine
        .queue(1)
        .unwrap()
        .dispatch(compute().bind(0, 0, BoundResource::StorageBuffer(a.clone())), [1, 1, 1])
        .unwrap();
    engine.queue(2).unwrap().copy_buffer(&a, &b, &whole(64)).unwrap();

    let stats = engine.execute_all().unwrap();
    assert_eq!(stats.queues[0].commands, 4);
    for q in &stats.queues {
        assert_eq!(q.commands, q.pseudo_visits);
        assert_eq!(q.commands, q.executed);
    }
    //both draws share one pipeline
    assert_eq!(engine.cache().pipeline_count(), 2);
}

#[test]
fn resolution_is_deterministic() {
    let (_device, mut engine) = setup();
    let a = storage(&mut engine);
    let b = storage(&mut engine);

    engine.queue(2).unwrap().copy_buffer(&a, &b, &whole(256)).unwrap();
    engine
        .queue(1)
        .unwrap()
        .dispatch(compute().bind(0, 0, BoundResource::StorageBuffer(b.clone())), [1, 1, 1])
        .unwrap();
    engine
        .queue(0)
        .unwrap()
        .dispatch(compute().bind(0, 0, BoundResource::UniformBuffer(b.clone())), [1, 1, 1])
        .unwrap();

    let logs: Vec<CommandLog> = engine.logs.clone();
    let schedule = |engine: &mut Engine| {
        let mut batch = BatchContext::new(
            engine.batch_id,
            logs.clone(),
            engine.device.as_ref(),
            &mut engine.res,
            &engine.tracks,
            Vec::new(),
        )
        .unwrap();
        batch.pseudo_execute(&engine.res, &engine.tracks).unwrap();
        batch.resolve(&engine.tracks);
        let waits = batch
            .pseudo
            .iter()
            .map(|p| p.ops.iter().map(|o| o.waits.to_vec()).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        (batch.order.clone(), batch.resolution.clone(), waits)
    };

    let first = schedule(&mut engine);
    let second = schedule(&mut engine);
    assert_eq!(first, second);
    assert!(first.2.iter().flatten().any(|w| !w.is_empty()));
}

#[test]
fn dependency_cycle_is_detected_before_submission() {
    let (device, mut engine) = setup();
    let a = storage(&mut engine);
    let b = storage(&mut engine);
    engine.queue(2).unwrap().copy_buffer(&a, &b, &whole(256)).unwrap();
    engine.execute_all().unwrap();

    let states = engine.res.states.clone();
    let submissions = device.submissions().len();

    let t1 = engine.request_dependency();
    let t2 = engine.request_dependency();
    engine
        .queue(0)
        .unwrap()
        .acquire_dependency(&t1)
        .unwrap()
        .copy_buffer(&b, &a, &whole(256))
        .unwrap()
        .release_dependency(&t2)
        .unwrap();
    engine
        .queue(1)
        .unwrap()
        .acquire_dependency(&t2)
        .unwrap()
        .release_dependency(&t1)
        .unwrap();

    match engine.execute_all() {
        Err(BatchError::Scheduling(SchedulingError::DependencyCycle { blocked })) => {
            assert_eq!(blocked.len(), 2);
            assert!(blocked.iter().any(|b| b.queue == 0 && b.token == t1.key()));
            assert!(blocked.iter().any(|b| b.queue == 1 && b.token == t2.key()));
        }
        other => panic!("expected a dependency cycle, got {:?}", other),
    }
    assert_eq!(device.submissions().len(), submissions);
    assert_eq!(engine.res.states, states);

    engine.queue(2).unwrap().copy_buffer(&b, &a, &whole(256)).unwrap();
    assert!(engine.execute_all().is_ok());
    assert!(device.validation_errors().is_empty());
}

#[test]
fn token_wait_implies_earlier_accesses() {
    let (device, mut engine) = setup();
    let x = storage(&mut engine);
    let token = engine.request_dependency();

    engine
        .queue(0)
        .unwrap()
        .dispatch(compute().bind(0, 0, BoundResource::StorageBuffer(x.clone())), [1, 1, 1])
        .unwrap()
        .release_dependency(&token)
        .unwrap();
    engine
        .queue(1)
        .unwrap()
        .acquire_dependency(&token)
        .unwrap()
        .dispatch(compute().bind(0, 0, BoundResource::UniformBuffer(x.clone())), [1, 1, 1])
        .unwrap();
    let stats = engine.execute_all().unwrap();

    let graphics_sem = engine.tracks.0[0].sem;
    let waits = submits_on(&device, 1)
        .into_iter()
        .flat_map(|s| s.waits)
        .filter(|w| w.semaphore == graphics_sem)
        .map(|w| w.value)
        .collect::<Vec<_>>();
    assert_eq!(waits, vec![1]);
    assert_eq!(stats.queues[1].waits, 1);

    //the read of X is implied by the token, so only the release and the end are signaled
    assert_eq!(stats.queues[0].signals, 2);
    assert_eq!(stats.queues[0].submissions, 2);
    assert_eq!(stats.queues[0].end_value, 2);

    let release = engine.res.dependencies.get(token.key()).unwrap().release.unwrap();
    assert_eq!(release.queue, 0);
    assert_eq!(release.value, 1);

    //release on queue 0, acquire on queue 1
    assert_eq!(buffer_barriers(&device, native_buffer(&engine, &x)).len(), 2);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn swapchain_image_follows_pass_and_present() {
    let (device, mut engine) = setup();
    let swapchain = engine
        .request_swapchain(&SwapchainDesc {
            width: 64,
            height: 64,
            ..Default::default()
        })
        .unwrap();
    let extent = vk::Extent2D {
        width: 64,
        height: 64,
    };

    let index = engine.acquire_next_image(&swapchain, extent).unwrap();
    assert_eq!(engine.acquire_next_image(&swapchain, extent), Ok(index));

    engine
        .queue(0)
        .unwrap()
        .begin_pass(&[Attachment::color(swapchain.clone())], None)
        .unwrap()
        .draw_instanced(graphics(), &[], 3, 1)
        .unwrap()
        .end_pass()
        .unwrap()
        .present(&swapchain)
        .unwrap();
    assert_eq!(
        engine.acquire_next_image(&swapchain, extent),
        Err(BatchError::Resource(ResourceError::PresentPending))
    );
    engine.execute_all().unwrap();

    let image = swapchain_image(&engine, &swapchain, index);
    assert_eq!(
        image_transitions(&device, image),
        vec![
            (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            ),
            (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR
            ),
        ]
    );
    assert!(
        device
            .calls()
            .iter()
            .any(|c| matches!(c, NativeCall::Present { index: i, .. } if *i == index))
    );

    let mut queue = engine.queue(0).unwrap();
    assert_eq!(
        queue.present(&swapchain).err(),
        Some(RecordError::SwapchainNotAcquired)
    );
    assert_eq!(
        queue
            .begin_pass(&[Attachment::color(swapchain.clone())], None)
            .err(),
        Some(RecordError::SwapchainNotAcquired)
    );
    assert!(device.validation_errors().is_empty());
}

#[test]
fn out_of_date_swapchain_is_recreated() {
    let (device, mut engine) = setup();
    let swapchain = engine
        .request_swapchain(&SwapchainDesc {
            width: 64,
            height: 64,
            ..Default::default()
        })
        .unwrap();
    let count_creates = |device: &HeadlessDevice| {
        device
            .calls()
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    NativeCall::Create {
                        kind: HandleKind::Swapchain,
                        ..
                    }
                )
            })
            .count()
    };

    device.inject_acquire_error(NativeError::SwapchainOutOfDate);
    let extent = vk::Extent2D {
        width: 64,
        height: 64,
    };
    engine.acquire_next_image(&swapchain, extent).unwrap();
    assert_eq!(count_creates(&device), 2);

    engine.queue(0).unwrap().present(&swapchain).unwrap();
    engine.execute_all().unwrap();

    //resized window
    let resized = vk::Extent2D {
        width: 128,
        height: 32,
    };
    engine.acquire_next_image(&swapchain, resized).unwrap();
    assert_eq!(count_creates(&device), 3);
    assert_eq!(device.live_handles(HandleKind::Swapchain), 1);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn swapchain_recreation_gives_up() {
    let (device, mut engine) = setup();
    let swapchain = engine.request_swapchain(&SwapchainDesc::default()).unwrap();
    for _ in 0..4 {
        device.inject_acquire_error(NativeError::SwapchainOutOfDate);
    }
    let result = engine.acquire_next_image(
        &swapchain,
        vk::Extent2D {
            width: 1,
            height: 1,
        },
    );
    assert_eq!(
        result,
        Err(BatchError::Resource(ResourceError::RecreationFailed(3)))
    );
}

#[test]
fn transient_buffer_lives_until_batch_retired() {
    let (device, mut engine) = setup();
    device.set_auto_complete(false);

    let a = storage(&mut engine);
    let staging = engine
        .request_transient_buffer(&BufDesc::storage(256))
        .unwrap();
    let raw = native_buffer(&engine, &staging).as_raw();
    engine.queue(2).unwrap().copy_buffer(&staging, &a, &whole(256)).unwrap();
    engine.execute_all().unwrap();

    engine.retire_finished().unwrap();
    assert!(device.is_alive(raw));
    assert_eq!(engine.inflight_batches(), 1);

    device.complete_all();
    engine.retire_finished().unwrap();
    assert!(!device.is_alive(raw));
    assert_eq!(engine.inflight_batches(), 0);
    assert!(device.validation_errors().is_empty());
}

#[test]
#[should_panic]
fn transient_buffer_is_bound_to_its_batch() {
    let (_device, mut engine) = setup();
    let a = storage(&mut engine);
    let staging = engine
        .request_transient_buffer(&BufDesc::storage(256))
        .unwrap();
    engine.execute_all().unwrap();
    let _ = engine.queue(2).unwrap().copy_buffer(&staging, &a, &whole(256));
}

#[test]
fn dropped_buffer_is_destroyed_after_last_use() {
    let (device, mut engine) = setup();
    device.set_auto_complete(false);

    let a = storage(&mut engine);
    let b = storage(&mut engine);
    let raw = native_buffer(&engine, &b).as_raw();
    engine.queue(1).unwrap().copy_buffer(&a, &b, &whole(256)).unwrap();
    engine.execute_all().unwrap();
    drop(b);

    engine.retire_finished().unwrap();
    assert!(device.is_alive(raw));

    device.complete_all();
    engine.retire_finished().unwrap();
    assert!(!device.is_alive(raw));
    assert!(device.validation_errors().is_empty());
}

#[test]
fn inflight_limit_blocks_on_oldest_batch() {
    let (device, mut engine) = setup_with(EngineConfig::default().with(|c| {
        c.max_inflight_batches = 1;
    }));
    device.set_auto_complete(false);

    let a = storage(&mut engine);
    let b = storage(&mut engine);
    engine.queue(2).unwrap().copy_buffer(&a, &b, &whole(256)).unwrap();
    engine.execute_all().unwrap();

    engine.queue(2).unwrap().copy_buffer(&b, &a, &whole(256)).unwrap();
    assert!(matches!(
        engine.execute_all(),
        Err(BatchError::Native(NativeError::Timeout(_)))
    ));

    device.complete_all();
    let stats = engine.execute_all().unwrap();
    assert_eq!(stats.queues[2].commands, 1);
    assert_eq!(engine.inflight_batches(), 1);
}

#[test]
fn ownership_of_earlier_batch_is_released_in_prologue() {
    let (device, mut engine) = setup();
    let a = storage(&mut engine);
    let b = storage(&mut engine);

    engine.queue(2).unwrap().copy_buffer(&a, &b, &whole(256)).unwrap();
    engine.execute_all().unwrap();
    device.take_calls();

    engine
        .queue(1)
        .unwrap()
        .dispatch(compute().bind(0, 0, BoundResource::StorageBuffer(b.clone())), [1, 1, 1])
        .unwrap();
    let stats = engine.execute_all().unwrap();

    let prologue = stats.queues[2].begin_value + 1;
    let transfer_sem = engine.tracks.0[2].sem;
    let transfer_submits = submits_on(&device, 2);
    assert!(
        transfer_submits[0]
            .signals
            .iter()
            .any(|s| s.semaphore == transfer_sem && s.value == prologue)
    );
    assert!(
        submits_on(&device, 1)
            .iter()
            .flat_map(|s| s.waits.iter())
            .any(|w| w.semaphore == transfer_sem && w.value == prologue)
    );

    let barriers = buffer_barriers(&device, native_buffer(&engine, &b));
    assert_eq!(barriers.len(), 2);
    assert!(barriers.iter().all(|b| b.is_queue_transfer()));
    assert!(device.validation_errors().is_empty());
}

#[test]
fn pause_splits_submissions() {
    let (device, mut engine) = setup();
    let a = storage(&mut engine);
    let b = storage(&mut engine);
    let c = storage(&mut engine);
    let d = storage(&mut engine);

    engine
        .queue(1)
        .unwrap()
        .copy_buffer(&a, &b, &whole(256))
        .unwrap()
        .pause()
        .unwrap()
        .copy_buffer(&c, &d, &whole(256))
        .unwrap();
    let stats = engine.execute_all().unwrap();
    assert_eq!(stats.queues[1].submissions, 2);
    assert_eq!(submits_on(&device, 1).len(), 2);
}

#[test]
fn timers_resolve_after_retirement() {
    let (_device, mut engine) = setup();
    let a = storage(&mut engine);
    engine
        .queue(1)
        .unwrap()
        .start_timer("simulation")
        .unwrap()
        .dispatch(compute().bind(0, 0, BoundResource::StorageBuffer(a.clone())), [8, 8, 1])
        .unwrap()
        .end_timer("simulation")
        .unwrap();
    engine.execute_all().unwrap();
    engine.wait_idle().unwrap();

    let timings = engine.timings();
    assert_eq!(timings.len(), 1);
    assert_eq!(timings[0].name, "simulation");
    assert_eq!(timings[0].queue, 1);
    assert!(timings[0].timing > 0.0);
}

#[test]
fn recording_errors() {
    let (_device, mut engine) = setup();
    let a = storage(&mut engine);

    assert!(matches!(engine.queue(7), Err(RecordError::NoSuchQueue(7))));
    assert_eq!(
        engine.queue(2).unwrap().dispatch(compute(), [1, 1, 1]).err(),
        Some(RecordError::UnsupportedOnQueue {
            queue: 2,
            required: vk::QueueFlags::COMPUTE
        })
    );
    assert_eq!(
        engine
            .queue(0)
            .unwrap()
            .draw_instanced(graphics(), &[], 3, 1)
            .err(),
        Some(RecordError::PassNotOpen("Draw"))
    );
    assert_eq!(
        engine.queue(0).unwrap().end_timer("frame").err(),
        Some(RecordError::TimerNotStarted("frame".to_owned()))
    );
    assert_eq!(engine.queue_for(vk::QueueFlags::TRANSFER).unwrap().queue(), 2);

    let target = engine
        .request_image(&ImgDesc::color_attachment_2d(8, 8, vk::Format::R8G8B8A8_UNORM))
        .unwrap();
    let mut queue = engine.queue(0).unwrap();
    queue.begin_pass(&[Attachment::color(target)], None).unwrap();
    assert_eq!(
        queue.copy_buffer(&a, &a, &whole(16)).err(),
        Some(RecordError::CommandInsidePass("CopyBuffer"))
    );
    queue.end_pass().unwrap();
}

#[test]
#[should_panic]
fn unended_pass_panics_on_execute() {
    let (_device, mut engine) = setup();
    let target = engine
        .request_image(&ImgDesc::color_attachment_2d(8, 8, vk::Format::R8G8B8A8_UNORM))
        .unwrap();
    engine
        .queue(0)
        .unwrap()
        .begin_pass(&[Attachment::color(target)], None)
        .unwrap();
    let _ = engine.execute_all();
}

#[test]
fn empty_batch_only_signals() {
    let (device, mut engine) = setup();
    let stats = engine.execute_all().unwrap();
    assert!(stats.is_empty());
    for s in device.submissions() {
        assert!(s.command_lists.is_empty());
        assert!(s.waits.is_empty());
        assert_eq!(s.signals.len(), 1);
    }
}

#[test]
fn dropping_engine_destroys_everything() {
    let (device, mut engine) = setup();
    device.set_auto_complete(false);

    let a = storage(&mut engine);
    let b = storage(&mut engine);
    let swapchain = engine.request_swapchain(&SwapchainDesc::default()).unwrap();
    engine
        .acquire_next_image(
            &swapchain,
            vk::Extent2D {
                width: 1,
                height: 1,
            },
        )
        .unwrap();
    engine.queue(2).unwrap().copy_buffer(&a, &b, &whole(256)).unwrap();
    engine
        .queue(1)
        .unwrap()
        .dispatch(compute().bind(0, 0, BoundResource::StorageBuffer(b.clone())), [1, 1, 1])
        .unwrap();
    engine.queue(0).unwrap().present(&swapchain).unwrap();
    engine.execute_all().unwrap();

    //recorded but never executed
    engine.queue(2).unwrap().copy_buffer(&b, &a, &whole(256)).unwrap();
    drop(engine);

    for kind in [
        HandleKind::Buffer,
        HandleKind::Image,
        HandleKind::Semaphore,
        HandleKind::CommandList,
        HandleKind::DescriptorSetLayout,
        HandleKind::PipelineLayout,
        HandleKind::Pipeline,
        HandleKind::DescriptorSet,
        HandleKind::QueryPool,
        HandleKind::Swapchain,
    ] {
        assert_eq!(device.live_handles(kind), 0, "{:?} still alive", kind);
    }
    assert!(device.validation_errors().is_empty());
    drop((a, b, swapchain));
}

#[test]
fn acceleration_structures_are_built_before_tracing() {
    let (device, mut engine) = setup();
    let vertices = storage(&mut engine);
    let instances = storage(&mut engine);
    let blas = engine.request_blas(1024, 512).unwrap();
    let tlas = engine.request_tlas(1024, 256).unwrap();
    let buffers = device.live_handles(HandleKind::Buffer);

    engine
        .queue(1)
        .unwrap()
        .build_blas(&blas, &vertices, 12, 3, None, 1)
        .unwrap()
        .build_tlas(&tlas, &instances, &[blas.clone()])
        .unwrap();
    engine
        .queue(0)
        .unwrap()
        .trace_rays(
            ray_tracing().bind(0, 0, BoundResource::AccelerationStructure(tlas.clone())),
            [64, 64, 1],
        )
        .unwrap();
    engine.execute_all().unwrap();

    let calls = device.calls();
    let builds = calls
        .iter()
        .filter_map(|c| match c {
            NativeCall::BuildAccelerationStructure { ty, .. } => Some(*ty),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        builds,
        vec![
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL
        ]
    );
    assert!(calls.iter().any(|c| matches!(c, NativeCall::TraceRays { .. })));

    //the top level build reads the bottom level structure written right before
    let blas_build = calls
        .iter()
        .position(|c| matches!(c, NativeCall::BuildAccelerationStructure { .. }))
        .unwrap();
    assert!(calls[blas_build..].iter().any(|c| match c {
        NativeCall::Barrier { barriers, .. } => !barriers.memory.is_empty(),
        _ => false,
    }));

    //tracing waits for the build on the compute queue, without ownership transfer
    let compute_sem = engine.tracks.0[1].sem;
    assert!(
        submits_on(&device, 0)
            .iter()
            .flat_map(|s| s.waits.iter())
            .any(|w| w.semaphore == compute_sem)
    );

    //scratch memory lives until the batch retired
    assert_eq!(device.live_handles(HandleKind::Buffer), buffers + 2);
    engine.wait_idle().unwrap();
    assert_eq!(device.live_handles(HandleKind::Buffer), buffers);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn trace_reads_bottom_level_of_the_build_it_follows() {
    let (device, mut engine) = setup();
    let vertices = storage(&mut engine);
    let other_vertices = storage(&mut engine);
    let instances = storage(&mut engine);
    let b1 = engine.request_blas(1024, 256).unwrap();
    let b2 = engine.request_blas(1024, 256).unwrap();
    let tlas = engine.request_tlas(1024, 256).unwrap();

    engine
        .queue(1)
        .unwrap()
        .build_blas(&b1, &vertices, 12, 3, None, 1)
        .unwrap()
        .build_blas(&b2, &vertices, 12, 3, None, 1)
        .unwrap()
        .build_tlas(&tlas, &instances, &[b1.clone()])
        .unwrap()
        .trace_rays(
            ray_tracing().bind(0, 0, BoundResource::AccelerationStructure(tlas.clone())),
            [8, 8, 1],
        )
        .unwrap();
    //rebuilds b1 while the trace above still traverses it
    engine
        .queue(0)
        .unwrap()
        .build_blas(&b1, &other_vertices, 12, 3, None, 1)
        .unwrap();
    engine
        .queue(1)
        .unwrap()
        .build_tlas(&tlas, &instances, &[b2.clone()])
        .unwrap();
    engine.execute_all().unwrap();

    let trace_list = device
        .calls()
        .into_iter()
        .find_map(|c| match c {
            NativeCall::TraceRays { command_list, .. } => Some(command_list),
            _ => None,
        })
        .unwrap();
    let compute_sem = engine.tracks.0[1].sem;
    let trace_submit = submits_on(&device, 1)
        .into_iter()
        .find(|s| s.command_lists.contains(&trace_list))
        .unwrap();
    let after_trace = trace_submit
        .signals
        .iter()
        .find(|s| s.semaphore == compute_sem)
        .unwrap()
        .value;

    let waits = submits_on(&device, 0)
        .into_iter()
        .flat_map(|s| s.waits)
        .filter(|w| w.semaphore == compute_sem)
        .map(|w| w.value)
        .collect::<Vec<_>>();
    assert_eq!(waits, vec![after_trace]);

    //the latest build is what later batches trace against
    let built_from = engine
        .res
        .acceleration_structures
        .get(tlas.key())
        .unwrap()
        .built_from
        .iter()
        .map(|b| b.key())
        .collect::<Vec<_>>();
    assert_eq!(built_from, vec![b2.key()]);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn image_copies_only_touch_their_mip_levels() {
    let (device, mut engine) = setup();
    let staging = storage(&mut engine);
    let texture = engine
        .request_image(&ImgDesc::texture_2d(16, 16, vk::Format::R8G8B8A8_UNORM).with_mips(4))
        .unwrap();
    let region = |mip: u32, size: u32| BufferImageCopyRegion {
        buffer_offset: 0,
        aspect: vk::ImageAspectFlags::COLOR,
        mip,
        base_layer: 0,
        layer_count: 1,
        offset: [0; 3],
        extent: [size, size, 1],
    };

    engine
        .queue(2)
        .unwrap()
        .copy_buffer_to_image(&staging, &texture, &[region(0, 16), region(2, 4)])
        .unwrap();
    engine.execute_all().unwrap();

    let image = engine.res.images.get(texture.key()).unwrap().image;
    let ranges = device
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::Barrier { barriers, .. } => Some(barriers),
            _ => None,
        })
        .flat_map(|b| b.images.into_iter().filter(|b| b.image == image).collect::<Vec<_>>())
        .map(|b| (b.range.base_mip, b.range.mip_count, b.new_layout))
        .collect::<Vec<_>>();
    assert_eq!(
        ranges,
        vec![
            (0, 1, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            (2, 1, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        ]
    );
    assert!(device.calls().iter().any(|c| matches!(
        c,
        NativeCall::CopyBufferToImage { dst, layout, .. }
            if *dst == image && *layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL
    )));
    assert!(device.validation_errors().is_empty());
}

#[test]
fn subresources_outside_of_image_are_rejected() {
    let (_device, mut engine) = setup();
    let staging = storage(&mut engine);
    let texture = engine
        .request_image(&ImgDesc::texture_2d(16, 16, vk::Format::R8G8B8A8_UNORM).with_mips(4))
        .unwrap();
    let target = engine
        .request_image(&ImgDesc::color_attachment_2d(8, 8, vk::Format::R8G8B8A8_UNORM))
        .unwrap();

    let past_last_mip = BufferImageCopyRegion {
        buffer_offset: 0,
        aspect: vk::ImageAspectFlags::COLOR,
        mip: 4,
        base_layer: 0,
        layer_count: 1,
        offset: [0; 3],
        extent: [1, 1, 1],
    };
    let two_layers = BufferImageCopyRegion {
        mip: 0,
        layer_count: 2,
        ..past_last_mip
    };
    let mut queue = engine.queue(2).unwrap();
    assert_eq!(
        queue.copy_buffer_to_image(&staging, &texture, &[past_last_mip]).err(),
        Some(RecordError::SubresourceOutOfRange {
            image: texture.key().into(),
            range: past_last_mip.range(),
        })
    );
    assert_eq!(
        queue.copy_buffer_to_image(&staging, &texture, &[two_layers]).err(),
        Some(RecordError::SubresourceOutOfRange {
            image: texture.key().into(),
            range: two_layers.range(),
        })
    );

    let mut queue = engine.queue(0).unwrap();
    assert_eq!(
        queue
            .begin_pass(&[Attachment::color(target.clone()).with_subresource(40, 0)], None)
            .err(),
        Some(RecordError::SubresourceOutOfRange {
            image: target.key().into(),
            range: SubresourceRange::single(vk::ImageAspectFlags::COLOR, 40, 0),
        })
    );
    //nothing was recorded, a valid pass can still be opened
    queue
        .begin_pass(&[Attachment::color(target.clone())], None)
        .unwrap()
        .end_pass()
        .unwrap();
    assert_eq!(engine.logs[2].len(), 0);
    assert_eq!(engine.logs[0].len(), 2);
}

#[test]
fn descriptor_array_elements_are_tracked() {
    let (device, mut engine) = setup();
    let a = storage(&mut engine);
    let b = storage(&mut engine);
    let array = engine
        .request_descriptor_array(
            vk::DescriptorType::STORAGE_BUFFER,
            vec![ArrayElement::StorageBuffer(b.clone())],
        )
        .unwrap();

    engine.queue(2).unwrap().copy_buffer(&a, &b, &whole(256)).unwrap();
    engine
        .queue(1)
        .unwrap()
        .dispatch(compute().bind(0, 0, BoundResource::DescriptorArray(array.clone())), [1, 1, 1])
        .unwrap();
    let stats = engine.execute_all().unwrap();

    let transfer_sem = engine.tracks.0[2].sem;
    assert!(
        submits_on(&device, 1)
            .iter()
            .flat_map(|s| s.waits.iter())
            .any(|w| w.semaphore == transfer_sem)
    );
    assert_eq!(stats.queues[1].waits, 1);

    let barriers = buffer_barriers(&device, native_buffer(&engine, &b));
    assert_eq!(barriers.len(), 2);
    assert!(barriers.iter().all(|b| b.is_queue_transfer()));
    assert!(device.validation_errors().is_empty());
}

#[test]
fn pass_barriers_are_recorded_before_rendering() {
    let (device, mut engine) = setup();
    let vertices = storage(&mut engine);
    let target = engine
        .request_image(&ImgDesc::color_attachment_2d(8, 8, vk::Format::R8G8B8A8_UNORM))
        .unwrap();
    let vertex_buffer = [VertexBuffer {
        buffer: vertices.clone(),
        offset: 0,
    }];

    engine
        .queue(0)
        .unwrap()
        .dispatch(
            compute().bind(0, 0, BoundResource::StorageBuffer(vertices.clone())),
            [1, 1, 1],
        )
        .unwrap()
        .begin_pass(&[Attachment::color(target.clone())], None)
        .unwrap()
        .draw_instanced(graphics(), &vertex_buffer, 3, 1)
        .unwrap()
        .draw_instanced(graphics(), &vertex_buffer, 3, 1)
        .unwrap()
        .end_pass()
        .unwrap();
    engine.execute_all().unwrap();

    let calls = device.calls();
    let begin = calls
        .iter()
        .position(|c| matches!(c, NativeCall::BeginRendering { .. }))
        .unwrap();
    let end = calls
        .iter()
        .position(|c| matches!(c, NativeCall::EndRendering { .. }))
        .unwrap();
    assert!(begin < end);

    let buffer = native_buffer(&engine, &vertices);
    let vertex_barrier = calls
        .iter()
        .position(|c| match c {
            NativeCall::Barrier { barriers, .. } => barriers.buffers.iter().any(|b| {
                b.buffer == buffer && b.dst_access == vk::AccessFlags2::VERTEX_ATTRIBUTE_READ
            }),
            _ => false,
        })
        .unwrap();
    assert!(vertex_barrier < begin);
    assert!(!calls[begin..end].iter().any(|c| matches!(c, NativeCall::Barrier { .. })));
    assert_eq!(
        calls
            .iter()
            .filter(|c| matches!(c, NativeCall::Draw { .. }))
            .count(),
        2
    );
    assert!(device.validation_errors().is_empty());
}

#[test]
fn failed_present_retires_the_batch() {
    let (device, mut engine) = setup();
    let swapchain = engine
        .request_swapchain(&SwapchainDesc {
            width: 64,
            height: 64,
            ..Default::default()
        })
        .unwrap();
    let extent = vk::Extent2D {
        width: 64,
        height: 64,
    };

    engine.acquire_next_image(&swapchain, extent).unwrap();
    engine
        .queue(0)
        .unwrap()
        .begin_pass(&[Attachment::color(swapchain.clone())], None)
        .unwrap()
        .draw_instanced(graphics(), &[], 3, 1)
        .unwrap()
        .end_pass()
        .unwrap()
        .present(&swapchain)
        .unwrap();
    device.inject_present_error(NativeError::VkError(vk::Result::ERROR_DEVICE_LOST));
    assert_eq!(
        engine.execute_all().err(),
        Some(BatchError::Native(NativeError::VkError(
            vk::Result::ERROR_DEVICE_LOST
        )))
    );
    assert_eq!(engine.inflight_batches(), 0);

    //the discarded present forces a fresh acquire
    engine.acquire_next_image(&swapchain, extent).unwrap();
    engine
        .queue(0)
        .unwrap()
        .begin_pass(&[Attachment::color(swapchain.clone())], None)
        .unwrap()
        .end_pass()
        .unwrap()
        .present(&swapchain)
        .unwrap();
    engine.execute_all().unwrap();
    engine.wait_idle().unwrap();
    assert_eq!(engine.inflight_batches(), 0);
}
