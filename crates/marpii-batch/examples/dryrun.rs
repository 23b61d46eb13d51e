//! Schedules a small frame on a headless device and prints what would have been submitted.
//!
//! Uploads data on the transfer queue, simulates on the async compute queue, renders and presents on the
//! graphics queue. Run with `RUST_LOG=trace` and the `log_reasoning` feature to see why each barrier and wait
//! was inserted.

use std::sync::Arc;

use marpii_batch::{
    Attachment, BoundResource, Engine, EngineConfig, ShaderInput, VertexBuffer,
    marpii_native::{
        ash::vk,
        desc::{BufDesc, BufferCopyRegion, GraphicsPipelineDesc, PipelineDesc, SwapchainDesc},
        headless::{HeadlessDevice, NativeCall},
    },
};

const FRAMES: usize = 3;
const PARTICLES: u64 = 1024;

fn main() -> anyhow::Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()?;

    let device = Arc::new(HeadlessDevice::with_default_queues());
    let mut engine = Engine::new(device.clone(), EngineConfig::default())?;

    let extent = vk::Extent2D {
        width: 800,
        height: 600,
    };
    let swapchain = engine.request_swapchain(&SwapchainDesc {
        width: extent.width,
        height: extent.height,
        ..Default::default()
    })?;
    let particles = engine.request_buffer(&BufDesc::storage(PARTICLES * 16))?;

    let simulate = ShaderInput::new(PipelineDesc::Compute {
        shader: vk::ShaderModule::null(),
    })
    .bind(0, 0, BoundResource::StorageBuffer(particles.clone()))
    .with_push_constants(&0.016f32.to_le_bytes());

    let draw = ShaderInput::new(PipelineDesc::Graphics(GraphicsPipelineDesc {
        vertex: vk::ShaderModule::null(),
        fragment: Some(vk::ShaderModule::null()),
        vertex_bindings: Vec::new(),
        vertex_attributes: Vec::new(),
        topology: vk::PrimitiveTopology::POINT_LIST,
        cull_mode: vk::CullModeFlags::NONE,
        color_formats: vec![SwapchainDesc::default().format],
        depth_format: None,
        depth_compare: None,
    }));

    for frame in 0..FRAMES {
        let upload = engine.request_transient_buffer(&BufDesc::storage(PARTICLES * 16))?;
        engine
            .queue_for(vk::QueueFlags::TRANSFER)?
            .copy_buffer(
                &upload,
                &particles,
                &[BufferCopyRegion {
                    size: PARTICLES * 16,
                    ..Default::default()
                }],
            )?;
        engine
            .queue_for(vk::QueueFlags::COMPUTE)?
            .start_timer("simulation")?
            .dispatch(simulate.clone(), [(PARTICLES / 64) as u32, 1, 1])?
            .end_timer("simulation")?;

        engine.acquire_next_image(&swapchain, extent)?;
        engine
            .queue_for(vk::QueueFlags::GRAPHICS)?
            .begin_pass(&[Attachment::color(swapchain.clone())], None)?
            .draw_instanced(
                draw.clone(),
                &[VertexBuffer {
                    buffer: particles.clone(),
                    offset: 0,
                }],
                PARTICLES as u32,
                1,
            )?
            .end_pass()?
            .present(&swapchain)?;

        let stats = engine.execute_all()?;
        log::info!("Frame {}:", frame);
        for q in &stats.queues {
            log::info!(
                "  queue {}: {} commands, {} submissions, {} barriers, {} waits, timeline {} -> {}",
                q.queue,
                q.commands,
                q.submissions,
                q.barriers,
                q.waits,
                q.begin_value,
                q.end_value
            );
        }
    }

    engine.wait_idle()?;
    for timing in engine.timings() {
        log::info!("{} on queue {}: {}ns", timing.name, timing.queue, timing.timing);
    }

    let submissions = device
        .calls()
        .iter()
        .filter(|c| matches!(c, NativeCall::Submit(_)))
        .count();
    log::info!("{} submissions in total", submissions);

    drop(engine);
    for error in device.validation_errors() {
        log::error!("{}", error);
    }
    Ok(())
}
