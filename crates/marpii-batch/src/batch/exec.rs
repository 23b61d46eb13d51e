//! The execution pass. Replays the pseudo pass order and records the native commands together with the barriers,
//! waits and signals the pseudo pass derived.

use marpii_native::{
    BarrierBuilder, NativeDevice, NativeError, SubresourceRange,
    ash::vk,
    desc::{
        AsBuildInfo, AsGeometry, DescriptorBinding, DescriptorResource, DescriptorWrite,
        RenderingAttachment, RenderingInfo, SemaphoreSubmit, SubmitInfo,
    },
};
use smallvec::{SmallVec, smallvec};

use super::{BatchContext, QueueStats, resolve::WAIT_STAGE};
use crate::{
    BatchError,
    cache::ContextCache,
    command::{BoundResource, Command, PassAttachment, ShaderInput},
    resources::{
        ResourceError, Resources,
        res_states::{ArrayElement, BufferKey},
    },
    timer::TimestampTable,
    track::Tracks,
};

///Execution state of a single queue.
pub(crate) struct QueueContext {
    pub(crate) queue: u32,
    sem: vk::Semaphore,
    open: Option<vk::CommandBuffer>,
    ///Attached to the next submission that carries a command list or signals.
    staged_waits: Vec<SemaphoreSubmit>,
    ///Every command list of this batch. Freed once the batch retired.
    pub(crate) lists: Vec<vk::CommandBuffer>,
    pub(crate) descriptor_sets: Vec<vk::DescriptorSet>,
    pub(crate) timer: Option<TimestampTable>,
    pub(crate) stats: QueueStats,
}

impl QueueContext {
    pub(crate) fn new(queue: u32, sem: vk::Semaphore) -> Self {
        QueueContext {
            queue,
            sem,
            open: None,
            staged_waits: Vec::new(),
            lists: Vec::new(),
            descriptor_sets: Vec::new(),
            timer: None,
            stats: QueueStats::default(),
        }
    }

    ///Returns the open command list, or begins a new one.
    fn list(&mut self, device: &dyn NativeDevice) -> Result<vk::CommandBuffer, NativeError> {
        if let Some(cl) = self.open {
            return Ok(cl);
        }
        let cl = device.begin_command_list(self.queue)?;
        self.lists.push(cl);
        self.open = Some(cl);
        Ok(cl)
    }

    fn timeline_signal(&self, value: u64) -> SemaphoreSubmit {
        SemaphoreSubmit {
            semaphore: self.sem,
            value,
            stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        }
    }

    ///Submits the open command list together with all staged waits and `signals`. Does nothing if there is neither
    /// a list nor a signal. Staged waits stay staged in that case.
    pub(crate) fn flush(
        &mut self,
        device: &dyn NativeDevice,
        signals: &[SemaphoreSubmit],
    ) -> Result<(), NativeError> {
        if self.open.is_none() && signals.is_empty() {
            return Ok(());
        }

        let lists: SmallVec<[vk::CommandBuffer; 1]> = match self.open.take() {
            Some(cl) => {
                device.end_command_list(cl)?;
                smallvec![cl]
            }
            None => SmallVec::new(),
        };

        #[cfg(feature = "logging")]
        log::trace!(
            "Queue {}: submit {} lists, {} waits, {} signals",
            self.queue,
            lists.len(),
            self.staged_waits.len(),
            signals.len()
        );

        device.submit(
            self.queue,
            &SubmitInfo {
                waits: &self.staged_waits,
                command_lists: &lists,
                signals,
            },
        )?;
        self.stats.submissions += 1;
        self.stats.waits += self.staged_waits.len();
        self.stats.signals += signals.len();
        self.staged_waits.clear();
        Ok(())
    }

    fn barrier(
        &mut self,
        device: &dyn NativeDevice,
        barriers: &BarrierBuilder,
    ) -> Result<(), NativeError> {
        if barriers.has_barrier() {
            let cl = self.list(device)?;
            device.cmd_pipeline_barrier(cl, barriers);
            self.stats.barriers += barriers.len();
        }
        Ok(())
    }
}

fn buffer_descriptor(res: &Resources, key: BufferKey) -> Result<DescriptorResource, ResourceError> {
    Ok(DescriptorResource::Buffer {
        buffer: res.native_buffer(key)?,
        offset: 0,
        range: vk::WHOLE_SIZE,
    })
}

fn element_descriptor(
    res: &Resources,
    element: &ArrayElement,
) -> Result<DescriptorResource, ResourceError> {
    Ok(match element {
        ArrayElement::StorageBuffer(b) | ArrayElement::UniformBuffer(b) => {
            buffer_descriptor(res, b.key())?
        }
        ArrayElement::SampledImage(i) => DescriptorResource::Image {
            image: res.native_image(i.key())?,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        },
        ArrayElement::StorageImage(i) => DescriptorResource::Image {
            image: res.native_image(i.key())?,
            layout: vk::ImageLayout::GENERAL,
        },
        ArrayElement::Sampler(s) => DescriptorResource::Sampler(res.native_sampler(s.key())?),
    })
}

///Descriptor type, descriptor count and the native resources of a binding.
fn descriptor(
    res: &Resources,
    resource: &BoundResource,
) -> Result<(vk::DescriptorType, u32, SmallVec<[DescriptorResource; 1]>), ResourceError> {
    Ok(match resource {
        BoundResource::StorageBuffer(b) => (
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            smallvec![buffer_descriptor(res, b.key())?],
        ),
        BoundResource::UniformBuffer(b) => (
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            smallvec![buffer_descriptor(res, b.key())?],
        ),
        BoundResource::SampledImage(i) => (
            vk::DescriptorType::SAMPLED_IMAGE,
            1,
            smallvec![DescriptorResource::Image {
                image: res.native_image(i.key())?,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }],
        ),
        BoundResource::StorageImage(i) => (
            vk::DescriptorType::STORAGE_IMAGE,
            1,
            smallvec![DescriptorResource::Image {
                image: res.native_image(i.key())?,
                layout: vk::ImageLayout::GENERAL,
            }],
        ),
        BoundResource::Sampler(s) => (
            vk::DescriptorType::SAMPLER,
            1,
            smallvec![DescriptorResource::Sampler(res.native_sampler(s.key())?)],
        ),
        //image first, then its sampler
        BoundResource::CombinedImageSampler(i, s) => (
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            smallvec![
                DescriptorResource::Image {
                    image: res.native_image(i.key())?,
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
                DescriptorResource::Sampler(res.native_sampler(s.key())?)
            ],
        ),
        BoundResource::AccelerationStructure(tlas) => (
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            smallvec![DescriptorResource::AccelerationStructure(
                res.native_acceleration_structure(tlas.key())?
            )],
        ),
        BoundResource::DescriptorArray(array) => {
            let arr = res
                .descriptor_arrays
                .get(array.key())
                .ok_or(ResourceError::Unknown(array.key().into()))?;
            let resources = arr
                .elements
                .iter()
                .map(|e| element_descriptor(res, e))
                .collect::<Result<SmallVec<_>, _>>()?;
            (arr.ty, resources.len() as u32, resources)
        }
    })
}

///Binds pipeline, descriptor sets and push constants of `input`. Descriptor sets are allocated per use and
/// appended to `sets`.
pub(crate) fn bind_shader_input(
    device: &dyn NativeDevice,
    cache: &mut ContextCache,
    res: &Resources,
    cl: vk::CommandBuffer,
    input: &ShaderInput,
    sets: &mut Vec<vk::DescriptorSet>,
) -> Result<(), BatchError> {
    let stages = input.pipeline.stages();
    let bind_point = input.pipeline.bind_point();

    let set_count = input
        .bindings
        .iter()
        .map(|b| b.set + 1)
        .max()
        .unwrap_or(0);

    let mut layouts = SmallVec::<[vk::DescriptorSetLayout; 4]>::new();
    let mut writes = Vec::with_capacity(set_count as usize);
    for set in 0..set_count {
        let mut bindings = SmallVec::<[DescriptorBinding; 8]>::new();
        let mut set_writes = SmallVec::<[DescriptorWrite; 8]>::new();
        for binding in input.bindings.iter().filter(|b| b.set == set) {
            let (ty, count, resources) = descriptor(res, &binding.resource)?;
            bindings.push(DescriptorBinding {
                binding: binding.binding,
                ty,
                count,
                stages,
            });
            set_writes.push(DescriptorWrite {
                binding: binding.binding,
                array_element: 0,
                ty,
                resources,
            });
        }
        layouts.push(cache.get_or_create_set_layout(device, &bindings)?);
        writes.push(set_writes);
    }

    let layout =
        cache.get_or_create_pipeline_layout(device, &layouts, input.push_constants.len() as u32)?;
    let pipeline = cache.get_or_create_pipeline(device, &input.pipeline, layout)?;
    device.cmd_bind_pipeline(cl, bind_point, pipeline);

    for (set, (set_layout, set_writes)) in layouts.iter().zip(writes.iter()).enumerate() {
        if set_writes.is_empty() {
            continue;
        }
        let descriptor_set = device.allocate_descriptor_set(*set_layout)?;
        sets.push(descriptor_set);
        device.write_descriptor_set(descriptor_set, set_writes);
        device.cmd_bind_descriptor_sets(cl, bind_point, layout, set as u32, &[descriptor_set]);
    }

    if !input.push_constants.is_empty() {
        device.cmd_push_constants(cl, layout, stages, 0, &input.push_constants);
    }
    Ok(())
}

fn rendering_attachment(
    res: &Resources,
    att: &PassAttachment,
    layout: vk::ImageLayout,
) -> Result<RenderingAttachment, ResourceError> {
    let img = res
        .images
        .get(att.image)
        .ok_or(ResourceError::Unknown(att.image.into()))?;
    Ok(RenderingAttachment {
        image: img.image,
        range: SubresourceRange::single(img.desc.aspect(), att.mip, att.layer),
        layout,
        load_op: att.load_op,
        store_op: att.store_op,
        clear: att.clear,
    })
}

impl BatchContext {
    ///Records and submits everything. Prologues of all queues go first, then the commands in pseudo pass order.
    /// Finally every queue signals its end value.
    pub(crate) fn execute(
        &mut self,
        device: &dyn NativeDevice,
        res: &Resources,
        cache: &mut ContextCache,
        tracks: &Tracks,
        timestamp_capacity: u32,
    ) -> Result<(), BatchError> {
        for q in 0..self.queues.len() {
            let prologue = std::mem::take(&mut self.pseudo[q].prologue);
            let qc = &mut self.queues[q];
            qc.barrier(device, &prologue)?;
            if let Some(value) = self.pseudo[q].prologue_signal {
                let signal = qc.timeline_signal(value);
                qc.flush(device, &[signal])?;
            }
        }

        let order = std::mem::take(&mut self.order);
        for (queue, idx) in order.iter() {
            self.execute_command(
                *queue as usize,
                *idx,
                device,
                res,
                cache,
                tracks,
                timestamp_capacity,
            )?;
        }
        self.order = order;

        for q in 0..self.queues.len() {
            let end = self.resolution.queues[q].end;
            let qc = &mut self.queues[q];
            let signal = qc.timeline_signal(end);
            //also carries waits that never got a command list
            qc.flush(device, &[signal])?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_command(
        &mut self,
        q: usize,
        idx: usize,
        device: &dyn NativeDevice,
        res: &Resources,
        cache: &mut ContextCache,
        tracks: &Tracks,
        timestamp_capacity: u32,
    ) -> Result<(), BatchError> {
        let mut ops = std::mem::take(&mut self.pseudo[q].ops[idx]);
        let command = &self.logs[q].commands[idx].command;
        let qc = &mut self.queues[q];
        qc.stats.executed += 1;

        if !ops.waits.is_empty() || !ops.swapchain_waits.is_empty() {
            qc.flush(device, &[])?;
            for wait in &ops.waits {
                qc.staged_waits.push(SemaphoreSubmit {
                    semaphore: tracks.0[wait.queue as usize].sem,
                    value: wait.value,
                    stage: WAIT_STAGE,
                });
            }
            for semaphore in &ops.swapchain_waits {
                qc.staged_waits.push(SemaphoreSubmit {
                    semaphore: *semaphore,
                    value: 0,
                    stage: WAIT_STAGE,
                });
            }
        }

        qc.barrier(device, &ops.pre)?;

        match command {
            Command::CopyBuffer { src, dst, regions } => {
                let cl = qc.list(device)?;
                device.cmd_copy_buffer(
                    cl,
                    res.native_buffer(src.key())?,
                    res.native_buffer(dst.key())?,
                    regions,
                );
            }
            Command::CopyBufferToImage { src, dst, regions } => {
                let cl = qc.list(device)?;
                device.cmd_copy_buffer_to_image(
                    cl,
                    res.native_buffer(src.key())?,
                    res.native_image(dst.key())?,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    regions,
                );
            }
            Command::BuildBlas {
                blas,
                vertices,
                vertex_stride,
                vertex_count,
                indices,
                primitive_count,
            } => {
                let cl = qc.list(device)?;
                let indices = match indices {
                    Some(i) => Some(res.native_buffer(i.key())?),
                    None => None,
                };
                let scratch = match &ops.scratch {
                    Some(s) => res.native_buffer(s.key())?,
                    None => vk::Buffer::null(),
                };
                device.cmd_build_acceleration_structure(
                    cl,
                    &AsBuildInfo {
                        dst: res.native_acceleration_structure(blas.key())?,
                        ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                        geometry: AsGeometry::Triangles {
                            vertices: res.native_buffer(vertices.key())?,
                            vertex_stride: *vertex_stride,
                            vertex_count: *vertex_count,
                            indices,
                            primitive_count: *primitive_count,
                        },
                        scratch,
                    },
                );
            }
            Command::BuildTlas {
                tlas,
                instances,
                blas,
            } => {
                let cl = qc.list(device)?;
                let blas = blas
                    .iter()
                    .map(|b| res.native_acceleration_structure(b.key()))
                    .collect::<Result<SmallVec<_>, _>>()?;
                let scratch = match &ops.scratch {
                    Some(s) => res.native_buffer(s.key())?,
                    None => vk::Buffer::null(),
                };
                device.cmd_build_acceleration_structure(
                    cl,
                    &AsBuildInfo {
                        dst: res.native_acceleration_structure(tlas.key())?,
                        ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                        geometry: AsGeometry::Instances {
                            instances: res.native_buffer(instances.key())?,
                            count: blas.len() as u32,
                            blas,
                        },
                        scratch,
                    },
                );
            }
            Command::BeginPass(pass) => {
                let cl = qc.list(device)?;
                let color = pass
                    .color
                    .iter()
                    .map(|att| {
                        rendering_attachment(res, att, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    })
                    .collect::<Result<SmallVec<_>, _>>()?;
                let depth = match &pass.depth {
                    Some(att) => Some(rendering_attachment(
                        res,
                        att,
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    )?),
                    None => None,
                };
                device.cmd_begin_rendering(
                    cl,
                    &RenderingInfo {
                        width: pass.width,
                        height: pass.height,
                        color,
                        depth,
                    },
                );
            }
            Command::Draw(draw) => {
                let cl = qc.list(device)?;
                bind_shader_input(device, cache, res, cl, &draw.input, &mut qc.descriptor_sets)?;
                if !draw.vertex_buffers.is_empty() {
                    let buffers = draw
                        .vertex_buffers
                        .iter()
                        .map(|vb| Ok((res.native_buffer(vb.buffer.key())?, vb.offset)))
                        .collect::<Result<SmallVec<[(vk::Buffer, u64); 2]>, ResourceError>>()?;
                    device.cmd_bind_vertex_buffers(cl, 0, &buffers);
                }
                match &draw.index_buffer {
                    Some(ib) => {
                        device.cmd_bind_index_buffer(
                            cl,
                            res.native_buffer(ib.buffer.key())?,
                            ib.offset,
                            ib.index_type,
                        );
                        device.cmd_draw_indexed(
                            cl,
                            draw.count,
                            draw.instance_count,
                            draw.first,
                            draw.vertex_offset,
                            draw.first_instance,
                        );
                    }
                    None => device.cmd_draw(
                        cl,
                        draw.count,
                        draw.instance_count,
                        draw.first,
                        draw.first_instance,
                    ),
                }
            }
            Command::EndPass => {
                let cl = qc.list(device)?;
                device.cmd_end_rendering(cl);
            }
            Command::Dispatch { input, groups } => {
                let cl = qc.list(device)?;
                bind_shader_input(device, cache, res, cl, input, &mut qc.descriptor_sets)?;
                device.cmd_dispatch(cl, *groups);
            }
            Command::TraceRays { input, extent } => {
                let cl = qc.list(device)?;
                bind_shader_input(device, cache, res, cl, input, &mut qc.descriptor_sets)?;
                device.cmd_trace_rays(cl, *extent);
            }
            Command::Present {
                swapchain, index, ..
            } => {
                qc.barrier(device, &ops.post)?;
                let sc = res
                    .swapchains
                    .get(swapchain.key())
                    .ok_or(ResourceError::Unknown(swapchain.key().into()))?;
                let present_semaphore = *sc
                    .present_semaphores
                    .get(*index as usize)
                    .ok_or(ResourceError::Unknown(swapchain.key().into()))?;

                let mut signals: SmallVec<[SemaphoreSubmit; 2]> = smallvec![SemaphoreSubmit {
                    semaphore: present_semaphore,
                    value: 0,
                    stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                }];
                if let Some(value) = ops.signal.take() {
                    signals.push(qc.timeline_signal(value));
                }
                qc.flush(device, &signals)?;

                let suboptimal = match device.queue_present(
                    qc.queue,
                    sc.swapchain,
                    *index,
                    present_semaphore,
                ) {
                    Ok(suboptimal) => suboptimal,
                    Err(e) if e.is_swapchain_transient() => {
                        #[cfg(feature = "logging")]
                        log::warn!("Present failed with {}, recreating on next acquire", e);
                        true
                    }
                    Err(e) => return Err(e.into()),
                };
                self.presented.push((swapchain.key(), suboptimal));
                return Ok(());
            }
            Command::StartTimer(name) => {
                let cl = qc.list(device)?;
                if qc.timer.is_none() {
                    qc.timer = Some(TimestampTable::new(device, qc.queue, timestamp_capacity)?);
                }
                if let Some(timer) = qc.timer.as_mut() {
                    timer.start_region(device, cl, name);
                }
            }
            Command::EndTimer(name) => {
                let cl = qc.list(device)?;
                if let Some(timer) = qc.timer.as_mut() {
                    timer.end_region(device, cl, name);
                }
            }
            Command::Pause => qc.flush(device, &[])?,
            Command::ReleaseDependency(_) | Command::AcquireDependency(_) => {}
        }

        qc.barrier(device, &ops.post)?;
        if let Some(value) = ops.signal {
            let signal = qc.timeline_signal(value);
            qc.flush(device, &[signal])?;
        }
        Ok(())
    }
}
