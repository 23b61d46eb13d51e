//! The pseudo pass. Walks all queue logs in global submission order without touching the device, tracks every
//! resource access and derives barriers and cross-queue dependency requests from them.

use ahash::AHashMap;
use marpii_native::{
    BarrierBuilder, BufferBarrier, ImageBarrier, MemoryBarrier, SubresourceRange, ash::vk,
    desc::PipelineDesc,
};
use smallvec::SmallVec;

use super::{
    BatchContext, BlockedAcquire, SchedulingError,
    resolve::{DepRequest, DepSource, ReleaseSite, Wait},
};
use crate::{
    command::{BoundResource, Command, PassAttachment, ShaderInput},
    resources::{
        Resources,
        access::{
            Access, AccessRecord, AccessTable, Hazard, SubKey, merge_image_hazards, track_use,
        },
        handle::{BlasHandle, BufferHandle},
        res_states::{ArrayElement, AsKey, DependencyKey, ImageKey},
    },
    track::Tracks,
};

///Bottom level structures of every top level structure rebuilt so far in a batch.
pub(crate) type TlasInputs = AHashMap<AsKey, SmallVec<[BlasHandle; 4]>>;

///Everything the execution pass has to do around a single command.
#[derive(Default, Debug)]
pub(crate) struct CmdOps {
    pub(crate) pre: BarrierBuilder,
    pub(crate) post: BarrierBuilder,
    ///Timeline value signaled right after the command.
    pub(crate) signal: Option<u64>,
    pub(crate) waits: SmallVec<[Wait; 2]>,
    ///Binary acquire semaphores of swapchain images that are used for the first time.
    pub(crate) swapchain_waits: SmallVec<[vk::Semaphore; 1]>,
    ///Scratch memory of acceleration structure builds.
    pub(crate) scratch: Option<BufferHandle>,
}

///Analysis state of a single queue.
pub(crate) struct QueuePseudoContext {
    pub(crate) queue: u32,
    pub(crate) family: u32,
    ///Next command to visit.
    pub(crate) cursor: usize,
    ///One entry per recorded command.
    pub(crate) ops: Vec<CmdOps>,
    ///Barriers executed before the first command. Releases ownership of resources that were last used by an
    /// earlier batch.
    pub(crate) prologue: BarrierBuilder,
    pub(crate) prologue_signal: Option<u64>,
    ///Sites signaled regardless of other queues' requests.
    pub(crate) own_sites: Vec<ReleaseSite>,
    pub(crate) requests: Vec<DepRequest>,
    pub(crate) visits: usize,
}

impl QueuePseudoContext {
    pub(crate) fn new(queue: u32, family: u32, command_count: usize) -> Self {
        QueuePseudoContext {
            queue,
            family,
            cursor: 0,
            ops: (0..command_count).map(|_| CmdOps::default()).collect(),
            prologue: BarrierBuilder::new(),
            prologue_signal: None,
            own_sites: Vec::new(),
            requests: Vec::new(),
            visits: 0,
        }
    }
}

///Native object a barrier is recorded for.
#[derive(Clone, Copy, Debug)]
enum BarrierTarget {
    Buffer(vk::Buffer),
    Image(vk::Image, SubresourceRange),
    ///Objects the native side has no per object barrier for.
    Memory,
}

#[allow(clippy::too_many_arguments)]
fn push_barrier(
    builder: &mut BarrierBuilder,
    target: BarrierTarget,
    src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_queue_family: u32,
    dst_queue_family: u32,
) {
    match target {
        BarrierTarget::Buffer(buffer) => {
            builder.buffer_barrier(BufferBarrier {
                buffer,
                offset: 0,
                size: vk::WHOLE_SIZE,
                src_stage: src.0,
                src_access: src.1,
                dst_stage: dst.0,
                dst_access: dst.1,
                src_queue_family,
                dst_queue_family,
            });
        }
        BarrierTarget::Image(image, range) => {
            builder.image_barrier(ImageBarrier {
                image,
                range,
                src_stage: src.0,
                src_access: src.1,
                old_layout,
                dst_stage: dst.0,
                dst_access: dst.1,
                new_layout,
                src_queue_family,
                dst_queue_family,
            });
        }
        BarrierTarget::Memory => {
            builder.memory_barrier(MemoryBarrier {
                src_stage: src.0,
                src_access: src.1,
                dst_stage: dst.0,
                dst_access: dst.1,
            });
        }
    }
}

fn push_use(uses: &mut Vec<(SubKey, Access)>, key: SubKey, access: Access) {
    match uses.iter_mut().find(|(k, _)| *k == key) {
        Some((_, a)) => *a = a.merge(access),
        None => uses.push((key, access)),
    }
}

///Pushes `range` of `image`, or all of its subresources.
fn push_image(
    uses: &mut Vec<(SubKey, Access)>,
    res: &Resources,
    image: ImageKey,
    range: Option<SubresourceRange>,
    access: Access,
) {
    let Some(img) = res.images.get(image) else {
        #[cfg(feature = "logging")]
        log::error!("Image {:?} vanished while recorded", image);
        return;
    };
    let range = range.unwrap_or_else(|| {
        SubresourceRange::all(img.desc.aspect(), img.desc.mip_levels, img.desc.array_layers)
    });
    for (mip, layer) in range.iter() {
        push_use(
            uses,
            SubKey::Image {
                key: image,
                mip,
                layer,
            },
            access,
        );
    }
}

fn shader_stage(input: &ShaderInput) -> vk::PipelineStageFlags2 {
    match input.pipeline {
        PipelineDesc::Graphics(_) => {
            vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER
        }
        PipelineDesc::Compute { .. } => vk::PipelineStageFlags2::COMPUTE_SHADER,
        PipelineDesc::RayTracing(_) => vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
    }
}

fn storage_buffer(stage: vk::PipelineStageFlags2) -> Access {
    Access::memory(
        stage,
        vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
    )
}

fn uniform_buffer(stage: vk::PipelineStageFlags2) -> Access {
    Access::memory(stage, vk::AccessFlags2::UNIFORM_READ)
}

fn sampled_image(stage: vk::PipelineStageFlags2) -> Access {
    Access::new(
        stage,
        vk::AccessFlags2::SHADER_SAMPLED_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    )
}

fn storage_image(stage: vk::PipelineStageFlags2) -> Access {
    Access::new(
        stage,
        vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
        vk::ImageLayout::GENERAL,
    )
}

fn push_shader_input(
    uses: &mut Vec<(SubKey, Access)>,
    res: &Resources,
    tlas_inputs: &TlasInputs,
    input: &ShaderInput,
) {
    let stage = shader_stage(input);
    for binding in &input.bindings {
        match &binding.resource {
            BoundResource::StorageBuffer(b) => {
                push_use(uses, SubKey::Buffer(b.key()), storage_buffer(stage))
            }
            BoundResource::UniformBuffer(b) => {
                push_use(uses, SubKey::Buffer(b.key()), uniform_buffer(stage))
            }
            BoundResource::SampledImage(i) | BoundResource::CombinedImageSampler(i, _) => {
                push_image(uses, res, i.key(), None, sampled_image(stage))
            }
            BoundResource::StorageImage(i) => {
                push_image(uses, res, i.key(), None, storage_image(stage))
            }
            BoundResource::Sampler(_) => {}
            BoundResource::AccelerationStructure(tlas) => {
                let read =
                    Access::memory(stage, vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
                push_use(uses, SubKey::AccelerationStructure(tlas.key()), read);
                //a rebuild earlier in the batch wins over the last committed one
                let built_from = match tlas_inputs.get(&tlas.key()) {
                    Some(blas) => Some(blas.as_slice()),
                    None => res
                        .acceleration_structures
                        .get(tlas.key())
                        .map(|acc| acc.built_from.as_slice()),
                };
                for blas in built_from.unwrap_or(&[]) {
                    push_use(uses, SubKey::AccelerationStructure(blas.key()), read);
                }
            }
            BoundResource::DescriptorArray(array) => {
                let Some(arr) = res.descriptor_arrays.get(array.key()) else {
                    continue;
                };
                for element in &arr.elements {
                    match element {
                        ArrayElement::StorageBuffer(b) => {
                            push_use(uses, SubKey::Buffer(b.key()), storage_buffer(stage))
                        }
                        ArrayElement::UniformBuffer(b) => {
                            push_use(uses, SubKey::Buffer(b.key()), uniform_buffer(stage))
                        }
                        ArrayElement::SampledImage(i) => {
                            push_image(uses, res, i.key(), None, sampled_image(stage))
                        }
                        ArrayElement::StorageImage(i) => {
                            push_image(uses, res, i.key(), None, storage_image(stage))
                        }
                        ArrayElement::Sampler(_) => {}
                    }
                }
            }
        }
    }
}

fn push_attachment(uses: &mut Vec<(SubKey, Access)>, att: &PassAttachment, is_depth: bool) {
    let load = att.load_op == vk::AttachmentLoadOp::LOAD;
    let access = if is_depth {
        let mut access = vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE;
        if load {
            access |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ;
        }
        Access::new(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            access,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
    } else {
        let mut access = vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
        if load {
            access |= vk::AccessFlags2::COLOR_ATTACHMENT_READ;
        }
        Access::new(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            access,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
    };
    push_use(
        uses,
        SubKey::Image {
            key: att.image,
            mip: att.mip,
            layer: att.layer,
        },
        access,
    );
}

///Collects every access of `command`. Accesses of the same subresource are merged. Top level structures are
/// resolved to their bottom level inputs through `tlas_inputs` first.
pub(crate) fn command_uses(
    res: &Resources,
    command: &Command,
    scratch: Option<&BufferHandle>,
    tlas_inputs: &TlasInputs,
    uses: &mut Vec<(SubKey, Access)>,
) {
    let build = vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR;
    let build_input = Access::memory(build, vk::AccessFlags2::SHADER_READ);
    let as_write = Access::memory(build, vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR);
    let as_read = Access::memory(build, vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
    if let Some(scratch) = scratch {
        push_use(
            uses,
            SubKey::Buffer(scratch.key()),
            Access::memory(
                build,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            ),
        );
    }

    match command {
        Command::CopyBuffer { src, dst, .. } => {
            push_use(
                uses,
                SubKey::Buffer(src.key()),
                Access::memory(
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_READ,
                ),
            );
            push_use(
                uses,
                SubKey::Buffer(dst.key()),
                Access::memory(
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_WRITE,
                ),
            );
        }
        Command::CopyBufferToImage { src, dst, regions } => {
            push_use(
                uses,
                SubKey::Buffer(src.key()),
                Access::memory(
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_READ,
                ),
            );
            let write = Access::new(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            for region in regions {
                push_image(uses, res, dst.key(), Some(region.range()), write);
            }
        }
        Command::BuildBlas {
            blas,
            vertices,
            indices,
            ..
        } => {
            push_use(uses, SubKey::Buffer(vertices.key()), build_input);
            if let Some(idx) = indices {
                push_use(uses, SubKey::Buffer(idx.key()), build_input);
            }
            push_use(uses, SubKey::AccelerationStructure(blas.key()), as_write);
        }
        Command::BuildTlas {
            tlas,
            instances,
            blas,
        } => {
            push_use(uses, SubKey::Buffer(instances.key()), build_input);
            for b in blas {
                push_use(uses, SubKey::AccelerationStructure(b.key()), as_read);
            }
            push_use(uses, SubKey::AccelerationStructure(tlas.key()), as_write);
        }
        Command::BeginPass(pass) => {
            for att in &pass.color {
                push_attachment(uses, att, false);
            }
            if let Some(depth) = &pass.depth {
                push_attachment(uses, depth, true);
            }
        }
        Command::Draw(draw) => {
            push_shader_input(uses, res, tlas_inputs, &draw.input);
            for vb in &draw.vertex_buffers {
                push_use(
                    uses,
                    SubKey::Buffer(vb.buffer.key()),
                    Access::memory(
                        vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
                        vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
                    ),
                );
            }
            if let Some(ib) = &draw.index_buffer {
                push_use(
                    uses,
                    SubKey::Buffer(ib.buffer.key()),
                    Access::memory(
                        vk::PipelineStageFlags2::INDEX_INPUT,
                        vk::AccessFlags2::INDEX_READ,
                    ),
                );
            }
        }
        Command::Dispatch { input, .. } | Command::TraceRays { input, .. } => {
            push_shader_input(uses, res, tlas_inputs, input)
        }
        Command::Present { image, .. } => push_use(
            uses,
            SubKey::Image {
                key: *image,
                mip: 0,
                layer: 0,
            },
            Access::new(
                vk::PipelineStageFlags2::NONE,
                vk::AccessFlags2::NONE,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
        ),
        Command::EndPass
        | Command::ReleaseDependency(_)
        | Command::AcquireDependency(_)
        | Command::StartTimer(_)
        | Command::EndTimer(_)
        | Command::Pause => {}
    }
}

///Acquire semaphores of swapchain images `command` touches.
fn swapchain_acquires(command: &Command) -> SmallVec<[(ImageKey, vk::Semaphore); 1]> {
    match command {
        Command::BeginPass(pass) => pass
            .color
            .iter()
            .chain(pass.depth.iter())
            .filter_map(|att| att.acquire.map(|sem| (att.image, sem)))
            .collect(),
        Command::Present { image, acquire, .. } => smallvec::smallvec![(*image, *acquire)],
        _ => SmallVec::new(),
    }
}

impl BatchContext {
    fn is_blocked(
        &self,
        queue: usize,
        released: &AHashMap<DependencyKey, (u32, usize)>,
        res: &Resources,
    ) -> Option<DependencyKey> {
        let cursor = self.pseudo[queue].cursor;
        match &self.logs[queue].commands.get(cursor)?.command {
            Command::AcquireDependency(token) => {
                let key = token.key();
                let released_before = res
                    .dependencies
                    .get(key)
                    .map(|d| d.release.is_some())
                    .unwrap_or(false);
                if released.contains_key(&key) || released_before {
                    None
                } else {
                    Some(key)
                }
            }
            _ => None,
        }
    }

    ///Visits every command of every queue once, in global submission order. Blocked queues are skipped until the
    /// token they wait for was released.
    pub(crate) fn pseudo_execute(
        &mut self,
        res: &Resources,
        tracks: &Tracks,
    ) -> Result<(), SchedulingError> {
        let mut table = AccessTable::new(&res.states);
        let mut released: AHashMap<DependencyKey, (u32, usize)> = AHashMap::default();

        loop {
            let mut next: Option<(usize, u64)> = None;
            let mut blocked = Vec::new();
            for q in 0..self.pseudo.len() {
                let cursor = self.pseudo[q].cursor;
                let Some(cmd) = self.logs[q].commands.get(cursor) else {
                    continue;
                };
                if let Some(token) = self.is_blocked(q, &released, res) {
                    blocked.push(BlockedAcquire {
                        queue: q as u32,
                        command: cursor,
                        token,
                    });
                    continue;
                }
                if next.map(|(_, idx)| cmd.index < idx).unwrap_or(true) {
                    next = Some((q, cmd.index));
                }
            }

            match next {
                Some((q, _)) => self.pseudo_step(q, &mut table, &mut released, res, tracks),
                None if !blocked.is_empty() => {
                    #[cfg(feature = "logging")]
                    log::error!(
                        "Batch {} is deadlocked, {} queues wait for tokens that are never released",
                        self.id,
                        blocked.len()
                    );
                    return Err(SchedulingError::DependencyCycle { blocked });
                }
                None => break,
            }
        }

        self.released = released
            .into_iter()
            .map(|(token, (queue, command))| (token, queue, command))
            .collect();
        //deterministic commit order
        self.released.sort_by_key(|(_, queue, command)| (*queue, *command));
        self.changes = table.into_changes();
        Ok(())
    }

    fn pseudo_step(
        &mut self,
        q: usize,
        table: &mut AccessTable,
        released: &mut AHashMap<DependencyKey, (u32, usize)>,
        res: &Resources,
        tracks: &Tracks,
    ) {
        let queue = q as u32;
        let first = self.pseudo[q].cursor;
        //render passes are visited as a whole
        let last = match self.logs[q].commands[first].command {
            Command::BeginPass(_) => self.logs[q]
                .pass_end(first)
                .unwrap_or(self.logs[q].len() - 1),
            _ => first,
        };

        for idx in first..=last {
            self.order.push((queue, idx));
        }
        self.pseudo[q].visits += last - first + 1;
        self.pseudo[q].cursor = last + 1;

        match &self.logs[q].commands[first].command {
            Command::ReleaseDependency(token) => {
                #[cfg(feature = "log_reasoning")]
                log::trace!("Queue {} releases {:?} after {}", queue, token.key(), first);

                released.insert(token.key(), (queue, first));
                self.pseudo[q].own_sites.push(ReleaseSite::After(first));
                return;
            }
            Command::AcquireDependency(token) => {
                let src = match released.get(&token.key()) {
                    Some((rq, rc)) => Some(DepSource::Site {
                        queue: *rq,
                        site: ReleaseSite::After(*rc),
                    }),
                    None => res
                        .dependencies
                        .get(token.key())
                        .and_then(|d| d.release)
                        .map(|rp| DepSource::Value {
                            queue: rp.queue,
                            value: rp.value,
                        }),
                };
                let src = src.filter(|s| match s {
                    DepSource::Site { queue: sq, .. } | DepSource::Value { queue: sq, .. } => {
                        *sq != queue
                    }
                });
                if let Some(src) = src {
                    #[cfg(feature = "log_reasoning")]
                    log::trace!("Queue {} acquires {:?} from {:?}", queue, token.key(), src);

                    self.pseudo[q].requests.push(DepRequest {
                        dst_cmd: first,
                        src,
                    });
                }
                return;
            }
            _ => {}
        }

        let mut uses = Vec::new();
        for idx in first..=last {
            let cmd = &self.logs[q].commands[idx].command;

            //first use of an acquired swapchain image waits for the acquire
            for (image, semaphore) in swapchain_acquires(cmd) {
                let key = SubKey::Image {
                    key: image,
                    mip: 0,
                    layer: 0,
                };
                if table.get(&key).is_none() {
                    table.set(
                        key,
                        AccessRecord {
                            stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                            access: vk::AccessFlags2::NONE,
                            layout: vk::ImageLayout::UNDEFINED,
                            queue,
                            batch: self.id,
                            command: last,
                        },
                    );
                    self.pseudo[q].ops[first].swapchain_waits.push(semaphore);
                }
            }

            command_uses(
                res,
                cmd,
                self.pseudo[q].ops[idx].scratch.as_ref(),
                &self.tlas_inputs,
                &mut uses,
            );
            if let Command::BuildTlas { tlas, blas, .. } = cmd {
                self.tlas_inputs.insert(tlas.key(), blas.clone());
            }
        }

        let hazards = uses
            .into_iter()
            .filter_map(|(key, access)| {
                track_use(table, key, access, queue, self.id, last).map(|h| (key, h))
            })
            .collect::<Vec<_>>();
        self.emit_hazards(q, first, hazards, res, tracks);
    }

    fn emit_hazards(
        &mut self,
        q: usize,
        scope: usize,
        hazards: Vec<(SubKey, Hazard)>,
        res: &Resources,
        tracks: &Tracks,
    ) {
        let mut images: Vec<(ImageKey, Vec<(u32, u32, Hazard)>)> = Vec::new();
        for (key, hazard) in hazards {
            match key {
                SubKey::Buffer(b) => {
                    let Some(buf) = res.buffers.get(b) else {
                        continue;
                    };
                    self.emit_hazard(q, scope, BarrierTarget::Buffer(buf.buffer), hazard, tracks);
                }
                SubKey::AccelerationStructure(_) => {
                    self.emit_hazard(q, scope, BarrierTarget::Memory, hazard, tracks)
                }
                SubKey::Image { key, mip, layer } => {
                    match images.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, subs)) => subs.push((mip, layer, hazard)),
                        None => images.push((key, vec![(mip, layer, hazard)])),
                    }
                }
            }
        }

        for (key, subs) in images {
            let Some(img) = res.images.get(key) else {
                continue;
            };
            for (range, hazard) in merge_image_hazards(img.desc.aspect(), subs) {
                self.emit_hazard(
                    q,
                    scope,
                    BarrierTarget::Image(img.image, range),
                    hazard,
                    tracks,
                );
            }
        }
    }

    ///Turns a hazard into barriers and, for other queues, a dependency request.
    fn emit_hazard(
        &mut self,
        q: usize,
        scope: usize,
        target: BarrierTarget,
        hazard: Hazard,
        tracks: &Tracks,
    ) {
        let queue = q as u32;
        let family = self.pseudo[q].family;
        let next = hazard.next;

        let Some(prev) = hazard.prev.filter(|p| p.queue != queue) else {
            #[cfg(feature = "log_reasoning")]
            log::trace!(
                "Queue {} cmd {}: barrier {:?} {:?} -> {:?}",
                queue,
                scope,
                target,
                hazard.prev,
                next
            );

            push_barrier(
                &mut self.pseudo[q].ops[scope].pre,
                target,
                hazard.src_scope(),
                (next.stage, next.access),
                hazard.old_layout(),
                next.layout,
                family,
                family,
            );
            return;
        };

        let pq = prev.queue as usize;
        let src_family = tracks.0[pq].family;
        let same_batch = prev.batch == self.id;
        let is_memory = matches!(target, BarrierTarget::Memory);
        let ownership_transfer = src_family != family && !is_memory;

        let src = if same_batch {
            Some(DepSource::Site {
                queue: prev.queue,
                site: ReleaseSite::After(prev.command),
            })
        } else if ownership_transfer {
            Some(DepSource::Site {
                queue: prev.queue,
                site: ReleaseSite::Prologue,
            })
        } else {
            self.prior_end(prev.batch, prev.queue)
                .map(|value| DepSource::Value {
                    queue: prev.queue,
                    value,
                })
        };

        #[cfg(feature = "log_reasoning")]
        log::trace!(
            "Queue {} cmd {}: depends on {:?} for {:?}, ownership transfer: {}",
            queue,
            scope,
            src,
            target,
            ownership_transfer
        );

        if let Some(src) = src {
            self.pseudo[q].requests.push(DepRequest {
                dst_cmd: scope,
                src,
            });
        }

        if is_memory {
            return;
        }

        if ownership_transfer {
            let release = if same_batch {
                &mut self.pseudo[pq].ops[prev.command].post
            } else {
                &mut self.pseudo[pq].prologue
            };
            push_barrier(
                release,
                target,
                (prev.stage, prev.access),
                (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
                prev.layout,
                next.layout,
                src_family,
                family,
            );
            push_barrier(
                &mut self.pseudo[q].ops[scope].pre,
                target,
                (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
                (next.stage, next.access),
                prev.layout,
                next.layout,
                src_family,
                family,
            );
        } else if hazard.is_layout_change() {
            push_barrier(
                &mut self.pseudo[q].ops[scope].pre,
                target,
                (
                    vk::PipelineStageFlags2::ALL_COMMANDS,
                    vk::AccessFlags2::NONE,
                ),
                (next.stage, next.access),
                prev.layout,
                next.layout,
                family,
                family,
            );
        }
    }
}
