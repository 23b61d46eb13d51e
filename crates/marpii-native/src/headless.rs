//! A [NativeDevice] that never touches a GPU.
//!
//! Every call is appended to a log that can be inspected afterwards. Timeline and binary semaphores are
//! emulated. Submissions either complete as soon as their waits are satisfied (the default), or stay pending
//! until [complete_all](HeadlessDevice::complete_all) / [complete_queue](HeadlessDevice::complete_queue) is called.
//!
//! Lifetime problems are not returned as errors, since a real driver would not report them either. Instead they
//! are collected as [validation errors](HeadlessDevice::validation_errors):
//!
//! - using a handle after it was destroyed,
//! - destroying a handle that is still referenced by a pending submission,
//! - signaling a timeline semaphore with a value that is not increasing,
//! - submitting command lists that were not ended.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use ash::vk::{self, Handle};

use crate::{
    desc::{
        AccelerationStructureDesc, AsBuildInfo, AsGeometry, BufDesc, BufferCopyRegion,
        BufferImageCopyRegion, DescriptorBinding, DescriptorResource, DescriptorWrite, ImgDesc,
        PipelineDesc, RenderingInfo, SamplerDesc, SemaphoreSubmit, SubmitInfo, SwapchainDesc,
    },
    BarrierBuilder, NativeDevice, NativeError, QueueInfo,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Buffer,
    Image,
    Sampler,
    AccelerationStructure,
    Semaphore,
    CommandList,
    DescriptorSetLayout,
    PipelineLayout,
    Pipeline,
    DescriptorSet,
    QueryPool,
    Swapchain,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubmitRecord {
    pub queue: u32,
    pub waits: Vec<SemaphoreSubmit>,
    pub command_lists: Vec<vk::CommandBuffer>,
    pub signals: Vec<SemaphoreSubmit>,
}

///Single call into the device, as seen by the [HeadlessDevice].
#[derive(Clone, Debug, PartialEq)]
pub enum NativeCall {
    Create {
        kind: HandleKind,
        handle: u64,
    },
    Destroy {
        kind: HandleKind,
        handle: u64,
    },
    Submit(SubmitRecord),
    Barrier {
        command_list: vk::CommandBuffer,
        barriers: BarrierBuilder,
    },
    CopyBuffer {
        command_list: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
    },
    CopyBufferToImage {
        command_list: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
    },
    BuildAccelerationStructure {
        command_list: vk::CommandBuffer,
        dst: vk::AccelerationStructureKHR,
        ty: vk::AccelerationStructureTypeKHR,
    },
    BeginRendering {
        command_list: vk::CommandBuffer,
        info: RenderingInfo,
    },
    EndRendering {
        command_list: vk::CommandBuffer,
    },
    BindPipeline {
        command_list: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        command_list: vk::CommandBuffer,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants {
        command_list: vk::CommandBuffer,
        size: usize,
    },
    BindVertexBuffers {
        command_list: vk::CommandBuffer,
        buffers: Vec<vk::Buffer>,
    },
    BindIndexBuffer {
        command_list: vk::CommandBuffer,
        buffer: vk::Buffer,
    },
    Draw {
        command_list: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        command_list: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        command_list: vk::CommandBuffer,
        groups: [u32; 3],
    },
    TraceRays {
        command_list: vk::CommandBuffer,
        extent: [u32; 3],
    },
    WriteTimestamp {
        command_list: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
    },
    Acquire {
        swapchain: vk::SwapchainKHR,
        index: u32,
    },
    Present {
        queue: u32,
        swapchain: vk::SwapchainKHR,
        index: u32,
    },
}

impl NativeCall {
    ///The command list this call was recorded into, if it is a recording call.
    pub fn command_list(&self) -> Option<vk::CommandBuffer> {
        match self {
            NativeCall::Barrier { command_list, .. }
            | NativeCall::CopyBuffer { command_list, .. }
            | NativeCall::CopyBufferToImage { command_list, .. }
            | NativeCall::BuildAccelerationStructure { command_list, .. }
            | NativeCall::BeginRendering { command_list, .. }
            | NativeCall::EndRendering { command_list }
            | NativeCall::BindPipeline { command_list, .. }
            | NativeCall::BindDescriptorSets { command_list, .. }
            | NativeCall::PushConstants { command_list, .. }
            | NativeCall::BindVertexBuffers { command_list, .. }
            | NativeCall::BindIndexBuffer { command_list, .. }
            | NativeCall::Draw { command_list, .. }
            | NativeCall::DrawIndexed { command_list, .. }
            | NativeCall::Dispatch { command_list, .. }
            | NativeCall::TraceRays { command_list, .. }
            | NativeCall::WriteTimestamp { command_list, .. } => Some(*command_list),
            _ => None,
        }
    }
}

struct PendingSubmit {
    queue: u32,
    waits: Vec<SemaphoreSubmit>,
    signals: Vec<SemaphoreSubmit>,
    command_lists: Vec<u64>,
}

struct CommandList {
    queue: u32,
    ended: bool,
    referenced: AHashSet<u64>,
    timestamps: Vec<(u64, u32)>,
}

struct Swapchain {
    images: Vec<u64>,
    next: u32,
}

struct State {
    next_handle: u64,
    alive: AHashMap<u64, HandleKind>,
    destroyed: AHashSet<u64>,
    timelines: AHashMap<u64, u64>,
    //highest value any submission promised to signal
    promised: AHashMap<u64, u64>,
    binaries: AHashMap<u64, bool>,
    command_lists: AHashMap<u64, CommandList>,
    pending: VecDeque<PendingSubmit>,
    auto_complete: bool,
    calls: Vec<NativeCall>,
    validation: Vec<String>,
    swapchains: AHashMap<u64, Swapchain>,
    acquire_errors: VecDeque<NativeError>,
    present_errors: VecDeque<NativeError>,
    query_pools: AHashMap<u64, Vec<Option<u64>>>,
    clock: u64,
}

impl State {
    fn alloc(&mut self, kind: HandleKind) -> u64 {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.alive.insert(handle, kind);
        self.calls.push(NativeCall::Create { kind, handle });
        handle
    }

    fn in_use(&self, handle: u64) -> bool {
        self.pending.iter().any(|p| {
            p.command_lists.contains(&handle)
                || p.waits.iter().any(|w| w.semaphore.as_raw() == handle)
                || p.signals.iter().any(|s| s.semaphore.as_raw() == handle)
                || p.command_lists.iter().any(|cl| {
                    self.command_lists
                        .get(cl)
                        .map(|cl| cl.referenced.contains(&handle))
                        .unwrap_or(false)
                })
        })
    }

    fn destroy(&mut self, kind: HandleKind, handle: u64) {
        if handle == 0 {
            return;
        }
        if self.alive.remove(&handle).is_none() {
            self.validation.push(format!(
                "destroying {:?} 0x{:x} which is not alive",
                kind, handle
            ));
            return;
        }
        if self.in_use(handle) {
            self.validation.push(format!(
                "{:?} 0x{:x} destroyed while in use by a pending submission",
                kind, handle
            ));
        }
        self.destroyed.insert(handle);
        self.calls.push(NativeCall::Destroy { kind, handle });
    }

    fn check_alive(&mut self, handle: u64, context: &str) -> bool {
        if handle == 0 {
            return true;
        }
        if self.destroyed.contains(&handle) {
            self.validation
                .push(format!("{}: use of destroyed handle 0x{:x}", context, handle));
            false
        } else if !self.alive.contains_key(&handle) {
            self.validation
                .push(format!("{}: use of unknown handle 0x{:x}", context, handle));
            false
        } else {
            true
        }
    }

    ///Validates the command list and the used handles, then records `call`.
    fn record(&mut self, command_list: vk::CommandBuffer, handles: &[u64], call: NativeCall) {
        let cl = command_list.as_raw();
        match self.command_lists.get(&cl) {
            Some(list) if list.ended => self
                .validation
                .push(format!("recording into ended command list 0x{:x}", cl)),
            Some(_) => {}
            None => self
                .validation
                .push(format!("recording into unknown command list 0x{:x}", cl)),
        }

        for h in handles {
            self.check_alive(*h, "record");
        }
        if let Some(list) = self.command_lists.get_mut(&cl) {
            list.referenced.extend(handles.iter().copied().filter(|h| *h != 0));
        }
        self.calls.push(call);
    }

    fn wait_satisfied(&self, wait: &SemaphoreSubmit) -> bool {
        let raw = wait.semaphore.as_raw();
        if let Some(value) = self.timelines.get(&raw) {
            *value >= wait.value
        } else {
            self.binaries.get(&raw).copied().unwrap_or(false)
        }
    }

    fn complete(&mut self, submit: PendingSubmit) {
        for w in &submit.waits {
            if let Some(b) = self.binaries.get_mut(&w.semaphore.as_raw()) {
                *b = false;
            }
        }
        for cl in &submit.command_lists {
            let stamps = self
                .command_lists
                .get(cl)
                .map(|l| l.timestamps.clone())
                .unwrap_or_default();
            for (pool, query) in stamps {
                self.clock += 1000;
                if let Some(slot) = self
                    .query_pools
                    .get_mut(&pool)
                    .and_then(|p| p.get_mut(query as usize))
                {
                    *slot = Some(self.clock);
                }
            }
        }
        for s in &submit.signals {
            let raw = s.semaphore.as_raw();
            if let Some(value) = self.timelines.get_mut(&raw) {
                *value = (*value).max(s.value);
            } else if let Some(b) = self.binaries.get_mut(&raw) {
                *b = true;
            }
        }
    }

    ///Completes pending submissions in queue order until no submission can progress anymore.
    fn complete_ready(&mut self, queue: Option<u32>) {
        loop {
            let next = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, p)| queue.map(|q| q == p.queue).unwrap_or(true))
                .filter(|(i, p)| self.pending.iter().take(*i).all(|o| o.queue != p.queue))
                .find(|(_, p)| p.waits.iter().all(|w| self.wait_satisfied(w)))
                .map(|(i, _)| i);

            match next.and_then(|i| self.pending.remove(i)) {
                Some(submit) => self.complete(submit),
                None => break,
            }
        }
    }
}

///Recording, GPU-less implementation of [NativeDevice].
pub struct HeadlessDevice {
    queues: Vec<QueueInfo>,
    state: Mutex<State>,
}

impl HeadlessDevice {
    pub fn new(queues: Vec<QueueInfo>) -> Self {
        HeadlessDevice {
            queues,
            state: Mutex::new(State {
                next_handle: 0x1000,
                alive: AHashMap::default(),
                destroyed: AHashSet::default(),
                timelines: AHashMap::default(),
                promised: AHashMap::default(),
                binaries: AHashMap::default(),
                command_lists: AHashMap::default(),
                pending: VecDeque::new(),
                auto_complete: true,
                calls: Vec::new(),
                validation: Vec::new(),
                swapchains: AHashMap::default(),
                acquire_errors: VecDeque::new(),
                present_errors: VecDeque::new(),
                query_pools: AHashMap::default(),
                clock: 0,
            }),
        }
    }

    ///Device with a graphics queue (family 0), an async compute queue (family 1) and a transfer queue (family 2).
    pub fn with_default_queues() -> Self {
        Self::new(vec![
            QueueInfo {
                family: 0,
                flags: vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE
                    | vk::QueueFlags::TRANSFER,
            },
            QueueInfo {
                family: 1,
                flags: vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            },
            QueueInfo {
                family: 2,
                flags: vk::QueueFlags::TRANSFER,
            },
        ])
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    ///If false, submissions stay pending until they are completed explicitly.
    pub fn set_auto_complete(&self, auto: bool) {
        let mut state = self.state();
        state.auto_complete = auto;
        if auto {
            state.complete_ready(None);
        }
    }

    ///Completes every pending submission whose waits can be satisfied.
    pub fn complete_all(&self) {
        self.state().complete_ready(None);
    }

    ///Like [complete_all](Self::complete_all), but only for submissions on `queue`.
    pub fn complete_queue(&self, queue: u32) {
        self.state().complete_ready(Some(queue));
    }

    pub fn pending_submissions(&self) -> usize {
        self.state().pending.len()
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.state().calls.clone()
    }

    ///Returns all calls so far and clears the log.
    pub fn take_calls(&self) -> Vec<NativeCall> {
        std::mem::take(&mut self.state().calls)
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                NativeCall::Submit(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.state().validation.clone()
    }

    pub fn is_alive(&self, handle: u64) -> bool {
        self.state().alive.contains_key(&handle)
    }

    ///Number of alive handles of `kind`.
    pub fn live_handles(&self, kind: HandleKind) -> usize {
        self.state().alive.values().filter(|k| **k == kind).count()
    }

    ///Lets the next `acquire_next_image` fail with `error`.
    pub fn inject_acquire_error(&self, error: NativeError) {
        self.state().acquire_errors.push_back(error);
    }

    ///Lets the next `queue_present` fail with `error`.
    pub fn inject_present_error(&self, error: NativeError) {
        self.state().present_errors.push_back(error);
    }
}

impl NativeDevice for HeadlessDevice {
    fn queues(&self) -> &[QueueInfo] {
        &self.queues
    }

    fn create_buffer(&self, desc: &BufDesc) -> Result<vk::Buffer, NativeError> {
        if desc.size == 0 {
            return Err(NativeError::VkError(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        Ok(vk::Buffer::from_raw(self.state().alloc(HandleKind::Buffer)))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state().destroy(HandleKind::Buffer, buffer.as_raw());
    }

    fn create_image(&self, desc: &ImgDesc) -> Result<vk::Image, NativeError> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(NativeError::VkError(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        Ok(vk::Image::from_raw(self.state().alloc(HandleKind::Image)))
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state().destroy(HandleKind::Image, image.as_raw());
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<vk::Sampler, NativeError> {
        Ok(vk::Sampler::from_raw(self.state().alloc(HandleKind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state().destroy(HandleKind::Sampler, sampler.as_raw());
    }

    fn create_acceleration_structure(
        &self,
        _desc: &AccelerationStructureDesc,
    ) -> Result<vk::AccelerationStructureKHR, NativeError> {
        Ok(vk::AccelerationStructureKHR::from_raw(
            self.state().alloc(HandleKind::AccelerationStructure),
        ))
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: vk::AccelerationStructureKHR) {
        self.state().destroy(
            HandleKind::AccelerationStructure,
            acceleration_structure.as_raw(),
        );
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore, NativeError> {
        let mut state = self.state();
        let handle = state.alloc(HandleKind::Semaphore);
        state.timelines.insert(handle, initial_value);
        state.promised.insert(handle, initial_value);
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn create_binary_semaphore(&self) -> Result<vk::Semaphore, NativeError> {
        let mut state = self.state();
        let handle = state.alloc(HandleKind::Semaphore);
        state.binaries.insert(handle, false);
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state()
            .destroy(HandleKind::Semaphore, semaphore.as_raw());
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64, NativeError> {
        self.state()
            .timelines
            .get(&semaphore.as_raw())
            .copied()
            .ok_or(NativeError::UnknownHandle(semaphore.as_raw()))
    }

    fn wait_semaphores(
        &self,
        waits: &[(vk::Semaphore, u64)],
        _timeout: Duration,
    ) -> Result<(), NativeError> {
        let state = self.state();
        let mut unreached = 0;
        for (sem, value) in waits {
            match state.timelines.get(&sem.as_raw()) {
                Some(current) if *current >= *value => {}
                Some(_) => unreached += 1,
                None => return Err(NativeError::UnknownHandle(sem.as_raw())),
            }
        }

        if unreached > 0 {
            Err(NativeError::Timeout(unreached))
        } else {
            Ok(())
        }
    }

    fn begin_command_list(&self, queue: u32) -> Result<vk::CommandBuffer, NativeError> {
        if queue as usize >= self.queues.len() {
            return Err(NativeError::NoSuchQueue(queue));
        }
        let mut state = self.state();
        let handle = state.alloc(HandleKind::CommandList);
        state.command_lists.insert(
            handle,
            CommandList {
                queue,
                ended: false,
                referenced: AHashSet::default(),
                timestamps: Vec::new(),
            },
        );
        Ok(vk::CommandBuffer::from_raw(handle))
    }

    fn end_command_list(&self, command_list: vk::CommandBuffer) -> Result<(), NativeError> {
        let mut state = self.state();
        match state.command_lists.get_mut(&command_list.as_raw()) {
            Some(list) => {
                list.ended = true;
                Ok(())
            }
            None => Err(NativeError::UnknownHandle(command_list.as_raw())),
        }
    }

    fn free_command_list(&self, queue: u32, command_list: vk::CommandBuffer) {
        let mut state = self.state();
        let raw = command_list.as_raw();
        if let Some(list) = state.command_lists.get(&raw) {
            if list.queue != queue {
                let msg = format!(
                    "command list 0x{:x} freed on queue {}, but allocated on {}",
                    raw, queue, list.queue
                );
                state.validation.push(msg);
            }
        }
        state.destroy(HandleKind::CommandList, raw);
        //keep the list itself, pending submissions might still reference it
        if !state.in_use(raw) {
            state.command_lists.remove(&raw);
        }
    }

    fn submit(&self, queue: u32, info: &SubmitInfo) -> Result<(), NativeError> {
        if queue as usize >= self.queues.len() {
            return Err(NativeError::NoSuchQueue(queue));
        }
        let mut state = self.state();

        for cl in info.command_lists {
            let raw = cl.as_raw();
            state.check_alive(raw, "submit");
            let msg = match state.command_lists.get(&raw) {
                Some(list) if !list.ended => {
                    Some(format!("submitting open command list 0x{:x}", raw))
                }
                Some(list) if list.queue != queue => Some(format!(
                    "command list 0x{:x} of queue {} submitted to queue {}",
                    raw, list.queue, queue
                )),
                _ => None,
            };
            if let Some(msg) = msg {
                state.validation.push(msg);
            }
        }

        for w in info.waits {
            state.check_alive(w.semaphore.as_raw(), "submit wait");
        }
        for s in info.signals {
            let raw = s.semaphore.as_raw();
            state.check_alive(raw, "submit signal");
            if let Some(promised) = state.promised.get(&raw).copied() {
                if s.value <= promised {
                    let msg = format!(
                        "timeline 0x{:x} signals {} but already promised {}",
                        raw, s.value, promised
                    );
                    state.validation.push(msg);
                }
                state.promised.insert(raw, promised.max(s.value));
            }
        }

        state.calls.push(NativeCall::Submit(SubmitRecord {
            queue,
            waits: info.waits.to_vec(),
            command_lists: info.command_lists.to_vec(),
            signals: info.signals.to_vec(),
        }));
        state.pending.push_back(PendingSubmit {
            queue,
            waits: info.waits.to_vec(),
            signals: info.signals.to_vec(),
            command_lists: info.command_lists.iter().map(|c| c.as_raw()).collect(),
        });

        if state.auto_complete {
            state.complete_ready(None);
        }
        Ok(())
    }

    fn cmd_pipeline_barrier(&self, command_list: vk::CommandBuffer, barriers: &BarrierBuilder) {
        let handles = barriers
            .buffers
            .iter()
            .map(|b| b.buffer.as_raw())
            .chain(barriers.images.iter().map(|i| i.image.as_raw()))
            .collect::<Vec<_>>();
        self.state().record(
            command_list,
            &handles,
            NativeCall::Barrier {
                command_list,
                barriers: barriers.clone(),
            },
        );
    }

    fn cmd_copy_buffer(
        &self,
        command_list: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        _regions: &[BufferCopyRegion],
    ) {
        self.state().record(
            command_list,
            &[src.as_raw(), dst.as_raw()],
            NativeCall::CopyBuffer {
                command_list,
                src,
                dst,
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_list: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        _regions: &[BufferImageCopyRegion],
    ) {
        self.state().record(
            command_list,
            &[src.as_raw(), dst.as_raw()],
            NativeCall::CopyBufferToImage {
                command_list,
                src,
                dst,
                layout,
            },
        );
    }

    fn cmd_build_acceleration_structure(
        &self,
        command_list: vk::CommandBuffer,
        info: &AsBuildInfo,
    ) {
        let mut handles = vec![info.dst.as_raw(), info.scratch.as_raw()];
        match &info.geometry {
            AsGeometry::Triangles {
                vertices, indices, ..
            } => {
                handles.push(vertices.as_raw());
                if let Some(idx) = indices {
                    handles.push(idx.as_raw());
                }
            }
            AsGeometry::Instances {
                instances, blas, ..
            } => {
                handles.push(instances.as_raw());
                handles.extend(blas.iter().map(|b| b.as_raw()));
            }
        }
        self.state().record(
            command_list,
            &handles,
            NativeCall::BuildAccelerationStructure {
                command_list,
                dst: info.dst,
                ty: info.ty,
            },
        );
    }

    fn cmd_begin_rendering(&self, command_list: vk::CommandBuffer, info: &RenderingInfo) {
        let handles = info
            .color
            .iter()
            .chain(info.depth.iter())
            .map(|a| a.image.as_raw())
            .collect::<Vec<_>>();
        self.state().record(
            command_list,
            &handles,
            NativeCall::BeginRendering {
                command_list,
                info: info.clone(),
            },
        );
    }

    fn cmd_end_rendering(&self, command_list: vk::CommandBuffer) {
        self.state()
            .record(command_list, &[], NativeCall::EndRendering { command_list });
    }

    fn cmd_bind_pipeline(
        &self,
        command_list: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.state().record(
            command_list,
            &[pipeline.as_raw()],
            NativeCall::BindPipeline {
                command_list,
                pipeline,
            },
        );
    }

    fn cmd_bind_descriptor_sets(
        &self,
        command_list: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        _first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        let handles = sets
            .iter()
            .map(|s| s.as_raw())
            .chain(std::iter::once(layout.as_raw()))
            .collect::<Vec<_>>();
        self.state().record(
            command_list,
            &handles,
            NativeCall::BindDescriptorSets {
                command_list,
                sets: sets.to_vec(),
            },
        );
    }

    fn cmd_push_constants(
        &self,
        command_list: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        _offset: u32,
        data: &[u8],
    ) {
        self.state().record(
            command_list,
            &[layout.as_raw()],
            NativeCall::PushConstants {
                command_list,
                size: data.len(),
            },
        );
    }

    fn cmd_bind_vertex_buffers(
        &self,
        command_list: vk::CommandBuffer,
        _first_binding: u32,
        buffers: &[(vk::Buffer, u64)],
    ) {
        let handles = buffers.iter().map(|(b, _)| b.as_raw()).collect::<Vec<_>>();
        self.state().record(
            command_list,
            &handles,
            NativeCall::BindVertexBuffers {
                command_list,
                buffers: buffers.iter().map(|(b, _)| *b).collect(),
            },
        );
    }

    fn cmd_bind_index_buffer(
        &self,
        command_list: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: u64,
        _index_type: vk::IndexType,
    ) {
        self.state().record(
            command_list,
            &[buffer.as_raw()],
            NativeCall::BindIndexBuffer {
                command_list,
                buffer,
            },
        );
    }

    fn cmd_draw(
        &self,
        command_list: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.state().record(
            command_list,
            &[],
            NativeCall::Draw {
                command_list,
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        command_list: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.state().record(
            command_list,
            &[],
            NativeCall::DrawIndexed {
                command_list,
                index_count,
                instance_count,
            },
        );
    }

    fn cmd_dispatch(&self, command_list: vk::CommandBuffer, groups: [u32; 3]) {
        self.state().record(
            command_list,
            &[],
            NativeCall::Dispatch {
                command_list,
                groups,
            },
        );
    }

    fn cmd_trace_rays(&self, command_list: vk::CommandBuffer, extent: [u32; 3]) {
        self.state().record(
            command_list,
            &[],
            NativeCall::TraceRays {
                command_list,
                extent,
            },
        );
    }

    fn cmd_write_timestamp(
        &self,
        command_list: vk::CommandBuffer,
        _stage: vk::PipelineStageFlags2,
        pool: vk::QueryPool,
        query: u32,
    ) {
        let mut state = self.state();
        state.record(
            command_list,
            &[pool.as_raw()],
            NativeCall::WriteTimestamp {
                command_list,
                pool,
                query,
            },
        );
        if let Some(list) = state.command_lists.get_mut(&command_list.as_raw()) {
            list.timestamps.push((pool.as_raw(), query));
        }
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout, NativeError> {
        Ok(vk::DescriptorSetLayout::from_raw(
            self.state().alloc(HandleKind::DescriptorSetLayout),
        ))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state()
            .destroy(HandleKind::DescriptorSetLayout, layout.as_raw());
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_size: u32,
    ) -> Result<vk::PipelineLayout, NativeError> {
        let mut state = self.state();
        for l in set_layouts {
            state.check_alive(l.as_raw(), "pipeline layout");
        }
        Ok(vk::PipelineLayout::from_raw(
            state.alloc(HandleKind::PipelineLayout),
        ))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state()
            .destroy(HandleKind::PipelineLayout, layout.as_raw());
    }

    fn create_pipeline(
        &self,
        _desc: &PipelineDesc,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline, NativeError> {
        let mut state = self.state();
        state.check_alive(layout.as_raw(), "pipeline");
        Ok(vk::Pipeline::from_raw(state.alloc(HandleKind::Pipeline)))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state().destroy(HandleKind::Pipeline, pipeline.as_raw());
    }

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, NativeError> {
        let mut state = self.state();
        state.check_alive(layout.as_raw(), "descriptor set");
        Ok(vk::DescriptorSet::from_raw(
            state.alloc(HandleKind::DescriptorSet),
        ))
    }

    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state();
        state.check_alive(set.as_raw(), "descriptor write");
        for res in writes.iter().flat_map(|w| w.resources.iter()) {
            let raw = match res {
                DescriptorResource::Buffer { buffer, .. } => buffer.as_raw(),
                DescriptorResource::Image { image, .. } => image.as_raw(),
                DescriptorResource::Sampler(s) => s.as_raw(),
                DescriptorResource::AccelerationStructure(a) => a.as_raw(),
            };
            state.check_alive(raw, "descriptor write");
        }
    }

    fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        self.state()
            .destroy(HandleKind::DescriptorSet, set.as_raw());
    }

    fn create_timestamp_pool(&self, count: u32) -> Result<vk::QueryPool, NativeError> {
        let mut state = self.state();
        let handle = state.alloc(HandleKind::QueryPool);
        state.query_pools.insert(handle, vec![None; count as usize]);
        Ok(vk::QueryPool::from_raw(handle))
    }

    fn reset_query_pool(&self, pool: vk::QueryPool, first: u32, count: u32) {
        let mut state = self.state();
        if let Some(queries) = state.query_pools.get_mut(&pool.as_raw()) {
            for q in queries.iter_mut().skip(first as usize).take(count as usize) {
                *q = None;
            }
        }
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        let mut state = self.state();
        state.destroy(HandleKind::QueryPool, pool.as_raw());
        state.query_pools.remove(&pool.as_raw());
    }

    fn timestamp_results(
        &self,
        pool: vk::QueryPool,
        count: u32,
    ) -> Result<Vec<Option<u64>>, NativeError> {
        self.state()
            .query_pools
            .get(&pool.as_raw())
            .map(|q| q.iter().take(count as usize).copied().collect())
            .ok_or(NativeError::UnknownHandle(pool.as_raw()))
    }

    fn timestamp_period(&self) -> f32 {
        1.0
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: Option<vk::SwapchainKHR>,
    ) -> Result<(vk::SwapchainKHR, Vec<vk::Image>), NativeError> {
        if desc.width == 0 || desc.height == 0 || desc.image_count == 0 {
            return Err(NativeError::VkError(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        let mut state = self.state();
        if let Some(old) = old {
            state.check_alive(old.as_raw(), "swapchain recreation");
        }
        let handle = state.alloc(HandleKind::Swapchain);
        let images = (0..desc.image_count)
            .map(|_| state.alloc(HandleKind::Image))
            .collect::<Vec<_>>();
        state.swapchains.insert(
            handle,
            Swapchain {
                images: images.clone(),
                next: 0,
            },
        );
        Ok((
            vk::SwapchainKHR::from_raw(handle),
            images.into_iter().map(vk::Image::from_raw).collect(),
        ))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state();
        if let Some(sc) = state.swapchains.remove(&swapchain.as_raw()) {
            for img in sc.images {
                state.destroy(HandleKind::Image, img);
            }
        }
        state.destroy(HandleKind::Swapchain, swapchain.as_raw());
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> Result<(u32, bool), NativeError> {
        let mut state = self.state();
        if let Some(err) = state.acquire_errors.pop_front() {
            return Err(err);
        }
        if !state.check_alive(signal.as_raw(), "acquire") {
            return Err(NativeError::UnknownHandle(signal.as_raw()));
        }

        let index = match state.swapchains.get_mut(&swapchain.as_raw()) {
            Some(sc) => {
                let index = sc.next;
                sc.next = (sc.next + 1) % sc.images.len() as u32;
                index
            }
            None => return Err(NativeError::UnknownHandle(swapchain.as_raw())),
        };

        match state.binaries.get(&signal.as_raw()).copied() {
            Some(true) => state.validation.push(format!(
                "acquire signals semaphore 0x{:x} that is already signaled",
                signal.as_raw()
            )),
            Some(false) => {}
            None => return Err(NativeError::UnknownHandle(signal.as_raw())),
        }
        state.binaries.insert(signal.as_raw(), true);
        state.calls.push(NativeCall::Acquire { swapchain, index });
        Ok((index, false))
    }

    fn queue_present(
        &self,
        queue: u32,
        swapchain: vk::SwapchainKHR,
        index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool, NativeError> {
        if queue as usize >= self.queues.len() {
            return Err(NativeError::NoSuchQueue(queue));
        }
        let mut state = self.state();
        if let Some(err) = state.present_errors.pop_front() {
            return Err(err);
        }
        state.check_alive(swapchain.as_raw(), "present");

        let raw = wait.as_raw();
        let signaled = state.binaries.get(&raw).copied().unwrap_or(false);
        let will_signal = state
            .pending
            .iter()
            .any(|p| p.signals.iter().any(|s| s.semaphore == wait));
        if !signaled && !will_signal {
            state.validation.push(format!(
                "present waits on semaphore 0x{:x} that is never signaled",
                raw
            ));
        }
        if let Some(b) = state.binaries.get_mut(&raw) {
            *b = false;
        }
        state.calls.push(NativeCall::Present {
            queue,
            swapchain,
            index,
        });
        Ok(false)
    }

    fn wait_idle(&self) -> Result<(), NativeError> {
        let mut state = self.state();
        state.complete_ready(None);
        if state.pending.is_empty() {
            Ok(())
        } else {
            Err(NativeError::Timeout(state.pending.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(HeadlessDevice: Send, Sync, NativeDevice);
    }

    fn submit_signal(
        dev: &HeadlessDevice,
        queue: u32,
        waits: &[SemaphoreSubmit],
        sem: vk::Semaphore,
        value: u64,
    ) {
        dev.submit(
            queue,
            &SubmitInfo {
                waits,
                command_lists: &[],
                signals: &[SemaphoreSubmit {
                    semaphore: sem,
                    value,
                    stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                }],
            },
        )
        .unwrap();
    }

    #[test]
    fn manual_completion_respects_waits() {
        let dev = HeadlessDevice::with_default_queues();
        dev.set_auto_complete(false);
        let a = dev.create_timeline_semaphore(0).unwrap();
        let b = dev.create_timeline_semaphore(0).unwrap();

        //queue 1 waits for queue 0
        submit_signal(
            &dev,
            1,
            &[SemaphoreSubmit {
                semaphore: a,
                value: 1,
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            }],
            b,
            1,
        );
        submit_signal(&dev, 0, &[], a, 1);
        assert_eq!(dev.pending_submissions(), 2);

        dev.complete_queue(1);
        assert_eq!(dev.semaphore_value(b).unwrap(), 0);
        assert!(matches!(
            dev.wait_semaphores(&[(b, 1)], Duration::from_secs(1)),
            Err(NativeError::Timeout(1))
        ));

        dev.complete_all();
        assert_eq!(dev.semaphore_value(a).unwrap(), 1);
        assert_eq!(dev.semaphore_value(b).unwrap(), 1);
        assert!(dev.validation_errors().is_empty());
    }

    #[test]
    fn detects_destroy_while_pending() {
        let dev = HeadlessDevice::with_default_queues();
        dev.set_auto_complete(false);
        let buffer = dev.create_buffer(&BufDesc::storage(64)).unwrap();
        let cl = dev.begin_command_list(0).unwrap();
        dev.cmd_copy_buffer(cl, buffer, buffer, &[]);
        dev.end_command_list(cl).unwrap();
        dev.submit(
            0,
            &SubmitInfo {
                command_lists: &[cl],
                ..Default::default()
            },
        )
        .unwrap();

        dev.destroy_buffer(buffer);
        let errors = dev.validation_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("in use"));

        //use after free in a new list
        let cl2 = dev.begin_command_list(0).unwrap();
        dev.cmd_copy_buffer(cl2, buffer, buffer, &[]);
        assert!(dev.validation_errors()[1].contains("destroyed"));
    }

    #[test]
    fn non_increasing_timeline_is_reported() {
        let dev = HeadlessDevice::with_default_queues();
        let sem = dev.create_timeline_semaphore(0).unwrap();
        submit_signal(&dev, 0, &[], sem, 2);
        submit_signal(&dev, 0, &[], sem, 2);
        assert_eq!(dev.validation_errors().len(), 1);
        assert_eq!(dev.semaphore_value(sem).unwrap(), 2);
    }

    #[test]
    fn swapchain_errors_can_be_injected() {
        let dev = HeadlessDevice::with_default_queues();
        let (sc, images) = dev
            .create_swapchain(&SwapchainDesc::default(), None)
            .unwrap();
        assert_eq!(images.len(), 3);
        let sem = dev.create_binary_semaphore().unwrap();

        dev.inject_acquire_error(NativeError::SwapchainOutOfDate);
        assert_eq!(
            dev.acquire_next_image(sc, sem),
            Err(NativeError::SwapchainOutOfDate)
        );
        assert_eq!(dev.acquire_next_image(sc, sem), Ok((0, false)));

        dev.destroy_swapchain(sc);
        assert_eq!(dev.live_handles(HandleKind::Image), 0);
        assert_eq!(dev.live_handles(HandleKind::Swapchain), 0);
    }
}
