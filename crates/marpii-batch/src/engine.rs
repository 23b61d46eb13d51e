use std::{collections::VecDeque, sync::Arc, time::Duration};

use marpii_native::{
    NativeDevice,
    ash::vk,
    desc::{AccelerationStructureDesc, BufDesc, ImgDesc, SamplerDesc, SwapchainDesc},
};
use smallvec::SmallVec;

use crate::{
    BatchError,
    batch::{BatchContext, BatchStats, QueueContext},
    cache::ContextCache,
    command::CommandLog,
    recorder::{QueueRecorder, RecordError},
    resources::{
        ResourceError, Resources,
        handle::{
            BlasHandle, BufferHandle, DependencyHandle, DescriptorArrayHandle, ImageHandle,
            SamplerHandle, SwapchainHandle, TlasHandle,
        },
        res_states::ArrayElement,
        swapchain::SwapchainState,
    },
    timer::TaskTiming,
    track::Tracks,
};

///Tunables of an [Engine].
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    ///Number of batches that may execute on the gpu at the same time. [execute_all](Engine::execute_all) blocks
    /// on the oldest batch once the limit is reached.
    pub max_inflight_batches: usize,
    ///Timestamp queries per queue and batch. Each timer uses two.
    pub timestamp_capacity: u32,
    ///How often acquiring an image may recreate the swapchain before giving up.
    pub swapchain_recreate_attempts: usize,
    ///Timeout of every blocking wait of the engine.
    pub wait_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_inflight_batches: 2,
            timestamp_capacity: 128,
            swapchain_recreate_attempts: 3,
            wait_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn with(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }
}

///Native objects of an executed batch that are kept until the batch retired.
struct InflightBatch {
    id: u64,
    ///End value per queue.
    ends: SmallVec<[u64; 4]>,
    queues: Vec<QueueContext>,
}

///Deferred multi-queue command engine.
///
/// Commands are recorded per queue through [queue](Engine::queue). Nothing reaches the device until
/// [execute_all](Engine::execute_all) schedules everything recorded so far as one batch. All barriers, layout
/// transitions, queue family ownership transfers and semaphore waits are derived from the recorded resource
/// accesses.
pub struct Engine {
    pub(crate) device: Arc<dyn NativeDevice>,
    config: EngineConfig,
    pub(crate) tracks: Tracks,
    pub(crate) res: Resources,
    cache: ContextCache,
    ///Command log per queue of the batch that is currently recorded.
    pub(crate) logs: Vec<CommandLog>,
    ///Next global submission index.
    pub(crate) next_index: u64,
    ///Id of the batch that is currently recorded.
    pub(crate) batch_id: u64,
    inflight: VecDeque<InflightBatch>,
    timings: Vec<TaskTiming>,
}

impl Engine {
    pub fn new(device: Arc<dyn NativeDevice>, config: EngineConfig) -> Result<Self, BatchError> {
        let tracks = Tracks::new(device.as_ref())?;

        #[cfg(feature = "logging")]
        for t in tracks.0.iter() {
            log::info!("Queue {}: family {}, {:?}", t.queue, t.family, t.flags);
        }

        let logs = (0..tracks.0.len()).map(|_| CommandLog::default()).collect();
        Ok(Engine {
            device,
            config,
            tracks,
            res: Resources::new(),
            cache: ContextCache::new(),
            logs,
            next_index: 0,
            batch_id: 0,
            inflight: VecDeque::new(),
            timings: Vec::new(),
        })
    }

    pub fn device(&self) -> &Arc<dyn NativeDevice> {
        &self.device
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue_count(&self) -> usize {
        self.tracks.0.len()
    }

    pub fn cache(&self) -> &ContextCache {
        &self.cache
    }

    ///Number of executed batches that have not retired yet.
    pub fn inflight_batches(&self) -> usize {
        self.inflight.len()
    }

    ///Timer results of the latest retired batch that recorded timers.
    pub fn timings(&self) -> &[TaskTiming] {
        &self.timings
    }

    pub fn request_buffer(&mut self, desc: &BufDesc) -> Result<BufferHandle, BatchError> {
        self.res.add_buffer(self.device.as_ref(), desc, None)
    }

    ///Buffer that can only be used by the batch that is currently recorded. It is destroyed as soon as that
    /// batch retired, regardless of its handles.
    pub fn request_transient_buffer(&mut self, desc: &BufDesc) -> Result<BufferHandle, BatchError> {
        self.res
            .add_buffer(self.device.as_ref(), desc, Some(self.batch_id))
    }

    pub fn request_image(&mut self, desc: &ImgDesc) -> Result<ImageHandle, BatchError> {
        self.res.add_image(self.device.as_ref(), desc)
    }

    pub fn request_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle, BatchError> {
        self.res.add_sampler(self.device.as_ref(), desc)
    }

    ///Bottom level acceleration structure with `size` bytes of storage. The scratch memory of each build is
    /// allocated per build.
    pub fn request_blas(
        &mut self,
        size: u64,
        build_scratch_size: u64,
    ) -> Result<BlasHandle, BatchError> {
        self.res.add_acceleration_structure(
            self.device.as_ref(),
            &AccelerationStructureDesc {
                ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                size,
                build_scratch_size,
            },
        )
    }

    pub fn request_tlas(
        &mut self,
        size: u64,
        build_scratch_size: u64,
    ) -> Result<TlasHandle, BatchError> {
        self.res.add_acceleration_structure(
            self.device.as_ref(),
            &AccelerationStructureDesc {
                ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                size,
                build_scratch_size,
            },
        )
    }

    ///Array of resources that is bound as a whole to a single binding.
    pub fn request_descriptor_array(
        &mut self,
        ty: vk::DescriptorType,
        elements: Vec<ArrayElement>,
    ) -> Result<DescriptorArrayHandle, BatchError> {
        self.res.add_descriptor_array(ty, elements)
    }

    ///Token that orders work of one queue after the work another queue recorded before releasing it.
    pub fn request_dependency(&mut self) -> DependencyHandle {
        self.res.add_dependency()
    }

    pub fn request_swapchain(
        &mut self,
        desc: &SwapchainDesc,
    ) -> Result<SwapchainHandle, BatchError> {
        self.res.add_swapchain(self.device.as_ref(), desc)
    }

    ///Recorder for the queue at `index`.
    pub fn queue(&mut self, index: u32) -> Result<QueueRecorder<'_>, RecordError> {
        if index as usize >= self.tracks.0.len() {
            return Err(RecordError::NoSuchQueue(index));
        }
        Ok(QueueRecorder {
            engine: self,
            queue: index,
        })
    }

    ///Recorder for the queue that supports `flags` with the fewest additional capabilities.
    pub fn queue_for(&mut self, flags: vk::QueueFlags) -> Result<QueueRecorder<'_>, RecordError> {
        let index = self
            .tracks
            .track_for_usage(flags)
            .ok_or(RecordError::NoFittingQueue(flags))?;
        self.queue(index)
    }

    ///Acquires the next image of `swapchain` and returns its index. If an image is already acquired, its index
    /// is returned.
    ///
    /// The swapchain is recreated if `extent` changed or the device reported it as out of date or suboptimal.
    /// Recreation waits for the device to become idle.
    pub fn acquire_next_image(
        &mut self,
        swapchain: &SwapchainHandle,
        extent: vk::Extent2D,
    ) -> Result<u32, BatchError> {
        let key = swapchain.key();
        let mut attempts = 0;
        loop {
            let sc = self
                .res
                .swapchains
                .get_mut(key)
                .ok_or(ResourceError::Unknown(key.into()))?;
            match sc.state {
                SwapchainState::PresentRecorded { .. } => {
                    return Err(ResourceError::PresentPending.into());
                }
                SwapchainState::Acquired { index, .. } => return Ok(index),
                SwapchainState::Idle => {}
            }

            if sc.needs_recreation
                || sc.desc.width != extent.width
                || sc.desc.height != extent.height
            {
                if attempts >= self.config.swapchain_recreate_attempts {
                    #[cfg(feature = "logging")]
                    log::error!("Giving up on swapchain {:?} after {} attempts", key, attempts);
                    return Err(ResourceError::RecreationFailed(attempts).into());
                }
                attempts += 1;
                self.wait_idle()?;
                self.res.recreate_swapchain(
                    self.device.as_ref(),
                    key,
                    extent.width,
                    extent.height,
                )?;
                continue;
            }

            let semaphore = sc.next_semaphore();
            let native = sc.swapchain;
            match self.device.acquire_next_image(native, semaphore) {
                Ok((index, suboptimal)) => {
                    let mut image = None;
                    if let Some(sc) = self.res.swapchains.get_mut(key) {
                        sc.state = SwapchainState::Acquired { index, semaphore };
                        sc.needs_recreation |= suboptimal;
                        image = sc.images.get(index as usize).copied();
                    }
                    //content is undefined after acquire
                    if let Some(image) = image {
                        self.res.reset_image_states(image);
                    }
                    return Ok(index);
                }
                Err(e) if e.is_swapchain_transient() => {
                    #[cfg(feature = "logging")]
                    log::warn!("Acquire on swapchain {:?} failed with {}, recreating", key, e);

                    if let Some(sc) = self.res.swapchains.get_mut(key) {
                        sc.needs_recreation = true;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    ///Schedules and submits everything recorded since the last call as one batch.
    ///
    /// # Panics
    ///
    /// if a render pass is still open on any queue.
    pub fn execute_all(&mut self) -> Result<BatchStats, BatchError> {
        for (q, log) in self.logs.iter().enumerate() {
            assert!(
                log.open_pass.is_none(),
                "Queue {} has a render pass that was never ended",
                q
            );
        }

        self.retire_finished()?;
        while self.inflight.len() >= self.config.max_inflight_batches.max(1) {
            self.wait_oldest()?;
        }

        let id = self.batch_id;
        self.batch_id += 1;
        let fresh = (0..self.logs.len()).map(|_| CommandLog::default()).collect();
        let logs = std::mem::replace(&mut self.logs, fresh);
        let prior_ends = self
            .inflight
            .iter()
            .map(|b| (b.id, b.ends.clone()))
            .collect();

        let mut batch = match BatchContext::new(
            id,
            logs,
            self.device.as_ref(),
            &mut self.res,
            &self.tracks,
            prior_ends,
        ) {
            Ok(b) => b,
            Err(e) => {
                self.res.expire_transients(self.device.as_ref(), id);
                self.discard_presents();
                return Err(e);
            }
        };

        let result = batch.run(
            self.device.as_ref(),
            &mut self.res,
            &mut self.cache,
            &mut self.tracks,
            self.config.timestamp_capacity,
        );

        match result {
            Ok(()) => {
                let stats = batch.stats();

                #[cfg(feature = "logging")]
                log::trace!("Executed batch {}: {:?}", id, stats);

                self.inflight.push_back(InflightBatch {
                    id,
                    ends: batch.ends(),
                    queues: batch.queues,
                });
                Ok(stats)
            }
            Err(BatchError::Scheduling(e)) => {
                //nothing was submitted
                self.res.expire_transients(self.device.as_ref(), id);
                self.discard_presents();
                Err(e.into())
            }
            Err(e) => {
                #[cfg(feature = "logging")]
                log::error!("Batch {} failed while executing: {}", id, e);

                if let Err(_wait) = self.device.wait_idle() {
                    #[cfg(feature = "logging")]
                    log::error!("Could not wait for the device after failed batch: {}", _wait);
                }
                for track in self.tracks.0.iter_mut() {
                    if let Err(_poll) = track.poll(self.device.as_ref()) {
                        #[cfg(feature = "logging")]
                        log::error!(
                            "Could not poll queue {} after failed batch: {}",
                            track.queue,
                            _poll
                        );
                    }
                }
                self.retire_batch(InflightBatch {
                    id,
                    ends: SmallVec::new(),
                    queues: batch.queues,
                });
                self.discard_presents();
                Err(e)
            }
        }
    }

    ///Swapchains whose present was never executed. Their acquire semaphore is never waited on, so the
    /// swapchain is recreated on the next acquire.
    fn discard_presents(&mut self) {
        for (_key, sc) in self.res.swapchains.iter_mut() {
            if let SwapchainState::PresentRecorded { .. } = sc.state {
                sc.state = SwapchainState::Idle;
                sc.needs_recreation = true;
            }
        }
    }

    ///Retires every batch that finished on all queues and disposes resources that are not used anymore.
    pub fn retire_finished(&mut self) -> Result<(), BatchError> {
        for track in self.tracks.0.iter_mut() {
            track.poll(self.device.as_ref())?;
        }

        while let Some(batch) = self.inflight.front() {
            let finished = batch
                .ends
                .iter()
                .zip(self.tracks.0.iter())
                .all(|(end, track)| track.retired_value >= *end);
            if !finished {
                break;
            }
            if let Some(batch) = self.inflight.pop_front() {
                self.retire_batch(batch);
            }
        }

        let inflight = self.inflight.iter().map(|b| b.id).collect::<SmallVec<[u64; 4]>>();
        let current = self.batch_id;
        self.res.dispose_retired(self.device.as_ref(), |batch| {
            batch != current && !inflight.contains(&batch)
        });
        Ok(())
    }

    fn retire_batch(&mut self, batch: InflightBatch) {
        #[cfg(feature = "logging")]
        log::trace!("Retiring batch {}", batch.id);

        let device = self.device.as_ref();
        let mut timings = Vec::new();
        for qc in batch.queues {
            for cl in qc.lists {
                device.free_command_list(qc.queue, cl);
            }
            for set in qc.descriptor_sets {
                device.free_descriptor_set(set);
            }
            if let Some(timer) = qc.timer {
                if !timer.is_empty() {
                    timings.extend(timer.resolve(device));
                }
                timer.destroy(device);
            }
        }
        if !timings.is_empty() {
            self.timings = timings;
        }
        self.res.expire_transients(device, batch.id);
    }

    fn wait_oldest(&mut self) -> Result<(), BatchError> {
        if let Some(batch) = self.inflight.front() {
            let waits = batch
                .ends
                .iter()
                .zip(self.tracks.0.iter())
                .map(|(end, track)| (track.sem, *end))
                .collect::<SmallVec<[_; 4]>>();
            self.device.wait_semaphores(&waits, self.config.wait_timeout)?;
        }
        self.retire_finished()
    }

    ///Blocks until the device is idle and retires every batch.
    pub fn wait_idle(&mut self) -> Result<(), BatchError> {
        self.device.wait_idle()?;
        self.retire_finished()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(_e) = self.device.wait_idle() {
            #[cfg(feature = "logging")]
            log::error!("Device did not become idle while dropping the engine: {}", _e);
        }
        while let Some(batch) = self.inflight.pop_front() {
            self.retire_batch(batch);
        }
        //drops the handles held by unexecuted commands
        self.logs.clear();

        let device = self.device.clone();
        self.res.destroy_all(device.as_ref());
        self.cache.destroy(device.as_ref());
        self.tracks.destroy(device.as_ref());
    }
}
