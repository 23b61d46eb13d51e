//! # Resources
//!
//! Engine owned resource pools. Users only ever see [handles](handle::ResHandle). Each handle signals the
//! pools through a channel once it is dropped. The native object is destroyed as soon as every batch
//! that used it retired.

pub(crate) mod access;
pub(crate) mod handle;
pub(crate) mod res_states;
pub(crate) mod swapchain;

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender};
use marpii_native::{
    NativeDevice,
    ash::vk,
    desc::{AccelerationStructureDesc, BufDesc, ImgDesc, SamplerDesc, SwapchainDesc},
};
use slotmap::SlotMap;
use smallvec::SmallVec;
use thiserror::Error;

use access::{AccessRecord, SubKey};
use handle::{
    BufferHandle, DependencyHandle, DescriptorArrayHandle, ImageHandle, ResHandle, SamplerHandle,
    SwapchainHandle,
};
use res_states::{
    AnyResKey, ArrayElement, AsKey, BufferKey, DependencyKey, DescriptorArrayKey, ImageKey,
    ResAccelerationStructure, ResBuffer, ResDependency, ResDescriptorArray, ResImage, ResSampler,
    SamplerKey, SwapchainKey,
};
use swapchain::{ResSwapchain, SwapchainState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Can not create an empty {0}")]
    Empty(&'static str),
    #[error("Resource {0} does not exist (anymore)")]
    Unknown(AnyResKey),
    #[error("Swapchain has a present recorded. Execute the batch before acquiring the next image")]
    PresentPending,
    #[error("Swapchain could not be recreated after {0} attempts")]
    RecreationFailed(usize),
}

pub(crate) struct Resources {
    pub(crate) buffers: SlotMap<BufferKey, ResBuffer>,
    pub(crate) images: SlotMap<ImageKey, ResImage>,
    pub(crate) samplers: SlotMap<SamplerKey, ResSampler>,
    pub(crate) acceleration_structures: SlotMap<AsKey, ResAccelerationStructure>,
    pub(crate) descriptor_arrays: SlotMap<DescriptorArrayKey, ResDescriptorArray>,
    pub(crate) dependencies: SlotMap<DependencyKey, ResDependency>,
    pub(crate) swapchains: SlotMap<SwapchainKey, ResSwapchain>,

    ///Persistent access records. Only changed by committing a scheduled batch.
    pub(crate) states: AHashMap<SubKey, AccessRecord>,

    drop_signal: Sender<AnyResKey>,
    drop_receiver: Receiver<AnyResKey>,
    pending_disposal: Vec<AnyResKey>,
}

impl Resources {
    pub(crate) fn new() -> Self {
        let (drop_signal, drop_receiver) = crossbeam_channel::unbounded();
        Resources {
            buffers: SlotMap::with_key(),
            images: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            acceleration_structures: SlotMap::with_key(),
            descriptor_arrays: SlotMap::with_key(),
            dependencies: SlotMap::with_key(),
            swapchains: SlotMap::with_key(),
            states: AHashMap::default(),
            drop_signal,
            drop_receiver,
            pending_disposal: Vec::new(),
        }
    }

    fn handle<K: Copy + Into<AnyResKey>>(&self, key: K) -> ResHandle<K> {
        ResHandle::new(key, self.drop_signal.clone())
    }

    pub(crate) fn add_buffer(
        &mut self,
        device: &dyn NativeDevice,
        desc: &BufDesc,
        transient_batch: Option<u64>,
    ) -> Result<BufferHandle, crate::BatchError> {
        if desc.size == 0 {
            return Err(ResourceError::Empty("buffer").into());
        }
        let buffer = device.create_buffer(desc)?;
        let key = self.buffers.insert(ResBuffer {
            buffer,
            desc: desc.clone(),
            transient_batch,
            last_use: None,
        });
        Ok(self.handle(key))
    }

    pub(crate) fn add_image(
        &mut self,
        device: &dyn NativeDevice,
        desc: &ImgDesc,
    ) -> Result<ImageHandle, crate::BatchError> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 || desc.array_layers == 0
        {
            return Err(ResourceError::Empty("image").into());
        }
        let image = device.create_image(desc)?;
        let key = self.images.insert(ResImage {
            image,
            desc: desc.clone(),
            owner: None,
            last_use: None,
        });
        Ok(self.handle(key))
    }

    pub(crate) fn add_sampler(
        &mut self,
        device: &dyn NativeDevice,
        desc: &SamplerDesc,
    ) -> Result<SamplerHandle, crate::BatchError> {
        let sampler = device.create_sampler(desc)?;
        let key = self.samplers.insert(ResSampler {
            sampler,
            last_use: None,
        });
        Ok(self.handle(key))
    }

    pub(crate) fn add_acceleration_structure(
        &mut self,
        device: &dyn NativeDevice,
        desc: &AccelerationStructureDesc,
    ) -> Result<ResHandle<AsKey>, crate::BatchError> {
        if desc.size == 0 {
            return Err(ResourceError::Empty("acceleration structure").into());
        }
        let handle = device.create_acceleration_structure(desc)?;
        let key = self.acceleration_structures.insert(ResAccelerationStructure {
            handle,
            desc: desc.clone(),
            built_from: SmallVec::new(),
            last_use: None,
        });
        Ok(self.handle(key))
    }

    pub(crate) fn add_descriptor_array(
        &mut self,
        ty: vk::DescriptorType,
        elements: Vec<ArrayElement>,
    ) -> Result<DescriptorArrayHandle, crate::BatchError> {
        if elements.is_empty() {
            return Err(ResourceError::Empty("descriptor array").into());
        }
        let key = self.descriptor_arrays.insert(ResDescriptorArray {
            ty,
            elements,
            last_use: None,
        });
        Ok(self.handle(key))
    }

    pub(crate) fn add_dependency(&mut self) -> DependencyHandle {
        let key = self.dependencies.insert(ResDependency {
            release: None,
            recorded_release: None,
            last_use: None,
        });
        self.handle(key)
    }

    pub(crate) fn add_swapchain(
        &mut self,
        device: &dyn NativeDevice,
        desc: &SwapchainDesc,
    ) -> Result<SwapchainHandle, crate::BatchError> {
        let (swapchain, native_images) = device.create_swapchain(desc, None)?;
        let (acquire_semaphores, present_semaphores) =
            ResSwapchain::create_semaphores(device, native_images.len())?;
        let key = self.swapchains.insert(ResSwapchain {
            swapchain,
            desc: desc.clone(),
            images: Vec::new(),
            acquire_semaphores,
            next_acquire_semaphore: 0,
            present_semaphores,
            state: SwapchainState::Idle,
            needs_recreation: false,
            last_use: None,
        });
        self.register_swapchain_images(key, &native_images);
        Ok(self.handle(key))
    }

    fn register_swapchain_images(&mut self, key: SwapchainKey, native_images: &[vk::Image]) {
        let Some(sc) = self.swapchains.get(key) else {
            return;
        };
        let desc = ImgDesc::color_attachment_2d(sc.desc.width, sc.desc.height, sc.desc.format)
            .with_usage(sc.desc.usage);
        let keys = native_images
            .iter()
            .map(|image| {
                self.images.insert(ResImage {
                    image: *image,
                    desc: desc.clone(),
                    owner: Some(key),
                    last_use: None,
                })
            })
            .collect();
        if let Some(sc) = self.swapchains.get_mut(key) {
            sc.images = keys;
        }
    }

    ///Recreates the swapchain `key` with a new extent. The caller has to make sure the old swapchain is
    /// not in use anymore.
    pub(crate) fn recreate_swapchain(
        &mut self,
        device: &dyn NativeDevice,
        key: SwapchainKey,
        width: u32,
        height: u32,
    ) -> Result<(), crate::BatchError> {
        let (old, desc, old_images) = match self.swapchains.get_mut(key) {
            Some(sc) => {
                sc.desc.width = width;
                sc.desc.height = height;
                (
                    sc.swapchain,
                    sc.desc.clone(),
                    std::mem::take(&mut sc.images),
                )
            }
            None => return Err(ResourceError::Unknown(key.into()).into()),
        };

        #[cfg(feature = "logging")]
        log::info!("Recreating swapchain {:?} with extent {}x{}", key, width, height);

        let (swapchain, native_images) = device.create_swapchain(&desc, Some(old))?;
        device.destroy_swapchain(old);
        for img in old_images {
            self.forget_image(img);
        }

        let (acquire, present) = ResSwapchain::create_semaphores(device, native_images.len())?;
        if let Some(sc) = self.swapchains.get_mut(key) {
            sc.destroy_semaphores(device);
            sc.swapchain = swapchain;
            sc.acquire_semaphores = acquire;
            sc.present_semaphores = present;
            sc.next_acquire_semaphore = 0;
            sc.state = SwapchainState::Idle;
            sc.needs_recreation = false;
        }
        self.register_swapchain_images(key, &native_images);
        Ok(())
    }

    ///Removes the image record and all its access records, without touching the native image.
    fn forget_image(&mut self, key: ImageKey) -> Option<ResImage> {
        let img = self.images.remove(key)?;
        for mip in 0..img.desc.mip_levels {
            for layer in 0..img.desc.array_layers {
                self.states.remove(&SubKey::Image { key, mip, layer });
            }
        }
        Some(img)
    }

    ///Forgets the access history of an image. Used when the content of an image becomes undefined, like
    /// after acquiring a swapchain image.
    pub(crate) fn reset_image_states(&mut self, key: ImageKey) {
        if let Some(img) = self.images.get(key) {
            for mip in 0..img.desc.mip_levels {
                for layer in 0..img.desc.array_layers {
                    self.states.remove(&SubKey::Image { key, mip, layer });
                }
            }
        }
    }

    ///Marks `key` as used by `batch`.
    pub(crate) fn mark_use(&mut self, key: AnyResKey, batch: u64) {
        let last_use = match key {
            AnyResKey::Buffer(k) => self.buffers.get_mut(k).map(|r| &mut r.last_use),
            AnyResKey::Image(k) => self.images.get_mut(k).map(|r| &mut r.last_use),
            AnyResKey::Sampler(k) => self.samplers.get_mut(k).map(|r| &mut r.last_use),
            AnyResKey::AccelerationStructure(k) => self
                .acceleration_structures
                .get_mut(k)
                .map(|r| &mut r.last_use),
            AnyResKey::DescriptorArray(k) => {
                self.descriptor_arrays.get_mut(k).map(|r| &mut r.last_use)
            }
            AnyResKey::Dependency(k) => self.dependencies.get_mut(k).map(|r| &mut r.last_use),
            AnyResKey::Swapchain(k) => self.swapchains.get_mut(k).map(|r| &mut r.last_use),
        };
        if let Some(last_use) = last_use {
            *last_use = Some(batch);
        }
    }

    fn last_use(&self, key: AnyResKey) -> Option<Option<u64>> {
        match key {
            AnyResKey::Buffer(k) => self.buffers.get(k).map(|r| r.last_use),
            AnyResKey::Image(k) => self.images.get(k).map(|r| r.last_use),
            AnyResKey::Sampler(k) => self.samplers.get(k).map(|r| r.last_use),
            AnyResKey::AccelerationStructure(k) => {
                self.acceleration_structures.get(k).map(|r| r.last_use)
            }
            AnyResKey::DescriptorArray(k) => self.descriptor_arrays.get(k).map(|r| r.last_use),
            AnyResKey::Dependency(k) => self.dependencies.get(k).map(|r| r.last_use),
            AnyResKey::Swapchain(k) => self.swapchains.get(k).map(|r| r.last_use),
        }
    }

    ///Destroys all transient buffers owned by `batch`. Their handles stay valid, but can't be used anymore.
    pub(crate) fn expire_transients(&mut self, device: &dyn NativeDevice, batch: u64) {
        let mut expired = Vec::new();
        for (key, buf) in self.buffers.iter_mut() {
            if buf.transient_batch == Some(batch) && buf.buffer != vk::Buffer::null() {
                device.destroy_buffer(buf.buffer);
                buf.buffer = vk::Buffer::null();
                expired.push(key);
            }
        }
        for key in expired {
            self.states.remove(&SubKey::Buffer(key));
        }
    }

    ///Disposes every dropped resource whose last use retired.
    ///
    /// Disposing can drop further handles (for instance the elements of a descriptor array), so this runs until
    /// no new drops arrive.
    pub(crate) fn dispose_retired(
        &mut self,
        device: &dyn NativeDevice,
        is_retired: impl Fn(u64) -> bool,
    ) {
        loop {
            let before = self.pending_disposal.len();
            self.pending_disposal.extend(self.drop_receiver.try_iter());

            let mut ready = Vec::new();
            let mut i = 0;
            while i < self.pending_disposal.len() {
                let key = self.pending_disposal[i];
                let disposable = match self.last_use(key) {
                    //Already gone
                    None => true,
                    Some(None) => true,
                    Some(Some(batch)) => is_retired(batch),
                };
                if disposable {
                    ready.push(self.pending_disposal.swap_remove(i));
                } else {
                    i += 1;
                }
            }

            let disposed = ready.len();
            for key in ready {
                self.dispose(device, key);
            }

            if disposed == 0
                && self.pending_disposal.len() == before
                && self.drop_receiver.is_empty()
            {
                break;
            }
        }
    }

    fn dispose(&mut self, device: &dyn NativeDevice, key: AnyResKey) {
        #[cfg(feature = "logging")]
        log::trace!("Disposing {}", key);

        match key {
            AnyResKey::Buffer(k) => {
                if let Some(buf) = self.buffers.remove(k) {
                    if buf.buffer != vk::Buffer::null() {
                        device.destroy_buffer(buf.buffer);
                    }
                    self.states.remove(&SubKey::Buffer(k));
                }
            }
            AnyResKey::Image(k) => {
                if self.images.get(k).map(|i| i.owner.is_some()).unwrap_or(true) {
                    return;
                }
                if let Some(img) = self.forget_image(k) {
                    device.destroy_image(img.image);
                }
            }
            AnyResKey::Sampler(k) => {
                if let Some(s) = self.samplers.remove(k) {
                    device.destroy_sampler(s.sampler);
                }
            }
            AnyResKey::AccelerationStructure(k) => {
                if let Some(acc) = self.acceleration_structures.remove(k) {
                    device.destroy_acceleration_structure(acc.handle);
                    self.states.remove(&SubKey::AccelerationStructure(k));
                }
            }
            AnyResKey::DescriptorArray(k) => {
                self.descriptor_arrays.remove(k);
            }
            AnyResKey::Dependency(k) => {
                self.dependencies.remove(k);
            }
            AnyResKey::Swapchain(k) => {
                if let Some(mut sc) = self.swapchains.remove(k) {
                    sc.destroy_semaphores(device);
                    for img in std::mem::take(&mut sc.images) {
                        self.forget_image(img);
                    }
                    device.destroy_swapchain(sc.swapchain);
                }
            }
        }
    }

    ///Destroys every native object regardless of handles. Only valid once the device is idle.
    pub(crate) fn destroy_all(&mut self, device: &dyn NativeDevice) {
        for (_, buf) in self.buffers.drain() {
            if buf.buffer != vk::Buffer::null() {
                device.destroy_buffer(buf.buffer);
            }
        }
        for (_, img) in self.images.drain() {
            if img.owner.is_none() {
                device.destroy_image(img.image);
            }
        }
        for (_, s) in self.samplers.drain() {
            device.destroy_sampler(s.sampler);
        }
        //clear first, TLAS records hold BLAS handles
        let structures = self
            .acceleration_structures
            .drain()
            .map(|(_, acc)| acc.handle)
            .collect::<Vec<_>>();
        for acc in structures {
            device.destroy_acceleration_structure(acc);
        }
        for (_, mut sc) in self.swapchains.drain() {
            sc.destroy_semaphores(device);
            device.destroy_swapchain(sc.swapchain);
        }
        self.descriptor_arrays.clear();
        self.dependencies.clear();
        self.states.clear();
        self.pending_disposal.clear();
        while self.drop_receiver.try_recv().is_ok() {}
    }

    pub(crate) fn native_buffer(&self, key: BufferKey) -> Result<vk::Buffer, ResourceError> {
        self.buffers
            .get(key)
            .map(|b| b.buffer)
            .ok_or(ResourceError::Unknown(key.into()))
    }

    pub(crate) fn native_image(&self, key: ImageKey) -> Result<vk::Image, ResourceError> {
        self.images
            .get(key)
            .map(|i| i.image)
            .ok_or(ResourceError::Unknown(key.into()))
    }

    pub(crate) fn native_sampler(&self, key: SamplerKey) -> Result<vk::Sampler, ResourceError> {
        self.samplers
            .get(key)
            .map(|s| s.sampler)
            .ok_or(ResourceError::Unknown(key.into()))
    }

    pub(crate) fn native_acceleration_structure(
        &self,
        key: AsKey,
    ) -> Result<vk::AccelerationStructureKHR, ResourceError> {
        self.acceleration_structures
            .get(key)
            .map(|a| a.handle)
            .ok_or(ResourceError::Unknown(key.into()))
    }
}
