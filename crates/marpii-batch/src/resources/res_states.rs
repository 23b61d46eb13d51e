use std::fmt::Display;

use marpii_native::{
    ash::vk,
    desc::{AccelerationStructureDesc, BufDesc, ImgDesc},
};
use smallvec::SmallVec;

use super::handle::{BlasHandle, BufferHandle, ImageHandle, SamplerHandle};

slotmap::new_key_type!(
    ///Key of a buffer in the engine's pool. Use [BufferHandle] in user facing API.
    pub struct BufferKey;
);
slotmap::new_key_type!(
    ///Key of an image in the engine's pool. Use [ImageHandle] in user facing API.
    pub struct ImageKey;
);
slotmap::new_key_type!(
    pub struct SamplerKey;
);
slotmap::new_key_type!(
    ///Key of a bottom or top level acceleration structure.
    pub struct AsKey;
);
slotmap::new_key_type!(
    pub struct DescriptorArrayKey;
);
slotmap::new_key_type!(
    ///Key of a cross-queue dependency token.
    pub struct DependencyKey;
);
slotmap::new_key_type!(
    pub struct SwapchainKey;
);

///Combined state of a single buffer.
pub(crate) struct ResBuffer {
    pub(crate) buffer: vk::Buffer,
    pub(crate) desc: BufDesc,
    ///Set for transient buffers. Id of the batch that owns the buffer.
    pub(crate) transient_batch: Option<u64>,
    ///Last batch a command using this buffer was recorded for.
    pub(crate) last_use: Option<u64>,
}

impl ResBuffer {
    ///True for transient buffers whose batch already retired.
    pub(crate) fn is_expired(&self) -> bool {
        self.transient_batch.is_some() && self.buffer == vk::Buffer::null()
    }
}

pub(crate) struct ResImage {
    pub(crate) image: vk::Image,
    pub(crate) desc: ImgDesc,
    ///Set for swapchain images. Those are owned by the swapchain and never destroyed on their own.
    pub(crate) owner: Option<SwapchainKey>,
    pub(crate) last_use: Option<u64>,
}

impl ResImage {
    pub(crate) fn subresource_count(&self) -> usize {
        (self.desc.mip_levels * self.desc.array_layers) as usize
    }
}

pub(crate) struct ResSampler {
    pub(crate) sampler: vk::Sampler,
    pub(crate) last_use: Option<u64>,
}

pub(crate) struct ResAccelerationStructure {
    pub(crate) handle: vk::AccelerationStructureKHR,
    pub(crate) desc: AccelerationStructureDesc,
    ///For top level structures: the bottom level structures of the latest committed build. They are read
    /// whenever the top level structure is traced against.
    pub(crate) built_from: SmallVec<[BlasHandle; 4]>,
    pub(crate) last_use: Option<u64>,
}

impl ResAccelerationStructure {
    pub(crate) fn is_top_level(&self) -> bool {
        self.desc.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL
    }
}

///Single element of a descriptor array.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArrayElement {
    StorageBuffer(BufferHandle),
    UniformBuffer(BufferHandle),
    SampledImage(ImageHandle),
    StorageImage(ImageHandle),
    Sampler(SamplerHandle),
}

pub(crate) struct ResDescriptorArray {
    pub(crate) ty: vk::DescriptorType,
    pub(crate) elements: Vec<ArrayElement>,
    pub(crate) last_use: Option<u64>,
}

///Point on a queue's timeline at which a dependency token was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ReleasePoint {
    pub(crate) queue: u32,
    pub(crate) value: u64,
    pub(crate) batch: u64,
}

pub(crate) struct ResDependency {
    ///Latest executed release.
    pub(crate) release: Option<ReleasePoint>,
    ///Batch a release was recorded for. Used to catch double releases.
    pub(crate) recorded_release: Option<u64>,
    pub(crate) last_use: Option<u64>,
}

#[derive(Clone, Copy, Hash, PartialEq, PartialOrd, Eq, Debug)]
pub enum AnyResKey {
    Buffer(BufferKey),
    Image(ImageKey),
    Sampler(SamplerKey),
    AccelerationStructure(AsKey),
    DescriptorArray(DescriptorArrayKey),
    Dependency(DependencyKey),
    Swapchain(SwapchainKey),
}

impl Display for AnyResKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnyResKey::Buffer(k) => write!(f, "AnyResKey::Buffer({:?})", k),
            AnyResKey::Image(k) => write!(f, "AnyResKey::Image({:?})", k),
            AnyResKey::Sampler(k) => write!(f, "AnyResKey::Sampler({:?})", k),
            AnyResKey::AccelerationStructure(k) => {
                write!(f, "AnyResKey::AccelerationStructure({:?})", k)
            }
            AnyResKey::DescriptorArray(k) => write!(f, "AnyResKey::DescriptorArray({:?})", k),
            AnyResKey::Dependency(k) => write!(f, "AnyResKey::Dependency({:?})", k),
            AnyResKey::Swapchain(k) => write!(f, "AnyResKey::Swapchain({:?})", k),
        }
    }
}

macro_rules! impl_into_any {
    ($key:ty, $variant:ident) => {
        impl From<$key> for AnyResKey {
            fn from(k: $key) -> Self {
                AnyResKey::$variant(k)
            }
        }
    };
}

impl_into_any!(BufferKey, Buffer);
impl_into_any!(ImageKey, Image);
impl_into_any!(SamplerKey, Sampler);
impl_into_any!(AsKey, AccelerationStructure);
impl_into_any!(DescriptorArrayKey, DescriptorArray);
impl_into_any!(DependencyKey, Dependency);
impl_into_any!(SwapchainKey, Swapchain);
