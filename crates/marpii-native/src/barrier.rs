use ash::vk;
use tinyvec::TinyVec;

///Region of an image's mip levels and array layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct SubresourceRange {
    pub aspect: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    ///Range that covers a single `mip` level of a single array `layer`.
    pub fn single(aspect: vk::ImageAspectFlags, mip: u32, layer: u32) -> Self {
        SubresourceRange {
            aspect,
            base_mip: mip,
            mip_count: 1,
            base_layer: layer,
            layer_count: 1,
        }
    }

    ///Range that covers `mips` levels and `layers` layers starting at 0.
    pub fn all(aspect: vk::ImageAspectFlags, mips: u32, layers: u32) -> Self {
        SubresourceRange {
            aspect,
            base_mip: 0,
            mip_count: mips,
            base_layer: 0,
            layer_count: layers,
        }
    }

    ///Iterates all `(mip, layer)` pairs, mip major.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.base_mip..(self.base_mip + self.mip_count)).flat_map(move |mip| {
            (self.base_layer..(self.base_layer + self.layer_count)).map(move |layer| (mip, layer))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl BufferBarrier {
    ///True if this barrier moves the buffer between two queue families.
    pub fn is_queue_transfer(&self) -> bool {
        self.src_queue_family != self.dst_queue_family
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub range: SubresourceRange,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl ImageBarrier {
    ///True if this barrier moves the image between two queue families.
    pub fn is_queue_transfer(&self) -> bool {
        self.src_queue_family != self.dst_queue_family
    }
}

///Global memory barrier. Used for resources that are not tracked per object on the native side, like
/// acceleration structures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MemoryBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

///Barrier building helper. Lets you add barriers for images and buffers
/// via a simple builder API.
///
/// Uses tinyvec internally. [STACK_ALLOCATION](Self::STACK_ALLOCATION) barriers per type are stack allocated, the builder
/// can outgrow that value though.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarrierBuilder {
    pub images: TinyVec<[ImageBarrier; Self::STACK_ALLOCATION]>,
    pub buffers: TinyVec<[BufferBarrier; Self::STACK_ALLOCATION]>,
    pub memory: TinyVec<[MemoryBarrier; 2]>,
}

impl BarrierBuilder {
    ///Ammount of barriers that can be stack allocated.
    pub const STACK_ALLOCATION: usize = 6;

    pub fn new() -> Self {
        Self::default()
    }

    ///Pushes a full buffer barrier, including possible queue family transfers.
    pub fn buffer_barrier(&mut self, barrier: BufferBarrier) -> &mut Self {
        #[cfg(feature = "logging")]
        log::trace!("buffer[{:?}] {:?}", barrier.buffer, barrier);
        self.buffers.push(barrier);
        self
    }

    ///Pushes only a queue transition for the whole `buffer`.
    pub fn buffer_queue_transition(
        &mut self,
        buffer: vk::Buffer,
        src_queue_family: u32,
        dst_queue_family: u32,
    ) -> &mut Self {
        self.buffers.push(BufferBarrier {
            buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_queue_family,
            dst_queue_family,
            ..Default::default()
        });
        self
    }

    ///Pushes a full image barrier, including possible layout and queue family transitions.
    pub fn image_barrier(&mut self, barrier: ImageBarrier) -> &mut Self {
        #[cfg(feature = "logging")]
        log::trace!(
            "image[{:?}] {:?} -> {:?}",
            barrier.image,
            barrier.old_layout,
            barrier.new_layout
        );
        self.images.push(barrier);
        self
    }

    ///Pushes only a layout transition for the given region.
    pub fn image_layout_transition(
        &mut self,
        image: vk::Image,
        range: SubresourceRange,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> &mut Self {
        #[cfg(feature = "logging")]
        log::trace!("layout[{:?}] {:#?} -> {:#?}", image, old_layout, new_layout);

        self.images.push(ImageBarrier {
            image,
            range,
            old_layout,
            new_layout,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
            ..Default::default()
        });
        self
    }

    pub fn memory_barrier(&mut self, barrier: MemoryBarrier) -> &mut Self {
        self.memory.push(barrier);
        self
    }

    ///Moves all barriers of `other` into `self`.
    pub fn append(&mut self, other: &mut BarrierBuilder) {
        self.images.extend(other.images.drain(..));
        self.buffers.extend(other.buffers.drain(..));
        self.memory.extend(other.memory.drain(..));
    }

    ///Returns true if at least one barrier has been added.
    pub fn has_barrier(&self) -> bool {
        !self.images.is_empty() || !self.buffers.is_empty() || !self.memory.is_empty()
    }

    ///Number of barriers over all types.
    pub fn len(&self) -> usize {
        self.images.len() + self.buffers.len() + self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_barrier()
    }

    pub fn clear(&mut self) {
        self.images.clear();
        self.buffers.clear();
        self.memory.clear();
    }
}
