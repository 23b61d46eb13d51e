use std::time::Duration;

use ash::vk;

use crate::{
    desc::{
        AccelerationStructureDesc, AsBuildInfo, BufDesc, BufferCopyRegion, BufferImageCopyRegion,
        DescriptorBinding, DescriptorWrite, ImgDesc, PipelineDesc, RenderingInfo, SamplerDesc,
        SubmitInfo, SwapchainDesc,
    },
    BarrierBuilder, NativeError,
};

///A single hardware queue the device exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueInfo {
    pub family: u32,
    pub flags: vk::QueueFlags,
}

impl QueueInfo {
    ///True if the queue can execute transfer operations. Graphics and compute queues
    /// implicitly support transfer.
    pub fn supports_transfer(&self) -> bool {
        self.flags.intersects(
            vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        )
    }
}

///Capability surface of a graphics device.
///
/// All handles are plain `ash` handles. Creation calls return errors, destruction and
/// command recording does not. Command recording into an ended or freed command list is a
/// usage error of the implementation's caller.
///
/// Queues are addressed by their index into [queues](NativeDevice::queues).
pub trait NativeDevice: Send + Sync {
    fn queues(&self) -> &[QueueInfo];

    fn create_buffer(&self, desc: &BufDesc) -> Result<vk::Buffer, NativeError>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn create_image(&self, desc: &ImgDesc) -> Result<vk::Image, NativeError>;
    fn destroy_image(&self, image: vk::Image);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler, NativeError>;
    fn destroy_sampler(&self, sampler: vk::Sampler);
    fn create_acceleration_structure(
        &self,
        desc: &AccelerationStructureDesc,
    ) -> Result<vk::AccelerationStructureKHR, NativeError>;
    fn destroy_acceleration_structure(&self, acceleration_structure: vk::AccelerationStructureKHR);

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore, NativeError>;
    fn create_binary_semaphore(&self) -> Result<vk::Semaphore, NativeError>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    ///Current counter value of a timeline semaphore.
    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64, NativeError>;
    ///Blocks until every timeline semaphore reached its value, or `timeout` passed.
    fn wait_semaphores(
        &self,
        waits: &[(vk::Semaphore, u64)],
        timeout: Duration,
    ) -> Result<(), NativeError>;

    ///Allocates a primary command list for `queue` and begins recording.
    fn begin_command_list(&self, queue: u32) -> Result<vk::CommandBuffer, NativeError>;
    fn end_command_list(&self, command_list: vk::CommandBuffer) -> Result<(), NativeError>;
    fn free_command_list(&self, queue: u32, command_list: vk::CommandBuffer);
    fn submit(&self, queue: u32, info: &SubmitInfo) -> Result<(), NativeError>;

    fn cmd_pipeline_barrier(&self, command_list: vk::CommandBuffer, barriers: &BarrierBuilder);
    fn cmd_copy_buffer(
        &self,
        command_list: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[BufferCopyRegion],
    );
    fn cmd_copy_buffer_to_image(
        &self,
        command_list: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[BufferImageCopyRegion],
    );
    fn cmd_build_acceleration_structure(
        &self,
        command_list: vk::CommandBuffer,
        info: &AsBuildInfo,
    );
    fn cmd_begin_rendering(&self, command_list: vk::CommandBuffer, info: &RenderingInfo);
    fn cmd_end_rendering(&self, command_list: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        command_list: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_sets(
        &self,
        command_list: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn cmd_push_constants(
        &self,
        command_list: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_bind_vertex_buffers(
        &self,
        command_list: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[(vk::Buffer, u64)],
    );
    fn cmd_bind_index_buffer(
        &self,
        command_list: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    );
    fn cmd_draw(
        &self,
        command_list: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        command_list: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, command_list: vk::CommandBuffer, groups: [u32; 3]);
    fn cmd_trace_rays(&self, command_list: vk::CommandBuffer, extent: [u32; 3]);
    fn cmd_write_timestamp(
        &self,
        command_list: vk::CommandBuffer,
        stage: vk::PipelineStageFlags2,
        pool: vk::QueryPool,
        query: u32,
    );

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout, NativeError>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
    ) -> Result<vk::PipelineLayout, NativeError>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_pipeline(
        &self,
        desc: &PipelineDesc,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline, NativeError>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, NativeError>;
    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);
    fn free_descriptor_set(&self, set: vk::DescriptorSet);

    fn create_timestamp_pool(&self, count: u32) -> Result<vk::QueryPool, NativeError>;
    ///Host side reset of `count` queries starting at `first`.
    fn reset_query_pool(&self, pool: vk::QueryPool, first: u32, count: u32);
    fn destroy_query_pool(&self, pool: vk::QueryPool);
    ///Raw timestamp values. `None` for queries that have no result (yet).
    fn timestamp_results(
        &self,
        pool: vk::QueryPool,
        count: u32,
    ) -> Result<Vec<Option<u64>>, NativeError>;
    ///Nanoseconds per timestamp tick.
    fn timestamp_period(&self) -> f32;

    ///Creates a swapchain. If `old` is set the new swapchain replaces it. The old one still has
    /// to be destroyed by the caller.
    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: Option<vk::SwapchainKHR>,
    ) -> Result<(vk::SwapchainKHR, Vec<vk::Image>), NativeError>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    ///Acquires the next image, signaling the binary semaphore `signal` once it can be used.
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> Result<(u32, bool), NativeError>;
    ///Presents `index` on `queue` after `wait` was signaled. Returns true if the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: u32,
        swapchain: vk::SwapchainKHR,
        index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool, NativeError>;

    fn wait_idle(&self) -> Result<(), NativeError>;
}
