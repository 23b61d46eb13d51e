//! # MarpII-Batch
//!
//! Deferred multi-queue command submission on top of [marpii_native].
//!
//! Work is recorded as high level commands (copies, acceleration structure builds, render passes, dispatches,
//! ray tracing, presents) on one of the device's queues. Recording never touches the device. Once
//! [execute_all](Engine::execute_all) is called the whole batch is scheduled at once:
//!
//! - every resource access is compared with the previous access of the same (sub)resource. Pipeline barriers,
//!   image layout transitions and queue family ownership transfers are inserted where needed.
//! - accesses that cross queues become timeline semaphore waits. Each queue owns one timeline semaphore, waits
//!   that are implied by earlier waits are dropped.
//! - [dependency tokens](Engine::request_dependency) order work across queues explicitly. A token that is
//!   acquired but never released is reported as [SchedulingError] before anything is submitted.
//!
//! Resources are owned by the engine and referenced through reference counted handles. Dropping the last handle
//! schedules the native object for destruction once every batch that used it finished on the gpu.
//!
//! ```ignore
//! let mut engine = Engine::new(device, EngineConfig::default())?;
//! let buffer = engine.request_buffer(&BufDesc::storage(1024))?;
//! engine
//!     .queue_for(vk::QueueFlags::COMPUTE)?
//!     .dispatch(ShaderInput::new(pipeline).bind(0, 0, BoundResource::StorageBuffer(buffer)), [64, 1, 1])?;
//! let stats = engine.execute_all()?;
//! ```

mod batch;
mod cache;
mod command;
mod engine;
mod recorder;
mod resources;
mod timer;
mod track;

#[cfg(test)]
mod tests;

pub use marpii_native;
use marpii_native::NativeError;
use thiserror::Error;

pub use batch::{BatchStats, BlockedAcquire, QueueStats, SchedulingError};
pub use cache::ContextCache;
pub use command::{
    Attachment, AttachmentTarget, Binding, BoundResource, DrawCall, IndexBuffer, ShaderInput,
    VertexBuffer,
};
pub use engine::{Engine, EngineConfig};
pub use recorder::{QueueRecorder, RecordError};
pub use resources::{
    ResourceError,
    handle::{
        BlasHandle, BufferHandle, DependencyHandle, DescriptorArrayHandle, ImageHandle, ResHandle,
        SamplerHandle, SwapchainHandle, TlasHandle,
    },
    res_states::{
        AnyResKey, ArrayElement, AsKey, BufferKey, DependencyKey, DescriptorArrayKey, ImageKey,
        SamplerKey, SwapchainKey,
    },
};
pub use timer::TaskTiming;
pub use track::Guard;

///Top level error of the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Native error: {0}")]
    Native(#[from] NativeError),
    #[error("Recording error: {0}")]
    Record(#[from] RecordError),
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),
}

#[cfg(test)]
mod test {
    use super::*;
    use static_assertions::assert_impl_all;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(BatchError: Send, Sync);
        assert_impl_all!(RecordError: Send, Sync);
        assert_impl_all!(SchedulingError: Send, Sync);
        assert_impl_all!(ResourceError: Send, Sync);
        assert_impl_all!(Engine: Send, Sync);
        assert_impl_all!(BatchStats: Send, Sync);
    }
}
