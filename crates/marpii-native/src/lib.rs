//! # MarpII-Native
//!
//! The capability surface the batch engine consumes from a graphics API. Everything that touches the actual
//! device goes through [NativeDevice]. The engine never sees loader or driver details, only plain descriptions
//! and `ash` handles.
//!
//! The crate also ships a [HeadlessDevice](headless::HeadlessDevice). It records every call, emulates timeline
//! semaphores and validates handle lifetimes. It is used for testing and for dry runs of a schedule on machines
//! without a GPU.

pub use ash;

///Memory barrier collections and the [BarrierBuilder](barrier::BarrierBuilder).
pub mod barrier;
pub use barrier::{BarrierBuilder, BufferBarrier, ImageBarrier, MemoryBarrier, SubresourceRange};

///Plain descriptions of native objects and operations.
pub mod desc;

mod device;
pub use device::{NativeDevice, QueueInfo};

mod error;
pub use error::NativeError;

///Recording device without a GPU.
pub mod headless;
