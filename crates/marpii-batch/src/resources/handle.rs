use std::{fmt::Debug, hash::Hash, sync::Arc};

use crossbeam_channel::Sender;

use super::res_states::{
    AnyResKey, AsKey, BufferKey, DependencyKey, DescriptorArrayKey, ImageKey, SamplerKey,
    SwapchainKey,
};

struct HandleInner<K: Copy + Into<AnyResKey>> {
    key: K,
    //signals the engine once the last handle is dropped
    drop_signal: Sender<AnyResKey>,
}

impl<K: Copy + Into<AnyResKey>> Drop for HandleInner<K> {
    fn drop(&mut self) {
        let key: AnyResKey = self.key.into();
        if self.drop_signal.send(key).is_err() {
            #[cfg(feature = "logging")]
            log::trace!("Engine is gone, could not signal drop of {}", key);
        }
    }
}

///Shared ownership of an engine resource.
///
/// The resource stays alive as long as any clone of the handle exists, or any recorded command uses it.
/// Once the last handle is dropped the engine destroys the native object after all batches that used it
/// have finished on the GPU.
pub struct ResHandle<K: Copy + Into<AnyResKey>> {
    inner: Arc<HandleInner<K>>,
}

impl<K: Copy + Into<AnyResKey>> ResHandle<K> {
    pub(crate) fn new(key: K, drop_signal: Sender<AnyResKey>) -> Self {
        ResHandle {
            inner: Arc::new(HandleInner { key, drop_signal }),
        }
    }

    pub fn key(&self) -> K {
        self.inner.key
    }

    ///Number of handles currently referencing the resource, including the ones held by recorded commands.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<K: Copy + Into<AnyResKey>> Clone for ResHandle<K> {
    fn clone(&self) -> Self {
        ResHandle {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Copy + Into<AnyResKey> + PartialEq> PartialEq for ResHandle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}

impl<K: Copy + Into<AnyResKey> + Eq> Eq for ResHandle<K> {}

impl<K: Copy + Into<AnyResKey> + Hash> Hash for ResHandle<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.key.hash(state)
    }
}

impl<K: Copy + Into<AnyResKey> + Debug> Debug for ResHandle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ResHandle").field(&self.inner.key).finish()
    }
}

pub type BufferHandle = ResHandle<BufferKey>;
pub type ImageHandle = ResHandle<ImageKey>;
pub type SamplerHandle = ResHandle<SamplerKey>;
///Bottom level acceleration structure.
pub type BlasHandle = ResHandle<AsKey>;
///Top level acceleration structure.
pub type TlasHandle = ResHandle<AsKey>;
pub type DescriptorArrayHandle = ResHandle<DescriptorArrayKey>;
pub type DependencyHandle = ResHandle<DependencyKey>;
pub type SwapchainHandle = ResHandle<SwapchainKey>;
