use marpii_native::{NativeDevice, NativeError, ash::vk, desc::SwapchainDesc};

use super::res_states::ImageKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SwapchainState {
    ///Never acquired, or the last presented image was consumed.
    Idle,
    ///An image is acquired and can be used by commands.
    Acquired {
        index: u32,
        semaphore: vk::Semaphore,
    },
    ///Present is recorded, but the batch was not executed yet.
    PresentRecorded { index: u32, semaphore: vk::Semaphore },
}

pub(crate) struct ResSwapchain {
    pub(crate) swapchain: vk::SwapchainKHR,
    pub(crate) desc: SwapchainDesc,
    pub(crate) images: Vec<ImageKey>,
    ///Ring of semaphores signaled by acquire. One more than images, so acquire never reuses a semaphore
    /// that is still waited on.
    pub(crate) acquire_semaphores: Vec<vk::Semaphore>,
    pub(crate) next_acquire_semaphore: usize,
    ///Signaled by the submission that precedes present, one per image.
    pub(crate) present_semaphores: Vec<vk::Semaphore>,
    pub(crate) state: SwapchainState,
    ///Set whenever the native side reported a suboptimal or out of date swapchain.
    pub(crate) needs_recreation: bool,
    pub(crate) last_use: Option<u64>,
}

impl ResSwapchain {
    ///Creates the native semaphores for a swapchain with `image_count` images.
    pub(crate) fn create_semaphores(
        device: &dyn NativeDevice,
        image_count: usize,
    ) -> Result<(Vec<vk::Semaphore>, Vec<vk::Semaphore>), NativeError> {
        let mut acquire = Vec::with_capacity(image_count + 1);
        for _ in 0..(image_count + 1) {
            acquire.push(device.create_binary_semaphore()?);
        }
        let mut present = Vec::with_capacity(image_count);
        for _ in 0..image_count {
            present.push(device.create_binary_semaphore()?);
        }
        Ok((acquire, present))
    }

    pub(crate) fn next_semaphore(&mut self) -> vk::Semaphore {
        let sem = self.acquire_semaphores[self.next_acquire_semaphore];
        self.next_acquire_semaphore =
            (self.next_acquire_semaphore + 1) % self.acquire_semaphores.len();
        sem
    }

    ///Image key, index and acquire semaphore of the currently acquired image.
    pub(crate) fn acquired(&self) -> Option<(ImageKey, u32, vk::Semaphore)> {
        if let SwapchainState::Acquired { index, semaphore } = self.state {
            self.images.get(index as usize).map(|k| (*k, index, semaphore))
        } else {
            None
        }
    }

    pub(crate) fn destroy_semaphores(&mut self, device: &dyn NativeDevice) {
        for sem in self
            .acquire_semaphores
            .drain(..)
            .chain(self.present_semaphores.drain(..))
        {
            device.destroy_semaphore(sem);
        }
    }
}
