use ash::vk;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,
    #[error("Swapchain is suboptimal")]
    SwapchainSuboptimal,
    #[error("Timeout while waiting for {0} semaphore(s)")]
    Timeout(usize),
    #[error("Unknown handle 0x{0:x}")]
    UnknownHandle(u64),
    #[error("Queue {0} does not exist")]
    NoSuchQueue(u32),
    #[error("Other error: {0}")]
    Other(String),
}

impl NativeError {
    ///True for errors the swapchain can recover from by being recreated.
    pub fn is_swapchain_transient(&self) -> bool {
        matches!(
            self,
            NativeError::SwapchainOutOfDate
                | NativeError::SwapchainSuboptimal
                | NativeError::VkError(vk::Result::ERROR_OUT_OF_DATE_KHR)
                | NativeError::VkError(vk::Result::SUBOPTIMAL_KHR)
        )
    }
}
