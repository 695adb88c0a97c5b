// Error taxonomy for the rendering core
//
// Fatal initialization failures get their own variants so callers (and
// tests) can match on them. Everything coming back from the driver is
// carried as `Api` and treated as fatal unless a call site explicitly
// maps it (swapchain out-of-date/suboptimal only).

use ash::vk;
use thiserror::Error;

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no suitable GPU: need a discrete device with graphics and present queues, swapchain support, and at least one surface format and present mode")]
    NoSuitableDevice,

    #[error("no memory type matches filter {type_filter:#034b} with properties {required:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("vulkan call failed: {0}")]
    Api(#[from] vk::Result),
}
