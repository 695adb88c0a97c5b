// Per-frame synchronization primitives
//
// One slot per frame in flight: a CPU-wait fence plus the two semaphores
// that order acquire -> submit -> present on the GPU timeline.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::DeviceContext;

/// Synchronization objects for one frame-in-flight slot.
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
    device: Arc<DeviceContext>,
}

impl FrameSlot {
    pub fn new(device: Arc<DeviceContext>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Created signaled so the first wait on each slot passes.
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight: device.device.create_fence(&fence_info, None)?,
                device,
            })
        }
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight, None);
        }
    }
}
