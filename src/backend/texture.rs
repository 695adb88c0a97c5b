// Image creation, layout transitions, and texture upload
//
// Layout transitions use a fixed table keyed on the (old, new) pair; an
// unlisted pair is a programming error, not a runtime condition.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::error::{RenderError, RenderResult};
use super::upload::{find_memory_type, one_shot_command, DeviceBuffer};
use super::DeviceContext;

/// Access masks and pipeline stages for one layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// The fixed transition table. Supported pairs:
/// UNDEFINED -> TRANSFER_DST_OPTIMAL (before the staging copy) and
/// TRANSFER_DST_OPTIMAL -> SHADER_READ_ONLY_OPTIMAL (after it).
pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> RenderResult<BarrierMasks> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok(BarrierMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(BarrierMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        _ => Err(RenderError::UnsupportedTransition { old, new }),
    }
}

/// An image handle, its backing allocation, and its view.
pub struct DeviceImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    device: Arc<DeviceContext>,
}

impl DeviceImage {
    pub fn new(
        device: Arc<DeviceContext>,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None)? };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let memory_type_index = match find_memory_type(
            &device.memory_properties,
            requirements.memory_type_bits,
            properties,
        ) {
            Ok(index) => index,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { device.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e.into());
            }
        };

        unsafe { device.device.bind_image_memory(image, memory, 0)? };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(color_subresource_range());
        let view = unsafe { device.device.create_image_view(&view_info, None)? };

        Ok(Self {
            image,
            memory,
            view,
            format,
            device,
        })
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Issue a pipeline barrier moving `image` between layouts, using the
/// fixed transition table.
pub fn transition_image_layout(
    device: &DeviceContext,
    command_pool: vk::CommandPool,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> RenderResult<()> {
    let masks = transition_masks(old, new)?;

    one_shot_command(device, command_pool, |cmd| {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access)
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_subresource_range())
            .build();

        unsafe {
            device.device.cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    })
}

fn copy_buffer_to_image(
    device: &DeviceContext,
    command_pool: vk::CommandPool,
    buffer: vk::Buffer,
    image: vk::Image,
    width: u32,
    height: u32,
) -> RenderResult<()> {
    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .build();

    one_shot_command(device, command_pool, |cmd| unsafe {
        device.device.cmd_copy_buffer_to_image(
            cmd,
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    })
}

/// Stage decoded RGBA8 pixels into a device-local sampled image, with the
/// two layout transitions around the copy. The staging buffer is destroyed
/// as soon as the copy has completed.
pub fn upload_texture(
    device: &Arc<DeviceContext>,
    command_pool: vk::CommandPool,
    pixels: &[u8],
    width: u32,
    height: u32,
) -> Result<DeviceImage> {
    anyhow::ensure!(
        pixels.len() as u64 == u64::from(width) * u64::from(height) * 4,
        "texture payload is not {width}x{height} RGBA8"
    );

    let staging = DeviceBuffer::new(
        device.clone(),
        pixels.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    staging.write_bytes(pixels)?;

    let image = DeviceImage::new(
        device.clone(),
        width,
        height,
        vk::Format::R8G8B8A8_SRGB,
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    transition_image_layout(
        device,
        command_pool,
        image.image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    )?;
    copy_buffer_to_image(device, command_pool, staging.buffer, image.image, width, height)?;
    transition_image_layout(
        device,
        command_pool,
        image.image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    )?;

    drop(staging);
    log::info!("Uploaded {}x{} texture", width, height);
    Ok(image)
}
