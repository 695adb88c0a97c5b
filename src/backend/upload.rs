// Buffer creation and the staged-upload protocol
//
// Payloads travel host-visible staging buffer -> one-shot copy command ->
// device-local buffer. Transfers happen at startup, so the copy waits for
// queue idle instead of overlapping with rendering.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::error::{RenderError, RenderResult};
use super::DeviceContext;

/// First memory type whose bit is set in `type_filter` and whose property
/// flags are a superset of `required`. No scoring; first match wins.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> RenderResult<u32> {
    for index in 0..memory_properties.memory_type_count {
        let type_matches = type_filter & (1 << index) != 0;
        let property_matches = memory_properties.memory_types[index as usize]
            .property_flags
            .contains(required);
        if type_matches && property_matches {
            return Ok(index);
        }
    }
    Err(RenderError::NoSuitableMemoryType {
        type_filter,
        required,
    })
}

/// A buffer handle plus its backing allocation, released together in
/// reverse-creation order on drop.
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    device: Arc<DeviceContext>,
}

impl DeviceBuffer {
    pub fn new(
        device: Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None)? };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let memory_type_index = match find_memory_type(
            &device.memory_properties,
            requirements.memory_type_bits,
            properties,
        ) {
            Ok(index) => index,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        unsafe { device.device.bind_buffer_memory(buffer, memory, 0)? };

        Ok(Self {
            buffer,
            memory,
            size,
            device,
        })
    }

    /// Copy `bytes` into a host-visible, host-coherent buffer. Coherence
    /// makes an explicit flush unnecessary.
    pub fn write_bytes(&self, bytes: &[u8]) -> RenderResult<()> {
        debug_assert!(bytes.len() as vk::DeviceSize <= self.size);
        unsafe {
            let ptr = self.device.device.map_memory(
                self.memory,
                0,
                bytes.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )? as *mut u8;
            ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Allocate a one-time command buffer, record `record` into it, submit it
/// on the graphics queue, and wait for the queue to drain before freeing.
pub(crate) fn one_shot_command(
    device: &DeviceContext,
    command_pool: vk::CommandPool,
    record: impl FnOnce(vk::CommandBuffer),
) -> RenderResult<()> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info)? }[0];

    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    let result = (|| -> RenderResult<()> {
        unsafe {
            device.device.begin_command_buffer(command_buffer, &begin_info)?;
            record(command_buffer);
            device.device.end_command_buffer(command_buffer)?;

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            device
                .device
                .queue_submit(device.graphics_queue, &[submit_info.build()], vk::Fence::null())?;
            device.device.queue_wait_idle(device.graphics_queue)?;
        }
        Ok(())
    })();

    unsafe {
        device
            .device
            .free_command_buffers(command_pool, &[command_buffer]);
    }
    result
}

/// The staged-upload steps, separated from their ordering so the protocol
/// can run against a mock in tests.
pub trait TransferOps {
    type Buffer;
    type Error;

    /// Host-visible, host-coherent scratch buffer.
    fn create_staging(&mut self, size: u64) -> Result<Self::Buffer, Self::Error>;
    fn write_staging(&mut self, staging: &mut Self::Buffer, bytes: &[u8])
        -> Result<(), Self::Error>;
    /// Device-local destination with the final usage flags.
    fn create_device_local(&mut self, size: u64) -> Result<Self::Buffer, Self::Error>;
    /// One-shot copy; returns only after the transfer has completed.
    fn copy_and_wait(
        &mut self,
        src: &Self::Buffer,
        dst: &mut Self::Buffer,
        size: u64,
    ) -> Result<(), Self::Error>;
    fn destroy(&mut self, buffer: Self::Buffer);
}

/// Move `payload` into device-local memory: stage, copy, wait, then destroy
/// the staging buffer exactly once.
pub fn stage_and_upload<T: TransferOps>(
    ops: &mut T,
    payload: &[u8],
) -> Result<T::Buffer, T::Error> {
    let size = payload.len() as u64;

    let mut staging = ops.create_staging(size)?;
    ops.write_staging(&mut staging, payload)?;

    let mut destination = ops.create_device_local(size)?;
    ops.copy_and_wait(&staging, &mut destination, size)?;

    ops.destroy(staging);
    Ok(destination)
}

/// The concrete transfer backend over ash. `usage` is the destination
/// buffer's final usage (vertex, index, ...); TRANSFER_SRC/DST are added
/// by the protocol steps.
pub struct AshTransfer<'a> {
    pub device: &'a Arc<DeviceContext>,
    pub command_pool: vk::CommandPool,
    pub usage: vk::BufferUsageFlags,
}

impl TransferOps for AshTransfer<'_> {
    type Buffer = DeviceBuffer;
    type Error = RenderError;

    fn create_staging(&mut self, size: u64) -> RenderResult<DeviceBuffer> {
        DeviceBuffer::new(
            self.device.clone(),
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    fn write_staging(&mut self, staging: &mut DeviceBuffer, bytes: &[u8]) -> RenderResult<()> {
        staging.write_bytes(bytes)
    }

    fn create_device_local(&mut self, size: u64) -> RenderResult<DeviceBuffer> {
        DeviceBuffer::new(
            self.device.clone(),
            size,
            vk::BufferUsageFlags::TRANSFER_DST | self.usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
    }

    fn copy_and_wait(
        &mut self,
        src: &DeviceBuffer,
        dst: &mut DeviceBuffer,
        size: u64,
    ) -> RenderResult<()> {
        let region = vk::BufferCopy::builder().size(size).build();
        let (src, dst) = (src.buffer, dst.buffer);
        one_shot_command(self.device, self.command_pool, |cmd| unsafe {
            self.device.device.cmd_copy_buffer(cmd, src, dst, &[region]);
        })
    }

    fn destroy(&mut self, buffer: DeviceBuffer) {
        drop(buffer);
    }
}

/// Upload a slice of plain-old-data records into a device-local buffer.
pub fn upload_buffer<T: bytemuck::Pod>(
    device: &Arc<DeviceContext>,
    command_pool: vk::CommandPool,
    data: &[T],
    usage: vk::BufferUsageFlags,
) -> Result<DeviceBuffer> {
    let mut transfer = AshTransfer {
        device,
        command_pool,
        usage,
    };
    stage_and_upload(&mut transfer, bytemuck::cast_slice(data))
        .context("Failed to upload buffer via staging")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &property_flags) in flags.iter().enumerate() {
            properties.memory_types[i].property_flags = property_flags;
        }
        properties
    }

    #[test]
    fn find_memory_type_returns_first_match() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        // Types 1 and 2 both qualify; the first wins.
        let index = find_memory_type(
            &properties,
            0b111,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )
        .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn find_memory_type_requires_superset_of_flags() {
        let properties = memory_properties(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);

        // HOST_VISIBLE alone is not a superset of HOST_VISIBLE|HOST_COHERENT.
        let result = find_memory_type(
            &properties,
            0b1,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert!(matches!(
            result,
            Err(RenderError::NoSuitableMemoryType { .. })
        ));
    }

    #[test]
    fn find_memory_type_respects_the_type_filter() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        // Type 0 qualifies by flags but is excluded by the filter.
        let index =
            find_memory_type(&properties, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(index, 1);

        let none = find_memory_type(&properties, 0b100, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert!(matches!(
            none,
            Err(RenderError::NoSuitableMemoryType { .. })
        ));
    }

    // --- mock memory backend for the staged-upload protocol ---

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Step {
        CreateStaging,
        Write,
        CreateLocal,
        Copy,
        DestroyStaging,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Kind {
        Staging,
        DeviceLocal,
    }

    struct MockBuffer {
        id: usize,
        kind: Kind,
        bytes: Vec<u8>,
    }

    #[derive(Default)]
    struct MockMemory {
        next_id: usize,
        steps: Vec<Step>,
        destroyed: Vec<usize>,
        live: Vec<usize>,
    }

    impl MockMemory {
        fn allocate(&mut self, kind: Kind, size: u64) -> MockBuffer {
            let id = self.next_id;
            self.next_id += 1;
            self.live.push(id);
            MockBuffer {
                id,
                kind,
                bytes: vec![0; size as usize],
            }
        }
    }

    impl TransferOps for MockMemory {
        type Buffer = MockBuffer;
        type Error = ();

        fn create_staging(&mut self, size: u64) -> Result<MockBuffer, ()> {
            self.steps.push(Step::CreateStaging);
            Ok(self.allocate(Kind::Staging, size))
        }

        fn write_staging(&mut self, staging: &mut MockBuffer, bytes: &[u8]) -> Result<(), ()> {
            self.steps.push(Step::Write);
            staging.bytes.copy_from_slice(bytes);
            Ok(())
        }

        fn create_device_local(&mut self, size: u64) -> Result<MockBuffer, ()> {
            self.steps.push(Step::CreateLocal);
            Ok(self.allocate(Kind::DeviceLocal, size))
        }

        fn copy_and_wait(
            &mut self,
            src: &MockBuffer,
            dst: &mut MockBuffer,
            size: u64,
        ) -> Result<(), ()> {
            self.steps.push(Step::Copy);
            dst.bytes[..size as usize].copy_from_slice(&src.bytes[..size as usize]);
            Ok(())
        }

        fn destroy(&mut self, buffer: MockBuffer) {
            if buffer.kind == Kind::Staging {
                self.steps.push(Step::DestroyStaging);
            }
            self.live.retain(|&id| id != buffer.id);
            self.destroyed.push(buffer.id);
        }
    }

    #[test]
    fn upload_round_trip_is_byte_identical() {
        let mut memory = MockMemory::default();
        let payload: Vec<u8> = (0..=255).collect();

        let uploaded = stage_and_upload(&mut memory, &payload).unwrap();
        assert_eq!(uploaded.kind, Kind::DeviceLocal);
        assert_eq!(uploaded.bytes, payload);
    }

    #[test]
    fn staging_buffer_is_destroyed_exactly_once_after_the_copy() {
        let mut memory = MockMemory::default();
        let uploaded = stage_and_upload(&mut memory, &[7u8; 64]).unwrap();

        assert_eq!(
            memory.steps,
            vec![
                Step::CreateStaging,
                Step::Write,
                Step::CreateLocal,
                Step::Copy,
                Step::DestroyStaging,
            ]
        );
        // Staging (id 0) destroyed once; only the destination survives.
        assert_eq!(memory.destroyed, vec![0]);
        assert_eq!(memory.live, vec![uploaded.id]);
    }
}
