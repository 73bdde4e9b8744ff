//! Typed device-memory wrapper (`spec.md` §4.4).
//!
//! Allocates either a device-only or host-visible `VkBuffer` + backing
//! `VkDeviceMemory`, and exposes the three transfer directions named in the
//! spec. The host-visible path maps the whole allocation once at
//! construction time and keeps the pointer for the lifetime of the buffer.

use ash::vk;
use tracing::trace;

use super::backend::Backend;
use super::memory::{checked_range, DType, MemoryUsage, QuantDescriptor};
use crate::utils::{CoreError, Result};

pub struct Buffer<'a> {
    backend: &'a Backend,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: usize,
    usage: MemoryUsage,
    mapped: Option<*mut u8>,
    dtype: DType,
    quant: Option<QuantDescriptor>,
}

// The mapped pointer is only ever dereferenced through `&self`/`&mut self`
// methods that hold no other aliases into it.
unsafe impl Send for Buffer<'_> {}
unsafe impl Sync for Buffer<'_> {}

impl<'a> Buffer<'a> {
    /// Allocate `bytes` of device memory with the given usage and element
    /// type.
    ///
    /// # Safety
    /// Issues raw Vulkan allocation calls against `backend`'s device.
    pub unsafe fn allocate(
        backend: &'a Backend,
        bytes: usize,
        usage: MemoryUsage,
        dtype: DType,
    ) -> Result<Self> {
        let device = backend.device();
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(bytes as u64)
            .usage(vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = device
            .create_buffer(&buffer_info, None)
            .map_err(|e| CoreError::Device(format!("vkCreateBuffer failed: {e}")))?;

        let requirements = device.get_buffer_memory_requirements(buffer);
        let mem_props = backend
            .instance_memory_properties();
        let desired_flags = match usage {
            MemoryUsage::DeviceOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryUsage::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        let memory_type_index = find_memory_type(&mem_props, requirements.memory_type_bits, desired_flags)
            .ok_or_else(|| CoreError::Device("no suitable memory type for buffer".into()))?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = device
            .allocate_memory(&alloc_info, None)
            .map_err(|e| CoreError::Device(format!("vkAllocateMemory failed: {e}")))?;
        device
            .bind_buffer_memory(buffer, memory, 0)
            .map_err(|e| CoreError::Device(format!("vkBindBufferMemory failed: {e}")))?;

        let mapped = match usage {
            MemoryUsage::HostVisible => Some(
                device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(|e| CoreError::Device(format!("vkMapMemory failed: {e}")))? as *mut u8,
            ),
            MemoryUsage::DeviceOnly => None,
        };

        Ok(Self {
            backend,
            buffer,
            memory,
            size: bytes,
            usage,
            mapped,
            dtype,
            quant: None,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn usage(&self) -> MemoryUsage {
        self.usage
    }

    pub fn quant(&self) -> Option<&QuantDescriptor> {
        self.quant.as_ref()
    }

    pub fn set_quant(&mut self, quant: QuantDescriptor) {
        self.quant = Some(quant);
    }

    /// Host-visible mapped address, if this buffer was allocated
    /// `HostVisible`.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped
    }

    /// Copy `data` into this buffer from offset 0. For a host-visible
    /// buffer this is a `memcpy` into the mapped region; for device-only
    /// buffers a staging buffer + command-buffer copy would be required —
    /// not implemented here since the block scheduler only ever uploads
    /// weights through [`crate::weights::loader`]'s staged path.
    ///
    /// # Safety
    /// `data.len()` must not exceed `self.size()`.
    pub unsafe fn copy_from_host(&self, data: &[u8]) -> Result<()> {
        let range = checked_range(0, data.len(), self.size)?;
        match self.mapped {
            Some(ptr) => {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(range.start), data.len());
                Ok(())
            }
            None => Err(CoreError::Device(
                "copy_from_host requires a host-visible buffer".into(),
            )),
        }
    }

    /// Allocate a `DeviceOnly` buffer of `data.len()` bytes and fill it with
    /// `data` via a `HostVisible` staging buffer and a one-shot command
    /// buffer copy (`spec.md` §4.8 `load_tensor`: "allocate a staging host
    /// buffer... copy-to-device").
    ///
    /// # Safety
    /// Issues raw Vulkan allocation, command-recording and submission calls
    /// against `backend`'s device and queue.
    pub unsafe fn upload_staged(backend: &'a Backend, data: &[u8], dtype: DType) -> Result<Self> {
        let dest = Self::allocate(backend, data.len(), MemoryUsage::DeviceOnly, dtype)?;
        if data.is_empty() {
            return Ok(dest);
        }
        let staging = Self::allocate(backend, data.len(), MemoryUsage::HostVisible, dtype)?;
        staging.copy_from_host(data)?;

        let device = backend.device();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(backend.command_pool())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = device
            .allocate_command_buffers(&alloc_info)
            .map_err(|e| CoreError::Device(format!("allocate_command_buffers failed: {e}")))?[0];

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(|e| CoreError::Device(format!("begin_command_buffer failed: {e}")))?;
        let region = vk::BufferCopy::builder().size(data.len() as u64).build();
        device.cmd_copy_buffer(cmd, staging.handle(), dest.handle(), &[region]);
        device
            .end_command_buffer(cmd)
            .map_err(|e| CoreError::Device(format!("end_command_buffer failed: {e}")))?;

        let cmds = [cmd];
        let submit = vk::SubmitInfo::builder().command_buffers(&cmds).build();
        device
            .queue_submit(backend.queue(), &[submit], vk::Fence::null())
            .map_err(|e| CoreError::Device(format!("queue_submit failed: {e}")))?;
        device
            .queue_wait_idle(backend.queue())
            .map_err(|e| CoreError::Device(format!("queue_wait_idle failed: {e}")))?;
        device.free_command_buffers(backend.command_pool(), &cmds);

        Ok(dest)
    }

    /// Copy the full buffer to `out`.
    ///
    /// # Safety
    /// `out.len()` must equal `self.size()`.
    pub unsafe fn copy_to_host(&self, out: &mut [u8]) -> Result<()> {
        self.copy_to_host_offset(out, 0)
    }

    /// Copy `out.len()` bytes starting at `offset` to `out`. Bounds-checked:
    /// `offset + out.len() <= capacity`.
    ///
    /// # Safety
    /// The mapped region must still be valid (buffer not yet dropped).
    pub unsafe fn copy_to_host_offset(&self, out: &mut [u8], offset: usize) -> Result<()> {
        let range = checked_range(offset, out.len(), self.size)?;
        match self.mapped {
            Some(ptr) => {
                std::ptr::copy_nonoverlapping(ptr.add(range.start), out.as_mut_ptr(), out.len());
                Ok(())
            }
            None => Err(CoreError::Device(
                "copy_to_host requires a host-visible buffer".into(),
            )),
        }
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        trace!(bytes = self.size, "releasing device buffer");
        unsafe {
            let device = self.backend.device();
            if self.mapped.is_some() {
                device.unmap_memory(self.memory);
            }
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    desired: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        let supported = (type_bits & (1 << i)) != 0;
        let has_flags = props.memory_types[i as usize].property_flags.contains(desired);
        supported && has_flags
    })
}

#[cfg(test)]
mod tests {
    use super::super::memory::checked_range;

    // Buffer itself requires a live Vulkan device; its bounds-checking
    // contract (the part `spec.md` §8 actually tests: "copy-to-host-at-offset
    // with offset + size > capacity returns an error") is exercised directly
    // against `checked_range`, which `copy_to_host_offset` delegates to.
    #[test]
    fn offset_copy_past_capacity_is_rejected() {
        assert!(checked_range(100, 50, 128).is_err());
        assert!(checked_range(78, 50, 128).is_ok());
    }
}
