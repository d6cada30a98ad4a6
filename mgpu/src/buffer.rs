//! GPU buffer + device memory pairs and the synchronous upload protocol.
//!
//! [`MemBuffer`] owns a `VkBuffer` and the `VkDeviceMemory` backing it.
//! Memory-type selection is a linear scan for the first type that the
//! buffer's requirement bitmask permits *and* that exposes every requested
//! property flag; no match is fatal for the allocation.
//!
//! Uploads go through [`upload_blocking`]: map + copy + unmap on the host
//! buffer, then a one-time-submit buffer-to-buffer copy on the graphics
//! queue followed by a full device-idle wait. Nothing about the transfer is
//! pipelined with frame rendering.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),

    #[error(
        "No memory type satisfies both the requirement bitmask {type_bits:#b} \
         and the requested properties {desired:?}"
    )]
    NoSuitableMemoryType {
        type_bits: u32,
        desired: vk::MemoryPropertyFlags,
    },

    #[error("Vulkan error allocating device memory: {0}")]
    AllocateMemory(vk::Result),

    #[error("Vulkan error binding buffer memory: {0}")]
    BindMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum WriteBufferError {
    #[error("Data size ({data_bytes} bytes) exceeds buffer size ({buffer_bytes} bytes)")]
    DataTooLarge {
        data_bytes: usize,
        buffer_bytes: vk::DeviceSize,
    },

    #[error("Vulkan error mapping memory: {0}")]
    MapMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum UploadBufferError {
    #[error(
        "Source buffer ({src_bytes} bytes) exceeds destination buffer \
         ({dst_bytes} bytes)"
    )]
    SourceTooLarge {
        src_bytes: vk::DeviceSize,
        dst_bytes: vk::DeviceSize,
    },

    #[error("Vulkan error recording the upload: {0}")]
    Record(vk::Result),

    #[error("Vulkan error submitting the upload: {0}")]
    Submit(vk::Result),

    #[error("Vulkan error waiting for the upload to complete: {0}")]
    WaitIdle(vk::Result),
}

/// First memory-type index that is permitted by `type_bits` and exposes
/// every flag in `desired`.
///
/// Both conditions are mandatory: the hardware's requirement bitmask says
/// which types can back the buffer at all, and `desired` says which
/// properties the caller's access pattern needs. `None` means the device
/// cannot satisfy the request.
pub fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    desired: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_properties.memory_types[..memory_properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(i, memory_type)| {
            type_bits & (1 << i) != 0 && memory_type.property_flags.contains(desired)
        })
        .map(|(i, _)| i as u32)
}

fn check_write_bounds(
    data_bytes: usize,
    buffer_bytes: vk::DeviceSize,
) -> Result<(), WriteBufferError> {
    if data_bytes as vk::DeviceSize > buffer_bytes {
        return Err(WriteBufferError::DataTooLarge {
            data_bytes,
            buffer_bytes,
        });
    }
    Ok(())
}

fn check_upload_bounds(
    src_bytes: vk::DeviceSize,
    dst_bytes: vk::DeviceSize,
) -> Result<(), UploadBufferError> {
    if src_bytes > dst_bytes {
        return Err(UploadBufferError::SourceTooLarge {
            src_bytes,
            dst_bytes,
        });
    }
    Ok(())
}

/// A buffer paired with its exclusive device-memory allocation.
///
/// Records the requested size, the (possibly alignment-enlarged) allocated
/// size, and the memory-type index that was selected. Memory is bound at
/// offset zero. On drop the memory is freed and the buffer destroyed.
pub struct MemBuffer {
    parent: Arc<Device>,
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    allocated_size: vk::DeviceSize,
    memory_type_index: u32,
}

impl std::fmt::Debug for MemBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("allocated_size", &self.allocated_size)
            .field("memory_type_index", &self.memory_type_index)
            .finish_non_exhaustive()
    }
}

impl MemBuffer {
    /// Create a buffer of `size` bytes and back it with memory satisfying
    /// `desired_properties`.
    ///
    /// Failure to find a suitable memory type is unrecoverable for this
    /// allocation: the error is logged at error level, the buffer is
    /// destroyed, and nothing is bound.
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        desired_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self, CreateBufferError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        //SAFETY: create_info is fully initialised and has no borrowed data
        let handle = unsafe { device.create_raw_buffer(&create_info) }
            .map_err(CreateBufferError::CreateBuffer)?;

        //SAFETY: handle is a valid buffer created from this device
        let requirements = unsafe { device.get_raw_buffer_memory_requirements(handle) };

        let memory_type_index = match find_memory_type_index(
            device.memory_properties(),
            requirements.memory_type_bits,
            desired_properties,
        ) {
            Some(index) => index,
            None => {
                tracing::error!(
                    "No suitable memory type for buffer (bits {:#b}, wanted {:?})",
                    requirements.memory_type_bits,
                    desired_properties
                );
                //SAFETY: handle was created above and is not bound to memory
                unsafe { device.destroy_raw_buffer(handle) };
                return Err(CreateBufferError::NoSuitableMemoryType {
                    type_bits: requirements.memory_type_bits,
                    desired: desired_properties,
                });
            }
        };

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        //SAFETY: allocate_info names a memory type index valid for this
        //device (selected from its own memory properties)
        let memory = match unsafe { device.allocate_raw_memory(&allocate_info) } {
            Ok(memory) => memory,
            Err(e) => {
                //SAFETY: handle was created above and is not bound to memory
                unsafe { device.destroy_raw_buffer(handle) };
                return Err(CreateBufferError::AllocateMemory(e));
            }
        };

        //SAFETY: handle and memory are valid, unbound, and belong to this
        //device; the allocation covers the buffer's full requirement
        if let Err(e) = unsafe { device.bind_raw_buffer_memory(handle, memory, 0) } {
            //SAFETY: memory was allocated above and is unmapped
            unsafe { device.free_raw_memory(memory) };
            //SAFETY: handle was created above
            unsafe { device.destroy_raw_buffer(handle) };
            return Err(CreateBufferError::BindMemory(e));
        }

        tracing::debug!(
            "Created buffer {:?} ({} bytes requested, {} allocated, type {})",
            handle,
            size,
            requirements.size,
            memory_type_index
        );

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            memory,
            size,
            allocated_size: requirements.size,
            memory_type_index,
        })
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.handle
    }

    /// The size the caller asked for, not the aligned allocation size.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// The driver's (alignment-adjusted) allocation size, `>= size()`.
    pub fn allocated_size(&self) -> vk::DeviceSize {
        self.allocated_size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// Copy `data` into this buffer through a map/copy/unmap cycle.
    ///
    /// The buffer must have been created with host-visible (and, for this
    /// protocol, host-coherent) memory; the driver rejects the mapping
    /// otherwise.
    pub fn write_pod<T: Pod>(&mut self, data: &[T]) -> Result<(), WriteBufferError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        check_write_bounds(bytes.len(), self.size)?;

        //SAFETY: memory belongs to this device, is not currently mapped (we
        //hold &mut self and never leave it mapped), and the range is
        //in-bounds for the allocation
        let mapped = unsafe { self.parent.map_raw_memory(self.memory, 0, self.size) }
            .map_err(WriteBufferError::MapMemory)?;

        //SAFETY: mapped points to at least self.size bytes of host-visible
        //memory and bytes.len() was bounds-checked above
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.cast::<u8>(), bytes.len());
        }

        //SAFETY: the memory was mapped just above and the pointer is not
        //used past this point
        unsafe { self.parent.unmap_raw_memory(self.memory) };

        Ok(())
    }
}

impl Drop for MemBuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        //SAFETY: memory was allocated by parent for this buffer; no GPU work
        //references it (owner sequences drops after idle waits)
        unsafe { self.parent.free_raw_memory(self.memory) };
        //SAFETY: handle was created by parent and is owned by this wrapper
        unsafe { self.parent.destroy_raw_buffer(self.handle) };
    }
}

/// Transfer the full contents of `src` into `dst` and block until the
/// device is idle.
///
/// Records `command_buffer` as one-time-submit with a single
/// buffer-to-buffer copy of `src.size()` bytes at offset zero, submits it
/// on the graphics queue with no semaphores, and waits for the device to
/// drain. The calling thread stalls for the whole transfer.
///
/// # Safety
/// - `command_buffer` must be derived from `device`, not pending execution,
///   and either in the initial state or allocated from a pool created with
///   `RESET_COMMAND_BUFFER` (begin then resets it implicitly). Nothing else
///   may use it until this call returns.
/// - `src` must have `TRANSFER_SRC` usage and `dst` `TRANSFER_DST` usage.
pub unsafe fn upload_blocking(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    src: &MemBuffer,
    dst: &MemBuffer,
) -> Result<(), UploadBufferError> {
    check_upload_bounds(src.size(), dst.size())?;

    let begin_info = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    //SAFETY: caller guarantees the buffer is in the initial state
    unsafe { device.begin_raw_command_buffer(command_buffer, &begin_info) }
        .map_err(UploadBufferError::Record)?;

    let copy_region = vk::BufferCopy::default()
        .src_offset(0)
        .dst_offset(0)
        .size(src.size());
    //SAFETY: the buffer is recording; src and dst are valid buffers from
    //this device and the region was bounds-checked above
    unsafe {
        device.cmd_copy_buffer(
            command_buffer,
            src.raw_buffer(),
            dst.raw_buffer(),
            std::slice::from_ref(&copy_region),
        )
    };

    //SAFETY: the buffer is in the recording state
    unsafe { device.end_raw_command_buffer(command_buffer) }.map_err(UploadBufferError::Record)?;

    let submit_info =
        vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&command_buffer));
    //SAFETY: command_buffer was just recorded and is executable; no
    //semaphores or fences are referenced
    unsafe { device.submit_graphics(std::slice::from_ref(&submit_info), vk::Fence::null()) }
        .map_err(UploadBufferError::Submit)?;

    device.wait_idle().map_err(UploadBufferError::WaitIdle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(
        types: &[vk::MemoryPropertyFlags],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        props
    }

    #[test]
    fn picks_first_type_satisfying_bitmask_and_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let index = find_memory_type_index(
            &props,
            0b110,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert_eq!(index, Some(1));
    }

    #[test]
    fn bitmask_excludes_otherwise_matching_types() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        // Type 0 matches the flags but the bitmask only permits type 1.
        let index =
            find_memory_type_index(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert_eq!(index, Some(1));
    }

    #[test]
    fn every_requested_flag_must_be_present() {
        // HOST_VISIBLE alone must not satisfy HOST_VISIBLE|HOST_COHERENT.
        let props = memory_properties(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);

        let index = find_memory_type_index(
            &props,
            0b1,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert_eq!(index, None);
    }

    #[test]
    fn device_local_request_fails_on_host_only_device() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let index =
            find_memory_type_index(&props, 0b1, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert_eq!(index, None);
    }

    #[test]
    fn oversized_writes_are_rejected_before_mapping() {
        let result = check_write_bounds(64, 16);
        assert!(matches!(
            result,
            Err(WriteBufferError::DataTooLarge {
                data_bytes: 64,
                buffer_bytes: 16,
            })
        ));
        assert!(check_write_bounds(16, 16).is_ok());
    }

    #[test]
    fn oversized_uploads_are_rejected_before_recording() {
        let result = check_upload_bounds(32, 16);
        assert!(matches!(
            result,
            Err(UploadBufferError::SourceTooLarge {
                src_bytes: 32,
                dst_bytes: 16,
            })
        ));
        assert!(check_upload_bounds(16, 32).is_ok());
    }

    #[test]
    fn types_beyond_the_reported_count_are_ignored() {
        let mut props = memory_properties(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        // A stale entry past memory_type_count must never be selected.
        props.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };

        let index =
            find_memory_type_index(&props, !0, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert_eq!(index, None);
    }
}
