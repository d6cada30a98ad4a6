use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::{Device, NameObjectError};

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffers: {0}")]
    Vulkan(vk::Result),
}

/// An owned command pool whose buffers can be reset individually.
///
/// The pool is created with `RESET_COMMAND_BUFFER` so each allocated buffer
/// can be re-recorded per frame without resetting the whole pool.
///
/// Allocated buffers are raw handles owned by the pool: destroying the pool
/// implicitly frees every one of them, which is exactly the teardown the
/// renderer relies on. The caller must not use any allocated buffer after
/// the pool is dropped.
pub struct CommandPool {
    parent: Arc<Device>,
    handle: vk::CommandPool,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    /// Create a resettable command pool for the given queue family.
    ///
    /// `name` is an optional debug label applied via `VK_EXT_debug_utils`
    /// when the extension is available. Naming failures are logged as
    /// warnings and do not cause the call to fail.
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        //SAFETY: create_info uses a valid queue family index for this device
        let handle = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;
        tracing::info!("Created command pool {:?}", handle);

        //SAFETY: handle is a valid command pool created from device
        match unsafe { device.set_object_name_str(handle, name) } {
            Ok(()) | Err(NameObjectError::DebugUtilsNotEnabled) => {}
            Err(e) => tracing::warn!("Failed to name command pool {:?}: {e}", handle),
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Allocate `count` primary command buffers from this pool.
    ///
    /// The returned handles stay owned by the pool and are freed implicitly
    /// when it is destroyed.
    pub fn allocate_primary(
        &self,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>, AllocateCommandBufferError> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        //SAFETY: allocate_info references this pool, which is valid and only
        //touched from the owning thread
        unsafe { self.parent.allocate_raw_command_buffers(&allocate_info) }
            .map_err(AllocateCommandBufferError::Vulkan)
    }

    /// Free specific buffers back to the pool before its destruction.
    ///
    /// # Safety
    /// Every handle must come from this pool and must not be pending
    /// execution.
    pub unsafe fn free(&self, buffers: &[vk::CommandBuffer]) {
        //SAFETY: caller guarantees provenance and idle state
        unsafe { self.parent.free_raw_command_buffers(self.handle, buffers) };
    }

    pub fn raw_handle(&self) -> vk::CommandPool {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.handle);
        //SAFETY: pool was created from parent; none of its buffers are
        //pending (owner sequences this after an idle wait), and destroying
        //the pool implicitly frees all of them
        unsafe { self.parent.destroy_raw_command_pool(self.handle) };
    }
}
