use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::MemBuffer;
use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateDescriptorPoolError {
    #[error("Vulkan error creating descriptor pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateDescriptorSetsError {
    #[error("Vulkan error allocating descriptor sets: {0}")]
    Vulkan(vk::Result),
}

/// A descriptor pool sized for one uniform-buffer set per presentable
/// image.
///
/// Sets allocated from the pool are freed implicitly when the pool is
/// destroyed; they are never freed individually.
pub struct DescriptorPool {
    parent: Arc<Device>,
    handle: vk::DescriptorPool,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    /// Create a pool with capacity for `set_count` sets of one uniform
    /// buffer each.
    pub fn new(device: &Arc<Device>, set_count: u32) -> Result<Self, CreateDescriptorPoolError> {
        let pool_size = vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(set_count);
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(set_count)
            .pool_sizes(std::slice::from_ref(&pool_size));

        //SAFETY: create_info only references stack data valid for this call
        let handle = unsafe { device.create_raw_descriptor_pool(&create_info) }
            .map_err(CreateDescriptorPoolError::Vulkan)?;
        tracing::info!("Created descriptor pool {:?} for {} sets", handle, set_count);

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Allocate `count` sets, all with the same `layout`.
    ///
    /// The returned handles stay owned by the pool.
    pub fn allocate_sets(
        &self,
        layout: vk::DescriptorSetLayout,
        count: usize,
    ) -> Result<Vec<vk::DescriptorSet>, AllocateDescriptorSetsError> {
        let layouts = vec![layout; count];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&layouts);

        //SAFETY: the pool and layout are valid handles from this device and
        //the pool was sized for at least this many sets by the caller
        unsafe { self.parent.allocate_raw_descriptor_sets(&allocate_info) }
            .map_err(AllocateDescriptorSetsError::Vulkan)
    }

    /// Point `set`'s binding 0 at the full range of `uniform_buffer`.
    ///
    /// # Safety
    /// `set` must have been allocated from this pool with a layout whose
    /// binding 0 is a uniform buffer, and no pending command buffer may be
    /// using it.
    pub unsafe fn bind_uniform_buffer(&self, set: vk::DescriptorSet, uniform_buffer: &MemBuffer) {
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(uniform_buffer.raw_buffer())
            .offset(0)
            .range(uniform_buffer.size());
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info));

        //SAFETY: caller guarantees the set's layout and idle state; the
        //buffer is a live handle from the same device
        unsafe { self.parent.update_raw_descriptor_sets(std::slice::from_ref(&write)) };
    }

    pub fn raw_handle(&self) -> vk::DescriptorPool {
        self.handle
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor pool {:?}", self.handle);
        //SAFETY: pool was created from parent; its sets are freed implicitly
        //and nothing pending references them (owner sequences after idle)
        unsafe { self.parent.destroy_raw_descriptor_pool(self.handle) };
    }
}
