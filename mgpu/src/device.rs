use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::{FetchPhysicalDeviceError, Instance};
use crate::surface::{Surface, SurfaceSupportError};
use crate::swapchain::CreateSwapchainError;

/// Queue family indices resolved against a physical device and a surface.
///
/// Both indices must be present before logical-device creation proceeds;
/// they may or may not name the same family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Family with `QueueFlags::GRAPHICS`.
    pub graphics: Option<u32>,
    /// Family that can present to the target surface.
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }
}

/// Scan `families` for a graphics-capable family and a family that can
/// present (per `supports_present`), stopping as soon as both are resolved.
///
/// `supports_present` receives a family index and may fail; a failed query
/// is treated as "cannot present on this family".
pub fn resolve_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> QueueFamilyIndices
where
    F: FnMut(u32) -> Result<bool, SurfaceSupportError>,
{
    let mut indices = QueueFamilyIndices::default();
    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = Some(i);
        }
        if indices.present.is_none() && supports_present(i).unwrap_or(false) {
            indices.present = Some(i);
        }
        if indices.is_complete() {
            break;
        }
    }
    indices
}

/// Owns the logical device, the selected physical device, and the graphics
/// and present queue handles.
///
/// All other wrappers in this crate hold an `Arc<Device>` and dispatch
/// their driver calls through the `raw_*` methods below, so the device is
/// always the last GPU object standing (before surface and instance).
pub struct Device {
    parent: Arc<Instance>,
    handle: ash::Device,
    swapchain_device: ash::khr::swapchain::Device,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    physical_device: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: QueueFamilyIndices,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("queue_families", &self.queue_families)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        //SAFETY: All objects derived from this device hold an Arc to it and
        //are already dropped. Queues are owned by the device and go with it.
        unsafe { self.handle.destroy_device(None) };
    }
}

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error(
        "Mismatched parameters to Device::new. The surface must be derived \
         from the same instance"
    )]
    MismatchedParams,

    #[error("Host memory exhaustion while creating the device")]
    MemoryExhaustion,

    #[error("No physical device is available")]
    NoPhysicalDevice,

    #[error("No queue family supporting graphics was found")]
    NoGraphicsQueueFamily,

    #[error("No queue family able to present to the surface was found")]
    NoPresentQueueFamily,

    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),

    #[error("Unknown Vulkan error while creating the device: {0}")]
    UnknownVulkan(vk::Result),
}

impl From<FetchPhysicalDeviceError> for CreateDeviceError {
    fn from(value: FetchPhysicalDeviceError) -> Self {
        match value {
            FetchPhysicalDeviceError::MemoryExhaustion => Self::MemoryExhaustion,
            FetchPhysicalDeviceError::UnknownVulkan(e) => Self::UnknownVulkan(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Debug utils extension is not enabled on this device")]
    DebugUtilsNotEnabled,

    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),

    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

impl Device {
    /// Create a logical device able to render to `surf` and present on it.
    ///
    /// Adapter policy: the first enumerated physical device is selected.
    /// Scoring by device type or dedicated queues is a deliberate extension
    /// point, not implemented here.
    ///
    /// Both a graphics-capable family and a present-capable family must
    /// resolve; otherwise construction fails with a typed error and nothing
    /// device-side is left behind.
    pub fn new<T: HasDisplayHandle + HasWindowHandle>(
        instance: &Arc<Instance>,
        surf: &Surface<T>,
    ) -> Result<Self, CreateDeviceError> {
        if !Arc::ptr_eq(surf.get_parent(), instance) {
            return Err(CreateDeviceError::MismatchedParams);
        }

        let physical_devices = instance.fetch_physical_devices()?;
        let physical_device = *physical_devices
            .first()
            .ok_or(CreateDeviceError::NoPhysicalDevice)?;

        //SAFETY: physical_device was derived from instance
        let props = unsafe { instance.get_raw_physical_device_properties(physical_device) };
        tracing::info!(
            "Selected physical device: {:?} (type: {:?})",
            props.device_name_as_c_str().unwrap_or(c"unknown"),
            props.device_type,
        );

        //SAFETY: physical_device was derived from instance
        let families =
            unsafe { instance.get_raw_physical_device_queue_family_properties(physical_device) };
        let queue_families = resolve_queue_families(&families, |idx| {
            //SAFETY: physical_device and the surface share this instance
            unsafe { surf.supports_queue_family(physical_device, idx) }
        });

        let graphics_family = queue_families
            .graphics
            .ok_or(CreateDeviceError::NoGraphicsQueueFamily)?;
        let present_family = queue_families
            .present
            .ok_or(CreateDeviceError::NoPresentQueueFamily)?;
        tracing::info!(
            "Queue families — graphics: {}, present: {}",
            graphics_family,
            present_family
        );

        // One queue per unique family; graphics and present often coincide.
        let unique_families: BTreeSet<u32> = [graphics_family, present_family].into();
        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let device_exts = [ash::khr::swapchain::NAME.as_ptr()];

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_exts);

        //SAFETY: physical_device was derived from instance, device_create_info
        //is valid for the duration of the call
        let device = unsafe { instance.create_ash_device(physical_device, &device_create_info) }
            .map_err(CreateDeviceError::DeviceCreationFailed)?;
        tracing::info!("Created logical device {:?}", device.handle());

        //SAFETY: the device was just created with one queue in each of these
        //families
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        //SAFETY: same as above
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        //SAFETY: physical_device was derived from instance
        let memory_properties =
            unsafe { instance.get_raw_physical_device_memory_properties(physical_device) };

        Ok(Self {
            swapchain_device: instance.create_swapchain_loader(&device),
            debug_utils_device: instance.create_debug_utils_device_loader(&device),
            parent: Arc::clone(instance),
            handle: device,
            physical_device,
            memory_properties,
            queue_families,
            graphics_queue,
            present_queue,
        })
    }

    pub fn get_parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn get_physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn ash_handle(&self) -> &ash::Device {
        &self.handle
    }

    pub fn raw_handle(&self) -> vk::Device {
        self.handle.handle()
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.queue_families
            .graphics
            .expect("Device::new requires a resolved graphics family")
    }

    pub fn present_queue_family(&self) -> u32 {
        self.queue_families
            .present
            .expect("Device::new requires a resolved present family")
    }

    /// Memory heaps and types of the selected physical device, captured at
    /// device creation.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Wait until all submitted work on this device has completed.
    ///
    /// This may block the calling thread for as long as the GPU needs; it is
    /// used for the synchronous upload protocol and for teardown, never as a
    /// per-frame synchronization primitive.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        //SAFETY: self.handle is a valid logical device for the lifetime of
        //self; no further preconditions
        unsafe { self.handle.device_wait_idle() }
    }
}

// Queue operations.
impl Device {
    /// Submit command buffers on the graphics queue, optionally signaling
    /// `fence` on completion.
    ///
    /// # Safety
    /// All handles referenced by `submits` must be valid and derived from
    /// this device; command buffers must be in the executable state.
    pub unsafe fn submit_graphics(
        &self,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        //SAFETY: caller guarantees handle validity and state
        unsafe { self.handle.queue_submit(self.graphics_queue, submits, fence) }
    }

    /// Present a swapchain image on the present queue.
    ///
    /// Returns `Ok(true)` when the presentation was suboptimal for the
    /// surface but still succeeded.
    ///
    /// # Safety
    /// The swapchain, image index, and wait semaphores in `present_info`
    /// must be valid and derived from this device.
    pub unsafe fn present(
        &self,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        //SAFETY: caller guarantees handle validity
        unsafe {
            self.swapchain_device
                .queue_present(self.present_queue, present_info)
        }
    }
}

// Swapchain functionality.
impl Device {
    /// # Safety
    /// `create_info` must reference valid Vulkan objects derived from this
    /// device and its parent instance, valid for the duration of the call.
    pub unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, CreateSwapchainError> {
        //SAFETY: caller guarantees create_info validity and provenance
        unsafe { self.swapchain_device.create_swapchain(create_info, None) }
            .map_err(CreateSwapchainError::VulkanCreate)
    }

    /// # Safety
    /// `swapchain` must be a valid swapchain created from this device and
    /// not yet destroyed.
    pub unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, CreateSwapchainError> {
        //SAFETY: caller guarantees swapchain validity
        unsafe { self.swapchain_device.get_swapchain_images(swapchain) }
            .map_err(CreateSwapchainError::VulkanGetImages)
    }

    /// # Safety
    /// `swapchain` must be derived from this device and all child resources
    /// (views, framebuffers) must be destroyed first. No in-flight GPU work
    /// may still reference it.
    pub unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.swapchain_device.destroy_swapchain(swapchain, None) };
    }

    /// Acquire the next presentable image, signaling `semaphore` when it
    /// becomes available.
    ///
    /// Returns `(image_index, suboptimal)`.
    ///
    /// # Safety
    /// `swapchain` must be valid and derived from this device; `semaphore`,
    /// when not null, must be a valid unsignaled semaphore.
    pub unsafe fn acquire_next_raw_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        //SAFETY: caller guarantees handle validity
        unsafe {
            self.swapchain_device.acquire_next_image(
                swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// # Safety
    /// `create_info` must reference a valid image derived from this device.
    pub unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    /// # Safety
    /// `image_view` must be derived from this device; framebuffers using it
    /// must be destroyed first and no in-flight work may reference it.
    pub unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_image_view(image_view, None) };
    }

    /// # Safety
    /// `create_info` must reference a valid render pass and image views
    /// derived from this device.
    pub unsafe fn create_raw_framebuffer(
        &self,
        create_info: &vk::FramebufferCreateInfo<'_>,
    ) -> Result<vk::Framebuffer, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe { self.handle.create_framebuffer(create_info, None) }
    }

    /// # Safety
    /// `framebuffer` must be derived from this device and no in-flight work
    /// may still reference it.
    pub unsafe fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_framebuffer(framebuffer, None) };
    }
}

// Render pass functionality.
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_render_pass(
        &self,
        create_info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe { self.handle.create_render_pass(create_info, None) }
    }

    /// # Safety
    /// `render_pass` must be derived from this device; framebuffers and
    /// pipelines created against it must be destroyed first.
    pub unsafe fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_render_pass(render_pass, None) };
    }
}

// Shader module functionality.
impl Device {
    /// # Safety
    /// `create_info` must contain valid SPIR-V code, valid for the duration
    /// of the call.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `shader_module` must be derived from this device; pipelines built
    /// from it must be destroyed first.
    pub unsafe fn destroy_raw_shader_module(&self, shader_module: vk::ShaderModule) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_shader_module(shader_module, None) };
    }
}

// Pipeline functionality.
impl Device {
    /// # Safety
    /// `create_info` must be valid; bindings must reference nothing beyond
    /// the call.
    pub unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe { self.handle.create_descriptor_set_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must be derived from this device; pipeline layouts using it
    /// must be destroyed first.
    pub unsafe fn destroy_raw_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_descriptor_set_layout(layout, None) };
    }

    /// # Safety
    /// All descriptor set layouts referenced by `create_info` must be valid
    /// handles derived from this device.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must be derived from this device; no pipeline still using it
    /// may be alive.
    pub unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// Create a single graphics pipeline.
    ///
    /// On partial batch failure ash returns any successfully-created
    /// pipeline handles alongside the error; this wrapper destroys them so
    /// callers never receive a mix of valid and invalid handles.
    ///
    /// # Safety
    /// `create_info` must reference valid shader stages, a valid pipeline
    /// layout, and a valid render pass, all derived from this device and
    /// valid for the duration of the call.
    pub unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        }
        .map_err(|(partial, result)| {
            for p in partial {
                if p != vk::Pipeline::null() {
                    //SAFETY: p was just created by this device
                    unsafe { self.handle.destroy_pipeline(p, None) };
                }
            }
            result
        })
        .map(|mut pipelines| {
            debug_assert_eq!(pipelines.len(), 1);
            pipelines.remove(0)
        })
    }

    /// # Safety
    /// `pipeline` must be derived from this device and no in-flight GPU work
    /// may still reference it.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

// Buffer and memory functionality.
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must be derived from this device and not in use by the GPU.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must be a valid buffer created from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        //SAFETY: caller guarantees buffer validity
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `allocate_info` must name a valid memory type index for this device.
    pub unsafe fn allocate_raw_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        //SAFETY: caller guarantees allocate_info validity
        unsafe { self.handle.allocate_memory(allocate_info, None) }
    }

    /// # Safety
    /// `memory` must be derived from this device, unmapped, and not bound to
    /// any live buffer that the GPU still uses.
    pub unsafe fn free_raw_memory(&self, memory: vk::DeviceMemory) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.free_memory(memory, None) };
    }

    /// # Safety
    /// `buffer` and `memory` must be derived from this device; the memory
    /// must be large enough for the buffer at `offset` and not already bound.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        //SAFETY: caller guarantees handle validity and binding preconditions
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// `memory` must be host-visible memory derived from this device, not
    /// already mapped, and `[offset, offset+size)` must be in-bounds.
    pub unsafe fn map_raw_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<*mut std::ffi::c_void, vk::Result> {
        //SAFETY: caller guarantees mapping preconditions
        unsafe {
            self.handle
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }
    }

    /// # Safety
    /// `memory` must currently be mapped via
    /// [`map_raw_memory`](Self::map_raw_memory), and the mapped pointer must
    /// no longer be used after this call.
    pub unsafe fn unmap_raw_memory(&self, memory: vk::DeviceMemory) {
        //SAFETY: caller guarantees the memory is mapped
        unsafe { self.handle.unmap_memory(memory) };
    }
}

// Descriptor functionality.
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe { self.handle.create_descriptor_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must be derived from this device; sets allocated from it are
    /// freed implicitly and must not be referenced by in-flight work.
    pub unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_descriptor_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info` must reference a valid pool and set layouts derived
    /// from this device, with enough capacity remaining in the pool.
    pub unsafe fn allocate_raw_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        //SAFETY: caller guarantees allocate_info validity
        unsafe { self.handle.allocate_descriptor_sets(allocate_info) }
    }

    /// # Safety
    /// All sets and buffers referenced by `writes` must be valid handles
    /// derived from this device; no referenced set may be in use by pending
    /// command buffers.
    pub unsafe fn update_raw_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        //SAFETY: caller guarantees write validity
        unsafe { self.handle.update_descriptor_sets(writes, &[]) };
    }
}

// Command pool / buffer functionality.
impl Device {
    /// # Safety
    /// `create_info` must name a valid queue family index for this device.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must be derived from this device and none of its command
    /// buffers may be pending execution. Destroying the pool implicitly
    /// frees every command buffer allocated from it.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info` must reference a valid pool derived from this device,
    /// and pool access must be externally synchronized.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        //SAFETY: caller guarantees allocate_info validity
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// # Safety
    /// All buffers must come from `pool`, be idle, and pool access must be
    /// externally synchronized.
    pub unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        buffers: &[vk::CommandBuffer],
    ) {
        //SAFETY: caller guarantees provenance and idle state
        unsafe { self.handle.free_command_buffers(pool, buffers) };
    }

    /// # Safety
    /// `command_buffer` must be derived from this device and not pending
    /// execution.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        //SAFETY: caller guarantees the buffer is not pending
        unsafe {
            self.handle
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    /// # Safety
    /// `command_buffer` must be in the initial state.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        //SAFETY: caller guarantees the buffer state
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        //SAFETY: caller guarantees the buffer state
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must be recording; all handles in `begin_info` must
    /// be valid and the framebuffer compatible with the render pass.
    pub unsafe fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
    ) {
        //SAFETY: caller guarantees recording state and begin_info validity
        unsafe {
            self.handle
                .cmd_begin_render_pass(command_buffer, begin_info, vk::SubpassContents::INLINE)
        };
    }

    /// # Safety
    /// `command_buffer` must be recording inside an active render pass.
    pub unsafe fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        //SAFETY: caller guarantees render pass state
        unsafe { self.handle.cmd_end_render_pass(command_buffer) };
    }

    /// # Safety
    /// `command_buffer` must be recording; `pipeline` must be a valid
    /// graphics pipeline derived from this device.
    pub unsafe fn cmd_bind_graphics_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        //SAFETY: caller guarantees recording state and pipeline validity
        unsafe {
            self.handle
                .cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline)
        };
    }

    /// # Safety
    /// `command_buffer` must be recording; `layout` and `sets` must be valid
    /// handles derived from this device and compatible with the bound
    /// pipeline.
    pub unsafe fn cmd_bind_graphics_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    ) {
        //SAFETY: caller guarantees recording state and handle validity
        unsafe {
            self.handle.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                sets,
                &[],
            )
        };
    }

    /// # Safety
    /// `command_buffer` must be recording; `buffers` and `offsets` must have
    /// equal length and all buffers must be derived from this device.
    pub unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        //SAFETY: caller guarantees recording state and buffer validity
        unsafe {
            self.handle
                .cmd_bind_vertex_buffers(command_buffer, first_binding, buffers, offsets)
        };
    }

    /// # Safety
    /// `command_buffer` must be recording inside an active render pass with
    /// a compatible pipeline and vertex buffer bound.
    pub unsafe fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        //SAFETY: caller guarantees render pass and pipeline state validity
        unsafe {
            self.handle.cmd_draw(
                command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
    }

    /// # Safety
    /// `command_buffer` must be recording; `src_buffer` and `dst_buffer`
    /// must be derived from this device and every region in-bounds.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        //SAFETY: caller guarantees recording state and copy validity
        unsafe {
            self.handle
                .cmd_copy_buffer(command_buffer, src_buffer, dst_buffer, regions)
        };
    }
}

// Synchronization primitives.
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must be derived from this device and not pending.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// All fences must be valid handles derived from this device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        //SAFETY: caller guarantees fence validity
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// # Safety
    /// All fences must be valid, signaled or never-submitted handles derived
    /// from this device.
    pub unsafe fn reset_raw_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result> {
        //SAFETY: caller guarantees the fences are not pending
        unsafe { self.handle.reset_fences(fences) }
    }

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        //SAFETY: caller guarantees create_info validity
        unsafe { self.handle.create_semaphore(create_info, None) }
    }

    /// # Safety
    /// `semaphore` must be derived from this device; no queue operation may
    /// be waiting on or about to signal it.
    pub unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        //SAFETY: caller guarantees provenance and drop ordering
        unsafe { self.handle.destroy_semaphore(semaphore, None) };
    }
}

// Debug naming functionality.
impl Device {
    /// Set a Vulkan debug name for an object owned by this device.
    ///
    /// Passing `None` as the name is treated as a no-op.
    ///
    /// # Safety
    /// `object` must be a valid handle created from this device and remain
    /// valid for the duration of the call.
    pub unsafe fn set_object_name<H>(
        &self,
        object: H,
        name: Option<&CStr>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        let debug_utils = self
            .debug_utils_device
            .as_ref()
            .ok_or(NameObjectError::DebugUtilsNotEnabled)?;

        let Some(name) = name else {
            return Ok(());
        };

        let object_name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name);

        //SAFETY: caller guarantees object provenance and validity
        unsafe { debug_utils.set_debug_utils_object_name(&object_name_info) }
            .map_err(NameObjectError::Vulkan)
    }

    /// Convenience helper to set a name from UTF-8 text.
    ///
    /// # Safety
    /// Same contract as [`set_object_name`](Self::set_object_name).
    pub unsafe fn set_object_name_str<H>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        let name = match name {
            Some(name) => Some(CString::new(name).map_err(NameObjectError::InvalidName)?),
            None => None,
        };

        //SAFETY: shares the safety contract of set_object_name
        unsafe { self.set_object_name(object, name.as_deref()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn resolves_shared_graphics_present_family() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)];
        let indices = resolve_queue_families(&families, |_| Ok(true));
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(0));
        assert!(indices.is_complete());
    }

    #[test]
    fn resolves_split_families() {
        let families = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        // Only the compute-only family can present.
        let indices = resolve_queue_families(&families, |idx| Ok(idx == 0));
        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(0));
    }

    #[test]
    fn missing_present_family_stays_unresolved() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = resolve_queue_families(&families, |_| Ok(false));
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, None);
        assert!(!indices.is_complete());
    }

    #[test]
    fn missing_graphics_family_stays_unresolved() {
        let families = [family(vk::QueueFlags::COMPUTE), family(vk::QueueFlags::TRANSFER)];
        let indices = resolve_queue_families(&families, |_| Ok(true));
        assert_eq!(indices.graphics, None);
        assert_eq!(indices.present, Some(0));
        assert!(!indices.is_complete());
    }

    #[test]
    fn failed_present_query_counts_as_unsupported() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = resolve_queue_families(&families, |_| {
            Err(SurfaceSupportError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
        });
        assert_eq!(indices.present, None);
    }

    #[test]
    fn stops_scanning_once_complete() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let calls = Cell::new(0u32);
        let _ = resolve_queue_families(&families, |_| {
            calls.set(calls.get() + 1);
            Ok(true)
        });
        assert_eq!(calls.get(), 1);
    }
}
