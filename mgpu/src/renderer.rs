//! The steady-state render loop: per-slot synchronization, command
//! recording, submission, and presentation.
//!
//! Two index spaces exist and never mix:
//!
//! - **frame slots** cycle round-robin over [`FRAMES_IN_FLIGHT`] reusable
//!   sets of CPU-side resources (fence, image-available semaphore, command
//!   buffer), bounding how far the CPU may run ahead of the GPU;
//! - **presentable images** are whichever index the swapchain hands back
//!   from acquire; per-image resources (render-finished semaphore, uniform
//!   buffers, descriptor set, upload command buffer) are keyed by it, since
//!   presentation order can diverge from submission order.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::buffer::{self, CreateBufferError, MemBuffer, UploadBufferError, WriteBufferError};
use crate::command::{AllocateCommandBufferError, CommandPool, CreateCommandPoolError};
use crate::descriptor::{
    AllocateDescriptorSetsError, CreateDescriptorPoolError, DescriptorPool,
};
use crate::device::Device;
use crate::mesh::{TimeUniform, Vertex};
use crate::pipeline::PipelineState;
use crate::render_pass::RenderPass;
use crate::swapchain::Swapchain;
use crate::sync::{
    CreateFenceError, CreateSemaphoreError, Fence, Semaphore, WaitFenceError,
};

/// How many frames the CPU may record before blocking on the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// The clear color every frame starts from.
pub const CLEAR_COLOR: [f32; 4] = [0.23, 0.23, 0.23, 1.0];

const TRIANGLE_VERTICES: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.5, 0.0],
        color: [1.0, 0.0, 0.0, 0.33],
    },
    Vertex {
        position: [0.5, 0.5, 0.0],
        color: [0.0, 1.0, 0.0, 0.66],
    },
    Vertex {
        position: [-0.5, 0.5, 0.0],
        color: [0.0, 0.0, 1.0, 1.0],
    },
];

/// Round-robin counter over the frame slots.
///
/// Deliberately knows nothing about presentable-image indices; those come
/// from acquire results and follow their own sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCursor {
    slot: usize,
}

impl FrameCursor {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn advance(&mut self) {
        self.slot = (self.slot + 1) % FRAMES_IN_FLIGHT;
    }
}

/// The renderer's teardown sequence, reverse dependency order.
///
/// [`FrameRenderer`]'s fields are declared in exactly this order so Rust's
/// top-to-bottom field-drop rule executes it; the unit tests pin both the
/// list and the field-order assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStage {
    DescriptorPool,
    MemoryBuffers,
    Fences,
    Semaphores,
    CommandPool,
}

pub const TEARDOWN_ORDER: [TeardownStage; 5] = [
    TeardownStage::DescriptorPool,
    TeardownStage::MemoryBuffers,
    TeardownStage::Fences,
    TeardownStage::Semaphores,
    TeardownStage::CommandPool,
];

#[derive(Debug, Error)]
pub enum CreateRendererError {
    #[error("Framebuffers must be created on the swapchain before the renderer")]
    FramebuffersNotReady,

    #[error("Failed to create command pool: {0}")]
    CommandPool(#[from] CreateCommandPoolError),

    #[error("Failed to allocate command buffers: {0}")]
    CommandBuffers(#[from] AllocateCommandBufferError),

    #[error("Failed to create fence: {0}")]
    Fence(#[from] CreateFenceError),

    #[error("Failed to create semaphore: {0}")]
    Semaphore(#[from] CreateSemaphoreError),

    #[error("Failed to create buffer: {0}")]
    Buffer(#[from] CreateBufferError),

    #[error("Failed to write staging data: {0}")]
    StagingWrite(#[from] WriteBufferError),

    #[error("Failed to upload vertex data: {0}")]
    VertexUpload(#[from] UploadBufferError),

    #[error("Failed to create descriptor pool: {0}")]
    DescriptorPool(#[from] CreateDescriptorPoolError),

    #[error("Failed to allocate descriptor sets: {0}")]
    DescriptorSets(#[from] AllocateDescriptorSetsError),
}

#[derive(Debug, Error)]
pub enum RenderFrameError {
    #[error("Acquiring the next presentable image failed: {0}")]
    AcquireImage(vk::Result),

    #[error("Presentable image {0} has no framebuffer")]
    MissingFramebuffer(u32),

    #[error("Presentable image index {index} out of range ({count} per-image resources)")]
    ImageIndexOutOfRange { index: u32, count: usize },

    #[error("Failed to write the per-frame uniform into staging memory: {0}")]
    UniformWrite(#[from] WriteBufferError),

    #[error("Failed to upload the per-frame uniform data: {0}")]
    UniformUpload(#[from] UploadBufferError),

    #[error("Vulkan error recording the frame: {0}")]
    Record(vk::Result),

    #[error("Vulkan error submitting the frame: {0}")]
    Submit(vk::Result),
}

/// Drives one frame per call through the fence/semaphore state machine.
///
/// Construction allocates every per-slot and per-image resource and uploads
/// the vertex data once through the blocking staging protocol. The
/// swapchain, render pass, and pipeline stay owned by the caller and are
/// borrowed read-only for each frame.
pub struct FrameRenderer {
    // Field order is teardown order; see TEARDOWN_ORDER.
    descriptor_pool: DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    uniform_staging_buffers: Vec<MemBuffer>,
    uniform_device_buffers: Vec<MemBuffer>,
    _vertex_staging_buffer: MemBuffer,
    vertex_buffer: MemBuffer,
    in_flight_fences: Vec<Fence>,
    image_available_semaphores: Vec<Semaphore>,
    render_finished_semaphores: Vec<Semaphore>,
    frame_command_buffers: Vec<vk::CommandBuffer>,
    uniform_upload_command_buffers: Vec<vk::CommandBuffer>,
    command_pool: CommandPool,
    parent: Arc<Device>,
    start_time: Instant,
    cursor: FrameCursor,
}

impl std::fmt::Debug for FrameRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRenderer")
            .field("frames_in_flight", &FRAMES_IN_FLIGHT)
            .field("image_count", &self.render_finished_semaphores.len())
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl FrameRenderer {
    pub fn new<T: HasDisplayHandle + HasWindowHandle>(
        device: &Arc<Device>,
        swapchain: &Swapchain<T>,
        pipeline: &PipelineState,
    ) -> Result<Self, CreateRendererError> {
        let image_count = swapchain.image_count();
        if swapchain.framebuffer(0).is_none() {
            return Err(CreateRendererError::FramebuffersNotReady);
        }
        tracing::info!(
            "Creating renderer: {} presentable images, {} frames in flight",
            image_count,
            FRAMES_IN_FLIGHT
        );

        let command_pool = CommandPool::new(
            device,
            device.graphics_queue_family(),
            Some("Renderer command pool"),
        )?;
        let frame_command_buffers = command_pool.allocate_primary(FRAMES_IN_FLIGHT as u32)?;
        let uniform_upload_command_buffers = command_pool.allocate_primary(image_count as u32)?;

        // Per-slot sync: fences start signaled so the first pass through
        // each slot never blocks.
        let mut in_flight_fences = Vec::with_capacity(FRAMES_IN_FLIGHT);
        let mut image_available_semaphores = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for i in 0..FRAMES_IN_FLIGHT {
            in_flight_fences.push(Fence::new(
                device,
                true,
                Some(&format!("Frame slot {i} fence")),
            )?);
            image_available_semaphores.push(Semaphore::new(
                device,
                Some(&format!("Frame slot {i} image-available")),
            )?);
        }

        // Per-image sync: presentation order can diverge from submission
        // order, so render-finished semaphores belong to the image.
        let mut render_finished_semaphores = Vec::with_capacity(image_count);
        for k in 0..image_count {
            render_finished_semaphores.push(Semaphore::new(
                device,
                Some(&format!("Image {k} render-finished")),
            )?);
        }

        let vertex_bytes = std::mem::size_of_val(&TRIANGLE_VERTICES) as vk::DeviceSize;
        let mut vertex_staging_buffer = MemBuffer::new(
            device,
            vertex_bytes,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let vertex_buffer = MemBuffer::new(
            device,
            vertex_bytes,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let uniform_bytes = std::mem::size_of::<TimeUniform>() as vk::DeviceSize;
        let mut uniform_staging_buffers = Vec::with_capacity(image_count);
        let mut uniform_device_buffers = Vec::with_capacity(image_count);
        for _ in 0..image_count {
            uniform_staging_buffers.push(MemBuffer::new(
                device,
                uniform_bytes,
                vk::BufferUsageFlags::TRANSFER_SRC,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?);
            uniform_device_buffers.push(MemBuffer::new(
                device,
                uniform_bytes,
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?);
        }

        // The triangle never changes, so it goes up once, synchronously,
        // before the first frame, through a throwaway command buffer.
        vertex_staging_buffer.write_pod(&TRIANGLE_VERTICES)?;
        let setup_command_buffers = command_pool.allocate_primary(1)?;
        //SAFETY: the setup buffer was just allocated and never recorded;
        //both buffers carry the required transfer usages
        let vertex_upload = unsafe {
            buffer::upload_blocking(
                device,
                setup_command_buffers[0],
                &vertex_staging_buffer,
                &vertex_buffer,
            )
        };
        //SAFETY: upload_blocking waited for the device to go idle, so the
        //setup buffer is no longer pending regardless of the outcome
        unsafe { command_pool.free(&setup_command_buffers) };
        vertex_upload?;
        tracing::info!("Uploaded vertex data to the device-local buffer");

        let descriptor_pool = DescriptorPool::new(device, image_count as u32)?;
        let descriptor_sets =
            descriptor_pool.allocate_sets(pipeline.raw_descriptor_set_layout(), image_count)?;
        for (set, uniform_buffer) in descriptor_sets.iter().zip(&uniform_device_buffers) {
            //SAFETY: the set was allocated above with a layout whose binding
            //0 is a uniform buffer, and nothing has been submitted yet
            unsafe { descriptor_pool.bind_uniform_buffer(*set, uniform_buffer) };
        }

        Ok(Self {
            descriptor_pool,
            descriptor_sets,
            uniform_staging_buffers,
            uniform_device_buffers,
            _vertex_staging_buffer: vertex_staging_buffer,
            vertex_buffer,
            in_flight_fences,
            image_available_semaphores,
            render_finished_semaphores,
            frame_command_buffers,
            uniform_upload_command_buffers,
            command_pool,
            parent: Arc::clone(device),
            start_time: Instant::now(),
            cursor: FrameCursor::default(),
        })
    }

    pub fn current_slot(&self) -> usize {
        self.cursor.slot()
    }

    /// Render one frame.
    ///
    /// Suboptimal acquire/present results and fence-wait hiccups are logged
    /// at warning level and the frame proceeds; there is no swapchain
    /// recreation path. A hard acquire failure (for example a lost or
    /// out-of-date chain) is returned as an error, since no further frame
    /// can succeed on that chain.
    pub fn render_frame<T: HasDisplayHandle + HasWindowHandle>(
        &mut self,
        swapchain: &Swapchain<T>,
        render_pass: &RenderPass,
        pipeline: &PipelineState,
    ) -> Result<(), RenderFrameError> {
        let slot = self.cursor.slot();

        // 1. Wait for the slot's previous submission, then rearm the fence.
        //SAFETY: this thread is the only submitter of this fence
        match unsafe { self.in_flight_fences[slot].wait_and_reset(u64::MAX) } {
            Ok(()) => {}
            Err(WaitFenceError::Timeout) => {
                tracing::warn!("Fence wait for frame slot {slot} timed out");
            }
            Err(WaitFenceError::Vulkan(e)) => {
                tracing::warn!("Fence wait for frame slot {slot} failed: {e}");
            }
        }

        // 2. Acquire the next presentable image; the driver signals the
        //    slot's image-available semaphore once it really is.
        //SAFETY: the semaphore is unsignaled (consumed by the previous
        //submission that waited on it) and belongs to this device
        let image_index = match unsafe {
            swapchain.acquire_next_image(
                u64::MAX,
                self.image_available_semaphores[slot].raw_handle(),
            )
        } {
            Ok((index, false)) => index,
            Ok((index, true)) => {
                tracing::warn!("Acquired image {index} from a suboptimal swapchain");
                index
            }
            Err(e) => {
                tracing::warn!("Acquiring a presentable image failed: {e}");
                return Err(RenderFrameError::AcquireImage(e));
            }
        };
        let image = image_index as usize;
        if image >= self.descriptor_sets.len() {
            return Err(RenderFrameError::ImageIndexOutOfRange {
                index: image_index,
                count: self.descriptor_sets.len(),
            });
        }

        // 3. Refresh the per-frame uniform for this image and push it
        //    through the blocking staging protocol.
        let uniform = TimeUniform {
            time: self.start_time.elapsed().as_secs_f32(),
        };
        self.uniform_staging_buffers[image].write_pod(std::slice::from_ref(&uniform))?;
        //SAFETY: the upload buffer comes from a RESET_COMMAND_BUFFER pool,
        //so begin implicitly resets it; its previous submission finished
        //inside upload_blocking's device-idle wait
        unsafe {
            buffer::upload_blocking(
                &self.parent,
                self.uniform_upload_command_buffers[image],
                &self.uniform_staging_buffers[image],
                &self.uniform_device_buffers[image],
            )
        }?;

        // 4. Re-record the slot's command buffer against this image.
        self.record_frame_commands(slot, image, swapchain, render_pass, pipeline)?;

        // 5. Submit: color writes wait for the image, completion signals the
        //    image's render-finished semaphore and the slot's fence.
        let wait_semaphores = [self.image_available_semaphores[slot].raw_handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.frame_command_buffers[slot]];
        let signal_semaphores = [self.render_finished_semaphores[image].raw_handle()];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        //SAFETY: the command buffer was just recorded into the executable
        //state; semaphores and fence are unsignaled handles from this device
        unsafe {
            self.parent.submit_graphics(
                std::slice::from_ref(&submit_info),
                self.in_flight_fences[slot].raw_handle(),
            )
        }
        .map_err(RenderFrameError::Submit)?;

        // 6. Present the image once its rendering is done.
        let swapchains = [swapchain.raw_handle()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        //SAFETY: the swapchain and image index are valid, and the wait
        //semaphore will be signaled by the submission above
        match unsafe { self.parent.present(&present_info) } {
            Ok(false) => {}
            Ok(true) => tracing::warn!("Presented image {image_index} suboptimally"),
            Err(e) => tracing::warn!("Presenting image {image_index} failed: {e}"),
        }

        // 7. Next slot.
        self.cursor.advance();
        Ok(())
    }

    fn record_frame_commands<T: HasDisplayHandle + HasWindowHandle>(
        &mut self,
        slot: usize,
        image: usize,
        swapchain: &Swapchain<T>,
        render_pass: &RenderPass,
        pipeline: &PipelineState,
    ) -> Result<(), RenderFrameError> {
        let framebuffer = swapchain
            .framebuffer(image)
            .ok_or(RenderFrameError::MissingFramebuffer(image as u32))?;
        let command_buffer = self.frame_command_buffers[slot];

        //SAFETY: the slot's fence wait guarantees this buffer is no longer
        //pending
        unsafe { self.parent.reset_raw_command_buffer(command_buffer) }
            .map_err(RenderFrameError::Record)?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        //SAFETY: the buffer was reset just above
        unsafe { self.parent.begin_raw_command_buffer(command_buffer, &begin_info) }
            .map_err(RenderFrameError::Record)?;

        //SAFETY: recording state; the pipeline is a live handle
        unsafe {
            self.parent
                .cmd_bind_graphics_pipeline(command_buffer, pipeline.raw_handle())
        };
        //SAFETY: recording state; the set and layout are live and compatible
        unsafe {
            self.parent.cmd_bind_graphics_descriptor_sets(
                command_buffer,
                pipeline.raw_layout(),
                std::slice::from_ref(&self.descriptor_sets[image]),
            )
        };

        let clear_value = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: CLEAR_COLOR,
            },
        };
        let render_area = vk::Rect2D::default()
            .offset(vk::Offset2D::default())
            .extent(swapchain.extent());
        let render_pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.raw_handle())
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(std::slice::from_ref(&clear_value));
        //SAFETY: recording state; the framebuffer belongs to this render
        //pass and is not pending presentation (fence/semaphore chain)
        unsafe {
            self.parent
                .cmd_begin_render_pass(command_buffer, &render_pass_begin)
        };

        //SAFETY: recording state inside the render pass; the vertex buffer
        //is live with VERTEX_BUFFER usage
        unsafe {
            self.parent.cmd_bind_vertex_buffers(
                command_buffer,
                0,
                &[self.vertex_buffer.raw_buffer()],
                &[0],
            )
        };
        //SAFETY: pipeline, descriptor set, and vertex buffer are all bound
        unsafe {
            self.parent
                .cmd_draw(command_buffer, TRIANGLE_VERTICES.len() as u32, 1, 0, 0)
        };

        //SAFETY: a render pass is active on this buffer
        unsafe { self.parent.cmd_end_render_pass(command_buffer) };
        //SAFETY: the buffer is in the recording state
        unsafe { self.parent.end_raw_command_buffer(command_buffer) }
            .map_err(RenderFrameError::Record)
    }
}

impl Drop for FrameRenderer {
    fn drop(&mut self) {
        tracing::debug!("Dropping renderer; teardown order: {:?}", TEARDOWN_ORDER);
        // Nothing may be released while the GPU can still touch it.
        if let Err(e) = self.parent.wait_idle() {
            tracing::error!("Device idle wait during renderer teardown failed: {e}");
        }
        // Field declaration order now executes TEARDOWN_ORDER: descriptor
        // pool, memory buffers, fences, semaphores, command pool (which
        // implicitly frees both command buffer groups).
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn cursor_cycles_independently_of_image_indices() {
        let mut cursor = FrameCursor::default();
        // Three presentable images rotating while two slots cycle.
        let acquire_results = [0u32, 1, 2, 0, 1, 2];
        let mut slots = Vec::new();
        let mut images = Vec::new();

        for image in acquire_results {
            slots.push(cursor.slot());
            images.push(image);
            cursor.advance();
        }

        assert_eq!(slots, vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(images, vec![0, 1, 2, 0, 1, 2]);
        // Six steps with two slots: each slot reused exactly three times.
        assert_eq!(slots.iter().filter(|s| **s == 0).count(), 3);
        assert_eq!(slots.iter().filter(|s| **s == 1).count(), 3);
    }

    #[test]
    fn cursor_wraps_at_frames_in_flight() {
        let mut cursor = FrameCursor::default();
        for _ in 0..FRAMES_IN_FLIGHT {
            cursor.advance();
        }
        assert_eq!(cursor.slot(), 0);
    }

    #[test]
    fn teardown_order_matches_reverse_dependencies() {
        assert_eq!(
            TEARDOWN_ORDER,
            [
                TeardownStage::DescriptorPool,
                TeardownStage::MemoryBuffers,
                TeardownStage::Fences,
                TeardownStage::Semaphores,
                TeardownStage::CommandPool,
            ]
        );
    }

    /// Pushes its stage into the shared trace when dropped.
    struct StageGuard(TeardownStage, Rc<RefCell<Vec<TeardownStage>>>);

    impl Drop for StageGuard {
        fn drop(&mut self) {
            self.1.borrow_mut().push(self.0);
        }
    }

    /// Mirrors FrameRenderer's field declaration order.
    struct FieldOrderModel {
        _descriptor_pool: StageGuard,
        _buffers: StageGuard,
        _fences: StageGuard,
        _semaphores: StageGuard,
        _command_pool: StageGuard,
    }

    #[test]
    fn field_declaration_order_executes_the_teardown_order() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let model = FieldOrderModel {
            _descriptor_pool: StageGuard(TeardownStage::DescriptorPool, Rc::clone(&trace)),
            _buffers: StageGuard(TeardownStage::MemoryBuffers, Rc::clone(&trace)),
            _fences: StageGuard(TeardownStage::Fences, Rc::clone(&trace)),
            _semaphores: StageGuard(TeardownStage::Semaphores, Rc::clone(&trace)),
            _command_pool: StageGuard(TeardownStage::CommandPool, Rc::clone(&trace)),
        };
        drop(model);

        assert_eq!(trace.borrow().as_slice(), &TEARDOWN_ORDER);
    }

    #[test]
    fn triangle_covers_the_vertex_wire_format() {
        assert_eq!(TRIANGLE_VERTICES.len(), 3);
        assert_eq!(
            std::mem::size_of_val(&TRIANGLE_VERTICES),
            3 * std::mem::size_of::<Vertex>()
        );
    }
}
