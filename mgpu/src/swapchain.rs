use std::sync::{Arc, Mutex};

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::device::Device;
use crate::render_pass::RenderPass;
use crate::surface::{Surface, SurfaceQueryError};

/// The image count the renderer asks for before clamping into the surface's
/// reported bounds. Two images form the double-buffered baseline.
pub const DESIRED_IMAGE_COUNT: u32 = 2;

#[derive(Debug, Error)]
pub enum CreateSwapchainError {
    #[error(
        "Mismatched parameters to Swapchain::new. Device and surface must be \
         derived from the same instance"
    )]
    MismatchedParams,

    #[error("No supported surface formats were reported")]
    NoSurfaceFormats,

    #[error("No supported present modes were reported")]
    NoPresentModes,

    #[error("Failed while querying surface support details: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),

    #[error("Vulkan error creating swapchain: {0}")]
    VulkanCreate(vk::Result),

    #[error("Vulkan error fetching swapchain images: {0}")]
    VulkanGetImages(vk::Result),

    #[error("Vulkan error creating swapchain image view: {0}")]
    VulkanCreateImageView(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateFramebuffersError {
    #[error("Framebuffers were already created for this swapchain")]
    AlreadyCreated,

    #[error("Vulkan error creating framebuffer: {0}")]
    Vulkan(vk::Result),
}

/// Pick the surface format: `R8G8B8A8_SRGB` in the sRGB non-linear color
/// space when offered, otherwise the first reported format.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::R8G8B8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(formats[0])
}

/// Pick the present mode: `MAILBOX` (lowest-latency tear-free) when offered,
/// otherwise `FIFO`, which every conformant driver must support.
fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .copied()
        .find(|m| *m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Clamp the requested extent into the surface's supported bounds.
fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_extent: vk::Extent2D,
) -> vk::Extent2D {
    vk::Extent2D {
        width: desired_extent.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: desired_extent.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// `clamp(DESIRED_IMAGE_COUNT, min, max-or-min)`: a `max_image_count` of 0
/// means "no upper bound", in which case the upper bound becomes
/// `max(DESIRED_IMAGE_COUNT, min)`.
fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let min = capabilities.min_image_count;
    let max = if capabilities.max_image_count > 0 {
        capabilities.max_image_count
    } else {
        DESIRED_IMAGE_COUNT.max(min)
    };
    DESIRED_IMAGE_COUNT.clamp(min, max)
}

/// Sharing mode between the graphics and present families: exclusive when
/// they are the same family, concurrent (over the deduplicated index list)
/// otherwise.
fn choose_sharing_mode(graphics_family: u32, present_family: u32) -> (vk::SharingMode, Vec<u32>) {
    if graphics_family == present_family {
        (vk::SharingMode::EXCLUSIVE, vec![graphics_family])
    } else {
        (
            vk::SharingMode::CONCURRENT,
            vec![graphics_family, present_family],
        )
    }
}

/// Create one 2D color image view per swapchain image, unwinding any
/// already-created views if a later one fails.
fn create_swapchain_image_views<FCreate, FDestroy>(
    images: &[vk::Image],
    format: vk::Format,
    mut create_image_view: FCreate,
    mut destroy_image_view: FDestroy,
) -> Result<Vec<vk::ImageView>, CreateSwapchainError>
where
    FCreate: FnMut(&vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView, vk::Result>,
    FDestroy: FnMut(vk::ImageView),
{
    let mut image_views: Vec<vk::ImageView> = Vec::with_capacity(images.len());
    for image in images.iter().copied() {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        match create_image_view(&create_info) {
            Ok(view) => image_views.push(view),
            Err(e) => {
                for created_view in image_views.drain(..) {
                    destroy_image_view(created_view);
                }
                return Err(CreateSwapchainError::VulkanCreateImageView(e));
            }
        }
    }

    Ok(image_views)
}

/// Create one framebuffer per image view against `render_pass_handle`,
/// unwinding any already-created framebuffers if a later one fails.
fn create_framebuffers_for_views<FCreate, FDestroy>(
    image_views: &[vk::ImageView],
    render_pass_handle: vk::RenderPass,
    extent: vk::Extent2D,
    mut create_framebuffer: FCreate,
    mut destroy_framebuffer: FDestroy,
) -> Result<Vec<vk::Framebuffer>, CreateFramebuffersError>
where
    FCreate: FnMut(&vk::FramebufferCreateInfo<'_>) -> Result<vk::Framebuffer, vk::Result>,
    FDestroy: FnMut(vk::Framebuffer),
{
    let mut framebuffers: Vec<vk::Framebuffer> = Vec::with_capacity(image_views.len());
    for image_view in image_views.iter() {
        let attachments = std::slice::from_ref(image_view);
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass_handle)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match create_framebuffer(&create_info) {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                for created in framebuffers.drain(..) {
                    destroy_framebuffer(created);
                }
                return Err(CreateFramebuffersError::Vulkan(e));
            }
        }
    }

    Ok(framebuffers)
}

/// The presentable-image chain for a window surface.
///
/// Images and their views are created with the chain; framebuffers are a
/// second phase because they need a render pass, which in turn needs the
/// chain's format. The owner must call
/// [`create_framebuffers`](Self::create_framebuffers) once the render pass
/// exists, and [`destroy_framebuffers`](Self::destroy_framebuffers) before
/// the render pass is destroyed.
pub struct Swapchain<T: HasDisplayHandle + HasWindowHandle> {
    parent_device: Arc<Device>,
    _parent_surface: Arc<Surface<T>>,
    handle: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Option<Vec<vk::Framebuffer>>,
    /// Serializes `vkAcquireNextImageKHR`, which the Vulkan spec requires to
    /// be externally synchronized with respect to the swapchain handle.
    acquire_lock: Mutex<()>,
}

impl<T: HasDisplayHandle + HasWindowHandle> std::fmt::Debug for Swapchain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .field("has_framebuffers", &self.framebuffers.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Swapchain<T> {
    pub fn new(
        parent_device: &Arc<Device>,
        parent_surface: &Arc<Surface<T>>,
        desired_extent: vk::Extent2D,
    ) -> Result<Self, CreateSwapchainError> {
        if !Arc::ptr_eq(parent_surface.get_parent(), parent_device.get_parent()) {
            return Err(CreateSwapchainError::MismatchedParams);
        }

        let physical_device = parent_device.get_physical_device();

        //SAFETY: physical_device belongs to parent_device's instance, and
        //parent_surface is derived from the same instance (validated above)
        let capabilities = unsafe { parent_surface.query_capabilities(physical_device) }?;
        //SAFETY: same reasoning as above
        let formats = unsafe { parent_surface.query_formats(physical_device) }?;
        //SAFETY: same reasoning as above
        let present_modes = unsafe { parent_surface.query_present_modes(physical_device) }?;

        if formats.is_empty() {
            return Err(CreateSwapchainError::NoSurfaceFormats);
        }
        if present_modes.is_empty() {
            return Err(CreateSwapchainError::NoPresentModes);
        }

        let surface_format = choose_surface_format(&formats);
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&capabilities, desired_extent);
        let image_count = choose_image_count(&capabilities);
        let (sharing_mode, queue_family_indices) = choose_sharing_mode(
            parent_device.graphics_queue_family(),
            parent_device.present_queue_family(),
        );

        let swapchain_create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(parent_surface.raw_handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        //SAFETY: create info references valid handles and values selected
        //from queried surface support details
        let handle = unsafe { parent_device.create_raw_swapchain(&swapchain_create_info) }?;
        tracing::info!(
            "Created swapchain {:?} ({}x{}, {:?}, {:?})",
            handle,
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );

        //SAFETY: handle was created by this device's swapchain loader
        let images = unsafe { parent_device.get_raw_swapchain_images(handle) }.inspect_err(
            |_| {
                //SAFETY: handle was created above and must be destroyed on
                //early exit
                unsafe { parent_device.destroy_raw_swapchain(handle) };
            },
        )?;

        let image_views = create_swapchain_image_views(
            &images,
            surface_format.format,
            |create_info| {
                //SAFETY: create_info references a valid swapchain image from
                //this device with a standard 2D color subresource range
                unsafe { parent_device.create_raw_image_view(create_info) }
            },
            |image_view| {
                //SAFETY: image_view was created by parent_device and must be
                //destroyed on early exit
                unsafe { parent_device.destroy_raw_image_view(image_view) };
            },
        )
        .inspect_err(|_| {
            //SAFETY: handle was created above and must be destroyed on early
            //exit
            unsafe { parent_device.destroy_raw_swapchain(handle) };
        })?;
        tracing::info!("Created {} swapchain image views", image_views.len());

        Ok(Self {
            parent_device: Arc::clone(parent_device),
            _parent_surface: Arc::clone(parent_surface),
            handle,
            format: surface_format.format,
            extent,
            images,
            image_views,
            framebuffers: None,
            acquire_lock: Mutex::new(()),
        })
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn raw_handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// The framebuffer for presentable image `index`, once
    /// [`create_framebuffers`](Self::create_framebuffers) has run.
    pub fn framebuffer(&self, index: usize) -> Option<vk::Framebuffer> {
        self.framebuffers.as_ref()?.get(index).copied()
    }

    /// Create one framebuffer per presentable image against `render_pass`.
    ///
    /// Must be called exactly once, after the render pass exists. The
    /// matching [`destroy_framebuffers`](Self::destroy_framebuffers) must
    /// run before `render_pass` is destroyed.
    pub fn create_framebuffers(
        &mut self,
        render_pass: &RenderPass,
    ) -> Result<(), CreateFramebuffersError> {
        if self.framebuffers.is_some() {
            return Err(CreateFramebuffersError::AlreadyCreated);
        }

        let framebuffers = create_framebuffers_for_views(
            &self.image_views,
            render_pass.raw_handle(),
            self.extent,
            |create_info| {
                //SAFETY: create_info references a live render pass and image
                //views owned by this swapchain, all from parent_device
                unsafe { self.parent_device.create_raw_framebuffer(create_info) }
            },
            |framebuffer| {
                //SAFETY: framebuffer was created by parent_device and must be
                //destroyed on early exit
                unsafe { self.parent_device.destroy_raw_framebuffer(framebuffer) };
            },
        )?;

        tracing::info!("Created {} framebuffers", framebuffers.len());
        self.framebuffers = Some(framebuffers);
        Ok(())
    }

    /// Destroy the framebuffers created by
    /// [`create_framebuffers`](Self::create_framebuffers).
    ///
    /// Must run before the render pass they were created against is
    /// destroyed, and before this swapchain itself is dropped. Calling it
    /// with no framebuffers alive is a no-op.
    pub fn destroy_framebuffers(&mut self) {
        if let Some(framebuffers) = self.framebuffers.take() {
            for framebuffer in framebuffers {
                //SAFETY: framebuffer was created by parent_device; the owner
                //sequences this call after all GPU work has drained
                unsafe { self.parent_device.destroy_raw_framebuffer(framebuffer) };
            }
            tracing::info!("Destroyed framebuffers");
        }
    }

    /// Acquire the next presentable image from the chain.
    ///
    /// Returns `(image_index, suboptimal)`. When `suboptimal` is `true` the
    /// chain is still usable but no longer ideal for the surface.
    ///
    /// # Safety
    /// `semaphore` must be a valid unsignaled semaphore created from this
    /// swapchain's device.
    pub unsafe fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        let _guard = self
            .acquire_lock
            .lock()
            .expect("swapchain acquire lock poisoned");
        //SAFETY: caller guarantees semaphore validity; self.handle is valid
        //for the lifetime of this Swapchain
        unsafe {
            self.parent_device
                .acquire_next_raw_image(self.handle, timeout_ns, semaphore)
        }
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Drop for Swapchain<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping swapchain {:?}", self.handle);
        if self.framebuffers.is_some() {
            tracing::warn!(
                "Swapchain dropped with live framebuffers; the owner should \
                 call destroy_framebuffers before the render pass goes away"
            );
            self.destroy_framebuffers();
        }
        for image_view in self.image_views.drain(..) {
            //SAFETY: image_view was created by parent_device and is being
            //destroyed during swapchain teardown
            unsafe { self.parent_device.destroy_raw_image_view(image_view) };
        }
        //SAFETY: swapchain handle was created by parent_device and this is
        //the final destruction path for this wrapper
        unsafe { self.parent_device.destroy_raw_swapchain(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    #[test]
    fn choose_surface_format_prefers_rgba_srgb() {
        let fallback = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let preferred = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let chosen = choose_surface_format(&[fallback, preferred]);
        assert_eq!(chosen.format, preferred.format);
        assert_eq!(chosen.color_space, preferred.color_space);
    }

    #[test]
    fn choose_surface_format_falls_back_to_first() {
        let first = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let second = vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };

        let chosen = choose_surface_format(&[first, second]);
        assert_eq!(chosen.format, first.format);
    }

    #[test]
    fn choose_present_mode_prefers_mailbox() {
        let chosen =
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]);
        assert_eq!(chosen, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn choose_present_mode_falls_back_to_fifo() {
        let chosen = choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]);
        assert_eq!(chosen, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn choose_extent_clamps_into_bounds() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };

        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 4000,
                height: 200,
            },
        );

        assert_eq!(chosen.width, 1920);
        assert_eq!(chosen.height, 480);
    }

    #[test]
    fn image_count_is_clamped_into_surface_bounds() {
        let surface = |min, max| vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        };

        // Desired count fits.
        assert_eq!(choose_image_count(&surface(2, 3)), 2);
        // Surface minimum wins over the desired count.
        assert_eq!(choose_image_count(&surface(3, 4)), 3);
        // Unbounded maximum: desired count.
        assert_eq!(choose_image_count(&surface(1, 0)), 2);
        // Unbounded maximum with a high minimum.
        assert_eq!(choose_image_count(&surface(4, 0)), 4);
    }

    #[test]
    fn sharing_is_exclusive_for_a_shared_family() {
        let (mode, indices) = choose_sharing_mode(0, 0);
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert_eq!(indices, vec![0]);
    }

    #[test]
    fn sharing_is_concurrent_for_split_families() {
        let (mode, indices) = choose_sharing_mode(0, 2);
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn image_view_helper_cleans_up_on_partial_failure() {
        let images = [
            vk::Image::from_raw(1),
            vk::Image::from_raw(2),
            vk::Image::from_raw(3),
        ];
        let created_views = [vk::ImageView::from_raw(10), vk::ImageView::from_raw(11)];
        let create_calls = RefCell::new(0usize);
        let destroyed = RefCell::new(Vec::<vk::ImageView>::new());

        let result = create_swapchain_image_views(
            &images,
            vk::Format::R8G8B8A8_SRGB,
            |_| {
                let mut call = create_calls.borrow_mut();
                let ret = match *call {
                    0 => Ok(created_views[0]),
                    _ => Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
                };
                *call += 1;
                ret
            },
            |view| destroyed.borrow_mut().push(view),
        );

        assert!(matches!(
            result,
            Err(CreateSwapchainError::VulkanCreateImageView(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            ))
        ));
        assert_eq!(destroyed.borrow().as_slice(), &[created_views[0]]);
    }

    #[test]
    fn framebuffer_helper_cleans_up_on_partial_failure() {
        let views = [
            vk::ImageView::from_raw(1),
            vk::ImageView::from_raw(2),
            vk::ImageView::from_raw(3),
        ];
        let created = [
            vk::Framebuffer::from_raw(20),
            vk::Framebuffer::from_raw(21),
        ];
        let create_calls = RefCell::new(0usize);
        let destroyed = RefCell::new(Vec::<vk::Framebuffer>::new());

        let result = create_framebuffers_for_views(
            &views,
            vk::RenderPass::from_raw(7),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
            |_| {
                let mut call = create_calls.borrow_mut();
                let ret = match *call {
                    0 | 1 => Ok(created[*call]),
                    _ => Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
                };
                *call += 1;
                ret
            },
            |framebuffer| destroyed.borrow_mut().push(framebuffer),
        );

        assert!(matches!(
            result,
            Err(CreateFramebuffersError::Vulkan(
                vk::Result::ERROR_OUT_OF_HOST_MEMORY
            ))
        ));
        assert_eq!(destroyed.borrow().as_slice(), &created);
    }

    #[test]
    fn framebuffer_helper_threads_the_render_pass_through() {
        let views = [vk::ImageView::from_raw(1)];
        let render_pass = vk::RenderPass::from_raw(42);
        let seen_pass = RefCell::new(vk::RenderPass::null());

        create_framebuffers_for_views(
            &views,
            render_pass,
            vk::Extent2D {
                width: 16,
                height: 16,
            },
            |create_info| {
                *seen_pass.borrow_mut() = create_info.render_pass;
                Ok(vk::Framebuffer::from_raw(99))
            },
            |_| panic!("destroy callback should not run on success"),
        )
        .expect("helper should succeed");

        assert_eq!(*seen_pass.borrow(), render_pass);
    }
}
