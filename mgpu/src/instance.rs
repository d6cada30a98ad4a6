use std::ffi::{CStr, CString};
use std::fmt::Debug;
use std::str::FromStr;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::log::VulkanLogLevel;
use crate::surface::{SurfaceQueryError, SurfaceSupportError};

/// Owns the loaded Vulkan library, the `VkInstance`, and (when validation
/// was requested) the debug messenger forwarding driver diagnostics to
/// `tracing`.
///
/// Destruction order on drop: debug messenger, then the instance itself.
/// Surfaces and devices hold an `Arc<Instance>` and therefore always go
/// first.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger: Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    surface_instance: ash::khr::surface::Instance,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum CreateInstanceError {
    #[error("Could not load libvulkan: {0}")]
    LibraryLoading(libloading::Error),

    #[error("Could not load vkGetInstanceProcAddr from libvulkan")]
    MissingEntryPoint,

    #[error("Couldn't get display handle from the window source: {0}")]
    InvalidDisplayHandle(raw_window_handle::HandleError),

    #[error("Missing mandatory instance extensions: {0:?}")]
    MissingExtensions(Vec<String>),

    #[error("Validation requested, but layer {0:?} is not available")]
    MissingValidationLayer(&'static CStr),

    #[error("Validation requested, but VK_EXT_debug_utils is not available")]
    MissingDebugUtilsExtension,

    #[error("Invalid application name passed to Instance::new")]
    InvalidAppName,

    #[error("Unknown Vulkan error: {0}")]
    UnknownVulkan(vk::Result),
}

impl From<vk::Result> for CreateInstanceError {
    fn from(value: vk::Result) -> Self {
        CreateInstanceError::UnknownVulkan(value)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((debug_messenger, debug_utils_instance)) = self.debug_messenger.take() {
            //SAFETY: last use of this debug messenger, which was created from
            //this instance, and debug_utils_instance was derived from it
            unsafe { debug_utils_instance.destroy_debug_utils_messenger(debug_messenger, None) };
        }
        //SAFETY: We are in drop so this is the last use of the instance. Any
        //derived object (surface, device) holds an Arc and is already gone
        unsafe { self.handle.destroy_instance(None) };
    }
}

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    //SAFETY: Vulkan guarantees p_callback_data is valid for the call
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }.to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "General",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "Validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "Performance",
        _ => "Unknown",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(target: "mgpu-validation", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(target: "mgpu-validation", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "mgpu-validation", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "mgpu-validation", "[{}] {}", type_str, message);
        }
        _ => {
            tracing::debug!(target: "mgpu-validation", "[{}] {}", type_str, message);
        }
    }

    // Never abort the triggering call.
    vk::FALSE
}

fn severity_flags_for(level: VulkanLogLevel) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    match level {
        VulkanLogLevel::Verbose => {
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
        }
        VulkanLogLevel::Info => {
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
        }
        VulkanLogLevel::Warning => {
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
        }
        VulkanLogLevel::Error => vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
    }
}

impl Instance {
    /// Create an instance with the surface extensions the windowing system
    /// requires, plus — when `validation_level` is `Some` — the debug-utils
    /// extension and the Khronos validation layer.
    ///
    /// A requested validation layer or debug extension that the driver does
    /// not offer fails construction; nothing is created in that case.
    ///
    /// # Safety
    /// This loads libvulkan via `libloading`, meaning arbitrary library
    /// initialization code runs in-process.
    pub unsafe fn new(
        app_name: impl AsRef<str>,
        validation_level: Option<VulkanLogLevel>,
        display_handle_source: &impl HasDisplayHandle,
    ) -> Result<Self, CreateInstanceError> {
        use CreateInstanceError as Error;

        let app_name_cstring =
            CString::from_str(app_name.as_ref()).map_err(|_| Error::InvalidAppName)?;

        //SAFETY: We pass on the burden of dll loading to the caller. All
        //other vulkan objects are dropped before Entry (handled by the Drop
        //impls holding Arc<Instance>)
        let entry = unsafe { ash::Entry::load() }.map_err(|e| match e {
            ash::LoadingError::LibraryLoadFailure(error) => Error::LibraryLoading(error),
            ash::LoadingError::MissingEntryPoint(_) => Error::MissingEntryPoint,
        })?;

        //SAFETY: Basically always fine
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .unwrap_or(Some(vk::API_VERSION_1_0))
            .unwrap_or(vk::API_VERSION_1_0);

        // The surface extensions are mandatory: this renderer exists to put
        // pixels on a window.
        let window_exts = ash_window::enumerate_required_extensions(
            display_handle_source
                .display_handle()
                .map_err(Error::InvalidDisplayHandle)?
                .as_raw(),
        )?;
        let mandatory_exts: Vec<&CStr> = window_exts
            .iter()
            //SAFETY: ash_window documents that it hands out null terminated
            //C strings
            .map(|ext_cstr_ptr| unsafe { CStr::from_ptr(*ext_cstr_ptr) })
            .collect();

        //SAFETY: Pretty much always okay
        let instance_exts_avail = unsafe { entry.enumerate_instance_extension_properties(None) }?;
        //SAFETY: Pretty much always okay
        let instance_layers_avail = unsafe { entry.enumerate_instance_layer_properties() };

        let missing_exts: Vec<String> = mandatory_exts
            .iter()
            .filter(|mandatory_ext| {
                !instance_exts_avail
                    .iter()
                    .any(|avail| avail.extension_name_as_c_str() == Ok(**mandatory_ext))
            })
            .map(|ext| ext.to_string_lossy().into_owned())
            .collect();

        if !missing_exts.is_empty() {
            return Err(Error::MissingExtensions(missing_exts));
        }

        let mut enabled_exts: Vec<*const i8> =
            mandatory_exts.iter().map(|ext| ext.as_ptr()).collect();
        let mut enabled_layers: Vec<*const i8> = Vec::new();

        // Validation is opt-in, but once requested it is not best-effort: a
        // missing layer or missing debug extension fails bring-up outright.
        let mut debug_messenger_create_info = if let Some(level) = validation_level {
            let debug_utils_available = instance_exts_avail.iter().any(|ext| {
                ext.extension_name_as_c_str() == Ok(ash::ext::debug_utils::NAME)
            });
            if !debug_utils_available {
                return Err(Error::MissingDebugUtilsExtension);
            }

            let validation_layer_available = instance_layers_avail
                .as_ref()
                .map(|layers| {
                    layers
                        .iter()
                        .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER_NAME))
                })
                .unwrap_or(false);
            if !validation_layer_available {
                return Err(Error::MissingValidationLayer(VALIDATION_LAYER_NAME));
            }

            enabled_exts.push(ash::ext::debug_utils::NAME.as_ptr());
            enabled_layers.push(VALIDATION_LAYER_NAME.as_ptr());

            Some(
                vk::DebugUtilsMessengerCreateInfoEXT::default()
                    .message_severity(severity_flags_for(level))
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(vulkan_debug_callback)),
            )
        } else {
            None
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstring)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"mgpu")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_exts)
            .enabled_layer_names(&enabled_layers);

        // Chaining the messenger create info also captures messages emitted
        // during vkCreateInstance itself.
        if let Some(ref mut debug_info) = debug_messenger_create_info {
            instance_create_info = instance_create_info.push_next(debug_info);
        }

        //SAFETY: We made a valid instance_create_info
        let instance = unsafe { entry.create_instance(&instance_create_info, None) }?;
        tracing::info!("Created instance {:?}", instance.handle());

        let debug_messenger = if let Some(mut debug_messenger_create_info) =
            debug_messenger_create_info
        {
            debug_messenger_create_info.p_next = std::ptr::null();
            let debug_utils_instance = ash::ext::debug_utils::Instance::new(&entry, &instance);
            //SAFETY: Valid create info; the instance was created with the
            //debug utils extension enabled (checked above)
            match unsafe {
                debug_utils_instance
                    .create_debug_utils_messenger(&debug_messenger_create_info, None)
            } {
                Ok(debug_messenger) => Some((debug_messenger, debug_utils_instance)),
                Err(e) => {
                    //SAFETY: instance was created above and nothing else
                    //references it yet
                    unsafe { instance.destroy_instance(None) };
                    return Err(Error::UnknownVulkan(e));
                }
            }
        } else {
            None
        };

        let surface_instance = ash::khr::surface::Instance::new(&entry, &instance);

        Ok(Instance {
            entry,
            handle: instance,
            debug_messenger,
            surface_instance,
        })
    }

    /// Create a raw `VkSurfaceKHR` from a window/display handle source.
    ///
    /// # Safety
    /// The returned surface must be destroyed before `source` is dropped and
    /// before this instance is dropped. There is a parent/child relationship
    /// between both the instance and `source` and the returned surface.
    pub unsafe fn create_raw_surface<T: HasDisplayHandle + HasWindowHandle>(
        &self,
        source: &T,
    ) -> Result<vk::SurfaceKHR, CreateRawSurfaceError> {
        use CreateRawSurfaceError as Error;
        //SAFETY: Caller upholds the surface lifetime contract
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.handle,
                source
                    .display_handle()
                    .map_err(Error::DisplayHandle)?
                    .as_raw(),
                source.window_handle().map_err(Error::WindowHandle)?.as_raw(),
                None,
            )
        }
        .map_err(Error::OnCreate)
    }

    /// Destroy a raw `VkSurfaceKHR`.
    ///
    /// # Safety
    /// All objects derived from `surf` must be destroyed first, and `surf`
    /// must have been created from this instance.
    pub unsafe fn destroy_raw_surface(&self, surf: vk::SurfaceKHR) {
        //SAFETY: surf is derived from this instance (caller guarantees)
        unsafe { self.surface_instance.destroy_surface(surf, None) };
    }

    /// Handles to the physical devices this instance can see. The handles
    /// are only valid in the context of this instance.
    pub fn fetch_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        //SAFETY: Pretty much always fine
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(v) => Ok(v),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                Err(FetchPhysicalDeviceError::MemoryExhaustion)
            }
            Err(e) => Err(FetchPhysicalDeviceError::UnknownVulkan(e)),
        }
    }
}

// Physical-device queries used during device and swapchain bring-up.
impl Instance {
    /// # Safety
    /// `physical_device` must be a handle returned by
    /// [`fetch_physical_devices`](Self::fetch_physical_devices) on this
    /// instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        //SAFETY: physical_device was derived from this instance
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must be derived from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        //SAFETY: physical_device was derived from this instance
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be derived from this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        //SAFETY: physical_device was derived from this instance
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` and `surface` must both be derived from this
    /// instance.
    pub unsafe fn get_raw_physical_device_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceSupportError> {
        //SAFETY: handles were derived from this instance (caller guarantees)
        unsafe {
            self.surface_instance.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                surface,
            )
        }
        .map_err(SurfaceSupportError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must both be derived from this
    /// instance.
    pub unsafe fn get_surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        //SAFETY: handles were derived from this instance (caller guarantees)
        unsafe {
            self.surface_instance
                .get_physical_device_surface_capabilities(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must both be derived from this
    /// instance.
    pub unsafe fn get_surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        //SAFETY: handles were derived from this instance (caller guarantees)
        unsafe {
            self.surface_instance
                .get_physical_device_surface_formats(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must both be derived from this
    /// instance.
    pub unsafe fn get_surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        //SAFETY: handles were derived from this instance (caller guarantees)
        unsafe {
            self.surface_instance
                .get_physical_device_surface_present_modes(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// Create the logical `ash::Device` for `physical_device`.
    ///
    /// # Safety
    /// `physical_device` must be derived from this instance and
    /// `create_info` must reference valid data for the duration of the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        //SAFETY: caller guarantees provenance and create_info validity
        unsafe { self.handle.create_device(physical_device, create_info, None) }
    }

    /// Build the swapchain extension loader for a logical device created
    /// from this instance.
    pub fn create_swapchain_loader(&self, device: &ash::Device) -> ash::khr::swapchain::Device {
        ash::khr::swapchain::Device::new(&self.handle, device)
    }

    /// Build the debug-utils device loader when the extension was enabled at
    /// instance creation, `None` otherwise.
    pub fn create_debug_utils_device_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.debug_messenger
            .as_ref()
            .map(|_| ash::ext::debug_utils::Device::new(&self.handle, device))
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Error fetching physical devices, memory exhaustion")]
    MemoryExhaustion,
    #[error("Error fetching physical devices, Unknown vulkan: {0}")]
    UnknownVulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateRawSurfaceError {
    #[error("Error creating surface: {0}")]
    OnCreate(vk::Result),
    #[error("Unable to get display handle: {0}")]
    DisplayHandle(raw_window_handle::HandleError),
    #[error("Unable to get window handle: {0}")]
    WindowHandle(raw_window_handle::HandleError),
}
