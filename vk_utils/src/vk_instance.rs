use std::borrow::Cow;
use std::ffi::{c_char, CStr, CString};
use std::rc::Rc;

use ash::extensions::ext::DebugUtils;
use ash::vk::{
    self, ApplicationInfo, Bool32, DebugUtilsMessageSeverityFlagsEXT,
    DebugUtilsMessageTypeFlagsEXT, DebugUtilsMessengerCallbackDataEXT,
    DebugUtilsMessengerCreateInfoEXT, DebugUtilsMessengerEXT, InstanceCreateInfo,
};
use ash::{Entry, Instance};
use log::{debug, error, info, trace, warn};

use crate::gpu::Gpu;
use crate::Result;

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: DebugUtilsMessageSeverityFlagsEXT,
    message_type: DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::os::raw::c_void,
) -> Bool32 {
    let callback_data = *p_callback_data;
    let message_id_number = callback_data.message_id_number;

    let message_id_name = if callback_data.p_message_id_name.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message_id_name).to_string_lossy()
    };

    let message = if callback_data.p_message.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };

    match message_severity {
        DebugUtilsMessageSeverityFlagsEXT::ERROR => error!(
            "{:?} [{} ({})] : {}",
            message_type, message_id_name, message_id_number, message
        ),
        DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!(
            "{:?} [{} ({})] : {}",
            message_type, message_id_name, message_id_number, message
        ),
        DebugUtilsMessageSeverityFlagsEXT::INFO => debug!(
            "{:?} [{} ({})] : {}",
            message_type, message_id_name, message_id_number, message
        ),
        _ => trace!(
            "{:?} [{} ({})] : {}",
            message_type, message_id_name, message_id_number, message
        ),
    }

    vk::FALSE
}

/// Loader entry, instance and (in debug builds) the validation messenger.
pub struct Vulkan {
    debug_utils: Option<(DebugUtils, DebugUtilsMessengerEXT)>,
    library: Entry,
    instance: Instance,
}

impl Vulkan {
    /// Creates an instance with the given extensions. `validation` enables the Khronos
    /// validation layer and routes its messages into `log`.
    pub fn new(name: &str, extensions: &[*const c_char], validation: bool) -> Result<Rc<Self>> {
        let c_name = CString::new(name).unwrap_or_default();
        let appinfo = ApplicationInfo::builder()
            .application_name(&c_name)
            .application_version(0)
            .engine_name(&c_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2);

        let library = unsafe { Entry::load()? };

        let validation = validation && Self::layer_available(&library, VALIDATION_LAYER);
        let layer_names_raw: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let mut extension_names_raw = extensions.to_vec();
        if validation {
            extension_names_raw.push(DebugUtils::name().as_ptr());
        }

        let create_info = InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw);

        let instance = unsafe { library.create_instance(&create_info, None)? };

        let debug_utils = if validation {
            let debug_info = DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));

            let loader = DebugUtils::new(&library, &instance);
            let messenger = unsafe { loader.create_debug_utils_messenger(&debug_info, None)? };
            Some((loader, messenger))
        } else {
            None
        };

        info!(
            "vulkan instance created (validation {})",
            if validation { "on" } else { "off" }
        );

        Ok(Rc::new(Self {
            debug_utils,
            library,
            instance,
        }))
    }

    fn layer_available(library: &Entry, layer: &CStr) -> bool {
        library
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers
                    .iter()
                    .any(|p| unsafe { CStr::from_ptr(p.layer_name.as_ptr()) } == layer)
            })
            .unwrap_or(false)
    }

    pub fn library(&self) -> &Entry {
        &self.library
    }

    pub fn vk_instance(&self) -> &Instance {
        &self.instance
    }

    /// Every physical device, discrete adapters first.
    pub fn hardware_devices(self: &Rc<Self>) -> Result<Vec<Gpu>> {
        let physical_devices = unsafe { self.instance.enumerate_physical_devices()? };
        let mut gpus: Vec<Gpu> = physical_devices
            .into_iter()
            .map(|pdevice| Gpu::new(self, pdevice))
            .collect();
        gpus.sort_by_key(|gpu| !gpu.is_discrete());
        Ok(gpus)
    }
}

impl Drop for Vulkan {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
