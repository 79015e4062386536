// Vulkan Instance - API connection and validation reporting
//
// Responsibilities:
// - Load the Vulkan library
// - Instance creation with the surface extensions the platform needs
// - Validation layer + debug messenger (debug builds only)

use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};

use crate::error::{RenderError, RenderResult, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Owns the API connection. Destroyed last, after every object created from it.
pub struct Instance {
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    entry: Entry,
}

impl Instance {
    /// Create the Vulkan instance
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `display` - Native display the surface will be created on
    /// * `enable_validation` - Enable validation layer + messenger
    pub fn new(
        app_name: &str,
        display: RawDisplayHandle,
        enable_validation: bool,
    ) -> RenderResult<Self> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }?;

        let enable_validation = enable_validation && Self::validation_layer_available(&entry)?;

        let instance = Self::create_instance(&entry, app_name, display, enable_validation)?;

        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            debug_utils,
            instance,
            entry,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.instance
    }

    fn validation_layer_available(entry: &Entry) -> RenderResult<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .vk_context("vkEnumerateInstanceLayerProperties")?;

        let found = layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        });

        if !found {
            log::warn!(
                "{} not installed, continuing without validation",
                VALIDATION_LAYER.to_string_lossy()
            );
        }
        Ok(found)
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display: RawDisplayHandle,
        enable_validation: bool,
    ) -> RenderResult<ash::Instance> {
        let app_name_cstr = CString::new(app_name).unwrap_or_else(|_| c"tri-renderer".to_owned());

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&app_name_cstr)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        // Generic + platform surface extensions
        let mut extensions = ash_window::enumerate_required_extensions(display)
            .vk_context("enumerate required surface extensions")?
            .to_vec();

        let mut layer_names = Vec::new();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
            layer_names.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        match unsafe { entry.create_instance(&create_info, None) } {
            Ok(instance) => Ok(instance),
            Err(vk::Result::ERROR_INCOMPATIBLE_DRIVER) => Err(RenderError::IncompatibleDriver),
            Err(result) => Err(RenderError::vulkan("vkCreateInstance", result)),
        }
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> RenderResult<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(messenger_severities())
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .vk_context("vkCreateDebugUtilsMessengerEXT")?;

        Ok((debug_utils, messenger))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan instance");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Prefix a validation message the way it appears in the log.
/// Several categories can apply to a single message.
pub(crate) fn severity_prefix(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
) -> String {
    let mut prefix = String::new();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        prefix.push_str("ERROR:");
    }
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        prefix.push_str("WARNING:");
    }
    if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        prefix.push_str("PERFORMANCE:");
    }
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        prefix.push_str("INFO:");
    }
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE) {
        prefix.push_str("DEBUG:");
    }
    prefix
}

/// Every severity, so `debug_level` decides what reaches the log.
fn messenger_severities() -> vk::DebugUtilsMessageSeverityFlagsEXT {
    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
        | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
}

pub(crate) fn format_debug_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    id_name: &str,
    id_number: i32,
    message: &str,
) -> String {
    format!(
        "{} [{}] Code {} : {}",
        severity_prefix(severity, types),
        id_name,
        id_number,
        message
    )
}

fn debug_level(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING)
        || types.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE)
    {
        log::Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Info
    } else {
        log::Level::Debug
    }
}

// Debug callback for validation layers. Never aborts the triggering call.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let data = &*p_callback_data;

    let id_name = if data.p_message_id_name.is_null() {
        "".into()
    } else {
        CStr::from_ptr(data.p_message_id_name).to_string_lossy()
    };
    let message = if data.p_message.is_null() {
        "".into()
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy()
    };

    log::log!(
        target: "vulkan",
        debug_level(message_severity, message_type),
        "{}",
        format_debug_message(
            message_severity,
            message_type,
            &id_name,
            data.message_id_number,
            &message
        )
    );

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    type Severity = vk::DebugUtilsMessageSeverityFlagsEXT;
    type Kind = vk::DebugUtilsMessageTypeFlagsEXT;

    #[test]
    fn prefixes_follow_severity() {
        assert_eq!(severity_prefix(Severity::ERROR, Kind::VALIDATION), "ERROR:");
        assert_eq!(severity_prefix(Severity::WARNING, Kind::GENERAL), "WARNING:");
        assert_eq!(severity_prefix(Severity::INFO, Kind::GENERAL), "INFO:");
        assert_eq!(severity_prefix(Severity::VERBOSE, Kind::GENERAL), "DEBUG:");
    }

    #[test]
    fn messenger_subscribes_to_verbose() {
        let severities = messenger_severities();
        for severity in [
            Severity::ERROR,
            Severity::WARNING,
            Severity::INFO,
            Severity::VERBOSE,
        ] {
            assert!(severities.contains(severity), "{severity:?} not subscribed");
        }
    }

    #[test]
    fn performance_messages_are_tagged() {
        assert_eq!(
            severity_prefix(Severity::WARNING, Kind::PERFORMANCE),
            "WARNING:PERFORMANCE:"
        );
        assert_eq!(debug_level(Severity::INFO, Kind::PERFORMANCE), log::Level::Warn);
    }

    #[test]
    fn errors_route_to_error_level() {
        assert_eq!(debug_level(Severity::ERROR, Kind::VALIDATION), log::Level::Error);
        assert_eq!(debug_level(Severity::VERBOSE, Kind::GENERAL), log::Level::Debug);
    }

    #[test]
    fn message_includes_id_and_code() {
        let text = format_debug_message(
            Severity::ERROR,
            Kind::VALIDATION,
            "VUID-vkCmdDraw-None-02699",
            -1234,
            "descriptor not bound",
        );
        assert_eq!(
            text,
            "ERROR: [VUID-vkCmdDraw-None-02699] Code -1234 : descriptor not bound"
        );
    }
}
