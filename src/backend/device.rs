// Device context - core GPU interface
//
// Responsibilities:
// - Instance creation with the surface extensions the window needs
// - Physical device selection (discrete GPU with graphics + present queues)
// - Logical device + queue creation

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::error::{RenderError, RenderResult};

/// Device extensions every candidate must support.
fn required_device_extensions() -> [&'static CStr; 1] {
    [khr::Swapchain::name()]
}

/// Queue family indices resolved once at selection time. The graphics and
/// present families may coincide or differ; nothing else about them changes
/// for the lifetime of the context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    pub fn are_distinct(&self) -> bool {
        self.graphics != self.present
    }
}

/// Outcome of physical device selection.
pub struct DeviceSelection {
    pub physical_device: vk::PhysicalDevice,
    pub families: QueueFamilyIndices,
}

/// Owns the instance, the logical device, and its queues. Sole allocator of
/// GPU handles; every other component holds an `Arc` to this.
pub struct DeviceContext {
    // Vulkan handles (order matters for drop!)
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub families: QueueFamilyIndices,

    // Cached device properties
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceContext {
    /// Create the instance for the given window display.
    ///
    /// Split from [`DeviceContext::new`] because the surface has to exist
    /// before device selection can test presentation support.
    pub fn create_instance(
        entry: &Entry,
        app_name: &str,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"No Engine")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("No Vulkan surface support for this display")?;

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(extensions);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    /// Select a physical device, create the logical device, and retrieve the
    /// queue handles.
    pub fn new(
        entry: Entry,
        instance: ash::Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &khr::Surface,
    ) -> Result<Arc<Self>> {
        let selection = select_physical_device(&instance, surface, surface_loader)?;
        let physical_device = selection.physical_device;
        let families = selection.families;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {} (graphics family {}, present family {})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            families.graphics,
            families.present,
        );

        let device = create_logical_device(&instance, physical_device, families)?;
        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            graphics_queue,
            present_queue,
            families,
            memory_properties,
        }))
    }

    /// Wait for the device to be idle (before any destructive step).
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying device context...");
        let _ = self.wait_idle();
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Evaluate every candidate against the acceptance predicate and return the
/// first one that satisfies it: discrete GPU, graphics + present queue
/// families, the mandatory extension set, and at least one surface format
/// and one present mode.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &khr::Surface,
) -> RenderResult<DeviceSelection> {
    let candidates = unsafe { instance.enumerate_physical_devices()? };

    for physical_device in candidates {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        if properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            continue;
        }

        let family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let families = find_queue_families(&family_properties, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(physical_device, index, surface)
                .unwrap_or(false)
        });
        let Some(families) = families else {
            continue;
        };

        if !supports_required_extensions(instance, physical_device)? {
            continue;
        }

        // The chain can only be negotiated if the surface reports at least
        // one format and one present mode.
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };
        if formats.is_empty() || present_modes.is_empty() {
            continue;
        }

        return Ok(DeviceSelection {
            physical_device,
            families,
        });
    }

    Err(RenderError::NoSuitableDevice)
}

/// Find one family supporting graphics and one supporting presentation.
/// `present_support` answers whether a family can present to the surface.
pub fn find_queue_families(
    family_properties: &[vk::QueueFamilyProperties],
    mut present_support: impl FnMut(u32) -> bool,
) -> Option<QueueFamilyIndices> {
    let mut graphics = None;
    let mut present = None;

    for (index, family) in family_properties.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        let index = index as u32;
        if graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(index);
        }
        if present.is_none() && present_support(index) {
            present = Some(index);
        }
        if let (Some(graphics), Some(present)) = (graphics, present) {
            return Some(QueueFamilyIndices { graphics, present });
        }
    }

    None
}

fn supports_required_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> RenderResult<bool> {
    let available = unsafe { instance.enumerate_device_extension_properties(physical_device)? };

    Ok(required_device_extensions().iter().all(|needed| {
        available.iter().any(|ext| {
            let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
            name == *needed
        })
    }))
}

/// Create one queue per distinct family index (1 or 2 queues total) with the
/// mandatory extensions enabled. No retry; failure is fatal.
fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: QueueFamilyIndices,
) -> Result<ash::Device> {
    let mut unique_families = vec![families.graphics];
    if families.are_distinct() {
        unique_families.push(families.present);
    }

    let queue_priorities = [1.0];
    let queue_create_infos: Vec<_> = unique_families
        .iter()
        .map(|&index| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(index)
                .queue_priorities(&queue_priorities)
                .build()
        })
        .collect();

    let extension_names: Vec<_> = required_device_extensions()
        .iter()
        .map(|name| name.as_ptr())
        .collect();
    let features = vk::PhysicalDeviceFeatures::default();

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(physical_device, &create_info, None) }
        .context("Failed to create logical device")?;

    Ok(device)
}
