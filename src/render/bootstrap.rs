//! Vulkan instance, XCB surface and logical device

use std::ffi::CStr;

use ash::khr::{external_memory_fd, surface, xcb_surface};
use ash::{vk, Device, Entry, Instance};

use crate::error::{GpuError, GpuResult, VkResultExt};
use crate::geometry::Extent;
use crate::linux::X11Session;

/// Optional device features the zero-copy path depends on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub external_memory_dma_buf: bool,
    pub drm_format_modifier: bool,
}

/// Lower is better. Discrete GPUs first, software rasterizers last.
pub fn device_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 3,
        _ => 4,
    }
}

/// First queue family with graphics (and therefore transfer) support that
/// can also present to the surface
pub fn find_queue_family(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .filter(|(_, family)| family.queue_count > 0)
        .filter(|(_, family)| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(index, _)| index as u32)
        .find(|&index| supports_present(index))
}

fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|ext| ext.extension_name_as_c_str().is_ok_and(|n| n == name))
}

struct Candidate {
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    rank: u32,
    name: String,
    extensions: Vec<vk::ExtensionProperties>,
}

pub struct GpuContext {
    _entry: Entry,
    instance: Instance,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: Device,
    queue: vk::Queue,
    queue_family: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    capabilities: DeviceCapabilities,
    external_memory_fd: Option<external_memory_fd::Device>,
}

impl GpuContext {
    /// Create a context presenting to `window`.
    ///
    /// With `zero_copy` set the device must support DMA-BUF import,
    /// otherwise construction fails instead of silently degrading.
    pub fn new(x11: &X11Session, window: u32, zero_copy: bool) -> GpuResult<Self> {
        let entry = unsafe { Entry::load()? };
        let instance = create_instance(&entry)?;
        let surface_loader = surface::Instance::new(&entry, &instance);

        let surface_info = vk::XcbSurfaceCreateInfoKHR::default()
            .connection(x11.raw_xcb_connection().cast())
            .window(window);
        let xcb_loader = xcb_surface::Instance::new(&entry, &instance);
        let surface = match unsafe { xcb_loader.create_xcb_surface(&surface_info, None) } {
            Ok(surface) => surface,
            Err(result) => {
                unsafe { instance.destroy_instance(None) };
                return Err(GpuError::Vulkan {
                    call: "vkCreateXcbSurfaceKHR",
                    result,
                });
            }
        };

        let device_parts = pick_device(&instance, &surface_loader, surface, zero_copy)
            .and_then(|candidate| create_device(&instance, candidate, zero_copy));
        let (physical_device, device, queue_family, capabilities) = match device_parts {
            Ok(parts) => parts,
            Err(e) => {
                unsafe {
                    surface_loader.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let external_memory_fd = capabilities
            .external_memory_dma_buf
            .then(|| external_memory_fd::Device::new(&instance, &device));

        Ok(Self {
            _entry: entry,
            instance,
            surface_loader,
            surface,
            physical_device,
            device,
            queue,
            queue_family,
            memory_properties,
            capabilities,
            external_memory_fd,
        })
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    pub fn external_memory_fd(&self) -> Option<&external_memory_fd::Device> {
        self.external_memory_fd.as_ref()
    }

    pub fn surface_capabilities(&self) -> GpuResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }
        .vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")
    }

    /// Current extent of the destination surface. `u32::MAX` in both
    /// dimensions means the surface adopts the swapchain's extent.
    pub fn surface_extent(&self) -> GpuResult<Extent> {
        let current = self.surface_capabilities()?.current_extent;
        Ok(Extent::new(current.width, current.height))
    }

    /// Surface extent query that can run on another thread. It returns
    /// `None` when the extent is undefined or the query fails, and must not
    /// be called after the context is dropped.
    pub fn extent_probe(&self) -> impl FnMut() -> Option<Extent> + Send + 'static {
        let loader = self.surface_loader.clone();
        let physical_device = self.physical_device;
        let surface = self.surface;
        move || {
            let caps = unsafe {
                loader.get_physical_device_surface_capabilities(physical_device, surface)
            }
            .ok()?;
            let current = caps.current_extent;
            (current.width != u32::MAX).then(|| Extent::new(current.width, current.height))
        }
    }

    pub fn format_features(&self, format: vk::Format) -> vk::FormatFeatureFlags {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
        .optimal_tiling_features
    }

    pub fn wait_idle(&self) -> GpuResult<()> {
        unsafe { self.device.device_wait_idle() }.vk("vkDeviceWaitIdle")
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("device did not go idle before teardown: {e}");
            }
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

fn create_instance(entry: &Entry) -> GpuResult<Instance> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(c"winmirror")
        .application_version(0)
        .engine_name(c"winmirror")
        .engine_version(0)
        .api_version(vk::API_VERSION_1_1);

    let available = unsafe { entry.enumerate_instance_extension_properties(None) }
        .vk("vkEnumerateInstanceExtensionProperties")?;
    let required = [surface::NAME, xcb_surface::NAME];
    for name in required {
        if !has_extension(&available, name) {
            return Err(GpuError::MissingExtension(name.to_string_lossy().into_owned()));
        }
    }

    let extension_names = required.map(CStr::as_ptr);
    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names);

    unsafe { entry.create_instance(&create_info, None) }.vk("vkCreateInstance")
}

fn pick_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    zero_copy: bool,
) -> GpuResult<Candidate> {
    let physical_devices =
        unsafe { instance.enumerate_physical_devices() }.vk("vkEnumeratePhysicalDevices")?;

    let mut candidates = Vec::new();
    for physical_device in physical_devices {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .vk("vkEnumerateDeviceExtensionProperties")?;
        if !has_extension(&extensions, ash::khr::swapchain::NAME) {
            log::debug!("skipping {name}: no swapchain support");
            continue;
        }
        if zero_copy && !supports_dma_buf_import(&extensions) {
            log::debug!("skipping {name}: no DMA-BUF import");
            continue;
        }

        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_family = find_queue_family(&families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(physical_device, index, surface)
                .unwrap_or(false)
        });
        let Some(queue_family) = queue_family else {
            log::debug!("skipping {name}: no queue can present to the surface");
            continue;
        };

        candidates.push(Candidate {
            physical_device,
            queue_family,
            rank: device_rank(properties.device_type),
            name,
            extensions,
        });
    }

    candidates
        .into_iter()
        .min_by_key(|c| c.rank)
        .ok_or_else(|| {
            let need = if zero_copy {
                "graphics queue with present and DMA-BUF import"
            } else {
                "graphics queue with present"
            };
            GpuError::NoSuitableDevice(format!("no device offers a {need}"))
        })
}

fn supports_dma_buf_import(extensions: &[vk::ExtensionProperties]) -> bool {
    has_extension(extensions, external_memory_fd::NAME)
        && has_extension(extensions, ash::ext::external_memory_dma_buf::NAME)
}

fn create_device(
    instance: &Instance,
    candidate: Candidate,
    zero_copy: bool,
) -> GpuResult<(vk::PhysicalDevice, Device, u32, DeviceCapabilities)> {
    let mut capabilities = DeviceCapabilities::default();
    let mut extension_names = vec![ash::khr::swapchain::NAME.as_ptr()];

    if zero_copy {
        if !supports_dma_buf_import(&candidate.extensions) {
            return Err(GpuError::MissingExtension(
                ash::ext::external_memory_dma_buf::NAME
                    .to_string_lossy()
                    .into_owned(),
            ));
        }
        extension_names.push(external_memory_fd::NAME.as_ptr());
        extension_names.push(ash::ext::external_memory_dma_buf::NAME.as_ptr());
        capabilities.external_memory_dma_buf = true;

        if has_extension(&candidate.extensions, ash::ext::image_drm_format_modifier::NAME)
            && has_extension(&candidate.extensions, ash::khr::image_format_list::NAME)
        {
            extension_names.push(ash::ext::image_drm_format_modifier::NAME.as_ptr());
            extension_names.push(ash::khr::image_format_list::NAME.as_ptr());
            capabilities.drm_format_modifier = true;
        }
    }

    let priorities = [1.0];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(candidate.queue_family)
        .queue_priorities(&priorities);
    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&extension_names);

    let device = unsafe { instance.create_device(candidate.physical_device, &device_info, None) }
        .vk("vkCreateDevice")?;

    log::info!(
        "using {} (queue family {}, {:?})",
        candidate.name,
        candidate.queue_family,
        capabilities
    );
    Ok((
        candidate.physical_device,
        device,
        candidate.queue_family,
        capabilities,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn test_discrete_gpu_preferred() {
        let mut types = [
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
        ];
        types.sort_by_key(|t| device_rank(*t));
        assert_eq!(types[0], vk::PhysicalDeviceType::DISCRETE_GPU);
        assert_eq!(types[2], vk::PhysicalDeviceType::CPU);
    }

    #[test]
    fn test_queue_family_needs_graphics_and_present() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 4),
        ];

        assert_eq!(find_queue_family(&families, |_| true), Some(1));
        assert_eq!(
            find_queue_family(&families, |index| index == 2),
            Some(2),
            "family 1 cannot present"
        );
        assert_eq!(find_queue_family(&families, |index| index == 0), None);
    }

    #[test]
    fn test_empty_queue_family_skipped() {
        let families = [family(vk::QueueFlags::GRAPHICS, 0)];
        assert_eq!(find_queue_family(&families, |_| true), None);
    }
}
