//! Swapchain creation, negotiation and generation-tracked recreation

use ash::khr::swapchain;
use ash::vk;

use crate::error::{GpuError, GpuResult, VkResultExt};
use crate::geometry::Extent;
use crate::render::bootstrap::GpuContext;

/// One swapchain and its images. `generation` increases on every
/// recreation; anything recorded against an older generation is stale.
#[derive(Debug, Clone)]
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub extent: Extent,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainSettings {
    pub preferred_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub image_count: u32,
    /// Used when the surface leaves the extent up to the swapchain
    pub fallback_extent: Extent,
}

pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> GpuResult<vk::SurfaceFormatKHR> {
    match available {
        [] => Err(GpuError::UnsupportedFormat(
            "surface reports no formats".to_string(),
        )),
        // The surface has no preference at all
        [only] if only.format == vk::Format::UNDEFINED => Ok(preferred),
        _ => Ok(available
            .iter()
            .copied()
            .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
            .unwrap_or(available[0])),
    }
}

/// The preferred mode when available, otherwise FIFO which every surface
/// must support.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Clamp to `[min_image_count, max_image_count]`, where a maximum of zero
/// means unbounded.
pub fn clamp_image_count(desired: u32, caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = desired.max(caps.min_image_count);
    if caps.max_image_count == 0 {
        count
    } else {
        count.min(caps.max_image_count)
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, fallback: Extent) -> Extent {
    if caps.current_extent.width != u32::MAX {
        Extent::new(caps.current_extent.width, caps.current_extent.height)
    } else {
        Extent::new(
            fallback
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            fallback
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        )
    }
}

pub fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&mode| supported.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

fn choose_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

pub struct SwapchainManager<'a> {
    gpu: &'a GpuContext,
    loader: swapchain::Device,
    settings: SwapchainSettings,
    current: Option<Swapchain>,
    generation: u64,
}

impl<'a> SwapchainManager<'a> {
    /// Create the manager and, unless the surface is currently zero-sized,
    /// the first swapchain.
    pub fn new(gpu: &'a GpuContext, settings: SwapchainSettings) -> GpuResult<Self> {
        let mut manager = Self {
            gpu,
            loader: swapchain::Device::new(gpu.instance(), gpu.device()),
            settings,
            current: None,
            generation: 0,
        };
        manager.recreate()?;
        Ok(manager)
    }

    pub fn loader(&self) -> &swapchain::Device {
        &self.loader
    }

    pub fn current(&self) -> Option<&Swapchain> {
        self.current.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Build a new swapchain chained to the current one, then retire the
    /// old handle. Returns false when the surface has no area and the
    /// recreation was deferred.
    ///
    /// The caller must ensure the device no longer uses the old images.
    pub fn recreate(&mut self) -> GpuResult<bool> {
        let gpu = self.gpu;
        let caps = gpu.surface_capabilities()?;
        let fallback = self
            .current
            .as_ref()
            .map(|s| s.extent)
            .unwrap_or(self.settings.fallback_extent);
        let extent = choose_extent(&caps, fallback);
        if extent.is_empty() {
            log::debug!("surface has no area, deferring swapchain creation");
            return Ok(false);
        }

        if !caps
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST)
        {
            return Err(GpuError::UnsupportedUsage(vk::ImageUsageFlags::TRANSFER_DST));
        }

        let formats = unsafe {
            gpu.surface_loader()
                .get_physical_device_surface_formats(gpu.physical_device(), gpu.surface())
        }
        .vk("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let modes = unsafe {
            gpu.surface_loader()
                .get_physical_device_surface_present_modes(gpu.physical_device(), gpu.surface())
        }
        .vk("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

        let surface_format = choose_surface_format(&formats, self.settings.preferred_format)?;
        let present_mode = choose_present_mode(&modes, self.settings.present_mode);
        let min_image_count = clamp_image_count(self.settings.image_count, &caps);
        let old_swapchain = self
            .current
            .as_ref()
            .map(|s| s.handle)
            .unwrap_or_else(vk::SwapchainKHR::null);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(gpu.surface())
            .min_image_count(min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(vk::Extent2D {
                width: extent.width,
                height: extent.height,
            })
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(choose_transform(&caps))
            .composite_alpha(choose_composite_alpha(caps.supported_composite_alpha))
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe { self.loader.create_swapchain(&create_info, None) }
            .vk("vkCreateSwapchainKHR")?;
        let images = match unsafe { self.loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(result) => {
                unsafe { self.loader.destroy_swapchain(handle, None) };
                return Err(GpuError::Vulkan {
                    call: "vkGetSwapchainImagesKHR",
                    result,
                });
            }
        };

        if let Some(old) = self.current.take() {
            unsafe { self.loader.destroy_swapchain(old.handle, None) };
        }
        self.generation += 1;

        log::info!(
            "swapchain generation {}: {:?} / {:?}, {:?}, {}x{}, {} images (asked {})",
            self.generation,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            extent.width,
            extent.height,
            images.len(),
            min_image_count
        );

        self.current = Some(Swapchain {
            handle,
            images,
            extent,
            generation: self.generation,
        });
        Ok(true)
    }
}

impl Drop for SwapchainManager<'_> {
    fn drop(&mut self) {
        if let Some(current) = self.current.take() {
            unsafe { self.loader.destroy_swapchain(current.handle, None) };
        }
    }
}
