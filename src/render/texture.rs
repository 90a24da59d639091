//! GPU images holding captured source pixels
//!
//! [`UploadTexture`] is refreshed every frame from host memory through a
//! persistently mapped staging buffer. [`ImportedTexture`] wraps a DMA-BUF
//! exported by the X server and is only recreated when the window size
//! changes.

use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::ptr::NonNull;

use ash::{vk, Device};

use crate::error::{GpuError, GpuResult, VkResultExt};
use crate::geometry::Extent;
use crate::linux::{CapturedFrame, DmaBufFrame, HostFrame};
use crate::render::bootstrap::GpuContext;
use crate::render::memory::find_memory_type;

/// Pixel layout of X11 depth 24/32 visuals on little-endian hosts
pub const SOURCE_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

const DRM_FORMAT_MOD_LINEAR: u64 = 0;
const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// What the recorder must do to a source image before blitting from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourcePrep {
    /// Copy the staging buffer into the image first
    Upload { buffer: vk::Buffer },
    /// Memory already holds the pixels
    Imported,
}

pub fn blit_filter(features: vk::FormatFeatureFlags) -> vk::Filter {
    if features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
        vk::Filter::LINEAR
    } else {
        vk::Filter::NEAREST
    }
}

/// Vulkan format for an X11 pixmap of the given depth and bits per pixel
pub fn format_for_depth(depth: u8, bits_per_pixel: u8) -> GpuResult<vk::Format> {
    match (depth, bits_per_pixel) {
        (24 | 32, 32) => Ok(SOURCE_FORMAT),
        _ => Err(GpuError::UnsupportedFormat(format!(
            "depth {depth} at {bits_per_pixel} bits per pixel"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportTiling {
    /// Explicit DRM modifier with the exported plane layout
    Modifier(u64),
    Linear,
}

/// Pick how an exported buffer can be described to Vulkan
pub fn import_tiling(
    modifier: Option<u64>,
    offset: u32,
    modifier_ext: bool,
) -> GpuResult<ImportTiling> {
    let modifier = modifier.filter(|&m| m != DRM_FORMAT_MOD_INVALID);
    match modifier {
        Some(m) if modifier_ext => Ok(ImportTiling::Modifier(m)),
        None | Some(DRM_FORMAT_MOD_LINEAR) => {
            if offset != 0 {
                return Err(GpuError::UnsupportedFormat(format!(
                    "linear buffer at offset {offset} needs VK_EXT_image_drm_format_modifier"
                )));
            }
            Ok(ImportTiling::Linear)
        }
        Some(m) => Err(GpuError::UnsupportedFormat(format!(
            "tiled buffer with modifier {m:#x} needs VK_EXT_image_drm_format_modifier"
        ))),
    }
}

/// Device-local image plus a host-visible staging buffer mapped once
pub struct UploadTexture {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    buffer: vk::Buffer,
    buffer_memory: vk::DeviceMemory,
    mapped: Option<NonNull<u8>>,
    size: usize,
    extent: Extent,
    filter: vk::Filter,
}

impl UploadTexture {
    pub fn new(gpu: &GpuContext, extent: Extent) -> GpuResult<Self> {
        let size = extent.width as usize * extent.height as usize * 4;
        let mut texture = Self {
            device: gpu.device().clone(),
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            buffer: vk::Buffer::null(),
            buffer_memory: vk::DeviceMemory::null(),
            mapped: None,
            size,
            extent,
            filter: blit_filter(gpu.format_features(SOURCE_FORMAT)),
        };
        let device = gpu.device();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(SOURCE_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        texture.image = unsafe { device.create_image(&image_info, None) }.vk("vkCreateImage")?;

        let requirements = unsafe { device.get_image_memory_requirements(texture.image) };
        let memory_type = find_memory_type(
            gpu.memory_properties(),
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        texture.memory =
            unsafe { device.allocate_memory(&alloc_info, None) }.vk("vkAllocateMemory")?;
        unsafe { device.bind_image_memory(texture.image, texture.memory, 0) }
            .vk("vkBindImageMemory")?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size as vk::DeviceSize)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        texture.buffer = unsafe { device.create_buffer(&buffer_info, None) }.vk("vkCreateBuffer")?;

        let requirements = unsafe { device.get_buffer_memory_requirements(texture.buffer) };
        let memory_type = find_memory_type(
            gpu.memory_properties(),
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        texture.buffer_memory =
            unsafe { device.allocate_memory(&alloc_info, None) }.vk("vkAllocateMemory")?;
        unsafe { device.bind_buffer_memory(texture.buffer, texture.buffer_memory, 0) }
            .vk("vkBindBufferMemory")?;

        let ptr = unsafe {
            device.map_memory(
                texture.buffer_memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        }
        .vk("vkMapMemory")?;
        texture.mapped = NonNull::new(ptr.cast());

        log::debug!(
            "upload texture {}x{} ({} bytes staging)",
            extent.width,
            extent.height,
            size
        );
        Ok(texture)
    }

    /// Copy a frame into the staging buffer. The caller must have waited
    /// for the previous submission that reads the buffer.
    pub fn upload(&mut self, frame: &HostFrame<'_>) -> GpuResult<()> {
        let layout = frame.layout();
        if layout.bytes_per_pixel != 4 {
            return Err(GpuError::UnsupportedFormat(format!(
                "{} bytes per pixel",
                layout.bytes_per_pixel
            )));
        }
        if layout.extent() != self.extent || frame.bytes().len() != self.size {
            return Err(GpuError::UnsupportedFormat(format!(
                "{}x{} frame for a {}x{} texture",
                layout.width, layout.height, self.extent.width, self.extent.height
            )));
        }

        let Some(mapped) = self.mapped else {
            return Err(GpuError::Vulkan {
                call: "vkMapMemory",
                result: vk::Result::ERROR_MEMORY_MAP_FAILED,
            });
        };
        unsafe {
            std::ptr::copy_nonoverlapping(frame.bytes().as_ptr(), mapped.as_ptr(), self.size);
        }
        Ok(())
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn filter(&self) -> vk::Filter {
        self.filter
    }
}

impl Drop for UploadTexture {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.take().is_some() {
                self.device.unmap_memory(self.buffer_memory);
            }
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.buffer_memory, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Image backed by an imported DMA-BUF
pub struct ImportedTexture {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    extent: Extent,
    filter: vk::Filter,
}

impl ImportedTexture {
    /// Import `frame`. Ownership of its fd passes to the driver on success.
    pub fn import(gpu: &GpuContext, frame: DmaBufFrame) -> GpuResult<Self> {
        let fd_loader = gpu.external_memory_fd().ok_or_else(|| {
            GpuError::MissingExtension(
                ash::khr::external_memory_fd::NAME
                    .to_string_lossy()
                    .into_owned(),
            )
        })?;
        let DmaBufFrame {
            fd,
            width,
            height,
            stride,
            offset,
            modifier,
            depth,
            bits_per_pixel,
        } = frame;

        let format = format_for_depth(depth, bits_per_pixel)?;
        let tiling = import_tiling(modifier, offset, gpu.capabilities().drm_format_modifier)?;
        let extent = Extent::new(width, height);

        let mut texture = Self {
            device: gpu.device().clone(),
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            extent,
            filter: blit_filter(gpu.format_features(format)),
        };
        let device = gpu.device();

        let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let plane_layout = vk::SubresourceLayout {
            offset: offset as vk::DeviceSize,
            size: 0,
            row_pitch: stride as vk::DeviceSize,
            array_pitch: 0,
            depth_pitch: 0,
        };
        let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
            .plane_layouts(std::slice::from_ref(&plane_layout));

        let mut image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .usage(vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external_info);
        match tiling {
            ImportTiling::Modifier(m) => {
                modifier_info = modifier_info.drm_format_modifier(m);
                image_info = image_info
                    .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
                    .push_next(&mut modifier_info);
            }
            ImportTiling::Linear => {
                image_info = image_info.tiling(vk::ImageTiling::LINEAR);
            }
        }
        texture.image = unsafe { device.create_image(&image_info, None) }.vk("vkCreateImage")?;

        if tiling == ImportTiling::Linear {
            let subresource = vk::ImageSubresource::default().aspect_mask(vk::ImageAspectFlags::COLOR);
            let layout = unsafe { device.get_image_subresource_layout(texture.image, subresource) };
            if layout.row_pitch != stride as vk::DeviceSize {
                return Err(GpuError::UnsupportedFormat(format!(
                    "exported stride {stride} differs from the driver's linear pitch {}",
                    layout.row_pitch
                )));
            }
        }

        let requirements = unsafe { device.get_image_memory_requirements(texture.image) };
        let mut fd_properties = vk::MemoryFdPropertiesKHR::default();
        unsafe {
            fd_loader.get_memory_fd_properties(
                vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                fd.as_raw_fd(),
                &mut fd_properties,
            )
        }
        .vk("vkGetMemoryFdPropertiesKHR")?;

        let memory_type_index = find_memory_type(
            gpu.memory_properties(),
            requirements.memory_type_bits & fd_properties.memory_type_bits,
            vk::MemoryPropertyFlags::empty(),
        )?;

        let raw_fd = fd.into_raw_fd();
        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(raw_fd);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().image(texture.image);
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut import_info)
            .push_next(&mut dedicated_info);

        texture.memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(result) => {
                // The driver only takes the fd on success
                drop(unsafe { OwnedFd::from_raw_fd(raw_fd) });
                return Err(GpuError::Vulkan {
                    call: "vkAllocateMemory",
                    result,
                });
            }
        };
        unsafe { device.bind_image_memory(texture.image, texture.memory, 0) }
            .vk("vkBindImageMemory")?;

        log::debug!(
            "imported {}x{} dma-buf as {:?} ({:?}), memory type {}",
            width,
            height,
            format,
            tiling,
            memory_type_index
        );
        Ok(texture)
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn filter(&self) -> vk::Filter {
        self.filter
    }
}

impl Drop for ImportedTexture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// The binding of one source window on the GPU
pub enum SourceTexture {
    Upload(UploadTexture),
    Imported(ImportedTexture),
}

impl SourceTexture {
    pub fn image(&self) -> vk::Image {
        match self {
            Self::Upload(t) => t.image(),
            Self::Imported(t) => t.image(),
        }
    }

    pub fn extent(&self) -> Extent {
        match self {
            Self::Upload(t) => t.extent(),
            Self::Imported(t) => t.extent(),
        }
    }

    pub fn filter(&self) -> vk::Filter {
        match self {
            Self::Upload(t) => t.filter(),
            Self::Imported(t) => t.filter(),
        }
    }

    pub fn prep(&self) -> SourcePrep {
        match self {
            Self::Upload(t) => SourcePrep::Upload { buffer: t.buffer() },
            Self::Imported(_) => SourcePrep::Imported,
        }
    }

    /// Bind a freshly captured frame, reusing the existing texture when it
    /// still fits. Returns true when the image handle changed.
    ///
    /// The GPU must no longer be reading the current texture.
    pub fn bind(
        slot: &mut Option<SourceTexture>,
        gpu: &GpuContext,
        frame: CapturedFrame<'_>,
    ) -> GpuResult<bool> {
        match frame {
            CapturedFrame::Host(frame) => {
                if let Some(SourceTexture::Upload(texture)) = slot {
                    if texture.extent() == frame.layout().extent() {
                        texture.upload(&frame)?;
                        return Ok(false);
                    }
                }
                // Release the old texture before allocating its replacement
                *slot = None;
                let mut texture = UploadTexture::new(gpu, frame.layout().extent())?;
                texture.upload(&frame)?;
                *slot = Some(SourceTexture::Upload(texture));
                Ok(true)
            }
            CapturedFrame::Imported(frame) => {
                *slot = None;
                let texture = ImportedTexture::import(gpu, frame)?;
                *slot = Some(SourceTexture::Imported(texture));
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blit_filter_follows_format_features() {
        let linear = vk::FormatFeatureFlags::BLIT_SRC
            | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        assert_eq!(blit_filter(linear), vk::Filter::LINEAR);
        assert_eq!(blit_filter(vk::FormatFeatureFlags::BLIT_SRC), vk::Filter::NEAREST);
    }

    #[test]
    fn test_format_for_depth() {
        assert_eq!(format_for_depth(24, 32).unwrap(), SOURCE_FORMAT);
        assert_eq!(format_for_depth(32, 32).unwrap(), SOURCE_FORMAT);
        assert!(matches!(
            format_for_depth(16, 16),
            Err(GpuError::UnsupportedFormat(_))
        ));
        assert!(format_for_depth(30, 32).is_err(), "10-bit visuals are not handled");
    }

    #[test]
    fn test_import_tiling_with_modifier_extension() {
        assert_eq!(
            import_tiling(Some(0x0100_0000_0000_0001), 0, true).unwrap(),
            ImportTiling::Modifier(0x0100_0000_0000_0001)
        );
        assert_eq!(
            import_tiling(Some(DRM_FORMAT_MOD_LINEAR), 64, true).unwrap(),
            ImportTiling::Modifier(DRM_FORMAT_MOD_LINEAR),
            "explicit layout can carry an offset"
        );
        assert_eq!(import_tiling(None, 0, true).unwrap(), ImportTiling::Linear);
    }

    #[test]
    fn test_import_tiling_without_modifier_extension() {
        assert_eq!(import_tiling(None, 0, false).unwrap(), ImportTiling::Linear);
        assert_eq!(
            import_tiling(Some(DRM_FORMAT_MOD_INVALID), 0, false).unwrap(),
            ImportTiling::Linear
        );
        assert!(import_tiling(Some(0x0100_0000_0000_0001), 0, false).is_err());
        assert!(import_tiling(None, 4096, false).is_err());
    }
}
