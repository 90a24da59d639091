//! Per-swapchain-image command buffers that composite the sources
//!
//! Recording happens in two passes. [`plan_frames`] turns the current
//! swapchain and source bindings into a list of [`Step`]s per image, and
//! [`CommandRecorder::record`] emits those steps as Vulkan commands.

use ash::{vk, Device};

use crate::error::{GpuResult, VkResultExt};
use crate::geometry::{BlitRegion, Extent, Layout, Point, Rect, WindowGeometry};
use crate::render::bootstrap::GpuContext;
use crate::render::swapchain::Swapchain;
use crate::render::texture::SourcePrep;

/// A bound source as seen by the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceBinding {
    pub image: vk::Image,
    pub extent: Extent,
    pub geometry: WindowGeometry,
    /// Where the window contents start inside the image
    pub src_offset: Point,
    pub prep: SourcePrep,
    pub filter: vk::Filter,
}

/// Everything recorded command buffers depend on. A change in any field
/// forces a re-record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKey {
    pub generation: u64,
    pub surface_extent: Extent,
    pub sources: Vec<SourceBinding>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Barrier {
        image: vk::Image,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },
    Clear {
        image: vk::Image,
        color: [f32; 4],
    },
    CopyBufferToImage {
        buffer: vk::Buffer,
        image: vk::Image,
        extent: Extent,
    },
    Blit {
        src: vk::Image,
        dst: vk::Image,
        region: BlitRegion,
        filter: vk::Filter,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlan {
    pub generation: u64,
    pub image_index: u32,
    pub image: vk::Image,
    pub steps: Vec<Step>,
}

/// Plan the command sequence for every image of `swapchain`
pub fn plan_frames(
    swapchain: &Swapchain,
    surface_extent: Extent,
    sources: &[SourceBinding],
    layout: Layout,
    clear_color: Option<[f32; 4]>,
) -> Vec<ImagePlan> {
    swapchain
        .images
        .iter()
        .enumerate()
        .map(|(index, &image)| {
            let mut steps = vec![Step::Barrier {
                image,
                from: vk::ImageLayout::UNDEFINED,
                to: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            }];
            // Destination areas written since the last write-to-write barrier
            let mut unsynced: Vec<Rect> = Vec::new();
            if let Some(color) = clear_color {
                steps.push(Step::Clear { image, color });
                unsynced.push(Rect::new(0, 0, swapchain.extent.width, swapchain.extent.height));
            }

            for source in sources {
                let Some(region) =
                    BlitRegion::compute(&source.geometry, layout, surface_extent, swapchain.extent)
                else {
                    continue;
                };
                let region = clip_to_image(region, source);
                if region.src.is_empty() || region.dst.is_empty() {
                    continue;
                }

                match source.prep {
                    SourcePrep::Upload { buffer } => {
                        steps.push(Step::Barrier {
                            image: source.image,
                            from: vk::ImageLayout::UNDEFINED,
                            to: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        });
                        steps.push(Step::CopyBufferToImage {
                            buffer,
                            image: source.image,
                            extent: source.extent,
                        });
                        steps.push(Step::Barrier {
                            image: source.image,
                            from: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            to: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        });
                    }
                    SourcePrep::Imported => steps.push(Step::Barrier {
                        image: source.image,
                        from: vk::ImageLayout::UNDEFINED,
                        to: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    }),
                }
                if unsynced.iter().any(|w| w.intersect(&region.dst).is_some()) {
                    steps.push(Step::Barrier {
                        image,
                        from: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        to: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    });
                    unsynced.clear();
                }
                unsynced.push(region.dst);
                steps.push(Step::Blit {
                    src: source.image,
                    dst: image,
                    region,
                    filter: source.filter,
                });
            }

            steps.push(Step::Barrier {
                image,
                from: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                to: vk::ImageLayout::PRESENT_SRC_KHR,
            });

            ImagePlan {
                generation: swapchain.generation,
                image_index: index as u32,
                image,
                steps,
            }
        })
        .collect()
}

/// Shift the source rectangle into image coordinates and keep it inside
/// the image, in case the window grew since the texture was bound. The
/// destination shrinks by the same proportion so the scale is unchanged.
fn clip_to_image(region: BlitRegion, source: &SourceBinding) -> BlitRegion {
    let shifted = Rect::new(
        region.src.origin.x + source.src_offset.x,
        region.src.origin.y + source.src_offset.y,
        region.src.width,
        region.src.height,
    );
    let bounds = Rect::new(0, 0, source.extent.width, source.extent.height);
    let Some(src) = shifted.intersect(&bounds) else {
        return BlitRegion::default();
    };
    if src == shifted {
        return BlitRegion { src, dst: region.dst };
    }

    let (x, width) = scale_span(
        region.dst.origin.x,
        region.dst.width,
        src.origin.x as i64 - shifted.origin.x as i64,
        src.width,
        shifted.width,
    );
    let (y, height) = scale_span(
        region.dst.origin.y,
        region.dst.height,
        src.origin.y as i64 - shifted.origin.y as i64,
        src.height,
        shifted.height,
    );
    BlitRegion {
        src,
        dst: Rect::new(x, y, width, height),
    }
}

/// Map the source span `[skip, skip + len)` of `src_len` onto a
/// destination span of `dst_len` starting at `dst_origin`
fn scale_span(dst_origin: i32, dst_len: u32, skip: i64, len: u32, src_len: u32) -> (i32, u32) {
    if src_len == 0 {
        return (dst_origin, 0);
    }
    let scale = |v: i64| v * dst_len as i64 / src_len as i64;
    let start = scale(skip);
    let end = scale(skip + len as i64);
    (dst_origin + start as i32, (end - start) as u32)
}

/// Access masks and pipeline stages for a layout transition
pub fn barrier_masks(
    from: vk::ImageLayout,
    to: vk::ImageLayout,
) -> (
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
) {
    use vk::ImageLayout as L;
    match (from, to) {
        // Chains with the acquire semaphore, which is waited at TRANSFER
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (L::UNDEFINED, L::TRANSFER_SRC_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        ),
        // Orders successive writes into the destination image
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::PRESENT_SRC_KHR) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        _ => (
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1)
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .layer_count(1)
}

fn rect_offsets(rect: &Rect) -> [vk::Offset3D; 2] {
    [
        vk::Offset3D {
            x: rect.origin.x,
            y: rect.origin.y,
            z: 0,
        },
        vk::Offset3D {
            x: rect.right() as i32,
            y: rect.bottom() as i32,
            z: 1,
        },
    ]
}

/// Owns the command pool and one reusable buffer per swapchain image
pub struct CommandRecorder<'a> {
    device: &'a Device,
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    key: Option<RecordKey>,
}

impl<'a> CommandRecorder<'a> {
    pub fn new(gpu: &'a GpuContext) -> GpuResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(gpu.queue_family())
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { gpu.device().create_command_pool(&pool_info, None) }
            .vk("vkCreateCommandPool")?;

        Ok(Self {
            device: gpu.device(),
            pool,
            buffers: Vec::new(),
            key: None,
        })
    }

    pub fn needs_record(&self, key: &RecordKey) -> bool {
        self.key.as_ref() != Some(key)
    }

    /// Forget the recorded key so the next check re-records
    pub fn invalidate(&mut self) {
        self.key = None;
    }

    pub fn buffer(&self, image_index: u32) -> Option<vk::CommandBuffer> {
        self.buffers.get(image_index as usize).copied()
    }

    /// Re-record every buffer from `plans`. The device must not be
    /// executing any of them.
    pub fn record(&mut self, plans: &[ImagePlan], key: RecordKey) -> GpuResult<()> {
        self.key = None;
        if self.buffers.len() != plans.len() {
            self.reallocate(plans.len() as u32)?;
        }

        for (&cmd, plan) in self.buffers.iter().zip(plans) {
            unsafe {
                self.device
                    .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                    .vk("vkResetCommandBuffer")?;
                // Reused across frames, never pending twice
                let begin = vk::CommandBufferBeginInfo::default();
                self.device
                    .begin_command_buffer(cmd, &begin)
                    .vk("vkBeginCommandBuffer")?;
                for step in &plan.steps {
                    self.emit(cmd, step);
                }
                self.device
                    .end_command_buffer(cmd)
                    .vk("vkEndCommandBuffer")?;
            }
        }

        log::debug!(
            "recorded {} command buffers for generation {}",
            plans.len(),
            key.generation
        );
        self.key = Some(key);
        Ok(())
    }

    fn reallocate(&mut self, count: u32) -> GpuResult<()> {
        if !self.buffers.is_empty() {
            unsafe { self.device.free_command_buffers(self.pool, &self.buffers) };
            self.buffers.clear();
        }
        if count == 0 {
            return Ok(());
        }

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        self.buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .vk("vkAllocateCommandBuffers")?;
        Ok(())
    }

    unsafe fn emit(&self, cmd: vk::CommandBuffer, step: &Step) {
        match *step {
            Step::Barrier { image, from, to } => {
                let (src_access, dst_access, src_stage, dst_stage) = barrier_masks(from, to);
                let barrier = vk::ImageMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .old_layout(from)
                    .new_layout(to)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(color_range());
                self.device.cmd_pipeline_barrier(
                    cmd,
                    src_stage,
                    dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
            Step::Clear { image, color } => {
                let value = vk::ClearColorValue { float32: color };
                self.device.cmd_clear_color_image(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &value,
                    &[color_range()],
                );
            }
            Step::CopyBufferToImage {
                buffer,
                image,
                extent,
            } => {
                let region = vk::BufferImageCopy::default()
                    .image_subresource(color_layers())
                    .image_extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    });
                self.device.cmd_copy_buffer_to_image(
                    cmd,
                    buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            Step::Blit {
                src,
                dst,
                region,
                filter,
            } => {
                let blit = vk::ImageBlit::default()
                    .src_subresource(color_layers())
                    .src_offsets(rect_offsets(&region.src))
                    .dst_subresource(color_layers())
                    .dst_offsets(rect_offsets(&region.dst));
                self.device.cmd_blit_image(
                    cmd,
                    src,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    filter,
                );
            }
        }
    }
}

impl Drop for CommandRecorder<'_> {
    fn drop(&mut self) {
        // Destroying the pool frees its buffers
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn swapchain(generation: u64, images: u64, extent: Extent) -> Swapchain {
        Swapchain {
            handle: vk::SwapchainKHR::from_raw(generation),
            images: (0..images)
                .map(|i| vk::Image::from_raw(generation * 100 + i + 1))
                .collect(),
            extent,
            generation,
        }
    }

    fn source(prep: SourcePrep, width: u32, height: u32) -> SourceBinding {
        SourceBinding {
            image: vk::Image::from_raw(0xabc),
            extent: Extent::new(width, height),
            geometry: WindowGeometry {
                origin: Point { x: 0, y: 0 },
                width,
                height,
                border: 0,
            },
            src_offset: Point::default(),
            prep,
            filter: vk::Filter::LINEAR,
        }
    }

    fn upload() -> SourcePrep {
        SourcePrep::Upload {
            buffer: vk::Buffer::from_raw(0xb0f),
        }
    }

    fn position(steps: &[Step], pred: impl Fn(&Step) -> bool) -> usize {
        steps.iter().position(pred).expect("step missing")
    }

    #[test]
    fn test_upload_sequence_order() {
        let extent = Extent::new(1024, 768);
        let chain = swapchain(1, 3, extent);
        let src = source(upload(), 800, 600);

        let plans = plan_frames(&chain, extent, &[src], Layout::Stretch, Some([0.0, 0.0, 0.0, 1.0]));
        let steps = &plans[0].steps;

        let copy = position(steps, |s| matches!(s, Step::CopyBufferToImage { .. }));
        let to_src = position(steps, |s| {
            matches!(s, Step::Barrier { to, .. } if *to == vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        });
        let blit = position(steps, |s| matches!(s, Step::Blit { .. }));
        let clear = position(steps, |s| matches!(s, Step::Clear { .. }));

        assert!(matches!(
            steps[0],
            Step::Barrier { from: vk::ImageLayout::UNDEFINED, to: vk::ImageLayout::TRANSFER_DST_OPTIMAL, .. }
        ));
        assert!(clear < copy, "clear before sources");
        assert!(copy < to_src && to_src < blit, "copy barrier must precede the blit");
        assert!(matches!(
            steps.last(),
            Some(Step::Barrier { to: vk::ImageLayout::PRESENT_SRC_KHR, .. })
        ));
    }

    fn is_dst_to_dst(step: &Step, target: vk::Image) -> bool {
        matches!(
            step,
            Step::Barrier {
                image,
                from: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                to: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            } if *image == target
        )
    }

    #[test]
    fn test_imported_source_needs_only_one_barrier() {
        let extent = Extent::new(1024, 768);
        let chain = swapchain(1, 2, extent);
        let src = source(SourcePrep::Imported, 800, 600);

        let plans = plan_frames(&chain, extent, &[src], Layout::Stretch, None);
        let source_barriers: Vec<_> = plans[0]
            .steps
            .iter()
            .filter(|s| matches!(s, Step::Barrier { image, .. } if *image == src.image))
            .collect();
        assert_eq!(source_barriers.len(), 1);
        assert!(matches!(
            source_barriers[0],
            Step::Barrier { from: vk::ImageLayout::UNDEFINED, to: vk::ImageLayout::TRANSFER_SRC_OPTIMAL, .. }
        ));
        assert!(!plans[0]
            .steps
            .iter()
            .any(|s| matches!(s, Step::CopyBufferToImage { .. } | Step::Clear { .. })));
        assert!(
            !plans[0].steps.iter().any(|s| is_dst_to_dst(s, plans[0].image)),
            "a single blit needs no write-to-write barrier"
        );
    }

    #[test]
    fn test_clear_is_ordered_before_blit() {
        let extent = Extent::new(1024, 768);
        let chain = swapchain(1, 2, extent);
        let src = source(SourcePrep::Imported, 800, 600);

        let plans = plan_frames(&chain, extent, &[src], Layout::Stretch, Some([0.0, 0.0, 0.0, 1.0]));
        let plan = &plans[0];
        let clear = position(&plan.steps, |s| matches!(s, Step::Clear { .. }));
        let sync = position(&plan.steps, |s| is_dst_to_dst(s, plan.image));
        let blit = position(&plan.steps, |s| matches!(s, Step::Blit { .. }));
        assert!(clear < sync && sync < blit);
    }

    #[test]
    fn test_overlapping_blits_are_ordered() {
        let extent = Extent::new(1024, 768);
        let chain = swapchain(1, 1, extent);
        let first = source(upload(), 300, 300);
        let mut second = source(SourcePrep::Imported, 300, 300);
        second.image = vk::Image::from_raw(0xdef);
        second.geometry.origin = Point { x: 200, y: 200 };

        let plans = plan_frames(&chain, extent, &[first, second], Layout::Mirror, None);
        let steps = &plans[0].steps;
        let blits: Vec<_> = steps
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Step::Blit { .. }))
            .map(|(i, _)| i)
            .collect();
        let sync = position(steps, |s| is_dst_to_dst(s, plans[0].image));
        assert_eq!(blits.len(), 2);
        assert!(blits[0] < sync && sync < blits[1]);

        second.geometry.origin = Point { x: 600, y: 400 };
        let plans = plan_frames(&chain, extent, &[first, second], Layout::Mirror, None);
        assert!(
            !plans[0].steps.iter().any(|s| is_dst_to_dst(s, plans[0].image)),
            "disjoint destinations need no barrier"
        );
    }

    #[test]
    fn test_clipped_source_keeps_scale() {
        let extent = Extent::new(1024, 768);
        let chain = swapchain(1, 1, extent);
        // Window grew to 800x600 but the texture is still 400x300
        let mut src = source(upload(), 800, 600);
        src.extent = Extent::new(400, 300);

        let plans = plan_frames(&chain, extent, &[src], Layout::Stretch, None);
        let region = plans[0]
            .steps
            .iter()
            .find_map(|s| match s {
                Step::Blit { region, .. } => Some(*region),
                _ => None,
            })
            .unwrap();
        assert_eq!(region.src, Rect::new(0, 0, 400, 300));
        assert_eq!(region.dst, Rect::new(0, 0, 512, 384));
    }

    #[test]
    fn test_scale_span() {
        assert_eq!(scale_span(0, 1024, 0, 400, 800), (0, 512));
        assert_eq!(scale_span(10, 200, 50, 50, 100), (110, 100));
        assert_eq!(scale_span(5, 100, 0, 0, 0), (5, 0));
    }

    #[test]
    fn test_one_plan_per_image_of_current_generation() {
        let extent = Extent::new(1024, 768);
        let src = source(upload(), 800, 600);

        let old = swapchain(1, 3, extent);
        let plans = plan_frames(&old, extent, &[src], Layout::Stretch, None);
        assert_eq!(plans.len(), 3);

        let new = swapchain(2, 4, Extent::new(1280, 720));
        let plans = plan_frames(&new, Extent::new(1280, 720), &[src], Layout::Stretch, None);
        assert_eq!(plans.len(), 4, "one buffer per new image");
        for plan in &plans {
            assert_eq!(plan.generation, 2);
            assert!(!old.images.contains(&plan.image), "stale image referenced");
            assert_eq!(plan.image, new.images[plan.image_index as usize]);
        }
    }

    #[test]
    fn test_end_to_end_blit_region() {
        let extent = Extent::new(1024, 768);
        let chain = swapchain(1, 1, extent);
        let src = source(upload(), 800, 600);

        let plans = plan_frames(&chain, extent, &[src], Layout::Stretch, None);
        let region = plans[0]
            .steps
            .iter()
            .find_map(|s| match s {
                Step::Blit { region, .. } => Some(*region),
                _ => None,
            })
            .unwrap();
        assert_eq!(region.src, Rect::new(0, 0, 800, 600));
        assert_eq!(region.dst, Rect::new(0, 0, 1024, 768));
    }

    #[test]
    fn test_blit_clamped_to_smaller_surface() {
        let chain = swapchain(1, 1, Extent::new(1024, 768));
        let src = source(upload(), 800, 600);

        let plans = plan_frames(&chain, Extent::new(640, 480), &[src], Layout::Stretch, None);
        for step in &plans[0].steps {
            if let Step::Blit { region, .. } = step {
                assert!(region.dst.right() <= 640 && region.dst.bottom() <= 480);
            }
        }
    }

    #[test]
    fn test_border_offset_shifts_source() {
        let extent = Extent::new(1024, 768);
        let chain = swapchain(1, 1, extent);
        let mut src = source(SourcePrep::Imported, 104, 104);
        src.geometry.width = 100;
        src.geometry.height = 100;
        src.geometry.border = 2;
        src.src_offset = Point { x: 2, y: 2 };

        let plans = plan_frames(&chain, extent, &[src], Layout::Mirror, None);
        let region = plans[0]
            .steps
            .iter()
            .find_map(|s| match s {
                Step::Blit { region, .. } => Some(*region),
                _ => None,
            })
            .unwrap();
        assert_eq!(region.src, Rect::new(2, 2, 100, 100));
        assert_eq!(region.dst, Rect::new(0, 0, 100, 100));
    }

    #[test]
    fn test_invisible_source_is_skipped() {
        let extent = Extent::new(1024, 768);
        let chain = swapchain(1, 1, extent);
        let mut src = source(upload(), 100, 100);
        src.geometry.origin = Point { x: 5000, y: 5000 };

        let plans = plan_frames(&chain, extent, &[src], Layout::Mirror, None);
        assert_eq!(plans[0].steps.len(), 2, "only the two destination barriers");
    }

    #[test]
    fn test_record_key_changes() {
        let src = source(upload(), 800, 600);
        let key = RecordKey {
            generation: 1,
            surface_extent: Extent::new(1024, 768),
            sources: vec![src],
        };

        let mut moved = key.clone();
        moved.sources[0].geometry.origin.x = 10;
        assert_ne!(key, moved);

        let mut regenerated = key.clone();
        regenerated.generation = 2;
        assert_ne!(key, regenerated);

        let mut resized = key.clone();
        resized.surface_extent = Extent::new(800, 600);
        assert_ne!(key, resized);

        assert_eq!(key, key.clone());
    }

    #[test]
    fn test_barrier_masks() {
        let (src_access, dst_access, _, dst_stage) = barrier_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        assert_eq!(src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst_access, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(dst_stage, vk::PipelineStageFlags::TRANSFER);

        let (_, _, src_stage, _) = barrier_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(src_stage, vk::PipelineStageFlags::TRANSFER);

        let (src_access, dst_access, src_stage, dst_stage) = barrier_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(
            dst_access,
            vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::TRANSFER_READ
        );
        assert_eq!(src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(dst_stage, vk::PipelineStageFlags::TRANSFER);
    }
}
