//! Capture-to-present pipelines
//!
//! [`Pipeline`] ties one capture strategy to the GPU side. The copy and
//! zero-copy flavours differ only in the [`FrameCapture`] they carry and
//! are chosen once, at construction, by [`build_renderer`].

use std::time::Duration;

use ash::vk;
use x11rb::protocol::xproto::Window;

use crate::config::{CaptureMode, MirrorConfig};
use crate::error::{CaptureError, CaptureResult, GpuError, GpuResult, Result, VkResultExt};
use crate::geometry::{Extent, Layout, Point, WindowGeometry};
use crate::linux::{
    Dri3Capture, FrameCapture, ShmCapture, SourceSurfaceHandle, WindowSystem, X11Session,
};
use crate::render::bootstrap::GpuContext;
use crate::render::extent::{ExtentWatcher, Handshake, HandshakeState, SharedExtent};
use crate::render::present::{
    AcquireOutcome, FrameStatus, FrameTarget, PresentOutcome, PresentationLoop,
};
use crate::render::recorder::{plan_frames, CommandRecorder, RecordKey, SourceBinding};
use crate::render::swapchain::{SwapchainManager, SwapchainSettings};
use crate::render::texture::{SourcePrep, SourceTexture};

/// A running mirror, driven one frame at a time by the caller
pub trait Renderer {
    /// Capture every source and present one frame
    fn draw(&mut self) -> Result<FrameStatus>;

    /// Pick up a pending surface resize from the extent watcher
    fn update(&mut self) -> Result<()>;

    fn frames_presented(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub swapchain: SwapchainSettings,
    pub layout: Layout,
    pub clear_color: Option<[f32; 4]>,
    pub acquire_timeout: Duration,
    pub refresh_interval: Option<Duration>,
}

impl PipelineSettings {
    pub fn from_config(config: &MirrorConfig, fallback_extent: Extent) -> Self {
        Self {
            swapchain: SwapchainSettings {
                preferred_format: config.format.vk(),
                present_mode: config.present_mode.vk(),
                image_count: config.image_count,
                fallback_extent,
            },
            layout: config.layout,
            clear_color: config.clear_color,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            refresh_interval: config.refresh_interval_ms.map(Duration::from_millis),
        }
    }
}

/// Size a bound texture was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoundSize {
    extent: Extent,
    border: u32,
}

impl BoundSize {
    fn of(geometry: &WindowGeometry) -> Self {
        Self {
            extent: geometry.extent(),
            border: geometry.border,
        }
    }
}

/// Whether a source has to be captured again this cycle. An unmapped
/// source fails even when its imported texture is still bound, since that
/// texture no longer shows the window.
fn needs_capture(
    zero_copy: bool,
    bound: Option<BoundSize>,
    surface: &SourceSurfaceHandle,
) -> CaptureResult<bool> {
    if !surface.viewable {
        return Err(CaptureError::SourceNotViewable(surface.id));
    }
    Ok(!zero_copy || bound != Some(BoundSize::of(&surface.geometry)))
}

/// Exported pixmaps include the window border, snapshots do not
fn src_offset(prep: SourcePrep, border: u32) -> Point {
    match prep {
        SourcePrep::Imported => Point {
            x: border as i32,
            y: border as i32,
        },
        SourcePrep::Upload { .. } => Point::default(),
    }
}

struct Source {
    window: Window,
    texture: Option<SourceTexture>,
    bound: Option<BoundSize>,
}

/// Swapchain, command buffers and frame synchronization
struct Compositor<'a> {
    gpu: &'a GpuContext,
    swapchains: SwapchainManager<'a>,
    recorder: CommandRecorder<'a>,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
    layout: Layout,
    clear_color: Option<[f32; 4]>,
    surface_extent: Extent,
    bindings: Vec<SourceBinding>,
    shared_extent: SharedExtent,
}

impl<'a> Compositor<'a> {
    fn new(gpu: &'a GpuContext, settings: &PipelineSettings) -> GpuResult<Self> {
        let swapchains = SwapchainManager::new(gpu, settings.swapchain)?;
        let recorder = CommandRecorder::new(gpu)?;
        let surface_extent = gpu.surface_extent()?;
        log::info!(
            "destination surface extent {}x{}",
            surface_extent.width,
            surface_extent.height
        );
        let (image_available, render_finished, in_flight) = create_sync_objects(gpu.device())?;
        let shared_extent = SharedExtent::new(
            swapchains
                .current()
                .map(|chain| chain.extent)
                .unwrap_or_default(),
        );

        Ok(Self {
            gpu,
            swapchains,
            recorder,
            image_available,
            render_finished,
            in_flight,
            layout: settings.layout,
            clear_color: settings.clear_color,
            surface_extent,
            bindings: Vec::new(),
            shared_extent,
        })
    }

    /// Block until the previous submission finished. Only one frame is in
    /// flight, so afterwards no texture or command buffer is in use.
    fn wait_in_flight(&self) -> GpuResult<()> {
        unsafe {
            self.gpu
                .device()
                .wait_for_fences(&[self.in_flight], true, u64::MAX)
        }
        .vk("vkWaitForFences")
    }

    fn swapchain_extent(&self) -> Extent {
        self.swapchains
            .current()
            .map(|chain| chain.extent)
            .unwrap_or_default()
    }

    fn record_if_needed(&mut self) -> GpuResult<()> {
        let Some(chain) = self.swapchains.current() else {
            return Ok(());
        };
        let key = RecordKey {
            generation: chain.generation,
            surface_extent: self.surface_extent,
            sources: self.bindings.clone(),
        };
        if !self.recorder.needs_record(&key) {
            return Ok(());
        }

        let plans = plan_frames(
            chain,
            self.surface_extent,
            &self.bindings,
            self.layout,
            self.clear_color,
        );
        self.recorder.record(&plans, key)
    }
}

impl FrameTarget for Compositor<'_> {
    fn acquire(&mut self, timeout: Duration) -> Result<AcquireOutcome> {
        let Some(chain) = self.swapchains.current() else {
            return Ok(AcquireOutcome::OutOfDate);
        };
        let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let acquired = unsafe {
            self.swapchains.loader().acquire_next_image(
                chain.handle,
                timeout,
                self.image_available,
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Ready { index, suboptimal }),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Ok(AcquireOutcome::NotReady),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(result) => Err(GpuError::Vulkan {
                call: "vkAcquireNextImageKHR",
                result,
            }
            .into()),
        }
    }

    fn submit(&mut self, image_index: u32) -> Result<()> {
        let cmd = self
            .recorder
            .buffer(image_index)
            .ok_or(GpuError::NotRecorded(image_index))?;
        let device = self.gpu.device();

        let wait_semaphores = [self.image_available];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let command_buffers = [cmd];
        let signal_semaphores = [self.render_finished];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            // Reset only once a submission is certain to signal it again
            device
                .reset_fences(&[self.in_flight])
                .vk("vkResetFences")?;
            device
                .queue_submit(self.gpu.queue(), &[submit], self.in_flight)
                .vk("vkQueueSubmit")?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32) -> Result<PresentOutcome> {
        let Some(chain) = self.swapchains.current() else {
            return Ok(PresentOutcome::OutOfDate);
        };
        let wait_semaphores = [self.render_finished];
        let swapchains = [chain.handle];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let presented = unsafe {
            self.swapchains
                .loader()
                .queue_present(self.gpu.queue(), &present_info)
        };
        match presented {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(result) => Err(GpuError::Vulkan {
                call: "vkQueuePresentKHR",
                result,
            }
            .into()),
        }
    }

    fn rebuild(&mut self) -> Result<bool> {
        self.gpu.wait_idle()?;
        self.surface_extent = self.gpu.surface_extent()?;
        if !self.swapchains.recreate()? {
            return Ok(false);
        }
        self.shared_extent.set(self.swapchain_extent());
        self.recorder.invalidate();
        self.record_if_needed()?;
        log::debug!(
            "rebuilt for surface {}x{}, generation {}",
            self.surface_extent.width,
            self.surface_extent.height,
            self.swapchains.generation()
        );
        Ok(true)
    }
}

impl Drop for Compositor<'_> {
    fn drop(&mut self) {
        let device = self.gpu.device();
        unsafe {
            if let Err(e) = device.device_wait_idle() {
                log::warn!("device did not go idle before destroying sync objects: {e}");
            }
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}

fn create_sync_objects(
    device: &ash::Device,
) -> GpuResult<(vk::Semaphore, vk::Semaphore, vk::Fence)> {
    let semaphore_info = vk::SemaphoreCreateInfo::default();
    // Signalled so the first frame does not wait
    let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

    unsafe {
        let image_available = device
            .create_semaphore(&semaphore_info, None)
            .vk("vkCreateSemaphore")?;
        let render_finished = match device.create_semaphore(&semaphore_info, None) {
            Ok(s) => s,
            Err(result) => {
                device.destroy_semaphore(image_available, None);
                return Err(GpuError::Vulkan {
                    call: "vkCreateSemaphore",
                    result,
                });
            }
        };
        match device.create_fence(&fence_info, None) {
            Ok(fence) => Ok((image_available, render_finished, fence)),
            Err(result) => {
                device.destroy_semaphore(image_available, None);
                device.destroy_semaphore(render_finished, None);
                Err(GpuError::Vulkan {
                    call: "vkCreateFence",
                    result,
                })
            }
        }
    }
}

pub struct Pipeline<'a, C: FrameCapture> {
    x11: &'a X11Session,
    gpu: &'a GpuContext,
    capture: C,
    watcher: Option<ExtentWatcher>,
    handshake: Handshake,
    presenter: PresentationLoop,
    sources: Vec<Source>,
    compositor: Compositor<'a>,
}

/// Host snapshots uploaded through a staging buffer every frame
pub type CopyPipeline<'a> = Pipeline<'a, ShmCapture>;

/// DMA-BUF imports, re-imported only when a window is resized
pub type ZeroCopyPipeline<'a> = Pipeline<'a, Dri3Capture>;

impl<'a, C: FrameCapture> Pipeline<'a, C> {
    pub fn new(
        x11: &'a X11Session,
        gpu: &'a GpuContext,
        capture: C,
        windows: &[Window],
        settings: &PipelineSettings,
    ) -> Result<Self> {
        let compositor = Compositor::new(gpu, settings)?;
        let watcher = settings.refresh_interval.map(|interval| {
            ExtentWatcher::spawn(interval, compositor.shared_extent.clone(), gpu.extent_probe())
        });

        let mut pipeline = Self {
            x11,
            gpu,
            capture,
            watcher,
            handshake: Handshake::default(),
            presenter: PresentationLoop::new(settings.acquire_timeout),
            sources: Vec::with_capacity(windows.len()),
            compositor,
        };
        for &window in windows {
            pipeline.add_source(window)?;
        }
        Ok(pipeline)
    }

    fn add_source(&mut self, window: Window) -> Result<()> {
        let surface = self.x11.surface(window)?;
        self.capture.prepare(self.x11, window)?;
        log::info!(
            "mirroring window 0x{window:x} ({}, {}x{}, depth {})",
            surface.class,
            surface.geometry.width,
            surface.geometry.height,
            surface.depth
        );
        self.sources.push(Source {
            window,
            texture: None,
            bound: None,
        });
        Ok(())
    }

    /// Re-query every source, capture what needs capturing and rebuild the
    /// binding list the recorder keys on.
    fn refresh_sources(&mut self) -> Result<()> {
        let zero_copy = self.capture.zero_copy();
        let mut bindings = Vec::with_capacity(self.sources.len());

        for source in &mut self.sources {
            let surface = self.x11.surface(source.window)?;
            let geometry = surface.geometry;

            let recapture = needs_capture(zero_copy, source.bound, &surface)?;
            if source.texture.is_none() || recapture {
                let frame = self.capture.capture(self.x11, &surface)?;
                if SourceTexture::bind(&mut source.texture, self.gpu, frame)? {
                    log::debug!("new texture for window 0x{:x}", source.window);
                }
                source.bound = Some(BoundSize::of(&geometry));
            }

            if let Some(texture) = &source.texture {
                let prep = texture.prep();
                bindings.push(SourceBinding {
                    image: texture.image(),
                    extent: texture.extent(),
                    geometry,
                    src_offset: src_offset(prep, geometry.border),
                    prep,
                    filter: texture.filter(),
                });
            }
        }

        self.compositor.bindings = bindings;
        Ok(())
    }
}

impl<C: FrameCapture> Renderer for Pipeline<'_, C> {
    fn draw(&mut self) -> Result<FrameStatus> {
        self.compositor.wait_in_flight()?;
        self.refresh_sources()?;
        self.compositor.record_if_needed()?;

        let status = self.presenter.run_cycle(&mut self.compositor)?;
        if status == FrameStatus::Recovered {
            self.handshake.mark_applied();
            self.handshake.finish(self.compositor.swapchain_extent());
        }
        Ok(status)
    }

    fn update(&mut self) -> Result<()> {
        let Some(watcher) = &self.watcher else {
            return Ok(());
        };
        if self.handshake.state() != HandshakeState::Idle {
            return Ok(());
        }
        if let Some(request) = watcher.poll() {
            self.handshake.begin(request);
            self.presenter.invalidate();
        }
        Ok(())
    }

    fn frames_presented(&self) -> u64 {
        self.presenter.frames_presented()
    }
}

impl<C: FrameCapture> Drop for Pipeline<'_, C> {
    fn drop(&mut self) {
        // The watcher may be blocked on the ack of the pending request
        self.handshake.cancel();
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Err(e) = self.gpu.wait_idle() {
            log::warn!("device did not go idle before teardown: {e}");
        }
        self.capture.release(self.x11);
    }
}

/// Build the pipeline for `mode`. Zero-copy is only attempted when asked
/// for and fails here when DRI3 or DMA-BUF import is missing.
pub fn build_renderer<'a>(
    mode: CaptureMode,
    x11: &'a X11Session,
    gpu: &'a GpuContext,
    windows: &[Window],
    settings: &PipelineSettings,
) -> Result<Box<dyn Renderer + 'a>> {
    match mode {
        CaptureMode::Shm => {
            let capture = ShmCapture::new()?;
            Ok(Box::new(CopyPipeline::new(x11, gpu, capture, windows, settings)?))
        }
        CaptureMode::ZeroCopy => {
            x11.require_dri3()?;
            if !gpu.capabilities().external_memory_dma_buf {
                return Err(GpuError::MissingExtension(
                    ash::ext::external_memory_dma_buf::NAME
                        .to_string_lossy()
                        .into_owned(),
                )
                .into());
            }
            Ok(Box::new(ZeroCopyPipeline::new(
                x11,
                gpu,
                Dri3Capture::new(),
                windows,
                settings,
            )?))
        }
    }
}
