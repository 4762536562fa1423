//! Capture orchestrator
//!
//! [`CaptureEngine`] owns the sensor, the controller and the pool for the
//! lifetime of the camera subsystem. A snapshot plans the capture, arms
//! the controller if nothing is in flight, waits for the pool head (or a
//! fault, or the deadline), runs the pixel pipeline on the slot and hands
//! the slot out as a [`FrameRef`].
//!
//! A plain snapshot captures exactly one fresh frame and leaves the
//! controller idle. Only [`CaptureEngine::stream`] keeps DMA running
//! between calls, rotating through the ring.

use std::sync::{Arc, MutexGuard};

use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::controller::{Callback, CaptureController, CaptureState, SyncOutput};
use crate::capture::frame::{FrameMetadata, FrameRef, PixelFormat};
use crate::capture::strategy::{BusEncoding, CaptureSession, TransferKind};
use crate::capture::transport::Transport;
use crate::error::{BufferError, CaptureError, SensorError};
use crate::framebuffer::{FrameBufferPool, HeadMode, PoolStats, SlotMeta};
use crate::geometry::{FrameSize, Resolution, Window};
use crate::pipeline::PixelPipeline;
use crate::sensor::{ChipId, GainCeiling, HwFlags, Ioctl, IoctlReply, Sensor, SpecialEffect};
use crate::utils::as_millis_f64;
use crate::Config;

/// What the caller configured on the sensor
#[derive(Debug, Clone, Copy)]
struct Settings {
    pixformat: Option<PixelFormat>,
    framesize: Option<FrameSize>,
    resolution: Resolution,
    window: Option<Window>,
    bus_bpp: usize,
    hw: HwFlags,
    buffer_count: usize,
    framerate: Option<u32>,
    gainceiling: Option<GainCeiling>,
    effect: Option<SpecialEffect>,
}

pub struct CaptureEngine {
    sensor: Box<dyn Sensor>,
    controller: CaptureController,
    pool: Arc<FrameBufferPool>,
    pipeline: PixelPipeline,
    config: Config,
    settings: Settings,
    /// (slot length, slot count) the pool is currently carved into
    layout: Option<(usize, usize)>,
    streaming: bool,
}

impl CaptureEngine {
    /// Resets the sensor and sets up the engine around it.
    pub fn init(
        mut sensor: Box<dyn Sensor>,
        transport: impl Transport + 'static,
        config: Config,
    ) -> Result<Self, CaptureError> {
        let max = config.pool.max_buffers;
        let count = config.pool.buffer_count;
        if count == 0 || count > max {
            return Err(BufferError::InvalidCount {
                requested: count,
                max,
            }
            .into());
        }

        sensor.reset()?;
        let hw = sensor.hw_flags();
        let pool = Arc::new(FrameBufferPool::new(config.pool.capacity_bytes, max));
        let controller = CaptureController::new(pool.clone(), Box::new(transport));
        let pipeline = PixelPipeline::new(
            config.pipeline.awb,
            config.pipeline.awb_refresh_interval,
        );

        let mut engine = Self {
            sensor,
            controller,
            pool,
            pipeline,
            settings: Settings {
                pixformat: None,
                framesize: None,
                resolution: Resolution::default(),
                window: None,
                bus_bpp: 1,
                hw,
                buffer_count: count,
                framerate: None,
                gainceiling: None,
                effect: None,
            },
            config,
            layout: None,
            streaming: false,
        };

        if let Some(format) = engine.config.capture.pixformat {
            engine.set_pixformat(format)?;
        }
        if let Some(size) = engine.config.capture.framesize {
            engine.set_framesize(size)?;
        }

        info!(
            chip = ?engine.sensor.chip_id(),
            capacity = engine.pool.capacity(),
            "capture engine ready"
        );
        Ok(engine)
    }

    /// Stops any transfer and puts the sensor to sleep.
    pub fn teardown(mut self) -> Result<(), CaptureError> {
        self.quiesce();
        self.controller.set_vsync_callback(None);
        self.controller.set_frame_callback(None);
        match self.sensor.sleep(true) {
            Ok(()) | Err(SensorError::UnsupportedOperation) => {}
            Err(e) => return Err(e.into()),
        }
        info!(stats = ?self.pool.stats(), "capture engine torn down");
        Ok(())
    }

    pub fn chip_id(&self) -> ChipId {
        self.sensor.chip_id()
    }

    pub fn hw_flags(&self) -> HwFlags {
        self.settings.hw
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> CaptureState {
        self.controller.state()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The pool's preview buffer, separate from every capture slot.
    pub fn overlay(&self) -> MutexGuard<'_, Vec<u8>> {
        self.pool.overlay()
    }

    pub fn pixformat(&self) -> Option<PixelFormat> {
        self.settings.pixformat
    }

    pub fn framesize(&self) -> Option<FrameSize> {
        self.settings.framesize
    }

    // Stops background transfers so the sensor and pool can be touched.
    fn quiesce(&mut self) {
        if self.controller.is_busy() {
            debug!("stopping in-flight transfer for reconfiguration");
            self.controller.abort(true);
        }
    }

    fn reconfigured(&mut self) {
        self.quiesce();
        self.layout = None;
    }

    /// Binary frames need a thresholding stage the pipeline does not have,
    /// so they are refused before the sensor is touched.
    pub fn set_pixformat(&mut self, format: PixelFormat) -> Result<(), CaptureError> {
        if format == PixelFormat::Binary {
            return Err(SensorError::UnsupportedFormat(format).into());
        }
        self.reconfigured();
        let bus_bpp = self.sensor.set_pixformat(format)?;
        self.settings.pixformat = Some(format);
        self.settings.bus_bpp = bus_bpp;
        debug!(?format, bus_bpp, "pixel format set");
        Ok(())
    }

    /// Changes the raster; the window goes back to the full frame.
    pub fn set_framesize(&mut self, size: FrameSize) -> Result<(), CaptureError> {
        self.reconfigured();
        let resolution = self.sensor.set_framesize(size)?;
        self.settings.framesize = Some(size);
        self.settings.resolution = resolution;
        self.settings.window = None;
        debug!(?size, ?resolution, "frame size set");
        Ok(())
    }

    pub fn set_windowing(&mut self, window: Window) -> Result<(), CaptureError> {
        if self.settings.framesize.is_none() {
            return Err(CaptureError::InvalidState("frame size not set"));
        }
        window.validate(self.settings.resolution)?;
        self.reconfigured();
        self.settings.window = Some(window);
        Ok(())
    }

    /// Current window, the full raster when none was set.
    pub fn windowing(&self) -> Result<Window, CaptureError> {
        if self.settings.framesize.is_none() {
            return Err(CaptureError::InvalidState("frame size not set"));
        }
        Ok(self
            .settings
            .window
            .unwrap_or_else(|| Window::full(self.settings.resolution)))
    }

    pub fn set_hmirror(&mut self, enable: bool) -> Result<(), CaptureError> {
        self.quiesce();
        Ok(self.sensor.set_hmirror(enable)?)
    }

    pub fn set_vflip(&mut self, enable: bool) -> Result<(), CaptureError> {
        self.quiesce();
        Ok(self.sensor.set_vflip(enable)?)
    }

    pub fn read_register(&mut self, addr: u16) -> Result<u16, CaptureError> {
        self.quiesce();
        Ok(self.sensor.read_register(addr)?)
    }

    pub fn write_register(&mut self, addr: u16, value: u16) -> Result<(), CaptureError> {
        self.quiesce();
        Ok(self.sensor.write_register(addr, value)?)
    }

    pub fn ioctl(&mut self, request: Ioctl) -> Result<IoctlReply, CaptureError> {
        self.quiesce();
        Ok(self.sensor.ioctl(request)?)
    }

    /// No-op when the rate is unchanged.
    pub fn set_framerate(&mut self, fps: u32) -> Result<(), CaptureError> {
        if self.settings.framerate == Some(fps) {
            return Ok(());
        }
        self.quiesce();
        self.sensor.set_framerate(fps)?;
        self.settings.framerate = Some(fps);
        Ok(())
    }

    pub fn set_contrast(&mut self, level: i32) -> Result<(), CaptureError> {
        self.quiesce();
        Ok(self.sensor.set_contrast(level)?)
    }

    pub fn set_brightness(&mut self, level: i32) -> Result<(), CaptureError> {
        self.quiesce();
        Ok(self.sensor.set_brightness(level)?)
    }

    pub fn set_saturation(&mut self, level: i32) -> Result<(), CaptureError> {
        self.quiesce();
        Ok(self.sensor.set_saturation(level)?)
    }

    pub fn set_gainceiling(&mut self, ceiling: GainCeiling) -> Result<(), CaptureError> {
        if self.settings.gainceiling == Some(ceiling) {
            return Ok(());
        }
        self.quiesce();
        self.sensor.set_gainceiling(ceiling)?;
        self.settings.gainceiling = Some(ceiling);
        Ok(())
    }

    /// JPEG quality from 0 (smallest) to 100 (best).
    pub fn set_quality(&mut self, quality: u8) -> Result<(), CaptureError> {
        if quality > 100 {
            return Err(SensorError::OutOfRange {
                control: "quality",
                value: i32::from(quality),
            }
            .into());
        }
        // Chips take an inverted quantizer scale
        let qs = (255 * u32::from(100 - quality) / 100) as u8;
        self.quiesce();
        Ok(self.sensor.set_quality(qs)?)
    }

    pub fn set_colorbar(&mut self, enable: bool) -> Result<(), CaptureError> {
        self.quiesce();
        Ok(self.sensor.set_colorbar(enable)?)
    }

    pub fn set_auto_gain(
        &mut self,
        enable: bool,
        gain_db: Option<f32>,
        ceiling_db: Option<f32>,
    ) -> Result<(), CaptureError> {
        self.quiesce();
        Ok(self.sensor.set_auto_gain(enable, gain_db, ceiling_db)?)
    }

    pub fn gain_db(&mut self) -> Result<f32, CaptureError> {
        self.quiesce();
        Ok(self.sensor.gain_db()?)
    }

    pub fn set_auto_exposure(
        &mut self,
        enable: bool,
        exposure_us: Option<u32>,
    ) -> Result<(), CaptureError> {
        self.quiesce();
        Ok(self.sensor.set_auto_exposure(enable, exposure_us)?)
    }

    pub fn exposure_us(&mut self) -> Result<u32, CaptureError> {
        self.quiesce();
        Ok(self.sensor.exposure_us()?)
    }

    pub fn set_auto_whitebal(
        &mut self,
        enable: bool,
        rgb_gain_db: Option<[f32; 3]>,
    ) -> Result<(), CaptureError> {
        self.quiesce();
        Ok(self.sensor.set_auto_whitebal(enable, rgb_gain_db)?)
    }

    pub fn rgb_gain_db(&mut self) -> Result<[f32; 3], CaptureError> {
        self.quiesce();
        Ok(self.sensor.rgb_gain_db()?)
    }

    pub fn set_special_effect(&mut self, effect: SpecialEffect) -> Result<(), CaptureError> {
        if self.settings.effect == Some(effect) {
            return Ok(());
        }
        self.quiesce();
        self.sensor.set_special_effect(effect)?;
        self.settings.effect = Some(effect);
        Ok(())
    }

    pub fn set_lens_correction(&mut self, enable: bool, radius: u32, coef: u32) -> Result<(), CaptureError> {
        self.quiesce();
        Ok(self.sensor.set_lens_correction(enable, radius, coef)?)
    }

    /// Sets the ring depth used when two frames fit the budget.
    pub fn set_framebuffers(&mut self, count: usize) -> Result<(), CaptureError> {
        self.reconfigured();
        self.pool.set_buffer_count(count)?;
        self.settings.buffer_count = count;
        Ok(())
    }

    pub fn set_vsync_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.controller.set_vsync_callback(Some(Callback::new(cb)));
    }

    pub fn clear_vsync_callback(&self) {
        self.controller.set_vsync_callback(None);
    }

    pub fn set_frame_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.controller.set_frame_callback(Some(Callback::new(cb)));
    }

    pub fn clear_frame_callback(&self) {
        self.controller.set_frame_callback(None);
    }

    /// Drives `pin` high at the start of every frame and low once it lands.
    pub fn set_vsync_output(&self, pin: impl Fn(bool) + Send + Sync + 'static) {
        self.controller.set_vsync_output(Some(SyncOutput::new(pin)));
    }

    pub fn clear_vsync_output(&self) {
        self.controller.set_vsync_output(None);
    }

    fn plan(&self) -> Result<CaptureSession, CaptureError> {
        let format = self
            .settings
            .pixformat
            .ok_or(CaptureError::InvalidState("pixel format not set"))?;
        if self.settings.framesize.is_none() {
            return Err(CaptureError::InvalidState("frame size not set"));
        }

        let raster = self.settings.resolution;
        let hw = self.settings.hw;
        let (window, transfer) = if format.is_compressed() {
            (Window::full(raster), TransferKind::WholeFrame)
        } else {
            (
                self.settings.window.unwrap_or_else(|| Window::full(raster)),
                self.config.capture.transfer,
            )
        };

        let mut session = CaptureSession {
            format,
            raster,
            window,
            encoding: BusEncoding::resolve(format, self.settings.bus_bpp, &hw),
            bus_bpp: self.settings.bus_bpp,
            hw,
            transfer,
            streaming: false,
            double_buffer: false,
            timeout: self.config.capture.timeout(),
        };

        let capacity = self.pool.capacity();
        if session.slot_len() > capacity {
            session = self.shrink_to_fit(session)?;
        }
        session.double_buffer = 2 * session.slot_len() <= capacity;
        session.streaming = self.streaming;
        Ok(session)
    }

    // Grayscale is the one format cropped down instead of refused.
    fn shrink_to_fit(&self, mut session: CaptureSession) -> Result<CaptureSession, CaptureError> {
        let capacity = self.pool.capacity();
        let too_large = BufferError::FrameTooLarge {
            required: session.slot_len(),
            capacity,
        };
        if session.format != PixelFormat::Grayscale {
            return Err(too_large.into());
        }
        let Some(crop) = self.config.pool.grayscale_fallback.window(session.raster) else {
            return Err(too_large.into());
        };

        session.window = crop;
        session.transfer = TransferKind::LineByLine;
        let required = session.slot_len();
        if required > capacity {
            return Err(BufferError::FrameTooLarge { required, capacity }.into());
        }
        warn!(?crop, "grayscale frame exceeds the frame buffer, cropping");
        Ok(session)
    }

    fn prepare_pool(&mut self, session: &CaptureSession) -> Result<(), CaptureError> {
        let count = if session.double_buffer {
            self.settings.buffer_count
        } else {
            1
        };
        let layout = (session.slot_len(), count);
        if self.layout == Some(layout) {
            return Ok(());
        }
        self.quiesce();
        let slots = self.pool.setup(layout.0, layout.1)?;
        debug!(slot_len = layout.0, slots, "pool layout changed");
        self.layout = Some(layout);
        Ok(())
    }

    // Waits for the pool head, arming the controller whenever it is idle.
    async fn acquire(&mut self) -> Result<(usize, SlotMeta, CaptureSession), CaptureError> {
        let session = self.plan()?;
        self.prepare_pool(&session)?;

        if self.controller.is_busy() {
            trace!("transfer in flight, leaving DMA untouched");
        }

        let shared = self.controller.shared().clone();
        let started = Instant::now();
        let deadline = started + session.timeout;
        loop {
            if let Some((id, meta)) = self.pool.get_head(HeadMode::Invalidate) {
                if session.streaming {
                    self.controller.settle();
                } else {
                    self.controller.finish();
                }
                return Ok((id, meta, session));
            }
            if let Some(e) = self.controller.take_fault() {
                self.controller.abort(true);
                return Err(e);
            }
            if !self.controller.is_busy() {
                self.controller.arm(session)?;
            }

            if tokio::time::timeout_at(deadline, shared.event().notified())
                .await
                .is_err()
            {
                self.controller.mark_timed_out();
                self.controller.abort(true);
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(waited_ms, "no frame before the deadline");
                return Err(CaptureError::Timeout { waited_ms });
            }
        }
    }

    fn deliver(
        &mut self,
        id: usize,
        meta: SlotMeta,
        session: &CaptureSession,
    ) -> Result<FrameRef<'_>, CaptureError> {
        let Self {
            sensor,
            pool,
            pipeline,
            ..
        } = self;
        let pool: &FrameBufferPool = pool;

        let mut slot = pool.lock_slot(id);
        let processed = match pipeline.process(&mut **sensor, session, &mut slot[..], meta.len) {
            Ok(processed) => processed,
            Err(e) => {
                drop(slot);
                pool.free_current();
                return Err(e);
            }
        };

        let win = session.window;
        Ok(FrameRef::new(
            slot,
            pool,
            FrameMetadata {
                sequence: meta.sequence,
                width: win.w,
                height: win.h,
                raster: session.raster,
                x: win.x,
                y: win.y,
                bytes_per_pixel: session.format.bytes_per_pixel().unwrap_or(1),
                format: session.format,
                subformat: processed.subformat,
                len: processed.len,
                captured_at: meta.captured_at,
            },
        ))
    }

    /// Captures one frame. The frame borrows its pool slot until dropped.
    #[instrument(level = "trace", skip_all)]
    pub async fn snapshot(&mut self) -> Result<FrameRef<'_>, CaptureError> {
        let started = Instant::now();
        let (id, meta, session) = match self.acquire().await {
            Ok(acquired) => acquired,
            Err(e) => {
                record_error(&e);
                return Err(e);
            }
        };

        match self.deliver(id, meta, &session) {
            Ok(frame) => {
                metrics::counter!("capture_frames_total").increment(1);
                metrics::histogram!("snapshot_latency_ms").record(as_millis_f64(started.elapsed()));
                trace!(sequence = frame.sequence(), len = frame.meta().len, "frame delivered");
                Ok(frame)
            }
            Err(e) => {
                record_error(&e);
                Err(e)
            }
        }
    }

    /// Delivers frames to `on_frame` until it returns false. Returns how
    /// many frames were delivered.
    ///
    /// DMA keeps running between frames. It is stopped when the stream
    /// ends, fails or the future is dropped.
    pub async fn stream<F>(&mut self, mut on_frame: F) -> Result<u64, CaptureError>
    where
        F: FnMut(&FrameRef<'_>) -> bool,
    {
        let mut guard = Streaming::start(self);
        let mut delivered = 0;
        loop {
            let frame = guard.engine.snapshot().await?;
            delivered += 1;
            if !on_frame(&frame) {
                break;
            }
        }
        debug!(delivered, "stream stopped");
        Ok(delivered)
    }
}

/// Streaming mode for as long as it is alive
struct Streaming<'a> {
    engine: &'a mut CaptureEngine,
}

impl<'a> Streaming<'a> {
    fn start(engine: &'a mut CaptureEngine) -> Self {
        engine.streaming = true;
        Self { engine }
    }
}

impl Drop for Streaming<'_> {
    fn drop(&mut self) {
        self.engine.streaming = false;
        // Frames still in the ring were captured for the stream, not for
        // the next snapshot
        self.engine.controller.abort(true);
    }
}

fn record_error(e: &CaptureError) {
    metrics::counter!("capture_errors_total", "kind" => e.kind()).increment(1);
}
