//! Capture state machine and interrupt entry points
//!
//! `Idle -> Armed -> Transferring -> {FrameReady | Error | TimedOut} -> Idle`
//!
//! The controller owns the transport. Interrupt handlers run on whatever
//! thread the transport delivers events from and reach shared state
//! through an [`IrqLine`]. Every arm bumps an epoch; handlers carrying an
//! older epoch are ignored, which is how an abort masks a transfer that
//! is still draining.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use crossbeam::atomic::AtomicCell;
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use crate::capture::strategy::{CaptureSession, TransferStrategy};
use crate::capture::transport::{DmaTarget, Transport};
use crate::error::{BufferError, CaptureError};
use crate::framebuffer::{DmaAddr, FrameBufferPool, TailMode};
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Armed,
    Transferring,
    FrameReady,
    Error,
    TimedOut,
}

/// Hardware fault latched by an interrupt handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Overrun,
    Bus(u32),
}

impl From<Fault> for CaptureError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Overrun => CaptureError::Overrun,
            Fault::Bus(code) => CaptureError::BusError(code),
        }
    }
}

/// Callback fired from interrupt context
pub struct Callback(Box<dyn Fn() + Send + Sync>);

impl Callback {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }
}

/// Output line driven high for the duration of each frame
pub struct SyncOutput(Box<dyn Fn(bool) + Send + Sync>);

impl SyncOutput {
    pub fn new(f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }
}

struct ActiveTransfer {
    session: CaptureSession,
    strategy: &'static dyn TransferStrategy,
    line_buf: Vec<u8>,
}

/// State shared between the capture context and interrupt handlers
pub struct Shared {
    state: AtomicCell<CaptureState>,
    pool: Arc<FrameBufferPool>,
    active: Mutex<Option<ActiveTransfer>>,
    epoch: AtomicU64,
    line: AtomicU32,
    fault: AtomicCell<Option<Fault>>,
    event: Notify,
    vsync_cb: ArcSwapOption<Callback>,
    frame_cb: ArcSwapOption<Callback>,
    sync_out: ArcSwapOption<SyncOutput>,
}

impl Shared {
    pub fn state(&self) -> CaptureState {
        self.state.load()
    }

    /// Wakes when a frame completes or a fault is latched.
    pub fn event(&self) -> &Notify {
        &self.event
    }

    fn fire(slot: &ArcSwapOption<Callback>) {
        if let Some(cb) = &*slot.load() {
            (cb.0)();
        }
    }

    fn drive_sync(&self, level: bool) {
        if let Some(pin) = &*self.sync_out.load() {
            (pin.0)(level);
        }
    }
}

/// Interrupt entry points handed to the transport for one armed transfer
#[derive(Clone)]
pub struct IrqLine {
    shared: Arc<Shared>,
    epoch: u64,
}

impl IrqLine {
    fn live(&self) -> bool {
        self.shared.epoch.load(Ordering::Acquire) == self.epoch
            && self.shared.state.load() == CaptureState::Transferring
    }

    /// Start of frame.
    pub fn vsync(&self) {
        if !self.live() {
            return;
        }
        self.shared.line.store(0, Ordering::Relaxed);
        self.shared.drive_sync(true);
        Shared::fire(&self.shared.vsync_cb);
    }

    /// A scanline landed in the hardware line buffer.
    pub fn line_done(&self, data: &[u8], dest: DmaAddr) {
        if !self.live() {
            return;
        }
        let row = self.shared.line.fetch_add(1, Ordering::Relaxed);
        let rejected = {
            let mut guard = lock(&self.shared.active);
            let Some(ActiveTransfer {
                session,
                strategy,
                line_buf,
            }) = guard.as_mut()
            else {
                return;
            };
            strategy
                .on_line(session, row, data, line_buf)
                .and_then(|offset| {
                    self.shared
                        .pool
                        .dma_write(dest.offset_by(offset), line_buf)
                        .err()
                })
        };
        if let Some(e) = rejected {
            error!(row, "line copy rejected: {}", e);
            self.bus_error(LINE_COPY_FAULT);
        }
    }

    /// Whole-frame DMA payload.
    pub fn dma_write(&self, dest: DmaAddr, data: &[u8]) -> Result<(), BufferError> {
        if !self.live() {
            return Ok(());
        }
        self.shared.pool.dma_write(dest, data)
    }

    /// Transfer-stopped interrupt. Commits the tail and, when streaming and
    /// a slot is free, returns where the next frame goes.
    pub fn frame_done(&self) -> Option<DmaTarget> {
        if !self.live() {
            return None;
        }
        let shared = &self.shared;
        let committed = shared.pool.get_tail_if(TailMode::Advance, || self.live())?;
        trace!(slot = committed.slot, "frame committed");
        shared.drive_sync(false);
        Shared::fire(&shared.frame_cb);

        let next = {
            let active = lock(&shared.active);
            active.as_ref().and_then(|a| {
                if !a.session.streaming {
                    return None;
                }
                let dest = shared.pool.get_tail(TailMode::Peek)?;
                Some(DmaTarget {
                    dest,
                    mode: a.strategy.mode(&a.session),
                })
            })
        };

        match next {
            Some(_) => shared.line.store(0, Ordering::Relaxed),
            None => {
                let _ = shared
                    .state
                    .compare_exchange(CaptureState::Transferring, CaptureState::FrameReady);
            }
        }
        shared.event.notify_one();
        next
    }

    pub fn overrun(&self) {
        self.fault(Fault::Overrun);
    }

    pub fn bus_error(&self, code: u32) {
        self.fault(Fault::Bus(code));
    }

    fn fault(&self, fault: Fault) {
        if !self.live() {
            return;
        }
        // Mask anything else this transfer still has in flight
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.pool.discard_tail();
        self.shared.drive_sync(false);
        self.shared.fault.store(Some(fault));
        self.shared.state.store(CaptureState::Error);
        warn!(?fault, "capture fault");
        self.shared.event.notify_one();
    }
}

/// Reported when a scanline cannot be stored in the destination slot
pub const LINE_COPY_FAULT: u32 = 0x4C;

pub struct CaptureController {
    shared: Arc<Shared>,
    transport: Box<dyn Transport>,
}

impl CaptureController {
    pub fn new(pool: Arc<FrameBufferPool>, transport: Box<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicCell::new(CaptureState::Idle),
                pool,
                active: Mutex::new(None),
                epoch: AtomicU64::new(0),
                line: AtomicU32::new(0),
                fault: AtomicCell::new(None),
                event: Notify::new(),
                vsync_cb: ArcSwapOption::empty(),
                frame_cb: ArcSwapOption::empty(),
                sync_out: ArcSwapOption::empty(),
            }),
            transport,
        }
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn state(&self) -> CaptureState {
        self.shared.state()
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self.state(),
            CaptureState::Armed | CaptureState::Transferring
        )
    }

    pub fn set_vsync_callback(&self, cb: Option<Callback>) {
        self.shared.vsync_cb.store(cb.map(Arc::new));
    }

    pub fn set_frame_callback(&self, cb: Option<Callback>) {
        self.shared.frame_cb.store(cb.map(Arc::new));
    }

    pub fn set_vsync_output(&self, pin: Option<SyncOutput>) {
        self.shared.sync_out.store(pin.map(Arc::new));
    }

    /// Points DMA at the pool tail and starts the transport.
    pub fn arm(&mut self, session: CaptureSession) -> Result<(), CaptureError> {
        if self.is_busy() {
            return Err(CaptureError::InvalidState("transfer already in flight"));
        }
        let dest = self
            .shared
            .pool
            .get_tail(TailMode::Peek)
            .ok_or(BufferError::NoFreeSlot)?;

        self.shared.state.store(CaptureState::Armed);
        let epoch = self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.line.store(0, Ordering::Relaxed);
        self.shared.fault.take();
        self.shared.pool.discard_tail();

        let strategy = session.strategy();
        let target = DmaTarget {
            dest,
            mode: strategy.mode(&session),
        };
        *lock(&self.shared.active) = Some(ActiveTransfer {
            session,
            strategy,
            line_buf: Vec::with_capacity(session.raster.width as usize * session.bus_bpp),
        });

        if self.transport.is_busy() {
            trace!("transport still draining the last transfer, stopping it");
            self.transport.abort();
        }
        if let Err(e) = self.transport.configure(&session.bus_setup()) {
            lock(&self.shared.active).take();
            self.shared.state.store(CaptureState::Idle);
            return Err(e);
        }

        // Interrupts may fire as soon as the transport starts
        self.shared.state.store(CaptureState::Transferring);
        let irq = IrqLine {
            shared: self.shared.clone(),
            epoch,
        };
        if let Err(e) = self.transport.start(target, irq) {
            self.abort(true);
            return Err(e);
        }
        debug!(
            slot = dest.slot,
            strategy = ?strategy.kind(),
            streaming = session.streaming,
            "capture armed"
        );
        Ok(())
    }

    /// Returns the latched fault, if an interrupt reported one.
    pub fn take_fault(&self) -> Option<CaptureError> {
        self.shared.fault.take().map(CaptureError::from)
    }

    /// Marks a deadline miss; follow with [`abort`](Self::abort).
    pub fn mark_timed_out(&self) {
        self.shared.state.store(CaptureState::TimedOut);
    }

    /// Frame consumed; back to idle unless another transfer is running.
    pub fn settle(&self) {
        let _ = self
            .shared
            .state
            .compare_exchange(CaptureState::FrameReady, CaptureState::Idle);
    }

    /// Stops a single-shot transfer once its frame has been checked out.
    /// Unlike [`abort`](Self::abort) the pool is left alone, so the
    /// delivered slot stays with the caller.
    pub fn finish(&mut self) {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        if self.transport.is_busy() {
            self.transport.abort();
        }
        lock(&self.shared.active).take();
        self.shared.state.store(CaptureState::Idle);
    }

    /// Masks interrupts, stops DMA and flushes the pool.
    pub fn abort(&mut self, hard: bool) {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        self.transport.abort();
        self.shared.pool.flush(hard);
        lock(&self.shared.active).take();
        self.shared.state.store(CaptureState::Idle);
        debug!(hard, "capture aborted");
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        if self.is_busy() {
            self.abort(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::capture::strategy::{BusEncoding, TransferKind};
    use crate::capture::transport::BusSetup;
    use crate::framebuffer::HeadMode;
    use crate::geometry::{Resolution, Window};
    use crate::sensor::HwFlags;

    type Started = Arc<Mutex<Option<(DmaTarget, IrqLine)>>>;

    /// Transport that keeps the interrupt line so the test can drive it
    struct Bench {
        started: Started,
        reject_setup: bool,
    }

    impl Transport for Bench {
        fn configure(&mut self, _: &BusSetup) -> Result<(), CaptureError> {
            if self.reject_setup {
                return Err(CaptureError::InvalidState("bus geometry not set"));
            }
            Ok(())
        }

        fn start(&mut self, target: DmaTarget, irq: IrqLine) -> Result<(), CaptureError> {
            *lock(&self.started) = Some((target, irq));
            Ok(())
        }

        fn abort(&mut self) {}

        fn is_busy(&self) -> bool {
            false
        }
    }

    fn session() -> CaptureSession {
        let raster = Resolution::new(8, 4);
        CaptureSession {
            format: PixelFormat::Grayscale,
            raster,
            window: Window::full(raster),
            encoding: BusEncoding::Native,
            bus_bpp: 1,
            hw: HwFlags::default(),
            transfer: TransferKind::WholeFrame,
            streaming: false,
            double_buffer: false,
            timeout: Duration::from_secs(3),
        }
    }

    fn bench(reject_setup: bool) -> (CaptureController, Arc<FrameBufferPool>, Started) {
        let pool = Arc::new(FrameBufferPool::new(32, 2));
        pool.setup(32, 1).unwrap();
        let started = Started::default();
        let transport = Bench {
            started: started.clone(),
            reject_setup,
        };
        let controller = CaptureController::new(pool.clone(), Box::new(transport));
        (controller, pool, started)
    }

    #[test]
    fn completion_after_abort_commits_nothing() {
        let (mut controller, pool, started) = bench(false);
        controller.arm(session()).unwrap();
        let (target, irq) = lock(&started).take().unwrap();
        irq.dma_write(target.dest, &[5; 32]).unwrap();

        controller.abort(true);
        assert!(irq.frame_done().is_none());
        assert_eq!(pool.stats().committed, 0);
        assert!(pool.get_head(HeadMode::Plain).is_none());
        assert_eq!(controller.state(), CaptureState::Idle);
    }

    #[test]
    fn rejected_setup_leaves_nothing_armed() {
        let (mut controller, _pool, started) = bench(true);
        assert!(controller.arm(session()).is_err());
        assert_eq!(controller.state(), CaptureState::Idle);
        assert!(lock(&controller.shared.active).is_none());
        assert!(lock(&started).is_none());
    }

    #[test]
    fn sync_output_spans_the_frame() {
        let (mut controller, _pool, started) = bench(false);
        let levels = Arc::new(Mutex::new(Vec::new()));
        {
            let levels = levels.clone();
            controller.set_vsync_output(Some(SyncOutput::new(move |high| {
                lock(&levels).push(high);
            })));
        }
        controller.arm(session()).unwrap();
        let (target, irq) = lock(&started).take().unwrap();
        irq.vsync();
        irq.dma_write(target.dest, &[0; 32]).unwrap();
        irq.frame_done();
        assert_eq!(*lock(&levels), vec![true, false]);
    }

    #[test]
    fn finish_keeps_the_delivered_slot() {
        let (mut controller, pool, started) = bench(false);
        controller.arm(session()).unwrap();
        let (target, irq) = lock(&started).take().unwrap();
        irq.dma_write(target.dest, &[1; 32]).unwrap();
        assert!(irq.frame_done().is_none());
        assert_eq!(controller.state(), CaptureState::FrameReady);

        let (id, _) = pool.get_head(HeadMode::Invalidate).unwrap();
        controller.finish();
        assert_eq!(controller.state(), CaptureState::Idle);
        assert!(lock(&controller.shared.active).is_none());
        assert_eq!(pool.lock_slot(id)[0], 1);
        // Slot still checked out, so DMA has nowhere to go
        assert!(pool.get_tail(TailMode::Peek).is_none());
    }
}
