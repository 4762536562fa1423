//! Simulated camera bus and DMA engine
//!
//! A worker thread plays the part of the bus peripheral: it waits one
//! frame interval, raises VSYNC, moves a generated frame into the pool
//! (whole-frame or one scanline at a time) and fires the transfer-stopped
//! interrupt. Tests use the [`SimBusHandle`] to stall transfers, inject
//! faults and inspect which addresses DMA targeted.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::capture::controller::IrqLine;
use crate::capture::transport::{BusSetup, DmaTarget, TransferMode, Transport};
use crate::error::CaptureError;
use crate::utils::lock;

/// Reported when a whole-frame write is rejected by the pool
pub const DMA_WRITE_FAULT: u32 = 0xD0;

/// Produces the raw bytes the sensor would put on the bus
pub trait FrameSource: Send {
    fn fill(&mut self, setup: &BusSetup, sequence: u64, out: &mut Vec<u8>);
}

impl<F> FrameSource for F
where
    F: FnMut(&BusSetup, u64, &mut Vec<u8>) + Send,
{
    fn fill(&mut self, setup: &BusSetup, sequence: u64, out: &mut Vec<u8>) {
        self(setup, sequence, out)
    }
}

/// Deterministic gradient; JPEG mode emits a small SOI..EOI stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestPattern;

impl TestPattern {
    /// Byte `b` of the pixel at (`x`, `y`).
    pub fn byte_at(x: usize, y: usize, b: usize) -> u8 {
        (x + y * 3 + b * 7) as u8
    }
}

impl FrameSource for TestPattern {
    fn fill(&mut self, setup: &BusSetup, sequence: u64, out: &mut Vec<u8>) {
        out.clear();
        let (w, h) = (setup.width as usize, setup.height as usize);
        if setup.jpeg {
            let body = (w * h / 8).max(16) - (sequence % 8) as usize;
            out.extend_from_slice(&[0xFF, 0xD8]);
            out.extend((0..body).map(|i| (i as u64 + sequence) as u8 & 0x7F));
            out.extend_from_slice(&[0xFF, 0xD9]);
            return;
        }
        let bpp = setup.bytes_per_pixel;
        out.reserve(w * h * bpp);
        for y in 0..h {
            for x in 0..w {
                out.extend((0..bpp).map(|b| Self::byte_at(x, y, b)));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    Overrun,
    BusError(u32),
}

#[derive(Default)]
struct Control {
    stall: AtomicU32,
    /// Fault and the transfer index it fires on
    fault: Mutex<Option<(u64, SimFault)>>,
    transfers: AtomicU64,
    history: Mutex<Vec<usize>>,
    configured: AtomicU64,
    last_setup: Mutex<Option<BusSetup>>,
}

impl Control {
    fn take_stall(&self) -> bool {
        self.stall
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_fault(&self, index: u64) -> Option<SimFault> {
        let mut plan = lock(&self.fault);
        match *plan {
            Some((at, fault)) if at <= index => {
                *plan = None;
                Some(fault)
            }
            _ => None,
        }
    }
}

/// Test and demo access to a [`SimBus`] after it moved into the engine
#[derive(Clone)]
pub struct SimBusHandle {
    control: Arc<Control>,
}

impl SimBusHandle {
    /// Swallows the next `n` transfers: no data, no completion interrupt.
    pub fn stall_next(&self, n: u32) {
        self.control.stall.store(n, Ordering::Release);
    }

    /// Raises `fault` halfway through the transfer `after` transfers from now.
    pub fn inject_fault(&self, after: u64, fault: SimFault) {
        let at = self.control.transfers.load(Ordering::Acquire) + after;
        *lock(&self.control.fault) = Some((at, fault));
    }

    /// Pool addresses of every transfer started so far.
    pub fn destinations(&self) -> Vec<usize> {
        lock(&self.control.history).clone()
    }

    pub fn transfers(&self) -> u64 {
        self.control.transfers.load(Ordering::Acquire)
    }

    pub fn configure_count(&self) -> u64 {
        self.control.configured.load(Ordering::Acquire)
    }

    pub fn last_setup(&self) -> Option<BusSetup> {
        *lock(&self.control.last_setup)
    }
}

struct Job {
    generation: u64,
    setup: BusSetup,
    target: DmaTarget,
    irq: IrqLine,
}

pub struct SimBus {
    jobs: Option<flume::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    generation: Arc<AtomicU64>,
    /// Generation of the running transfer, 0 when idle
    busy: Arc<AtomicU64>,
    control: Arc<Control>,
    setup: Option<BusSetup>,
}

impl SimBus {
    pub fn new(frame_interval: Duration) -> Self {
        Self::with_source(frame_interval, TestPattern)
    }

    pub fn with_source(frame_interval: Duration, source: impl FrameSource + 'static) -> Self {
        let (tx, rx) = flume::unbounded();
        let generation = Arc::new(AtomicU64::new(0));
        let busy = Arc::new(AtomicU64::new(0));
        let control = Arc::new(Control::default());

        let worker = Worker {
            generation: generation.clone(),
            busy: busy.clone(),
            control: control.clone(),
            source: Box::new(source),
            interval: frame_interval,
            frame: Vec::new(),
        };
        let handle = thread::spawn(move || worker.run(rx));

        Self {
            jobs: Some(tx),
            worker: Some(handle),
            generation,
            busy,
            control,
            setup: None,
        }
    }

    pub fn handle(&self) -> SimBusHandle {
        SimBusHandle {
            control: self.control.clone(),
        }
    }
}

impl Transport for SimBus {
    fn configure(&mut self, setup: &BusSetup) -> Result<(), CaptureError> {
        if setup.width == 0 || setup.height == 0 || setup.bytes_per_pixel == 0 {
            return Err(CaptureError::InvalidState("bus geometry not set"));
        }
        self.setup = Some(*setup);
        self.control.configured.fetch_add(1, Ordering::AcqRel);
        *lock(&self.control.last_setup) = Some(*setup);
        trace!(?setup, "bus configured");
        Ok(())
    }

    fn start(&mut self, target: DmaTarget, irq: IrqLine) -> Result<(), CaptureError> {
        let setup = self
            .setup
            .ok_or(CaptureError::InvalidState("bus not configured"))?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.busy.store(generation, Ordering::Release);

        let jobs = self
            .jobs
            .as_ref()
            .ok_or(CaptureError::InvalidState("bus shut down"))?;
        jobs.send(Job {
            generation,
            setup,
            target,
            irq,
        })
        .map_err(|e| CaptureError::Io {
            stage: "transport",
            reason: e.to_string(),
        })
    }

    fn abort(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.busy.store(0, Ordering::Release);
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire) != 0
    }
}

impl Drop for SimBus {
    fn drop(&mut self) {
        self.abort();
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("sim bus worker panicked");
            }
        }
    }
}

struct Worker {
    generation: Arc<AtomicU64>,
    busy: Arc<AtomicU64>,
    control: Arc<Control>,
    source: Box<dyn FrameSource>,
    interval: Duration,
    frame: Vec<u8>,
}

impl Worker {
    fn run(mut self, jobs: flume::Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            self.transfer(job);
        }
        debug!("sim bus worker exiting");
    }

    fn live(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn idle(&self, generation: u64) {
        let _ = self
            .busy
            .compare_exchange(generation, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    fn transfer(&mut self, job: Job) {
        let Job {
            generation,
            setup,
            mut target,
            irq,
        } = job;

        while self.live(generation) {
            let index = self.control.transfers.fetch_add(1, Ordering::AcqRel);
            lock(&self.control.history).push(target.dest.address());
            if self.control.take_stall() {
                // Hung transfer: stays busy until aborted
                trace!(index, "transfer stalled");
                return;
            }

            thread::sleep(self.interval);
            if !self.live(generation) {
                return;
            }

            irq.vsync();
            self.source.fill(&setup, index, &mut self.frame);
            let fault = self.control.take_fault(index);
            if !deliver(&irq, target, &self.frame, fault) {
                self.idle(generation);
                return;
            }

            match irq.frame_done() {
                Some(next) => target = next,
                None => {
                    self.idle(generation);
                    return;
                }
            }
        }
    }
}

fn raise(irq: &IrqLine, fault: SimFault) {
    match fault {
        SimFault::Overrun => irq.overrun(),
        SimFault::BusError(code) => irq.bus_error(code),
    }
}

/// Moves one frame into the pool; false when the transfer died midway.
fn deliver(irq: &IrqLine, target: DmaTarget, frame: &[u8], fault: Option<SimFault>) -> bool {
    match target.mode {
        TransferMode::WholeFrame { length } => {
            let n = frame.len().min(length);
            if let Some(fault) = fault {
                let _ = irq.dma_write(target.dest, &frame[..n / 2]);
                raise(irq, fault);
                return false;
            }
            if let Err(e) = irq.dma_write(target.dest, &frame[..n]) {
                warn!("DMA write rejected: {}", e);
                irq.bus_error(DMA_WRITE_FAULT);
                return false;
            }
        }
        TransferMode::LineByLine { line_len, lines } => {
            let half = lines as usize / 2;
            for (row, line) in frame.chunks(line_len).take(lines as usize).enumerate() {
                if row == half {
                    if let Some(fault) = fault {
                        raise(irq, fault);
                        return false;
                    }
                }
                irq.line_done(line, target.dest);
            }
        }
    }
    true
}
