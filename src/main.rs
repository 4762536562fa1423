//! framegrab demo: simulated raw sensor streaming into a frame consumer

mod tally;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;
use flume::bounded;
use tracing::{info, warn};

use framegrab::capture::PixelFormat;
use framegrab::geometry::FrameSize;
use framegrab::sensor::SimCapabilities;
use framegrab::{CaptureEngine, Config, Frame, SimBus, SimSensor};

/// Stop after this many frames when nobody presses Ctrl-C
const MAX_FRAMES: u64 = 300;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("framegrab=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let tally = tally::Tally::default();
    if metrics::set_global_recorder(tally.clone()).is_err() {
        warn!("metrics recorder already installed, counters will not be summarized");
    }

    info!("framegrab starting");

    // Optional TOML path as the only argument
    let path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = Config::load(path.as_deref())?;
    config.capture.pixformat.get_or_insert(PixelFormat::Rgb565);
    config.capture.framesize.get_or_insert(FrameSize::Qvga);

    // Raw Bayer sensor on a ~30 fps simulated bus
    let sensor = SimSensor::new(SimCapabilities::raw_bayer());
    let bus = SimBus::new(Duration::from_millis(33));
    let mut engine = CaptureEngine::init(Box::new(sensor), bus, config)?;

    let vsyncs = Arc::new(AtomicU64::new(0));
    {
        let vsyncs = vsyncs.clone();
        engine.set_vsync_callback(move || {
            vsyncs.fetch_add(1, Ordering::Relaxed);
        });
    }

    // Frames are copied out of their slot so the ring keeps turning while
    // the consumer works; a full queue drops the copy
    let (tx, rx) = bounded::<Frame>(8);

    let consumer = tokio::spawn(async move {
        let started = Instant::now();
        let mut frames = 0u64;
        let mut bytes = 0usize;
        while let Ok(frame) = rx.recv_async().await {
            frames += 1;
            bytes += frame.data.len();
            if frames % 30 == 0 {
                let fps = frames as f64 / started.elapsed().as_secs_f64();
                info!(
                    "frame #{} {}x{} {:?} ({:.1} fps, {} KiB total)",
                    frame.meta.sequence,
                    frame.meta.width,
                    frame.meta.height,
                    frame.meta.format,
                    fps,
                    bytes / 1024
                );
            }
        }
        frames
    });

    let mut dropped = 0u64;
    let streamed = tokio::select! {
        result = engine.stream(|frame| {
            if tx.try_send(frame.to_frame()).is_err() {
                dropped += 1;
            }
            frame.sequence() < MAX_FRAMES
        }) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            0
        }
    };

    drop(tx);
    let consumed = consumer.await?;
    info!(
        streamed,
        consumed,
        dropped,
        vsyncs = vsyncs.load(Ordering::Relaxed),
        stats = ?engine.stats(),
        "framegrab shutting down"
    );
    engine.teardown()?;
    tally.log_summary();
    Ok(())
}
