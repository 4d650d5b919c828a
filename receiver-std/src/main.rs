//! bresser-rx host receiver
//!
//! Thread-based receiver using std::sync::mpsc channels. Captured frames
//! arrive on stdin (one hex frame per line, the radio driver's output),
//! the pipeline runs as a single-threaded actor that owns the sensor
//! table, and readings leave as NDJSON on stdout. Logs go to stderr and
//! are controlled with `RUST_LOG`.

mod cli;
mod input;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use bresser_rx::comm::{self, LineReader};
use bresser_rx::dispatch::Dispatcher;
use bresser_rx::filter::SensorFilter;
use bresser_rx::frame::{FrameSource, Poll, RawFrame};
use bresser_rx::pipeline::{Pipeline, PipelineConfig, PipelineStats};
use bresser_rx::protocol::{DeviceMessage, HostCommand, MsgBuffer, MAX_MSG_LEN, VERSION};
use bresser_rx::reading::{Reading, ReadingKind, SensorIdentity};
use bresser_rx::table::SensorSnapshot;

use cli::Cli;
use input::InputLine;

// ── Shared state ─────────────────────────────────────────────────────

static RECEIVING: AtomicBool = AtomicBool::new(true);
static STOP: AtomicBool = AtomicBool::new(false);
static SENSORS: AtomicU8 = AtomicU8::new(0);
static STATS: PipelineStats = PipelineStats::new();
static FILTER: Mutex<SensorFilter> = Mutex::new(SensorFilter::new());

/// Boot time, captured once in main, used for uptime and frame timestamps.
static BOOT_INSTANT: Mutex<Option<Instant>> = Mutex::new(None);

fn uptime_secs() -> u32 {
    BOOT_INSTANT
        .lock()
        .ok()
        .and_then(|i| i.map(|boot| boot.elapsed().as_secs() as u32))
        .unwrap_or(0)
}

fn uptime_millis() -> u64 {
    BOOT_INSTANT
        .lock()
        .ok()
        .and_then(|i| i.map(|boot| boot.elapsed().as_millis() as u64))
        .unwrap_or(0)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Allow RUST_LOG to override the default level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Ok(mut boot) = BOOT_INSTANT.lock() {
        *boot = Some(Instant::now());
    }

    let radio = cli.radio_config()?;
    let config = cli.pipeline_config()?;
    let kinds = cli.enabled_kinds();
    let chip = radio.chip.as_str();

    log::info!("bresser-rx v{} starting (std)", VERSION);
    log::info!(
        "Radio {} cs={} irq={} gpio={} rst={:?}",
        radio.chip,
        radio.pins.cs,
        radio.pins.irq,
        radio.pins.gpio,
        radio.pins.rst
    );
    log::info!(
        "Decoders {:?}, dedup {} ms, stale after {} ms, {} measurements enabled",
        config.decoders.iter().map(|d| d.as_str()).collect::<Vec<_>>(),
        config.dedup_window_ms,
        config.stale_after_ms,
        kinds.len()
    );

    if let Ok(mut filter) = FILTER.lock() {
        *filter = config.filter.clone();
    }

    // ── Channels ─────────────────────────────────────────────────────

    let (frame_tx, frame_rx) = mpsc::sync_channel::<RawFrame>(16);
    let (filter_tx, filter_rx) = mpsc::sync_channel::<SensorFilter>(4);
    let (output_tx, output_rx) = mpsc::sync_channel::<MsgBuffer>(32);

    // ── Output thread ────────────────────────────────────────────────

    let output = thread::Builder::new()
        .name("output".into())
        .spawn(move || {
            output_thread(output_rx);
        })?;
    log::debug!("Output thread spawned");

    // ── Pipeline thread ──────────────────────────────────────────────

    let pipeline_output_tx = output_tx.clone();
    let idle = Duration::from_millis(cli.idle_ms.max(1));
    let pipeline = thread::Builder::new()
        .name("pipeline".into())
        .spawn(move || {
            pipeline_thread(config, kinds, frame_rx, filter_rx, idle, pipeline_output_tx);
        })?;
    log::debug!("Pipeline thread spawned");

    // ── Status thread ────────────────────────────────────────────────

    let status = if cli.status_secs > 0 {
        let status_output_tx = output_tx.clone();
        let interval = Duration::from_secs(cli.status_secs);
        let handle = thread::Builder::new()
            .name("status".into())
            .spawn(move || {
                status_thread(interval, chip, status_output_tx);
            })?;
        log::debug!("Status thread spawned");
        Some(handle)
    } else {
        None
    };

    // ── Input loop (main thread) ─────────────────────────────────────

    let result = input_loop(&frame_tx, &filter_tx, &output_tx, chip);

    // Closing the frame channel lets the pipeline drain what is queued
    drop(frame_tx);
    drop(filter_tx);
    if pipeline.join().is_err() {
        log::error!("Pipeline thread panicked");
    }

    send_message(&output_tx, &status_message(chip));
    STOP.store(true, Ordering::Release);
    drop(output_tx);
    if let Some(handle) = status {
        let _ = handle.join();
    }
    let _ = output.join();

    let s = STATS.snapshot();
    log::info!(
        "Done: {} frames, {} decoded, {} unrecognized, {} readings published",
        s.frames,
        s.decoded,
        s.no_match,
        s.dispatched
    );
    result
}

// ── Input loop ───────────────────────────────────────────────────────

fn input_loop(
    frame_tx: &SyncSender<RawFrame>,
    filter_tx: &SyncSender<SensorFilter>,
    output_tx: &SyncSender<MsgBuffer>,
    chip: &'static str,
) -> anyhow::Result<()> {
    let mut reader = LineReader::new();
    let mut chunk = [0u8; 256];
    let mut stdin = io::stdin().lock();
    let mut line_no = 0usize;

    loop {
        if STOP.load(Ordering::Acquire) {
            log::info!("Stop requested, no longer reading input");
            return Ok(());
        }
        let n = match stdin.read(&mut chunk) {
            Ok(0) => {
                log::info!("End of input after {} lines", line_no);
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        for &byte in &chunk[..n] {
            let Some(line) = reader.feed(byte) else { continue };
            line_no += 1;
            match input::parse_line(line) {
                Ok(Some(InputLine::Frame { bytes, rssi, channel })) => {
                    forward_frame(frame_tx, &bytes, rssi, channel)?;
                }
                Ok(Some(InputLine::Command(cmd))) => {
                    handle_host_command(cmd, filter_tx, output_tx, chip);
                }
                Ok(None) => {}
                Err(e) => log::warn!("Line {}: {:#}", line_no, e),
            }
        }
    }
}

fn forward_frame(frame_tx: &SyncSender<RawFrame>, bytes: &[u8], rssi: i8, channel: u8) -> anyhow::Result<()> {
    if !RECEIVING.load(Ordering::Relaxed) {
        return Ok(());
    }
    let frame = match RawFrame::new(bytes, rssi, channel, uptime_millis()) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Dropping frame: {}", e);
            return Ok(());
        }
    };
    // Blocking send: a full queue slows input down instead of losing frames
    frame_tx
        .send(frame)
        .map_err(|_| anyhow::anyhow!("pipeline thread exited"))
}

fn handle_host_command(
    cmd: HostCommand,
    filter_tx: &SyncSender<SensorFilter>,
    output_tx: &SyncSender<MsgBuffer>,
    chip: &'static str,
) {
    let is_status_request = matches!(cmd, HostCommand::GetStatus);

    let Ok(mut filter) = FILTER.lock() else {
        log::error!("Filter lock poisoned, ignoring command");
        return;
    };
    let mut receiving = RECEIVING.load(Ordering::Relaxed);
    let changed = comm::handle_command(cmd, &mut filter, &mut receiving);
    RECEIVING.store(receiving, Ordering::Relaxed);
    if changed && filter_tx.try_send(filter.clone()).is_err() {
        log::warn!("Filter update queue full, change not applied");
    }
    drop(filter);

    if is_status_request {
        send_message(output_tx, &status_message(chip));
    }
}

// ── Pipeline thread ──────────────────────────────────────────────────

/// Capture metadata of the frame being processed
#[derive(Clone, Copy, Default)]
struct FrameMeta {
    rssi: i8,
    ts: u64,
}

/// `FrameSource` over the input channel. Timeouts become idle polls so the
/// pipeline keeps sweeping for stale sensors while the band is quiet.
struct ChannelSource<'a> {
    frames: Receiver<RawFrame>,
    filters: Receiver<SensorFilter>,
    idle: Duration,
    current: &'a Cell<FrameMeta>,
}

impl FrameSource for ChannelSource<'_> {
    fn next_frame(&mut self) -> Poll {
        match self.frames.recv_timeout(self.idle) {
            Ok(frame) => {
                self.current.set(FrameMeta {
                    rssi: frame.rssi(),
                    ts: frame.timestamp_ms(),
                });
                Poll::Frame(frame)
            }
            Err(RecvTimeoutError::Timeout) => Poll::Idle {
                now_ms: uptime_millis(),
            },
            Err(RecvTimeoutError::Disconnected) => Poll::Closed,
        }
    }

    fn poll_filter(&mut self) -> Option<SensorFilter> {
        self.filters.try_iter().last()
    }
}

fn pipeline_thread(
    config: PipelineConfig,
    kinds: Vec<ReadingKind>,
    frame_rx: Receiver<RawFrame>,
    filter_rx: Receiver<SensorFilter>,
    idle: Duration,
    output_tx: SyncSender<MsgBuffer>,
) {
    log::info!("Pipeline thread started");

    let current = Cell::new(FrameMeta::default());
    let active: RefCell<HashSet<SensorIdentity>> = RefCell::default();

    let reading_sink = |reading: &Reading| {
        let meta = current.get();
        let mut buf = new_buffer();
        if let Some(len) = comm::serialize_reading(reading, meta.rssi, meta.ts, &mut buf) {
            buf.truncate(len);
            queue_output(&output_tx, buf);
        }
    };

    let update_sink = |snapshot: &SensorSnapshot| {
        let mut active = active.borrow_mut();
        if snapshot.stale {
            active.remove(&snapshot.identity);
            let mut buf = new_buffer();
            if let Some(len) =
                comm::serialize_stale(&snapshot.identity, snapshot.last_seen_ms, uptime_millis(), &mut buf)
            {
                buf.truncate(len);
                queue_output(&output_tx, buf);
            }
        } else {
            active.insert(snapshot.identity);
            log::debug!("{}: {} current readings", snapshot.identity, snapshot.readings.len());
        }
        SENSORS.store(active.len().min(u8::MAX as usize) as u8, Ordering::Relaxed);
    };

    let mut dispatcher = Dispatcher::new();
    for kind in kinds {
        dispatcher.register(kind, &reading_sink);
    }
    dispatcher.set_update_sink(Some(&update_sink));

    let mut pipeline = Pipeline::new(config, dispatcher, &STATS);
    let mut source = ChannelSource {
        frames: frame_rx,
        filters: filter_rx,
        idle,
        current: &current,
    };
    let processed = pipeline.run(&mut source, &STOP);
    log::info!(
        "Pipeline thread exiting: {} frames processed, {} sensors tracked",
        processed,
        pipeline.table().len()
    );
}

// ── Output thread ────────────────────────────────────────────────────

fn output_thread(output_rx: Receiver<MsgBuffer>) {
    log::info!("Output thread started");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    while let Ok(msg) = output_rx.recv() {
        if let Err(e) = out.write_all(&msg).and_then(|_| out.flush()) {
            // Nobody is listening any more; stop the whole receiver
            log::error!("Writing to stdout failed: {}", e);
            STOP.store(true, Ordering::Release);
            break;
        }
    }
}

// ── Status thread ────────────────────────────────────────────────────

fn status_thread(interval: Duration, chip: &'static str, output_tx: SyncSender<MsgBuffer>) {
    let tick = Duration::from_millis(100);
    let mut elapsed = Duration::ZERO;
    while !STOP.load(Ordering::Acquire) {
        thread::sleep(tick);
        elapsed += tick;
        if elapsed >= interval {
            elapsed = Duration::ZERO;
            send_message(&output_tx, &status_message(chip));
        }
    }
}

fn status_message(chip: &'static str) -> DeviceMessage<'static> {
    DeviceMessage::status(
        RECEIVING.load(Ordering::Relaxed),
        uptime_secs(),
        &STATS.snapshot(),
        SENSORS.load(Ordering::Relaxed),
        chip,
    )
}

// ── Message helpers ──────────────────────────────────────────────────

fn new_buffer() -> MsgBuffer {
    let mut buf = MsgBuffer::new();
    buf.resize_default(MAX_MSG_LEN).ok();
    buf
}

fn queue_output(output_tx: &SyncSender<MsgBuffer>, buf: MsgBuffer) {
    if output_tx.try_send(buf).is_err() {
        log::warn!("Output queue full, message dropped");
    }
}

fn send_message(output_tx: &SyncSender<MsgBuffer>, msg: &DeviceMessage) {
    let mut buf = new_buffer();
    if let Some(len) = comm::serialize_message(msg, &mut buf) {
        buf.truncate(len);
        queue_output(output_tx, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_source_polls() {
        let (frame_tx, frame_rx) = mpsc::sync_channel(4);
        let (filter_tx, filter_rx) = mpsc::sync_channel(4);
        let current = Cell::new(FrameMeta::default());
        let mut source = ChannelSource {
            frames: frame_rx,
            filters: filter_rx,
            idle: Duration::from_millis(5),
            current: &current,
        };

        frame_tx.send(RawFrame::new(&[0xD4, 0x01], -77, 2, 1234).unwrap()).unwrap();
        assert!(matches!(source.next_frame(), Poll::Frame(_)));
        assert_eq!(current.get().rssi, -77);
        assert_eq!(current.get().ts, 1234);

        assert!(matches!(source.next_frame(), Poll::Idle { .. }));

        let strict = SensorFilter {
            min_rssi: -60,
            ..SensorFilter::new()
        };
        filter_tx.send(SensorFilter::new()).unwrap();
        filter_tx.send(strict.clone()).unwrap();
        assert_eq!(source.poll_filter(), Some(strict));
        assert_eq!(source.poll_filter(), None);

        drop(frame_tx);
        assert!(matches!(source.next_frame(), Poll::Closed));
    }
}
