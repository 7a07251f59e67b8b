//! Real-time bridge
//!
//! Connects a fixed-block, hard real-time callback to a producer that renders
//! on its own schedule (an embedded synthesis engine on a worker thread).
//!
//! - Two `rtrb` rings carry audio: synthesized output towards the callback,
//!   captured input away from it.
//! - Status flags, the backlog counter and the underrun counter are atomics.
//!   Nothing on the callback side locks, allocates or logs.
//! - The callback tolerates a bounded run of underruns, emitting silence,
//!   before it declares the stream dead and stops producing until
//!   [`BridgeControl::restart`].
//! - Pausing is a separate axis: it silences the callback and reports
//!   `Paused`/`Resumed` rather than a failure.
//!
//! Notifications travel back through a third ring and are drained on the
//! control side, which is where they get logged.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::config::{BridgeConfig, EngineMode};
use crate::value::Value;

const FLAG_INVALID: u32 = 1;
const FLAG_FATAL: u32 = 1 << 1;
const FLAG_PAUSED: u32 = 1 << 2;
const SILENT_FLAGS: u32 = FLAG_INVALID | FLAG_FATAL | FLAG_PAUSED;

/// Notifications from the real-time side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Sustained underrun; production has stopped
    PerformanceEnded,
    /// The callback observed the pause flag
    Paused,
    /// The callback observed the pause flag clearing
    Resumed,
}

struct Shared {
    flags: AtomicU32,
    /// Frames produced but not yet consumed by the callback
    backlog: AtomicUsize,
    consecutive_underruns: AtomicU32,
    needs_render: AtomicBool,
    production_attempts: AtomicU64,
}

/// Something that renders audio away from the real-time thread.
pub trait SynthEngine: Send + 'static {
    /// Render `output.len()` frames; `input` holds the same number of captured frames.
    fn render(&mut self, input: &[f32], output: &mut [f32]);

    /// Handle a control message forwarded from the owning node.
    fn handle(&mut self, _command: &Value) {}
}

/// The four ends of a freshly created bridge.
pub struct BridgeParts {
    pub realtime: RealtimeBridge,
    pub producer: BridgeProducer,
    pub control: BridgeControl,
    pub events: BridgeEvents,
}

/// Create a bridge whose callback runs in blocks of `block_size` frames.
pub fn bridge(block_size: usize, config: &BridgeConfig) -> BridgeParts {
    let capacity = block_size * config.ring_blocks;
    let threshold = block_size * config.backlog_threshold_blocks;

    let (out_tx, out_rx) = RingBuffer::<f32>::new(capacity);
    let (in_tx, in_rx) = RingBuffer::<f32>::new(capacity);
    let (event_tx, event_rx) = RingBuffer::<BridgeEvent>::new(16);

    let shared = Arc::new(Shared {
        flags: AtomicU32::new(0),
        backlog: AtomicUsize::new(0),
        consecutive_underruns: AtomicU32::new(0),
        needs_render: AtomicBool::new(true),
        production_attempts: AtomicU64::new(0),
    });

    BridgeParts {
        realtime: RealtimeBridge {
            shared: shared.clone(),
            out_rx,
            in_tx,
            events: event_tx,
            threshold,
            max_underruns: config.max_consecutive_underruns,
            paused_seen: false,
        },
        producer: BridgeProducer {
            shared: shared.clone(),
            out_tx,
            in_rx,
            block_size,
            threshold,
            scratch_in: vec![0.0; block_size],
            scratch_out: vec![0.0; block_size],
        },
        control: BridgeControl { shared },
        events: BridgeEvents { rx: event_rx },
    }
}

/// Callback side. Owned by the audio thread.
pub struct RealtimeBridge {
    shared: Arc<Shared>,
    out_rx: Consumer<f32>,
    in_tx: Producer<f32>,
    events: Producer<BridgeEvent>,
    threshold: usize,
    max_underruns: u32,
    paused_seen: bool,
}

impl RealtimeBridge {
    /// Run one real-time block.
    ///
    /// `output` always ends up fully written, with silence when nothing can
    /// be produced.
    pub fn process(&mut self, input: Option<&[f32]>, output: &mut [f32]) {
        let flags = self.shared.flags.load(Ordering::Acquire);

        let paused = flags & FLAG_PAUSED != 0;
        if paused != self.paused_seen {
            self.paused_seen = paused;
            let event = if paused {
                BridgeEvent::Paused
            } else {
                BridgeEvent::Resumed
            };
            let _ = self.events.push(event);
        }

        if flags & SILENT_FLAGS != 0 {
            output.iter_mut().for_each(|s| *s = 0.0);
            return;
        }

        self.shared
            .production_attempts
            .fetch_add(1, Ordering::Relaxed);

        if let Some(input) = input {
            // Drop the block rather than write half of it
            if self.in_tx.slots() >= input.len() {
                for &s in input {
                    let _ = self.in_tx.push(s);
                }
            }
        }

        let needed = output.len();
        if self.out_rx.slots() >= needed {
            for sample in output.iter_mut() {
                *sample = self.out_rx.pop().unwrap_or(0.0);
            }
            self.shared.backlog.fetch_sub(needed, Ordering::AcqRel);
            self.shared
                .consecutive_underruns
                .store(0, Ordering::Release);
        } else {
            output.iter_mut().for_each(|s| *s = 0.0);
            let failures = self
                .shared
                .consecutive_underruns
                .fetch_add(1, Ordering::AcqRel)
                + 1;
            if failures >= self.max_underruns {
                self.shared.flags.fetch_or(FLAG_FATAL, Ordering::AcqRel);
                let _ = self.events.push(BridgeEvent::PerformanceEnded);
                return;
            }
        }

        if self.shared.backlog.load(Ordering::Acquire) < self.threshold {
            self.shared.needs_render.store(true, Ordering::Release);
        }
    }
}

/// Producer side. Owned by whoever drives the engine.
pub struct BridgeProducer {
    shared: Arc<Shared>,
    out_tx: Producer<f32>,
    in_rx: Consumer<f32>,
    block_size: usize,
    threshold: usize,
    scratch_in: Vec<f32>,
    scratch_out: Vec<f32>,
}

impl BridgeProducer {
    /// Refill the output ring if the backlog has dropped below the threshold.
    ///
    /// Renders nothing while the backlog is healthy, then fills the ring to
    /// capacity in one burst. Returns the number of frames rendered.
    pub fn pump(&mut self, engine: &mut dyn SynthEngine) -> usize {
        if self.shared.flags.load(Ordering::Acquire) & SILENT_FLAGS != 0 {
            return 0;
        }
        if self.shared.backlog.load(Ordering::Acquire) >= self.threshold {
            return 0;
        }

        let mut rendered = 0;
        while self.out_tx.slots() >= self.block_size {
            for s in self.scratch_in.iter_mut() {
                *s = self.in_rx.pop().unwrap_or(0.0);
            }
            engine.render(&self.scratch_in, &mut self.scratch_out);

            // Count before publishing so the callback never subtracts frames
            // the counter has not seen yet.
            self.shared
                .backlog
                .fetch_add(self.block_size, Ordering::AcqRel);
            for &s in &self.scratch_out {
                let _ = self.out_tx.push(s);
            }
            rendered += self.block_size;
        }
        self.shared.needs_render.store(false, Ordering::Release);
        rendered
    }

    /// Whether the callback has asked for more audio since the last pump.
    pub fn needs_render(&self) -> bool {
        self.shared.needs_render.load(Ordering::Acquire)
    }
}

/// Status handle shared by the owning node.
#[derive(Clone)]
pub struct BridgeControl {
    shared: Arc<Shared>,
}

impl BridgeControl {
    pub fn pause(&self) {
        self.shared.flags.fetch_or(FLAG_PAUSED, Ordering::AcqRel);
    }

    pub fn resume(&self) {
        self.shared.flags.fetch_and(!FLAG_PAUSED, Ordering::AcqRel);
    }

    /// Clear a fatal stop and start counting underruns from zero.
    pub fn restart(&self) {
        self.shared
            .consecutive_underruns
            .store(0, Ordering::Release);
        self.shared.flags.fetch_and(!FLAG_FATAL, Ordering::AcqRel);
    }

    /// Mark the stream state as unusable (e.g. the engine failed to start).
    pub fn invalidate(&self) {
        self.shared.flags.fetch_or(FLAG_INVALID, Ordering::AcqRel);
    }

    /// Mark the stream state usable again.
    pub fn validate(&self) {
        self.shared.flags.fetch_and(!FLAG_INVALID, Ordering::AcqRel);
    }

    pub fn is_fatal(&self) -> bool {
        self.shared.flags.load(Ordering::Acquire) & FLAG_FATAL != 0
    }

    pub fn is_paused(&self) -> bool {
        self.shared.flags.load(Ordering::Acquire) & FLAG_PAUSED != 0
    }

    pub fn backlog(&self) -> usize {
        self.shared.backlog.load(Ordering::Acquire)
    }

    pub fn consecutive_underruns(&self) -> u32 {
        self.shared.consecutive_underruns.load(Ordering::Acquire)
    }

    /// Callback invocations that got past the status flags.
    pub fn production_attempts(&self) -> u64 {
        self.shared.production_attempts.load(Ordering::Relaxed)
    }
}

/// Receiving end of [`BridgeEvent`]s.
pub struct BridgeEvents {
    rx: Consumer<BridgeEvent>,
}

impl BridgeEvents {
    /// Pop every pending event.
    pub fn drain(&mut self) -> impl Iterator<Item = BridgeEvent> + '_ {
        core::iter::from_fn(move || self.rx.pop().ok())
    }
}

enum EngineCommand {
    Control(Value),
    Shutdown,
}

/// Runs a [`SynthEngine`] and the producer side of its bridge on a dedicated thread.
///
/// Dropping the worker stops and joins the thread.
pub struct EngineWorker {
    tx: Sender<EngineCommand>,
    handle: Option<JoinHandle<()>>,
}

impl EngineWorker {
    /// Spawn the worker; it pumps the bridge at least every `poll`.
    pub fn spawn(
        mut producer: BridgeProducer,
        mut engine: Box<dyn SynthEngine>,
        poll: Duration,
    ) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("patchbay-engine".into())
            .spawn(move || loop {
                match rx.recv_timeout(poll) {
                    Ok(EngineCommand::Control(command)) => engine.handle(&command),
                    Ok(EngineCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                producer.pump(engine.as_mut());
            })?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Forward a control message to the engine.
    pub fn send(&self, command: Value) {
        let _ = self.tx.send(EngineCommand::Control(command));
    }
}

/// Drives an engine and the producer side of its bridge, either from a
/// worker thread or from the render loop.
pub enum EngineDriver {
    Worker(EngineWorker),
    Inline {
        producer: BridgeProducer,
        engine: Box<dyn SynthEngine>,
    },
}

impl EngineDriver {
    /// Start driving `engine`. `poll` only matters for the threaded mode.
    pub fn start(
        mode: EngineMode,
        producer: BridgeProducer,
        engine: Box<dyn SynthEngine>,
        poll: Duration,
    ) -> std::io::Result<Self> {
        match mode {
            EngineMode::Threaded => EngineWorker::spawn(producer, engine, poll).map(EngineDriver::Worker),
            EngineMode::Inline => Ok(EngineDriver::Inline { producer, engine }),
        }
    }

    /// Forward a control message to the engine.
    pub fn send(&mut self, command: Value) {
        match self {
            EngineDriver::Worker(worker) => worker.send(command),
            EngineDriver::Inline { engine, .. } => engine.handle(&command),
        }
    }

    /// Refill the bridge ahead of a quantum. A no-op for the threaded mode.
    pub fn before_quantum(&mut self) {
        if let EngineDriver::Inline { producer, engine } = self {
            producer.pump(engine.as_mut());
        }
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(EngineCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("engine worker panicked");
            }
        }
    }
}
