use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::diagnostic::Diagnostic;
use crate::registry::panic_message;
use crate::transport::DatagramLink;

pub mod frame;
pub mod stats;

pub use frame::{
    decode_datagram, encode_datagram, encode_meters, FrameError, FrameKind, FramePayload,
    MeterReading, MeterUnits, StreamFrame,
};
pub use stats::{DemuxStats, SequenceObservation, StreamCounters};

/// Receives decoded frames for the stream ids it registered for.
pub trait StreamConsumer: Send {
    fn on_frame(&mut self, frame: &StreamFrame) -> Result<(), String>;
}

impl<F> StreamConsumer for F
where
    F: FnMut(&StreamFrame) -> Result<(), String> + Send,
{
    fn on_frame(&mut self, frame: &StreamFrame) -> Result<(), String> {
        self(frame)
    }
}

impl StreamConsumer for mpsc::UnboundedSender<StreamFrame> {
    fn on_frame(&mut self, frame: &StreamFrame) -> Result<(), String> {
        self.send(frame.clone())
            .map_err(|_| "frame receiver dropped".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerHandle(u64);

impl ConsumerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Errors from the stream lane handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream lane is not running")]
    LaneClosed,
}

/// Limits for frames that arrive before anyone registered for their stream.
#[derive(Debug, Clone, Copy)]
pub struct GraceSettings {
    pub period: Duration,
    pub capacity: usize,
}

struct Registered {
    handle: ConsumerHandle,
    stream_id: u16,
    consumer: Box<dyn StreamConsumer>,
}

#[derive(Debug)]
struct Unclaimed {
    first_seen: Instant,
    frames: VecDeque<StreamFrame>,
}

/// Routes datagrams to stream consumers.
///
/// Synchronous and clock-free: callers pass `now`, which keeps grace and
/// inactivity handling testable without a runtime.
///
/// # Guarantees
/// * Malformed datagrams are counted and dropped before they touch any
///   sequence counter.
/// * Consumers of one stream run in registration order; a failing consumer
///   is reported and the rest still receive the frame.
/// * Every decoded frame is delivered. Duplicates, late reordered frames and
///   restarted counters are counted as stale and sequence tracking resyncs.
pub struct StreamDemux {
    grace: GraceSettings,
    inactivity: Duration,
    consumers: Vec<Registered>,
    unclaimed: HashMap<u16, Unclaimed>,
    abandoned: HashSet<u16>,
    stats: Arc<Mutex<DemuxStats>>,
    next_id: u64,
    last_frame: Option<Instant>,
    active: bool,
    notices: Vec<Diagnostic>,
}

impl std::fmt::Debug for StreamDemux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDemux")
            .field("consumers", &self.consumers.len())
            .field("unclaimed", &self.unclaimed.len())
            .field("active", &self.active)
            .finish()
    }
}

impl StreamDemux {
    pub fn new(grace: GraceSettings, inactivity: Duration) -> Self {
        Self {
            grace,
            inactivity,
            consumers: Vec::new(),
            unclaimed: HashMap::new(),
            abandoned: HashSet::new(),
            stats: Arc::new(Mutex::new(DemuxStats::default())),
            next_id: 0,
            last_frame: None,
            active: false,
            notices: Vec::new(),
        }
    }

    /// Shared view of the counters, readable while the lane runs.
    pub fn stats_handle(&self) -> Arc<Mutex<DemuxStats>> {
        self.stats.clone()
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats.lock().clone()
    }

    /// Decodes and routes one datagram.
    pub fn ingest(&mut self, bytes: &[u8], now: Instant) -> Result<(), FrameError> {
        let frame = match decode_datagram(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, len = bytes.len(), "dropping malformed datagram");
                self.stats.lock().malformed += 1;
                return Err(err);
            }
        };

        self.last_frame = Some(now);
        if !self.active {
            self.active = true;
            self.notices.push(Diagnostic::StreamActivity { active: true });
        }

        let observation = self
            .stats
            .lock()
            .record_sequence(frame.stream_id, frame.sequence);
        match observation {
            SequenceObservation::Stale => {
                trace!(stream_id = frame.stream_id, sequence = frame.sequence, "sequence resync");
            }
            SequenceObservation::Gap { missing } => {
                debug!(stream_id = frame.stream_id, missing, "sequence gap");
            }
            SequenceObservation::First | SequenceObservation::InOrder => {}
        }

        if self.consumers.iter().any(|c| c.stream_id == frame.stream_id) {
            self.deliver(&frame);
        } else {
            self.hold(frame, now);
        }
        Ok(())
    }

    /// Expires grace buffers and reports streaming going quiet.
    pub fn sweep(&mut self, now: Instant) {
        let period = self.grace.period;
        let expired: Vec<u16> = self
            .unclaimed
            .iter()
            .filter(|(_, u)| now.saturating_duration_since(u.first_seen) >= period)
            .map(|(id, _)| *id)
            .collect();
        for stream_id in expired {
            self.abandon(stream_id);
        }

        if self.active {
            let quiet = self
                .last_frame
                .map_or(true, |at| now.saturating_duration_since(at) >= self.inactivity);
            if quiet {
                self.active = false;
                self.notices.push(Diagnostic::StreamActivity { active: false });
            }
        }
    }

    /// Adds a consumer and hands it any frames held for its stream.
    pub fn register(&mut self, stream_id: u16, consumer: Box<dyn StreamConsumer>) -> ConsumerHandle {
        self.next_id += 1;
        let handle = ConsumerHandle(self.next_id);
        self.consumers.push(Registered {
            handle,
            stream_id,
            consumer,
        });
        self.abandoned.remove(&stream_id);
        if let Some(held) = self.unclaimed.remove(&stream_id) {
            debug!(stream_id, frames = held.frames.len(), "delivering grace buffer");
            for frame in held.frames {
                self.deliver(&frame);
            }
        }
        handle
    }

    /// Returns `false` when the handle was not registered.
    pub fn unregister(&mut self, handle: ConsumerHandle) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| c.handle != handle);
        self.consumers.len() != before
    }

    /// Drops every consumer and held frame.
    pub fn clear(&mut self) {
        self.consumers.clear();
        self.unclaimed.clear();
        self.abandoned.clear();
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Diagnostics raised since the last call.
    pub fn take_notices(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.notices)
    }

    fn deliver(&mut self, frame: &StreamFrame) {
        let mut failures = 0u64;
        for entry in self
            .consumers
            .iter_mut()
            .filter(|c| c.stream_id == frame.stream_id)
        {
            let consumer = &mut entry.consumer;
            let result = catch_unwind(AssertUnwindSafe(|| consumer.on_frame(frame)))
                .unwrap_or_else(|panic| Err(panic_message(panic.as_ref())));
            if let Err(error) = result {
                warn!(stream_id = frame.stream_id, consumer = entry.handle.0, %error, "stream consumer failed");
                failures += 1;
                self.notices.push(Diagnostic::ConsumerFailed {
                    consumer: entry.handle,
                    stream_id: frame.stream_id,
                    error,
                });
            }
        }
        if failures > 0 {
            self.stats.lock().consumer_failures += failures;
        }
    }

    fn hold(&mut self, frame: StreamFrame, now: Instant) {
        let stream_id = frame.stream_id;
        if self.abandoned.contains(&stream_id) {
            self.stats.lock().discarded += 1;
            return;
        }
        let held = self.unclaimed.entry(stream_id).or_insert_with(|| Unclaimed {
            first_seen: now,
            frames: VecDeque::new(),
        });
        if now.saturating_duration_since(held.first_seen) >= self.grace.period {
            self.abandon(stream_id);
            self.stats.lock().discarded += 1;
            return;
        }
        held.frames.push_back(frame);
        if held.frames.len() > self.grace.capacity {
            held.frames.pop_front();
            self.stats.lock().discarded += 1;
        }
    }

    fn abandon(&mut self, stream_id: u16) {
        if let Some(held) = self.unclaimed.remove(&stream_id) {
            debug!(stream_id, frames = held.frames.len(), "no consumer registered, discarding held frames");
            self.stats.lock().discarded += held.frames.len() as u64;
        }
        self.abandoned.insert(stream_id);
    }
}

enum LaneCommand {
    Register {
        stream_id: u16,
        consumer: Box<dyn StreamConsumer>,
        reply: oneshot::Sender<ConsumerHandle>,
    },
    Unregister {
        handle: ConsumerHandle,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle for registering consumers with a running lane.
#[derive(Clone)]
pub struct LaneHandle {
    commands: mpsc::UnboundedSender<LaneCommand>,
    stats: Arc<Mutex<DemuxStats>>,
    local_port: u16,
}

impl std::fmt::Debug for LaneHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneHandle")
            .field("local_port", &self.local_port)
            .finish()
    }
}

impl LaneHandle {
    pub async fn register(
        &self,
        stream_id: u16,
        consumer: Box<dyn StreamConsumer>,
    ) -> Result<ConsumerHandle, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LaneCommand::Register {
                stream_id,
                consumer,
                reply,
            })
            .map_err(|_| StreamError::LaneClosed)?;
        rx.await.map_err(|_| StreamError::LaneClosed)
    }

    pub async fn unregister(&self, handle: ConsumerHandle) -> Result<bool, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LaneCommand::Unregister { handle, reply })
            .map_err(|_| StreamError::LaneClosed)?;
        rx.await.map_err(|_| StreamError::LaneClosed)
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats.lock().clone()
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

/// Task that owns the datagram endpoint and the demultiplexer.
#[derive(Debug)]
pub struct StreamLane {
    handle: LaneHandle,
    task: Option<JoinHandle<()>>,
}

impl StreamLane {
    /// Starts the lane on `link`. Diagnostics go to `diagnostics`.
    pub fn spawn(
        link: DatagramLink,
        demux: StreamDemux,
        sweep_every: Duration,
        diagnostics: mpsc::UnboundedSender<Diagnostic>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = LaneHandle {
            commands,
            stats: demux.stats_handle(),
            local_port: link.local_port(),
        };
        let task = tokio::spawn(run_lane(link, demux, rx, sweep_every, diagnostics));
        Self {
            handle,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> LaneHandle {
        self.handle.clone()
    }

    /// Unregisters every consumer, releases the endpoint and waits for the
    /// task to finish.
    pub async fn shutdown(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let (reply, rx) = oneshot::channel();
        if self
            .handle
            .commands
            .send(LaneCommand::Shutdown { reply })
            .is_ok()
        {
            let _ = rx.await;
        }
        if let Err(err) = task.await {
            if err.is_panic() {
                warn!("stream lane panicked");
            }
        }
    }
}

impl Drop for StreamLane {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_lane(
    mut link: DatagramLink,
    mut demux: StreamDemux,
    mut commands: mpsc::UnboundedReceiver<LaneCommand>,
    sweep_every: Duration,
    diagnostics: mpsc::UnboundedSender<Diagnostic>,
) {
    let port = link.local_port();
    debug!(port, "stream lane started");
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut link_open = true;

    loop {
        tokio::select! {
            datagram = link.recv(), if link_open => match datagram {
                Some(bytes) => {
                    // Already logged and counted.
                    let _ = demux.ingest(&bytes, Instant::now());
                }
                None => {
                    debug!(port, "datagram endpoint closed");
                    link_open = false;
                }
            },
            command = commands.recv() => match command {
                Some(LaneCommand::Register { stream_id, consumer, reply }) => {
                    let handle = demux.register(stream_id, consumer);
                    debug!(stream_id, consumer = handle.id(), "stream consumer registered");
                    let _ = reply.send(handle);
                }
                Some(LaneCommand::Unregister { handle, reply }) => {
                    let _ = reply.send(demux.unregister(handle));
                }
                Some(LaneCommand::Shutdown { reply }) => {
                    demux.clear();
                    link.shutdown();
                    forward_notices(&mut demux, &diagnostics);
                    let _ = reply.send(());
                    break;
                }
                None => break,
            },
            _ = sweep.tick() => demux.sweep(Instant::now()),
        }
        forward_notices(&mut demux, &diagnostics);
    }
    debug!(port, "stream lane stopped");
}

fn forward_notices(demux: &mut StreamDemux, diagnostics: &mpsc::UnboundedSender<Diagnostic>) {
    for notice in demux.take_notices() {
        // Nobody listening for diagnostics is fine.
        let _ = diagnostics.send(notice);
    }
}
