//! Streams: the bus's fixed set of ordered partitions.
//!
//! Each stream owns:
//! - a FIFO send queue drained by a single sender task, so the backing store
//!   sees one stream's batches in publish order
//! - an applier task consuming [`StreamEvent`]s from the backing store, which
//!   drops stale receipts and hands the rest to the [`BatchSink`]
//! - a reconnect driver, spawned on open and after every failure, that walks
//!   the configured [`BackoffSchedule`]
//!
//! State machine:
//!
//! ```text
//! Closed --open--> Opening --connected--> Open
//! Open --failure--> Buffering --connected/restored--> Open
//! Opening|Buffering --schedule exhausted, no fallback--> Closed (fatal)
//! ```
//!
//! While `Opening` or `Buffering`, sends queue up to `max_queue_length` and
//! are flushed in order once the stream is `Open`. A full queue rejects the
//! send at once. A fatal close fails everything still queued.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use backon::BackoffBuilder;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterError, AdapterEvents, BackingStore};
use crate::bus::{BusError, BusStats, Result};
use crate::message::{Message, MessageBatch};
use crate::utils::retry::{BackoffSchedule, ScheduledBackoff};

/// Connection state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Opening,
    Open,
    Buffering,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamState::Closed => "closed",
            StreamState::Opening => "opening",
            StreamState::Open => "open",
            StreamState::Buffering => "buffering",
        };
        f.write_str(name)
    }
}

/// Notifications from a backing store to its stream.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Received {
        sequence_id: u64,
        messages: Vec<Message>,
    },
    Failed(AdapterError),
    Restored,
}

/// Destination for batches a stream has accepted.
pub(crate) trait BatchSink: Send + Sync {
    fn apply(&self, batch: Arc<MessageBatch>);
}

/// Per-stream tuning taken from the bus configuration.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Sends allowed in the queue (including the one in flight).
    pub max_queue_length: usize,
    /// Reconnect schedule walked after every failure.
    pub reconnect: BackoffSchedule,
}

struct PendingSend {
    id: u64,
    messages: Arc<[Message]>,
    ack: oneshot::Sender<Result<()>>,
}

struct Shared {
    state: StreamState,
    queue: VecDeque<PendingSend>,
    next_send_id: u64,
    /// A reconnect driver is running.
    reconnecting: bool,
    /// Bumped for every driver spawned; stale drivers stop on mismatch.
    reconnect_epoch: u64,
    /// Retry budget shared by reconnects and resends; cleared once a send
    /// goes through.
    backoff: Option<ScheduledBackoff>,
    attempts: u32,
    fell_back: bool,
    /// Closed for good after the reconnect schedule ran out.
    fatal: bool,
    shut_down: bool,
}

fn reset_budget(shared: &mut Shared) {
    shared.backoff = None;
    shared.attempts = 0;
    shared.fell_back = false;
}

fn begin_reconnect(shared: &mut Shared) -> u64 {
    shared.reconnecting = true;
    shared.reconnect_epoch += 1;
    shared.reconnect_epoch
}

enum ReconnectStep {
    Stop,
    Attempt { attempt: u32, delay: Duration },
    Exhausted { attempts: u32, fell_back: bool },
}

enum SenderStep {
    Exit,
    Wait,
    Send(u64, Arc<[Message]>),
}

/// One ordered partition of the bus.
pub struct Stream {
    index: usize,
    store: Arc<dyn BackingStore>,
    options: StreamOptions,
    shared: Mutex<Shared>,
    wake: Notify,
    events: AdapterEvents,
    stats: Arc<BusStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Stream {
    /// Create the stream and spawn its sender and applier tasks.
    ///
    /// The stream starts `Closed`; call [`Stream::open`] to connect.
    pub(crate) fn start(
        index: usize,
        store: Arc<dyn BackingStore>,
        options: StreamOptions,
        sink: Arc<dyn BatchSink>,
        stats: Arc<BusStats>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stream = Arc::new(Self {
            index,
            store,
            options,
            shared: Mutex::new(Shared {
                state: StreamState::Closed,
                queue: VecDeque::new(),
                next_send_id: 0,
                reconnecting: false,
                reconnect_epoch: 0,
                backoff: None,
                attempts: 0,
                fell_back: false,
                fatal: false,
                shut_down: false,
            }),
            wake: Notify::new(),
            events: AdapterEvents::new(index, sender),
            stats: stats.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let sender_task = tokio::spawn(stream.clone().run_sender());
        let applier_task = tokio::spawn(run_applier(
            Arc::downgrade(&stream),
            index,
            receiver,
            sink,
            stats,
        ));
        stream.tasks.lock().extend([sender_task, applier_task]);
        stream
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().state
    }

    /// Sends waiting to be relayed (including the one in flight).
    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Begin connecting. A no-op unless the stream is `Closed` and has not
    /// failed fatally.
    pub(crate) fn open(self: &Arc<Self>) {
        let epoch = {
            let mut shared = self.shared.lock();
            if shared.state != StreamState::Closed || shared.fatal || shared.shut_down {
                return;
            }
            shared.state = StreamState::Opening;
            begin_reconnect(&mut shared)
        };
        info!(stream = self.index, store = self.store.name(), "Opening stream");
        self.spawn_reconnect(epoch);
    }

    /// Queue `messages` and wait until the backing store accepts them.
    pub(crate) async fn send(&self, messages: Vec<Message>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        {
            let mut shared = self.shared.lock();
            if shared.shut_down {
                return Err(BusError::ShutDown);
            }
            if shared.state == StreamState::Closed {
                return Err(BusError::StreamUnavailable { stream: self.index });
            }
            if shared.queue.len() >= self.options.max_queue_length {
                self.stats.record_backpressured();
                return Err(BusError::Backpressure {
                    stream: self.index,
                    capacity: self.options.max_queue_length,
                });
            }
            let id = shared.next_send_id;
            shared.next_send_id += 1;
            shared.queue.push_back(PendingSend {
                id,
                messages: messages.into(),
                ack,
            });
        }
        self.wake.notify_one();
        done.await.unwrap_or(Err(BusError::ShutDown))
    }

    /// Stop all tasks and fail anything still queued.
    pub(crate) async fn shutdown(&self) {
        let drained = {
            let mut shared = self.shared.lock();
            if shared.shut_down {
                return;
            }
            shared.shut_down = true;
            shared.state = StreamState::Closed;
            shared.reconnecting = false;
            std::mem::take(&mut shared.queue)
        };
        for pending in drained {
            let _ = pending.ack.send(Err(BusError::ShutDown));
        }
        self.wake.notify_one();
        self.store.close(self.index).await;
        self.abort_tasks();
        debug!(stream = self.index, "Stream shut down");
    }

    pub(crate) fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, epoch: u64) {
        let task = tokio::spawn(self.clone().reconnect(epoch));
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Walk the reconnect schedule until the store opens or the budget runs
    /// out.
    ///
    /// The budget carries over between reconnects until a send succeeds, so
    /// a store that accepts connections but rejects every send still ends up
    /// closed.
    async fn reconnect(self: Arc<Self>, epoch: u64) {
        loop {
            let (attempt, delay) = match self.next_reconnect_step(epoch) {
                ReconnectStep::Stop => return,
                ReconnectStep::Exhausted {
                    attempts,
                    fell_back,
                } => {
                    self.exhausted(attempts, fell_back, epoch).await;
                    return;
                }
                ReconnectStep::Attempt { attempt, delay } => (attempt, delay),
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !self.is_current(epoch) {
                return;
            }
            match self.store.open(self.index, self.events.clone()).await {
                Ok(()) => {
                    self.mark_open(attempt, Some(epoch));
                    return;
                }
                Err(e) => {
                    warn!(
                        stream = self.index,
                        attempt,
                        error = %e,
                        "Backing store connect failed"
                    );
                }
            }
        }
    }

    fn next_reconnect_step(&self, epoch: u64) -> ReconnectStep {
        let mut shared = self.shared.lock();
        if shared.shut_down || !shared.reconnecting || shared.reconnect_epoch != epoch {
            return ReconnectStep::Stop;
        }
        let schedule = &self.options.reconnect;
        let next = shared
            .backoff
            .get_or_insert_with(|| schedule.clone().build())
            .next();
        match next {
            Some(delay) => {
                shared.attempts += 1;
                ReconnectStep::Attempt {
                    attempt: shared.attempts,
                    delay,
                }
            }
            None => ReconnectStep::Exhausted {
                attempts: shared.attempts,
                fell_back: std::mem::replace(&mut shared.fell_back, true),
            },
        }
    }

    async fn exhausted(&self, attempts: u32, fell_back: bool, epoch: u64) {
        if fell_back {
            self.close_fatal(attempts, epoch, "sends still failing after fallback");
            return;
        }
        match self.store.fall_back(self.index, self.events.clone()).await {
            Ok(true) => {
                info!(stream = self.index, attempts, "Backing store fell back");
                self.mark_open(attempts, Some(epoch));
            }
            Ok(false) => self.close_fatal(attempts, epoch, "reconnect schedule exhausted"),
            Err(e) => {
                error!(stream = self.index, error = %e, "Backing store fallback failed");
                self.close_fatal(attempts, epoch, "fallback failed");
            }
        }
    }

    /// The driver started at `epoch` is still the one in charge.
    fn is_current(&self, epoch: u64) -> bool {
        let shared = self.shared.lock();
        !shared.shut_down && shared.reconnecting && shared.reconnect_epoch == epoch
    }

    /// `epoch` is `None` when the store recovered on its own.
    fn mark_open(&self, attempts: u32, epoch: Option<u64>) {
        let previous = {
            let mut shared = self.shared.lock();
            if shared.shut_down || shared.fatal || shared.state == StreamState::Open {
                return;
            }
            if epoch.is_some_and(|e| !shared.reconnecting || shared.reconnect_epoch != e) {
                return;
            }
            shared.reconnecting = false;
            // Nothing queued to prove the connection wrong
            if shared.queue.is_empty() {
                reset_budget(&mut shared);
            }
            std::mem::replace(&mut shared.state, StreamState::Open)
        };
        self.wake.notify_one();
        if previous == StreamState::Buffering {
            info!(stream = self.index, attempts, "Stream restored");
        } else {
            info!(stream = self.index, attempts, "Stream open");
        }
    }

    /// Backing store reported a broken connection.
    pub(crate) fn on_failure(self: &Arc<Self>, error: AdapterError) {
        let epoch = {
            let mut shared = self.shared.lock();
            if shared.shut_down || shared.fatal || shared.reconnecting {
                return;
            }
            shared.state = StreamState::Buffering;
            begin_reconnect(&mut shared)
        };
        warn!(stream = self.index, error = %error, "Backing store failed, buffering sends");
        self.spawn_reconnect(epoch);
    }

    /// Backing store recovered without a reopen. Any sleeping reconnect
    /// driver stops at its next wake-up.
    pub(crate) fn on_restored(&self) {
        let buffering = self.shared.lock().state == StreamState::Buffering;
        if buffering {
            self.mark_open(0, None);
        }
    }

    fn close_fatal(&self, attempts: u32, epoch: u64, reason: &str) {
        let drained = {
            let mut shared = self.shared.lock();
            if shared.shut_down || !shared.reconnecting || shared.reconnect_epoch != epoch {
                return;
            }
            shared.state = StreamState::Closed;
            shared.fatal = true;
            shared.reconnecting = false;
            std::mem::take(&mut shared.queue)
        };
        self.wake.notify_one();
        error!(
            stream = self.index,
            attempts,
            reason,
            failed_sends = drained.len(),
            "Stream closed"
        );
        for pending in drained {
            let _ = pending
                .ack
                .send(Err(BusError::StreamUnavailable { stream: self.index }));
        }
    }

    async fn run_sender(self: Arc<Self>) {
        loop {
            let step = {
                let shared = self.shared.lock();
                if shared.shut_down || shared.fatal {
                    SenderStep::Exit
                } else if shared.state != StreamState::Open {
                    SenderStep::Wait
                } else {
                    match shared.queue.front() {
                        Some(front) => SenderStep::Send(front.id, front.messages.clone()),
                        None => SenderStep::Wait,
                    }
                }
            };

            match step {
                SenderStep::Exit => return,
                SenderStep::Wait => self.wake.notified().await,
                SenderStep::Send(id, messages) => {
                    match self.store.send(self.index, &messages).await {
                        Ok(()) => self.complete(id, Ok(())),
                        // The batch itself can never be encoded; retrying won't help
                        Err(AdapterError::Codec(e)) => {
                            warn!(stream = self.index, error = %e, "Rejecting unencodable batch");
                            self.complete(id, Err(BusError::Adapter(AdapterError::Codec(e))));
                        }
                        Err(e) => self.on_failure(e),
                    }
                }
            }
        }
    }

    /// Resolve the front send if it is still `id`. A fatal close or shutdown
    /// may already have failed it.
    fn complete(&self, id: u64, result: Result<()>) {
        let pending = {
            let mut shared = self.shared.lock();
            match shared.queue.front() {
                Some(front) if front.id == id => {
                    if result.is_ok() {
                        reset_budget(&mut shared);
                    }
                    shared.queue.pop_front()
                }
                _ => None,
            }
        };
        if let Some(pending) = pending {
            let _ = pending.ack.send(result);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("index", &self.index)
            .field("state", &self.state())
            .field("store", &self.store.name())
            .finish()
    }
}

/// Apply backing store events in the order they were fired.
///
/// Holds only a weak reference to the stream so the event channel closes
/// once the stream is gone.
async fn run_applier(
    stream: Weak<Stream>,
    index: usize,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    sink: Arc<dyn BatchSink>,
    stats: Arc<BusStats>,
) {
    let mut last_applied: Option<u64> = None;

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Received {
                sequence_id,
                messages,
            } => {
                if sequence_id == 0 {
                    warn!(stream = index, "Dropping batch with reserved sequence id 0");
                    continue;
                }
                if let Some(last) = last_applied {
                    if sequence_id <= last {
                        stats.record_duplicate();
                        debug!(
                            stream = index,
                            sequence_id,
                            last_applied = last,
                            "Dropping stale batch"
                        );
                        continue;
                    }
                    if sequence_id > last + 1 {
                        debug!(
                            stream = index,
                            sequence_id,
                            last_applied = last,
                            "Sequence gap, earlier batches were not observed"
                        );
                    }
                }
                last_applied = Some(sequence_id);
                stats.record_received();
                sink.apply(Arc::new(MessageBatch::new(index, sequence_id, messages)));
            }
            StreamEvent::Failed(error) => match stream.upgrade() {
                Some(stream) => stream.on_failure(error),
                None => return,
            },
            StreamEvent::Restored => match stream.upgrade() {
                Some(stream) => stream.on_restored(),
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests;
