//! Live Subscription Driver
//!
//! Maintains one pub/sub subscription, fans inbound frames into a bounded
//! queue and drives a per-message filter -> sink pipeline with a periodic
//! liveness heartbeat and cancellation-safe shutdown.
//!
//! A frame carries one raw transaction record: the tryte payload with the
//! transaction hash appended after it, which is exactly the shape the raw
//! filter predicates expect.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::filter::{FilterChain, Record};

/// Default capacity of the receive queue between the subscription loop
/// and the consumer loop.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Cadence at which in-progress work re-asserts liveness.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Errors that can occur while running the live driver. Transport faults
/// are fatal at the driver level and trigger graceful shutdown; nothing
/// here is retried.
#[derive(Error, Debug)]
pub enum SubscribeError {
    #[error("transport error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("cannot install signal handler: {0}")]
    Signal(std::io::Error),
}

/// An opaque asynchronous source of raw message frames. The driver
/// depends only on "receive the next frame"; transport handshake and
/// reconnection live outside this core.
pub trait FrameSource {
    /// The next frame, or `None` once the stream has ended cleanly.
    fn next_frame(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Option<String>, SubscribeError>> + Send;
}

/// Frame source backed by a redis pub/sub subscription on one topic.
pub struct RedisFrameSource {
    pubsub: redis::aio::PubSub,
}

impl RedisFrameSource {
    pub async fn connect(url: &str, topic: &str) -> Result<Self, SubscribeError> {
        let client = redis::Client::open(url)?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        info!(url, topic, "subscribed");
        Ok(Self { pubsub })
    }
}

impl FrameSource for RedisFrameSource {
    async fn next_frame(&mut self) -> Result<Option<String>, SubscribeError> {
        match self.pubsub.on_message().next().await {
            Some(msg) => Ok(Some(msg.get_payload()?)),
            None => Ok(None),
        }
    }
}

/// One inbound frame wrapped with a correlation id.
#[derive(Debug, Clone)]
pub struct TangleMessage {
    pub id: Uuid,
    pub content: String,
}

impl TangleMessage {
    fn new(content: String) -> Self {
        Self { id: Uuid::new_v4(), content }
    }
}

/// The live ingestion driver: one receive loop, one consumer loop, one
/// bounded queue between them. The queue is the only shared mutable
/// resource between the two sides.
pub struct Subscriber {
    chain: Arc<FilterChain>,
    queue_capacity: usize,
}

impl Subscriber {
    pub fn new(chain: FilterChain) -> Self {
        Self { chain: Arc::new(chain), queue_capacity: DEFAULT_QUEUE_CAPACITY }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Consume frames until the transport ends, a transport fault occurs
    /// or a termination signal arrives. On shutdown every outstanding
    /// per-message task is cancelled and awaited; partially completed
    /// work for in-flight messages is abandoned.
    pub async fn run<S>(self, source: S) -> Result<(), SubscribeError>
    where
        S: FrameSource,
    {
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        let consumer = tokio::spawn(consume_loop(queue_rx, Arc::clone(&self.chain)));

        let mut sigint = signal(SignalKind::interrupt()).map_err(SubscribeError::Signal)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(SubscribeError::Signal)?;
        let mut sighup = signal(SignalKind::hangup()).map_err(SubscribeError::Signal)?;
        let mut sigquit = signal(SignalKind::quit()).map_err(SubscribeError::Signal)?;

        let mut receive = Box::pin(receive_loop(source, queue_tx));
        let (result, drain) = tokio::select! {
            received = &mut receive => match received {
                Ok(()) => {
                    info!("transport stream ended");
                    (Ok(()), true)
                }
                Err(err) => {
                    error!(error = %err, "transport fault, shutting down");
                    (Err(err), false)
                }
            },
            _ = sigint.recv() => { info!("received exit signal SIGINT"); (Ok(()), false) }
            _ = sigterm.recv() => { info!("received exit signal SIGTERM"); (Ok(()), false) }
            _ = sighup.recv() => { info!("received exit signal SIGHUP"); (Ok(()), false) }
            _ = sigquit.recv() => { info!("received exit signal SIGQUIT"); (Ok(()), false) }
        };

        // Dropping the receive loop closes the queue, which lets the
        // consumer drain and finish on the graceful path.
        drop(receive);
        if !drain {
            consumer.abort();
        }
        match consumer.await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => debug!("consumer cancelled"),
            Err(err) => error!(error = %err, "consumer task failed"),
        }
        info!("successfully shut down");
        result
    }
}

/// Reads frames from the transport and pushes them onto the queue. Never
/// blocks on downstream processing: when the queue is full the frame is
/// dropped with a warning.
async fn receive_loop<S>(
    mut source: S,
    queue: mpsc::Sender<TangleMessage>,
) -> Result<(), SubscribeError>
where
    S: FrameSource,
{
    loop {
        let Some(content) = source.next_frame().await? else {
            return Ok(());
        };
        let msg = TangleMessage::new(content);
        info!(id = %msg.id, "received {}...", preview(&msg.content));
        match queue.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!(id = %msg.id, "queue full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => return Ok(()),
        }
    }
}

/// Dequeues messages in receipt order and runs one task per message.
/// Completion across messages may interleave; a failed task is logged and
/// never takes the driver down.
async fn consume_loop(mut queue: mpsc::Receiver<TangleMessage>, chain: Arc<FilterChain>) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            msg = queue.recv() => match msg {
                Some(msg) => {
                    debug!(id = %msg.id, "consumed");
                    tasks.spawn(handle_message(msg, Arc::clone(&chain)));
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_task_result(joined);
            }
        }
    }
    while let Some(joined) = tasks.join_next().await {
        log_task_result(joined);
    }
}

fn log_task_result(joined: Result<(), tokio::task::JoinError>) {
    match joined {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => {}
        Err(err) => error!(error = %err, "message task failed"),
    }
}

/// Per-message lifecycle: race the filter -> sink work against a
/// heartbeat tick that re-asserts liveness until the work completes, then
/// acknowledge.
async fn handle_message(msg: TangleMessage, chain: Arc<FilterChain>) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately.
    heartbeat.tick().await;

    let mut extended = 0u32;
    let work = process(&msg, &chain);
    tokio::pin!(work);
    loop {
        tokio::select! {
            _ = &mut work => break,
            _ = heartbeat.tick() => {
                extended += 1;
                debug!(id = %msg.id, extended, "extended processing lease");
            }
        }
    }
    debug!(id = %msg.id, "acked");
}

async fn process(msg: &TangleMessage, chain: &FilterChain) {
    let record = Record::Raw(&msg.content);
    if chain.accept(&record) {
        save(&msg.content).await;
    } else {
        debug!(id = %msg.id, "rejected by filter chain");
    }
}

/// Sink for accepted records. Persistence is an external collaborator;
/// for now acceptance is only logged.
async fn save(record: &str) {
    info!("saved {}... into database", preview(record));
}

/// First 20 chars of a frame for log lines. Truncates on a char
/// boundary, so frames carrying arbitrary text cannot break logging.
fn preview(s: &str) -> &str {
    match s.char_indices().nth(20) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::TRANSACTION_TRYTES_LEN;
    use crate::filter::{Predicate, SetFilter};
    use crate::decoder::Field;
    use std::collections::HashSet;
    use std::collections::VecDeque;

    /// Frame source fed from a fixed script of frames, then a clean end
    /// or an injected fault.
    struct ScriptedSource {
        frames: VecDeque<String>,
        fault_at_end: bool,
    }

    impl ScriptedSource {
        fn new(frames: Vec<String>) -> Self {
            Self { frames: frames.into(), fault_at_end: false }
        }

        fn with_fault(mut self) -> Self {
            self.fault_at_end = true;
            self
        }
    }

    impl FrameSource for ScriptedSource {
        async fn next_frame(&mut self) -> Result<Option<String>, SubscribeError> {
            match self.frames.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None if self.fault_at_end => Err(SubscribeError::Transport(
                    redis::RedisError::from(std::io::Error::other("connection reset")),
                )),
                None => Ok(None),
            }
        }
    }

    fn frame_with_hash(hash: &str) -> String {
        format!("{} {}", "9".repeat(TRANSACTION_TRYTES_LEN), hash)
    }

    #[tokio::test]
    async fn test_run_processes_stream_and_returns_on_transport_end() {
        let frames = vec![frame_with_hash(&"A".repeat(81)), frame_with_hash(&"B".repeat(81))];
        let subscriber = Subscriber::new(FilterChain::new());
        let result = subscriber.run(ScriptedSource::new(frames)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_surfaces_transport_fault() {
        let frames = vec![frame_with_hash(&"A".repeat(81))];
        let subscriber = Subscriber::new(FilterChain::new());
        let result = subscriber.run(ScriptedSource::new(frames).with_fault()).await;
        assert!(matches!(result, Err(SubscribeError::Transport(_))));
    }

    #[tokio::test]
    async fn test_receive_loop_drops_frames_when_queue_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let frames = vec![frame_with_hash(&"A".repeat(81)), frame_with_hash(&"B".repeat(81))];
        receive_loop(ScriptedSource::new(frames), tx).await.unwrap();

        // Only the first frame fits; the second was dropped, not queued.
        let first = rx.recv().await.unwrap();
        assert!(first.content.ends_with(&"A".repeat(81)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_handle_message_acks_rejected_message() {
        // A rejecting chain still completes the message lifecycle.
        let mut chain = FilterChain::new();
        chain.push(Predicate::Set(SetFilter::new(
            Field::TransactionHash,
            HashSet::from(["Z".repeat(81)]),
        )));
        let msg = TangleMessage::new(frame_with_hash(&"A".repeat(81)));
        handle_message(msg, Arc::new(chain)).await;
    }

    #[tokio::test]
    async fn test_consume_loop_drains_queue_on_close() {
        let (tx, rx) = mpsc::channel(8);
        for hash in ["A", "B", "C"] {
            tx.send(TangleMessage::new(frame_with_hash(&hash.repeat(81))))
                .await
                .unwrap();
        }
        drop(tx);
        consume_loop(rx, Arc::new(FilterChain::new())).await;
    }

    #[test]
    fn test_messages_get_distinct_correlation_ids() {
        let a = TangleMessage::new("one".to_string());
        let b = TangleMessage::new("one".to_string());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_preview_never_panics_on_short_input() {
        assert_eq!(preview(""), "");
        assert_eq!(preview("short"), "short");
        assert_eq!(preview(&"x".repeat(40)).len(), 20);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        // A multibyte char straddling the 20-byte mark must not split.
        let frame = format!("{}é much more content", "x".repeat(19));
        assert_eq!(preview(&frame), format!("{}é", "x".repeat(19)));
        // 21 chars, all multibyte: cut after the 20th char.
        assert_eq!(preview(&"é".repeat(21)), "é".repeat(20));
    }

    #[tokio::test]
    async fn test_run_survives_frame_with_multibyte_content() {
        let frames = vec![format!("{}é", "x".repeat(19))];
        let subscriber = Subscriber::new(FilterChain::new());
        let result = subscriber.run(ScriptedSource::new(frames)).await;
        assert!(result.is_ok());
    }
}
