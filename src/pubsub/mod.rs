//! Single-producer, many-subscriber broadcast stream with a terminal value.
//!
//! A [`SubPub`] converts one upstream producer of `A`s finishing with an `R`
//! into a fan-out that any number of consumers may join while the stream is
//! live. Late subscribers receive only elements published after they joined;
//! subscribers that join after completion get [`Terminated`] instead of a
//! stream. Completion and failure are broadcast to every subscriber as the
//! final event.
//!
//! Elements pass through a bounded FIFO, so a producer that outruns the
//! fan-out loop suspends in [`SubPub::publish`]. Delivery to each subscriber
//! is unbounded and in producer order.
//!
//! A producer that disappears instead of completing is broadcast as a
//! failure: [`SubPub::from_stream`] monitors its feeder task, and the
//! fan-out loop treats every handle being dropped without a terminal the
//! same way. A producer kept alive elsewhere (a job table holding the
//! handle, say) defeats both, which is why job supervisors also fail the
//! stream when they see a worker die.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use futures::{Stream, StreamExt};

/// Capacity of the producer-side FIFO. Feeding suspends when it is full;
/// this is the only backpressure in the system.
const FEED_CAPACITY: usize = 10;

/// One event observed by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent<A, R> {
    More(A),
    Done(R),
    Failed(String),
}

/// The stream completed before the subscription could be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream already terminated")]
pub struct Terminated;

/// The upstream producer died instead of completing the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("producer failed: {0}")]
pub struct ProducerFailed(pub String);

enum Feed<A, R> {
    Item(A),
    Done(R),
    Failed(String),
}

struct Subscribe<A, R> {
    confirm: oneshot::Sender<mpsc::UnboundedReceiver<StreamEvent<A, R>>>,
}

/// Handle to a broadcast stream. Cloneable; clones address the same fan-out.
pub struct SubPub<A, R> {
    feed: mpsc::Sender<Feed<A, R>>,
    control: mpsc::UnboundedSender<Subscribe<A, R>>,
}

impl<A, R> Clone for SubPub<A, R> {
    fn clone(&self) -> Self {
        Self {
            feed: self.feed.clone(),
            control: self.control.clone(),
        }
    }
}

impl<A, R> std::fmt::Debug for SubPub<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SubPub")
    }
}

impl<A, R> SubPub<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    /// Creates an idle stream. Nothing flows until someone publishes, so the
    /// caller is free to subscribe first and cannot miss data.
    pub fn new() -> Self {
        let (feed_tx, feed_rx) = mpsc::channel(FEED_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(fanout(feed_rx, control_rx));
        Self {
            feed: feed_tx,
            control: control_tx,
        }
    }

    /// Spawns a feeder pumping `producer` into a fresh stream. Returns the
    /// handle and a receiver resolving to the terminal value, or to
    /// [`ProducerFailed`] if the producer fails or ends without completing.
    ///
    /// The feeder task is monitored: if it dies without delivering a
    /// terminal, the stream is failed rather than left dangling.
    pub fn from_stream<S>(producer: S) -> (Self, oneshot::Receiver<Result<R, ProducerFailed>>)
    where
        S: Stream<Item = StreamEvent<A, R>> + Send + 'static,
    {
        let handle = Self::new();
        let feeder = handle.clone();
        let (done_tx, done_rx) = oneshot::channel();
        let driver = tokio::spawn(async move {
            let result = drive_producer(feeder, producer).await;
            let _ = done_tx.send(result);
        });

        // Monitor the feeder. A panic inside the producer must become a
        // failure broadcast, not subscribers waiting forever; `fail` is a
        // no-op on the paths where the feeder already sent a terminal.
        let monitor = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = driver.await {
                monitor.fail(format!("producer task died: {e}")).await;
            }
        });

        (handle, done_rx)
    }

    /// Publishes one element, suspending while the FIFO is full. Fails only
    /// once the stream has terminated.
    pub async fn publish(&self, item: A) -> Result<(), Terminated> {
        self.feed
            .send(Feed::Item(item))
            .await
            .map_err(|_| Terminated)
    }

    /// Completes the stream. Every current subscriber receives `Done(value)`
    /// as its final event. A no-op if the stream already terminated.
    pub async fn done(&self, value: R) {
        let _ = self.feed.send(Feed::Done(value)).await;
    }

    /// Fails the stream. Every current subscriber receives `Failed(reason)`
    /// as its final event. A no-op if the stream already terminated.
    pub async fn fail(&self, reason: impl Into<String>) {
        let _ = self.feed.send(Feed::Failed(reason.into())).await;
    }

    /// Joins the stream. The registration round-trips through the fan-out
    /// loop, so once this returns the subscription observes every later
    /// event. Returns [`Terminated`] if the stream already completed.
    pub async fn subscribe(&self) -> Result<Subscription<A, R>, Terminated> {
        let (confirm_tx, confirm_rx) = oneshot::channel();
        self.control
            .send(Subscribe {
                confirm: confirm_tx,
            })
            .map_err(|_| Terminated)?;
        match confirm_rx.await {
            Ok(rx) => Ok(Subscription { rx }),
            Err(_) => Err(Terminated),
        }
    }
}

impl<A, R> Default for SubPub<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A consumer's view of the stream.
pub struct Subscription<A, R> {
    rx: mpsc::UnboundedReceiver<StreamEvent<A, R>>,
}

impl<A, R> Subscription<A, R> {
    /// The next event. `Done` or `Failed` is always the last `Some`, with
    /// `None` afterwards.
    pub async fn next(&mut self) -> Option<StreamEvent<A, R>> {
        self.rx.recv().await
    }
}

async fn drive_producer<A, R, S>(feeder: SubPub<A, R>, producer: S) -> Result<R, ProducerFailed>
where
    A: Clone + Send + 'static,
    R: Clone + Send + 'static,
    S: Stream<Item = StreamEvent<A, R>> + Send + 'static,
{
    futures::pin_mut!(producer);
    while let Some(event) = producer.next().await {
        match event {
            StreamEvent::More(item) => {
                if feeder.publish(item).await.is_err() {
                    break;
                }
            }
            StreamEvent::Done(value) => {
                feeder.done(value.clone()).await;
                return Ok(value);
            }
            StreamEvent::Failed(reason) => {
                feeder.fail(reason.clone()).await;
                return Err(ProducerFailed(reason));
            }
        }
    }
    let reason = "producer ended without completing".to_string();
    feeder.fail(reason.clone()).await;
    Err(ProducerFailed(reason))
}

async fn fanout<A, R>(
    mut feed_rx: mpsc::Receiver<Feed<A, R>>,
    mut control_rx: mpsc::UnboundedReceiver<Subscribe<A, R>>,
) where
    A: Clone,
    R: Clone,
{
    let mut subscribers: Vec<mpsc::UnboundedSender<StreamEvent<A, R>>> = Vec::new();
    let mut control_open = true;

    loop {
        tokio::select! {
            request = control_rx.recv(), if control_open => {
                match request {
                    Some(Subscribe { confirm }) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        // A subscriber that vanished between asking and
                        // being confirmed is simply not registered.
                        if confirm.send(rx).is_ok() {
                            subscribers.push(tx);
                        }
                    }
                    // All handles dropped: keep draining the feed until it
                    // closes too, then fall out via the feed arm.
                    None => control_open = false,
                }
            }
            item = feed_rx.recv() => {
                match item {
                    Some(Feed::Item(item)) => {
                        // Dead subscribers are detected by the failed send
                        // and dropped.
                        subscribers.retain(|sub| {
                            sub.send(StreamEvent::More(item.clone())).is_ok()
                        });
                    }
                    Some(Feed::Done(value)) => {
                        for sub in &subscribers {
                            let _ = sub.send(StreamEvent::Done(value.clone()));
                        }
                        return;
                    }
                    Some(Feed::Failed(reason)) => {
                        for sub in &subscribers {
                            let _ = sub.send(StreamEvent::Failed(reason.clone()));
                        }
                        return;
                    }
                    // Every producer-side handle dropped without a terminal:
                    // the channel closing is the monitor notification, and
                    // the subscribers hear about it as a failure.
                    None => {
                        for sub in &subscribers {
                            let _ = sub.send(StreamEvent::Failed(
                                "producer dropped without completing".to_string(),
                            ));
                        }
                        return;
                    }
                }
            }
        }
    }
}
