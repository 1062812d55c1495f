//! Single-reader fan-out of a kernel's message stream.
//!
//! A [`MessageDistributor`] owns one [`MessageSource`] and a set of
//! subscriber callbacks. Its read loop takes the next message and hands it
//! to every subscriber, in subscription order, before reading again; this
//! is what gives every consumer of a session the same total order.
//!
//! Two sources exist: [`ConnectionSource`] reads NDJSON lines from a
//! process kernel's socket, [`QueueSource`] drains the in-memory stream
//! queue of a thread kernel.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::kernel::codec::KernelCodec;
use crate::kernel::supervisor::KernelStream;
use crate::models::ops::KernelMessage;
use crate::session::consumer::ConsumerCallback;
use crate::{AppError, Result};

/// Boxed future returned by [`MessageSource::next_message`].
pub type NextMessage<'a> = Pin<Box<dyn Future<Output = Option<KernelMessage>> + Send + 'a>>;

/// One ordered inbound stream of kernel messages.
pub trait MessageSource: Send {
    /// Next message, or `None` once the stream has ended.
    fn next_message(&mut self) -> NextMessage<'_>;
}

/// Thread-kernel source backed by the stream queue.
pub struct QueueSource {
    rx: UnboundedReceiver<KernelMessage>,
}

impl QueueSource {
    /// Wrap the reading end of a stream queue.
    #[must_use]
    pub fn new(rx: UnboundedReceiver<KernelMessage>) -> Self {
        Self { rx }
    }
}

impl MessageSource for QueueSource {
    fn next_message(&mut self) -> NextMessage<'_> {
        Box::pin(self.rx.recv())
    }
}

/// Process-kernel source backed by the socket's read half.
///
/// Malformed or oversized lines are logged and skipped; EOF and I/O errors
/// end the stream.
pub struct ConnectionSource<R> {
    reader: FramedRead<R, KernelCodec>,
}

impl<R: AsyncRead + Unpin + Send> ConnectionSource<R> {
    /// Frame `reader` with the kernel codec.
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            reader: FramedRead::new(reader, KernelCodec::new()),
        }
    }

    async fn read_next(&mut self) -> Option<KernelMessage> {
        loop {
            match self.reader.next().await? {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match KernelMessage::from_line(&line) {
                        Ok(message) => return Some(message),
                        Err(err) => warn!(%err, "skipping malformed kernel line"),
                    }
                }
                Err(AppError::Io(err)) => {
                    warn!(%err, "kernel connection read failed");
                    return None;
                }
                Err(err) => warn!(%err, "skipping unreadable kernel line"),
            }
        }
    }
}

impl<R: AsyncRead + Unpin + Send> MessageSource for ConnectionSource<R> {
    fn next_message(&mut self) -> NextMessage<'_> {
        Box::pin(self.read_next())
    }
}

/// Pick the source matching how the kernel was launched.
#[must_use]
pub fn source_for(stream: KernelStream) -> Box<dyn MessageSource> {
    match stream {
        KernelStream::Connection(reader) => Box::new(ConnectionSource::new(reader)),
        KernelStream::Queue(rx) => Box::new(QueueSource::new(rx)),
    }
}

/// Cleanup action run exactly once when a registration ends.
pub struct Disposable(Option<Box<dyn FnOnce() + Send>>);

impl Disposable {
    /// Wrap a cleanup action.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(action)))
    }

    /// A disposable that does nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self(None)
    }

    /// Run the cleanup action.
    pub fn dispose(mut self) {
        if let Some(action) = self.0.take() {
            action();
        }
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Disposable").field(&self.0.is_some()).finish()
    }
}

type Subscribers = Mutex<BTreeMap<u64, ConsumerCallback>>;

/// Fans one kernel stream out to subscriber callbacks.
pub struct MessageDistributor {
    subscribers: Arc<Subscribers>,
    next_id: AtomicU64,
    source: Mutex<Option<Box<dyn MessageSource>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for MessageDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDistributor")
            .field("subscribers", &self.subscriber_count())
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl MessageDistributor {
    /// Create a distributor over `source`. Nothing is read until [`start`](Self::start).
    #[must_use]
    pub fn new(source: Box<dyn MessageSource>) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(0),
            source: Mutex::new(Some(source)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Subscribe `callback` to every message read from now on.
    pub fn add_consumer(&self, callback: ConsumerCallback) -> Disposable {
        self.add_consumer_with(callback, || ()).0
    }

    /// Subscribe `callback` and run `snapshot` while no message is being
    /// delivered.
    ///
    /// Whatever `snapshot` observes is exactly the state before the first
    /// message `callback` will see.
    pub fn add_consumer_with<T>(
        &self,
        callback: ConsumerCallback,
        snapshot: impl FnOnce() -> T,
    ) -> (Disposable, T) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let value = match self.subscribers.lock() {
            Ok(mut subscribers) => {
                let value = snapshot();
                subscribers.insert(id, callback);
                value
            }
            Err(poisoned) => {
                let mut subscribers = poisoned.into_inner();
                let value = snapshot();
                subscribers.insert(id, callback);
                value
            }
        };

        let subscribers = Arc::clone(&self.subscribers);
        let disposable = Disposable::new(move || {
            if let Ok(mut subscribers) = subscribers.lock() {
                subscribers.remove(&id);
            }
        });
        (disposable, value)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map_or(0, |subscribers| subscribers.len())
    }

    /// Spawn the read loop.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the distributor was already started.
    pub fn start(&self) -> Result<()> {
        let mut source = self
            .source
            .lock()
            .map_err(|_| AppError::Kernel("distributor lock poisoned".into()))?
            .take()
            .ok_or_else(|| AppError::Kernel("distributor already started".into()))?;

        let subscribers = Arc::clone(&self.subscribers);
        let cancel = self.cancel.clone();
        let span = info_span!("message_distributor");

        let handle = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            debug!("distributor stopped");
                            break;
                        }
                        next = source.next_message() => {
                            let Some(message) = next else {
                                info!("kernel message stream ended");
                                break;
                            };
                            dispatch(&subscribers, &message);
                        }
                    }
                }
            }
            .instrument(span),
        );

        if let Ok(mut task) = self.task.lock() {
            task.replace(handle);
        }
        Ok(())
    }

    /// Stop reading. Idempotent; does not wait for the loop to finish.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Ok(mut task) = self.task.lock() {
            task.take();
        }
        if let Ok(mut source) = self.source.lock() {
            source.take();
        }
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn dispatch(subscribers: &Subscribers, message: &KernelMessage) {
    let subscribers = match subscribers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    for callback in subscribers.values() {
        callback(message);
    }
}
