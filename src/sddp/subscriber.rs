/*!
A bounded, per-consumer view onto the datagrams an `Engine` receives.

A subscriber is registered with `Engine::subscribe`, which returns a guard
whose `Drop` deregisters it; `receive()` and the `Stream` implementation
both honor the same end-of-stream contract: the queue drains fully before
any terminal error is surfaced, and a subscriber reaching end-of-stream
stays there for the rest of its life.
*/

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::binding::SocketBinding;
use super::datagram::Datagram;
use crate::error::Error;
use std::net::SocketAddr;

use std::sync::Mutex as StdMutex;

/// One item delivered to a subscriber: the binding it arrived on, the
/// source address, and the decoded datagram.
pub type Received = (Arc<SocketBinding>, SocketAddr, Datagram);

/// An opaque handle identifying a registered subscriber within an engine.
pub type SubscriberId = u64;

/// The receiving half of a subscription. Dropping it deregisters from the
/// engine on its own (the engine notices the closed channel); callers that
/// need a guaranteed synchronous deregistration should call
/// `Engine::unsubscribe` explicitly before dropping.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    queue: mpsc::Receiver<Received>,
    eos: Arc<AtomicBool>,
    eos_error: Arc<StdMutex<Option<String>>>,
    surfaced_error: bool,
    engine: super::engine::WeakEngineHandle,
}

impl Subscriber {
    pub(crate) fn new(
        id: SubscriberId,
        queue: mpsc::Receiver<Received>,
        eos: Arc<AtomicBool>,
        eos_error: Arc<StdMutex<Option<String>>>,
        engine: super::engine::WeakEngineHandle,
    ) -> Self {
        Self {
            id,
            queue,
            eos,
            eos_error,
            surfaced_error: false,
            engine,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The next received item, or `None` once the queue has drained and
    /// end-of-stream has been signaled. Returns the engine's terminal
    /// error exactly once, after the queue is empty.
    pub async fn receive(&mut self) -> Result<Option<Received>, Error> {
        loop {
            match self.queue.recv().await {
                Some(item) => return Ok(Some(item)),
                None => {
                    if self.eos.load(Ordering::SeqCst) && !self.surfaced_error {
                        self.surfaced_error = true;
                        let err = self.eos_error.lock().unwrap_or_else(|p| p.into_inner()).take();
                        if let Some(message) = err {
                            return Err(Error::NetworkTransport(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                message,
                            )));
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }
}

impl Stream for Subscriber {
    type Item = Received;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.queue.poll_recv(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(item)),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.engine.deregister(self.id);
    }
}

/// Construction helper used by the engine: builds the sender half plus the
/// shared end-of-stream flag/error cell a `Subscriber` reads from.
pub(crate) struct SubscriberChannel {
    sender: StdMutex<Option<mpsc::Sender<Received>>>,
    pub eos: Arc<AtomicBool>,
    pub eos_error: Arc<StdMutex<Option<String>>>,
}

impl SubscriberChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Received>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender: StdMutex::new(Some(sender)),
                eos: Arc::new(AtomicBool::new(false)),
                eos_error: Arc::new(StdMutex::new(None)),
            },
            receiver,
        )
    }

    /// Non-blocking delivery: drop silently (caller logs a warning) on a
    /// full queue, or once end-of-stream has closed the sender, rather
    /// than ever blocking the receive loop.
    pub fn try_deliver(&self, item: Received) -> Result<(), Received> {
        let guard = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        match &*guard {
            Some(sender) => match sender.try_send(item) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(item)) => Err(item),
                Err(mpsc::error::TrySendError::Closed(item)) => Err(item),
            },
            None => Err(item),
        }
    }

    /// Record the terminal error (if any) and close the sender half so a
    /// subscriber's `recv()` returns `None` as soon as the queue drains,
    /// instead of waiting on a channel nothing will ever close.
    pub fn mark_end_of_stream(&self, error: Option<String>) {
        if let Some(message) = error {
            let mut guard = self.eos_error.lock().unwrap_or_else(|p| p.into_inner());
            if guard.is_none() {
                *guard = Some(message);
            }
        }
        self.eos.store(true, Ordering::SeqCst);
        self.sender.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}
