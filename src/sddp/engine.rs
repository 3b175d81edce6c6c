/*!
The datagram engine: owns a set of socket bindings, runs one receive loop
per binding, and fans incoming datagrams out to every registered
subscriber. `final_result` is the engine's single authoritative
completion signal — set at most once, from either a clean `stop()` or a
terminal transport error — and is what every subscriber's end-of-stream
ultimately derives from.
*/

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::watch;

use super::binding::SocketBinding;
use super::constants::DEFAULT_SUBSCRIBER_QUEUE_SIZE;
use super::datagram::Datagram;
use super::subscriber::{Received, Subscriber, SubscriberChannel, SubscriberId};
use crate::error::Error;

/// The terminal state of an engine: clean shutdown, or a transport error.
#[derive(Clone, Debug)]
pub enum FinalResult {
    Success,
    Error(Arc<String>),
}

struct EngineInner {
    bindings: Vec<Arc<SocketBinding>>,
    subscribers: StdMutex<HashMap<SubscriberId, SubscriberChannel>>,
    next_id: AtomicU64,
    final_tx: watch::Sender<Option<FinalResult>>,
    final_rx: watch::Receiver<Option<FinalResult>>,
}

/// A weak, non-owning reference back to an engine, held by each
/// `Subscriber` so it can deregister itself on drop without keeping the
/// engine alive.
#[derive(Clone)]
pub struct WeakEngineHandle(Weak<EngineInner>);

impl WeakEngineHandle {
    pub(crate) fn deregister(&self, id: SubscriberId) {
        if let Some(inner) = self.0.upgrade() {
            let mut subs = inner.subscribers.lock().unwrap_or_else(|p| p.into_inner());
            subs.remove(&id);
        }
    }
}

impl std::fmt::Debug for WeakEngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakEngineHandle").finish()
    }
}

/// Owns a set of socket bindings and drives their receive loops, fanning
/// datagrams out to every currently registered subscriber.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("bindings", &self.inner.bindings.len())
            .finish()
    }
}

impl Engine {
    /// Build an engine from a non-empty set of already-bound sockets and
    /// spawn their receive loops. `bindings` must not be empty.
    pub fn start(bindings: Vec<SocketBinding>) -> Result<Self, Error> {
        if bindings.is_empty() {
            return Err(Error::NoUsableInterfaces);
        }
        let (final_tx, final_rx) = watch::channel(None);
        let bindings: Vec<Arc<SocketBinding>> = bindings.into_iter().map(Arc::new).collect();
        for (idx, binding) in bindings.iter().enumerate() {
            binding.attach(idx as i64);
        }
        let inner = Arc::new(EngineInner {
            bindings,
            subscribers: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            final_tx,
            final_rx,
        });
        let engine = Self { inner };
        for binding in engine.inner.bindings.iter().cloned() {
            let receiver = engine.clone();
            tokio::spawn(async move {
                receiver.receive_loop(binding).await;
            });
        }
        Ok(engine)
    }

    pub fn bindings(&self) -> &[Arc<SocketBinding>] {
        &self.inner.bindings
    }

    /// Register a new subscriber with the default queue capacity.
    pub fn subscribe(&self) -> Subscriber {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_QUEUE_SIZE)
    }

    /// Registers a new subscriber, unless `final_result` is already set —
    /// per the engine invariant (no new subscribers once final), in which
    /// case the returned subscriber is handed its end-of-stream (with the
    /// same error, if any) immediately instead of being added to the
    /// registry.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscriber {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (channel, receiver) = SubscriberChannel::new(capacity);
        let eos = channel.eos.clone();
        let eos_error = channel.eos_error.clone();
        {
            // Held across the is_done() check and the insert/mark-EOS
            // decision so a concurrent set_final_result (which holds this
            // same lock while transitioning final_result) can never race
            // with a subscriber slipping into the registry just after.
            let mut subs = self.inner.subscribers.lock().unwrap_or_else(|p| p.into_inner());
            match self.inner.final_rx.borrow().clone() {
                Some(result) => {
                    let error_message = match result {
                        FinalResult::Success => None,
                        FinalResult::Error(e) => Some((*e).clone()),
                    };
                    channel.mark_end_of_stream(error_message);
                }
                None => {
                    subs.insert(id, channel);
                }
            }
        }
        Subscriber::new(
            id,
            receiver,
            eos,
            eos_error,
            WeakEngineHandle(Arc::downgrade(&self.inner)),
        )
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut subs = self.inner.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.remove(&id);
    }

    /// Set `final_result` if it is not already set. Returns `true` if this
    /// call actually transitioned the state (monotonic: unset → set,
    /// at most once); a later call is a no-op that returns `false`.
    pub fn set_final_result(&self, result: FinalResult) -> bool {
        // Held across the final_tx transition and the subscriber fan-out so
        // a concurrent subscribe_with_capacity() call is serialized against
        // this one: it either registers before this lock is taken (and is
        // marked below) or observes `final_rx` already set (and marks
        // itself instead of registering).
        let subs = self.inner.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        let mut did_set = false;
        let _ = self.inner.final_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(result.clone());
                did_set = true;
                true
            } else {
                false
            }
        });
        if did_set {
            let error_message = match &result {
                FinalResult::Success => None,
                FinalResult::Error(e) => Some((**e).clone()),
            };
            for channel in subs.values() {
                channel.mark_end_of_stream(error_message.clone());
            }
        }
        did_set
    }

    pub fn is_done(&self) -> bool {
        self.inner.final_rx.borrow().is_some()
    }

    /// A receiver that resolves once `final_result` is set; used by the
    /// advertiser to race its interval sleep against shutdown.
    pub fn final_result_receiver(&self) -> watch::Receiver<Option<FinalResult>> {
        self.inner.final_rx.clone()
    }

    /// Clean shutdown: sets `final_result` to success if not already set.
    pub async fn stop(&self) {
        self.set_final_result(FinalResult::Success);
    }

    /// Await `final_result`, translating a terminal error into `Err`.
    pub async fn wait_for_done(&self) -> Result<(), Error> {
        let mut rx = self.inner.final_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return match result {
                    FinalResult::Success => Ok(()),
                    FinalResult::Error(message) => Err(Error::NetworkTransport(
                        std::io::Error::new(std::io::ErrorKind::Other, (*message).clone()),
                    )),
                };
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    fn dispatch(&self, binding: Arc<SocketBinding>, addr: SocketAddr, datagram: Datagram) {
        let subs = self.inner.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        for (id, channel) in subs.iter() {
            let item: Received = (binding.clone(), addr, datagram.clone());
            if channel.try_deliver(item).is_err() {
                warn!("subscriber {} queue full, dropping datagram from {}", id, addr);
            }
        }
    }

    /// Races `recv_from` against `final_result` being set on every
    /// iteration, not just checked once before blocking on it: a socket
    /// with no further traffic after `stop()` must still unblock and let
    /// this task (and its transport) wind down, instead of staying parked
    /// in `recv_from` forever.
    async fn receive_loop(&self, binding: Arc<SocketBinding>) {
        let mut buf = vec![0u8; 65_535];
        let mut final_rx = self.inner.final_rx.clone();
        if final_rx.borrow().is_some() {
            return;
        }
        loop {
            tokio::select! {
                biased;
                _ = final_rx.changed() => {
                    debug!("receive loop on {} unblocked by shutdown", binding.display_name());
                    return;
                }
                result = binding.socket().recv_from(&mut buf) => {
                    match result {
                        Ok((n, addr)) => match Datagram::parse(&buf[..n]) {
                            Ok(datagram) => self.dispatch(binding.clone(), addr, datagram),
                            Err(e) => {
                                warn!(
                                    "dropping malformed datagram from {} on {}: {}",
                                    addr,
                                    binding.display_name(),
                                    e
                                );
                            }
                        },
                        Err(e) => {
                            error!("transport error on {}: {}", binding.display_name(), e);
                            self.set_final_result(FinalResult::Error(Arc::new(e.to_string())));
                            return;
                        }
                    }
                }
            }
        }
    }
}
