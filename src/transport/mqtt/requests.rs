//! Correlation of requests with their acknowledgements
//!
//! rumqttc assigns packet ids inside its event loop, so a request is first
//! queued in submission order and bound to a packet id when the matching
//! outgoing event appears. The binding is resolved when the acknowledgement
//! arrives. QoS 1/2 publishes are mirrored into the session's store while in
//! flight.

use super::message_handler::RequestKind;
use crate::store::{outbound_key, MessageStore, StoredPacket};
use crate::transport::{QoS, SessionError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

pub type Completion = oneshot::Receiver<Result<u16, SessionError>>;

type Completer = oneshot::Sender<Result<u16, SessionError>>;

struct QueuedRequest {
    kind: RequestKind,
    qos: QoS,
    record: Option<StoredPacket>,
    done: Option<Completer>,
}

struct InflightRequest {
    done: Option<Completer>,
    stored: bool,
}

#[derive(Default)]
struct TrackerState {
    queued: VecDeque<QueuedRequest>,
    inflight: HashMap<(RequestKind, u16), InflightRequest>,
}

impl TrackerState {
    fn pending(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

pub struct RequestTracker {
    state: Mutex<TrackerState>,
    store: Option<Arc<dyn MessageStore>>,
    pending_tx: watch::Sender<usize>,
}

impl RequestTracker {
    pub fn new(store: Option<Arc<dyn MessageStore>>) -> Self {
        let (pending_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(TrackerState::default()),
            store,
            pending_tx,
        }
    }

    /// Queue a request and hand it to the client with `send`
    ///
    /// The queue lock is held across `send`, so the queue order matches the
    /// order in which the client receives requests.
    pub fn submit<F, E>(
        &self,
        kind: RequestKind,
        qos: QoS,
        record: Option<StoredPacket>,
        send: F,
    ) -> Result<Completion, SessionError>
    where
        F: FnOnce() -> Result<(), E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(kind, qos, record, Some(done_tx), send)?;
        Ok(done_rx)
    }

    /// Queue a request nobody waits for, such as a resubscribe after reconnect
    pub fn submit_detached<F, E>(&self, kind: RequestKind, qos: QoS, send: F) -> Result<(), SessionError>
    where
        F: FnOnce() -> Result<(), E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.enqueue(kind, qos, None, None, send)
    }

    fn enqueue<F, E>(
        &self,
        kind: RequestKind,
        qos: QoS,
        record: Option<StoredPacket>,
        done: Option<Completer>,
        send: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce() -> Result<(), E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.queued.push_back(QueuedRequest {
            kind,
            qos,
            record,
            done,
        });

        if let Err(e) = send() {
            state.queued.pop_back();
            return Err(SessionError::RequestFailed(Box::new(e)));
        }

        self.pending_tx.send_replace(state.pending());
        Ok(())
    }

    /// Bind the oldest queued request of `kind` to `pkid`
    pub fn on_request_sent(&self, kind: RequestKind, pkid: u16) {
        let mut state = self.lock();
        // Retransmissions after a reconnect reuse their packet id
        if state.inflight.contains_key(&(kind, pkid)) {
            debug!(kind = kind.as_str(), pkid, "Retransmission of an in-flight request");
            return;
        }
        let Some(position) = state.queued.iter().position(|r| r.kind == kind) else {
            debug!(kind = kind.as_str(), pkid, "Outgoing packet without queued request");
            return;
        };
        let Some(request) = state.queued.remove(position) else {
            return;
        };

        if kind == RequestKind::Publish && request.qos == QoS::AtMostOnce {
            complete(request.done, Ok(pkid));
        } else {
            let stored = match (&self.store, request.record) {
                (Some(store), Some(mut record)) => {
                    record.pkid = pkid;
                    match store.put(&outbound_key(pkid), &record) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(pkid, store = store.name(), "Failed to persist publish: {}", e);
                            false
                        }
                    }
                }
                _ => false,
            };

            state.inflight.insert(
                (kind, pkid),
                InflightRequest {
                    done: request.done,
                    stored,
                },
            );
        }

        self.pending_tx.send_replace(state.pending());
    }

    /// Resolve the in-flight request acknowledged by the broker
    pub fn on_acknowledged(&self, kind: RequestKind, pkid: u16, rejection: Option<String>) {
        let mut state = self.lock();
        let Some(request) = state.inflight.remove(&(kind, pkid)) else {
            debug!(kind = kind.as_str(), pkid, "Acknowledgement for unknown request");
            return;
        };

        if request.stored {
            if let Some(store) = &self.store {
                if let Err(e) = store.del(&outbound_key(pkid)) {
                    warn!(pkid, store = store.name(), "Failed to remove acknowledged publish: {}", e);
                }
            }
        }

        let result = match rejection {
            None => Ok(pkid),
            Some(reason) => Err(SessionError::Rejected {
                operation: kind.as_str(),
                reason,
            }),
        };
        complete(request.done, result);

        self.pending_tx.send_replace(state.pending());
    }

    /// Fail in-flight requests the client will not retransmit after a reconnect
    ///
    /// Unacknowledged publishes are resent by the client and stay tracked.
    pub fn fail_interrupted(&self) {
        let mut state = self.lock();
        let interrupted: Vec<(RequestKind, u16)> = state
            .inflight
            .keys()
            .filter(|(kind, _)| *kind != RequestKind::Publish)
            .copied()
            .collect();

        for key in interrupted {
            if let Some(request) = state.inflight.remove(&key) {
                complete(request.done, Err(SessionError::ConnectionLost(key.0.as_str())));
            }
        }

        self.pending_tx.send_replace(state.pending());
    }

    /// Fail everything; stored publishes are left in the store
    pub fn fail_all(&self) {
        let mut state = self.lock();
        for request in state.queued.drain(..) {
            complete(
                request.done,
                Err(SessionError::ConnectionLost(request.kind.as_str())),
            );
        }
        for ((kind, _), request) in state.inflight.drain() {
            complete(request.done, Err(SessionError::ConnectionLost(kind.as_str())));
        }

        self.pending_tx.send_replace(0);
    }

    /// Requests queued or in flight
    pub fn pending(&self) -> usize {
        self.lock().pending()
    }

    /// Resolve once nothing is queued or in flight
    pub async fn wait_idle(&self) {
        let mut pending_rx = self.pending_tx.subscribe();
        let _ = pending_rx.wait_for(|pending| *pending == 0).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn complete(done: Option<Completer>, result: Result<u16, SessionError>) {
    if let Some(done) = done {
        // The waiter may have given up already
        let _ = done.send(result);
    }
}
