//! Impure I/O operations for the MQTT session
//!
//! Owns the rumqttc client and runs its event loop on a background task. The
//! task routes every event through [`EventRouter`], keeps the connection state
//! channel current, dispatches incoming messages and resolves pending requests.

use super::connection::{configure_mqtt_options, ConnectionState, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, EventRouter, HandlerTable, RequestKind};
use super::requests::{Completion, RequestTracker};
use crate::store::{outbound_key, MessageStore, StoredPacket, OUTBOUND_PREFIX};
use crate::transport::{MessageHandler, QoS, Session, SessionError, SessionOptions};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request channel between client and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Upper bound on waiting for DISCONNECT to be flushed when quiesce is zero
const MIN_DISCONNECT_WAIT: Duration = Duration::from_millis(250);

/// Session backed by a rumqttc client
pub struct MqttSession {
    options: SessionOptions,
    client: AsyncClient,
    /// Taken by the first connect; behind a lock so the session stays `Sync`
    event_loop: Mutex<Option<EventLoop>>,
    handlers: Arc<HandlerTable>,
    requests: Arc<RequestTracker>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Option<watch::Sender<bool>>,
    closing: Arc<AtomicBool>,
    event_loop_handle: Option<JoinHandle<()>>,
    reconnect_config: ReconnectConfig,
}

impl MqttSession {
    /// Validate options and prepare the client; nothing is sent until [`Session::connect`]
    pub fn new(options: SessionOptions) -> Result<Self, SessionError> {
        let (client, event_loop) = Self::create_connection(&options)?;
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected("Not connected".to_string()));
        let requests = Arc::new(RequestTracker::new(options.store.clone()));

        Ok(Self {
            options,
            client,
            event_loop: Mutex::new(Some(event_loop)),
            handlers: Arc::new(HandlerTable::new()),
            requests,
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx: None,
            closing: Arc::new(AtomicBool::new(false)),
            event_loop_handle: None,
            reconnect_config: ReconnectConfig::default(),
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Active subscription filters with their QoS
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.handlers.subscriptions()
    }

    fn create_connection(options: &SessionOptions) -> Result<(AsyncClient, EventLoop), SessionError> {
        let mqtt_options = configure_mqtt_options(options)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let confirmation = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(SessionError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(SessionError::ConnectionFailed(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(SessionError::ConnectionFailed(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match confirmation {
            Ok(result) => result,
            Err(_) => Err(SessionError::ConnectionFailed(format!(
                "No CONNACK within {timeout:?}"
            ))),
        }
    }

    fn check_connection_state(&self) -> Result<(), SessionError> {
        let current_state = self.state_rx.borrow().clone();
        if !HealthMonitor::can_send_requests(&current_state) {
            return Err(SessionError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    /// Unacknowledged publishes an earlier session left in the store, oldest first
    fn load_leftovers(store: &dyn MessageStore) -> Result<Vec<StoredPacket>, SessionError> {
        let mut leftovers = Vec::new();
        for key in store.all()? {
            if !key.starts_with(OUTBOUND_PREFIX) {
                continue;
            }
            if let Some(packet) = store.get(&key)? {
                leftovers.push(packet);
            }
        }
        leftovers.sort_by_key(|packet| packet.pkid);
        Ok(leftovers)
    }

    /// Resend leftovers under fresh packet ids, one at a time
    ///
    /// The old keys are dropped first since the new session reuses the same
    /// packet id range. Whatever was not resent goes back under its old key.
    async fn republish_leftovers(
        &self,
        store: &dyn MessageStore,
        leftovers: Vec<StoredPacket>,
    ) -> Result<(), SessionError> {
        for packet in &leftovers {
            store.del(&outbound_key(packet.pkid))?;
        }

        let mut remaining = leftovers.into_iter();
        while let Some(packet) = remaining.next() {
            let qos = match rumqttc::mqttbytes::qos(packet.qos) {
                Ok(qos) => qos,
                Err(e) => {
                    warn!(pkid = packet.pkid, topic = %packet.topic, "Dropping stored publish: {}", e);
                    continue;
                }
            };

            let submitted = self
                .requests
                .submit(RequestKind::Publish, qos, Some(packet.clone()), || {
                    self.client.try_publish(
                        packet.topic.as_str(),
                        qos,
                        packet.retain,
                        packet.payload.clone(),
                    )
                });
            let result = match submitted {
                Ok(done) => Self::await_completion(done, RequestKind::Publish).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(pkid) => {
                    debug!(topic = %packet.topic, old_pkid = packet.pkid, pkid, "Republished stored publish");
                }
                Err(e) => {
                    Self::restore_leftover(store, &packet);
                    for packet in remaining {
                        Self::restore_leftover(store, &packet);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn restore_leftover(store: &dyn MessageStore, packet: &StoredPacket) {
        let key = outbound_key(packet.pkid);
        let restored = match store.get(&key) {
            Ok(None) => store.put(&key, packet),
            Ok(Some(current)) if current == *packet => Ok(()),
            Ok(Some(_)) => {
                warn!(key = %key, "Stored publish slot taken by the new session, dropping older record");
                Ok(())
            }
            Err(e) => Err(e),
        };
        if let Err(e) = restored {
            warn!(key = %key, store = store.name(), "Failed to restore stored publish: {}", e);
        }
    }

    async fn await_completion(done: Completion, kind: RequestKind) -> Result<u16, SessionError> {
        done.await
            .map_err(|_| SessionError::ConnectionLost(kind.as_str()))?
    }

    fn stop_event_loop(&mut self, handle: Option<JoinHandle<()>>) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn transition(&self, event: ConnectionEvent) {
        transition(&self.state_tx, &self.options.client_id, event);
    }
}

fn transition(
    state_tx: &watch::Sender<ConnectionState>,
    client_id: &str,
    event: ConnectionEvent,
) {
    let next = HealthMonitor::determine_next_state(event);
    let previous = state_tx.send_replace(next.clone());
    if previous != next {
        HealthMonitor::log_state_transition(client_id, &previous, &next);
    }
}

/// Everything the event loop task needs, detached from the session
struct EventLoopContext {
    client: AsyncClient,
    client_id: String,
    handlers: Arc<HandlerTable>,
    requests: Arc<RequestTracker>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    closing: Arc<AtomicBool>,
    reconnect_config: ReconnectConfig,
    auto_reconnect: bool,
    order_matters: bool,
}

impl EventLoopContext {
    fn transition(&self, event: ConnectionEvent) {
        transition(&self.state_tx, &self.client_id, event);
    }

    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        info!(client_id = %self.client_id, "Starting MQTT event loop");
        let mut reconnect_attempts = 0u32;
        let mut ever_connected = false;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping event loop");
                        break;
                    }
                }

                polled = event_loop.poll() => {
                    match polled {
                        Ok(event) => {
                            let route = EventRouter::route_mqtt_event(&event);
                            if !self.process_event_route(route, &mut reconnect_attempts, &mut ever_connected) {
                                break;
                            }
                        }
                        Err(e) => {
                            if !self
                                .handle_event_loop_error(
                                    e,
                                    &mut reconnect_attempts,
                                    ever_connected,
                                    shutdown_rx.clone(),
                                )
                                .await
                            {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.requests.fail_all();
        info!(client_id = %self.client_id, "MQTT event loop stopped");
    }

    /// Returns true to continue the loop, false to stop it
    fn process_event_route(
        &self,
        route: EventRoute,
        reconnect_attempts: &mut u32,
        ever_connected: &mut bool,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                self.transition(ConnectionEvent::ConnAckReceived);
                *reconnect_attempts = 0;
                if *ever_connected && !session_present {
                    self.resubscribe();
                }
                *ever_connected = true;
                true
            }
            EventRoute::MessageReceived(message) => {
                debug!(topic = %message.topic, bytes = message.payload.len(), "Received MQTT message");
                self.handlers.dispatch(message, self.order_matters);
                true
            }
            EventRoute::RequestSent { kind, pkid } => {
                self.requests.on_request_sent(kind, pkid);
                true
            }
            EventRoute::RequestAcknowledged {
                kind,
                pkid,
                rejection,
            } => {
                if let Some(reason) = &rejection {
                    warn!(pkid, "Broker rejected {}: {}", kind.as_str(), reason);
                }
                self.requests.on_acknowledged(kind, pkid, rejection);
                true
            }
            EventRoute::DisconnectSent => {
                debug!("DISCONNECT sent");
                false
            }
            EventRoute::Disconnected => {
                self.transition(ConnectionEvent::DisconnectedByBroker);
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Returns true to keep polling (rumqttc reconnects on the next poll)
    async fn handle_event_loop_error(
        &self,
        error: ConnectionError,
        reconnect_attempts: &mut u32,
        ever_connected: bool,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        let reason = error.to_string();
        self.transition(ConnectionEvent::NetworkError(reason.clone()));
        self.requests.fail_interrupted();

        let decision = HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            &self.reconnect_config,
            self.auto_reconnect,
            ever_connected,
            *shutdown_rx.borrow() || self.closing.load(Ordering::SeqCst),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );
                interruptible_sleep(shutdown_rx, delay_ms).await
            }
            ReconnectionDecision::AbortNeverConnected => {
                debug!("Initial connection failed: {}", reason);
                false
            }
            ReconnectionDecision::AbortReconnectDisabled => {
                warn!("Connection lost and auto-reconnect is disabled: {}", reason);
                false
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!("Max reconnection attempts ({reconnect_attempts}) exceeded");
                error!("{}", reason);
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }

    fn resubscribe(&self) {
        for (filter, qos) in self.handlers.subscriptions() {
            let queued = self.requests.submit_detached(RequestKind::Subscribe, qos, || {
                self.client.try_subscribe(filter.as_str(), qos)
            });
            match queued {
                Ok(()) => debug!(target: "mqtt_transport", "Re-subscribed to: {}", filter),
                Err(e) => error!("Failed to re-subscribe to {}: {}", filter, e),
            }
        }
    }
}

/// Sleep unless shutdown is signalled first; false means shutdown
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn connect(&mut self) -> Result<(), SessionError> {
        if self
            .event_loop_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return Err(SessionError::ConnectionFailed(
                "Event loop already running".to_string(),
            ));
        }

        let cached = self
            .event_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let event_loop = match cached {
            Some(event_loop) => event_loop,
            None => {
                let (client, event_loop) = Self::create_connection(&self.options)?;
                self.client = client;
                event_loop
            }
        };

        let mut leftovers = Vec::new();
        if let Some(store) = &self.options.store {
            store.open()?;
            if self.options.clean_session {
                store.reset()?;
            } else {
                leftovers = Self::load_leftovers(store.as_ref())?;
                if !leftovers.is_empty() {
                    info!(
                        store = store.name(),
                        count = leftovers.len(),
                        "Resending unacknowledged publishes from an earlier session"
                    );
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        self.closing.store(false, Ordering::SeqCst);
        self.transition(ConnectionEvent::ConnectionStarted);

        let context = EventLoopContext {
            client: self.client.clone(),
            client_id: self.options.client_id.clone(),
            handlers: self.handlers.clone(),
            requests: self.requests.clone(),
            state_tx: self.state_tx.clone(),
            closing: self.closing.clone(),
            reconnect_config: self.reconnect_config.clone(),
            auto_reconnect: self.options.auto_reconnect,
            order_matters: self.options.order_matters,
        };
        self.event_loop_handle = Some(tokio::spawn(context.run(event_loop, shutdown_rx)));

        info!(
            broker = %self.options.broker,
            client_id = %self.options.client_id,
            "Connecting to MQTT broker"
        );
        let confirmation =
            Self::wait_for_connection_confirmation(self.state_rx.clone(), self.options.ping_timeout)
                .await;

        let resent = match (confirmation, self.options.store.clone()) {
            (Err(e), _) => Err(e),
            (Ok(()), Some(store)) if !leftovers.is_empty() => {
                self.republish_leftovers(store.as_ref(), leftovers).await
            }
            (Ok(()), _) => Ok(()),
        };

        if let Err(e) = resent {
            let handle = self.event_loop_handle.take();
            self.stop_event_loop(handle);
            self.transition(ConnectionEvent::NetworkError(e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    async fn subscribe(
        &mut self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), SessionError> {
        self.check_connection_state()?;

        // Installed before SUBSCRIBE so retained messages are not missed
        self.handlers.insert(topic, qos, handler);

        let submitted = self.requests.submit(RequestKind::Subscribe, qos, None, || {
            self.client.try_subscribe(topic, qos)
        });
        let result = match submitted {
            Ok(done) => Self::await_completion(done, RequestKind::Subscribe).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(pkid) => {
                debug!(topic = %topic, pkid, "Subscribed");
                Ok(())
            }
            Err(e) => {
                self.handlers.remove(topic);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&mut self, topics: &[String]) -> Result<(), SessionError> {
        if topics.is_empty() {
            return Ok(());
        }
        self.check_connection_state()?;

        let mut first_error = None;
        let mut pending = Vec::with_capacity(topics.len());
        for topic in topics {
            let submitted = self
                .requests
                .submit(RequestKind::Unsubscribe, QoS::AtMostOnce, None, || {
                    self.client.try_unsubscribe(topic.as_str())
                });
            match submitted {
                Ok(done) => pending.push((topic, done)),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        for (topic, done) in pending {
            match Self::await_completion(done, RequestKind::Unsubscribe).await {
                Ok(_) => {
                    self.handlers.remove(topic);
                }
                Err(e) => {
                    warn!(topic = %topic, "Unsubscribe failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn disconnect(&mut self, quiesce: Duration) {
        let Some(mut handle) = self.event_loop_handle.take() else {
            debug!("Disconnect requested but the session was never connected");
            return;
        };

        if !handle.is_finished() {
            if self.requests.pending() > 0
                && tokio::time::timeout(quiesce, self.requests.wait_idle())
                    .await
                    .is_err()
            {
                warn!(
                    pending = self.requests.pending(),
                    "Quiesce period elapsed with requests still in flight"
                );
            }

            // A dropped connection from here on is not worth reconnecting
            self.closing.store(true, Ordering::SeqCst);
            if let Err(e) = self.client.try_disconnect() {
                warn!("Failed to queue DISCONNECT: {}", e);
            }

            match tokio::time::timeout(quiesce.max(MIN_DISCONNECT_WAIT), &mut handle).await {
                Ok(_) => info!("Event loop task shut down gracefully"),
                Err(_) => warn!("Event loop task didn't shut down in time, forcing abort"),
            }
        }

        self.stop_event_loop(Some(handle));
        self.transition(ConnectionEvent::ClientDisconnected);

        if let Some(store) = &self.options.store {
            store.close();
        }
        info!(client_id = %self.options.client_id, "MQTT session disconnected");
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
    ) -> Result<u16, SessionError> {
        self.check_connection_state()?;

        let record = (self.options.store.is_some() && qos != QoS::AtMostOnce).then(|| {
            StoredPacket {
                pkid: 0,
                topic: topic.to_string(),
                qos: qos as u8,
                retain: retained,
                payload: payload.clone(),
            }
        });

        let done = self.requests.submit(RequestKind::Publish, qos, record, || {
            self.client.try_publish(topic, qos, retained, payload)
        })?;
        let pkid = Self::await_completion(done, RequestKind::Publish).await?;

        debug!(topic = %topic, pkid, qos = qos as u8, retained, "Published");
        Ok(pkid)
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state_rx.borrow(), ConnectionState::Connected)
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // No async in Drop: callers wanting a clean DISCONNECT call disconnect()
        let handle = self.event_loop_handle.take();
        self.stop_event_loop(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{BrokerPacket, FakeBroker};

    fn handler() -> MessageHandler {
        Arc::new(|_message| {})
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            MqttSession::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.is_ok(), "Should successfully wait for connection");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let result =
            MqttSession::wait_for_connection_confirmation(state_rx, Duration::from_millis(10)).await;
        drop(state_tx);

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("CONNACK"), "got: {err_msg}");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_disconnected() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("Test disconnect".to_string()));
        });

        let result =
            MqttSession::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.unwrap_err().to_string().contains("Test disconnect"));
    }

    #[tokio::test]
    async fn test_interruptible_sleep() {
        let (_tx, rx) = watch::channel(false);
        assert!(interruptible_sleep(rx, 10).await);

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(true);
        });
        assert!(!interruptible_sleep(rx, 5_000).await);
    }

    #[test]
    fn test_new_rejects_invalid_broker() {
        let result = MqttSession::new(SessionOptions::new("not a url", "cid"));
        assert!(matches!(result, Err(SessionError::InvalidBrokerUrl(_))));
    }

    #[tokio::test]
    async fn test_operations_fail_without_connection() {
        let mut session =
            MqttSession::new(SessionOptions::new("tcp://127.0.0.1:1883", "cid")).unwrap();

        assert!(!session.is_connected());
        assert!(matches!(
            session.publish("a", QoS::AtLeastOnce, false, b"x".to_vec()).await,
            Err(SessionError::NotConnected { .. })
        ));
        assert!(matches!(
            session.subscribe("a", QoS::AtLeastOnce, handler()).await,
            Err(SessionError::NotConnected { .. })
        ));
        assert!(session.subscriptions().is_empty());

        // Nothing to unsubscribe is not an error
        assert!(session.unsubscribe(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let mut session =
            MqttSession::new(SessionOptions::new("tcp://127.0.0.1:1883", "cid")).unwrap();
        session.disconnect(Duration::from_millis(10)).await;
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut options = SessionOptions::new(&format!("tcp://127.0.0.1:{port}"), "cid");
        options.ping_timeout = Duration::from_secs(2);
        let mut session = MqttSession::new(options).unwrap();

        let result = session.connect().await;
        assert!(matches!(result, Err(SessionError::ConnectionFailed(_))));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_round_trip_against_fake_broker() {
        let broker = FakeBroker::start().await.unwrap();
        let store = Arc::new(MemoryStore::new());

        let mut options = SessionOptions::new(&broker.url(), "round-trip");
        options.store = Some(store.clone());
        let mut session = MqttSession::new(options).unwrap();

        session.connect().await.unwrap();
        assert!(session.is_connected());

        session
            .subscribe("sensors/#", QoS::AtLeastOnce, handler())
            .await
            .unwrap();
        assert_eq!(
            session.subscriptions(),
            vec![("sensors/#".to_string(), QoS::AtLeastOnce)]
        );

        let pkid = session
            .publish("sensors/1", QoS::AtLeastOnce, false, b"21.5".to_vec())
            .await
            .unwrap();
        assert!(pkid > 0);
        assert!(store.all().unwrap().is_empty());

        assert_eq!(
            session
                .publish("sensors/1", QoS::AtMostOnce, false, b"x".to_vec())
                .await
                .unwrap(),
            0
        );

        session
            .unsubscribe(&["sensors/#".to_string()])
            .await
            .unwrap();
        assert!(session.subscriptions().is_empty());

        session.disconnect(Duration::from_millis(100)).await;
        assert_eq!(
            session.connection_state(),
            ConnectionState::Disconnected("Client disconnected".to_string())
        );
        assert!(matches!(store.all(), Err(crate::store::StoreError::NotOpen { .. })));
    }

    #[test]
    fn test_session_is_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MqttSession>();

        let session = MqttSession::new(SessionOptions::new("tcp://127.0.0.1:1883", "cid")).unwrap();
        let boxed: Box<dyn Session> = Box::new(session);
        assert!(!boxed.is_connected());
    }

    #[tokio::test]
    async fn test_publishes_left_by_earlier_session_are_resent() {
        let broker = FakeBroker::start().await.unwrap();
        let store = Arc::new(MemoryStore::new());
        store.open().unwrap();
        store
            .put(
                &outbound_key(1),
                &StoredPacket {
                    pkid: 1,
                    topic: "earlier/session".to_string(),
                    qos: 1,
                    retain: false,
                    payload: b"pending".to_vec(),
                },
            )
            .unwrap();
        store.close();

        let mut options = SessionOptions::new(&broker.url(), "resume");
        options.clean_session = false;
        options.store = Some(store.clone());
        let mut session = MqttSession::new(options).unwrap();
        session.connect().await.unwrap();

        session
            .publish("new/topic", QoS::AtLeastOnce, false, b"fresh".to_vec())
            .await
            .unwrap();

        let topics: Vec<String> = broker
            .packets()
            .into_iter()
            .filter_map(|packet| match packet {
                BrokerPacket::Publish { topic, .. } => Some(topic),
                _ => None,
            })
            .collect();
        assert_eq!(topics, vec!["earlier/session", "new/topic"]);
        assert!(broker.packets().contains(&BrokerPacket::Publish {
            topic: "earlier/session".to_string(),
            payload: b"pending".to_vec(),
            qos: 1,
            retain: false,
        }));
        assert!(store.all().unwrap().is_empty());

        session.disconnect(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_clean_session_discards_stored_publishes() {
        let broker = FakeBroker::start().await.unwrap();
        let store = Arc::new(MemoryStore::new());
        store.open().unwrap();
        store
            .put(
                &outbound_key(4),
                &StoredPacket {
                    pkid: 4,
                    topic: "stale".to_string(),
                    qos: 1,
                    retain: false,
                    payload: Vec::new(),
                },
            )
            .unwrap();

        let mut options = SessionOptions::new(&broker.url(), "fresh-start");
        options.clean_session = true;
        options.store = Some(store.clone());
        let mut session = MqttSession::new(options).unwrap();
        session.connect().await.unwrap();

        assert!(store.all().unwrap().is_empty());
        assert!(!broker
            .packets()
            .iter()
            .any(|packet| matches!(packet, BrokerPacket::Publish { .. })));

        session.disconnect(Duration::ZERO).await;
    }

    #[tokio::test]
    async fn test_rejected_subscription_removes_handler() {
        let broker = FakeBroker::start_rejecting(&["forbidden/#"]).await.unwrap();
        let mut session = MqttSession::new(SessionOptions::new(&broker.url(), "rejects")).unwrap();
        session.connect().await.unwrap();

        let result = session
            .subscribe("forbidden/#", QoS::AtLeastOnce, handler())
            .await;
        assert!(matches!(result, Err(SessionError::Rejected { .. })));
        assert!(session.subscriptions().is_empty());

        session.disconnect(Duration::ZERO).await;
    }
}
