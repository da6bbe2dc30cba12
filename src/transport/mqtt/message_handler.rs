//! Pure event routing and subscription dispatch
//!
//! Turns rumqttc events into [`EventRoute`] decisions and maps incoming topics
//! onto the handlers registered for matching filters.

use crate::transport::{Message, MessageHandler, QoS};
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Request types whose completion is signalled by an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Publish => "publish",
            RequestKind::Subscribe => "subscribe",
            RequestKind::Unsubscribe => "unsubscribe",
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged { session_present: bool },
    /// Message received on a subscribed topic
    MessageReceived(Message),
    /// A request left the client with this packet id
    RequestSent { kind: RequestKind, pkid: u16 },
    /// The broker answered a request; `rejection` is set for refused subscriptions
    RequestAcknowledged {
        kind: RequestKind,
        pkid: u16,
        rejection: Option<String>,
    },
    /// Our DISCONNECT has been written
    DisconnectSent,
    /// MQTT broker disconnected
    Disconnected,
    /// Infrastructure event (PingResp, PubRec, etc.)
    InfrastructureEvent(String),
    /// Outgoing event that needs no bookkeeping
    OutgoingEvent,
}

/// Pure routing decisions based on MQTT events
pub struct EventRouter;

impl EventRouter {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    retain: publish.retain,
                    pkid: publish.pkid,
                    dup: publish.dup,
                }),
                // QoS 1 completes on PUBACK, QoS 2 on PUBCOMP
                Packet::PubAck(ack) => EventRoute::RequestAcknowledged {
                    kind: RequestKind::Publish,
                    pkid: ack.pkid,
                    rejection: None,
                },
                Packet::PubComp(comp) => EventRoute::RequestAcknowledged {
                    kind: RequestKind::Publish,
                    pkid: comp.pkid,
                    rejection: None,
                },
                Packet::SubAck(suback) => EventRoute::RequestAcknowledged {
                    kind: RequestKind::Subscribe,
                    pkid: suback.pkid,
                    rejection: Self::validate_subscription_success(&suback.return_codes).err(),
                },
                Packet::UnsubAck(unsuback) => EventRoute::RequestAcknowledged {
                    kind: RequestKind::Unsubscribe,
                    pkid: unsuback.pkid,
                    rejection: None,
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::RequestSent {
                    kind: RequestKind::Publish,
                    pkid: *pkid,
                },
                Outgoing::Subscribe(pkid) => EventRoute::RequestSent {
                    kind: RequestKind::Subscribe,
                    pkid: *pkid,
                },
                Outgoing::Unsubscribe(pkid) => EventRoute::RequestSent {
                    kind: RequestKind::Unsubscribe,
                    pkid: *pkid,
                },
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// Validate subscription success from SubAck
    pub fn validate_subscription_success(
        return_codes: &[SubscribeReasonCode],
    ) -> Result<(), String> {
        if return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}

/// Check whether a topic filter (with `+` and `#` wildcards) matches a topic
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // Wildcards never match topics starting with '$'
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct HandlerEntry {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

/// Subscription filters and their handlers
///
/// Subscribing to a filter that is already present replaces its handler.
#[derive(Default)]
pub struct HandlerTable {
    entries: RwLock<Vec<HandlerEntry>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, filter: &str, qos: QoS, handler: MessageHandler) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|entry| entry.filter != filter);
        entries.push(HandlerEntry {
            filter: filter.to_string(),
            qos,
            handler,
        });
    }

    pub fn remove(&self, filter: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|entry| entry.filter != filter);
        entries.len() != before
    }

    /// Handlers whose filter matches `topic`, in subscription order
    pub fn matching(&self, topic: &str) -> Vec<MessageHandler> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| topic_matches(&entry.filter, topic))
            .map(|entry| entry.handler.clone())
            .collect()
    }

    /// Filters with their QoS, used to restore subscriptions after a reconnect
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| (entry.filter.clone(), entry.qos))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every matching handler for `message`
    ///
    /// With `ordered` set the handlers run inline, so messages are handled one
    /// at a time in arrival order. Otherwise each handler call is spawned.
    pub fn dispatch(&self, message: Message, ordered: bool) -> usize {
        let handlers = self.matching(&message.topic);
        if handlers.is_empty() {
            debug!(topic = %message.topic, "No handler for incoming message");
            return 0;
        }

        let count = handlers.len();
        for handler in handlers {
            if ordered {
                handler(message.clone());
            } else {
                let message = message.clone();
                tokio::spawn(async move { handler(message) });
            }
        }
        count
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}
