//! Mock implementations for testing
//!
//! [`MockSession`] records every call the lifecycle makes and can be told to
//! fail specific operations. Clones share state, so a test keeps one clone for
//! inspection while the client under test owns another.

use crate::transport::{
    Message, MessageHandler, QoS, Session, SessionError, SessionOptions,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A call observed by [`MockSession`]
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Connect,
    Subscribe { topic: String, qos: QoS },
    Unsubscribe { topics: Vec<String> },
    Publish {
        topic: String,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
    },
    Disconnect { quiesce: Duration },
}

/// Mock session for testing
#[derive(Clone, Default)]
pub struct MockSession {
    pub options: Option<SessionOptions>,
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    pub handlers: Arc<Mutex<Vec<(String, MessageHandler)>>>,
    pub fail_connect: bool,
    pub fail_subscribe: HashSet<String>,
    pub fail_unsubscribe: bool,
    pub fail_publish: bool,
    connected: Arc<AtomicBool>,
    next_pkid: Arc<AtomicU16>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock built from real options, as the client builder would pass them
    pub fn from_options(options: SessionOptions) -> Self {
        Self {
            options: Some(options),
            ..Default::default()
        }
    }

    pub fn with_connect_failure() -> Self {
        Self {
            fail_connect: true,
            ..Default::default()
        }
    }

    /// Fail subscriptions to `topic`
    pub fn failing_subscribe(mut self, topic: &str) -> Self {
        self.fail_subscribe.insert(topic.to_string());
        self
    }

    pub fn failing_unsubscribe(mut self) -> Self {
        self.fail_unsubscribe = true;
        self
    }

    pub fn failing_publish(mut self) -> Self {
        self.fail_publish = true;
        self
    }

    pub async fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().await.clone()
    }

    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.handlers
            .lock()
            .await
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Feed `message` to every handler subscribed to exactly its topic
    pub async fn deliver(&self, message: Message) -> usize {
        let handlers: Vec<MessageHandler> = self
            .handlers
            .lock()
            .await
            .iter()
            .filter(|(topic, _)| *topic == message.topic)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in &handlers {
            handler(message.clone());
        }
        handlers.len()
    }

    pub async fn clear_history(&self) {
        self.calls.lock().await.clear();
    }

    fn fail(operation: &str) -> SessionError {
        SessionError::ConnectionFailed(format!("Mock {operation} failure"))
    }
}

#[async_trait]
impl Session for MockSession {
    async fn connect(&mut self) -> Result<(), SessionError> {
        self.calls.lock().await.push(MockCall::Connect);
        if self.fail_connect {
            return Err(Self::fail("connection"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &mut self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), SessionError> {
        self.calls.lock().await.push(MockCall::Subscribe {
            topic: topic.to_string(),
            qos,
        });
        if self.fail_subscribe.contains(topic) {
            return Err(SessionError::Rejected {
                operation: "subscribe",
                reason: format!("Mock refused {topic}"),
            });
        }
        self.handlers
            .lock()
            .await
            .push((topic.to_string(), handler));
        Ok(())
    }

    async fn unsubscribe(&mut self, topics: &[String]) -> Result<(), SessionError> {
        self.calls.lock().await.push(MockCall::Unsubscribe {
            topics: topics.to_vec(),
        });
        if self.fail_unsubscribe {
            return Err(Self::fail("unsubscribe"));
        }
        self.handlers
            .lock()
            .await
            .retain(|(topic, _)| !topics.contains(topic));
        Ok(())
    }

    async fn disconnect(&mut self, quiesce: Duration) {
        self.calls.lock().await.push(MockCall::Disconnect { quiesce });
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
    ) -> Result<u16, SessionError> {
        self.calls.lock().await.push(MockCall::Publish {
            topic: topic.to_string(),
            qos,
            retained,
            payload,
        });
        if self.fail_publish {
            return Err(Self::fail("publish"));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::NotConnected {
                state: crate::transport::ConnectionState::Disconnected(
                    "Mock not connected".to_string(),
                ),
            });
        }
        match qos {
            QoS::AtMostOnce => Ok(0),
            _ => Ok(self.next_pkid.fetch_add(1, Ordering::SeqCst) + 1),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
