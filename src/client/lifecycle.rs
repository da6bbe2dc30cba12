//! Session lifecycle: connect, subscribe, publish, stop
//!
//! ```text
//! Idle --start--> Connected --(all intents subscribed)--> Subscribed
//!   \                 |                                      |
//!    \---stop---------+-----------------stop-----------------+--> Stopped
//! ```
//!
//! Every transition awaits the broker's answer before returning. Nothing is
//! retried: a failed step leaves the client in the last state it reached.

use super::{LifecycleError, PublishResult, SubscribeIntent};
use crate::transport::{QoS, Session};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

/// Where a [`SessionClient`] is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built, not connected
    Idle,
    /// Connected, some intents may still be unsubscribed
    Connected,
    /// Connected with every intent subscribed
    Subscribed,
    /// Stopped; the client cannot be restarted
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Connected => "connected",
            LifecycleState::Subscribed => "subscribed",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A configured session plus the subscriptions it should hold
pub struct SessionClient<S: Session> {
    session: S,
    broker: String,
    username: String,
    quiesce: Duration,
    intents: Vec<SubscribeIntent>,
    /// Number of leading intents currently subscribed
    subscribed: usize,
    state: LifecycleState,
}

impl<S: Session> SessionClient<S> {
    pub fn new(
        session: S,
        broker: String,
        username: String,
        quiesce: Duration,
        intents: Vec<SubscribeIntent>,
    ) -> Self {
        Self {
            session,
            broker,
            username,
            quiesce,
            intents,
            subscribed: 0,
            state: LifecycleState::Idle,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn quiesce(&self) -> Duration {
        self.quiesce
    }

    /// Underlying session, mostly for inspection in tests
    pub fn session(&self) -> &S {
        &self.session
    }

    /// Topics of every configured intent, in subscription order
    pub fn intent_topics(&self) -> Vec<&str> {
        self.intents.iter().map(|i| i.topic.as_str()).collect()
    }

    /// Topics currently held on the broker
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.intents[..self.subscribed]
            .iter()
            .map(|i| i.topic.clone())
            .collect()
    }

    /// Connect and subscribe every intent, in order
    ///
    /// On a subscription failure the intents already subscribed are kept and
    /// the client stays `Connected`; calling `start` again resumes with the
    /// intent that failed.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        let span = crate::lifecycle_span!(operation = "start", broker = %self.broker);
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            LifecycleState::Idle => {
                info!("Connecting to broker");
                self.session
                    .connect()
                    .await
                    .map_err(|source| LifecycleError::ConnectFailed {
                        broker: self.broker.clone(),
                        source,
                    })?;
                self.state = LifecycleState::Connected;
                info!("Connected to broker");
            }
            LifecycleState::Connected => {
                debug!(
                    resume_at = self.subscribed,
                    "Already connected, resuming subscriptions"
                );
            }
            state => {
                return Err(LifecycleError::InvalidState {
                    operation: "start",
                    state,
                })
            }
        }

        while let Some(intent) = self.intents.get(self.subscribed) {
            debug!(topic = %intent.topic, qos = ?intent.qos, "Subscribing");
            if let Err(source) = self
                .session
                .subscribe(&intent.topic, intent.qos, intent.handler.clone())
                .await
            {
                error!(topic = %intent.topic, error = %source, "Subscription failed");
                return Err(LifecycleError::SubscribeFailed {
                    topic: intent.topic.clone(),
                    source,
                });
            }
            info!(topic = %intent.topic, "Subscribed");
            self.subscribed += 1;
        }

        self.state = LifecycleState::Subscribed;
        Ok(())
    }

    /// Unsubscribe everything held, then disconnect
    ///
    /// The disconnect always runs, even when the unsubscribe fails; the
    /// unsubscribe error is returned afterwards.
    pub async fn stop(&mut self) -> Result<(), LifecycleError> {
        let span = crate::lifecycle_span!(operation = "stop", broker = %self.broker);
        self.stop_inner().instrument(span).await
    }

    async fn stop_inner(&mut self) -> Result<(), LifecycleError> {
        if self.state == LifecycleState::Stopped {
            return Err(LifecycleError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        }

        let topics = self.subscribed_topics();
        let unsubscribed = if topics.is_empty() {
            Ok(())
        } else {
            debug!(?topics, "Unsubscribing");
            self.session.unsubscribe(&topics).await
        };

        self.session.disconnect(self.quiesce).await;
        self.state = LifecycleState::Stopped;
        self.subscribed = 0;

        match unsubscribed {
            Ok(()) => {
                info!("Session stopped");
                Ok(())
            }
            Err(source) => {
                warn!(error = %source, "Unsubscribe failed, session disconnected anyway");
                Err(LifecycleError::UnsubscribeFailed { topics, source })
            }
        }
    }

    /// Publish one message and wait for the broker to take it
    pub async fn send_message(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Result<PublishResult, LifecycleError> {
        if !matches!(
            self.state,
            LifecycleState::Connected | LifecycleState::Subscribed
        ) {
            return Err(LifecycleError::NotConnected { state: self.state });
        }

        let level = qos as u8;
        let span = crate::mqtt_span!(operation = "publish", topic = %topic, qos = level);
        let msg_id = self
            .session
            .publish(topic, qos, retained, payload.into())
            .instrument(span)
            .await
            .map_err(|source| LifecycleError::PublishFailed {
                topic: topic.to_string(),
                source,
            })?;
        debug!(topic = %topic, msg_id, "Message published");

        Ok(PublishResult {
            topic: topic.to_string(),
            broker: self.broker.clone(),
            username: self.username.clone(),
            msg_id,
            qos: level,
            retained,
        })
    }
}
