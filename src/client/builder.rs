//! Turns configuration into a ready-to-start [`SessionClient`]

use super::{BuildError, SessionClient, SubscribeIntent};
use crate::config::{CredentialPair, MqttConfig};
use crate::credentials::{
    mask_secret, CredentialMode, CredentialStrategy, DeviceIdSource, DirectCredentials,
    SignedCredentials,
};
use crate::store::StoreRegistry;
use crate::transport::mqtt::MqttSession;
use crate::transport::{
    Session, SessionError, SessionOptions, DEFAULT_KEEP_ALIVE, DEFAULT_PING_TIMEOUT,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Disconnect quiesce used when none is configured
pub const DEFAULT_QUIESCE: Duration = Duration::from_millis(250);

/// Builds a [`SessionClient`] from an [`MqttConfig`]
///
/// Nothing touches the network until [`SessionClient::start`] is called.
pub struct ClientBuilder<'a> {
    config: &'a MqttConfig,
    registry: &'a StoreRegistry,
    intents: Vec<SubscribeIntent>,
}

impl<'a> ClientBuilder<'a> {
    /// Builder resolving stores through [`StoreRegistry::global`]
    pub fn new(config: &'a MqttConfig) -> Self {
        Self {
            config,
            registry: StoreRegistry::global(),
            intents: Vec::new(),
        }
    }

    /// Resolve stores through `registry` instead of the global one
    pub fn with_registry(mut self, registry: &'a StoreRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Append one subscription intent
    pub fn subscribe(mut self, intent: SubscribeIntent) -> Self {
        self.intents.push(intent);
        self
    }

    /// Append several subscription intents, keeping their order
    pub fn intents(mut self, intents: impl IntoIterator<Item = SubscribeIntent>) -> Self {
        self.intents.extend(intents);
        self
    }

    /// Quiesce duration, falling back to [`DEFAULT_QUIESCE`] when unset
    pub fn quiesce(&self) -> Duration {
        match self.config.client.quiesce {
            0 => DEFAULT_QUIESCE,
            ms => Duration::from_millis(ms),
        }
    }

    /// Resolve everything a session needs without constructing one
    pub fn session_options(&self) -> Result<SessionOptions, BuildError> {
        let client = &self.config.client;

        if let Some(index) = self.intents.iter().position(|i| i.topic.is_empty()) {
            return Err(BuildError::InvalidArgument(format!(
                "subscription #{index} has an empty topic"
            )));
        }

        let keep_alive = non_zero_or(client.keep_alive, DEFAULT_KEEP_ALIVE);
        let ping_timeout = non_zero_or(client.ping_timeout, DEFAULT_PING_TIMEOUT);

        let name = client.credential.name.as_str();
        if name.is_empty() {
            return Err(BuildError::MissingCredentialName);
        }
        let pair = self.config.credential_pair(name).cloned().unwrap_or_else(|| {
            warn!(credential = %name, "No credentials configured under this name, using empty values");
            CredentialPair::default()
        });

        let strategy = self.credential_strategy(pair);
        let credentials = strategy.resolve()?;
        if credentials.client_id.is_empty() {
            return Err(BuildError::MissingClientId);
        }

        let store = match client.store.provider() {
            Some(provider) => {
                debug!(provider = %provider, "Resolving message store");
                Some(self.registry.resolve(provider, &client.store)?)
            }
            None => None,
        };

        info!(
            broker = %client.broker_server,
            client_id = %credentials.client_id,
            username = %credentials.username,
            password = %mask_secret(&credentials.password, 4),
            mode = %strategy.mode(),
            "Resolved session options"
        );

        Ok(SessionOptions {
            broker: client.broker_server.clone(),
            client_id: credentials.client_id,
            username: credentials.username,
            password: credentials.password,
            clean_session: client.clean_session,
            keep_alive,
            ping_timeout,
            auto_reconnect: client.auto_reconnect,
            order_matters: client.order_matters,
            store,
        })
    }

    /// Build a client backed by [`MqttSession`]
    pub fn build(self) -> Result<SessionClient<MqttSession>, BuildError> {
        self.build_with(MqttSession::new)
    }

    /// Build a client backed by a session produced by `factory`
    pub fn build_with<S, F>(self, factory: F) -> Result<SessionClient<S>, BuildError>
    where
        S: Session,
        F: FnOnce(SessionOptions) -> Result<S, SessionError>,
    {
        let options = self.session_options()?;
        let broker = options.broker.clone();
        let username = options.username.clone();
        let quiesce = self.quiesce();

        let session = factory(options)?;
        Ok(SessionClient::new(
            session,
            broker,
            username,
            quiesce,
            self.intents,
        ))
    }

    fn credential_strategy(&self, pair: CredentialPair) -> Box<dyn CredentialStrategy> {
        let client = &self.config.client;
        match client.credential.mode {
            CredentialMode::Normal => Box::new(DirectCredentials::new(
                &client.client_id,
                &pair.username,
                &pair.password,
            )),
            CredentialMode::AliyunSignature => Box::new(SignedCredentials {
                access_key_id: pair.username,
                access_key_secret: pair.password,
                instance_id: client.instance_id.clone(),
                group_id: client.group_id.clone(),
                device: DeviceIdSource {
                    device_id: client.device_id.clone(),
                    env: client.device_id_env.clone(),
                    file: client.device_id_file.clone(),
                },
            }),
        }
    }
}

fn non_zero_or(value: Option<Duration>, default: Duration) -> Duration {
    value.filter(|d| !d.is_zero()).unwrap_or(default)
}
