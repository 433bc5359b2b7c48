// Zenoh pub/sub transport: one key expression per direction

use tracing::{debug, info};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::{Publisher, Subscriber};
use zenoh::sample::Sample;
use zenoh::Session;

use super::channel::{ChannelError, Link, Transport};
use crate::config::SyncConfig;

/// Which end of the link this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes commands, subscribes to state
    Controller,
    /// Publishes state, subscribes to commands
    Robot,
}

#[derive(Debug, Clone)]
pub struct ZenohTransport {
    role: Role,
    config: SyncConfig,
}

impl ZenohTransport {
    pub fn new(role: Role, config: SyncConfig) -> Self {
        Self { role, config }
    }

    fn topics(&self) -> (&str, &str) {
        // (publish, subscribe)
        match self.role {
            Role::Controller => (&self.config.cmd_topic, &self.config.state_topic),
            Role::Robot => (&self.config.state_topic, &self.config.cmd_topic),
        }
    }

    fn session_config(&self) -> Result<zenoh::Config, ChannelError> {
        let mut config = zenoh::Config::default();
        if !self.config.endpoints.is_empty() {
            let endpoints = serde_json::to_string(&self.config.endpoints)
                .map_err(|e| ChannelError::Connect(e.to_string()))?;
            config
                .insert_json5("connect/endpoints", &endpoints)
                .map_err(|e| ChannelError::Connect(e.to_string()))?;
        }
        Ok(config)
    }

    async fn open(&self) -> Result<ZenohLink, ChannelError> {
        let (pub_topic, sub_topic) = self.topics();
        let connect = |e: zenoh::Error| ChannelError::Connect(e.to_string());

        info!("Opening Zenoh session...");
        let session = zenoh::open(self.session_config()?).await.map_err(connect)?;

        let publisher = session
            .declare_publisher(pub_topic.to_string())
            .await
            .map_err(connect)?;
        let subscriber = session
            .declare_subscriber(sub_topic.to_string())
            .await
            .map_err(connect)?;

        info!("Subscribed to: {}", sub_topic);
        info!("Publishing to: {}", pub_topic);
        Ok(ZenohLink {
            _session: session,
            publisher,
            subscriber,
        })
    }
}

pub struct ZenohLink {
    // Dropping the last handle closes the session
    _session: Session,
    publisher: Publisher<'static>,
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
}

impl Transport for ZenohTransport {
    type Link = ZenohLink;

    async fn connect(&self) -> Result<ZenohLink, ChannelError> {
        tokio::time::timeout(self.config.connect_timeout, self.open())
            .await
            .map_err(|_| ChannelError::Timeout(self.config.connect_timeout))?
    }
}

impl Link for ZenohLink {
    async fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.publisher
            .put(payload)
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, ChannelError> {
        // The handler only errors once the subscriber is gone
        match self.subscriber.recv_async().await {
            Ok(sample) => Ok(Some(sample.payload().to_bytes().into_owned())),
            Err(e) => {
                debug!("Zenoh subscriber closed: {}", e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_follow_role() {
        let config = SyncConfig::default();
        let controller = ZenohTransport::new(Role::Controller, config.clone());
        assert_eq!(controller.topics(), ("biped/cmd", "biped/state"));
        let robot = ZenohTransport::new(Role::Robot, config);
        assert_eq!(robot.topics(), ("biped/state", "biped/cmd"));
    }

    #[test]
    fn test_endpoints_land_in_session_config() {
        let config = SyncConfig {
            endpoints: vec!["tcp/127.0.0.1:7447".into()],
            ..SyncConfig::default()
        };
        let transport = ZenohTransport::new(Role::Controller, config);
        assert!(transport.session_config().is_ok());
    }
}
