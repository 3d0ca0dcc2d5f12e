use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;

/// Well-known channel names published by the protocol engine.
pub mod channels {
    pub const CONNECTION_ESTABLISHED: &str = "system.connection.established";
    pub const CONNECTION_LOST: &str = "system.connection.lost";
    pub const CONNECTION_RECONNECTING: &str = "system.connection.reconnecting";
    pub const ERROR_OCCURRED: &str = "system.error.occurred";
    pub const CLIENT_STATE: &str = "xmpp.client.state";
    pub const FEATURE_NEGOTIATED: &str = "xmpp.feature.negotiated";
    pub const FEATURE_FAILED: &str = "xmpp.feature.failed";
    pub const DOCUMENT_UNSUPPORTED: &str = "xmpp.document.unsupported";
    pub const REGISTRATION_CHALLENGE: &str = "xmpp.registration.challenge";
    pub const REGISTRATION_COMPLETED: &str = "xmpp.registration.completed";
}

/// Hierarchical channel name, e.g. `xmpp.feature.negotiated`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // lowercase a-z, 0-9 and dots only
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        matches!(name.split('.').next(), Some("system" | "xmpp"))
    }

    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The envelope wrapping every notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
    /// Links related events, e.g. every notification of one connection attempt.
    pub correlation_id: Option<Uuid>,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(channel, source, payload)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core component by name
    System(String),
    /// Protocol engine, tagged with the account JID
    Xmpp(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Connection lifecycle ──────────────────────────────────────
    ConnectionEstablished {
        jid: String,
        resumed: bool,
    },
    ConnectionLost {
        reason: String,
        will_retry: bool,
    },
    ConnectionReconnecting {
        attempt: u32,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Engine ────────────────────────────────────────────────────
    ClientStateChanged {
        from: String,
        to: String,
    },
    FeatureNegotiated {
        feature: String,
    },
    FeatureFailed {
        feature: String,
        reason: String,
    },
    UnsupportedDocument {
        name: String,
        namespace: String,
    },
    RegistrationChallenge {
        /// Serialized `<query xmlns='jabber:iq:register'/>` form.
        form: String,
    },
    RegistrationCompleted {
        username: String,
        hostname: String,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// One tokio broadcast channel per domain, filtered per subscriber by glob.
#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    xmpp_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (xmpp_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            xmpp_sender,
        }
    }

    pub fn from_config(config: &crate::config::EventBusConfig) -> Self {
        Self::new(config.channel_capacity)
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "xmpp" => Some(&self.xmpp_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(&self, pattern: &str) -> Result<DomainReceivers, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                xmpp: Some(self.xmpp_sender.subscribe()),
            });
        }

        match first_segment {
            "system" => Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                xmpp: None,
            }),
            "xmpp" => Ok(DomainReceivers {
                system: None,
                xmpp: Some(self.xmpp_sender.subscribe()),
            }),
            _ => Err(EventBusError::InvalidPattern(pattern.to_string())),
        }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        // No subscribers is not an error.
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[derive(Debug)]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    xmpp: Option<broadcast::Receiver<Event>>,
}

#[derive(Debug)]
pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let system_receiver = self.receivers.system.as_mut();
            let xmpp_receiver = self.receivers.xmpp.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(system_receiver) => result,
                result = recv_from_domain(xmpp_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | '!'))
}
