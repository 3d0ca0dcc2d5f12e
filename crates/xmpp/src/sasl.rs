use sasl::client::Mechanism;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};
use tracing::{debug, warn};

use crate::error::{SaslCondition, SaslError};

/// Next move in a SASL exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    /// Send this payload (possibly empty).
    Respond(Vec<u8>),
    /// Give up; the feature sends `<abort/>`.
    Abort,
}

/// A client-side SASL mechanism. Open for extension; the registry decides
/// which implementations are available.
pub trait SaslMechanism: Send {
    fn name(&self) -> &str;

    fn begin(&mut self, hostname: &str) -> SaslStep;

    fn handle_challenge(&mut self, challenge: &[u8]) -> SaslStep;

    /// Check the additional data carried by `<success/>`.
    fn verify_success(&mut self, _data: &[u8]) -> Result<(), SaslError> {
        Ok(())
    }
}

pub type MechanismFactory =
    Box<dyn Fn() -> Result<Box<dyn SaslMechanism>, SaslError> + Send + Sync>;

/// Ordered mechanism name to constructor map.
///
/// Registration order is the fallback preference when the client's
/// preferred list does not decide.
#[derive(Default)]
pub struct MechanismRegistry {
    factories: Vec<(String, MechanismFactory)>,
}

impl std::fmt::Debug for MechanismRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MechanismRegistry")
            .field("mechanisms", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

const CRYPTO_MECHANISMS: &[&str] = &["SCRAM-SHA-256", "SCRAM-SHA-1", "PLAIN"];

impl MechanismRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// SCRAM-SHA-256, SCRAM-SHA-1 and PLAIN for the given credentials.
    pub fn with_credentials(username: &str, password: &str) -> Self {
        let credentials = Credentials::default()
            .with_username(username)
            .with_password(password)
            .with_channel_binding(ChannelBinding::Unsupported);

        let mut registry = Self::new();
        for name in CRYPTO_MECHANISMS {
            let credentials = credentials.clone();
            let name = *name;
            registry.register(name, move || {
                build_crypto_mechanism(name, &credentials)
                    .map(|m| Box::new(m) as Box<dyn SaslMechanism>)
            });
        }
        registry
    }

    /// Add a mechanism. Re-registering a name replaces the constructor but
    /// keeps its position.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn SaslMechanism>, SaslError> + Send + Sync + 'static,
    {
        let factory: MechanismFactory = Box::new(factory);
        match self.factories.iter_mut().find(|(n, _)| n.as_str() == name) {
            Some(entry) => entry.1 = factory,
            None => self.factories.push((name.to_string(), factory)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|(name, _)| name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.iter().any(|(n, _)| n.as_str() == name)
    }

    /// Choose a mechanism the server offers: the first preferred name that
    /// is offered and registered, else the first registered name offered.
    pub fn select(&self, offered: &[String], preferred: &[String]) -> Option<&str> {
        let is_offered = |name: &str| offered.iter().any(|o| o.as_str() == name);

        preferred
            .iter()
            .find_map(|p| {
                self.names()
                    .find(|name| *name == p.as_str() && is_offered(*name))
            })
            .or_else(|| self.names().find(|name| is_offered(*name)))
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn SaslMechanism>, SaslError> {
        let (_, factory) = self
            .factories
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .ok_or_else(|| SaslError::with_text(SaslCondition::InvalidMechanism, name))?;
        factory()
    }
}

/// Adapts a `sasl` crate mechanism to [`SaslMechanism`].
struct CryptoMechanism {
    inner: Box<dyn Mechanism + Send>,
}

impl SaslMechanism for CryptoMechanism {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn begin(&mut self, hostname: &str) -> SaslStep {
        debug!(mechanism = self.inner.name(), %hostname, "starting SASL exchange");
        SaslStep::Respond(self.inner.initial())
    }

    fn handle_challenge(&mut self, challenge: &[u8]) -> SaslStep {
        match self.inner.response(challenge) {
            Ok(response) => SaslStep::Respond(response),
            Err(error) => {
                warn!(mechanism = self.inner.name(), error = ?error, "rejecting SASL challenge");
                SaslStep::Abort
            }
        }
    }

    fn verify_success(&mut self, data: &[u8]) -> Result<(), SaslError> {
        self.inner.success(data).map_err(|error| {
            warn!(error = ?error, "server signature verification failed");
            SaslError::with_text(
                SaslCondition::NotAuthorized,
                format!("server signature verification failed: {error:?}"),
            )
        })
    }
}

fn build_crypto_mechanism(
    name: &str,
    credentials: &Credentials,
) -> Result<CryptoMechanism, SaslError> {
    let inner: Result<Box<dyn Mechanism + Send>, _> = match name {
        "SCRAM-SHA-256" => Scram::<Sha256>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>),
        "SCRAM-SHA-1" => Scram::<Sha1>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>),
        "PLAIN" => Plain::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>),
        other => {
            return Err(SaslError::with_text(SaslCondition::InvalidMechanism, other));
        }
    };

    inner
        .map(|inner| CryptoMechanism { inner })
        .map_err(|error| {
            SaslError::with_text(
                SaslCondition::Undefined,
                format!("failed to initialize {name}: {error:?}"),
            )
        })
}
