use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use xmpp_parsers::minidom::Element;

use crate::client::ClientState;
use crate::jid::Jid;
use crate::stanza::{QName, ns};

/// How a failure should influence reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Worth retrying after a delay.
    Temporal,
    /// The network or the host is unreachable; retry when reachability changes.
    NetworkReachability,
    /// Retrying without user intervention cannot succeed.
    Permanent,
}

/// Defines a condition enum whose variants map to wire-exact element names
/// and stable numeric codes (the declaration order).
macro_rules! wire_conditions {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            pub fn code(&self) -> u32 {
                *self as u32
            }
        }

        impl FromStr for $name {
            type Err = UnknownCondition;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(UnknownCondition(other.to_string())),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown condition '{0}'")]
pub struct UnknownCondition(pub String);

wire_conditions! {
    /// RFC 6120 §4.9.3 stream error conditions.
    StreamErrorCondition {
        BadFormat => "bad-format",
        BadNamespacePrefix => "bad-namespace-prefix",
        Conflict => "conflict",
        ConnectionTimeout => "connection-timeout",
        HostGone => "host-gone",
        HostUnknown => "host-unknown",
        ImproperAddressing => "improper-addressing",
        InternalServerError => "internal-server-error",
        InvalidFrom => "invalid-from",
        InvalidNamespace => "invalid-namespace",
        InvalidXml => "invalid-xml",
        NotAuthorized => "not-authorized",
        NotWellFormed => "not-well-formed",
        PolicyViolation => "policy-violation",
        RemoteConnectionFailed => "remote-connection-failed",
        Reset => "reset",
        ResourceConstraint => "resource-constraint",
        RestrictedXml => "restricted-xml",
        SeeOtherHost => "see-other-host",
        SystemShutdown => "system-shutdown",
        UndefinedCondition => "undefined-condition",
        UnsupportedEncoding => "unsupported-encoding",
        UnsupportedFeature => "unsupported-feature",
        UnsupportedStanzaType => "unsupported-stanza-type",
        UnsupportedVersion => "unsupported-version",
    }
}

impl StreamErrorCondition {
    pub fn class(&self) -> ErrorClass {
        use StreamErrorCondition::*;
        match self {
            ConnectionTimeout | InternalServerError | RemoteConnectionFailed | Reset
            | ResourceConstraint | SeeOtherHost | SystemShutdown | UndefinedCondition => {
                ErrorClass::Temporal
            }
            HostGone | HostUnknown => ErrorClass::NetworkReachability,
            _ => ErrorClass::Permanent,
        }
    }
}

wire_conditions! {
    /// RFC 6120 §6.5 SASL failure conditions. `Undefined` stands in for
    /// anything the server sends that is not in the list.
    SaslCondition {
        Undefined => "undefined",
        Aborted => "aborted",
        AccountDisabled => "account-disabled",
        CredentialsExpired => "credentials-expired",
        EncryptionRequired => "encryption-required",
        IncorrectEncoding => "incorrect-encoding",
        InvalidAuthzid => "invalid-authzid",
        InvalidMechanism => "invalid-mechanism",
        MalformedRequest => "malformed-request",
        MechanismTooWeak => "mechanism-too-weak",
        NotAuthorized => "not-authorized",
        TemporaryAuthFailure => "temporary-auth-failure",
    }
}

impl SaslCondition {
    pub fn class(&self) -> ErrorClass {
        match self {
            SaslCondition::TemporaryAuthFailure | SaslCondition::Aborted => ErrorClass::Temporal,
            _ => ErrorClass::Permanent,
        }
    }
}

wire_conditions! {
    /// RFC 6120 §8.3.3 stanza error conditions.
    StanzaErrorCondition {
        BadRequest => "bad-request",
        Conflict => "conflict",
        FeatureNotImplemented => "feature-not-implemented",
        Forbidden => "forbidden",
        Gone => "gone",
        InternalServerError => "internal-server-error",
        ItemNotFound => "item-not-found",
        JidMalformed => "jid-malformed",
        NotAcceptable => "not-acceptable",
        NotAllowed => "not-allowed",
        NotAuthorized => "not-authorized",
        PolicyViolation => "policy-violation",
        RecipientUnavailable => "recipient-unavailable",
        Redirect => "redirect",
        RegistrationRequired => "registration-required",
        RemoteServerNotFound => "remote-server-not-found",
        RemoteServerTimeout => "remote-server-timeout",
        ResourceConstraint => "resource-constraint",
        ServiceUnavailable => "service-unavailable",
        SubscriptionRequired => "subscription-required",
        UndefinedCondition => "undefined-condition",
        UnexpectedRequest => "unexpected-request",
    }
}

impl StanzaErrorCondition {
    /// The error type RFC 6120 recommends for the condition.
    pub fn default_type(&self) -> StanzaErrorType {
        use StanzaErrorCondition::*;
        match self {
            BadRequest | JidMalformed | NotAcceptable | PolicyViolation | Redirect => {
                StanzaErrorType::Modify
            }
            Forbidden | NotAuthorized | RegistrationRequired | SubscriptionRequired => {
                StanzaErrorType::Auth
            }
            RecipientUnavailable | RemoteServerTimeout | ResourceConstraint
            | UnexpectedRequest => StanzaErrorType::Wait,
            _ => StanzaErrorType::Cancel,
        }
    }
}

wire_conditions! {
    StanzaErrorType {
        Auth => "auth",
        Cancel => "cancel",
        Continue => "continue",
        Modify => "modify",
        Wait => "wait",
    }
}

/// `<stream:error/>`: fatal to the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stream error <{condition}/>{}", .text.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
pub struct StreamError {
    pub condition: StreamErrorCondition,
    pub text: Option<String>,
    /// Target of a `see-other-host` redirect.
    pub see_other_host: Option<String>,
}

impl StreamError {
    pub fn new(condition: StreamErrorCondition) -> Self {
        Self {
            condition,
            text: None,
            see_other_host: None,
        }
    }

    pub fn with_text(condition: StreamErrorCondition, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(condition)
        }
    }

    /// Parse a `<stream:error/>` document. Unknown conditions read as
    /// `undefined-condition`.
    pub fn from_element(element: &Element) -> Option<Self> {
        if !element.is("error", ns::STREAM) {
            return None;
        }

        let mut error = StreamError::new(StreamErrorCondition::UndefinedCondition);
        for child in element.children().filter(|c| c.ns() == ns::STREAMS) {
            if child.name() == "text" {
                error.text = Some(child.text());
            } else if let Ok(condition) = child.name().parse() {
                error.condition = condition;
                if condition == StreamErrorCondition::SeeOtherHost {
                    error.see_other_host = Some(child.text().trim().to_string());
                }
            }
        }
        Some(error)
    }

    pub fn class(&self) -> ErrorClass {
        self.condition.class()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("SASL failure <{condition}/>{}", .text.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
pub struct SaslError {
    pub condition: SaslCondition,
    pub text: Option<String>,
}

impl SaslError {
    pub fn new(condition: SaslCondition) -> Self {
        Self {
            condition,
            text: None,
        }
    }

    pub fn with_text(condition: SaslCondition, text: impl Into<String>) -> Self {
        Self {
            condition,
            text: Some(text.into()),
        }
    }

    /// Parse a SASL `<failure/>`.
    pub fn from_failure(element: &Element) -> Self {
        let mut error = SaslError::new(SaslCondition::Undefined);
        for child in element.children() {
            if child.name() == "text" {
                error.text = Some(child.text());
            } else if let Ok(condition) = child.name().parse() {
                error.condition = condition;
            }
        }
        error
    }

    pub fn class(&self) -> ErrorClass {
        self.condition.class()
    }
}

/// An `<error/>` carried by a stanza.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stanza error <{condition}/> ({error_type}){}", .text.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
pub struct StanzaError {
    pub condition: StanzaErrorCondition,
    pub error_type: StanzaErrorType,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(condition: StanzaErrorCondition) -> Self {
        Self {
            condition,
            error_type: condition.default_type(),
            text: None,
        }
    }

    pub fn with_text(condition: StanzaErrorCondition, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(condition)
        }
    }

    /// Parse the `<error/>` child of a stanza.
    pub fn from_stanza(stanza: &Element) -> Option<Self> {
        let error = stanza.children().find(|c| c.name() == "error")?;
        Some(Self::from_element(error))
    }

    pub fn from_element(error: &Element) -> Self {
        let mut condition = StanzaErrorCondition::UndefinedCondition;
        let mut text = None;
        for child in error.children().filter(|c| c.ns() == ns::STANZAS) {
            if child.name() == "text" {
                text = Some(child.text());
            } else if let Ok(parsed) = child.name().parse() {
                condition = parsed;
            }
        }
        let error_type = error
            .attr("type")
            .and_then(|t| t.parse().ok())
            .unwrap_or_else(|| condition.default_type());

        Self {
            condition,
            error_type,
            text,
        }
    }

    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("error", ns::JABBER_CLIENT)
            .attr("type", self.error_type.as_str())
            .append(Element::builder(self.condition.as_str(), ns::STANZAS).build());
        if let Some(text) = &self.text {
            builder = builder.append(
                Element::builder("text", ns::STANZAS)
                    .append(text.clone())
                    .build(),
            );
        }
        builder.build()
    }

    pub fn class(&self) -> ErrorClass {
        match self.error_type {
            StanzaErrorType::Wait => ErrorClass::Temporal,
            _ => ErrorClass::Permanent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection timed out")]
    Timeout,

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("transport I/O error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Unreachable(_) => ErrorClass::NetworkReachability,
            TransportError::Tls(_) => ErrorClass::Permanent,
            _ => ErrorClass::Temporal,
        }
    }
}

/// Violations of the stream-management acknowledgement invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("acknowledgement regressed from {acknowledged} to {received}")]
    AckRegression { acknowledged: u32, received: u32 },

    #[error("acknowledgement {received} exceeds the {sent} stanza(s) sent")]
    AckTooHigh { sent: u32, received: u32 },

    #[error("stream-management sequence numbers exhausted")]
    SequenceExhausted,
}

impl From<LedgerError> for StreamError {
    fn from(error: LedgerError) -> Self {
        StreamError::with_text(StreamErrorCondition::UndefinedCondition, error.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("operation '{operation}' is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ClientState,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Sasl(#[from] SaslError),

    #[error(transparent)]
    Stanza(#[from] StanzaError),

    #[error("no offered SASL mechanism is available; server offers: {}", .offered.join(", "))]
    NoMechanism { offered: Vec<String> },

    #[error("feature {feature} rejected by server")]
    FeatureRejected { feature: &'static str },

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("document was not delivered")]
    NotDelivered,

    #[error("timed out waiting for acknowledgement")]
    AckTimeout,

    #[error("client is not connected")]
    NotConnected,

    #[error("client task has stopped")]
    ClientGone,
}

impl From<LedgerError> for ClientError {
    fn from(error: LedgerError) -> Self {
        ClientError::Stream(error.into())
    }
}

impl ClientError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Transport(e) => e.class(),
            ClientError::Stream(e) => e.class(),
            ClientError::Sasl(e) => e.class(),
            ClientError::Stanza(e) => e.class(),
            ClientError::NotDelivered
            | ClientError::AckTimeout
            | ClientError::NotConnected
            | ClientError::FeatureRejected { .. } => ErrorClass::Temporal,
            ClientError::InvalidState { .. }
            | ClientError::NoMechanism { .. }
            | ClientError::MalformedDocument(_)
            | ClientError::ClientGone => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Error)]
pub enum DispatcherError {
    #[error("IQ request timed out")]
    Timeout,

    #[error("no connection registered for sender {0}")]
    NoSender(Jid),

    #[error("no route to recipient '{0}'")]
    NoRoute(String),

    #[error("connection {0} is not connected")]
    NotConnected(Jid),

    #[error("invalid stanza: {0}")]
    InvalidStanza(String),

    #[error("an IQ handler is already registered for {0}")]
    HandlerConflict(QName),

    #[error("{} handler(s) failed: {}", .0.len(), .0.join("; "))]
    HandlersFailed(Vec<String>),

    #[error(transparent)]
    Stanza(#[from] StanzaError),
}

impl DispatcherError {
    pub fn code(&self) -> u32 {
        match self {
            DispatcherError::Timeout => 0,
            DispatcherError::NoSender(_) => 1,
            DispatcherError::NoRoute(_) => 2,
            DispatcherError::NotConnected(_) => 3,
            DispatcherError::InvalidStanza(_) => 4,
            DispatcherError::HandlerConflict(_) => 5,
            DispatcherError::HandlersFailed(_) => 6,
            DispatcherError::Stanza(_) => 7,
        }
    }
}
