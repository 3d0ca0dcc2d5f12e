//! Client-side XMPP protocol engine.
//!
//! A [`Client`] drives one account's stream over a [`DocumentTransport`]:
//! it negotiates stream features, tracks stream-management
//! acknowledgements and reconnects according to a [`ReconnectStrategy`].
//! A [`Dispatcher`] routes stanzas between connected clients and
//! application handlers.

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod feature;
pub mod jid;
pub mod options;
pub mod reconnect;
pub mod sasl;
pub mod stanza;
pub mod stream_management;
pub mod transport;

pub use client::{Client, ClientHandle, ClientState, ConnectionEvent};
pub use dispatcher::{
    Connection, ConnectionHandler, DeliveryPolicy, Dispatcher, DispatcherOptions, HandlerId,
    IqHandler, PingResponder, StanzaHandler, ping,
};
pub use error::{
    ClientError, DispatcherError, ErrorClass, LedgerError, SaslError, StanzaError, StreamError,
    TransportError,
};
pub use feature::{FeatureKind, FeatureRegistry, StreamFeature};
pub use jid::{Jid, JidError};
pub use options::ClientOptions;
pub use reconnect::{Backoff, Reachability, ReconnectStrategy};
pub use sasl::{MechanismRegistry, SaslMechanism};
pub use stanza::{QName, StanzaKind};
pub use stream_management::{AckCallback, StreamManagementLedger};
pub use transport::{DocumentTransport, TransportEvent};
