use xmpp_parsers::minidom::Element;

use crate::error::TransportError;
use crate::options::ClientOptions;

/// What the transport delivers from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One top-level child of the stream: `<stream:features/>`, a stanza,
    /// a nonza or `<stream:error/>`.
    Document(Element),
    /// The peer closed the stream.
    Closed,
}

/// A transport that frames XML documents.
///
/// Implementations own sockets, TLS and XML tokenizing; the engine only
/// sees parsed elements. Concrete transports live outside this crate.
pub trait DocumentTransport: Send + 'static {
    /// Open the stream to `hostname`. Resolves to the stream id.
    fn open(
        &mut self,
        hostname: &str,
        options: &ClientOptions,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Restart the XML stream on the open connection, e.g. after SASL.
    /// Resolves to the new stream id.
    fn reopen(&mut self) -> impl Future<Output = Result<String, TransportError>> + Send;

    fn send(
        &mut self,
        document: Element,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next event from the peer.
    ///
    /// Must be cancel-safe: the client races it against commands and timers
    /// and drops the future when another branch wins.
    fn next_event(&mut self) -> impl Future<Output = Result<TransportEvent, TransportError>> + Send;

    /// Close the stream gracefully.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Drop the connection without closing the stream, so the session can
    /// be resumed later.
    fn suspend(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
