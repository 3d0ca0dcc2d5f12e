//! Routing between connections and application handlers.
//!
//! Connections are registered under the account's bare JID. Inbound
//! stanzas are fanned out to message/presence handlers or answered by the
//! IQ handler claiming the request's payload. Outbound IQ requests are
//! correlated with their responses by `(account, id)`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::minidom::Element;

use crate::client::ConnectionEvent;
use crate::error::{ClientError, DispatcherError, StanzaError, StanzaErrorCondition};
use crate::jid::Jid;
use crate::options::ClientOptions;
use crate::stanza::{
    IqType, QName, StanzaKind, build_iq, condition_reply, error_reply, generate_id, jid_attr, ns,
    payload, result_reply,
};

/// Something that can put a document on the wire for one account.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send_document(&self, document: Element) -> Result<(), ClientError>;
}

/// Receives `<message/>` or `<presence/>` stanzas.
#[async_trait]
pub trait StanzaHandler: Send + Sync {
    async fn handle_stanza(&self, stanza: &Element) -> Result<(), StanzaError>;
}

/// Answers IQ requests for one payload qualified name.
///
/// `Ok(Some(payload))` becomes a result carrying `payload`, `Ok(None)` an
/// empty result and `Err` an error reply.
#[async_trait]
pub trait IqHandler: Send + Sync {
    async fn handle_iq_request(&self, request: &Element) -> Result<Option<Element>, StanzaError>;
}

/// Observes connections entering and leaving the dispatcher.
pub trait ConnectionHandler: Send + Sync {
    fn connected(&self, _jid: &Jid, _resumed: bool) {}

    fn disconnected(&self, _jid: &Jid) {}
}

/// Identity of a registration, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// How message and presence stanzas reach their handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Every handler sees every stanza; failures are collected.
    #[default]
    BroadcastAll,
    /// Handlers run in registration order until one succeeds.
    FirstSuccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherOptions {
    pub policy: DeliveryPolicy,
    /// Applied to inbound IQ requests routed by [`Dispatcher::dispatch_document`].
    pub request_timeout: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            policy: DeliveryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&ClientOptions> for DispatcherOptions {
    fn from(options: &ClientOptions) -> Self {
        Self {
            request_timeout: options.iq_timeout,
            ..Self::default()
        }
    }
}

type PendingKey = (Jid, String);

struct PendingIq {
    to: Option<Jid>,
    generation: u64,
    sent_at: Instant,
    completion: oneshot::Sender<Result<Element, DispatcherError>>,
}

impl PendingIq {
    /// Whether `response` answers this request sent by `account`, judged by
    /// its `from` address.
    fn accepts(&self, response: &Element, account: &Jid) -> bool {
        let from = match jid_attr(response, "from") {
            None => None,
            Some(Ok(from)) => Some(from),
            Some(Err(_)) => return false,
        };
        match (&self.to, from) {
            (Some(to), Some(from)) => *to == from,
            (Some(to), None) => to.bare() == *account,
            (None, None) => true,
            (None, Some(from)) => {
                from.bare() == *account
                    || (from.user().is_none()
                        && from.resource().is_none()
                        && from.host().eq_ignore_ascii_case(account.host()))
            }
        }
    }
}

/// Removes its pending entry when the requester stops waiting.
struct PendingGuard<'a> {
    pending: &'a DashMap<PendingKey, PendingIq>,
    key: PendingKey,
    generation: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.pending
            .remove_if(&self.key, |_, pending| pending.generation == generation);
    }
}

struct Inner {
    options: DispatcherOptions,
    connections: DashMap<Jid, Arc<dyn Connection>>,
    stanza_handlers: DashMap<StanzaKind, Vec<(HandlerId, Arc<dyn StanzaHandler>)>>,
    iq_handlers: DashMap<QName, (HandlerId, Arc<dyn IqHandler>)>,
    connection_handlers: DashMap<HandlerId, Arc<dyn ConnectionHandler>>,
    pending: DashMap<PendingKey, PendingIq>,
    next_handler: AtomicU64,
    next_generation: AtomicU64,
}

/// Shared router. Cloning is cheap and every clone sees the same tables.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_options(DispatcherOptions::default())
    }

    pub fn with_options(options: DispatcherOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                connections: DashMap::new(),
                stanza_handlers: DashMap::new(),
                iq_handlers: DashMap::new(),
                connection_handlers: DashMap::new(),
                pending: DashMap::new(),
                next_handler: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> DispatcherOptions {
        self.inner.options
    }

    fn next_handler_id(&self) -> HandlerId {
        HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register_message_handler(&self, handler: Arc<dyn StanzaHandler>) -> HandlerId {
        self.register_stanza_handler(StanzaKind::Message, handler)
    }

    pub fn register_presence_handler(&self, handler: Arc<dyn StanzaHandler>) -> HandlerId {
        self.register_stanza_handler(StanzaKind::Presence, handler)
    }

    fn register_stanza_handler(&self, kind: StanzaKind, handler: Arc<dyn StanzaHandler>) -> HandlerId {
        let id = self.next_handler_id();
        self.inner
            .stanza_handlers
            .entry(kind)
            .or_default()
            .push((id, handler));
        debug!(kind = kind.name(), ?id, "stanza handler registered");
        id
    }

    /// Claim IQ requests whose payload is `qname`. A name has at most one
    /// handler; claiming a taken name fails with `HandlerConflict`.
    pub fn set_iq_handler(
        &self,
        qname: QName,
        handler: Arc<dyn IqHandler>,
    ) -> Result<HandlerId, DispatcherError> {
        match self.inner.iq_handlers.entry(qname) {
            Entry::Occupied(entry) => {
                warn!(qname = %entry.key(), "IQ handler already registered");
                Err(DispatcherError::HandlerConflict(entry.key().clone()))
            }
            Entry::Vacant(entry) => {
                let id = self.next_handler_id();
                debug!(qname = %entry.key(), ?id, "IQ handler registered");
                entry.insert((id, handler));
                Ok(id)
            }
        }
    }

    /// Claim `qname`, displacing any current handler.
    pub fn replace_iq_handler(&self, qname: QName, handler: Arc<dyn IqHandler>) -> HandlerId {
        let id = self.next_handler_id();
        if let Some((previous, _)) = self.inner.iq_handlers.insert(qname.clone(), (id, handler)) {
            info!(%qname, ?previous, "IQ handler replaced");
        }
        id
    }

    pub fn register_connection_handler(&self, handler: Arc<dyn ConnectionHandler>) -> HandlerId {
        let id = self.next_handler_id();
        self.inner.connection_handlers.insert(id, handler);
        id
    }

    /// Remove any registration made under `id`. Returns whether one existed.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        if self.inner.connection_handlers.remove(&id).is_some() {
            return true;
        }

        let before = self.inner.iq_handlers.len();
        self.inner.iq_handlers.retain(|_, (handler_id, _)| *handler_id != id);
        if self.inner.iq_handlers.len() != before {
            return true;
        }

        let mut removed = false;
        for mut handlers in self.inner.stanza_handlers.iter_mut() {
            let count = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            removed |= handlers.len() != count;
        }
        removed
    }

    /// Make `jid`'s account a valid sender. Replaces any earlier connection
    /// for the same account.
    #[instrument(skip(self, connection), fields(jid = %jid))]
    pub fn set_connection(&self, jid: &Jid, connection: Arc<dyn Connection>, resumed: bool) {
        if self
            .inner
            .connections
            .insert(jid.bare(), connection)
            .is_some()
        {
            debug!("replaced existing connection");
        }
        info!(resumed, "connection registered");
        for handler in self.connection_handlers() {
            handler.connected(jid, resumed);
        }
    }

    /// Forget `jid`'s connection. Its pending IQ requests fail with
    /// `NotConnected`.
    #[instrument(skip(self), fields(jid = %jid))]
    pub fn remove_connection(&self, jid: &Jid) -> bool {
        let account = jid.bare();
        if self.inner.connections.remove(&account).is_none() {
            debug!("connection was not registered");
            return false;
        }

        let failed = self.fail_pending(|key| key.0 == account);
        info!(failed, "connection removed");
        for handler in self.connection_handlers() {
            handler.disconnected(jid);
        }
        true
    }

    pub fn is_connected(&self, jid: &Jid) -> bool {
        self.inner.connections.contains_key(&jid.bare())
    }

    fn connection(&self, jid: &Jid) -> Result<Arc<dyn Connection>, DispatcherError> {
        self.inner
            .connections
            .get(&jid.bare())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DispatcherError::NoSender(jid.clone()))
    }

    fn connection_handlers(&self) -> Vec<Arc<dyn ConnectionHandler>> {
        let mut handlers: Vec<_> = self
            .inner
            .connection_handlers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        handlers.sort_by_key(|(id, _)| *id);
        handlers.into_iter().map(|(_, handler)| handler).collect()
    }

    /// Send a message, presence or reply through `from`'s connection.
    pub async fn send_document(&self, from: &Jid, document: Element) -> Result<(), DispatcherError> {
        let connection = self.connection(from)?;
        connection.send_document(document).await.map_err(|error| {
            warn!(from = %from, %error, "failed to send document");
            DispatcherError::NotConnected(from.bare())
        })
    }

    /// Send an IQ get/set from `from` and wait for the matching response.
    ///
    /// An `id` is generated when the request has none. A result response
    /// resolves to the whole `<iq/>`; an error response to
    /// `DispatcherError::Stanza`.
    pub async fn send_iq_request(
        &self,
        from: &Jid,
        mut request: Element,
        timeout: Duration,
    ) -> Result<Element, DispatcherError> {
        if !IqType::of(&request).is_some_and(|iq_type| iq_type.is_request()) {
            return Err(DispatcherError::InvalidStanza(
                "IQ requests must be <iq type='get|set'/>".into(),
            ));
        }
        let account = from.bare();
        let connection = self.connection(from)?;
        let to = match request.attr("to") {
            None => None,
            Some(to) => Some(
                to.parse::<Jid>()
                    .map_err(|_| DispatcherError::NoRoute(to.to_string()))?,
            ),
        };
        let id = match request.attr("id").filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let id = generate_id();
                request.set_attr("id", id.clone());
                id
            }
        };

        let key = (account.clone(), id.clone());
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (completion, response) = oneshot::channel();
        match self.inner.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(DispatcherError::InvalidStanza(format!(
                    "IQ id '{id}' is already pending for {account}"
                )));
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingIq {
                    to,
                    generation,
                    sent_at: Instant::now(),
                    completion,
                });
            }
        }
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            key,
            generation,
        };

        debug!(%id, from = %from, ?timeout, "sending IQ request");
        if let Err(error) = connection.send_document(request).await {
            warn!(%id, %error, "failed to send IQ request");
            return Err(DispatcherError::NotConnected(account));
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatcherError::NotConnected(account)),
            Err(_) => {
                warn!(%id, ?timeout, "IQ request timed out");
                Err(DispatcherError::Timeout)
            }
        }
    }

    /// Resolve the request a result/error IQ answers. Unknown ids, repeated
    /// responses and responses from an unexpected sender are dropped.
    /// Returns whether the response was delivered.
    pub fn handle_iq_response(&self, jid: &Jid, response: &Element) -> bool {
        let Some(id) = response.attr("id") else {
            warn!(jid = %jid, "dropping IQ response without id");
            return false;
        };
        let key = (jid.bare(), id.to_string());
        let from = response.attr("from");

        let Some((_, pending)) = self
            .inner
            .pending
            .remove_if(&key, |(account, _), pending| pending.accepts(response, account))
        else {
            if self.inner.pending.contains_key(&key) {
                warn!(%id, ?from, "dropping IQ response from unexpected sender");
            } else {
                warn!(%id, ?from, "dropping unsolicited IQ response");
            }
            return false;
        };

        debug!(%id, elapsed = ?pending.sent_at.elapsed(), "IQ response received");
        let result = match IqType::of(response) {
            Some(IqType::Error) => Err(DispatcherError::Stanza(
                StanzaError::from_stanza(response)
                    .unwrap_or_else(|| StanzaError::new(StanzaErrorCondition::UndefinedCondition)),
            )),
            _ => Ok(response.clone()),
        };
        if pending.completion.send(result).is_err() {
            debug!(%id, "requester stopped waiting");
        }
        true
    }

    /// Build the reply to an inbound IQ request.
    ///
    /// Requests nobody claims get `service-unavailable`. A handler that
    /// does not answer within `timeout` yields `DispatcherError::Timeout`.
    pub async fn handle_iq_request(
        &self,
        request: &Element,
        timeout: Duration,
    ) -> Result<Element, DispatcherError> {
        if !IqType::of(request).is_some_and(|iq_type| iq_type.is_request()) {
            return Err(DispatcherError::InvalidStanza(
                "not an IQ get/set request".into(),
            ));
        }
        if request.attr("id").is_none() {
            return Err(DispatcherError::InvalidStanza("IQ request without id".into()));
        }

        let Some(payload) = payload(request) else {
            return Ok(condition_reply(request, StanzaErrorCondition::BadRequest));
        };
        let qname = QName::of(payload);
        let handler = self
            .inner
            .iq_handlers
            .get(&qname)
            .map(|entry| Arc::clone(&entry.value().1));
        let Some(handler) = handler else {
            debug!(%qname, "no IQ handler, replying service-unavailable");
            return Ok(condition_reply(request, StanzaErrorCondition::ServiceUnavailable));
        };

        match tokio::time::timeout(timeout, handler.handle_iq_request(request)).await {
            Ok(Ok(payload)) => Ok(result_reply(request, payload)),
            Ok(Err(error)) => {
                debug!(%qname, %error, "IQ handler answered with an error");
                Ok(error_reply(request, &error))
            }
            Err(_) => {
                warn!(%qname, ?timeout, "IQ handler timed out");
                Err(DispatcherError::Timeout)
            }
        }
    }

    pub async fn handle_message(&self, message: &Element) -> Result<(), DispatcherError> {
        self.deliver(StanzaKind::Message, message).await
    }

    pub async fn handle_presence(&self, presence: &Element) -> Result<(), DispatcherError> {
        self.deliver(StanzaKind::Presence, presence).await
    }

    async fn deliver(&self, kind: StanzaKind, stanza: &Element) -> Result<(), DispatcherError> {
        let handlers = self
            .inner
            .stanza_handlers
            .get(&kind)
            .map(|handlers| handlers.value().clone())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(kind = kind.name(), "no handlers registered");
            return Ok(());
        }

        let mut failures = Vec::new();
        for (id, handler) in handlers {
            match handler.handle_stanza(stanza).await {
                Ok(()) if self.inner.options.policy == DeliveryPolicy::FirstSuccess => {
                    return Ok(());
                }
                Ok(()) => {}
                Err(error) => {
                    debug!(kind = kind.name(), ?id, %error, "stanza handler failed");
                    failures.push(error.to_string());
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatcherError::HandlersFailed(failures))
        }
    }

    /// Route an inbound stanza received on `jid`'s connection. IQ requests
    /// are answered on a separate task so slow handlers do not hold up the
    /// stream.
    pub async fn dispatch_document(&self, jid: &Jid, document: Element) -> Result<(), DispatcherError> {
        match StanzaKind::of(&document) {
            Some(StanzaKind::Message) => self.handle_message(&document).await,
            Some(StanzaKind::Presence) => self.handle_presence(&document).await,
            Some(StanzaKind::Iq) => match IqType::of(&document) {
                Some(iq_type) if iq_type.is_request() => {
                    self.answer_iq_request(jid, document);
                    Ok(())
                }
                Some(_) => {
                    self.handle_iq_response(jid, &document);
                    Ok(())
                }
                None => Err(DispatcherError::InvalidStanza("IQ without a valid type".into())),
            },
            None => Err(DispatcherError::InvalidStanza(format!(
                "<{}/> is not a stanza",
                document.name()
            ))),
        }
    }

    fn answer_iq_request(&self, jid: &Jid, request: Element) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let jid = jid.clone();
        let timeout = self.inner.options.request_timeout;
        tokio::spawn(async move {
            let reply = match dispatcher.handle_iq_request(&request, timeout).await {
                Ok(reply) => reply,
                Err(DispatcherError::Timeout) => {
                    condition_reply(&request, StanzaErrorCondition::RemoteServerTimeout)
                }
                Err(error) => {
                    warn!(%error, "cannot answer IQ request");
                    return;
                }
            };
            if let Err(error) = dispatcher.send_document(&jid, reply).await {
                warn!(%error, "failed to send IQ reply");
            }
        })
    }

    /// Forward a client's events into the dispatcher in order: register
    /// `connection` once connected, route its stanzas, and remove it when
    /// it disconnects or the client goes away.
    pub fn spawn_connection_pump(
        &self,
        connection: Arc<dyn Connection>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut current: Option<Jid> = None;
            while let Some(event) = events.recv().await {
                match event {
                    ConnectionEvent::Connected { jid, resumed } => {
                        dispatcher.set_connection(&jid, Arc::clone(&connection), resumed);
                        current = Some(jid);
                    }
                    ConnectionEvent::Document(document) => {
                        let Some(jid) = &current else {
                            debug!("stanza before connection was registered");
                            continue;
                        };
                        if let Err(error) = dispatcher.dispatch_document(jid, document).await {
                            debug!(%error, "inbound stanza not handled");
                        }
                    }
                    ConnectionEvent::Disconnected { .. } => {
                        if let Some(jid) = current.take() {
                            dispatcher.remove_connection(&jid);
                        }
                    }
                    _ => {}
                }
            }
            if let Some(jid) = current {
                dispatcher.remove_connection(&jid);
            }
        })
    }

    pub fn number_of_pending_iq_responses(&self) -> usize {
        self.inner.pending.len()
    }

    /// Fail every pending request and drop all connections.
    pub fn shutdown(&self) {
        let failed = self.fail_pending(|_| true);
        self.inner.connections.clear();
        info!(failed, "dispatcher shut down");
    }

    fn fail_pending(&self, matches: impl Fn(&PendingKey) -> bool) -> usize {
        let keys: Vec<PendingKey> = self
            .inner
            .pending
            .iter()
            .filter(|entry| matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for key in keys {
            if let Some(((account, id), pending)) = self.inner.pending.remove(&key) {
                debug!(%id, %account, "failing pending IQ request");
                let _ = pending
                    .completion
                    .send(Err(DispatcherError::NotConnected(account)));
                failed += 1;
            }
        }
        failed
    }
}

/// XEP-0199 ping through `from`'s connection. Resolves to the round trip.
/// A `feature-not-implemented` or `service-unavailable` error still proves
/// the peer is alive and counts as a pong.
pub async fn ping(
    dispatcher: &Dispatcher,
    from: &Jid,
    to: Option<&Jid>,
    timeout: Duration,
) -> Result<Duration, DispatcherError> {
    let started = Instant::now();
    let request = build_iq(
        IqType::Get,
        &generate_id(),
        to,
        Some(Element::builder("ping", ns::PING).build()),
    );
    match dispatcher.send_iq_request(from, request, timeout).await {
        Ok(_) => Ok(started.elapsed()),
        Err(DispatcherError::Stanza(StanzaError {
            condition:
                StanzaErrorCondition::FeatureNotImplemented | StanzaErrorCondition::ServiceUnavailable,
            ..
        })) => Ok(started.elapsed()),
        Err(error) => Err(error),
    }
}

/// Answers `<ping xmlns='urn:xmpp:ping'/>` with an empty result.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingResponder;

impl PingResponder {
    pub fn qname() -> QName {
        QName::new(ns::PING, "ping")
    }
}

#[async_trait]
impl IqHandler for PingResponder {
    async fn handle_iq_request(&self, _request: &Element) -> Result<Option<Element>, StanzaError> {
        Ok(None)
    }
}
