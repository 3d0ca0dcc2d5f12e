use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skua_core::event::{Channel, Event, EventBus, EventPayload, EventSource, channels};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;
use xmpp_parsers::minidom::Element;

use crate::dispatcher::Connection;
use crate::error::{ClientError, StreamError, StreamErrorCondition, TransportError};
use crate::feature::{
    Discovery, FeatureAction, FeatureKind, FeatureRegistry, Handled, NegotiationContext,
    StreamFeature,
};
use crate::jid::Jid;
use crate::options::ClientOptions;
use crate::reconnect::{Backoff, ReconnectStrategy};
use crate::sasl::MechanismRegistry;
use crate::stanza::{StanzaKind, is_stream_element, ns, serialize_document};
use crate::stream_management::{AckCallback, StreamManagementLedger};
use crate::transport::{DocumentTransport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Established,
    Negotiating,
    Connected,
    Disconnecting,
}

impl ClientState {
    /// A transport is open or being opened.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Established | Self::Negotiating | Self::Connected
        )
    }
}

/// What the client reports to its owner.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        from: ClientState,
        to: ClientState,
    },
    Connected {
        jid: Jid,
        resumed: bool,
    },
    /// The connection ended. `error` is set when it failed.
    Disconnected {
        error: Option<ClientError>,
    },
    /// An inbound stanza after negotiation.
    Document(Element),
    FeatureNegotiated(FeatureKind),
    FeatureFailed {
        feature: FeatureKind,
        error: ClientError,
    },
    UnsupportedDocument(Element),
    RegistrationChallenge(Element),
    Registered {
        username: String,
    },
}

struct AckWaiter {
    target: u32,
    deadline: Instant,
    reply: oneshot::Sender<Result<(), ClientError>>,
}

/// How negotiation continues after a feature's actions were applied.
enum Flow {
    /// The active feature finished; start the next one.
    Next,
    /// Waiting for the server.
    Wait,
    /// Negotiation ended, was restarted or failed.
    Stop,
}

/// One logical connection: transport lifecycle, feature negotiation,
/// stream management and reconnection.
///
/// A `Client` is driven by one owner. Either call its async methods
/// directly and feed it transport events, or move it onto a task with
/// [`Client::spawn`].
pub struct Client<T: DocumentTransport> {
    account: Jid,
    transport: T,
    options: ClientOptions,
    mechanisms: MechanismRegistry,
    features: FeatureRegistry,
    ledger: StreamManagementLedger,
    strategy: ReconnectStrategy,
    state: ClientState,
    state_tx: watch::Sender<ClientState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    event_bus: Option<Arc<dyn EventBus>>,
    correlation_id: Uuid,
    failures: u32,
    last_error: Option<ClientError>,
    stream_id: Option<String>,
    authenticated: bool,
    registered: bool,
    resumed: bool,
    bound_jid: Option<Jid>,
    negotiated: HashSet<FeatureKind>,
    pending: VecDeque<StreamFeature>,
    active: Option<StreamFeature>,
    ack_waiters: Vec<AckWaiter>,
}

impl<T: DocumentTransport> Client<T> {
    pub fn new(
        account: Jid,
        transport: T,
        options: ClientOptions,
        mechanisms: MechanismRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ClientState::Disconnected);
        let strategy = ReconnectStrategy::from_kind(
            options.reconnect_strategy,
            Backoff::new(options.reconnect_min_interval, options.reconnect_max_interval),
            options.server.as_deref().unwrap_or(account.host()),
        );

        let client = Self {
            account,
            transport,
            options,
            mechanisms,
            features: FeatureRegistry::default(),
            ledger: StreamManagementLedger::new(),
            strategy,
            state: ClientState::Disconnected,
            state_tx,
            events,
            event_bus: None,
            correlation_id: Uuid::new_v4(),
            failures: 0,
            last_error: None,
            stream_id: None,
            authenticated: false,
            registered: false,
            resumed: false,
            bound_jid: None,
            negotiated: HashSet::new(),
            pending: VecDeque::new(),
            active: None,
            ack_waiters: Vec::new(),
        };
        (client, receiver)
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_reconnect_strategy(mut self, strategy: ReconnectStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_feature_registry(mut self, features: FeatureRegistry) -> Self {
        self.features = features;
        self
    }

    pub fn account(&self) -> &Jid {
        &self.account
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    /// The full JID assigned at bind time.
    pub fn bound_jid(&self) -> Option<&Jid> {
        self.bound_jid.as_ref()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn ledger(&self) -> &StreamManagementLedger {
        &self.ledger
    }

    pub fn reconnect_strategy(&self) -> &ReconnectStrategy {
        &self.strategy
    }

    pub fn last_error(&self) -> Option<&ClientError> {
        self.last_error.as_ref()
    }

    pub fn negotiated(&self) -> &HashSet<FeatureKind> {
        &self.negotiated
    }

    /// A registration form is waiting for [`Client::submit_registration`].
    pub fn awaits_registration(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(StreamFeature::awaits_registration)
    }

    /// Open the transport. Negotiation proceeds as transport events arrive.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        match self.state {
            ClientState::Disconnected => {}
            ClientState::Disconnecting => {
                return Err(ClientError::InvalidState {
                    operation: "connect",
                    state: self.state,
                });
            }
            _ => return Ok(()),
        }

        self.strategy.start();
        self.failures = 0;
        self.open().await
    }

    /// Connect and process transport events until the connection is up,
    /// has failed, or waits for a registration form.
    pub async fn connect_and_negotiate(&mut self) -> Result<(), ClientError> {
        self.connect().await?;
        self.drive().await
    }

    /// Process transport events until the client is connected,
    /// disconnected, or waits for a registration form.
    pub async fn drive(&mut self) -> Result<(), ClientError> {
        loop {
            match self.state {
                ClientState::Connected => return Ok(()),
                ClientState::Disconnected | ClientState::Disconnecting => {
                    return Err(self.last_error.clone().unwrap_or(ClientError::NotConnected));
                }
                _ if self.awaits_registration() => return Ok(()),
                _ => {}
            }
            self.process_next_event().await;
        }
    }

    /// Wait for one transport event and handle it.
    pub async fn process_next_event(&mut self) {
        let event = self.transport.next_event().await;
        self.handle_event(event).await;
    }

    /// Graceful close. Unacknowledged documents are reported as not
    /// delivered and automatic reconnection stops.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.strategy.stop();
        if self.state == ClientState::Disconnected {
            self.discard_ledger();
            return Ok(());
        }

        self.set_state(ClientState::Disconnecting);
        self.abandon_negotiation();
        self.discard_ledger();
        if let Err(error) = self.transport.close().await {
            debug!(%error, "error while closing stream");
        }
        self.finish_disconnect("user requested disconnect");
        Ok(())
    }

    /// Drop the connection but keep the stream-management session so the
    /// next `connect()` can resume it.
    pub async fn suspend(&mut self) -> Result<(), ClientError> {
        self.strategy.stop();
        if self.state == ClientState::Disconnected {
            return Ok(());
        }

        self.set_state(ClientState::Disconnecting);
        self.abandon_negotiation();
        if let Err(error) = self.transport.suspend().await {
            debug!(%error, "error while suspending transport");
        }
        if !self.ledger.is_resumable() {
            self.discard_ledger();
        }
        self.finish_disconnect("suspended");
        Ok(())
    }

    /// Send a document after negotiation. With stream management the
    /// callback fires once the peer acknowledged it; otherwise once the
    /// transport accepted it.
    pub async fn send(
        &mut self,
        document: Element,
        callback: Option<AckCallback>,
    ) -> Result<(), ClientError> {
        if self.state != ClientState::Connected {
            let error = ClientError::InvalidState {
                operation: "send",
                state: self.state,
            };
            if let Some(callback) = callback {
                callback(Err(ClientError::NotConnected));
            }
            return Err(error);
        }

        let tracked = self.ledger.is_enabled() && StanzaKind::of(&document).is_some();
        if tracked {
            let seq = match self.ledger.record_sent(document.clone(), callback) {
                Ok(seq) => seq,
                Err(error) => {
                    let error = ClientError::from(error);
                    self.fail(error.clone()).await;
                    return Err(error);
                }
            };
            debug!(seq, "sending tracked stanza");
            if let Err(error) = self.transport.send(document).await {
                let error = ClientError::from(error);
                self.fail(error.clone()).await;
                return Err(error);
            }
            return Ok(());
        }

        match self.transport.send(document).await {
            Ok(()) => {
                if let Some(callback) = callback {
                    callback(Ok(()));
                }
                Ok(())
            }
            Err(error) => {
                if let Some(callback) = callback {
                    callback(Err(ClientError::NotDelivered));
                }
                let error = ClientError::from(error);
                self.fail(error.clone()).await;
                Err(error)
            }
        }
    }

    /// Ask the peer for an acknowledgement and wait until everything sent
    /// so far is acknowledged, or the configured ack timeout elapses.
    pub async fn exchange_acknowledgement(&mut self) -> Result<(), ClientError> {
        self.exchange_acknowledgement_within(self.options.ack_timeout)
            .await
    }

    pub async fn exchange_acknowledgement_within(
        &mut self,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let (reply, mut done) = oneshot::channel();
        self.request_acknowledgement(timeout, reply).await;

        loop {
            match done.try_recv() {
                Ok(result) => return result,
                Err(oneshot::error::TryRecvError::Closed) => return Err(ClientError::NotConnected),
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
            let Some(deadline) = self.next_ack_deadline() else {
                return Err(ClientError::NotConnected);
            };
            match tokio::time::timeout_at(deadline, self.transport.next_event()).await {
                Ok(event) => self.handle_event(event).await,
                Err(_) => self.expire_ack_waiters(Instant::now()),
            }
        }
    }

    /// Send `<r/>` and resolve `reply` when the acknowledgement arrives.
    pub async fn request_acknowledgement(
        &mut self,
        timeout: Duration,
        reply: oneshot::Sender<Result<(), ClientError>>,
    ) {
        if self.state != ClientState::Connected {
            let _ = reply.send(Err(ClientError::InvalidState {
                operation: "exchange_acknowledgement",
                state: self.state,
            }));
            return;
        }
        let target = self.ledger.sent_count();
        if !self.ledger.is_enabled() || self.ledger.acknowledged_count() >= target {
            let _ = reply.send(Ok(()));
            return;
        }

        if let Err(error) = self.transport.send(self.ledger.request_ack()).await {
            let error = ClientError::from(error);
            let _ = reply.send(Err(error.clone()));
            self.fail(error).await;
            return;
        }
        debug!(target, "acknowledgement requested");
        self.ack_waiters.push(AckWaiter {
            target,
            deadline: Instant::now() + timeout,
            reply,
        });
    }

    /// Answer the registration form published with
    /// [`ConnectionEvent::RegistrationChallenge`].
    pub async fn submit_registration(&mut self, form: Element) -> Result<(), ClientError> {
        let Some(mut feature) = self.active.take() else {
            return Err(ClientError::InvalidState {
                operation: "submit_registration",
                state: self.state,
            });
        };
        let result = feature.submit_registration(form);
        self.active = Some(feature);

        match result {
            Ok(actions) => {
                if let Flow::Next = self.apply(actions).await {
                    self.advance().await;
                }
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Reachability signal for the network-reachability strategy.
    pub fn set_reachability(&mut self, reachable: bool) {
        self.strategy.reachability_changed(reachable, Instant::now());
    }

    /// When the reconnect strategy wants the next attempt.
    pub fn next_reconnect_at(&self) -> Option<Instant> {
        if self.state == ClientState::Disconnected {
            self.strategy.next_connection_attempt()
        } else {
            None
        }
    }

    /// Make the attempt the reconnect strategy scheduled.
    pub async fn reconnect(&mut self) {
        if self.state != ClientState::Disconnected {
            return;
        }
        self.strategy.attempt_started();
        info!(attempt = self.failures, account = %self.account, "reconnecting");
        self.publish(
            channels::CONNECTION_RECONNECTING,
            EventPayload::ConnectionReconnecting {
                attempt: self.failures,
            },
        );
        let _ = self.open().await;
    }

    pub async fn handle_event(&mut self, event: Result<TransportEvent, TransportError>) {
        match event {
            Ok(TransportEvent::Document(document)) => self.handle_document(document).await,
            Ok(TransportEvent::Closed) => {
                if self.state.is_live() {
                    self.fail(TransportError::Closed.into()).await;
                }
            }
            Err(error) => {
                if self.state.is_live() {
                    self.fail(error.into()).await;
                }
            }
        }
    }

    pub async fn handle_document(&mut self, document: Element) {
        if !self.state.is_live() {
            debug!(name = document.name(), state = ?self.state, "discarding stale document");
            return;
        }
        if let Some(error) = StreamError::from_element(&document) {
            self.fail(error.into()).await;
            return;
        }

        match self.state {
            ClientState::Established if is_stream_element(&document, "features") => {
                self.start_negotiation(&document).await;
            }
            ClientState::Negotiating => self.negotiate(document).await,
            ClientState::Connected => self.handle_connected(document).await,
            _ => self.unsupported(document),
        }
    }

    /// Move the client onto its own task.
    pub fn spawn(self) -> (ClientHandle, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(64);
        let handle = ClientHandle {
            commands,
            state: self.subscribe_state(),
        };
        let task = tokio::spawn(self.run(receiver));
        (handle, task)
    }

    async fn open(&mut self) -> Result<(), ClientError> {
        self.correlation_id = Uuid::new_v4();
        self.abandon_negotiation();
        self.negotiated.clear();
        self.authenticated = false;
        self.resumed = false;
        self.stream_id = None;
        self.last_error = None;
        self.set_state(ClientState::Connecting);

        let hostname = self.account.host().to_string();
        info!(%hostname, "opening stream");
        match self.transport.open(&hostname, &self.options).await {
            Ok(stream_id) => {
                debug!(%stream_id, "stream opened");
                self.stream_id = Some(stream_id);
                self.set_state(ClientState::Established);
                Ok(())
            }
            Err(error) => {
                let error = ClientError::from(error);
                self.fail(error.clone()).await;
                Err(error)
            }
        }
    }

    async fn start_negotiation(&mut self, features: &Element) {
        self.set_state(ClientState::Negotiating);
        let discovery = self.features.discover(features);
        if let Some(unknown) = discovery.unknown_required.first() {
            warn!(feature = %unknown, "server requires an unsupported feature");
            let error = StreamError::with_text(StreamErrorCondition::UnsupportedFeature, unknown.to_string());
            self.fail(error.into()).await;
            return;
        }

        self.pending = self.plan(&discovery);
        debug!(
            features = ?self.pending.iter().map(StreamFeature::kind).collect::<Vec<_>>(),
            "negotiation planned"
        );
        self.advance().await;
    }

    /// Registration, then SASL. Once authenticated: resumption, Bind,
    /// Session, then enabling stream management.
    fn plan(&self, discovery: &Discovery) -> VecDeque<StreamFeature> {
        let mut plan = VecDeque::new();
        let mut push = |kind: FeatureKind| {
            if let Some(advertised) = discovery.get(kind) {
                plan.push_back(StreamFeature::from_advertisement(advertised));
            }
        };

        if !self.authenticated {
            if self.options.needs_registration && !self.registered {
                if discovery.get(FeatureKind::InBandRegistration).is_none() {
                    warn!("registration requested but the server does not offer it");
                }
                push(FeatureKind::InBandRegistration);
            }
            if discovery.get(FeatureKind::Sasl).is_some() {
                push(FeatureKind::Sasl);
                return plan;
            }
        }

        let stream_management = self.options.stream_management
            && discovery.get(FeatureKind::StreamManagement).is_some();
        if stream_management && self.ledger.is_resumable() {
            push(FeatureKind::StreamManagement);
        }
        push(FeatureKind::Bind);
        push(FeatureKind::Session);
        if stream_management {
            push(FeatureKind::StreamManagement);
        }
        plan
    }

    /// Begin pending features until one waits for the server.
    async fn advance(&mut self) {
        while self.state == ClientState::Negotiating {
            let Some(mut feature) = self.pending.pop_front() else {
                self.finish_negotiation();
                return;
            };
            let kind = feature.kind();
            if self.negotiated.contains(&kind) {
                continue;
            }

            info!(feature = %kind, "negotiating feature");
            let result = {
                let mut ctx = NegotiationContext {
                    hostname: self.account.host(),
                    options: &self.options,
                    mechanisms: &self.mechanisms,
                    ledger: &mut self.ledger,
                };
                feature.begin(&mut ctx)
            };
            self.active = Some(feature);

            let flow = match result {
                Ok(actions) => self.apply(actions).await,
                Err(error) => self.feature_failed(error).await,
            };
            match flow {
                Flow::Next => continue,
                Flow::Wait | Flow::Stop => return,
            }
        }
    }

    async fn negotiate(&mut self, document: Element) {
        let Some(mut feature) = self.active.take() else {
            self.unsupported(document);
            return;
        };
        let result = {
            let mut ctx = NegotiationContext {
                hostname: self.account.host(),
                options: &self.options,
                mechanisms: &self.mechanisms,
                ledger: &mut self.ledger,
            };
            feature.handle_document(&document, &mut ctx)
        };
        self.active = Some(feature);

        let flow = match result {
            Ok(Handled::Ignored) => {
                self.unsupported(document);
                Flow::Wait
            }
            Ok(Handled::Consumed(actions)) => self.apply(actions).await,
            Err(error) => self.feature_failed(error).await,
        };
        if let Flow::Next = flow {
            self.advance().await;
        }
    }

    async fn apply(&mut self, actions: Vec<FeatureAction>) -> Flow {
        for action in actions {
            match action {
                FeatureAction::Send(document) => {
                    if let Err(error) = self.transport.send(document).await {
                        self.fail(error.into()).await;
                        return Flow::Stop;
                    }
                }
                FeatureAction::Bound(jid) => self.bound_jid = Some(jid),
                FeatureAction::Resumed => self.resumed = true,
                FeatureAction::ResumeFailed => {
                    self.active = None;
                    return Flow::Next;
                }
                FeatureAction::RegistrationChallenge(form) => {
                    self.publish(
                        channels::REGISTRATION_CHALLENGE,
                        EventPayload::RegistrationChallenge {
                            form: to_xml(&form),
                        },
                    );
                    self.emit(ConnectionEvent::RegistrationChallenge(form));
                }
                FeatureAction::Registered { username } => {
                    self.registered = true;
                    self.publish(
                        channels::REGISTRATION_COMPLETED,
                        EventPayload::RegistrationCompleted {
                            username: username.clone(),
                            hostname: self.account.host().to_string(),
                        },
                    );
                    self.emit(ConnectionEvent::Registered { username });
                }
                FeatureAction::Complete => return self.complete_active().await,
            }
        }
        Flow::Wait
    }

    async fn complete_active(&mut self) -> Flow {
        let Some(feature) = self.active.take() else {
            return Flow::Next;
        };
        let kind = feature.kind();
        self.negotiated.insert(kind);
        info!(feature = %kind, "feature negotiated");
        self.publish(
            channels::FEATURE_NEGOTIATED,
            EventPayload::FeatureNegotiated {
                feature: kind.name().to_string(),
            },
        );
        self.emit(ConnectionEvent::FeatureNegotiated(kind));

        if feature.needs_restart() {
            if kind == FeatureKind::Sasl {
                self.authenticated = true;
            }
            self.restart_stream().await;
            return Flow::Stop;
        }
        if self.resumed {
            self.pending.clear();
            self.finish_negotiation();
            return Flow::Stop;
        }
        Flow::Next
    }

    async fn restart_stream(&mut self) {
        self.pending.clear();
        debug!("restarting stream");
        match self.transport.reopen().await {
            Ok(stream_id) => {
                self.stream_id = Some(stream_id);
                self.set_state(ClientState::Established);
            }
            Err(error) => self.fail(error.into()).await,
        }
    }

    /// Mandatory failures and stream errors end the attempt; optional
    /// features are skipped.
    async fn feature_failed(&mut self, error: ClientError) -> Flow {
        let feature = self.active.take();
        let kind = feature.as_ref().map(StreamFeature::kind);
        let mandatory = feature.as_ref().is_none_or(StreamFeature::is_mandatory);

        if let Some(kind) = kind {
            self.publish(
                channels::FEATURE_FAILED,
                EventPayload::FeatureFailed {
                    feature: kind.name().to_string(),
                    reason: error.to_string(),
                },
            );
            self.emit(ConnectionEvent::FeatureFailed {
                feature: kind,
                error: error.clone(),
            });
        }

        if mandatory || matches!(error, ClientError::Stream(_)) {
            warn!(feature = ?kind, %error, "negotiation failed");
            self.fail(error).await;
            Flow::Stop
        } else {
            warn!(feature = ?kind, %error, "optional feature failed, continuing");
            Flow::Next
        }
    }

    fn finish_negotiation(&mut self) {
        let jid = self
            .bound_jid
            .clone()
            .unwrap_or_else(|| self.account.clone());
        self.failures = 0;
        self.strategy.on_connected();
        self.set_state(ClientState::Connected);
        info!(%jid, resumed = self.resumed, "connected");
        self.publish(
            channels::CONNECTION_ESTABLISHED,
            EventPayload::ConnectionEstablished {
                jid: jid.to_string(),
                resumed: self.resumed,
            },
        );
        self.emit(ConnectionEvent::Connected {
            jid,
            resumed: self.resumed,
        });
    }

    async fn handle_connected(&mut self, document: Element) {
        if document.is("r", ns::SM) && self.ledger.is_enabled() {
            let ack = self.ledger.ack();
            if let Err(error) = self.transport.send(ack).await {
                self.fail(error.into()).await;
            }
            return;
        }

        if document.is("a", ns::SM) && self.ledger.is_enabled() {
            let h = document.attr("h").and_then(|h| h.parse::<u32>().ok());
            let Some(h) = h else {
                self.fail(ClientError::MalformedDocument("<a/> without valid h".into()))
                    .await;
                return;
            };
            match self.ledger.on_ack(h) {
                Ok(_) => self.resolve_ack_waiters(),
                Err(error) => self.fail(error.into()).await,
            }
            return;
        }

        if StanzaKind::of(&document).is_some() {
            if self.ledger.is_enabled() {
                self.ledger.record_received();
            }
            self.emit(ConnectionEvent::Document(document));
            return;
        }

        self.unsupported(document);
    }

    fn unsupported(&self, document: Element) {
        debug!(name = document.name(), namespace = %document.ns(), "unsupported document");
        self.publish(
            channels::DOCUMENT_UNSUPPORTED,
            EventPayload::UnsupportedDocument {
                name: document.name().to_string(),
                namespace: document.ns(),
            },
        );
        self.emit(ConnectionEvent::UnsupportedDocument(document));
    }

    /// The single failure path: tear down, classify, schedule.
    async fn fail(&mut self, error: ClientError) {
        if !self.state.is_live() {
            debug!(%error, "ignoring failure after teardown");
            return;
        }

        warn!(%error, state = ?self.state, "connection failed");
        self.set_state(ClientState::Disconnecting);
        self.abandon_negotiation();

        let teardown = if self.ledger.is_resumable() {
            self.transport.suspend().await
        } else {
            self.discard_ledger();
            self.transport.close().await
        };
        if let Err(close_error) = teardown {
            debug!(%close_error, "error while tearing down transport");
        }

        self.failures = self.failures.saturating_add(1);
        let next = self
            .strategy
            .on_failure(error.class(), self.failures, Instant::now());
        let will_retry = next.is_some() || self.strategy.is_active();

        self.publish(
            channels::ERROR_OCCURRED,
            EventPayload::ErrorOccurred {
                component: "xmpp.client".to_string(),
                message: error.to_string(),
                recoverable: error.is_retryable(),
            },
        );
        self.last_error = Some(error.clone());
        self.set_state(ClientState::Disconnected);
        self.publish(
            channels::CONNECTION_LOST,
            EventPayload::ConnectionLost {
                reason: error.to_string(),
                will_retry,
            },
        );
        self.emit(ConnectionEvent::Disconnected { error: Some(error) });
    }

    fn finish_disconnect(&mut self, reason: &str) {
        self.set_state(ClientState::Disconnected);
        info!(reason, "disconnected");
        self.publish(
            channels::CONNECTION_LOST,
            EventPayload::ConnectionLost {
                reason: reason.to_string(),
                will_retry: false,
            },
        );
        self.emit(ConnectionEvent::Disconnected { error: None });
    }

    /// Drop any in-flight negotiation so late answers are not applied.
    fn abandon_negotiation(&mut self) {
        self.pending.clear();
        self.active = None;
        for waiter in self.ack_waiters.drain(..) {
            let _ = waiter.reply.send(Err(ClientError::NotConnected));
        }
    }

    fn discard_ledger(&mut self) {
        self.ledger.cancel_unacknowledged();
        self.ledger.reset();
        self.bound_jid = None;
    }

    fn resolve_ack_waiters(&mut self) {
        let acknowledged = self.ledger.acknowledged_count();
        let (done, waiting): (Vec<_>, Vec<_>) = self
            .ack_waiters
            .drain(..)
            .partition(|waiter| waiter.target <= acknowledged);
        self.ack_waiters = waiting;
        for waiter in done {
            let _ = waiter.reply.send(Ok(()));
        }
    }

    fn expire_ack_waiters(&mut self, now: Instant) {
        let (expired, waiting): (Vec<_>, Vec<_>) = self
            .ack_waiters
            .drain(..)
            .partition(|waiter| waiter.deadline <= now);
        self.ack_waiters = waiting;
        for waiter in expired {
            warn!(target = waiter.target, "acknowledgement timed out");
            let _ = waiter.reply.send(Err(ClientError::AckTimeout));
        }
    }

    fn next_ack_deadline(&self) -> Option<Instant> {
        self.ack_waiters.iter().map(|waiter| waiter.deadline).min()
    }

    fn set_state(&mut self, state: ClientState) {
        let from = self.state;
        if from == state {
            return;
        }
        self.state = state;
        self.state_tx.send_replace(state);
        debug!(?from, to = ?state, "client state changed");
        self.publish(
            channels::CLIENT_STATE,
            EventPayload::ClientStateChanged {
                from: format!("{from:?}"),
                to: format!("{state:?}"),
            },
        );
        self.emit(ConnectionEvent::StateChanged { from, to: state });
    }

    fn emit(&self, event: ConnectionEvent) {
        // The owner may have stopped listening.
        let _ = self.events.send(event);
    }

    fn publish(&self, channel: &str, payload: EventPayload) {
        let Some(event_bus) = &self.event_bus else {
            return;
        };
        let Ok(channel) = Channel::new(channel) else {
            return;
        };

        let source = EventSource::Xmpp(self.account.bare().to_string());
        let event = Event::with_correlation(channel, source, payload, self.correlation_id);
        if let Err(error) = event_bus.publish(event) {
            debug!(%error, "failed to publish client event");
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let reconnect_at = self.next_reconnect_at();
            let ack_deadline = self.next_ack_deadline();
            let reading = self.state.is_live();

            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => Step::Shutdown(Some(reply)),
                    Some(command) => Step::Command(command),
                    None => Step::Shutdown(None),
                },
                event = self.transport.next_event(), if reading => Step::Transport(event),
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => Step::Reconnect,
                _ = sleep_until(ack_deadline.unwrap_or_else(Instant::now)), if ack_deadline.is_some() => Step::AckDeadline,
            };

            match step {
                Step::Command(command) => self.execute(command).await,
                Step::Transport(event) => self.handle_event(event).await,
                Step::Reconnect => self.reconnect().await,
                Step::AckDeadline => self.expire_ack_waiters(Instant::now()),
                Step::Shutdown(reply) => {
                    let _ = self.disconnect().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                    debug!(account = %self.account, "client task stopped");
                    return;
                }
            }
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(self.connect().await);
            }
            Command::Disconnect(reply) => {
                let _ = reply.send(self.disconnect().await);
            }
            Command::Suspend(reply) => {
                let _ = reply.send(self.suspend().await);
            }
            Command::Send {
                document,
                callback,
                reply,
            } => {
                let _ = reply.send(self.send(document, callback).await);
            }
            Command::ExchangeAcknowledgement { timeout, reply } => {
                let timeout = timeout.unwrap_or(self.options.ack_timeout);
                self.request_acknowledgement(timeout, reply).await;
            }
            Command::SubmitRegistration { form, reply } => {
                let _ = reply.send(self.submit_registration(form).await);
            }
            Command::SetReachability(reachable) => self.set_reachability(reachable),
            // Intercepted by `run`.
            Command::Shutdown(reply) => {
                let _ = reply.send(Ok(()));
            }
        }
    }
}

type Reply = oneshot::Sender<Result<(), ClientError>>;

enum Command {
    Connect(Reply),
    Disconnect(Reply),
    Suspend(Reply),
    Send {
        document: Element,
        callback: Option<AckCallback>,
        reply: Reply,
    },
    ExchangeAcknowledgement {
        timeout: Option<Duration>,
        reply: Reply,
    },
    SubmitRegistration {
        form: Element,
        reply: Reply,
    },
    SetReachability(bool),
    Shutdown(Reply),
}

enum Step {
    Command(Command),
    Transport(Result<TransportEvent, TransportError>),
    Reconnect,
    AckDeadline,
    Shutdown(Option<Reply>),
}

/// Cloneable handle to a client running on its own task.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ClientState>,
}

impl ClientHandle {
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub async fn wait_for_state(&self, target: ClientState) -> Result<(), ClientError> {
        let mut state = self.state.clone();
        state
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::ClientGone)
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.request(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(Command::Disconnect).await
    }

    pub async fn suspend(&self) -> Result<(), ClientError> {
        self.request(Command::Suspend).await
    }

    /// Resolves once the transport took the document. The callback reports
    /// delivery.
    pub async fn send(
        &self,
        document: Element,
        callback: Option<AckCallback>,
    ) -> Result<(), ClientError> {
        self.request(|reply| Command::Send {
            document,
            callback,
            reply,
        })
        .await
    }

    /// Resolves once the peer acknowledged the document, or immediately
    /// after sending when stream management is off.
    pub async fn send_acknowledged(&self, document: Element) -> Result<(), ClientError> {
        let (acked_tx, acked_rx) = oneshot::channel();
        let callback: AckCallback = Box::new(move |result| {
            let _ = acked_tx.send(result);
        });
        self.send(document, Some(callback)).await?;
        acked_rx.await.map_err(|_| ClientError::ClientGone)?
    }

    /// Waits at most the configured ack timeout.
    pub async fn exchange_acknowledgement(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::ExchangeAcknowledgement {
            timeout: None,
            reply,
        })
        .await
    }

    pub async fn exchange_acknowledgement_within(
        &self,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        self.request(|reply| Command::ExchangeAcknowledgement {
            timeout: Some(timeout),
            reply,
        })
        .await
    }

    pub async fn submit_registration(&self, form: Element) -> Result<(), ClientError> {
        self.request(|reply| Command::SubmitRegistration { form, reply })
            .await
    }

    pub async fn set_reachability(&self, reachable: bool) -> Result<(), ClientError> {
        self.commands
            .send(Command::SetReachability(reachable))
            .await
            .map_err(|_| ClientError::ClientGone)
    }

    /// Disconnect and stop the client task.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.request(Command::Shutdown).await
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), ClientError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ClientError::ClientGone)?;
        response.await.map_err(|_| ClientError::ClientGone)?
    }
}

#[async_trait]
impl Connection for ClientHandle {
    async fn send_document(&self, document: Element) -> Result<(), ClientError> {
        self.send(document, None).await
    }
}

fn to_xml(element: &Element) -> String {
    serialize_document(element)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
