//! In-memory server and scripted transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use skua_xmpp::error::TransportError;
use skua_xmpp::stanza::{IqType, ns, result_reply};
use skua_xmpp::{
    Client, ClientError, ClientOptions, ClientState, ConnectionEvent, DocumentTransport, Jid, MechanismRegistry,
    TransportEvent,
};
use tokio::sync::mpsc;
use xmpp_parsers::minidom::Element;

pub const ACCOUNT: &str = "juliet@capulet.example";
pub const USERNAME: &str = "juliet";
pub const PASSWORD: &str = "r0m30";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOffer {
    Absent,
    Required,
    /// Advertised with `<optional/>`; `fails` makes the server reject it.
    Optional { fails: bool },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub stream_management: bool,
    /// Keep the stream-management session across suspensions.
    pub resumption: bool,
    pub session: SessionOffer,
    pub registration: bool,
    pub extra_pre_auth: Vec<Element>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_management: true,
            resumption: true,
            session: SessionOffer::Required,
            registration: false,
            extra_pre_auth: Vec::new(),
        }
    }
}

/// Just enough of an XMPP server to negotiate against.
#[derive(Debug)]
pub struct MockServer {
    pub config: ServerConfig,
    pub password: String,
    authenticated: bool,
    /// Stanzas received on the current stream-management session.
    handled: u32,
    sm_session: Option<String>,
    sessions: u32,
    pub registered: Option<String>,
}

impl MockServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            password: PASSWORD.to_string(),
            authenticated: false,
            handled: 0,
            sm_session: None,
            sessions: 0,
            registered: None,
        }
    }

    pub fn handled(&self) -> u32 {
        self.handled
    }

    fn features(&self) -> Element {
        let mut features = Element::builder("features", ns::STREAM);
        if !self.authenticated {
            features = features.append(
                Element::builder("mechanisms", ns::SASL)
                    .append(Element::builder("mechanism", ns::SASL).append("PLAIN").build())
                    .build(),
            );
            if self.config.registration {
                features = features.append(Element::builder("register", ns::REGISTER_FEATURE).build());
            }
            for extra in &self.config.extra_pre_auth {
                features = features.append(extra.clone());
            }
            return features.build();
        }

        features = features.append(Element::builder("bind", ns::BIND).build());
        match self.config.session {
            SessionOffer::Absent => {}
            SessionOffer::Required => {
                features = features.append(Element::builder("session", ns::SESSION).build());
            }
            SessionOffer::Optional { .. } => {
                features = features.append(
                    Element::builder("session", ns::SESSION)
                        .append(Element::builder("optional", ns::SESSION).build())
                        .build(),
                );
            }
        }
        if self.config.stream_management {
            features = features.append(Element::builder("sm", ns::SM).build());
        }
        features.build()
    }

    fn on_open(&mut self) -> Vec<Element> {
        vec![self.features()]
    }

    fn on_suspend(&mut self) {
        self.authenticated = false;
        if !self.config.resumption {
            self.sm_session = None;
        }
    }

    /// Drop the stream-management session, as if it expired.
    pub fn forget_session(&mut self) {
        self.sm_session = None;
    }

    fn on_close(&mut self) {
        self.authenticated = false;
        self.sm_session = None;
    }

    fn on_document(&mut self, document: &Element) -> Vec<Element> {
        if document.ns() == ns::SASL && document.name() == "auth" {
            return vec![self.authenticate(document)];
        }
        if document.ns() == ns::SM {
            return self.stream_management(document);
        }
        if document.is("iq", ns::JABBER_CLIENT) {
            if self.sm_session.is_some() {
                self.handled += 1;
            }
            return self.iq(document).into_iter().collect();
        }
        if self.sm_session.is_some()
            && (document.is("message", ns::JABBER_CLIENT) || document.is("presence", ns::JABBER_CLIENT))
        {
            self.handled += 1;
        }
        Vec::new()
    }

    fn authenticate(&mut self, auth: &Element) -> Element {
        let expected = format!("\0{USERNAME}\0{}", self.password);
        let accepted = auth.attr("mechanism") == Some("PLAIN")
            && STANDARD.decode(auth.text().trim()).ok().as_deref() == Some(expected.as_bytes());
        if accepted {
            self.authenticated = true;
            Element::builder("success", ns::SASL).build()
        } else {
            Element::builder("failure", ns::SASL)
                .append(Element::builder("not-authorized", ns::SASL).build())
                .build()
        }
    }

    fn stream_management(&mut self, document: &Element) -> Vec<Element> {
        match document.name() {
            "enable" => {
                self.sessions += 1;
                let id = format!("sm-{}", self.sessions);
                self.sm_session = Some(id.clone());
                self.handled = 0;
                let mut enabled = Element::builder("enabled", ns::SM).attr("id", id);
                if self.config.resumption && document.attr("resume") == Some("true") {
                    enabled = enabled.attr("resume", "true").attr("max", "300");
                }
                vec![enabled.build()]
            }
            "resume" => match &self.sm_session {
                Some(id) if document.attr("previd") == Some(id.as_str()) => {
                    vec![Element::builder("resumed", ns::SM)
                        .attr("previd", id.clone())
                        .attr("h", self.handled.to_string())
                        .build()]
                }
                _ => vec![Element::builder("failed", ns::SM)
                    .append(Element::builder("item-not-found", ns::STANZAS).build())
                    .build()],
            },
            "r" => vec![Element::builder("a", ns::SM)
                .attr("h", self.handled.to_string())
                .build()],
            _ => Vec::new(),
        }
    }

    fn iq(&mut self, iq: &Element) -> Option<Element> {
        let iq_type = IqType::of(iq)?;
        if !iq_type.is_request() || iq.attr("to").is_some_and(|to| to != "capulet.example") {
            return None;
        }

        if let Some(bind) = iq.get_child("bind", ns::BIND) {
            let resource = bind
                .get_child("resource", ns::BIND)
                .map(|resource| resource.text())
                .unwrap_or_else(|| format!("generated-{}", self.sessions + 1));
            let jid = Element::builder("jid", ns::BIND)
                .append(format!("{ACCOUNT}/{resource}"))
                .build();
            return Some(result_reply(
                iq,
                Some(Element::builder("bind", ns::BIND).append(jid).build()),
            ));
        }
        if iq.has_child("session", ns::SESSION) {
            if let SessionOffer::Optional { fails: true } = self.config.session {
                return Some(skua_xmpp::stanza::condition_reply(
                    iq,
                    skua_xmpp::error::StanzaErrorCondition::InternalServerError,
                ));
            }
            return Some(result_reply(iq, None));
        }
        if iq.has_child("query", ns::REGISTER) {
            if iq_type == IqType::Get {
                let form = Element::builder("query", ns::REGISTER)
                    .append(Element::builder("instructions", ns::REGISTER).append("Choose a username").build())
                    .append(Element::builder("username", ns::REGISTER).build())
                    .append(Element::builder("password", ns::REGISTER).build())
                    .build();
                return Some(result_reply(iq, Some(form)));
            }
            let query = iq.get_child("query", ns::REGISTER)?;
            let field = |name: &str| query.get_child(name, ns::REGISTER).map(|field| field.text());
            self.registered = field("username");
            if let Some(password) = field("password") {
                self.password = password;
            }
            return Some(result_reply(iq, None));
        }
        if iq.has_child("ping", ns::PING) {
            return Some(result_reply(iq, None));
        }
        None
    }
}

#[derive(Debug)]
struct Shared {
    server: MockServer,
    sent: Vec<Element>,
    opens: u32,
    failing_opens: VecDeque<TransportError>,
    severed: bool,
}

/// Test-side view of a [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct Link {
    shared: Arc<Mutex<Shared>>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
}

impl Link {
    pub fn sent(&self) -> Vec<Element> {
        self.shared.lock().unwrap().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.shared.lock().unwrap().sent.clear();
    }

    pub fn opens(&self) -> u32 {
        self.shared.lock().unwrap().opens
    }

    /// Documents sent from now on never reach the server.
    pub fn sever(&self) {
        self.shared.lock().unwrap().severed = true;
    }

    pub fn fail_next_opens(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.shared.lock().unwrap().failing_opens.extend(errors);
    }

    /// Deliver a document or event as if the server sent it.
    pub fn inject(&self, event: TransportEvent) {
        let _ = self.inbound.send(event);
    }

    pub fn inject_xml(&self, xml: &str) {
        self.inject(TransportEvent::Document(xml.parse().unwrap()));
    }

    pub fn with_server<R>(&self, f: impl FnOnce(&mut MockServer) -> R) -> R {
        f(&mut self.shared.lock().unwrap().server)
    }

    /// Wait until a sent document satisfies `predicate`.
    pub async fn wait_for_sent(&self, predicate: impl Fn(&Element) -> bool) -> Element {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(found) = self.sent().into_iter().find(|document| predicate(document)) {
                    return found;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("document was never sent")
    }
}

/// Transport whose peer is a [`MockServer`] answering synchronously.
pub struct ScriptedTransport {
    shared: Arc<Mutex<Shared>>,
    sender: mpsc::UnboundedSender<TransportEvent>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl ScriptedTransport {
    pub fn new(config: ServerConfig) -> (Self, Link) {
        let shared = Arc::new(Mutex::new(Shared {
            server: MockServer::new(config),
            sent: Vec::new(),
            opens: 0,
            failing_opens: VecDeque::new(),
            severed: false,
        }));
        let (sender, inbound) = mpsc::unbounded_channel();
        let link = Link {
            shared: Arc::clone(&shared),
            inbound: sender.clone(),
        };
        (
            Self {
                shared,
                sender,
                inbound,
            },
            link,
        )
    }

    fn deliver(&self, documents: Vec<Element>) {
        for document in documents {
            let _ = self.sender.send(TransportEvent::Document(document));
        }
    }

    /// A new connection never sees what was queued on the old one.
    fn drain(&mut self) {
        while self.inbound.try_recv().is_ok() {}
    }
}

impl DocumentTransport for ScriptedTransport {
    async fn open(&mut self, _hostname: &str, _options: &ClientOptions) -> Result<String, TransportError> {
        self.drain();
        let (stream_id, responses) = {
            let mut shared = self.shared.lock().unwrap();
            shared.opens += 1;
            if let Some(error) = shared.failing_opens.pop_front() {
                return Err(error);
            }
            shared.severed = false;
            (format!("stream-{}", shared.opens), shared.server.on_open())
        };
        self.deliver(responses);
        Ok(stream_id)
    }

    async fn reopen(&mut self) -> Result<String, TransportError> {
        let responses = self.shared.lock().unwrap().server.on_open();
        self.deliver(responses);
        Ok("restarted".to_string())
    }

    async fn send(&mut self, document: Element) -> Result<(), TransportError> {
        let responses = {
            let mut shared = self.shared.lock().unwrap();
            shared.sent.push(document.clone());
            if shared.severed {
                return Ok(());
            }
            shared.server.on_document(&document)
        };
        self.deliver(responses);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        self.inbound.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.drain();
        self.shared.lock().unwrap().server.on_close();
        Ok(())
    }

    async fn suspend(&mut self) -> Result<(), TransportError> {
        self.drain();
        self.shared.lock().unwrap().server.on_suspend();
        Ok(())
    }
}

pub fn account() -> Jid {
    ACCOUNT.parse().unwrap()
}

pub fn options() -> ClientOptions {
    ClientOptions {
        resource: Some("balcony".into()),
        ..ClientOptions::default()
    }
}

pub fn client(
    config: ServerConfig,
    options: ClientOptions,
) -> (
    Client<ScriptedTransport>,
    mpsc::UnboundedReceiver<ConnectionEvent>,
    Link,
) {
    client_with_password(config, options, PASSWORD)
}

pub fn client_with_password(
    config: ServerConfig,
    options: ClientOptions,
    password: &str,
) -> (
    Client<ScriptedTransport>,
    mpsc::UnboundedReceiver<ConnectionEvent>,
    Link,
) {
    let (transport, link) = ScriptedTransport::new(config);
    let (client, events) = Client::new(
        account(),
        transport,
        options,
        MechanismRegistry::with_credentials(USERNAME, password),
    );
    (client, events, link)
}

/// Handle transport events until the client has disconnected. Returns the
/// failure, if any.
pub async fn until_disconnected(client: &mut Client<ScriptedTransport>) -> Option<ClientError> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.state() != ClientState::Disconnected {
            client.process_next_event().await;
        }
    })
    .await
    .expect("client never disconnected");
    client.last_error().cloned()
}

pub fn drain(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub fn chat(id: &str) -> Element {
    Element::builder("message", ns::JABBER_CLIENT)
        .attr("to", "romeo@montague.example")
        .attr("id", id)
        .attr("type", "chat")
        .append(Element::builder("body", ns::JABBER_CLIENT).append(id).build())
        .build()
}

/// Callback that records `"<id>:<ok>"` into `log`.
pub fn recording_callback(
    log: &Arc<Mutex<Vec<String>>>,
    id: &str,
) -> skua_xmpp::AckCallback {
    let log = Arc::clone(log);
    let id = id.to_string();
    Box::new(move |result| {
        log.lock().unwrap().push(format!("{id}:{}", result.is_ok()));
    })
}
