use std::fmt;
use std::str::FromStr;

use xmpp_parsers::minidom::Element;

use crate::error::{StanzaError, StanzaErrorCondition};
use crate::jid::Jid;

/// Namespaces the engine reads or writes.
pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const SM: &str = "urn:xmpp:sm:3";
    pub const REGISTER: &str = "jabber:iq:register";
    pub const REGISTER_FEATURE: &str = "http://jabber.org/features/iq-register";
    pub const PING: &str = "urn:xmpp:ping";
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document parse failed: {0}")]
    ParseFailed(String),

    #[error("document serialization failed: {0}")]
    SerializeFailed(String),
}

/// Qualified element name: namespace plus local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QName {
    pub namespace: String,
    pub name: String,
}

impl QName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(element: &Element) -> Self {
        Self::new(element.ns(), element.name())
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    pub fn of(element: &Element) -> Option<Self> {
        if element.ns() != ns::JABBER_CLIENT {
            return None;
        }
        match element.name() {
            "message" => Some(Self::Message),
            "presence" => Some(Self::Presence),
            "iq" => Some(Self::Iq),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Presence => "presence",
            Self::Iq => "iq",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }

    pub fn of(element: &Element) -> Option<Self> {
        if StanzaKind::of(element) != Some(StanzaKind::Iq) {
            return None;
        }
        element.attr("type")?.parse().ok()
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::Get | Self::Set)
    }
}

impl FromStr for IqType {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(Self::Get),
            "set" => Ok(Self::Set),
            "result" => Ok(Self::Result),
            "error" => Ok(Self::Error),
            other => Err(DocumentError::ParseFailed(format!(
                "unknown iq type '{other}'"
            ))),
        }
    }
}

pub fn parse_document(raw: &[u8]) -> Result<Element, DocumentError> {
    let xml = std::str::from_utf8(raw).map_err(|error| {
        DocumentError::ParseFailed(format!("invalid UTF-8 document bytes: {error}"))
    })?;
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return Err(DocumentError::ParseFailed("document is empty".to_string()));
    }

    Element::from_str(trimmed)
        .map_err(|error| DocumentError::ParseFailed(format!("failed to parse XML: {error}")))
}

pub fn serialize_document(document: &Element) -> Result<Vec<u8>, DocumentError> {
    let mut payload = Vec::new();
    document.write_to(&mut payload).map_err(|error| {
        DocumentError::SerializeFailed(format!("failed to serialize <{}/>: {error}", document.name()))
    })?;
    Ok(payload)
}

pub fn is_stream_element(document: &Element, name: &str) -> bool {
    document.is(name, ns::STREAM)
}

/// Read a JID-valued attribute. `None` when absent, `Some(Err)` when malformed.
pub fn jid_attr(document: &Element, name: &str) -> Option<Result<Jid, crate::jid::JidError>> {
    document.attr(name).map(str::parse)
}

/// First child that is not an `<error/>`, i.e. the IQ payload.
pub fn payload(document: &Element) -> Option<&Element> {
    document.children().find(|child| child.name() != "error")
}

pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn build_iq(
    iq_type: IqType,
    id: &str,
    to: Option<&Jid>,
    payload: Option<Element>,
) -> Element {
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", iq_type.as_str())
        .attr("id", id);
    if let Some(to) = to {
        builder = builder.attr("to", to.to_string());
    }
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    builder.build()
}

/// Address a reply back to the request's sender, from its recipient.
fn reply_builder(request: &Element, iq_type: IqType) -> xmpp_parsers::minidom::ElementBuilder {
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", iq_type.as_str())
        .attr("id", request.attr("id").unwrap_or_default());
    if let Some(from) = request.attr("from") {
        builder = builder.attr("to", from);
    }
    if let Some(to) = request.attr("to") {
        builder = builder.attr("from", to);
    }
    builder
}

pub fn result_reply(request: &Element, payload: Option<Element>) -> Element {
    let mut builder = reply_builder(request, IqType::Result);
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    builder.build()
}

pub fn error_reply(request: &Element, error: &StanzaError) -> Element {
    reply_builder(request, IqType::Error)
        .append(error.to_element())
        .build()
}

pub fn condition_reply(request: &Element, condition: StanzaErrorCondition) -> Element {
    error_reply(request, &StanzaError::new(condition))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const IQ_XML: &str =
        "<iq xmlns='jabber:client' type='get' id='ping-1' from='romeo@montague.example/orchard' to='montague.example'><ping xmlns='urn:xmpp:ping'/></iq>";

    #[test]
    fn classifies_stanzas() {
        let iq = parse_document(IQ_XML.as_bytes()).unwrap();
        assert_eq!(StanzaKind::of(&iq), Some(StanzaKind::Iq));
        assert_eq!(IqType::of(&iq), Some(IqType::Get));
        assert!(IqType::Get.is_request());

        let nonza: Element = "<r xmlns='urn:xmpp:sm:3'/>".parse().unwrap();
        assert_eq!(StanzaKind::of(&nonza), None);
        assert_eq!(IqType::of(&nonza), None);
    }

    #[test]
    fn classifies_fixture_stanzas() {
        use skua_test_support::fixtures;

        let presence = parse_document(fixtures::stanza("presence-available.xml").as_bytes()).unwrap();
        assert_eq!(StanzaKind::of(&presence), Some(StanzaKind::Presence));
        let show = presence.get_child("show", ns::JABBER_CLIENT).map(Element::text);
        assert_eq!(show.as_deref(), Some("chat"));

        let iq = parse_document(fixtures::stanza("iq-version-get.xml").as_bytes()).unwrap();
        assert_eq!(IqType::of(&iq), Some(IqType::Get));
        assert_eq!(QName::of(payload(&iq).unwrap()), QName::new("jabber:iq:version", "query"));
    }

    #[test]
    fn rejects_empty_and_malformed_documents() {
        assert_matches!(parse_document(b"   "), Err(DocumentError::ParseFailed(_)));
        assert_matches!(parse_document(b"<iq"), Err(DocumentError::ParseFailed(_)));
        assert_matches!(parse_document(&[0xff, 0xfe]), Err(DocumentError::ParseFailed(_)));
    }

    #[test]
    fn qualified_name_of_payload() {
        let iq = parse_document(IQ_XML.as_bytes()).unwrap();
        let qname = QName::of(payload(&iq).unwrap());
        assert_eq!(qname, QName::new(ns::PING, "ping"));
        assert_eq!(qname.to_string(), "{urn:xmpp:ping}ping");
    }

    #[test]
    fn replies_swap_addresses_and_keep_id() {
        let iq = parse_document(IQ_XML.as_bytes()).unwrap();

        let result = result_reply(&iq, None);
        assert_eq!(result.attr("type"), Some("result"));
        assert_eq!(result.attr("id"), Some("ping-1"));
        assert_eq!(result.attr("to"), Some("romeo@montague.example/orchard"));
        assert_eq!(result.attr("from"), Some("montague.example"));

        let error = condition_reply(&iq, StanzaErrorCondition::ServiceUnavailable);
        assert_eq!(error.attr("type"), Some("error"));
        let parsed = StanzaError::from_stanza(&error).unwrap();
        assert_eq!(parsed.condition, StanzaErrorCondition::ServiceUnavailable);
    }

    #[test]
    fn serializes_and_reads_back() {
        let iq = build_iq(
            IqType::Set,
            "s1",
            Some(&"capulet.example".parse().unwrap()),
            Some(Element::builder("session", ns::SESSION).build()),
        );
        let bytes = serialize_document(&iq).unwrap();
        let back = parse_document(&bytes).unwrap();
        assert_eq!(back.attr("id"), Some("s1"));
        assert_eq!(back.attr("to"), Some("capulet.example"));
        assert!(back.has_child("session", ns::SESSION));
    }

    #[test]
    fn jid_attributes() {
        let iq = parse_document(IQ_XML.as_bytes()).unwrap();
        let from = jid_attr(&iq, "from").unwrap().unwrap();
        assert_eq!(from.resource(), Some("orchard"));
        assert!(jid_attr(&iq, "nope").is_none());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(generate_id(), generate_id());
    }
}
