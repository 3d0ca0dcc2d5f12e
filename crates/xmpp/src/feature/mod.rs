//! Stream feature negotiation.
//!
//! Each advertised feature the client negotiates becomes one
//! [`StreamFeature`]: a small state machine that produces documents to send
//! and consumes the server's answers until it reports
//! [`FeatureAction::Complete`] or fails.

mod bind;
mod registration;
mod sasl;
mod session;
mod stream_management;

use std::collections::HashMap;
use std::fmt;

use xmpp_parsers::minidom::Element;

use crate::error::ClientError;
use crate::jid::Jid;
use crate::options::ClientOptions;
use crate::sasl::MechanismRegistry;
use crate::stanza::{QName, ns};
use crate::stream_management::StreamManagementLedger;

pub use bind::BindFeature;
pub use registration::RegistrationFeature;
pub use sasl::SaslFeature;
pub use session::SessionFeature;
pub use stream_management::StreamManagementFeature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Sasl,
    Bind,
    Session,
    StreamManagement,
    InBandRegistration,
}

impl FeatureKind {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureKind::Sasl => "sasl",
            FeatureKind::Bind => "bind",
            FeatureKind::Session => "session",
            FeatureKind::StreamManagement => "stream-management",
            FeatureKind::InBandRegistration => "in-band-registration",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A feature the server advertised and the registry knows.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisedFeature {
    pub kind: FeatureKind,
    pub element: Element,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    /// Known features, in advertisement order.
    pub advertised: Vec<AdvertisedFeature>,
    /// Unknown features marked `<required/>`.
    pub unknown_required: Vec<QName>,
}

impl Discovery {
    pub fn get(&self, kind: FeatureKind) -> Option<&AdvertisedFeature> {
        self.advertised.iter().find(|feature| feature.kind == kind)
    }
}

/// Qualified name of an advertised feature element to the feature it
/// announces.
#[derive(Debug, Clone)]
pub struct FeatureRegistry {
    kinds: HashMap<QName, FeatureKind>,
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(QName::new(ns::SASL, "mechanisms"), FeatureKind::Sasl);
        registry.register(QName::new(ns::BIND, "bind"), FeatureKind::Bind);
        registry.register(QName::new(ns::SESSION, "session"), FeatureKind::Session);
        registry.register(QName::new(ns::SM, "sm"), FeatureKind::StreamManagement);
        registry.register(
            QName::new(ns::REGISTER_FEATURE, "register"),
            FeatureKind::InBandRegistration,
        );
        registry
    }
}

impl FeatureRegistry {
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    pub fn register(&mut self, qname: QName, kind: FeatureKind) {
        self.kinds.insert(qname, kind);
    }

    pub fn kind_of(&self, qname: &QName) -> Option<FeatureKind> {
        self.kinds.get(qname).copied()
    }

    /// Sort the children of `<stream:features/>` into known features and
    /// unknown required ones.
    pub fn discover(&self, features: &Element) -> Discovery {
        let mut discovery = Discovery::default();
        for child in features.children() {
            let qname = QName::of(child);
            match self.kind_of(&qname) {
                Some(kind) if discovery.get(kind).is_none() => {
                    discovery.advertised.push(AdvertisedFeature {
                        kind,
                        element: child.clone(),
                    });
                }
                Some(_) => {}
                None if child.children().any(|c| c.name() == "required") => {
                    discovery.unknown_required.push(qname);
                }
                None => {}
            }
        }
        discovery
    }
}

/// What the client must do on a feature's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureAction {
    Send(Element),
    Bound(Jid),
    /// The previous stream-management session continues.
    Resumed,
    /// Resumption was refused; the ledger has been cleared. Terminal, but
    /// the feature does not count as negotiated.
    ResumeFailed,
    /// Registration form from the server, waiting for a submission.
    RegistrationChallenge(Element),
    Registered { username: String },
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// Not addressed to this feature.
    Ignored,
    Consumed(Vec<FeatureAction>),
}

/// Client state a feature may read or update while negotiating.
pub struct NegotiationContext<'a> {
    pub hostname: &'a str,
    pub options: &'a ClientOptions,
    pub mechanisms: &'a MechanismRegistry,
    pub ledger: &'a mut StreamManagementLedger,
}

#[derive(Debug)]
pub enum StreamFeature {
    Sasl(SaslFeature),
    Bind(BindFeature),
    Session(SessionFeature),
    StreamManagement(StreamManagementFeature),
    InBandRegistration(RegistrationFeature),
}

impl StreamFeature {
    pub fn from_advertisement(advertised: &AdvertisedFeature) -> Self {
        let element = &advertised.element;
        match advertised.kind {
            FeatureKind::Sasl => Self::Sasl(SaslFeature::from_element(element)),
            FeatureKind::Bind => Self::Bind(BindFeature::new()),
            FeatureKind::Session => Self::Session(SessionFeature::from_element(element)),
            FeatureKind::StreamManagement => {
                Self::StreamManagement(StreamManagementFeature::new())
            }
            FeatureKind::InBandRegistration => {
                Self::InBandRegistration(RegistrationFeature::new())
            }
        }
    }

    pub fn kind(&self) -> FeatureKind {
        match self {
            Self::Sasl(_) => FeatureKind::Sasl,
            Self::Bind(_) => FeatureKind::Bind,
            Self::Session(_) => FeatureKind::Session,
            Self::StreamManagement(_) => FeatureKind::StreamManagement,
            Self::InBandRegistration(_) => FeatureKind::InBandRegistration,
        }
    }

    /// Failure of a mandatory feature aborts the connection attempt.
    pub fn is_mandatory(&self) -> bool {
        match self {
            Self::Sasl(_) | Self::Bind(_) | Self::InBandRegistration(_) => true,
            Self::Session(session) => session.is_mandatory(),
            Self::StreamManagement(_) => false,
        }
    }

    /// The stream must be restarted once this feature completes.
    pub fn needs_restart(&self) -> bool {
        match self {
            Self::Sasl(sasl) => sasl.needs_restart(),
            _ => false,
        }
    }

    pub fn begin(
        &mut self,
        ctx: &mut NegotiationContext<'_>,
    ) -> Result<Vec<FeatureAction>, ClientError> {
        match self {
            Self::Sasl(feature) => feature.begin(ctx),
            Self::Bind(feature) => Ok(feature.begin(ctx)),
            Self::Session(feature) => Ok(feature.begin()),
            Self::StreamManagement(feature) => Ok(feature.begin(ctx)),
            Self::InBandRegistration(feature) => Ok(feature.begin()),
        }
    }

    pub fn handle_document(
        &mut self,
        document: &Element,
        ctx: &mut NegotiationContext<'_>,
    ) -> Result<Handled, ClientError> {
        match self {
            Self::Sasl(feature) => feature.handle_document(document),
            Self::Bind(feature) => feature.handle_document(document),
            Self::Session(feature) => feature.handle_document(document),
            Self::StreamManagement(feature) => feature.handle_document(document, ctx),
            Self::InBandRegistration(feature) => feature.handle_document(document),
        }
    }

    /// Registration only: answer the server's form.
    pub fn submit_registration(&mut self, form: Element) -> Result<Vec<FeatureAction>, ClientError> {
        match self {
            Self::InBandRegistration(feature) => feature.submit(form),
            _ => Err(ClientError::MalformedDocument(format!(
                "{} does not accept a registration form",
                self.kind()
            ))),
        }
    }

    pub fn awaits_registration(&self) -> bool {
        matches!(self, Self::InBandRegistration(feature) if feature.awaits_submission())
    }
}

/// `<iq/>` answering the request `id`, or `None`.
fn iq_reply<'d>(document: &'d Element, id: Option<&str>) -> Option<&'d Element> {
    let id = id?;
    (crate::stanza::StanzaKind::of(document) == Some(crate::stanza::StanzaKind::Iq)
        && document.attr("id") == Some(id))
    .then_some(document)
}

/// Turn an `<iq type='error'/>` reply into the client error it carries.
fn iq_error(reply: &Element) -> ClientError {
    let error = crate::error::StanzaError::from_stanza(reply).unwrap_or_else(|| {
        crate::error::StanzaError::new(crate::error::StanzaErrorCondition::UndefinedCondition)
    });
    ClientError::Stanza(error)
}
