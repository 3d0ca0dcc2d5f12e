use tracing::debug;
use xmpp_parsers::minidom::Element;

use super::{FeatureAction, Handled, iq_error, iq_reply};
use crate::error::ClientError;
use crate::stanza::{IqType, build_iq, generate_id, ns};

/// Legacy session establishment (RFC 3921 §3).
#[derive(Debug)]
pub struct SessionFeature {
    optional: bool,
    request_id: Option<String>,
}

impl SessionFeature {
    /// The server marks the session `<optional/>` when it no longer needs it.
    pub fn from_element(session: &Element) -> Self {
        Self {
            optional: session.children().any(|child| child.name() == "optional"),
            request_id: None,
        }
    }

    pub fn is_mandatory(&self) -> bool {
        !self.optional
    }

    pub(super) fn begin(&mut self) -> Vec<FeatureAction> {
        let id = generate_id();
        let request = build_iq(
            IqType::Set,
            &id,
            None,
            Some(Element::builder("session", ns::SESSION).build()),
        );
        self.request_id = Some(id);
        vec![FeatureAction::Send(request)]
    }

    pub(super) fn handle_document(&mut self, document: &Element) -> Result<Handled, ClientError> {
        let Some(reply) = iq_reply(document, self.request_id.as_deref()) else {
            return Ok(Handled::Ignored);
        };

        match IqType::of(reply) {
            Some(IqType::Result) => {
                debug!("session established");
                Ok(Handled::Consumed(vec![FeatureAction::Complete]))
            }
            Some(IqType::Error) => Err(iq_error(reply)),
            _ => Ok(Handled::Ignored),
        }
    }
}
