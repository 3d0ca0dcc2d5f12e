use tracing::info;
use xmpp_parsers::minidom::Element;

use super::{FeatureAction, Handled, NegotiationContext, iq_error, iq_reply};
use crate::error::ClientError;
use crate::jid::Jid;
use crate::stanza::{IqType, build_iq, generate_id, ns};

/// Resource binding (RFC 6120 §7).
#[derive(Debug, Default)]
pub struct BindFeature {
    request_id: Option<String>,
}

impl BindFeature {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn begin(&mut self, ctx: &mut NegotiationContext<'_>) -> Vec<FeatureAction> {
        let mut bind = Element::builder("bind", ns::BIND);
        if let Some(resource) = &ctx.options.resource {
            bind = bind.append(
                Element::builder("resource", ns::BIND)
                    .append(resource.clone())
                    .build(),
            );
        }

        let id = generate_id();
        let request = build_iq(IqType::Set, &id, None, Some(bind.build()));
        self.request_id = Some(id);
        vec![FeatureAction::Send(request)]
    }

    pub(super) fn handle_document(&mut self, document: &Element) -> Result<Handled, ClientError> {
        let Some(reply) = iq_reply(document, self.request_id.as_deref()) else {
            return Ok(Handled::Ignored);
        };

        match IqType::of(reply) {
            Some(IqType::Result) => {
                let jid = bound_jid(reply)?;
                info!(%jid, "resource bound");
                Ok(Handled::Consumed(vec![
                    FeatureAction::Bound(jid),
                    FeatureAction::Complete,
                ]))
            }
            Some(IqType::Error) => Err(iq_error(reply)),
            _ => Ok(Handled::Ignored),
        }
    }
}

fn bound_jid(reply: &Element) -> Result<Jid, ClientError> {
    let text = reply
        .get_child("bind", ns::BIND)
        .and_then(|bind| bind.get_child("jid", ns::BIND))
        .map(|jid| jid.text())
        .ok_or_else(|| ClientError::MalformedDocument("bind result without <jid/>".into()))?;

    text.trim()
        .parse()
        .map_err(|error| ClientError::MalformedDocument(format!("bound JID '{text}': {error}")))
}
