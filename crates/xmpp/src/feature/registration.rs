use tracing::info;
use xmpp_parsers::minidom::Element;

use super::{FeatureAction, Handled, iq_error, iq_reply};
use crate::error::ClientError;
use crate::stanza::{IqType, build_iq, generate_id, ns};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Idle,
    AwaitingForm { id: String },
    AwaitingSubmission,
    Submitted { id: String, username: String },
}

/// In-band registration (XEP-0077) as a stream feature.
#[derive(Debug)]
pub struct RegistrationFeature {
    step: Step,
}

impl Default for RegistrationFeature {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationFeature {
    pub fn new() -> Self {
        Self { step: Step::Idle }
    }

    pub fn awaits_submission(&self) -> bool {
        self.step == Step::AwaitingSubmission
    }

    pub(super) fn begin(&mut self) -> Vec<FeatureAction> {
        let id = generate_id();
        let request = build_iq(
            IqType::Get,
            &id,
            None,
            Some(Element::builder("query", ns::REGISTER).build()),
        );
        self.step = Step::AwaitingForm { id };
        vec![FeatureAction::Send(request)]
    }

    pub(super) fn handle_document(&mut self, document: &Element) -> Result<Handled, ClientError> {
        let pending_id = match &self.step {
            Step::AwaitingForm { id } | Step::Submitted { id, .. } => Some(id.as_str()),
            _ => None,
        };
        let Some(reply) = iq_reply(document, pending_id) else {
            return Ok(Handled::Ignored);
        };

        match IqType::of(reply) {
            Some(IqType::Error) => Err(iq_error(reply)),
            Some(IqType::Result) => match std::mem::replace(&mut self.step, Step::Idle) {
                Step::AwaitingForm { .. } => {
                    let form = reply
                        .get_child("query", ns::REGISTER)
                        .cloned()
                        .ok_or_else(|| {
                            ClientError::MalformedDocument("registration form without <query/>".into())
                        })?;
                    self.step = Step::AwaitingSubmission;
                    Ok(Handled::Consumed(vec![FeatureAction::RegistrationChallenge(form)]))
                }
                Step::Submitted { username, .. } => {
                    info!(%username, "account registered");
                    Ok(Handled::Consumed(vec![
                        FeatureAction::Registered { username },
                        FeatureAction::Complete,
                    ]))
                }
                other => {
                    self.step = other;
                    Ok(Handled::Ignored)
                }
            },
            _ => Ok(Handled::Ignored),
        }
    }

    /// Send the filled-in form. `form` is either the `<query/>` itself or
    /// its children.
    pub(super) fn submit(&mut self, form: Element) -> Result<Vec<FeatureAction>, ClientError> {
        if self.step != Step::AwaitingSubmission {
            return Err(ClientError::MalformedDocument(
                "no registration form is awaiting submission".into(),
            ));
        }

        let query = if form.is("query", ns::REGISTER) {
            form
        } else {
            Element::builder("query", ns::REGISTER).append(form).build()
        };
        let username = query
            .get_child("username", ns::REGISTER)
            .map(|username| username.text())
            .unwrap_or_default();

        let id = generate_id();
        let request = build_iq(IqType::Set, &id, None, Some(query));
        self.step = Step::Submitted { id, username };
        Ok(vec![FeatureAction::Send(request)])
    }
}
