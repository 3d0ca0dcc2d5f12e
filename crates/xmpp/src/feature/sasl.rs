use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use tracing::{debug, info};
use xmpp_parsers::minidom::Element;

use super::{FeatureAction, Handled, NegotiationContext};
use crate::error::{ClientError, SaslCondition, SaslError};
use crate::sasl::{SaslMechanism, SaslStep};
use crate::stanza::ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaslState {
    Idle,
    Exchanging,
    Aborting,
    Succeeded,
}

/// SASL authentication (RFC 6120 §6).
pub struct SaslFeature {
    offered: Vec<String>,
    mechanism: Option<Box<dyn SaslMechanism>>,
    state: SaslState,
}

impl fmt::Debug for SaslFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslFeature")
            .field("offered", &self.offered)
            .field("mechanism", &self.mechanism.as_ref().map(|m| m.name().to_string()))
            .field("state", &self.state)
            .finish()
    }
}

impl SaslFeature {
    /// Read the offered mechanisms from `<mechanisms/>`.
    pub fn from_element(mechanisms: &Element) -> Self {
        let offered = mechanisms
            .children()
            .filter(|child| child.name() == "mechanism")
            .map(|child| child.text().trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        Self {
            offered,
            mechanism: None,
            state: SaslState::Idle,
        }
    }

    pub fn offered(&self) -> &[String] {
        &self.offered
    }

    pub fn needs_restart(&self) -> bool {
        self.state == SaslState::Succeeded
    }

    pub(super) fn begin(
        &mut self,
        ctx: &mut NegotiationContext<'_>,
    ) -> Result<Vec<FeatureAction>, ClientError> {
        let name = ctx
            .mechanisms
            .select(&self.offered, &ctx.options.preferred_sasl_mechanisms)
            .ok_or_else(|| ClientError::NoMechanism {
                offered: self.offered.clone(),
            })?
            .to_string();

        let mut mechanism = ctx.mechanisms.create(&name)?;
        info!(mechanism = %name, hostname = ctx.hostname, "authenticating");
        let step = mechanism.begin(ctx.hostname);
        self.mechanism = Some(mechanism);

        Ok(match step {
            SaslStep::Respond(initial) => {
                self.state = SaslState::Exchanging;
                vec![FeatureAction::Send(
                    Element::builder("auth", ns::SASL)
                        .attr("mechanism", name)
                        .append(encode(&initial))
                        .build(),
                )]
            }
            SaslStep::Abort => self.abort(),
        })
    }

    pub(super) fn handle_document(&mut self, document: &Element) -> Result<Handled, ClientError> {
        if document.ns() != ns::SASL {
            return Ok(Handled::Ignored);
        }

        match (document.name(), self.state) {
            ("challenge", SaslState::Exchanging) => {
                let challenge = decode(&document.text())?;
                let Some(mechanism) = self.mechanism.as_mut() else {
                    return Ok(Handled::Ignored);
                };
                let actions = match mechanism.handle_challenge(&challenge) {
                    SaslStep::Respond(response) => vec![FeatureAction::Send(
                        Element::builder("response", ns::SASL)
                            .append(encode(&response))
                            .build(),
                    )],
                    SaslStep::Abort => self.abort(),
                };
                Ok(Handled::Consumed(actions))
            }
            ("success", SaslState::Exchanging) => {
                let additional = decode(&document.text())?;
                if let Some(mechanism) = self.mechanism.as_mut() {
                    mechanism.verify_success(&additional)?;
                }
                self.state = SaslState::Succeeded;
                info!("authenticated");
                Ok(Handled::Consumed(vec![FeatureAction::Complete]))
            }
            ("failure", SaslState::Exchanging | SaslState::Aborting) => {
                Err(SaslError::from_failure(document).into())
            }
            _ => Ok(Handled::Ignored),
        }
    }

    fn abort(&mut self) -> Vec<FeatureAction> {
        debug!("aborting SASL exchange");
        self.state = SaslState::Aborting;
        vec![FeatureAction::Send(Element::builder("abort", ns::SASL).build())]
    }
}

/// Empty payloads travel as `=`.
fn encode(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        STANDARD.encode(data)
    }
}

fn decode(text: &str) -> Result<Vec<u8>, SaslError> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(text)
        .map_err(|error| SaslError::with_text(SaslCondition::IncorrectEncoding, error.to_string()))
}
