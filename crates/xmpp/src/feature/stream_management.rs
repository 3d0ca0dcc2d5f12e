use tracing::{info, warn};
use xmpp_parsers::minidom::Element;

use super::{FeatureAction, Handled, NegotiationContext};
use crate::error::ClientError;
use crate::stanza::ns;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Idle,
    Resuming { previd: String },
    Enabling,
}

/// XEP-0198 negotiation: resumes the ledger's previous session when it is
/// resumable, otherwise enables a fresh one.
#[derive(Debug)]
pub struct StreamManagementFeature {
    mode: Mode,
}

impl Default for StreamManagementFeature {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManagementFeature {
    pub fn new() -> Self {
        Self { mode: Mode::Idle }
    }

    pub fn is_resuming(&self) -> bool {
        matches!(self.mode, Mode::Resuming { .. })
    }

    pub(super) fn begin(&mut self, ctx: &mut NegotiationContext<'_>) -> Vec<FeatureAction> {
        if let Some(previd) = ctx.ledger.stream_id().filter(|_| ctx.ledger.is_resumable()) {
            let previd = previd.to_string();
            info!(%previd, h = ctx.ledger.received_count(), "resuming stream");
            let resume = Element::builder("resume", ns::SM)
                .attr("previd", previd.clone())
                .attr("h", ctx.ledger.received_count().to_string())
                .build();
            self.mode = Mode::Resuming { previd };
            return vec![FeatureAction::Send(resume)];
        }

        if !ctx.options.stream_management {
            return vec![FeatureAction::Complete];
        }

        self.mode = Mode::Enabling;
        vec![FeatureAction::Send(
            Element::builder("enable", ns::SM)
                .attr("resume", "true")
                .build(),
        )]
    }

    pub(super) fn handle_document(
        &mut self,
        document: &Element,
        ctx: &mut NegotiationContext<'_>,
    ) -> Result<Handled, ClientError> {
        if document.ns() != ns::SM {
            return Ok(Handled::Ignored);
        }

        match (&self.mode, document.name()) {
            (Mode::Resuming { previd }, "resumed") => {
                if document.attr("previd") != Some(previd.as_str()) {
                    return Err(ClientError::MalformedDocument(format!(
                        "resumed unknown session {:?}",
                        document.attr("previd")
                    )));
                }
                let h = parse_h(document)?.ok_or_else(|| {
                    ClientError::MalformedDocument("<resumed/> without h".into())
                })?;
                let acknowledged = ctx.ledger.on_ack(h)?;
                ctx.ledger.mark_resumed();
                info!(
                    acknowledged,
                    pending = ctx.ledger.unacknowledged_len(),
                    "stream resumed"
                );
                self.mode = Mode::Idle;
                Ok(Handled::Consumed(vec![
                    FeatureAction::Resumed,
                    FeatureAction::Complete,
                ]))
            }
            (Mode::Resuming { .. }, "failed") => {
                if let Some(h) = parse_h(document)? {
                    ctx.ledger.on_ack(h)?;
                }
                warn!("stream resumption refused, starting a new session");
                ctx.ledger.cancel_unacknowledged();
                ctx.ledger.reset();
                self.mode = Mode::Idle;
                Ok(Handled::Consumed(vec![FeatureAction::ResumeFailed]))
            }
            (Mode::Enabling, "enabled") => {
                let resume = matches!(document.attr("resume"), Some("true" | "1"));
                let max = document.attr("max").and_then(|max| max.parse().ok());
                ctx.ledger.enable(
                    document.attr("id").map(str::to_string),
                    resume,
                    max,
                    document.attr("location").map(str::to_string),
                );
                self.mode = Mode::Idle;
                Ok(Handled::Consumed(vec![FeatureAction::Complete]))
            }
            (Mode::Enabling, "failed") => Err(ClientError::FeatureRejected {
                feature: "stream-management",
            }),
            _ => Ok(Handled::Ignored),
        }
    }
}

fn parse_h(document: &Element) -> Result<Option<u32>, ClientError> {
    document
        .attr("h")
        .map(|h| {
            h.parse()
                .map_err(|_| ClientError::MalformedDocument(format!("invalid h '{h}'")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;

    use super::*;
    use crate::feature::test_context::{Fixture, consumed, sent};
    use crate::stream_management::AckCallback;

    fn sm(name: &str, attrs: &[(&str, &str)]) -> Element {
        let mut builder = Element::builder(name, ns::SM);
        for (key, value) in attrs {
            builder = builder.attr(*key, *value);
        }
        builder.build()
    }

    fn message(n: u32) -> Element {
        Element::builder("message", ns::JABBER_CLIENT)
            .attr("id", format!("m{n}"))
            .build()
    }

    /// Ledger of a suspended session: five sent, three acknowledged.
    fn suspended(fixture: &mut Fixture, log: &Arc<Mutex<Vec<String>>>) {
        fixture.ledger.enable(Some("sess-1".into()), true, Some(300), None);
        for n in 1..=5 {
            let log = Arc::clone(log);
            let callback: AckCallback = Box::new(move |result| {
                log.lock().unwrap().push(format!("m{n}:{}", result.is_ok()));
            });
            fixture.ledger.record_sent(message(n), Some(callback)).unwrap();
        }
        fixture.ledger.on_ack(3).unwrap();
        fixture.ledger.record_received();
    }

    #[test]
    fn enables_a_fresh_session() {
        let mut fixture = Fixture::new();
        let mut feature = StreamManagementFeature::new();

        let actions = feature.begin(&mut fixture.ctx());
        let enable = sent(&actions)[0];
        assert!(enable.is("enable", ns::SM));
        assert_eq!(enable.attr("resume"), Some("true"));

        let enabled = sm("enabled", &[("id", "abc"), ("resume", "true"), ("max", "600")]);
        let actions = consumed(feature.handle_document(&enabled, &mut fixture.ctx()).unwrap());
        assert_eq!(actions, vec![FeatureAction::Complete]);
        assert!(fixture.ledger.is_enabled());
        assert!(fixture.ledger.is_resumable());
        assert_eq!(fixture.ledger.max_resumption_time(), Some(600));
    }

    #[test]
    fn enable_failure_is_rejection() {
        let mut fixture = Fixture::new();
        let mut feature = StreamManagementFeature::new();
        feature.begin(&mut fixture.ctx());
        assert_matches!(
            feature.handle_document(&sm("failed", &[]), &mut fixture.ctx()),
            Err(ClientError::FeatureRejected { feature: "stream-management" })
        );
    }

    #[test]
    fn disabled_by_options() {
        let mut fixture = Fixture::new();
        fixture.options.stream_management = false;
        let mut feature = StreamManagementFeature::new();
        assert_eq!(feature.begin(&mut fixture.ctx()), vec![FeatureAction::Complete]);
    }

    #[test]
    fn resumption_keeps_unacknowledged_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fixture = Fixture::new();
        suspended(&mut fixture, &log);

        let mut feature = StreamManagementFeature::new();
        let actions = feature.begin(&mut fixture.ctx());
        assert!(feature.is_resuming());
        let resume = sent(&actions)[0];
        assert_eq!(resume.attr("previd"), Some("sess-1"));
        assert_eq!(resume.attr("h"), Some("1"));

        let resumed = sm("resumed", &[("previd", "sess-1"), ("h", "3")]);
        let actions = consumed(feature.handle_document(&resumed, &mut fixture.ctx()).unwrap());
        assert_eq!(actions, vec![FeatureAction::Resumed, FeatureAction::Complete]);

        assert!(fixture.ledger.is_resumed());
        let pending: Vec<_> = fixture
            .ledger
            .unacknowledged()
            .map(|(seq, doc)| (seq, doc.attr("id").unwrap().to_string()))
            .collect();
        assert_eq!(pending, vec![(4, "m4".to_string()), (5, "m5".to_string())]);
        assert_eq!(*log.lock().unwrap(), vec!["m1:true", "m2:true", "m3:true"]);
    }

    #[test]
    fn resumed_ack_regression_is_fatal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fixture = Fixture::new();
        suspended(&mut fixture, &log);

        let mut feature = StreamManagementFeature::new();
        feature.begin(&mut fixture.ctx());
        let resumed = sm("resumed", &[("previd", "sess-1"), ("h", "2")]);
        assert_matches!(
            feature.handle_document(&resumed, &mut fixture.ctx()),
            Err(ClientError::Stream(_))
        );
    }

    #[test]
    fn refused_resumption_with_regressed_h_is_fatal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fixture = Fixture::new();
        suspended(&mut fixture, &log);

        let mut feature = StreamManagementFeature::new();
        feature.begin(&mut fixture.ctx());
        let failed = sm("failed", &[("h", "1")]);
        assert_matches!(
            feature.handle_document(&failed, &mut fixture.ctx()),
            Err(ClientError::Stream(_))
        );

        // Nothing was abandoned on the strength of the bad count.
        assert_eq!(fixture.ledger.acknowledged_count(), 3);
        assert_eq!(fixture.ledger.unacknowledged_len(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["m1:true", "m2:true", "m3:true"]);
    }

    #[test]
    fn refused_resumption_with_invalid_h_is_malformed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fixture = Fixture::new();
        suspended(&mut fixture, &log);

        let mut feature = StreamManagementFeature::new();
        feature.begin(&mut fixture.ctx());
        assert_matches!(
            feature.handle_document(&sm("failed", &[("h", "many")]), &mut fixture.ctx()),
            Err(ClientError::MalformedDocument(_))
        );
    }

    #[test]
    fn refused_resumption_without_h_abandons_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fixture = Fixture::new();
        suspended(&mut fixture, &log);

        let mut feature = StreamManagementFeature::new();
        feature.begin(&mut fixture.ctx());
        let actions = consumed(feature.handle_document(&sm("failed", &[]), &mut fixture.ctx()).unwrap());
        assert_eq!(actions, vec![FeatureAction::ResumeFailed]);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["m1:true", "m2:true", "m3:true", "m4:false", "m5:false"]
        );
    }

    #[test]
    fn refused_resumption_clears_the_ledger() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fixture = Fixture::new();
        suspended(&mut fixture, &log);

        let mut feature = StreamManagementFeature::new();
        feature.begin(&mut fixture.ctx());
        let failed = sm("failed", &[("h", "4")]);
        let actions = consumed(feature.handle_document(&failed, &mut fixture.ctx()).unwrap());
        assert_eq!(actions, vec![FeatureAction::ResumeFailed]);

        assert!(!fixture.ledger.is_resumable());
        assert_eq!(fixture.ledger.unacknowledged().count(), 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["m1:true", "m2:true", "m3:true", "m4:true", "m5:false"]
        );

        // A fresh session is enabled next.
        let mut feature = StreamManagementFeature::new();
        let actions = feature.begin(&mut fixture.ctx());
        assert!(sent(&actions)[0].is("enable", ns::SM));
    }

    #[test]
    fn resumption_of_another_session_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fixture = Fixture::new();
        suspended(&mut fixture, &log);

        let mut feature = StreamManagementFeature::new();
        feature.begin(&mut fixture.ctx());
        let resumed = sm("resumed", &[("previd", "other"), ("h", "3")]);
        assert_matches!(
            feature.handle_document(&resumed, &mut fixture.ctx()),
            Err(ClientError::MalformedDocument(_))
        );
    }
}
