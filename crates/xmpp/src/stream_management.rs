use std::collections::BTreeMap;

use tracing::{debug, warn};
use xmpp_parsers::minidom::Element;

use crate::error::{ClientError, LedgerError};
use crate::stanza::ns;

/// Invoked once per sent document: `Ok` when the peer acknowledged it,
/// `Err(NotDelivered)` when it was abandoned.
pub type AckCallback = Box<dyn FnOnce(Result<(), ClientError>) + Send>;

struct PendingAck {
    document: Element,
    callback: Option<AckCallback>,
}

/// XEP-0198 bookkeeping that outlives a single connection.
///
/// Keys of the unacknowledged queue are always the contiguous range
/// `(acknowledged_count, sent_count]`.
#[derive(Default)]
pub struct StreamManagementLedger {
    enabled: bool,
    resumable: bool,
    resumed: bool,
    stream_id: Option<String>,
    location: Option<String>,
    max_resumption_time: Option<u32>,
    sent_count: u32,
    received_count: u32,
    acknowledged_count: u32,
    unacknowledged: BTreeMap<u32, PendingAck>,
}

impl std::fmt::Debug for StreamManagementLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManagementLedger")
            .field("enabled", &self.enabled)
            .field("resumable", &self.resumable)
            .field("resumed", &self.resumed)
            .field("stream_id", &self.stream_id)
            .field("sent_count", &self.sent_count)
            .field("received_count", &self.received_count)
            .field("acknowledged_count", &self.acknowledged_count)
            .field("unacknowledged", &self.unacknowledged.len())
            .finish()
    }
}

impl StreamManagementLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// A previous session can be resumed on the next connection.
    pub fn is_resumable(&self) -> bool {
        self.resumable && self.stream_id.is_some()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// Preferred reconnection address from `<enabled location=…/>`.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn max_resumption_time(&self) -> Option<u32> {
        self.max_resumption_time
    }

    pub fn sent_count(&self) -> u32 {
        self.sent_count
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn acknowledged_count(&self) -> u32 {
        self.acknowledged_count
    }

    /// Start a fresh session after `<enabled/>`.
    pub fn enable(
        &mut self,
        stream_id: Option<String>,
        resume: bool,
        max_resumption_time: Option<u32>,
        location: Option<String>,
    ) {
        self.enabled = true;
        self.resumed = false;
        self.resumable = resume && stream_id.is_some();
        self.stream_id = stream_id;
        self.max_resumption_time = max_resumption_time;
        self.location = location;
        self.sent_count = 0;
        self.received_count = 0;
        self.acknowledged_count = 0;
        self.unacknowledged.clear();
        debug!(
            stream_id = ?self.stream_id,
            resumable = self.resumable,
            "stream management enabled"
        );
    }

    /// The previous session continues after `<resumed/>`.
    pub fn mark_resumed(&mut self) {
        self.enabled = true;
        self.resumed = true;
    }

    /// Queue a sent document. Returns its sequence number.
    ///
    /// Sequence numbers never wrap: once `u32::MAX` documents were sent the
    /// session cannot track more, the callback reports `NotDelivered` and
    /// the session stops being resumable.
    pub fn record_sent(
        &mut self,
        document: Element,
        callback: Option<AckCallback>,
    ) -> Result<u32, LedgerError> {
        let Some(seq) = self.sent_count.checked_add(1) else {
            warn!(sent = self.sent_count, "stream-management sequence exhausted");
            self.resumable = false;
            if let Some(callback) = callback {
                callback(Err(ClientError::NotDelivered));
            }
            return Err(LedgerError::SequenceExhausted);
        };
        self.sent_count = seq;
        self.unacknowledged.insert(seq, PendingAck { document, callback });
        Ok(seq)
    }

    pub fn record_received(&mut self) {
        self.received_count = self.received_count.wrapping_add(1);
    }

    /// Apply the peer's `h`. Entries up to and including `count` complete in
    /// send order.
    pub fn on_ack(&mut self, count: u32) -> Result<usize, LedgerError> {
        if count < self.acknowledged_count {
            warn!(
                acknowledged = self.acknowledged_count,
                received = count,
                "peer acknowledgement regressed"
            );
            return Err(LedgerError::AckRegression {
                acknowledged: self.acknowledged_count,
                received: count,
            });
        }
        if count > self.sent_count {
            return Err(LedgerError::AckTooHigh {
                sent: self.sent_count,
                received: count,
            });
        }

        let still_pending = match count.checked_add(1) {
            Some(next) => self.unacknowledged.split_off(&next),
            None => BTreeMap::new(),
        };
        let acked = std::mem::replace(&mut self.unacknowledged, still_pending);
        self.acknowledged_count = count;

        let completed = acked.len();
        for (_, pending) in acked {
            if let Some(callback) = pending.callback {
                callback(Ok(()));
            }
        }
        if completed > 0 {
            debug!(h = count, completed, "stanzas acknowledged");
        }
        Ok(completed)
    }

    /// `<r/>`
    pub fn request_ack(&self) -> Element {
        Element::builder("r", ns::SM).build()
    }

    /// `<a h=received/>`
    pub fn ack(&self) -> Element {
        Element::builder("a", ns::SM)
            .attr("h", self.received_count.to_string())
            .build()
    }

    /// Unacknowledged documents in send order.
    pub fn unacknowledged(&self) -> impl Iterator<Item = (u32, &Element)> {
        self.unacknowledged
            .iter()
            .map(|(seq, pending)| (*seq, &pending.document))
    }

    pub fn unacknowledged_len(&self) -> usize {
        self.unacknowledged.len()
    }

    /// Fail every pending callback with `NotDelivered`, in send order.
    pub fn cancel_unacknowledged(&mut self) -> usize {
        let abandoned = std::mem::take(&mut self.unacknowledged);
        self.acknowledged_count = self.sent_count;

        let count = abandoned.len();
        for (_, pending) in abandoned {
            if let Some(callback) = pending.callback {
                callback(Err(ClientError::NotDelivered));
            }
        }
        if count > 0 {
            debug!(count, "abandoned unacknowledged stanzas");
        }
        count
    }

    /// Forget the session. Callers cancel first; pending callbacks are dropped.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
