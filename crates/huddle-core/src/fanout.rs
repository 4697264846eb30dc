//! Fire-and-forget delivery to session sinks.
//!
//! Sinks are bounded queues drained by each connection's writer task. The
//! coordinator only ever calls `try_send`, so a full or closed sink costs one
//! dropped delivery and never stalls the coordinator or the other recipients.

use crate::message::Message;
use crate::session::{Outbound, Session, SessionId, Sink};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

/// Outcome of handing one item to one sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the writer.
    Queued,
    /// The sink is full; the item was dropped.
    Full,
    /// The writer is gone; the item was dropped.
    Closed,
}

/// Counts from one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    /// Recipients whose sink accepted the message.
    pub delivered: usize,
    /// Recipients whose sink was full or closed.
    pub dropped: usize,
}

impl FanoutReport {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Queued => self.delivered += 1,
            Delivery::Full | Delivery::Closed => self.dropped += 1,
        }
    }
}

/// Hand one item to a sink without waiting.
pub fn deliver(sink: &Sink, outbound: Outbound) -> Delivery {
    match sink.try_send(outbound) {
        Ok(()) => Delivery::Queued,
        Err(TrySendError::Full(_)) => Delivery::Full,
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

/// Deliver `message` to every session in `recipients` except `except`.
pub fn broadcast<'a>(
    recipients: impl IntoIterator<Item = &'a Session>,
    except: Option<SessionId>,
    message: Message,
) -> FanoutReport {
    let message = Arc::new(message);
    let mut report = FanoutReport::default();

    for session in recipients {
        if Some(session.id) == except {
            continue;
        }
        let delivery = deliver(session.sink(), Outbound::Message(Arc::clone(&message)));
        if delivery != Delivery::Queued {
            warn!(
                session = %session.id,
                scope = %message.scope,
                outcome = ?delivery,
                "Dropped broadcast delivery"
            );
        }
        report.record(delivery);
    }

    trace!(
        scope = %message.scope,
        delivered = report.delivered,
        dropped = report.dropped,
        "Broadcast complete"
    );
    report
}
