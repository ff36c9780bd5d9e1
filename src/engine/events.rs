//! Post-commit engine events
//!
//! Events are published only after the ledger commit succeeded. Publishing
//! never blocks a trade: a full or closed channel drops the event and logs it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use super::types::{EntityId, GraduationRecord, TradeKind};

/// Event emitted after a successful commit
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A trade was applied to the ledger
    TradeExecuted(TradeExecuted),
    /// Graduation liquidity must be added on chain
    GraduationRequested {
        token_address: String,
        record: GraduationRecord,
    },
    /// Graduation confirmed and the curve is closed
    Graduated {
        entity_id: EntityId,
        pool_address: String,
    },
    /// Graduation attempt reported as failed
    GraduationFailed {
        entity_id: EntityId,
        attempt: u32,
        reason: String,
    },
}

impl EngineEvent {
    pub fn entity_id(&self) -> &str {
        match self {
            EngineEvent::TradeExecuted(trade) => &trade.entity_id,
            EngineEvent::GraduationRequested { record, .. } => &record.entity_id,
            EngineEvent::Graduated { entity_id, .. } => entity_id,
            EngineEvent::GraduationFailed { entity_id, .. } => entity_id,
        }
    }
}

/// Data needed to build the chain payload for an applied trade
#[derive(Debug, Clone, PartialEq)]
pub struct TradeExecuted {
    pub entity_id: EntityId,
    pub token_address: String,
    pub kind: TradeKind,
    pub trader: String,
    pub amount_in: u64,
    /// Tokens for buys, settlement for sells
    pub amount_out: u64,
    /// Slippage floor the trader asked for
    pub min_out: u64,
    /// Idempotency key for the chain hand-off
    pub idempotency_key: String,
}

/// Non-blocking publisher for engine events
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<EngineEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Bounded channel with its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Sink that discards everything
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        if let Err(e) = tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let event = match &e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            };
            warn!(
                entity = %event.entity_id(),
                dropped,
                "Engine event not delivered: {}",
                e
            );
        }
    }

    /// Number of events that could not be delivered
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graduated(id: &str) -> EngineEvent {
        EngineEvent::Graduated {
            entity_id: id.into(),
            pool_address: "0xpool".into(),
        }
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let (sink, mut rx) = EventSink::channel(4);
        sink.publish(graduated("tok"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity_id(), "tok");
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_full_channel_drops() {
        let (sink, _rx) = EventSink::channel(1);
        sink.publish(graduated("a"));
        sink.publish(graduated("b"));
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_disabled_sink() {
        let sink = EventSink::disabled();
        sink.publish(graduated("a"));
        assert_eq!(sink.dropped(), 0);
    }
}
