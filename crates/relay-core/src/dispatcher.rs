//! Broker handler for the signaling topic.

use async_trait::async_trait;
use relay_broker::{HandleError, Record, RecordHandler};
use relay_protocol::{codec, Signal, SignalingEnvelope};
use tracing::{debug, warn};

use crate::engine::NegotiationEngine;

/// Decodes signaling records and hands them to the [`NegotiationEngine`].
///
/// Each record is a transport message whose payload is a signal envelope.
/// Undecodable records are reported as malformed; engine errors, including an
/// unknown session, are reported as failures and left uncommitted.
pub struct SignalDispatcher {
    engine: NegotiationEngine,
}

impl SignalDispatcher {
    #[must_use]
    pub fn new(engine: NegotiationEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl RecordHandler for SignalDispatcher {
    async fn handle(&self, record: &Record) -> Result<(), HandleError> {
        let message = codec::decode_message(&record.value)
            .map_err(|e| HandleError::Malformed(e.to_string()))?;

        let envelope = match codec::decode_signal(message.payload.as_bytes()) {
            Ok(Signal::Known(envelope)) => envelope,
            Ok(Signal::Unknown(kind)) => {
                warn!(kind = %kind, producer = %message.producer, "Unknown signal type");
                return Ok(());
            }
            Err(e) => return Err(HandleError::Malformed(e.to_string())),
        };

        debug!(
            kind = %envelope.kind(),
            session = %envelope.session_id(),
            offset = record.offset,
            "Dispatching signal"
        );

        let result = match envelope {
            SignalingEnvelope::Offer(offer) => self.engine.handle_offer(offer).await,
            SignalingEnvelope::Answer(answer) => self.engine.handle_answer(answer).await,
            SignalingEnvelope::Candidate(candidate) => self.engine.handle_candidate(candidate).await,
        };
        result.map_err(HandleError::failed)
    }
}
