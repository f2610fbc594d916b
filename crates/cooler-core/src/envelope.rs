//! Wire framing for [`ControlMessage`] over MQTT.
//!
//! The topic-label-plus-body framing maps naturally onto MQTT's topic
//! string plus publish payload, so this module only has to handle the
//! payload's JSON shape and a couple of topic-name helpers.

use crate::model::{ControlMessage, FaultState};

/// Default topic label the controller publishes to.
pub const DEFAULT_CONTROL_TOPIC: &str = "cooler/control";
/// Default topic label the proxy re-publishes to for downstream subscribers.
pub const DEFAULT_RELAY_TOPIC: &str = "cooler/relay";
/// Default topic the actuator reports its current hardware fault state on,
/// retained so a reconnecting controller immediately learns the last state
/// instead of waiting for the next transition.
pub const DEFAULT_FAULT_TOPIC: &str = "cooler/fault";

/// Serialize a [`ControlMessage`] to its MQTT payload.
pub fn encode(msg: &ControlMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Parse an MQTT payload into a [`ControlMessage`].
pub fn decode(payload: &[u8]) -> Result<ControlMessage, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Serialize a [`FaultState`] for the actuator's fault-status topic — the
/// feed that lets the controller's publisher advertise `state=FAULT`
/// even though the fault itself is detected in a different process.
pub fn encode_fault_state(state: FaultState) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&state)
}

/// Parse an actuator fault-status payload.
pub fn decode_fault_state(payload: &[u8]) -> Result<FaultState, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ControlState, Duty};
    use time::OffsetDateTime;

    fn sample() -> ControlMessage {
        ControlMessage {
            message_id: 42,
            ts: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            mode_index: 1,
            state: ControlState::Running,
            duty: Duty {
                enable: true,
                on_sec: 60,
                off_sec: 120,
            },
        }
    }

    #[test]
    fn encode_decode_roundtrip_is_identity() {
        let original = sample();
        let bytes = encode(&original).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.message_id, original.message_id);
        assert_eq!(decoded.mode_index, original.mode_index);
        assert_eq!(decoded.state, original.state);
        assert_eq!(decoded.duty, original.duty);
        assert_eq!(decoded.ts, original.ts);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"not json").is_err());
    }

    #[test]
    fn decode_rejects_missing_fields() {
        assert!(decode(br#"{"message_id": 1}"#).is_err());
    }

    #[test]
    fn fault_state_roundtrips() {
        let bytes = encode_fault_state(FaultState::NoFlowWhileOpen).unwrap();
        assert_eq!(decode_fault_state(&bytes).unwrap(), FaultState::NoFlowWhileOpen);
    }
}
