use serde::{Deserialize, Serialize};

use crate::device::types::Action;

/// Messages pushed to clients, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    PressureUpdate {
        pressure_raw: i32,
        timestamp_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    BatteryUpdate {
        millivolts: i32,
        timestamp_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    StateUpdate {
        /// ordinal of the ConnectionState
        state: u8,
        timestamp_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    action: u8,
}

/// A client request is the ordinal of an `Action`, either as plain text (`5`) or as JSON
/// (`{"action": 5}`).
pub fn parse_request(line: &str) -> Option<Action> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let ordinal = match line.parse::<u8>() {
        Ok(ordinal) => ordinal,
        Err(_) => serde_json::from_str::<ActionRequest>(line).ok()?.action,
    };

    Action::from_ordinal(ordinal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_update_wire_format() {
        let message = ClientMessage::StateUpdate {
            state: 6,
            timestamp_ms: 1700000000000,
            device_name: Some("BlueFly".to_string()),
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"type":"stateUpdate","state":6,"timestampMs":1700000000000,"deviceName":"BlueFly"}"#
        );

        let message = ClientMessage::StateUpdate { state: 3, timestamp_ms: 1, device_name: None };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"type":"stateUpdate","state":3,"timestampMs":1}"#
        );
    }

    #[test]
    fn sensor_update_wire_format() {
        let message = ClientMessage::PressureUpdate { pressure_raw: 101325, timestamp_ms: 40 };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"type":"pressureUpdate","pressureRaw":101325,"timestampMs":40}"#
        );

        let message: ClientMessage =
            serde_json::from_str(r#"{"type":"batteryUpdate","millivolts":4100,"timestampMs":60}"#).unwrap();
        assert_eq!(message, ClientMessage::BatteryUpdate { millivolts: 4100, timestamp_ms: 60 });
    }

    #[test]
    fn parses_requests() {
        assert_eq!(parse_request("5\n"), Some(Action::RegisterClient));
        assert_eq!(parse_request(r#"{"action": 1}"#), Some(Action::Disconnect));
        assert_eq!(parse_request("9"), None);
        assert_eq!(parse_request("connect"), None);
        assert_eq!(parse_request(""), None);
    }
}
