use serde::{Deserialize, Serialize};

/// State of the connection to the instrument.
///
/// The discriminant is sent to clients, so the order must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init = 0,
    NotSupported = 1,
    RadioOff = 2,
    SelectingDevice = 3,
    Connecting = 4,
    Reconnecting = 5,
    Connected = 6,
    ConnectionFailed = 7,
    Disconnected = 8,
}

impl ConnectionState {
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            ConnectionState::Init => "Init",
            ConnectionState::NotSupported => "NotSupported",
            ConnectionState::RadioOff => "RadioOff",
            ConnectionState::SelectingDevice => "SelectingDevice",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::ConnectionFailed => "ConnectionFailed",
            ConnectionState::Disconnected => "Disconnected",
        };

        write!(f, "{}", result)
    }
}

/// Actions a client may request. Remote clients send the ordinal rather than the name, so the
/// order must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect = 0,
    Disconnect = 1,
    CancelConnecting = 2,
    EnableRadio = 3,
    SelectDevice = 4,
    RegisterClient = 5,
    UnregisterClient = 6,
}

impl Action {
    const ALL: [Action; 7] = [
        Action::Connect,
        Action::Disconnect,
        Action::CancelConnecting,
        Action::EnableRadio,
        Action::SelectDevice,
        Action::RegisterClient,
        Action::UnregisterClient,
    ];

    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Action> {
        Action::ALL.get(usize::from(ordinal)).copied()
    }
}

/// The instrument the bridge connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedDevice {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl SelectedDevice {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        SelectedDevice { address: address.into(), name }
    }

    /// The name shown to clients: the human readable name if known, otherwise the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Pressure { pressure: i32, time_ms: i64 },
    Battery { volts: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_ordinals_are_stable() {
        assert_eq!(Action::from_ordinal(0), Some(Action::Connect));
        assert_eq!(Action::from_ordinal(4), Some(Action::SelectDevice));
        assert_eq!(Action::from_ordinal(6), Some(Action::UnregisterClient));
        assert_eq!(Action::from_ordinal(7), None);
        assert_eq!(Action::RegisterClient.ordinal(), 5);
    }

    #[test]
    fn state_ordinals_are_stable() {
        assert_eq!(ConnectionState::Init.ordinal(), 0);
        assert_eq!(ConnectionState::SelectingDevice.ordinal(), 3);
        assert_eq!(ConnectionState::ConnectionFailed.ordinal(), 7);
        assert_eq!(ConnectionState::Disconnected.ordinal(), 8);
    }

    #[test]
    fn display_name_falls_back_to_address() {
        let device = SelectedDevice::new("00:11:22:33:44:55", None);
        assert_eq!(device.display_name(), "00:11:22:33:44:55");

        let device = SelectedDevice::new("00:11:22:33:44:55", Some("BlueFly".to_string()));
        assert_eq!(device.display_name(), "BlueFly");
    }
}
