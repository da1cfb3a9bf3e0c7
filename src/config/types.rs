use serde::{Deserialize, Serialize};

use crate::device::constants::{CONNECT_DEADLINE, RETRY_INTERVAL};
use crate::device::types::SelectedDevice;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:4352";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// address the client server listens on
    pub listen: String,
    pub retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// stop the bridge when the last client has gone away
    pub exit_when_idle: bool,
    /// instruments offered when selecting a device
    pub known_devices: Vec<SelectedDevice>,
    pub selected_device: Option<SelectedDevice>,
}

impl Config {
    /// Drop known devices with a duplicate address (keeping the first) and make sure the selected
    /// device is among them.
    pub fn normalize_known_devices(&mut self) {
        let mut seen: Vec<String> = Vec::new();
        self.known_devices.retain(|device| {
            if seen.contains(&device.address) {
                return false;
            }
            seen.push(device.address.clone());
            true
        });

        if let Some(selected) = &self.selected_device {
            if !seen.contains(&selected.address) {
                self.known_devices.push(selected.clone());
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: DEFAULT_LISTEN.to_string(),
            retry_interval_ms: RETRY_INTERVAL,
            connect_timeout_ms: CONNECT_DEADLINE,
            exit_when_idle: false,
            known_devices: Vec::new(),
            selected_device: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_use_defaults() {
        let config: Config = serde_json::from_str(r#"{"exitWhenIdle": true}"#).unwrap();
        assert!(config.exit_when_idle);
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.retry_interval_ms, 15000);
        assert_eq!(config.selected_device, None);
    }

    #[test]
    fn selected_device_round_trips_through_json() {
        let mut config = Config::default();
        config.selected_device = Some(SelectedDevice::new("00:11:22:AA:BB:CC", Some("BlueFly".to_string())));

        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"selectedDevice\""));
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn normalize_removes_duplicates_and_adds_selected() {
        let mut config = Config::default();
        config.known_devices = vec![
            SelectedDevice::new("a:1", Some("first".to_string())),
            SelectedDevice::new("a:1", Some("second".to_string())),
            SelectedDevice::new("b:2", None),
        ];
        config.selected_device = Some(SelectedDevice::new("c:3", None));

        config.normalize_known_devices();

        let addresses: Vec<&str> = config.known_devices.iter().map(|device| device.address.as_str()).collect();
        assert_eq!(addresses, vec!["a:1", "b:2", "c:3"]);
        assert_eq!(config.known_devices[0].name.as_deref(), Some("first"));
    }
}
