use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use bluer;
use serde_json;

use crate::device::link::ConnectMode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Connection to the instrument was refused or failed: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Connecting to the instrument took too long")]
    Timeout,

    #[error("Error communicating with bluetoothd: {source}")]
    Bluetooth { #[from] source: bluer::Error },

    #[error("{0:?} is not a bluetooth address")]
    InvalidAddress(String),

    #[error("bluetoothd stopped handing out serial port connections")]
    ProfileClosed,

    #[error("Connection mode {0:?} is not supported for this device")]
    Unsupported(ConnectMode),

    #[error("No connection mode is available for this device")]
    NoModeAvailable,
}

#[derive(Error, Debug)]
pub enum RadioError {
    #[error("No bluetooth adapter is available")]
    Unavailable,

    #[error("Error communicating with the bluetooth adapter (bluez): {source}")]
    Bluez { #[from] source: bluer::Error },
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to listen for clients on {address}: {source}")]
    Bind { address: String, source: io::Error },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start bridge (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start bridge (client server): {source}")]
    ServerError { #[from] source: ServerError },

    #[error("Failed to start bridge (runtime): {source}")]
    Runtime { source: io::Error },
}
