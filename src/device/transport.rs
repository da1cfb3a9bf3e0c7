use bluer::rfcomm::{Profile, Role, SocketAddr, Stream};
use bluer::{Adapter, Address, Session};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use log::debug;

use crate::device::constants::{FALLBACK_RFCOMM_CHANNEL, SERIAL_PORT_UUID};
use crate::device::link::{BoxedStream, ConnectMode, Transport};
use crate::device::types::SelectedDevice;
use crate::error::ConnectError;

/// Serial port over bluetooth classic (RFCOMM) through BlueZ.
///
/// The primary mode asks bluetoothd to connect the Serial Port Profile, which looks the channel up
/// in the device's service records and authenticates the link. The fallback mode skips the lookup
/// and opens a plain socket on a fixed channel, for instruments that do not publish the profile.
#[derive(Clone)]
pub struct RfcommTransport {
    session: Option<Session>,
    adapter: Option<Adapter>,
}

impl RfcommTransport {
    pub fn new(session: Option<Session>, adapter: Option<Adapter>) -> Self {
        RfcommTransport { session, adapter }
    }
}

/// The bluetooth address of `device`, if it has a valid one.
pub fn device_address(device: &SelectedDevice) -> Option<Address> {
    device.address.trim().parse::<Address>().ok()
}

impl Transport for RfcommTransport {
    fn supports(&self, device: &SelectedDevice, mode: ConnectMode) -> bool {
        if device_address(device).is_none() {
            return false;
        }

        match mode {
            ConnectMode::Primary => self.session.is_some() && self.adapter.is_some(),
            ConnectMode::Fallback => true,
        }
    }

    fn open<'a>(&'a self, device: &'a SelectedDevice, mode: ConnectMode) -> BoxFuture<'a, Result<BoxedStream, ConnectError>> {
        async move {
            let address = device_address(device)
                .ok_or_else(|| ConnectError::InvalidAddress(device.address.clone()))?;

            let stream = match mode {
                ConnectMode::Primary => {
                    let session = self.session.as_ref().ok_or(ConnectError::Unsupported(mode))?;
                    let adapter = self.adapter.as_ref().ok_or(ConnectError::Unsupported(mode))?;
                    connect_serial_profile(session, adapter, address).await?
                },
                ConnectMode::Fallback => {
                    debug!("Opening rfcomm channel {} on {}", FALLBACK_RFCOMM_CHANNEL, address);
                    Stream::connect(SocketAddr::new(address, FALLBACK_RFCOMM_CHANNEL)).await?
                },
            };

            let stream: BoxedStream = Box::new(stream);
            Ok(stream)
        }.boxed()
    }
}

fn serial_port_profile() -> Profile {
    Profile {
        uuid: SERIAL_PORT_UUID,
        role: Some(Role::Client),
        require_authentication: Some(true),
        require_authorization: Some(false),
        auto_connect: Some(false),
        ..Default::default()
    }
}

/// bluetoothd hands the socket to the registered profile while `connect_profile` is still
/// pending, so both are polled together.
async fn connect_serial_profile(session: &Session, adapter: &Adapter, address: Address) -> Result<Stream, ConnectError> {
    let mut requests = session.register_profile(serial_port_profile()).await?;
    let device = adapter.device(address)?;

    debug!("Connecting serial port profile {} on {}", SERIAL_PORT_UUID, address);
    let connect = device.connect_profile(&SERIAL_PORT_UUID);
    tokio::pin!(connect);
    let mut connect_done = false;

    loop {
        tokio::select! {
            result = &mut connect, if !connect_done => {
                result?;
                connect_done = true;
            },
            request = requests.next() => match request {
                Some(request) if request.device() == address => {
                    return Ok(request.accept()?);
                },
                Some(request) => {
                    // dropping a request rejects it
                    debug!("Ignoring serial port connection from {}", request.device());
                },
                None => return Err(ConnectError::ProfileClosed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> RfcommTransport {
        RfcommTransport::new(None, None)
    }

    #[test]
    fn parses_bluetooth_addresses() {
        let device = SelectedDevice::new(" 00:11:22:aa:bb:cc ", None);
        assert_eq!(device_address(&device), Some(Address::new([0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC])));
        assert_eq!(device_address(&SelectedDevice::new("/dev/rfcomm0", None)), None);
        assert_eq!(device_address(&SelectedDevice::new("00:11:22", None)), None);
    }

    #[test]
    fn invalid_addresses_support_no_mode() {
        let device = SelectedDevice::new("vario", None);
        assert!(!transport().supports(&device, ConnectMode::Primary));
        assert!(!transport().supports(&device, ConnectMode::Fallback));
    }

    #[test]
    fn without_bluetoothd_only_the_fixed_channel_is_possible() {
        let device = SelectedDevice::new("00:11:22:AA:BB:CC", None);
        assert!(!transport().supports(&device, ConnectMode::Primary));
        assert!(transport().supports(&device, ConnectMode::Fallback));
    }

    #[tokio::test]
    async fn open_rejects_invalid_address() {
        let device = SelectedDevice::new("not-an-address", None);
        let result = transport().open(&device, ConnectMode::Fallback).await;
        assert!(matches!(result, Err(ConnectError::InvalidAddress(address)) if address == "not-an-address"));
    }

    #[test]
    fn serial_port_profile_is_a_client_of_spp() {
        let profile = serial_port_profile();
        assert_eq!(profile.uuid, SERIAL_PORT_UUID);
        assert!(matches!(profile.role, Some(Role::Client)));
        assert_eq!(profile.require_authentication, Some(true));
    }
}
