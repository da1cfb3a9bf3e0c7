use std::collections::HashSet;
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, Session};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, SelectAll};
use futures::{FutureExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;

use crate::error::RadioError;

/// Notifications from the local bluetooth radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    Enabled,
    Disabled,
    /// The remote device with this address dropped its connection.
    DeviceDisconnected(String),
}

/// The local wireless adapter.
pub trait Radio: Send + Sync {
    fn is_available(&self) -> BoxFuture<'_, bool>;

    fn is_enabled(&self) -> BoxFuture<'_, bool>;

    /// Ask for the radio to be switched on. The outcome arrives as a `RadioEvent::Enabled`.
    fn request_enable(&self) -> BoxFuture<'_, ()>;

    fn events(&self) -> BoxFuture<'_, BoxStream<'static, RadioEvent>>;
}

/// The default BlueZ adapter. The session and adapter are shared with the rfcomm transport and
/// the device picker, so that all of them talk about the same devices.
pub struct BluezRadio {
    session: Option<Session>,
    adapter: Option<Adapter>,
}

impl BluezRadio {
    pub async fn new() -> Self {
        let session = match Session::new().await {
            Ok(session) => session,
            Err(err) => {
                warn!("Failed to connect to bluetoothd: {}", err);
                return BluezRadio { session: None, adapter: None };
            },
        };

        let adapter = match session.default_adapter().await {
            Ok(adapter) => {
                info!("Using adapter {}", adapter.name());
                Some(adapter)
            },
            Err(err) => {
                warn!("No bluetooth adapter: {}", err);
                None
            },
        };

        BluezRadio { session: Some(session), adapter }
    }

    pub fn session(&self) -> Option<Session> {
        self.session.clone()
    }

    pub fn adapter(&self) -> Option<Adapter> {
        self.adapter.clone()
    }

    fn require_adapter(&self) -> Result<&Adapter, RadioError> {
        self.adapter.as_ref().ok_or(RadioError::Unavailable)
    }
}

impl Radio for BluezRadio {
    fn is_available(&self) -> BoxFuture<'_, bool> {
        async move {
            self.adapter.is_some()
        }.boxed()
    }

    fn is_enabled(&self) -> BoxFuture<'_, bool> {
        async move {
            let adapter = match self.require_adapter() {
                Ok(adapter) => adapter,
                Err(_) => return false,
            };

            match adapter.is_powered().await {
                Ok(powered) => powered,
                Err(err) => {
                    warn!("Could not query adapter power state: {}", err);
                    false
                },
            }
        }.boxed()
    }

    fn request_enable(&self) -> BoxFuture<'_, ()> {
        async move {
            let result = match self.require_adapter() {
                Ok(adapter) => {
                    info!("Powering on bluetooth adapter...");
                    adapter.set_powered(true).await.map_err(RadioError::from)
                },
                Err(err) => Err(err),
            };

            // on success the Powered property change arrives as an event
            if let Err(err) = result {
                warn!("Could not switch bluetooth on: {}", err);
            }
        }.boxed()
    }

    fn events(&self) -> BoxFuture<'_, BoxStream<'static, RadioEvent>> {
        async move {
            let adapter = match self.adapter() {
                Some(adapter) => adapter,
                None => return stream::empty().boxed(),
            };

            let (sender, receiver) = unbounded::<RadioEvent>();
            spawn(watch_adapter_task(adapter, sender));
            receiver.boxed()
        }.boxed()
    }
}

enum Watched {
    Adapter(AdapterEvent),
    Device(Address, DeviceEvent),
}

fn radio_event(event: &Watched) -> Option<RadioEvent> {
    match event {
        Watched::Adapter(AdapterEvent::PropertyChanged(AdapterProperty::Powered(true))) => Some(RadioEvent::Enabled),
        Watched::Adapter(AdapterEvent::PropertyChanged(AdapterProperty::Powered(false))) => Some(RadioEvent::Disabled),
        Watched::Device(address, DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => {
            Some(RadioEvent::DeviceDisconnected(address.to_string()))
        },
        _ => None,
    }
}

async fn watch_device(
    adapter: &Adapter,
    address: Address,
    watched: &mut HashSet<Address>,
    events: &mut SelectAll<BoxStream<'static, Watched>>,
) {
    if !watched.insert(address) {
        return;
    }

    let device_events = match adapter.device(address) {
        Ok(device) => device.events().await,
        Err(err) => Err(err),
    };

    match device_events {
        Ok(device_events) => events.push(device_events.map(move |event| Watched::Device(address, event)).boxed()),
        Err(err) => {
            debug!("Can not watch device {}: {}", address, err);
            watched.remove(&address);
        },
    }
}

/// Forwards power changes of `adapter`, and disconnects of any of its devices, until the
/// receiving end is dropped.
async fn watch_adapter_task(adapter: Adapter, sender: UnboundedSender<RadioEvent>) {
    let adapter_events = match adapter.events().await {
        Ok(adapter_events) => adapter_events,
        Err(err) => {
            warn!("Failed to listen for bluetooth events: {}", err);
            return;
        },
    };

    let mut events: SelectAll<BoxStream<'static, Watched>> = SelectAll::new();
    events.push(adapter_events.map(Watched::Adapter).boxed());

    let mut watched = HashSet::new();
    for address in adapter.device_addresses().await.unwrap_or_default() {
        watch_device(&adapter, address, &mut watched, &mut events).await;
    }

    while let Some(event) = events.next().await {
        if let Watched::Adapter(AdapterEvent::DeviceAdded(address)) = &event {
            watch_device(&adapter, *address, &mut watched, &mut events).await;
        }
        if let Watched::Adapter(AdapterEvent::DeviceRemoved(address)) = &event {
            watched.remove(address);
        }

        if let Some(radio_event) = radio_event(&event) {
            debug!("Radio event {:?}", radio_event);
            if sender.unbounded_send(radio_event).is_err() {
                break;
            }
        }
    }

    debug!("Stopped watching adapter {}", adapter.name());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_changes_map_to_enabled_and_disabled() {
        let on = Watched::Adapter(AdapterEvent::PropertyChanged(AdapterProperty::Powered(true)));
        let off = Watched::Adapter(AdapterEvent::PropertyChanged(AdapterProperty::Powered(false)));

        assert_eq!(radio_event(&on), Some(RadioEvent::Enabled));
        assert_eq!(radio_event(&off), Some(RadioEvent::Disabled));
    }

    #[test]
    fn device_disconnect_reports_its_address() {
        let address = Address::new([0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]);
        let lost = Watched::Device(address, DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)));
        let connected = Watched::Device(address, DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)));

        assert_eq!(radio_event(&lost), Some(RadioEvent::DeviceDisconnected("00:11:22:AA:BB:CC".to_string())));
        assert_eq!(radio_event(&connected), None);
    }

    #[test]
    fn device_list_changes_are_not_radio_events() {
        let address = Address::new([0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]);
        assert_eq!(radio_event(&Watched::Adapter(AdapterEvent::DeviceAdded(address))), None);
        assert_eq!(radio_event(&Watched::Adapter(AdapterEvent::DeviceRemoved(address))), None);
    }
}
