use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use futures::channel::mpsc::{unbounded, Sender, UnboundedReceiver, UnboundedSender};
use log::{debug, error, info, warn};

use crate::broadcast::types::ClientMessage;
use crate::device::connection::StateListener;
use crate::device::types::ConnectionState;
use crate::model::{SensorListener, SensorModel, SensorReading};

/// A connected client. Clones of a sender are the same subscriber.
pub type Subscriber = Sender<ClientMessage>;

enum Delivery {
    Delivered,
    /// the client is gone for good
    Dead,
    Failed,
}

struct BroadcasterInner {
    subscribers: Vec<Subscriber>,
    state: ConnectionState,
    device_name: Option<String>,
    previous_battery: Option<f64>,
    send_count: u64,
}

/// Pushes state and sensor updates to every registered client.
///
/// A client whose channel is closed is evicted on the next push. When that empties the set of
/// clients, the receiver returned by `new` gets a message.
pub struct Broadcaster {
    model: Arc<SensorModel>,
    inner: Mutex<BroadcasterInner>,
    idle: UnboundedSender<()>,
}

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn deliver(subscriber: &mut Subscriber, message: ClientMessage) -> Delivery {
    match subscriber.try_send(message) {
        Ok(()) => Delivery::Delivered,
        Err(err) if err.is_disconnected() => Delivery::Dead,
        Err(err) => {
            warn!("Error sending to client: {}", err);
            Delivery::Failed
        },
    }
}

fn battery_millivolts(volts: f64) -> i32 {
    (volts * 1000.0).round() as i32
}

impl BroadcasterInner {
    fn state_message(&self) -> ClientMessage {
        ClientMessage::StateUpdate {
            state: self.state.ordinal(),
            timestamp_ms: wall_clock_ms(),
            device_name: self.device_name.clone(),
        }
    }

    /// Returns true if this emptied the set of subscribers.
    fn send_to_all(&mut self, message: &ClientMessage) -> bool {
        self.send_count += 1;
        if self.send_count % 500 == 0 {
            debug!("Sending to {} clients", self.subscribers.len());
        }

        let before = self.subscribers.len();
        self.subscribers.retain_mut(|subscriber| match deliver(subscriber, message.clone()) {
            Delivery::Dead => {
                error!("Client is gone, removing it");
                false
            },
            Delivery::Delivered | Delivery::Failed => true,
        });

        before > 0 && self.subscribers.is_empty()
    }
}

impl Broadcaster {
    pub fn new(model: Arc<SensorModel>) -> (Self, UnboundedReceiver<()>) {
        let (idle, idle_receiver) = unbounded::<()>();

        let broadcaster = Broadcaster {
            model,
            inner: Mutex::new(BroadcasterInner {
                subscribers: Vec::new(),
                state: ConnectionState::Init,
                device_name: None,
                previous_battery: None,
                send_count: 0,
            }),
            idle,
        };

        (broadcaster, idle_receiver)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BroadcasterInner> {
        self.inner.lock().expect("Failed to lock Broadcaster inner")
    }

    fn signal_if_idle(&self, emptied: bool) {
        if emptied {
            info!("No clients listening");
            let _ = self.idle.unbounded_send(());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Add a client and bring it up to date with the current state and sensor values.
    pub fn register(&self, mut subscriber: Subscriber) {
        let mut inner = self.lock();

        if inner.subscribers.iter().any(|existing| existing.same_receiver(&subscriber)) {
            warn!("Client is already registered");
            return;
        }

        let mut messages = vec![inner.state_message()];
        let reading = self.model.reading();
        if reading.has_pressure() {
            if let Some(volts) = reading.battery_volts {
                messages.push(ClientMessage::BatteryUpdate {
                    millivolts: battery_millivolts(volts),
                    timestamp_ms: reading.pressure_timestamp_ms,
                });
            }
            messages.push(ClientMessage::PressureUpdate {
                pressure_raw: reading.pressure_raw,
                timestamp_ms: reading.pressure_timestamp_ms,
            });
        }

        for message in messages {
            if let Delivery::Dead = deliver(&mut subscriber, message) {
                error!("Client is gone before it was registered");
                return;
            }
        }

        inner.subscribers.push(subscriber);
        info!("Client registered ({} total)", inner.subscribers.len());
    }

    pub fn unregister(&self, subscriber: &Subscriber) {
        let mut inner = self.lock();

        match inner.subscribers.iter().position(|existing| existing.same_receiver(subscriber)) {
            Some(index) => {
                inner.subscribers.remove(index);
                info!("Client unregistered ({} left)", inner.subscribers.len());
            },
            None => error!("Client could not be removed, it was not registered"),
        }
    }

    pub fn clear(&self) {
        self.lock().subscribers.clear();
    }
}

impl StateListener for Broadcaster {
    fn on_state_change(&self, state: ConnectionState, device_name: Option<&str>) {
        let emptied = {
            let mut inner = self.lock();
            inner.state = state;
            inner.device_name = device_name.map(str::to_string);

            debug!("Informing clients about state change to {} ({})", state, state.ordinal());
            let message = inner.state_message();
            inner.send_to_all(&message)
        };

        self.signal_if_idle(emptied);
    }
}

impl SensorListener for Broadcaster {
    fn on_sensor_update(&self, reading: &SensorReading) {
        let emptied = {
            let mut inner = self.lock();
            let mut emptied = false;

            if let Some(volts) = reading.battery_volts {
                if inner.previous_battery != Some(volts) {
                    inner.previous_battery = Some(volts);
                    emptied |= inner.send_to_all(&ClientMessage::BatteryUpdate {
                        millivolts: battery_millivolts(volts),
                        timestamp_ms: reading.pressure_timestamp_ms,
                    });
                }
            }

            emptied |= inner.send_to_all(&ClientMessage::PressureUpdate {
                pressure_raw: reading.pressure_raw,
                timestamp_ms: reading.pressure_timestamp_ms,
            });
            emptied
        };

        self.signal_if_idle(emptied);
    }
}
