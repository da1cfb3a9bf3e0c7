use std::sync::Arc;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::device::link::{Connection, DeviceLink};
use crate::device::radio::{Radio, RadioEvent};
use crate::device::selection::{DeviceSelector, DeviceStore};
use crate::device::types::{Action, ConnectionState, SelectedDevice};
use crate::error::ConnectError;

pub trait StateListener: Send + Sync {
    fn on_state_change(&self, state: ConnectionState, device_name: Option<&str>);
}

enum Trigger {
    Action(Action),
    DeviceSelected {
        selection: u64,
        device: Option<SelectedDevice>,
    },
    ConnectFinished {
        attempt: u64,
        result: Result<Connection, ConnectError>,
    },
    ConnectionLost {
        session: u64,
    },
}

/// Sends actions to a running `ConnectionManager`.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: UnboundedSender<Trigger>,
}

impl ConnectionHandle {
    /// Returns false if the manager has stopped.
    pub fn perform(&self, action: Action) -> bool {
        self.sender.unbounded_send(Trigger::Action(action)).is_ok()
    }
}

/// A background task (connect attempt or device selection) that can be abandoned.
struct Pending {
    id: u64,
    cancel: CancellationToken,
}

impl Pending {
    fn abandon(self) {
        self.cancel.cancel();
    }
}

/// Drives the connection to the instrument.
///
/// All transitions are applied by the single task running `run()`; connect attempts, device
/// selection, the read session and the radio report back to it as triggers. Results of attempts,
/// selections and sessions that have since been abandoned are recognised by their id and ignored.
pub struct ConnectionManager {
    state: ConnectionState,
    device: Option<SelectedDevice>,
    link: DeviceLink,
    radio: Arc<dyn Radio>,
    selector: Arc<dyn DeviceSelector>,
    store: Arc<dyn DeviceStore>,
    listeners: Vec<Arc<dyn StateListener>>,
    retry_interval: Duration,
    retry_at: Option<Instant>,
    attempt: Option<Pending>,
    selection: Option<Pending>,
    session: Option<u64>,
    next_id: u64,
    sender: UnboundedSender<Trigger>,
    receiver: Option<UnboundedReceiver<Trigger>>,
}

impl ConnectionManager {
    pub fn new(
        link: DeviceLink,
        radio: Arc<dyn Radio>,
        selector: Arc<dyn DeviceSelector>,
        store: Arc<dyn DeviceStore>,
        retry_interval: Duration,
    ) -> (Self, ConnectionHandle) {
        let (sender, receiver) = unbounded::<Trigger>();
        let handle = ConnectionHandle { sender: sender.clone() };

        let manager = ConnectionManager {
            state: ConnectionState::Init,
            device: None,
            link,
            radio,
            selector,
            store,
            listeners: Vec::new(),
            retry_interval,
            retry_at: None,
            attempt: None,
            selection: None,
            session: None,
            next_id: 0,
            sender,
            receiver: Some(receiver),
        };

        (manager, handle)
    }

    pub fn add_listener(&mut self, listener: Arc<dyn StateListener>) {
        self.listeners.push(listener);
    }

    /// Run until `cancel` is cancelled. Closes the session and abandons pending work on return.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut triggers = match self.receiver.take() {
            Some(receiver) => receiver,
            None => return,
        };
        let mut radio_events = self.radio.events().await.fuse();

        self.init().await;

        'mainloop: loop {
            let retry_at = self.retry_at;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(trigger) = triggers.next() => {
                    self.handle_trigger(trigger).await;
                },
                Some(event) = radio_events.next() => {
                    self.handle_radio_event(event).await;
                },
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.on_retry_timer();
                },
                else => {
                    break 'mainloop;
                },
            }
        }

        info!("Stopping connection manager");
        self.abandon_connection();
        if let Some(selection) = self.selection.take() {
            selection.abandon();
        }
    }

    async fn init(&mut self) {
        if !self.radio.is_available().await {
            self.set_state(ConnectionState::NotSupported);
            return;
        }

        self.device = match self.store.load().await {
            Ok(device) => device,
            Err(err) => {
                error!("Failed to load selected device: {}", err);
                None
            },
        };

        if self.radio.is_enabled().await {
            self.on_radio_available();
        } else {
            self.set_state(ConnectionState::RadioOff);
            self.radio.request_enable().await;
        }
    }

    async fn handle_trigger(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Action(action) => self.perform(action).await,
            Trigger::DeviceSelected { selection, device } => self.on_device_selected(selection, device).await,
            Trigger::ConnectFinished { attempt, result } => self.on_connect_finished(attempt, result),
            Trigger::ConnectionLost { session } => self.on_connection_lost(session),
        }
    }

    async fn perform(&mut self, action: Action) {
        info!("Performing action {:?} in state {}", action, self.state);

        if self.state == ConnectionState::NotSupported {
            warn!("Ignoring {:?}, bluetooth is not supported", action);
            return;
        }

        match action {
            Action::Connect => {
                if self.state == ConnectionState::RadioOff {
                    warn!("Ignoring connect request, bluetooth is switched off");
                    return;
                }
                self.do_connect();
            },
            Action::Disconnect | Action::CancelConnecting => self.do_disconnect(),
            Action::EnableRadio => self.do_enable_radio().await,
            Action::SelectDevice => self.do_select_device(),
            Action::RegisterClient | Action::UnregisterClient => {
                warn!("{:?} must be handled by the client broadcaster", action);
            },
        }
    }

    async fn handle_radio_event(&mut self, event: RadioEvent) {
        debug!("Radio event {:?} in state {}", event, self.state);

        if self.state == ConnectionState::NotSupported {
            return;
        }

        match event {
            RadioEvent::Enabled => {
                if self.state == ConnectionState::RadioOff {
                    self.on_radio_available();
                } else {
                    // nothing changed, but clients may want to refresh
                    self.set_state(self.state);
                }
            },
            RadioEvent::Disabled => {
                if self.state != ConnectionState::RadioOff {
                    self.abandon_connection();
                    self.set_state(ConnectionState::RadioOff);
                }
            },
            RadioEvent::DeviceDisconnected(address) => {
                let matches = self.device.as_ref()
                    .map(|device| device.address.eq_ignore_ascii_case(&address))
                    .unwrap_or(false);

                if self.state == ConnectionState::Connected && matches {
                    warn!("Device {} disconnected", address);
                    self.abandon_connection();
                    self.fail();
                }
            },
        }
    }

    /// The radio is on: connect to the saved device, or ask for one.
    fn on_radio_available(&mut self) {
        if self.device.is_some() {
            self.do_connect();
        } else {
            self.do_select_device();
        }
    }

    async fn do_enable_radio(&mut self) {
        if self.radio.is_enabled().await {
            info!("Bluetooth is already switched on");
            self.handle_radio_event(RadioEvent::Enabled).await;
            return;
        }

        if self.state != ConnectionState::RadioOff {
            self.abandon_connection();
            self.set_state(ConnectionState::RadioOff);
        }
        self.radio.request_enable().await;
    }

    fn do_connect(&mut self) {
        self.abandon_connection();

        let device = match &self.device {
            Some(device) => device.clone(),
            None => {
                info!("No device selected");
                self.do_select_device();
                return;
            },
        };

        if self.state == ConnectionState::ConnectionFailed {
            self.set_state(ConnectionState::Reconnecting);
        } else {
            self.set_state(ConnectionState::Connecting);
        }

        let id = self.next_id();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let sender = self.sender.clone();
        let attempt = self.link.connect(device);

        spawn(async move {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("Connect attempt {} cancelled", id);
                },
                result = attempt => {
                    let _ = sender.unbounded_send(Trigger::ConnectFinished { attempt: id, result });
                },
            }
        });

        self.attempt = Some(Pending { id, cancel });
    }

    fn do_disconnect(&mut self) {
        self.abandon_connection();
        // a device picked after this point must not be saved or connected to
        if let Some(selection) = self.selection.take() {
            selection.abandon();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn do_select_device(&mut self) {
        self.abandon_connection();
        if let Some(selection) = self.selection.take() {
            selection.abandon();
        }

        self.device = None;
        self.set_state(ConnectionState::SelectingDevice);

        let id = self.next_id();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let sender = self.sender.clone();
        let selector = self.selector.clone();

        spawn(async move {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("Device selection {} abandoned", id);
                },
                device = selector.select_device() => {
                    let _ = sender.unbounded_send(Trigger::DeviceSelected { selection: id, device });
                },
            }
        });

        self.selection = Some(Pending { id, cancel });
    }

    async fn on_device_selected(&mut self, selection: u64, device: Option<SelectedDevice>) {
        if self.selection.as_ref().map(|pending| pending.id) != Some(selection) {
            debug!("Ignoring result of abandoned device selection {}", selection);
            return;
        }
        self.selection = None;

        let device = match device {
            Some(device) => device,
            None => {
                info!("Device selection abandoned");
                return;
            },
        };

        info!("Device {} was selected", device.display_name());
        if let Err(err) = self.store.save(device.clone()).await {
            error!("Failed to save selected device: {}", err);
        }
        self.device = Some(device);

        if self.state == ConnectionState::SelectingDevice {
            self.do_connect();
        }
    }

    fn on_connect_finished(&mut self, attempt: u64, result: Result<Connection, ConnectError>) {
        if self.attempt.as_ref().map(|pending| pending.id) != Some(attempt) {
            // dropping the result closes the stream, if there is one
            debug!("Ignoring result of abandoned connect attempt {}", attempt);
            return;
        }
        self.attempt = None;

        match result {
            Ok(connection) => {
                self.set_state(ConnectionState::Connected);

                let session = self.next_id();
                let sender = self.sender.clone();
                self.link.start(connection, move || {
                    let _ = sender.unbounded_send(Trigger::ConnectionLost { session });
                });
                self.session = Some(session);
            },
            Err(err) => {
                warn!("Connecting failed: {}", err);
                self.fail();
            },
        }
    }

    fn on_connection_lost(&mut self, session: u64) {
        if self.session != Some(session) {
            debug!("Ignoring loss of closed session {}", session);
            return;
        }

        warn!("Connection lost");
        self.abandon_connection();
        self.fail();
    }

    fn on_retry_timer(&mut self) {
        self.retry_at = None;

        if self.state == ConnectionState::ConnectionFailed {
            info!("Trying to reconnect");
            self.do_connect();
        }
    }

    /// Enter ConnectionFailed and arm the retry timer.
    fn fail(&mut self) {
        self.set_state(ConnectionState::ConnectionFailed);
        self.retry_at = Some(Instant::now() + self.retry_interval);
    }

    /// Cancel the pending connect attempt and retry timer, and close the session.
    fn abandon_connection(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.abandon();
        }
        self.retry_at = None;
        self.session = None;
        self.link.close();
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        info!("State set to {}", state);

        let device_name = self.device.as_ref().map(|device| device.display_name());
        for listener in &self.listeners {
            listener.on_state_change(state, device_name);
        }
    }
}
