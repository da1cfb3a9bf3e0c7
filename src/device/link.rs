use std::sync::Arc;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::constants::{MAX_LINE_LENGTH, READ_BUFFER_SIZE};
use crate::device::decoder::LineDecoder;
use crate::device::types::SelectedDevice;
use crate::error::ConnectError;
use crate::model::SensorModel;

pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Connection modes, tried in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Primary,
    /// lower assurance, only used when the primary mode failed
    Fallback,
}

/// Opens a duplex byte stream to an instrument.
pub trait Transport: Send + Sync {
    /// Whether this transport can attempt `mode` for `device` at all.
    fn supports(&self, device: &SelectedDevice, mode: ConnectMode) -> bool;

    fn open<'a>(&'a self, device: &'a SelectedDevice, mode: ConnectMode) -> BoxFuture<'a, Result<BoxedStream, ConnectError>>;
}

/// An opened stream that is not being read from yet.
pub struct Connection {
    pub stream: BoxedStream,
    pub mode: ConnectMode,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("mode", &self.mode).finish_non_exhaustive()
    }
}

struct Session {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Owns at most one read session with the instrument.
pub struct DeviceLink {
    transport: Arc<dyn Transport>,
    model: Arc<SensorModel>,
    connect_deadline: Duration,
    session: Option<Session>,
}

impl DeviceLink {
    pub fn new(transport: Arc<dyn Transport>, model: Arc<SensorModel>, connect_deadline: Duration) -> Self {
        DeviceLink {
            transport,
            model,
            connect_deadline,
            session: None,
        }
    }

    /// Try the primary connection mode, then the fallback mode.
    ///
    /// Dropping the returned future aborts the attempt; a partially opened stream is dropped (and
    /// thereby closed) with it.
    pub fn connect(&self, device: SelectedDevice) -> BoxFuture<'static, Result<Connection, ConnectError>> {
        let transport = self.transport.clone();
        let deadline = self.connect_deadline;

        async move {
            let mut last_error = ConnectError::NoModeAvailable;

            for mode in [ConnectMode::Primary, ConnectMode::Fallback] {
                if !transport.supports(&device, mode) {
                    debug!("Connection mode {:?} not supported for {}", mode, device.address);
                    continue;
                }

                info!("Connecting to {} ({:?})...", device.display_name(), mode);
                match timeout(deadline, transport.open(&device, mode)).await {
                    Ok(Ok(stream)) => {
                        info!("Connected to {} ({:?})", device.display_name(), mode);
                        return Ok(Connection { stream, mode });
                    },
                    Ok(Err(err)) => {
                        warn!("Connecting to {} ({:?}) failed: {}", device.address, mode, err);
                        last_error = err;
                    },
                    Err(_) => {
                        warn!("Connecting to {} ({:?}) took too long", device.address, mode);
                        last_error = ConnectError::Timeout;
                    },
                }
            }

            Err(last_error)
        }.boxed()
    }

    /// Start reading from `connection`, replacing any previous session.
    ///
    /// `on_lost` is called once if the stream fails or ends; it is not called after `close()`.
    pub fn start<F>(&mut self, connection: Connection, on_lost: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.close();

        let cancel = CancellationToken::new();
        let handle = read_session_task(
            cancel.clone(),
            connection.stream,
            self.model.clone(),
            on_lost,
        );

        self.session = Some(Session { cancel, _handle: handle });
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Stop the read session and close the stream. Safe to call at any time, any number of times.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Closing session");
            session.cancel.cancel();
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_session_task<F>(cancel: CancellationToken, stream: BoxedStream, model: Arc<SensorModel>, on_lost: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    spawn(async move {
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, stream);
        let mut decoder = LineDecoder::new(model.monotonic_ms());
        let mut line: Vec<u8> = Vec::with_capacity(READ_BUFFER_SIZE);

        // set while skipping the rest of a line that was too long
        let mut oversized = false;

        let lost = 'mainloop: loop {
            line.clear();
            let mut limited = (&mut reader).take(MAX_LINE_LENGTH as u64);

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break 'mainloop false;
                },
                result = limited.read_until(b'\n', &mut line) => match result {
                    Ok(0) => {
                        warn!("Instrument closed the stream");
                        break 'mainloop true;
                    },
                    Ok(_) => {
                        let complete = line.last() == Some(&b'\n');

                        if !complete && line.len() >= MAX_LINE_LENGTH {
                            if !oversized {
                                debug!("Dropping line longer than {} bytes", MAX_LINE_LENGTH);
                            }
                            oversized = true;
                        } else if oversized {
                            // tail of the dropped line
                            oversized = !complete;
                        } else {
                            let text = String::from_utf8_lossy(&line);
                            if let Some(event) = decoder.decode(&text) {
                                model.apply(&event);
                            }
                        }
                    },
                    Err(err) => {
                        warn!("Failed to read from instrument: {}", err);
                        break 'mainloop true;
                    },
                },
            }
        };

        // the stream is dropped (closed) here, before the owner hears about it
        drop(reader);

        if lost && !cancel.is_cancelled() {
            on_lost();
        }
        debug!("Read session stopped");
    })
}
