use std::net::SocketAddr;
use std::sync::Arc;
use futures::channel::mpsc::{channel, Receiver};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::broadcaster::Broadcaster;
use crate::broadcast::types::{parse_request, ClientMessage};
use crate::device::connection::ConnectionHandle;
use crate::device::constants::SUBSCRIBER_BUFFER;
use crate::device::types::Action;
use crate::error::ServerError;

/// Accepts clients over TCP. Each connection reads action ordinals, one per line, and receives
/// updates as JSON lines once it has sent `RegisterClient`.
pub struct ClientServer {
    listener: TcpListener,
}

impl ClientServer {
    pub async fn bind(address: &str) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(address).await
            .map_err(|source| ServerError::Bind { address: address.to_string(), source })?;

        Ok(ClientServer { listener })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    pub async fn run(self, cancel: CancellationToken, broadcaster: Arc<Broadcaster>, connection: ConnectionHandle) {
        if let Some(address) = self.local_addr() {
            info!("Listening for clients on {}", address);
        }

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("Client connected from {}", peer);
                        client_task(cancel.child_token(), stream, peer, broadcaster.clone(), connection.clone());
                    },
                    Err(err) => {
                        warn!("Failed to accept client connection: {}", err);
                    },
                },
            }
        }

        info!("Client server stopped");
    }
}

fn write_task(mut writer: BufWriter<OwnedWriteHalf>, mut receiver: Receiver<ClientMessage>) -> JoinHandle<()> {
    spawn(async move {
        while let Some(message) = receiver.next().await {
            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(err) => {
                    warn!("Failed to encode {:?}: {}", message, err);
                    continue;
                },
            };
            line.push(b'\n');

            if let Err(err) = writer.write_all(&line).await {
                debug!("Failed to write to client: {}", err);
                break;
            }
            if let Err(err) = writer.flush().await {
                debug!("Failed to flush client stream: {}", err);
                break;
            }
        }
        // dropping the receiver marks this client as gone for the broadcaster
    })
}

fn client_task(
    cancel: CancellationToken,
    stream: TcpStream,
    peer: SocketAddr,
    broadcaster: Arc<Broadcaster>,
    connection: ConnectionHandle,
) -> JoinHandle<()> {
    spawn(async move {
        let (reader, writer) = stream.into_split();
        let (subscriber, receiver) = channel::<ClientMessage>(SUBSCRIBER_BUFFER);
        let writer_handle = write_task(BufWriter::new(writer), receiver);
        let mut lines = BufReader::new(reader).lines();

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match parse_request(&line) {
                        Some(Action::RegisterClient) => broadcaster.register(subscriber.clone()),
                        Some(Action::UnregisterClient) => broadcaster.unregister(&subscriber),
                        Some(action) => {
                            if !connection.perform(action) {
                                warn!("Connection manager has stopped, ignoring {:?}", action);
                            }
                        },
                        None => warn!("Illegal request from {}: {:?}", peer, line),
                    },
                    Ok(None) => {
                        break 'mainloop;
                    },
                    Err(err) => {
                        debug!("Failed to read from client {}: {}", peer, err);
                        break 'mainloop;
                    },
                },
            }
        }

        info!("Client {} disconnected", peer);
        writer_handle.abort();
    })
}
