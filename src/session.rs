//! Session lifecycle and controller discovery.
//!
//! A session owns the one transport shared by command dispatch and camera
//! streaming. After the auth handshake the link is split: a router task
//! demuxes inbound traffic (acks to the dispatcher, frames to the camera
//! channel) so neither flow can block the other.

use std::time::{Duration, Instant};

use futures::{stream::SplitStream, SinkExt, StreamExt};
use tokio::{
    net::{TcpStream, UdpSocket},
    sync::{mpsc, watch},
};
use tokio_util::codec::Framed;
use tracing::*;

use crate::{
    camera::{CameraStream, SequencedRawFrame},
    configuration::{ConnectionConfig, Timeouts},
    dispatcher::{Dispatcher, DispatcherHandle},
    error::{Error, Result},
    kinematics::ActuatorCommand,
    protocol::{
        ClientMessage, ControlReply, ControllerCodec, ControllerMessage, DiscoveryMessage,
    },
    util::{latest_value_channel, LatestReceiver, LatestSender},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Discovering,
    Connected,
    Closed,
}

/// Immutable snapshot of a controller that answered discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub motor_count: u8,
    pub has_camera: bool,
}

pub struct Session {
    host: String,
    port: u16,
    auth_key: String,
    timeouts: Timeouts,
    // serializes initialize and close against each other
    lifecycle: tokio::sync::Mutex<()>,
    shared: std::sync::Mutex<SessionShared>,
}

struct SessionShared {
    state: ConnectionState,
    dispatcher: Option<DispatcherHandle>,
    camera_receiver: Option<LatestReceiver<Result<SequencedRawFrame>>>,
    // dropping the sender tells the link router to release the read half
    shutdown: Option<watch::Sender<()>>,
}

impl Session {
    /// Validates the connection parameters eagerly, performs no I/O.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        auth_key: impl Into<String>,
        timeouts: Timeouts,
    ) -> Result<Self> {
        let host = host.into();
        let auth_key = auth_key.into();
        if host.is_empty() {
            return Err(Error::Configuration("controller host is empty".to_owned()));
        }
        if port == 0 {
            return Err(Error::Configuration("controller port is zero".to_owned()));
        }
        if auth_key.is_empty() {
            return Err(Error::Configuration("auth key is empty".to_owned()));
        }
        Ok(Self {
            host,
            port,
            auth_key,
            timeouts,
            lifecycle: tokio::sync::Mutex::new(()),
            shared: std::sync::Mutex::new(SessionShared {
                state: ConnectionState::Uninitialized,
                dispatcher: None,
                camera_receiver: None,
                shutdown: None,
            }),
        })
    }

    pub fn from_config(connection: &ConnectionConfig, timeouts: Timeouts) -> Result<Self> {
        Self::new(
            connection.host.clone(),
            connection.port,
            connection.auth_key.clone(),
            timeouts,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().unwrap().state
    }

    /// Queries the network for controllers. No answer within the timeout is
    /// an empty list, not an error; only a discovery transport that cannot
    /// be opened at all fails.
    pub async fn discover_devices(&self, timeout: Duration) -> Result<Vec<Device>> {
        let was_uninitialized = {
            let mut shared = self.shared.lock().unwrap();
            if shared.state == ConnectionState::Uninitialized {
                shared.state = ConnectionState::Discovering;
                true
            } else {
                false
            }
        };
        let result = self.run_discovery(timeout).await;
        if was_uninitialized {
            let mut shared = self.shared.lock().unwrap();
            if shared.state == ConnectionState::Discovering {
                shared.state = ConnectionState::Uninitialized;
            }
        }
        result
    }

    async fn run_discovery(&self, timeout: Duration) -> Result<Vec<Device>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(|error| {
            warn!("Could not open discovery socket: {}", error);
            Error::timeout("discovery", timeout)
        })?;
        let request = serde_json::to_vec(&DiscoveryMessage::Discover)?;
        socket
            .send_to(&request, (self.host.as_str(), self.port))
            .await
            .map_err(|error| {
                warn!("Could not send discovery query: {}", error);
                Error::timeout("discovery", timeout)
            })?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut devices = Vec::new();
        let mut buffer = [0u8; 2048];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, socket.recv_from(&mut buffer)).await {
                Ok(Ok((len, peer))) => match serde_json::from_slice(&buffer[..len]) {
                    Ok(DiscoveryMessage::Announce {
                        id,
                        motor_count,
                        has_camera,
                    }) => {
                        debug!("Controller {} announced itself from {}", id, peer);
                        devices.push(Device {
                            id,
                            motor_count,
                            has_camera,
                        });
                    }
                    // our own query reflected back by a broadcast medium
                    Ok(DiscoveryMessage::Discover) => {}
                    Err(error) => {
                        warn!("Ignoring malformed datagram from {}: {}", peer, error);
                    }
                },
                Ok(Err(error)) => {
                    warn!("Discovery receive failed: {}", error);
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(devices)
    }

    /// Opens the authenticated channel. A no-op when already connected,
    /// fails permanently once the session is closed.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => {
                return Err(Error::Connection("session is closed".to_owned()))
            }
            ConnectionState::Uninitialized | ConnectionState::Discovering => {}
        }
        match self.open_link().await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.shared.lock().unwrap().state = ConnectionState::Closed;
                Err(error)
            }
        }
    }

    async fn open_link(&self) -> Result<()> {
        // one deadline covers connect and handshake together
        let budget = self.timeouts.initialize();
        let deadline = tokio::time::Instant::now() + budget;
        let stream = tokio::time::timeout_at(
            deadline,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| Error::timeout("initialize", budget))?
        .map_err(|error| {
            Error::Connection(format!(
                "connect to {}:{} failed: {}",
                self.host, self.port, error
            ))
        })?;
        // motion commands are tiny and latency sensitive
        let _ = stream.set_nodelay(true);

        let mut framed = Framed::new(stream, ControllerCodec);
        framed
            .send(ClientMessage::Auth {
                key: self.auth_key.clone(),
            })
            .await?;
        let reply = tokio::time::timeout_at(deadline, framed.next())
            .await
            .map_err(|_| Error::timeout("initialize", budget))?;
        match reply {
            Some(Ok(ControllerMessage::Control(ControlReply::AuthOk))) => {}
            Some(Ok(ControllerMessage::Control(ControlReply::AuthRejected { reason }))) => {
                return Err(Error::Auth(reason))
            }
            Some(Ok(other)) => {
                return Err(Error::Protocol(format!(
                    "unexpected handshake reply: {:?}",
                    other
                )))
            }
            Some(Err(error)) => return Err(error),
            None => {
                return Err(Error::Connection(
                    "controller closed the link during handshake".to_owned(),
                ))
            }
        }

        let (sink, stream) = framed.split();
        let (ack_sender, ack_receiver) = mpsc::unbounded_channel();
        let (frame_sender, frame_receiver) = latest_value_channel();
        let (shutdown_sender, shutdown_receiver) = watch::channel(());
        tokio::spawn(run_link_router(
            stream,
            shutdown_receiver,
            ack_sender,
            frame_sender,
        ));
        let (dispatcher, handle) = Dispatcher::new(sink, ack_receiver, self.timeouts.clone());
        tokio::spawn(dispatcher.run());

        let mut shared = self.shared.lock().unwrap();
        shared.state = ConnectionState::Connected;
        shared.dispatcher = Some(handle);
        shared.camera_receiver = Some(frame_receiver);
        shared.shutdown = Some(shutdown_sender);
        info!("Session to {}:{} established", self.host, self.port);
        Ok(())
    }

    /// Tears the link down. Idempotent; dropping the dispatcher handle ends
    /// the write half and the shutdown signal makes the router release the
    /// read half, so the socket closes without waiting on the peer.
    pub async fn close(&self) {
        let _guard = self.lifecycle.lock().await;
        let mut shared = self.shared.lock().unwrap();
        if shared.state != ConnectionState::Closed {
            info!("Closing session to {}:{}", self.host, self.port);
        }
        shared.state = ConnectionState::Closed;
        shared.dispatcher = None;
        shared.camera_receiver = None;
        shared.shutdown = None;
    }

    pub(crate) async fn send_command(&self, command: ActuatorCommand) -> Result<()> {
        let dispatcher = self.connected_dispatcher()?;
        dispatcher.send_command(command).await
    }

    pub(crate) async fn send_stop(&self, command: ActuatorCommand) -> Result<()> {
        let dispatcher = self.connected_dispatcher()?;
        dispatcher.send_stop(command).await
    }

    /// The camera stream can only be taken once per session; it is not
    /// restartable after exhaustion.
    pub(crate) fn camera_stream(&self) -> Result<CameraStream> {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != ConnectionState::Connected {
            return Err(Error::Connection(format!(
                "camera needs a connected session, state is {:?}",
                shared.state
            )));
        }
        let receiver = shared.camera_receiver.take().ok_or_else(|| {
            Error::Configuration("camera stream was already taken for this session".to_owned())
        })?;
        Ok(CameraStream::new(receiver, self.timeouts.camera_pull()))
    }

    fn connected_dispatcher(&self) -> Result<DispatcherHandle> {
        let shared = self.shared.lock().unwrap();
        if shared.state != ConnectionState::Connected {
            return Err(Error::Connection(format!(
                "commands need a connected session, state is {:?}",
                shared.state
            )));
        }
        shared
            .dispatcher
            .clone()
            .ok_or_else(|| Error::Connection("command dispatcher is gone".to_owned()))
    }
}

/// Demuxes inbound controller traffic. Acks go to the dispatcher, frames to
/// the camera channel. Exits when the session signals shutdown, dropping the
/// read half of the link. A broken link surfaces the error on the camera
/// side and closes the ack channel, which fails any pending command.
async fn run_link_router(
    mut stream: SplitStream<Framed<TcpStream, ControllerCodec>>,
    mut shutdown: watch::Receiver<()>,
    ack_sender: mpsc::UnboundedSender<u32>,
    frame_sender: LatestSender<Result<SequencedRawFrame>>,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => break,
            message = stream.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            Ok(ControllerMessage::Control(ControlReply::Ack { seq })) => {
                if ack_sender.send(seq).is_err() {
                    break;
                }
            }
            Ok(ControllerMessage::Control(other)) => {
                warn!("Unexpected control message outside handshake: {:?}", other);
            }
            Ok(ControllerMessage::Frame(raw)) => {
                let _ = frame_sender.send(Ok(SequencedRawFrame {
                    raw,
                    timestamp: Instant::now(),
                }));
            }
            Err(error) => {
                error!("Controller link broke: {}", error);
                let _ = frame_sender.send(Err(error));
                break;
            }
        }
    }
    debug!("Link router finished");
}
