//! Ordered command dispatch.
//!
//! All regular actuator commands for a session flow through one task that
//! transmits them strictly in submission order and never puts command `n + 1`
//! on the wire before command `n` resolved (ack or declared timeout). Stops
//! travel on a separate priority channel so a safety stop is never stuck
//! behind a pending motion command.

use std::time::Duration;

use futures::{Sink, SinkExt};
use tokio::sync::{mpsc, oneshot};
use tracing::*;

use crate::{
    configuration::Timeouts,
    error::{Error, Result},
    kinematics::ActuatorCommand,
    protocol::ClientMessage,
};

const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(50);

pub(crate) struct QueuedCommand {
    pub command: ActuatorCommand,
    pub responder: oneshot::Sender<Result<()>>,
}

/// Cloneable handle the session hands out. Dropping every handle shuts the
/// dispatcher task down.
#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    command_sender: mpsc::Sender<QueuedCommand>,
    stop_sender: mpsc::Sender<QueuedCommand>,
}

impl DispatcherHandle {
    pub async fn send_command(&self, command: ActuatorCommand) -> Result<()> {
        let (responder, receiver) = oneshot::channel();
        self.command_sender
            .send(QueuedCommand { command, responder })
            .await
            .map_err(|_| Error::Connection("command dispatcher is gone".to_owned()))?;
        receiver
            .await
            .map_err(|_| Error::Connection("command dispatcher dropped request".to_owned()))?
    }

    /// Priority path. Bypasses the ordered queue entirely.
    pub async fn send_stop(&self, command: ActuatorCommand) -> Result<()> {
        let (responder, receiver) = oneshot::channel();
        self.stop_sender
            .send(QueuedCommand { command, responder })
            .await
            .map_err(|_| Error::Connection("command dispatcher is gone".to_owned()))?;
        receiver
            .await
            .map_err(|_| Error::Connection("command dispatcher dropped request".to_owned()))?
    }
}

pub(crate) struct Dispatcher<S> {
    sink: S,
    ack_receiver: mpsc::UnboundedReceiver<u32>,
    command_receiver: mpsc::Receiver<QueuedCommand>,
    stop_receiver: mpsc::Receiver<QueuedCommand>,
    timeouts: Timeouts,
    next_seq: u32,
}

impl<S> Dispatcher<S>
where
    S: Sink<ClientMessage, Error = Error> + Unpin + Send,
{
    pub fn new(
        sink: S,
        ack_receiver: mpsc::UnboundedReceiver<u32>,
        timeouts: Timeouts,
    ) -> (Self, DispatcherHandle) {
        let (command_sender, command_receiver) = mpsc::channel(16);
        let (stop_sender, stop_receiver) = mpsc::channel(4);
        let dispatcher = Self {
            sink,
            ack_receiver,
            command_receiver,
            stop_receiver,
            timeouts,
            next_seq: 0,
        };
        let handle = DispatcherHandle {
            command_sender,
            stop_sender,
        };
        (dispatcher, handle)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                stop = self.stop_receiver.recv() => match stop {
                    Some(request) => self.handle_stop(request).await,
                    None => break,
                },
                command = self.command_receiver.recv() => match command {
                    Some(request) => self.handle_ordered(request).await,
                    None => break,
                },
            }
        }
        debug!("Command dispatcher shutting down");
    }

    async fn handle_stop(&mut self, request: QueuedCommand) {
        if let Err(error) = self.transmit_stop(request.command).await {
            warn!("Best effort stop did not reach the controller: {}", error);
        }
        // a stop always succeeds locally
        let _ = request.responder.send(Ok(()));
    }

    /// Puts a stop on the wire right away and waits for its ack without
    /// retrying. Failure is reported but never escalated.
    async fn transmit_stop(&mut self, command: ActuatorCommand) -> Result<()> {
        let seq = self.allocate_seq();
        self.sink
            .send(ClientMessage::SetSpeeds {
                seq,
                targets: command.targets().to_vec(),
            })
            .await?;
        match self.await_ack(seq).await {
            AckOutcome::Acked => Ok(()),
            AckOutcome::TimedOut => Err(Error::timeout("stop ack", self.timeouts.command())),
            AckOutcome::LinkClosed => {
                Err(Error::Connection("link closed while stopping".to_owned()))
            }
            // a stop racing another stop, the wire state is zero either way
            AckOutcome::StopRequested(request) => {
                let _ = request.responder.send(Ok(()));
                Ok(())
            }
        }
    }

    async fn handle_ordered(&mut self, request: QueuedCommand) {
        let attempts = self.timeouts.command_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(RETRY_BACKOFF_STEP * (attempt - 1)).await;
            }
            let seq = self.allocate_seq();
            let message = ClientMessage::SetSpeeds {
                seq,
                targets: request.command.targets().to_vec(),
            };
            if let Err(error) = self.sink.send(message).await {
                warn!("Send attempt {} failed: {}", attempt, error);
                let transient = error.is_transient();
                last_error = Some(error);
                if transient {
                    continue;
                }
                break;
            }
            match self.await_ack(seq).await {
                AckOutcome::Acked => {
                    let _ = request.responder.send(Ok(()));
                    return;
                }
                AckOutcome::StopRequested(stop) => {
                    // the stop wins, the original command was transmitted but
                    // its effect is superseded
                    self.handle_stop(stop).await;
                    let _ = request.responder.send(Ok(()));
                    return;
                }
                AckOutcome::TimedOut => {
                    debug!("Ack for seq {} timed out on attempt {}", seq, attempt);
                    last_error = Some(Error::timeout("command ack", self.timeouts.command()));
                }
                AckOutcome::LinkClosed => {
                    last_error =
                        Some(Error::Connection("link closed awaiting ack".to_owned()));
                    break;
                }
            }
        }
        // never leave the robot mid-motion on a failed send
        let stop = ActuatorCommand::stopped(request.command.targets().len());
        if let Err(error) = self.transmit_stop(stop).await {
            warn!("Automatic stop after failed command also failed: {}", error);
        }
        let error = last_error
            .unwrap_or_else(|| Error::Connection("command could not be sent".to_owned()));
        let _ = request.responder.send(Err(error));
    }

    /// Waits for the ack of `seq`. Stale acks from abandoned attempts are
    /// discarded. A concurrent stop request interrupts the wait so it can be
    /// transmitted ahead of the pending ack.
    async fn await_ack(&mut self, seq: u32) -> AckOutcome {
        let deadline = tokio::time::Instant::now() + self.timeouts.command();
        loop {
            tokio::select! {
                biased;
                stop = self.stop_receiver.recv() => match stop {
                    Some(request) => return AckOutcome::StopRequested(request),
                    None => return AckOutcome::LinkClosed,
                },
                ack = self.ack_receiver.recv() => match ack {
                    Some(acked_seq) if acked_seq == seq => return AckOutcome::Acked,
                    Some(stale) => {
                        trace!("Discarding stale ack {}", stale);
                    }
                    None => return AckOutcome::LinkClosed,
                },
                _ = tokio::time::sleep_until(deadline) => return AckOutcome::TimedOut,
            }
        }
    }

    fn allocate_seq(&mut self) -> u32 {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.next_seq
    }
}

enum AckOutcome {
    Acked,
    StopRequested(QueuedCommand),
    TimedOut,
    LinkClosed,
}
