//! Hosting a protocol stack on its own thread against real time
//!
//! A [`ProtocolStack`] is single-threaded and only sees time move when its
//! host advances it. [`StackDriver`] is that host for production use: one
//! dedicated thread owns the stack, takes messages from both sides over a
//! command channel and sleeps until either a command arrives or the next
//! callback is due. Elapsed wall-clock time since spawn becomes the stack's
//! timeline, so timer firing and message handling stay serialized.

use crate::error::PipelineError;
use crate::stack::ProtocolStack;
use core_types::Instant;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// A message that left the hosted stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackOutput<M> {
    /// Left the bottom of the stack, bound for the transport
    ToTransport(M),
    /// Left the top of the stack, bound for the application
    ToApplication(M),
}

/// Errors from driving a stack on its thread
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to spawn driver thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("driver thread is no longer running")]
    Disconnected,

    #[error("driver thread panicked")]
    Panicked,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

type Reply = mpsc::Sender<Result<(), PipelineError>>;

enum DriverCommand<M> {
    Send(M, Reply),
    Receive(M, Reply),
    Stop,
}

/// Handle to a stack running on a driver thread
///
/// Dropping the handle asks the stack to stop but does not wait for it.
/// Use [`StackDriver::shutdown`] to stop and join.
pub struct StackDriver<M> {
    commands: mpsc::Sender<DriverCommand<M>>,
    handle: Option<JoinHandle<Result<(), PipelineError>>>,
}

impl<M: Send + 'static> StackDriver<M> {
    /// Spawns a thread that builds a stack with `build`, starts it and runs it
    ///
    /// The stack is built on the driver thread, so its stages need not be
    /// `Send`. Returns the handle and the receiver for everything the stack
    /// emits.
    pub fn spawn<F>(
        name: impl Into<String>,
        build: F,
    ) -> Result<(Self, mpsc::Receiver<StackOutput<M>>), DriverError>
    where
        F: FnOnce() -> ProtocolStack<M> + Send + 'static,
    {
        let name = name.into();
        let (command_tx, command_rx) = mpsc::channel();
        let (output_tx, output_rx) = mpsc::channel();

        debug!(thread = %name, "spawning stack driver thread");
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let stack = build();
                DriverLoop::new(stack, command_rx, output_tx).run()
            })
            .map_err(DriverError::Spawn)?;

        Ok((
            Self {
                commands: command_tx,
                handle: Some(handle),
            },
            output_rx,
        ))
    }

    /// Sends `message` down through the stack and waits for it to be handled
    pub fn send(&self, message: M) -> Result<(), DriverError> {
        self.request(|reply| DriverCommand::Send(message, reply))
    }

    /// Delivers `message` up through the stack and waits for it to be handled
    pub fn receive(&self, message: M) -> Result<(), DriverError> {
        self.request(|reply| DriverCommand::Receive(message, reply))
    }

    /// Stops the stack, waits for every stage to acknowledge and joins the thread
    pub fn shutdown(mut self) -> Result<(), DriverError> {
        // The thread may already have exited; joining reports why.
        let _ = self.commands.send(DriverCommand::Stop);
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| DriverError::Panicked)??;
        }
        Ok(())
    }

    fn request(
        &self,
        command: impl FnOnce(Reply) -> DriverCommand<M>,
    ) -> Result<(), DriverError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(command(reply_tx))
            .map_err(|_| DriverError::Disconnected)?;
        reply_rx.recv().map_err(|_| DriverError::Disconnected)??;
        Ok(())
    }
}

impl<M> Drop for StackDriver<M> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.commands.send(DriverCommand::Stop);
        }
    }
}

/// The loop that runs on the driver thread
struct DriverLoop<M> {
    stack: ProtocolStack<M>,
    commands: mpsc::Receiver<DriverCommand<M>>,
    output: mpsc::Sender<StackOutput<M>>,
    origin: std::time::Instant,
}

impl<M: 'static> DriverLoop<M> {
    fn new(
        stack: ProtocolStack<M>,
        commands: mpsc::Receiver<DriverCommand<M>>,
        output: mpsc::Sender<StackOutput<M>>,
    ) -> Self {
        Self {
            stack,
            commands,
            output,
            origin: std::time::Instant::now(),
        }
    }

    fn now(&self) -> Instant {
        Instant::from_elapsed(self.origin.elapsed())
    }

    fn run(mut self) -> Result<(), PipelineError> {
        self.stack.start()?;
        self.flush();
        info!(pipeline = %self.stack.id(), "stack driver running");

        let mut connected = true;
        while !self.stack.is_stopped() {
            let command = match (self.stack.next_deadline(), connected) {
                (Some(deadline), true) => {
                    let wait = deadline.saturating_duration_since(self.now());
                    match self.commands.recv_timeout(wait.to_std()) {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => {
                            connected = false;
                            Some(DriverCommand::Stop)
                        }
                    }
                }
                (Some(deadline), false) => {
                    thread::sleep(deadline.saturating_duration_since(self.now()).to_std());
                    None
                }
                (None, true) => match self.commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => {
                        connected = false;
                        Some(DriverCommand::Stop)
                    }
                },
                (None, false) => {
                    // No sender and no callback left: the stages still
                    // stopping can never acknowledge.
                    warn!(pipeline = %self.stack.id(), "driver abandoned with stages still stopping");
                    break;
                }
            };

            let now = self.now();
            if let Err(err) = self.stack.advance_to(now) {
                error!(pipeline = %self.stack.id(), error = %err, "callback failed");
            }

            match command {
                Some(DriverCommand::Send(message, reply)) => {
                    let result = self.stack.send(message);
                    if let Err(err) = &result {
                        error!(pipeline = %self.stack.id(), error = %err, "send rejected");
                    }
                    let _ = reply.send(result);
                }
                Some(DriverCommand::Receive(message, reply)) => {
                    let result = self.stack.receive(message);
                    if let Err(err) = &result {
                        error!(pipeline = %self.stack.id(), error = %err, "receive rejected");
                    }
                    let _ = reply.send(result);
                }
                Some(DriverCommand::Stop) => self.stack.stop()?,
                None => {}
            }

            self.flush();
        }

        info!(pipeline = %self.stack.id(), "stack driver exiting");
        Ok(())
    }

    /// Forwards everything the stack emitted; a dropped receiver is not an error
    fn flush(&mut self) {
        for message in self.stack.drain_outgoing() {
            let _ = self.output.send(StackOutput::ToTransport(message));
        }
        for message in self.stack.drain_incoming() {
            let _ = self.output.send(StackOutput::ToApplication(message));
        }
    }
}
