use thiserror::Error;

use crate::payload::{ProcessError, Processable};

use super::Command;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("tried to process a work item while the payload is empty")]
    MissingPayload,
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// A command plus an optional payload; the unit exchanged between consumer and worker.
///
/// An envelope is owned by exactly one session or client and is reset between
/// exchanges instead of being recreated.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope<P> {
    command: Command,
    payload: Option<P>,
}

impl<P> Default for CommandEnvelope<P> {
    fn default() -> Self {
        Self {
            command: Command::None,
            payload: None,
        }
    }
}

impl<P> CommandEnvelope<P> {
    pub fn new(command: Command, payload: Option<P>) -> Self {
        Self { command, payload }
    }

    pub fn reset(&mut self, command: Command, payload: Option<P>) -> &mut Self {
        self.command = command;
        self.payload = payload;
        self
    }

    pub fn set_command(&mut self, command: Command) {
        self.command = command;
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    pub fn take_payload(&mut self) -> Option<P> {
        self.payload.take()
    }

    /// COMPUTE and RESULT carry a payload, every other command does not.
    pub fn is_consistent(&self) -> bool {
        self.command.requires_payload() == self.payload.is_some()
    }
}

impl<P: Processable> CommandEnvelope<P> {
    pub fn process(&mut self) -> Result<(), EnvelopeError> {
        match self.payload.as_mut() {
            Some(payload) => Ok(payload.process()?),
            None => Err(EnvelopeError::MissingPayload),
        }
    }
}
