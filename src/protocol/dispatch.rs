//! The two halves of the protocol state machine.
//!
//! [`serve`] is one consumer-side step: decode a request, talk to the broker, encode
//! the reply. [`respond`] is one worker-side step: act on the consumer's reply and
//! prepare the next request. Transports only move bytes and decide what to do when a
//! step fails.
use log::{debug, error, warn};
use thiserror::Error;

use crate::{broker::BrokerPort, payload::Processable};

use super::{
    Command, CommandEnvelope, EnvelopeError, SerializationMode,
    codec::{self, CodecError},
};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("got unknown or invalid command {0}")]
    UnexpectedCommand(Command),
    #[error("payload is empty even though a {0} command requires one")]
    EmptyPayload(Command),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What a worker should do after [`respond`] has handled a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Send the envelope right away.
    Send,
    /// Sleep a random interval, then send the envelope.
    Backoff,
}

/// Handles one request on the consumer side and returns the encoded reply.
///
/// `GETDATA` is answered with `COMPUTE` or `NODATA` depending on whether the broker
/// produced an item within its timeout. `RESULT` first hands the payload back to the
/// broker and is then answered like `GETDATA`.
pub fn serve<P: Processable>(
    request: &[u8],
    envelope: &mut CommandEnvelope<P>,
    port: &BrokerPort<P>,
    mode: SerializationMode,
) -> Result<Vec<u8>, DispatchError> {
    *envelope = codec::from_bytes(request, mode)?;

    match envelope.command() {
        Command::GetData => {}
        Command::Result => {
            let item = envelope
                .take_payload()
                .ok_or(ProtocolError::EmptyPayload(Command::Result))?;
            port.put_payload_item(item);
        }
        other => return Err(ProtocolError::UnexpectedCommand(other).into()),
    }

    match port.get_payload_item() {
        Some(item) => envelope.reset(Command::Compute, Some(item)),
        None => envelope.reset(Command::NoData, None),
    };
    debug!("replying with {}", envelope.command());

    match codec::to_bytes(envelope, mode) {
        Err(CodecError::NonFinite { source, .. }) if envelope.command() == Command::Compute => {
            error!("work item cannot be sent in {mode} mode and will be discarded: {source}");
            envelope.reset(Command::NoData, None);
            Ok(codec::to_bytes(envelope, mode)?)
        }
        reply => Ok(reply?),
    }
}

/// Encodes the next request of a worker.
///
/// A result the wire format cannot carry is discarded and replaced with `GETDATA`,
/// so the worker keeps running.
pub fn encode_request<P: Processable>(
    envelope: &mut CommandEnvelope<P>,
    mode: SerializationMode,
) -> Result<Vec<u8>, CodecError> {
    match codec::to_bytes(envelope, mode) {
        Err(CodecError::NonFinite { source, .. }) if envelope.command() == Command::Result => {
            error!("processed item cannot be sent in {mode} mode and will be discarded: {source}");
            envelope.reset(Command::GetData, None);
            codec::to_bytes(envelope, mode)
        }
        request => request,
    }
}

/// Handles one reply on the worker side, leaving the next request in `envelope`.
///
/// `COMPUTE` items are processed on the calling thread. `ERROR` is only a valid
/// reply on transports that pass `accept_error`; there it is treated like `NODATA`.
pub fn respond<P: Processable>(
    envelope: &mut CommandEnvelope<P>,
    accept_error: bool,
) -> Result<Next, ProtocolError> {
    match envelope.command() {
        Command::Compute => {
            if envelope.payload().is_none() {
                return Err(ProtocolError::EmptyPayload(Command::Compute));
            }
            match envelope.process() {
                Ok(()) => envelope.set_command(Command::Result),
                Err(e) => {
                    warn!("work item failed to process and will be discarded: {e}");
                    envelope.reset(Command::GetData, None);
                }
            }
            Ok(Next::Send)
        }
        Command::NoData => {
            envelope.reset(Command::GetData, None);
            Ok(Next::Backoff)
        }
        Command::Error if accept_error => {
            envelope.reset(Command::GetData, None);
            Ok(Next::Backoff)
        }
        other => Err(ProtocolError::UnexpectedCommand(other)),
    }
}
