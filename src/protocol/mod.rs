//! Transport-independent command protocol.
//!
//! Every transport in this crate moves the same unit over the wire: a
//! [`CommandEnvelope`], i.e. a [`Command`] plus an optional payload. This module
//! defines the envelope, its wire formats, and the two halves of the protocol state
//! machine that every consumer/client pair shares.
//!
//! # Exchange
//!
//! A worker always speaks first. Its first message is `GETDATA`; every following
//! message is `RESULT`, carrying the item it just processed. The consumer answers
//! either message with `COMPUTE` (a new item) or `NODATA` (the broker had nothing
//! within its timeout). Attaching the result to the next request saves a round trip
//! per item.
//!
//! ```text
//! worker                          consumer
//!   | ---- GETDATA -----------------> |
//!   | <--- COMPUTE(item) ------------ |
//!   | ---- RESULT(item) ------------> |  put result, get next
//!   | <--- COMPUTE(item) | NODATA --- |
//! ```
//!
//! # Wire formats
//!
//! The whole envelope is serialized in one of three modes picked by configuration,
//! see [`SerializationMode`]. Command values are stable on the wire:
//! `NONE=0, GETDATA=1, COMPUTE=2, RESULT=3, NODATA=4, ERROR=5`.
//!
//! # Key Components
//!
//! - [`CommandEnvelope`]: The command/payload pair owned by a session or client.
//! - [`codec`]: Serialization of envelopes in every [`SerializationMode`].
//! - [`dispatch`]: The consumer-side and worker-side protocol steps.
//! - [`finite`]: Detection of floats the text formats cannot carry.
//!
//! # See Also
//!
//! - [`consumer`](crate::consumer): Transports built on top of this protocol.
pub mod codec;
mod command;
pub mod dispatch;
mod envelope;
pub mod finite;

pub use codec::{CodecError, SerializationMode};
pub use command::{Command, UnknownCommand};
pub use dispatch::{DispatchError, Next, ProtocolError};
pub use envelope::{CommandEnvelope, EnvelopeError};
