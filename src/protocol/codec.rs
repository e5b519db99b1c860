use std::{fmt, str::Utf8Error};

use bincode::config::{BigEndian, Configuration, Fixint};
use quick_xml::{
    Reader, Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use super::{
    Command, CommandEnvelope,
    command::UnknownCommand,
    finite::{self, NonFinite},
};

const XML_ROOT: &str = "command_container";
const XML_COMMAND: &str = "command";
const XML_PAYLOAD: &str = "payload";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("text codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("xml codec error: {0}")]
    Xml(String),
    #[error("message is not valid UTF-8: {0}")]
    Utf8(#[from] Utf8Error),
    #[error("message is missing the <{0}> element")]
    MissingElement(&'static str),
    #[error("invalid command value '{0}'")]
    InvalidCommand(String),
    #[error(transparent)]
    UnknownCommand(#[from] UnknownCommand),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("payload cannot be encoded without loss in {mode} mode: {source}")]
    NonFinite {
        mode: SerializationMode,
        source: NonFinite,
    },
}

/// Wire format used for every envelope of a consumer and its clients.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SerializationMode {
    Text,
    Xml,
    #[default]
    Binary,
}

impl fmt::Display for SerializationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SerializationMode::Text => "text",
            SerializationMode::Xml => "xml",
            SerializationMode::Binary => "binary",
        };
        f.write_str(name)
    }
}

#[derive(Serialize)]
struct WireRef<'a, P> {
    command: u8,
    payload: Option<&'a P>,
}

#[derive(Deserialize)]
struct Wire<P> {
    command: u8,
    payload: Option<P>,
}

fn binary_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

fn xml_error(err: impl fmt::Display) -> CodecError {
    CodecError::Xml(err.to_string())
}

/// Serializes an envelope in the given mode.
///
/// Text and XML refuse payloads holding NaN or infinite floats, which JSON would
/// turn into `null`.
pub fn to_bytes<P: Serialize>(
    envelope: &CommandEnvelope<P>,
    mode: SerializationMode,
) -> Result<Vec<u8>, CodecError> {
    if let (SerializationMode::Text | SerializationMode::Xml, Some(payload)) =
        (mode, envelope.payload())
    {
        finite::check(payload).map_err(|source| CodecError::NonFinite { mode, source })?;
    }

    let wire = WireRef {
        command: envelope.command().into(),
        payload: envelope.payload(),
    };

    match mode {
        SerializationMode::Text => Ok(serde_json::to_vec(&wire)?),
        SerializationMode::Binary => Ok(bincode::serde::encode_to_vec(&wire, binary_config())?),
        SerializationMode::Xml => to_xml(&wire),
    }
}

/// Deserializes an envelope previously produced by [`to_bytes`] with the same mode.
pub fn from_bytes<P: DeserializeOwned>(
    data: &[u8],
    mode: SerializationMode,
) -> Result<CommandEnvelope<P>, CodecError> {
    let wire: Wire<P> = match mode {
        SerializationMode::Text => serde_json::from_slice(data)?,
        SerializationMode::Binary => {
            let (wire, read) = bincode::serde::decode_from_slice(data, binary_config())?;
            if read != data.len() {
                return Err(CodecError::TrailingBytes(data.len() - read));
            }
            wire
        }
        SerializationMode::Xml => from_xml(data)?,
    };

    let command = Command::try_from(wire.command)?;
    Ok(CommandEnvelope::new(command, wire.payload))
}

fn to_xml<P: Serialize>(wire: &WireRef<'_, P>) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer::new(Vec::new());

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Start(BytesStart::new(XML_ROOT)))
        .map_err(xml_error)?;
    write_xml_element(&mut writer, XML_COMMAND, &wire.command.to_string())?;
    if let Some(payload) = wire.payload {
        let payload = serde_json::to_string(payload)?;
        write_xml_element(&mut writer, XML_PAYLOAD, &payload)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(XML_ROOT)))
        .map_err(xml_error)?;

    Ok(writer.into_inner())
}

fn write_xml_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> Result<(), CodecError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)?;
    Ok(())
}

fn from_xml<P: DeserializeOwned>(data: &[u8]) -> Result<Wire<P>, CodecError> {
    let text = std::str::from_utf8(data)?;
    let mut reader = Reader::from_str(text);

    let mut seen_root = false;
    let mut current: Option<Vec<u8>> = None;
    let mut command: Option<String> = None;
    let mut payload: Option<String> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(element) => {
                let name = element.name().as_ref().to_vec();
                if name == XML_ROOT.as_bytes() {
                    seen_root = true;
                }
                current = Some(name);
            }
            Event::Text(content) => {
                let value = content.unescape().map_err(xml_error)?.into_owned();
                match current.as_deref() {
                    Some(name) if name == XML_COMMAND.as_bytes() => {
                        command.get_or_insert_with(String::new).push_str(&value)
                    }
                    Some(name) if name == XML_PAYLOAD.as_bytes() => {
                        payload.get_or_insert_with(String::new).push_str(&value)
                    }
                    _ => {}
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(CodecError::MissingElement(XML_ROOT));
    }
    let command = command.ok_or(CodecError::MissingElement(XML_COMMAND))?;
    let command = command
        .trim()
        .parse::<u8>()
        .map_err(|_| CodecError::InvalidCommand(command.clone()))?;
    let payload = match payload {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };

    Ok(Wire { command, payload })
}
