//! Adapter Wire Protocol
//!
//! Line-oriented ASCII exchanged with plug-and-play boards. Every message is
//! CRLF-terminated lines closed by one blank line. The opening token names
//! the message kind; state reports carry `<name> <signal> <value>` triples.

use std::fmt;

/// A complete packet ends with an empty line.
pub const PACKET_TERMINATOR: &str = "\r\n\r\n";

/// Parsed ingress message from a board.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingress {
    DeviceStates(Vec<StateEntry>),
    PoliteDisconnect,
    /// Recognized framing, unrecognized kind; answered with `UnknownHeader`.
    Unknown(String),
}

/// One reported signal value. `name` is unscoped here; the session prefixes
/// its identifier before lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub name: String,
    pub signal: String,
    pub value: f64,
}

/// Body-level parse failures. These produce no wire reply at all, so an
/// unresponsive or garbled board ages out on its heartbeat.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("truncated state triple")]
    Truncated,

    #[error("unparseable signal value: {0}")]
    BadValue(String),
}

/// Replies sent back to the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireReply {
    Received,
    UnknownDevice,
    DuplicateDevice,
    UnknownHeader,
    PoliteDisconnectAccepted,
}

impl WireReply {
    pub fn as_wire(&self) -> &'static str {
        match self {
            WireReply::Received => "Received\r\n\r\n",
            WireReply::UnknownDevice => "UnknownDevice\r\n\r\n",
            WireReply::DuplicateDevice => "DuplicateDevice\r\n\r\n",
            WireReply::UnknownHeader => "UnknownHeader\r\n\r\n",
            WireReply::PoliteDisconnectAccepted => "PoliteDisconnect: Accepted\r\n\r\n",
        }
    }
}

impl fmt::Display for WireReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire().trim_end())
    }
}

/// Parse one packet body (terminator already stripped by the framer).
pub fn parse_packet(body: &str) -> Result<Ingress, PacketError> {
    let mut tokens = body.split_whitespace();
    let header = tokens.next().ok_or(PacketError::Empty)?;

    match header {
        "DeviceStates" => {
            let rest: Vec<&str> = tokens.collect();
            if rest.len() % 3 != 0 {
                return Err(PacketError::Truncated);
            }
            let mut entries = Vec::with_capacity(rest.len() / 3);
            for triple in rest.chunks(3) {
                let value: f64 = triple[2]
                    .parse()
                    .map_err(|_| PacketError::BadValue(triple[2].to_string()))?;
                entries.push(StateEntry {
                    name: triple[0].to_string(),
                    signal: triple[1].to_string(),
                    value,
                });
            }
            Ok(Ingress::DeviceStates(entries))
        }
        "PoliteDisconnect" => Ok(Ingress::PoliteDisconnect),
        other => Ok(Ingress::Unknown(other.to_string())),
    }
}

/// Build an egress command packet: `<local-name> <signal> <value>` lines
/// followed by the closing blank line.
pub fn build_command_packet(commands: &[(String, String, f64)]) -> String {
    let mut packet = String::new();
    for (name, signal, value) in commands {
        packet.push_str(&format!("{} {} {}\r\n", name, signal, value));
    }
    packet.push_str("\r\n");
    packet
}
