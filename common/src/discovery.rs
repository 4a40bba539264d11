//! Text protocol spoken by the discovery responder.
//!
//! Requests are `<COMMAND> <param> [<param> ...]` in a single datagram.
//! Replies are `ID <name> <address>` or `ERR <code> <message>`.

use std::net::Ipv4Addr;

use thiserror::Error;

pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 173, 63);
pub const DEFAULT_PORT: u16 = 1200;
pub const WILDCARD_NAME: &str = "any";

pub const ERR_MALFORMED: u16 = 400;
pub const ERR_UNSUPPORTED: u16 = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("error unpacking action/parameters")]
    Malformed,
    #[error("error unpacking parameters in {0}")]
    MissingParameter(String),
    #[error("action not supported: {0}")]
    Unsupported(String),
}

impl DiscoveryError {
    pub fn code(&self) -> u16 {
        match self {
            Self::Malformed | Self::MissingParameter(_) => ERR_MALFORMED,
            Self::Unsupported(_) => ERR_UNSUPPORTED,
        }
    }

    pub fn reply(&self) -> String {
        format!("ERR {} {}", self.code(), self)
    }
}

pub fn parse_datagram(raw: &[u8]) -> Result<Command, DiscoveryError> {
    let text = std::str::from_utf8(raw).map_err(|_| DiscoveryError::Malformed)?;
    let text = text.trim_end_matches(['\r', '\n']);
    let (action, params) = text.split_once(' ').ok_or(DiscoveryError::Malformed)?;
    let mut params = params.split(' ');

    match action {
        "ID" => {
            let name = params
                .next()
                .filter(|name| !name.is_empty())
                .ok_or_else(|| DiscoveryError::MissingParameter(action.to_string()))?;
            Ok(Command::Identify {
                name: name.to_ascii_lowercase(),
            })
        }
        other => Err(DiscoveryError::Unsupported(other.to_string())),
    }
}

/// Reply for an identify query, or `None` when the query targets another
/// device.
pub fn identify_reply(
    queried: &str,
    device_name: &str,
    address: Option<Ipv4Addr>,
) -> Option<String> {
    if queried != WILDCARD_NAME && queried != device_name {
        return None;
    }
    let address = address.unwrap_or(Ipv4Addr::UNSPECIFIED);
    Some(format!("ID {device_name} {address}"))
}
