//! The JSON configuration message sent by the client after authenticating.
//!
//! The message mirrors the client's configuration file: a map of named
//! sections, each listing the public ports to bind (`remote_port`, a
//! comma-separated list), the transport (`type`, defaulting to `udp`) and the
//! client-side target (`local_ip` / `local_port`, which the server ignores).
//! Port lists stay string-encoded on the wire. Sections named `common` or
//! `DEFAULT` carry endpoint settings rather than forwards and are skipped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PortType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<String>,
    pub remote_port: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub port_type: Option<String>,
}

impl Section {
    pub fn port_type(&self) -> Result<PortType, Error> {
        match &self.port_type {
            None => Ok(PortType::Udp),
            Some(s) => s.parse().map_err(|_| Error::BadPortType(s.clone())),
        }
    }

    pub fn remote_ports(&self) -> Result<Vec<u16>, Error> {
        parse_port_list(&self.remote_port)
    }
}

pub fn encode(sections: &BTreeMap<String, Section>) -> Vec<u8> {
    serde_json::to_vec(sections).expect("maps of plain strings always serialize")
}

/// Parses the configuration message, dropping non-forward sections.
pub fn decode(message: &[u8]) -> Result<Vec<(String, Section)>, Error> {
    let raw: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(message).map_err(Error::Json)?;

    raw.into_iter()
        .filter(|(name, _)| name != "common" && name != "DEFAULT")
        .map(|(name, value)| {
            let section = serde_json::from_value(value).map_err(Error::Json)?;

            Ok((name, section))
        })
        .collect()
}

pub fn parse_port_list(list: &str) -> Result<Vec<u16>, Error> {
    list.split(',')
        .map(|p| {
            let p = p.trim();

            p.parse()
                .map_err(|_| Error::BadPort(p.to_owned()))
                .and_then(|p| if p == 0 { Err(Error::BadPort("0".to_owned())) } else { Ok(p) })
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed configuration message: {0}")]
    Json(#[source] serde_json::Error),
    #[error("`{0}` is not a valid port number")]
    BadPort(String),
    #[error("`{0}` is not a valid port type")]
    BadPortType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_sections_and_skips_common() {
        let message = br#"{
            "common": {"server_addr": "198.51.100.4", "server_port": "16262"},
            "zomboid": {"local_ip": "127.0.0.1", "local_port": "16261", "remote_port": "16261"},
            "rcon": {"local_ip": "127.0.0.1", "local_port": "27015", "remote_port": "27015", "type": "tcp"}
        }"#;

        let sections = decode(message).unwrap();

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].0, "rcon");
        assert_eq!(sections[0].1.port_type().unwrap(), PortType::Tcp);
        assert_eq!(sections[1].1.port_type().unwrap(), PortType::Udp);
        assert_eq!(sections[1].1.remote_ports().unwrap(), vec![16261]);
    }

    #[test]
    fn roundtrips_through_encode() {
        let mut sections = BTreeMap::new();
        sections.insert(
            "game".to_owned(),
            Section {
                local_ip: Some("127.0.0.1".to_owned()),
                local_port: Some("40001,40002".to_owned()),
                remote_port: "40000,40003".to_owned(),
                port_type: Some("udp".to_owned()),
            },
        );

        let decoded = decode(&encode(&sections)).unwrap();

        assert_eq!(decoded, sections.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn parses_port_lists_with_whitespace() {
        assert_eq!(parse_port_list("40000, 40001").unwrap(), vec![40000, 40001]);
    }

    #[test]
    fn rejects_non_numeric_and_zero_ports() {
        assert!(parse_port_list("forty").is_err());
        assert!(parse_port_list("0").is_err());
        assert!(parse_port_list("65536").is_err());
    }

    #[test]
    fn rejects_unknown_port_type() {
        let section = Section {
            local_ip: None,
            local_port: None,
            remote_port: "1".to_owned(),
            port_type: Some("sctp".to_owned()),
        };

        assert!(section.port_type().is_err());
    }

    #[test]
    fn missing_remote_port_is_an_error() {
        assert!(decode(br#"{"game": {"local_ip": "127.0.0.1"}}"#).is_err());
    }
}
