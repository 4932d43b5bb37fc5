//! INI configuration files for both endpoints.
//!
//! The format is the familiar INI subset: `[section]` headers,
//! `key = value` pairs, `;`/`#` comments, keys case-insensitive. Endpoint
//! settings live in `[common]`; every other section of a client config
//! describes one forward.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use passage_wire::PortType;
use passage_wire::peer_config::{self, Section};
use secrecy::SecretString;

pub const DEFAULT_SERVER_CONFIG: &str = "server.ini";
pub const DEFAULT_CLIENT_CONFIG: &str = "client.ini";

type Ini = BTreeMap<String, BTreeMap<String, String>>;

/// `[common]` settings of the server.
#[derive(Debug)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub bind_port: u16,
    /// Moved out (not cloned) when the session core is constructed, so the
    /// config no longer holds the secret afterwards.
    pub token: SecretString,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let ini = parse(&read(path)?)?;
        let mut common = common_section(&ini)?;

        Ok(Self {
            bind_addr: match common.remove("bind_addr") {
                None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                Some(addr) => addr
                    .parse()
                    .map_err(|_| Error::BadValue("bind_addr", addr))?,
            },
            bind_port: parse_port("bind_port", common.remove("bind_port"))?,
            token: parse_token(common.remove("token"))?,
            log_file: common.remove("log_file").map(PathBuf::from),
            log_level: common.remove("log_level"),
        })
    }
}

/// `[common]` settings of the client plus its forward sections.
#[derive(Debug)]
pub struct ClientConfig {
    pub server_addr: String,
    pub server_port: u16,
    pub token: SecretString,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub forwards: Vec<Forward>,
}

/// One `[section]` of the client config: public ports on the server paired
/// positionally with ports of a local service.
#[derive(Debug, Clone)]
pub struct Forward {
    pub name: String,
    pub port_type: PortType,
    pub local_ip: Ipv4Addr,
    /// `(local_port, remote_port)` pairs.
    pub ports: Vec<(u16, u16)>,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let ini = parse(&read(path)?)?;
        let mut common = common_section(&ini)?;

        let mut forwards = Vec::new();
        for (name, section) in &ini {
            if name == "common" || name == "DEFAULT" {
                continue;
            }

            forwards.push(Forward::from_section(name, section)?);
        }

        reject_duplicates(&forwards)?;

        Ok(Self {
            server_addr: common
                .remove("server_addr")
                .ok_or(Error::MissingKey("server_addr"))?
                .trim()
                .to_owned(),
            server_port: parse_port("server_port", common.remove("server_port"))?,
            token: parse_token(common.remove("token"))?,
            log_file: common.remove("log_file").map(PathBuf::from),
            log_level: common.remove("log_level"),
            forwards,
        })
    }

    /// The configuration message sent over the transit channel (§ handshake).
    pub fn wire_sections(&self) -> BTreeMap<String, Section> {
        self.forwards
            .iter()
            .map(|forward| {
                let (local_ports, remote_ports): (Vec<_>, Vec<_>) =
                    forward.ports.iter().copied().unzip();

                (
                    forward.name.clone(),
                    Section {
                        local_ip: Some(forward.local_ip.to_string()),
                        local_port: Some(join_ports(&local_ports)),
                        remote_port: join_ports(&remote_ports),
                        port_type: Some(forward.port_type.to_string()),
                    },
                )
            })
            .collect()
    }
}

impl Forward {
    fn from_section(name: &str, section: &BTreeMap<String, String>) -> Result<Self, Error> {
        let local_ip = section
            .get("local_ip")
            .ok_or(Error::MissingKey("local_ip"))?;
        let local_ip = local_ip
            .parse()
            .map_err(|_| Error::BadValue("local_ip", local_ip.clone()))?;

        let local_ports = peer_config::parse_port_list(
            section
                .get("local_port")
                .ok_or(Error::MissingKey("local_port"))?,
        )?;
        let remote_ports = peer_config::parse_port_list(
            section
                .get("remote_port")
                .ok_or(Error::MissingKey("remote_port"))?,
        )?;

        if local_ports.len() != remote_ports.len() {
            return Err(Error::MismatchedPortLists {
                section: name.to_owned(),
            });
        }

        let port_type = match section.get("type") {
            None => PortType::Udp,
            Some(t) => t
                .parse()
                .map_err(|_| Error::BadValue("type", t.clone()))?,
        };

        Ok(Self {
            name: name.to_owned(),
            port_type,
            local_ip,
            ports: local_ports.into_iter().zip(remote_ports).collect(),
        })
    }
}

fn reject_duplicates(forwards: &[Forward]) -> Result<(), Error> {
    let mut remote_seen = BTreeMap::new();
    let mut local_seen = BTreeMap::new();

    for forward in forwards {
        for &(local, remote) in &forward.ports {
            if remote_seen.insert(remote, ()).is_some() {
                return Err(Error::DuplicateRemotePort(remote));
            }
            if local_seen
                .insert((forward.port_type, forward.local_ip, local), ())
                .is_some()
            {
                return Err(Error::DuplicateLocalTarget {
                    port_type: forward.port_type,
                    ip: forward.local_ip,
                    port: local,
                });
            }
        }
    }

    Ok(())
}

fn read(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_owned(),
        source,
    })
}

fn parse(text: &str) -> Result<Ini, Error> {
    let mut ini = Ini::new();
    let mut current: Option<String> = None;

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();

        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .ok_or(Error::Syntax { line: index + 1 })?
                .trim();

            ini.entry(name.to_owned()).or_default();
            current = Some(name.to_owned());
            continue;
        }

        let (key, value) = line.split_once('=').ok_or(Error::Syntax { line: index + 1 })?;
        let section = current.as_ref().ok_or(Error::Syntax { line: index + 1 })?;

        ini.entry(section.clone()).or_default().insert(
            key.trim().to_ascii_lowercase(),
            value.trim().to_owned(),
        );
    }

    Ok(ini)
}

fn common_section(ini: &Ini) -> Result<BTreeMap<String, String>, Error> {
    ini.get("common").cloned().ok_or(Error::MissingCommon)
}

fn parse_port(key: &'static str, value: Option<String>) -> Result<u16, Error> {
    let value = value.ok_or(Error::MissingKey(key))?;

    let port = value
        .parse::<u16>()
        .map_err(|_| Error::BadValue(key, value.clone()))?;
    if port == 0 {
        return Err(Error::BadValue(key, value));
    }

    Ok(port)
}

fn parse_token(value: Option<String>) -> Result<SecretString, Error> {
    let token = value.ok_or(Error::MissingKey("token"))?;
    let token = token.trim();

    if token.is_empty() {
        return Err(Error::EmptyToken);
    }

    Ok(SecretString::from(token))
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config file `{path}`")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed config on line {line}")]
    Syntax { line: usize },
    #[error("config has no [common] section")]
    MissingCommon,
    #[error("missing config option `{0}`")]
    MissingKey(&'static str),
    #[error("invalid value `{1}` for config option `{0}`")]
    BadValue(&'static str, String),
    #[error("`local_port` and `remote_port` of section [{section}] differ in length")]
    MismatchedPortLists { section: String },
    #[error("remote port {0} is mapped more than once")]
    DuplicateRemotePort(u16),
    #[error("local {port_type} target {ip}:{port} is mapped more than once")]
    DuplicateLocalTarget {
        port_type: PortType,
        ip: Ipv4Addr,
        port: u16,
    },
    #[error("token must not be empty")]
    EmptyToken,
    #[error(transparent)]
    PortList(#[from] peer_config::Error),
}
