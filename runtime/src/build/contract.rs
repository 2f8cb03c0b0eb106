//! Runtime contract: the ports an image declares.
//!
//! Ports are advisory metadata recorded in the image config. Nothing here
//! opens or checks sockets; the only validation is the 1-65535 range.

use std::collections::BTreeSet;
use std::fmt;

use strata_core::error::{Result, StrataError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A declared port; renders as the image config key (`8000/tcp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for ExposedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Parse `8000`, `8000/tcp` or `53/udp`.
pub fn parse_port(spec: &str) -> Result<ExposedPort> {
    let (number, protocol) = match spec.split_once('/') {
        Some((number, proto)) => {
            let protocol = match proto.to_ascii_lowercase().as_str() {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                other => {
                    return Err(StrataError::InvalidPort(format!(
                        "{}: unknown protocol '{}'",
                        spec, other
                    )))
                }
            };
            (number, protocol)
        }
        None => (spec, Protocol::Tcp),
    };

    let port: u32 = number
        .trim()
        .parse()
        .map_err(|_| StrataError::InvalidPort(format!("{}: not a port number", spec)))?;
    if !(1..=65535).contains(&port) {
        return Err(StrataError::InvalidPort(format!(
            "{}: must be between 1 and 65535",
            spec
        )));
    }

    Ok(ExposedPort {
        port: port as u16,
        protocol,
    })
}

/// The set of ports an image declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExposedPortSet(BTreeSet<ExposedPort>);

impl ExposedPortSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports inherited from an image config. Keys that do not parse are
    /// dropped with a warning.
    pub fn from_config_keys(keys: &[String]) -> Self {
        let ports = keys
            .iter()
            .filter_map(|key| match parse_port(key) {
                Ok(port) => Some(port),
                Err(e) => {
                    tracing::warn!(port = %key, error = %e, "Ignoring invalid inherited port");
                    None
                }
            })
            .collect();
        Self(ports)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.iter().any(|p| p.port == port)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExposedPort> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys for the image config's `ExposedPorts` object, sorted.
    pub fn config_keys(&self) -> Vec<String> {
        self.0.iter().map(|p| p.to_string()).collect()
    }
}

/// Attach `ports` to a declared set, returning the new set.
pub fn declare(current: &ExposedPortSet, ports: &[ExposedPort]) -> ExposedPortSet {
    let mut next = current.clone();
    next.0.extend(ports.iter().copied());
    next
}
