//! Socket addressing for the guest-agent channel.
//!
//! The runtime reaches the in-guest agent over one of several vsock-style
//! transports. The address is persisted with the sandbox so a reconnecting
//! supervisor dials the same endpoint.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{VmpodError, VmpodResult};

/// Address of the guest-agent socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scheme")]
pub enum Transport {
    /// Native AF_VSOCK: guest context id plus port.
    VSock { cid: u32, port: u32 },
    /// Hybrid vsock: a host unix socket multiplexing guest ports
    /// (firecracker/cloud-hypervisor style `CONNECT` handshake).
    HybridVSock { uds: PathBuf, port: u32 },
    /// Remote socket given as a URL (`unix:///path`).
    RemoteSock { url: String },
    /// In-process endpoint for tests; never dialed.
    Mock,
}

impl Transport {
    pub fn vsock(cid: u32, port: u32) -> Self {
        Transport::VSock { cid, port }
    }

    pub fn hybrid_vsock(uds: impl Into<PathBuf>, port: u32) -> Self {
        Transport::HybridVSock {
            uds: uds.into(),
            port,
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Transport::RemoteSock { url: url.into() }
    }

    /// Render the canonical URI form stored in the sandbox state blob.
    pub fn to_uri(&self) -> String {
        match self {
            Transport::VSock { cid, port } => format!("vsock://{}:{}", cid, port),
            Transport::HybridVSock { uds, port } => {
                format!("hvsock://{}:{}", uds.display(), port)
            }
            Transport::RemoteSock { url } => url.clone(),
            Transport::Mock => "mock://".to_string(),
        }
    }

    /// Parse a URI previously produced by [`Transport::to_uri`].
    pub fn parse(uri: &str) -> VmpodResult<Self> {
        if uri == "mock://" {
            return Ok(Transport::Mock);
        }
        if let Some(rest) = uri.strip_prefix("vsock://") {
            let (cid, port) = split_host_port(rest)
                .ok_or_else(|| VmpodError::ConfigInvalid(format!("bad vsock uri: {}", uri)))?;
            let cid = cid
                .parse()
                .map_err(|_| VmpodError::ConfigInvalid(format!("bad vsock cid in {}", uri)))?;
            let port = port
                .parse()
                .map_err(|_| VmpodError::ConfigInvalid(format!("bad vsock port in {}", uri)))?;
            return Ok(Transport::VSock { cid, port });
        }
        if let Some(rest) = uri.strip_prefix("hvsock://") {
            let (path, port) = split_host_port(rest)
                .ok_or_else(|| VmpodError::ConfigInvalid(format!("bad hvsock uri: {}", uri)))?;
            let port = port
                .parse()
                .map_err(|_| VmpodError::ConfigInvalid(format!("bad hvsock port in {}", uri)))?;
            return Ok(Transport::HybridVSock {
                uds: PathBuf::from(path),
                port,
            });
        }
        if uri.starts_with("unix://") {
            return Ok(Transport::RemoteSock {
                url: uri.to_string(),
            });
        }
        Err(VmpodError::ConfigInvalid(format!(
            "unrecognized transport uri: {}",
            uri
        )))
    }
}

/// Split `"<host>:<port>"` on the last colon so unix paths may contain colons.
fn split_host_port(s: &str) -> Option<(&str, &str)> {
    let idx = s.rfind(':')?;
    let (host, port) = s.split_at(idx);
    if host.is_empty() || port.len() < 2 {
        return None;
    }
    Some((host, &port[1..]))
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsock_uri_round_trip() {
        let t = Transport::vsock(3, 1024);
        assert_eq!(t.to_uri(), "vsock://3:1024");
        assert_eq!(Transport::parse(&t.to_uri()).unwrap(), t);
    }

    #[test]
    fn hybrid_uri_round_trip() {
        let t = Transport::hybrid_vsock("/run/vmpod/s1/agent.sock", 1024);
        assert_eq!(t.to_uri(), "hvsock:///run/vmpod/s1/agent.sock:1024");
        assert_eq!(Transport::parse(&t.to_uri()).unwrap(), t);
    }

    #[test]
    fn remote_uri_parses_as_unix_url() {
        let t = Transport::parse("unix:///tmp/agent.sock").unwrap();
        assert_eq!(
            t,
            Transport::RemoteSock {
                url: "unix:///tmp/agent.sock".into()
            }
        );
    }

    #[test]
    fn garbage_uri_is_config_invalid() {
        let err = Transport::parse("tcp://nope").unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }
}
