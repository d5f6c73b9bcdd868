//! Broker endpoint URIs
//!
//! `nxtcp://host:port` (or the `tcp://` alias) for a network broker,
//! `unix:///path/to.sock` for a broker on the local machine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use url::{Host, Url};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "nxtcp",
            Self::Unix { .. } => "unix",
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|e| Error::InvalidEndpoint(format!("{}: {}", s, e)))?;

        match url.scheme() {
            "nxtcp" | "tcp" => {
                let host = match url.host() {
                    Some(Host::Domain(name)) if !name.is_empty() => name.to_string(),
                    Some(Host::Ipv4(addr)) => addr.to_string(),
                    Some(Host::Ipv6(addr)) => addr.to_string(),
                    _ => return Err(Error::InvalidEndpoint(format!("{}: missing host", s))),
                };
                let port = url
                    .port()
                    .ok_or_else(|| Error::InvalidEndpoint(format!("{}: missing port", s)))?;
                Ok(Self::Tcp { host, port })
            }
            "unix" => {
                match url.host() {
                    None | Some(Host::Domain("")) | Some(Host::Domain("localhost")) => {}
                    Some(host) => {
                        return Err(Error::InvalidEndpoint(format!(
                            "{}: unix endpoints cannot name a host ({})",
                            s, host
                        )))
                    }
                }
                let path = percent_decode_str(url.path())
                    .decode_utf8()
                    .map_err(|e| Error::InvalidEndpoint(format!("{}: {}", s, e)))?;
                if path.is_empty() || path == "/" {
                    return Err(Error::InvalidEndpoint(format!("{}: missing socket path", s)));
                }
                Ok(Self::Unix {
                    path: PathBuf::from(path.as_ref()),
                })
            }
            other => Err(Error::InvalidEndpoint(format!(
                "{}: unsupported scheme {:?}",
                s, other
            ))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => {
                write!(f, "nxtcp://[{}]:{}", host, port)
            }
            Self::Tcp { host, port } => write!(f, "nxtcp://{}:{}", host, port),
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nxtcp() {
        let endpoint: Endpoint = "nxtcp://localhost:9999".parse().unwrap();
        assert_eq!(endpoint, Endpoint::tcp("localhost", 9999));
        assert_eq!(endpoint.scheme(), "nxtcp");
        assert_eq!(endpoint.to_string(), "nxtcp://localhost:9999");
    }

    #[test]
    fn tcp_is_an_alias() {
        let endpoint: Endpoint = "tcp://broker.local:4747".parse().unwrap();
        assert_eq!(endpoint, Endpoint::tcp("broker.local", 4747));
        assert_eq!(endpoint.to_string().parse::<Endpoint>().unwrap(), endpoint);
    }

    #[test]
    fn parses_ipv6() {
        let endpoint: Endpoint = "nxtcp://[::1]:9000".parse().unwrap();
        assert_eq!(endpoint, Endpoint::tcp("::1", 9000));
        assert_eq!(endpoint.to_string(), "nxtcp://[::1]:9000");
    }

    #[test]
    fn parses_unix() {
        let endpoint: Endpoint = "unix:///run/courier/broker.sock".parse().unwrap();
        assert_eq!(endpoint, Endpoint::unix("/run/courier/broker.sock"));
        assert_eq!(endpoint.scheme(), "unix");
    }

    #[test]
    fn unix_path_is_percent_decoded() {
        let endpoint: Endpoint = "unix:///tmp/my%20broker.sock".parse().unwrap();
        assert_eq!(endpoint, Endpoint::unix("/tmp/my broker.sock"));

        let local: Endpoint = "unix://localhost/tmp/b.sock".parse().unwrap();
        assert_eq!(local, Endpoint::unix("/tmp/b.sock"));
    }

    #[test]
    fn rejects_bad_uris() {
        for uri in [
            "tcp://localhost",
            "http://localhost:80",
            "not a uri",
            "unix://",
            "tcp://:8080",
            "unix://broker-host/tmp/b.sock",
        ] {
            let result = uri.parse::<Endpoint>();
            assert!(
                matches!(result, Err(Error::InvalidEndpoint(_))),
                "{} should be rejected",
                uri
            );
        }
    }
}
