//! Connection configuration

use crate::error::{Error, Result};
use crate::net::connect::Backoff;
use socket2::Socket;
use std::str::FromStr;
use std::time::Duration;

/// Outbound connection configuration
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Overall deadline for one connect request
    pub timeout: Duration,
    /// First wait between connect attempts
    pub initial_backoff: Duration,
    /// Growth factor applied to the wait after every attempt
    pub backoff_multiplier: f64,
    /// Upper bound for a single wait
    pub max_backoff: Duration,
    /// Delay between starting consecutive candidates in `connect_any_send`
    pub stagger: Duration,
    /// Options applied to the socket once it is connected
    pub socket_options: SocketOptions,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(10),
            backoff_multiplier: 1.5,
            max_backoff: Duration::from_millis(250),
            stagger: Duration::ZERO,
            socket_options: SocketOptions::default(),
        }
    }
}

impl ConnectConfig {
    /// Default configuration with the overall deadline given in milliseconds
    pub fn with_timeout_ms(timeout_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            ..Self::default()
        }
    }

    /// Fresh backoff sequence for one connect request
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.initial_backoff,
            self.backoff_multiplier,
            self.max_backoff,
        )
    }
}

/// Socket options in the classic `"TCP_NODELAY SO_KEEPALIVE SO_RCVBUF=65536"` form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub tcp_nodelay: Option<bool>,
    pub keepalive: Option<bool>,
    pub reuse_address: Option<bool>,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
}

impl SocketOptions {
    /// Parse a whitespace or comma separated option list.
    ///
    /// Boolean options accept an optional `=0`/`=1`; buffer sizes require a value.
    pub fn parse(text: &str) -> Result<Self> {
        let mut options = Self::default();
        for token in text
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
        {
            let (name, value) = match token.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (token, None),
            };
            match name.to_ascii_uppercase().as_str() {
                "TCP_NODELAY" => options.tcp_nodelay = Some(parse_flag(name, value)?),
                "SO_KEEPALIVE" => options.keepalive = Some(parse_flag(name, value)?),
                "SO_REUSEADDR" => options.reuse_address = Some(parse_flag(name, value)?),
                "SO_SNDBUF" => options.send_buffer_size = Some(parse_size(name, value)?),
                "SO_RCVBUF" => options.recv_buffer_size = Some(parse_size(name, value)?),
                _ => {
                    return Err(Error::InvalidParameter(format!(
                        "unknown socket option: {}",
                        name
                    )))
                }
            }
        }
        Ok(options)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply every configured option to `socket`
    pub fn apply(&self, socket: &Socket) -> Result<()> {
        if let Some(on) = self.tcp_nodelay {
            socket.set_nodelay(on)?;
        }
        if let Some(on) = self.keepalive {
            socket.set_keepalive(on)?;
        }
        if let Some(on) = self.reuse_address {
            socket.set_reuse_address(on)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }
}

impl FromStr for SocketOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_flag(name: &str, value: Option<&str>) -> Result<bool> {
    match value {
        None | Some("1") => Ok(true),
        Some("0") => Ok(false),
        Some(other) => Err(Error::InvalidParameter(format!(
            "{} expects 0 or 1, got {}",
            name, other
        ))),
    }
}

fn parse_size(name: &str, value: Option<&str>) -> Result<usize> {
    let value =
        value.ok_or_else(|| Error::InvalidParameter(format!("{} requires a value", name)))?;
    value
        .parse()
        .map_err(|_| Error::InvalidParameter(format!("{}: invalid size {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_parameters() {
        let config = ConnectConfig::default();
        assert_eq!(config.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.max_backoff, Duration::from_millis(250));
        assert!(config.socket_options.is_empty());
    }

    #[test]
    fn test_with_timeout_ms() {
        let config = ConnectConfig::with_timeout_ms(750);
        assert_eq!(config.timeout, Duration::from_millis(750));
        assert_eq!(config.initial_backoff, Duration::from_millis(10));
    }

    #[test]
    fn test_parse_socket_options() {
        let options: SocketOptions = "TCP_NODELAY SO_KEEPALIVE=0, SO_RCVBUF=65536"
            .parse()
            .unwrap();
        assert_eq!(options.tcp_nodelay, Some(true));
        assert_eq!(options.keepalive, Some(false));
        assert_eq!(options.recv_buffer_size, Some(65536));
        assert_eq!(options.send_buffer_size, None);
        assert_eq!(options.reuse_address, None);
    }

    #[test]
    fn test_parse_socket_options_rejects_garbage() {
        assert!(SocketOptions::parse("IPTOS_BOGUS").is_err());
        assert!(SocketOptions::parse("SO_SNDBUF").is_err());
        assert!(SocketOptions::parse("SO_SNDBUF=lots").is_err());
        assert!(SocketOptions::parse("TCP_NODELAY=yes").is_err());
        assert!(SocketOptions::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_apply_socket_options() {
        let socket = Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
        let options = SocketOptions::parse("TCP_NODELAY SO_KEEPALIVE").unwrap();
        options.apply(&socket).unwrap();
        assert!(socket.nodelay().unwrap());
        assert!(socket.keepalive().unwrap());
    }
}
