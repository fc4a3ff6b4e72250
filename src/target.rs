//! Forwarding targets and device identifiers.
//!
//! A target string has the form
//! `[<local_host>:]<local_port>:<remote_host>:<remote_port>[/udp]`. The local
//! host defaults to `localhost`, the protocol to TCP. The local port may be
//! the literal `stdio`, in which case the tunnel is bridged to the process'
//! standard input and output instead of a listener.

use std::fmt;

use serde::Deserialize;

use crate::error::{ParseError, PortError};

/// Local port sentinel selecting stdin/stdout passthrough.
pub const STDIO: &str = "stdio";

const DEVICE_ID_LEN: usize = 64;

/// Transport protocol of a forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local end of a target: a port to listen on, or stdio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPort {
    Port(u16),
    Stdio,
}

impl fmt::Display for LocalPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(port) => write!(f, "{port}"),
            Self::Stdio => f.write_str(STDIO),
        }
    }
}

/// A parsed, syntactically valid forwarding target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub protocol: Protocol,
    pub local_host: String,
    pub local_port: LocalPort,
    pub remote_host: String,
    pub remote_port: u16,
}

impl Target {
    /// `local_host:local_port`, the address a listener binds to.
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// `remote_host:remote_port`, the payload of a tunnel stream open.
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    pub fn is_stdio(&self) -> bool {
        self.local_port == LocalPort::Stdio
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.local_host, self.local_port, self.remote_host, self.remote_port
        )?;
        if self.protocol == Protocol::Udp {
            f.write_str("/udp")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Target {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_target(s)
    }
}

/// One device and its raw, not yet parsed target strings.
///
/// This is also the element type of the JSON connect file:
/// `[{"device_id": "...", "targets": ["8080:localhost:80"]}]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceConnection {
    pub device_id: String,
    pub targets: Vec<String>,
}

impl DeviceConnection {
    /// Validate the device id, then parse and validate every target.
    pub fn parse(&self) -> Result<Vec<Target>, ParseError> {
        if !is_valid_device_id(&self.device_id) {
            return Err(ParseError::InvalidDeviceId(self.device_id.clone()));
        }

        let targets = self
            .targets
            .iter()
            .map(|raw| {
                parse_target(raw).map_err(|e| ParseError::Target {
                    target: raw.clone(),
                    source: Box::new(e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if targets.is_empty() {
            return Err(ParseError::NoTargets(self.device_id.clone()));
        }
        validate_targets(&targets)?;
        Ok(targets)
    }
}

/// A device identifier is the hex SHA-256 digest of its public key:
/// exactly 64 lowercase hex characters.
pub fn is_valid_device_id(device_id: &str) -> bool {
    device_id.len() == DEVICE_ID_LEN
        && device_id
            .bytes()
            .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c))
}

/// Parse a single target string.
pub fn parse_target(s: &str) -> Result<Target, ParseError> {
    let parts: Vec<&str> = s.split(':').collect();

    let (local_host, local_port, remote_host, remote_port) = match parts.as_slice() {
        [lp, rh, rp] => ("localhost", *lp, *rh, *rp),
        [lh, lp, rh, rp] => (*lh, *lp, *rh, *rp),
        _ => return Err(ParseError::InvalidFormat),
    };

    let local_port = parse_local_port(local_port).map_err(ParseError::InvalidLocalPort)?;

    let (remote_port, protocol) = match remote_port.strip_suffix("/udp") {
        Some(port) => (port, Protocol::Udp),
        None => (remote_port, Protocol::Tcp),
    };
    let remote_port = parse_port(remote_port).map_err(ParseError::InvalidRemotePort)?;

    Ok(Target {
        protocol,
        local_host: local_host.to_string(),
        local_port,
        remote_host: remote_host.to_string(),
        remote_port,
    })
}

/// Parse a comma-separated target list as given on the command line.
pub fn parse_target_list(s: &str) -> Result<Vec<Target>, ParseError> {
    s.split(',').map(parse_target).collect()
}

/// Reject combinations that cannot be served together.
///
/// `stdio` owns the process' standard streams, so it must be the only target.
pub fn validate_targets(targets: &[Target]) -> Result<(), ParseError> {
    if targets.len() > 1 && targets.iter().any(Target::is_stdio) {
        return Err(ParseError::StdioNotExclusive);
    }
    Ok(())
}

fn parse_local_port(s: &str) -> Result<LocalPort, PortError> {
    if s == STDIO {
        return Ok(LocalPort::Stdio);
    }
    parse_port(s).map(LocalPort::Port)
}

fn parse_port(s: &str) -> Result<u16, PortError> {
    if s.is_empty() {
        return Err(PortError::Empty);
    }
    // u16::from_str accepts a leading '+', the port grammar does not
    if !s.bytes().all(|c| c.is_ascii_digit()) {
        return Err(PortError::InvalidNumber);
    }
    s.parse::<u16>().map_err(|_| PortError::InvalidNumber)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    #[test]
    fn parse_three_fields_defaults_local_host() {
        let target = parse_target("8080:localhost:80").unwrap();
        assert_eq!(
            target,
            Target {
                protocol: Protocol::Tcp,
                local_host: "localhost".into(),
                local_port: LocalPort::Port(8080),
                remote_host: "localhost".into(),
                remote_port: 80,
            }
        );
    }

    #[test]
    fn parse_four_fields() {
        let target = parse_target("0.0.0.0:2222:10.0.0.5:22").unwrap();
        assert_eq!(target.local_host, "0.0.0.0");
        assert_eq!(target.local_port, LocalPort::Port(2222));
        assert_eq!(target.remote_host, "10.0.0.5");
        assert_eq!(target.remote_port, 22);
    }

    #[test]
    fn parse_stdio() {
        let target = parse_target("stdio:localhost:22").unwrap();
        assert_eq!(target.local_port, LocalPort::Stdio);
        assert_eq!(target.remote_host, "localhost");
        assert_eq!(target.remote_port, 22);
        assert_eq!(target.protocol, Protocol::Tcp);
    }

    #[test]
    fn parse_udp_suffix() {
        let target = parse_target("5000:localhost:9999/udp").unwrap();
        assert_eq!(target.protocol, Protocol::Udp);
        assert_eq!(target.remote_port, 9999);
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        assert_eq!(parse_target("abc").unwrap_err(), ParseError::InvalidFormat);
        assert_eq!(parse_target("1:2").unwrap_err(), ParseError::InvalidFormat);
        assert_eq!(parse_target("a:1:b:2:c").unwrap_err(), ParseError::InvalidFormat);
        assert_eq!(parse_target("abc").unwrap_err().to_string(), "invalid format");
    }

    #[test]
    fn parse_rejects_bad_ports() {
        assert_eq!(
            parse_target(":localhost:80").unwrap_err(),
            ParseError::InvalidLocalPort(PortError::Empty)
        );
        assert_eq!(
            parse_target("65536:localhost:80").unwrap_err(),
            ParseError::InvalidLocalPort(PortError::InvalidNumber)
        );
        assert_eq!(
            parse_target("8080:localhost:").unwrap_err(),
            ParseError::InvalidRemotePort(PortError::Empty)
        );
        assert_eq!(
            parse_target("8080:localhost:/udp").unwrap_err(),
            ParseError::InvalidRemotePort(PortError::Empty)
        );
        assert_eq!(
            parse_target("8080:localhost:http").unwrap_err(),
            ParseError::InvalidRemotePort(PortError::InvalidNumber)
        );
        assert_eq!(
            parse_target("+80:localhost:80").unwrap_err(),
            ParseError::InvalidLocalPort(PortError::InvalidNumber)
        );
        // stdio is a local-only sentinel
        assert!(parse_target("8080:localhost:stdio").is_err());
    }

    #[test]
    fn display_is_canonical_inverse() {
        for raw in [
            "localhost:8080:localhost:80",
            "127.0.0.1:0:device.local:65535",
            "localhost:stdio:localhost:22",
            "localhost:5000:localhost:9999/udp",
        ] {
            let target = parse_target(raw).unwrap();
            assert_eq!(target.to_string(), raw);
            assert_eq!(parse_target(&target.to_string()).unwrap(), target);
        }
        // three-field input normalizes to the four-field form
        assert_eq!(
            parse_target("22:localhost:22").unwrap().to_string(),
            "localhost:22:localhost:22"
        );
    }

    #[test]
    fn target_list_splits_on_commas() {
        let targets = parse_target_list("8080:localhost:80,5353:localhost:53/udp").unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].protocol, Protocol::Udp);
    }

    #[test]
    fn stdio_must_be_exclusive() {
        let single = vec![parse_target("stdio:localhost:22").unwrap()];
        assert!(validate_targets(&single).is_ok());

        let mixed = parse_target_list("stdio:localhost:22,8080:localhost:80").unwrap();
        assert_eq!(validate_targets(&mixed).unwrap_err(), ParseError::StdioNotExclusive);

        let mixed = parse_target_list("8080:localhost:80,stdio:localhost:22").unwrap();
        assert_eq!(validate_targets(&mixed).unwrap_err(), ParseError::StdioNotExclusive);
    }

    #[test]
    fn device_id_grammar() {
        assert!(!is_valid_device_id("zz"));
        let mut with_g = device('a');
        with_g.replace_range(10..11, "g");
        assert_eq!(with_g.len(), 64);
        assert!(!is_valid_device_id(&with_g));
        assert!(!is_valid_device_id(&device('A')));
        assert!(!is_valid_device_id(&device('a')[..63]));
        assert!(is_valid_device_id(&device('a')));
        assert!(is_valid_device_id(
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        ));
    }

    #[test]
    fn device_connection_checks_id_before_targets() {
        let conn = DeviceConnection {
            device_id: "zz".into(),
            targets: vec!["garbage".into()],
        };
        assert_eq!(conn.parse().unwrap_err(), ParseError::InvalidDeviceId("zz".into()));
    }

    #[test]
    fn device_connection_reports_failing_target() {
        let conn = DeviceConnection {
            device_id: device('b'),
            targets: vec!["8080:localhost:80".into(), "abc".into()],
        };
        match conn.parse().unwrap_err() {
            ParseError::Target { target, source } => {
                assert_eq!(target, "abc");
                assert_eq!(*source, ParseError::InvalidFormat);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn device_connection_requires_targets() {
        let conn = DeviceConnection {
            device_id: device('c'),
            targets: vec![],
        };
        assert!(matches!(conn.parse().unwrap_err(), ParseError::NoTargets(_)));
    }

    #[test]
    fn device_connection_from_json() {
        let raw = format!(
            r#"[{{"device_id": "{}", "targets": ["8080:localhost:80", "stdio:localhost:22"]}}]"#,
            device('d')
        );
        let conns: Vec<DeviceConnection> = serde_json::from_str(&raw).unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].parse().unwrap_err(), ParseError::StdioNotExclusive);
    }
}
