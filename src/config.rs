use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::{
    fmt, fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

/// Address family of the listening socket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// IPv4 and IPv6 on one dual-stack socket
    Tcp,
    /// IPv4 only
    #[default]
    Tcp4,
    /// IPv6 only
    Tcp6,
}

impl Protocol {
    /// Whether a listener of this family may bind `ip`.
    #[must_use]
    pub const fn accepts(self, ip: IpAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => ip.is_ipv4(),
            Self::Tcp6 => ip.is_ipv6(),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        })
    }
}

/// Transparent TCP port forwarder
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// TOML file providing `listen`, `forward` and `protocol`
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on (host:port or :port)
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Address to forward connections to (host:port)
    #[arg(long, value_name = "ADDR")]
    pub forward: Option<String>,

    /// Protocol to listen with [default: tcp4]
    #[arg(long, value_enum)]
    pub protocol: Option<Protocol>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub forward: Option<String>,
    pub protocol: Option<Protocol>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub listen: String,
    pub forward: String,
    pub protocol: Protocol,
}

impl Config {
    /// Combines command-line flags with the file values; flags win.
    pub fn merge(args: Args, file: FileConfig) -> Result<Self> {
        let Some(forward) = args.forward.or(file.forward).filter(|f| !f.is_empty()) else {
            bail!("Forward address is required");
        };

        Ok(Self {
            listen: args.listen.or(file.listen).unwrap_or_default(),
            forward,
            protocol: args.protocol.or(file.protocol).unwrap_or_default(),
        })
    }
}

pub fn load_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

pub fn load_config(args: Args) -> Result<Config> {
    let file = match &args.config {
        Some(path) => load_file(path)?,
        None => FileConfig::default(),
    };
    Config::merge(args, file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("tcp-forward").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_to_tcp4_and_empty_listen() {
        let config = load_config(parse(&["--forward", "127.0.0.1:80"])).unwrap();
        assert_eq!(
            config,
            Config {
                listen: String::new(),
                forward: "127.0.0.1:80".to_string(),
                protocol: Protocol::Tcp4,
            }
        );
    }

    #[test]
    fn missing_forward_is_fatal() {
        let err = load_config(parse(&["--listen", ":8080"])).unwrap_err();
        assert_eq!(err.to_string(), "Forward address is required");

        let err = load_config(parse(&["--forward", ""])).unwrap_err();
        assert_eq!(err.to_string(), "Forward address is required");
    }

    #[test]
    fn parses_protocol_flag() {
        let args = parse(&["--forward", "a:1", "--protocol", "tcp6"]);
        assert_eq!(args.protocol, Some(Protocol::Tcp6));
        assert!(Args::try_parse_from(["tcp-forward", "--protocol", "udp"]).is_err());
    }

    #[test]
    fn flags_override_file_values() {
        let file: FileConfig = toml::from_str(
            r#"
            listen = ":9000"
            forward = "10.0.0.5:80"
            protocol = "tcp"
            "#,
        )
        .unwrap();
        let config = Config::merge(parse(&["--listen", "127.0.0.1:7000"]), file).unwrap();

        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.forward, "10.0.0.5:80");
        assert_eq!(config.protocol, Protocol::Tcp);
    }

    #[test]
    fn rejects_unknown_file_keys() {
        assert!(toml::from_str::<FileConfig>("targets = 3").is_err());
        assert!(toml::from_str::<FileConfig>(r#"protocol = "udp""#).is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_file(Path::new("/nonexistent/tcp-forward.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tcp-forward.toml"));
    }

    #[test]
    fn protocol_family_checks() {
        let v4: IpAddr = "127.0.0.1".parse().unwrap();
        let v6: IpAddr = "::1".parse().unwrap();
        assert!(Protocol::Tcp.accepts(v4) && Protocol::Tcp.accepts(v6));
        assert!(Protocol::Tcp4.accepts(v4) && !Protocol::Tcp4.accepts(v6));
        assert!(!Protocol::Tcp6.accepts(v4) && Protocol::Tcp6.accepts(v6));
        assert_eq!(Protocol::Tcp6.to_string(), "tcp6");
    }
}
