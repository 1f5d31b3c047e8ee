//! CLI argument parsing for bridges.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use clap::parser::ValueSource;

/// An explicit serial port chosen on the command line for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOverride {
    /// Role name (e.g. `sensor-terminal`).
    pub role: String,
    /// Device path (e.g. `/dev/ttyACM1` or `COM4`).
    pub path: String,
}

impl FromStr for PortOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, path) = s
            .split_once('=')
            .ok_or_else(|| format!("expected ROLE=PATH, got '{}'", s))?;
        let (role, path) = (role.trim(), path.trim());
        if role.is_empty() || path.is_empty() {
            return Err(format!("expected ROLE=PATH, got '{}'", s));
        }
        Ok(Self {
            role: role.to_string(),
            path: path.to_string(),
        })
    }
}

/// Common CLI arguments for all bridges.
#[derive(Parser, Debug, Clone)]
#[command(about = "FieldLink telemetry bridge")]
pub struct BridgeArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Explicit serial port for a role, as ROLE=PATH (repeatable).
    #[arg(long = "port", value_name = "ROLE=PATH")]
    pub ports: Vec<PortOverride>,

    /// Whether `config` is the built-in default rather than user-supplied.
    #[arg(skip)]
    pub config_is_default: bool,
}

impl BridgeArgs {
    /// Parse CLI arguments with a default config path.
    ///
    /// If no `--config` argument is provided, uses the default and records
    /// that fact in [`config_is_default`](Self::config_is_default).
    pub fn parse_with_default(default_config: &'static str) -> Self {
        let matches = <Self as clap::CommandFactory>::command()
            .mut_arg("config", |arg| arg.default_value(default_config))
            .get_matches();

        let mut args = <Self as clap::FromArgMatches>::from_arg_matches(&matches)
            .unwrap_or_else(|e| e.exit());
        args.config_is_default = matches.value_source("config") == Some(ValueSource::DefaultValue);
        args
    }

    /// Parse CLI arguments (requires --config to be specified).
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// The explicit port given for a role, if any. The last occurrence wins.
    pub fn port_for(&self, role: &str) -> Option<&str> {
        self.ports
            .iter()
            .rev()
            .find(|p| p.role == role)
            .map(|p| p.path.as_str())
    }
}
