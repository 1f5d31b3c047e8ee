//! Serial device discovery.
//!
//! Several USB-serial adapters are usually plugged into the gateway at once,
//! and their device paths move around between boots. Each role (sensor
//! terminal, mesh radio) carries an ordered list of [`MatchRule`]s; the first
//! rule that matches exactly one unclaimed port wins. A rule that matches
//! several ports is ambiguous and evaluation moves on to the next rule.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::journal::Journal;

/// Role name of the serial sensor terminal.
pub const SENSOR_ROLE: &str = "sensor-terminal";

/// Role name of the mesh radio.
pub const MESH_ROLE: &str = "mesh-radio";

/// Errors from port enumeration.
#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("Failed to enumerate serial ports: {0}")]
    Enumerate(String),
}

/// A serial port as reported by the operating system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortDescriptor {
    /// Device path (e.g. `/dev/ttyACM0`).
    pub path: String,
    /// USB product string, when known.
    pub description: Option<String>,
    /// USB manufacturer string, when known.
    pub manufacturer: Option<String>,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// USB serial number.
    pub serial_number: Option<String>,
}

impl PortDescriptor {
    /// Convert an enumeration result from the serial port backend.
    pub fn from_port_info(info: tokio_serial::SerialPortInfo) -> Self {
        match info.port_type {
            tokio_serial::SerialPortType::UsbPort(usb) => Self {
                path: info.port_name,
                description: usb.product,
                manufacturer: usb.manufacturer,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number,
            },
            _ => Self {
                path: info.port_name,
                ..Default::default()
            },
        }
    }

    fn description_contains(&self, needle: &str) -> bool {
        contains_ignore_case(self.description.as_deref(), needle)
    }

    fn manufacturer_contains(&self, needle: &str) -> bool {
        contains_ignore_case(self.manufacturer.as_deref(), needle)
    }
}

fn contains_ignore_case(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(&needle.to_lowercase()))
}

/// A VID/PID pair with an optional description filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbIdMatch {
    pub vid: u16,
    pub pid: u16,
    /// Case-insensitive substring the port description must contain.
    #[serde(default)]
    pub description: Option<String>,
}

impl UsbIdMatch {
    pub fn new(vid: u16, pid: u16, description: Option<&str>) -> Self {
        Self {
            vid,
            pid,
            description: description.map(str::to_string),
        }
    }

    fn matches(&self, port: &PortDescriptor) -> bool {
        port.vid == Some(self.vid)
            && port.pid == Some(self.pid)
            && self
                .description
                .as_deref()
                .is_none_or(|d| port.description_contains(d))
    }
}

/// One way of recognising a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchRule {
    /// Exact device path plus a description substring.
    Exact { path: String, description: String },
    /// Any of the listed USB vendor/product IDs.
    UsbId { ids: Vec<UsbIdMatch> },
    /// A keyword found in the description or manufacturer string.
    Keyword { keywords: Vec<String> },
}

impl MatchRule {
    /// Which tier a win by this rule is reported as.
    pub fn tier(&self) -> MatchTier {
        match self {
            MatchRule::Exact { .. } => MatchTier::Exact,
            MatchRule::UsbId { .. } => MatchTier::UsbId,
            MatchRule::Keyword { .. } => MatchTier::Keyword,
        }
    }

    /// Whether the port satisfies this rule.
    pub fn matches(&self, port: &PortDescriptor) -> bool {
        match self {
            MatchRule::Exact { path, description } => {
                port.path == *path && port.description_contains(description)
            }
            MatchRule::UsbId { ids } => ids.iter().any(|id| id.matches(port)),
            MatchRule::Keyword { keywords } => keywords
                .iter()
                .any(|k| port.description_contains(k) || port.manufacturer_contains(k)),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            MatchRule::Exact { path, .. } => path.is_empty(),
            MatchRule::UsbId { ids } => ids.is_empty(),
            MatchRule::Keyword { keywords } => keywords.is_empty(),
        }
    }
}

/// A role plus the rules that identify its device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSelector {
    pub role: String,
    pub rules: Vec<MatchRule>,
}

impl RoleSelector {
    pub fn new(role: impl Into<String>, rules: Vec<MatchRule>) -> Self {
        Self {
            role: role.into(),
            rules,
        }
    }

    /// Whether the selector has at least one usable rule.
    pub fn is_usable(&self) -> bool {
        self.rules.iter().any(|r| !r.is_empty())
    }
}

/// Default rules for the Wio Terminal sensor logger.
pub fn default_sensor_rules() -> Vec<MatchRule> {
    vec![
        MatchRule::Exact {
            path: "/dev/ttyACM1".to_string(),
            description: "Seeed Wio Terminal".to_string(),
        },
        MatchRule::UsbId {
            ids: vec![
                UsbIdMatch::new(0x2886, 0x802F, Some("Wio Terminal")),
                UsbIdMatch::new(0x2886, 0x002F, Some("Wio Terminal Bootloader")),
            ],
        },
        MatchRule::Keyword {
            keywords: ["Seeeduino", "Wio", "WioTerminal", "USB Serial Device", "ACM1"]
                .into_iter()
                .map(String::from)
                .collect(),
        },
    ]
}

/// Default rules for a Meshtastic radio on a common USB-UART bridge.
pub fn default_mesh_rules() -> Vec<MatchRule> {
    vec![
        MatchRule::Exact {
            path: "/dev/ttyACM0".to_string(),
            description: "USB Single Serial".to_string(),
        },
        MatchRule::UsbId {
            ids: vec![
                UsbIdMatch::new(0x10C4, 0xEA60, Some("CP210x")),
                UsbIdMatch::new(0x1A86, 0x7523, Some("CH340")),
                UsbIdMatch::new(0x0403, 0x6001, Some("FTDI")),
                UsbIdMatch::new(0x1A86, 0x55D4, Some("USB Single Serial")),
            ],
        },
        MatchRule::Keyword {
            keywords: ["CP210x", "CH340", "CH910", "USB Serial", "Meshtastic", "ACM0"]
                .into_iter()
                .map(String::from)
                .collect(),
        },
    ]
}

/// How a port was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Explicit,
    Exact,
    UsbId,
    Keyword,
}

impl MatchTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchTier::Explicit => "explicit",
            MatchTier::Exact => "exact",
            MatchTier::UsbId => "usb_id",
            MatchTier::Keyword => "keyword",
        }
    }
}

/// A resolved port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub path: String,
    pub tier: MatchTier,
}

/// Full outcome of a resolution, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// The winning port, if any.
    pub located: Option<Located>,
    /// Rules that matched more than one unclaimed port, with their candidates.
    pub ambiguous: Vec<(MatchTier, Vec<String>)>,
    /// An explicit path that was rejected because another role holds it.
    pub rejected_explicit: Option<String>,
}

/// Pick at most one port for a role.
///
/// Pure and total: the same inputs always give the same answer, and no
/// input makes it fail.
pub fn resolve(
    selector: &RoleSelector,
    explicit: Option<&str>,
    ports: &[PortDescriptor],
    claimed: &HashSet<String>,
) -> Option<Located> {
    resolve_detailed(selector, explicit, ports, claimed).located
}

/// Like [`resolve`], also reporting ambiguous tiers and rejected overrides.
pub fn resolve_detailed(
    selector: &RoleSelector,
    explicit: Option<&str>,
    ports: &[PortDescriptor],
    claimed: &HashSet<String>,
) -> Resolution {
    let mut resolution = Resolution::default();

    if let Some(path) = explicit {
        if claimed.contains(path) {
            resolution.rejected_explicit = Some(path.to_string());
        } else {
            resolution.located = Some(Located {
                path: path.to_string(),
                tier: MatchTier::Explicit,
            });
            return resolution;
        }
    }

    for rule in &selector.rules {
        let mut candidates: Vec<&str> = Vec::new();
        for port in ports {
            if claimed.contains(&port.path) || !rule.matches(port) {
                continue;
            }
            if !candidates.contains(&port.path.as_str()) {
                candidates.push(&port.path);
            }
        }

        match candidates.as_slice() {
            [] => {}
            [only] => {
                resolution.located = Some(Located {
                    path: (*only).to_string(),
                    tier: rule.tier(),
                });
                return resolution;
            }
            many => resolution
                .ambiguous
                .push((rule.tier(), many.iter().map(|p| p.to_string()).collect())),
        }
    }

    resolution
}

/// Source of the live port list.
pub trait PortScanner: Send + Sync {
    fn scan(&self) -> Result<Vec<PortDescriptor>, LocatorError>;
}

/// The operating system's serial port list.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortScanner for SystemPorts {
    fn scan(&self) -> Result<Vec<PortDescriptor>, LocatorError> {
        tokio_serial::available_ports()
            .map(|ports| ports.into_iter().map(PortDescriptor::from_port_info).collect())
            .map_err(|e| LocatorError::Enumerate(e.to_string()))
    }
}

/// Enumerates ports and resolves roles, journaling every decision.
#[derive(Debug, Clone)]
pub struct DeviceLocator<P> {
    scanner: P,
    journal: Journal,
}

impl<P: PortScanner> DeviceLocator<P> {
    pub fn new(scanner: P, journal: Journal) -> Self {
        Self { scanner, journal }
    }

    /// Live enumeration. Never cached.
    pub fn enumerate(&self) -> Result<Vec<PortDescriptor>, LocatorError> {
        self.scanner.scan()
    }

    /// Log every visible port. Used once at startup.
    pub fn log_ports(&self) {
        match self.enumerate() {
            Ok(ports) if ports.is_empty() => {
                tracing::warn!("No serial ports detected on this system");
                self.journal.record("serial_ports_listed", json!({ "ports": [] }));
            }
            Ok(ports) => {
                for port in &ports {
                    tracing::info!(
                        path = %port.path,
                        description = port.description.as_deref().unwrap_or("n/a"),
                        vid = ?port.vid.map(|v| format!("{:04X}", v)),
                        pid = ?port.pid.map(|p| format!("{:04X}", p)),
                        serial = port.serial_number.as_deref().unwrap_or("n/a"),
                        "Serial port available"
                    );
                }
                self.journal
                    .record("serial_ports_listed", json!({ "ports": ports }));
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not list serial ports");
                self.journal
                    .record("serial_ports_list_error", json!({ "error": e.to_string() }));
            }
        }
    }

    /// Enumerate, resolve and journal the outcome.
    pub fn locate(
        &self,
        selector: &RoleSelector,
        explicit: Option<&str>,
        claimed: &HashSet<String>,
    ) -> Option<Located> {
        let ports = match self.enumerate() {
            Ok(ports) => ports,
            Err(e) => {
                tracing::error!(role = %selector.role, error = %e, "Port enumeration failed");
                self.journal.record(
                    "serial_enumerate_error",
                    json!({ "role": selector.role, "error": e.to_string() }),
                );
                Vec::new()
            }
        };

        let resolution = resolve_detailed(selector, explicit, &ports, claimed);

        if let Some(path) = &resolution.rejected_explicit {
            tracing::warn!(role = %selector.role, port = %path, "Requested port is already in use by another role");
            self.journal.record(
                "serial_explicit_port_claimed",
                json!({ "role": selector.role, "port": path }),
            );
        }

        for (tier, candidates) in &resolution.ambiguous {
            tracing::info!(role = %selector.role, tier = tier.as_str(), candidates = ?candidates, "Ambiguous match, trying next rule");
            self.journal.record(
                "serial_multiple_ports_ambiguous",
                json!({ "role": selector.role, "tier": tier, "found_ports": candidates }),
            );
        }

        match &resolution.located {
            Some(located) => {
                tracing::info!(role = %selector.role, port = %located.path, tier = located.tier.as_str(), "Device located");
                self.journal.record(
                    "serial_device_located",
                    json!({ "role": selector.role, "port": located.path, "tier": located.tier }),
                );
            }
            None => {
                tracing::warn!(role = %selector.role, ports = ports.len(), "No device found");
                self.journal.record(
                    "serial_device_located",
                    json!({ "role": selector.role, "port": null, "tier": "none" }),
                );
            }
        }

        resolution.located
    }
}
