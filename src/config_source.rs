use std::path::Path;
use tracing::{debug, warn};

/// Key holding the server's TCP port
pub const TCP_PORT_KEY: &str = "ConnectServerPortTCP";
/// Key holding the server's UDP port
pub const UDP_PORT_KEY: &str = "ConnectServerPortUDP";

/// Default TCP port when the config is missing or unusable
pub const DEFAULT_TCP_PORT: u16 = 44405;
/// Default UDP port when the config is missing or unusable
pub const DEFAULT_UDP_PORT: u16 = 55601;

/// Read-only view of the server's INI file.
///
/// Accepts the same dialect the server does: `[Section]` headers, `;` and `#`
/// comment lines, and `key = value` pairs with whitespace trimmed around both
/// sides. Keys seen before any header land in the unnamed section `""`.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    /// Entries in file order as (section, key, value)
    entries: Vec<(String, String, String)>,
}

impl ConfigSource {
    /// Reads and parses the file at `path`
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        debug!("Loaded config from {}", path.display());
        Ok(Self::parse(&contents))
    }

    /// Parses INI text; malformed lines are skipped
    pub fn parse(contents: &str) -> Self {
        let mut entries = Vec::new();
        let mut section = String::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].trim().to_string();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            entries.push((section.clone(), key.to_string(), value.trim().to_string()));
        }

        Self { entries }
    }

    /// First value for `key` in any section
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, k, _)| k == key)
            .map(|(_, _, v)| v.as_str())
    }

    /// Value for `key` inside `section`
    pub fn get_in(&self, section: &str, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(s, k, _)| s == section && k == key)
            .map(|(_, _, v)| v.as_str())
    }

    /// First value for `key` parsed as an integer
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key)?.parse().ok()
    }

    /// Value for `key` inside `section` parsed as an integer
    pub fn get_int_in(&self, section: &str, key: &str) -> Option<i64> {
        self.get_in(section, key)?.parse().ok()
    }

    /// Port number under `key`, or `default` when absent, unparsable or out of range
    pub fn port_or(&self, key: &str, default: u16) -> u16 {
        let Some(raw) = self.get(key) else {
            return default;
        };

        match raw.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => {
                warn!("Ignoring invalid {} value {:?}, using {}", key, raw, default);
                default
            }
        }
    }

    /// No key/value pairs were found
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
