//! Hub configuration.
//!
//! Settings load from a TOML file. String options may reference entries of
//! the `[paths]` table as `$name/rest...`; references are resolved once at
//! load time. The netmask is given in hex so operators can eyeball the group
//! partition.

use crate::error::{HubError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use weft_core::config::{
    DEFAULT_CONNECTION_POOL_SIZE, DEFAULT_MESSAGE_POOL_SIZE, DEFAULT_PAUSE_MS,
    DEFAULT_PERIOD_MS, DEFAULT_TIMEOUT_MS,
};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub overlay: OverlaySection,
    pub bootstrap: BootstrapSection,
    pub paths: PathsSection,
    pub limits: LimitsSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlaySection {
    /// Accept new client registrations
    pub enroll: bool,
    /// Require client proofs before registration
    pub authenticate: bool,
    /// Actively stabilize into the ring
    pub join: bool,
    /// Stabilization period (ms)
    pub period: u64,
    /// Blocking I/O deadline (ms)
    pub timeout: u64,
    /// Wait after a stabilization error (ms)
    pub pause: u64,
    /// Hex mask restricting client-to-client traffic, e.g. "0xffff0000"
    pub netmask: String,
    /// This hub's group tag
    pub group: u8,
    /// Listen address for the server socket
    pub listen: String,
}

impl Default for OverlaySection {
    fn default() -> Self {
        Self {
            enroll: true,
            authenticate: false,
            join: false,
            period: DEFAULT_PERIOD_MS,
            timeout: DEFAULT_TIMEOUT_MS,
            pause: DEFAULT_PAUSE_MS,
            netmask: "0x0".into(),
            group: 0,
            listen: "0.0.0.0:9001".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BootstrapSection {
    /// Peer identifiers to try at startup
    pub nodes: Vec<u64>,
}

// NOTE: no deny_unknown_fields here; serde cannot combine it with flatten.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PathsSection {
    /// Base directories referenced as `$name/...` by the file options
    #[serde(flatten)]
    pub bases: std::collections::BTreeMap<String, String>,
    pub hosts_db: Option<String>,
    pub hosts_file: Option<String>,
    pub private_key: Option<String>,
    pub public_key: Option<String>,
    pub ssl_root: Option<String>,
    pub ssl_certificate: Option<String>,
    pub ssl_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsSection {
    pub messages: usize,
    pub connections: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            messages: DEFAULT_MESSAGE_POOL_SIZE,
            connections: DEFAULT_CONNECTION_POOL_SIZE,
        }
    }
}

impl Settings {
    /// Load and resolve settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse settings from TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut settings: Self =
            toml::from_str(text).map_err(|e| HubError::config(e.to_string()))?;
        settings.resolve_paths()?;
        settings.netmask()?; // fail fast on a bad mask
        Ok(settings)
    }

    /// The parsed netmask.
    pub fn netmask(&self) -> Result<u64> {
        let raw = self.overlay.netmask.trim();
        let raw = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"));
        let raw = raw.ok_or_else(|| HubError::config("netmask must be hex (0x...)"))?;
        u64::from_str_radix(raw, 16)
            .map_err(|e| HubError::config(format!("bad netmask: {e}")))
    }

    /// Resolved path for one of the file options.
    #[must_use]
    pub fn file(&self, option: &Option<String>) -> Option<PathBuf> {
        option.as_ref().map(PathBuf::from)
    }

    fn resolve_paths(&mut self) -> Result<()> {
        let bases = self.paths.bases.clone();
        for option in [
            &mut self.paths.hosts_db,
            &mut self.paths.hosts_file,
            &mut self.paths.private_key,
            &mut self.paths.public_key,
            &mut self.paths.ssl_root,
            &mut self.paths.ssl_certificate,
            &mut self.paths.ssl_key,
        ] {
            if let Some(value) = option {
                if let Some(rest) = value.strip_prefix('$') {
                    let (name, tail) = rest
                        .split_once('/')
                        .ok_or_else(|| HubError::config(format!("bad path reference {value}")))?;
                    let base = bases.get(name).ok_or_else(|| {
                        HubError::config(format!("unknown path base ${name}"))
                    })?;
                    *value = format!("{}/{}", base.trim_end_matches('/'), tail);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::parse("").unwrap();
        assert!(settings.overlay.enroll);
        assert!(!settings.overlay.join);
        assert_eq!(settings.overlay.period, DEFAULT_PERIOD_MS);
        assert_eq!(settings.netmask().unwrap(), 0);
        assert_eq!(settings.limits.messages, DEFAULT_MESSAGE_POOL_SIZE);
    }

    #[test]
    fn parses_full_file() {
        let text = r#"
            [overlay]
            enroll = true
            authenticate = true
            join = true
            period = 1000
            timeout = 500
            pause = 2000
            netmask = "0xffff0000"
            group = 3
            listen = "127.0.0.1:9009"

            [bootstrap]
            nodes = [1, 17, 4095]

            [paths]
            data = "/var/lib/weft"
            hosts_file = "$data/hosts"
            private_key = "$data/keys/host.pem"
        "#;
        let settings = Settings::parse(text).unwrap();
        assert_eq!(settings.netmask().unwrap(), 0xffff_0000);
        assert_eq!(settings.bootstrap.nodes, vec![1, 17, 4095]);
        assert_eq!(
            settings.paths.hosts_file.as_deref(),
            Some("/var/lib/weft/hosts")
        );
        assert_eq!(
            settings.paths.private_key.as_deref(),
            Some("/var/lib/weft/keys/host.pem")
        );
    }

    #[test]
    fn unknown_path_base_is_an_error() {
        let text = "[paths]\nhosts_file = \"$nowhere/hosts\"\n";
        assert!(Settings::parse(text).is_err());
    }

    #[test]
    fn bad_netmask_is_an_error() {
        let text = "[overlay]\nnetmask = \"ffff\"\n";
        assert!(Settings::parse(text).is_err());
    }
}
