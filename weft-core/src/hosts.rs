//! Hosts directory contract.
//!
//! The hub resolves peer identifiers to network endpoints through this seam.
//! The backing store is external; the file-backed implementation here parses
//! a whitespace-separated table (`<id> <host> <port> [type]`) and can be
//! reloaded in place when the file changes on disk.

use crate::error::{Result, WeftError};
use hashbrown::HashMap;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};

/// Network endpoint of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

/// Role tag stored alongside an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum HostType {
    /// Regular overlay hub
    #[default]
    Hub = 0,
    /// Candidate for `BOOTSTRAP.nodes`
    Bootstrap = 1,
    /// Authentication sidecar
    Authenticator = 2,
}

impl HostType {
    #[must_use]
    pub const fn from_raw(value: i64) -> Self {
        match value {
            1 => Self::Bootstrap,
            2 => Self::Authenticator,
            _ => Self::Hub,
        }
    }
}

/// Lookup and sampling interface the hub consumes.
pub trait Hosts {
    /// Resolve an identifier to its endpoint.
    fn get(&self, id: u64) -> Option<HostAddress>;

    /// A randomized sample of at most `max` identifiers of the given type.
    fn list(&self, kind: HostType, max: usize) -> Vec<u64>;
}

/// Text-file backed hosts directory.
#[derive(Debug, Default)]
pub struct HostsFile {
    path: PathBuf,
    entries: HashMap<u64, (HostAddress, HostType)>,
}

impl HostsFile {
    /// Load the directory from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut hosts = Self {
            path: path.as_ref().to_path_buf(),
            entries: HashMap::new(),
        };
        hosts.reload()?;
        Ok(hosts)
    }

    /// Re-read the backing file, replacing the table in place.
    pub fn reload(&mut self) -> Result<()> {
        let text = std::fs::read_to_string(&self.path)?;
        let mut entries = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let parsed = (|| {
                let id: u64 = fields.next()?.parse().ok()?;
                let host = fields.next()?.to_string();
                let port: u16 = fields.next()?.parse().ok()?;
                let kind = match fields.next() {
                    Some(raw) => HostType::from_raw(raw.parse().ok()?),
                    None => HostType::Hub,
                };
                Some((id, HostAddress { host, port }, kind))
            })();
            let Some((id, address, kind)) = parsed else {
                return Err(WeftError::hosts(format!(
                    "malformed hosts entry at line {}",
                    lineno + 1
                )));
            };
            entries.insert(id, (address, kind));
        }
        tracing::debug!(entries = entries.len(), "hosts directory loaded");
        self.entries = entries;
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Hosts for HostsFile {
    fn get(&self, id: u64) -> Option<HostAddress> {
        self.entries.get(&id).map(|(address, _)| address.clone())
    }

    fn list(&self, kind: HostType, max: usize) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, (_, k))| *k == kind)
            .map(|(id, _)| *id)
            .collect();
        ids.shuffle(&mut rand::thread_rng());
        ids.truncate(max);
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("weft-hosts-{}-{}", std::process::id(), content.len()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_and_resolves() {
        let path = write_temp("# comment\n1 alpha.example 9001 1\n42 beta.example 9002\n");
        let hosts = HostsFile::load(&path).unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(
            hosts.get(42),
            Some(HostAddress {
                host: "beta.example".into(),
                port: 9002
            })
        );
        assert_eq!(hosts.get(7), None);
        assert_eq!(hosts.list(HostType::Bootstrap, 8), vec![1]);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn reload_replaces_in_place() {
        let path = write_temp("42 old.example 9000\n");
        let mut hosts = HostsFile::load(&path).unwrap();
        assert_eq!(hosts.get(42).unwrap().host, "old.example");

        std::fs::write(&path, "42 new.example 9100\n").unwrap();
        hosts.reload().unwrap();
        assert_eq!(
            hosts.get(42),
            Some(HostAddress {
                host: "new.example".into(),
                port: 9100
            })
        );
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let path = write_temp("42 host-without-port\n");
        assert!(HostsFile::load(&path).is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn list_is_bounded() {
        let path = write_temp("1 a 1 1\n2 b 2 1\n3 c 3 1\n4 d 4 1\n");
        let hosts = HostsFile::load(&path).unwrap();
        assert_eq!(hosts.list(HostType::Bootstrap, 2).len(), 2);
        assert!(hosts.list(HostType::Hub, 8).is_empty());
        std::fs::remove_file(path).ok();
    }
}
