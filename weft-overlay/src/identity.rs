//! Key material and hosts directory ownership.
//!
//! Everything here can be reloaded in place when the backing file changes on
//! disk; the hub drives that from its file-watch slots.

use crate::error::Result;
use crate::pki::Pki;
use crate::settings::Settings;
use std::path::PathBuf;
use tracing::{info, warn};
use weft_core::hosts::HostsFile;

/// This hub's long-term key material and host lookup table.
#[derive(Debug, Default)]
pub struct Identity {
    pki: Pki,
    hosts: Option<HostsFile>,
    private_key: Option<PathBuf>,
    public_key: Option<PathBuf>,
}

impl Identity {
    /// Load keys and the hosts file named by the settings. Missing options
    /// are fine; the affected features degrade per the `Pki` contract.
    pub fn configure(settings: &Settings) -> Result<Self> {
        let mut identity = Self {
            private_key: settings.file(&settings.paths.private_key),
            public_key: settings.file(&settings.paths.public_key),
            ..Self::default()
        };

        if let Some(path) = identity.private_key.clone() {
            identity.pki.load_private_key(&path)?;
            info!(path = %path.display(), "private key loaded");
        }
        if let Some(path) = identity.public_key.clone() {
            identity.pki.load_public_key(&path)?;
            info!(path = %path.display(), "public key loaded");
        }
        if let Some(path) = settings.file(&settings.paths.hosts_file) {
            identity.hosts = Some(HostsFile::load(&path)?);
            info!(path = %path.display(), "hosts file loaded");
        }
        Ok(identity)
    }

    /// Identity for tests and closed rings: a fresh keypair, no files.
    pub fn ephemeral() -> Result<Self> {
        Ok(Self {
            pki: Pki::generate()?,
            ..Self::default()
        })
    }

    #[must_use]
    pub const fn pki(&self) -> &Pki {
        &self.pki
    }

    #[must_use]
    pub const fn hosts(&self) -> Option<&HostsFile> {
        self.hosts.as_ref()
    }

    pub fn set_hosts(&mut self, hosts: HostsFile) {
        self.hosts = Some(hosts);
    }

    /// Re-read the private key file.
    pub fn reload_private_key(&mut self) {
        if let Some(path) = self.private_key.clone() {
            match self.pki.load_private_key(&path) {
                Ok(()) => info!("private key reloaded"),
                Err(e) => warn!(error = %e, "private key reload failed"),
            }
        }
    }

    /// Re-read the public key file.
    pub fn reload_public_key(&mut self) {
        if let Some(path) = self.public_key.clone() {
            match self.pki.load_public_key(&path) {
                Ok(()) => info!("public key reloaded"),
                Err(e) => warn!(error = %e, "public key reload failed"),
            }
        }
    }

    /// Re-read the hosts file in place.
    pub fn reload_hosts(&mut self) {
        if let Some(hosts) = &mut self.hosts {
            match hosts.reload() {
                Ok(()) => info!("hosts file reloaded"),
                Err(e) => warn!(error = %e, "hosts file reload failed"),
            }
        }
    }
}
