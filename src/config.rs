//! Run configuration and the known-logs list.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::prelude::*;
use serde::Deserialize;

use crate::Error;
use crate::sth::SignatureAlgorithm;

/// The operator-supplied configuration file (JSON). Validated before any
/// network or disk activity starts.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory holding one archive per mirrored log.
    pub archive_root: PathBuf,
    /// Where `.torrent` files and the RSS feed are written.
    pub torrent_dir: PathBuf,
    /// Path to the known-logs JSON file.
    pub known_logs: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// get-entries batch size hint; servers may cap it lower.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_shard_size")]
    pub shard_size: u64,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub trackers: Vec<String>,
    /// `host:port` peers advertised in magnet links.
    #[serde(default)]
    pub seed_peers: Vec<String>,
    /// Autonomous-system number announced in torrent comments.
    #[serde(default)]
    pub as_number: Option<u32>,
}

fn default_workers() -> usize {
    4
}

fn default_batch_size() -> u64 {
    256
}

fn default_shard_size() -> u64 {
    65536
}

fn default_timeout_secs() -> u64 {
    60
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, Error> {
        let bytes = std::fs::read(path).map_err(|e| Error::FileIO(path.to_path_buf(), e))?;
        let config: Config = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_owned()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_owned()));
        }
        if self.shard_size == 0 {
            return Err(Error::Config("shard_size must be at least 1".to_owned()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be at least 1".to_owned()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// One entry of the known-logs file.
#[derive(Debug, Clone, Deserialize)]
pub struct KnownLog {
    #[serde(default)]
    pub description: String,
    /// Base64 SubjectPublicKeyInfo.
    pub key: String,
    /// Scheme-less URL, e.g. `ct.googleapis.com/rocketeer`.
    pub url: String,
    #[serde(default)]
    pub maximum_merge_delay: u64,
    /// Tree-head signature algorithm this log is on record as using
    /// (`"rsa"` or `"ecdsa"`). Cross-checked against the key and every
    /// signature when declared.
    #[serde(default)]
    pub signature_algorithm: Option<SignatureAlgorithm>,
    /// Server-side cap on one `get-entries` response, when the list
    /// records it.
    #[serde(default)]
    pub maximum_batch_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct KnownLogs {
    pub logs: Vec<KnownLog>,
}

/// A log ready to be mirrored: identifier, full base URL, decoded key,
/// expected signature algorithm, and the server's batch cap.
#[derive(Debug, Clone)]
pub struct LogDescriptor {
    /// DNS-style identifier; also names the archive directory.
    pub name: String,
    /// `https://` URL with a trailing slash.
    pub base_url: String,
    /// SubjectPublicKeyInfo, DER.
    pub public_key: Vec<u8>,
    /// Declared signature algorithm; inferred from the key when absent.
    pub signature_algorithm: Option<SignatureAlgorithm>,
    /// Maximum entries one `get-entries` call may return; caps the
    /// configured batch size for this log.
    pub batch_size_hint: Option<u64>,
}

impl KnownLogs {
    pub fn load(path: &Path) -> Result<KnownLogs, Error> {
        let bytes = std::fs::read(path).map_err(|e| Error::FileIO(path.to_path_buf(), e))?;
        let known: KnownLogs = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        if known.logs.is_empty() {
            return Err(Error::Config(format!(
                "{}: known-logs list is empty",
                path.display()
            )));
        }
        Ok(known)
    }

    /// Select a log by identifier: its scheme-less URL (trailing slash
    /// optional) or its description.
    pub fn find(&self, identifier: &str) -> Option<&KnownLog> {
        let wanted = identifier.trim_end_matches('/');
        self.logs
            .iter()
            .find(|log| log.url.trim_end_matches('/') == wanted || log.description == identifier)
    }
}

impl KnownLog {
    pub fn descriptor(&self) -> Result<LogDescriptor, Error> {
        let public_key = BASE64_STANDARD
            .decode(&self.key)
            .map_err(|e| Error::Config(format!("log {}: invalid key: {}", self.url, e)))?;
        let name = self
            .url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_owned();
        if name.is_empty() {
            return Err(Error::Config("log url is empty".to_owned()));
        }
        if self.maximum_batch_size == Some(0) {
            return Err(Error::Config(format!(
                "log {}: maximum_batch_size must be at least 1",
                self.url
            )));
        }
        Ok(LogDescriptor {
            base_url: format!("https://{}/", name),
            name,
            public_key,
            signature_algorithm: self.signature_algorithm,
            batch_size_hint: self.maximum_batch_size,
        })
    }
}
