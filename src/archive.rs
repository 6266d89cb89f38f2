//! Per-log on-disk archive state.
//!
//! Layout under the archive root, one directory per log (identifier with
//! `/` replaced by `_`):
//!
//! ```text
//! <root>/<log>/sth.json            latest trusted tree head
//! <root>/<log>/resume.json         open-shard checkpoint
//! <root>/<log>/lock                advisory lockfile
//! <root>/<log>/shards/NNNNNNNN.bin           leaf data
//! <root>/<log>/shards/NNNNNNNN.manifest.json sealed-shard manifest
//! ```
//!
//! `sth.json` and `resume.json` are replaced atomically (temp file, fsync,
//! rename, directory fsync), so the trust state is never observed half
//! written.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use openssl::pkey::{PKey, Public};

use crate::Error;
use crate::jsons;
use crate::shard::ShardManifest;
use crate::sth::{SignatureAlgorithm, SignedTreeHead};
use crate::utils;

/// Open-shard resume state: the next expected index, the byte length of
/// the open shard's data file at that point, and the two streaming-builder
/// stacks (whole tree, open shard).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub next_index: u64,
    pub data_len: u64,
    pub tree_stack: Vec<[u8; 32]>,
    pub shard_stack: Vec<[u8; 32]>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct CheckpointJson {
    next_index: u64,
    data_len: u64,
    tree_stack: Vec<String>,
    shard_stack: Vec<String>,
}

impl Checkpoint {
    fn to_json(&self) -> CheckpointJson {
        CheckpointJson {
            next_index: self.next_index,
            data_len: self.data_len,
            tree_stack: self.tree_stack.iter().map(|h| utils::u8_to_hex(h)).collect(),
            shard_stack: self.shard_stack.iter().map(|h| utils::u8_to_hex(h)).collect(),
        }
    }

    fn from_json(json: CheckpointJson) -> Result<Checkpoint, String> {
        let parse = |stack: &[String]| -> Result<Vec<[u8; 32]>, String> {
            stack.iter().map(|h| utils::hex_to_hash(h)).collect()
        };
        Ok(Checkpoint {
            next_index: json.next_index,
            data_len: json.data_len,
            tree_stack: parse(&json.tree_stack)?,
            shard_stack: parse(&json.shard_stack)?,
        })
    }
}

/// Handle on one log's archive directory. Holds the advisory lock for its
/// whole lifetime.
pub struct Archive {
    dir: PathBuf,
    _lock: LockFile,
}

impl Archive {
    /// Open (creating if necessary) the archive directory for `log_name`
    /// under `archive_root` and take the lockfile.
    pub fn open(archive_root: &Path, log_name: &str) -> Result<Archive, Error> {
        let dir = archive_root.join(log_dir_name(log_name));
        fs::create_dir_all(dir.join("shards")).map_err(|e| Error::FileIO(dir.clone(), e))?;
        let lock = LockFile::acquire(dir.join("lock"))?;
        Ok(Archive { dir, _lock: lock })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.dir.join("shards")
    }

    /// Load the trusted tree head, re-verifying its signature so a
    /// tampered `sth.json` is never trusted.
    pub fn load_trusted_sth(
        &self,
        pub_key: &PKey<Public>,
        algorithm: SignatureAlgorithm,
    ) -> Result<Option<SignedTreeHead>, Error> {
        let path = self.dir.join("sth.json");
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::FileIO(path, e)),
        };
        let json: jsons::STH = serde_json::from_slice(&bytes)
            .map_err(|e| Error::CorruptState(path.clone(), e.to_string()))?;
        let sth = SignedTreeHead::from_json(&json)
            .map_err(|e| Error::CorruptState(path, e.to_string()))?;
        sth.verify(pub_key, algorithm)?;
        Ok(Some(sth))
    }

    /// Atomically replace the trusted tree head.
    pub fn store_trusted_sth(&self, sth: &SignedTreeHead) -> Result<(), Error> {
        let json = serde_json::to_vec_pretty(&sth.to_json())
            .map_err(|e| Error::InvalidArgument(format!("encoding tree head: {}", e)))?;
        write_atomic(&self.dir.join("sth.json"), &json)
    }

    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>, Error> {
        let path = self.dir.join("resume.json");
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::FileIO(path, e)),
        };
        let json: CheckpointJson = serde_json::from_slice(&bytes)
            .map_err(|e| Error::CorruptState(path.clone(), e.to_string()))?;
        Checkpoint::from_json(json)
            .map(Some)
            .map_err(|e| Error::CorruptState(path, e))
    }

    pub fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        let json = serde_json::to_vec_pretty(&checkpoint.to_json())
            .map_err(|e| Error::InvalidArgument(format!("encoding checkpoint: {}", e)))?;
        write_atomic(&self.dir.join("resume.json"), &json)
    }

    /// Every sealed shard manifest, ordered by first index.
    pub fn sealed_manifests(&self) -> Result<Vec<ShardManifest>, Error> {
        let dir = self.shards_dir();
        let mut manifests = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| Error::FileIO(dir.clone(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::FileIO(dir.clone(), e))?;
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(".manifest.json") {
                continue;
            }
            let path = entry.path();
            let bytes = fs::read(&path).map_err(|e| Error::FileIO(path.clone(), e))?;
            let manifest: ShardManifest = serde_json::from_slice(&bytes)
                .map_err(|e| Error::CorruptState(path, e.to_string()))?;
            manifests.push(manifest);
        }
        manifests.sort_by_key(|m| m.first_index);
        Ok(manifests)
    }
}

fn log_dir_name(log_name: &str) -> String {
    log_name.replace('/', "_")
}

/// Write `bytes` to `path` via a temp file in the same directory, fsyncing
/// both the file and the directory so the replacement survives a crash.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    let io_err = |p: &Path| {
        let p = p.to_path_buf();
        move |e: io::Error| Error::FileIO(p.clone(), e)
    };
    {
        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(bytes).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(io_err(path))?;
    if let Some(parent) = path.parent() {
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(io_err(parent))?;
    }
    Ok(())
}

/// Advisory per-archive lockfile. Created exclusively, removed on drop; a
/// crash leaves it behind for the operator to clear.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: PathBuf) -> Result<LockFile, Error> {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(LockFile { path })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Error::ArchiveLocked(path)),
            Err(e) => Err(Error::FileIO(path, e)),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
