//! Fixed-size shard files and their manifests.
//!
//! A shard is a contiguous run of `shard_size` entries stored in one data
//! file, each entry written as two 24-bit length-prefixed blobs
//! (`leaf_input`, then `extra_data`). Writes are strictly sequential;
//! sealed shards are never touched again. Sealing fsyncs the data file
//! before the manifest is written, so an entry is durable before any
//! manifest records it.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::archive;
use crate::merkle::TreeBuilder;
use crate::utils;

pub fn shard_file_name(number: u64) -> String {
    format!("{:08}.bin", number)
}

pub fn manifest_file_name(number: u64) -> String {
    format!("{:08}.manifest.json", number)
}

/// Manifest written next to each sealed shard data file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardManifest {
    pub first_index: u64,
    pub last_index: u64,
    pub count: u64,
    pub data_file: String,
    pub data_len: u64,
    /// Merkle root over this shard's leaves, hex.
    pub subroot: String,
}

/// Appends verified leaves to the open shard, sealing at every
/// `shard_size` boundary.
pub struct ShardWriter {
    dir: PathBuf,
    shard_size: u64,
    next_index: u64,
    file: Option<File>,
    data_len: u64,
    subtree: TreeBuilder,
}

impl ShardWriter {
    /// Position a writer at `next_index`. `data_len` and `subtree` are the
    /// open shard's checkpointed state; when resuming mid-shard the data
    /// file is truncated back to `data_len`, dropping bytes a previous
    /// aborted run may have appended past the checkpoint.
    pub fn open(
        dir: &Path,
        shard_size: u64,
        next_index: u64,
        data_len: u64,
        subtree: TreeBuilder,
    ) -> Result<ShardWriter, Error> {
        if shard_size == 0 {
            return Err(Error::InvalidArgument("shard size must be positive".to_owned()));
        }
        if subtree.size() != next_index % shard_size {
            return Err(Error::InvalidArgument(format!(
                "shard subtree holds {} leaves but index {} is {} past the boundary",
                subtree.size(),
                next_index,
                next_index % shard_size
            )));
        }
        let mut writer = ShardWriter {
            dir: dir.to_path_buf(),
            shard_size,
            next_index,
            file: None,
            data_len,
            subtree,
        };
        if next_index % shard_size == 0 {
            if data_len != 0 {
                return Err(Error::InvalidArgument(
                    "fresh shard cannot have a nonzero data length".to_owned(),
                ));
            }
            // The data file is created lazily on the first append, clobbering
            // any bytes an aborted run left behind.
        } else {
            let path = writer.data_path(next_index / shard_size);
            let mut file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| Error::FileIO(path.clone(), e))?;
            file.set_len(data_len).map_err(|e| Error::FileIO(path.clone(), e))?;
            file.seek(SeekFrom::End(0)).map_err(|e| Error::FileIO(path, e))?;
            writer.file = Some(file);
        }
        Ok(writer)
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Streaming builder over the open shard's leaves only.
    pub fn subtree(&self) -> &TreeBuilder {
        &self.subtree
    }

    fn data_path(&self, number: u64) -> PathBuf {
        self.dir.join(shard_file_name(number))
    }

    /// Append one leaf. Returns the manifest when this append seals the
    /// shard.
    pub fn append(
        &mut self,
        index: u64,
        leaf_bytes: &[u8],
        extra_data: &[u8],
        leaf_hash: [u8; 32],
    ) -> Result<Option<ShardManifest>, Error> {
        if index != self.next_index {
            return Err(Error::InvalidArgument(format!(
                "out of order append: expected index {}, got {}",
                self.next_index, index
            )));
        }
        let number = index / self.shard_size;
        if self.file.is_none() {
            let path = self.data_path(number);
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(|e| Error::FileIO(path, e))?;
            self.file = Some(file);
        }
        if leaf_bytes.len() >= 1 << 24 || extra_data.len() >= 1 << 24 {
            return Err(Error::InvalidArgument(format!(
                "entry {} does not fit a 24-bit length prefix",
                index
            )));
        }
        let path = self.data_path(number);
        let file = self.file.as_mut().unwrap();
        write_opaque24(file, leaf_bytes).map_err(|e| Error::FileIO(path.clone(), e))?;
        write_opaque24(file, extra_data).map_err(|e| Error::FileIO(path, e))?;
        self.data_len += 6 + leaf_bytes.len() as u64 + extra_data.len() as u64;
        self.subtree.push(leaf_hash);
        self.next_index += 1;
        if self.next_index % self.shard_size == 0 {
            self.seal(number).map(Some)
        } else {
            Ok(None)
        }
    }

    fn seal(&mut self, number: u64) -> Result<ShardManifest, Error> {
        let path = self.data_path(number);
        let file = self.file.take().ok_or_else(|| {
            Error::InvalidArgument("sealing a shard with no open data file".to_owned())
        })?;
        file.sync_all().map_err(|e| Error::FileIO(path.clone(), e))?;
        let manifest = ShardManifest {
            first_index: number * self.shard_size,
            last_index: self.next_index - 1,
            count: self.shard_size,
            data_file: shard_file_name(number),
            data_len: self.data_len,
            subroot: utils::u8_to_hex(&self.subtree.root()),
        };
        let manifest_path = self.dir.join(manifest_file_name(number));
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::InvalidArgument(format!("encoding manifest: {}", e)))?;
        archive::write_atomic(&manifest_path, &json)?;
        info!(
            "sealed shard {} [{}, {}] subroot {}",
            manifest.data_file, manifest.first_index, manifest.last_index, manifest.subroot
        );
        self.subtree = TreeBuilder::new();
        self.data_len = 0;
        Ok(manifest)
    }

    /// Fsync the open shard's data file. Called before any checkpoint
    /// records the entries as present.
    pub fn sync(&mut self) -> Result<(), Error> {
        if let Some(file) = &self.file {
            let path = self.data_path(self.next_index / self.shard_size);
            file.sync_all().map_err(|e| Error::FileIO(path, e))?;
        }
        Ok(())
    }
}

fn write_opaque24(w: &mut impl Write, bytes: &[u8]) -> std::io::Result<()> {
    let len = bytes.len() as u32;
    w.write_all(&len.to_be_bytes()[1..])?;
    w.write_all(bytes)
}
