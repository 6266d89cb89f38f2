//! The per-log sync run: trust loading, tree-head fetching, consistency
//! checking, ordered ingest, and the final commit.
//!
//! A run walks IDLE → FETCH_STH → VERIFY_CONSISTENCY → SYNC → COMMIT.
//! Every verification failure aborts the run before the trusted tree head
//! is touched; sealed shards from earlier in the run stay on disk, and the
//! open shard's unrecorded tail is truncated on the next open.

use std::time::{Duration, Instant};

use futures::{Stream, StreamExt, pin_mut};
use log::info;
use openssl::pkey::{PKey, Public};

use crate::Error;
use crate::archive::{Archive, Checkpoint};
use crate::config::{Config, LogDescriptor};
use crate::internal::{self, FetchedEntry};
use crate::merkle::{self, TreeBuilder};
use crate::pipeline;
use crate::shard::{ShardManifest, ShardWriter};
use crate::sth::{SignatureAlgorithm, SignedTreeHead};
use crate::utils;

/// What a completed run did.
#[derive(Debug)]
pub struct SyncOutcome {
    pub old_size: u64,
    pub new_size: u64,
    pub sealed: Vec<ShardManifest>,
}

pub struct SyncController {
    name: String,
    base_url: reqwest::Url,
    pub_key: PKey<Public>,
    algorithm: SignatureAlgorithm,
    client: reqwest::Client,
    archive: Archive,
    workers: usize,
    batch_size: u64,
    shard_size: u64,
}

impl SyncController {
    pub fn new(log: &LogDescriptor, archive: Archive, config: &Config) -> Result<SyncController, Error> {
        if !log.base_url.ends_with('/') {
            return Err(Error::InvalidArgument("base url must end with /".to_owned()));
        }
        let base_url = reqwest::Url::parse(&log.base_url)
            .map_err(|e| Error::InvalidArgument(format!("unable to parse url: {}", e)))?;
        let pub_key = PKey::public_key_from_der(&log.public_key)
            .map_err(|e| Error::InvalidArgument(format!("error parsing public key: {}", e)))?;
        // The algorithm on record for the log must agree with its key; a
        // list entry whose two declarations disagree is unusable.
        let key_algorithm = SignatureAlgorithm::for_key(&pub_key)?;
        if let Some(declared) = log.signature_algorithm {
            if declared != key_algorithm {
                return Err(Error::Config(format!(
                    "log {}: declared signature algorithm {} but the key is for {}",
                    log.name, declared, key_algorithm
                )));
            }
        }
        // The server-side cap bounds what one get-entries call may return.
        let batch_size = match log.batch_size_hint {
            Some(hint) => hint.min(config.batch_size),
            None => config.batch_size,
        };
        let client = internal::new_http_client(config.request_timeout())?;
        Ok(SyncController {
            name: log.name.clone(),
            base_url,
            pub_key,
            algorithm: key_algorithm,
            client,
            archive,
            workers: config.workers,
            batch_size,
            shard_size: config.shard_size,
        })
    }

    pub fn shards_dir(&self) -> std::path::PathBuf {
        self.archive.shards_dir()
    }

    /// Drive one complete run against the log. Idempotent when the log has
    /// not advanced; otherwise extends the archive to the new tree head.
    pub async fn run_once(&mut self) -> Result<SyncOutcome, Error> {
        // IDLE: load prior trust. An absent sth.json means an empty mirror.
        let trusted = self.archive.load_trusted_sth(&self.pub_key, self.algorithm)?;
        let old_size = trusted.as_ref().map_or(0, |sth| sth.tree_size);

        // FETCH_STH
        let new =
            internal::check_tree_head(&self.client, &self.base_url, &self.pub_key, self.algorithm)
                .await?;
        info!(
            "{}: tree head {} -> {} ({})",
            self.name,
            old_size,
            new.tree_size,
            utils::u8_to_hex(&new.root_hash)
        );

        // VERIFY_CONSISTENCY
        if let Some(old) = &trusted {
            if new.tree_size < old.tree_size {
                return Err(Error::InvalidConsistencyProof {
                    prev_size: old.tree_size,
                    new_size: new.tree_size,
                    desc: "tree size regressed; the trusted tree head never rolls back"
                        .to_owned(),
                });
            }
            if new.tree_size == old.tree_size {
                if new.root_hash != old.root_hash {
                    return Err(Error::InvalidConsistencyProof {
                        prev_size: old.tree_size,
                        new_size: new.tree_size,
                        desc: format!(
                            "two distinct roots for tree size {}: {} and {}",
                            new.tree_size,
                            utils::u8_to_hex(&old.root_hash),
                            utils::u8_to_hex(&new.root_hash)
                        ),
                    });
                }
                info!("{}: already up to date at {}", self.name, old.tree_size);
                return Ok(SyncOutcome {
                    old_size,
                    new_size: new.tree_size,
                    sealed: Vec::new(),
                });
            }
            if old.tree_size > 0 {
                let proof = internal::get_consistency_proof(
                    &self.client,
                    &self.base_url,
                    old.tree_size,
                    new.tree_size,
                )
                .await?;
                merkle::verify_consistency_proof(
                    old.tree_size,
                    new.tree_size,
                    &old.root_hash,
                    &new.root_hash,
                    &proof,
                )?;
            }
        } else if new.tree_size == 0 {
            // Empty log. Remember the signed head so later runs have an
            // anchor, then stop.
            self.archive.store_trusted_sth(&new)?;
            return Ok(SyncOutcome {
                old_size: 0,
                new_size: 0,
                sealed: Vec::new(),
            });
        }

        // SYNC: resume from the checkpoint, which may already be past the
        // trusted head if an earlier run sealed shards and then aborted.
        let checkpoint = match self.archive.load_checkpoint()? {
            Some(checkpoint) => {
                if checkpoint.next_index < old_size {
                    return Err(Error::CorruptState(
                        self.archive.dir().join("resume.json"),
                        format!(
                            "checkpoint at {} is behind the trusted tree head {}",
                            checkpoint.next_index, old_size
                        ),
                    ));
                }
                if checkpoint.next_index > new.tree_size {
                    return Err(Error::CorruptState(
                        self.archive.dir().join("resume.json"),
                        format!(
                            "checkpoint at {} is past the log's tree size {}",
                            checkpoint.next_index, new.tree_size
                        ),
                    ));
                }
                checkpoint
            }
            None => {
                if old_size != 0 {
                    return Err(Error::CorruptState(
                        self.archive.dir().join("resume.json"),
                        format!("missing, but the trusted tree head is at {}", old_size),
                    ));
                }
                Checkpoint {
                    next_index: 0,
                    data_len: 0,
                    tree_stack: Vec::new(),
                    shard_stack: Vec::new(),
                }
            }
        };
        let start = checkpoint.next_index;
        let mut builder = TreeBuilder::resume(start, checkpoint.tree_stack)?;
        let subtree = TreeBuilder::resume(start % self.shard_size, checkpoint.shard_stack)?;
        let mut writer = ShardWriter::open(
            &self.archive.shards_dir(),
            self.shard_size,
            start,
            checkpoint.data_len,
            subtree,
        )?;

        let entries =
            pipeline::fetch_ordered(&self.client, &self.base_url, start..new.tree_size, self.batch_size, self.workers);
        let sealed = ingest(&self.archive, entries, &mut builder, &mut writer, &new).await?;

        // COMMIT: data first, then the checkpoint that records it, then the
        // new trust anchor.
        writer.sync()?;
        self.archive.store_checkpoint(&Checkpoint {
            next_index: new.tree_size,
            data_len: writer.data_len(),
            tree_stack: builder.stack().to_vec(),
            shard_stack: writer.subtree().stack().to_vec(),
        })?;
        self.archive.store_trusted_sth(&new)?;
        info!(
            "{}: advanced trusted tree head to {} ({} new sealed shards)",
            self.name,
            new.tree_size,
            sealed.len()
        );
        Ok(SyncOutcome {
            old_size,
            new_size: new.tree_size,
            sealed,
        })
    }
}

/// Drain `entries` in strict index order, feeding the full-tree builder
/// and the shard writer in lockstep and checkpointing at every seal. When
/// the stream ends, the recomputed root must equal `expected`'s root.
pub(crate) async fn ingest<S>(
    archive: &Archive,
    entries: S,
    builder: &mut TreeBuilder,
    writer: &mut ShardWriter,
    expected: &SignedTreeHead,
) -> Result<Vec<ShardManifest>, Error>
where
    S: Stream<Item = Result<FetchedEntry, Error>>,
{
    pin_mut!(entries);
    let start = builder.size();
    let mut sealed = Vec::new();
    let mut delaycheck = Instant::now();
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        if entry.index != builder.size() {
            return Err(Error::ExpectedEntry(builder.size()));
        }
        builder.push(entry.leaf.hash);
        let maybe_sealed = writer.append(
            entry.index,
            &entry.leaf.leaf_bytes,
            &entry.leaf.extra_data,
            entry.leaf.hash,
        )?;
        if let Some(manifest) = maybe_sealed {
            // The sealed data file was fsynced by the writer; recording the
            // boundary makes the seal durable across restarts.
            archive.store_checkpoint(&Checkpoint {
                next_index: writer.next_index(),
                data_len: 0,
                tree_stack: builder.stack().to_vec(),
                shard_stack: Vec::new(),
            })?;
            sealed.push(manifest);
        }
        if delaycheck.elapsed() > Duration::from_secs(1) {
            let done = builder.size() - start;
            let total = expected.tree_size - start;
            info!(
                "catching up: {} / {} ({}%)",
                builder.size(),
                expected.tree_size,
                (done * 1000 / total) as f32 / 10f32
            );
            delaycheck = Instant::now();
        }
    }
    if builder.size() != expected.tree_size {
        return Err(Error::ExpectedEntry(builder.size()));
    }
    let computed = builder.root();
    if computed != expected.root_hash {
        return Err(Error::RootMismatch {
            tree_size: expected.tree_size,
            expected: expected.root_hash,
            computed,
        });
    }
    Ok(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::Leaf;
    use futures::stream;

    fn test_entry(index: u64) -> FetchedEntry {
        let mut leaf_bytes = vec![0u8, 0u8];
        leaf_bytes.extend_from_slice(&index.to_be_bytes());
        leaf_bytes.extend_from_slice(&0u16.to_be_bytes());
        let cert = format!("cert-{}", index).into_bytes();
        leaf_bytes.extend_from_slice(&(cert.len() as u32).to_be_bytes()[1..]);
        leaf_bytes.extend_from_slice(&cert);
        leaf_bytes.extend_from_slice(&0u16.to_be_bytes());
        FetchedEntry {
            index,
            leaf: Leaf::from_raw(leaf_bytes, Vec::new()).unwrap(),
        }
    }

    fn expected_head(entries: &[FetchedEntry]) -> SignedTreeHead {
        let mut builder = TreeBuilder::new();
        for entry in entries {
            builder.push(entry.leaf.hash);
        }
        SignedTreeHead {
            tree_size: entries.len() as u64,
            timestamp: 0,
            root_hash: builder.root(),
            signature: Vec::new(),
        }
    }

    fn fresh_writer(archive: &Archive, shard_size: u64) -> ShardWriter {
        ShardWriter::open(&archive.shards_dir(), shard_size, 0, 0, TreeBuilder::new()).unwrap()
    }

    #[tokio::test]
    async fn ingest_seals_and_verifies_root() {
        let root = tempfile::tempdir().unwrap();
        let archive = Archive::open(root.path(), "log").unwrap();
        let entries: Vec<_> = (0..5).map(test_entry).collect();
        let head = expected_head(&entries);

        let mut builder = TreeBuilder::new();
        let mut writer = fresh_writer(&archive, 2);
        let sealed = ingest(
            &archive,
            stream::iter(entries.into_iter().map(Ok)),
            &mut builder,
            &mut writer,
            &head,
        )
        .await
        .unwrap();

        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[1].first_index, 2);
        assert_eq!(builder.size(), 5);
        assert_eq!(builder.root(), head.root_hash);
        // Boundary checkpoint recorded the second seal.
        let checkpoint = archive.load_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.next_index, 4);
        assert_eq!(checkpoint.data_len, 0);
        assert!(checkpoint.shard_stack.is_empty());
    }

    #[tokio::test]
    async fn ingest_rejects_root_mismatch() {
        let root = tempfile::tempdir().unwrap();
        let archive = Archive::open(root.path(), "log").unwrap();
        let entries: Vec<_> = (0..3).map(test_entry).collect();
        let mut head = expected_head(&entries);
        head.root_hash[0] ^= 1;

        let mut builder = TreeBuilder::new();
        let mut writer = fresh_writer(&archive, 65536);
        let result = ingest(
            &archive,
            stream::iter(entries.into_iter().map(Ok)),
            &mut builder,
            &mut writer,
            &head,
        )
        .await;
        assert!(matches!(result, Err(Error::RootMismatch { tree_size: 3, .. })));
        // No checkpoint was recorded for the unverified tail.
        assert!(archive.load_checkpoint().unwrap().is_none());
    }

    #[tokio::test]
    async fn ingest_rejects_gaps() {
        let root = tempfile::tempdir().unwrap();
        let archive = Archive::open(root.path(), "log").unwrap();
        let entries = vec![test_entry(0), test_entry(2)];
        let head = expected_head(&entries);

        let mut builder = TreeBuilder::new();
        let mut writer = fresh_writer(&archive, 65536);
        let result = ingest(
            &archive,
            stream::iter(entries.into_iter().map(Ok)),
            &mut builder,
            &mut writer,
            &head,
        )
        .await;
        assert!(matches!(result, Err(Error::ExpectedEntry(1))));
    }

    #[tokio::test]
    async fn ingest_rejects_missing_tail() {
        let root = tempfile::tempdir().unwrap();
        let archive = Archive::open(root.path(), "log").unwrap();
        let entries: Vec<_> = (0..2).map(test_entry).collect();
        let mut head = expected_head(&entries);
        head.tree_size = 3;

        let mut builder = TreeBuilder::new();
        let mut writer = fresh_writer(&archive, 65536);
        let result = ingest(
            &archive,
            stream::iter(entries.into_iter().map(Ok)),
            &mut builder,
            &mut writer,
            &head,
        )
        .await;
        assert!(matches!(result, Err(Error::ExpectedEntry(2))));
    }

    #[tokio::test]
    async fn declared_algorithm_must_match_key() {
        use openssl::ec::{EcGroup, EcKey};
        use openssl::nid::Nid;
        use openssl::pkey::PKey;

        let root = tempfile::tempdir().unwrap();
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        let config: Config = serde_json::from_value(serde_json::json!({
            "archive_root": root.path().join("archive"),
            "torrent_dir": root.path().join("torrents"),
            "known_logs": root.path().join("known_logs.json"),
        }))
        .unwrap();
        let mut log = LogDescriptor {
            name: "ct.example.com/log".to_owned(),
            base_url: "https://ct.example.com/log/".to_owned(),
            public_key: key.public_key_to_der().unwrap(),
            signature_algorithm: Some(SignatureAlgorithm::Rsa),
            batch_size_hint: None,
        };
        let archive = Archive::open(&config.archive_root, &log.name).unwrap();
        assert!(matches!(
            SyncController::new(&log, archive, &config),
            Err(Error::Config(_))
        ));

        log.signature_algorithm = Some(SignatureAlgorithm::Ecdsa);
        let archive = Archive::open(&config.archive_root, &log.name).unwrap();
        SyncController::new(&log, archive, &config).unwrap();
    }

    #[tokio::test]
    async fn batch_hint_caps_the_configured_batch_size() {
        use openssl::ec::{EcGroup, EcKey};
        use openssl::nid::Nid;
        use openssl::pkey::PKey;

        let root = tempfile::tempdir().unwrap();
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        let config: Config = serde_json::from_value(serde_json::json!({
            "archive_root": root.path().join("archive"),
            "torrent_dir": root.path().join("torrents"),
            "known_logs": root.path().join("known_logs.json"),
            "batch_size": 256,
        }))
        .unwrap();
        let log = LogDescriptor {
            name: "ct.example.com/log".to_owned(),
            base_url: "https://ct.example.com/log/".to_owned(),
            public_key: key.public_key_to_der().unwrap(),
            signature_algorithm: None,
            batch_size_hint: Some(32),
        };
        let archive = Archive::open(&config.archive_root, &log.name).unwrap();
        let controller = SyncController::new(&log, archive, &config).unwrap();
        assert_eq!(controller.batch_size, 32);
    }

    #[tokio::test]
    async fn ingest_propagates_stream_errors() {
        let root = tempfile::tempdir().unwrap();
        let archive = Archive::open(root.path(), "log").unwrap();
        let head = expected_head(&[]);
        let mut builder = TreeBuilder::new();
        let mut writer = fresh_writer(&archive, 65536);
        let result = ingest(
            &archive,
            stream::iter(vec![Err::<FetchedEntry, _>(Error::ExpectedEntry(9))]),
            &mut builder,
            &mut writer,
            &head,
        )
        .await;
        assert!(matches!(result, Err(Error::ExpectedEntry(9))));
    }

    #[tokio::test]
    async fn empty_stream_with_matching_root_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        let archive = Archive::open(root.path(), "log").unwrap();
        let entries: Vec<_> = (0..4).map(test_entry).collect();
        let head = expected_head(&entries);

        // Builder already holds the whole tree (crash after the final
        // checkpoint, before the trust anchor was replaced).
        let mut builder = TreeBuilder::new();
        let mut writer = fresh_writer(&archive, 2);
        for entry in &entries {
            builder.push(entry.leaf.hash);
            writer
                .append(entry.index, &entry.leaf.leaf_bytes, &entry.leaf.extra_data, entry.leaf.hash)
                .unwrap();
        }
        let sealed = ingest(
            &archive,
            stream::iter(Vec::<Result<FetchedEntry, Error>>::new()),
            &mut builder,
            &mut writer,
            &head,
        )
        .await
        .unwrap();
        assert!(sealed.is_empty());
    }
}
