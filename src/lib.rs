//! Mirror Certificate Transparency logs into local, cryptographically
//! verified archives, and republish them as BitTorrent swarms.
//!
//! Each run extends the mirror of a log to its newest Signed Tree Head:
//! the STH signature is checked against the log's public key, a
//! consistency proof ties the new root to the previously trusted one, the
//! new entries are downloaded concurrently and re-hashed into the Merkle
//! root, and only when the recomputed root matches the signed root does
//! the trusted tree head advance. Verified entries are packed into
//! fixed-size shards, and every sealed shard gets a `.torrent` file, a
//! magnet link and an RSS feed item.
//!
//! Best effort is made to catch misbehavior by CT logs: any verification
//! failure aborts the run without touching the trusted state, so the
//! archive only ever reflects tree heads that were proven to extend each
//! other.
//!
//! All public keys are in DER format, which is the format served (in
//! base64) by the standard known-logs lists. `signature`s are
//! *Digitally-signed structs*.
//!
//! To learn more about how CT works, read
//! [the RFC](https://tools.ietf.org/html/rfc6962).

#[macro_use(lazy_static)]
extern crate lazy_static;

use std::{fmt, io, path};

pub use internal::{FetchedEntry, Leaf, LeafPayload};
pub use sth::{SignatureAlgorithm, SignedTreeHead};
pub use sync::{SyncController, SyncOutcome};

mod sth;

pub mod archive;
pub mod config;
pub mod internal;
pub mod jsons;
pub mod merkle;
pub mod packager;
pub mod pipeline;
pub mod shard;
pub mod sync;
pub mod utils;

#[cfg(not(any(feature = "native-tls", feature = "rustls-tls")))]
compile_error!("You must enable either the `native-tls` or `rustls-tls` feature.");

#[cfg(all(feature = "native-tls", feature = "rustls-tls"))]
compile_error!("You must enable only one of the `native-tls` and `rustls-tls` features, not both.");

/// Errors that this crate could produce.
#[derive(Debug)]
pub enum Error {
    /// You provided something bad.
    InvalidArgument(String),

    /// File IO error
    FileIO(path::PathBuf, io::Error),

    /// Network IO error
    NetIO(reqwest::Error),

    /// The server responded with something other than 200 (after retries,
    /// for transient statuses).
    InvalidResponseStatus(reqwest::StatusCode),

    /// Server responded with something bad (e.g. malformed JSON)
    MalformedResponseBody(String),

    /// The CT server provided us with an invalid signature.
    InvalidSignature(String),

    /// Server returned an invalid consistency proof, or claimed a tree
    /// that cannot extend the one we trust.
    InvalidConsistencyProof {
        prev_size: u64,
        new_size: u64,
        desc: String,
    },

    /// The root recomputed from the downloaded entries does not match the
    /// signed tree head.
    RootMismatch {
        tree_size: u64,
        expected: [u8; 32],
        computed: [u8; 32],
    },

    /// A leaf entry could not be decoded.
    Decode { index: u64, desc: String },

    /// We asked for a certain entry expecting it to be there, but the
    /// server gave us nothing.
    ExpectedEntry(u64),

    /// The configuration or known-logs file is unusable.
    Config(String),

    /// A state file in the archive is unreadable or inconsistent.
    CorruptState(path::PathBuf, String),

    /// Another run holds the archive's lockfile.
    ArchiveLocked(path::PathBuf),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(desc) => write!(f, "Invalid argument: {}", desc),
            Error::FileIO(path, e) => write!(f, "{}: {}", path.to_string_lossy(), &e),
            Error::NetIO(e) => write!(f, "Network IO error: {}", &e),
            Error::InvalidResponseStatus(response_code) => write!(
                f,
                "Server responded with {} {}",
                response_code.as_u16(),
                response_code.as_str()
            ),
            Error::MalformedResponseBody(desc) => {
                write!(f, "Unable to parse server response: {}", &desc)
            }
            Error::InvalidSignature(desc) => write!(f, "Invalid signature received: {}", &desc),
            Error::InvalidConsistencyProof {
                prev_size,
                new_size,
                desc,
            } => write!(
                f,
                "Server provided an invalid consistency proof from {} to {}: {}",
                prev_size, new_size, &desc
            ),
            Error::RootMismatch {
                tree_size,
                expected,
                computed,
            } => write!(
                f,
                "Recomputed root {} for tree size {} does not match the signed root {}",
                utils::u8_to_hex(computed),
                tree_size,
                utils::u8_to_hex(expected)
            ),
            Error::Decode { index, desc } => {
                write!(f, "Unable to decode leaf entry {}: {}", index, desc)
            }
            Error::ExpectedEntry(leaf_index) => write!(
                f,
                "The server did not return the leaf with index {}, even though we believe it should be there.",
                leaf_index
            ),
            Error::Config(desc) => write!(f, "Configuration error: {}", desc),
            Error::CorruptState(path, desc) => write!(
                f,
                "Archive state file {} is unusable: {}",
                path.to_string_lossy(),
                desc
            ),
            Error::ArchiveLocked(path) => write!(
                f,
                "Another run holds the lockfile {} (remove it if the previous run crashed)",
                path.to_string_lossy()
            ),
        }
    }
}
