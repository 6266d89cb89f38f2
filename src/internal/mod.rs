//! Transport plumbing for the CT HTTP API.

use std::time::Duration;

use base64::prelude::*;
use log::warn;
use openssl::pkey::{PKey, Public};
use serde::de::DeserializeOwned;

use crate::Error;
use crate::jsons;
use crate::sth::{SignatureAlgorithm, SignedTreeHead};

pub use getentries::get_entries;
pub use leaf::{Leaf, LeafPayload};

mod getentries;
mod leaf;

/// Total attempts per request before a transient failure is surfaced.
pub const RETRY_ATTEMPTS: u32 = 5;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A decoded entry paired with its global index in the log.
#[derive(Debug, Clone)]
pub struct FetchedEntry {
    pub index: u64,
    pub leaf: Leaf,
}

/// Build the HTTP client for one log. Every log descriptor gets its own
/// client; there is no shared global state.
pub fn new_http_client(timeout: Duration) -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .user_agent(concat!("ctmirror/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(Error::NetIO)
}

/// Exponential backoff for retry `attempt` (0-based), capped at 60 s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let delay = INITIAL_BACKOFF * 2u32.saturating_pow(attempt);
    delay.min(MAX_BACKOFF)
}

enum AttemptError {
    /// 5xx, connection failure, timeout, empty body. Worth retrying.
    Transient(Error),
    /// 4xx or a body we cannot parse. Retrying will not help.
    Fatal(Error),
}

async fn get_json_once<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &reqwest::Url,
) -> Result<T, AttemptError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| AttemptError::Transient(Error::NetIO(e)))?;
    let status = response.status();
    if status.is_server_error() {
        return Err(AttemptError::Transient(Error::InvalidResponseStatus(status)));
    }
    if !status.is_success() {
        return Err(AttemptError::Fatal(Error::InvalidResponseStatus(status)));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| AttemptError::Transient(Error::NetIO(e)))?;
    if body.is_empty() {
        return Err(AttemptError::Transient(Error::MalformedResponseBody(
            "empty response body".to_owned(),
        )));
    }
    serde_json::from_slice(&body).map_err(|e| {
        AttemptError::Fatal(Error::MalformedResponseBody(format!(
            "{} (while parsing response of {})",
            e, url
        )))
    })
}

/// GET `base_url`/`path` and parse the JSON body. Transient failures are
/// retried with exponential backoff up to [`RETRY_ATTEMPTS`]; 4xx and
/// malformed bodies are surfaced immediately.
pub async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    base_url: &reqwest::Url,
    path: &str,
) -> Result<T, Error> {
    let url = base_url
        .join(path)
        .map_err(|e| Error::InvalidArgument(format!("bad url {:?}: {}", path, e)))?;
    let mut attempt = 0u32;
    loop {
        match get_json_once(client, &url).await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(e)) => return Err(e),
            Err(AttemptError::Transient(e)) => {
                attempt += 1;
                if attempt >= RETRY_ATTEMPTS {
                    return Err(e);
                }
                let delay = backoff_delay(attempt - 1);
                warn!(
                    "{}: {} (attempt {}/{}, retrying in {:?})",
                    url, e, attempt, RETRY_ATTEMPTS, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Fetch the current tree head and check its signature under the log's
/// expected algorithm.
pub async fn check_tree_head(
    client: &reqwest::Client,
    base_url: &reqwest::Url,
    pub_key: &PKey<Public>,
    algorithm: SignatureAlgorithm,
) -> Result<SignedTreeHead, Error> {
    let response: jsons::STH = get_json(client, base_url, "ct/v1/get-sth").await?;
    let sth = SignedTreeHead::from_json(&response)?;
    sth.verify(pub_key, algorithm)?;
    Ok(sth)
}

/// Fetch the consistency proof between two tree sizes. The proof is only
/// decoded here; checking it is [`crate::merkle::verify_consistency_proof`]'s
/// job.
pub async fn get_consistency_proof(
    client: &reqwest::Client,
    base_url: &reqwest::Url,
    first_size: u64,
    second_size: u64,
) -> Result<Vec<[u8; 32]>, Error> {
    let query = serde_urlencoded::to_string([("first", first_size), ("second", second_size)])
        .map_err(|e| Error::InvalidArgument(format!("encoding query: {}", e)))?;
    let response: jsons::ConsistencyProof =
        get_json(client, base_url, &format!("ct/v1/get-sth-consistency?{}", query)).await?;
    response
        .consistency
        .iter()
        .map(|node| {
            let bytes = BASE64_STANDARD
                .decode(node)
                .map_err(|e| Error::MalformedResponseBody(format!("consistency node: {}", e)))?;
            bytes.as_slice().try_into().map_err(|_| {
                Error::MalformedResponseBody(format!(
                    "consistency node is {} bytes, expected 32",
                    bytes.len()
                ))
            })
        })
        .collect()
}
