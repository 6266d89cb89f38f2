use std::ops::Range;

use async_stream::try_stream;
use base64::prelude::*;
use futures::Stream;

use crate::Error;
use crate::jsons;

use super::get_json;
use super::leaf::Leaf;
use super::FetchedEntry;

/// Request leaf entries from the CT log. Does not verify if these entries
/// are consistent with the tree or anything like that. Returns a stream of
/// decoded entries paired with their index.
///
/// The server is allowed to answer with a prefix of each requested batch;
/// the stream keeps asking for the remaining tail. A `200` with an empty
/// `entries` array ends the stream early, leaving the caller to decide
/// whether the missing tail is an error.
///
/// After the first Err result, the stream will not produce anything else.
pub fn get_entries<'a>(
    client: &'a reqwest::Client,
    base_url: &'a reqwest::Url,
    range: Range<u64>,
    batch_size: u64,
) -> impl Stream<Item = Result<FetchedEntry, Error>> + 'a {
    try_stream! {
        let mut next_index = range.start;

        while next_index < range.end {
            let end = u64::min(next_index + batch_size, range.end);
            let query = serde_urlencoded::to_string([("start", next_index), ("end", end - 1)])
                .map_err(|e| Error::InvalidArgument(format!("encoding query: {}", e)))?;

            let entries: jsons::GetEntries =
                get_json(client, base_url, &format!("ct/v1/get-entries?{}", query)).await?;
            if entries.entries.is_empty() {
                break;
            }

            for entry in entries.entries {
                if next_index >= end {
                    // Over-long reply; ignore the excess rather than trust it.
                    break;
                }
                let leaf = decode_entry(&entry, next_index)?;
                yield FetchedEntry { index: next_index, leaf };
                next_index += 1;
            }
        }
    }
}

fn decode_entry(entry: &jsons::LeafEntry, index: u64) -> Result<Leaf, Error> {
    let leaf_bytes = BASE64_STANDARD.decode(&entry.leaf_input).map_err(|e| {
        Error::MalformedResponseBody(format!("leaf_input of entry {}: {}", index, e))
    })?;
    let extra_data = BASE64_STANDARD.decode(&entry.extra_data).map_err(|e| {
        Error::MalformedResponseBody(format!("extra_data of entry {}: {}", index, e))
    })?;
    Leaf::from_raw(leaf_bytes, extra_data).map_err(|desc| Error::Decode { index, desc })
}
