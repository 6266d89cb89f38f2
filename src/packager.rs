//! Republishing sealed shards: `.torrent` metainfo files, magnet links,
//! and an RSS 2.0 feed.
//!
//! Everything here is downstream of the verified archive. A failure while
//! packaging is logged and reported, but never invalidates archive state;
//! `rebuild-torrents` regenerates all of it from the manifests.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::config::Config;
use crate::shard::ShardManifest;
use crate::utils;

/// BEP 3 piece length used for all shard torrents.
const PIECE_LENGTH: u64 = 262_144;

/// One published torrent, as remembered in `feed.json` so the RSS feed can
/// be regenerated without re-reading every shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub torrent_file: String,
    pub magnet: String,
    pub info_hash: String,
    pub first_index: u64,
    pub last_index: u64,
    pub pub_date: String,
}

pub struct Packager {
    torrent_dir: PathBuf,
    trackers: Vec<String>,
    seed_peers: Vec<String>,
    as_number: Option<u32>,
}

impl Packager {
    pub fn new(config: &Config) -> Packager {
        Packager {
            torrent_dir: config.torrent_dir.clone(),
            trackers: config.trackers.clone(),
            seed_peers: config.seed_peers.clone(),
            as_number: config.as_number,
        }
    }

    /// Package every manifest in `manifests`, skipping shards that already
    /// have a torrent, then rewrite the feed.
    pub fn package_all(
        &self,
        log_name: &str,
        shards_dir: &Path,
        manifests: &[ShardManifest],
    ) -> Result<(), Error> {
        fs::create_dir_all(&self.torrent_dir)
            .map_err(|e| Error::FileIO(self.torrent_dir.clone(), e))?;
        let mut items = self.load_feed_items()?;
        for manifest in manifests {
            let name = torrent_name(log_name, manifest);
            if items.iter().any(|item: &FeedItem| item.title == name) {
                continue;
            }
            let item = self.package_shard(log_name, shards_dir, manifest)?;
            items.push(item);
        }
        items.sort_by(|a, b| a.title.cmp(&b.title));
        self.store_feed_items(&items)?;
        self.write_feed(&items)
    }

    /// Emit the `.torrent` for one sealed shard and return its feed item.
    pub fn package_shard(
        &self,
        log_name: &str,
        shards_dir: &Path,
        manifest: &ShardManifest,
    ) -> Result<FeedItem, Error> {
        let data_path = shards_dir.join(&manifest.data_file);
        let data = fs::read(&data_path).map_err(|e| Error::FileIO(data_path.clone(), e))?;
        if data.len() as u64 != manifest.data_len {
            return Err(Error::CorruptState(
                data_path,
                format!(
                    "data file is {} bytes but the manifest records {}",
                    data.len(),
                    manifest.data_len
                ),
            ));
        }
        let name = torrent_name(log_name, manifest);
        let info = build_info_dict(&name, &data);
        let info_hash = utils::sha1(&info);
        let comment = match self.as_number {
            Some(asn) => format!(
                "entries {}-{} of {}, subroot {}, seeded from AS{}",
                manifest.first_index, manifest.last_index, log_name, manifest.subroot, asn
            ),
            None => format!(
                "entries {}-{} of {}, subroot {}",
                manifest.first_index, manifest.last_index, log_name, manifest.subroot
            ),
        };
        let torrent = build_torrent(&self.trackers, &comment, Utc::now().timestamp(), &info);
        let torrent_file = format!("{}.torrent", name);
        let torrent_path = self.torrent_dir.join(&torrent_file);
        fs::write(&torrent_path, &torrent).map_err(|e| Error::FileIO(torrent_path, e))?;
        let magnet = self.magnet(&name, &info_hash);
        info!("packaged {} ({} bytes, {})", torrent_file, data.len(), magnet);
        Ok(FeedItem {
            title: name,
            torrent_file,
            magnet,
            info_hash: utils::u8_to_hex(&info_hash),
            first_index: manifest.first_index,
            last_index: manifest.last_index,
            pub_date: Utc::now().to_rfc2822(),
        })
    }

    fn magnet(&self, name: &str, info_hash: &[u8; 20]) -> String {
        let mut params: Vec<(&str, &str)> = vec![("dn", name)];
        for tracker in &self.trackers {
            params.push(("tr", tracker));
        }
        for peer in &self.seed_peers {
            params.push(("x.pe", peer));
        }
        let encoded = serde_urlencoded::to_string(&params).unwrap_or_default();
        format!("magnet:?xt=urn:btih:{}&{}", utils::u8_to_hex(info_hash), encoded)
    }

    fn feed_state_path(&self) -> PathBuf {
        self.torrent_dir.join("feed.json")
    }

    fn load_feed_items(&self) -> Result<Vec<FeedItem>, Error> {
        let path = self.feed_state_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::FileIO(path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| Error::CorruptState(path, e.to_string()))
    }

    fn store_feed_items(&self, items: &[FeedItem]) -> Result<(), Error> {
        let path = self.feed_state_path();
        let bytes = serde_json::to_vec_pretty(items)
            .map_err(|e| Error::InvalidArgument(format!("encoding feed state: {}", e)))?;
        fs::write(&path, bytes).map_err(|e| Error::FileIO(path, e))
    }

    /// Rewrite `feed.xml` listing every published torrent.
    fn write_feed(&self, items: &[FeedItem]) -> Result<(), Error> {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str("<rss version=\"2.0\">\n<channel>\n");
        xml.push_str("<title>ctmirror shard torrents</title>\n");
        xml.push_str("<description>Certificate Transparency log shards republished over BitTorrent</description>\n");
        xml.push_str("<link>urn:ctmirror:feed</link>\n");
        for item in items {
            xml.push_str("<item>\n");
            xml.push_str(&format!("<title>{}</title>\n", xml_escape(&item.title)));
            xml.push_str(&format!("<link>{}</link>\n", xml_escape(&item.magnet)));
            xml.push_str(&format!(
                "<guid isPermaLink=\"false\">urn:btih:{}</guid>\n",
                xml_escape(&item.info_hash)
            ));
            xml.push_str(&format!(
                "<description>entries {}-{}</description>\n",
                item.first_index, item.last_index
            ));
            xml.push_str(&format!("<pubDate>{}</pubDate>\n", xml_escape(&item.pub_date)));
            xml.push_str("</item>\n");
        }
        xml.push_str("</channel>\n</rss>\n");
        let path = self.torrent_dir.join("feed.xml");
        fs::write(&path, xml).map_err(|e| Error::FileIO(path, e))
    }
}

fn torrent_name(log_name: &str, manifest: &ShardManifest) -> String {
    format!("{}-{}", log_name.replace('/', "_"), manifest.data_file)
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

// Minimal bencode emitters (BEP 3). Dictionary keys must be written in
// lexicographic order; the builders below inline their keys in that order.

fn bstr(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

fn bint(out: &mut Vec<u8>, value: i64) {
    out.push(b'i');
    out.extend_from_slice(value.to_string().as_bytes());
    out.push(b'e');
}

/// The `info` dictionary of a single-file torrent. Hashed as-is for the
/// info hash, so the byte layout must be canonical.
fn build_info_dict(name: &str, data: &[u8]) -> Vec<u8> {
    let mut pieces = Vec::with_capacity(20 * data.len().div_ceil(PIECE_LENGTH as usize).max(1));
    for chunk in data.chunks(PIECE_LENGTH as usize) {
        pieces.extend_from_slice(&utils::sha1(chunk));
    }
    let mut out = Vec::new();
    out.push(b'd');
    bstr(&mut out, b"length");
    bint(&mut out, data.len() as i64);
    bstr(&mut out, b"name");
    bstr(&mut out, name.as_bytes());
    bstr(&mut out, b"piece length");
    bint(&mut out, PIECE_LENGTH as i64);
    bstr(&mut out, b"pieces");
    bstr(&mut out, &pieces);
    out.push(b'e');
    out
}

fn build_torrent(trackers: &[String], comment: &str, created: i64, info: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'd');
    if let Some(primary) = trackers.first() {
        bstr(&mut out, b"announce");
        bstr(&mut out, primary.as_bytes());
        bstr(&mut out, b"announce-list");
        out.push(b'l');
        for tracker in trackers {
            out.push(b'l');
            bstr(&mut out, tracker.as_bytes());
            out.push(b'e');
        }
        out.push(b'e');
    }
    bstr(&mut out, b"comment");
    bstr(&mut out, comment.as_bytes());
    bstr(&mut out, b"created by");
    bstr(&mut out, concat!("ctmirror/", env!("CARGO_PKG_VERSION")).as_bytes());
    bstr(&mut out, b"creation date");
    bint(&mut out, created);
    bstr(&mut out, b"info");
    out.extend_from_slice(info);
    out.push(b'e');
    out
}
