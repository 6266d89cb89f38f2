//! `MerkleTreeLeaf` decoding per RFC 6962 §3.4.

use crate::merkle;

/// The typed payload of a leaf: an ordinary certificate entry or a
/// precertificate entry. The rest of the pipeline only depends on the leaf
/// hash; the payload is exposed for consumers of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafPayload {
    X509 {
        /// The logged end-entity certificate, DER.
        certificate: Vec<u8>,
        /// Issuer chain from `extra_data`, leaf issuer first.
        chain: Vec<Vec<u8>>,
    },
    Precert {
        issuer_key_hash: [u8; 32],
        /// The signed TBSCertificate with the poison extension removed.
        tbs_certificate: Vec<u8>,
        /// The full precertificate followed by its issuer chain.
        chain: Vec<Vec<u8>>,
    },
}

/// A decoded log entry. `leaf_bytes` and `extra_data` are kept verbatim so
/// the shard writer can store exactly what the tree commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub timestamp: u64,
    pub hash: [u8; 32],
    pub payload: LeafPayload,
    pub leaf_bytes: Vec<u8>,
    pub extra_data: Vec<u8>,
}

impl Leaf {
    /// Decode raw `leaf_input`/`extra_data` bytes. Error strings carry no
    /// index; the caller attaches it.
    pub fn from_raw(leaf_bytes: Vec<u8>, extra_data: Vec<u8>) -> Result<Leaf, String> {
        let hash = merkle::leaf_hash(&leaf_bytes);
        let mut reader = Reader::new(&leaf_bytes);
        let version = reader.u8("version")?;
        if version != 0 {
            return Err(format!("unknown leaf version {}", version));
        }
        let leaf_type = reader.u8("leaf type")?;
        if leaf_type != 0 {
            return Err(format!("unknown leaf type {}", leaf_type));
        }
        let timestamp = reader.u64("timestamp")?;
        let entry_type = reader.u16("entry type")?;
        let payload = match entry_type {
            0 => {
                let certificate = reader.opaque24("certificate")?.to_vec();
                reader.opaque16("extensions")?;
                reader.finish()?;
                LeafPayload::X509 {
                    certificate,
                    chain: parse_x509_extra(&extra_data)?,
                }
            }
            1 => {
                let issuer_key_hash: [u8; 32] = reader
                    .bytes(32, "issuer key hash")?
                    .try_into()
                    .expect("fixed length read");
                let tbs_certificate = reader.opaque24("tbs certificate")?.to_vec();
                reader.opaque16("extensions")?;
                reader.finish()?;
                LeafPayload::Precert {
                    issuer_key_hash,
                    tbs_certificate,
                    chain: parse_precert_extra(&extra_data)?,
                }
            }
            other => return Err(format!("unknown entry type {}", other)),
        };
        Ok(Leaf {
            timestamp,
            hash,
            payload,
            leaf_bytes,
            extra_data,
        })
    }

    pub fn is_precert(&self) -> bool {
        matches!(self.payload, LeafPayload::Precert { .. })
    }
}

/// `extra_data` of an x509 entry: the issuer chain as a 24-bit
/// length-prefixed list of 24-bit length-prefixed certificates. Some logs
/// serve an empty blob for entries with no chain.
fn parse_x509_extra(extra: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    if extra.is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = Reader::new(extra);
    let chain = reader.opaque24("certificate chain")?;
    reader.finish()?;
    parse_chain(chain)
}

/// `extra_data` of a precert entry: the full precertificate, then the
/// issuer chain.
fn parse_precert_extra(extra: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    if extra.is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = Reader::new(extra);
    let pre_certificate = reader.opaque24("pre-certificate")?.to_vec();
    let chain = reader.opaque24("precertificate chain")?;
    reader.finish()?;
    let mut certs = vec![pre_certificate];
    certs.extend(parse_chain(chain)?);
    Ok(certs)
}

fn parse_chain(chain: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    let mut reader = Reader::new(chain);
    let mut certs = Vec::new();
    while !reader.at_end() {
        certs.push(reader.opaque24("chain certificate")?.to_vec());
    }
    Ok(certs)
}

/// Cursor over a TLS-encoded buffer. Every read names the field it is
/// after so decode errors pinpoint the offending structure.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8], String> {
        if self.buf.len() - self.pos < n {
            return Err(format!(
                "short buffer reading {}: need {} bytes at offset {}, have {}",
                what,
                n,
                self.pos,
                self.buf.len() - self.pos
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8, String> {
        Ok(self.bytes(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, String> {
        let b = self.bytes(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self, what: &str) -> Result<u64, String> {
        let b = self.bytes(8, what)?;
        Ok(u64::from_be_bytes(b.try_into().expect("fixed length read")))
    }

    /// `opaque<0..2^16-1>`: 16-bit length then payload.
    fn opaque16(&mut self, what: &str) -> Result<&'a [u8], String> {
        let len = self.u16(what)? as usize;
        self.bytes(len, what)
    }

    /// `opaque<0..2^24-1>`: 24-bit length then payload.
    fn opaque24(&mut self, what: &str) -> Result<&'a [u8], String> {
        let b = self.bytes(3, what)?;
        let len = u32::from_be_bytes([0, b[0], b[1], b[2]]) as usize;
        self.bytes(len, what)
    }

    fn finish(&self) -> Result<(), String> {
        if self.at_end() {
            Ok(())
        } else {
            Err(format!(
                "{} trailing bytes after structure",
                self.buf.len() - self.pos
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_opaque24(buf: &mut Vec<u8>, bytes: &[u8]) {
        let len = bytes.len() as u32;
        buf.extend_from_slice(&len.to_be_bytes()[1..]);
        buf.extend_from_slice(bytes);
    }

    fn x509_leaf(timestamp: u64, cert: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8, 0u8]; // v1, timestamped_entry
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes()); // x509_entry
        push_opaque24(&mut buf, cert);
        buf.extend_from_slice(&0u16.to_be_bytes()); // no extensions
        buf
    }

    fn chain_extra(certs: &[&[u8]]) -> Vec<u8> {
        let mut chain = Vec::new();
        for cert in certs {
            push_opaque24(&mut chain, cert);
        }
        let mut extra = Vec::new();
        push_opaque24(&mut extra, &chain);
        extra
    }

    #[test]
    fn decodes_x509_entry() {
        let leaf_bytes = x509_leaf(1_500_000_000_000, b"fake der");
        let extra = chain_extra(&[b"issuer", b"root"]);
        let leaf = Leaf::from_raw(leaf_bytes.clone(), extra).unwrap();
        assert_eq!(leaf.timestamp, 1_500_000_000_000);
        assert_eq!(leaf.hash, merkle::leaf_hash(&leaf_bytes));
        assert!(!leaf.is_precert());
        match &leaf.payload {
            LeafPayload::X509 { certificate, chain } => {
                assert_eq!(certificate, b"fake der");
                assert_eq!(chain.len(), 2);
                assert_eq!(chain[0], b"issuer");
            }
            other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn decodes_precert_entry() {
        let mut buf = vec![0u8, 0u8];
        buf.extend_from_slice(&77u64.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // precert_entry
        buf.extend_from_slice(&[0xabu8; 32]);
        push_opaque24(&mut buf, b"tbs bytes");
        buf.extend_from_slice(&0u16.to_be_bytes());

        let mut extra = Vec::new();
        push_opaque24(&mut extra, b"full precert");
        let mut chain = Vec::new();
        push_opaque24(&mut chain, b"issuer");
        push_opaque24(&mut extra, &chain);

        let leaf = Leaf::from_raw(buf, extra).unwrap();
        assert!(leaf.is_precert());
        match &leaf.payload {
            LeafPayload::Precert {
                issuer_key_hash,
                tbs_certificate,
                chain,
            } => {
                assert_eq!(issuer_key_hash, &[0xabu8; 32]);
                assert_eq!(tbs_certificate, b"tbs bytes");
                assert_eq!(chain, &vec![b"full precert".to_vec(), b"issuer".to_vec()]);
            }
            other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_version_and_types() {
        let mut bad_version = x509_leaf(0, b"x");
        bad_version[0] = 1;
        assert!(Leaf::from_raw(bad_version, Vec::new()).unwrap_err().contains("version"));

        let mut bad_type = x509_leaf(0, b"x");
        bad_type[1] = 9;
        assert!(Leaf::from_raw(bad_type, Vec::new()).unwrap_err().contains("leaf type"));

        let mut bad_entry = x509_leaf(0, b"x");
        bad_entry[11] = 7; // entry type low byte
        assert!(Leaf::from_raw(bad_entry, Vec::new()).unwrap_err().contains("entry type"));
    }

    #[test]
    fn rejects_truncation_and_garbage() {
        let leaf_bytes = x509_leaf(0, b"certificate");
        let mut truncated = leaf_bytes.clone();
        truncated.truncate(leaf_bytes.len() - 3);
        assert!(Leaf::from_raw(truncated, Vec::new()).is_err());

        let mut trailing = leaf_bytes.clone();
        trailing.push(0);
        assert!(Leaf::from_raw(trailing, Vec::new()).unwrap_err().contains("trailing"));

        // Declared chain length overrunning the buffer.
        let mut extra = Vec::new();
        push_opaque24(&mut extra, b"chain");
        extra[2] += 1;
        assert!(Leaf::from_raw(leaf_bytes, extra).is_err());
    }

    #[test]
    fn empty_extra_data_means_empty_chain() {
        let leaf = Leaf::from_raw(x509_leaf(0, b"x"), Vec::new()).unwrap();
        match leaf.payload {
            LeafPayload::X509 { chain, .. } => assert!(chain.is_empty()),
            other => panic!("wrong payload: {:?}", other),
        }
    }
}
