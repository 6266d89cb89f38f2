//! Small hashing and hex helpers used across the crate.

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    openssl::sha::sha256(data)
}

/// SHA-1 of `data`. Only used for BitTorrent info hashes and piece hashes.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    openssl::sha::sha1(data)
}

pub fn u8_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Inverse of [`u8_to_hex`]. Panics on invalid input; intended for static
/// strings and tests. Use [`hex_to_hash`] for untrusted input.
pub fn hex_to_u8(hex: &str) -> Vec<u8> {
    assert!(hex.len() % 2 == 0, "hex string length must be even");
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("invalid hex"))
        .collect()
}

/// Parse a 64-character hex string into a 32-byte hash.
pub fn hex_to_hash(hex: &str) -> Result<[u8; 32], String> {
    if hex.len() != 64 {
        return Err(format!("expected 64 hex characters, got {}", hex.len()));
    }
    let mut out = [0u8; 32];
    for (i, chunk) in out.iter_mut().enumerate() {
        *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|e| format!("invalid hex at offset {}: {}", i * 2, e))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let bytes = [0x00u8, 0x01, 0xab, 0xff];
        let hex = u8_to_hex(&bytes);
        assert_eq!(hex, "0001abff");
        assert_eq!(hex_to_u8(&hex), bytes.to_vec());
    }

    #[test]
    fn hash_parsing() {
        let h = sha256(b"abc");
        assert_eq!(hex_to_hash(&u8_to_hex(&h)).unwrap(), h);
        assert!(hex_to_hash("abcd").is_err());
        assert!(hex_to_hash(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            u8_to_hex(&sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
