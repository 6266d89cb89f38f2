//! Merkle tree reconstruction and proof checking per RFC 6962 §2.1.
//!
//! Leaf hashes are `SHA-256(0x00 || leaf_input)`, interior hashes are
//! `SHA-256(0x01 || left || right)`, and a tree of n > 1 leaves splits at
//! the largest power of two smaller than n.

use crate::Error;
use crate::utils::sha256;

lazy_static! {
    /// Root of the empty tree: SHA-256 of the empty string.
    pub static ref EMPTY_TREE_ROOT: [u8; 32] = sha256(b"");
}

/// `SHA-256(0x00 || leaf_bytes)`.
pub fn leaf_hash(leaf_bytes: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(leaf_bytes.len() + 1);
    buf.push(0u8);
    buf.extend_from_slice(leaf_bytes);
    sha256(&buf)
}

/// `SHA-256(0x01 || left || right)`.
pub fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 65];
    buf[0] = 1;
    buf[1..33].copy_from_slice(left);
    buf[33..65].copy_from_slice(right);
    sha256(&buf)
}

/// Streaming root builder.
///
/// Accepts leaf hashes in strictly increasing index order and maintains a
/// stack of complete-subtree roots, largest at the bottom. After pushing
/// leaf k (1-based), the stack holds one subroot per set bit of k, so the
/// state is tiny and cheap to persist between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeBuilder {
    size: u64,
    stack: Vec<[u8; 32]>,
}

impl TreeBuilder {
    pub fn new() -> TreeBuilder {
        TreeBuilder {
            size: 0,
            stack: Vec::new(),
        }
    }

    /// Rebuild a builder from persisted state. The stack must hold exactly
    /// one subroot per set bit of `size`.
    pub fn resume(size: u64, stack: Vec<[u8; 32]>) -> Result<TreeBuilder, Error> {
        if stack.len() != size.count_ones() as usize {
            return Err(Error::InvalidArgument(format!(
                "tree builder state has {} subroots but size {} requires {}",
                stack.len(),
                size,
                size.count_ones()
            )));
        }
        Ok(TreeBuilder { size, stack })
    }

    /// Number of leaves ingested so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The complete-subtree roots, largest subtree first.
    pub fn stack(&self) -> &[[u8; 32]] {
        &self.stack
    }

    /// Ingest the next leaf hash. Equal-sized complete subtrees are merged
    /// eagerly, so the stack never grows past 64 entries.
    pub fn push(&mut self, hash: [u8; 32]) {
        self.stack.push(hash);
        self.size += 1;
        let mut m = self.size;
        while m & 1 == 0 {
            let right = self.stack.pop().unwrap();
            let left = self.stack.pop().unwrap();
            self.stack.push(node_hash(&left, &right));
            m >>= 1;
        }
    }

    /// Root over everything ingested so far: fold the stack right to left,
    /// hashing the smaller subtree on top into the accumulator.
    pub fn root(&self) -> [u8; 32] {
        let mut iter = self.stack.iter().rev();
        let mut acc = match iter.next() {
            Some(h) => *h,
            None => return *EMPTY_TREE_ROOT,
        };
        for h in iter {
            acc = node_hash(h, &acc);
        }
        acc
    }
}

/// Check a consistency proof between two tree heads per RFC 6962 §2.1.2,
/// recomputing both roots from the proof path.
///
/// `first_size == second_size` requires an empty proof and identical roots.
/// `first_size == 0` is vacuously consistent and consults no proof.
pub fn verify_consistency_proof(
    first_size: u64,
    second_size: u64,
    first_root: &[u8; 32],
    second_root: &[u8; 32],
    proof: &[[u8; 32]],
) -> Result<(), Error> {
    let fail = |desc: String| Error::InvalidConsistencyProof {
        prev_size: first_size,
        new_size: second_size,
        desc,
    };
    if first_size > second_size {
        return Err(fail("first tree is larger than the second".to_owned()));
    }
    if first_size == 0 {
        return Ok(());
    }
    if first_size == second_size {
        if !proof.is_empty() {
            return Err(fail("expected an empty proof for equal sizes".to_owned()));
        }
        if first_root != second_root {
            return Err(fail("equal sizes but differing roots".to_owned()));
        }
        return Ok(());
    }

    // Walk up from the rightmost leaf of the first tree, reconstructing the
    // old root and the new root simultaneously.
    let mut node = first_size - 1;
    let mut last_node = second_size - 1;
    while node & 1 == 1 {
        node >>= 1;
        last_node >>= 1;
    }
    let mut path = proof.iter();
    let (mut old_hash, mut new_hash) = if node > 0 {
        let h = *path.next().ok_or_else(|| fail("proof too short".to_owned()))?;
        (h, h)
    } else {
        (*first_root, *first_root)
    };
    while node > 0 {
        if node & 1 == 1 {
            let h = path.next().ok_or_else(|| fail("proof too short".to_owned()))?;
            old_hash = node_hash(h, &old_hash);
            new_hash = node_hash(h, &new_hash);
        } else if node < last_node {
            let h = path.next().ok_or_else(|| fail("proof too short".to_owned()))?;
            new_hash = node_hash(&new_hash, h);
        }
        node >>= 1;
        last_node >>= 1;
    }
    while last_node > 0 {
        let h = path.next().ok_or_else(|| fail("proof too short".to_owned()))?;
        new_hash = node_hash(&new_hash, h);
        last_node >>= 1;
    }
    if old_hash != *first_root {
        return Err(fail(format!(
            "recomputed first root {} does not match the trusted root",
            crate::utils::u8_to_hex(&old_hash)
        )));
    }
    if new_hash != *second_root {
        return Err(fail(format!(
            "recomputed second root {} does not match the signed root",
            crate::utils::u8_to_hex(&new_hash)
        )));
    }
    if path.next().is_some() {
        return Err(fail("proof has extra nodes".to_owned()));
    }
    Ok(())
}
