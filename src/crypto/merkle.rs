//! Merkle tree implementation for transaction commitment
//!
//! The tree is a complete binary tree of depth `ceil(log2(n))` addressed by
//! an implicit index: the root is 0 and the children of `i` are `2i + 1` and
//! `2i + 2`. Leaf `i` commits to transaction `i`; leaves past the end of the
//! list reuse the last transaction ID, so odd lists are padded by
//! duplication rather than with zeros.
//!
//! Node values are hex strings. A leaf holds `sha256(txn_id)` and an inner
//! node holds `sha256(left.value ‖ right.value)` over the hex text.

use super::hash::sha256_hex;

/// A node in the merkle tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleNode {
    pub value: String,
    pub left: Option<Box<MerkleNode>>,
    pub right: Option<Box<MerkleNode>>,
}

impl MerkleNode {
    /// Create a leaf node for a transaction ID
    pub fn leaf(txn_id: &str) -> Self {
        Self {
            value: sha256_hex(txn_id.as_bytes()),
            left: None,
            right: None,
        }
    }

    /// Create an internal node from two children
    pub fn internal(left: MerkleNode, right: MerkleNode) -> Self {
        let value = sha256_hex(format!("{}{}", left.value, right.value).as_bytes());
        Self {
            value,
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    /// Number of levels below this node
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut node = self;
        while let Some(left) = node.left.as_deref() {
            depth += 1;
            node = left;
        }
        depth
    }

    /// Build the inclusion proof for the leaf at `position`
    pub fn proof(&self, position: usize) -> Option<MerkleProof> {
        let depth = self.depth();
        if self.value.is_empty() || position >= 1usize << depth {
            return None;
        }

        let mut siblings = Vec::with_capacity(depth);
        let mut node = self;
        for level in (0..depth).rev() {
            let left = node.left.as_deref()?;
            let right = node.right.as_deref()?;
            if (position >> level) & 1 == 1 {
                siblings.push((left.value.clone(), true));
                node = right;
            } else {
                siblings.push((right.value.clone(), false));
                node = left;
            }
        }

        // Stored leaf-to-root
        siblings.reverse();
        Some(MerkleProof { siblings })
    }
}

/// Depth of the tree committing to `count` transactions
pub fn tree_depth(count: usize) -> usize {
    if count <= 1 {
        0
    } else {
        count.next_power_of_two().trailing_zeros() as usize
    }
}

/// Build the merkle tree over an ordered list of transaction IDs
///
/// An empty list yields a node with an empty value and no children.
pub fn build_merkle_tree<S: AsRef<str>>(txn_ids: &[S]) -> MerkleNode {
    if txn_ids.is_empty() {
        return MerkleNode::default();
    }
    build_subtree(txn_ids, 0, 0, tree_depth(txn_ids.len()))
}

fn build_subtree<S: AsRef<str>>(
    txn_ids: &[S],
    tree_idx: usize,
    level: usize,
    depth: usize,
) -> MerkleNode {
    if level < depth {
        let left = build_subtree(txn_ids, 2 * tree_idx + 1, level + 1, depth);
        let right = build_subtree(txn_ids, 2 * tree_idx + 2, level + 1, depth);
        return MerkleNode::internal(left, right);
    }

    // Leaves occupy implicit indices (2^depth - 1) ..= (2^(depth+1) - 2)
    let position = tree_idx + 1 - (1usize << depth);
    let last = txn_ids.len() - 1;
    MerkleNode::leaf(txn_ids[position.min(last)].as_ref())
}

/// Calculate the merkle root value for a list of transaction IDs
pub fn merkle_root<S: AsRef<str>>(txn_ids: &[S]) -> String {
    build_merkle_tree(txn_ids).value
}

/// Merkle proof for verifying transaction inclusion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Sibling values from leaf to root
    pub siblings: Vec<(String, bool)>, // (value, sibling_is_left)
}

impl MerkleProof {
    /// Verify the proof for a transaction ID against a root value
    pub fn verify(&self, txn_id: &str, root: &str) -> bool {
        let mut current = sha256_hex(txn_id.as_bytes());

        for (sibling, is_left) in &self.siblings {
            let combined = if *is_left {
                format!("{}{}", sibling, current)
            } else {
                format!("{}{}", current, sibling)
            };
            current = sha256_hex(combined.as_bytes());
        }

        current == root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("txn-{}", i)).collect()
    }

    fn pair(a: &str, b: &str) -> String {
        sha256_hex(format!("{}{}", a, b).as_bytes())
    }

    #[test]
    fn test_tree_depth() {
        assert_eq!(tree_depth(0), 0);
        assert_eq!(tree_depth(1), 0);
        assert_eq!(tree_depth(2), 1);
        assert_eq!(tree_depth(3), 2);
        assert_eq!(tree_depth(4), 2);
        assert_eq!(tree_depth(5), 3);
    }

    #[test]
    fn test_empty_tree() {
        let root = build_merkle_tree::<String>(&[]);
        assert!(root.value.is_empty());
        assert!(root.is_leaf());
    }

    #[test]
    fn test_single_transaction() {
        let root = build_merkle_tree(&["only"]);
        assert_eq!(root.value, sha256_hex(b"only"));
        assert!(root.is_leaf());
    }

    #[test]
    fn test_two_transactions() {
        let root = merkle_root(&["a", "b"]);
        assert_eq!(root, pair(&sha256_hex(b"a"), &sha256_hex(b"b")));
    }

    #[test]
    fn test_odd_list_pads_with_last_transaction() {
        let root = merkle_root(&["a", "b", "c"]);

        let (a, b, c) = (sha256_hex(b"a"), sha256_hex(b"b"), sha256_hex(b"c"));
        let expected = pair(&pair(&a, &b), &pair(&c, &c));
        assert_eq!(root, expected);

        // Not zero padding
        assert_ne!(root, pair(&pair(&a, &b), &pair(&c, "")));
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        for count in 1..=17 {
            let list = ids(count);
            let first = build_merkle_tree(&list);
            let second = build_merkle_tree(&list);
            assert_eq!(first, second);
            assert_eq!(first.depth(), tree_depth(count));
        }
    }

    #[test]
    fn test_order_matters() {
        assert_ne!(merkle_root(&["a", "b"]), merkle_root(&["b", "a"]));
    }

    #[test]
    fn test_proof_verifies_every_leaf() {
        let list = ids(6);
        let tree = build_merkle_tree(&list);

        for (position, txn_id) in list.iter().enumerate() {
            let proof = tree.proof(position).unwrap();
            assert_eq!(proof.siblings.len(), 3);
            assert!(proof.verify(txn_id, &tree.value));
            assert!(!proof.verify("forged", &tree.value));
        }

        assert!(tree.proof(8).is_none());
    }
}
