// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Append-only SHA-256 Merkle accumulator with inclusion proofs.
//!
//! Leaves are hashed pairwise; an odd node at the end of a level is paired
//! with itself. The root over an empty tree is all zeroes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

pub fn leaf_hash(payload: &[u8]) -> Hash {
    Sha256::digest(payload).into()
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// One step of an inclusion proof: the sibling hash and whether it sits to
/// the left of the running hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Hash,
    pub sibling_is_left: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub steps: Vec<ProofStep>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleTree {
    leaves: Vec<Hash>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Append a leaf, returning its index.
    pub fn push(&mut self, leaf: Hash) -> usize {
        self.leaves.push(leaf);
        self.leaves.len() - 1
    }

    pub fn leaf(&self, index: usize) -> Option<&Hash> {
        self.leaves.get(index)
    }

    pub fn root(&self) -> Hash {
        if self.leaves.is_empty() {
            return [0u8; 32];
        }
        let mut level = self.leaves.clone();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => node_hash(left, right),
                    [odd] => node_hash(odd, odd),
                    _ => unreachable!(),
                })
                .collect();
        }
        level[0]
    }

    pub fn proof(&self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.leaves.len() {
            return None;
        }
        let mut steps = Vec::new();
        let mut level = self.leaves.clone();
        let mut index = leaf_index;
        while level.len() > 1 {
            let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
            let sibling = if sibling_index < level.len() {
                level[sibling_index]
            } else {
                // Odd node pairs with itself.
                level[index]
            };
            steps.push(ProofStep {
                sibling,
                sibling_is_left: index % 2 == 1,
            });
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => node_hash(left, right),
                    [odd] => node_hash(odd, odd),
                    _ => unreachable!(),
                })
                .collect();
            index /= 2;
        }
        Some(MerkleProof { leaf_index, steps })
    }
}

/// Walk a proof from a leaf up and compare against the expected root.
pub fn verify_proof(leaf: &Hash, proof: &MerkleProof, root: &Hash) -> bool {
    let mut current = *leaf;
    for step in &proof.steps {
        current = if step.sibling_is_left {
            node_hash(&step.sibling, &current)
        } else {
            node_hash(&current, &step.sibling)
        };
    }
    current == *root
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaves(n: usize) -> Vec<Hash> {
        (0..n).map(|i| leaf_hash(format!("leaf-{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_empty_root_is_zero() {
        assert_eq!(MerkleTree::new().root(), [0u8; 32]);
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let mut tree = MerkleTree::new();
        let leaf = leaf_hash(b"only");
        tree.push(leaf);
        assert_eq!(tree.root(), leaf);
    }

    #[test]
    fn test_proofs_verify_for_all_sizes() {
        for n in 1..=9 {
            let mut tree = MerkleTree::new();
            for leaf in leaves(n) {
                tree.push(leaf);
            }
            let root = tree.root();
            for i in 0..n {
                let proof = tree.proof(i).unwrap();
                assert!(
                    verify_proof(tree.leaf(i).unwrap(), &proof, &root),
                    "size {} leaf {}",
                    n,
                    i
                );
            }
        }
    }

    #[test]
    fn test_proof_fails_against_wrong_root() {
        let mut tree = MerkleTree::new();
        for leaf in leaves(4) {
            tree.push(leaf);
        }
        let proof = tree.proof(2).unwrap();
        let mut wrong_root = tree.root();
        wrong_root[0] ^= 1;
        assert!(!verify_proof(tree.leaf(2).unwrap(), &proof, &wrong_root));
    }

    #[test]
    fn test_old_proof_invalidated_by_append() {
        let mut tree = MerkleTree::new();
        for leaf in leaves(3) {
            tree.push(leaf);
        }
        let old_root = tree.root();
        let proof = tree.proof(1).unwrap();
        assert!(verify_proof(tree.leaf(1).unwrap(), &proof, &old_root));

        tree.push(leaf_hash(b"leaf-3"));
        // The old proof still verifies against the old root, not the new one.
        assert!(verify_proof(tree.leaf(1).unwrap(), &proof, &old_root));
        assert_ne!(tree.root(), old_root);
    }

    #[test]
    fn test_out_of_range_proof_is_none() {
        let tree = MerkleTree::new();
        assert!(tree.proof(0).is_none());
    }
}
