//! Merkle tree over the recognized verification keys.
//!
//! Aggregation circuits only accept child proofs whose verification key is a member of this
//! set; membership is shown with a sibling path against the tree root.

use crate::error::ProvingError;
use crate::proof::VerificationKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub type Hash = [u8; 32];

const EMPTY_LEAF: Hash = [0; 32];

fn hash_vk(vk: &VerificationKey) -> Hash {
    Sha256::digest(vk.as_bytes()).into()
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VkMembershipWitness {
    pub leaf_index: u64,
    /// Siblings from the leaf level up to (excluding) the root.
    pub sibling_path: Vec<Hash>,
}

impl VkMembershipWitness {
    pub fn verify(&self, root: &Hash, vk: &VerificationKey) -> bool {
        let mut index = self.leaf_index;
        let mut acc = hash_vk(vk);
        for sibling in &self.sibling_path {
            acc = if index % 2 == 0 {
                hash_pair(&acc, sibling)
            } else {
                hash_pair(sibling, &acc)
            };
            index /= 2;
        }
        index == 0 && acc == *root
    }
}

/// Static set of verification keys; built once and shared read-only.
#[derive(Debug, Clone)]
pub struct VkTree {
    // layers[0] are the (padded) leaves, the last layer holds only the root.
    layers: Vec<Vec<Hash>>,
    positions: HashMap<Hash, usize>,
}

impl VkTree {
    pub fn new(vks: impl IntoIterator<Item = VerificationKey>) -> Self {
        let mut leaves: Vec<Hash> = Vec::new();
        let mut positions = HashMap::new();
        for vk in vks {
            let leaf = hash_vk(&vk);
            positions.entry(leaf).or_insert_with(|| {
                leaves.push(leaf);
                leaves.len() - 1
            });
        }
        let width = leaves.len().max(2).next_power_of_two();
        leaves.resize(width, EMPTY_LEAF);

        let mut layers = vec![leaves];
        while layers.last().is_some_and(|layer| layer.len() > 1) {
            let next = layers[layers.len() - 1]
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            layers.push(next);
        }
        Self { layers, positions }
    }

    pub fn root(&self) -> Hash {
        self.layers
            .last()
            .and_then(|layer| layer.first())
            .copied()
            .unwrap_or(EMPTY_LEAF)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, vk: &VerificationKey) -> bool {
        self.positions.contains_key(&hash_vk(vk))
    }

    /// Witness that `vk` is part of the recognized set. Unknown keys are a fatal error: no retry
    /// can make a proof with a foreign key acceptable.
    pub fn membership_witness(
        &self,
        vk: &VerificationKey,
    ) -> Result<VkMembershipWitness, ProvingError> {
        let leaf_index = *self.positions.get(&hash_vk(vk)).ok_or_else(|| {
            ProvingError::fatal(format!("verification key {vk:?} is not in the VK tree"))
        })?;
        let mut index = leaf_index;
        let sibling_path = self.layers[..self.layers.len() - 1]
            .iter()
            .map(|layer| {
                let sibling = layer[index ^ 1];
                index /= 2;
                sibling
            })
            .collect();
        Ok(VkMembershipWitness {
            leaf_index: leaf_index as u64,
            sibling_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn vk(tag: u8) -> VerificationKey {
        VerificationKey(vec![tag; 4])
    }

    #[test]
    fn witnesses_verify_against_root() {
        let tree = VkTree::new((0..5).map(vk));
        assert_eq!(tree.len(), 5);
        let root = tree.root();
        for tag in 0..5 {
            let witness = tree.membership_witness(&vk(tag)).unwrap();
            assert_eq!(witness.sibling_path.len(), 3);
            assert!(witness.verify(&root, &vk(tag)));
            assert!(!witness.verify(&root, &vk(tag + 100)));
        }
    }

    #[test]
    fn tampered_witness_is_rejected() {
        let tree = VkTree::new([vk(1), vk(2)]);
        let mut witness = tree.membership_witness(&vk(2)).unwrap();
        witness.leaf_index = 0;
        assert!(!witness.verify(&tree.root(), &vk(2)));
    }

    #[test]
    fn unknown_key_is_fatal() {
        let tree = VkTree::new([vk(1)]);
        assert!(tree.contains(&vk(1)));
        assert_matches!(
            tree.membership_witness(&vk(9)),
            Err(ProvingError::Fatal(_))
        );
    }

    #[test]
    fn duplicate_keys_share_a_leaf() {
        let tree = VkTree::new([vk(1), vk(1), vk(2)]);
        assert_eq!(tree.len(), 2);
        let witness = tree.membership_witness(&vk(2)).unwrap();
        assert_eq!(witness.leaf_index, 1);
    }
}
