//! Content hashing for no-op detection.
//!
//! A node's hash covers what the plugin would receive: the backend, the
//! module image and the inputs. Status, action and color are excluded so
//! an unchanged module hashes the same across incarnations.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::graph::InfraGraphNode;
use crate::plugin::PluginKind;

/// Hasher for infrastructure graph nodes.
#[derive(Debug, Default)]
pub struct NodeHasher;

impl NodeHasher {
    /// Creates a new node hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hashes a node as it currently stands.
    #[must_use]
    pub fn hash_node(&self, node: &InfraGraphNode) -> String {
        self.hash_parts(node.plugin, &node.image, &node.inputs)
    }

    /// Hashes a module invocation.
    ///
    /// Object keys serialize in sorted order, so the hash does not depend on
    /// declaration order.
    #[must_use]
    pub fn hash_parts(&self, plugin: PluginKind, image: &str, inputs: &Value) -> String {
        let canonical = json!({
            "plugin": plugin,
            "image": image,
            "inputs": inputs,
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// First 8 characters of a hash, for display.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
