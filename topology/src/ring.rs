use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::hash::{hash_key, Token};
use storage::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VNode {
    pub token: Token,
    pub node: NodeId,
}

/// Sorted, duplicate-free sequence of vnodes.
///
/// Positions are strictly increasing. When two nodes claim the same token,
/// the vnode of the smaller node id keeps it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ring {
    vnodes: Vec<VNode>,
}

impl Ring {
    pub fn build<I>(assignments: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, Vec<Token>)>,
    {
        let mut vnodes: Vec<VNode> = assignments
            .into_iter()
            .flat_map(|(node, tokens)| {
                tokens.into_iter().map(move |token| VNode {
                    token,
                    node: node.clone(),
                })
            })
            .collect();

        vnodes.sort_by(|a, b| a.token.cmp(&b.token).then_with(|| a.node.cmp(&b.node)));

        let before = vnodes.len();
        vnodes.dedup_by(|later, kept| {
            if later.token == kept.token {
                if later.node != kept.node {
                    tracing::warn!(
                        token = later.token,
                        kept = %kept.node,
                        dropped = %later.node,
                        "Duplicate ring position"
                    );
                }
                true
            } else {
                false
            }
        });
        if vnodes.len() != before {
            tracing::debug!(dropped = before - vnodes.len(), "Dropped colliding vnodes");
        }

        Self { vnodes }
    }

    pub fn len(&self) -> usize {
        self.vnodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vnodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VNode> {
        self.vnodes.iter()
    }

    /// Index of the first vnode at or after `token`, wrapping to zero.
    fn successor_index(&self, token: Token) -> Option<usize> {
        if self.vnodes.is_empty() {
            return None;
        }
        let idx = self.vnodes.partition_point(|v| v.token < token);
        Some(if idx == self.vnodes.len() { 0 } else { idx })
    }

    pub fn successor(&self, token: Token) -> Option<&VNode> {
        self.successor_index(token).map(|idx| &self.vnodes[idx])
    }

    /// Up to `n` distinct nodes walking clockwise from the successor of
    /// `token`. Returns fewer when the ring holds fewer distinct nodes.
    pub fn preference_list(&self, token: Token, n: usize) -> Vec<NodeId> {
        let Some(start) = self.successor_index(token) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut owners = Vec::with_capacity(n);
        for offset in 0..self.vnodes.len() {
            if owners.len() == n {
                break;
            }
            let vnode = &self.vnodes[(start + offset) % self.vnodes.len()];
            if seen.insert(&vnode.node) {
                owners.push(vnode.node.clone());
            }
        }
        owners
    }

    pub fn replicas_for(&self, key: &[u8], n: usize) -> Vec<NodeId> {
        self.preference_list(hash_key(key), n)
    }

    /// Share of the hash space each node owns as primary.
    ///
    /// A vnode owns the half-open arc `(previous token, token]`.
    pub fn ownership(&self) -> BTreeMap<NodeId, f64> {
        let mut spans: BTreeMap<NodeId, u128> = BTreeMap::new();
        let space = 1u128 << 64;
        for (idx, vnode) in self.vnodes.iter().enumerate() {
            let span = if self.vnodes.len() == 1 {
                space
            } else {
                let prev = if idx == 0 {
                    self.vnodes[self.vnodes.len() - 1].token
                } else {
                    self.vnodes[idx - 1].token
                };
                u128::from(vnode.token.wrapping_sub(prev))
            };
            *spans.entry(vnode.node.clone()).or_default() += span;
        }
        spans
            .into_iter()
            .map(|(node, span)| (node, span as f64 / space as f64))
            .collect()
    }
}
