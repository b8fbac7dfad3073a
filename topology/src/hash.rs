use storage::NodeId;

/// Position on the ring. The hash space is the full `u64` range.
pub type Token = u64;

/// Maps a key onto the ring. Stable across processes and restarts.
pub fn hash_key(key: &[u8]) -> Token {
    let digest = blake3::hash(key);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(head)
}

/// Deterministic vnode tokens for a node: the same id and count always
/// yield the same positions, so a restarted node reclaims its ranges.
pub fn vnode_tokens(node_id: &NodeId, count: u16) -> Vec<Token> {
    (0..count)
        .map(|index| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(node_id.as_str().as_bytes());
            hasher.update(b"/vnode/");
            hasher.update(&u32::from(index).to_be_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
            u64::from_be_bytes(head)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_is_deterministic() {
        assert_eq!(hash_key(b"users/souls"), hash_key(b"users/souls"));
        assert_ne!(hash_key(b"a"), hash_key(b"b"));
        assert_ne!(hash_key(b"abc"), hash_key(b"abcd"));
    }

    #[test]
    fn vnode_tokens_are_stable_and_distinct() {
        let id = NodeId::from("node-a");
        let first = vnode_tokens(&id, 16);
        assert_eq!(first, vnode_tokens(&id, 16));
        assert_eq!(first.len(), 16);

        let mut unique = first.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 16);

        assert_ne!(first, vnode_tokens(&NodeId::from("node-b"), 16));
    }

    #[test]
    fn growing_vnode_count_keeps_existing_tokens() {
        let id = NodeId::from("node-a");
        let small = vnode_tokens(&id, 4);
        let large = vnode_tokens(&id, 8);
        assert_eq!(&large[..4], small.as_slice());
    }
}
