use proptest::prelude::*;
use std::collections::HashSet;

use paravon::storage::{resolve, NodeId, StorageEngine, UpdateStamp, VersionedValue};

fn version(counter: u64, origin: usize, payload: Option<u8>) -> VersionedValue {
    let stamp = UpdateStamp::new(counter, NodeId::new(format!("node-{}", origin)));
    match payload {
        Some(byte) => VersionedValue::data(vec![byte], stamp),
        None => VersionedValue::tombstone(stamp),
    }
}

/// Versions with distinct stamps, so the winner is fully determined and can
/// be compared payload and all.
fn versions() -> impl Strategy<Value = Vec<VersionedValue>> {
    prop::collection::vec(
        (0u64..8, 0usize..3, prop::option::of(any::<u8>())).prop_map(|(c, o, p)| version(c, o, p)),
        1..12,
    )
    .prop_map(|mut values| {
        let mut seen = HashSet::new();
        values.retain(|v| seen.insert(v.stamp.clone()));
        values
    })
}

fn replay(values: &[VersionedValue]) -> Option<VersionedValue> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime.block_on(async {
        let engine = StorageEngine::in_memory();
        for value in values {
            engine.apply(b"k", value.clone()).await.unwrap();
        }
        engine.get(b"k").await.unwrap()
    })
}

proptest! {
    #[test]
    fn delivery_order_does_not_change_the_winner(
        (original, shuffled) in versions().prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
    ) {
        let expected = original.iter().max_by(|a, b| a.stamp.cmp(&b.stamp)).cloned();
        let in_order = replay(&original);
        let reordered = replay(&shuffled);

        prop_assert_eq!(&in_order, &expected);
        prop_assert_eq!(&in_order, &reordered);
    }

    #[test]
    fn duplicate_delivery_is_idempotent(values in versions()) {
        let mut twice = values.clone();
        twice.extend(values.iter().cloned());
        prop_assert_eq!(replay(&values), replay(&twice));
    }

    #[test]
    fn resolve_agrees_with_storage(values in versions()) {
        let resolved = resolve(values.iter()).cloned();
        prop_assert_eq!(resolved, replay(&values));
    }
}
