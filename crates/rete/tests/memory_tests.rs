//! Property tests for beta-memory bucket chains

use proptest::prelude::*;
use rete::{Bind, BetaMemory, EntityId, Owner, PartialMatch, PartialMatchId};
use rule_model::arena::{Arena, Id};
use smallvec::SmallVec;

fn pm(pms: &mut Arena<PartialMatch>, entity: u64, hash: u64) -> PartialMatchId {
    let mut pm = PartialMatch::new(
        Owner::Join(Id::from_raw_parts(0, 0)),
        SmallVec::from_iter([Bind::entity(EntityId(entity))]),
    );
    pm.hash_value = hash;
    pms.insert(pm)
}

proptest! {
    #[test]
    fn insertion_order_preserved_within_buckets(hashes in prop::collection::vec(any::<u64>(), 1..64)) {
        let mut pms = Arena::new();
        let mut mem = BetaMemory::new(true);
        let ids: Vec<_> = hashes
            .iter()
            .enumerate()
            .map(|(index, &hash)| {
                let id = pm(&mut pms, index as u64, hash);
                mem.insert(&mut pms, id);
                id
            })
            .collect();

        prop_assert_eq!(mem.count(), ids.len());

        // Walking each bucket yields entities in insertion order.
        for &id in &ids {
            let hash = pms[id].hash_value;
            let mut cursor = mem.bucket_head(hash);
            let mut last_entity = None;
            let mut found = false;
            while let Some(entry) = cursor {
                let entity = pms[entry].binds[0].entity.unwrap().0;
                if let Some(last) = last_entity {
                    prop_assert!(entity > last);
                }
                last_entity = Some(entity);
                if entry == id {
                    found = true;
                }
                cursor = pms[entry].next_in_memory;
            }
            prop_assert!(found);
        }
    }

    #[test]
    fn single_bucket_behaves_like_collided_table(count in 1usize..32) {
        // Law: a size-1 memory must function identically to a larger table
        // whose keys all collide.
        let mut pms_a = Arena::new();
        let mut unhashed = BetaMemory::new(false);
        let mut pms_b = Arena::new();
        let mut collided = BetaMemory::new(true);

        for index in 0..count {
            let a = pm(&mut pms_a, index as u64, 0);
            unhashed.insert(&mut pms_a, a);
            // Same hash for everyone: all land in one bucket.
            let b = pm(&mut pms_b, index as u64, 42);
            collided.insert(&mut pms_b, b);
        }

        let order_a: Vec<u64> = unhashed
            .all(&pms_a)
            .into_iter()
            .map(|id| pms_a[id].binds[0].entity.unwrap().0)
            .collect();
        let order_b: Vec<u64> = collided
            .all(&pms_b)
            .into_iter()
            .map(|id| pms_b[id].binds[0].entity.unwrap().0)
            .collect();
        prop_assert_eq!(order_a, order_b);
    }

    #[test]
    fn remove_keeps_chains_consistent(count in 2usize..32, victim in 0usize..31) {
        let victim = victim % count;
        let mut pms = Arena::new();
        let mut mem = BetaMemory::new(true);
        let ids: Vec<_> = (0..count)
            .map(|index| {
                let id = pm(&mut pms, index as u64, 7);
                mem.insert(&mut pms, id);
                id
            })
            .collect();

        mem.remove(&mut pms, ids[victim]);
        prop_assert_eq!(mem.count(), count - 1);

        let survivors: Vec<_> = mem.all(&pms);
        prop_assert!(!survivors.contains(&ids[victim]));
        prop_assert_eq!(survivors.len(), count - 1);
    }
}
