//! Property-based tests for allocator correctness
//!
//! Uses proptest to verify allocator invariants hold across many random scenarios

use fibstore::{Backing, BuddyAllocator, FileStore, FreeLists, Loc, ObjectId, StoreConfig};
use proptest::prelude::*;
use std::collections::HashMap;
use tempfile::TempDir;

const LIMIT: u64 = 1 << 32;

fn vec_allocator(class: usize) -> (BuddyAllocator, Vec<u8>) {
    let mut backing = Vec::new();
    let mut alloc = BuddyAllocator::new(FreeLists::new(), class, LIMIT).unwrap();
    alloc.reset(&mut backing, class).unwrap();
    (alloc, backing)
}

proptest! {
    #[test]
    fn prop_conservation(
        sizes in prop::collection::vec(1u64..4096, 1..60),
        free_mask in prop::collection::vec(any::<bool>(), 60)
    ) {
        let (mut alloc, mut backing) = vec_allocator(2);
        let mut live = Vec::new();

        for &size in &sizes {
            let loc = alloc.alloc(&mut backing, size).unwrap();
            prop_assert!(loc.block_bytes() >= size);
            live.push(loc);
        }

        let mut kept = Vec::new();
        for (loc, free) in live.into_iter().zip(free_mask.iter().copied()) {
            if free {
                alloc.free(&mut backing, loc).unwrap();
            } else {
                kept.push(loc);
            }
        }

        let live_bytes: u64 = kept.iter().map(|loc| loc.block_bytes()).sum();
        let free_bytes = alloc.count_free_bytes(&backing).unwrap();
        prop_assert_eq!(free_bytes + live_bytes, Backing::len(&backing));
        prop_assert_eq!(Backing::len(&backing), fibstore::size_of(alloc.size_class()));
    }

    #[test]
    fn prop_no_overlap(
        sizes in prop::collection::vec(1u64..2048, 1..80)
    ) {
        let (mut alloc, mut backing) = vec_allocator(8);
        let mut blocks: Vec<Loc> = sizes
            .iter()
            .map(|&size| alloc.alloc(&mut backing, size).unwrap())
            .collect();

        blocks.sort_by_key(|loc| loc.offset());
        for pair in blocks.windows(2) {
            prop_assert!(
                !pair[0].overlaps(pair[1]),
                "{} overlaps {}",
                pair[0],
                pair[1]
            );
        }
        for loc in &blocks {
            prop_assert!(loc.end() <= Backing::len(&backing));
        }
    }

    #[test]
    fn prop_alloc_free_cycle_restores_free_bytes(
        setup in prop::collection::vec(8u64..1024, 1..40),
        cycle in prop::collection::vec(8u64..1024, 1..40)
    ) {
        let (mut alloc, mut backing) = vec_allocator(8);
        for &size in &setup {
            alloc.alloc(&mut backing, size).unwrap();
        }

        let len_before = Backing::len(&backing);
        let free_before = alloc.count_free_bytes(&backing).unwrap();

        let blocks: Vec<Loc> = cycle
            .iter()
            .map(|&size| alloc.alloc(&mut backing, size).unwrap())
            .collect();
        for loc in blocks {
            alloc.free(&mut backing, loc).unwrap();
        }

        // Growth during the cycle only adds free bytes
        let grown = Backing::len(&backing) - len_before;
        prop_assert_eq!(alloc.count_free_bytes(&backing).unwrap(), free_before + grown);
    }

    #[test]
    fn prop_handles_stable_across_resize(
        ops in prop::collection::vec((8u64..512, 8u64..4096, any::<u8>()), 1..25)
    ) {
        let temp_dir = TempDir::new().unwrap();
        let mut store = FileStore::create(temp_dir.path().join("prop-"), StoreConfig::default()).unwrap();

        let mut objects: HashMap<ObjectId, u8> = HashMap::new();
        for &(initial, _, byte) in &ops {
            let id = store.new_object(initial).unwrap();
            store.object_mut(id).unwrap()[..8].fill(byte);
            objects.insert(id, byte);
        }

        for (&(_, target, _), (&id, _)) in ops.iter().zip(objects.clone().iter()) {
            store.resize_object(id, target).unwrap();
            prop_assert!(store.location(id).unwrap().block_bytes() >= target);
        }

        for (&id, &byte) in &objects {
            let block = store.object(id).unwrap();
            prop_assert!(block[..8].iter().all(|&b| b == byte), "object {} lost its contents", id);
        }
        prop_assert_eq!(store.object_count(), objects.len() as u64);
    }
}
