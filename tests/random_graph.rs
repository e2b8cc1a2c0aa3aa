mod common;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use veldt::util::test_util::with_serial_lock;
use veldt::{GcCause, ObjectKind};

const NODES: usize = 400;
const EXTRA_SLOTS: usize = 3;
const ROUNDS: usize = 4;
const REWIRES_PER_ROUND: usize = 200;

/// A randomized (but seeded, reproducible) object graph: a rooted chain of
/// nodes with random cross-edges, rewired through the write barriers between
/// collections, plus fresh garbage every round. After every cycle the whole
/// graph must match the mirror model.
#[test]
fn random_graph_survives_repeated_cycles() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);

        // Node layout: slot 0 chains to the next node; slots 1..=3 are
        // random cross-edges. The payload tag is the node id.
        let mut mirror: Vec<[Option<usize>; EXTRA_SLOTS]> = vec![[None; EXTRA_SLOTS]; NODES];
        let mut nodes = Vec::with_capacity(NODES);
        for id in 0..NODES {
            let obj = mutator
                .alloc(1 + EXTRA_SLOTS, 2, ObjectKind::Regular)
                .unwrap();
            unsafe { mutator.payload_addr(obj).store::<usize>(id) };
            nodes.push(obj);
        }
        for id in 1..NODES {
            mutator.store_ref(nodes[id - 1], 0, Some(nodes[id]));
        }
        let root = mutator.add_root(nodes[0]);

        for round in 0..ROUNDS {
            // Rewire random cross-edges through the barriers.
            for _ in 0..REWIRES_PER_ROUND {
                let a = rng.random_range(0..NODES);
                let slot = 1 + rng.random_range(0..EXTRA_SLOTS);
                let b = rng.random_range(0..NODES);
                mutator.store_ref(nodes[a], slot, Some(nodes[b]));
                mirror[a][slot - 1] = Some(b);
            }
            // Garbage clusters that must vanish.
            for _ in 0..300 {
                let _ = mutator.alloc(2, 32, ObjectKind::Regular).unwrap();
            }

            mutator.request_gc(GcCause::SystemGc);

            // Re-walk the chain; every node may have moved.
            let mut cursor = Some(mutator.get_root(root));
            let mut walked = 0;
            let mut by_id = vec![None; NODES];
            while let Some(obj) = cursor {
                let id = unsafe { mutator.payload_addr(obj).load::<usize>() };
                by_id[id] = Some(obj);
                walked += 1;
                cursor = mutator.load_ref(obj, 0);
            }
            assert_eq!(walked, NODES, "chain broken in round {}", round);
            nodes = by_id.into_iter().map(Option::unwrap).collect();

            // Cross-edges match the mirror.
            for id in 0..NODES {
                for (slot, expected) in mirror[id].iter().enumerate() {
                    let actual = mutator
                        .load_ref(nodes[id], slot + 1)
                        .map(|o| unsafe { mutator.payload_addr(o).load::<usize>() });
                    assert_eq!(actual, *expected, "edge {}:{} in round {}", id, slot, round);
                }
            }
        }

        drop(mutator);
        heap.shutdown();
    });
}
