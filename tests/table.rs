use phalanx::tt::{TranspositionTable, GENERATION_DELTA};
use phalanx::types::{Bound, Move, DEPTH_ENTRY_OFFSET, VALUE_NONE};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

fn pool(threads: usize) -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .unwrap()
}

// With a 1 MiB table there are exactly 2^15 clusters, so the cluster index
// is the top 15 bits of the key and the stub is the bottom 16. Keys built
// from the same base land in the same cluster.
const SAME_CLUSTER_BASE: u64 = 0x4000_0000_0000_0000;

#[test]
fn fresh_hit() {
    let threads = pool(1);
    let tt = TranspositionTable::new(1, &threads);
    tt.clear(&threads);
    tt.new_search();
    assert_eq!(tt.generation(), 8);

    let key = 0xDEAD_BEEF_CAFE_BABE;
    let (hit, data, writer) = tt.probe(key);
    assert!(!hit);
    assert_eq!(data.mv, Move::NONE);
    assert_eq!(data.value, VALUE_NONE);
    assert_eq!(data.eval, VALUE_NONE);
    assert_eq!(data.depth, DEPTH_ENTRY_OFFSET);
    assert_eq!(data.bound, Bound::None);
    assert!(!data.is_pv);
    assert!(!data.cut);

    writer.write(
        key,
        100,
        false,
        Bound::Exact,
        DEPTH_ENTRY_OFFSET + 10,
        Move(0x1234),
        80,
        false,
        tt.generation(),
    );

    let (hit, data, _) = tt.probe(key);
    assert!(hit);
    assert_eq!(data.value, 100);
    assert_eq!(data.depth, DEPTH_ENTRY_OFFSET + 10);
    assert_eq!(data.mv, Move(0x1234));
    assert_eq!(data.bound, Bound::Exact);
    assert_eq!(data.eval, 80);
    assert!(!data.cut);
}

#[test]
fn stub_collision_reports_hit_with_foreign_data() {
    let threads = pool(1);
    let tt = TranspositionTable::new(1, &threads);
    tt.new_search();

    // Same cluster, same low 16 bits, different keys
    let k1 = SAME_CLUSTER_BASE | 0x1234;
    let k2 = SAME_CLUSTER_BASE | 0x0700_1234;
    assert_ne!(k1, k2);

    let (hit, _, writer) = tt.probe(k1);
    assert!(!hit);
    writer.write(
        k1,
        55,
        false,
        Bound::Lower,
        DEPTH_ENTRY_OFFSET + 20,
        Move(0x2222),
        0,
        false,
        tt.generation(),
    );

    // The probe cannot tell the two keys apart: the stub matches, so this
    // is a hit carrying k1's data. The caller's move-legality filter is
    // what rejects it.
    let (hit, data, _) = tt.probe(k2);
    assert!(hit);
    assert_eq!(data.value, 55);
    assert_eq!(data.mv, Move(0x2222));
}

#[test]
fn aged_entry_is_the_replacement_victim() {
    let threads = pool(1);
    let tt = TranspositionTable::new(1, &threads);
    tt.new_search();
    assert_eq!(tt.generation(), 8);

    let k1 = SAME_CLUSTER_BASE | 1;
    let k2 = SAME_CLUSTER_BASE | 2;
    let k3 = SAME_CLUSTER_BASE | 3;
    for (key, depth) in [(k1, 20), (k2, 30), (k3, 40)] {
        let (hit, _, writer) = tt.probe(key);
        assert!(!hit);
        writer.write(key, 0, false, Bound::Lower, depth, Move::NONE, 0, false, tt.generation());
    }

    for _ in 0..5 {
        tt.new_search();
    }
    assert_eq!(tt.generation(), 48);

    // All three entries aged equally, so the shallowest one scores lowest
    let k4 = SAME_CLUSTER_BASE | 4;
    let (hit, _, writer) = tt.probe(k4);
    assert!(!hit);
    writer.write(k4, 0, false, Bound::Lower, 25, Move::NONE, 0, false, tt.generation());

    let (hit, _, _) = tt.probe(k1);
    assert!(!hit, "shallowest entry should have been evicted");
    let (hit, _, _) = tt.probe(k2);
    assert!(hit);
    let (hit, _, _) = tt.probe(k3);
    assert!(hit);
    let (hit, _, _) = tt.probe(k4);
    assert!(hit);
}

#[test]
fn exact_bound_overwrites_deeper_entry() {
    let threads = pool(1);
    let tt = TranspositionTable::new(1, &threads);
    tt.new_search();

    let key = 0x1122_3344_5566_7788;
    let (_, _, writer) = tt.probe(key);
    writer.write(
        key,
        10,
        false,
        Bound::Upper,
        DEPTH_ENTRY_OFFSET + 100,
        Move::NONE,
        0,
        false,
        tt.generation(),
    );

    let (hit, _, writer) = tt.probe(key);
    assert!(hit);
    writer.write(
        key,
        20,
        false,
        Bound::Exact,
        DEPTH_ENTRY_OFFSET + 10,
        Move::NONE,
        0,
        false,
        tt.generation(),
    );

    let (hit, data, _) = tt.probe(key);
    assert!(hit);
    assert_eq!(data.depth, DEPTH_ENTRY_OFFSET + 10);
    assert_eq!(data.bound, Bound::Exact);
    assert_eq!(data.value, 20);
}

#[test]
fn null_move_save_keeps_stored_move() {
    let threads = pool(1);
    let tt = TranspositionTable::new(1, &threads);
    tt.new_search();

    let key = 0x0F0F_0F0F_0F0F_0F0F;
    let (_, _, writer) = tt.probe(key);
    writer.write(key, 1, false, Bound::Lower, 10, Move(0xABCD), 2, false, tt.generation());

    let (hit, _, writer) = tt.probe(key);
    assert!(hit);
    writer.write(key, 3, false, Bound::Lower, 12, Move::NONE, 4, false, tt.generation());

    let (hit, data, _) = tt.probe(key);
    assert!(hit);
    assert_eq!(data.mv, Move(0xABCD));
    assert_eq!(data.value, 3);
    assert_eq!(data.eval, 4);
    assert_eq!(data.depth, 12);
}

#[test]
fn from_params_uses_configured_size() {
    let threads = pool(1);
    phalanx::params::PARAMS.write().hash_mb = 2;
    let tt = TranspositionTable::from_params(&threads);
    assert_eq!(tt.cluster_count(), (2 << 20) / 32);
    assert_eq!(tt.generation(), 0);
}

#[test]
fn resize_sets_cluster_count() {
    let threads = pool(2);
    let mut tt = TranspositionTable::new(1, &threads);
    assert_eq!(tt.cluster_count(), (1 << 20) / 32);

    tt.resize(2, &threads);
    assert_eq!(tt.cluster_count(), (2 << 20) / 32);

    tt.resize(1, &threads);
    assert_eq!(tt.cluster_count(), 32768);
    let _ = tt.uses_large_pages();
}

#[test]
fn generation_steps_by_delta_and_wraps() {
    let threads = pool(1);
    let tt = TranspositionTable::new(1, &threads);

    for k in 1..=32u32 {
        tt.new_search();
        let gen = tt.generation();
        assert_eq!(gen & 0x7, 0, "low flag bits must stay clear");
        assert_eq!(gen as u32, (8 * k) % 256);
    }
    assert_eq!(tt.generation(), 0);
    assert_eq!(GENERATION_DELTA, 8);
}

#[test]
fn hashfull_tracks_generation_age() {
    let threads = pool(1);
    let tt = TranspositionTable::new(1, &threads);
    tt.new_search();

    let mut rng = StdRng::seed_from_u64(0xFEED);
    for _ in 0..5000 {
        let key = rng.next_u64();
        let (_, _, writer) = tt.probe(key);
        writer.write(key, 0, false, Bound::Lower, 12, Move::NONE, 0, false, tt.generation());
    }

    let current = tt.hashfull(0);
    assert!(current > 0);
    assert_eq!(tt.hashfull(255), current);

    // One search later the same entries are one generation old
    tt.new_search();
    assert_eq!(tt.hashfull(0), 0);
    assert_eq!(tt.hashfull(1), current);
}

#[test]
fn clear_empties_the_table() {
    let threads = pool(4);
    let tt = TranspositionTable::new(64, &threads);
    tt.new_search();

    let mut rng = StdRng::seed_from_u64(0xC1EA);
    let keys: Vec<u64> = (0..1000).map(|_| rng.next_u64()).collect();
    for &key in &keys {
        let (_, _, writer) = tt.probe(key);
        writer.write(key, 7, true, Bound::Exact, 9, Move(0x0101), -7, true, tt.generation());
        // An exact bound always commits, so the stub must be present now
        let (hit, _, _) = tt.probe(key);
        assert!(hit);
    }

    tt.clear(&threads);

    assert_eq!(tt.generation(), 0);
    assert_eq!(tt.hashfull(255), 0);
    for &key in &keys {
        let (hit, _, _) = tt.probe(key);
        assert!(!hit);
    }
}
