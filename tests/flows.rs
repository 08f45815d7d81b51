// Connection-tracking scenarios: the filter standing in for a connection
// table, keyed by packed 4-tuples as the forwarding path would hash them.

use conntrack_cuckoo::CuckooFilter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

/// A connection 4-tuple packed big-endian, as the data plane hashes it
fn flow_key(src: u32, dst: u32, sport: u16, dport: u16) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[0..4].copy_from_slice(&src.to_be_bytes());
    key[4..8].copy_from_slice(&dst.to_be_bytes());
    key[8..10].copy_from_slice(&sport.to_be_bytes());
    key[10..12].copy_from_slice(&dport.to_be_bytes());
    key
}

fn random_flows(rng: &mut StdRng, n: usize, avoid: &HashSet<[u8; 12]>) -> HashSet<[u8; 12]> {
    let mut flows = HashSet::with_capacity(n);
    while flows.len() < n {
        // 10.0.0.0/16 endpoints with ephemeral ports
        let src = (10u32 << 24) | rng.random_range(0..=0xFFFF);
        let dst = (10u32 << 24) | rng.random_range(0..=0xFFFF);
        let key = flow_key(
            src,
            dst,
            rng.random_range(1024..=65535),
            rng.random_range(1024..=65535),
        );
        if !avoid.contains(&key) {
            flows.insert(key);
        }
    }
    flows
}

#[test]
fn test_benign_flows_tracked_hostile_flows_rejected() {
    let mut filter = CuckooFilter::builder()
        .capacity(1365 * 4)
        .fingerprint_size(12)
        .bucket_size(4)
        .max_kicks(500)
        .seed(2024)
        .build()
        .unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let benign = random_flows(&mut rng, 5000, &HashSet::new());
    for flow in &benign {
        assert!(filter.insert(&flow[..]).is_ok());
    }

    // Every established flow is recognized
    for flow in &benign {
        assert!(filter.contains(&flow[..]));
    }

    // Unknown flows pass only at the fingerprint-collision rate,
    // on the order of 2b / 2^f
    let hostile = random_flows(&mut rng, 10000, &benign);
    let false_positives = hostile
        .iter()
        .filter(|flow| filter.contains(&flow[..]))
        .count();
    assert!(
        false_positives < 100,
        "{false_positives} hostile flows passed the filter"
    );
}

#[test]
fn test_flows_forgotten_when_closed() {
    let mut filter = CuckooFilter::builder()
        .capacity(4096)
        .fingerprint_size(16)
        .seed(7)
        .build()
        .unwrap();

    let mut rng = StdRng::seed_from_u64(99);
    let flows = random_flows(&mut rng, 2000, &HashSet::new());
    for flow in &flows {
        assert!(filter.insert(&flow[..]).is_ok());
    }

    // Connections close and are deleted one by one
    for flow in &flows {
        assert!(filter.delete(&flow[..]));
    }
    assert!(filter.is_empty());
    for flow in &flows {
        assert!(!filter.contains(&flow[..]));
    }
}

// The 16-slot table scenario: 4 buckets of 4 slots, 8-bit fingerprints
#[test]
fn test_tiny_table_fills_and_drains() {
    let mut filter = CuckooFilter::builder()
        .capacity(16)
        .fingerprint_size(8)
        .bucket_size(4)
        .max_kicks(500)
        .seed(5)
        .build()
        .unwrap();
    assert_eq!(filter.capacity(), 16);

    let items: Vec<String> = (0..16).map(|i| format!("flow-{i}")).collect();
    let inserted: Vec<&String> = items
        .iter()
        .filter(|item| filter.insert(item).is_ok())
        .collect();

    // Best case fills the table; fingerprint collisions may cost a few slots
    assert!(inserted.len() >= 10);
    assert_eq!(filter.len(), inserted.len());
    for item in &inserted {
        assert!(filter.contains(item));
    }

    for item in &inserted {
        assert!(filter.delete(item));
    }
    assert!(filter.is_empty());
    for item in &inserted {
        assert!(!filter.contains(item));
    }
}

// Degenerate 1-bit fingerprints collide constantly; wide fingerprints do not.
// The gap demonstrates the 2b / 2^f false-positive relationship.
#[test]
fn test_fingerprint_width_governs_false_positive_rate() {
    let mut narrow = CuckooFilter::builder()
        .capacity(1024)
        .fingerprint_size(1)
        .seed(13)
        .build()
        .unwrap();
    let mut wide = CuckooFilter::builder()
        .capacity(1024)
        .fingerprint_size(16)
        .seed(13)
        .build()
        .unwrap();

    // Load both to roughly 85%; with 1-bit fingerprints some inserts fail,
    // so keep trying fresh items until the target occupancy is reached
    let mut i = 0u64;
    while narrow.len() < 870 {
        let _ = narrow.insert(&i);
        i += 1;
        assert!(i < 1_000_000, "could not load the 1-bit filter");
    }
    let mut j = 0u64;
    while wide.len() < 870 {
        let _ = wide.insert(&j);
        j += 1;
        assert!(j < 1_000_000, "could not load the 16-bit filter");
    }

    let probe = 10_000_000u64..10_010_000;
    let narrow_fp = probe.clone().filter(|i| narrow.contains(i)).count();
    let wide_fp = probe.filter(|i| wide.contains(i)).count();

    assert!(
        narrow_fp > 5000,
        "1-bit fingerprints should collide on most probes, got {narrow_fp}"
    );
    assert!(
        wide_fp < 100,
        "16-bit fingerprints should rarely collide, got {wide_fp}"
    );
    assert!(narrow_fp > 50 * wide_fp.max(1));
}
