use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub const DEFAULT_SEED: u64 = 0x_5345_4752_4541_4430; // fixed seed for stable benchmarks

/// `blocks` blocks of `records` ascending-ish timestamps whose spread needs `max_delta`.
pub fn generate_timestamp_blocks(
    seed: u64,
    blocks: usize,
    records: usize,
    max_delta: u64,
) -> Vec<Vec<u64>> {
    assert!(records > 0 && records <= u16::MAX as usize);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut base = 1_700_000_000_000u64;
    (0..blocks)
        .map(|_| {
            let ts: Vec<u64> = (0..records)
                .map(|_| base + rng.random_range(0..=max_delta))
                .collect();
            base += max_delta + 1;
            ts
        })
        .collect()
}
