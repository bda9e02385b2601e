//! Percentage bucketing.
use std::io::Cursor;

/// Seed passed to MurmurHash3 when bucketing.
const BUCKET_SEED: u32 = u32::MAX;

/// Number of buckets a target can fall into. Buckets are numbered `1..=ONE_HUNDRED`.
pub const ONE_HUNDRED: u32 = 100;

pub trait Sharder {
    /// Map `bucket_by` and the target's value for it to a bucket in `1..=100`.
    fn get_bucket(&self, bucket_by: &str, value: &str) -> u32;
}

/// The default sharder: MurmurHash3 (x86, 32-bit) of `"<bucket_by>:<value>"`.
pub struct Murmur3Sharder;

impl Sharder for Murmur3Sharder {
    fn get_bucket(&self, bucket_by: &str, value: &str) -> u32 {
        let input = format!("{bucket_by}:{value}");
        // Reading from an in-memory cursor cannot fail.
        let hash = murmur3::murmur3_32(&mut Cursor::new(input.as_bytes()), BUCKET_SEED).unwrap_or(0);
        hash % ONE_HUNDRED + 1
    }
}

#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, u32>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_bucket(&self, _bucket_by: &str, value: &str) -> u32 {
        self.0.get(value).copied().unwrap_or(1)
    }
}
