//! # Rendezvous Balancing
//!
//! Every logical shard `s` in `[0, total)` goes to the worker whose
//! `score(nonce, s)` is highest. Scores depend only on the nonce and the
//! shard, so removing one worker moves exactly the shards it owned and
//! adding one moves only the shards it now wins.
//!
//! Hashing is SipHash-1-3 with fixed keys over little-endian bytes, so every
//! process on every platform agrees.

use std::collections::BTreeSet;
use std::hash::Hasher;

use meridian_core::{BalanceStrategy, ShardId};
use siphasher::sip::SipHasher13;

use crate::error::{ShardError, ShardResult};

/// Rendezvous weight of `nonce` for logical shard `shard`.
#[inline]
#[must_use]
pub fn score(nonce: &str, shard: u32) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write(nonce.as_bytes());
    hasher.write(&shard.to_le_bytes());
    hasher.finish()
}

/// The winning nonce for `shard`, if there is any candidate.
///
/// Ties (practically impossible) go to the greater nonce.
#[must_use]
pub fn rendezvous_owner<'a, I>(nonces: I, shard: u32) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    nonces
        .into_iter()
        .max_by_key(|nonce| (score(nonce, shard), *nonce))
}

/// Logical shards `me` should hold.
///
/// # Arguments
///
/// * `domain` - Domain name, for errors
/// * `strategy` - Configured balancing strategy
/// * `total` - Logical shard count
/// * `nonces` - Live workers; `me` holds nothing unless listed
/// * `me` - This worker's nonce
///
/// # Errors
///
/// [`ShardError::UnsupportedStrategy`] for [`BalanceStrategy::Weighted`].
pub fn assign(
    domain: &str,
    strategy: BalanceStrategy,
    total: u32,
    nonces: &BTreeSet<String>,
    me: &str,
) -> ShardResult<BTreeSet<u32>> {
    match strategy {
        BalanceStrategy::Balanced => Ok((0..total)
            .filter(|shard| rendezvous_owner(nonces.iter().map(String::as_str), *shard) == Some(me))
            .collect()),
        BalanceStrategy::Weighted => Err(ShardError::UnsupportedStrategy {
            domain: domain.to_owned(),
            strategy,
        }),
    }
}

/// The logical shard a spatial shard belongs to.
///
/// Returns 0 when `total` is 0.
#[must_use]
pub fn logical_shard(shard: &ShardId, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let mut hasher = SipHasher13::new();
    hasher.write(&shard.packed().to_le_bytes());
    #[allow(clippy::cast_possible_truncation)]
    let logical = (hasher.finish() % u64::from(total)) as u32;
    logical
}
