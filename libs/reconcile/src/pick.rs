//! Random selection without replacement.

use rand::seq::SliceRandom;
use rand::Rng;

/// Pick up to `n` distinct items at random.
///
/// Items are sorted first so the outcome depends only on the RNG state and
/// the set of items, never on the order they were listed in. With a seeded
/// RNG the pick is reproducible.
pub fn pick_random<T, R>(mut items: Vec<T>, n: usize, rng: &mut R) -> Vec<T>
where
    T: Ord,
    R: Rng + ?Sized,
{
    items.sort();
    items.dedup();
    items.shuffle(rng);
    items.truncate(n);
    items
}
