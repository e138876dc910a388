//! Proxy and user-agent rotation
//!
//! A request either carries a stickiness key, in which case the key is hashed
//! onto the list so the same client keeps the same proxy and user-agent, or
//! it does not, in which case an element is picked uniformly at random.

mod user_agent;

pub use user_agent::{select_user_agent, USER_AGENTS};

use rand::Rng;

/// Selection policy derived from an optional stickiness key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation<'a> {
    Sticky(&'a str),
    Random,
}

impl<'a> Rotation<'a> {
    /// Empty keys fall back to random selection
    pub fn from_key(key: Option<&'a str>) -> Self {
        match key {
            Some(key) if !key.is_empty() => Rotation::Sticky(key),
            _ => Rotation::Random,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rotation::Sticky(_) => "sticky",
            Rotation::Random => "random",
        }
    }

    /// Index into a list of `len` elements, `None` when the list is empty
    pub fn index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }

        Some(match self {
            Rotation::Sticky(key) => (key_hash(key) % len as u64) as usize,
            Rotation::Random => rand::thread_rng().gen_range(0..len),
        })
    }

    /// Pick an element of `items`
    pub fn pick<'b, T>(&self, items: &'b [T]) -> Option<&'b T> {
        self.index(items.len()).map(|i| &items[i])
    }
}

/// Stable 32-bit string hash.
///
/// Runs `hash = hash * 31 + unit` over the UTF-16 code units of `key` with
/// 32-bit signed wrapping, then takes the absolute value. Existing sticky
/// assignments depend on this exact arithmetic.
pub fn key_hash(key: &str) -> u64 {
    let hash = key.encode_utf16().fold(0i32, |hash, unit| {
        (hash << 5).wrapping_sub(hash).wrapping_add(unit as i32)
    });
    (hash as i64).unsigned_abs()
}
