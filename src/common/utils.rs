//! Utility functions for quorumkv

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in microseconds
pub fn get_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

/// Current Unix timestamp in milliseconds
pub fn get_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Uniform random value in `[min, max)`
pub fn random_range(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..max)
}

/// Uniform random value in `[0, 1)`, for trace sampling
pub fn random_unit() -> f64 {
    rand::thread_rng().gen::<f64>()
}

/// Parent of a hierarchical key, e.g. `a/b/c` -> `a/b`.
///
/// Returns `None` for top-level keys.
pub fn parent_key(key: &str) -> Option<&str> {
    key.rfind('/').map(|idx| &key[..idx])
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_key() {
        assert_eq!(parent_key("a/b/c"), Some("a/b"));
        assert_eq!(parent_key("a/b"), Some("a"));
        assert_eq!(parent_key("top"), None);
        assert_eq!(parent_key(""), None);
    }

    #[test]
    fn test_random_range_bounds() {
        for _ in 0..100 {
            let v = random_range(150, 300);
            assert!((150..300).contains(&v));
        }
        assert_eq!(random_range(10, 10), 10);
    }

    #[test]
    fn test_get_micros_monotonicish() {
        let a = get_micros();
        let b = get_micros();
        assert!(b >= a);
    }
}
