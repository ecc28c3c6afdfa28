//! UUID v7 utilities for time-ordered identifiers.
//!
//! Event ids use UUIDv7 (RFC 9562), which embeds a millisecond-precision
//! Unix timestamp in the first 48 bits. IDs generated later sort
//! lexicographically greater, which keeps the event history and logs
//! naturally time-ordered.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Check if a UUID is version 7.
#[inline]
pub fn is_v7(id: &Uuid) -> bool {
    id.get_version_num() == 7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_v7_is_version_7() {
        let id = new_v7();
        assert!(is_v7(&id));
    }

    #[test]
    fn test_v7_ids_are_time_ordered() {
        let first = new_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_v7();
        assert!(second > first);
    }

    #[test]
    fn test_is_v7_rejects_v4() {
        assert!(!is_v7(&Uuid::new_v4()));
    }
}
