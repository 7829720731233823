//! Property-based tests for cache freshness

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use reliefsync::shared::model::CachedResponse;
use serde_json::json;

proptest! {
    #[test]
    fn test_ttl_boundary(ttl_ms in 2i64..86_400_000, fetched_ms in 0i64..4_000_000_000_000) {
        let mut cached = CachedResponse::new("/needs", json!([]));
        cached.fetched_at = Utc.timestamp_millis_opt(fetched_ms).unwrap();
        let ttl = Duration::milliseconds(ttl_ms);

        let just_before = cached.fetched_at + ttl - Duration::milliseconds(1);
        let just_after = cached.fetched_at + ttl + Duration::milliseconds(1);

        prop_assert!(cached.is_fresh_at(just_before, ttl));
        prop_assert!(!cached.is_fresh_at(just_after, ttl));
    }
}
