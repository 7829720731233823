//! Property-based tests

mod cache_proptest;
