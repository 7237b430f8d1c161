//! Typed extraction from `a{sv}` property maps.
//!
//! BlueZ hands every property bag over as `{ name → variant }`. These
//! helpers pull out the handful of shapes the daemon cares about and
//! treat a type mismatch the same as an absent key: a malformed value
//! from the stack must never poison the signal pipeline.

use std::collections::HashMap;

use super::proxies::PropMap;

pub fn bool_prop(props: &PropMap, key: &str) -> Option<bool> {
    props
        .get(key)
        .and_then(|v| v.try_clone().ok())
        .and_then(|v| bool::try_from(v).ok())
}

pub fn string_prop(props: &PropMap, key: &str) -> Option<String> {
    props
        .get(key)
        .and_then(|v| v.try_clone().ok())
        .and_then(|v| String::try_from(v).ok())
}

pub fn i16_prop(props: &PropMap, key: &str) -> Option<i16> {
    props
        .get(key)
        .and_then(|v| v.try_clone().ok())
        .and_then(|v| i16::try_from(v).ok())
}

/// Extract a `{ uuid → bytes }` map, as carried by `ServiceData`.
pub fn byte_map_prop(props: &PropMap, key: &str) -> Option<HashMap<String, Vec<u8>>> {
    props
        .get(key)
        .and_then(|v| v.try_clone().ok())
        .and_then(|v| HashMap::<String, Vec<u8>>::try_from(v).ok())
}
