//! Object key extraction from stored references.

/// Maps an object reference (bare name, relative path or full URL) to the key
/// used by the bucket: the last non-empty `/`-separated segment.
///
/// Query strings and fragments are kept as part of the key.
pub fn extract_key(reference: &str) -> &str {
    reference
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
}
