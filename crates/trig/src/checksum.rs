//! Content checksums for trigger definitions.
//!
//! The checksum covers name, table, version, function body and condition, in
//! that order. Each field is hashed as an 8-byte little-endian length
//! followed by its UTF-8 bytes, so `("ab", "c")` and `("a", "bc")` hash
//! differently. Absent body or condition hash like the empty string.

use crate::TriggerDefinition;

/// Checksum of a definition, as a lowercase hex blake3 digest.
pub fn checksum(def: &TriggerDefinition) -> String {
    checksum_fields(
        def.name(),
        def.table(),
        def.version(),
        def.function_body(),
        def.condition(),
    )
}

/// Checksum from the raw fields, for rows read back from the registry.
pub fn checksum_fields(
    name: &str,
    table: &str,
    version: i32,
    function_body: Option<&str>,
    condition: Option<&str>,
) -> String {
    let version = version.to_string();
    let mut hasher = blake3::Hasher::new();
    for field in [
        name,
        table,
        version.as_str(),
        function_body.unwrap_or(""),
        condition.unwrap_or(""),
    ] {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
