use serde_json::Value;

/// Keys removed from job results before they are stored. Large catalog
/// metadata and anything credential-like.
pub const STRIPPED_KEYS: &[&str] = &[
    "available_markets",
    "images",
    "preview_url",
    "external_ids",
    "external_urls",
    "access_token",
    "refresh_token",
    "credentials",
];

/// Recursively strip [`STRIPPED_KEYS`] from objects and arrays
pub fn shrink_payload(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !STRIPPED_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key, shrink_payload(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(shrink_payload).collect()),
        other => other,
    }
}
