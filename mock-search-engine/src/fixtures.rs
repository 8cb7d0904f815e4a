//! Deterministic test data.

use search_connector_shared::Record;
use serde_json::json;

/// Ten categories, evenly distributed by [`scientist_records`].
pub const SCIENTISTS: [&str; 10] = [
    "Einstein",
    "Darwin",
    "Copernicus",
    "Pasteur",
    "Curie",
    "Faraday",
    "Newton",
    "Bohr",
    "Galilei",
    "Maxwell",
];

/// `count` records of the form `{"scientist": <name>, "id": <i>}`, cycling
/// through [`SCIENTISTS`].
pub fn scientist_records(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let scientist = SCIENTISTS[i % SCIENTISTS.len()];
            Record::from_json(&json!({ "scientist": scientist, "id": i }))
        })
        .collect()
}

/// Query matching one scientist by name.
pub fn scientist_query(name: &str) -> String {
    json!({ "match": { "scientist": name } }).to_string()
}
