//! Client model names to upstream model tiers

use serde::Serialize;

pub const OPUS: &str = "claude-opus-4.5";
pub const SONNET: &str = "claude-sonnet-4.5";
pub const HAIKU: &str = "claude-haiku-4.5";

/// Exact-match table. Every key is also listed by `GET /v1/models`.
const MODEL_MAP: &[(&str, &str)] = &[
    ("claude-opus-4-5", OPUS),
    ("claude-opus-4-5-20251101", OPUS),
    ("claude-3-opus-20240229", OPUS),
    ("claude-3-opus-latest", OPUS),
    ("claude-haiku-4-5", HAIKU),
    ("claude-haiku-4-5-20251001", HAIKU),
    ("claude-3-5-haiku-20241022", HAIKU),
    ("claude-3-5-haiku-latest", HAIKU),
    ("claude-sonnet-4-5", SONNET),
    ("claude-sonnet-4-5-20250929", SONNET),
    ("claude-3-5-sonnet-20241022", SONNET),
    ("claude-3-5-sonnet-latest", SONNET),
    ("claude-sonnet-4", "claude-sonnet-4"),
    ("claude-sonnet-4-20250514", "claude-sonnet-4"),
    ("claude-3-7-sonnet-20250219", "claude-3.7-sonnet"),
];

const CATALOG_CREATED: u64 = 1_700_000_000;

/// Map a client model name to the upstream tier.
///
/// Unknown names fall back on a case-insensitive substring match so that new
/// dated releases keep working without a table update.
pub fn map_model(requested: &str) -> &'static str {
    if let Some(&(_, tier)) = MODEL_MAP.iter().find(|(name, _)| *name == requested) {
        return tier;
    }
    let lower = requested.to_ascii_lowercase();
    if lower.contains("opus") {
        OPUS
    } else if lower.contains("haiku") {
        HAIKU
    } else {
        SONNET
    }
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: &'static str,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
}

pub fn catalog() -> ModelList {
    ModelList {
        object: "list",
        data: MODEL_MAP
            .iter()
            .map(|&(id, _)| ModelEntry {
                id,
                object: "model",
                created: CATALOG_CREATED,
                owned_by: "anthropic",
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_names_map_through_the_table() {
        assert_eq!(map_model("claude-3-5-haiku-20241022"), HAIKU);
        assert_eq!(map_model("claude-sonnet-4-20250514"), "claude-sonnet-4");
        assert_eq!(map_model("claude-3-7-sonnet-20250219"), "claude-3.7-sonnet");
        assert_eq!(map_model("claude-opus-4-5"), OPUS);
    }

    #[test]
    fn unknown_names_fall_back_by_substring() {
        assert_eq!(map_model("Claude-OPUS-5-preview"), OPUS);
        assert_eq!(map_model("my-haiku-clone"), HAIKU);
        assert_eq!(map_model("gpt-4o"), SONNET);
        assert_eq!(map_model(""), SONNET);
    }

    #[test]
    fn catalog_lists_every_mapped_name() {
        let list = catalog();
        assert_eq!(list.object, "list");
        assert_eq!(list.data.len(), MODEL_MAP.len());
        assert!(list.data.iter().all(|m| m.owned_by == "anthropic"));

        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["data"][0]["id"], "claude-opus-4-5");
        assert_eq!(json["data"][0]["created"], 1_700_000_000);
    }
}
