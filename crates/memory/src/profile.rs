//! The global user profile: deep-merge patches and versioned updates.
//!
//! The profile is schema-less ordered JSON. [`KNOWN_FIELDS`] documents the
//! fields extraction usually produces; nothing enforces it.

use contextloop_core::error::MemoryError;
use contextloop_core::memory::{ProfileRecord, ProfileStore};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Key of the delete sentinel: a patch value `{"$delete": true}` removes the key.
pub const DELETE_SENTINEL: &str = "$delete";

/// Attempts before a contended profile update gives up.
pub const MAX_CAS_ATTEMPTS: usize = 5;

/// A documented profile field.
#[derive(Debug, Clone, Copy)]
pub struct ProfileField {
    pub name: &'static str,
    pub kind: &'static str,
    pub description: &'static str,
}

pub const KNOWN_FIELDS: &[ProfileField] = &[
    ProfileField { name: "name", kind: "string", description: "What the user likes to be called" },
    ProfileField { name: "occupation", kind: "string", description: "Job or role" },
    ProfileField { name: "location", kind: "string", description: "City or region" },
    ProfileField { name: "timezone", kind: "string", description: "IANA zone or UTC offset" },
    ProfileField { name: "languages", kind: "array", description: "Spoken or programming languages" },
    ProfileField { name: "interests", kind: "array", description: "Topics the user cares about" },
    ProfileField { name: "preferences", kind: "object", description: "Stated likes, dislikes and settings" },
    ProfileField { name: "communication_style", kind: "string", description: "How the user prefers answers" },
    ProfileField { name: "goals", kind: "array", description: "What the user is working towards" },
];

/// Render the known fields as a prompt fragment.
pub fn known_fields_prompt() -> String {
    KNOWN_FIELDS
        .iter()
        .map(|f| format!("- {} ({}): {}", f.name, f.kind, f.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_delete_sentinel(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.len() == 1 && o.get(DELETE_SENTINEL) == Some(&Value::Bool(true)))
}

/// Deep-merge `patch` into `base`.
///
/// Scalars overwrite, objects recurse, arrays union without duplicates
/// (existing order first). A key disappears only when the patch maps it to
/// the delete sentinel. Applying the same patch twice is a no-op the second
/// time.
pub fn merge_patch(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, incoming) in patch {
        if is_delete_sentinel(incoming) {
            base.remove(key);
            continue;
        }

        let merged_in_place = match (base.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                merge_patch(existing, nested);
                true
            }
            (Some(Value::Array(existing)), Value::Array(items)) => {
                for item in items {
                    if !existing.contains(item) {
                        existing.push(item.clone());
                    }
                }
                true
            }
            _ => false,
        };
        if !merged_in_place {
            base.insert(key.clone(), strip_sentinels(incoming));
        }
    }
}

/// A fresh value must not carry sentinels into storage.
fn strip_sentinels(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut clean = Map::new();
            merge_patch(&mut clean, map);
            Value::Object(clean)
        }
        other => other.clone(),
    }
}

/// Merge `patch` into the stored profile with optimistic concurrency.
///
/// Each attempt loads the record, merges, and swaps against the loaded
/// version. A conflict retries from a fresh load. The version increments on
/// every successful merge, even when the data is unchanged.
pub async fn apply_profile_patch(
    store: &dyn ProfileStore,
    patch: &Map<String, Value>,
) -> Result<ProfileRecord, MemoryError> {
    let mut last_conflict = None;
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let current = store.load().await?;
        let mut merged = current.data.clone();
        merge_patch(&mut merged, patch);

        match store.compare_and_swap(current.version, merged).await {
            Ok(record) => {
                debug!(version = record.version, attempt, "Profile patch applied");
                return Ok(record);
            }
            Err(conflict @ MemoryError::VersionConflict { .. }) => {
                warn!(attempt, error = %conflict, "Profile update raced, retrying");
                last_conflict = Some(conflict);
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_conflict.unwrap_or_else(|| MemoryError::Storage("profile update retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryProfileStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn scalars_overwrite() {
        let mut base = obj(json!({"name": "Ada", "location": "London"}));
        merge_patch(&mut base, &obj(json!({"location": "Paris"})));
        assert_eq!(Value::Object(base), json!({"name": "Ada", "location": "Paris"}));
    }

    #[test]
    fn objects_recurse() {
        let mut base = obj(json!({"preferences": {"theme": "dark", "units": "metric"}}));
        merge_patch(&mut base, &obj(json!({"preferences": {"theme": "light", "editor": "vim"}})));
        assert_eq!(
            Value::Object(base),
            json!({"preferences": {"theme": "light", "units": "metric", "editor": "vim"}})
        );
    }

    #[test]
    fn arrays_union_without_duplicates() {
        let mut base = obj(json!({"interests": ["rust", "chess"]}));
        merge_patch(&mut base, &obj(json!({"interests": ["chess", "go", "rust", "go"]})));
        assert_eq!(base["interests"], json!(["rust", "chess", "go"]));
    }

    #[test]
    fn keys_survive_unless_sentinel() {
        let mut base = obj(json!({"name": "Ada", "occupation": "engineer"}));
        merge_patch(&mut base, &obj(json!({"name": "Ada L."})));
        assert!(base.contains_key("occupation"));

        merge_patch(&mut base, &obj(json!({"occupation": {"$delete": true}})));
        assert!(!base.contains_key("occupation"));
        assert_eq!(base["name"], "Ada L.");
    }

    #[test]
    fn nested_sentinel_deletes_nested_key() {
        let mut base = obj(json!({"preferences": {"theme": "dark", "units": "metric"}}));
        merge_patch(&mut base, &obj(json!({"preferences": {"units": {"$delete": true}}})));
        assert_eq!(base["preferences"], json!({"theme": "dark"}));
    }

    #[test]
    fn null_is_an_ordinary_overwrite() {
        let mut base = obj(json!({"location": "Paris"}));
        merge_patch(&mut base, &obj(json!({"location": null})));
        assert_eq!(base["location"], Value::Null);
    }

    #[test]
    fn type_change_overwrites() {
        let mut base = obj(json!({"goals": "ship it"}));
        merge_patch(&mut base, &obj(json!({"goals": ["ship it", "rest"]})));
        assert_eq!(base["goals"], json!(["ship it", "rest"]));
    }

    #[test]
    fn new_subtree_does_not_store_sentinels() {
        let mut base = Map::new();
        merge_patch(&mut base, &obj(json!({"preferences": {"theme": "dark", "old": {"$delete": true}}})));
        assert_eq!(base["preferences"], json!({"theme": "dark"}));
    }

    #[test]
    fn merge_is_idempotent() {
        let patch = obj(json!({
            "name": "Ada",
            "interests": ["rust"],
            "preferences": {"theme": "dark"},
            "legacy": {"$delete": true}
        }));
        let mut once = obj(json!({"interests": ["chess"], "legacy": 1}));
        merge_patch(&mut once, &patch);
        let mut twice = once.clone();
        merge_patch(&mut twice, &patch);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn same_patch_twice_bumps_version_keeps_data() {
        let store = InMemoryProfileStore::new();
        let patch = obj(json!({"name": "Ada", "interests": ["rust"]}));

        let first = apply_profile_patch(&store, &patch).await.unwrap();
        let second = apply_profile_patch(&store, &patch).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(first.data, second.data);
    }

    /// Loses the first `conflicts` swaps to a simulated concurrent writer.
    struct ContendedStore {
        inner: InMemoryProfileStore,
        conflicts: AtomicUsize,
    }

    #[async_trait]
    impl ProfileStore for ContendedStore {
        async fn load(&self) -> Result<ProfileRecord, MemoryError> {
            self.inner.load().await
        }

        async fn compare_and_swap(&self, expected: u64, data: Map<String, Value>) -> Result<ProfileRecord, MemoryError> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                let mut rival = self.inner.load().await?.data;
                rival.insert("rival".into(), json!(true));
                self.inner.compare_and_swap(expected, rival).await?;
            }
            self.inner.compare_and_swap(expected, data).await
        }
    }

    #[tokio::test]
    async fn conflict_retries_and_keeps_rival_write() {
        let store = ContendedStore {
            inner: InMemoryProfileStore::new(),
            conflicts: AtomicUsize::new(2),
        };
        let record = apply_profile_patch(&store, &obj(json!({"name": "Ada"}))).await.unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.data["name"], "Ada");
        assert_eq!(record.data["rival"], true);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let store = ContendedStore {
            inner: InMemoryProfileStore::new(),
            conflicts: AtomicUsize::new(MAX_CAS_ATTEMPTS + 1),
        };
        let err = apply_profile_patch(&store, &obj(json!({"name": "Ada"}))).await.unwrap_err();
        assert!(matches!(err, MemoryError::VersionConflict { .. }));
    }

    #[test]
    fn known_fields_prompt_lists_fields() {
        let prompt = known_fields_prompt();
        assert!(prompt.contains("communication_style"));
        assert!(prompt.contains("interests (array)"));
    }
}
