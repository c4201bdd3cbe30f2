use nerpipe_core::Entity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// True when `a` is a strictly shorter substring of `b` at the same element.
pub fn is_submatch(a: &Entity, b: &Entity) -> bool {
    a.xpath == b.xpath && a.name.len() < b.name.len() && b.name.contains(a.name.as_str())
}

/// Drop every entity that is a submatch of another entity in the set.
///
/// Relative order of the survivors is kept.
pub fn filter_submatches(entities: Vec<Entity>) -> Vec<Entity> {
    let keep: Vec<bool> = entities
        .iter()
        .map(|e| !entities.iter().any(|f| is_submatch(e, f)))
        .collect();
    entities
        .into_iter()
        .zip(keep)
        .filter_map(|(e, k)| k.then_some(e))
        .collect()
}

/// Entity names that must never be reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocklist {
    #[serde(default)]
    pub case_sensitive: BTreeSet<String>,
    /// Stored lowercased.
    #[serde(default)]
    pub case_insensitive: BTreeSet<String>,
}

impl Blocklist {
    pub fn new(
        case_sensitive: impl IntoIterator<Item = String>,
        case_insensitive: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            case_sensitive: case_sensitive.into_iter().collect(),
            case_insensitive: case_insensitive
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.case_sensitive.is_empty() && self.case_insensitive.is_empty()
    }

    pub fn allowed(&self, name: &str) -> bool {
        !self.case_sensitive.contains(name) && !self.case_insensitive.contains(&name.to_lowercase())
    }

    pub fn retain(&self, entities: &mut Vec<Entity>) {
        if self.is_empty() {
            return;
        }
        let before = entities.len();
        entities.retain(|e| self.allowed(&e.name));
        if entities.len() != before {
            tracing::debug!(dropped = before - entities.len(), "blocklist removed entities");
        }
    }
}
