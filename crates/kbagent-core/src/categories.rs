//! Category manager consumed by the categorize phase.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use crate::db::Db;

pub trait CategoryStore: Send + Sync {
    /// Existing category tree: main category to its sub-categories.
    fn get_categories(&self) -> Result<BTreeMap<String, Vec<String>>>;

    /// Idempotent create.
    fn ensure_category(&self, main: &str, sub: &str) -> Result<()>;
}

/// Pre-formatted listing handed to the categorization prompt.
pub fn format_existing(categories: &BTreeMap<String, Vec<String>>) -> String {
    if categories.is_empty() {
        return "(no categories yet)".to_string();
    }
    let mut out = String::new();
    for (main, subs) in categories {
        out.push_str("- ");
        out.push_str(main);
        if !subs.is_empty() {
            out.push_str(": ");
            out.push_str(&subs.join(", "));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Category store backed by the state database.
pub struct DbCategoryStore {
    db: Arc<Db>,
}

impl DbCategoryStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

impl CategoryStore for DbCategoryStore {
    fn get_categories(&self) -> Result<BTreeMap<String, Vec<String>>> {
        self.db.list_categories()
    }

    fn ensure_category(&self, main: &str, sub: &str) -> Result<()> {
        self.db.ensure_category(main, sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_tree_for_prompt() {
        let mut map = BTreeMap::new();
        map.insert("rust".to_string(), vec!["async".to_string(), "macros".to_string()]);
        map.insert("devops".to_string(), vec!["ci".to_string()]);
        let listing = format_existing(&map);
        assert_eq!(listing, "- devops: ci\n- rust: async, macros");
    }

    #[test]
    fn empty_tree_has_placeholder() {
        assert_eq!(format_existing(&BTreeMap::new()), "(no categories yet)");
    }

    #[test]
    fn db_store_roundtrip() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.migrate().unwrap();
        let store = DbCategoryStore::new(db);
        store.ensure_category("rust", "async").unwrap();
        store.ensure_category("rust", "async").unwrap();
        let map = store.get_categories().unwrap();
        assert_eq!(map["rust"], vec!["async"]);
    }
}
