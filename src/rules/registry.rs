//! Rule registry
//!
//! Owns the persisted rule set and the current compiled database. Mutations
//! compile a candidate database first and only then persist and swap, so a
//! failure at any point leaves the previous database current. Scans in flight
//! keep their `Arc` to whatever version they started with.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{CaronteError, Result};
use crate::models::RowId;
use crate::storage::Storage;

use super::database::RuleDatabase;
use super::{Rule, RulePatch};

pub struct RuleRegistry {
    storage: Storage,
    inner: RwLock<Inner>,
}

struct Inner {
    rules: Vec<Rule>,
    database: Arc<RuleDatabase>,
}

impl RuleRegistry {
    /// Load persisted rules and compile the initial database.
    pub fn open(storage: Storage) -> Result<Self> {
        let rules = storage.list_rules()?;
        let version = rules.iter().map(|r| r.version).max().unwrap_or(0).max(1);
        let database = Arc::new(RuleDatabase::compile(&rules, version)?);

        info!(
            rules = rules.len(),
            patterns = database.pattern_count(),
            version,
            "rule registry loaded"
        );

        Ok(Self {
            storage,
            inner: RwLock::new(Inner { rules, database }),
        })
    }

    /// Add a rule; returns its id. The new database version carries the rule's
    /// pattern set.
    pub fn add_rule(&self, mut rule: Rule) -> Result<RowId> {
        rule.validate()?;

        let mut inner = self.inner.write();
        if inner.rules.iter().any(|r| r.name == rule.name) {
            return Err(CaronteError::Conflict(format!(
                "rule name already exists: {}",
                rule.name
            )));
        }

        rule.id = self.storage.next_row_id()?;
        let version = inner.database.version() + 1;
        rule.version = version;

        // Compile before persisting: a pattern the engine rejects must not
        // reach the store.
        let mut candidate = inner.rules.clone();
        candidate.push(rule.clone());
        let database = Arc::new(RuleDatabase::compile(&candidate, version)?);

        self.storage.insert_rule(&rule)?;
        let id = rule.id;
        inner.rules = candidate;
        inner.database = database;

        info!(rule = %id, version, "rule added, database recompiled");
        Ok(id)
    }

    /// Apply a patch to a rule; returns the rule's resulting version.
    pub fn update_rule(&self, id: RowId, patch: RulePatch) -> Result<u64> {
        let mut inner = self.inner.write();

        let index = inner
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| CaronteError::NotFound(format!("rule {}", id)))?;

        if inner.rules[index].version != patch.version {
            return Err(CaronteError::PreconditionFailed(format!(
                "rule {} is at version {}, patch targets {}",
                id, inner.rules[index].version, patch.version
            )));
        }

        if let Some(name) = &patch.name {
            if inner.rules.iter().any(|r| r.id != id && r.name == *name) {
                return Err(CaronteError::Conflict(format!(
                    "rule name already exists: {}",
                    name
                )));
            }
        }

        let mut updated = inner.rules[index].clone();
        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(color) = patch.color {
            updated.color = color;
        }
        if let Some(notes) = patch.notes {
            updated.notes = notes;
        }
        let scan_set_changed = patch.patterns.is_some()
            || patch.enabled.is_some_and(|e| e != updated.enabled);
        if let Some(enabled) = patch.enabled {
            updated.enabled = enabled;
        }
        if let Some(patterns) = patch.patterns {
            updated.patterns = patterns;
        }
        updated.validate()?;

        if scan_set_changed {
            let version = inner.database.version() + 1;
            updated.version = version;

            let mut candidate = inner.rules.clone();
            candidate[index] = updated.clone();
            let database = Arc::new(RuleDatabase::compile(&candidate, version)?);

            self.storage.update_rule(&updated)?;
            inner.rules = candidate;
            inner.database = database;
            info!(rule = %id, version, "rule updated, database recompiled");
        } else {
            self.storage.update_rule(&updated)?;
            inner.rules[index] = updated.clone();
        }

        Ok(updated.version)
    }

    pub fn list_rules(&self) -> Vec<Rule> {
        self.inner.read().rules.clone()
    }

    pub fn get_rule(&self, id: RowId) -> Option<Rule> {
        self.inner.read().rules.iter().find(|r| r.id == id).cloned()
    }

    /// The current compiled database and its version.
    pub fn current_database(&self) -> (Arc<RuleDatabase>, u64) {
        let inner = self.inner.read();
        (inner.database.clone(), inner.database.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Pattern, PatternDirection, PatternFlags};

    fn make_rule(name: &str, regex: &str) -> Rule {
        Rule {
            id: RowId::ZERO,
            name: name.into(),
            color: "#00ff00".into(),
            notes: String::new(),
            enabled: true,
            patterns: vec![Pattern {
                regex: regex.into(),
                flags: PatternFlags {
                    direction: PatternDirection::Both,
                    ..Default::default()
                },
            }],
            version: 0,
        }
    }

    fn open_registry() -> RuleRegistry {
        RuleRegistry::open(Storage::open_memory().unwrap()).unwrap()
    }

    #[test]
    fn test_add_rule_bumps_version() {
        let registry = open_registry();
        let (_, before) = registry.current_database();

        let id = registry.add_rule(make_rule("flag", r"CTF\{\w+\}")).unwrap();
        let (db, after) = registry.current_database();

        assert!(after > before);
        assert_eq!(db.pattern_count(), 1);
        assert_eq!(db.rule_of_pattern(0), Some(id));
        assert_eq!(registry.get_rule(id).unwrap().version, after);
    }

    #[test]
    fn test_duplicate_name_conflict() {
        let registry = open_registry();
        registry.add_rule(make_rule("flag", "abc")).unwrap();
        assert!(matches!(
            registry.add_rule(make_rule("flag", "def")),
            Err(CaronteError::Conflict(_))
        ));
    }

    #[test]
    fn test_invalid_pattern_leaves_database_current() {
        let registry = open_registry();
        registry.add_rule(make_rule("good", "abc")).unwrap();
        let (_, before) = registry.current_database();

        assert!(registry.add_rule(make_rule("bad", r"broken[")).is_err());

        let (db, after) = registry.current_database();
        assert_eq!(before, after);
        assert_eq!(db.pattern_count(), 1);
        assert_eq!(registry.list_rules().len(), 1);
    }

    #[test]
    fn test_update_stale_version_rejected() {
        let registry = open_registry();
        let id = registry.add_rule(make_rule("flag", "abc")).unwrap();
        let version = registry.get_rule(id).unwrap().version;

        let stale = RulePatch {
            enabled: Some(false),
            version: version + 5,
            ..Default::default()
        };
        assert!(matches!(
            registry.update_rule(id, stale),
            Err(CaronteError::PreconditionFailed(_))
        ));
    }

    #[test]
    fn test_disable_recompiles_without_losing_rule() {
        let registry = open_registry();
        let id = registry.add_rule(make_rule("flag", "abc")).unwrap();
        let version = registry.get_rule(id).unwrap().version;

        let new_version = registry
            .update_rule(
                id,
                RulePatch {
                    enabled: Some(false),
                    version,
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(new_version > version);
        let (db, _) = registry.current_database();
        assert!(db.is_empty());
        // the rule itself survives
        assert_eq!(registry.list_rules().len(), 1);
    }

    #[test]
    fn test_cosmetic_update_keeps_version() {
        let registry = open_registry();
        let id = registry.add_rule(make_rule("flag", "abc")).unwrap();
        let version = registry.get_rule(id).unwrap().version;

        let unchanged = registry
            .update_rule(
                id,
                RulePatch {
                    notes: Some("colour note".into()),
                    version,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(unchanged, version);
    }

    #[test]
    fn test_registry_reload_keeps_versions() {
        let storage = Storage::open_memory().unwrap();
        let registry = RuleRegistry::open(storage.clone()).unwrap();
        registry.add_rule(make_rule("flag", "abc")).unwrap();
        let (_, version) = registry.current_database();

        let reloaded = RuleRegistry::open(storage).unwrap();
        let (db, reloaded_version) = reloaded.current_database();
        assert_eq!(reloaded_version, version);
        assert_eq!(db.pattern_count(), 1);
    }
}
