//! SQLite-backed experience store.
//!
//! One metadata table holds experiences, unit-scoped copies, few-shot
//! bundles, learning units, and hierarchies as JSON rows addressed by the
//! keys in [`crate::store::keys`]. A sidecar table records reasoning
//! trajectories per session.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::dream::AbstractionHierarchy;
use crate::error::{Error, Result};
use crate::experience::{Experience, FewShot, LearningUnit};
use crate::store::keys;
use crate::store::schema::{initialize_schema, is_initialized};

/// SQLite-backed experience store.
pub struct ExperienceStore {
    conn: Arc<Mutex<Connection>>,
}

impl ExperienceStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(&path).map_err(|e| Error::store(e.to_string()))?;
        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::store(e.to_string()))?;
        }
        info!(path = %path.as_ref().display(), "experience store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::store(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::store(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {e}")))?;
        f(&conn).map_err(|e| Error::store(e.to_string()))
    }

    /// Run `f` inside a transaction; any error rolls every write back.
    fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {e}")))?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::store(e.to_string()))?;
        let out = f(&tx)?;
        tx.commit().map_err(|e| Error::store(e.to_string()))?;
        Ok(out)
    }

    // ==================== Experience Operations ====================

    /// Persist an experience. Idempotent by id; also appends the session's
    /// reasoning-trajectory step.
    pub fn save_experience(&self, exp: &Experience) -> Result<()> {
        let data = serde_json::to_string(exp)?;
        let action = serde_json::to_string(&exp.mv)?;
        self.with_conn(|conn| {
            put_record(
                conn,
                &keys::experience(&exp.id),
                keys::TYPE_EXPERIENCE,
                &data,
                exp.timestamp.timestamp_millis(),
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO trajectory_steps
                 (trajectory_id, step_index, action, reasoning, outcome, feedback)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    exp.session_id,
                    exp.move_number as i64,
                    action,
                    exp.mv.reasoning,
                    exp.validation.outcome.to_string(),
                    exp.validation.reason,
                ],
            )?;
            Ok(())
        })
    }

    /// Get a global experience by id.
    pub fn get_experience(&self, id: &str) -> Result<Option<Experience>> {
        let data = self.with_conn(|conn| get_data(conn, &keys::experience(id)))?;
        data.map(|d| serde_json::from_str(&d).map_err(Error::from))
            .transpose()
    }

    /// Every unconsolidated experience for a profile, in session/move order.
    pub fn get_unconsolidated(&self, profile: &str) -> Result<Vec<Experience>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT data FROM metadata
                 WHERE type = ?1
                   AND json_extract(data, '$.consolidated') = 0
                   AND json_extract(data, '$.profile_name') = ?2
                 ORDER BY timestamp ASC, json_extract(data, '$.move_number') ASC",
            )?;
            let rows = stmt
                .query_map(params![keys::TYPE_EXPERIENCE, profile], |row| {
                    row.get::<_, String>(0)
                })?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            Ok(rows)
        })?;
        rows.iter()
            .map(|d| serde_json::from_str(d).map_err(Error::from))
            .collect()
    }

    /// Flip the consolidated flag on the given experiences. Does not delete.
    pub fn mark_consolidated(&self, ids: &[String]) -> Result<usize> {
        self.with_tx(|conn| {
            let mut updated = 0;
            for id in ids {
                let key = keys::experience(id);
                if let Some(data) = get_data(conn, &key).map_err(Error::from)? {
                    let mut value: Value = serde_json::from_str(&data)?;
                    value["consolidated"] = Value::Bool(true);
                    put_record(
                        conn,
                        &key,
                        keys::TYPE_EXPERIENCE,
                        &value.to_string(),
                        Utc::now().timestamp_millis(),
                    )
                    .map_err(Error::from)?;
                    updated += 1;
                }
            }
            Ok(updated)
        })
    }

    /// Copy each experience into the unit's namespace with binding metadata
    /// stamped, then delete the global copy unless `preserve_originals`.
    ///
    /// With preservation on the globals are left untouched, so further
    /// dream runs can absorb the same pool into other units.
    pub fn mark_absorbed(
        &self,
        unit: &str,
        ids: &[String],
        preserve_originals: bool,
        unit_version: u32,
    ) -> Result<usize> {
        self.with_tx(|conn| {
            absorb_in_tx(conn, unit, ids, preserve_originals, unit_version)
        })
    }

    /// Restore a global, unconsolidated copy of every experience bound to
    /// `unit`, stripped of binding metadata. Returns the count restored.
    pub fn unconsolidate(&self, unit: &str) -> Result<usize> {
        let restored = self.with_tx(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT data FROM metadata WHERE type = ?1 AND key LIKE ?2",
                )
                .map_err(Error::from)?;
            let rows = stmt
                .query_map(
                    params![keys::TYPE_UNIT_EXPERIENCE, keys::unit_experience_prefix(unit)],
                    |row| row.get::<_, String>(0),
                )
                .map_err(Error::from)?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();

            let mut restored = 0;
            for data in rows {
                let exp: Experience = serde_json::from_str(&data)?;
                let global = exp.unbound_copy();
                put_record(
                    conn,
                    &keys::experience(&global.id),
                    keys::TYPE_EXPERIENCE,
                    &serde_json::to_string(&global)?,
                    global.timestamp.timestamp_millis(),
                )
                .map_err(Error::from)?;
                restored += 1;
            }
            Ok(restored)
        })?;
        info!(unit, restored, "unconsolidated learning unit");
        Ok(restored)
    }

    /// Copy a learning unit: its record, every unit-scoped experience
    /// (rebinding to the target), its few-shot bundle, and its hierarchy.
    /// Fails if the source is missing or the target already exists.
    pub fn clone_unit(&self, profile: &str, source: &str, target: &str) -> Result<()> {
        self.with_tx(|conn| {
            let source_key = keys::learning_unit(profile, source);
            let Some(unit_data) = get_data(conn, &source_key).map_err(Error::from)? else {
                return Err(Error::store(format!(
                    "source unit '{source}' not found for profile '{profile}'"
                )));
            };
            let target_key = keys::learning_unit(profile, target);
            if get_data(conn, &target_key).map_err(Error::from)?.is_some() {
                return Err(Error::store(format!("target unit '{target}' already exists")));
            }

            let mut unit: LearningUnit = serde_json::from_str(&unit_data)?;
            unit.unit_id = target.to_string();
            unit.name = format!("{} (clone)", unit.name);
            unit.updated_at = Utc::now();
            put_record(
                conn,
                &target_key,
                keys::TYPE_LEARNING_UNIT,
                &serde_json::to_string(&unit)?,
                Utc::now().timestamp_millis(),
            )
            .map_err(Error::from)?;

            let mut stmt = conn
                .prepare("SELECT data FROM metadata WHERE type = ?1 AND key LIKE ?2")
                .map_err(Error::from)?;
            let rows = stmt
                .query_map(
                    params![keys::TYPE_UNIT_EXPERIENCE, keys::unit_experience_prefix(source)],
                    |row| row.get::<_, String>(0),
                )
                .map_err(Error::from)?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            for data in rows {
                let mut exp: Experience = serde_json::from_str(&data)?;
                exp.bound_to_unit = Some(target.to_string());
                put_record(
                    conn,
                    &keys::unit_experience(target, &exp.id),
                    keys::TYPE_UNIT_EXPERIENCE,
                    &serde_json::to_string(&exp)?,
                    exp.timestamp.timestamp_millis(),
                )
                .map_err(Error::from)?;
            }

            for (source_key, target_key, record_type) in [
                (
                    keys::few_shots(profile, source),
                    keys::few_shots(profile, target),
                    keys::TYPE_FEWSHOTS,
                ),
                (
                    keys::hierarchy(profile, source),
                    keys::hierarchy(profile, target),
                    keys::TYPE_HIERARCHY,
                ),
            ] {
                if let Some(data) = get_data(conn, &source_key).map_err(Error::from)? {
                    put_record(
                        conn,
                        &target_key,
                        record_type,
                        &data,
                        Utc::now().timestamp_millis(),
                    )
                    .map_err(Error::from)?;
                }
            }
            Ok(())
        })
    }

    /// Every experience bound to a unit.
    pub fn unit_experiences(&self, unit: &str) -> Result<Vec<Experience>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT data FROM metadata WHERE type = ?1 AND key LIKE ?2
                 ORDER BY timestamp ASC",
            )?;
            let rows = stmt
                .query_map(
                    params![keys::TYPE_UNIT_EXPERIENCE, keys::unit_experience_prefix(unit)],
                    |row| row.get::<_, String>(0),
                )?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            Ok(rows)
        })?;
        rows.iter()
            .map(|d| serde_json::from_str(d).map_err(Error::from))
            .collect()
    }

    // ==================== Learning-Unit Operations ====================

    /// Save the active few-shot bundle for (profile, unit).
    pub fn save_few_shots(&self, profile: &str, unit: &str, examples: &[FewShot]) -> Result<()> {
        let data = serde_json::to_string(examples)?;
        self.with_conn(|conn| {
            put_record(
                conn,
                &keys::few_shots(profile, unit),
                keys::TYPE_FEWSHOTS,
                &data,
                Utc::now().timestamp_millis(),
            )
        })
    }

    /// Load up to `limit` few-shots for (profile, unit).
    ///
    /// The limit is required: a doubled unit holds ten examples, and a
    /// caller passing a lazy default of five would silently truncate it.
    pub fn get_few_shots(&self, profile: &str, unit: &str, limit: usize) -> Result<Vec<FewShot>> {
        let data = self.with_conn(|conn| get_data(conn, &keys::few_shots(profile, unit)))?;
        let mut examples: Vec<FewShot> = match data {
            Some(d) => serde_json::from_str(&d)?,
            None => Vec::new(),
        };
        examples.truncate(limit);
        Ok(examples)
    }

    pub fn save_learning_unit(&self, unit: &LearningUnit) -> Result<()> {
        let data = serde_json::to_string(unit)?;
        self.with_conn(|conn| {
            put_record(
                conn,
                &keys::learning_unit(&unit.profile, &unit.unit_id),
                keys::TYPE_LEARNING_UNIT,
                &data,
                Utc::now().timestamp_millis(),
            )
        })
    }

    pub fn get_learning_unit(&self, profile: &str, unit: &str) -> Result<Option<LearningUnit>> {
        let data = self.with_conn(|conn| get_data(conn, &keys::learning_unit(profile, unit)))?;
        data.map(|d| serde_json::from_str(&d).map_err(Error::from))
            .transpose()
    }

    pub fn save_hierarchy(
        &self,
        profile: &str,
        unit: &str,
        hierarchy: &AbstractionHierarchy,
    ) -> Result<()> {
        let data = serde_json::to_string(hierarchy)?;
        self.with_conn(|conn| {
            put_record(
                conn,
                &keys::hierarchy(profile, unit),
                keys::TYPE_HIERARCHY,
                &data,
                Utc::now().timestamp_millis(),
            )
        })
    }

    pub fn get_hierarchy(
        &self,
        profile: &str,
        unit: &str,
    ) -> Result<Option<AbstractionHierarchy>> {
        let data = self.with_conn(|conn| get_data(conn, &keys::hierarchy(profile, unit)))?;
        data.map(|d| serde_json::from_str(&d).map_err(Error::from))
            .transpose()
    }

    /// Atomically persist a consolidation run: the updated unit record, its
    /// few-shot bundle and hierarchy, and the absorb marks commit together
    /// or not at all. A failure leaves the unit exactly as it was.
    pub fn persist_consolidation(
        &self,
        unit: &LearningUnit,
        few_shots: &[FewShot],
        few_shot_limit: usize,
        hierarchy: &AbstractionHierarchy,
        absorbed_ids: &[String],
        preserve_originals: bool,
    ) -> Result<usize> {
        if few_shots.len() > few_shot_limit {
            return Err(Error::store(format!(
                "few-shot bundle of {} exceeds the unit limit of {few_shot_limit}",
                few_shots.len()
            )));
        }
        let now = Utc::now().timestamp_millis();
        let absorbed = self.with_tx(|conn| {
            put_record(
                conn,
                &keys::learning_unit(&unit.profile, &unit.unit_id),
                keys::TYPE_LEARNING_UNIT,
                &serde_json::to_string(unit)?,
                now,
            )
            .map_err(Error::from)?;
            put_record(
                conn,
                &keys::few_shots(&unit.profile, &unit.unit_id),
                keys::TYPE_FEWSHOTS,
                &serde_json::to_string(few_shots)?,
                now,
            )
            .map_err(Error::from)?;
            put_record(
                conn,
                &keys::hierarchy(&unit.profile, &unit.unit_id),
                keys::TYPE_HIERARCHY,
                &serde_json::to_string(hierarchy)?,
                now,
            )
            .map_err(Error::from)?;
            absorb_in_tx(
                conn,
                &unit.unit_id,
                absorbed_ids,
                preserve_originals,
                unit.metadata.version,
            )
        })?;
        debug!(
            unit = %unit.unit_id,
            version = unit.metadata.version,
            absorbed,
            "consolidation persisted"
        );
        Ok(absorbed)
    }

    // ==================== Inspection ====================

    /// Reasoning-trajectory steps for a session, in move order.
    pub fn trajectory(&self, session_id: &str) -> Result<Vec<TrajectoryStep>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT step_index, action, reasoning, outcome, feedback
                 FROM trajectory_steps WHERE trajectory_id = ?1
                 ORDER BY step_index ASC",
            )?;
            let steps = stmt
                .query_map(params![session_id], |row| {
                    Ok(TrajectoryStep {
                        trajectory_id: session_id.to_string(),
                        step_index: row.get::<_, i64>(0)? as u32,
                        action: row.get(1)?,
                        reasoning: row.get(2)?,
                        outcome: row.get(3)?,
                        feedback: row.get(4)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(steps)
        })
    }

    /// Record counts by type.
    pub fn stats(&self) -> Result<StoreStats> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT type, COUNT(*) FROM metadata GROUP BY type")?;
            let by_type: HashMap<String, u64> = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(StoreStats { by_type })
        })
    }
}

/// One reasoning-trajectory step.
#[derive(Debug, Clone)]
pub struct TrajectoryStep {
    pub trajectory_id: String,
    pub step_index: u32,
    pub action: String,
    pub reasoning: Option<String>,
    pub outcome: Option<String>,
    pub feedback: Option<String>,
}

/// Record counts by type.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub by_type: HashMap<String, u64>,
}

fn put_record(
    conn: &Connection,
    key: &str,
    record_type: &str,
    data: &str,
    timestamp: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, type, data, timestamp) VALUES (?1, ?2, ?3, ?4)",
        params![key, record_type, data, timestamp],
    )?;
    Ok(())
}

fn get_data(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT data FROM metadata WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

fn delete_record(conn: &Connection, key: &str) -> rusqlite::Result<bool> {
    let rows = conn.execute("DELETE FROM metadata WHERE key = ?1", params![key])?;
    Ok(rows > 0)
}

fn absorb_in_tx(
    conn: &Connection,
    unit: &str,
    ids: &[String],
    preserve_originals: bool,
    unit_version: u32,
) -> Result<usize> {
    let mut absorbed = 0;
    for id in ids {
        let key = keys::experience(id);
        let Some(data) = get_data(conn, &key).map_err(Error::from)? else {
            continue;
        };
        let exp: Experience = serde_json::from_str(&data)?;
        let bound = exp.bound_copy(unit, unit_version);
        put_record(
            conn,
            &keys::unit_experience(unit, id),
            keys::TYPE_UNIT_EXPERIENCE,
            &serde_json::to_string(&bound)?,
            bound.timestamp.timestamp_millis(),
        )
        .map_err(Error::from)?;
        if !preserve_originals {
            delete_record(conn, &key).map_err(Error::from)?;
        }
        absorbed += 1;
    }
    Ok(absorbed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience::tests::sample_experience;
    use pretty_assertions::assert_eq;

    fn seed(store: &ExperienceStore, profile: &str, count: u32) -> Vec<String> {
        (1..=count)
            .map(|i| {
                let exp = sample_experience(profile, "s1", i);
                store.save_experience(&exp).unwrap();
                exp.id
            })
            .collect()
    }

    #[test]
    fn test_open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiences.db");

        let exp = sample_experience("default", "s1", 1);
        {
            let store = ExperienceStore::open(&path).unwrap();
            store.save_experience(&exp).unwrap();
        }

        // Reopening takes the already-initialized branch and sees the data.
        let store = ExperienceStore::open(&path).unwrap();
        let back = store.get_experience(&exp.id).unwrap().unwrap();
        assert_eq!(back.id, exp.id);
        assert_eq!(store.get_unconsolidated("default").unwrap().len(), 1);
        assert_eq!(store.trajectory("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_save_and_get_round_trip() {
        let store = ExperienceStore::in_memory().unwrap();
        let exp = sample_experience("default", "s1", 1);
        store.save_experience(&exp).unwrap();
        // Idempotent by id.
        store.save_experience(&exp).unwrap();

        let back = store.get_experience(&exp.id).unwrap().unwrap();
        assert_eq!(back.id, exp.id);
        assert_eq!(back.mv, exp.mv);

        let steps = store.trajectory("s1").unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].outcome.as_deref(), Some("correct"));
    }

    #[test]
    fn test_unconsolidated_filters_by_profile_and_flag() {
        let store = ExperienceStore::in_memory().unwrap();
        let ids = seed(&store, "alpha", 3);
        seed(&store, "beta", 2);

        assert_eq!(store.get_unconsolidated("alpha").unwrap().len(), 3);
        assert_eq!(store.get_unconsolidated("beta").unwrap().len(), 2);

        store.mark_consolidated(&ids[..1]).unwrap();
        assert_eq!(store.get_unconsolidated("alpha").unwrap().len(), 2);
        // The flagged record still exists.
        assert!(store.get_experience(&ids[0]).unwrap().unwrap().consolidated);
    }

    #[test]
    fn test_mark_absorbed_deletes_globals_by_default() {
        let store = ExperienceStore::in_memory().unwrap();
        let ids = seed(&store, "default", 3);

        let absorbed = store.mark_absorbed("unit-a", &ids, false, 1).unwrap();
        assert_eq!(absorbed, 3);
        assert!(store.get_experience(&ids[0]).unwrap().is_none());

        let bound = store.unit_experiences("unit-a").unwrap();
        assert_eq!(bound.len(), 3);
        assert!(bound.iter().all(|e| e.bound_to_unit.as_deref() == Some("unit-a")));
        assert!(bound.iter().all(|e| e.unit_version == Some(1)));
    }

    #[test]
    fn test_mark_absorbed_preserving_leaves_pool_unchanged() {
        let store = ExperienceStore::in_memory().unwrap();
        let ids = seed(&store, "default", 4);

        store.mark_absorbed("unit-a", &ids, true, 1).unwrap();
        store.mark_absorbed("unit-b", &ids, true, 1).unwrap();

        // Both units hold independent copies; the global pool is untouched.
        assert_eq!(store.unit_experiences("unit-a").unwrap().len(), 4);
        assert_eq!(store.unit_experiences("unit-b").unwrap().len(), 4);
        assert_eq!(store.get_unconsolidated("default").unwrap().len(), 4);

        // A third run without preservation consumes the globals.
        store.mark_absorbed("unit-c", &ids, false, 1).unwrap();
        assert_eq!(store.get_unconsolidated("default").unwrap().len(), 0);
    }

    #[test]
    fn test_unconsolidate_restores_globals() {
        let store = ExperienceStore::in_memory().unwrap();
        let ids = seed(&store, "default", 3);
        store.mark_absorbed("unit-a", &ids, false, 2).unwrap();
        assert!(store.get_unconsolidated("default").unwrap().is_empty());

        let restored = store.unconsolidate("unit-a").unwrap();
        assert_eq!(restored, 3);

        let globals = store.get_unconsolidated("default").unwrap();
        assert_eq!(globals.len(), 3);
        for exp in globals {
            assert!(!exp.consolidated);
            assert!(exp.bound_to_unit.is_none());
            assert!(exp.bound_at.is_none());
            assert!(exp.unit_version.is_none());
        }
    }

    #[test]
    fn test_clone_unit_copies_everything() {
        let store = ExperienceStore::in_memory().unwrap();
        let ids = seed(&store, "default", 2);
        store.mark_absorbed("unit-a", &ids, false, 1).unwrap();

        let mut unit = LearningUnit::new("unit-a", "default");
        unit.absorbed_experience_ids = ids.clone();
        unit.metadata.version = 1;
        store.save_learning_unit(&unit).unwrap();

        let few_shots = vec![FewShot {
            situation: "s".into(),
            analysis: "a".into(),
            aisp: None,
            example_move: crate::board::Move::new(1, 1, 1, ""),
            outcome: crate::board::ValidationOutcome::Correct,
            strategy_name: Some("naked single".into()),
            abstraction_level: 0,
        }];
        store.save_few_shots("default", "unit-a", &few_shots).unwrap();
        let hierarchy = AbstractionHierarchy {
            techniques: vec!["scanning".into()],
            ..AbstractionHierarchy::default()
        };
        store.save_hierarchy("default", "unit-a", &hierarchy).unwrap();

        store.clone_unit("default", "unit-a", "unit-b").unwrap();

        let cloned = store.get_learning_unit("default", "unit-b").unwrap().unwrap();
        assert_eq!(cloned.unit_id, "unit-b");
        assert!(cloned.name.ends_with("(clone)"));
        assert_eq!(cloned.absorbed_experience_ids, ids);

        let cloned_shots = store.get_few_shots("default", "unit-b", 10).unwrap();
        assert_eq!(cloned_shots, few_shots);
        let cloned_hierarchy = store.get_hierarchy("default", "unit-b").unwrap().unwrap();
        assert_eq!(cloned_hierarchy, hierarchy);

        let bound = store.unit_experiences("unit-b").unwrap();
        assert_eq!(bound.len(), 2);
        assert!(bound.iter().all(|e| e.bound_to_unit.as_deref() == Some("unit-b")));
    }

    #[test]
    fn test_clone_requires_source_and_fresh_target() {
        let store = ExperienceStore::in_memory().unwrap();
        assert!(store.clone_unit("default", "missing", "unit-b").is_err());

        let unit = LearningUnit::new("unit-a", "default");
        store.save_learning_unit(&unit).unwrap();
        store.clone_unit("default", "unit-a", "unit-b").unwrap();
        assert!(store.clone_unit("default", "unit-a", "unit-b").is_err());
    }

    #[test]
    fn test_few_shot_limit_truncates() {
        let store = ExperienceStore::in_memory().unwrap();
        let shots: Vec<FewShot> = (0..10)
            .map(|i| FewShot {
                situation: format!("s{i}"),
                analysis: "a".into(),
                aisp: None,
                example_move: crate::board::Move::new(1, 1, 1, ""),
                outcome: crate::board::ValidationOutcome::Correct,
                strategy_name: None,
                abstraction_level: 0,
            })
            .collect();
        store.save_few_shots("default", "doubled", &shots).unwrap();

        // A doubled unit read with a lazy limit of 5 silently loses half
        // its bundle; callers must pass the unit's real budget.
        assert_eq!(store.get_few_shots("default", "doubled", 5).unwrap().len(), 5);
        assert_eq!(store.get_few_shots("default", "doubled", 10).unwrap().len(), 10);
    }

    #[test]
    fn test_persist_consolidation_is_atomic() {
        let store = ExperienceStore::in_memory().unwrap();
        let ids = seed(&store, "default", 2);

        let mut unit = LearningUnit::new("unit-a", "default");
        unit.metadata.version = 1;
        store.save_learning_unit(&unit).unwrap();
        let before_shots = vec![FewShot {
            situation: "original".into(),
            analysis: "a".into(),
            aisp: None,
            example_move: crate::board::Move::new(1, 1, 1, ""),
            outcome: crate::board::ValidationOutcome::Correct,
            strategy_name: None,
            abstraction_level: 0,
        }];
        store.save_few_shots("default", "unit-a", &before_shots).unwrap();

        // An oversized bundle must fail without touching anything.
        let mut updated = unit.clone();
        updated.metadata.version = 2;
        let oversized: Vec<FewShot> = (0..7).map(|_| before_shots[0].clone()).collect();
        let err = store.persist_consolidation(
            &updated,
            &oversized,
            5,
            &AbstractionHierarchy::default(),
            &ids,
            false,
        );
        assert!(err.is_err());

        let unit_after = store.get_learning_unit("default", "unit-a").unwrap().unwrap();
        assert_eq!(unit_after.metadata.version, 1);
        assert_eq!(
            store.get_few_shots("default", "unit-a", 10).unwrap(),
            before_shots
        );
        assert_eq!(store.get_unconsolidated("default").unwrap().len(), 2);
        assert!(store.unit_experiences("unit-a").unwrap().is_empty());
    }

    #[test]
    fn test_stats_counts_by_type() {
        let store = ExperienceStore::in_memory().unwrap();
        seed(&store, "default", 3);
        store
            .save_learning_unit(&LearningUnit::new("unit-a", "default"))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.by_type.get(keys::TYPE_EXPERIENCE), Some(&3));
        assert_eq!(stats.by_type.get(keys::TYPE_LEARNING_UNIT), Some(&1));
    }
}
