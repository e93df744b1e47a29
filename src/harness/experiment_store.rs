use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::harness::experiments::ExperimentDefinition;
use crate::util::{ensure_directory, now_utc_string};

/// File-backed store for user-defined experiments.
pub struct ExperimentStore {
    connection: Connection,
}

impl ExperimentStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            ensure_directory(parent)?;
        }
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open experiment store {}", path.display()))?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to set journal_mode=WAL")?;
        ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    /// Opens the store only when it already exists on disk.
    pub fn open_existing(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        Self::open(path).map(Some)
    }

    pub fn list(&self) -> Result<Vec<ExperimentDefinition>> {
        let mut statement = self.connection.prepare(
            "
            SELECT name, description, env_json, config_json
            FROM custom_experiments
            ORDER BY name ASC
            ",
        )?;

        let mut rows = statement.query([])?;
        let mut out = Vec::<ExperimentDefinition>::new();
        while let Some(row) = rows.next()? {
            out.push(decode_definition(
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
            )?);
        }
        Ok(out)
    }

    pub fn get(&self, name: &str) -> Result<Option<ExperimentDefinition>> {
        let row = self
            .connection
            .query_row(
                "
                SELECT name, description, env_json, config_json
                FROM custom_experiments
                WHERE name = ?1
                LIMIT 1
                ",
                [name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(name, description, env_json, config_json)| {
            decode_definition(name, description, env_json, config_json)
        })
        .transpose()
    }

    pub fn upsert(&self, definition: &ExperimentDefinition) -> Result<()> {
        let env_json = serde_json::to_string(&definition.env)?;
        let config_json = serde_json::to_string(&definition.config)?;
        self.connection.execute(
            "
            INSERT INTO custom_experiments(name, description, env_json, config_json, created_at)
            VALUES(?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(name) DO UPDATE SET
              description=excluded.description,
              env_json=excluded.env_json,
              config_json=excluded.config_json
            ",
            params![
                definition.name,
                definition.description,
                env_json,
                config_json,
                now_utc_string(),
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        let removed = self
            .connection
            .execute("DELETE FROM custom_experiments WHERE name = ?1", [name])?;
        Ok(removed > 0)
    }
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS custom_experiments (
              name TEXT PRIMARY KEY,
              description TEXT NOT NULL,
              env_json TEXT NOT NULL,
              config_json TEXT NOT NULL,
              created_at TEXT NOT NULL
            );
            ",
        )
        .context("failed to create experiment store schema")
}

fn decode_definition(
    name: String,
    description: String,
    env_json: String,
    config_json: String,
) -> Result<ExperimentDefinition> {
    let env = serde_json::from_str::<BTreeMap<String, String>>(&env_json)
        .with_context(|| format!("invalid env overrides stored for experiment {name}"))?;
    let config = serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&config_json)
        .with_context(|| format!("invalid config overrides stored for experiment {name}"))?;
    Ok(ExperimentDefinition {
        name,
        description,
        env,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str) -> ExperimentDefinition {
        ExperimentDefinition {
            name: name.to_string(),
            description: "raise amount tolerance".to_string(),
            env: BTreeMap::from([("AMOUNT_PARSER".to_string(), "v3".to_string())]),
            config: BTreeMap::from([("amount_window".to_string(), serde_json::json!(4))]),
        }
    }

    #[test]
    fn upsert_get_list_and_remove_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("experiments.sqlite");
        assert!(ExperimentStore::open_existing(&path).expect("lookup").is_none());

        let store = ExperimentStore::open(&path).expect("open store");
        store.upsert(&definition("zeta")).expect("insert zeta");
        store.upsert(&definition("alpha")).expect("insert alpha");

        let mut updated = definition("alpha");
        updated.description = "updated".to_string();
        store.upsert(&updated).expect("update alpha");

        let names = store
            .list()
            .expect("list")
            .into_iter()
            .map(|definition| definition.name)
            .collect::<Vec<String>>();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);

        let alpha = store.get("alpha").expect("get").expect("alpha exists");
        assert_eq!(alpha.description, "updated");
        assert_eq!(alpha.env["AMOUNT_PARSER"], "v3");
        assert_eq!(alpha.config["amount_window"], serde_json::json!(4));

        assert!(store.remove("zeta").expect("remove"));
        assert!(!store.remove("zeta").expect("remove again"));
        assert!(store.get("zeta").expect("get").is_none());
        drop(store);

        assert!(ExperimentStore::open_existing(&path).expect("reopen").is_some());
    }
}
