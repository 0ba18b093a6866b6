//! SQLite workflow definition store.
//!
//! Definitions are stored as JSON blobs keyed by workflow name. Saving a
//! definition under an existing name replaces it; tasks keep the hash of the
//! version they were created from.

use chrono::Utc;
use conveyor_core::repository::definition::DefinitionStore;
use conveyor_core::workflow::definition::definition_hash;
use conveyor_types::definition::WorkflowDefinition;
use conveyor_types::error::RepositoryError;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `DefinitionStore`.
pub struct SqliteDefinitionStore {
    pool: DatabasePool,
}

impl SqliteDefinitionStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct DefinitionRow {
    definition: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
    }
}

impl DefinitionStore for SqliteDefinitionStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;
        let hash = definition_hash(def).map_err(|e| RepositoryError::Query(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"INSERT INTO workflow_definitions (name, project, definition, hash, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 project = excluded.project,
                 definition = excluded.definition,
                 hash = excluded.hash,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&def.name)
        .bind(&def.project)
        .bind(&definition_json)
        .bind(&hash)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(workflow = def.name.as_str(), hash = hash.as_str(), "definition saved");
        Ok(())
    }

    async fn find_definition(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflow_definitions ORDER BY name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = DefinitionRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }
}

#[cfg(test)]
mod tests {
    use conveyor_core::workflow::definition::parse_definition_yaml;

    use super::*;

    const NIGHTLY: &str = r#"
name: nightly
project: shop
stages:
  - name: test
    jobs:
      - name: unit
        spec:
          type: freestyle
          script: cargo test
"#;

    async fn store() -> (tempfile::TempDir, SqliteDefinitionStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("defs.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteDefinitionStore::new(pool))
    }

    #[tokio::test]
    async fn save_then_find() {
        let (_dir, store) = store().await;
        let def = parse_definition_yaml(NIGHTLY).unwrap();
        store.save_definition(&def).await.unwrap();

        let found = store.find_definition("nightly").await.unwrap().unwrap();
        assert_eq!(found, def);
        assert!(store.find_definition("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saving_again_replaces_the_definition() {
        let (_dir, store) = store().await;
        let mut def = parse_definition_yaml(NIGHTLY).unwrap();
        store.save_definition(&def).await.unwrap();

        def.version = "2".to_string();
        store.save_definition(&def).await.unwrap();

        let all = store.list_definitions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].version, "2");

        let hash: (String,) = sqlx::query_as("SELECT hash FROM workflow_definitions WHERE name = 'nightly'")
            .fetch_one(&store.pool.reader)
            .await
            .unwrap();
        assert_eq!(hash.0, definition_hash(&def).unwrap());
    }

    #[tokio::test]
    async fn list_is_sorted_by_name() {
        let (_dir, store) = store().await;
        for name in ["zeta", "alpha", "nightly"] {
            let mut def = parse_definition_yaml(NIGHTLY).unwrap();
            def.name = name.to_string();
            store.save_definition(&def).await.unwrap();
        }
        let names: Vec<String> = store
            .list_definitions()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["alpha", "nightly", "zeta"]);
    }
}
