//! Schema migrations for the execution state tables

use sqlx::{PgPool, Row};
use tracing::info;

use crate::{InfraError, Result};

/// A versioned schema change
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_workflow_states",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS workflow_states (
                workflow_exec_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                input JSONB NOT NULL DEFAULT '{}'::jsonb,
                output JSONB,
                error JSONB,
                tasks JSONB NOT NULL DEFAULT '{}'::jsonb,
                current_task_id TEXT,
                current_task_exec_id TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_workflow_states_workflow_status ON workflow_states(workflow_id, status)",
        ],
    },
    Migration {
        version: 2,
        name: "create_task_states",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS task_states (
                task_exec_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                workflow_exec_id TEXT NOT NULL
                    REFERENCES workflow_states(workflow_exec_id) ON DELETE CASCADE,
                workflow_id TEXT NOT NULL,
                component TEXT NOT NULL,
                status TEXT NOT NULL,
                execution_type TEXT NOT NULL,
                parent_state_id TEXT REFERENCES task_states(task_exec_id) ON DELETE CASCADE,
                agent_id TEXT,
                tool_id TEXT,
                action_id TEXT,
                input JSONB,
                output JSONB,
                error JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_task_states_workflow_exec ON task_states(workflow_exec_id)",
            "CREATE INDEX IF NOT EXISTS idx_task_states_exec_task ON task_states(workflow_exec_id, task_id)",
            "CREATE INDEX IF NOT EXISTS idx_task_states_parent ON task_states(parent_state_id)",
        ],
    },
];

const CREATE_LEDGER: &str = r#"
CREATE TABLE IF NOT EXISTS weft_schema_migrations (
    version BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// Apply every migration not yet recorded in the ledger table
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(CREATE_LEDGER)
        .execute(pool)
        .await
        .map_err(|e| InfraError::Migration(e.to_string()))?;

    let applied: Vec<i64> = sqlx::query("SELECT version FROM weft_schema_migrations")
        .fetch_all(pool)
        .await
        .map_err(|e| InfraError::Migration(e.to_string()))?
        .iter()
        .map(|row| row.try_get::<i64, _>("version"))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| InfraError::Migration(e.to_string()))?;

    for migration in pending(&applied) {
        let mut tx = pool.begin().await?;
        for stmt in migration.statements {
            sqlx::query(stmt)
                .execute(&mut *tx)
                .await
                .map_err(|e| InfraError::Migration(format!("{}: {}", migration.name, e)))?;
        }
        sqlx::query("INSERT INTO weft_schema_migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(version = migration.version, name = migration.name, "Applied migration");
    }

    Ok(())
}

fn pending(applied: &[i64]) -> impl Iterator<Item = &'static Migration> + '_ {
    MIGRATIONS.iter().filter(move |m| !applied.contains(&m.version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_strictly_increase() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_pending_skips_applied() {
        let remaining: Vec<_> = pending(&[1]).map(|m| m.name).collect();
        assert_eq!(remaining, vec!["create_task_states"]);
        assert_eq!(pending(&[]).count(), MIGRATIONS.len());
    }

    #[test]
    fn test_required_indexes_present() {
        let all: String = MIGRATIONS
            .iter()
            .flat_map(|m| m.statements.iter())
            .copied()
            .collect();
        assert!(all.contains("(workflow_id, status)"));
        assert!(all.contains("(workflow_exec_id, task_id)"));
        assert!(all.contains("(parent_state_id)"));
        assert!(all.contains("ON DELETE CASCADE"));
    }
}
