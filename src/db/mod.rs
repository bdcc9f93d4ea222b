use crate::config::RuntimeConfig;
use crate::error::AppError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};

fn resolve_db_path(config: &RuntimeConfig) -> Result<PathBuf, AppError> {
    let path = PathBuf::from(config.db_filename.trim());
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn initialize_pool(config: &RuntimeConfig) -> Result<SqlitePool, AppError> {
    let db_path = resolve_db_path(config)?;
    tracing::debug!(path = %db_path.display(), "opening preferences database");
    initialize_pool_from_path(&db_path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeArgs;
    use crate::replay::persistence::get_replay_preferences;

    fn unique_db_path(label: &str) -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock should be after unix epoch")
            .as_nanos();

        std::env::temp_dir().join(format!("replay-dashboard-{label}-{timestamp}.db"))
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db_path = unique_db_path("migrations");

        let pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");

        run_migrations(&pool)
            .await
            .expect("running migrations multiple times should succeed");

        let metadata_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM app_metadata")
            .fetch_one(&pool)
            .await
            .expect("app_metadata table must exist and be queryable");

        assert_eq!(metadata_rows, 1);

        drop(pool);
        let _ = std::fs::remove_file(db_path);
    }

    #[tokio::test]
    async fn initializes_pool_at_configured_path() {
        let db_dir = unique_db_path("dir");
        let db_path = db_dir.join("nested").join("prefs.db");
        let config = RuntimeArgs {
            db_filename: Some(db_path.to_string_lossy().into_owned()),
            ..Default::default()
        }
        .normalize()
        .expect("config should be valid");

        let pool = initialize_pool(&config)
            .await
            .expect("pool should open at a nested path");
        get_replay_preferences(&pool)
            .await
            .expect("preferences table should be migrated");

        assert!(db_path.exists());

        drop(pool);
        let _ = std::fs::remove_dir_all(db_dir);
    }
}
