//! Store schema. Fixed tables are declared inline; the two metrics tables
//! get their metric columns from the catalog so schema and writer can never
//! disagree on column order.

use sqlx::SqlitePool;

use crate::errors::QanResult;
use crate::metrics::catalog::METRIC_COLUMNS;

const FIXED_TABLES: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS instances (
    instance_id INTEGER PRIMARY KEY AUTOINCREMENT,
    subsystem_id INTEGER NOT NULL,
    parent_uuid TEXT NOT NULL DEFAULT '',
    uuid TEXT NOT NULL UNIQUE,
    dsn TEXT,
    name TEXT NOT NULL,
    distro TEXT,
    version TEXT,
    created INTEGER NOT NULL DEFAULT (strftime('%s','now')),
    deleted INTEGER
)"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_instances_name ON instances(subsystem_id, name, parent_uuid)
"#,
    r#"
CREATE TABLE IF NOT EXISTS query_classes (
    query_class_id INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum TEXT NOT NULL UNIQUE,
    abstract TEXT,
    fingerprint TEXT,
    tables TEXT,
    procedures TEXT,
    first_seen INTEGER,
    last_seen INTEGER,
    status TEXT NOT NULL DEFAULT 'new'
)"#,
    r#"
CREATE TABLE IF NOT EXISTS query_examples (
    instance_id INTEGER NOT NULL,
    query_class_id INTEGER NOT NULL,
    period TEXT NOT NULL,
    ts INTEGER,
    db TEXT,
    query_time REAL,
    query TEXT,
    "explain" TEXT,
    PRIMARY KEY (instance_id, query_class_id, period)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS user_classes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user TEXT NOT NULL,
    host TEXT NOT NULL,
    UNIQUE (user, host)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS query_user_sources (
    query_class_id INTEGER NOT NULL,
    instance_id INTEGER NOT NULL,
    user_class_id INTEGER NOT NULL,
    ts INTEGER,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (query_class_id, instance_id, user_class_id)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS agent_configs (
    agent_instance_id INTEGER NOT NULL,
    other_instance_id INTEGER NOT NULL,
    service TEXT NOT NULL,
    config TEXT,
    PRIMARY KEY (agent_instance_id, other_instance_id, service)
)"#,
];

fn metrics_columns_ddl() -> String {
    METRIC_COLUMNS
        .iter()
        .map(|c| format!("    {c} REAL"))
        .collect::<Vec<_>>()
        .join(",\n")
}

fn class_metrics_ddl() -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS query_class_metrics (
    query_class_id INTEGER NOT NULL,
    instance_id INTEGER NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER,
    query_count INTEGER,
    lrq_count INTEGER NOT NULL DEFAULT 0,
{},
    PRIMARY KEY (query_class_id, instance_id, start_ts)
)"#,
        metrics_columns_ddl()
    )
}

fn global_metrics_ddl() -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS query_global_metrics (
    instance_id INTEGER NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER,
    run_time REAL,
    total_query_count INTEGER,
    unique_query_count INTEGER,
    rate_type TEXT,
    rate_limit INTEGER,
    log_file TEXT,
    log_file_size INTEGER,
    start_offset INTEGER,
    end_offset INTEGER,
    stop_offset INTEGER,
{},
    PRIMARY KEY (instance_id, start_ts)
)"#,
        metrics_columns_ddl()
    )
}

/// Create all tables. Idempotent.
pub async fn initialize_schema(pool: &SqlitePool) -> QanResult<()> {
    for ddl in FIXED_TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    sqlx::query(&class_metrics_ddl()).execute(pool).await?;
    sqlx::query(&global_metrics_ddl()).execute(pool).await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_class_metrics_instance_ts \
         ON query_class_metrics(instance_id, start_ts)",
    )
    .execute(pool)
    .await?;
    tracing::debug!("store schema initialized");
    Ok(())
}
