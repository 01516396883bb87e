//! Metric writer: persists one validated report as an idempotent multi-table
//! upsert. Class rows are written before the global row so a concurrent
//! reader can never observe a global bucket whose class rows are missing.

use std::sync::Arc;

use chrono::Utc;
use query_info::{Mini, QueryInfo};
use sqlx::sqlite::SqliteQueryResult;
use sqlx::SqlitePool;

use crate::database::instances::InstanceRegistry;
use crate::errors::{QanError, QanResult};
use crate::metrics::catalog::{
    MetricKind, INSERT_CLASS_METRICS, INSERT_GLOBAL_METRICS, METRICS, STAT_NAMES,
};
use crate::proto::{Class, Metrics, Report, UserSource, SUBSYSTEM_MYSQL};

pub struct MetricWriter {
    pool: SqlitePool,
    registry: InstanceRegistry,
    mini: Arc<Mini>,
}

impl MetricWriter {
    pub fn new(pool: SqlitePool, registry: InstanceRegistry, mini: Arc<Mini>) -> Self {
        Self {
            pool,
            registry,
            mini,
        }
    }

    pub async fn write(&self, report: &Report) -> QanResult<()> {
        let (instance_id, instance) = self.registry.get(&report.uuid).await?;

        let global = report
            .global
            .as_ref()
            .ok_or_else(|| QanError::bad_data("missing report.Global"))?;
        let global_metrics = global
            .metrics
            .as_ref()
            .ok_or_else(|| QanError::bad_data("missing report.Global.Metrics"))?;

        let report_start_ts = report.start_ts.map(|t| t.timestamp());
        let report_end_ts = report.end_ts.map(|t| t.timestamp());

        // ------------------------------------------------------------------
        // Class metrics
        // ------------------------------------------------------------------
        for class in &report.class {
            let last_seen = class
                .example
                .as_ref()
                .and_then(|e| e.ts_unix())
                .or(report_start_ts)
                .or_else(|| class.start_at.map(|t| t.timestamp()))
                .unwrap_or_else(|| Utc::now().timestamp());

            let id = match self.class_id(&class.id).await {
                Ok(id) => id,
                Err(QanError::NotFound) => 0,
                Err(err) => {
                    tracing::warn!(checksum = %class.id, error = %err,
                        "cannot get query class id, skipping");
                    continue;
                }
            };
            let class_exists = id != 0;

            let (mut id, example_updated) = match self
                .handle_class(id, instance_id, &instance.subsystem, class, last_seen)
                .await
            {
                Ok(v) => v,
                Err(_) => continue,
            };

            if class_exists {
                // Re-parse tables/procedures only when the example changed so
                // the class row stays in sync with query_examples.
                let mut info = QueryInfo::default();
                if instance.subsystem == SUBSYSTEM_MYSQL && example_updated {
                    match self.get_query(class).await {
                        Ok(q) => info = q,
                        Err(err) => {
                            tracing::warn!(error = %err, "cannot parse query to update")
                        }
                    }
                }

                let updated = if example_updated {
                    self.update_query_class(
                        id,
                        last_seen,
                        &info.tables_json(),
                        &info.procedures_json(),
                    )
                    .await
                } else {
                    self.update_query_class_seen(id, last_seen).await
                };

                match updated {
                    // The class vanished mid-report (purge task racing us):
                    // re-create it and carry on.
                    Err(QanError::NotFound) => {
                        match self
                            .handle_class(0, instance_id, &instance.subsystem, class, last_seen)
                            .await
                        {
                            Ok((new_id, _)) => id = new_id,
                            Err(_) => continue,
                        }
                    }
                    Err(err) => {
                        tracing::warn!(checksum = %class.id, error = %err,
                            "cannot update query class, skipping");
                        continue;
                    }
                    Ok(()) => {}
                }
            }

            let start_ts = report_start_ts
                .or_else(|| class.start_at.map(|t| t.timestamp()))
                .unwrap_or(last_seen);
            let end_ts = report_end_ts
                .or_else(|| class.end_at.map(|t| t.timestamp()))
                .unwrap_or(start_ts);

            let mut query = sqlx::query(&INSERT_CLASS_METRICS)
                .bind(id)
                .bind(instance_id)
                .bind(start_ts)
                .bind(end_ts)
                .bind(class.total_queries)
                .bind(0i64); // lrq_count
            for value in metric_values(class.metrics.as_ref()) {
                query = query.bind(value);
            }
            if let Err(err) = query.execute(&self.pool).await {
                tracing::warn!(checksum = %class.id, error = %err,
                    "cannot upsert query class metrics");
            }
        }

        // ------------------------------------------------------------------
        // Global metrics, strictly after the class rows. Readers resolve a
        // profile global-bucket-first; writing global first would let them
        // see a time range with no classes in it.
        // ------------------------------------------------------------------
        let (rate_type, rate_limit) = if report.rate_limit > 1 {
            (Some("query"), Some(report.rate_limit))
        } else {
            (None, None)
        };

        let (log_file, log_file_size, start_offset, end_offset, stop_offset) =
            if report.slow_log_file.is_empty() {
                (None, None, None, None, None)
            } else {
                (
                    Some(report.slow_log_file.as_str()),
                    Some(report.slow_log_file_size),
                    Some(report.start_offset),
                    Some(report.end_offset),
                    Some(report.stop_offset),
                )
            };

        let start_ts = report_start_ts
            .or_else(|| global.start_at.map(|t| t.timestamp()))
            .unwrap_or_else(|| Utc::now().timestamp());
        let end_ts = report_end_ts
            .or_else(|| global.end_at.map(|t| t.timestamp()))
            .unwrap_or(start_ts);

        let mut query = sqlx::query(&INSERT_GLOBAL_METRICS)
            .bind(instance_id)
            .bind(start_ts)
            .bind(end_ts)
            .bind(report.run_time)
            .bind(global.total_queries)
            .bind(global.unique_queries)
            .bind(rate_type)
            .bind(rate_limit)
            .bind(log_file)
            .bind(log_file_size)
            .bind(start_offset)
            .bind(end_offset)
            .bind(stop_offset);
        for value in metric_values(Some(global_metrics)) {
            query = query.bind(value);
        }
        query.execute(&self.pool).await?;

        Ok(())
    }

    async fn class_id(&self, checksum: &str) -> QanResult<i64> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT query_class_id FROM query_classes WHERE checksum = ?")
                .bind(checksum)
                .fetch_optional(&self.pool)
                .await?;
        id.ok_or(QanError::NotFound)
    }

    /// Ensure the class row exists (creating it when `id == 0`), then apply
    /// the example and user sources. Returns the class id and whether the
    /// stored example was inserted or beaten.
    async fn handle_class(
        &self,
        id: i64,
        instance_id: i64,
        subsystem: &str,
        class: &Class,
        last_seen: i64,
    ) -> QanResult<(i64, bool)> {
        let id = if id == 0 {
            match self.new_class(subsystem, class, last_seen).await {
                Ok(id) => id,
                Err(err) => {
                    tracing::warn!(checksum = %class.id, error = %err,
                        "cannot create new query class, skipping");
                    return Err(err);
                }
            }
        } else {
            id
        };

        let mut example_updated = false;
        if let Some(example) = &class.example {
            if !example.query.is_empty() {
                match self
                    .upsert_example(instance_id, id, class, last_seen)
                    .await
                {
                    Ok(result) => example_updated = result.rows_affected() > 0,
                    Err(err) => {
                        tracing::warn!(checksum = %class.id, error = %err,
                            "cannot update query example")
                    }
                }
            }
        }

        for source in &class.user_sources {
            if let Err(err) = self.insert_user_source(id, instance_id, source).await {
                tracing::warn!(user = %source.user, host = %source.host, error = %err,
                    "cannot insert query user source");
            }
        }

        Ok((id, example_updated))
    }

    async fn new_class(&self, subsystem: &str, class: &Class, last_seen: i64) -> QanResult<i64> {
        let info = if subsystem == SUBSYSTEM_MYSQL {
            match self.get_query(class).await {
                Ok(info) => info,
                Err(err) => {
                    // Unclassifiable query: store it with no tables known
                    // rather than dropping the class.
                    tracing::warn!(checksum = %class.id, error = %err,
                        "cannot classify new query");
                    QueryInfo {
                        fingerprint: class.fingerprint.clone(),
                        ..QueryInfo::default()
                    }
                }
            }
        } else {
            // Mongo fingerprints are already human-readable; no SQL to parse.
            QueryInfo {
                fingerprint: class.fingerprint.clone(),
                abstract_: class.fingerprint.clone(),
                ..QueryInfo::default()
            }
        };

        let result = sqlx::query(
            "INSERT INTO query_classes \
             (checksum, abstract, fingerprint, tables, procedures, first_seen, last_seen) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&class.id)
        .bind(&info.abstract_)
        .bind(&info.fingerprint)
        .bind(info.tables_json())
        .bind(info.procedures_json())
        .bind(last_seen)
        .bind(last_seen)
        .execute(&self.pool)
        .await;

        match result {
            Ok(result) => Ok(result.last_insert_rowid()),
            Err(err) => {
                let err = QanError::from(err);
                if err.is_duplicate_key() {
                    // Another writer inserted the same class; use its id.
                    self.class_id(&class.id).await
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn get_query(&self, class: &Class) -> QanResult<QueryInfo> {
        if class.fingerprint.len() < 2 {
            return Err(QanError::bad_data("empty fingerprint"));
        }
        let (example, db) = match &class.example {
            Some(example) if !example.query.is_empty() => {
                (example.query.as_str(), example.db.as_str())
            }
            Some(example) => ("", example.db.as_str()),
            None => ("", ""),
        };
        Ok(self.mini.parse(&class.fingerprint, example, db).await?)
    }

    // first_seen/last_seen move with LEAST/GREATEST because agents deliver
    // out of order: the first report to arrive is not necessarily the oldest.
    async fn update_query_class(
        &self,
        class_id: i64,
        last_seen: i64,
        tables: &str,
        procedures: &str,
    ) -> QanResult<()> {
        let result = sqlx::query(
            "UPDATE query_classes SET \
             first_seen = MIN(first_seen, ?), last_seen = MAX(last_seen, ?), \
             tables = ?, procedures = ? \
             WHERE query_class_id = ?",
        )
        .bind(last_seen)
        .bind(last_seen)
        .bind(tables)
        .bind(procedures)
        .bind(class_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QanError::NotFound);
        }
        Ok(())
    }

    async fn update_query_class_seen(&self, class_id: i64, last_seen: i64) -> QanResult<()> {
        let result = sqlx::query(
            "UPDATE query_classes SET \
             first_seen = MIN(first_seen, ?), last_seen = MAX(last_seen, ?) \
             WHERE query_class_id = ?",
        )
        .bind(last_seen)
        .bind(last_seen)
        .bind(class_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QanError::NotFound);
        }
        Ok(())
    }

    /// Keyed by (instance, class, day); the stored example always has the
    /// greatest query_time seen that day.
    async fn upsert_example(
        &self,
        instance_id: i64,
        class_id: i64,
        class: &Class,
        last_seen: i64,
    ) -> QanResult<SqliteQueryResult> {
        let example = class
            .example
            .as_ref()
            .ok_or_else(|| QanError::bad_data("missing example"))?;
        Ok(sqlx::query(
            "INSERT INTO query_examples \
             (instance_id, query_class_id, period, ts, db, query_time, query, \"explain\") \
             VALUES (?, ?, date(?, 'unixepoch'), ?, ?, ?, ?, ?) \
             ON CONFLICT(instance_id, query_class_id, period) DO UPDATE SET \
               query = excluded.query, \
               ts = excluded.ts, \
               db = excluded.db, \
               query_time = excluded.query_time \
             WHERE excluded.query_time > COALESCE(query_time, 0)",
        )
        .bind(instance_id)
        .bind(class_id)
        .bind(last_seen)
        .bind(last_seen)
        .bind(&example.db)
        .bind(example.query_time)
        .bind(&example.query)
        .bind(&example.explain)
        .execute(&self.pool)
        .await?)
    }

    async fn insert_user_source(
        &self,
        class_id: i64,
        instance_id: i64,
        source: &UserSource,
    ) -> QanResult<()> {
        sqlx::query("INSERT OR IGNORE INTO user_classes (user, host) VALUES (?, ?)")
            .bind(&source.user)
            .bind(&source.host)
            .execute(&self.pool)
            .await?;

        // Counts add up across reports; ts keeps the earliest stored value.
        sqlx::query(
            "INSERT INTO query_user_sources \
             (query_class_id, instance_id, user_class_id, ts, count) \
             VALUES (?, ?, (SELECT id FROM user_classes WHERE user = ? AND host = ?), ?, ?) \
             ON CONFLICT(query_class_id, instance_id, user_class_id) DO UPDATE SET \
               count = count + excluded.count",
        )
        .bind(class_id)
        .bind(instance_id)
        .bind(&source.user)
        .bind(&source.host)
        .bind(source.ts.map(|t| t.timestamp()))
        .bind(source.count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Flatten report metrics into the catalog's column order. Missing metrics
/// bind NULL so the upsert arithmetic can coalesce around them.
fn metric_values(metrics: Option<&Metrics>) -> Vec<Option<f64>> {
    let mut values = Vec::new();
    for spec in METRICS {
        match spec.kind {
            MetricKind::Counter => {
                let sum = metrics
                    .and_then(|m| m.bool_metrics.get(spec.name))
                    .and_then(|s| s.sum);
                values.push(sum);
            }
            MetricKind::Microsecond | MetricKind::Number => {
                let stats = match spec.kind {
                    MetricKind::Microsecond => metrics.and_then(|m| m.time_metrics.get(spec.name)),
                    _ => metrics.and_then(|m| m.number_metrics.get(spec.name)),
                };
                for stat in STAT_NAMES {
                    values.push(stats.and_then(|s| match *stat {
                        "sum" => s.sum,
                        "min" => s.min,
                        "max" => s.max,
                        "avg" => s.avg,
                        "med" => s.med,
                        "p95" => s.p95,
                        _ => None,
                    }));
                }
            }
        }
    }
    values
}
