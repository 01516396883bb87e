//! Aggregation reader: metric-group detection, catalog-built aggregate
//! queries, sparkline gap filling, and the derived rate / ratio / share
//! computations served to the analytics API.

use std::collections::BTreeMap;

use sqlx::{Column, Row, SqlitePool};

use crate::errors::{QanError, QanResult};
use crate::metrics::catalog::{
    MetricKind, MetricSource, METRICS, PERCENT_OF_TOTAL, RATE_METRICS, SPARKLINE_METRICS,
    SPECIAL_METRICS, STAT_NAMES,
};

/// Fixed sparkline length.
pub const AMOUNT_OF_POINTS: i64 = 60;

/// Which metric families are present in a window. Selects the columns the
/// aggregate SQL references.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricGroup {
    pub basic: bool,
    pub percona_server: bool,
    pub performance_schema: bool,
    /// Aggregate across all classes of the instance instead of one class.
    pub server_summary: bool,
}

impl MetricGroup {
    fn includes(&self, source: MetricSource) -> bool {
        match source {
            MetricSource::Basic => self.basic,
            MetricSource::Extended => self.percona_server || self.performance_schema,
            MetricSource::PerconaServer => self.percona_server,
            MetricSource::PerformanceSchema => self.performance_schema,
        }
    }
}

pub type GeneralMetrics = BTreeMap<String, f64>;

/// One sparkline bucket; absent buckets surface as zero-valued points.
#[derive(Debug, Clone, Default)]
pub struct SparkPoint {
    pub point: i64,
    pub ts: i64,
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ClassMetrics {
    pub general: GeneralMetrics,
    pub percent_of_total: BTreeMap<String, f64>,
    pub rate: BTreeMap<String, f64>,
    pub special: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct GlobalMetrics {
    pub general: GeneralMetrics,
    pub rate: BTreeMap<String, f64>,
    pub special: BTreeMap<String, f64>,
}

#[derive(Clone)]
pub struct MetricsReader {
    pool: SqlitePool,
}

impl MetricsReader {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Metrics for one query class in a window, with per-class sparklines.
    pub async fn get_class_metrics(
        &self,
        class_id: i64,
        instance_id: i64,
        begin: i64,
        end: i64,
    ) -> QanResult<(ClassMetrics, Vec<SparkPoint>)> {
        let mut group = self.identify_metric_group(instance_id, begin, end).await?;

        let general = self
            .general_metrics(&group, Some(class_id), instance_id, begin, end)
            .await?;
        let sparks = self
            .sparklines(&group, Some(class_id), instance_id, begin, end)
            .await?;

        // Same window aggregated across all classes, for the share-of-total.
        group.server_summary = true;
        let global_general = self
            .general_metrics(&group, None, instance_id, begin, end)
            .await?;

        let metrics = ClassMetrics {
            percent_of_total: compute_of_total(&general, &global_general),
            rate: compute_rate_metrics(&general, begin, end),
            special: compute_special_metrics(&general),
            general,
        };
        Ok((metrics, sparks))
    }

    /// Whole-instance metrics in a window, with server-wide sparklines.
    pub async fn get_global_metrics(
        &self,
        instance_id: i64,
        begin: i64,
        end: i64,
    ) -> QanResult<(GlobalMetrics, Vec<SparkPoint>)> {
        let mut group = self.identify_metric_group(instance_id, begin, end).await?;
        group.server_summary = true;

        let general = self
            .general_metrics(&group, None, instance_id, begin, end)
            .await?;
        let sparks = self
            .sparklines(&group, None, instance_id, begin, end)
            .await?;

        let metrics = GlobalMetrics {
            rate: compute_rate_metrics(&general, begin, end),
            special: compute_special_metrics(&general),
            general,
        };
        Ok((metrics, sparks))
    }

    /// One probe query, three existence predicates. Errors_sum stands in for
    /// Performance Schema instrumentation; a window where that
    /// instrumentation is on but produced zero errors is mislabeled.
    async fn identify_metric_group(
        &self,
        instance_id: i64,
        begin: i64,
        end: i64,
    ) -> QanResult<MetricGroup> {
        const PROBE: &str = "SELECT \
            EXISTS(SELECT 1 FROM query_class_metrics \
                   WHERE instance_id = ? AND start_ts >= ? AND start_ts < ? \
                     AND Query_time_sum > 0) AS basic, \
            EXISTS(SELECT 1 FROM query_class_metrics \
                   WHERE instance_id = ? AND start_ts >= ? AND start_ts < ? \
                     AND Rows_affected_sum > 0) AS percona_server, \
            EXISTS(SELECT 1 FROM query_class_metrics \
                   WHERE instance_id = ? AND start_ts >= ? AND start_ts < ? \
                     AND Errors_sum > 0) AS performance_schema";

        let row = sqlx::query(PROBE)
            .bind(instance_id)
            .bind(begin)
            .bind(end)
            .bind(instance_id)
            .bind(begin)
            .bind(end)
            .bind(instance_id)
            .bind(begin)
            .bind(end)
            .fetch_one(&self.pool)
            .await?;

        Ok(MetricGroup {
            basic: row.get::<i64, _>("basic") != 0,
            percona_server: row.get::<i64, _>("percona_server") != 0,
            performance_schema: row.get::<i64, _>("performance_schema") != 0,
            server_summary: false,
        })
    }

    async fn general_metrics(
        &self,
        group: &MetricGroup,
        class_id: Option<i64>,
        instance_id: i64,
        begin: i64,
        end: i64,
    ) -> QanResult<GeneralMetrics> {
        let columns = select_columns(group);
        if columns.is_empty() {
            return Ok(GeneralMetrics::new());
        }

        let mut sql = format!("SELECT {} FROM query_class_metrics WHERE ", columns.join(", "));
        if !group.server_summary {
            sql.push_str("query_class_id = ? AND ");
        }
        sql.push_str("instance_id = ? AND start_ts >= ? AND start_ts < ?");

        let mut query = sqlx::query(&sql);
        if !group.server_summary {
            query = query.bind(class_id.unwrap_or_default());
        }
        let row = query
            .bind(instance_id)
            .bind(begin)
            .bind(end)
            .fetch_one(&self.pool)
            .await?;

        let mut metrics = GeneralMetrics::new();
        for column in row.columns() {
            let value: Option<f64> = row.try_get(column.name())?;
            metrics.insert(column.name().to_string(), value.unwrap_or_default());
        }
        Ok(metrics)
    }

    /// 60 equal buckets over the window; observed buckets carry per-second
    /// rates, missing buckets are emitted as zero points.
    async fn sparklines(
        &self,
        group: &MetricGroup,
        class_id: Option<i64>,
        instance_id: i64,
        begin: i64,
        end: i64,
    ) -> QanResult<Vec<SparkPoint>> {
        let interval_ts = ((end - begin) / (AMOUNT_OF_POINTS - 1)).max(1);

        let sums = SPARKLINE_METRICS
            .iter()
            .map(|c| format!("CAST(SUM({c}) AS REAL) AS {c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("SELECT (? - start_ts) / ? AS point, {sums} FROM query_class_metrics WHERE ");
        if !group.server_summary {
            sql.push_str("query_class_id = ? AND ");
        }
        sql.push_str("instance_id = ? AND start_ts >= ? AND start_ts < ? GROUP BY point");

        let mut query = sqlx::query(&sql).bind(end).bind(interval_ts);
        if !group.server_summary {
            query = query.bind(class_id.unwrap_or_default());
        }
        let rows = query
            .bind(instance_id)
            .bind(begin)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;

        let mut observed: BTreeMap<i64, SparkPoint> = BTreeMap::new();
        for row in rows {
            let point: i64 = row.get("point");
            let mut values = BTreeMap::new();
            for metric in SPARKLINE_METRICS {
                let sum: Option<f64> = row.try_get(*metric)?;
                values.insert(
                    format!("{metric}_per_sec"),
                    sum.unwrap_or_default() / interval_ts as f64,
                );
            }
            observed.insert(point, SparkPoint { point, ts: 0, values });
        }

        // Fill the gaps: output is always exactly AMOUNT_OF_POINTS entries.
        let mut sparks = Vec::with_capacity(AMOUNT_OF_POINTS as usize);
        for point_n in 0..AMOUNT_OF_POINTS {
            let ts = end - point_n * interval_ts;
            match observed.remove(&point_n) {
                Some(mut spark) => {
                    spark.ts = ts;
                    sparks.push(spark);
                }
                None => sparks.push(SparkPoint {
                    point: point_n,
                    ts,
                    values: BTreeMap::new(),
                }),
            }
        }
        Ok(sparks)
    }
}

fn select_columns(group: &MetricGroup) -> Vec<String> {
    let mut columns = Vec::new();
    if group.basic {
        columns.push("CAST(SUM(query_count) AS REAL) AS query_count".to_string());
    }
    for m in METRICS {
        if !group.includes(m.source) {
            continue;
        }
        if m.kind == MetricKind::Counter {
            columns.push(format!("SUM({0}_sum) AS {0}_sum", m.name));
            continue;
        }
        for stat in STAT_NAMES {
            let agg = match *stat {
                "sum" => "SUM",
                "min" => "MIN",
                "max" => "MAX",
                // avg, med, p95: average of per-interval statistics
                _ => "AVG",
            };
            columns.push(format!("{agg}({0}_{1}) AS {0}_{1}", m.name, stat));
        }
    }
    columns
}

fn compute_rate_metrics(general: &GeneralMetrics, begin: i64, end: i64) -> BTreeMap<String, f64> {
    let duration = (end - begin).max(1) as f64;
    let mut rates = BTreeMap::new();
    for base in RATE_METRICS {
        let value = general.get(*base).copied().unwrap_or_default();
        rates.insert(format!("{base}_per_sec"), value / duration);
    }
    rates
}

fn compute_special_metrics(general: &GeneralMetrics) -> BTreeMap<String, f64> {
    let mut special = BTreeMap::new();
    for ratio in SPECIAL_METRICS {
        let divider = general.get(ratio.divider).copied().unwrap_or_default();
        if divider == 0.0 {
            continue;
        }
        let dividend = general.get(ratio.dividend).copied().unwrap_or_default();
        special.insert(ratio.name.to_string(), dividend / divider);
    }
    special
}

fn compute_of_total(
    class: &GeneralMetrics,
    global: &GeneralMetrics,
) -> BTreeMap<String, f64> {
    let mut shares = BTreeMap::new();
    for base in PERCENT_OF_TOTAL {
        let total = global.get(*base).copied().unwrap_or_default();
        let share = if total > 0.0 {
            class.get(*base).copied().unwrap_or_default() / total
        } else {
            0.0
        };
        shares.insert(format!("{base}_of_total"), share);
    }
    shares
}

// Time-range validation shared by callers of the reader.
pub fn validate_time_range(begin: i64, end: i64) -> QanResult<()> {
    if begin >= end {
        return Err(QanError::bad_data("begin must be before end"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testutil::setup_test_db;

    const BEGIN: i64 = 1_709_280_000;
    const END: i64 = BEGIN + 3540; // interval_ts = 59s

    async fn seed_row(
        pool: &SqlitePool,
        class_id: i64,
        start_ts: i64,
        query_count: i64,
        qt_sum: f64,
        rows_affected_sum: f64,
        errors_sum: f64,
    ) {
        sqlx::query(
            "INSERT INTO query_class_metrics \
             (query_class_id, instance_id, start_ts, end_ts, query_count, \
              Query_time_sum, Query_time_min, Query_time_max, Query_time_avg, \
              Rows_affected_sum, Errors_sum, Lock_time_avg) \
             VALUES (?, 1, ?, ?, ?, ?, 0.001, 0.8, 0.4, ?, ?, 0.1)",
        )
        .bind(class_id)
        .bind(start_ts)
        .bind(start_ts + 59)
        .bind(query_count)
        .bind(qt_sum)
        .bind(rows_affected_sum)
        .bind(errors_sum)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn metric_group_detection() {
        let (_dir, pool) = setup_test_db().await;
        let reader = MetricsReader::new(pool.clone());

        // Empty window: nothing detected.
        let group = reader.identify_metric_group(1, BEGIN, END).await.unwrap();
        assert!(!group.basic && !group.percona_server && !group.performance_schema);

        seed_row(&pool, 1, BEGIN + 100, 10, 4.0, 0.0, 0.0).await;
        let group = reader.identify_metric_group(1, BEGIN, END).await.unwrap();
        assert!(group.basic);
        assert!(!group.percona_server);
        assert!(!group.performance_schema);

        seed_row(&pool, 1, BEGIN + 200, 5, 2.0, 3.0, 1.0).await;
        let group = reader.identify_metric_group(1, BEGIN, END).await.unwrap();
        assert!(group.basic && group.percona_server && group.performance_schema);

        // Out-of-window rows don't count.
        let group = reader
            .identify_metric_group(1, END + 1000, END + 2000)
            .await
            .unwrap();
        assert!(!group.basic);
    }

    #[tokio::test]
    async fn sparklines_have_exactly_sixty_decreasing_points() {
        let (_dir, pool) = setup_test_db().await;
        let reader = MetricsReader::new(pool.clone());

        seed_row(&pool, 1, BEGIN + 100, 10, 4.0, 0.0, 0.0).await;
        seed_row(&pool, 1, BEGIN + 2000, 6, 3.0, 0.0, 0.0).await;

        let (_metrics, sparks) = reader.get_class_metrics(1, 1, BEGIN, END).await.unwrap();
        assert_eq!(sparks.len(), AMOUNT_OF_POINTS as usize);

        let interval_ts = (END - BEGIN) / (AMOUNT_OF_POINTS - 1);
        for (n, spark) in sparks.iter().enumerate() {
            assert_eq!(spark.point, n as i64);
            assert_eq!(spark.ts, END - (n as i64) * interval_ts);
        }
        // Strictly decreasing arithmetic progression.
        for pair in sparks.windows(2) {
            assert_eq!(pair[0].ts - pair[1].ts, interval_ts);
        }

        // The two observed buckets carry rates; the rest are zero points.
        let non_zero: Vec<_> = sparks
            .iter()
            .filter(|s| !s.values.is_empty())
            .collect();
        assert_eq!(non_zero.len(), 2);
        let bucket = (END - (BEGIN + 100)) / interval_ts;
        let observed = sparks.iter().find(|s| s.point == bucket).unwrap();
        let rate = observed.values["Query_time_sum_per_sec"];
        assert!((rate - 4.0 / interval_ts as f64).abs() < 1e-9);
    }

    #[tokio::test]
    async fn general_metrics_select_only_detected_groups() {
        let (_dir, pool) = setup_test_db().await;
        let reader = MetricsReader::new(pool.clone());

        seed_row(&pool, 1, BEGIN + 100, 10, 4.0, 0.0, 0.0).await;
        let (metrics, _) = reader.get_class_metrics(1, 1, BEGIN, END).await.unwrap();

        assert_eq!(metrics.general["query_count"], 10.0);
        assert_eq!(metrics.general["Query_time_sum"], 4.0);
        // Percona-Server columns were not selected for a basic-only window.
        assert!(!metrics.general.contains_key("Bytes_sent_sum"));
        assert!(!metrics.general.contains_key("Errors_sum"));
    }

    #[tokio::test]
    async fn rates_special_and_share_of_total() {
        let (_dir, pool) = setup_test_db().await;
        let reader = MetricsReader::new(pool.clone());

        seed_row(&pool, 1, BEGIN + 100, 10, 4.0, 0.0, 0.0).await;
        seed_row(&pool, 2, BEGIN + 100, 30, 12.0, 0.0, 0.0).await;

        let (metrics, _) = reader.get_class_metrics(1, 1, BEGIN, END).await.unwrap();

        // Rates divide by the window duration.
        let duration = (END - BEGIN) as f64;
        assert!((metrics.rate["Query_time_sum_per_sec"] - 4.0 / duration).abs() < 1e-12);
        assert!((metrics.rate["query_count_per_sec"] - 10.0 / duration).abs() < 1e-12);

        // Ratio with a live divider; zero dividers are skipped.
        assert!(
            (metrics.special["Lock_time_avg_per_query_time"] - 0.1 / 0.4).abs() < 1e-12
        );
        assert!(!metrics.special.contains_key("InnoDB_IO_r_bytes_sum_per_io"));

        // Class 1 share: 10 of 40 queries, 4.0 of 16.0 seconds.
        assert!((metrics.percent_of_total["query_count_of_total"] - 0.25).abs() < 1e-12);
        assert!((metrics.percent_of_total["Query_time_sum_of_total"] - 0.25).abs() < 1e-12);
        // Zero totals yield zero shares.
        assert_eq!(metrics.percent_of_total["Errors_sum_of_total"], 0.0);
    }

    #[tokio::test]
    async fn global_metrics_aggregate_all_classes() {
        let (_dir, pool) = setup_test_db().await;
        let reader = MetricsReader::new(pool.clone());

        seed_row(&pool, 1, BEGIN + 100, 10, 4.0, 0.0, 0.0).await;
        seed_row(&pool, 2, BEGIN + 100, 30, 12.0, 0.0, 0.0).await;

        let (metrics, sparks) = reader.get_global_metrics(1, BEGIN, END).await.unwrap();
        assert_eq!(metrics.general["query_count"], 40.0);
        assert_eq!(metrics.general["Query_time_sum"], 16.0);
        assert_eq!(sparks.len(), AMOUNT_OF_POINTS as usize);

        let interval_ts = (END - BEGIN) / (AMOUNT_OF_POINTS - 1);
        let bucket = (END - (BEGIN + 100)) / interval_ts;
        let observed = sparks.iter().find(|s| s.point == bucket).unwrap();
        assert!(
            (observed.values["query_count_per_sec"] - 40.0 / interval_ts as f64).abs() < 1e-9
        );
    }

    #[test]
    fn time_range_validation() {
        assert!(validate_time_range(100, 200).is_ok());
        assert!(validate_time_range(200, 100).is_err());
        assert!(validate_time_range(100, 100).is_err());
    }
}
