//! The metric catalog: one declarative table enumerating every metric the
//! store knows, plus the derived-field tables for the read side. Column
//! lists and upsert SQL for both metrics tables are generated from the
//! catalog once, at first use, and are immutable afterwards.

use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Only a sum is recorded.
    Counter,
    /// Time in seconds; carries the six statistics.
    Microsecond,
    /// Dimensionless quantity; carries the six statistics.
    Number,
}

/// Which instrumentation family a metric belongs to. Selects whether a
/// metric appears in an aggregation query for a given window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricSource {
    /// Always present (slow log basics).
    Basic,
    /// Percona Server or Performance Schema.
    Extended,
    PerconaServer,
    PerformanceSchema,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricSpec {
    pub name: &'static str,
    pub kind: MetricKind,
    pub source: MetricSource,
}

/// Statistics stored per non-counter metric. `p5` is reserved and never
/// stored.
pub const STAT_NAMES: &[&str] = &["sum", "min", "max", "avg", "med", "p95"];

use MetricKind::{Counter, Microsecond, Number};
use MetricSource::{Basic, Extended, PerconaServer, PerformanceSchema};

macro_rules! metric {
    ($name:literal, $kind:expr, $source:expr) => {
        MetricSpec {
            name: $name,
            kind: $kind,
            source: $source,
        }
    };
}

/// Every metric in the order their columns appear in the store.
pub const METRICS: &[MetricSpec] = &[
    // Basic slow-log metrics.
    metric!("Query_time", Microsecond, Basic),
    metric!("Lock_time", Microsecond, Basic),
    metric!("Rows_sent", Number, Basic),
    metric!("Rows_examined", Number, Basic),
    // Percona Server or Performance Schema.
    metric!("Rows_affected", Number, Extended),
    metric!("Full_scan", Counter, Extended),
    metric!("Full_join", Counter, Extended),
    metric!("Tmp_table", Counter, Extended),
    metric!("Tmp_table_on_disk", Counter, Extended),
    metric!("Merge_passes", Number, Extended),
    // Percona Server.
    metric!("Bytes_sent", Number, PerconaServer),
    metric!("Tmp_tables", Number, PerconaServer),
    metric!("Tmp_disk_tables", Number, PerconaServer),
    metric!("Tmp_table_sizes", Number, PerconaServer),
    metric!("QC_Hit", Counter, PerconaServer),
    metric!("Filesort", Counter, PerconaServer),
    metric!("Filesort_on_disk", Counter, PerconaServer),
    metric!("InnoDB_IO_r_ops", Number, PerconaServer),
    metric!("InnoDB_IO_r_bytes", Number, PerconaServer),
    metric!("InnoDB_IO_r_wait", Microsecond, PerconaServer),
    metric!("InnoDB_rec_lock_wait", Microsecond, PerconaServer),
    metric!("InnoDB_queue_wait", Microsecond, PerconaServer),
    metric!("InnoDB_pages_distinct", Number, PerconaServer),
    // Performance Schema.
    metric!("Errors", Counter, PerformanceSchema),
    metric!("Warnings", Counter, PerformanceSchema),
    metric!("Select_full_range_join", Counter, PerformanceSchema),
    metric!("Select_range", Counter, PerformanceSchema),
    metric!("Select_range_check", Counter, PerformanceSchema),
    metric!("Sort_range", Counter, PerformanceSchema),
    metric!("Sort_rows", Counter, PerformanceSchema),
    metric!("Sort_scan", Counter, PerformanceSchema),
    metric!("No_index_used", Counter, PerformanceSchema),
    metric!("No_good_index_used", Counter, PerformanceSchema),
];

/// Ordered metric column names: `<name>_sum` for counters, `<name>_<stat>`
/// for everything else.
pub static METRIC_COLUMNS: LazyLock<Vec<String>> = LazyLock::new(|| {
    let mut columns = Vec::new();
    for m in METRICS {
        if m.kind == Counter {
            columns.push(format!("{}_sum", m.name));
        } else {
            for stat in STAT_NAMES {
                columns.push(format!("{}_{}", m.name, stat));
            }
        }
    }
    columns
});

/// Key columns of query_class_metrics, in insert order.
pub const CLASS_COLS: &[&str] = &[
    "query_class_id",
    "instance_id",
    "start_ts",
    "end_ts",
    "query_count",
    "lrq_count",
];

/// Key columns of query_global_metrics, in insert order.
pub const GLOBAL_COLS: &[&str] = &[
    "instance_id",
    "start_ts",
    "end_ts",
    "run_time",
    "total_query_count",
    "unique_query_count",
    "rate_type",
    "rate_limit",
    "log_file",
    "log_file_size",
    "start_offset",
    "end_offset",
    "stop_offset",
];

// Collapse rules when the same (key, start_ts) bucket is written twice.
// Every assignment sees the pre-update row, so the arithmetic commutes
// (count-weighted for averages) no matter which report lands first.
fn duplicate_update(col: &str, stat: &str, count_col: &str) -> String {
    match stat {
        "sum" => format!("{col} = COALESCE({col} + excluded.{col}, {col}, excluded.{col})"),
        "min" => format!(
            "{col} = CASE WHEN excluded.{col} < {col} \
             THEN COALESCE(excluded.{col}, {col}) \
             ELSE COALESCE({col}, excluded.{col}) END"
        ),
        "avg" => format!(
            "{col} = COALESCE((excluded.{count_col} * excluded.{col} + {count_col} * {col}) \
             / ({count_col} + excluded.{count_col}), {col}, excluded.{col})"
        ),
        // max, med, p95
        _ => format!(
            "{col} = CASE WHEN excluded.{col} > {col} \
             THEN COALESCE(excluded.{col}, {col}) \
             ELSE COALESCE({col}, excluded.{col}) END"
        ),
    }
}

fn metric_updates(count_col: &str) -> Vec<String> {
    let mut updates = Vec::new();
    for m in METRICS {
        if m.kind == Counter {
            updates.push(duplicate_update(&format!("{}_sum", m.name), "sum", count_col));
        } else {
            for stat in STAT_NAMES {
                updates.push(duplicate_update(
                    &format!("{}_{}", m.name, stat),
                    stat,
                    count_col,
                ));
            }
        }
    }
    updates
}

fn placeholders(n: usize) -> String {
    let mut s = String::from("?");
    for _ in 1..n {
        s.push_str(", ?");
    }
    s
}

/// Idempotent upsert of one class metrics row.
pub static INSERT_CLASS_METRICS: LazyLock<String> = LazyLock::new(|| {
    let mut cols: Vec<&str> = CLASS_COLS.to_vec();
    cols.extend(METRIC_COLUMNS.iter().map(String::as_str));
    let mut updates = vec![
        duplicate_update("end_ts", "max", "query_count"),
        duplicate_update("query_count", "sum", "query_count"),
    ];
    updates.extend(metric_updates("query_count"));
    format!(
        "INSERT INTO query_class_metrics ({}) VALUES ({}) \
         ON CONFLICT(query_class_id, instance_id, start_ts) DO UPDATE SET {}",
        cols.join(", "),
        placeholders(cols.len()),
        updates.join(", ")
    )
});

/// Idempotent upsert of the global metrics row; weighted by
/// total_query_count instead of query_count.
pub static INSERT_GLOBAL_METRICS: LazyLock<String> = LazyLock::new(|| {
    let mut cols: Vec<&str> = GLOBAL_COLS.to_vec();
    cols.extend(METRIC_COLUMNS.iter().map(String::as_str));
    let mut updates = vec![
        duplicate_update("end_ts", "max", "total_query_count"),
        duplicate_update("run_time", "sum", "total_query_count"),
        duplicate_update("total_query_count", "sum", "total_query_count"),
    ];
    updates.extend(metric_updates("total_query_count"));
    format!(
        "INSERT INTO query_global_metrics ({}) VALUES ({}) \
         ON CONFLICT(instance_id, start_ts) DO UPDATE SET {}",
        cols.join(", "),
        placeholders(cols.len()),
        updates.join(", ")
    )
});

// ---------------------------------------------------------------------------
// Read-side derived fields
// ---------------------------------------------------------------------------

/// A ratio metric: `name = general[dividend] / general[divider]`.
#[derive(Debug, Clone, Copy)]
pub struct RatioSpec {
    pub name: &'static str,
    pub dividend: &'static str,
    pub divider: &'static str,
}

macro_rules! ratio {
    ($name:literal, $dividend:literal, $divider:literal) => {
        RatioSpec {
            name: $name,
            dividend: $dividend,
            divider: $divider,
        }
    };
}

/// Ratio metrics with their divider annotations.
pub const SPECIAL_METRICS: &[RatioSpec] = &[
    ratio!("Lock_time_avg_per_query_time", "Lock_time_avg", "Query_time_avg"),
    ratio!(
        "InnoDB_rec_lock_wait_avg_per_query_time",
        "InnoDB_rec_lock_wait_avg",
        "Query_time_avg"
    ),
    ratio!(
        "InnoDB_IO_r_wait_avg_per_query_time",
        "InnoDB_IO_r_wait_avg",
        "Query_time_avg"
    ),
    ratio!(
        "InnoDB_queue_wait_avg_per_query_time",
        "InnoDB_queue_wait_avg",
        "Query_time_avg"
    ),
    ratio!(
        "InnoDB_IO_r_bytes_sum_per_io",
        "InnoDB_IO_r_bytes_sum",
        "InnoDB_IO_r_ops_sum"
    ),
    ratio!("QC_Hit_sum_per_query", "QC_Hit_sum", "query_count"),
    ratio!("Bytes_sent_sum_per_rows", "Bytes_sent_sum", "Rows_sent_sum"),
    ratio!("Rows_examined_sum_per_rows", "Rows_examined_sum", "Rows_sent_sum"),
    ratio!("Filesort_sum_per_query", "Filesort_sum", "query_count"),
    ratio!(
        "Filesort_on_disk_sum_per_query",
        "Filesort_on_disk_sum",
        "query_count"
    ),
    ratio!(
        "Merge_passes_sum_per_external_sort",
        "Merge_passes_sum",
        "Filesort_sum"
    ),
    ratio!("Full_join_sum_per_query", "Full_join_sum", "query_count"),
    ratio!("Full_scan_sum_per_query", "Full_scan_sum", "query_count"),
    ratio!("Tmp_table_sum_per_query", "Tmp_table_sum", "query_count"),
    ratio!(
        "Tmp_tables_sum_per_query_with_tmp_table",
        "Tmp_tables_sum",
        "Tmp_table_sum"
    ),
    ratio!(
        "Tmp_table_on_disk_sum_per_query",
        "Tmp_table_on_disk_sum",
        "query_count"
    ),
    ratio!(
        "Tmp_disk_tables_sum_per_query_with_tmp_table",
        "Tmp_disk_tables_sum",
        "Tmp_table_on_disk_sum"
    ),
    ratio!(
        "Tmp_table_sizes_sum_per_query",
        "Tmp_table_sizes_sum",
        "query_count"
    ),
];

/// Fields reported as per-second rates over the window duration.
pub const RATE_METRICS: &[&str] = &[
    "query_count",
    "Query_time_sum",
    "Lock_time_sum",
    "InnoDB_rec_lock_wait_sum",
    "InnoDB_IO_r_wait_sum",
    "InnoDB_IO_r_ops_sum",
    "InnoDB_IO_r_bytes_sum",
    "InnoDB_queue_wait_sum",
    "QC_Hit_sum",
    "Rows_sent_sum",
    "Bytes_sent_sum",
    "Rows_examined_sum",
    "Rows_affected_sum",
    "Filesort_sum",
    "Filesort_on_disk_sum",
    "Merge_passes_sum",
    "Full_join_sum",
    "Full_scan_sum",
    "Tmp_table_sum",
    "Tmp_tables_sum",
    "Tmp_table_on_disk_sum",
    "Tmp_disk_tables_sum",
    "Tmp_table_sizes_sum",
    "Errors_sum",
    "Warnings_sum",
    "Select_full_range_join_sum",
    "Select_range_sum",
    "Select_range_check_sum",
    "Sort_range_sum",
    "Sort_rows_sum",
    "Sort_scan_sum",
    "No_index_used_sum",
    "No_good_index_used_sum",
];

/// Fields reported as a class-over-global share (0 when the total is 0).
pub const PERCENT_OF_TOTAL: &[&str] = &[
    "query_count",
    "Query_time_sum",
    "Lock_time_sum",
    "Rows_sent_sum",
    "Rows_examined_sum",
    "Rows_affected_sum",
    "Bytes_sent_sum",
    "Tmp_tables_sum",
    "Tmp_disk_tables_sum",
    "Tmp_table_sizes_sum",
    "QC_Hit_sum",
    "Full_scan_sum",
    "Full_join_sum",
    "Tmp_table_sum",
    "Tmp_table_on_disk_sum",
    "Filesort_sum",
    "Filesort_on_disk_sum",
    "Merge_passes_sum",
    "InnoDB_IO_r_ops_sum",
    "InnoDB_IO_r_bytes_sum",
    "InnoDB_IO_r_wait_sum",
    "InnoDB_rec_lock_wait_sum",
    "InnoDB_queue_wait_sum",
    "InnoDB_pages_distinct_sum",
    "Errors_sum",
    "Warnings_sum",
    "Select_full_range_join_sum",
    "Select_range_sum",
    "Select_range_check_sum",
    "Sort_range_sum",
    "Sort_rows_sum",
    "Sort_scan_sum",
    "No_index_used_sum",
    "No_good_index_used_sum",
];

/// Sum columns carried in sparkline points, independent of metric group.
pub const SPARKLINE_METRICS: &[&str] = &[
    "query_count",
    "Query_time_sum",
    "Lock_time_sum",
    "Rows_sent_sum",
    "Rows_examined_sum",
    "Rows_affected_sum",
    "Merge_passes_sum",
    "Full_join_sum",
    "Full_scan_sum",
    "Tmp_table_sum",
    "Tmp_table_on_disk_sum",
    "Bytes_sent_sum",
    "InnoDB_IO_r_ops_sum",
    "InnoDB_IO_r_wait_sum",
    "InnoDB_rec_lock_wait_sum",
    "InnoDB_queue_wait_sum",
    "InnoDB_IO_r_bytes_sum",
    "QC_Hit_sum",
    "Filesort_sum",
    "Filesort_on_disk_sum",
    "Tmp_tables_sum",
    "Tmp_disk_tables_sum",
    "Tmp_table_sizes_sum",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_count_matches_catalog() {
        let counters = METRICS.iter().filter(|m| m.kind == Counter).count();
        let stats = METRICS.len() - counters;
        assert_eq!(METRIC_COLUMNS.len(), counters + stats * STAT_NAMES.len());
    }

    #[test]
    fn columns_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for c in METRIC_COLUMNS.iter() {
            assert!(seen.insert(c), "duplicate column {c}");
        }
    }

    #[test]
    fn upsert_sql_references_every_metric_column() {
        for c in METRIC_COLUMNS.iter() {
            assert!(INSERT_CLASS_METRICS.contains(c.as_str()));
            assert!(INSERT_GLOBAL_METRICS.contains(c.as_str()));
        }
        assert!(INSERT_CLASS_METRICS.contains("ON CONFLICT(query_class_id, instance_id, start_ts)"));
        assert!(INSERT_GLOBAL_METRICS.contains("ON CONFLICT(instance_id, start_ts)"));
        // Global averages are weighted by the global count.
        assert!(INSERT_GLOBAL_METRICS
            .contains("excluded.total_query_count * excluded.Query_time_avg"));
    }

    #[test]
    fn special_metric_dividers_name_real_fields() {
        for r in SPECIAL_METRICS {
            assert!(
                r.divider == "query_count"
                    || METRIC_COLUMNS.iter().any(|c| c == r.divider),
                "unknown divider {}",
                r.divider
            );
            assert!(
                METRIC_COLUMNS.iter().any(|c| c == r.dividend),
                "unknown dividend {}",
                r.dividend
            );
        }
    }
}
