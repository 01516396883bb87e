//! SQL fingerprint classification service.
//!
//! Turns a `(fingerprint, example, default_db)` triple into a [`QueryInfo`]:
//! a short abstract plus the tables and procedures the query touches. Parsing
//! is two-stage: a structured SQL parse interpreted by a long-lived worker
//! task, falling back to an external line-oriented helper process that only
//! produces the abstract. The worker is crash-isolated and respawned
//! transparently; the helper is strictly serialized so concurrent callers can
//! never receive each other's answers.

mod ast;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

/// query_classes.abstract
pub const MAX_ABSTRACT: usize = 100;
/// query_classes.fingerprint
pub const MAX_FINGERPRINT: usize = 5000;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("SQL parser does not support the query")]
    NotSupported,

    #[error("abstract helper i/o: {0}")]
    Helper(#[from] std::io::Error),

    #[error("abstract helper exited")]
    HelperClosed,
}

/// A `(db, table)` pair referenced by a query. `db` may be empty until the
/// caller's default database is filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub db: String,
    pub table: String,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.db.is_empty() {
            write!(f, "{}", self.table)
        } else {
            write!(f, "{}.{}", self.db, self.table)
        }
    }
}

/// A stored procedure referenced by a CALL statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Procedure {
    pub db: String,
    pub name: String,
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.db.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.db, self.name)
        }
    }
}

/// Classification result for one query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryInfo {
    pub fingerprint: String,
    #[serde(rename = "abstract")]
    pub abstract_: String,
    pub tables: Vec<Table>,
    pub procedures: Vec<Procedure>,
}

impl QueryInfo {
    /// Tables as a JSON string, empty when there are none. This is the form
    /// stored in the query_classes.tables column.
    pub fn tables_json(&self) -> String {
        if self.tables.is_empty() {
            return String::new();
        }
        serde_json::to_string(&self.tables).unwrap_or_default()
    }

    /// Procedures as a JSON string, empty when there are none.
    pub fn procedures_json(&self) -> String {
        if self.procedures.is_empty() {
            return String::new();
        }
        serde_json::to_string(&self.procedures).unwrap_or_default()
    }
}

enum WorkerVerdict {
    Parsed(QueryInfo),
    /// Statement kind the structured walk does not handle.
    Unsupported,
}

struct ParseJob {
    query: String,
    fingerprint: String,
    stmt: sqlparser::ast::Statement,
    reply: oneshot::Sender<WorkerVerdict>,
}

struct Helper {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    _child: Child,
}

/// The classification service. One instance is shared by all ingestion
/// workers; clone it behind an `Arc`.
pub struct Mini {
    worker: Mutex<mpsc::Sender<ParseJob>>,
    generation: AtomicU64,
    // None means tables-only mode: no helper process, unparseable queries
    // surface ParseError::NotSupported.
    helper: Option<Mutex<Helper>>,
}

impl Mini {
    /// Start the service. `helper_path`, when set, is spawned once and kept
    /// for the lifetime of the service.
    pub fn new(helper_path: Option<PathBuf>) -> Result<Self, ParseError> {
        let helper = match helper_path {
            Some(path) => Some(Mutex::new(spawn_helper(&path)?)),
            None => None,
        };
        Ok(Self {
            worker: Mutex::new(spawn_worker()),
            generation: AtomicU64::new(1),
            helper,
        })
    }

    /// How many times the parse worker has been (re)spawned. Increments when
    /// a query crashes the worker.
    pub fn worker_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Classify one query. The example is preferred over the fingerprint when
    /// present because it is concrete SQL.
    pub async fn parse(
        &self,
        fingerprint: &str,
        example: &str,
        default_db: &str,
    ) -> Result<QueryInfo, ParseError> {
        let fingerprint = fingerprint.trim();
        let example = example.trim();

        let source = if example.is_empty() { fingerprint } else { example };
        // Fingerprints turn IN (1, 2) into "in (?+)" which is not valid SQL,
        // and internal newlines break the helper's line protocol.
        let query = source.replace("?+", "? ").replace('\n', " ");

        let info = QueryInfo {
            fingerprint: fingerprint.to_string(),
            ..QueryInfo::default()
        };

        let stmt = match Parser::parse_sql(&MySqlDialect {}, &query) {
            Ok(mut stmts) if !stmts.is_empty() => stmts.remove(0),
            Ok(_) | Err(_) => {
                let info = self.use_helper(&query, info).await?;
                return Ok(finish(info));
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = ParseJob {
            query: query.clone(),
            fingerprint: fingerprint.to_string(),
            stmt,
            reply: reply_tx,
        };

        let tx = self.worker.lock().await.clone();
        if tx.send(job).await.is_err() {
            // Worker died on an earlier query and nobody has respawned it yet.
            self.respawn_worker().await;
            let info = self.use_helper(&query, info).await?;
            return Ok(finish(info));
        }

        match reply_rx.await {
            Ok(WorkerVerdict::Parsed(mut parsed)) => {
                if !default_db.is_empty() {
                    for t in &mut parsed.tables {
                        if t.db.is_empty() {
                            t.db = default_db.to_string();
                        }
                    }
                    for p in &mut parsed.procedures {
                        if p.db.is_empty() {
                            p.db = default_db.to_string();
                        }
                    }
                }
                Ok(finish(parsed))
            }
            Ok(WorkerVerdict::Unsupported) => {
                let info = self.use_helper(&query, info).await?;
                Ok(finish(info))
            }
            Err(_) => {
                // The worker panicked mid-job and dropped the reply sender.
                tracing::warn!(query = %query, "query crashed the SQL parse worker");
                self.respawn_worker().await;
                let info = self.use_helper(&query, info).await?;
                Ok(finish(info))
            }
        }
    }

    async fn respawn_worker(&self) {
        let mut guard = self.worker.lock().await;
        *guard = spawn_worker();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Ask the helper process for an abstract. The lock is held across the
    /// write/read pair: exactly one request may be in flight, otherwise
    /// replies would be delivered to the wrong caller.
    async fn use_helper(
        &self,
        query: &str,
        mut info: QueryInfo,
    ) -> Result<QueryInfo, ParseError> {
        let Some(helper) = &self.helper else {
            return Err(ParseError::NotSupported);
        };

        let mut h = helper.lock().await;
        h.stdin.write_all(query.as_bytes()).await?;
        h.stdin.write_all(b"\n").await?;
        h.stdin.flush().await?;

        let mut line = String::new();
        let n = h.stdout.read_line(&mut line).await?;
        if n == 0 {
            return Err(ParseError::HelperClosed);
        }
        info.abstract_ = line.replace('\n', "");
        Ok(info)
    }
}

fn spawn_helper(path: &std::path::Path) -> Result<Helper, ParseError> {
    let mut child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let stdin = child.stdin.take().ok_or(ParseError::HelperClosed)?;
    let stdout = child.stdout.take().ok_or(ParseError::HelperClosed)?;
    Ok(Helper {
        stdin,
        stdout: BufReader::new(stdout),
        _child: child,
    })
}

fn spawn_worker() -> mpsc::Sender<ParseJob> {
    let (tx, mut rx) = mpsc::channel::<ParseJob>(16);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let verdict = panic::catch_unwind(AssertUnwindSafe(|| run_job(&job)));
            match verdict {
                Ok(v) => {
                    let _ = job.reply.send(v);
                }
                Err(_) => {
                    // Drop the reply sender so the caller sees the crash, and
                    // terminate: the caller spawns a replacement worker.
                    drop(job);
                    return;
                }
            }
        }
    });
    tx
}

fn run_job(job: &ParseJob) -> WorkerVerdict {
    #[cfg(any(test, feature = "fail-parse"))]
    if job.query.contains("__fail_parse__") {
        panic!("injected parse worker fault");
    }

    let mut info = QueryInfo {
        fingerprint: job.fingerprint.clone(),
        ..QueryInfo::default()
    };
    if !ast::interpret(&job.stmt, &mut info) {
        return WorkerVerdict::Unsupported;
    }

    info.tables = dedup_tables(info.tables);
    info.procedures = dedup_procedures(info.procedures);
    WorkerVerdict::Parsed(info)
}

/// Remove duplicate tables, keeping first-seen order.
pub fn dedup_tables(tables: Vec<Table>) -> Vec<Table> {
    let mut seen = std::collections::HashSet::new();
    tables
        .into_iter()
        .filter(|t| seen.insert(t.to_string()))
        .collect()
}

/// Remove duplicate procedures, keeping first-seen order.
pub fn dedup_procedures(procedures: Vec<Procedure>) -> Vec<Procedure> {
    let mut seen = std::collections::HashSet::new();
    procedures
        .into_iter()
        .filter(|p| seen.insert((p.db.clone(), p.name.clone())))
        .collect()
}

fn finish(mut info: QueryInfo) -> QueryInfo {
    info.abstract_ = info.abstract_.trim().to_string();
    truncate_marked(&mut info.abstract_, MAX_ABSTRACT);
    truncate_marked(&mut info.fingerprint, MAX_FINGERPRINT);
    info
}

fn truncate_marked(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max - 3;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s.push_str("...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tables_only() -> Mini {
        Mini::new(None).expect("mini")
    }

    fn with_cat_helper() -> Mini {
        Mini::new(Some(PathBuf::from("/bin/cat"))).expect("mini with helper")
    }

    fn t(db: &str, table: &str) -> Table {
        Table {
            db: db.to_string(),
            table: table.to_string(),
        }
    }

    #[tokio::test]
    async fn select_with_join_and_default_db() {
        let m = tables_only();
        let info = m
            .parse(
                "SELECT * FROM orders o JOIN customers c ON o.cid = c.id WHERE o.id = ?",
                "",
                "shop",
            )
            .await
            .unwrap();
        assert_eq!(info.abstract_, "SELECT orders customers");
        assert_eq!(info.tables, vec![t("shop", "orders"), t("shop", "customers")]);
    }

    #[tokio::test]
    async fn select_qualified_table_keeps_db() {
        let m = tables_only();
        let info = m
            .parse("SELECT a FROM mydb.widgets WHERE a = ?", "", "other")
            .await
            .unwrap();
        assert_eq!(info.tables, vec![t("mydb", "widgets")]);
        assert_eq!(info.abstract_, "SELECT mydb.widgets");
    }

    #[tokio::test]
    async fn union_collects_both_sides() {
        let m = tables_only();
        let info = m
            .parse("SELECT a FROM t1 UNION SELECT a FROM t2", "", "")
            .await
            .unwrap();
        assert_eq!(info.tables, vec![t("", "t1"), t("", "t2")]);
    }

    #[tokio::test]
    async fn derived_table_recurses() {
        let m = tables_only();
        let info = m
            .parse(
                "SELECT x FROM (SELECT x FROM inner_t WHERE y = ?) d",
                "",
                "",
            )
            .await
            .unwrap();
        assert_eq!(info.tables, vec![t("", "inner_t")]);
    }

    #[tokio::test]
    async fn insert_and_replace() {
        let m = tables_only();
        let info = m
            .parse("INSERT INTO logs (a, b) VALUES (?, ?)", "", "")
            .await
            .unwrap();
        assert_eq!(info.abstract_, "INSERT logs");
        assert_eq!(info.tables, vec![t("", "logs")]);

        let info = m
            .parse("REPLACE INTO kv (k, v) VALUES (?, ?)", "", "")
            .await
            .unwrap();
        assert_eq!(info.abstract_, "REPLACE kv");
    }

    #[tokio::test]
    async fn update_and_delete() {
        let m = tables_only();
        let info = m
            .parse("UPDATE accounts SET balance = ? WHERE id = ?", "", "")
            .await
            .unwrap();
        assert_eq!(info.abstract_, "UPDATE accounts");

        let info = m
            .parse("DELETE FROM sessions WHERE expired < ?", "", "")
            .await
            .unwrap();
        assert_eq!(info.abstract_, "DELETE sessions");
        assert_eq!(info.tables, vec![t("", "sessions")]);
    }

    #[tokio::test]
    async fn call_records_procedure() {
        let m = tables_only();
        let info = m.parse("CALL mydb.cleanup(?)", "", "").await.unwrap();
        assert_eq!(info.abstract_, "CALL");
        assert_eq!(
            info.procedures,
            vec![Procedure {
                db: "mydb".to_string(),
                name: "cleanup".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn call_fills_default_db() {
        let m = tables_only();
        let info = m.parse("CALL cleanup()", "", "maint").await.unwrap();
        assert_eq!(info.procedures[0].db, "maint");
    }

    #[tokio::test]
    async fn ddl_statements() {
        let m = tables_only();
        let info = m
            .parse("CREATE TABLE t1 (id INT PRIMARY KEY)", "", "")
            .await
            .unwrap();
        assert_eq!(info.abstract_, "CREATE TABLE t1");
        assert_eq!(info.tables, vec![t("", "t1")]);

        let info = m
            .parse("ALTER TABLE db1.t2 ADD COLUMN c INT", "", "")
            .await
            .unwrap();
        assert_eq!(info.abstract_, "ALTER TABLE db1.t2");

        let info = m.parse("DROP TABLE old_t", "", "").await.unwrap();
        assert_eq!(info.abstract_, "DROP TABLE old_t");
    }

    #[tokio::test]
    async fn use_and_show() {
        let m = tables_only();
        let info = m.parse("USE mydb", "", "").await.unwrap();
        assert_eq!(info.abstract_, "USE");

        let info = m.parse("SHOW TABLES", "", "").await.unwrap();
        assert_eq!(info.abstract_, "SHOW TABLES");
    }

    #[tokio::test]
    async fn dual_is_suppressed() {
        let m = tables_only();
        let info = m.parse("SELECT 1 + 1 FROM DUAL", "", "").await.unwrap();
        assert!(info.tables.is_empty());
        assert_eq!(info.abstract_, "SELECT");
    }

    #[tokio::test]
    async fn self_join_dedups_but_abstract_repeats() {
        let m = tables_only();
        let info = m
            .parse("SELECT * FROM t a JOIN t b ON a.id = b.id", "", "")
            .await
            .unwrap();
        assert_eq!(info.tables, vec![t("", "t")]);
        assert_eq!(info.abstract_, "SELECT t t");
    }

    #[tokio::test]
    async fn in_list_placeholder_is_rewritten() {
        let m = tables_only();
        let info = m
            .parse("SELECT c FROM t WHERE id IN(?+)", "", "")
            .await
            .unwrap();
        assert_eq!(info.tables, vec![t("", "t")]);
    }

    #[tokio::test]
    async fn example_preferred_over_fingerprint() {
        let m = tables_only();
        let info = m
            .parse(
                "select c from t where id = ?",
                "SELECT c FROM real_t WHERE id = 42",
                "",
            )
            .await
            .unwrap();
        assert_eq!(info.tables, vec![t("", "real_t")]);
        // The fingerprint field still carries the fingerprint, not the example.
        assert_eq!(info.fingerprint, "select c from t where id = ?");
    }

    #[tokio::test]
    async fn tables_only_mode_rejects_unparseable() {
        let m = tables_only();
        let err = m
            .parse("LOAD DATA INFILE 'x.csv' INTO TABLE t", "", "")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::NotSupported));
    }

    #[tokio::test]
    async fn helper_fallback_produces_abstract() {
        let m = with_cat_helper();
        let info = m
            .parse("LOAD DATA INFILE 'x.csv' INTO TABLE t", "", "")
            .await
            .unwrap();
        // cat echoes the query line back; newlines are stripped.
        assert_eq!(info.abstract_, "LOAD DATA INFILE 'x.csv' INTO TABLE t");
        assert!(info.tables.is_empty());
    }

    #[tokio::test]
    async fn concurrent_fallback_answers_never_cross() {
        let m = Arc::new(with_cat_helper());
        let mut handles = Vec::new();
        for i in 0..16 {
            let m = m.clone();
            handles.push(tokio::spawn(async move {
                let query = format!("LOAD DATA INFILE 'file_{i}.csv' INTO TABLE t{i}");
                let info = m.parse(&query, "", "").await.unwrap();
                (query, info.abstract_)
            }));
        }
        for h in handles {
            let (query, abstract_) = h.await.unwrap();
            assert_eq!(query, abstract_);
        }
    }

    #[tokio::test]
    async fn worker_crash_recovers_via_helper() {
        let m = with_cat_helper();
        let gen_before = m.worker_generation();

        let info = m
            .parse("SELECT __fail_parse__ FROM t", "", "")
            .await
            .unwrap();
        // Fallback answered, and a fresh worker was spawned.
        assert_eq!(info.abstract_, "SELECT __fail_parse__ FROM t");
        assert_eq!(m.worker_generation(), gen_before + 1);

        // The fresh worker parses normally again.
        let info = m.parse("SELECT a FROM t1", "", "").await.unwrap();
        assert_eq!(info.abstract_, "SELECT t1");
    }

    #[tokio::test]
    async fn long_fingerprint_and_abstract_truncated() {
        let m = tables_only();
        let long_name = "c".repeat(200);
        let fingerprint = format!(
            "SELECT {} FROM {}",
            vec!["a"; 2000].join(", "),
            long_name
        );
        let info = m.parse(&fingerprint, "", "").await.unwrap();
        assert!(info.fingerprint.len() <= MAX_FINGERPRINT);
        assert!(info.fingerprint.ends_with("..."));
        assert!(info.abstract_.len() <= MAX_ABSTRACT);
        assert!(info.abstract_.ends_with("..."));
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let tables = vec![t("a", "x"), t("", "y"), t("a", "x"), t("b", "x"), t("", "y")];
        let out = dedup_tables(tables);
        assert_eq!(out, vec![t("a", "x"), t("", "y"), t("b", "x")]);
    }
}
