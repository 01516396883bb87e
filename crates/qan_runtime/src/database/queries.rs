//! Read-side handlers for stored query classes: class rows, daily examples,
//! user sources, and the parse-on-demand table backfill.

use std::collections::HashMap;

use query_info::{Mini, Procedure, Table};
use sqlx::{Row, SqlitePool};

use crate::errors::{QanError, QanResult};

/// A stored query class as served to callers.
#[derive(Debug, Clone, Default)]
pub struct StoredQuery {
    pub checksum: String,
    pub abstract_: String,
    pub fingerprint: String,
    pub tables: Vec<Table>,
    pub procedures: Vec<Procedure>,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct StoredExample {
    pub query_checksum: String,
    pub instance_uuid: String,
    pub period: String,
    pub ts: Option<i64>,
    pub db: String,
    pub query_time: f64,
    pub query: String,
    pub explain: String,
}

/// Aggregated `(user, host)` execution counts for a class.
#[derive(Debug, Clone)]
pub struct UserSourceRow {
    pub user: String,
    pub host: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub count: i64,
}

#[derive(Clone)]
pub struct QueryHandler {
    pool: SqlitePool,
}

impl QueryHandler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Internal class id for a checksum; 0 for an empty checksum.
    pub async fn class_id(&self, checksum: &str) -> QanResult<i64> {
        if checksum.is_empty() {
            return Ok(0);
        }
        let row = sqlx::query("SELECT query_class_id FROM query_classes WHERE checksum = ?")
            .bind(checksum)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.get("query_class_id")),
            None => Err(QanError::NotFound),
        }
    }

    /// Fetch class rows by checksum, keyed by checksum.
    pub async fn get(&self, checksums: &[String]) -> QanResult<HashMap<String, StoredQuery>> {
        if checksums.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; checksums.len()].join(", ");
        let sql = format!(
            "SELECT checksum, COALESCE(abstract, '') AS abstract, fingerprint, \
                    COALESCE(tables, '') AS tables, COALESCE(procedures, '') AS procedures, \
                    first_seen, last_seen, status \
             FROM query_classes WHERE checksum IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for checksum in checksums {
            query = query.bind(checksum);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut queries = HashMap::new();
        for row in rows {
            let tables_json: String = row.get("tables");
            let procedures_json: String = row.get("procedures");
            let stored = StoredQuery {
                checksum: row.get("checksum"),
                abstract_: row.get("abstract"),
                fingerprint: row.get::<Option<String>, _>("fingerprint").unwrap_or_default(),
                tables: decode_json_list(&tables_json)?,
                procedures: decode_json_list(&procedures_json)?,
                first_seen: row.get("first_seen"),
                last_seen: row.get("last_seen"),
                status: row.get("status"),
            };
            queries.insert(stored.checksum.clone(), stored);
        }
        Ok(queries)
    }

    /// Daily examples for a class, newest period first. `instance_id = 0`
    /// means all instances.
    pub async fn examples(&self, class_id: i64, instance_id: i64) -> QanResult<Vec<StoredExample>> {
        let mut sql = String::from(
            "SELECT c.checksum, i.uuid, e.period, e.ts, e.db, e.query_time, e.query \
             FROM query_examples e \
             JOIN query_classes c USING (query_class_id) \
             JOIN instances i USING (instance_id) \
             WHERE query_class_id = ?",
        );
        if instance_id != 0 {
            sql.push_str(" AND instance_id = ?");
        }
        sql.push_str(" ORDER BY period DESC");

        let mut query = sqlx::query(&sql).bind(class_id);
        if instance_id != 0 {
            query = query.bind(instance_id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| StoredExample {
                query_checksum: row.get("checksum"),
                instance_uuid: row.get("uuid"),
                period: row.get("period"),
                ts: row.get("ts"),
                db: row.get::<Option<String>, _>("db").unwrap_or_default(),
                query_time: row.get::<Option<f64>, _>("query_time").unwrap_or_default(),
                query: row.get::<Option<String>, _>("query").unwrap_or_default(),
                explain: String::new(),
            })
            .collect())
    }

    /// The slowest example at or before `period` across the given instances.
    pub async fn example(
        &self,
        class_id: i64,
        instance_ids: &[i64],
        period: &str,
    ) -> QanResult<StoredExample> {
        if instance_ids.is_empty() {
            return Err(QanError::NotFound);
        }
        let placeholders = vec!["?"; instance_ids.len()].join(", ");
        let sql = format!(
            "SELECT e.period, e.ts, e.db, e.query_time, e.query, e.\"explain\", i.uuid \
             FROM query_examples e \
             JOIN instances i ON e.instance_id = i.instance_id \
             WHERE query_class_id = ? AND e.instance_id IN ({placeholders}) AND period <= ? \
             ORDER BY period DESC, query_time DESC \
             LIMIT 1"
        );
        let mut query = sqlx::query(&sql).bind(class_id);
        for id in instance_ids {
            query = query.bind(id);
        }
        let row = query
            .bind(period)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(QanError::NotFound)?;

        Ok(StoredExample {
            query_checksum: String::new(),
            instance_uuid: row.get("uuid"),
            period: row.get("period"),
            ts: row.get("ts"),
            db: row.get::<Option<String>, _>("db").unwrap_or_default(),
            query_time: row.get::<Option<f64>, _>("query_time").unwrap_or_default(),
            query: row.get::<Option<String>, _>("query").unwrap_or_default(),
            explain: row.get::<Option<String>, _>("explain").unwrap_or_default(),
        })
    }

    /// Per-(user, host) execution counts for a class in a time window.
    pub async fn user_sources(
        &self,
        class_id: i64,
        instance_ids: &[i64],
        begin: i64,
        end: i64,
    ) -> QanResult<Vec<UserSourceRow>> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; instance_ids.len()].join(", ");
        let sql = format!(
            "SELECT uc.user, uc.host, MIN(qus.ts) AS first_seen, MAX(qus.ts) AS last_seen, \
                    SUM(qus.count) AS count \
             FROM query_user_sources qus \
             JOIN user_classes uc ON qus.user_class_id = uc.id \
             WHERE qus.query_class_id = ? AND qus.instance_id IN ({placeholders}) \
               AND qus.ts >= ? AND qus.ts < ? \
             GROUP BY qus.query_class_id, qus.instance_id, uc.user, uc.host"
        );
        let mut query = sqlx::query(&sql).bind(class_id);
        for id in instance_ids {
            query = query.bind(id);
        }
        let rows = query.bind(begin).bind(end).fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| UserSourceRow {
                user: row.get("user"),
                host: row.get("host"),
                first_seen: row.get::<Option<i64>, _>("first_seen").unwrap_or_default(),
                last_seen: row.get::<Option<i64>, _>("last_seen").unwrap_or_default(),
                count: row.get::<Option<i64>, _>("count").unwrap_or_default(),
            })
            .collect())
    }

    /// Correct the db recorded for one daily example.
    pub async fn update_example_db(
        &self,
        class_id: i64,
        instance_id: i64,
        period: &str,
        db: &str,
    ) -> QanResult<()> {
        let result = sqlx::query(
            "UPDATE query_examples SET db = ? \
             WHERE query_class_id = ? AND instance_id = ? AND period = ?",
        )
        .bind(db)
        .bind(class_id)
        .bind(instance_id)
        .bind(period)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QanError::NotFound);
        }
        Ok(())
    }

    /// Store the table/procedure lists as JSON on the class row.
    pub async fn update_tables_and_procedures(
        &self,
        class_id: i64,
        tables: &[Table],
        procedures: &[Procedure],
    ) -> QanResult<()> {
        let tables_json = serde_json::to_string(tables)?;
        let procedures_json = serde_json::to_string(procedures)?;
        sqlx::query("UPDATE query_classes SET tables = ?, procedures = ? WHERE query_class_id = ?")
            .bind(tables_json)
            .bind(procedures_json)
            .bind(class_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Tables for a class. Served straight from the class row when already
    /// parsed, otherwise classified now from the stored fingerprint and the
    /// newest example, and written back for next time.
    pub async fn tables(&self, class_id: i64, mini: &Mini) -> QanResult<Vec<Table>> {
        let tables_json: Option<String> =
            sqlx::query_scalar("SELECT COALESCE(tables, '') FROM query_classes WHERE query_class_id = ?")
                .bind(class_id)
                .fetch_optional(&self.pool)
                .await?;
        let tables_json = tables_json.ok_or(QanError::NotFound)?;
        if !tables_json.is_empty() {
            return decode_json_list(&tables_json);
        }

        let fingerprint: String =
            sqlx::query_scalar("SELECT fingerprint FROM query_classes WHERE query_class_id = ?")
                .bind(class_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(QanError::NotFound)?;

        let example_row = sqlx::query(
            "SELECT query, db FROM query_examples \
             WHERE query_class_id = ? ORDER BY period DESC LIMIT 1",
        )
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await?;
        let (example, db) = match &example_row {
            Some(row) => (
                row.get::<Option<String>, _>("query").unwrap_or_default(),
                row.get::<Option<String>, _>("db").unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };

        let info = mini.parse(&fingerprint, &example, &db).await?;
        self.update_tables_and_procedures(class_id, &info.tables, &info.procedures)
            .await?;
        Ok(info.tables)
    }
}

fn decode_json_list<T: serde::de::DeserializeOwned>(json: &str) -> QanResult<Vec<T>> {
    if json.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testutil::setup_test_db;

    async fn seed_class(pool: &SqlitePool, checksum: &str, tables: &str) -> i64 {
        sqlx::query(
            "INSERT INTO query_classes (checksum, abstract, fingerprint, tables, first_seen, last_seen) \
             VALUES (?, 'SELECT t', 'select * from t where id = ?', ?, 1000, 2000)",
        )
        .bind(checksum)
        .bind(if tables.is_empty() { None } else { Some(tables) })
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    #[tokio::test]
    async fn get_decodes_stored_json() {
        let (_dir, pool) = setup_test_db().await;
        let handler = QueryHandler::new(pool.clone());

        seed_class(&pool, "AAAA", r#"[{"db":"shop","table":"t"}]"#).await;
        let queries = handler.get(&["AAAA".to_string()]).await.unwrap();
        let stored = &queries["AAAA"];
        assert_eq!(stored.tables.len(), 1);
        assert_eq!(stored.tables[0].db, "shop");
        assert_eq!(stored.first_seen, Some(1000));
    }

    #[tokio::test]
    async fn class_id_maps_checksum() {
        let (_dir, pool) = setup_test_db().await;
        let handler = QueryHandler::new(pool.clone());

        let id = seed_class(&pool, "BBBB", "").await;
        assert_eq!(handler.class_id("BBBB").await.unwrap(), id);
        assert_eq!(handler.class_id("").await.unwrap(), 0);
        assert!(matches!(
            handler.class_id("absent").await,
            Err(QanError::NotFound)
        ));
    }

    #[tokio::test]
    async fn tables_parses_on_demand_and_backfills() {
        let (_dir, pool) = setup_test_db().await;
        let handler = QueryHandler::new(pool.clone());
        let mini = Mini::new(None).unwrap();

        let class_id = seed_class(&pool, "CCCC", "").await;
        let tables = handler.tables(class_id, &mini).await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].table, "t");

        // Backfilled: a second call is served from the stored column.
        let stored: String =
            sqlx::query_scalar("SELECT tables FROM query_classes WHERE query_class_id = ?")
                .bind(class_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(stored.contains("\"t\""));
    }

    #[tokio::test]
    async fn user_sources_aggregate_by_user_host() {
        let (_dir, pool) = setup_test_db().await;
        let handler = QueryHandler::new(pool.clone());

        sqlx::query("INSERT INTO user_classes (user, host) VALUES ('app', '10.0.0.1')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO query_user_sources \
             (query_class_id, instance_id, user_class_id, ts, count) VALUES (7, 3, 1, 1500, 9)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let sources = handler.user_sources(7, &[3], 1000, 2000).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].user, "app");
        assert_eq!(sources[0].count, 9);

        // Window excludes the row.
        let sources = handler.user_sources(7, &[3], 1600, 2000).await.unwrap();
        assert!(sources.is_empty());
    }
}
