//! Instance registry: the canonical mapping between external UUIDs and
//! internal ids, subsystem resolution, and the soft-delete lifecycle.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::errors::{QanError, QanResult};
use crate::proto::{subsystem_by_id, subsystem_by_name, Instance, SUBSYSTEM_MYSQL};

/// Name of the server's own self-monitoring MySQL instance. It is internal:
/// `get_all` only reports it when asked to regard internal data.
pub const INTERNAL_INSTANCE_NAME: &str = "qand-server";

/// Soft-delete sentinel: a zero-value `deleted` is stored as epoch+1s so the
/// store can distinguish "never deleted" (NULL) from "explicitly cleared".
const DELETED_SENTINEL: i64 = 1;

/// Anything within 1970 counts as the cleared sentinel, not a real delete.
const DELETED_EPOCH_CEILING: i64 = 31_536_000;

const INSTANCE_COLS: &str =
    "subsystem_id, instance_id, parent_uuid, uuid, dsn, name, distro, version, created, deleted";

#[derive(Clone)]
pub struct InstanceRegistry {
    pool: SqlitePool,
}

impl InstanceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Internal (auto-increment) id for a UUID; 0 for an empty UUID.
    pub async fn instance_id(&self, uuid: &str) -> QanResult<i64> {
        if uuid.is_empty() {
            return Ok(0);
        }
        let row = sqlx::query("SELECT instance_id FROM instances WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.get("instance_id")),
            None => Err(QanError::NotFound),
        }
    }

    pub async fn instance_ids(&self, uuids: &[String]) -> QanResult<Vec<i64>> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; uuids.len()].join(", ");
        let sql = format!("SELECT instance_id FROM instances WHERE uuid IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for uuid in uuids {
            query = query.bind(uuid);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| r.get("instance_id")).collect())
    }

    pub async fn create(&self, instance: &Instance) -> QanResult<i64> {
        if !instance.parent_uuid.is_empty() {
            let parent = self.instance_id(&instance.parent_uuid).await;
            match parent {
                Ok(id) if id > 0 => {}
                _ => {
                    return Err(QanError::InvalidInstance {
                        message: format!("invalid parent uuid {}", instance.parent_uuid),
                    })
                }
            }
        }

        let subsystem =
            subsystem_by_name(&instance.subsystem).ok_or_else(|| QanError::InvalidInstance {
                message: format!("unknown subsystem {}", instance.subsystem),
            })?;

        let dsn = if instance.dsn.is_empty() {
            None
        } else {
            Some(instance.dsn.as_str())
        };

        let result = sqlx::query(
            "INSERT INTO instances \
             (subsystem_id, parent_uuid, uuid, dsn, name, distro, version, deleted) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(subsystem.id)
        .bind(&instance.parent_uuid)
        .bind(&instance.uuid)
        .bind(dsn)
        .bind(&instance.name)
        .bind(&instance.distro)
        .bind(&instance.version)
        .bind(instance.deleted.map(|d| d.timestamp()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, uuid: &str) -> QanResult<(i64, Instance)> {
        let sql = format!("SELECT {INSTANCE_COLS} FROM instances WHERE uuid = ?");
        let row = sqlx::query(&sql)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(QanError::NotFound)?;
        row_to_instance(&row)
    }

    /// Look up by the natural key `(subsystem, name, parent)`.
    pub async fn get_by_name(
        &self,
        subsystem: &str,
        name: &str,
        parent_uuid: Option<&str>,
    ) -> QanResult<(i64, Instance)> {
        let s = subsystem_by_name(subsystem).ok_or_else(|| QanError::InvalidInstance {
            message: format!("unknown subsystem {subsystem}"),
        })?;

        let row = match parent_uuid {
            Some(parent) if !parent.is_empty() => {
                let sql = format!(
                    "SELECT {INSTANCE_COLS} FROM instances \
                     WHERE subsystem_id = ? AND name = ? AND parent_uuid = ?"
                );
                sqlx::query(&sql)
                    .bind(s.id)
                    .bind(name)
                    .bind(parent)
                    .fetch_optional(&self.pool)
                    .await?
            }
            _ => {
                let sql = format!(
                    "SELECT {INSTANCE_COLS} FROM instances WHERE subsystem_id = ? AND name = ?"
                );
                sqlx::query(&sql)
                    .bind(s.id)
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        row_to_instance(&row.ok_or(QanError::NotFound)?)
    }

    /// All active instances. With `include_internal`, the server's own
    /// monitoring instance is merged in (when it has metrics) and reported at
    /// most once.
    pub async fn get_all(&self, include_internal: bool) -> QanResult<Vec<Instance>> {
        let mut sql = format!(
            "SELECT {INSTANCE_COLS} FROM instances \
             WHERE deleted IS NULL OR deleted < {DELETED_EPOCH_CEILING}"
        );
        if include_internal {
            let mysql_id = subsystem_by_name(SUBSYSTEM_MYSQL)
                .map(|s| s.id)
                .unwrap_or_default();
            sql.push_str(&format!(
                " UNION SELECT * FROM ( \
                   SELECT i.subsystem_id, i.instance_id, i.parent_uuid, i.uuid, i.dsn, \
                          i.name, i.distro, i.version, i.created, i.deleted \
                   FROM instances i \
                   JOIN query_class_metrics qcm ON i.instance_id = qcm.instance_id \
                   WHERE i.name = ? AND i.subsystem_id = {mysql_id} LIMIT 1)"
            ));
        }
        sql.push_str(" ORDER BY name");

        let mut query = sqlx::query(&sql);
        if include_internal {
            query = query.bind(INTERNAL_INSTANCE_NAME);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut instances = Vec::new();
        let mut internal_added = false;
        for row in rows {
            let (_, instance) = row_to_instance(&row)?;
            let is_internal =
                instance.name == INTERNAL_INSTANCE_NAME && instance.subsystem == SUBSYSTEM_MYSQL;
            if is_internal && internal_added {
                continue;
            }
            if is_internal {
                internal_added = true;
            }
            instances.push(instance);
        }
        Ok(instances)
    }

    pub async fn update(&self, instance: &Instance) -> QanResult<()> {
        if !instance.parent_uuid.is_empty() {
            let parent = self.instance_id(&instance.parent_uuid).await;
            match parent {
                Ok(id) if id > 0 => {}
                _ => {
                    return Err(QanError::InvalidInstance {
                        message: format!("invalid parent uuid {}", instance.parent_uuid),
                    })
                }
            }
        }

        // A zero-value deleted means "clear the marker"; store the sentinel
        // so NULL keeps meaning "never deleted".
        let deleted = instance
            .deleted
            .map(|d| d.timestamp())
            .unwrap_or(DELETED_SENTINEL);

        sqlx::query(
            "UPDATE instances SET parent_uuid = ?, dsn = ?, name = ?, distro = ?, \
             version = ?, deleted = ? WHERE uuid = ?",
        )
        .bind(&instance.parent_uuid)
        .bind(&instance.dsn)
        .bind(&instance.name)
        .bind(&instance.distro)
        .bind(&instance.version)
        .bind(deleted)
        .bind(&instance.uuid)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Soft delete: mark only; data purge is deferred to the task queue.
    pub async fn delete(&self, uuid: &str) -> QanResult<()> {
        sqlx::query("UPDATE instances SET deleted = strftime('%s','now') WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Hard cascade over every table keyed by this instance's id.
    pub async fn delete_data(&self, uuid: &str) -> QanResult<()> {
        for table in [
            "query_class_metrics",
            "query_examples",
            "query_global_metrics",
            "query_user_sources",
        ] {
            let sql = format!(
                "DELETE FROM {table} \
                 WHERE instance_id = (SELECT instance_id FROM instances WHERE uuid = ?)"
            );
            sqlx::query(&sql).bind(uuid).execute(&self.pool).await?;
        }
        sqlx::query(
            "DELETE FROM agent_configs \
             WHERE other_instance_id = (SELECT instance_id FROM instances WHERE uuid = ?)",
        )
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> QanResult<(i64, Instance)> {
    let subsystem_id: i64 = row.get("subsystem_id");
    let subsystem = subsystem_by_id(subsystem_id).ok_or_else(|| QanError::InvalidInstance {
        message: format!("unknown subsystem id {subsystem_id}"),
    })?;

    let created: Option<i64> = row.get("created");
    let deleted: Option<i64> = row.get("deleted");

    let instance = Instance {
        subsystem: subsystem.name.to_string(),
        uuid: row.get("uuid"),
        parent_uuid: row.get::<Option<String>, _>("parent_uuid").unwrap_or_default(),
        dsn: row.get::<Option<String>, _>("dsn").unwrap_or_default(),
        name: row.get("name"),
        distro: row.get::<Option<String>, _>("distro").unwrap_or_default(),
        version: row.get::<Option<String>, _>("version").unwrap_or_default(),
        created: created.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
        deleted: deleted.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
    };
    Ok((row.get("instance_id"), instance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testutil::setup_test_db;
    use crate::proto::{SUBSYSTEM_MONGO, SUBSYSTEM_OS};

    fn mysql_instance(uuid: &str, name: &str) -> Instance {
        Instance {
            subsystem: SUBSYSTEM_MYSQL.to_string(),
            uuid: uuid.to_string(),
            name: name.to_string(),
            dsn: "user:pass@tcp(127.0.0.1:3306)".to_string(),
            distro: "MySQL".to_string(),
            version: "8.0".to_string(),
            ..Instance::default()
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (_dir, pool) = setup_test_db().await;
        let registry = InstanceRegistry::new(pool);

        let id = registry.create(&mysql_instance("u-1", "db1")).await.unwrap();
        assert!(id > 0);

        let (got_id, instance) = registry.get("u-1").await.unwrap();
        assert_eq!(got_id, id);
        assert_eq!(instance.name, "db1");
        assert_eq!(instance.subsystem, SUBSYSTEM_MYSQL);
        assert!(instance.deleted.is_none());
    }

    #[tokio::test]
    async fn create_rejects_unknown_parent_and_subsystem() {
        let (_dir, pool) = setup_test_db().await;
        let registry = InstanceRegistry::new(pool);

        let mut inst = mysql_instance("u-2", "db2");
        inst.parent_uuid = "no-such-parent".to_string();
        assert!(matches!(
            registry.create(&inst).await,
            Err(QanError::InvalidInstance { .. })
        ));

        let mut inst = mysql_instance("u-3", "db3");
        inst.subsystem = "redis".to_string();
        assert!(matches!(
            registry.create(&inst).await,
            Err(QanError::InvalidInstance { .. })
        ));
    }

    #[tokio::test]
    async fn get_by_name_scopes_to_parent() {
        let (_dir, pool) = setup_test_db().await;
        let registry = InstanceRegistry::new(pool);

        let mut host = mysql_instance("host-1", "host1");
        host.subsystem = SUBSYSTEM_OS.to_string();
        registry.create(&host).await.unwrap();

        let mut child = mysql_instance("u-4", "db");
        child.parent_uuid = "host-1".to_string();
        registry.create(&child).await.unwrap();

        let (_, found) = registry
            .get_by_name(SUBSYSTEM_MYSQL, "db", Some("host-1"))
            .await
            .unwrap();
        assert_eq!(found.uuid, "u-4");

        assert!(matches!(
            registry.get_by_name(SUBSYSTEM_MONGO, "db", None).await,
            Err(QanError::NotFound)
        ));
    }

    #[tokio::test]
    async fn soft_delete_hides_from_get_all() {
        let (_dir, pool) = setup_test_db().await;
        let registry = InstanceRegistry::new(pool);

        registry.create(&mysql_instance("u-5", "dbx")).await.unwrap();
        registry.create(&mysql_instance("u-6", "dby")).await.unwrap();
        registry.delete("u-5").await.unwrap();

        let all = registry.get_all(false).await.unwrap();
        let uuids: Vec<_> = all.iter().map(|i| i.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["u-6"]);
    }

    #[tokio::test]
    async fn update_clears_delete_marker_with_sentinel() {
        let (_dir, pool) = setup_test_db().await;
        let registry = InstanceRegistry::new(pool.clone());

        registry.create(&mysql_instance("u-7", "dbz")).await.unwrap();
        registry.delete("u-7").await.unwrap();
        assert!(registry.get_all(false).await.unwrap().is_empty());

        // Update with no deleted timestamp restores the instance.
        let (_, mut inst) = registry.get("u-7").await.unwrap();
        inst.deleted = None;
        registry.update(&inst).await.unwrap();

        let stored: Option<i64> =
            sqlx::query_scalar("SELECT deleted FROM instances WHERE uuid = 'u-7'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(stored, Some(1));
        assert_eq!(registry.get_all(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn internal_instance_appears_at_most_once() {
        let (_dir, pool) = setup_test_db().await;
        let registry = InstanceRegistry::new(pool.clone());

        let internal = mysql_instance("internal-1", INTERNAL_INSTANCE_NAME);
        let id = registry.create(&internal).await.unwrap();

        // Give the internal instance metrics so the union arm matches it too.
        sqlx::query(
            "INSERT INTO query_class_metrics \
             (query_class_id, instance_id, start_ts, query_count) VALUES (1, ?, 1000, 1)",
        )
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

        let all = registry.get_all(true).await.unwrap();
        let internal_count = all
            .iter()
            .filter(|i| i.name == INTERNAL_INSTANCE_NAME)
            .count();
        assert_eq!(internal_count, 1);

        // Still reported once when soft-deleted (via the union arm only).
        registry.delete("internal-1").await.unwrap();
        let all = registry.get_all(true).await.unwrap();
        let internal_count = all
            .iter()
            .filter(|i| i.name == INTERNAL_INSTANCE_NAME)
            .count();
        assert_eq!(internal_count, 1);
    }

    #[tokio::test]
    async fn delete_data_cascades_metric_tables() {
        let (_dir, pool) = setup_test_db().await;
        let registry = InstanceRegistry::new(pool.clone());

        let id = registry.create(&mysql_instance("u-8", "dbp")).await.unwrap();
        sqlx::query(
            "INSERT INTO query_class_metrics \
             (query_class_id, instance_id, start_ts, query_count) VALUES (1, ?, 1000, 1)",
        )
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO query_global_metrics (instance_id, start_ts, total_query_count) \
             VALUES (?, 1000, 1)",
        )
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO query_examples (instance_id, query_class_id, period, query) \
             VALUES (?, 1, '2024-03-01', 'SELECT 1')",
        )
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

        registry.delete_data("u-8").await.unwrap();

        for table in ["query_class_metrics", "query_global_metrics", "query_examples"] {
            let count: i64 =
                sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE instance_id = ?"))
                    .bind(id)
                    .fetch_one(&pool)
                    .await
                    .unwrap();
            assert_eq!(count, 0, "{table} not purged");
        }
    }
}
