//! Ingestion worker: the per-session receive loop for uploaded metric
//! reports. Decode, validate, write, ack, throttle.

use std::collections::HashSet;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use crate::database::instances::InstanceRegistry;
use crate::errors::{QanError, QanResult};
use crate::proto::{
    DataEnvelope, Report, Response, MAX_DATA_SIZE, PROTOCOL_VERSION, SUBSYSTEM_MONGO,
    SUBSYSTEM_MYSQL, THROTTLE_CODE,
};
use crate::qan::writer::MetricWriter;

/// Max data messages accepted per session before the agent is throttled and
/// told to reconnect.
pub const MAX_DATA_MSG: usize = 100;

pub struct IngestSession;

impl IngestSession {
    /// Drive one data session to completion. Returns cleanly on agent EOF or
    /// throttle; returns an error when the session must reset (read timeout,
    /// socket failure, store connection lost).
    pub async fn run<R, W>(
        read: R,
        mut write: W,
        dbh: &MetricWriter,
        registry: &InstanceRegistry,
        read_timeout: Duration,
    ) -> QanResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        // Existence map of MySQL/Mongo instances, loaded once per session.
        // Reports for unknown UUIDs are acked but never written, so a
        // deleted instance cannot be resurrected by a lagging agent.
        let mut exist = HashSet::new();
        for instance in registry.get_all(false).await? {
            if instance.subsystem == SUBSYSTEM_MYSQL || instance.subsystem == SUBSYSTEM_MONGO {
                exist.insert(instance.uuid);
            }
        }

        let mut lines = BufReader::new(read).lines();
        let mut n_msgs = 0usize;

        loop {
            let line = match timeout(read_timeout, lines.next_line()).await {
                Err(_) => return Err(QanError::Timeout),
                Ok(Err(err)) => return Err(err.into()),
                // Agent done sending, closed the connection.
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(line))) => line,
            };
            if line.trim().is_empty() {
                continue;
            }

            let (envelope, report) = match decode(&line) {
                Ok(decoded) => decoded,
                Err(err) => {
                    // The agent removes the message from its spool on >= 400.
                    send(
                        &mut write,
                        &Response {
                            code: 400,
                            error: err.to_string(),
                        },
                    )
                    .await?;
                    continue;
                }
            };

            if envelope.data.len() > MAX_DATA_SIZE {
                tracing::warn!(
                    service = %envelope.service,
                    size = envelope.data.len(),
                    "message too large, dropping"
                );
                continue;
            }

            if exist.contains(&report.uuid) {
                if let Err(err) = dbh.write(&report).await {
                    if err.is_connection_lost() {
                        // Store is gone; reset the session so it reconnects.
                        return Err(err);
                    }
                    // Usually a one-off bad report; drop it and move on. The
                    // ack below still runs so the agent clears its spool.
                    tracing::warn!(uuid = %report.uuid, error = %err, "cannot write report");
                }
            }

            n_msgs += 1;
            let mut response = Response {
                code: 200,
                error: String::new(),
            };
            if n_msgs >= MAX_DATA_MSG {
                response.code = THROTTLE_CODE;
            }
            send(&mut write, &response).await?;

            if response.code == THROTTLE_CODE {
                tracing::warn!(
                    max = MAX_DATA_MSG,
                    "throttling agent: max messages for one upload reached"
                );
                return Ok(());
            }
        }
    }
}

fn decode(line: &str) -> QanResult<(DataEnvelope, Report)> {
    let envelope: DataEnvelope = serde_json::from_str(line)
        .map_err(|err| QanError::bad_data(format!("cannot decode envelope: {err}")))?;

    if envelope.protocol_version != PROTOCOL_VERSION {
        return Err(QanError::bad_data(format!(
            "protocol version {} not supported",
            envelope.protocol_version
        )));
    }

    let report: Report = serde_json::from_slice(&envelope.data)
        .map_err(|err| QanError::bad_data(format!("cannot decode report: {err}")))?;

    Ok((envelope, report))
}

async fn send<W: AsyncWrite + Unpin>(write: &mut W, response: &Response) -> QanResult<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    write.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testutil::setup_test_db;
    use crate::proto::Instance;
    use query_info::Mini;
    use sqlx::SqlitePool;
    use std::sync::Arc;

    fn envelope_line(report_json: &str) -> String {
        let envelope = DataEnvelope {
            protocol_version: PROTOCOL_VERSION.to_string(),
            service: "qan".to_string(),
            created: None,
            data: report_json.as_bytes().to_vec(),
        };
        let mut line = serde_json::to_string(&envelope).unwrap();
        line.push('\n');
        line
    }

    fn report_json(uuid: &str) -> String {
        format!(
            r#"{{"UUID":"{uuid}","StartTs":"2024-03-01T10:00:00Z","EndTs":"2024-03-01T10:01:00Z",
               "Global":{{"TotalQueries":1,"UniqueQueries":1,"Metrics":{{}}}},
               "Class":[{{"Id":"AAAA","Fingerprint":"select c from t where id = ?","TotalQueries":1,
                          "Metrics":{{}}}}]}}"#
        )
        .replace('\n', " ")
    }

    async fn setup() -> (tempfile::TempDir, SqlitePool, MetricWriter, InstanceRegistry) {
        let (dir, pool) = setup_test_db().await;
        let registry = InstanceRegistry::new(pool.clone());
        registry
            .create(&Instance {
                subsystem: SUBSYSTEM_MYSQL.to_string(),
                uuid: "u-known".to_string(),
                name: "db1".to_string(),
                ..Instance::default()
            })
            .await
            .unwrap();
        let mini = Arc::new(Mini::new(None).unwrap());
        let writer = MetricWriter::new(pool.clone(), registry.clone(), mini);
        (dir, pool, writer, registry)
    }

    async fn run_session(
        writer: &MetricWriter,
        registry: &InstanceRegistry,
        input: Vec<String>,
    ) -> (QanResult<()>, Vec<Response>) {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, mut client_write) = tokio::io::split(client);

        let feeder = tokio::spawn(async move {
            for line in input {
                if client_write.write_all(line.as_bytes()).await.is_err() {
                    break; // session ended first (e.g. throttle)
                }
            }
            // Half-close so the session sees EOF once it has drained input.
            let _ = client_write.shutdown().await;
        });

        let collector = tokio::spawn(async move {
            let mut acks = Vec::new();
            let mut lines = BufReader::new(client_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                acks.push(serde_json::from_str::<Response>(&line).unwrap());
            }
            acks
        });

        let result = IngestSession::run(
            server_read,
            server_write,
            writer,
            registry,
            Duration::from_secs(5),
        )
        .await;

        feeder.await.unwrap();
        let acks = collector.await.unwrap();
        (result, acks)
    }

    #[tokio::test]
    async fn clean_eof_ends_session_without_error() {
        let (_dir, _pool, writer, registry) = setup().await;
        let (result, acks) = run_session(&writer, &registry, vec![]).await;
        assert!(result.is_ok());
        assert!(acks.is_empty());
    }

    #[tokio::test]
    async fn valid_report_is_written_and_acked() {
        let (_dir, pool, writer, registry) = setup().await;
        let (result, acks) = run_session(
            &writer,
            &registry,
            vec![envelope_line(&report_json("u-known"))],
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].code, 200);

        let classes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_classes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(classes, 1);
    }

    #[tokio::test]
    async fn ghost_instance_is_acked_but_not_written() {
        let (_dir, pool, writer, registry) = setup().await;
        let (result, acks) = run_session(
            &writer,
            &registry,
            vec![envelope_line(&report_json("u-deleted"))],
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].code, 200);

        let classes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_classes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(classes, 0);
    }

    #[tokio::test]
    async fn soft_deleted_instance_becomes_ghost() {
        let (_dir, pool, writer, registry) = setup().await;
        registry.delete("u-known").await.unwrap();

        let (result, acks) = run_session(
            &writer,
            &registry,
            vec![envelope_line(&report_json("u-known"))],
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(acks[0].code, 200);

        let classes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_classes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(classes, 0);
    }

    #[tokio::test]
    async fn bad_payloads_get_400_and_session_continues() {
        let (_dir, _pool, writer, registry) = setup().await;

        let bad_envelope = "this is not json\n".to_string();
        let bad_version = {
            let envelope = DataEnvelope {
                protocol_version: "9.9".to_string(),
                service: "qan".to_string(),
                created: None,
                data: report_json("u-known").into_bytes(),
            };
            let mut line = serde_json::to_string(&envelope).unwrap();
            line.push('\n');
            line
        };
        let good = envelope_line(&report_json("u-known"));

        let (result, acks) =
            run_session(&writer, &registry, vec![bad_envelope, bad_version, good]).await;
        assert!(result.is_ok());
        assert_eq!(acks.len(), 3);
        assert_eq!(acks[0].code, 400);
        assert_eq!(acks[1].code, 400);
        assert!(acks[1].error.contains("protocol version"));
        assert_eq!(acks[2].code, 200);
    }

    #[tokio::test]
    async fn oversized_payload_is_dropped_without_ack() {
        let (_dir, _pool, writer, registry) = setup().await;

        let huge = {
            let mut report = report_json("u-known");
            report.push_str(&" ".repeat(MAX_DATA_SIZE));
            envelope_line(&report)
        };
        let good = envelope_line(&report_json("u-known"));

        let (result, acks) = run_session(&writer, &registry, vec![huge, good]).await;
        assert!(result.is_ok());
        // Only the good message was acked.
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].code, 200);
    }

    #[tokio::test]
    async fn session_throttles_at_message_limit() {
        let (_dir, _pool, writer, registry) = setup().await;

        // Ghost UUID keeps the store out of the loop; acks still flow.
        let messages: Vec<String> = (0..MAX_DATA_MSG + 1)
            .map(|_| envelope_line(&report_json("u-ghost")))
            .collect();

        let (result, acks) = run_session(&writer, &registry, messages).await;
        assert!(result.is_ok());

        // Exactly MAX_DATA_MSG acks: 1..=99 are 200, the 100th is 299, and
        // the session ends before message 101 is read.
        assert_eq!(acks.len(), MAX_DATA_MSG);
        for ack in &acks[..MAX_DATA_MSG - 1] {
            assert_eq!(ack.code, 200);
        }
        assert_eq!(acks[MAX_DATA_MSG - 1].code, THROTTLE_CODE);
    }

    #[tokio::test]
    async fn read_timeout_resets_session() {
        let (_dir, _pool, writer, registry) = setup().await;
        let (_client, server) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);

        let result = IngestSession::run(
            server_read,
            server_write,
            &writer,
            &registry,
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(QanError::Timeout)));
    }
}
