//! TCP front door for agents. Every session opens with a one-line handshake
//! naming the agent and the channel: "agent" sessions join the directory and
//! carry command/reply traffic; "data" sessions run the ingestion loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::agent::comm::{run_reader, AgentConn};
use crate::agent::directory::Directory;
use crate::database::instances::InstanceRegistry;
use crate::errors::{QanError, QanResult};
use crate::proto::{Hello, Response};
use crate::qan::ingest::IngestSession;
use crate::qan::writer::MetricWriter;

pub struct AgentServer {
    registry: InstanceRegistry,
    directory: Arc<Directory>,
    writer: Arc<MetricWriter>,
    read_timeout: Duration,
    send_timeout: Duration,
}

impl AgentServer {
    pub fn new(
        registry: InstanceRegistry,
        directory: Arc<Directory>,
        writer: Arc<MetricWriter>,
        read_timeout: Duration,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            directory,
            writer,
            read_timeout,
            send_timeout,
        }
    }

    /// Accept loop; one task per session.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> QanResult<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "agent connection accepted");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_session(stream).await {
                            tracing::info!(%peer, error = %err, "agent session ended");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                }
            }
        }
    }

    async fn handle_session(&self, stream: TcpStream) -> QanResult<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut hello_line = String::new();
        match timeout(self.read_timeout, reader.read_line(&mut hello_line)).await {
            Err(_) => return Err(QanError::Timeout),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(_)) => {}
        }
        let hello: Hello = serde_json::from_str(hello_line.trim())
            .map_err(|err| QanError::bad_data(format!("bad handshake: {err}")))?;

        // The agent must be a known instance.
        let agent_id = match self.registry.instance_id(&hello.agent_uuid).await {
            Ok(id) if id > 0 => id,
            _ => {
                let response = Response {
                    code: 404,
                    error: format!("unknown agent {}", hello.agent_uuid),
                };
                let mut line = serde_json::to_string(&response)?;
                line.push('\n');
                let _ = write_half.write_all(line.as_bytes()).await;
                return Err(QanError::NotFound);
            }
        };

        match hello.channel.as_str() {
            "agent" => {
                let conn = Arc::new(AgentConn::new(
                    agent_id,
                    hello.agent_uuid.clone(),
                    write_half,
                    self.send_timeout,
                ));
                self.directory.register(agent_id, conn.clone()).await;
                tracing::info!(agent_id, uuid = %hello.agent_uuid, "agent connected");

                run_reader(&conn, reader).await;

                self.directory.remove(agent_id, &conn).await;
                tracing::info!(agent_id, uuid = %hello.agent_uuid, "agent disconnected");
                Ok(())
            }
            "data" => {
                IngestSession::run(
                    reader,
                    write_half,
                    &self.writer,
                    &self.registry,
                    self.read_timeout,
                )
                .await
            }
            other => {
                let response = Response {
                    code: 400,
                    error: format!("unknown channel {other:?}"),
                };
                let mut line = serde_json::to_string(&response)?;
                line.push('\n');
                let _ = write_half.write_all(line.as_bytes()).await;
                Err(QanError::bad_data(format!("unknown channel {other:?}")))
            }
        }
    }
}
