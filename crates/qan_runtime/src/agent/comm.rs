//! One connected agent: write serialization, request/reply correlation, and
//! liveness tracking over a persistent line-framed connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

use crate::errors::{QanError, QanResult};
use crate::proto::{Cmd, Reply};

type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

pub struct AgentConn {
    agent_id: i64,
    uuid: String,
    writer: Mutex<WriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    last_seen: AtomicI64,
    closed: AtomicBool,
    send_timeout: Duration,
}

impl AgentConn {
    pub fn new(
        agent_id: i64,
        uuid: String,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        send_timeout: Duration,
    ) -> Self {
        Self {
            agent_id,
            uuid,
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            last_seen: AtomicI64::new(Utc::now().timestamp()),
            closed: AtomicBool::new(false),
            send_timeout,
        }
    }

    pub fn agent_id(&self) -> i64 {
        self.agent_id
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Seconds since the last inbound traffic from this agent.
    pub fn idle_secs(&self) -> i64 {
        Utc::now().timestamp() - self.last_seen.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.last_seen.store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a command and wait for the correlated reply. Serializes writes on
    /// the connection; replies are demultiplexed by id to their waiters. A
    /// pending send unblocks with an error when the connection closes, or
    /// with [`QanError::Timeout`] when the deadline passes.
    pub async fn send(&self, mut cmd: Cmd) -> QanResult<Reply> {
        if self.is_closed() {
            return Err(QanError::AgentNotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        cmd.id = id;
        if cmd.ts.is_none() {
            cmd.ts = Some(Utc::now());
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut line = serde_json::to_string(&cmd)?;
        line.push('\n');
        {
            let mut writer = self.writer.lock().await;
            if writer.write_all(line.as_bytes()).await.is_err() || writer.flush().await.is_err() {
                self.pending.lock().await.remove(&id);
                return Err(QanError::AgentNotConnected);
            }
        }

        match timeout(self.send_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Sender dropped: the connection closed under us.
            Ok(Err(_)) => Err(QanError::AgentNotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(QanError::Timeout)
            }
        }
    }

    /// Route an inbound reply to its waiter. Unmatched replies are dropped;
    /// the waiter may already have timed out.
    pub async fn handle_reply(&self, reply: Reply) {
        self.touch();
        let waiter = self.pending.lock().await.remove(&reply.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => {
                tracing::debug!(agent_id = self.agent_id, reply_id = reply.id,
                    "reply with no waiter, dropping");
            }
        }
    }

    /// Mark closed and fail every pending send.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().await.clear();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Drive the read side of an agent connection: every line is a reply (or a
/// bare heartbeat) from the agent. Returns when the agent disconnects.
pub async fn run_reader<R>(conn: &AgentConn, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                conn.touch();
                if line.trim().is_empty() {
                    continue; // heartbeat
                }
                match serde_json::from_str::<Reply>(&line) {
                    Ok(reply) => conn.handle_reply(reply).await,
                    Err(err) => {
                        tracing::warn!(agent_id = conn.agent_id(), error = %err,
                            "undecodable frame on agent channel");
                    }
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    conn.close().await;
}
