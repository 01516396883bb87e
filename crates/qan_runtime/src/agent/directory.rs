//! Registry of connected agents, keyed by internal agent id. A background
//! reaper closes and removes entries that have gone quiet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::agent::comm::AgentConn;

#[derive(Default)]
pub struct Directory {
    agents: RwLock<HashMap<i64, Arc<AgentConn>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, evicting (with a close) any previous connection
    /// registered for the same agent.
    pub async fn register(&self, agent_id: i64, conn: Arc<AgentConn>) {
        let previous = self.agents.write().await.insert(agent_id, conn);
        if let Some(previous) = previous {
            tracing::info!(agent_id, "evicting previous agent connection");
            previous.close().await;
        }
    }

    pub async fn get(&self, agent_id: i64) -> Option<Arc<AgentConn>> {
        self.agents.read().await.get(&agent_id).cloned()
    }

    /// Remove an entry, but only if it still maps to this connection; a
    /// reconnecting agent may already have replaced it.
    pub async fn remove(&self, agent_id: i64, conn: &Arc<AgentConn>) {
        let mut agents = self.agents.write().await;
        if let Some(current) = agents.get(&agent_id) {
            if Arc::ptr_eq(current, conn) {
                agents.remove(&agent_id);
            }
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Close and drop every connection whose last heartbeat is older than
    /// `max_idle`.
    pub async fn refresh(&self, max_idle: Duration) {
        let stale: Vec<(i64, Arc<AgentConn>)> = {
            let agents = self.agents.read().await;
            agents
                .iter()
                .filter(|(_, conn)| conn.idle_secs() >= max_idle.as_secs() as i64)
                .map(|(id, conn)| (*id, conn.clone()))
                .collect()
        };
        if stale.is_empty() {
            return;
        }

        let mut agents = self.agents.write().await;
        for (agent_id, conn) in stale {
            if let Some(current) = agents.get(&agent_id) {
                if Arc::ptr_eq(current, &conn) {
                    tracing::info!(agent_id, idle_secs = conn.idle_secs(),
                        "reaping idle agent connection");
                    agents.remove(&agent_id);
                }
            }
            conn.close().await;
        }
    }

    /// Periodic reaper; runs for the life of the process.
    pub fn start_reaper(self: Arc<Self>, period: Duration, max_idle: Duration) {
        let directory = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                directory.refresh(max_idle).await;
            }
        });
    }
}
