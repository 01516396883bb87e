//! Command routing: pre-process selected commands before dispatch to the
//! agent, post-process selected replies before they go back to the client.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::agent::directory::Directory;
use crate::database::instances::{InstanceRegistry, INTERNAL_INSTANCE_NAME};
use crate::errors::{QanError, QanResult};
use crate::proto::{Cmd, Reply, SUBSYSTEM_MYSQL};

/// Deadline for the visual-explain subprocess.
const VISUAL_EXPLAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CommandRouter {
    registry: InstanceRegistry,
    collect_path: PathBuf,
    visual_explain_bin: String,
}

impl CommandRouter {
    pub fn new(registry: InstanceRegistry, collect_path: PathBuf) -> Self {
        Self {
            registry,
            collect_path,
            visual_explain_bin: "pt-visual-explain".to_string(),
        }
    }

    #[cfg(test)]
    fn with_visual_explain_bin(mut self, bin: &str) -> Self {
        self.visual_explain_bin = bin.to_string();
        self
    }

    /// Full round-trip: pre-process, locate the agent, send, post-process.
    pub async fn dispatch(
        &self,
        directory: &Directory,
        agent_id: i64,
        mut cmd: Cmd,
    ) -> QanResult<Reply> {
        self.pre_process(&mut cmd).await?;

        let conn = directory
            .get(agent_id)
            .await
            .ok_or(QanError::AgentNotConnected)?;
        let mut reply = conn.send(cmd).await?;

        self.post_process(&mut reply).await;
        Ok(reply)
    }

    /// Rewrite command payloads before dispatch. RestartTool carrying a QAN
    /// configuration for the server's own monitoring instance is pinned to
    /// harvesting SELECT/DELETE statements only.
    pub async fn pre_process(&self, cmd: &mut Cmd) -> QanResult<()> {
        if cmd.cmd != "RestartTool" {
            return Ok(());
        }

        let mut payload: Value = serde_json::from_slice(&cmd.data)
            .map_err(|err| QanError::bad_data(format!("cannot decode QAN config: {err}")))?;
        let uuid = payload
            .get("UUID")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if uuid.is_empty() {
            return Ok(());
        }

        let (_, instance) = self.registry.get(&uuid).await?;
        if instance.name == INTERNAL_INSTANCE_NAME && instance.subsystem == SUBSYSTEM_MYSQL {
            payload["FilterAllow"] = serde_json::json!(["SELECT", "DELETE"]);
            cmd.data = serde_json::to_vec(&payload)?;
        }
        Ok(())
    }

    /// Rewrite reply payloads before returning to the client. Never fails
    /// the call: processing errors are attached to the reply.
    pub async fn post_process(&self, reply: &mut Reply) {
        if reply.cmd == "Explain" {
            match add_visual_explain(&reply.data, &self.visual_explain_bin).await {
                Ok(data) => reply.data = data,
                Err(err) => {
                    let type_err = serde_json::json!({
                        "Type": "visual",
                        "Message": format!("cannot do visual explain: {err}"),
                    });
                    reply.error = type_err.to_string();
                }
            }
        }

        self.extract_response_file(reply).await;
    }

    /// Replies shaped `{Filename, Data}` carry a base64 file: persist it to
    /// the collect path and blank the payload before it reaches the client.
    async fn extract_response_file(&self, reply: &mut Reply) {
        #[derive(Default, Serialize, Deserialize)]
        #[serde(rename_all = "PascalCase", default)]
        struct ResponseFile {
            filename: String,
            data: String,
        }

        let Ok(mut dst) = serde_json::from_slice::<ResponseFile>(&reply.data) else {
            return;
        };
        if dst.filename.is_empty() {
            return;
        }

        let write_result = match BASE64.decode(dst.data.as_bytes()) {
            Ok(bytes) => {
                // Only the file name; an agent must not pick the directory.
                let name = Path::new(&dst.filename)
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| dst.filename.clone().into());
                let path = self.collect_path.join(name);
                tokio::fs::write(&path, &bytes)
                    .await
                    .map_err(|err| format!("cannot write output file {path:?}: {err}"))
            }
            Err(err) => Err(format!("cannot decode output file {:?}: {err}", dst.filename)),
        };

        // Never ship the raw bytes back to the client.
        dst.data = String::new();
        if let Ok(data) = serde_json::to_vec(&dst) {
            reply.data = data;
        }
        if let Err(message) = write_result {
            reply.error = message;
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ExplainReply {
    classic: Vec<ExplainRow>,
    #[serde(rename = "JSON")]
    json: String,
    visual: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ExplainRow {
    id: Value,
    select_type: Value,
    table: Value,
    partitions: Value,
    #[serde(rename = "Type")]
    type_: Value,
    possible_keys: Value,
    key: Value,
    key_len: Value,
    #[serde(rename = "Ref")]
    ref_: Value,
    rows: Value,
    filtered: Value,
    extra: Value,
}

fn explain_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        // Nullable columns may arrive as {String, Valid} wrappers.
        Value::Object(map) => {
            if map.get("Valid").and_then(Value::as_bool) == Some(false) {
                "NULL".to_string()
            } else if let Some(inner) = map.values().find(|v| !v.is_boolean()) {
                explain_cell(inner)
            } else {
                "NULL".to_string()
            }
        }
        other => other.to_string(),
    }
}

/// Pipe the classic row-form explain through the visual-explain tool and
/// attach the rendered tree.
async fn add_visual_explain(data: &[u8], bin: &str) -> Result<Vec<u8>, QanError> {
    let mut explains: ExplainReply = serde_json::from_slice(data)
        .map_err(|err| QanError::bad_data(format!("cannot decode classic explain: {err}")))?;

    let mut tsv = vec![
        "id\tselect_type\ttable\tpartitions\ttype\tpossible_keys\tkey\tkey_len\tref\trows\tfiltered\tExtra"
            .to_string(),
    ];
    for row in &explains.classic {
        tsv.push(
            [
                &row.id,
                &row.select_type,
                &row.table,
                &row.partitions,
                &row.type_,
                &row.possible_keys,
                &row.key,
                &row.key_len,
                &row.ref_,
                &row.rows,
                &row.filtered,
                &row.extra,
            ]
            .iter()
            .map(|v| explain_cell(v))
            .collect::<Vec<_>>()
            .join("\t"),
        );
    }
    let raw_explain = tsv.join("\n");

    let mut child = Command::new(bin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| QanError::Subprocess {
            message: format!("cannot execute {bin}: {err}"),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(raw_explain.as_bytes()).await;
        let _ = stdin.write_all(b"\n").await;
        // Dropping stdin closes the pipe so the tool can finish.
    }

    let output = tokio::time::timeout(VISUAL_EXPLAIN_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| QanError::Subprocess {
            message: format!("{bin} timed out"),
        })?
        .map_err(|err| QanError::Subprocess {
            message: format!("cannot execute {bin}: {err}"),
        })?;

    if !output.status.success() {
        return Err(QanError::Subprocess {
            message: format!("{bin} exited with {}", output.status),
        });
    }

    explains.visual = String::from_utf8_lossy(&output.stdout).to_string();
    Ok(serde_json::to_vec(&explains)?)
}
