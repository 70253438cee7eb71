//! `validate --full` で登録する到達性・ツール確認

use async_trait::async_trait;
use pveflow_cloud::{FnCheck, ObservedState, PostApplyCheck};
use pveflow_core::{DesiredStateModel, ResourceId, ResourceSpec};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

pub const SSH_PORT: u16 = 22;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// ゲストの観測アドレス
fn address_of(observed: &ObservedState) -> Result<String, String> {
    observed
        .address
        .clone()
        .ok_or_else(|| "IPアドレスが取得できません".to_string())
}

async fn probe_tcp(observed: ObservedState, port: u16, timeout: Duration) -> Result<String, String> {
    let address = address_of(&observed)?;
    match tokio::time::timeout(timeout, TcpStream::connect((address.as_str(), port))).await {
        Ok(Ok(_)) => Ok(format!("{}:{} に接続できました", address, port)),
        Ok(Err(e)) => Err(format!("{}:{} に接続できません: {}", address, port, e)),
        Err(_) => Err(format!(
            "{}:{} への接続がタイムアウトしました（{}秒）",
            address,
            port,
            timeout.as_secs()
        )),
    }
}

/// 指定ポートにTCP接続できるか
pub fn tcp_reachable(port: u16, timeout: Duration) -> Arc<dyn PostApplyCheck> {
    Arc::new(FnCheck::new(
        format!("tcp:{}", port),
        move |_spec: ResourceSpec, observed: ObservedState| probe_tcp(observed, port, timeout),
    ))
}

/// SSH到達性チェック
pub fn ssh_reachable() -> Arc<dyn PostApplyCheck> {
    tcp_reachable(SSH_PORT, CONNECT_TIMEOUT)
}

/// ノードごとに宣言されたツールが ssh 越しに見つかるか
pub struct ToolCheck {
    user: String,
    tools: BTreeMap<ResourceId, Vec<String>>,
}

impl ToolCheck {
    pub fn from_model(model: &DesiredStateModel) -> Self {
        let tools = model
            .resources()
            .filter(|spec| spec.id.kind.is_guest())
            .filter_map(|spec| {
                let tools = model.tools_for(&spec.id);
                (!tools.is_empty()).then(|| (spec.id.clone(), tools.to_vec()))
            })
            .collect();
        Self {
            user: "root".to_string(),
            tools,
        }
    }

    fn ssh_args(&self, address: &str, tool: &str) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT.as_secs()),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            format!("{}@{}", self.user, address),
            "command".to_string(),
            "-v".to_string(),
            tool.to_string(),
        ]
    }

    async fn has_tool(&self, address: &str, tool: &str) -> Result<bool, String> {
        let output = tokio::process::Command::new("ssh")
            .args(self.ssh_args(address, tool))
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(TOOL_TIMEOUT, output).await {
            Ok(Ok(output)) => {
                // 255 は ssh 自体の失敗
                if output.status.code() == Some(255) {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(format!("ssh {} に失敗しました: {}", address, stderr.trim()));
                }
                Ok(output.status.success())
            }
            Ok(Err(e)) => Err(format!("ssh を実行できません: {}", e)),
            Err(_) => Err(format!("ssh {} がタイムアウトしました", address)),
        }
    }
}

#[async_trait]
impl PostApplyCheck for ToolCheck {
    fn name(&self) -> &str {
        "tools"
    }

    async fn check(&self, spec: &ResourceSpec, observed: &ObservedState) -> Result<String, String> {
        let Some(tools) = self.tools.get(&spec.id) else {
            return Ok("宣言されたツールはありません".to_string());
        };
        let address = address_of(observed)?;

        let mut missing = Vec::new();
        for tool in tools {
            if !self.has_tool(&address, tool).await? {
                missing.push(tool.as_str());
            }
        }

        if missing.is_empty() {
            Ok(format!("{} が利用可能です", tools.join(", ")))
        } else {
            Err(format!("{} が見つかりません", missing.join(", ")))
        }
    }
}
