//! 設定の読み込みとProxmoxへの接続

use anyhow::Context as _;
use colored::Colorize;
use pveflow_cloud::{ClientError, ResourceClient};
use pveflow_cloud_proxmox::{ProxmoxClient, ProxmoxConfig};
use pveflow_core::{DesiredStateModel, Project, load_project_file};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 1回のコマンド実行で扱う環境
pub struct Environment {
    pub config_path: PathBuf,
    pub project_root: PathBuf,
    pub project: Project,
    pub name: String,
    pub model: DesiredStateModel,
}

impl Environment {
    /// 設定ファイルを探して環境を読み込み、検証済みモデルを構築する
    pub fn load(environment: Option<String>) -> anyhow::Result<Self> {
        let config_path = pveflow_config::find_config_file()?;
        tracing::debug!(path = %config_path.display(), "Using config file");
        let project = load_project_file(&config_path)?;
        let name = determine_environment_name(environment, &project)?;
        let model = project.desired_state(&name)?;

        Ok(Self {
            project_root: pveflow_config::project_root(&config_path),
            config_path,
            project,
            name,
            model,
        })
    }

    /// APIトークンを環境変数から読み、認証を確認したクライアントを返す
    pub async fn connect(&self, insecure: bool) -> anyhow::Result<Arc<ProxmoxClient>> {
        let endpoint = self.project.endpoint.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "endpoint が設定されていません: {}",
                self.config_path.display()
            )
        })?;

        let mut config = ProxmoxConfig::from_env(endpoint, self.model.node())?;
        if insecure {
            config = config.with_insecure_tls(true);
        }
        config.check_profile(&self.name, self.model.profile())?;
        if config.insecure_tls {
            eprintln!(
                "{} TLS証明書の検証が無効です（{}）",
                "⚠".yellow(),
                config.base_url
            );
        }

        let client = ProxmoxClient::new(&config)?;
        match client.check_auth().await {
            Ok(_) => {}
            Err(ClientError::AuthenticationFailed(message)) => {
                anyhow::bail!(
                    "Proxmoxの認証に失敗しました: {}\nPVE_TOKEN_ID / PVE_TOKEN_SECRET を確認してください",
                    message
                );
            }
            Err(e) => {
                return Err(e).with_context(|| format!("{} に接続できません", config.base_url));
            }
        }
        tracing::debug!(client = client.name(), "Connected");
        Ok(Arc::new(client))
    }
}

/// 環境名を決定する（指定がなければ唯一の環境）
pub fn determine_environment_name(
    environment: Option<String>,
    project: &Project,
) -> anyhow::Result<String> {
    if let Some(name) = environment {
        return Ok(name);
    }
    let mut names = project.environments.keys();
    match (names.next(), names.next()) {
        (Some(only), None) => Ok(only.clone()),
        (None, _) => Err(anyhow::anyhow!("設定ファイルに environment がありません")),
        _ => Err(anyhow::anyhow!(
            "環境名を指定してください: pve-fleet <command> -e <environment> または PVEFLOW_ENVIRONMENT=<environment>\n利用可能な環境: {}",
            project
                .environments
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )),
    }
}

/// Ctrl-C でキャンセルする
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!(
                "{}",
                "中断しています... 実行中のタスクの確認が終わるまでお待ちください".yellow()
            );
            token.cancel();
        }
    });
}
