use crate::checks::{self, ToolCheck};
use crate::context::{self, Environment};
use crate::output;
use colored::Colorize;
use pveflow_cloud::{HealthValidator, ResourceClient, Scope};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct ValidateOptions {
    pub full: bool,
    pub offline: bool,
    pub insecure: bool,
    pub json: bool,
}

/// 設定と稼働中の環境を検証し、失敗したチェック数を返す
pub async fn handle(
    environment: Option<String>,
    options: ValidateOptions,
) -> anyhow::Result<usize> {
    if !options.json {
        println!("{}", "設定を検証中...".blue());
    }

    let env = match Environment::load(environment) {
        Ok(env) => env,
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ 設定エラー".red().bold());
            eprintln!("  {:#}", e);
            std::process::exit(1);
        }
    };

    if !options.json {
        println!(
            "設定ファイル: {}",
            env.config_path.display().to_string().cyan()
        );
        println!("{}", "✓ 設定ファイルは正常です！".green().bold());
        println!();
        output::print_model(&env.model);
    }

    if options.offline {
        if options.json {
            let summary = serde_json::json!({
                "environment": env.name,
                "valid": true,
                "resources": env
                    .model
                    .resources()
                    .map(|spec| spec.id.to_string())
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        return Ok(0);
    }

    if !options.json {
        println!();
        println!("{}", "Proxmoxに接続中...".blue());
    }
    let client: Arc<dyn ResourceClient> = env.connect(options.insecure).await?;

    let cancel = CancellationToken::new();
    context::cancel_on_ctrl_c(cancel.clone());
    let mut validator = HealthValidator::new(client).with_cancellation(cancel);

    let scope = if options.full {
        validator.register_post_apply_check(checks::ssh_reachable());
        validator.register_post_apply_check(Arc::new(ToolCheck::from_model(&env.model)));
        Scope::Full
    } else {
        Scope::Quick
    };

    let results = validator.validate(&env.model, scope).await;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        println!();
        println!("{}", "稼働状態:".bold());
        output::print_checks(&results);
    }

    Ok(results.iter().filter(|r| !r.passed).count())
}
