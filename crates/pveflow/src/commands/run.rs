//! deploy / destroy 共通の実行処理

use crate::RunArgs;
use crate::context::{self, Environment};
use crate::output;
use colored::Colorize;
use pveflow_cloud::{EngineOptions, Mode, ReconciliationEngine, ResourceClient, StateManager};
use std::sync::Arc;
use std::time::Duration;

/// 環境を調停し、失敗したリソース数を返す
pub async fn execute(
    env: &Environment,
    args: &RunArgs,
    mode: Mode,
    rollback: bool,
) -> anyhow::Result<usize> {
    if args.parallelism == 0 {
        anyhow::bail!("--parallelism は1以上を指定してください");
    }

    if !args.json {
        println!("{}", "Proxmoxに接続中...".blue());
    }
    let client: Arc<dyn ResourceClient> = env.connect(args.insecure).await?;

    let options = EngineOptions {
        parallelism: args.parallelism,
        dry_run: args.dry_run,
        run_timeout: args.timeout.map(Duration::from_secs),
        rollback_failed_creates: rollback,
        ..Default::default()
    };
    let engine = ReconciliationEngine::with_options(client, options);
    context::cancel_on_ctrl_c(engine.cancellation_token());

    if args.dry_run {
        let report = engine.reconcile(&env.model, mode).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report.summary())?);
        } else {
            output::print_plan(&report.plan());
            println!();
            println!("{}", "（--dry-run のため変更は行っていません）".dimmed());
        }
        return Ok(report.failed_count());
    }

    let state = StateManager::new(&env.project_root, &env.name);
    let lock = state.acquire_lock().await?;

    let result = engine.reconcile(&env.model, mode).await;
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            lock.release().await?;
            return Err(e.into());
        }
    };
    if let Err(e) = state.record_run(&report).await {
        tracing::warn!(error = %e, "Failed to record run state");
    }
    lock.release().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.summary())?);
    } else {
        output::print_report(&report);
    }
    Ok(report.failed_count())
}
