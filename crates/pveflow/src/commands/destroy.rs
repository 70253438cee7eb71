use super::run;
use crate::RunArgs;
use crate::context::Environment;
use colored::Colorize;
use pveflow_cloud::{DependencyGraph, Mode};

pub async fn handle(args: &RunArgs, yes: bool) -> anyhow::Result<usize> {
    let env = Environment::load(args.environment.clone())?;
    if !args.json {
        println!("{}", "環境を破棄中...".red());
        println!("環境: {}", env.name.cyan());
    }

    if !yes && !args.dry_run {
        let order = DependencyGraph::build(&env.model)?.teardown_order();
        if args.json {
            let pending = serde_json::json!({
                "environment": env.name,
                "confirmed": false,
                "teardown_order": order.iter().map(ToString::to_string).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&pending)?);
            return Ok(0);
        }
        println!();
        println!(
            "{}",
            format!("⚠ 以下の{}個のリソースを削除します:", order.len())
                .yellow()
                .bold()
        );
        for id in &order {
            println!("  - {}", id.to_string().red());
        }
        println!();
        println!(
            "実行するには {} を付けてください（{} で計画のみ表示）",
            "--yes".cyan(),
            "--dry-run".cyan()
        );
        return Ok(0);
    }

    run::execute(&env, args, Mode::Destroy, false).await
}
