use super::run;
use crate::RunArgs;
use crate::context::Environment;
use colored::Colorize;
use pveflow_cloud::Mode;

pub async fn handle(args: &RunArgs, rollback: bool) -> anyhow::Result<usize> {
    let env = Environment::load(args.environment.clone())?;
    if !args.json {
        println!("{}", "環境を構築中...".green());
        println!("環境: {}", env.name.cyan());
        println!("リソース: {}個", env.model.len());
    }

    run::execute(&env, args, Mode::Apply, rollback).await
}
