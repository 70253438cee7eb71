mod checks;
mod commands;
mod context;
mod output;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pve-fleet")]
#[command(about = "Proxmox VE のラボ環境を宣言どおりに構築・破棄する", long_about = None)]
struct Cli {
    /// ログを詳細にする（-v: debug, -vv: trace）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// エラー以外のログを抑制
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// deploy / destroy 共通のオプション
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// 環境名（省略時は唯一の環境）
    #[arg(short, long, env = "PVEFLOW_ENVIRONMENT")]
    pub environment: Option<String>,

    /// 変更を加えずに計画だけを表示
    #[arg(long)]
    pub dry_run: bool,

    /// 同時に処理するリソース数
    #[arg(short = 'j', long = "parallelism", default_value_t = 1)]
    pub parallelism: usize,

    /// 実行全体のタイムアウト（秒）
    #[arg(long)]
    pub timeout: Option<u64>,

    /// TLS証明書の検証を無効化（production プロファイルでは拒否）
    #[arg(long)]
    pub insecure: bool,

    /// 実行結果のサマリーをJSONで出力
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// 環境を構築（ゾーン → VNet → サブネット → 管理ノード → VM）
    Deploy {
        #[command(flatten)]
        run: RunArgs,
        /// 作成に失敗したリソースを削除する
        #[arg(long)]
        rollback: bool,
    },
    /// 環境を逆順に破棄
    Destroy {
        #[command(flatten)]
        run: RunArgs,
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// 設定と稼働中の環境を検証
    Validate {
        /// 環境名（省略時は唯一の環境）
        #[arg(short, long, env = "PVEFLOW_ENVIRONMENT")]
        environment: Option<String>,
        /// 到達性とツールの有無も確認
        #[arg(long)]
        full: bool,
        /// 設定の検証のみ行い、Proxmoxには接続しない
        #[arg(long, conflicts_with = "full")]
        offline: bool,
        /// TLS証明書の検証を無効化（production プロファイルでは拒否）
        #[arg(long)]
        insecure: bool,
        /// 検証結果をJSONで出力
        #[arg(long)]
        json: bool,
    },
    /// バージョン情報を表示
    Version,
}

/// `-v` / `-q` からログレベルを決める。RUST_LOG が優先される
fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// 失敗したリソース数を終了コードにする（125で頭打ち）
fn exit_code(failed: usize) -> i32 {
    failed.min(125) as i32
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let failed = match cli.command {
        Commands::Version => {
            println!("pveflow {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Commands::Deploy { run, rollback } => commands::deploy::handle(&run, rollback).await?,
        Commands::Destroy { run, yes } => commands::destroy::handle(&run, yes).await?,
        Commands::Validate {
            environment,
            full,
            offline,
            insecure,
            json,
        } => {
            let options = commands::validate::ValidateOptions {
                full,
                offline,
                insecure,
                json,
            };
            commands::validate::handle(environment, options).await?
        }
    };

    if failed > 0 {
        std::process::exit(exit_code(failed));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exit_code_is_capped() {
        assert_eq!(exit_code(0), 0);
        assert_eq!(exit_code(3), 3);
        assert_eq!(exit_code(400), 125);
    }

    #[test]
    fn test_parse_deploy_flags() {
        let cli = Cli::try_parse_from([
            "pve-fleet", "-vv", "deploy", "-e", "dev", "--dry-run", "-j", "2", "--timeout", "600",
            "--rollback",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Deploy { run, rollback } => {
                assert_eq!(run.environment.as_deref(), Some("dev"));
                assert!(run.dry_run);
                assert_eq!(run.parallelism, 2);
                assert_eq!(run.timeout, Some(600));
                assert!(rollback);
            }
            _ => panic!("Expected deploy"),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["pve-fleet", "-q", "-v", "version"]).is_err());
    }
}
