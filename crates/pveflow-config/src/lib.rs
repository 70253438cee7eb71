pub mod error;

pub use error::*;

use std::path::{Path, PathBuf};

/// 設定ファイルパスを直接指定する環境変数
pub const CONFIG_PATH_ENV: &str = "PVEFLOW_CONFIG_PATH";

/// プロジェクトローカルの設定ディレクトリ名
pub const PROJECT_DIR: &str = ".pveflow";

const CANDIDATES: [&str; 4] = [
    "pveflow.local.kdl",
    ".pveflow.local.kdl",
    "pveflow.kdl",
    ".pveflow.kdl",
];

/// プロジェクトのpveflow.kdlファイルを探す
///
/// 以下の優先順位で設定ファイルを検索:
/// 1. 環境変数 PVEFLOW_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: pveflow.local.kdl, .pveflow.local.kdl, pveflow.kdl, .pveflow.kdl
/// 3. ./.pveflow/ ディレクトリ内: 同様の順序
/// 4. ~/.config/pveflow/pveflow.kdl (グローバル設定)
pub fn find_config_file() -> Result<PathBuf> {
    // 1. 環境変数で直接指定（存在しなければエラー）
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(&config_path);
        if path.is_file() {
            return Ok(path);
        }
        return Err(ConfigError::ConfigPathMissing(config_path));
    }

    let current_dir = std::env::current_dir()?;

    // 2. カレントディレクトリで検索
    if let Some(path) = find_in(&current_dir) {
        return Ok(path);
    }

    // 3. ./.pveflow/ ディレクトリで検索
    let project_dir = current_dir.join(PROJECT_DIR);
    if project_dir.is_dir() {
        if let Some(path) = find_in(&project_dir) {
            return Ok(path);
        }
    }

    // 4. グローバル設定ファイル
    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("pveflow").join("pveflow.kdl");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|filename| dir.join(filename))
        .find(|path| path.is_file())
}

/// 設定ファイルに対応するプロジェクトルート（状態ファイルの置き場所）
///
/// `./.pveflow/` 内の設定ファイルならその親ディレクトリ。
pub fn project_root(config_file: &Path) -> PathBuf {
    let dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if dir.file_name().is_some_and(|name| name == PROJECT_DIR) {
        dir.parent().unwrap_or(dir).to_path_buf()
    } else {
        dir.to_path_buf()
    }
}
