use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "設定ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: pveflow.local.kdl, .pveflow.local.kdl, pveflow.kdl, .pveflow.kdl\n\
        - ./.pveflow/ ディレクトリ\n\
        - ~/.config/pveflow/pveflow.kdl\n\
        または PVEFLOW_CONFIG_PATH 環境変数で直接指定できます"
    )]
    ConfigFileNotFound,

    #[error("PVEFLOW_CONFIG_PATH が存在しないファイルを指しています: {0}")]
    ConfigPathMissing(String),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
