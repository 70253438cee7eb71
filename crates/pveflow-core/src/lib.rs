//! pveflow のコア
//!
//! Proxmox VE 環境の「あるべき状態」を表すモデルと、その検証・KDLパースを提供します。
//!
//! - [`EnvironmentConfig`]: パース済みの設定（外部から渡される入力）
//! - [`DesiredStateModel`]: 検証済みの目標トポロジー（ゾーン → VNet → サブネット → 管理ノード → VM群）
//! - [`ResourceSpec`]: 調停エンジンが扱う個々のリソース

pub mod desired;
pub mod error;
pub mod loader;
pub mod model;
pub mod parser;

pub use desired::DesiredStateModel;
pub use error::{FlowError, Result, ValidationError};
pub use loader::{Project, load_project_file};
pub use model::*;
