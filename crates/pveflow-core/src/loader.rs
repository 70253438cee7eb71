//! プロジェクトファイルのロード

use crate::desired::DesiredStateModel;
use crate::error::{FlowError, Result};
use crate::model::{EndpointConfig, EnvironmentConfig};
use crate::parser::parse_kdl_string;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, instrument};

/// パース済みのプロジェクト（endpoint + 環境一覧）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Project {
    pub endpoint: Option<EndpointConfig>,
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl Project {
    /// 環境名から設定を取得
    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments
            .get(name)
            .ok_or_else(|| FlowError::EnvironmentNotFound {
                name: name.to_string(),
                available: self.environments.keys().cloned().collect(),
            })
    }

    /// 環境を検証して目標状態モデルを構築
    pub fn desired_state(&self, name: &str) -> Result<DesiredStateModel> {
        let config = self.environment(name)?;
        Ok(DesiredStateModel::load(config)?)
    }
}

/// KDLファイルを読み込んでプロジェクトを生成
#[instrument(skip(path), fields(path = %path.as_ref().display()))]
pub fn load_project_file<P: AsRef<Path>>(path: P) -> Result<Project> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| FlowError::IoError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let project = parse_kdl_string(&content)?;
    debug!(
        environments = project.environments.len(),
        "Project file parsed"
    );
    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_project_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("pveflow.kdl");
        fs::write(
            &path,
            r#"
            environment "dev" {
                node "pve"
                management 200 { hostname "mgmt" }
            }
            "#,
        )
        .unwrap();

        let project = load_project_file(&path).unwrap();
        assert!(project.endpoint.is_none());
        assert!(project.environment("dev").is_ok());

        match project.environment("prod") {
            Err(FlowError::EnvironmentNotFound { name, available }) => {
                assert_eq!(name, "prod");
                assert_eq!(available, vec!["dev".to_string()]);
            }
            other => panic!("Expected EnvironmentNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = load_project_file(temp_dir.path().join("missing.kdl"));
        assert!(matches!(result, Err(FlowError::IoError { .. })));
    }
}
