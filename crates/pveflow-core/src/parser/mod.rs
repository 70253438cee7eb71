//! KDLパーサー
//!
//! pveflow.kdl をパースして [`Project`] を生成します。
//! ノードタイプごとのパース処理はモジュールに分離されています。

mod environment;

pub use environment::{parse_endpoint, parse_environment};

use crate::error::{FlowError, Result};
use crate::loader::Project;
use kdl::{KdlDocument, KdlNode, KdlValue};
use std::collections::BTreeMap;

/// KDL文字列をパース
pub fn parse_kdl_string(content: &str) -> Result<Project> {
    let doc: KdlDocument = content.parse()?;

    let mut endpoint = None;
    let mut environments = BTreeMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "endpoint" => {
                endpoint = Some(parse_endpoint(node)?);
            }
            "environment" => {
                let env = parse_environment(node)?;
                if environments.contains_key(&env.name) {
                    return Err(FlowError::InvalidConfig(format!(
                        "environment '{}' is declared twice",
                        env.name
                    )));
                }
                environments.insert(env.name.clone(), env);
            }
            other => {
                // 不明なノードはスキップ
                tracing::debug!("Skipping unknown top-level node: {}", other);
            }
        }
    }

    Ok(Project {
        endpoint,
        environments,
    })
}

/// Positional arguments of a node (entries without a name)
fn args(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

fn prop<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(key))
        .map(|e| e.value())
}

fn first_string(node: &KdlNode) -> Option<String> {
    args(node).next().and_then(|v| v.as_string()).map(|s| s.to_string())
}

fn required_string(node: &KdlNode, what: &str) -> Result<String> {
    first_string(node).ok_or_else(|| {
        FlowError::InvalidConfig(format!(
            "{} requires a string argument",
            what
        ))
    })
}

fn strings(node: &KdlNode) -> Vec<String> {
    args(node)
        .filter_map(|v| v.as_string().map(|s| s.to_string()))
        .collect()
}

fn prop_string(node: &KdlNode, key: &str) -> Option<String> {
    prop(node, key)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn to_u32(value: &KdlValue, what: &str) -> Result<u32> {
    value
        .as_integer()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| {
            FlowError::InvalidConfig(format!("{} requires a non-negative integer", what))
        })
}

fn first_u32(node: &KdlNode, what: &str) -> Result<u32> {
    let value = args(node)
        .next()
        .ok_or_else(|| FlowError::InvalidConfig(format!("{} requires a value", what)))?;
    to_u32(value, what)
}

fn u32_list(node: &KdlNode, what: &str) -> Result<Vec<u32>> {
    args(node).map(|v| to_u32(v, what)).collect()
}

fn first_bool(node: &KdlNode) -> bool {
    args(node).next().and_then(|v| v.as_bool()).unwrap_or(true)
}
