//! 管理ノードとVM群

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// ノードのネットワーク接続
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeNetwork {
    pub vnet: String,
    /// アドレスとプレフィックス長（例: 10.100.1.10/24）
    pub ip: IpNet,
}

/// 管理ノード（自動化ツールを載せるLXCコンテナ）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementNode {
    pub id: u32,
    pub hostname: String,
    pub template: String,
    pub memory_mb: u32,
    pub cores: u32,
    pub storage: String,
    pub disk_size_gb: u32,
    pub network: NodeNetwork,
    pub ssh_keys: Vec<String>,
    pub tools: Vec<String>,
}

/// fleetのVM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetMember {
    /// 論理名（例: "docker-01"）
    pub name: String,
    pub vmid: u32,
    pub template: String,
    pub memory_mb: u32,
    pub cores: u32,
    pub storage: String,
    pub disk_size_gb: u32,
    pub disk_type: String,
    pub network: NodeNetwork,
    /// 構成管理側のグルーピングキーとしても使われる
    pub tags: BTreeSet<String>,
    pub depends_on: BTreeSet<String>,
    pub tools: Vec<String>,
}
