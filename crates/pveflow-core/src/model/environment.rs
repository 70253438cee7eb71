//! 環境設定（パース済みの入力）
//!
//! KDLやJSONから読み込まれた直後の未検証データ。
//! 検証は [`crate::DesiredStateModel::load`] で行う。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Proxmox API エンドポイント設定
///
/// トークンは含めない（環境変数から取得する）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// 例: "https://pve.lab:8006"
    pub url: String,

    /// デフォルトのノード名
    pub node: Option<String>,

    /// 自己署名証明書を許可するか（明示的なオプトインのみ）
    pub insecure_tls: bool,
}

/// 環境プロファイル
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Lab,
    #[default]
    Production,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Lab => write!(f, "lab"),
            Profile::Production => write!(f, "production"),
        }
    }
}

/// 1環境分の設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,

    /// 対象ノード名（例: "pve"）
    pub node: String,

    pub profile: Profile,

    /// テンプレート用に予約済みのVMID
    pub reserved_ids: Vec<u32>,

    pub network: NetworkConfig,

    pub management: ManagementConfig,

    /// 論理名 → VM設定
    pub fleet: BTreeMap<String, FleetMemberConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub zone: ZoneConfig,
    pub vnets: Vec<VNetConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    /// SDN zone plugin ("simple", "vlan", ...)
    pub zone_type: String,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            zone_type: "simple".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VNetConfig {
    pub name: String,
    pub alias: Option<String>,
    pub subnet: SubnetConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// 例: "10.100.2.0/24"
    pub cidr: String,
    /// 省略時はCIDRの最初のホストアドレス
    pub gateway: Option<String>,
    pub dhcp_start: Option<String>,
    pub dhcp_end: Option<String>,
    pub snat: bool,
}

/// 管理ノード（LXCコンテナ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagementConfig {
    pub id: u32,
    pub hostname: String,
    /// ostemplate (例: "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst")
    pub template: String,
    pub memory_mb: u32,
    pub cores: u32,
    pub storage: String,
    pub disk_size_gb: u32,
    pub vnet: String,
    /// 例: "10.100.1.10/24"
    pub ip: String,
    pub ssh_keys: Vec<String>,
    /// Full検証で存在確認するコマンド
    pub tools: Vec<String>,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            id: 0,
            hostname: String::new(),
            template: String::new(),
            memory_mb: 2048,
            cores: 2,
            storage: "local-lvm".to_string(),
            disk_size_gb: 8,
            vnet: String::new(),
            ip: String::new(),
            ssh_keys: Vec::new(),
            tools: Vec::new(),
        }
    }
}

/// VM設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetMemberConfig {
    pub vmid: u32,
    /// クローン元テンプレート名
    pub template: String,
    pub memory_mb: u32,
    pub cores: u32,
    pub storage: String,
    pub disk_size_gb: u32,
    pub disk_type: String,
    pub vnet: String,
    pub ip: String,
    pub tags: Vec<String>,
    /// 同じfleet内の論理名
    pub depends_on: Vec<String>,
    pub tools: Vec<String>,
}

impl Default for FleetMemberConfig {
    fn default() -> Self {
        Self {
            vmid: 0,
            template: String::new(),
            memory_mb: 2048,
            cores: 2,
            storage: "local-lvm".to_string(),
            disk_size_gb: 32,
            disk_type: "scsi".to_string(),
            vnet: String::new(),
            ip: String::new(),
            tags: Vec::new(),
            depends_on: Vec::new(),
            tools: Vec::new(),
        }
    }
}
