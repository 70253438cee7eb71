//! 調停対象リソースの汎用表現

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// モデル・エンジン・クライアントで共有する属性キー
pub mod attr {
    pub const TYPE: &str = "type";
    pub const ZONE: &str = "zone";
    pub const ALIAS: &str = "alias";
    pub const VNET: &str = "vnet";
    pub const CIDR: &str = "cidr";
    pub const GATEWAY: &str = "gateway";
    pub const DHCP_START: &str = "dhcp_start";
    pub const DHCP_END: &str = "dhcp_end";
    pub const SNAT: &str = "snat";
    pub const NAME: &str = "name";
    pub const HOSTNAME: &str = "hostname";
    pub const TEMPLATE: &str = "template";
    pub const MEMORY: &str = "memory";
    pub const CORES: &str = "cores";
    pub const STORAGE: &str = "storage";
    pub const DISK_SIZE: &str = "disk_size";
    pub const DISK_TYPE: &str = "disk_type";
    pub const IP: &str = "ip";
    pub const SSH_KEYS: &str = "ssh_keys";
    pub const TAGS: &str = "tags";
}

/// リソース種別
///
/// 宣言順がそのまま適用順の優先度になる（Zone < VNet < Subnet < Container < Vm）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Zone,
    #[serde(rename = "vnet")]
    VNet,
    Subnet,
    Container,
    Vm,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Zone => "zone",
            ResourceKind::VNet => "vnet",
            ResourceKind::Subnet => "subnet",
            ResourceKind::Container => "container",
            ResourceKind::Vm => "vm",
        }
    }

    /// その場で変更できない属性（変わると作り直しになる）
    pub fn immutable_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Zone => &[attr::TYPE],
            ResourceKind::VNet => &[attr::ZONE],
            ResourceKind::Subnet => &[attr::CIDR, attr::VNET],
            ResourceKind::Container => &[attr::HOSTNAME, attr::TEMPLATE, attr::STORAGE],
            ResourceKind::Vm => &[attr::TEMPLATE, attr::DISK_TYPE, attr::STORAGE],
        }
    }

    /// コンテナ・VMなど起動状態を持つリソースか
    pub fn is_guest(&self) -> bool {
        matches!(self, ResourceKind::Container | ResourceKind::Vm)
    }

    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ResourceKind::Zone | ResourceKind::VNet | ResourceKind::Subnet
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zone" => Ok(ResourceKind::Zone),
            "vnet" => Ok(ResourceKind::VNet),
            "subnet" => Ok(ResourceKind::Subnet),
            "container" => Ok(ResourceKind::Container),
            "vm" => Ok(ResourceKind::Vm),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

/// 種別内で一意なリソースキー
///
/// 順序は `(kind, name)` で、適用順の同順位もこれで決まる。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn zone(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Zone, name)
    }

    pub fn vnet(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::VNet, name)
    }

    pub fn subnet(cidr: impl Into<String>) -> Self {
        Self::new(ResourceKind::Subnet, cidr)
    }

    pub fn container(vmid: u32) -> Self {
        Self::new(ResourceKind::Container, vmid.to_string())
    }

    pub fn vm(vmid: u32) -> Self {
        Self::new(ResourceKind::Vm, vmid.to_string())
    }

    /// コンテナ・VMの数値ID
    pub fn vmid(&self) -> Option<u32> {
        if self.kind.is_guest() {
            self.name.parse().ok()
        } else {
            None
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid resource id: {}", s))?;
        if name.is_empty() {
            return Err(format!("invalid resource id: {}", s));
        }
        Ok(Self::new(kind.parse()?, name))
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 型付き属性値
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            AttrValue::List(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{}", v),
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Str(v) => write!(f, "{:?}", v),
            AttrValue::List(v) => write!(f, "[{}]", v.join(", ")),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::Int(i64::from(v))
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(v: Vec<String>) -> Self {
        AttrValue::List(v)
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// 目標属性と依存関係を持つ管理対象
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: ResourceId,
    pub attributes: Attributes,
    pub depends_on: BTreeSet<ResourceId>,
}

impl ResourceSpec {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            attributes: Attributes::new(),
            depends_on: BTreeSet::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_optional_attr(self, key: &str, value: Option<impl Into<AttrValue>>) -> Self {
        match value {
            Some(v) => self.with_attr(key, v),
            None => self,
        }
    }

    pub fn depends_on(mut self, id: ResourceId) -> Self {
        self.depends_on.insert(id);
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.id.kind
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attr(key).and_then(AttrValue::as_str)
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        self.attr(key).and_then(AttrValue::as_int)
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attr(key).and_then(AttrValue::as_bool)
    }

    pub fn attr_list(&self, key: &str) -> Option<&[String]> {
        self.attr(key).and_then(AttrValue::as_list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_round_trip_through_display() {
        let id = ResourceId::subnet("10.100.2.0/24");
        assert_eq!(id.to_string(), "subnet/10.100.2.0/24");
        assert_eq!("subnet/10.100.2.0/24".parse::<ResourceId>().unwrap(), id);
        assert!("nope".parse::<ResourceId>().is_err());
        assert!("disk/1".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_resource_id_ordering_follows_kind_precedence() {
        let mut ids = vec![
            ResourceId::vm(101),
            ResourceId::container(200),
            ResourceId::zone("lab"),
            ResourceId::subnet("10.0.0.0/24"),
            ResourceId::vnet("vnet1"),
        ];
        ids.sort();
        let kinds: Vec<_> = ids.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Zone,
                ResourceKind::VNet,
                ResourceKind::Subnet,
                ResourceKind::Container,
                ResourceKind::Vm,
            ]
        );
    }

    #[test]
    fn test_vmid_only_for_guests() {
        assert_eq!(ResourceId::vm(301).vmid(), Some(301));
        assert_eq!(ResourceId::container(200).vmid(), Some(200));
        assert_eq!(ResourceId::zone("200").vmid(), None);
    }

    #[test]
    fn test_attr_value_json_shape() {
        let spec = ResourceSpec::new(ResourceId::vm(301))
            .with_attr(attr::MEMORY, 4096u32)
            .with_attr(attr::NAME, "docker-01")
            .with_attr(attr::TAGS, vec!["docker".to_string()]);
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["id"], "vm/301");
        assert_eq!(json["attributes"]["memory"], 4096);
        assert_eq!(json["attributes"]["tags"][0], "docker");

        let back: ResourceSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
