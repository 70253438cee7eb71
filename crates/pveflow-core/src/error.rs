use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("KDLパースエラー: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO エラー: {path}\n理由: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("無効な設定: {0}")]
    InvalidConfig(String),

    #[error("環境が見つかりません: {name} (利用可能: {available:?})")]
    EnvironmentNotFound {
        name: String,
        available: Vec<String>,
    },

    #[error("設定の検証に失敗しました: {0}")]
    Validation(#[from] ValidationError),
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Configuration errors detected before any hypervisor call is made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid CIDR '{value}' for {owner}")]
    InvalidCidr { owner: String, value: String },

    #[error("invalid IP address '{value}' for {owner}")]
    InvalidAddress { owner: String, value: String },

    #[error("subnet {cidr}: DHCP range requires both start and end")]
    IncompleteDhcpRange { cidr: String },

    #[error("subnet {cidr}: DHCP range start {start} must be before end {end}")]
    DhcpRangeOrder {
        cidr: String,
        start: IpAddr,
        end: IpAddr,
    },

    #[error("subnet {cidr}: address {address} is outside the subnet")]
    AddressOutsideSubnet { cidr: String, address: IpAddr },

    #[error("subnets {first} and {second} overlap")]
    OverlappingSubnets { first: String, second: String },

    #[error("duplicate {kind} '{id}'")]
    Duplicate { kind: String, id: String },

    #[error("{owner} references unknown vnet '{vnet}'")]
    UnknownVNet { owner: String, vnet: String },

    #[error("{owner} depends on unknown resource '{target}'")]
    UnknownDependency { owner: String, target: String },

    #[error("vmid {vmid} of '{owner}' collides with {other}")]
    IdCollision {
        owner: String,
        vmid: u32,
        other: String,
    },

    #[error("{owner}: address {address} collides with {other}")]
    AddressCollision {
        owner: String,
        address: IpAddr,
        other: String,
    },

    #[error("{owner}: {message}")]
    InvalidValue { owner: String, message: String },

    #[error("environment '{0}' declares no vnets")]
    NoVNets(String),
}
