//! 検証済みSDNトポロジー

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTopology {
    pub zone: Zone,
    /// vnet名 → VNet
    pub vnets: BTreeMap<String, VNet>,
}

impl NetworkTopology {
    pub fn vnet(&self, name: &str) -> Option<&VNet> {
        self.vnets.get(name)
    }

    pub fn subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.vnets.values().map(|v| &v.subnet)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub zone_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VNet {
    pub name: String,
    pub zone: String,
    pub alias: Option<String>,
    pub subnet: Subnet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub cidr: IpNet,
    pub gateway: IpAddr,
    pub dhcp: Option<DhcpRange>,
    pub snat: bool,
}

impl Subnet {
    /// Key used for the subnet's resource id
    pub fn key(&self) -> String {
        self.cidr.to_string()
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.cidr.contains(addr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl DhcpRange {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        *addr >= self.start && *addr <= self.end
    }
}

/// First usable host address of a network, used as the default gateway.
pub fn first_host(net: &IpNet) -> Option<IpAddr> {
    net.hosts().next()
}
