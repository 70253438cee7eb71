//! 目標状態モデル
//!
//! [`EnvironmentConfig`] を検証して [`DesiredStateModel`] を構築します。
//! 検証は一括で行い、違反があれば部分的なモデルは返さずに失敗します。

use crate::error::ValidationError;
use crate::model::{
    DhcpRange, EnvironmentConfig, FleetMember, ManagementNode, NetworkTopology, NodeNetwork,
    Profile, ResourceId, ResourceSpec, Subnet, VNet, Zone, attr, first_host,
};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use tracing::debug;

/// Proxmoxが受け付ける最小のゲストID
const MIN_VMID: u32 = 100;
const MAX_VMID: u32 = 999_999_999;
/// SDNのゾーン名・VNet名は8文字まで
const MAX_SDN_ID_LEN: usize = 8;

type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// 1環境分の検証済み目標トポロジー
///
/// 実行対象のすべての [`ResourceSpec`] を保持する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredStateModel {
    environment: String,
    node: String,
    profile: Profile,
    topology: NetworkTopology,
    management: ManagementNode,
    fleet: BTreeMap<String, FleetMember>,
    resources: BTreeMap<ResourceId, ResourceSpec>,
}

impl DesiredStateModel {
    /// `config` を検証してモデルを構築する
    pub fn load(config: &EnvironmentConfig) -> ValidationResult<Self> {
        let topology = build_topology(config)?;
        let management = build_management(config, &topology)?;
        let fleet = build_fleet(config, &topology, &management)?;
        check_addresses(&topology, &management, &fleet)?;

        let resources = build_resources(&topology, &management, &fleet);
        debug!(
            environment = %config.name,
            resources = resources.len(),
            "Desired state model loaded"
        );

        Ok(Self {
            environment: config.name.clone(),
            node: config.node.clone(),
            profile: config.profile,
            topology,
            management,
            fleet,
            resources,
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn topology(&self) -> &NetworkTopology {
        &self.topology
    }

    pub fn management(&self) -> &ManagementNode {
        &self.management
    }

    pub fn fleet(&self) -> &BTreeMap<String, FleetMember> {
        &self.fleet
    }

    /// `(kind, id)` 順の全リソース
    pub fn resources(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.resources.values()
    }

    pub fn resource(&self, id: &ResourceId) -> Option<&ResourceSpec> {
        self.resources.get(id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// `id` のノード（コンテナまたはVM）に期待するツール
    pub fn tools_for(&self, id: &ResourceId) -> &[String] {
        if *id == ResourceId::container(self.management.id) {
            return &self.management.tools;
        }
        id.vmid()
            .and_then(|vmid| self.fleet.values().find(|m| m.vmid == vmid))
            .map(|m| m.tools.as_slice())
            .unwrap_or(&[])
    }
}

fn check_sdn_id(kind: &str, id: &str) -> ValidationResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SDN_ID_LEN
        && id.starts_with(|c: char| c.is_ascii_alphabetic())
        && id.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidValue {
            owner: format!("{} '{}'", kind, id),
            message: format!(
                "id must be 1-{} alphanumeric characters starting with a letter",
                MAX_SDN_ID_LEN
            ),
        })
    }
}

fn check_vmid(owner: &str, vmid: u32) -> ValidationResult<()> {
    if (MIN_VMID..=MAX_VMID).contains(&vmid) {
        Ok(())
    } else {
        Err(ValidationError::InvalidValue {
            owner: owner.to_string(),
            message: format!("vmid {} must be between {} and {}", vmid, MIN_VMID, MAX_VMID),
        })
    }
}

fn check_sizing(owner: &str, memory_mb: u32, cores: u32, disk_size_gb: u32) -> ValidationResult<()> {
    let invalid = |message: &str| ValidationError::InvalidValue {
        owner: owner.to_string(),
        message: message.to_string(),
    };
    if memory_mb == 0 {
        return Err(invalid("memory must be greater than 0"));
    }
    if cores == 0 {
        return Err(invalid("cores must be greater than 0"));
    }
    if disk_size_gb == 0 {
        return Err(invalid("disk size must be greater than 0"));
    }
    Ok(())
}

fn parse_address(owner: &str, value: &str) -> ValidationResult<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidAddress {
            owner: owner.to_string(),
            value: value.to_string(),
        })
}

fn parse_network(owner: &str, value: &str) -> ValidationResult<IpNet> {
    let net: IpNet = value.trim().parse().map_err(|_| ValidationError::InvalidCidr {
        owner: owner.to_string(),
        value: value.to_string(),
    })?;
    // ホスト部は0であること
    if net.trunc() != net {
        return Err(ValidationError::InvalidCidr {
            owner: owner.to_string(),
            value: value.to_string(),
        });
    }
    Ok(net)
}

fn build_subnet(vnet: &str, config: &crate::model::SubnetConfig) -> ValidationResult<Subnet> {
    let owner = format!("vnet '{}'", vnet);
    let cidr = parse_network(&owner, &config.cidr)?;
    let cidr_key = cidr.to_string();

    let gateway = match &config.gateway {
        Some(gw) => parse_address(&owner, gw)?,
        None => first_host(&cidr).ok_or_else(|| ValidationError::InvalidCidr {
            owner: owner.clone(),
            value: config.cidr.clone(),
        })?,
    };
    if !cidr.contains(&gateway) {
        return Err(ValidationError::AddressOutsideSubnet {
            cidr: cidr_key,
            address: gateway,
        });
    }

    let dhcp = match (&config.dhcp_start, &config.dhcp_end) {
        (None, None) => None,
        (Some(start), Some(end)) => {
            let start = parse_address(&owner, start)?;
            let end = parse_address(&owner, end)?;
            for address in [start, end] {
                if !cidr.contains(&address) {
                    return Err(ValidationError::AddressOutsideSubnet {
                        cidr: cidr_key,
                        address,
                    });
                }
            }
            if start >= end {
                return Err(ValidationError::DhcpRangeOrder {
                    cidr: cidr_key,
                    start,
                    end,
                });
            }
            let range = DhcpRange { start, end };
            if range.contains(&gateway) {
                return Err(ValidationError::AddressCollision {
                    owner: format!("subnet {}", cidr_key),
                    address: gateway,
                    other: "the DHCP range".to_string(),
                });
            }
            Some(range)
        }
        _ => return Err(ValidationError::IncompleteDhcpRange { cidr: cidr_key }),
    };

    Ok(Subnet {
        cidr,
        gateway,
        dhcp,
        snat: config.snat,
    })
}

fn build_topology(config: &EnvironmentConfig) -> ValidationResult<NetworkTopology> {
    let zone_config = &config.network.zone;
    check_sdn_id("zone", &zone_config.name)?;
    let zone = Zone {
        name: zone_config.name.clone(),
        zone_type: zone_config.zone_type.clone(),
    };

    if config.network.vnets.is_empty() {
        return Err(ValidationError::NoVNets(config.name.clone()));
    }

    let mut vnets = BTreeMap::new();
    for vnet_config in &config.network.vnets {
        check_sdn_id("vnet", &vnet_config.name)?;
        if vnet_config.name == zone.name {
            return Err(ValidationError::Duplicate {
                kind: "sdn id".to_string(),
                id: vnet_config.name.clone(),
            });
        }
        let subnet = build_subnet(&vnet_config.name, &vnet_config.subnet)?;
        let vnet = VNet {
            name: vnet_config.name.clone(),
            zone: zone.name.clone(),
            alias: vnet_config.alias.clone(),
            subnet,
        };
        if vnets.insert(vnet.name.clone(), vnet).is_some() {
            return Err(ValidationError::Duplicate {
                kind: "vnet".to_string(),
                id: vnet_config.name.clone(),
            });
        }
    }

    let subnets: Vec<&Subnet> = vnets.values().map(|v| &v.subnet).collect();
    for (i, a) in subnets.iter().enumerate() {
        for b in subnets.iter().skip(i + 1) {
            if a.cidr.contains(&b.cidr.network()) || b.cidr.contains(&a.cidr.network()) {
                return Err(ValidationError::OverlappingSubnets {
                    first: a.key(),
                    second: b.key(),
                });
            }
        }
    }

    Ok(NetworkTopology { zone, vnets })
}

/// ノードのVNetを解決し、アドレスがサブネット内か確認する
fn build_node_network(
    owner: &str,
    vnet_name: &str,
    ip: &str,
    topology: &NetworkTopology,
) -> ValidationResult<NodeNetwork> {
    let vnet = topology
        .vnet(vnet_name)
        .ok_or_else(|| ValidationError::UnknownVNet {
            owner: owner.to_string(),
            vnet: vnet_name.to_string(),
        })?;
    let subnet = &vnet.subnet;

    let ip: IpNet = ip.trim().parse().map_err(|_| ValidationError::InvalidCidr {
        owner: owner.to_string(),
        value: ip.to_string(),
    })?;
    let address = ip.addr();

    if !subnet.contains(&address) || ip.prefix_len() != subnet.cidr.prefix_len() {
        return Err(ValidationError::AddressOutsideSubnet {
            cidr: subnet.key(),
            address,
        });
    }
    if address == subnet.cidr.network() || address == subnet.cidr.broadcast() {
        return Err(ValidationError::InvalidValue {
            owner: owner.to_string(),
            message: format!("{} is not a usable host address", address),
        });
    }
    if address == subnet.gateway {
        return Err(ValidationError::AddressCollision {
            owner: owner.to_string(),
            address,
            other: format!("the gateway of {}", subnet.key()),
        });
    }
    if subnet.dhcp.is_some_and(|range| range.contains(&address)) {
        return Err(ValidationError::AddressCollision {
            owner: owner.to_string(),
            address,
            other: format!("the DHCP range of {}", subnet.key()),
        });
    }

    Ok(NodeNetwork {
        vnet: vnet_name.to_string(),
        ip,
    })
}

fn build_management(
    config: &EnvironmentConfig,
    topology: &NetworkTopology,
) -> ValidationResult<ManagementNode> {
    let m = &config.management;
    let owner = format!("management node {}", m.id);

    check_vmid(&owner, m.id)?;
    if config.reserved_ids.contains(&m.id) {
        return Err(ValidationError::IdCollision {
            owner,
            vmid: m.id,
            other: "a reserved template id".to_string(),
        });
    }
    if m.hostname.is_empty()
        || !m
            .hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(ValidationError::InvalidValue {
            owner,
            message: format!("invalid hostname '{}'", m.hostname),
        });
    }
    if m.template.is_empty() {
        return Err(ValidationError::InvalidValue {
            owner,
            message: "template is required".to_string(),
        });
    }
    check_sizing(&owner, m.memory_mb, m.cores, m.disk_size_gb)?;
    let network = build_node_network(&owner, &m.vnet, &m.ip, topology)?;

    Ok(ManagementNode {
        id: m.id,
        hostname: m.hostname.clone(),
        template: m.template.clone(),
        memory_mb: m.memory_mb,
        cores: m.cores,
        storage: m.storage.clone(),
        disk_size_gb: m.disk_size_gb,
        network,
        ssh_keys: m.ssh_keys.clone(),
        tools: m.tools.clone(),
    })
}

fn build_fleet(
    config: &EnvironmentConfig,
    topology: &NetworkTopology,
    management: &ManagementNode,
) -> ValidationResult<BTreeMap<String, FleetMember>> {
    let mut fleet = BTreeMap::new();
    let mut vmids: HashMap<u32, &str> = HashMap::new();

    for (name, member) in &config.fleet {
        let owner = format!("vm '{}'", name);

        check_vmid(&owner, member.vmid)?;
        if member.vmid == management.id {
            return Err(ValidationError::IdCollision {
                owner,
                vmid: member.vmid,
                other: "the management container".to_string(),
            });
        }
        if config.reserved_ids.contains(&member.vmid) {
            return Err(ValidationError::IdCollision {
                owner,
                vmid: member.vmid,
                other: "a reserved template id".to_string(),
            });
        }
        if let Some(existing) = vmids.insert(member.vmid, name) {
            return Err(ValidationError::IdCollision {
                owner,
                vmid: member.vmid,
                other: format!("vm '{}'", existing),
            });
        }
        if member.template.is_empty() {
            return Err(ValidationError::InvalidValue {
                owner,
                message: "template is required".to_string(),
            });
        }
        check_sizing(&owner, member.memory_mb, member.cores, member.disk_size_gb)?;
        let network = build_node_network(&owner, &member.vnet, &member.ip, topology)?;

        for dep in &member.depends_on {
            if !config.fleet.contains_key(dep) {
                return Err(ValidationError::UnknownDependency {
                    owner,
                    target: dep.clone(),
                });
            }
        }

        fleet.insert(
            name.clone(),
            FleetMember {
                name: name.clone(),
                vmid: member.vmid,
                template: member.template.clone(),
                memory_mb: member.memory_mb,
                cores: member.cores,
                storage: member.storage.clone(),
                disk_size_gb: member.disk_size_gb,
                disk_type: member.disk_type.clone(),
                network,
                tags: member.tags.iter().cloned().collect(),
                depends_on: member.depends_on.iter().cloned().collect(),
                tools: member.tools.clone(),
            },
        );
    }

    Ok(fleet)
}

fn check_addresses(
    topology: &NetworkTopology,
    management: &ManagementNode,
    fleet: &BTreeMap<String, FleetMember>,
) -> ValidationResult<()> {
    let mut seen: HashMap<IpAddr, String> = HashMap::new();
    seen.insert(
        management.network.ip.addr(),
        format!("management node {}", management.id),
    );
    for member in fleet.values() {
        let owner = format!("vm '{}'", member.name);
        let address = member.network.ip.addr();
        if let Some(other) = seen.get(&address) {
            return Err(ValidationError::AddressCollision {
                owner,
                address,
                other: other.clone(),
            });
        }
        seen.insert(address, owner);
    }
    debug!(
        vnets = topology.vnets.len(),
        addresses = seen.len(),
        "Address plan validated"
    );
    Ok(())
}

fn subnet_id_for(topology: &NetworkTopology, vnet: &str) -> Option<ResourceId> {
    topology
        .vnet(vnet)
        .map(|v| ResourceId::subnet(v.subnet.key()))
}

fn build_resources(
    topology: &NetworkTopology,
    management: &ManagementNode,
    fleet: &BTreeMap<String, FleetMember>,
) -> BTreeMap<ResourceId, ResourceSpec> {
    let mut resources = BTreeMap::new();
    let zone_id = ResourceId::zone(&topology.zone.name);

    resources.insert(
        zone_id.clone(),
        ResourceSpec::new(zone_id.clone()).with_attr(attr::TYPE, topology.zone.zone_type.as_str()),
    );

    for vnet in topology.vnets.values() {
        let vnet_id = ResourceId::vnet(&vnet.name);
        resources.insert(
            vnet_id.clone(),
            ResourceSpec::new(vnet_id.clone())
                .with_attr(attr::ZONE, vnet.zone.as_str())
                .with_optional_attr(attr::ALIAS, vnet.alias.clone())
                .depends_on(zone_id.clone()),
        );

        let subnet = &vnet.subnet;
        let subnet_id = ResourceId::subnet(subnet.key());
        resources.insert(
            subnet_id.clone(),
            ResourceSpec::new(subnet_id)
                .with_attr(attr::VNET, vnet.name.as_str())
                .with_attr(attr::CIDR, subnet.key())
                .with_attr(attr::GATEWAY, subnet.gateway.to_string())
                .with_optional_attr(attr::DHCP_START, subnet.dhcp.map(|r| r.start.to_string()))
                .with_optional_attr(attr::DHCP_END, subnet.dhcp.map(|r| r.end.to_string()))
                .with_attr(attr::SNAT, subnet.snat)
                .depends_on(vnet_id),
        );
    }

    let container_id = ResourceId::container(management.id);
    let mut container = ResourceSpec::new(container_id.clone())
        .with_attr(attr::HOSTNAME, management.hostname.as_str())
        .with_attr(attr::TEMPLATE, management.template.as_str())
        .with_attr(attr::MEMORY, management.memory_mb)
        .with_attr(attr::CORES, management.cores)
        .with_attr(attr::STORAGE, management.storage.as_str())
        .with_attr(attr::DISK_SIZE, management.disk_size_gb)
        .with_attr(attr::VNET, management.network.vnet.as_str())
        .with_attr(attr::IP, management.network.ip.to_string())
        .with_attr(attr::SSH_KEYS, management.ssh_keys.clone());
    if let Some(vnet) = topology.vnet(&management.network.vnet) {
        container = container.with_attr(attr::GATEWAY, vnet.subnet.gateway.to_string());
    }
    if let Some(subnet_id) = subnet_id_for(topology, &management.network.vnet) {
        container = container.depends_on(subnet_id);
    }
    resources.insert(container_id.clone(), container);

    let vmids: HashMap<&str, u32> = fleet.values().map(|m| (m.name.as_str(), m.vmid)).collect();
    for member in fleet.values() {
        let vm_id = ResourceId::vm(member.vmid);
        let mut vm = ResourceSpec::new(vm_id.clone())
            .with_attr(attr::NAME, member.name.as_str())
            .with_attr(attr::TEMPLATE, member.template.as_str())
            .with_attr(attr::MEMORY, member.memory_mb)
            .with_attr(attr::CORES, member.cores)
            .with_attr(attr::STORAGE, member.storage.as_str())
            .with_attr(attr::DISK_SIZE, member.disk_size_gb)
            .with_attr(attr::DISK_TYPE, member.disk_type.as_str())
            .with_attr(attr::VNET, member.network.vnet.as_str())
            .with_attr(attr::IP, member.network.ip.to_string())
            .with_attr(
                attr::TAGS,
                member.tags.iter().cloned().collect::<Vec<String>>(),
            )
            .depends_on(container_id.clone());
        if let Some(vnet) = topology.vnet(&member.network.vnet) {
            vm = vm.with_attr(attr::GATEWAY, vnet.subnet.gateway.to_string());
        }
        if let Some(subnet_id) = subnet_id_for(topology, &member.network.vnet) {
            vm = vm.depends_on(subnet_id);
        }
        let deps: BTreeSet<ResourceId> = member
            .depends_on
            .iter()
            .filter_map(|name| vmids.get(name.as_str()))
            .map(|vmid| ResourceId::vm(*vmid))
            .collect();
        vm.depends_on.extend(deps);
        resources.insert(vm_id, vm);
    }

    resources
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{
        FleetMemberConfig, ManagementConfig, NetworkConfig, SubnetConfig, VNetConfig, ZoneConfig,
    };

    pub(crate) fn sample_config() -> EnvironmentConfig {
        let mut fleet = BTreeMap::new();
        fleet.insert(
            "docker-01".to_string(),
            FleetMemberConfig {
                vmid: 301,
                template: "ubuntu-2404-cloudinit".to_string(),
                vnet: "vnetapps".to_string(),
                ip: "10.100.2.21/24".to_string(),
                tags: vec!["docker".to_string()],
                ..Default::default()
            },
        );
        fleet.insert(
            "db-01".to_string(),
            FleetMemberConfig {
                vmid: 302,
                template: "ubuntu-2404-cloudinit".to_string(),
                vnet: "vnetapps".to_string(),
                ip: "10.100.2.22/24".to_string(),
                tags: vec!["database".to_string()],
                ..Default::default()
            },
        );

        EnvironmentConfig {
            name: "dev".to_string(),
            node: "pve".to_string(),
            profile: Profile::Lab,
            reserved_ids: vec![9000],
            network: NetworkConfig {
                zone: ZoneConfig {
                    name: "labzone".to_string(),
                    zone_type: "simple".to_string(),
                },
                vnets: vec![
                    VNetConfig {
                        name: "vnetmgmt".to_string(),
                        alias: Some("management".to_string()),
                        subnet: SubnetConfig {
                            cidr: "10.100.1.0/24".to_string(),
                            ..Default::default()
                        },
                    },
                    VNetConfig {
                        name: "vnetapps".to_string(),
                        alias: None,
                        subnet: SubnetConfig {
                            cidr: "10.100.2.0/24".to_string(),
                            dhcp_start: Some("10.100.2.100".to_string()),
                            dhcp_end: Some("10.100.2.200".to_string()),
                            snat: true,
                            ..Default::default()
                        },
                    },
                ],
            },
            management: ManagementConfig {
                id: 200,
                hostname: "mgmt".to_string(),
                template: "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst".to_string(),
                vnet: "vnetmgmt".to_string(),
                ip: "10.100.1.10/24".to_string(),
                ..Default::default()
            },
            fleet,
        }
    }

    #[test]
    fn test_load_sample() {
        let model = DesiredStateModel::load(&sample_config()).unwrap();
        assert_eq!(model.environment(), "dev");
        // ゾーン1 + VNet2 + サブネット2 + コンテナ1 + VM2
        assert_eq!(model.len(), 8);

        let subnet = model
            .resource(&ResourceId::subnet("10.100.2.0/24"))
            .unwrap();
        assert_eq!(subnet.attr_str(attr::GATEWAY), Some("10.100.2.1"));
        assert_eq!(subnet.attr_str(attr::DHCP_START), Some("10.100.2.100"));
        assert!(subnet.depends_on.contains(&ResourceId::vnet("vnetapps")));

        let vm = model.resource(&ResourceId::vm(301)).unwrap();
        assert!(vm.depends_on.contains(&ResourceId::container(200)));
        assert!(vm.depends_on.contains(&ResourceId::subnet("10.100.2.0/24")));
        assert_eq!(vm.attr_str(attr::NAME), Some("docker-01"));
    }

    #[test]
    fn test_dhcp_range_end_before_start() {
        let mut config = sample_config();
        config.network.vnets[1].subnet.dhcp_start = Some("10.100.2.100".to_string());
        config.network.vnets[1].subnet.dhcp_end = Some("10.100.2.50".to_string());

        let err = DesiredStateModel::load(&config).unwrap_err();
        assert!(matches!(err, ValidationError::DhcpRangeOrder { .. }));
    }

    #[test]
    fn test_dhcp_range_requires_both_ends() {
        let mut config = sample_config();
        config.network.vnets[1].subnet.dhcp_end = None;

        let err = DesiredStateModel::load(&config).unwrap_err();
        assert!(matches!(err, ValidationError::IncompleteDhcpRange { .. }));
    }

    #[test]
    fn test_invalid_cidr() {
        let mut config = sample_config();
        config.network.vnets[0].subnet.cidr = "10.100.1.0/33".to_string();
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::InvalidCidr { .. }
        ));

        config.network.vnets[0].subnet.cidr = "10.100.1.5/24".to_string();
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::InvalidCidr { .. }
        ));
    }

    #[test]
    fn test_overlapping_subnets() {
        let mut config = sample_config();
        config.network.vnets[1].subnet = SubnetConfig {
            cidr: "10.100.0.0/16".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::OverlappingSubnets { .. }
        ));
    }

    #[test]
    fn test_duplicate_vnet() {
        let mut config = sample_config();
        let mut dup = config.network.vnets[0].clone();
        dup.subnet.cidr = "10.100.9.0/24".to_string();
        config.network.vnets.push(dup);
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::Duplicate { .. }
        ));
    }

    #[test]
    fn test_vmid_collisions() {
        let mut config = sample_config();
        config.fleet.get_mut("db-01").unwrap().vmid = 200;
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::IdCollision { vmid: 200, .. }
        ));

        let mut config = sample_config();
        config.fleet.get_mut("db-01").unwrap().vmid = 9000;
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::IdCollision { vmid: 9000, .. }
        ));

        let mut config = sample_config();
        config.fleet.get_mut("db-01").unwrap().vmid = 301;
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::IdCollision { vmid: 301, .. }
        ));
    }

    #[test]
    fn test_unknown_vnet() {
        let mut config = sample_config();
        config.fleet.get_mut("db-01").unwrap().vnet = "missing".to_string();
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::UnknownVNet { .. }
        ));
    }

    #[test]
    fn test_address_rules() {
        let mut config = sample_config();
        config.fleet.get_mut("db-01").unwrap().ip = "10.100.1.22/24".to_string();
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::AddressOutsideSubnet { .. }
        ));

        let mut config = sample_config();
        config.fleet.get_mut("db-01").unwrap().ip = "10.100.2.150/24".to_string();
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::AddressCollision { .. }
        ));

        let mut config = sample_config();
        config.fleet.get_mut("db-01").unwrap().ip = "10.100.2.21/24".to_string();
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::AddressCollision { .. }
        ));
    }

    #[test]
    fn test_user_dependencies() {
        let mut config = sample_config();
        config.fleet.get_mut("docker-01").unwrap().depends_on = vec!["db-01".to_string()];
        let model = DesiredStateModel::load(&config).unwrap();
        let vm = model.resource(&ResourceId::vm(301)).unwrap();
        assert!(vm.depends_on.contains(&ResourceId::vm(302)));

        config.fleet.get_mut("docker-01").unwrap().depends_on = vec!["nope".to_string()];
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::UnknownDependency { .. }
        ));
    }

    #[test]
    fn test_invalid_sdn_ids() {
        let mut config = sample_config();
        config.network.zone.name = "lab-zone-too-long".to_string();
        assert!(matches!(
            DesiredStateModel::load(&config).unwrap_err(),
            ValidationError::InvalidValue { .. }
        ));
    }
}
