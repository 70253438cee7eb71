//! endpoint / environment ノードのパース

use super::{
    args, first_bool, first_string, first_u32, prop_string, required_string, strings, u32_list,
};
use crate::error::{FlowError, Result};
use crate::model::{
    EndpointConfig, EnvironmentConfig, FleetMemberConfig, ManagementConfig, Profile, SubnetConfig,
    VNetConfig, ZoneConfig,
};
use kdl::KdlNode;

/// endpoint ノードをパース
pub fn parse_endpoint(node: &KdlNode) -> Result<EndpointConfig> {
    let mut endpoint = EndpointConfig {
        url: required_string(node, "endpoint")?,
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "node" => endpoint.node = first_string(child),
                "insecure_tls" | "insecure-tls" => endpoint.insecure_tls = first_bool(child),
                other => tracing::debug!("Unknown endpoint setting: {}", other),
            }
        }
    }

    Ok(endpoint)
}

/// environment ノードをパース
pub fn parse_environment(node: &KdlNode) -> Result<EnvironmentConfig> {
    let name = required_string(node, "environment")?;
    let mut env = EnvironmentConfig {
        name: name.clone(),
        ..Default::default()
    };
    let mut has_management = false;

    let Some(children) = node.children() else {
        return Err(FlowError::InvalidConfig(format!(
            "environment '{}' has no body",
            name
        )));
    };

    for child in children.nodes() {
        match child.name().value() {
            "node" => env.node = required_string(child, "node")?,
            "profile" => {
                env.profile = match required_string(child, "profile")?.as_str() {
                    "lab" => Profile::Lab,
                    "production" | "prod" => Profile::Production,
                    other => {
                        return Err(FlowError::InvalidConfig(format!(
                            "unknown profile '{}' (expected lab or production)",
                            other
                        )));
                    }
                }
            }
            "reserved_ids" | "reserved-ids" => {
                env.reserved_ids = u32_list(child, "reserved-ids")?;
            }
            "zone" => {
                env.network.zone = ZoneConfig {
                    name: required_string(child, "zone")?,
                    zone_type: prop_string(child, "type").unwrap_or_else(|| "simple".to_string()),
                };
            }
            "vnet" => env.network.vnets.push(parse_vnet(child)?),
            "management" => {
                env.management = parse_management(child)?;
                has_management = true;
            }
            "vm" => {
                let (vm_name, vm) = parse_vm(child)?;
                if env.fleet.insert(vm_name.clone(), vm).is_some() {
                    return Err(FlowError::InvalidConfig(format!(
                        "vm '{}' is declared twice in environment '{}'",
                        vm_name, name
                    )));
                }
            }
            other => tracing::debug!("Unknown environment setting: {}", other),
        }
    }

    if env.node.is_empty() {
        return Err(FlowError::InvalidConfig(format!(
            "environment '{}' requires a node",
            name
        )));
    }
    if !has_management {
        return Err(FlowError::InvalidConfig(format!(
            "environment '{}' requires a management block",
            name
        )));
    }

    Ok(env)
}

fn parse_vnet(node: &KdlNode) -> Result<VNetConfig> {
    let mut vnet = VNetConfig {
        name: required_string(node, "vnet")?,
        ..Default::default()
    };
    let mut has_subnet = false;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "alias" => vnet.alias = first_string(child),
                "subnet" => {
                    if has_subnet {
                        return Err(FlowError::InvalidConfig(format!(
                            "vnet '{}' may own only one subnet",
                            vnet.name
                        )));
                    }
                    vnet.subnet = parse_subnet(child)?;
                    has_subnet = true;
                }
                other => tracing::debug!("Unknown vnet setting: {}", other),
            }
        }
    }

    if !has_subnet {
        return Err(FlowError::InvalidConfig(format!(
            "vnet '{}' requires a subnet",
            vnet.name
        )));
    }
    Ok(vnet)
}

fn parse_subnet(node: &KdlNode) -> Result<SubnetConfig> {
    let mut subnet = SubnetConfig {
        cidr: required_string(node, "subnet")?,
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "gateway" => subnet.gateway = first_string(child),
                "dhcp_range" | "dhcp-range" => {
                    // dhcp-range start="10.0.0.100" end="10.0.0.200"
                    subnet.dhcp_start = prop_string(child, "start");
                    subnet.dhcp_end = prop_string(child, "end");
                }
                "snat" => subnet.snat = first_bool(child),
                other => tracing::debug!("Unknown subnet setting: {}", other),
            }
        }
    }

    Ok(subnet)
}

fn parse_management(node: &KdlNode) -> Result<ManagementConfig> {
    let id_value = args(node)
        .next()
        .ok_or_else(|| FlowError::InvalidConfig("management requires an id".to_string()))?;
    let mut management = ManagementConfig {
        id: super::to_u32(id_value, "management id")?,
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "hostname" => management.hostname = required_string(child, "hostname")?,
                "template" => management.template = required_string(child, "template")?,
                "memory" => management.memory_mb = first_u32(child, "memory")?,
                "cores" => management.cores = first_u32(child, "cores")?,
                "storage" => management.storage = required_string(child, "storage")?,
                "disk_size" | "disk-size" => {
                    management.disk_size_gb = first_u32(child, "disk-size")?
                }
                "network" => {
                    management.vnet = prop_string(child, "vnet").unwrap_or_default();
                    management.ip = prop_string(child, "ip").unwrap_or_default();
                }
                "ssh_keys" | "ssh-keys" | "ssh_key" | "ssh-key" => {
                    management.ssh_keys = strings(child)
                }
                "tools" => management.tools = strings(child),
                other => tracing::debug!("Unknown management setting: {}", other),
            }
        }
    }

    Ok(management)
}

/// vm ノードをパース
fn parse_vm(node: &KdlNode) -> Result<(String, FleetMemberConfig)> {
    let name = required_string(node, "vm")?;
    let mut vm = FleetMemberConfig::default();
    let mut has_vmid = false;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "vmid" => {
                    vm.vmid = first_u32(child, "vmid")?;
                    has_vmid = true;
                }
                "template" => vm.template = required_string(child, "template")?,
                "memory" => vm.memory_mb = first_u32(child, "memory")?,
                "cores" => vm.cores = first_u32(child, "cores")?,
                "storage" => vm.storage = required_string(child, "storage")?,
                "disk_size" | "disk-size" => vm.disk_size_gb = first_u32(child, "disk-size")?,
                "disk_type" | "disk-type" => vm.disk_type = required_string(child, "disk-type")?,
                "network" => {
                    vm.vnet = prop_string(child, "vnet").unwrap_or_default();
                    vm.ip = prop_string(child, "ip").unwrap_or_default();
                }
                "tags" => vm.tags = strings(child),
                "depends_on" | "depends-on" => vm.depends_on = strings(child),
                "tools" => vm.tools = strings(child),
                other => tracing::debug!("Unknown vm setting: {}", other),
            }
        }
    }

    // vmidは自動採番しない（テンプレートとの衝突を避けるため）
    if !has_vmid {
        return Err(FlowError::InvalidConfig(format!(
            "vm '{}' requires an explicit vmid",
            name
        )));
    }

    Ok((name, vm))
}
