//! Shared fixtures for unit tests

use pveflow_core::{
    DesiredStateModel, EnvironmentConfig, FleetMemberConfig, ManagementConfig, NetworkConfig,
    Profile, SubnetConfig, VNetConfig, ZoneConfig,
};
use std::collections::BTreeMap;

/// zone labzone, two vnets, management container 200, VMs 301 and 302
pub fn sample_config() -> EnvironmentConfig {
    let mut fleet = BTreeMap::new();
    for (name, vmid, ip, tag) in [
        ("docker-01", 301, "10.100.2.21/24", "docker"),
        ("db-01", 302, "10.100.2.22/24", "database"),
    ] {
        fleet.insert(
            name.to_string(),
            FleetMemberConfig {
                vmid,
                template: "ubuntu-2404-cloudinit".to_string(),
                vnet: "vnetapps".to_string(),
                ip: ip.to_string(),
                tags: vec![tag.to_string()],
                tools: vec!["docker".to_string()],
                ..Default::default()
            },
        );
    }

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
            hostname: "mgmt-a".to_string(),
            template: "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst".to_string(),
            vnet: "vnetmgmt".to_string(),
            ip: "10.100.1.10/24".to_string(),
            ssh_keys: vec!["ssh-ed25519 AAAAC3Nza test@pveflow".to_string()],
            tools: vec!["ansible".to_string()],
            ..Default::default()
        },
        fleet,
    }
}

pub fn sample_model() -> DesiredStateModel {
    DesiredStateModel::load(&sample_config()).expect("sample config is valid")
}
