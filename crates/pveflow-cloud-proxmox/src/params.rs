//! Proxmox property-string helpers
//!
//! Guest configuration packs several settings into comma separated
//! `key=value` strings (`net0`, `ipconfig0`, disks). These helpers build the
//! strings sent on create/update and parse them back when reading a guest.

use serde_json::Value;
use std::collections::BTreeMap;

/// Marker line written into guest descriptions
const DESCRIPTION_MARKER: &str = "pveflow";

/// Disk buses checked, in order, when looking for a VM's boot disk
const DISK_BUSES: &[&str] = &["scsi", "virtio", "sata", "ide"];

/// A parsed property string such as `virtio=AA:BB,bridge=vnet1,firewall=1`
///
/// A leading item without `=` (a disk volume, a bare NIC model) is kept as
/// `head`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyString {
    pub head: Option<String>,
    pub props: BTreeMap<String, String>,
}

impl PropertyString {
    pub fn parse(value: &str) -> Self {
        let mut parsed = Self::default();
        for (i, item) in value.split(',').map(str::trim).enumerate() {
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((key, val)) => {
                    parsed.props.insert(key.to_string(), val.to_string());
                }
                None if i == 0 => parsed.head = Some(item.to_string()),
                None => {
                    parsed.props.insert(item.to_string(), String::new());
                }
            }
        }
        parsed
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }
}

/// `net0` for a container
pub fn lxc_net0(vnet: &str, ip: &str, gateway: Option<&str>) -> String {
    let mut value = format!("name=eth0,bridge={},ip={}", vnet, ip);
    if let Some(gw) = gateway {
        value.push_str(",gw=");
        value.push_str(gw);
    }
    value
}

/// `net0` for a VM
pub fn qemu_net0(vnet: &str) -> String {
    format!("virtio,bridge={}", vnet)
}

/// Cloud-init `ipconfig0`
pub fn ipconfig0(ip: &str, gateway: Option<&str>) -> String {
    match gateway {
        Some(gw) => format!("ip={},gw={}", ip, gw),
        None => format!("ip={}", ip),
    }
}

/// Container `rootfs` for create; the size is in GiB
pub fn lxc_rootfs(storage: &str, size_gb: i64) -> String {
    format!("{}:{}", storage, size_gb)
}

/// Parse a Proxmox size (`512M`, `32G`, `1T`) into whole GiB
pub fn parse_size_gb(value: &str) -> Option<i64> {
    let value = value.trim();
    let (number, unit) = match value.char_indices().last()? {
        (i, c) if c.is_ascii_alphabetic() => (&value[..i], c.to_ascii_uppercase()),
        _ => (value, 'B'),
    };
    let number: f64 = number.parse().ok()?;
    let gb = match unit {
        'K' => number / (1024.0 * 1024.0),
        'M' => number / 1024.0,
        'G' => number,
        'T' => number * 1024.0,
        'B' => number / (1024.0 * 1024.0 * 1024.0),
        _ => return None,
    };
    Some(gb.round() as i64)
}

/// Storage id of a volume (`local-lvm:vm-301-disk-0` -> `local-lvm`)
pub fn volume_storage(volume: &str) -> Option<&str> {
    volume.split_once(':').map(|(storage, _)| storage)
}

/// Proxmox tag list (`a;b`)
pub fn format_tags(tags: &[String]) -> String {
    tags.join(";")
}

pub fn parse_tags(value: &str) -> Vec<String> {
    let mut tags: Vec<String> = value
        .split([';', ',', ' '])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    tags.sort();
    tags
}

/// Guest description carrying the template name, which Proxmox does not keep
pub fn describe(template: &str) -> String {
    format!("{} template={}", DESCRIPTION_MARKER, template)
}

/// Template name recorded by [`describe`]
pub fn template_from_description(description: &str) -> Option<String> {
    description.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(DESCRIPTION_MARKER)?;
        rest.split_whitespace()
            .find_map(|item| item.strip_prefix("template="))
            .map(str::to_string)
    })
}

/// Address without its prefix length
pub fn strip_prefix(ip: &str) -> &str {
    ip.split('/').next().unwrap_or(ip)
}

/// The boot disk of a VM config: `(bus, value)`
pub fn find_disk<'a>(config: &'a serde_json::Map<String, Value>) -> Option<(&'static str, &'a str)> {
    DISK_BUSES.iter().find_map(|bus| {
        config
            .get(&format!("{}0", bus))
            .and_then(Value::as_str)
            .map(|value| (*bus, value))
    })
}

/// Integer config value, which Proxmox reports either as a number or a string
pub fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}
