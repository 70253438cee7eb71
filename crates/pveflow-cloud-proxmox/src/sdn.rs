//! SDN zones, VNets and subnets
//!
//! SDN edits only touch the pending configuration. Each mutation is
//! followed by a cluster-wide reload, and the reload task is what the
//! engine waits on.

use crate::api::{ApiClient, Params, upid};
use crate::params::{PropertyString, as_int};
use pveflow_cloud::{
    ClientError, ClientResult, Completion, ObservedState, ResourceStatus, TaskHandle,
    TaskOperation,
};
use pveflow_core::{AttrValue, Attributes, ResourceId, ResourceKind, ResourceSpec, attr};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ZoneEntry {
    zone: String,
    #[serde(rename = "type")]
    zone_type: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VNetEntry {
    vnet: String,
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubnetEntry {
    /// Proxmox subnet id, `<zone>-<address>-<prefix>`
    subnet: String,
    #[serde(default)]
    cidr: Option<String>,
    #[serde(default)]
    vnet: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    snat: Option<Value>,
    #[serde(default, rename = "dhcp-range")]
    dhcp_range: Vec<Value>,
    #[serde(default)]
    state: Option<String>,
}

impl SubnetEntry {
    fn cidr(&self) -> Option<String> {
        self.cidr.clone().or_else(|| cidr_from_subnet_id(&self.subnet))
    }

    /// First DHCP range as `(start, end)`
    fn dhcp(&self) -> Option<(String, String)> {
        let range = self.dhcp_range.first()?;
        let (start, end) = match range {
            Value::String(s) => {
                let parsed = PropertyString::parse(s);
                (
                    parsed.get("start-address")?.to_string(),
                    parsed.get("end-address")?.to_string(),
                )
            }
            Value::Object(o) => (
                o.get("start-address")?.as_str()?.to_string(),
                o.get("end-address")?.as_str()?.to_string(),
            ),
            _ => return None,
        };
        Some((start, end))
    }
}

/// `labzone-10.100.2.0-24` -> `10.100.2.0/24`
fn cidr_from_subnet_id(id: &str) -> Option<String> {
    let mut parts = id.rsplitn(3, '-');
    let prefix = parts.next()?;
    let address = parts.next()?;
    parts.next()?;
    Some(format!("{}/{}", address, prefix))
}

fn status_of(state: &Option<String>) -> ResourceStatus {
    match state {
        Some(_) => ResourceStatus::Pending,
        None => ResourceStatus::Active,
    }
}

fn list<T: serde::de::DeserializeOwned>(data: Value) -> ClientResult<Vec<T>> {
    if data.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(data)
        .map_err(|e| ClientError::Rejected(format!("unexpected SDN listing: {}", e)))
}

async fn zones(api: &ApiClient) -> ClientResult<Vec<ZoneEntry>> {
    list(api.get(&["cluster", "sdn", "zones"]).await?)
}

async fn vnets(api: &ApiClient) -> ClientResult<Vec<VNetEntry>> {
    list(api.get(&["cluster", "sdn", "vnets"]).await?)
}

async fn subnets_of(api: &ApiClient, vnet: &str) -> ClientResult<Vec<SubnetEntry>> {
    list(api.get(&["cluster", "sdn", "vnets", vnet, "subnets"]).await?)
}

/// Locate a subnet by CIDR, preferring the VNet it is expected on
async fn find_subnet(
    api: &ApiClient,
    cidr: &str,
    hint: Option<&str>,
) -> ClientResult<Option<(String, SubnetEntry)>> {
    let mut names: Vec<String> = vnets(api).await?.into_iter().map(|v| v.vnet).collect();
    if let Some(hint) = hint {
        names.sort_by_key(|name| name != hint);
    }
    for vnet in names {
        for entry in subnets_of(api, &vnet).await? {
            if entry.cidr().as_deref() == Some(cidr) {
                let vnet = entry.vnet.clone().unwrap_or(vnet);
                return Ok(Some((vnet, entry)));
            }
        }
    }
    Ok(None)
}

pub async fn read(api: &ApiClient, id: &ResourceId) -> ClientResult<ObservedState> {
    let not_found = || ClientError::NotFound(id.to_string());
    match id.kind {
        ResourceKind::Zone => {
            let zone = zones(api)
                .await?
                .into_iter()
                .find(|z| z.zone == id.name)
                .ok_or_else(not_found)?;
            Ok(ObservedState::new(id.clone())
                .with_status(status_of(&zone.state))
                .with_attribute(attr::TYPE, zone.zone_type))
        }
        ResourceKind::VNet => {
            let vnet = vnets(api)
                .await?
                .into_iter()
                .find(|v| v.vnet == id.name)
                .ok_or_else(not_found)?;
            Ok(ObservedState::new(id.clone())
                .with_status(status_of(&vnet.state))
                .with_attribute(attr::ZONE, vnet.zone.unwrap_or_default())
                .with_attribute(attr::ALIAS, vnet.alias.unwrap_or_default()))
        }
        ResourceKind::Subnet => {
            let (vnet, entry) = find_subnet(api, &id.name, None)
                .await?
                .ok_or_else(not_found)?;
            let snat = entry.snat.as_ref().and_then(as_int).unwrap_or(0) != 0;
            let mut state = ObservedState::new(id.clone())
                .with_status(status_of(&entry.state))
                .with_attribute(attr::VNET, vnet)
                .with_attribute(attr::CIDR, id.name.as_str())
                .with_attribute(attr::SNAT, snat);
            if let Some(gateway) = entry.gateway.clone() {
                state = state.with_attribute(attr::GATEWAY, gateway);
            }
            if let Some((start, end)) = entry.dhcp() {
                state = state
                    .with_attribute(attr::DHCP_START, start)
                    .with_attribute(attr::DHCP_END, end);
            }
            Ok(state)
        }
        ResourceKind::Container | ResourceKind::Vm => Err(ClientError::Rejected(format!(
            "{} is not an SDN object",
            id
        ))),
    }
}

fn str_attr<'a>(attributes: &'a Attributes, key: &str) -> Option<&'a str> {
    attributes.get(key).and_then(AttrValue::as_str)
}

fn required<'a>(spec: &'a ResourceSpec, key: &str) -> ClientResult<&'a str> {
    spec.attr_str(key)
        .ok_or_else(|| ClientError::Rejected(format!("{} has no {}", spec.id, key)))
}

fn dhcp_range(attributes: &Attributes) -> Option<String> {
    let start = str_attr(attributes, attr::DHCP_START)?;
    let end = str_attr(attributes, attr::DHCP_END)?;
    Some(format!("start-address={},end-address={}", start, end))
}

fn bool_param(value: bool) -> String {
    let flag = if value { "1" } else { "0" };
    flag.to_string()
}

/// Apply the pending SDN configuration cluster-wide
async fn reload(api: &ApiClient, operation: TaskOperation) -> ClientResult<Completion> {
    let data = api.put(&["cluster", "sdn"], &Params::new()).await?;
    Ok(match upid(&data) {
        Some(id) => {
            debug!(task = %id, "SDN reload started");
            Completion::Task(TaskHandle::new(id, operation))
        }
        None => Completion::Done,
    })
}

/// DHCP on a simple zone needs the dnsmasq plugin enabled on the zone
async fn enable_zone_dhcp(api: &ApiClient, vnet: &str) -> ClientResult<()> {
    let zone = vnets(api)
        .await?
        .into_iter()
        .find(|v| v.vnet == vnet)
        .and_then(|v| v.zone);
    if let Some(zone) = zone {
        let params: Params = vec![("dhcp", "dnsmasq".to_string())];
        api.put(&["cluster", "sdn", "zones", &zone], &params).await?;
    }
    Ok(())
}

pub async fn create(api: &ApiClient, spec: &ResourceSpec) -> ClientResult<Completion> {
    let name = spec.id.name.as_str();
    match spec.kind() {
        ResourceKind::Zone => {
            let params: Params = vec![
                ("zone", name.to_string()),
                ("type", required(spec, attr::TYPE)?.to_string()),
                ("ipam", "pve".to_string()),
            ];
            api.post(&["cluster", "sdn", "zones"], &params).await?;
        }
        ResourceKind::VNet => {
            let mut params: Params = vec![
                ("vnet", name.to_string()),
                ("zone", required(spec, attr::ZONE)?.to_string()),
            ];
            if let Some(alias) = spec.attr_str(attr::ALIAS) {
                params.push(("alias", alias.to_string()));
            }
            api.post(&["cluster", "sdn", "vnets"], &params).await?;
        }
        ResourceKind::Subnet => {
            let vnet = required(spec, attr::VNET)?;
            if find_subnet(api, name, Some(vnet)).await?.is_some() {
                return Err(ClientError::Conflict(format!("subnet {} already exists", name)));
            }
            let mut params: Params = vec![
                ("subnet", name.to_string()),
                ("type", "subnet".to_string()),
            ];
            if let Some(gateway) = spec.attr_str(attr::GATEWAY) {
                params.push(("gateway", gateway.to_string()));
            }
            if spec.attr_bool(attr::SNAT).unwrap_or(false) {
                params.push(("snat", bool_param(true)));
            }
            if let Some(range) = dhcp_range(&spec.attributes) {
                enable_zone_dhcp(api, vnet).await?;
                params.push(("dhcp-range", range));
            }
            api.post(&["cluster", "sdn", "vnets", vnet, "subnets"], &params)
                .await?;
        }
        ResourceKind::Container | ResourceKind::Vm => {
            return Err(ClientError::Rejected(format!(
                "{} is not an SDN object",
                spec.id
            )));
        }
    }
    reload(api, TaskOperation::Create).await
}

pub async fn update(
    api: &ApiClient,
    id: &ResourceId,
    attributes: &Attributes,
) -> ClientResult<Completion> {
    match id.kind {
        ResourceKind::Zone => {
            // only the zone type is stored and it cannot change in place
            read(api, id).await?;
            return Ok(Completion::Done);
        }
        ResourceKind::VNet => {
            read(api, id).await?;
            let params: Params = match str_attr(attributes, attr::ALIAS) {
                Some(alias) => vec![("alias", alias.to_string())],
                None => vec![("delete", "alias".to_string())],
            };
            api.put(&["cluster", "sdn", "vnets", &id.name], &params)
                .await?;
        }
        ResourceKind::Subnet => {
            let (vnet, entry) = find_subnet(api, &id.name, str_attr(attributes, attr::VNET))
                .await?
                .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
            let snat = attributes
                .get(attr::SNAT)
                .and_then(AttrValue::as_bool)
                .unwrap_or(false);
            let mut params: Params = vec![("snat", bool_param(snat))];
            let mut deletes = Vec::new();
            match str_attr(attributes, attr::GATEWAY) {
                Some(gateway) => params.push(("gateway", gateway.to_string())),
                None => deletes.push("gateway"),
            }
            match dhcp_range(attributes) {
                Some(range) => {
                    if entry.dhcp().is_none() {
                        enable_zone_dhcp(api, &vnet).await?;
                    }
                    params.push(("dhcp-range", range));
                }
                None => deletes.push("dhcp-range"),
            }
            if !deletes.is_empty() {
                params.push(("delete", deletes.join(",")));
            }
            api.put(
                &["cluster", "sdn", "vnets", &vnet, "subnets", &entry.subnet],
                &params,
            )
            .await?;
        }
        ResourceKind::Container | ResourceKind::Vm => {
            return Err(ClientError::Rejected(format!("{} is not an SDN object", id)));
        }
    }
    reload(api, TaskOperation::Update).await
}

pub async fn delete(api: &ApiClient, id: &ResourceId) -> ClientResult<Completion> {
    match id.kind {
        ResourceKind::Zone => {
            read(api, id).await?;
            api.delete(&["cluster", "sdn", "zones", &id.name], &[])
                .await?;
        }
        ResourceKind::VNet => {
            read(api, id).await?;
            api.delete(&["cluster", "sdn", "vnets", &id.name], &[])
                .await?;
        }
        ResourceKind::Subnet => {
            let (vnet, entry) = find_subnet(api, &id.name, None)
                .await?
                .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
            api.delete(
                &["cluster", "sdn", "vnets", &vnet, "subnets", &entry.subnet],
                &[],
            )
            .await?;
        }
        ResourceKind::Container | ResourceKind::Vm => {
            return Err(ClientError::Rejected(format!("{} is not an SDN object", id)));
        }
    }
    reload(api, TaskOperation::Delete).await
}
