//! LXC containers and QEMU virtual machines
//!
//! Guests are located through `/cluster/resources`, so a vmid is found on
//! whichever node currently hosts it. New guests are placed on the
//! configured node.

use crate::api::{ApiClient, Params, upid};
use crate::params::{self, PropertyString, as_int};
use pveflow_cloud::{
    ClientError, ClientResult, Completion, ObservedState, PollPolicy, ResourceStatus, TaskHandle,
    TaskOperation,
};
use pveflow_core::{AttrValue, Attributes, ResourceId, ResourceKind, ResourceSpec, attr};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Guest type as named by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    Qemu,
    Lxc,
}

impl GuestType {
    fn of(kind: ResourceKind) -> Option<Self> {
        match kind {
            ResourceKind::Container => Some(GuestType::Lxc),
            ResourceKind::Vm => Some(GuestType::Qemu),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            GuestType::Qemu => "qemu",
            GuestType::Lxc => "lxc",
        }
    }
}

/// One guest row of `/cluster/resources?type=vm`
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterGuest {
    #[serde(rename = "type")]
    pub guest_type: GuestType,
    pub vmid: u32,
    pub node: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub template: Option<Value>,
}

impl ClusterGuest {
    fn is_template(&self) -> bool {
        self.template.as_ref().and_then(as_int).unwrap_or(0) != 0
    }

    fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Guest-side operations of the Proxmox client
pub struct Guests<'a> {
    pub api: &'a ApiClient,
    pub poll: &'a PollPolicy,
}

fn vmid_of(id: &ResourceId) -> ClientResult<u32> {
    id.vmid()
        .ok_or_else(|| ClientError::Rejected(format!("{} has no numeric vmid", id)))
}

fn guest_type_of(id: &ResourceId) -> ClientResult<GuestType> {
    GuestType::of(id.kind).ok_or_else(|| ClientError::Rejected(format!("{} is not a guest", id)))
}

fn required<'s>(spec: &'s ResourceSpec, key: &str) -> ClientResult<&'s str> {
    spec.attr_str(key)
        .ok_or_else(|| ClientError::Rejected(format!("{} has no {}", spec.id, key)))
}

fn required_int(spec: &ResourceSpec, key: &str) -> ClientResult<i64> {
    spec.attr_int(key)
        .ok_or_else(|| ClientError::Rejected(format!("{} has no {}", spec.id, key)))
}

fn attr_str<'a>(attributes: &'a Attributes, key: &str) -> Option<&'a str> {
    attributes.get(key).and_then(AttrValue::as_str)
}

fn attr_int(attributes: &Attributes, key: &str) -> Option<i64> {
    attributes.get(key).and_then(AttrValue::as_int)
}

fn task_or_done(data: &Value, operation: TaskOperation) -> Completion {
    match upid(data) {
        Some(id) => Completion::Task(TaskHandle::new(id, operation)),
        None => Completion::Done,
    }
}

impl<'a> Guests<'a> {
    pub fn new(api: &'a ApiClient, poll: &'a PollPolicy) -> Self {
        Self { api, poll }
    }

    pub async fn cluster_guests(&self) -> ClientResult<Vec<ClusterGuest>> {
        let data = self
            .api
            .get_query(&["cluster", "resources"], &[("type", "vm")])
            .await?;
        if data.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(data)
            .map_err(|e| ClientError::Rejected(format!("unexpected cluster resources: {}", e)))
    }

    async fn locate(&self, vmid: u32) -> ClientResult<Option<ClusterGuest>> {
        Ok(self
            .cluster_guests()
            .await?
            .into_iter()
            .find(|g| g.vmid == vmid))
    }

    /// The guest behind `id`; a vmid held by the other guest type is not ours
    async fn find(&self, id: &ResourceId) -> ClientResult<ClusterGuest> {
        let vmid = vmid_of(id)?;
        let wanted = guest_type_of(id)?;
        match self.locate(vmid).await? {
            Some(guest) if guest.guest_type == wanted => Ok(guest),
            Some(guest) => {
                debug!(vmid, found = guest.guest_type.as_str(), "vmid held by another guest type");
                Err(ClientError::NotFound(id.to_string()))
            }
            None => Err(ClientError::NotFound(id.to_string())),
        }
    }

    async fn config(&self, guest: &ClusterGuest) -> ClientResult<Map<String, Value>> {
        let vmid = guest.vmid.to_string();
        let data = self
            .api
            .get(&["nodes", &guest.node, guest.guest_type.as_str(), &vmid, "config"])
            .await?;
        match data {
            Value::Object(map) => Ok(map),
            other => Err(ClientError::Rejected(format!(
                "unexpected config for {}: {}",
                vmid, other
            ))),
        }
    }

    pub async fn read(&self, id: &ResourceId) -> ClientResult<ObservedState> {
        let guest = self.find(id).await?;
        let config = self.config(&guest).await?;
        Ok(observe(id, &guest, &config))
    }

    pub async fn create(&self, spec: &ResourceSpec) -> ClientResult<Completion> {
        let vmid = vmid_of(&spec.id)?;
        if let Some(existing) = self.locate(vmid).await? {
            if self.is_partial_clone(spec, &existing).await? {
                info!(vmid, "Resuming partially created VM");
                return self.finish_vm(spec, &existing).await;
            }
            return Err(ClientError::Conflict(format!(
                "vmid {} is already used by {} on {}",
                vmid,
                existing.guest_type.as_str(),
                existing.node
            )));
        }
        match spec.kind() {
            ResourceKind::Container => self.create_container(spec, vmid).await,
            ResourceKind::Vm => self.create_vm(spec, vmid).await,
            _ => Err(ClientError::Rejected(format!("{} is not a guest", spec.id))),
        }
    }

    /// A VM left behind by an interrupted create of the same spec.
    ///
    /// The clone carries the template marker from the start, so a guest
    /// with a matching marker is ours to finish rather than a collision.
    async fn is_partial_clone(
        &self,
        spec: &ResourceSpec,
        existing: &ClusterGuest,
    ) -> ClientResult<bool> {
        if spec.kind() != ResourceKind::Vm
            || existing.guest_type != GuestType::Qemu
            || existing.is_template()
        {
            return Ok(false);
        }
        let config = self.config(existing).await?;
        let marker = config
            .get("description")
            .and_then(Value::as_str)
            .and_then(params::template_from_description);
        if marker.is_none() || marker.as_deref() != spec.attr_str(attr::TEMPLATE) {
            return Ok(false);
        }
        if let Some(lock) = config.get("lock").and_then(Value::as_str) {
            return Err(ClientError::Transient(format!(
                "vm {} is locked ({})",
                existing.vmid, lock
            )));
        }
        Ok(true)
    }

    async fn create_container(&self, spec: &ResourceSpec, vmid: u32) -> ClientResult<Completion> {
        let storage = required(spec, attr::STORAGE)?;
        let template = required(spec, attr::TEMPLATE)?;
        let mut params: Params = vec![
            ("vmid", vmid.to_string()),
            ("hostname", required(spec, attr::HOSTNAME)?.to_string()),
            ("ostemplate", template.to_string()),
            ("memory", required_int(spec, attr::MEMORY)?.to_string()),
            ("cores", required_int(spec, attr::CORES)?.to_string()),
            (
                "rootfs",
                params::lxc_rootfs(storage, required_int(spec, attr::DISK_SIZE)?),
            ),
            (
                "net0",
                params::lxc_net0(
                    required(spec, attr::VNET)?,
                    required(spec, attr::IP)?,
                    spec.attr_str(attr::GATEWAY),
                ),
            ),
            ("unprivileged", "1".to_string()),
            ("start", "1".to_string()),
            ("description", params::describe(template)),
        ];
        if let Some(keys) = spec.attr_list(attr::SSH_KEYS).filter(|k| !k.is_empty()) {
            params.push(("ssh-public-keys", keys.join("\n")));
        }

        let node = self.api.node().to_string();
        let data = self.api.post(&["nodes", &node, "lxc"], &params).await?;
        info!(vmid, %node, "Container creation started");
        Ok(task_or_done(&data, TaskOperation::Create))
    }

    /// Resolve a template by name, or by vmid when the name is numeric
    async fn resolve_template(&self, template: &str) -> ClientResult<ClusterGuest> {
        let guests = self.cluster_guests().await?;
        let by_id: Option<u32> = template.parse().ok();
        guests
            .into_iter()
            .filter(|g| g.guest_type == GuestType::Qemu && g.is_template())
            .find(|g| Some(g.vmid) == by_id || g.name.as_deref() == Some(template))
            .ok_or_else(|| ClientError::Rejected(format!("template '{}' not found", template)))
    }

    async fn create_vm(&self, spec: &ResourceSpec, vmid: u32) -> ClientResult<Completion> {
        let template_name = required(spec, attr::TEMPLATE)?;
        let template = self.resolve_template(template_name).await?;
        let node = self.api.node().to_string();

        let clone: Params = vec![
            ("newid", vmid.to_string()),
            ("name", required(spec, attr::NAME)?.to_string()),
            ("full", "1".to_string()),
            ("storage", required(spec, attr::STORAGE)?.to_string()),
            ("target", node.clone()),
            ("description", params::describe(template_name)),
        ];
        let template_id = template.vmid.to_string();
        let data = self
            .api
            .post(
                &["nodes", &template.node, "qemu", &template_id, "clone"],
                &clone,
            )
            .await?;
        info!(vmid, template = template_name, "Cloning VM");
        if let Some(task) = upid(&data) {
            self.api
                .wait_task(&task, TaskOperation::Create, self.poll)
                .await?;
        }

        let guest = ClusterGuest {
            guest_type: GuestType::Qemu,
            vmid,
            node,
            status: "stopped".to_string(),
            name: None,
            template: None,
        };
        self.finish_vm(spec, &guest).await
    }

    /// Configure, resize and start a cloned VM; each step tolerates a rerun
    async fn finish_vm(&self, spec: &ResourceSpec, guest: &ClusterGuest) -> ClientResult<Completion> {
        let template_name = required(spec, attr::TEMPLATE)?;
        let vmid = guest.vmid.to_string();

        let mut config = vm_config_params(&spec.attributes);
        config.push(("description", params::describe(template_name)));
        self.api
            .put(&["nodes", &guest.node, "qemu", &vmid, "config"], &config)
            .await?;

        self.grow_disk(guest, &spec.attributes).await?;

        if guest.is_running() {
            return Ok(Completion::Done);
        }
        let data = self
            .api
            .post(
                &["nodes", &guest.node, "qemu", &vmid, "status", "start"],
                &Params::new(),
            )
            .await?;
        Ok(task_or_done(&data, TaskOperation::Start))
    }

    /// Resize the guest's disk up to the desired size; shrinking is refused
    async fn grow_disk(&self, guest: &ClusterGuest, attributes: &Attributes) -> ClientResult<()> {
        let Some(desired) = attr_int(attributes, attr::DISK_SIZE) else {
            return Ok(());
        };
        let config = self.config(guest).await?;
        let disk = match guest.guest_type {
            GuestType::Lxc => config
                .get("rootfs")
                .and_then(Value::as_str)
                .map(|value| ("rootfs".to_string(), value.to_string())),
            GuestType::Qemu => params::find_disk(&config)
                .map(|(bus, value)| (format!("{}0", bus), value.to_string())),
        };
        let Some((disk, value)) = disk else {
            return Err(ClientError::Rejected(format!(
                "guest {} has no disk to resize",
                guest.vmid
            )));
        };
        let current = PropertyString::parse(&value)
            .get("size")
            .and_then(params::parse_size_gb)
            .unwrap_or(0);

        if desired == current {
            return Ok(());
        }
        if desired < current {
            return Err(ClientError::Rejected(format!(
                "cannot shrink disk of guest {} from {}G to {}G",
                guest.vmid, current, desired
            )));
        }

        let vmid = guest.vmid.to_string();
        let resize: Params = vec![("disk", disk), ("size", format!("{}G", desired))];
        let data = self
            .api
            .put(
                &["nodes", &guest.node, guest.guest_type.as_str(), &vmid, "resize"],
                &resize,
            )
            .await?;
        if let Some(task) = upid(&data) {
            self.api
                .wait_task(&task, TaskOperation::Update, self.poll)
                .await?;
        }
        debug!(vmid = guest.vmid, size = desired, "Disk resized");
        Ok(())
    }

    pub async fn update(&self, id: &ResourceId, attributes: &Attributes) -> ClientResult<Completion> {
        let guest = self.find(id).await?;
        let vmid = guest.vmid.to_string();

        let params = match guest.guest_type {
            GuestType::Lxc => container_config_params(attributes),
            GuestType::Qemu => vm_config_params(attributes),
        };
        if !params.is_empty() {
            self.api
                .put(
                    &["nodes", &guest.node, guest.guest_type.as_str(), &vmid, "config"],
                    &params,
                )
                .await?;
        }
        self.grow_disk(&guest, attributes).await?;
        Ok(Completion::Done)
    }

    pub async fn delete(&self, id: &ResourceId) -> ClientResult<Completion> {
        let guest = self.find(id).await?;
        let vmid = guest.vmid.to_string();
        let kind = guest.guest_type.as_str();

        if guest.is_running() {
            let data = self
                .api
                .post(&["nodes", &guest.node, kind, &vmid, "status", "stop"], &Params::new())
                .await?;
            if let Some(task) = upid(&data) {
                self.api
                    .wait_task(&task, TaskOperation::Stop, self.poll)
                    .await?;
            }
            info!(vmid = guest.vmid, "Guest stopped");
        }

        let mut query = vec![("purge", "1")];
        if guest.guest_type == GuestType::Qemu {
            query.push(("destroy-unreferenced-disks", "1"));
        }
        let data = self
            .api
            .delete(&["nodes", &guest.node, kind, &vmid], &query)
            .await?;
        Ok(task_or_done(&data, TaskOperation::Delete))
    }
}

/// Mutable container settings
fn container_config_params(attributes: &Attributes) -> Params {
    let mut params = Params::new();
    if let Some(memory) = attr_int(attributes, attr::MEMORY) {
        params.push(("memory", memory.to_string()));
    }
    if let Some(cores) = attr_int(attributes, attr::CORES) {
        params.push(("cores", cores.to_string()));
    }
    if let (Some(vnet), Some(ip)) = (attr_str(attributes, attr::VNET), attr_str(attributes, attr::IP)) {
        params.push((
            "net0",
            params::lxc_net0(vnet, ip, attr_str(attributes, attr::GATEWAY)),
        ));
    }
    params
}

/// Mutable VM settings, also applied right after cloning
fn vm_config_params(attributes: &Attributes) -> Params {
    let mut params = Params::new();
    if let Some(name) = attr_str(attributes, attr::NAME) {
        params.push(("name", name.to_string()));
    }
    if let Some(memory) = attr_int(attributes, attr::MEMORY) {
        params.push(("memory", memory.to_string()));
    }
    if let Some(cores) = attr_int(attributes, attr::CORES) {
        params.push(("cores", cores.to_string()));
    }
    if let Some(vnet) = attr_str(attributes, attr::VNET) {
        params.push(("net0", params::qemu_net0(vnet)));
    }
    if let Some(ip) = attr_str(attributes, attr::IP) {
        params.push((
            "ipconfig0",
            params::ipconfig0(ip, attr_str(attributes, attr::GATEWAY)),
        ));
    }
    if let Some(tags) = attributes.get(attr::TAGS).and_then(AttrValue::as_list) {
        params.push(("tags", params::format_tags(tags)));
    }
    params
}

fn status_of(guest: &ClusterGuest, config: &Map<String, Value>) -> ResourceStatus {
    if config.contains_key("lock") {
        return ResourceStatus::Pending;
    }
    match guest.status.as_str() {
        "running" => ResourceStatus::Running,
        "stopped" => ResourceStatus::Stopped,
        _ => ResourceStatus::Unknown,
    }
}

/// Map a guest config onto the model's attribute keys
fn observe(id: &ResourceId, guest: &ClusterGuest, config: &Map<String, Value>) -> ObservedState {
    let text = |key: &str| config.get(key).and_then(Value::as_str);
    let mut state = ObservedState::new(id.clone()).with_status(status_of(guest, config));

    for key in [attr::MEMORY, attr::CORES] {
        if let Some(value) = config.get(key).and_then(as_int) {
            state = state.with_attribute(key, value);
        }
    }
    if let Some(template) = text("description").and_then(params::template_from_description) {
        state = state.with_attribute(attr::TEMPLATE, template);
    }

    let net0 = text("net0").map(PropertyString::parse).unwrap_or_default();
    if let Some(bridge) = net0.get("bridge") {
        state = state.with_attribute(attr::VNET, bridge);
    }

    let (disk, ip_config) = match guest.guest_type {
        GuestType::Lxc => {
            if let Some(hostname) = text("hostname") {
                state = state.with_attribute(attr::HOSTNAME, hostname);
            }
            (text("rootfs").map(PropertyString::parse), net0.clone())
        }
        GuestType::Qemu => {
            if let Some(name) = text("name") {
                state = state.with_attribute(attr::NAME, name);
            }
            state = state.with_attribute(
                attr::TAGS,
                text("tags").map(params::parse_tags).unwrap_or_default(),
            );
            let disk = params::find_disk(config);
            if let Some((bus, _)) = disk {
                state = state.with_attribute(attr::DISK_TYPE, bus);
            }
            let disk = disk.map(|(_, value)| PropertyString::parse(value));
            let ip_config = text("ipconfig0")
                .map(PropertyString::parse)
                .unwrap_or_default();
            (disk, ip_config)
        }
    };

    if let Some(disk) = disk {
        if let Some(storage) = disk.head.as_deref().and_then(params::volume_storage) {
            state = state.with_attribute(attr::STORAGE, storage);
        }
        if let Some(size) = disk.get("size").and_then(params::parse_size_gb) {
            state = state.with_attribute(attr::DISK_SIZE, size);
        }
    }
    if let Some(ip) = ip_config.get("ip").filter(|ip| ip.contains('/')) {
        state = state
            .with_attribute(attr::IP, ip)
            .with_address(params::strip_prefix(ip));
    }
    if let Some(gateway) = ip_config.get("gw") {
        state = state.with_attribute(attr::GATEWAY, gateway);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guest(guest_type: GuestType, vmid: u32, status: &str) -> ClusterGuest {
        ClusterGuest {
            guest_type,
            vmid,
            node: "pve".to_string(),
            status: status.to_string(),
            name: None,
            template: None,
        }
    }

    #[test]
    fn test_observe_vm() {
        let config = json!({
            "name": "docker-01",
            "memory": "4096",
            "cores": 2,
            "scsi0": "local-lvm:vm-301-disk-0,iothread=1,size=32G",
            "net0": "virtio=BC:24:11:00:00:01,bridge=vnetapps",
            "ipconfig0": "ip=10.100.2.21/24,gw=10.100.2.1",
            "tags": "docker;web",
            "description": "pveflow template=ubuntu-2404-cloudinit",
        });
        let state = observe(
            &ResourceId::vm(301),
            &guest(GuestType::Qemu, 301, "running"),
            config.as_object().unwrap(),
        );

        assert_eq!(state.status, ResourceStatus::Running);
        assert_eq!(state.address.as_deref(), Some("10.100.2.21"));
        let get = |key: &str| state.attributes.get(key).cloned();
        assert_eq!(get(attr::NAME), Some("docker-01".into()));
        assert_eq!(get(attr::MEMORY), Some(AttrValue::Int(4096)));
        assert_eq!(get(attr::CORES), Some(AttrValue::Int(2)));
        assert_eq!(get(attr::STORAGE), Some("local-lvm".into()));
        assert_eq!(get(attr::DISK_SIZE), Some(AttrValue::Int(32)));
        assert_eq!(get(attr::DISK_TYPE), Some("scsi".into()));
        assert_eq!(get(attr::VNET), Some("vnetapps".into()));
        assert_eq!(get(attr::IP), Some("10.100.2.21/24".into()));
        assert_eq!(get(attr::GATEWAY), Some("10.100.2.1".into()));
        assert_eq!(get(attr::TEMPLATE), Some("ubuntu-2404-cloudinit".into()));
        assert_eq!(
            get(attr::TAGS),
            Some(AttrValue::List(vec!["docker".to_string(), "web".to_string()]))
        );
    }

    #[test]
    fn test_observe_container() {
        let config = json!({
            "hostname": "mgmt-a",
            "memory": 2048,
            "cores": 2,
            "rootfs": "local-lvm:vm-200-disk-0,size=8G",
            "net0": "name=eth0,bridge=vnetmgmt,hwaddr=BC:24:11:00:00:02,ip=10.100.1.10/24,gw=10.100.1.1,type=veth",
            "lock": "create",
        });
        let state = observe(
            &ResourceId::container(200),
            &guest(GuestType::Lxc, 200, "stopped"),
            config.as_object().unwrap(),
        );

        assert_eq!(state.status, ResourceStatus::Pending);
        assert_eq!(state.address.as_deref(), Some("10.100.1.10"));
        assert_eq!(
            state.attributes.get(attr::HOSTNAME),
            Some(&AttrValue::from("mgmt-a"))
        );
        assert_eq!(
            state.attributes.get(attr::DISK_SIZE),
            Some(&AttrValue::Int(8))
        );
        assert!(!state.attributes.contains_key(attr::TEMPLATE));
        assert!(!state.attributes.contains_key(attr::TAGS));
    }

    #[test]
    fn test_dhcp_address_is_not_reported() {
        let config = json!({ "net0": "name=eth0,bridge=vnetapps,ip=dhcp" });
        let state = observe(
            &ResourceId::container(201),
            &guest(GuestType::Lxc, 201, "running"),
            config.as_object().unwrap(),
        );
        assert_eq!(state.address, None);
        assert!(!state.attributes.contains_key(attr::IP));
    }

    #[test]
    fn test_vm_config_params() {
        let mut attributes = Attributes::new();
        attributes.insert(attr::MEMORY.to_string(), AttrValue::Int(8192));
        attributes.insert(attr::IP.to_string(), "10.100.2.21/24".into());
        attributes.insert(attr::GATEWAY.to_string(), "10.100.2.1".into());
        attributes.insert(attr::TEMPLATE.to_string(), "ubuntu".into());

        let params = vm_config_params(&attributes);
        assert_eq!(
            params,
            vec![
                ("memory", "8192".to_string()),
                ("ipconfig0", "ip=10.100.2.21/24,gw=10.100.2.1".to_string()),
            ]
        );
    }
}
