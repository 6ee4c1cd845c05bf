//! VM definition through the control plane
//!
//! Drives `pvesh` through the states `Defining → Defined → BootDiskAttached
//! → DisksAttached → Configured → Started`. Each step checks the state it
//! starts from, so disks cannot be attached out of order and a VM cannot be
//! started before it is configured.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::DeployError;
use crate::deployment::{ByteSize, DeploymentSpec};
use crate::remote::{DEFAULT_COMMAND_TIMEOUT, RemoteCommand, RemoteCommandResult, RemoteShell};

/// Identifies a VM on a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmHandle {
    pub node: String,
    pub vmid: u32,
}

impl VmHandle {
    pub fn new(node: impl Into<String>, vmid: u32) -> Self {
        Self {
            node: node.into(),
            vmid,
        }
    }

    fn api_path(&self, suffix: &str) -> String {
        format!("/nodes/{}/qemu/{}{}", self.node, self.vmid, suffix)
    }
}

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VM {} on {}", self.vmid, self.node)
    }
}

/// Provisioning progress of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProvisionState {
    Defining,
    Defined,
    BootDiskAttached,
    DisksAttached,
    Configured,
    Started,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisionState::Defining => "defining",
            ProvisionState::Defined => "defined",
            ProvisionState::BootDiskAttached => "boot disk attached",
            ProvisionState::DisksAttached => "disks attached",
            ProvisionState::Configured => "configured",
            ProvisionState::Started => "started",
        };
        f.write_str(name)
    }
}

/// Role of an attached disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskRole {
    /// Primary boot disk holding the cloud image
    Boot,
    /// Read-only cloud-init seed
    Seed,
}

impl DiskRole {
    fn slot(self) -> &'static str {
        match self {
            DiskRole::Boot => "virtio0",
            DiskRole::Seed => "virtio1",
        }
    }

    /// State the VM has to be in before a disk of this role is attached
    fn requires(self) -> ProvisionState {
        match self {
            DiskRole::Boot => ProvisionState::Defined,
            DiskRole::Seed => ProvisionState::BootDiskAttached,
        }
    }
}

/// A VM being provisioned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedVm {
    handle: VmHandle,
    state: ProvisionState,
}

impl ProvisionedVm {
    pub fn handle(&self) -> &VmHandle {
        &self.handle
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    fn expect_state(&self, expected: ProvisionState, action: &str) -> Result<(), DeployError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DeployError::Ordering(format!(
                "cannot {} {}: it is {}, expected {}",
                action, self.handle, self.state, expected
            )))
        }
    }
}

/// VM configuration as returned by the control plane
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub options: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ClusterVm {
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    node: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmStatus {
    status: String,
}

/// Resources of a cluster node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCapacity {
    pub cpus: u32,
    pub memory: ByteSize,
}

#[derive(Debug, Deserialize)]
struct NodeStatus {
    cpuinfo: NodeCpuInfo,
    memory: NodeMemory,
}

#[derive(Debug, Deserialize)]
struct NodeCpuInfo {
    cpus: u32,
}

#[derive(Debug, Deserialize)]
struct NodeMemory {
    total: u64,
}

/// Entry of `pvesh get /cluster/status`
#[derive(Debug, Deserialize)]
struct ClusterMember {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    local: serde_json::Value,
}

impl ClusterMember {
    fn is_local(&self) -> bool {
        match &self.local {
            serde_json::Value::Bool(local) => *local,
            serde_json::Value::Number(n) => n.as_u64() == Some(1),
            _ => false,
        }
    }
}

/// Creates, configures and starts VMs
#[derive(Debug, Clone)]
pub struct VmProvisioner {
    timeout: Duration,
}

impl Default for VmProvisioner {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl VmProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn pvesh<I, S>(&self, args: I) -> RemoteCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RemoteCommand::new("pvesh").args(args).timeout(self.timeout)
    }

    async fn call(
        &self,
        shell: &dyn RemoteShell,
        command: RemoteCommand,
        what: &str,
    ) -> Result<RemoteCommandResult, DeployError> {
        debug!("{}: {}", what, command);
        shell
            .run(&command)
            .await?
            .check(|r| DeployError::Api(format!("{} failed: {}", what, r.reason())))
    }

    /// Next free VM id; does not reserve it
    pub async fn next_vmid(&self, shell: &dyn RemoteShell) -> Result<u32, DeployError> {
        let result = self
            .call(
                shell,
                self.pvesh(["get", "/cluster/nextid", "--output-format", "json"]),
                "querying next VM id",
            )
            .await?;

        let value: serde_json::Value = serde_json::from_str(result.stdout.trim())
            .map_err(|e| DeployError::Api(format!("unexpected next VM id '{}': {}", result.stdout.trim(), e)))?;

        let vmid = match &value {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        };
        vmid.ok_or_else(|| DeployError::Api(format!("unexpected next VM id {}", value)))
    }

    /// CPU and memory of `node`
    pub async fn node_capacity(&self, shell: &dyn RemoteShell, node: &str) -> Result<NodeCapacity, DeployError> {
        let result = self
            .call(
                shell,
                self.pvesh([
                    "get".to_string(),
                    format!("/nodes/{}/status", node),
                    "--output-format".to_string(),
                    "json".to_string(),
                ]),
                &format!("querying node {}", node),
            )
            .await?;

        let status: NodeStatus = serde_json::from_str(result.stdout.trim())
            .map_err(|e| DeployError::Api(format!("unexpected status of node {}: {}", node, e)))?;
        Ok(NodeCapacity {
            cpus: status.cpuinfo.cpus,
            memory: ByteSize::from_bytes(status.memory.total),
        })
    }

    /// Name of the node the shell is connected to
    ///
    /// Taken from the cluster membership; a standalone host that reports no
    /// local member is identified by its short host name.
    pub async fn local_node(&self, shell: &dyn RemoteShell) -> Result<String, DeployError> {
        let result = self
            .call(
                shell,
                self.pvesh(["get", "/cluster/status", "--output-format", "json"]),
                "querying cluster status",
            )
            .await?;

        let stdout = result.stdout.trim();
        let members: Vec<ClusterMember> = if stdout.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(stdout)?
        };
        if let Some(member) = members.iter().find(|m| m.kind == "node" && m.is_local()) {
            return Ok(member.name.clone());
        }

        let result = self
            .call(shell, RemoteCommand::new("hostname").timeout(self.timeout), "querying host name")
            .await?;
        match result.stdout.trim().split('.').next() {
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ => Err(DeployError::Api("cannot determine the connected node".into())),
        }
    }

    /// Fail unless `spec.node` is the connected host and can hold the VM
    ///
    /// Images are staged on the connected host, so they can only reach
    /// storage of that node.
    pub async fn check_node(&self, shell: &dyn RemoteShell, spec: &DeploymentSpec) -> Result<NodeCapacity, DeployError> {
        let capacity = self.node_capacity(shell, &spec.node).await?;

        let local = self.local_node(shell).await?;
        if local != spec.node {
            return Err(DeployError::Config(format!(
                "node '{}' is not the connected host '{}'; connect to {} to deploy there",
                spec.node, local, spec.node
            )));
        }

        if spec.cpu > capacity.cpus {
            return Err(DeployError::Config(format!(
                "cpu of {} exceeds the {} cpus of node {}",
                spec.cpu, capacity.cpus, spec.node
            )));
        }
        if ByteSize::mib(u64::from(spec.memory)) > capacity.memory {
            return Err(DeployError::Config(format!(
                "memory of {} MiB exceeds the {} of node {}",
                spec.memory, capacity.memory, spec.node
            )));
        }

        debug!("Node {} has {} cpus and {} of memory", spec.node, capacity.cpus, capacity.memory);
        Ok(capacity)
    }

    /// Fail when another VM in the cluster already uses `name`
    pub async fn check_name_available(&self, shell: &dyn RemoteShell, name: &str) -> Result<(), DeployError> {
        let result = self
            .call(
                shell,
                self.pvesh(["get", "/cluster/resources", "--type", "vm", "--output-format", "json"]),
                "listing cluster VMs",
            )
            .await?;

        let stdout = result.stdout.trim();
        let vms: Vec<ClusterVm> = if stdout.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(stdout)?
        };

        if let Some(vm) = vms.iter().find(|vm| vm.name.as_deref() == Some(name)) {
            return Err(DeployError::Api(format!(
                "VM name '{}' is already used by VM {} on {}",
                name,
                vm.vmid,
                vm.node.as_deref().unwrap_or("unknown node")
            )));
        }
        Ok(())
    }

    /// Create the VM object with its CPU, memory and placement
    pub async fn define(
        &self,
        shell: &dyn RemoteShell,
        spec: &DeploymentSpec,
        vmid: u32,
    ) -> Result<ProvisionedVm, DeployError> {
        self.check_name_available(shell, &spec.name).await?;

        let mut vm = ProvisionedVm {
            handle: VmHandle::new(&spec.node, vmid),
            state: ProvisionState::Defining,
        };
        info!("Defining {} as '{}'", vm.handle, spec.name);

        self.call(
            shell,
            self.pvesh([
                "create".to_string(),
                format!("/nodes/{}/qemu", spec.node),
                "--vmid".to_string(),
                vmid.to_string(),
                "--name".to_string(),
                spec.name.clone(),
                "--sockets".to_string(),
                "1".to_string(),
                "--cores".to_string(),
                spec.cpu.to_string(),
                "--cpu".to_string(),
                spec.cpu_family.clone(),
                "--memory".to_string(),
                spec.memory.to_string(),
                "--ostype".to_string(),
                "l26".to_string(),
            ]),
            &format!("defining VM '{}'", spec.name),
        )
        .await?;

        vm.state = ProvisionState::Defined;
        Ok(vm)
    }

    /// Attach a volume; the boot disk must come before the seed
    pub async fn attach_disk(
        &self,
        shell: &dyn RemoteShell,
        vm: &mut ProvisionedVm,
        source: &str,
        role: DiskRole,
    ) -> Result<(), DeployError> {
        vm.expect_state(role.requires(), &format!("attach {} disk to", role.slot()))?;

        if !source.contains(':') {
            return Err(DeployError::Api(format!("'{}' is not a storage volume", source)));
        }

        let mut args = vec![
            "set".to_string(),
            vm.handle.api_path("/config"),
            format!("--{}", role.slot()),
        ];
        match role {
            DiskRole::Boot => {
                args.push(source.to_string());
                args.push("--boot".to_string());
                args.push(format!("order={}", role.slot()));
            }
            DiskRole::Seed => args.push(format!("{},ro=1", source)),
        }

        self.call(shell, self.pvesh(args), &format!("attaching {} to {}", source, vm.handle))
            .await?;
        info!("Attached {} as {} of {}", source, role.slot(), vm.handle);

        vm.state = match role {
            DiskRole::Boot => ProvisionState::BootDiskAttached,
            DiskRole::Seed => ProvisionState::DisksAttached,
        };
        Ok(())
    }

    /// Grow the boot disk to `size`
    ///
    /// The control plane refuses to shrink a disk; that refusal is only
    /// logged, since the image already fills the volume.
    pub async fn resize_boot_disk(
        &self,
        shell: &dyn RemoteShell,
        vm: &ProvisionedVm,
        size: ByteSize,
    ) -> Result<(), DeployError> {
        if vm.state < ProvisionState::BootDiskAttached {
            return Err(DeployError::Ordering(format!(
                "cannot resize the boot disk of {}: it is {}",
                vm.handle, vm.state
            )));
        }

        let result = shell
            .run(&self.pvesh([
                "set".to_string(),
                vm.handle.api_path("/resize"),
                "--disk".to_string(),
                DiskRole::Boot.slot().to_string(),
                "--size".to_string(),
                size.to_string(),
            ]))
            .await?;

        if result.success() {
            debug!("Resized boot disk of {} to {}", vm.handle, size);
        } else if result.stderr.contains("disk size") {
            warn!("Boot disk of {} not resized: {}", vm.handle, result.reason());
        } else {
            return Err(DeployError::Api(format!(
                "resizing boot disk of {} failed: {}",
                vm.handle,
                result.reason()
            )));
        }
        Ok(())
    }

    /// Serial console and network interface
    pub async fn configure(
        &self,
        shell: &dyn RemoteShell,
        vm: &mut ProvisionedVm,
        spec: &DeploymentSpec,
    ) -> Result<(), DeployError> {
        vm.expect_state(ProvisionState::DisksAttached, "configure")?;

        let network = &spec.cloud_init.network;
        let mut net0 = format!("virtio,bridge={}", network.bridge);
        if let Some(tag) = network.vlan_id {
            net0.push_str(&format!(",tag={}", tag));
        }

        let mut args = vec![
            "set".to_string(),
            vm.handle.api_path("/config"),
            "--serial0".to_string(),
            "socket".to_string(),
        ];
        if spec.serial_console {
            args.push("--vga".to_string());
            args.push("serial0".to_string());
        }
        args.push("--net0".to_string());
        args.push(net0);

        self.call(shell, self.pvesh(args), &format!("configuring {}", vm.handle))
            .await?;
        info!("Configured serial console and network of {}", vm.handle);

        vm.state = ProvisionState::Configured;
        Ok(())
    }

    /// Power on a configured VM
    pub async fn start(&self, shell: &dyn RemoteShell, vm: &mut ProvisionedVm) -> Result<(), DeployError> {
        vm.expect_state(ProvisionState::Configured, "start")?;

        self.call(
            shell,
            self.pvesh(["create".to_string(), vm.handle.api_path("/status/start")]),
            &format!("starting {}", vm.handle),
        )
        .await?;
        info!("Started {}", vm.handle);

        vm.state = ProvisionState::Started;
        Ok(())
    }

    /// Current configuration, or `None` when the VM does not exist
    pub async fn inspect(&self, shell: &dyn RemoteShell, handle: &VmHandle) -> Result<Option<VmConfig>, DeployError> {
        let result = shell
            .run(&self.pvesh([
                "get".to_string(),
                handle.api_path("/config"),
                "--output-format".to_string(),
                "json".to_string(),
            ]))
            .await?;

        if !result.success() {
            if result.stderr.contains("does not exist") {
                return Ok(None);
            }
            return Err(DeployError::Api(format!("inspecting {} failed: {}", handle, result.reason())));
        }

        let stdout = result.stdout.trim();
        if stdout.is_empty() {
            return Ok(Some(VmConfig::default()));
        }
        Ok(Some(serde_json::from_str(stdout)?))
    }

    /// Fail unless the VM exists under `name`
    pub async fn confirm(&self, shell: &dyn RemoteShell, vm: &ProvisionedVm, name: &str) -> Result<VmConfig, DeployError> {
        match self.inspect(shell, &vm.handle).await? {
            Some(config) if config.name.as_deref() == Some(name) => {
                debug!("{} is defined as '{}'", vm.handle, name);
                Ok(config)
            }
            Some(config) => Err(DeployError::Api(format!(
                "{} is named '{}', expected '{}'",
                vm.handle,
                config.name.as_deref().unwrap_or_default(),
                name
            ))),
            None => Err(DeployError::Api(format!("{} does not exist after being {}", vm.handle, vm.state))),
        }
    }

    /// Destroy a VM created by this deployment, together with its disks
    ///
    /// Returns `false` when there was nothing to destroy. A VM whose name is
    /// not `name` is left alone.
    pub async fn destroy(&self, shell: &dyn RemoteShell, handle: &VmHandle, name: &str) -> Result<bool, DeployError> {
        let Some(config) = self.inspect(shell, handle).await? else {
            debug!("{} does not exist, nothing to destroy", handle);
            return Ok(false);
        };

        if config.name.as_deref() != Some(name) {
            return Err(DeployError::Cleanup(format!(
                "{} is named '{}', not '{}'; left untouched",
                handle,
                config.name.as_deref().unwrap_or_default(),
                name
            )));
        }

        let status = shell
            .run(&self.pvesh([
                "get".to_string(),
                handle.api_path("/status/current"),
                "--output-format".to_string(),
                "json".to_string(),
            ]))
            .await?;
        let running = status.success()
            && serde_json::from_str::<VmStatus>(status.stdout.trim())
                .map(|s| s.status == "running")
                .unwrap_or(false);

        if running {
            info!("Stopping {}", handle);
            shell
                .run(&self.pvesh(["create".to_string(), handle.api_path("/status/stop")]))
                .await?
                .check(|r| DeployError::Cleanup(format!("stopping {} failed: {}", handle, r.reason())))?;
        }

        shell
            .run(&self.pvesh([
                "delete".to_string(),
                handle.api_path(""),
                "--purge".to_string(),
                "1".to_string(),
                "--destroy-unreferenced-disks".to_string(),
                "1".to_string(),
            ]))
            .await?
            .check(|r| DeployError::Cleanup(format!("destroying {} failed: {}", handle, r.reason())))?;

        info!("Destroyed {}", handle);
        Ok(true)
    }
}
