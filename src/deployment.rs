//! Deployment description
//!
//! A [`DeploymentSpec`] is assembled once (from a deployment file plus
//! command line overrides), validated once, and then handed to the
//! orchestrator, which owns it for the duration of the run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::DeployError;
use crate::seed::SeedFormat;

/// CPU models accepted by the control plane
pub const CPU_FAMILIES: &[&str] = &[
    "486", "athlon", "pentium", "pentium2", "pentium3", "coreduo", "core2duo", "kvm32", "kvm64",
    "qemu32", "qemu64", "phenom", "Conroe", "Penryn", "Nehalem", "Westmere", "SandyBridge",
    "IvyBridge", "Haswell", "Broadwell", "Opteron_G1", "Opteron_G2", "Opteron_G3", "Opteron_G4",
    "Opteron_G5", "host",
];

/// Smallest memory size (MiB) a VM may be given
pub const MIN_MEMORY_MB: u32 = 32;

/// Linux limit on network interface names
const MAX_INTERFACE_NAME: usize = 15;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Everything needed to provision one VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// VM name as registered in the control plane
    pub name: String,
    /// Cluster node the VM is created on
    pub node: String,
    /// Storage pool for both disks
    pub storage: String,
    /// Fixed VM id; the next free id is used when absent
    #[serde(default)]
    pub vmid: Option<u32>,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_cpu_family")]
    pub cpu_family: String,
    /// Memory in MiB
    #[serde(default = "default_memory")]
    pub memory: u32,
    pub disk_size: ByteSize,
    /// Local cloud image, possibly compressed
    pub base_image: PathBuf,
    #[serde(default)]
    pub cloud_init: CloudInitSpec,
    #[serde(default = "default_true")]
    pub serial_console: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub seed_format: SeedFormat,
}

/// Guest configuration rendered into the seed image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudInitSpec {
    pub hostname: Option<String>,
    pub fqdn: Option<String>,
    pub users: Vec<UserSpec>,
    pub network: NetworkSpec,
    pub timezone: Option<String>,
    pub packages: Vec<String>,
    pub package_upgrade: bool,
    /// Configuration-management handoff
    pub puppet: Option<PuppetHandoff>,
}

/// A user created on first boot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSpec {
    pub name: String,
    #[serde(default)]
    pub ssh_authorized_keys: Vec<String>,
    #[serde(default)]
    pub sudo: bool,
    /// Pre-hashed password (crypt format)
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Network interface selection for both the VM NIC and the guest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSpec {
    /// Interface name inside the guest
    pub interface: String,
    /// Host bridge the NIC is plugged into
    pub bridge: String,
    pub vlan_id: Option<u16>,
    pub addressing: Addressing,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            bridge: "vmbr0".to_string(),
            vlan_id: None,
            addressing: Addressing::Dhcp,
        }
    }
}

/// IPv4 addressing of the guest interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Addressing {
    #[default]
    Dhcp,
    Static {
        /// Address in CIDR notation
        address: String,
        gateway: Option<String>,
        #[serde(default)]
        nameservers: Vec<String>,
        #[serde(default)]
        search: Vec<String>,
    },
}

/// Puppet agent bootstrap settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PuppetHandoff {
    pub server: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub certname: Option<String>,
}

fn default_cpu() -> u32 {
    1
}

fn default_cpu_family() -> String {
    "host".to_string()
}

fn default_memory() -> u32 {
    512
}

fn default_true() -> bool {
    true
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

impl DeploymentSpec {
    /// Check every field constraint; called once before any side effect
    pub fn validate(&self) -> Result<(), DeployError> {
        require_name("name", &self.name)?;
        require_name("node", &self.node)?;
        require_name("storage", &self.storage)?;

        if let Some(vmid) = self.vmid {
            if vmid < 100 {
                return Err(DeployError::Config(format!(
                    "vmid must be 100 or greater, got {}",
                    vmid
                )));
            }
        }

        if self.cpu == 0 {
            return Err(DeployError::Config("cpu must be at least 1".into()));
        }

        if !CPU_FAMILIES.contains(&self.cpu_family.as_str()) {
            return Err(DeployError::Config(format!(
                "unknown cpu_family '{}'",
                self.cpu_family
            )));
        }

        if self.memory < MIN_MEMORY_MB {
            return Err(DeployError::Config(format!(
                "memory must be at least {} MiB, got {}",
                MIN_MEMORY_MB, self.memory
            )));
        }

        if self.disk_size.bytes() < GIB {
            return Err(DeployError::Config(format!(
                "disk_size must be at least 1G, got {}",
                self.disk_size
            )));
        }

        if self.base_image.as_os_str().is_empty() {
            return Err(DeployError::Config("base_image is required".into()));
        }

        self.cloud_init.validate()
    }

    /// Hostname used inside the guest, defaulting to the VM name
    pub fn hostname(&self) -> &str {
        self.cloud_init.hostname.as_deref().unwrap_or(&self.name)
    }
}

impl CloudInitSpec {
    fn validate(&self) -> Result<(), DeployError> {
        if let Some(hostname) = &self.hostname {
            require_name("cloud_init.hostname", hostname)?;
        }

        if let Some(fqdn) = &self.fqdn {
            require_domain("cloud_init.fqdn", fqdn)?;
        }

        for user in &self.users {
            require_name("cloud_init.users[].name", &user.name)?;
        }

        if let Some(vlan) = self.network.vlan_id {
            if !(1..=4094).contains(&vlan) {
                return Err(DeployError::Config(format!(
                    "vlan_id must be between 1 and 4094, got {}",
                    vlan
                )));
            }
        }

        require_name("cloud_init.network.interface", &self.network.interface)?;
        if self.network.interface.len() > MAX_INTERFACE_NAME {
            return Err(DeployError::Config(format!(
                "cloud_init.network.interface must be at most {} characters, got '{}'",
                MAX_INTERFACE_NAME, self.network.interface
            )));
        }
        require_name("cloud_init.network.bridge", &self.network.bridge)?;

        if let Addressing::Static {
            address,
            gateway,
            nameservers,
            search,
        } = &self.network.addressing
        {
            parse_cidr(address)?;

            if let Some(gateway) = gateway {
                gateway.parse::<Ipv4Addr>().map_err(|_| {
                    DeployError::Config(format!("invalid gateway address '{}'", gateway))
                })?;
            }
            for server in nameservers {
                server.parse::<IpAddr>().map_err(|_| {
                    DeployError::Config(format!("invalid nameserver address '{}'", server))
                })?;
            }
            for domain in search {
                require_domain("cloud_init.network.addressing.search", domain)?;
            }
        }

        if let Some(puppet) = &self.puppet {
            if puppet.server.trim().is_empty() {
                return Err(DeployError::Config("puppet.server must not be empty".into()));
            }
        }

        Ok(())
    }
}

fn require_name(field: &str, value: &str) -> Result<(), DeployError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(DeployError::Config(format!(
            "{} must be non-empty and contain only letters, digits, '-', '_' or '.', got '{}'",
            field, value
        )))
    }
}

/// DNS name made of dot-separated labels of letters, digits and inner '-'
fn require_domain(field: &str, value: &str) -> Result<(), DeployError> {
    let valid_label = |label: &str| {
        (1..=63).contains(&label.len())
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    };

    let name = value.strip_suffix('.').unwrap_or(value);
    if !name.is_empty() && name.len() <= 253 && name.split('.').all(valid_label) {
        Ok(())
    } else {
        Err(DeployError::Config(format!(
            "{} must be a valid DNS name, got '{}'",
            field,
            value.escape_debug()
        )))
    }
}

/// Split a CIDR address into the address and a dotted netmask
pub fn parse_cidr(cidr: &str) -> Result<(String, String), DeployError> {
    let invalid = || DeployError::Config(format!("invalid CIDR address '{}'", cidr));

    let (ip, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let _: Ipv4Addr = ip.parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }

    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ok((ip.to_string(), Ipv4Addr::from(mask).to_string()))
}

/// A size in bytes, written as `10G`, `512M`, `2048K` or a bare number of GiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "SizeRepr", into = "String")]
pub struct ByteSize(u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeRepr {
    Gib(u64),
    Text(String),
}

impl TryFrom<SizeRepr> for ByteSize {
    type Error = DeployError;

    fn try_from(repr: SizeRepr) -> Result<Self, Self::Error> {
        match repr {
            SizeRepr::Gib(n) => n
                .checked_mul(GIB)
                .map(Self)
                .ok_or_else(|| DeployError::Config(format!("size of {} GiB is too large", n))),
            SizeRepr::Text(s) => s.parse(),
        }
    }
}

impl From<ByteSize> for String {
    fn from(size: ByteSize) -> Self {
        size.to_string()
    }
}

impl ByteSize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn gib(n: u64) -> Self {
        Self(n * GIB)
    }

    pub const fn mib(n: u64) -> Self {
        Self(n * MIB)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }

    /// Size in KiB, rounded up
    pub fn kib(self) -> u64 {
        self.0.div_ceil(KIB)
    }

    /// Round up to a whole number of MiB
    pub fn round_up_mib(self) -> Self {
        Self(self.0.div_ceil(MIB).saturating_mul(MIB))
    }
}

impl FromStr for ByteSize {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || DeployError::Config(format!("invalid size '{}'", s));

        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => s.split_at(idx),
            None => (s, "G"),
        };

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            "T" | "TB" | "TIB" => TIB,
            _ => return Err(invalid()),
        };

        value.checked_mul(multiplier).map(Self).ok_or_else(invalid)
    }
}

/// Largest whole unit that divides the size; anything else is shown in KiB,
/// rounded up, since the control plane takes no byte suffix
impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = [(TIB, "T"), (GIB, "G"), (MIB, "M")];
        for (size, suffix) in units {
            if self.0 >= size && self.0 % size == 0 {
                return write!(f, "{}{}", self.0 / size, suffix);
            }
        }
        write!(f, "{}K", self.kib())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_spec() -> DeploymentSpec {
        DeploymentSpec {
            name: "web01".to_string(),
            node: "pve1".to_string(),
            storage: "local-lvm".to_string(),
            vmid: None,
            cpu: 2,
            cpu_family: "host".to_string(),
            memory: 2048,
            disk_size: ByteSize::gib(10),
            base_image: PathBuf::from("/images/ubuntu-16.04.img"),
            cloud_init: CloudInitSpec::default(),
            serial_console: true,
            auto_start: true,
            seed_format: SeedFormat::Iso9660,
        }
    }

    #[test]
    fn test_parse_sizes() {
        assert_eq!("10G".parse::<ByteSize>().unwrap(), ByteSize::gib(10));
        assert_eq!("512M".parse::<ByteSize>().unwrap(), ByteSize::mib(512));
        assert_eq!("2048K".parse::<ByteSize>().unwrap().bytes(), 2048 * 1024);
        assert_eq!("4".parse::<ByteSize>().unwrap(), ByteSize::gib(4));
        assert_eq!("1T".parse::<ByteSize>().unwrap().bytes(), TIB);
        assert!("ten".parse::<ByteSize>().is_err());
        assert!("10Q".parse::<ByteSize>().is_err());
    }

    #[test]
    fn test_size_display_and_rounding() {
        assert_eq!(ByteSize::gib(10).to_string(), "10G");
        assert_eq!(ByteSize::mib(1536).to_string(), "1536M");
        assert_eq!(ByteSize::from_bytes(1000).to_string(), "1K");
        assert_eq!(ByteSize::from_bytes(3 * KIB).to_string(), "3K");
        assert_eq!(ByteSize::from_bytes(GIB + 1).to_string(), "1048577K");
        assert_eq!(ByteSize::from_bytes(0).to_string(), "0K");
        assert_eq!(ByteSize::from_bytes(1).round_up_mib(), ByteSize::mib(1));
        assert_eq!(ByteSize::from_bytes(1025).kib(), 2);
    }

    #[test]
    fn test_size_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            size: ByteSize,
        }

        let w: Wrapper = serde_yaml::from_str("size: 10G").unwrap();
        assert_eq!(w.size, ByteSize::gib(10));
        let w: Wrapper = serde_yaml::from_str("size: 8").unwrap();
        assert_eq!(w.size, ByteSize::gib(8));
    }

    #[test]
    fn test_huge_integer_size_is_config_error() {
        let yaml = r#"
name: web01
node: pve1
storage: local-lvm
disk_size: 18446744073709551615
base_image: ubuntu-16.04.img
"#;
        let err = serde_yaml::from_str::<DeploymentSpec>(yaml).unwrap_err();
        assert!(err.to_string().contains("too large"), "{}", err);

        let err = "18446744073709551615G".parse::<ByteSize>().unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut spec = sample_spec();
        spec.name = "web 01".to_string();
        assert!(spec.validate().is_err());

        let mut spec = sample_spec();
        spec.memory = 16;
        assert!(spec.validate().is_err());

        let mut spec = sample_spec();
        spec.cpu_family = "z80".to_string();
        assert!(spec.validate().is_err());

        let mut spec = sample_spec();
        spec.disk_size = ByteSize::mib(512);
        assert!(spec.validate().is_err());

        let mut spec = sample_spec();
        spec.cloud_init.network.vlan_id = Some(5000);
        assert!(spec.validate().is_err());

        let mut spec = sample_spec();
        spec.cloud_init.network.addressing = Addressing::Static {
            address: "10.0.0.5".to_string(),
            gateway: None,
            nameservers: vec![],
            search: vec![],
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_injected_fqdn() {
        for fqdn in [
            "web01.example.com\nruncmd: [\"reboot\"]",
            "a: b",
            "web 01.example.com",
            "-web01.example.com",
            "",
        ] {
            let mut spec = sample_spec();
            spec.cloud_init.fqdn = Some(fqdn.to_string());
            let result = spec.validate();
            assert!(
                matches!(result, Err(DeployError::Config(ref m)) if m.contains("fqdn")),
                "{:?} accepted",
                fqdn
            );
        }

        let mut spec = sample_spec();
        spec.cloud_init.fqdn = Some("web01.example.com".to_string());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_network_fields() {
        let mut spec = sample_spec();
        spec.cloud_init.network.interface = "eth0\nauto eth1".to_string();
        assert!(spec.validate().is_err());

        let mut spec = sample_spec();
        spec.cloud_init.network.interface = "averyverylongifname".to_string();
        assert!(spec.validate().is_err());

        let mut spec = sample_spec();
        spec.cloud_init.network.bridge = "vmbr0,tag=5".to_string();
        assert!(spec.validate().is_err());

        let static_net = |gateway: &str, nameserver: &str, search: &str| Addressing::Static {
            address: "10.0.0.5/24".to_string(),
            gateway: Some(gateway.to_string()),
            nameservers: vec![nameserver.to_string()],
            search: vec![search.to_string()],
        };

        let mut spec = sample_spec();
        spec.cloud_init.network.addressing = static_net("10.0.0.1", "10.0.0.2", "example.com");
        assert!(spec.validate().is_ok());

        for addressing in [
            static_net("10.0.0.1\n    up reboot", "10.0.0.2", "example.com"),
            static_net("10.0.0.1", "dns.example.com", "example.com"),
            static_net("10.0.0.1", "10.0.0.2", "example.com corp.example.com"),
        ] {
            let mut spec = sample_spec();
            spec.cloud_init.network.addressing = addressing.clone();
            assert!(spec.validate().is_err(), "{:?} accepted", addressing);
        }
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(
            parse_cidr("192.168.1.10/24").unwrap(),
            ("192.168.1.10".to_string(), "255.255.255.0".to_string())
        );
        assert_eq!(parse_cidr("10.0.0.1/8").unwrap().1, "255.0.0.0");
        assert!(parse_cidr("10.0.0.1/33").is_err());
        assert!(parse_cidr("nonsense/24").is_err());
    }

    #[test]
    fn test_hostname_defaults_to_name() {
        let mut spec = sample_spec();
        assert_eq!(spec.hostname(), "web01");
        spec.cloud_init.hostname = Some("frontend".to_string());
        assert_eq!(spec.hostname(), "frontend");
    }

    #[test]
    fn test_deserialize_minimal_spec() {
        let yaml = r#"
name: db01
node: pve2
storage: local
disk_size: 20G
base_image: debian-12.qcow2
cloud_init:
  users:
    - name: admin
      sudo: true
  network:
    vlan_id: 12
    addressing:
      mode: static
      address: 10.1.2.3/24
      gateway: 10.1.2.1
"#;
        let spec: DeploymentSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.cpu, 1);
        assert_eq!(spec.memory, 512);
        assert!(spec.serial_console);
        assert!(!spec.auto_start);
        assert_eq!(spec.cloud_init.users[0].shell, "/bin/bash");
        assert_eq!(spec.cloud_init.network.interface, "eth0");
        assert!(matches!(spec.cloud_init.network.addressing, Addressing::Static { .. }));
        assert!(spec.validate().is_ok());
    }
}
