//! Libvirt XML: domain/pool/network descriptor generation and parsing of the
//! documents the driver reads back from the hypervisor.

use std::borrow::Cow;

use quick_xml::escape::escape;
use serde::Deserialize;

use crate::config::{DriverConfig, NetworkDefinition};
use crate::error::{DriverError, Result};
use crate::types::{DiskCacheMode, DiskIoMode};

/// MAC address of the single guest NIC.
///
/// Fixed so the DHCP lease of the machine can be found without asking the
/// hypervisor. At most one managed machine per host can use it.
pub const GUEST_MAC_ADDRESS: &str = "52:fd:fc:07:21:82";

/// Host entropy source for the virtio RNG.
const RNG_BACKEND_DEVICE: &str = "/dev/urandom";

/// VNC is only reachable from the host.
const VNC_LISTEN_ADDRESS: &str = "127.0.0.1";

// =============================================================================
// DOMAIN DESCRIPTOR
// =============================================================================

/// Everything that varies between generated domain descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub name: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    /// Guest architecture, the host's
    pub arch: String,
    /// Machine type hint, e.g. `q35`
    pub machine_type: Option<String>,
    pub disk: DiskDevice,
    pub interface: Option<NetworkInterface>,
    pub vsock: bool,
}

/// The boot disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDevice {
    pub path: String,
    pub cache: DiskCacheMode,
    pub io: DiskIoMode,
    pub target_dev: String,
    pub bus: String,
}

/// The network-attached NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub mac: String,
    pub network: String,
    pub model: String,
}

impl DomainDescriptor {
    /// Map a driver configuration onto a descriptor.
    pub fn from_config(config: &DriverConfig, machine_type: Option<&str>) -> Self {
        let interface = (!config.network.is_empty()).then(|| NetworkInterface {
            mac: GUEST_MAC_ADDRESS.to_string(),
            network: config.network.clone(),
            model: "virtio".to_string(),
        });

        Self {
            name: config.machine_name.clone(),
            memory_mb: config.memory_mib,
            vcpus: config.cpus,
            arch: std::env::consts::ARCH.to_string(),
            machine_type: machine_type
                .filter(|m| !m.is_empty())
                .map(str::to_string),
            disk: DiskDevice {
                path: config.disk_image_path().to_string_lossy().into_owned(),
                cache: config.cache_mode,
                io: config.io_mode,
                target_dev: "vda".to_string(),
                bus: "virtio".to_string(),
            },
            interface,
            vsock: config.vsock,
        }
    }
}

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    domain: &'a DomainDescriptor,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(domain: &'a DomainDescriptor) -> Self {
        Self { domain }
    }

    /// Build the domain XML string.
    pub fn build(&self) -> Result<String> {
        let d = self.domain;
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <memory unit='MB'>{}</memory>
  <vcpu placement='static'>{}</vcpu>
"#,
            text(&d.name)?,
            d.memory_mb,
            d.vcpus
        ));

        xml.push_str(&self.build_os_section()?);
        xml.push_str("  <features>\n    <acpi/>\n    <apic/>\n    <pae/>\n  </features>\n");
        xml.push_str(&self.build_cpu_section());
        xml.push_str("  <clock offset='utc'/>\n");

        xml.push_str("  <devices>\n");
        xml.push_str(&self.build_disk()?);
        xml.push_str(&self.build_interface()?);
        xml.push_str("    <console type='pty'/>\n");
        xml.push_str(&self.build_graphics());
        // Ballooning off: the guest must always see its full memory.
        xml.push_str("    <memballoon model='none'/>\n");
        xml.push_str(&self.build_rng());
        xml.push_str(&self.build_vsock());
        xml.push_str("  </devices>\n");

        xml.push_str("</domain>\n");

        Ok(xml)
    }

    fn build_os_section(&self) -> Result<String> {
        let machine = match &self.domain.machine_type {
            Some(m) => format!(" machine='{}'", text(m)?),
            None => String::new(),
        };
        Ok(format!(
            r#"  <os>
    <type arch='{}'{}>hvm</type>
    <boot dev='hd'/>
    <bootmenu enable='no'/>
  </os>
"#,
            text(&self.domain.arch)?,
            machine
        ))
    }

    fn build_cpu_section(&self) -> String {
        // rdrand must stay disabled: passing it through trips a host CPU
        // virtualization bug that hangs guest boot.
        r#"  <cpu mode='host-passthrough'>
    <feature policy='disable' name='rdrand'/>
  </cpu>
"#
        .to_string()
    }

    fn build_disk(&self) -> Result<String> {
        let disk = &self.domain.disk;
        Ok(format!(
            r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='{}' io='{}'/>
      <source file='{}'/>
      <target dev='{}' bus='{}'/>
    </disk>
"#,
            disk.cache.as_str(),
            disk.io.as_str(),
            text(&disk.path)?,
            text(&disk.target_dev)?,
            text(&disk.bus)?
        ))
    }

    fn build_interface(&self) -> Result<String> {
        let Some(nic) = &self.domain.interface else {
            return Ok(String::new());
        };
        Ok(format!(
            r#"    <interface type='network'>
      <mac address='{}'/>
      <source network='{}'/>
      <model type='{}'/>
    </interface>
"#,
            text(&nic.mac)?,
            text(&nic.network)?,
            text(&nic.model)?
        ))
    }

    fn build_graphics(&self) -> String {
        format!(
            "    <graphics type='vnc' autoport='yes' listen='{addr}'>\n      <listen type='address' address='{addr}'/>\n    </graphics>\n",
            addr = VNC_LISTEN_ADDRESS
        )
    }

    fn build_rng(&self) -> String {
        format!(
            "    <rng model='virtio'>\n      <backend model='random'>{}</backend>\n    </rng>\n",
            RNG_BACKEND_DEVICE
        )
    }

    fn build_vsock(&self) -> String {
        if !self.domain.vsock {
            return String::new();
        }
        "    <vsock model='virtio'>\n      <cid auto='yes'/>\n    </vsock>\n".to_string()
    }
}

/// Build the domain XML for a driver configuration.
pub fn domain_xml(config: &DriverConfig, machine_type: Option<&str>) -> Result<String> {
    let descriptor = DomainDescriptor::from_config(config, machine_type);
    DomainXmlBuilder::new(&descriptor).build()
}

// =============================================================================
// POOL AND NETWORK DESCRIPTORS
// =============================================================================

/// Descriptor of a directory-backed storage pool.
pub fn dir_pool_xml(name: &str, target_path: &str) -> Result<String> {
    Ok(format!(
        r#"<pool type='dir'>
  <name>{}</name>
  <target>
    <path>{}</path>
  </target>
</pool>
"#,
        text(name)?,
        text(target_path)?
    ))
}

/// Descriptor of a NAT network with a DHCP range.
pub fn nat_network_xml(name: &str, def: &NetworkDefinition) -> Result<String> {
    Ok(format!(
        r#"<network>
  <name>{}</name>
  <forward mode='nat'/>
  <bridge name='{}' stp='on' delay='0'/>
  <ip address='{}' prefix='{}'>
    <dhcp>
      <range start='{}' end='{}'/>
    </dhcp>
  </ip>
</network>
"#,
        text(name)?,
        text(&def.bridge)?,
        text(&def.address)?,
        def.prefix,
        text(&def.dhcp_start)?,
        text(&def.dhcp_end)?
    ))
}

/// Escape a value for use in element text or a quoted attribute.
///
/// Control characters cannot be represented in XML 1.0 at all.
fn text(value: &str) -> Result<Cow<'_, str>> {
    if let Some(c) = value
        .chars()
        .find(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        return Err(DriverError::Xml(format!(
            "value {:?} contains control character U+{:04X}",
            value, c as u32
        )));
    }
    Ok(escape(value))
}

// =============================================================================
// PARSING
// =============================================================================

/// The parts of a network descriptor the validator checks.
#[derive(Debug, Default, Deserialize)]
pub struct NetworkDoc {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bridge: Option<NetworkBridge>,
    #[serde(rename = "ip", default)]
    pub ips: Vec<NetworkIp>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NetworkBridge {
    #[serde(rename = "@name", default)]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct NetworkIp {
    #[serde(rename = "@address", default)]
    pub address: String,
    #[serde(rename = "@prefix", default)]
    pub prefix: Option<String>,
    #[serde(rename = "@netmask", default)]
    pub netmask: Option<String>,
    #[serde(default)]
    pub dhcp: Option<NetworkDhcp>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NetworkDhcp {
    #[serde(rename = "range", default)]
    pub ranges: Vec<DhcpRange>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DhcpRange {
    #[serde(rename = "@start", default)]
    pub start: String,
    #[serde(rename = "@end", default)]
    pub end: String,
}

impl NetworkDoc {
    pub fn parse(xml: &str) -> Result<Self> {
        Ok(quick_xml::de::from_str(xml)?)
    }
}

#[derive(Debug, Default, Deserialize)]
struct NamedDoc {
    #[serde(default)]
    name: String,
}

/// The `<name>` of a domain, network or pool descriptor.
pub fn descriptor_name(xml: &str) -> Result<String> {
    let doc: NamedDoc = quick_xml::de::from_str(xml)?;
    if doc.name.is_empty() {
        return Err(DriverError::Xml("descriptor has no name".to_string()));
    }
    Ok(doc.name)
}

/// The device section of a live domain descriptor.
#[derive(Debug, Default, Deserialize)]
struct DomainDoc {
    #[serde(default)]
    devices: Option<DomainDevices>,
}

#[derive(Debug, Default, Deserialize)]
struct DomainDevices {
    #[serde(rename = "interface", default)]
    interfaces: Vec<DomainInterfaceDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct DomainInterfaceDoc {
    #[serde(default)]
    mac: Option<MacDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct MacDoc {
    #[serde(rename = "@address", default)]
    address: String,
}

/// MAC address of the first interface of a domain descriptor.
pub fn first_interface_mac(domain_xml: &str) -> Result<Option<String>> {
    let doc: DomainDoc = quick_xml::de::from_str(domain_xml)?;
    Ok(doc
        .devices
        .and_then(|d| d.interfaces.into_iter().next())
        .and_then(|i| i.mac)
        .map(|m| m.address)
        .filter(|a| !a.is_empty()))
}

#[derive(Debug, Default, Deserialize)]
struct CapsDoc {
    #[serde(default)]
    host: CapsHost,
    #[serde(rename = "guest", default)]
    guests: Vec<CapsGuest>,
}

#[derive(Debug, Default, Deserialize)]
struct CapsHost {
    #[serde(default)]
    cpu: CapsHostCpu,
}

#[derive(Debug, Default, Deserialize)]
struct CapsHostCpu {
    #[serde(default)]
    arch: String,
}

#[derive(Debug, Default, Deserialize)]
struct CapsGuest {
    #[serde(default)]
    os_type: String,
    #[serde(default)]
    arch: CapsGuestArch,
}

#[derive(Debug, Default, Deserialize)]
struct CapsGuestArch {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "machine", default)]
    machines: Vec<CapsMachine>,
}

#[derive(Debug, Default, Deserialize)]
struct CapsMachine {
    #[serde(rename = "$text", default)]
    name: String,
    #[serde(rename = "@canonical", default)]
    canonical: Option<String>,
}

/// Look for a q35 machine type for `hvm` guests of the host architecture.
///
/// Returns `Ok(None)` when the hypervisor supports such guests but not q35,
/// and an error when it cannot run `hvm` guests of the host arch at all.
pub fn q35_machine_type(caps_xml: &str) -> Result<Option<String>> {
    let caps: CapsDoc = quick_xml::de::from_str(caps_xml)?;
    let host_arch = caps.host.cpu.arch;

    let arch = caps
        .guests
        .iter()
        .find(|g| g.os_type == "hvm" && g.arch.name == host_arch)
        .map(|g| &g.arch)
        .ok_or_else(|| DriverError::InvalidConfig(format!(
            "Could not find a {} hypervisor with 'hvm' capabilities",
            host_arch
        )))?;

    let has_q35 = arch
        .machines
        .iter()
        .any(|m| m.name == "q35" || m.canonical.as_deref() == Some("q35"));

    Ok(has_q35.then(|| "q35".to_string()))
}
