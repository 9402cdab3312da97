//! Guest IP address resolution.
//!
//! The guest's address is found by its MAC, either in the interface list the
//! hypervisor reports or in the dnsmasq lease file of the network bridge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{DriverError, Result};
use crate::traits::Hypervisor;
use crate::types::{DomainHandle, GuestInterface, IpFamily};
use crate::xml::{first_interface_mac, GUEST_MAC_ADDRESS};

/// One record of a dnsmasq `<bridge>.status` file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Lease {
    #[serde(rename = "ip-address", default)]
    pub ip_address: String,
    /// Missing on client-id only records
    #[serde(rename = "mac-address", default)]
    pub mac_address: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(rename = "client-id", default)]
    pub client_id: Option<String>,
    /// Unix time the lease expires
    #[serde(rename = "expiry-time", default)]
    pub expiry_time: Option<i64>,
}

impl Lease {
    /// Expiry as a timestamp, when dnsmasq recorded one.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiry_time.and_then(|t| DateTime::from_timestamp(t, 0))
    }
}

/// Parse a lease file. An empty file holds no leases.
pub fn parse_leases(content: &str) -> Result<Vec<Lease>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(content)
        .map_err(|e| DriverError::backend("parse leases", e))
}

/// Most recent lease for `mac`.
///
/// dnsmasq appends renewed leases, so the last matching entry wins.
pub fn lease_for_mac<'a>(leases: &'a [Lease], mac: &str) -> Option<&'a Lease> {
    leases
        .iter()
        .filter(|l| l.mac_address.eq_ignore_ascii_case(mac))
        .last()
        .filter(|l| !l.ip_address.is_empty())
}

/// Address of the most recent lease for `mac`.
pub fn ip_for_mac<'a>(leases: &'a [Lease], mac: &str) -> Option<&'a str> {
    lease_for_mac(leases, mac).map(|l| l.ip_address.as_str())
}

/// First IPv4 address of the interface with hardware address `mac`.
pub fn ipv4_for_mac(interfaces: &[GuestInterface], mac: &str) -> Option<String> {
    interfaces
        .iter()
        .filter(|i| i.hwaddr.eq_ignore_ascii_case(mac))
        .flat_map(|i| i.addresses.iter())
        .find(|a| a.family == IpFamily::V4 && !a.address.is_empty())
        .map(|a| a.address.clone())
}

/// Path of the lease file dnsmasq keeps for a bridge.
pub fn lease_file_path(leases_dir: &Path, bridge: &str) -> PathBuf {
    leases_dir.join(format!("{}.status", bridge))
}

/// Look `mac` up in a bridge's lease file. A missing file means no leases yet.
pub async fn lease_file_ip(leases_dir: &Path, bridge: &str, mac: &str) -> Result<Option<String>> {
    let path = lease_file_path(leases_dir, bridge);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No lease file yet");
            return Ok(None);
        }
        Err(e) => {
            return Err(DriverError::io(format!("failed to read {}", path.display()), e));
        }
    };

    let leases = parse_leases(&content)?;
    debug!(count = leases.len(), path = %path.display(), "Read leases");

    let lease = lease_for_mac(&leases, mac);
    if let Some(lease) = lease {
        debug!(
            ip = %lease.ip_address,
            expires = ?lease.expires_at().map(|t| t.to_rfc3339()),
            "Found lease"
        );
    }
    Ok(lease.map(|l| l.ip_address.clone()))
}

/// Single-shot address lookup for a running domain.
pub struct AddressResolver {
    backend: Arc<dyn Hypervisor>,
    leases_dir: PathBuf,
}

impl AddressResolver {
    pub fn new(backend: Arc<dyn Hypervisor>, leases_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            leases_dir: leases_dir.into(),
        }
    }

    /// MAC of the domain's first interface, read back from its live
    /// descriptor. Falls back to the fixed guest MAC.
    pub async fn guest_mac(&self, domain: &DomainHandle) -> String {
        let xml = match self.backend.domain_xml(domain).await {
            Ok(xml) => xml,
            Err(e) => {
                debug!(error = %e, "Failed to read domain XML, using the default MAC");
                return GUEST_MAC_ADDRESS.to_string();
            }
        };

        match first_interface_mac(&xml) {
            Ok(Some(mac)) => mac,
            Ok(None) => GUEST_MAC_ADDRESS.to_string(),
            Err(e) => {
                warn!(error = %e, "Failed to parse domain XML, using the default MAC");
                GUEST_MAC_ADDRESS.to_string()
            }
        }
    }

    /// Try once to find the IPv4 address of `domain` on `network`.
    ///
    /// `Ok(None)` means no address is known yet.
    pub async fn resolve(&self, domain: &DomainHandle, network: &str) -> Result<Option<String>> {
        if network.is_empty() {
            return Ok(None);
        }

        let mac = self.guest_mac(domain).await;

        if self.backend.features().interface_addresses {
            let interfaces = self.backend.domain_interface_addresses(domain).await?;
            return Ok(ipv4_for_mac(&interfaces, &mac));
        }

        let net = self
            .backend
            .lookup_network(network)
            .await?
            .ok_or_else(|| DriverError::PrerequisiteMissing(format!(
                "Use 'crc setup' to define the network, network '{}' not found",
                network
            )))?;
        let bridge = self.backend.network_bridge_name(&net).await?;

        lease_file_ip(&self.leases_dir, &bridge, &mac).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InterfaceAddress;

    const LEASES: &str = r#"[
        {
            "ip-address": "192.168.130.11",
            "mac-address": "52:fd:fc:07:21:82",
            "hostname": "crc",
            "expiry-time": 1700000000
        },
        {
            "ip-address": "192.168.130.50",
            "mac-address": "52:54:00:aa:bb:cc",
            "expiry-time": 1700009999
        },
        {
            "ip-address": "192.168.130.12",
            "mac-address": "52:FD:FC:07:21:82",
            "hostname": "crc",
            "expiry-time": 1700003600
        }
    ]"#;

    #[test]
    fn test_most_recent_lease_wins() {
        let leases = parse_leases(LEASES).unwrap();
        assert_eq!(leases.len(), 3);
        assert_eq!(ip_for_mac(&leases, GUEST_MAC_ADDRESS), Some("192.168.130.12"));
    }

    #[test]
    fn test_later_entry_wins() {
        let leases = parse_leases(
            r#"[
                {"ip-address": "10.0.0.2", "mac-address": "52:fd:fc:07:21:82"},
                {"ip-address": "10.0.0.3", "mac-address": "52:fd:fc:07:21:82"}
            ]"#,
        )
        .unwrap();
        assert_eq!(ip_for_mac(&leases, GUEST_MAC_ADDRESS), Some("10.0.0.3"));
    }

    #[test]
    fn test_lease_expiry() {
        let leases = parse_leases(LEASES).unwrap();
        let lease = lease_for_mac(&leases, GUEST_MAC_ADDRESS).unwrap();
        assert_eq!(lease.expires_at().unwrap().timestamp(), 1700003600);

        let bare = parse_leases(r#"[{"ip-address": "10.0.0.2", "mac-address": "52:fd:fc:07:21:82"}]"#).unwrap();
        assert!(bare[0].expires_at().is_none());
    }

    #[test]
    fn test_records_without_mac() {
        let leases = parse_leases(
            r#"[
                {"ip-address": "192.168.130.11", "mac-address": "52:fd:fc:07:21:82", "expiry-time": 1700000000},
                {"ip-address": "fd00::5", "client-id": "00:01:00:01:2c:1f", "expiry-time": 1700000100}
            ]"#,
        )
        .unwrap();
        assert_eq!(leases.len(), 2);
        assert!(leases[1].mac_address.is_empty());
        assert_eq!(ip_for_mac(&leases, GUEST_MAC_ADDRESS), Some("192.168.130.11"));
    }

    #[tokio::test]
    async fn test_resolve_without_network() {
        use crate::mock::MockBackend;

        let features = crate::types::BackendFeatures {
            interface_addresses: false,
            define_networks: false,
        };
        let mock = Arc::new(MockBackend::new().with_features(features));
        let resolver = AddressResolver::new(mock.clone(), "/nonexistent");

        let ip = resolver.resolve(&DomainHandle::new("crc"), "").await.unwrap();
        assert!(ip.is_none());
        let calls = mock.calls();
        assert_eq!(calls.network_lookups, 0);
        assert_eq!(calls.domain_xml_reads, 0);
    }

    #[test]
    fn test_unknown_mac() {
        let leases = parse_leases(LEASES).unwrap();
        assert_eq!(ip_for_mac(&leases, "00:11:22:33:44:55"), None);
    }

    #[test]
    fn test_empty_lease_file() {
        assert!(parse_leases("").unwrap().is_empty());
        assert!(parse_leases("[]").unwrap().is_empty());
        assert!(parse_leases("not json").is_err());
    }

    #[test]
    fn test_ipv4_filter() {
        let interfaces = vec![
            GuestInterface {
                name: "vnet1".to_string(),
                hwaddr: "52:54:00:00:00:01".to_string(),
                addresses: vec![InterfaceAddress {
                    family: IpFamily::V4,
                    address: "192.168.122.5".to_string(),
                    prefix: 24,
                }],
            },
            GuestInterface {
                name: "vnet0".to_string(),
                hwaddr: GUEST_MAC_ADDRESS.to_string(),
                addresses: vec![
                    InterfaceAddress {
                        family: IpFamily::V6,
                        address: "fe80::50fd:fcff:fe07:2182".to_string(),
                        prefix: 64,
                    },
                    InterfaceAddress {
                        family: IpFamily::V4,
                        address: "192.168.130.11".to_string(),
                        prefix: 24,
                    },
                ],
            },
        ];

        assert_eq!(
            ipv4_for_mac(&interfaces, GUEST_MAC_ADDRESS).as_deref(),
            Some("192.168.130.11")
        );
        assert_eq!(ipv4_for_mac(&interfaces, "00:00:00:00:00:00"), None);
    }

    #[tokio::test]
    async fn test_lease_file_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("crc.status"), LEASES).unwrap();

        let ip = lease_file_ip(dir.path(), "crc", GUEST_MAC_ADDRESS).await.unwrap();
        assert_eq!(ip.as_deref(), Some("192.168.130.12"));

        let missing = lease_file_ip(dir.path(), "virbr0", GUEST_MAC_ADDRESS).await.unwrap();
        assert!(missing.is_none());
    }
}
