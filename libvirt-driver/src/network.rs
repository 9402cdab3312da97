//! Virtual network validation.
//!
//! The machine's network is a provisioning-time prerequisite: the driver
//! checks that it can hand out DHCP leases and restarts it when it is down,
//! but only defines it itself when the backend is allowed to and the
//! configuration says how.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::NetworkDefinition;
use crate::error::{DriverError, Result};
use crate::traits::Hypervisor;
use crate::types::NetworkHandle;
use crate::xml::{nat_network_xml, NetworkDoc};

/// Checks (and if needed reactivates) the machine's virtual network.
pub struct NetworkValidator {
    backend: Arc<dyn Hypervisor>,
}

impl NetworkValidator {
    pub fn new(backend: Arc<dyn Hypervisor>) -> Self {
        Self { backend }
    }

    /// Validate the named network. An empty name means networking is
    /// disabled and always succeeds.
    #[instrument(skip(self, definition), fields(network = %name))]
    pub async fn validate(&self, name: &str, definition: Option<&NetworkDefinition>) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        debug!("Validating network");

        let network = match self.backend.lookup_network(name).await? {
            Some(network) => network,
            None => self.define(name, definition).await?,
        };

        let doc = NetworkDoc::parse(&self.backend.network_xml(&network).await?)?;
        check_dhcp(name, &doc)?;

        // Corner case, but might happen...
        if !self.backend.network_is_active(&network).await? {
            info!("Reactivating network");
            if let Err(e) = self.backend.network_create(&network).await {
                warn!(error = %e, "Failed to start network");
                return Err(e);
            }
        }

        Ok(())
    }

    async fn define(&self, name: &str, definition: Option<&NetworkDefinition>) -> Result<NetworkHandle> {
        let missing = || DriverError::PrerequisiteMissing(format!(
            "Use 'crc setup' to define the network, network '{}' not found",
            name
        ));

        let definition = match definition {
            Some(d) if self.backend.features().define_networks => d,
            _ => return Err(missing()),
        };

        let xml = nat_network_xml(name, definition)?;
        info!(xml = %xml, "Defining network");
        self.backend.network_define(&xml).await.map_err(|e| {
            DriverError::PrerequisiteMissing(format!(
                "Use 'crc setup' to define the network, {}",
                e
            ))
        })
    }
}

fn check_dhcp(name: &str, doc: &NetworkDoc) -> Result<()> {
    if doc.ips.len() != 1 {
        return Err(DriverError::NetworkMisconfigured(format!(
            "unexpected number of IPs for network {}",
            name
        )));
    }
    let ip = &doc.ips[0];
    if ip.address.is_empty() || ip.dhcp.is_none() {
        return Err(DriverError::NetworkMisconfigured(format!(
            "{} network doesn't have DHCP configured",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, DHCP_NETWORK_XML};
    use crate::types::BackendFeatures;

    fn definition() -> NetworkDefinition {
        NetworkDefinition {
            bridge: "crc".to_string(),
            address: "192.168.130.1".to_string(),
            prefix: 24,
            dhcp_start: "192.168.130.11".to_string(),
            dhcp_end: "192.168.130.11".to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_name_is_noop() {
        let mock = Arc::new(MockBackend::new());
        NetworkValidator::new(mock.clone()).validate("", None).await.unwrap();
        assert_eq!(mock.calls().network_lookups, 0);
    }

    #[tokio::test]
    async fn test_missing_network_needs_setup() {
        let mock = Arc::new(MockBackend::new());
        let err = NetworkValidator::new(mock.clone())
            .validate("crc", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::PrerequisiteMissing(_)));
        assert!(err.to_string().contains("crc setup"));
    }

    #[tokio::test]
    async fn test_missing_network_not_defined_without_permission() {
        let mock = Arc::new(MockBackend::new());
        let def = definition();
        let err = NetworkValidator::new(mock.clone())
            .validate("crc", Some(&def))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::PrerequisiteMissing(_)));
        assert_eq!(mock.calls().network_defines, 0);
    }

    #[tokio::test]
    async fn test_missing_network_defined_when_permitted() {
        let mock = Arc::new(MockBackend::new().with_features(BackendFeatures {
            interface_addresses: true,
            define_networks: true,
        }));
        let def = definition();

        NetworkValidator::new(mock.clone())
            .validate("crc", Some(&def))
            .await
            .unwrap();

        assert_eq!(mock.calls().network_defines, 1);
        assert!(mock.network_is_active_now("crc"));
    }

    #[tokio::test]
    async fn test_active_dhcp_network_passes() {
        let mock = Arc::new(MockBackend::new());
        mock.add_network("crc", DHCP_NETWORK_XML, true, "crc");

        NetworkValidator::new(mock.clone()).validate("crc", None).await.unwrap();
        assert_eq!(mock.calls().network_creates, 0);
    }

    #[tokio::test]
    async fn test_inactive_network_is_reactivated() {
        let mock = Arc::new(MockBackend::new());
        mock.add_network("crc", DHCP_NETWORK_XML, false, "crc");

        NetworkValidator::new(mock.clone()).validate("crc", None).await.unwrap();
        assert!(mock.network_is_active_now("crc"));
    }

    #[tokio::test]
    async fn test_reactivation_failure_is_fatal() {
        let mock = Arc::new(MockBackend::new());
        mock.add_network("crc", DHCP_NETWORK_XML, false, "crc");
        mock.fail_on("network_create");

        assert!(NetworkValidator::new(mock.clone()).validate("crc", None).await.is_err());
    }

    #[tokio::test]
    async fn test_network_without_dhcp_fails() {
        let mock = Arc::new(MockBackend::new());
        mock.add_network(
            "crc",
            "<network><name>crc</name><ip address='192.168.130.1' prefix='24'/></network>",
            true,
            "crc",
        );

        let err = NetworkValidator::new(mock.clone())
            .validate("crc", None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "crc network doesn't have DHCP configured");
    }

    #[tokio::test]
    async fn test_network_with_two_ip_blocks_fails() {
        let mock = Arc::new(MockBackend::new());
        mock.add_network(
            "crc",
            "<network><name>crc</name>\
             <ip address='192.168.130.1' prefix='24'><dhcp><range start='192.168.130.11' end='192.168.130.11'/></dhcp></ip>\
             <ip family='ipv6' address='fd00::1' prefix='64'/></network>",
            true,
            "crc",
        );

        let err = NetworkValidator::new(mock.clone())
            .validate("crc", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NetworkMisconfigured(_)));
        assert!(err.to_string().contains("unexpected number of IPs"));
    }
}
