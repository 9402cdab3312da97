//! Lifecycle scenarios for the machine driver.
//!
//! These tests drive [`Driver`] against the in-memory mock hypervisor. The
//! polling scenarios run on tokio's paused clock, so elapsed times are exact.

use std::sync::Arc;
use std::time::Duration;

use libvirt_driver::mock::{MockBackend, DHCP_NETWORK_XML};
use libvirt_driver::xml::{domain_xml, GUEST_MAC_ADDRESS};
use libvirt_driver::{
    BackendFeatures, DomainState, Driver, DriverConfig, DriverError, GuestInterface,
    InterfaceAddress, IpFamily, MachineState,
};
use tempfile::TempDir;
use tokio::time::Instant;

const GIB: u64 = 1024 * 1024 * 1024;

struct Fixture {
    dir: TempDir,
    mock: Arc<MockBackend>,
    config: DriverConfig,
}

impl Fixture {
    fn new(mock: MockBackend) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("cache/crc.qcow2");
        std::fs::create_dir_all(image.parent().unwrap()).unwrap();
        std::fs::write(&image, vec![0u8; 4096]).unwrap();

        let mut config = DriverConfig::new("crc", dir.path()).with_image_source(&image);
        config.leases_dir = dir.path().join("dnsmasq");

        let mock = Arc::new(mock);
        mock.add_network("crc", DHCP_NETWORK_XML, true, "crc");

        Self { dir, mock, config }
    }

    /// A defined machine with its pool and disk volume already in place.
    fn provisioned(mock: MockBackend, state: DomainState) -> Self {
        let fixture = Self::new(mock);
        fixture
            .mock
            .add_pool("crc", &fixture.config.machine_dir(), true);
        fixture.mock.add_volume("crc", "crc.qcow2", 31 * GIB);
        fixture.mock.add_domain(
            "crc",
            &domain_xml(&fixture.config, Some("q35")).unwrap(),
            state,
        );
        fixture
    }

    fn driver(&self) -> Driver {
        Driver::new(self.config.clone(), self.mock.clone())
    }
}

fn guest_interface(ip: &str) -> GuestInterface {
    GuestInterface {
        name: "vnet0".to_string(),
        hwaddr: GUEST_MAC_ADDRESS.to_string(),
        addresses: vec![InterfaceAddress {
            family: IpFamily::V4,
            address: ip.to_string(),
            prefix: 24,
        }],
    }
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_provisions_and_starts() {
    let mut fixture = Fixture::new(MockBackend::new());
    fixture.config.network.clear();
    let mut driver = fixture.driver();

    driver.create().await.unwrap();

    let machine_dir = fixture.config.machine_dir();
    assert!(machine_dir.join("crc.qcow2").is_file());
    assert!(machine_dir.join(".crc-exist").is_file());
    assert!(fixture.mock.pool_is_active("crc"));
    assert_eq!(fixture.mock.calls().pool_refreshes, 1);

    let xml = fixture.mock.domain_definition("crc").unwrap();
    assert!(xml.contains(&machine_dir.join("crc.qcow2").to_string_lossy().to_string()));
    assert!(xml.contains("machine='q35'"));
    assert!(!xml.contains("<interface"));

    assert_eq!(fixture.mock.current_state("crc"), Some(DomainState::Running));
    assert!(driver.config().disk_capacity > 0);
    assert_eq!(driver.get_state().await.unwrap(), MachineState::Running);
}

#[tokio::test]
async fn test_create_grows_disk_to_requested_capacity() {
    let mut fixture = Fixture::new(MockBackend::new());
    fixture.config.network.clear();
    fixture.config.disk_capacity = 40 * GIB;
    let mut driver = fixture.driver();

    driver.create().await.unwrap();

    assert_eq!(fixture.mock.volume_capacity_of("crc", "crc.qcow2"), Some(40 * GIB));
    assert_eq!(driver.config().disk_capacity, 40 * GIB);
}

#[tokio::test]
async fn test_create_twice_is_rejected() {
    let mut fixture = Fixture::new(MockBackend::new());
    fixture.config.network.clear();
    let mut driver = fixture.driver();

    driver.create().await.unwrap();
    let err = driver.create().await.unwrap_err();
    assert!(matches!(err, DriverError::InvalidState(_)));
    assert_eq!(fixture.mock.calls().domain_defines, 1);
}

#[tokio::test]
async fn test_create_leaves_existing_machine_alone() {
    let mut fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    fixture.config.network.clear();
    let disk = fixture.config.disk_image_path();
    std::fs::create_dir_all(disk.parent().unwrap()).unwrap();
    std::fs::write(&disk, b"guest data").unwrap();

    // A fresh driver has no cached handle for the defined machine
    let mut driver = fixture.driver();
    let err = driver.create().await.unwrap_err();

    assert!(matches!(err, DriverError::InvalidState(_)));
    assert_eq!(std::fs::read(&disk).unwrap(), b"guest data");
    let calls = fixture.mock.calls();
    assert_eq!(calls.domain_defines, 0);
    assert_eq!(calls.pool_refreshes, 0);
}

#[tokio::test]
async fn test_create_without_machine_type() {
    let mut fixture = Fixture::new(MockBackend::new().with_capabilities("<capabilities/>"));
    fixture.config.network.clear();
    let mut driver = fixture.driver();

    driver.create().await.unwrap();

    let xml = fixture.mock.domain_definition("crc").unwrap();
    assert!(!xml.contains("machine="));
}

#[tokio::test]
async fn test_create_rejects_unsupported_format() {
    let mut fixture = Fixture::new(MockBackend::new());
    fixture.config.image_format = "raw".to_string();
    let mut driver = fixture.driver();

    let err = driver.create().await.unwrap_err();
    assert!(err.to_string().contains("Unsupported VM image format: raw"));
    assert_eq!(fixture.mock.calls().domain_defines, 0);
}

#[tokio::test]
async fn test_create_needs_network() {
    let fixture = Fixture::new(MockBackend::new());
    let mut config = fixture.config.clone();
    config.network = "missing".to_string();
    let mut driver = Driver::new(config, fixture.mock.clone());

    let err = driver.create().await.unwrap_err();
    assert!(matches!(err, DriverError::PrerequisiteMissing(_)));
    // Defined, but never started
    assert_eq!(fixture.mock.current_state("crc"), Some(DomainState::Shutoff));
}

// =============================================================================
// Start
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_records_ip() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    fixture
        .mock
        .set_interfaces("crc", vec![guest_interface("192.168.130.11")]);
    let mut driver = fixture.driver();
    let start = Instant::now();

    driver.start().await.unwrap();

    assert_eq!(driver.config().ip_address, "192.168.130.11");
    assert_eq!(driver.config().disk_capacity, 31 * GIB);
    assert_eq!(start.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_start_without_ip_degrades() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    let mut driver = fixture.driver();
    let start = Instant::now();

    driver.start().await.unwrap();

    assert!(driver.config().ip_address.is_empty());
    assert_eq!(fixture.mock.calls().interface_queries, 60);
    assert_eq!(start.elapsed(), Duration::from_secs(5 + 59 * 3));
    assert_eq!(fixture.mock.current_state("crc"), Some(DomainState::Running));
}

#[tokio::test(start_paused = true)]
async fn test_start_without_network_skips_ip_wait() {
    let mut fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    fixture.config.network.clear();
    let mut driver = fixture.driver();
    let start = Instant::now();

    driver.start().await.unwrap();

    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(fixture.mock.calls().network_lookups, 0);
}

#[tokio::test]
async fn test_start_rejected_by_hypervisor() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    fixture.mock.fail_on("domain_create");
    let mut driver = fixture.driver();

    assert!(driver.start().await.is_err());
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_returns_once_stopped_is_observed() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Running);
    fixture.mock.set_shutdown_after(Some(7));
    let mut driver = fixture.driver();
    let start = Instant::now();

    driver.stop().await.unwrap();

    // One state check before the shutdown request, then seven polls
    assert_eq!(fixture.mock.calls().state_queries, 1 + 7);
    assert_eq!(start.elapsed(), Duration::from_secs(7));
    assert_eq!(fixture.mock.current_state("crc"), Some(DomainState::Shutoff));
}

#[tokio::test(start_paused = true)]
async fn test_stop_gives_up_after_bounded_attempts() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Running);
    fixture.mock.set_shutdown_after(None);
    let mut driver = fixture.driver();
    let start = Instant::now();

    let err = driver.stop().await.unwrap_err();

    assert!(matches!(err, DriverError::ShutdownTimeout));
    assert!(err.to_string().contains("try the kill command"));
    assert_eq!(fixture.mock.calls().state_queries, 1 + 120);
    assert_eq!(start.elapsed(), Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn test_stop_tolerates_state_query_errors() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Running);
    fixture.mock.set_shutdown_after(None);
    let mut driver = fixture.driver();
    driver.get_state().await.unwrap();

    // Every polled state query fails for ten seconds, then the guest is
    // reported as powered off.
    let mock = fixture.mock.clone();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        mock.fail_on("domain_state");
        tokio::time::sleep(Duration::from_secs(10)).await;
        mock.clear_failure("domain_state");
        mock.script_states("crc", [DomainState::Shutoff]);
    });

    let start = Instant::now();
    driver.stop().await.unwrap();
    stopper.await.unwrap();

    assert_eq!(start.elapsed(), Duration::from_secs(11));
}

// =============================================================================
// Kill, Remove, Restart
// =============================================================================

#[tokio::test]
async fn test_kill_does_not_poll() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Running);
    let mut driver = fixture.driver();

    driver.kill().await.unwrap();

    assert_eq!(fixture.mock.calls().state_queries, 0);
    assert_eq!(driver.get_state().await.unwrap(), MachineState::Stopped);
}

#[tokio::test]
async fn test_remove_ignores_destroy_failure() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    let mut driver = fixture.driver();

    driver.remove().await.unwrap();

    assert_eq!(fixture.mock.calls().domain_destroys, 1);
    assert!(!fixture.mock.domain_exists("crc"));
    // Disk stays
    assert_eq!(fixture.mock.volume_capacity_of("crc", "crc.qcow2"), Some(31 * GIB));
}

#[tokio::test]
async fn test_remove_propagates_undefine_failure() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Running);
    fixture.mock.fail_on("domain_undefine");
    let mut driver = fixture.driver();

    assert!(driver.remove().await.is_err());
    assert!(fixture.mock.domain_exists("crc"));
}

#[tokio::test(start_paused = true)]
async fn test_restart() {
    let mut fixture = Fixture::provisioned(MockBackend::new(), DomainState::Running);
    fixture.config.network.clear();
    let mut driver = fixture.driver();

    driver.restart().await.unwrap();

    let calls = fixture.mock.calls();
    assert_eq!(calls.domain_shutdowns, 1);
    assert_eq!(calls.domain_creates, 1);
    assert_eq!(driver.get_state().await.unwrap(), MachineState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_restart_stops_on_stop_failure() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Running);
    fixture.mock.fail_on("domain_shutdown");
    let mut driver = fixture.driver();

    assert!(driver.restart().await.is_err());
    assert_eq!(fixture.mock.calls().domain_creates, 0);
}

// =============================================================================
// GetIP
// =============================================================================

#[tokio::test]
async fn test_get_ip_requires_running() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    let mut driver = fixture.driver();

    let err = driver.get_ip().await.unwrap_err();

    assert!(matches!(err, DriverError::NotRunning));
    assert_eq!(err.to_string(), "host is not running");
    let calls = fixture.mock.calls();
    assert_eq!(calls.domain_xml_reads, 0);
    assert_eq!(calls.interface_queries, 0);
    assert_eq!(calls.network_lookups, 0);
}

#[tokio::test]
async fn test_get_ip_from_interface_addresses() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Running);
    fixture
        .mock
        .set_interfaces("crc", vec![guest_interface("192.168.130.11")]);
    let mut driver = fixture.driver();

    assert_eq!(driver.get_ip().await.unwrap(), "192.168.130.11");
    assert_eq!(driver.ssh_hostname().await.unwrap(), "192.168.130.11");
}

#[tokio::test]
async fn test_get_ip_from_lease_file_prefers_latest_entry() {
    let features = BackendFeatures {
        interface_addresses: false,
        define_networks: false,
    };
    let fixture = Fixture::provisioned(MockBackend::new().with_features(features), DomainState::Running);
    std::fs::create_dir_all(&fixture.config.leases_dir).unwrap();
    std::fs::write(
        fixture.config.leases_dir.join("crc.status"),
        r#"[
  {
    "ip-address": "192.168.130.11",
    "mac-address": "52:fd:fc:07:21:82",
    "hostname": "crc",
    "expiry-time": 1700000000
  },
  {
    "ip-address": "192.168.130.12",
    "mac-address": "52:fd:fc:07:21:82",
    "hostname": "crc",
    "expiry-time": 1700003600
  }
]"#,
    )
    .unwrap();
    let mut driver = fixture.driver();

    assert_eq!(driver.get_ip().await.unwrap(), "192.168.130.12");
    assert_eq!(fixture.mock.calls().interface_queries, 0);
}

#[tokio::test]
async fn test_get_ip_unknown_is_empty() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Running);
    let mut driver = fixture.driver();

    assert_eq!(driver.get_ip().await.unwrap(), "");
}

// =============================================================================
// Configuration updates
// =============================================================================

#[tokio::test]
async fn test_update_applies_deltas() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    let mut driver = fixture.driver();

    let mut new = fixture.config.clone();
    new.memory_mib = 10752;
    new.cpus = 6;
    new.disk_capacity = 40 * GIB;
    new.ssh_user = "admin".to_string();

    driver
        .update_config_raw(&serde_json::to_vec(&new).unwrap())
        .await
        .unwrap();

    assert_eq!(fixture.mock.domain_memory_kib("crc"), Some(10752 * 1024));
    assert_eq!(fixture.mock.domain_vcpus("crc"), Some(6));
    assert_eq!(fixture.mock.volume_capacity_of("crc", "crc.qcow2"), Some(40 * GIB));
    assert_eq!(driver.config(), &new);
    assert_eq!(driver.ssh_username(), "admin");

    let calls = fixture.mock.calls();
    assert_eq!(calls.memory_updates, 2);
    assert_eq!(calls.vcpu_updates, 2);
}

#[tokio::test]
async fn test_update_without_changes_touches_nothing() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    let mut driver = fixture.driver();

    driver
        .update_config_raw(&serde_json::to_vec(&fixture.config).unwrap())
        .await
        .unwrap();

    let calls = fixture.mock.calls();
    assert_eq!(calls.memory_updates, 0);
    assert_eq!(calls.vcpu_updates, 0);
    assert_eq!(calls.volume_resizes, 0);
}

#[tokio::test]
async fn test_update_reports_partial_application() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    fixture.mock.fail_on("domain_set_vcpus");
    let mut driver = fixture.driver();

    let mut new = fixture.config.clone();
    new.memory_mib = 10752;
    new.cpus = 6;

    let err = driver
        .update_config_raw(&serde_json::to_vec(&new).unwrap())
        .await
        .unwrap_err();

    match err {
        DriverError::PartialUpdate { applied, failed, .. } => {
            assert_eq!(applied, vec!["memory".to_string()]);
            assert_eq!(failed, "cpus");
        }
        other => panic!("unexpected error: {other}"),
    }
    // Memory went through and is not rolled back
    assert_eq!(driver.config().memory_mib, 10752);
    assert_eq!(driver.config().cpus, fixture.config.cpus);
    assert_eq!(fixture.mock.domain_memory_kib("crc"), Some(10752 * 1024));
}

#[tokio::test]
async fn test_update_refuses_shrink() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    let mut driver = fixture.driver();

    let mut new = fixture.config.clone();
    new.disk_capacity = 20 * GIB;

    let err = driver
        .update_config_raw(&serde_json::to_vec(&new).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DriverError::PartialUpdate { ref source, .. } if matches!(**source, DriverError::ShrinkRefused { .. })
    ));
    assert_eq!(fixture.mock.volume_capacity_of("crc", "crc.qcow2"), Some(31 * GIB));
}

#[tokio::test]
async fn test_update_rejects_oversized_memory() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    let mut driver = fixture.driver();

    let mut new = fixture.config.clone();
    new.memory_mib = u64::MAX;

    let err = driver
        .update_config_raw(&serde_json::to_vec(&new).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DriverError::PartialUpdate { ref source, .. } if matches!(**source, DriverError::InvalidConfig(_))
    ));
    assert_eq!(fixture.mock.calls().memory_updates, 0);
    assert_eq!(driver.config().memory_mib, fixture.config.memory_mib);
}

#[tokio::test]
async fn test_update_rejects_garbage() {
    let fixture = Fixture::provisioned(MockBackend::new(), DomainState::Shutoff);
    let mut driver = fixture.driver();

    let err = driver.update_config_raw(b"{not json").await.unwrap_err();
    assert!(matches!(err, DriverError::InvalidConfig(_)));
    assert_eq!(driver.config(), &fixture.config);
}

#[test]
fn test_fixture_paths_are_isolated() {
    let fixture = Fixture::new(MockBackend::new());
    assert!(fixture.config.machine_dir().starts_with(fixture.dir.path()));
}
