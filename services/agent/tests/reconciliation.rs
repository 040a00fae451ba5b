use std::sync::Arc;

use proptest::prelude::*;

use routekeeper_agent::entities::{AddressManager, InterfaceManager};
use routekeeper_agent::kernel::{KernelCall, LinkKindSpec, RecordingKernel};
use routekeeper_agent::store::{AddressConfig, ConfigTree, InterfaceConfig, InterfaceKind};
use routekeeper_events::{
    AddressAdd, Event, InterfaceAdd, InterfaceRemove, LinkAttributes,
};
use routekeeper_networking::{IpInterface, Scope, RTPROT_ROUTEKEEPER};
use routekeeper_reconcile::{ObjectStatus, Origin};

fn link_add(ifindex: u32, name: &str, kind: Option<&str>) -> Event {
    Event::InterfaceAdd(InterfaceAdd {
        ifindex,
        ifname: name.to_string(),
        kind: kind.map(str::to_string),
        attributes: LinkAttributes::default(),
    })
}

fn link_remove(ifindex: u32, name: &str) -> Event {
    Event::InterfaceRemove(InterfaceRemove {
        ifindex,
        ifname: name.to_string(),
    })
}

fn address_reported(ifindex: u32, name: &str, address: IpInterface) -> Event {
    Event::AddressAdd(AddressAdd {
        ifindex,
        ifname: name.to_string(),
        address,
        peer: None,
        scope: Scope::Universe,
        label: None,
        protocol: Some(RTPROT_ROUTEKEEPER),
    })
}

fn addresses_on_eth0(addresses: &[IpInterface]) -> ConfigTree {
    let mut tree = ConfigTree::new();
    tree.addresses = addresses
        .iter()
        .map(|ip| AddressConfig {
            interface: "eth0".to_string(),
            ip: *ip,
            peer: None,
        })
        .collect();
    tree
}

#[tokio::test]
async fn test_address_follows_its_interface() {
    let kernel = Arc::new(RecordingKernel::new());
    let manager = AddressManager::new(kernel.clone(), RTPROT_ROUTEKEEPER);
    let ip: IpInterface = "192.0.2.1/24".parse().unwrap();

    manager.apply_config(&addresses_on_eth0(&[ip])).await.unwrap();
    let report = manager.list().await;
    assert_eq!(report[0].status, ObjectStatus::InterfaceMissing);
    assert_eq!(report[0].origin, Origin::Declared);
    assert!(kernel.calls().is_empty());

    manager.handle_event(link_add(2, "eth0", None)).await.unwrap();
    let calls = kernel.take_calls();
    assert_eq!(calls.len(), 1);
    let KernelCall::AddressAdd(spec) = &calls[0] else {
        panic!("expected an address add, got {calls:?}");
    };
    assert_eq!((spec.ifindex, spec.address), (2, ip));
    assert_eq!(manager.list().await[0].status, ObjectStatus::AddressMissing);

    manager
        .handle_event(address_reported(2, "eth0", ip))
        .await
        .unwrap();
    assert!(kernel.calls().is_empty());
    assert_eq!(manager.list().await[0].status, ObjectStatus::Present);

    // The kernel takes the address with the device; nothing to issue.
    manager.handle_event(link_remove(2, "eth0")).await.unwrap();
    assert!(kernel.calls().is_empty());
    assert_eq!(manager.list().await[0].status, ObjectStatus::InterfaceMissing);

    manager.handle_event(link_add(4, "eth0", None)).await.unwrap();
    let calls = kernel.take_calls();
    assert!(matches!(&calls[..], [KernelCall::AddressAdd(spec)] if spec.ifindex == 4));
}

#[tokio::test]
async fn test_bridge_port_waits_for_bridge() {
    let kernel = Arc::new(RecordingKernel::new());
    let manager = InterfaceManager::new(kernel.clone(), RTPROT_ROUTEKEEPER);
    manager.handle_event(link_add(3, "eth1", None)).await.unwrap();

    let mut tree = ConfigTree::new();
    let mut port = InterfaceConfig::new("eth1", InterfaceKind::Ethernet);
    port.link.master = Some("br0".to_string());
    tree.interfaces = vec![InterfaceConfig::new("br0", InterfaceKind::Bridge), port];
    manager.apply_config(&tree).await.unwrap();

    let calls = kernel.take_calls();
    assert!(matches!(
        &calls[..],
        [KernelCall::LinkAdd(spec)] if spec.name == "br0" && spec.kind == LinkKindSpec::Bridge { stp: false }
    ));
    let port_report = manager
        .list()
        .await
        .into_iter()
        .find(|r| r.name == "eth1")
        .unwrap();
    assert_eq!(port_report.waiting_on, vec!["br0"]);

    manager.handle_event(link_add(10, "br0", Some("bridge"))).await.unwrap();
    let calls = kernel.take_calls();
    assert!(calls
        .iter()
        .any(|c| matches!(c, KernelCall::LinkSet { ifindex: 10, params } if params.up == Some(true))));
    assert!(calls
        .iter()
        .any(|c| matches!(c, KernelCall::LinkSet { ifindex: 3, params } if params.master == Some(10))));
    assert_eq!(manager.ifindex("br0").await, Some(10));
}

fn host_addresses() -> impl Strategy<Value = Vec<IpInterface>> {
    proptest::collection::btree_set(1u8..=254, 1..6).prop_map(|hosts| {
        hosts
            .into_iter()
            .map(|host| format!("198.51.100.{host}/24").parse().unwrap())
            .collect()
    })
}

proptest! {
    /// Re-applying configuration and replaying kernel reports never issues
    /// a command twice.
    #[test]
    fn prop_reconciliation_is_idempotent(addresses in host_addresses(), replays in 1usize..4) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let kernel = Arc::new(RecordingKernel::new());
            let manager = AddressManager::new(kernel.clone(), RTPROT_ROUTEKEEPER);
            let tree = addresses_on_eth0(&addresses);

            manager.handle_event(link_add(2, "eth0", None)).await.unwrap();
            for _ in 0..replays {
                manager.apply_config(&tree).await.unwrap();
            }
            prop_assert_eq!(kernel.calls_of("address_add").len(), addresses.len());

            for _ in 0..replays {
                for ip in &addresses {
                    manager.handle_event(address_reported(2, "eth0", *ip)).await.unwrap();
                }
                manager.handle_event(link_add(2, "eth0", None)).await.unwrap();
                manager.apply_config(&tree).await.unwrap();
            }
            prop_assert_eq!(kernel.calls().len(), addresses.len());
            prop_assert!(manager
                .list()
                .await
                .iter()
                .all(|r| r.status == ObjectStatus::Present));
            Ok(())
        })?;
    }
}
