use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;

use routekeeper_agent::entities::{
    AddressManager, AddressStatusReport, InterfaceManager, InterfaceStatusReport, RouteManager,
};
use routekeeper_agent::kernel::{KernelCall, KernelProvider, RecordingKernel};
use routekeeper_agent::netlink::{
    DumpKind, FakeBinding, InterfaceIndex, KernelEventSource, KernelMessage, LinkMessage,
};
use routekeeper_agent::rpc::{Rpc, RpcProvider};
use routekeeper_agent::runtime::{Registration, Runtime};
use routekeeper_agent::store::{CommitOutcome, ConfigProvider, ConfigTree, RouteEntryConfig};
use routekeeper_events::LinkAttributes;
use routekeeper_networking::{IpNetwork, RTPROT_ROUTEKEEPER};
use routekeeper_reconcile::Origin;

fn eth0() -> KernelMessage {
    KernelMessage::NewLink(LinkMessage {
        ifindex: 2,
        ifname: "eth0".to_string(),
        kind: None,
        attributes: LinkAttributes {
            up: true,
            mtu: Some(1500),
            ..Default::default()
        },
    })
}

fn agent(kernel: Arc<RecordingKernel>, binding: Arc<FakeBinding>) -> Runtime {
    let provider = KernelProvider::new(kernel, binding, InterfaceIndex::shared(), RTPROT_ROUTEKEEPER);

    let mut runtime = Runtime::new();
    runtime
        .register(Registration::new(move |_| Ok(provider)))
        .unwrap();
    runtime
        .register(Registration::new(ConfigProvider::from_injector))
        .unwrap();
    runtime
        .register(
            Registration::new(KernelEventSource::from_injector)
                .depends_on::<KernelProvider>("kernel"),
        )
        .unwrap();
    runtime
        .register(
            Registration::new(InterfaceManager::from_injector)
                .depends_on::<KernelProvider>("kernel")
                .depends_on::<ConfigProvider>("config"),
        )
        .unwrap();
    runtime
        .register(
            Registration::new(AddressManager::from_injector)
                .depends_on::<KernelProvider>("kernel")
                .depends_on::<ConfigProvider>("config"),
        )
        .unwrap();
    runtime
        .register(
            Registration::new(RouteManager::from_injector)
                .depends_on::<KernelProvider>("kernel")
                .depends_on::<ConfigProvider>("config"),
        )
        .unwrap();
    runtime
        .register(
            Registration::new(RpcProvider::from_injector)
                .depends_on::<ConfigProvider>("config")
                .depends_on::<InterfaceManager>("interfaces")
                .depends_on::<AddressManager>("addresses")
                .depends_on::<RouteManager>("routes"),
        )
        .unwrap();
    runtime
}

async fn started(kernel: Arc<RecordingKernel>, binding: Arc<FakeBinding>) -> (Runtime, Arc<Rpc>) {
    let mut runtime = agent(kernel, binding);
    runtime.load().unwrap();
    runtime.start().await.unwrap();
    let rpc = runtime.provider::<RpcProvider>().unwrap().rpc();
    (runtime, rpc)
}

async fn call(rpc: &Rpc, method: &str, request: Value) -> Value {
    let response = rpc.call(method, request).await;
    assert!(response.is_ok(), "{method} failed: {response:?}");
    response.body.unwrap_or(Value::Null)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_staged_edits_and_commit() {
    let kernel = Arc::new(RecordingKernel::new());
    let (mut runtime, rpc) = started(kernel.clone(), Arc::new(FakeBinding::new())).await;

    call(&rpc, "interface/config/add", json!({"name": "eth0", "type": "ethernet"})).await;
    call(&rpc, "address/config/add", json!({"interface": "eth0", "ip": "192.0.2.1/24"})).await;
    let duplicate = rpc
        .call("address/config/add", json!({"interface": "eth0", "ip": "192.0.2.1/24"}))
        .await;
    assert_eq!(duplicate.code, "ALREADY_EXISTS");

    // Staged edits are invisible until committed.
    let running: ConfigTree = serde_json::from_value(call(&rpc, "config/running/get", Value::Null).await).unwrap();
    assert!(running.addresses.is_empty());

    let outcome: CommitOutcome =
        serde_json::from_value(call(&rpc, "config/staged/commit", Value::Null).await).unwrap();
    assert_eq!(outcome, CommitOutcome::Success { version: 1 });
    let outcome: CommitOutcome =
        serde_json::from_value(call(&rpc, "config/staged/commit", Value::Null).await).unwrap();
    assert_eq!(outcome, CommitOutcome::Unchanged);

    // Nothing was reported by the kernel, so nothing could be converged.
    assert!(kernel.calls().is_empty());
    let addresses: Vec<AddressStatusReport> =
        serde_json::from_value(call(&rpc, "address/list", Value::Null).await).unwrap();
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].origin, Origin::Declared);

    call(&rpc, "interface/config/delete", json!({"name": "eth0"})).await;
    call(&rpc, "config/staged/drop", Value::Null).await;
    let staged: ConfigTree = serde_json::from_value(call(&rpc, "config/staged/get", Value::Null).await).unwrap();
    assert_eq!(staged.interfaces.len(), 1);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn test_route_configuration_methods() {
    let (mut runtime, rpc) = started(Arc::new(RecordingKernel::new()), Arc::new(FakeBinding::new())).await;

    let default_route = json!({
        "table": 254,
        "destination": "0.0.0.0/0",
        "nexthops": [{"gateway": "192.0.2.254", "interface": "eth0"}],
    });
    call(&rpc, "route/config/route/add", default_route.clone()).await;
    assert_eq!(
        rpc.call("route/config/route/add", default_route).await.code,
        "ALREADY_EXISTS"
    );

    let route: RouteEntryConfig = serde_json::from_value(
        call(&rpc, "route/config/route/get", json!({"table": 254, "destination": "0.0.0.0/0"})).await,
    )
    .unwrap();
    assert_eq!(route.nexthops.len(), 1);

    let missing = rpc
        .call("route/config/route/get", json!({"table": 100, "destination": "0.0.0.0/0"}))
        .await;
    assert_eq!(missing.code, "NOT_FOUND");

    call(&rpc, "route/config/table/add", json!({"id": 100, "name": "uplink"})).await;
    call(&rpc, "route/config/table/update", json!({"id": 100, "name": "wan"})).await;
    assert_eq!(
        rpc.call("route/config/table/update", json!({"id": 101, "name": "lan"})).await.code,
        "NOT_FOUND"
    );
    assert_eq!(
        rpc.call("route/config/table/delete", json!({"id": 254})).await.code,
        "INVALID_ARGUMENT"
    );
    call(&rpc, "route/config/table/delete", json!({"id": 100})).await;

    let invalid = rpc
        .call("route/config/route/add", json!({"table": 254, "destination": "10.0.0.0/8"}))
        .await;
    assert_eq!(invalid.code, "INVALID_ARGUMENT");
    assert_eq!(rpc.call("route/config/zap", Value::Null).await.code, "NO_SUCH_METHOD");

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn test_kernel_events_and_dhcp_lease() {
    let kernel = Arc::new(RecordingKernel::new());
    let binding = Arc::new(FakeBinding::new().with_dump(DumpKind::Links, vec![eth0()]));
    let (mut runtime, rpc) = started(kernel.clone(), binding.clone()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (rpc, kernel) = (&rpc, &kernel);
    let scenario = async {
        eventually("eth0 to be reported", || async move {
            let interfaces: Vec<InterfaceStatusReport> =
                serde_json::from_value(call(rpc, "interface/list", Value::Null).await).unwrap();
            interfaces
                .iter()
                .any(|i| i.name == "eth0" && i.ifindex == Some(2) && i.origin == Origin::Observed)
        })
        .await;

        call(
            rpc,
            "dhcp/v4/event",
            json!({
                "event": "acquired",
                "interface": "eth0",
                "address": "203.0.113.10/24",
                "gateway": "203.0.113.1",
            }),
        )
        .await;

        let default: &IpNetwork = &"0.0.0.0/0".parse().unwrap();
        eventually("the lease to be applied", || async move {
            let addresses = kernel.calls_of("address_add");
            let routes = kernel.calls_of("route_replace");
            addresses
                .iter()
                .any(|c| matches!(c, KernelCall::AddressAdd(spec) if spec.ifindex == 2 && spec.noprefixroute))
                && routes
                    .iter()
                    .any(|c| matches!(c, KernelCall::RouteReplace(spec) if spec.destination == *default))
        })
        .await;

        let addresses: Vec<AddressStatusReport> =
            serde_json::from_value(call(rpc, "address/list", Value::Null).await).unwrap();
        assert!(addresses.iter().any(|a| a.origin == Origin::Dynamic));

        let _ = shutdown_tx.send(true);
    };

    let (run, ()) = tokio::join!(runtime.run(shutdown_rx), scenario);
    run.unwrap();
    runtime.stop().await.unwrap();
    assert_eq!(binding.dumps_requested()[0], DumpKind::Links);
}
