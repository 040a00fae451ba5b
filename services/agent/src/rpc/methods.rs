//! RPC method table.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use routekeeper_events::{DhcpLease, DhcpLeaseReset, Event};
use routekeeper_networking::{IpInterface, IpNetwork, DEFAULT_TABLES};

use super::{Rpc, RpcError};
use crate::entities::{
    AddressManager, AddressStatusReport, InterfaceManager, InterfaceStatusReport, RouteManager,
    RouteStatusReport, RouteTableSummary,
};
use crate::runtime::{EventHub, Injector, Provider};
use crate::store::{
    AddressConfig, CommitOutcome, ConfigProvider, ConfigStore, ConfigTree, InterfaceConfig,
    RouteConfig, RouteEntryConfig, RouteTableConfig,
};

/// A DHCPv4 client notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DhcpEvent {
    Preinit(DhcpLeaseReset),
    Acquired(DhcpLease),
    Lost(DhcpLeaseReset),
}

impl From<DhcpEvent> for Event {
    fn from(event: DhcpEvent) -> Self {
        match event {
            DhcpEvent::Preinit(reset) => Event::DhcpLeasePreinit(reset),
            DhcpEvent::Acquired(lease) => Event::DhcpLeaseAcquired(lease),
            DhcpEvent::Lost(reset) => Event::DhcpLeaseLost(reset),
        }
    }
}

/// One route of one table. `get` and `delete` only look at `table` and
/// `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSelector {
    pub table: u32,

    #[serde(flatten)]
    pub route: RouteEntryConfig,
}

#[derive(Debug, Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRequest {
    id: u32,
}

#[derive(Debug, Deserialize)]
struct AddressKeyRequest {
    interface: String,
    ip: IpInterface,
}

struct Methods {
    store: Arc<ConfigStore>,
    interfaces: Arc<InterfaceManager>,
    addresses: Arc<AddressManager>,
    routes: Arc<RouteManager>,
    hub: EventHub,
}

fn table_of<'a>(tree: &'a mut ConfigTree, id: u32) -> Result<&'a mut RouteTableConfig, RpcError> {
    tree.route_table_mut(id)
        .ok_or_else(|| RpcError::NotFound(format!("route table {id}")))
}

fn route_position(table: &RouteTableConfig, destination: &IpNetwork) -> Result<usize, RpcError> {
    table
        .routes
        .iter()
        .position(|r| &r.destination == destination)
        .ok_or_else(|| RpcError::NotFound(format!("route {destination} in table {}", table.id)))
}

impl Methods {
    // =========================================================================
    // Configuration
    // =========================================================================

    async fn running(self: Arc<Self>, _: ()) -> Result<ConfigTree, RpcError> {
        Ok(self.store.get_running().await)
    }

    async fn staged(self: Arc<Self>, _: ()) -> Result<ConfigTree, RpcError> {
        Ok(self.store.get_staged().await)
    }

    async fn drop_staged(self: Arc<Self>, _: ()) -> Result<(), RpcError> {
        self.store.drop_staged().await;
        Ok(())
    }

    async fn commit(self: Arc<Self>, _: ()) -> Result<CommitOutcome, RpcError> {
        Ok(self.store.commit().await)
    }

    // =========================================================================
    // Interfaces
    // =========================================================================

    async fn interface_list(self: Arc<Self>, _: ()) -> Result<Vec<InterfaceStatusReport>, RpcError> {
        Ok(self.interfaces.list().await)
    }

    async fn interface_config_list(self: Arc<Self>, _: ()) -> Result<Vec<InterfaceConfig>, RpcError> {
        Ok(self.store.get_staged().await.interfaces)
    }

    async fn interface_config_add(self: Arc<Self>, config: InterfaceConfig) -> Result<(), RpcError> {
        config.validate()?;
        self.store
            .update_staged(|tree| {
                if tree.interface(&config.name).is_some() {
                    return Err(RpcError::AlreadyExists(format!("interface {}", config.name)));
                }
                tree.interfaces.push(config);
                Ok(())
            })
            .await
    }

    async fn interface_config_update(self: Arc<Self>, config: InterfaceConfig) -> Result<(), RpcError> {
        config.validate()?;
        self.store
            .update_staged(|tree| {
                let Some(existing) = tree.interfaces.iter_mut().find(|i| i.name == config.name) else {
                    return Err(RpcError::NotFound(format!("interface {}", config.name)));
                };
                *existing = config;
                Ok(())
            })
            .await
    }

    async fn interface_config_delete(self: Arc<Self>, request: NameRequest) -> Result<(), RpcError> {
        self.store
            .update_staged(|tree| {
                let before = tree.interfaces.len();
                tree.interfaces.retain(|i| i.name != request.name);
                if tree.interfaces.len() == before {
                    return Err(RpcError::NotFound(format!("interface {}", request.name)));
                }
                Ok(())
            })
            .await
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    async fn address_list(self: Arc<Self>, _: ()) -> Result<Vec<AddressStatusReport>, RpcError> {
        Ok(self.addresses.list().await)
    }

    async fn address_config_list(self: Arc<Self>, _: ()) -> Result<Vec<AddressConfig>, RpcError> {
        Ok(self.store.get_staged().await.addresses)
    }

    async fn address_config_add(self: Arc<Self>, config: AddressConfig) -> Result<(), RpcError> {
        config.validate()?;
        self.store
            .update_staged(|tree| {
                if tree.addresses.iter().any(|a| a.key() == config.key()) {
                    return Err(RpcError::AlreadyExists(format!(
                        "address {} on {}",
                        config.ip, config.interface
                    )));
                }
                tree.addresses.push(config);
                Ok(())
            })
            .await
    }

    async fn address_config_update(self: Arc<Self>, config: AddressConfig) -> Result<(), RpcError> {
        config.validate()?;
        self.store
            .update_staged(|tree| {
                let Some(existing) = tree.addresses.iter_mut().find(|a| a.key() == config.key()) else {
                    return Err(RpcError::NotFound(format!(
                        "address {} on {}",
                        config.ip, config.interface
                    )));
                };
                *existing = config;
                Ok(())
            })
            .await
    }

    async fn address_config_delete(self: Arc<Self>, request: AddressKeyRequest) -> Result<(), RpcError> {
        self.store
            .update_staged(|tree| {
                let before = tree.addresses.len();
                tree.addresses
                    .retain(|a| !(a.interface == request.interface && a.ip == request.ip));
                if tree.addresses.len() == before {
                    return Err(RpcError::NotFound(format!(
                        "address {} on {}",
                        request.ip, request.interface
                    )));
                }
                Ok(())
            })
            .await
    }

    // =========================================================================
    // Routes
    // =========================================================================

    async fn route_list(self: Arc<Self>, _: ()) -> Result<Vec<RouteStatusReport>, RpcError> {
        Ok(self.routes.list().await)
    }

    async fn route_table_list(self: Arc<Self>, _: ()) -> Result<Vec<RouteTableSummary>, RpcError> {
        Ok(self.routes.tables().await)
    }

    async fn route_config(self: Arc<Self>, _: ()) -> Result<RouteConfig, RpcError> {
        Ok(self.store.get_staged().await.route)
    }

    async fn route_table_add(self: Arc<Self>, table: RouteTableConfig) -> Result<(), RpcError> {
        table.validate()?;
        self.store
            .update_staged(|tree| {
                if tree.route_table(table.id).is_some() {
                    return Err(RpcError::AlreadyExists(format!("route table {}", table.id)));
                }
                tree.route.tables.push(table);
                Ok(())
            })
            .await
    }

    async fn route_table_update(self: Arc<Self>, table: RouteTableConfig) -> Result<(), RpcError> {
        table.validate()?;
        self.store
            .update_staged(|tree| {
                let id = table.id;
                *table_of(tree, id)? = table;
                Ok(())
            })
            .await
    }

    async fn route_table_delete(self: Arc<Self>, request: TableRequest) -> Result<(), RpcError> {
        if DEFAULT_TABLES.iter().any(|(id, _)| *id == request.id) {
            return Err(RpcError::InvalidArgument(format!(
                "route table {} cannot be deleted",
                request.id
            )));
        }
        self.store
            .update_staged(|tree| {
                table_of(tree, request.id)?;
                tree.route.tables.retain(|t| t.id != request.id);
                Ok(())
            })
            .await
    }

    async fn route_get(self: Arc<Self>, selector: RouteSelector) -> Result<RouteEntryConfig, RpcError> {
        let tree = self.store.get_staged().await;
        let table = tree
            .route_table(selector.table)
            .ok_or_else(|| RpcError::NotFound(format!("route table {}", selector.table)))?;
        let position = route_position(table, &selector.route.destination)?;
        Ok(table.routes[position].clone())
    }

    async fn route_add(self: Arc<Self>, selector: RouteSelector) -> Result<(), RpcError> {
        selector.route.validate()?;
        self.store
            .update_staged(|tree| {
                let table = table_of(tree, selector.table)?;
                if table.route(&selector.route.destination).is_some() {
                    return Err(RpcError::AlreadyExists(format!(
                        "route {} in table {}",
                        selector.route.destination, selector.table
                    )));
                }
                table.routes.push(selector.route);
                Ok(())
            })
            .await
    }

    async fn route_update(self: Arc<Self>, selector: RouteSelector) -> Result<(), RpcError> {
        selector.route.validate()?;
        self.store
            .update_staged(|tree| {
                let table = table_of(tree, selector.table)?;
                let position = route_position(table, &selector.route.destination)?;
                table.routes[position] = selector.route;
                Ok(())
            })
            .await
    }

    async fn route_delete(self: Arc<Self>, selector: RouteSelector) -> Result<(), RpcError> {
        self.store
            .update_staged(|tree| {
                let table = table_of(tree, selector.table)?;
                let position = route_position(table, &selector.route.destination)?;
                table.routes.remove(position);
                Ok(())
            })
            .await
    }

    // =========================================================================
    // DHCP
    // =========================================================================

    async fn dhcp_event(self: Arc<Self>, event: DhcpEvent) -> Result<(), RpcError> {
        debug!(?event, "DHCPv4 client event");
        self.hub
            .publish(event.into())
            .map_err(|e| RpcError::Internal(e.to_string()))
    }
}

fn bind<Req, Resp, F, Fut>(rpc: &Rpc, methods: &Arc<Methods>, method: &str, handler: F)
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Arc<Methods>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
{
    let methods = Arc::clone(methods);
    rpc.register(method, move |request: Req| handler(Arc::clone(&methods), request));
}

/// Provider exposing the method table.
pub struct RpcProvider {
    rpc: Arc<Rpc>,
}

impl RpcProvider {
    pub fn from_injector(injector: &Injector<'_>) -> anyhow::Result<Self> {
        let config: Arc<ConfigProvider> = injector.get("config")?;
        let methods = Arc::new(Methods {
            store: config.store(),
            interfaces: injector.get("interfaces")?,
            addresses: injector.get("addresses")?,
            routes: injector.get("routes")?,
            hub: injector.hub(),
        });

        let rpc = Rpc::new();
        bind(&rpc, &methods, "config/running/get", Methods::running);
        bind(&rpc, &methods, "config/staged/get", Methods::staged);
        bind(&rpc, &methods, "config/staged/drop", Methods::drop_staged);
        bind(&rpc, &methods, "config/staged/commit", Methods::commit);

        bind(&rpc, &methods, "interface/list", Methods::interface_list);
        bind(&rpc, &methods, "interface/config/list", Methods::interface_config_list);
        bind(&rpc, &methods, "interface/config/add", Methods::interface_config_add);
        bind(&rpc, &methods, "interface/config/update", Methods::interface_config_update);
        bind(&rpc, &methods, "interface/config/delete", Methods::interface_config_delete);

        bind(&rpc, &methods, "address/list", Methods::address_list);
        bind(&rpc, &methods, "address/config/list", Methods::address_config_list);
        bind(&rpc, &methods, "address/config/add", Methods::address_config_add);
        bind(&rpc, &methods, "address/config/update", Methods::address_config_update);
        bind(&rpc, &methods, "address/config/delete", Methods::address_config_delete);

        bind(&rpc, &methods, "route/list", Methods::route_list);
        bind(&rpc, &methods, "route/table/list", Methods::route_table_list);
        bind(&rpc, &methods, "route/config/get", Methods::route_config);
        bind(&rpc, &methods, "route/config/table/add", Methods::route_table_add);
        bind(&rpc, &methods, "route/config/table/update", Methods::route_table_update);
        bind(&rpc, &methods, "route/config/table/delete", Methods::route_table_delete);
        bind(&rpc, &methods, "route/config/route/get", Methods::route_get);
        bind(&rpc, &methods, "route/config/route/add", Methods::route_add);
        bind(&rpc, &methods, "route/config/route/update", Methods::route_update);
        bind(&rpc, &methods, "route/config/route/delete", Methods::route_delete);

        bind(&rpc, &methods, "dhcp/v4/event", Methods::dhcp_event);

        Ok(Self { rpc: Arc::new(rpc) })
    }

    pub fn rpc(&self) -> Arc<Rpc> {
        Arc::clone(&self.rpc)
    }
}

#[async_trait]
impl Provider for RpcProvider {
    async fn start(&self) -> anyhow::Result<()> {
        info!(methods = self.rpc.methods().len(), "RPC methods registered");
        Ok(())
    }
}
