//! routekeeper agent library.
//!
//! The agent keeps a Linux router's interfaces, addresses and routes in line
//! with a versioned configuration and with DHCPv4 leases, while tracking what
//! the kernel reports.
//!
//! ## Architecture
//!
//! ```text
//! KernelEventSource ──► EventBus ──► Runtime dispatch ──► EventHub subscribers
//!                                                          │
//!   ConfigStore.commit ──► change handlers ──► InterfaceManager / AddressManager / RouteManager
//!                                                          │
//!                                                     Kernel commands
//! ```
//!
//! ## Modules
//!
//! - `bus`: queue between event producers and the dispatch loop
//! - `runtime`: provider registry, lifecycle and event hub
//! - `netlink`: kernel event decoding and the interface index
//! - `iproute`: kernel binding backed by the `ip` binary
//! - `kernel`: kernel command trait and a recording fake
//! - `store`: running/staged configuration with commit and rollback
//! - `entities`: entity managers converging kernel state
//! - `rpc`: method table for external clients

pub mod bus;
pub mod config;
pub mod entities;
pub mod iproute;
pub mod kernel;
pub mod netlink;
pub mod rpc;
pub mod runtime;
pub mod store;
