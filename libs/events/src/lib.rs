//! # routekeeper-events
//!
//! Event definitions for the routekeeper routing agent.
//!
//! ## Design Principles
//!
//! - Events are immutable values describing something that already happened
//! - Events carry no identity beyond their kind and fields
//! - Kernel events are already resolved to interface names where the kernel
//!   referenced an interface by index
//!
//! ## Event Kinds
//!
//! - Kernel objects (`interface.*`, `address.*`, `route.*`, `neighbour.*`)
//! - DHCPv4 client lease changes (`dhcp4.*`)
//! - Configuration commits (`config.committed`)

mod error;
mod event;
mod types;

pub use error::EventError;
pub use event::*;
pub use types::*;
