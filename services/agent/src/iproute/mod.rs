//! iproute2 kernel binding.
//!
//! Commands run `ip` once per operation, serialized through a single lock.
//! Dumps run `ip -json ... show`; the monitor runs `ip -json monitor` as a
//! child process whose standard output is decoded as a stream of JSON
//! objects on the monitor thread.

mod args;
mod parse;

use std::io::BufReader;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use routekeeper_networking::Family;

use crate::kernel::{AddressSpec, Kernel, KernelError, LinkParams, LinkSpec, RouteSpec};
use crate::netlink::{
    BindingError, DumpKind, KernelMessage, Monitor, NetlinkBinding, SharedIndex,
};

/// Kernel commands and netlink binding backed by the `ip` binary.
pub struct IpRouteBinding {
    binary: String,
    index: SharedIndex,
    commands: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for IpRouteBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpRouteBinding")
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

impl IpRouteBinding {
    pub fn new(binary: impl Into<String>, index: SharedIndex) -> Self {
        Self {
            binary: binary.into(),
            index,
            commands: tokio::sync::Mutex::new(()),
        }
    }

    fn name_of(&self, ifindex: u32) -> Option<String> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name(ifindex)
            .map(str::to_string)
    }

    async fn run(&self, operation: &'static str, args: Vec<String>) -> Result<(), KernelError> {
        let _guard = self.commands.lock().await;
        debug!(operation, command = %args.join(" "), "Issuing kernel command");

        let output = tokio::process::Command::new(&self.binary)
            .args(&args)
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }
        Err(classify_failure(
            operation,
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    fn show(&self, args: &[&str]) -> Result<Vec<u8>, BindingError> {
        let output = Command::new(&self.binary).args(args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BindingError::Decode(format!(
                "ip {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Map `ip` error output to the kernel error classes convergence cares
/// about.
fn classify_failure(operation: &'static str, stderr: &str) -> KernelError {
    let message = stderr.trim();
    if message.contains("File exists") {
        KernelError::Exists
    } else if message.contains("Cannot find device") || message.contains("No such device") {
        KernelError::NoDevice
    } else if message.contains("Network is unreachable")
        || message.contains("Nexthop has invalid gateway")
    {
        KernelError::Unreachable
    } else {
        KernelError::Command {
            operation,
            message: message.to_string(),
        }
    }
}

/// Interface index by name: the shared index first, then sysfs.
fn lookup_index(index: &SharedIndex, name: &str) -> Option<u32> {
    if let Some(ifindex) = index
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .index(name)
    {
        return Some(ifindex);
    }
    std::fs::read_to_string(format!("/sys/class/net/{name}/ifindex"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[async_trait]
impl Kernel for IpRouteBinding {
    async fn link_add(&self, link: &LinkSpec) -> Result<(), KernelError> {
        let args = args::link_add(link, &|i: u32| self.name_of(i))?;
        self.run("link_add", args).await
    }

    async fn link_set(&self, ifindex: u32, params: &LinkParams) -> Result<(), KernelError> {
        let commands = args::link_set(ifindex, params, &|i: u32| self.name_of(i))?;
        for args in commands {
            self.run("link_set", args).await?;
        }
        Ok(())
    }

    async fn link_delete(&self, ifindex: u32) -> Result<(), KernelError> {
        let args = args::link_delete(ifindex, &|i: u32| self.name_of(i))?;
        self.run("link_delete", args).await
    }

    async fn address_add(&self, address: &AddressSpec) -> Result<(), KernelError> {
        let args = args::address_add(address, &|i: u32| self.name_of(i))?;
        self.run("address_add", args).await
    }

    async fn address_remove(&self, address: &AddressSpec) -> Result<(), KernelError> {
        let args = args::address_remove(address, &|i: u32| self.name_of(i))?;
        self.run("address_remove", args).await
    }

    async fn address_flush(&self, ifindex: u32, protocol: u8) -> Result<(), KernelError> {
        let args = args::address_flush(ifindex, protocol, &|i: u32| self.name_of(i))?;
        self.run("address_flush", args).await
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<(), KernelError> {
        let args = args::route_replace(route, &|i: u32| self.name_of(i))?;
        self.run("route_replace", args).await
    }

    async fn route_delete(&self, route: &RouteSpec) -> Result<(), KernelError> {
        self.run("route_delete", args::route_delete(route)).await
    }
}

impl NetlinkBinding for IpRouteBinding {
    fn dump(&self, kind: DumpKind) -> Result<Vec<KernelMessage>, BindingError> {
        let lookup = |name: &str| lookup_index(&self.index, name);
        match kind {
            DumpKind::Links => {
                parse::links(&self.show(&["-details", "-json", "link", "show"])?, &lookup)
            }
            DumpKind::Addresses => parse::addresses(&self.show(&["-json", "address", "show"])?),
            DumpKind::Neighbours => {
                parse::neighbours(&self.show(&["-json", "neigh", "show"])?, &lookup)
            }
            DumpKind::Routes => {
                let mut messages = parse::routes(
                    &self.show(&["-4", "-json", "route", "show", "table", "all"])?,
                    Family::Inet,
                    &lookup,
                )?;
                messages.extend(parse::routes(
                    &self.show(&["-6", "-json", "route", "show", "table", "all"])?,
                    Family::Inet6,
                    &lookup,
                )?);
                Ok(messages)
            }
        }
    }

    fn monitor(&self) -> Result<Monitor, BindingError> {
        let mut child = Command::new(&self.binary)
            .args(["-json", "monitor", "link", "address", "route", "neigh"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or(BindingError::MonitorUnavailable)?;
        let child: Arc<Mutex<Child>> = Arc::new(Mutex::new(child));

        let index = Arc::clone(&self.index);
        let mut failed = false;
        let messages = serde_json::Deserializer::from_reader(BufReader::new(stdout))
            .into_iter::<Value>()
            .map_while(move |item| {
                if failed {
                    return None;
                }
                Some(match item {
                    Ok(value) => {
                        parse::monitor_object(value, &|name: &str| lookup_index(&index, name))
                    }
                    Err(e) => {
                        // The stream cannot resynchronise after a syntax error.
                        failed = true;
                        vec![Err(BindingError::Decode(e.to_string()))]
                    }
                })
            })
            .flatten();

        let closer = move || {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = child.kill() {
                warn!(error = %e, "Failed to stop ip monitor");
            }
            let _ = child.wait();
        };

        Ok(Monitor::new(Box::new(messages), Box::new(closer)))
    }
}
