//! Route Configurator
//!
//! Installs the two routes a session needs and backs them out again:
//!
//! 1. **Bypass route**: the anonymity entry server pinned to the
//!    original gateway, so the client's own traffic never enters the
//!    tunnel it feeds.
//! 2. **Default route**: everything else through the tunnel interface.
//!
//! The bypass route is always installed and confirmed before the default
//! route is replaced. If the default-route replacement fails, the bypass
//! route is deleted again so the route table is never left half
//! configured.
//!
//! Route-table access goes through the [`RouteOps`] trait; production
//! uses [`IpRoute`], which drives `ip(8)`.

use crate::config::HelperConfig;
use crate::netstate::{self, NetworkSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::process::Command;
use tracing::{debug, info, warn};

/// Contents written to the resolver file while the session is up: name
/// resolution is served by the anonymity client on localhost.
pub const LOCAL_RESOLVER: &str = "nameserver 127.0.0.1";

/// The route used to reach the outside world before the session started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRoute {
    /// Gateway address.
    pub gateway: IpAddr,
    /// Egress device name.
    pub dev: String,
}

impl fmt::Display for DefaultRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "via {} dev {}", self.gateway, self.dev)
    }
}

/// Route destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDst {
    /// 0.0.0.0/0
    Default,
    /// A single host.
    Host(IpAddr),
}

impl fmt::Display for RouteDst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDst::Default => write!(f, "default"),
            RouteDst::Host(ip) if ip.is_ipv4() => write!(f, "{ip}/32"),
            RouteDst::Host(ip) => write!(f, "{ip}/128"),
        }
    }
}

/// A single route-table entry as the helper manipulates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dst: RouteDst,
    pub via: Option<IpAddr>,
    pub dev: Option<String>,
}

impl Route {
    /// Host route for the entry server through the original uplink.
    pub fn bypass(entry_server: IpAddr, original: &DefaultRoute) -> Self {
        Self {
            dst: RouteDst::Host(entry_server),
            via: Some(original.gateway),
            dev: Some(original.dev.clone()),
        }
    }

    /// Default route through the tunnel interface.
    pub fn default_via_dev(dev: &str) -> Self {
        Self {
            dst: RouteDst::Default,
            via: None,
            dev: Some(dev.to_string()),
        }
    }

    /// The original default route, for reinstallation at teardown.
    pub fn original_default(original: &DefaultRoute) -> Self {
        Self {
            dst: RouteDst::Default,
            via: Some(original.gateway),
            dev: Some(original.dev.clone()),
        }
    }

    /// Host route identified by destination only, for deletion.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            dst: RouteDst::Host(addr),
            via: None,
            dev: None,
        }
    }

    fn ip_args(&self, verb: &str) -> Vec<String> {
        let mut args = vec!["route".to_string(), verb.to_string(), self.dst.to_string()];
        if let Some(via) = self.via {
            args.push("via".to_string());
            args.push(via.to_string());
        }
        if let Some(dev) = &self.dev {
            args.push("dev".to_string());
            args.push(dev.clone());
        }
        args
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dst)?;
        if let Some(via) = self.via {
            write!(f, " via {via}")?;
        }
        if let Some(dev) = &self.dev {
            write!(f, " dev {dev}")?;
        }
        Ok(())
    }
}

/// The kernel route-table and link mutations the helper needs.
pub trait RouteOps: Send + Sync {
    /// The route the kernel would use to reach `dst` right now.
    fn route_get(&self, dst: IpAddr) -> Result<DefaultRoute, NetworkConfigError>;
    /// Bring a link up; fails when the device does not exist.
    fn link_up(&self, name: &str) -> Result<(), NetworkConfigError>;
    /// Install or replace a route.
    fn route_replace(&self, route: &Route) -> Result<(), NetworkConfigError>;
    /// Delete a route.
    fn route_del(&self, route: &Route) -> Result<(), NetworkConfigError>;
}

/// Production [`RouteOps`] driving `ip(8)`.
pub struct IpRoute;

impl IpRoute {
    fn run(args: &[String]) -> Result<String, String> {
        let output = Command::new("ip")
            .args(args)
            .output()
            .map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

impl RouteOps for IpRoute {
    fn route_get(&self, dst: IpAddr) -> Result<DefaultRoute, NetworkConfigError> {
        let args = vec!["route".to_string(), "get".to_string(), dst.to_string()];
        let output = Self::run(&args).map_err(|_| NetworkConfigError::NoDefaultRoute(dst))?;
        parse_route_get(&output).ok_or(NetworkConfigError::NoDefaultRoute(dst))
    }

    fn link_up(&self, name: &str) -> Result<(), NetworkConfigError> {
        let args: Vec<String> = ["link", "set", name, "up"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self::run(&args).map(|_| ()).map_err(|detail| NetworkConfigError::Interface {
            name: name.to_string(),
            detail,
        })
    }

    fn route_replace(&self, route: &Route) -> Result<(), NetworkConfigError> {
        Self::run(&route.ip_args("replace"))
            .map(|_| ())
            .map_err(|detail| NetworkConfigError::Route {
                route: route.to_string(),
                detail,
            })
    }

    fn route_del(&self, route: &Route) -> Result<(), NetworkConfigError> {
        Self::run(&route.ip_args("del"))
            .map(|_| ())
            .map_err(|detail| NetworkConfigError::Route {
                route: route.to_string(),
                detail,
            })
    }
}

/// Extract gateway and device from `ip route get` output.
///
/// Typical first line: `8.8.8.8 via 192.168.1.1 dev wlan0 src ... uid 0`.
/// Both `via` and `dev` are required; a gatewayless uplink cannot carry
/// the bypass route.
pub fn parse_route_get(output: &str) -> Option<DefaultRoute> {
    let line = output.lines().next()?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let value_after = |key: &str| {
        tokens
            .iter()
            .position(|t| *t == key)
            .and_then(|i| tokens.get(i + 1))
            .copied()
    };
    let gateway: IpAddr = value_after("via")?.parse().ok()?;
    let dev = value_after("dev")?.to_string();
    Some(DefaultRoute { gateway, dev })
}

/// Installs and removes the session's route set.
pub struct RouteConfigurator<'a> {
    config: &'a HelperConfig,
    ops: &'a dyn RouteOps,
}

impl<'a> RouteConfigurator<'a> {
    pub fn new(config: &'a HelperConfig, ops: &'a dyn RouteOps) -> Self {
        Self { config, ops }
    }

    /// Point all traffic at the tunnel interface.
    ///
    /// Waits for the freshly created interface to settle, brings it up,
    /// installs the bypass route, replaces the default route, and
    /// rewrites the resolver file to the local resolver. The bypass route
    /// is removed again if the default-route replacement fails.
    pub async fn install(&self, snapshot: &NetworkSnapshot) -> Result<(), NetworkConfigError> {
        tokio::time::sleep(self.config.settle_delay()).await;
        self.ops.link_up(&self.config.tun_device)?;

        let bypass = Route::bypass(self.config.entry_server, &snapshot.default_route);
        self.ops.route_replace(&bypass)?;
        debug!(route = %bypass, "bypass route installed");

        let tunnel_default = Route::default_via_dev(&self.config.tun_device);
        if let Err(e) = self.ops.route_replace(&tunnel_default) {
            // never leave the bypass route behind on a half-finished install
            if let Err(del) = self.ops.route_del(&bypass) {
                warn!(route = %bypass, error = %del, "failed to remove bypass route during rollback");
            }
            return Err(e);
        }
        debug!(route = %tunnel_default, "default route points at tunnel");

        std::fs::write(&self.config.resolv_conf, LOCAL_RESOLVER)
            .map_err(NetworkConfigError::Resolver)?;
        info!(dev = %self.config.tun_device, "routes installed, resolver points at local resolver");
        Ok(())
    }

    /// Back out whatever the session changed; idempotent.
    pub fn teardown(&self) {
        netstate::restore_network(self.config, self.ops);
    }
}

/// Route, interface and resolver mutation errors.
#[derive(Debug, thiserror::Error)]
pub enum NetworkConfigError {
    #[error("no usable route to {0}; cannot determine original gateway")]
    NoDefaultRoute(IpAddr),

    #[error("tunnel interface {name} unavailable: {detail}")]
    Interface { name: String, detail: String },

    #[error("route change ({route}) failed: {detail}")]
    Route { route: String, detail: String },

    #[error("resolver update failed: {0}")]
    Resolver(#[source] std::io::Error),

    #[error("failed to persist network snapshot: {0}")]
    Backup(#[source] std::io::Error),
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory route table standing in for the kernel.
    pub(crate) struct FakeRoutes {
        /// Answer for `route_get`; `None` means no route to the probe.
        pub uplink: Option<DefaultRoute>,
        pub fail_default_replace: bool,
        pub fail_link_up: bool,
        pub table: Mutex<Vec<Route>>,
        pub ops_log: Mutex<Vec<String>>,
    }

    impl FakeRoutes {
        pub fn with_uplink(gateway: &str, dev: &str) -> Self {
            Self {
                uplink: Some(DefaultRoute {
                    gateway: gateway.parse().unwrap(),
                    dev: dev.to_string(),
                }),
                fail_default_replace: false,
                fail_link_up: false,
                table: Mutex::new(Vec::new()),
                ops_log: Mutex::new(Vec::new()),
            }
        }

        pub fn without_uplink() -> Self {
            Self {
                uplink: None,
                ..Self::with_uplink("0.0.0.0", "none")
            }
        }

        pub fn routes(&self) -> Vec<Route> {
            self.table.lock().unwrap().clone()
        }

        pub fn log(&self) -> Vec<String> {
            self.ops_log.lock().unwrap().clone()
        }

        fn record(&self, entry: String) {
            self.ops_log.lock().unwrap().push(entry);
        }
    }

    impl RouteOps for FakeRoutes {
        fn route_get(&self, dst: IpAddr) -> Result<DefaultRoute, NetworkConfigError> {
            self.record(format!("get {dst}"));
            self.uplink
                .clone()
                .ok_or(NetworkConfigError::NoDefaultRoute(dst))
        }

        fn link_up(&self, name: &str) -> Result<(), NetworkConfigError> {
            self.record(format!("link_up {name}"));
            if self.fail_link_up {
                return Err(NetworkConfigError::Interface {
                    name: name.to_string(),
                    detail: "Cannot find device".to_string(),
                });
            }
            Ok(())
        }

        fn route_replace(&self, route: &Route) -> Result<(), NetworkConfigError> {
            self.record(format!("replace {route}"));
            if self.fail_default_replace && route.dst == RouteDst::Default {
                return Err(NetworkConfigError::Route {
                    route: route.to_string(),
                    detail: "Operation not permitted".to_string(),
                });
            }
            let mut table = self.table.lock().unwrap();
            table.retain(|r| r.dst != route.dst);
            table.push(route.clone());
            Ok(())
        }

        fn route_del(&self, route: &Route) -> Result<(), NetworkConfigError> {
            self.record(format!("del {route}"));
            self.table.lock().unwrap().retain(|r| r.dst != route.dst);
            Ok(())
        }
    }
}
