//! Network State Manager
//!
//! Captures the two pieces of mutable host network state before the
//! session touches anything (the default route and the resolver file)
//! and restores them at teardown.
//!
//! The capture is persisted to well-known paths (a verbatim resolver
//! copy, a JSON route record) so a restore works even after the helper
//! process itself was restarted. Restore is best-effort: every step is
//! attempted regardless of earlier failures, and calling it when nothing
//! was ever captured is a no-op.

use crate::config::HelperConfig;
use crate::routes::{DefaultRoute, NetworkConfigError, Route, RouteOps};
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info, warn};

/// Well-known external address used to ask the kernel which route
/// currently carries outbound traffic.
const ROUTE_PROBE_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

/// Host network state captured once per session, before any mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSnapshot {
    /// The route outbound traffic used before the session.
    pub default_route: DefaultRoute,
    /// Verbatim resolver file contents; absent when the host had none.
    pub resolv_conf: Option<Vec<u8>>,
}

impl NetworkSnapshot {
    /// Capture the current network state and persist it.
    ///
    /// The resolver file may legitimately be missing; a missing default
    /// route is fatal, since without the original gateway the bypass
    /// route cannot be built.
    pub fn capture(
        config: &HelperConfig,
        ops: &dyn RouteOps,
    ) -> Result<Self, NetworkConfigError> {
        let resolv_conf = std::fs::read(&config.resolv_conf).ok();
        let default_route = ops.route_get(ROUTE_PROBE_ADDR)?;
        info!(route = %default_route, "captured original default route");

        if let Some(bytes) = &resolv_conf {
            std::fs::write(&config.resolv_backup, bytes).map_err(NetworkConfigError::Backup)?;
        }
        let record = serde_json::to_vec(&default_route)
            .map_err(|e| NetworkConfigError::Backup(std::io::Error::other(e)))?;
        std::fs::write(&config.route_backup, record).map_err(NetworkConfigError::Backup)?;

        Ok(Self {
            default_route,
            resolv_conf,
        })
    }
}

/// Put the host network back the way [`NetworkSnapshot::capture`] found it.
///
/// Works entirely from the on-disk backups, so it can run in a helper
/// process other than the one that captured them. Each step is attempted
/// independently; failures are logged and swallowed. The backups are
/// consumed, so a second call finds nothing to do.
pub fn restore_network(config: &HelperConfig, ops: &dyn RouteOps) {
    if let Ok(saved) = std::fs::read(&config.resolv_backup) {
        match std::fs::write(&config.resolv_conf, &saved) {
            Ok(()) => debug!("resolver configuration restored"),
            Err(e) => warn!(error = %e, "failed to restore resolver configuration"),
        }
        if let Err(e) = std::fs::remove_file(&config.resolv_backup) {
            warn!(error = %e, "failed to remove resolver backup");
        }
    }

    if let Ok(record) = std::fs::read(&config.route_backup) {
        match serde_json::from_slice::<DefaultRoute>(&record) {
            Ok(original) => {
                if let Err(e) = ops.route_replace(&Route::original_default(&original)) {
                    warn!(error = %e, "failed to reinstall original default route");
                } else {
                    debug!(route = %original, "original default route reinstalled");
                }
                // the bypass route only ever exists alongside the record
                if let Err(e) = ops.route_del(&Route::host(config.entry_server)) {
                    debug!(error = %e, "bypass route not removed (may not exist)");
                }
            }
            Err(e) => warn!(error = %e, "unreadable route record; skipping route restore"),
        }
        if let Err(e) = std::fs::remove_file(&config.route_backup) {
            warn!(error = %e, "failed to remove route record");
        }
        info!("network state restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::FakeRoutes;
    use crate::routes::RouteDst;

    fn test_config(dir: &tempfile::TempDir) -> HelperConfig {
        HelperConfig {
            resolv_conf: dir.path().join("resolv.conf"),
            resolv_backup: dir.path().join("resolv.backup"),
            route_backup: dir.path().join("route.json"),
            ..Default::default()
        }
    }

    #[test]
    fn capture_records_route_and_resolver() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.resolv_conf, "nameserver 10.0.0.53\n").unwrap();
        let fake = FakeRoutes::with_uplink("10.0.0.1", "eth0");

        let snapshot = NetworkSnapshot::capture(&config, &fake).unwrap();

        assert_eq!(snapshot.default_route.dev, "eth0");
        assert_eq!(snapshot.resolv_conf.as_deref(), Some(b"nameserver 10.0.0.53\n".as_ref()));
        // both backups persisted
        assert_eq!(
            std::fs::read(&config.resolv_backup).unwrap(),
            b"nameserver 10.0.0.53\n"
        );
        let record: DefaultRoute =
            serde_json::from_slice(&std::fs::read(&config.route_backup).unwrap()).unwrap();
        assert_eq!(record, snapshot.default_route);
    }

    #[test]
    fn capture_tolerates_missing_resolver() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let fake = FakeRoutes::with_uplink("10.0.0.1", "eth0");

        let snapshot = NetworkSnapshot::capture(&config, &fake).unwrap();

        assert!(snapshot.resolv_conf.is_none());
        assert!(!config.resolv_backup.exists());
        assert!(config.route_backup.exists());
    }

    #[test]
    fn capture_fails_without_default_route() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let fake = FakeRoutes::without_uplink();

        let result = NetworkSnapshot::capture(&config, &fake);

        assert!(matches!(result, Err(NetworkConfigError::NoDefaultRoute(_))));
        assert!(!config.route_backup.exists());
    }

    #[test]
    fn restore_undoes_a_captured_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.resolv_conf, "nameserver 10.0.0.53\n").unwrap();
        let fake = FakeRoutes::with_uplink("10.0.0.1", "eth0");

        NetworkSnapshot::capture(&config, &fake).unwrap();
        // simulate an established session
        std::fs::write(&config.resolv_conf, "nameserver 127.0.0.1").unwrap();
        fake.route_replace(&Route::host(config.entry_server)).unwrap();
        fake.route_replace(&Route::default_via_dev("mytun")).unwrap();

        restore_network(&config, &fake);

        assert_eq!(
            std::fs::read(&config.resolv_conf).unwrap(),
            b"nameserver 10.0.0.53\n"
        );
        assert!(!config.resolv_backup.exists());
        assert!(!config.route_backup.exists());
        let routes = fake.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst, RouteDst::Default);
        assert_eq!(routes[0].via, Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn restore_with_nothing_captured_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let fake = FakeRoutes::with_uplink("10.0.0.1", "eth0");

        restore_network(&config, &fake);

        assert!(fake.log().is_empty());
        assert!(!config.resolv_conf.exists());
    }

    #[test]
    fn restore_twice_matches_restore_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.resolv_conf, "nameserver 10.0.0.53\n").unwrap();
        let fake = FakeRoutes::with_uplink("10.0.0.1", "eth0");
        NetworkSnapshot::capture(&config, &fake).unwrap();

        restore_network(&config, &fake);
        let after_first = (fake.routes(), fake.log().len());
        restore_network(&config, &fake);

        assert_eq!((fake.routes(), fake.log().len()), after_first);
        assert_eq!(
            std::fs::read(&config.resolv_conf).unwrap(),
            b"nameserver 10.0.0.53\n"
        );
    }

    #[test]
    fn restore_attempts_route_steps_despite_resolver_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        std::fs::write(&config.resolv_conf, "nameserver 10.0.0.53\n").unwrap();
        let fake = FakeRoutes::with_uplink("10.0.0.1", "eth0");
        NetworkSnapshot::capture(&config, &fake).unwrap();

        // resolver write will fail: parent directory does not exist
        config.resolv_conf = dir.path().join("missing").join("resolv.conf");
        restore_network(&config, &fake);

        // route restore still ran
        assert_eq!(fake.routes().len(), 1);
        assert_eq!(fake.routes()[0].dst, RouteDst::Default);
        assert!(!config.route_backup.exists());
    }
}
