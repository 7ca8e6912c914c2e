//! QUIC connection-migration state machine.
//!
//! The controller is pure decision logic: session drivers feed it
//! triggers (network changes, path degradation, write errors, probe
//! outcomes, timers) and execute the actions it returns (path probes,
//! migrations, drains, closes). Keeping the policy synchronous makes
//! every transition unit-testable without sockets.

use crate::base::neterror::NetError;
use crate::base::network::NetworkBinding;
use std::net::SocketAddr;
use std::time::Duration;

/// Migration policy knobs.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Follow the OS default network when it changes.
    pub default_network_migration: bool,
    /// Proactively leave a degrading path.
    pub path_degradation_migration: bool,
    /// Sessions may run on a non-default network (with quotas).
    pub allow_non_default_network_usage: bool,
    /// Honor the server's PREFERRED_ADDRESS.
    pub allow_server_migration: bool,
    /// Idle sessions follow a default-network change.
    pub migrate_idle_connections: bool,
    /// An idle session only migrates if it was active this recently.
    pub idle_migration_period: Duration,
    /// Timer for returning from the non-default network.
    pub max_time_on_non_default_network: Duration,
    /// Per-network cap on degradation-triggered migrations.
    pub max_path_degrading_non_default_migrations: u32,
    /// Per-network cap on write-error-triggered migrations.
    pub max_write_error_non_default_migrations: u32,
    /// Retry pre-handshake failures once on the alternate network.
    pub retry_pre_handshake_errors_on_non_default_network: bool,
    /// Kill sessions outright on an IP change.
    pub close_sessions_on_ip_change: bool,
    /// Drain sessions on an IP change instead of migrating.
    pub goaway_sessions_on_ip_change: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            default_network_migration: false,
            path_degradation_migration: false,
            allow_non_default_network_usage: false,
            allow_server_migration: false,
            migrate_idle_connections: false,
            idle_migration_period: Duration::from_secs(30),
            max_time_on_non_default_network: Duration::from_secs(128),
            max_path_degrading_non_default_migrations: 5,
            max_write_error_non_default_migrations: 5,
            retry_pre_handshake_errors_on_non_default_network: false,
            close_sessions_on_ip_change: false,
            goaway_sessions_on_ip_change: false,
        }
    }
}

impl MigrationConfig {
    /// Build-time validation. Allowing non-default-network usage without
    /// path-degradation migration is a caller error: the quota knobs
    /// would gate a trigger that can never fire.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.allow_non_default_network_usage && !self.path_degradation_migration {
            return Err(NetError::InvalidArgument(
                "allow_non_default_network_usage requires path_degradation_migration".into(),
            ));
        }
        if self.close_sessions_on_ip_change && self.goaway_sessions_on_ip_change {
            return Err(NetError::InvalidArgument(
                "close_sessions_on_ip_change and goaway_sessions_on_ip_change are exclusive"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Per-session migration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    OnDefault,
    /// A path probe is in flight; writes queue until it resolves.
    Migrating,
    OnNonDefault,
    Draining,
    Closed,
}

/// What the session driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationAction {
    None,
    /// Close now; streams fail with NETWORK_CHANGED.
    CloseSession,
    /// Stop accepting streams; existing ones finish on the old path.
    StartDraining,
    /// Probe a new path on the given network with a fresh connection-id
    /// pair.
    ProbePath { network: NetworkBinding },
    /// Probe a new local port on the current network (single attempt).
    ProbePort,
    /// Probe validated: move the connection onto the network. When
    /// `arm_non_default_timer` is set, schedule the return-to-default
    /// timer for `max_time_on_non_default_network`.
    MigrateTo {
        network: NetworkBinding,
        arm_non_default_timer: bool,
    },
    /// Re-arm the non-default timer for one more period.
    ExtendNonDefaultTimer,
    /// Server-directed migration to its preferred address.
    MigrateToServerAddress(SocketAddr),
}

/// Why a path probe was started; decides which quota a successful
/// migration consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeReason {
    DefaultNetworkChange,
    PathDegradation,
    WriteError,
    ReturnToDefault,
}

/// Decision core for one QUIC session.
#[derive(Debug)]
pub struct MigrationController {
    config: MigrationConfig,
    state: MigrationState,
    /// Network the session currently runs on.
    current_network: NetworkBinding,
    /// Latest OS default.
    default_network: NetworkBinding,
    /// A usable non-default network, when one exists.
    alternate_network: Option<NetworkBinding>,
    /// Probe in flight toward this network.
    probe_target: Option<(NetworkBinding, ProbeReason)>,
    path_degrading_migrations: u32,
    write_error_migrations: u32,
    timer_extensions: u32,
}

impl MigrationController {
    pub fn new(config: MigrationConfig, network: NetworkBinding) -> Self {
        Self {
            config,
            state: MigrationState::OnDefault,
            current_network: network,
            default_network: network,
            alternate_network: None,
            probe_target: None,
            path_degrading_migrations: 0,
            write_error_migrations: 0,
            timer_extensions: 0,
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn current_network(&self) -> NetworkBinding {
        self.current_network
    }

    pub fn path_degrading_migrations(&self) -> u32 {
        self.path_degrading_migrations
    }

    pub fn write_error_migrations(&self) -> u32 {
        self.write_error_migrations
    }

    /// Writes queue while a probe is deciding the new path.
    pub fn writes_queued(&self) -> bool {
        self.state == MigrationState::Migrating
    }

    /// A non-default network appeared or vanished.
    pub fn set_alternate_network(&mut self, network: Option<NetworkBinding>) {
        self.alternate_network = network;
    }

    /// Pre-handshake errors may retry once on the alternate network.
    pub fn should_retry_pre_handshake_on_alternate(&self) -> Option<NetworkBinding> {
        if self.config.retry_pre_handshake_errors_on_non_default_network {
            self.alternate_network
        } else {
            None
        }
    }

    /// OS default network changed to `new_default`.
    pub fn on_default_network_changed(
        &mut self,
        new_default: NetworkBinding,
        session_is_idle: bool,
        idle_duration: Duration,
    ) -> MigrationAction {
        self.default_network = new_default;
        if self.terminal() {
            return MigrationAction::None;
        }
        if new_default == self.current_network {
            // Moved back under us (e.g. return from non-default).
            if self.state == MigrationState::OnNonDefault {
                self.enter_default();
            }
            return MigrationAction::None;
        }

        if self.config.close_sessions_on_ip_change {
            self.state = MigrationState::Closed;
            return MigrationAction::CloseSession;
        }
        if self.config.goaway_sessions_on_ip_change {
            self.state = MigrationState::Draining;
            return MigrationAction::StartDraining;
        }
        if !self.config.default_network_migration {
            return MigrationAction::None;
        }

        if session_is_idle {
            let within_window = self.config.migrate_idle_connections
                && idle_duration < self.config.idle_migration_period;
            if !within_window {
                // An idle session with nothing worth carrying over is
                // cheaper to re-establish than to migrate.
                self.state = MigrationState::Closed;
                return MigrationAction::CloseSession;
            }
        }

        self.state = MigrationState::Migrating;
        self.probe_target = Some((new_default, ProbeReason::DefaultNetworkChange));
        MigrationAction::ProbePath {
            network: new_default,
        }
    }

    /// Sustained loss / RTT blow-up detected on the current path.
    pub fn on_path_degrading(&mut self) -> MigrationAction {
        if self.state != MigrationState::OnDefault || !self.config.path_degradation_migration {
            return MigrationAction::None;
        }
        if self.config.allow_non_default_network_usage
            && self.path_degrading_migrations
                < self.config.max_path_degrading_non_default_migrations
        {
            if let Some(alternate) = self.alternate_network {
                self.state = MigrationState::Migrating;
                self.probe_target = Some((alternate, ProbeReason::PathDegradation));
                return MigrationAction::ProbePath { network: alternate };
            }
        }
        // No network to flee to: try a fresh port on the same one.
        MigrationAction::ProbePort
    }

    /// A socket write failed on the current path.
    pub fn on_write_error(&mut self) -> MigrationAction {
        if self.terminal() || self.state == MigrationState::Migrating {
            return MigrationAction::None;
        }
        if self.config.allow_non_default_network_usage
            && self.write_error_migrations < self.config.max_write_error_non_default_migrations
        {
            if let Some(alternate) = self.alternate_network.filter(|n| *n != self.current_network)
            {
                self.write_error_migrations += 1;
                self.state = MigrationState::Migrating;
                self.probe_target = Some((alternate, ProbeReason::WriteError));
                return MigrationAction::ProbePath { network: alternate };
            }
        }
        self.state = MigrationState::Closed;
        MigrationAction::CloseSession
    }

    /// Path probe resolved.
    pub fn on_probe_result(&mut self, network: NetworkBinding, success: bool) -> MigrationAction {
        let reason = match self.probe_target {
            Some((target, reason)) if target == network && self.state == MigrationState::Migrating => reason,
            _ => return MigrationAction::None,
        };
        self.probe_target = None;

        if !success {
            // The old path may still work; fall back to it.
            if self.current_network == self.default_network {
                self.state = MigrationState::OnDefault;
            } else {
                self.state = MigrationState::OnNonDefault;
            }
            return MigrationAction::None;
        }

        self.current_network = network;
        if network == self.default_network {
            self.enter_default();
            MigrationAction::MigrateTo {
                network,
                arm_non_default_timer: false,
            }
        } else {
            self.state = MigrationState::OnNonDefault;
            if reason == ProbeReason::PathDegradation {
                self.path_degrading_migrations += 1;
            }
            MigrationAction::MigrateTo {
                network,
                arm_non_default_timer: true,
            }
        }
    }

    /// The max-time-on-non-default timer fired.
    pub fn on_non_default_timer(&mut self, default_healthy: bool) -> MigrationAction {
        if self.state != MigrationState::OnNonDefault {
            return MigrationAction::None;
        }
        if default_healthy {
            self.state = MigrationState::Migrating;
            self.probe_target = Some((self.default_network, ProbeReason::ReturnToDefault));
            return MigrationAction::ProbePath {
                network: self.default_network,
            };
        }
        // Default still unhealthy: stay, but not forever.
        if self.timer_extensions < self.config.max_path_degrading_non_default_migrations {
            self.timer_extensions += 1;
            MigrationAction::ExtendNonDefaultTimer
        } else {
            self.state = MigrationState::Draining;
            MigrationAction::StartDraining
        }
    }

    /// Server sent PREFERRED_ADDRESS.
    pub fn on_server_preferred_address(&mut self, addr: SocketAddr) -> MigrationAction {
        if self.terminal() || !self.config.allow_server_migration {
            return MigrationAction::None;
        }
        MigrationAction::MigrateToServerAddress(addr)
    }

    /// The network the session runs on disconnected entirely.
    pub fn on_network_disconnected(&mut self, network: NetworkBinding) -> MigrationAction {
        if network != self.current_network || self.terminal() {
            return MigrationAction::None;
        }
        self.on_write_error()
    }

    pub fn mark_draining(&mut self) {
        if !self.terminal() {
            self.state = MigrationState::Draining;
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = MigrationState::Closed;
    }

    fn enter_default(&mut self) {
        self.state = MigrationState::OnDefault;
        // Counters are per-excursion; a session back on the default
        // network earns a fresh quota.
        self.path_degrading_migrations = 0;
        self.write_error_migrations = 0;
        self.timer_extensions = 0;
    }

    fn terminal(&self) -> bool {
        matches!(
            self.state,
            MigrationState::Draining | MigrationState::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wifi() -> NetworkBinding {
        NetworkBinding::from_handle(1)
    }

    fn cell() -> NetworkBinding {
        NetworkBinding::from_handle(2)
    }

    fn migrating_config() -> MigrationConfig {
        MigrationConfig {
            default_network_migration: true,
            path_degradation_migration: true,
            allow_non_default_network_usage: true,
            migrate_idle_connections: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_rejects_non_default_without_path_degradation() {
        let config = MigrationConfig {
            path_degradation_migration: false,
            allow_non_default_network_usage: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MigrationConfig {
            path_degradation_migration: true,
            allow_non_default_network_usage: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_close_sessions_on_ip_change() {
        let config = MigrationConfig {
            close_sessions_on_ip_change: true,
            ..Default::default()
        };
        let mut ctrl = MigrationController::new(config, wifi());
        let action = ctrl.on_default_network_changed(cell(), false, Duration::ZERO);
        assert_eq!(action, MigrationAction::CloseSession);
        assert_eq!(ctrl.state(), MigrationState::Closed);
    }

    #[test]
    fn test_goaway_sessions_on_ip_change() {
        let config = MigrationConfig {
            goaway_sessions_on_ip_change: true,
            ..Default::default()
        };
        let mut ctrl = MigrationController::new(config, wifi());
        let action = ctrl.on_default_network_changed(cell(), false, Duration::ZERO);
        assert_eq!(action, MigrationAction::StartDraining);
        assert_eq!(ctrl.state(), MigrationState::Draining);
    }

    #[test]
    fn test_default_network_migration_probe_then_migrate() {
        let mut ctrl = MigrationController::new(migrating_config(), wifi());

        let action = ctrl.on_default_network_changed(cell(), false, Duration::ZERO);
        assert_eq!(action, MigrationAction::ProbePath { network: cell() });
        assert_eq!(ctrl.state(), MigrationState::Migrating);
        assert!(ctrl.writes_queued());

        let action = ctrl.on_probe_result(cell(), true);
        assert_eq!(
            action,
            MigrationAction::MigrateTo {
                network: cell(),
                arm_non_default_timer: false
            }
        );
        assert_eq!(ctrl.state(), MigrationState::OnDefault);
        assert_eq!(ctrl.current_network(), cell());
        assert!(!ctrl.writes_queued());
    }

    #[test]
    fn test_no_migration_when_disabled() {
        let mut ctrl = MigrationController::new(MigrationConfig::default(), wifi());
        let action = ctrl.on_default_network_changed(cell(), false, Duration::ZERO);
        assert_eq!(action, MigrationAction::None);
        assert_eq!(ctrl.state(), MigrationState::OnDefault);
    }

    #[test]
    fn test_idle_session_migrates_only_within_window() {
        let mut config = migrating_config();
        config.idle_migration_period = Duration::from_secs(30);
        let mut ctrl = MigrationController::new(config.clone(), wifi());

        // Recently active idle session migrates.
        let action = ctrl.on_default_network_changed(cell(), true, Duration::from_secs(5));
        assert_eq!(action, MigrationAction::ProbePath { network: cell() });

        // Long-idle session is closed instead.
        let mut ctrl = MigrationController::new(config.clone(), wifi());
        let action = ctrl.on_default_network_changed(cell(), true, Duration::from_secs(120));
        assert_eq!(action, MigrationAction::CloseSession);

        // Without migrate_idle_connections even a fresh idle session closes.
        config.migrate_idle_connections = false;
        let mut ctrl = MigrationController::new(config, wifi());
        let action = ctrl.on_default_network_changed(cell(), true, Duration::from_secs(1));
        assert_eq!(action, MigrationAction::CloseSession);
    }

    #[test]
    fn test_path_degradation_migrates_to_alternate() {
        let mut ctrl = MigrationController::new(migrating_config(), wifi());
        ctrl.set_alternate_network(Some(cell()));

        let action = ctrl.on_path_degrading();
        assert_eq!(action, MigrationAction::ProbePath { network: cell() });

        let action = ctrl.on_probe_result(cell(), true);
        assert_eq!(
            action,
            MigrationAction::MigrateTo {
                network: cell(),
                arm_non_default_timer: true
            }
        );
        assert_eq!(ctrl.state(), MigrationState::OnNonDefault);
        assert_eq!(ctrl.path_degrading_migrations(), 1);
    }

    #[test]
    fn test_path_degradation_without_alternate_probes_port() {
        let mut ctrl = MigrationController::new(migrating_config(), wifi());
        assert_eq!(ctrl.on_path_degrading(), MigrationAction::ProbePort);
        assert_eq!(ctrl.state(), MigrationState::OnDefault);
    }

    #[test]
    fn test_path_degradation_cap_enforced() {
        let mut config = migrating_config();
        config.max_path_degrading_non_default_migrations = 1;
        let mut ctrl = MigrationController::new(config, wifi());
        ctrl.set_alternate_network(Some(cell()));

        // First excursion consumes the quota.
        ctrl.on_path_degrading();
        ctrl.on_probe_result(cell(), true);
        assert_eq!(ctrl.path_degrading_migrations(), 1);

        // Return to default; counters reset.
        ctrl.on_non_default_timer(true);
        ctrl.on_probe_result(wifi(), true);
        assert_eq!(ctrl.path_degrading_migrations(), 0);
        assert_eq!(ctrl.state(), MigrationState::OnDefault);

        // Quota available again after the reset.
        let action = ctrl.on_path_degrading();
        assert_eq!(action, MigrationAction::ProbePath { network: cell() });
    }

    #[test]
    fn test_write_error_migration_and_cap() {
        let mut config = migrating_config();
        config.max_write_error_non_default_migrations = 1;
        let mut ctrl = MigrationController::new(config, wifi());
        ctrl.set_alternate_network(Some(cell()));

        let action = ctrl.on_write_error();
        assert_eq!(action, MigrationAction::ProbePath { network: cell() });
        assert_eq!(ctrl.write_error_migrations(), 1);
        ctrl.on_probe_result(cell(), true);

        // Second write error on the non-default network: cap reached.
        ctrl.set_alternate_network(Some(wifi()));
        let action = ctrl.on_write_error();
        assert_eq!(action, MigrationAction::CloseSession);
    }

    #[test]
    fn test_write_error_without_alternate_closes() {
        let mut ctrl = MigrationController::new(migrating_config(), wifi());
        assert_eq!(ctrl.on_write_error(), MigrationAction::CloseSession);
        assert_eq!(ctrl.state(), MigrationState::Closed);
    }

    #[test]
    fn test_probe_failure_falls_back() {
        let mut ctrl = MigrationController::new(migrating_config(), wifi());
        ctrl.set_alternate_network(Some(cell()));

        ctrl.on_path_degrading();
        let action = ctrl.on_probe_result(cell(), false);
        assert_eq!(action, MigrationAction::None);
        assert_eq!(ctrl.state(), MigrationState::OnDefault);
        assert_eq!(ctrl.current_network(), wifi());
        assert_eq!(ctrl.path_degrading_migrations(), 0, "failed probe is not a migration");
    }

    #[test]
    fn test_non_default_timer_returns_when_healthy() {
        let mut ctrl = MigrationController::new(migrating_config(), wifi());
        ctrl.set_alternate_network(Some(cell()));
        ctrl.on_path_degrading();
        ctrl.on_probe_result(cell(), true);

        let action = ctrl.on_non_default_timer(true);
        assert_eq!(action, MigrationAction::ProbePath { network: wifi() });
        ctrl.on_probe_result(wifi(), true);
        assert_eq!(ctrl.state(), MigrationState::OnDefault);
    }

    #[test]
    fn test_non_default_timer_extends_then_drains() {
        let mut config = migrating_config();
        config.max_path_degrading_non_default_migrations = 1;
        let mut ctrl = MigrationController::new(config, wifi());
        ctrl.set_alternate_network(Some(cell()));
        ctrl.on_path_degrading();
        ctrl.on_probe_result(cell(), true);

        assert_eq!(
            ctrl.on_non_default_timer(false),
            MigrationAction::ExtendNonDefaultTimer
        );
        assert_eq!(
            ctrl.on_non_default_timer(false),
            MigrationAction::StartDraining
        );
        assert_eq!(ctrl.state(), MigrationState::Draining);
    }

    #[test]
    fn test_server_migration_gated() {
        let addr: SocketAddr = "192.0.2.1:443".parse().unwrap();

        let mut ctrl = MigrationController::new(MigrationConfig::default(), wifi());
        assert_eq!(
            ctrl.on_server_preferred_address(addr),
            MigrationAction::None
        );

        let config = MigrationConfig {
            allow_server_migration: true,
            ..Default::default()
        };
        let mut ctrl = MigrationController::new(config, wifi());
        assert_eq!(
            ctrl.on_server_preferred_address(addr),
            MigrationAction::MigrateToServerAddress(addr)
        );
    }

    #[test]
    fn test_pre_handshake_retry_policy() {
        let mut ctrl = MigrationController::new(MigrationConfig::default(), wifi());
        ctrl.set_alternate_network(Some(cell()));
        assert_eq!(ctrl.should_retry_pre_handshake_on_alternate(), None);

        let config = MigrationConfig {
            retry_pre_handshake_errors_on_non_default_network: true,
            ..Default::default()
        };
        let mut ctrl = MigrationController::new(config, wifi());
        ctrl.set_alternate_network(Some(cell()));
        assert_eq!(ctrl.should_retry_pre_handshake_on_alternate(), Some(cell()));
    }

    #[test]
    fn test_network_disconnected_behaves_like_write_error() {
        let mut ctrl = MigrationController::new(migrating_config(), wifi());
        ctrl.set_alternate_network(Some(cell()));

        // Disconnect of an unrelated network is ignored.
        assert_eq!(
            ctrl.on_network_disconnected(cell()),
            MigrationAction::None
        );
        // Disconnect of the current network forces a migration.
        assert_eq!(
            ctrl.on_network_disconnected(wifi()),
            MigrationAction::ProbePath { network: cell() }
        );
    }

    #[test]
    fn test_terminal_states_ignore_triggers() {
        let mut ctrl = MigrationController::new(migrating_config(), wifi());
        ctrl.mark_closed();
        assert_eq!(
            ctrl.on_default_network_changed(cell(), false, Duration::ZERO),
            MigrationAction::None
        );
        assert_eq!(ctrl.on_path_degrading(), MigrationAction::None);
        assert_eq!(ctrl.on_write_error(), MigrationAction::None);
    }
}
