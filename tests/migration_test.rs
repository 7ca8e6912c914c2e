//! Connection-migration state machine tests through the public API.
//!
//! The session driver executes whatever the controller decides, so the
//! trigger/transition table is exercised here without sockets: a default
//! network change must complete (probe then migrate) promptly, counters
//! must be monotonic within an excursion and reset on returning to the
//! default network.

use corenet::quic::{MigrationAction, MigrationConfig, MigrationController, MigrationState};
use corenet::NetworkBinding;
use std::time::Duration;

fn wifi() -> NetworkBinding {
    NetworkBinding::from_handle(1)
}

fn cell() -> NetworkBinding {
    NetworkBinding::from_handle(2)
}

fn full_migration_config() -> MigrationConfig {
    MigrationConfig {
        default_network_migration: true,
        path_degradation_migration: true,
        allow_non_default_network_usage: true,
        allow_server_migration: true,
        migrate_idle_connections: true,
        idle_migration_period: Duration::from_secs(30),
        max_time_on_non_default_network: Duration::from_secs(128),
        retry_pre_handshake_errors_on_non_default_network: true,
        ..Default::default()
    }
}

#[test]
fn test_default_network_migration_full_cycle() {
    // An active session on wifi; the OS switches the default to cell.
    let mut ctrl = MigrationController::new(full_migration_config(), wifi());
    assert_eq!(ctrl.state(), MigrationState::OnDefault);

    let action = ctrl.on_default_network_changed(cell(), false, Duration::ZERO);
    assert_eq!(action, MigrationAction::ProbePath { network: cell() });
    assert_eq!(ctrl.state(), MigrationState::Migrating);

    // While the probe is deciding, writes are queued, not dropped: the
    // in-flight download continues after migration without restarting.
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
fn test_counters_monotonic_within_excursion_reset_on_default() {
    let mut config = full_migration_config();
    config.max_path_degrading_non_default_migrations = 2;
    let mut ctrl = MigrationController::new(config, wifi());
    ctrl.set_alternate_network(Some(cell()));

    // Excursion one.
    assert_eq!(
        ctrl.on_path_degrading(),
        MigrationAction::ProbePath { network: cell() }
    );
    ctrl.on_probe_result(cell(), true);
    assert_eq!(ctrl.path_degrading_migrations(), 1);

    // Return home: counters reset.
    ctrl.on_non_default_timer(true);
    ctrl.on_probe_result(wifi(), true);
    assert_eq!(ctrl.path_degrading_migrations(), 0);

    // Quota is available again.
    assert_eq!(
        ctrl.on_path_degrading(),
        MigrationAction::ProbePath { network: cell() }
    );
}

#[test]
fn test_close_and_goaway_policies_preempt_migration() {
    let mut config = full_migration_config();
    config.close_sessions_on_ip_change = true;
    let mut ctrl = MigrationController::new(config, wifi());
    assert_eq!(
        ctrl.on_default_network_changed(cell(), false, Duration::ZERO),
        MigrationAction::CloseSession
    );

    let mut config = full_migration_config();
    config.goaway_sessions_on_ip_change = true;
    let mut ctrl = MigrationController::new(config, wifi());
    assert_eq!(
        ctrl.on_default_network_changed(cell(), false, Duration::ZERO),
        MigrationAction::StartDraining
    );
    // A draining session accepts no further migration triggers.
    assert_eq!(ctrl.on_path_degrading(), MigrationAction::None);
}

#[test]
fn test_write_error_quota() {
    let mut config = full_migration_config();
    config.max_write_error_non_default_migrations = 2;
    let mut ctrl = MigrationController::new(config, wifi());
    ctrl.set_alternate_network(Some(cell()));

    assert!(matches!(
        ctrl.on_write_error(),
        MigrationAction::ProbePath { .. }
    ));
    assert_eq!(ctrl.write_error_migrations(), 1);
    ctrl.on_probe_result(cell(), true);

    // Second write error from the non-default network targets wifi.
    ctrl.set_alternate_network(Some(wifi()));
    assert!(matches!(
        ctrl.on_write_error(),
        MigrationAction::ProbePath { .. }
    ));
    ctrl.on_probe_result(wifi(), true);
    // wifi is the default: excursion over, counters reset.
    assert_eq!(ctrl.write_error_migrations(), 0);
}

#[test]
fn test_server_migration_honored_only_when_allowed() {
    let addr = "203.0.113.9:443".parse().unwrap();

    let mut restrictive = MigrationController::new(MigrationConfig::default(), wifi());
    assert_eq!(
        restrictive.on_server_preferred_address(addr),
        MigrationAction::None
    );

    let mut permissive = MigrationController::new(full_migration_config(), wifi());
    assert_eq!(
        permissive.on_server_preferred_address(addr),
        MigrationAction::MigrateToServerAddress(addr)
    );
}

#[test]
fn test_misconfiguration_is_build_error() {
    let config = MigrationConfig {
        allow_non_default_network_usage: true,
        path_degradation_migration: false,
        ..Default::default()
    };
    assert!(config.validate().is_err());

    // The same misconfiguration surfaces from the engine builder.
    let mut builder = corenet::Engine::builder();
    builder.options_mut().migration = config;
    assert!(builder.build().is_err());
}

#[test]
fn test_pre_handshake_retry_policy_gates_alternate() {
    let mut without = MigrationController::new(MigrationConfig::default(), wifi());
    without.set_alternate_network(Some(cell()));
    assert_eq!(without.should_retry_pre_handshake_on_alternate(), None);

    let mut with = MigrationController::new(full_migration_config(), wifi());
    with.set_alternate_network(Some(cell()));
    assert_eq!(with.should_retry_pre_handshake_on_alternate(), Some(cell()));
}
