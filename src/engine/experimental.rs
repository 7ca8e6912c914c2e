//! Experimental options: the legacy JSON knob surface.
//!
//! The JSON document is an adapter over the typed `EngineOptions`; the
//! recognized keys form a closed set matching the original knob names.
//! Unknown sections and keys are ignored with a warning, never silently
//! repurposed.

use crate::engine::options::EngineOptions;
use crate::base::neterror::NetError;
use serde_json::Value;
use std::time::Duration;

/// Apply a JSON experimental-options document onto typed options.
/// Returns the list of unrecognized keys (already warned about).
pub fn apply_json(options: &mut EngineOptions, json: &str) -> Result<Vec<String>, NetError> {
    let root: Value = serde_json::from_str(json)
        .map_err(|e| NetError::InvalidArgument(format!("experimental options: {e}")))?;
    let Value::Object(sections) = root else {
        return Err(NetError::InvalidArgument(
            "experimental options must be a JSON object".into(),
        ));
    };

    let mut unknown = Vec::new();
    for (section, body) in &sections {
        match section.as_str() {
            "QUIC" => apply_quic(options, body, &mut unknown),
            "AsyncDNS" => apply_async_dns(options, body, &mut unknown),
            "StaleDNS" => apply_stale_dns(options, body, &mut unknown),
            "HostResolverRules" => apply_host_resolver_rules(options, body, &mut unknown),
            _ => {
                tracing::warn!(section, "unrecognized experimental options section");
                unknown.push(section.clone());
            }
        }
    }
    Ok(unknown)
}

fn apply_quic(options: &mut EngineOptions, body: &Value, unknown: &mut Vec<String>) {
    let Value::Object(map) = body else { return };
    for (key, value) in map {
        match key.as_str() {
            "migrate_sessions_on_network_change_v2" => {
                if let Some(v) = value.as_bool() {
                    options.migration.default_network_migration = v;
                }
            }
            // Legacy conjunction knob: early migration means both
            // degradation-triggered migration and non-default usage.
            "migrate_sessions_early_v2" => {
                if let Some(v) = value.as_bool() {
                    options.migration.path_degradation_migration = v;
                    options.migration.allow_non_default_network_usage = v;
                }
            }
            "migrate_idle_sessions" => {
                if let Some(v) = value.as_bool() {
                    options.migration.migrate_idle_connections = v;
                }
            }
            "idle_session_migration_period_seconds" => {
                if let Some(v) = value.as_u64() {
                    options.migration.idle_migration_period = Duration::from_secs(v);
                }
            }
            "max_time_on_non_default_network_seconds" => {
                if let Some(v) = value.as_u64() {
                    options.migration.max_time_on_non_default_network = Duration::from_secs(v);
                }
            }
            "max_migrations_to_non_default_network_on_path_degrading" => {
                if let Some(v) = value.as_u64() {
                    options.migration.max_path_degrading_non_default_migrations = v as u32;
                }
            }
            "max_migrations_to_non_default_network_on_write_error" => {
                if let Some(v) = value.as_u64() {
                    options.migration.max_write_error_non_default_migrations = v as u32;
                }
            }
            "allow_server_migration" => {
                if let Some(v) = value.as_bool() {
                    options.migration.allow_server_migration = v;
                }
            }
            "retry_on_alternate_network_before_handshake" => {
                if let Some(v) = value.as_bool() {
                    options
                        .migration
                        .retry_pre_handshake_errors_on_non_default_network = v;
                }
            }
            "close_sessions_on_ip_change" => {
                if let Some(v) = value.as_bool() {
                    options.migration.close_sessions_on_ip_change = v;
                }
            }
            "goaway_sessions_on_ip_change" => {
                if let Some(v) = value.as_bool() {
                    options.migration.goaway_sessions_on_ip_change = v;
                }
            }
            "max_server_configs_stored_in_properties" => {
                if let Some(v) = value.as_u64() {
                    options.quic.server_configs_cache_size = v as usize;
                }
            }
            "user_agent_id" => {
                if let Some(v) = value.as_str() {
                    options.quic.handshake_user_agent = Some(v.to_string());
                }
            }
            "idle_connection_timeout_seconds" => {
                if let Some(v) = value.as_u64() {
                    options.quic.idle_timeout = Duration::from_secs(v);
                }
            }
            "max_time_before_crypto_handshake_seconds" => {
                if let Some(v) = value.as_u64() {
                    options.quic.crypto_handshake_timeout = Duration::from_secs(v);
                }
            }
            "max_idle_time_before_crypto_handshake_seconds" => {
                if let Some(v) = value.as_u64() {
                    options.quic.pre_handshake_idle_timeout = Duration::from_secs(v);
                }
            }
            "connection_options" => {
                if let Some(v) = value.as_str() {
                    options.quic.connection_options =
                        v.split(',').map(|t| t.trim().to_string()).collect();
                }
            }
            "client_connection_options" => {
                if let Some(v) = value.as_str() {
                    options.quic.client_connection_options =
                        v.split(',').map(|t| t.trim().to_string()).collect();
                }
            }
            "quic_version" => {
                if let Some(v) = value.as_str() {
                    options.quic.versions = v
                        .split(',')
                        .filter_map(|t| t.trim().trim_start_matches("h3-Q").parse().ok())
                        .collect();
                }
            }
            "disable_tls_zero_rtt" => {
                if let Some(v) = value.as_bool() {
                    options.quic.enable_0rtt = !v;
                }
            }
            "initial_delay_for_broken_alternative_service_seconds" => {
                if let Some(v) = value.as_u64() {
                    options.quic.broken_service_initial_delay = Duration::from_secs(v);
                }
            }
            "exponential_backoff_on_initial_delay" => {
                if let Some(v) = value.as_bool() {
                    options.quic.broken_service_exponential_backoff = v;
                }
            }
            "race_stale_dns_on_connection" => {
                if let Some(v) = value.as_bool() {
                    options.dns.preestablish_connections_to_stale_dns_results = v;
                }
            }
            _ => {
                tracing::warn!(key, "unrecognized QUIC experimental option");
                unknown.push(format!("QUIC.{key}"));
            }
        }
    }
}

fn apply_async_dns(options: &mut EngineOptions, body: &Value, unknown: &mut Vec<String>) {
    let Value::Object(map) = body else { return };
    for (key, value) in map {
        match key.as_str() {
            "enable" => {
                if let Some(v) = value.as_bool() {
                    options.dns.use_builtin_resolver = v;
                }
            }
            _ => {
                tracing::warn!(key, "unrecognized AsyncDNS experimental option");
                unknown.push(format!("AsyncDNS.{key}"));
            }
        }
    }
}

fn apply_stale_dns(options: &mut EngineOptions, body: &Value, unknown: &mut Vec<String>) {
    let Value::Object(map) = body else { return };
    for (key, value) in map {
        match key.as_str() {
            "enable" => {
                if let Some(v) = value.as_bool() {
                    options.dns.enable_stale = v;
                }
            }
            "delay_ms" => {
                if let Some(v) = value.as_u64() {
                    options.dns.fresh_lookup_timeout = Duration::from_millis(v);
                }
            }
            "max_expired_time_ms" => {
                if let Some(v) = value.as_u64() {
                    options.dns.max_expired_delay = Duration::from_millis(v);
                }
            }
            "allow_other_network" => {
                if let Some(v) = value.as_bool() {
                    options.dns.allow_cross_network_usage = v;
                }
            }
            "persist_to_disk" => {
                if let Some(v) = value.as_bool() {
                    options.dns.persist_host_cache = v;
                }
            }
            "persist_delay_ms" => {
                if let Some(v) = value.as_u64() {
                    options.dns.persist_delay = Duration::from_millis(v);
                }
            }
            "use_stale_on_name_not_resolved" => {
                if let Some(v) = value.as_bool() {
                    options.dns.use_stale_on_name_not_resolved = v;
                }
            }
            _ => {
                tracing::warn!(key, "unrecognized StaleDNS experimental option");
                unknown.push(format!("StaleDNS.{key}"));
            }
        }
    }
}

fn apply_host_resolver_rules(options: &mut EngineOptions, body: &Value, unknown: &mut Vec<String>) {
    let Value::Object(map) = body else { return };
    for (key, value) in map {
        match key.as_str() {
            // "MAP host address" rules, comma separated.
            "host_resolver_rules" => {
                if let Some(rules) = value.as_str() {
                    for rule in rules.split(',') {
                        let mut parts = rule.trim().split_whitespace();
                        if parts.next() != Some("MAP") {
                            continue;
                        }
                        let (Some(host), Some(address)) = (parts.next(), parts.next()) else {
                            continue;
                        };
                        let addr = format!("{address}:0").parse().ok().or_else(|| {
                            address.parse().ok()
                        });
                        if let Some(addr) = addr {
                            options
                                .dns
                                .host_resolver_rules
                                .entry(host.to_string())
                                .or_default()
                                .push(addr);
                        }
                    }
                }
            }
            _ => {
                tracing::warn!(key, "unrecognized HostResolverRules experimental option");
                unknown.push(format!("HostResolverRules.{key}"));
            }
        }
    }
}
