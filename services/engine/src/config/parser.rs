//! INI parsing logic for converting `Ini` → `Settings`.
//!
//! This is the single place where INI key names are mapped to struct fields.

use ini::Ini;
use std::path::PathBuf;
use std::str::FromStr;

use super::{CertManagerType, ConfigError, InterfaceDriverType, SchedulerType, Settings};

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn number<T: FromStr>(section: &str, key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(section, key, value, "must be a non-negative integer"))
}

fn boolean(section: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(section, key, value, "must be true or false")),
    }
}

fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Parse an `Ini` object into `Settings`, starting from the defaults.
pub(super) fn parse_ini(ini: &Ini) -> Result<Settings, ConfigError> {
    let mut config = Settings::default();

    // [DEFAULT] section
    if let Some(section) = ini.section(Some("DEFAULT")) {
        if let Some(v) = section.get("host").and_then(non_empty) {
            config.host = v;
        }
        if let Some(v) = section.get("default_provider").and_then(non_empty) {
            config.default_provider = v;
        }
        if let Some(v) = section.get("enabled_providers") {
            config.enabled_providers = list(v);
        }
    }
    if !config.is_provider_enabled(&config.default_provider) {
        return Err(invalid(
            "DEFAULT",
            "default_provider",
            &config.default_provider,
            "must be one of enabled_providers",
        ));
    }

    // [certificates] section
    if let Some(section) = ini.section(Some("certificates")) {
        if let Some(v) = section.get("cert_manager_type") {
            config.certificates.manager = match v.trim().to_lowercase().as_str() {
                "local" => CertManagerType::Local,
                "barbican" => CertManagerType::Barbican,
                _ => {
                    return Err(invalid(
                        "certificates",
                        "cert_manager_type",
                        v,
                        "must be 'local' or 'barbican'",
                    ))
                }
            };
        }
        if let Some(v) = section.get("storage_path").and_then(non_empty) {
            config.certificates.storage_path = PathBuf::from(v);
        }
    }

    // [service_auth] section
    if let Some(section) = ini.section(Some("service_auth")) {
        let auth = &mut config.service_auth;
        if let Some(v) = section.get("auth_url") {
            auth.auth_url = non_empty(v);
        }
        if let Some(v) = section.get("admin_user").and_then(non_empty) {
            auth.admin_user = v;
        }
        if let Some(v) = section.get("admin_password") {
            auth.admin_password = v.to_string();
        }
        if let Some(v) = section.get("admin_tenant_name").and_then(non_empty) {
            auth.admin_tenant_name = v;
        }
        if let Some(v) = section.get("admin_user_domain").and_then(non_empty) {
            auth.admin_user_domain = v;
        }
        if let Some(v) = section.get("admin_project_domain").and_then(non_empty) {
            auth.admin_project_domain = v;
        }
        if let Some(v) = section.get("region") {
            auth.region = non_empty(v);
        }
        if let Some(v) = section.get("endpoint_type").and_then(non_empty) {
            auth.endpoint_type = v;
        }
        if let Some(v) = section.get("insecure") {
            auth.insecure = boolean("service_auth", "insecure", v)?;
        }
        if let Some(v) = section.get("cafile") {
            auth.cafile = non_empty(v).map(PathBuf::from);
        }
        if let Some(v) = section.get("certfile") {
            auth.certfile = non_empty(v).map(PathBuf::from);
        }
        if let Some(v) = section.get("keyfile") {
            auth.keyfile = non_empty(v).map(PathBuf::from);
        }
        if let Some(v) = section.get("timeout") {
            auth.timeout = number("service_auth", "timeout", v)?;
        }
    }

    // [haproxy] section
    if let Some(section) = ini.section(Some("haproxy")) {
        let haproxy = &mut config.haproxy;
        if let Some(v) = section.get("loadbalancer_state_path").and_then(non_empty) {
            haproxy.loadbalancer_state_path = PathBuf::from(v);
        }
        if let Some(v) = section.get("user_group").and_then(non_empty) {
            haproxy.user_group = v;
        }
        if let Some(v) = section.get("interface_driver") {
            haproxy.interface_driver = match v.trim().to_lowercase().as_str() {
                "openvswitch" | "ovs" => InterfaceDriverType::OpenVswitch,
                "linuxbridge" => InterfaceDriverType::LinuxBridge,
                _ => {
                    return Err(invalid(
                        "haproxy",
                        "interface_driver",
                        v,
                        "must be 'openvswitch' or 'linuxbridge'",
                    ))
                }
            };
        }
        if let Some(v) = section.get("ovs_integration_bridge").and_then(non_empty) {
            haproxy.ovs_integration_bridge = v;
        }
        if let Some(v) = section.get("periodic_interval") {
            haproxy.periodic_interval = number("haproxy", "periodic_interval", v)?;
            if haproxy.periodic_interval == 0 {
                return Err(invalid("haproxy", "periodic_interval", v, "must be at least 1"));
            }
        }
        if let Some(v) = section.get("send_gratuitous_arp") {
            haproxy.send_gratuitous_arp = number("haproxy", "send_gratuitous_arp", v)?;
        }
        if let Some(v) = section.get("haproxy_binary").and_then(non_empty) {
            haproxy.haproxy_binary = v;
        }
        if let Some(v) = section.get("command_timeout") {
            haproxy.command_timeout = number("haproxy", "command_timeout", v)?;
        }
        if let Some(v) = section.get("kill_grace_period") {
            haproxy.kill_grace_period = number("haproxy", "kill_grace_period", v)?;
        }
        if let Some(v) = section.get("cleanup_namespace") {
            haproxy.cleanup_namespace = boolean("haproxy", "cleanup_namespace", v)?;
        }
    }

    // [octavia] section
    if let Some(section) = ini.section(Some("octavia")) {
        let octavia = &mut config.octavia;
        if let Some(v) = section.get("base_url").and_then(non_empty) {
            octavia.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = section.get("request_poll_interval") {
            octavia.request_poll_interval = number("octavia", "request_poll_interval", v)?;
        }
        if let Some(v) = section.get("request_poll_timeout") {
            octavia.request_poll_timeout = number("octavia", "request_poll_timeout", v)?;
        }
        if let Some(v) = section.get("allocates_vip") {
            octavia.allocates_vip = boolean("octavia", "allocates_vip", v)?;
        }
    }

    // [radwarev2] section
    if let Some(section) = ini.section(Some("radwarev2")) {
        let radware = &mut config.radware;
        if let Some(v) = section.get("vdirect_address") {
            radware.vdirect_address = non_empty(v);
        }
        if let Some(v) = section.get("ha_secondary_address") {
            radware.ha_secondary_address = non_empty(v);
        }
        if let Some(v) = section.get("vdirect_user").and_then(non_empty) {
            radware.vdirect_user = v;
        }
        if let Some(v) = section.get("vdirect_password") {
            radware.vdirect_password = v.to_string();
        }
        if let Some(v) = section.get("port") {
            radware.port = number("radwarev2", "port", v)?;
        }
        if let Some(v) = section.get("ssl") {
            radware.ssl = boolean("radwarev2", "ssl", v)?;
        }
        if let Some(v) = section.get("timeout") {
            radware.timeout = number("radwarev2", "timeout", v)?;
        }
        if let Some(v) = section.get("workflow_template_name").and_then(non_empty) {
            radware.workflow_template_name = v;
        }
        if let Some(v) = section.get("child_workflow_template_names") {
            radware.child_workflow_template_names = list(v);
        }
        if let Some(v) = section.get("workflow_action_name").and_then(non_empty) {
            radware.workflow_action_name = v;
        }
        if let Some(v) = section.get("stats_action_name").and_then(non_empty) {
            radware.stats_action_name = v;
        }
        if let Some(v) = section.get("service_ha_pair") {
            radware.service_ha_pair = boolean("radwarev2", "service_ha_pair", v)?;
        }
        if let Some(v) = section.get("service_throughput") {
            radware.service_throughput = number("radwarev2", "service_throughput", v)?;
        }
        if let Some(v) = section.get("service_adc_type").and_then(non_empty) {
            radware.service_adc_type = v;
        }
        if let Some(v) = section.get("service_adc_version") {
            radware.service_adc_version = v.trim().to_string();
        }
        if let Some(v) = section.get("status_sweep_interval") {
            radware.status_sweep_interval = number("radwarev2", "status_sweep_interval", v)?;
        }
        if let Some(v) = section.get("operation_poll_interval") {
            radware.operation_poll_interval = number("radwarev2", "operation_poll_interval", v)?;
        }
        if let Some(v) = section.get("operation_timeout") {
            radware.operation_timeout = number("radwarev2", "operation_timeout", v)?;
        }
    }

    // [radwarev2_debug] section
    if let Some(section) = ini.section(Some("radwarev2_debug")) {
        let radware = &mut config.radware;
        if let Some(v) = section.get("provision_service") {
            radware.provision_service = boolean("radwarev2_debug", "provision_service", v)?;
        }
        if let Some(v) = section.get("configure_l3") {
            radware.configure_l3 = boolean("radwarev2_debug", "configure_l3", v)?;
        }
        if let Some(v) = section.get("configure_l4") {
            radware.configure_l4 = boolean("radwarev2_debug", "configure_l4", v)?;
        }
    }

    // [agent] section
    if let Some(section) = ini.section(Some("agent")) {
        let agent = &mut config.agent;
        if let Some(v) = section.get("agent_down_time") {
            agent.agent_down_time = number("agent", "agent_down_time", v)?;
        }
        if let Some(v) = section.get("scheduler_driver") {
            agent.scheduler = match v.trim().to_lowercase().as_str() {
                "chance" => SchedulerType::Chance,
                "least_loaded" | "leastloaded" => SchedulerType::LeastLoaded,
                _ => {
                    return Err(invalid(
                        "agent",
                        "scheduler_driver",
                        v,
                        "must be 'chance' or 'least_loaded'",
                    ))
                }
            };
        }
        if let Some(v) = section.get("reschedule_interval") {
            agent.reschedule_interval = number("agent", "reschedule_interval", v)?;
        }
        if let Some(v) = section.get("cast_timeout") {
            agent.cast_timeout = number("agent", "cast_timeout", v)?;
        }
    }

    // [events] section
    if let Some(section) = ini.section(Some("events")) {
        if let Some(v) = section.get("topic").and_then(non_empty) {
            config.event_topic = v;
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let settings = Settings::from_ini_str("").unwrap();
        assert_eq!(settings.default_provider, "haproxy");
        assert_eq!(settings.event_topic, DEFAULT_EVENT_TOPIC);
        assert_eq!(settings.haproxy.periodic_interval, 10);
        assert_eq!(settings.octavia.request_poll_timeout, 100);
    }

    #[test]
    fn test_sections_overlay_defaults() {
        let settings = Settings::from_ini_str(
            r#"
[DEFAULT]
host = lb-node-1
default_provider = octavia
enabled_providers = haproxy, octavia

[certificates]
cert_manager_type = barbican
storage_path = /srv/certs

[haproxy]
loadbalancer_state_path = /run/lbaas
interface_driver = linuxbridge
send_gratuitous_arp = 0

[octavia]
base_url = http://octavia:9876/
allocates_vip = true
request_poll_interval = 1

[radwarev2]
vdirect_address = 10.1.1.1
ha_secondary_address = 10.1.1.2
child_workflow_template_names = manage_l3, manage_l4

[radwarev2_debug]
configure_l3 = false

[agent]
scheduler_driver = least_loaded

[events]
topic = custom_topic
"#,
        )
        .unwrap();

        assert_eq!(settings.host, "lb-node-1");
        assert_eq!(settings.default_provider, "octavia");
        assert!(settings.is_provider_enabled("haproxy"));
        assert_eq!(settings.certificates.manager, CertManagerType::Barbican);
        assert_eq!(settings.certificates.storage_path, PathBuf::from("/srv/certs"));
        assert_eq!(settings.haproxy.loadbalancer_state_path, PathBuf::from("/run/lbaas"));
        assert_eq!(settings.haproxy.interface_driver, InterfaceDriverType::LinuxBridge);
        assert_eq!(settings.haproxy.send_gratuitous_arp, 0);
        assert_eq!(settings.octavia.base_url, "http://octavia:9876");
        assert!(settings.octavia.allocates_vip);
        assert_eq!(settings.octavia.request_poll_interval, 1);
        assert_eq!(settings.radware.vdirect_address.as_deref(), Some("10.1.1.1"));
        assert_eq!(settings.radware.child_workflow_template_names, vec!["manage_l3", "manage_l4"]);
        assert!(!settings.radware.configure_l3);
        assert!(settings.radware.configure_l4);
        assert_eq!(settings.agent.scheduler, SchedulerType::LeastLoaded);
        assert_eq!(settings.event_topic, "custom_topic");
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = Settings::from_ini_str("[haproxy]\nperiodic_interval = soon\n").unwrap_err();
        match err {
            ConfigError::InvalidValue { section, key, .. } => {
                assert_eq!(section, "haproxy");
                assert_eq!(key, "periodic_interval");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(Settings::from_ini_str("[octavia]\nallocates_vip = maybe\n").is_err());
        assert!(Settings::from_ini_str("[DEFAULT]\ndefault_provider = nope\n").is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.ini")).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
