//! Engine configuration
//!
//! Settings are read from an INI file, one section per option group, and
//! overlaid on built-in defaults. Missing files yield the defaults.

mod parser;

use ini::Ini;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_EVENT_TOPIC: &str = "neutron_lbaas_event";
pub const DEFAULT_CERT_STORAGE: &str = "/var/lib/neutron-lbaas/certificates/";
pub const TLS_STORAGE_ENV: &str = "OS_LBAAS_TLS_STORAGE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] ini::ParseError),

    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertManagerType {
    Local,
    Barbican,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceDriverType {
    OpenVswitch,
    LinuxBridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerType {
    Chance,
    LeastLoaded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertificateSettings {
    pub manager: CertManagerType,
    pub storage_path: PathBuf,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        let storage_path = std::env::var(TLS_STORAGE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CERT_STORAGE));
        Self {
            manager: CertManagerType::Local,
            storage_path,
        }
    }
}

/// Keystone credentials used for service-to-service calls
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAuthSettings {
    pub auth_url: Option<String>,
    pub admin_user: String,
    pub admin_password: String,
    pub admin_tenant_name: String,
    pub admin_user_domain: String,
    pub admin_project_domain: String,
    pub region: Option<String>,
    pub endpoint_type: String,
    pub insecure: bool,
    pub cafile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub timeout: u64,
}

impl Default for ServiceAuthSettings {
    fn default() -> Self {
        Self {
            auth_url: None,
            admin_user: "admin".to_string(),
            admin_password: "password".to_string(),
            admin_tenant_name: "admin".to_string(),
            admin_user_domain: "Default".to_string(),
            admin_project_domain: "Default".to_string(),
            region: None,
            endpoint_type: "public".to_string(),
            insecure: false,
            cafile: None,
            certfile: None,
            keyfile: None,
            timeout: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HaproxySettings {
    pub loadbalancer_state_path: PathBuf,
    pub user_group: String,
    pub interface_driver: InterfaceDriverType,
    pub ovs_integration_bridge: String,
    pub periodic_interval: u64,
    /// Number of gratuitous ARPs sent after plugging the VIP; 0 disables
    pub send_gratuitous_arp: u32,
    pub haproxy_binary: String,
    pub command_timeout: u64,
    pub kill_grace_period: u64,
    pub cleanup_namespace: bool,
}

impl Default for HaproxySettings {
    fn default() -> Self {
        Self {
            loadbalancer_state_path: PathBuf::from("/var/lib/neutron/lbaas"),
            user_group: "nogroup".to_string(),
            interface_driver: InterfaceDriverType::OpenVswitch,
            ovs_integration_bridge: "br-int".to_string(),
            periodic_interval: 10,
            send_gratuitous_arp: 3,
            haproxy_binary: "haproxy".to_string(),
            command_timeout: 30,
            kill_grace_period: 10,
            cleanup_namespace: true,
        }
    }
}

impl HaproxySettings {
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_secs(self.kill_grace_period)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OctaviaSettings {
    pub base_url: String,
    pub request_poll_interval: u64,
    pub request_poll_timeout: u64,
    pub allocates_vip: bool,
}

impl Default for OctaviaSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9876".to_string(),
            request_poll_interval: 3,
            request_poll_timeout: 100,
            allocates_vip: false,
        }
    }
}

impl OctaviaSettings {
    pub fn request_poll_interval(&self) -> Duration {
        Duration::from_secs(self.request_poll_interval)
    }

    pub fn request_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.request_poll_timeout)
    }
}

/// Remote workflow controller (vDirect) options
#[derive(Debug, Clone, PartialEq)]
pub struct RadwareSettings {
    pub vdirect_address: Option<String>,
    pub ha_secondary_address: Option<String>,
    pub vdirect_user: String,
    pub vdirect_password: String,
    pub port: u16,
    pub ssl: bool,
    pub timeout: u64,
    pub workflow_template_name: String,
    pub child_workflow_template_names: Vec<String>,
    pub workflow_action_name: String,
    pub stats_action_name: String,
    pub service_ha_pair: bool,
    pub service_throughput: u32,
    pub service_adc_type: String,
    pub service_adc_version: String,
    pub status_sweep_interval: u64,
    pub operation_poll_interval: u64,
    pub operation_timeout: u64,
    pub provision_service: bool,
    pub configure_l3: bool,
    pub configure_l4: bool,
}

impl Default for RadwareSettings {
    fn default() -> Self {
        Self {
            vdirect_address: None,
            ha_secondary_address: None,
            vdirect_user: "vDirect".to_string(),
            vdirect_password: "radware".to_string(),
            port: 2189,
            ssl: true,
            timeout: 30,
            workflow_template_name: "os_lb_v2".to_string(),
            child_workflow_template_names: vec!["manage_l3".to_string()],
            workflow_action_name: "apply".to_string(),
            stats_action_name: "stats".to_string(),
            service_ha_pair: false,
            service_throughput: 1000,
            service_adc_type: "VA".to_string(),
            service_adc_version: String::new(),
            status_sweep_interval: 10,
            operation_poll_interval: 2,
            operation_timeout: 600,
            provision_service: true,
            configure_l3: true,
            configure_l4: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub agent_down_time: u64,
    pub scheduler: SchedulerType,
    pub reschedule_interval: u64,
    pub cast_timeout: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            agent_down_time: 75,
            scheduler: SchedulerType::Chance,
            reschedule_interval: 30,
            cast_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub host: String,
    pub default_provider: String,
    pub enabled_providers: Vec<String>,
    pub certificates: CertificateSettings,
    pub service_auth: ServiceAuthSettings,
    pub haproxy: HaproxySettings,
    pub octavia: OctaviaSettings,
    pub radware: RadwareSettings,
    pub agent: AgentSettings,
    pub event_topic: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            default_provider: "haproxy".to_string(),
            enabled_providers: vec!["haproxy".to_string()],
            certificates: CertificateSettings::default(),
            service_auth: ServiceAuthSettings::default(),
            haproxy: HaproxySettings::default(),
            octavia: OctaviaSettings::default(),
            radware: RadwareSettings::default(),
            agent: AgentSettings::default(),
            event_topic: DEFAULT_EVENT_TOPIC.to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults when the file is absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)?;
        parser::parse_ini(&ini)
    }

    pub fn from_ini_str(content: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(content)?;
        parser::parse_ini(&ini)
    }

    pub fn is_provider_enabled(&self, name: &str) -> bool {
        self.enabled_providers.iter().any(|p| p == name)
    }
}
