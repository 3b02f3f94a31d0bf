//! Enumerations shared across the load balancer graph

use serde::{Deserialize, Serialize};

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($wire => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(
    /// Administrative state-machine status of an entity
    ProvisioningStatus {
        Active => "ACTIVE",
        PendingCreate => "PENDING_CREATE",
        PendingUpdate => "PENDING_UPDATE",
        PendingDelete => "PENDING_DELETE",
        Error => "ERROR",
        Deleted => "DELETED",
    }
);

wire_enum!(
    /// Observed health of an entity
    OperatingStatus {
        Online => "ONLINE",
        Offline => "OFFLINE",
        Degraded => "DEGRADED",
        Error => "ERROR",
        NoMonitor => "NO_MONITOR",
    }
);

wire_enum!(
    Protocol {
        Http => "HTTP",
        Https => "HTTPS",
        Tcp => "TCP",
        TerminatedHttps => "TERMINATED_HTTPS",
    }
);

wire_enum!(
    LbAlgorithm {
        RoundRobin => "ROUND_ROBIN",
        LeastConnections => "LEAST_CONNECTIONS",
        SourceIp => "SOURCE_IP",
    }
);

wire_enum!(
    MonitorType {
        Ping => "PING",
        Tcp => "TCP",
        Http => "HTTP",
        Https => "HTTPS",
    }
);

wire_enum!(
    PersistenceType {
        SourceIp => "SOURCE_IP",
        HttpCookie => "HTTP_COOKIE",
        AppCookie => "APP_COOKIE",
    }
);

wire_enum!(
    L7Action {
        Reject => "REJECT",
        RedirectToUrl => "REDIRECT_TO_URL",
        RedirectToPool => "REDIRECT_TO_POOL",
    }
);

wire_enum!(
    L7RuleType {
        HostName => "HOST_NAME",
        Path => "PATH",
        FileType => "FILE_TYPE",
        Header => "HEADER",
        Cookie => "COOKIE",
    }
);

wire_enum!(
    L7CompareType {
        Regex => "REGEX",
        StartsWith => "STARTS_WITH",
        EndsWith => "ENDS_WITH",
        Contains => "CONTAINS",
        EqualTo => "EQUAL_TO",
    }
);

impl ProvisioningStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ProvisioningStatus::PendingCreate
                | ProvisioningStatus::PendingUpdate
                | ProvisioningStatus::PendingDelete
        )
    }
}

impl Default for ProvisioningStatus {
    fn default() -> Self {
        ProvisioningStatus::PendingCreate
    }
}

impl Default for OperatingStatus {
    fn default() -> Self {
        OperatingStatus::Offline
    }
}

impl Protocol {
    /// Whether the haproxy frontend/backend runs in http mode
    pub fn is_http_mode(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::TerminatedHttps)
    }
}
