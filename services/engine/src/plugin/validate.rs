//! Payload checks run before an entity reaches a driver

use std::collections::HashSet;

use crate::driver::DriverCapabilities;
use crate::error::{LbaasError, Result};
use crate::model::{
    expand_expected_codes, HealthMonitor, L7Action, L7Policy, L7Rule, L7RuleType, Listener, LoadBalancer, Member,
    MonitorType, PersistenceType, Pool, Protocol,
};

pub trait Validate {
    fn validate(&self, caps: &DriverCapabilities) -> Result<()>;
}

fn bad(message: impl Into<String>) -> LbaasError {
    LbaasError::BadRequest(message.into())
}

impl Validate for Listener {
    fn validate(&self, caps: &DriverCapabilities) -> Result<()> {
        if self.protocol_port == 0 {
            return Err(bad("protocol_port must be between 1 and 65535"));
        }
        if self.connection_limit < -1 {
            return Err(bad("connection_limit must be -1 or non-negative"));
        }
        if self.protocol == Protocol::TerminatedHttps && self.default_tls_container_id.is_none() {
            return Err(bad("TERMINATED_HTTPS listeners need a default_tls_container_id"));
        }
        if self.protocol != Protocol::TerminatedHttps
            && (self.default_tls_container_id.is_some() || !self.sni_containers.is_empty())
        {
            return Err(bad("TLS containers are only valid on TERMINATED_HTTPS listeners"));
        }
        let mut positions = HashSet::new();
        for sni in &self.sni_containers {
            if !positions.insert(sni.position) {
                return Err(bad(format!("duplicate SNI position {}", sni.position)));
            }
        }
        for policy in &self.l7_policies {
            policy.validate(caps)?;
        }
        Ok(())
    }
}

impl Validate for Pool {
    fn validate(&self, caps: &DriverCapabilities) -> Result<()> {
        if let Some(sp) = &self.session_persistence {
            match (sp.persistence_type, &sp.cookie_name) {
                (PersistenceType::AppCookie, None) => {
                    return Err(bad("APP_COOKIE session persistence requires cookie_name"));
                }
                (PersistenceType::AppCookie, Some(name)) if name.trim().is_empty() => {
                    return Err(bad("APP_COOKIE session persistence requires cookie_name"));
                }
                (PersistenceType::SourceIp | PersistenceType::HttpCookie, Some(_)) => {
                    return Err(bad(format!(
                        "cookie_name is only valid with APP_COOKIE, not {}",
                        sp.persistence_type
                    )));
                }
                _ => {}
            }
        }
        for member in &self.members {
            member.validate(caps)?;
        }
        if let Some(hm) = &self.healthmonitor {
            hm.validate(caps)?;
        }
        Ok(())
    }
}

impl Validate for Member {
    fn validate(&self, _caps: &DriverCapabilities) -> Result<()> {
        if self.protocol_port == 0 {
            return Err(bad("protocol_port must be between 1 and 65535"));
        }
        if !(1..=256).contains(&self.weight) {
            return Err(bad(format!("member weight {} outside 1..256", self.weight)));
        }
        if self.address.parse::<std::net::IpAddr>().is_err() {
            return Err(bad(format!("invalid member address {}", self.address)));
        }
        Ok(())
    }
}

impl Validate for HealthMonitor {
    fn validate(&self, caps: &DriverCapabilities) -> Result<()> {
        if !(1..=10).contains(&self.max_retries) {
            return Err(bad("max_retries must be between 1 and 10"));
        }
        if self.delay == 0 {
            return Err(bad("delay must be positive"));
        }
        if let Some(down) = self.max_retries_down {
            if !caps.allows_healthmonitor_thresholds {
                return Err(bad("provider does not support max_retries_down"));
            }
            if !(1..=10).contains(&down) {
                return Err(bad("max_retries_down must be between 1 and 10"));
            }
        }
        let is_http = matches!(self.monitor_type, MonitorType::Http | MonitorType::Https);
        if !is_http
            && (self.http_method.is_some() || self.url_path.is_some() || self.expected_codes.is_some())
        {
            return Err(bad(format!(
                "http_method, url_path and expected_codes need an HTTP(S) monitor, not {}",
                self.monitor_type
            )));
        }
        if let Some(path) = &self.url_path {
            if !path.starts_with('/') {
                return Err(bad(format!("url_path {} must start with /", path)));
            }
        }
        if let Some(codes) = &self.expected_codes {
            expand_expected_codes(codes)?;
        }
        Ok(())
    }
}

impl Validate for L7Policy {
    fn validate(&self, caps: &DriverCapabilities) -> Result<()> {
        let ok = match self.action {
            L7Action::RedirectToPool => {
                self.redirect_pool_id.is_some() && self.redirect_url.is_none()
            }
            L7Action::RedirectToUrl => {
                self.redirect_url.is_some() && self.redirect_pool_id.is_none()
            }
            L7Action::Reject => self.redirect_pool_id.is_none() && self.redirect_url.is_none(),
        };
        if !ok {
            return Err(bad(format!(
                "redirect_pool_id and redirect_url do not match action {}",
                self.action
            )));
        }
        for rule in &self.rules {
            rule.validate(caps)?;
        }
        Ok(())
    }
}

impl Validate for L7Rule {
    fn validate(&self, _caps: &DriverCapabilities) -> Result<()> {
        if matches!(self.rule_type, L7RuleType::Header | L7RuleType::Cookie)
            && self.key.as_deref().map_or(true, |k| k.trim().is_empty())
        {
            return Err(bad(format!("{} rules require a key", self.rule_type)));
        }
        if self.value.trim().is_empty() {
            return Err(bad("l7 rule value must not be empty"));
        }
        Ok(())
    }
}

impl Validate for LoadBalancer {
    fn validate(&self, caps: &DriverCapabilities) -> Result<()> {
        let has_children = !self.listeners.is_empty() || !self.pools.is_empty();
        if has_children && !caps.allows_create_graph {
            return Err(bad("provider does not support creating a load balancer graph"));
        }
        if let Some(vip) = &self.vip_address {
            if vip.parse::<std::net::IpAddr>().is_err() {
                return Err(bad(format!("invalid vip_address {}", vip)));
            }
        }
        for listener in &self.listeners {
            listener.validate(caps)?;
        }
        for pool in &self.pools {
            pool.validate(caps)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{fixtures, SessionPersistence};

    fn caps() -> DriverCapabilities {
        DriverCapabilities::default()
    }

    #[test]
    fn test_expected_codes_expansion() {
        assert_eq!(expand_expected_codes("200").unwrap(), vec![200]);
        assert_eq!(expand_expected_codes("200-203").unwrap(), vec![200, 201, 202, 203]);
        assert_eq!(expand_expected_codes("200,202").unwrap(), vec![200, 202]);
        assert_eq!(expand_expected_codes("405|404|500").unwrap(), vec![405, 404, 500]);
        assert_eq!(expand_expected_codes("200|200-201").unwrap(), vec![200, 201]);
        assert!(expand_expected_codes("abc").is_err());
        assert!(expand_expected_codes("204-200").is_err());
        assert!(expand_expected_codes("").is_err());
    }

    #[test]
    fn test_app_cookie_requires_cookie_name() {
        let mut pool = fixtures::pool();
        pool.session_persistence = Some(SessionPersistence {
            persistence_type: PersistenceType::AppCookie,
            cookie_name: None,
        });
        assert!(matches!(pool.validate(&caps()), Err(LbaasError::BadRequest(_))));

        pool.session_persistence = Some(SessionPersistence {
            persistence_type: PersistenceType::AppCookie,
            cookie_name: Some("JSESSIONID".into()),
        });
        pool.validate(&caps()).unwrap();
    }

    #[test]
    fn test_l7_action_fields() {
        let mut policy = L7Policy::new("p", "lb", "l", L7Action::RedirectToPool, 1);
        assert!(policy.validate(&caps()).is_err());
        policy.redirect_pool_id = Some("pool".into());
        policy.validate(&caps()).unwrap();
        policy.redirect_url = Some("http://x".into());
        assert!(policy.validate(&caps()).is_err());

        let mut reject = L7Policy::new("r", "lb", "l", L7Action::Reject, 1);
        reject.validate(&caps()).unwrap();
        reject.redirect_url = Some("http://x".into());
        assert!(reject.validate(&caps()).is_err());
    }

    #[test]
    fn test_thresholds_need_capability() {
        let mut hm = fixtures::health_monitor();
        hm.max_retries_down = Some(3);
        assert!(hm.validate(&caps()).is_err());
        let thresholds = DriverCapabilities {
            allows_healthmonitor_thresholds: true,
            ..Default::default()
        };
        hm.validate(&thresholds).unwrap();
    }

    #[test]
    fn test_timeout_above_delay_is_accepted() {
        // delay=30 timeout=31 is a valid monitor
        fixtures::health_monitor().validate(&caps()).unwrap();
    }

    #[test]
    fn test_member_weight_bounds() {
        let mut member = fixtures::member("m", "10.0.0.1");
        member.weight = 0;
        assert!(member.validate(&caps()).is_err());
        member.weight = 257;
        assert!(member.validate(&caps()).is_err());
        member.weight = 256;
        member.validate(&caps()).unwrap();
    }

    #[test]
    fn test_graph_needs_capability() {
        let lb = fixtures::loadbalancer();
        assert!(lb.validate(&caps()).is_err());
        let graph = DriverCapabilities {
            allows_create_graph: true,
            ..Default::default()
        };
        lb.validate(&graph).unwrap();
        fixtures::bare_loadbalancer().validate(&caps()).unwrap();
    }
}
