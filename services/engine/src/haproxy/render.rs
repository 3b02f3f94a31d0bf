//! HAProxy configuration rendering
//!
//! A pure function of the frozen LB graph and a few host paths. No I/O
//! happens here; TLS material is expected at the paths [`pem_path`]
//! returns by the time the config is loaded.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::model::{
    expand_expected_codes, HealthMonitor, L7Action, L7CompareType, L7Policy, L7Rule, L7RuleType,
    LbAlgorithm, Listener, LoadBalancer, MonitorType, PersistenceType, Pool, Protocol,
    ProvisioningStatus,
};

const INDENT: &str = "    ";

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub user_group: String,
    pub stats_socket: PathBuf,
    /// Per-LB directory holding `<listener_id>/<container>.pem`
    pub lb_dir: PathBuf,
}

/// File name a TLS container is materialized under
pub fn pem_file_name(container_ref: &str) -> String {
    let base: String = container_ref
        .rsplit('/')
        .next()
        .unwrap_or(container_ref)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}.pem", base)
}

pub fn pem_path(lb_dir: &Path, listener_id: &str, container_ref: &str) -> PathBuf {
    lb_dir.join(listener_id).join(pem_file_name(container_ref))
}

fn live(admin_state_up: bool, status: ProvisioningStatus) -> bool {
    admin_state_up && status != ProvisioningStatus::PendingDelete
}

fn mode(protocol: Protocol) -> &'static str {
    if protocol.is_http_mode() {
        "http"
    } else {
        "tcp"
    }
}

fn balance(algorithm: LbAlgorithm) -> &'static str {
    match algorithm {
        LbAlgorithm::RoundRobin => "roundrobin",
        LbAlgorithm::LeastConnections => "leastconn",
        LbAlgorithm::SourceIp => "source",
    }
}

fn compare(compare_type: L7CompareType) -> &'static str {
    match compare_type {
        L7CompareType::Regex => "reg",
        L7CompareType::StartsWith => "beg",
        L7CompareType::EndsWith => "end",
        L7CompareType::Contains => "sub",
        L7CompareType::EqualTo => "str",
    }
}

fn escape(value: &str) -> String {
    value.replace(' ', "\\ ")
}

fn acl_condition(rule: &L7Rule) -> String {
    let cmp = compare(rule.compare_type);
    let value = escape(&rule.value);
    let key = rule.key.as_deref().unwrap_or_default();
    match rule.rule_type {
        L7RuleType::HostName => format!("req.hdr(host) -i -m {} {}", cmp, value),
        L7RuleType::Path => format!("path -m {} {}", cmp, value),
        L7RuleType::FileType => format!("path_end -m {} {}", cmp, value),
        L7RuleType::Header => format!("req.hdr({}) -m {} {}", key, cmp, value),
        L7RuleType::Cookie => format!("req.cook({}) -m {} {}", key, cmp, value),
    }
}

fn policy_lines(lb: &LoadBalancer, policy: &L7Policy, out: &mut Vec<String>) {
    let rules: Vec<&L7Rule> = policy
        .rules
        .iter()
        .filter(|r| live(r.admin_state_up, r.provisioning_status))
        .collect();
    if rules.is_empty() {
        return;
    }
    let action = match policy.action {
        L7Action::Reject => "http-request deny".to_string(),
        L7Action::RedirectToUrl => match &policy.redirect_url {
            Some(url) => format!("redirect location {}", url),
            None => return,
        },
        L7Action::RedirectToPool => match policy
            .redirect_pool_id
            .as_deref()
            .and_then(|id| lb.pool(id))
            .filter(|p| live(p.admin_state_up, p.provisioning_status))
        {
            Some(pool) => format!("use_backend {}", pool.id),
            None => return,
        },
    };

    let mut refs = Vec::with_capacity(rules.len());
    for rule in rules {
        out.push(format!("acl {} {}", rule.id, acl_condition(rule)));
        refs.push(if rule.invert {
            format!("!{}", rule.id)
        } else {
            rule.id.clone()
        });
    }
    out.push(format!("{} if {}", action, refs.join(" ")));
}

fn frontend(lb: &LoadBalancer, listener: &Listener, opts: &RenderOptions) -> Vec<String> {
    let vip = lb.vip_address.as_deref().unwrap_or("0.0.0.0");
    let mut lines = vec![format!("frontend {}", listener.id)];
    let mut body = vec!["option tcplog".to_string()];
    if listener.connection_limit >= 0 {
        body.push(format!("maxconn {}", listener.connection_limit));
    }
    if listener.protocol.is_http_mode() {
        body.push("option forwardfor".to_string());
    }

    let mut bind = format!("bind {}:{}", vip, listener.protocol_port);
    if listener.protocol == Protocol::TerminatedHttps {
        if listener.default_tls_container_id.is_some() {
            // default first, then one entry per SNI container by position
            let certs: Vec<String> = listener
                .tls_container_ids()
                .iter()
                .map(|c| format!("crt {}", pem_path(&opts.lb_dir, &listener.id, c).display()))
                .collect();
            bind.push_str(&format!(" ssl {}", certs.join(" ")));
        }
    }
    body.push(bind);
    body.push(format!("mode {}", mode(listener.protocol)));

    if listener.protocol.is_http_mode() {
        let mut policies: Vec<&L7Policy> = listener
            .l7_policies
            .iter()
            .filter(|p| live(p.admin_state_up, p.provisioning_status))
            .collect();
        policies.sort_by_key(|p| p.position);
        for policy in policies {
            policy_lines(lb, policy, &mut body);
        }
    }

    if let Some(pool) = lb
        .default_pool(listener)
        .filter(|p| live(p.admin_state_up, p.provisioning_status))
    {
        body.push(format!("default_backend {}", pool.id));
    }
    lines.extend(body.into_iter().map(|l| format!("{}{}", INDENT, l)));
    lines
}

fn monitor_lines(hm: &HealthMonitor, body: &mut Vec<String>) -> Result<()> {
    body.push(format!("timeout check {}", hm.timeout));
    if matches!(hm.monitor_type, MonitorType::Http | MonitorType::Https) {
        body.push(format!(
            "option httpchk {} {}",
            hm.http_method.as_deref().unwrap_or("GET"),
            hm.url_path.as_deref().unwrap_or("/")
        ));
        let codes = expand_expected_codes(hm.expected_codes.as_deref().unwrap_or("200"))?;
        let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
        body.push(format!("http-check expect rstatus {}", codes.join("|")));
    }
    if hm.monitor_type == MonitorType::Https {
        body.push("option ssl-hello-chk".to_string());
    }
    Ok(())
}

fn backend(pool: &Pool) -> Result<Vec<String>> {
    let mut lines = vec![format!("backend {}", pool.id)];
    let mut body = vec![
        format!("mode {}", mode(pool.protocol)),
        format!("balance {}", balance(pool.lb_algorithm)),
    ];

    let persistence = pool.session_persistence.as_ref();
    match persistence.map(|sp| (sp.persistence_type, sp.cookie_name.as_deref())) {
        Some((PersistenceType::SourceIp, _)) => {
            body.push("stick-table type ip size 10k".to_string());
            body.push("stick on src".to_string());
        }
        Some((PersistenceType::HttpCookie, _)) => {
            body.push("cookie SRV insert indirect nocache".to_string());
        }
        Some((PersistenceType::AppCookie, Some(name))) => {
            body.push(format!("appsession {} len 56 timeout 3h", name));
        }
        _ => {}
    }

    let monitor = pool
        .healthmonitor
        .as_ref()
        .filter(|hm| live(hm.admin_state_up, hm.provisioning_status));
    if let Some(hm) = monitor {
        monitor_lines(hm, &mut body)?;
    }

    let cookie = matches!(
        persistence.map(|sp| sp.persistence_type),
        Some(PersistenceType::HttpCookie)
    );
    for member in pool
        .members
        .iter()
        .filter(|m| live(m.admin_state_up, m.provisioning_status))
    {
        let mut server = format!(
            "server {} {}:{} weight {}",
            member.id, member.address, member.protocol_port, member.weight
        );
        if let Some(hm) = monitor {
            server.push_str(&format!(" check inter {}s fall {}", hm.delay, hm.max_retries));
        }
        if cookie {
            server.push_str(&format!(" cookie {}", member.id));
        }
        body.push(server);
    }

    lines.extend(body.into_iter().map(|l| format!("{}{}", INDENT, l)));
    Ok(lines)
}

/// Render the complete haproxy.cfg for `lb`
pub fn render_config(lb: &LoadBalancer, opts: &RenderOptions) -> Result<String> {
    let mut blocks: Vec<Vec<String>> = Vec::new();

    let label = if lb.name.is_empty() { &lb.id } else { &lb.name };
    blocks.push(vec![
        format!("# Configuration for {}", label),
        "global".to_string(),
        format!("{}daemon", INDENT),
        format!("{}user nobody", INDENT),
        format!("{}group {}", INDENT, opts.user_group),
        format!("{}log /dev/log local0", INDENT),
        format!("{}log /dev/log local1 notice", INDENT),
        format!(
            "{}stats socket {} mode 0666 level user",
            INDENT,
            opts.stats_socket.display()
        ),
    ]);
    blocks.push(
        [
            "defaults",
            "log global",
            "retries 3",
            "option redispatch",
            "timeout connect 5000",
            "timeout client 50000",
            "timeout server 50000",
        ]
        .iter()
        .enumerate()
        .map(|(i, l)| if i == 0 { l.to_string() } else { format!("{}{}", INDENT, l) })
        .collect(),
    );

    for listener in lb
        .listeners
        .iter()
        .filter(|l| live(l.admin_state_up, l.provisioning_status))
    {
        blocks.push(frontend(lb, listener, opts));
    }
    for pool in lb
        .pools
        .iter()
        .filter(|p| live(p.admin_state_up, p.provisioning_status))
    {
        blocks.push(backend(pool)?);
    }

    let mut text = blocks
        .into_iter()
        .map(|b| b.join("\n"))
        .collect::<Vec<_>>()
        .join("\n\n");
    text.push('\n');
    Ok(text)
}
