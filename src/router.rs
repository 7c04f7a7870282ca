use crate::proxy_handler::ProxyConnector;
use dashmap::DashMap;
use std::{
    cmp::Reverse,
    fmt::Write as _,
    sync::{Arc, PoisonError, RwLock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingAction {
    Proxy,
    Direct,
    Block,
}

impl std::fmt::Display for RoutingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingAction::Proxy => write!(f, "PROXY"),
            RoutingAction::Direct => write!(f, "DIRECT"),
            RoutingAction::Block => write!(f, "BLOCK"),
        }
    }
}

/// A `host:port` glob with an action. Higher priority rules are consulted first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    pub id: String,
    pub pattern: String,
    pub action: RoutingAction,
    pub proxy_type: Option<String>,
    pub priority: i32,
}

impl RoutingRule {
    pub fn new(id: &str, pattern: &str, action: RoutingAction, priority: i32) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            action,
            proxy_type: None,
            priority,
        }
    }

    pub fn with_proxy_type(mut self, proxy_type: &str) -> Self {
        self.proxy_type = Some(proxy_type.to_string());
        self
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        match match_pattern(&self.pattern, host, port) {
            Ok(matched) => matched,
            Err(err) => {
                log::warn!("Routing rule {} has malformed pattern \"{}\": {err}", self.id, self.pattern);
                false
            }
        }
    }
}

impl std::fmt::Display for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {} -> {}", self.priority, self.id, self.pattern, self.action)?;
        if let Some(proxy_type) = &self.proxy_type {
            write!(f, " {proxy_type}")?;
        }
        Ok(())
    }
}

fn match_pattern(pattern: &str, host: &str, port: u16) -> Result<bool, String> {
    if pattern == "*:*" {
        return Ok(true);
    }
    let Some((host_pattern, port_pattern)) = pattern.split_once(':') else {
        return Err("expected host:port".into());
    };
    if port_pattern.contains(':') {
        return Err("expected host:port".into());
    }

    let port_matches = match port_pattern {
        "*" => true,
        p if p.bytes().all(|b| b.is_ascii_digit()) => p.parse::<u16>().map_err(|e| e.to_string())? == port,
        _ => false,
    };
    if !port_matches {
        return Ok(false);
    }

    let host_matches = if host_pattern == "*" {
        true
    } else if let Some(prefix) = host_pattern.strip_suffix('*') {
        host.starts_with(prefix)
    } else if let Some(suffix) = host_pattern.strip_prefix('*') {
        host.ends_with(suffix)
    } else {
        host_pattern == host
    };
    Ok(host_matches)
}

/// Decides per destination whether a flow is proxied, and through which connector.
pub struct ConnectionRouter {
    rules: DashMap<String, RoutingRule>,
    proxies: DashMap<String, Arc<dyn ProxyConnector>>,
    default_proxy: RwLock<Option<Arc<dyn ProxyConnector>>>,
}

impl Default for ConnectionRouter {
    fn default() -> Self {
        let router = Self::empty();
        for rule in default_rules() {
            router.add_rule(rule);
        }
        router
    }
}

pub fn default_rules() -> Vec<RoutingRule> {
    use RoutingAction::*;
    vec![
        RoutingRule::new("dns_direct", "*:53", Direct, 100),
        RoutingRule::new("local_direct", "127.*:*", Direct, 90),
        RoutingRule::new("local_10_direct", "10.*:*", Direct, 90),
        RoutingRule::new("local_192_direct", "192.168.*:*", Direct, 90),
        RoutingRule::new("https_proxy", "*:443", Proxy, 50).with_proxy_type("SOCKS5"),
        RoutingRule::new("http_proxy", "*:80", Proxy, 50).with_proxy_type("SOCKS5"),
        RoutingRule::new("default_proxy", "*:*", Proxy, 0).with_proxy_type("SOCKS5"),
    ]
}

impl ConnectionRouter {
    /// A router with no rules, which proxies everything.
    pub fn empty() -> Self {
        Self {
            rules: DashMap::new(),
            proxies: DashMap::new(),
            default_proxy: RwLock::new(None),
        }
    }

    pub fn add_rule(&self, rule: RoutingRule) {
        log::debug!("Added routing rule {rule}");
        self.rules.insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&self, id: &str) -> Option<RoutingRule> {
        let removed = self.rules.remove(id).map(|(_, rule)| rule);
        log::debug!("Removed routing rule {id}");
        removed
    }

    /// Snapshot of the rules, highest priority first.
    pub fn rules(&self) -> Vec<RoutingRule> {
        let mut rules: Vec<RoutingRule> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by(|a, b| (Reverse(a.priority), &a.id).cmp(&(Reverse(b.priority), &b.id)));
        rules
    }

    /// The action of the first matching rule, or `None` when nothing matches.
    pub fn decide(&self, host: &str, port: u16) -> Option<RoutingAction> {
        self.rules().into_iter().find(|r| r.matches(host, port)).map(|r| r.action)
    }

    pub fn should_proxy(&self, host: &str, port: u16) -> bool {
        matches!(self.decide(host, port), None | Some(RoutingAction::Proxy))
    }

    /// Picks a healthy connector for the destination, preferring the type
    /// named by the first matching proxy rule, then the default connector.
    pub fn get_proxy_for_connection(&self, host: &str, port: u16) -> Option<Arc<dyn ProxyConnector>> {
        if !self.should_proxy(host, port) {
            return None;
        }
        for rule in self.rules() {
            if rule.action != RoutingAction::Proxy || !rule.matches(host, port) {
                continue;
            }
            let Some(proxy_type) = &rule.proxy_type else {
                continue;
            };
            if let Some(proxy) = self.proxies.get(proxy_type).map(|p| p.value().clone()) {
                if proxy.is_healthy() {
                    log::trace!("Using proxy {proxy_type} for {host}:{port} (rule: {})", rule.id);
                    return Some(proxy);
                }
            }
        }
        self.default_proxy().filter(|p| p.is_healthy())
    }

    pub fn register_proxy(&self, proxy_type: &str, proxy: Arc<dyn ProxyConnector>) {
        self.proxies.insert(proxy_type.to_string(), proxy);
        log::debug!("Registered proxy {proxy_type}");
    }

    pub fn unregister_proxy(&self, proxy_type: &str) {
        self.proxies.remove(proxy_type);
        log::debug!("Unregistered proxy {proxy_type}");
    }

    pub fn set_default_proxy(&self, proxy: Arc<dyn ProxyConnector>) {
        log::debug!("Set default proxy {}", proxy.proxy_type());
        *self.default_proxy.write().unwrap_or_else(PoisonError::into_inner) = Some(proxy);
    }

    pub fn default_proxy(&self) -> Option<Arc<dyn ProxyConnector>> {
        self.default_proxy.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn routing_info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Connection Router Info ===");
        let _ = writeln!(out, "Registered proxies: {}", self.proxies.len());
        for entry in self.proxies.iter() {
            let _ = writeln!(out, "  {}: healthy={}", entry.key(), entry.value().is_healthy());
        }
        let default = self.default_proxy();
        let _ = writeln!(out, "Default proxy: {}", default.as_ref().map_or("None", |p| p.proxy_type()));
        let rules = self.rules();
        let _ = writeln!(out, "Routing rules: {}", rules.len());
        for rule in rules {
            let _ = writeln!(out, "  {rule}");
        }
        out
    }

    pub fn test_connection(&self, host: &str, port: u16) -> String {
        let proxy = self.get_proxy_for_connection(host, port);
        let mut out = String::new();
        let _ = writeln!(out, "=== Connection Test: {host}:{port} ===");
        let _ = writeln!(out, "Should proxy: {}", self.should_proxy(host, port));
        let _ = writeln!(out, "Selected proxy: {}", proxy.as_ref().map_or("Direct connection", |p| p.proxy_type()));
        let _ = writeln!(out, "Matching rules:");
        for rule in self.rules().into_iter().filter(|r| r.matches(host, port)) {
            let _ = writeln!(out, "  {rule}");
        }
        out
    }
}
