//! Dark-mode host set.
//!
//! # Responsibilities
//! - Mark hosts as temporarily unavailable and clear them again
//! - Answer whether a request's target host or a connector's address is dark
//!
//! Hosts are compared in normalized form: lower case, port stripped, and
//! every loopback spelling folded to `127.0.0.1`.

use std::net::IpAddr;

use dashmap::DashSet;

#[derive(Debug, Default)]
pub struct DarkModeManager {
    hosts: DashSet<String>,
}

impl DarkModeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let manager = Self::new();
        for host in hosts {
            manager.enable(host.as_ref());
        }
        manager
    }

    /// Returns true if the host was not already dark.
    pub fn enable(&self, host: &str) -> bool {
        let added = self.hosts.insert(normalize(host));
        if added {
            tracing::info!(host = %host, "Dark mode enabled");
        }
        added
    }

    /// Returns true if the host was dark.
    pub fn disable(&self, host: &str) -> bool {
        let removed = self.hosts.remove(&normalize(host)).is_some();
        if removed {
            tracing::info!(host = %host, "Dark mode disabled");
        }
        removed
    }

    pub fn is_dark(&self, host: &str) -> bool {
        !self.hosts.is_empty() && self.hosts.contains(&normalize(host))
    }

    pub fn is_dark_ip(&self, ip: IpAddr) -> bool {
        self.is_dark(&ip.to_canonical().to_string())
    }

    /// Sorted snapshot of dark hosts.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.hosts.iter().map(|h| h.key().clone()).collect();
        hosts.sort();
        hosts
    }

    pub fn clear(&self) {
        self.hosts.clear();
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn normalize(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    let bare = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest).to_string()
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(&host).to_string()
    } else {
        host
    };

    if bare == "localhost" {
        return "127.0.0.1".to_string();
    }
    match bare.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => "127.0.0.1".to_string(),
        Ok(ip) => ip.to_canonical().to_string(),
        Err(_) => bare,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_disable() {
        let dark = DarkModeManager::new();
        assert!(dark.enable("api.example.org"));
        assert!(!dark.enable("API.example.org"));
        assert!(dark.is_dark("api.example.org:8443"));
        assert_eq!(dark.hosts(), vec!["api.example.org".to_string()]);

        assert!(dark.disable("api.example.org"));
        assert!(!dark.disable("api.example.org"));
        assert!(dark.is_empty());
    }

    #[test]
    fn test_loopback_spellings_are_one_host() {
        let dark = DarkModeManager::with_hosts(["localhost"]);
        assert!(dark.is_dark("127.0.0.1:8080"));
        assert!(dark.is_dark("[::1]:8080"));
        assert!(dark.is_dark_ip("::1".parse().unwrap()));
    }

    #[test]
    fn test_connector_ip_match() {
        let dark = DarkModeManager::with_hosts(["10.0.0.7"]);
        assert!(dark.is_dark_ip("10.0.0.7".parse().unwrap()));
        assert!(dark.is_dark_ip("::ffff:10.0.0.7".parse().unwrap()));
        assert!(!dark.is_dark_ip("10.0.0.8".parse().unwrap()));

        dark.clear();
        assert_eq!(dark.len(), 0);
    }
}
