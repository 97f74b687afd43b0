use anyhow::Context;
use cidr::IpCidr;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::backends::HdrDeliveryAddress;

/// Daemon settings, loaded from a TOML file. Every field has a usable
/// default so that a bare `lmtpd` serves local deliveries out of the
/// box.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// The name we greet with and stamp into trace headers
    #[serde(default = "Settings::default_hostname")]
    pub hostname: String,

    /// `ip:port` to listen on, or an absolute path for a unix socket
    #[serde(default = "Settings::default_listen")]
    pub listen: String,

    #[serde(default)]
    pub tls: Option<TlsSettings>,

    /// Networks allowed to use XCLIENT
    #[serde(default)]
    pub trusted_networks: Vec<IpCidr>,

    /// Characters that separate the mailbox detail from the username
    #[serde(default = "Settings::default_recipient_delimiter")]
    pub recipient_delimiter: String,

    /// When set, RCPT performs a directory lookup that may route the
    /// recipient to a remote backend
    #[serde(default)]
    pub proxy: bool,

    /// Maximum concurrent deliveries per user; 0 disables the
    /// concurrency registry lookup
    #[serde(default)]
    pub user_concurrency_limit: u64,

    /// Socket of the concurrency registry; required when
    /// `user_concurrency_limit` is non-zero
    #[serde(default)]
    pub concurrency_socket: Option<PathBuf>,

    /// Hop budget for proxied deliveries
    #[serde(default = "Settings::default_proxy_ttl")]
    pub proxy_ttl: u32,

    /// Where we chdir back to after privileged delivery
    #[serde(default = "Settings::default_base_dir")]
    pub base_dir: PathBuf,

    /// Spill directory for oversized message payloads
    #[serde(default = "std::env::temp_dir")]
    pub temp_dir: PathBuf,

    /// Root under which per-user maildirs are created
    #[serde(default = "Settings::default_mail_root")]
    pub mail_root: PathBuf,

    #[serde(default = "Settings::default_login_greeting")]
    pub login_greeting: String,

    #[serde(default = "Settings::default_service_name")]
    pub service_name: String,

    /// Which address the `Delivered-To:` header records
    #[serde(default)]
    pub hdr_delivery_address: HdrDeliveryAddress,

    /// Seconds a client may stay idle between commands
    #[serde(default = "Settings::default_client_idle_timeout_secs")]
    pub client_idle_timeout_secs: u64,

    /// Known local users; when absent, every username is accepted
    #[serde(default)]
    pub users: Option<Vec<String>>,

    /// Directory records keyed by username. Each value is a
    /// space-separated list of `key` / `key=value` fields, e.g.
    /// `"proxy host=backend.example.com port=24"`
    #[serde(default)]
    pub passdb: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hostname: Self::default_hostname(),
            listen: Self::default_listen(),
            tls: None,
            trusted_networks: vec![],
            recipient_delimiter: Self::default_recipient_delimiter(),
            proxy: false,
            user_concurrency_limit: 0,
            concurrency_socket: None,
            proxy_ttl: Self::default_proxy_ttl(),
            base_dir: Self::default_base_dir(),
            temp_dir: std::env::temp_dir(),
            mail_root: Self::default_mail_root(),
            login_greeting: Self::default_login_greeting(),
            service_name: Self::default_service_name(),
            hdr_delivery_address: HdrDeliveryAddress::default(),
            client_idle_timeout_secs: Self::default_client_idle_timeout_secs(),
            users: None,
            passdb: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("parsing settings from {}", path.display()))
    }

    pub fn is_trusted(&self, ip: Option<IpAddr>) -> bool {
        match ip {
            Some(ip) => self.trusted_networks.iter().any(|net| net.contains(&ip)),
            // unix socket connections are implicitly local
            None => true,
        }
    }

    fn default_hostname() -> String {
        nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    fn default_listen() -> String {
        "0.0.0.0:24".to_string()
    }

    fn default_recipient_delimiter() -> String {
        "+".to_string()
    }

    fn default_proxy_ttl() -> u32 {
        5
    }

    fn default_base_dir() -> PathBuf {
        "/var/run/lmtpd".into()
    }

    fn default_mail_root() -> PathBuf {
        "/var/mail".into()
    }

    fn default_login_greeting() -> String {
        "LMTPD ready.".to_string()
    }

    fn default_service_name() -> String {
        "lmtp".to_string()
    }

    fn default_client_idle_timeout_secs() -> u64 {
        180
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.recipient_delimiter, "+");
        assert_eq!(settings.proxy_ttl, 5);
        assert!(!settings.proxy);
        assert!(settings.users.is_none());
    }

    #[test]
    fn trusted_networks() {
        let settings: Settings = toml::from_str(
            r#"
            trusted_networks = ["10.0.0.0/8", "::1/128"]
            "#,
        )
        .unwrap();
        assert!(settings.is_trusted(Some("10.1.2.3".parse().unwrap())));
        assert!(settings.is_trusted(Some("::1".parse().unwrap())));
        assert!(!settings.is_trusted(Some("192.168.1.1".parse().unwrap())));
        assert!(settings.is_trusted(None));
    }

    #[test]
    fn passdb_table() {
        let settings: Settings = toml::from_str(
            r#"
            proxy = true
            [passdb]
            joe = "proxy host=backend.example.com"
            "#,
        )
        .unwrap();
        assert!(settings.proxy);
        assert_eq!(
            settings.passdb.get("joe").map(String::as_str),
            Some("proxy host=backend.example.com")
        );
    }
}
