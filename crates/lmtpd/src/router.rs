use crate::backends::PassdbResult;
use crate::lmtp_server::{LmtpServer, Recipient, Routing};
use crate::proxy::{ProxyProtocol, ProxyRcptSettings, ProxySession, ProxySettings};
use anyhow::Context;
use rfc2033::{RcptParams, SmtpAddress};
use std::time::Duration;

impl LmtpServer {
    /// The proxy half of RCPT routing. Returns true when the
    /// recipient was handled here (a reply has been written), false
    /// to fall through to the local path.
    pub(crate) async fn proxy_rcpt(
        &mut self,
        address: &SmtpAddress,
        username: &str,
        delim: Option<char>,
        detail: &str,
        params: &RcptParams,
    ) -> anyhow::Result<bool> {
        let info = self.connection_info(&self.session_id.clone());
        let fields = match self.backends.directory.pass_lookup(username, &info).await {
            PassdbResult::Failed(reason) => {
                let reason =
                    reason.unwrap_or_else(|| "Temporary user lookup failure".to_string());
                self.write_line(&format!("451 4.3.0 <{}> {reason}", address.encode()))
                    .await?;
                return Ok(true);
            }
            // not known to the directory; the storage service decides
            PassdbResult::NotFound => return Ok(false),
            PassdbResult::Found(fields) => fields,
        };

        let mut set = ProxyRcptSettings::new(self.local_port, params.clone());
        let mut effective_username = username.to_string();
        let proxying = match parse_proxy_fields(&fields, &mut set, &mut effective_username) {
            Ok(proxying) => proxying,
            Err(err) => {
                tracing::error!("proxy: {err:#}");
                self.write_line(&format!(
                    "501 5.3.0 <{}> Invalid proxy configuration",
                    address.encode()
                ))
                .await?;
                return Ok(true);
            }
        };
        if !proxying {
            return Ok(false);
        }

        let mut address = address.clone();
        if effective_username != username {
            match rfc2033::parse_username(&effective_username) {
                Err(err) => {
                    tracing::error!(
                        "{username}: Username `{effective_username}' returned by \
                         passdb lookup is not a valid SMTP address: {err}"
                    );
                    self.write_line(&format!(
                        "550 5.3.5 <{}> Internal user lookup failure",
                        address.encode()
                    ))
                    .await?;
                    return Ok(true);
                }
                Ok(user) => {
                    // username changed; change the address as well
                    address = if detail.is_empty() {
                        user
                    } else {
                        user.with_detail(detail, delim.unwrap_or('+'))
                    };
                }
            }
        }

        if self.proxy_is_ourself(&set) {
            tracing::error!("Proxying to <{effective_username}> loops to itself");
            self.write_line(&format!(
                "554 5.4.6 <{}> Proxying loops to itself",
                address.encode()
            ))
            .await?;
            return Ok(true);
        }
        if self.proxy_ttl <= 1 {
            tracing::error!(
                "Proxying to <{effective_username}> appears to be looping (TTL=0)"
            );
            self.write_line(&format!(
                "554 5.4.6 <{}> Proxying appears to be looping (TTL=0)",
                address.encode()
            ))
            .await?;
            return Ok(true);
        }
        let has_local = self
            .state
            .as_ref()
            .map(|state| state.rcpts.iter().any(|r| r.routing == Routing::Local))
            .unwrap_or(false);
        if has_local {
            self.write_line(&format!(
                "451 4.3.0 <{}> Can't handle mixed proxy/non-proxy destinations",
                address.encode()
            ))
            .await?;
            return Ok(true);
        }

        if self.proxy.is_none() {
            let mut proxy = ProxySession::new(ProxySettings {
                my_hostname: self.settings.hostname.clone(),
                session_id: self.session_id.clone(),
                source_ip: self.remote_ip,
                source_port: self.remote_port,
                proxy_ttl: self.proxy_ttl - 1,
                proxy_timeout_secs: self.proxy_timeout_secs,
            });
            if let Some(state) = &self.state {
                proxy.mail_from(&state.sender, &state.params);
            }
            self.proxy = Some(proxy);
        }

        let session_id = self.next_rcpt_session_id();
        let proxy = self.proxy.as_mut().context("proxy session created above")?;
        match proxy.add_rcpt(address.clone(), set).await {
            Err(err) => {
                tracing::warn!(
                    "proxy: connecting for <{}> failed: {err:#}",
                    address.encode()
                );
                // a proxy session may only outlive this command with
                // at least one accepted recipient in it
                if proxy.rcpt_count() == 0 {
                    if let Some(mut proxy) = self.proxy.take() {
                        proxy.deinit().await;
                    }
                }
                self.write_line("451 4.4.0 Remote server not answering")
                    .await?;
            }
            Ok(()) => {
                let rcpt = Recipient {
                    address,
                    detail: detail.to_string(),
                    params: params.clone(),
                    session_id,
                    routing: Routing::Proxy,
                    user: None,
                };
                self.state
                    .as_mut()
                    .context("envelope exists for RCPT")?
                    .rcpts
                    .push(rcpt);
                self.write_line("250 2.1.5 OK").await?;
            }
        }
        Ok(true)
    }

    fn proxy_is_ourself(&self, set: &ProxyRcptSettings) -> bool {
        if set.port != self.local_port {
            return false;
        }
        let ip = match set.hostip {
            Some(ip) => Some(ip),
            None => set.host.parse().ok(),
        };
        match (ip, self.local_ip) {
            (Some(target), Some(local)) => target == local,
            _ => false,
        }
    }
}

/// Interpret passdb fields. Returns whether the record asks for
/// proxying; recognized keys adjust `set` and `username`, unknown
/// keys are ignored.
pub(crate) fn parse_proxy_fields(
    fields: &[(String, String)],
    set: &mut ProxyRcptSettings,
    username: &mut String,
) -> anyhow::Result<bool> {
    let mut proxying = false;
    let mut port_set = false;
    for (key, value) in fields {
        match key.as_str() {
            "proxy" => proxying = true,
            "host" => set.host = value.clone(),
            "hostip" => {
                set.hostip = Some(
                    value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("Invalid hostip {value}"))?,
                );
            }
            "port" => {
                set.port = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid port number {value}"))?;
                port_set = true;
            }
            "proxy_timeout" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid proxy_timeout value {value}"))?;
                set.timeout = Duration::from_secs(secs);
            }
            "protocol" => match value.as_str() {
                "lmtp" => {
                    set.protocol = ProxyProtocol::Lmtp;
                    if !port_set {
                        set.port = ProxyProtocol::Lmtp.default_port();
                    }
                }
                "smtp" => {
                    set.protocol = ProxyProtocol::Smtp;
                    if !port_set {
                        set.port = ProxyProtocol::Smtp.default_port();
                    }
                }
                _ => anyhow::bail!("Unknown protocol {value}"),
            },
            "user" | "destuser" => *username = value.clone(),
            _ => {}
        }
    }
    if proxying && set.host.is_empty() {
        anyhow::bail!("host not given");
    }
    Ok(proxying)
}

/// The escaping the concurrency registry protocol uses for usernames
/// embedded in tab-separated queries.
pub(crate) fn tabescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\u{1}' => out.push_str("\u{1}1"),
            '\t' => out.push_str("\u{1}t"),
            '\n' => out.push_str("\u{1}n"),
            '\r' => out.push_str("\u{1}r"),
            c => out.push(c),
        }
    }
    out
}
