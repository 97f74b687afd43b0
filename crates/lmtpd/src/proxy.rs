use crate::payload::ComposedMail;
use rfc2033::{ClientError, LmtpClient, MailParams, RcptParams, Response, SmtpAddress};
use std::net::IpAddr;
use std::time::Duration;

pub const LMTP_PROXY_DEFAULT_TIMEOUT_MSECS: u64 = 125_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    Lmtp,
    Smtp,
}

impl ProxyProtocol {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Lmtp => 24,
            Self::Smtp => 25,
        }
    }
}

/// Where and how one recipient is relayed, as interpreted from its
/// passdb fields.
#[derive(Debug, Clone)]
pub struct ProxyRcptSettings {
    pub host: String,
    pub hostip: Option<IpAddr>,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub timeout: Duration,
    pub params: RcptParams,
}

impl ProxyRcptSettings {
    pub fn new(local_port: u16, params: RcptParams) -> Self {
        Self {
            host: String::new(),
            hostip: None,
            port: local_port,
            protocol: ProxyProtocol::Lmtp,
            timeout: Duration::from_millis(LMTP_PROXY_DEFAULT_TIMEOUT_MSECS),
            params,
        }
    }
}

/// Identity the proxy presents upstream. `proxy_ttl` is already
/// decremented from the inbound value.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub my_hostname: String,
    pub session_id: String,
    pub source_ip: Option<IpAddr>,
    pub source_port: u16,
    pub proxy_ttl: u32,
    pub proxy_timeout_secs: u32,
}

struct ProxyConnection {
    host: String,
    port: u16,
    protocol: ProxyProtocol,
    client: LmtpClient,
    failure: Option<Response>,
}

struct ProxyRcpt {
    address: SmtpAddress,
    params: RcptParams,
    conn: usize,
    accepted: bool,
    reply: Option<Response>,
}

/// Relays the envelope to one or more upstream backends and collects
/// one status per recipient after DATA. Connections are keyed by
/// `(host, port, protocol)` so several recipients on the same backend
/// share a conversation.
pub struct ProxySession {
    set: ProxySettings,
    mail_from: String,
    connections: Vec<ProxyConnection>,
    rcpts: Vec<ProxyRcpt>,
}

fn not_answering() -> Response {
    Response {
        code: 451,
        enhanced_code: Some(rfc2033::EnhancedStatusCode {
            class: 4,
            subject: 4,
            detail: 0,
        }),
        content: "Remote server not answering".to_string(),
        command: None,
    }
}

impl ProxySession {
    pub fn new(set: ProxySettings) -> Self {
        Self {
            set,
            mail_from: "MAIL FROM:<>".to_string(),
            connections: vec![],
            rcpts: vec![],
        }
    }

    pub fn rcpt_count(&self) -> usize {
        self.rcpts.len()
    }

    /// Record the envelope sender; replayed on every upstream
    /// connection as it is established.
    pub fn mail_from(&mut self, sender: &SmtpAddress, params: &MailParams) {
        self.mail_from = format!("MAIL FROM:<{}>{}", sender.encode(), params.encode());
    }

    /// Establish (or reuse) the upstream connection for this
    /// recipient and record it for relay. A synchronous failure here
    /// refuses the RCPT; upstream verdicts arrive after DATA.
    pub async fn add_rcpt(
        &mut self,
        address: SmtpAddress,
        set: ProxyRcptSettings,
    ) -> Result<(), ClientError> {
        let existing = self.connections.iter().position(|conn| {
            conn.host == set.host && conn.port == set.port && conn.protocol == set.protocol
        });
        let conn = match existing {
            Some(idx) => idx,
            None => self.connect(&set).await?,
        };
        self.rcpts.push(ProxyRcpt {
            address,
            params: set.params,
            conn,
            accepted: false,
            reply: None,
        });
        Ok(())
    }

    async fn connect(&mut self, set: &ProxyRcptSettings) -> Result<usize, ClientError> {
        let target = set
            .hostip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| set.host.clone());
        let lmtp = set.protocol == ProxyProtocol::Lmtp;
        let mut client = LmtpClient::connect(&target, set.port, set.timeout).await?;
        client.read_greeting().await?;
        client.lhlo(&self.set.my_hostname, lmtp).await?;

        if client.has_capability("XCLIENT") {
            // pass the real client identity and the hop budget along
            let mut line = "XCLIENT".to_string();
            if let Some(ip) = self.set.source_ip {
                line.push_str(&format!(" ADDR={ip}"));
            }
            line.push_str(&format!(" PORT={}", self.set.source_port));
            line.push_str(&format!(" TTL={}", self.set.proxy_ttl));
            if self.set.proxy_timeout_secs > 0 {
                line.push_str(&format!(" TIMEOUT={}", self.set.proxy_timeout_secs));
            }
            client.command_expecting(&line, 220).await?;
            // XCLIENT resets the upstream session
            client.lhlo(&self.set.my_hostname, lmtp).await?;
        }

        client.command_expecting(&self.mail_from, 250).await?;

        self.connections.push(ProxyConnection {
            host: set.host.clone(),
            port: set.port,
            protocol: set.protocol,
            client,
            failure: None,
        });
        Ok(self.connections.len() - 1)
    }

    /// Relay the recipients and the payload, returning one reply per
    /// recipient in the order they were added. Upstream rejections are
    /// relayed verbatim; transport failures map to a uniform 451.
    pub async fn start(&mut self, mail: &ComposedMail) -> Vec<Response> {
        for idx in 0..self.rcpts.len() {
            let conn = self.rcpts[idx].conn;
            if self.connections[conn].failure.is_some() {
                continue;
            }
            let line = format!(
                "RCPT TO:<{}>{}",
                self.rcpts[idx].address.encode(),
                self.rcpts[idx].params.encode()
            );
            match self.connections[conn].client.command(&line).await {
                Ok(response) if response.is_success() => {
                    self.rcpts[idx].accepted = true;
                }
                Ok(response) => {
                    self.rcpts[idx].reply = Some(response);
                }
                Err(err) => {
                    tracing::warn!(
                        "proxy: RCPT to {}:{} failed: {err:#}",
                        self.connections[conn].host,
                        self.connections[conn].port
                    );
                    self.connections[conn].failure = Some(not_answering());
                }
            }
        }

        for conn in 0..self.connections.len() {
            if self.connections[conn].failure.is_some() {
                continue;
            }
            let accepted: Vec<usize> = (0..self.rcpts.len())
                .filter(|&idx| self.rcpts[idx].conn == conn && self.rcpts[idx].accepted)
                .collect();
            if accepted.is_empty() {
                continue;
            }
            if let Err(err) = self.relay_data(conn, &accepted, mail).await {
                tracing::warn!(
                    "proxy: DATA to {}:{} failed: {err:#}",
                    self.connections[conn].host,
                    self.connections[conn].port
                );
                self.connections[conn].failure = Some(not_answering());
            }
        }

        self.rcpts
            .iter()
            .map(|rcpt| {
                rcpt.reply.clone().unwrap_or_else(|| {
                    self.connections[rcpt.conn]
                        .failure
                        .clone()
                        .unwrap_or_else(not_answering)
                })
            })
            .collect()
    }

    async fn relay_data(
        &mut self,
        conn: usize,
        accepted: &[usize],
        mail: &ComposedMail,
    ) -> anyhow::Result<()> {
        let protocol = self.connections[conn].protocol;
        let client = &mut self.connections[conn].client;

        let response = client.command("DATA").await?;
        if response.code != 354 {
            // a DATA rejection applies to every recipient on this wire
            for &idx in accepted {
                self.rcpts[idx].reply = Some(response.clone());
            }
            return Ok(());
        }

        let reader = mail.open_reader()?;
        client.send_payload(reader).await?;

        match protocol {
            ProxyProtocol::Lmtp => {
                // one status per accepted recipient, in RCPT order
                for &idx in accepted {
                    let client = &mut self.connections[conn].client;
                    let response = client.read_response(Some("DATA")).await?;
                    self.rcpts[idx].reply = Some(response);
                }
            }
            ProxyProtocol::Smtp => {
                let response = client.read_response(Some("DATA")).await?;
                for &idx in accepted {
                    self.rcpts[idx].reply = Some(response.clone());
                }
            }
        }
        Ok(())
    }

    pub async fn deinit(&mut self) {
        for conn in &mut self.connections {
            conn.client.quit().await;
        }
    }
}
