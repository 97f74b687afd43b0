use crate::lmtp_server::Recipient;
use crate::payload::ComposedMail;
use anyhow::Context;
use async_trait::async_trait;
use rfc2033::{Response, SmtpAddress};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Connection metadata handed to directory and storage lookups.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub service: String,
    pub local_ip: Option<IpAddr>,
    pub remote_ip: Option<IpAddr>,
    pub local_port: u16,
    pub remote_port: u16,
    pub session_id: String,
}

/// Outcome of a passdb lookup. `Found` carries the raw field list for
/// the router to interpret.
#[derive(Debug, Clone)]
pub enum PassdbResult {
    Found(Vec<(String, String)>),
    NotFound,
    Failed(Option<String>),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn pass_lookup(&self, username: &str, info: &ConnectionInfo) -> PassdbResult;
}

/// Which address the synthesized `Delivered-To:` header records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HdrDeliveryAddress {
    None,
    #[default]
    Final,
    Original,
}

#[derive(Debug, Clone)]
pub struct StorageUser {
    pub username: String,
    pub uid: Option<u32>,
    pub hdr_delivery_address: HdrDeliveryAddress,
}

#[async_trait]
pub trait StorageService: Send + Sync {
    /// Resolve a recipient username to its mail storage account.
    /// `Ok(None)` means the user does not exist.
    async fn lookup_user(
        &self,
        username: &str,
        info: &ConnectionInfo,
    ) -> anyhow::Result<Option<Arc<StorageUser>>>;

    /// Directory under which payload spill files are created.
    fn temp_dir(&self) -> &Path;
}

#[async_trait]
pub trait ConcurrencyRegistry: Send + Sync {
    /// Ask the registry whether another delivery for the user in
    /// `query` may start. `Ok(false)` refuses the recipient.
    async fn query(&self, query: &str) -> anyhow::Result<bool>;
}

/// An open, parsed view of the composed payload shared by every local
/// recipient of a delivery.
#[derive(Debug)]
pub struct RawMailHandle {
    pub data: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl RawMailHandle {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[async_trait]
pub trait LocalDelivery: Send + Sync {
    async fn open_raw(
        &self,
        mail: &ComposedMail,
        sender: &SmtpAddress,
    ) -> anyhow::Result<RawMailHandle>;

    /// Deliver to one recipient, producing its reply line. The first
    /// successful save is recorded in `first_saved` so later
    /// recipients can copy it instead of re-writing the stream.
    async fn deliver(
        &self,
        rcpt: &Recipient,
        mail: &RawMailHandle,
        first_saved: &mut Option<PathBuf>,
    ) -> Response;
}

/// Headers prefetched by [`LocalDelivery::open_raw`].
pub const WANTED_HEADERS: [&str; 5] = ["From", "To", "Message-ID", "Subject", "Return-Path"];

pub(crate) fn extract_headers(data: &[u8]) -> Vec<(String, String)> {
    let mut headers = vec![];
    for line in data.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }
        // continuation lines are irrelevant to the wanted set
        if line[0] == b' ' || line[0] == b'\t' {
            continue;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
        if WANTED_HEADERS
            .iter()
            .any(|wanted| wanted.eq_ignore_ascii_case(&name))
        {
            let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
            headers.push((name, value));
        }
    }
    headers
}

/// Passdb backed by the `[passdb]` table of the settings file, in the
/// spirit of a passwd-file driver: each record is a space-separated
/// list of `key` / `key=value` fields.
pub struct StaticDirectory {
    records: HashMap<String, Vec<(String, String)>>,
}

impl StaticDirectory {
    pub fn new(table: &HashMap<String, String>) -> Self {
        let records = table
            .iter()
            .map(|(user, fields)| {
                let fields = fields
                    .split(' ')
                    .filter(|field| !field.is_empty())
                    .map(|field| match field.split_once('=') {
                        Some((key, value)) => (key.to_string(), value.to_string()),
                        None => (field.to_string(), String::new()),
                    })
                    .collect();
                (user.clone(), fields)
            })
            .collect();
        Self { records }
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn pass_lookup(&self, username: &str, _info: &ConnectionInfo) -> PassdbResult {
        match self.records.get(username) {
            Some(fields) => PassdbResult::Found(fields.clone()),
            None => PassdbResult::NotFound,
        }
    }
}

/// Storage service with an optional allowlist of users; without one,
/// every syntactically valid username resolves.
pub struct SimpleStorage {
    temp_dir: PathBuf,
    users: Option<Vec<String>>,
    hdr_delivery_address: HdrDeliveryAddress,
}

impl SimpleStorage {
    pub fn new(
        temp_dir: PathBuf,
        users: Option<Vec<String>>,
        hdr_delivery_address: HdrDeliveryAddress,
    ) -> Self {
        Self {
            temp_dir,
            users,
            hdr_delivery_address,
        }
    }
}

#[async_trait]
impl StorageService for SimpleStorage {
    async fn lookup_user(
        &self,
        username: &str,
        _info: &ConnectionInfo,
    ) -> anyhow::Result<Option<Arc<StorageUser>>> {
        if let Some(users) = &self.users {
            if !users.iter().any(|user| user == username) {
                return Ok(None);
            }
        }
        Ok(Some(Arc::new(StorageUser {
            username: username.to_string(),
            uid: None,
            hdr_delivery_address: self.hdr_delivery_address,
        })))
    }

    fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }
}

/// Registry speaking the line protocol of the anvil process: send the
/// LOOKUP query, read back the current per-user session count.
pub struct SocketRegistry {
    socket_path: PathBuf,
    limit: u64,
}

impl SocketRegistry {
    pub fn new(socket_path: PathBuf, limit: u64) -> Self {
        Self { socket_path, limit }
    }
}

#[async_trait]
impl ConcurrencyRegistry for SocketRegistry {
    async fn query(&self, query: &str) -> anyhow::Result<bool> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "connecting to concurrency registry at {}",
                    self.socket_path.display()
                )
            })?;
        let mut stream = BufReader::new(stream);
        stream
            .get_mut()
            .write_all(format!("{query}\n").as_bytes())
            .await
            .context("writing registry query")?;
        let mut reply = String::new();
        stream
            .read_line(&mut reply)
            .await
            .context("reading registry reply")?;
        let count: u64 = reply
            .trim()
            .parse()
            .with_context(|| format!("unparsable registry reply {reply:?}"))?;
        Ok(count < self.limit)
    }
}

/// Maildir-style local delivery: write to `tmp/`, rename into `new/`.
/// Subsequent recipients of the same payload are served by copying
/// the first saved file.
pub struct MaildirDelivery {
    root: PathBuf,
}

impl MaildirDelivery {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The maildir writes run on the blocking pool; the session task
    /// stays suspended until the rename lands.
    async fn save(
        &self,
        rcpt: &Recipient,
        mail: &RawMailHandle,
        first_saved: &mut Option<PathBuf>,
    ) -> anyhow::Result<()> {
        let user_dir = self.root.join(
            rcpt.user
                .as_ref()
                .map(|user| user.username.as_str())
                .unwrap_or(&rcpt.address.local_part),
        );
        let session_id = rcpt.session_id.clone();
        let source = first_saved.clone();
        let data = match &source {
            // later recipients copy the first saved file
            Some(_) => Vec::new(),
            None => mail.data.clone(),
        };
        let new_path = tokio::task::spawn_blocking(move || -> anyhow::Result<PathBuf> {
            for sub in ["tmp", "new", "cur"] {
                std::fs::create_dir_all(user_dir.join(sub))?;
            }
            let tmp_path = user_dir.join("tmp").join(&session_id);
            let new_path = user_dir.join("new").join(&session_id);
            match &source {
                Some(source) => {
                    std::fs::copy(source, &tmp_path)?;
                }
                None => {
                    std::fs::write(&tmp_path, &data)?;
                }
            }
            std::fs::rename(&tmp_path, &new_path)?;
            Ok(new_path)
        })
        .await??;
        if first_saved.is_none() {
            *first_saved = Some(new_path);
        }
        Ok(())
    }
}

#[async_trait]
impl LocalDelivery for MaildirDelivery {
    async fn open_raw(
        &self,
        mail: &ComposedMail,
        _sender: &SmtpAddress,
    ) -> anyhow::Result<RawMailHandle> {
        let data = mail.read_to_vec().await?;
        let headers = extract_headers(&data);
        Ok(RawMailHandle { data, headers })
    }

    async fn deliver(
        &self,
        rcpt: &Recipient,
        mail: &RawMailHandle,
        first_saved: &mut Option<PathBuf>,
    ) -> Response {
        match self.save(rcpt, mail, first_saved).await {
            Ok(()) => Response {
                code: 250,
                enhanced_code: Some(rfc2033::EnhancedStatusCode {
                    class: 2,
                    subject: 0,
                    detail: 0,
                }),
                content: format!("<{}> {} Saved", rcpt.address.encode(), rcpt.session_id),
                command: None,
            },
            Err(err) => {
                tracing::error!(
                    "saving mail for <{}>: {err:#}",
                    rcpt.address.encode()
                );
                Response {
                    code: 451,
                    enhanced_code: Some(rfc2033::EnhancedStatusCode {
                        class: 4,
                        subject: 3,
                        detail: 0,
                    }),
                    content: format!("<{}> Temporary internal error", rcpt.address.encode()),
                    command: None,
                }
            }
        }
    }
}
