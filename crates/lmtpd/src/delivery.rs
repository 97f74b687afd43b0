use crate::lmtp_server::{Flow, LmtpServer, Recipient, Routing};
use crate::payload::{ComposedMail, PayloadBody};
use anyhow::Context;
use chrono::Utc;
use std::path::Path;

impl LmtpServer {
    /// The body terminator has been seen: stream the composed payload
    /// to every local recipient and/or the proxy session, emitting one
    /// reply per recipient in envelope order, then reset for the next
    /// transaction.
    pub(crate) async fn finish_data(&mut self, body: PayloadBody) -> anyhow::Result<Flow> {
        let state = self.state.take().context("DATA requires an envelope")?;
        let data_end = Utc::now();
        self.data_end_timestamp = Some(data_end);
        tracing::debug!(
            "session {}: {} byte payload for {} rcpts, {}ms since MAIL",
            self.session_id,
            body.len(),
            state.rcpts.len(),
            (data_end - state.mail_from_timestamp).num_milliseconds()
        );
        let mail = ComposedMail {
            headers: state.added_headers.clone(),
            body,
        };

        let locals: Vec<&Recipient> = state
            .rcpts
            .iter()
            .filter(|rcpt| rcpt.routing == Routing::Local)
            .collect();
        if !locals.is_empty() {
            let old_euid = nix::unistd::geteuid();
            match self.backends.delivery.open_raw(&mail, &state.sender).await {
                Err(err) => {
                    tracing::error!("Can't open delivery mail as raw: {err:#}");
                    for rcpt in &locals {
                        self.write_line(&format!(
                            "451 4.3.0 <{}> Temporary internal error",
                            rcpt.address.encode()
                        ))
                        .await?;
                    }
                }
                Ok(handle) => {
                    let mut first_saved = None;
                    for rcpt in &locals {
                        let response = self
                            .backends
                            .delivery
                            .clone()
                            .deliver(rcpt, &handle, &mut first_saved)
                            .await;
                        self.write_line(&response.to_single_line()).await?;
                    }
                }
            }
            if old_euid.is_root() {
                // delivery ran with the target users' privileges;
                // continuing with an unknown euid is not safe
                if let Err(err) = restore_root_privileges(&self.settings.base_dir) {
                    tracing::error!("restoring root privileges failed: {err:#}");
                    std::process::exit(1);
                }
            }
        }

        if let Some(mut proxy) = self.proxy.take() {
            let replies = proxy.start(&mail).await;
            for response in replies {
                self.write_line(&response.to_single_line()).await?;
            }
            proxy.deinit().await;
        }

        self.state_reset("DATA finished").await;
        Ok(Flow::Continue)
    }
}

/// After running deliveries under user uids, climb back to root,
/// make core dumps possible again and move to a directory that will
/// still exist, so later failures are diagnosable.
fn restore_root_privileges(base_dir: &Path) -> anyhow::Result<()> {
    nix::unistd::seteuid(nix::unistd::Uid::from_raw(0)).context("seteuid(0)")?;
    #[cfg(target_os = "linux")]
    unsafe {
        libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0);
    }
    if let Err(err) = nix::unistd::chdir(base_dir) {
        tracing::error!("chdir({}) failed: {err}", base_dir.display());
    }
    Ok(())
}
