//! A single NNTP connection.
//!
//! Wraps the plain/TLS stream with line-oriented reads, per-operation
//! deadlines, and the command subset of the fetch pipeline. Connections
//! authenticate lazily: the AUTHINFO/MODE READER exchange runs on the
//! first real command, not at connect time, so pooled spares stay cheap.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{NntpSettings, ProviderConfig, MAX_READ_LINES_XOVER};
use crate::error::{Error, Result};
use crate::nntp::command::Command;
use crate::nntp::response::{
    fold_headers, is_terminator, parse_group_stats, unstuff, Status,
};
use crate::nntp::stream::NntpStream;
use crate::nntp::{GroupDescriptor, GroupStats, HeaderEntry, OverviewEntry, RawArticle};

pub struct NntpConn {
    reader: BufReader<NntpStream>,
    provider: Arc<ProviderConfig>,
    op_timeout: Duration,
    /// AUTHINFO + MODE READER completed.
    ready: bool,
    posting_ok: bool,
}

impl NntpConn {
    /// Open the TCP/TLS stream and consume the server greeting.
    pub async fn connect(provider: Arc<ProviderConfig>, settings: &NntpSettings) -> Result<Self> {
        let op_timeout = provider.timeout(settings);
        let stream = timeout(
            op_timeout,
            NntpStream::connect(&provider.host, provider.port, provider.ssl),
        )
        .await
        .map_err(|_| Error::Connection(format!("connect timeout to {}", provider.addr())))?
        .map_err(|e| Error::Connection(format!("failed to connect to {}: {e}", provider.addr())))?;

        let mut conn = Self {
            reader: BufReader::new(stream),
            provider,
            op_timeout,
            ready: false,
            posting_ok: false,
        };

        let greeting = conn.read_status().await?;
        match greeting.code {
            200 => conn.posting_ok = true,
            201 => conn.posting_ok = false,
            _ => return Err(greeting.into_protocol_error()),
        }
        debug!(
            provider = %conn.provider.name,
            tls = conn.reader.get_ref().is_tls(),
            posting = conn.posting_ok,
            "connected to NNTP server"
        );
        Ok(conn)
    }

    pub fn posting_ok(&self) -> bool {
        self.posting_ok
    }

    /// Authenticate (when credentials are configured) and switch to
    /// reader mode. Runs once, on the first command.
    async fn ensure_ready(&mut self) -> Result<()> {
        if self.ready {
            return Ok(());
        }

        if self.provider.has_credentials() {
            if !self.reader.get_ref().is_tls() {
                warn!(provider = %self.provider.name, "authenticating over plaintext connection");
            }
            let username = self.provider.username.clone().unwrap_or_default();
            let password = self.provider.password.clone().unwrap_or_default();

            let status = self.exchange(&Command::AuthInfoUser(username)).await?;
            match status.code {
                281 => {}
                381 => {
                    let status = self.exchange(&Command::AuthInfoPass(password)).await?;
                    if status.code != 281 {
                        return Err(status.into_protocol_error());
                    }
                }
                _ => return Err(status.into_protocol_error()),
            }
            debug!(provider = %self.provider.name, "authenticated");
        }

        // MODE READER may flip the posting capability (RFC 3977 5.3).
        let status = self.exchange(&Command::ModeReader).await?;
        match status.code {
            200 => self.posting_ok = true,
            201 => self.posting_ok = false,
            _ => return Err(status.into_protocol_error()),
        }

        self.ready = true;
        Ok(())
    }

    /// Select a group, returning its stats or `NewsgroupNotFound`.
    pub async fn select_group(&mut self, name: &str) -> Result<GroupStats> {
        self.ensure_ready().await?;
        let status = self.exchange(&Command::Group(name.to_string())).await?;
        match status.code {
            211 => parse_group_stats(&status, self.posting_ok),
            411 => Err(Error::NewsgroupNotFound(name.to_string())),
            _ => Err(status.into_protocol_error()),
        }
    }

    /// Check whether the server carries an article, without fetching it.
    pub async fn stat_article(&mut self, message_id: &str) -> Result<bool> {
        self.ensure_ready().await?;
        let status = self.exchange(&Command::Stat(message_id.to_string())).await?;
        match status.code {
            223 => Ok(true),
            420 | 423 | 430 => Ok(false),
            _ => Err(status.into_protocol_error()),
        }
    }

    /// Fetch only the headers of an article, keys lowercased.
    pub async fn get_head(&mut self, message_id: &str) -> Result<Vec<(String, String)>> {
        self.ensure_ready().await?;
        let status = self.exchange(&Command::Head(message_id.to_string())).await?;
        match status.code {
            221 => {
                let lines = self.read_multiline(None).await?;
                Ok(fold_headers(&lines))
            }
            420 | 423 | 430 => Err(Error::NotFound),
            _ => Err(status.into_protocol_error()),
        }
    }

    /// Fetch a complete article: headers, body, and raw byte count.
    pub async fn get_article(&mut self, message_id: &str) -> Result<RawArticle> {
        self.ensure_ready().await?;
        let status = self
            .exchange(&Command::Article(message_id.to_string()))
            .await?;
        match status.code {
            220 => {
                let lines = self.read_multiline(None).await?;
                let bytes = lines.iter().map(|l| l.len() as u64 + 2).sum();
                let split = lines.iter().position(|l| l.is_empty()).unwrap_or(lines.len());
                let headers = fold_headers(&lines[..split]);
                let body = if split < lines.len() {
                    lines[split + 1..].to_vec()
                } else {
                    Vec::new()
                };
                Ok(RawArticle {
                    headers,
                    body,
                    bytes,
                })
            }
            420 | 423 | 430 => Err(Error::NotFound),
            _ => Err(status.into_protocol_error()),
        }
    }

    /// Stream the active-group list (LIST ACTIVE).
    pub async fn list_groups(&mut self, wildmat: Option<&str>) -> Result<Vec<GroupDescriptor>> {
        self.ensure_ready().await?;
        let status = self
            .exchange(&Command::ListActive(wildmat.map(|w| w.to_string())))
            .await?;
        if status.code != 215 {
            return Err(status.into_protocol_error());
        }
        let lines = self.read_multiline(None).await?;
        Ok(lines.iter().filter_map(|l| GroupDescriptor::parse(l)).collect())
    }

    /// Article numbers present in a range (LISTGROUP).
    pub async fn list_group(&mut self, name: &str, low: u64, high: u64) -> Result<Vec<u64>> {
        self.ensure_ready().await?;
        let status = self
            .exchange(&Command::ListGroup {
                group: name.to_string(),
                low,
                high,
            })
            .await?;
        match status.code {
            211 => {
                let lines = self.read_multiline(None).await?;
                Ok(lines.iter().filter_map(|l| l.trim().parse().ok()).collect())
            }
            411 => Err(Error::NewsgroupNotFound(name.to_string())),
            _ => Err(status.into_protocol_error()),
        }
    }

    /// Overview rows for a range. With `enforce_limit`, at most
    /// `MAX_READ_LINES_XOVER` rows are kept; the rest of the response is
    /// drained to keep the protocol in sync.
    pub async fn xover(&mut self, low: u64, high: u64, enforce_limit: bool) -> Result<Vec<OverviewEntry>> {
        self.ensure_ready().await?;
        let status = self.exchange(&Command::XOver { low, high }).await?;
        match status.code {
            224 => {
                let cap = enforce_limit.then_some(MAX_READ_LINES_XOVER);
                let lines = self.read_multiline(cap).await?;
                Ok(lines.iter().filter_map(|l| OverviewEntry::parse(l)).collect())
            }
            420 | 423 => Ok(Vec::new()),
            _ => Err(status.into_protocol_error()),
        }
    }

    /// One header field over a range (XHDR).
    pub async fn xhdr(&mut self, field: &str, low: u64, high: u64) -> Result<Vec<HeaderEntry>> {
        self.ensure_ready().await?;
        let status = self
            .exchange(&Command::XHdr {
                field: field.to_string(),
                low,
                high,
            })
            .await?;
        match status.code {
            221 => {
                let lines = self.read_multiline(None).await?;
                Ok(lines.iter().filter_map(|l| HeaderEntry::parse(l)).collect())
            }
            420 | 423 => Ok(Vec::new()),
            _ => Err(status.into_protocol_error()),
        }
    }

    /// Polite teardown. Errors are swallowed; the connection is gone
    /// either way.
    pub async fn quit(mut self) {
        if self.send(&Command::Quit).await.is_ok() {
            let _ = self.read_status().await;
        }
        let _ = self.reader.get_mut().shutdown().await;
    }

    /// Send a command and read its status line, under the deadline.
    async fn exchange(&mut self, command: &Command) -> Result<Status> {
        self.send(command).await?;
        self.read_status().await
    }

    async fn send(&mut self, command: &Command) -> Result<()> {
        let bytes = command.encode()?;
        timeout(self.op_timeout, self.reader.get_mut().write_all(&bytes))
            .await
            .map_err(|_| Error::Connection("write timeout".into()))?
            .map_err(|e| Error::Connection(format!("failed to send command: {e}")))?;
        Ok(())
    }

    async fn read_status(&mut self) -> Result<Status> {
        let line = self.read_line().await?;
        Status::parse(&line)
    }

    /// Read a dot-terminated block, unstuffing leading dots. When `cap`
    /// is set, rows beyond it are discarded but still consumed.
    async fn read_multiline(&mut self, cap: Option<usize>) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut dropped = 0usize;
        loop {
            let line = self.read_line().await?;
            if is_terminator(&line) {
                break;
            }
            if cap.map_or(true, |c| lines.len() < c) {
                lines.push(unstuff(&line).to_string());
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(provider = %self.provider.name, dropped, "response exceeded row cap");
        }
        Ok(lines)
    }

    /// Read one CRLF-terminated line, without the terminator.
    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = timeout(self.op_timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Connection("read timeout".into()))?
            .map_err(|e| Error::Connection(format!("failed to read response: {e}")))?;
        if n == 0 {
            return Err(Error::Connection("connection closed by server".into()));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}
