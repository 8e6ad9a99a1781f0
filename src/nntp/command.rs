//! NNTP command types and encoding.

use crate::error::{Error, Result};

/// Commands the fetch pipeline sends. This is the RFC 3977 subset the
/// ingest core uses; anything else a server offers is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch to reader mode
    ModeReader,

    /// Authenticate with username
    AuthInfoUser(String),

    /// Authenticate with password
    AuthInfoPass(String),

    /// Select a newsgroup
    Group(String),

    /// List article numbers in the current group within a range
    ListGroup { group: String, low: u64, high: u64 },

    /// List active newsgroups, optionally filtered by wildmat
    ListActive(Option<String>),

    /// Check article existence by message-id
    Stat(String),

    /// Retrieve article headers by message-id
    Head(String),

    /// Retrieve a full article by message-id
    Article(String),

    /// Overview rows for an article-number range
    XOver { low: u64, high: u64 },

    /// One header field for an article-number range
    XHdr { field: String, low: u64, high: u64 },

    /// Terminate the connection
    Quit,
}

impl Command {
    /// Encode as a CRLF-terminated command line.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let line = match self {
            Command::ModeReader => "MODE READER".to_string(),
            Command::AuthInfoUser(user) => {
                validate_parameter(user)?;
                format!("AUTHINFO USER {user}")
            }
            Command::AuthInfoPass(pass) => {
                validate_parameter(pass)?;
                format!("AUTHINFO PASS {pass}")
            }
            Command::Group(group) => {
                validate_parameter(group)?;
                format!("GROUP {group}")
            }
            Command::ListGroup { group, low, high } => {
                validate_parameter(group)?;
                format!("LISTGROUP {group} {low}-{high}")
            }
            Command::ListActive(wildmat) => match wildmat {
                Some(pattern) => {
                    validate_parameter(pattern)?;
                    format!("LIST ACTIVE {pattern}")
                }
                None => "LIST ACTIVE".to_string(),
            },
            Command::Stat(message_id) => {
                validate_message_id(message_id)?;
                format!("STAT {message_id}")
            }
            Command::Head(message_id) => {
                validate_message_id(message_id)?;
                format!("HEAD {message_id}")
            }
            Command::Article(message_id) => {
                validate_message_id(message_id)?;
                format!("ARTICLE {message_id}")
            }
            Command::XOver { low, high } => format!("XOVER {low}-{high}"),
            Command::XHdr { field, low, high } => {
                validate_parameter(field)?;
                format!("XHDR {field} {low}-{high}")
            }
            Command::Quit => "QUIT".to_string(),
        };

        let mut bytes = line.into_bytes();
        bytes.extend_from_slice(b"\r\n");
        Ok(bytes)
    }

    /// Whether a success response to this command carries a multiline
    /// data block terminated by a lone dot.
    pub fn expects_multiline(&self) -> bool {
        matches!(
            self,
            Command::ListGroup { .. }
                | Command::ListActive(_)
                | Command::Head(_)
                | Command::Article(_)
                | Command::XOver { .. }
                | Command::XHdr { .. }
        )
    }
}

/// Reject parameters that would break the line-oriented protocol.
fn validate_parameter(param: &str) -> Result<()> {
    if param.contains('\r') || param.contains('\n') || param.contains('\0') {
        return Err(Error::Validation(format!(
            "parameter contains illegal control characters: {param:?}"
        )));
    }
    Ok(())
}

fn validate_message_id(message_id: &str) -> Result<()> {
    validate_parameter(message_id)?;
    if !message_id.starts_with('<') || !message_id.ends_with('>') {
        return Err(Error::Validation(format!(
            "message-id must be wrapped in angle brackets: {message_id}"
        )));
    }
    Ok(())
}
