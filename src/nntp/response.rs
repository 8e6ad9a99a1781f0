//! NNTP response parsing: status lines, dot-stuffed multiline blocks,
//! and header folding.

use crate::error::{Error, Result};
use crate::nntp::GroupStats;

/// A parsed status line, e.g. `211 1234 1 1234 alt.test`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub text: String,
}

impl Status {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end();
        let (code, rest) = line
            .split_once(' ')
            .map(|(c, r)| (c, r.to_string()))
            .unwrap_or((line, String::new()));
        let code: u16 = code
            .parse()
            .map_err(|_| Error::InvalidResponse(format!("bad status line: {line:?}")))?;
        Ok(Self { code, text: rest })
    }

    /// 1xx/2xx/3xx are non-error classes in RFC 3977.
    pub fn is_success(&self) -> bool {
        self.code < 400
    }

    pub fn into_protocol_error(self) -> Error {
        Error::Protocol {
            code: self.code,
            message: self.text,
        }
    }
}

/// Parse the text of a `211` GROUP response: `count first last name`.
pub fn parse_group_stats(status: &Status, posting_ok: bool) -> Result<GroupStats> {
    let mut fields = status.text.split_whitespace();
    let count = parse_field(fields.next(), "count")?;
    let first = parse_field(fields.next(), "first")?;
    let last = parse_field(fields.next(), "last")?;
    let name = fields
        .next()
        .ok_or_else(|| Error::InvalidResponse("GROUP response missing name".into()))?
        .to_string();
    Ok(GroupStats {
        name,
        count,
        first,
        last,
        posting_ok,
    })
}

fn parse_field(field: Option<&str>, what: &str) -> Result<u64> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| Error::InvalidResponse(format!("GROUP response missing {what}")))
}

/// Remove dot-stuffing from one line of a multiline block.
/// A line starting with `..` was an original line starting with `.`.
pub fn unstuff(line: &str) -> &str {
    if line.starts_with("..") {
        &line[1..]
    } else {
        line
    }
}

/// True when this line terminates a multiline block.
pub fn is_terminator(line: &str) -> bool {
    line == "." || line == ".\r"
}

/// Fold a raw header block into `(name, value)` pairs. Continuation
/// lines (leading whitespace) are appended to the previous value with a
/// single space. Header names are lowercased.
pub fn fold_headers(lines: &[String]) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }
    headers
}
