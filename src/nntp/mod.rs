//! NNTP client layer: wire types, command encoding, response parsing,
//! pooled authenticated connections.
//!
//! The fetch pipeline talks to providers exclusively through
//! [`pool::NntpPool`]; everything below it is protocol plumbing.

pub mod command;
pub mod conn;
pub mod pool;
pub mod response;
pub mod stream;

pub use command::Command;
pub use conn::NntpConn;
pub use pool::{NntpPool, PooledConn};

/// Result of selecting a group with `GROUP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStats {
    pub name: String,
    /// Estimated article count reported by the server.
    pub count: u64,
    /// Lowest article number in the group.
    pub first: u64,
    /// Highest article number in the group.
    pub last: u64,
    pub posting_ok: bool,
}

/// One row of an XOVER response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverviewEntry {
    pub number: u64,
    pub subject: String,
    pub from: String,
    pub date: String,
    pub message_id: String,
    pub references: String,
    pub bytes: u64,
    pub lines: u64,
}

impl OverviewEntry {
    /// Parse a tab-separated overview line:
    /// `number\tsubject\tfrom\tdate\tmessage-id\treferences\tbytes\tlines[...]`.
    /// Returns None when the article number or Message-ID is missing.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let number: u64 = fields.next()?.trim().parse().ok()?;
        let subject = fields.next().unwrap_or_default().to_string();
        let from = fields.next().unwrap_or_default().to_string();
        let date = fields.next().unwrap_or_default().to_string();
        let message_id = fields.next().unwrap_or_default().trim().to_string();
        if message_id.is_empty() {
            return None;
        }
        let references = fields.next().unwrap_or_default().trim().to_string();
        let bytes = fields.next().and_then(|f| f.trim().parse().ok()).unwrap_or(0);
        let lines = fields.next().and_then(|f| f.trim().parse().ok()).unwrap_or(0);
        Some(Self {
            number,
            subject,
            from,
            date,
            message_id,
            references,
            bytes,
            lines,
        })
    }
}

/// One row of an XHDR response: `number value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub number: u64,
    pub value: String,
}

impl HeaderEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let (num, value) = line.split_once(' ')?;
        Some(Self {
            number: num.trim().parse().ok()?,
            value: value.trim().to_string(),
        })
    }
}

/// One row of a LIST ACTIVE response: `name high low status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescriptor {
    pub name: String,
    pub high: u64,
    pub low: u64,
    pub status: String,
}

impl GroupDescriptor {
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let name = fields.next()?.to_string();
        let high = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let low = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let status = fields.next().unwrap_or("y").to_string();
        Some(Self {
            name,
            high,
            low,
            status,
        })
    }
}

/// A downloaded article: folded headers (keys lowercased), body lines,
/// and the raw dot-unstuffed line count/size.
#[derive(Debug, Clone, Default)]
pub struct RawArticle {
    pub headers: Vec<(String, String)>,
    pub body: Vec<String>,
    pub bytes: u64,
}

impl RawArticle {
    /// First value of a (lowercased) header name.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        self.body.join("\n")
    }
}

/// Split a References header into Message-IDs, oldest first. Entries
/// not wrapped in angle brackets are dropped.
pub fn parse_references(references: &str) -> Vec<String> {
    references
        .split_whitespace()
        .filter(|s| s.starts_with('<') && s.ends_with('>'))
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overview_entry_parse() {
        let line = "42\tRe: hello\talice <a@x>\tMon, 1 Jan 2024 00:00:00 +0000\t<b@x>\t<a@x>\t1024\t17";
        let entry = OverviewEntry::parse(line).unwrap();
        assert_eq!(entry.number, 42);
        assert_eq!(entry.subject, "Re: hello");
        assert_eq!(entry.message_id, "<b@x>");
        assert_eq!(entry.references, "<a@x>");
        assert_eq!(entry.bytes, 1024);
        assert_eq!(entry.lines, 17);
    }

    #[test]
    fn test_overview_entry_missing_message_id() {
        assert!(OverviewEntry::parse("42\tsubject\tfrom\tdate\t\t\t0\t0").is_none());
        assert!(OverviewEntry::parse("not-a-number\ts").is_none());
    }

    #[test]
    fn test_header_entry_parse() {
        let entry = HeaderEntry::parse("7 <msg@example>").unwrap();
        assert_eq!(entry.number, 7);
        assert_eq!(entry.value, "<msg@example>");
        assert!(HeaderEntry::parse("garbage").is_none());
    }

    #[test]
    fn test_group_descriptor_parse() {
        let desc = GroupDescriptor::parse("alt.test 5010 1 y").unwrap();
        assert_eq!(desc.name, "alt.test");
        assert_eq!(desc.high, 5010);
        assert_eq!(desc.low, 1);
        assert_eq!(desc.status, "y");
    }

    #[test]
    fn test_parse_references_filters_malformed() {
        let refs = parse_references("<a@x> bogus <b@x>");
        assert_eq!(refs, vec!["<a@x>".to_string(), "<b@x>".to_string()]);
        assert!(parse_references("").is_empty());
    }
}
