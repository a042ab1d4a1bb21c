//! Format-specific response parsing.
//!
//! Every wire format implements the same contract: raw response bytes in,
//! a [`Page`] of normalized [`Post`](ibh_common::post::Post)s out. The
//! concrete parser is selected by the descriptor's [`ApiFormat`] field, so
//! adding a format means adding a module here and a variant there — no
//! inheritance anywhere.
//!
//! Missing optional fields are never fatal: they take the documented
//! defaults from `Post::default()`. A response that decodes to zero posts is
//! a valid empty page, distinct from a transport failure.
use chrono::{DateTime, Utc};
use ibh_common::post::Post;
use thiserror::Error;

use crate::descriptor::{ApiFormat, SourceDescriptor};

mod feed;
mod json;
mod markup;
mod rgx;

/// One page of search results plus its pagination metadata.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub posts: Vec<Post>,
    /// 1-indexed page number this result set came from.
    pub page: u32,
    pub per_page: u32,
    /// Total hit count across all pages, when the source reports one.
    pub total: Option<u64>,
}

impl Page {
    pub const fn empty(page: u32, per_page: u32) -> Self {
        Self {
            posts: Vec::new(),
            page,
            per_page,
            total: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Response is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Error while deserializing JSON")]
    JsonDecodeFail(#[from] serde_json::Error),

    #[error("Invalid markup in response: {message}")]
    MarkupDecodeFail { message: String },

    #[error("Pattern '{rule}' failed to compile: {message}")]
    BadPattern { rule: String, message: String },

    #[error("Source declares {format:?} but its descriptor has no field map")]
    MissingFieldMap { format: ApiFormat },

    #[error("Regex source has no 'post' rule")]
    MissingPostRule,
}

/// Parses one raw API response according to the descriptor's declared format.
pub fn parse_page(
    descriptor: &SourceDescriptor,
    raw: &[u8],
    page: u32,
    per_page: u32,
) -> Result<Page, ParseError> {
    let text = std::str::from_utf8(raw)?;
    match descriptor.api {
        ApiFormat::Json => json::parse(descriptor, text, page, per_page),
        ApiFormat::Markup => markup::parse(descriptor, text, page, per_page),
        ApiFormat::Regex => rgx::parse(descriptor, text, page, per_page),
        ApiFormat::Feed => feed::parse(text, page, per_page),
    }
}

/// Accepts the timestamp spellings seen in the wild: RFC 3339 (JSON APIs),
/// RFC 2822 (feeds), and bare unix seconds.
pub(crate) fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Booru post pages usually end in the numeric post id; feeds have nothing
/// better to use as an identifier.
pub(crate) fn id_from_url(url: &str) -> Option<u64> {
    let trimmed = url.trim_end_matches('/');
    let tail: String = trimmed
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect();
    if tail.is_empty() {
        return None;
    }
    tail.chars().rev().collect::<String>().parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn datetime_spellings() {
        assert!(parse_datetime("2024-03-01T12:00:00+00:00").is_some());
        assert!(parse_datetime("Sat, 02 Mar 2024 09:30:00 GMT").is_some());
        assert!(parse_datetime("1709370000").is_some());
        assert!(parse_datetime("next tuesday").is_none());
    }

    #[test]
    fn url_ids() {
        assert_eq!(id_from_url("https://example.org/post/view/12345"), Some(12345));
        assert_eq!(id_from_url("https://example.org/post/view/12345/"), Some(12345));
        assert_eq!(id_from_url("https://example.org/about"), None);
    }
}
