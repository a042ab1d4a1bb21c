//! Regex-extraction sources: sites with no structured API, mined straight
//! out of their HTML listings.
//!
//! The descriptor declares an ordered list of named rules. The rule named
//! `post` is applied with `captures_iter`, one post per match, its named
//! capture groups filling the post fields. A rule named `count`, when
//! present, extracts the total hit count from the page once.
use ibh_common::log::debug;
use ibh_common::post::{
    extension::Extension,
    rating::Rating,
    tags::{Tag, TagType},
    Post,
};
use regex::{Captures, Regex};

use crate::descriptor::SourceDescriptor;

use super::{parse_datetime, Page, ParseError};

pub(super) fn parse(
    descriptor: &SourceDescriptor,
    text: &str,
    page: u32,
    per_page: u32,
) -> Result<Page, ParseError> {
    let post_rule = descriptor
        .regex_rules
        .iter()
        .find(|r| r.name == "post")
        .ok_or(ParseError::MissingPostRule)?;

    let post_re = compile(&post_rule.name, &post_rule.pattern)?;

    let mut total = None;
    if let Some(count_rule) = descriptor.regex_rules.iter().find(|r| r.name == "count") {
        let count_re = compile(&count_rule.name, &count_rule.pattern)?;
        total = count_re.captures(text).and_then(|caps| {
            caps.name("count")
                .or_else(|| caps.get(1))
                .and_then(|m| m.as_str().parse().ok())
        });
    }

    let posts: Vec<Post> = post_re
        .captures_iter(text)
        .filter_map(|caps| map_post(&caps, page))
        .collect();

    debug!("Regex page mined, {} posts", posts.len());
    Ok(Page {
        posts,
        page,
        per_page,
        total,
    })
}

fn compile(rule: &str, pattern: &str) -> Result<Regex, ParseError> {
    Regex::new(pattern).map_err(|e| ParseError::BadPattern {
        rule: rule.to_string(),
        message: e.to_string(),
    })
}

fn map_post(caps: &Captures, page: u32) -> Option<Post> {
    let group = |name: &str| caps.name(name).map(|m| m.as_str().to_string());

    let id = group("id")?.parse().ok()?;
    let file_url = group("file_url")?;

    let mut post = Post {
        id,
        file_url,
        page,
        md5: group("md5"),
        sample_url: group("sample_url"),
        preview_url: group("preview_url"),
        source_url: group("source_url"),
        author: group("author").unwrap_or_default(),
        ..Post::default()
    };

    if let Some(joined) = group("tags") {
        post.tags = joined
            .split_whitespace()
            .map(|t| Tag::new(t, TagType::General))
            .collect();
    }
    if let Some(rating) = group("rating") {
        post.rating = Rating::from_rating_str(&rating);
    }
    if let Some(score) = group("score") {
        post.score = score.parse().unwrap_or_default();
    }
    if let Some(width) = group("width") {
        post.width = width.parse().unwrap_or_default();
    }
    if let Some(height) = group("height") {
        post.height = height.parse().unwrap_or_default();
    }
    if let Some(raw) = group("created_at") {
        post.created_at = parse_datetime(&raw);
    }

    post.extension = group("ext").map_or_else(
        || Extension::from_url(&post.file_url),
        |ext| Extension::guess_format(&ext),
    );

    Some(post)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor::{RegexRule, DEFAULT_SOURCES};

    fn paheal() -> SourceDescriptor {
        DEFAULT_SOURCES.get("paheal").unwrap().clone()
    }

    #[test]
    fn mines_posts_from_listing_html() {
        let body = r#"
        <div class="shm-thumb">
          <a href="https://img.example/_images/0123456789abcdef0123456789abcdef/pic.png" id="thumb_4001">one</a>
        </div>
        <div class="shm-thumb">
          <a href="https://img.example/_images/fedcba9876543210fedcba9876543210/other.jpg" id="thumb_4002">two</a>
        </div>"#;

        let page = parse(&paheal(), body, 1, 70).unwrap();
        assert_eq!(page.posts.len(), 2);
        assert_eq!(page.posts[0].id, 4001);
        assert_eq!(
            page.posts[0].md5.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
        assert_eq!(page.posts[0].extension.to_string(), "png");
        assert_eq!(page.posts[1].id, 4002);
    }

    #[test]
    fn count_rule_extracts_total() {
        let mut descriptor = paheal();
        descriptor.regex_rules.push(RegexRule {
            name: "count".to_string(),
            pattern: r"of (?P<count>\d+) results".to_string(),
        });

        let body = r#"<span>Showing 1-70 of 4242 results</span>
        <a href="https://img.example/_images/0123456789abcdef0123456789abcdef/p.png" id="thumb_1">x</a>"#;

        let page = parse(&descriptor, body, 1, 70).unwrap();
        assert_eq!(page.total, Some(4242));
    }

    #[test]
    fn no_matches_is_a_valid_empty_page() {
        let page = parse(&paheal(), "<html><body>No results</body></html>", 9, 70).unwrap();
        assert!(page.posts.is_empty());
    }
}
