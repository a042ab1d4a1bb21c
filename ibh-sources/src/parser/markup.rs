//! Structured-markup (XML) responses, the Gelbooru-style DAPI shape.
//!
//! Post attributes live either as XML attributes on each post node or as
//! child elements with text content; the field map names work for both. The
//! root element's `count` attribute, when present, reports the total number
//! of hits across all pages.
use ibh_common::log::debug;
use ibh_common::post::{
    extension::Extension,
    rating::Rating,
    tags::{Tag, TagType},
    Post,
};
use roxmltree::{Document, Node};

use crate::descriptor::{FieldMap, SourceDescriptor};

use super::{parse_datetime, Page, ParseError};

pub(super) fn parse(
    descriptor: &SourceDescriptor,
    text: &str,
    page: u32,
    per_page: u32,
) -> Result<Page, ParseError> {
    let map = descriptor
        .field_map
        .as_ref()
        .ok_or(ParseError::MissingFieldMap {
            format: descriptor.api,
        })?;

    let document = Document::parse(text).map_err(|e| ParseError::MarkupDecodeFail {
        message: e.to_string(),
    })?;
    let root = document.root_element();

    let post_name = if map.posts.is_empty() {
        "post"
    } else {
        map.posts.as_str()
    };

    let total = root.attribute("count").and_then(|c| c.parse().ok());

    let nodes: Vec<Node> = if root.tag_name().name() == post_name {
        vec![root]
    } else {
        root.descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == post_name)
            .collect()
    };

    let posts: Vec<Post> = nodes
        .into_iter()
        .filter_map(|node| map_post(map, node, page))
        .collect();

    debug!("Markup page decoded, {} posts", posts.len());
    Ok(Page {
        posts,
        page,
        per_page,
        total,
    })
}

fn map_post(map: &FieldMap, node: Node, page: u32) -> Option<Post> {
    let id = field(node, &map.id)?.parse().ok()?;
    let file_url = field(node, &map.file_url)?;

    let mut post = Post {
        id,
        file_url,
        page,
        ..Post::default()
    };

    if let Some(name) = &map.md5 {
        post.md5 = field(node, name);
    }
    if let Some(name) = &map.sample_url {
        post.sample_url = field(node, name);
    }
    if let Some(name) = &map.preview_url {
        post.preview_url = field(node, name);
    }
    if let Some(name) = &map.source_url {
        post.source_url = field(node, name);
    }
    if let Some(name) = &map.tags {
        post.tags = field(node, name)
            .map(|joined| {
                joined
                    .split_whitespace()
                    .map(|t| Tag::new(t, TagType::General))
                    .collect()
            })
            .unwrap_or_default();
    }
    if let Some(name) = &map.rating {
        post.rating = field(node, name)
            .map(|r| Rating::from_rating_str(&r))
            .unwrap_or_default();
    }
    if let Some(name) = &map.score {
        post.score = field(node, name).and_then(|s| s.parse().ok()).unwrap_or_default();
    }
    if let Some(name) = &map.width {
        post.width = field(node, name).and_then(|s| s.parse().ok()).unwrap_or_default();
    }
    if let Some(name) = &map.height {
        post.height = field(node, name).and_then(|s| s.parse().ok()).unwrap_or_default();
    }
    if let Some(name) = &map.file_size {
        post.file_size = field(node, name).and_then(|s| s.parse().ok()).unwrap_or_default();
    }
    if let Some(name) = &map.author {
        post.author = field(node, name).unwrap_or_default();
    }
    if let Some(name) = &map.created_at {
        post.created_at = field(node, name).and_then(|raw| parse_datetime(&raw));
    }
    if let Some(name) = &map.parent_id {
        post.parent_id = field(node, name).and_then(|s| s.parse().ok());
    }

    post.extension = map
        .extension
        .as_ref()
        .and_then(|name| field(node, name))
        .map_or_else(
            || Extension::from_url(&post.file_url),
            |ext| Extension::guess_format(&ext),
        );

    Some(post)
}

/// Reads a post attribute by name: an XML attribute first, then a child
/// element's text. Empty values count as absent.
fn field(node: Node, name: &str) -> Option<String> {
    if let Some(value) = node.attribute(name) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
        .and_then(|c| c.text())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor::DEFAULT_SOURCES;

    fn gelbooru() -> SourceDescriptor {
        DEFAULT_SOURCES.get("gelbooru").unwrap().clone()
    }

    #[test]
    fn attribute_style_posts() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
        <posts count="1234" offset="0">
          <post id="900" md5="deadbeef" file_url="https://img.example/full/deadbeef.jpg"
                tags=" 1girl  sky " rating="q" score="7"/>
          <post id="901" file_url="" tags="broken"/>
        </posts>"#;

        let page = parse(&gelbooru(), body, 1, 100).unwrap();
        assert_eq!(page.total, Some(1234));
        assert_eq!(page.posts.len(), 1);

        let post = &page.posts[0];
        assert_eq!(post.id, 900);
        assert_eq!(post.md5.as_deref(), Some("deadbeef"));
        assert_eq!(post.rating, Rating::Questionable);
        assert_eq!(post.score, 7);
        assert!(post.has_tag("sky"));
        assert_eq!(post.extension.to_string(), "jpg");
    }

    #[test]
    fn element_style_posts() {
        let body = r#"<posts count="1">
          <post>
            <id>77</id>
            <md5>cafebabe</md5>
            <file_url>https://img.example/full/cafebabe.gif</file_url>
            <tags>animated loop</tags>
            <rating>e</rating>
            <score>99</score>
          </post>
        </posts>"#;

        let page = parse(&gelbooru(), body, 1, 100).unwrap();
        let post = &page.posts[0];
        assert_eq!(post.id, 77);
        assert_eq!(post.score, 99);
        assert_eq!(post.rating, Rating::Explicit);
        assert!(post.extension.is_video());
    }

    #[test]
    fn zero_posts_is_valid() {
        let page = parse(&gelbooru(), r#"<posts count="0"></posts>"#, 3, 100).unwrap();
        assert!(page.posts.is_empty());
        assert_eq!(page.total, Some(0));
    }

    #[test]
    fn bad_markup_is_a_parse_error() {
        assert!(matches!(
            parse(&gelbooru(), "{\"not\": \"xml\"}", 1, 100),
            Err(ParseError::MarkupDecodeFail { .. })
        ));
    }
}
