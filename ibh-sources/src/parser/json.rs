//! JSON responses walked through the descriptor's declared field paths.
//!
//! Paths are dot-separated (`"file.url"` reaches `{"file": {"url": ...}}`).
//! The posts path may point at an array, at an object holding a single post,
//! or be empty when the document root is already the list.
use ibh_common::log::debug;
use ibh_common::post::{
    extension::Extension,
    rating::Rating,
    tags::{Tag, TagType},
    Post,
};
use serde_json::Value;

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

    let document: Value = serde_json::from_str(text)?;

    let list = match lookup(&document, &map.posts) {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single @ Value::Object(_)) => vec![single],
        _ => Vec::new(),
    };

    let posts: Vec<Post> = list
        .into_iter()
        .filter_map(|item| map_post(map, item, page))
        .collect();

    debug!("JSON page decoded, {} posts", posts.len());
    Ok(Page {
        posts,
        page,
        per_page,
        total: None,
    })
}

/// Builds one post from one document node. Posts without an id or a file URL
/// cannot be downloaded and are dropped here, like the upstream APIs
/// sometimes drop takedowns.
fn map_post(map: &FieldMap, item: &Value, page: u32) -> Option<Post> {
    let id = as_u64(lookup(item, &map.id)?)?;
    let file_url = as_string(lookup(item, &map.file_url)?)?;

    let mut post = Post {
        id,
        file_url,
        page,
        ..Post::default()
    };

    if let Some(path) = &map.md5 {
        post.md5 = lookup(item, path).and_then(as_string);
    }
    if let Some(path) = &map.sample_url {
        post.sample_url = lookup(item, path).and_then(as_string);
    }
    if let Some(path) = &map.preview_url {
        post.preview_url = lookup(item, path).and_then(as_string);
    }
    if let Some(path) = &map.source_url {
        post.source_url = lookup(item, path).and_then(as_string);
    }
    if let Some(path) = &map.tags {
        post.tags = lookup(item, path).map(map_tags).unwrap_or_default();
    }
    if let Some(path) = &map.rating {
        post.rating = lookup(item, path)
            .and_then(as_string)
            .map(|r| Rating::from_rating_str(&r))
            .unwrap_or_default();
    }
    if let Some(path) = &map.score {
        post.score = lookup(item, path).and_then(as_i64).unwrap_or_default();
    }
    if let Some(path) = &map.width {
        post.width = lookup(item, path).and_then(as_u64).unwrap_or_default() as u32;
    }
    if let Some(path) = &map.height {
        post.height = lookup(item, path).and_then(as_u64).unwrap_or_default() as u32;
    }
    if let Some(path) = &map.file_size {
        post.file_size = lookup(item, path).and_then(as_u64).unwrap_or_default();
    }
    if let Some(path) = &map.author {
        post.author = lookup(item, path).and_then(as_string).unwrap_or_default();
    }
    if let Some(path) = &map.created_at {
        post.created_at = lookup(item, path)
            .and_then(as_string)
            .and_then(|raw| parse_datetime(&raw));
    }
    if let Some(path) = &map.parent_id {
        post.parent_id = lookup(item, path).and_then(as_u64);
    }
    if let Some(path) = &map.children {
        post.children = lookup(item, path).map(map_id_list).unwrap_or_default();
    }

    post.extension = map
        .extension
        .as_ref()
        .and_then(|path| lookup(item, path))
        .and_then(as_string)
        .map_or_else(
            || Extension::from_url(&post.file_url),
            |ext| Extension::guess_format(&ext),
        );

    Some(post)
}

/// Tags arrive as a whitespace-joined string, an array of strings, or an
/// object of per-type arrays. All three collapse into typed [`Tag`]s.
fn map_tags(value: &Value) -> Vec<Tag> {
    match value {
        Value::String(joined) => joined
            .split_whitespace()
            .map(|t| Tag::new(t, TagType::General))
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|t| Tag::new(t, TagType::General))
            .collect(),
        Value::Object(groups) => {
            let mut tags = Vec::with_capacity(64);
            for (key, list) in groups {
                let tag_type = TagType::from_key(key);
                if let Value::Array(items) = list {
                    tags.extend(
                        items
                            .iter()
                            .filter_map(|v| v.as_str())
                            .map(|t| Tag::new(t, tag_type)),
                    );
                }
            }
            tags
        }
        _ => Vec::new(),
    }
}

fn map_id_list(value: &Value) -> Vec<u64> {
    match value {
        Value::Array(items) => items.iter().filter_map(as_u64).collect(),
        Value::String(joined) => joined
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect(),
        _ => Vec::new(),
    }
}

fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
