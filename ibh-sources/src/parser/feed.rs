//! Feed-syndication sources (RSS 2.0 and Atom).
//!
//! Feeds only carry a title, a link and a date per entry, so the resulting
//! posts are deliberately minimal: no md5, no tags, no score. Their ids come
//! from the trailing digits of the entry link when present, falling back to
//! the entry's position in the feed.
use ibh_common::log::debug;
use ibh_common::post::{extension::Extension, Post};
use roxmltree::{Document, Node};

use super::{id_from_url, parse_datetime, Page, ParseError};

pub(super) fn parse(text: &str, page: u32, per_page: u32) -> Result<Page, ParseError> {
    let document = Document::parse(text).map_err(|e| ParseError::MarkupDecodeFail {
        message: e.to_string(),
    })?;
    let root = document.root_element();

    let entries: Vec<Node> = root
        .descendants()
        .filter(|n| {
            n.is_element() && matches!(n.tag_name().name(), "item" | "entry")
        })
        .collect();

    let posts: Vec<Post> = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| map_entry(*entry, index, page))
        .collect();

    debug!("Feed decoded, {} entries", posts.len());
    Ok(Page {
        posts,
        page,
        per_page,
        total: None,
    })
}

fn map_entry(entry: Node, index: usize, page: u32) -> Option<Post> {
    let link = entry
        .children()
        .find(|c| c.is_element() && c.tag_name().name() == "link")
        .and_then(|l| {
            // RSS carries the URL as text, Atom as an href attribute.
            l.text()
                .filter(|t| !t.trim().is_empty())
                .map(|t| t.trim().to_string())
                .or_else(|| l.attribute("href").map(str::to_string))
        })?;

    let title = child_text(entry, "title");
    let date = child_text(entry, "pubDate")
        .or_else(|| child_text(entry, "updated"))
        .or_else(|| child_text(entry, "published"))
        .and_then(|raw| parse_datetime(&raw));

    // Enclosures point at the actual media file; the link is the post page.
    let media = entry
        .children()
        .find(|c| c.is_element() && c.tag_name().name() == "enclosure")
        .and_then(|e| e.attribute("url").map(str::to_string));

    let file_url = media.unwrap_or_else(|| link.clone());

    Some(Post {
        id: id_from_url(&link).unwrap_or(index as u64 + 1),
        title,
        extension: Extension::from_url(&file_url),
        file_url,
        source_url: Some(link),
        created_at: date,
        page,
        ..Post::default()
    })
}

fn child_text(entry: Node, name: &str) -> Option<String> {
    entry
        .children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
        .and_then(|c| c.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
