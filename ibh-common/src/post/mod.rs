//! Main representation of an imageboard post
//!
//! # Post
//! A [`Post` struct](Post) is a generic representation of an imageboard post.
//!
//! Most imageboard APIs expose a common set of info about the files we want to
//! download; format-specific parsers normalize their responses into this one
//! shape so the filter engine and the download pipeline never see wire formats.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::{cmp::Ordering, fmt::Debug};

use self::{extension::Extension, rating::Rating, tags::Tag};

pub mod error;
pub mod extension;
pub mod rating;
pub mod tags;

/// Download lifecycle of a single post.
///
/// A post is `Pending` when it comes out of a parser. The download pipeline is
/// the only component that moves it through the remaining states; every other
/// field of [`Post`] is immutable after parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DownloadState {
    #[default]
    Pending,
    Downloading,
    Paused,
    Success,
    Failed,
    Skipped,
    AlreadyExists,
}

/// A user comment attached to a post. Only populated by sources whose field
/// map declares a comments path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// A translation/annotation note overlaid on the image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub body: String,
}

/// Catchall model for the necessary parts of an imageboard post to properly
/// identify, filter, download and save it.
#[derive(Clone, Serialize, Deserialize, Eq, Default)]
pub struct Post {
    /// ID number of the post given by the imageboard
    pub id: u64,
    /// MD5 hash provided by the API. Some sources (feeds in particular) don't
    /// provide one, in which case it stays `None` until the file is fetched.
    pub md5: Option<String>,
    /// Direct URL of the original media file on the imageboard's server
    pub file_url: String,
    /// URL of the downscaled sample, when the site provides one
    pub sample_url: Option<String>,
    /// URL of the thumbnail
    pub preview_url: Option<String>,
    /// The page the post links back to (the post's own web page or the
    /// original source the uploader credited)
    pub source_url: Option<String>,
    /// Feed sources carry a human title instead of tags
    pub title: Option<String>,
    /// The original file extension provided by the imageboard.
    ///
    /// Some sites don't provide this field, so additional work is required to
    /// get the file extension from the url
    pub extension: Extension,
    pub rating: Rating,
    pub score: i64,
    pub width: u32,
    pub height: u32,
    /// Size of the original file in bytes, `0` when unknown
    pub file_size: u64,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
    /// Which result page this post came from
    pub page: u32,
    /// Set of tags associated with the post.
    ///
    /// Used to exclude posts according to a blacklist
    pub tags: Vec<Tag>,
    /// Parent post id, stored as a weak reference resolved against the
    /// current page cache
    pub parent_id: Option<u64>,
    /// Child post ids, weak references like `parent_id`
    pub children: Vec<u64>,
    pub comments: Vec<Comment>,
    pub notes: Vec<Note>,
    /// Mutable download state, see [`DownloadState`]
    pub state: DownloadState,
}

impl Debug for Post {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Post")
            .field("Post ID", &self.id)
            .field("Download URL", &self.file_url)
            .field("MD5 Hash", &self.md5)
            .field("File Extension", &self.extension)
            .field("Rating", &self.rating)
            .field("Score", &self.score)
            .field("Tag List", &self.tags)
            .field("State", &self.state)
            .finish()
    }
}

impl Ord for Post {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl PartialOrd for Post {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Post {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Post {
    /// Whether the post carries the given tag, regardless of tag type.
    #[inline]
    pub fn has_tag(&self, text: &str) -> bool {
        self.tags.iter().any(|t| t.tag() == text)
    }

    /// Iterates the textual content of all tags.
    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(Tag::tag)
    }

    /// Tags of one specific type, in original order.
    pub fn tags_of_type(&self, tag_type: tags::TagType) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.tag_type() == tag_type)
            .map(Tag::tag)
            .collect()
    }
}
