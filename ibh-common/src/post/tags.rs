//! # Post Tags Module
//!
//! This module defines structures for representing and categorizing tags
//! associated with imageboard posts. Tags are a fundamental part of how
//! imageboards organize and allow searching of content.
//!
//! The primary structures are:
//! - [`Tag`](crate::post::tags::Tag): Represents a single tag, containing its textual content and its type.
//! - [`TagType`](crate::post::tags::TagType): An enum categorizing the nature of a tag (e.g., artist, character, species).

use serde::{Deserialize, Serialize};

/// Represents a single tag associated with an imageboard post.
///
/// Each tag has textual content and a [`TagType`] that categorizes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    /// The textual content of the tag (e.g., "blue_sky", "solo_focus").
    tag: String,
    /// The category or type of the tag.
    tag_type: TagType,
}

/// Categorizes the type or nature of a `Tag`.
///
/// Different imageboards use different sets of tag types, or imply them
/// through prefixes or color-coding. This enum provides a common
/// representation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagType {
    /// Tags identifying the artist(s) of the work.
    Artist,
    /// Tags related to copyright, series, or franchise.
    Copyright,
    /// Tags identifying specific characters depicted.
    Character,
    /// Tags identifying the 3D model or asset used, found on model-sharing boards.
    Model,
    /// Tags identifying the species of characters, primarily used on furry boards.
    Species,
    /// General descriptive tags about the content, scene, or attributes.
    General,
    /// Meta-tags related to the post itself (e.g., "high_resolution", "tagme").
    Meta,
    /// A catch-all or unspecified tag type.
    Any,
}

impl TagType {
    /// Maps the category names sources use in their tag objects to a variant.
    /// Unknown category names fall back to [`TagType::Any`].
    pub fn from_key(key: &str) -> Self {
        match key {
            "artist" | "author" => Self::Artist,
            "copyright" => Self::Copyright,
            "character" => Self::Character,
            "model" => Self::Model,
            "species" => Self::Species,
            "general" => Self::General,
            "meta" | "metadata" => Self::Meta,
            _ => Self::Any,
        }
    }
}

impl Tag {
    /// Creates a new `Tag`.
    ///
    /// # Arguments
    /// * `text`: The textual content of the tag.
    /// * `tag_type`: The [`TagType`] categorizing this tag.
    pub fn new(text: &str, tag_type: TagType) -> Self {
        Self {
            tag: text.to_string(),
            tag_type,
        }
    }

    /// Returns a reference to the textual content of the tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the [`TagType`] of the tag.
    pub const fn tag_type(&self) -> TagType {
        self.tag_type
    }
}
