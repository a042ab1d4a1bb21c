//! Static per-site configuration.
//!
//! A [`SourceDescriptor`] is created when the registry loads (from the
//! built-in table or a TOML document) and is immutable afterwards; editing a
//! source replaces its descriptor wholesale. Validation happens once at
//! registration time so a malformed descriptor can never fail a request
//! mid-batch.
use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use bitflags::bitflags;
use ibh_common::serde::{Deserialize, Serialize};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::auth::AuthScheme;

pub mod registry;

pub(crate) const DEFAULT_UA: &str =
    concat!("Rust Imageboard Harvester/", env!("CARGO_PKG_VERSION"));

/// Which wire format the site's search API speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFormat {
    /// JSON documents walked through declared field paths.
    Json,
    /// Structured markup (XML) read through declared attribute/element names.
    Markup,
    /// Plain responses mined with an ordered list of named capture patterns.
    Regex,
    /// RSS/Atom feeds mapped to minimal posts (title/link/date only).
    Feed,
}

/// The kind of resource a request is after. Pacing intervals are tracked
/// separately per resource type, so page listings don't starve image fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Thumbnail,
    Image,
    Page,
    Details,
    Error,
}

/// Minimum delay between two requests to the same site for each resource
/// type, stored in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollIntervals {
    pub thumbnail_ms: u64,
    pub image_ms: u64,
    pub page_ms: u64,
    pub details_ms: u64,
    pub error_ms: u64,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            thumbnail_ms: 0,
            image_ms: 500,
            page_ms: 500,
            details_ms: 500,
            error_ms: 3000,
        }
    }
}

impl PollIntervals {
    /// The configured interval for one resource type.
    pub const fn interval(&self, resource: ResourceType) -> Duration {
        let ms = match resource {
            ResourceType::Thumbnail => self.thumbnail_ms,
            ResourceType::Image => self.image_ms,
            ResourceType::Page => self.page_ms,
            ResourceType::Details => self.details_ms,
            ResourceType::Error => self.error_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Persistent answer to the "this site redirected us to HTTPS" question.
///
/// `Ask` is the initial state: the client surfaces the redirect as a decision
/// point and the caller records one of the other variants in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportPolicy {
    /// Always rewrite plaintext URLs to HTTPS before sending.
    Always,
    /// Keep plaintext for this site even though it offered an upgrade.
    NeverForSite,
    /// Keep plaintext everywhere.
    Never,
    /// No decision recorded yet; an observed upgrade redirect is surfaced.
    #[default]
    Ask,
}

bitflags! {
    /// What a source supports beyond a plain tag search.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SourceCapabilities: u32 {
        const TAG_SEARCH  = 0b0001;
        const SINGLE_POST = 0b0010;
        const AUTH        = 0b0100;
        const PAGINATION  = 0b1000;
    }
}

impl Default for SourceCapabilities {
    fn default() -> Self {
        Self::TAG_SEARCH | Self::PAGINATION
    }
}

/// Endpoint URLs for the operations a source supports. Which of them are
/// required depends on the declared [`ApiFormat`] and [`AuthScheme`];
/// [`SourceDescriptor::validate`] enforces that at registration time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Search endpoint returning one page of posts.
    pub post_list: Option<String>,
    /// Endpoint for one post's details, with `{id}` placeholder.
    pub post: Option<String>,
    /// Form-login URL for the form-based auth schemes.
    pub login: Option<String>,
    /// Token endpoint for the OAuth2 family.
    pub token: Option<String>,
}

/// Field paths used by the JSON and markup parsers to locate post attributes.
///
/// For JSON these are dot-separated paths into the document; for markup they
/// are attribute names (or child element names) on each post node. Only `id`
/// and `file_url` are required; everything else falls back to a documented
/// default when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    /// Path to the list of posts ("" means the document root is the list);
    /// for markup, the element name of one post node.
    pub posts: String,
    pub id: String,
    pub md5: Option<String>,
    pub file_url: String,
    pub sample_url: Option<String>,
    pub preview_url: Option<String>,
    pub source_url: Option<String>,
    /// Either a whitespace-joined string, an array of strings, or an object
    /// of per-type arrays (`{"artist": [..], "general": [..]}`).
    pub tags: Option<String>,
    pub rating: Option<String>,
    pub score: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub file_size: Option<String>,
    pub author: Option<String>,
    pub created_at: Option<String>,
    pub extension: Option<String>,
    pub parent_id: Option<String>,
    pub children: Option<String>,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            posts: String::new(),
            id: String::from("id"),
            md5: Some(String::from("md5")),
            file_url: String::from("file_url"),
            sample_url: None,
            preview_url: None,
            source_url: None,
            tags: Some(String::from("tags")),
            rating: Some(String::from("rating")),
            score: Some(String::from("score")),
            width: None,
            height: None,
            file_size: None,
            author: None,
            created_at: None,
            extension: None,
            parent_id: None,
            children: None,
        }
    }
}

/// One named pattern of the regex-extraction format. Rules are applied in
/// declaration order; the rule named `post` yields one post per match via its
/// named capture groups, the rule named `count` extracts the total hit count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexRule {
    pub name: String,
    pub pattern: String,
}

/// Errors surfaced when a descriptor is registered. These are the only
/// failures descriptors can produce; after registration they are inert data.
#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Source '{name}' declares the {format:?} format but is missing the '{endpoint}' endpoint")]
    MissingEndpoint {
        name: String,
        format: ApiFormat,
        endpoint: &'static str,
    },

    #[error("Source '{name}' declares the {format:?} format but has no field map")]
    MissingFieldMap { name: String, format: ApiFormat },

    #[error("Source '{name}' declares the regex format but has no 'post' rule")]
    MissingPostRule { name: String },

    #[error("Source '{name}' rule '{rule}' is not a valid pattern: {message}")]
    BadPattern {
        name: String,
        rule: String,
        message: String,
    },

    #[error("Source '{name}' base URL is not valid: {message}")]
    BadBaseUrl { name: String, message: String },

    #[error("Source '{name}' declares auth scheme {scheme:?} but is missing the '{endpoint}' endpoint")]
    MissingAuthEndpoint {
        name: String,
        scheme: AuthScheme,
        endpoint: &'static str,
    },

    #[error("A source named '{name}' is not registered")]
    UnknownSource { name: String },

    #[error("Failed to decode source descriptor: {0}")]
    DecodeError(#[from] toml::de::Error),
}

/// Static configuration of one remote site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub pretty_name: String,
    /// Monotonic descriptor revision, compared by the registry's
    /// update-available check.
    pub version: u32,
    pub base_url: String,
    pub api: ApiFormat,
    pub auth: AuthScheme,
    pub endpoints: Endpoints,
    #[serde(default)]
    pub intervals: PollIntervals,
    #[serde(default = "default_simultaneous")]
    pub max_simultaneous_downloads: u8,
    /// Tags silently appended to every search on this site.
    #[serde(default)]
    pub added_tags: Vec<String>,
    /// Tags silently stripped from every search on this site.
    #[serde(default)]
    pub removed_tags: Vec<String>,
    #[serde(default)]
    pub transport: TransportPolicy,
    #[serde(default)]
    pub capabilities: SourceCapabilities,
    #[serde(default = "default_ua")]
    pub user_agent: String,
    /// Field paths for the JSON/markup formats.
    #[serde(default)]
    pub field_map: Option<FieldMap>,
    /// Patterns for the regex format.
    #[serde(default)]
    pub regex_rules: Vec<RegexRule>,
    /// How many posts one page may carry at most.
    #[serde(default = "default_post_limit")]
    pub max_post_limit: u32,
}

const fn default_simultaneous() -> u8 {
    5
}

fn default_ua() -> String {
    DEFAULT_UA.to_string()
}

const fn default_post_limit() -> u32 {
    100
}

impl Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl SourceDescriptor {
    /// Checks that the descriptor is internally coherent: the declared API
    /// format has the endpoints and maps it needs, regex rules compile, and
    /// the declared auth scheme has somewhere to log in.
    ///
    /// Called by the registry on every insert; a descriptor that fails here
    /// is rejected before it can ever be used for a request.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if let Err(error) = url::Url::parse(&self.base_url) {
            return Err(DescriptorError::BadBaseUrl {
                name: self.name.clone(),
                message: error.to_string(),
            });
        }

        if self.endpoints.post_list.is_none() {
            return Err(DescriptorError::MissingEndpoint {
                name: self.name.clone(),
                format: self.api,
                endpoint: "post_list",
            });
        }

        match self.api {
            ApiFormat::Json | ApiFormat::Markup => {
                if self.field_map.is_none() {
                    return Err(DescriptorError::MissingFieldMap {
                        name: self.name.clone(),
                        format: self.api,
                    });
                }
            }
            ApiFormat::Regex => {
                if !self.regex_rules.iter().any(|r| r.name == "post") {
                    return Err(DescriptorError::MissingPostRule {
                        name: self.name.clone(),
                    });
                }
                for rule in &self.regex_rules {
                    if let Err(error) = regex::Regex::new(&rule.pattern) {
                        return Err(DescriptorError::BadPattern {
                            name: self.name.clone(),
                            rule: rule.name.clone(),
                            message: error.to_string(),
                        });
                    }
                }
            }
            ApiFormat::Feed => {}
        }

        match self.auth {
            AuthScheme::FormGet | AuthScheme::FormPost => {
                if self.endpoints.login.is_none() {
                    return Err(DescriptorError::MissingAuthEndpoint {
                        name: self.name.clone(),
                        scheme: self.auth,
                        endpoint: "login",
                    });
                }
            }
            scheme if scheme.is_oauth2() => {
                if self.endpoints.token.is_none() {
                    return Err(DescriptorError::MissingAuthEndpoint {
                        name: self.name.clone(),
                        scheme: self.auth,
                        endpoint: "token",
                    });
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Decodes a descriptor from a TOML document, the registry's load format.
    pub fn from_toml(doc: &str) -> Result<Self, DescriptorError> {
        let descriptor: Self = toml::from_str(doc)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// The search query this site actually receives: user tags plus the
    /// descriptor's added tags, minus its removed tags.
    pub fn effective_tags(&self, tags: &[String]) -> Vec<String> {
        let mut out: Vec<String> = tags
            .iter()
            .filter(|t| !self.removed_tags.contains(t))
            .cloned()
            .collect();
        for added in &self.added_tags {
            if !out.contains(added) {
                out.push(added.clone());
            }
        }
        out
    }
}

/// Built-in descriptor table, one entry per wire format the parsers support.
pub static DEFAULT_SOURCES: Lazy<HashMap<String, SourceDescriptor>> = Lazy::new(|| {
    let mut hmap = HashMap::with_capacity(4);
    hmap.insert(
        "danbooru".to_string(),
        SourceDescriptor {
            name: "danbooru".to_string(),
            pretty_name: "Danbooru".to_string(),
            version: 1,
            base_url: "https://danbooru.donmai.us".to_string(),
            api: ApiFormat::Json,
            auth: AuthScheme::HttpBasic,
            endpoints: Endpoints {
                post_list: Some("https://danbooru.donmai.us/posts.json".to_string()),
                post: Some("https://danbooru.donmai.us/posts/{id}.json".to_string()),
                login: None,
                token: None,
            },
            intervals: PollIntervals::default(),
            max_simultaneous_downloads: 5,
            added_tags: Vec::new(),
            removed_tags: Vec::new(),
            transport: TransportPolicy::Always,
            capabilities: SourceCapabilities::TAG_SEARCH
                | SourceCapabilities::SINGLE_POST
                | SourceCapabilities::AUTH
                | SourceCapabilities::PAGINATION,
            user_agent: DEFAULT_UA.to_string(),
            field_map: Some(FieldMap {
                posts: String::new(),
                id: "id".to_string(),
                md5: Some("md5".to_string()),
                file_url: "file_url".to_string(),
                sample_url: Some("large_file_url".to_string()),
                preview_url: Some("preview_file_url".to_string()),
                source_url: Some("source".to_string()),
                tags: Some("tag_string".to_string()),
                rating: Some("rating".to_string()),
                score: Some("score".to_string()),
                width: Some("image_width".to_string()),
                height: Some("image_height".to_string()),
                file_size: Some("file_size".to_string()),
                author: Some("tag_string_artist".to_string()),
                created_at: Some("created_at".to_string()),
                extension: Some("file_ext".to_string()),
                parent_id: Some("parent_id".to_string()),
                children: None,
            }),
            regex_rules: Vec::new(),
            max_post_limit: 200,
        },
    );
    hmap.insert(
        "gelbooru".to_string(),
        SourceDescriptor {
            name: "gelbooru".to_string(),
            pretty_name: "Gelbooru".to_string(),
            version: 1,
            base_url: "https://gelbooru.com".to_string(),
            api: ApiFormat::Markup,
            auth: AuthScheme::None,
            endpoints: Endpoints {
                post_list: Some(
                    "https://gelbooru.com/index.php?page=dapi&s=post&q=index".to_string(),
                ),
                post: None,
                login: None,
                token: None,
            },
            intervals: PollIntervals::default(),
            max_simultaneous_downloads: 5,
            added_tags: Vec::new(),
            removed_tags: Vec::new(),
            transport: TransportPolicy::Always,
            capabilities: SourceCapabilities::default(),
            user_agent: DEFAULT_UA.to_string(),
            field_map: Some(FieldMap {
                posts: "post".to_string(),
                ..FieldMap::default()
            }),
            regex_rules: Vec::new(),
            max_post_limit: 100,
        },
    );
    hmap.insert(
        "paheal".to_string(),
        SourceDescriptor {
            name: "paheal".to_string(),
            pretty_name: "Paheal".to_string(),
            version: 1,
            base_url: "https://rule34.paheal.net".to_string(),
            api: ApiFormat::Regex,
            auth: AuthScheme::None,
            endpoints: Endpoints {
                post_list: Some("https://rule34.paheal.net/post/list".to_string()),
                post: None,
                login: None,
                token: None,
            },
            intervals: PollIntervals::default(),
            max_simultaneous_downloads: 3,
            added_tags: Vec::new(),
            removed_tags: Vec::new(),
            transport: TransportPolicy::Always,
            capabilities: SourceCapabilities::default(),
            user_agent: DEFAULT_UA.to_string(),
            field_map: None,
            regex_rules: vec![RegexRule {
                name: "post".to_string(),
                pattern: r#"href="(?P<file_url>[^"]+/_images/(?P<md5>[0-9a-f]{32})[^"]*)"[^>]*id="thumb_(?P<id>\d+)""#
                    .to_string(),
            }],
            max_post_limit: 70,
        },
    );
    hmap.insert(
        "booru-feed".to_string(),
        SourceDescriptor {
            name: "booru-feed".to_string(),
            pretty_name: "Generic Booru Feed".to_string(),
            version: 1,
            base_url: "https://example.org".to_string(),
            api: ApiFormat::Feed,
            auth: AuthScheme::None,
            endpoints: Endpoints {
                post_list: Some("https://example.org/rss".to_string()),
                post: None,
                login: None,
                token: None,
            },
            intervals: PollIntervals::default(),
            max_simultaneous_downloads: 2,
            added_tags: Vec::new(),
            removed_tags: Vec::new(),
            transport: TransportPolicy::Ask,
            capabilities: SourceCapabilities::TAG_SEARCH,
            user_agent: DEFAULT_UA.to_string(),
            field_map: None,
            regex_rules: Vec::new(),
            max_post_limit: 50,
        },
    );
    hmap
});

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_validate() {
        for descriptor in DEFAULT_SOURCES.values() {
            descriptor.validate().unwrap();
        }
    }

    #[test]
    fn markup_without_field_map_is_rejected() {
        let mut descriptor = DEFAULT_SOURCES.get("gelbooru").unwrap().clone();
        descriptor.field_map = None;
        assert!(matches!(
            descriptor.validate(),
            Err(DescriptorError::MissingFieldMap { .. })
        ));
    }

    #[test]
    fn regex_without_post_rule_is_rejected() {
        let mut descriptor = DEFAULT_SOURCES.get("paheal").unwrap().clone();
        descriptor.regex_rules.clear();
        assert!(matches!(
            descriptor.validate(),
            Err(DescriptorError::MissingPostRule { .. })
        ));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let mut descriptor = DEFAULT_SOURCES.get("paheal").unwrap().clone();
        descriptor.regex_rules.push(RegexRule {
            name: "count".to_string(),
            pattern: "(unclosed".to_string(),
        });
        assert!(matches!(
            descriptor.validate(),
            Err(DescriptorError::BadPattern { .. })
        ));
    }

    #[test]
    fn bad_base_url_is_rejected() {
        let mut descriptor = DEFAULT_SOURCES.get("danbooru").unwrap().clone();
        descriptor.base_url = "not a url".to_string();
        assert!(matches!(
            descriptor.validate(),
            Err(DescriptorError::BadBaseUrl { .. })
        ));
    }

    #[test]
    fn missing_post_list_is_rejected() {
        let mut descriptor = DEFAULT_SOURCES.get("danbooru").unwrap().clone();
        descriptor.endpoints.post_list = None;
        assert!(matches!(
            descriptor.validate(),
            Err(DescriptorError::MissingEndpoint { .. })
        ));
    }

    #[test]
    fn toml_round_trip() {
        let descriptor = DEFAULT_SOURCES.get("danbooru").unwrap();
        let doc = toml::to_string(descriptor).unwrap();
        let back = SourceDescriptor::from_toml(&doc).unwrap();
        assert_eq!(&back, descriptor);
    }

    #[test]
    fn effective_tags_apply_descriptor_lists() {
        let mut descriptor = DEFAULT_SOURCES.get("danbooru").unwrap().clone();
        descriptor.added_tags = vec!["-ai_generated".to_string()];
        descriptor.removed_tags = vec!["banned_tag".to_string()];

        let tags = vec!["1girl".to_string(), "banned_tag".to_string()];
        assert_eq!(
            descriptor.effective_tags(&tags),
            vec!["1girl".to_string(), "-ai_generated".to_string()]
        );
    }
}
