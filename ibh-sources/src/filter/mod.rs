//! Blacklist / whitelist / post-filter evaluation.
//!
//! # Filters
//!
//! A blacklist is an OR of lines, each line an AND of predicates; one
//! matching line flags the post. A whitelist is an OR of tag predicates; a
//! match marks the post for automatic download consideration. A post-filter
//! is a single free-form line AND-combined with the blacklist check, used to
//! narrow an already-fetched page without a new request.
//!
//! Every evaluation produces a human-readable reason string so the shell can
//! tell the user *why* a post was hidden. A post matching both the whitelist
//! and the blacklist is surfaced as a [`FilterVerdict::Conflict`] decision
//! point — deliberately asymmetric with the blacklist-only auto-hide.
use ahash::AHashSet;
use chrono::NaiveDate;
use ibh_common::post::{rating::Rating, tags::TagType, Post};

/// Comparison operators of the meta predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Gt,
    StartsWith,
}

/// The post attributes a meta predicate can compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaField {
    Rating,
    Score,
    Id,
    Date,
    Source,
}

/// One predicate of a filter line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Matches when the post carries this exact tag.
    Tag(String),
    /// `%token%` syntax: matches when the post has a non-empty value for the
    /// named filename token.
    TokenPresent(String),
    Meta {
        field: MetaField,
        op: CompareOp,
        value: String,
    },
}

impl Predicate {
    /// Parses one whitespace-delimited filter token.
    pub fn parse(token: &str) -> Self {
        if token.len() > 2 && token.starts_with('%') && token.ends_with('%') {
            return Self::TokenPresent(token[1..token.len() - 1].to_string());
        }

        if let Some((head, rest)) = token.split_once(':') {
            let field = match head {
                "rating" => Some(MetaField::Rating),
                "score" => Some(MetaField::Score),
                "id" => Some(MetaField::Id),
                "date" => Some(MetaField::Date),
                "source" => Some(MetaField::Source),
                _ => None,
            };
            if let Some(field) = field {
                let (op, value) = match rest.as_bytes().first() {
                    Some(b'<') => (CompareOp::Lt, &rest[1..]),
                    Some(b'>') => (CompareOp::Gt, &rest[1..]),
                    Some(b'=') => (CompareOp::Eq, &rest[1..]),
                    _ if field == MetaField::Source => (CompareOp::StartsWith, rest),
                    _ => (CompareOp::Eq, rest),
                };
                return Self::Meta {
                    field,
                    op,
                    value: value.to_string(),
                };
            }
        }

        Self::Tag(token.to_string())
    }

    pub fn matches(&self, post: &Post) -> bool {
        match self {
            Self::Tag(tag) => post.has_tag(tag),
            Self::TokenPresent(token) => token_present(post, token),
            Self::Meta { field, op, value } => meta_matches(post, *field, *op, value),
        }
    }

    /// Why a post matched this predicate, for blacklist surfacing.
    pub fn reason(&self) -> String {
        match self {
            Self::Tag(tag) => format!("image contains tag '{tag}'"),
            Self::TokenPresent(token) => format!("image has a value for token '%{token}%'"),
            Self::Meta { field, value, .. } => {
                format!("image's {} matches '{value}'", field_name(*field))
            }
        }
    }

    /// Why a post failed this predicate, for post-filter surfacing.
    pub fn mismatch_reason(&self) -> String {
        match self {
            Self::Tag(tag) => format!("image does not contain tag '{tag}'"),
            Self::TokenPresent(token) => format!("image has no value for token '%{token}%'"),
            Self::Meta { field, .. } => {
                format!("image's {} does not match", field_name(*field))
            }
        }
    }
}

const fn field_name(field: MetaField) -> &'static str {
    match field {
        MetaField::Rating => "rating",
        MetaField::Score => "score",
        MetaField::Id => "id",
        MetaField::Date => "date",
        MetaField::Source => "source",
    }
}

fn token_present(post: &Post, token: &str) -> bool {
    match token {
        "id" => true,
        "md5" => post.md5.is_some(),
        "tags" => !post.tags.is_empty(),
        "artist" => !post.tags_of_type(TagType::Artist).is_empty() || !post.author.is_empty(),
        "source" => post.source_url.is_some(),
        "sample" => post.sample_url.is_some(),
        "title" => post.title.is_some(),
        "date" => post.created_at.is_some(),
        "ext" => post.extension != ibh_common::post::extension::Extension::Unknown,
        _ => false,
    }
}

fn meta_matches(post: &Post, field: MetaField, op: CompareOp, value: &str) -> bool {
    match field {
        MetaField::Rating => post.rating == Rating::from_rating_str(value),
        MetaField::Score => compare_i64(post.score, op, value.parse().unwrap_or(i64::MAX)),
        MetaField::Id => compare_i64(post.id as i64, op, value.parse().unwrap_or(i64::MAX)),
        MetaField::Date => {
            let Some(created) = post.created_at else {
                return false;
            };
            let Ok(wanted) = NaiveDate::parse_from_str(value, "%Y-%m-%d") else {
                return false;
            };
            let date = created.date_naive();
            match op {
                CompareOp::Eq | CompareOp::StartsWith => date == wanted,
                CompareOp::Lt => date < wanted,
                CompareOp::Gt => date > wanted,
            }
        }
        MetaField::Source => {
            let Some(source) = &post.source_url else {
                return false;
            };
            match op {
                CompareOp::StartsWith => source.starts_with(value),
                CompareOp::Eq => source == value,
                CompareOp::Lt | CompareOp::Gt => false,
            }
        }
    }
}

const fn compare_i64(have: i64, op: CompareOp, want: i64) -> bool {
    match op {
        CompareOp::Eq | CompareOp::StartsWith => have == want,
        CompareOp::Lt => have < want,
        CompareOp::Gt => have > want,
    }
}

/// One line of a blacklist or a post-filter: an AND of predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLine {
    raw: String,
    preds: Vec<Predicate>,
}

impl FilterLine {
    pub fn parse(line: &str) -> Self {
        Self {
            raw: line.trim().to_string(),
            preds: line.split_whitespace().map(Predicate::parse).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// `Some(reason)` when every predicate matches the post.
    pub fn matches(&self, post: &Post) -> Option<String> {
        if self.preds.is_empty() {
            return None;
        }
        if self.preds.iter().all(|p| p.matches(post)) {
            let reasons: Vec<String> = self.preds.iter().map(Predicate::reason).collect();
            return Some(reasons.join("; "));
        }
        None
    }

    /// `Err(reason)` naming the first failing predicate, for post-filter use
    /// where the post must satisfy the whole line to be kept.
    pub fn require(&self, post: &Post) -> Result<(), String> {
        for pred in &self.preds {
            if !pred.matches(post) {
                return Err(pred.mismatch_reason());
            }
        }
        Ok(())
    }
}

/// The three independent predicate sets evaluated for each post.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    /// Single-tag blacklist lines, collapsed into a set for O(1) matching.
    simple_blacklist: AHashSet<String>,
    blacklist: Vec<FilterLine>,
    whitelist: Vec<Predicate>,
    post_filter: Option<FilterLine>,
}

/// Outcome of one post's filter evaluation, reasons included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Allowed,
    Blacklisted {
        reason: String,
    },
    Whitelisted {
        reason: String,
    },
    /// The post matched both lists. The caller decides download-anyway vs
    /// skip; the engine never resolves this silently.
    Conflict {
        whitelisted: String,
        blacklisted: String,
    },
}

impl FilterVerdict {
    /// Whether the pipeline may enqueue the post without asking anyone.
    pub const fn is_download_allowed(&self) -> bool {
        matches!(self, Self::Allowed | Self::Whitelisted { .. })
    }
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a blacklist document: one line per OR branch, empty lines and
    /// `#` comments skipped. Lines holding a single plain tag go into the
    /// fast set; everything else stays a predicate line.
    pub fn with_blacklist(mut self, text: &str) -> Self {
        self.simple_blacklist.clear();
        self.blacklist.clear();

        for line in text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
        {
            let parsed = FilterLine::parse(line);
            if let [Predicate::Tag(tag)] = parsed.preds.as_slice() {
                self.simple_blacklist.insert(tag.clone());
            } else {
                self.blacklist.push(parsed);
            }
        }
        self
    }

    pub fn with_whitelist(mut self, tags: &[String]) -> Self {
        self.whitelist = tags.iter().map(|t| Predicate::parse(t)).collect();
        self
    }

    /// The per-search free-form predicate line.
    pub fn with_post_filter(mut self, line: &str) -> Self {
        let parsed = FilterLine::parse(line);
        self.post_filter = (!parsed.is_empty()).then_some(parsed);
        self
    }

    /// Evaluates all three sets for one post.
    pub fn evaluate(&self, post: &Post) -> FilterVerdict {
        let blacklisted = post
            .tags
            .iter()
            .find(|t| self.simple_blacklist.contains(t.tag()))
            .map(|t| format!("image contains tag '{}'", t.tag()))
            .or_else(|| self.blacklist.iter().find_map(|line| line.matches(post)));

        let whitelisted = self
            .whitelist
            .iter()
            .find(|p| p.matches(post))
            .map(Predicate::reason);

        // The post-filter narrows like the blacklist, but a whitelist match
        // overrides it; only a true blacklist hit raises a conflict.
        let narrowed = blacklisted.or_else(|| {
            if whitelisted.is_some() {
                None
            } else {
                self.post_filter
                    .as_ref()
                    .and_then(|line| line.require(post).err())
            }
        });

        match (whitelisted, narrowed) {
            (Some(white), Some(black)) => FilterVerdict::Conflict {
                whitelisted: white,
                blacklisted: black,
            },
            (Some(white), None) => FilterVerdict::Whitelisted { reason: white },
            (None, Some(black)) => FilterVerdict::Blacklisted { reason: black },
            (None, None) => FilterVerdict::Allowed,
        }
    }

    /// Splits a page into (allowed, rejected-with-reason, conflicts), the
    /// shape the download pipeline consumes.
    pub fn partition(
        &self,
        posts: Vec<Post>,
    ) -> (Vec<Post>, Vec<(Post, String)>, Vec<(Post, String, String)>) {
        let mut allowed = Vec::with_capacity(posts.len());
        let mut rejected = Vec::new();
        let mut conflicts = Vec::new();

        for post in posts {
            match self.evaluate(&post) {
                FilterVerdict::Allowed | FilterVerdict::Whitelisted { .. } => allowed.push(post),
                FilterVerdict::Blacklisted { reason } => rejected.push((post, reason)),
                FilterVerdict::Conflict {
                    whitelisted,
                    blacklisted,
                } => conflicts.push((post, whitelisted, blacklisted)),
            }
        }
        (allowed, rejected, conflicts)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ibh_common::post::tags::{Tag, TagType};

    fn post() -> Post {
        Post {
            id: 500,
            score: 25,
            rating: Rating::Safe,
            source_url: Some("https://twitter.com/artist/status/1".to_string()),
            created_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            md5: Some("cafebabe".to_string()),
            tags: vec![
                Tag::new("1girl", TagType::General),
                Tag::new("sky", TagType::General),
                Tag::new("gore", TagType::General),
            ],
            ..Post::default()
        }
    }

    #[test]
    fn line_is_an_and_of_predicates() {
        let line = FilterLine::parse("gore rating:safe");
        assert!(line.matches(&post()).is_some());

        let line = FilterLine::parse("gore rating:explicit");
        assert!(line.matches(&post()).is_none());
    }

    #[test]
    fn blacklist_is_an_or_of_lines() {
        let filters = FilterSet::new().with_blacklist("guro\ngore score:>10\n");
        match filters.evaluate(&post()) {
            FilterVerdict::Blacklisted { reason } => {
                assert!(reason.contains("image contains tag 'gore'"));
                assert!(reason.contains("score"));
            }
            other => panic!("expected blacklist verdict, got {other:?}"),
        }
    }

    #[test]
    fn meta_compare_operators() {
        let p = post();
        assert!(Predicate::parse("score:>10").matches(&p));
        assert!(!Predicate::parse("score:>100").matches(&p));
        assert!(Predicate::parse("score:<100").matches(&p));
        assert!(Predicate::parse("score:=25").matches(&p));
        assert!(Predicate::parse("id:500").matches(&p));
        assert!(Predicate::parse("date:>2024-01-01").matches(&p));
        assert!(!Predicate::parse("date:<2024-01-01").matches(&p));
        assert!(Predicate::parse("source:https://twitter.com").matches(&p));
        assert!(!Predicate::parse("source:https://pixiv.net").matches(&p));
    }

    #[test]
    fn token_presence() {
        let p = post();
        assert!(Predicate::parse("%md5%").matches(&p));
        assert!(!Predicate::parse("%title%").matches(&p));
    }

    #[test]
    fn whitelist_and_blacklist_conflict_is_surfaced() {
        let filters = FilterSet::new()
            .with_blacklist("gore")
            .with_whitelist(&["sky".to_string()]);

        match filters.evaluate(&post()) {
            FilterVerdict::Conflict {
                whitelisted,
                blacklisted,
            } => {
                assert!(whitelisted.contains("sky"));
                assert!(blacklisted.contains("gore"));
            }
            other => panic!("conflict must never be silently resolved, got {other:?}"),
        }
    }

    #[test]
    fn whitelist_overrides_post_filter_but_not_blacklist() {
        let filters = FilterSet::new()
            .with_whitelist(&["sky".to_string()])
            .with_post_filter("rating:explicit");
        assert!(matches!(
            filters.evaluate(&post()),
            FilterVerdict::Whitelisted { .. }
        ));
    }

    #[test]
    fn post_filter_narrows_with_reason() {
        let filters = FilterSet::new().with_post_filter("rating:explicit");
        match filters.evaluate(&post()) {
            FilterVerdict::Blacklisted { reason } => {
                assert_eq!(reason, "image's rating does not match");
            }
            other => panic!("expected narrow verdict, got {other:?}"),
        }
    }

    #[test]
    fn partition_buckets() {
        let filters = FilterSet::new()
            .with_blacklist("gore")
            .with_whitelist(&["landscape".to_string()]);

        let mut clean = post();
        clean.id = 501;
        clean.tags = vec![Tag::new("sky", TagType::General)];

        let (allowed, rejected, conflicts) = filters.partition(vec![post(), clean]);
        assert_eq!(allowed.len(), 1);
        assert_eq!(rejected.len(), 1);
        assert!(conflicts.is_empty());
        assert_eq!(allowed[0].id, 501);
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let filters = FilterSet::new().with_blacklist("# comment line\n\n   \ngore\n");
        assert!(!filters.evaluate(&post()).is_download_allowed());
    }
}
