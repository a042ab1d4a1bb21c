//! Filename template resolution.
//!
//! # Templates
//!
//! A template is a string of literal text and `%token%` references
//! (`"%artist% - %id%.%ext%"`). Resolution against one post is
//! deterministic: the same template and the same post always produce the
//! same relative path.
//!
//! On top of the primary template sit an ordered list of *conditional*
//! templates, each guarded by a tag expression or a token-presence check.
//! Guards are evaluated top to bottom and the last matching one wins.
//! A script template, when set, replaces token substitution entirely; see
//! [`script`].
//!
//! Validation is non-fatal by design: [`FilenameTemplate::validate`] returns
//! a list of warnings and the caller decides whether to save anyway.
use std::collections::HashMap;

use ibh_common::log::debug;
use ibh_common::post::{tags::TagType, Post};
use thiserror::Error;

pub mod script;

pub use script::ScriptError;

/// Token names the engine knows how to resolve.
pub const KNOWN_TOKENS: &[&str] = &[
    "id", "md5", "ext", "tags", "artist", "copyright", "character", "species", "rating", "score",
    "width", "height", "search", "site", "date", "num", "title", "source",
];

/// Everything a template can draw values from: the post itself plus the
/// search that found it.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub post: &'a Post,
    pub search_tags: &'a [String],
    pub source: &'a str,
    /// Value of `%num%`, assigned by the queue when one search yields
    /// several files that would otherwise collide.
    pub sequence: Option<u32>,
}

/// Sort order applied to multi-valued tokens before joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Original,
    Alphabetical,
}

/// What to do when a multi-valued token has more values than wanted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Truncation {
    #[default]
    KeepAll,
    KeepCount(usize),
    /// Keep the first N values and append a fixed suffix.
    KeepCountSuffix(usize, String),
    /// Replace the whole list with a fixed text.
    ReplaceAll(String),
}

/// Per-token configuration for multi-valued tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOptions {
    /// Separator placed between values when joining.
    pub separator: String,
    pub sort: SortOrder,
    pub truncation: Truncation,
    /// Pick the single shortest value instead of joining all of them.
    pub shortest: bool,
}

impl Default for TokenOptions {
    fn default() -> Self {
        Self {
            separator: " ".to_string(),
            sort: SortOrder::Original,
            truncation: Truncation::KeepAll,
            shortest: false,
        }
    }
}

/// Guard of a conditional template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// All listed tags must be present on the post.
    Tags(Vec<String>),
    /// The named token must resolve to a non-empty value.
    Token(String),
}

impl Condition {
    fn matches(&self, ctx: &TemplateContext) -> bool {
        match self {
            Self::Tags(tags) => tags.iter().all(|t| ctx.post.has_tag(t)),
            Self::Token(token) => {
                token_value(token, ctx, &TokenOptions::default()).is_some_and(|v| !v.is_empty())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalTemplate {
    pub condition: Condition,
    pub template: String,
}

/// Non-fatal findings of [`FilenameTemplate::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateWarning {
    /// The template text is empty.
    EmptyTemplate,
    /// A `%token%` reference the engine cannot resolve.
    UnresolvedToken(String),
    /// Characters Windows filesystems reject: `* ? " : < > |`.
    ForbiddenCharacters(String),
    /// The template does not end with an `%ext%` token.
    MissingExtension,
    /// No `%md5%`, `%id%` or `%num%` anywhere: different posts can resolve
    /// to the same name.
    NotUnique,
    /// `%num%` counters race when several downloads run at once.
    ConcurrentCounter,
    /// The script template failed to parse. Saving is still permitted if the
    /// user explicitly confirms.
    InvalidScript(String),
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template resolved to an empty filename")]
    EmptyResult,

    #[error("Script evaluation failed: {source}")]
    Script {
        #[from]
        source: ScriptError,
    },
}

/// A complete filename configuration: primary template, conditional
/// overrides, per-token options and the optional script mode.
#[derive(Debug, Clone, Default)]
pub struct FilenameTemplate {
    primary: String,
    conditionals: Vec<ConditionalTemplate>,
    token_options: HashMap<String, TokenOptions>,
    script: Option<String>,
}

impl FilenameTemplate {
    pub fn new(primary: &str) -> Self {
        Self {
            primary: primary.to_string(),
            ..Self::default()
        }
    }

    /// Appends a conditional template. Order matters: when several guards
    /// match, the one appended last wins.
    #[must_use]
    pub fn with_conditional(mut self, condition: Condition, template: &str) -> Self {
        self.conditionals.push(ConditionalTemplate {
            condition,
            template: template.to_string(),
        });
        self
    }

    #[must_use]
    pub fn with_token_options(mut self, token: &str, options: TokenOptions) -> Self {
        self.token_options.insert(token.to_string(), options);
        self
    }

    /// Switches the template into script mode; the expression replaces token
    /// substitution entirely.
    #[must_use]
    pub fn with_script(mut self, script: &str) -> Self {
        self.script = Some(script.to_string());
        self
    }

    /// The template string that applies to this post: the last conditional
    /// whose guard matches, or the primary.
    fn active_template(&self, ctx: &TemplateContext) -> &str {
        self.conditionals
            .iter()
            .rev()
            .find(|c| c.condition.matches(ctx))
            .map_or(self.primary.as_str(), |c| c.template.as_str())
    }

    /// Resolves the template against one post into a relative filename.
    pub fn resolve(&self, ctx: &TemplateContext) -> Result<String, TemplateError> {
        if let Some(script) = &self.script {
            let resolved = script::evaluate(script, ctx)?;
            if resolved.trim().is_empty() {
                return Err(TemplateError::EmptyResult);
            }
            return Ok(resolved);
        }

        let template = self.active_template(ctx);
        let mut out = String::with_capacity(template.len() * 2);
        let mut rest = template;

        while let Some(start) = rest.find('%') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('%') {
                Some(end) => {
                    let name = &after[..end];
                    match token_value(name, ctx, self.options_for(name)) {
                        Some(value) => out.push_str(&value),
                        None => debug!("Token '%{name}%' resolved empty"),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // Unpaired '%', keep it literally.
                    out.push('%');
                    rest = after;
                }
            }
        }
        out.push_str(rest);

        let trimmed = out.trim();
        if trimmed.is_empty() {
            return Err(TemplateError::EmptyResult);
        }
        Ok(trimmed.to_string())
    }

    fn options_for(&self, token: &str) -> &TokenOptions {
        static DEFAULT: once_cell::sync::Lazy<TokenOptions> =
            once_cell::sync::Lazy::new(TokenOptions::default);
        self.token_options.get(token).unwrap_or(&DEFAULT)
    }

    /// Checks the whole configuration and reports everything a careful user
    /// would want to know before saving. Never fails: saving a template with
    /// warnings is the user's call.
    pub fn validate(&self, simultaneous_downloads: u8) -> Vec<TemplateWarning> {
        let mut warnings = Vec::new();

        if let Some(script) = &self.script {
            if let Err(error) = script::check(script) {
                warnings.push(TemplateWarning::InvalidScript(error.to_string()));
            }
            return warnings;
        }

        let mut templates = vec![self.primary.as_str()];
        templates.extend(self.conditionals.iter().map(|c| c.template.as_str()));

        for template in templates {
            if template.trim().is_empty() {
                warnings.push(TemplateWarning::EmptyTemplate);
                continue;
            }

            let tokens = referenced_tokens(template);
            for token in &tokens {
                if !KNOWN_TOKENS.contains(&token.as_str()) {
                    warnings.push(TemplateWarning::UnresolvedToken(token.clone()));
                }
            }

            let literal: String = strip_tokens(template);
            let forbidden: String = literal
                .chars()
                .filter(|c| matches!(c, '*' | '?' | '"' | ':' | '<' | '>' | '|'))
                .collect();
            if !forbidden.is_empty() {
                warnings.push(TemplateWarning::ForbiddenCharacters(forbidden));
            }

            if !template.trim_end().ends_with("%ext%") {
                warnings.push(TemplateWarning::MissingExtension);
            }

            let unique = ["md5", "id", "num"]
                .iter()
                .any(|u| tokens.iter().any(|t| t == u));
            if !unique {
                warnings.push(TemplateWarning::NotUnique);
            }

            if simultaneous_downloads > 1 && tokens.iter().any(|t| t == "num") {
                warnings.push(TemplateWarning::ConcurrentCounter);
            }
        }

        warnings
    }
}

fn referenced_tokens(template: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('%') {
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) => {
                if end > 0 {
                    tokens.push(after[..end].to_string());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    tokens
}

fn strip_tokens(template: &str) -> String {
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) => rest = &after[end + 1..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Resolves one token name against the context. `None` means the token is
/// unknown or has no value for this post; the caller substitutes nothing.
///
/// Filesystem separators inside values are flattened so a tag can never
/// smuggle in a directory change.
pub(crate) fn token_value(
    name: &str,
    ctx: &TemplateContext,
    options: &TokenOptions,
) -> Option<String> {
    let post = ctx.post;

    let single = |value: String| Some(sanitize(&value));

    match name {
        "id" => single(post.id.to_string()),
        "md5" => single(post.md5.clone().unwrap_or_default()),
        "ext" => single(post.extension.to_string()),
        "rating" => single(post.rating.to_string().to_lowercase()),
        "score" => single(post.score.to_string()),
        "width" => single(post.width.to_string()),
        "height" => single(post.height.to_string()),
        "search" => single(ctx.search_tags.join(" ")),
        "site" => single(ctx.source.to_string()),
        "title" => single(post.title.clone().unwrap_or_default()),
        "source" => single(post.source_url.clone().unwrap_or_default()),
        "date" => single(
            post.created_at
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
        ),
        "num" => single(ctx.sequence.map(|n| n.to_string()).unwrap_or_default()),
        "tags" => {
            let values: Vec<String> = post.tag_names().map(str::to_string).collect();
            single(join_values(values, options))
        }
        "artist" => {
            let mut values: Vec<String> = post
                .tags_of_type(TagType::Artist)
                .into_iter()
                .map(str::to_string)
                .collect();
            if values.is_empty() && !post.author.is_empty() {
                values.push(post.author.clone());
            }
            single(join_values(values, options))
        }
        "copyright" => {
            let values: Vec<String> = post
                .tags_of_type(TagType::Copyright)
                .into_iter()
                .map(str::to_string)
                .collect();
            single(join_values(values, options))
        }
        "character" => {
            let values: Vec<String> = post
                .tags_of_type(TagType::Character)
                .into_iter()
                .map(str::to_string)
                .collect();
            single(join_values(values, options))
        }
        "species" => {
            let values: Vec<String> = post
                .tags_of_type(TagType::Species)
                .into_iter()
                .map(str::to_string)
                .collect();
            single(join_values(values, options))
        }
        _ => None,
    }
}

fn join_values(mut values: Vec<String>, options: &TokenOptions) -> String {
    if options.shortest {
        return values
            .into_iter()
            .min_by_key(String::len)
            .unwrap_or_default();
    }

    if options.sort == SortOrder::Alphabetical {
        values.sort();
    }

    match &options.truncation {
        Truncation::KeepAll => {}
        Truncation::KeepCount(keep) => values.truncate(*keep),
        Truncation::KeepCountSuffix(keep, suffix) => {
            if values.len() > *keep {
                values.truncate(*keep);
                values.push(suffix.clone());
            }
        }
        Truncation::ReplaceAll(text) => {
            if !values.is_empty() {
                values = vec![text.clone()];
            }
        }
    }

    values.join(&options.separator)
}

fn sanitize(value: &str) -> String {
    value.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod test {
    use super::*;
    use ibh_common::post::{
        extension::Extension,
        tags::{Tag, TagType},
    };

    fn post() -> Post {
        Post {
            id: 9000,
            md5: Some("0123abcd".to_string()),
            extension: Extension::PNG,
            score: 12,
            tags: vec![
                Tag::new("zeta", TagType::General),
                Tag::new("alpha", TagType::General),
                Tag::new("painter", TagType::Artist),
                Tag::new("long_artist_alias", TagType::Artist),
            ],
            ..Post::default()
        }
    }

    fn ctx(post: &Post) -> TemplateContext {
        TemplateContext {
            post,
            search_tags: &[],
            source: "testbooru",
            sequence: None,
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let template = FilenameTemplate::new("%artist% - %id%.%ext%");
        let p = post();
        let first = template.resolve(&ctx(&p)).unwrap();
        let second = template.resolve(&ctx(&p)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "painter long_artist_alias - 9000.png");
    }

    #[test]
    fn last_matching_conditional_wins() {
        let template = FilenameTemplate::new("%id%.%ext%")
            .with_conditional(Condition::Tags(vec!["alpha".to_string()]), "a_%id%.%ext%")
            .with_conditional(Condition::Tags(vec!["zeta".to_string()]), "z_%id%.%ext%")
            .with_conditional(
                Condition::Tags(vec!["missing".to_string()]),
                "never_%id%.%ext%",
            );

        let p = post();
        // Both "alpha" and "zeta" guards match; the later one overrides.
        assert_eq!(template.resolve(&ctx(&p)).unwrap(), "z_9000.png");
    }

    #[test]
    fn token_presence_condition() {
        let template = FilenameTemplate::new("%id%.%ext%")
            .with_conditional(Condition::Token("md5".to_string()), "%md5%.%ext%");
        let mut p = post();
        assert_eq!(template.resolve(&ctx(&p)).unwrap(), "0123abcd.png");

        p.md5 = None;
        assert_eq!(template.resolve(&ctx(&p)).unwrap(), "9000.png");
    }

    #[test]
    fn token_options_sort_truncate_separator() {
        let template = FilenameTemplate::new("%tags%.%ext%").with_token_options(
            "tags",
            TokenOptions {
                separator: "_".to_string(),
                sort: SortOrder::Alphabetical,
                truncation: Truncation::KeepCount(2),
                shortest: false,
            },
        );
        let p = post();
        assert_eq!(template.resolve(&ctx(&p)).unwrap(), "alpha_long_artist_alias.png");
    }

    #[test]
    fn truncation_suffix_and_replace() {
        let suffix = FilenameTemplate::new("%tags%").with_token_options(
            "tags",
            TokenOptions {
                truncation: Truncation::KeepCountSuffix(1, "etc".to_string()),
                ..TokenOptions::default()
            },
        );
        let p = post();
        assert_eq!(suffix.resolve(&ctx(&p)).unwrap(), "zeta etc");

        let replaced = FilenameTemplate::new("%tags%").with_token_options(
            "tags",
            TokenOptions {
                truncation: Truncation::ReplaceAll("many_tags".to_string()),
                ..TokenOptions::default()
            },
        );
        assert_eq!(replaced.resolve(&ctx(&p)).unwrap(), "many_tags");
    }

    #[test]
    fn shortest_candidate_mode() {
        let template = FilenameTemplate::new("%artist%").with_token_options(
            "artist",
            TokenOptions {
                shortest: true,
                ..TokenOptions::default()
            },
        );
        let p = post();
        assert_eq!(template.resolve(&ctx(&p)).unwrap(), "painter");
    }

    #[test]
    fn values_cannot_escape_the_directory() {
        let mut p = post();
        p.md5 = Some("../../etc/passwd".to_string());
        let template = FilenameTemplate::new("%md5%.%ext%");
        let resolved = template.resolve(&ctx(&p)).unwrap();
        assert!(!resolved.contains('/'));
    }

    #[test]
    fn validation_warnings() {
        let warnings = FilenameTemplate::new("%id%.%ext%").validate(1);
        assert!(warnings.is_empty());

        let warnings = FilenameTemplate::new("%wat% <copy>").validate(1);
        assert!(warnings.contains(&TemplateWarning::UnresolvedToken("wat".to_string())));
        assert!(warnings
            .iter()
            .any(|w| matches!(w, TemplateWarning::ForbiddenCharacters(_))));
        assert!(warnings.contains(&TemplateWarning::MissingExtension));
        assert!(warnings.contains(&TemplateWarning::NotUnique));

        let warnings = FilenameTemplate::new("%num%_%tags%.%ext%").validate(4);
        assert!(warnings.contains(&TemplateWarning::ConcurrentCounter));

        let warnings = FilenameTemplate::new("").validate(1);
        assert!(warnings.contains(&TemplateWarning::EmptyTemplate));
    }

    #[test]
    fn empty_resolution_is_an_error() {
        let mut p = post();
        p.md5 = None;
        let template = FilenameTemplate::new("%md5%");
        assert!(matches!(
            template.resolve(&ctx(&p)),
            Err(TemplateError::EmptyResult)
        ));
    }
}
