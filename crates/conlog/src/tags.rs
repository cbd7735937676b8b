//! Tag computation.
//!
//! [`TagEngine::compute`] derives the full tag set of an entry from three
//! sources, each optional:
//!
//! - `[token]` brackets in the content (optionally first line only)
//! - `at Identifier` / `in Identifier` frames in the detail, keeping the last
//!   dot-separated segment when it is short enough
//! - user [`TagRule`]s
//!
//! The result is a set, so source and rule order never change it.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::config::TagConfig;
use crate::types::{Entry, MatchKind, TagRule, TagSet, text_matches};

static BRACKET_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\[\]\r\n]*)\]").unwrap_or_else(|_| unreachable!()));

static TRACE_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:at|in)\s+([\p{L}_][\p{L}\p{N}_.]*)").unwrap_or_else(|_| unreachable!())
});

enum Matcher {
    Literal { kind: MatchKind, needle: String },
    // None when the pattern failed to compile; such a rule never matches.
    Regex(Option<Regex>),
}

struct CompiledRule {
    rule: TagRule,
    matcher: Matcher,
}

impl CompiledRule {
    fn compile(rule: &TagRule) -> Self {
        let matcher = match rule.kind {
            MatchKind::Regex => match rule.compile_regex() {
                Ok(re) => Matcher::Regex(Some(re)),
                Err(e) => {
                    warn!(error = %e, "tag rule disabled");
                    Matcher::Regex(None)
                }
            },
            kind => Matcher::Literal {
                kind,
                needle: rule.pattern.to_lowercase(),
            },
        };
        Self {
            rule: rule.clone(),
            matcher,
        }
    }

    fn matches(&self, text: &LoweredText<'_>) -> bool {
        match &self.matcher {
            Matcher::Regex(None) => false,
            Matcher::Regex(Some(re)) => self
                .rule
                .test_targets(text.content, text.detail, |t| re.is_match(t)),
            Matcher::Literal { kind, needle } => {
                self.rule
                    .test_targets(&text.content_lower, &text.detail_lower, |t| {
                        text_matches(*kind, t, needle)
                    })
            }
        }
    }
}

struct LoweredText<'a> {
    content: &'a str,
    detail: &'a str,
    content_lower: String,
    detail_lower: String,
}

/// Computes entry tags from a [`TagConfig`].
pub struct TagEngine {
    config: TagConfig,
    rules: Vec<CompiledRule>,
}

impl Default for TagEngine {
    fn default() -> Self {
        Self::new(TagConfig::default())
    }
}

impl TagEngine {
    /// Creates an engine, compiling the configured rules once.
    #[must_use]
    pub fn new(config: TagConfig) -> Self {
        let rules = config.rules.iter().map(CompiledRule::compile).collect();
        Self { config, rules }
    }

    /// Replaces the configuration. Entries tagged earlier keep their tags
    /// until they are recomputed.
    pub fn reload(&mut self, config: TagConfig) {
        *self = Self::new(config);
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &TagConfig {
        &self.config
    }

    /// Computes the tag set for an entry.
    #[must_use]
    pub fn compute(&self, entry: &Entry) -> TagSet {
        let mut tags = TagSet::new();

        if self.config.bracket_tags {
            let scanned = if self.config.bracket_first_line_only {
                entry.first_line()
            } else {
                entry.content.as_str()
            };
            for caps in BRACKET_TAG.captures_iter(scanned) {
                let token = caps[1].trim();
                if !token.is_empty() {
                    tags.insert(token);
                }
            }
        }

        if self.config.trace_tags {
            for line in entry.detail.lines() {
                for caps in TRACE_FRAME.captures_iter(line) {
                    let segment = caps[1].rsplit('.').next().unwrap_or("").trim();
                    if !segment.is_empty() && segment.chars().count() < self.config.max_trace_tag_len {
                        tags.insert(segment);
                    }
                }
            }
        }

        if !self.rules.is_empty() {
            let text = LoweredText {
                content: &entry.content,
                detail: &entry.detail,
                content_lower: entry.content.to_lowercase(),
                detail_lower: entry.detail.to_lowercase(),
            };
            for rule in &self.rules {
                if rule.matches(&text) {
                    tags.insert(&rule.rule.name);
                }
            }
        }

        tags
    }

    /// Recomputes and replaces the entry's tags.
    pub fn apply(&self, entry: &mut Entry) {
        entry.tags = self.compute(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MatchTarget, Severity};
    use test_case::test_case;

    fn entry(content: &str, detail: &str) -> Entry {
        Entry::new(content, detail, Severity::Info, "t", 0)
    }

    fn names(tags: &TagSet) -> Vec<&str> {
        tags.names().collect()
    }

    #[test]
    fn bracket_tags_are_extracted() {
        let engine = TagEngine::default();
        let tags = engine.compute(&entry("[Network] ok [UI]", ""));
        assert_eq!(names(&tags), vec!["Network", "UI"]);
    }

    #[test]
    fn bracket_tags_trim_and_skip_empty() {
        let engine = TagEngine::default();
        let tags = engine.compute(&entry("[ Audio ] [] [   ] [audio]", ""));
        assert_eq!(names(&tags), vec!["Audio"]);
    }

    #[test]
    fn bracket_first_line_only() {
        let mut config = TagConfig::default();
        config.bracket_first_line_only = true;
        let engine = TagEngine::new(config);
        let tags = engine.compute(&entry("[First] line\n[Second] line", ""));
        assert_eq!(names(&tags), vec!["First"]);

        let engine = TagEngine::default();
        let tags = engine.compute(&entry("[First] line\n[Second] line", ""));
        assert_eq!(names(&tags), vec!["First", "Second"]);
    }

    #[test]
    fn bracket_tags_can_be_disabled() {
        let engine = TagEngine::new(TagConfig::default().with_bracket_tags(false));
        assert!(engine.compute(&entry("[Network] ok", "")).is_empty());
    }

    #[test]
    fn trace_tags_take_last_segment() {
        let engine = TagEngine::default();
        let detail = "at Game.Net.Client.Connect ()\n  in Render.Draw\nno frame here";
        let tags = engine.compute(&entry("boom", detail));
        assert!(tags.contains("Connect"));
        assert!(tags.contains("Draw"));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn trace_tags_respect_length_cap() {
        let engine = TagEngine::default();
        let long = "A".repeat(40);
        let tags = engine.compute(&entry("boom", &format!("at Some.{long}")));
        assert!(tags.is_empty());
    }

    #[test]
    fn trace_tag_cap_counts_characters() {
        let engine = TagEngine::default();
        // 20 characters, 40 bytes.
        let name = "ÄÖÜßéèàçñøÅÆØÞðŁłŃńŚ";
        assert_eq!(name.chars().count(), 20);
        let tags = engine.compute(&entry("boom", &format!("at Game.{name}")));
        assert!(tags.contains(name));
    }

    #[test]
    fn trace_tags_ignore_words_containing_at() {
        let engine = TagEngine::default();
        let tags = engine.compute(&entry("", "flat terrain\nmain loop"));
        assert!(tags.is_empty());
    }

    #[test]
    fn rules_add_names() {
        let config = TagConfig::default()
            .with_rule(TagRule::new(
                "Net",
                MatchKind::Contains,
                MatchTarget::ContentOnly,
                "SOCKET",
            ))
            .with_rule(TagRule::new(
                "Physics",
                MatchKind::Prefix,
                MatchTarget::DetailOnly,
                "at physics",
            ))
            .with_rule(TagRule::new(
                "Done",
                MatchKind::Suffix,
                MatchTarget::Both,
                "done",
            ));
        let engine = TagEngine::new(config);

        let tags = engine.compute(&entry("socket closed", "at Physics.Step"));
        assert!(tags.contains("net"));
        assert!(tags.contains("physics"));
        assert!(!tags.contains("done"));

        let tags = engine.compute(&entry("Build DONE", ""));
        assert_eq!(names(&tags), vec!["Done"]);
    }

    #[test_case(MatchKind::Contains, "timeout", "Request TIMEOUT after 3s", true ; "contains ignores case")]
    #[test_case(MatchKind::Prefix, "net:", "NET: connected", true ; "prefix ignores case")]
    #[test_case(MatchKind::Prefix, "net:", "socket net:", false ; "prefix anchors start")]
    #[test_case(MatchKind::Suffix, "done", "Build DONE", true ; "suffix ignores case")]
    #[test_case(MatchKind::Regex, "^Build", "build done", false ; "regex is case sensitive")]
    #[test_case(MatchKind::Regex, "(?i)^Build", "build done", true ; "regex inline flag")]
    #[test_case(MatchKind::Regex, "(unclosed", "(unclosed", false ; "invalid regex never matches")]
    fn rule_match_kinds(kind: MatchKind, pattern: &str, content: &str, expected: bool) {
        let engine = TagEngine::new(
            TagConfig::default()
                .with_bracket_tags(false)
                .with_rule(TagRule::new("Rule", kind, MatchTarget::ContentOnly, pattern)),
        );
        assert_eq!(engine.compute(&entry(content, "")).contains("Rule"), expected);
    }

    #[test_case(MatchTarget::ContentOnly, "x", "", true ; "content only hits content")]
    #[test_case(MatchTarget::ContentOnly, "", "x", false ; "content only skips detail")]
    #[test_case(MatchTarget::DetailOnly, "", "x", true ; "detail only hits detail")]
    #[test_case(MatchTarget::DetailOnly, "x", "", false ; "detail only skips content")]
    #[test_case(MatchTarget::Both, "", "x", true ; "both hits detail")]
    #[test_case(MatchTarget::Both, "x", "", true ; "both hits content")]
    fn rule_targets(target: MatchTarget, content: &str, detail: &str, expected: bool) {
        let engine = TagEngine::new(
            TagConfig::default()
                .with_trace_tags(false)
                .with_rule(TagRule::new("Rule", MatchKind::Contains, target, "x")),
        );
        assert_eq!(engine.compute(&entry(content, detail)).contains("Rule"), expected);
    }

    #[test]
    fn invalid_regex_rule_only_disables_itself() {
        let config = TagConfig::default()
            .with_rule(TagRule::new(
                "Broken",
                MatchKind::Regex,
                MatchTarget::Both,
                "(unclosed",
            ))
            .with_rule(TagRule::new(
                "Digits",
                MatchKind::Regex,
                MatchTarget::ContentOnly,
                r"\d{3}",
            ));
        let engine = TagEngine::new(config);
        let tags = engine.compute(&entry("[Http] status 404 (unclosed", ""));
        assert!(tags.contains("Http"));
        assert!(tags.contains("Digits"));
        assert!(!tags.contains("Broken"));
    }

    #[test]
    fn rule_names_dedupe_with_extracted_tags() {
        let config = TagConfig::default().with_rule(TagRule::new(
            "NETWORK",
            MatchKind::Contains,
            MatchTarget::ContentOnly,
            "ok",
        ));
        let engine = TagEngine::new(config);
        let tags = engine.compute(&entry("[Network] ok", ""));
        assert_eq!(names(&tags), vec!["Network"]);
    }

    #[test]
    fn compute_is_deterministic_and_replaces() {
        let engine = TagEngine::default();
        let mut e = entry("[Network] ok [UI]", "at Foo.Bar");
        engine.apply(&mut e);
        let first = e.tags.clone();
        engine.apply(&mut e);
        assert_eq!(e.tags, first);

        let engine = TagEngine::new(TagConfig::default().with_trace_tags(false));
        engine.apply(&mut e);
        assert!(!e.tags.contains("Bar"));
        assert_eq!(e.tags.len(), 2);
    }

    #[test]
    fn rule_order_does_not_matter() {
        let a = TagRule::new("A", MatchKind::Contains, MatchTarget::Both, "x");
        let b = TagRule::new("B", MatchKind::Contains, MatchTarget::Both, "x");
        let forward = TagEngine::new(TagConfig::default().with_rule(a.clone()).with_rule(b.clone()));
        let backward = TagEngine::new(TagConfig::default().with_rule(b).with_rule(a));
        let e = entry("x", "");
        assert_eq!(forward.compute(&e), backward.compute(&e));
    }

    #[test]
    fn reload_replaces_rules() {
        let mut engine = TagEngine::default();
        let e = entry("socket", "");
        assert!(engine.compute(&e).is_empty());

        engine.reload(TagConfig::default().with_rule(TagRule::new(
            "Net",
            MatchKind::Contains,
            MatchTarget::Both,
            "sock",
        )));
        assert!(engine.compute(&e).contains("Net"));
        assert_eq!(engine.config().rules.len(), 1);
    }
}
