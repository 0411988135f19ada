//! Topic names and topic patterns.
//!
//! Topics follow the format `<namespace>.<subject>[.<detail>]`.

use std::fmt;

/// Well-known topics exchanged between the reactive agents
pub struct Topic;

impl Topic {
    // ========================================================================
    // Guardian
    // ========================================================================
    pub const GUARDIAN_CONTRADICTION: &'static str = "guardian.contradiction";
    pub const GUARDIAN_POLICY_UPDATE: &'static str = "guardian.policy.update";

    // ========================================================================
    // Mediation
    // ========================================================================
    pub const MEDIATOR_RESOLUTION: &'static str = "codex.mediator.resolution";
    pub const DIALOGUE_TENSION: &'static str = "observations.dialogue.tension";

    // ========================================================================
    // Telemetry
    // ========================================================================
    pub const HEALTH_DISK: &'static str = "observations.health.disk";

    // ========================================================================
    // Memory
    // ========================================================================
    pub const MEMORY_STATE_REQUEST: &'static str = "memory.state.request";
}

/// Topic prefixes relayed to the remote event service by default
pub const BRIDGED_PREFIXES: &[&str] = &[
    "observations.",
    "intents.",
    "actions.",
    "guardian.",
    "codex.",
    "memory.",
];

/// Subscription pattern: an exact topic or a prefix ending in `*`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    Exact(String),
    Prefix(String),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => TopicPattern::Prefix(prefix.to_string()),
            None => TopicPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::Exact(exact) => topic == exact,
            TopicPattern::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, TopicPattern::Prefix(_))
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        TopicPattern::parse(pattern)
    }
}

impl From<String> for TopicPattern {
    fn from(pattern: String) -> Self {
        TopicPattern::parse(&pattern)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::Exact(exact) => write!(f, "{exact}"),
            TopicPattern::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_format() {
        assert!(Topic::GUARDIAN_CONTRADICTION.contains('.'));
        assert!(Topic::MEDIATOR_RESOLUTION.contains('.'));
        assert!(BRIDGED_PREFIXES.iter().all(|p| p.ends_with('.')));
    }

    #[test]
    fn test_exact_match() {
        let pattern = TopicPattern::parse("guardian.contradiction");
        assert!(!pattern.is_wildcard());
        assert!(pattern.matches("guardian.contradiction"));
        assert!(!pattern.matches("guardian.contradiction.extra"));
    }

    #[test]
    fn test_prefix_match() {
        let pattern = TopicPattern::parse("guardian.*");
        assert!(pattern.is_wildcard());
        assert!(pattern.matches("guardian.contradiction"));
        assert!(pattern.matches("guardian.policy.update"));
        assert!(!pattern.matches("codex.mediator.resolution"));
    }

    #[test]
    fn test_prefix_without_separator() {
        let pattern = TopicPattern::parse("observations.dialogue.tension*");
        assert!(pattern.matches("observations.dialogue.tension"));
        assert!(pattern.matches("observations.dialogue.tension.rising"));
        assert!(!pattern.matches("observations.dialogue.calm"));
    }

    #[test]
    fn test_match_everything() {
        let pattern = TopicPattern::parse("*");
        assert!(pattern.matches("anything"));
        assert!(pattern.matches("a.b.c"));
    }

    #[test]
    fn test_display_round_trip() {
        for raw in ["guardian.*", "guardian.contradiction", "*"] {
            assert_eq!(TopicPattern::parse(raw).to_string(), raw);
        }
    }
}
