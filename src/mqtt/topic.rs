//! Topic descriptors, MQTT wildcard matching, and wildcard-pattern formatting.
//!
//! Grounded on `mqtt_utils::Topic` and `mqtt_utils::topicMatches`/
//! `formatWildcardTopic` in the original controller's `utils.h`. The schema
//! check is deliberately a structural predicate rather than a full JSON
//! Schema engine (see DESIGN.md's note on `quick-xml`/schema scope).

use crate::bt::schema::Schema;
use serde_json::Value;

/// A wire endpoint: a concrete or wildcard-bearing topic, its originating
/// pattern, an optional schema, and the QoS/retain semantics to use when
/// publishing or subscribing.
#[derive(Clone, Debug)]
pub struct TopicDescriptor {
    topic: String,
    pattern: String,
    schema: Option<Schema>,
    qos: u8,
    retain: bool,
}

impl TopicDescriptor {
    pub fn new(topic: impl Into<String>, qos: u8, retain: bool) -> Self {
        let topic = topic.into();
        Self {
            pattern: topic.clone(),
            topic,
            schema: None,
            qos,
            retain,
        }
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn qos(&self) -> u8 {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Re-derive the concrete topic from the pattern by substituting every
    /// `+` segment, in order, with the given replacements.
    pub fn apply_pattern(&mut self, replacements: &[&str]) {
        if !self.pattern.is_empty() {
            self.topic = format_wildcard_topic(&self.pattern, replacements);
        }
    }

    /// Mirrors `Topic::validateMessage`: a topic with no schema ever set is
    /// considered valid (pass-through, not strict); a schema is applied only
    /// when present. See DESIGN.md's Open Question resolutions.
    pub fn validate(&self, message: &Value) -> bool {
        match &self.schema {
            Some(schema) => schema.validate(message),
            None => true,
        }
    }
}

/// MQTT-semantics wildcard match: `+` matches exactly one level, `#` matches
/// the remainder of the topic and must be the final pattern segment.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let topic_segments: Vec<&str> = topic.split('/').collect();

    let mut pi = 0;
    let mut ti = 0;
    while pi < pattern_segments.len() {
        let p = pattern_segments[pi];
        if p == "#" {
            return pi == pattern_segments.len() - 1;
        }
        if ti >= topic_segments.len() {
            return false;
        }
        if p != "+" && p != topic_segments[ti] {
            return false;
        }
        pi += 1;
        ti += 1;
    }
    ti == topic_segments.len()
}

/// Replace `+` segments in `pattern`, left to right, with `replacements`, in
/// order. Segments that are not `+` are left untouched. If there are fewer
/// replacements than `+` segments, the remaining `+` segments are left as-is.
pub fn format_wildcard_topic(pattern: &str, replacements: &[&str]) -> String {
    let mut next = replacements.iter();
    pattern
        .split('/')
        .map(|segment| {
            if segment == "+" {
                next.next().copied().unwrap_or("+")
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Single-replacement convenience overload, used when a pattern has exactly
/// one `+` segment (the common case for per-station topics).
pub fn format_wildcard_topic_single(pattern: &str, replacement: &str) -> String {
    format_wildcard_topic(pattern, &[replacement])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_matches_single_level() {
        assert!(topic_matches("uns/+/DATA/State", "uns/press-1/DATA/State"));
        assert!(!topic_matches(
            "uns/+/DATA/State",
            "uns/press-1/extra/DATA/State"
        ));
    }

    #[test]
    fn hash_matches_remainder_and_must_be_last() {
        assert!(topic_matches("uns/press-1/#", "uns/press-1/DATA/State"));
        assert!(topic_matches("uns/press-1/#", "uns/press-1"));
        assert!(!topic_matches("uns/#/DATA", "uns/press-1/DATA"));
    }

    #[test]
    fn literal_segments_must_match_exactly() {
        assert!(!topic_matches("uns/press-1/CMD/Start", "uns/press-2/CMD/Start"));
        assert!(topic_matches("uns/press-1/CMD/Start", "uns/press-1/CMD/Start"));
    }

    #[test]
    fn matches_commutes_with_broker_delivery_semantics() {
        // a concrete topic matches a pattern iff a broker subscribed to that
        // pattern would deliver the concrete topic
        let pattern = "uns/+/DATA/+";
        for topic in [
            "uns/press-1/DATA/State",
            "uns/press-1/DATA/Occupy",
            "uns/press-1/CMD/State",
        ] {
            let expect_match = topic.split('/').count() == 4 && topic.split('/').nth(2) == Some("DATA");
            assert_eq!(topic_matches(pattern, topic), expect_match, "{topic}");
        }
    }

    #[test]
    fn format_wildcard_topic_replaces_only_plus_segments_in_order() {
        let formatted = format_wildcard_topic("uns/+/CMD/+", &["press-1", "Occupy"]);
        assert_eq!(formatted, "uns/press-1/CMD/Occupy");
    }

    #[test]
    fn format_wildcard_topic_idempotent_once_no_plus_remains() {
        let once = format_wildcard_topic("uns/+/CMD/+", &["press-1", "Occupy"]);
        let twice = format_wildcard_topic(&once, &["press-1", "Occupy"]);
        assert_eq!(once, twice);
    }

    #[test]
    fn validate_with_no_schema_ever_set_passes() {
        let topic = TopicDescriptor::new("uns/press-1/DATA/State", 2, true);
        assert!(topic.validate(&serde_json::json!({"anything": true})));
    }
}
