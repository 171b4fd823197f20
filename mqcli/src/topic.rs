use std::fmt::{self, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TopicError {
    #[error("invalid pattern `{0}`")]
    InvalidPattern(String),
    #[error("invalid level `{0}` contains +|#")]
    InvalidLevel(String),
}

/// One level of a subscription pattern.
#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Metadata(String), // $SYS and friends, only valid as the first level
    Blank,
    SingleWildcard, // +
    MultiWildcard,  // #
}

impl Level {
    fn parse(s: &str) -> Result<Level, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ => {
                if s.contains(['+', '#']) {
                    Err(TopicError::InvalidLevel(s.into()))
                } else if s.starts_with('$') {
                    Ok(Level::Metadata(String::from(s)))
                } else {
                    Ok(Level::Normal(String::from(s)))
                }
            }
        }
    }

    #[inline]
    fn matches_seg(&self, seg: &str) -> bool {
        match self {
            Level::Normal(l) | Level::Metadata(l) => l == seg,
            Level::Blank => seg.is_empty(),
            Level::SingleWildcard | Level::MultiWildcard => !seg.starts_with('$'),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Normal(s) | Level::Metadata(s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

/// A subscription-style topic pattern, possibly containing wildcards. A
/// single-level wildcard matches exactly one topic segment; a multi-level
/// wildcard matches the remainder of the topic. A `$`-prefixed first
/// segment is never matched by a wildcard.
#[derive(Debug, Eq, PartialEq, Clone, Serialize, Deserialize)]
pub struct TopicPattern(Vec<Level>);

impl TopicPattern {
    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    fn is_valid(&self) -> bool {
        self.0.iter().enumerate().all(|(pos, level)| match level {
            Level::MultiWildcard => pos == self.0.len() - 1,
            Level::Metadata(_) => pos == 0,
            _ => true,
        })
    }

    /// Hierarchical match against a concrete topic name.
    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, topic: &S) -> bool {
        let segs: Vec<&str> = topic.as_ref().split('/').collect();
        let protected = segs.first().is_some_and(|s| s.starts_with('$'));
        let mut si = 0;
        for level in &self.0 {
            match level {
                // `#` also matches the parent level itself
                Level::MultiWildcard => return !(si == 0 && protected),
                Level::SingleWildcard => match segs.get(si) {
                    Some(_) if !(si == 0 && protected) => si += 1,
                    _ => return false,
                },
                _ => match segs.get(si) {
                    Some(seg) if level.matches_seg(seg) => si += 1,
                    _ => return false,
                },
            }
        }
        si == segs.len()
    }
}

impl FromStr for TopicPattern {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        s.split('/')
            .map(Level::parse)
            .collect::<Result<Vec<_>, TopicError>>()
            .map(TopicPattern)
            .and_then(|pattern| {
                if pattern.is_valid() {
                    Ok(pattern)
                } else {
                    Err(TopicError::InvalidPattern(s.into()))
                }
            })
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for level in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char('/')?;
            }
            level.fmt(f)?;
        }
        Ok(())
    }
}

/// A publish topic names a single concrete topic: wildcards are rejected.
#[inline]
pub fn valid_publish_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

/// A subscription pattern must parse with correctly placed wildcards.
#[inline]
pub fn valid_subscribe_pattern(pattern: &str) -> bool {
    pattern.parse::<TopicPattern>().is_ok()
}

/// Exclusion filter: suppresses deliveries whose topic matches any of the
/// configured patterns. Patterns are evaluated in order, first match wins.
#[derive(Debug, Default, Clone)]
pub struct TopicFilter {
    patterns: Vec<TopicPattern>,
}

impl TopicFilter {
    pub fn new(patterns: &[String]) -> Result<Self, TopicError> {
        Ok(Self {
            patterns: patterns.iter().map(|p| p.parse()).collect::<Result<Vec<_>, _>>()?,
        })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    #[inline]
    pub fn is_excluded(&self, topic: &str) -> bool {
        self.patterns.iter().any(|p| p.matches_str(topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pattern() {
        assert!("sport/tennis/player1".parse::<TopicPattern>().is_ok());
        assert!("sport/tennis/#".parse::<TopicPattern>().is_ok());
        assert!("+/tennis/#".parse::<TopicPattern>().is_ok());
        assert!("$SYS/#".parse::<TopicPattern>().is_ok());
        assert!("".parse::<TopicPattern>().is_ok());
        assert!("/finance".parse::<TopicPattern>().is_ok());

        assert!("sport/tennis#".parse::<TopicPattern>().is_err());
        assert!("sport/tennis/#/ranking".parse::<TopicPattern>().is_err());
        assert!("sport+".parse::<TopicPattern>().is_err());
        assert!("sport/$SYS".parse::<TopicPattern>().is_err());
    }

    #[test]
    fn test_multi_wildcard_matches() {
        let t: TopicPattern = "sport/tennis/player1/#".parse().expect("");
        assert!(t.matches_str("sport/tennis/player1"));
        assert!(t.matches_str("sport/tennis/player1/ranking"));
        assert!(t.matches_str("sport/tennis/player1/score/wimbledon"));

        assert!("sport/#".parse::<TopicPattern>().expect("").matches_str("sport"));
        assert!("#".parse::<TopicPattern>().expect("").matches_str("a/b/c"));
    }

    #[test]
    fn test_single_wildcard_matches() {
        let t: TopicPattern = "sport/tennis/+".parse().expect("");
        assert!(t.matches_str("sport/tennis/player1"));
        assert!(t.matches_str("sport/tennis/player2"));
        assert!(!t.matches_str("sport/tennis/player1/ranking"));

        let t: TopicPattern = "sport/+".parse().expect("");
        assert!(!t.matches_str("sport"));
        assert!(t.matches_str("sport/"));

        assert!("+/+".parse::<TopicPattern>().expect("").matches_str("/finance"));
        assert!("/+".parse::<TopicPattern>().expect("").matches_str("/finance"));
        assert!(!"+".parse::<TopicPattern>().expect("").matches_str("/finance"));
    }

    #[test]
    fn test_metadata_not_matched_by_wildcards() {
        assert!(!"#".parse::<TopicPattern>().expect("").matches_str("$SYS"));
        assert!(!"+/monitor/Clients"
            .parse::<TopicPattern>()
            .expect("")
            .matches_str("$SYS/monitor/Clients"));
        assert!("$SYS/#".parse::<TopicPattern>().expect("").matches_str("$SYS/"));
        assert!("$SYS/monitor/+"
            .parse::<TopicPattern>()
            .expect("")
            .matches_str("$SYS/monitor/Clients"));
    }

    #[test]
    fn test_publish_topic_check() {
        assert!(valid_publish_topic("a/b/c"));
        assert!(!valid_publish_topic(""));
        assert!(!valid_publish_topic("a/+/c"));
        assert!(!valid_publish_topic("a/#"));
    }

    #[test]
    fn test_filter_first_match_wins() {
        let filter =
            TopicFilter::new(&["a/+".to_string(), "a/b".to_string(), "b/#".to_string()]).expect("");
        assert!(filter.is_excluded("a/b"));
        assert!(filter.is_excluded("b/c/d"));
        assert!(!filter.is_excluded("c/d"));
    }

    #[test]
    fn test_filter_idempotent() {
        let filter = TopicFilter::new(&["x/#".to_string(), "+/y".to_string()]).expect("");
        for topic in ["x/1", "q/y", "q/z", "x", "$SYS/x"] {
            let first = filter.is_excluded(topic);
            let second = filter.is_excluded(topic);
            assert_eq!(first, second, "filter decision changed for {}", topic);
        }
    }

    #[test]
    fn test_empty_filter_excludes_nothing() {
        let filter = TopicFilter::new(&[]).expect("");
        assert!(filter.is_empty());
        assert!(!filter.is_excluded("any/topic"));
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["a/b/c", "+/tennis/#", "$SYS/broker/+", "/finance"] {
            let t: TopicPattern = s.parse().expect("");
            assert_eq!(t.to_string(), s);
        }
    }
}
