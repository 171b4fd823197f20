use std::process;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ClientError;
use crate::scheduler::RepeatDelay;
use crate::topic;
use crate::types::QoS;

/// Which side of the conversation a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Pub,
    Sub,
}

/// Where a publisher's payload comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PubMode {
    /// Payload given directly on the command line.
    Message,
    /// Payload loaded from a file before the session starts.
    File,
    /// Whole standard input read as a single payload before the session starts.
    StdinWhole,
    /// Each line of standard input published as its own message.
    StdinLine,
    /// Zero-length payload.
    Null,
}

/// Immutable-after-setup session configuration. Built once at startup,
/// read-only for the lifetime of the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Explicit client identifier. Wins over `id_prefix`.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Prefix completed with the process id.
    #[serde(default)]
    pub id_prefix: Option<String>,
    #[serde(default = "SessionConfig::host_default")]
    pub host: String,
    #[serde(default = "SessionConfig::port_default")]
    pub port: u16,
    #[serde(default = "SessionConfig::keepalive_default")]
    pub keepalive: u16,
    #[serde(default = "SessionConfig::enabled_default")]
    pub clean_session: bool,
    #[serde(default = "SessionConfig::max_inflight_default")]
    pub max_inflight: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub will_topic: Option<String>,
    #[serde(default)]
    pub will_payload: Option<Vec<u8>>,
    #[serde(default)]
    pub will_qos: QoS,
    #[serde(default)]
    pub will_retain: bool,

    /// Topics a subscriber asks for, all in one subscribe request.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Exclusion patterns: matching deliveries are never processed.
    #[serde(default)]
    pub filter_outs: Vec<String>,
    /// Topics to unsubscribe from right after subscribing.
    #[serde(default)]
    pub unsub_topics: Vec<String>,
    #[serde(default)]
    pub exit_after_sub: bool,
    /// Drop retained messages instead of processing them.
    #[serde(default)]
    pub no_retain: bool,
    /// Stop processing once the first non-retained message arrives.
    #[serde(default)]
    pub retained_only: bool,
    /// Publish a zero-length retained message to clear every retained
    /// topic seen.
    #[serde(default)]
    pub remove_retained: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "SessionConfig::enabled_default")]
    pub eol: bool,
    /// Delivered-message cap; 0 means unlimited.
    #[serde(default)]
    pub msg_count: u32,
    /// Output format string; `None` selects the verbose/plain fallback.
    #[serde(default)]
    pub format: Option<String>,
    /// Session timeout in seconds; 0 disables it.
    #[serde(default)]
    pub timeout: u64,

    #[serde(default)]
    pub pub_mode: Option<PubMode>,
    /// Publish topic.
    #[serde(default)]
    pub topic: Option<String>,
    /// Publish payload for the message/file modes.
    #[serde(default)]
    pub message: Vec<u8>,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
    #[serde(default = "SessionConfig::repeat_count_default")]
    pub repeat_count: u32,
    #[serde(default)]
    pub repeat_delay: RepeatDelay,

    /// Suppress the client's own diagnostics.
    #[serde(default)]
    pub quiet: bool,
}

impl Default for SessionConfig {
    #[inline]
    fn default() -> Self {
        Self {
            client_id: None,
            id_prefix: None,
            host: Self::host_default(),
            port: Self::port_default(),
            keepalive: Self::keepalive_default(),
            clean_session: Self::enabled_default(),
            max_inflight: Self::max_inflight_default(),
            username: None,
            password: None,
            will_topic: None,
            will_payload: None,
            will_qos: QoS::default(),
            will_retain: false,
            topics: Vec::new(),
            filter_outs: Vec::new(),
            unsub_topics: Vec::new(),
            exit_after_sub: false,
            no_retain: false,
            retained_only: false,
            remove_retained: false,
            verbose: false,
            eol: Self::enabled_default(),
            msg_count: 0,
            format: None,
            timeout: 0,
            pub_mode: None,
            topic: None,
            message: Vec::new(),
            qos: QoS::default(),
            retain: false,
            repeat_count: Self::repeat_count_default(),
            repeat_delay: RepeatDelay::default(),
            quiet: false,
        }
    }
}

impl SessionConfig {
    #[inline]
    fn host_default() -> String {
        "localhost".into()
    }
    #[inline]
    fn port_default() -> u16 {
        1883
    }
    #[inline]
    fn keepalive_default() -> u16 {
        60
    }
    #[inline]
    fn max_inflight_default() -> u16 {
        20
    }
    #[inline]
    fn repeat_count_default() -> u32 {
        1
    }
    #[inline]
    fn enabled_default() -> bool {
        true
    }

    /// Effective client id: the explicit id, else the prefix completed
    /// with the process id, else a generated one.
    pub fn client_id(&self) -> String {
        if let Some(id) = &self.client_id {
            id.clone()
        } else if let Some(prefix) = &self.id_prefix {
            format!("{}{}", prefix, process::id())
        } else {
            format!("mqcli-{}", Uuid::new_v4().as_simple())
        }
    }

    /// Cross-field consistency checks, run once before the session
    /// starts. Fails fast with a human-readable message.
    pub fn validate(&self, kind: ClientKind) -> Result<(), ClientError> {
        if self.will_payload.is_some() && self.will_topic.is_none() {
            return Err(ClientError::Config(
                "Will payload given, but no will topic given.".into(),
            ));
        }
        if self.will_retain && self.will_topic.is_none() {
            return Err(ClientError::Config(
                "Will retain given, but no will topic given.".into(),
            ));
        }
        if let Some(will_topic) = &self.will_topic {
            if !topic::valid_publish_topic(will_topic) {
                return Err(ClientError::Config(format!(
                    "Invalid will topic '{}', does it contain '+' or '#'?",
                    will_topic
                )));
            }
        }
        if self.password.is_some() && self.username.is_none() && !self.quiet {
            log::warn!("Not using password since username not set.");
        }
        // session persistence needs a stable identity
        if !self.clean_session && (self.id_prefix.is_some() || self.client_id.is_none()) {
            return Err(ClientError::Config(
                "You must provide a client id if you are using the -c option.".into(),
            ));
        }

        match kind {
            ClientKind::Sub => {
                if self.topics.is_empty() {
                    return Err(ClientError::Config(
                        "You must specify a topic to subscribe to.".into(),
                    ));
                }
                if self.no_retain && self.retained_only {
                    return Err(ClientError::Config(
                        "Combining '-R' and '--retained-only' makes no sense.".into(),
                    ));
                }
                for pattern in self.topics.iter().chain(self.filter_outs.iter()) {
                    if !topic::valid_subscribe_pattern(pattern) {
                        return Err(ClientError::Config(format!(
                            "Invalid subscription topic '{}', are all '+' and '#' wildcards correct?",
                            pattern
                        )));
                    }
                }
            }
            ClientKind::Pub => {
                let topic = match (&self.topic, self.pub_mode) {
                    (Some(topic), Some(_)) => topic,
                    _ => {
                        return Err(ClientError::Config(
                            "Both topic and message must be supplied.".into(),
                        ))
                    }
                };
                if !topic::valid_publish_topic(topic) {
                    return Err(ClientError::Config(format!(
                        "Invalid publish topic '{}', does it contain '+' or '#'?",
                        topic
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub_config() -> SessionConfig {
        SessionConfig { topics: vec!["a/#".into()], ..Default::default() }
    }

    fn pub_config() -> SessionConfig {
        SessionConfig {
            topic: Some("a/b".into()),
            pub_mode: Some(PubMode::Message),
            message: b"hello".to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_protocol_conventions() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 1883);
        assert_eq!(cfg.keepalive, 60);
        assert_eq!(cfg.max_inflight, 20);
        assert!(cfg.clean_session);
        assert!(cfg.eol);
        assert_eq!(cfg.repeat_count, 1);
    }

    #[test]
    fn client_id_resolution() {
        let mut cfg = SessionConfig::default();
        cfg.client_id = Some("fixed".into());
        assert_eq!(cfg.client_id(), "fixed");

        cfg.client_id = None;
        cfg.id_prefix = Some("edge-".into());
        assert_eq!(cfg.client_id(), format!("edge-{}", process::id()));

        cfg.id_prefix = None;
        let generated = cfg.client_id();
        assert!(generated.starts_with("mqcli-"));
        assert_ne!(generated, cfg.client_id());
    }

    #[test]
    fn will_payload_requires_topic() {
        let mut cfg = pub_config();
        cfg.will_payload = Some(b"gone".to_vec());
        assert!(cfg.validate(ClientKind::Pub).is_err());
        cfg.will_topic = Some("state/gone".into());
        assert!(cfg.validate(ClientKind::Pub).is_ok());
    }

    #[test]
    fn will_retain_requires_topic() {
        let mut cfg = pub_config();
        cfg.will_retain = true;
        assert!(cfg.validate(ClientKind::Pub).is_err());
    }

    #[test]
    fn persistent_session_requires_stable_id() {
        let mut cfg = sub_config();
        cfg.clean_session = false;
        assert!(cfg.validate(ClientKind::Sub).is_err());

        cfg.client_id = Some("stable".into());
        assert!(cfg.validate(ClientKind::Sub).is_ok());

        cfg.id_prefix = Some("p-".into());
        assert!(cfg.validate(ClientKind::Sub).is_err());
    }

    #[test]
    fn subscriber_needs_topics() {
        let cfg = SessionConfig::default();
        assert!(cfg.validate(ClientKind::Sub).is_err());
        assert!(sub_config().validate(ClientKind::Sub).is_ok());
    }

    #[test]
    fn retained_filters_are_mutually_exclusive() {
        let mut cfg = sub_config();
        cfg.no_retain = true;
        cfg.retained_only = true;
        assert!(cfg.validate(ClientKind::Sub).is_err());
    }

    #[test]
    fn publisher_needs_topic_and_mode() {
        let cfg = SessionConfig::default();
        assert!(cfg.validate(ClientKind::Pub).is_err());

        let mut cfg = pub_config();
        cfg.pub_mode = None;
        assert!(cfg.validate(ClientKind::Pub).is_err());

        assert!(pub_config().validate(ClientKind::Pub).is_ok());
    }

    #[test]
    fn wildcard_publish_topic_rejected() {
        let mut cfg = pub_config();
        cfg.topic = Some("a/+".into());
        assert!(cfg.validate(ClientKind::Pub).is_err());
    }

    #[test]
    fn malformed_subscription_rejected() {
        let mut cfg = sub_config();
        cfg.topics = vec!["a/b#".into()];
        assert!(cfg.validate(ClientKind::Sub).is_err());

        let mut cfg = sub_config();
        cfg.filter_outs = vec!["#/x".into()];
        assert!(cfg.validate(ClientKind::Sub).is_err());
    }
}
