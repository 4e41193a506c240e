//! Topic Router: builds and parses the topic strings used by the bridge and
//! the RPC layer.
//!
//! # Shapes
//!
//! | Shape | Example |
//! |---|---|
//! | signal-send | `/dropbot/1234/signal-send/foo` |
//! | device signal | `/dropbot/1234/signal/foo` |
//! | property request | `/dropbot/1234/property/voltage` |
//! | call request | `/dropbot/1234/call/update_state` |
//! | result | `/dropbot/1234/result/voltage` |
//! | presence (retained) | `/dropbot/1234/properties` |
//!
//! A topic that matches none of these shapes parses to
//! [`BridgeError::MalformedTopic`]; callers treat that as "not for me".

use std::fmt;

use sigbridge_types::{BridgeError, Verb};

pub const SIGNAL: &str = "signal";
pub const SIGNAL_SEND: &str = "signal-send";
pub const PROPERTY: &str = "property";
pub const CALL: &str = "call";
pub const RESULT: &str = "result";
pub const PROPERTIES: &str = "properties";

/// Member kind of a `/{device}/{uuid}/{kind}/{name}` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Signal,
    Property,
    Call,
    Result,
}

impl TopicKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopicKind::Signal => SIGNAL,
            TopicKind::Property => PROPERTY,
            TopicKind::Call => CALL,
            TopicKind::Result => RESULT,
        }
    }

    fn parse(segment: &str) -> Option<Self> {
        match segment {
            SIGNAL => Some(TopicKind::Signal),
            PROPERTY => Some(TopicKind::Property),
            CALL => Some(TopicKind::Call),
            RESULT => Some(TopicKind::Result),
            _ => None,
        }
    }
}

impl From<Verb> for TopicKind {
    fn from(verb: Verb) -> Self {
        match verb {
            Verb::Call => TopicKind::Call,
            Verb::Property => TopicKind::Property,
        }
    }
}

/// A topic that matched one of the recognised shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTopic {
    /// `{prefix}/signal-send/{name}`
    SignalSend { prefix: String, name: String },
    /// `/{device}/{uuid}/{kind}/{name}`
    Member {
        device: String,
        uuid: String,
        kind: TopicKind,
        name: String,
    },
    /// `/{device}/{uuid}/properties`
    Presence { device: String, uuid: String },
}

impl ParsedTopic {
    /// The device instance prefix, for shapes that carry one.
    pub fn prefix(&self) -> Option<DevicePrefix> {
        match self {
            ParsedTopic::Member { device, uuid, .. } | ParsedTopic::Presence { device, uuid } => {
                Some(DevicePrefix {
                    device: device.clone(),
                    uuid: uuid.clone(),
                })
            }
            ParsedTopic::SignalSend { .. } => None,
        }
    }
}

/// Identifies one device instance: `/{device}/{uuid}`.
///
/// Both segments are fixed for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePrefix {
    device: String,
    uuid: String,
}

impl DevicePrefix {
    /// # Errors
    ///
    /// Returns [`BridgeError::MalformedTopic`] if either segment is empty or
    /// contains a separator or wildcard character.
    pub fn new(device: impl Into<String>, uuid: impl Into<String>) -> Result<Self, BridgeError> {
        let device = device.into();
        let uuid = uuid.into();
        validate_segment(&device)?;
        validate_segment(&uuid)?;
        Ok(Self { device, uuid })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Sender identity used for signals mirrored from this device.
    pub fn sender_id(&self) -> String {
        format!("{}-{}", self.device, self.uuid)
    }

    pub fn member(&self, kind: TopicKind, name: &str) -> String {
        format!("/{}/{}/{}/{}", self.device, self.uuid, kind.as_str(), name)
    }

    /// Prefix for outbound signal forwarding: `/{device}/{uuid}/signal`.
    pub fn signal_prefix(&self) -> String {
        format!("{self}/{SIGNAL}")
    }

    /// Prefix for inbound signal injection: `/{device}/{uuid}/signal-send`.
    pub fn signal_send_prefix(&self) -> String {
        format!("{self}/{SIGNAL_SEND}")
    }

    pub fn result(&self, name: &str) -> String {
        self.member(TopicKind::Result, name)
    }

    pub fn request(&self, verb: Verb, name: &str) -> String {
        self.member(verb.into(), name)
    }

    /// Retained presence topic: `/{device}/{uuid}/properties`.
    pub fn presence(&self) -> String {
        format!("{self}/{PROPERTIES}")
    }

    /// Filter matching every request of `verb` for this device.
    pub fn request_filter(&self, verb: Verb) -> String {
        format!("{self}/{}/+", TopicKind::from(verb).as_str())
    }
}

impl fmt::Display for DevicePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.device, self.uuid)
    }
}

/// Filter matching the presence topic of every instance of `device`.
pub fn presence_filter(device: &str) -> String {
    format!("/{device}/+/{PROPERTIES}")
}

/// Filter matching every signal of every instance of `device`.
pub fn signal_filter(device: &str) -> String {
    format!("/{device}/+/{SIGNAL}/+")
}

/// Join `prefix` and `name`, dropping trailing separators on the prefix.
pub fn join(prefix: &str, name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

/// Parse `topic` into one of the recognised shapes.
///
/// # Errors
///
/// Returns [`BridgeError::MalformedTopic`] when the segment count or the fixed
/// literals do not match any shape.
pub fn parse(topic: &str) -> Result<ParsedTopic, BridgeError> {
    let malformed = || BridgeError::MalformedTopic(topic.to_string());
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() < 3 || segments.iter().skip(1).any(|s| s.is_empty()) {
        return Err(malformed());
    }

    let n = segments.len();
    if segments[n - 2] == SIGNAL_SEND {
        return Ok(ParsedTopic::SignalSend {
            prefix: segments[..n - 2].join("/"),
            name: segments[n - 1].to_string(),
        });
    }

    // Device-scoped shapes all start with a separator.
    if !segments[0].is_empty() {
        return Err(malformed());
    }
    match n {
        4 if segments[3] == PROPERTIES => Ok(ParsedTopic::Presence {
            device: segments[1].to_string(),
            uuid: segments[2].to_string(),
        }),
        5 => {
            let kind = TopicKind::parse(segments[3]).ok_or_else(malformed)?;
            Ok(ParsedTopic::Member {
                device: segments[1].to_string(),
                uuid: segments[2].to_string(),
                kind,
                name: segments[4].to_string(),
            })
        }
        _ => Err(malformed()),
    }
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels).
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(fs), Some(ts)) if fs == ts => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn validate_segment(segment: &str) -> Result<(), BridgeError> {
    if segment.is_empty() || segment.contains(['/', '+', '#']) {
        return Err(BridgeError::MalformedTopic(format!(
            "invalid topic segment `{segment}`"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix() -> DevicePrefix {
        DevicePrefix::new("dropbot", "1234").unwrap()
    }

    #[test]
    fn builds_every_device_shape() {
        let p = prefix();
        assert_eq!(p.to_string(), "/dropbot/1234");
        assert_eq!(p.member(TopicKind::Signal, "foo"), "/dropbot/1234/signal/foo");
        assert_eq!(p.request(Verb::Property, "voltage"), "/dropbot/1234/property/voltage");
        assert_eq!(p.request(Verb::Call, "update_state"), "/dropbot/1234/call/update_state");
        assert_eq!(p.result("voltage"), "/dropbot/1234/result/voltage");
        assert_eq!(p.presence(), "/dropbot/1234/properties");
        assert_eq!(join(&p.signal_send_prefix(), "foo"), "/dropbot/1234/signal-send/foo");
        assert_eq!(p.sender_id(), "dropbot-1234");
    }

    #[test]
    fn join_strips_trailing_separators() {
        assert_eq!(join("/signal/", "foo"), "/signal/foo");
        assert_eq!(join("/signal//", "foo"), "/signal/foo");
        assert_eq!(join("/signal", "foo"), "/signal/foo");
    }

    #[test]
    fn prefix_rejects_embedded_separators() {
        assert!(DevicePrefix::new("drop/bot", "1").is_err());
        assert!(DevicePrefix::new("dropbot", "").is_err());
        assert!(DevicePrefix::new("dropbot", "+").is_err());
    }

    #[test]
    fn parses_member_topics() {
        let parsed = parse("/dropbot/1234/result/voltage").unwrap();
        assert_eq!(
            parsed,
            ParsedTopic::Member {
                device: "dropbot".into(),
                uuid: "1234".into(),
                kind: TopicKind::Result,
                name: "voltage".into(),
            }
        );
        assert_eq!(parsed.prefix(), Some(prefix()));
    }

    #[test]
    fn parses_presence_and_signal_send() {
        assert_eq!(
            parse("/dropbot/1234/properties").unwrap(),
            ParsedTopic::Presence {
                device: "dropbot".into(),
                uuid: "1234".into()
            }
        );
        assert_eq!(
            parse("/signal-send/foo").unwrap(),
            ParsedTopic::SignalSend {
                prefix: "".into(),
                name: "foo".into()
            }
        );
        assert_eq!(
            parse("/dropbot/1234/signal-send/foo").unwrap(),
            ParsedTopic::SignalSend {
                prefix: "/dropbot/1234".into(),
                name: "foo".into()
            }
        );
    }

    #[test]
    fn unmatched_topics_are_malformed() {
        for topic in [
            "",
            "/dropbot",
            "/dropbot/1234",
            "/dropbot/1234/unknown/foo",
            "/dropbot/1234/result/foo/extra",
            "dropbot/1234/result/foo",
            "/dropbot//result/foo",
        ] {
            assert!(
                matches!(parse(topic), Err(BridgeError::MalformedTopic(_))),
                "`{topic}` must not parse"
            );
        }
    }

    #[test]
    fn wildcard_filters() {
        assert!(matches_filter("/#", "/dropbot/1234/signal/foo"));
        assert!(matches_filter("/dropbot/+/properties", "/dropbot/1234/properties"));
        assert!(matches_filter("/dropbot/+/signal/+", "/dropbot/1234/signal/foo"));
        assert!(matches_filter("/dropbot/1234/result/voltage", "/dropbot/1234/result/voltage"));
        assert!(!matches_filter("/dropbot/+/properties", "/dropbot/1234/signal/foo"));
        assert!(!matches_filter("/dropbot/+", "/dropbot/1234/properties"));
        assert!(!matches_filter("/dropbot/1234/result/voltage", "/dropbot/1234/result/frequency"));
    }

    #[test]
    fn request_filter_covers_one_level() {
        let p = prefix();
        let filter = p.request_filter(Verb::Call);
        assert_eq!(filter, "/dropbot/1234/call/+");
        assert!(matches_filter(&filter, &p.request(Verb::Call, "update_state")));
        assert!(!matches_filter(&filter, &p.request(Verb::Property, "voltage")));
    }
}
