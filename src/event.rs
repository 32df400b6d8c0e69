//! Event model: ordered headers plus an optional binary-safe body.

use crate::headers::EventHeader;
use indexmap::IndexMap;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

wire_parse_error!(
    /// Error returned when parsing an unknown event format.
    pub struct ParseEventFormatError,
    "event format"
);

wire_enum! {
    error_type: ParseEventFormatError,
    /// Body encoding requested with `event` / `myevents`.
    #[derive(Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum EventFormat {
        #[default]
        Plain => "plain",
        Json => "json",
        Xml => "xml",
    }
}

impl EventFormat {
    /// Format carried by an event frame's `Content-Type`. Unknown types read as plain.
    pub fn from_content_type(content_type: &str) -> Self {
        match content_type {
            "text/event-json" => Self::Json,
            "text/event-xml" => Self::Xml,
            _ => Self::Plain,
        }
    }
}

wire_parse_error!(
    /// Error returned when parsing an unknown event type string.
    pub struct ParseEventTypeError,
    "event type"
);

wire_enum! {
    error_type: ParseEventTypeError,
    /// Switch event names with a typed variant.
    ///
    /// Routing works on the raw `Event-Name` string, so an event missing
    /// from this list is still delivered; [`EslEvent::event_type`] is just `None`.
    pub enum EslEventType {
        Custom => "CUSTOM",
        ChannelCreate => "CHANNEL_CREATE",
        ChannelDestroy => "CHANNEL_DESTROY",
        ChannelState => "CHANNEL_STATE",
        ChannelCallstate => "CHANNEL_CALLSTATE",
        ChannelAnswer => "CHANNEL_ANSWER",
        ChannelHangup => "CHANNEL_HANGUP",
        ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
        ChannelExecute => "CHANNEL_EXECUTE",
        ChannelExecuteComplete => "CHANNEL_EXECUTE_COMPLETE",
        ChannelBridge => "CHANNEL_BRIDGE",
        ChannelUnbridge => "CHANNEL_UNBRIDGE",
        ChannelProgress => "CHANNEL_PROGRESS",
        ChannelProgressMedia => "CHANNEL_PROGRESS_MEDIA",
        ChannelPark => "CHANNEL_PARK",
        ChannelUnpark => "CHANNEL_UNPARK",
        ChannelOriginate => "CHANNEL_ORIGINATE",
        ChannelData => "CHANNEL_DATA",
        Api => "API",
        Dtmf => "DTMF",
        RecordStart => "RECORD_START",
        RecordStop => "RECORD_STOP",
        PlaybackStart => "PLAYBACK_START",
        PlaybackStop => "PLAYBACK_STOP",
        DetectedSpeech => "DETECTED_SPEECH",
        BackgroundJob => "BACKGROUND_JOB",
        Heartbeat => "HEARTBEAT",
        SessionHeartbeat => "SESSION_HEARTBEAT",
        CallUpdate => "CALL_UPDATE",
        Shutdown => "SHUTDOWN",
        /// Subscription wildcard, never seen on a received event.
        All => "ALL",
    }
}

impl EslEventType {
    /// `CHANNEL_HANGUP` and `CHANNEL_HANGUP_COMPLETE`: the call is over and only
    /// lingering traffic can follow.
    pub fn is_hangup(&self) -> bool {
        matches!(self, Self::ChannelHangup | Self::ChannelHangupComplete)
    }
}

/// One switch event (or the channel data of an outbound session).
///
/// Header names keep their case and arrival order. Setting a header that
/// already exists replaces the value in place. The typed
/// [`event_type`](Self::event_type) is read from `Event-Name`, so the two
/// can never disagree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EslEvent {
    headers: IndexMap<String, String>,
    body: Option<Vec<u8>>,
}

impl EslEvent {
    /// Event with no headers and no body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Event with `Event-Name` already set.
    pub fn with_type(event_type: EslEventType) -> Self {
        let mut event = Self::new();
        event.set_header(EventHeader::EventName.as_str(), event_type.as_str());
        event
    }

    pub(crate) fn from_parts(headers: IndexMap<String, String>, body: Option<Vec<u8>>) -> Self {
        Self { headers, body }
    }

    /// Typed `Event-Name`, if it is one of [`EslEventType`].
    pub fn event_type(&self) -> Option<EslEventType> {
        self.event_name()?
            .parse()
            .ok()
    }

    pub fn is_event_type(&self, event_type: EslEventType) -> bool {
        self.event_type() == Some(event_type)
    }

    /// `true` for `CHANNEL_HANGUP` / `CHANNEL_HANGUP_COMPLETE`.
    pub fn is_hangup(&self) -> bool {
        self.event_type()
            .is_some_and(|t| t.is_hangup())
    }

    /// Header value by exact (case-sensitive) name.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &IndexMap<String, String> {
        &self.headers
    }

    /// Set a header; an existing one keeps its position.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .insert(name.into(), value.into());
    }

    /// Remove a header, returning its value.
    pub fn del_header(&mut self, name: &str) -> Option<String> {
        self.headers
            .shift_remove(name)
    }

    /// Body as text; `None` when absent or not UTF-8.
    pub fn body(&self) -> Option<&str> {
        std::str::from_utf8(self.body_bytes()?).ok()
    }

    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body
            .as_deref()
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = Some(body.into());
    }

    /// `Event-Name`, the dispatch key.
    pub fn event_name(&self) -> Option<&str> {
        self.header(EventHeader::EventName)
    }

    /// `Event-Subclass` of `CUSTOM` events.
    pub fn event_subclass(&self) -> Option<&str> {
        self.header(EventHeader::EventSubclass)
    }

    /// Channel UUID: `Unique-ID`, else `Caller-Unique-ID`.
    pub fn unique_id(&self) -> Option<&str> {
        self.header(EventHeader::UniqueId)
            .or_else(|| self.header(EventHeader::CallerUniqueId))
    }

    /// `Job-UUID` of a `BACKGROUND_JOB` event.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(EventHeader::JobUuid)
    }

    pub fn channel_name(&self) -> Option<&str> {
        self.header(EventHeader::ChannelName)
    }

    pub fn caller_id_number(&self) -> Option<&str> {
        self.header(EventHeader::CallerCallerIdNumber)
    }

    pub fn destination_number(&self) -> Option<&str> {
        self.header(EventHeader::CallerDestinationNumber)
    }

    pub fn hangup_cause(&self) -> Option<&str> {
        self.header(EventHeader::HangupCause)
    }

    /// Channel variable, carried as a `variable_<name>` header.
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.header(format!("variable_{}", name))
    }

    /// Encode as a `text/event-plain` body.
    ///
    /// Values are percent-encoded. `Event-Name` goes first and `Content-Length`
    /// is derived from the body rather than copied from the headers.
    pub fn to_plain_format(&self) -> Vec<u8> {
        let name_key = EventHeader::EventName.as_str();
        let ordered = self
            .headers
            .get_key_value(name_key)
            .into_iter()
            .chain(
                self.headers
                    .iter()
                    .filter(|(k, _)| k.as_str() != name_key && k.as_str() != "Content-Length"),
            );

        let mut text = String::new();
        for (key, value) in ordered {
            let _ = writeln!(
                text,
                "{}: {}",
                key,
                percent_encode(value.as_bytes(), NON_ALPHANUMERIC)
            );
        }

        let mut bytes = text.into_bytes();
        match &self.body {
            Some(body) => {
                bytes.extend_from_slice(format!("Content-Length: {}\n\n", body.len()).as_bytes());
                bytes.extend_from_slice(body);
            }
            None => bytes.push(b'\n'),
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(headers: &[(&str, &str)]) -> EslEvent {
        let mut event = EslEvent::new();
        for (name, value) in headers {
            event.set_header(*name, *value);
        }
        event
    }

    #[test]
    fn test_event_type_comes_from_event_name() {
        let hangup = event(&[("Event-Name", "CHANNEL_HANGUP")]);
        assert_eq!(hangup.event_type(), Some(EslEventType::ChannelHangup));
        assert!(hangup.is_hangup());

        let lower = event(&[("Event-Name", "background_job")]);
        assert!(lower.is_event_type(EslEventType::BackgroundJob));

        let unknown = event(&[("Event-Name", "MY_MODULE_EVENT")]);
        assert_eq!(unknown.event_type(), None);
        assert_eq!(unknown.event_name(), Some("MY_MODULE_EVENT"));

        assert_eq!(EslEvent::new().event_type(), None);
    }

    #[test]
    fn test_with_type_sets_event_name() {
        let job = EslEvent::with_type(EslEventType::BackgroundJob);
        assert_eq!(job.event_name(), Some("BACKGROUND_JOB"));
        assert_eq!(job.headers().len(), 1);
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(EslEventType::ChannelHangupComplete.to_string(), "CHANNEL_HANGUP_COMPLETE");
        assert_eq!(EslEventType::All.as_str(), "ALL");
        assert_eq!("dtmf".parse::<EslEventType>(), Ok(EslEventType::Dtmf));
        assert_eq!(
            "NOT_AN_EVENT"
                .parse::<EslEventType>()
                .unwrap_err()
                .to_string(),
            "unknown event type: NOT_AN_EVENT"
        );
        assert!(EslEventType::ChannelHangupComplete.is_hangup());
        assert!(!EslEventType::ChannelAnswer.is_hangup());
    }

    #[test]
    fn test_headers_keep_order_and_last_wins() {
        let mut event = event(&[("B-Header", "1"), ("A-Header", "2")]);
        event.set_header("B-Header", "3");

        let names: Vec<_> = event
            .headers()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(names, ["B-Header", "A-Header"]);
        assert_eq!(event.header("B-Header"), Some("3"));

        assert_eq!(event.del_header("B-Header"), Some("3".to_string()));
        assert_eq!(event.del_header("B-Header"), None);
        assert_eq!(event.header("b-header"), None);
    }

    #[test]
    fn test_body_is_binary_safe() {
        let mut event = EslEvent::new();
        event.set_body(vec![0xff, 0x00, 0x41]);
        assert_eq!(event.body(), None);
        assert_eq!(event.body_bytes(), Some(&[0xff, 0x00, 0x41][..]));
    }

    #[test]
    fn test_channel_accessors() {
        let channel = event(&[
            ("Caller-Unique-ID", "abc"),
            ("Channel-Name", "sofia/internal/1000@example.com"),
            ("Caller-Caller-ID-Number", "1000"),
            ("Caller-Destination-Number", "5000"),
            ("variable_sip_from_display", "Bob"),
        ]);
        assert_eq!(channel.unique_id(), Some("abc"));
        assert_eq!(channel.channel_name(), Some("sofia/internal/1000@example.com"));
        assert_eq!(channel.caller_id_number(), Some("1000"));
        assert_eq!(channel.destination_number(), Some("5000"));
        assert_eq!(channel.variable("sip_from_display"), Some("Bob"));
        assert_eq!(channel.variable("missing"), None);
        assert_eq!(channel.hangup_cause(), None);
    }

    #[test]
    fn test_to_plain_format_puts_event_name_first() {
        let mut job = event(&[("Job-UUID", "def-456"), ("Content-Length", "999")]);
        job.set_header("Event-Name", "BACKGROUND_JOB");
        job.set_body("+OK result\n");

        let plain = String::from_utf8(job.to_plain_format()).unwrap();
        assert!(plain.starts_with("Event-Name: BACKGROUND%5FJOB\nJob-UUID: def%2D456\n"));
        assert!(plain.contains("Content-Length: 11\n\n"));
        assert!(!plain.contains("999"));
        assert!(plain.ends_with("+OK result\n"));
    }

    #[test]
    fn test_event_format() {
        assert_eq!(EventFormat::from_content_type("text/event-json"), EventFormat::Json);
        assert_eq!(EventFormat::from_content_type("text/event-xml"), EventFormat::Xml);
        assert_eq!(EventFormat::from_content_type("text/plain"), EventFormat::Plain);
        assert_eq!(EventFormat::default().to_string(), "plain");
        assert_eq!("JSON".parse::<EventFormat>(), Ok(EventFormat::Json));
        assert_eq!(serde_json::to_string(&EventFormat::Xml).unwrap(), "\"xml\"");
    }
}
