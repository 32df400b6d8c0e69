//! ESL frame codec: byte stream to frames, frames to events

use crate::{
    buffer::{find_blank_line, EslBuffer},
    command::EslResponse,
    constants::{
        CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_COMMAND_REPLY,
        CONTENT_TYPE_DISCONNECT_NOTICE, CONTENT_TYPE_RUDE_REJECTION, CONTENT_TYPE_TEXT_EVENT_JSON,
        CONTENT_TYPE_TEXT_EVENT_PLAIN, CONTENT_TYPE_TEXT_EVENT_XML, HEADER_CONTENT_LENGTH,
        HEADER_CONTENT_TYPE, MAX_MESSAGE_SIZE,
    },
    error::{EslError, EslResult},
    event::{EslEvent, EventFormat},
};
use indexmap::IndexMap;
use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, CONTROLS};

/// Bytes escaped in frame header values: anything that would break the line
/// or be misread by the percent-decoding parser.
const HEADER_VALUE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

/// Frame content type, taken from the outer `Content-Type` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    /// Authentication request from server
    AuthRequest,
    /// Command reply
    CommandReply,
    /// API response
    ApiResponse,
    /// `text/event-plain`
    EventPlain,
    /// `text/event-json`
    EventJson,
    /// `text/event-xml`
    EventXml,
    /// Server is closing (or lingering on) the session
    DisconnectNotice,
    /// Server refused the connection (ACL)
    RudeRejection,
    /// Anything else, e.g. `log/data`
    Other(String),
}

impl ContentType {
    /// Parse message type from Content-Type header
    pub fn from_header(content_type: &str) -> Self {
        match content_type {
            CONTENT_TYPE_AUTH_REQUEST => ContentType::AuthRequest,
            CONTENT_TYPE_COMMAND_REPLY => ContentType::CommandReply,
            CONTENT_TYPE_API_RESPONSE => ContentType::ApiResponse,
            CONTENT_TYPE_TEXT_EVENT_PLAIN => ContentType::EventPlain,
            CONTENT_TYPE_TEXT_EVENT_JSON => ContentType::EventJson,
            CONTENT_TYPE_TEXT_EVENT_XML => ContentType::EventXml,
            CONTENT_TYPE_DISCONNECT_NOTICE => ContentType::DisconnectNotice,
            CONTENT_TYPE_RUDE_REJECTION | "rude-rejection" => ContentType::RudeRejection,
            other => ContentType::Other(other.to_string()),
        }
    }

    /// Wire value.
    pub fn as_str(&self) -> &str {
        match self {
            ContentType::AuthRequest => CONTENT_TYPE_AUTH_REQUEST,
            ContentType::CommandReply => CONTENT_TYPE_COMMAND_REPLY,
            ContentType::ApiResponse => CONTENT_TYPE_API_RESPONSE,
            ContentType::EventPlain => CONTENT_TYPE_TEXT_EVENT_PLAIN,
            ContentType::EventJson => CONTENT_TYPE_TEXT_EVENT_JSON,
            ContentType::EventXml => CONTENT_TYPE_TEXT_EVENT_XML,
            ContentType::DisconnectNotice => CONTENT_TYPE_DISCONNECT_NOTICE,
            ContentType::RudeRejection => CONTENT_TYPE_RUDE_REJECTION,
            ContentType::Other(s) => s,
        }
    }

    /// `command/reply` or `api/response`: fulfils the pending command.
    pub fn is_reply(&self) -> bool {
        matches!(self, ContentType::CommandReply | ContentType::ApiResponse)
    }

    /// Body format for the `text/event-*` family.
    pub fn event_format(&self) -> Option<EventFormat> {
        match self {
            ContentType::EventPlain => Some(EventFormat::Plain),
            ContentType::EventJson => Some(EventFormat::Json),
            ContentType::EventXml => Some(EventFormat::Xml),
            _ => None,
        }
    }
}

/// One complete frame: header block plus any body mandated by `Content-Length`.
#[derive(Debug, Clone, PartialEq)]
pub struct EslMessage {
    /// Derived from the `Content-Type` header
    pub content_type: ContentType,
    /// Frame headers in arrival order
    pub headers: IndexMap<String, String>,
    /// Frame body, exactly `Content-Length` bytes
    pub body: Option<Vec<u8>>,
}

impl EslMessage {
    /// Create new message
    pub fn new(
        content_type: ContentType,
        headers: IndexMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Self {
        Self {
            content_type,
            headers,
            body,
        }
    }

    /// Look up a frame header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(|s| s.as_str())
    }

    /// Convert to EslResponse
    pub fn into_response(self) -> EslResponse {
        EslResponse::new(self.headers, self.body)
    }

    /// Decode into an [`EslEvent`].
    ///
    /// `text/event-*` frames yield the nested switch event carried in the
    /// body. Any other frame becomes an event built from its own headers.
    pub fn into_event(self) -> EslResult<EslEvent> {
        match self
            .content_type
            .event_format()
        {
            Some(format) => {
                let body = self
                    .body
                    .ok_or_else(|| EslError::framing("event frame missing body"))?;
                parse_event_body(&body, format)
            }
            None => Ok(EslEvent::from_parts(self.headers, self.body)),
        }
    }

    /// Serialize to wire format. `Content-Length` is recomputed from the body.
    ///
    /// Header values are percent-encoded where needed so that
    /// [`EslParser`] reads back the same text.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in self
            .headers
            .iter()
            .filter(|(k, _)| k.as_str() != HEADER_CONTENT_LENGTH)
        {
            out.extend_from_slice(
                format!(
                    "{}: {}\n",
                    key,
                    percent_encode(value.as_bytes(), HEADER_VALUE_ESCAPES)
                )
                .as_bytes(),
            );
        }
        if let Some(body) = &self.body {
            out.extend_from_slice(format!("{}: {}\n\n", HEADER_CONTENT_LENGTH, body.len()).as_bytes());
            out.extend_from_slice(body);
        } else {
            out.push(b'\n');
        }
        out
    }
}

/// Parser state for handling incomplete messages
#[derive(Debug)]
enum ParseState {
    WaitingForHeaders,
    WaitingForBody {
        content_type: ContentType,
        headers: IndexMap<String, String>,
        body_length: usize,
    },
}

/// Incremental frame parser. Feed bytes with [`add_data`](Self::add_data),
/// pull frames with [`parse_message`](Self::parse_message).
#[derive(Debug)]
pub struct EslParser {
    buffer: EslBuffer,
    state: ParseState,
}

impl EslParser {
    /// Create new parser
    pub fn new() -> Self {
        Self {
            buffer: EslBuffer::new(),
            state: ParseState::WaitingForHeaders,
        }
    }

    /// Add data to the parser buffer
    pub fn add_data(&mut self, data: &[u8]) -> EslResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()
    }

    /// Try to parse one complete frame. `Ok(None)` means more data is needed.
    pub fn parse_message(&mut self) -> EslResult<Option<EslMessage>> {
        loop {
            match std::mem::replace(&mut self.state, ParseState::WaitingForHeaders) {
                ParseState::WaitingForHeaders => {
                    let Some(block) = self
                        .buffer
                        .extract_header_block()
                    else {
                        return Ok(None);
                    };
                    self.buffer
                        .compact();

                    let block = String::from_utf8(block)
                        .map_err(|_| EslError::framing("invalid UTF-8 in headers"))?;
                    let headers = parse_headers(&block)?;

                    // Every frame carries Content-Type; its absence means we
                    // are reading from the middle of something else.
                    let content_type = headers
                        .get(HEADER_CONTENT_TYPE)
                        .map(|ct| ContentType::from_header(ct))
                        .ok_or_else(|| {
                            EslError::framing("missing Content-Type header, stream out of sync")
                        })?;

                    match content_length(&headers)? {
                        Some(body_length) if body_length > 0 => {
                            self.state = ParseState::WaitingForBody {
                                content_type,
                                headers,
                                body_length,
                            };
                        }
                        _ => return Ok(Some(EslMessage::new(content_type, headers, None))),
                    }
                }
                ParseState::WaitingForBody {
                    content_type,
                    headers,
                    body_length,
                } => match self
                    .buffer
                    .extract_bytes(body_length)
                {
                    Some(body) => {
                        self.buffer
                            .compact();
                        return Ok(Some(EslMessage::new(content_type, headers, Some(body))));
                    }
                    None => {
                        self.state = ParseState::WaitingForBody {
                            content_type,
                            headers,
                            body_length,
                        };
                        return Ok(None);
                    }
                },
            }
        }
    }

    /// Called when the stream hit EOF. A partially received frame is a framing error.
    pub fn finish(&self) -> EslResult<()> {
        match &self.state {
            ParseState::WaitingForBody { body_length, .. } => Err(EslError::framing(format!(
                "stream closed with {} of {} body bytes received",
                self.buffer.len(),
                body_length
            ))),
            ParseState::WaitingForHeaders
                if !self
                    .buffer
                    .remaining()
                    .iter()
                    .all(u8::is_ascii_whitespace) =>
            {
                Err(EslError::framing("stream closed inside a header block"))
            }
            ParseState::WaitingForHeaders => Ok(()),
        }
    }

    /// `true` when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ParseState::WaitingForHeaders) && self.buffer.is_empty()
    }
}

impl Default for EslParser {
    fn default() -> Self {
        Self::new()
    }
}

fn content_length(headers: &IndexMap<String, String>) -> EslResult<Option<usize>> {
    let Some(raw) = headers.get(HEADER_CONTENT_LENGTH) else {
        return Ok(None);
    };
    let length: usize = raw
        .trim()
        .parse()
        .map_err(|_| EslError::framing(format!("invalid Content-Length: {}", raw)))?;
    if length > MAX_MESSAGE_SIZE {
        return Err(EslError::framing(format!(
            "Content-Length {} exceeds limit {}",
            length, MAX_MESSAGE_SIZE
        )));
    }
    Ok(Some(length))
}

/// Parse `Name: Value` lines, percent-decoding values. Last duplicate wins.
pub(crate) fn parse_headers(block: &str) -> EslResult<IndexMap<String, String>> {
    let mut headers = IndexMap::new();

    for line in block.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(colon_pos) = line.find(':') else {
            return Err(EslError::InvalidHeader {
                header: line.to_string(),
            });
        };
        let key = line[..colon_pos]
            .trim()
            .to_string();
        let raw_value = line[colon_pos + 1..].trim();
        let value = percent_decode_str(raw_value)
            .decode_utf8()
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw_value.to_string());
        headers.insert(key, value);
    }

    Ok(headers)
}

/// Decode the body of a `text/event-*` frame into the switch event it wraps.
pub fn parse_event_body(body: &[u8], format: EventFormat) -> EslResult<EslEvent> {
    match format {
        EventFormat::Plain => parse_plain_event(body),
        EventFormat::Json => parse_json_event(body),
        EventFormat::Xml => parse_xml_event(body),
    }
}

/// The plain body is itself a header block, optionally followed by an inner
/// body whose length is given by the inner `Content-Length`.
fn parse_plain_event(body: &[u8]) -> EslResult<EslEvent> {
    let (header_bytes, rest) = match find_blank_line(body) {
        Some((end, terminator_len)) => (&body[..end], &body[end + terminator_len..]),
        None => (body, &[][..]),
    };

    let header_str = std::str::from_utf8(header_bytes)
        .map_err(|_| EslError::framing("invalid UTF-8 in event headers"))?;
    let headers = parse_headers(header_str)?;

    let inner_body = match content_length(&headers)? {
        Some(length) if length > rest.len() => {
            return Err(EslError::framing(format!(
                "inner Content-Length {} exceeds remaining {} bytes",
                length,
                rest.len()
            )));
        }
        Some(0) => None,
        Some(length) => Some(rest[..length].to_vec()),
        None if rest.is_empty() => None,
        None => Some(rest.to_vec()),
    };

    Ok(EslEvent::from_parts(headers, inner_body))
}

fn parse_json_event(body: &[u8]) -> EslResult<EslEvent> {
    let json_value: serde_json::Value = serde_json::from_slice(body)?;
    let obj = json_value
        .as_object()
        .ok_or_else(|| EslError::framing("JSON event is not an object"))?;

    let mut headers = IndexMap::new();
    let mut inner_body = None;
    for (key, value) in obj {
        let value_str = match value {
            serde_json::Value::String(s) => s.clone(),
            _ => value.to_string(),
        };
        // mod_event_socket puts the event body under `_body`
        if key == "_body" {
            inner_body = Some(value_str.into_bytes());
        } else {
            headers.insert(key.clone(), value_str);
        }
    }

    Ok(EslEvent::from_parts(headers, inner_body))
}

/// FreeSWITCH XML event format:
/// ```xml
/// <event>
///   <headers>
///     <Event-Name>HEARTBEAT</Event-Name>
///   </headers>
///   <body>...</body>
/// </event>
/// ```
fn parse_xml_event(body: &[u8]) -> EslResult<EslEvent> {
    use quick_xml::events::Event as XmlEvent;
    use quick_xml::Reader;

    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    let mut headers = IndexMap::new();
    let mut inner_body = None;
    let mut in_headers = false;
    let mut in_body = false;
    let mut current_tag: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            XmlEvent::Start(ref e) => {
                let tag = String::from_utf8_lossy(
                    e.name()
                        .as_ref(),
                )
                .to_string();
                match tag.as_str() {
                    "headers" => in_headers = true,
                    "body" => in_body = true,
                    _ if in_headers => current_tag = Some(tag),
                    _ => {}
                }
            }
            XmlEvent::End(ref e) => match e
                .name()
                .as_ref()
            {
                b"headers" => in_headers = false,
                b"body" => in_body = false,
                _ if in_headers => current_tag = None,
                _ => {}
            },
            XmlEvent::Text(ref e) => {
                let text = e
                    .unescape()?
                    .to_string();
                if in_body {
                    inner_body = Some(text.into_bytes());
                } else if let Some(ref tag) = current_tag {
                    headers.insert(tag.clone(), text);
                }
            }
            XmlEvent::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(EslEvent::from_parts(headers, inner_body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EslEventType;

    fn parse_one(data: &[u8]) -> EslMessage {
        let mut parser = EslParser::new();
        parser
            .add_data(data)
            .unwrap();
        parser
            .parse_message()
            .unwrap()
            .unwrap()
    }

    fn event_frame(content_type: &str, body: &str) -> Vec<u8> {
        format!(
            "Content-Length: {}\nContent-Type: {}\n\n{}",
            body.len(),
            content_type,
            body
        )
        .into_bytes()
    }

    #[test]
    fn test_parse_auth_request() {
        let message = parse_one(b"Content-Type: auth/request\n\n");
        assert_eq!(message.content_type, ContentType::AuthRequest);
        assert!(message
            .body
            .is_none());
    }

    #[test]
    fn test_parse_crlf_frame() {
        let message = parse_one(b"Content-Type: command/reply\r\nReply-Text: +OK accepted\r\n\r\n");
        assert_eq!(message.content_type, ContentType::CommandReply);
        assert_eq!(message.header("Reply-Text"), Some("+OK accepted"));
    }

    #[test]
    fn test_parse_api_response_binary_body() {
        let mut data = b"Content-Type: api/response\nContent-Length: 4\n\n".to_vec();
        data.extend_from_slice(&[0x00, 0xff, b'\n', b'\n']);
        let message = parse_one(&data);
        assert_eq!(message.content_type, ContentType::ApiResponse);
        assert_eq!(message.body, Some(vec![0x00, 0xff, b'\n', b'\n']));
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut parser = EslParser::new();
        parser
            .add_data(b"Content-Type: api/response\nContent-Le")
            .unwrap();
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
        parser
            .add_data(b"ngth: 5\n\nHel")
            .unwrap();
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
        parser
            .add_data(b"lo")
            .unwrap();
        let message = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(message.body, Some(b"Hello".to_vec()));
        assert!(parser.is_idle());
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut parser = EslParser::new();
        parser
            .add_data(b"Content-Type: auth/request\n\nContent-Type: command/reply\nReply-Text: +OK\n\n")
            .unwrap();
        let first = parser
            .parse_message()
            .unwrap()
            .unwrap();
        let second = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(first.content_type, ContentType::AuthRequest);
        assert_eq!(second.content_type, ContentType::CommandReply);
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unsatisfied_content_length_at_eof() {
        let mut parser = EslParser::new();
        parser
            .add_data(b"Content-Type: api/response\nContent-Length: 10\n\ntest")
            .unwrap();
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
        assert!(matches!(parser.finish(), Err(EslError::Framing { .. })));
    }

    #[test]
    fn test_clean_eof() {
        let mut parser = EslParser::new();
        parser
            .add_data(b"Content-Type: auth/request\n\n")
            .unwrap();
        parser
            .parse_message()
            .unwrap();
        assert!(parser
            .finish()
            .is_ok());
    }

    #[test]
    fn test_missing_content_type_is_framing_error() {
        let mut parser = EslParser::new();
        parser
            .add_data(b"Reply-Text: +OK\n\n")
            .unwrap();
        assert!(matches!(
            parser.parse_message(),
            Err(EslError::Framing { .. })
        ));
    }

    #[test]
    fn test_oversized_and_non_numeric_content_length() {
        let mut parser = EslParser::new();
        let data = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n",
            MAX_MESSAGE_SIZE + 1
        );
        parser
            .add_data(data.as_bytes())
            .unwrap();
        assert!(parser
            .parse_message()
            .is_err());

        let mut parser = EslParser::new();
        parser
            .add_data(b"Content-Type: api/response\nContent-Length: abc\n\n")
            .unwrap();
        assert!(parser
            .parse_message()
            .is_err());
    }

    #[test]
    fn test_header_without_colon() {
        assert!(matches!(
            parse_headers("Content-Type auth/request"),
            Err(EslError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_parse_headers_percent_decodes_values() {
        let headers = parse_headers("Reply-Text: %2BOK\nX-Bad: %ZZinvalid").unwrap();
        assert_eq!(headers.get("Reply-Text").map(String::as_str), Some("+OK"));
        assert_eq!(
            headers
                .get("X-Bad")
                .map(String::as_str),
            Some("%ZZinvalid")
        );
    }

    #[test]
    fn test_duplicate_header_last_wins() {
        let headers = parse_headers("X-A: 1\nX-B: 2\nX-A: 3").unwrap();
        assert_eq!(headers.get("X-A").map(String::as_str), Some("3"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_plain_event_nested() {
        let body = "Event-Name: CHANNEL_ANSWER\nUnique-ID: test-uuid\n\n";
        let event = parse_one(&event_frame("text/event-plain", body))
            .into_event()
            .unwrap();
        assert_eq!(event.event_type(), Some(EslEventType::ChannelAnswer));
        assert_eq!(event.unique_id(), Some("test-uuid"));
        assert_eq!(event.body(), None);
    }

    #[test]
    fn test_plain_event_with_inner_body() {
        let inner_body = "+OK Status\n";
        let body = format!(
            "Event-Name: BACKGROUND_JOB\nJob-UUID: abc-123\nContent-Length: {}\n\n{}",
            inner_body.len(),
            inner_body
        );
        let event = parse_one(&event_frame("text/event-plain", &body))
            .into_event()
            .unwrap();
        assert_eq!(event.event_type(), Some(EslEventType::BackgroundJob));
        assert_eq!(event.job_uuid(), Some("abc-123"));
        assert_eq!(event.body(), Some("+OK Status\n"));
    }

    #[test]
    fn test_plain_event_short_inner_body() {
        let body = "Event-Name: BACKGROUND_JOB\nContent-Length: 50\n\nshort";
        let result = parse_one(&event_frame("text/event-plain", body)).into_event();
        assert!(matches!(result, Err(EslError::Framing { .. })));
    }

    #[test]
    fn test_plain_event_percent_decoding() {
        let body = "Event-Name: HEARTBEAT\nUp-Time: 0%20years%2C%200%20days\n\n";
        let event = parse_one(&event_frame("text/event-plain", body))
            .into_event()
            .unwrap();
        assert_eq!(event.header("Up-Time"), Some("0 years, 0 days"));
    }

    #[test]
    fn test_json_event() {
        let body = r#"{"Event-Name":"BACKGROUND_JOB","Job-UUID":"42","_body":"+OK done\n"}"#;
        let event = parse_one(&event_frame("text/event-json", body))
            .into_event()
            .unwrap();
        assert_eq!(event.event_type(), Some(EslEventType::BackgroundJob));
        assert_eq!(event.job_uuid(), Some("42"));
        assert_eq!(event.body(), Some("+OK done\n"));
        assert_eq!(event.header("_body"), None);
    }

    #[test]
    fn test_xml_event_with_body() {
        let xml_body = "<event>\n  <headers>\n    <Event-Name>BACKGROUND_JOB</Event-Name>\n    <Job-UUID>def-456</Job-UUID>\n  </headers>\n  <body>+OK result data</body>\n</event>";
        let event = parse_one(&event_frame("text/event-xml", xml_body))
            .into_event()
            .unwrap();
        assert_eq!(event.event_type(), Some(EslEventType::BackgroundJob));
        assert_eq!(event.header("Job-UUID"), Some("def-456"));
        assert_eq!(event.body(), Some("+OK result data"));
    }

    #[test]
    fn test_non_event_frame_into_event() {
        let event = parse_one(b"Content-Type: text/disconnect-notice\nContent-Disposition: linger\n\n")
            .into_event()
            .unwrap();
        assert_eq!(event.header("Content-Disposition"), Some("linger"));
        assert_eq!(event.event_type(), None);
    }

    #[test]
    fn test_rude_rejection_variants() {
        assert_eq!(
            ContentType::from_header("text/rude-rejection"),
            ContentType::RudeRejection
        );
        assert_eq!(
            ContentType::from_header("rude-rejection"),
            ContentType::RudeRejection
        );
        assert_eq!(
            ContentType::from_header("log/data"),
            ContentType::Other("log/data".into())
        );
    }

    #[test]
    fn test_wire_round_trip() {
        let mut headers = IndexMap::new();
        headers.insert("Content-Type".to_string(), "api/response".to_string());
        headers.insert("X-Trace".to_string(), "abc".to_string());
        headers.insert("X-Rate".to_string(), "100%20off".to_string());
        headers.insert("X-Multi".to_string(), "one\ntwo".to_string());
        let original = EslMessage::new(
            ContentType::ApiResponse,
            headers,
            Some(b"line one\n\nline two\x00".to_vec()),
        );

        let decoded = parse_one(&original.to_wire());
        assert_eq!(decoded.content_type, original.content_type);
        assert_eq!(decoded.body, original.body);
        assert_eq!(decoded.header("X-Trace"), Some("abc"));
        assert_eq!(decoded.header("X-Rate"), Some("100%20off"));
        assert_eq!(decoded.header("X-Multi"), Some("one\ntwo"));
        assert_eq!(decoded.header("Content-Length"), Some("19"));
    }

    #[test]
    fn test_event_plain_round_trip() {
        let mut event = EslEvent::with_type(EslEventType::BackgroundJob);
        event.set_header("Event-Name", "BACKGROUND_JOB");
        event.set_header("Job-UUID", "job-789");
        event.set_header("Job-Command", "originate user/1000 &park()");
        event.set_body("+OK Status\nLine 2\n");

        let decoded = parse_event_body(&event.to_plain_format(), EventFormat::Plain).unwrap();
        assert_eq!(decoded.event_type(), event.event_type());
        assert_eq!(decoded.body(), event.body());
        assert_eq!(decoded.header("Job-Command"), Some("originate user/1000 &park()"));
        assert_eq!(decoded.header("Content-Length"), Some("18"));
    }
}
