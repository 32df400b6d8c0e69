//! Command encoding and reply handling

use crate::{
    constants::{HEADER_CONTENT_LENGTH, HEADER_REPLY_TEXT, HEADER_TERMINATOR, LINE_TERMINATOR},
    error::{EslError, EslResult},
    event::EslEvent,
    headers::EventHeader,
    protocol::parse_headers,
};
use indexmap::IndexMap;
use std::fmt;

/// Reject text that would end the command line early.
///
/// Commands are newline-delimited, so an embedded `\n` or `\r` would let the
/// caller smuggle a second command onto the socket.
fn single_line<'a>(text: &'a str, what: &str) -> EslResult<&'a str> {
    if text.contains(['\n', '\r']) {
        return Err(EslError::protocol_error(format!(
            "{} must not contain newlines",
            what
        )));
    }
    Ok(text)
}

/// Serialize a bare command line: the text followed by a blank line.
pub fn encode_command(text: &str) -> EslResult<Vec<u8>> {
    Ok(format!("{}{}", single_line(text, "command")?, HEADER_TERMINATOR).into_bytes())
}

/// Reply-Text classification.
///
/// Commands return `+OK …` on success and `-ERR …` on failure. `getvar`
/// returns the bare value with no prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyStatus {
    /// Reply-Text starts with `+OK` or is absent/empty.
    Ok,
    /// Reply-Text starts with `-ERR`.
    Err,
    /// Reply-Text present but matches neither prefix.
    Other,
}

/// Reply to a command: a `command/reply` or `api/response` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct EslResponse {
    headers: IndexMap<String, String>,
    body: Option<Vec<u8>>,
    status: ReplyStatus,
}

impl EslResponse {
    /// `ReplyStatus` is derived from the `Reply-Text` header, or for
    /// `api/response` frames (which carry no Reply-Text) from the body prefix.
    pub fn new(headers: IndexMap<String, String>, body: Option<Vec<u8>>) -> Self {
        let status_text = match headers.get(HEADER_REPLY_TEXT) {
            Some(text) => Some(text.as_str()),
            None => body
                .as_deref()
                .and_then(|b| std::str::from_utf8(b).ok())
                .filter(|b| b.starts_with("-ERR")),
        };
        let status = match status_text {
            None | Some("") => ReplyStatus::Ok,
            Some(t) if t.starts_with("+OK") => ReplyStatus::Ok,
            Some(t) if t.starts_with("-ERR") => ReplyStatus::Err,
            Some(_) => ReplyStatus::Other,
        };

        Self {
            headers,
            body,
            status,
        }
    }

    /// `true` if the reply is `+OK` or carries no status.
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Classification of the reply.
    pub fn reply_status(&self) -> ReplyStatus {
        self.status
    }

    /// Body as UTF-8 text.
    pub fn body(&self) -> Option<&str> {
        self.body
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Raw body bytes.
    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body
            .as_deref()
    }

    /// Look up a response header by name.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    /// All response headers.
    pub fn headers(&self) -> &IndexMap<String, String> {
        &self.headers
    }

    /// Raw `Reply-Text` header value (e.g. `+OK`, `-ERR invalid command`).
    pub fn reply_text(&self) -> Option<&str> {
        self.header(HEADER_REPLY_TEXT)
    }

    /// `Job-UUID` of a `bgapi` reply.
    ///
    /// Reads the dedicated header, falling back to the `+OK Job-UUID: <uuid>`
    /// form of Reply-Text.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(EventHeader::JobUuid)
            .or_else(|| {
                self.reply_text()?
                    .strip_prefix("+OK Job-UUID:")
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            })
    }

    /// Fail with [`EslError::CommandRejected`] on `-ERR`; any other reply is
    /// returned as-is, including bare values such as a `getvar` result.
    ///
    /// ```
    /// # use esl_bridge::EslResponse;
    /// # use indexmap::IndexMap;
    /// let headers: IndexMap<String, String> = [("Reply-Text".into(), "bar".into())].into_iter().collect();
    /// let resp = EslResponse::new(headers, None);
    /// assert!(resp.into_result().is_ok());
    /// ```
    pub fn into_result(self) -> EslResult<Self> {
        match self.status {
            ReplyStatus::Err => Err(EslError::CommandRejected {
                reply_text: self.status_text("-ERR"),
            }),
            ReplyStatus::Ok | ReplyStatus::Other => Ok(self),
        }
    }

    /// Require `+OK`: handshake steps cannot proceed on an unrecognised reply.
    pub(crate) fn into_ok(self) -> EslResult<Self> {
        match self.status {
            ReplyStatus::Other => Err(EslError::UnexpectedReply {
                reply_text: self.status_text(""),
            }),
            _ => self.into_result(),
        }
    }

    fn status_text(&self, default: &str) -> String {
        self.reply_text()
            .or_else(|| {
                self.body()
                    .map(str::trim_end)
            })
            .unwrap_or(default)
            .to_string()
    }

    /// Channel data from an outbound `connect` reply.
    ///
    /// The switch sends the channel variables as reply headers; some versions
    /// put them in a header-formatted body instead. Both are merged, body last.
    pub fn into_channel_data(self) -> EslResult<EslEvent> {
        let mut headers = self.headers;
        headers.shift_remove(crate::constants::HEADER_CONTENT_TYPE);
        headers.shift_remove(HEADER_CONTENT_LENGTH);
        if let Some(body) = self
            .body
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
            .filter(|b| !b.trim().is_empty())
        {
            headers.extend(parse_headers(body)?);
        }
        Ok(EslEvent::from_parts(headers, None))
    }
}

/// Builder for commands carrying headers and an optional body (`sendmsg` style).
///
/// ```
/// use esl_bridge::CommandBuilder;
///
/// let cmd = CommandBuilder::new("sendmsg")
///     .header("call-command", "execute").unwrap()
///     .body("payload data")
///     .build();
/// assert!(cmd.starts_with("sendmsg\n"));
/// assert!(cmd.contains("call-command: execute"));
/// assert!(cmd.contains("Content-Length: 12"));
/// ```
#[derive(Debug)]
pub struct CommandBuilder {
    command: String,
    headers: IndexMap<String, String>,
    body: Option<Vec<u8>>,
}

impl CommandBuilder {
    /// Start building a command with the given command line.
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: IndexMap::new(),
            body: None,
        }
    }

    /// Add header to command.
    ///
    /// Returns an error if the name or value contains newline characters.
    pub fn header(mut self, name: &str, value: &str) -> EslResult<Self> {
        self.headers.insert(
            single_line(name, "header name")?.to_string(),
            single_line(value, "header value")?.to_string(),
        );
        Ok(self)
    }

    /// Set command body. The body is length-delimited so it may contain newlines.
    pub fn body(self, body: &str) -> Self {
        self.body_bytes(body.as_bytes())
    }

    /// Set a body that need not be UTF-8.
    pub fn body_bytes(mut self, body: &[u8]) -> Self {
        self.body = Some(body.to_vec());
        self
    }

    /// Build the wire string. `Content-Length` counts bytes, not chars.
    ///
    /// A non-UTF-8 body is rendered lossily; use
    /// [`build_bytes`](Self::build_bytes) to put it on the socket.
    pub fn build(self) -> String {
        String::from_utf8_lossy(&self.build_bytes()).into_owned()
    }

    /// Build the exact wire bytes.
    pub fn build_bytes(self) -> Vec<u8> {
        use std::fmt::Write;
        let mut head = self.command;
        head.push_str(LINE_TERMINATOR);

        for (key, value) in &self.headers {
            let _ = write!(head, "{}: {}{}", key, value, LINE_TERMINATOR);
        }
        if let Some(body) = &self.body {
            let _ = write!(head, "{}: {}{}", HEADER_CONTENT_LENGTH, body.len(), LINE_TERMINATOR);
        }
        head.push_str(LINE_TERMINATOR);

        let mut result = head.into_bytes();
        if let Some(body) = self.body {
            result.extend_from_slice(&body);
        }
        result
    }
}

/// A command the client can put on the socket.
#[derive(Clone)]
pub enum EslCommand {
    /// `auth <password>`
    Auth { password: String },
    /// `userauth <user>@<domain>:<password>`
    UserAuth { user: String, password: String },
    /// Command line sent as given
    Raw { command: String },
    Api { command: String },
    BgApi { command: String },
    /// `event <format> <events>`
    Events { format: String, events: String },
    Filter { header: String, value: String },
    /// `sendmsg [uuid]` with the event's headers and body
    SendMsg {
        uuid: Option<String>,
        event: EslEvent,
    },
    /// Dialplan application, sent as a `call-command: execute` message
    Execute {
        app: String,
        args: Option<String>,
        uuid: Option<String>,
        event_lock: bool,
    },
    Exit,
    /// Events for one channel; outbound sessions leave `uuid` empty.
    MyEvents {
        format: String,
        uuid: Option<String>,
    },
    /// Keep the socket after hangup, optionally for `timeout` seconds
    Linger { timeout: Option<u32> },
    NoLinger,
    /// Continue the dialplan when the socket goes away
    Resume,
    GetVar { name: String },
    /// Outbound handshake; the reply carries the channel data
    Connect,
}

// Debug shows the (redacted) command line so secrets never reach logs.
impl fmt::Debug for EslCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_wire_bytes() {
            Ok(wire) => f
                .debug_tuple("EslCommand")
                .field(&self.log_line(&wire))
                .finish(),
            Err(_) => f.write_str("EslCommand(<invalid>)"),
        }
    }
}

impl EslCommand {
    /// Text safe to put in logs.
    pub(crate) fn log_line(&self, wire: &[u8]) -> String {
        match self {
            EslCommand::Auth { .. } => "auth [REDACTED]".to_string(),
            EslCommand::UserAuth { user, .. } => format!("userauth {}:[REDACTED]", user),
            _ => {
                let first = wire
                    .split(|&b| b == b'\n')
                    .next()
                    .unwrap_or_default();
                String::from_utf8_lossy(first).into_owned()
            }
        }
    }

    /// Wire text of the command, after checking every caller-supplied field.
    ///
    /// A binary `sendmsg` body is rendered lossily; the connection writes
    /// [`to_wire_bytes`](Self::to_wire_bytes).
    pub fn to_wire_format(&self) -> EslResult<String> {
        self.to_wire_bytes()
            .map(|wire| String::from_utf8_lossy(&wire).into_owned())
    }

    /// Exact bytes put on the socket for this command.
    pub fn to_wire_bytes(&self) -> EslResult<Vec<u8>> {
        let line = match self {
            EslCommand::Auth { password } => format!("auth {}", single_line(password, "password")?),
            EslCommand::UserAuth { user, password } => format!(
                "userauth {}:{}",
                single_line(user, "user")?,
                single_line(password, "password")?
            ),
            EslCommand::Raw { command } => single_line(command, "command")?.to_string(),
            EslCommand::Api { command } => format!("api {}", single_line(command, "api command")?),
            EslCommand::BgApi { command } => {
                format!("bgapi {}", single_line(command, "bgapi command")?)
            }
            EslCommand::Events { format, events } => format!(
                "event {} {}",
                single_line(format, "event format")?,
                single_line(events, "event list")?
            ),
            EslCommand::Filter { header, value } => format!(
                "filter {} {}",
                single_line(header, "filter header")?,
                single_line(value, "filter value")?
            ),
            EslCommand::MyEvents { format, uuid } => {
                let format = single_line(format, "myevents format")?;
                match uuid {
                    Some(uuid) => format!("myevents {} {}", single_line(uuid, "myevents uuid")?, format),
                    None => format!("myevents {}", format),
                }
            }
            EslCommand::Linger { timeout: Some(secs) } => format!("linger {}", secs),
            EslCommand::Linger { timeout: None } => "linger".to_string(),
            EslCommand::NoLinger => "nolinger".to_string(),
            EslCommand::Resume => "resume".to_string(),
            EslCommand::Exit => "exit".to_string(),
            EslCommand::Connect => "connect".to_string(),
            EslCommand::GetVar { name } => format!("getvar {}", single_line(name, "getvar name")?),
            EslCommand::SendMsg { uuid, event } => return sendmsg_frame(uuid.as_deref(), event),
            EslCommand::Execute {
                app,
                args,
                uuid,
                event_lock,
            } => {
                let message = execute_message(app, args.as_deref(), *event_lock)?;
                return sendmsg_frame(uuid.as_deref(), &message);
            }
        };
        Ok((line + HEADER_TERMINATOR).into_bytes())
    }
}

fn sendmsg_frame(uuid: Option<&str>, message: &EslEvent) -> EslResult<Vec<u8>> {
    let line = match uuid {
        Some(uuid) => format!("sendmsg {}", single_line(uuid, "sendmsg uuid")?),
        None => "sendmsg".to_string(),
    };
    let mut builder = CommandBuilder::new(&line);
    // Content-Length is recomputed from the body.
    for (name, value) in message
        .headers()
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case(HEADER_CONTENT_LENGTH))
    {
        builder = builder.header(name, value)?;
    }
    if let Some(body) = message.body_bytes() {
        builder = builder.body_bytes(body);
    }
    Ok(builder.build_bytes())
}

fn execute_message(app: &str, args: Option<&str>, event_lock: bool) -> EslResult<EslEvent> {
    let mut message = EslEvent::new();
    message.set_header("call-command", "execute");
    message.set_header("execute-app-name", single_line(app, "execute app")?);
    if event_lock {
        message.set_header("event-lock", "true");
    }
    // Arguments travel as a body so they may hold any characters.
    if let Some(args) = args {
        message.set_body(args);
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(text: &str) -> EslResponse {
        let headers: IndexMap<String, String> = [("Reply-Text".to_string(), text.to_string())]
            .into_iter()
            .collect();
        EslResponse::new(headers, None)
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(encode_command("noop").unwrap(), b"noop\n\n".to_vec());
        assert!(encode_command("api status\n\nevent plain ALL").is_err());
    }

    #[test]
    fn test_simple_commands() {
        let cases = [
            (
                EslCommand::Auth {
                    password: "ClueCon".into(),
                },
                "auth ClueCon\n\n",
            ),
            (
                EslCommand::BgApi {
                    command: "originate user/1000 &park()".into(),
                },
                "bgapi originate user/1000 &park()\n\n",
            ),
            (
                EslCommand::Events {
                    format: "plain".into(),
                    events: "ALL".into(),
                },
                "event plain ALL\n\n",
            ),
            (
                EslCommand::Raw {
                    command: "api status".into(),
                },
                "api status\n\n",
            ),
            (EslCommand::Linger { timeout: Some(600) }, "linger 600\n\n"),
            (EslCommand::Linger { timeout: None }, "linger\n\n"),
            (EslCommand::Connect, "connect\n\n"),
            (
                EslCommand::MyEvents {
                    format: "json".into(),
                    uuid: Some("abc-123".into()),
                },
                "myevents abc-123 json\n\n",
            ),
        ];
        for (cmd, wire) in cases {
            assert_eq!(cmd.to_wire_format().unwrap(), wire, "{:?}", cmd);
        }
    }

    #[test]
    fn test_execute_carries_args_as_body() {
        let wire = EslCommand::Execute {
            app: "playback".into(),
            args: Some("/tmp/hello world.wav".into()),
            uuid: Some("abc".into()),
            event_lock: true,
        }
        .to_wire_format()
        .unwrap();

        assert!(wire.starts_with("sendmsg abc\n"));
        assert!(wire.contains("call-command: execute\n"));
        assert!(wire.contains("execute-app-name: playback\n"));
        assert!(wire.contains("event-lock: true\n"));
        assert!(wire.contains("Content-Length: 20\n\n/tmp/hello world.wav"));
    }

    #[test]
    fn test_content_length_counts_bytes() {
        let cmd = CommandBuilder::new("sendmsg")
            .body("héllo")
            .build();
        assert!(cmd.contains("Content-Length: 6\n"));
    }

    #[test]
    fn test_sendmsg_binary_body_and_single_length() {
        let mut message = EslEvent::new();
        message.set_header("call-command", "unicast");
        message.set_header("Content-Length", "999");
        message.set_body(vec![0xff, 0x00, b'\n', 0xfe]);

        let wire = EslCommand::SendMsg {
            uuid: Some("abc".into()),
            event: message,
        }
        .to_wire_bytes()
        .unwrap();

        let text = String::from_utf8_lossy(&wire);
        assert_eq!(text.matches("Content-Length").count(), 1);
        assert!(text.contains("Content-Length: 4\n\n"));
        assert!(wire.ends_with(&[0xff, 0x00, b'\n', 0xfe]));
    }

    #[test]
    fn test_newline_injection_rejected() {
        assert!(EslCommand::Api {
            command: "status\n\nevent plain ALL".into(),
        }
        .to_wire_format()
        .is_err());
        assert!(EslCommand::Filter {
            header: "Event-Name\r\n".into(),
            value: "CHANNEL_CREATE".into(),
        }
        .to_wire_format()
        .is_err());
        assert!(CommandBuilder::new("test")
            .header("X-Key", "bad\nvalue")
            .is_err());
    }

    #[test]
    fn test_debug_and_log_line_redact_password() {
        let auth = EslCommand::Auth {
            password: "secret".into(),
        };
        let debug_str = format!("{:?}", auth);
        assert!(!debug_str.contains("secret"));
        assert_eq!(auth.log_line(b"auth secret\n\n"), "auth [REDACTED]");
    }

    #[test]
    fn test_reply_status() {
        assert_eq!(reply("+OK accepted").reply_status(), ReplyStatus::Ok);
        assert_eq!(reply("").reply_status(), ReplyStatus::Ok);
        assert_eq!(reply("-ERR invalid").reply_status(), ReplyStatus::Err);
        assert_eq!(reply("sip_from_user").reply_status(), ReplyStatus::Other);
        assert!(EslResponse::new(IndexMap::new(), None).is_success());
    }

    #[test]
    fn test_rejected_reply_into_result() {
        let err = reply("-ERR no such channel")
            .into_result()
            .unwrap_err();
        assert!(
            matches!(err, EslError::CommandRejected { ref reply_text } if reply_text == "-ERR no such channel")
        );
    }

    #[test]
    fn test_bare_value_accepted_except_in_handshake() {
        let value = reply("sip_from_user")
            .into_result()
            .unwrap();
        assert_eq!(value.reply_text(), Some("sip_from_user"));

        let err = reply("sip_from_user")
            .into_ok()
            .unwrap_err();
        assert!(
            matches!(err, EslError::UnexpectedReply { ref reply_text } if reply_text == "sip_from_user")
        );
        assert!(reply("+OK")
            .into_ok()
            .is_ok());
        assert!(matches!(
            reply("-ERR denied").into_ok(),
            Err(EslError::CommandRejected { .. })
        ));
    }

    #[test]
    fn test_api_response_err_body() {
        let resp = EslResponse::new(IndexMap::new(), Some(b"-ERR no such command\n".to_vec()));
        assert_eq!(resp.reply_status(), ReplyStatus::Err);
        let err = resp
            .into_result()
            .unwrap_err();
        assert!(
            matches!(err, EslError::CommandRejected { ref reply_text } if reply_text == "-ERR no such command")
        );
    }

    #[test]
    fn test_job_uuid_from_reply_text() {
        assert_eq!(reply("+OK Job-UUID: 42").job_uuid(), Some("42"));
        assert_eq!(reply("+OK").job_uuid(), None);

        let mut headers = IndexMap::new();
        headers.insert("Reply-Text".to_string(), "+OK Job-UUID: 42".to_string());
        headers.insert("Job-UUID".to_string(), "header-wins".to_string());
        assert_eq!(EslResponse::new(headers, None).job_uuid(), Some("header-wins"));
    }

    #[test]
    fn test_channel_data_merges_headers_and_body() {
        let mut headers = IndexMap::new();
        headers.insert("Content-Type".to_string(), "command/reply".to_string());
        headers.insert("Unique-ID".to_string(), "abcd-1234".to_string());
        headers.insert("Event-Name".to_string(), "CHANNEL_DATA".to_string());
        let resp = EslResponse::new(
            headers,
            Some(b"Channel-Name: sofia/internal/1000%40example.com\n".to_vec()),
        );

        let data = resp
            .into_channel_data()
            .unwrap();
        assert_eq!(data.unique_id(), Some("abcd-1234"));
        assert_eq!(data.channel_name(), Some("sofia/internal/1000@example.com"));
        assert_eq!(data.header("Content-Type"), None);
        assert!(data.is_event_type(crate::event::EslEventType::ChannelData));
    }
}
