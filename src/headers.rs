//! Typed event header names.

wire_parse_error!(
    /// Error returned when parsing an unrecognized event header name.
    pub struct ParseEventHeaderError,
    "event header"
);

wire_enum! {
    error_type: ParseEventHeaderError,
    /// Header names the engine reads from switch events and replies.
    ///
    /// These are headers on the inner event (or on the `connect` reply in
    /// outbound mode), not framing headers like `Content-Type`. Use with
    /// [`EslEvent::header()`](crate::EslEvent::header) for type-safe lookups.
    pub enum EventHeader {
        EventName => "Event-Name",
        EventSubclass => "Event-Subclass",
        UniqueId => "Unique-ID",
        CallerUniqueId => "Caller-Unique-ID",
        JobUuid => "Job-UUID",
        JobCommand => "Job-Command",
        ChannelName => "Channel-Name",
        HangupCause => "Hangup-Cause",
        CallerCallerIdNumber => "Caller-Caller-ID-Number",
        CallerDestinationNumber => "Caller-Destination-Number",
        CoreUuid => "Core-UUID",
        SocketMode => "Socket-Mode",
        Control => "Control",
    }
}
