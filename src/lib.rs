//! FreeSWITCH Event Socket (ESL) engine for Rust
//!
//! Async building blocks for telephony applications that talk to FreeSWITCH
//! over its event socket: a frame codec, an event model, a connection core
//! with command/reply correlation and background-job tracking, an outbound
//! session server, and a media/grammar cache resolver.
//!
//! # Architecture
//!
//! Each connection uses a split reader/writer design:
//! - [`EslClient`] (Clone + Send): send commands from any task, one at a time
//! - a background reader task that routes replies, job results and events
//! - a dispatcher task that runs registered handlers, so slow handlers never
//!   stall frame reads
//! - [`EslEventStream`]: events no handler claimed
//!
//! # Examples
//!
//! ## Inbound Connection
//!
//! ```rust,no_run
//! use esl_bridge::{EslClient, EslError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let (client, _events) = EslClient::connect("localhost", 8021, "ClueCon").await?;
//!
//!     let response = client.api("status").await?;
//!     println!("Status: {}", response.body().unwrap_or("No body"));
//!
//!     let job = client.execute_background("originate user/1000 &park").await?;
//!     let result = client.await_background_job(&job, None).await?;
//!     println!("Job {} finished: {}", job, result.body().unwrap_or(""));
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Outbound Mode
//!
//! FreeSWITCH connects to *your* application via the `socket` dialplan
//! application, one connection per call:
//!
//! ```rust,no_run
//! use esl_bridge::{serve, EslError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     serve("0.0.0.0:8084", |client, _events| async move {
//!         let caller = client
//!             .channel_data()
//!             .and_then(|c| c.caller_id_number())
//!             .unwrap_or("unknown")
//!             .to_string();
//!         client.register_handler("CHANNEL_HANGUP", move |_| println!("{} hung up", caller));
//!         client.execute_app("answer", None, None).await?;
//!         client.execute_app("playback", Some("ivr/ivr-welcome.wav"), None).await?;
//!         Ok::<_, EslError>(())
//!     })
//!     .await
//! }
//! ```
//!
//! ## Event Subscription
//!
//! ```rust,no_run
//! use esl_bridge::{EslClient, EslEventType, EventFormat};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (client, mut events) = EslClient::connect("localhost", 8021, "ClueCon").await?;
//!
//!     client.subscribe_events(EventFormat::Plain, &[
//!         EslEventType::ChannelAnswer,
//!         EslEventType::ChannelHangup
//!     ]).await?;
//!
//!     while let Some(Ok(event)) = events.recv().await {
//!         println!("Received event: {:?}", event.event_type());
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Media Resolution
//!
//! ```rust,no_run
//! use esl_bridge::{CacheConfig, ResourceResolver};
//!
//! # async fn example() -> Result<(), esl_bridge::EslError> {
//! let resolver = ResourceResolver::new(Some(CacheConfig::new(
//!     "http://127.0.0.1:8089/",
//!     "/usr/local/bin/cache_stream.sh",
//! )))?;
//! let media = resolver.resolve_media("http://example.com/hello.mp3").await;
//! println!("play {}", media.resolved);
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod macros;

pub mod cache;
pub mod connection;
pub mod error;
pub mod event;
pub mod headers;
pub mod server;

pub(crate) mod buffer;
pub(crate) mod command;
pub mod constants;
pub(crate) mod dispatch;
pub(crate) mod job;
pub(crate) mod protocol;

pub use cache::{
    is_remote_url, is_sip_url, is_valid_sound_proto, resolve_grammar, resolve_media, CacheConfig,
    CacheKind, CacheLookupResult, GrammarResource, ResourceResolver,
};
pub use command::{encode_command, CommandBuilder, EslCommand, EslResponse, ReplyStatus};
pub use connection::{
    ConnectionState, DisconnectReason, EslClient, EslConnectOptions, EslEventStream,
    EventSubscription, SessionMode,
};
pub use constants::{DEFAULT_ESL_PORT, DEFAULT_OUTBOUND_PORT};
pub use dispatch::EventHandler;
pub use error::{EslError, EslResult};
pub use event::{EslEvent, EslEventType, EventFormat};
pub use headers::EventHeader;
pub use protocol::{parse_event_body, ContentType, EslMessage, EslParser};
pub use server::{serve, OutboundServer, OutboundServerOptions};
