//! Bounded, throttled reader for tags embedded in audio tracks served by an
//! Emby/Jellyfin media server.
//!
//! Callers ask a [`TagQueue`] for a track's tags; the queue fetches the head of
//! the audio stream, parses the ID3 tag, and hands back lyrics, cover art,
//! genre and year. At most `max_concurrent` reads run at once and at most
//! [`queue::MAX_BACKLOG`] wait behind them.

pub mod cache;
pub mod config;
pub mod error;
pub mod genre;
pub mod parser;
pub mod queue;
pub mod source;

pub use cache::{Cache, MemoryCache};
pub use config::Config;
pub use error::{ConfigError, FetchError, ParseError, ReadError};
pub use genre::normalize_genre;
pub use parser::{Id3Parser, RawTags, TagParser};
pub use queue::{QueueConfig, QueueStats, TagQueue, TagResult};
pub use source::{AudioSource, AuthToken, EmbySource, FetchRange};
