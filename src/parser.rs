//! Tag-parser adapter.
//!
//! Parsers report through a pair of callbacks, the way most tag libraries do.
//! [`read_tags`] turns that into a future with a bail-out timer; a callback
//! that fires after the timer (or a second callback) is swallowed by
//! [`Settle`].

use std::io::{Cursor, ErrorKind as IoErrorKind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use id3::frame::{Content, PictureType, TimestampFormat};
use id3::{Tag, TagLike};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ParseError, ReadError};

const ID3_HEADER_LEN: usize = 10;
const ID3_FOOTER_LEN: usize = 10;
const FOOTER_FLAG: u8 = 0x10;

/// Embedded cover image as found in the tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmbeddedPicture {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl EmbeddedPicture {
    pub fn to_data_uri(&self) -> String {
        let mime = match self.mime_type.to_ascii_uppercase().as_str() {
            "" | "JPG" | "JPEG" => "image/jpeg".to_string(),
            "PNG" => "image/png".to_string(),
            _ => self.mime_type.clone(),
        };
        format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(&self.data)
        )
    }
}

/// Fields pulled out of a tag, before normalization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawTags {
    pub lyrics: Option<String>,
    pub picture: Option<EmbeddedPicture>,
    pub genre: Option<String>,
    pub year: Option<String>,
}

pub struct Callbacks {
    pub on_success: Box<dyn FnOnce(RawTags) + Send>,
    pub on_error: Box<dyn FnOnce(ParseError) + Send>,
}

/// Callback-style tag reader.
///
/// Implementations should invoke exactly one of the callbacks, but callers
/// must not rely on it: late, duplicate and missing calls are all tolerated.
pub trait TagParser: Send + Sync {
    fn read(&self, data: Bytes, callbacks: Callbacks);
}

/// Fire-once resolver. Clones share the same slot; the first `settle` wins.
pub struct Settle<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Settle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Settle<T> {
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Returns `false` if something already settled, or nobody is listening.
    pub fn settle(&self, value: T) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

/// Runs `parser` over `data`, giving up after `limit`.
pub async fn read_tags(
    parser: &dyn TagParser,
    data: Bytes,
    limit: Duration,
) -> Result<RawTags, ReadError> {
    let (settle, rx) = Settle::channel();
    let on_error = settle.clone();
    let callbacks = Callbacks {
        on_success: Box::new(move |tags| {
            if !settle.settle(Ok(tags)) {
                debug!("discarding late parser success");
            }
        }),
        on_error: Box::new(move |err| {
            if !on_error.settle(Err(err)) {
                debug!("discarding late parser error");
            }
        }),
    };
    parser.read(data, callbacks);

    match tokio::time::timeout(limit, rx).await {
        Ok(Ok(result)) => result.map_err(ReadError::from),
        Ok(Err(_)) => Err(ParseError::Abandoned.into()),
        Err(_) => Err(ReadError::ParseTimeout(limit)),
    }
}

/// ID3v2 reader backed by the `id3` crate. Parsing runs on the blocking pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct Id3Parser;

impl Id3Parser {
    pub fn new() -> Self {
        Self
    }
}

impl TagParser for Id3Parser {
    fn read(&self, data: Bytes, callbacks: Callbacks) {
        tokio::task::spawn_blocking(move || match parse_id3(&data) {
            Ok(tags) => (callbacks.on_success)(tags),
            Err(err) => (callbacks.on_error)(err),
        });
    }
}

/// Parses the ID3v2 tag at the start of `data`.
///
/// Reports [`ParseError::Truncated`] when the header declares a tag longer
/// than what was loaded.
pub fn parse_id3(data: &[u8]) -> Result<RawTags, ParseError> {
    let needed = declared_tag_len(data)?;
    if needed > data.len() {
        return Err(ParseError::Truncated {
            needed,
            available: data.len(),
        });
    }

    let tag = Tag::read_from2(Cursor::new(data)).map_err(|err| match err.kind {
        id3::ErrorKind::NoTag => ParseError::NoTag,
        id3::ErrorKind::Io(ref io) if io.kind() == IoErrorKind::UnexpectedEof => {
            ParseError::Truncated {
                needed,
                available: data.len(),
            }
        }
        _ => ParseError::Malformed(err.to_string()),
    })?;

    Ok(extract(&tag))
}

fn declared_tag_len(data: &[u8]) -> Result<usize, ParseError> {
    if data.len() < ID3_HEADER_LEN {
        let probe = &data[..data.len().min(3)];
        if !probe.is_empty() && b"ID3".starts_with(probe) {
            return Err(ParseError::Truncated {
                needed: ID3_HEADER_LEN,
                available: data.len(),
            });
        }
        return Err(ParseError::NoTag);
    }
    if &data[..3] != b"ID3" {
        return Err(ParseError::NoTag);
    }

    let mut size = 0usize;
    for &byte in &data[6..10] {
        if byte & 0x80 != 0 {
            return Err(ParseError::Malformed("size is not syncsafe".to_string()));
        }
        size = (size << 7) | byte as usize;
    }

    let footer = if data[5] & FOOTER_FLAG != 0 {
        ID3_FOOTER_LEN
    } else {
        0
    };
    Ok(ID3_HEADER_LEN + size + footer)
}

fn extract(tag: &Tag) -> RawTags {
    RawTags {
        lyrics: lyrics(tag),
        picture: picture(tag),
        genre: tag.genre_parsed().map(|g| g.replace('\0', ";")),
        year: text_frame(tag, "TYER").or_else(|| text_frame(tag, "TDRC")),
    }
}

// USLT first, then the free-form fields some taggers use, then SYLT.
fn lyrics(tag: &Tag) -> Option<String> {
    if let Some(text) = tag
        .lyrics()
        .map(|l| l.text.trim())
        .find(|t| !t.is_empty())
    {
        return Some(text.to_string());
    }

    if let Some(value) = tag
        .extended_texts()
        .find(|t| {
            t.description.eq_ignore_ascii_case("LYRICS")
                || t.description.eq_ignore_ascii_case("UNSYNCEDLYRICS")
        })
        .map(|t| t.value.trim())
        .filter(|v| !v.is_empty())
    {
        return Some(value.to_string());
    }

    let synced = tag
        .synchronised_lyrics()
        .find(|s| s.timestamp_format == TimestampFormat::Ms && !s.content.is_empty())?;
    let lines: Vec<String> = synced
        .content
        .iter()
        .map(|(ms, line)| format!("{}{}", timestamp(*ms), line))
        .collect();
    Some(lines.join("\n"))
}

fn timestamp(ms: u32) -> String {
    let minutes = ms / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let hundredths = (ms % 1000) / 10;
    format!("[{:02}:{:02}.{:02}]", minutes, seconds, hundredths)
}

fn picture(tag: &Tag) -> Option<EmbeddedPicture> {
    let pic = tag
        .pictures()
        .find(|p| p.picture_type == PictureType::CoverFront)
        .or_else(|| tag.pictures().next())?;
    if pic.data.is_empty() {
        return None;
    }
    Some(EmbeddedPicture {
        mime_type: pic.mime_type.clone(),
        data: pic.data.clone(),
    })
}

fn text_frame(tag: &Tag, id: &str) -> Option<String> {
    match tag.get(id)?.content() {
        Content::Text(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
