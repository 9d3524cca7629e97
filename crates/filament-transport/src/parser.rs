use bytes::BytesMut;

use filament_types::{Base, BaseId, Item};

use crate::error::WireError;

const LF: u8 = 0x0a;
const TAB: u8 = 0x09;

/// Serialized marker for documents whose payload is detached from the
/// object graph. Such frames carry nothing the loader can interpret, so
/// they decode to an id-only item rather than an error.
pub(crate) const DETACHED_PAYLOAD_MARKER: &[u8] = b"Objects.Other.RawEncoding";

/// Per-line decode outcome: a resolved (or id-only) item, or a per-item
/// failure that leaves the rest of the batch intact.
pub type LineOutcome = Result<Item, WireError>;

/// Incremental decoder for the streamed closure format.
///
/// Frames are `<baseId> TAB <json-document> LF`. Chunks arrive with no
/// alignment guarantees, so bytes after the last LF are carried over to
/// the next [`feed`] call. Frame ids must be UTF-8; a missing tab is a
/// protocol-level failure that aborts the batch.
///
/// [`feed`]: WireParser::feed
#[derive(Debug, Default)]
pub struct WireParser {
    leftover: BytesMut,
    lines: u64,
}

impl WireParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total completed lines seen so far.
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Consume one chunk, returning the outcome of every line it
    /// completed. Protocol-level failures (no tab, undecodable id) abort
    /// the whole feed; per-item failures ride in the outcome list.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<LineOutcome>, WireError> {
        self.leftover.extend_from_slice(chunk);

        let mut outcomes = Vec::new();
        while let Some(pos) = self.leftover.iter().position(|&b| b == LF) {
            let line = self.leftover.split_to(pos + 1);
            let line = &line[..pos]; // strip the LF
            if line.is_empty() {
                continue;
            }
            outcomes.push(decode_line(line)?);
            self.lines += 1;
        }
        // What remains after the last LF is a partial frame carried to the
        // next chunk.
        Ok(outcomes)
    }

    /// Signal end-of-stream. Trailing bytes mean the server truncated a
    /// frame.
    pub fn finish(&self) -> Result<(), WireError> {
        if !self.leftover.is_empty() {
            return Err(WireError::UnterminatedFrame {
                len: self.leftover.len(),
            });
        }
        Ok(())
    }
}

fn decode_line(line: &[u8]) -> Result<LineOutcome, WireError> {
    let tab = line
        .iter()
        .position(|&b| b == TAB)
        .ok_or_else(|| WireError::MalformedLine {
            preview: String::from_utf8_lossy(&line[..line.len().min(80)]).into_owned(),
        })?;

    let id = std::str::from_utf8(&line[..tab])
        .map_err(|e| WireError::InvalidId(e.to_string()))?;
    let id = BaseId::from(id);
    let json = &line[tab + 1..];

    if contains(json, DETACHED_PAYLOAD_MARKER) {
        return Ok(Ok(Item::pending(id)));
    }

    let value: serde_json::Value = match serde_json::from_slice(json) {
        Ok(value) => value,
        Err(e) => {
            return Ok(Err(WireError::InvalidItem {
                id,
                reason: e.to_string(),
            }))
        }
    };
    match Base::from_json(value) {
        Ok(base) => Ok(Ok(Item::resolved(base, Some(json.len() as u64)))),
        Err(e) => Ok(Err(WireError::InvalidItem {
            id,
            reason: e.to_string(),
        })),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
