//! Incremental decoder for the `data: <json>\r\n` framed stream used by both
//! the completion and chat endpoints. Records can span arbitrary chunk
//! boundaries, so state is carried across calls to [`SseDecoder::feed`]
//! rather than requiring the whole body buffered up front.

use serde::Deserialize;

use crate::error::CopilotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    PreambleD,
    PreambleA1,
    PreambleT,
    PreambleA2,
    PreambleColon,
    Ws,
    Payload,
    Init,
}

/// One decoded record. Missing JSON fields default to null/false, matching
/// the original parser's semantics (a field is only set if its key was seen
/// with a matching scalar type).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub token: Option<String>,
    pub stop: bool,
    pub error: bool,
    pub cancel: bool,
}

#[derive(Deserialize, Default)]
struct RawRecord {
    token: Option<String>,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    cancel: bool,
}

/// Per-request finite automaton. Restartable only by constructing a new
/// instance — there is no `reset()`, matching `sse_init`/`sse_clean` being
/// paired with every request in the source.
pub struct SseDecoder {
    state: State,
    buffer: Vec<u8>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            state: State::PreambleD,
            buffer: Vec::new(),
        }
    }

    /// Feed an arbitrary byte chunk, invoking `on_event` once per completed
    /// record. A malformed preamble is a fatal parse error for the whole
    /// stream. A malformed JSON payload inside one record is non-fatal: that
    /// record is silently skipped and decoding continues.
    pub fn feed(
        &mut self,
        chunk: &[u8],
        mut on_event: impl FnMut(SseEvent),
    ) -> Result<(), CopilotError> {
        let mut i = 0;
        while i < chunk.len() {
            let byte = chunk[i];
            match self.state {
                State::PreambleD => {
                    if byte != b'd' {
                        return Err(CopilotError::SsePreamble(i));
                    }
                    self.state = State::PreambleA1;
                }
                State::PreambleA1 => {
                    if byte != b'a' {
                        return Err(CopilotError::SsePreamble(i));
                    }
                    self.state = State::PreambleT;
                }
                State::PreambleT => {
                    if byte != b't' {
                        return Err(CopilotError::SsePreamble(i));
                    }
                    self.state = State::PreambleA2;
                }
                State::PreambleA2 => {
                    if byte != b'a' {
                        return Err(CopilotError::SsePreamble(i));
                    }
                    self.state = State::PreambleColon;
                }
                State::PreambleColon => {
                    if byte != b':' {
                        return Err(CopilotError::SsePreamble(i));
                    }
                    self.state = State::Ws;
                }
                State::Ws => {
                    if byte == b' ' {
                        i += 1;
                        continue;
                    }
                    self.state = State::Payload;
                    continue; // re-examine this byte as PAYLOAD, don't consume
                }
                State::Payload => {
                    if byte != b'\r' && byte != b'\n' {
                        self.buffer.push(byte);
                        i += 1;
                        continue;
                    }
                    if let Some(event) = parse_record(&self.buffer) {
                        on_event(event);
                    }
                    self.buffer.clear();
                    self.state = State::Init;
                    continue; // re-examine terminator as INIT
                }
                State::Init => {
                    if byte != b'\r' && byte != b'\n' {
                        self.state = State::PreambleD;
                        continue; // re-examine this byte as PREAMBLE_D
                    }
                }
            }
            i += 1;
        }
        Ok(())
    }
}

fn parse_record(buffer: &[u8]) -> Option<SseEvent> {
    let text = std::str::from_utf8(buffer).ok()?;
    let raw: RawRecord = serde_json::from_str(text).ok()?;
    Some(SseEvent {
        token: raw.token,
        stop: raw.stop,
        error: raw.error,
        cancel: raw.cancel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&str]) -> Result<Vec<SseEvent>, CopilotError> {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            decoder.feed(chunk.as_bytes(), |e| events.push(e))?;
        }
        Ok(events)
    }

    #[test]
    fn single_record_in_one_chunk() {
        let events = decode_all(&["data: {\"token\":\"X\"}\r\n"]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token.as_deref(), Some("X"));
        assert!(!events[0].stop);
    }

    #[test]
    fn chunk_splitting_mid_record() {
        // Split across four arbitrary chunk boundaries, including
        // mid-preamble and mid-payload.
        let events = decode_all(&[
            "da",
            "ta: {\"tok",
            "en\":\"X\"}\r\ndata",
            ": {\"stop\":true}\r\n",
        ])
        .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].token.as_deref(), Some("X"));
        assert!(!events[0].stop);
        assert!(!events[0].error);
        assert!(!events[0].cancel);

        assert_eq!(events[1].token, None);
        assert!(events[1].stop);
        assert!(!events[1].error);
        assert!(!events[1].cancel);
    }

    #[test]
    fn byte_at_a_time_splitting() {
        let record = "data: {\"token\":\"hi\",\"stop\":false}\n";
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for byte in record.bytes() {
            decoder.feed(&[byte], |e| events.push(e)).unwrap();
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token.as_deref(), Some("hi"));
    }

    #[test]
    fn malformed_preamble_is_fatal() {
        let mut decoder = SseDecoder::new();
        let err = decoder.feed(b"nope: {}\r\n", |_| {}).unwrap_err();
        assert!(matches!(err, CopilotError::SsePreamble(_)));
    }

    #[test]
    fn malformed_json_record_is_skipped_not_fatal() {
        let events = decode_all(&[
            "data: {not json}\r\n",
            "data: {\"token\":\"ok\"}\r\n",
        ])
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token.as_deref(), Some("ok"));
    }

    #[test]
    fn multiple_records_back_to_back() {
        let events =
            decode_all(&["data: {\"token\":\"a\"}\r\ndata: {\"token\":\"b\"}\r\n"]).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].token.as_deref(), Some("a"));
        assert_eq!(events[1].token.as_deref(), Some("b"));
    }

    #[test]
    fn leading_whitespace_after_colon_is_skipped() {
        let events = decode_all(&["data:    {\"token\":\"x\"}\r\n"]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token.as_deref(), Some("x"));
    }

    #[test]
    fn cancel_and_error_flags_round_trip() {
        let events =
            decode_all(&["data: {\"error\":true}\r\ndata: {\"cancel\":true}\r\n"]).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].error);
        assert!(!events[0].cancel);
        assert!(events[1].cancel);
        assert!(!events[1].error);
    }

    #[test]
    fn decoder_restarts_after_init_on_new_preamble() {
        // Two records separated by a single \n (INIT -> PREAMBLE_D transition).
        let events = decode_all(&["data: {\"token\":\"1\"}\ndata: {\"token\":\"2\"}\n"]).unwrap();
        assert_eq!(events.len(), 2);
    }
}
