//! Server-Sent Events (SSE) processing for streaming responses.
//!
//! `streamGenerateContent?alt=sse` answers with events of the form
//! `data: <GenerateContentResponse JSON>` separated by blank lines.  This module turns the raw
//! byte stream into a stream of parsed chunks.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use crate::client::{ErrorDetail, error_for_status};
use crate::observability::{STREAM_BYTES, STREAM_ERRORS, STREAM_EVENTS};
use crate::{Error, GenerateContentResponse, Result};

/// Process a stream of bytes into a stream of response chunks.
///
/// Carriage returns are dropped on the way in, so CRLF and LF framing are treated alike.
/// Multi-byte characters split across network chunks are reassembled before decoding.
pub fn process_sse<S>(byte_stream: S) -> impl Stream<Item = Result<GenerateContentResponse>>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin + Send + 'static,
{
    // Convert reqwest errors to our error type
    let stream = byte_stream.map(|result| {
        result
            .map_err(|e| Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e))))
    });

    let state = SseState {
        buffer: String::new(),
        undecoded: Vec::new(),
        finished: false,
    };

    stream::unfold((stream, state), move |(mut stream, mut state)| async move {
        if state.finished {
            return None;
        }
        loop {
            // First check if we have a complete event in the buffer
            if let Some(event_text) = take_event(&mut state.buffer) {
                match parse_event(&event_text) {
                    Some(item) => {
                        record(&item);
                        return Some((item, (stream, state)));
                    }
                    None => continue,
                }
            }

            // Read more data
            match stream.next().await {
                Some(Ok(bytes)) => {
                    STREAM_BYTES.count(bytes.len() as u64);
                    if let Err(e) = state.decode(&bytes) {
                        STREAM_ERRORS.click();
                        state.finished = true;
                        return Some((Err(e), (stream, state)));
                    }
                }
                Some(Err(e)) => {
                    STREAM_ERRORS.click();
                    state.finished = true;
                    return Some((Err(e), (stream, state)));
                }
                None => {
                    // End of stream; a final event may lack its blank-line terminator.
                    state.finished = true;
                    if !state.undecoded.is_empty() {
                        STREAM_ERRORS.click();
                        return Some((
                            Err(Error::encoding("stream ended inside a UTF-8 sequence", None)),
                            (stream, state),
                        ));
                    }
                    let rest = std::mem::take(&mut state.buffer);
                    if let Some(item) = parse_event(&rest) {
                        record(&item);
                        return Some((item, (stream, state)));
                    }
                    return None;
                }
            }
        }
    })
}

struct SseState {
    buffer: String,
    undecoded: Vec<u8>,
    finished: bool,
}

impl SseState {
    fn decode(&mut self, bytes: &[u8]) -> Result<()> {
        self.undecoded.extend_from_slice(bytes);
        let valid_up_to = match std::str::from_utf8(&self.undecoded) {
            Ok(text) => text.len(),
            // An incomplete sequence at the end waits for the next chunk.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => {
                return Err(Error::encoding(
                    format!("Invalid UTF-8 in stream: {e}"),
                    Some(Box::new(e)),
                ));
            }
        };
        let tail = self.undecoded.split_off(valid_up_to);
        let text = std::str::from_utf8(&self.undecoded)?;
        self.buffer.extend(text.chars().filter(|c| *c != '\r'));
        self.undecoded = tail;
        Ok(())
    }
}

fn record(item: &Result<GenerateContentResponse>) {
    match item {
        Ok(_) => STREAM_EVENTS.click(),
        Err(_) => STREAM_ERRORS.click(),
    }
}

/// Remove and return the first complete event in `buffer`.
fn take_event(buffer: &mut String) -> Option<String> {
    let end = buffer.find("\n\n")?;
    let rest = buffer.split_off(end + 2);
    let mut event = std::mem::replace(buffer, rest);
    event.truncate(end);
    Some(event)
}

/// Payloads are either a response chunk or an error envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum EventPayload {
    Error { error: ErrorDetail },
    Chunk(GenerateContentResponse),
}

/// Parse one event block.  Returns `None` for blocks without data (comments, keep-alives).
fn parse_event(event_text: &str) -> Option<Result<GenerateContentResponse>> {
    let data: Vec<&str> = event_text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    if data.is_empty() {
        return None;
    }
    let data = data.join("\n");
    if data.trim().is_empty() {
        return None;
    }

    match serde_json::from_str::<EventPayload>(&data) {
        Ok(EventPayload::Chunk(chunk)) => {
            if let Some(reason) = chunk.block_reason() {
                return Some(Err(Error::blocked(reason)));
            }
            Some(Ok(chunk))
        }
        Ok(EventPayload::Error { error }) => {
            let status_code = error.code.unwrap_or(500);
            Some(Err(error_for_status(status_code, error, None)))
        }
        Err(e) => Some(Err(Error::serialization(
            format!("Failed to parse event JSON: {e}"),
            Some(Box::new(e)),
        ))),
    }
}
