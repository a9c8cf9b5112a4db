use std::pin::Pin;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};

use crate::error::ProviderError;

const SSE_DELIMITER: &str = "\n\n";

/// Split a streaming HTTP body into server-sent events and decode each one
/// with `parser`. Events for which the parser returns `Ok(None)` are skipped.
pub(crate) fn create_sse_stream<T, F>(
    response: reqwest::Response,
    parser: F,
) -> Pin<Box<dyn Stream<Item = Result<T, ProviderError>> + Send>>
where
    T: Send + 'static,
    F: Fn(&str) -> Result<Option<T>, ProviderError> + Send + 'static,
{
    let stream = response
        .bytes_stream()
        .scan(SseState::default(), move |state, chunk| {
            let results = handle_chunk(state, chunk, &parser);
            async move { Some(results) }
        })
        .flat_map(futures::stream::iter);

    Box::pin(stream)
}

#[derive(Default)]
struct SseState {
    buffer: String,
    utf8_buffer: Vec<u8>,
}

fn handle_chunk<T, F>(
    state: &mut SseState,
    chunk: Result<Bytes, reqwest::Error>,
    parser: &F,
) -> Vec<Result<T, ProviderError>>
where
    F: Fn(&str) -> Result<Option<T>, ProviderError>,
{
    let bytes = match chunk {
        Ok(bytes) => bytes,
        Err(err) => return vec![Err(ProviderError::HttpError(err.to_string()))],
    };

    state.push_bytes(&bytes);
    state.drain_events(parser)
}

impl SseState {
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.utf8_buffer.extend_from_slice(bytes);
        match std::str::from_utf8(&self.utf8_buffer) {
            Ok(text) => {
                self.buffer.push_str(text);
                self.utf8_buffer.clear();
            }
            Err(err) => self.consume_valid_prefix(err.valid_up_to()),
        }
    }

    fn consume_valid_prefix(&mut self, valid_up_to: usize) {
        if valid_up_to == 0 {
            return;
        }

        let valid = String::from_utf8_lossy(&self.utf8_buffer[..valid_up_to]);
        self.buffer.push_str(&valid);
        self.utf8_buffer.drain(..valid_up_to);
    }

    fn drain_events<T, F>(&mut self, parser: &F) -> Vec<Result<T, ProviderError>>
    where
        F: Fn(&str) -> Result<Option<T>, ProviderError>,
    {
        let mut results = Vec::new();
        while let Some(event) = self.next_event() {
            match parser(&event) {
                Ok(Some(item)) => results.push(Ok(item)),
                Ok(None) => {}
                Err(err) => results.push(Err(err)),
            }
        }
        results
    }

    fn next_event(&mut self) -> Option<String> {
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
        let pos = self.buffer.find(SSE_DELIMITER)?;
        let end = pos + SSE_DELIMITER.len();
        let event = self.buffer[..end].to_string();
        self.buffer.drain(..end);
        Some(event)
    }
}

#[cfg(test)]
#[path = "sse_tests.rs"]
mod tests;
