//! Server-Sent Events for streamed completions.
//!
//! - Each fragment is sent as `data: <text>`
//! - A failure is sent as `event: error` with the message as data
//! - Success ends with `data: [DONE]`

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::inference::StreamToken;

pub const DONE_MARKER: &str = "[DONE]";

/// SSE field values cannot carry carriage returns; fold them into newlines,
/// which axum splits into separate `data:` lines.
fn sse_data(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Map a worker event to its SSE frame.
pub fn to_event(token: &StreamToken) -> Event {
    match token {
        StreamToken::Token(text) => Event::default().data(sse_data(text)),
        StreamToken::Error(message) => Event::default().event("error").data(sse_data(message)),
        StreamToken::Done => Event::default().data(DONE_MARKER),
    }
}

/// Forward worker events to the client until the terminal event.
///
/// Dropping the response (client disconnect) drops the receiver; the worker
/// notices on its next send and finishes the request without a sink.
pub fn completion_stream(
    mut rx: UnboundedReceiver<StreamToken>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(token) = rx.recv().await {
            yield Ok(to_event(&token));
            if token.is_terminal() {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carriage_returns_are_folded() {
        assert_eq!(sse_data("a\r\nb\rc\nd"), "a\nb\nc\nd");
        assert_eq!(sse_data("plain"), "plain");
    }
}
