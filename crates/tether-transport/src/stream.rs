//! Async stream that turns an HTTP body into SSE events.

use crate::sse::{SseEvent, SseParser};
use futures_core::Stream;
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tether_types::TransportError;

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

pin_project! {
    /// A stream of [`SseEvent`]s decoded from a reqwest byte stream.
    pub struct SseStream {
        #[pin]
        inner: ByteStream,
        parser: SseParser,
        queued: VecDeque<SseEvent>,
        // Trailing bytes of a UTF-8 sequence split across chunks.
        carry: Vec<u8>,
    }
}

impl SseStream {
    pub fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: SseParser::new(),
            queued: VecDeque::new(),
            carry: Vec::new(),
        }
    }

    pub fn from_response(response: reqwest::Response) -> Self {
        Self::new(response.bytes_stream())
    }
}

impl Stream for SseStream {
    type Item = Result<SseEvent, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.queued.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.carry.extend_from_slice(&bytes);
                    let text = take_utf8(this.carry);
                    this.queued.extend(this.parser.feed(&text));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(TransportError::Http(e.to_string()))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Drain the longest valid UTF-8 prefix from `buf`, leaving an incomplete
/// trailing sequence behind. Invalid bytes are replaced.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    let keep = match std::str::from_utf8(buf) {
        Ok(_) => 0,
        Err(e) if e.error_len().is_none() => buf.len() - e.valid_up_to(),
        Err(_) => 0,
    };
    let tail = buf.split_off(buf.len() - keep);
    let text = String::from_utf8_lossy(buf).into_owned();
    *buf = tail;
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn chunks(parts: Vec<&'static [u8]>) -> SseStream {
        let items: Vec<Result<bytes::Bytes, reqwest::Error>> = parts
            .into_iter()
            .map(|p| Ok(bytes::Bytes::from_static(p)))
            .collect();
        SseStream::new(futures_util::stream::iter(items))
    }

    #[tokio::test]
    async fn yields_every_event_in_a_chunk() {
        let mut stream = chunks(vec![b"data: a\n\ndata: b\n\n"]);
        assert_eq!(stream.next().await.unwrap().unwrap().data, "a");
        assert_eq!(stream.next().await.unwrap().unwrap().data, "b");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn multibyte_char_split_across_chunks() {
        // "é" is 0xC3 0xA9.
        let mut stream = chunks(vec![b"data: caf\xC3", b"\xA9\n\n"]);
        assert_eq!(stream.next().await.unwrap().unwrap().data, "café");
    }

    #[test]
    fn take_utf8_keeps_incomplete_tail() {
        let mut buf = b"ab\xE2\x82".to_vec();
        assert_eq!(take_utf8(&mut buf), "ab");
        assert_eq!(buf, b"\xE2\x82");
        buf.push(0xAC);
        assert_eq!(take_utf8(&mut buf), "€");
        assert!(buf.is_empty());
    }
}
