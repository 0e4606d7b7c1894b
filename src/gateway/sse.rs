//! Streaming event demultiplexer.
//!
//! Parses a `text/event-stream` body into content deltas. Events are
//! separated by blank lines; each data payload is either the `[DONE]`
//! sentinel or a JSON document whose delta lives at
//! `choices[0].delta.content` (streaming) or `choices[0].text` (legacy).
//! Malformed JSON frames are skipped.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::Stream;
use pin_project_lite::pin_project;

/// One demultiplexed stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A content delta.
    Delta(String),
    /// The `[DONE]` sentinel; the stream terminates after this.
    Done,
}

pin_project! {
    /// Adapter from a raw byte stream to [`StreamEvent`]s.
    pub struct DeltaStream<S> {
        #[pin]
        byte_stream: S,
        buffer: String,
        pending: VecDeque<StreamEvent>,
        finished: bool,
    }
}

impl<S> DeltaStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    pub fn new(byte_stream: S) -> Self {
        Self {
            byte_stream,
            buffer: String::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

impl<S> Stream for DeltaStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    type Item = Result<StreamEvent, reqwest::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.finished {
            return Poll::Ready(None);
        }

        if let Some(event) = this.pending.pop_front() {
            if event == StreamEvent::Done {
                *this.finished = true;
            }
            return Poll::Ready(Some(Ok(event)));
        }

        loop {
            match this.byte_stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.push_str(&String::from_utf8_lossy(&chunk));

                    while let Some(pos) = this.buffer.find("\n\n") {
                        let block: String = this.buffer.drain(..pos).collect();
                        this.buffer.drain(..2);

                        if let Some(event) = parse_frame(&block) {
                            this.pending.push_back(event);
                        }
                    }

                    if let Some(event) = this.pending.pop_front() {
                        if event == StreamEvent::Done {
                            *this.finished = true;
                        }
                        return Poll::Ready(Some(Ok(event)));
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    // Flush any trailing frame without a closing blank line.
                    if !this.buffer.is_empty() {
                        if let Some(event) = parse_frame(this.buffer) {
                            this.pending.push_back(event);
                        }
                        this.buffer.clear();
                    }

                    return match this.pending.pop_front() {
                        Some(event) => {
                            if event == StreamEvent::Done {
                                *this.finished = true;
                            }
                            Poll::Ready(Some(Ok(event)))
                        }
                        None => {
                            *this.finished = true;
                            Poll::Ready(None)
                        }
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Parse one SSE frame into an event.
///
/// Returns `None` for comment-only frames, frames without a content delta,
/// and malformed JSON (skipped per the stream contract).
fn parse_frame(block: &str) -> Option<StreamEvent> {
    let mut data = String::new();
    for line in block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(StreamEvent::Done);
    }

    let parsed: serde_json::Value = match serde_json::from_str(&data) {
        Ok(v) => v,
        Err(_) => return None,
    };

    let delta = parsed["choices"][0]["delta"]["content"]
        .as_str()
        .or_else(|| parsed["choices"][0]["text"].as_str())
        .unwrap_or("");

    if delta.is_empty() {
        return None;
    }
    Some(StreamEvent::Delta(delta.to_string()))
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for demultiplexed content deltas.
pub trait DeltaSink: Send {
    fn write(&mut self, delta: &str);
}

impl<T: DeltaSink + ?Sized> DeltaSink for &mut T {
    fn write(&mut self, delta: &str) {
        (**self).write(delta);
    }
}

/// Forwards deltas to stdout, flushing per write so partial lines appear.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl DeltaSink for StdoutSink {
    fn write(&mut self, delta: &str) {
        use std::io::Write;
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(delta.as_bytes());
        let _ = out.flush();
    }
}

/// Captures deltas into a string without forwarding (silent variant).
#[derive(Debug, Default)]
pub struct CaptureSink {
    captured: String,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.captured
    }

    pub fn into_string(self) -> String {
        self.captured
    }
}

impl DeltaSink for CaptureSink {
    fn write(&mut self, delta: &str) {
        self.captured.push_str(delta);
    }
}

/// Captures deltas while forwarding them to an inner sink (buffered variant).
pub struct TeeSink<S: DeltaSink> {
    captured: String,
    inner: S,
}

impl<S: DeltaSink> TeeSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            captured: String::new(),
            inner,
        }
    }

    pub fn captured(&self) -> &str {
        &self.captured
    }

    pub fn into_captured(self) -> String {
        self.captured
    }
}

impl<S: DeltaSink> DeltaSink for TeeSink<S> {
    fn write(&mut self, delta: &str) {
        self.captured.push_str(delta);
        self.inner.write(delta);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};

    fn chunked(parts: Vec<&str>) -> impl Stream<Item = Result<Bytes, reqwest::Error>> {
        stream::iter(
            parts
                .into_iter()
                .map(|p| Ok(Bytes::from(p.to_string())))
                .collect::<Vec<_>>(),
        )
    }

    fn delta_frame(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    #[tokio::test]
    async fn test_two_deltas_then_done() {
        let body = format!("{}{}data: [DONE]\n\n", delta_frame("Hi "), delta_frame("there"));
        let mut s = DeltaStream::new(chunked(vec![body.as_str()]));

        assert_eq!(
            s.next().await.unwrap().unwrap(),
            StreamEvent::Delta("Hi ".into())
        );
        assert_eq!(
            s.next().await.unwrap().unwrap(),
            StreamEvent::Delta("there".into())
        );
        assert_eq!(s.next().await.unwrap().unwrap(), StreamEvent::Done);
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn test_frame_split_across_chunks() {
        let frame = delta_frame("hello");
        let (a, b) = frame.split_at(10);
        let mut s = DeltaStream::new(chunked(vec![a, b]));

        assert_eq!(
            s.next().await.unwrap().unwrap(),
            StreamEvent::Delta("hello".into())
        );
    }

    #[tokio::test]
    async fn test_malformed_json_is_skipped() {
        let body = format!("data: {{not json\n\n{}", delta_frame("ok"));
        let mut s = DeltaStream::new(chunked(vec![body.as_str()]));

        assert_eq!(
            s.next().await.unwrap().unwrap(),
            StreamEvent::Delta("ok".into())
        );
    }

    #[tokio::test]
    async fn test_legacy_text_field() {
        let body = format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"text": "legacy"}]})
        );
        let mut s = DeltaStream::new(chunked(vec![body.as_str()]));

        assert_eq!(
            s.next().await.unwrap().unwrap(),
            StreamEvent::Delta("legacy".into())
        );
    }

    #[tokio::test]
    async fn test_role_frame_without_content_is_skipped() {
        let body = format!(
            "data: {}\n\n{}",
            serde_json::json!({"choices": [{"delta": {"role": "assistant"}}]}),
            delta_frame("x")
        );
        let mut s = DeltaStream::new(chunked(vec![body.as_str()]));

        assert_eq!(
            s.next().await.unwrap().unwrap(),
            StreamEvent::Delta("x".into())
        );
    }

    #[tokio::test]
    async fn test_nothing_after_done() {
        let body = format!("data: [DONE]\n\n{}", delta_frame("late"));
        let mut s = DeltaStream::new(chunked(vec![body.as_str()]));

        assert_eq!(s.next().await.unwrap().unwrap(), StreamEvent::Done);
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_end_without_done() {
        let body = delta_frame("only");
        let mut s = DeltaStream::new(chunked(vec![body.as_str()]));

        assert_eq!(
            s.next().await.unwrap().unwrap(),
            StreamEvent::Delta("only".into())
        );
        assert!(s.next().await.is_none());
    }

    #[test]
    fn test_capture_sink() {
        let mut sink = CaptureSink::new();
        sink.write("a");
        sink.write("b");
        assert_eq!(sink.as_str(), "ab");
    }

    #[test]
    fn test_tee_sink_captures_and_forwards() {
        let mut inner = CaptureSink::new();
        {
            let mut tee = TeeSink::new(&mut inner);
            tee.write("x");
            tee.write("y");
            assert_eq!(tee.captured(), "xy");
        }
        assert_eq!(inner.as_str(), "xy");
    }
}
