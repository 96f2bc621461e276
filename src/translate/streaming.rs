//! Re-framing an upstream event stream into unified SSE lines.
//!
//! The [`StreamTransformer`] consumes raw upstream bytes, splits them into
//! lines (keeping any partial line for the next read), lets the active adapter
//! turn each line into a unified chunk, and accumulates text and usage so the
//! request can be billed once the stream is over.
//!
//! Usage:
//!   let mut transformer = StreamTransformer::new(adapter, ChunkContext::new("gpt-4o"), prompt_estimate);
//!   for bytes in upstream {
//!       for line in transformer.push_bytes(&bytes) { /* send line */ }
//!   }
//!   for line in transformer.finish() { /* send line */ }
//!   let outcome = transformer.into_outcome();

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use tokio::sync::mpsc;

use super::openai_types::{ChatCompletionChunk, ChunkContext, Usage};
use super::{Adapter, ProviderAdapter};
use crate::tokens::estimate_text_tokens;

pub const DONE_LINE: &str = "data: [DONE]\n\n";

/// What a finished stream leaves behind for billing and logging.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub usage: Usage,
    pub text: String,
    /// Whether completion tokens had to be estimated locally.
    pub estimated: bool,
    pub error: Option<String>,
    pub client_disconnected: bool,
}

#[derive(Debug)]
pub struct StreamTransformer {
    adapter: Adapter,
    ctx: ChunkContext,
    buffer: Vec<u8>,
    text: String,
    prompt_tokens: u64,
    completion_tokens: u64,
    prompt_estimate: u64,
    done_sent: bool,
    error: Option<String>,
    client_disconnected: bool,
}

impl StreamTransformer {
    pub fn new(adapter: Adapter, ctx: ChunkContext, prompt_estimate: u64) -> Self {
        Self {
            adapter,
            ctx,
            buffer: Vec::new(),
            text: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            prompt_estimate,
            done_sent: false,
            error: None,
            client_disconnected: false,
        }
    }

    /// Feed raw upstream bytes; returns the SSE lines ready to forward.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(forward) = self.process_line(line.trim_end_matches(['\r', '\n'])) {
                out.push(forward);
            }
        }

        out
    }

    /// Flush the trailing partial line and emit the terminal marker if not yet sent.
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();

        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(forward) = self.process_line(line.trim_end_matches('\r')) {
                out.push(forward);
            }
        }

        if !self.done_sent {
            self.done_sent = true;
            out.push(DONE_LINE.to_string());
        }

        out
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn record_disconnect(&mut self) {
        self.client_disconnected = true;
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.trim().is_empty() || self.done_sent {
            return None;
        }

        match self.adapter.parse_stream_line(line, &self.ctx) {
            Some(chunk) => {
                self.accumulate(&chunk);
                match serde_json::to_string(&chunk) {
                    Ok(json) => Some(format!("data: {json}\n\n")),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize chunk");
                        None
                    }
                }
            }
            None if self.adapter.is_end_marker(line) => {
                self.done_sent = true;
                Some(DONE_LINE.to_string())
            }
            None => None,
        }
    }

    fn accumulate(&mut self, chunk: &ChatCompletionChunk) {
        for choice in &chunk.choices {
            if let Some(ref content) = choice.delta.content {
                self.text.push_str(content);
            }
        }
        if let Some(usage) = chunk.usage {
            if usage.prompt_tokens > 0 {
                self.prompt_tokens = usage.prompt_tokens;
            }
            if usage.completion_tokens > 0 {
                self.completion_tokens = usage.completion_tokens;
            }
        }
    }

    pub fn into_outcome(self) -> StreamOutcome {
        let prompt_tokens = if self.prompt_tokens > 0 {
            self.prompt_tokens
        } else {
            self.prompt_estimate
        };
        let estimated = self.completion_tokens == 0;
        let completion_tokens = if estimated {
            estimate_text_tokens(&self.text)
        } else {
            self.completion_tokens
        };

        StreamOutcome {
            usage: Usage::new(prompt_tokens, completion_tokens),
            text: self.text,
            estimated,
            error: self.error,
            client_disconnected: self.client_disconnected,
        }
    }
}

pub type SseSender = mpsc::Sender<Result<Bytes, Infallible>>;

/// Drive an upstream byte stream through the transformer into `tx`.
///
/// Returns once the upstream ends, errors, or the receiving side goes away.
/// The terminal marker is attempted in every case and the outcome always resolves.
pub async fn pump<S, E>(upstream: S, mut transformer: StreamTransformer, tx: SseSender) -> StreamOutcome
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: std::fmt::Display,
{
    tokio::pin!(upstream);

    'read: while let Some(next) = upstream.next().await {
        let bytes = match next {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "upstream stream error");
                transformer.record_error(format!("upstream stream error: {e}"));
                break;
            }
        };

        for line in transformer.push_bytes(&bytes) {
            if tx.send(Ok(Bytes::from(line))).await.is_err() {
                tracing::info!("client disconnected mid-stream");
                transformer.record_disconnect();
                break 'read;
            }
        }
    }

    for line in transformer.finish() {
        if tx.send(Ok(Bytes::from(line))).await.is_err() {
            transformer.record_disconnect();
            break;
        }
    }
    drop(tx);

    transformer.into_outcome()
}
