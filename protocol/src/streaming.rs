//! Token streaming.
//!
//! A handler that streams hands back a [`TokenStream`]; the producer side is
//! a [`TokenSender`] that stops as soon as the stream is dropped (client gone
//! or deadline hit). [`batch_frames`] turns tokens into [`Frame`]s of at most
//! `batch_size` tokens, and [`FrameDecoder`] + [`StreamAssembler`] put the
//! text back together on the receiving side.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::envelope::Payload;
use crate::error::{ProtocolError, Result};
use crate::hashing;
use crate::priority::GatePermit;
use crate::types::Status;

/// Tokens per flush unless configured otherwise
pub const DEFAULT_BATCH_SIZE: usize = 4;

/// One flush on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub data: String,
    /// `true` on every frame except the terminal one
    pub more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailer: Option<Trailer>,
}

/// Outcome carried by the terminal frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trailer {
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub field_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub process_time: Option<f64>,
}

impl Frame {
    pub fn chunk(data: String) -> Self {
        Self {
            data,
            more: true,
            trailer: None,
        }
    }

    pub fn last(data: String, trailer: Trailer) -> Self {
        Self {
            data,
            more: false,
            trailer: Some(trailer),
        }
    }

    /// Newline-delimited JSON
    pub fn encode(&self) -> Bytes {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec());
        line.push(b'\n');
        line.into()
    }
}

enum Token {
    Text(String),
    Fault(String),
}

/// Producer half. Every `send` doubles as the cancellation check.
#[derive(Debug, Clone)]
pub struct TokenSender {
    tx: mpsc::Sender<Token>,
}

impl TokenSender {
    /// Queue one token; fails with `Cancelled` once the receiver is gone.
    pub async fn send(&self, token: impl Into<String>) -> Result<()> {
        self.tx
            .send(Token::Text(token.into()))
            .await
            .map_err(|_| ProtocolError::Cancelled)
    }

    /// End the stream with a server error instead of a clean finish.
    pub async fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(Token::Fault(reason.into())).await;
    }

    /// Resolves once the consumer has gone away
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Text(t) => f.debug_tuple("Text").field(t).finish(),
            Token::Fault(r) => f.debug_tuple("Fault").field(r).finish(),
        }
    }
}

/// Consumer half: an ordered, finite sequence of tokens.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<Token>,
}

impl TokenStream {
    pub fn channel(capacity: usize) -> (TokenSender, TokenStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (TokenSender { tx }, TokenStream { rx })
    }

    /// A stream over tokens that are already known
    pub fn from_tokens<I, T>(tokens: I) -> TokenStream
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        let (tx, rx) = mpsc::channel(tokens.len().max(1));
        for token in tokens {
            // capacity covers every token
            let _ = tx.try_send(Token::Text(token));
        }
        TokenStream { rx }
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

struct Batcher<P> {
    tokens: TokenStream,
    payload: P,
    batch_size: usize,
    deadline: tokio::time::Instant,
    started: Instant,
    done: bool,
    _permit: Option<GatePermit>,
}

impl<P: Payload> Batcher<P> {
    async fn next_frame(&mut self) -> Frame {
        let mut buf = String::new();
        let mut count = 0;
        loop {
            let next = tokio::time::timeout_at(self.deadline, self.tokens.rx.recv()).await;
            match next {
                Err(_) => {
                    return self.finish(buf, Status::Timeout, "deadline elapsed while streaming");
                }
                Ok(None) => return self.finish(buf, Status::Success, ""),
                Ok(Some(Token::Fault(reason))) => {
                    tracing::error!(kind = %P::NAME, %reason, "Stream producer failed");
                    return self.finish(buf, Status::ServerError, &reason);
                }
                Ok(Some(Token::Text(token))) => {
                    buf.push_str(&token);
                    count += 1;
                    if count >= self.batch_size {
                        self.payload.append_chunk(&buf);
                        return Frame::chunk(buf);
                    }
                }
            }
        }
    }

    fn finish(&mut self, rest: String, status: Status, message: &str) -> Frame {
        self.done = true;
        // Stops the producer at its next send
        self.tokens.close();
        self.payload.append_chunk(&rest);
        let field_hashes = if status.is_success() {
            hashing::hash_fields(&self.payload, self.payload.response_hash_fields())
        } else {
            BTreeMap::new()
        };
        Frame::last(
            rest,
            Trailer {
                status,
                message: message.to_string(),
                field_hashes,
                process_time: Some(self.started.elapsed().as_secs_f64()),
            },
        )
    }
}

/// Flush `tokens` in batches of `batch_size`, ending with one terminal frame
/// that carries the outcome and, on success, the hashes of the full output
/// accumulated into `payload`. The optional permit is held until the stream
/// is finished or dropped.
pub fn batch_frames<P: Payload>(
    tokens: TokenStream,
    payload: P,
    batch_size: usize,
    deadline: tokio::time::Instant,
    permit: Option<GatePermit>,
) -> BoxStream<'static, Frame> {
    let batcher = Batcher {
        tokens,
        payload,
        batch_size: batch_size.max(1),
        deadline,
        started: Instant::now(),
        done: false,
        _permit: permit,
    };
    stream::unfold(batcher, |mut batcher| async move {
        if batcher.done {
            return None;
        }
        let frame = batcher.next_frame().await;
        Some((frame, batcher))
    })
    .boxed()
}

/// Longest frame line a decoder buffers before giving up on the peer
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Splits a byte stream back into frames, whatever the chunking.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already searched for a newline
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            if end - start > MAX_FRAME_BYTES {
                return Err(oversized());
            }
            let line = &self.buf[start..end];
            if !line.iter().all(u8::is_ascii_whitespace) {
                frames.push(serde_json::from_slice(line)?);
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        if self.buf.len() > MAX_FRAME_BYTES {
            return Err(oversized());
        }
        Ok(frames)
    }

    /// Leftover bytes after the body ended mean a frame was cut off
    pub fn finish(&self) -> Result<()> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(ProtocolError::TransportFault("stream ended mid-frame".into()))
        }
    }
}

fn oversized() -> ProtocolError {
    ProtocolError::TransportFault(format!("frame exceeds {MAX_FRAME_BYTES} bytes"))
}

/// Receiving side: concatenates chunk text into the payload's output in
/// arrival order. Chunk boundaries carry no meaning.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    frames: usize,
    trailer: Option<Trailer>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one frame; returns `true` once the terminal frame was seen.
    pub fn apply<P: Payload>(&mut self, payload: &mut P, frame: Frame) -> Result<bool> {
        if self.is_finished() {
            return Err(ProtocolError::MalformedInput("frame after the terminal frame".into()));
        }
        self.frames += 1;
        payload.append_chunk(&frame.data);
        if !frame.more {
            self.trailer = Some(frame.trailer.unwrap_or(Trailer {
                status: Status::Success,
                message: String::new(),
                field_hashes: BTreeMap::new(),
                process_time: None,
            }));
        }
        Ok(self.is_finished())
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn is_finished(&self) -> bool {
        self.trailer.is_some()
    }

    pub fn trailer(&self) -> Option<&Trailer> {
        self.trailer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::StreamPrompting;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn payload() -> StreamPrompting {
        StreamPrompting::new(vec!["user".into()], vec!["spell it".into()]).unwrap()
    }

    fn far_deadline() -> tokio::time::Instant {
        tokio::time::Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_batches_of_four() {
        let tokens = TokenStream::from_tokens(["a", "b", "c", "d", "e"]);
        let frames: Vec<Frame> = batch_frames(tokens, payload(), 4, far_deadline(), None)
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "abcd");
        assert!(frames[0].more);
        assert_eq!(frames[1].data, "e");
        assert!(!frames[1].more);

        let trailer = frames[1].trailer.clone().unwrap();
        assert_eq!(trailer.status, Status::Success);

        let mut received = payload();
        let mut assembler = StreamAssembler::new();
        for frame in frames {
            assembler.apply(&mut received, frame).unwrap();
        }
        assert!(assembler.is_finished());
        assert_eq!(received.completion, "abcde");
        assert!(hashing::verify(&received, &["completion"], &trailer.field_hashes));
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_final() {
        let tokens = TokenStream::from_tokens(["a", "b", "c", "d"]);
        let frames: Vec<Frame> = batch_frames(tokens, payload(), 4, far_deadline(), None)
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].data, "");
        assert!(!frames[1].more);
    }

    #[tokio::test]
    async fn test_deadline_stops_producer() {
        let (tx, tokens) = TokenStream::channel(1);
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = sent.clone();
        let producer = tokio::spawn(async move {
            for i in 0.. {
                if tx.send(format!("t{i} ")).await.is_err() {
                    break;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let deadline = tokio::time::Instant::now() + Duration::from_millis(150);
        let frames: Vec<Frame> = batch_frames(tokens, payload(), 4, deadline, None)
            .collect()
            .await;

        let last = frames.last().unwrap();
        assert!(!last.more);
        assert_eq!(last.trailer.as_ref().unwrap().status, Status::Timeout);

        // Producer notices the closed channel and exits
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should stop")
            .unwrap();
        let before = sent.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sent.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_dropped_stream_cancels_producer() {
        let (tx, tokens) = TokenStream::channel(1);
        let frames = batch_frames(tokens, payload(), 2, far_deadline(), None);
        drop(frames);
        assert!(tx.is_closed());
        assert!(matches!(tx.send("x").await, Err(ProtocolError::Cancelled)));
    }

    #[tokio::test]
    async fn test_fault_ends_with_server_error() {
        let (tx, tokens) = TokenStream::channel(8);
        tx.send("partial ").await.unwrap();
        tx.fail("model crashed").await;

        let frames: Vec<Frame> = batch_frames(tokens, payload(), 4, far_deadline(), None)
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "partial ");
        let trailer = frames[0].trailer.as_ref().unwrap();
        assert_eq!(trailer.status, Status::ServerError);
        assert_eq!(trailer.message, "model crashed");
        assert!(trailer.field_hashes.is_empty());
    }

    #[test]
    fn test_decoder_handles_split_lines() {
        let a = Frame::chunk("hel".into()).encode();
        let b = Frame::last(
            "lo".into(),
            Trailer {
                status: Status::Success,
                message: String::new(),
                field_hashes: BTreeMap::new(),
                process_time: None,
            },
        )
        .encode();
        let mut wire = a.to_vec();
        wire.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for piece in wire.chunks(3) {
            frames.extend(decoder.push(piece).unwrap());
        }
        decoder.finish().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "hel");
        assert!(!frames[1].more);
    }

    #[test]
    fn test_decoder_rejects_truncated_and_garbage() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"{\"data\":\"x\"").unwrap().is_empty());
        assert!(decoder.finish().is_err());

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"not json\n").is_err());
    }

    #[test]
    fn test_decoder_caps_frame_size() {
        let mut decoder = FrameDecoder::new();
        let half = vec![b'x'; MAX_FRAME_BYTES / 2 + 1];
        assert!(decoder.push(&half).unwrap().is_empty());
        assert!(matches!(
            decoder.push(&half),
            Err(ProtocolError::TransportFault(msg)) if msg.contains("exceeds")
        ));

        let mut decoder = FrameDecoder::new();
        let mut line = vec![b' '; MAX_FRAME_BYTES + 1];
        line.push(b'\n');
        assert!(decoder.push(&line).is_err());

        // Many small frames in one push stay well under the cap
        let mut decoder = FrameDecoder::new();
        let mut wire = Vec::new();
        for _ in 0..1000 {
            wire.extend_from_slice(&Frame::chunk("tok".into()).encode());
        }
        assert_eq!(decoder.push(&wire).unwrap().len(), 1000);
        decoder.finish().unwrap();
    }

    #[test]
    fn test_assembler_rejects_frames_after_final() {
        let mut received = payload();
        let mut assembler = StreamAssembler::new();
        assembler.apply(&mut received, Frame::chunk("a".into())).unwrap();
        let done = assembler
            .apply(
                &mut received,
                Frame {
                    data: "b".into(),
                    more: false,
                    trailer: None,
                },
            )
            .unwrap();
        assert!(done);
        assert!(assembler.apply(&mut received, Frame::chunk("c".into())).is_err());
        assert_eq!(received.completion, "ab");
        assert_eq!(assembler.frames(), 2);
    }
}
