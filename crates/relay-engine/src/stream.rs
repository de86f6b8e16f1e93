use std::future::Future;
use std::sync::Arc;

use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::StreamExt;
use tracing::debug;

use relay_core::error::{RelayError, Result};
use relay_core::types::{ByteStream, Chunk, ChunkMeta, Output, Response, ResponseBody};

/// Called for every chunk as it arrives, and once more with the whole
/// accumulated buffer when accumulation is on.
pub type ChunkHandler = Arc<dyn Fn(Chunk, ChunkMeta) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Text encodings the processor can decode chunks into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
}

impl std::str::FromStr for TextEncoding {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            other => Err(RelayError::Config(format!("unsupported text encoding: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// One handler call per transport chunk.
    #[default]
    Chunks,
    /// One handler call per non-empty line. The accumulated result is the
    /// lines joined by `\n`.
    Lines,
}

/// How a streamed response body is consumed.
#[derive(Clone)]
pub struct StreamPolicy {
    pub enabled: bool,
    pub encoding: Option<TextEncoding>,
    pub accumulate: bool,
    /// Replay the accumulated buffer as a final `is_last` chunk.
    pub flush_accumulated: bool,
    pub mode: StreamMode,
    handler: Option<ChunkHandler>,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            encoding: None,
            accumulate: false,
            flush_accumulated: true,
            mode: StreamMode::Chunks,
            handler: None,
        }
    }
}

impl std::fmt::Debug for StreamPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPolicy")
            .field("enabled", &self.enabled)
            .field("encoding", &self.encoding)
            .field("accumulate", &self.accumulate)
            .field("flush_accumulated", &self.flush_accumulated)
            .field("mode", &self.mode)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl StreamPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[stream]` config section.
    pub fn from_config(config: &relay_core::config::StreamConfig) -> Result<Self> {
        let encoding = config
            .encoding
            .as_deref()
            .map(str::parse::<TextEncoding>)
            .transpose()?;
        Ok(Self {
            encoding,
            accumulate: config.accumulate,
            mode: if config.lines {
                StreamMode::Lines
            } else {
                StreamMode::Chunks
            },
            ..Self::default()
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn on_chunk<F>(self, f: F) -> Self
    where
        F: Fn(Chunk, ChunkMeta) + Send + Sync + 'static,
    {
        self.on_chunk_async(move |chunk, meta| {
            f(chunk, meta);
            async { Ok(()) }
        })
    }

    pub fn on_chunk_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Chunk, ChunkMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |chunk, meta| Box::pin(f(chunk, meta))));
        self
    }

    pub fn accumulate(mut self, on: bool) -> Self {
        self.accumulate = on;
        self
    }

    pub fn encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Decode chunks as UTF-8 text.
    pub fn text(self) -> Self {
        self.encoding(TextEncoding::Utf8)
    }

    pub fn lines(mut self) -> Self {
        self.mode = StreamMode::Lines;
        self
    }

    pub fn flush_accumulated(mut self, on: bool) -> Self {
        self.flush_accumulated = on;
        self
    }

    async fn emit(&self, chunk: Chunk, meta: ChunkMeta) -> Result<()> {
        match &self.handler {
            Some(handler) => handler(chunk, meta).await,
            None => Ok(()),
        }
    }
}

/// Outcome of running a transport response through a stream policy.
#[derive(Debug)]
pub enum Processed {
    /// The accumulated body, used as the stage's raw result.
    Accumulated(Output),
    /// The response to narrow through the adapter. Its body is
    /// `Consumed` if the stream was read.
    Response(Response),
}

/// Consume `stream` chunk by chunk according to `policy`.
///
/// Returns the accumulated body when accumulation is on.
pub async fn process(stream: ByteStream, policy: &StreamPolicy) -> Result<Option<Output>> {
    match policy.mode {
        StreamMode::Chunks => process_chunks(stream, policy).await,
        StreamMode::Lines => process_lines(stream, policy).await,
    }
}

/// Apply `policy` to a transport response.
///
/// Responses without a stream body, or a disabled policy, pass through
/// untouched.
pub async fn process_response(mut response: Response, policy: &StreamPolicy) -> Result<Processed> {
    if !policy.enabled || !response.is_stream() {
        return Ok(Processed::Response(response));
    }
    let body = std::mem::replace(&mut response.body, ResponseBody::Consumed);
    let ResponseBody::Stream(stream) = body else {
        return Ok(Processed::Response(response));
    };
    match process(stream, policy).await? {
        Some(output) => Ok(Processed::Accumulated(output)),
        None => Ok(Processed::Response(response)),
    }
}

enum Accumulator {
    Bytes(BytesMut),
    Text(String),
}

impl Accumulator {
    fn push(&mut self, chunk: &Chunk) {
        match (self, chunk) {
            (Self::Bytes(buf), Chunk::Bytes(b)) => buf.extend_from_slice(b),
            (Self::Text(buf), Chunk::Text(s)) => buf.push_str(s),
            (Self::Bytes(buf), Chunk::Text(s)) => buf.extend_from_slice(s.as_bytes()),
            (Self::Text(buf), Chunk::Bytes(b)) => buf.push_str(&String::from_utf8_lossy(b)),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Bytes(buf) => buf.is_empty(),
            Self::Text(buf) => buf.is_empty(),
        }
    }

    fn into_chunk(self) -> Chunk {
        match self {
            Self::Bytes(buf) => Chunk::Bytes(buf.freeze()),
            Self::Text(buf) => Chunk::Text(buf),
        }
    }
}

async fn process_chunks(mut stream: ByteStream, policy: &StreamPolicy) -> Result<Option<Output>> {
    let mut decoder = policy.encoding.map(|_| Utf8Decoder::default());
    let mut acc = match decoder {
        Some(_) => Accumulator::Text(String::new()),
        None => Accumulator::Bytes(BytesMut::new()),
    };
    let mut index = 0;
    let mut cumulative_bytes = 0;

    while let Some(raw) = stream.next().await {
        let raw = raw?;
        cumulative_bytes += raw.len();
        let chunk = match decoder.as_mut() {
            Some(d) => Chunk::Text(d.decode(&raw)),
            None => Chunk::Bytes(raw),
        };
        if policy.accumulate {
            acc.push(&chunk);
        }
        policy
            .emit(
                chunk,
                ChunkMeta {
                    index,
                    is_last: false,
                    cumulative_bytes,
                },
            )
            .await?;
        index += 1;
    }

    // An incomplete trailing sequence still reaches the handler.
    if let Some(d) = decoder.as_mut() {
        let tail = d.finish();
        if !tail.is_empty() {
            let chunk = Chunk::Text(tail);
            if policy.accumulate {
                acc.push(&chunk);
            }
            policy
                .emit(
                    chunk,
                    ChunkMeta {
                        index,
                        is_last: false,
                        cumulative_bytes,
                    },
                )
                .await?;
            index += 1;
        }
    }

    debug!(chunks = index, bytes = cumulative_bytes, "Stream consumed");
    finish(acc, index, cumulative_bytes, policy).await
}

/// Line-oriented variant: splits on `\n` (dropping a trailing `\r`),
/// buffers partial lines across chunks, and skips empty lines.
pub async fn process_lines(mut stream: ByteStream, policy: &StreamPolicy) -> Result<Option<Output>> {
    let mut decoder = Utf8Decoder::default();
    let mut partial = String::new();
    let mut acc = Accumulator::Text(String::new());
    let mut index = 0;
    let mut cumulative_bytes = 0;

    while let Some(raw) = stream.next().await {
        let raw = raw?;
        cumulative_bytes += raw.len();
        partial.push_str(&decoder.decode(&raw));

        while let Some(pos) = partial.find('\n') {
            let line: String = partial.drain(..=pos).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            emit_line(line, &mut index, cumulative_bytes, &mut acc, policy).await?;
        }
    }

    partial.push_str(&decoder.finish());
    let rest = partial.trim_end_matches('\r');
    if !rest.is_empty() {
        emit_line(rest, &mut index, cumulative_bytes, &mut acc, policy).await?;
    }

    debug!(lines = index, bytes = cumulative_bytes, "Line stream consumed");
    finish(acc, index, cumulative_bytes, policy).await
}

async fn emit_line(
    line: &str,
    index: &mut usize,
    cumulative_bytes: usize,
    acc: &mut Accumulator,
    policy: &StreamPolicy,
) -> Result<()> {
    if policy.accumulate {
        if !acc.is_empty() {
            acc.push(&Chunk::Text("\n".to_string()));
        }
        acc.push(&Chunk::Text(line.to_string()));
    }
    policy
        .emit(
            Chunk::Text(line.to_string()),
            ChunkMeta {
                index: *index,
                is_last: false,
                cumulative_bytes,
            },
        )
        .await?;
    *index += 1;
    Ok(())
}

async fn finish(
    acc: Accumulator,
    index: usize,
    cumulative_bytes: usize,
    policy: &StreamPolicy,
) -> Result<Option<Output>> {
    if !policy.accumulate {
        return Ok(None);
    }
    if acc.is_empty() {
        return Ok(Some(acc.into_chunk().into()));
    }
    let chunk = acc.into_chunk();
    if policy.flush_accumulated {
        policy
            .emit(
                chunk.clone(),
                ChunkMeta {
                    index,
                    is_last: true,
                    cumulative_bytes,
                },
            )
            .await?;
    }
    Ok(Some(chunk.into()))
}

/// Incremental UTF-8 decoder that holds back a multi-byte sequence split
/// across chunk boundaries.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);
        let buf = std::mem::take(&mut self.pending);
        let mut out = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is still pending, replacing an incomplete sequence.
    fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}
