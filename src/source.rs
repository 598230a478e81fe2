//! Byte sources feeding a published stream.
//!
//! A [`StreamSource`] names where the bytes come from; [`StreamSource::open`]
//! turns it into a [`ChunkSource`] the publisher pulls from until EOF.
//! Network and custom sources are published as `audio` chunks, subprocess
//! captures (SDR tools writing raw IQ samples to stdout) as `iq_data`.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

const PROCESS_READ_BUFFER: usize = 64 * 1024;

#[async_trait]
pub trait ChunkSource: Send + 'static {
    /// Next block of bytes, `None` at end of stream. Blocks may be any size;
    /// the publisher splits them.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Which stream message carries the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Audio,
    IqData,
}

pub enum StreamSource {
    /// Fetch a URL and relay the response body.
    Http { url: String },
    /// Run a program and relay its stdout.
    Process { program: String, args: Vec<String> },
    Custom {
        label: String,
        source: Box<dyn ChunkSource>,
    },
}

impl StreamSource {
    pub fn http(url: impl Into<String>) -> Self {
        StreamSource::Http { url: url.into() }
    }

    pub fn process<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StreamSource::Process {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn custom(label: impl Into<String>, source: impl ChunkSource) -> Self {
        StreamSource::Custom {
            label: label.into(),
            source: Box::new(source),
        }
    }

    /// Short human-readable description, recorded as the stream's `source`.
    pub fn label(&self) -> String {
        match self {
            StreamSource::Http { url } => url.clone(),
            StreamSource::Process { program, args } => {
                if args.is_empty() {
                    program.clone()
                } else {
                    format!("{} {}", program, args.join(" "))
                }
            }
            StreamSource::Custom { label, .. } => label.clone(),
        }
    }

    pub fn audio_url(&self) -> Option<&str> {
        match self {
            StreamSource::Http { url } => Some(url),
            _ => None,
        }
    }

    pub fn payload_kind(&self) -> PayloadKind {
        match self {
            StreamSource::Process { .. } => PayloadKind::IqData,
            _ => PayloadKind::Audio,
        }
    }

    /// Start producing bytes. HTTP requests must return response headers
    /// within `fetch_timeout`.
    pub async fn open(self, fetch_timeout: Duration) -> Result<Box<dyn ChunkSource>> {
        match self {
            StreamSource::Http { url } => {
                let source = HttpSource::open(&url, fetch_timeout).await?;
                Ok(Box::new(source))
            }
            StreamSource::Process { program, args } => {
                let source = ProcessSource::spawn(&program, &args)?;
                Ok(Box::new(source))
            }
            StreamSource::Custom { source, .. } => Ok(source),
        }
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamSource::Http { url } => f.debug_struct("Http").field("url", url).finish(),
            StreamSource::Process { program, args } => f
                .debug_struct("Process")
                .field("program", program)
                .field("args", args)
                .finish(),
            StreamSource::Custom { label, .. } => f
                .debug_struct("Custom")
                .field("label", label)
                .finish_non_exhaustive(),
        }
    }
}

/// Response body reader. Every read gets the fetch timeout, so a download
/// that stalls mid-body fails instead of holding the stream open.
struct HttpSource {
    url: String,
    response: reqwest::Response,
    read_timeout: Duration,
}

impl HttpSource {
    async fn open(url: &str, fetch_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(fetch_timeout)
            .build()
            .context("failed to build HTTP client")?;

        let response = tokio::time::timeout(fetch_timeout, client.get(url).send())
            .await
            .map_err(|_| anyhow::anyhow!("fetching {} timed out after {:?}", url, fetch_timeout))?
            .with_context(|| format!("failed to fetch {}", url))?
            .error_for_status()
            .with_context(|| format!("bad response from {}", url))?;

        debug!(
            url = %url,
            status = %response.status(),
            content_length = ?response.content_length(),
            "audio source opened"
        );
        Ok(Self {
            url: url.to_string(),
            response,
            read_timeout: fetch_timeout,
        })
    }
}

#[async_trait]
impl ChunkSource for HttpSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        tokio::time::timeout(self.read_timeout, self.response.chunk())
            .await
            .map_err(|_| {
                anyhow::anyhow!("download of {} stalled for {:?}", self.url, self.read_timeout)
            })?
            .context("audio download interrupted")
    }
}

/// Child stdout reader. The child is killed when the source is dropped,
/// which is how a stopped stream ends its capture process.
struct ProcessSource {
    program: String,
    child: Child,
    stdout: ChildStdout,
    buf: BytesMut,
}

impl ProcessSource {
    fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", program))?;

        let stdout = child
            .stdout
            .take()
            .context("child process has no stdout")?;

        debug!(program = %program, pid = ?child.id(), "capture process started");
        Ok(Self {
            program: program.to_string(),
            child,
            stdout,
            buf: BytesMut::with_capacity(PROCESS_READ_BUFFER),
        })
    }
}

#[async_trait]
impl ChunkSource for ProcessSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.buf.reserve(PROCESS_READ_BUFFER);
        let n = self
            .stdout
            .read_buf(&mut self.buf)
            .await
            .with_context(|| format!("failed reading output of {}", self.program))?;
        if n > 0 {
            return Ok(Some(self.buf.split().freeze()));
        }

        let status = self.child.wait().await?;
        if !status.success() {
            anyhow::bail!("{} exited with {}", self.program, status);
        }
        Ok(None)
    }
}

/// A fixed sequence of blocks. Useful for replaying recordings.
#[derive(Debug, Default, Clone)]
pub struct StaticSource {
    chunks: VecDeque<Bytes>,
}

impl StaticSource {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ChunkSource for StaticSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }
}

/// Split `block` into pieces of at most `max` bytes.
pub(crate) fn split_block(mut block: Bytes, max: usize) -> Vec<Bytes> {
    let max = max.max(1);
    let mut pieces = Vec::with_capacity(block.len().div_ceil(max));
    while block.len() > max {
        pieces.push(block.split_to(max));
    }
    if !block.is_empty() {
        pieces.push(block);
    }
    pieces
}
