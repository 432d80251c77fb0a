// Duplex byte-stream transport under the line protocol.
//
// The pipe is a Windows named pipe at `\\.\pipe\<name>` or a Unix domain
// socket at `<tmp>/<name>.sock`. The server binds the name and accepts
// exactly one client. Platform security options are out of scope here.

use crate::error::PipeError;
use log::{debug, warn};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;

/// How long a connecting client sleeps between attempts while the server
/// end does not exist yet.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

pub trait PipeStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PipeStream for T {}

#[cfg(windows)]
pub fn pipe_path(name: &str) -> String {
    format!(r"\\.\pipe\{}", name)
}

#[cfg(unix)]
pub fn pipe_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{}.sock", name))
}

/// One connected duplex stream, not yet split into halves.
pub struct PipeConnection {
    stream: Box<dyn PipeStream>,
}

impl PipeConnection {
    /// Connect to the named pipe, retrying while the server end does not
    /// exist yet, for at most `wait`.
    pub async fn connect(name: &str, wait: Duration) -> Result<Self, PipeError> {
        let started = Instant::now();
        loop {
            match Self::try_connect(name).await {
                Ok(stream) => {
                    debug!("[TRANSPORT] connected to pipe \"{}\"", name);
                    return Ok(Self { stream });
                }
                Err(err) if retryable(&err) => {
                    if started.elapsed() >= wait {
                        return Err(PipeError::ConnectTimeout(wait));
                    }
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    #[cfg(unix)]
    async fn try_connect(name: &str) -> io::Result<Box<dyn PipeStream>> {
        let stream = tokio::net::UnixStream::connect(pipe_path(name)).await?;
        Ok(Box::new(stream))
    }

    #[cfg(windows)]
    async fn try_connect(name: &str) -> io::Result<Box<dyn PipeStream>> {
        let stream = tokio::net::windows::named_pipe::ClientOptions::new().open(pipe_path(name))?;
        Ok(Box::new(stream))
    }

    /// Split into the reader given to the background read loop and the raw
    /// write half installed into a `LineWriter`.
    pub fn split(self) -> (LineReader, WriteHalf<Box<dyn PipeStream>>) {
        let (read, write) = tokio::io::split(self.stream);
        (LineReader { lines: BufReader::new(read).lines() }, write)
    }
}

fn retryable(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => true,
        // ERROR_PIPE_BUSY: the pipe exists but has no free server instance.
        _ => err.raw_os_error() == Some(231),
    }
}

/// Accepts the single client connection for a named pipe.
pub struct PipeListener {
    #[cfg(unix)]
    inner: tokio::net::UnixListener,
    #[cfg(unix)]
    path: std::path::PathBuf,
    #[cfg(windows)]
    pipe: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

impl PipeListener {
    #[cfg(unix)]
    pub fn bind(name: &str) -> Result<Self, PipeError> {
        let path = pipe_path(name);
        // A stale socket file from a previous run would refuse the bind.
        let _ = std::fs::remove_file(&path);
        let inner = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { inner, path })
    }

    #[cfg(windows)]
    pub fn bind(name: &str) -> Result<Self, PipeError> {
        let pipe = tokio::net::windows::named_pipe::ServerOptions::new()
            .first_pipe_instance(true)
            .create(pipe_path(name))?;
        Ok(Self { pipe: Some(pipe) })
    }

    #[cfg(unix)]
    pub async fn accept(&mut self) -> Result<PipeConnection, PipeError> {
        let (stream, _) = self.inner.accept().await?;
        Ok(PipeConnection { stream: Box::new(stream) })
    }

    #[cfg(windows)]
    pub async fn accept(&mut self) -> Result<PipeConnection, PipeError> {
        let pipe = self.pipe.take().ok_or(PipeError::NotConnected)?;
        pipe.connect().await?;
        Ok(PipeConnection { stream: Box::new(pipe) })
    }
}

#[cfg(unix)]
impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Line-oriented read half. `next_line` yields `Ok(None)` at end of stream.
pub struct LineReader {
    lines: Lines<BufReader<ReadHalf<Box<dyn PipeStream>>>>,
}

impl LineReader {
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.lines.next_line().await
    }
}

/// Shared line-oriented write half. Writes never propagate errors past this
/// boundary: failures are logged and reported as `false` so callers can
/// abandon the in-flight call.
pub struct LineWriter {
    half: Mutex<Option<WriteHalf<Box<dyn PipeStream>>>>,
}

impl LineWriter {
    /// A writer with no stream attached yet; `write_line` reports failure
    /// until `install` is called.
    pub fn detached() -> Self {
        Self { half: Mutex::new(None) }
    }

    pub async fn install(&self, half: WriteHalf<Box<dyn PipeStream>>) {
        *self.half.lock().await = Some(half);
    }

    pub async fn write_line(&self, line: &str) -> bool {
        let mut guard = self.half.lock().await;
        let Some(writer) = guard.as_mut() else {
            warn!("[TRANSPORT] write of \"{}\" dropped: no stream", line);
            return false;
        };
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        if let Err(err) = writer.write_all(&bytes).await {
            warn!("[TRANSPORT] write of \"{}\" failed: {}", line, err);
            return false;
        }
        if let Err(err) = writer.flush().await {
            warn!("[TRANSPORT] flush after \"{}\" failed: {}", line, err);
            return false;
        }
        true
    }

    /// Shut the write half down. Idempotent.
    pub async fn close(&self) {
        if let Some(mut writer) = self.half.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "pipe-service-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[tokio::test]
    async fn test_line_round_trip() {
        let name = unique_name("transport");
        let mut listener = PipeListener::bind(&name).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = PipeConnection::connect(&name, Duration::from_secs(5)).await.unwrap();
        let server = accept.await.unwrap();

        let (mut server_reader, server_write) = server.split();
        let (mut client_reader, client_write) = client.split();
        let server_writer = LineWriter::detached();
        server_writer.install(server_write).await;
        let client_writer = LineWriter::detached();
        client_writer.install(client_write).await;

        assert!(client_writer.write_line("query|status").await);
        assert_eq!(server_reader.next_line().await.unwrap().as_deref(), Some("query|status"));
        assert!(server_writer.write_line("success|ok").await);
        assert_eq!(client_reader.next_line().await.unwrap().as_deref(), Some("success|ok"));
    }

    #[tokio::test]
    async fn test_write_line_reports_failure_after_close() {
        let name = unique_name("closed");
        let mut listener = PipeListener::bind(&name).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = PipeConnection::connect(&name, Duration::from_secs(5)).await.unwrap();
        let _server = accept.await.unwrap();

        let (_client_reader, client_write) = client.split();
        let writer = LineWriter::detached();
        writer.install(client_write).await;
        writer.close().await;
        writer.close().await; // idempotent
        assert!(!writer.write_line("command|noop").await);
    }

    #[tokio::test]
    async fn test_detached_writer_reports_failure() {
        let writer = LineWriter::detached();
        assert!(!writer.write_line("command|noop").await);
    }

    #[tokio::test]
    async fn test_reader_sees_end_of_stream_when_peer_closes() {
        let name = unique_name("eof");
        let mut listener = PipeListener::bind(&name).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = PipeConnection::connect(&name, Duration::from_secs(5)).await.unwrap();
        let server = accept.await.unwrap();

        let (mut server_reader, _server_write) = server.split();
        let (client_reader, client_write) = client.split();
        let writer = LineWriter::detached();
        writer.install(client_write).await;
        writer.close().await;
        drop(client_reader);
        assert_eq!(server_reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_connect_times_out_without_server() {
        let name = unique_name("absent");
        let result = PipeConnection::connect(&name, Duration::from_millis(150)).await;
        assert!(matches!(result, Err(PipeError::ConnectTimeout(_))));
    }
}
