// ! STDIO transport port for MCP
// !
// ! Module provides the subprocess transport: it spawns an MCP server as a
// ! child process and exchanges newline-delimited JSON frames over its
// ! standard input and output. The writer runs behind a bounded queue whose
// ! overflow surfaces as BUSY, and the reader only pulls a line off the pipe
// ! when the core has issued an active-once permit.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::core::error::{CallError, McpResult};
use crate::transport::traits::{ActiveMode, FramePort, PortConnector, PortEvent, SendOutcome};

/// Default bound of the outbound frame queue, in frames
const DEFAULT_WRITE_QUEUE: usize = 64;

/// Default inbound frame size cap, matching the connection default
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Commands the port sends its reader task
enum ReadControl {
    /// Read and deliver exactly one frame
    One,
    /// Stop reading and exit
    Stop,
}

/// Connector that spawns an MCP server subprocess per attempt
#[derive(Debug, Clone)]
pub struct StdioConnector {
    command: String,
    args: Vec<String>,
    max_frame_bytes: usize,
    write_queue: usize,
}

impl StdioConnector {
    /// Create a connector for the given server command
    pub fn new<S: Into<String>>(command: S, args: Vec<S>) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            write_queue: DEFAULT_WRITE_QUEUE,
        }
    }

    /// Cap inbound line buffering at the given frame size
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Override the outbound queue bound
    pub fn with_write_queue(mut self, frames: usize) -> Self {
        self.write_queue = frames.max(1);
        self
    }
}

#[async_trait]
impl PortConnector for StdioConnector {
    async fn connect(&mut self, events: mpsc::Sender<PortEvent>) -> McpResult<Box<dyn FramePort>> {
        tracing::debug!(command = %self.command, "spawning MCP server process");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CallError::transport(format!("failed to spawn {}: {e}", self.command))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CallError::transport("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CallError::transport("failed to capture child stdout"))?;

        let (write_tx, write_rx) = mpsc::channel(self.write_queue);
        let (read_ctl_tx, read_ctl_rx) = mpsc::unbounded_channel();

        tokio::spawn(writer_task(stdin, write_rx, events.clone()));
        tokio::spawn(reader_task(
            stdout,
            read_ctl_rx,
            events.clone(),
            self.max_frame_bytes,
        ));

        // The pipes exist as soon as the process does, so the port is
        // ready for frames immediately.
        let _ = events.send(PortEvent::Up).await;

        Ok(Box::new(StdioPort {
            child,
            write_tx,
            read_ctl_tx,
            closed: false,
        }))
    }
}

/// A live subprocess port
struct StdioPort {
    // Kept so the child is reaped when the port is dropped
    child: Child,
    write_tx: mpsc::Sender<Vec<u8>>,
    read_ctl_tx: mpsc::UnboundedSender<ReadControl>,
    closed: bool,
}

impl FramePort for StdioPort {
    fn send_frame(&mut self, frame: &[u8]) -> SendOutcome {
        if self.closed {
            return SendOutcome::Failed("port closed".to_string());
        }
        match self.write_tx.try_send(frame.to_vec()) {
            Ok(()) => SendOutcome::Sent,
            Err(TrySendError::Full(_)) => SendOutcome::Busy,
            Err(TrySendError::Closed(_)) => SendOutcome::Failed("writer task gone".to_string()),
        }
    }

    fn set_active(&mut self, mode: ActiveMode) {
        if self.closed {
            return;
        }
        let control = match mode {
            ActiveMode::Once => ReadControl::One,
            ActiveMode::Off => ReadControl::Stop,
        };
        let _ = self.read_ctl_tx.send(control);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.read_ctl_tx.send(ReadControl::Stop);
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("failed to kill server process: {e}");
        }
    }
}

/// Drain the outbound queue into the child's stdin
async fn writer_task(
    mut stdin: ChildStdin,
    mut frames: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<PortEvent>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut stdin, &frame).await {
            tracing::warn!("stdio write failed: {e}");
            let _ = events
                .send(PortEvent::Down(format!("write error: {e}")))
                .await;
            return;
        }
    }
}

async fn write_frame(stdin: &mut ChildStdin, frame: &[u8]) -> std::io::Result<()> {
    stdin.write_all(frame).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Read one frame per permit and deliver it to the core
async fn reader_task(
    stdout: ChildStdout,
    mut control: mpsc::UnboundedReceiver<ReadControl>,
    events: mpsc::Sender<PortEvent>,
    max_frame_bytes: usize,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        match control.recv().await {
            Some(ReadControl::One) => {}
            Some(ReadControl::Stop) | None => return,
        }

        match read_frame(&mut reader, max_frame_bytes).await {
            Ok(Some(frame)) => {
                if events.send(PortEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = events
                    .send(PortEvent::Down("server closed stdout".to_string()))
                    .await;
                return;
            }
            Err(e) => {
                let _ = events
                    .send(PortEvent::Down(format!("read error: {e}")))
                    .await;
                return;
            }
        }
    }
}

/// Read one newline-delimited frame, buffering at most `cap + 1` bytes.
///
/// Lines longer than the cap keep exactly one byte beyond it so the caller
/// can observe the overflow; the remainder of the line is consumed from the
/// pipe without being stored. Returns `None` on a clean EOF.
async fn read_frame<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    cap: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut frame = Vec::new();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            // EOF mid-line still yields what we have
            return Ok(if frame.is_empty() { None } else { Some(frame) });
        }

        let newline = chunk.iter().position(|&b| b == b'\n');
        let line_end = newline.unwrap_or(chunk.len());
        let room = (cap + 1).saturating_sub(frame.len());
        frame.extend_from_slice(&chunk[..line_end.min(room)]);

        let consumed = newline.map_or(chunk.len(), |p| p + 1);
        reader.consume(consumed);

        if newline.is_some() {
            return Ok(Some(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_read_frame_single_line() {
        let mut reader = BufReader::new(&b"{\"jsonrpc\":\"2.0\"}\nrest"[..]);
        let frame = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(frame, b"{\"jsonrpc\":\"2.0\"}");
    }

    #[tokio::test]
    async fn test_read_frame_multiple_lines() {
        let mut reader = BufReader::new(&b"one\ntwo\n"[..]);
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap().unwrap(), b"one");
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap().unwrap(), b"two");
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_eof_without_newline() {
        let mut reader = BufReader::new(&b"partial"[..]);
        assert_eq!(
            read_frame(&mut reader, 1024).await.unwrap().unwrap(),
            b"partial"
        );
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_caps_oversized_line() {
        let mut input = vec![b'a'; 100];
        input.push(b'\n');
        input.extend_from_slice(b"next\n");

        let mut reader = BufReader::new(&input[..]);
        let frame = read_frame(&mut reader, 10).await.unwrap().unwrap();
        // One byte past the cap is kept so the overflow is observable
        assert_eq!(frame.len(), 11);

        // The oversized remainder was consumed; the next frame is intact
        let frame = read_frame(&mut reader, 10).await.unwrap().unwrap();
        assert_eq!(frame, b"next");
    }

    #[test]
    fn test_connector_defaults() {
        let connector = StdioConnector::new("mcp-server", vec!["--verbose"]);
        assert_eq!(connector.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(connector.write_queue, DEFAULT_WRITE_QUEUE);

        let connector = connector.with_max_frame_bytes(1024).with_write_queue(0);
        assert_eq!(connector.max_frame_bytes, 1024);
        // Queue bound is clamped to at least one frame
        assert_eq!(connector.write_queue, 1);
    }
}
