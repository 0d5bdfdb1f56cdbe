//! Host connection loop.
//!
//! A [`HostConnection`] reads request frames from one stream, hands each
//! payload to a [`MacroRunner`] and writes the response as a frame to the
//! other stream.  End-of-stream at a frame boundary closes the connection
//! cleanly; every other failure closes it with an error.

use tokio::io::{AsyncRead, AsyncWrite, Stdin, Stdout};
use wacro_proto::{DEFAULT_MAX_PAYLOAD, FrameReader, FrameWriter};
use wacro_sandbox::MacroRunner;

use crate::error::Result;
use crate::router::check_response;

/// Lifecycle of a [`HostConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for, or answering, the next request.
    Running,
    /// Terminal; no further reads or writes happen.
    Closed,
}

/// One request/response stream pair bound to a runner.
#[derive(Debug)]
pub struct HostConnection<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    state: ConnectionState,
    served: u64,
}

impl HostConnection<Stdin, Stdout> {
    /// A connection over the process's standard streams.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> HostConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wrap a stream pair, capping payloads at the default limit.
    pub fn new(input: R, output: W) -> Self {
        Self {
            reader: FrameReader::new(input).with_max_payload(DEFAULT_MAX_PAYLOAD),
            writer: FrameWriter::new(output),
            state: ConnectionState::Running,
            served: 0,
        }
    }

    /// Override the payload cap.
    pub fn with_max_payload(mut self, limit: u64) -> Self {
        self.reader = self.reader.with_max_payload(limit);
        self
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of requests answered so far.
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Answer at most one request.
    ///
    /// Returns the state after the step.  Any error also moves the
    /// connection to [`ConnectionState::Closed`].
    pub async fn step(&mut self, runner: &mut dyn MacroRunner) -> Result<ConnectionState> {
        if self.state == ConnectionState::Closed {
            return Ok(ConnectionState::Closed);
        }
        match self.answer_next(runner).await {
            Ok(state) => {
                self.state = state;
                Ok(state)
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    /// Answer requests until the input ends.
    ///
    /// Returns the number of requests answered.
    pub async fn run(mut self, runner: &mut dyn MacroRunner) -> Result<u64> {
        tracing::info!(runner = runner.name(), backend = %runner.kind(), "connection open");
        while self.step(runner).await? == ConnectionState::Running {}
        self.writer.shutdown().await?;
        tracing::info!(served = self.served, "connection closed");
        Ok(self.served)
    }

    async fn answer_next(&mut self, runner: &mut dyn MacroRunner) -> Result<ConnectionState> {
        let Some(payload) = self.reader.next_frame().await? else {
            return Ok(ConnectionState::Closed);
        };
        let request = std::str::from_utf8(&payload)?;
        tracing::debug!(bytes = payload.len(), "request frame");

        let response = check_response(runner.handle(request).await?)?;
        self.writer.send_frame(response.as_bytes()).await?;
        self.served += 1;
        tracing::debug!(bytes = response.len(), "response frame");
        Ok(ConnectionState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;
    use wacro_proto::{ProtoError, encode};
    use wacro_sandbox::{RunnerKind, SandboxError};

    use crate::error::HostError;

    /// Uppercases requests; fails on `"boom"` and answers `"mute"` with nothing.
    struct Upper {
        calls: usize,
    }

    #[async_trait]
    impl MacroRunner for Upper {
        fn kind(&self) -> RunnerKind {
            RunnerKind::Vm
        }

        fn name(&self) -> &str {
            "upper"
        }

        async fn handle(&mut self, request: &str) -> wacro_sandbox::Result<String> {
            self.calls += 1;
            if request == "\"boom\"" {
                return Err(SandboxError::Trap("boom".into()));
            }
            if request == "\"mute\"" {
                return Ok(String::new());
            }
            Ok(request.to_uppercase())
        }
    }

    async fn drive(input: Vec<u8>, runner: &mut Upper) -> (Result<u64>, Vec<u8>) {
        let (mut client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let conn = HostConnection::new(server_read, server_write);

        let feeder = async move {
            client.write_all(&input).await.unwrap();
            client.shutdown().await.unwrap();
            let mut out = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut client, &mut out)
                .await
                .unwrap();
            out
        };
        let (result, output) = tokio::join!(conn.run(runner), feeder);
        (result, output)
    }

    #[tokio::test]
    async fn answers_requests_in_order() {
        let mut input = encode(b"{\"a\":1}");
        input.extend(encode(b"[\"x\"]"));
        let mut runner = Upper { calls: 0 };

        let (result, output) = drive(input, &mut runner).await;
        assert_eq!(result.unwrap(), 2);

        let mut expected = encode(b"{\"A\":1}");
        expected.extend(encode(b"[\"X\"]"));
        assert_eq!(output, expected);
    }

    #[tokio::test]
    async fn clean_eof_closes_without_error() {
        let mut runner = Upper { calls: 0 };
        let (result, output) = drive(Vec::new(), &mut runner).await;
        assert_eq!(result.unwrap(), 0);
        assert!(output.is_empty());
        assert_eq!(runner.calls, 0);
    }

    #[tokio::test]
    async fn truncated_header_is_fatal() {
        let mut runner = Upper { calls: 0 };
        let (result, output) = drive(vec![1, 0, 0, 0, 0], &mut runner).await;
        assert!(matches!(
            result,
            Err(HostError::Proto(ProtoError::TruncatedHeader { read: 5 }))
        ));
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn undersized_frame_is_fatal() {
        let mut runner = Upper { calls: 0 };
        let (result, _) = drive(encode(b"x"), &mut runner).await;
        assert!(matches!(
            result,
            Err(HostError::Proto(ProtoError::InvalidPayloadSize { size: 1 }))
        ));
        assert_eq!(runner.calls, 0);
    }

    #[tokio::test]
    async fn handle_failure_writes_nothing_and_stops() {
        let mut input = encode(b"\"ok\"");
        input.extend(encode(b"\"boom\""));
        input.extend(encode(b"\"never\""));
        let mut runner = Upper { calls: 0 };

        let (result, output) = drive(input, &mut runner).await;
        assert!(matches!(result, Err(HostError::Sandbox(SandboxError::Trap(_)))));
        assert_eq!(output, encode(b"\"OK\""));
        assert_eq!(runner.calls, 2);
    }

    #[tokio::test]
    async fn short_response_is_a_call_error() {
        let mut input = encode(b"\"ok\"");
        input.extend(encode(b"\"mute\""));
        let mut runner = Upper { calls: 0 };

        let (result, output) = drive(input, &mut runner).await;
        assert!(matches!(
            result,
            Err(HostError::Sandbox(SandboxError::ResponseTooShort { len: 0 }))
        ));
        assert_eq!(output, encode(b"\"OK\""));
    }

    #[tokio::test]
    async fn invalid_utf8_is_fatal() {
        let mut runner = Upper { calls: 0 };
        let (result, _) = drive(encode(&[0xff, 0xfe]), &mut runner).await;
        assert!(matches!(result, Err(HostError::InvalidUtf8(_))));
    }

    #[tokio::test]
    async fn closed_is_terminal() {
        let (client, server) = tokio::io::duplex(4096);
        drop(client);
        let (r, w) = tokio::io::split(server);
        let mut conn = HostConnection::new(r, w);
        let mut runner = Upper { calls: 0 };

        assert_eq!(conn.step(&mut runner).await.unwrap(), ConnectionState::Closed);
        assert_eq!(conn.step(&mut runner).await.unwrap(), ConnectionState::Closed);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
