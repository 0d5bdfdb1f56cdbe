//! Multiplexing router.
//!
//! The router owns N slots, each a request stream, a response stream and a
//! synchronous [`SlotHandler`].  All request streams are read concurrently;
//! whichever slot completes a frame first is served first, so a quiet slot
//! never holds up a busy one.  Within a slot, one frame is fully answered
//! before the next is read.
//!
//! A slot finishes when its request stream ends at a frame boundary, and
//! its response stream is closed at that point.  The router finishes when
//! every slot has.  The first slot error stops the whole router.

use futures::future::try_join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use wacro_proto::{DEFAULT_MAX_PAYLOAD, FrameReader, FrameWriter, MIN_PAYLOAD_LEN};
use wacro_sandbox::SandboxError;

use crate::error::{HostError, Result};

/// A slot's pure request to response function.
pub trait SlotHandler: Send {
    /// Answer one request payload.
    fn call(&mut self, request: &[u8]) -> std::result::Result<Vec<u8>, SandboxError>;
}

impl<F> SlotHandler for F
where
    F: FnMut(&[u8]) -> std::result::Result<Vec<u8>, SandboxError> + Send,
{
    fn call(&mut self, request: &[u8]) -> std::result::Result<Vec<u8>, SandboxError> {
        self(request)
    }
}

struct Slot<R, W> {
    index: usize,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    handler: Box<dyn SlotHandler>,
}

impl<R, W> Slot<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn serve(mut self) -> Result<u64> {
        let slot = self.index;
        let mut frames = 0u64;
        loop {
            let request = match self.reader.next_frame().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(source) => return Err(HostError::SlotProtocol { slot, source }),
            };
            tracing::debug!(slot, bytes = request.len(), "request frame");

            let response = self
                .handler
                .call(&request)
                .and_then(check_response)
                .map_err(|source| HostError::SlotCall { slot, source })?;

            self.writer
                .send_frame(&response)
                .await
                .map_err(|source| HostError::SlotProtocol { slot, source })?;
            tracing::debug!(slot, bytes = response.len(), "response frame");
            frames += 1;
        }

        self.writer
            .shutdown()
            .await
            .map_err(|source| HostError::SlotProtocol { slot, source })?;
        tracing::debug!(slot, frames, "slot finished");
        Ok(frames)
    }
}

/// Refuse responses that could not be framed for the reader on the other side.
pub(crate) fn check_response<T: AsRef<[u8]>>(
    response: T,
) -> std::result::Result<T, SandboxError> {
    let len = response.as_ref().len();
    if (len as u64) < MIN_PAYLOAD_LEN {
        return Err(SandboxError::ResponseTooShort { len });
    }
    Ok(response)
}

/// Serves every slot until all request streams end.
pub struct Router<R, W> {
    slots: Vec<Slot<R, W>>,
    max_payload: u64,
}

impl<R, W> Router<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// An empty router with the default payload cap.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Cap payloads on every slot added after this call.
    pub fn with_max_payload(mut self, limit: u64) -> Self {
        self.max_payload = limit;
        self
    }

    /// Add a slot and return its index.
    pub fn add_slot(
        &mut self,
        requests: R,
        responses: W,
        handler: impl SlotHandler + 'static,
    ) -> usize {
        let index = self.slots.len();
        self.slots.push(Slot {
            index,
            reader: FrameReader::new(requests).with_max_payload(self.max_payload),
            writer: FrameWriter::new(responses),
            handler: Box::new(handler),
        });
        index
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slots were added.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Serve all slots to completion.
    ///
    /// Returns the number of frames answered per slot.
    pub async fn run(self) -> Result<Vec<u64>> {
        tracing::info!(slots = self.slots.len(), "router started");
        let served = try_join_all(self.slots.into_iter().map(Slot::serve)).await?;
        tracing::info!(frames = served.iter().sum::<u64>(), "router stopped");
        Ok(served)
    }
}

impl<R, W> Default for Router<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn default() -> Self {
        Self::new()
    }
}
