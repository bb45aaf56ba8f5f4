//! Operation dispatch core
//!
//! Drives one connection's handler through each decoded request and guarantees
//! that every operation ends with exactly one terminal response, whatever the
//! handler does: returns normally, returns an error, or panics.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::error::{AppError, Result};
use crate::handler::{FrameSink, Handler, SearchResults};
use crate::ldap_lib::{
    encode_extended_response, encode_ldap_result, encode_notice_of_disconnection, DecodeError,
    ResponseOp,
};
use crate::metrics;
use crate::models::{BindAuthentication, ExtendedResponse, LdapMessage, Request};
use crate::result::{LdapError, ResultCode};

/// Lifecycle of a connection between and during operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Decoding,
    Dispatching,
    Streaming,
    Completed,
    Closed,
}

/// Whether the session should read another request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Helper function to check if an I/O error is due to improper connection closure
/// Many LDAP clients don't send TLS close_notify alerts, which is not critical
pub fn is_benign_tls_closure_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        error.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    ) {
        return true;
    }
    let error_msg = error.to_string().to_lowercase();
    error_msg.contains("closenotify") || error_msg.contains("close_notify")
}

/// Write half of a connection; every frame is flushed as soon as it is written
pub struct ResponseWriter<W> {
    writer: W,
    closed: bool,
    peer_gone: Arc<AtomicBool>,
}

impl<W> ResponseWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
            peer_gone: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag the read side sets once the client has gone away
    ///
    /// A set flag closes the writer for every later frame, including ones
    /// written by a handler still in the middle of an operation.
    pub fn peer_gone(&self) -> Arc<AtomicBool> {
        self.peer_gone.clone()
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::ConnectionClosed);
        }
        let written = async {
            self.writer.write_all(frame).await?;
            self.writer.flush().await
        }
        .await;

        if let Err(e) = written {
            self.closed = true;
            if is_benign_tls_closure_error(&e) {
                debug!("Client disconnected during write: {}", e);
                return Err(AppError::ConnectionClosed);
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.peer_gone.load(Ordering::Acquire)
    }

    /// Closes the write side; errors are irrelevant at this point
    pub async fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.writer.shutdown().await {
                debug!("Ignoring error while closing connection: {}", e);
            }
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> FrameSink for ResponseWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.write_frame(frame).await
    }

    fn is_closed(&self) -> bool {
        ResponseWriter::is_closed(self)
    }
}

/// What a successful handler call produced
enum Outcome {
    Done(ResultCode),
    Extended(ExtendedResponse),
}

/// Runs decoded requests against one connection's handler, one at a time
pub struct OperationDispatcher<H> {
    handler: H,
    state: SessionState,
}

impl<H: Handler> OperationDispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Dispatches one request and writes its terminal response
    pub async fn dispatch<W>(&mut self, message: LdapMessage, writer: &mut ResponseWriter<W>) -> Flow
    where
        W: AsyncWrite + Unpin + Send,
    {
        let LdapMessage { message_id, op, .. } = message;
        let operation = op.name();

        let Some(response) = ResponseOp::for_request(&op) else {
            return match op {
                Request::Unbind => {
                    debug!("Client unbound");
                    self.state = SessionState::Closed;
                    Flow::Close
                }
                _ => {
                    // requests on a connection never overlap, so there is nothing to cancel
                    debug!("Ignoring abandon request {}", message_id);
                    self.state = SessionState::Idle;
                    Flow::Continue
                }
            };
        };

        self.state = if matches!(op, Request::Search(_)) {
            SessionState::Streaming
        } else {
            SessionState::Dispatching
        };
        let started = Instant::now();

        let outcome = AssertUnwindSafe(run_handler(&mut self.handler, message_id, op, writer))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Handler panicked during {}: {}", operation, reason);
                Err(LdapError::server_error())
            });

        self.state = SessionState::Completed;

        let (code, frame) = match outcome {
            Ok(Outcome::Done(code)) => (code, encode_ldap_result(message_id, response, code, "", "")),
            Ok(Outcome::Extended(extended)) => (
                ResultCode::Success,
                encode_extended_response(
                    message_id,
                    ResultCode::Success,
                    "",
                    extended.name.as_deref(),
                    extended.value.as_deref(),
                ),
            ),
            Err(e) => {
                debug!("{} failed: {}", operation, e);
                let diagnostic = e.message().unwrap_or("");
                let frame = match response {
                    ResponseOp::Extended => {
                        encode_extended_response(message_id, e.code(), diagnostic, None, None)
                    }
                    _ => encode_ldap_result(message_id, response, e.code(), "", diagnostic),
                };
                (e.code(), frame)
            }
        };

        metrics::record_operation(operation, code, started.elapsed().as_secs_f64());
        self.finish(writer, &frame).await
    }

    /// Answers a request the codec could not or would not decode
    pub async fn reject<W>(&mut self, err: DecodeError, writer: &mut ResponseWriter<W>) -> Flow
    where
        W: AsyncWrite + Unpin + Send,
    {
        match err {
            DecodeError::Malformed(reason) => {
                warn!("Closing connection after malformed message: {}", reason);
                metrics::record_decode_error(true);
                let notice = encode_notice_of_disconnection(ResultCode::ProtocolError, &reason);
                if let Err(e) = writer.write_frame(&notice).await {
                    debug!("Failed to send notice of disconnection: {}", e);
                }
                self.state = SessionState::Closed;
                Flow::Close
            }
            DecodeError::Unsupported {
                message_id,
                response,
                code,
                reason,
            } => {
                warn!("Rejected message {}: {}", message_id, reason);
                metrics::record_decode_error(false);
                let frame = match response {
                    ResponseOp::Extended => {
                        encode_extended_response(message_id, code, &reason, None, None)
                    }
                    _ => encode_ldap_result(message_id, response, code, "", &reason),
                };
                self.state = SessionState::Completed;
                self.finish(writer, &frame).await
            }
        }
    }

    /// Marks the session closed, e.g. on disconnect or shutdown
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    async fn finish<W>(&mut self, writer: &mut ResponseWriter<W>, frame: &[u8]) -> Flow
    where
        W: AsyncWrite + Unpin + Send,
    {
        if writer.is_closed() {
            self.state = SessionState::Closed;
            return Flow::Close;
        }
        match writer.write_frame(frame).await {
            Ok(()) => {
                self.state = SessionState::Idle;
                Flow::Continue
            }
            Err(e) => {
                debug!("Failed to write response: {}", e);
                self.state = SessionState::Closed;
                Flow::Close
            }
        }
    }
}

async fn run_handler<H, W>(
    handler: &mut H,
    message_id: u32,
    op: Request,
    writer: &mut ResponseWriter<W>,
) -> std::result::Result<Outcome, LdapError>
where
    H: Handler,
    W: AsyncWrite + Unpin + Send,
{
    match op {
        Request::Bind(request) => {
            match request.authentication {
                BindAuthentication::Simple(password) => {
                    let dn = (!request.name.is_empty()).then_some(request.name.as_str());
                    handler.simple_bind(request.version, dn, &password).await?;
                }
                BindAuthentication::Sasl {
                    mechanism,
                    credentials,
                } => {
                    handler
                        .sasl_bind(&mechanism, credentials.as_deref())
                        .await?;
                }
            }
            Ok(Outcome::Done(ResultCode::Success))
        }
        Request::Search(request) => {
            let mut results = SearchResults::new(writer, message_id)
                .with_attributes(request.attributes, request.types_only)
                .with_size_limit(request.size_limit)
                .with_time_limit(request.time_limit);
            handler
                .search(
                    &request.base,
                    request.scope,
                    request.deref,
                    &request.filter,
                    &mut results,
                )
                .await?;
            debug!("Search returned {} entries", results.sent());
            Ok(Outcome::Done(ResultCode::Success))
        }
        Request::Modify(request) => {
            handler.modify(&request).await?;
            Ok(Outcome::Done(ResultCode::Success))
        }
        Request::Add(request) => {
            handler.add(&request.entry).await?;
            Ok(Outcome::Done(ResultCode::Success))
        }
        Request::Delete(dn) => {
            handler.delete(&dn).await?;
            Ok(Outcome::Done(ResultCode::Success))
        }
        Request::ModifyDn(request) => {
            handler.modify_dn(&request).await?;
            Ok(Outcome::Done(ResultCode::Success))
        }
        Request::Compare(request) => {
            let matched = handler
                .compare(&request.dn, &request.attribute, &request.value)
                .await?;
            Ok(Outcome::Done(if matched {
                ResultCode::CompareTrue
            } else {
                ResultCode::CompareFalse
            }))
        }
        Request::Extended(request) => handler.extended(&request).await.map(Outcome::Extended),
        Request::Unbind | Request::Abandon(_) => Ok(Outcome::Done(ResultCode::Success)),
    }
}
