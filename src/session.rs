//! Per-connection session loop
//!
//! Reads bytes from the transport, cuts them into LDAPMessage frames and feeds
//! them to the [`OperationDispatcher`] one at a time. The next request is not
//! decoded until the previous one has written its terminal response. A shutdown
//! signal is only honoured between operations, so an operation that has
//! started always completes.
//!
//! The transport keeps being read while a handler runs. Bytes that arrive are
//! buffered for the next request; end of stream or a read error marks the
//! writer closed at once, which the handler observes through
//! [`SearchResults::is_closed`](crate::handler::SearchResults::is_closed).

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::dispatch::{
    is_benign_tls_closure_error, Flow, OperationDispatcher, ResponseWriter, SessionState,
};
use crate::error::{AppError, Result};
use crate::handler::Handler;
use crate::ldap_lib::{decode_message, encode_notice_of_disconnection, frame_length};
use crate::metrics;
use crate::result::ResultCode;

const READ_CHUNK: usize = 8192;

/// Keeps the active-session gauge right even if the session task unwinds
struct ActiveSession;

impl ActiveSession {
    fn open() -> Self {
        metrics::record_session_opened();
        Self
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        metrics::record_session_closed();
    }
}

/// Serves one client connection until it closes, fails fatally or shutdown is signalled
pub async fn handle_connection<S, H>(
    stream: S,
    handler: H,
    max_message_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: Handler,
{
    let _active = ActiveSession::open();
    let (mut reader, writer) = tokio::io::split(stream);
    let mut writer = ResponseWriter::new(writer);
    let mut dispatcher = OperationDispatcher::new(handler);
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    let peer_gone = writer.peer_gone();
    let mut read_error: Option<AppError> = None;

    let result = loop {
        if peer_gone.load(Ordering::Acquire) {
            debug!("Client disconnected");
            break read_error.take().map_or(Ok(()), Err);
        }
        if *shutdown.borrow() {
            notify_shutdown(&mut writer).await;
            break Ok(());
        }

        match frame_length(&buffer, max_message_size) {
            Ok(Some(len)) => {
                let frame: Vec<u8> = buffer.drain(..len).collect();
                dispatcher.set_state(SessionState::Decoding);
                let flow = match decode_message(&frame) {
                    Ok(message) => {
                        let dispatch = dispatcher.dispatch(message, &mut writer);
                        tokio::pin!(dispatch);
                        loop {
                            tokio::select! {
                                flow = &mut dispatch => break flow,
                                read = reader.read(&mut chunk), if !peer_gone.load(Ordering::Acquire) => {
                                    if let Err(e) = absorb_read(read, &chunk, &mut buffer, &peer_gone) {
                                        read_error = Some(e);
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => dispatcher.reject(e, &mut writer).await,
                };
                if flow == Flow::Close {
                    break read_error.take().map_or(Ok(()), Err);
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                dispatcher.reject(e, &mut writer).await;
                break Ok(());
            }
        }

        tokio::select! {
            read = reader.read(&mut chunk) => {
                if let Err(e) = absorb_read(read, &chunk, &mut buffer, &peer_gone) {
                    read_error = Some(e);
                }
            }
            changed = shutdown.changed() => {
                // a dropped sender means the server is gone
                if changed.is_err() {
                    notify_shutdown(&mut writer).await;
                    break Ok(());
                }
            }
        }
    };

    dispatcher.close();
    writer.shutdown().await;
    result
}

/// Appends the bytes of one read to `buffer`
///
/// End of stream and read errors set `peer_gone`; only errors other than a
/// client hanging up are returned.
fn absorb_read(
    read: std::io::Result<usize>,
    chunk: &[u8],
    buffer: &mut Vec<u8>,
    peer_gone: &AtomicBool,
) -> Result<()> {
    match read {
        Ok(0) => {
            peer_gone.store(true, Ordering::Release);
            Ok(())
        }
        Ok(n) => {
            debug!("Received {} bytes", n);
            buffer.extend_from_slice(&chunk[..n]);
            Ok(())
        }
        Err(e) if is_benign_tls_closure_error(&e) => {
            debug!("Client closed connection: {}", e);
            peer_gone.store(true, Ordering::Release);
            Ok(())
        }
        Err(e) => {
            peer_gone.store(true, Ordering::Release);
            Err(e.into())
        }
    }
}

async fn notify_shutdown<W>(writer: &mut ResponseWriter<W>)
where
    W: AsyncWrite + Unpin + Send,
{
    info!("Closing idle session for server shutdown");
    let notice = encode_notice_of_disconnection(ResultCode::Unavailable, "Server shutting down");
    if let Err(e) = writer.write_frame(&notice).await {
        debug!("Failed to send notice of disconnection: {}", e);
    }
}
