//! Awaitable forms of the driver-side operations.
//!
//! A [`PendingRequest`] resolves with the correlated response frame,
//! rejects on command failure (`statusCode` high bit), on an inbound
//! `error` frame, or on session error/close, and cleans its responder up
//! when cancelled or dropped — a late response then falls through to the
//! fallback channel without invoking anything.

use crate::session::{EventFrame, ServerHandle};
use mcws_core::error::{CoreError, CoreResult};
use mcws_core::frame::Frame;
use mcws_core::messages::{command_status, is_command_error, CommandLine};
use mcws_core::session::HandlerOutcome;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// An in-flight awaited request. Dropping it cancels: the responder is
/// removed before any response could be delivered to it.
pub struct PendingRequest {
    request_id: Uuid,
    rx: oneshot::Receiver<CoreResult<Frame>>,
    handle: ServerHandle,
    finished: bool,
}

impl PendingRequest {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Cancel explicitly. Equivalent to dropping the future.
    pub fn cancel(self) {}

    fn cleanup(&self) {
        self.handle.session.clear_responder(self.request_id);
        lock_pending(&self.handle).remove(&self.request_id);
    }
}

impl Future for PendingRequest {
    type Output = CoreResult<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                self.finished = true;
                Poll::Ready(outcome)
            }
            Poll::Ready(Err(_)) => {
                self.finished = true;
                Poll::Ready(Err(CoreError::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.finished {
            self.cleanup();
        }
    }
}

fn lock_pending(
    handle: &ServerHandle,
) -> std::sync::MutexGuard<'_, std::collections::HashMap<Uuid, oneshot::Sender<CoreResult<Frame>>>>
{
    handle
        .shared
        .pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl ServerHandle {
    fn awaited(&self, frame: Frame) -> CoreResult<PendingRequest> {
        let id = frame.request_id;
        let (tx, rx) = oneshot::channel();
        lock_pending(self).insert(id, tx);

        let shared = self.shared.clone();
        let registered = self.session.set_responder(
            id,
            Box::new(move |_session, frame| {
                let slot = shared
                    .pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&frame.request_id);
                if let Some(tx) = slot {
                    let outcome = match command_status(&frame.body) {
                        Some((code, message)) if is_command_error(code) => {
                            Err(CoreError::CommandFailed {
                                status_code: code,
                                status_message: message,
                            })
                        }
                        _ => Ok(frame.clone()),
                    };
                    let _ = tx.send(outcome);
                }
                Ok(HandlerOutcome::Consume)
            }),
        );
        if let Err(e) = registered {
            lock_pending(self).remove(&id);
            return Err(e);
        }
        if let Err(e) = self.session.send(&frame) {
            self.session.clear_responder(id);
            lock_pending(self).remove(&id);
            return Err(e);
        }

        Ok(PendingRequest {
            request_id: id,
            rx,
            handle: self.clone(),
            finished: false,
        })
    }

    /// Awaitable command; resolves with the `commandResponse` frame.
    pub fn command(&self, line: impl Into<CommandLine>) -> CoreResult<PendingRequest> {
        let frame = self.command_frame(line.into())?;
        self.awaited(frame)
    }

    /// Awaitable legacy-shape command.
    pub fn command_legacy(
        &self,
        name: &str,
        overload: &str,
        input: Value,
    ) -> CoreResult<PendingRequest> {
        let frame = self.legacy_command_frame(name, overload, input)?;
        self.awaited(frame)
    }

    /// Awaitable catalog request (`data:<kind>`).
    pub fn data(&self, data_type: &str) -> CoreResult<PendingRequest> {
        let frame = Frame::request(
            self.session.version(),
            mcws_core::Purpose::data_request(data_type),
            Value::Null,
        );
        self.awaited(frame)
    }

    /// Awaitable command with a deadline. On timeout the request is
    /// cancelled and the late response dropped.
    pub async fn command_timeout(
        &self,
        line: impl Into<CommandLine>,
        timeout: Duration,
    ) -> CoreResult<Frame> {
        let pending = self.command(line)?;
        match tokio::time::timeout(timeout, pending).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CoreError::Timeout),
        }
    }

    /// Await the first `event` frame on `name` passing `filter`.
    ///
    /// An extra holder listener pins the subscription while waiting, so
    /// the `unsubscribe` frame is only sent after the caller has observed
    /// its event.
    pub async fn wait_for_event(
        &self,
        name: &str,
        mut filter: impl FnMut(&EventFrame) -> bool + Send,
    ) -> CoreResult<EventFrame> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let holder = self.subscribe(name, |_| {})?;
        let watcher = match self.subscribe(name, move |event| {
            let _ = tx.send(event.clone());
        }) {
            Ok(id) => id,
            Err(e) => {
                let _ = self.unsubscribe(name, holder);
                return Err(e);
            }
        };

        let result = loop {
            match rx.recv().await {
                Some(event) => {
                    if filter(&event) {
                        break Ok(event);
                    }
                }
                None => break Err(CoreError::Closed),
            }
        };

        let _ = self.unsubscribe(name, watcher);
        let _ = self.unsubscribe(name, holder);
        result
    }
}
