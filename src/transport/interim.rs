//! Interim (1xx) responses sent while a request body is still streaming.
//!
//! The connection layer creates one `InterimResponder` per request and puts
//! it into the request extensions. A handler may use it once, before it has
//! produced its final response.

use axum::http::{HeaderMap, StatusCode};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterimError {
    #[error("status {0} is not informational")]
    NotInformational(StatusCode),
    #[error("an interim response was already sent for this request")]
    AlreadySent,
    #[error("the final response has already been sent")]
    Closed,
    #[error("failed to write interim response")]
    WriteFailed,
}

/// One informational response queued for the connection writer.
#[derive(Debug)]
pub struct Interim {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Resolved by the writer once the bytes are on the wire.
    pub written: oneshot::Sender<bool>,
}

#[derive(Clone, Debug)]
pub struct InterimResponder {
    tx: Arc<Mutex<Option<mpsc::Sender<Interim>>>>,
}

impl InterimResponder {
    /// A responder plus the receiving end the connection writer drains.
    pub fn channel() -> (Self, mpsc::Receiver<Interim>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Send an informational response and wait until it has been written.
    pub async fn send(&self, status: StatusCode, headers: HeaderMap) -> Result<(), InterimError> {
        if !status.is_informational() {
            return Err(InterimError::NotInformational(status));
        }
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(InterimError::AlreadySent)?;

        let (written, done) = oneshot::channel();
        tx.send(Interim {
            status,
            headers,
            written,
        })
        .await
        .map_err(|_| InterimError::Closed)?;

        match done.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(InterimError::WriteFailed),
            Err(_) => Err(InterimError::Closed),
        }
    }
}
