//! Cancellation signal accepted by every I/O-bound operation.
//!
//! A [`CancelHandle`] flips the shared flag; any number of [`Cancel`] receivers observe it,
//! either by polling [`Cancel::check`] at unit boundaries or by racing [`Cancel::cancelled`]
//! against in-flight work.

use tokio::sync::watch;

use crate::error::ArborError;

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// `rx == None` is a signal that can never fire.
#[derive(Debug, Clone)]
pub struct Cancel {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelHandle {
    pub fn new() -> (CancelHandle, Cancel) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Cancel { rx: Some(rx) })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> Cancel {
        Cancel {
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl Cancel {
    /// A signal that never fires.
    pub fn never() -> Cancel {
        Cancel { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// `Err(OperationCancelled)` once the signal has fired.
    pub fn check(&self) -> Result<(), ArborError> {
        if self.is_cancelled() {
            Err(ArborError::OperationCancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the signal fires. Never resolves if the handle is dropped unfired.
    pub async fn cancelled(&self) {
        let Some(mut rx) = self.rx.clone() else {
            return std::future::pending::<()>().await;
        };
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Cancel {
    fn default() -> Self {
        Cancel::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn cancel_is_observed_by_all_tokens() {
        let (handle, first) = CancelHandle::new();
        let second = handle.token();
        assert!(first.check().is_ok());

        handle.cancel();
        assert_eq!(first.check(), Err(ArborError::OperationCancelled));
        assert!(second.is_cancelled());
        second.cancelled().await;
    }
}
