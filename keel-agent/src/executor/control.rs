//! Cancel signalling between the controller and a running deployment

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelRequest {
    pub commander: String,
    pub force_rollback: bool,
    pub force_no_rollback: bool,
}

impl CancelRequest {
    pub fn wants_rollback(&self) -> bool {
        self.force_rollback && !self.force_no_rollback
    }
}

/// Controller side: cancels the deployment
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: watch::Sender<Option<CancelRequest>>,
    token: CancellationToken,
}

impl ControlHandle {
    pub fn cancel(&self, request: CancelRequest) {
        self.tx.send_replace(Some(request));
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Executor side
#[derive(Debug)]
pub struct ControlSignals {
    rx: watch::Receiver<Option<CancelRequest>>,
    token: CancellationToken,
}

pub fn control_channel() -> (ControlHandle, ControlSignals) {
    let (tx, rx) = watch::channel(None);
    let token = CancellationToken::new();
    (
        ControlHandle {
            tx,
            token: token.clone(),
        },
        ControlSignals { rx, token },
    )
}

impl ControlSignals {
    /// Fires on the first cancel request
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn request(&self) -> Option<CancelRequest> {
        self.rx.borrow().clone()
    }

    /// Status reason for a deployment ended by the current cancel request
    pub fn cancel_reason(&self, suffix: &str) -> String {
        let by = self
            .request()
            .map(|r| r.commander)
            .filter(|c| !c.is_empty())
            .map(|c| format!(" by {}", c))
            .unwrap_or_default();
        let suffix = if suffix.is_empty() { String::new() } else { format!(" {}", suffix) };
        format!("The deployment was cancelled{}{}", by, suffix)
    }

    /// Token that fires on the next cancel request from now on
    ///
    /// The returned guard stops watching when dropped.
    pub fn next_cancel(&mut self) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        self.rx.borrow_and_update();
        let mut rx = self.rx.clone();
        let token = CancellationToken::new();
        let fire = token.clone();
        let watcher = tokio::spawn(async move {
            if rx.changed().await.is_ok() {
                fire.cancel();
            }
        });
        (token, watcher)
    }
}
