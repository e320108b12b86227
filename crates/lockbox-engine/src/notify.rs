//! Progress and completion notifications.
//!
//! Workers never call an observer directly. They push [`CryptoEvent`]s into
//! an unbounded channel, and one coordination task per engine drains it and
//! invokes observers one event at a time. Events carry only a `Weak`
//! reference: once the caller drops its observer, remaining events are
//! discarded.

use std::sync::Weak;

use lockbox_core::{Direction, FileIdentifier, LockboxError};
use tokio::sync::{mpsc, oneshot};

/// Receives job notifications. All methods default to no-ops.
///
/// Calls for one engine are serialized, including across concurrent jobs
/// sharing the same observer.
#[allow(unused_variables)]
pub trait CryptoObserver: Send + Sync {
    fn encryption_started(&self, id: &FileIdentifier) {}
    fn encryption_progress(&self, id: &FileIdentifier, progress: f32) {}
    fn encryption_finished(&self, id: &FileIdentifier) {}
    fn encryption_failed(&self, id: &FileIdentifier, failure: &JobFailure) {}

    fn decryption_started(&self, id: &FileIdentifier) {}
    fn decryption_progress(&self, id: &FileIdentifier, progress: f32) {}
    fn decryption_finished(&self, id: &FileIdentifier) {}
    fn decryption_failed(&self, id: &FileIdentifier, failure: &JobFailure) {}
}

/// What an observer learns about a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// Short status line, e.g. "Unable to decrypt this file"
    pub summary: &'static str,
    /// Full error chain as displayed
    pub detail: String,
    /// Tag verification failed (tampering, wrong key)
    pub authentication: bool,
}

impl From<&LockboxError> for JobFailure {
    fn from(err: &LockboxError) -> Self {
        Self {
            summary: err.message(),
            detail: err.to_string(),
            authentication: err.is_authentication_failure(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CryptoEvent {
    Started {
        id: FileIdentifier,
        direction: Direction,
    },
    Progress {
        id: FileIdentifier,
        direction: Direction,
        progress: f32,
    },
    Finished {
        id: FileIdentifier,
        direction: Direction,
    },
    Failed {
        id: FileIdentifier,
        direction: Direction,
        failure: JobFailure,
    },
}

impl CryptoEvent {
    fn dispatch(&self, observer: &dyn CryptoObserver) {
        use Direction::{Decrypt, Encrypt};
        match self {
            CryptoEvent::Started { id, direction: Encrypt } => observer.encryption_started(id),
            CryptoEvent::Started { id, direction: Decrypt } => observer.decryption_started(id),
            CryptoEvent::Progress {
                id,
                direction: Encrypt,
                progress,
            } => observer.encryption_progress(id, *progress),
            CryptoEvent::Progress {
                id,
                direction: Decrypt,
                progress,
            } => observer.decryption_progress(id, *progress),
            CryptoEvent::Finished { id, direction: Encrypt } => observer.encryption_finished(id),
            CryptoEvent::Finished { id, direction: Decrypt } => observer.decryption_finished(id),
            CryptoEvent::Failed {
                id,
                direction: Encrypt,
                failure,
            } => observer.encryption_failed(id, failure),
            CryptoEvent::Failed {
                id,
                direction: Decrypt,
                failure,
            } => observer.decryption_failed(id, failure),
        }
    }
}

enum Envelope {
    Deliver {
        observer: Weak<dyn CryptoObserver>,
        event: CryptoEvent,
    },
    Flush(oneshot::Sender<()>),
}

/// The single coordination task shared by every job of one engine.
///
/// Events from all jobs land on one channel and are dispatched one at a time,
/// so an observer handed to several concurrent jobs is never called
/// concurrently.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl NotificationHub {
    /// Start the coordination task. Must be called from within a Tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::Deliver { observer, event } => match observer.upgrade() {
                        Some(obs) => event.dispatch(obs.as_ref()),
                        None => tracing::trace!(?event, "observer gone, event dropped"),
                    },
                    Envelope::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Per-job handle delivering to `observer` through this hub.
    pub fn notifier(&self, observer: Option<Weak<dyn CryptoObserver>>) -> Notifier {
        match observer {
            Some(observer) => Notifier {
                route: Some(Route {
                    tx: self.tx.clone(),
                    observer,
                }),
            },
            None => Notifier::detached(),
        }
    }
}

#[derive(Debug, Clone)]
struct Route {
    tx: mpsc::UnboundedSender<Envelope>,
    observer: Weak<dyn CryptoObserver>,
}

/// One job's view of the hub.
#[derive(Debug)]
pub struct Notifier {
    route: Option<Route>,
}

impl Notifier {
    /// A notifier that discards every event.
    pub fn detached() -> Self {
        Self { route: None }
    }

    /// Handle used by the job to publish its events.
    pub fn sink(&self, direction: Direction, id: &FileIdentifier) -> EventSink {
        EventSink {
            route: self.route.clone(),
            direction,
            id: id.clone(),
        }
    }

    /// Wait until every event this job queued so far has been delivered.
    pub async fn finish(self) {
        let Some(route) = self.route else {
            return;
        };
        let (done, delivered) = oneshot::channel();
        if route.tx.send(Envelope::Flush(done)).is_err() {
            tracing::warn!("notification task is gone, pending events dropped");
            return;
        }
        if delivered.await.is_err() {
            tracing::warn!("notification task ended before flushing");
        }
    }
}

/// Job-side publisher bound to one identifier and direction.
#[derive(Debug, Clone)]
pub struct EventSink {
    route: Option<Route>,
    direction: Direction,
    id: FileIdentifier,
}

impl EventSink {
    pub fn started(&self) {
        self.send(CryptoEvent::Started {
            id: self.id.clone(),
            direction: self.direction,
        });
    }

    pub fn progress(&self, progress: f32) {
        self.send(CryptoEvent::Progress {
            id: self.id.clone(),
            direction: self.direction,
            progress,
        });
    }

    pub fn finished(&self) {
        self.send(CryptoEvent::Finished {
            id: self.id.clone(),
            direction: self.direction,
        });
    }

    pub fn failed(&self, err: &LockboxError) {
        self.send(CryptoEvent::Failed {
            id: self.id.clone(),
            direction: self.direction,
            failure: JobFailure::from(err),
        });
    }

    fn send(&self, event: CryptoEvent) {
        if let Some(route) = &self.route {
            // Receiver only disappears if the coordination task panicked
            let _ = route.tx.send(Envelope::Deliver {
                observer: route.observer.clone(),
                event,
            });
        }
    }
}
