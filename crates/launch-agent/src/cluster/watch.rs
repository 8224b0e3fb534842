//! Resumable wrapper around a raw Kubernetes watch call.
//!
//! A watch connection is closed by the API server every few minutes and can
//! break at any time on a flaky network. [`SafeWatch`] hides both: it records
//! the resource version of every event it hands out and, when the stream ends
//! or breaks, re-opens it from that version so nothing is replayed or lost.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use kube::api::WatchEvent;
use kube::core::ErrorResponse;
use kube::Resource;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Server-side timeout requested for every watch call.
pub const WATCH_TIMEOUT_SECS: u32 = 30;

/// Pause before re-opening a watch that could not be opened at all.
const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Failure of a watch call or of an open watch stream.
#[derive(Debug, Clone, Error)]
pub enum WatchError {
    /// Connection reset, truncated chunk, proxy hiccup
    #[error("Broken event stream: {0}")]
    Transport(String),

    /// HTTP 410: the resource version we asked for has been compacted away
    #[error("Resource version too old: {0}")]
    Gone(String),

    #[error("Kubernetes API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Watch failed: {0}")]
    Other(String),
}

impl WatchError {
    /// Errors that [`SafeWatch`] absorbs by re-opening the stream.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Gone(_))
    }
}

impl From<ErrorResponse> for WatchError {
    fn from(response: ErrorResponse) -> Self {
        if response.code == 410 {
            Self::Gone(response.message)
        } else {
            Self::Api {
                code: response.code,
                message: response.message,
            }
        }
    }
}

impl From<kube::Error> for WatchError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => response.into(),
            kube::Error::HyperError(e) => Self::Transport(e.to_string()),
            kube::Error::Service(e) => Self::Transport(e.to_string()),
            kube::Error::ReadEvents(e) => Self::Transport(e.to_string()),
            other => Self::Other(other.to_string()),
        }
    }
}

/// Raw event stream returned by one watch call.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, WatchError>>;

/// Resumable watch. Cloning yields a handle to the same watch, so one clone
/// can drive [`SafeWatch::stream`] while another calls [`SafeWatch::stop`].
#[derive(Debug, Clone, Default)]
pub struct SafeWatch {
    last_seen_resource_version: Arc<RwLock<Option<String>>>,
    stop: CancellationToken,
}

impl SafeWatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch that also stops when `parent` is cancelled.
    #[must_use]
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            last_seen_resource_version: Arc::default(),
            stop: parent.child_token(),
        }
    }

    /// Terminate the stream. Takes effect at the stream's next poll, even if
    /// it is currently waiting on the server.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    #[must_use]
    pub fn last_seen_resource_version(&self) -> Option<String> {
        read_version(&self.last_seen_resource_version)
    }

    /// Lazily stream events from `watch_fn`, re-invoking it with the last seen
    /// resource version whenever the stream ends, breaks, or reports an
    /// expired version (in which case the stream restarts from the current
    /// state). Transport and 410 errors are never yielded; any other error is
    /// yielded once and ends the stream.
    pub fn stream<K, F, Fut>(
        &self,
        mut watch_fn: F,
    ) -> impl Stream<Item = Result<WatchEvent<K>, WatchError>> + Send + 'static
    where
        K: Resource + Send + 'static,
        F: FnMut(Option<String>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<WatchStream<K>, WatchError>> + Send + 'static,
    {
        let stop = self.stop.clone();
        let last_seen = Arc::clone(&self.last_seen_resource_version);

        async_stream::stream! {
            'watch: loop {
                if stop.is_cancelled() {
                    break;
                }

                let resume_from = read_version(&last_seen);
                let opened = tokio::select! {
                    biased;
                    () = stop.cancelled() => None,
                    opened = watch_fn(resume_from) => Some(opened),
                };
                let Some(opened) = opened else {
                    break;
                };

                let mut events = match opened {
                    Ok(events) => events,
                    Err(err) if err.is_recoverable() => {
                        warn!(error = %err, "Failed to open watch stream, retrying");
                        forget_expired_version(&err, &last_seen);
                        let stopped = tokio::select! {
                            biased;
                            () = stop.cancelled() => true,
                            () = tokio::time::sleep(REOPEN_DELAY) => false,
                        };
                        if stopped {
                            break;
                        }
                        continue;
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                };

                loop {
                    let next = tokio::select! {
                        biased;
                        () = stop.cancelled() => None,
                        next = events.next() => Some(next),
                    };
                    let Some(next) = next else {
                        break 'watch;
                    };

                    match next {
                        None => {
                            debug!("Watch stream closed by server, resuming");
                            break;
                        }
                        Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                            store_version(&last_seen, Some(bookmark.metadata.resource_version));
                        }
                        Some(Ok(WatchEvent::Error(response))) => {
                            let err = WatchError::from(response);
                            if !err.is_recoverable() {
                                yield Err(err);
                                break 'watch;
                            }
                            warn!(error = %err, "Watch reported an error event, attempting to recover");
                            forget_expired_version(&err, &last_seen);
                            break;
                        }
                        Some(Ok(event)) => {
                            if let Some(version) = event_resource_version(&event) {
                                store_version(&last_seen, Some(version));
                            }
                            yield Ok(event);
                        }
                        Some(Err(err)) if err.is_recoverable() => {
                            warn!(error = %err, "Broken event stream, attempting to recover");
                            forget_expired_version(&err, &last_seen);
                            break;
                        }
                        Some(Err(err)) => {
                            yield Err(err);
                            break 'watch;
                        }
                    }
                }
            }
        }
    }
}

fn event_resource_version<K: Resource>(event: &WatchEvent<K>) -> Option<String> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
            obj.meta().resource_version.clone()
        }
        WatchEvent::Bookmark(bookmark) => Some(bookmark.metadata.resource_version.clone()),
        WatchEvent::Error(_) => None,
    }
}

/// A 410 means the stored version can never be resumed from.
fn forget_expired_version(err: &WatchError, last_seen: &RwLock<Option<String>>) {
    if matches!(err, WatchError::Gone(_)) {
        store_version(last_seen, None);
    }
}

fn read_version(slot: &RwLock<Option<String>>) -> Option<String> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn store_version(slot: &RwLock<Option<String>>, version: Option<String>) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = version;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn pod_event(version: &str) -> WatchEvent<Pod> {
        let mut pod = Pod::default();
        pod.metadata.name = Some(format!("pod-{version}"));
        pod.metadata.resource_version = Some(version.to_string());
        WatchEvent::Modified(pod)
    }

    fn event_version(event: &WatchEvent<Pod>) -> String {
        event_resource_version(event).unwrap_or_default()
    }

    type Script = Vec<Result<WatchEvent<Pod>, WatchError>>;

    /// Watch function that serves one script per call and idles afterwards,
    /// recording the resource version it was asked to resume from.
    fn scripted(
        scripts: Vec<Script>,
    ) -> (
        impl FnMut(Option<String>) -> futures::future::Ready<Result<WatchStream<Pod>, WatchError>>
            + Send
            + 'static,
        Arc<Mutex<Vec<Option<String>>>>,
    ) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&calls);
        let mut scripts = VecDeque::from(scripts);
        let watch_fn = move |version: Option<String>| {
            recorded.lock().unwrap().push(version);
            let stream: WatchStream<Pod> = match scripts.pop_front() {
                Some(script) => futures::stream::iter(script).boxed(),
                None => futures::stream::pending().boxed(),
            };
            futures::future::ready(Ok(stream))
        };
        (watch_fn, calls)
    }

    #[tokio::test]
    async fn resumes_across_breaks_and_yields_only_real_events() {
        let (watch_fn, calls) = scripted(vec![
            vec![
                Ok(pod_event("1")),
                Err(WatchError::Transport("connection reset".into())),
            ],
            vec![Ok(pod_event("2"))],
            vec![
                Ok(pod_event("3")),
                Err(WatchError::Gone("too old resource version".into())),
            ],
            vec![Ok(pod_event("4"))],
        ]);

        let watch = SafeWatch::new();
        let mut events = Box::pin(watch.stream(watch_fn));

        let mut seen = Vec::new();
        for _ in 0..4 {
            let event = events.next().await.unwrap().unwrap();
            seen.push(event_version(&event));
        }
        assert_eq!(seen, vec!["1", "2", "3", "4"]);

        watch.stop();
        assert!(events.next().await.is_none());

        let calls = calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                None,
                Some("1".to_string()),
                Some("2".to_string()),
                // 410 drops the stale version and starts over
                None,
            ]
        );
        assert_eq!(watch.last_seen_resource_version(), Some("4".to_string()));
    }

    #[tokio::test]
    async fn non_recoverable_errors_propagate_and_end_the_stream() {
        let (watch_fn, _calls) = scripted(vec![vec![
            Ok(pod_event("7")),
            Err(WatchError::Api {
                code: 403,
                message: "forbidden".into(),
            }),
        ]]);

        let watch = SafeWatch::new();
        let mut events = Box::pin(watch.stream(watch_fn));

        assert!(events.next().await.unwrap().is_ok());
        let err = events.next().await.unwrap().unwrap_err();
        assert!(matches!(err, WatchError::Api { code: 403, .. }));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn error_events_with_410_restart_the_stream() {
        let gone = ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version: 5 (9)".into(),
            reason: "Expired".into(),
            code: 410,
        };
        let (watch_fn, calls) = scripted(vec![
            vec![Ok(pod_event("5")), Ok(WatchEvent::Error(gone))],
            vec![Ok(pod_event("9"))],
        ]);

        let watch = SafeWatch::new();
        let mut events = Box::pin(watch.stream(watch_fn));
        assert_eq!(event_version(&events.next().await.unwrap().unwrap()), "5");
        assert_eq!(event_version(&events.next().await.unwrap().unwrap()), "9");
        assert_eq!(calls.lock().unwrap()[1], None);
    }

    #[tokio::test]
    async fn stop_interrupts_an_idle_stream() {
        let (watch_fn, _calls) = scripted(vec![]);
        let watch = SafeWatch::new();
        let mut events = Box::pin(watch.stream(watch_fn));

        let consumer = tokio::spawn(async move { events.next().await.is_none() });
        tokio::task::yield_now().await;
        watch.stop();

        let ended = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("stream should end promptly after stop")
            .unwrap();
        assert!(ended);
    }

    #[tokio::test]
    async fn parent_cancellation_stops_child_watches() {
        let parent = CancellationToken::new();
        let watch = SafeWatch::with_parent(&parent);
        parent.cancel();
        assert!(watch.is_stopped());
    }

    #[test]
    fn kube_api_errors_are_classified() {
        let gone = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "expired".into(),
            reason: "Expired".into(),
            code: 410,
        });
        assert!(matches!(WatchError::from(gone), WatchError::Gone(_)));

        let forbidden = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        let err = WatchError::from(forbidden);
        assert!(!err.is_recoverable());

        let reset = kube::Error::ReadEvents(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(WatchError::from(reset).is_recoverable());
    }
}
