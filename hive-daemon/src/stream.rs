use crate::app::supervisor::Subscription;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

pub(crate) const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Resolves once daemon shutdown has been requested. A dropped sender counts
/// as a request.
pub(crate) async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    loop {
        let requested = *shutdown.borrow_and_update();
        if requested || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Serves a subscription as `data: <json>` frames. The response ends when the
/// feed closes or the daemon starts shutting down; a client disconnect drops
/// the subscription.
pub(crate) fn sse_response<T>(
    subscription: Subscription<T>,
    shutdown: watch::Receiver<bool>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    T: Serialize + Unpin + Send + 'static,
{
    let frames = subscription.filter_map(|event| async move {
        match Event::default().json_data(&event) {
            Ok(frame) => Some(Ok(frame)),
            Err(err) => {
                warn!(error = %err, "dropping event that failed to serialize");
                None
            }
        }
    });
    let frames = frames.take_until(shutdown_requested(shutdown));
    Sse::new(frames).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}
