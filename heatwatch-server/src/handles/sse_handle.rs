use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use tokio::sync::broadcast::Sender;
use tokio::time::interval;
use tokio_stream::StreamExt;
use tokio_stream::{Stream, wrappers};

use crate::services::{AlertMessage, Shutdown, StateStore};

const STREAM_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct StreamState {
    pub store: Arc<StateStore>,
    pub sender: Sender<AlertMessage>,
    pub shutdown: Shutdown,
}

/// Ends `stream` when the server shuts down so graceful shutdown is not held open.
fn until_shutdown<S>(stream: S, shutdown: &Shutdown) -> impl Stream<Item = S::Item> + use<S>
where
    S: Stream,
{
    let stop = shutdown.changes().filter(|stopped| *stopped).map(|_| None);

    stream
        .map(Some)
        .merge(stop)
        .take_while(Option::is_some)
        .filter_map(|item| item)
}

/// Pushes the latest snapshot to the dashboard every two seconds.
pub async fn stream_latest(
    State(state): State<StreamState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let store = state.store.clone();
    let ticks = wrappers::IntervalStream::new(interval(STREAM_INTERVAL)).map(move |_| {
        let snapshot = store.snapshot_all();
        Ok::<_, Infallible>(Event::default().json_data(snapshot).unwrap_or_else(|e| {
            tracing::warn!("failed to encode snapshot: {}", e);
            Event::default().comment("snapshot unavailable")
        }))
    });

    Sse::new(until_shutdown(ticks, &state.shutdown)).keep_alive(KeepAlive::default())
}

/// Alert transitions as they happen.
pub async fn stream_alerts(
    State(state): State<StreamState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.sender.subscribe();

    let alerts = wrappers::BroadcastStream::new(receiver).filter_map(|result| match result {
        Ok(message) => Some(Ok::<_, Infallible>(Event::default()
            .event("alert")
            .json_data(&message)
            .unwrap_or_else(|_| Event::default().data(message.to_string())))),
        // lagged receivers skip what they missed
        Err(_) => None,
    });

    Sse::new(until_shutdown(alerts, &state.shutdown)).keep_alive(KeepAlive::default())
}
