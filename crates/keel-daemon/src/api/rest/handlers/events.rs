//! Event log and streaming handlers

use crate::api::rest::state::AppState;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream};
use keel_control::{event_subject, EventQuery};
use keel_types::{EventEnvelope, EventSeverity, EventSource};
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Get events query params
#[derive(Debug, Deserialize)]
pub struct GetEventsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub severity: Option<EventSeverity>,
    pub source: Option<EventSource>,
    /// Service or domain the event concerns
    pub subject: Option<String>,
}

fn default_limit() -> usize {
    50
}

/// Recent events, newest first
pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<GetEventsQuery>,
) -> Json<Vec<EventEnvelope>> {
    let query = EventQuery {
        min_severity: query.severity,
        source: query.source,
        subject: query.subject,
        limit: Some(query.limit),
    };
    Json(state.control.events(&query).await)
}

#[derive(Debug, Deserialize)]
pub struct StreamEventsQuery {
    pub subject: Option<String>,
}

/// Stream events via SSE
pub async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<StreamEventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.control.subscribe_events();
    let subject = query.subject;

    let stream = stream::unfold(rx, move |mut rx| {
        let subject = subject.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if let Some(wanted) = subject.as_deref() {
                            if event_subject(&envelope.event) != Some(wanted) {
                                continue;
                            }
                        }
                        let event = match Event::default().json_data(&envelope) {
                            Ok(event) => event,
                            Err(_) => Event::default().comment("unserializable event"),
                        };
                        return Some((Ok(event), rx));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        return Some((Ok(Event::default().comment(format!("lagged {}", skipped))), rx));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
