use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::coordinator::ChangeStream;
use crate::error::StreamResult;
use crate::source::ClusterConnector;
use crate::token::ResumeTokenCodec;
use crate::types::{ChangeEvent, OperationType};

/// Upper bound for waiting on a single event in tests.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout passed to each `next()` call while waiting.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Polls `stream` until it yields an event, fails, or [`EVENT_TIMEOUT`] passes.
pub async fn try_next_event<C>(stream: &mut ChangeStream<C>) -> StreamResult<Option<ChangeEvent>>
where
    C: ClusterConnector,
{
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while Instant::now() < deadline {
        if let Some(event) = stream.next(POLL_TIMEOUT).await? {
            return Ok(Some(event));
        }
    }

    Ok(None)
}

/// Returns the next event, panicking on errors and timeouts.
pub async fn next_event<C>(stream: &mut ChangeStream<C>) -> ChangeEvent
where
    C: ClusterConnector,
{
    match try_next_event(stream).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("no event within {EVENT_TIMEOUT:?}"),
        Err(err) => panic!("stream failed while waiting for an event: {err}"),
    }
}

/// Reads exactly `count` events.
pub async fn collect_events<C>(stream: &mut ChangeStream<C>, count: usize) -> Vec<ChangeEvent>
where
    C: ClusterConnector,
{
    let mut events = Vec::with_capacity(count);
    while events.len() < count {
        events.push(next_event(stream).await);
    }

    events
}

/// Reads events up to and including the terminal one.
pub async fn collect_until_terminal<C>(stream: &mut ChangeStream<C>) -> Vec<ChangeEvent>
where
    C: ClusterConnector,
{
    let mut events = Vec::new();
    loop {
        let event = next_event(stream).await;
        let terminal = event.is_terminal();
        events.push(event);

        if terminal {
            return events;
        }
    }
}

/// Asserts that no event arrives within `wait`.
pub async fn assert_no_event<C>(stream: &mut ChangeStream<C>, wait: Duration)
where
    C: ClusterConnector,
{
    if let Some(event) = stream.next(wait).await.unwrap() {
        panic!("expected no event, got {event:?}");
    }
}

/// `_id` values of the document keys of `events`, skipping events without one.
pub fn document_ids(events: &[ChangeEvent]) -> Vec<i64> {
    events
        .iter()
        .filter_map(|event| event.document_key.as_ref())
        .filter_map(|key| key.get("_id").and_then(|id| id.as_i64()))
        .collect()
}

pub fn operation_types(events: &[ChangeEvent]) -> Vec<OperationType> {
    events.iter().map(|event| event.operation_type).collect()
}

pub fn group_events_by_type(events: &[ChangeEvent]) -> HashMap<OperationType, Vec<ChangeEvent>> {
    let mut grouped = HashMap::new();
    for event in events {
        grouped
            .entry(event.operation_type)
            .or_insert_with(Vec::new)
            .push(event.clone());
    }

    grouped
}

/// Asserts that resume tokens strictly increase along `events`.
pub fn assert_strictly_increasing(events: &[ChangeEvent]) {
    for pair in events.windows(2) {
        let (previous, next) = (&pair[0], &pair[1]);
        assert!(
            ResumeTokenCodec::compare(previous.resume_token.data(), next.resume_token.data()).is_lt(),
            "tokens out of order: {} then {}",
            previous.resume_token,
            next.resume_token
        );
    }
}
