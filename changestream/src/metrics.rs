//! Metric names and labels emitted by change streams.

/// Label for the shard a participant reads from.
pub const SHARD_ID_LABEL: &str = "shard_id";

/// Label for the operation type of a delivered event.
pub const OPERATION_TYPE_LABEL: &str = "operation_type";

/// Label for the classification of an observed topology change.
pub const TRANSITION_LABEL: &str = "transition";

/// Label for the error kind a stream failed with.
pub const ERROR_KIND_LABEL: &str = "error_kind";

/// Gauge for currently open change streams.
pub const CHANGESTREAM_OPEN_STREAMS: &str = "changestream_open_streams";

/// Counter for events delivered to consumers.
pub const CHANGESTREAM_EVENTS_DELIVERED_TOTAL: &str = "changestream_events_delivered_total";

/// Counter for streams that ended with an error.
pub const CHANGESTREAM_STREAM_FAILURES_TOTAL: &str = "changestream_stream_failures_total";

/// Counter for shard reads retried after a transient failure.
pub const CHANGESTREAM_PARTICIPANT_RETRIES_TOTAL: &str = "changestream_participant_retries_total";

/// Gauge for participants that have not reported progress within the lag threshold.
pub const CHANGESTREAM_LAGGING_PARTICIPANTS: &str = "changestream_lagging_participants";

/// Counter for topology changes observed by open streams.
pub const CHANGESTREAM_TOPOLOGY_CHANGES_TOTAL: &str = "changestream_topology_changes_total";

/// Histogram for the time an event waited in the merger before delivery.
pub const CHANGESTREAM_MERGE_WAIT_SECONDS: &str = "changestream_merge_wait_seconds";
