use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, StreamResult};

pub const SHARD_CURSOR__BEFORE_READ: &str = "shard_cursor.before_read";
pub const TOPOLOGY__BEFORE_POLL: &str = "topology.before_poll";

/// Evaluates the fail point `name`.
///
/// The action parameter selects the injected error: `unavailable` raises a transient
/// [`ErrorKind::ShardUnavailable`], anything else raises [`ErrorKind::WithNoRetry`].
pub fn stream_fail_point(name: &str) -> StreamResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("unavailable") => ErrorKind::ShardUnavailable,
            _ => ErrorKind::WithNoRetry,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
