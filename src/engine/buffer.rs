//! Buffer controller: feed buffered envelopes into work queues without
//! letting any queue grow past its `thread_limit`.

use std::sync::Arc;

use tracing::{debug, info};

use super::Shared;
use crate::broker::Broker;
use crate::error::Result;

/// One admission pass over `queue`. Envelopes are promoted while
/// `limit - len(work queue)` stays above one. Returns how many moved.
pub fn admit(broker: &Broker, queue: &str, limit: usize) -> Result<usize> {
    let mut room = limit as i64 - broker.queue_len(queue)? as i64;
    let mut admitted = 0;
    while room > 1 {
        if !broker.promote_from_buffer(queue)? {
            break;
        }
        admitted += 1;
        room -= 1;
    }
    if admitted > 0 {
        debug!(queue, admitted, "buffer admitted");
    }
    Ok(admitted)
}

/// One pass over every queue that declares a `thread_limit`.
pub fn pass(broker: &Broker) -> Result<usize> {
    let mut total = 0;
    for (queue, settings) in broker.all_queue_settings()? {
        if let Some(limit) = settings.thread_limit {
            total += admit(broker, &queue, limit)?;
        }
    }
    Ok(total)
}

pub(crate) fn run(shared: Arc<Shared>) {
    info!(worker = %shared.worker, "buffer controller started");
    loop {
        if let Err(e) = pass(&shared.broker) {
            shared.pause_after("buffer pass", &e);
        }
        if shared.shutdown.sleep(shared.options.buffer_interval()) {
            break;
        }
    }
    info!(worker = %shared.worker, "buffer controller stopped");
}
