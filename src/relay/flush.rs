//! Reconnect flush — ordered drain of a recipient's durable backlog.
//!
//! While a client's `flushing` flag is set, `route_message` keeps sending
//! its new inbound traffic to the durable queue, so everything queued
//! before reconnect is delivered before anything that arrives after.
//! Each entry is removed from the queue only after the push into the send
//! buffer returns: delivery is at-least-once, and the client dedups by
//! message id. Cancellation (disconnect mid-flush) leaves the remainder
//! queued for the next reconnect.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::ClientHandle;
use crate::queue::MessageQueue;

/// Entries drained per batch.
pub const BATCH_SIZE: usize = 50;
/// Pause between batches — lets the write task breathe.
const INTER_BATCH_PAUSE: Duration = Duration::from_millis(10);

pub async fn run(queue: Arc<MessageQueue>, client: ClientHandle) {
    debug!(addr = %client.address, "flush started");
    loop {
        if client.cancel.is_cancelled() {
            debug!(addr = %client.address, "flush cancelled — remainder stays queued");
            return;
        }

        let batch = match queue.flush_batch(&client.address, BATCH_SIZE).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(addr = %client.address, err = %e, "flush batch failed");
                client.set_flushing(false);
                return;
            }
        };
        if batch.is_empty() {
            client.set_flushing(false);
            debug!(addr = %client.address, "flush complete");
            return;
        }

        for entry in batch {
            let key = entry.key;
            tokio::select! {
                _ = client.cancel.cancelled() => {
                    debug!(addr = %client.address, "flush cancelled mid-batch");
                    return;
                }
                sent = client.sender.send(entry.envelope) => {
                    if sent.is_err() {
                        // Write task gone; the entry was not delivered and
                        // stays durable.
                        return;
                    }
                }
            }
            // Only after the push: forget the durable copy.
            if let Err(e) = queue.remove(&client.address, &key).await {
                warn!(addr = %client.address, err = %e, "failed to remove flushed entry");
            }
        }

        tokio::time::sleep(INTER_BATCH_PAUSE).await;
    }
}
