//! The applier loop: delivers committed entries to the application.

use tokio::time::sleep;
use tokio::time::timeout;

use crate::core::Raft;
use crate::message::ApplyMsg;
use crate::message::EntryPayload;
use crate::AppCommand;
use crate::Persistence;
use crate::RaftNetwork;

impl<C: AppCommand, N: RaftNetwork<C>, P: Persistence> Raft<C, N, P> {
    /// Tick-driven applier. Advances `last_applied` toward `commit_index`,
    /// one entry at a time, and closes the apply channel on shutdown.
    pub(super) async fn applier_loop(self) {
        loop {
            if !self.state.lock().await.active {
                // Closing the channel is how consumers learn the node died.
                let _ = self.apply_tx.lock().await.take();
                return;
            }

            self.try_apply().await;
            sleep(self.config.tick_interval()).await;
        }
    }

    /// Apply as many committed entries as the consumer will take.
    ///
    /// Back-pressure: a send which does not complete within the configured
    /// bounded wait abandons the tick, releasing the state lock so
    /// replication can proceed while the consumer catches up.
    async fn try_apply(&self) {
        let mut st = self.state.lock().await;
        if !st.active {
            return;
        }

        assert!(st.last_applied >= st.snapshot_last_index);
        assert!(st.last_applied <= st.commit_index);

        let tx = match self.apply_tx.lock().await.clone() {
            Some(tx) => tx,
            None => return,
        };

        let mut advanced = false;
        while st.last_applied < st.commit_index {
            let index = st.last_applied + 1;
            let command = match &st.entry(index).payload {
                EntryPayload::Normal(command) => command.clone(),
                // Only the entry at the snapshot boundary is a marker, and
                // last_applied never falls below the boundary.
                EntryPayload::PurgedMarker => {
                    panic!("purged marker at live index {}", index)
                }
            };

            let msg = ApplyMsg::Command { index, command };
            match timeout(self.config.apply_send_timeout(), tx.send(msg)).await {
                Ok(Ok(())) => {
                    tracing::trace!(id = self.id, index, "applied entry");
                    st.last_applied = index;
                    advanced = true;
                }
                // Receiver is gone; the consumer has shut down.
                Ok(Err(_)) => return,
                // Consumer is stalled; retry on the next tick.
                Err(_) => {
                    tracing::trace!(id = self.id, index, "apply channel full, yielding");
                    break;
                }
            }
        }

        if advanced {
            self.report_metrics(&st);
        }
    }
}
