//! Renegotiation serialization.
//!
//! Turning on screen-share audio with ten peers connected would otherwise
//! fire ten description exchanges at once — correlated bandwidth spikes and
//! SDP glare. All renegotiation flows through this coordinator: one queue,
//! deduplicated per user, drained strictly in arrival order by a single
//! worker, so at most one renegotiation is in flight across all sessions.
//! A ticket completes when the session's fresh local description has been
//! created and dispatched; the coordinator does not wait for the remote
//! answer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::EngineError;
use crate::session::{PeerSessionManager, SessionState};

pub struct NegotiationCoordinator {
    manager: Arc<PeerSessionManager>,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    queued: Arc<Mutex<HashSet<Uuid>>>,
    in_flight: Arc<AtomicBool>,
}

impl NegotiationCoordinator {
    pub fn new(manager: Arc<PeerSessionManager>) -> Self {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Uuid>();
        let queued: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));
        let in_flight = Arc::new(AtomicBool::new(false));

        let worker_manager = Arc::clone(&manager);
        let worker_queued = Arc::clone(&queued);
        let worker_in_flight = Arc::clone(&in_flight);
        tokio::spawn(async move {
            while let Some(user_id) = queue_rx.recv().await {
                let still_queued = worker_queued
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&user_id);
                if !still_queued {
                    // Cleared (room teardown) while waiting in line.
                    continue;
                }

                // The session may have left the stable connected state
                // since the ticket was queued; drop rather than stall.
                if !is_connected(&worker_manager, user_id) {
                    log::debug!("negotiation: dropping ticket for {user_id}: not connected");
                    continue;
                }

                worker_in_flight.store(true, Ordering::SeqCst);
                let (done_tx, done_rx) = oneshot::channel();
                if worker_manager.renegotiate(user_id, done_tx).is_ok() {
                    match done_rx.await {
                        Ok(Ok(())) => {
                            log::debug!("negotiation: dispatched for {user_id}");
                        }
                        Ok(Err(EngineError::RenegotiationRejected(_))) => {
                            log::debug!(
                                "negotiation: rejected for {user_id} (session not stable)"
                            );
                        }
                        Ok(Err(e)) => {
                            log::warn!("negotiation: failed for {user_id}: {e}");
                        }
                        Err(_) => {
                            // Session closed mid-ticket.
                        }
                    }
                }
                worker_in_flight.store(false, Ordering::SeqCst);
            }
        });

        Self {
            manager,
            queue_tx,
            queued,
            in_flight,
        }
    }

    /// Queue a renegotiation for `user_id`. At most one ticket per user
    /// sits in the queue; requests against sessions that aren't in a
    /// stable connected state are dropped silently — the condition that
    /// needed the renegotiation re-fires once the session connects.
    pub fn request_renegotiation(&self, user_id: Uuid) {
        if !is_connected(&self.manager, user_id) {
            log::debug!("negotiation: ignoring request for {user_id}: not connected");
            return;
        }
        let newly_queued = self
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id);
        if !newly_queued {
            return;
        }
        let _ = self.queue_tx.send(user_id);
    }

    /// Drop everything still waiting in line. In-flight work completes.
    pub fn clear(&self) {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.queued.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn is_connected(manager: &Arc<PeerSessionManager>, user_id: Uuid) -> bool {
    matches!(
        manager.session_state(user_id),
        Some(SessionState::Connected | SessionState::Degraded)
    )
}
