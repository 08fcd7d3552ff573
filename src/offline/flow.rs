//! Client-side verify workflow, modeled as an explicit state machine instead
//! of chained callbacks: scan a code, submit it, queue it when offline, and
//! resume after reconnect. Cancellation returns to idle from any non-terminal
//! state. `ScanSession` drives the machine against the offline queue.

use uuid::Uuid;

use super::store::StoreError;
use super::{FlushOutcome, OfflineQueue, ProofVerifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Scanning,
    Verifying,
    /// Captured while offline; waiting for the queue flush to reconcile it.
    Queued,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    ScanStarted,
    CodeCaptured,
    Accepted,
    /// Terminal rejection (expired or consumed); the user must re-request a
    /// fresh code.
    Rejected,
    ConnectivityLost,
    Reconnected,
    Cancelled,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        self == FlowState::Done
    }

    /// Applies one event; undefined combinations leave the state unchanged.
    pub fn apply(self, event: FlowEvent) -> FlowState {
        use FlowEvent::*;
        use FlowState::*;

        match (self, event) {
            (_, Cancelled) if self != Done => Idle,
            (Idle, ScanStarted) => Scanning,
            (Scanning, CodeCaptured) => Verifying,
            (Verifying, Accepted) => Done,
            (Verifying, Rejected) => Idle,
            (Verifying, ConnectivityLost) => Queued,
            (Queued, Reconnected) => Verifying,
            (Queued, Accepted) => Done,
            (Queued, Rejected) => Idle,
            (state, _) => state,
        }
    }
}

/// One scan-to-confirmation attempt on the device. Submission and flush
/// outcomes are translated into [`FlowEvent`]s, so the screen state is always
/// derived from what the queue actually did.
pub struct ScanSession {
    state: FlowState,
}

impl ScanSession {
    pub fn new() -> Self {
        Self {
            state: FlowState::Idle,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn start_scan(&mut self) -> FlowState {
        self.advance(FlowEvent::ScanStarted)
    }

    pub fn cancel(&mut self) -> FlowState {
        self.advance(FlowEvent::Cancelled)
    }

    /// Submits a captured code. Online outcomes settle immediately; a
    /// retryable failure captures the code into the queue and parks the
    /// session until a reconnect flush settles it.
    pub async fn submit<V: ProofVerifier>(
        &mut self,
        queue: &OfflineQueue,
        verifier: &V,
        token_value: &str,
        sub_order_id: Uuid,
    ) -> Result<FlowState, StoreError> {
        self.advance(FlowEvent::CodeCaptured);

        match verifier.verify(token_value, sub_order_id).await {
            Ok(_) => self.advance(FlowEvent::Accepted),
            Err(err) if err.is_retryable() => {
                queue.capture(token_value, sub_order_id)?;
                self.advance(FlowEvent::ConnectivityLost)
            }
            Err(_) => self.advance(FlowEvent::Rejected),
        };

        Ok(self.state)
    }

    /// Reconnect handler for a queued session: flushes the backlog and
    /// settles the session from the flush outcome. Nothing settled means
    /// still offline, so the session goes back to queued.
    pub async fn reconnect<V: ProofVerifier>(
        &mut self,
        queue: &OfflineQueue,
        verifier: &V,
    ) -> Result<FlowState, StoreError> {
        if self.state != FlowState::Queued {
            return Ok(self.state);
        }
        self.advance(FlowEvent::Reconnected);

        let event = match queue.flush(verifier).await? {
            FlushOutcome::Completed { rejected, .. } if rejected > 0 => FlowEvent::Rejected,
            FlushOutcome::Completed { accepted, .. } if accepted > 0 => FlowEvent::Accepted,
            FlushOutcome::Completed { .. } | FlushOutcome::AlreadyRunning => {
                FlowEvent::ConnectivityLost
            }
        };
        self.advance(event);

        Ok(self.state)
    }

    fn advance(&mut self, event: FlowEvent) -> FlowState {
        self.state = self.state.apply(event);
        self.state
    }
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::new()
    }
}
