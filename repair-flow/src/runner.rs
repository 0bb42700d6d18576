//! BookingRunner: loads a session, applies exactly **one** command, waits for
//! pricing to settle and persists the session back to storage.
//!
//! Create it once at startup and share it across requests. Commands for the
//! same session are serialized; different sessions run concurrently.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    error::{FlowError, Result},
    flow::{BookingFlow, BookingView, FlowServices, WizardCommand},
    model::SessionId,
    storage::{BookingSession, SessionStorage},
    wizard::StepTransition,
};

#[derive(Debug, Clone)]
pub struct RunResult {
    pub transition: Option<StepTransition>,
    pub view: BookingView,
}

/// High-level helper that orchestrates the _load → apply → settle → save_
/// pattern.
#[derive(Clone)]
pub struct BookingRunner {
    services: FlowServices,
    storage: Arc<dyn SessionStorage>,
    locks: Arc<DashMap<SessionId, Arc<Mutex<()>>>>,
}

impl BookingRunner {
    pub fn new(services: FlowServices, storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            services,
            storage,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn services(&self) -> &FlowServices {
        &self.services
    }

    /// Creates and persists an empty booking.
    pub async fn start(&self) -> Result<BookingView> {
        let session = BookingSession::new();
        let view = BookingFlow::restore(&session, self.services.clone()).view();
        info!(session_id = %session.id, "booking session created");
        self.storage.save(session).await?;
        Ok(view)
    }

    pub async fn view(&self, session_id: &SessionId) -> Result<BookingView> {
        let session = self.load(session_id).await?;
        Ok(BookingFlow::restore(&session, self.services.clone()).view())
    }

    /// Applies **exactly one** command. A refused command leaves the stored
    /// session untouched.
    pub async fn run(&self, session_id: &SessionId, command: WizardCommand) -> Result<RunResult> {
        // Unknown ids never get a lock entry.
        self.load(session_id).await?;

        let lock = self
            .locks
            .entry(*session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.run_locked(session_id, command).await
        };
        drop(lock);
        self.locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn run_locked(&self, session_id: &SessionId, command: WizardCommand) -> Result<RunResult> {
        // 1. Load session
        let mut session = self.load(session_id).await?;

        // 2. Apply the command
        let mut flow = BookingFlow::restore(&session, self.services.clone());
        flow.mount();
        let transition = flow.apply(command)?;

        // 3. Let pricing settle so the stored session never holds a pending request
        if flow.pricing_busy() {
            if let Err(e) = flow.settle_pricing().await {
                warn!(session_id = %session_id, error = %e, "pricing did not settle");
            }
        }

        // 4. Persist new state so the next call starts where we left off
        flow.store_into(&mut session);
        let view = flow.view();
        flow.unmount();
        self.storage.save(session).await?;

        Ok(RunResult { transition, view })
    }

    pub async fn delete(&self, session_id: &SessionId) -> Result<()> {
        self.storage.delete(session_id).await?;
        self.locks.remove(session_id);
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<BookingSession> {
        self.storage
            .get(session_id)
            .await?
            .ok_or_else(|| FlowError::SessionNotFound(session_id.to_string()))
    }
}
