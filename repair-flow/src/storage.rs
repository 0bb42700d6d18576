use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    error::Result,
    model::SessionId,
    reconcile::PricingSnapshot,
    wizard::BookingWizard,
};

/// Persisted state of one booking between requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingSession {
    pub id: SessionId,
    pub wizard: BookingWizard,
    #[serde(default)]
    pub pricing: PricingSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BookingSession {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            wizard: BookingWizard::new(),
            pricing: PricingSnapshot::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for BookingSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for storing and retrieving booking sessions
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn save(&self, session: BookingSession) -> Result<()>;
    async fn get(&self, id: &SessionId) -> Result<Option<BookingSession>>;
    async fn delete(&self, id: &SessionId) -> Result<()>;
}

/// In-memory implementation of SessionStorage
#[derive(Clone, Default)]
pub struct InMemorySessionStorage {
    sessions: Arc<DashMap<SessionId, BookingSession>>,
}

impl InMemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStorage for InMemorySessionStorage {
    async fn save(&self, session: BookingSession) -> Result<()> {
        self.sessions.insert(session.id, session);
        Ok(())
    }

    async fn get(&self, id: &SessionId) -> Result<Option<BookingSession>> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn delete(&self, id: &SessionId) -> Result<()> {
        self.sessions.remove(id);
        Ok(())
    }
}
