use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, RwLock};

use crate::session::{ChannelSession, ChannelStatus, ChatMessage, Direction};
use crate::settings::{AiProfile, ProfilePatch, SettingsError};
use crate::storage::KeyValueStore;

pub const PROFILES_KEY: &str = "channel_autopilot.profiles";
pub const SESSIONS_KEY: &str = "channel_autopilot.sessions";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("channel is not connected: {0}")]
    ChannelNotConnected(String),
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error(transparent)]
    Invalid(#[from] SettingsError),
    #[error("failed to persist state: {0}")]
    Persist(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreState {
    pub profiles: Vec<AiProfile>,
    pub sessions: Vec<ChannelSession>,
}

impl StoreState {
    fn session_mut(&mut self, id: &str) -> Result<&mut ChannelSession, StoreError> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::ChannelNotFound(id.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    pub channels: usize,
    pub connected: usize,
    pub messages: usize,
    pub revision: u64,
}

#[derive(Debug, Clone)]
pub struct Appended {
    pub message: ChatMessage,
    pub profile_id: String,
    pub persisted: bool,
}

pub struct EntityStore {
    kv: Arc<dyn KeyValueStore>,
    state: RwLock<StoreState>,
    revision: watch::Sender<u64>,
}

impl EntityStore {
    pub async fn load(kv: Arc<dyn KeyValueStore>) -> Self {
        let (store, seeded) = Self::read(kv).await;
        if seeded {
            let state = store.state.read().await;
            if let Err(e) = store.persist(&state).await {
                tracing::warn!(error = %e, "could not persist seeded profile");
            }
        }
        store
    }

    // same as load, but a seeded profile stays in memory only
    pub async fn inspect(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::read(kv).await.0
    }

    async fn read(kv: Arc<dyn KeyValueStore>) -> (Self, bool) {
        let mut profiles: Vec<AiProfile> = read_collection(kv.as_ref(), PROFILES_KEY).await.unwrap_or_default();
        let sessions: Vec<ChannelSession> = read_collection(kv.as_ref(), SESSIONS_KEY).await.unwrap_or_default();

        let seeded = profiles.is_empty();
        if seeded {
            tracing::info!("no stored profiles, seeding default profile");
            profiles.push(AiProfile::default());
        }

        let (revision, _) = watch::channel(0);
        (Self { kv, state: RwLock::new(StoreState { profiles, sessions }), revision }, seeded)
    }

    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    // f must leave the state untouched when it returns an error
    pub async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut state = self.state.write().await;
        let out = f(&mut state)?;
        let persisted = self.persist(&state).await;
        drop(state);
        self.revision.send_modify(|r| *r += 1);
        persisted?;
        Ok(out)
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let profiles = serde_json::to_string(&state.profiles).map_err(|e| StoreError::Persist(e.to_string()))?;
        let sessions = serde_json::to_string(&state.sessions).map_err(|e| StoreError::Persist(e.to_string()))?;
        for (key, value) in [(PROFILES_KEY, profiles), (SESSIONS_KEY, sessions)] {
            self.kv.set(key, &value).await.map_err(|e| {
                tracing::error!(key, error = %e, "persisting collection failed");
                StoreError::Persist(format!("{key}: {e:#}"))
            })?;
        }
        Ok(())
    }

    pub async fn profiles(&self) -> Vec<AiProfile> {
        self.state.read().await.profiles.clone()
    }

    pub async fn profile(&self, id: &str) -> Option<AiProfile> {
        self.state.read().await.profiles.iter().find(|p| p.id == id).cloned()
    }

    pub async fn update_profile(&self, id: &str, patch: ProfilePatch) -> Result<AiProfile, StoreError> {
        self.mutate(|state| {
            let profile = state
                .profiles
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| StoreError::ProfileNotFound(id.to_string()))?;
            profile.apply_patch(patch)?;
            Ok(profile.clone())
        })
        .await
    }

    pub async fn channels(&self) -> Vec<ChannelSession> {
        self.state.read().await.sessions.clone()
    }

    pub async fn channel(&self, id: &str) -> Option<ChannelSession> {
        self.state.read().await.sessions.iter().find(|s| s.id == id).cloned()
    }

    pub async fn create_channel(&self) -> Result<ChannelSession, StoreError> {
        let created = self
            .mutate(|state| {
                let profile_id = match state.profiles.first() {
                    Some(p) => p.id.clone(),
                    None => {
                        tracing::warn!("creating channel without any profile to bind");
                        String::new()
                    }
                };
                let session = ChannelSession::new(profile_id, &state.sessions);
                state.sessions.push(session.clone());
                Ok(session)
            })
            .await?;
        metrics::counter!("autopilot_channels_created_total").increment(1);
        tracing::info!(channel = %created.id, "channel created");
        Ok(created)
    }

    pub async fn delete_channel(&self, id: &str) -> Result<ChannelSession, StoreError> {
        let removed = self
            .mutate(|state| {
                let idx = state
                    .sessions
                    .iter()
                    .position(|s| s.id == id)
                    .ok_or_else(|| StoreError::ChannelNotFound(id.to_string()))?;
                Ok(state.sessions.remove(idx))
            })
            .await?;
        tracing::info!(channel = %id, "channel deleted");
        Ok(removed)
    }

    pub async fn set_status(&self, id: &str, status: ChannelStatus) -> Result<bool, StoreError> {
        self.mutate(|state| Ok(state.session_mut(id)?.transition(status))).await
    }

    pub async fn connect(&self, id: &str) -> Result<bool, StoreError> {
        self.set_status(id, ChannelStatus::Connected).await
    }

    pub async fn disconnect(&self, id: &str) -> Result<bool, StoreError> {
        self.set_status(id, ChannelStatus::Disconnected).await
    }

    pub async fn assign_profile(&self, id: &str, profile_id: &str) -> Result<ChannelSession, StoreError> {
        self.mutate(|state| {
            if !state.profiles.iter().any(|p| p.id == profile_id) {
                return Err(StoreError::ProfileNotFound(profile_id.to_string()));
            }
            let session = state.session_mut(id)?;
            session.ai_profile_id = profile_id.to_string();
            Ok(session.clone())
        })
        .await
    }

    pub async fn append_inbound(&self, id: &str, sender_name: &str, text: &str) -> Result<Appended, StoreError> {
        self.append(id, Direction::Inbound, sender_name, text, true).await
    }

    pub async fn append_outbound(&self, id: &str, sender_name: &str, text: &str) -> Result<Appended, StoreError> {
        self.append(id, Direction::Outbound, sender_name, text, false).await
    }

    // stamped under the write lock; a failed write keeps the message in memory
    async fn append(
        &self,
        id: &str,
        direction: Direction,
        sender_name: &str,
        text: &str,
        connected_only: bool,
    ) -> Result<Appended, StoreError> {
        let mut recorded = None;
        let res = self
            .mutate(|state| {
                let session = state.session_mut(id)?;
                if connected_only && !session.is_connected() {
                    return Err(StoreError::ChannelNotConnected(id.to_string()));
                }
                let message = session.record(direction, sender_name, text);
                recorded = Some((message, session.ai_profile_id.clone()));
                Ok(())
            })
            .await;
        let persisted = match res {
            Ok(()) => true,
            Err(StoreError::Persist(_)) => false,
            Err(e) => return Err(e),
        };
        let (message, profile_id) = recorded.ok_or_else(|| StoreError::ChannelNotFound(id.to_string()))?;
        Ok(Appended { message, profile_id, persisted })
    }

    pub async fn clear_messages(&self, id: &str) -> Result<usize, StoreError> {
        self.mutate(|state| Ok(state.session_mut(id)?.clear_messages())).await
    }

    pub async fn stats(&self) -> DashboardStats {
        let state = self.state.read().await;
        DashboardStats {
            channels: state.sessions.len(),
            connected: state.sessions.iter().filter(|s| s.is_connected()).count(),
            messages: state.sessions.iter().map(|s| s.messages.len()).sum(),
            revision: self.revision(),
        }
    }
}

async fn read_collection<T: DeserializeOwned>(kv: &dyn KeyValueStore, key: &str) -> Option<Vec<T>> {
    let raw = match kv.get(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(key, error = %e, "reading stored collection failed, using defaults");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(items) => Some(items),
        Err(e) => {
            tracing::warn!(key, error = %e, "stored collection is corrupt, using defaults");
            None
        }
    }
}
