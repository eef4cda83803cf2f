//! Session Store interface (spec §2 leaf #3, §3 `UserSession` row).
//!
//! AudioBus reads and mutates sessions through this trait rather than
//! owning them (spec §3 Ownership: "it does *not* own sessions
//! (read-through the Session Store)"). Shaped after the same
//! trait-over-`Arc<RwLock<HashMap<..>>>` pattern as [`crate::storage`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::ControlPlaneError;
use crate::protocol::{PlaybackState, SessionId, UserSession, VoiceConfig};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, session_id: &str) -> Result<Option<UserSession>, ControlPlaneError>;

    /// Creates a session if absent; returns the existing one otherwise
    /// (idempotent by `session_id`, spec §3 invariant "session_id unique").
    async fn create_session(&self, session_id: &str, user_id: &str) -> Result<UserSession, ControlPlaneError>;

    async fn update_playback(
        &self,
        session_id: &str,
        playback: PlaybackState,
    ) -> Result<(), ControlPlaneError>;

    async fn update_voice_config(
        &self,
        session_id: &str,
        voice_config: VoiceConfig,
    ) -> Result<(), ControlPlaneError>;
}

/// Reference implementation; the role `MemoryStorage` plays for
/// `Storage`.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, UserSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_session(&self, session_id: &str) -> Result<Option<UserSession>, ControlPlaneError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn create_session(&self, session_id: &str, user_id: &str) -> Result<UserSession, ControlPlaneError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            return Ok(existing.clone());
        }
        let session = UserSession::new(session_id, user_id);
        sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    async fn update_playback(
        &self,
        session_id: &str,
        playback: PlaybackState,
    ) -> Result<(), ControlPlaneError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| ControlPlaneError::invalid_argument(format!("no session {session_id}")))?;
        session.playback = playback;
        Ok(())
    }

    async fn update_voice_config(
        &self,
        session_id: &str,
        voice_config: VoiceConfig,
    ) -> Result<(), ControlPlaneError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| ControlPlaneError::invalid_argument(format!("no session {session_id}")))?;
        session.voice_config = voice_config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_session_is_idempotent() {
        let store = InMemorySessionStore::new();
        let first = store.create_session("s1", "u1").await.unwrap();
        let second = store.create_session("s1", "u1").await.unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(store.get_session("s1").await.unwrap().unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn update_playback_mutates_existing_session_only() {
        let store = InMemorySessionStore::new();
        store.create_session("s1", "u1").await.unwrap();
        let mut playback = PlaybackState::default();
        playback.segment_index = 3;
        playback.is_playing = true;
        store.update_playback("s1", playback.clone()).await.unwrap();

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.playback.segment_index, 3);
        assert!(session.playback.is_playing);

        assert!(store
            .update_playback("missing", PlaybackState::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn update_voice_config_merges_entire_struct() {
        let store = InMemorySessionStore::new();
        store.create_session("s1", "u1").await.unwrap();
        let config = VoiceConfig {
            voice_id: "v2".to_string(),
            tts_provider: "provider-x".to_string(),
            speed: 1.5,
            extra: Default::default(),
        };
        store.update_voice_config("s1", config.clone()).await.unwrap();
        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.voice_config.voice_id, "v2");
        assert_eq!(session.voice_config.speed, 1.5);
    }
}
