//! Streaming Audio Session Bus (spec §2 leaf #6, §4.4).
//!
//! AudioBus owns the per-session connection registry and the topic
//! segment tables; it does *not* own sessions (read-through the
//! [`crate::session::SessionStore`]) and does not itself speak TTS — it
//! delegates audio generation to a [`SessionCache`] collaborator.
//!
//! Grounded on the teacher's `queue/monitor.rs` `WorkerStatusType`
//! pattern for the tagged-enum message taxonomy, and on the
//! `Arc<RwLock<HashMap<..>>>` registry shape used throughout
//! `queue/mod.rs` for the connection/topic registries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::clock::Clock;
use crate::error::ControlPlaneError;
use crate::idle::IdleMgr;
use crate::protocol::{PlaybackState, SessionId, TopicSegmentTable, VoiceConfig};
use crate::session::SessionStore;

/// Default prefetch window `K` (spec §4.4 "K default 2").
pub const DEFAULT_PREFETCH_WINDOW: usize = 2;

// ---------------------------------------------------------------------
// Message taxonomy
// ---------------------------------------------------------------------

/// Inbound messages, tagged by `type` (spec §4.4 message taxonomy).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioBusMessage {
    RequestAudio {
        segment_index: i64,
    },
    Sync {
        segment_index: i64,
        offset_ms: u64,
        is_playing: bool,
    },
    BargeIn {
        segment_index: i64,
        offset_ms: u64,
    },
    VoiceConfig {
        #[serde(default)]
        voice_id: Option<String>,
        #[serde(default)]
        tts_provider: Option<String>,
        #[serde(default)]
        speed: Option<f32>,
        #[serde(flatten)]
        extra: HashMap<String, serde_json::Value>,
    },
    SetTopic {
        #[serde(default)]
        curriculum_id: Option<String>,
        #[serde(default)]
        topic_id: Option<String>,
    },
}

/// Outbound messages, tagged by `type`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioBusEvent {
    Audio {
        segment_index: u32,
        audio_base64: String,
        duration_seconds: f64,
        total_segments: usize,
        cache_hit: bool,
    },
    SyncAck {
        segment_index: i64,
        server_time: chrono::DateTime<chrono::Utc>,
    },
    BargeInAck {
        segment_index: i64,
        offset_ms: u64,
    },
    VoiceConfigAck {
        voice_config: VoiceConfig,
    },
    TopicSet {
        total_segments: usize,
    },
    Error {
        error: String,
    },
}

// ---------------------------------------------------------------------
// Collaborators: outbound channel, session cache
// ---------------------------------------------------------------------

/// The duplex transport a connected client speaks over. AudioBus is
/// transport-agnostic; WebSocket framing, if any, lives on the other
/// side of this trait (non-goal, spec §9).
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Sends one event; returns `false` if the channel is already closed.
    async fn send(&self, event: AudioBusEvent) -> bool;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Generated audio for one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub audio_base64: String,
    pub duration_seconds: f64,
    pub cache_hit: bool,
}

/// Per-session audio generation/caching collaborator. AudioBus looks up
/// segment text from its own topic table and hands it to this trait
/// rather than owning the TTS pipeline itself (non-goal, spec §9).
///
/// Method names are grounded on `test_audio_ws.py`'s `MockSessionCache`.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn get_audio_for_segment(
        &self,
        curriculum_id: &str,
        topic_id: &str,
        segment_index: u32,
        text: &str,
    ) -> Result<AudioSegment, ControlPlaneError>;

    /// Best-effort; failures are logged by the caller, never surfaced.
    async fn prefetch_upcoming(
        &self,
        curriculum_id: &str,
        topic_id: &str,
        indices: &[(u32, String)],
    ) -> Result<(), ControlPlaneError>;
}

/// In-memory stand-in for a real TTS cache, useful for tests and for
/// `--mock` CLI runs. Synthesizes deterministic "audio" from segment
/// text so tests can assert on content without a real provider.
#[derive(Default)]
pub struct MockSessionCache {
    generated: RwLock<HashMap<(String, String, u32), String>>,
}

impl MockSessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn synthesize(text: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(text.as_bytes())
    }
}

use base64::Engine as _;

#[async_trait]
impl SessionCache for MockSessionCache {
    async fn get_audio_for_segment(
        &self,
        curriculum_id: &str,
        topic_id: &str,
        segment_index: u32,
        text: &str,
    ) -> Result<AudioSegment, ControlPlaneError> {
        let key = (curriculum_id.to_string(), topic_id.to_string(), segment_index);
        let mut generated = self.generated.write().await;
        let cache_hit = generated.contains_key(&key);
        let audio_base64 = generated
            .entry(key)
            .or_insert_with(|| Self::synthesize(text))
            .clone();
        Ok(AudioSegment {
            duration_seconds: (text.len() as f64 / 15.0).max(0.1),
            audio_base64,
            cache_hit,
        })
    }

    async fn prefetch_upcoming(
        &self,
        curriculum_id: &str,
        topic_id: &str,
        indices: &[(u32, String)],
    ) -> Result<(), ControlPlaneError> {
        let mut generated = self.generated.write().await;
        for (segment_index, text) in indices {
            let key = (curriculum_id.to_string(), topic_id.to_string(), *segment_index);
            generated.entry(key).or_insert_with(|| Self::synthesize(text));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// AudioBus
// ---------------------------------------------------------------------

/// The Streaming Audio Session Bus.
///
/// Clone is cheap (all state lives behind `Arc`s); every clone shares
/// the same connection registry, topic table and in-flight prefetch
/// set.
#[derive(Clone)]
pub struct AudioBus {
    inner: Arc<AudioBusInner>,
}

struct AudioBusInner {
    connections: RwLock<HashMap<SessionId, Arc<dyn OutboundChannel>>>,
    session_locks: RwLock<HashMap<SessionId, Arc<Mutex<()>>>>,
    prefetch_tasks: RwLock<HashMap<SessionId, JoinHandle<()>>>,
    topics: RwLock<HashMap<(String, String), TopicSegmentTable>>,
    session_store: Arc<dyn SessionStore>,
    cache: Arc<dyn SessionCache>,
    idle: Arc<IdleMgr>,
    clock: Arc<dyn Clock>,
    prefetch_window: usize,
}

impl AudioBus {
    pub fn new(
        session_store: Arc<dyn SessionStore>,
        cache: Arc<dyn SessionCache>,
        idle: Arc<IdleMgr>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(AudioBusInner {
                connections: RwLock::new(HashMap::new()),
                session_locks: RwLock::new(HashMap::new()),
                prefetch_tasks: RwLock::new(HashMap::new()),
                topics: RwLock::new(HashMap::new()),
                session_store,
                cache,
                idle,
                clock,
                prefetch_window: DEFAULT_PREFETCH_WINDOW,
            }),
        }
    }

    pub fn with_prefetch_window(mut self, window: usize) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_prefetch_window must run before cloning")
            .prefetch_window = window;
        self
    }

    /// Publishes (or replaces) the segment table for a `(curriculum_id,
    /// topic_id)` pair. Topic tables are read-mostly once published
    /// (spec §5 shared-resource policy).
    pub async fn publish_topic(&self, table: TopicSegmentTable) {
        let key = (table.curriculum_id.clone(), table.topic_id.clone());
        self.inner.topics.write().await.insert(key, table);
    }

    // -- connection registry --------------------------------------------

    /// Inserts a connection if absent, else replaces it after closing
    /// the prior channel (spec §4.4 "last-writer-wins").
    pub async fn open(&self, session_id: impl Into<String>, channel: Arc<dyn OutboundChannel>) {
        let session_id = session_id.into();
        let prior = self.inner.connections.write().await.insert(session_id, channel);
        if let Some(prior) = prior {
            prior.close().await;
        }
    }

    /// Idempotent.
    pub async fn close(&self, session_id: &str) {
        if let Some(channel) = self.inner.connections.write().await.remove(session_id) {
            channel.close().await;
        }
        if let Some(handle) = self.inner.prefetch_tasks.write().await.remove(session_id) {
            handle.abort();
        }
    }

    /// Returns true iff the channel exists and the send succeeds; closed
    /// or failed channels are pruned lazily (spec §4.4).
    pub async fn broadcast_to_session(&self, session_id: &str, event: AudioBusEvent) -> bool {
        let channel = self.inner.connections.read().await.get(session_id).cloned();
        let Some(channel) = channel else {
            return false;
        };
        if channel.is_closed() {
            self.inner.connections.write().await.remove(session_id);
            return false;
        }
        let delivered = channel.send(event).await;
        if !delivered {
            self.inner.connections.write().await.remove(session_id);
        }
        delivered
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.inner.session_locks.read().await.get(session_id) {
            return Arc::clone(lock);
        }
        let mut locks = self.inner.session_locks.write().await;
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    // -- message dispatch -------------------------------------------------

    /// Handles one inbound message for `session_id`. Always records
    /// activity and always returns an event — `AudioBusEvent::Error` in
    /// lieu of the normal ack when the handler fails or preconditions
    /// are violated (spec §4.4).
    ///
    /// Concurrent calls for the same `session_id` are serialised by a
    /// per-session mutex; different sessions proceed in parallel (spec
    /// §5).
    pub async fn handle_message(
        &self,
        session_id: &str,
        user_id: &str,
        message: AudioBusMessage,
    ) -> AudioBusEvent {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        self.inner.idle.record_activity("audio_ws", session_id).await;

        if let Err(e) = self.inner.session_store.create_session(session_id, user_id).await {
            return AudioBusEvent::Error { error: e.to_string() };
        }

        match self.dispatch(session_id, message).await {
            Ok(event) => event,
            Err(e) => AudioBusEvent::Error { error: e.to_string() },
        }
    }

    async fn dispatch(
        &self,
        session_id: &str,
        message: AudioBusMessage,
    ) -> Result<AudioBusEvent, ControlPlaneError> {
        match message {
            AudioBusMessage::RequestAudio { segment_index } => {
                self.handle_request_audio(session_id, segment_index).await
            }
            AudioBusMessage::Sync {
                segment_index,
                offset_ms,
                is_playing,
            } => self.handle_sync(session_id, segment_index, offset_ms, is_playing).await,
            AudioBusMessage::BargeIn { segment_index, offset_ms } => {
                self.handle_barge_in(session_id, segment_index, offset_ms).await
            }
            AudioBusMessage::VoiceConfig {
                voice_id,
                tts_provider,
                speed,
                extra,
            } => {
                self.handle_voice_config(session_id, voice_id, tts_provider, speed, extra)
                    .await
            }
            AudioBusMessage::SetTopic { curriculum_id, topic_id } => {
                self.handle_set_topic(session_id, curriculum_id, topic_id).await
            }
        }
    }

    async fn current_session(&self, session_id: &str) -> Result<crate::protocol::UserSession, ControlPlaneError> {
        self.inner
            .session_store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ControlPlaneError::internal("session vanished mid-dispatch"))
    }

    async fn handle_request_audio(
        &self,
        session_id: &str,
        segment_index: i64,
    ) -> Result<AudioBusEvent, ControlPlaneError> {
        let session = self.current_session(session_id).await?;
        let (curriculum_id, topic_id) = match (&session.playback.curriculum_id, &session.playback.topic_id) {
            (Some(c), Some(t)) => (c.clone(), t.clone()),
            _ => {
                return Err(ControlPlaneError::precondition_violated(
                    "request_audio requires a bound topic",
                ))
            }
        };
        let table = self
            .inner
            .topics
            .read()
            .await
            .get(&(curriculum_id.clone(), topic_id.clone()))
            .cloned()
            .ok_or_else(ControlPlaneError::no_segments_found)?;
        let total = table.total_segments();
        if segment_index < 0 || segment_index as usize >= total {
            return Err(ControlPlaneError::precondition_violated(format!(
                "segment_index {segment_index} out of bounds [0, {total})"
            )));
        }
        let segment_index = segment_index as u32;
        let text = table.segments[segment_index as usize].clone();
        let audio = self
            .inner
            .cache
            .get_audio_for_segment(&curriculum_id, &topic_id, segment_index, &text)
            .await?;

        let mut playback = session.playback;
        playback.segment_index = segment_index;
        playback.offset_ms = 0;
        playback.is_playing = true;
        self.inner.session_store.update_playback(session_id, playback).await?;

        self.spawn_prefetch(session_id, curriculum_id, topic_id, segment_index, total, &table)
            .await;

        Ok(AudioBusEvent::Audio {
            segment_index,
            audio_base64: audio.audio_base64,
            duration_seconds: audio.duration_seconds,
            total_segments: total,
            cache_hit: audio.cache_hit,
        })
    }

    async fn spawn_prefetch(
        &self,
        session_id: &str,
        curriculum_id: String,
        topic_id: String,
        current: u32,
        total: usize,
        table: &TopicSegmentTable,
    ) {
        let mut tasks = self.inner.prefetch_tasks.write().await;
        if let Some(prev) = tasks.remove(session_id) {
            prev.abort();
        }

        if total == 0 {
            return;
        }
        let upper = (current as usize + self.inner.prefetch_window).min(total - 1);
        let indices: Vec<(u32, String)> = ((current as usize + 1)..=upper)
            .filter(|&i| i < total)
            .map(|i| (i as u32, table.segments[i].clone()))
            .collect();
        if indices.is_empty() {
            return;
        }

        let cache = Arc::clone(&self.inner.cache);
        let session_id_owned = session_id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = cache.prefetch_upcoming(&curriculum_id, &topic_id, &indices).await {
                warn!(session_id = %session_id_owned, error = %e, "prefetch failed");
            }
        });
        tasks.insert(session_id.to_string(), handle);
    }

    async fn handle_sync(
        &self,
        session_id: &str,
        segment_index: i64,
        offset_ms: u64,
        is_playing: bool,
    ) -> Result<AudioBusEvent, ControlPlaneError> {
        if segment_index < 0 {
            return Err(ControlPlaneError::invalid_argument("segment_index must be >= 0"));
        }
        let session = self.current_session(session_id).await?;
        let mut playback = session.playback;
        playback.segment_index = segment_index as u32;
        playback.offset_ms = offset_ms;
        playback.is_playing = is_playing;
        self.inner.session_store.update_playback(session_id, playback).await?;
        Ok(AudioBusEvent::SyncAck {
            segment_index,
            server_time: self.inner.clock.now_utc(),
        })
    }

    async fn handle_barge_in(
        &self,
        session_id: &str,
        segment_index: i64,
        offset_ms: u64,
    ) -> Result<AudioBusEvent, ControlPlaneError> {
        if segment_index < 0 {
            return Err(ControlPlaneError::invalid_argument("segment_index must be >= 0"));
        }
        let session = self.current_session(session_id).await?;
        let mut playback = session.playback;
        playback.segment_index = segment_index as u32;
        playback.offset_ms = offset_ms;
        playback.is_playing = false;
        self.inner.session_store.update_playback(session_id, playback).await?;
        Ok(AudioBusEvent::BargeInAck { segment_index, offset_ms })
    }

    async fn handle_voice_config(
        &self,
        session_id: &str,
        voice_id: Option<String>,
        tts_provider: Option<String>,
        speed: Option<f32>,
        extra: HashMap<String, serde_json::Value>,
    ) -> Result<AudioBusEvent, ControlPlaneError> {
        let session = self.current_session(session_id).await?;
        let mut voice_config = session.voice_config;
        if let Some(voice_id) = voice_id {
            voice_config.voice_id = voice_id;
        }
        if let Some(tts_provider) = tts_provider {
            voice_config.tts_provider = tts_provider;
        }
        if let Some(speed) = speed {
            if !(VoiceConfig::MIN_SPEED..=VoiceConfig::MAX_SPEED).contains(&speed) {
                return Err(ControlPlaneError::invalid_argument(format!(
                    "speed must be within [{}, {}]",
                    VoiceConfig::MIN_SPEED,
                    VoiceConfig::MAX_SPEED
                )));
            }
            voice_config.speed = speed;
        }
        for (key, value) in extra {
            voice_config.extra.insert(key, value);
        }
        self.inner
            .session_store
            .update_voice_config(session_id, voice_config.clone())
            .await?;
        Ok(AudioBusEvent::VoiceConfigAck { voice_config })
    }

    async fn handle_set_topic(
        &self,
        session_id: &str,
        curriculum_id: Option<String>,
        topic_id: Option<String>,
    ) -> Result<AudioBusEvent, ControlPlaneError> {
        let (curriculum_id, topic_id) = match (curriculum_id, topic_id) {
            (Some(c), Some(t)) if !c.is_empty() && !t.is_empty() => (c, t),
            _ => {
                return Err(ControlPlaneError::precondition_violated(
                    "set_topic requires both curriculum_id and topic_id",
                ))
            }
        };
        let table = self
            .inner
            .topics
            .read()
            .await
            .get(&(curriculum_id.clone(), topic_id.clone()))
            .cloned()
            .ok_or_else(ControlPlaneError::no_segments_found)?;

        let session = self.current_session(session_id).await?;
        let mut playback: PlaybackState = session.playback;
        playback.curriculum_id = Some(curriculum_id);
        playback.topic_id = Some(topic_id);
        // segment_index and is_playing are left untouched (spec §4.4
        // "does not reset segment_index").
        self.inner.session_store.update_playback(session_id, playback).await?;

        Ok(AudioBusEvent::TopicSet {
            total_segments: table.total_segments(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::session::InMemorySessionStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingChannel {
        events: TokioMutex<Vec<AudioBusEvent>>,
        closed: AtomicBool,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: TokioMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl OutboundChannel for RecordingChannel {
        async fn send(&self, event: AudioBusEvent) -> bool {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            self.events.lock().await.push(event);
            true
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn make_bus() -> AudioBus {
        let idle = IdleMgr::new(SystemClock::new().into_arc());
        AudioBus::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(MockSessionCache::new()),
            Arc::new(idle),
            SystemClock::new().into_arc(),
        )
    }

    fn sample_table() -> TopicSegmentTable {
        TopicSegmentTable {
            curriculum_id: "curr-1".to_string(),
            topic_id: "topic-1".to_string(),
            segments: vec![
                "segment zero".to_string(),
                "segment one".to_string(),
                "segment two".to_string(),
            ],
        }
    }

    #[tokio::test]
    async fn set_topic_requires_both_ids() {
        let bus = make_bus();
        let event = bus
            .handle_message(
                "s1",
                "u1",
                AudioBusMessage::SetTopic {
                    curriculum_id: Some("curr-1".to_string()),
                    topic_id: None,
                },
            )
            .await;
        assert!(matches!(event, AudioBusEvent::Error { .. }));
    }

    #[tokio::test]
    async fn set_topic_unknown_topic_yields_no_segments_found() {
        let bus = make_bus();
        let event = bus
            .handle_message(
                "s1",
                "u1",
                AudioBusMessage::SetTopic {
                    curriculum_id: Some("curr-1".to_string()),
                    topic_id: Some("missing".to_string()),
                },
            )
            .await;
        match event {
            AudioBusEvent::Error { error } => assert!(error.contains("no_segments_found")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_audio_without_topic_is_precondition_violated() {
        let bus = make_bus();
        let event = bus
            .handle_message("s1", "u1", AudioBusMessage::RequestAudio { segment_index: 0 })
            .await;
        match event {
            AudioBusEvent::Error { error } => assert!(error.contains("precondition_violated")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_audio_boundary_segment_succeeds_total_fails() {
        let bus = make_bus();
        bus.publish_topic(sample_table()).await;
        bus.handle_message(
            "s1",
            "u1",
            AudioBusMessage::SetTopic {
                curriculum_id: Some("curr-1".to_string()),
                topic_id: Some("topic-1".to_string()),
            },
        )
        .await;

        let ok = bus
            .handle_message("s1", "u1", AudioBusMessage::RequestAudio { segment_index: 2 })
            .await;
        assert!(matches!(ok, AudioBusEvent::Audio { segment_index: 2, .. }));

        let oob = bus
            .handle_message("s1", "u1", AudioBusMessage::RequestAudio { segment_index: 3 })
            .await;
        match oob {
            AudioBusEvent::Error { error } => assert!(error.contains("precondition_violated")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn barge_in_during_playback_stops_and_acks_offset() {
        let bus = make_bus();
        bus.publish_topic(sample_table()).await;
        bus.handle_message(
            "s1",
            "u1",
            AudioBusMessage::SetTopic {
                curriculum_id: Some("curr-1".to_string()),
                topic_id: Some("topic-1".to_string()),
            },
        )
        .await;
        bus.handle_message("s1", "u1", AudioBusMessage::RequestAudio { segment_index: 0 })
            .await;

        let ack = bus
            .handle_message(
                "s1",
                "u1",
                AudioBusMessage::BargeIn {
                    segment_index: 0,
                    offset_ms: 1500,
                },
            )
            .await;
        assert_eq!(
            ack,
            AudioBusEvent::BargeInAck {
                segment_index: 0,
                offset_ms: 1500
            }
        );

        let session = bus
            .inner
            .session_store
            .get_session("s1")
            .await
            .unwrap()
            .unwrap();
        assert!(!session.playback.is_playing);
        assert_eq!(session.playback.offset_ms, 1500);
    }

    #[tokio::test]
    async fn voice_config_merges_non_null_fields_only() {
        let bus = make_bus();
        bus.handle_message("s1", "u1", AudioBusMessage::RequestAudio { segment_index: 0 })
            .await;

        let ack = bus
            .handle_message(
                "s1",
                "u1",
                AudioBusMessage::VoiceConfig {
                    voice_id: Some("voice-xyz".to_string()),
                    tts_provider: None,
                    speed: Some(1.5),
                    extra: HashMap::new(),
                },
            )
            .await;
        match ack {
            AudioBusEvent::VoiceConfigAck { voice_config } => {
                assert_eq!(voice_config.voice_id, "voice-xyz");
                assert_eq!(voice_config.tts_provider, "default");
                assert_eq!(voice_config.speed, 1.5);
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn voice_config_rejects_out_of_range_speed() {
        let bus = make_bus();
        let event = bus
            .handle_message(
                "s1",
                "u1",
                AudioBusMessage::VoiceConfig {
                    voice_id: None,
                    tts_provider: None,
                    speed: Some(10.0),
                    extra: HashMap::new(),
                },
            )
            .await;
        assert!(matches!(event, AudioBusEvent::Error { .. }));
    }

    #[tokio::test]
    async fn open_replaces_and_closes_prior_channel() {
        let bus = make_bus();
        let first = RecordingChannel::new();
        let second = RecordingChannel::new();
        bus.open("s1", first.clone() as Arc<dyn OutboundChannel>).await;
        bus.open("s1", second.clone() as Arc<dyn OutboundChannel>).await;
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn broadcast_delivers_and_close_is_idempotent() {
        let bus = make_bus();
        let channel = RecordingChannel::new();
        bus.open("s1", channel.clone() as Arc<dyn OutboundChannel>).await;

        let delivered = bus
            .broadcast_to_session("s1", AudioBusEvent::TopicSet { total_segments: 3 })
            .await;
        assert!(delivered);
        assert_eq!(channel.events.lock().await.len(), 1);

        bus.close("s1").await;
        bus.close("s1").await; // idempotent

        let delivered_after_close = bus
            .broadcast_to_session("s1", AudioBusEvent::TopicSet { total_segments: 3 })
            .await;
        assert!(!delivered_after_close);
    }

    #[tokio::test]
    async fn unknown_message_type_does_not_panic_on_missing_session_playback() {
        let bus = make_bus();
        let event = bus
            .handle_message(
                "s1",
                "u1",
                AudioBusMessage::Sync {
                    segment_index: 0,
                    offset_ms: 0,
                    is_playing: true,
                },
            )
            .await;
        assert!(matches!(event, AudioBusEvent::SyncAck { .. }));
    }
}
