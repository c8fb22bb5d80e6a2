//! Session context and instance registry.
//!
//! A [`ChatSession`] is everything one logged-in user needs: the transport,
//! the coordinator and the pump that feeds it. The [`InstanceRegistry`]
//! builds the session for the authenticated role and tears it down on logout.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use carelink_common::config::AppConfig;
use carelink_common::session::SessionUser;
use carelink_common::store::{JsonFileStore, LocalStore};

use crate::coordinator::{Completion, CoordinatorDeps, GroupCoordinator, policy_for};
use crate::error::{ChatError, Result};
use crate::events::{EventBus, GroupEvent};
use crate::protocol::TransportEvent;
use crate::rest::{ChatApi, RestClient};
use crate::transport::{ChatTransport, TransportClient};

/// One running chat session.
///
/// The coordinator sits behind a mutex: the pump and UI intents take turns,
/// and each handler runs to completion before the next one starts.
pub struct ChatSession {
    user: SessionUser,
    coordinator: Arc<Mutex<GroupCoordinator>>,
    transport: Arc<dyn ChatTransport>,
    bus: EventBus,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl ChatSession {
    /// Wire up the pump and open the transport.
    pub async fn start(mut coordinator: GroupCoordinator) -> Result<Self> {
        let completions = coordinator
            .take_completions()
            .ok_or_else(|| ChatError::Other("coordinator is already attached to a session".into()))?;
        let user = coordinator.user().clone();
        let transport = coordinator.transport();
        let bus = coordinator.bus().clone();
        // Take the feed before connecting so `Connected` is never missed.
        let events = transport.feed();

        let coordinator = Arc::new(Mutex::new(coordinator));
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump(
            Arc::clone(&coordinator),
            events,
            completions,
            cancel.clone(),
        ));

        let session = Self {
            user,
            coordinator,
            transport,
            bus,
            cancel,
            pump: Some(pump),
        };
        session.coordinator.lock().await.launch().await?;
        info!(user_id = %session.user.user_id, role = %session.user.role, "Chat session started");
        Ok(session)
    }

    pub fn user(&self) -> &SessionUser {
        &self.user
    }

    pub fn coordinator(&self) -> &Arc<Mutex<GroupCoordinator>> {
        &self.coordinator
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.bus.subscribe()
    }

    /// Stop the pump, then clear the coordinator and close the transport.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                warn!(error = %e, "Session pump ended abnormally");
            }
        }
        self.coordinator.lock().await.destroy();
        info!(user_id = %self.user.user_id, "Chat session closed");
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.transport.destroy();
    }
}

async fn pump(
    coordinator: Arc<Mutex<GroupCoordinator>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => coordinator.lock().await.handle_event(event),
                None => break,
            },
            Some(completion) = completions.recv() => {
                coordinator.lock().await.handle_completion(completion);
            }
        }
    }
    debug!("Session pump exited");
}

/// Owns at most one [`ChatSession`] at a time.
pub struct InstanceRegistry {
    config: AppConfig,
    store: Arc<dyn LocalStore>,
    session: Option<ChatSession>,
}

impl InstanceRegistry {
    pub fn new(config: AppConfig, store: Arc<dyn LocalStore>) -> Self {
        Self {
            config,
            store,
            session: None,
        }
    }

    /// Registry backed by the JSON file at `storage.path`.
    pub fn open(config: AppConfig) -> Result<Self> {
        let store = JsonFileStore::open(&config.storage.path)?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn session(&self) -> Option<&ChatSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// The running session, built for `user` on first use.
    ///
    /// A session owned by a different user is shut down first. Roles
    /// without chat access fail before anything is connected.
    pub async fn get_or_create(&mut self, user: SessionUser) -> Result<&ChatSession> {
        let session = match self.session.take() {
            Some(existing) if existing.user().is_me(&user.user_id) => existing,
            Some(existing) => {
                info!(
                    previous = %existing.user().user_id,
                    next = %user.user_id,
                    "Replacing chat session for a different user"
                );
                existing.shutdown().await;
                self.build(user).await?
            }
            None => self.build(user).await?,
        };
        let session: &ChatSession = self.session.insert(session);
        Ok(session)
    }

    /// Destroy the running session, if any, and forget it.
    pub async fn release(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown().await;
        }
    }

    async fn build(&self, user: SessionUser) -> Result<ChatSession> {
        let policy = policy_for(user.role)?;
        let user = Arc::new(user);
        let transport: Arc<dyn ChatTransport> = Arc::new(TransportClient::new(
            self.config.chat.clone(),
            user.user_id.clone(),
        ));
        let api: Arc<dyn ChatApi> = Arc::new(RestClient::new(
            &self.config.api,
            user.access_token.as_deref(),
        )?);

        let coordinator = GroupCoordinator::new(CoordinatorDeps {
            user,
            policy,
            transport,
            api,
            store: Arc::clone(&self.store),
            bus: EventBus::new(self.config.chat.event_buffer),
            offset: self.config.display.offset(),
            page_size: self.config.api.page_size,
        });
        ChatSession::start(coordinator).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use carelink_common::config::TransportKind;
    use carelink_common::error::CareLinkError;
    use carelink_common::session::UserRole;
    use carelink_common::store::{MemoryStore, keys};

    use carelink_common::models::ChannelSummary;

    use crate::channel::tests::{at, message};
    use crate::protocol::{MessageBatch, OutboundEvent};
    use crate::testing::{FakeApi, FakeTransport};

    fn offline_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.chat.url = "ws://127.0.0.1:1".into();
        config.chat.transports = vec![TransportKind::WebSocket];
        config.chat.reconnection = false;
        config
    }

    fn registry() -> InstanceRegistry {
        InstanceRegistry::new(offline_config(), Arc::new(MemoryStore::new()))
    }

    fn user(id: &str, role: UserRole) -> SessionUser {
        SessionUser::new(id, format!("{id}@care"), id.to_uppercase(), role)
    }

    async fn next_event(events: &mut broadcast::Receiver<GroupEvent>) -> GroupEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_role_is_rejected() {
        let mut registry = registry();
        let err = registry.get_or_create(user("root", UserRole::Admin)).await.err().unwrap();
        assert!(matches!(err, ChatError::Common(CareLinkError::UnknownRole { .. })));
        assert!(!registry.is_active());
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_session() {
        let mut registry = registry();
        let first = Arc::clone(
            registry
                .get_or_create(user("u-1", UserRole::User))
                .await
                .unwrap()
                .coordinator(),
        );
        let second = Arc::clone(
            registry
                .get_or_create(user("u-1", UserRole::User))
                .await
                .unwrap()
                .coordinator(),
        );
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().await.policy().role(), UserRole::User);
    }

    #[tokio::test]
    async fn test_other_user_replaces_session() {
        let mut registry = registry();
        let first = Arc::clone(
            registry
                .get_or_create(user("u-1", UserRole::User))
                .await
                .unwrap()
                .transport(),
        );
        let session = registry
            .get_or_create(user("m-1", UserRole::Manager))
            .await
            .unwrap();
        assert_eq!(session.user().user_id, "m-1");
        assert_eq!(session.coordinator().lock().await.policy().role(), UserRole::Manager);
        assert!(!first.is_connected());
    }

    #[tokio::test]
    async fn test_release_clears_session_and_group() {
        let store = Arc::new(MemoryStore::new());
        store.set(keys::CURRENT_GROUP, "g-1").unwrap();
        let mut registry = InstanceRegistry::new(offline_config(), store.clone());

        registry.get_or_create(user("u-1", UserRole::UserDevice)).await.unwrap();
        assert!(registry.is_active());

        registry.release().await;
        assert!(!registry.is_active());
        assert!(registry.session().is_none());
        assert_eq!(store.get(keys::CURRENT_GROUP), None);

        // Releasing twice is harmless.
        registry.release().await;
    }

    #[tokio::test]
    async fn test_open_uses_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = offline_config();
        config.storage.path = dir.path().join("state.json").display().to_string();

        let registry = InstanceRegistry::open(config).unwrap();
        registry.store().set(keys::CURRENT_GROUP, "g-3").unwrap();
        assert!(dir.path().join("state.json").exists());
    }

    fn fake_session_parts() -> (Arc<FakeTransport>, GroupCoordinator) {
        let transport = Arc::new(FakeTransport::new());
        let user = Arc::new(user("me", UserRole::User));
        let coordinator = GroupCoordinator::new(CoordinatorDeps {
            policy: policy_for(user.role).unwrap(),
            user,
            transport: transport.clone(),
            api: Arc::new(FakeApi::default()),
            store: Arc::new(MemoryStore::new()),
            bus: EventBus::new(64),
            offset: chrono::FixedOffset::east_opt(0).unwrap(),
            page_size: 30,
        });
        (transport, coordinator)
    }

    #[tokio::test]
    async fn test_pump_feeds_transport_events_and_completions() {
        let (transport, coordinator) = fake_session_parts();
        let session = ChatSession::start(coordinator).await.unwrap();
        let mut events = session.subscribe();
        assert_eq!(transport.connects(), 1);

        transport.inject(TransportEvent::Connected);
        assert_eq!(next_event(&mut events).await, GroupEvent::LoadStart);
        assert_eq!(transport.emitted_of(OutboundEvent::InitChannel).len(), 1);

        transport.inject(TransportEvent::InitChannelComplete(Vec::new()));
        assert_eq!(
            next_event(&mut events).await,
            GroupEvent::ChangeGroup { group_id: None }
        );
        assert_eq!(next_event(&mut events).await, GroupEvent::LoadComplete);
        assert!(session.coordinator().lock().await.is_ready());

        session.shutdown().await;
        assert!(transport.is_destroyed());
    }

    #[tokio::test]
    async fn test_pump_applies_every_event_after_a_long_lock() {
        let (transport, coordinator) = fake_session_parts();
        let session = ChatSession::start(coordinator).await.unwrap();
        let mut events = session.subscribe();

        transport.inject(TransportEvent::Connected);
        transport.inject(TransportEvent::InitChannelComplete(vec![ChannelSummary {
            channel_idx: "c-1".into(),
            channel_token: "tk-1".into(),
            group_idx: "g-1".into(),
            emergency_target_user_idx: None,
            creator_info: None,
        }]));
        assert_eq!(next_event(&mut events).await, GroupEvent::LoadStart);

        let total = 200u64;
        {
            let _held = session.coordinator().lock().await;
            for seq in 1..=total {
                let when = at(1, 10, (seq / 60) as u32, (seq % 60) as u32);
                transport.inject(TransportEvent::MessageReceived(MessageBatch {
                    message_info: vec![message(seq, "u-2", when)],
                    total_count: seq,
                    online_user_list: Vec::new(),
                }));
            }
        }

        let applied = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let count = session
                    .coordinator()
                    .lock()
                    .await
                    .channel_by_id("c-1")
                    .map_or(0, |c| c.messages().count());
                if count as u64 == total {
                    return count;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(applied as u64, total);

        let coordinator = session.coordinator().lock().await;
        let seqs: Vec<u64> = coordinator
            .channel_by_id("c-1")
            .unwrap()
            .messages()
            .map(|m| m.seq)
            .collect();
        assert_eq!(seqs, (1..=total).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_coordinator_attaches_to_one_session_only() {
        let (_transport, mut coordinator) = fake_session_parts();
        let _completions = coordinator.take_completions();
        assert!(ChatSession::start(coordinator).await.is_err());
    }
}
