use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use banter_db::{Database, to_db_time};
use banter_types::api::AuthenticatedSession;
use banter_types::events::{HubCommand, HubEvent};

use crate::blocking;
use crate::config::HubConfig;
use crate::error::HubResult;
use crate::presence::PresenceService;
use crate::receipts::ReadReceiptTracker;
use crate::registry::{ConnectionRegistry, Disconnected, EventSender};
use crate::rooms::{RoomMembership, validate_room_id};
use crate::router::{LoggingNotifier, MessageRouter, OfflineNotifier};
use crate::typing::TypingIndicatorBroker;
use crate::unread::UnreadCounter;

/// Entry point to the messaging core. Built once and cloned into every
/// connection task and request handler.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    db: Arc<Database>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomMembership>,
    presence: PresenceService,
    router: MessageRouter,
    receipts: ReadReceiptTracker,
    unread: UnreadCounter,
    typing: Arc<TypingIndicatorBroker>,
}

impl Hub {
    pub fn new(db: Database, config: HubConfig) -> Self {
        Self::with_notifier(db, config, Arc::new(LoggingNotifier))
    }

    pub fn with_notifier(db: Database, config: HubConfig, notifier: Arc<dyn OfflineNotifier>) -> Self {
        let db = Arc::new(db);
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomMembership::new());

        Self {
            inner: Arc::new(HubInner {
                presence: PresenceService::new(registry.clone(), db.clone()),
                router: MessageRouter::new(db.clone(), registry.clone(), rooms.clone(), notifier, &config),
                receipts: ReadReceiptTracker::new(db.clone(), registry.clone(), &config),
                unread: UnreadCounter::new(db.clone()),
                typing: Arc::new(TypingIndicatorBroker::new(registry.clone(), rooms.clone(), &config)),
                config,
                db,
                registry,
                rooms,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn rooms(&self) -> &RoomMembership {
        &self.inner.rooms
    }

    pub fn presence(&self) -> &PresenceService {
        &self.inner.presence
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn receipts(&self) -> &ReadReceiptTracker {
        &self.inner.receipts
    }

    pub fn unread(&self) -> &UnreadCounter {
        &self.inner.unread
    }

    pub fn typing(&self) -> &Arc<TypingIndicatorBroker> {
        &self.inner.typing
    }

    /// Register a new connection for `session`. Events for it arrive on `tx`,
    /// starting with `Ready`.
    pub async fn connect(&self, session: &AuthenticatedSession, tx: EventSender) -> HubResult<Uuid> {
        let connection_id = Uuid::new_v4();
        let now = to_db_time(&Utc::now());

        {
            let uid = session.user_id.to_string();
            let username = session.username.clone();
            let display_name = session.display_name.clone();
            let cid = connection_id.to_string();
            blocking(&self.inner.db, move |db| {
                db.upsert_user(&uid, &username, &display_name, &now)?;
                db.insert_connection(&cid, &uid, &now)
            })
            .await?;
        }

        let first = self
            .inner
            .registry
            .connect(connection_id, session.user_id, &session.display_name, tx);
        self.inner.registry.send(
            connection_id,
            HubEvent::Ready {
                user_id: session.user_id,
                display_name: session.display_name.clone(),
                connection_id,
            },
        );

        if let Err(e) = self.finish_connect(session, connection_id).await {
            self.disconnect(connection_id, "connect failed").await;
            return Err(e);
        }

        info!(
            "{} ({}) connected as {} (first: {})",
            session.display_name, session.user_id, connection_id, first
        );
        Ok(connection_id)
    }

    async fn finish_connect(&self, session: &AuthenticatedSession, connection_id: Uuid) -> HubResult<()> {
        self.inner
            .presence
            .on_connect(session.user_id, &session.display_name)
            .await?;

        let default_room = self.inner.config.default_room.clone();
        self.join_room(session, connection_id, &default_room)?;

        let counts = self.inner.unread.get_counts(session.user_id).await?;
        self.inner.registry.send(
            connection_id,
            HubEvent::UnreadMessageCount {
                group_unread: counts.group_unread,
                private_unread: counts.private_unread,
            },
        );
        Ok(())
    }

    /// Tear a connection down. Repeated calls return `None`.
    pub async fn disconnect(&self, connection_id: Uuid, reason: &str) -> Option<Disconnected> {
        let gone = self.inner.registry.disconnect(connection_id);
        let released = self.inner.rooms.release(connection_id);
        let gone = gone?;

        for room_id in released {
            let members = self.inner.rooms.connections_in_room(&room_id);
            self.inner.registry.send_to_all(
                members,
                &HubEvent::UserLeft {
                    display_name: gone.display_name.clone(),
                    user_id: gone.user_id,
                    room_id,
                },
            );
        }

        let cid = connection_id.to_string();
        if let Err(e) = blocking(&self.inner.db, move |db| db.deactivate_connection(&cid)).await {
            warn!("Failed to deactivate connection {}: {}", connection_id, e);
        }

        if gone.was_last {
            if let Err(e) = self
                .inner
                .presence
                .on_disconnect(gone.user_id, &gone.display_name)
                .await
            {
                warn!("Failed to record {} going offline: {}", gone.user_id, e);
            }
            self.inner.typing.clear_user(gone.user_id);
        }

        info!(
            "{} ({}) disconnected {}: {}",
            gone.display_name, gone.user_id, connection_id, reason
        );
        Some(gone)
    }

    /// Join a room and announce it to the room. Returns false if already a member.
    pub fn join_room(&self, session: &AuthenticatedSession, connection_id: Uuid, room_id: &str) -> HubResult<bool> {
        validate_room_id(room_id, self.inner.config.max_room_id_len)?;

        if !self.inner.rooms.join(connection_id, room_id) {
            return Ok(false);
        }

        let members = self.inner.rooms.connections_in_room(room_id);
        self.inner.registry.send_to_all(
            members,
            &HubEvent::UserJoined {
                display_name: session.display_name.clone(),
                user_id: session.user_id,
                room_id: room_id.to_string(),
            },
        );
        Ok(true)
    }

    /// Leave a room. The remaining members and the leaving connection are told.
    pub fn leave_room(&self, session: &AuthenticatedSession, connection_id: Uuid, room_id: &str) -> HubResult<bool> {
        validate_room_id(room_id, self.inner.config.max_room_id_len)?;

        if !self.inner.rooms.leave(connection_id, room_id) {
            return Ok(false);
        }

        let mut targets = self.inner.rooms.connections_in_room(room_id);
        targets.insert(connection_id);
        self.inner.registry.send_to_all(
            targets,
            &HubEvent::UserLeft {
                display_name: session.display_name.clone(),
                user_id: session.user_id,
                room_id: room_id.to_string(),
            },
        );
        Ok(true)
    }

    /// Run one client command. A failure is reported to the calling
    /// connection as an `Error` event.
    pub async fn handle_command(&self, session: &AuthenticatedSession, connection_id: Uuid, cmd: HubCommand) {
        if let Err(e) = self.dispatch(session, connection_id, cmd).await {
            if e.is_retryable() {
                warn!("{} ({}) command failed: {}", session.display_name, session.user_id, e);
            } else {
                debug!("{} ({}) command rejected: {}", session.display_name, session.user_id, e);
            }
            self.inner.registry.send(connection_id, e.to_event());
        }
    }

    async fn dispatch(&self, session: &AuthenticatedSession, connection_id: Uuid, cmd: HubCommand) -> HubResult<()> {
        match cmd {
            // Sends run on their own task: once a message is stored its fan-out
            // must finish even if the sending socket goes away meanwhile.
            HubCommand::SendMessage { text, room_id } => {
                let hub = self.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    hub.inner
                        .router
                        .send_group_message(&session, &room_id, &text)
                        .await
                })
                .await??;
            }

            HubCommand::SendPrivateMessage { receiver_id, text } => {
                let hub = self.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    hub.inner
                        .router
                        .send_private_message(&session, connection_id, receiver_id, &text)
                        .await
                })
                .await??;
            }

            HubCommand::MarkMessageAsRead {
                message_id,
                message_type,
            } => {
                let transitioned = self
                    .inner
                    .receipts
                    .mark_read(message_id, message_type, session.user_id)
                    .await?;
                if transitioned {
                    self.push_unread_counts(session.user_id).await?;
                }
            }

            HubCommand::JoinRoom { room_id } => {
                self.join_room(session, connection_id, &room_id)?;
            }

            HubCommand::LeaveRoom { room_id } => {
                self.leave_room(session, connection_id, &room_id)?;
            }

            HubCommand::GetUnreadMessageCount => {
                let counts = self.inner.unread.get_counts(session.user_id).await?;
                self.inner.registry.send(
                    connection_id,
                    HubEvent::UnreadMessageCount {
                        group_unread: counts.group_unread,
                        private_unread: counts.private_unread,
                    },
                );
            }

            HubCommand::SendTypingNotification { scope } => {
                self.inner.typing.notify_typing(session, scope)?;
            }

            HubCommand::SendStopTypingNotification { scope } => {
                self.inner.typing.notify_stopped(session, scope)?;
            }
        }
        Ok(())
    }

    /// Refresh the badges on every device of a user.
    pub async fn push_unread_counts(&self, user_id: Uuid) -> HubResult<()> {
        let counts = self.inner.unread.get_counts(user_id).await?;
        self.inner.registry.send_to_user(
            user_id,
            HubEvent::UnreadMessageCount {
                group_unread: counts.group_unread,
                private_unread: counts.private_unread,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use banter_types::events::TypingScope;
    use banter_types::models::MessageKind;

    use crate::error::HubError;
    use crate::router::OfflineNotice;

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<OfflineNotice>>,
    }

    impl OfflineNotifier for RecordingNotifier {
        fn notify_offline(&self, notice: &OfflineNotice) {
            self.notices.lock().unwrap().push(notice.clone());
        }
    }

    struct Client {
        connection_id: Uuid,
        rx: mpsc::UnboundedReceiver<HubEvent>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<HubEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn hub() -> Hub {
        Hub::new(Database::open_in_memory().unwrap(), HubConfig::default())
    }

    fn session(name: &str) -> AuthenticatedSession {
        AuthenticatedSession::new(Uuid::new_v4(), name.to_lowercase(), name)
    }

    async fn connect(hub: &Hub, session: &AuthenticatedSession) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = hub.connect(session, tx).await.unwrap();
        Client { connection_id, rx }
    }

    fn send(text: &str) -> HubCommand {
        HubCommand::SendMessage {
            text: text.into(),
            room_id: "general".into(),
        }
    }

    fn received_ids(events: &[HubEvent]) -> Vec<i64> {
        events
            .iter()
            .filter_map(|e| match e {
                HubEvent::ReceiveMessage { message_id, .. } => Some(*message_id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn connect_sends_ready_then_counts() {
        let hub = hub();
        let ada = session("Ada");
        let mut client = connect(&hub, &ada).await;

        let events = client.drain();
        assert!(matches!(events[0], HubEvent::Ready { user_id, .. } if user_id == ada.user_id));
        assert!(events.contains(&HubEvent::UnreadMessageCount {
            group_unread: 0,
            private_unread: 0
        }));
        assert!(hub.rooms().is_member(client.connection_id, "general"));
        assert!(hub.presence().is_online(ada.user_id));
    }

    #[tokio::test]
    async fn group_message_reaches_room_and_tracks_reads() {
        let hub = hub();
        let (ada, bob) = (session("Ada"), session("Bob"));
        let mut a = connect(&hub, &ada).await;
        let mut b = connect(&hub, &bob).await;
        a.drain();
        b.drain();

        hub.handle_command(&ada, a.connection_id, send("hi")).await;

        let events = b.drain();
        let [HubEvent::ReceiveMessage { display_name, text, message_id, sender_id, .. }] = events.as_slice() else {
            panic!("expected one ReceiveMessage, got {:?}", events);
        };
        assert_eq!(display_name, "Ada");
        assert_eq!(text, "hi");
        assert_eq!(*sender_id, ada.user_id);
        let message_id = *message_id;

        // The sender's own room connection sees the message too
        assert_eq!(received_ids(&a.drain()), vec![message_id]);

        let statuses = hub.db().get_read_statuses(message_id).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].user_id, bob.user_id.to_string());
        assert!(!statuses[0].is_read);
        assert_eq!(hub.unread().get_counts(bob.user_id).await.unwrap().group_unread, 1);

        hub.handle_command(
            &bob,
            b.connection_id,
            HubCommand::MarkMessageAsRead {
                message_id,
                message_type: MessageKind::Group,
            },
        )
        .await;

        assert_eq!(hub.unread().get_counts(bob.user_id).await.unwrap().group_unread, 0);
        assert!(a.drain().contains(&HubEvent::MessageRead {
            message_id,
            message_type: MessageKind::Group
        }));
        assert!(b.drain().contains(&HubEvent::UnreadMessageCount {
            group_unread: 0,
            private_unread: 0
        }));
    }

    #[tokio::test]
    async fn concurrent_reads_transition_once() {
        let hub = hub();
        let (ada, bob) = (session("Ada"), session("Bob"));
        let mut a = connect(&hub, &ada).await;
        let _b = connect(&hub, &bob).await;

        let message_id = hub
            .router()
            .send_group_message(&ada, "general", "hello")
            .await
            .unwrap();
        a.drain();

        let (first, second) = tokio::join!(
            hub.receipts().mark_group_read(message_id, bob.user_id),
            hub.receipts().mark_group_read(message_id, bob.user_id),
        );
        assert!(first.unwrap() ^ second.unwrap());

        let reads = a
            .drain()
            .into_iter()
            .filter(|e| matches!(e, HubEvent::MessageRead { .. }))
            .count();
        assert_eq!(reads, 1);
    }

    #[tokio::test]
    async fn non_members_get_a_notification_instead() {
        let hub = hub();
        let (ada, bob) = (session("Ada"), session("Bob"));
        let a = connect(&hub, &ada).await;
        let mut b_room = connect(&hub, &bob).await;
        let mut b_away = connect(&hub, &bob).await;
        hub.leave_room(&bob, b_away.connection_id, "general").unwrap();
        b_room.drain();
        b_away.drain();

        let message_id = hub
            .router()
            .send_group_message(&ada, "general", "ping")
            .await
            .unwrap();

        assert_eq!(received_ids(&b_room.drain()), vec![message_id]);
        let away = b_away.drain();
        assert_eq!(away.len(), 1);
        assert!(matches!(
            away[0],
            HubEvent::ReceiveMessageNotification { message_id: id, .. } if id == message_id
        ));
        assert!(hub.rooms().is_member(a.connection_id, "general"));
    }

    #[tokio::test]
    async fn room_delivery_follows_persistence_order() {
        let hub = hub();
        let (ada, bob, cat) = (session("Ada"), session("Bob"), session("Cat"));
        let _a = connect(&hub, &ada).await;
        let _b = connect(&hub, &bob).await;
        let mut c = connect(&hub, &cat).await;
        c.drain();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let hub = hub.clone();
            let sender = if i % 2 == 0 { ada.clone() } else { bob.clone() };
            tasks.push(tokio::spawn(async move {
                hub.router()
                    .send_group_message(&sender, "general", &format!("m{}", i))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let ids = received_ids(&c.drain());
        assert_eq!(ids.len(), 20);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn offline_private_message_uses_the_hook_once() {
        let notifier = Arc::new(RecordingNotifier::default());
        let hub = Hub::with_notifier(
            Database::open_in_memory().unwrap(),
            HubConfig::default(),
            notifier.clone(),
        );
        let (ada, bob) = (session("Ada"), session("Bob"));

        // Bob exists but is offline
        let b = connect(&hub, &bob).await;
        hub.disconnect(b.connection_id, "test").await;

        let mut a = connect(&hub, &ada).await;
        a.drain();
        hub.handle_command(
            &ada,
            a.connection_id,
            HubCommand::SendPrivateMessage {
                receiver_id: bob.user_id,
                text: "are you there?".into(),
            },
        )
        .await;

        let notices = notifier.notices.lock().unwrap().clone();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].receiver_id, bob.user_id);

        let echo = a.drain();
        assert!(matches!(
            echo.as_slice(),
            [HubEvent::PrivateMessageSent { receiver_id, .. }] if *receiver_id == bob.user_id
        ));

        let stored = hub.db().get_private_message(notices[0].message_id).unwrap().unwrap();
        assert!(!stored.is_read);

        let mut b = connect(&hub, &bob).await;
        assert!(b.drain().contains(&HubEvent::UnreadMessageCount {
            group_unread: 0,
            private_unread: 1
        }));
    }

    #[tokio::test]
    async fn online_private_message_reaches_all_receiver_devices() {
        let notifier = Arc::new(RecordingNotifier::default());
        let hub = Hub::with_notifier(
            Database::open_in_memory().unwrap(),
            HubConfig::default(),
            notifier.clone(),
        );
        let (ada, bob) = (session("Ada"), session("Bob"));
        let a = connect(&hub, &ada).await;
        let mut b1 = connect(&hub, &bob).await;
        let mut b2 = connect(&hub, &bob).await;
        b1.drain();
        b2.drain();

        let message_id = hub
            .router()
            .send_private_message(&ada, a.connection_id, bob.user_id, "psst")
            .await
            .unwrap();

        for b in [&mut b1, &mut b2] {
            assert!(b.drain().iter().any(|e| matches!(
                e,
                HubEvent::ReceivePrivateMessage { message_id: id, .. } if *id == message_id
            )));
        }
        assert!(notifier.notices.lock().unwrap().is_empty());

        // Only the receiver can mark it read
        assert!(!hub.receipts().mark_private_read(message_id, ada.user_id).await.unwrap());
        assert!(hub.receipts().mark_private_read(message_id, bob.user_id).await.unwrap());
        assert!(!hub.receipts().mark_private_read(message_id, bob.user_id).await.unwrap());
    }

    #[tokio::test]
    async fn private_message_validation() {
        let hub = hub();
        let ada = session("Ada");
        let a = connect(&hub, &ada).await;

        let err = hub
            .router()
            .send_private_message(&ada, a.connection_id, Uuid::new_v4(), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::UnknownRecipient(_)));

        let err = hub
            .router()
            .send_private_message(&ada, a.connection_id, ada.user_id, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidInput(_)));

        let err = hub
            .router()
            .send_group_message(&ada, "general", "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn failed_commands_come_back_as_errors() {
        let hub = hub();
        let ada = session("Ada");
        let mut a = connect(&hub, &ada).await;
        a.drain();

        hub.handle_command(&ada, a.connection_id, send("")).await;

        let events = a.drain();
        assert!(matches!(
            events.as_slice(),
            [HubEvent::Error { code, retryable: false, .. }] if code == "invalid_input"
        ));
    }

    #[tokio::test]
    async fn marking_as_unknown_user_fails() {
        let hub = hub();
        let err = hub
            .receipts()
            .mark_group_read(1, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::UnknownRecipient(_)));
    }

    #[tokio::test]
    async fn second_device_keeps_user_online() {
        let hub = hub();
        let (ada, bob) = (session("Ada"), session("Bob"));
        let mut watcher = connect(&hub, &bob).await;
        let a1 = connect(&hub, &ada).await;
        let a2 = connect(&hub, &ada).await;
        watcher.drain();

        hub.disconnect(a1.connection_id, "test").await;
        assert!(hub.presence().is_online(ada.user_id));
        assert!(!watcher
            .drain()
            .iter()
            .any(|e| matches!(e, HubEvent::PresenceUpdate { online: false, .. })));

        let before = Utc::now();
        let gone = hub.disconnect(a2.connection_id, "test").await.unwrap();
        assert!(gone.was_last);
        assert!(!hub.presence().is_online(ada.user_id));

        let last_seen = hub.presence().last_seen(ada.user_id).await.unwrap().unwrap();
        assert!(last_seen >= before);
        assert!(watcher.drain().iter().any(|e| matches!(
            e,
            HubEvent::PresenceUpdate { user_id, online: false, .. } if *user_id == ada.user_id
        )));

        assert!(hub.disconnect(a2.connection_id, "again").await.is_none());
        let row = hub.db().get_user(&ada.user_id.to_string()).unwrap().unwrap();
        assert!(!row.is_online);
        assert_eq!(hub.db().count_active_connections(&ada.user_id.to_string()).unwrap(), 0);
    }

    #[tokio::test]
    async fn leaving_announces_and_disconnect_releases_rooms() {
        let hub = hub();
        let (ada, bob) = (session("Ada"), session("Bob"));
        let a = connect(&hub, &ada).await;
        let mut b = connect(&hub, &bob).await;
        hub.join_room(&ada, a.connection_id, "random").unwrap();
        hub.join_room(&bob, b.connection_id, "random").unwrap();
        b.drain();

        hub.disconnect(a.connection_id, "test").await;

        let left: Vec<String> = b
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                HubEvent::UserLeft { room_id, .. } => Some(room_id),
                _ => None,
            })
            .collect();
        assert_eq!(left, vec!["general".to_string(), "random".to_string()]);
        assert!(hub.rooms().rooms_of(a.connection_id).is_empty());
    }

    #[tokio::test]
    async fn joining_announces_to_the_room() {
        let hub = hub();
        let (ada, bob) = (session("Ada"), session("Bob"));
        let mut a = connect(&hub, &ada).await;
        hub.join_room(&ada, a.connection_id, "random").unwrap();
        a.drain();

        // Auto-join of the default room on connect
        let b = connect(&hub, &bob).await;
        assert!(a.drain().contains(&HubEvent::UserJoined {
            display_name: "Bob".into(),
            user_id: bob.user_id,
            room_id: "general".into(),
        }));

        hub.handle_command(
            &bob,
            b.connection_id,
            HubCommand::JoinRoom {
                room_id: "random".into(),
            },
        )
        .await;
        assert_eq!(
            a.drain(),
            vec![HubEvent::UserJoined {
                display_name: "Bob".into(),
                user_id: bob.user_id,
                room_id: "random".into(),
            }]
        );

        // Joining twice is silent
        assert!(!hub.join_room(&bob, b.connection_id, "random").unwrap());
        assert!(a.drain().is_empty());
    }

    /// Block the storage handle from another thread until the returned
    /// sender fires.
    fn hold_storage(db: Arc<Database>) -> (std::thread::JoinHandle<()>, std::sync::mpsc::Sender<()>) {
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            db.with_conn(|_| {
                held_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(())
            })
            .unwrap();
        });
        held_rx.recv().unwrap();
        (holder, release_tx)
    }

    #[tokio::test]
    async fn send_completes_after_sender_task_is_aborted() {
        let hub = hub();
        let (ada, bob) = (session("Ada"), session("Bob"));
        let a = connect(&hub, &ada).await;
        let mut b = connect(&hub, &bob).await;
        b.drain();

        let (holder, release) = hold_storage(hub.db().clone());
        let task = {
            let hub = hub.clone();
            let ada = ada.clone();
            let connection_id = a.connection_id;
            tokio::spawn(async move { hub.handle_command(&ada, connection_id, send("hi")).await })
        };
        // Let the send reach the storage call, then drop the socket's task
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        release.send(()).unwrap();
        holder.join().unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Some(HubEvent::ReceiveMessage { text, .. }) = b.rx.recv().await {
                    return text;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received, "hi");
        assert_eq!(hub.unread().get_counts(bob.user_id).await.unwrap().group_unread, 1);
    }

    #[tokio::test]
    async fn reconnect_during_offline_flip_ends_online() {
        let hub = hub();
        let (ada, bob) = (session("Ada"), session("Bob"));
        let mut watcher = connect(&hub, &bob).await;
        let first_tab = connect(&hub, &ada).await;
        watcher.drain();

        let (holder, release) = hold_storage(hub.db().clone());

        // First tab closes; its offline write stalls on storage
        assert!(hub.registry().disconnect(first_tab.connection_id).unwrap().was_last);
        let offline = {
            let hub = hub.clone();
            let user_id = ada.user_id;
            tokio::spawn(async move { hub.presence().on_disconnect(user_id, "Ada").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Second tab opens before the offline flip has finished
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(hub.registry().connect(Uuid::new_v4(), ada.user_id, "Ada", tx));
        let online = {
            let hub = hub.clone();
            let user_id = ada.user_id;
            tokio::spawn(async move { hub.presence().on_connect(user_id, "Ada").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        release.send(()).unwrap();
        holder.join().unwrap();
        offline.await.unwrap().unwrap();
        online.await.unwrap().unwrap();

        let flips: Vec<bool> = watcher
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                HubEvent::PresenceUpdate { user_id, online, .. } if user_id == ada.user_id => Some(online),
                _ => None,
            })
            .collect();
        assert_eq!(flips, vec![false, true]);
        assert!(hub.presence().is_online(ada.user_id));
        let row = hub.db().get_user(&ada.user_id.to_string()).unwrap().unwrap();
        assert!(row.is_online);
    }

    #[tokio::test]
    async fn typing_in_room_reaches_other_members() {
        let hub = hub();
        let (ada, bob) = (session("Ada"), session("Bob"));
        let a = connect(&hub, &ada).await;
        let mut b = connect(&hub, &bob).await;
        b.drain();

        hub.handle_command(
            &ada,
            a.connection_id,
            HubCommand::SendTypingNotification {
                scope: TypingScope::Room {
                    room_id: "general".into(),
                },
            },
        )
        .await;

        let events = b.drain();
        assert!(matches!(
            events.as_slice(),
            [HubEvent::UserTyping { expires_in_ms: 5000, .. }]
        ));

        // Last disconnect clears the indicator
        hub.disconnect(a.connection_id, "test").await;
        assert!(!hub.typing().is_typing(
            ada.user_id,
            &TypingScope::Room {
                room_id: "general".into()
            }
        ));
    }

    #[tokio::test]
    async fn conversation_and_room_bulk_reads() {
        let hub = hub();
        let (ada, bob) = (session("Ada"), session("Bob"));
        let a = connect(&hub, &ada).await;
        let mut b = connect(&hub, &bob).await;

        for text in ["one", "two"] {
            hub.router()
                .send_private_message(&bob, b.connection_id, ada.user_id, text)
                .await
                .unwrap();
            hub.router().send_group_message(&bob, "general", text).await.unwrap();
        }
        b.drain();

        let counts = hub.unread().get_counts(ada.user_id).await.unwrap();
        assert_eq!((counts.group_unread, counts.private_unread), (2, 2));
        assert_eq!(hub.unread().unread_from(ada.user_id, bob.user_id).await.unwrap(), 2);

        assert_eq!(hub.receipts().mark_conversation_read(ada.user_id, bob.user_id).await.unwrap(), 2);
        assert_eq!(hub.receipts().mark_room_read(ada.user_id, "general").await.unwrap(), 2);
        assert_eq!(hub.unread().get_counts(ada.user_id).await.unwrap(), Default::default());

        let reads = b
            .drain()
            .into_iter()
            .filter(|e| matches!(e, HubEvent::MessageRead { message_type: MessageKind::Private, .. }))
            .count();
        assert_eq!(reads, 2);
        assert!(hub.rooms().is_member(a.connection_id, "general"));
    }
}
