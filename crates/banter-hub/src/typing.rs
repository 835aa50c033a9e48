use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;
use uuid::Uuid;

use banter_types::api::AuthenticatedSession;
use banter_types::events::{HubEvent, TypingScope};

use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::registry::ConnectionRegistry;
use crate::rooms::{RoomMembership, validate_room_id};

struct TypingState {
    display_name: String,
    expires_at: Instant,
    last_relayed_at: Instant,
}

/// Relays typing signals. Nothing here is persisted; clients expire the
/// indicator on their own after `expires_in_ms`.
pub struct TypingIndicatorBroker {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomMembership>,
    states: DashMap<(Uuid, TypingScope), TypingState>,
    timeout: Duration,
    max_room_id_len: usize,
}

impl TypingIndicatorBroker {
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<RoomMembership>, config: &HubConfig) -> Self {
        Self {
            registry,
            rooms,
            states: DashMap::new(),
            timeout: config.typing_timeout,
            max_room_id_len: config.max_room_id_len,
        }
    }

    /// Refresh the indicator. Relays only when it is new or half the
    /// timeout has passed since the last relay. Returns the deliveries.
    pub fn notify_typing(&self, session: &AuthenticatedSession, scope: TypingScope) -> HubResult<usize> {
        self.validate(session, &scope)?;

        let now = Instant::now();
        let relay = match self.states.entry((session.user_id, scope.clone())) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                state.expires_at = now + self.timeout;
                if now.duration_since(state.last_relayed_at) >= self.timeout / 2 {
                    state.last_relayed_at = now;
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(TypingState {
                    display_name: session.display_name.clone(),
                    expires_at: now + self.timeout,
                    last_relayed_at: now,
                });
                true
            }
        };

        if !relay {
            return Ok(0);
        }

        let event = HubEvent::UserTyping {
            user_id: session.user_id,
            display_name: session.display_name.clone(),
            is_private: scope.is_private(),
            scope_id: scope.scope_id(),
            expires_in_ms: self.timeout.as_millis() as u64,
        };
        Ok(self.relay(session.user_id, &scope, &event))
    }

    /// Drop the indicator. Nothing is relayed when none was showing.
    pub fn notify_stopped(&self, session: &AuthenticatedSession, scope: TypingScope) -> HubResult<usize> {
        self.validate(session, &scope)?;

        if self.states.remove(&(session.user_id, scope.clone())).is_none() {
            return Ok(0);
        }
        Ok(self.relay_stopped(session.user_id, &session.display_name, &scope))
    }

    /// Clear every indicator of a user who has no connection left.
    pub fn clear_user(&self, user_id: Uuid) -> usize {
        let keys: Vec<(Uuid, TypingScope)> = self
            .states
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut cleared = 0;
        for key in keys {
            if let Some(((user_id, scope), state)) = self.states.remove(&key) {
                self.relay_stopped(user_id, &state.display_name, &scope);
                cleared += 1;
            }
        }
        cleared
    }

    /// Drop indicators that expired before `now`. Returns how many.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<(Uuid, TypingScope)> = self
            .states
            .iter()
            .filter(|entry| entry.value().expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = 0;
        for key in expired {
            // A refresh may have landed since the scan
            if let Some(((user_id, scope), state)) =
                self.states.remove_if(&key, |_, state| state.expires_at <= now)
            {
                self.relay_stopped(user_id, &state.display_name, &scope);
                swept += 1;
            }
        }
        swept
    }

    pub fn is_typing(&self, user_id: Uuid, scope: &TypingScope) -> bool {
        self.states.contains_key(&(user_id, scope.clone()))
    }

    fn validate(&self, session: &AuthenticatedSession, scope: &TypingScope) -> HubResult<()> {
        match scope {
            TypingScope::Room { room_id } => validate_room_id(room_id, self.max_room_id_len),
            TypingScope::Private { user_id } if *user_id == session.user_id => {
                Err(HubError::invalid("cannot type to yourself"))
            }
            TypingScope::Private { .. } => Ok(()),
        }
    }

    fn relay_stopped(&self, user_id: Uuid, display_name: &str, scope: &TypingScope) -> usize {
        let event = HubEvent::UserStoppedTyping {
            user_id,
            display_name: display_name.to_string(),
            is_private: scope.is_private(),
            scope_id: scope.scope_id(),
        };
        self.relay(user_id, scope, &event)
    }

    /// Room scope: everyone in the room except the typist's own connections.
    /// Private scope: every connection of the counterpart.
    fn relay(&self, user_id: Uuid, scope: &TypingScope, event: &HubEvent) -> usize {
        let targets: Vec<Uuid> = match scope {
            TypingScope::Room { room_id } => {
                let own = self.registry.active_connections(user_id);
                self.rooms
                    .connections_in_room(room_id)
                    .into_iter()
                    .filter(|conn| !own.contains(conn))
                    .collect()
            }
            TypingScope::Private { user_id: counterpart } => {
                self.registry.active_connections(*counterpart).into_iter().collect()
            }
        };
        self.registry.send_to_all(targets, event)
    }
}

/// Periodically expire typing indicators whose owners went quiet.
pub async fn run_expiry_loop(broker: Arc<TypingIndicatorBroker>, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        let swept = broker.sweep_expired(Instant::now());
        if swept > 0 {
            debug!("Typing sweep: expired {} indicators", swept);
        }
    }
}
