//! Topic-addressed push notifications to connected sessions.
//!
//! Publishing never blocks the caller: each session owns a bounded queue
//! and an event that does not fit is dropped for that session only.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::models::{DispatchEvent, DriverId, Role, Schedule, Topic};

/// Sink for dispatch events.
///
/// Implementations must return promptly; they run inside the write path.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: &Topic, event: &DispatchEvent);

    /// Deliver to several topics at once.
    fn publish_to(&self, topics: &[Topic], event: &DispatchEvent) {
        for topic in topics {
            self.publish(topic, event);
        }
    }
}

/// Publisher that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _topic: &Topic, _event: &DispatchEvent) {}
}

/// Topics a `scheduleConflict` event is addressed to.
pub fn conflict_topics(driver_id: DriverId) -> Vec<Topic> {
    vec![
        Topic::Role(Role::Admin),
        Topic::Role(Role::Dispatcher),
        Topic::Driver(driver_id),
    ]
}

/// Topics a `scheduleUpdate` event is addressed to.
pub fn update_topics(schedule: &Schedule) -> Vec<Topic> {
    vec![Topic::Role(Role::Dispatcher), Topic::Driver(schedule.driver_id)]
}

/// Topics a `conflictResolved` event is addressed to.
pub fn resolved_topics(drivers: impl IntoIterator<Item = DriverId>) -> Vec<Topic> {
    let mut topics = vec![Topic::Role(Role::Dispatcher)];
    for driver in drivers {
        let topic = Topic::Driver(driver);
        if !topics.contains(&topic) {
            topics.push(topic);
        }
    }
    topics
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One delivered event.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Notification {
    pub topic: Topic,
    pub event: DispatchEvent,
    pub published_at: DateTime<Utc>,
}

/// Receiving end of a connected session.
pub struct Session {
    id: SessionId,
    receiver: mpsc::Receiver<Notification>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(notification) = self.receiver.try_recv() {
            out.push(notification);
        }
        out
    }
}

struct SessionEntry {
    user_id: String,
    topics: HashSet<Topic>,
    sender: mpsc::Sender<Notification>,
}

/// Session registry and in-process [`EventPublisher`].
pub struct Notifier {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Open a session subscribed to its role topic plus `topics`.
    pub fn connect(
        &self,
        user_id: impl Into<String>,
        role: Role,
        topics: impl IntoIterator<Item = Topic>,
    ) -> Session {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = SessionId(Uuid::new_v4());
        let mut subscribed: HashSet<Topic> = topics.into_iter().collect();
        subscribed.insert(Topic::Role(role));
        let user_id = user_id.into();
        log::info!("Session {} connected for {} ({:?})", id, user_id, role);
        self.sessions.write().insert(
            id,
            SessionEntry {
                user_id,
                topics: subscribed,
                sender,
            },
        );
        Session { id, receiver }
    }

    pub fn subscribe(&self, session: SessionId, topic: Topic) -> bool {
        match self.sessions.write().get_mut(&session) {
            Some(entry) => {
                entry.topics.insert(topic);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, session: SessionId, topic: &Topic) -> bool {
        match self.sessions.write().get_mut(&session) {
            Some(entry) => entry.topics.remove(topic),
            None => false,
        }
    }

    pub fn disconnect(&self, session: SessionId) -> bool {
        match self.sessions.write().remove(&session) {
            Some(entry) => {
                log::info!("Session {} for {} disconnected", session, entry.user_id);
                true
            }
            None => false,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    /// Events dropped because a session queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver(&self, topics: &[Topic], event: &DispatchEvent) {
        let mut closed = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, entry) in sessions.iter() {
                // A session subscribed to several of the topics gets one copy.
                let Some(topic) = topics.iter().find(|t| entry.topics.contains(t)) else {
                    continue;
                };
                let notification = Notification {
                    topic: topic.clone(),
                    event: event.clone(),
                    published_at: Utc::now(),
                };
                match entry.sender.try_send(notification) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "Session {} queue full, dropped {} event",
                            id,
                            event.name()
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut sessions = self.sessions.write();
            for id in closed {
                sessions.remove(&id);
                log::debug!("Session {} receiver gone, removed", id);
            }
        }
    }
}

impl EventPublisher for Notifier {
    fn publish(&self, topic: &Topic, event: &DispatchEvent) {
        self.deliver(std::slice::from_ref(topic), event);
    }

    fn publish_to(&self, topics: &[Topic], event: &DispatchEvent) {
        self.deliver(topics, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConflictId, ScheduleId};

    fn resolved(id: i64) -> DispatchEvent {
        DispatchEvent::ConflictResolved {
            conflict_id: ConflictId(id),
            schedules: vec![ScheduleId(1)],
        }
    }

    #[tokio::test]
    async fn test_role_topic_is_subscribed_on_connect() {
        let notifier = Notifier::new(8);
        let mut dispatcher = notifier.connect("ops-1", Role::Dispatcher, []);
        let mut admin = notifier.connect("root", Role::Admin, []);

        notifier.publish_to(&resolved_topics([DriverId(4)]), &resolved(1));

        let got = dispatcher.recv().await.unwrap();
        assert_eq!(got.topic, Topic::Role(Role::Dispatcher));
        assert_eq!(got.event.name(), "conflictResolved");
        assert!(admin.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_driver_topic_and_single_copy() {
        let notifier = Notifier::new(8);
        let mut session = notifier.connect("ops-2", Role::Dispatcher, [Topic::Driver(DriverId(4))]);

        notifier.publish_to(&resolved_topics([DriverId(4)]), &resolved(2));
        assert_eq!(session.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let notifier = Notifier::new(2);
        let mut slow = notifier.connect("slow", Role::Dispatcher, []);
        for i in 0..5 {
            notifier.publish(&Topic::Role(Role::Dispatcher), &resolved(i));
        }
        assert_eq!(notifier.dropped_count(), 3);
        assert_eq!(slow.drain().len(), 2);
    }

    #[test]
    fn test_subscribe_unsubscribe_disconnect() {
        let notifier = Notifier::new(4);
        let mut session = notifier.connect("drv", Role::Driver, []);
        let topic = Topic::Driver(DriverId(9));

        assert!(notifier.subscribe(session.id(), topic.clone()));
        notifier.publish(&topic, &resolved(1));
        assert!(session.try_recv().is_some());

        assert!(notifier.unsubscribe(session.id(), &topic));
        notifier.publish(&topic, &resolved(2));
        assert!(session.try_recv().is_none());

        assert_eq!(notifier.active_sessions(), 1);
        assert!(notifier.disconnect(session.id()));
        assert!(!notifier.disconnect(session.id()));
        assert_eq!(notifier.active_sessions(), 0);
    }

    #[test]
    fn test_dropped_receiver_removes_session() {
        let notifier = Notifier::new(4);
        let session = notifier.connect("gone", Role::Dispatcher, []);
        drop(session);
        notifier.publish(&Topic::Role(Role::Dispatcher), &resolved(1));
        assert_eq!(notifier.active_sessions(), 0);
    }
}
