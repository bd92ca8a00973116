//! Presence Registry: who is on the canvas and where their cursor is.
//!
//! DESIGN
//! ======
//! Each client writes its own `PresenceRecord` into the ephemeral channel
//! under its user id, always with disconnect removal, so a dropped
//! connection takes the record with it. Cursor moves are throttled with a
//! trailing flush of the latest position. A heartbeat task refreshes
//! `last_seen` periodically and can be re-fired on visibility regain or
//! reconnect.
//!
//! The roster is a `watch` channel fed by a pump over ephemeral events, so
//! consumers always see the complete online list, not deltas. The pump notes
//! when each record last arrived, on the local clock, and sweeps out records
//! silent for `PRESENCE_TTL_HEARTBEATS` heartbeat periods. `last_seen` is the
//! writer's clock and is never compared against ours.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Subscription;
use crate::config::SyncConfig;
use crate::ephemeral::{EphemeralError, EphemeralEvent, EphemeralStore, PRESENCE};
use crate::frame::now_ms;
use crate::shape::{Point, UserId};

/// Cursor colors handed out when the caller does not pick one.
pub const CURSOR_COLORS: [&str; 8] = [
    "#EF4444", "#F97316", "#EAB308", "#22C55E", "#06B6D4", "#3B82F6", "#8B5CF6", "#EC4899",
];

/// Heartbeat periods without a write before a record leaves the roster.
pub const PRESENCE_TTL_HEARTBEATS: u32 = 3;

#[must_use]
pub fn pick_cursor_color() -> &'static str {
    CURSOR_COLORS[rand::rng().random_range(0..CURSOR_COLORS.len())]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub display_name: String,
    pub cursor_color: String,
    #[serde(default)]
    pub cursor_x: Option<f64>,
    #[serde(default)]
    pub cursor_y: Option<f64>,
    pub last_seen: i64,
}

impl PresenceRecord {
    #[must_use]
    pub fn cursor(&self) -> Option<Point> {
        Some(Point::new(self.cursor_x?, self.cursor_y?))
    }
}

/// A roster entry and when it last reached us.
struct Seen {
    record: PresenceRecord,
    received_at: Instant,
}

impl Seen {
    fn now(record: PresenceRecord) -> Self {
        Self { record, received_at: Instant::now() }
    }
}

type Roster = HashMap<String, Seen>;

#[derive(Default)]
struct CursorState {
    last_sent: Option<Instant>,
    pending: Option<Point>,
    trailing: Option<JoinHandle<()>>,
}

struct Inner {
    ephemeral: Arc<dyn EphemeralStore>,
    cursor_throttle: Duration,
    heartbeat_interval: Duration,
    local: Mutex<Option<PresenceRecord>>,
    cursor: Mutex<CursorState>,
    online: watch::Sender<Vec<PresenceRecord>>,
}

/// Presence for the local user plus a live view of everyone else.
#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<Inner>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PresenceRegistry {
    #[must_use]
    pub fn new(ephemeral: Arc<dyn EphemeralStore>, config: &SyncConfig) -> Self {
        let (online, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                ephemeral,
                cursor_throttle: config.cursor_throttle,
                heartbeat_interval: config.heartbeat_interval,
                local: Mutex::new(None),
                cursor: Mutex::new(CursorState::default()),
                online,
            }),
        }
    }

    /// Announce the local user. `color` defaults to a palette pick.
    ///
    /// # Errors
    ///
    /// Propagates the ephemeral write failure; the local record is kept so
    /// a later heartbeat can retry.
    pub async fn join(&self, user_id: UserId, display_name: &str, color: Option<&str>) -> Result<PresenceRecord, EphemeralError> {
        let record = PresenceRecord {
            user_id,
            display_name: display_name.to_owned(),
            cursor_color: color.map_or_else(|| pick_cursor_color().to_owned(), str::to_owned),
            cursor_x: None,
            cursor_y: None,
            last_seen: now_ms(),
        };
        *guard(&self.inner.local) = Some(record.clone());
        self.inner.publish(&record).await?;
        info!(%user_id, display_name, "presence: joined");
        Ok(record)
    }

    /// Refresh `last_seen`. Returns `false` when not joined.
    ///
    /// # Errors
    ///
    /// Propagates the ephemeral write failure.
    pub async fn heartbeat(&self) -> Result<bool, EphemeralError> {
        let record = {
            let mut local = guard(&self.inner.local);
            let Some(record) = local.as_mut() else {
                return Ok(false);
            };
            record.last_seen = now_ms();
            record.clone()
        };
        self.inner.publish(&record).await?;
        Ok(true)
    }

    /// Heartbeat on tab visibility regain.
    ///
    /// # Errors
    ///
    /// Propagates the ephemeral write failure.
    pub async fn visibility_regained(&self) -> Result<bool, EphemeralError> {
        debug!("presence: visibility regained");
        self.heartbeat().await
    }

    /// Heartbeat after a transport reconnect; re-registers disconnect removal.
    ///
    /// # Errors
    ///
    /// Propagates the ephemeral write failure.
    pub async fn reconnected(&self) -> Result<bool, EphemeralError> {
        info!("presence: reconnected");
        self.heartbeat().await
    }

    /// Move the local cursor. Returns `true` when written immediately,
    /// `false` when deferred to the trailing flush.
    ///
    /// # Errors
    ///
    /// Propagates the immediate ephemeral write failure.
    pub async fn update_cursor(&self, x: f64, y: f64) -> Result<bool, EphemeralError> {
        let now = Instant::now();
        let point = Point::new(x, y);
        {
            let mut cursor = guard(&self.inner.cursor);
            if let Some(sent_at) = cursor.last_sent {
                let elapsed = now.duration_since(sent_at);
                if elapsed < self.inner.cursor_throttle {
                    cursor.pending = Some(point);
                    if cursor.trailing.is_none() {
                        let wait = self.inner.cursor_throttle - elapsed;
                        cursor.trailing = Some(tokio::spawn(Arc::clone(&self.inner).flush_trailing(wait)));
                    }
                    return Ok(false);
                }
            }
            cursor.last_sent = Some(now);
            cursor.pending = None;
            if let Some(trailing) = cursor.trailing.take() {
                trailing.abort();
            }
        }
        self.inner.write_cursor(point).await?;
        Ok(true)
    }

    /// Remove the local record.
    ///
    /// # Errors
    ///
    /// Propagates the ephemeral delete failure.
    pub async fn leave(&self) -> Result<(), EphemeralError> {
        {
            let mut cursor = guard(&self.inner.cursor);
            if let Some(trailing) = cursor.trailing.take() {
                trailing.abort();
            }
            cursor.pending = None;
        }
        let Some(record) = guard(&self.inner.local).take() else {
            return Ok(());
        };
        self.inner
            .ephemeral
            .delete(PRESENCE, &record.user_id.to_string())
            .await?;
        info!(user_id = %record.user_id, "presence: left");
        Ok(())
    }

    #[must_use]
    pub fn local(&self) -> Option<PresenceRecord> {
        guard(&self.inner.local).clone()
    }

    /// Full online roster, updated by the `watch_roster` pump.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.inner.online.subscribe()
    }

    #[must_use]
    pub fn online(&self) -> Vec<PresenceRecord> {
        self.inner.online.borrow().clone()
    }

    /// Everyone online except the local user.
    #[must_use]
    pub fn others(&self) -> Vec<PresenceRecord> {
        let me = guard(&self.inner.local).as_ref().map(|r| r.user_id);
        self.online()
            .into_iter()
            .filter(|r| Some(r.user_id) != me)
            .collect()
    }

    /// Start the pump that keeps the roster in sync with the channel.
    #[must_use]
    pub fn watch_roster(&self) -> Subscription {
        let inner = Arc::clone(&self.inner);
        // Subscribe before the snapshot so nothing slips between them.
        let rx = inner.ephemeral.subscribe();
        Subscription::spawn(async move { inner.pump_roster(rx).await })
    }

    /// Start the periodic heartbeat.
    #[must_use]
    pub fn spawn_heartbeat(&self) -> Subscription {
        let registry = self.clone();
        let period = self.inner.heartbeat_interval;
        Subscription::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = registry.heartbeat().await {
                    warn!(error = %e, "presence: heartbeat failed");
                }
            }
        })
    }
}

impl Inner {
    async fn publish(&self, record: &PresenceRecord) -> Result<(), EphemeralError> {
        let value = serde_json::to_value(record)?;
        self.ephemeral
            .set_with_disconnect_removal(PRESENCE, &record.user_id.to_string(), value)
            .await
    }

    async fn write_cursor(&self, point: Point) -> Result<(), EphemeralError> {
        let record = {
            let mut local = guard(&self.local);
            let Some(record) = local.as_mut() else {
                return Ok(());
            };
            record.cursor_x = Some(point.x);
            record.cursor_y = Some(point.y);
            record.last_seen = now_ms();
            record.clone()
        };
        self.publish(&record).await
    }

    async fn flush_trailing(self: Arc<Self>, wait: Duration) {
        tokio::time::sleep(wait).await;
        let pending = {
            let mut cursor = guard(&self.cursor);
            cursor.trailing = None;
            let pending = cursor.pending.take();
            if pending.is_some() {
                cursor.last_sent = Some(Instant::now());
            }
            pending
        };
        if let Some(point) = pending
            && let Err(e) = self.write_cursor(point).await
        {
            warn!(error = %e, "presence: trailing cursor write failed");
        }
    }

    async fn load_roster(&self) -> Roster {
        match self.ephemeral.snapshot(PRESENCE).await {
            Ok(raw) => raw
                .into_iter()
                .filter_map(|(key, value)| {
                    serde_json::from_value::<PresenceRecord>(value)
                        .ok()
                        .map(|r| (key, Seen::now(r)))
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "presence: roster snapshot failed");
                HashMap::new()
            }
        }
    }

    fn send_roster(&self, roster: &Roster) {
        let mut list: Vec<PresenceRecord> = roster.values().map(|seen| seen.record.clone()).collect();
        list.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then(a.user_id.cmp(&b.user_id))
        });
        self.online.send_replace(list);
    }

    async fn pump_roster(self: Arc<Self>, mut rx: broadcast::Receiver<EphemeralEvent>) {
        let mut roster = self.load_roster().await;
        self.send_roster(&roster);

        let ttl = self.heartbeat_interval * PRESENCE_TTL_HEARTBEATS;
        let mut sweep = tokio::time::interval(self.heartbeat_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) if event.namespace() == PRESENCE => {
                        match event {
                            EphemeralEvent::Set { key, value, .. } => match serde_json::from_value::<PresenceRecord>(value) {
                                Ok(record) => {
                                    roster.insert(key, Seen::now(record));
                                }
                                Err(e) => debug!(error = %e, %key, "presence: ignoring malformed record"),
                            },
                            EphemeralEvent::Removed { key, .. } => {
                                roster.remove(&key);
                            }
                        }
                        self.send_roster(&roster);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "presence: roster lagged, resyncing");
                        roster = self.load_roster().await;
                        self.send_roster(&roster);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = sweep.tick() => {
                    if evict_silent(&mut roster, Instant::now(), ttl) > 0 {
                        self.send_roster(&roster);
                    }
                }
            }
        }
    }
}

/// Drop entries not heard from within `ttl` of `now`. Returns how many went.
fn evict_silent(roster: &mut Roster, now: Instant, ttl: Duration) -> usize {
    let before = roster.len();
    roster.retain(|key, seen| {
        let alive = now.duration_since(seen.received_at) <= ttl;
        if !alive {
            info!(%key, display_name = %seen.record.display_name, "presence: dropping silent user");
        }
        alive
    });
    before - roster.len()
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
