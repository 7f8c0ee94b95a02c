// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Idempotency Store
//!
//! Keyed cache of completed tool calls with TTL eviction and per-key
//! conditional writes: the first caller to reserve a key becomes the owner
//! and performs the real call; concurrent duplicates either short-circuit
//! on a stored snapshot or wait on the owner's result. Record lifetime is
//! bounded by the TTL, independent of any single run.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::domain::tool::{IdempotencyKey, ToolCallRecord, ToolResponse};
use crate::domain::workflow::ToolId;

#[derive(Debug, Clone)]
enum Signal {
    Pending,
    Completed(ToolResponse),
    /// Owner gave up without a result; followers should re-reserve
    Abandoned,
}

enum Slot {
    InFlight(watch::Receiver<Signal>),
    Done(ToolCallRecord),
}

/// Outcome of reserving a key
pub enum Reservation {
    /// A non-expired snapshot exists; the tool must not be called
    Completed(ToolResponse),
    /// This caller owns the key and must perform the call
    Owner(ReservationOwner),
    /// Another caller is in flight for the same key
    Follower(ReservationFollower),
}

/// First-writer reservation; dropping it without `complete` wakes
/// followers with `Abandoned` and frees the key
pub struct ReservationOwner {
    key: IdempotencyKey,
    tx: watch::Sender<Signal>,
    slots: Arc<DashMap<IdempotencyKey, Slot>>,
    ttl: Duration,
    completed: bool,
}

impl ReservationOwner {
    /// Store the snapshot and wake all followers
    pub fn complete(mut self, tool_id: ToolId, response: ToolResponse) {
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let record = ToolCallRecord {
            idempotency_key: self.key.clone(),
            tool_id,
            result_snapshot: response.clone(),
            expires_at: Utc::now() + ttl,
        };
        self.slots.insert(self.key.clone(), Slot::Done(record));
        let _ = self.tx.send(Signal::Completed(response));
        self.completed = true;
    }
}

impl Drop for ReservationOwner {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.tx.send(Signal::Abandoned);
            self.slots
                .remove_if(&self.key, |_, slot| matches!(slot, Slot::InFlight(_)));
        }
    }
}

pub struct ReservationFollower {
    rx: watch::Receiver<Signal>,
}

impl ReservationFollower {
    /// Wait for the owner's outcome; `None` means the owner failed and the
    /// caller should reserve again
    pub async fn wait(mut self) -> Option<ToolResponse> {
        match self
            .rx
            .wait_for(|signal| !matches!(signal, Signal::Pending))
            .await
        {
            Ok(signal) => match &*signal {
                Signal::Completed(response) => Some(response.clone()),
                _ => None,
            },
            Err(_) => None,
        }
    }
}

/// Shared idempotency cache, injected into the tool invocation service
pub struct IdempotencyStore {
    ttl: Duration,
    slots: Arc<DashMap<IdempotencyKey, Slot>>,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Reserve a key: snapshot hit, ownership, or followership
    pub fn reserve(&self, key: &IdempotencyKey) -> Reservation {
        use dashmap::mapref::entry::Entry;

        enum Action {
            Hit(ToolResponse),
            Follow(watch::Receiver<Signal>),
            TakeOver,
        }

        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let action = match entry.get() {
                    Slot::Done(record) if !record.is_expired(Utc::now()) => {
                        Action::Hit(record.result_snapshot.clone())
                    }
                    Slot::InFlight(rx) => Action::Follow(rx.clone()),
                    Slot::Done(_) => Action::TakeOver,
                };
                match action {
                    Action::Hit(response) => Reservation::Completed(response),
                    Action::Follow(rx) => {
                        Reservation::Follower(ReservationFollower { rx })
                    }
                    Action::TakeOver => {
                        let (tx, rx) = watch::channel(Signal::Pending);
                        entry.insert(Slot::InFlight(rx));
                        Reservation::Owner(ReservationOwner {
                            key: key.clone(),
                            tx,
                            slots: self.slots.clone(),
                            ttl: self.ttl,
                            completed: false,
                        })
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(Signal::Pending);
                vacant.insert(Slot::InFlight(rx));
                Reservation::Owner(ReservationOwner {
                    key: key.clone(),
                    tx,
                    slots: self.slots.clone(),
                    ttl: self.ttl,
                    completed: false,
                })
            }
        }
    }

    /// Non-expired snapshot for a key, if any
    pub fn get(&self, key: &IdempotencyKey) -> Option<ToolResponse> {
        self.slots.get(key).and_then(|slot| match slot.value() {
            Slot::Done(record) if !record.is_expired(Utc::now()) => {
                Some(record.result_snapshot.clone())
            }
            _ => None,
        })
    }

    /// Drop expired records; in-flight reservations are untouched
    pub fn purge_expired(&self) {
        let now = Utc::now();
        self.slots.retain(|_, slot| match slot {
            Slot::Done(record) => !record.is_expired(now),
            Slot::InFlight(_) => true,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
