/*
 * Copyright 2024 The Garrison Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Rate-limited work queue keyed by set identity.
//!
//! Keys are deduplicated while queued, and a key handed to a worker is never
//! handed to another until the first marks it done; re-enqueues arriving in
//! the meantime are delivered afterwards. Failed keys come back with
//! exponential backoff.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::api::GameServerSet;

const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(1000);

/// Identity of a [`GameServerSet`], the unit of reconciliation.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SetKey {
    pub namespace: String,
    pub name: String,
}

impl SetKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The key of a set object, if it carries both namespace and name.
    pub fn of(gss: &GameServerSet) -> Option<Self> {
        Some(Self {
            namespace: gss.metadata.namespace.clone()?,
            name: gss.metadata.name.clone()?,
        })
    }
}

impl std::fmt::Display for SetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<SetKey>,
    queued: HashSet<SetKey>,
    active: HashSet<SetKey>,
    redeliver: HashSet<SetKey>,
    failures: HashMap<SetKey, u32>,
    closed: bool,
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

enum Pop {
    Item(SetKey),
    Empty,
    Closed,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        })
    }

    /// Adds the key at the back of the queue.
    pub fn enqueue(&self, key: SetKey) {
        self.push(key, false);
    }

    /// Adds the key at the front of the queue, jumping the regular backlog.
    pub fn enqueue_immediately(&self, key: SetKey) {
        self.push(key, true);
    }

    fn push(&self, key: SetKey, front: bool) {
        let mut inner = self.inner.lock();
        if inner.closed || inner.queued.contains(&key) {
            return;
        }
        if inner.active.contains(&key) {
            // Redelivered once the in-flight reconciliation finishes, so no
            // two workers ever hold the same key.
            inner.redeliver.insert(key);
            return;
        }
        inner.queued.insert(key.clone());
        if front {
            inner.queue.push_front(key);
        } else {
            inner.queue.push_back(key);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Re-adds the key after a delay.
    pub fn enqueue_after(self: &Arc<Self>, key: SetKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Waits for the next key; `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<SetKey> {
        loop {
            let notified = self.notify.notified();
            match self.pop() {
                Pop::Item(key) => return Some(key),
                Pop::Closed => return None,
                Pop::Empty => notified.await,
            }
        }
    }

    fn pop(&self) -> Pop {
        let mut inner = self.inner.lock();
        if let Some(key) = inner.queue.pop_front() {
            inner.queued.remove(&key);
            inner.active.insert(key.clone());
            Pop::Item(key)
        } else if inner.closed {
            Pop::Closed
        } else {
            Pop::Empty
        }
    }

    /// Marks a key finished. Failed keys are retried with backoff; keys
    /// touched by events mid-flight are redelivered right away.
    pub fn done(self: &Arc<Self>, key: SetKey, failed: bool) {
        let redeliver;
        let backoff;
        {
            let mut inner = self.inner.lock();
            inner.active.remove(&key);
            redeliver = inner.redeliver.remove(&key);
            backoff = if failed {
                let failures = inner.failures.entry(key.clone()).or_insert(0);
                *failures = failures.saturating_add(1);
                Some(backoff_for(*failures))
            } else {
                inner.failures.remove(&key);
                None
            };
        }
        if redeliver {
            self.enqueue(key.clone());
        }
        if let Some(delay) = backoff {
            self.enqueue_after(key, delay);
        }
    }

    /// Closes the queue; workers drain what is in flight, then exit.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

fn backoff_for(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(30);
    BACKOFF_BASE
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_MAX)
}
