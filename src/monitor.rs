/**
    xenstore-rs provides a Rust based xenstore implementation.
    Copyright (C) 2016 Star Lab Corp.

    This program is free software; you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation; either version 2 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License along
    with this program; if not, see <http://www.gnu.org/licenses/>.
**/

//! Watch subscriptions. A `Monitor` owns a set of `(watch_path, token)`
//! records and a FIFO of events the router has dispatched to it, and
//! exposes a blocking iterator over the events that still match an
//! active record.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::path::{is_prefix, validate_watch_path};
use crate::router::{EventSink, SubscriptionId};
use crate::wire::{Packet, XS_UNWATCH, XS_WATCH};

/// A decoded watch notification: the path that changed and the token
/// supplied at `watch` time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub path: String,
    pub token: String,
}

struct Queue {
    events: Mutex<VecDeque<Event>>,
    closed: Mutex<Option<String>>,
    ready: Condvar,
}

/// A subscription handle. Not available over the XenBus character-device
/// transport (§4.6) — `Client::monitor` rejects that combination.
pub struct Monitor {
    client: Client,
    queue: Arc<Queue>,
    /// Active `(wpath, token)` records, each mapped to the router
    /// subscription id `watch` registered it under.
    watches: Mutex<HashMap<(String, String), SubscriptionId>>,
    /// When set, `wait()` also yields events whose watch has already
    /// been removed, for diagnostics.
    unfiltered: bool,
}

impl Monitor {
    pub(crate) fn new(client: Client, unfiltered: bool) -> Arc<Monitor> {
        Arc::new(Monitor {
            client,
            queue: Arc::new(Queue {
                events: Mutex::new(VecDeque::new()),
                closed: Mutex::new(None),
                ready: Condvar::new(),
            }),
            watches: Mutex::new(HashMap::new()),
            unfiltered,
        })
    }

    /// Registers interest in `wpath` under `token`, both with the
    /// router and with the daemon.
    pub fn watch(self: &Arc<Self>, wpath: &str, token: &str) -> Result<()> {
        let wpath = validate_watch_path(wpath)?.to_string();

        let sink: Arc<dyn EventSink> = self.clone();
        let subscription_id = self.client.router().subscribe(token, sink);

        let mut payload = wpath.clone().into_bytes();
        payload.push(0);
        payload.extend_from_slice(token.as_bytes());
        payload.push(0);

        let rq_id = self.client.router().next_rq_id();
        let packet = Packet::new(XS_WATCH, rq_id, self.client.tx_id(), payload)?;
        let cell = self.client.router().send(packet)?;
        let response = cell.wait()?;
        if let Err(e) = self.client.ack(XS_WATCH, response) {
            self.client.router().unsubscribe(token, subscription_id);
            return Err(e);
        }

        self.watches.lock().unwrap().insert((wpath, token.to_string()), subscription_id);
        Ok(())
    }

    /// Withdraws a previously registered watch. A second `unwatch` for
    /// the same pair is a no-op.
    pub fn unwatch(self: &Arc<Self>, wpath: &str, token: &str) -> Result<()> {
        let wpath = validate_watch_path(wpath)?.to_string();
        let key = (wpath.clone(), token.to_string());
        let subscription_id = match self.watches.lock().unwrap().remove(&key) {
            Some(id) => id,
            None => return Ok(()),
        };
        self.client.router().unsubscribe(token, subscription_id);

        let mut payload = wpath.into_bytes();
        payload.push(0);
        payload.extend_from_slice(token.as_bytes());
        payload.push(0);

        let rq_id = self.client.router().next_rq_id();
        let packet = Packet::new(XS_UNWATCH, rq_id, self.client.tx_id(), payload)?;
        let cell = self.client.router().send(packet)?;
        let response = cell.wait()?;
        self.client.ack(XS_UNWATCH, response)
    }

    /// Blocks until an event survives the path-prefix filter, then
    /// returns it. Call repeatedly for a restartable iterator; or use
    /// [`Monitor::events`].
    pub fn wait(&self) -> Result<Event> {
        loop {
            let mut events = self.queue.events.lock().unwrap();
            while events.is_empty() {
                if let Some(reason) = self.queue.closed.lock().unwrap().clone() {
                    return Err(Error::Disconnected(reason));
                }
                events = self.queue.ready.wait(events).unwrap();
            }
            let event = events.pop_front().unwrap();
            drop(events);

            if self.unfiltered || self.matches_active_watch(&event) {
                return Ok(event);
            }
        }
    }

    fn matches_active_watch(&self, event: &Event) -> bool {
        self.watches
            .lock()
            .unwrap()
            .keys()
            .any(|(wpath, token)| *token == event.token && is_prefix(wpath, &event.path))
    }

    /// An iterator that calls `wait()` until it returns an error.
    pub fn events(self: &Arc<Self>) -> MonitorEvents {
        MonitorEvents { monitor: self.clone() }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let watches: Vec<((String, String), SubscriptionId)> =
            self.watches.lock().unwrap().drain().collect();
        for ((wpath, token), subscription_id) in watches {
            self.client.router().unsubscribe(&token, subscription_id);

            let mut payload = wpath.into_bytes();
            payload.push(0);
            payload.extend_from_slice(token.as_bytes());
            payload.push(0);

            let rq_id = self.client.router().next_rq_id();
            if let Ok(packet) = Packet::new(XS_UNWATCH, rq_id, self.client.tx_id(), payload) {
                if let Ok(cell) = self.client.router().send(packet) {
                    let _ = cell.wait();
                }
            }
        }
    }
}

impl EventSink for Monitor {
    fn push(&self, path: String, token: String) {
        self.queue.events.lock().unwrap().push_back(Event { path, token });
        self.queue.ready.notify_all();
    }

    fn disconnect(&self, reason: String) {
        *self.queue.closed.lock().unwrap() = Some(reason);
        self.queue.ready.notify_all();
    }
}

/// Iterator form of [`Monitor::wait`].
pub struct MonitorEvents {
    monitor: Arc<Monitor>,
}

impl Iterator for MonitorEvents {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.monitor.wait().ok()
    }
}
