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

//! A single-assignment rendezvous: the router's reader thread publishes
//! exactly one value into a cell, and the caller thread that registered
//! it blocks until that happens.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::Error;
use crate::wire::Packet;

enum Slot {
    Empty,
    Packet(Packet),
    /// The router shut down (or the connection was lost) before a
    /// response arrived.
    Disconnected(String),
}

struct Inner {
    slot: Mutex<Slot>,
    ready: Condvar,
}

/// The sender half, held by the router while a request is outstanding.
#[derive(Clone)]
pub struct ResponseCell {
    inner: Arc<Inner>,
}

impl ResponseCell {
    pub fn new() -> ResponseCell {
        ResponseCell {
            inner: Arc::new(Inner { slot: Mutex::new(Slot::Empty), ready: Condvar::new() }),
        }
    }

    /// Publishes the response packet, waking the waiter. A no-op if the
    /// cell has already been resolved (defensive against duplicate
    /// dispatch; should not happen under the router's own invariants).
    pub fn publish(&self, packet: Packet) {
        let mut slot = self.inner.slot.lock().unwrap();
        if matches!(*slot, Slot::Empty) {
            *slot = Slot::Packet(packet);
            self.inner.ready.notify_all();
        }
    }

    /// Publishes a terminal disconnection, waking the waiter with an
    /// error instead of a packet. Used when the router's reader exits
    /// with requests still pending.
    pub fn disconnect(&self, reason: String) {
        let mut slot = self.inner.slot.lock().unwrap();
        if matches!(*slot, Slot::Empty) {
            *slot = Slot::Disconnected(reason);
            self.inner.ready.notify_all();
        }
    }

    /// Blocks until the cell is resolved, then consumes it.
    pub fn wait(&self) -> Result<Packet, Error> {
        let mut slot = self.inner.slot.lock().unwrap();
        while matches!(*slot, Slot::Empty) {
            slot = self.inner.ready.wait(slot).unwrap();
        }
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Packet(packet) => Ok(packet),
            Slot::Disconnected(reason) => Err(Error::Disconnected(reason)),
            Slot::Empty => unreachable!("woke from condvar wait with an empty slot"),
        }
    }
}

impl Default for ResponseCell {
    fn default() -> Self {
        ResponseCell::new()
    }
}
