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

//! The request/response multiplexer and watch demultiplexer. One router
//! owns one transport and one background reader thread; any number of
//! `Client` handles may share it.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Result};
use crate::response_cell::ResponseCell;
use crate::transport::Transport;
use crate::wire::{Packet, ReqId, XS_WATCH_EVENT};

const TOKEN_TRANSPORT: Token = Token(0);
const TOKEN_SHUTDOWN: Token = Token(1);

/// Receives watch events dispatched by the reader thread. Implemented by
/// `Monitor`; kept as a trait here so the router doesn't need to know
/// about monitors directly.
pub trait EventSink: Send + Sync {
    fn push(&self, path: String, token: String);

    /// Called on every subscribed sink when the reader thread exits, so
    /// a monitor blocked in `wait()` doesn't hang forever.
    fn disconnect(&self, reason: String);
}

/// Identifies one `subscribe` call so `unsubscribe` doesn't need to
/// compare `Arc` identity (which a `Monitor`'s `Drop` impl, holding only
/// `&mut self`, has no way to reconstruct).
pub type SubscriptionId = u64;

struct Shared {
    writer: Mutex<Box<dyn Transport>>,
    pending: Mutex<HashMap<ReqId, ResponseCell>>,
    subscribers: Mutex<HashMap<String, Vec<(SubscriptionId, Arc<dyn EventSink>)>>>,
    next_rq_id: AtomicU32,
    next_subscription_id: AtomicU64,
}

/// Owns the connection to the daemon and the background reader thread
/// that demultiplexes it. Constructed once per connection; `Client`
/// handles hold an `Arc<Router>` and the last one dropped tears it down.
pub struct Router {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown_write: OwnedFd,
    terminated: AtomicBool,
}

impl Router {
    /// Spawns the reader thread over an already-connected transport.
    pub fn start(transport: Box<dyn Transport>) -> Result<Arc<Router>> {
        let reader_transport = transport.try_clone()?;

        let (shutdown_read, shutdown_write) = nix::unistd::pipe()?;

        let shared = Arc::new(Shared {
            writer: Mutex::new(transport),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_rq_id: AtomicU32::new(1),
            next_subscription_id: AtomicU64::new(1),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name("xenstore-reader".to_string())
            .spawn(move || reader_loop(reader_shared, reader_transport, shutdown_read))
            .map_err(Error::Io)?;

        log::debug!("router started");

        Ok(Arc::new(Router {
            shared,
            reader: Mutex::new(Some(reader)),
            shutdown_write,
            terminated: AtomicBool::new(false),
        }))
    }

    /// The next request id this router will hand out. Distinct per call;
    /// wraps at `u32::MAX` (§9, "Request-id domain").
    pub fn next_rq_id(&self) -> ReqId {
        self.shared.next_rq_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Serializes `packet` onto the transport and registers a cell for
    /// its response under `packet.rq_id`.
    pub fn send(&self, packet: Packet) -> Result<ResponseCell> {
        let cell = ResponseCell::new();
        self.shared.pending.lock().unwrap().insert(packet.rq_id, cell.clone());

        let mut writer = self.shared.writer.lock().unwrap();
        if let Err(e) = writer.send(&packet) {
            drop(writer);
            self.shared.pending.lock().unwrap().remove(&packet.rq_id);
            return Err(e);
        }
        Ok(cell)
    }

    /// Registers `sink` to receive watch events carrying `token`.
    /// Returns an id `unsubscribe` uses to remove exactly this
    /// registration.
    pub fn subscribe(&self, token: &str, sink: Arc<dyn EventSink>) -> SubscriptionId {
        let id = self.shared.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers
            .lock()
            .unwrap()
            .entry(token.to_string())
            .or_default()
            .push((id, sink));
        id
    }

    /// Removes the registration `id` from `token`'s subscriber list.
    /// Idempotent: unsubscribing an id twice is a no-op.
    pub fn unsubscribe(&self, token: &str, id: SubscriptionId) {
        let mut subscribers = self.shared.subscribers.lock().unwrap();
        if let Some(sinks) = subscribers.get_mut(token) {
            sinks.retain(|(sink_id, _)| *sink_id != id);
            if sinks.is_empty() {
                subscribers.remove(token);
            }
        }
    }

    /// Pokes the self-pipe and joins the reader thread. Idempotent.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("terminating router");
        let _ = nix::unistd::write(&self.shutdown_write, &[0u8]);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn reader_loop(shared: Arc<Shared>, mut transport: Box<dyn Transport>, shutdown_read: OwnedFd) {
    let result = reader_poll_loop(&shared, &mut transport, &shutdown_read);
    transport.close();

    let reason = match result {
        Ok(()) => "router terminated".to_string(),
        Err(e) => {
            log::error!("router reader exiting: {e}");
            format!("connection lost: {e}")
        }
    };
    for (_, cell) in shared.pending.lock().unwrap().drain() {
        cell.disconnect(reason.clone());
    }
    let sinks: Vec<Arc<dyn EventSink>> = shared
        .subscribers
        .lock()
        .unwrap()
        .values()
        .flatten()
        .map(|(_, sink)| sink.clone())
        .collect();
    for sink in sinks {
        sink.disconnect(reason.clone());
    }
    log::debug!("router reader thread exiting");
}

/// Returns `Ok(())` on a clean shutdown request, `Err` on any transport
/// or protocol failure. Both outcomes unwind to the same cleanup in
/// `reader_loop`.
fn reader_poll_loop(
    shared: &Arc<Shared>,
    transport: &mut Box<dyn Transport>,
    shutdown_read: &OwnedFd,
) -> Result<()> {
    let mut poll = Poll::new()?;
    let transport_fd: RawFd = transport.as_raw_fd();
    let shutdown_fd: RawFd = shutdown_read.as_raw_fd();

    poll.registry().register(&mut SourceFd(&transport_fd), TOKEN_TRANSPORT, Interest::READABLE)?;
    poll.registry().register(&mut SourceFd(&shutdown_fd), TOKEN_SHUTDOWN, Interest::READABLE)?;

    let mut events = Events::with_capacity(16);
    loop {
        poll.poll(&mut events, None)?;
        for event in events.iter() {
            if event.token() == TOKEN_SHUTDOWN {
                return Ok(());
            }
        }

        let packet = transport.recv()?;
        dispatch(shared, packet)?;
    }
}

/// Routes one decoded packet to its waiter. An unmatched `rq_id` is a
/// protocol violation (§4.4, §7): the daemon is no longer speaking a
/// protocol this router can follow, so this returns an error instead of
/// just logging, which `reader_poll_loop` propagates out to the same
/// teardown path a transport failure takes.
fn dispatch(shared: &Arc<Shared>, packet: Packet) -> Result<()> {
    if packet.op == XS_WATCH_EVENT {
        dispatch_watch_event(shared, packet);
        return Ok(());
    }

    let cell = shared.pending.lock().unwrap().remove(&packet.rq_id);
    match cell {
        Some(cell) => {
            cell.publish(packet);
            Ok(())
        }
        None => Err(Error::UnexpectedPacket(format!(
            "op {} rq_id {} tx_id {} has no registered waiter",
            packet.op, packet.rq_id, packet.tx_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamSocketTransport;
    use crate::wire::{XS_ERROR, XS_WATCH_EVENT, XS_WRITE};
    use std::io::Write as _;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    struct TestSink {
        events: Mutex<Vec<(String, String)>>,
        closed: Mutex<Option<String>>,
    }

    impl TestSink {
        fn new() -> Arc<TestSink> {
            Arc::new(TestSink { events: Mutex::new(Vec::new()), closed: Mutex::new(None) })
        }
    }

    impl EventSink for TestSink {
        fn push(&self, path: String, token: String) {
            self.events.lock().unwrap().push((path, token));
        }

        fn disconnect(&self, reason: String) {
            *self.closed.lock().unwrap() = Some(reason);
        }
    }

    fn respond(daemon_end: &mut UnixStream, request: &Packet, payload: &[u8]) {
        let response = Packet::new(request.op, request.rq_id, request.tx_id, payload.to_vec()).unwrap();
        let mut buf = Vec::new();
        response.encode(&mut buf).unwrap();
        daemon_end.write_all(&buf).unwrap();
    }

    #[test]
    fn request_response_round_trip() {
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let router = Router::start(Box::new(StreamSocketTransport::from_stream(client_end))).unwrap();

        let daemon = thread::spawn(move || {
            let request = Packet::decode(&mut daemon_end).unwrap();
            assert_eq!(request.op, XS_WRITE);
            respond(&mut daemon_end, &request, b"OK\0");
        });

        let rq_id = router.next_rq_id();
        let packet = Packet::new(XS_WRITE, rq_id, 0, b"/foo\0bar".to_vec()).unwrap();
        let cell = router.send(packet).unwrap();
        let response = cell.wait().unwrap();
        assert_eq!(response.payload, b"OK\0");
        daemon.join().unwrap();
    }

    #[test]
    fn out_of_order_responses_route_by_rq_id() {
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let router = Router::start(Box::new(StreamSocketTransport::from_stream(client_end))).unwrap();

        let first_rq_id = router.next_rq_id();
        let second_rq_id = router.next_rq_id();
        let first = router.send(Packet::new(XS_WRITE, first_rq_id, 0, Vec::new()).unwrap()).unwrap();
        let second = router.send(Packet::new(XS_WRITE, second_rq_id, 0, Vec::new()).unwrap()).unwrap();

        let daemon = thread::spawn(move || {
            let req_a = Packet::decode(&mut daemon_end).unwrap();
            let req_b = Packet::decode(&mut daemon_end).unwrap();
            // answer whichever request arrived second, first
            respond(&mut daemon_end, &req_b, b"second\0");
            respond(&mut daemon_end, &req_a, b"first\0");
        });

        assert_eq!(second.wait().unwrap().payload, b"second\0");
        assert_eq!(first.wait().unwrap().payload, b"first\0");
        daemon.join().unwrap();
    }

    #[test]
    fn watch_event_dispatches_to_matching_subscriber() {
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let router = Router::start(Box::new(StreamSocketTransport::from_stream(client_end))).unwrap();

        let sink = TestSink::new();
        router.subscribe("my-token", sink.clone());

        let mut payload = b"/local/domain/1\0".to_vec();
        payload.extend_from_slice(b"my-token\0");
        let event = Packet::new(XS_WATCH_EVENT, 0, 0, payload).unwrap();
        let mut buf = Vec::new();
        event.encode(&mut buf).unwrap();
        daemon_end.write_all(&buf).unwrap();

        for _ in 0..200 {
            if !sink.events.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        let events = sink.events.lock().unwrap();
        assert_eq!(events.as_slice(), &[("/local/domain/1".to_string(), "my-token".to_string())]);
    }

    #[test]
    fn daemon_error_response_is_delivered_as_a_packet() {
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let router = Router::start(Box::new(StreamSocketTransport::from_stream(client_end))).unwrap();

        let daemon = thread::spawn(move || {
            let request = Packet::decode(&mut daemon_end).unwrap();
            respond(&mut daemon_end, &request, b"ENOENT\0");
        });

        let cell = router.send(Packet::new(XS_WRITE, router.next_rq_id(), 0, Vec::new()).unwrap()).unwrap();
        let response = cell.wait().unwrap();
        assert_eq!(response.op, XS_ERROR);
        assert_eq!(response.payload, b"ENOENT\0");
        daemon.join().unwrap();
    }

    #[test]
    fn unmatched_rq_id_is_fatal_to_the_router() {
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let router = Router::start(Box::new(StreamSocketTransport::from_stream(client_end))).unwrap();

        let cell = router.send(Packet::new(XS_WRITE, router.next_rq_id(), 0, Vec::new()).unwrap()).unwrap();

        let daemon = thread::spawn(move || {
            let request = Packet::decode(&mut daemon_end).unwrap();
            // respond with an rq_id nothing is waiting on
            respond(&mut daemon_end, &Packet { rq_id: request.rq_id.wrapping_add(1), ..request }, b"OK\0");
        });

        match cell.wait() {
            Err(Error::Disconnected(_)) => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
        daemon.join().unwrap();
    }

    #[test]
    fn explicit_terminate_disconnects_in_flight_waiters_and_joins_reader() {
        let (client_end, _daemon_end) = UnixStream::pair().unwrap();
        let router = Router::start(Box::new(StreamSocketTransport::from_stream(client_end))).unwrap();

        let cells: Vec<ResponseCell> = (0..4)
            .map(|_| router.send(Packet::new(XS_WRITE, router.next_rq_id(), 0, Vec::new()).unwrap()).unwrap())
            .collect();

        let waiters: Vec<_> = cells
            .into_iter()
            .map(|cell| thread::spawn(move || cell.wait()))
            .collect();

        // give the waiter threads a chance to actually block before terminating
        thread::sleep(Duration::from_millis(20));
        router.terminate();

        for waiter in waiters {
            match waiter.join().unwrap() {
                Err(Error::Disconnected(_)) => {}
                other => panic!("expected Disconnected, got {other:?}"),
            }
        }

        // terminate() only returns once the reader thread has been joined;
        // calling it again must stay a no-op rather than panic or block.
        router.terminate();
    }

    #[test]
    fn reader_exit_disconnects_pending_and_subscribers() {
        let (client_end, daemon_end) = UnixStream::pair().unwrap();
        let router = Router::start(Box::new(StreamSocketTransport::from_stream(client_end))).unwrap();

        let sink = TestSink::new();
        router.subscribe("a-token", sink.clone());
        let cell = router.send(Packet::new(XS_WRITE, router.next_rq_id(), 0, Vec::new()).unwrap()).unwrap();

        drop(daemon_end);

        match cell.wait() {
            Err(Error::Disconnected(_)) => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
        for _ in 0..200 {
            if sink.closed.lock().unwrap().is_some() {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(sink.closed.lock().unwrap().is_some());
    }
}

fn dispatch_watch_event(shared: &Arc<Shared>, packet: Packet) {
    let mut parts = packet.payload.splitn(2, |&b| b == 0);
    let path = parts.next().unwrap_or(b"");
    let token = parts.next().unwrap_or(b"");
    let token = token.strip_suffix(&[0u8]).unwrap_or(token);

    let (path, token) = match (std::str::from_utf8(path), std::str::from_utf8(token)) {
        (Ok(path), Ok(token)) => (path.to_string(), token.to_string()),
        _ => {
            log::warn!("dropping WATCH_EVENT with non-UTF8 payload");
            return;
        }
    };

    let subscribers = shared.subscribers.lock().unwrap();
    match subscribers.get(token.as_str()) {
        Some(sinks) => {
            for (_, sink) in sinks {
                sink.push(path.clone(), token.clone());
            }
        }
        None => log::warn!("dropping WATCH_EVENT for unsubscribed token {token:?}"),
    }
}
