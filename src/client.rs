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

//! The user-facing `Client`: read/write/list/permissions/transactions/
//! domain management, built on top of the router.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::monitor::Monitor;
use crate::path::validate_path;
use crate::perm::{validate_permission, Permission};
use crate::router::Router;
use crate::transport::{StreamSocketTransport, Transport, XenBusTransport};
use crate::wire::{
    DomainId, Packet, TxId, XS_DIRECTORY, XS_ERROR, XS_GET_DOMAIN_PATH, XS_GET_PERMS,
    XS_INTRODUCE, XS_IS_DOMAIN_INTRODUCED, XS_MKDIR, XS_READ, XS_RELEASE, XS_RESUME, XS_RM,
    XS_SET_PERMS, XS_SET_TARGET, XS_TRANSACTION_END, XS_TRANSACTION_START, XS_WRITE,
};

const CAPABILITIES_PATH: &str = "/proc/xen/capabilities";
const CONTROL_DOMAIN_CAPABILITY: &str = "control_d\n";

fn probe_control_domain() -> bool {
    std::fs::read_to_string(CAPABILITIES_PATH)
        .map(|contents| contents == CONTROL_DOMAIN_CAPABILITY)
        .unwrap_or(false)
}

fn strip_trailing_nul(payload: &[u8]) -> &[u8] {
    payload.strip_suffix(&[0u8]).unwrap_or(payload)
}

/// One node visited by [`Client::walk`].
#[derive(Clone, Debug)]
pub struct WalkEntry {
    pub path: String,
    pub value: Vec<u8>,
    pub children: Vec<String>,
}

/// A handle to a XenStore connection. Cloning shares the underlying
/// router (and thus the connection) but starts the clone with no active
/// transaction — see the crate's design notes on transaction handling.
pub struct Client {
    router: Arc<Router>,
    tx_id: TxId,
    is_control_domain: bool,
    supports_watch: bool,
}

impl Client {
    /// Connects over the Unix domain stream socket, resolving the
    /// default path from `XENSTORED_PATH`/`XENSTORED_RUNDIR` when
    /// `path` is `None`.
    pub fn connect_socket(path: Option<PathBuf>) -> Result<Client> {
        let transport = StreamSocketTransport::connect(path)?;
        Client::from_transport(Box::new(transport), true)
    }

    /// Connects over the XenBus character device, resolving the
    /// platform-specific default path when `path` is `None`.
    pub fn connect_xenbus(path: Option<PathBuf>) -> Result<Client> {
        let transport = XenBusTransport::connect(path)?;
        Client::from_transport(Box::new(transport), false)
    }

    fn from_transport(transport: Box<dyn Transport>, supports_watch: bool) -> Result<Client> {
        let router = Router::start(transport)?;
        Ok(Client { router, tx_id: 0, is_control_domain: probe_control_domain(), supports_watch })
    }

    /// Builds a `Client` over an already-connected transport, skipping
    /// the control-domain capability probe (tests don't run as a real
    /// Xen control domain). Used by this crate's own loopback-transport
    /// tests; not exposed outside the crate.
    #[cfg(test)]
    pub(crate) fn for_test(transport: Box<dyn Transport>, is_control_domain: bool) -> Result<Client> {
        let router = Router::start(transport)?;
        Ok(Client { router, tx_id: 0, is_control_domain, supports_watch: true })
    }

    pub(crate) fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub(crate) fn tx_id(&self) -> TxId {
        self.tx_id
    }

    fn require_control_domain(&self) -> Result<()> {
        if self.is_control_domain {
            Ok(())
        } else {
            Err(Error::Remote {
                name: "EPERM",
                errno: nix::errno::Errno::EPERM as i32,
                message: "operation restricted to the control domain".to_string(),
            })
        }
    }

    /// Sends `payload` as `op` and returns the validated response:
    /// daemon `ERROR`s become `Error::Remote`, an op or transaction-id
    /// mismatch becomes `Error::UnexpectedPacket`.
    fn request(&self, op: u32, payload: Vec<u8>) -> Result<Packet> {
        let rq_id = self.router.next_rq_id();
        let packet = Packet::new(op, rq_id, self.tx_id, payload)?;
        let cell = self.router.send(packet)?;
        let response = cell.wait()?;
        self.validate(op, response)
    }

    fn validate(&self, op: u32, response: Packet) -> Result<Packet> {
        if response.op == XS_ERROR {
            return Err(Error::remote(strip_trailing_nul(&response.payload)));
        }
        if response.op != op || response.tx_id != self.tx_id {
            return Err(Error::UnexpectedPacket(format!(
                "expected op {op} tx_id {}, got op {} tx_id {}",
                self.tx_id, response.op, response.tx_id
            )));
        }
        Ok(response)
    }

    /// Sends `payload` as `op`, validates it like [`Client::request`],
    /// and additionally requires a literal `OK\0` acknowledgement.
    fn request_ack(&self, op: u32, payload: Vec<u8>) -> Result<()> {
        let response = self.request(op, payload)?;
        self.ack(op, response)
    }

    /// Checks an already-`validate`d response for the `OK\0` payload
    /// every acknowledgement operation requires. Exposed to `Monitor`,
    /// which drives its own WATCH/UNWATCH requests through `router()`
    /// directly so it can register the subscription before the ack
    /// arrives.
    pub(crate) fn ack(&self, op: u32, response: Packet) -> Result<()> {
        let response = self.validate(op, response)?;
        if response.payload == b"OK\0" {
            Ok(())
        } else {
            Err(Error::UnexpectedPacket(format!(
                "expected OK\\0 acknowledgement for op {op}, got {:?}",
                response.payload
            )))
        }
    }

    fn nul_terminated_args(args: &[&[u8]]) -> Vec<u8> {
        let mut payload = Vec::new();
        for arg in args {
            payload.extend_from_slice(arg);
            payload.push(0);
        }
        payload
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let response = self.request(XS_READ, Self::nul_terminated_args(&[path.as_bytes()]))?;
        Ok(strip_trailing_nul(&response.payload).to_vec())
    }

    pub fn write(&self, path: &str, value: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        let mut payload = path.as_bytes().to_vec();
        payload.push(0);
        payload.extend_from_slice(value);
        self.request_ack(XS_WRITE, payload)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let path = validate_path(path)?;
        self.request_ack(XS_MKDIR, Self::nul_terminated_args(&[path.as_bytes()]))
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        let path = validate_path(path)?;
        self.request_ack(XS_RM, Self::nul_terminated_args(&[path.as_bytes()]))
    }

    pub fn list(&self, path: &str) -> Result<Vec<String>> {
        let path = validate_path(path)?;
        let response = self.request(XS_DIRECTORY, Self::nul_terminated_args(&[path.as_bytes()]))?;
        Ok(split_nul_terminated(&response.payload))
    }

    pub fn get_perms(&self, path: &str) -> Result<Vec<Permission>> {
        let path = validate_path(path)?;
        let response = self.request(XS_GET_PERMS, Self::nul_terminated_args(&[path.as_bytes()]))?;
        split_nul_terminated(&response.payload).iter().map(|t| Permission::parse(t)).collect()
    }

    pub fn set_perms(&self, path: &str, perms: &[Permission]) -> Result<()> {
        let path = validate_path(path)?;
        let mut payload = path.as_bytes().to_vec();
        payload.push(0);
        for perm in perms {
            let token = perm.to_token();
            validate_permission(&token)?;
            payload.extend_from_slice(token.as_bytes());
            payload.push(0);
        }
        self.request_ack(XS_SET_PERMS, payload)
    }

    pub fn get_domain_path(&self, domain: DomainId) -> Result<String> {
        let response =
            self.request(XS_GET_DOMAIN_PATH, Self::nul_terminated_args(&[domain.to_string().as_bytes()]))?;
        Ok(String::from_utf8_lossy(strip_trailing_nul(&response.payload)).into_owned())
    }

    pub fn is_domain_introduced(&self, domain: DomainId) -> Result<bool> {
        let response = self.request(
            XS_IS_DOMAIN_INTRODUCED,
            Self::nul_terminated_args(&[domain.to_string().as_bytes()]),
        )?;
        match strip_trailing_nul(&response.payload) {
            b"T" => Ok(true),
            b"F" => Ok(false),
            other => Err(Error::UnexpectedPacket(format!(
                "expected T or F from IS_DOMAIN_INTRODUCED, got {other:?}"
            ))),
        }
    }

    /// `domain` must be nonzero; the daemon rejects domain `0` with
    /// `EINVAL` rather than this library pre-validating it.
    pub fn introduce_domain(&self, domain: DomainId, mfn: u64, event_channel: u32) -> Result<()> {
        self.require_control_domain()?;
        let payload = Self::nul_terminated_args(&[
            domain.to_string().as_bytes(),
            mfn.to_string().as_bytes(),
            event_channel.to_string().as_bytes(),
        ]);
        self.request_ack(XS_INTRODUCE, payload)
    }

    pub fn release_domain(&self, domain: DomainId) -> Result<()> {
        self.require_control_domain()?;
        self.request_ack(XS_RELEASE, Self::nul_terminated_args(&[domain.to_string().as_bytes()]))
    }

    pub fn resume_domain(&self, domain: DomainId) -> Result<()> {
        self.require_control_domain()?;
        self.request_ack(XS_RESUME, Self::nul_terminated_args(&[domain.to_string().as_bytes()]))
    }

    pub fn set_target(&self, domain: DomainId, target: DomainId) -> Result<()> {
        self.require_control_domain()?;
        let payload =
            Self::nul_terminated_args(&[domain.to_string().as_bytes(), target.to_string().as_bytes()]);
        self.request_ack(XS_SET_TARGET, payload)
    }

    /// Starts a transaction and returns a new `Client` handle carrying
    /// its `tx_id`; every operation on that handle is now part of the
    /// transaction. Fails with `AlreadyInTransaction` if called on a
    /// handle that already has one open.
    pub fn transaction(&self) -> Result<Client> {
        if self.tx_id != 0 {
            return Err(Error::AlreadyInTransaction);
        }
        let response = self.request(XS_TRANSACTION_START, Self::nul_terminated_args(&[b""]))?;
        let tx_id: TxId = std::str::from_utf8(strip_trailing_nul(&response.payload))
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::UnexpectedPacket("TRANSACTION_START returned a non-numeric id".into()))?;

        Ok(Client {
            router: Arc::clone(&self.router),
            tx_id,
            is_control_domain: self.is_control_domain,
            supports_watch: self.supports_watch,
        })
    }

    /// Ends the transaction on this handle. Returns `Ok(true)` on
    /// success, `Ok(false)` on a daemon-reported conflict (`EAGAIN`).
    /// Resets `tx_id` to `0` in both cases, per the crate's design
    /// notes on the transaction guard.
    pub fn commit(&mut self) -> Result<bool> {
        self.end_transaction(b"T\0")
    }

    /// Abandons the transaction on this handle; resets `tx_id` to `0`.
    pub fn rollback(&mut self) -> Result<()> {
        self.end_transaction(b"F\0").map(|_| ())
    }

    fn end_transaction(&mut self, commit_byte: &[u8]) -> Result<bool> {
        if self.tx_id == 0 {
            return Ok(true);
        }
        let result = self.request(XS_TRANSACTION_END, commit_byte.to_vec());
        self.tx_id = 0;
        match result {
            Ok(response) if response.payload == b"OK\0" => Ok(true),
            Ok(response) => {
                Err(Error::UnexpectedPacket(format!("unexpected TRANSACTION_END payload {:?}", response.payload)))
            }
            Err(Error::Remote { errno, .. }) if errno == nix::errno::Errno::EAGAIN as i32 => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Creates a watch subscription handle. Rejected over the XenBus
    /// transport, per the crate's design notes on watch delivery.
    pub fn monitor(&self) -> Result<Arc<Monitor>> {
        self.monitor_with_diagnostics(false)
    }

    /// As [`Client::monitor`], but `wait()` also yields events whose
    /// watch has already been removed — for diagnostics only.
    pub fn monitor_with_diagnostics(&self, unfiltered: bool) -> Result<Arc<Monitor>> {
        if !self.supports_watch {
            return Err(Error::UnexpectedPacket(
                "watch is not supported over the XenBus character-device transport".to_string(),
            ));
        }
        Ok(Monitor::new(self.clone(), unfiltered))
    }

    /// Visits every node beneath `root`, pre-order: each node performs
    /// one `list` and one `read`. A node whose `read` fails (commonly
    /// the root, or a node this client lacks permission on) is yielded
    /// with an empty value rather than aborting the walk.
    pub fn walk(&self, root: &str) -> Result<Vec<WalkEntry>> {
        let mut out = Vec::new();
        self.walk_into(root, &mut out)?;
        Ok(out)
    }

    fn walk_into(&self, path: &str, out: &mut Vec<WalkEntry>) -> Result<()> {
        let children = self.list(path)?;
        let value = self.read(path).unwrap_or_default();
        out.push(WalkEntry { path: path.to_string(), value, children: children.clone() });

        for child in children {
            let child_path = join_path(path, &child);
            self.walk_into(&child_path, out)?;
        }
        Ok(())
    }
}

fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

impl Clone for Client {
    /// Shares the router but resets `tx_id` to `0`: the clone is a
    /// fresh handle over the same connection with no transaction of
    /// its own, mirroring the reference client's `transaction()`
    /// method, which builds a brand new client object rather than
    /// mutating the existing one.
    fn clone(&self) -> Client {
        Client {
            router: Arc::clone(&self.router),
            tx_id: 0,
            is_control_domain: self.is_control_domain,
            supports_watch: self.supports_watch,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.tx_id != 0 {
            log::error!("{}", Error::UncommittedTransaction);
        }
    }
}

fn split_nul_terminated(payload: &[u8]) -> Vec<String> {
    strip_trailing_nul(payload)
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamSocketTransport;
    use crate::wire::{XS_ERROR, XS_TRANSACTION_END, XS_TRANSACTION_START};
    use std::io::Write as _;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn connected_pair() -> (Client, UnixStream) {
        let (client_end, daemon_end) = UnixStream::pair().unwrap();
        let client = Client::for_test(Box::new(StreamSocketTransport::from_stream(client_end)), false).unwrap();
        (client, daemon_end)
    }

    fn respond(daemon_end: &mut UnixStream, request: &Packet, op: u32, payload: &[u8]) {
        let response = Packet::new(op, request.rq_id, request.tx_id, payload.to_vec()).unwrap();
        let mut buf = Vec::new();
        response.encode(&mut buf).unwrap();
        daemon_end.write_all(&buf).unwrap();
    }

    #[test]
    fn read_strips_trailing_nul() {
        let (client, mut daemon_end) = connected_pair();
        let daemon = thread::spawn(move || {
            let request = Packet::decode(&mut daemon_end).unwrap();
            assert_eq!(request.op, XS_READ);
            respond(&mut daemon_end, &request, XS_READ, b"hello\0");
        });
        assert_eq!(client.read("/foo").unwrap(), b"hello");
        daemon.join().unwrap();
    }

    #[test]
    fn write_requires_ok_acknowledgement() {
        let (client, mut daemon_end) = connected_pair();
        let daemon = thread::spawn(move || {
            let request = Packet::decode(&mut daemon_end).unwrap();
            assert_eq!(request.op, XS_WRITE);
            respond(&mut daemon_end, &request, XS_WRITE, b"OK\0");
        });
        client.write("/foo", b"bar").unwrap();
        daemon.join().unwrap();
    }

    #[test]
    fn error_packet_becomes_remote_error() {
        let (client, mut daemon_end) = connected_pair();
        let daemon = thread::spawn(move || {
            let request = Packet::decode(&mut daemon_end).unwrap();
            respond(&mut daemon_end, &request, XS_ERROR, b"ENOENT\0");
        });
        match client.read("/missing") {
            Err(Error::Remote { name, .. }) => assert_eq!(name, "ENOENT"),
            other => panic!("expected Remote error, got {other:?}"),
        }
        daemon.join().unwrap();
    }

    #[test]
    fn privileged_operation_rejected_outside_control_domain() {
        let (client, _daemon_end) = connected_pair();
        match client.introduce_domain(1, 0, 0) {
            Err(Error::Remote { name: "EPERM", .. }) => {}
            other => panic!("expected EPERM, got {other:?}"),
        }
    }

    #[test]
    fn transaction_commit_resets_tx_id_and_returns_true() {
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let client = Client::for_test(Box::new(StreamSocketTransport::from_stream(client_end)), false).unwrap();

        let daemon = thread::spawn(move || {
            let start = Packet::decode(&mut daemon_end).unwrap();
            assert_eq!(start.op, XS_TRANSACTION_START);
            respond(&mut daemon_end, &start, XS_TRANSACTION_START, b"7\0");

            let end = Packet::decode(&mut daemon_end).unwrap();
            assert_eq!(end.op, XS_TRANSACTION_END);
            assert_eq!(end.tx_id, 7);
            assert_eq!(end.payload, b"T\0");
            respond(&mut daemon_end, &end, XS_TRANSACTION_END, b"OK\0");
        });

        let mut txn = client.transaction().unwrap();
        assert_eq!(txn.tx_id(), 7);
        assert!(txn.commit().unwrap());
        assert_eq!(txn.tx_id(), 0);
        daemon.join().unwrap();
    }

    #[test]
    fn transaction_conflict_reports_false_and_still_resets() {
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let client = Client::for_test(Box::new(StreamSocketTransport::from_stream(client_end)), false).unwrap();

        let daemon = thread::spawn(move || {
            let start = Packet::decode(&mut daemon_end).unwrap();
            respond(&mut daemon_end, &start, XS_TRANSACTION_START, b"3\0");
            let end = Packet::decode(&mut daemon_end).unwrap();
            respond(&mut daemon_end, &end, XS_ERROR, b"EAGAIN\0");
        });

        let mut txn = client.transaction().unwrap();
        assert!(!txn.commit().unwrap());
        assert_eq!(txn.tx_id(), 0);
        daemon.join().unwrap();
    }

    #[test]
    fn nested_transaction_is_rejected() {
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let client = Client::for_test(Box::new(StreamSocketTransport::from_stream(client_end)), false).unwrap();

        let daemon = thread::spawn(move || {
            let start = Packet::decode(&mut daemon_end).unwrap();
            respond(&mut daemon_end, &start, XS_TRANSACTION_START, b"1\0");
        });

        let txn = client.transaction().unwrap();
        match txn.transaction() {
            Err(Error::AlreadyInTransaction) => {}
            other => panic!("expected AlreadyInTransaction, got {other:?}"),
        }
        daemon.join().unwrap();
    }

    #[test]
    fn clone_resets_tx_id() {
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let client = Client::for_test(Box::new(StreamSocketTransport::from_stream(client_end)), false).unwrap();
        let daemon = thread::spawn(move || {
            let start = Packet::decode(&mut daemon_end).unwrap();
            respond(&mut daemon_end, &start, XS_TRANSACTION_START, b"9\0");
        });
        let mut txn = client.transaction().unwrap();
        assert_eq!(txn.tx_id(), 9);
        let cloned = txn.clone();
        assert_eq!(cloned.tx_id(), 0);
        // avoid the uncommitted-transaction warning firing for `txn` on drop
        txn.tx_id = 0;
        daemon.join().unwrap();
    }
}
