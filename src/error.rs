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

//! The error taxonomy for the crate: validation failures caught before any
//! I/O happens, protocol violations that take the router down, remote
//! errors reported by the daemon, transport failures, and caller misuse.

use std::io;
use thiserror::Error;

/// Every error this crate can return.
#[derive(Debug, Error)]
pub enum Error {
    /// A path failed the syntax/length checks in [`crate::path`].
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A permission token failed the `[wrbn][0-9]+` check.
    #[error("invalid permission: {0}")]
    InvalidPermission(String),

    /// An operation code outside the table in `wire::Op`.
    #[error("invalid operation: {0}")]
    InvalidOperation(u32),

    /// A payload longer than `XENSTORE_PAYLOAD_MAX` (4096) bytes.
    #[error("invalid payload: {0} bytes exceeds the 4096 byte limit")]
    InvalidPayload(usize),

    /// The daemon sent a packet this router did not expect: a response
    /// whose `op` or `tx_id` does not match the request, or one whose
    /// `rq_id` has no registered waiter.
    #[error("unexpected packet: {0}")]
    UnexpectedPacket(String),

    /// The daemon returned an `ERROR` packet; `errno` is the POSIX
    /// errno this carries, decoded from the ASCII name on the wire.
    #[error("{name}: {message}")]
    Remote { name: &'static str, errno: i32, message: String },

    /// The transport was reset, or never connected in the first place.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Attempted to start a transaction while one is already open on
    /// this client handle.
    #[error("a transaction is already open on this client")]
    AlreadyInTransaction,

    /// A `Client` with a non-zero `tx_id` was dropped without the
    /// transaction having been committed or rolled back.
    #[error("client dropped with an uncommitted transaction")]
    UncommittedTransaction,

    /// An I/O error from the underlying transport that was not one of
    /// the reset conditions mapped to `Disconnected`.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// An error from a `nix` syscall wrapper (pipe, open, poll, ...).
    #[error(transparent)]
    Nix(#[from] nix::errno::Errno),
}

impl Error {
    /// The errno of a `Remote` error, if this is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Remote { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Builds a `Remote` error from the ASCII errno name the daemon sent
    /// in an `ERROR` packet's payload, e.g. `b"ENOENT"`.
    pub fn remote(name_bytes: &[u8]) -> Error {
        let name = std::str::from_utf8(name_bytes).unwrap_or("");
        let (name, errno) = errno_by_name(name);
        Error::Remote { name, errno, message: format!("daemon returned {name}") }
    }
}

/// Table-driven mapping from the ASCII errno name XenStore puts on the
/// wire to the POSIX errno the daemon means. Mirrors `xen/include/public/
/// io/xs_wire.h`'s `xsd_errors` table; unrecognized names map to `EIO`.
fn errno_by_name(name: &str) -> (&'static str, i32) {
    use nix::errno::Errno;
    let errno = match name {
        "EINVAL" => Errno::EINVAL,
        "EACCES" => Errno::EACCES,
        "EEXIST" => Errno::EEXIST,
        "EISDIR" => Errno::EISDIR,
        "ENOENT" => Errno::ENOENT,
        "ENOMEM" => Errno::ENOMEM,
        "ENOSPC" => Errno::ENOSPC,
        "EIO" => Errno::EIO,
        "ENOTEMPTY" => Errno::ENOTEMPTY,
        "ENOSYS" => Errno::ENOSYS,
        "EROFS" => Errno::EROFS,
        "EBUSY" => Errno::EBUSY,
        "EAGAIN" => Errno::EAGAIN,
        "EISCONN" => Errno::EISCONN,
        "E2BIG" => Errno::E2BIG,
        "EPERM" => Errno::EPERM,
        "EALREADY" => Errno::EALREADY,
        _ => return ("EIO", Errno::EIO as i32),
    };
    // Recover a `'static` copy of the matched name rather than leaking
    // the caller's buffer.
    let name: &'static str = match errno {
        Errno::EINVAL => "EINVAL",
        Errno::EACCES => "EACCES",
        Errno::EEXIST => "EEXIST",
        Errno::EISDIR => "EISDIR",
        Errno::ENOENT => "ENOENT",
        Errno::ENOMEM => "ENOMEM",
        Errno::ENOSPC => "ENOSPC",
        Errno::EIO => "EIO",
        Errno::ENOTEMPTY => "ENOTEMPTY",
        Errno::ENOSYS => "ENOSYS",
        Errno::EROFS => "EROFS",
        Errno::EBUSY => "EBUSY",
        Errno::EAGAIN => "EAGAIN",
        Errno::EISCONN => "EISCONN",
        Errno::E2BIG => "E2BIG",
        Errno::EPERM => "EPERM",
        Errno::EALREADY => "EALREADY",
        _ => "EIO",
    };
    (name, errno as i32)
}

pub type Result<T> = std::result::Result<T, Error>;
