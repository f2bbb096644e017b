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

//! The byte-oriented connection to `xenstored`: a Unix domain stream
//! socket from user space in the control domain, or the XenBus character
//! device from inside a guest. Both speak the same framed packet
//! protocol from `wire`; this module only owns the read-exactly /
//! write-all loops and the platform-specific path resolution.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::wire::Packet;

/// The three POSIX errors that mean "the peer went away", regardless of
/// which transport produced them.
fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc_errno) if [nix::libc::ECONNRESET, nix::libc::ECONNABORTED, nix::libc::EPIPE]
            .contains(&libc_errno)
    ) || err.kind() == ErrorKind::ConnectionReset
        || err.kind() == ErrorKind::ConnectionAborted
        || err.kind() == ErrorKind::BrokenPipe
}

/// A connection to the daemon, abstracted over its two concrete forms.
pub trait Transport: Send {
    /// Sends one complete packet with a write-all loop.
    fn send(&mut self, packet: &Packet) -> Result<()>;

    /// Receives one complete packet with a read-exactly loop.
    fn recv(&mut self) -> Result<Packet>;

    /// True once `connect` has succeeded and `close` has not run since.
    fn is_connected(&self) -> bool;

    /// Tears down the underlying descriptor. Idempotent.
    fn close(&mut self);

    /// The descriptor mio should poll for readability.
    fn as_raw_fd(&self) -> RawFd;

    /// Duplicates the underlying descriptor so the router's reader
    /// thread and its writer (the send path) can each own a handle to
    /// the same connection without sharing a lock across a blocking
    /// read.
    fn try_clone(&self) -> Result<Box<dyn Transport>>;
}

fn xenstored_socket_path() -> PathBuf {
    if let Ok(path) = env::var("XENSTORED_PATH") {
        return PathBuf::from(path);
    }
    let rundir = env::var("XENSTORED_RUNDIR").unwrap_or_else(|_| "/var/run/xenstored".to_string());
    Path::new(&rundir).join("socket")
}

/// A Unix domain stream socket connection, used from the control domain.
pub struct StreamSocketTransport {
    path: PathBuf,
    stream: Option<UnixStream>,
}

impl StreamSocketTransport {
    /// Connects to `path`, or to the default socket path resolved from
    /// `XENSTORED_PATH`/`XENSTORED_RUNDIR` when `path` is `None`.
    pub fn connect(path: Option<PathBuf>) -> Result<StreamSocketTransport> {
        let path = path.unwrap_or_else(xenstored_socket_path);
        log::debug!("connecting to xenstored socket at {}", path.display());
        let stream = UnixStream::connect(&path)
            .map_err(|e| Error::Disconnected(format!("connecting to {}: {e}", path.display())))?;
        Ok(StreamSocketTransport { path, stream: Some(stream) })
    }
}

impl Transport for StreamSocketTransport {
    fn send(&mut self, packet: &Packet) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| Error::Disconnected(self.path.display().to_string()))?;
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        log::trace!("sending {} bytes to {}", buf.len(), self.path.display());
        match stream.write_all(&buf) {
            Ok(()) => Ok(()),
            Err(e) if is_reset(&e) => {
                self.close();
                Err(Error::Disconnected(format!("{}: {e}", self.path.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn recv(&mut self) -> Result<Packet> {
        let path = self.path.clone();
        let stream =
            self.stream.as_mut().ok_or_else(|| Error::Disconnected(path.display().to_string()))?;
        match Packet::decode(stream) {
            Ok(packet) => {
                log::trace!("received {} byte payload from {}", packet.payload.len(), path.display());
                Ok(packet)
            }
            Err(Error::Io(e)) if is_reset(&e) || e.kind() == ErrorKind::UnexpectedEof => {
                self.close();
                Err(Error::Disconnected(format!("{}: {e}", path.display())))
            }
            Err(e) => Err(e),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            log::debug!("closing xenstored socket at {}", self.path.display());
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    fn try_clone(&self) -> Result<Box<dyn Transport>> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::Disconnected(self.path.display().to_string()))?
            .try_clone()?;
        Ok(Box::new(StreamSocketTransport { path: self.path.clone(), stream: Some(stream) }))
    }
}

#[cfg(test)]
impl StreamSocketTransport {
    /// Wraps an already-connected socket, bypassing `connect`'s path
    /// resolution. Used to drive the router and client over
    /// `UnixStream::pair()` in tests, against a real file descriptor
    /// mio can poll rather than a hand-rolled double.
    pub(crate) fn from_stream(stream: UnixStream) -> StreamSocketTransport {
        StreamSocketTransport { path: PathBuf::from("<test-pair>"), stream: Some(stream) }
    }
}

#[cfg(target_os = "linux")]
fn xenbus_device_path() -> &'static str {
    if nix::unistd::access("/dev/xen/xenbus", nix::unistd::AccessFlags::R_OK).is_ok() {
        "/dev/xen/xenbus"
    } else {
        "/proc/xen/xenbus"
    }
}

#[cfg(target_os = "netbsd")]
fn xenbus_device_path() -> &'static str {
    "/kern/xen/xenbus"
}

#[cfg(not(any(target_os = "linux", target_os = "netbsd")))]
fn xenbus_device_path() -> &'static str {
    "/dev/xen/xenbus"
}

/// A connection through the XenBus character device, used from guest
/// domains. The device has byte-stream semantics like a pipe: reads and
/// writes may be short and must be looped to completion.
pub struct XenBusTransport {
    path: PathBuf,
    file: Option<File>,
}

impl XenBusTransport {
    pub fn connect(path: Option<PathBuf>) -> Result<XenBusTransport> {
        let path = path.unwrap_or_else(|| PathBuf::from(xenbus_device_path()));
        log::debug!("opening xenbus device at {}", path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Disconnected(format!("opening {}: {e}", path.display())))?;
        Ok(XenBusTransport { path, file: Some(file) })
    }
}

impl Transport for XenBusTransport {
    fn send(&mut self, packet: &Packet) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| Error::Disconnected(self.path.display().to_string()))?;
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        log::trace!("sending {} bytes to {}", buf.len(), self.path.display());
        match file.write_all(&buf) {
            Ok(()) => Ok(()),
            Err(e) if is_reset(&e) => {
                self.close();
                Err(Error::Disconnected(format!("{}: {e}", self.path.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn recv(&mut self) -> Result<Packet> {
        let path = self.path.clone();
        let file = self.file.as_mut().ok_or_else(|| Error::Disconnected(path.display().to_string()))?;
        match Packet::decode(file) {
            Ok(packet) => {
                log::trace!("received {} byte payload from {}", packet.payload.len(), path.display());
                Ok(packet)
            }
            Err(Error::Io(e)) if is_reset(&e) || e.kind() == ErrorKind::UnexpectedEof => {
                self.close();
                Err(Error::Disconnected(format!("{}: {e}", path.display())))
            }
            Err(e) => Err(e),
        }
    }

    fn is_connected(&self) -> bool {
        self.file.is_some()
    }

    fn close(&mut self) {
        if let Some(file) = self.file.take() {
            log::debug!("closing xenbus device at {}", self.path.display());
            drop(file);
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        self.file.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1)
    }

    fn try_clone(&self) -> Result<Box<dyn Transport>> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| Error::Disconnected(self.path.display().to_string()))?
            .try_clone()?;
        Ok(Box::new(XenBusTransport { path: self.path.clone(), file: Some(file) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_takes_precedence() {
        env::set_var("XENSTORED_PATH", "/tmp/custom-socket");
        assert_eq!(xenstored_socket_path(), PathBuf::from("/tmp/custom-socket"));
        env::remove_var("XENSTORED_PATH");
    }

    #[test]
    fn rundir_joins_default_socket_name() {
        env::remove_var("XENSTORED_PATH");
        env::set_var("XENSTORED_RUNDIR", "/tmp/xenstored-test");
        assert_eq!(xenstored_socket_path(), PathBuf::from("/tmp/xenstored-test/socket"));
        env::remove_var("XENSTORED_RUNDIR");
    }

    #[test]
    fn falls_back_to_well_known_rundir() {
        env::remove_var("XENSTORED_PATH");
        env::remove_var("XENSTORED_RUNDIR");
        assert_eq!(xenstored_socket_path(), PathBuf::from("/var/run/xenstored/socket"));
    }
}
