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

//! A client library for XenStore: the request/response multiplexer and
//! watch demultiplexer that sits between a caller and `xenstored`, over
//! either a Unix domain socket or the XenBus character device.

pub mod client;
pub mod error;
pub mod monitor;
pub mod path;
pub mod perm;
pub mod response_cell;
pub mod router;
pub mod transport;
pub mod wire;

pub use client::{Client, WalkEntry};
pub use error::{Error, Result};
pub use monitor::{Event, Monitor, MonitorEvents};
pub use perm::{Mode, Permission};
