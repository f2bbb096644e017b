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

//! Path and watch-path validation, applied before any bytes reach the
//! daemon. Mirrors the restrictions ``xenstored`` itself enforces: ASCII
//! alphanumerics plus ``-/_@``, length caps that differ for absolute and
//! relative paths, no doubled or trailing slash.

use crate::error::{Error, Result};
use crate::wire::{XENSTORE_ABS_PATH_MAX, XENSTORE_REL_PATH_MAX};

/// The two watch paths the daemon treats specially: they don't name a
/// node in the tree, only a class of domain lifecycle event.
pub const INTRODUCE_DOMAIN: &str = "@introduceDomain";
pub const RELEASE_DOMAIN: &str = "@releaseDomain";

fn is_path_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'/' | b'_' | b'@')
}

/// Validates a plain (non-watch) path and returns it unchanged.
///
/// Absolute paths (leading `/`) may be up to 3072 bytes; relative paths
/// up to 2048. Neither may contain `//`, and only the root path `/` may
/// end in `/`.
pub fn validate_path(path: &str) -> Result<&str> {
    if path.is_empty() {
        return Err(Error::InvalidPath("path must not be empty".into()));
    }

    let max_len = if path.starts_with('/') { XENSTORE_ABS_PATH_MAX } else { XENSTORE_REL_PATH_MAX };
    if path.len() > max_len {
        return Err(Error::InvalidPath(format!(
            "path of {} bytes exceeds the {} byte limit",
            path.len(),
            max_len
        )));
    }

    if !path.bytes().all(is_path_byte) {
        return Err(Error::InvalidPath(format!(
            "path {path:?} contains a byte outside [A-Za-z0-9-/_@]"
        )));
    }

    if path.contains("//") {
        return Err(Error::InvalidPath(format!("path {path:?} contains a doubled /")));
    }

    if path != "/" && path.ends_with('/') {
        return Err(Error::InvalidPath(format!("path {path:?} has a trailing /")));
    }

    Ok(path)
}

/// Validates a watch path: either a plain path, or one of the two
/// reserved domain-lifecycle tokens.
pub fn validate_watch_path(path: &str) -> Result<&str> {
    if path == INTRODUCE_DOMAIN || path == RELEASE_DOMAIN {
        return Ok(path);
    }
    if path.starts_with('@') {
        return Err(Error::InvalidPath(format!(
            "{path:?} is not a recognized reserved watch path"
        )));
    }
    validate_path(path)
}

/// Returns true if `path` is `prefix` or a descendant of it, with the
/// match anchored at a `/` boundary (so `/a` is a prefix of `/a/b` but
/// not of `/ab`). Used by the monitor's watch-path filter, §4.6.
pub fn is_prefix(prefix: &str, path: &str) -> bool {
    if prefix == path {
        return true;
    }
    if prefix == "/" {
        return path.starts_with('/');
    }
    path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/')
}
