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

//! Permission token validation: `[wrbn][0-9]+`, one mode letter followed
//! by a decimal domain id.

use crate::error::{Error, Result};
use crate::wire::DomainId;

/// A permission, as exchanged in `GET_PERMS`/`SET_PERMS` payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Write,
    Read,
    Both,
    None,
}

impl Mode {
    fn letter(self) -> char {
        match self {
            Mode::Write => 'w',
            Mode::Read => 'r',
            Mode::Both => 'b',
            Mode::None => 'n',
        }
    }

    fn from_letter(c: char) -> Option<Mode> {
        match c {
            'w' => Some(Mode::Write),
            'r' => Some(Mode::Read),
            'b' => Some(Mode::Both),
            'n' => Some(Mode::None),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Permission {
    pub mode: Mode,
    pub domain: DomainId,
}

impl Permission {
    pub fn new(mode: Mode, domain: DomainId) -> Permission {
        Permission { mode, domain }
    }

    pub fn to_token(self) -> String {
        format!("{}{}", self.mode.letter(), self.domain)
    }

    pub fn parse(token: &str) -> Result<Permission> {
        let mut chars = token.chars();
        let mode = chars
            .next()
            .and_then(Mode::from_letter)
            .ok_or_else(|| Error::InvalidPermission(token.to_string()))?;

        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidPermission(token.to_string()));
        }
        let domain: DomainId = digits
            .parse()
            .map_err(|_| Error::InvalidPermission(token.to_string()))?;

        Ok(Permission::new(mode, domain))
    }
}

/// Validates a raw permission token and returns it unchanged.
pub fn validate_permission(token: &str) -> Result<&str> {
    Permission::parse(token)?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_mode_letter() {
        assert_eq!(Permission::parse("w12").unwrap(), Permission::new(Mode::Write, 12));
        assert_eq!(Permission::parse("r0").unwrap(), Permission::new(Mode::Read, 0));
        assert_eq!(Permission::parse("b7").unwrap(), Permission::new(Mode::Both, 7));
        assert_eq!(Permission::parse("n3").unwrap(), Permission::new(Mode::None, 3));
    }

    #[test]
    fn rejects_unknown_letter() {
        assert!(Permission::parse("x1").is_err());
    }

    #[test]
    fn rejects_missing_digits() {
        assert!(Permission::parse("w").is_err());
        assert!(Permission::parse("w1a").is_err());
    }

    #[test]
    fn accepts_large_domain_id() {
        assert!(Permission::parse("w4294967295").is_ok());
    }

    #[test]
    fn round_trips_through_token() {
        let p = Permission::new(Mode::Both, 42);
        assert_eq!(Permission::parse(&p.to_token()).unwrap(), p);
    }

    #[test]
    fn validate_permission_returns_input() {
        assert_eq!(validate_permission("r5").unwrap(), "r5");
    }
}
