use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Permission code that grants every permission.
pub const ACCESS_ALL: Permission = Permission(u16::MAX);

/// A single permission, identified by its numeric code.
///
/// Codes are packed one `char` per permission, so zero and the UTF-16
/// surrogate range are not valid codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Permission(u16);

impl Permission {
    /// Validates a permission code.
    pub fn new(code: u16) -> Result<Self> {
        if code == 0 {
            return Err(Error::InvalidPermission(
                "permission code 0 is reserved".to_string(),
            ));
        }
        if (0xD800..=0xDFFF).contains(&code) {
            return Err(Error::InvalidPermission(format!(
                "permission code {code} falls in the surrogate range"
            )));
        }
        Ok(Self(code))
    }

    /// Returns the numeric code.
    pub const fn code(self) -> u16 {
        self.0
    }

    fn as_char(self) -> Option<char> {
        char::from_u32(u32::from(self.0))
    }
}

impl TryFrom<u16> for Permission {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Permission> for u16 {
    fn from(value: Permission) -> Self {
        value.0
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of permissions packed into a string, one character per code.
///
/// This is the representation stored on roles and cached per user.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackedPermissions(String);

impl PackedPermissions {
    /// Packs permissions, dropping duplicates while keeping first-seen order.
    pub fn pack(permissions: impl IntoIterator<Item = Permission>) -> Self {
        let mut packed = String::new();
        for permission in permissions {
            if let Some(ch) = permission.as_char()
                && !packed.contains(ch)
            {
                packed.push(ch);
            }
        }
        Self(packed)
    }

    /// Creates packed permissions from a stored string without validation.
    pub fn from_string(value: String) -> Self {
        Self(value)
    }

    /// Returns the distinct union of several packed sets.
    pub fn union<'a>(sets: impl IntoIterator<Item = &'a PackedPermissions>) -> Self {
        let mut packed = String::new();
        for set in sets {
            for ch in set.0.chars() {
                if !packed.contains(ch) {
                    packed.push(ch);
                }
            }
        }
        Self(packed)
    }

    /// Unpacks into permission codes.
    pub fn unpack(&self) -> Vec<Permission> {
        self.0
            .chars()
            .filter_map(|ch| u16::try_from(u32::from(ch)).ok())
            .filter_map(|code| Permission::new(code).ok())
            .collect()
    }

    /// Returns true when the set grants `permission`, directly or via [`ACCESS_ALL`].
    pub fn grants(&self, permission: Permission) -> bool {
        let contains = |p: Permission| p.as_char().is_some_and(|ch| self.0.contains(ch));
        contains(permission) || contains(ACCESS_ALL)
    }

    /// Returns true when no permission is packed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the packed string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackedPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
