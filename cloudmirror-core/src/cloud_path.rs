use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("cloud path is empty")]
    Empty,
    #[error("cloud path must be absolute: {0}")]
    NotAbsolute(String),
    #[error("cloud path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("invalid item name: {0:?}")]
    InvalidName(String),
}

/// Absolute, '/'-delimited remote path in normalized form.
///
/// The root is `/`; every other path has no trailing slash and no empty,
/// `.` or `..` components. Ordering is component-wise, so an ancestor always
/// sorts before each of its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CloudPath(String);

impl CloudPath {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn new(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        if !raw.starts_with('/') {
            return Err(PathError::NotAbsolute(raw.to_string()));
        }

        let mut out = String::with_capacity(raw.len());
        for part in raw.split('/') {
            match part {
                "" => continue,
                "." | ".." => return Err(PathError::UnsupportedComponent(part.to_string())),
                name => {
                    out.push('/');
                    out.push_str(name);
                }
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        Ok(Self(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn parent(&self) -> Option<CloudPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    pub fn join(&self, name: &str) -> Result<CloudPath, PathError> {
        validate_name(name)?;
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    /// Last path component, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|part| !part.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Every strict ancestor, from the root down to the direct parent.
    pub fn ancestors(&self) -> Vec<CloudPath> {
        let mut out = Vec::with_capacity(self.depth());
        let mut current = self.parent();
        while let Some(path) = current {
            current = path.parent();
            out.push(path);
        }
        out.reverse();
        out
    }

    pub fn is_ancestor_of(&self, other: &CloudPath) -> bool {
        if self == other {
            return false;
        }
        if self.is_root() {
            return true;
        }
        other
            .0
            .strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Rewrites `self` from under `from` to under `to`; `None` if `self` is
    /// neither `from` nor inside it.
    pub fn rebase(&self, from: &CloudPath, to: &CloudPath) -> Option<CloudPath> {
        if self == from {
            return Some(to.clone());
        }
        if !from.is_ancestor_of(self) {
            return None;
        }
        let rest = if from.is_root() {
            &self.0[1..]
        } else {
            &self.0[from.0.len() + 1..]
        };
        if to.is_root() {
            Some(Self(format!("/{rest}")))
        } else {
            Some(Self(format!("{}/{rest}", to.0)))
        }
    }
}

pub fn validate_name(name: &str) -> Result<(), PathError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(PathError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl Ord for CloudPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components().cmp(other.components())
    }
}

impl PartialOrd for CloudPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CloudPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CloudPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<CloudPath> for String {
    fn from(value: CloudPath) -> Self {
        value.0
    }
}
