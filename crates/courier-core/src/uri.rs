// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Scheme of in-process queues owned by the runtime.
pub const LOCAL_SCHEME: &str = "local";

/// Endpoint address in `scheme://path` form.
///
/// The scheme is lower-cased and trailing slashes are trimmed so that two
/// spellings of the same endpoint compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uri(String);

impl Uri {
    /// Parse and normalize an endpoint address.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let raw = raw.trim();
        let (scheme, path) = raw.split_once("://").ok_or_else(|| invalid(raw, "missing '://'"))?;

        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(invalid(raw, "invalid scheme"));
        }

        let path = path.trim_end_matches('/');
        if path.is_empty() {
            return Err(invalid(raw, "missing path"));
        }

        Ok(Self(format!("{}://{}", scheme.to_ascii_lowercase(), path)))
    }

    /// Address of the named in-process queue.
    pub fn local(queue: &str) -> Self {
        Self(format!("{}://{}", LOCAL_SCHEME, queue.trim_matches('/').to_ascii_lowercase()))
    }

    /// The scheme, e.g. `local` or `tcp`.
    pub fn scheme(&self) -> &str {
        self.0.split_once("://").map(|(s, _)| s).unwrap_or_default()
    }

    /// Everything after `://`.
    pub fn path(&self) -> &str {
        self.0.split_once("://").map(|(_, p)| p).unwrap_or_default()
    }

    /// Whether this address names an in-process queue.
    pub fn is_local(&self) -> bool {
        self.scheme() == LOCAL_SCHEME
    }

    /// The normalized address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn invalid(raw: &str, message: &str) -> CoreError {
    CoreError::ValidationError {
        field: "uri".to_string(),
        message: format!("'{}': {}", raw, message),
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Uri {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Uri {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for Uri {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Uri> for String {
    fn from(uri: Uri) -> Self {
        uri.0
    }
}
