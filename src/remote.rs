//! Destination parsing for `user@host:path` targets.

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDest {
    pub user: Option<String>,
    pub host: String,
    pub path: String,
}

impl RemoteDest {
    /// `user@host` for handing to the transport command.
    pub fn login(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

pub fn parse_dest(s: &str) -> Result<RemoteDest> {
    let s = s.trim();
    let (login, path) = s
        .split_once(':')
        .ok_or_else(|| SyncError::Usage(format!("destination {s:?} is not user@host:path")))?;
    if login.is_empty() || path.is_empty() {
        return Err(SyncError::Usage(format!(
            "destination {s:?} is not user@host:path"
        )));
    }
    let (user, host) = match login.split_once('@') {
        Some((u, h)) => (Some(u.to_string()), h.to_string()),
        None => (None, login.to_string()),
    };
    if host.is_empty() || user.as_deref() == Some("") {
        return Err(SyncError::Usage(format!(
            "destination {s:?} has an empty user or host"
        )));
    }
    Ok(RemoteDest {
        user,
        host,
        path: path.to_string(),
    })
}
