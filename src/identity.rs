//! Sandbox identity: time-slot tokens, deterministic names and in-sandbox paths.

use chrono::{Datelike, Local, NaiveDateTime, Timelike};

/// Time-slot token for the current local time, e.g. `20250616_FN`.
pub fn current_session_id() -> String {
    session_id_at(Local::now().naive_local())
}

/// Time-slot token for `now`: the date plus `FN` before noon, `AN` after.
pub fn session_id_at(now: NaiveDateTime) -> String {
    let period = if now.hour() < 12 { "FN" } else { "AN" };
    format!(
        "{:04}{:02}{:02}_{}",
        now.year(),
        now.month(),
        now.day(),
        period
    )
}

/// Deterministic names for one `(user, time slot)` identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxIdentity {
    pub user_id: String,
    pub session_id: String,
    pub name: String,
    pub volume_name: String,
}

impl SandboxIdentity {
    pub fn new(name_prefix: &str, volume_prefix: &str, user_id: &str, session_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            name: format!("{}_{}_{}", name_prefix, user_id, session_id),
            volume_name: format!("{}_{}_{}", volume_prefix, user_id, session_id),
        }
    }

    /// Recover `(user_id, session_id)` from a sandbox name built by [`SandboxIdentity::new`].
    ///
    /// The session id always has the shape `YYYYMMDD_XX`, so the user id is
    /// whatever sits between the prefix and the last two `_` separated segments.
    pub fn parse_name(name_prefix: &str, name: &str) -> Option<(String, String)> {
        let rest = name.trim_start_matches('/').strip_prefix(name_prefix)?.strip_prefix('_')?;
        let mut parts = rest.rsplitn(3, '_');
        let period = parts.next()?;
        let date = parts.next()?;
        let user = parts.next()?;
        if user.is_empty()
            || date.len() != 8
            || !date.bytes().all(|b| b.is_ascii_digit())
            || !matches!(period, "FN" | "AN")
        {
            return None;
        }
        Some((user.to_string(), format!("{}_{}", date, period)))
    }
}

/// Normalize `path` to an absolute in-sandbox path, resolving relative paths against `root`.
///
/// `.` components are dropped and `..` pops a component but never climbs above `/`.
pub fn normalize_path(root: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Every ancestor directory of an absolute path, outermost first, excluding `/`.
///
/// `parent_dirs("/home/labuser/src/a.c")` yields `/home`, `/home/labuser`, `/home/labuser/src`.
pub fn parent_dirs(path: &str) -> Vec<String> {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    let mut dirs = Vec::new();
    let mut current = String::new();
    for component in components.iter().take(components.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(component);
        dirs.push(current.clone());
    }
    dirs
}

/// Directory part of an absolute path, `/` for top-level entries.
pub fn dirname(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Last component of a path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Quote a string for `sh -c`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
