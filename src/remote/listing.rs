use std::collections::VecDeque;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::{Endpoint, RemoteEntry, RemoteSession, join_remote};
use crate::error::FetchError;

// -rw-r--r--   1 user group  1234 Jan  1 12:00 file.txt
static UNIX_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^([dlcbps-])[rwxsStT-]{9}[+@.]?\s+   # type + permissions
        \d+\s+                               # link count
        \S+\s+                               # owner
        (?:\S+\s+)?                          # group (absent on some servers)
        (\d+)\s+                             # size
        \w{3}\s+\d{1,2}\s+[\d:]+\s+          # date
        (.+)$                                # name (possibly `link -> target`)
        ",
    )
    .expect("valid unix listing regex")
});

// 01-01-26  12:00AM       <DIR> name
static WINDOWS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^\d{2}-\d{2}-\d{2,4}\s+
        \d{1,2}:\d{2}(?:AM|PM)?\s+
        (<DIR>|\d+)\s+
        (.+)$
        ",
    )
    .expect("valid windows listing regex")
});

/// Parse one line of a `LIST` response issued against `directory`.
///
/// Returns `Ok(None)` for lines that carry no entry (`total`, `.`, `..`).
pub fn parse_list_line(directory: &str, line: &str) -> Result<Option<RemoteEntry>, FetchError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.starts_with("total ") {
        return Ok(None);
    }

    let (name, is_directory, size) = if let Some(caps) = UNIX_LINE.captures(line) {
        let kind = &caps[1];
        let size = caps[2].parse::<u64>().ok();
        let raw_name = caps[3].to_string();
        match kind {
            "d" => (raw_name, true, None),
            // symlinks are fetched as files; strip the `-> target` suffix
            "l" => {
                let name = raw_name.split(" -> ").next().unwrap_or(&raw_name).to_string();
                (name, false, None)
            }
            _ => (raw_name, false, size),
        }
    } else if let Some(caps) = WINDOWS_LINE.captures(line) {
        let name = caps[2].to_string();
        if &caps[1] == "<DIR>" {
            (name, true, None)
        } else {
            (name, false, caps[1].parse::<u64>().ok())
        }
    } else {
        return Err(FetchError::Protocol(format!("unrecognised LIST line: {:?}", line)));
    };

    if name == "." || name == ".." {
        return Ok(None);
    }
    let path = join_remote(directory, &name);
    Ok(Some(if is_directory { RemoteEntry::directory(path) } else { RemoteEntry::file(path, size) }))
}

/// Parse a full `LIST` response.
pub fn parse_listing<S: AsRef<str>>(
    directory: &str,
    lines: &[S],
) -> Result<Vec<RemoteEntry>, FetchError> {
    let mut entries = Vec::with_capacity(lines.len());
    for line in lines {
        if let Some(entry) = parse_list_line(directory, line.as_ref())? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Enumerates remote directories. Every call opens its own control
/// connection and closes it before returning.
#[derive(Clone)]
pub struct RemoteListing {
    endpoint: Arc<dyn Endpoint>,
}

impl RemoteListing {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        Self { endpoint }
    }

    /// Entries directly under `directory`, in server order.
    pub fn list(&self, directory: &str) -> Result<Vec<RemoteEntry>, FetchError> {
        self.walk(directory, false)
    }

    /// Like [`RemoteListing::list`], optionally descending breadth-first into
    /// every subdirectory over the same connection.
    pub fn walk(&self, directory: &str, recursive: bool) -> Result<Vec<RemoteEntry>, FetchError> {
        tracing::debug!(
            "[listing] open {} dir={} recursive={}",
            self.endpoint.describe(),
            directory,
            recursive
        );
        let mut session = self.endpoint.open()?;
        let res = walk_session(session.as_mut(), directory, recursive);
        if let Err(e) = session.close() {
            tracing::warn!("[listing] closing listing connection failed: {}", e);
        }
        let entries = res?;
        tracing::info!(
            "[listing] {} entries under {} ({} directories)",
            entries.len(),
            directory,
            entries.iter().filter(|e| e.is_directory).count()
        );
        Ok(entries)
    }
}

fn walk_session(
    session: &mut dyn RemoteSession,
    root: &str,
    recursive: bool,
) -> Result<Vec<RemoteEntry>, FetchError> {
    let mut out = Vec::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(root.to_string());
    while let Some(dir) = queue.pop_front() {
        for entry in session.list(&dir)? {
            if recursive && entry.is_directory {
                queue.push_back(entry.path.clone());
            }
            out.push(entry);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_file_and_directory() {
        let file = parse_list_line("/pub", "-rw-r--r--   1 user group  1234 Jan  1 12:00 readme.txt")
            .unwrap()
            .unwrap();
        assert_eq!(file, RemoteEntry::file("/pub/readme.txt", Some(1234)));

        let dir = parse_list_line("/pub", "drwxr-xr-x   2 root root  4096 Mar  1 09:30 sub dir")
            .unwrap()
            .unwrap();
        assert_eq!(dir, RemoteEntry::directory("/pub/sub dir"));
    }

    #[test]
    fn unix_symlink_is_a_file() {
        let e = parse_list_line("/", "lrwxrwxrwx   1 root root    22 Jan  5 08:00 link -> /var/target")
            .unwrap()
            .unwrap();
        assert_eq!(e.path, "/link");
        assert!(!e.is_directory);
    }

    #[test]
    fn year_instead_of_time_and_missing_group() {
        let e = parse_list_line("/", "-rw-r--r-- 1 ftp 17 Dec 24  2023 old.log").unwrap().unwrap();
        assert_eq!(e, RemoteEntry::file("/old.log", Some(17)));
    }

    #[test]
    fn windows_lines() {
        let d = parse_list_line("/", "01-01-26  12:00AM      <DIR> My Documents").unwrap().unwrap();
        assert_eq!(d, RemoteEntry::directory("/My Documents"));
        let f = parse_list_line("/x", "01-01-26  09:15PM        42 notes.txt").unwrap().unwrap();
        assert_eq!(f, RemoteEntry::file("/x/notes.txt", Some(42)));
    }

    #[test]
    fn skips_totals_and_dot_entries() {
        let raw = [
            "total 12",
            "drwxr-xr-x   2 root root  4096 Mar  1 09:30 .",
            "drwxr-xr-x   2 root root  4096 Mar  1 09:30 ..",
            "-rw-r--r--   1 user group     5 Jan  1 12:00 a.txt",
            "",
        ];
        let entries = parse_listing("/", &raw[..]).unwrap();
        assert_eq!(entries, vec![RemoteEntry::file("/a.txt", Some(5))]);
    }

    #[test]
    fn malformed_line_is_a_protocol_error() {
        let err = parse_listing("/", &["this is not a listing"][..]).unwrap_err();
        assert!(matches!(err, FetchError::Protocol(_)), "{err:?}");
    }
}
