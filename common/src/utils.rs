use std::path::{Component, Path, PathBuf};

pub fn secs_to_human(duration: i64) -> String {
    let secs = duration % 60;
    let mins = duration / 60;
    let hours = mins / 60;
    let mins = mins % 60;

    let mut out = Vec::new();
    if hours > 0 {
        out.push(format!("{:2}h", hours));
    }
    if mins > 0 || hours > 0 {
        out.push(format!("{:2}m", mins));
    }
    out.push(format!("{:2}s", secs));

    out.join(" ")
}

/// Extracts the architecture component of a chroot name like `fedora-30-x86_64`.
///
/// Only the third dash-separated field is considered, so `epel-7-ppc64le` yields `ppc64le`.
pub fn chroot_arch(chroot: &str) -> Option<&str> {
    chroot.split('-').nth(2).filter(|arch| !arch.is_empty())
}

/// Lexically normalizes a path, collapsing `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => (),
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Joins an untrusted relative path onto `root`, refusing anything that would escape it.
pub fn join_within(root: &Path, relative: &str) -> Option<PathBuf> {
    let joined = normalize_path(&root.join(relative.trim_start_matches('/')));
    if joined.starts_with(normalize_path(root)) && joined != normalize_path(root) {
        Some(joined)
    } else {
        None
    }
}

/// Turns an arbitrary identifier into something that is safe to use as a file name.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}
