//! Restricts a just-created buffer directory to owner-only access. Best
//! effort: failures are swallowed since the caller has already succeeded
//! at the operation that matters (creating the directory).

use std::path::Path;

#[cfg(unix)]
pub fn harden_dir(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
pub fn harden_dir(_path: &Path) {}
