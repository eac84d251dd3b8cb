//! Shell and executable lookup.

use std::path::{Path, PathBuf};

const FALLBACK_SHELL: &str = "/bin/sh";

/// Returns the shell program and the flag that makes it run a command line.
///
/// The shell is `$SHELL` when that names an existing absolute path, and
/// `/bin/sh` otherwise.
#[must_use]
pub fn get_shell_command() -> (PathBuf, &'static str) {
    let shell = std::env::var_os("SHELL")
        .map(PathBuf::from)
        .filter(|path| usable_shell(path))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_SHELL));
    (shell, "-c")
}

fn usable_shell(path: &Path) -> bool {
    path.is_absolute() && path.is_file()
}

/// Resolve an executable by name.
///
/// Absolute paths are used as-is when they point at a file; everything else
/// is looked up on `PATH` via `which`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    which_async(executable).await
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_must_be_an_absolute_file() {
        assert!(!usable_shell(Path::new("sh")));
        assert!(!usable_shell(Path::new("/nonexistent/shell")));
        assert!(usable_shell(Path::new("/bin/sh")));
    }

    #[test]
    fn test_shell_command_uses_dash_c() {
        let (shell, flag) = get_shell_command();
        assert!(shell.is_absolute());
        assert_eq!(flag, "-c");
    }

    #[tokio::test]
    async fn test_resolves_sh_on_path() {
        let resolved = resolve_executable_path("sh").await.unwrap();
        assert!(resolved.is_absolute());
    }

    #[tokio::test]
    async fn test_blank_name() {
        assert!(resolve_executable_path("  ").await.is_none());
    }
}
