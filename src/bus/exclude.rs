//! Keep the bus directory out of `git status`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::Result;

/// Append `<dir_name>/` to the repository's exclude file if it is not listed.
///
/// Returns `Ok(true)` when a line was appended, `Ok(false)` when the project
/// is not a git checkout or the entry already exists.
pub fn ensure_git_exclude(project_path: &Path, dir_name: &str) -> Result<bool> {
    let Some(exclude_path) = resolve_exclude_path(project_path) else {
        return Ok(false);
    };

    let entry = format!("{}/", dir_name.trim_end_matches('/'));
    let existing = match fs::read_to_string(&exclude_path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    if existing.contains(&entry) {
        return Ok(false);
    }

    if let Some(parent) = exclude_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&exclude_path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "{}", entry)?;
    log::debug!("Added {} to {}", entry, exclude_path.display());
    Ok(true)
}

/// `.git/info/exclude` for a plain checkout; ask git when `.git` is a file
/// (linked worktrees and submodules point elsewhere).
fn resolve_exclude_path(project_path: &Path) -> Option<PathBuf> {
    let dot_git = project_path.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git.join("info").join("exclude"));
    }
    if !dot_git.is_file() {
        return None;
    }

    let output = Command::new("git")
        .args(["rev-parse", "--git-path", "info/exclude"])
        .current_dir(project_path)
        .output()
        .ok()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        log::debug!("git rev-parse failed in {}: {}", project_path.display(), stderr.trim());
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let relative = stdout.trim();
    if relative.is_empty() {
        return None;
    }
    Some(project_path.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_not_a_checkout() {
        let temp = TempDir::new().unwrap();
        assert!(!ensure_git_exclude(temp.path(), ".agent-bus").unwrap());
    }

    #[test]
    fn test_appends_once() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(".git")).unwrap();

        assert!(ensure_git_exclude(temp.path(), ".agent-bus").unwrap());
        assert!(!ensure_git_exclude(temp.path(), ".agent-bus").unwrap());

        let content = fs::read_to_string(temp.path().join(".git/info/exclude")).unwrap();
        assert_eq!(content.matches(".agent-bus/").count(), 1);
    }

    #[test]
    fn test_preserves_existing_entries() {
        let temp = TempDir::new().unwrap();
        let info = temp.path().join(".git/info");
        fs::create_dir_all(&info).unwrap();
        fs::write(info.join("exclude"), "# local\n*.swp").unwrap();

        ensure_git_exclude(temp.path(), ".agent-bus").unwrap();

        let content = fs::read_to_string(info.join("exclude")).unwrap();
        assert!(content.starts_with("# local\n*.swp\n"));
        assert!(content.ends_with(".agent-bus/\n"));
    }
}
