use super::types::WorktreeEntry;
use anyhow::{anyhow, Result};
use git2::{Repository, WorktreePruneOptions};
use std::path::{Path, PathBuf};

pub const SESSION_BRANCH_PREFIX: &str = "session/";

/// `session/<name>` with whitespace folded into hyphens.
pub fn session_branch_name(session_name: &str) -> String {
    let slug = session_name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    format!("{SESSION_BRANCH_PREFIX}{slug}")
}

/// `<root>/<repo-dir>-<session>`; the repository directory name keeps
/// worktrees of different projects apart under a shared root.
pub fn worktree_path_for(worktree_root: &Path, repo_path: &Path, session_name: &str) -> PathBuf {
    let repo_name = repo_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo");
    worktree_root.join(format!("{repo_name}-{session_name}"))
}

/// Parses `git worktree list --porcelain`.
pub fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                detached: false,
            });
            continue;
        }

        let Some(entry) = current.as_mut() else {
            continue;
        };

        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(
                branch
                    .strip_prefix("refs/heads/")
                    .unwrap_or(branch)
                    .to_string(),
            );
        } else if line == "detached" {
            entry.detached = true;
        }
    }

    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}

/// Removes a worktree directory and prunes its registration with libgit2.
/// Used when `git worktree remove` refuses (locked, missing metadata, ...).
pub fn force_remove_worktree(repo_path: &Path, worktree_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;

    let canonical_target_path = worktree_path
        .canonicalize()
        .unwrap_or_else(|_| worktree_path.to_path_buf());

    if worktree_path.exists() {
        std::fs::remove_dir_all(worktree_path)
            .map_err(|e| anyhow!("Failed to remove worktree directory: {e}"))?;
    }

    let worktrees = repo.worktrees()?;
    for wt_name in worktrees.iter().flatten() {
        let Ok(wt) = repo.find_worktree(wt_name) else {
            continue;
        };
        let wt_path = wt.path();
        let canonical_wt_path = wt_path
            .canonicalize()
            .unwrap_or_else(|_| wt_path.to_path_buf());
        if canonical_wt_path == canonical_target_path || wt_path == worktree_path {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).working_tree(true);
            if let Err(e) = wt.prune(Some(&mut opts)) {
                log::warn!("Failed to prune worktree from git registry: {e}");
            }
            return Ok(());
        }
    }

    Ok(())
}

#[cfg(test)]
pub fn is_worktree_registered(repo_path: &Path, worktree_path: &Path) -> Result<bool> {
    let repo = Repository::open(repo_path)?;
    let canonical_worktree_path = worktree_path
        .canonicalize()
        .unwrap_or_else(|_| worktree_path.to_path_buf());

    for wt_name in repo.worktrees()?.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(wt_name) {
            let wt_path = wt.path();
            let canonical_wt_path = wt_path
                .canonicalize()
                .unwrap_or_else(|_| wt_path.to_path_buf());
            if canonical_wt_path == canonical_worktree_path {
                return Ok(true);
            }
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_branch_folds_whitespace() {
        assert_eq!(session_branch_name("brave-otter"), "session/brave-otter");
        assert_eq!(session_branch_name("fix  login bug"), "session/fix-login-bug");
    }

    #[test]
    fn worktree_path_includes_repo_name() {
        let path = worktree_path_for(
            Path::new("/data/worktrees"),
            Path::new("/home/me/code/app"),
            "brave-otter",
        );
        assert_eq!(path, PathBuf::from("/data/worktrees/app-brave-otter"));
    }

    #[test]
    fn parses_porcelain_listing() {
        let output = "worktree /repo\nHEAD 1111111111111111111111111111111111111111\nbranch refs/heads/main\n\nworktree /wt/app-brave-otter\nHEAD 2222222222222222222222222222222222222222\nbranch refs/heads/session/brave-otter\n\nworktree /wt/detached\nHEAD 3333333333333333333333333333333333333333\ndetached\n";
        let entries = parse_worktree_porcelain(output);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].path, PathBuf::from("/wt/app-brave-otter"));
        assert_eq!(entries[1].branch.as_deref(), Some("session/brave-otter"));
        assert!(entries[2].detached);
        assert!(entries[2].branch.is_none());
    }

    #[test]
    fn parses_empty_listing() {
        assert!(parse_worktree_porcelain("").is_empty());
    }
}
