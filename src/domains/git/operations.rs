use anyhow::{anyhow, Result};
use git2::{BranchType, Repository, RepositoryState, StatusOptions};
use std::collections::BTreeSet;
use std::path::Path;

#[inline]
fn is_internal_tooling_path(path: &str) -> bool {
    path == ".worktrees" || path.starts_with(".worktrees/")
}

/// True when `path` is the working-tree root of a non-bare repository.
pub fn is_repository_root(path: &Path) -> bool {
    let Ok(repo) = Repository::open(path) else {
        return false;
    };
    let Some(workdir) = repo.workdir() else {
        return false;
    };
    let canonical_workdir = workdir.canonicalize().unwrap_or_else(|_| workdir.to_path_buf());
    let canonical_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    canonical_workdir == canonical_path
}

pub fn has_uncommitted_changes(worktree_path: &Path) -> Result<bool> {
    Ok(!uncommitted_sample_paths(worktree_path, 1)?.is_empty())
}

pub fn uncommitted_sample_paths(worktree_path: &Path, limit: usize) -> Result<Vec<String>> {
    let repo = Repository::open(worktree_path)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;

    let mut out = Vec::new();
    for entry in statuses.iter() {
        let path = entry.path().unwrap_or("<unknown>");
        if is_internal_tooling_path(path) {
            continue;
        }
        out.push(path.to_string());
        if out.len() >= limit {
            break;
        }
    }
    log::debug!(
        "uncommitted_sample_paths: path={} total_status_entries={} sample={:?}",
        worktree_path.display(),
        statuses.len(),
        out
    );
    Ok(out)
}

/// Parses `git status --porcelain` output and returns every unmerged path.
pub fn parse_conflicted_paths(porcelain: &str) -> Vec<String> {
    let mut paths = BTreeSet::new();
    for line in porcelain.lines() {
        if line.len() < 4 {
            continue;
        }
        let (code, rest) = line.split_at(2);
        let unmerged = matches!(code, "DD" | "AA") || code.contains('U');
        if !unmerged {
            continue;
        }
        let path = rest.trim_start();
        let path = path.trim_matches('"');
        if !path.is_empty() {
            paths.insert(path.to_string());
        }
    }
    paths.into_iter().collect()
}

pub fn rebase_in_progress(worktree_path: &Path) -> Result<bool> {
    let repo = Repository::open(worktree_path)?;
    Ok(matches!(
        repo.state(),
        RepositoryState::Rebase | RepositoryState::RebaseInteractive | RepositoryState::RebaseMerge
    ))
}

pub fn current_branch(repo_path: &Path) -> Result<Option<String>> {
    let repo = Repository::open(repo_path)?;
    let head = match repo.head() {
        Ok(head) => head,
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => return Ok(None),
        Err(e) => return Err(anyhow!("Failed to read HEAD: {e}")),
    };
    if !head.is_branch() {
        return Ok(None);
    }
    Ok(head.shorthand().map(|s| s.to_string()))
}

/// Commits on the worktree's HEAD that the remote tracking branch does not
/// have. Without a remote branch every commit on HEAD counts as unpushed.
pub fn count_unpushed_commits(worktree_path: &Path, branch_name: &str) -> Result<usize> {
    let repo = Repository::open(worktree_path)?;
    let head_oid = match repo.head().ok().and_then(|h| h.target()) {
        Some(oid) => oid,
        None => return Ok(0),
    };

    let mut revwalk = repo.revwalk()?;
    revwalk.push(head_oid)?;

    let remote_name = format!("origin/{branch_name}");
    if let Ok(remote) = repo.find_branch(&remote_name, BranchType::Remote) {
        if let Some(remote_oid) = remote.get().target() {
            revwalk.hide(remote_oid)?;
        }
    }

    let mut count = 0;
    for oid in revwalk {
        oid?;
        count += 1;
    }
    Ok(count)
}

pub fn is_valid_branch_name(branch: &str) -> bool {
    if branch.is_empty() || branch.len() > 255 {
        return false;
    }

    if branch.starts_with('/') || branch.ends_with('/') || branch.contains("//") {
        return false;
    }

    if branch.contains("..") || branch.ends_with(".lock") || branch.contains(' ') {
        return false;
    }

    for part in branch.split('/') {
        if part.is_empty() || part.starts_with('.') || part.ends_with('.') {
            return false;
        }
    }

    branch
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'))
}

/// Accepts full or abbreviated hexadecimal object ids.
pub fn is_valid_commit_hash(hash: &str) -> bool {
    (4..=40).contains(&hash.len()) && hash.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::{Command, ExitStatus};
    use tempfile::TempDir;

    fn run_git(path: &Path, args: &[&str]) {
        let output = Command::new("git")
            .current_dir(path)
            .args(args)
            .output()
            .expect("failed to execute git command");
        assert!(
            output.status.success(),
            "git {:?} failed with status {:?}\nstdout: {}\nstderr: {}",
            args,
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn run_git_allow_failure(path: &Path, args: &[&str]) -> ExitStatus {
        Command::new("git")
            .current_dir(path)
            .args(args)
            .output()
            .expect("failed to execute git command")
            .status
    }

    fn init_repo(path: &Path) {
        run_git(path, &["init"]);
        run_git(path, &["config", "user.email", "test@example.com"]);
        run_git(path, &["config", "user.name", "Test User"]);
        fs::write(path.join("README.md"), "initial\n").unwrap();
        run_git(path, &["add", "README.md"]);
        run_git(path, &["commit", "-m", "Initial commit"]);
        run_git(path, &["branch", "-M", "main"]);
    }

    #[test]
    fn test_is_valid_branch_name() {
        assert!(is_valid_branch_name("session/brave-otter"));
        assert!(is_valid_branch_name("main"));
        assert!(is_valid_branch_name("v1.0.0"));
        assert!(is_valid_branch_name("release/1.0"));

        assert!(!is_valid_branch_name(""));
        assert!(!is_valid_branch_name("/leading-slash"));
        assert!(!is_valid_branch_name("trailing-slash/"));
        assert!(!is_valid_branch_name("double//slash"));
        assert!(!is_valid_branch_name("has..dots"));
        assert!(!is_valid_branch_name("branch.lock"));
        assert!(!is_valid_branch_name("has spaces"));
        assert!(!is_valid_branch_name("feature/.hidden"));
        assert!(!is_valid_branch_name("has@special"));
    }

    #[test]
    fn test_commit_hash_validation() {
        assert!(is_valid_commit_hash("abc1234"));
        assert!(is_valid_commit_hash(&"f".repeat(40)));
        assert!(!is_valid_commit_hash("abc"));
        assert!(!is_valid_commit_hash("HEAD~1"));
        assert!(!is_valid_commit_hash(&"f".repeat(41)));
    }

    #[test]
    fn test_parse_conflicted_paths() {
        let porcelain = "UU src/lib.rs\nM  clean.rs\nAA both-added.txt\n?? new.txt\nDU deleted-by-us.txt\nUU src/lib.rs\n";
        assert_eq!(
            parse_conflicted_paths(porcelain),
            vec![
                "both-added.txt".to_string(),
                "deleted-by-us.txt".to_string(),
                "src/lib.rs".to_string()
            ]
        );
        assert!(parse_conflicted_paths("").is_empty());
    }

    #[test]
    fn test_is_repository_root() {
        let temp = TempDir::new().unwrap();
        assert!(!is_repository_root(temp.path()));

        init_repo(temp.path());
        assert!(is_repository_root(temp.path()));

        let nested = temp.path().join("nested");
        fs::create_dir_all(&nested).unwrap();
        assert!(!is_repository_root(&nested));
    }

    #[test]
    fn test_has_uncommitted_changes() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        assert!(!has_uncommitted_changes(temp.path()).unwrap());

        fs::write(temp.path().join("untracked.txt"), "x").unwrap();
        assert!(has_uncommitted_changes(temp.path()).unwrap());
        assert_eq!(
            uncommitted_sample_paths(temp.path(), 5).unwrap(),
            vec!["untracked.txt".to_string()]
        );
    }

    #[test]
    fn test_internal_worktree_dir_is_ignored() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        fs::create_dir_all(temp.path().join(".worktrees/demo")).unwrap();
        fs::write(temp.path().join(".worktrees/demo/file.txt"), "x").unwrap();
        assert!(!has_uncommitted_changes(temp.path()).unwrap());
    }

    #[test]
    fn test_unpushed_commits_without_remote_counts_all() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        fs::write(temp.path().join("a.txt"), "a").unwrap();
        run_git(temp.path(), &["add", "a.txt"]);
        run_git(temp.path(), &["commit", "-m", "second"]);

        assert_eq!(count_unpushed_commits(temp.path(), "main").unwrap(), 2);
    }

    #[test]
    fn test_unpushed_commits_against_remote_branch() {
        let temp = TempDir::new().unwrap();
        let origin = temp.path().join("origin");
        fs::create_dir_all(&origin).unwrap();
        init_repo(&origin);

        run_git(temp.path(), &["clone", origin.to_str().unwrap(), "clone"]);
        let clone = temp.path().join("clone");
        run_git(&clone, &["config", "user.email", "test@example.com"]);
        run_git(&clone, &["config", "user.name", "Test User"]);
        assert_eq!(count_unpushed_commits(&clone, "main").unwrap(), 0);

        fs::write(clone.join("local.txt"), "local").unwrap();
        run_git(&clone, &["add", "local.txt"]);
        run_git(&clone, &["commit", "-m", "local work"]);
        assert_eq!(count_unpushed_commits(&clone, "main").unwrap(), 1);
    }

    #[test]
    fn test_rebase_in_progress_detected() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        fs::write(temp.path().join("conflict.txt"), "base\n").unwrap();
        run_git(temp.path(), &["add", "conflict.txt"]);
        run_git(temp.path(), &["commit", "-m", "base"]);

        run_git(temp.path(), &["checkout", "-b", "feature"]);
        fs::write(temp.path().join("conflict.txt"), "feature\n").unwrap();
        run_git(temp.path(), &["commit", "-am", "feature edit"]);

        run_git(temp.path(), &["checkout", "main"]);
        fs::write(temp.path().join("conflict.txt"), "main\n").unwrap();
        run_git(temp.path(), &["commit", "-am", "main edit"]);

        run_git(temp.path(), &["checkout", "feature"]);
        assert!(!rebase_in_progress(temp.path()).unwrap());
        let status = run_git_allow_failure(temp.path(), &["rebase", "main"]);
        assert!(!status.success());
        assert!(rebase_in_progress(temp.path()).unwrap());
        assert_eq!(current_branch(temp.path()).unwrap(), None);
    }

    #[test]
    fn test_current_branch() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        assert_eq!(current_branch(temp.path()).unwrap().as_deref(), Some("main"));
    }
}
