use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::branches::{branch_exists, default_branch, list_branches};
use super::diff::get_diff_details;
use super::history::{commit_exists, get_commit_file_changes, get_commits};
use super::operations::{
    count_unpushed_commits, has_uncommitted_changes, is_repository_root, is_valid_branch_name,
    is_valid_commit_hash,
};
use super::runner::{git_args, GitCommandError, GitFailureKind, GitOutput, GitRunner};
use super::types::{
    BranchInfo, CommitFileChange, CommitInfo, DiffDetails, PullResult, SessionWarnings,
    WorktreeEntry, WorktreeTarget,
};
use super::worktrees::{force_remove_worktree, parse_worktree_porcelain};
use crate::domains::merge::{GitOperationResult, KeyedLocks, MergeService, SquashRequest};
use crate::errors::{CoreError, CoreResult};
use crate::shared::blocking::run_blocking;

/// Upper bounds for git work: local commands versus network operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GitTimeouts {
    pub command: Duration,
    pub network: Duration,
}

impl Default for GitTimeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(30),
            network: Duration::from_secs(5 * 60),
        }
    }
}

/// Git plumbing for sessions. Everything that mutates a worktree or the
/// primary checkout goes through the injected runner; reads use libgit2 on
/// the blocking pool.
pub struct GitWorktreeService {
    runner: Arc<dyn GitRunner>,
    timeouts: GitTimeouts,
    merge: MergeService,
    project_locks: KeyedLocks,
}

impl GitWorktreeService {
    pub fn new(runner: Arc<dyn GitRunner>, timeouts: GitTimeouts) -> Self {
        Self {
            merge: MergeService::new(runner.clone(), timeouts.command),
            runner,
            timeouts,
            project_locks: KeyedLocks::new(),
        }
    }

    pub fn timeouts(&self) -> GitTimeouts {
        self.timeouts
    }

    pub async fn is_repository(&self, path: &Path) -> CoreResult<bool> {
        let path = path.to_path_buf();
        run_blocking("repository check", self.timeouts.command, move || {
            Ok(is_repository_root(&path))
        })
        .await
    }

    /// `git worktree add -b <branch> <path> <base>`. A failed attempt leaves
    /// neither the directory nor the branch behind.
    pub async fn create_worktree(
        &self,
        project: &Path,
        branch: &str,
        path: &Path,
        base: &str,
    ) -> CoreResult<PathBuf> {
        if !is_valid_branch_name(branch) {
            return Err(CoreError::validation("branch", format!("'{branch}' is not a valid branch name")));
        }
        if !is_valid_branch_name(base) {
            return Err(CoreError::validation("base_branch", format!("'{base}' is not a valid branch name")));
        }
        if path.exists() {
            return Err(generic_git_failure(format!(
                "Worktree path {} is already in use",
                path.display()
            )));
        }

        let (base_present, branch_taken) = {
            let project = project.to_path_buf();
            let base = base.to_string();
            let branch = branch.to_string();
            run_blocking("worktree preflight", self.timeouts.command, move || {
                Ok((commit_exists(&project, &base)?, branch_exists(&project, &branch)?))
            })
            .await?
        };
        if !base_present {
            return Err(generic_git_failure(format!("Base branch '{base}' does not exist")));
        }
        if branch_taken {
            return Err(generic_git_failure(format!("Branch '{branch}' already exists")));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CoreError::from(anyhow::anyhow!(
                    "Failed to create worktree parent {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let path_arg = path.to_string_lossy().to_string();
        info!(
            "Creating worktree {} on branch '{branch}' from '{base}'",
            path.display()
        );
        let result = self
            .git_ok(project, &["worktree", "add", "-b", branch, &path_arg, base])
            .await;

        if let Err(err) = result {
            warn!("Worktree creation failed for '{branch}', cleaning up: {err}");
            self.cleanup_partial_worktree(project, path, branch).await;
            return Err(err);
        }

        Ok(path.to_path_buf())
    }

    /// Re-attaches a worktree to a branch that survived a previous teardown.
    pub async fn create_worktree_for_existing_branch(
        &self,
        project: &Path,
        branch: &str,
        path: &Path,
    ) -> CoreResult<PathBuf> {
        if path.exists() {
            return Err(generic_git_failure(format!(
                "Worktree path {} is already in use",
                path.display()
            )));
        }
        self.prune_worktrees(project).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::from(anyhow::Error::new(e)))?;
        }
        let path_arg = path.to_string_lossy().to_string();
        self.git_ok(project, &["worktree", "add", &path_arg, branch])
            .await?;
        Ok(path.to_path_buf())
    }

    /// Removes the worktree directory and its registration; deletes `branch`
    /// too when given.
    pub async fn remove_worktree(
        &self,
        project: &Path,
        path: &Path,
        branch: Option<&str>,
    ) -> CoreResult<()> {
        let path_arg = path.to_string_lossy().to_string();
        let removed = self
            .git(project, &["worktree", "remove", "--force", &path_arg])
            .await;
        match removed {
            Ok(output) if output.success() => {}
            outcome => {
                debug!(
                    "git worktree remove did not succeed for {} ({outcome:?}); removing manually",
                    path.display()
                );
                let project_path = project.to_path_buf();
                let worktree_path = path.to_path_buf();
                run_blocking("remove worktree", self.timeouts.command, move || {
                    force_remove_worktree(&project_path, &worktree_path)
                })
                .await?;
            }
        }
        self.prune_worktrees(project).await?;

        if let Some(branch) = branch {
            self.delete_branch(project, branch).await?;
        }
        info!("Removed worktree {}", path.display());
        Ok(())
    }

    pub async fn branch_exists(&self, project: &Path, branch: &str) -> CoreResult<bool> {
        let project = project.to_path_buf();
        let branch = branch.to_string();
        run_blocking("branch lookup", self.timeouts.command, move || {
            branch_exists(&project, &branch)
        })
        .await
    }

    pub async fn delete_branch(&self, project: &Path, branch: &str) -> CoreResult<()> {
        if self.branch_exists(project, branch).await? {
            self.git_ok(project, &["branch", "-D", branch]).await?;
        }
        Ok(())
    }

    pub async fn list_worktrees(&self, project: &Path) -> CoreResult<Vec<WorktreeEntry>> {
        let output = self
            .git_ok(project, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_porcelain(&output.stdout))
    }

    pub async fn prune_worktrees(&self, project: &Path) -> CoreResult<()> {
        self.git_ok(project, &["worktree", "prune"]).await?;
        Ok(())
    }

    pub async fn get_branches(&self, project: &Path) -> CoreResult<Vec<BranchInfo>> {
        let project = project.to_path_buf();
        run_blocking("list branches", self.timeouts.command, move || {
            list_branches(&project)
        })
        .await
    }

    pub async fn default_branch(&self, project: &Path) -> CoreResult<String> {
        let project = project.to_path_buf();
        run_blocking("default branch", self.timeouts.command, move || {
            default_branch(&project)
        })
        .await
    }

    pub async fn rebase_from_main(&self, target: &WorktreeTarget) -> CoreResult<GitOperationResult> {
        self.merge
            .rebase_onto(&target.worktree_path, &target.base_branch)
            .await
    }

    pub async fn abort_rebase(&self, target: &WorktreeTarget) -> CoreResult<GitOperationResult> {
        self.merge.abort_rebase(&target.worktree_path).await
    }

    pub async fn continue_rebase(&self, target: &WorktreeTarget) -> CoreResult<GitOperationResult> {
        self.merge.continue_rebase(&target.worktree_path).await
    }

    pub async fn rebase_in_progress(&self, target: &WorktreeTarget) -> CoreResult<bool> {
        self.merge.rebase_pending(&target.worktree_path).await
    }

    /// Squashes the session branch into its base in the primary checkout,
    /// serialized with every other mutation of the same project.
    pub async fn squash_merge(
        &self,
        target: &WorktreeTarget,
        commit_message: &str,
    ) -> CoreResult<GitOperationResult> {
        let _guard = self.project_locks.acquire(&project_key(&target.repo_path)).await;
        self.merge
            .squash_merge(SquashRequest {
                repo_path: target.repo_path.clone(),
                worktree_path: target.worktree_path.clone(),
                session_branch: target.branch_name.clone(),
                base_branch: target.base_branch.clone(),
                commit_message: commit_message.to_string(),
            })
            .await
    }

    pub async fn get_diff_details(&self, target: &WorktreeTarget) -> CoreResult<DiffDetails> {
        let repo = target.repo_path.clone();
        let branch = target.branch_name.clone();
        let base = target.base_branch.clone();
        run_blocking("diff", self.timeouts.command, move || {
            get_diff_details(&repo, &branch, &base)
        })
        .await
    }

    pub async fn get_commits(
        &self,
        target: &WorktreeTarget,
        limit: usize,
    ) -> CoreResult<Vec<CommitInfo>> {
        let repo = target.repo_path.clone();
        let branch = target.branch_name.clone();
        let base = target.base_branch.clone();
        run_blocking("commit log", self.timeouts.command, move || {
            get_commits(&repo, &branch, &base, limit)
        })
        .await
    }

    pub async fn get_commit_changes(
        &self,
        target: &WorktreeTarget,
        commit_hash: &str,
    ) -> CoreResult<Vec<CommitFileChange>> {
        self.ensure_commit(target, commit_hash).await?;
        let repo = target.repo_path.clone();
        let hash = commit_hash.to_string();
        run_blocking("commit changes", self.timeouts.command, move || {
            get_commit_file_changes(&repo, &hash)
        })
        .await
    }

    /// `git reset --hard <commit>` in the session worktree. Irreversible.
    pub async fn reset_to_commit(&self, target: &WorktreeTarget, commit_hash: &str) -> CoreResult<()> {
        self.ensure_commit(target, commit_hash).await?;
        warn!(
            "Hard-resetting {} to {commit_hash}",
            target.worktree_path.display()
        );
        self.git_ok(&target.worktree_path, &["reset", "--hard", commit_hash])
            .await?;
        Ok(())
    }

    /// Fast-forward-only pull in the primary checkout. Divergence and other
    /// git failures are reported in the result; only timeouts are errors.
    pub async fn pull(&self, project: &Path) -> CoreResult<PullResult> {
        let _guard = self.project_locks.acquire(&project_key(project)).await;

        let remotes = self.git_ok(project, &["remote"]).await?;
        if remotes.stdout.trim().is_empty() {
            return Ok(PullResult {
                success: false,
                updated: false,
                message: "Project has no remote to pull from".to_string(),
                error: Some("no remote configured".to_string()),
            });
        }

        info!("Pulling {} (fast-forward only)", project.display());
        let output = self
            .runner
            .run(project, &git_args(["pull", "--ff-only"]), self.timeouts.network)
            .await?;

        if !output.success() {
            let error = output.combined_message();
            warn!("Pull failed for {}: {error}", project.display());
            return Ok(PullResult {
                success: false,
                updated: false,
                message: "Pull failed; local history was left untouched".to_string(),
                error: Some(error),
            });
        }

        let updated = !output.stdout.contains("Already up to date");
        Ok(PullResult {
            success: true,
            updated,
            message: if updated {
                "Pulled latest changes".to_string()
            } else {
                "Already up to date".to_string()
            },
            error: None,
        })
    }

    /// Clones `url` into `destination`. A failed or timed-out clone leaves no
    /// partial checkout behind.
    pub async fn clone_repository(&self, url: &str, destination: &Path) -> CoreResult<PathBuf> {
        if url.trim().is_empty() {
            return Err(CoreError::validation("url", "Repository URL is required"));
        }
        if destination.exists() {
            let occupied = std::fs::read_dir(destination)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(true);
            if occupied {
                return Err(CoreError::validation(
                    "destination",
                    format!("{} already exists and is not empty", destination.display()),
                ));
            }
        }
        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| CoreError::from(anyhow::Error::new(e)))?;

        info!("Cloning {url} into {}", destination.display());
        let dest_arg = destination.to_string_lossy().to_string();
        let outcome = self
            .runner
            .run(&parent, &git_args(["clone", url, dest_arg.as_str()]), self.timeouts.network)
            .await
            .and_then(GitOutput::into_result);

        match outcome {
            Ok(_) => Ok(destination.to_path_buf()),
            Err(err) => {
                if destination.exists() {
                    if let Err(e) = tokio::fs::remove_dir_all(destination).await {
                        warn!(
                            "Failed to remove partial clone at {}: {e}",
                            destination.display()
                        );
                    }
                }
                Err(err.into())
            }
        }
    }

    pub async fn check_warnings(&self, target: &WorktreeTarget) -> CoreResult<SessionWarnings> {
        if !target.worktree_path.exists() {
            return Err(CoreError::validation(
                "worktree",
                format!("Worktree {} does not exist", target.worktree_path.display()),
            ));
        }
        let worktree = target.worktree_path.clone();
        let branch = target.branch_name.clone();
        run_blocking("session warnings", self.timeouts.command, move || {
            Ok(SessionWarnings {
                has_uncommitted_changes: has_uncommitted_changes(&worktree)?,
                unpushed_commit_count: count_unpushed_commits(&worktree, &branch)?,
            })
        })
        .await
    }

    async fn ensure_commit(&self, target: &WorktreeTarget, commit_hash: &str) -> CoreResult<()> {
        if !is_valid_commit_hash(commit_hash) {
            return Err(CoreError::validation(
                "commit_hash",
                format!("'{commit_hash}' is not a commit hash"),
            ));
        }
        let repo = target.repo_path.clone();
        let hash = commit_hash.to_string();
        let exists = run_blocking("commit lookup", self.timeouts.command, move || {
            commit_exists(&repo, &hash)
        })
        .await?;
        if !exists {
            return Err(CoreError::not_found("commit", commit_hash));
        }
        Ok(())
    }

    async fn cleanup_partial_worktree(&self, project: &Path, path: &Path, branch: &str) {
        let project_path = project.to_path_buf();
        let worktree_path = path.to_path_buf();
        if let Err(e) = run_blocking("worktree cleanup", self.timeouts.command, move || {
            force_remove_worktree(&project_path, &worktree_path)
        })
        .await
        {
            warn!("Cleanup of {} failed: {e}", path.display());
        }
        if let Err(e) = self.delete_branch(project, branch).await {
            warn!("Cleanup of branch '{branch}' failed: {e}");
        }
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> CoreResult<GitOutput> {
        self.runner
            .run(cwd, &git_args(args), self.timeouts.command)
            .await
            .map_err(CoreError::from)
    }

    async fn git_ok(&self, cwd: &Path, args: &[&str]) -> CoreResult<GitOutput> {
        let output = self.git(cwd, args).await?;
        output.into_result().map_err(CoreError::from)
    }
}

fn project_key(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

fn generic_git_failure(message: String) -> CoreError {
    CoreError::from(GitCommandError::Failed {
        kind: GitFailureKind::Generic,
        message,
        exit_code: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::runner::{CliGitRunner, MockGitRunner};
    use crate::domains::git::worktrees::is_worktree_registered;
    use std::fs;
    use std::process::Command;
    use tempfile::TempDir;

    fn run_git(path: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .current_dir(path)
            .args(args)
            .output()
            .expect("failed to execute git command");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn init_repo(path: &Path) {
        fs::create_dir_all(path).unwrap();
        run_git(path, &["init"]);
        run_git(path, &["config", "user.email", "test@example.com"]);
        run_git(path, &["config", "user.name", "Test User"]);
        fs::write(path.join("README.md"), "initial\n").unwrap();
        run_git(path, &["add", "README.md"]);
        run_git(path, &["commit", "-m", "Initial commit"]);
        run_git(path, &["branch", "-M", "main"]);
    }

    fn commit_file(path: &Path, name: &str, contents: &str, message: &str) {
        fs::write(path.join(name), contents).unwrap();
        run_git(path, &["add", name]);
        run_git(path, &["commit", "-m", message]);
    }

    fn service() -> GitWorktreeService {
        GitWorktreeService::new(Arc::new(CliGitRunner::new()), GitTimeouts::default())
    }

    fn target(repo: &Path, worktree: &Path) -> WorktreeTarget {
        WorktreeTarget {
            repo_path: repo.to_path_buf(),
            worktree_path: worktree.to_path_buf(),
            branch_name: "session/demo".into(),
            base_branch: "main".into(),
        }
    }

    #[tokio::test]
    async fn creates_and_removes_worktree_with_branch() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let wt = temp.path().join("worktrees").join("repo-demo");

        let svc = service();
        let created = svc
            .create_worktree(&repo, "session/demo", &wt, "main")
            .await
            .unwrap();
        assert_eq!(created, wt);
        assert!(wt.join("README.md").exists());
        assert!(is_worktree_registered(&repo, &wt).unwrap());
        assert!(branch_exists(&repo, "session/demo").unwrap());

        let listed = svc.list_worktrees(&repo).await.unwrap();
        assert!(listed
            .iter()
            .any(|w| w.branch.as_deref() == Some("session/demo")));

        svc.remove_worktree(&repo, &wt, Some("session/demo"))
            .await
            .unwrap();
        assert!(!wt.exists());
        assert!(!is_worktree_registered(&repo, &wt).unwrap());
        assert!(!branch_exists(&repo, "session/demo").unwrap());
    }

    #[tokio::test]
    async fn create_rejects_missing_base_and_used_path() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let svc = service();

        let err = svc
            .create_worktree(&repo, "session/a", &temp.path().join("a"), "does-not-exist")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Git { .. }));
        assert!(!branch_exists(&repo, "session/a").unwrap());

        let occupied = temp.path().join("occupied");
        fs::create_dir_all(&occupied).unwrap();
        let err = svc
            .create_worktree(&repo, "session/b", &occupied, "main")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Git { .. }));

        let err = svc
            .create_worktree(&repo, "bad name", &temp.path().join("c"), "main")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn removing_a_vanished_worktree_still_unregisters_it() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let wt = temp.path().join("gone");
        let svc = service();
        svc.create_worktree(&repo, "session/demo", &wt, "main")
            .await
            .unwrap();
        fs::remove_dir_all(&wt).unwrap();

        svc.remove_worktree(&repo, &wt, Some("session/demo"))
            .await
            .unwrap();
        assert!(!is_worktree_registered(&repo, &wt).unwrap());
    }

    #[tokio::test]
    async fn recreates_worktree_for_existing_branch() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let wt = temp.path().join("wt");
        let svc = service();
        svc.create_worktree(&repo, "session/demo", &wt, "main")
            .await
            .unwrap();
        commit_file(&wt, "work.txt", "w\n", "work");
        svc.remove_worktree(&repo, &wt, None).await.unwrap();

        svc.create_worktree_for_existing_branch(&repo, "session/demo", &wt)
            .await
            .unwrap();
        assert!(wt.join("work.txt").exists());
    }

    #[tokio::test]
    async fn diff_commits_and_reset_follow_session_branch() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let wt = temp.path().join("wt");
        let svc = service();
        svc.create_worktree(&repo, "session/demo", &wt, "main")
            .await
            .unwrap();
        let base_head = run_git(&wt, &["rev-parse", "HEAD"]);
        commit_file(&wt, "added.txt", "one\ntwo\n", "add file");
        fs::write(wt.join("README.md"), "changed\n").unwrap();
        run_git(&wt, &["commit", "-am", "modify readme"]);

        let t = target(&repo, &wt);
        let diff = svc.get_diff_details(&t).await.unwrap();
        assert_eq!(diff.files.len(), 2);
        let sum: usize = diff.files.iter().map(|f| f.additions).sum();
        assert_eq!(diff.total_additions, sum);

        let commits = svc.get_commits(&t, 10).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "modify readme");
        let only_one = svc.get_commits(&t, 1).await.unwrap();
        assert_eq!(only_one.len(), 1);

        let changes = svc.get_commit_changes(&t, &commits[1].hash).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "added.txt");

        svc.reset_to_commit(&t, &base_head).await.unwrap();
        assert!(!wt.join("added.txt").exists());
        assert!(svc.get_commits(&t, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_validates_hash_and_reports_missing_commit() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let t = target(&repo, &repo);
        let svc = service();

        let err = svc.reset_to_commit(&t, "not-a-hash").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));

        let err = svc
            .reset_to_commit(&t, "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn pull_reports_divergence_without_touching_history() {
        let temp = TempDir::new().unwrap();
        let origin = temp.path().join("origin");
        init_repo(&origin);
        let clone = temp.path().join("clone");
        let svc = service();
        svc.clone_repository(origin.to_str().unwrap(), &clone)
            .await
            .unwrap();
        run_git(&clone, &["config", "user.email", "test@example.com"]);
        run_git(&clone, &["config", "user.name", "Test User"]);

        commit_file(&origin, "upstream.txt", "u\n", "upstream");
        commit_file(&clone, "local.txt", "l\n", "local");
        let before = run_git(&clone, &["rev-parse", "HEAD"]);

        let result = svc.pull(&clone).await.unwrap();
        assert!(!result.success);
        assert!(!result.error.unwrap_or_default().is_empty());
        assert_eq!(run_git(&clone, &["rev-parse", "HEAD"]), before);
    }

    #[tokio::test]
    async fn pull_fast_forwards_and_reports_update() {
        let temp = TempDir::new().unwrap();
        let origin = temp.path().join("origin");
        init_repo(&origin);
        let clone = temp.path().join("clone");
        let svc = service();
        svc.clone_repository(origin.to_str().unwrap(), &clone)
            .await
            .unwrap();

        let unchanged = svc.pull(&clone).await.unwrap();
        assert!(unchanged.success);
        assert!(!unchanged.updated);

        commit_file(&origin, "upstream.txt", "u\n", "upstream");
        let updated = svc.pull(&clone).await.unwrap();
        assert!(updated.success);
        assert!(updated.updated);
        assert!(clone.join("upstream.txt").exists());
    }

    #[tokio::test]
    async fn pull_without_remote_fails_softly() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let result = service().pull(&repo).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn clone_timeout_removes_partial_destination() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dest");
        let dest_for_mock = dest.clone();
        let mut runner = MockGitRunner::new();
        runner.expect_run().returning(move |_, _, limit| {
            fs::create_dir_all(&dest_for_mock).unwrap();
            Err(GitCommandError::TimedOut {
                step: "git clone".into(),
                after: limit,
            })
        });
        let svc = GitWorktreeService::new(
            Arc::new(runner),
            GitTimeouts {
                command: Duration::from_secs(1),
                network: Duration::from_secs(60),
            },
        );

        let err = svc
            .clone_repository("https://example.invalid/repo.git", &dest)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::timeout("git clone", Duration::from_secs(60)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn warnings_report_dirty_state_and_unpushed_commits() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let wt = temp.path().join("wt");
        let svc = service();
        svc.create_worktree(&repo, "session/demo", &wt, "main")
            .await
            .unwrap();
        commit_file(&wt, "a.txt", "a\n", "a");
        fs::write(wt.join("scratch.txt"), "wip").unwrap();

        let warnings = svc.check_warnings(&target(&repo, &wt)).await.unwrap();
        assert!(warnings.has_uncommitted_changes);
        assert!(warnings.unpushed_commit_count >= 1);

        let missing = target(&repo, &temp.path().join("missing"));
        let err = svc.check_warnings(&missing).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn branches_include_default_marker() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        run_git(&repo, &["branch", "feature"]);
        let svc = service();
        let branches = svc.get_branches(&repo).await.unwrap();
        let main = branches.iter().find(|b| b.name == "main").unwrap();
        assert!(main.is_default);
        assert!(branches.iter().any(|b| b.name == "feature" && !b.is_default));
        assert_eq!(svc.default_branch(&repo).await.unwrap(), "main");
    }
}
