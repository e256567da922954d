use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use git2::{BranchType, MergeOptions, Oid, Repository};
use log::{debug, info, warn};

use crate::domains::git::operations::{
    current_branch, parse_conflicted_paths, rebase_in_progress, uncommitted_sample_paths,
};
use crate::domains::git::runner::{git_args, GitCommandError, GitFailureKind, GitOutput, GitRunner};
use crate::domains::merge::types::{GitOperationResult, MergeState};
use crate::errors::{CoreError, CoreResult};
use crate::shared::blocking::run_blocking;

const OPERATION_LABEL: &str = "merge";
const DIRTY_SAMPLE_LIMIT: usize = 5;

/// Inputs for squashing a session branch into its base in the primary checkout.
#[derive(Debug, Clone)]
pub struct SquashRequest {
    pub repo_path: PathBuf,
    pub worktree_path: PathBuf,
    pub session_branch: String,
    pub base_branch: String,
    pub commit_message: String,
}

/// Rebase and squash-merge mechanics. Mutations go through the injected
/// [`GitRunner`]; merge simulation and state checks use libgit2.
pub struct MergeService {
    runner: Arc<dyn GitRunner>,
    command_timeout: Duration,
}

impl MergeService {
    pub fn new(runner: Arc<dyn GitRunner>, command_timeout: Duration) -> Self {
        Self {
            runner,
            command_timeout,
        }
    }

    /// Rebases the worktree's branch onto `base`. Conflicts leave the rebase
    /// in progress and are reported as data.
    pub async fn rebase_onto(&self, worktree: &Path, base: &str) -> CoreResult<GitOperationResult> {
        if self.rebase_pending(worktree).await? {
            return Err(CoreError::validation(
                "rebase",
                "A rebase is already in progress; continue or abort it first",
            ));
        }

        info!(
            "{OPERATION_LABEL}: rebasing {} onto '{base}'",
            worktree.display()
        );
        let output = match self.git(worktree, &["rebase", base]).await {
            Ok(output) => output,
            Err(err @ CoreError::Timeout { .. }) => {
                self.abort_quietly(worktree).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if output.success() {
            let message = if output.stdout.contains("is up to date") {
                format!("Already up to date with '{base}'")
            } else {
                format!("Rebased onto '{base}'")
            };
            return Ok(GitOperationResult::succeeded(message));
        }

        let conflicts = self.conflicted_paths(worktree).await?;
        if !conflicts.is_empty() {
            warn!(
                "{OPERATION_LABEL}: rebase of {} onto '{base}' stopped on {} conflicting file(s)",
                worktree.display(),
                conflicts.len()
            );
            return Ok(GitOperationResult::conflicted(
                conflicts,
                format!("Rebase onto '{base}' stopped on conflicts; resolve them, then continue or abort"),
            ));
        }

        self.abort_quietly(worktree).await;
        Err(failure(output))
    }

    pub async fn abort_rebase(&self, worktree: &Path) -> CoreResult<GitOperationResult> {
        if !self.rebase_pending(worktree).await? {
            return Err(CoreError::validation("rebase", "No rebase in progress"));
        }
        self.git_ok(worktree, &["rebase", "--abort"]).await?;
        info!("{OPERATION_LABEL}: aborted rebase in {}", worktree.display());
        Ok(GitOperationResult::succeeded("Rebase aborted"))
    }

    /// Continues a pending rebase. Resolutions must already be staged.
    pub async fn continue_rebase(&self, worktree: &Path) -> CoreResult<GitOperationResult> {
        if !self.rebase_pending(worktree).await? {
            return Err(CoreError::validation("rebase", "No rebase in progress"));
        }

        let unresolved = self.conflicted_paths(worktree).await?;
        if !unresolved.is_empty() {
            return Ok(GitOperationResult::conflicted(
                unresolved,
                "Unresolved conflicts remain; stage the resolved files before continuing",
            ));
        }

        let output = self.git(worktree, &["rebase", "--continue"]).await?;
        if output.success() {
            if self.rebase_pending(worktree).await? {
                return Ok(GitOperationResult::failed(
                    "Rebase advanced but is still in progress",
                ));
            }
            return Ok(GitOperationResult::succeeded("Rebase completed"));
        }

        let conflicts = self.conflicted_paths(worktree).await?;
        if !conflicts.is_empty() {
            return Ok(GitOperationResult::conflicted(
                conflicts,
                "Rebase stopped on conflicts in the next commit",
            ));
        }
        Err(failure(output))
    }

    /// Squashes the session branch into one commit on the base branch of the
    /// primary checkout. Callers hold the project lock.
    pub async fn squash_merge(&self, request: SquashRequest) -> CoreResult<GitOperationResult> {
        let message = request.commit_message.trim().to_string();
        if message.is_empty() {
            return Err(CoreError::validation(
                "commit_message",
                "Commit message is required for squash merges",
            ));
        }

        let preflight = {
            let repo_path = request.repo_path.clone();
            let session_branch = request.session_branch.clone();
            let base_branch = request.base_branch.clone();
            run_blocking("merge preflight", self.command_timeout, move || {
                preflight(&repo_path, &session_branch, &base_branch)
            })
            .await?
        };

        if !preflight.dirty_paths.is_empty() {
            return Err(CoreError::validation(
                "project",
                format!(
                    "Primary checkout has uncommitted changes: {}",
                    preflight.dirty_paths.join(", ")
                ),
            ));
        }
        if preflight.current_branch.as_deref() != Some(request.base_branch.as_str()) {
            return Err(CoreError::validation(
                "project",
                format!(
                    "Primary checkout must be on '{}' to merge (currently on {})",
                    request.base_branch,
                    preflight.current_branch.as_deref().unwrap_or("a detached HEAD")
                ),
            ));
        }
        if preflight.state.is_up_to_date {
            return Ok(GitOperationResult::failed(format!(
                "Nothing to merge: '{}' has no commits ahead of '{}'",
                request.session_branch, request.base_branch
            )));
        }
        if preflight.state.has_conflicts {
            warn!(
                "{OPERATION_LABEL}: squash of '{}' into '{}' would conflict in {:?}",
                request.session_branch, request.base_branch, preflight.state.conflicting_paths
            );
            return Ok(GitOperationResult::conflicted(
                preflight.state.conflicting_paths,
                format!(
                    "Merging '{}' into '{}' conflicts; rebase the session first",
                    request.session_branch, request.base_branch
                ),
            ));
        }

        let repo = request.repo_path.as_path();
        let merge = self
            .git(repo, &["merge", "--squash", &request.session_branch])
            .await?;
        if !merge.success() {
            let conflicts = self.conflicted_paths(repo).await.unwrap_or_default();
            self.discard_partial_merge(repo).await;
            if conflicts.is_empty() {
                return Err(failure(merge));
            }
            return Ok(GitOperationResult::conflicted(
                conflicts,
                "Squash merge hit conflicts and was rolled back",
            ));
        }

        if let Err(err) = self.ignore_internal_worktrees(repo, &request.worktree_path).await {
            self.discard_partial_merge(repo).await;
            return Err(err);
        }

        let staged = self.git(repo, &["diff", "--cached", "--quiet"]).await?;
        if staged.success() {
            self.discard_partial_merge(repo).await;
            return Ok(GitOperationResult::failed(format!(
                "Nothing to merge: '{}' introduces no changes to '{}'",
                request.session_branch, request.base_branch
            )));
        }

        let commit = self.git(repo, &["commit", "-m", &message]).await?;
        if !commit.success() {
            self.discard_partial_merge(repo).await;
            return Err(failure(commit));
        }

        let head = self.git_ok(repo, &["rev-parse", "HEAD"]).await?;
        let sha = head.stdout.trim().to_string();
        info!(
            "{OPERATION_LABEL}: squashed '{}' into '{}' as {sha}",
            request.session_branch, request.base_branch
        );
        Ok(GitOperationResult::committed(
            format!(
                "Squashed '{}' into '{}'",
                request.session_branch, request.base_branch
            ),
            sha,
        ))
    }

    /// Every unmerged path, from both the index and the porcelain status.
    pub async fn conflicted_paths(&self, worktree: &Path) -> CoreResult<Vec<String>> {
        let mut paths = BTreeSet::new();

        let diff = self
            .git_ok(worktree, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        paths.extend(
            diff.stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );

        let status = self.git_ok(worktree, &["status", "--porcelain"]).await?;
        paths.extend(parse_conflicted_paths(&status.stdout));

        Ok(paths.into_iter().collect())
    }

    pub async fn rebase_pending(&self, worktree: &Path) -> CoreResult<bool> {
        let path = worktree.to_path_buf();
        run_blocking("rebase state", self.command_timeout, move || {
            rebase_in_progress(&path)
        })
        .await
    }

    async fn abort_quietly(&self, worktree: &Path) {
        match self.rebase_pending(worktree).await {
            Ok(true) => {
                if let Err(e) = self.git_ok(worktree, &["rebase", "--abort"]).await {
                    warn!("{OPERATION_LABEL}: failed to abort rebase in {}: {e}", worktree.display());
                }
            }
            Ok(false) => {}
            Err(e) => warn!("{OPERATION_LABEL}: could not read rebase state: {e}"),
        }
    }

    async fn discard_partial_merge(&self, repo: &Path) {
        let aborted = matches!(
            self.git(repo, &["merge", "--abort"]).await,
            Ok(ref output) if output.success()
        );
        if aborted {
            return;
        }
        debug!("{OPERATION_LABEL}: merge --abort unavailable, resetting {}", repo.display());
        if let Err(e) = self.git_ok(repo, &["reset", "--hard", "HEAD"]).await {
            warn!(
                "{OPERATION_LABEL}: failed to reset {} after merge failure: {e}",
                repo.display()
            );
        }
    }

    /// Worktrees living under the repository would otherwise show up as
    /// untracked content of the merge commit.
    async fn ignore_internal_worktrees(&self, repo: &Path, worktree: &Path) -> CoreResult<()> {
        let Some(entry) = internal_worktree_entry(repo, worktree) else {
            return Ok(());
        };

        let gitignore = repo.join(".gitignore");
        let existing = match tokio::fs::read_to_string(&gitignore).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(anyhow!(e)
                    .context(format!("Failed to read {}", gitignore.display()))
                    .into())
            }
        };
        let bare = entry.trim_end_matches('/');
        if existing
            .lines()
            .map(str::trim)
            .any(|line| line == entry || line == bare || line == format!("/{entry}"))
        {
            return Ok(());
        }

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&entry);
        updated.push('\n');
        tokio::fs::write(&gitignore, updated)
            .await
            .with_context(|| format!("Failed to update {}", gitignore.display()))?;
        self.git_ok(repo, &["add", ".gitignore"]).await?;
        debug!("{OPERATION_LABEL}: added '{entry}' to .gitignore");
        Ok(())
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> CoreResult<GitOutput> {
        let args = git_args(args);
        self.runner
            .run(cwd, &args, self.command_timeout)
            .await
            .map_err(CoreError::from)
    }

    async fn git_ok(&self, cwd: &Path, args: &[&str]) -> CoreResult<GitOutput> {
        let output = self.git(cwd, args).await?;
        output.into_result().map_err(CoreError::from)
    }
}

struct Preflight {
    dirty_paths: Vec<String>,
    current_branch: Option<String>,
    state: MergeState,
}

fn preflight(repo_path: &Path, session_branch: &str, base_branch: &str) -> Result<Preflight> {
    let dirty_paths = uncommitted_sample_paths(repo_path, DIRTY_SAMPLE_LIMIT)?;
    let current_branch = current_branch(repo_path)?;

    let repo = Repository::open(repo_path)
        .with_context(|| format!("Failed to open git repository at {}", repo_path.display()))?;
    let session_oid = resolve_branch_oid(&repo, session_branch).map_err(|_| {
        anyhow::Error::new(CoreError::not_found("branch", session_branch))
    })?;
    let base_oid = resolve_branch_oid(&repo, base_branch)
        .map_err(|_| anyhow::Error::new(CoreError::not_found("branch", base_branch)))?;
    let state = compute_merge_state(&repo, session_oid, base_oid, session_branch, base_branch)?;

    Ok(Preflight {
        dirty_paths,
        current_branch,
        state,
    })
}

/// Simulates merging `session_oid` into `parent_oid` in memory and lists
/// every path that would conflict.
pub fn compute_merge_state(
    repo: &Repository,
    session_oid: Oid,
    parent_oid: Oid,
    session_branch: &str,
    parent_branch: &str,
) -> Result<MergeState> {
    if !commits_ahead(repo, session_oid, parent_oid)? {
        return Ok(MergeState {
            has_conflicts: false,
            conflicting_paths: Vec::new(),
            is_up_to_date: true,
        });
    }

    let session_commit = repo.find_commit(session_oid).with_context(|| {
        format!("Failed to find commit {session_oid} for session branch '{session_branch}'")
    })?;
    let parent_commit = repo.find_commit(parent_oid).with_context(|| {
        format!("Failed to find commit {parent_oid} for parent branch '{parent_branch}'")
    })?;

    let mut merge_opts = MergeOptions::new();
    merge_opts.fail_on_conflict(false);

    let index = repo
        .merge_commits(&parent_commit, &session_commit, Some(&merge_opts))
        .with_context(|| {
            format!("Failed to simulate merge between '{session_branch}' and '{parent_branch}'")
        })?;

    let has_conflicts = index.has_conflicts();
    let conflicting_paths = if has_conflicts {
        collect_conflicting_paths(&index)?
    } else {
        Vec::new()
    };

    Ok(MergeState {
        has_conflicts,
        conflicting_paths,
        is_up_to_date: false,
    })
}

fn commits_ahead(repo: &Repository, session_oid: Oid, parent_oid: Oid) -> Result<bool> {
    if session_oid == parent_oid {
        return Ok(false);
    }

    let mut revwalk = repo.revwalk()?;
    revwalk.push(session_oid)?;
    revwalk.hide(parent_oid).ok();

    Ok(revwalk.next().is_some())
}

fn collect_conflicting_paths(index: &git2::Index) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let conflicts = index
        .conflicts()
        .with_context(|| "Failed to read merge conflicts")?;

    for conflict in conflicts {
        let conflict = conflict?;
        let path = conflict
            .our
            .as_ref()
            .and_then(index_entry_path)
            .or_else(|| conflict.their.as_ref().and_then(index_entry_path))
            .or_else(|| conflict.ancestor.as_ref().and_then(index_entry_path));

        if let Some(path) = path {
            seen.insert(path);
        }
    }

    Ok(seen.into_iter().collect())
}

pub fn resolve_branch_oid(repo: &Repository, branch: &str) -> Result<Oid> {
    let found = repo
        .find_branch(branch, BranchType::Local)
        .or_else(|_| repo.find_branch(branch, BranchType::Remote))
        .with_context(|| format!("Branch '{branch}' not found"))?;
    found
        .get()
        .target()
        .ok_or_else(|| anyhow!("Branch '{branch}' has no target"))
}

fn index_entry_path(entry: &git2::IndexEntry) -> Option<String> {
    std::str::from_utf8(entry.path.as_ref())
        .ok()
        .map(|s| s.trim_end_matches(char::from(0)).to_string())
}

/// `.gitignore` entry for the first directory of `worktree` below `repo`,
/// or `None` when the worktree lives outside the repository.
fn internal_worktree_entry(repo: &Path, worktree: &Path) -> Option<String> {
    let relative = worktree.strip_prefix(repo).ok()?;
    match relative.components().next()? {
        Component::Normal(first) => Some(format!("{}/", first.to_str()?)),
        _ => None,
    }
}

fn failure(output: GitOutput) -> CoreError {
    match output.into_result() {
        Err(err) => err.into(),
        Ok(_) => CoreError::from(GitCommandError::Failed {
            kind: GitFailureKind::Generic,
            message: "git reported success where a failure was expected".to_string(),
            exit_code: Some(0),
        }),
    }
}
