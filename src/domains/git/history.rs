use super::types::{CommitFileChange, CommitInfo};
use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use git2::{Commit, Delta, DiffFindOptions, DiffOptions, Oid, Repository, Sort};
use std::path::Path;

pub const DEFAULT_COMMIT_LIMIT: usize = 20;

/// Commits reachable from `branch` but not from `base_branch`, newest first.
pub fn get_commits(
    repo_path: &Path,
    branch: &str,
    base_branch: &str,
    limit: usize,
) -> Result<Vec<CommitInfo>> {
    let repo = Repository::open(repo_path).context("Failed to open git repository")?;

    let branch_oid = resolve_commitish(&repo, branch)
        .with_context(|| format!("Branch '{branch}' not found"))?;

    let mut revwalk = repo.revwalk()?;
    revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
    revwalk.push(branch_oid)?;
    if let Ok(base_oid) = resolve_commitish(&repo, base_branch) {
        revwalk.hide(base_oid)?;
    } else {
        log::warn!("Base branch '{base_branch}' not found; listing full history of '{branch}'");
    }

    let effective_limit = if limit == 0 { DEFAULT_COMMIT_LIMIT } else { limit };
    let mut commits = Vec::new();
    for oid in revwalk.take(effective_limit) {
        let commit = repo.find_commit(oid?)?;
        commits.push(to_commit_info(&repo, &commit)?);
    }

    Ok(commits)
}

fn to_commit_info(repo: &Repository, commit: &Commit<'_>) -> Result<CommitInfo> {
    let hash = commit.id().to_string();
    let short_hash = commit
        .as_object()
        .short_id()
        .ok()
        .and_then(|buf| buf.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| hash.chars().take(7).collect());

    let author = commit.author();
    let date = Utc
        .timestamp_opt(commit.time().seconds(), 0)
        .single()
        .unwrap_or_else(Utc::now);

    Ok(CommitInfo {
        hash,
        short_hash,
        message: commit.message().unwrap_or_default().trim_end().to_string(),
        author: author.name().unwrap_or_default().to_string(),
        author_email: author.email().unwrap_or_default().to_string(),
        date,
        files_changed: count_changed_files(repo, commit)?,
    })
}

fn count_changed_files(repo: &Repository, commit: &Commit<'_>) -> Result<usize> {
    let new_tree = commit.tree()?;
    let old_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());
    let diff = repo.diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), None)?;
    Ok(diff.deltas().len())
}

pub fn get_commit_file_changes(
    repo_path: &Path,
    commit_hash: &str,
) -> Result<Vec<CommitFileChange>> {
    let repo = Repository::open(repo_path).context("Failed to open git repository")?;

    let oid = resolve_commitish(&repo, commit_hash).context("Failed to resolve commit hash")?;
    let commit = repo
        .find_commit(oid)
        .context("Failed to find commit for history details")?;

    let new_tree = commit
        .tree()
        .context("Failed to read commit tree for history details")?;
    let old_tree = if commit.parent_count() > 0 {
        commit.parent(0).ok().and_then(|parent| parent.tree().ok())
    } else {
        None
    };

    let mut opts = DiffOptions::new();
    opts.include_untracked(false)
        .recurse_untracked_dirs(false)
        .ignore_submodules(true);

    let mut diff = repo
        .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut opts))
        .context("Failed to compute commit diff for history details")?;

    let mut find_opts = DiffFindOptions::new();
    diff.find_similar(Some(&mut find_opts))
        .context("Failed to analyse commit diff for history details")?;

    let mut files = Vec::new();
    for delta in diff.deltas() {
        let status = match delta.status() {
            Delta::Added => "A",
            Delta::Deleted => "D",
            Delta::Modified => "M",
            Delta::Renamed => "R",
            Delta::Copied => "C",
            _ => "M",
        };

        if let Some(path) = delta
            .new_file()
            .path()
            .or_else(|| delta.old_file().path())
            .and_then(|path| path.to_str())
        {
            if !path.is_empty() {
                files.push(CommitFileChange {
                    path: path.to_string(),
                    change_type: status.to_string(),
                });
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// True when `commit_hash` names a commit in the repository.
pub fn commit_exists(repo_path: &Path, commit_hash: &str) -> Result<bool> {
    let repo = Repository::open(repo_path).context("Failed to open git repository")?;
    Ok(resolve_commitish(&repo, commit_hash).is_ok())
}

pub(crate) fn resolve_commitish(repo: &Repository, spec: &str) -> Result<Oid> {
    let object = repo
        .revparse_single(spec)
        .map_err(|e| anyhow!("Cannot resolve '{spec}': {e}"))?;
    let commit = object
        .peel_to_commit()
        .map_err(|e| anyhow!("'{spec}' does not name a commit: {e}"))?;
    Ok(commit.id())
}
