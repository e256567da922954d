use super::types::BranchInfo;
use anyhow::{anyhow, Result};
use git2::{BranchType, Repository};
use std::path::Path;

const FALLBACK_DEFAULT_BRANCHES: [&str; 2] = ["main", "master"];

pub fn list_branches(repo_path: &Path) -> Result<Vec<BranchInfo>> {
    log::info!("Listing branches for repo: {}", repo_path.display());

    let repo = Repository::open(repo_path)?;
    let default_branch = detect_default_branch(&repo);
    let remote_default = format!("origin/{default_branch}");

    let mut branches = Vec::new();

    for (branch, _) in repo.branches(Some(BranchType::Local))?.flatten() {
        if let Some(name) = branch.name()? {
            branches.push(BranchInfo {
                name: name.to_string(),
                is_remote: false,
                is_default: name == default_branch,
            });
        }
    }

    for (branch, _) in repo.branches(Some(BranchType::Remote))?.flatten() {
        if let Some(name) = branch.name()? {
            if name.ends_with("/HEAD") {
                continue;
            }
            branches.push(BranchInfo {
                name: name.to_string(),
                is_remote: true,
                is_default: name == remote_default,
            });
        }
    }

    branches.sort_by(|a, b| a.is_remote.cmp(&b.is_remote).then(a.name.cmp(&b.name)));
    branches.dedup_by(|a, b| a.name == b.name && a.is_remote == b.is_remote);

    log::debug!("Found {} branches", branches.len());
    Ok(branches)
}

/// Resolves the default branch: `origin/HEAD` first, then the local
/// `main`/`master` convention, then whatever HEAD points at.
pub fn default_branch(repo_path: &Path) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    Ok(detect_default_branch(&repo))
}

fn detect_default_branch(repo: &Repository) -> String {
    if let Ok(reference) = repo.find_reference("refs/remotes/origin/HEAD") {
        if let Some(target) = reference.symbolic_target() {
            if let Some(name) = target.strip_prefix("refs/remotes/origin/") {
                return name.to_string();
            }
        }
    }

    for candidate in FALLBACK_DEFAULT_BRANCHES {
        if repo.find_branch(candidate, BranchType::Local).is_ok() {
            return candidate.to_string();
        }
    }

    // Unborn or unconventional HEAD: read the symbolic target directly.
    if let Ok(head) = repo.find_reference("HEAD") {
        if let Some(target) = head.symbolic_target() {
            if let Some(name) = target.strip_prefix("refs/heads/") {
                return name.to_string();
            }
        }
    }

    FALLBACK_DEFAULT_BRANCHES[0].to_string()
}

pub fn delete_branch(repo_path: &Path, branch_name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;

    let mut branch = repo
        .find_branch(branch_name, BranchType::Local)
        .map_err(|e| anyhow!("Failed to delete branch {branch_name}: {e}"))?;

    branch
        .delete()
        .map_err(|e| anyhow!("Failed to delete branch {branch_name}: {e}"))?;

    Ok(())
}

pub fn branch_exists(repo_path: &Path, branch_name: &str) -> Result<bool> {
    let repo = Repository::open(repo_path)?;

    let exists = match repo.find_branch(branch_name, BranchType::Local) {
        Ok(_) => Ok(true),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
        Err(e)
            if e.code() == git2::ErrorCode::InvalidSpec
                || e.code() == git2::ErrorCode::GenericError =>
        {
            Ok(false)
        }
        Err(e) => Err(anyhow!("Error checking branch existence: {e}")),
    };
    exists
}
