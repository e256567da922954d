use super::history::resolve_commitish;
use super::types::{DiffDetails, FileDiff, FileStatus};
use anyhow::{Context, Result};
use git2::{Delta, DiffFindOptions, DiffOptions, Oid, Repository};
use similar::{ChangeTag, TextDiff};
use std::path::Path;

/// Content above this size is summarized without materializing text.
const MAX_CONTENT_BYTES: usize = 1024 * 1024;

/// Diffs `branch` against its merge-base with `base_branch` (the
/// `base...branch` range), materializing both sides of every text file.
pub fn get_diff_details(repo_path: &Path, branch: &str, base_branch: &str) -> Result<DiffDetails> {
    let repo = Repository::open(repo_path).context("Failed to open git repository")?;

    let Ok(branch_oid) = resolve_commitish(&repo, branch) else {
        log::debug!("Branch '{branch}' has no commits; reporting empty diff");
        return Ok(DiffDetails::default());
    };

    let base_tree = match resolve_commitish(&repo, base_branch) {
        Ok(base_oid) => match repo.merge_base(branch_oid, base_oid) {
            Ok(merge_base) => Some(repo.find_commit(merge_base)?.tree()?),
            Err(e) => {
                log::warn!("No merge base between '{branch}' and '{base_branch}': {e}");
                None
            }
        },
        Err(_) => None,
    };
    let branch_tree = repo.find_commit(branch_oid)?.tree()?;

    let mut opts = DiffOptions::new();
    opts.ignore_submodules(true);
    let mut diff = repo
        .diff_tree_to_tree(base_tree.as_ref(), Some(&branch_tree), Some(&mut opts))
        .context("Failed to compute branch diff")?;
    let mut find_opts = DiffFindOptions::new();
    diff.find_similar(Some(&mut find_opts))
        .context("Failed to detect renames")?;

    let mut details = DiffDetails::default();
    for delta in diff.deltas() {
        let status = match delta.status() {
            Delta::Added | Delta::Copied | Delta::Untracked => FileStatus::Added,
            Delta::Deleted => FileStatus::Deleted,
            _ => FileStatus::Modified,
        };

        let Some(path) = delta
            .new_file()
            .path()
            .or_else(|| delta.old_file().path())
            .and_then(|p| p.to_str())
        else {
            continue;
        };

        let old_blob = read_blob(&repo, delta.old_file().id());
        let new_blob = read_blob(&repo, delta.new_file().id());
        let is_binary = delta.flags().is_binary()
            || matches!(&old_blob, Some(BlobText::Binary))
            || matches!(&new_blob, Some(BlobText::Binary));

        let file = if is_binary {
            FileDiff {
                path: path.to_string(),
                status,
                additions: 0,
                deletions: 0,
                old_content: None,
                new_content: None,
                is_binary: true,
            }
        } else {
            let old_content = old_blob.and_then(BlobText::into_text);
            let new_content = new_blob.and_then(BlobText::into_text);
            let (additions, deletions) = count_line_changes(
                old_content.as_deref().unwrap_or(""),
                new_content.as_deref().unwrap_or(""),
            );
            FileDiff {
                path: path.to_string(),
                status,
                additions,
                deletions,
                old_content,
                new_content,
                is_binary: false,
            }
        };

        details.total_additions += file.additions;
        details.total_deletions += file.deletions;
        details.files.push(file);
    }

    details.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(details)
}

enum BlobText {
    Text(String),
    Binary,
}

impl BlobText {
    fn into_text(self) -> Option<String> {
        match self {
            BlobText::Text(text) => Some(text),
            BlobText::Binary => None,
        }
    }
}

fn read_blob(repo: &Repository, oid: Oid) -> Option<BlobText> {
    if oid.is_zero() {
        return None;
    }
    let blob = repo.find_blob(oid).ok()?;
    if blob.is_binary() || blob.size() > MAX_CONTENT_BYTES {
        return Some(BlobText::Binary);
    }
    match std::str::from_utf8(blob.content()) {
        Ok(text) => Some(BlobText::Text(text.to_string())),
        Err(_) => Some(BlobText::Binary),
    }
}

pub fn count_line_changes(old: &str, new: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(old, new);
    let mut additions = 0;
    let mut deletions = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => additions += 1,
            ChangeTag::Delete => deletions += 1,
            ChangeTag::Equal => {}
        }
    }
    (additions, deletions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;
    use tempfile::TempDir;

    fn run_git(path: &Path, args: &[&str]) {
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
    }

    fn init_repo(path: &Path) {
        run_git(path, &["init"]);
        run_git(path, &["config", "user.email", "test@example.com"]);
        run_git(path, &["config", "user.name", "Test User"]);
        fs::write(path.join("README.md"), "line one\nline two\n").unwrap();
        run_git(path, &["add", "README.md"]);
        run_git(path, &["commit", "-m", "Initial commit"]);
        run_git(path, &["branch", "-M", "main"]);
    }

    #[test]
    fn counts_line_changes() {
        assert_eq!(count_line_changes("a\nb\n", "a\nc\nd\n"), (2, 1));
        assert_eq!(count_line_changes("", "x\n"), (1, 0));
        assert_eq!(count_line_changes("same\n", "same\n"), (0, 0));
    }

    #[test]
    fn reports_added_and_modified_files_with_consistent_totals() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        run_git(temp.path(), &["checkout", "-b", "session/demo"]);
        fs::write(temp.path().join("added.txt"), "one\ntwo\nthree\n").unwrap();
        fs::write(temp.path().join("README.md"), "line one\nline 2\n").unwrap();
        run_git(temp.path(), &["add", "."]);
        run_git(temp.path(), &["commit", "-m", "session work"]);

        let details = get_diff_details(temp.path(), "session/demo", "main").unwrap();
        assert_eq!(details.files.len(), 2);

        let readme = &details.files[0];
        assert_eq!(readme.path, "README.md");
        assert_eq!(readme.status, FileStatus::Modified);
        assert_eq!((readme.additions, readme.deletions), (1, 1));
        assert_eq!(readme.old_content.as_deref(), Some("line one\nline two\n"));
        assert_eq!(readme.new_content.as_deref(), Some("line one\nline 2\n"));

        let added = &details.files[1];
        assert_eq!(added.status, FileStatus::Added);
        assert_eq!((added.additions, added.deletions), (3, 0));
        assert!(added.old_content.is_none());

        let sum_add: usize = details.files.iter().map(|f| f.additions).sum();
        let sum_del: usize = details.files.iter().map(|f| f.deletions).sum();
        assert_eq!(details.total_additions, sum_add);
        assert_eq!(details.total_deletions, sum_del);
    }

    #[test]
    fn ignores_changes_made_on_base_after_branching() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        run_git(temp.path(), &["checkout", "-b", "session/demo"]);
        fs::write(temp.path().join("session.txt"), "s\n").unwrap();
        run_git(temp.path(), &["add", "."]);
        run_git(temp.path(), &["commit", "-m", "session work"]);

        run_git(temp.path(), &["checkout", "main"]);
        fs::write(temp.path().join("main-only.txt"), "m\n").unwrap();
        run_git(temp.path(), &["add", "."]);
        run_git(temp.path(), &["commit", "-m", "main work"]);

        let details = get_diff_details(temp.path(), "session/demo", "main").unwrap();
        let paths: Vec<_> = details.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["session.txt"]);
    }

    #[test]
    fn binary_files_degrade_to_zero_counts() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        run_git(temp.path(), &["checkout", "-b", "session/demo"]);
        fs::write(temp.path().join("blob.bin"), [0u8, 159, 146, 150, 0, 1, 2]).unwrap();
        fs::remove_file(temp.path().join("README.md")).unwrap();
        run_git(temp.path(), &["add", "-A"]);
        run_git(temp.path(), &["commit", "-m", "binary"]);

        let details = get_diff_details(temp.path(), "session/demo", "main").unwrap();
        let binary = details.files.iter().find(|f| f.path == "blob.bin").unwrap();
        assert!(binary.is_binary);
        assert_eq!((binary.additions, binary.deletions), (0, 0));
        assert!(binary.new_content.is_none());

        let deleted = details.files.iter().find(|f| f.path == "README.md").unwrap();
        assert_eq!(deleted.status, FileStatus::Deleted);
        assert_eq!(deleted.deletions, 2);
    }

    #[test]
    fn empty_repository_yields_empty_diff() {
        let temp = TempDir::new().unwrap();
        run_git(temp.path(), &["init"]);
        let details = get_diff_details(temp.path(), "main", "main").unwrap();
        assert!(details.files.is_empty());
        assert_eq!(details.total_additions, 0);
    }
}
