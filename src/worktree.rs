//! Git worktree management for job isolation.
//!
//! Each job runs in its own worktree so concurrent jobs on the same
//! repository never touch each other's checkout. Worktrees live beside the
//! main checkout under `../{repo}-worktrees/` and are pruned by the
//! maintenance pass once their issue is closed.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Turn an issue title into a branch-safe slug, capped at 40 characters.
pub fn slugify(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let slug: String = slug.split('-').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("-");
    slug.chars().take(40).collect::<String>().trim_end_matches('-').to_string()
}

pub fn branch_name(issue_number: i64, title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("overseer/issue-{}", issue_number)
    } else {
        format!("overseer/issue-{}-{}", issue_number, slug)
    }
}

#[async_trait]
pub trait WorktreeService: Send + Sync {
    /// Checkout for a job to run in. Creates the worktree and branch if
    /// they do not already exist; reuses them if they do, so a revise pass
    /// lands on the same branch the plan produced.
    async fn acquire(&self, repo_path: &Path, issue_number: i64, title: &str) -> Result<PathBuf>;

    /// Remove the worktree for an issue. The branch is left alone; it may
    /// still be an open pull request.
    async fn release(&self, repo_path: &Path, issue_number: i64) -> Result<()>;

    /// Issue numbers that currently have a worktree checked out.
    async fn list(&self, repo_path: &Path) -> Result<Vec<i64>>;
}

pub struct GitWorktreeService {
    default_branch: String,
}

impl GitWorktreeService {
    pub fn new(default_branch: String) -> Self {
        Self { default_branch }
    }

    fn worktree_root(repo_path: &Path) -> PathBuf {
        let name = repo_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());
        repo_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(format!("{}-worktrees", name))
    }

    fn worktree_path(repo_path: &Path, issue_number: i64) -> PathBuf {
        Self::worktree_root(repo_path).join(format!("issue-{}", issue_number))
    }

    async fn git(repo_path: &Path, args: &[&str]) -> Result<String> {
        debug!("git {} (in {})", args.join(" "), repo_path.display());
        let output = Command::new("git")
            .args(args)
            .current_dir(repo_path)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn branch_exists(repo_path: &Path, branch: &str) -> bool {
        Self::git(
            repo_path,
            &["rev-parse", "--verify", &format!("refs/heads/{}", branch)],
        )
        .await
        .is_ok()
    }
}

#[async_trait]
impl WorktreeService for GitWorktreeService {
    async fn acquire(&self, repo_path: &Path, issue_number: i64, title: &str) -> Result<PathBuf> {
        let path = Self::worktree_path(repo_path, issue_number);
        if path.join(".git").exists() {
            debug!("Reusing worktree at {}", path.display());
            return Ok(path);
        }

        tokio::fs::create_dir_all(Self::worktree_root(repo_path))
            .await
            .context("Failed to create worktree root")?;

        let branch = branch_name(issue_number, title);
        let path_str = path.to_string_lossy().into_owned();
        if Self::branch_exists(repo_path, &branch).await {
            Self::git(repo_path, &["worktree", "add", &path_str, &branch]).await?;
        } else {
            Self::git(
                repo_path,
                &["worktree", "add", "-b", &branch, &path_str, &self.default_branch],
            )
            .await?;
        }
        info!("Created worktree {} on branch {}", path.display(), branch);
        Ok(path)
    }

    async fn release(&self, repo_path: &Path, issue_number: i64) -> Result<()> {
        let path = Self::worktree_path(repo_path, issue_number);
        if !path.exists() {
            return Ok(());
        }
        let path_str = path.to_string_lossy().into_owned();
        Self::git(repo_path, &["worktree", "remove", "--force", &path_str]).await?;
        info!("Removed worktree {}", path.display());
        Ok(())
    }

    async fn list(&self, repo_path: &Path) -> Result<Vec<i64>> {
        let root = Self::worktree_root(repo_path);
        let output = Self::git(repo_path, &["worktree", "list", "--porcelain"]).await?;
        let mut issues = Vec::new();
        for line in output.lines() {
            let Some(path) = line.strip_prefix("worktree ") else {
                continue;
            };
            let path = Path::new(path);
            if !path.starts_with(&root) {
                continue;
            }
            if let Some(n) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("issue-"))
                .and_then(|n| n.parse::<i64>().ok())
            {
                issues.push(n);
            }
        }
        issues.sort_unstable();
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Fix the widget renderer"), "fix-the-widget-renderer");
    }

    #[test]
    fn test_slugify_strips_punctuation_and_caps_length() {
        assert_eq!(slugify("Add `--verbose` flag!!"), "add-verbose-flag");
        let long = "a".repeat(100);
        assert_eq!(slugify(&long).len(), 40);
    }

    #[test]
    fn test_slugify_collapses_runs() {
        assert_eq!(slugify("fix  ---  thing"), "fix-thing");
    }

    #[test]
    fn test_branch_name() {
        assert_eq!(
            branch_name(7, "Fix the widget"),
            "overseer/issue-7-fix-the-widget"
        );
        assert_eq!(branch_name(9, "!!!"), "overseer/issue-9");
    }

    #[test]
    fn test_worktree_path_layout() {
        let path = GitWorktreeService::worktree_path(Path::new("/work/widget"), 7);
        assert_eq!(path, PathBuf::from("/work/widget-worktrees/issue-7"));
    }
}
