use regex::Regex;
use std::path::Path;
use std::process::Command;

use crate::common::ExecutionError;

/// Find the `owner/repo` slug for the repository at `path` by parsing the
/// origin remote URL against the configured forge instance.
pub fn find_github_repo(path: &Path, github_instance: &str) -> Result<String, ExecutionError> {
    let url = git_output(path, &["remote", "get-url", "origin"])?;
    parse_remote_url(&url, github_instance).ok_or_else(|| {
        ExecutionError::Config(format!("Could not parse remote URL: {}", url))
    })
}

/// The HEAD commit sha of the repository at `path`.
pub fn find_git_revision(path: &Path) -> Result<String, ExecutionError> {
    git_output(path, &["rev-parse", "HEAD"])
}

/// The symbolic ref HEAD points at (e.g. `refs/heads/main`); detached HEADs
/// fall back to an exactly-matching tag ref.
pub fn find_git_ref(path: &Path) -> Result<String, ExecutionError> {
    match git_output(path, &["symbolic-ref", "HEAD"]) {
        Ok(git_ref) => Ok(git_ref),
        Err(_) => {
            let tag = git_output(path, &["describe", "--tags", "--exact-match"])?;
            Ok(format!("refs/tags/{}", tag))
        }
    }
}

fn git_output(path: &Path, args: &[&str]) -> Result<String, ExecutionError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(path)
        .args(args)
        .output()
        .map_err(|e| ExecutionError::Config(format!("Failed to run git: {}", e)))?;

    if !output.status.success() {
        return Err(ExecutionError::Config(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn parse_remote_url(url: &str, github_instance: &str) -> Option<String> {
    let instance = regex::escape(github_instance);
    let pattern = format!(
        r"(?:https://{instance}/|git@{instance}:)([^/]+)/(.+?)(?:\.git)?/?$",
        instance = instance
    );
    let re = Regex::new(&pattern).ok()?;
    let captures = re.captures(url.trim())?;
    Some(format!("{}/{}", &captures[1], &captures[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote_url_forms() {
        assert_eq!(
            parse_remote_url("https://github.com/owner/repo.git", "github.com").unwrap(),
            "owner/repo"
        );
        assert_eq!(
            parse_remote_url("git@github.com:owner/repo.git", "github.com").unwrap(),
            "owner/repo"
        );
        assert_eq!(
            parse_remote_url("https://github.com/owner/repo", "github.com").unwrap(),
            "owner/repo"
        );
        assert_eq!(
            parse_remote_url("https://ghe.corp.example/owner/repo.git", "ghe.corp.example")
                .unwrap(),
            "owner/repo"
        );
        assert!(parse_remote_url("https://gitlab.com/owner/repo.git", "github.com").is_none());
    }
}
