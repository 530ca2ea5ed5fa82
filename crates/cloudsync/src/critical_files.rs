//! Critical-file extractor (C5): finds gitignored-but-important files in a
//! repo (`.env*`, credentials, key material) so they can be packed into a
//! sibling `critical-ignored.tar.gz` alongside the bundle.
//!
//! A file is included iff it matches at least one allow-pattern, no
//! deny-pattern, *and* git reports it as ignored. Resolution of Open
//! Question 3: matching walks `symlink_metadata` so symlinks are never
//! followed, and stops at nested `.git` directories rather than recursing
//! into a nested repository's own ignored files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::Pattern;

use crate::config::CriticalPatternsConfig;
use crate::git;

const OVERRIDE_FILENAME: &str = ".cloudsync-critical";

/// A file matched by the critical-file rules, relative to the repo root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalFile {
    pub relative_path: PathBuf,
}

/// Collect the set of critical files to capture for `repo`, per §4.3's
/// allow/deny/git-ignored rule.
pub fn collect(repo: &Path, config: &CriticalPatternsConfig) -> Result<Vec<CriticalFile>> {
    let allow = compile_patterns(&merged_allow_patterns(repo, config)?)?;
    let deny = compile_patterns(&config.deny)?;

    let candidates = candidate_paths(repo, &allow, &deny)?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let ignored = git_ignored_subset(repo, &candidates)?;
    Ok(ignored
        .into_iter()
        .map(|relative_path| CriticalFile { relative_path })
        .collect())
}

/// Global allow list plus the repo's own `.cloudsync-critical` override
/// file, one pattern per line, blank lines and `#` comments skipped.
fn merged_allow_patterns(repo: &Path, config: &CriticalPatternsConfig) -> Result<Vec<String>> {
    let mut patterns = config.allow.clone();

    let override_path = repo.join(OVERRIDE_FILENAME);
    if override_path.exists() {
        let content = fs::read_to_string(&override_path)
            .with_context(|| format!("failed to read {}", override_path.display()))?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            patterns.push(line.to_string());
        }
    }

    Ok(patterns)
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).with_context(|| format!("invalid glob pattern {p:?}")))
        .collect()
}

/// A pattern with no `/` (e.g. `.env*`) is matched against the file's
/// basename rather than the whole relative path, since `Pattern::matches`
/// anchors to the entire string and would otherwise only ever match a file
/// sitting at the repo root.
fn matches_any(patterns: &[Pattern], relative: &Path) -> bool {
    let as_str = relative.to_string_lossy();
    patterns.iter().any(|p| {
        if p.as_str().contains('/') {
            p.matches(&as_str) || p.matches_path(relative)
        } else {
            relative
                .file_name()
                .is_some_and(|name| p.matches(&name.to_string_lossy()))
        }
    })
}

/// Walk the repo (symlinks not followed, nested `.git` dirs not descended
/// into), returning every regular file whose relative path matches an
/// allow-pattern and no deny-pattern.
fn candidate_paths(repo: &Path, allow: &[Pattern], deny: &[Pattern]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk(repo, repo, allow, deny, &mut out)?;
    Ok(out)
}

fn walk(
    repo_root: &Path,
    dir: &Path,
    allow: &[Pattern],
    deny: &[Pattern],
    out: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read dir {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;

        if meta.file_type().is_symlink() {
            continue;
        }

        let relative = path.strip_prefix(repo_root).unwrap_or(&path).to_path_buf();

        if meta.is_dir() {
            if path.file_name().and_then(|n| n.to_str()) == Some(".git") && path != repo_root.join(".git") {
                // A nested repository's own internals; never descend.
                continue;
            }
            if path.join(".git").exists() && path != *repo_root {
                // Nested repository root: treat its contents as out of scope.
                continue;
            }
            walk(repo_root, &path, allow, deny, out)?;
            continue;
        }

        if !meta.is_file() {
            continue;
        }

        if matches_any(deny, &relative) {
            continue;
        }
        if matches_any(allow, &relative) {
            out.push(relative);
        }
    }
    Ok(())
}

fn git_ignored_subset(repo: &Path, candidates: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let exclude_file = write_exclude_from(repo, candidates)?;
    let ignored = git::ls_ignored_matching(repo, exclude_file.path())?;
    let ignored: std::collections::HashSet<String> = ignored.into_iter().collect();

    Ok(candidates
        .iter()
        .filter(|p| ignored.contains(&p.to_string_lossy().into_owned()))
        .cloned()
        .collect())
}

fn write_exclude_from(repo: &Path, candidates: &[PathBuf]) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new_in(repo)
        .context("failed to create scratch exclude-from file")?;
    use std::io::Write;
    for path in candidates {
        writeln!(file, "{}", path.to_string_lossy())?;
    }
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    fn default_config() -> CriticalPatternsConfig {
        CriticalPatternsConfig::default()
    }

    fn init_repo(dir: &Path) {
        Command::new("git").args(["init", "--quiet"]).current_dir(dir).output().unwrap();
        Command::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dir).output().unwrap();
        Command::new("git").args(["config", "user.name", "T"]).current_dir(dir).output().unwrap();
    }

    #[test]
    fn matches_allow_pattern_and_is_gitignored() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        fs::write(td.path().join(".gitignore"), ".env\n").unwrap();
        fs::write(td.path().join(".env"), "SECRET=1").unwrap();

        let config = default_config();
        let found = collect(td.path(), &config).unwrap();
        assert!(found.iter().any(|f| f.relative_path == PathBuf::from(".env")));
    }

    #[test]
    fn allow_pattern_without_separator_matches_nested_file() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        fs::create_dir_all(td.path().join("backend")).unwrap();
        fs::write(td.path().join(".gitignore"), "backend/.env\n").unwrap();
        fs::write(td.path().join("backend/.env"), "SECRET=1").unwrap();

        let config = default_config();
        let found = collect(td.path(), &config).unwrap();
        assert!(found.iter().any(|f| f.relative_path == PathBuf::from("backend/.env")));
    }

    #[test]
    fn skips_files_not_gitignored() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        // .env matches the allow pattern but is tracked, not ignored.
        fs::write(td.path().join(".env"), "SECRET=1").unwrap();

        let config = default_config();
        let found = collect(td.path(), &config).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn deny_pattern_overrides_allow_pattern() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        fs::create_dir_all(td.path().join("node_modules")).unwrap();
        fs::write(td.path().join(".gitignore"), "node_modules/\n").unwrap();
        fs::write(td.path().join("node_modules/.env"), "noise").unwrap();

        let config = default_config();
        let found = collect(td.path(), &config).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn repo_override_file_extends_allow_list() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        fs::write(td.path().join(".gitignore"), "secrets.custom\n").unwrap();
        fs::write(td.path().join("secrets.custom"), "x").unwrap();
        fs::write(td.path().join(".cloudsync-critical"), "secrets.custom\n").unwrap();

        let config = default_config();
        let found = collect(td.path(), &config).unwrap();
        assert!(found.iter().any(|f| f.relative_path == PathBuf::from("secrets.custom")));
    }

    #[test]
    fn symlinks_are_never_followed() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        fs::write(td.path().join(".gitignore"), ".env\n").unwrap();
        let real = td.path().join("real.env");
        fs::write(&real, "SECRET=1").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&real, td.path().join(".env")).unwrap();
            let config = default_config();
            let found = collect(td.path(), &config).unwrap();
            assert!(!found.iter().any(|f| f.relative_path == PathBuf::from(".env")));
        }
    }
}
