//! Low-level `git` subprocess wrapper used by the bundle engine (C3).
//!
//! Overrides the binary path through an env var so tests can substitute a
//! fake executable instead of requiring a real git install.

use std::env;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};

fn git_program() -> String {
    env::var("CLOUDSYNC_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

fn run(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new(git_program())
        .args(args)
        .current_dir(repo)
        .output()
        .with_context(|| format!("failed to run git {args:?} in {}", repo.display()))
}

fn ok_stdout(repo: &Path, args: &[&str]) -> Result<String> {
    let out = run(repo, args)?;
    if !out.status.success() {
        bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// `git rev-parse HEAD`
pub fn current_commit(repo: &Path) -> Result<String> {
    ok_stdout(repo, &["rev-parse", "HEAD"])
}

/// `git rev-parse --verify HEAD`, used to detect a repo with zero commits
/// before anything downstream tries to resolve HEAD (§3.1 empty-source
/// outcome).
pub fn has_commits(repo: &Path) -> bool {
    run(repo, &["rev-parse", "--verify", "--quiet", "HEAD"])
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// `git bundle create <path> <refspec...>`. `refspec_args` is usually
/// `["--all"]` for a full bundle or `["--all", "^<parent_commit>"]` for an
/// incremental one (commits reachable from any ref, excluding those already
/// reachable from the parent bundle's commit).
pub fn bundle_create(repo: &Path, bundle_path: &Path, refspec_args: &[&str]) -> Result<()> {
    let bundle_str = bundle_path.to_string_lossy().into_owned();
    let mut args = vec!["bundle", "create", &bundle_str];
    args.extend_from_slice(refspec_args);
    let out = run(repo, &args)?;
    if !out.status.success() {
        bail!(
            "git bundle create failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

/// `git tag -f <name> <commit>`, used to pin the commit a bundle was cut
/// from so the next incremental's refspec can reference it by name.
pub fn tag_force(repo: &Path, tag_name: &str, commit: &str) -> Result<()> {
    let out = run(repo, &["tag", "-f", tag_name, commit])?;
    if !out.status.success() {
        bail!(
            "git tag -f failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

/// `git rev-list --count <range>`, used to detect "no commits since last
/// bundle" (skip-if-unchanged, §4.3).
pub fn rev_list_count(repo: &Path, range: &str) -> Result<u64> {
    let stdout = ok_stdout(repo, &["rev-list", "--count", range])?;
    stdout
        .parse::<u64>()
        .with_context(|| format!("unexpected rev-list --count output: {stdout:?}"))
}

/// `git rev-list --count --all ^<since>`: commits reachable from *any* ref
/// that are not reachable from `since`. Unlike a plain `since..HEAD` range,
/// this catches new commits on branches other than the current one, which
/// is what the decision procedure's step 4 ("no new commits reachable from
/// any ref") requires.
pub fn rev_list_count_new_since(repo: &Path, since: &str) -> Result<u64> {
    let exclude = format!("^{since}");
    let stdout = ok_stdout(repo, &["rev-list", "--count", "--all", &exclude])?;
    stdout
        .parse::<u64>()
        .with_context(|| format!("unexpected rev-list --count output: {stdout:?}"))
}

/// `git for-each-ref`, used by verification to enumerate what a restored
/// bundle's clone actually contains.
pub fn for_each_ref(repo: &Path, format: &str) -> Result<Vec<String>> {
    let stdout = ok_stdout(repo, &["for-each-ref", &format!("--format={format}")])?;
    Ok(stdout.lines().map(|l| l.to_string()).collect())
}

/// `git ls-files --others -i --exclude-from=<file>`, used by the critical-file
/// extractor (C5) to enumerate ignored files that match the allow patterns.
pub fn ls_ignored_matching(repo: &Path, exclude_from: &Path) -> Result<Vec<String>> {
    let exclude_str = exclude_from.to_string_lossy().into_owned();
    let stdout = ok_stdout(
        repo,
        &[
            "ls-files",
            "--others",
            "-i",
            "--exclude-from",
            &exclude_str,
        ],
    )?;
    Ok(stdout.lines().map(|l| l.to_string()).collect())
}

/// `git fsck --full`, used by the verifier (C8) to assert a restored clone
/// is internally consistent.
pub fn fsck_full(repo: &Path) -> Result<()> {
    let out = run(repo, &["fsck", "--full"])?;
    if !out.status.success() {
        bail!(
            "git fsck --full reported problems: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

/// `git bundle verify <bundle>`: the bundle's own internal consistency
/// self-check, distinct from a checksum comparison against the manifest.
pub fn bundle_verify(bundle_path: &Path) -> Result<()> {
    let bundle_str = bundle_path.to_string_lossy().into_owned();
    let out = Command::new(git_program())
        .args(["bundle", "verify", "--quiet", &bundle_str])
        .output()
        .with_context(|| format!("failed to run git bundle verify on {}", bundle_path.display()))?;
    if !out.status.success() {
        bail!(
            "git bundle verify failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

/// `git clone <bundle> <dest>`, used by restore and verification.
pub fn clone_bundle(bundle_path: &Path, dest: &Path) -> Result<()> {
    let bundle_str = bundle_path.to_string_lossy().into_owned();
    let dest_str = dest.to_string_lossy().into_owned();
    let out = Command::new(git_program())
        .args(["clone", "--quiet", &bundle_str, &dest_str])
        .output()
        .with_context(|| format!("failed to clone bundle {}", bundle_path.display()))?;
    if !out.status.success() {
        bail!(
            "git clone failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

/// `git fetch <bundle> <refspec>` applied against an already-cloned repo,
/// the normal way to layer an incremental bundle's new commits/refs in.
/// Plain `git bundle unbundle` only unpacks objects and prints ref names —
/// it never moves a local branch pointer — so `fetch` (which does update
/// refs matching the refspec) is what restore needs here.
pub fn fetch_bundle(repo: &Path, bundle_path: &Path, refspec: &str) -> Result<()> {
    let bundle_str = bundle_path.to_string_lossy().into_owned();
    let out = run(repo, &["fetch", "--quiet", &bundle_str, refspec])?;
    if !out.status.success() {
        bail!(
            "git fetch from bundle failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

/// `git rev-parse --abbrev-ref HEAD`, the branch currently checked out.
pub fn current_branch(repo: &Path) -> Result<String> {
    ok_stdout(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// `git rev-parse --verify <branch>`, used by restore to pick a primary
/// branch to check out (prefer `main`, fall back to `master`).
pub fn branch_exists(repo: &Path, branch: &str) -> bool {
    run(repo, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// `git checkout <branch>`, the final step of a git restore.
pub fn checkout(repo: &Path, branch: &str) -> Result<()> {
    let out = run(repo, &["checkout", "--quiet", branch])?;
    if !out.status.success() {
        bail!(
            "git checkout {branch} failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

/// `git reset --hard <ref>`. Needed after `fetch_bundle` updates a branch
/// that is already the current `HEAD`: a bare `checkout` of a branch you're
/// already on is a no-op and leaves the worktree pointed at the pre-fetch
/// commit, so restore resyncs the worktree explicitly.
pub fn reset_hard(repo: &Path, refname: &str) -> Result<()> {
    let out = run(repo, &["reset", "--quiet", "--hard", refname])?;
    if !out.status.success() {
        bail!(
            "git reset --hard {refname} failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}
