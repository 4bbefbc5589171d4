//! Exec command parsing and repository path validation.
//!
//! Every check here runs before any network I/O.  The exec string is the
//! only client-controlled input that ends up in an upstream command line,
//! so the repository argument goes through a strict allow-list.

use std::fmt;

/// The two Git transport commands the gateway relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitCommand {
    /// `git-upload-pack` -- fetch/clone (pull).
    UploadPack,
    /// `git-receive-pack` -- push.
    ReceivePack,
}

impl GitCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }
}

impl fmt::Display for GitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated `host/path.git` repository reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoTarget {
    /// Upstream host name, e.g. `github.com`.
    pub host: String,
    /// Path on the upstream host, e.g. `org/repo.git`.
    pub path: String,
}

impl RepoTarget {
    /// `host/path`, the form shown to the approval gate and in logs.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.host, self.path)
    }
}

/// A parsed and validated exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCommand {
    pub command: GitCommand,
    pub target: RepoTarget,
}

impl ExecCommand {
    /// The command line to run on the upstream host.  Safe to quote because
    /// the path charset excludes quotes and whitespace.
    pub fn upstream_command(&self) -> String {
        format!("{} '{}'", self.command, self.target.path)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unsupported command: {0}")]
    Unsupported(String),
    #[error("invalid repository path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

/// Parse an exec string of the form `git-upload-pack '<host>/<path>.git'`.
pub fn parse_exec(raw: &str) -> Result<ExecCommand, CommandError> {
    let raw = raw.trim();
    let (name, arg) = match raw.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (raw, ""),
    };

    let command = match name {
        "git-upload-pack" => GitCommand::UploadPack,
        "git-receive-pack" => GitCommand::ReceivePack,
        other => return Err(CommandError::Unsupported(truncate_for_display(other))),
    };

    let target = parse_repo_path(arg)?;
    Ok(ExecCommand { command, target })
}

fn truncate_for_display(s: &str) -> String {
    const MAX: usize = 64;
    if s.chars().count() <= MAX {
        s.to_string()
    } else {
        let cut: String = s.chars().take(MAX).collect();
        format!("{cut}...")
    }
}

fn parse_repo_path(arg: &str) -> Result<RepoTarget, CommandError> {
    let invalid = |reason| CommandError::InvalidPath {
        path: truncate_for_display(arg),
        reason,
    };

    let unquoted = match arg.strip_prefix('\'') {
        Some(inner) => inner.strip_suffix('\'').ok_or_else(|| invalid("unbalanced quote"))?,
        None => arg,
    };
    let path = unquoted.strip_prefix('/').unwrap_or(unquoted);

    if path.is_empty() {
        return Err(invalid("missing repository path"));
    }
    if !path
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/' | b'-'))
    {
        return Err(invalid("contains disallowed characters"));
    }
    if path.contains("..") {
        return Err(invalid("contains a traversal sequence"));
    }
    if path.contains("//") || path.starts_with('/') || path.ends_with('/') {
        return Err(invalid("contains an empty path segment"));
    }
    if !path.ends_with(".git") {
        return Err(invalid("must end in .git"));
    }

    let (host, repo_path) = path
        .split_once('/')
        .ok_or_else(|| invalid("expected host/path.git"))?;
    if !is_domain_name(host) {
        return Err(invalid("host segment is not a domain name"));
    }
    if repo_path.split('/').any(|segment| segment.starts_with('-')) {
        return Err(invalid("path segment starts with '-'"));
    }
    if repo_path.rsplit('/').next() == Some(".git") {
        return Err(invalid("missing repository name"));
    }

    Ok(RepoTarget {
        host: host.to_ascii_lowercase(),
        path: repo_path.to_string(),
    })
}

/// Hostname shape check: dot-separated labels of alphanumerics and inner
/// hyphens, ending in an alphabetic top-level label.
fn is_domain_name(host: &str) -> bool {
    if host.len() > 253 || !host.contains('.') {
        return false;
    }
    let labels: Vec<&str> = host.split('.').collect();
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    });
    let tld_ok = labels
        .last()
        .is_some_and(|tld| tld.len() >= 2 && tld.bytes().all(|b| b.is_ascii_alphabetic()));
    labels_ok && tld_ok
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(raw: &str) -> &'static str {
        match parse_exec(raw) {
            Err(CommandError::InvalidPath { reason, .. }) => reason,
            other => panic!("expected invalid path for {raw:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_upload_pack_quoted() {
        let cmd = parse_exec("git-upload-pack 'github.com/acme/widgets.git'").unwrap();
        assert_eq!(cmd.command, GitCommand::UploadPack);
        assert_eq!(cmd.target.host, "github.com");
        assert_eq!(cmd.target.path, "acme/widgets.git");
        assert_eq!(cmd.target.repository(), "github.com/acme/widgets.git");
        assert_eq!(
            cmd.upstream_command(),
            "git-upload-pack 'acme/widgets.git'"
        );
    }

    #[test]
    fn test_parse_receive_pack_leading_slash_unquoted() {
        let cmd = parse_exec("git-receive-pack /gitlab.com/group/sub/proj.git").unwrap();
        assert_eq!(cmd.command, GitCommand::ReceivePack);
        assert_eq!(cmd.target.host, "gitlab.com");
        assert_eq!(cmd.target.path, "group/sub/proj.git");
    }

    #[test]
    fn test_parse_quoted_leading_slash_and_dot_repo() {
        let cmd = parse_exec("git-upload-pack '/GitHub.com/acme/.github.git'").unwrap();
        assert_eq!(cmd.target.host, "github.com");
        assert_eq!(cmd.target.path, "acme/.github.git");
    }

    #[test]
    fn test_unsupported_commands() {
        for raw in [
            "ls -la",
            "git-upload-archive 'github.com/a/b.git'",
            "git-upload-packx 'github.com/a/b.git'",
            "",
        ] {
            assert!(
                matches!(parse_exec(raw), Err(CommandError::Unsupported(_))),
                "{raw:?}"
            );
        }
        assert_eq!(
            parse_exec("rm -rf /").unwrap_err().to_string(),
            "unsupported command: rm"
        );
    }

    #[test]
    fn test_rejects_traversal_and_double_slash() {
        assert_eq!(
            reason("git-upload-pack 'github.com/acme/../etc/passwd.git'"),
            "contains a traversal sequence"
        );
        assert_eq!(
            reason("git-receive-pack 'github.com//acme/repo.git'"),
            "contains an empty path segment"
        );
        assert_eq!(
            reason("git-receive-pack '//github.com/acme/repo.git'"),
            "contains an empty path segment"
        );
    }

    #[test]
    fn test_rejects_injection_characters() {
        for raw in [
            "git-upload-pack 'github.com/a/b.git'; rm -rf /",
            "git-upload-pack 'github.com/a/b.git' && true",
            "git-upload-pack github.com/a/$(id).git",
            "git-upload-pack 'github.com/a/b c.git'",
            "git-upload-pack \"github.com/a/b.git\"",
            "git-upload-pack github.com/a/b`x`.git",
        ] {
            assert!(parse_exec(raw).is_err(), "{raw:?}");
        }
        assert_eq!(
            reason("git-upload-pack 'github.com/a/b.git"),
            "unbalanced quote"
        );
    }

    #[test]
    fn test_rejects_bad_hosts() {
        assert_eq!(
            reason("git-upload-pack 'localhost/a/b.git'"),
            "host segment is not a domain name"
        );
        assert_eq!(
            reason("git-upload-pack '10.0.0.1/a/b.git'"),
            "host segment is not a domain name"
        );
        assert_eq!(
            reason("git-upload-pack '-evil.com/a/b.git'"),
            "host segment is not a domain name"
        );
        assert_eq!(
            reason("git-upload-pack 'github..com/a/b.git'"),
            "contains a traversal sequence"
        );
    }

    #[test]
    fn test_rejects_shape_errors() {
        assert_eq!(reason("git-upload-pack"), "missing repository path");
        assert_eq!(reason("git-upload-pack ''"), "missing repository path");
        assert_eq!(
            reason("git-upload-pack 'github.com/acme/repo'"),
            "must end in .git"
        );
        assert_eq!(
            reason("git-upload-pack 'github.com.git'"),
            "expected host/path.git"
        );
        assert_eq!(
            reason("git-upload-pack 'github.com/acme/-repo.git'"),
            "path segment starts with '-'"
        );
        assert_eq!(
            reason("git-upload-pack 'github.com/acme/.git'"),
            "missing repository name"
        );
        assert_eq!(
            reason("git-upload-pack 'github.com/acme/repo.git/'"),
            "contains an empty path segment"
        );
    }
}
