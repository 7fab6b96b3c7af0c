//! Exec command grammar and repository path resolution.
//!
//! A channel may only run `git-upload-pack '<path>'` or
//! `git-receive-pack '<path>'`, with `<path>` quoted the way git's `sq_quote`
//! emits it. Everything here is pure and runs before any process is spawned.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use super::error::{Error, Result};

/// Git service a channel asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitCommand {
    /// Serves fetch and clone.
    UploadPack,
    /// Serves push.
    ReceivePack,
}

impl GitCommand {
    /// Command name as it appears on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            GitCommand::UploadPack => "git-upload-pack",
            GitCommand::ReceivePack => "git-receive-pack",
        }
    }

    /// Subcommand passed to the git executable.
    pub fn subcommand(&self) -> &'static str {
        match self {
            GitCommand::UploadPack => "upload-pack",
            GitCommand::ReceivePack => "receive-pack",
        }
    }

    fn from_wire(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(GitCommand::UploadPack),
            "git-receive-pack" => Some(GitCommand::ReceivePack),
            _ => None,
        }
    }
}

impl fmt::Display for GitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A parsed exec request: the service and the unresolved repository path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: GitCommand,
    pub path: String,
}

/// Parse the raw exec payload of a channel.
///
/// # Errors
///
/// Returns [`Error::InvalidCommand`] for anything other than one of the two
/// git services followed by a single quoted argument.
pub fn parse_exec_command(raw: &[u8]) -> Result<ExecRequest> {
    let line = std::str::from_utf8(raw)
        .map_err(|_| Error::InvalidCommand("command is not valid UTF-8".to_string()))?;

    if line.contains('\0') {
        return Err(Error::InvalidCommand("command contains NUL".to_string()));
    }

    let (name, argument) = line
        .split_once(' ')
        .ok_or_else(|| Error::InvalidCommand(summarize(line)))?;

    let command =
        GitCommand::from_wire(name).ok_or_else(|| Error::InvalidCommand(summarize(line)))?;

    let path = sq_dequote(argument).ok_or_else(|| {
        Error::InvalidCommand(format!("{}: malformed repository argument", command))
    })?;

    if path.is_empty() {
        return Err(Error::InvalidCommand(format!(
            "{}: empty repository path",
            command
        )));
    }

    Ok(ExecRequest { command, path })
}

/// Undo git's `sq_quote`: one or more single-quoted segments, optionally
/// joined by `\'` or `\!`. Returns `None` for unquoted input or trailing text.
pub fn sq_dequote(arg: &str) -> Option<String> {
    let mut out = String::with_capacity(arg.len());
    let mut chars = arg.chars();

    if chars.next()? != '\'' {
        return None;
    }

    loop {
        // Inside quotes everything is literal up to the closing quote.
        loop {
            match chars.next()? {
                '\'' => break,
                c => out.push(c),
            }
        }

        match chars.next() {
            None => return Some(out),
            Some('\\') => {
                let escaped = chars.next()?;
                if escaped != '\'' && escaped != '!' {
                    return None;
                }
                out.push(escaped);
                if chars.next()? != '\'' {
                    return None;
                }
            }
            Some(_) => return None,
        }
    }
}

/// Resolve a requested repository path against the canonical repository
/// root.
///
/// A leading `/` is treated as relative to `root`. When `<path>` does not
/// exist but `<path>.git` does, the bare repository is used.
///
/// # Errors
///
/// - [`Error::PathEscapesRoot`] for `~`, `..` or any path whose canonical
///   form leaves `root` (symlinks included)
/// - [`Error::RepositoryNotFound`] when neither candidate is a directory
pub fn resolve_repo_path(root: &Path, requested: &str) -> Result<PathBuf> {
    if requested.starts_with('~') {
        return Err(Error::PathEscapesRoot(requested.to_string()));
    }

    let relative = requested.trim_start_matches('/').trim_end_matches('/');
    if relative.is_empty() {
        return Err(Error::InvalidCommand("empty repository path".to_string()));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathEscapesRoot(requested.to_string()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(Error::InvalidCommand("empty repository path".to_string()));
    }

    let direct = root.join(&clean);
    let candidate = if direct.exists() {
        direct
    } else {
        let mut bare = clean.into_os_string();
        bare.push(".git");
        root.join(bare)
    };

    let canonical = match candidate.canonicalize() {
        Ok(path) => path,
        Err(_) => return Err(Error::RepositoryNotFound(requested.to_string())),
    };

    if !canonical.starts_with(root) {
        return Err(Error::PathEscapesRoot(requested.to_string()));
    }
    if !canonical.is_dir() {
        return Err(Error::RepositoryNotFound(requested.to_string()));
    }

    Ok(canonical)
}

fn summarize(line: &str) -> String {
    const MAX: usize = 64;
    match line.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}
