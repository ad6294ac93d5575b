//! What each session runs, and where

use std::path::{Path, PathBuf};

use ca_core::config::AgentConfig;
use ca_protocol::TerminalSize;

/// Name of the agent CLI
const AGENT_PROGRAM: &str = "claude";

/// Directories searched for the agent when it is not configured
///
/// Desktop launchers often start with a minimal `PATH`, so the usual install
/// locations are checked before falling back to a bare name.
const AGENT_SEARCH_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "~/.local/bin", "/usr/bin"];

/// Terminal type exported to every session
const TERM: &str = "xterm-256color";

/// A fully resolved command to run under a pseudo-terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: PathBuf,
    /// Environment added on top of the relay's own
    pub env: Vec<(String, String)>,
    /// Initial terminal size
    pub size: TerminalSize,
}

impl CommandSpec {
    /// Run `program` in the user's home directory with a default-sized terminal
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            env: vec![("TERM".to_string(), TERM.to_string())],
            size: TerminalSize::default(),
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the initial terminal size
    pub fn size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    /// Command for the agent CLI as configured, in the directory the client asked for
    pub fn for_agent(agent: &AgentConfig, requested_cwd: Option<&str>, size: TerminalSize) -> Self {
        let program = agent.program.clone().unwrap_or_else(find_agent_program);
        let cwd = resolve_working_dir(requested_cwd, &agent.search_roots, agent.default_cwd.as_deref());

        let mut spec = Self::new(program).cwd(cwd).size(size);
        spec.args.extend(agent.args.iter().cloned());
        spec.env.extend(agent.env.iter().cloned());
        spec
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        None => PathBuf::from(path),
    }
}

/// Locate the agent CLI, falling back to a `PATH` lookup
pub fn find_agent_program() -> String {
    AGENT_SEARCH_DIRS
        .iter()
        .map(|dir| expand_home(dir).join(AGENT_PROGRAM))
        .find(|candidate| candidate.is_file())
        .map(|found| found.to_string_lossy().into_owned())
        .unwrap_or_else(|| AGENT_PROGRAM.to_string())
}

/// Pick the directory a session starts in
///
/// An absolute request is used when it is a directory. A relative one is
/// tried under each search root and then as given. Anything else falls back
/// to `default`, then the home directory.
pub fn resolve_working_dir(
    requested: Option<&str>,
    search_roots: &[PathBuf],
    default: Option<&Path>,
) -> PathBuf {
    let fallback = || {
        default
            .filter(|dir| dir.is_dir())
            .map(Path::to_path_buf)
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    };

    let Some(requested) = requested.map(str::trim).filter(|r| !r.is_empty()) else {
        return fallback();
    };

    let requested_path = expand_home(requested);
    if requested_path.is_absolute() {
        if requested_path.is_dir() {
            return requested_path;
        }
        tracing::warn!("Requested directory {} does not exist", requested_path.display());
        return fallback();
    }

    search_roots
        .iter()
        .map(|root| root.join(&requested_path))
        .chain(std::iter::once(requested_path.clone()))
        .find(|candidate| candidate.is_dir())
        .unwrap_or_else(|| {
            tracing::warn!("Could not find directory '{}', using default", requested);
            fallback()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_new_sets_term() {
        let spec = CommandSpec::new("/bin/sh");
        assert!(spec
            .env
            .contains(&("TERM".to_string(), "xterm-256color".to_string())));
        assert_eq!(spec.size, TerminalSize::default());
    }

    #[test]
    fn test_absolute_dir_used_as_is() {
        let dir = tempdir().unwrap();
        let requested = dir.path().to_string_lossy().into_owned();
        assert_eq!(resolve_working_dir(Some(&requested), &[], None), dir.path());
    }

    #[test]
    fn test_relative_dir_found_under_root_in_order() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        std::fs::create_dir(second.path().join("project")).unwrap();

        let roots = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        assert_eq!(
            resolve_working_dir(Some("project"), &roots, None),
            second.path().join("project")
        );

        std::fs::create_dir(first.path().join("project")).unwrap();
        assert_eq!(
            resolve_working_dir(Some("project"), &roots, None),
            first.path().join("project")
        );
    }

    #[test]
    fn test_missing_dir_falls_back_to_default() {
        let default = tempdir().unwrap();
        let roots = vec![default.path().to_path_buf()];
        assert_eq!(
            resolve_working_dir(Some("no-such-project"), &roots, Some(default.path())),
            default.path()
        );
        assert_eq!(
            resolve_working_dir(Some("/no/such/absolute/dir"), &[], Some(default.path())),
            default.path()
        );
        assert_eq!(resolve_working_dir(None, &[], Some(default.path())), default.path());
    }

    #[test]
    fn test_for_agent_uses_configured_program() {
        let dir = tempdir().unwrap();
        let agent = AgentConfig {
            program: Some("/bin/cat".to_string()),
            args: vec!["-u".to_string()],
            env: vec![("FOO".to_string(), "bar".to_string())],
            default_cwd: Some(dir.path().to_path_buf()),
            search_roots: vec![],
        };

        let spec = CommandSpec::for_agent(&agent, None, TerminalSize::new(40, 120));
        assert_eq!(spec.program, "/bin/cat");
        assert_eq!(spec.args, vec!["-u".to_string()]);
        assert_eq!(spec.cwd, dir.path());
        assert_eq!(spec.size, TerminalSize::new(40, 120));
        assert!(spec.env.contains(&("FOO".to_string(), "bar".to_string())));
        assert!(spec.env.iter().any(|(k, _)| k == "TERM"));
    }
}
