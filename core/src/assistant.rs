//! Assistant kinds and their PTY command templates.
//! Each kind carries a start argv and a resume argv; the resume variant is
//! used when a crashed subprocess is respawned so the assistant picks up its
//! previous conversation instead of starting cold.

use std::path::Path;

use portable_pty::CommandBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantKind {
    Claude,
    Gemini,
    Codex,
    Shell,
}

impl AssistantKind {
    /// Parse the `assistant` query parameter. Unknown or missing kinds fall
    /// back to a plain shell.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.to_lowercase()).as_deref() {
            Some("claude") => Self::Claude,
            Some("gemini") => Self::Gemini,
            Some("codex") => Self::Codex,
            _ => Self::Shell,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Codex => "codex",
            Self::Shell => "shell",
        }
    }

    /// Argv for the first spawn of a session.
    pub fn start_command(&self) -> Vec<String> {
        match self {
            Self::Claude => argv(&["claude"]),
            Self::Gemini => argv(&["gemini"]),
            Self::Codex => argv(&["codex"]),
            Self::Shell => shell_argv(),
        }
    }

    /// Argv for respawning after a non-zero exit.
    pub fn resume_command(&self) -> Vec<String> {
        match self {
            Self::Claude => argv(&["claude", "--continue"]),
            Self::Gemini => argv(&["gemini"]),
            Self::Codex => argv(&["codex", "resume", "--last"]),
            Self::Shell => shell_argv(),
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(unix)]
fn shell_argv() -> Vec<String> {
    argv(&["bash", "-l"])
}

#[cfg(windows)]
fn shell_argv() -> Vec<String> {
    argv(&["cmd.exe"])
}

/// Build the PTY command for an argv, running in `cwd` and advertised as a
/// modern 256/truecolor terminal (matches the xterm.js client).
pub fn build_command(argv: &[String], cwd: &Path) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&argv[0]);
    for arg in &argv[1..] {
        cmd.arg(arg);
    }
    cmd.cwd(cwd);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_values() {
        assert_eq!(AssistantKind::parse(Some("claude")), AssistantKind::Claude);
        assert_eq!(AssistantKind::parse(Some("CODEX")), AssistantKind::Codex);
        assert_eq!(AssistantKind::parse(Some("unknown")), AssistantKind::Shell);
        assert_eq!(AssistantKind::parse(None), AssistantKind::Shell);
    }

    #[test]
    fn resume_differs_where_the_cli_supports_it() {
        assert_ne!(
            AssistantKind::Claude.start_command(),
            AssistantKind::Claude.resume_command()
        );
        assert_eq!(
            AssistantKind::Shell.start_command(),
            AssistantKind::Shell.resume_command()
        );
    }

    #[test]
    fn start_command_is_never_empty() {
        for kind in [
            AssistantKind::Claude,
            AssistantKind::Gemini,
            AssistantKind::Codex,
            AssistantKind::Shell,
        ] {
            assert!(!kind.start_command().is_empty());
            assert!(!kind.resume_command().is_empty());
        }
    }
}
