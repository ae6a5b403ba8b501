use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::command_lexer::tokenize;
use crate::config::OrchestratorConfig;
use crate::error::CommandRejection;

pub const REQUIRED_PROGRAM: &str = "docker";
pub const REQUIRED_SUBCOMMAND: &str = "compose";
pub const MIN_COMMAND_LEN: usize = 3;
pub const MAX_COMMAND_LEN: usize = 2_000;

pub const ALLOWED_VERBS: &[&str] = &[
    "up", "down", "build", "pull", "restart", "stop", "start", "ps", "logs", "config", "top",
];

/// Flags that would point the compose client at another daemon.
pub const FORBIDDEN_FLAGS: &[&str] = &["-H", "--host", "--context"];

/// Global compose flags whose value is a separate token.
const VALUE_FLAGS: &[&str] = &[
    "--project-directory",
    "-f",
    "--file",
    "-p",
    "--project-name",
    "--profile",
    "--env-file",
    "--ansi",
    "--progress",
    "--parallel",
];

const PROJECT_DIRECTORY_FLAG: &str = "--project-directory";

/// Path-valued flags confined to the workspace wherever they appear.
const PATH_FLAGS: &[&str] = &[PROJECT_DIRECTORY_FLAG, "--env-file"];
/// Confined only before the verb; `logs -f` means follow.
const GLOBAL_PATH_FLAGS: &[&str] = &["--file", "-f"];

/// A command that passed every policy rule, normalized and ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedCommand {
    pub program: String,
    /// Arguments after the program, including injected flags.
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    pub verb: String,
}

impl ValidatedCommand {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Shell-quoted rendering for logs and output lines.
    pub fn display(&self) -> String {
        shell_words::join(self.argv())
    }
}

#[derive(Debug, Clone)]
pub struct CommandPolicy {
    workspace_root: PathBuf,
    default_project_dir: String,
    inject_build_progress: bool,
}

impl CommandPolicy {
    /// A relative `workspace_root` is anchored at the current directory.
    pub fn new(workspace_root: impl Into<PathBuf>, default_project_dir: impl Into<String>) -> Self {
        Self {
            workspace_root: absolute_root(workspace_root.into()),
            default_project_dir: default_project_dir.into(),
            inject_build_progress: true,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(&config.workspace_root, config.default_project_dir.clone())
            .with_build_progress(config.inject_build_progress)
    }

    pub fn with_build_progress(mut self, inject: bool) -> Self {
        self.inject_build_progress = inject;
        self
    }

    pub fn validate(&self, raw: &str) -> Result<ValidatedCommand, CommandRejection> {
        let trimmed = raw.trim();
        let len = trimmed.chars().count();
        if !(MIN_COMMAND_LEN..=MAX_COMMAND_LEN).contains(&len) {
            if len == 0 {
                return Err(CommandRejection::Empty);
            }
            return Err(CommandRejection::InvalidLength {
                len,
                min: MIN_COMMAND_LEN,
                max: MAX_COMMAND_LEN,
            });
        }

        let tokens = tokenize(trimmed)?;
        if tokens.len() < 2 {
            return Err(CommandRejection::TooShort);
        }
        if tokens[0] != REQUIRED_PROGRAM || tokens[1] != REQUIRED_SUBCOMMAND {
            return Err(CommandRejection::PrefixNotAllowed);
        }

        let mut args: Vec<String> = tokens[1..].to_vec();
        for arg in &args[1..] {
            if let Some(flag) = forbidden_flag(arg) {
                return Err(CommandRejection::ForbiddenFlag {
                    flag: flag.to_string(),
                });
            }
        }

        let verb_index = find_verb(&args)?;
        let verb = args[verb_index].clone();
        if !ALLOWED_VERBS.contains(&verb.as_str()) {
            return Err(CommandRejection::VerbNotAllowed {
                verb,
                allowed: ALLOWED_VERBS.join(", "),
            });
        }

        let mut has_project_directory = false;
        let mut index = 1;
        while index < args.len() {
            let (flag, value, consumed) = match split_path_flag(&args, index, verb_index) {
                Some(found) => found,
                None => {
                    index += 1;
                    continue;
                }
            };
            let value = value.ok_or_else(|| CommandRejection::MissingFlagValue {
                flag: flag.to_string(),
            })?;
            if resolve_within(&self.workspace_root, &value).is_none() {
                return Err(CommandRejection::PathEscapesWorkspace {
                    flag: flag.to_string(),
                    value,
                });
            }
            if flag == PROJECT_DIRECTORY_FLAG {
                has_project_directory = true;
            }
            index += consumed;
        }

        if !has_project_directory {
            args.insert(1, PROJECT_DIRECTORY_FLAG.to_string());
            args.insert(2, self.default_project_dir.clone());
        }

        if self.inject_build_progress
            && verb == "build"
            && !args
                .iter()
                .any(|a| a == "--progress" || a.starts_with("--progress="))
        {
            args.push("--progress".to_string());
            args.push("plain".to_string());
        }

        Ok(ValidatedCommand {
            program: REQUIRED_PROGRAM.to_string(),
            args,
            working_directory: self.workspace_root.clone(),
            verb,
        })
    }
}

fn forbidden_flag(arg: &str) -> Option<&'static str> {
    FORBIDDEN_FLAGS.iter().copied().find(|flag| {
        if arg == *flag {
            return true;
        }
        if flag.starts_with("--") {
            arg.starts_with(&format!("{flag}="))
        } else {
            arg.starts_with(flag)
        }
    })
}

/// `args[0]` is `compose`; returns the index of the subcommand.
fn find_verb(args: &[String]) -> Result<usize, CommandRejection> {
    let mut index = 1;
    while index < args.len() {
        let arg = &args[index];
        if !arg.starts_with('-') {
            return Ok(index);
        }
        if VALUE_FLAGS.contains(&arg.as_str()) {
            if index + 1 >= args.len() {
                return Err(CommandRejection::MissingFlagValue { flag: arg.clone() });
            }
            index += 2;
        } else {
            index += 1;
        }
    }
    Err(CommandRejection::MissingVerb {
        allowed: ALLOWED_VERBS.join(", "),
    })
}

/// Recognizes a path-bearing flag at `index`, in the separate-token,
/// `--long=value`, `-fvalue` and `-f=value` spellings. Returns the flag, its
/// value if any, and how many tokens it spans.
fn split_path_flag(
    args: &[String],
    index: usize,
    verb_index: usize,
) -> Option<(&'static str, Option<String>, usize)> {
    let arg = args[index].as_str();
    let global: &[&'static str] = if index < verb_index {
        GLOBAL_PATH_FLAGS
    } else {
        &[]
    };
    for &flag in PATH_FLAGS.iter().chain(global) {
        if arg == flag {
            let value = args.get(index + 1).filter(|v| !v.is_empty()).cloned();
            return Some((flag, value, 2));
        }
        let Some(rest) = arg.strip_prefix(flag) else {
            continue;
        };
        let attached = if flag.starts_with("--") {
            rest.strip_prefix('=')
        } else {
            Some(rest.strip_prefix('=').unwrap_or(rest))
        };
        if let Some(value) = attached {
            let value = Some(value.to_string()).filter(|v| !v.is_empty());
            return Some((flag, value, 1));
        }
    }
    None
}

/// Lexically resolves `value` against `root` and returns the result if it
/// stays inside. No filesystem access, so symlinks are not followed. A
/// relative `root` confines nothing and is refused.
pub fn resolve_within(root: &Path, value: &str) -> Option<PathBuf> {
    if !root.is_absolute() {
        return None;
    }
    let root = normalize(root);
    let candidate = normalize(&root.join(value));
    candidate.starts_with(&root).then_some(candidate)
}

fn absolute_root(root: PathBuf) -> PathBuf {
    if root.is_absolute() {
        return normalize(&root);
    }
    std::env::current_dir()
        .map(|cwd| normalize(&cwd.join(&root)))
        .unwrap_or(root)
}

/// `..` never climbs above the root of an absolute path.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}
