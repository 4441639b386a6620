//! Git tools scoped to a workspace.
//!
//! Every git process runs through the sandbox with:
//! - `GIT_CONFIG_GLOBAL` pointing at `<workspace>/.gitconfig`, so the identity
//!   set by `git_config` belongs to that workspace only
//! - `GIT_TERMINAL_PROMPT=0`, so a credential prompt fails instead of hanging
//! - `GIT_ALLOW_PROTOCOL` limited to network transports; `file://` and local
//!   path clones could read outside the workspace
//! - `GIT_CEILING_DIRECTORIES` set to the workspaces base, so repository
//!   discovery stops at the user's root and never reaches a repository that
//!   happens to contain the base

use std::path::{Component, Path};

use serde_json::json;
use url::Url;

use super::{
    ExecutionContext, GitCloneParams, GitCommandParams, GitConfigParams, Payload, ToolError,
    ToolKind, ToolOutcome, ToolRegistry,
};
use crate::sandbox::{CommandSpec, ProcessOutput};
use crate::workspace::SecurityError;

const GIT_CONFIG_FILE: &str = ".gitconfig";
const ALLOWED_PROTOCOLS: &str = "http:https:ssh:git";
const ALLOWED_SCHEMES: &[&str] = &["http", "https", "ssh", "git"];

/// Options that write outside the workspace whatever their argument.
const DENIED_OPTIONS: &[&str] = &["--system"];

fn git(registry: &ToolRegistry, root: &Path, cwd: &Path) -> CommandSpec {
    CommandSpec::new("git", cwd, registry.settings.git_timeout)
        .env("GIT_CONFIG_GLOBAL", root.join(GIT_CONFIG_FILE).to_string_lossy())
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_ALLOW_PROTOCOL", ALLOWED_PROTOCOLS)
        .env("GIT_CEILING_DIRECTORIES", registry.workspaces.base().to_string_lossy())
}

async fn run_git(registry: &ToolRegistry, ctx: &ExecutionContext, spec: &CommandSpec) -> Result<ProcessOutput, ToolError> {
    tracing::debug!(user_id = %ctx.user_id, args = ?spec.args, "Running git");
    let output = registry.sandbox.run(spec, &ctx.cancel).await?;
    if !output.success() {
        return Err(ToolError::ProcessExit {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

pub(super) async fn git_config(registry: &ToolRegistry, ctx: &ExecutionContext, params: GitConfigParams) -> ToolOutcome {
    for (field, value) in [("name", &params.name), ("email", &params.email)] {
        if value.trim().is_empty() || value.contains(&['\n', '\r', '\0'][..]) {
            return Err(ToolError::invalid(
                ToolKind::GitConfig,
                format!("{} must be a non-empty single line", field),
            ));
        }
    }

    let root = registry.workspaces.root_for(&ctx.user_id).await?;
    let config_file = root.join(GIT_CONFIG_FILE);
    for (key, value) in [("user.name", &params.name), ("user.email", &params.email)] {
        let spec = git(registry, &root, &root)
            .arg("config")
            .arg("--file")
            .arg(config_file.to_string_lossy())
            .arg(key)
            .arg(value.trim());
        run_git(registry, ctx, &spec).await?;
    }

    tracing::info!(user_id = %ctx.user_id, "Configured git identity");

    let mut payload = Payload::new();
    payload.insert("name".into(), json!(params.name.trim()));
    payload.insert("email".into(), json!(params.email.trim()));
    Ok(payload)
}

pub(super) async fn git_clone(registry: &ToolRegistry, ctx: &ExecutionContext, params: GitCloneParams) -> ToolOutcome {
    let target = registry
        .workspaces
        .resolve_in(&ctx.user_id, &params.folder_name)
        .await?;
    let shown = target.display();
    if target.is_root() {
        return Err(ToolError::AlreadyExists(shown));
    }

    let repo_url = params.repo_url.trim();
    validate_repo_url(repo_url).map_err(|e| ToolError::invalid(ToolKind::GitClone, e))?;
    let branch = params
        .branch
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty());
    if let Some(branch) = branch {
        if branch.starts_with('-') {
            return Err(ToolError::invalid(ToolKind::GitClone, "branch must not start with '-'"));
        }
    }

    // Check-and-clone must not interleave for the same target.
    let _guard = registry
        .clone_locks
        .lock(&(ctx.user_id.clone(), target.path.clone()))
        .await;

    if tokio::fs::symlink_metadata(&target.path).await.is_ok() {
        return Err(ToolError::AlreadyExists(shown));
    }
    if let Some(parent) = target.path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolError::io("create parent directories for", &shown, e))?;
    }

    tracing::info!(user_id = %ctx.user_id, repo_url, folder = %shown, "Cloning repository");

    let mut spec = git(registry, &target.root, &target.root).arg("clone");
    if let Some(branch) = branch {
        spec = spec.arg("--branch").arg(branch);
    }
    let spec = spec
        .arg("--")
        .arg(repo_url)
        .arg(target.path.to_string_lossy());
    let output = run_git(registry, ctx, &spec).await?;

    let mut payload = Payload::new();
    payload.insert("folder".into(), json!(shown));
    payload.insert("repoUrl".into(), json!(repo_url));
    if let Some(branch) = branch {
        payload.insert("branch".into(), json!(branch));
    }
    payload.insert("stdout".into(), json!(output.stdout));
    payload.insert("stderr".into(), json!(output.stderr));
    Ok(payload)
}

pub(super) async fn git_command(registry: &ToolRegistry, ctx: &ExecutionContext, params: GitCommandParams) -> ToolOutcome {
    let folder = registry
        .workspaces
        .resolve_in(&ctx.user_id, &params.folder_path)
        .await?;
    let shown = folder.display();

    let mut args = tokenize_command(&params.command).map_err(|e| ToolError::invalid(ToolKind::GitCommand, e))?;
    if args.first().map(String::as_str) == Some("git") {
        args.remove(0);
    }
    match args.first() {
        None => return Err(ToolError::invalid(ToolKind::GitCommand, "command is empty")),
        Some(first) if first.starts_with('-') => {
            return Err(ToolError::invalid(
                ToolKind::GitCommand,
                format!("options before the subcommand are not allowed: '{}'", first),
            ))
        }
        Some(_) => {}
    }
    check_arguments(&args)?;

    match tokio::fs::metadata(&folder.path).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return Err(ToolError::NotFound(shown)),
    }

    tracing::info!(user_id = %ctx.user_id, folder = %shown, subcommand = %args[0], "Running git command");

    let spec = git(registry, &folder.root, &folder.path).args(&args);
    let output = run_git(registry, ctx, &spec).await?;

    let mut payload = Payload::new();
    payload.insert("command".into(), json!(format!("git {}", args.join(" "))));
    payload.insert("folder".into(), json!(shown));
    payload.insert("stdout".into(), json!(output.stdout));
    payload.insert("stderr".into(), json!(output.stderr));
    payload.insert("exitCode".into(), json!(output.exit_code));
    Ok(payload)
}

fn validate_repo_url(url: &str) -> Result<(), String> {
    if url.is_empty() {
        return Err("repoUrl is empty".to_string());
    }
    if url.starts_with('-') {
        return Err("repoUrl must not start with '-'".to_string());
    }

    match Url::parse(url) {
        Ok(parsed) if ALLOWED_SCHEMES.contains(&parsed.scheme()) => Ok(()),
        Ok(parsed) => Err(format!(
            "unsupported repository scheme '{}' (use https, ssh or git)",
            parsed.scheme()
        )),
        // scp-like `user@host:path`
        Err(_) => match url.split_once(':') {
            Some((host, path))
                if host.contains('@')
                    && !host.contains('/')
                    && !path.is_empty()
                    && !path.starts_with(':') =>
            {
                Ok(())
            }
            _ => Err(format!("'{}' is not a supported repository URL", url)),
        },
    }
}

/// Reject arguments that point outside the workspace.
fn check_arguments(args: &[String]) -> Result<(), ToolError> {
    let mut previous: Option<&str> = None;
    for arg in args {
        if DENIED_OPTIONS.contains(&arg.as_str()) {
            return Err(ToolError::invalid(
                ToolKind::GitCommand,
                format!("option '{}' is not allowed", arg),
            ));
        }

        // Commit messages are free text.
        let is_message = matches!(previous, Some("-m") | Some("--message")) || arg.starts_with("--message=");
        previous = Some(arg.as_str());
        if is_message {
            continue;
        }

        let value = arg.split_once('=').map(|(_, v)| v).unwrap_or(arg);
        for candidate in [arg.as_str(), value] {
            let path = Path::new(candidate);
            if path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
                return Err(SecurityError::OutsideWorkspace(arg.clone()).into());
            }
        }
    }
    Ok(())
}

/// Split a command line into arguments with shell-like quoting, without a
/// shell. Supports single quotes, double quotes (with `\"` and `\\` escapes)
/// and backslash escapes outside quotes.
pub fn tokenize_command(command: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}
