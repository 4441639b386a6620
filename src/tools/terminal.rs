//! Script execution tool.
//!
//! `run_node` hands a workspace file to the configured script runner with the
//! workspace root as working directory. Nothing goes through a shell; the
//! script path is passed as a single absolute argument.

use std::time::Duration;

use serde_json::json;

use super::{ExecutionContext, Payload, RunNodeParams, ToolError, ToolOutcome, ToolRegistry};
use crate::sandbox::CommandSpec;

pub(super) async fn run_node(registry: &ToolRegistry, ctx: &ExecutionContext, params: RunNodeParams) -> ToolOutcome {
    let script = registry
        .workspaces
        .resolve_in(&ctx.user_id, &params.relative_path)
        .await?;
    let shown = script.display();

    let meta = tokio::fs::metadata(&script.path)
        .await
        .map_err(|e| ToolError::io("run", &shown, e))?;
    if !meta.is_file() {
        return Err(ToolError::Io(format!("Failed to run {}: not a file", shown)));
    }

    let timeout = script_timeout(&registry.settings, params.timeout_ms);
    let spec = CommandSpec::new(&registry.settings.script_runner, &script.root, timeout)
        .arg(script.path.to_string_lossy());

    tracing::info!(
        user_id = %ctx.user_id,
        script = %shown,
        runner = %registry.settings.script_runner,
        timeout_ms = timeout.as_millis() as u64,
        "Running script"
    );

    let output = registry.sandbox.run(&spec, &ctx.cancel).await?;
    if !output.success() {
        return Err(ToolError::ProcessExit {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }

    let mut payload = Payload::new();
    payload.insert("script".into(), json!(shown));
    payload.insert("stdout".into(), json!(output.stdout));
    payload.insert("stderr".into(), json!(output.stderr));
    payload.insert("exitCode".into(), json!(output.exit_code));
    if output.truncated {
        payload.insert("truncated".into(), json!(true));
    }
    Ok(payload)
}

/// Requested timeout, defaulted and clamped to the configured maximum.
fn script_timeout(settings: &super::ToolSettings, requested_ms: Option<u64>) -> Duration {
    let requested = requested_ms
        .map(Duration::from_millis)
        .unwrap_or(settings.script_timeout);
    requested.clamp(Duration::from_millis(1), settings.max_script_timeout)
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::super::test_support::*;
    use super::super::{ToolErrorKind, ToolSettings};
    use super::*;
    use crate::approval::DisabledApprovalGate;

    fn sh_settings() -> ToolSettings {
        ToolSettings {
            script_runner: "sh".to_string(),
            ..ToolSettings::default()
        }
    }

    async fn write(registry: &ToolRegistry, user: &str, path: &str, content: &str) {
        let result = call(
            registry,
            user,
            "write_file",
            json!({ "relativePath": path, "content": content }),
        )
        .await;
        assert!(result.success, "{:?}", result.error);
    }

    #[test]
    fn test_script_timeout_defaults_and_caps() {
        let settings = ToolSettings::default();
        assert_eq!(script_timeout(&settings, None), Duration::from_millis(30_000));
        assert_eq!(script_timeout(&settings, Some(500)), Duration::from_millis(500));
        assert_eq!(script_timeout(&settings, Some(u64::MAX)), settings.max_script_timeout);
        assert_eq!(script_timeout(&settings, Some(0)), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_runs_script_in_workspace_root() {
        let (registry, _dir) = registry_with(Arc::new(DisabledApprovalGate), sh_settings()).await;
        write(&registry, "alice", "data.txt", "hello from alice").await;
        write(&registry, "alice", "scripts/show.sh", "cat data.txt\necho done >&2\n").await;

        let result = call(&registry, "alice", "run_node", json!({ "relativePath": "scripts/show.sh" })).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.get("stdout"), Some(&json!("hello from alice")));
        assert_eq!(result.get("stderr"), Some(&json!("done\n")));
        assert_eq!(result.get("exitCode"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_not_thrown() {
        let (registry, _dir) = registry_with(Arc::new(DisabledApprovalGate), sh_settings()).await;
        write(&registry, "alice", "fail.sh", "echo partial\nexit 3\n").await;

        let result = call(&registry, "alice", "run_node", json!({ "relativePath": "fail.sh" })).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ToolErrorKind::Process));
        assert_eq!(result.get("exitCode"), Some(&json!(3)));
        assert_eq!(result.get("stdout"), Some(&json!("partial\n")));
    }

    #[tokio::test]
    async fn test_script_past_timeout_is_killed() {
        let (registry, _dir) = registry_with(Arc::new(DisabledApprovalGate), sh_settings()).await;
        write(&registry, "alice", "slow.sh", "sleep 30\n").await;

        let started = Instant::now();
        let result = call(
            &registry,
            "alice",
            "run_node",
            json!({ "relativePath": "slow.sh", "timeoutMs": 200 }),
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ToolErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_script_is_io_error() {
        let (registry, _dir) = registry_with(Arc::new(DisabledApprovalGate), sh_settings()).await;
        let result = call(&registry, "alice", "run_node", json!({ "relativePath": "nope.sh" })).await;
        assert_eq!(result.error_kind, Some(ToolErrorKind::Io));
    }

    #[tokio::test]
    async fn test_missing_runner_is_process_error() {
        let settings = ToolSettings {
            script_runner: "definitely-not-a-real-runtime".to_string(),
            ..ToolSettings::default()
        };
        let (registry, _dir) = registry_with(Arc::new(DisabledApprovalGate), settings).await;
        write(&registry, "alice", "app.js", "console.log(1)").await;

        let result = call(&registry, "alice", "run_node", json!({ "relativePath": "app.js" })).await;
        assert_eq!(result.error_kind, Some(ToolErrorKind::Process));
    }
}
