//! Human approval tool.

use serde_json::json;

use super::{ExecutionContext, Payload, RequestApprovalParams, ToolError, ToolKind, ToolOutcome, ToolRegistry};
use crate::approval::ApprovalRequest;

pub(super) async fn request_approval(
    registry: &ToolRegistry,
    ctx: &ExecutionContext,
    params: RequestApprovalParams,
) -> ToolOutcome {
    if params.title.trim().is_empty() {
        return Err(ToolError::invalid(ToolKind::RequestApproval, "title is empty"));
    }
    if params.description.trim().is_empty() {
        return Err(ToolError::invalid(ToolKind::RequestApproval, "description is empty"));
    }

    let request = ApprovalRequest::for_user(
        &ctx.user_id,
        params.title,
        params.description,
        params.code_snippet,
        params.metadata,
    );
    let receipt = registry.approvals.submit(&request).await?;

    let mut payload = Payload::new();
    payload.insert("requestId".into(), json!(receipt.request_id));
    payload.insert(
        "message".into(),
        json!("Approval request submitted. A reviewer will approve or reject it in the approval app."),
    );
    Ok(payload)
}
