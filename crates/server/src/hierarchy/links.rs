// Symmetric session↔workspace adjacency updates.
//
// Both records are always mutated together so the two sides of an edge
// cannot drift apart.

use ctxsync_common::token::Token;

use super::records::{SessionRecord, WorkspaceRecord};

/// Adds the edge on both sides; returns whether either side changed.
pub fn link(
    session_token: &Token,
    session: &mut SessionRecord,
    workspace_token: &Token,
    workspace: &mut WorkspaceRecord,
) -> bool {
    let added_to_session = session.workspace_tokens.insert(workspace_token.clone());
    let added_to_workspace = workspace.session_tokens.insert(session_token.clone());
    added_to_session || added_to_workspace
}

/// Removes the edge on both sides; returns whether either side changed.
pub fn unlink(
    session_token: &Token,
    session: &mut SessionRecord,
    workspace_token: &Token,
    workspace: &mut WorkspaceRecord,
) -> bool {
    let removed_from_session = session.workspace_tokens.remove(workspace_token);
    let removed_from_workspace = workspace.session_tokens.remove(session_token);
    removed_from_session || removed_from_workspace
}

/// True when both sides agree the edge exists.
pub fn is_linked(
    session_token: &Token,
    session: &SessionRecord,
    workspace_token: &Token,
    workspace: &WorkspaceRecord,
) -> bool {
    session.workspace_tokens.contains(workspace_token)
        && workspace.session_tokens.contains(session_token)
}
