use std::time::Duration;

use ctxsync_common::{
    redact::DEFAULT_MAX_SCAN_BYTES,
    token::Token,
    types::{ChangeBatch, ChangeRecord},
};
use ctxsync_server::{
    cache::{TokenKind, TokenStore},
    context::WorkspaceContextStore,
    hierarchy::{SessionHierarchyManager, TokenState, WorkspaceOrigin, WorkspaceRecord},
    persistence::{DurableStore, WorkspaceSnapshot},
};

fn manager() -> SessionHierarchyManager {
    SessionHierarchyManager::new(TokenStore::in_memory(), DurableStore::memory())
}

async fn active_credential(manager: &SessionHierarchyManager) -> Token {
    let credential = Token::generate();
    manager.activate_credential(&credential, "user-7").await.expect("credential should activate");
    credential
}

async fn state(manager: &SessionHierarchyManager, kind: TokenKind, token: &Token) -> TokenState {
    manager.state(kind, token).await.expect("state lookup should succeed")
}

async fn flushed(
    manager: &SessionHierarchyManager,
    workspace: &Token,
) -> Option<WorkspaceSnapshot> {
    manager.durable().get_workspace(workspace).await.expect("durable read should succeed")
}

#[tokio::test]
async fn workspace_shared_by_two_sessions_flushes_after_the_last_one() {
    let manager = manager();
    let credential = active_credential(&manager).await;
    let first = manager.start_session(&credential).await.expect("first session");
    let second = manager.start_session(&credential).await.expect("second session");
    let workspace = Token::generate();

    manager.activate_workspace(&workspace, &first).await.expect("first activation");
    let activation =
        manager.activate_workspace(&workspace, &second).await.expect("second activation");
    assert_eq!(activation.origin, WorkspaceOrigin::Cache);
    assert_eq!(activation.session_count, 2);

    manager.delete_session(&first).await.expect("delete first session");
    assert_eq!(state(&manager, TokenKind::Workspace, &workspace).await, TokenState::Active);
    assert!(flushed(&manager, &workspace).await.is_none());

    manager.delete_session(&second).await.expect("delete second session");
    assert_eq!(state(&manager, TokenKind::Workspace, &workspace).await, TokenState::Absent);
    assert!(flushed(&manager, &workspace).await.is_some());

    manager.delete_workspace(&workspace).await.expect("re-delete is a no-op");
}

#[tokio::test(start_paused = true)]
async fn expired_session_does_not_pin_a_shared_workspace() {
    let manager = manager();
    let context = WorkspaceContextStore::with_pattern_redactor(
        manager.tokens().clone(),
        DEFAULT_MAX_SCAN_BYTES,
    );
    let credential = active_credential(&manager).await;
    let idle = manager.start_session(&credential).await.expect("idle session");
    let busy = manager.start_session(&credential).await.expect("busy session");
    let workspace = Token::generate();
    manager.activate_workspace(&workspace, &idle).await.expect("idle activation");
    manager.activate_workspace(&workspace, &busy).await.expect("busy activation");

    tokio::time::advance(Duration::from_secs(40 * 60)).await;
    {
        let _guard = manager.locks().acquire(&workspace).await;
        let edit = ChangeBatch::from([(
            "notes.md".to_owned(),
            vec![ChangeRecord::insert(0, vec!["# Notes".to_owned()])],
        )]);
        context.apply_update(&workspace, edit).await.expect("edit");
    }
    assert!(manager.session_has_workspace(&busy, &workspace).await.expect("touch busy"));

    tokio::time::advance(Duration::from_secs(30 * 60)).await;
    assert_eq!(state(&manager, TokenKind::Session, &idle).await, TokenState::Absent);

    manager.delete_session(&busy).await.expect("delete busy session");
    assert_eq!(state(&manager, TokenKind::Workspace, &workspace).await, TokenState::Absent);
    let snapshot = flushed(&manager, &workspace).await.expect("workspace was flushed");
    assert_eq!(snapshot.files["notes.md"], vec!["# Notes".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn credential_delete_reaches_workspaces_of_expired_sessions() {
    let manager = manager();
    let credential = active_credential(&manager).await;
    let session = manager.start_session(&credential).await.expect("session");
    let workspace = Token::generate();
    manager.activate_workspace(&workspace, &session).await.expect("activate");

    tokio::time::advance(Duration::from_secs(61 * 60)).await;
    assert_eq!(state(&manager, TokenKind::Session, &session).await, TokenState::Absent);
    assert_eq!(state(&manager, TokenKind::Workspace, &workspace).await, TokenState::Active);

    manager.delete_credential(&credential).await.expect("delete credential");
    assert_eq!(state(&manager, TokenKind::Workspace, &workspace).await, TokenState::Absent);
    assert!(flushed(&manager, &workspace).await.is_some());
}

#[tokio::test]
async fn credential_delete_cascades_to_every_open_session() {
    let manager = manager();
    let credential = active_credential(&manager).await;
    let first = manager.start_session(&credential).await.expect("first session");
    let second = manager.start_session(&credential).await.expect("second session");

    let exclusive = Token::generate();
    let shared = Token::generate();
    manager.activate_workspace(&exclusive, &first).await.expect("activate exclusive");
    manager.activate_workspace(&shared, &second).await.expect("activate shared");

    let other_credential = active_credential(&manager).await;
    let outsider = manager.start_session(&other_credential).await.expect("outsider session");
    manager.activate_workspace(&shared, &outsider).await.expect("outsider joins shared");

    manager.delete_credential(&credential).await.expect("delete credential");

    for (kind, token) in [
        (TokenKind::Credential, &credential),
        (TokenKind::Session, &first),
        (TokenKind::Session, &second),
        (TokenKind::Workspace, &exclusive),
    ] {
        assert_eq!(state(&manager, kind, token).await, TokenState::Absent, "{kind} {token}");
    }

    assert_eq!(state(&manager, TokenKind::Session, &outsider).await, TokenState::Active);
    let shared_record: WorkspaceRecord = manager
        .tokens()
        .peek(TokenKind::Workspace, &shared)
        .await
        .expect("peek shared")
        .expect("shared workspace survives");
    assert_eq!(shared_record.session_tokens.into_iter().collect::<Vec<_>>(), vec![outsider]);

    for session in [&first, &second] {
        let row = manager
            .durable()
            .session_record(session)
            .await
            .expect("read session row")
            .expect("creation record exists");
        assert!(row.ended_at.is_some(), "session end must be recorded");
    }
}

#[tokio::test]
async fn flushed_workspace_is_restored_on_next_activation() {
    let manager = manager();
    let credential = active_credential(&manager).await;
    let session = manager.start_session(&credential).await.expect("session");
    let workspace = Token::generate();

    manager.activate_workspace(&workspace, &session).await.expect("activate");
    let mut record: WorkspaceRecord = manager
        .tokens()
        .peek(TokenKind::Workspace, &workspace)
        .await
        .expect("peek")
        .expect("workspace present");
    record.files.insert("notes.md".into(), vec!["# Notes".into()]);
    manager
        .tokens()
        .set(TokenKind::Workspace, &workspace, &record, false)
        .await
        .expect("write buffers");

    manager.delete_session(&session).await.expect("delete session");
    assert_eq!(state(&manager, TokenKind::Workspace, &workspace).await, TokenState::Absent);

    let next = manager.start_session(&credential).await.expect("next session");
    let activation = manager.activate_workspace(&workspace, &next).await.expect("reactivate");
    assert_eq!(activation.origin, WorkspaceOrigin::Durable);
    assert_eq!(activation.file_count, 1);
}

#[tokio::test]
async fn session_outlives_cache_eviction_through_hydration() {
    let manager = manager();
    let credential = active_credential(&manager).await;
    let session = manager.start_session(&credential).await.expect("session");
    let workspace = Token::generate();
    manager.activate_workspace(&workspace, &session).await.expect("activate");

    manager.tokens().evict(TokenKind::Session, &session).await.expect("evict session entry");

    let activation = manager.activate_workspace(&workspace, &session).await.expect("reactivate");
    assert_eq!(activation.session_count, 1);
    assert!(manager.session_has_workspace(&session, &workspace).await.expect("link check"));
}
