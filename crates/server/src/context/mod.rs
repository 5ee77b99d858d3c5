// Workspace context: per-file line buffers kept in sync with client edits.
//
// Buffers live inside the workspace's cache entry. Every stored line has been
// through the redactor.

mod locks;

pub use locks::WorkspaceLocks;

use std::{collections::BTreeMap, sync::Arc};

use ctxsync_common::{
    diff::patch::{apply_line_changes_with, required_len, sort_descending},
    redact::{redact_lines, PatternRedactor, SecretRedactor},
    token::Token,
    types::{ChangeBatch, ChangeRecord, FileBuffers},
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{TokenKind, TokenStore};
use crate::error::EngineError;
use crate::hierarchy::WorkspaceRecord;

/// Largest buffer materialized for a file the workspace has not seen yet.
pub const MAX_MATERIALIZED_LINES: usize = 100_000;

/// Result of one [`WorkspaceContextStore::apply_update`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    /// Post-update buffers of every file that was accepted and still has lines.
    pub files: FileBuffers,
    /// Files whose buffer became empty and was removed.
    pub pruned: Vec<String>,
    /// Files left untouched, with the reason.
    pub rejected: BTreeMap<String, String>,
}

struct PatchedFile {
    lines: Vec<String>,
    applied: Vec<ChangeRecord>,
}

#[derive(Clone)]
pub struct WorkspaceContextStore {
    tokens: TokenStore,
    redactor: Arc<dyn SecretRedactor>,
}

impl std::fmt::Debug for WorkspaceContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceContextStore")
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

impl WorkspaceContextStore {
    pub fn new(tokens: TokenStore, redactor: Arc<dyn SecretRedactor>) -> Self {
        Self { tokens, redactor }
    }

    pub fn with_pattern_redactor(tokens: TokenStore, max_scan_bytes: usize) -> Self {
        Self::new(tokens, Arc::new(PatternRedactor::new(max_scan_bytes)))
    }

    /// Applies one batch of per-file changes to an active workspace.
    ///
    /// The caller must hold the workspace's lock from the
    /// [`WorkspaceLocks`] shared with the hierarchy manager. Files with an
    /// empty change list are skipped. A file that fails validation, patching
    /// or redaction is reported in [`UpdateOutcome::rejected`] and left as it
    /// was; the rest of the batch still applies.
    pub async fn apply_update(
        &self,
        workspace: &Token,
        batch: ChangeBatch,
    ) -> Result<UpdateOutcome, EngineError> {
        let mut record = self.load(workspace).await?;
        let mut outcome = UpdateOutcome::default();

        for (file, changes) in batch {
            if changes.is_empty() {
                continue;
            }
            let patched = match self.patch_file(&file, record.files.get(&file), changes) {
                Ok(patched) => patched,
                Err(err) => {
                    warn!(
                        workspace = %workspace,
                        file = %file,
                        error = %err,
                        "rejected file update"
                    );
                    outcome.rejected.insert(file, err.to_string());
                    continue;
                }
            };

            record.change_log.entry(file.clone()).or_default().extend(patched.applied);
            if patched.lines.is_empty() {
                debug!(workspace = %workspace, file = %file, "pruned empty file");
                record.files.remove(&file);
                outcome.pruned.push(file);
            } else {
                outcome.files.insert(file.clone(), patched.lines.clone());
                record.files.insert(file, patched.lines);
            }
        }

        self.tokens.set(TokenKind::Workspace, workspace, &record, false).await?;
        info!(
            workspace = %workspace,
            updated = outcome.files.len(),
            pruned = outcome.pruned.len(),
            rejected = outcome.rejected.len(),
            "applied workspace update"
        );
        Ok(outcome)
    }

    /// Current buffers of an active workspace.
    pub async fn workspace_context(&self, workspace: &Token) -> Result<FileBuffers, EngineError> {
        Ok(self.load(workspace).await?.files)
    }

    /// Cumulative change history of one file; empty when none was recorded.
    pub async fn change_log(
        &self,
        workspace: &Token,
        file: &str,
    ) -> Result<Vec<ChangeRecord>, EngineError> {
        let mut record = self.load(workspace).await?;
        Ok(record.change_log.remove(file).unwrap_or_default())
    }

    async fn load(&self, workspace: &Token) -> Result<WorkspaceRecord, EngineError> {
        self.tokens
            .get::<WorkspaceRecord>(TokenKind::Workspace, workspace)
            .await?
            .ok_or_else(|| EngineError::not_found(TokenKind::Workspace, workspace))
    }

    fn patch_file(
        &self,
        file: &str,
        current: Option<&Vec<String>>,
        mut changes: Vec<ChangeRecord>,
    ) -> Result<PatchedFile, EngineError> {
        for change in &changes {
            change.validate().map_err(|err| EngineError::validation(file, err))?;
        }

        let base = match current {
            Some(lines) => lines.clone(),
            None => {
                let len = required_len(&changes);
                if len > MAX_MATERIALIZED_LINES {
                    return Err(EngineError::validation(
                        file,
                        format!("new file would need {len} lines (limit {MAX_MATERIALIZED_LINES})"),
                    ));
                }
                vec![String::new(); len]
            }
        };

        sort_descending(&mut changes);
        let tagged: Vec<(Option<(usize, usize)>, String)> =
            base.into_iter().map(|text| (None, text)).collect();
        let (origins, patched): (Vec<_>, Vec<_>) =
            apply_line_changes_with(tagged, &changes, |change, line, text| {
                (Some((change, line)), text.clone())
            })
            .into_iter()
            .unzip();

        let redaction = |source| EngineError::Redaction { file: file.to_owned(), source };
        let lines = redact_lines(self.redactor.as_ref(), &patched).map_err(redaction)?;

        // Logged lines that survive into the buffer take their redacted form
        // from it; lines a later record overwrote are scanned on their own.
        let mut applied = Vec::with_capacity(changes.len());
        for mut change in changes {
            if !change.new_lines.is_empty() {
                change.new_lines =
                    redact_lines(self.redactor.as_ref(), &change.new_lines).map_err(redaction)?;
            }
            applied.push(change);
        }
        for (position, origin) in origins.into_iter().enumerate() {
            if let Some((change, line)) = origin {
                applied[change].new_lines[line] = lines[position].clone();
            }
        }

        Ok(PatchedFile { lines, applied })
    }
}

#[cfg(test)]
mod tests {
    use super::WorkspaceContextStore;
    use crate::cache::{TokenKind, TokenStore};
    use crate::error::EngineError;
    use crate::hierarchy::WorkspaceRecord;
    use ctxsync_common::{
        redact::DEFAULT_MAX_SCAN_BYTES,
        token::Token,
        types::{ChangeBatch, ChangeRecord, ChangeType},
    };

    fn lines(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    async fn store_with_workspace(max_scan_bytes: usize) -> (WorkspaceContextStore, Token) {
        let tokens = TokenStore::in_memory();
        let workspace = Token::generate();
        tokens
            .set(TokenKind::Workspace, &workspace, &WorkspaceRecord::default(), false)
            .await
            .expect("seed workspace");
        (WorkspaceContextStore::with_pattern_redactor(tokens, max_scan_bytes), workspace)
    }

    fn batch(file: &str, changes: Vec<ChangeRecord>) -> ChangeBatch {
        ChangeBatch::from([(file.to_owned(), changes)])
    }

    async fn seed(store: &WorkspaceContextStore, workspace: &Token, file: &str, values: &[&str]) {
        store
            .apply_update(workspace, batch(file, vec![ChangeRecord::insert(0, lines(values))]))
            .await
            .expect("seed file");
    }

    #[tokio::test]
    async fn unknown_workspace_is_not_found() {
        let store = WorkspaceContextStore::with_pattern_redactor(TokenStore::in_memory(), 1024);
        let error = store
            .apply_update(&Token::generate(), ChangeBatch::new())
            .await
            .expect_err("workspace must be active");
        assert!(matches!(error, EngineError::NotFound { kind: TokenKind::Workspace, .. }));
    }

    #[tokio::test]
    async fn batch_applies_against_submission_snapshot() {
        let (store, workspace) = store_with_workspace(DEFAULT_MAX_SCAN_BYTES).await;
        seed(&store, &workspace, "f.txt", &["a", "b", "c", "d"]).await;

        let outcome = store
            .apply_update(
                &workspace,
                batch(
                    "f.txt",
                    vec![
                        ChangeRecord::remove(1, 3),
                        ChangeRecord::update(0, 1, lines(&["x", "y"])),
                        ChangeRecord::remove(3, 4),
                    ],
                ),
            )
            .await
            .expect("apply");

        // Snapshot [a b c d]: drop b,c and d, replace a with x,y.
        assert_eq!(outcome.files["f.txt"], lines(&["x", "y"]));

        let log = store.change_log(&workspace, "f.txt").await.expect("log");
        let starts = log.iter().map(|change| change.start_line).collect::<Vec<_>>();
        assert_eq!(starts, vec![0, 3, 1, 0], "log keeps the seed then the applied order");
    }

    #[tokio::test]
    async fn unknown_file_is_materialized_from_empty_lines() {
        let (store, workspace) = store_with_workspace(DEFAULT_MAX_SCAN_BYTES).await;
        let changes = vec![ChangeRecord::update(2, 3, lines(&["fn main() {}"]))];
        let outcome =
            store.apply_update(&workspace, batch("new.rs", changes)).await.expect("apply");

        assert_eq!(outcome.files["new.rs"], lines(&["", "", "fn main() {}"]));
    }

    #[tokio::test]
    async fn empty_change_list_leaves_no_trace() {
        let (store, workspace) = store_with_workspace(DEFAULT_MAX_SCAN_BYTES).await;
        let outcome =
            store.apply_update(&workspace, batch("idle.rs", vec![])).await.expect("apply");

        assert!(outcome.files.is_empty());
        assert!(outcome.pruned.is_empty());
        assert!(outcome.rejected.is_empty());
        let record: WorkspaceRecord = store
            .tokens
            .peek(TokenKind::Workspace, &workspace)
            .await
            .expect("peek")
            .expect("workspace present");
        assert!(!record.change_log.contains_key("idle.rs"));
        assert!(!record.files.contains_key("idle.rs"));
    }

    #[tokio::test]
    async fn emptied_file_is_pruned_but_keeps_history() {
        let (store, workspace) = store_with_workspace(DEFAULT_MAX_SCAN_BYTES).await;
        seed(&store, &workspace, "gone.rs", &["one"]).await;

        let outcome = store
            .apply_update(&workspace, batch("gone.rs", vec![ChangeRecord::remove(0, 1)]))
            .await
            .expect("apply");

        assert_eq!(outcome.pruned, vec!["gone.rs".to_owned()]);
        let files = store.workspace_context(&workspace).await.expect("context");
        assert!(!files.contains_key("gone.rs"));
        let log = store.change_log(&workspace, "gone.rs").await.expect("log");
        assert_eq!(log.last().map(|change| change.change_type), Some(ChangeType::Remove));
    }

    #[tokio::test]
    async fn invalid_file_is_rejected_without_blocking_others() {
        let (store, workspace) = store_with_workspace(DEFAULT_MAX_SCAN_BYTES).await;
        let mut changes = batch("bad.rs", vec![ChangeRecord::remove(-1, 2)]);
        changes.insert("inverted.rs".into(), vec![ChangeRecord::update(4, 2, lines(&["z"]))]);
        changes.insert("good.rs".into(), vec![ChangeRecord::insert(0, lines(&["ok"]))]);

        let outcome = store.apply_update(&workspace, changes).await.expect("apply");

        assert_eq!(outcome.files.keys().collect::<Vec<_>>(), vec!["good.rs"]);
        assert_eq!(outcome.rejected.keys().collect::<Vec<_>>(), vec!["bad.rs", "inverted.rs"]);
        assert!(store.change_log(&workspace, "bad.rs").await.expect("log").is_empty());
    }

    #[tokio::test]
    async fn unknown_file_far_past_the_end_is_rejected() {
        let (store, workspace) = store_with_workspace(DEFAULT_MAX_SCAN_BYTES).await;
        let changes = vec![ChangeRecord::insert(i64::MAX, lines(&["x"]))];
        let outcome =
            store.apply_update(&workspace, batch("huge.txt", changes)).await.expect("apply");

        assert!(outcome.rejected.contains_key("huge.txt"));
        assert!(outcome.files.is_empty());
    }

    #[tokio::test]
    async fn stored_lines_and_history_are_redacted() {
        let (store, workspace) = store_with_workspace(DEFAULT_MAX_SCAN_BYTES).await;
        let changes = vec![ChangeRecord::insert(0, lines(&["password = hunter22", "port = 80"]))];
        let outcome =
            store.apply_update(&workspace, batch("config.env", changes)).await.expect("apply");

        let expected = lines(&["password = [REDACTED]", "port = 80"]);
        assert_eq!(outcome.files["config.env"], expected);
        let log = store.change_log(&workspace, "config.env").await.expect("log");
        assert_eq!(log[0].new_lines, expected);
    }

    #[tokio::test]
    async fn history_is_redacted_when_another_record_writes_the_key_line() {
        let (store, workspace) = store_with_workspace(DEFAULT_MAX_SCAN_BYTES).await;
        seed(&store, &workspace, "app.env", &["x", "y"]).await;

        let changes = vec![
            ChangeRecord::update(0, 1, lines(&["password ="])),
            ChangeRecord::insert(1, lines(&["hunter2secret"])),
        ];
        let outcome =
            store.apply_update(&workspace, batch("app.env", changes)).await.expect("apply");

        assert_eq!(outcome.files["app.env"], lines(&["password =", "[REDACTED]", "y"]));
        let log = store.change_log(&workspace, "app.env").await.expect("log");
        assert_eq!(log[1].change_type, ChangeType::Insert);
        assert_eq!(log[1].new_lines, lines(&["[REDACTED]"]));
        assert_eq!(log[2].new_lines, lines(&["password ="]));
        assert!(log.iter().flat_map(|change| &change.new_lines).all(|l| !l.contains("hunter2")));
    }

    #[tokio::test]
    async fn overwritten_history_lines_are_still_redacted() {
        let (store, workspace) = store_with_workspace(DEFAULT_MAX_SCAN_BYTES).await;
        seed(&store, &workspace, "keys.env", &["a", "b"]).await;

        // The insert lands first, then the update at the same start replaces it.
        let changes = vec![
            ChangeRecord::insert(1, lines(&["token = hunter22secret"])),
            ChangeRecord::update(1, 2, lines(&["plain"])),
        ];
        store.apply_update(&workspace, batch("keys.env", changes)).await.expect("apply");

        let log = store.change_log(&workspace, "keys.env").await.expect("log");
        assert!(log.iter().flat_map(|change| &change.new_lines).all(|l| !l.contains("hunter22")));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_and_left_unchanged() {
        let (store, workspace) = store_with_workspace(16).await;
        seed(&store, &workspace, "big.txt", &["short"]).await;

        let changes = vec![ChangeRecord::insert(1, lines(&["this line is far too long"]))];
        let outcome =
            store.apply_update(&workspace, batch("big.txt", changes)).await.expect("apply");

        assert!(outcome.rejected.contains_key("big.txt"));
        let files = store.workspace_context(&workspace).await.expect("context");
        assert_eq!(files["big.txt"], lines(&["short"]));
    }
}
