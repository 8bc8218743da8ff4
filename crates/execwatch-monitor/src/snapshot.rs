use execwatch_stream::resync::{decode_envelope, ExecutionSnapshot, FetchError, Resync};
use futures_util::future::BoxFuture;
use std::path::PathBuf;

/// Resync source backed by a JSON file holding `{success, data: [..]}`.
/// The file is re-read on every request.
#[derive(Debug, Clone)]
pub struct FileResync {
    path: PathBuf,
}

impl FileResync {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Resync for FileResync {
    fn active_executions(&self) -> BoxFuture<'static, Result<Vec<ExecutionSnapshot>, FetchError>> {
        let path = self.path.clone();
        Box::pin(async move {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| FetchError::Request(format!("{}: {err}", path.display())))?;
            decode_envelope(&text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_snapshots_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("active.json");
        std::fs::write(
            &path,
            r#"{"success": true, "data": [{"id": "exec-7", "tool": "codex", "status": "completed"}]}"#,
        )
        .expect("write snapshot");

        let snapshots = FileResync::new(path)
            .active_executions()
            .await
            .expect("snapshots");
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, "exec-7");
        assert!(snapshots[0].status.is_terminal());
    }

    #[tokio::test]
    async fn missing_file_is_a_request_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = FileResync::new(dir.path().join("absent.json"))
            .active_executions()
            .await;
        assert!(matches!(result, Err(FetchError::Request(_))));
    }
}
