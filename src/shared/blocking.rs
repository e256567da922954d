use std::time::Duration;

use tokio::task;
use tokio::time::timeout;

use crate::errors::{CoreError, CoreResult};

/// Runs synchronous libgit2/filesystem work on the blocking pool with an
/// upper bound. A timeout leaves the worker running to completion but the
/// caller gets a typed error immediately.
pub async fn run_blocking<T, F>(label: &str, limit: Duration, work: F) -> CoreResult<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(limit, task::spawn_blocking(work)).await {
        Ok(Ok(result)) => result.map_err(CoreError::from),
        Ok(Err(join_err)) => Err(CoreError::Internal {
            message: format!("{label} task panicked: {join_err}"),
        }),
        Err(_) => {
            log::warn!("{label} timed out after {limit:?}");
            Err(CoreError::timeout(label, limit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_value() {
        let value = run_blocking("sum", Duration::from_secs(1), || Ok(2 + 2))
            .await
            .unwrap();
        assert_eq!(value, 4);
    }

    #[tokio::test]
    async fn maps_errors_to_internal() {
        let err = run_blocking::<(), _>("fail", Duration::from_secs(1), || {
            Err(anyhow::anyhow!("boom"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Internal { .. }));
    }

    #[tokio::test]
    async fn times_out_with_step_label() {
        let err = run_blocking("slow step", Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err, CoreError::timeout("slow step", Duration::from_millis(20)));
    }
}
