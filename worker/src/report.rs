use crate::worklog::WorkerLog;
use buildfarm_common::api::{FrontendApi, UpdateRequest};
use buildfarm_common::errors::*;
use std::time::Duration;
use tokio::time;

/// Push a status update to the control plane, retrying with a fixed delay
pub async fn post_with_retry(
    frontend: &dyn FrontendApi,
    update: &UpdateRequest,
    attempts: usize,
    delay: Duration,
    log: &WorkerLog,
) -> Result<()> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match frontend.update(update).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < attempts => {
                log.log(format!("Failed to post update to frontend (attempt {}/{}), retrying in {}s: {:#}",
                    attempt, attempts, delay.as_secs(), err)).await;
                time::sleep(delay).await;
            }
            Err(err) => {
                return Err(err.context(format!("Giving up posting update to frontend after {} attempts", attempts)));
            }
        }
    }
    bail!("No attempt was made to post the update")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use buildfarm_common::api::Waiting;
    use std::sync::Mutex;

    struct Flaky {
        failures: Mutex<usize>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl FrontendApi for Flaky {
        async fn waiting(&self) -> Result<Waiting> {
            Ok(Waiting::default())
        }

        async fn update(&self, _update: &UpdateRequest) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                bail!("502 Bad Gateway");
            }
            Ok(())
        }

        async fn auto_createrepo(&self, _owner: &str, _project: &str) -> Result<Option<bool>> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_delivered() {
        let frontend = Flaky {
            failures: Mutex::new(3),
            calls: Mutex::new(0),
        };
        let start = time::Instant::now();
        post_with_retry(&frontend, &UpdateRequest::default(), 10, Duration::from_secs(5), &WorkerLog::disabled())
            .await
            .unwrap();
        assert_eq!(*frontend.calls.lock().unwrap(), 4);
        assert_eq!(start.elapsed().as_secs(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_give_up() {
        let frontend = Flaky {
            failures: Mutex::new(100),
            calls: Mutex::new(0),
        };
        let err = post_with_retry(&frontend, &UpdateRequest::default(), 10, Duration::from_secs(5), &WorkerLog::disabled())
            .await
            .unwrap_err();
        assert_eq!(*frontend.calls.lock().unwrap(), 10);
        assert!(format!("{:#}", err).contains("502 Bad Gateway"));
    }
}
