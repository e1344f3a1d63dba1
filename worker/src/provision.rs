use crate::worklog::WorkerLog;
use crate::proc;
use async_trait::async_trait;
use buildfarm_common::config::GroupConfig;
use buildfarm_common::errors::*;
use regex::Regex;
use std::ffi::OsString;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time;

/// Creates and destroys remote build machines for a group
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Invoke the spawn procedure once and return everything it printed
    async fn spawn(&self, group: &GroupConfig) -> Result<String>;

    async fn terminate(&self, group: &GroupConfig, addr: &str) -> Result<()>;
}

pub struct PlaybookProvisioner {
    ansible_playbook: PathBuf,
}

impl PlaybookProvisioner {
    pub fn new(ansible_playbook: PathBuf) -> PlaybookProvisioner {
        PlaybookProvisioner { ansible_playbook }
    }
}

#[async_trait]
impl Provisioner for PlaybookProvisioner {
    async fn spawn(&self, group: &GroupConfig) -> Result<String> {
        let args: [OsString; 3] = [
            "-c".into(),
            "ssh".into(),
            group.spawn_playbook.clone().into_os_string(),
        ];
        let output = proc::run(&self.ansible_playbook, &args, proc::Options::default()).await?;
        if !output.success {
            bail!("Spawn playbook {:?} failed: {}", group.spawn_playbook, output.text().trim());
        }
        Ok(output.text().into_owned())
    }

    async fn terminate(&self, group: &GroupConfig, addr: &str) -> Result<()> {
        let args: [OsString; 5] = [
            "-c".into(),
            "ssh".into(),
            "-i".into(),
            format!("{},", addr).into(),
            group.terminate_playbook.clone().into_os_string(),
        ];
        let output = proc::run(&self.ansible_playbook, &args, proc::Options::default()).await?;
        if !output.success {
            bail!("Terminate playbook {:?} failed for {}: {}", group.terminate_playbook, addr, output.text().trim());
        }
        Ok(())
    }
}

/// Finds the `IP=<addr>` token in provisioning output, only valid ip addresses are accepted
pub fn parse_addr(output: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#"IP=([^{}"\s]+)"#).ok()).as_ref()?;
    let token = re.captures(output)?.get(1)?.as_str();
    let addr = token.parse::<IpAddr>().ok()?;
    Some(addr.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    /// Every attempt failed to run the spawn procedure
    #[error("Failed to spawn builder after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: String },
    /// The procedure ran but didn't hand out a usable address
    #[error("No valid IP address in provisioning output: {:?}", .0.trim())]
    NoAddress(String),
}

/// Run the spawn procedure until it succeeds, at most `attempts` times with `delay` in between
pub async fn provision(
    provisioner: &dyn Provisioner,
    group: &GroupConfig,
    attempts: usize,
    delay: Duration,
    log: &WorkerLog,
) -> std::result::Result<String, ProvisionError> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        log.log(format!("spawning instance begin (attempt {}/{})", attempt, attempts)).await;
        match provisioner.spawn(group).await {
            Ok(output) => {
                let addr = parse_addr(&output)
                    .ok_or(ProvisionError::NoAddress(output))?;
                log.log(format!("spawning instance end, got ip {}", addr)).await;
                return Ok(addr);
            }
            Err(err) if attempt < attempts => {
                log.log(format!("Failed to spawn builder, retrying in {}s: {:#}", delay.as_secs(), err)).await;
                time::sleep(delay).await;
            }
            Err(err) => {
                return Err(ProvisionError::Exhausted {
                    attempts,
                    last: format!("{:#}", err),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProvisioner {
        outputs: Mutex<VecDeque<Result<String>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedProvisioner {
        fn new(outputs: Vec<Result<String>>) -> ScriptedProvisioner {
            ScriptedProvisioner {
                outputs: Mutex::new(outputs.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Provisioner for ScriptedProvisioner {
        async fn spawn(&self, _group: &GroupConfig) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            self.outputs.lock().unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("no more outputs")))
        }

        async fn terminate(&self, _group: &GroupConfig, _addr: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_addr() {
        assert_eq!(parse_addr("TASK [debug]\nok: {\"msg\": \"IP=10.0.0.5\"}\n"), Some("10.0.0.5".to_string()));
        assert_eq!(parse_addr("IP=2001:db8::1 "), Some("2001:db8::1".to_string()));
        assert_eq!(parse_addr("IP=not-an-ip"), None);
        assert_eq!(parse_addr("PLAY RECAP"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_twice_then_succeed() {
        let provisioner = ScriptedProvisioner::new(vec![
            Err(anyhow!("ssh: connection refused")),
            Err(anyhow!("ssh: connection refused")),
            Ok("\"msg\": \"IP=192.168.1.10\"".to_string()),
        ]);
        let group = GroupConfig::default_group().unwrap();

        let start = time::Instant::now();
        let addr = provision(&provisioner, &group, 4, Duration::from_secs(10), &WorkerLog::disabled())
            .await
            .unwrap();
        assert_eq!(addr, "192.168.1.10");
        assert_eq!(provisioner.calls(), 3);
        // exactly two backoff sleeps
        assert_eq!(start.elapsed().as_secs(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let provisioner = ScriptedProvisioner::new(vec![]);
        let group = GroupConfig::default_group().unwrap();
        let err = provision(&provisioner, &group, 4, Duration::from_secs(10), &WorkerLog::disabled())
            .await
            .unwrap_err();
        assert_eq!(provisioner.calls(), 4);
        assert!(matches!(err, ProvisionError::Exhausted { attempts: 4, .. }));
        assert_eq!(err.to_string(), "Failed to spawn builder after 4 attempts: no more outputs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_address_is_not_retried() {
        let provisioner = ScriptedProvisioner::new(vec![
            Ok("IP=999.1.1.1\n".to_string()),
        ]);
        let group = GroupConfig::default_group().unwrap();
        let err = provision(&provisioner, &group, 4, Duration::from_secs(10), &WorkerLog::disabled())
            .await
            .unwrap_err();
        assert_eq!(provisioner.calls(), 1);
        assert!(matches!(err, ProvisionError::NoAddress(_)));
        assert_eq!(err.to_string(), r#"No valid IP address in provisioning output: "IP=999.1.1.1""#);
    }
}
