//! Script supervisor
//!
//! Startup order: check the script exists, bind the gateway, find an
//! interpreter, launch `<interpreter> <script> <port> [args...]`. Any failure
//! after the bind releases the port before returning. Shutdown stops the
//! process first and only then releases the gateway.

pub mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::gateway::{bind_with_retry, BoundGateway, Gateway};
use crate::host::HostLog;

pub use process::{
    default_lookup_commands, locate_interpreter, ExitOutcome, LookupCommand, ScriptProcess,
};

/// Owns the running script and the gateway binding it talks to
pub struct Supervisor {
    process: ScriptProcess,
    gateway: BoundGateway,
    script: PathBuf,
    grace: Duration,
}

impl Supervisor {
    /// Start with the platform's default interpreter lookup
    pub async fn start(
        config: &BridgeConfig,
        gateway: &dyn Gateway,
        log: Arc<dyn HostLog>,
    ) -> Result<Self, BridgeError> {
        Self::start_with_lookup(config, gateway, log, &default_lookup_commands()).await
    }

    pub async fn start_with_lookup(
        config: &BridgeConfig,
        gateway: &dyn Gateway,
        log: Arc<dyn HostLog>,
        lookup: &[LookupCommand],
    ) -> Result<Self, BridgeError> {
        let configured = config
            .script
            .path
            .as_ref()
            .ok_or_else(|| BridgeError::Config("script.path is not set".to_string()))?;

        let script = match tokio::fs::canonicalize(configured).await {
            Ok(path) if path.is_file() => path,
            _ => return Err(BridgeError::ScriptNotFound(configured.clone())),
        };

        let bound = bind_with_retry(
            gateway,
            config.gateway.strategy(),
            config.gateway.bind_attempts,
        )
        .await?;

        let interpreter = match &config.script.interpreter {
            Some(path) => path.clone(),
            None => match locate_interpreter(lookup).await {
                Ok(path) => path,
                Err(e) => {
                    bound.shutdown().await;
                    return Err(e);
                }
            },
        };

        let mut args = vec![bound.port().to_string()];
        args.extend(config.script.args.iter().cloned());

        let process = match ScriptProcess::spawn(&interpreter, &script, &args, log) {
            Ok(process) => process,
            Err(e) => {
                bound.shutdown().await;
                return Err(e);
            }
        };

        info!(
            script = %script.display(),
            port = bound.port(),
            pid = process.pid(),
            "Script supervised"
        );

        Ok(Self {
            process,
            gateway: bound,
            script,
            grace: config.process.shutdown_grace(),
        })
    }

    /// Port the script was told to connect to
    pub fn port(&self) -> u16 {
        self.gateway.port()
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// True once the script has exited on its own
    pub fn has_exited(&mut self) -> bool {
        matches!(self.process.try_status(), Ok(Some(_)))
    }

    /// Stop the script, then release the gateway
    pub async fn shutdown(self) -> Option<ExitOutcome> {
        let outcome = match self.process.stop(self.grace).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Failed to stop script: {}", e);
                None
            }
        };
        self.gateway.shutdown().await;
        outcome
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::gateway::GatewayBinding;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Gateway and log sharing one event timeline
    #[derive(Default)]
    struct Timeline {
        events: Mutex<Vec<String>>,
    }

    impl Timeline {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn position(&self, event: &str) -> Option<usize> {
            self.events.lock().iter().position(|e| e == event)
        }
    }

    impl HostLog for Timeline {
        fn println(&self, message: &str) {
            self.events.lock().push(format!("out: {}", message));
        }

        fn errorln(&self, message: &str) {
            self.events.lock().push(format!("err: {}", message));
        }
    }

    struct FakeBinding {
        port: u16,
        timeline: Arc<Timeline>,
    }

    #[async_trait]
    impl GatewayBinding for FakeBinding {
        fn port(&self) -> u16 {
            self.port
        }

        async fn shutdown(self: Box<Self>) {
            self.timeline.events.lock().push(format!("released {}", self.port));
        }
    }

    struct FakeGateway {
        timeline: Arc<Timeline>,
        refuse_all: bool,
    }

    #[async_trait]
    impl Gateway for FakeGateway {
        async fn bind(&self, port: u16) -> anyhow::Result<Box<dyn GatewayBinding>> {
            if self.refuse_all {
                anyhow::bail!("address in use");
            }
            self.timeline.events.lock().push(format!("bound {}", port));
            Ok(Box::new(FakeBinding {
                port,
                timeline: self.timeline.clone(),
            }))
        }
    }

    fn setup(refuse_all: bool) -> (Arc<Timeline>, FakeGateway) {
        let timeline = Arc::new(Timeline::default());
        let gateway = FakeGateway {
            timeline: timeline.clone(),
            refuse_all,
        };
        (timeline, gateway)
    }

    fn config_for(script: &Path) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.script.path = Some(script.to_path_buf());
        config.script.interpreter = Some(PathBuf::from("/bin/sh"));
        config.gateway.bind_attempts = 3;
        config
    }

    async fn wait_for(timeline: &Timeline, event: &str) {
        for _ in 0..200 {
            if timeline.position(event).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never saw {:?} in {:?}", event, timeline.events());
    }

    #[tokio::test]
    async fn test_missing_script_path_is_a_config_error() {
        let (timeline, gateway) = setup(false);
        let result = Supervisor::start(&BridgeConfig::default(), &gateway, timeline.clone()).await;
        assert!(matches!(result, Err(BridgeError::Config(_))));
        assert!(timeline.events().is_empty());
    }

    #[tokio::test]
    async fn test_nonexistent_script_aborts_before_binding() {
        let (timeline, gateway) = setup(false);
        let config = config_for(Path::new("/nonexistent/controller.py"));

        let result = Supervisor::start(&config, &gateway, timeline.clone()).await;
        match result {
            Err(e @ BridgeError::ScriptNotFound(_)) => assert!(e.is_fatal()),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("supervisor started without a script"),
        }
        assert!(timeline.events().is_empty());
    }

    #[tokio::test]
    async fn test_bind_exhaustion_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("controller.sh");
        std::fs::write(&script, "true\n").unwrap();

        let (timeline, gateway) = setup(true);
        let result = Supervisor::start(&config_for(&script), &gateway, timeline).await;
        assert!(matches!(
            result,
            Err(BridgeError::BindExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_interpreter_releases_the_port() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("controller.sh");
        std::fs::write(&script, "true\n").unwrap();

        let (timeline, gateway) = setup(false);
        let mut config = config_for(&script);
        config.script.interpreter = None;
        let lookup = vec![LookupCommand::new("sh", &["-c", "exit 1"])];

        let result =
            Supervisor::start_with_lookup(&config, &gateway, timeline.clone(), &lookup).await;
        assert!(matches!(
            result,
            Err(BridgeError::InterpreterNotFound { .. })
        ));
        assert_eq!(timeline.events(), vec!["bound 25333", "released 25333"]);
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_the_port() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("controller.sh");
        std::fs::write(&script, "true\n").unwrap();

        let (timeline, gateway) = setup(false);
        let mut config = config_for(&script);
        config.script.interpreter = Some(PathBuf::from("/nonexistent/python3"));

        let result = Supervisor::start(&config, &gateway, timeline.clone()).await;
        assert!(matches!(result, Err(BridgeError::Spawn(_))));
        assert_eq!(timeline.events(), vec!["bound 25333", "released 25333"]);
    }

    #[tokio::test]
    async fn test_script_gets_port_and_stops_before_release() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("controller.sh");
        std::fs::write(
            &script,
            "trap 'echo stopping; exit 0' TERM\necho \"port=$1 mode=$2\"\nwhile true; do sleep 0.05; done\n",
        )
        .unwrap();

        let (timeline, gateway) = setup(false);
        let mut config = config_for(&script);
        config.script.args = vec!["live".to_string()];

        let mut supervisor = Supervisor::start(&config, &gateway, timeline.clone())
            .await
            .unwrap();
        assert_eq!(supervisor.port(), 25333);
        assert!(supervisor.script().is_absolute());

        wait_for(&timeline, "out: port=25333 mode=live").await;
        assert!(!supervisor.has_exited());

        let outcome = supervisor.shutdown().await;
        assert!(matches!(outcome, Some(ExitOutcome::Exited(status)) if status.success()));

        let stopping = timeline.position("out: stopping").unwrap();
        let released = timeline.position("released 25333").unwrap();
        assert!(stopping < released);
    }
}
