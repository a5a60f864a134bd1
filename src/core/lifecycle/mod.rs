use anyhow::{Result, anyhow};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};

#[derive(Debug, PartialEq)]
pub enum LifecycleState {
    Init,
    Starting,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Lets a background task stop the whole process with an error.
#[derive(Clone)]
pub struct FatalSender(mpsc::UnboundedSender<anyhow::Error>);

impl FatalSender {
    pub fn report(&self, err: anyhow::Error) {
        error!("Fatal component error: {:#}", err);
        let _ = self.0.send(err);
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    fatal_tx: mpsc::UnboundedSender<anyhow::Error>,
    fatal_rx: mpsc::UnboundedReceiver<anyhow::Error>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            fatal_tx,
            fatal_rx,
        }
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    pub fn fatal_sender(&self) -> FatalSender {
        FatalSender(self.fatal_tx.clone())
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Starting");
        self.state = LifecycleState::Starting;
        // Attach order is start order: consumers come up before the API accepts requests
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        info!("Lifecycle Phase: Ready");
        self.state = LifecycleState::Ready;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in self.components.iter().rev() {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }

    /// Start every component, then run until Ctrl+C or a fatal report.
    pub async fn run_until_signal(&mut self) -> Result<()> {
        if let Err(e) = self.start().await {
            self.shutdown().await?;
            return Err(e);
        }

        let outcome = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                signal.map_err(|e| anyhow!("failed to listen for Ctrl+C: {e}"))
            }
            Some(err) = self.fatal_rx.recv() => Err(err),
        };

        self.shutdown().await?;
        outcome
    }

    /// Like [`Self::run_until_signal`] but stops when `stop` resolves instead of Ctrl+C.
    #[cfg(test)]
    pub async fn run_until<F: std::future::Future<Output = ()>>(&mut self, stop: F) -> Result<()> {
        if let Err(e) = self.start().await {
            self.shutdown().await?;
            return Err(e);
        }
        let outcome = tokio::select! {
            _ = stop => Ok(()),
            Some(err) = self.fatal_rx.recv() => Err(err),
        };
        self.shutdown().await?;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        name: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
        fail_start: bool,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        async fn on_init(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("init {}", self.name));
            Ok(())
        }
        async fn on_start(&mut self) -> Result<()> {
            if self.fail_start {
                return Err(anyhow!("{} cannot start", self.name));
            }
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }
        async fn on_shutdown(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            Ok(())
        }
    }

    fn recorder(
        name: &'static str,
        log: &Arc<StdMutex<Vec<String>>>,
        fail_start: bool,
    ) -> Arc<Mutex<dyn LifecycleComponent + Send + Sync>> {
        Arc::new(Mutex::new(Recorder {
            name,
            log: Arc::clone(log),
            fail_start,
        }))
    }

    #[tokio::test]
    async fn starts_in_order_and_stops_in_reverse() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        manager.attach(recorder("consumer", &log, false));
        manager.attach(recorder("api", &log, false));

        manager.run_until(async {}).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "init consumer",
                "init api",
                "start consumer",
                "start api",
                "stop api",
                "stop consumer"
            ]
        );
        assert_eq!(manager.state(), &LifecycleState::Shutdown);
    }

    #[tokio::test]
    async fn fatal_report_stops_the_process_with_that_error() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        manager.attach(recorder("worker", &log, false));
        manager.fatal_sender().report(anyhow!("broker gone"));

        let err = manager
            .run_until(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "broker gone");
        assert!(log.lock().unwrap().contains(&"stop worker".to_string()));
    }

    #[tokio::test]
    async fn failed_start_still_shuts_down() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        manager.attach(recorder("worker", &log, true));

        let err = manager.run_until(async {}).await.unwrap_err();
        assert!(err.to_string().contains("cannot start"));
        assert_eq!(manager.state(), &LifecycleState::Shutdown);
    }
}
