//! The monitoring engine: owns every component and implements the command surface.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{AppConfig, ConfigError};
use crate::events::{EventPublisher, MonitorEvent};
use crate::log_writer::{LogWriteError, LogWriter};
use crate::models::{PingTarget, ProbeOutcome, RunningStatistics, SchedulerState, TargetUpdate};
use crate::probe::{Probe, ProbeExecutor};
use crate::registry::{RegistryError, TargetRegistry};
use crate::scheduler::{Scheduler, SchedulerError, Sinks};
use crate::stats::StatsAggregator;

/// Capacity of the broadcast channel feeding subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors returned to command callers.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Log(#[from] LogWriteError),
}

/// `get_statistics` result: one record or all of them.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum Statistics {
    One(RunningStatistics),
    All(HashMap<String, RunningStatistics>),
}

/// Explicit engine context, created once at process start.
pub struct Engine {
    registry: Arc<RwLock<TargetRegistry>>,
    stats: Arc<StatsAggregator>,
    log: Arc<LogWriter>,
    events: Arc<EventPublisher>,
    scheduler: Scheduler,
    config_path: Option<PathBuf>,
    max_history_size: RwLock<usize>,
}

impl Engine {
    /// Build an engine from `config`. Must be called inside a Tokio runtime.
    ///
    /// `config_path` is where `save_config` persists; `None` keeps config in memory only.
    pub fn new(
        config: AppConfig,
        transport: Arc<dyn Probe>,
        log_dir: &Path,
        config_path: Option<PathBuf>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let mut registry = TargetRegistry::new();
        registry.replace_all(config.targets.clone())?;

        let stats = Arc::new(StatsAggregator::new());
        for target in registry.list() {
            stats.track(&target);
        }

        let registry = Arc::new(RwLock::new(registry));
        let log = Arc::new(LogWriter::new(log_dir)?);
        let events = Arc::new(EventPublisher::new(EVENT_CHANNEL_CAPACITY, config.max_history_size));

        let scheduler = Scheduler::new(
            registry.clone(),
            ProbeExecutor::new(transport),
            Sinks {
                stats: stats.clone(),
                log: log.clone(),
                events: events.clone(),
            },
            Duration::from_millis(config.ping_interval_ms),
            Duration::from_millis(config.timeout_ms),
        );

        tracing::info!(
            "Engine: {} targets, interval {}ms, logging to {:?}",
            registry.read().list().len(),
            config.ping_interval_ms,
            log.log_dir()
        );

        Ok(Self {
            registry,
            stats,
            log,
            events,
            scheduler,
            config_path,
            max_history_size: RwLock::new(config.max_history_size),
        })
    }

    // --- Lifecycle ---

    pub async fn start(&self) -> Result<(), EngineError> {
        Ok(self.scheduler.start().await?)
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    pub async fn state(&self) -> SchedulerState {
        self.scheduler.state().await
    }

    /// Stop probing, let in-flight probes land, then flush and close the log.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        tracing::info!("Engine: shut down");
    }

    // --- Targets ---

    pub fn add_target(&self, address: &str, label: Option<&str>) -> Result<PingTarget, EngineError> {
        // Track before releasing the registry so no tick sees an untracked target.
        let mut registry = self.registry.write();
        let target = registry.add(address, label)?;
        self.stats.track(&target);
        drop(registry);
        tracing::info!("Engine: added target {} ({})", target.label, target.address);
        Ok(target)
    }

    pub fn remove_target(&self, id: &str) -> Result<(), EngineError> {
        let target = self.registry.write().remove(id)?;
        self.stats.discard(id);
        self.events.forget(id);
        self.scheduler.forget(id);
        tracing::info!("Engine: removed target {} ({})", target.label, target.address);
        Ok(())
    }

    pub fn update_target(&self, id: &str, fields: TargetUpdate) -> Result<PingTarget, EngineError> {
        let target = self.registry.write().update(id, fields)?;
        self.stats.relabel(&target);
        Ok(target)
    }

    pub fn toggle_target(&self, id: &str) -> Result<PingTarget, EngineError> {
        Ok(self.registry.write().toggle(id)?)
    }

    pub fn list_targets(&self) -> Vec<PingTarget> {
        self.registry.read().list()
    }

    pub fn preset_targets(&self) -> Vec<PingTarget> {
        PingTarget::presets()
    }

    // --- Settings ---

    pub fn set_interval(&self, interval_ms: u64) -> Result<(), EngineError> {
        self.scheduler.set_interval(interval_ms)?;
        tracing::info!("Engine: interval set to {}ms", interval_ms);
        Ok(())
    }

    // --- Statistics ---

    pub fn get_statistics(&self, target_id: Option<&str>) -> Result<Statistics, EngineError> {
        match target_id {
            Some(id) => self
                .stats
                .snapshot(id)
                .map(Statistics::One)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()).into()),
            None => Ok(Statistics::All(self.stats.snapshot_all())),
        }
    }

    pub fn reset_statistics(&self, target_id: Option<&str>) -> Result<(), EngineError> {
        if !self.stats.reset(target_id) {
            let id = target_id.unwrap_or_default();
            return Err(RegistryError::NotFound(id.to_string()).into());
        }
        if target_id.is_none() {
            self.events.clear();
        }
        Ok(())
    }

    pub fn recent_outcomes(&self, count: Option<usize>) -> Vec<ProbeOutcome> {
        self.events.recent(count)
    }

    // --- Events ---

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    // --- Config ---

    pub fn get_config(&self) -> AppConfig {
        AppConfig {
            targets: self.list_targets(),
            ping_interval_ms: self.scheduler.interval().as_millis() as u64,
            timeout_ms: self.scheduler.timeout().as_millis() as u64,
            max_history_size: *self.max_history_size.read(),
        }
    }

    /// Validate, persist, then apply `config`.
    ///
    /// Nothing in memory changes unless the whole document is valid and was
    /// written successfully.
    pub fn save_config(&self, config: AppConfig) -> Result<AppConfig, EngineError> {
        config.validate()?;

        let mut staged = TargetRegistry::new();
        staged.replace_all(config.targets.clone())?;
        let config = AppConfig {
            targets: staged.list(),
            ..config
        };

        if let Some(path) = &self.config_path {
            config.save(path)?;
        }

        {
            let mut registry = self.registry.write();
            let kept: Vec<String> = config.targets.iter().map(|t| t.id.clone()).collect();
            for old in registry.list() {
                if !kept.contains(&old.id) {
                    self.stats.discard(&old.id);
                    self.events.forget(&old.id);
                    self.scheduler.forget(&old.id);
                }
            }
            registry.replace_all(config.targets.clone())?;
            for target in &config.targets {
                self.stats.track(target);
                self.stats.relabel(target);
            }
        }

        self.scheduler.set_interval(config.ping_interval_ms)?;
        self.scheduler.set_timeout(Duration::from_millis(config.timeout_ms));
        self.events.set_history_size(config.max_history_size);
        *self.max_history_size.write() = config.max_history_size;

        tracing::info!("Engine: configuration saved ({} targets)", config.targets.len());
        Ok(config)
    }

    pub fn log_path(&self) -> &Path {
        self.log.log_dir()
    }
}
