//! Hibernate command - on, off and status for one database cluster

use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use dormant_core::ClusterRef;
use dormant_kube::{HibernationConfig, Hibernator, KubeStore};

use crate::display::{self, Operation, OutputFormat};
use crate::error::Result;

/// Configuration sources, from lowest to highest precedence
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Explicit configuration file, instead of the default location
    pub config: Option<PathBuf>,
    pub teardown_timeout: Option<Duration>,
    pub readiness_timeout: Option<Duration>,
}

impl ConfigOverrides {
    /// Load the configuration file and apply the flags on top
    pub fn resolve(&self) -> Result<HibernationConfig> {
        let mut config = match &self.config {
            Some(path) => HibernationConfig::load_from(path)?,
            None => HibernationConfig::load()?,
        };
        if let Some(timeout) = self.teardown_timeout {
            config.teardown_timeout = timeout;
        }
        if let Some(timeout) = self.readiness_timeout {
            config.readiness_timeout = timeout;
        }
        config.validate()?;
        debug!(?config, "Resolved configuration");
        Ok(config)
    }
}

async fn connect(config: HibernationConfig) -> Result<Hibernator<KubeStore>> {
    let store = KubeStore::new().await?;
    Ok(Hibernator::new(store, config))
}

fn print(
    format: OutputFormat,
    text: impl FnOnce() -> String,
    value: &impl serde::Serialize,
) -> Result<()> {
    match format.serialize(value)? {
        Some(serialized) => println!("{}", serialized.trim_end()),
        None => print!("{}", text()),
    }
    Ok(())
}

/// Run `hibernate on`
pub async fn on(
    target: &ClusterRef,
    overrides: &ConfigOverrides,
    format: OutputFormat,
) -> Result<()> {
    let hibernator = connect(overrides.resolve()?).await?;

    let bar = display::spinner(format!("Hibernating cluster {}", target));
    let result = hibernator.on(target).await;
    bar.finish_and_clear();

    let outcome = result?;
    print(
        format,
        || display::render_outcome(&outcome, Operation::On),
        &outcome,
    )
}

/// Run `hibernate off`
pub async fn off(
    target: &ClusterRef,
    overrides: &ConfigOverrides,
    format: OutputFormat,
) -> Result<()> {
    let hibernator = connect(overrides.resolve()?).await?;

    let bar = display::spinner(format!("Resuming cluster {}", target));
    let result = hibernator.off(target).await;
    bar.finish_and_clear();

    let outcome = result?;
    print(
        format,
        || display::render_outcome(&outcome, Operation::Off),
        &outcome,
    )
}

/// Run `hibernate status`
///
/// With `-o json` the report is the only thing written to stdout.
pub async fn status(
    target: &ClusterRef,
    overrides: &ConfigOverrides,
    format: OutputFormat,
) -> Result<()> {
    let hibernator = connect(overrides.resolve()?).await?;
    let report = hibernator.status(target).await?;
    print(format, || display::render_status(&report), &report)
}
