//! Collector registry
//!
//! The fixed, ordered list of collectors this daemon runs, built once at
//! startup from config. Disabled collectors are left out entirely.

use crate::sources::apps::{self, AppLifecycle};
use crate::sources::filesystem::{self, FileWatcher};
use crate::sources::shell::{self, ZshHistory};
use anyhow::{Context, Result};
use snoopy_core::{Collector, Config, EventDrivenCollector, PolledCollector};
use std::path::Path;
use std::time::Duration;

/// Every collector this binary knows, in registry order.
pub const KNOWN: &[&str] = &[shell::NAME, apps::NAME, filesystem::NAME];

/// Build the registry for `config`. `home` anchors adapter default paths.
pub fn build(config: &Config, home: &Path) -> Result<Vec<Collector>> {
    for name in config.collectors.keys() {
        if !KNOWN.contains(&name.as_str()) {
            tracing::warn!(collector = %name, "Config names an unknown collector, ignoring");
        }
    }

    let mut registry = Vec::new();

    if enabled(config, shell::NAME) {
        let source = match config.collector(shell::NAME).paths.first() {
            Some(path) => ZshHistory::new(path.clone()),
            None => ZshHistory::from_env(home),
        };
        tracing::debug!(collector = shell::NAME, path = %source.path().display(), "Registered");
        let collector = PolledCollector::new(
            shell::NAME,
            Box::new(source),
            Duration::from_secs_f64(shell::INTERVAL_SECS),
        )
        .configure(config, &[], &[])
        .context("invalid shell collector settings")?;
        registry.push(collector.into());
    }

    if enabled(config, apps::NAME) {
        let collector = PolledCollector::new(
            apps::NAME,
            Box::new(AppLifecycle::from_ps()),
            Duration::from_secs_f64(apps::INTERVAL_SECS),
        )
        .configure(config, apps::BUILTIN_EXCLUDED, &[])
        .context("invalid apps collector settings")?;
        registry.push(collector.into());
    }

    if enabled(config, filesystem::NAME) {
        let overrides = config.collector(filesystem::NAME);
        let roots = if overrides.paths.is_empty() {
            FileWatcher::default_roots(home)
        } else {
            overrides.paths
        };
        let source = FileWatcher::new(roots);
        tracing::debug!(collector = filesystem::NAME, roots = ?source.roots(), "Registered");

        // The daemon's own files must never feed back into the log.
        let own_dirs = [Config::data_dir(), Config::state_dir()]
            .map(|dir| dir.to_string_lossy().into_owned());
        let excluded_paths: Vec<&str> = filesystem::BUILTIN_EXCLUDED_PATHS
            .iter()
            .copied()
            .chain(own_dirs.iter().map(String::as_str))
            .collect();

        let collector = EventDrivenCollector::new(filesystem::NAME, Box::new(source))
            .configure(config, &[], &excluded_paths)
            .context("invalid filesystem collector settings")?;
        registry.push(collector.into());
    }

    tracing::info!(
        collectors = ?registry.iter().map(Collector::name).collect::<Vec<_>>(),
        "Collector registry built"
    );
    Ok(registry)
}

fn enabled(config: &Config, name: &str) -> bool {
    let on = config.collector(name).enabled;
    if !on {
        tracing::info!(collector = %name, "Collector disabled by config");
    }
    on
}
