use std::path::Path;
use std::sync::Arc;

use config::{Environment, File, FileFormat};
use tracing::{info, warn};

use crate::buffer::{BufferManager, DmaAllocator};
use crate::error::Result;
use crate::pipeline::FrameGraphDriver;
use crate::{Config, ManagerSpec};

/// Load configuration from an optional TOML file plus `FRAMEGRAPH_*`
/// environment overrides
///
/// Nested keys use a double underscore, e.g.
/// `FRAMEGRAPH_PIPELINE__SIM_LATENCY_US=500`. Sections missing from both
/// sources keep their defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        info!("Loading configuration from {}", path.display());
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }
    let settings = builder
        .add_source(
            Environment::with_prefix("FRAMEGRAPH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(settings.try_deserialize()?)
}

/// Build, allocate and wire the buffer managers `specs` describe
pub fn build_managers(
    specs: &[ManagerSpec],
    allocator: Arc<dyn DmaAllocator>,
    driver: &FrameGraphDriver,
) -> Result<Vec<Arc<BufferManager>>> {
    let mut managers = Vec::with_capacity(specs.len());
    for spec in specs {
        let manager = BufferManager::with_pool(spec.name.clone(), allocator.clone());
        manager.configure(&spec.config)?;
        manager.allocate()?;
        match spec.node {
            Some(node) => driver.register_node_manager(spec.stage, spec.direction, node, manager.clone())?,
            None => driver.register_manager(spec.stage, spec.direction, manager.clone())?,
        }
        managers.push(manager);
    }
    info!(driver = driver.name(), managers = managers.len(), "buffer managers ready");
    Ok(managers)
}

/// Log a summary line per manager and warn about slots still held
pub fn report_managers(managers: &[Arc<BufferManager>]) {
    for manager in managers {
        let stats = manager.stats();
        if stats.held > 0 {
            warn!(manager = manager.name(), held = stats.held, "buffers still held");
        }
        info!(
            manager = manager.name(),
            allocated = stats.allocated,
            acquired = stats.acquired,
            released = stats.released,
            cancelled = stats.cancelled,
            grown = stats.grown,
            "buffer manager stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::buffer::AllocationMode;
    use crate::frame::Direction;
    use crate::pipeline::StageId;

    #[test]
    fn test_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.pipeline.name, "camera0");
        assert!(!config.buffers.is_empty());
        assert!(config.dual.is_none());
    }

    #[test]
    fn test_file_overrides_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[pipeline]
name = "rear"
sim_latency_us = 10

[demo]
requests = 5

[[buffers]]
name = "raw"
stage = 0
direction = "dst"

[buffers.config]
requested_count = 2
allowed_max_count = 4
mode = "on_demand"
planes = [{{ size = 4096, stride = 64 }}]
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.pipeline.name, "rear");
        assert_eq!(config.pipeline.sim_latency_us, 10);
        assert_eq!(config.pipeline.queue_timeout_ms, 100);
        assert_eq!(config.demo.requests, 5);
        assert_eq!(config.buffers.len(), 1);
        let spec = &config.buffers[0];
        assert_eq!(spec.stage, StageId(0));
        assert_eq!(spec.direction, Direction::Dst);
        assert_eq!(spec.config.mode, AllocationMode::OnDemand);
        assert_eq!(spec.config.batch_size, 1);
    }

    #[test]
    fn test_demo_configs_load() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");

        let dual = load_config(Some(&demos.join("dual.toml"))).unwrap();
        let settings = dual.dual.expect("dual section").settings;
        assert_eq!(settings.merge_stage, StageId(6));

        let faults = load_config(Some(&demos.join("faults.toml"))).unwrap();
        assert_eq!(faults.pipeline.sim_error_every, Some(7));
        assert_eq!(faults.buffers.len(), crate::default_buffers().len());
    }
}
