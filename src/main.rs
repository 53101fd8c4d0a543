//! Frame-graph demo: drives simulated camera pipelines end to end

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use framegraph::buffer::{BufferManager, DmaAllocator, HeapAllocator};
use framegraph::frame::{FrameHandle, FrameRequest, OutputSet, SyncType};
use framegraph::pipeline::{
    FrameGraphDriver, FusionCoordinator, ManagerReturningSelector, SimulatedPipe, StageWorker, Step, StopFlag,
    Topology, TopologyConfig,
};
use framegraph::tuning::TracingHooks;
use framegraph::{utils, DemoConfig, ManagerSpec, PipelineConfig, PipelineError};

/// One camera's driver plus everything it owns
struct Camera {
    driver: Arc<FrameGraphDriver>,
    managers: Vec<Arc<BufferManager>>,
    sinks: Vec<StageWorker>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framegraph=info")))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Frame graph launching...");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = utils::load_config(path.as_deref())?;
    framegraph::CONFIG.store(Arc::new(config.clone()));

    let allocator: Arc<dyn DmaAllocator> = Arc::new(HeapAllocator::new());
    let hooks = Arc::new(TracingHooks::default());

    let (cameras, fusion) = match &config.dual {
        None => {
            let camera = build_camera(
                &config.pipeline,
                &config.topology,
                &config.buffers,
                allocator.clone(),
                hooks.clone(),
                None,
            )?;
            (vec![camera], None)
        }
        Some(dual) => {
            let fusion = Arc::new(FusionCoordinator::new(
                dual.settings.clone(),
                Arc::new(ManagerReturningSelector),
            ));
            let primary_pipeline = PipelineConfig {
                camera: dual.settings.primary_camera,
                ..config.pipeline.clone()
            };
            let secondary_pipeline = PipelineConfig {
                name: dual.secondary.name.clone(),
                camera: dual.secondary.camera,
                ..config.pipeline.clone()
            };
            let primary = build_camera(
                &primary_pipeline,
                &dual.primary_topology(),
                &dual.primary_buffers(),
                allocator.clone(),
                hooks.clone(),
                Some(fusion.clone()),
            )?;
            let secondary = build_camera(
                &secondary_pipeline,
                &dual.secondary.topology,
                &dual.secondary.buffers,
                allocator.clone(),
                hooks.clone(),
                Some(fusion.clone()),
            )?;
            (vec![primary, secondary], Some(fusion))
        }
    };

    // Pump requests from a blocking task; every driver gets each request
    let drivers: Vec<_> = cameras.iter().map(|c| c.driver.clone()).collect();
    let pump_stop = StopFlag::new();
    let dual = config.dual.is_some();
    let demo = config.demo.clone();
    let mut pump = {
        let stop = pump_stop.clone();
        tokio::task::spawn_blocking(move || pump_requests(&drivers, &demo, dual, &stop))
    };

    tokio::select! {
        submitted = &mut pump => {
            info!("Submitted {} requests", submitted?);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping request pump");
            pump_stop.request();
            let submitted = pump.await?;
            info!("Submitted {} requests", submitted);
        }
    }

    // Let in-flight frames drain before tearing down
    let deadline = Instant::now() + Duration::from_millis(config.pipeline.stop_timeout_ms);
    while Instant::now() < deadline && cameras.iter().any(|c| in_flight(&c.driver) > 0) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Secondary first so nothing new reaches the primary's sync stage
    for camera in cameras.into_iter().rev() {
        let report = camera.driver.teardown();
        if report.aborted > 0 {
            warn!(
                driver = camera.driver.name(),
                aborted = report.aborted,
                released = report.released_buffers,
                "frames still in flight at teardown"
            );
        }
        for worker in camera.sinks {
            let name = worker.name().to_string();
            match worker.join() {
                Ok(summary) => info!(worker = %name, processed = summary.processed, "sink drained"),
                Err(e) => error!("{}", e),
            }
        }
        info!(driver = camera.driver.name(), stats = ?camera.driver.stats(), "driver stats");
        utils::report_managers(&camera.managers);
    }
    if let Some(fusion) = fusion {
        info!(stats = ?fusion.stats(), "fusion stats");
    }
    info!(finished = hooks.finished(), aborted = hooks.aborted(), "Frame graph stopped");

    Ok(())
}

fn build_camera(
    pipeline: &PipelineConfig,
    topology: &TopologyConfig,
    buffers: &[ManagerSpec],
    allocator: Arc<dyn DmaAllocator>,
    hooks: Arc<TracingHooks>,
    fusion: Option<Arc<FusionCoordinator>>,
) -> Result<Camera> {
    let topology = Arc::new(Topology::from_config(topology)?);
    let pipe = Arc::new(SimulatedPipe::new(topology.pipe_stages(), pipeline.sim_settings()));
    let mut builder = FrameGraphDriver::builder(topology.clone(), pipe)
        .settings(pipeline.driver_settings())
        .tuning(hooks);
    if let Some(fusion) = fusion {
        builder = builder.fusion(fusion);
    }
    let driver = builder.build()?;
    let managers = utils::build_managers(buffers, allocator, &driver)?;
    driver.start()?;

    let mut sinks = Vec::new();
    for stage in topology.sinks() {
        let Some(queue) = driver.sink_queue(stage) else {
            continue;
        };
        let consumer = driver.clone();
        let worker = StageWorker::spawn(
            format!("{}-sink-{}", pipeline.name, stage),
            queue,
            StopFlag::new(),
            None,
            move |frame: FrameHandle| {
                let request = frame.request_id();
                consumer.complete_stage(&frame, stage)?;
                debug!(request, stage = %stage, "delivered");
                Ok(Step::Continue)
            },
        )?;
        sinks.push(worker);
    }

    info!(driver = driver.name(), camera = driver.camera(), "camera ready");
    Ok(Camera {
        driver,
        managers,
        sinks,
    })
}

fn pump_requests(drivers: &[Arc<FrameGraphDriver>], demo: &DemoConfig, dual: bool, stop: &StopFlag) -> u32 {
    const SYNC_CYCLE: [SyncType; 3] = [SyncType::Sync, SyncType::Bypass, SyncType::Switch];

    let interval = Duration::from_millis(demo.interval_ms);
    let epoch = Instant::now();
    let mut submitted = 0;
    for id in 0..demo.requests {
        if stop.is_requested() {
            break;
        }
        let capture = !dual && demo.capture_every > 0 && (id + 1) % demo.capture_every == 0;
        let outputs = if capture {
            OutputSet::preview_and_capture()
        } else {
            OutputSet::preview()
        };
        let mut request = FrameRequest::new(id, outputs).with_timestamp(epoch.elapsed().as_nanos() as u64);
        if dual {
            request = request.with_sync(SYNC_CYCLE[id as usize % SYNC_CYCLE.len()]);
        }

        for driver in drivers {
            match driver.submit(&request) {
                Ok(_) => {}
                Err(PipelineError::Stopped) => return submitted,
                Err(e) => warn!(driver = driver.name(), request = id, "request dropped: {}", e),
            }
        }
        submitted += 1;
        std::thread::sleep(interval);
    }
    submitted
}

fn in_flight(driver: &FrameGraphDriver) -> usize {
    let stats = driver.stats();
    stats.in_process + stats.in_post_process
}
