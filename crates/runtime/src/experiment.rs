use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use threadpool::ThreadPool;

use dslab_platform::config::PlatformConfig;

use crate::{
    config::EngineConfig,
    deployment::{DeploymentConfig, FunctionRegistry},
    error::SimError,
    run_stats::RunStats,
    simulation::Simulation,
    trace::JsonLinesSink,
};

struct Run {
    platform: (String, PlatformConfig),
    deployment: (String, DeploymentConfig),
    seed: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub platform: String,
    pub deployment: String,
    pub seed: u64,
    pub run_stats: RunStats,
    /// Error which prevented the simulation from running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs every deployment on every platform with every seed, each simulation in its own thread.
pub struct Experiment {
    engine: EngineConfig,
    seeds: Vec<u64>,
    platforms: Vec<(String, PlatformConfig)>,
    deployments: Vec<(String, DeploymentConfig)>,
    /// Builds the actor functions, simulations are created in worker threads.
    registry: fn() -> FunctionRegistry,
    traces_folder: Option<PathBuf>,
}

impl Experiment {
    pub fn new(
        engine: EngineConfig,
        seeds: Vec<u64>,
        platforms: Vec<(String, PlatformConfig)>,
        deployments: Vec<(String, DeploymentConfig)>,
        registry: fn() -> FunctionRegistry,
        traces_folder: Option<PathBuf>,
    ) -> Self {
        Self {
            engine,
            seeds,
            platforms,
            deployments,
            registry,
            traces_folder,
        }
    }

    pub fn run(self, threads: usize) -> Result<Vec<RunResult>, SimError> {
        if let Some(dir) = &self.traces_folder {
            std::fs::create_dir_all(dir).map_err(|source| SimError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let runs = self
            .platforms
            .into_iter()
            .cartesian_product(self.deployments)
            .cartesian_product(self.seeds)
            .map(|((platform, deployment), seed)| Run {
                platform,
                deployment,
                seed,
            })
            .collect::<Vec<_>>();

        let total_runs = runs.len();

        let finished_run_atomic = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(Vec::new()));

        let pool = ThreadPool::new(threads.max(1));
        let start_time = Instant::now();
        for run in runs.into_iter() {
            let finished_run_atomic = finished_run_atomic.clone();
            let results = results.clone();
            let traces_folder = self.traces_folder.clone();
            let engine = EngineConfig {
                seed: run.seed,
                ..self.engine.clone()
            };
            let registry = self.registry;
            pool.execute(move || {
                let trace_path = traces_folder.map(|folder| {
                    folder.join(format!("{}_{}_{}.jsonl", run.platform.0, run.deployment.0, run.seed))
                });
                let outcome = simulate(&run.platform.1, &run.deployment.1, engine, registry(), trace_path);
                let (run_stats, error) = match outcome {
                    Ok(stats) => (stats, None),
                    Err(e) => {
                        log::error!("run {}/{}/{} failed: {}", run.platform.0, run.deployment.0, run.seed, e);
                        (RunStats::default(), Some(e.to_string()))
                    }
                };

                results.lock().expect("result list is not poisoned").push(RunResult {
                    platform: run.platform.0,
                    deployment: run.deployment.0,
                    seed: run.seed,
                    run_stats,
                    error,
                });

                let finished_runs = finished_run_atomic.fetch_add(1, Ordering::SeqCst) + 1;
                let elapsed = start_time.elapsed();
                let remaining = Duration::from_secs_f64(
                    elapsed.as_secs_f64() / finished_runs as f64 * (total_runs - finished_runs) as f64,
                );
                print!("\r{}", " ".repeat(70));
                print!(
                    "\rFinished {}/{} [{}%] runs in {:.2?}, remaining time: {:.2?}",
                    finished_runs,
                    total_runs,
                    (finished_runs as f64 * 100. / total_runs as f64).round() as i32,
                    elapsed,
                    remaining
                );
                let _ = std::io::stdout().flush();
            });
        }

        pool.join();

        print!("\r{}", " ".repeat(70));
        println!("\rFinished {} runs in {:.2?}", total_runs, start_time.elapsed());

        let mut results = std::mem::take(&mut *results.lock().expect("result list is not poisoned"));
        results.sort_by_cached_key(|run| (run.platform.clone(), run.deployment.clone(), run.seed));
        Ok(results)
    }
}

fn simulate(
    platform: &PlatformConfig,
    deployment: &DeploymentConfig,
    engine: EngineConfig,
    registry: FunctionRegistry,
    trace_path: Option<PathBuf>,
) -> Result<RunStats, SimError> {
    let sim = Simulation::new(platform, engine)?;
    if let Some(path) = trace_path {
        let file = File::create(&path).map_err(|source| SimError::Io {
            path: path.display().to_string(),
            source,
        })?;
        sim.add_trace_sink(Box::new(JsonLinesSink::new(BufWriter::new(file))));
    }
    sim.deploy(deployment, &registry)?;
    sim.run();
    Ok(sim.stats())
}
