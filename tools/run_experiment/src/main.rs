use std::{
    collections::BTreeMap,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use clap::Parser;
use dslab_actors::{
    config::EngineConfig,
    deployment::{DeploymentConfig, FunctionRegistry},
    experiment::{Experiment, RunResult},
    log_debug, log_info, log_warn,
    platform::config::PlatformConfig,
    ActorContext,
};
use env_logger::Builder;
use itertools::Itertools;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    #[serde(default)]
    engine: EngineConfig,
    seeds: Vec<u64>,
    platforms: Vec<PathBuf>,
    deployments: Vec<PathBuf>,
}

/// Runs batch experiment.
#[derive(Parser, Debug)]
struct Args {
    /// Path to config.
    #[arg(short, long)]
    config: PathBuf,

    /// Path to folder with traces.
    #[arg(short, long, default_value = None)]
    traces: Option<PathBuf>,

    /// Path to file with results.
    #[arg(short, long)]
    output: PathBuf,

    /// Do not run experiments, just read results from --output.
    #[arg(long)]
    precalculated: bool,

    /// Number of threads.
    #[arg(long, default_value_t = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))]
    threads: usize,
}

fn filename(path: impl AsRef<Path>) -> String {
    path.as_ref()
        .file_stem()
        .and_then(|name| name.to_str())
        .expect("Path must point to a file")
        .to_string()
}

fn arg<T: std::str::FromStr>(args: &[String], index: usize, default: T) -> T {
    args.get(index).and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Sends `tasks` tasks of `flops` flops and `size` bytes to `workers` workers in round-robin order.
async fn master(ctx: ActorContext, args: Vec<String>) {
    let tasks: usize = arg(&args, 0, 10);
    let workers: usize = arg(&args, 1, 1);
    let flops: f64 = arg(&args, 2, 1e9);
    let size: f64 = arg(&args, 3, 1e6);
    for task in 0..tasks {
        let mailbox = ctx.mailbox(&format!("worker_{}", task % workers));
        if let Err(e) = mailbox.put(Some(flops), size).await {
            log_warn!(ctx, "can't send task {}: {}", task, e);
        }
    }
    for worker in 0..workers {
        let mailbox = ctx.mailbox(&format!("worker_{}", worker));
        if let Err(e) = mailbox.put(None::<f64>, 1.).await {
            log_warn!(ctx, "can't stop worker {}: {}", worker, e);
        }
    }
    log_info!(ctx, "sent {} tasks", tasks);
}

async fn worker(ctx: ActorContext, args: Vec<String>) {
    let id: usize = arg(&args, 0, 0);
    let mailbox = ctx.mailbox(&format!("worker_{}", id));
    loop {
        match mailbox.get::<Option<f64>>().await {
            Ok(Some(flops)) => {
                if let Err(e) = ctx.execute(flops).await {
                    log_warn!(ctx, "task failed: {}", e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                log_warn!(ctx, "can't receive task: {}", e);
                break;
            }
        }
    }
}

/// Sends `rounds` messages of `size` bytes to the ponger and waits for each reply.
async fn pinger(ctx: ActorContext, args: Vec<String>) {
    let rounds: usize = arg(&args, 0, 1);
    let size: f64 = arg(&args, 1, 1e3);
    let ping = ctx.mailbox("ping");
    let pong = ctx.mailbox("pong");
    for round in 0..rounds {
        let sent = ctx.time();
        if let Err(e) = ping.put(round, size).await {
            log_warn!(ctx, "ping failed: {}", e);
            return;
        }
        match pong.get::<usize>().await {
            Ok(_) => log_debug!(ctx, "round {} took {:.3}", round, ctx.time() - sent),
            Err(e) => {
                log_warn!(ctx, "pong failed: {}", e);
                return;
            }
        }
    }
}

async fn ponger(ctx: ActorContext, args: Vec<String>) {
    let size: f64 = arg(&args, 0, 1e3);
    let ping = ctx.mailbox("ping");
    let pong = ctx.mailbox("pong");
    loop {
        let round = match ping.get::<usize>().await {
            Ok(round) => round,
            Err(_) => return,
        };
        if pong.put(round, size).await.is_err() {
            return;
        }
    }
}

fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register("master", master);
    registry.register("worker", worker);
    registry.register("pinger", pinger);
    registry.register("ponger", ponger);
    registry
}

struct ResultRow {
    name: String,
    runs: usize,
    failed: usize,
    avg_makespan: f64,
    max_makespan: f64,
    avg_traffic: f64,
    avg_energy: f64,
}

fn main() {
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let args = Args::parse();
    let config: Config = serde_yaml::from_str(&std::fs::read_to_string(args.config).expect("Can't read config file"))
        .expect("Can't parse config file");

    let result: Vec<RunResult> = if args.precalculated {
        serde_json::from_str(&std::fs::read_to_string(args.output).expect("Can't read file with result"))
            .expect("Can't parse file with result")
    } else {
        let experiment = Experiment::new(
            config.engine,
            config.seeds,
            config
                .platforms
                .into_iter()
                .enumerate()
                .map(|(i, path)| {
                    let platform = PlatformConfig::from_yaml(&path).expect("Can't read platform");
                    (format!("{}_{}", i, filename(&path)), platform)
                })
                .collect(),
            config
                .deployments
                .into_iter()
                .enumerate()
                .map(|(i, path)| {
                    let deployment = DeploymentConfig::from_yaml(&path).expect("Can't read deployment");
                    (format!("{}_{}", i, filename(&path)), deployment)
                })
                .collect(),
            registry,
            args.traces,
        );

        let result = experiment.run(args.threads).expect("Can't run experiment");
        File::create(args.output)
            .expect("Can't create output file")
            .write_all(
                serde_json::to_string_pretty(&result)
                    .expect("Can't serialize result")
                    .as_bytes(),
            )
            .expect("Can't write to output file");
        result
    };

    let mut groups: BTreeMap<String, Vec<RunResult>> = BTreeMap::new();
    for run in result.into_iter() {
        groups
            .entry(format!("{}/{}", run.platform, run.deployment))
            .or_default()
            .push(run);
    }

    let rows = groups
        .into_iter()
        .map(|(name, runs)| {
            let (ok, failed): (Vec<_>, Vec<_>) = runs.iter().partition(|run| run.error.is_none());
            let count = ok.len().max(1) as f64;
            ResultRow {
                name,
                runs: runs.len(),
                failed: failed.len(),
                avg_makespan: ok.iter().map(|run| run.run_stats.makespan).sum::<f64>() / count,
                max_makespan: ok
                    .iter()
                    .map(|run| run.run_stats.makespan)
                    .max_by(|a, b| a.total_cmp(b))
                    .unwrap_or(0.),
                avg_traffic: ok.iter().map(|run| run.run_stats.total_network_traffic).sum::<f64>() / count,
                avg_energy: ok.iter().map(|run| run.run_stats.total_energy).sum::<f64>() / count,
            }
        })
        .sorted_by(|a, b| a.avg_makespan.total_cmp(&b.avg_makespan).then(a.name.cmp(&b.name)))
        .collect::<Vec<_>>();

    let width = rows.iter().map(|x| x.name.len()).max().unwrap_or(0).max("setup".len());
    println!(
        "| {: <width$} | runs | failed | avg makespan | max makespan |  avg traffic |   avg energy |",
        "setup",
        width = width
    );
    println!(
        "|-{:-<width$}-|------|--------|--------------|--------------|--------------|--------------|",
        "",
        width = width
    );
    for row in rows.into_iter() {
        println!(
            "| {: <width$} | {: >4} | {: >6} | {: >12.3} | {: >12.3} | {: >12.3e} | {: >12.3} |",
            row.name,
            row.runs,
            row.failed,
            row.avg_makespan,
            row.max_makespan,
            row.avg_traffic,
            row.avg_energy,
            width = width
        );
    }
}
