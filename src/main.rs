use std::io::Write;

use env_logger::Builder;

use dslab_actors::{
    log_info, log_warn, platform::topology::make_star_platform, ActorContext, EngineConfig, Simulation,
};

const TASK_COUNT: usize = 20;
const WORKER_COUNT: usize = 3;

async fn master(ctx: ActorContext) {
    for task in 0..TASK_COUNT {
        let mailbox = ctx.mailbox(&format!("worker_{}", task % WORKER_COUNT));
        let flops = ctx.gen_range(1e8..1e9);
        if let Err(e) = mailbox.put(Some(flops), 1e6).await {
            log_warn!(ctx, "can't send task {}: {}", task, e);
        }
    }
    for worker in 0..WORKER_COUNT {
        let mailbox = ctx.mailbox(&format!("worker_{}", worker));
        if let Err(e) = mailbox.put(None::<f64>, 1.).await {
            log_warn!(ctx, "can't stop worker {}: {}", worker, e);
        }
    }
    log_info!(ctx, "all tasks are sent");
}

async fn worker(ctx: ActorContext, id: usize) {
    let mailbox = ctx.mailbox(&format!("worker_{}", id));
    let mut done = 0;
    loop {
        match mailbox.get::<Option<f64>>().await {
            Ok(Some(flops)) => match ctx.execute(flops).await {
                Ok(()) => done += 1,
                Err(e) => log_warn!(ctx, "task failed: {}", e),
            },
            Ok(None) => break,
            Err(e) => {
                log_warn!(ctx, "can't receive task: {}", e);
                break;
            }
        }
    }
    log_info!(ctx, "finished {} tasks", done);
}

fn main() {
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let platform = make_star_platform(WORKER_COUNT + 1, 1e9, 1e8);
    let sim = Simulation::new(&platform, EngineConfig::default()).expect("Can't create simulation");

    let master_host = sim.host("host_0").expect("Unknown host");
    sim.spawn("master", &master_host, master).expect("Can't spawn master");
    for id in 0..WORKER_COUNT {
        let host = sim.host(&format!("host_{}", id + 1)).expect("Unknown host");
        sim.spawn(&format!("worker_{}", id), &host, move |ctx| worker(ctx, id))
            .expect("Can't spawn worker");
    }

    sim.run();
    println!(
        "{}",
        serde_json::to_string_pretty(&sim.stats()).expect("Can't serialize run stats")
    );
}
