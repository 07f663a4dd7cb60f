use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use dotenv::dotenv;
use stonestream::client::mock::MockClientSupplier;
use stonestream::metrics::OtelSensorRecorder;
use stonestream::task::KeyCountSupplier;
use stonestream::utils::SystemClock;
use stonestream::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Assignment, ConsumerRecord, StateDirectory,
    StaticAssignor, StreamsConfig, TopicPartition, Worker, WorkerHandle, GLOBAL_CONFIG,
};
use tokio::runtime;
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// partitions of every source topic in the demo cluster
    #[arg(short, long, default_value_t = 4)]
    pub partitions: i32,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

const DEFAULT_STORE: &str = "counts";

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();

    let level = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // print-config stays on the console and leaves no log directory behind
    let _log_guard = match commandline.command {
        Some(Command::PrintConfig) => {
            setup_local_tracing()?;
            None
        }
        None => Some(setup_tracing("./logs", level)?),
    };

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let mut config = StreamsConfig::set_up_config(config_path)?;
    if config.state_stores.is_empty() {
        config.state_stores.push(DEFAULT_STORE.to_string());
    }
    if config.num_stream_threads == 0 {
        config.num_stream_threads = num_cpus::get();
    }

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| AppError::IllegalStateTransition("config already set".to_string()))?;
    let config = GLOBAL_CONFIG
        .get()
        .ok_or_else(|| AppError::IllegalStateTransition("config not installed".to_string()))?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let supplier = Arc::new(MockClientSupplier::new());
    let mut handles = start_workers(config, supplier.clone(), commandline.partitions)?;

    rt.block_on(async {
        let feeder = tokio::spawn(feed_records(config, supplier.clone(), commandline.partitions));
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
        }
        info!("ctrl-c received, closing {} workers", handles.len());
        feeder.abort();
    });

    for handle in &handles {
        handle.close();
    }
    let mut result = Ok(());
    for handle in handles.iter_mut() {
        if let Err(e) = handle.join() {
            error!("{} exited with error: {}", handle.client_id(), e);
            result = Err(e);
        }
    }
    result
}

/// Starts one worker per configured thread, each owning every n-th
/// partition number.
fn start_workers(
    config: &StreamsConfig,
    supplier: Arc<MockClientSupplier>,
    partitions: i32,
) -> AppResult<Vec<WorkerHandle>> {
    let state_directory = Arc::new(StateDirectory::new(
        &config.state_dir,
        &config.application_id,
    )?);
    let processor = Arc::new(KeyCountSupplier::new(
        config.state_stores[0].clone(),
        config.sink_topic.clone(),
    ));
    let recorder = Arc::new(OtelSensorRecorder::new("stonestream"));
    let threads = config.num_stream_threads;

    let mut handles = Vec::with_capacity(threads);
    for index in 0..threads {
        let client_id = format!("{}-stream-thread-{}", config.application_id, index + 1);
        let mut worker = Worker::create(
            client_id,
            config.clone(),
            supplier.clone(),
            processor.clone(),
            state_directory.clone(),
            recorder.clone(),
            Arc::new(SystemClock),
        )?;

        let owned: HashSet<TopicPartition> = config
            .source_topics
            .iter()
            .flat_map(|topic| (0..partitions).map(move |p| TopicPartition::new(topic.clone(), p)))
            .filter(|tp| tp.partition as usize % threads == index)
            .collect();
        worker.set_assignment_provider(Arc::new(StaticAssignor::new(
            Assignment::group_by_partition(&owned),
        )));
        if let Some(consumer) = supplier.consumer(index) {
            consumer.schedule_rebalance(HashSet::new(), owned);
        }
        handles.push(worker.start()?);
    }
    Ok(handles)
}

/// Writes a few keyed records into every source partition each second.
async fn feed_records(
    config: &'static StreamsConfig,
    supplier: Arc<MockClientSupplier>,
    partitions: i32,
) {
    let threads = config.num_stream_threads;
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut offset = 0i64;
    loop {
        interval.tick().await;
        for topic in &config.source_topics {
            for partition in 0..partitions {
                let Some(consumer) = supplier.consumer(partition as usize % threads) else {
                    continue;
                };
                let records = (0..3)
                    .map(|i| {
                        ConsumerRecord::new(
                            topic.clone(),
                            partition,
                            offset + i,
                            Some(Bytes::from(format!("key-{}", i))),
                            Some(Bytes::from(format!("value-{}", offset + i))),
                        )
                    })
                    .collect();
                consumer.add_records(records);
            }
        }
        offset += 3;
    }
}
