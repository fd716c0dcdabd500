//! `tsk-proxy` — consume TSK batches from Kafka, write them downstream.

#![warn(clippy::all, clippy::pedantic)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use tracing::{debug, error, info, warn, Level};

use tsfan::Timeseries;
use tsfan_proxy::{Ingest, ProxyConfig, ProxyError, Stats};

const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Consecutive partition-EOF events after which a burst is abandoned.
const MAX_EOF_SINCE_DATA: u32 = 10;

/// SIGINT count that forces immediate termination.
const HARD_EXIT_SIGINTS: u32 = 3;

#[derive(Parser, Debug)]
#[command(name = "tsk-proxy")]
#[command(about = "Bridge TSK batches from Kafka into a timeseries backend")]
struct Cli {
    /// Path to the YAML configuration file
    config_file: PathBuf,
}

fn main() {
    std::process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "tsk-proxy failed");
            eprintln!("ERROR {e}");
            -1
        }
    });
}

fn run() -> Result<(), ProxyError> {
    let cli = Cli::parse();

    let cfg = ProxyConfig::from_file(&cli.config_file)?;
    init_tracing(cfg.log_level);
    info!(config = %cli.config_file.display(), "parsed config file");
    for key in &cfg.unknown_keys {
        warn!(key = %key, "ignoring unsupported config key");
    }

    let shutdown = install_sigint_handler()?;

    let consumer = init_consumer(&cfg)?;
    let mut ingest = init_ingest(&cfg)?;

    run_loop(&consumer, &mut ingest, &shutdown)
}

fn init_tracing(log_level: u8) {
    let level = match log_level {
        0 => Level::ERROR,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Installs the SIGINT handler: the first signal requests a graceful
/// drain, the third terminates on the spot.
fn install_sigint_handler() -> Result<Arc<AtomicU32>, ProxyError> {
    let shutdown = Arc::new(AtomicU32::new(0));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        let caught = flag.fetch_add(1, Ordering::SeqCst) + 1;
        if caught >= HARD_EXIT_SIGINTS {
            eprintln!("caught {caught} SIGINTs, shutting down now");
            std::process::exit(1);
        }
    })
    .map_err(|e| ProxyError::Config(format!("failed to install signal handler: {e}")))?;
    Ok(shutdown)
}

fn init_consumer(cfg: &ProxyConfig) -> Result<BaseConsumer, ProxyError> {
    info!("initializing kafka");
    let topic = cfg.topic();
    let group_id = cfg.group_id();
    debug!(topic = %topic, group_id = %group_id, "subscribing");

    let consumer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", &cfg.kafka_brokers)
        .set("group.id", &group_id)
        .set("auto.offset.reset", &cfg.kafka_offset)
        // partition EOF events drive the idle detection in the run loop
        .set("enable.partition.eof", "true")
        .create()?;
    consumer.subscribe(&[&topic])?;

    info!("successfully initialized kafka");
    Ok(consumer)
}

fn init_ingest(cfg: &ProxyConfig) -> Result<Ingest, ProxyError> {
    info!("initializing timeseries");
    let mut ts = Timeseries::new();
    let id = ts.backend_by_name(&cfg.timeseries_backend).ok_or_else(|| {
        ProxyError::Config(format!(
            "invalid timeseries backend name '{}'",
            cfg.timeseries_backend
        ))
    })?;
    debug!(options = %cfg.timeseries_opts, "enabling downstream backend");
    ts.enable_backend(id, &cfg.timeseries_opts)?;

    let stats = match (&cfg.stats_backend, &cfg.stats_opts) {
        (Some(backend), Some(opts)) => {
            info!("initializing stats timeseries");
            let mut stats_ts = Timeseries::new();
            let sid = stats_ts.backend_by_name(backend).ok_or_else(|| {
                ProxyError::Config(format!("invalid stats timeseries backend name '{backend}'"))
            })?;
            stats_ts.enable_backend(sid, opts)?;
            Some(Stats::new(stats_ts, cfg.stats_prefix(), cfg.stats_interval))
        }
        _ => None,
    };

    Ok(Ingest::new(
        ts,
        &cfg.kafka_channel,
        cfg.filter_prefixes.clone(),
        stats,
    ))
}

fn run_loop(
    consumer: &BaseConsumer,
    ingest: &mut Ingest,
    shutdown: &AtomicU32,
) -> Result<(), ProxyError> {
    info!("starting TSK proxy");
    let mut msg_cnt: u32 = 0;
    let mut rate_mark = Instant::now();

    let result = loop {
        // the consumer went idle (or we just started): flush whatever is
        // buffered rather than sit on a partial timestamp
        if let Err(e) = ingest.maybe_flush(None) {
            break Err(e);
        }
        ingest.maybe_flush_stats();

        if shutdown.load(Ordering::SeqCst) > 0 {
            info!("shutting down TSK proxy");
            break Ok(());
        }

        let mut eof_since_data: u32 = 0;
        let mut message = consumer.poll(POLL_TIMEOUT);

        // drain the burst
        'burst: while let Some(polled) = message {
            msg_cnt += 1;
            if rate_mark.elapsed() >= Duration::from_secs(1) {
                debug!(rate = msg_cnt, "messages per second");
                msg_cnt = 0;
                rate_mark = Instant::now();
            }

            match polled {
                Ok(m) => {
                    if let Some(payload) = m.payload() {
                        if let Err(e) = ingest.handle_message(payload) {
                            return finish(ingest, Err(e));
                        }
                    }
                    eof_since_data = 0;
                }
                Err(KafkaError::PartitionEOF(partition)) => {
                    debug!(partition, "reached end of partition");
                    eof_since_data += 1;
                    if shutdown.load(Ordering::SeqCst) > 0
                        || eof_since_data >= MAX_EOF_SINCE_DATA
                    {
                        break 'burst;
                    }
                }
                Err(e) => {
                    // attempt to carry on
                    info!(error = %e, "consumer error");
                }
            }

            if shutdown.load(Ordering::SeqCst) > 0 {
                break 'burst;
            }
            message = consumer.poll(POLL_TIMEOUT);
            ingest.maybe_flush_stats();
        }
    };

    finish(ingest, result)
}

/// Drains the accumulator on the way out; shutdown ignores flush failures.
fn finish(ingest: &mut Ingest, result: Result<(), ProxyError>) -> Result<(), ProxyError> {
    let _ = ingest.maybe_flush(None);
    info!("shutdown complete");
    result
}
