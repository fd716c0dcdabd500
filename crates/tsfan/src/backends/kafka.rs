//! Kafka producer backend.
//!
//! Serializes key-package flushes into TSK frames (or plain ASCII lines)
//! and publishes them to `"<topic-prefix>.<channel>"`. TSK messages are
//! time-partitioned: every value for the same minute lands on the same
//! partition, so a consumer can scale out by partition without splitting a
//! timestamp. ASCII messages round-robin through the default partitioner.
//!
//! The producer connection is managed by a small state machine: connect
//! attempts back off exponentially, recoverable transport errors clear the
//! connected flag (the next flush reconnects), and unrecoverable errors
//! (bad compression codec, unresolvable brokers) latch a fatal flag that
//! fails every subsequent operation fast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use tracing::{debug, error, info, warn};

use crate::backend::{BackendId, BackendOps};
use crate::codec;
use crate::error::{Error, Result};
use crate::kp::KeyPackage;

const BACKEND_NAME: &str = "kafka";

const DEFAULT_COMPRESSION: &str = "snappy";

const DEFAULT_TOPIC_PREFIX: &str = "tsk-production";

/// Scratch buffer size; about half is used before a message is flushed.
const BUFFER_LEN: usize = 1024 * 1024;

/// Messages are produced once the buffer passes this mark.
const FLUSH_THRESHOLD: usize = BUFFER_LEN / 2;

/// Longest accepted fully-qualified topic name.
const IDENTITY_MAX_LEN: usize = 1024;

const CONNECT_MAX_RETRIES: u32 = 8;

const BACKOFF_START_SECS: u64 = 10;

const BACKOFF_CAP_SECS: u64 = 180;

/// Out-queue drain attempts on shutdown, 5 seconds each.
const DRAIN_WAITS: u32 = 12;

/// Serialization applied to produced messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WireFormat {
    /// One `"<key> <value> <time>"` line per record.
    Ascii,
    /// Binary TSK batch frames.
    Tsk,
}

#[derive(Parser, Debug, Clone)]
#[command(name = BACKEND_NAME)]
struct KafkaArgs {
    /// Kafka broker URI
    #[arg(short = 'b', value_name = "broker-uri")]
    brokers: String,

    /// Metric channel to publish to
    #[arg(short = 'c', value_name = "channel")]
    channel: String,

    /// Compression codec to use
    #[arg(short = 'C', value_name = "compression", default_value = DEFAULT_COMPRESSION)]
    compression: String,

    /// Output format
    #[arg(short = 'f', value_name = "format", value_enum, default_value = "tsk")]
    format: WireFormat,

    /// Topic prefix to use
    #[arg(short = 'p', value_name = "topic-prefix", default_value = DEFAULT_TOPIC_PREFIX)]
    topic_prefix: String,
}

/// Connection health shared with the client callbacks.
#[derive(Debug, Default)]
struct ConnFlags {
    connected: AtomicBool,
    fatal: AtomicBool,
}

impl ConnFlags {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn set_connected(&self, v: bool) {
        self.connected.store(v, Ordering::Relaxed);
    }

    fn fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    fn set_fatal(&self) {
        self.fatal.store(true, Ordering::Relaxed);
    }
}

/// rdkafka context feeding error and delivery callbacks into [`ConnFlags`].
struct FanoutContext {
    flags: Arc<ConnFlags>,
}

impl ClientContext for FanoutContext {
    fn error(&self, error: KafkaError, reason: &str) {
        if let Some(code) = error.rdkafka_error_code() {
            match code {
                RDKafkaErrorCode::BadCompression | RDKafkaErrorCode::Resolve => {
                    self.flags.set_fatal();
                    self.flags.set_connected(false);
                }
                RDKafkaErrorCode::BrokerDestroy
                | RDKafkaErrorCode::Fail
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown => {
                    self.flags.set_connected(false);
                }
                _ => {}
            }
        }
        error!(error = %error, reason, "kafka client error");
    }
}

impl ProducerContext for FanoutContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, (): Self::DeliveryOpaque) {
        // delivery is best-effort: failures are logged, never surfaced
        if let Err((e, msg)) = result {
            warn!(
                error = %e,
                topic = msg.topic(),
                partition = msg.partition(),
                "message delivery failed"
            );
        }
    }
}

/// An established producer plus its topic.
struct Conn {
    producer: BaseProducer<FanoutContext>,
    topic: String,
    /// Partition count of the topic, fetched at connect; 0 for ASCII
    /// output where the default partitioner routes.
    partitions: u32,
}

/// The partition every value of this minute belongs on.
fn partition_for(time: u32, partition_cnt: u32) -> u32 {
    (time / 60) % partition_cnt
}

fn next_backoff(wait: u64) -> u64 {
    (wait * 2).min(BACKOFF_CAP_SECS)
}

fn build_topic(prefix: &str, channel: &str) -> Result<String> {
    let topic = format!("{prefix}.{channel}");
    if topic.len() >= IDENTITY_MAX_LEN {
        return Err(Error::Config(format!(
            "topic name '{topic}' exceeds {IDENTITY_MAX_LEN} bytes"
        )));
    }
    Ok(topic)
}

/// Time partitioning needs a partition count that is not a divisor of 60,
/// otherwise the minute cycle revisits the same partitions and leaves the
/// rest idle.
fn validate_tsk_partitions(partition_cnt: u32) -> Result<()> {
    if partition_cnt == 0 {
        return Err(Error::TransientBus("topic reports no partitions".into()));
    }
    if 60 % partition_cnt == 0 {
        return Err(Error::Config(format!(
            "partition count {partition_cnt} divides evenly into 60; \
             time-partitioned topics require a non-divisor count"
        )));
    }
    Ok(())
}

/// Serializes `records` into `buf`, handing full and trailing messages to
/// `send` (which must leave the buffer empty).
///
/// TSK messages get a fresh header whenever the buffer starts empty; a
/// trailing message is always sent, however small.
fn serialize_records<'k, F>(
    buf: &mut Vec<u8>,
    threshold: usize,
    format: WireFormat,
    channel: &str,
    time: u32,
    records: impl Iterator<Item = (&'k str, u64)>,
    mut send: F,
) -> Result<()>
where
    F: FnMut(&mut Vec<u8>) -> Result<()>,
{
    use std::io::Write as _;

    buf.clear();
    for (key, value) in records {
        match format {
            WireFormat::Ascii => {
                writeln!(buf, "{key} {value} {time}")?;
            }
            WireFormat::Tsk => {
                if buf.is_empty() {
                    codec::write_header(buf, time, channel.as_bytes())?;
                }
                codec::write_kv(buf, key.as_bytes(), value)?;
            }
        }

        if buf.len() > threshold {
            send(buf)?;
        }
    }
    send(buf)
}

/// Kafka TSK producer backend; see the module docs.
pub struct KafkaBackend {
    enabled: bool,
    args: Option<KafkaArgs>,
    flags: Arc<ConnFlags>,
    conn: Option<Conn>,
    buffer: Vec<u8>,
}

impl KafkaBackend {
    /// Creates the backend disabled and disconnected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            args: None,
            flags: Arc::new(ConnFlags::default()),
            conn: None,
            buffer: Vec::with_capacity(BUFFER_LEN),
        }
    }

    fn producer_connect(
        args: &KafkaArgs,
        flags: &Arc<ConnFlags>,
    ) -> Result<BaseProducer<FanoutContext>> {
        let context = FanoutContext {
            flags: Arc::clone(flags),
        };

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &args.brokers)
            .set("compression.codec", &args.compression)
            // idle disconnect logging is noise on Kafka 0.9.x brokers
            .set("log.connection.close", "false")
            .set("socket.keepalive.enable", "true");

        let producer: BaseProducer<FanoutContext> = config.create_with_context(context)?;
        flags.set_connected(true);

        // serve callbacks so connect-time errors land before first use
        producer.poll(Duration::from_secs(5));
        Ok(producer)
    }

    fn topic_connect(args: &KafkaArgs, producer: BaseProducer<FanoutContext>) -> Result<Conn> {
        let topic = build_topic(&args.topic_prefix, &args.channel)?;
        debug!(topic = %topic, "connecting to topic");

        let partitions = if args.format == WireFormat::Tsk {
            let metadata = producer
                .client()
                .fetch_metadata(Some(&topic), Duration::from_secs(5))?;
            let cnt = metadata
                .topics()
                .first()
                .map_or(0, |t| t.partitions().len());
            let cnt = u32::try_from(cnt)
                .map_err(|_| Error::TransientBus("absurd partition count".into()))?;
            validate_tsk_partitions(cnt)?;
            cnt
        } else {
            0
        };

        Ok(Conn {
            producer,
            topic,
            partitions,
        })
    }

    fn connect(&mut self) -> Result<()> {
        let args = self
            .args
            .clone()
            .ok_or_else(|| Error::Config("kafka backend not configured".into()))?;

        self.conn = None;
        self.flags.set_connected(false);

        let mut wait = BACKOFF_START_SECS;
        let mut retries = CONNECT_MAX_RETRIES;
        let mut producer = None;

        while !self.flags.connected() && retries > 0 {
            producer = Some(Self::producer_connect(&args, &self.flags)?);
            if self.flags.fatal() {
                return Err(Error::FatalBus(
                    "kafka reported an unrecoverable error while connecting".into(),
                ));
            }

            retries -= 1;
            if !self.flags.connected() && retries > 0 {
                warn!(seconds = wait, "failed to connect to kafka, retrying");
                std::thread::sleep(Duration::from_secs(wait));
                wait = next_backoff(wait);
            }
        }

        let Some(producer) = producer.filter(|_| self.flags.connected()) else {
            return Err(Error::TransientBus(format!(
                "failed to connect to kafka after {CONNECT_MAX_RETRIES} retries"
            )));
        };

        self.conn = Some(Self::topic_connect(&args, producer)?);
        info!(brokers = %args.brokers, channel = %args.channel, "kafka producer connected");
        Ok(())
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.flags.fatal() {
            return Err(Error::FatalBus("kafka backend is in a fatal state".into()));
        }
        if self.conn.is_none() || !self.flags.connected() {
            self.connect()?;
        }
        Ok(())
    }

    /// Produces the buffered message, blocking on a full queue, and leaves
    /// the buffer empty. A no-op on an empty buffer.
    fn produce(
        conn: &Conn,
        flags: &ConnFlags,
        buf: &mut Vec<u8>,
        time: u32,
        partition: Option<i32>,
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let key = time.to_be_bytes();
        loop {
            let mut record: BaseRecord<'_, [u8], [u8]> = BaseRecord::to(&conn.topic)
                .key(&key[..])
                .payload(&buf[..]);
            if let Some(p) = partition {
                record = record.partition(p);
            }

            match conn.producer.send(record) {
                Ok(()) => break,
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                    warn!("producer queue full, retrying");
                    conn.producer.poll(Duration::from_millis(1000));
                }
                Err((e, _)) => {
                    error!(error = %e, topic = %conn.topic, "failed to produce message");
                    conn.producer.poll(Duration::ZERO);
                    buf.clear();
                    return Err(if flags.fatal() {
                        Error::FatalBus(e.to_string())
                    } else {
                        Error::TransientBus(e.to_string())
                    });
                }
            }
        }

        conn.producer.poll(Duration::ZERO);
        buf.clear();
        Ok(())
    }

    fn write_records<'k>(
        &mut self,
        time: u32,
        records: impl Iterator<Item = (&'k str, u64)>,
    ) -> Result<()> {
        self.ensure_connected()?;

        let args = self
            .args
            .as_ref()
            .ok_or_else(|| Error::Config("kafka backend not configured".into()))?;
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| Error::TransientBus("kafka producer not connected".into()))?;

        let partition = match args.format {
            WireFormat::Tsk => Some(
                i32::try_from(partition_for(time, conn.partitions))
                    .map_err(|_| Error::TransientBus("absurd partition count".into()))?,
            ),
            WireFormat::Ascii => None,
        };

        let flags = &self.flags;
        let mut buf = std::mem::take(&mut self.buffer);
        let res = serialize_records(
            &mut buf,
            FLUSH_THRESHOLD,
            args.format,
            &args.channel,
            time,
            records,
            |b| Self::produce(conn, flags, b, time, partition),
        );
        self.buffer = buf;
        res
    }
}

impl Default for KafkaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendOps for KafkaBackend {
    fn id(&self) -> BackendId {
        BackendId::Kafka
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn init(&mut self, args: &[String]) -> Result<()> {
        let parsed = KafkaArgs::try_parse_from(
            std::iter::once(BACKEND_NAME.to_owned()).chain(args.iter().cloned()),
        )
        .map_err(|e| Error::Config(e.to_string()))?;

        // validate the topic name before any connection attempt
        build_topic(&parsed.topic_prefix, &parsed.channel)?;

        self.args = Some(parsed);
        if let Err(e) = self.connect() {
            self.args = None;
            self.conn = None;
            return Err(e);
        }

        self.enabled = true;
        Ok(())
    }

    fn set_single(&mut self, key: &str, value: u64, time: u32) -> Result<()> {
        self.write_records(time, std::iter::once((key, value)))
    }

    fn resolve_key(&mut self, _key: &str) -> Result<Box<[u8]>> {
        Err(Error::NotImplemented(BACKEND_NAME))
    }

    fn set_single_by_id(&mut self, _id: &[u8], _value: u64, _time: u32) -> Result<()> {
        Err(Error::NotImplemented(BACKEND_NAME))
    }

    fn set_bulk_init(&mut self, _key_cnt: u32, _time: u32) -> Result<()> {
        Err(Error::NotImplemented(BACKEND_NAME))
    }

    fn set_bulk_by_id(&mut self, _id: &[u8], _value: u64) -> Result<()> {
        Err(Error::NotImplemented(BACKEND_NAME))
    }

    fn kp_flush(&mut self, kp: &KeyPackage, time: u32) -> Result<()> {
        self.write_records(time, kp.enabled_iter().map(|ki| (ki.key(), ki.value())))
    }
}

impl Drop for KafkaBackend {
    fn drop(&mut self) {
        let Some(conn) = &self.conn else { return };

        conn.producer.poll(Duration::ZERO);
        let mut waits = DRAIN_WAITS;
        while conn.producer.in_flight_count() > 0 && waits > 0 {
            info!(
                outq = conn.producer.in_flight_count(),
                "waiting for kafka queue to drain"
            );
            conn.producer.poll(Duration::from_secs(5));
            waits -= 1;
        }
        info!("shutting down kafka producer");
    }
}
