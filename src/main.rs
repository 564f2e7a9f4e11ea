use std::path;
use std::process;
use std::time::Duration;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use net_sort::{ClusterConfig, NodeSorterBuilder, RunSummary, RECORD_SIZE};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let node_id: usize = arg_parser.value_of_t_or_exit("node_id");
    let input = arg_parser.value_of("input").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");
    let config = arg_parser.value_of("config").expect("value is required");

    log::info!("my node id: {}", node_id);

    let cluster = match ClusterConfig::load(path::Path::new(config)) {
        Ok(cluster) => cluster,
        Err(err) => {
            log::error!("cluster config loading error: {}", err);
            process::exit(1);
        }
    };
    for node in cluster.nodes() {
        log::info!("cluster member: {}", node);
    }

    let sorter = match configure_sorter(&arg_parser).build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let summary = match sorter.run(node_id, &cluster, path::Path::new(input), path::Path::new(output)) {
        Ok(summary) => summary,
        Err(err) => {
            log::error!("distributed sort error: {}", err);
            process::exit(1);
        }
    };

    log_summary(&summary);
}

fn configure_sorter(arg_parser: &clap::ArgMatches) -> NodeSorterBuilder {
    let mut sorter_builder = NodeSorterBuilder::new();

    if arg_parser.is_present("threads") {
        sorter_builder = sorter_builder.with_threads_number(arg_parser.value_of_t_or_exit("threads"));
    }

    let backoff: u64 = arg_parser.value_of_t_or_exit("connect_backoff");
    sorter_builder = sorter_builder.with_connect_backoff(Duration::from_millis(backoff));

    if arg_parser.is_present("connect_timeout") {
        let timeout: u64 = arg_parser.value_of_t_or_exit("connect_timeout");
        sorter_builder = sorter_builder.with_connect_timeout(Duration::from_millis(timeout));
    }

    if arg_parser.is_present("barrier_timeout") {
        let timeout: u64 = arg_parser.value_of_t_or_exit("barrier_timeout");
        sorter_builder = sorter_builder.with_barrier_timeout(Duration::from_millis(timeout));
    }

    if let Some(buf_size) = arg_parser.value_of("rw_buf_size") {
        let buf_size = buf_size.parse::<ByteSize>().expect("value is pre-validated");
        sorter_builder = sorter_builder.with_rw_buf_size(buf_size.as_u64() as usize);
    }

    sorter_builder.with_strict_input(arg_parser.is_present("strict"))
}

fn log_summary(summary: &RunSummary) {
    let record_bytes = |count: usize| ByteSize((count * RECORD_SIZE) as u64);

    log::info!(
        "node {} scanned {} records ({}), kept {}",
        summary.node,
        summary.scanned,
        record_bytes(summary.scanned),
        summary.kept
    );
    for (peer, count) in &summary.sent {
        log::info!("sent {} records ({}) to node {}", count, record_bytes(*count), peer);
    }
    for (peer, count) in &summary.received {
        log::info!("received {} records ({}) from node {}", count, record_bytes(*count), peer);
    }
    log::info!(
        "wrote {} records ({})",
        summary.written,
        ByteSize(summary.written * RECORD_SIZE as u64)
    );
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn validate_number(v: &str) -> Result<(), String> {
    match v.parse::<u64>() {
        Ok(_) => Ok(()),
        Err(err) => Err(format!("Number format incorrect: {}", err)),
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::Command::new("net-sort")
        .about("distributed sorter of 100-byte records")
        .arg(
            clap::Arg::new("node_id")
                .help("id of this node in the cluster config")
                .required(true)
                .index(1)
                .validator(validate_number),
        )
        .arg(
            clap::Arg::new("input")
                .help("local input shard")
                .required(true)
                .index(2),
        )
        .arg(
            clap::Arg::new("output")
                .help("file receiving the sorted records owned by this node")
                .required(true)
                .index(3),
        )
        .arg(
            clap::Arg::new("config")
                .help("cluster config (YAML)")
                .required(true)
                .index(4),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true)
                .validator(validate_number),
        )
        .arg(
            clap::Arg::new("connect_backoff")
                .long("connect-backoff")
                .help("pause between peer connection attempts, in milliseconds")
                .takes_value(true)
                .default_value("10")
                .validator(validate_number),
        )
        .arg(
            clap::Arg::new("connect_timeout")
                .long("connect-timeout")
                .help("give up dialing a peer after this many milliseconds (default: never)")
                .takes_value(true)
                .validator(validate_number),
        )
        .arg(
            clap::Arg::new("barrier_timeout")
                .long("barrier-timeout")
                .help("give up waiting for the exchange after this many milliseconds (default: never)")
                .takes_value(true)
                .validator(validate_number),
        )
        .arg(
            clap::Arg::new("rw_buf_size")
                .short('b')
                .long("rw-buf-size")
                .help("connection and output buffer size")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Buffer size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("strict")
                .long("strict")
                .help("fail on a trailing partial record instead of dropping it"),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
