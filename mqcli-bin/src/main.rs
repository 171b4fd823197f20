#![deny(unsafe_code)]

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::{fs, io, process};

use anyhow::Context;
use simple_logger::SimpleLogger;
use structopt::StructOpt;

use mqcli::bridge;
use mqcli::scheduler::RepeatDelay;
use mqcli::types::QoS;
use mqcli::{ClientError, ClientKind, PubMode, SessionConfig, SessionState};

/// Largest payload a single MQTT message can carry.
const MAX_PAYLOAD: usize = 268_435_455;

#[derive(StructOpt, Debug, Clone)]
#[structopt(name = "mqcli", about = "Command line publish/subscribe clients for MQTT")]
enum Command {
    /// Publish a message to a topic
    #[structopt(name = "pub")]
    Pub(PubOpts),
    /// Subscribe to topics and print received messages
    #[structopt(name = "sub")]
    Sub(SubOpts),
}

#[derive(StructOpt, Debug, Clone)]
struct ConnectOpts {
    /// Broker host
    #[structopt(name = "host", long, default_value = "localhost")]
    host: String,

    /// Broker port
    #[structopt(name = "port", short = "p", long, default_value = "1883")]
    port: u16,

    /// Client id, defaults to a generated one
    #[structopt(name = "id", short = "i", long)]
    id: Option<String>,

    /// Client id prefix, completed with the process id
    #[structopt(name = "id-prefix", short = "I", long)]
    id_prefix: Option<String>,

    /// Keep alive interval in seconds
    #[structopt(name = "keepalive", short = "k", long, default_value = "60")]
    keepalive: u16,

    /// Continue the session across connections, requires an explicit client id
    #[structopt(name = "disable-clean-session", short = "c", long)]
    disable_clean_session: bool,

    /// Username for authentication
    #[structopt(name = "username", short = "u", long)]
    username: Option<String>,

    /// Password for authentication
    #[structopt(name = "password", short = "P", long)]
    password: Option<String>,

    /// Topic the broker publishes on our behalf if the connection drops
    #[structopt(name = "will-topic", long)]
    will_topic: Option<String>,

    /// Last-will payload
    #[structopt(name = "will-payload", long)]
    will_payload: Option<String>,

    /// Last-will QoS
    #[structopt(name = "will-qos", long, default_value = "0")]
    will_qos: u8,

    /// Retain the last will
    #[structopt(name = "will-retain", long)]
    will_retain: bool,

    /// Maximum number of inflight QoS 1/2 messages
    #[structopt(name = "max-inflight", long, default_value = "20")]
    max_inflight: u16,

    /// Enable debug logging
    #[structopt(name = "debug", short = "d", long)]
    debug: bool,

    /// Suppress the client's own diagnostics
    #[structopt(name = "quiet", long)]
    quiet: bool,
}

#[derive(StructOpt, Debug, Clone)]
struct PubOpts {
    #[structopt(flatten)]
    connect: ConnectOpts,

    /// Topic to publish to
    #[structopt(name = "topic", short = "t", long)]
    topic: String,

    /// Message payload given on the command line
    #[structopt(name = "message", short = "m", long)]
    message: Option<String>,

    /// Read the payload from a file
    #[structopt(name = "file", short = "f", long)]
    file: Option<PathBuf>,

    /// Read the whole of standard input as a single payload
    #[structopt(name = "stdin-whole", short = "s", long)]
    stdin_whole: bool,

    /// Publish each line of standard input as a separate message
    #[structopt(name = "stdin-line", short = "l", long)]
    stdin_line: bool,

    /// Publish a zero-length payload
    #[structopt(name = "null-message", short = "n", long)]
    null_message: bool,

    /// Quality of service
    #[structopt(name = "qos", short = "q", long, default_value = "0")]
    qos: u8,

    /// Ask the broker to retain the message
    #[structopt(name = "retain", short = "r", long)]
    retain: bool,

    /// Publish the message this many times
    #[structopt(name = "repeat", long, default_value = "1")]
    repeat: u32,

    /// Delay between repeated publishes, in (fractional) seconds
    #[structopt(name = "repeat-delay", long, default_value = "0")]
    repeat_delay: RepeatDelay,
}

#[derive(StructOpt, Debug, Clone)]
struct SubOpts {
    #[structopt(flatten)]
    connect: ConnectOpts,

    /// Topic to subscribe to, may be given multiple times
    #[structopt(name = "topic", short = "t", long)]
    topic: Vec<String>,

    /// Suppress messages whose topic matches this pattern, may be given
    /// multiple times
    #[structopt(name = "filter-out", short = "T", long)]
    filter_out: Vec<String>,

    /// Unsubscribe from this topic right after subscribing
    #[structopt(name = "unsubscribe", short = "U", long)]
    unsubscribe: Vec<String>,

    /// Quality of service to request
    #[structopt(name = "qos", short = "q", long, default_value = "0")]
    qos: u8,

    /// Disconnect right after the subscription is acknowledged
    #[structopt(name = "exit-after-sub", short = "E", long)]
    exit_after_sub: bool,

    /// Drop retained messages instead of printing them
    #[structopt(name = "no-retain", short = "R", long)]
    no_retain: bool,

    /// Only print retained messages, exit at the first live one
    #[structopt(name = "retained-only", long)]
    retained_only: bool,

    /// Clear the broker's retained message on every topic one arrives on
    #[structopt(name = "remove-retained", long)]
    remove_retained: bool,

    /// Print the topic alongside the payload
    #[structopt(name = "verbose", short = "v", long)]
    verbose: bool,

    /// Do not append a newline to printed messages
    #[structopt(name = "no-eol", short = "N", long)]
    no_eol: bool,

    /// Disconnect after this many messages, 0 for unlimited
    #[structopt(name = "count", short = "C", long, default_value = "0")]
    count: u32,

    /// Output format string
    #[structopt(name = "format", short = "F", long)]
    format: Option<String>,

    /// Disconnect after this many seconds, 0 to wait forever
    #[structopt(name = "timeout", short = "W", long, default_value = "0")]
    timeout: u64,
}

fn connect_config(opts: ConnectOpts) -> mqcli::Result<SessionConfig> {
    Ok(SessionConfig {
        client_id: opts.id,
        id_prefix: opts.id_prefix,
        host: opts.host,
        port: opts.port,
        keepalive: opts.keepalive,
        clean_session: !opts.disable_clean_session,
        max_inflight: opts.max_inflight,
        username: opts.username,
        password: opts.password,
        will_topic: opts.will_topic,
        will_payload: opts.will_payload.map(String::into_bytes),
        will_qos: QoS::try_from(opts.will_qos)?,
        will_retain: opts.will_retain,
        quiet: opts.quiet,
        ..Default::default()
    })
}

fn pub_config(opts: PubOpts) -> mqcli::Result<SessionConfig> {
    let mut cfg = connect_config(opts.connect)?;
    cfg.topic = Some(opts.topic);
    cfg.qos = QoS::try_from(opts.qos)?;
    cfg.retain = opts.retain;
    cfg.repeat_count = opts.repeat;
    cfg.repeat_delay = opts.repeat_delay;

    let selected = [
        opts.message.is_some(),
        opts.file.is_some(),
        opts.stdin_whole,
        opts.stdin_line,
        opts.null_message,
    ];
    if selected.iter().filter(|on| **on).count() > 1 {
        return Err(
            ClientError::Config("Only one type of message can be sent at once.".into()).into()
        );
    }

    if let Some(message) = opts.message {
        cfg.message = message.into_bytes();
        cfg.pub_mode = Some(PubMode::Message);
    } else if let Some(path) = opts.file {
        cfg.message =
            fs::read(&path).with_context(|| format!("Unable to open file \"{}\"", path.display()))?;
        cfg.pub_mode = Some(PubMode::File);
    } else if opts.stdin_whole {
        let mut payload = Vec::new();
        io::stdin().read_to_end(&mut payload).context("Error reading standard input")?;
        cfg.message = payload;
        cfg.pub_mode = Some(PubMode::StdinWhole);
    } else if opts.stdin_line {
        cfg.pub_mode = Some(PubMode::StdinLine);
    } else if opts.null_message {
        cfg.pub_mode = Some(PubMode::Null);
    }
    if cfg.message.len() > MAX_PAYLOAD {
        return Err(ClientError::PayloadTooLarge.into());
    }
    Ok(cfg)
}

fn sub_config(opts: SubOpts) -> mqcli::Result<SessionConfig> {
    let mut cfg = connect_config(opts.connect)?;
    cfg.topics = opts.topic;
    cfg.filter_outs = opts.filter_out;
    cfg.unsub_topics = opts.unsubscribe;
    cfg.qos = QoS::try_from(opts.qos)?;
    cfg.exit_after_sub = opts.exit_after_sub;
    cfg.no_retain = opts.no_retain;
    cfg.retained_only = opts.retained_only;
    cfg.remove_retained = opts.remove_retained;
    cfg.verbose = opts.verbose;
    cfg.eol = !opts.no_eol;
    cfg.msg_count = opts.count;
    cfg.format = opts.format;
    cfg.timeout = opts.timeout;
    Ok(cfg)
}

async fn run(cmd: Command) -> mqcli::Result<()> {
    let (kind, cfg) = match cmd {
        Command::Pub(opts) => (ClientKind::Pub, pub_config(opts)?),
        Command::Sub(opts) => (ClientKind::Sub, sub_config(opts)?),
    };
    cfg.validate(kind)?;

    let (engine, events) = bridge::connect(&cfg);
    let session = SessionState::new(kind, cfg)?;

    //ctrl-c requests a clean disconnect at the next safe point
    let handle = session.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });

    session.run(Arc::new(engine), events).await
}

#[tokio::main]
async fn main() {
    let cmd = Command::from_args();

    //init log
    let debug = match &cmd {
        Command::Pub(opts) => opts.connect.debug,
        Command::Sub(opts) => opts.connect.debug,
    };
    let level = if debug { log::LevelFilter::Debug } else { log::LevelFilter::Warn };
    SimpleLogger::new().with_level(level).init().expect("logger init failed");

    if let Err(err) = run(cmd).await {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}
