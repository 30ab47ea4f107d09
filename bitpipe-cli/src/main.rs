// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use futures::future::{BoxFuture, FutureExt};
use std::{
  net::SocketAddr,
  path::{Path, PathBuf},
  sync::Arc,
};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use bitpipe::{
  pump::{Pump, PumpError},
  server::{HandlerError, HandlerErrorPolicy, MessageHandler, Server, ServerConfig},
  shutdown::ShutdownMonitor,
};

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("capture")
        .about("Accept connections up to a limit and append every received message to a file")
        .arg(
          Arg::new("port")
            .help("Port to listen on")
            .validator(validate_port)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("output")
            .help("File receiving captured messages; may be /dev/null")
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("max-connections")
            .long("max-connections")
            .short('m')
            .validator(validate_max_connections)
            .default_value("2")
            .takes_value(true),
        )
        .arg(
          Arg::new("drop-on-handler-error")
            .long("drop-on-handler-error")
            .help("Drop a connection when its handler reports failure")
            .takes_value(false),
        ),
    )
    .subcommand(
      Command::new("pipe")
        .about("Connect to a remote endpoint and pump stdin/stdout through the connection")
        .arg(
          Arg::new("target")
            .help("Remote address, e.g. 127.0.0.1:8080")
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("bitpipe-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn validate_port(raw: &str) -> Result<(), String> {
  raw.parse::<u16>().map(|_| ()).map_err(|e| e.to_string())
}

fn validate_max_connections(raw: &str) -> Result<(), String> {
  match raw.parse::<usize>() {
    Ok(0) => Err(String::from("must allow at least one connection")),
    Ok(_) => Ok(()),
    Err(e) => Err(e.to_string()),
  }
}

fn validate_socketaddr(raw: &str) -> Result<(), String> {
  raw
    .parse::<SocketAddr>()
    .map(|_| ())
    .map_err(|e| e.to_string())
}

#[derive(Debug, Clone)]
pub struct CaptureArgs {
  pub port: u16,
  pub output: PathBuf,
  pub max_connections: usize,
  pub drop_on_handler_error: bool,
}

#[derive(Debug, Clone)]
pub struct PipeArgs {
  pub target: SocketAddr,
}

fn capture_arg_handling(args: &ArgMatches) -> Result<CaptureArgs> {
  Ok(CaptureArgs {
    port: args.value_of("port").unwrap().parse()?,
    output: PathBuf::from(args.value_of("output").unwrap()),
    max_connections: args.value_of("max-connections").unwrap().parse()?,
    drop_on_handler_error: args.is_present("drop-on-handler-error"),
  })
}

fn pipe_arg_handling(args: &ArgMatches) -> Result<PipeArgs> {
  Ok(PipeArgs {
    target: args.value_of("target").unwrap().parse()?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("capture", opts) => {
      let args = capture_arg_handling(opts)?;
      tracing::info!("Running capture server with config {:?}", args);
      capture_main(args).await
    }
    ("pipe", opts) => {
      let args = pipe_arg_handling(opts)?;
      tracing::info!("Running pipe client with config {:?}", args);
      pipe_main(args).await
    }
    (_, _) => unreachable!(),
  }
}

/// Appends every delivered message to the output file, serialized through a
/// mutex since deliveries from different connections may interleave.
struct CaptureHandler {
  output: Mutex<tokio::fs::File>,
}

impl CaptureHandler {
  async fn create(path: &Path) -> Result<Arc<CaptureHandler>> {
    let output = tokio::fs::File::create(path)
      .await
      .context("Failed opening output file")?;
    Ok(Arc::new(CaptureHandler {
      output: Mutex::new(output),
    }))
  }

  async fn flush(&self) -> Result<()> {
    self
      .output
      .lock()
      .await
      .flush()
      .await
      .context("Failed flushing output file")
  }
}

impl MessageHandler for CaptureHandler {
  fn handle_message<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<(), HandlerError>> {
    async move {
      let mut output = self.output.lock().await;
      output
        .write_all(message)
        .await
        .map_err(|e| HandlerError::from(anyhow::Error::new(e)))?;
      Ok(())
    }
    .boxed()
  }
}

async fn capture_main(args: CaptureArgs) -> Result<()> {
  let monitor = ShutdownMonitor::register().context("Failed registering termination handler")?;
  let handler = CaptureHandler::create(&args.output).await?;

  let mut config = ServerConfig::wildcard(args.port, args.max_connections);
  if args.drop_on_handler_error {
    config.handler_error_policy = HandlerErrorPolicy::DropConnection;
  }
  let server = Arc::new(
    Server::bind(config, Arc::clone(&handler))
      .await
      .context("Failed binding capture server")?,
  );

  let monitor_task = monitor.monitor({
    let server = Arc::clone(&server);
    move || server.request_shutdown()
  });

  let run_result = server.run().await;
  server.shutdown().await;
  monitor_task.abort();
  let _cancelled = monitor_task.await;

  handler.flush().await?;
  run_result.context("Capture server terminated abnormally")?;
  Ok(())
}

async fn pipe_main(args: PipeArgs) -> Result<()> {
  let stream = tokio::net::TcpStream::connect(args.target)
    .await
    .context("Failed connecting to target")?;
  let (read_half, write_half) = stream.into_split();
  let send = Pump::start(tokio::io::stdin(), write_half);
  let receive = Pump::start(read_half, tokio::io::stdout());

  // The session ends when the remote stops talking; stdin may still be
  // parked in a read, so the send direction is cancelled rather than joined.
  let received = receive.join().await.context("Receive direction failed")?;
  match send.cancel_and_join().await {
    Ok(sent) => tracing::debug!(sent, received, "pipe session complete"),
    Err(PumpError::Cancelled) => {
      tracing::debug!(received, "send direction cancelled at teardown")
    }
    Err(error) => return Err(anyhow::Error::new(error)).context("Send direction failed"),
  }
  Ok(())
}
