use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;

use getopts::{Matches, Options};
use queryexporter::{Config, ExporterBuilder, DEFAULT_NAMESPACE, DEFAULT_TELEMETRY_PATH};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "config.yaml";
const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9696";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let program = &args[0];
    let opts = opts();

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{f}");
            print_usage(program, &opts);
            return ExitCode::FAILURE;
        }
    };

    if matches.opt_present("help") {
        print_usage(program, &opts);
        return ExitCode::SUCCESS;
    }
    if matches.opt_present("version") {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_logging(&matches) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(matches: &Matches) -> Result<(), String> {
    let level = matches.opt_str("log.level").unwrap_or_else(|| "info".to_owned());
    let filter = EnvFilter::try_new(&level).map_err(|e| format!("invalid log level {level:?}: {e}"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_level(true);

    match matches.opt_str("log.format").as_deref() {
        None | Some("text") => builder.with_ansi(true).try_init(),
        Some("json") => builder.json().try_init(),
        Some(other) => return Err(format!("unknown log format {other:?}, expected text or json")),
    }
    .map_err(|e| format!("failed to install logger: {e}"))
}

fn run(matches: &Matches) -> Result<(), Box<dyn std::error::Error>> {
    let path = matches.opt_str("config").unwrap_or_else(|| DEFAULT_CONFIG.to_owned());
    let config = Config::read_from_file(&path, matches.opt_present("expand-env"))?;

    if matches.opt_present("test") {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    let listen_address: SocketAddr = matches
        .opt_str("web.listen-address")
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_owned())
        .parse()?;
    let namespace = matches.opt_str("namespace").unwrap_or_else(|| DEFAULT_NAMESPACE.to_owned());
    let telemetry_path =
        matches.opt_str("web.telemetry-path").unwrap_or_else(|| DEFAULT_TELEMETRY_PATH.to_owned());

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let (_handle, exporter) = ExporterBuilder::new(config)
            .with_namespace(namespace)
            .with_http_listener(listen_address)
            .with_telemetry_path(telemetry_path)
            .build()?;
        info!(config = %path, "queryexporter started");

        tokio::select! {
            result = exporter => result?,
            () = shutdown_signal() => info!("received shutdown signal, exiting gracefully"),
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => error!(error = %e, "failed to listen for SIGTERM"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {program} [options]");
    print!("{}", opts.usage(&brief));
}

fn opts() -> Options {
    let mut opts = Options::new();

    opts.optopt("c", "config", "path of config file (default: config.yaml)", "PATH");
    opts.optflag(
        "",
        "expand-env",
        "expand environment variables in the config file, for reading secrets from the environment",
    );
    opts.optflag("t", "test", "print the validated config file and exit");
    opts.optopt("n", "namespace", "namespace for metrics (default: queryexporter)", "NAME");
    opts.optopt("", "web.listen-address", "address to listen on (default: 0.0.0.0:9696)", "ADDR");
    opts.optopt("", "web.telemetry-path", "path under which to expose metrics (default: /metrics)", "PATH");
    opts.optopt("", "log.level", "log filter, e.g. info or queryexporter=debug (default: info)", "FILTER");
    opts.optopt("", "log.format", "log output format: text or json (default: text)", "FORMAT");
    opts.optflag("v", "version", "print version information");
    opts.optflag("h", "help", "print this help menu");

    opts
}
