use clap::{Args, Parser, Subcommand};

use remote_serve::remote::{app, config::LoggingConfig, logging};

#[derive(Debug, Parser)]
#[command(
    name = "remote-serve",
    version,
    about = "Expose a private port through an authenticated reverse tunnel"
)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct LogArgs {
    /// trace | debug | info | warn | error. RUST_LOG takes precedence.
    #[arg(long, global = true, env = "REMOTE_SERVE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// text | json
    #[arg(long, global = true, env = "REMOTE_SERVE_LOG_FORMAT", default_value = "text")]
    log_format: String,

    /// stderr | stdout | discard | <file path>
    #[arg(long, global = true, env = "REMOTE_SERVE_LOG_OUTPUT", default_value = "stderr")]
    log_output: String,

    /// Include source file and line in log records.
    #[arg(long, global = true)]
    log_source: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept tunnel clients and expose the ports they request.
    Server {
        /// Control link listen address.
        #[arg(long, env = "REMOTE_SERVE_LISTEN", default_value = ":4200")]
        listen: String,

        /// Allowed clients as `key:secret` pairs separated by `;`.
        #[arg(long, env = "REMOTE_SERVE_AUTHS", default_value = "user:pass;guest:guest")]
        auths: String,
    },
    /// Expose a local service through a tunnel server.
    Client {
        /// remote://<key>:<secret>@<host>:<port>/<base64url(exposed port)>
        #[arg(long, env = "REMOTE_SERVE_URL")]
        url: String,

        /// Local address every tunneled connection is relayed to.
        #[arg(long, env = "REMOTE_SERVE_FORWARD")]
        forward: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logging = logging::init(&LoggingConfig {
        level: cli.log.log_level,
        format: cli.log.log_format,
        output: cli.log.log_output,
        add_source: cli.log.log_source,
    })?;

    match cli.command {
        Command::Server { listen, auths } => app::run_server(&listen, &auths).await,
        Command::Client { url, forward } => app::run_client(&url, &forward).await,
    }
}
