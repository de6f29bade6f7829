//! Purpose: `rksok` server entry point.
//! Role: Binary crate root; parses args, installs logging, runs the server until a signal.
//! Invariants: Startup errors are emitted on stderr (text on a TTY, JSON otherwise).
//! Invariants: Process exit code is derived from `api::to_exit_code`; usage errors exit 2.
//! Invariants: The server runs on a current-thread runtime; connections interleave cooperatively.
use std::error::Error as StdError;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};

use rksok::api::{
    AuthorityAddr, Error, ErrorKind, PROTOCOL, ResponseWord, ServeConfig, to_exit_code,
};
use rksok::serve::init_tracing;

const USAGE_HINT: &str = "Run as `rksok SERVER PORT`, where SERVER and PORT are the validation server's host and port, e.g. `rksok vragi-vezde.to.digital 51624`.";

fn main() {
    let exit_code = match run(std::env::args_os()) {
        Ok(code) => code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run<I>(args: I) -> Result<i32, (Error, ColorMode)>
where
    I: IntoIterator<Item = OsString>,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                return Ok(0);
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint(USAGE_HINT),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    init_tracing(color_mode.use_color(io::stderr().is_terminal()));
    let config = cli.into_config();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            (
                Error::new(ErrorKind::Internal)
                    .with_message("failed to start runtime")
                    .with_source(err),
                color_mode,
            )
        })?;
    runtime
        .block_on(rksok::serve::serve(config))
        .map_err(add_hint)
        .map_err(|err| (err, color_mode))?;
    Ok(0)
}

#[derive(Parser, Debug)]
#[command(
    name = "rksok",
    version,
    about = "RKSOK phonebook server",
    long_about = r#"RKSOK phonebook server.

Every ЗОПИШИ / ОТДОВАЙ / УДОЛИ request is first checked with the validation
server given by SERVER and PORT; approved requests are applied to a
file-backed phonebook (one file per name)."#,
    after_help = r#"EXAMPLES
  $ rksok vragi-vezde.to.digital 51624
  $ rksok localhost 9000 --bind 127.0.0.1:8888 --store-dir /var/lib/rksok
  $ RUST_LOG=debug rksok vragi-vezde.to.digital 51624"#
)]
struct Cli {
    #[arg(value_name = "SERVER", help = "Validation server host")]
    authority_host: String,
    #[arg(value_name = "PORT", help = "Validation server port")]
    authority_port: u16,
    #[arg(long, default_value = "0.0.0.0:8888", help = "Address to listen on")]
    bind: SocketAddr,
    #[arg(
        long,
        default_value = rksok::core::store::DEFAULT_STORE_DIR,
        help = "Directory holding one file per phonebook record",
        value_hint = ValueHint::DirPath
    )]
    store_dir: PathBuf,
    #[arg(long, default_value_t = 5000, help = "Deadline for reading a client request, in ms")]
    timeout_ms: u64,
    #[arg(
        long,
        default_value_t = 5000,
        help = "Deadline for the validation server round trip, in ms"
    )]
    authority_timeout_ms: u64,
    #[arg(
        long,
        default_value_t = rksok::core::frame::DEFAULT_MAX_FRAME_BYTES,
        help = "Largest request or verdict accepted, in bytes"
    )]
    max_frame_bytes: usize,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,
}

impl Cli {
    fn into_config(self) -> ServeConfig {
        let mut config = ServeConfig::new(AuthorityAddr {
            host: self.authority_host,
            port: self.authority_port,
        });
        config.bind = self.bind;
        config.store_dir = self.store_dir;
        config.client_timeout = Duration::from_millis(self.timeout_ms);
        config.authority_timeout = Duration::from_millis(self.authority_timeout_ms);
        config.max_frame_bytes = self.max_frame_bytes;
        config
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

fn add_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Busy => {
            err.with_hint("Another rksok process owns this store. Stop it or use --store-dir.")
        }
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check --store-dir permissions or pick a writable location.",
        ),
        ErrorKind::Io => err.with_hint(
            "I/O error. Check the bind address, the store path, and disk space.",
        ),
        ErrorKind::Internal => err.with_hint(
            "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and RUST_LOG=debug.",
        ),
        _ => err,
    }
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Timeout => "timed out".to_string(),
        ErrorKind::Malformed => "malformed request".to_string(),
        ErrorKind::MalformedVerdict => "malformed verdict".to_string(),
        ErrorKind::Unreachable => "validation server unreachable".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

/// Status line a client receives when a connection fails with this kind.
fn client_reply(kind: ErrorKind) -> Option<String> {
    match kind {
        ErrorKind::Timeout
        | ErrorKind::Malformed
        | ErrorKind::MalformedVerdict
        | ErrorKind::Unreachable
        | ErrorKind::Io
        | ErrorKind::Permission => {
            Some(format!("{} {PROTOCOL}", ResponseWord::Incorrect.as_str()))
        }
        ErrorKind::Internal | ErrorKind::Usage | ErrorKind::Busy => None,
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(reply) = client_reply(err.kind()) {
        inner.insert("client_reply".to_string(), json!(reply));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(reply) = client_reply(err.kind()) {
        lines.push(format!(
            "{} {reply}",
            colorize_label("client reply:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
