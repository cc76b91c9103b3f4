//! corral - single-application Wayland kiosk session host
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               Event Loop                    │
//! ├─────────────────────────────────────────────┤
//! │  signalfd (INT/TERM) ─┐                     │
//! │  client exit pipe ────┼─→ loop termination  │
//! │  compositor events ───┘                     │
//! ├─────────────────────────────────────────────┤
//! │  Bootstrap chain → TeardownStack (LIFO)     │
//! │  Supervisor: fork/exec the one client       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The process hosts exactly one client for exactly one session lifetime:
//! bring the compositor chain up, spawn the client, run until the client
//! exits or a termination signal arrives, then unwind everything in
//! reverse creation order and exit with the client's own status.

mod compositor;
mod config;
mod event;
mod output;
mod privileges;
mod server;
mod supervisor;

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use log::{error, info, warn};

use crate::compositor::headless::HeadlessCompositor;
use crate::config::PartialConfig;
use crate::event::{EventLoop, SignalBridge};
use crate::output::OutputPolicy;
use crate::server::{Server, SessionOptions};
use crate::supervisor::ChildProcess;

/// Parsed command line, or an early exit with a fixed code.
#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Run(CliArgs),
    Exit(u8),
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    /// `-d`: prefer server-side window decoration.
    server_decorations: bool,
    /// `-m`: explicit multi-output policy, overriding the config file.
    policy: Option<OutputPolicy>,
    /// `-s`: allow virtual-terminal switching.
    allow_vt_switch: bool,
    /// The client executable and its arguments.
    command: Vec<OsString>,
}

fn usage(out: &mut dyn Write, program: &str) {
    let _ = writeln!(
        out,
        "Usage: {program} [OPTIONS] [--] APPLICATION\n\
         \n\
         \x20-d\t Prefer server-side window decoration, when possible\n\
         \x20-h\t Display this help message\n\
         \x20-m extend Extend the display across all connected outputs (default)\n\
         \x20-m last Use only the last connected output\n\
         \x20-s\t Allow virtual-terminal switching\n\
         \x20-v\t Show the version number and exit\n\
         \n\
         \x20Use -- when you want to pass arguments to APPLICATION"
    );
}

fn parse_args(args: &[OsString]) -> Invocation {
    let program = args
        .first()
        .map(|arg| arg.to_string_lossy().into_owned())
        .unwrap_or_else(|| "corral".to_string());
    let mut cli = CliArgs::default();

    let mut index = 1;
    while index < args.len() {
        match args[index].to_str() {
            Some("-d") => cli.server_decorations = true,
            Some("-s") => cli.allow_vt_switch = true,
            Some("-v") => {
                println!("corral {}", env!("CARGO_PKG_VERSION"));
                return Invocation::Exit(0);
            }
            Some("-h") => {
                usage(&mut std::io::stdout(), &program);
                return Invocation::Exit(1);
            }
            Some("-m") => {
                index += 1;
                let Some(value) = args.get(index) else {
                    usage(&mut std::io::stderr(), &program);
                    return Invocation::Exit(1);
                };
                match value.to_str().and_then(OutputPolicy::from_name) {
                    Some(policy) => cli.policy = Some(policy),
                    None => warn!(
                        "ignoring unknown multi-output mode '{}'",
                        value.to_string_lossy()
                    ),
                }
            }
            Some("--") => {
                cli.command.extend(args[index + 1..].iter().cloned());
                break;
            }
            Some(flag) if flag.starts_with('-') => {
                usage(&mut std::io::stderr(), &program);
                return Invocation::Exit(1);
            }
            // First non-flag argument starts the client command.
            _ => {
                cli.command.extend(args[index..].iter().cloned());
                break;
            }
        }
        index += 1;
    }

    if cli.command.is_empty() {
        usage(&mut std::io::stderr(), &program);
        return Invocation::Exit(1);
    }
    Invocation::Run(cli)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<OsString> = std::env::args_os().collect();
    let cli = match parse_args(&args) {
        Invocation::Run(cli) => cli,
        Invocation::Exit(code) => return ExitCode::from(code),
    };

    match run_session(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_session(cli: CliArgs) -> Result<u8> {
    // The protocol requires the runtime directory; check before creating
    // any resource.
    if std::env::var_os("XDG_RUNTIME_DIR").is_none() {
        bail!("XDG_RUNTIME_DIR is not set in the environment");
    }

    privileges::drop_privileges()?;

    let config = PartialConfig::load_default();
    let policy = OutputPolicy::resolve(cli.policy, config.multi_output);
    info!("multi-output policy: {}", policy);

    let options = SessionOptions {
        output_policy: policy,
        prefer_server_decorations: cli.server_decorations,
        allow_vt_switch: cli.allow_vt_switch,
    };
    // Termination signals are blocked before the first subsystem exists;
    // one arriving mid-bootstrap stays pending until the loop runs.
    let mut signals =
        SignalBridge::install().context("Failed to install the termination signal bridge")?;

    let comp = HeadlessCompositor::new().context("Failed to initialize the compositor stack")?;
    let mut server =
        Server::new(Box::new(comp), &options).context("Failed to bootstrap the session")?;

    let mut event_loop: EventLoop<Server> = EventLoop::new();
    signals.register(&mut event_loop);
    server.register_event_source(&mut event_loop);

    // The spawned client finds the session through its environment.
    std::env::set_var("WAYLAND_DISPLAY", server.socket_name());
    info!("running on Wayland display {}", server.socket_name());
    if let Some(name) = server.legacy_display().map(str::to_owned) {
        std::env::set_var("DISPLAY", &name);
        info!("legacy display layer running on {}", name);
    }

    let mut child = match ChildProcess::spawn(&cli.command) {
        Ok(child) => child,
        Err(err) => {
            signals.unregister(&mut event_loop);
            server.shutdown();
            return Err(err.context("Failed to spawn the client"));
        }
    };
    let exit_source = child.register(&mut event_loop, |server: &mut Server| {
        server.return_app_code = true;
    });
    if exit_source.is_none() {
        warn!("client exit notification is missing; the loop will not stop when the client exits");
    }

    if let Err(err) = event_loop.run(&mut server) {
        warn!("event loop terminated abnormally: {}", err);
    }
    signals.unregister(&mut event_loop);

    // Disconnect clients before the blocking wait: a client that only
    // exits once its display is gone must not stall the reap. The reap
    // only blocks if the loop stopped for a reason other than the pipe
    // hangup.
    server.disconnect_clients();
    let app_code = child.reap();
    let code = if server.return_app_code {
        (app_code & 0xff) as u8
    } else {
        0
    };
    server.shutdown();
    Ok(code)
}
