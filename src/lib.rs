// src/lib.rs

pub mod attach;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fs;
pub mod logging;
pub mod session;
pub mod target;
pub mod tree;
pub mod types;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command, RunArgs};
use crate::config::{ConfigFile, default_config_path, load_and_validate};
use crate::engine::{
    Args, CellOutcome, CellStatus, DispatchOptions, Dispatcher, TerminalPrompter,
};
use crate::fs::RealFileSystem;
use crate::session::{MultiplexerOptions, SessionMultiplexer, SessionSummary};
use crate::tree::{Resolver, Tree, isolate};
use crate::types::FrontendKind;

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);

    match args.command {
        Command::Run(run) => run_action(&config_path, run).await,
        Command::Check => {
            let cfg = load_and_validate(&config_path)?;
            let tree = Arc::new(cfg.build_tree()?);
            print_check(&cfg, &tree)
        }
        Command::Attach { socket, session } => {
            match attach::attach_terminal(&socket, session).await? {
                attach::AttachOutcome::Finished(code) => {
                    eprintln!("session {session} finished with exit code {code}");
                }
                attach::AttachOutcome::Detached => eprintln!("detached from session {session}"),
            }
            Ok(())
        }
        Command::Sessions { socket } => {
            let sockets = match socket {
                Some(one) => vec![one],
                None => {
                    let dir = session_socket_dir(&config_path);
                    attach::discover_sockets(&RealFileSystem, &dir)?
                }
            };
            if sockets.is_empty() {
                println!("no running fanout servers");
            }
            for socket in sockets {
                match attach::list_sessions(&socket).await {
                    Ok(sessions) => print_sessions(&socket, &sessions),
                    Err(err) => warn!(socket = %socket.display(), error = %err, "server not reachable"),
                }
            }
            Ok(())
        }
        Command::Signal {
            socket,
            session,
            signal,
        } => {
            attach::send_signal(&socket, session, signal).await?;
            info!(%session, ?signal, "signal sent");
            Ok(())
        }
    }
}

async fn run_action(config_path: &Path, run: RunArgs) -> Result<()> {
    let cfg = load_and_validate(config_path)?;
    let tree = Arc::new(cfg.build_tree()?);
    let settings = &cfg.settings;

    let multiplexer = Arc::new(SessionMultiplexer::new(MultiplexerOptions {
        backlog_bytes: settings.backlog_bytes,
        connect_timeout: settings.connect_timeout,
        ..MultiplexerOptions::default()
    }));

    let cancel = CancellationToken::new();

    let socket_dir = settings
        .socket_dir
        .clone()
        .unwrap_or_else(attach::default_socket_dir);
    let socket = run
        .socket
        .clone()
        .unwrap_or_else(|| attach::socket_path(&socket_dir, std::process::id()));
    let server = attach::AttachServer::bind(socket.clone(), Arc::clone(&multiplexer))?;
    info!(socket = %server.socket_path().display(), "attach server listening");
    let server_task = tokio::spawn(server.serve(cancel.child_token()));

    let frontend_kind = if run.headless {
        FrontendKind::Headless
    } else {
        settings.frontend
    };
    let frontend = session::frontend::detect(frontend_kind);
    debug!(frontend = ?frontend.kind(), "front-end selected");

    let local_terminal = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
    let options = DispatchOptions {
        fail_fast: run.fail_fast || settings.fail_fast,
        sandbox: run.sandbox || settings.sandbox,
        max_parallel: settings.max_parallel,
        frontend_timeout: settings.frontend_timeout,
        local_terminal,
    };

    // Ctrl-C → cancel every running cell.
    {
        let cancel = cancel.clone();
        let multiplexer = Arc::clone(&multiplexer);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("interrupted; cancelling running cells");
            cancel.cancel();
            multiplexer.shutdown();
        });
    }

    let mut dispatcher = Dispatcher::new(tree, Arc::clone(&multiplexer))
        .with_options(options)
        .with_frontend(frontend)
        .with_socket(socket)
        .with_cancel_token(cancel.clone());
    if local_terminal && !run.headless {
        dispatcher = dispatcher.with_prompter(Arc::new(TerminalPrompter::new()));
    }

    let result = dispatcher
        .invoke_path(&run.path, &run.action, Args::parse(&run.args))
        .await;

    cancel.cancel();
    multiplexer.shutdown();
    if let Err(e) = server_task.await {
        warn!(error = %e, "attach server task panicked");
    }

    let result = result?;
    let total = result.outcomes().len();
    for outcome in result.outcomes() {
        print_outcome(outcome);
    }

    let failed = result.failures().count();
    if failed > 0 {
        bail!("{failed} of {total} cell(s) did not succeed");
    }
    Ok(())
}

fn session_socket_dir(config_path: &Path) -> PathBuf {
    // Sessions listing works without a config; it only informs the directory.
    load_and_validate(config_path)
        .ok()
        .and_then(|cfg| cfg.settings.socket_dir)
        .unwrap_or_else(attach::default_socket_dir)
}

fn print_outcome(outcome: &CellOutcome) {
    let targets = outcome.targets.join(",");
    match &outcome.status {
        CellStatus::Succeeded(out) => {
            println!("[{}] ok ({targets})", outcome.label);
            let text = out.output.trim_end();
            if !text.is_empty() {
                println!("{text}");
            }
        }
        CellStatus::Failed(err) => {
            println!("[{}] FAILED ({targets}): {err}", outcome.label);
        }
        CellStatus::Cancelled => println!("[{}] cancelled ({targets})", outcome.label),
    }
}

fn print_sessions(socket: &Path, sessions: &[SessionSummary]) {
    println!("{}", socket.display());
    if sessions.is_empty() {
        println!("  (no sessions)");
    }
    for s in sessions {
        let exit = s
            .exit_code
            .map(|c| format!(" exit={c}"))
            .unwrap_or_default();
        println!(
            "  {:>4}  {:<10} {:<16} {:<20} {}{exit}",
            s.id, s.state, s.target, s.label, s.command
        );
    }
}

/// Print every node with its resolved roles, cells and actions.
fn print_check(cfg: &ConfigFile, tree: &Arc<Tree>) -> Result<()> {
    println!("fanout check");
    println!("  targets ({}): {:?}", cfg.target.len(), cfg.target.keys().collect::<Vec<_>>());
    println!();

    let resolver = Resolver::new(Arc::clone(tree));
    for id in tree.ids() {
        let node = tree.node(id);
        println!("node {}", node.display_name());
        let roles = resolver.resolve(id)?;
        for (role, slugs) in roles.slugs() {
            println!("    role {role}: {slugs:?}");
        }
        if let Some(role) = node.isolation_role() {
            let cells = isolate(tree, &resolver, id)?;
            let labels: Vec<String> = cells.iter().map(|c| c.label(tree)).collect();
            println!("    isolate {role}: {} cell(s) {labels:?}", cells.len());
        }
        for action in node.actions() {
            let marker = if action.interactive { " (interactive)" } else { "" };
            println!("    action {}{marker}", action.name);
        }
    }

    debug!("check complete (no execution)");
    Ok(())
}
