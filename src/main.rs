use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use mtmd_chat::backend::llama::LlamaLoader;
use mtmd_chat::cancel::{self, CancellationContext, InterruptAction};
use mtmd_chat::cli::{run_chat, run_single_turn, Args, ExitStatus};
use mtmd_chat::logger;
use mtmd_chat::SessionController;

/// Forward Ctrl+C to the shared cancellation context.
async fn listen_for_interrupts(cancel: Arc<CancellationContext>) {
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Unable to listen for Ctrl+C: {e}");
            return;
        }
        match cancel.on_interrupt() {
            InterruptAction::StopGeneration => log::info!("Interrupt received, stopping generation"),
            InterruptAction::Interrupted => {
                log::info!("Interrupt received while idle");
                eprintln!("\nPress Ctrl+C again to exit");
            }
            InterruptAction::Terminate => {
                log::info!("Second interrupt, exiting");
                std::process::exit(ExitStatus::Interrupted.code());
            }
        }
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();

    let level = logger::resolve_level(args.log_level.as_deref());
    if let Err(e) = logger::setup_logging(&args.log_dir, level) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = args.resolve_config()?;
    log::info!("Starting mtmd-chat with model {}", config.model_path.display());

    let cancel = cancel::install();
    let signals = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("mtmd-chat-signals")
        .enable_all()
        .build()
        .context("Failed to start signal listener")?;
    signals.spawn(listen_for_interrupts(cancel.clone()));

    let mut session = SessionController::new(LlamaLoader::new(), config, cancel);
    if let Err(e) = session.load() {
        log::error!("Failed to load session: {e}");
        eprintln!("{e}");
        return Ok(e.exit_code());
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let status = match args.prompt.as_deref() {
        Some(prompt) if args.is_single_turn() => run_single_turn(&mut session, prompt, &args.media(), &mut out),
        _ => run_chat(&mut session, io::stdin().lock(), &mut out),
    };

    drop(session);
    cancel::teardown();
    signals.shutdown_background();
    log::info!("Exiting with status {status:?}");
    Ok(status.code())
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitStatus::Failure.code()
        }
    };
    std::process::exit(code);
}
