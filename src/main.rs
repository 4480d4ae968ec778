use std::future::Future;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kubectl_ssh::{
    cli::Args,
    config::Config,
    error::{SshError, EXIT_GENERIC_FAILURE},
    k8s::{resolve_node, K8sClient, NameGenerator},
    session::{SessionManager, SessionSettings, TerminalStreams},
};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Logs go to stderr; stdout belongs to the session
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let code = match run(args).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            err.downcast_ref::<SshError>()
                .map_or(EXIT_GENERIC_FAILURE, SshError::exit_code)
        }
    };

    // Exit explicitly: a pending read on stdin would otherwise hold the
    // runtime open until the next keystroke.
    std::process::exit(code);
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load()?;
    args.apply_to(&mut config);
    tracing::debug!(?config, "Configuration loaded");

    let client = K8sClient::connect(&args.connection_options()).await?;
    let node = resolve_node(&client, args.node.as_deref(), args.label.as_deref()).await?;

    let mut manager = SessionManager::new(
        client,
        SessionSettings::from(&config),
        NameGenerator::new(config.name_prefix.clone()),
    );

    if args.dry_run {
        let namespace = manager.cluster().namespace().to_string();
        println!("{}", manager.render_session_pod(&node, &namespace)?);
        return Ok(());
    }

    // Register before the pod is created so no signal goes unhandled
    let shutdown = shutdown_signal().context("failed to install signal handlers")?;
    manager
        .run(&node, TerminalStreams::stdio(), shutdown)
        .await?;
    Ok(())
}

/// Listen for SIGINT, SIGTERM and SIGHUP. The listeners are registered on
/// return; the future resolves on the first signal.
#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => {},
            _ = terminate.recv() => {},
            _ = hangup.recv() => {},
        }
    })
}

#[cfg(windows)]
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    let mut ctrl_c = tokio::signal::windows::ctrl_c()?;
    Ok(async move {
        ctrl_c.recv().await;
    })
}
