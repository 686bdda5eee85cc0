use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;

use watchprompt::{
    cli::Cli,
    reload::{spawn_config_watch, ConfigReloader, RELOAD_DELAY},
    Control, PromptSink, TriggerConfig, TriggerService,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = cli.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    cli.setup_logging();

    let config = cli.load_config()?;
    let watch_path = cli.get_watch_path().canonicalize()?;
    tracing::info!("Starting WatchPrompt on: {}", watch_path.display());

    let sink = PromptSink::new(&watch_path, &config)?.with_color(!cli.no_color);
    let mut service = TriggerService::new(&watch_path, config, Arc::new(sink))?;
    service.start()?;

    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let shutdown_tx = control_tx.clone();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(Control::Shutdown);
    })?;

    let reload_task = match &cli.config {
        Some(path) => {
            let flags = cli.clone();
            let reloader = ConfigReloader::new(
                path,
                Box::new(move |config: TriggerConfig| flags.apply_overrides(config)),
                control_tx.clone(),
            );
            Some(spawn_config_watch(reloader, RELOAD_DELAY)?)
        }
        None => None,
    };

    let stats = service.run(control_rx).await;

    if let Some(task) = reload_task {
        task.abort();
    }

    tracing::info!(
        "Processed {} events: {} scheduled, {} ignored, {} unmatched, {} failed dispatches, {} reloads",
        stats.events,
        stats.scheduled,
        stats.ignored,
        stats.unmatched,
        stats.failed_deliveries,
        stats.reconfigurations
    );

    Ok(())
}
