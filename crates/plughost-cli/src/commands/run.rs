//! Run command: host plugins until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use plughost_config::Config;
use plughost_runtime::PluginRuntime;
use tracing::info;

use crate::theme::Theme;

/// Start the runtime over the configured plugin directories plus
/// `extra_dirs`, and stop it on Ctrl-C.
pub(crate) async fn run(mut config: Config, extra_dirs: Vec<PathBuf>) -> anyhow::Result<()> {
    for dir in extra_dirs {
        if !config.runtime.plugin_dirs.contains(&dir) {
            config.runtime.plugin_dirs.push(dir);
        }
    }

    let runtime = PluginRuntime::builder()
        .config(config)
        .build()
        .context("failed to build the plugin runtime")?;
    runtime.start().await.context("failed to start the plugin runtime")?;

    println!("\n{}", Theme::header("Plugins"));
    println!("{}", Theme::separator());
    let statuses = runtime.statuses();
    if statuses.is_empty() {
        println!("  {}", Theme::dimmed("(none loaded)"));
    }
    for snapshot in &statuses {
        println!(
            "  {} {} {}",
            snapshot.id,
            Theme::dimmed(&format!("gen {}", snapshot.generation)),
            Theme::status(snapshot.status.as_str())
        );
    }
    println!("\n{}", Theme::dimmed("Press Ctrl-C to stop."));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("interrupt received");
    runtime.shutdown().await;
    println!("{}", Theme::success("Stopped."));
    Ok(())
}
