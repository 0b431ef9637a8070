//! Config command: print the effective configuration.

use anyhow::{Context, bail};
use plughost_config::ResolvedConfig;

use crate::theme::Theme;

/// Print `resolved` as `toml` or `json`, followed by the merged files.
pub(crate) fn show(resolved: &ResolvedConfig, format: &str) -> anyhow::Result<()> {
    println!("{}", render(resolved, format)?);

    if resolved.loaded_files.is_empty() {
        println!("{}", Theme::dimmed("# built-in defaults only"));
    } else {
        println!("{}", Theme::dimmed("# merged over defaults:"));
        for file in &resolved.loaded_files {
            println!("{}", Theme::dimmed(&format!("#   {file}")));
        }
    }
    Ok(())
}

fn render(resolved: &ResolvedConfig, format: &str) -> anyhow::Result<String> {
    match format {
        "toml" => Ok(resolved.config.to_toml()?),
        "json" => serde_json::to_string_pretty(&resolved.config)
            .context("failed to encode configuration"),
        other => bail!("unknown format '{other}' (expected toml or json)"),
    }
}

#[cfg(test)]
mod tests {
    use plughost_config::Config;

    use super::*;

    fn defaults() -> ResolvedConfig {
        ResolvedConfig {
            config: Config::default(),
            loaded_files: Vec::new(),
        }
    }

    #[test]
    fn renders_both_formats() {
        let resolved = defaults();
        assert!(render(&resolved, "toml").unwrap().contains("[runtime]"));
        let json: serde_json::Value =
            serde_json::from_str(&render(&resolved, "json").unwrap()).unwrap();
        assert!(json.get("sandbox").is_some());
    }

    #[test]
    fn rejects_unknown_format() {
        assert!(render(&defaults(), "yaml").is_err());
    }
}
