use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;
use sift_catalog::{Catalog, ResourceType};
use sift_download::{ArtifactFetcher, DownloadOptions, DownloadProgress, FetcherConfig};
use sift_health::ReadinessMonitor;
use sift_memory::compute_budget;
use sift_runtime::{estimated_footprint, scan_models_dir, RuntimeConfig};
use sift_system::{HostProbe, SystemProbe, GIB, MIB};
use tokio_util::sync::CancellationToken;

/// Shared state for a single CLI invocation.
pub struct Context {
    config: RuntimeConfig,
    catalog: Arc<Catalog>,
    probe: Arc<HostProbe>,
    fetcher: Arc<ArtifactFetcher>,
    json: bool,
}

impl Context {
    pub fn new(config: RuntimeConfig, json: bool) -> anyhow::Result<Self> {
        let catalog = Arc::new(Catalog::builtin());
        let probe = Arc::new(HostProbe::new());
        let fetcher_config = FetcherConfig {
            max_redirects: config.download.max_redirects,
            stall_timeout: config.download.stall_timeout(),
            ..FetcherConfig::default()
        };
        let fetcher = ArtifactFetcher::with_config(
            config.models_dir.clone(),
            catalog.clone(),
            probe.clone(),
            fetcher_config,
        )?;

        Ok(Self {
            config,
            catalog,
            probe,
            fetcher: Arc::new(fetcher),
            json,
        })
    }

    fn print_json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.1} GB", bytes as f64 / GIB as f64)
    } else {
        format!("{:.0} MB", bytes as f64 / MIB as f64)
    }
}

pub fn catalog(ctx: &Context, resource_type: Option<ResourceType>) -> anyhow::Result<()> {
    let entries: Vec<_> = ctx
        .catalog
        .entries()
        .iter()
        .filter(|e| resource_type.map_or(true, |ty| e.resource_type == ty))
        .collect();

    if ctx.json {
        return ctx.print_json(&entries);
    }
    for entry in entries {
        let selected = ctx.config.selected(entry.resource_type) == entry.name;
        println!(
            "{} {:<10} {:>8}  {}{}",
            if selected { "*" } else { " " },
            entry.resource_type.as_str(),
            format_bytes(entry.size_bytes),
            entry.name,
            entry
                .companion
                .as_ref()
                .map(|c| format!(" (+ {})", c.filename))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn models(ctx: &Context) -> anyhow::Result<()> {
    let models = scan_models_dir(&ctx.config.models_dir, &ctx.catalog)
        .await
        .with_context(|| format!("failed to scan {}", ctx.config.models_dir.display()))?;

    if ctx.json {
        return ctx.print_json(&models);
    }
    if models.is_empty() {
        println!("No models in {}", ctx.config.models_dir.display());
    }
    for model in models {
        let mut notes = Vec::new();
        if model.is_companion {
            notes.push("companion");
        }
        if !model.in_catalog {
            notes.push("not in catalog");
        }
        println!(
            "{:<10} {:>8}  {}{}",
            model.resource_type.as_str(),
            format_bytes(model.size_bytes),
            model.name,
            if notes.is_empty() {
                String::new()
            } else {
                format!(" ({})", notes.join(", "))
            }
        );
    }
    Ok(())
}

pub async fn download(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, keeping partial download for resume");
            on_interrupt.cancel();
        }
    });

    let options = DownloadOptions {
        on_progress: Some(Arc::new(|p: DownloadProgress| {
            eprint!(
                "\r{} {:>5.1}% {:>10}/s eta {}",
                p.filename,
                p.percent,
                format_bytes(p.speed_bps as u64),
                p.eta_seconds
                    .map(|s| format!("{s:.0}s"))
                    .unwrap_or_else(|| "?".to_string())
            );
        })),
        cancel: Some(cancel),
    };

    let result = ctx.fetcher.download(name, options).await;
    eprintln!();
    let path = result.with_context(|| format!("failed to download {name}"))?;
    println!("{}", path.display());
    Ok(())
}

pub async fn delete(ctx: &Context, name: &str) -> anyhow::Result<()> {
    if ctx.fetcher.delete(name).await? {
        println!("Deleted {name}");
    } else {
        println!("Nothing to delete for {name}");
    }
    Ok(())
}

pub async fn readiness(ctx: &Context) -> anyhow::Result<()> {
    let monitor = ReadinessMonitor::new(ctx.probe.clone(), ctx.fetcher.clone());
    let report = monitor
        .check_system_readiness(&ctx.config.selections())
        .await;

    if ctx.json {
        return ctx.print_json(&report);
    }
    println!("{}", if report.ready { "Ready" } else { "Not ready" });
    for issue in &report.issues {
        println!("  issue: {}", issue.message);
    }
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BudgetReport {
    free_memory_bytes: u64,
    total_memory_bytes: u64,
    max_usable_bytes: u64,
    selections: Vec<SelectionFootprint>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SelectionFootprint {
    resource_type: ResourceType,
    model: String,
    estimated_bytes: u64,
}

pub fn budget(ctx: &Context) -> anyhow::Result<()> {
    let free_memory_bytes = ctx.probe.free_memory_bytes();
    let report = BudgetReport {
        free_memory_bytes,
        total_memory_bytes: ctx.probe.total_memory_bytes(),
        max_usable_bytes: compute_budget(free_memory_bytes, ctx.probe.gpu().vram_bytes()),
        selections: ctx
            .config
            .selections()
            .into_iter()
            .map(|(ty, model)| SelectionFootprint {
                resource_type: ty,
                estimated_bytes: estimated_footprint(&ctx.catalog, ty, &model),
                model,
            })
            .collect(),
    };

    if ctx.json {
        return ctx.print_json(&report);
    }
    println!(
        "Budget {} (free {} of {})",
        format_bytes(report.max_usable_bytes),
        format_bytes(report.free_memory_bytes),
        format_bytes(report.total_memory_bytes)
    );
    for selection in &report.selections {
        println!(
            "  {:<10} {:>8}  {}",
            selection.resource_type.as_str(),
            format_bytes(selection.estimated_bytes),
            selection.model
        );
    }
    Ok(())
}

pub fn config(ctx: &Context) -> anyhow::Result<()> {
    ctx.print_json(&ctx.config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_switches_units() {
        assert_eq!(format_bytes(512 * MIB), "512 MB");
        assert_eq!(format_bytes(4 * GIB + GIB / 2), "4.5 GB");
    }
}
