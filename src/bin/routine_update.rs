#![forbid(unsafe_code)]

//! Refreshes every cached ranking once and exits. Meant to be run from cron
//! or a systemd timer next to the backend.

use anyhow::{Context, Result, bail};
use clap::Parser;
use nicorank_tools::{
    config::{RuntimeOverrides, Tuning, resolve_runtime_settings},
    kv, logging,
    pipeline::RankingService,
    refresh::{RefreshReport, refresh_all},
    security::ensure_not_root,
    upstream::{NicoClient, Upstream},
};
use std::{path::PathBuf, sync::Arc};

#[derive(Debug, Parser)]
#[command(
    name = "routine_update",
    about = "Warm the ranking cache for every genre and popular tag"
)]
struct RoutineArgs {
    /// Directory for the local KV database.
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Tuning file; defaults to NICORANK_SETTINGS or ranking.toml.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Print the full report as JSON on stdout.
    #[arg(long)]
    json: bool,
    /// Exit non-zero when any combination failed.
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;
    ensure_not_root("routine_update")?;

    let args = RoutineArgs::parse();
    let settings = resolve_runtime_settings(RuntimeOverrides {
        data_root: args.data_root.clone(),
        env_path: args.env_file.clone(),
        ..RuntimeOverrides::default()
    })?;
    let settings_path = args.settings.clone().unwrap_or(settings.settings_path);
    let tuning = Tuning::load(&settings_path)?;

    let kv = kv::open(&settings.kv, &settings.data_root, tuning.ttl.stale_grace())
        .await
        .context("opening kv store")?;
    let upstream: Arc<dyn Upstream> = Arc::new(NicoClient::new(&tuning.upstream));
    let service = RankingService::new(kv, upstream, tuning);

    tracing::info!(
        data_root = %settings.data_root.display(),
        backend = service.kv().backend_name(),
        "starting routine update"
    );
    let report = refresh_all(&service).await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("encoding refresh report")?
        );
    } else {
        print!("{}", summarize(&report));
    }

    if args.strict && report.failed() > 0 {
        bail!("{} refresh step(s) failed", report.failed());
    }
    Ok(())
}

fn summarize(report: &RefreshReport) -> String {
    let elapsed = report.finished_at - report.started_at;
    let mut out = format!(
        "Refreshed {} of {} ranking(s) in {}s, removed {} idle tag stat(s).\n",
        report.succeeded(),
        report.entries.len(),
        elapsed.num_seconds(),
        report.tags_cleaned
    );
    for entry in report.entries.iter().filter(|entry| !entry.success) {
        let target = match &entry.tag {
            Some(tag) => format!("{} {} #{tag}", entry.genre, entry.period),
            None => format!("{} {}", entry.genre, entry.period),
        };
        out.push_str(&format!(
            "  failed {target}: {}\n",
            entry.error.as_deref().unwrap_or("unknown error")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nicorank_tools::{
        ranking::{Genre, Period},
        refresh::RefreshEntry,
    };

    fn entry(genre: Genre, tag: Option<&str>, error: Option<&str>) -> RefreshEntry {
        RefreshEntry {
            genre,
            period: Period::Day,
            tag: tag.map(str::to_string),
            success: error.is_none(),
            items: if error.is_none() { 100 } else { 0 },
            pages_used: 1,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn routine_args_parse_flags() {
        let args = RoutineArgs::try_parse_from([
            "routine_update",
            "--data-root",
            "/srv/rank",
            "--json",
        ])
        .unwrap();
        assert_eq!(args.data_root, Some(PathBuf::from("/srv/rank")));
        assert!(args.json);
        assert!(!args.strict);
        assert!(RoutineArgs::try_parse_from(["routine_update", "--bogus"]).is_err());
    }

    #[test]
    fn summary_lists_failures() {
        let now = Utc::now();
        let report = RefreshReport {
            started_at: now,
            finished_at: now,
            entries: vec![
                entry(Genre::Game, None, None),
                entry(Genre::Game, Some("RTA"), Some("upstream 503")),
                entry(Genre::Anime, None, Some("timeout")),
            ],
            tags_cleaned: 2,
        };
        let summary = summarize(&report);
        assert!(summary.starts_with("Refreshed 1 of 3 ranking(s)"));
        assert!(summary.contains("removed 2 idle tag stat(s)"));
        assert!(summary.contains("failed game 24h #RTA: upstream 503"));
        assert!(summary.contains("failed anime 24h: timeout"));
    }
}
