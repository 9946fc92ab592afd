//! Build command - build instrument parts with the manifest kernel

use crate::audit::AuditLog;
use crate::cli::args::{BuildArgs, OutputFormat};
use crate::config::Config;
use crate::error::{ForgeError, ForgeResult};
use crate::invalidate::ParamChange;
use crate::kernel::{ManifestKernel, PartManifest};
use crate::params::{load_parameter_file, ParamValue};
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::scheduler::{ArtifactSource, BuildReport};
use crate::ui::{self, BuildProgress, UiContext};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Outcome of one requested part
#[derive(Debug, Serialize)]
struct PartSummary {
    node: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    passes: usize,
    elapsed_ms: u64,
}

/// One edit-then-build round
#[derive(Debug, Serialize)]
struct RoundSummary {
    params_version: u64,
    changed: Vec<String>,
    parts: Vec<PartSummary>,
    rebuilt: BTreeSet<String>,
    reused: BTreeSet<String>,
}

impl RoundSummary {
    fn new(change: ParamChange) -> Self {
        Self {
            params_version: change.version,
            changed: change.changed,
            parts: Vec::new(),
            rebuilt: BTreeSet::new(),
            reused: BTreeSet::new(),
        }
    }

    fn record(&mut self, report: &BuildReport<PartManifest>) {
        self.rebuilt.extend(
            report
                .nodes_from(ArtifactSource::Built)
                .into_iter()
                .map(str::to_string),
        );
        for source in [ArtifactSource::Cached, ArtifactSource::Shared] {
            self.reused
                .extend(report.nodes_from(source).into_iter().map(str::to_string));
        }
        // A part built by a sibling request is still a rebuild for the round
        self.reused.retain(|node| !self.rebuilt.contains(node));

        let elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX);
        self.parts.push(match &report.result {
            Ok(lease) => PartSummary {
                node: report.root.clone(),
                ok: true,
                fingerprint: Some(lease.fingerprint().to_hex()),
                digest: Some(lease.digest.clone()),
                error: None,
                passes: report.passes,
                elapsed_ms,
            },
            Err(e) => PartSummary {
                node: report.root.clone(),
                ok: false,
                fingerprint: None,
                digest: None,
                error: Some(e.to_string()),
                passes: report.passes,
                elapsed_ms,
            },
        });
    }

    fn failed(&self) -> usize {
        self.parts.iter().filter(|p| !p.ok).count()
    }
}

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> ForgeResult<()> {
    let ctx = UiContext::detect();
    let audit = AuditLog::new(config);

    let mut options = PipelineOptions::from_config(config);
    if let Some(workers) = args.workers {
        options.workers = workers;
    }
    let pipeline = Pipeline::for_instrument(ManifestKernel::new(), options)?;
    debug!("Build pipeline ready with {} workers", pipeline.worker_count());

    let mut edits = Vec::new();
    if let Some(path) = args.params.as_ref().or(config.instrument.parameters.as_ref()) {
        edits.extend(load_parameter_file(path).await?);
    }
    edits.extend(args.set);

    let show_progress = args.format == OutputFormat::Table;
    let mut rounds = Vec::new();

    let change = apply_edits(&pipeline, &audit, edits).await?;
    rounds.push(build_round(&ctx, &pipeline, &audit, &args.nodes, change, show_progress).await?);

    if !args.then_set.is_empty() {
        let change = apply_edits(&pipeline, &audit, args.then_set).await?;
        rounds.push(build_round(&ctx, &pipeline, &audit, &args.nodes, change, show_progress).await?);
    }
    pipeline.shutdown();

    match args.format {
        OutputFormat::Table => print_table(&ctx, &rounds),
        OutputFormat::Json => print_json(&rounds)?,
        OutputFormat::Plain => print_plain(&rounds),
    }

    let failed: usize = rounds.iter().map(RoundSummary::failed).sum();
    if failed > 0 {
        return Err(ForgeError::User(format!("{} part build(s) failed", failed)));
    }
    Ok(())
}

async fn apply_edits(
    pipeline: &Pipeline<ManifestKernel>,
    audit: &AuditLog,
    edits: Vec<(String, ParamValue)>,
) -> ForgeResult<ParamChange> {
    if edits.is_empty() {
        return Ok(ParamChange {
            version: pipeline.params_version()?,
            ..Default::default()
        });
    }

    let change = pipeline.set_parameters(edits)?;
    audit.params_applied(&change).await;
    Ok(change)
}

/// Request every node concurrently and collect the reports
async fn build_round(
    ctx: &UiContext,
    pipeline: &Pipeline<ManifestKernel>,
    audit: &AuditLog,
    nodes: &[String],
    change: ParamChange,
    show_progress: bool,
) -> ForgeResult<RoundSummary> {
    let mut parts = BTreeSet::new();
    for node in nodes {
        parts.extend(pipeline.build_order(node)?);
    }

    let progress = show_progress.then(|| BuildProgress::new(ctx, &nodes.join(", "), parts.len()));
    let subscription = progress.clone().map(|progress| {
        pipeline.subscribe_progress(None, move |event| progress.on_event(event))
    });

    let reports = join_all(nodes.iter().map(|node| pipeline.request_report(node))).await;

    if let Some(id) = subscription {
        pipeline.unsubscribe_progress(id);
    }
    if let Some(progress) = &progress {
        progress.finish();
    }

    let mut summary = RoundSummary::new(change);
    for report in reports {
        let report = report?;
        audit.build_finished(&report).await;
        summary.record(&report);
    }
    Ok(summary)
}

fn print_table(ctx: &UiContext, rounds: &[RoundSummary]) {
    ui::intro(ctx, "fretforge build");

    for (index, round) in rounds.iter().enumerate() {
        let title = if index == 0 {
            format!("Parts (parameters v{})", round.params_version)
        } else {
            format!(
                "After editing {} (parameters v{})",
                round.changed.join(", "),
                round.params_version
            )
        };
        ui::section(ctx, &title);

        for part in &round.parts {
            match (&part.digest, &part.error) {
                (Some(digest), _) => ui::part_built(ctx, &part.node, digest),
                (None, error) => {
                    ui::part_failed(ctx, &part.node, error.as_deref().unwrap_or("no artifact"))
                }
            }
        }
        let rebuilt: Vec<&str> = round.rebuilt.iter().map(String::as_str).collect();
        let reused: Vec<&str> = round.reused.iter().map(String::as_str).collect();
        ui::part_reuse(ctx, &rebuilt, &reused);
    }

    let failed: usize = rounds.iter().map(RoundSummary::failed).sum();
    if failed == 0 {
        ui::outro_success(ctx, "Build complete");
    } else {
        ui::outro_error(ctx, &format!("{} part build(s) failed", failed));
    }
}

fn print_json(rounds: &[RoundSummary]) -> ForgeResult<()> {
    let json = serde_json::to_string_pretty(rounds)?;
    println!("{}", json);
    Ok(())
}

fn print_plain(rounds: &[RoundSummary]) {
    for part in rounds.iter().flat_map(|round| &round.parts) {
        match &part.digest {
            Some(digest) => println!("{} {}", part.node, digest),
            None => println!("{} FAILED", part.node),
        }
    }
}
