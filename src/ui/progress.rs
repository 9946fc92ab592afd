//! Build progress display with CI fallback

use super::context::UiContext;
use crate::scheduler::{ProgressEvent, ProgressState};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const TEMPLATE: &str =
    "  {spinner:.cyan} Building {prefix}  {bar:20.cyan/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}";

/// Progress for one build request.
///
/// Feeds on [`ProgressEvent`]s from a pipeline subscription. Shows an
/// indicatif bar in interactive mode and one line per finished part
/// otherwise. Clones share the same bar, so a clone can move into the
/// subscription callback.
#[derive(Clone)]
pub struct BuildProgress {
    bar: Option<ProgressBar>,
}

impl BuildProgress {
    /// Create a progress display for `label` covering `parts` nodes
    pub fn new(ctx: &UiContext, label: &str, parts: usize) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new(parts as u64);
            let template = ProgressStyle::default_bar()
                .template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(
                template
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                    .progress_chars("━╸─"),
            );
            bar.set_prefix(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        } else {
            None
        };
        Self { bar }
    }

    /// Record one part transition
    pub fn on_event(&self, event: &ProgressEvent) {
        match (&self.bar, event.state) {
            (Some(bar), ProgressState::Building) => bar.set_message(event.node.clone()),
            (Some(bar), ProgressState::Built | ProgressState::Failed) => bar.inc(1),
            (None, ProgressState::Building) => {}
            (None, ProgressState::Built) => println!(
                "  built {} ({}) in {}ms",
                event.node,
                event.fingerprint.short(),
                event.elapsed.map_or(0, |d| d.as_millis())
            ),
            (None, ProgressState::Failed) => println!(
                "  {} {}: {}",
                style("failed").red(),
                event.node,
                event.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    /// Finish and clear the progress bar.
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    #[test]
    fn build_progress_non_interactive() {
        let ctx = UiContext::non_interactive();
        let progress = BuildProgress::new(&ctx, "assembly", 3);
        let fp = Fingerprint::from_hex(&"c".repeat(64)).unwrap();

        progress.on_event(&ProgressEvent::building("neck", fp));
        progress.on_event(&ProgressEvent::built("neck", fp, Duration::from_millis(3)));
        progress.on_event(&ProgressEvent::failed("body", fp, "non-manifold"));
        progress.finish();
        // Should not panic
    }
}
