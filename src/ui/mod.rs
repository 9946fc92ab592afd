//! Terminal output for the CLI
//!
//! Styled step lines and an `indicatif` build bar in interactive terminals,
//! with plain `[OK]`-style lines in CI and when output is piped.
//!
//! # Example
//!
//! ```rust,ignore
//! use fretforge::ui::{self, BuildProgress, UiContext};
//!
//! let ctx = UiContext::detect();
//! ui::intro(&ctx, "Building assembly");
//!
//! let progress = BuildProgress::new(&ctx, "assembly", 8);
//! pipeline.subscribe_progress(None, move |event| progress.on_event(event));
//!
//! ui::part_built(&ctx, "assembly", &manifest.digest);
//! ```

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    intro, outro_error, outro_success, part_built, part_failed, part_reuse, remark, section,
    step_info, step_ok_detail, step_warn_hint,
};
pub use progress::BuildProgress;
