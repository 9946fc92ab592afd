//! Output functions for consistent CLI formatting

use super::context::UiContext;
use console::style;

/// Display intro banner
pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.use_fancy_output() {
        cliclack::intro(style(title).cyan().bold()).ok();
    } else {
        println!("{}", style(title).cyan().bold());
        println!();
    }
}

/// Display success outro
pub fn outro_success(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::outro(style(message).green().bold()).ok();
    } else {
        println!();
        println!("{} {}", style("[OK]").green(), message);
    }
}

/// Display error outro
pub fn outro_error(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::outro(style(message).red().bold()).ok();
    } else {
        println!();
        println!("{} {}", style("[ERROR]").red(), message);
    }
}

/// Display a section header
pub fn section(ctx: &UiContext, title: &str) {
    println!();
    if ctx.use_fancy_output() {
        cliclack::log::info(style(title).bold()).ok();
    } else {
        println!("{}", style(title).bold());
    }
}

/// Display a success step with detail
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::success(format!("{} ({})", message, style(detail).dim())).ok();
    } else {
        println!("  {} {} ({})", style("[OK]").green(), message, detail);
    }
}

/// Display a warning step with hint
pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::warning(format!("{} - {}", message, style(hint).dim())).ok();
    } else {
        println!("  {} {} - {}", style("[WARN]").yellow(), message, hint);
    }
}

/// Display an info step
pub fn step_info(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::info(message).ok();
    } else {
        println!("  {} {}", style("[INFO]").cyan(), message);
    }
}

/// Display a remark/hint
pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::remark(message).ok();
    } else {
        println!("  {}", style(message).dim());
    }
}

/// A part that has an artifact, with its short digest
pub fn part_built(ctx: &UiContext, node: &str, digest: &str) {
    let short = &digest[..digest.len().min(12)];
    if ctx.use_fancy_output() {
        cliclack::log::success(format!("{:<16} {}", node, style(short).dim())).ok();
    } else {
        println!("  {} {:<16} {}", style("[OK]").green(), node, short);
    }
}

/// A part whose build failed, or was skipped after a dependency failed
pub fn part_failed(ctx: &UiContext, node: &str, error: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::error(format!("{:<16} {}", node, style(error).red())).ok();
    } else {
        println!("  {} {:<16} {}", style("[FAIL]").red(), node, error);
    }
}

/// Which parts a round rebuilt and which it served from the cache
pub fn part_reuse(ctx: &UiContext, rebuilt: &[&str], reused: &[&str]) {
    let list = |parts: &[&str]| {
        if parts.is_empty() {
            "-".to_string()
        } else {
            parts.join(", ")
        }
    };

    if ctx.use_fancy_output() {
        cliclack::note(
            "Cache",
            format!("rebuilt: {}\nreused:  {}", list(rebuilt), list(reused)),
        )
        .ok();
    } else {
        println!("  rebuilt: {}", list(rebuilt));
        println!("  reused: {}", list(reused));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_non_interactive() {
        let ctx = UiContext::non_interactive();
        // These should not panic
        intro(&ctx, "Test");
        section(&ctx, "Parts");
        part_built(&ctx, "neck", "3f9a0c41d2e7aa");
        part_built(&ctx, "nut", "ab");
        part_failed(&ctx, "headstock", "dependency neck failed");
        part_reuse(&ctx, &["headstock"], &[]);
        step_warn_hint(&ctx, "Warning", "hint");
        outro_success(&ctx, "Done");
    }
}
