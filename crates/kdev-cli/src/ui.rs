use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Colored message helpers
// ---------------------------------------------------------------------------

fn prefix() -> String {
    "[kdev]".bold().cyan().to_string()
}

/// Print an informational message: [kdev] message
pub fn info(msg: &str) {
    println!("{} {}", prefix(), msg);
}

/// Print a success message: [kdev] message (in green)
pub fn success(msg: &str) {
    println!("{} {}", prefix(), msg.green());
}

/// Print an error message: [kdev] ERROR: message (in red)
pub fn error(msg: &str) {
    eprintln!("{} {}", "[kdev]".bold().red(), msg.red());
}

/// Print a warning message: [kdev] message (in yellow)
pub fn warn(msg: &str) {
    println!("{} {}", prefix(), msg.yellow());
}

/// Print a numbered step: [kdev] Step n/total: message
pub fn step(n: u32, total: u32, msg: &str) {
    println!(
        "\n{} {} {}",
        prefix(),
        format!("Step {}/{}:", n, total).bold().yellow(),
        msg,
    );
}

// ---------------------------------------------------------------------------
// Status glyph rendering, matching the `✓`/`⚠`/`✗` prefix convention
// every tool response uses at the RPC boundary.
// ---------------------------------------------------------------------------

/// Color a tool-response line by its leading status glyph.
pub fn glyph_line(line: &str) -> String {
    if let Some(rest) = line.strip_prefix('✓') {
        format!("{}{}", "✓".green().bold(), rest.green())
    } else if let Some(rest) = line.strip_prefix('⚠') {
        format!("{}{}", "⚠".yellow().bold(), rest.yellow())
    } else if let Some(rest) = line.strip_prefix('✗') {
        format!("{}{}", "✗".red().bold(), rest.red())
    } else {
        line.to_string()
    }
}

/// Print a tool-response text block, colorizing each glyph-prefixed line.
pub fn render_block(text: &str) {
    for line in text.lines() {
        println!("{}", glyph_line(line));
    }
}

/// Serialize `value` to a single pretty-printed JSON object on stdout,
/// the `--output json` counterpart to the human-readable helpers above.
pub fn emit_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Status table
// ---------------------------------------------------------------------------

/// Print the status header.
pub fn status_header(title: &str) {
    println!("{}", title.bold());
    println!("{}", "-".repeat(title.len()).dimmed());
}

/// Print a status line with a bold label and a colored value.
pub fn status_line(label: &str, value: &str) {
    let colored_value = if value.starts_with("ok") || value == "present" {
        value.green().to_string()
    } else if value.starts_with("warning") {
        value.yellow().to_string()
    } else if value.starts_with("error") || value == "missing" {
        value.red().to_string()
    } else if value == "-" {
        value.dimmed().to_string()
    } else {
        value.to_string()
    };

    println!("{} {}", format!("{:<16}", label).bold(), colored_value);
}

// ---------------------------------------------------------------------------
// Interactive prompts
// ---------------------------------------------------------------------------

/// Show a `y/N` confirmation prompt on stdin. Returns true only on an
/// explicit `y`/`yes`; any other input (including EOF) is a no.
pub fn confirm(msg: &str) -> bool {
    use std::io::Write as _;
    print!("{} {} [y/N] ", prefix(), msg);
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}

// ---------------------------------------------------------------------------
// Spinners
// ---------------------------------------------------------------------------

/// Create and start a spinner with the given message.
/// Call `.finish_with_message()` or `.finish_and_clear()` when done.
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template("{spinner:.cyan} {msg}")
            .expect("invalid spinner template"),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}
