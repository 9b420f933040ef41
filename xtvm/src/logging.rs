use std::sync::OnceLock;

use owo_colors::OwoColorize;
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

static ANSI_ENABLED: OnceLock<bool> = OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default;
/// `xtvm=debug` shows every compilation.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let ansi = detect_ansi();
    let _ = ANSI_ENABLED.set(ansi);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}

pub fn tier_label(native: bool) -> String {
    let text = if native { "NATIVE" } else { "INTERP" };
    if !ansi_enabled() {
        return text.to_string();
    }
    if native {
        format!("{}", text.bright_green().bold())
    } else {
        format!("{}", text.bright_yellow().bold())
    }
}

pub fn status_label(ok: bool) -> String {
    let text = if ok { "ok" } else { "FAILED" };
    if !ansi_enabled() {
        return text.to_string();
    }
    if ok {
        format!("{}", text.bright_green())
    } else {
        format!("{}", text.bright_red().bold())
    }
}

pub fn heading(text: &str) -> String {
    if ansi_enabled() {
        format!("{}", text.bright_cyan().bold())
    } else {
        text.to_string()
    }
}

fn ansi_enabled() -> bool {
    *ANSI_ENABLED.get_or_init(detect_ansi)
}

fn detect_ansi() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var_os("FORCE_COLOR").is_some() {
        return true;
    }
    supports_color::on_cached(Stream::Stdout).is_some()
}
