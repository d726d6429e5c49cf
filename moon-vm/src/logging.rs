use owo_colors::OwoColorize;
use std::sync::OnceLock;
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

static ANSI_ENABLED: OnceLock<bool> = OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let ansi = detect_ansi();
    let _ = ANSI_ENABLED.set(ansi);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}

pub fn category_compile() -> String {
    label("COMPILE", |text| format!("{}", text.bright_cyan().bold()))
}

pub fn category_run() -> String {
    label("RUN", |text| format!("{}", text.bright_green().bold()))
}

pub fn category_bytecode() -> String {
    label("BYTECODE", |text| format!("{}", text.bright_magenta().bold()))
}

fn label(text: &'static str, paint: impl Fn(&'static str) -> String) -> String {
    if ansi_enabled() {
        paint(text)
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
    supports_color::on_cached(Stream::Stderr).is_some()
}
