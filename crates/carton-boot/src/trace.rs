//! Bootstrap tracing, gated on `CARTON_DEBUG`.

use once_cell::sync::Lazy;

pub const ENV_DEBUG: &str = "CARTON_DEBUG";

static ENABLED: Lazy<bool> = Lazy::new(|| match std::env::var(ENV_DEBUG) {
    Ok(value) => !value.is_empty() && value != "0",
    Err(_) => false,
});

pub fn enabled() -> bool {
    *ENABLED
}

pub fn trace(message: impl AsRef<str>) {
    if enabled() {
        eprintln!("carton: {}", message.as_ref());
    }
}
