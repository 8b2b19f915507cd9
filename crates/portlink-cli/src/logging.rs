//! Tracing setup. Logs always go to stderr: in `echo-host` mode stdout
//! carries native-messaging frames.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "PORTLINK_LOG";

/// `RUST_LOG` wins; otherwise `PORTLINK_LOG` picks the level for our targets.
/// `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(std::env::var(LOG_ENV).ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("portlink={level},portlink_cli={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_defaults_to_info() {
        assert_eq!(default_directives(None), "portlink=info,portlink_cli=info");
        assert_eq!(default_directives(Some("verbose")), "portlink=info,portlink_cli=info");
    }

    #[test]
    fn warning_is_an_alias() {
        assert_eq!(default_directives(Some("warning")), "portlink=warn,portlink_cli=warn");
        assert_eq!(default_directives(Some("debug")), "portlink=debug,portlink_cli=debug");
    }
}
