use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::IpamConfig;

/// Map the "loglevel" parameter. "debug" and "trace" are taken by name,
/// a number gives the verbosity, anything else is info.
pub fn level(loglevel: Option<&str>) -> LevelFilter {
    let loglevel = loglevel.unwrap_or_default().trim().to_ascii_lowercase();
    match loglevel.as_str() {
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        other => match other.parse::<i32>().map(i32::abs) {
            Ok(1) => LevelFilter::DEBUG,
            Ok(v) if v >= 2 => LevelFilter::TRACE,
            _ => LevelFilter::INFO,
        },
    }
}

/// Install the global subscriber configured by the "logfile" and
/// "loglevel" parameters. stdout carries the CNI result, so nothing is
/// logged unless a file or "stderr" is given. Failures are ignored.
pub fn init(ipam: Option<&IpamConfig>) {
    let Some(ipam) = ipam else { return };
    let output = match ipam.logfile.as_deref() {
        None | Some("") | Some("stdout") => return,
        Some(output) => output,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level(ipam.loglevel.as_deref()).into()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false);

    let _ = if output == "stderr" {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        match OpenOptions::new().create(true).append(true).open(output) {
            Ok(file) => builder.with_writer(Mutex::new(file)).try_init(),
            Err(_) => return,
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level() {
        assert_eq!(level(Some("debug")), LevelFilter::DEBUG);
        assert_eq!(level(Some("TRACE")), LevelFilter::TRACE);
        assert_eq!(level(Some("1")), LevelFilter::DEBUG);
        assert_eq!(level(Some("2")), LevelFilter::TRACE);
        assert_eq!(level(Some("-2")), LevelFilter::TRACE);
        assert_eq!(level(Some("0")), LevelFilter::INFO);
        assert_eq!(level(Some("info")), LevelFilter::INFO);
        assert_eq!(level(None), LevelFilter::INFO);
    }
}
