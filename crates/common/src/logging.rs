// C2T - CPU Testing Tool
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tracing setup shared by the `c2t` binary, the mock stub and the tests.
//!
//! Console output goes to stderr so that command output on stdout stays
//! machine-readable. A run can additionally keep a daily-rotated debug log
//! under `$TMPDIR/c2t-logs/<component>`.

use std::{env, fs, path::PathBuf, sync::Once};

use eyre::{eyre, Result, WrapErr};
use tracing::Level;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{self, time::LocalTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Dependencies that stay at `warn` whatever level was requested.
const QUIET_TARGETS: &[&str] = &["tokio=warn", "mio=warn"];

/// Install the global subscriber for `component_name`.
///
/// The console level is INFO, or DEBUG with `verbose`, unless `RUST_LOG`
/// says otherwise. With `enable_file_logging` the full DEBUG stream is also
/// written to [`log_directory`]; the returned guard flushes that file when
/// dropped and must live as long as the program.
pub fn init_logging(
    component_name: &str,
    verbose: bool,
    enable_file_logging: bool,
) -> Result<Option<WorkerGuard>> {
    let console = fmt::layer()
        .with_target(true)
        .with_timer(LocalTime::rfc_3339())
        .with_writer(std::io::stderr)
        .with_filter(env_filter(if verbose { Level::DEBUG } else { Level::INFO })?);

    let (file, guard) = if enable_file_logging {
        let dir = log_directory(component_name);
        fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("cannot create log directory {}", dir.display()))?;
        let (writer, guard) =
            tracing_appender::non_blocking(rolling::daily(&dir, format!("{component_name}.log")));
        let layer = fmt::layer()
            .with_ansi(false)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(LocalTime::rfc_3339())
            .with_writer(writer)
            .with_filter(env_filter(Level::DEBUG)?);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| eyre!("cannot install tracing subscriber: {e}"))?;

    tracing::debug!(
        component = component_name,
        file_logging = guard.is_some(),
        rust_log = env::var("RUST_LOG").as_deref().unwrap_or("<unset>"),
        args = ?env::args().collect::<Vec<_>>(),
        "Logging initialized"
    );
    Ok(guard)
}

/// `RUST_LOG` if set, `default_level` otherwise, with [`QUIET_TARGETS`] applied.
fn env_filter(default_level: Level) -> Result<EnvFilter> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level.as_str()))
        .map_err(|e| eyre!("bad log filter: {e}"))?;
    QUIET_TARGETS
        .iter()
        .try_fold(filter, |filter, directive| Ok(filter.add_directive(directive.parse()?)))
}

/// Directory receiving the log files of `component_name`.
pub fn log_directory(component_name: &str) -> PathBuf {
    env::temp_dir().join("c2t-logs").join(component_name)
}

/// Console-only compact logging for small utilities and tests.
pub fn init_simple_logging(level: Level) -> Result<()> {
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(env_filter(level)?)
        .with_test_writer()
        .try_init()
        .map_err(|e| eyre!("cannot install tracing subscriber: {e}"))
}

static TEST_LOGGING: Once = Once::new();

/// Idempotent [`init_simple_logging`] for tests, INFO unless told otherwise.
pub fn ensure_test_logging(default_level: Option<Level>) {
    TEST_LOGGING.call_once(|| {
        // Another subscriber may already be installed
        let _ = init_simple_logging(default_level.unwrap_or(Level::INFO));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, warn};

    #[test]
    fn test_ensure_test_logging_is_idempotent() {
        ensure_test_logging(None);
        ensure_test_logging(Some(Level::DEBUG));
        info!(test = "add", "session started");
        warn!(port = 1234, "slow stub");
        debug!("not shown at info");
    }

    #[test]
    fn test_log_directory_is_per_component() {
        let a = log_directory("c2t");
        assert_ne!(a, log_directory("c2t-mock-stub"));
        assert!(a.ends_with("c2t-logs/c2t"));
    }

    #[test]
    fn test_filter_accepts_default_levels() {
        assert!(env_filter(Level::INFO).is_ok());
        assert!(env_filter(Level::DEBUG).is_ok());
    }
}
