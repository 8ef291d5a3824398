pub mod agent;
pub mod cli;
pub mod error;
pub mod git;
pub mod http;
pub mod manifest;
pub mod project;
pub mod results;
pub mod schedule;
pub mod session;
pub mod storage;
pub mod swarm;
pub mod templates;
pub mod worktree;

#[cfg(test)]
mod testutil;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use error::{ErrorCode, PpgError, Result};
pub use project::Project;

/// Install the fmt subscriber on stderr. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match level {
            Some(level) => format!("ppg={0},ppg_lib={0}", level.to_lowercase()),
            None => "ppg=info,ppg_lib=info".to_string(),
        })
    });
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
