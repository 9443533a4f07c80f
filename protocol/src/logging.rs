use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Installs the process-wide subscriber. `RUST_LOG` refines the default `info` level.
/// Safe to call more than once; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let _ = Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

/// Consecutive failures worth logging: the first few, then every tenth.
pub fn should_log_failure(count: u32) -> bool {
    count <= 3 || count % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        init();
        init();
    }

    #[test]
    fn failure_logging_is_throttled() {
        let logged: Vec<u32> = (1..=25).filter(|&n| should_log_failure(n)).collect();
        assert_eq!(logged, vec![1, 2, 3, 10, 20]);
    }
}
