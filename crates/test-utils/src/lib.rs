pub mod builders;
pub mod fake_target;
pub mod prompter;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

pub use fake_target::{FakeTarget, PtyHandle, PtyScript};
pub use prompter::ScriptedPrompter;

/// Upper bound for anything a test awaits.
pub const TEST_DEADLINE: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. `RUST_LOG` picks the
/// level; the default is `info`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_test_writer().init();
    });
}

/// Await `fut`, failing the test after [`TEST_DEADLINE`].
pub async fn with_timeout<T>(fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(TEST_DEADLINE, fut).await {
        Ok(value) => value,
        Err(_) => panic!("still pending after {TEST_DEADLINE:?}"),
    }
}

/// Poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    with_timeout(async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}
