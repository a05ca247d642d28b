use tracing::Level;

/// Log through the test harness, so output shows up for failing tests only.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}
