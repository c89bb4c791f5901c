//! Streaming pack machinery: a single in-progress packfile written through a
//! sliding tail window, per-session object entries, the `.idx` emitted at
//! finalization, and read-back of entries from already-finished packs.

pub mod entry;
pub mod reader;
pub mod window;
pub mod writer;

#[cfg(test)]
mod tests {
    use tracing_subscriber::util::SubscriberInitExt;

    /// Shared test logger; safe to call from multiple tests.
    pub(crate) fn init_logger() {
        let _ = tracing_subscriber::fmt::Subscriber::builder()
            .with_target(false)
            .without_time()
            .with_level(true)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
            .try_init(); // avoid multi-init
    }

    #[test]
    fn test_logger_is_reentrant() {
        init_logger();
        init_logger();
    }
}
