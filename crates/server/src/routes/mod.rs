pub mod events;

/// Liveness probe.
pub async fn health() -> &'static str {
    "ok"
}
