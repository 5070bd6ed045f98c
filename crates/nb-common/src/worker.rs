//! Worker identity used for inbox locks.

/// Stable-enough identity for this worker process.
///
/// `POD_NAME` when the orchestrator provides one, otherwise
/// `hostname:pid`. The pid suffix keeps co-located workers distinct.
pub fn worker_id() -> String {
    match std::env::var("POD_NAME") {
        Ok(pod) if !pod.is_empty() => pod,
        _ => {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
            format!("{}:{}", host, std::process::id())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_is_not_empty() {
        assert!(!worker_id().is_empty());
    }
}
