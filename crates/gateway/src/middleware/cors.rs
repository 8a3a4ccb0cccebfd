//! CORS layer toggled at runtime.
//!
//! `enable_cors` arrives with the host's configuration, after the HTTP
//! listener is already up, so the layer consults a shared flag per request
//! instead of being rebuilt. When enabled, preflights are answered
//! permissively and the request's Origin is echoed back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Build the CORS layer around the runtime flag.
pub fn cors_layer(enabled: Arc<AtomicBool>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |_origin, _parts| {
            enabled.load(Ordering::Relaxed)
        }))
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_builds_with_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let layer = cors_layer(Arc::clone(&flag));
        flag.store(true, Ordering::Relaxed);
        assert!(flag.load(Ordering::Relaxed));
        drop(layer);
    }
}
