#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hyper::StatusCode;

/// Liveness/readiness flag served on `/healthz` and `/readyz`.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// Response for a probe path, or `None` if `path` is not a probe.
	pub fn probe(&self, path: &str) -> Option<(StatusCode, &'static str)> {
		match path {
			"/healthz" => Some((StatusCode::OK, "ok")),
			"/readyz" if self.is_ready() => Some((StatusCode::OK, "ready")),
			"/readyz" => Some((StatusCode::SERVICE_UNAVAILABLE, "not-ready")),
			_ => None,
		}
	}
}
