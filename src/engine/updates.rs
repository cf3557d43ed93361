//! Update Decision Engine
//!
//! Stateless per-poll decision. The registry carries all per-device state;
//! the firmware store is the single source of truth for "latest".

use std::sync::Arc;
use tracing::info;

use crate::engine::error::Result;
use crate::engine::firmware::{FirmwareDownload, FirmwareStore};
use crate::engine::registry::DeviceRegistry;

/// What a device presents when it polls
#[derive(Debug, Clone, Default)]
pub struct PollRequest {
    pub device_id: Option<String>,
    pub current_version: Option<String>,
}

impl PollRequest {
    /// Blank values count as absent; anything else is kept byte for byte
    pub fn new(device_id: Option<&str>, current_version: Option<&str>) -> Self {
        let non_blank = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
        Self {
            device_id: device_id.and_then(non_blank),
            current_version: current_version.and_then(non_blank),
        }
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// Nothing has ever been published
    NoFirmwareAvailable,
    /// Device already runs the published version
    UpToDate { version: String },
    /// Device should install the attached image
    UpdateAvailable(FirmwareDownload),
}

impl PollOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoFirmwareAvailable => "no_firmware",
            Self::UpToDate { .. } => "up_to_date",
            Self::UpdateAvailable(_) => "update_available",
        }
    }
}

/// Exact string comparison; no version ordering is applied.
pub fn needs_update(forced: bool, reported: Option<&str>, published: &str) -> bool {
    forced || reported != Some(published)
}

#[derive(Clone)]
pub struct UpdateEngine {
    store: Arc<FirmwareStore>,
    registry: DeviceRegistry,
}

impl UpdateEngine {
    pub fn new(store: Arc<FirmwareStore>, registry: DeviceRegistry) -> Self {
        Self { store, registry }
    }

    pub async fn poll(&self, request: PollRequest) -> Result<PollOutcome> {
        let Some(download) = self.store.open_download().await? else {
            info!(device_id = ?request.device_id, "Poll before any firmware was published");
            return Ok(PollOutcome::NoFirmwareAvailable);
        };

        let forced = match &request.device_id {
            Some(device_id) => {
                let registry = self.registry.clone();
                let device_id = device_id.clone();
                let version = request.current_version.clone();
                let record = tokio::task::spawn_blocking(move || {
                    registry.record_update_check(&device_id, version.as_deref())
                })
                .await??;
                record.update_forced
            }
            None => false,
        };

        let published = &download.image.version;
        let outcome = if needs_update(forced, request.current_version.as_deref(), published) {
            PollOutcome::UpdateAvailable(download)
        } else {
            PollOutcome::UpToDate {
                version: published.clone(),
            }
        };

        info!(
            device_id = ?request.device_id,
            reported = ?request.current_version,
            forced,
            outcome = outcome.label(),
            "Firmware poll"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::database::Database;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        _dir: TempDir,
        store: Arc<FirmwareStore>,
        registry: DeviceRegistry,
        engine: UpdateEngine,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(FirmwareStore::open(dir.path(), Duration::from_secs(5)).unwrap());
        let registry = DeviceRegistry::new(Database::in_memory().unwrap());
        let engine = UpdateEngine::new(store.clone(), registry.clone());
        Harness {
            _dir: dir,
            store,
            registry,
            engine,
        }
    }

    async fn poll(h: &Harness, device: Option<&str>, version: Option<&str>) -> PollOutcome {
        h.engine.poll(PollRequest::new(device, version)).await.unwrap()
    }

    #[test]
    fn test_needs_update_is_exact_match() {
        assert!(!needs_update(false, Some("1.0.0"), "1.0.0"));
        assert!(needs_update(false, Some("1.0"), "1.0.0"));
        assert!(needs_update(false, Some("2.0.0"), "1.0.0"));
        assert!(needs_update(false, Some("1.0.0 "), "1.0.0"));
        assert!(needs_update(false, None, "1.0.0"));
        assert!(needs_update(true, Some("1.0.0"), "1.0.0"));
    }

    #[test]
    fn test_poll_request_treats_blank_as_absent() {
        let req = PollRequest::new(Some(" "), Some(""));
        assert!(req.device_id.is_none());
        assert!(req.current_version.is_none());

        let req = PollRequest::new(Some(" d1"), Some("1.0.0 "));
        assert_eq!(req.device_id.as_deref(), Some(" d1"));
        assert_eq!(req.current_version.as_deref(), Some("1.0.0 "));
    }

    #[tokio::test]
    async fn test_padded_version_is_a_mismatch() {
        let h = harness();
        h.store.publish(b"b1".to_vec(), Some("1.0.0")).await.unwrap();

        let outcome = poll(&h, Some("d1"), Some("1.0.0 ")).await;
        assert!(matches!(outcome, PollOutcome::UpdateAvailable(_)));
        let record = h.registry.get("d1").unwrap().unwrap();
        assert_eq!(record.current_version_at_check.as_deref(), Some("1.0.0 "));
    }

    #[tokio::test]
    async fn test_poll_sees_publish_from_another_store() {
        let h = harness();
        h.store.publish(b"b1".to_vec(), Some("1.0.0")).await.unwrap();
        assert!(matches!(
            poll(&h, Some("d1"), Some("1.0.0")).await,
            PollOutcome::UpToDate { .. }
        ));

        for (payload, version) in [(&b"b2"[..], "2.0.0"), (&b"b3"[..], "3.0.0")] {
            let operator =
                FirmwareStore::open_with_grace(h.store.root(), Duration::from_secs(5), Duration::ZERO)
                    .unwrap();
            operator.publish(payload.to_vec(), Some(version)).await.unwrap();
        }

        match poll(&h, Some("d1"), Some("0.9.0")).await {
            PollOutcome::UpdateAvailable(download) => {
                assert_eq!(download.image.version, "3.0.0");
                assert_eq!(download.read_all().await.unwrap(), b"b3");
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_before_publish_does_not_touch_registry() {
        let h = harness();
        let outcome = poll(&h, Some("d1"), Some("0.9.0")).await;
        assert!(matches!(outcome, PollOutcome::NoFirmwareAvailable));
        assert!(h.registry.get("d1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scenarios_publish_poll_force() {
        let h = harness();
        h.store
            .publish(b"b1".to_vec(), Some("1.0.0"))
            .await
            .unwrap();

        // Unknown device on an older version receives the image
        match poll(&h, Some("d1"), Some("0.9.0")).await {
            PollOutcome::UpdateAvailable(download) => {
                assert_eq!(download.image.version, "1.0.0");
                assert_eq!(download.read_all().await.unwrap(), b"b1");
            }
            other => panic!("expected update, got {:?}", other),
        }
        let record = h.registry.get("d1").unwrap().unwrap();
        assert_eq!(record.current_version_at_check.as_deref(), Some("0.9.0"));

        // Same version twice is up to date both times
        for _ in 0..2 {
            let outcome = poll(&h, Some("d1"), Some("1.0.0")).await;
            assert!(matches!(outcome, PollOutcome::UpToDate { ref version } if version == "1.0.0"));
        }

        // Forced device gets the image despite matching
        h.registry.set_forced("d1", true).unwrap();
        for _ in 0..2 {
            let outcome = poll(&h, Some("d1"), Some("1.0.0")).await;
            assert!(matches!(outcome, PollOutcome::UpdateAvailable(_)));
        }
        // Other devices are unaffected
        let outcome = poll(&h, Some("d2"), Some("1.0.0")).await;
        assert!(matches!(outcome, PollOutcome::UpToDate { .. }));

        h.registry.set_forced("d1", false).unwrap();
        let outcome = poll(&h, Some("d1"), Some("1.0.0")).await;
        assert!(matches!(outcome, PollOutcome::UpToDate { .. }));
    }

    #[tokio::test]
    async fn test_missing_version_always_updates() {
        let h = harness();
        h.store.publish(b"b1".to_vec(), Some("1.0.0")).await.unwrap();

        assert!(matches!(poll(&h, Some("d1"), None).await, PollOutcome::UpdateAvailable(_)));
        assert!(matches!(poll(&h, None, None).await, PollOutcome::UpdateAvailable(_)));
    }

    #[tokio::test]
    async fn test_anonymous_poll_is_not_recorded() {
        let h = harness();
        h.store.publish(b"b1".to_vec(), Some("1.0.0")).await.unwrap();

        let outcome = poll(&h, None, Some("1.0.0")).await;
        assert!(matches!(outcome, PollOutcome::UpToDate { .. }));
        assert!(h.registry.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_version_publish_moves_fleet() {
        let h = harness();
        h.store.publish(b"b1".to_vec(), Some("1.0.0")).await.unwrap();
        assert!(matches!(
            poll(&h, Some("d1"), Some("1.0.0")).await,
            PollOutcome::UpToDate { .. }
        ));

        let image = h.store.publish(b"b2".to_vec(), None).await.unwrap();
        assert!(!image.version.is_empty());
        assert_ne!(image.version, "1.0.0");

        match poll(&h, Some("d1"), Some("1.0.0")).await {
            PollOutcome::UpdateAvailable(download) => {
                assert_eq!(download.image.version, image.version);
                assert_eq!(download.read_all().await.unwrap(), b"b2");
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_every_poll_advances_last_update_check() {
        let h = harness();
        h.store.publish(b"b1".to_vec(), Some("1.0.0")).await.unwrap();

        let mut previous = None;
        for version in [Some("1.0.0"), Some("0.1"), None, Some("1.0.0")] {
            poll(&h, Some("d1"), version).await;
            let checked = h.registry.get("d1").unwrap().unwrap().last_update_check;
            assert!(checked.is_some());
            assert!(checked >= previous);
            previous = checked;
        }
    }
}
