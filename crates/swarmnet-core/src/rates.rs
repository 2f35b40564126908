//! Effective rate derivation.
//!
//! Configured KB/s values are turned into byte-per-second ceilings in exactly
//! one place. The rules:
//!
//! - anything below 1 KB/s or above [`UNLIMITED_RATE`] clamps to unlimited;
//! - the effective upload ceiling switches between the normal and the
//!   seeding-only configured value with global seeding state;
//! - when request-limiting admission control is enabled, the internal
//!   download ceiling is inflated by `max(10%, 5 KiB/s)` over the configured
//!   value, while the un-inflated value is kept for display;
//! - LAN ceilings are derived independently of the WAN ones.
//!
//! The derived values live in atomics so the four standing [`RateGroup`]s can
//! report the current ceiling to any scheduler without locks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use swarmnet_rate::{RateGroup, UNLIMITED_RATE};

use crate::config::NetworkConfig;

/// Clamp a configured KB/s value into a bytes-per-second ceiling.
fn clamp_rate_kbs(kbs: u32) -> u32 {
    let bps = u64::from(kbs) * 1024;
    if bps < 1024 || bps > u64::from(UNLIMITED_RATE) {
        UNLIMITED_RATE
    } else {
        bps as u32
    }
}

/// Derived ceilings, recomputed on every configuration change and on every
/// seeding-state flip.
pub(crate) struct EffectiveRates {
    max_upload_bps_normal: AtomicU32,
    max_upload_bps_seeding_only: AtomicU32,
    /// The ceiling the upload budgets actually enforce.
    max_upload_bps: AtomicU32,
    /// The ceiling the download budgets actually enforce (possibly inflated).
    max_download_bps: AtomicU32,
    /// Un-inflated configured download rate, reported to callers for display.
    external_max_download_bps: AtomicU32,
    max_lan_upload_bps: AtomicU32,
    max_lan_download_bps: AtomicU32,
    lan_rate_enabled: AtomicBool,
    seeding_only_allowed: AtomicBool,
    seeding_only_mode: AtomicBool,
}

impl EffectiveRates {
    pub(crate) fn new() -> Self {
        Self {
            max_upload_bps_normal: AtomicU32::new(UNLIMITED_RATE),
            max_upload_bps_seeding_only: AtomicU32::new(UNLIMITED_RATE),
            max_upload_bps: AtomicU32::new(UNLIMITED_RATE),
            max_download_bps: AtomicU32::new(UNLIMITED_RATE),
            external_max_download_bps: AtomicU32::new(0),
            max_lan_upload_bps: AtomicU32::new(UNLIMITED_RATE),
            max_lan_download_bps: AtomicU32::new(UNLIMITED_RATE),
            lan_rate_enabled: AtomicBool::new(false),
            seeding_only_allowed: AtomicBool::new(false),
            seeding_only_mode: AtomicBool::new(false),
        }
    }

    /// Recompute every derived ceiling from a fresh configuration snapshot.
    pub(crate) fn apply_config(&self, cfg: &NetworkConfig) {
        self.max_upload_bps_normal
            .store(clamp_rate_kbs(cfg.max_upload_kbs), Ordering::Relaxed);
        self.max_upload_bps_seeding_only.store(
            clamp_rate_kbs(cfg.max_upload_seeding_kbs),
            Ordering::Relaxed,
        );
        self.max_lan_upload_bps
            .store(clamp_rate_kbs(cfg.max_lan_upload_kbs), Ordering::Relaxed);
        self.max_lan_download_bps
            .store(clamp_rate_kbs(cfg.max_lan_download_kbs), Ordering::Relaxed);
        self.seeding_only_allowed
            .store(cfg.seeding_only_allowed, Ordering::Relaxed);
        self.lan_rate_enabled
            .store(cfg.lan_rate_enabled, Ordering::Relaxed);

        let raw_download = (u64::from(cfg.max_download_kbs) * 1024).min(u64::from(u32::MAX)) as u32;
        self.external_max_download_bps
            .store(raw_download, Ordering::Relaxed);
        let download = if raw_download < 1024 || raw_download > UNLIMITED_RATE {
            UNLIMITED_RATE
        } else if cfg.use_request_limiting {
            // Leave headroom for request-limiting admission control: the
            // internal ceiling runs max(10%, 5 KiB/s) hotter than configured.
            // The result may exceed the unlimited sentinel; it must not be
            // clamped back, or a finite configured rate near the sentinel
            // would report as unlimited.
            let headroom = (f64::from(raw_download) * 0.1).max(5.0 * 1024.0);
            raw_download + headroom as u32
        } else {
            raw_download
        };
        self.max_download_bps.store(download, Ordering::Relaxed);

        self.refresh_upload();

        tracing::debug!(
            upload = self.max_upload_bps.load(Ordering::Relaxed),
            download,
            lan_upload = self.max_lan_upload_bps.load(Ordering::Relaxed),
            lan_download = self.max_lan_download_bps.load(Ordering::Relaxed),
            lan_enabled = cfg.lan_rate_enabled,
            "effective rates recomputed"
        );
    }

    /// Select the enforced upload ceiling from the seeding state.
    fn refresh_upload(&self) {
        let effective = if self.is_seeding_only_upload_rate() {
            self.max_upload_bps_seeding_only.load(Ordering::Relaxed)
        } else {
            self.max_upload_bps_normal.load(Ordering::Relaxed)
        };
        if effective < 1024 {
            tracing::warn!(effective, "upload ceiling below minimum after clamp");
        }
        self.max_upload_bps.store(effective, Ordering::Relaxed);
    }

    pub(crate) fn set_seeding_only(&self, seeding_only: bool) {
        self.seeding_only_mode
            .store(seeding_only, Ordering::Relaxed);
        self.refresh_upload();
    }

    pub(crate) fn is_seeding_only_upload_rate(&self) -> bool {
        self.seeding_only_allowed.load(Ordering::Relaxed)
            && self.seeding_only_mode.load(Ordering::Relaxed)
    }

    pub(crate) fn is_lan_rate_enabled(&self) -> bool {
        self.lan_rate_enabled.load(Ordering::Relaxed)
    }

    fn class_limit(&self, class: TrafficClass) -> u32 {
        match class {
            TrafficClass::Upload => self.max_upload_bps.load(Ordering::Relaxed),
            TrafficClass::Download => self.max_download_bps.load(Ordering::Relaxed),
            TrafficClass::LanUpload => self.max_lan_upload_bps.load(Ordering::Relaxed),
            TrafficClass::LanDownload => self.max_lan_download_bps.load(Ordering::Relaxed),
        }
    }

    /// Display value: configured upload ceiling, `0` when unlimited.
    pub(crate) fn max_upload_rate_bps_normal(&self) -> u32 {
        let v = self.max_upload_bps_normal.load(Ordering::Relaxed);
        if v == UNLIMITED_RATE { 0 } else { v }
    }

    /// Display value: seeding-only upload ceiling, `0` when unlimited.
    pub(crate) fn max_upload_rate_bps_seeding_only(&self) -> u32 {
        let v = self.max_upload_bps_seeding_only.load(Ordering::Relaxed);
        if v == UNLIMITED_RATE { 0 } else { v }
    }

    /// Display value: configured download ceiling, `0` when unlimited.
    ///
    /// The internally enforced ceiling may run up to `max(10%, 5 KiB/s)`
    /// higher than this value; see the module docs.
    pub(crate) fn max_download_rate_bps(&self) -> u32 {
        if self.max_download_bps.load(Ordering::Relaxed) == UNLIMITED_RATE {
            0
        } else {
            self.external_max_download_bps.load(Ordering::Relaxed)
        }
    }
}

/// The four standing traffic classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrafficClass {
    Upload,
    Download,
    LanUpload,
    LanDownload,
}

impl TrafficClass {
    fn group_name(self) -> &'static str {
        match self {
            TrafficClass::Upload => "global_up",
            TrafficClass::Download => "global_down",
            TrafficClass::LanUpload => "global_lan_up",
            TrafficClass::LanDownload => "global_lan_down",
        }
    }
}

/// Rate group backed by the live derived ceilings.
pub(crate) struct GlobalRateGroup {
    rates: Arc<EffectiveRates>,
    class: TrafficClass,
}

impl GlobalRateGroup {
    pub(crate) fn new(rates: Arc<EffectiveRates>, class: TrafficClass) -> Self {
        Self { rates, class }
    }
}

impl RateGroup for GlobalRateGroup {
    fn name(&self) -> &str {
        self.class.group_name()
    }

    fn rate_limit_bytes_per_second(&self) -> u32 {
        self.rates.class_limit(self.class)
    }
}
