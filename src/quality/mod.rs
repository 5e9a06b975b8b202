//! Rolling service quality tracking and quality-adaptive fallback.
//!
//! Every downstream call reports a [`PerformanceSample`]; samples are
//! classified into quality bands from per-service latency threshold
//! tables and kept in a bounded rolling window. Health is recomputed
//! from the recent window on each record. When a service goes
//! Unhealthy/Offline the monitor walks that service's ordered fallback
//! chain, probing each candidate, and routes future turns to the first
//! responder — or to the emergency handler when everything is down.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::schema::{BandThresholds, FallbackChain, QualityConfig};
use crate::pool::ServiceKind;

// ---------------------------------------------------------------------------
// Bands and health
// ---------------------------------------------------------------------------

/// Classification of a single sample's latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityBand {
    Excellent,
    Good,
    Acceptable,
    Poor,
    Unacceptable,
}

impl QualityBand {
    /// Numeric score used for health averaging (excellent=4 .. unacceptable=0).
    pub fn score(self) -> f64 {
        match self {
            QualityBand::Excellent => 4.0,
            QualityBand::Good => 3.0,
            QualityBand::Acceptable => 2.0,
            QualityBand::Poor => 1.0,
            QualityBand::Unacceptable => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityBand::Excellent => "excellent",
            QualityBand::Good => "good",
            QualityBand::Acceptable => "acceptable",
            QualityBand::Poor => "poor",
            QualityBand::Unacceptable => "unacceptable",
        }
    }
}

/// Rolling classification of a service's recent reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl ServiceHealth {
    pub fn needs_failover(self) -> bool {
        matches!(self, ServiceHealth::Unhealthy | ServiceHealth::Offline)
    }
}

/// One recorded downstream call.
#[derive(Debug, Clone)]
pub struct PerformanceSample {
    pub at: Instant,
    pub duration: Duration,
    pub success: bool,
    pub band: QualityBand,
}

/// Which instance a service category currently routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveRoute {
    Primary,
    Fallback(String),
    Emergency,
}

struct ServiceTrack {
    samples: VecDeque<PerformanceSample>,
    health: ServiceHealth,
    route: ActiveRoute,
}

impl ServiceTrack {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            health: ServiceHealth::Healthy,
            route: ActiveRoute::Primary,
        }
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Lightweight availability check issued before committing to a fallback
/// candidate.
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    async fn probe(&self, kind: ServiceKind, instance: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Read-only aggregate for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub health: ServiceHealth,
    pub active_instance: String,
    pub total_requests: usize,
    pub successful_requests: usize,
    pub success_rate: f64,
    pub mean_duration_secs: f64,
    pub band_distribution: HashMap<&'static str, usize>,
}

/// Operator-facing recommendation.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub service: &'static str,
    pub severity: &'static str,
    pub message: String,
}

/// Full quality report consumed by the pipeline and operational tooling.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub services: HashMap<&'static str, ServiceReport>,
    pub recommendations: Vec<Recommendation>,
}

// ---------------------------------------------------------------------------
// QualityMonitor
// ---------------------------------------------------------------------------

pub struct QualityMonitor {
    config: QualityConfig,
    tracks: Mutex<HashMap<ServiceKind, ServiceTrack>>,
}

impl QualityMonitor {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    fn thresholds(&self, kind: ServiceKind) -> BandThresholds {
        match kind {
            ServiceKind::Stt => self.config.stt_thresholds,
            ServiceKind::Llm => self.config.llm_thresholds,
            ServiceKind::Tts => self.config.tts_thresholds,
            // External calls are judged by the llm table.
            ServiceKind::External => self.config.llm_thresholds,
        }
    }

    fn chain(&self, kind: ServiceKind) -> Option<&FallbackChain> {
        match kind {
            ServiceKind::Stt => Some(&self.config.stt_chain),
            ServiceKind::Llm => Some(&self.config.llm_chain),
            ServiceKind::Tts => Some(&self.config.tts_chain),
            ServiceKind::External => None,
        }
    }

    /// Classify a duration against a service's threshold table.
    pub fn classify(&self, kind: ServiceKind, duration: Duration, success: bool) -> QualityBand {
        if !success {
            return QualityBand::Unacceptable;
        }
        let t = self.thresholds(kind);
        let secs = duration.as_secs_f64();
        if secs <= t.excellent {
            QualityBand::Excellent
        } else if secs <= t.good {
            QualityBand::Good
        } else if secs <= t.acceptable {
            QualityBand::Acceptable
        } else if secs <= t.poor {
            QualityBand::Poor
        } else {
            QualityBand::Unacceptable
        }
    }

    /// Record a sample and recompute the service's health.
    pub fn record(&self, kind: ServiceKind, duration: Duration, success: bool) -> QualityBand {
        let band = self.classify(kind, duration, success);
        let mut tracks = self.tracks.lock().unwrap();
        let track = tracks.entry(kind).or_insert_with(ServiceTrack::new);

        track.samples.push_back(PerformanceSample {
            at: Instant::now(),
            duration,
            success,
            band,
        });
        while track.samples.len() > self.config.window_size {
            track.samples.pop_front();
        }

        let recent_cutoff = Duration::from_secs(self.config.recent_window_secs);
        let recent: Vec<&PerformanceSample> = track
            .samples
            .iter()
            .filter(|s| s.at.elapsed() <= recent_cutoff)
            .collect();

        if !recent.is_empty() {
            let successes: Vec<&&PerformanceSample> =
                recent.iter().filter(|s| s.success).collect();
            let success_rate = successes.len() as f64 / recent.len() as f64;

            let new_health = if success_rate < 0.5 {
                ServiceHealth::Offline
            } else if success_rate < 0.7 {
                ServiceHealth::Unhealthy
            } else {
                let avg_score = successes.iter().map(|s| s.band.score()).sum::<f64>()
                    / successes.len() as f64;
                if avg_score >= 3.0 {
                    ServiceHealth::Healthy
                } else if avg_score >= 2.0 {
                    ServiceHealth::Degraded
                } else {
                    ServiceHealth::Unhealthy
                }
            };

            if new_health != track.health {
                info!(
                    "{} health: {:?} -> {:?}",
                    kind.as_str(),
                    track.health,
                    new_health
                );
                track.health = new_health;
            }
        }

        band
    }

    pub fn health(&self, kind: ServiceKind) -> ServiceHealth {
        self.tracks
            .lock()
            .unwrap()
            .get(&kind)
            .map(|t| t.health)
            .unwrap_or(ServiceHealth::Healthy)
    }

    /// Whether the service should switch away from its current instance.
    pub fn needs_failover(&self, kind: ServiceKind) -> bool {
        let tracks = self.tracks.lock().unwrap();
        match tracks.get(&kind) {
            Some(track) => track.health.needs_failover() && track.route != ActiveRoute::Emergency,
            None => false,
        }
    }

    /// The instance name future turns should use for this category.
    pub fn preferred_instance(&self, kind: ServiceKind) -> String {
        let chain = match self.chain(kind) {
            Some(c) => c,
            None => return String::new(),
        };
        let tracks = self.tracks.lock().unwrap();
        match tracks.get(&kind).map(|t| &t.route) {
            None | Some(ActiveRoute::Primary) => chain.primary.clone(),
            Some(ActiveRoute::Fallback(name)) => name.clone(),
            Some(ActiveRoute::Emergency) => chain.emergency.clone(),
        }
    }

    /// Whether the category is running on its emergency handler.
    pub fn is_emergency(&self, kind: ServiceKind) -> bool {
        matches!(
            self.tracks.lock().unwrap().get(&kind).map(|t| t.route.clone()),
            Some(ActiveRoute::Emergency)
        )
    }

    /// Walk the fallback chain for a category, probing each candidate, and
    /// switch to the first that responds. Falls back to the emergency
    /// handler when every candidate fails. Returns the selected instance.
    pub async fn fail_over(&self, kind: ServiceKind, probe: &dyn AvailabilityProbe) -> String {
        let chain = match self.chain(kind) {
            Some(c) => c.clone(),
            None => return String::new(),
        };

        for candidate in &chain.fallbacks {
            if probe.probe(kind, candidate).await {
                info!(
                    "{}: falling back from {} to {}",
                    kind.as_str(),
                    chain.primary,
                    candidate
                );
                let mut tracks = self.tracks.lock().unwrap();
                let track = tracks.entry(kind).or_insert_with(ServiceTrack::new);
                track.route = ActiveRoute::Fallback(candidate.clone());
                return candidate.clone();
            }
        }

        warn!(
            "{}: all fallbacks failed, switching to emergency handler {}",
            kind.as_str(),
            chain.emergency
        );
        let mut tracks = self.tracks.lock().unwrap();
        let track = tracks.entry(kind).or_insert_with(ServiceTrack::new);
        track.route = ActiveRoute::Emergency;
        chain.emergency
    }

    /// Operator override: route a category to a specific fallback now.
    pub fn force_fallback(&self, kind: ServiceKind, target: Option<&str>) -> bool {
        let chain = match self.chain(kind) {
            Some(c) => c.clone(),
            None => return false,
        };
        let target = match target {
            Some(t) => t.to_string(),
            None => match chain.fallbacks.first() {
                Some(t) => t.clone(),
                None => return false,
            },
        };
        info!("{}: forcing fallback to {}", kind.as_str(), target);
        let mut tracks = self.tracks.lock().unwrap();
        let track = tracks.entry(kind).or_insert_with(ServiceTrack::new);
        track.route = ActiveRoute::Fallback(target);
        track.health = ServiceHealth::Unhealthy;
        true
    }

    /// Operator reset: back to the primary instance with a clean window.
    pub fn reset(&self, kind: ServiceKind) {
        let mut tracks = self.tracks.lock().unwrap();
        let track = tracks.entry(kind).or_insert_with(ServiceTrack::new);
        track.samples.clear();
        track.health = ServiceHealth::Healthy;
        track.route = ActiveRoute::Primary;
        info!("{}: health reset to healthy", kind.as_str());
    }

    /// Read-only aggregate report for the pipeline and operator tooling.
    pub fn report(&self) -> QualityReport {
        let tracks = self.tracks.lock().unwrap();
        let mut services = HashMap::new();
        let mut recommendations = Vec::new();

        for (kind, track) in tracks.iter() {
            let successes: Vec<&PerformanceSample> =
                track.samples.iter().filter(|s| s.success).collect();
            let mut distribution: HashMap<&'static str, usize> = HashMap::new();
            for sample in &track.samples {
                *distribution.entry(sample.band.as_str()).or_default() += 1;
            }
            let mean_duration_secs = if successes.is_empty() {
                0.0
            } else {
                successes.iter().map(|s| s.duration.as_secs_f64()).sum::<f64>()
                    / successes.len() as f64
            };

            let active_instance = match &track.route {
                ActiveRoute::Primary => self
                    .chain(*kind)
                    .map(|c| c.primary.clone())
                    .unwrap_or_default(),
                ActiveRoute::Fallback(name) => name.clone(),
                ActiveRoute::Emergency => self
                    .chain(*kind)
                    .map(|c| c.emergency.clone())
                    .unwrap_or_default(),
            };

            match track.health {
                ServiceHealth::Degraded => recommendations.push(Recommendation {
                    service: kind.as_str(),
                    severity: "warning",
                    message: format!(
                        "{} performance is degraded - consider fallback options",
                        kind.as_str()
                    ),
                }),
                ServiceHealth::Unhealthy | ServiceHealth::Offline => {
                    recommendations.push(Recommendation {
                        service: kind.as_str(),
                        severity: "critical",
                        message: format!(
                            "{} is unhealthy - immediate fallback recommended",
                            kind.as_str()
                        ),
                    })
                }
                ServiceHealth::Healthy => {}
            }

            if *kind == ServiceKind::Llm
                && !successes.is_empty()
                && mean_duration_secs > self.config.slow_llm_secs
            {
                recommendations.push(Recommendation {
                    service: "llm",
                    severity: "info",
                    message: format!(
                        "model responses are slow (avg {:.2}s) - switch to a faster model",
                        mean_duration_secs
                    ),
                });
            }

            services.insert(
                kind.as_str(),
                ServiceReport {
                    health: track.health,
                    active_instance,
                    total_requests: track.samples.len(),
                    successful_requests: successes.len(),
                    success_rate: if track.samples.is_empty() {
                        1.0
                    } else {
                        successes.len() as f64 / track.samples.len() as f64
                    },
                    mean_duration_secs,
                    band_distribution: distribution,
                },
            );
        }

        QualityReport {
            services,
            recommendations,
        }
    }
}
