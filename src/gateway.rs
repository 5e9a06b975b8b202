//! Process-scoped gateway state.
//!
//! One [`Gateway`] owns every cross-session registry: the session
//! manager, interrupt manager, quality monitor, connection pools, call
//! history, and the pipeline controller wired over them. Nothing here is
//! a module-level global; construction and teardown are explicit.

use std::sync::Arc;

use serde_json::json;

use crate::config::schema::GatewayConfig;
use crate::engines::http::{
    HttpAvailabilityProbe, HttpLanguageModel, HttpSpeechSynthesis, HttpSpeechToText,
};
use crate::engines::{LanguageModel, SpeechSynthesis, SpeechToText};
use crate::history::{CallHistory, MemoryCallHistory, SqliteCallHistory};
use crate::interrupt::InterruptManager;
use crate::pipeline::PipelineController;
use crate::pool::{ConnectionPoolManager, ServiceKind};
use crate::quality::{AvailabilityProbe, QualityMonitor};
use crate::session::SessionManager;

pub struct Gateway {
    pub config: GatewayConfig,
    pub sessions: Arc<SessionManager>,
    pub interrupts: Arc<InterruptManager>,
    pub quality: Arc<QualityMonitor>,
    pub pools: Arc<ConnectionPoolManager>,
    pub history: Arc<dyn CallHistory>,
    pub pipeline: Arc<PipelineController>,
}

impl Gateway {
    /// Build a gateway with HTTP engine adapters from configuration.
    pub fn new(config: GatewayConfig) -> anyhow::Result<Arc<Self>> {
        let history: Arc<dyn CallHistory> = match &config.history.db_path {
            Some(path) => Arc::new(SqliteCallHistory::new(std::path::Path::new(path))?),
            None => Arc::new(MemoryCallHistory::new()),
        };

        let pools = Arc::new(ConnectionPoolManager::new(&config.pools));
        let stt: Arc<dyn SpeechToText> =
            Arc::new(HttpSpeechToText::new(pools.clone(), &config.engines.stt_url));
        let llm: Arc<dyn LanguageModel> =
            Arc::new(HttpLanguageModel::new(pools.clone(), &config.engines.llm_url));
        let tts: Arc<dyn SpeechSynthesis> =
            Arc::new(HttpSpeechSynthesis::new(pools.clone(), &config.engines.tts_url));
        let probe: Arc<dyn AvailabilityProbe> = Arc::new(HttpAvailabilityProbe::new(
            pools.clone(),
            &config.engines.stt_url,
            &config.engines.llm_url,
            &config.engines.tts_url,
        ));

        Ok(Self::with_engines(config, history, pools, stt, llm, tts, probe))
    }

    /// Build a gateway over explicit engines (tests, benches, embedders).
    pub fn with_engines(
        config: GatewayConfig,
        history: Arc<dyn CallHistory>,
        pools: Arc<ConnectionPoolManager>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn SpeechSynthesis>,
        probe: Arc<dyn AvailabilityProbe>,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionManager::new(config.session.clone(), history.clone()));
        let interrupts = Arc::new(InterruptManager::new(config.interrupt.clone()));
        let quality = Arc::new(QualityMonitor::new(config.quality.clone()));
        let pipeline = Arc::new(PipelineController::new(
            &config,
            sessions.clone(),
            quality.clone(),
            interrupts.clone(),
            history.clone(),
            stt,
            llm,
            tts,
            probe,
        ));

        Arc::new(Self {
            config,
            sessions,
            interrupts,
            quality,
            pools,
            history,
            pipeline,
        })
    }

    /// Operational snapshot: active sessions, service health, pool usage.
    pub fn status_report(&self) -> serde_json::Value {
        let quality = self.quality.report();
        let pool_stats: serde_json::Map<String, serde_json::Value> =
            [ServiceKind::Stt, ServiceKind::Llm, ServiceKind::Tts, ServiceKind::External]
                .into_iter()
                .map(|kind| {
                    let stats = self.pools.stats(kind);
                    (
                        kind.as_str().to_string(),
                        json!({
                            "requests": stats.requests,
                            "successes": stats.successes,
                            "failures": stats.failures,
                            "meanLatencyMs": stats.mean_latency().as_millis() as u64,
                        }),
                    )
                })
                .collect();

        json!({
            "activeSessions": self.sessions.active_count(),
            "sessions": self.sessions.snapshots(),
            "quality": serde_json::to_value(&quality).unwrap_or_default(),
            "pools": pool_stats,
        })
    }
}
