use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use replayfx::config::{EngineConfig, PoolConfig, ServerConfig};
use replayfx::data::{BarSource, CsvDir, HistoryCache};
use replayfx::engine::EngineSettings;
use replayfx::execution::RetryPolicy;
use replayfx::feed::{RestHistorySource, WsTickFeed};
use replayfx::jobs::JobManager;
use replayfx::live::{run_paper, PaperTrader};
use replayfx::logging::{flush, log, obj, v_num, v_str, Domain, Level};
use replayfx::notify::{spawn_dispatcher, LogSink, NotificationSink, WebhookSink};
use replayfx::storage::SqliteStore;
use replayfx::strategy::StrategyConfig;

fn symbols_from_env() -> Vec<String> {
    std::env::var("SYMBOLS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn strategy_from_env() -> Result<StrategyConfig> {
    match std::env::var("STRATEGY_FILE") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            let cfg: StrategyConfig = serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
            cfg.validate()?;
            Ok(cfg)
        }
        Err(_) => Ok(StrategyConfig::default()),
    }
}

fn sinks() -> Vec<Arc<dyn NotificationSink>> {
    let mut out: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
    if let Ok(url) = std::env::var("ALERT_WEBHOOK_URL") {
        out.push(Arc::new(WebhookSink::new(url)));
    }
    out
}

/// CSVs by default; with `HISTORY_URL` the listed `SYMBOLS` are fetched
/// once and served from memory.
async fn bar_source(engine: &EngineConfig, server: &ServerConfig) -> Result<Arc<dyn BarSource>> {
    let Some(url) = &server.history_url else {
        return Ok(Arc::new(CsvDir::new(engine.data_dir.clone(), engine.bar_interval_ms)));
    };
    let rest = RestHistorySource::new(url, engine.bar_interval_ms, RetryPolicy::from_env());
    let cache = HistoryCache::new(engine.bar_interval_ms);
    for symbol in symbols_from_env() {
        cache.load(&rest, &symbol).await?;
    }
    Ok(Arc::new(cache))
}

async fn serve() -> Result<()> {
    let engine = EngineConfig::from_env();
    let server = ServerConfig::from_env();
    let source = bar_source(&engine, &server).await?;
    let store = Arc::new(SqliteStore::open(&engine.sqlite_path)?);
    let (dispatcher, _notify) = spawn_dispatcher(sinks());
    let jobs = Arc::new(JobManager::new(&PoolConfig::from_env(), source, EngineSettings::from_env(), store, Some(dispatcher)));
    let recovered = jobs.recover()?;
    log(
        Level::Info,
        Domain::System,
        "serve",
        obj(&[("http", v_str(&server.http_addr)), ("ws", v_str(&server.ws_addr)), ("recovered", v_num(recovered.len() as f64))]),
    );
    replayfx::server::serve(&server, jobs).await
}

async fn paper() -> Result<()> {
    let engine = EngineConfig::from_env();
    let server = ServerConfig::from_env();
    let url = server.feed_url.ok_or_else(|| anyhow!("FEED_URL is required for paper mode"))?;
    let capital = replayfx::config::env_or("INITIAL_CAPITAL", 10_000.0);
    let settings = EngineSettings::from_env();
    let (dispatcher, _notify) = spawn_dispatcher(sinks());
    let mut trader = PaperTrader::new(strategy_from_env()?, capital, &settings, RetryPolicy::from_env(), engine.bar_interval_ms)
        .with_dispatcher(dispatcher);
    let feed = WsTickFeed::new(&url, RetryPolicy::from_env());
    run_paper(&feed, &symbols_from_env(), &mut trader, &settings.bus).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let mode = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());
    let result = match mode.as_str() {
        "serve" => serve().await,
        "paper" => paper().await,
        other => Err(anyhow!("unknown mode {other}; expected serve or paper")),
    };
    if let Err(e) = &result {
        log(Level::Fatal, Domain::System, "exit", obj(&[("error", v_str(&format!("{e:#}")))]));
    }
    flush();
    result
}
