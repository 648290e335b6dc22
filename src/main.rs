use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{interval, Duration};

use worldrelay::http::serve;
use worldrelay::logging::{log, obj, ts_epoch_ms, v_str, Domain, Level};
use worldrelay::{Config, Relay};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let addr = cfg.listen_addr();
    let sweep_secs = cfg.limiter_sweep_secs;

    log(
        Level::Info,
        Domain::System,
        "starting",
        obj(&[
            ("addr", v_str(&addr)),
            ("data_dir", v_str(&cfg.data_dir.to_string_lossy())),
            ("allowed_worlds", json!(cfg.allowed_worlds)),
            ("cooldown_ms", json!(cfg.cooldown_ms)),
            ("write_token", json!(cfg.write_token.is_some())),
            ("replication", json!(cfg.github.is_active())),
        ]),
    );

    let relay = Arc::new(Relay::new(cfg)?);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    if sweep_secs > 0 {
        let sweeper = relay.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(sweep_secs));
            tick.tick().await;
            loop {
                tick.tick().await;
                sweeper.sweep_limiter(ts_epoch_ms());
            }
        });
    }

    serve(listener, relay.clone(), async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    log(Level::Info, Domain::System, "shutting_down", obj(&[]));
    match relay.documents().flush_all().await {
        Ok(written) => log(
            Level::Info,
            Domain::System,
            "final_flush",
            obj(&[("written", json!(written))]),
        ),
        Err(err) => log(
            Level::Error,
            Domain::System,
            "final_flush_failed",
            obj(&[("error", v_str(&err.to_string()))]),
        ),
    }
    Ok(())
}
