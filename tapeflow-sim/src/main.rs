//! Simulated multi-source feed driving the tapeflow core.
//!
//! A random-walk trade generator for three sources feeds batches onto an
//! mpsc channel; a periodic drain interval folds them through the
//! aggregation controller into a logging render sink. Faults stream to the
//! log, and ctrl-c tears the pipeline down.

use rand::Rng;
use tapeflow::{
    AggregationConfig, AggregationController, LogSink, SerieDefinition, Side, SourceId, Trade,
    VisualType,
};
use tokio::{
    signal,
    sync::mpsc,
    time::{Duration, interval},
};
use tracing::{info, warn};

const SOURCES: [&str; 3] = ["BINANCE", "BYBIT", "OKX"];

#[tokio::main]
async fn main() {
    init_logging();

    let config = AggregationConfig::default()
        .with_sources(&SOURCES)
        .with_bucket_width(5_000);
    let (mut controller, mut faults) = AggregationController::new(config, LogSink);

    tokio::spawn(async move {
        while let Some(fault) = faults.recv().await {
            warn!(serie = %fault.serie, message = fault.message(), "series fault");
        }
    });

    for definition in demo_series() {
        if let Err(error) = controller.add_serie(definition) {
            warn!(%error, "demo series rejected");
        }
    }

    let (feed_tx, mut feed_rx) = mpsc::unbounded_channel::<Vec<Trade>>();
    tokio::spawn(feed(feed_tx));

    info!(sources = SOURCES.len(), "tapeflow sim started");
    let mut drain = interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = drain.tick() => {
                while let Ok(batch) = feed_rx.try_recv() {
                    controller.queue_trades(batch);
                }
                let now_ms = chrono::Utc::now().timestamp_millis();
                controller.drain(now_ms);
                info!(notional = format!("{:.0}", controller.flow(now_ms)), "rolling flow");
            }
            _ = signal::ctrl_c() => {
                break;
            }
        }
    }

    controller.clear();
    info!("tapeflow sim stopped");
}

fn demo_series() -> Vec<SerieDefinition> {
    vec![
        SerieDefinition::new("volume", VisualType::Histogram, "vbuy + vsell"),
        SerieDefinition::new("cvd", VisualType::Line, "cum(vbuy - vsell)"),
        SerieDefinition::new("volume_ma", VisualType::Line, "avg(vbuy + vsell, options.length)")
            .with_option("length", 14.0),
        SerieDefinition::new("price", VisualType::Candlestick, "ohlc(close)"),
        SerieDefinition::new("liquidations", VisualType::Histogram, "lbuy + lsell"),
    ]
}

/// Random-walk batch generator: a handful of trades per source per tick.
async fn feed(feed_tx: mpsc::UnboundedSender<Vec<Trade>>) {
    let mut prices = [45_000.0_f64, 45_010.0, 44_995.0];
    let mut tick = interval(Duration::from_millis(250));
    loop {
        tick.tick().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut batch = Vec::new();
        {
            let mut rng = rand::rng();
            for (index, source) in SOURCES.iter().enumerate() {
                for _ in 0..rng.random_range(0..4) {
                    prices[index] += rng.random_range(-2.0..2.0);
                    batch.push(Trade {
                        exchange: SourceId::new(*source),
                        market: "btcusdt".into(),
                        price: prices[index],
                        amount: rng.random_range(0.001..0.5),
                        side: if rng.random_bool(0.5) { Side::Buy } else { Side::Sell },
                        liquidation: rng.random_bool(0.02),
                        time: now_ms,
                    });
                }
            }
        }
        if feed_tx.send(batch).is_err() {
            break;
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
