// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pinpoint_agent::attribute;
use pinpoint_agent::logger::Formatter;
use pinpoint_agent::transport::TcpTransport;
use pinpoint_agent::{headers_to_metadata, Application, Config, Segment, Transaction};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const TASKS: usize = 5;

#[tokio::main]
pub async fn main() {
    let config = Config::from_env();
    let log_level = config
        .as_ref()
        .map_or(DEFAULT_LOG_LEVEL, |config| config.log_level.as_str());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .event_format(Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return;
        }
    };
    let addr = match config.collector.tcp_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    let app = match Application::new(config, Arc::new(TcpTransport::new(addr))) {
        Ok(app) => Arc::new(app),
        Err(e) => {
            error!("Unable to start the Pinpoint agent: {e}");
            return;
        }
    };

    let handles: Vec<_> = (0..TASKS)
        .map(|i| {
            let app = Arc::clone(&app);
            tokio::spawn(async move { handle_job(&app, i).await })
        })
        .collect();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Job failed: {e}");
        }
    }

    match app.shutdown(SHUTDOWN_TIMEOUT).await {
        Ok(()) => info!("Demo finished"),
        Err(e) => error!("{e}"),
    }
}

/// One unit of work, as if received from an upstream service.
async fn handle_job(app: &Application, i: usize) {
    let mut inbound = HashMap::new();
    if i % 2 == 1 {
        inbound.insert(
            "pinpoint-traceid".to_string(),
            format!("upstream^1700000000000^{i}"),
        );
        inbound.insert("pinpoint-spanid".to_string(), (1000 + i).to_string());
        inbound.insert("pinpoint-pspanid".to_string(), "999".to_string());
        inbound.insert("pinpoint-pappname".to_string(), "upstream".to_string());
        inbound.insert("pinpoint-papptype".to_string(), "1000".to_string());
    }

    let txn = app.start_transaction_with_metadata(format!("job-{i}"), &headers_to_metadata(&inbound));
    txn.add_attribute(attribute::HTTP_URL, format!("/jobs/{i}"));

    let load = txn.start_segment("load", None);
    query(&load, i).await;
    load.end();

    let mut outbound = HashMap::new();
    let call = txn.start_segment("call downstream", None);
    txn.outbound_headers(Some(&call), &mut outbound);
    debug!("Outbound headers: {outbound:?}");
    tokio::time::sleep(Duration::from_millis(5)).await;
    call.end();

    let background = txn.new_goroutine("job-cleanup");
    tokio::spawn(cleanup(background));

    if i == TASKS - 1 {
        txn.notice_error("last job always fails");
    }
    txn.add_attribute(attribute::HTTP_STATUS_CODE, 200);
    app.record_custom_metric("jobs.latency_ms", (10 * i) as f64);
    txn.end();
}

async fn query(parent: &Segment, i: usize) {
    let seg = parent.start_child("query");
    seg.add_attribute(attribute::SQL, "SELECT * FROM jobs WHERE id = ?");
    seg.add_attribute(attribute::SQL_BIND_VALUE, i.to_string());
    tokio::time::sleep(Duration::from_millis(2)).await;
    seg.end();
}

async fn cleanup(txn: Transaction) {
    let seg = txn.start_segment("cleanup", None);
    tokio::time::sleep(Duration::from_millis(3)).await;
    seg.end();
    txn.end();
}
