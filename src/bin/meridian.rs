use std::env;
use std::sync::Arc;

use getopts::Options;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian::agent::advisor::{AzureOpenAiAdvisor, FailoverAdvisor};
use meridian::agent::alerting::{AlertManager, AlertSink};
use meridian::agent::anomaly::AnomalyDetector;
use meridian::agent::config::AgentConfig;
use meridian::agent::context::AgentContext;
use meridian::agent::decision::FailoverManager;
use meridian::agent::dns_failover::{create_provider, DnsFailover};
use meridian::agent::log_evidence::{ElasticsearchClient, LogEvidenceSource};
use meridian::agent::probe::ProbeRunner;
use meridian::web::server::ApiServer;

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} -c CONFIG [options]", program);
    print!("{}", opts.usage(&brief));
}

/// Main entry point for the Meridian agent
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt("c", "config", "path to the JSON configuration file", "PATH");
    opts.optflag("", "validate", "validate the configuration and exit");
    opts.optflag("x", "disable-api", "disable the read-only HTTP API");

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}", f);
            std::process::exit(1);
        }
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let config_path = match opt_matches.opt_str("c") {
        Some(path) => path,
        None => {
            print_usage(&program, opts);
            std::process::exit(1);
        }
    };

    // Configuration errors are fatal at startup
    let config = match AgentConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    if opt_matches.opt_present("validate") {
        info!("configuration {} is valid", config_path);
        return;
    }

    info!(
        "meridian {} starting with {} instances",
        env!("CARGO_PKG_VERSION"),
        config.instances.len()
    );

    let context = AgentContext::new(config.clone());
    let alerts = AlertManager::new(config.alert_endpoints.clone());
    let alert_sink: Arc<dyn AlertSink> = alerts.clone();

    let detector = Arc::new(AnomalyDetector::new(
        &config.model_path,
        config.anomaly_threshold,
        config.instances.clone(),
        context.metrics.clone(),
        alert_sink.clone(),
    ));
    if let Err(e) = detector.initialize() {
        // The detector degrades to untrained; probing continues without it
        error!("failed to initialize anomaly detection: {}", e);
    }

    let evidence: Option<Arc<dyn LogEvidenceSource>> = if config.use_elk {
        let names = config
            .instances
            .iter()
            .map(|i| (i.uid.clone(), i.name.clone()))
            .collect();
        let client: Arc<dyn LogEvidenceSource> =
            ElasticsearchClient::new(config.elk.clone(), names);
        info!("log evidence client initialized");
        Some(client)
    } else {
        None
    };

    let advisor: Option<Arc<dyn FailoverAdvisor>> = if config.use_azure_openai {
        let client: Arc<dyn FailoverAdvisor> = AzureOpenAiAdvisor::new(config.azure_openai.clone());
        info!("failover advisor initialized");
        Some(client)
    } else {
        None
    };

    let executor = if config.failover_provider == "dns" {
        match create_provider(&config.dns_provider, &config.dns_config) {
            Ok(provider) => Some(DnsFailover::new(config.dns_config.clone(), provider)),
            Err(e) => {
                error!("failed to initialize DNS provider: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        warn!("no failover provider configured; decisions will not execute");
        None
    };

    let failover = FailoverManager::new(
        context.clone(),
        executor,
        alert_sink,
        advisor,
        evidence,
    );

    let probes = ProbeRunner::new(context.clone(), detector.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let probe_task = tokio::spawn(probes.run(shutdown_rx.clone()));
    let training_task = tokio::spawn(detector.clone().run(shutdown_rx.clone()));
    let decision_task = tokio::spawn(failover.clone().run(shutdown_rx));

    if config.api.enabled && !opt_matches.opt_present("x") {
        let api = ApiServer::new(context.clone(), alerts.clone(), failover.clone());
        std::thread::spawn(move || api.run());
    }

    info!("meridian agent started");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(probe_task, training_task, decision_task);

    // Model artifacts are flushed on orderly shutdown
    detector.save_models();
    info!("meridian agent stopped");
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
