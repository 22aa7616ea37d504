use std::{sync::Arc, time::Duration};

use pingora::services::{background::background_service, listening::Service};
use pingora_core::server::{configuration::Opt, Server};
use pingora_proxy::http_proxy_service_with_name;

use pingmesh::{
    balancer::Balancer,
    config::Config,
    core::{Clock, ReadySource, Readiness, SystemClock},
    export::{BillingExporter, ExportService, ExportSink, FileSink, LogSink},
    logging::Logger,
    policy::PolicyStore,
    registry::{InstanceStore, Sweeper},
    service::{
        balancer::{BalancerHttpApp, BalancerState},
        edge::EdgeProxy,
        registry::RegistryHttpApp,
        status::StatusHttpApp,
    },
    stats::StatsAggregator,
};

const EDGE_SERVICE: &str = "pingmesh-edge";

struct Stores {
    registry: Arc<InstanceStore>,
    balancer: Arc<Balancer>,
    exporter: Arc<BillingExporter>,
    readiness: Arc<Readiness>,
}

fn main() {
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let logger = if let Some(log_cfg) = &config.log {
        let logger = Logger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        env_logger::init();
        None
    };

    let stores = build_stores(&config);

    let mut server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log writer service...");
        server.add_service(log_service);
    }

    log::info!("Adding registry HTTP on {}...", config.registry.address);
    server.add_service(RegistryHttpApp::registry_http_service(
        stores.registry.clone(),
        &config.registry.address,
    ));

    log::info!("Adding balancer HTTP on {}...", config.balancer.address);
    let state = BalancerState {
        balancer: stores.balancer.clone(),
        exporter: stores.exporter.clone(),
        api_key: config.admin.as_ref().map(|admin| admin.api_key.clone()),
    };
    if state.api_key.is_none() {
        log::warn!("No admin api_key configured, policy updates are disabled");
    }
    server.add_service(BalancerHttpApp::balancer_http_service(
        state,
        &config.balancer.address,
    ));

    if let Some(proxy_address) = &config.balancer.proxy_address {
        log::info!("Adding proxy edge on {proxy_address}...");
        let mut edge = http_proxy_service_with_name(
            &server.configuration,
            EdgeProxy::new(stores.balancer.clone()),
            EDGE_SERVICE,
        );
        edge.add_tcp(&proxy_address.to_string());
        server.add_service(edge);
    }

    if let Some(status_cfg) = &config.status {
        log::info!("Adding status HTTP on {}...", status_cfg.address);
        server.add_service(StatusHttpApp::status_http_service(
            status_cfg,
            stores.readiness.clone(),
        ));
    }

    if let Some(prometheus_cfg) = &config.prometheus {
        log::info!("Adding Prometheus HTTP on {}...", prometheus_cfg.address);
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }

    log::info!("Adding expiry sweeper...");
    let sweeper = Sweeper::new(
        stores.registry.clone(),
        Duration::from_millis(config.registry.sweep_interval_ms),
        Duration::from_secs(config.registry.expired_grace_seconds),
    )
    .with_stats(stores.balancer.stats().clone());
    server.add_service(background_service("expiry sweeper", sweeper));

    if let Some(export_cfg) = &config.export {
        let sink: Box<dyn ExportSink> = match &export_cfg.directory {
            Some(dir) => Box::new(FileSink::new(dir)),
            None => Box::new(LogSink),
        };
        log::info!(
            "Adding billing export every {}s over the {}s window...",
            export_cfg.interval_seconds,
            stores.exporter.window_seconds()
        );
        let exporter = ExportService::new(
            stores.exporter.clone(),
            sink,
            Duration::from_secs(export_cfg.interval_seconds),
        );
        server.add_service(background_service("billing export", exporter));
    }

    log::info!("Bootstrapping...");
    server.bootstrap();

    log::info!("Starting Server...");
    server.run_forever();
}

/// Build the shared stores and apply the static seed from the config file.
fn build_stores(config: &Config) -> Stores {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let registry = Arc::new(InstanceStore::new(
        clock.clone(),
        config.registry.default_ttl_seconds,
    ));
    for spec in &config.registry.instances {
        match registry.register(spec.clone()) {
            Ok(record) => log::info!(
                "Seeded instance '{}' of image '{}' at {}",
                record.instance_id,
                record.image,
                record.address()
            ),
            Err(e) => log::warn!("Skipping seeded instance of image '{}': {e}", spec.image),
        }
    }

    let policies = Arc::new(PolicyStore::new());
    for (image, policy) in &config.balancer.policies {
        // Policies from the config file carry the operator's authority.
        if let Err(e) = policies.set(image, policy.clone(), true) {
            log::warn!("Skipping policy for image '{image}': {e}");
        }
    }

    let stats = Arc::new(StatsAggregator::new(
        &config.stats.windows_seconds,
        config.stats.archive_depth,
        clock.clone(),
    ));
    let readiness = Arc::new(Readiness::new());

    let balancer = Arc::new(Balancer::new(
        registry.clone(),
        policies,
        stats.clone(),
        readiness.clone(),
        config.balancer.least_conn_decay_ms,
    ));
    let exporter = Arc::new(
        BillingExporter::new(stats, clock, config.export_window()).with_registry(registry.clone()),
    );

    let source = if config.registry.instances.is_empty() && config.balancer.policies.is_empty() {
        ReadySource::Stores
    } else {
        ReadySource::StaticSeed
    };
    readiness.mark_ready(source);

    Stores {
        registry,
        balancer,
        exporter,
        readiness,
    }
}
