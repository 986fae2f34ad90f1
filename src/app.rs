//! Application wiring: configuration, store, dispatcher, controllers, and
//! the service manager.

use crate::alerts::Dispatcher;
use crate::cli::Cli;
use crate::config::{Config, DatabaseKind};
use crate::leader::LeaderElector;
use crate::logging;
use crate::reconcile::{
    Context, run_channel_controller, run_job_controller, run_monitor_controller,
};
use crate::services::controllers::ControllerService;
use crate::services::election::ElectionService;
use crate::services::retention::RetentionService;
use crate::services::warmer::StoreWarmerService;
use crate::services::{ServiceExit, ServiceManager};
use crate::signals;
use crate::sla::SlaAnalyzer;
use crate::store::{self, ExecutionStore};
use crate::{cluster, utils::fmt_duration};
use anyhow::Context as _;
use figment::providers::Env;
use figment::Figment;
use futures::FutureExt;
use kube::Client;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Main application struct containing all wired components.
pub struct App {
    config: Arc<Config>,
    store: Arc<dyn ExecutionStore>,
    dispatcher: Arc<Dispatcher>,
    service_manager: ServiceManager,
    // Keeps the always-leader watch alive when election is disabled.
    _leadership_tx: Option<watch::Sender<bool>>,
}

impl App {
    /// Load configuration, connect the store, and register all services.
    pub async fn new(cli: Cli) -> Result<Self, anyhow::Error> {
        let config: Config = Figment::new()
            .merge(Env::prefixed("GUARDIAN_").split("__"))
            .extract()
            .context("failed to load configuration")?;

        logging::setup_logging(&config, cli.log_format);

        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = if cfg!(debug_assertions) {
                "development"
            } else {
                "production"
            },
            "starting guardian"
        );

        let client = Client::try_default()
            .await
            .context("failed to build kubernetes client")?;
        let operator_namespace = client.default_namespace().to_string();

        // Network backends need credentials from the referenced secret.
        let credentials = match (&config.database.kind, &config.database.credentials_secret) {
            (DatabaseKind::Sqlite, _) => None,
            (_, Some(reference)) => Some(
                cluster::database_credentials(&client, reference)
                    .await
                    .context("failed to resolve database credentials")?,
            ),
            (_, None) => anyhow::bail!(
                "database kind {:?} requires GUARDIAN_DATABASE__CREDENTIALS_SECRET",
                config.database.kind
            ),
        };

        let store = store::connect(&config.database, credentials)
            .await
            .context("failed to connect execution store")?;

        let dispatcher = Arc::new(Dispatcher::new(&config.alerting));
        dispatcher
            .attach_store(Arc::clone(&store))
            .await
            .context("failed to recover dispatcher state")?;
        dispatcher.start();

        info!(
            startup_grace = fmt_duration(config.alerting.startup_grace),
            suppression_window = fmt_duration(config.alerting.suppression_window),
            "dispatcher ready"
        );

        let config = Arc::new(config);
        let ctx = Arc::new(Context {
            client: client.clone(),
            store: Arc::clone(&store),
            dispatcher: Arc::clone(&dispatcher),
            analyzer: SlaAnalyzer::new(Arc::clone(&store)),
            config: Arc::clone(&config),
        });

        let mut service_manager = ServiceManager::new();
        let controllers_token = CancellationToken::new();

        // Leadership gates the controllers and the retention sweeper.
        let (leadership, leadership_tx) = if config.leader_election.enabled {
            let identity = std::env::var("HOSTNAME")
                .unwrap_or_else(|_| format!("guardian-{}", std::process::id()));
            let lease_namespace = config
                .leader_election
                .lease_namespace
                .clone()
                .unwrap_or(operator_namespace);
            let (elector, leadership) = LeaderElector::new(
                client.clone(),
                &config.leader_election,
                &lease_namespace,
                identity,
            );
            service_manager.register(Box::new(ElectionService::new(
                Arc::new(elector),
                controllers_token.clone(),
            )));
            (leadership, None)
        } else {
            let (tx, rx) = watch::channel(true);
            info!("leader election disabled, assuming leadership");
            (rx, Some(tx))
        };

        service_manager.register(Box::new(ControllerService::new(
            "monitor-controller",
            leadership.clone(),
            controllers_token.clone(),
            {
                let ctx = Arc::clone(&ctx);
                let token = controllers_token.clone();
                async move {
                    run_monitor_controller(ctx, token)
                        .await
                        .map_err(anyhow::Error::from)
                }
                .boxed()
            },
        )));
        service_manager.register(Box::new(ControllerService::new(
            "job-controller",
            leadership.clone(),
            controllers_token.clone(),
            {
                let ctx = Arc::clone(&ctx);
                let token = controllers_token.clone();
                async move {
                    run_job_controller(ctx, token)
                        .await
                        .map_err(anyhow::Error::from)
                }
                .boxed()
            },
        )));
        service_manager.register(Box::new(ControllerService::new(
            "channel-controller",
            leadership.clone(),
            controllers_token.clone(),
            {
                let ctx = Arc::clone(&ctx);
                let token = controllers_token.clone();
                async move {
                    run_channel_controller(ctx, token)
                        .await
                        .map_err(anyhow::Error::from)
                }
                .boxed()
            },
        )));
        service_manager.register(Box::new(RetentionService::new(
            Arc::clone(&store),
            config.retention.clone(),
            leadership.clone(),
        )));
        service_manager.register(Box::new(StoreWarmerService::new(Arc::clone(&store))));

        Ok(Self {
            config,
            store,
            dispatcher,
            service_manager,
            _leadership_tx: leadership_tx,
        })
    }

    /// Spawn everything and block until a shutdown signal or the first
    /// service fault.
    pub async fn run(mut self) -> ExitCode {
        self.service_manager.spawn_all();

        let mut exit_code = ExitCode::SUCCESS;
        tokio::select! {
            (name, exit) = self.service_manager.first_exit() => {
                match &exit {
                    ServiceExit::Failed(e) => error!(service = %name, error = ?e, "service failed"),
                    ServiceExit::StopFailed(e) => error!(service = %name, error = ?e, "service cleanup failed"),
                    ServiceExit::Finished => warn!(service = %name, "service stopped on its own"),
                    ServiceExit::Stopped => info!(service = %name, "service stopped"),
                }
                if exit.is_fault() {
                    exit_code = ExitCode::FAILURE;
                }
            }
            _ = signals::shutdown_signal() => {}
        }

        let stragglers = self
            .service_manager
            .stop(self.config.shutdown_timeout)
            .await;
        if !stragglers.is_empty() {
            warn!(
                stragglers = ?stragglers,
                timeout = fmt_duration(self.config.shutdown_timeout),
                "shutdown budget elapsed with services still running"
            );
            exit_code = ExitCode::FAILURE;
        }

        self.dispatcher.shutdown();
        self.store.close().await;
        info!(exit_code = ?exit_code, "guardian stopped");
        exit_code
    }
}
