//! Application state wiring the engine to its infrastructure.
//!
//! The controller is generic over its ports; `AppState` pins them to the
//! SQLite stores, the `kubectl exec` debug channel and the webhook notifier.
//! The CLI never drives jobs itself, so the execution backend is detached.

use conveyor_core::backend::debug::SentinelDebugChannel;
use conveyor_core::backend::execution::DetachedBackend;
use conveyor_core::controller::{ControllerSettings, TaskController};
use conveyor_core::event::bus::EventBus;
use conveyor_infra::config::{load_engine_config, resolve_poll_interval};
use conveyor_infra::notify::webhook::WebhookNotifier;
use conveyor_infra::remote::kubectl::KubectlExec;
use conveyor_infra::sqlite::definition::SqliteDefinitionStore;
use conveyor_infra::sqlite::pool::{DatabasePool, data_dir, database_url};
use conveyor_infra::sqlite::task::SqliteTaskRepository;

pub type ConcreteController = TaskController<
    SqliteTaskRepository,
    DetachedBackend,
    SentinelDebugChannel<KubectlExec>,
    WebhookNotifier,
>;

pub struct AppState {
    pub controller: ConcreteController,
    pub definitions: SqliteDefinitionStore,
}

impl AppState {
    /// Load config, open the database and wire the controller.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&config.database, &data_dir)).await?;

        let mut settings = ControllerSettings::from(&config.engine);
        settings.poll_interval = resolve_poll_interval(&config);

        let debug = SentinelDebugChannel::new(
            KubectlExec::new(config.kubectl.clone()),
            config.debug.marker_dir.clone(),
        );
        let notifier = WebhookNotifier::new(&config.notify)?;

        let controller = TaskController::new(
            SqliteTaskRepository::new(db_pool.clone()),
            DetachedBackend,
            debug,
            notifier,
            EventBus::new(config.engine.event_bus_capacity),
            settings,
        );

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");
        Ok(Self {
            controller,
            definitions: SqliteDefinitionStore::new(db_pool),
        })
    }
}
