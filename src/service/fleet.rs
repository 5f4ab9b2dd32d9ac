//! A configured fleet: SQLite store, event journal and the three services.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::fusion::engine::FusionEngine;
use crate::logger::journal::{self, JournalEvent, JournalHandle};
use crate::logger::jsonl::JsonlConfig;
use crate::service::upload::UploadService;
use crate::store::sqlite::SqliteStore;
use crate::telemetry::ingestor::TelemetryIngestor;

pub struct Fleet {
    pub store: Arc<SqliteStore>,
    pub uploads: UploadService,
    pub telemetry: TelemetryIngestor,
    pub fusion: FusionEngine,
    config: Config,
    journal: JournalHandle,
    journal_thread: Option<JoinHandle<()>>,
}

impl Fleet {
    /// Open the store at `paths.sqlite_db` and start the journal.
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Arc::new(SqliteStore::open_with_connections(
            &config.paths.sqlite_db,
            config.storage.busy_timeout(),
            config.storage.connections,
        )?);

        let (journal, journal_thread) = if config.journal.enabled {
            let jsonl = JsonlConfig::from_journal(config.paths.jsonl_log.clone(), &config.journal);
            let (handle, thread) = journal::spawn_default(jsonl)?;
            handle.send(JournalEvent::ServiceStarted {
                version: env!("CARGO_PKG_VERSION").to_string(),
                config_hash: config.stable_hash()?,
            });
            (handle, Some(thread))
        } else {
            (JournalHandle::noop(), None)
        };

        let uploads = UploadService::new(store.clone(), Arc::clone(&clock), config.upload.clone())
            .with_directory(store.clone())
            .with_journal(journal.clone());
        let telemetry =
            TelemetryIngestor::new(store.clone(), Arc::clone(&clock), config.telemetry.clone())
                .with_directory(store.clone())
                .with_journal(journal.clone());
        let fusion = FusionEngine::new(store.clone(), store.clone(), store.clone());

        Ok(Self {
            store,
            uploads,
            telemetry,
            fusion,
            config,
            journal,
            journal_thread,
        })
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Drop positions older than `storage.position_retention_days`.
    pub fn prune(&self) -> Result<u64> {
        let retention =
            chrono::Duration::days(i64::from(self.config.storage.position_retention_days));
        self.telemetry.prune(retention)
    }

    /// Record a failure that never reached a service.
    pub fn report_error(&self, code: &str, message: &str) {
        self.journal.send(JournalEvent::Error {
            code: code.to_string(),
            message: message.to_string(),
        });
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        if let Some(thread) = self.journal_thread.take() {
            self.journal.shutdown();
            if thread.join().is_err() {
                eprintln!("[FFX-JOURNAL] writer thread panicked during shutdown");
            }
        }
    }
}
