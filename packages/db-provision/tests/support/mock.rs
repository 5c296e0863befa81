//! In-memory backend and migration source for exercising the provisioning
//! algorithm without a database server.
//!
//! The mock tracks call counts and database state so tests can assert the
//! caching and cleanup properties: how often templates were created,
//! cloned and removed, and how often migrations actually ran.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use db_provision::{Backend, MigrationSource, ProvisionError};

/// One simulated database: migration status, ready marker and table rows.
#[derive(Clone, Default)]
#[derive(Debug)]
pub struct MockDatabase {
    pub migrated: bool,
    pub ready: bool,
    pub rows: HashMap<String, Vec<(String, String)>>,
}

/// Shared server state behind every mock backend, handle and source.
#[derive(Debug, Default)]
pub struct MockState {
    databases: Mutex<HashMap<String, MockDatabase>>,
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
    held: Mutex<HashMap<String, OwnedSemaphorePermit>>,
    pub creates: AtomicUsize,
    pub clones: AtomicUsize,
    pub removes: AtomicUsize,
}

impl MockState {
    pub fn exists(&self, name: &str) -> bool {
        self.databases.lock().unwrap().contains_key(name)
    }

    pub fn database(&self, name: &str) -> Option<MockDatabase> {
        self.databases.lock().unwrap().get(name).cloned()
    }

    pub fn template_names(&self) -> Vec<String> {
        self.databases
            .lock()
            .unwrap()
            .keys()
            .filter(|n| n.starts_with("test_template_"))
            .cloned()
            .collect()
    }

    pub fn locks_held(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Seed a database directly, bypassing the backend. Used to simulate
    /// leftovers from a crashed run.
    pub fn seed(&self, name: &str, db: MockDatabase) {
        self.databases.lock().unwrap().insert(name.to_string(), db);
    }
}

fn db_name(dsn: &str) -> String {
    dsn.rsplit('/').next().unwrap_or(dsn).to_string()
}

pub struct MockBackend {
    pub state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    type Conn = ();
    type Db = MockDb;

    async fn connect(&self, _dsn: &str) -> Result<Self::Conn, ProvisionError> {
        Ok(())
    }

    async fn lock(&self, _conn: &Self::Conn, name: &str) -> Result<(), ProvisionError> {
        let sem = {
            let mut locks = self.state.locks.lock().unwrap();
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        // Must not hold the map mutex across this await.
        let permit = sem.acquire_owned().await.expect("lock semaphore closed");
        self.state
            .held
            .lock()
            .unwrap()
            .insert(name.to_string(), permit);
        Ok(())
    }

    async fn unlock(&self, _conn: &Self::Conn, name: &str) -> Result<(), ProvisionError> {
        self.state
            .held
            .lock()
            .unwrap()
            .remove(name)
            .expect("unlock without matching lock");
        Ok(())
    }

    async fn exists(&self, _conn: &Self::Conn, name: &str) -> Result<bool, ProvisionError> {
        Ok(self.state.exists(name))
    }

    async fn create(&self, _conn: &Self::Conn, name: &str) -> Result<(), ProvisionError> {
        let mut dbs = self.state.databases.lock().unwrap();
        if dbs.contains_key(name) {
            return Err(ProvisionError::Config {
                message: format!("database {name} already exists"),
            });
        }
        dbs.insert(name.to_string(), MockDatabase::default());
        self.state.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_from_template(
        &self,
        _conn: &Self::Conn,
        template: &str,
        name: &str,
    ) -> Result<(), ProvisionError> {
        let mut dbs = self.state.databases.lock().unwrap();
        let Some(tpl) = dbs.get(template).cloned() else {
            return Err(ProvisionError::Config {
                message: format!("template {template} does not exist"),
            });
        };
        if dbs.contains_key(name) {
            return Err(ProvisionError::Config {
                message: format!("database {name} already exists"),
            });
        }
        dbs.insert(name.to_string(), tpl);
        self.state.clones.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, _conn: &Self::Conn, name: &str) -> Result<(), ProvisionError> {
        self.state.databases.lock().unwrap().remove(name);
        self.state.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn derive_dsn(&self, _base: &str, name: &str) -> Result<String, ProvisionError> {
        Ok(format!("mock://server/{name}"))
    }

    async fn template_ready(&self, dsn: &str) -> Result<bool, ProvisionError> {
        Ok(self
            .state
            .database(&db_name(dsn))
            .map(|db| db.ready)
            .unwrap_or(false))
    }

    async fn mark_template_ready(&self, dsn: &str) -> Result<(), ProvisionError> {
        let name = db_name(dsn);
        let mut dbs = self.state.databases.lock().unwrap();
        let db = dbs.get_mut(&name).expect("marking a missing database ready");
        db.ready = true;
        Ok(())
    }

    async fn wrap(&self, _root_dsn: &str, dsn: &str) -> Result<Self::Db, ProvisionError> {
        Ok(MockDb {
            name: db_name(dsn),
            dsn: dsn.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

/// Handle over one simulated instance database.
#[derive(Debug)]
pub struct MockDb {
    pub name: String,
    pub dsn: String,
    state: Arc<MockState>,
}

impl MockDb {
    pub fn insert(&self, table: &str, column: &str, value: &str) {
        let mut dbs = self.state.databases.lock().unwrap();
        let db = dbs.get_mut(&self.name).expect("instance database missing");
        db.rows
            .entry(table.to_string())
            .or_default()
            .push((column.to_string(), value.to_string()));
    }

    pub fn rows(&self, table: &str) -> Vec<(String, String)> {
        self.state
            .database(&self.name)
            .and_then(|db| db.rows.get(table).cloned())
            .unwrap_or_default()
    }

    pub fn drop_db(self) {
        self.state.databases.lock().unwrap().remove(&self.name);
        self.state.removes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Migration source with a configurable fingerprint and failure budget.
pub struct MockMigrations {
    fingerprint: String,
    state: Arc<MockState>,
    pub applied: AtomicUsize,
    fail_remaining: AtomicUsize,
}

impl MockMigrations {
    pub fn new(fingerprint: &str, state: Arc<MockState>) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            state,
            applied: AtomicUsize::new(0),
            fail_remaining: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` apply calls fail before succeeding.
    pub fn fail_next(self, n: usize) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl MigrationSource for MockMigrations {
    async fn fingerprint(&self) -> Result<String, ProvisionError> {
        Ok(self.fingerprint.clone())
    }

    async fn apply(&self, dsn: &str) -> Result<(), ProvisionError> {
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProvisionError::Migration {
                detail: "injected migration failure".to_string(),
            });
        }

        let name = db_name(dsn);
        let mut dbs = self.state.databases.lock().unwrap();
        let db = dbs.get_mut(&name).expect("applying to a missing database");
        db.migrated = true;
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
