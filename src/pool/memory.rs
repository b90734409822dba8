//! In-memory stand-in for PostgreSQL used by unit tests.
//!
//! Interprets just enough of the statements the router and engines emit:
//! search path switches, schema create/drop, `CREATE TABLE`, transactions
//! (snapshot/restore), and the ledger methods of [`TenantClient`]. Any other
//! statement is recorded against the first schema of the search path.

use crate::error::Result;
use crate::pool::client::{ClientError, ConnectionPool, LedgerEntry, PoolStatus, TenantClient};
use crate::schema::LEDGER_TABLE;
use crate::tenant::SchemaName;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const DEFAULT_SEARCH_PATH: &str = "\"$user\", public";

#[derive(Debug, Clone, Default)]
struct Database {
    schemas: BTreeSet<String>,
    tables: BTreeSet<(String, String)>,
    ledgers: BTreeMap<String, BTreeMap<i32, LedgerEntry>>,
    executed: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct Failure {
    schema: Option<String>,
    needle: String,
}

#[derive(Default)]
struct Shared {
    db: Mutex<Database>,
    failures: Mutex<Vec<Failure>>,
    idle: Mutex<Vec<MemoryClient>>,
    created: AtomicUsize,
    discarded: AtomicUsize,
}

pub struct MemoryPool {
    shared: Arc<Shared>,
}

impl MemoryPool {
    pub fn new() -> Self {
        let shared = Shared::default();
        {
            let mut db = shared.db.lock().unwrap();
            db.schemas.insert("public".to_string());
            db.schemas.insert("information_schema".to_string());
            db.schemas.insert("pg_catalog".to_string());
        }
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn add_schema(&self, name: &str) {
        self.shared.db.lock().unwrap().schemas.insert(name.to_string());
    }

    pub fn add_table(&self, schema: &str, table: &str) {
        self.shared
            .db
            .lock()
            .unwrap()
            .tables
            .insert((schema.to_string(), table.to_string()));
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.shared.db.lock().unwrap().schemas.contains(name)
    }

    pub fn has_table(&self, schema: &str, table: &str) -> bool {
        self.shared
            .db
            .lock()
            .unwrap()
            .tables
            .contains(&(schema.to_string(), table.to_string()))
    }

    /// Creates a ledger holding `versions`.
    pub fn seed_ledger(&self, schema: &str, versions: &[i32]) {
        let mut db = self.shared.db.lock().unwrap();
        let ledger = db.ledgers.entry(schema.to_string()).or_default();
        for version in versions {
            ledger.insert(
                *version,
                LedgerEntry {
                    version: *version,
                    description: format!("seeded {}", version),
                    applied_at: Utc::now(),
                },
            );
        }
    }

    pub fn ledger_versions(&self, schema: &str) -> Option<Vec<i32>> {
        self.shared
            .db
            .lock()
            .unwrap()
            .ledgers
            .get(schema)
            .map(|ledger| ledger.keys().copied().collect())
    }

    /// Statements other than session/transaction control, in execution order.
    pub fn executed_in(&self, schema: &str) -> Vec<String> {
        self.shared
            .db
            .lock()
            .unwrap()
            .executed
            .iter()
            .filter(|(s, _)| s == schema)
            .map(|(_, stmt)| stmt.clone())
            .collect()
    }

    pub fn executed_count(&self) -> usize {
        self.shared.db.lock().unwrap().executed.len()
    }

    /// Statements containing `needle` fail, optionally only while `schema`
    /// heads the search path.
    pub fn fail_on(&self, schema: Option<&str>, needle: &str) {
        self.shared.failures.lock().unwrap().push(Failure {
            schema: schema.map(str::to_string),
            needle: needle.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.shared.failures.lock().unwrap().clear();
    }

    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> usize {
        self.shared.discarded.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().unwrap().len()
    }

    pub fn peek_idle_search_path(&self) -> Option<String> {
        let idle = self.shared.idle.lock().unwrap();
        idle.last()
            .map(|client| client.session.lock().unwrap().search_path.clone())
    }

    pub fn peek_idle_statement_timeout(&self) -> Option<String> {
        let idle = self.shared.idle.lock().unwrap();
        idle.last()
            .and_then(|client| client.session.lock().unwrap().statement_timeout.clone())
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    type Client = MemoryClient;

    async fn checkout(&self) -> Result<MemoryClient> {
        if let Some(client) = self.shared.idle.lock().unwrap().pop() {
            return Ok(client);
        }
        let id = self.shared.created.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryClient {
            id,
            shared: self.shared.clone(),
            session: Mutex::new(Session::default()),
        })
    }

    fn checkin(&self, client: MemoryClient) {
        self.shared.idle.lock().unwrap().push(client);
    }

    fn discard(&self, _client: MemoryClient) {
        self.shared.discarded.fetch_add(1, Ordering::SeqCst);
    }

    fn status(&self) -> PoolStatus {
        let available = self.idle_count();
        PoolStatus {
            max_size: 16,
            size: available,
            available,
        }
    }
}

#[derive(Debug)]
struct Session {
    search_path: String,
    statement_timeout: Option<String>,
    snapshot: Option<Database>,
    aborted: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            search_path: DEFAULT_SEARCH_PATH.to_string(),
            statement_timeout: None,
            snapshot: None,
            aborted: false,
        }
    }
}

impl Session {
    fn head_schema(&self) -> String {
        self.search_path
            .split(',')
            .next()
            .unwrap_or("")
            .trim()
            .trim_matches('"')
            .to_string()
    }
}

pub struct MemoryClient {
    id: usize,
    shared: Arc<Shared>,
    session: Mutex<Session>,
}

impl MemoryClient {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn statement_timeout(&self) -> Option<String> {
        self.session.lock().unwrap().statement_timeout.clone()
    }

    /// Applies failure injection and aborted-transaction semantics.
    fn guard(&self, statement: &str) -> std::result::Result<(), ClientError> {
        let mut session = self.session.lock().unwrap();
        let upper = statement.trim().to_ascii_uppercase();
        if session.aborted && upper != "ROLLBACK" {
            return Err(ClientError(
                "current transaction is aborted, commands ignored until end of transaction block"
                    .to_string(),
            ));
        }

        let head = session.head_schema();
        let failures = self.shared.failures.lock().unwrap();
        let hit = failures.iter().find(|f| {
            statement.contains(&f.needle) && f.schema.as_deref().map_or(true, |s| s == head)
        });
        if let Some(failure) = hit {
            if session.snapshot.is_some() {
                session.aborted = true;
            }
            return Err(ClientError(format!("simulated failure on '{}'", failure.needle)));
        }
        Ok(())
    }

    fn run(&self, statement: &str) -> std::result::Result<(), ClientError> {
        self.guard(statement)?;

        let mut session = self.session.lock().unwrap();
        let mut db = self.shared.db.lock().unwrap();
        let upper = statement.to_ascii_uppercase();

        if upper == "BEGIN" {
            session.snapshot = Some(db.clone());
        } else if upper == "COMMIT" {
            session.snapshot = None;
        } else if upper == "ROLLBACK" {
            if let Some(snapshot) = session.snapshot.take() {
                *db = snapshot;
            }
            session.aborted = false;
        } else if let Some(path) = statement.strip_prefix("SET search_path TO ") {
            session.search_path = path.trim().to_string();
        } else if let Some(value) = statement.strip_prefix("SET statement_timeout = ") {
            session.statement_timeout = Some(value.trim().to_string());
        } else if upper == "RESET STATEMENT_TIMEOUT" {
            session.statement_timeout = None;
        } else if let Some(rest) = statement.strip_prefix("CREATE SCHEMA IF NOT EXISTS ") {
            db.schemas.insert(unquote(rest));
        } else if let Some(rest) = statement.strip_prefix("DROP SCHEMA IF EXISTS ") {
            let name = unquote(rest.trim_end_matches("CASCADE").trim());
            db.schemas.remove(&name);
            db.ledgers.remove(&name);
            db.tables.retain(|(schema, _)| *schema != name);
        } else {
            let head = session.head_schema();
            if upper.starts_with("CREATE TABLE") {
                if !db.schemas.contains(&head) {
                    return Err(ClientError(format!("schema \"{}\" does not exist", head)));
                }
                let name = statement
                    .split_whitespace()
                    .find(|word| {
                        !matches!(
                            word.to_ascii_uppercase().as_str(),
                            "CREATE" | "TABLE" | "IF" | "NOT" | "EXISTS"
                        )
                    })
                    .map(|word| unquote(word.split('(').next().unwrap_or(word)))
                    .unwrap_or_default();
                db.tables.insert((head.clone(), name));
            }
            db.executed.push((head, statement.to_string()));
        }
        Ok(())
    }

    fn ledger_check(&self, schema: &SchemaName) -> std::result::Result<(), ClientError> {
        self.guard(LEDGER_TABLE)?;
        let db = self.shared.db.lock().unwrap();
        if !db.ledgers.contains_key(schema.as_str()) {
            return Err(ClientError(format!(
                "relation \"{}.{}\" does not exist",
                schema, LEDGER_TABLE
            )));
        }
        Ok(())
    }
}

fn unquote(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

#[async_trait]
impl TenantClient for MemoryClient {
    async fn batch_execute(&self, sql: &str) -> std::result::Result<(), ClientError> {
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            self.run(statement)?;
        }
        Ok(())
    }

    async fn schema_exists(&self, schema: &str) -> std::result::Result<bool, ClientError> {
        self.guard("pg_namespace")?;
        Ok(self.shared.db.lock().unwrap().schemas.contains(schema))
    }

    async fn list_schemas(&self) -> std::result::Result<Vec<String>, ClientError> {
        self.guard("pg_namespace")?;
        Ok(self.shared.db.lock().unwrap().schemas.iter().cloned().collect())
    }

    async fn table_exists(
        &self,
        schema: &SchemaName,
        table: &str,
    ) -> std::result::Result<bool, ClientError> {
        self.guard("information_schema.tables")?;
        let db = self.shared.db.lock().unwrap();
        if table == LEDGER_TABLE {
            return Ok(db.ledgers.contains_key(schema.as_str()));
        }
        Ok(db
            .tables
            .contains(&(schema.as_str().to_string(), table.to_string())))
    }

    async fn ensure_ledger(&self, schema: &SchemaName) -> std::result::Result<(), ClientError> {
        self.guard(LEDGER_TABLE)?;
        let mut db = self.shared.db.lock().unwrap();
        if !db.schemas.contains(schema.as_str()) {
            return Err(ClientError(format!("schema \"{}\" does not exist", schema)));
        }
        db.ledgers.entry(schema.as_str().to_string()).or_default();
        Ok(())
    }

    async fn ledger_entries(
        &self,
        schema: &SchemaName,
    ) -> std::result::Result<Vec<LedgerEntry>, ClientError> {
        self.ledger_check(schema)?;
        let db = self.shared.db.lock().unwrap();
        Ok(db
            .ledgers
            .get(schema.as_str())
            .map(|ledger| ledger.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_version(
        &self,
        schema: &SchemaName,
        version: i32,
        description: &str,
    ) -> std::result::Result<(), ClientError> {
        self.ledger_check(schema)?;
        let mut db = self.shared.db.lock().unwrap();
        if let Some(ledger) = db.ledgers.get_mut(schema.as_str()) {
            ledger.entry(version).or_insert_with(|| LedgerEntry {
                version,
                description: description.to_string(),
                applied_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn search_path(&self) -> std::result::Result<String, ClientError> {
        Ok(self.session.lock().unwrap().search_path.clone())
    }
}
