//! Cluster routing: the role-partitioned routing table with its TTL, and
//! the pool that keeps it fresh, routes acquisitions by access mode and
//! survives partial cluster failure.

use indexmap::IndexSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strut::logging;
use strut::logging::Logger;
use strut::time::timestamp_secs;

use crate::address::Address;
use crate::balance::{ConnectionCounter, LeastConnected, LoadBalancingStrategy};
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, Connector};
use crate::response::Handlers;
use crate::security::SecurityPlan;
use crate::value::{Value, ValueMap};

/// Dictates which role set an acquisition draws from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    #[inline]
    fn noun(self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        }
    }
}

const ROLE_ROUTE: &str = "ROUTE";
const ROLE_READ: &str = "READ";
const ROLE_WRITE: &str = "WRITE";

/// Role-partitioned view of the cluster with a time-to-live. Order within
/// each set is the order the server listed the addresses in.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    pub routers: IndexSet<Address>,
    pub readers: IndexSet<Address>,
    pub writers: IndexSet<Address>,
    /// Seconds the table stays valid after `last_updated_time`.
    pub ttl: u64,
    pub last_updated_time: u64,
}

impl RoutingTable {
    /// A born-stale table seeded with known routers.
    pub fn seeded(routers: &[Address], now: u64) -> RoutingTable {
        RoutingTable {
            routers: routers.iter().cloned().collect(),
            readers: IndexSet::new(),
            writers: IndexSet::new(),
            ttl: 0,
            last_updated_time: now,
        }
    }

    /// Parses a routing record: `{ttl, servers: [{role, addresses}, …]}`.
    /// Unknown roles are ignored; missing ROUTE or READ addresses are a
    /// protocol fault, missing WRITE addresses are legal.
    pub fn parse(record: &ValueMap, now: u64) -> Result<RoutingTable> {
        let malformed = || Error::RoutingProtocol("cannot parse routing record".to_string());

        let ttl = record.get("ttl").and_then(Value::as_int).ok_or_else(malformed)?;
        if ttl < 0 {
            return Err(malformed());
        }
        let servers = record
            .get("servers")
            .and_then(Value::as_list)
            .ok_or_else(malformed)?;

        let mut routers = IndexSet::new();
        let mut readers = IndexSet::new();
        let mut writers = IndexSet::new();
        for server in servers {
            let server = server.as_map().ok_or_else(malformed)?;
            let role = server
                .get("role")
                .and_then(Value::as_str)
                .ok_or_else(malformed)?;
            let target = match role {
                ROLE_ROUTE => &mut routers,
                ROLE_READ => &mut readers,
                ROLE_WRITE => &mut writers,
                _ => continue,
            };
            let addresses = server
                .get("addresses")
                .and_then(Value::as_list)
                .ok_or_else(malformed)?;
            for address in addresses {
                target.insert(Address::parse(address.as_str().ok_or_else(malformed)?)?);
            }
        }

        if routers.is_empty() {
            return Err(Error::RoutingProtocol(
                "no routing servers returned".to_string(),
            ));
        }
        if readers.is_empty() {
            return Err(Error::RoutingProtocol(
                "no read servers returned".to_string(),
            ));
        }
        Ok(RoutingTable {
            routers,
            readers,
            writers,
            ttl: ttl as u64,
            last_updated_time: now,
        })
    }

    /// Fresh for a mode when the table has not outlived its TTL, routers
    /// are known, and the side serving the mode is populated.
    pub fn is_fresh(&self, mode: AccessMode, now: u64) -> bool {
        let expired = self.last_updated_time + self.ttl <= now;
        let side = match mode {
            AccessMode::Read => &self.readers,
            AccessMode::Write => &self.writers,
        };
        !expired && !self.routers.is_empty() && !side.is_empty()
    }

    /// Atomically replaces the table's contents.
    pub fn update(&mut self, fresh: RoutingTable) {
        self.routers = fresh.routers;
        self.readers = fresh.readers;
        self.writers = fresh.writers;
        self.ttl = fresh.ttl;
        self.last_updated_time = fresh.last_updated_time;
    }
}

impl ConnectionCounter for ConnectionPool {
    fn in_use_connection_count(&self, address: &Address) -> usize {
        ConnectionPool::in_use_connection_count(self, address)
    }
}

/// Multi-address pool for cluster use. Owns a keyed direct pool, keeps the
/// routing table within its TTL, and dispatches acquisitions through the
/// load balancing strategy.
pub struct RoutingPool {
    pool: ConnectionPool,
    initial_router: Address,
    routing_context: ValueMap,
    table: Mutex<RoutingTable>,
    /// Serializes refreshes; never touched by callers that find the table
    /// fresh.
    refresh_lock: Mutex<()>,
    missing_writer: AtomicBool,
    balancer: Box<dyn LoadBalancingStrategy>,
    log: Logger,
}

impl RoutingPool {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        connector: Connector,
        plan: &SecurityPlan,
        initial_router: Address,
        routing_context: ValueMap,
        seed_routers: &[Address],
        config: Config,
        log: L,
    ) -> Result<RoutingPool> {
        if !plan.routing_compatible {
            return Err(Error::Configuration(
                "the configured trust mode is not compatible with routing".to_string(),
            ));
        }
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };
        let pool_log = log.new(logging::o!());
        Ok(RoutingPool {
            pool: ConnectionPool::new(connector, config, &pool_log),
            initial_router,
            routing_context,
            table: Mutex::new(RoutingTable::seeded(seed_routers, timestamp_secs())),
            refresh_lock: Mutex::new(()),
            missing_writer: AtomicBool::new(false),
            balancer: Box::new(LeastConnected::new()),
            log,
        })
    }

    /// Swaps the load balancing strategy.
    pub fn with_strategy(mut self, strategy: Box<dyn LoadBalancingStrategy>) -> RoutingPool {
        self.balancer = strategy;
        self
    }

    #[inline]
    pub fn missing_writer(&self) -> bool {
        self.missing_writer.load(Ordering::SeqCst)
    }

    /// A copy of the current routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.table.lock().clone()
    }

    #[inline]
    fn now(&self) -> u64 {
        timestamp_secs()
    }

    /// Asks one router for the raw routing record. `None` means the router
    /// could not be reached or dropped the connection mid-query; either way
    /// it has been deactivated. A router that answers with a failure is
    /// reported as unavailable routing support.
    pub fn fetch_routing_info(&self, router: &Address) -> Result<Option<ValueMap>> {
        let mut connection = match self.pool.acquire(router) {
            Ok(connection) => connection,
            Err(Error::ServiceUnavailable(reason)) => {
                logging::debug!(self.log, "router unreachable";
                                "context" => "fetch_routing_info",
                                "router" => %router,
                                "reason" => &reason);
                self.deactivate(router);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let result = self.routing_query(&mut connection);
        self.pool.release(connection);
        match result {
            Ok(record) => Ok(Some(record)),
            Err(Error::ServiceUnavailable(reason)) => {
                logging::debug!(self.log, "router dropped connection mid-query";
                                "context" => "fetch_routing_info",
                                "router" => %router,
                                "reason" => &reason);
                self.deactivate(router);
                Ok(None)
            }
            Err(Error::Transient(failure))
            | Err(Error::Database(failure))
            | Err(Error::Client(failure)) => Err(Error::ServiceUnavailable(format!(
                "routing support broken on server {}: {}",
                router, failure
            ))),
            Err(err) => Err(err),
        }
    }

    /// Runs the routing query appropriate for the connection's protocol
    /// version and returns the raw routing record.
    fn routing_query(&self, connection: &mut Connection) -> Result<ValueMap> {
        if connection.protocol_version() >= 3 {
            let summary: Arc<Mutex<Option<ValueMap>>> = Arc::new(Mutex::new(None));
            let sink = Arc::clone(&summary);
            connection.route(
                self.routing_context.clone(),
                Handlers::new().on_success(move |metadata| *sink.lock() = Some(metadata)),
            )?;
            connection.sync()?;
            let metadata = summary.lock().take().ok_or_else(|| {
                Error::RoutingProtocol("ROUTE completed without a summary".to_string())
            })?;
            metadata
                .get("rt")
                .and_then(Value::as_map)
                .cloned()
                .ok_or_else(|| {
                    Error::RoutingProtocol("routing record missing from ROUTE summary".to_string())
                })
        } else {
            let fields: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
            let records: Arc<Mutex<Vec<Vec<Value>>>> = Arc::new(Mutex::new(Vec::new()));
            let fields_sink = Arc::clone(&fields);
            let records_sink = Arc::clone(&records);

            let mut parameters = ValueMap::new();
            parameters.insert(
                "context".to_string(),
                Value::Map(self.routing_context.clone()),
            );
            connection.run(
                "CALL dbms.cluster.routing.getRoutingTable({context})",
                parameters,
                Default::default(),
                Handlers::new().on_success(move |metadata| {
                    if let Some(names) = metadata.get("fields").and_then(Value::as_list) {
                        *fields_sink.lock() = names
                            .iter()
                            .filter_map(|name| name.as_str().map(str::to_string))
                            .collect();
                    }
                }),
            )?;
            connection
                .pull_all(Handlers::new().on_records(move |batch| {
                    records_sink.lock().extend(batch)
                }))?;
            connection.sync()?;

            let records = records.lock();
            let fields = fields.lock();
            if records.len() != 1 {
                return Err(Error::RoutingProtocol(format!(
                    "expected exactly one routing record, received {}",
                    records.len()
                )));
            }
            let mut record = ValueMap::new();
            for (name, value) in fields.iter().zip(records[0].iter()) {
                record.insert(name.clone(), value.clone());
            }
            Ok(record)
        }
    }

    /// Fetches and parses a new routing table from one router, maintaining
    /// the missing-writer flag. `None` mirrors `fetch_routing_info`.
    pub fn fetch_routing_table(&self, router: &Address) -> Result<Option<RoutingTable>> {
        match self.fetch_routing_info(router)? {
            None => Ok(None),
            Some(record) => {
                let table = RoutingTable::parse(&record, self.now())?;
                self.missing_writer
                    .store(table.writers.is_empty(), Ordering::SeqCst);
                Ok(Some(table))
            }
        }
    }

    fn update_routing_table_from(&self, routers: &[Address]) -> Result<bool> {
        for router in routers {
            logging::debug!(self.log, "probing router";
                            "context" => "update_routing_table",
                            "router" => %router);
            if let Some(fresh) = self.fetch_routing_table(router)? {
                logging::debug!(self.log, "routing table replaced";
                                "context" => "update_routing_table",
                                "router" => %router,
                                "routers" => fresh.routers.len(),
                                "readers" => fresh.readers.len(),
                                "writers" => fresh.writers.len(),
                                "ttl" => fresh.ttl);
                self.table.lock().update(fresh);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Probes candidate routers for a new table: the initial router first
    /// when the current table lacks a writer, then the known routers in
    /// order, then the initial router as a last resort.
    pub fn update_routing_table(&self) -> Result<()> {
        let existing: Vec<Address> = self.table.lock().routers.iter().cloned().collect();
        let mut tried_initial = false;
        if self.missing_writer() {
            tried_initial = true;
            if self.update_routing_table_from(std::slice::from_ref(&self.initial_router))? {
                return Ok(());
            }
        }
        if self.update_routing_table_from(&existing)? {
            return Ok(());
        }
        if !tried_initial && !existing.contains(&self.initial_router) {
            if self.update_routing_table_from(std::slice::from_ref(&self.initial_router))? {
                return Ok(());
            }
        }
        Err(Error::ServiceUnavailable(
            "unable to retrieve routing information from any router".to_string(),
        ))
    }

    /// Refreshes the table unless it is already fresh for the mode. Fresh
    /// readers return immediately and never block on the refresh lock;
    /// stale callers serialize, re-check and refresh at most once per
    /// staleness. Returns whether a refresh happened.
    pub fn ensure_routing_table_is_fresh(&self, mode: AccessMode) -> Result<bool> {
        if self.table.lock().is_fresh(mode, self.now()) {
            return Ok(false);
        }
        let _refresh = self.refresh_lock.lock();
        {
            let table = self.table.lock();
            let now = self.now();
            if table.is_fresh(mode, now) {
                if mode == AccessMode::Read {
                    self.missing_writer
                        .store(!table.is_fresh(AccessMode::Write, now), Ordering::SeqCst);
                }
                return Ok(false);
            }
        }
        self.update_routing_table()?;
        Ok(true)
    }

    /// Borrows a connection to a server of the requested role. Unreachable
    /// addresses are deactivated and the next candidate tried; an exhausted
    /// candidate list forces one routing refresh before giving up.
    pub fn acquire(&self, mode: AccessMode) -> Result<Connection> {
        for attempt in 0..2 {
            self.ensure_routing_table_is_fresh(mode)?;
            loop {
                let candidates: Vec<Address> = {
                    let table = self.table.lock();
                    let side = match mode {
                        AccessMode::Read => &table.readers,
                        AccessMode::Write => &table.writers,
                    };
                    side.iter().cloned().collect()
                };
                let choice = match mode {
                    AccessMode::Read => self.balancer.select_reader(&self.pool, &candidates),
                    AccessMode::Write => self.balancer.select_writer(&self.pool, &candidates),
                };
                let address = match choice {
                    Some(address) => address,
                    None => break,
                };
                match self.pool.acquire(&address) {
                    Ok(connection) => return Ok(connection),
                    Err(Error::ServiceUnavailable(reason)) => {
                        logging::debug!(self.log, "candidate unreachable, deactivating";
                                        "context" => "acquire",
                                        "mode" => mode.noun(),
                                        "address" => %address,
                                        "reason" => &reason);
                        self.deactivate(&address);
                    }
                    Err(err) => return Err(err),
                }
            }
            if attempt == 0 {
                let _refresh = self.refresh_lock.lock();
                self.update_routing_table()?;
            }
        }
        Err(Error::ServiceUnavailable(format!(
            "no {} service currently available",
            mode.noun()
        )))
    }

    /// Returns a borrowed connection to the pool.
    pub fn release(&self, connection: Connection) {
        self.pool.release(connection)
    }

    /// Forgets an address entirely: removed from all three role sets, then
    /// from the underlying pool.
    pub fn deactivate(&self, address: &Address) {
        {
            let mut table = self.table.lock();
            table.routers.shift_remove(address);
            table.readers.shift_remove(address);
            table.writers.shift_remove(address);
        }
        self.pool.deactivate(address);
    }

    pub fn in_use_connection_count(&self, address: &Address) -> usize {
        self.pool.in_use_connection_count(address)
    }

    pub fn close(&self) {
        self.pool.close()
    }
}
