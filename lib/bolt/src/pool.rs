//! Bounded, health-checked connection pooling. A keyed pool manages one
//! slot of reusable connections per address; the single-address façade
//! pins it to one server for direct use.

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use std::time::Instant;

use strut::logging;
use strut::logging::Logger;

use crate::address::Address;
use crate::config::Config;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};

/// Opens a fresh, authenticated, READY connection to an address.
pub type Connector = Box<dyn Fn(&Address) -> Result<Connection> + Send + Sync>;

struct Slot {
    idle: Vec<Connection>,
    in_use: usize,
    /// Cleared by deactivation; in-use connections of an inactive slot are
    /// closed when they come back.
    active: bool,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            idle: Vec::new(),
            in_use: 0,
            active: true,
        }
    }
}

struct PoolState {
    slots: HashMap<Address, Slot>,
    closed: bool,
}

/// Keyed connection pool. `acquire`/`release`/`deactivate`/`close` are safe
/// under concurrent callers; all bookkeeping hides behind one mutex, with a
/// condvar handing out capacity as it frees up.
pub struct ConnectionPool {
    connector: Connector,
    config: Config,
    state: Mutex<PoolState>,
    released: Condvar,
    log: Logger,
}

impl ConnectionPool {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        connector: Connector,
        config: Config,
        log: L,
    ) -> ConnectionPool {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };
        ConnectionPool {
            connector,
            config,
            state: Mutex::new(PoolState {
                slots: HashMap::new(),
                closed: false,
            }),
            released: Condvar::new(),
            log,
        }
    }

    /// Borrows a READY connection for the address, creating one if the slot
    /// has spare capacity, otherwise waiting for a release until the
    /// acquisition timeout runs out.
    pub fn acquire(&self, address: &Address) -> Result<Connection> {
        let deadline = Instant::now() + self.config.connection_acquisition_timeout();
        let max_lifetime = self.config.max_connection_lifetime();
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::ServiceUnavailable(
                    "connection pool is closed".to_string(),
                ));
            }
            let slot = state
                .slots
                .entry(address.clone())
                .or_insert_with(Slot::new);

            // Stale free-list entries are discarded transparently.
            while let Some(mut connection) = slot.idle.pop() {
                if connection.is_defunct()
                    || connection.is_closed()
                    || connection.age() > max_lifetime
                {
                    logging::debug!(self.log, "discarding stale pooled connection";
                                    "context" => "acquire",
                                    "address" => %address,
                                    "state" => ?connection.state());
                    connection.close();
                    continue;
                }
                slot.in_use += 1;
                connection.set_in_use(true);
                logging::trace!(self.log, "reusing pooled connection";
                                "context" => "acquire",
                                "address" => %address,
                                "in_use" => slot.in_use);
                return Ok(connection);
            }

            if slot.in_use < self.config.max_connection_pool_size {
                // Reserve capacity, then connect without blocking the pool.
                slot.in_use += 1;
                drop(state);
                let connected = (self.connector)(address);
                state = self.state.lock();
                let pool_closed = state.closed;
                let slot = state
                    .slots
                    .entry(address.clone())
                    .or_insert_with(Slot::new);
                match connected {
                    Ok(mut connection) => {
                        if pool_closed {
                            slot.in_use -= 1;
                            connection.close();
                            return Err(Error::ServiceUnavailable(
                                "connection pool is closed".to_string(),
                            ));
                        }
                        connection.set_in_use(true);
                        logging::debug!(self.log, "connection established";
                                        "context" => "acquire",
                                        "address" => %address,
                                        "in_use" => slot.in_use);
                        return Ok(connection);
                    }
                    Err(err) => {
                        slot.in_use -= 1;
                        self.released.notify_one();
                        return Err(err);
                    }
                }
            }

            logging::trace!(self.log, "pool at capacity, waiting for a release";
                            "context" => "acquire",
                            "address" => %address);
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return Err(Error::client(format!(
                    "failed to obtain a connection to {} from the pool within {:.0?}; \
                     the pool is exhausted",
                    address,
                    self.config.connection_acquisition_timeout()
                )));
            }
        }
    }

    /// Returns a connection to its slot. Defunct, expired, deactivated or
    /// unquiesceable connections are closed instead of pooled.
    pub fn release(&self, mut connection: Connection) {
        connection.set_in_use(false);
        let dirty = connection.state() != ConnectionState::Ready
            || connection.pending_responses() > 0;
        if dirty && !connection.is_defunct() && !connection.is_closed() {
            // Quiesce abandoned results or failure state before pooling.
            if connection.reset().is_err() {
                connection.close();
            }
        }

        let mut state = self.state.lock();
        let pool_closed = state.closed;
        let address = connection.address().clone();
        let mut remove_slot = false;
        match state.slots.get_mut(&address) {
            Some(slot) => {
                slot.in_use = slot.in_use.saturating_sub(1);
                let expired = connection.age() > self.config.max_connection_lifetime();
                if pool_closed
                    || !slot.active
                    || expired
                    || connection.is_defunct()
                    || connection.is_closed()
                {
                    logging::debug!(self.log, "closing released connection";
                                    "context" => "release",
                                    "address" => %address,
                                    "expired" => expired,
                                    "slot_active" => slot.active);
                    connection.close();
                    remove_slot = !slot.active && slot.in_use == 0 && slot.idle.is_empty();
                } else {
                    slot.idle.push(connection);
                }
            }
            None => connection.close(),
        }
        if remove_slot {
            state.slots.remove(&address);
        }
        self.released.notify_one();
    }

    /// Removes the slot: idle connections close immediately, in-use ones
    /// are marked to close on release.
    pub fn deactivate(&self, address: &Address) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(address) {
            logging::debug!(self.log, "deactivating address";
                            "context" => "deactivate",
                            "address" => %address,
                            "idle" => slot.idle.len(),
                            "in_use" => slot.in_use);
            for mut connection in slot.idle.drain(..) {
                connection.close();
            }
            slot.active = false;
            if slot.in_use == 0 {
                state.slots.remove(address);
            }
        }
        self.released.notify_all();
    }

    /// Connections handed out to borrowers for the address, including
    /// capacity reserved for in-flight connection attempts.
    pub fn in_use_connection_count(&self, address: &Address) -> usize {
        let state = self.state.lock();
        state
            .slots
            .get(address)
            .map(|slot| slot.in_use)
            .unwrap_or(0)
    }

    /// Drains and closes every slot; subsequent acquires fail.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        logging::debug!(self.log, "closing connection pool"; "context" => "close");
        for (_, slot) in state.slots.iter_mut() {
            for mut connection in slot.idle.drain(..) {
                connection.close();
            }
        }
        state.slots.retain(|_, slot| slot.in_use > 0);
        self.released.notify_all();
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bounded pool of connections to a single server address.
pub struct DirectPool {
    pool: ConnectionPool,
    address: Address,
}

impl DirectPool {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        connector: Connector,
        address: Address,
        config: Config,
        log: L,
    ) -> DirectPool {
        DirectPool {
            pool: ConnectionPool::new(connector, config, log),
            address,
        }
    }

    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn acquire(&self) -> Result<Connection> {
        self.pool.acquire(&self.address)
    }

    pub fn release(&self, connection: Connection) {
        self.pool.release(connection)
    }

    pub fn in_use_connection_count(&self) -> usize {
        self.pool.in_use_connection_count(&self.address)
    }

    pub fn close(&self) {
        self.pool.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthToken;
    use crate::connection::connect;
    use crate::security::SecurityPlan;
    use crate::testing::{meta, Script, StubServer};
    use std::sync::Arc;
    use std::time::Duration;

    fn pool_config() -> Config {
        Config {
            encrypted: Some(false),
            connection_timeout: 2.0,
            auth: AuthToken::basic("neotest", "neotest"),
            ..Config::default()
        }
    }

    fn connector_for(config: &Config) -> Connector {
        let config = config.clone();
        Box::new(move |address: &Address| {
            connect(address, &config, &SecurityPlan::off(), None)
        })
    }

    fn pool_for(config: Config) -> ConnectionPool {
        ConnectionPool::new(connector_for(&config), config, None)
    }

    #[test]
    fn test_acquire_marks_in_use_and_release_reuses() {
        let server = StubServer::start(Script::hello());
        let config = pool_config();
        let pool = pool_for(config);
        let address = server.address();

        let cx = pool.acquire(&address).unwrap();
        assert!(cx.in_use());
        assert_eq!(pool.in_use_connection_count(&address), 1);

        pool.release(cx);
        assert_eq!(pool.in_use_connection_count(&address), 0);

        let cx = pool.acquire(&address).unwrap();
        assert!(cx.in_use());
        pool.release(cx);
        assert_eq!(server.connections_accepted(), 1);
    }

    #[test]
    fn test_capacity_bound_and_acquisition_timeout() {
        let server = StubServer::start(Script::hello());
        let config = Config {
            max_connection_pool_size: 1,
            connection_acquisition_timeout: 0.2,
            ..pool_config()
        };
        let pool = pool_for(config);
        let address = server.address();

        let held = pool.acquire(&address).unwrap();
        let started = Instant::now();
        match pool.acquire(&address) {
            Err(Error::Client(failure)) => assert!(failure.message.contains("exhausted")),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
        assert!(started.elapsed() >= Duration::from_millis(200));
        pool.release(held);

        // capacity is back
        let cx = pool.acquire(&address).unwrap();
        pool.release(cx);
    }

    #[test]
    fn test_blocked_acquire_wakes_on_release() {
        let server = StubServer::start(Script::hello());
        let config = Config {
            max_connection_pool_size: 1,
            connection_acquisition_timeout: 5.0,
            ..pool_config()
        };
        let pool = Arc::new(pool_for(config));
        let address = server.address();

        let held = pool.acquire(&address).unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            let address = address.clone();
            std::thread::spawn(move || pool.acquire(&address).map(|cx| pool.release(cx)))
        };
        std::thread::sleep(Duration::from_millis(100));
        pool.release(held);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_expired_connections_are_not_pooled() {
        let server = StubServer::start(Script::hello());
        let config = Config {
            max_connection_lifetime: 0.0,
            ..pool_config()
        };
        let pool = pool_for(config);
        let address = server.address();

        let cx = pool.acquire(&address).unwrap();
        pool.release(cx);
        let cx = pool.acquire(&address).unwrap();
        pool.release(cx);
        assert_eq!(server.connections_accepted(), 2);
    }

    #[test]
    fn test_release_quiesces_failed_connection() {
        let script = Script::hello()
            .recv()
            .failure("Neo.ClientError.Statement.SyntaxError", "bad")
            .recv()
            .success(meta(&[]));
        let server = StubServer::start(script);
        let pool = pool_for(pool_config());
        let address = server.address();

        let mut cx = pool.acquire(&address).unwrap();
        cx.run("RETURN $", Default::default(), Default::default(), crate::response::NoOpResponse)
            .unwrap();
        assert!(cx.sync().is_err());
        pool.release(cx);

        // the same connection comes back, reset to READY
        let cx = pool.acquire(&address).unwrap();
        assert_eq!(cx.state(), ConnectionState::Ready);
        assert_eq!(server.connections_accepted(), 1);
        pool.release(cx);
    }

    #[test]
    fn test_deactivate_closes_idle_and_marks_in_use() {
        let server = StubServer::start(Script::hello());
        let pool = pool_for(pool_config());
        let address = server.address();

        let held = pool.acquire(&address).unwrap();
        let idle = pool.acquire(&address).unwrap();
        pool.release(idle);

        pool.deactivate(&address);
        // the held connection is closed on release rather than pooled
        pool.release(held);
        assert_eq!(pool.in_use_connection_count(&address), 0);

        // the slot is gone; acquiring again dials fresh
        let cx = pool.acquire(&address).unwrap();
        assert_eq!(server.connections_accepted(), 3);
        pool.release(cx);
    }

    #[test]
    fn test_closed_pool_refuses_acquire() {
        let server = StubServer::start(Script::hello());
        let pool = pool_for(pool_config());
        pool.close();
        match pool.acquire(&server.address()) {
            Err(Error::ServiceUnavailable(message)) => assert!(message.contains("closed")),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_direct_pool_pins_address() {
        let server = StubServer::start(Script::hello());
        let config = pool_config();
        let pool = DirectPool::new(connector_for(&config), server.address(), config, None);
        let cx = pool.acquire().unwrap();
        assert_eq!(pool.in_use_connection_count(), 1);
        pool.release(cx);
        assert_eq!(pool.in_use_connection_count(), 0);
    }

    #[test]
    fn test_connect_failure_frees_reserved_capacity() {
        // nothing listens on this port
        let address = Address::new("127.0.0.1", 9);
        let config = Config {
            max_connection_pool_size: 1,
            connection_timeout: 0.25,
            ..pool_config()
        };
        let pool = ConnectionPool::new(connector_for(&config), config, None);
        assert!(pool.acquire(&address).is_err());
        // the failed attempt must not leak its reservation
        assert_eq!(pool.in_use_connection_count(&address), 0);
        assert!(pool.acquire(&address).is_err());
    }
}
