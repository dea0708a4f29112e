//! User-facing connection objects: blocking and cooperative variants
//! sharing the same I/O state machines.
//!
//! Each facade exclusively owns its native handle behind the mutex
//! flavor matching its scheduling model; every operation takes the
//! mutex, so queries on one connection observe strict FIFO order.

pub mod conninfo;
pub mod machine;

pub use machine::{ConnectGen, ExecGen};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::adapt::{new_scope, AdaptContext, Escaping, ScopeMap};
use crate::errors::Error;
use crate::pq::{ConnStatus, ExecStatus, Format, Oid, PgConn, PgResult, TransactionStatus};
use crate::waiting::{wait_async, wait_select};

fn expect_command_ok(results: &[Arc<dyn PgResult>], command: &str) -> Result<(), Error> {
    if results.len() != 1 {
        return Err(Error::Operational(format!(
            "error on {command}: expected one result, got {}",
            results.len()
        )));
    }
    if results[0].status() != ExecStatus::CommandOk {
        return Err(Error::Operational(format!(
            "error on {command}: {}",
            results[0].error_message()
        )));
    }
    Ok(())
}

/// Blocking connection: one OS thread per concurrent connection.
pub struct Connection<C: PgConn> {
    pgconn: Arc<Mutex<C>>,
    adapters: ScopeMap,
    timeout: Option<Duration>,
}

impl<C: PgConn> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl<C: PgConn> Connection<C> {
    /// Establish a connection. `options` are merged into `conninfo`
    /// libpq-style, options winning on duplicate keys.
    pub fn connect(conninfo: &str, options: &[(&str, &str)]) -> Result<Connection<C>, Error> {
        let conninfo = conninfo::make_conninfo(conninfo, options)?;
        let pgconn = wait_select(ConnectGen::<C>::new(&conninfo)?, None)?;
        Ok(Connection::from_native(pgconn))
    }

    /// Wrap an already-established native handle.
    pub fn from_native(pgconn: C) -> Connection<C> {
        Connection {
            pgconn: Arc::new(Mutex::new(pgconn)),
            adapters: new_scope(),
            timeout: None,
        }
    }

    /// Bound every subsequent I/O wait; expiry marks the connection bad.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn status(&self) -> ConnStatus {
        self.pgconn.lock().status()
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.pgconn.lock().transaction_status()
    }

    pub fn commit(&self) -> Result<(), Error> {
        self.exec_commit_rollback("commit")
    }

    pub fn rollback(&self) -> Result<(), Error> {
        self.exec_commit_rollback("rollback")
    }

    fn exec_commit_rollback(&self, command: &str) -> Result<(), Error> {
        let mut conn = self.pgconn.lock();
        if conn.transaction_status() == TransactionStatus::Idle {
            return Ok(());
        }
        conn.send_query(command.as_bytes())?;
        let results = drain(&mut *conn, self.timeout)?;
        expect_command_ok(&results, command)
    }

    /// Send a simple query and drain every result.
    pub fn execute(&self, query: &str) -> Result<Vec<Arc<dyn PgResult>>, Error> {
        let mut conn = self.pgconn.lock();
        conn.send_query(query.as_bytes())?;
        drain(&mut *conn, self.timeout)
    }

    /// Send a parameterized query and drain every result.
    pub fn execute_params(
        &self,
        query: &str,
        params: &[Option<&[u8]>],
        param_types: &[Oid],
        param_formats: &[Format],
        result_format: Format,
    ) -> Result<Vec<Arc<dyn PgResult>>, Error> {
        let mut conn = self.pgconn.lock();
        conn.send_query_params(query.as_bytes(), params, param_types, param_formats, result_format)?;
        drain(&mut *conn, self.timeout)
    }

    /// A cursor-level adapter scope chained onto this connection's.
    pub fn cursor(&self) -> Cursor
    where
        C: 'static,
    {
        Cursor::new(self)
    }
}

fn drain<C: PgConn>(
    conn: &mut C,
    timeout: Option<Duration>,
) -> Result<Vec<Arc<dyn PgResult>>, Error> {
    match wait_select(ExecGen::new(conn), timeout) {
        Err(Error::Timeout) => {
            conn.mark_bad();
            Err(Error::Timeout)
        }
        other => other,
    }
}

impl<C: PgConn + 'static> AdaptContext for Connection<C> {
    fn scope_chain(&self) -> Vec<ScopeMap> {
        vec![self.adapters.clone()]
    }

    fn local_scope(&self) -> ScopeMap {
        self.adapters.clone()
    }

    fn escaping(&self) -> Option<Arc<dyn Escaping>> {
        Some(Arc::new(ConnEscaping {
            pgconn: self.pgconn.clone(),
        }))
    }
}

struct ConnEscaping<C: PgConn> {
    pgconn: Arc<Mutex<C>>,
}

impl<C: PgConn> Escaping for ConnEscaping<C> {
    fn escape_literal(&self, value: &[u8]) -> Result<Vec<u8>, Error> {
        self.pgconn.lock().escape_literal(value)
    }

    fn escape_string(&self, value: &[u8]) -> Vec<u8> {
        self.pgconn.lock().escape_string(value)
    }
}

/// Cooperative connection for single-threaded event-loop drivers. Same
/// logic as [`Connection`], under a cooperative mutex and the event-loop
/// waiter.
pub struct AsyncConnection<C: PgConn> {
    pgconn: Arc<tokio::sync::Mutex<C>>,
    adapters: ScopeMap,
    timeout: Option<Duration>,
}

impl<C: PgConn> AsyncConnection<C> {
    pub async fn connect(conninfo: &str, options: &[(&str, &str)]) -> Result<AsyncConnection<C>, Error> {
        let conninfo = conninfo::make_conninfo(conninfo, options)?;
        let pgconn = wait_async(ConnectGen::<C>::new(&conninfo)?, None).await?;
        Ok(AsyncConnection::from_native(pgconn))
    }

    /// Wrap an already-established native handle.
    pub fn from_native(pgconn: C) -> AsyncConnection<C> {
        AsyncConnection {
            pgconn: Arc::new(tokio::sync::Mutex::new(pgconn)),
            adapters: new_scope(),
            timeout: None,
        }
    }

    /// Bound every subsequent I/O wait; expiry marks the connection bad.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub async fn status(&self) -> ConnStatus {
        self.pgconn.lock().await.status()
    }

    pub async fn transaction_status(&self) -> TransactionStatus {
        self.pgconn.lock().await.transaction_status()
    }

    pub async fn commit(&self) -> Result<(), Error> {
        self.exec_commit_rollback("commit").await
    }

    pub async fn rollback(&self) -> Result<(), Error> {
        self.exec_commit_rollback("rollback").await
    }

    async fn exec_commit_rollback(&self, command: &str) -> Result<(), Error> {
        let mut conn = self.pgconn.lock().await;
        if conn.transaction_status() == TransactionStatus::Idle {
            return Ok(());
        }
        conn.send_query(command.as_bytes())?;
        let results = drain_async(&mut *conn, self.timeout).await?;
        expect_command_ok(&results, command)
    }

    /// Send a simple query and drain every result.
    pub async fn execute(&self, query: &str) -> Result<Vec<Arc<dyn PgResult>>, Error> {
        let mut conn = self.pgconn.lock().await;
        conn.send_query(query.as_bytes())?;
        drain_async(&mut *conn, self.timeout).await
    }

    /// Send a parameterized query and drain every result.
    pub async fn execute_params(
        &self,
        query: &str,
        params: &[Option<&[u8]>],
        param_types: &[Oid],
        param_formats: &[Format],
        result_format: Format,
    ) -> Result<Vec<Arc<dyn PgResult>>, Error> {
        let mut conn = self.pgconn.lock().await;
        conn.send_query_params(query.as_bytes(), params, param_types, param_formats, result_format)?;
        drain_async(&mut *conn, self.timeout).await
    }

    /// A cursor-level adapter scope chained onto this connection's.
    pub fn cursor(&self) -> Cursor
    where
        C: 'static,
    {
        Cursor::new(self)
    }
}

async fn drain_async<C: PgConn>(
    conn: &mut C,
    timeout: Option<Duration>,
) -> Result<Vec<Arc<dyn PgResult>>, Error> {
    match wait_async(ExecGen::new(conn), timeout).await {
        Err(Error::Timeout) => {
            conn.mark_bad();
            Err(Error::Timeout)
        }
        other => other,
    }
}

impl<C: PgConn + 'static> AdaptContext for AsyncConnection<C> {
    fn scope_chain(&self) -> Vec<ScopeMap> {
        vec![self.adapters.clone()]
    }

    fn local_scope(&self) -> ScopeMap {
        self.adapters.clone()
    }

    fn escaping(&self) -> Option<Arc<dyn Escaping>> {
        Some(Arc::new(AsyncConnEscaping {
            pgconn: self.pgconn.clone(),
        }))
    }
}

struct AsyncConnEscaping<C: PgConn> {
    pgconn: Arc<tokio::sync::Mutex<C>>,
}

impl<C: PgConn> Escaping for AsyncConnEscaping<C> {
    fn escape_literal(&self, value: &[u8]) -> Result<Vec<u8>, Error> {
        // quoting during an in-flight query is a caller error (scope
        // mutation and adaptation are forbidden then)
        match self.pgconn.try_lock() {
            Ok(conn) => conn.escape_literal(value),
            Err(_) => Err(Error::Operational(
                "connection is busy: cannot escape".into(),
            )),
        }
    }

    fn escape_string(&self, value: &[u8]) -> Vec<u8> {
        match self.pgconn.try_lock() {
            Ok(conn) => conn.escape_string(value),
            Err(_) => crate::adapt::escape_string_fallback(value),
        }
    }
}

/// Holder of the cursor-level adapter scope. Query execution through a
/// cursor is a facade concern outside this crate's core.
pub struct Cursor {
    adapters: ScopeMap,
    chain: Vec<ScopeMap>,
    escaping: Option<Arc<dyn Escaping>>,
}

impl Cursor {
    fn new(context: &dyn AdaptContext) -> Cursor {
        let adapters = new_scope();
        let mut chain = vec![adapters.clone()];
        chain.extend(context.scope_chain());
        Cursor {
            adapters,
            chain,
            escaping: context.escaping(),
        }
    }
}

impl AdaptContext for Cursor {
    fn scope_chain(&self) -> Vec<ScopeMap> {
        self.chain.clone()
    }

    fn local_scope(&self) -> ScopeMap {
        self.adapters.clone()
    }

    fn escaping(&self) -> Option<Arc<dyn Escaping>> {
        self.escaping.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapt::Transformer;
    use crate::pq::mock::{take_state, MockBuilder, MockConn, MockResult};
    use crate::types::oids;

    #[test]
    fn connect_runs_the_handshake_and_sets_nonblocking_once() {
        let conn =
            Connection::<MockConn>::connect("polls=w,ok tag=sync-connect", &[("dbname", "app")])
                .unwrap();
        assert_eq!(conn.status(), ConnStatus::Ok);
        let state = take_state("sync-connect").expect("mock registered");
        assert_eq!(state.lock().nonblocking_sets, 1);
    }

    #[test]
    fn connect_failure_is_operational() {
        let err = Connection::<MockConn>::connect("polls=w,failed", &[]).unwrap_err();
        assert!(matches!(err, Error::Operational(msg) if msg.starts_with("connection failed")));
    }

    #[test]
    fn commit_when_idle_sends_nothing() {
        let (conn, probe) = MockBuilder::new().build();
        let conn = Connection::from_native(conn);
        conn.commit().unwrap();
        assert!(probe.state.lock().sent.is_empty());
    }

    #[test]
    fn commit_in_transaction_expects_command_ok() {
        let (conn, probe) = MockBuilder::new()
            .txn(TransactionStatus::InTrans)
            .reply("commit", vec![MockResult::command_ok()])
            .build();
        let conn = Connection::from_native(conn);
        conn.commit().unwrap();
        assert_eq!(probe.state.lock().sent, vec![b"commit".to_vec()]);
    }

    #[test]
    fn rollback_error_reply_is_operational() {
        let (conn, _probe) = MockBuilder::new()
            .txn(TransactionStatus::InError)
            .reply("rollback", vec![MockResult::fatal("deadlock detected")])
            .build();
        let conn = Connection::from_native(conn);
        let err = conn.rollback().unwrap_err();
        assert!(
            matches!(err, Error::Operational(ref msg) if msg.contains("error on rollback")),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn commit_with_extra_results_is_operational() {
        let (conn, _probe) = MockBuilder::new()
            .txn(TransactionStatus::InTrans)
            .reply(
                "commit",
                vec![MockResult::command_ok(), MockResult::command_ok()],
            )
            .build();
        let conn = Connection::from_native(conn);
        let err = conn.commit().unwrap_err();
        assert!(matches!(err, Error::Operational(ref msg) if msg.contains("expected one result")));
    }

    #[test]
    fn execute_returns_the_server_reply() {
        let (conn, _probe) = MockBuilder::new()
            .reply(
                "select 'hel' || 'lo'",
                vec![MockResult::tuples(
                    &[(oids::TEXT, Format::Text, -1)],
                    vec![vec![Some(&b"hello"[..])]],
                )],
            )
            .build();
        let conn = Connection::from_native(conn);

        let results = conn.execute("select 'hel' || 'lo'").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status(), ExecStatus::TuplesOk);
        assert_eq!(results[0].get_value(0, 0), Some(&b"hello"[..]));

        // and the transformer decodes it through the connection scope
        let mut tx = Transformer::new(Some(&conn));
        tx.set_pgresult(Some(results[0].clone())).unwrap();
        let row = tx.load_row(0).unwrap().unwrap();
        assert_eq!(row.get::<String>(0).map(String::as_str), Some("hello"));
    }

    #[test]
    fn execute_params_passes_values_through() {
        let (conn, probe) = MockBuilder::new()
            .reply(
                "select $1::int + $2",
                vec![MockResult::tuples(
                    &[(oids::INT4, Format::Text, -1)],
                    vec![vec![Some(&b"8"[..])]],
                )],
            )
            .build();
        let conn = Connection::from_native(conn);

        let results = conn
            .execute_params(
                "select $1::int + $2",
                &[Some(&b"5"[..]), Some(&b"3"[..])],
                &[],
                &[],
                Format::Text,
            )
            .unwrap();
        assert_eq!(results[0].get_value(0, 0), Some(&b"8"[..]));

        let params = probe.state.lock().last_params.clone().unwrap();
        assert_eq!(params.params, vec![Some(b"5".to_vec()), Some(b"3".to_vec())]);
        assert!(params.types.is_empty());
    }

    #[test]
    fn execute_params_keeps_empty_and_null_distinct() {
        let (conn, probe) = MockBuilder::new()
            .reply(
                "select $1, $2, $3",
                vec![MockResult::tuples(
                    &[
                        (oids::TEXT, Format::Text, -1),
                        (oids::TEXT, Format::Text, -1),
                        (oids::TEXT, Format::Text, -1),
                    ],
                    vec![vec![Some(&b"hi"[..]), Some(&b""[..]), None]],
                )],
            )
            .build();
        let conn = Connection::from_native(conn);

        let results = conn
            .execute_params(
                "select $1, $2, $3",
                &[Some(&b"hi"[..]), Some(&b""[..]), None],
                &[],
                &[],
                Format::Text,
            )
            .unwrap();
        assert_eq!(results[0].get_value(0, 0), Some(&b"hi"[..]));
        assert_eq!(results[0].get_value(0, 1), Some(&b""[..]));
        assert_eq!(results[0].get_value(0, 2), None);

        let params = probe.state.lock().last_params.clone().unwrap();
        assert_eq!(params.params[1], Some(Vec::new()));
        assert_eq!(params.params[2], None);
    }

    #[test]
    fn execute_params_forwards_formats_unchanged() {
        let query = "select length($1::bytea)";
        let (conn, probe) = MockBuilder::new()
            .reply(
                query,
                vec![MockResult::tuples(
                    &[(oids::INT4, Format::Text, -1)],
                    vec![vec![Some(&b"7"[..])]],
                )],
            )
            .reply(
                query,
                vec![MockResult::tuples(
                    &[(oids::INT4, Format::Text, -1)],
                    vec![vec![Some(&b"3"[..])]],
                )],
            )
            .build();
        let conn = Connection::from_native(conn);
        let payload: &[u8] = b"foo\x00bar";

        // sent binary the null byte survives: length 7
        let results = conn
            .execute_params(
                query,
                &[Some(payload)],
                &[oids::BYTEA],
                &[Format::Binary],
                Format::Text,
            )
            .unwrap();
        assert_eq!(results[0].get_value(0, 0), Some(&b"7"[..]));
        let params = probe.state.lock().last_params.clone().unwrap();
        assert_eq!(params.formats, vec![Format::Binary]);
        assert_eq!(params.params, vec![Some(payload.to_vec())]);

        // sent text the value truncates at the null byte: length 3
        let results = conn
            .execute_params(query, &[Some(payload)], &[oids::BYTEA], &[Format::Text], Format::Text)
            .unwrap();
        assert_eq!(results[0].get_value(0, 0), Some(&b"3"[..]));
        let params = probe.state.lock().last_params.clone().unwrap();
        assert_eq!(params.formats, vec![Format::Text]);
    }

    #[test]
    fn drain_waits_for_read_readiness() {
        let (conn, probe) = MockBuilder::new()
            .busy(&[true, false])
            .reply(
                "select 1",
                vec![MockResult::tuples(
                    &[(oids::INT4, Format::Text, -1)],
                    vec![vec![Some(&b"1"[..])]],
                )],
            )
            .build();
        let conn = Connection::from_native(conn);

        // the server answer lands only after the drain loop has parked
        // on read readiness
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            probe.make_readable(b"x");
        });
        let results = conn.execute("select 1").unwrap();
        writer.join().unwrap();
        assert_eq!(results[0].get_value(0, 0), Some(&b"1"[..]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_drain_waits_for_read_readiness() {
        let (conn, probe) = MockBuilder::new()
            .busy(&[true, false])
            .reply(
                "select 1",
                vec![MockResult::tuples(
                    &[(oids::INT4, Format::Text, -1)],
                    vec![vec![Some(&b"1"[..])]],
                )],
            )
            .build();
        let conn = AsyncConnection::from_native(conn);

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            probe.make_readable(b"x");
        });
        let results = conn.execute("select 1").await.unwrap();
        writer.await.unwrap();
        assert_eq!(results[0].get_value(0, 0), Some(&b"1"[..]));
    }

    #[test]
    fn timeout_marks_the_connection_bad() {
        let (conn, _probe) = MockBuilder::new().busy_forever().build();
        let mut conn = Connection::from_native(conn);
        conn.set_timeout(Some(Duration::from_millis(40)));
        let err = conn.execute("select pg_sleep(10)").unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(conn.status(), ConnStatus::Bad);
    }

    #[tokio::test]
    async fn async_connect_runs_the_handshake() {
        let conn = AsyncConnection::<MockConn>::connect("polls=w,ok tag=async-connect", &[])
            .await
            .unwrap();
        assert_eq!(conn.status().await, ConnStatus::Ok);
        let state = take_state("async-connect").expect("mock registered");
        assert_eq!(state.lock().nonblocking_sets, 1);
    }

    #[tokio::test]
    async fn async_commit_when_idle_sends_nothing() {
        let (conn, probe) = MockBuilder::new().build();
        let conn = AsyncConnection::from_native(conn);
        conn.commit().await.unwrap();
        assert!(probe.state.lock().sent.is_empty());
    }

    #[tokio::test]
    async fn async_execute_returns_the_server_reply() {
        let (conn, _probe) = MockBuilder::new()
            .reply(
                "select 1",
                vec![MockResult::tuples(
                    &[(oids::INT4, Format::Text, -1)],
                    vec![vec![Some(&b"1"[..])]],
                )],
            )
            .build();
        let conn = AsyncConnection::from_native(conn);
        let results = conn.execute("select 1").await.unwrap();
        assert_eq!(results[0].get_value(0, 0), Some(&b"1"[..]));
    }

    #[tokio::test]
    async fn async_timeout_marks_the_connection_bad() {
        let (conn, _probe) = MockBuilder::new().busy_forever().build();
        let mut conn = AsyncConnection::from_native(conn);
        conn.set_timeout(Some(Duration::from_millis(40)));
        let err = conn.execute("select pg_sleep(10)").await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(conn.status().await, ConnStatus::Bad);
    }
}
