//! Suspendable connect and execute-drain state machines.
//!
//! Both machines surface every would-block condition as a
//! [`Step::Pending`] readiness interest; the waiter of the facade's
//! choosing turns those into OS waits.

use std::mem;
use std::sync::Arc;

use log::debug;

use crate::errors::Error;
use crate::pq::{ConnStatus, PgConn, PgResult, PollingStatus};
use crate::waiting::{PqGen, Ready, Step, Wait};

/// Connection establishment. Owns the nascent native handle and hands it
/// back on completion with the nonblocking flag set.
pub struct ConnectGen<C: PgConn> {
    conn: Option<C>,
}

impl<C: PgConn> ConnectGen<C> {
    pub fn new(conninfo: &str) -> Result<ConnectGen<C>, Error> {
        let conn = C::connect_start(conninfo)?;
        debug!("connection started, status {:?}", conn.status());
        Ok(ConnectGen { conn: Some(conn) })
    }
}

impl<C: PgConn> PqGen for ConnectGen<C> {
    type Output = C;

    fn step(&mut self, _ready: Option<Ready>) -> Result<Step<C>, Error> {
        let mut conn = self.conn.take().ok_or_else(|| {
            Error::Internal("connect machine resumed after completion".into())
        })?;

        if conn.status() == ConnStatus::Bad {
            return Err(Error::Operational(format!(
                "connection is bad: {}",
                conn.error_message()
            )));
        }

        let verdict = conn.connect_poll();
        debug!("connection polled, status {:?}", conn.status());
        let interest = match verdict {
            PollingStatus::Ok => {
                conn.set_nonblocking(true)?;
                return Ok(Step::Done(conn));
            }
            PollingStatus::Reading => Wait::R,
            PollingStatus::Writing => Wait::W,
            PollingStatus::Failed => {
                return Err(Error::Operational(format!(
                    "connection failed: {}",
                    conn.error_message()
                )));
            }
            other => {
                return Err(Error::Internal(format!(
                    "unexpected poll status: {other:?}"
                )));
            }
        };
        let fd = conn.socket();
        self.conn = Some(conn);
        Ok(Step::Pending { fd, interest })
    }
}

/// Execute-and-drain. The query must already have been handed to the
/// native client with `send_query` or a sibling; this machine flushes
/// the outbound buffer, then collects every result up to the null
/// sentinel.
pub struct ExecGen<'c, C: PgConn> {
    conn: &'c mut C,
    phase: Phase,
    results: Vec<Arc<dyn PgResult>>,
}

enum Phase {
    Flush,
    Drain,
    Done,
}

impl<'c, C: PgConn> ExecGen<'c, C> {
    pub fn new(conn: &'c mut C) -> ExecGen<'c, C> {
        ExecGen {
            conn,
            phase: Phase::Flush,
            results: Vec::new(),
        }
    }
}

impl<C: PgConn> PqGen for ExecGen<'_, C> {
    type Output = Vec<Arc<dyn PgResult>>;

    fn step(&mut self, ready: Option<Ready>) -> Result<Step<Self::Output>, Error> {
        match self.phase {
            Phase::Flush => {
                // Read readiness during the flush means inbound bytes are
                // pending; consume them to relieve backpressure before
                // flushing again. Write readiness retries the flush
                // directly.
                if ready == Some(Ready::R) {
                    self.conn.consume_input()?;
                }
                if self.conn.flush()? > 0 {
                    return Ok(Step::Pending {
                        fd: self.conn.socket(),
                        interest: Wait::Rw,
                    });
                }
                self.phase = Phase::Drain;
            }
            Phase::Drain => {}
            Phase::Done => {
                return Err(Error::Internal(
                    "exec machine resumed after completion".into(),
                ));
            }
        }

        loop {
            self.conn.consume_input()?;
            if self.conn.is_busy() {
                return Ok(Step::Pending {
                    fd: self.conn.socket(),
                    interest: Wait::R,
                });
            }
            match self.conn.get_result() {
                Some(res) => self.results.push(res),
                None => {
                    self.phase = Phase::Done;
                    return Ok(Step::Done(mem::take(&mut self.results)));
                }
            }
        }
    }
}
