//! Scripted native client standing in for a live server in tests.
//!
//! The mock owns one end of a real socketpair so the waiters have a
//! descriptor to poll; scripts control what the protocol side reports.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::{
    ConnStatus, ExecStatus, Format, Oid, PgConn, PgResult, PollingStatus, TransactionStatus,
};
use crate::errors::Error;

/// Parameters observed by `send_query_params`.
#[derive(Clone)]
pub(crate) struct SentParams {
    pub params: Vec<Option<Vec<u8>>>,
    pub types: Vec<Oid>,
    pub formats: Vec<Format>,
    pub result_format: Format,
}

pub(crate) struct MockState {
    pub status: ConnStatus,
    pub txn_status: TransactionStatus,
    pub poll_script: VecDeque<PollingStatus>,
    pub flush_script: VecDeque<i32>,
    pub busy_script: VecDeque<bool>,
    pub busy_forever: bool,
    pub replies: Vec<(Vec<u8>, Vec<Arc<dyn PgResult>>)>,
    pub pending: VecDeque<Option<Arc<dyn PgResult>>>,
    pub sent: Vec<Vec<u8>>,
    pub last_params: Option<SentParams>,
    pub consume_calls: usize,
    pub nonblocking_sets: usize,
    pub error: String,
}

impl MockState {
    fn new() -> MockState {
        MockState {
            status: ConnStatus::Started,
            txn_status: TransactionStatus::Idle,
            poll_script: VecDeque::new(),
            flush_script: VecDeque::new(),
            busy_script: VecDeque::new(),
            busy_forever: false,
            replies: Vec::new(),
            pending: VecDeque::new(),
            sent: Vec::new(),
            last_params: None,
            consume_calls: 0,
            nonblocking_sets: 0,
            error: "mock failure".into(),
        }
    }

    fn queue_reply(&mut self, query: &[u8]) {
        let found = self.replies.iter().position(|(q, _)| q == query);
        let results = match found {
            Some(i) => self.replies.remove(i).1,
            None => vec![MockResult::command_ok()],
        };
        for res in results {
            self.pending.push_back(Some(res));
        }
        self.pending.push_back(None);
    }
}

/// Connections created through `connect_start`, keyed by the `tag`
/// conninfo option so the test can reach their state afterwards.
static CONNECTED: Lazy<Mutex<Vec<(String, Arc<Mutex<MockState>>)>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Remove and return the state of the connection started with
/// `tag=<tag>` in its conninfo.
pub(crate) fn take_state(tag: &str) -> Option<Arc<Mutex<MockState>>> {
    let mut connected = CONNECTED.lock();
    let i = connected.iter().position(|(t, _)| t == tag)?;
    Some(connected.remove(i).1)
}

pub(crate) struct MockConn {
    state: Arc<Mutex<MockState>>,
    sock: Arc<UnixStream>,
    _peer: Arc<UnixStream>,
}

impl std::fmt::Debug for MockConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConn").finish_non_exhaustive()
    }
}

/// Test-side handle onto a mock connection's shared state and the peer
/// end of its socketpair.
pub(crate) struct MockProbe {
    pub state: Arc<Mutex<MockState>>,
    peer: Arc<UnixStream>,
}

impl MockProbe {
    /// Make the mock's socket read-ready.
    pub fn make_readable(&self, bytes: &[u8]) {
        (&*self.peer).write_all(bytes).expect("peer write");
    }
}

pub(crate) struct MockBuilder {
    state: MockState,
}

impl MockBuilder {
    pub fn new() -> MockBuilder {
        MockBuilder {
            state: MockState::new(),
        }
    }

    pub fn status(mut self, status: ConnStatus) -> Self {
        self.state.status = status;
        self
    }

    pub fn txn(mut self, status: TransactionStatus) -> Self {
        self.state.txn_status = status;
        self
    }

    pub fn polls(mut self, polls: &[PollingStatus]) -> Self {
        self.state.poll_script = polls.iter().copied().collect();
        self
    }

    pub fn flushes(mut self, flushes: &[i32]) -> Self {
        self.state.flush_script = flushes.iter().copied().collect();
        self
    }

    pub fn busy(mut self, busy: &[bool]) -> Self {
        self.state.busy_script = busy.iter().copied().collect();
        self
    }

    pub fn busy_forever(mut self) -> Self {
        self.state.busy_forever = true;
        self
    }

    pub fn reply(mut self, query: &str, results: Vec<Arc<dyn PgResult>>) -> Self {
        self.state.replies.push((query.as_bytes().to_vec(), results));
        self
    }

    pub fn build(self) -> (MockConn, MockProbe) {
        let (conn, probe) = mock_pair(Arc::new(Mutex::new(self.state)));
        (conn, probe)
    }
}

fn mock_pair(state: Arc<Mutex<MockState>>) -> (MockConn, MockProbe) {
    let (sock, peer) = UnixStream::pair().expect("socketpair");
    sock.set_nonblocking(true).expect("nonblocking");
    let sock = Arc::new(sock);
    let peer = Arc::new(peer);
    (
        MockConn {
            state: state.clone(),
            sock: sock.clone(),
            _peer: peer.clone(),
        },
        MockProbe { state, peer },
    )
}

impl PgConn for MockConn {
    fn connect_start(conninfo: &str) -> Result<MockConn, Error> {
        let mut state = MockState::new();
        let mut tag = None;
        for token in conninfo.split_whitespace() {
            let (key, value) = token.split_once('=').unwrap_or((token, ""));
            match key {
                "tag" => tag = Some(value.to_string()),
                "status" if value == "bad" => state.status = ConnStatus::Bad,
                "polls" => {
                    state.poll_script = value
                        .split(',')
                        .map(|v| match v {
                            "r" => PollingStatus::Reading,
                            "w" => PollingStatus::Writing,
                            "failed" => PollingStatus::Failed,
                            "active" => PollingStatus::Active,
                            _ => PollingStatus::Ok,
                        })
                        .collect();
                }
                _ => {}
            }
        }
        let state = Arc::new(Mutex::new(state));
        if let Some(tag) = tag {
            CONNECTED.lock().push((tag, state.clone()));
        }
        let (conn, probe) = mock_pair(state);
        // keep the peer end open for the lifetime of the process
        std::mem::forget(probe);
        Ok(conn)
    }

    fn connect_poll(&mut self) -> PollingStatus {
        let mut state = self.state.lock();
        let verdict = state.poll_script.pop_front().unwrap_or(PollingStatus::Ok);
        match verdict {
            PollingStatus::Ok => state.status = ConnStatus::Ok,
            PollingStatus::Failed => state.status = ConnStatus::Bad,
            _ => {}
        }
        verdict
    }

    fn status(&self) -> ConnStatus {
        self.state.lock().status
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.state.lock().txn_status
    }

    fn socket(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn set_nonblocking(&mut self, enabled: bool) -> Result<(), Error> {
        self.sock.set_nonblocking(enabled)?;
        self.state.lock().nonblocking_sets += 1;
        Ok(())
    }

    fn error_message(&self) -> String {
        self.state.lock().error.clone()
    }

    fn send_query(&mut self, query: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.sent.push(query.to_vec());
        state.queue_reply(query);
        Ok(())
    }

    fn send_query_params(
        &mut self,
        query: &[u8],
        params: &[Option<&[u8]>],
        param_types: &[Oid],
        param_formats: &[Format],
        result_format: Format,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.sent.push(query.to_vec());
        state.last_params = Some(SentParams {
            params: params.iter().map(|p| p.map(|b| b.to_vec())).collect(),
            types: param_types.to_vec(),
            formats: param_formats.to_vec(),
            result_format,
        });
        state.queue_reply(query);
        Ok(())
    }

    fn flush(&mut self) -> Result<i32, Error> {
        Ok(self.state.lock().flush_script.pop_front().unwrap_or(0))
    }

    fn consume_input(&mut self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.status == ConnStatus::Bad {
            return Err(Error::Operational("connection is bad".into()));
        }
        state.consume_calls += 1;
        drop(state);
        // drain whatever the test made readable
        let mut scratch = [0u8; 256];
        while let Ok(n) = (&*self.sock).read(&mut scratch) {
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        let mut state = self.state.lock();
        if state.busy_forever {
            return true;
        }
        state.busy_script.pop_front().unwrap_or(false)
    }

    fn get_result(&mut self) -> Option<Arc<dyn PgResult>> {
        self.state.lock().pending.pop_front().flatten()
    }

    fn mark_bad(&mut self) {
        self.state.lock().status = ConnStatus::Bad;
    }

    fn escape_literal(&self, value: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = vec![b'\''];
        for &b in value {
            if b == b'\'' {
                out.push(b'\'');
            }
            out.push(b);
        }
        out.push(b'\'');
        Ok(out)
    }

    fn escape_string(&self, value: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(value.len());
        for &b in value {
            if b == b'\'' {
                out.push(b'\'');
            }
            out.push(b);
        }
        out
    }
}

pub(crate) struct MockResult {
    status: ExecStatus,
    cols: Vec<(Oid, Format, i32)>,
    rows: Vec<Vec<Option<Vec<u8>>>>,
    error: String,
}

impl MockResult {
    pub fn command_ok() -> Arc<dyn PgResult> {
        Arc::new(MockResult {
            status: ExecStatus::CommandOk,
            cols: Vec::new(),
            rows: Vec::new(),
            error: String::new(),
        })
    }

    pub fn fatal(message: &str) -> Arc<dyn PgResult> {
        Arc::new(MockResult {
            status: ExecStatus::FatalError,
            cols: Vec::new(),
            rows: Vec::new(),
            error: message.into(),
        })
    }

    pub fn tuples(
        cols: &[(Oid, Format, i32)],
        rows: Vec<Vec<Option<&[u8]>>>,
    ) -> Arc<dyn PgResult> {
        Arc::new(MockResult {
            status: ExecStatus::TuplesOk,
            cols: cols.to_vec(),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|c| c.map(|b| b.to_vec())).collect())
                .collect(),
            error: String::new(),
        })
    }
}

impl PgResult for MockResult {
    fn status(&self) -> ExecStatus {
        self.status
    }

    fn nfields(&self) -> usize {
        self.cols.len()
    }

    fn ntuples(&self) -> usize {
        self.rows.len()
    }

    fn ftype(&self, col: usize) -> Oid {
        self.cols[col].0
    }

    fn fformat(&self, col: usize) -> Format {
        self.cols[col].1
    }

    fn fmod(&self, col: usize) -> i32 {
        self.cols[col].2
    }

    fn get_value(&self, row: usize, col: usize) -> Option<&[u8]> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    fn error_message(&self) -> String {
        self.error.clone()
    }
}
