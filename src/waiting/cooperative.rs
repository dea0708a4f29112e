//! Event-loop waiter over tokio's `AsyncFd`.

use std::os::unix::io::RawFd;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::time::{timeout_at, Instant};

use super::{PqGen, Ready, Step, Wait};
use crate::errors::Error;

/// Drive `gen` to completion, suspending the current task between
/// suspension points. Dropping the returned future abandons the machine;
/// the driver makes no attempt to resume it.
pub async fn wait_async<G: PqGen>(
    mut gen: G,
    timeout: Option<Duration>,
) -> Result<G::Output, Error> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut ready = None;
    loop {
        match gen.step(ready.take())? {
            Step::Done(value) => return Ok(value),
            Step::Pending { fd, interest } => {
                ready = Some(poll_ready(fd, interest, deadline).await?)
            }
        }
    }
}

async fn poll_ready(fd: RawFd, interest: Wait, deadline: Option<Instant>) -> Result<Ready, Error> {
    let interest = match interest {
        Wait::R => Interest::READABLE,
        Wait::W => Interest::WRITABLE,
        Wait::Rw => Interest::READABLE.add(Interest::WRITABLE),
    };
    // AsyncFd registers the descriptor without taking ownership; a bare
    // RawFd is not closed when the registration drops.
    let afd = AsyncFd::with_interest(fd, interest)?;
    let ready = afd.ready(interest);
    let guard = match deadline {
        Some(deadline) => timeout_at(deadline, ready)
            .await
            .map_err(|_| Error::Timeout)??,
        None => ready.await?,
    };
    let readiness = guard.ready();
    if readiness.is_readable() || readiness.is_read_closed() {
        Ok(Ready::R)
    } else {
        Ok(Ready::W)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use super::*;

    struct ScriptGen {
        fd: RawFd,
        interests: Vec<Wait>,
        observed: Vec<Ready>,
        next: usize,
    }

    impl PqGen for ScriptGen {
        type Output = Vec<Ready>;

        fn step(&mut self, ready: Option<Ready>) -> Result<Step<Vec<Ready>>, Error> {
            if let Some(ready) = ready {
                self.observed.push(ready);
            }
            if self.next == self.interests.len() {
                return Ok(Step::Done(std::mem::take(&mut self.observed)));
            }
            let interest = self.interests[self.next];
            self.next += 1;
            Ok(Step::Pending {
                fd: self.fd,
                interest,
            })
        }
    }

    fn script(fd: RawFd, interests: Vec<Wait>) -> ScriptGen {
        ScriptGen {
            fd,
            interests,
            observed: Vec::new(),
            next: 0,
        }
    }

    #[tokio::test]
    async fn write_readiness_completes() {
        let (sock, _peer) = UnixStream::pair().unwrap();
        sock.set_nonblocking(true).unwrap();
        let gen = script(sock.as_raw_fd(), vec![Wait::W, Wait::W]);
        let observed = wait_async(gen, None).await.unwrap();
        assert_eq!(observed, vec![Ready::W, Ready::W]);
    }

    #[tokio::test]
    async fn read_readiness_after_peer_write() {
        let (sock, peer) = UnixStream::pair().unwrap();
        sock.set_nonblocking(true).unwrap();
        (&peer).write_all(b"x").unwrap();
        let gen = script(sock.as_raw_fd(), vec![Wait::R]);
        let observed = wait_async(gen, None).await.unwrap();
        assert_eq!(observed, vec![Ready::R]);
    }

    #[tokio::test]
    async fn deadline_expiry_is_timeout() {
        let (sock, _peer) = UnixStream::pair().unwrap();
        sock.set_nonblocking(true).unwrap();
        let gen = script(sock.as_raw_fd(), vec![Wait::R]);
        let err = wait_async(gen, Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
