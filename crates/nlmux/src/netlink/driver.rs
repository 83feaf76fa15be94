//! Tokio integration.

use std::rc::Rc;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::connection::Connection;
use super::error::{Error, Result};

impl Connection {
    /// Poll the connection whenever its socket becomes readable.
    ///
    /// Runs until the connection is stopped, following restarts that happen
    /// from inside callbacks. Overruns are recovered from and do not end the
    /// loop; other receive errors are returned.
    ///
    /// Must be awaited on a runtime with I/O enabled. The future is not
    /// `Send`; run it on a current-thread runtime or a `LocalSet`.
    pub async fn drive(&self) -> Result<()> {
        let stop_signal = Rc::clone(&self.inner.borrow().stop_signal);

        while let Some(generation) = self.generation() {
            let fd = self.raw_fd().ok_or(Error::NotStarted)?;
            let async_fd = AsyncFd::with_interest(fd, Interest::READABLE)?;
            tracing::debug!(fd, generation, "driving connection");

            while self.generation() == Some(generation) {
                tokio::select! {
                    ready = async_fd.readable() => {
                        let mut guard = ready?;
                        match self.poll() {
                            Ok(()) => guard.clear_ready(),
                            // more may be queued behind the lost datagrams
                            Err(Error::Overrun) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    () = stop_signal.notified() => {}
                }
            }
        }

        tracing::debug!("connection stopped, driver exiting");
        Ok(())
    }
}
