//! Binds a launched process's stdio to a protocol client.
//!
//! Two tasks per binding: a reader pumping stdout chunks into the client's
//! feed, and a writer draining the client's outbound line channel into
//! stdin. Writes to a closed stdin are dropped silently; the reader tags its
//! bytes with the connection generation so input from a dead process is
//! ignored once the client has been reset.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::launcher::{ProcessStdin, ProcessStdout};

use super::client::QmpClient;

const READ_CHUNK: usize = 4096;

/// Wire `stdin`/`stdout` of a freshly launched process to `client`.
///
/// Replaces any previous writer binding. Both spawned tasks end on their own
/// once the process dies or the binding is replaced.
pub fn bind(client: Arc<Mutex<QmpClient>>, stdin: ProcessStdin, stdout: ProcessStdout) {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let generation = {
        let mut client = client.lock().unwrap();
        client.set_writer(Some(tx));
        client.generation()
    };
    tokio::spawn(write_loop(stdin, rx));
    tokio::spawn(read_loop(stdout, client, generation));
}

async fn write_loop(mut stdin: ProcessStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    let mut closed = false;
    while let Some(line) = rx.recv().await {
        if closed {
            trace!("dropping write to closed stdin");
            continue;
        }
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            debug!(error = %e, "stdin closed, dropping further writes");
            closed = true;
        }
    }
}

async fn read_loop(mut stdout: ProcessStdout, client: Arc<Mutex<QmpClient>>, generation: u64) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                debug!("process stdout closed");
                return;
            }
            Ok(n) => client.lock().unwrap().feed_from(generation, &buf[..n]),
            Err(e) => {
                debug!(error = %e, "stdout read error");
                return;
            }
        }
    }
}
