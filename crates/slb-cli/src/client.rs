//! Blocking client for the daemon's event socket.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use slb_core::events::RequestEvent;

/// A live NDJSON subscription to the daemon.
pub struct BusSubscription {
    reader: BufReader<UnixStream>,
}

impl BusSubscription {
    /// Connect to the daemon socket and subscribe.
    pub fn connect(socket_path: &Path) -> std::io::Result<Self> {
        let mut stream = UnixStream::connect(socket_path)?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;
        stream.write_all(b"{\"op\":\"subscribe\"}\n")?;
        stream.flush()?;
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    /// Block until the next event arrives; `None` when the daemon hangs up.
    pub fn next_event(&mut self) -> std::io::Result<Option<RequestEvent>> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str(trimmed) {
                Ok(event) => return Ok(Some(event)),
                // An unknown record kind is a newer daemon, not a failure.
                Err(_) => continue,
            }
        }
    }
}
