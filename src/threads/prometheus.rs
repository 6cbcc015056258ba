use log::{debug, error, info};
use std::io::{self, prelude::*, ErrorKind};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::stats::Stats;

// connections are served one at a time, a silent client holds the others at most this long
const CLIENT_TIMEOUT: Duration = Duration::from_secs(1);

pub fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).map_err(|source| Error::Bind { addr: addr.to_string(), source })?;
    info!("Listening for TCP connection on {}", addr);

    Ok(listener)
}

/// Serves the counters to every connection, whatever the request.
pub fn listen(listener: TcpListener, stats: Arc<Stats>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_connection(stream, &stats) {
                    error!("Failed to answer a scrape : {}", e);
                }
            }
            Err(e) => error!("Connection failed : {}", e),
        }
    }
}

fn handle_connection(mut stream: TcpStream, stats: &Stats) -> io::Result<()> {
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;

    // the request itself is not looked at, a client which sends nothing still gets an answer
    let mut request = [0; 1024];
    match stream.read(&mut request) {
        Ok(read) => debug!("Scrape from {:?}, {} bytes", stream.peer_addr(), read),
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
            debug!("No request from {:?} after {:?}", stream.peer_addr(), CLIENT_TIMEOUT)
        }
        Err(e) => return Err(e),
    }

    let contents = stats.render();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        contents.len(),
        contents
    );

    stream.write_all(response.as_bytes())?;
    stream.flush()
}
