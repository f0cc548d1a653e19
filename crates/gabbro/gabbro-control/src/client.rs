//! RESP client for the real control store.

use crate::resp::{Reply, read_reply, send_command};
use crate::{ControlError, ControlStore, parse_float_lines, parse_int_lines};
use std::io::BufReader;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Per-call network timeout; the stage loops must never stall behind a
/// slow control store.
const CALL_TIMEOUT: Duration = Duration::from_millis(100);

const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

const TAKING_DATA_EXPIRE_SECS: &str = "60";

struct Conn {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

/// Control store client speaking RESP over TCP.
///
/// A failed call disconnects the client; subsequent calls attempt to
/// reconnect under an exponential backoff capped at [`BACKOFF_MAX`], and
/// return [`ControlError::NotConnected`] in between attempts.
pub struct RedisControl {
    addr: String,
    conn: Option<Conn>,
    backoff: Duration,
    next_attempt: Option<Instant>,
}

impl RedisControl {
    /// Build a client for `addr` (`host:port`).  Does not connect; the
    /// first call does.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: None,
            backoff: BACKOFF_INITIAL,
            next_attempt: None,
        }
    }

    /// Whether the last call left the client connected.
    pub fn connected(&self) -> bool {
        self.conn.is_some()
    }

    fn connect(&mut self) -> Result<(), ControlError> {
        let addrs: Vec<_> = self.addr.to_socket_addrs()?.collect();
        let addr = addrs
            .first()
            .ok_or_else(|| ControlError::Parse(format!("unresolvable address {:?}", self.addr)))?;
        let stream = TcpStream::connect_timeout(addr, CALL_TIMEOUT)?;
        stream.set_read_timeout(Some(CALL_TIMEOUT))?;
        stream.set_write_timeout(Some(CALL_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);
        self.conn = Some(Conn {
            writer: stream,
            reader,
        });
        self.backoff = BACKOFF_INITIAL;
        self.next_attempt = None;
        info!(addr = %self.addr, "control store connected");
        Ok(())
    }

    fn ensure_connected(&mut self) -> Result<(), ControlError> {
        if self.conn.is_some() {
            return Ok(());
        }
        if let Some(at) = self.next_attempt {
            if Instant::now() < at {
                return Err(ControlError::NotConnected);
            }
        }
        match self.connect() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.next_attempt = Some(Instant::now() + self.backoff);
                warn!(
                    addr = %self.addr,
                    backoff_ms = self.backoff.as_millis() as u64,
                    "control store connect failed: {e}"
                );
                self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
                Err(ControlError::NotConnected)
            }
        }
    }

    fn call(&mut self, args: &[&str]) -> Result<Reply, ControlError> {
        self.ensure_connected()?;
        let conn = self.conn.as_mut().expect("connected above");
        let sent = send_command(&mut conn.writer, args);
        let reply = match sent {
            Ok(()) => read_reply(&mut conn.reader),
            Err(e) => Err(ControlError::Io(e)),
        };
        if matches!(reply, Err(ControlError::Io(_))) {
            // Transport failure: drop the connection and let the next call
            // go through the backoff path.
            self.conn = None;
            self.next_attempt = Some(Instant::now() + self.backoff);
            self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
        }
        reply
    }

    fn hget_text(&mut self, key: &'static str, field: &'static str) -> Result<String, ControlError> {
        match self.call(&["HGET", key, field])? {
            Reply::Bulk(Some(text)) => Ok(text),
            Reply::Bulk(None) => Err(ControlError::Missing(field)),
            other => Err(ControlError::Protocol(format!(
                "unexpected HGET reply {other:?}"
            ))),
        }
    }
}

impl ControlStore for RedisControl {
    fn corr_to_ant_map(&mut self, max_ants: usize) -> Result<Vec<i32>, ControlError> {
        let block = self.hget_text("corr", "corr_to_hera_map")?;
        parse_int_lines(&block, max_ants)
    }

    fn integration_bins(&mut self) -> Result<Vec<f64>, ControlError> {
        let block = self.hget_text("corr", "integration_bin")?;
        parse_float_lines(&block)
    }

    fn set_taking_data(&mut self, taking: bool, unix: u64) -> Result<(), ControlError> {
        let state = if taking { "True" } else { "False" };
        let time = unix.to_string();
        self.call(&["HMSET", "corr:is_taking_data", "state", state, "time", &time])?;
        self.refresh_taking_data()
    }

    fn refresh_taking_data(&mut self) -> Result<(), ControlError> {
        self.call(&["EXPIRE", "corr:is_taking_data", TAKING_DATA_EXPIRE_SECS])?;
        Ok(())
    }

    fn set_current_file(&mut self, filename: &str, unix: u64) -> Result<(), ControlError> {
        let time = unix.to_string();
        self.call(&[
            "HMSET",
            "corr:current_file",
            "filename",
            filename,
            "time",
            &time,
        ])?;
        Ok(())
    }

    fn push_raw_file(&mut self, path: &str) -> Result<(), ControlError> {
        self.call(&["RPUSH", "corr:files:raw", path])?;
        Ok(())
    }

    fn set_catcher_cwd(&mut self, cwd: &str) -> Result<(), ControlError> {
        self.call(&["HMSET", "corr:catcher", "cwd", cwd])?;
        Ok(())
    }

    fn notify_new_session(&mut self) -> Result<(), ControlError> {
        self.call(&["HMSET", "rtp:has_new_data", "state", "True"])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader as StdBufReader, Write};
    use std::net::TcpListener;

    /// Read one RESP command (array of bulk strings) off the wire.
    fn read_command<R: BufRead>(r: &mut R) -> Vec<String> {
        let mut line = String::new();
        r.read_line(&mut line).unwrap();
        assert!(line.starts_with('*'), "expected array, got {line:?}");
        let n: usize = line[1..].trim().parse().unwrap();
        let mut args = Vec::with_capacity(n);
        for _ in 0..n {
            let mut len_line = String::new();
            r.read_line(&mut len_line).unwrap();
            let len: usize = len_line[1..].trim().parse().unwrap();
            let mut buf = vec![0u8; len + 2];
            r.read_exact(&mut buf).unwrap();
            buf.truncate(len);
            args.push(String::from_utf8(buf).unwrap());
        }
        args
    }

    #[test]
    fn fetches_and_parses_the_antenna_map() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = StdBufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;

            let cmd = read_command(&mut reader);
            assert_eq!(cmd, ["HGET", "corr", "corr_to_hera_map"]);
            let body = "0\n12\n85\n";
            writer
                .write_all(format!("${}\r\n{}\r\n", body.len(), body).as_bytes())
                .unwrap();

            let cmd = read_command(&mut reader);
            assert_eq!(cmd[0], "RPUSH");
            writer.write_all(b":1\r\n").unwrap();
        });

        let mut ctl = RedisControl::new(addr.to_string());
        let map = ctl.corr_to_ant_map(16).unwrap();
        assert_eq!(map, vec![0, 12, 85]);
        ctl.push_raw_file("2459123/zen.2459123.41667.sum.dat").unwrap();
        assert!(ctl.connected());

        server.join().unwrap();
    }

    #[test]
    fn missing_field_is_reported_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = StdBufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let _ = read_command(&mut reader);
            writer.write_all(b"$-1\r\n").unwrap();
        });

        let mut ctl = RedisControl::new(addr.to_string());
        assert!(matches!(
            ctl.integration_bins(),
            Err(ControlError::Missing(_))
        ));
        assert!(ctl.connected());

        server.join().unwrap();
    }

    #[test]
    fn unreachable_store_backs_off() {
        // A listener we immediately drop leaves a port nothing accepts on.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut ctl = RedisControl::new(addr.to_string());
        assert!(matches!(
            ctl.notify_new_session(),
            Err(ControlError::NotConnected)
        ));
        // Within the backoff window the client fails fast without dialing.
        let start = Instant::now();
        assert!(matches!(
            ctl.notify_new_session(),
            Err(ControlError::NotConnected)
        ));
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
