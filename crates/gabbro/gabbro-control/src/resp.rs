//! Minimal RESP (REdis Serialization Protocol) encoding and reply parsing.
//!
//! Only the command shapes the pipeline issues are supported: every command
//! is an array of bulk strings, every reply is a simple string, an error,
//! an integer, or a bulk string.

use crate::ControlError;
use std::io::{BufRead, Write};

#[derive(Debug, PartialEq)]
pub enum Reply {
    Simple(String),
    Int(i64),
    /// `None` is the nil bulk (missing key/field).
    Bulk(Option<String>),
}

/// Encode one command as a RESP array of bulk strings.
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

pub fn send_command<W: Write>(w: &mut W, args: &[&str]) -> std::io::Result<()> {
    w.write_all(&encode_command(args))?;
    w.flush()
}

fn read_line<R: BufRead>(r: &mut R) -> Result<String, ControlError> {
    let mut line = String::new();
    let n = r.read_line(&mut line)?;
    if n == 0 {
        return Err(ControlError::Protocol("connection closed".into()));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Read one reply.  Server-side `-ERR` replies surface as
/// [`ControlError::Protocol`].
pub fn read_reply<R: BufRead>(r: &mut R) -> Result<Reply, ControlError> {
    let line = read_line(r)?;
    let Some(kind) = line.chars().next() else {
        return Err(ControlError::Protocol("empty reply line".into()));
    };
    let rest = &line[1..];
    match kind {
        '+' => Ok(Reply::Simple(rest.to_owned())),
        '-' => Err(ControlError::Protocol(rest.to_owned())),
        ':' => {
            let v = rest
                .parse()
                .map_err(|_| ControlError::Protocol(format!("bad integer reply {rest:?}")))?;
            Ok(Reply::Int(v))
        }
        '$' => {
            let len: i64 = rest
                .parse()
                .map_err(|_| ControlError::Protocol(format!("bad bulk length {rest:?}")))?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }
            let mut buf = vec![0u8; len as usize + 2];
            std::io::Read::read_exact(r, &mut buf)?;
            buf.truncate(len as usize);
            let text = String::from_utf8(buf)
                .map_err(|_| ControlError::Protocol("non-utf8 bulk reply".into()))?;
            Ok(Reply::Bulk(Some(text)))
        }
        other => Err(ControlError::Protocol(format!(
            "unexpected reply type {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn commands_encode_as_bulk_arrays() {
        let wire = encode_command(&["HGET", "corr", "corr_to_hera_map"]);
        assert_eq!(
            wire,
            b"*3\r\n$4\r\nHGET\r\n$4\r\ncorr\r\n$16\r\ncorr_to_hera_map\r\n"
        );
    }

    #[test]
    fn replies_parse() {
        let mut r = BufReader::new(&b"+OK\r\n:12\r\n$5\r\nhello\r\n$-1\r\n"[..]);
        assert_eq!(read_reply(&mut r).unwrap(), Reply::Simple("OK".into()));
        assert_eq!(read_reply(&mut r).unwrap(), Reply::Int(12));
        assert_eq!(
            read_reply(&mut r).unwrap(),
            Reply::Bulk(Some("hello".into()))
        );
        assert_eq!(read_reply(&mut r).unwrap(), Reply::Bulk(None));
    }

    #[test]
    fn server_errors_surface() {
        let mut r = BufReader::new(&b"-ERR no such key\r\n"[..]);
        assert!(matches!(
            read_reply(&mut r),
            Err(ControlError::Protocol(msg)) if msg.contains("no such key")
        ));
    }
}
