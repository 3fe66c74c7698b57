//! A minimal hand-rolled HTTP/1.1 control channel.
//!
//! POST a JSON body shaped like `{"cmd": "..."}` to any path and get back
//! the dispatch result. There is no call for a web framework here: the
//! protocol is one small request at a time, and the original
//! `cuttlefs/cli.py` control channel is itself built directly on
//! `http.server`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cuttlefs::Facade;

/// Spawns the control-channel listener on `127.0.0.1:{port}`, serving
/// requests against `facade` until the process exits.
///
/// # Errors
///
/// Returns an I/O error if the port cannot be bound.
pub fn spawn(facade: Arc<Mutex<Facade>>, port: u16) -> std::io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    log::info!("control channel listening on 127.0.0.1:{port}");

    Ok(std::thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(e) = handle_connection(stream, &facade) {
                        log::warn!("control channel connection error: {e}");
                    }
                }
                Err(e) => log::warn!("control channel accept error: {e}"),
            }
        }
    }))
}

fn handle_connection(mut stream: TcpStream, facade: &Arc<Mutex<Facade>>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    if request_line.is_empty() {
        return Ok(());
    }

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;

    let response = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(command) => facade.lock().unwrap().handle_command(&command),
        Err(e) => serde_json::json!({"success": false, "error": e.to_string()}),
    };

    let payload = serde_json::to_vec(&response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    )?;
    stream.write_all(&payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn serves_a_control_command_over_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let metadir = dir.path().join("meta");
        std::fs::create_dir_all(&root).unwrap();
        let facade = Arc::new(Mutex::new(
            Facade::new(&root, &metadir, cuttlefs::FsyncKind::Ext4Ordered, &[]).unwrap(),
        ));

        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let facade = Arc::clone(&facade);
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle_connection(stream, &facade).unwrap();
        });

        let body = br#"{"cmd": "allow-all-writes"}"#;
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(
            stream,
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .unwrap();
        stream.write_all(body).unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.contains("200 OK"));
        assert!(response.contains(r#""success":true"#));
    }
}
