use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

use crate::config::IngestConfig;
use crate::extract::FieldExtractor;
use crate::ingest::batcher::Ingestor;
use crate::ingest::syslog::parse_payload;
use crate::models::event::Event;

/// Largest accepted frame; larger TCP frames are truncated, larger UDP
/// datagrams arrive truncated by the socket buffer anyway.
const MAX_FRAME_BYTES: usize = 128 * 1024;

/// Pull one frame out of the accumulation buffer. Octet-counted framing when
/// the buffer opens with a decimal length and a space, newline-delimited
/// otherwise. Returns None until a complete frame is buffered.
pub fn extract_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    // Skip leading newlines left over from the previous frame.
    let start = match buf.iter().position(|&b| b != b'\n' && b != b'\r') {
        Some(start) => start,
        None => {
            buf.clear();
            return None;
        }
    };
    if start > 0 {
        buf.drain(..start);
    }

    let digits = buf.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits > 0 && digits <= 7 && buf.get(digits) == Some(&b' ') {
        let len: usize = std::str::from_utf8(&buf[..digits]).ok()?.parse().ok()?;
        let frame_start = digits + 1;
        if buf.len() < frame_start + len {
            return None;
        }
        let frame = buf[frame_start..frame_start + len].to_vec();
        buf.drain(..frame_start + len);
        return Some(frame);
    }

    let nl = buf.iter().position(|&b| b == b'\n')?;
    let mut frame = buf[..nl].to_vec();
    if frame.last() == Some(&b'\r') {
        frame.pop();
    }
    buf.drain(..=nl);
    Some(frame)
}

fn handle_payload(
    payload: &[u8],
    peer: Option<SocketAddr>,
    protocol: &str,
    ingestor: &Arc<Ingestor>,
    extractor: &FieldExtractor,
    default_index: &str,
    routes: &[(String, String)],
) {
    let text = String::from_utf8_lossy(payload);
    if text.trim().is_empty() {
        return;
    }
    let (mut event, source_type) = parse_payload(&text, chrono::Utc::now());
    if source_type == crate::ingest::syslog::SourceType::Raw {
        ingestor.counters().parse_error();
    }

    event.protocol = protocol.to_string();
    if let Some(peer) = peer {
        event.source_ip = Some(peer.ip());
        event.source_port = Some(peer.port());
    }
    event.index_name = route_index(&event, default_index, routes);

    // Field extraction adds keys; frame-level structured data wins.
    for (key, value) in extractor.extract(&event.message) {
        event.structured_data.entry(key).or_insert(value);
    }
    event
        .structured_data
        .entry("_source_type".to_string())
        .or_insert_with(|| source_type.as_str().to_string());

    if event.normalize() {
        ingestor.counters().parse_error();
    }
    ingestor.push(event);
}

/// Routing rule: first `app_name` or `hostname` prefix match wins.
fn route_index(event: &Event, default_index: &str, routes: &[(String, String)]) -> String {
    for (prefix, index) in routes {
        if event.app_name.starts_with(prefix.as_str())
            || event.hostname.starts_with(prefix.as_str())
        {
            return index.clone();
        }
    }
    default_index.to_string()
}

pub async fn run_udp_receiver(
    cfg: IngestConfig,
    ingestor: Arc<Ingestor>,
    extractor: Arc<FieldExtractor>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(&cfg.udp_listen).await?;
    tracing::info!("syslog udp receiver listening on {}", cfg.udp_listen);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((n, peer)) => {
                        handle_payload(
                            &buf[..n],
                            Some(peer),
                            "udp",
                            &ingestor,
                            &extractor,
                            &cfg.default_index,
                            &cfg.routes,
                        );
                    }
                    Err(e) => {
                        tracing::warn!("udp receive error: {e}");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("udp receiver shutting down");
                    return Ok(());
                }
            }
        }
    }
}

pub async fn run_tcp_receiver(
    cfg: IngestConfig,
    ingestor: Arc<Ingestor>,
    extractor: Arc<FieldExtractor>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&cfg.tcp_listen).await?;
    tracing::info!("syslog tcp receiver listening on {}", cfg.tcp_listen);
    let mut accept_shutdown = shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let cfg = cfg.clone();
                        let ingestor = ingestor.clone();
                        let extractor = extractor.clone();
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_tcp_conn(
                                stream, peer, cfg, ingestor, extractor, conn_shutdown,
                            )
                            .await
                            {
                                tracing::debug!("tcp connection {peer}: {e}");
                            }
                        });
                    }
                    Err(e) => tracing::warn!("tcp accept error: {e}"),
                }
            }
            _ = accept_shutdown.changed() => {
                if *accept_shutdown.borrow() {
                    tracing::info!("tcp receiver shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_tcp_conn(
    mut stream: tokio::net::TcpStream,
    peer: SocketAddr,
    cfg: IngestConfig,
    ingestor: Arc<Ingestor>,
    extractor: Arc<FieldExtractor>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut acc: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            read = stream.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    // Connection closed; a trailing unterminated line still counts.
                    if !acc.is_empty() {
                        handle_payload(
                            &acc, Some(peer), "tcp",
                            &ingestor, &extractor, &cfg.default_index, &cfg.routes,
                        );
                    }
                    return Ok(());
                }
                acc.extend_from_slice(&chunk[..n]);
                if acc.len() > MAX_FRAME_BYTES {
                    acc.truncate(MAX_FRAME_BYTES);
                    acc.push(b'\n');
                }
                while let Some(frame) = extract_frame(&mut acc) {
                    handle_payload(
                        &frame, Some(peer), "tcp",
                        &ingestor, &extractor, &cfg.default_index, &cfg.routes,
                    );
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newline_framing() {
        let mut buf = b"<34>Oct 11 22:14:15 h a: one\n<34>Oct 11 22:14:16 h a: two\n".to_vec();
        let one = extract_frame(&mut buf).unwrap();
        assert!(one.ends_with(b"one"));
        let two = extract_frame(&mut buf).unwrap();
        assert!(two.ends_with(b"two"));
        assert!(extract_frame(&mut buf).is_none());
    }

    #[test]
    fn octet_counted_framing() {
        let inner = "<34>1 - h a - - - hi";
        let mut buf = format!("{} {}", inner.len(), inner).into_bytes();
        buf.extend_from_slice(b"5 <34>x");
        let first = extract_frame(&mut buf).unwrap();
        assert_eq!(first, inner.as_bytes());
        let second = extract_frame(&mut buf).unwrap();
        assert_eq!(second, b"<34>x");
    }

    #[test]
    fn partial_octet_frame_waits() {
        let mut buf = b"20 <34>1 - h".to_vec();
        assert!(extract_frame(&mut buf).is_none());
        // Buffer untouched until the rest arrives.
        assert!(buf.starts_with(b"20 "));
    }

    #[test]
    fn partial_line_waits() {
        let mut buf = b"<34>Oct 11".to_vec();
        assert!(extract_frame(&mut buf).is_none());
    }

    #[test]
    fn crlf_is_stripped() {
        let mut buf = b"line one\r\nrest".to_vec();
        assert_eq!(extract_frame(&mut buf).unwrap(), b"line one");
    }

    #[test]
    fn routing_prefers_first_matching_prefix() {
        let mut event = Event::default();
        event.app_name = "nginx".to_string();
        let routes = vec![
            ("postgres".to_string(), "db".to_string()),
            ("nginx".to_string(), "web".to_string()),
        ];
        assert_eq!(route_index(&event, "default", &routes), "web");
        event.app_name = "cron".to_string();
        assert_eq!(route_index(&event, "default", &routes), "default");
    }
}
