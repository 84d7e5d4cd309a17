//! Per-Connection Handler
//!
//! One task per client connection: read a command, dispatch it to the
//! `Client` quorum executor, write back the response, emit one access-log
//! line. No session state survives across commands — each line stands on
//! its own, unlike a protocol with a stateful handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::client::{Client, ClientError};
use crate::log::LogRegistry;
use crate::metrics::Metrics;
use crate::protocol::{self, Cmd, Request, Response, Status};

/// Drives one client connection to completion: reads requests off `socket`
/// until EOF, `quit`, a protocol error, or a shutdown signal, dispatching
/// each to `client` and logging the outcome via `log`.
pub async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    client: Arc<Client>,
    log: Arc<LogRegistry>,
    _metrics: Arc<Metrics>,
    conn_id: u64,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    let _ = socket.set_nodelay(true);
    let mut stream = BufReader::new(socket);
    let remote = peer.to_string();

    loop {
        let req = tokio::select! {
            req = protocol::read_request(&mut stream) => req,
            _ = shutdown_rx.recv() => {
                tracing::debug!(conn_id, "shutdown signal received, closing connection");
                return;
            }
        };

        let req = match req {
            Ok(Some(req)) => req,
            Ok(None) => return,
            Err(e) => {
                log.error(&format!("{remote}: {e}")).await;
                let _ = protocol::write_response(&mut stream, Cmd::Get, &Response::error(e.to_string())).await;
                return;
            }
        };

        if req.cmd == Cmd::Quit {
            return;
        }

        let start = Instant::now();
        let outcome = dispatch(&client, &req).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let (resp, hosts, failed) = match outcome {
            Ok((resp, hosts)) => (resp, hosts, false),
            Err((resp, hosts)) => (resp, hosts, true),
        };

        let size = req.item.as_ref().map(|i| i.body.len()).unwrap_or(0);
        log.access(&remote, req.cmd.as_str(), req.key(), size, &hosts, elapsed_ms, failed).await;

        if req.no_reply {
            continue;
        }

        if protocol::write_response(&mut stream, req.cmd, &resp).await.is_err() {
            return;
        }
    }
}

/// Routes one parsed request to the appropriate `Client` quorum call and
/// turns the result into a wire `Response` plus the hosts contacted, for
/// the access log. The `Ok`/`Err` split tracks whether the quorum was met.
async fn dispatch(client: &Client, req: &Request) -> Result<(Response, Vec<String>), (Response, Vec<String>)> {
    match req.cmd {
        Cmd::Get | Cmd::Gets => {
            if req.keys.len() == 1 {
                match client.get(req.key()).await {
                    Ok(outcome) => {
                        let mut resp = Response { status: Some(Status::Value), ..Default::default() };
                        if let Some(item) = outcome.value {
                            resp.items.insert(req.key().to_string(), item);
                        }
                        Ok((resp, outcome.hosts))
                    }
                    Err(e) => Err((client_error_response(e), vec![])),
                }
            } else {
                let keys: Vec<&str> = req.keys.iter().map(String::as_str).collect();
                match client.get_multi(&keys).await {
                    Ok(outcome) => {
                        let resp = Response { status: Some(Status::Value), items: outcome.items, ..Default::default() };
                        Ok((resp, outcome.hosts))
                    }
                    Err(e) => Err((client_error_response(e), vec![])),
                }
            }
        }

        // `Add`/`Replace`/`Cas` have no distinct quorum semantics of their
        // own — routing only models Set/Append — so they ride the Set
        // path rather than being rejected outright.
        Cmd::Set | Cmd::Add | Cmd::Replace | Cmd::Cas => {
            let item = req.item.clone().expect("storage command carries an item");
            match client.set(req.key(), item, req.no_reply).await {
                Ok(true) => Ok((Response::stored(), vec![])),
                Ok(false) => Err((Response::status(Status::NotStored), vec![])),
                Err(ClientError::WriteFailed) => Err((Response::status(Status::NotStored), vec![])),
                Err(e) => Err((client_error_response(e), vec![])),
            }
        }
        Cmd::Append | Cmd::Prepend => {
            let item = req.item.clone().expect("storage command carries an item");
            match client.append(req.key(), item.body).await {
                Ok(true) => Ok((Response::stored(), vec![])),
                Ok(false) => Err((Response::status(Status::NotStored), vec![])),
                Err(ClientError::WriteFailed) => Err((Response::status(Status::NotStored), vec![])),
                Err(e) => Err((client_error_response(e), vec![])),
            }
        }

        Cmd::Delete => match client.delete(req.key()).await {
            Ok(true) => Ok((Response::status(Status::Deleted), vec![])),
            Ok(false) => Err((Response::status(Status::NotFound), vec![])),
            Err(ClientError::WriteFailed) => Err((Response::status(Status::NotFound), vec![])),
            Err(e) => Err((client_error_response(e), vec![])),
        },

        // `Decr` has no dedicated quorum path of its own; negating the
        // delta through the same Incr executor covers the common case,
        // without memcached's clamp-at-zero floor.
        Cmd::Incr | Cmd::Decr => {
            let delta = if req.cmd == Cmd::Decr { -req.delta } else { req.delta };
            match client.incr(req.key(), delta).await {
                Ok(v) => Ok((Response { status: Some(Status::Ok), counter: Some(v), ..Default::default() }, vec![])),
                Err(ClientError::WriteFailed) => Err((Response::status(Status::NotFound), vec![])),
                Err(e) => Err((client_error_response(e), vec![])),
            }
        }

        Cmd::Stats => Ok((Response { status: Some(Status::Ok), msg: String::new(), ..Default::default() }, vec![])),

        Cmd::Quit => unreachable!("quit is handled before dispatch"),
    }
}

fn client_error_response(e: ClientError) -> Response {
    match e {
        ClientError::AccessDenied => Response::status(Status::ClientError),
        ClientError::ReadQuorumNotMet | ClientError::WriteFailed => Response::error(e.to_string()),
        ClientError::Host(host_err) => Response::error(host_err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fnv1a;
    use crate::host::HostTimeouts;
    use crate::scheduler::{ManualScheduler, Scheduler};

    fn test_client(n_hosts: usize, n: usize) -> Client {
        let entries: Vec<(String, Vec<String>)> =
            (0..n_hosts).map(|i| (format!("127.0.0.1:{}", 21000 + i), vec!["0".to_string()])).collect();
        let scheduler: Arc<dyn Scheduler> =
            ManualScheduler::new(entries, 1, n, fnv1a, HostTimeouts::default(), Arc::new(Metrics::new())).unwrap();
        Client::new(scheduler, crate::client::Quorum { n, w: n, r: 1 }, false, false, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn get_against_unreachable_hosts_reports_an_error_response() {
        let client = test_client(1, 1);
        let req = Request { cmd: Cmd::Get, keys: vec!["k".into()], item: None, delta: 0, no_reply: false };
        let (resp, _) = dispatch(&client, &req).await.unwrap_err();
        assert_eq!(resp.status, Some(Status::ServerError));
    }

    #[tokio::test]
    async fn stats_replies_ok_without_contacting_any_host() {
        let client = test_client(1, 1);
        let req = Request { cmd: Cmd::Stats, keys: vec![], item: None, delta: 0, no_reply: false };
        let (resp, hosts) = dispatch(&client, &req).await.unwrap();
        assert_eq!(resp.status, Some(Status::Ok));
        assert!(hosts.is_empty());
    }
}
