// Façade-facing request/response server (§10.4). Wraps a
// `CoordinationManager` behind a plain TCP socket so `coord-cli` (or any
// other client speaking the protocol in [`protocol`]) can drive the
// public operations without linking the crate directly.

pub mod protocol;

use crate::common::CancellationToken;
use crate::coordination::CoordinationManager;
use crate::error::Result;
use protocol::{read_frame, write_frame, Request, Response};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Accepts connections on `bind_address` and serves each one against
/// `manager` until the process is stopped. One task per connection;
/// requests on a single connection are handled sequentially, matching
/// the simple request/response shape of the protocol (no pipelining).
pub struct CoordinationServer {
    manager: Arc<CoordinationManager>,
}

impl CoordinationServer {
    pub fn new(manager: Arc<CoordinationManager>) -> Self {
        Self { manager }
    }

    pub async fn serve(&self, bind_address: std::net::SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(bind_address).await?;
        info!(addr = %bind_address, "coordination request server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "accepted coordination client connection");
            let manager = self.manager.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, manager).await {
                    warn!(%peer, error = %e, "coordination client connection ended with an error");
                }
            });
        }
    }
}

async fn handle_connection(mut stream: TcpStream, manager: Arc<CoordinationManager>) -> Result<()> {
    loop {
        let request: Request = match read_frame(&mut stream).await? {
            Some(request) => request,
            None => return Ok(()),
        };
        let response = dispatch(&manager, request).await;
        write_frame(&mut stream, &response).await?;
    }
}

async fn dispatch(manager: &Arc<CoordinationManager>, request: Request) -> Response {
    let cancel = CancellationToken::new();
    match request {
        Request::Get { key } => match manager.get(&key, &cancel).await {
            Ok(value) => Response::Value(value),
            Err(e) => Response::from_error(&e),
        },
        Request::Create { key, value } => match manager.create(&key, value, &cancel).await {
            Ok(entry) => Response::Entry(entry),
            Err(e) => Response::from_error(&e),
        },
        Request::GetOrCreate { key, value } => {
            match manager.get_or_create(&key, value, &cancel).await {
                Ok(value) => Response::Value(Some(value)),
                Err(e) => Response::from_error(&e),
            }
        }
        Request::SetValue { key, value, expected_version } => {
            match manager.set_value(&key, value, expected_version, &cancel).await {
                Ok(entry) => Response::Entry(entry),
                Err(e) => Response::from_error(&e),
            }
        }
        Request::Delete { key, expected_version, recursive } => {
            match manager.delete(&key, expected_version, recursive, &cancel).await {
                Ok(entry) => Response::Entry(entry),
                Err(e) => Response::from_error(&e),
            }
        }
        Request::GetSession => Response::Session(manager.get_session()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SessionId;
    use crate::exchange::{Message, PhysicalEndpoint};
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct NullEndpoint {
        sent: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl PhysicalEndpoint for NullEndpoint {
        async fn send_to(&self, _target: &SessionId, _bytes: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn recv(&self) -> Result<Vec<u8>> {
            std::future::pending().await
        }
    }

    fn manager() -> Arc<CoordinationManager> {
        let local = SessionId::new(b"127.0.0.1:1".to_vec(), b"t".to_vec());
        CoordinationManager::new(
            local,
            Duration::from_secs(30),
            Duration::from_millis(5),
            Duration::from_millis(40),
            Arc::new(InMemoryStorage::new()),
            Arc::new(NullEndpoint::default()),
        )
    }

    #[tokio::test]
    async fn create_then_get_over_the_wire() {
        let mgr = manager();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = CoordinationServer::new(mgr);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = handle_connection(stream, server.manager.clone()).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut client,
            &Request::Create {
                key: "/a".to_string(),
                value: vec![1, 2, 3],
            },
        )
        .await
        .unwrap();
        let response: Response = read_frame(&mut client).await.unwrap().unwrap();
        assert!(matches!(response, Response::Entry(entry) if entry.value == vec![1, 2, 3]));

        write_frame(&mut client, &Request::Get { key: "/a".to_string() })
            .await
            .unwrap();
        let response: Response = read_frame(&mut client).await.unwrap().unwrap();
        assert!(matches!(response, Response::Value(Some(v)) if v == vec![1, 2, 3]));
    }
}
