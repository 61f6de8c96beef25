//! Client-facing locate service.
//!
//! A client opens a connection, sends one `LocateRequest`, and gets back the
//! address of the server currently authoritative for that key. The routing
//! decision itself is made by the coordinator's main loop (the only owner of
//! the server table); a quiesced shard answers with silence, i.e. the
//! connection is closed without a response and the client retries.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::protocol::{Key, LocateRequest, LocateResponse};
use crate::utils::{recv_frame, send_frame, tcp_bind_with_retry, ShardKvError};

/// The client-facing locate service module.
pub(crate) struct LocateService {
    /// Receiver side of the locate request channel.
    rx_req: mpsc::UnboundedReceiver<(Key, oneshot::Sender<Option<LocateResponse>>)>,

    /// Client acceptor task join handle.
    _acceptor_handle: JoinHandle<()>,
}

impl LocateService {
    /// Binds the client-facing listener and spawns the acceptor task.
    pub(crate) async fn new_and_setup(
        cli_addr: SocketAddr,
    ) -> Result<Self, ShardKvError> {
        let (tx_req, rx_req) = mpsc::unbounded_channel();

        let listener = tcp_bind_with_retry(cli_addr, 10).await?;
        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(listener, tx_req));

        Ok(LocateService {
            rx_req,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Waits for the next locate request; the paired sender delivers the
    /// main loop's routing answer back to the waiting servant.
    pub(crate) async fn recv_req(
        &mut self,
    ) -> Result<(Key, oneshot::Sender<Option<LocateResponse>>), ShardKvError>
    {
        match self.rx_req.recv().await {
            Some(req) => Ok(req),
            None => logged_err!("m"; "locate request channel has been closed"),
        }
    }

    /// Client acceptor task: one servant per one-shot connection.
    async fn acceptor_task(
        listener: TcpListener,
        tx_req: mpsc::UnboundedSender<(
            Key,
            oneshot::Sender<Option<LocateResponse>>,
        )>,
    ) {
        pf_debug!("m"; "locate acceptor task spawned");

        let local_addr = listener.local_addr().unwrap();
        pf_info!("m"; "accepting clients on '{}'", local_addr);

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    tokio::spawn(Self::servant_task(stream, tx_req.clone()));
                }
                Err(e) => {
                    pf_warn!("m"; "error accepting client connection: {}", e);
                }
            }
        }
    }

    /// Per-connection servant: one request, at most one response, close.
    async fn servant_task(
        mut stream: TcpStream,
        tx_req: mpsc::UnboundedSender<(
            Key,
            oneshot::Sender<Option<LocateResponse>>,
        )>,
    ) {
        let req = match recv_frame::<LocateRequest, _>(&mut stream).await {
            Ok(req) => req,
            Err(e) => {
                pf_debug!("m"; "error reading locate request: {}", e);
                return;
            }
        };

        let (tx_resp, rx_resp) = oneshot::channel();
        if tx_req.send((req.key, tx_resp)).is_err() {
            return;
        }

        match rx_resp.await {
            Ok(Some(resp)) => {
                if let Err(e) = send_frame(&mut stream, &resp).await {
                    pf_debug!("m"; "error replying to locate: {}", e);
                }
            }
            // quiesced or unroutable: close without responding
            Ok(None) | Err(_) => {}
        }
    }
}
