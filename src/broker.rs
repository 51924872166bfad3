use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
#[cfg(windows)]
use tokio::net::windows::named_pipe::ServerOptions;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::rpc::{CallId, ClientId, MAX_PACKET, RpcRequest, RpcResponse};

/// A call in flight: who asked, and which connection owns the object.
#[derive(Debug, Clone)]
struct PendingCall {
    caller: ClientId,
    owner: ClientId,
}

/// Shared broker state
type ClientSender = mpsc::UnboundedSender<ClientMsg>;
type SharedClients = Arc<Mutex<HashMap<ClientId, ClientSender>>>;
type SharedObjects = Arc<Mutex<HashMap<String, ClientId>>>;
type SharedCalls = Arc<Mutex<HashMap<CallId, PendingCall>>>;

/// Message to a client actor
#[derive(Debug)]
enum ClientMsg {
    Outgoing(Vec<u8>),
}

/// Trait alias for supported stream types
trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Read one length-prefixed packet.
pub async fn read_packet<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_PACKET {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("packet of {len} bytes exceeds limit of {MAX_PACKET}"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write one length-prefixed packet.
pub async fn write_packet<W>(writer: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if data.len() > MAX_PACKET {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("packet of {} bytes exceeds limit of {MAX_PACKET}", data.len()),
        ));
    }
    writer.write_u32(data.len() as u32).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Actor that owns a client connection
struct ClientActor<S> {
    client_id: ClientId,
    stream: S,
    rx: mpsc::UnboundedReceiver<ClientMsg>,
    state: ServerState,
}

impl<S> ClientActor<S>
where
    S: Stream + 'static,
{
    async fn run(self) {
        let (reader, mut writer) = tokio::io::split(self.stream);
        let client_id = self.client_id;
        let state = self.state;
        let mut rx = self.rx;
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let reader_task = tokio::spawn({
            let client_id = client_id.clone();
            let state = state.clone();
            async move {
                Self::reader_loop(reader, client_id, state).await;
                let _ = shutdown_tx.send(());
            }
        });

        Self::writer_loop(&mut writer, &client_id, &mut rx, shutdown_rx).await;

        let _ = reader_task.await;

        state.cleanup_client(&client_id).await;

        log::info!("Actor ended for {client_id:?}");
    }

    async fn reader_loop<R>(mut reader: R, client_id: ClientId, state: ServerState)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let buf = match read_packet(&mut reader).await {
                Ok(buf) => buf,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::info!("Client {client_id:?} disconnected");
                    break;
                }
                Err(e) => {
                    log::error!("Read error {client_id:?}: {e:?}");
                    break;
                }
            };

            let val = match serde_json::from_slice::<serde_json::Value>(&buf) {
                Ok(val) => val,
                Err(e) => {
                    log::error!("Invalid JSON from {client_id:?}: {e}");
                    continue;
                }
            };
            log::debug!("Received from {client_id:?}: {val}");

            if let Ok(req) = serde_json::from_value::<RpcRequest>(val.clone()) {
                state.handle_request(req, &client_id).await;
            } else if let Ok(resp) = serde_json::from_value::<RpcResponse>(val) {
                state.handle_response(resp, &client_id).await;
            } else {
                log::error!("Unrecognized message from {client_id:?}");
            }
        }
    }

    async fn writer_loop<W>(
        writer: &mut W,
        client_id: &ClientId,
        rx: &mut mpsc::UnboundedReceiver<ClientMsg>,
        mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) where
        W: AsyncWrite + Unpin,
    {
        tokio::select! {
            _ = &mut shutdown_rx => {
                log::debug!("Shutdown signal received by writer for {client_id:?}");
            }
            _ = async {
                while let Some(ClientMsg::Outgoing(bytes)) = rx.recv().await {
                    if let Err(e) = write_packet(writer, &bytes).await {
                        log::error!("Write error {client_id:?}: {e:?}");
                        break;
                    }
                }
            } => {}
        }
    }
}

#[derive(Clone, Default)]
struct ServerState {
    objects: SharedObjects,
    clients: SharedClients,
    calls: SharedCalls,
}

impl ServerState {
    /// Dispatch logic for RpcRequest
    async fn handle_request(&self, req: RpcRequest, client_id: &ClientId) {
        match req {
            RpcRequest::RegisterObject { object_name } => {
                self.handle_register_object(object_name, client_id).await;
            }

            RpcRequest::Call {
                call_id,
                object_name,
                method,
                args,
            } => {
                self.handle_call(call_id, object_name, method, args, client_id)
                    .await;
            }

            RpcRequest::HasObject { object_name } => {
                let exists = { self.objects.lock().await.contains_key(&object_name) };
                let resp = RpcResponse::HasObjectResult {
                    object_name,
                    exists,
                };
                self.send_to_client(client_id, &resp).await;
            }
        }
    }

    /// Dispatch logic for RpcResponse
    async fn handle_response(&self, resp: RpcResponse, from: &ClientId) {
        let Some(call_id) = resp.call_id() else {
            log::warn!("Unhandled response type from {from:?}: {resp:?}");
            return;
        };

        // Only the connection the call was routed to may answer it.
        let caller = {
            let mut calls = self.calls.lock().await;
            match calls.get(call_id).map(|pending| &pending.owner == from) {
                Some(true) => calls.remove(call_id).map(|pending| pending.caller),
                Some(false) => {
                    log::warn!("Ignoring response for call_id {call_id:?} from non-owner {from:?}");
                    return;
                }
                None => None,
            }
        };
        match caller {
            Some(caller) => {
                log::debug!("Forwarding response for call_id {call_id:?} to caller {caller:?}");
                self.send_to_client(&caller, &resp).await;
            }
            None => log::warn!("No caller found for call_id {call_id:?}"),
        }
    }

    async fn handle_register_object(&self, object_name: String, client_id: &ClientId) {
        log::info!("Client {client_id:?} registered object '{object_name}'");
        self.objects
            .lock()
            .await
            .insert(object_name.clone(), client_id.clone());

        let resp = RpcResponse::Registered { object_name };
        self.send_to_client(client_id, &resp).await;
    }

    async fn handle_call(
        &self,
        call_id: CallId,
        object_name: String,
        method: String,
        args: serde_json::Value,
        client_id: &ClientId,
    ) {
        let owner = { self.objects.lock().await.get(&object_name).cloned() };

        let Some(owner) = owner else {
            let err = RpcResponse::Error {
                call_id: Some(call_id),
                message: "No such object".into(),
            };
            self.send_to_client(client_id, &err).await;
            return;
        };

        self.calls.lock().await.insert(
            call_id.clone(),
            PendingCall {
                caller: client_id.clone(),
                owner: owner.clone(),
            },
        );

        log::debug!("Forwarding call {call_id:?} to worker {owner:?}");
        let forwarded = RpcRequest::Call {
            call_id,
            object_name,
            method,
            args,
        };
        self.send_to_client(&owner, &forwarded).await;
    }

    async fn cleanup_client(&self, client_id: &ClientId) {
        log::debug!("Cleaning up client {client_id:?}");

        self.clients.lock().await.remove(client_id);

        self.objects
            .lock()
            .await
            .retain(|_, owner| owner != client_id);

        // Calls this client asked for are dropped; calls it was serving fail.
        let orphaned: Vec<(CallId, ClientId)> = {
            let mut calls = self.calls.lock().await;
            calls.retain(|_, call| &call.caller != client_id);
            let orphaned = calls
                .iter()
                .filter(|(_, call)| &call.owner == client_id)
                .map(|(id, call)| (id.clone(), call.caller.clone()))
                .collect();
            calls.retain(|_, call| &call.owner != client_id);
            orphaned
        };

        for (call_id, caller) in orphaned {
            let err = RpcResponse::Error {
                call_id: Some(call_id),
                message: "Object owner disconnected".into(),
            };
            self.send_to_client(&caller, &err).await;
        }
    }

    async fn send_to_client<T: serde::Serialize>(&self, client_id: &ClientId, msg: &T) {
        let bytes = match serde_json::to_vec(msg) {
            Ok(b) => b,
            Err(e) => {
                log::error!("Failed to serialize message for {client_id:?}: {e}");
                return;
            }
        };
        let clients = self.clients.lock().await;
        if let Some(tx) = clients.get(client_id) {
            let _ = tx.send(ClientMsg::Outgoing(bytes));
        }
    }
}

async fn start_tcp_listener(addr: &str, state: ServerState) -> std::io::Result<()> {
    let tcp_listener = TcpListener::bind(addr).await?;
    log::info!("Broker listening on TCP {addr}");

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, _)) => spawn_client(stream, state.clone()).await,
                Err(e) => log::error!("TCP accept error: {e:?}"),
            }
        }
    });

    Ok(())
}

#[cfg(unix)]
async fn start_unix_listener(path: &std::path::Path, state: ServerState) -> std::io::Result<()> {
    let _ = std::fs::remove_file(path);
    let unix_listener = UnixListener::bind(path)?;
    log::info!("Broker also listening on {path:?}");

    tokio::spawn(async move {
        loop {
            match unix_listener.accept().await {
                Ok((stream, _)) => spawn_client(stream, state.clone()).await,
                Err(e) => log::error!("Unix accept error: {e:?}"),
            }
        }
    });

    Ok(())
}

#[cfg(windows)]
fn start_named_pipe_listener(state: ServerState) {
    use crate::rpc::PIPE_PATH;
    log::info!("Broker also listening on named pipe {PIPE_PATH}");

    tokio::spawn(async move {
        loop {
            let server = match ServerOptions::new()
                .first_pipe_instance(false)
                .create(PIPE_PATH)
            {
                Ok(s) => s,
                Err(e) => {
                    log::error!("Pipe creation failed: {e:?}");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
            };

            match server.connect().await {
                Ok(()) => spawn_client(server, state.clone()).await,
                Err(e) => log::error!("NamedPipe connection failed: {e:?}"),
            }
        }
    });
}

async fn spawn_client<S>(stream: S, state: ServerState)
where
    S: Stream + 'static,
{
    let client_id = ClientId(Uuid::new_v4().to_string());
    log::info!("New connection: {client_id:?}");

    let (tx, rx) = mpsc::unbounded_channel::<ClientMsg>();
    state.clients.lock().await.insert(client_id.clone(), tx);

    let actor = ClientActor {
        client_id,
        stream,
        rx,
        state,
    };
    tokio::spawn(actor.run());
}

/// Bind every listener and return once they are accepting connections.
pub async fn start_broker(config: &BrokerConfig) -> std::io::Result<()> {
    let state = ServerState::default();

    start_tcp_listener(&config.listen_addr, state.clone()).await?;

    #[cfg(unix)]
    start_unix_listener(&config.unix_path, state.clone()).await?;

    #[cfg(windows)]
    start_named_pipe_listener(state);

    Ok(())
}

/// Run the broker until ctrl-c.
pub async fn run_broker(config: &BrokerConfig) -> std::io::Result<()> {
    start_broker(config).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("Broker shutting down...");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversized_write_is_refused() {
        let data = vec![b' '; MAX_PACKET + 1];
        let err = write_packet(&mut tokio::io::sink(), &data).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn oversized_length_header_is_invalid_data() {
        let header = ((MAX_PACKET + 1) as u32).to_be_bytes();
        let err = read_packet(&mut &header[..]).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn packet_survives_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_packet(&mut a, br#"{"k":1}"#).await.unwrap();
        assert_eq!(read_packet(&mut b).await.unwrap(), br#"{"k":1}"#.to_vec());
    }
}
