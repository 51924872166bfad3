use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
#[cfg(unix)]
use tokio::net::UnixStream;
#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, mpsc, oneshot},
};

use crate::broker::{read_packet, write_packet};
use crate::config::BrokerConfig;
use crate::error::{GreetError, Result};
use crate::rpc::{CallId, RpcRequest, RpcResponse};

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite + Unpin> AsyncStream for T {}

pub(crate) type BoxStream = Box<dyn AsyncStream + Send + Unpin>;

const OBJECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connect to the broker: TCP when `connect_addr` is set, otherwise the local
/// socket (Unix) or named pipe (Windows).
pub(crate) async fn connect_stream(config: &BrokerConfig) -> std::io::Result<BoxStream> {
    if let Some(addr) = &config.connect_addr {
        let tcp = TcpStream::connect(addr.as_str()).await?;
        log::debug!("Connected to broker via TCP {addr}");
        return Ok(Box::new(tcp));
    }

    connect_local(config).await
}

#[cfg(unix)]
async fn connect_local(config: &BrokerConfig) -> std::io::Result<BoxStream> {
    let unix = UnixStream::connect(&config.unix_path).await?;
    log::debug!("Connected to broker via Unix socket {:?}", config.unix_path);
    Ok(Box::new(unix))
}

#[cfg(windows)]
async fn connect_local(_config: &BrokerConfig) -> std::io::Result<BoxStream> {
    use crate::rpc::PIPE_PATH;
    loop {
        match ClientOptions::new().open(PIPE_PATH) {
            Ok(pipe) => {
                log::debug!("Connected to broker via named pipe {PIPE_PATH}");
                return Ok(Box::new(pipe));
            }
            Err(e) if e.raw_os_error() == Some(231) => {
                log::warn!("All pipe instances busy, retrying...");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// What a response is matched against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingKey {
    Call(CallId),
    HasObject(String),
    Registered(String),
}

impl PendingKey {
    fn for_request(req: &RpcRequest) -> Self {
        match req {
            RpcRequest::Call { call_id, .. } => PendingKey::Call(call_id.clone()),
            RpcRequest::HasObject { object_name } => PendingKey::HasObject(object_name.clone()),
            RpcRequest::RegisterObject { object_name } => {
                PendingKey::Registered(object_name.clone())
            }
        }
    }

    fn for_response(resp: &RpcResponse) -> Option<Self> {
        match resp {
            RpcResponse::HasObjectResult { object_name, .. } => {
                Some(PendingKey::HasObject(object_name.clone()))
            }
            RpcResponse::Registered { object_name } => {
                Some(PendingKey::Registered(object_name.clone()))
            }
            _ => resp.call_id().cloned().map(PendingKey::Call),
        }
    }
}

type Responder = oneshot::Sender<std::io::Result<RpcResponse>>;

#[derive(Default)]
struct PendingState {
    waiters: HashMap<PendingKey, VecDeque<Responder>>,
    closed: bool,
}

impl PendingState {
    fn take(&mut self, key: &PendingKey) -> Option<Responder> {
        let queue = self.waiters.get_mut(key)?;
        let responder = queue.pop_front();
        if queue.is_empty() {
            self.waiters.remove(key);
        }
        responder
    }

    fn fail_all(&mut self, reason: &str) {
        self.closed = true;
        for (_, queue) in self.waiters.drain() {
            for responder in queue {
                let _ = responder.send(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    reason.to_string(),
                )));
            }
        }
    }
}

type Pending = Arc<Mutex<PendingState>>;

/// Request from a handle to the client actor
struct ClientMsg {
    req: RpcRequest,
    resp_tx: Responder,
}

/// Cheap, cloneable connection to the broker.
///
/// Requests from every clone are written by one writer task; a reader task
/// routes each response to the request it answers, so any number of calls
/// may be in flight at once.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ClientMsg>,
}

impl ClientHandle {
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let stream = connect_stream(config).await?;
        Ok(Self::from_stream(stream))
    }

    pub(crate) fn from_stream(stream: BoxStream) -> Self {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<ClientMsg>(32);
        let pending: Pending = Arc::default();

        tokio::spawn({
            let pending = pending.clone();
            async move {
                while let Some(ClientMsg { req, resp_tx }) = rx.recv().await {
                    let data = match serde_json::to_vec(&req) {
                        Ok(d) => d,
                        Err(e) => {
                            let _ = resp_tx
                                .send(Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)));
                            continue;
                        }
                    };

                    let key = PendingKey::for_request(&req);
                    {
                        let mut state = pending.lock().await;
                        if state.closed {
                            let _ = resp_tx.send(Err(std::io::Error::new(
                                std::io::ErrorKind::ConnectionAborted,
                                "Connection closed by broker",
                            )));
                            continue;
                        }
                        state.waiters.entry(key.clone()).or_default().push_back(resp_tx);
                    }

                    if let Err(e) = write_packet(&mut writer, &data).await {
                        log::error!("Write to broker failed: {e}");
                        let mut state = pending.lock().await;
                        if let Some(resp_tx) = state.take(&key) {
                            let _ = resp_tx.send(Err(e));
                        }
                        state.fail_all("Write to broker failed");
                        break;
                    }
                }
                // Last handle dropped: half-close so the broker ends the session.
                let _ = writer.shutdown().await;
            }
        });

        tokio::spawn(async move {
            loop {
                let buf = match read_packet(&mut reader).await {
                    Ok(buf) => buf,
                    Err(e) => {
                        log::debug!("Broker connection ended: {e}");
                        pending.lock().await.fail_all("Connection closed by broker");
                        break;
                    }
                };

                let resp = match serde_json::from_slice::<RpcResponse>(&buf) {
                    Ok(resp) => resp,
                    Err(e) => {
                        log::error!("Invalid response from broker: {e}");
                        continue;
                    }
                };

                let responder = match PendingKey::for_response(&resp) {
                    Some(key) => pending.lock().await.take(&key),
                    None => None,
                };
                match responder {
                    Some(resp_tx) => {
                        let _ = resp_tx.send(Ok(resp));
                    }
                    None => log::warn!("Dropping unsolicited response: {resp:?}"),
                }
            }
        });

        Self { tx }
    }

    async fn request(&self, req: RpcRequest) -> Result<RpcResponse> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(ClientMsg { req, resp_tx })
            .await
            .map_err(|_| GreetError::Disconnected("client actor"))?;

        let resp = resp_rx
            .await
            .map_err(|_| GreetError::Disconnected("client actor"))??;
        Ok(resp)
    }

    /// Call `object.method(args)` and decode the result.
    pub async fn remote_call<A, R>(&self, object: &str, method: &str, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let req = RpcRequest::Call {
            call_id: CallId::new(),
            object_name: object.into(),
            method: method.into(),
            args: serde_json::to_value(args)?,
        };

        match self.request(req).await? {
            RpcResponse::Result { value, .. } => Ok(serde_json::from_value(value)?),
            RpcResponse::Error { message, .. } => Err(GreetError::Remote(message)),
            other => Err(GreetError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    pub async fn has_object(&self, object: &str) -> Result<bool> {
        let req = RpcRequest::HasObject {
            object_name: object.into(),
        };
        match self.request(req).await? {
            RpcResponse::HasObjectResult { exists, .. } => Ok(exists),
            other => Err(GreetError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Poll the broker until some worker has registered `object`.
    pub async fn wait_for_object(&self, object: &str) -> Result<()> {
        loop {
            if self.has_object(object).await? {
                return Ok(());
            }
            log::debug!("Waiting for object '{object}'...");
            tokio::time::sleep(OBJECT_POLL_INTERVAL).await;
        }
    }
}
