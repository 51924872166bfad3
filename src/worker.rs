use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, watch};

use crate::{
    broker::{read_packet, write_packet},
    client::connect_stream,
    config::BrokerConfig,
    rpc::{RpcRequest, RpcResponse},
};

/// Trait for an object that can be exposed to the RPC worker.
///
/// A `SharedObject` defines how a given object responds to remote
/// procedure calls. Returning `Err` sends an [`RpcResponse::Error`] back to
/// the caller with the given message.
///
/// Objects must be thread-safe (`Send + Sync`) since calls are served
/// concurrently on separate tasks.
#[async_trait]
pub trait SharedObject: Send + Sync {
    /// Handle an RPC call for this object.
    ///
    /// # Arguments
    ///
    /// * `method` - The method name to invoke on this object.
    /// * `args` - JSON-encoded arguments to the method.
    async fn call(&self, method: &str, args: &Value) -> Result<Value, String>;
}

/// Builder pattern for constructing and spawning a worker runtime.
///
/// # Example
/// ```ignore
/// struct Storage;
///
/// #[async_trait]
/// impl SharedObject for Storage {
///     async fn call(&self, method: &str, args: &Value) -> Result<Value, String> {
///         match (method, args.as_str()) {
///             ("greet", Some(name)) => Ok(Value::from(format!("Hello, {name}!"))),
///             _ => Err("Unknown method".into()),
///         }
///     }
/// }
///
/// WorkerBuilder::new()
///     .add("storage", Storage)
///     .spawn()
///     .await
///     .unwrap();
/// ```
pub struct WorkerBuilder {
    objects: HashMap<String, Arc<dyn SharedObject>>,
    config: BrokerConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl WorkerBuilder {
    /// Create a new, empty worker builder.
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            config: BrokerConfig::default(),
            shutdown: None,
        }
    }

    /// Add a named object to the worker.
    pub fn add<T>(mut self, name: &str, obj: T) -> Self
    where
        T: SharedObject + 'static,
    {
        self.objects.insert(name.to_string(), Arc::new(obj));
        self
    }

    /// Use a specific broker address instead of the defaults.
    pub fn with_config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns a sender that stops the worker once `true` is sent.
    pub fn with_graceful_shutdown(mut self) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(rx);
        (self, tx)
    }

    /// Connect to the broker, register every object, and serve calls until
    /// the broker goes away or shutdown is requested.
    pub async fn spawn(self) -> std::io::Result<()> {
        run_worker(self.objects, &self.config, self.shutdown).await
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    std::future::pending::<()>().await
}

async fn serve_call(
    objects: &HashMap<String, Arc<dyn SharedObject>>,
    req: RpcRequest,
) -> Option<RpcResponse> {
    let (call_id, object_name, method, args) = match req {
        RpcRequest::Call {
            call_id,
            object_name,
            method,
            args,
        } => (call_id, object_name, method, args),
        other => {
            log::warn!("Worker got unsupported request: {other:?}");
            return None;
        }
    };

    let Some(obj) = objects.get(&object_name) else {
        log::error!("Unknown object: {object_name}");
        return Some(RpcResponse::Error {
            call_id: Some(call_id),
            message: format!("Unknown object: {object_name}"),
        });
    };

    log::debug!("Worker handling {object_name}.{method}({args})");
    let resp = match obj.call(&method, &args).await {
        Ok(value) => RpcResponse::Result {
            call_id,
            object_name,
            value,
        },
        Err(message) => RpcResponse::Error {
            call_id: Some(call_id),
            message,
        },
    };
    Some(resp)
}

async fn run_worker(
    objects: HashMap<String, Arc<dyn SharedObject>>,
    config: &BrokerConfig,
    mut shutdown: Option<watch::Receiver<bool>>,
) -> std::io::Result<()> {
    let stream = connect_stream(config).await?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    for name in objects.keys() {
        let reg = RpcRequest::RegisterObject {
            object_name: name.clone(),
        };
        write_packet(&mut writer, &serde_json::to_vec(&reg)?).await?;
    }

    let objects = Arc::new(objects);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RpcResponse>();

    let reader_task = tokio::spawn(async move {
        loop {
            let buf = match read_packet(&mut reader).await {
                Ok(data) => data,
                Err(err) => {
                    log::info!("Broker connection ended: {err}");
                    break;
                }
            };

            if let Ok(req) = serde_json::from_slice::<RpcRequest>(&buf) {
                let objects = objects.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    if let Some(resp) = serve_call(&objects, req).await {
                        let _ = out_tx.send(resp);
                    }
                });
            } else if let Ok(resp) = serde_json::from_slice::<RpcResponse>(&buf) {
                log::debug!("Worker got response: {resp:?}");
            } else {
                log::error!("Invalid JSON value from broker");
            }
        }
    });

    loop {
        tokio::select! {
            resp = out_rx.recv() => match resp {
                Some(resp) => {
                    write_packet(&mut writer, &serde_json::to_vec(&resp)?).await?;
                }
                None => break,
            },
            _ = shutdown_requested(&mut shutdown) => {
                log::info!("Worker shutdown requested");
                break;
            }
        }
    }

    reader_task.abort();
    Ok(())
}
