//! Request/response calls over a message channel
//!
//! Each request carries a correlation id, and its response carries the same
//! id back. Responses may arrive in any order. The transport underneath is
//! any [Port]; [channel()] builds an in-process one from tokio channels.

use crate::{
    errors::{CallError, IPCError},
    protocol::{CallId, Request, Response},
    transfer::{Envelope, Resources, Transferable},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

/// Sending half of a [Port]
pub trait PortSender: Send + Sync + 'static {
    fn send(&self, message: Envelope) -> Result<(), IPCError>;
}

/// Receiving half of a [Port]
#[async_trait]
pub trait PortReceiver: Send + 'static {
    /// Next message, or `None` once the other side is gone
    async fn recv(&mut self) -> Option<Envelope>;
}

/// One end of a bidirectional, in-order message channel
pub trait Port: Send + 'static {
    type Sender: PortSender;
    type Receiver: PortReceiver;

    fn split(self) -> (Self::Sender, Self::Receiver);
}

/// Port built from a pair of unbounded tokio channels
pub struct ChannelPort {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

pub struct ChannelSender(mpsc::UnboundedSender<Envelope>);

pub struct ChannelReceiver(mpsc::UnboundedReceiver<Envelope>);

/// Create two connected ports
pub fn channel() -> (ChannelPort, ChannelPort) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        ChannelPort {
            sender: ChannelSender(a_tx),
            receiver: ChannelReceiver(b_rx),
        },
        ChannelPort {
            sender: ChannelSender(b_tx),
            receiver: ChannelReceiver(a_rx),
        },
    )
}

impl PortSender for ChannelSender {
    fn send(&self, message: Envelope) -> Result<(), IPCError> {
        self.0.send(message).map_err(|_| IPCError::Disconnected)
    }
}

#[async_trait]
impl PortReceiver for ChannelReceiver {
    async fn recv(&mut self) -> Option<Envelope> {
        self.0.recv().await
    }
}

impl Port for ChannelPort {
    type Sender = ChannelSender;
    type Receiver = ChannelReceiver;

    fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

#[derive(Default)]
struct Pending {
    next_id: CallId,
    waiting: HashMap<CallId, oneshot::Sender<Envelope>>,
    disconnected: bool,
}

/// Calling side of a channel
pub struct Client<Req, Res, Err> {
    sender: Arc<dyn PortSender>,
    pending: Arc<Mutex<Pending>>,
    _types: PhantomData<fn(Req) -> Result<Res, Err>>,
}

impl<Req, Res, Err> Clone for Client<Req, Res, Err> {
    fn clone(&self) -> Self {
        Client {
            sender: self.sender.clone(),
            pending: self.pending.clone(),
            _types: PhantomData,
        }
    }
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<Req, Res, Err> Client<Req, Res, Err>
where
    Req: Transferable,
    Res: Transferable,
    Err: DeserializeOwned + Send + 'static,
{
    /// Start routing responses that arrive on `port`
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<P: Port>(port: P) -> Self {
        let (sender, mut receiver) = port.split();
        let pending = Arc::new(Mutex::new(Pending::default()));
        let task_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                let id = message.data.get("id").and_then(Value::as_u64);
                let waiter = id.and_then(|id| lock(&task_pending).waiting.remove(&id));
                match waiter {
                    // the caller may have stopped waiting; that's fine
                    Some(waiter) => drop(waiter.send(message)),
                    None => log::warn!("dropping response with unmatched id {:?}", id),
                }
            }
            log::trace!("client port closed");
            let mut pending = lock(&task_pending);
            pending.disconnected = true;
            pending.waiting.clear();
        });
        Client {
            sender: Arc::new(sender),
            pending,
            _types: PhantomData,
        }
    }

    fn send(&self, request: Req, waiter: oneshot::Sender<Envelope>) -> Result<(), IPCError> {
        let id = {
            let mut pending = lock(&self.pending);
            if pending.disconnected {
                return Err(IPCError::Disconnected);
            }
            let id = pending.next_id;
            pending.next_id += 1;
            pending.waiting.insert(id, waiter);
            id
        };
        let mut resources = Vec::new();
        let payload = request.extract(&mut resources);
        let data = json!(Request { id, payload });
        if let Err(err) = self.sender.send(Envelope { data, resources }) {
            lock(&self.pending).waiting.remove(&id);
            return Err(err);
        }
        Ok(())
    }

    /// Send a request and wait for its matching response
    pub async fn call(&self, request: Req) -> Result<Res, CallError<Err>> {
        let (waiter, reply) = oneshot::channel();
        self.send(request, waiter)?;
        let Envelope { data, resources } = reply.await.map_err(|_| IPCError::Disconnected)?;
        let response: Response<Value, Err> = serde_json::from_value(data).map_err(IPCError::from)?;
        match response.into_result() {
            Ok(ok) => Ok(Res::restore(ok, &mut Resources::new(resources))?),
            Err(err) => Err(CallError::Remote(err)),
        }
    }

    /// Send a request without waiting for any response
    ///
    /// A response that arrives later is discarded quietly.
    pub fn post(&self, request: Req) -> Result<(), IPCError> {
        let (waiter, _) = oneshot::channel();
        self.send(request, waiter)
    }

    /// Number of calls still waiting for a response
    pub fn pending(&self) -> usize {
        lock(&self.pending).waiting.len()
    }
}

/// Handler for the exposed side of a channel
#[async_trait]
pub trait Service: Send + Sync + 'static {
    type Request: Transferable;
    type Response: Transferable;
    type Error: Serialize + From<IPCError> + Send + Sync + 'static;

    async fn handle(&self, request: Self::Request) -> Result<Self::Response, Self::Error>;

    /// Whether an error should be treated as fatal to the caller
    fn is_fatal(&self, _error: &Self::Error) -> bool {
        false
    }

    /// Runs after a fatal error has been sent back to the caller
    async fn fault(&self, _error: &Self::Error) {}
}

/// Answer requests arriving on `port` using `service`
///
/// Each request is handled in its own task so slow requests don't hold up
/// others. The returned task finishes when the port closes.
pub fn expose<P: Port, S: Service>(port: P, service: Arc<S>) -> JoinHandle<()> {
    let (sender, mut receiver) = port.split();
    let sender = Arc::new(sender);
    tokio::spawn(async move {
        while let Some(Envelope { data, resources }) = receiver.recv().await {
            let request: Request<Value> = match serde_json::from_value(data) {
                Ok(request) => request,
                Err(err) => {
                    log::warn!("dropping request without a valid id, {}", err);
                    continue;
                }
            };
            let service = service.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                let id = request.id;
                let mut resources = Resources::new(resources);
                let result = match S::Request::restore(request.payload, &mut resources) {
                    Ok(request) => match AssertUnwindSafe(service.handle(request)).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => {
                            log::error!("handler for request {} panicked", id);
                            Err(S::Error::from(IPCError::HandlerPanicked))
                        }
                    },
                    Err(err) => Err(S::Error::from(err)),
                };
                let mut out = Vec::new();
                let (data, error) = match result {
                    Ok(response) => (json!({ "id": id, "ok": response.extract(&mut out) }), None),
                    Err(err) => {
                        let body = serde_json::to_value(&err).unwrap_or(Value::Null);
                        (json!({ "id": id, "err": body }), Some(err))
                    }
                };
                log::trace!("< {:x?}", data);
                if let Err(err) = sender.send(Envelope {
                    data,
                    resources: out,
                }) {
                    log::debug!("response {} not delivered, {}", id, err);
                }
                if let Some(error) = error {
                    if service.is_fatal(&error) {
                        service.fault(&error).await;
                    }
                }
            });
        }
        log::trace!("service port closed");
    })
}
