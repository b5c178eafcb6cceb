//! Relay daemon: named instrument sessions behind one gRPC endpoint

use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use log::{debug, error, info};
use prost::Message;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status, transport::Server};

use super::{
    messages::{
        CloseRequest, CloseResponse, Empty, InstRequest, InstResponse, RecvDataRequest,
        RecvDataResponse, RecvRequest, RecvResponse, SendDataRequest, SendRequest,
        StringDatagram as WireDatagram, SystemRequest, SystemResponse,
        basic_system_server::{BasicSystem, BasicSystemServer},
        instrument_server::{Instrument, InstrumentServer},
    },
    system::SystemState,
};
use crate::{
    config::{ConnectConfig, PreloadSession},
    connection::{Connection, DeviceClass, InitSequence, StringDatagram},
    error::{Error, Result},
    registry::{RegisterPolicy, Session, SessionRegistry},
    scan::{LocalScanner, Scanner},
};

/// Builds the (closed) connection for an `Init` request
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectConfig) -> Result<Connection>;
}

/// Connects through the backend the config resolves to
pub struct DirectConnector;
#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self, config: &ConnectConfig) -> Result<Connection> {
        Connection::from_config(config)
    }
}

pub struct Relay {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn Connector>,
    scanner: Arc<dyn Scanner>,
    system: SystemState,
    /// Names with an `Init` in progress
    initializing: Mutex<HashSet<String>>,
}
impl Relay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            connector: Arc::new(DirectConnector),
            scanner: Arc::new(LocalScanner::default()),
            system: SystemState::new(),
            initializing: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register the sessions listed in the relay settings. A session that
    /// cannot be opened is skipped with an error log.
    pub async fn preload(&self, sessions: &[PreloadSession]) {
        for preload in sessions {
            let res = self
                .open_session(
                    &preload.name,
                    &preload.connect,
                    &preload.init,
                    preload.device_class,
                    RegisterPolicy::Reject,
                )
                .await;
            if let Err(e) = res {
                error!("Could not preload session {}: {e}", preload.name);
            }
        }
    }

    /// Hold `name` until the returned claim is dropped
    fn claim(&self, name: &str) -> Result<InitClaim<'_>> {
        let mut pending = self
            .initializing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !pending.insert(name.to_string()) {
            return Err(Error::DuplicateName(name.to_string()));
        }

        Ok(InitClaim {
            pending: &self.initializing,
            name: name.to_string(),
        })
    }

    async fn open_session(
        &self,
        name: &str,
        config: &ConnectConfig,
        init: &InitSequence,
        class: DeviceClass,
        policy: RegisterPolicy,
    ) -> Result<Arc<Session>> {
        if name.is_empty() {
            return Err(Error::Config("Session name is required".into()));
        }

        /* A concurrent Init of the same name fails here, before it opens
         * anything */
        let _claim = self.claim(name)?;
        match policy {
            RegisterPolicy::Reject => {
                if self.registry.lookup(name).await.is_ok() {
                    return Err(Error::DuplicateName(name.to_string()));
                }
            }
            /* The old session may hold the port we are about to open */
            RegisterPolicy::Replace => {
                self.registry.unregister(name).await;
            }
        }

        let mut conn = self.connector.connect(config).await?;
        conn.open().await?;
        let idn = match conn.initialize(init, class).await {
            Ok(idn) => idn,
            Err(e) => {
                if let Err(close_err) = conn.close().await {
                    error!("Error closing {name} after failed init: {close_err}");
                }
                return Err(e);
            }
        };

        let session = Session::new(name, config.clone(), conn, idn);
        self.registry.register(session, policy).await
    }

    async fn init_session(&self, req: InstRequest) -> Result<InstResponse> {
        let config = req.connect_config()?;
        let policy = if req.force {
            RegisterPolicy::Replace
        } else {
            RegisterPolicy::Reject
        };

        let session = self
            .open_session(&req.name, &config, &req.init_sequence(), req.class(), policy)
            .await?;

        Ok(InstResponse {
            result: true,
            name: req.name,
            idn: session.idn().unwrap_or_default().to_string(),
        })
    }

    /// Serve both relay services on `listener` until `shutdown` resolves.
    /// Client connections are drained before every session is closed.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        info!("Relay listening on {}", listener.local_addr()?);

        Server::builder()
            .add_service(InstrumentServer::from_arc(self.clone()))
            .add_service(BasicSystemServer::from_arc(self.clone()))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;

        info!("Relay shutting down");
        self.registry.close_all().await;
        Ok(())
    }
}

/// Releases an `Init` claim, also when the request is cancelled
struct InitClaim<'a> {
    pending: &'a Mutex<HashSet<String>>,
    name: String,
}
impl Drop for InitClaim<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

#[tonic::async_trait]
impl Instrument for Relay {
    async fn init(&self, request: Request<InstRequest>) -> Result<Response<InstResponse>, Status> {
        let req = request.into_inner();
        let name = req.name.clone();
        debug!("Init {name}");

        match self.init_session(req).await {
            Ok(resp) => Ok(Response::new(resp)),
            Err(e) => {
                error!("Init of {name} failed: {e}");
                let refused = InstResponse {
                    result: false,
                    name,
                    idn: String::new(),
                };
                Err(Status::with_details(
                    e.code(),
                    e.to_string(),
                    refused.encode_to_vec().into(),
                ))
            }
        }
    }

    async fn close(
        &self,
        request: Request<CloseRequest>,
    ) -> Result<Response<CloseResponse>, Status> {
        self.registry.unregister(&request.into_inner().name).await;
        Ok(Response::new(CloseResponse { status: true }))
    }

    async fn send(&self, request: Request<SendRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let res = async {
            let session = self.registry.lookup(&req.name).await?;
            session.lock().await.send(&req.send).await?;
            Ok::<_, Error>(Empty {})
        };
        reply("Send", &req.name, res.await)
    }

    async fn recv(&self, request: Request<RecvRequest>) -> Result<Response<RecvResponse>, Status> {
        let req = request.into_inner();
        let res = async {
            let session = self.registry.lookup(&req.name).await?;
            let read = session.lock().await.recv().await?;
            Ok::<_, Error>(RecvResponse { read })
        };
        reply("Recv", &req.name, res.await)
    }

    async fn query(&self, request: Request<SendRequest>) -> Result<Response<RecvResponse>, Status> {
        let req = request.into_inner();
        let res = async {
            let session = self.registry.lookup(&req.name).await?;
            let read = session.lock().await.query(&req.send).await?;
            Ok::<_, Error>(RecvResponse { read })
        };
        reply("Query", &req.name, res.await)
    }

    async fn send_data(
        &self,
        request: Request<SendDataRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let res = async {
            let session = self.registry.lookup(&req.name).await?;
            let dg = required_datagram(req.string_datagram.as_ref())?;
            session.lock().await.send_data(&dg).await?;
            Ok::<_, Error>(Empty {})
        };
        reply("SendData", &req.name, res.await)
    }

    async fn recv_data(
        &self,
        request: Request<RecvDataRequest>,
    ) -> Result<Response<RecvDataResponse>, Status> {
        let req = request.into_inner();
        let res = async {
            let session = self.registry.lookup(&req.name).await?;
            let dg = req
                .string_datagram
                .clone()
                .map(StringDatagram::from)
                .unwrap_or_default();
            let read = session.lock().await.recv_data(&dg).await?;
            Ok::<_, Error>(received(&read))
        };
        reply("RecvData", &req.name, res.await)
    }

    async fn query_data(
        &self,
        request: Request<SendDataRequest>,
    ) -> Result<Response<RecvDataResponse>, Status> {
        let req = request.into_inner();
        let res = async {
            let session = self.registry.lookup(&req.name).await?;
            let dg = required_datagram(req.string_datagram.as_ref())?;
            let read = session.lock().await.query_data(&dg).await?;
            Ok::<_, Error>(received(&read))
        };
        reply("QueryData", &req.name, res.await)
    }
}

#[tonic::async_trait]
impl BasicSystem for Relay {
    async fn basic_system(
        &self,
        request: Request<SystemRequest>,
    ) -> Result<Response<SystemResponse>, Status> {
        let action = request.into_inner().action;
        Ok(Response::new(
            self.system.handle(action, self.scanner.as_ref()).await,
        ))
    }
}

fn reply<T>(op: &str, name: &str, res: Result<T>) -> Result<Response<T>, Status> {
    res.map(Response::new).map_err(|e| {
        error!("{op} on {name} failed: {e}");
        e.into()
    })
}

fn required_datagram(dg: Option<&WireDatagram>) -> Result<StringDatagram> {
    dg.cloned()
        .map(StringDatagram::from)
        .ok_or_else(|| Error::Config("Request carries no string datagram".into()))
}

fn received(dg: &StringDatagram) -> RecvDataResponse {
    RecvDataResponse {
        string_datagram: Some(dg.into()),
    }
}
