//! Connection management for broker links
//!
//! [`Cluster`] resolves typed links to the controller and to brokers by node
//! id; [`NodeLink`] is the request/response round trip everything above it
//! uses. [`ClusterConnections`] implements both over TCP, with one
//! multiplexed connection per broker.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use kestrel::{
    peek_correlation_id, AddPartitionsToTxnRequest, AddPartitionsToTxnResponse, ApiRequest,
    ApiVersionTable, ApiVersionsRequest, EndTxnRequest, EndTxnResponse, ErrorCode,
    FindCoordinatorRequest, FindCoordinatorResponse, InitProducerIdRequest,
    InitProducerIdResponse, KafkaFrameCodec, MetadataRequest, MetadataResponse, ProduceRequest,
    ProduceResponse, RequestCodec, API_KEY_METADATA, API_KEY_PRODUCE,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WriteStreamConfig;
use crate::error::ClientError;
use crate::metrics::ClientMetrics;
use crate::protocol::NodeId;
use crate::Result;

/// Node id used for the bootstrap connection before the cluster is known.
pub const UNKNOWN_NODE: NodeId = -1;

/// A typed request/response link to one broker.
#[async_trait]
pub trait NodeLink: Send + Sync {
    fn node_id(&self) -> NodeId;

    async fn metadata(
        &self,
        request: MetadataRequest,
        cancel: &CancellationToken,
    ) -> Result<MetadataResponse>;

    async fn find_coordinator(
        &self,
        request: FindCoordinatorRequest,
        cancel: &CancellationToken,
    ) -> Result<FindCoordinatorResponse>;

    async fn init_producer_id(
        &self,
        request: InitProducerIdRequest,
        cancel: &CancellationToken,
    ) -> Result<InitProducerIdResponse>;

    async fn add_partitions_to_txn(
        &self,
        request: AddPartitionsToTxnRequest,
        cancel: &CancellationToken,
    ) -> Result<AddPartitionsToTxnResponse>;

    async fn end_txn(
        &self,
        request: EndTxnRequest,
        cancel: &CancellationToken,
    ) -> Result<EndTxnResponse>;

    /// Sends a produce request. With `acks=0` the broker does not answer and
    /// `None` is returned once the request is queued for the socket.
    async fn produce(
        &self,
        request: ProduceRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<ProduceResponse>>;
}

/// Directory of broker links.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn connection(
        &self,
        node_id: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn NodeLink>>;

    /// Link used for cluster-wide requests (metadata, coordinator lookup).
    async fn controller(&self, cancel: &CancellationToken) -> Result<Arc<dyn NodeLink>>;

    /// Releases every link. Called once when the write stream closes.
    async fn shutdown(&self) {}
}

type BrokerDirectory = Arc<RwLock<HashMap<NodeId, String>>>;

/// TCP implementation of [`Cluster`]
pub struct ClusterConnections {
    bootstrap_servers: Vec<String>,
    client_id: Option<String>,
    connection_timeout: Duration,
    request_timeout: Duration,
    brokers: BrokerDirectory,
    connections: DashMap<NodeId, Arc<BrokerConnection>>,
    controller: Mutex<Option<Arc<BrokerConnection>>>,
    connect_lock: Mutex<()>,
    metrics: Arc<ClientMetrics>,
}

impl ClusterConnections {
    pub fn new(config: &WriteStreamConfig, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            bootstrap_servers: config.bootstrap_servers.clone(),
            client_id: config.client_id.clone(),
            connection_timeout: config.connection_setup_timeout,
            request_timeout: config.request_timeout,
            brokers: Arc::new(RwLock::new(HashMap::new())),
            connections: DashMap::new(),
            controller: Mutex::new(None),
            connect_lock: Mutex::new(()),
            metrics,
        }
    }

    /// Address last advertised for `node_id`
    pub fn broker_address(&self, node_id: NodeId) -> Option<String> {
        self.brokers.read().get(&node_id).cloned()
    }

    /// Update broker list
    pub fn update_brokers<I>(&self, brokers: I)
    where
        I: IntoIterator<Item = (NodeId, String)>,
    {
        self.brokers.write().extend(brokers);
    }

    /// Close all connections
    pub async fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
        if let Some(controller) = self.controller.lock().await.take() {
            controller.close();
        }
    }

    async fn connect(&self, node_id: NodeId, address: &str) -> Result<Arc<BrokerConnection>> {
        match BrokerConnection::connect(
            node_id,
            address.to_string(),
            self.client_id.clone(),
            self.connection_timeout,
            self.request_timeout,
            self.brokers.clone(),
        )
        .await
        {
            Ok(connection) => {
                self.metrics.record_connection_created();
                info!("Connected to broker {} at {}", node_id, address);
                Ok(Arc::new(connection))
            }
            Err(e) => {
                self.metrics.record_connection_failed();
                warn!("Failed to connect to broker {} at {}: {}", node_id, address, e);
                Err(e)
            }
        }
    }

    async fn bootstrap(&self) -> Result<Arc<BrokerConnection>> {
        let mut last_error = None;
        for server in &self.bootstrap_servers {
            match self.connect(UNKNOWN_NODE, server).await {
                Ok(connection) => return Ok(connection),
                Err(e @ ClientError::Config { .. }) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| ClientError::config("No bootstrap servers configured")))
    }

    /// Learns broker addresses through a metadata request that names no topics.
    async fn refresh_brokers(&self, cancel: &CancellationToken) -> Result<()> {
        let controller = self.controller(cancel).await?;
        let request = MetadataRequest {
            topics: Some(Vec::new()),
            allow_auto_topic_creation: false,
            ..Default::default()
        };
        controller.metadata(request, cancel).await?;
        Ok(())
    }
}

#[async_trait]
impl Cluster for ClusterConnections {
    async fn connection(
        &self,
        node_id: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn NodeLink>> {
        if let Some(connection) = self.connections.get(&node_id) {
            if connection.is_healthy() {
                return Ok(connection.clone());
            }
        }

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            guard = self.connect_lock.lock() => guard,
        };
        if let Some(connection) = self.connections.get(&node_id) {
            if connection.is_healthy() {
                return Ok(connection.clone());
            }
        }
        self.connections.remove(&node_id);

        if self.broker_address(node_id).is_none() {
            self.refresh_brokers(cancel).await?;
        }
        let address = self
            .broker_address(node_id)
            .ok_or_else(|| ClientError::transport(format!("Unknown broker node {}", node_id)))?;

        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            result = self.connect(node_id, &address) => result?,
        };
        self.connections.insert(node_id, connection.clone());
        Ok(connection)
    }

    async fn controller(&self, cancel: &CancellationToken) -> Result<Arc<dyn NodeLink>> {
        let mut controller = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            guard = self.controller.lock() => guard,
        };
        if let Some(connection) = controller.as_ref() {
            if connection.is_healthy() {
                return Ok(connection.clone());
            }
            debug!("Controller connection lost, reconnecting");
        }

        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            result = self.bootstrap() => result?,
        };
        *controller = Some(connection.clone());
        Ok(connection)
    }

    async fn shutdown(&self) {
        self.close_all().await;
    }
}

struct Outbound {
    correlation_id: i32,
    frame: Bytes,
    response_tx: Option<oneshot::Sender<Result<Bytes>>>,
}

/// Individual connection to a broker
pub struct BrokerConnection {
    node_id: NodeId,
    address: String,
    client_id: Option<String>,
    versions: ApiVersionTable,
    correlation_counter: AtomicI32,
    request_timeout: Duration,
    request_tx: mpsc::UnboundedSender<Outbound>,
    brokers: BrokerDirectory,
    shutdown: CancellationToken,
    _handle: tokio::task::JoinHandle<()>,
}

impl BrokerConnection {
    async fn connect(
        node_id: NodeId,
        address: String,
        client_id: Option<String>,
        connection_timeout: Duration,
        request_timeout: Duration,
        brokers: BrokerDirectory,
    ) -> Result<Self> {
        debug!("Creating connection to broker: {}", address);

        let stream = timeout(connection_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ClientError::timeout(connection_timeout.as_millis() as u64))?
            .map_err(|e| {
                ClientError::transport(format!("Failed to connect to {}: {}", address, e))
            })?;
        stream.set_nodelay(true)?;

        let mut framed = Framed::new(stream, KafkaFrameCodec);
        let versions = timeout(
            request_timeout,
            negotiate_versions(&mut framed, client_id.as_deref()),
        )
        .await
        .map_err(|_| ClientError::timeout(request_timeout.as_millis() as u64))??;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(connection_loop(
            address.clone(),
            framed,
            request_rx,
            shutdown.clone(),
        ));

        Ok(Self {
            node_id,
            address,
            client_id,
            versions,
            // 0 went to the ApiVersions exchange
            correlation_counter: AtomicI32::new(1),
            request_timeout,
            request_tx,
            brokers,
            shutdown,
            _handle: handle,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn versions(&self) -> &ApiVersionTable {
        &self.versions
    }

    pub fn is_healthy(&self) -> bool {
        !self.request_tx.is_closed() && !self.shutdown.is_cancelled()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    fn encode<R: ApiRequest>(&self, request: &R) -> Result<(i32, RequestCodec<R>, Bytes)> {
        let version = self.versions.version_for::<R>().map_err(|_| {
            ClientError::config(format!(
                "Broker {} shares no version of {} with this client",
                self.address,
                R::NAME
            ))
        })?;
        let codec = RequestCodec::<R>::new(version)?;
        let correlation_id = self.correlation_counter.fetch_add(1, Ordering::Relaxed);
        let mut buf = BytesMut::new();
        codec.encode_request(correlation_id, self.client_id.as_deref(), request, &mut buf)?;
        Ok((correlation_id, codec, buf.freeze()))
    }

    fn closed_error(&self) -> ClientError {
        ClientError::transport(format!("Connection to {} closed", self.address))
    }

    async fn round_trip<R: ApiRequest>(
        &self,
        request: &R,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        let (correlation_id, codec, frame) = self.encode(request)?;
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(Outbound {
                correlation_id,
                frame,
                response_tx: Some(response_tx),
            })
            .map_err(|_| self.closed_error())?;

        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            response = timeout(self.request_timeout, response_rx) => match response {
                Err(_) => return Err(ClientError::timeout(self.request_timeout.as_millis() as u64)),
                Ok(Err(_)) => return Err(self.closed_error()),
                Ok(Ok(frame)) => frame?,
            },
        };

        match codec.decode_response(&frame) {
            Ok((_, response)) => Ok(response),
            Err(e) => {
                error!(
                    "Undecodable {} response from {}, closing connection: {}",
                    R::NAME,
                    self.address,
                    e
                );
                self.close();
                Err(e.into())
            }
        }
    }

    /// Queues a request that gets no response.
    fn send_only<R: ApiRequest>(&self, request: &R) -> Result<()> {
        let (correlation_id, _, frame) = self.encode(request)?;
        self.request_tx
            .send(Outbound {
                correlation_id,
                frame,
                response_tx: None,
            })
            .map_err(|_| self.closed_error())
    }
}

#[async_trait]
impl NodeLink for BrokerConnection {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn metadata(
        &self,
        request: MetadataRequest,
        cancel: &CancellationToken,
    ) -> Result<MetadataResponse> {
        let response = self.round_trip(&request, cancel).await?;
        self.brokers.write().extend(
            response
                .brokers
                .iter()
                .map(|b| (b.node_id, format!("{}:{}", b.host, b.port))),
        );
        Ok(response)
    }

    async fn find_coordinator(
        &self,
        request: FindCoordinatorRequest,
        cancel: &CancellationToken,
    ) -> Result<FindCoordinatorResponse> {
        let response = self.round_trip(&request, cancel).await?;
        let mut brokers = self.brokers.write();
        if response.coordinators.is_empty() {
            if response.error_code == 0 {
                brokers.insert(
                    response.node_id,
                    format!("{}:{}", response.host, response.port),
                );
            }
        } else {
            for coordinator in response.coordinators.iter().filter(|c| c.error_code == 0) {
                brokers.insert(
                    coordinator.node_id,
                    format!("{}:{}", coordinator.host, coordinator.port),
                );
            }
        }
        drop(brokers);
        Ok(response)
    }

    async fn init_producer_id(
        &self,
        request: InitProducerIdRequest,
        cancel: &CancellationToken,
    ) -> Result<InitProducerIdResponse> {
        self.round_trip(&request, cancel).await
    }

    async fn add_partitions_to_txn(
        &self,
        request: AddPartitionsToTxnRequest,
        cancel: &CancellationToken,
    ) -> Result<AddPartitionsToTxnResponse> {
        self.round_trip(&request, cancel).await
    }

    async fn end_txn(
        &self,
        request: EndTxnRequest,
        cancel: &CancellationToken,
    ) -> Result<EndTxnResponse> {
        self.round_trip(&request, cancel).await
    }

    async fn produce(
        &self,
        request: ProduceRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<ProduceResponse>> {
        if request.acks == 0 {
            self.send_only(&request)?;
            return Ok(None);
        }
        self.round_trip(&request, cancel).await.map(Some)
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Runs the ApiVersions exchange on a fresh connection: v3 first, v0 when
/// the broker rejects or garbles the flexible form.
async fn negotiate_versions(
    framed: &mut Framed<TcpStream, KafkaFrameCodec>,
    client_id: Option<&str>,
) -> Result<ApiVersionTable> {
    for version in [3, 0] {
        let codec = RequestCodec::<ApiVersionsRequest>::new(version)?;
        let mut buf = BytesMut::new();
        codec.encode_request(0, client_id, &ApiVersionsRequest::default(), &mut buf)?;
        framed.send(buf.freeze()).await?;

        let frame = framed
            .next()
            .await
            .ok_or_else(|| ClientError::transport("Connection closed during ApiVersions"))??;

        let response = match codec.decode_response(&frame) {
            Ok((_, response)) => response,
            Err(e) if version > 0 => {
                debug!("ApiVersions v{} response undecodable ({}), retrying with v0", version, e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if response.error_code == ErrorCode::UnsupportedVersion.as_i16() && version > 0 {
            debug!("Broker rejected ApiVersions v{}, retrying with v0", version);
            continue;
        }
        if let Some(err) = ClientError::from_code(response.error_code) {
            return Err(err);
        }

        let table = ApiVersionTable::negotiate(&response);
        table
            .require(&[API_KEY_METADATA, API_KEY_PRODUCE])
            .map_err(|e| ClientError::config(format!("Broker is too old for this client: {}", e)))?;
        return Ok(table);
    }
    Err(ClientError::transport("ApiVersions negotiation failed"))
}

async fn connection_loop(
    address: String,
    mut framed: Framed<TcpStream, KafkaFrameCodec>,
    mut request_rx: mpsc::UnboundedReceiver<Outbound>,
    shutdown: CancellationToken,
) {
    let mut pending: HashMap<i32, oneshot::Sender<Result<Bytes>>> = HashMap::new();

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break ClientError::transport(format!("Connection to {} closed", address));
            }

            request = request_rx.recv() => {
                let Some(outbound) = request else {
                    break ClientError::transport(format!("Connection to {} closed", address));
                };
                if let Err(e) = framed.send(outbound.frame).await {
                    error!("Failed to send request to {}: {}", address, e);
                    let err = ClientError::from(e);
                    if let Some(tx) = outbound.response_tx {
                        let _ = tx.send(Err(err.clone()));
                    }
                    break err;
                }
                if let Some(tx) = outbound.response_tx {
                    pending.insert(outbound.correlation_id, tx);
                }
            }

            response = framed.next() => {
                match response {
                    Some(Ok(frame)) => match peek_correlation_id(&frame) {
                        Ok(correlation_id) => match pending.remove(&correlation_id) {
                            Some(tx) => {
                                let _ = tx.send(Ok(frame));
                            }
                            None => warn!(
                                "Received response with unknown correlation id {} from {}",
                                correlation_id, address
                            ),
                        },
                        Err(e) => break ClientError::from(e),
                    },
                    Some(Err(e)) => {
                        error!("Error receiving response from {}: {}", address, e);
                        break ClientError::from(e);
                    }
                    None => {
                        break ClientError::transport(format!("Connection to {} closed by peer", address));
                    }
                }
            }
        }
    };

    request_rx.close();
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(reason.clone()));
    }
    info!("Connection to {} closed", address);
}
