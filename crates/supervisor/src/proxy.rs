//! The fronting reverse proxy: the single HTTP listener exposed by the
//! container, forwarding to whichever proc hosts at least one gateway.
//! Also answers on behalf of gateways synthesized because no proc in the
//! image actually hosts them ("noop gateways").
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use supervisor_config::{NoopGatewayDescription, Proc};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

type ClientBody = Full<Bytes>;

#[derive(Clone)]
pub struct ProxyState {
    /// Port of the first proc (in config/insertion order) that hosts at
    /// least one gateway, if any does.
    target_port: Option<u16>,
    noop_gateways: Arc<BTreeMap<String, NoopGatewayDescription>>,
    client: Client<HttpConnector, ClientBody>,
}

/// Finds the first proc, in `procs`' insertion order, that hosts at least
/// one gateway. Iteration order is deterministic by construction since
/// `procs` is a `Vec` preserving the config file's order.
pub fn first_gateway_host_port(procs: &[Proc], ports: &[u16]) -> Option<u16> {
    procs
        .iter()
        .zip(ports.iter())
        .find(|(proc, _)| !proc.gateways.is_empty())
        .map(|(_, port)| *port)
}

/// Runs the fronting proxy until `cancel` fires. If no proc hosts a
/// gateway, logs an error and returns without serving (the supervisor
/// keeps the procs themselves running regardless; see §4.4 "Fallback for
/// gateway absence").
pub async fn run(
    listen_addr: String,
    target_port: Option<u16>,
    noop_gateways: BTreeMap<String, NoopGatewayDescription>,
    mut cancel: tokio::sync::watch::Receiver<bool>,
) {
    if target_port.is_none() && noop_gateways.is_empty() {
        error!("no proc hosts a gateway and there are no noop gateways configured; fronting proxy will not serve");
        return;
    }

    let listener = match TcpListener::bind(listen_addr.as_str()).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr = %listen_addr, "fronting proxy failed to bind");
            return;
        }
    };
    info!(addr = %listen_addr, "fronting proxy listening");

    let state = ProxyState {
        target_port,
        noop_gateways: Arc::new(noop_gateways),
        client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
    };

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.changed() => {
                info!("fronting proxy shutting down");
                return;
            }
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            serve_connection(stream, peer, state).await;
        });
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, peer: SocketAddr, state: ProxyState) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { handle(req, state).await }
    });

    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
        warn!(error = %err, %peer, "connection error");
    }
}

async fn handle(
    req: Request<Incoming>,
    state: ProxyState,
) -> Result<Response<ClientBody>, Infallible> {
    let path = req.uri().path().to_string();
    if let Some(gateway) = find_noop_gateway(&state.noop_gateways, &path) {
        return Ok(noop_gateway_response(gateway));
    }

    let Some(port) = state.target_port else {
        return Ok(not_found());
    };

    match forward(req, port, &state.client).await {
        Ok(resp) => Ok(resp),
        Err(err) => {
            warn!(error = %err, "upstream request failed");
            Ok(bad_gateway())
        }
    }
}

fn find_noop_gateway<'a>(
    noop_gateways: &'a BTreeMap<String, NoopGatewayDescription>,
    path: &str,
) -> Option<&'a NoopGatewayDescription> {
    noop_gateways
        .values()
        .find(|gateway| gateway.routes.iter().any(|route| route == path))
}

fn noop_gateway_response(gateway: &NoopGatewayDescription) -> Response<ClientBody> {
    let body = serde_json::json!({
        "gateway": gateway.name,
        "routes": gateway.routes,
    });
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|_| not_found())
}

async fn forward(
    req: Request<Incoming>,
    port: u16,
    client: &Client<HttpConnector, ClientBody>,
) -> anyhow::Result<Response<ClientBody>> {
    let (mut parts, body) = req.into_parts();
    let collected = body.collect().await?.to_bytes();

    let uri = format!(
        "http://127.0.0.1:{port}{}",
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );
    parts.uri = uri.parse()?;

    let outbound = Request::from_parts(parts, Full::new(collected));
    let response = client.request(outbound).await?;
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await?.to_bytes();
    Ok(Response::from_parts(parts, Full::new(bytes)))
}

fn not_found() -> Response<ClientBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn bad_gateway() -> Response<ClientBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[cfg(test)]
mod test {
    use super::*;

    fn proc_with_gateways(id: &str, gateways: &[&str]) -> Proc {
        Proc {
            id: id.to_string(),
            command: vec!["/bin/true".to_string()],
            env: vec![],
            services: vec![],
            gateways: gateways.iter().map(|g| g.to_string()).collect(),
        }
    }

    #[test]
    fn first_gateway_host_wins_by_insertion_order() {
        let procs = vec![
            proc_with_gateways("a", &[]),
            proc_with_gateways("b", &["g1"]),
            proc_with_gateways("c", &["g1"]),
        ];
        let ports = vec![12000, 12001, 12002];
        assert_eq!(first_gateway_host_port(&procs, &ports), Some(12001));
    }

    #[test]
    fn no_gateway_host_returns_none() {
        let procs = vec![proc_with_gateways("a", &[])];
        let ports = vec![12000];
        assert_eq!(first_gateway_host_port(&procs, &ports), None);
    }
}
