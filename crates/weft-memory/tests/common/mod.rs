#![allow(dead_code)]

use std::time::Duration;

use weft_memory::memory_transport_pair;
use weft_session::{Endpoint, EndpointConfig};

/// Connected client/server endpoints with their engines spawned.
pub fn endpoint_pair() -> (Endpoint, Endpoint) {
    endpoint_pair_with(EndpointConfig::default(), EndpointConfig::default())
}

pub fn endpoint_pair_with(
    client_config: EndpointConfig,
    server_config: EndpointConfig,
) -> (Endpoint, Endpoint) {
    let (client_io, server_io) = memory_transport_pair(64);
    let (client, client_engine) = Endpoint::client(client_io, client_config);
    let (server, server_engine) = Endpoint::server(server_io, server_config);
    tokio::spawn(async move {
        let _ = client_engine.run().await;
    });
    tokio::spawn(async move {
        let _ = server_engine.run().await;
    });
    (client, server)
}

/// Give spawned tasks a beat to drain queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
