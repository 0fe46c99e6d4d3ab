//! Wires Ctrl-C to graceful shutdown: the accept loop stops, idle
//! keep-alive connections are interrupted, and in-flight requests get
//! `shutdown_timeout` to finish before the process exits.

use pier_http::{
    Handler, HandlerError, ListenerConfig, Request, Response, Server, ServerConfig,
};
use std::time::Duration;

struct Slowish;

impl Handler for Slowish {
    async fn handle(
        &self,
        _req: &mut Request<'_>,
        resp: &mut Response<'_>,
    ) -> Result<(), HandlerError> {
        // Pretend to do real work so shutdown has something to drain.
        tokio::time::sleep(Duration::from_millis(250)).await;
        resp.status(200).write(b"done\n").await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let server = Server::builder()
        .listener(ListenerConfig::new("127.0.0.1".parse().unwrap(), 8080))
        .handler(Slowish)
        .config(ServerConfig {
            shutdown_timeout: Duration::from_secs(5),
            ..ServerConfig::default()
        })
        .build();

    let handle = server.handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.expect("install Ctrl-C handler");
        eprintln!("shutting down...");
        handle.shutdown();
    });

    server.launch().await.unwrap();
    eprintln!("drained, bye");
}
