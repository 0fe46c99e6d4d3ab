//! The smallest possible server: every request gets a text greeting.
//!
//! Run with `cargo run --example hello_world`, then:
//! ```text
//! curl -v http://127.0.0.1:8080/
//! ```

use pier_http::{Handler, HandlerError, ListenerConfig, Request, Response, Server};

struct Hello;

impl Handler for Hello {
    async fn handle(
        &self,
        req: &mut Request<'_>,
        resp: &mut Response<'_>,
    ) -> Result<(), HandlerError> {
        let body = format!("Hello from {} {}!\n", req.method(), req.path());
        resp.status(200)
            .header("content-type", "text/plain")
            .write(body.as_bytes())
            .await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    Server::builder()
        .listener(ListenerConfig::new("127.0.0.1".parse().unwrap(), 8080))
        .handler(Hello)
        .build()
        .launch()
        .await
        .unwrap();
}
