//! Streams the request body straight back, whatever its framing.
//!
//! The handler never learns whether the client used `Content-Length` or
//! chunked transfer encoding — the body stream hides the difference — and
//! the response picks its own framing: small echoes go out with a computed
//! length, large ones switch to chunked.
//!
//! ```text
//! curl --data-binary @bigfile http://127.0.0.1:8080/echo
//! curl -H 'Transfer-Encoding: chunked' --data-binary hello http://127.0.0.1:8080/echo
//! ```

use pier_http::{Handler, HandlerError, ListenerConfig, Request, Response, Server};

struct Echo;

impl Handler for Echo {
    async fn handle(
        &self,
        req: &mut Request<'_>,
        resp: &mut Response<'_>,
    ) -> Result<(), HandlerError> {
        if let Some(content_type) = req.header("content-type") {
            let content_type = content_type.to_string();
            resp.header("content-type", content_type);
        }

        let mut buf = [0u8; 8192];
        loop {
            let n = req.body().read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            resp.write(&buf[..n]).await?;
        }
    }
}

#[tokio::main]
async fn main() {
    Server::builder()
        .listener(ListenerConfig::new("127.0.0.1".parse().unwrap(), 8080))
        .handler(Echo)
        .build()
        .launch()
        .await
        .unwrap();
}
