//! An `Expect: 100-continue` gate: clients announcing large uploads are
//! told up front whether to bother sending the body.
//!
//! ```text
//! curl -H 'Expect: 100-continue' --data-binary @small.bin http://127.0.0.1:8080/up
//! curl -H 'Expect: 100-continue' --data-binary @huge.bin  http://127.0.0.1:8080/up
//! ```

use pier_http::{
    ExpectValidator, Handler, HandlerError, ListenerConfig, Request, Response, Server,
};

const UPLOAD_CAP: i64 = 1024 * 1024;

struct CapCheck;

impl ExpectValidator for CapCheck {
    fn validate(&self, req: &Request<'_>) -> u16 {
        match req.content_length() {
            Some(len) if len > UPLOAD_CAP => 417,
            _ => 100,
        }
    }
}

struct CountBytes;

impl Handler for CountBytes {
    async fn handle(
        &self,
        req: &mut Request<'_>,
        resp: &mut Response<'_>,
    ) -> Result<(), HandlerError> {
        let mut buf = [0u8; 8192];
        let mut total: u64 = 0;
        loop {
            let n = req.body().read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
        }
        resp.status(200)
            .write(format!("received {total} bytes\n").as_bytes())
            .await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    Server::builder()
        .listener(ListenerConfig::new("127.0.0.1".parse().unwrap(), 8080))
        .handler(CountBytes)
        .expect_validator(CapCheck)
        .build()
        .launch()
        .await
        .unwrap();
}
