//! Counts visits per browser with a cookie — shows request cookie parsing
//! and `Set-Cookie` serialization.

use pier_http::{
    Handler, HandlerError, ListenerConfig, Request, Response, SameSite, Server, SetCookie,
};

struct VisitCounter;

impl Handler for VisitCounter {
    async fn handle(
        &self,
        req: &mut Request<'_>,
        resp: &mut Response<'_>,
    ) -> Result<(), HandlerError> {
        let visits = req
            .cookie("visits")
            .and_then(|c| c.value.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;

        resp.status(200)
            .header("content-type", "text/plain")
            .cookie(
                SetCookie::new("visits", visits.to_string())
                    .path("/")
                    .http_only(true)
                    .same_site(SameSite::Lax),
            )
            .write(format!("visit number {visits}\n").as_bytes())
            .await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    Server::builder()
        .listener(ListenerConfig::new("127.0.0.1".parse().unwrap(), 8080))
        .handler(VisitCounter)
        .build()
        .launch()
        .await
        .unwrap();
}
