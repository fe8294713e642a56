use std::time::Instant;
use surf::middleware::{Middleware, Next};
use surf::{Client, Request, Response};

/// Surf middleware that logs every request with its status and latency.
pub struct SurfLogging;

#[surf::utils::async_trait]
impl Middleware for SurfLogging {
    async fn handle(
        &self,
        req: Request,
        client: Client,
        next: Next<'_>,
    ) -> surf::Result<Response> {
        let method = req.method();
        let url = req.url().clone();
        log::debug!("Sending request: {} {}", method, url);

        let start = Instant::now();
        let res = next.run(req, client).await?;
        let elapsed = start.elapsed();

        log::debug!(
            "Received response: {} {} -> {} ({}ms)",
            method,
            url,
            res.status(),
            elapsed.as_millis()
        );
        Ok(res)
    }
}
