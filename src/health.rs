//! Container liveness endpoint.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use log::info;
use tokio::net::TcpListener;
use tokio::sync::Notify;

pub fn router() -> Router {
    // Anything but /health falls through to axum's default 404.
    Router::new().route("/health", get(|| async { "ok" }))
}

pub async fn serve(listener: TcpListener, shutdown: Arc<Notify>) -> std::io::Result<()> {
    info!(target: "Health", "listening on {}", listener.local_addr()?);
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_is_ok_everything_else_404() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let server = tokio::spawn(serve(listener, shutdown.clone()));

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "ok");

        let response = client
            .get(format!("http://{addr}/anything"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);

        shutdown.notify_waiters();
        server.await.unwrap().unwrap();
    }
}
