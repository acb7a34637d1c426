use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Pending HTTP-01 key authorizations by token.
#[derive(Debug, Default)]
pub struct ChallengeStore {
    tokens: DashMap<String, String>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: String, key_authorization: String) {
        self.tokens.insert(token, key_authorization);
    }

    pub fn remove(&self, token: &str) {
        self.tokens.remove(token);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|entry| entry.value().clone())
    }
}

async fn acme_challenge(
    State(store): State<Arc<ChallengeStore>>,
    Path(token): Path<String>,
) -> Result<String, StatusCode> {
    store.get(&token).ok_or(StatusCode::NOT_FOUND)
}

/// Answers the ownership probe run before issuance.
async fn pre_authorize() -> &'static str {
    "ok"
}

pub fn challenge_router(store: Arc<ChallengeStore>) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(acme_challenge))
        .route("/.well-known/pre-authorize/", get(pre_authorize))
        .with_state(store)
}

/// Serves challenge responses until `shutdown` fires.
pub async fn serve_challenges(
    addr: SocketAddr,
    store: Arc<ChallengeStore>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    log::info!("Starting ACME challenge server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, challenge_router(store))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn(store: Arc<ChallengeStore>) -> (String, CancellationToken) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, challenge_router(store))
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
        });
        (format!("http://{addr}"), shutdown)
    }

    #[tokio::test]
    async fn test_serves_known_tokens_only() {
        let store = Arc::new(ChallengeStore::new());
        store.insert("abc".into(), "abc.thumbprint".into());
        let (base, shutdown) = spawn(store.clone()).await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("{base}/.well-known/acme-challenge/abc"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "abc.thumbprint");

        store.remove("abc");
        let response = client
            .get(format!("{base}/.well-known/acme-challenge/abc"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let response = client
            .get(format!("{base}/.well-known/pre-authorize/"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        shutdown.cancel();
    }
}
