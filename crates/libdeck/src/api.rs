use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{StatusCode, Url};
use tracing::debug;

use deck_protocol::ExecutionRecord;

use crate::config::join_path;
use crate::error::{DeckError, DeckResult};

/// REST endpoints of the management backend that the core depends on.
pub trait ConsoleApi: Send + Sync + 'static {
    /// Ask the process host to terminate a server session.
    fn close_session(&self, session_id: &str) -> BoxFuture<'static, DeckResult<()>>;

    /// Current state of the execution behind `correlation_key`; `None` when
    /// the backend no longer knows it.
    fn fetch_execution(
        &self,
        correlation_key: &str,
    ) -> BoxFuture<'static, DeckResult<Option<ExecutionRecord>>>;
}

#[derive(Clone)]
pub struct HttpConsoleApi {
    client: reqwest::Client,
    base: Url,
}

impl HttpConsoleApi {
    pub fn new(base: Url) -> DeckResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("deck/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, base })
    }

    fn close_url(&self, session_id: &str) -> DeckResult<Url> {
        join_path(
            &self.base,
            &["api", "terminal", "sessions", session_id, "close"],
        )
    }

    fn lookup_url(&self, correlation_key: &str) -> DeckResult<Url> {
        join_path(
            &self.base,
            &["api", "executions", "by-correlation", correlation_key],
        )
    }
}

impl ConsoleApi for HttpConsoleApi {
    fn close_session(&self, session_id: &str) -> BoxFuture<'static, DeckResult<()>> {
        let client = self.client.clone();
        let url = self.close_url(session_id);
        async move {
            let url = url?;
            debug!(url = %url, "closing remote session");
            let resp = client.post(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(DeckError::Api(format!("close session returned {status}")));
            }
            Ok(())
        }
        .boxed()
    }

    fn fetch_execution(
        &self,
        correlation_key: &str,
    ) -> BoxFuture<'static, DeckResult<Option<ExecutionRecord>>> {
        let client = self.client.clone();
        let url = self.lookup_url(correlation_key);
        async move {
            let url = url?;
            let resp = client.get(url).send().await?;
            match resp.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => Ok(Some(resp.json().await?)),
                status => Err(DeckError::Api(format!("execution lookup returned {status}"))),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls() {
        let api = HttpConsoleApi::new(Url::parse("https://console.example.com/").unwrap()).unwrap();
        assert_eq!(
            api.close_url("s 1").unwrap().as_str(),
            "https://console.example.com/api/terminal/sessions/s%201/close"
        );
        assert_eq!(
            api.lookup_url("run/7").unwrap().as_str(),
            "https://console.example.com/api/executions/by-correlation/run%2F7"
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_transient() {
        let api = HttpConsoleApi::new(Url::parse("http://127.0.0.1:1/").unwrap()).unwrap();
        let err = api.close_session("s1").await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
