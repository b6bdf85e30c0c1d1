//! Plain-HTTP fetch of queued media into memory.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaFetchError {
    #[error("media fetch returned {0}")]
    Status(u16),
    #[error("media fetch failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub async fn fetch(http: &reqwest::Client, url: &str) -> Result<Vec<u8>, MediaFetchError> {
    let response = http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(MediaFetchError::Status(status.as_u16()));
    }
    Ok(response.bytes().await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/m/1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;

        let bytes = fetch(&reqwest::Client::new(), &format!("{}/m/1", server.uri()))
            .await
            .unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn non_success_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/m/404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetch(&reqwest::Client::new(), &format!("{}/m/404", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaFetchError::Status(404)));
    }
}
