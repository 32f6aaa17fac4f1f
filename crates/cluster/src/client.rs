//! HTTP client for a member's key/value API.

use crate::api::{
    DeleteRequest, DeleteResponse, ErrorBody, PutRequest, PutResponse, RangeRequest,
    RangeResponse, WatchMessage, WatchRequest,
};
use crate::error::{Error, Result};
use crate::types::{KeyValue, WatchEvent};

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use url::Url;

/// Client bound to one member's client-listen URL.
///
/// Every operation is linearizable for a single key. Failures caused by a
/// missing leader or lost quorum surface as [`Error::Unavailable`] and are not
/// retried.
#[derive(Clone, Debug)]
pub struct ClusterClient {
    base: Url,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl ClusterClient {
    /// Creates a client for the member serving `base`.
    pub fn new(base: Url, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;

        Ok(Self {
            base,
            http,
            request_timeout,
        })
    }

    /// The member endpoint this client talks to.
    pub const fn endpoint(&self) -> &Url {
        &self.base
    }

    /// Sets `key` to `value`, returning the revision of the write.
    pub async fn put(&self, key: impl Into<String>, value: impl Into<Bytes>) -> Result<u64> {
        let response: PutResponse = self
            .post(
                "v1/kv/put",
                &PutRequest {
                    key: key.into(),
                    value: value.into(),
                },
            )
            .await?;

        Ok(response.revision)
    }

    /// Reads `key`. `None` means the key does not exist.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<KeyValue>> {
        let response: RangeResponse = self
            .post(
                "v1/kv/range",
                &RangeRequest {
                    key: key.into(),
                    prefix: false,
                },
            )
            .await?;

        Ok(response.kvs.into_iter().next())
    }

    /// Reads every key starting with `prefix`, in key order.
    pub async fn range(&self, prefix: impl Into<String>) -> Result<Vec<KeyValue>> {
        let response: RangeResponse = self
            .post(
                "v1/kv/range",
                &RangeRequest {
                    key: prefix.into(),
                    prefix: true,
                },
            )
            .await?;

        Ok(response.kvs)
    }

    /// Removes `key`, returning how many keys were removed (0 or 1).
    pub async fn delete(&self, key: impl Into<String>) -> Result<u64> {
        let response: DeleteResponse = self
            .post("v1/kv/delete", &DeleteRequest { key: key.into() })
            .await?;

        Ok(response.deleted)
    }

    /// Streams every change to keys starting with `prefix`.
    ///
    /// Returns once the member has registered the watch, so any write issued
    /// after this resolves is observed.
    pub async fn watch(&self, prefix: impl Into<String>) -> Result<WatchStream> {
        let url = self.url("v1/watch")?;

        // No request timeout: the response body lives as long as the watch.
        let response = self
            .http
            .post(url)
            .json(&WatchRequest {
                prefix: prefix.into(),
            })
            .send()
            .await
            .map_err(Error::from_reqwest)?;
        let response = check_status(response).await?;

        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e));
        let mut lines = FramedRead::new(StreamReader::new(body), LinesCodec::new());

        match tokio::time::timeout(self.request_timeout, lines.next()).await {
            Ok(Some(Ok(line))) => match serde_json::from_str(&line)? {
                WatchMessage::Created => {}
                WatchMessage::Event { .. } => {
                    return Err(Error::Watch("event before watch was created".to_string()));
                }
            },
            Ok(Some(Err(e))) => return Err(Error::Watch(e.to_string())),
            Ok(None) => return Err(Error::Watch("stream ended".to_string())),
            Err(_) => return Err(Error::Timeout),
        }

        let events = lines.filter_map(|line| async move {
            match line {
                Ok(line) => match serde_json::from_str(&line) {
                    Ok(WatchMessage::Event { event }) => Some(Ok(event)),
                    Ok(WatchMessage::Created) => None,
                    Err(e) => Some(Err(Error::Json(e))),
                },
                Err(e) => Some(Err(Error::Watch(e.to_string()))),
            }
        });

        Ok(WatchStream {
            inner: Box::pin(events),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Watch(format!("invalid endpoint: {e}")))
    }

    async fn post<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.url(path)?;
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(Error::from_reqwest)?;

        check_status(response)
            .await?
            .json()
            .await
            .map_err(Error::from_reqwest)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };

    if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
        Err(Error::Unavailable(message))
    } else {
        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Changes observed by [`ClusterClient::watch`].
///
/// Ends when the member shuts down or drops a watcher that fell too far behind.
pub struct WatchStream {
    inner: Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>,
}

impl std::fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream").finish_non_exhaustive()
    }
}

impl Stream for WatchStream {
    type Item = Result<WatchEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
